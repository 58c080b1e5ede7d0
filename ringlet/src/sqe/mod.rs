//! Request and completion records, plus the marker combinator used to
//! compose request flags.

mod completion;
pub use completion::{Completion, CompletionFlags};

mod errors;
pub use errors::{IoError, OpcodeError};

mod marker;
pub use marker::Marker;

pub(crate) mod parse;

mod request;
pub use request::{CancelTarget, Request, RequestFlags, Target};
