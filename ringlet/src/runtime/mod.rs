//! The per-thread context: spawning, driving and shutting down tasks.

mod builder;
pub use builder::{Builder, CpuAffinity};
pub(crate) use builder::RuntimeConfig;

mod context;
pub use context::{Context, Handle};

mod errors;
pub use errors::RuntimeError;

mod worker;
pub use worker::{join_worker, spawn_worker};
