use crate::sqe::{Request, RequestFlags, Target};
use std::fmt;
use std::ops::{BitOr, BitOrAssign};

type Action = Box<dyn FnOnce(&mut Request)>;

/// A partially-built request: side flags plus at most one action.
///
/// Combining a [`Request`] with a marker unions the flags and runs the
/// action immediately, once, at combination time. Combining two markers
/// unions their flags, and the right-hand action replaces the left-hand one.
///
/// ```ignore
/// let req = Request::close(fd) | Marker::direct();
/// assert_eq!(req.target(), Target::Fixed(fd as u32));
/// ```
#[derive(Default)]
pub struct Marker {
    flags: RequestFlags,
    action: Option<Action>,
}

impl Marker {
    pub fn new(flags: RequestFlags) -> Self {
        Self {
            flags,
            action: None,
        }
    }

    /// Treats the request's descriptor as an index into the direct
    /// descriptor table.
    pub fn direct() -> Self {
        Self::new(RequestFlags::FIXED_FILE).with_action(|req| {
            if let Target::Fd(fd) = req.target()
                && let Ok(idx) = u32::try_from(fd)
            {
                req.set_target(Target::Fixed(idx));
            }
        })
    }

    pub fn priority(priority: u16) -> Self {
        Self::default().with_action(move |req| req.set_priority(priority))
    }

    /// Attaches `action`, replacing any action already attached.
    pub fn with_action<F>(mut self, action: F) -> Self
    where
        F: FnOnce(&mut Request) + 'static,
    {
        self.action = Some(Box::new(action));
        self
    }

    pub fn flags(&self) -> RequestFlags {
        self.flags
    }

    pub fn has_action(&self) -> bool {
        self.action.is_some()
    }
}

impl fmt::Debug for Marker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Marker")
            .field("flags", &self.flags)
            .field("has_action", &self.has_action())
            .finish()
    }
}

impl From<RequestFlags> for Marker {
    fn from(flags: RequestFlags) -> Self {
        Marker::new(flags)
    }
}

impl BitOr for Marker {
    type Output = Marker;

    fn bitor(self, rhs: Marker) -> Marker {
        Marker {
            flags: self.flags | rhs.flags,
            action: rhs.action.or(self.action),
        }
    }
}

impl BitOr<Marker> for Request {
    type Output = Request;

    fn bitor(mut self, rhs: Marker) -> Request {
        self |= rhs;
        self
    }
}

impl BitOrAssign<Marker> for Request {
    fn bitor_assign(&mut self, rhs: Marker) {
        self.insert_flags(rhs.flags);
        if let Some(action) = rhs.action {
            action(self);
        }
    }
}
