use crate::task::Id;
use std::any::Any;

/// Why a task did not produce its output.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum JoinError {
    #[error("task {0} was cancelled")]
    Cancelled(Id),

    #[error("task {id} panicked: {message}")]
    Panic { id: Id, message: String },
}

impl JoinError {
    pub(crate) fn panic(id: Id, payload: Box<dyn Any + Send>) -> Self {
        let message = if let Some(s) = payload.downcast_ref::<&'static str>() {
            (*s).to_string()
        } else if let Some(s) = payload.downcast_ref::<String>() {
            s.clone()
        } else {
            "Box<dyn Any>".to_string()
        };

        JoinError::Panic { id, message }
    }

    pub fn id(&self) -> Id {
        match self {
            JoinError::Cancelled(id) | JoinError::Panic { id, .. } => *id,
        }
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, JoinError::Cancelled(_))
    }

    pub fn is_panic(&self) -> bool {
        matches!(self, JoinError::Panic { .. })
    }
}

/// Re-entrancy guard: a task in a terminal state is never resumed again.
#[derive(thiserror::Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResumeError {
    #[error("task {0} resumed after reaching a terminal state")]
    AlreadyDone(Id),
}
