pub(crate) mod scope_guard;
pub(crate) use scope_guard::ScopeGuard;

pub(crate) mod sys;

pub(crate) mod thread;
