/// Runs a closure when dropped, unless disarmed first.
///
/// Used to roll back partially-applied state on early returns, e.g. releasing
/// the per-thread context marker when kernel queue construction fails.
pub(crate) struct ScopeGuard<F: FnOnce()> {
    closure: Option<F>,
}

impl<F: FnOnce()> ScopeGuard<F> {
    pub(crate) fn new(closure: F) -> Self {
        ScopeGuard {
            closure: Some(closure),
        }
    }

    /// Prevents the closure from running on drop.
    pub(crate) fn disarm(&mut self) {
        self.closure.take();
    }
}

impl<F: FnOnce()> Drop for ScopeGuard<F> {
    fn drop(&mut self) {
        if let Some(closure) = self.closure.take() {
            closure();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;

    #[test]
    fn test_runs_on_drop() {
        let ran = Cell::new(false);
        {
            let _guard = ScopeGuard::new(|| ran.set(true));
            assert!(!ran.get());
        }
        assert!(ran.get());
    }

    #[test]
    fn test_disarm() {
        let ran = Cell::new(false);
        {
            let mut guard = ScopeGuard::new(|| ran.set(true));
            guard.disarm();
        }
        assert!(!ran.get());
    }
}
