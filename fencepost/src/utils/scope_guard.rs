use std::marker::PhantomData;

/// A guard that executes a closure when it goes out of scope, whether by a
/// normal return, an early return, or a panic.
pub(crate) struct ScopeGuard<'a, F: FnOnce()> {
    // Taken out on drop, `FnOnce` has to be moved to be called.
    closure: Option<F>,

    _p: PhantomData<&'a ()>,
}

impl<'a, F: FnOnce()> ScopeGuard<'a, F> {
    /// Creates a `ScopeGuard` running `closure` on drop.
    ///
    /// ```ignore
    /// let mut fenced = false;
    /// {
    ///     let _guard = ScopeGuard::new(|| fenced = true);
    ///     drain_queue()?;
    /// } // fence raised here, even if `drain_queue` bailed out.
    /// ```
    pub(crate) fn new(closure: F) -> Self {
        ScopeGuard {
            closure: Some(closure),
            _p: PhantomData,
        }
    }
}

impl<'a, F: FnOnce()> Drop for ScopeGuard<'a, F> {
    fn drop(&mut self) {
        if let Some(closure) = self.closure.take() {
            closure();
        }
    }
}
