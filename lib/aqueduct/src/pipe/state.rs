//! User state attached to a pipe resource. A pushed state may be observed
//! by both a future reader and an in-flight task, so the value is shared by
//! reference count and the dispose hook runs only when the last reference
//! is gone.

use std::any::Any;
use std::sync::Arc;

/// A reference-counted pushed state. Cloning shares the value; the dispose
/// hook attached at construction runs exactly once, when the final clone
/// drops.
#[derive(Clone)]
pub struct PushedState {
    inner: Arc<StateInner>,
}

struct StateInner {
    value: Box<dyn Any + Send + Sync>,
    dispose: Option<Box<dyn FnMut() + Send + Sync>>,
}

impl Drop for StateInner {
    fn drop(&mut self) {
        if let Some(mut dispose) = self.dispose.take() {
            dispose();
        }
    }
}

impl PushedState {
    #[inline]
    pub fn new<T: Any + Send + Sync>(value: T) -> PushedState {
        PushedState {
            inner: Arc::new(StateInner {
                value: Box::new(value),
                dispose: None,
            }),
        }
    }

    /// Attaches a dispose hook that runs when the last reference drops.
    #[inline]
    pub fn with_dispose<T, F>(value: T, dispose: F) -> PushedState
    where
        T: Any + Send + Sync,
        F: FnMut() + Send + Sync + 'static,
    {
        PushedState {
            inner: Arc::new(StateInner {
                value: Box::new(value),
                dispose: Some(Box::new(dispose)),
            }),
        }
    }

    #[inline]
    pub fn downcast_ref<T: Any>(&self) -> Option<&T> {
        self.inner.value.downcast_ref::<T>()
    }

    /// The number of live references to this state.
    #[inline]
    pub fn ref_count(&self) -> usize {
        Arc::strong_count(&self.inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_downcast() {
        let state = PushedState::new(42u32);

        assert_eq!(state.downcast_ref::<u32>(), Some(&42));
        assert_eq!(state.downcast_ref::<u64>(), None);
    }

    #[test]
    fn test_dispose_runs_once_on_last_drop() {
        let disposed = Arc::new(AtomicUsize::new(0));
        let counter = disposed.clone();

        let state = PushedState::with_dispose(7u8, move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        let clone = state.clone();

        drop(state);
        assert_eq!(disposed.load(Ordering::SeqCst), 0);

        drop(clone);
        assert_eq!(disposed.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_ref_count() {
        let state = PushedState::new(0u8);
        assert_eq!(state.ref_count(), 1);

        let clone = state.clone();
        assert_eq!(state.ref_count(), 2);

        drop(clone);
        assert_eq!(state.ref_count(), 1);
    }
}
