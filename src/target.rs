//! The operation being enhanced, and the capabilities around advice has
//! over it.
use std::{fmt, sync::Arc};

use futures::{FutureExt, future::BoxFuture};
use parking_lot::Mutex;

type TargetFn<T, E> = dyn Fn() -> BoxFuture<'static, Result<T, E>> + Send + Sync;

/// A re-invocable asynchronous operation.
///
/// Every [`call`](Target::call) starts a fresh execution; this is what lets
/// around advice wrap it and halt resolution re-run it.
pub struct Target<T, E> {
    call: Arc<TargetFn<T, E>>,
}

impl<T, E> Clone for Target<T, E> {
    fn clone(&self) -> Self {
        Self {
            call: Arc::clone(&self.call),
        }
    }
}

impl<T, E> fmt::Debug for Target<T, E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Target").finish_non_exhaustive()
    }
}

impl<T, E> Target<T, E>
where
    T: Send + 'static,
    E: Send + 'static,
{
    /// Wraps a closure producing the operation's future.
    ///
    /// # Example
    /// ```
    /// # use aspectron::Target;
    /// #
    /// # futures::executor::block_on(async {
    /// let target: Target<u32, String> = Target::new(|| async { Ok(42) });
    ///
    /// assert_eq!(target.call().await, Ok(42));
    /// assert_eq!(target.call().await, Ok(42));
    /// # });
    /// ```
    pub fn new<F, Fut>(operation: F) -> Self
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<T, E>> + Send + 'static,
    {
        Self {
            call: Arc::new(move || operation().boxed()),
        }
    }

    /// Starts one execution of the operation.
    pub fn call(&self) -> BoxFuture<'static, Result<T, E>> {
        (self.call)()
    }
}

struct AroundState<T, E> {
    target: Target<T, E>,
    result: Option<T>,
}

/// Capabilities handed to every around advice of one attempt.
///
/// Wrappers attached with [`attach_to_target`](Self::attach_to_target)
/// compose in chain order: each wrapper receives the target produced by the
/// previous one. Once a result is attached with
/// [`attach_to_result`](Self::attach_to_result) the remaining around advice
/// and the target itself are skipped for this attempt.
pub struct AroundHooks<T, E> {
    state: Arc<Mutex<AroundState<T, E>>>,
}

impl<T, E> Clone for AroundHooks<T, E> {
    fn clone(&self) -> Self {
        Self {
            state: Arc::clone(&self.state),
        }
    }
}

impl<T, E> fmt::Debug for AroundHooks<T, E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AroundHooks")
            .field("has_result", &self.state.lock().result.is_some())
            .finish()
    }
}

impl<T, E> AroundHooks<T, E> {
    pub(crate) fn new(target: Target<T, E>) -> Self {
        Self {
            state: Arc::new(Mutex::new(AroundState {
                target,
                result: None,
            })),
        }
    }

    /// Replaces the current target with `wrapper(current)`.
    pub fn attach_to_target(&self, wrapper: impl FnOnce(Target<T, E>) -> Target<T, E>) {
        let current = self.target();
        // The wrapper is user code; keep the lock out of it.
        let wrapped = wrapper(current);
        self.state.lock().target = wrapped;
    }

    /// Fixes the attempt's result, short-circuiting the target.
    pub fn attach_to_result(&self, value: T) {
        self.state.lock().result = Some(value);
    }

    /// The target as wrapped so far.
    #[must_use]
    pub fn target(&self) -> Target<T, E> {
        self.state.lock().target.clone()
    }

    #[must_use]
    pub fn has_result(&self) -> bool {
        self.state.lock().result.is_some()
    }

    pub(crate) fn into_parts(self) -> (Target<T, E>, Option<T>) {
        let mut state = self.state.lock();
        (state.target.clone(), state.result.take())
    }
}
