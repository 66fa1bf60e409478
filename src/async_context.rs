//! Task-scoped context values.
//!
//! An [`AsyncContext`] is created once and executed many times. Every call to
//! [`AsyncContext::execute`] opens a new scope holding one generated value and
//! returns a [`Scope`] future. The value is visible to code running inside the
//! scope (including across `.await` points) and to nothing else: concurrent
//! scopes on the same handle never observe each other's values, and once the
//! scope future completes (or is dropped) its value is gone.
//!
//! The value is installed into a thread-local slot only for the duration of
//! each poll of the scope future and restored right after, so it works on any
//! executor, single or multi threaded. Futures spawned from inside a scope are
//! polled elsewhere and do not inherit the value.
use std::{
    any::Any,
    cell::RefCell,
    collections::HashMap,
    fmt,
    marker::PhantomData,
    pin::Pin,
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
    task::{Context, Poll},
};

use pin_project_lite::pin_project;

use crate::error::ContextError;

static NEXT_HANDLE: AtomicU64 = AtomicU64::new(1);
static NEXT_SCOPE: AtomicU64 = AtomicU64::new(1);

type Value = Arc<dyn Any + Send + Sync>;
type Generator<T> = Arc<dyn Fn() -> T + Send + Sync>;

// One active scope of a handle. `parent` links to the scope of the same
// handle that was active when this one was entered.
struct Frame {
    scope: u64,
    value: Option<Value>,
    parent: Option<Arc<Frame>>,
}

thread_local! {
    static FRAMES: RefCell<HashMap<u64, Arc<Frame>>> = RefCell::new(HashMap::new());
}

// Puts back whatever the handle had before a scope was entered or exited.
// Runs on unwind too, so a panicking poll cannot leak its value.
struct Restore {
    handle: u64,
    previous: Option<Option<Arc<Frame>>>,
}

impl Drop for Restore {
    fn drop(&mut self) {
        let Some(previous) = self.previous.take() else {
            return;
        };
        let handle = self.handle;
        let _ = FRAMES.try_with(move |frames| {
            let mut frames = frames.borrow_mut();
            match previous {
                Some(frame) => {
                    frames.insert(handle, frame);
                }
                None => {
                    frames.remove(&handle);
                }
            }
        });
    }
}

fn enter(handle: u64, scope: u64, value: Option<Value>) -> Restore {
    FRAMES.with(|frames| {
        let mut frames = frames.borrow_mut();
        let previous = frames.remove(&handle);
        let frame = Frame {
            scope,
            value,
            parent: previous.clone(),
        };
        frames.insert(handle, Arc::new(frame));
        Restore {
            handle,
            previous: Some(previous),
        }
    })
}

fn hide(handle: u64) -> Restore {
    let previous = FRAMES.with(|frames| frames.borrow_mut().remove(&handle));
    Restore {
        handle,
        previous: Some(previous),
    }
}

fn active(handle: u64) -> Option<Arc<Frame>> {
    FRAMES.with(|frames| frames.borrow().get(&handle).cloned())
}

fn downcast<T: Send + Sync + 'static>(value: Option<&Value>) -> Result<Arc<T>, ContextError> {
    let value = value.ok_or(ContextError::NoGenerator)?;
    Arc::clone(value)
        .downcast::<T>()
        .map_err(|_| ContextError::OutsideScope)
}

/// A handle to a family of task-scoped values of type `T`.
///
/// Cloning the handle yields another handle to the same family: scopes
/// opened through either clone are visible through both.
pub struct AsyncContext<T> {
    id: u64,
    generator: Option<Generator<T>>,
}

impl<T> Clone for AsyncContext<T> {
    fn clone(&self) -> Self {
        Self {
            id: self.id,
            generator: self.generator.clone(),
        }
    }
}

impl<T> fmt::Debug for AsyncContext<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AsyncContext")
            .field("id", &self.id)
            .field("generator", &self.generator.is_some())
            .finish()
    }
}

impl<T: Send + Sync + 'static> Default for AsyncContext<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Send + Sync + 'static> AsyncContext<T> {
    /// Creates a handle without a generator.
    ///
    /// Scopes opened with [`execute`](Self::execute) will have no value and
    /// their accessors fail with [`ContextError::NoGenerator`]; use
    /// [`execute_with`](Self::execute_with) to supply one per call.
    #[must_use]
    pub fn new() -> Self {
        Self {
            id: NEXT_HANDLE.fetch_add(1, Ordering::Relaxed),
            generator: None,
        }
    }

    /// Creates a handle whose scopes are populated by calling `generator`
    /// once per [`execute`](Self::execute).
    #[must_use]
    pub fn with_generator(generator: impl Fn() -> T + Send + Sync + 'static) -> Self {
        Self {
            id: NEXT_HANDLE.fetch_add(1, Ordering::Relaxed),
            generator: Some(Arc::new(generator)),
        }
    }

    /// Opens a new scope and runs `body` inside it.
    ///
    /// `body` is called immediately with an [`Accessor`] bound to the new
    /// scope; the future it returns is polled inside the scope every time the
    /// returned [`Scope`] is polled.
    ///
    /// # Example
    /// ```
    /// # use aspectron::AsyncContext;
    /// #
    /// # futures::executor::block_on(async {
    /// let requests = AsyncContext::with_generator(|| String::from("request-1"));
    ///
    /// let id = requests
    ///     .execute(|context| async move { context.get().map(|id| id.len()) })
    ///     .await;
    ///
    /// assert_eq!(id, Ok(9));
    /// assert!(requests.context().is_err());
    /// # });
    /// ```
    pub fn execute<F, Fut>(&self, body: F) -> Scope<Fut>
    where
        F: FnOnce(Accessor<T>) -> Fut,
        Fut: Future,
    {
        let value = self.generator.as_ref().map(|generator| {
            let value: Value = Arc::new(generator());
            value
        });
        self.open(value, body)
    }

    /// Same as [`execute`](Self::execute), but the scope's value comes from
    /// `generator` instead of the handle's own generator (if any).
    pub fn execute_with<G, F, Fut>(&self, generator: G, body: F) -> Scope<Fut>
    where
        G: FnOnce() -> T,
        F: FnOnce(Accessor<T>) -> Fut,
        Fut: Future,
    {
        let value: Value = Arc::new(generator());
        self.open(Some(value), body)
    }

    fn open<F, Fut>(&self, value: Option<Value>, body: F) -> Scope<Fut>
    where
        F: FnOnce(Accessor<T>) -> Fut,
        Fut: Future,
    {
        let scope = NEXT_SCOPE.fetch_add(1, Ordering::Relaxed);
        let accessor = Accessor {
            handle: self.id,
            scope,
            _value: PhantomData,
        };
        let future = {
            let _restore = enter(self.id, scope, value.clone());
            body(accessor)
        };
        Scope {
            future,
            handle: self.id,
            scope,
            value,
        }
    }

    /// Runs `callback` with every scope of this handle hidden.
    ///
    /// Inside the callback [`context`](Self::context) and all accessors of
    /// this handle fail with [`ContextError::OutsideScope`]; once it returns
    /// the enclosing scope is visible again. Other handles are unaffected.
    pub fn exit<R>(&self, callback: impl FnOnce() -> R) -> R {
        let _restore = hide(self.id);
        callback()
    }

    /// Polls `future` with every scope of this handle hidden.
    pub fn exit_future<Fut: Future>(&self, future: Fut) -> Exit<Fut> {
        Exit {
            future,
            handle: self.id,
        }
    }

    /// Returns the value of the innermost active scope of this handle.
    ///
    /// # Errors
    ///
    /// - [`ContextError::OutsideScope`] when no scope of this handle is active.
    /// - [`ContextError::NoGenerator`] when the active scope was opened without
    ///   a generator.
    pub fn context(&self) -> Result<Arc<T>, ContextError> {
        let frame = active(self.id).ok_or(ContextError::OutsideScope)?;
        downcast(frame.value.as_ref())
    }

    /// Returns `true` if a scope of this handle is active on the current poll.
    #[must_use]
    pub fn is_active(&self) -> bool {
        active(self.id).is_some()
    }
}

/// Accessor bound to one scope of an [`AsyncContext`].
///
/// It returns its own scope's value while that scope is active (even when an
/// inner scope of the same handle shadows it) and fails everywhere else.
pub struct Accessor<T> {
    handle: u64,
    scope: u64,
    _value: PhantomData<fn() -> T>,
}

impl<T> Clone for Accessor<T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T> Copy for Accessor<T> {}

impl<T> fmt::Debug for Accessor<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Accessor")
            .field("handle", &self.handle)
            .field("scope", &self.scope)
            .finish()
    }
}

impl<T: Send + Sync + 'static> Accessor<T> {
    /// # Errors
    ///
    /// - [`ContextError::OutsideScope`] when the bound scope is not active,
    ///   has settled, or is hidden by [`AsyncContext::exit`].
    /// - [`ContextError::NoGenerator`] when the scope has no value.
    pub fn get(&self) -> Result<Arc<T>, ContextError> {
        let mut frame = active(self.handle);
        while let Some(current) = frame {
            if current.scope == self.scope {
                return downcast(current.value.as_ref());
            }
            frame = current.parent.clone();
        }
        Err(ContextError::OutsideScope)
    }
}

pin_project! {
    /// Future returned by [`AsyncContext::execute`] and
    /// [`AsyncContext::execute_with`].
    #[must_use = "futures do nothing unless polled or .awaited"]
    pub struct Scope<F> {
        #[pin]
        future: F,
        handle: u64,
        scope: u64,
        value: Option<Value>,
    }
}

impl<F: Future> Future for Scope<F> {
    type Output = F::Output;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.project();
        let _restore = enter(*this.handle, *this.scope, this.value.clone());
        this.future.poll(cx)
    }
}

pin_project! {
    /// Future returned by [`AsyncContext::exit_future`].
    #[must_use = "futures do nothing unless polled or .awaited"]
    pub struct Exit<F> {
        #[pin]
        future: F,
        handle: u64,
    }
}

impl<F: Future> Future for Exit<F> {
    type Output = F::Output;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.project();
        let _restore = hide(*this.handle);
        this.future.poll(cx)
    }
}
