//! Runs one invocation of a [`Process`].
//!
//! Every attempt walks the same fixed stages:
//!
//! 1. `before`
//! 2. `around`, always sequential, building the wrapped target
//! 3. the wrapped target, once (skipped when around advice attached a result)
//! 4. `afterReturning` on success or `afterThrowing` on failure, never both
//! 5. `after`, always
//!
//! A stage that rejects under a `halt` policy skips everything up to
//! `afterThrowing`; under `continue` its rejections are carried along. Once
//! `after` has run, a halted attempt goes to the process's halt resolution
//! and a successful attempt with carried rejections goes to continuous
//! resolution.
//!
//! Each attempt runs inside a scope of a crate-wide [`AsyncContext`] holding
//! the invocation's [`RestrictedContext`], reachable from the target through
//! [`current_context`].
use std::{
    fmt,
    sync::{
        Arc, LazyLock,
        atomic::{AtomicU32, Ordering},
    },
};

use futures::{FutureExt, future::BoxFuture};
use tracing::{debug, warn};

use crate::{
    advice::{AdviceFuture, AdviceKind},
    async_context::AsyncContext,
    error::ContextError,
    policy::Aggregation,
    process::{Failure, Link, Process, Value},
    rejection::Rejections,
    restricted::{RestrictedContext, SectionView},
    stage::Stage,
    target::{AroundHooks, Target},
};

static CURRENT: LazyLock<AsyncContext<RestrictedContext>> = LazyLock::new(AsyncContext::new);

/// Returns the context of the invocation the caller is running in.
///
/// Target code (and anything it awaits) can use this to reach the sections
/// of the invocation that is executing it. Nested invocations shadow outer
/// ones until they complete.
///
/// # Errors
///
/// [`ContextError::OutsideScope`] when called outside of any invocation, or
/// inside [`exit_invocation`].
pub fn current_context() -> Result<RestrictedContext, ContextError> {
    CURRENT.context().map(|context| RestrictedContext::clone(&context))
}

/// Runs `callback` with the current invocation's context hidden.
pub fn exit_invocation<R>(callback: impl FnOnce() -> R) -> R {
    CURRENT.exit(callback)
}

/// A halted attempt, handed to the process's `handle_error` hook.
pub struct Halt<T, E> {
    error: E,
    target: Target<T, E>,
    attempt: u32,
    invocation: Arc<Invocation<T, E>>,
}

impl<T, E: fmt::Debug> fmt::Debug for Halt<T, E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Halt")
            .field("error", &self.error)
            .field("attempt", &self.attempt)
            .finish_non_exhaustive()
    }
}

impl<T: Value, E: Failure> Halt<T, E> {
    /// The dominant error of the attempt.
    #[must_use]
    pub fn error(&self) -> &E {
        &self.error
    }

    pub fn into_error(self) -> E {
        self.error
    }

    /// The target as wrapped by the attempt's around advice.
    #[must_use]
    pub fn target(&self) -> &Target<T, E> {
        &self.target
    }

    /// 1-based number of the attempt that halted.
    #[must_use]
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    /// The invocation's context, shared by all of its attempts.
    #[must_use]
    pub fn context(&self) -> &RestrictedContext {
        &self.invocation.context
    }

    /// Re-runs the whole advice chain as a new attempt of the same
    /// invocation, with the original (unwrapped) target.
    pub fn retry(self) -> BoxFuture<'static, Result<T, E>> {
        self.invocation.attempt()
    }
}

pub(crate) struct Invocation<T, E> {
    process: Process<T, E>,
    context: RestrictedContext,
    target: Target<T, E>,
    attempts: AtomicU32,
}

impl<T: Value, E: Failure> Invocation<T, E> {
    pub(crate) fn new(process: Process<T, E>, context: RestrictedContext, target: Target<T, E>) -> Arc<Self> {
        Arc::new(Self {
            process,
            context,
            target,
            attempts: AtomicU32::new(0),
        })
    }

    pub(crate) fn attempt(self: Arc<Self>) -> BoxFuture<'static, Result<T, E>> {
        let number = self.attempts.fetch_add(1, Ordering::Relaxed) + 1;
        let context = self.context.clone();
        CURRENT
            .execute_with(move || context, move |_| self.drive(number))
            .boxed()
    }

    async fn drive(self: Arc<Self>, attempt: u32) -> Result<T, E> {
        debug!(attempt, "attempt started");
        let mut carried: Option<Rejections<E>> = None;

        let mut halted = match self.before().await {
            Ok(()) => None,
            Err(rejections) => self.route(AdviceKind::Before, rejections, &mut carried),
        };

        let hooks = AroundHooks::new(self.target.clone());
        if halted.is_none() {
            if let Err(rejections) = self.around(&hooks).await {
                halted = self.route(AdviceKind::Around, rejections, &mut carried);
            }
        }
        let (target, replacement) = hooks.into_parts();

        let settled = match (halted, replacement) {
            (Some(rejections), _) => Err(self.dominant(rejections, &mut carried)),
            (None, Some(value)) => {
                debug!(attempt, "result attached by around advice, target skipped");
                Ok(value)
            }
            (None, None) => match target.call().await {
                Ok(value) => Ok(value),
                Err(error) => Err(self.dominant(Rejections::new(error), &mut carried)),
            },
        };

        let mut settled = match settled {
            Ok(value) => match self.after_returning(value.clone()).await {
                Ok(()) => Ok(value),
                Err(rejections) => match self.route(AdviceKind::AfterReturning, rejections, &mut carried) {
                    Some(rejections) => Err(self.dominant(rejections, &mut carried)),
                    None => Ok(value),
                },
            },
            Err(error) => match self.after_throwing(error.clone()).await {
                Ok(()) => Err(error),
                Err(rejections) => match self.route(AdviceKind::AfterThrowing, rejections, &mut carried) {
                    Some(rejections) => Err(self.dominant(rejections, &mut carried)),
                    None => Err(error),
                },
            },
        };

        if let Err(rejections) = self.after().await {
            if let Some(rejections) = self.route(AdviceKind::After, rejections, &mut carried) {
                settled = match settled {
                    Ok(_) => Err(self.dominant(rejections, &mut carried)),
                    Err(error) => {
                        let mut all = Rejections::new(error);
                        all.extend(rejections);
                        Err(self.dominant(all, &mut carried))
                    }
                };
            }
        }

        match settled {
            Ok(value) => match carried {
                None => Ok(value),
                Some(rejections) => {
                    debug!(attempt, rejections = rejections.len(), "resolving carried rejections");
                    self.process.resolve_continuous_rejection(rejections, value)
                }
            },
            Err(error) => {
                // Rejections carried after the halt was determined still count.
                let error = match carried.take() {
                    Some(later) => {
                        let mut all = Rejections::new(error);
                        all.extend(later);
                        self.process.determine_error(all)
                    }
                    None => error,
                };
                warn!(attempt, "attempt halted");
                let halt = Halt {
                    error,
                    target,
                    attempt,
                    invocation: Arc::clone(&self),
                };
                self.process.resolve_halt_rejection(halt).await
            }
        }
    }

    // Returns the rejections if the stage halts, carries them otherwise.
    fn route(
        &self,
        kind: AdviceKind,
        rejections: Rejections<E>,
        carried: &mut Option<Rejections<E>>,
    ) -> Option<Rejections<E>> {
        if self.process.policies().get(kind).halts() {
            debug!(kind = %kind, rejections = rejections.len(), "stage halted");
            return Some(rejections);
        }
        debug!(kind = %kind, rejections = rejections.len(), "stage rejected, continuing");
        match carried {
            Some(existing) => existing.extend(rejections),
            None => *carried = Some(rejections),
        }
        None
    }

    // Reduces carried plus new rejections to one error; carried ones are
    // consumed.
    fn dominant(&self, rejections: Rejections<E>, carried: &mut Option<Rejections<E>>) -> E {
        let all = match carried.take() {
            Some(mut earlier) => {
                earlier.extend(rejections);
                earlier
            }
            None => rejections,
        };
        self.process.determine_error(all)
    }

    // Leases the advice's sections for the duration of its action.
    fn guarded<F>(&self, sections: &[String], action: F) -> AdviceFuture<E>
    where
        F: FnOnce(SectionView) -> AdviceFuture<E> + Send + 'static,
    {
        let context = self.context.clone();
        let sections = sections.to_vec();
        async move {
            match context.use_sections(sections, action).await {
                Ok(result) => result,
                Err(error) => Err(E::from(error)),
            }
        }
        .boxed()
    }

    fn stage<A>(
        &self,
        kind: AdviceKind,
        links: &[Link<A>],
        action: impl Fn(&A) -> Box<dyn FnOnce(SectionView) -> AdviceFuture<E> + Send>,
    ) -> Stage<E> {
        let mut stage = Stage::new(kind, *self.process.policies().get(kind));
        for link in links {
            let run = action(&link.advice.action);
            stage.push(
                Arc::clone(&link.aspect),
                link.after.clone(),
                self.guarded(link.advice.sections(), run),
            );
        }
        stage
    }

    async fn before(&self) -> Result<(), Rejections<E>> {
        let links = &self.process.chains().before;
        self.stage(AdviceKind::Before, links, |action| {
            let action = Arc::clone(action);
            Box::new(move |view| action(view))
        })
        .await
    }

    async fn around(&self, hooks: &AroundHooks<T, E>) -> Result<(), Rejections<E>> {
        let policy = self.process.policies().get(AdviceKind::Around);
        let mut rejections: Option<Rejections<E>> = None;
        for link in &self.process.chains().around {
            if hooks.has_result() {
                debug!(aspect = %link.aspect, "around advice skipped, result already attached");
                break;
            }
            let action = Arc::clone(&link.advice.action);
            let hooks = hooks.clone();
            let result = self
                .guarded(link.advice.sections(), move |view| action(view, hooks))
                .await;
            if let Err(error) = result {
                match rejections.as_mut() {
                    Some(rejections) => rejections.push(error),
                    None => rejections = Some(Rejections::new(error)),
                }
                if policy.error.aggregation == Aggregation::Unit {
                    break;
                }
            }
        }
        rejections.map_or(Ok(()), Err)
    }

    async fn after_returning(&self, value: T) -> Result<(), Rejections<E>> {
        let links = &self.process.chains().after_returning;
        self.stage(AdviceKind::AfterReturning, links, |action| {
            let action = Arc::clone(action);
            let value = value.clone();
            Box::new(move |view| action(view, value))
        })
        .await
    }

    async fn after_throwing(&self, error: E) -> Result<(), Rejections<E>> {
        let links = &self.process.chains().after_throwing;
        self.stage(AdviceKind::AfterThrowing, links, |action| {
            let action = Arc::clone(action);
            let error = error.clone();
            Box::new(move |view| action(view, error))
        })
        .await
    }

    async fn after(&self) -> Result<(), Rejections<E>> {
        let links = &self.process.chains().after;
        self.stage(AdviceKind::After, links, |action| {
            let action = Arc::clone(action);
            Box::new(move |view| action(view))
        })
        .await
    }
}
