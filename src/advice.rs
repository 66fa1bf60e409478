//! Advice: single hooks contributed by an aspect.
//!
//! An advice is an action plus two declarations: the context sections it
//! [`uses`](Advice::uses) and the aspects whose advice of the same kind it
//! [`depends_on`](Advice::depends_on). Advice values are built with the
//! constructor functions in this module, one per kind:
//!
//! ```
//! # use aspectron::{ContextError, advice};
//! #
//! let count = advice::before(|view| async move {
//!     view.with_mut("calls", |calls: &mut u32| *calls += 1)?;
//!     Ok::<_, ContextError>(())
//! })
//! .uses(["calls"])
//! .depends_on(["auth"]);
//!
//! assert_eq!(count.sections(), ["calls"]);
//! assert_eq!(count.dependencies(), ["auth"]);
//! ```
use std::{fmt, sync::Arc};

use futures::{FutureExt, future::BoxFuture};
use serde::{Deserialize, Serialize};

use crate::{restricted::SectionView, target::AroundHooks};

/// The five lifecycle positions an advice can occupy.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum AdviceKind {
    Before,
    Around,
    AfterReturning,
    AfterThrowing,
    After,
}

impl AdviceKind {
    /// All kinds in execution order.
    pub const ALL: [AdviceKind; 5] = [
        AdviceKind::Before,
        AdviceKind::Around,
        AdviceKind::AfterReturning,
        AdviceKind::AfterThrowing,
        AdviceKind::After,
    ];

    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            AdviceKind::Before => "before",
            AdviceKind::Around => "around",
            AdviceKind::AfterReturning => "afterReturning",
            AdviceKind::AfterThrowing => "afterThrowing",
            AdviceKind::After => "after",
        }
    }
}

impl fmt::Display for AdviceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

pub(crate) type AdviceFuture<E> = BoxFuture<'static, Result<(), E>>;

pub type SideEffectAction<E> = Arc<dyn Fn(SectionView) -> AdviceFuture<E> + Send + Sync>;
pub type AroundAction<T, E> =
    Arc<dyn Fn(SectionView, AroundHooks<T, E>) -> AdviceFuture<E> + Send + Sync>;
pub type ReturningAction<T, E> = Arc<dyn Fn(SectionView, T) -> AdviceFuture<E> + Send + Sync>;
pub type ThrowingAction<E> = Arc<dyn Fn(SectionView, E) -> AdviceFuture<E> + Send + Sync>;

/// Advice run in the `before` stage.
pub type Before<E> = Advice<SideEffectAction<E>>;
/// Advice run in the `around` stage.
pub type Around<T, E> = Advice<AroundAction<T, E>>;
/// Advice run after the target succeeded.
pub type AfterReturning<T, E> = Advice<ReturningAction<T, E>>;
/// Advice run after the target (or an earlier stage) failed.
pub type AfterThrowing<E> = Advice<ThrowingAction<E>>;
/// Advice run at the end of every attempt.
pub type After<E> = Advice<SideEffectAction<E>>;

/// One hook of an aspect. `A` is the kind-specific action.
pub struct Advice<A> {
    uses: Vec<String>,
    depends_on: Vec<String>,
    pub(crate) action: A,
}

impl<A: Clone> Clone for Advice<A> {
    fn clone(&self) -> Self {
        Self {
            uses: self.uses.clone(),
            depends_on: self.depends_on.clone(),
            action: self.action.clone(),
        }
    }
}

impl<A> fmt::Debug for Advice<A> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Advice")
            .field("uses", &self.uses)
            .field("depends_on", &self.depends_on)
            .finish_non_exhaustive()
    }
}

impl<A> Advice<A> {
    fn new(action: A) -> Self {
        Self {
            uses: Vec::new(),
            depends_on: Vec::new(),
            action,
        }
    }

    /// Declares context sections this advice reads or mutates.
    ///
    /// The action only ever sees these sections; the executor leases them
    /// for the duration of the action.
    pub fn uses<I, S>(mut self, sections: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        for section in sections {
            let section = section.into();
            if !self.uses.contains(&section) {
                self.uses.push(section);
            }
        }
        self
    }

    /// Declares aspects whose advice of the same kind must run first.
    pub fn depends_on<I, S>(mut self, aspects: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        for aspect in aspects {
            let aspect = aspect.into();
            if !self.depends_on.contains(&aspect) {
                self.depends_on.push(aspect);
            }
        }
        self
    }

    #[must_use]
    pub fn sections(&self) -> &[String] {
        &self.uses
    }

    #[must_use]
    pub fn dependencies(&self) -> &[String] {
        &self.depends_on
    }
}

/// Creates a `before` advice.
pub fn before<E, F, Fut>(action: F) -> Before<E>
where
    E: Send + 'static,
    F: Fn(SectionView) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), E>> + Send + 'static,
{
    Advice::new(side_effect(action))
}

/// Creates an `after` advice.
pub fn after<E, F, Fut>(action: F) -> After<E>
where
    E: Send + 'static,
    F: Fn(SectionView) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), E>> + Send + 'static,
{
    Advice::new(side_effect(action))
}

fn side_effect<E, F, Fut>(action: F) -> SideEffectAction<E>
where
    E: Send + 'static,
    F: Fn(SectionView) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), E>> + Send + 'static,
{
    Arc::new(move |view| action(view).boxed())
}

/// Creates an `around` advice.
///
/// The action receives [`AroundHooks`] to wrap the target or to fix the
/// result of the attempt.
pub fn around<T, E, F, Fut>(action: F) -> Around<T, E>
where
    E: Send + 'static,
    F: Fn(SectionView, AroundHooks<T, E>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), E>> + Send + 'static,
{
    let action: AroundAction<T, E> = Arc::new(move |view, hooks| action(view, hooks).boxed());
    Advice::new(action)
}

/// Creates an `afterReturning` advice, called with a clone of the result.
pub fn after_returning<T, E, F, Fut>(action: F) -> AfterReturning<T, E>
where
    E: Send + 'static,
    F: Fn(SectionView, T) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), E>> + Send + 'static,
{
    let action: ReturningAction<T, E> = Arc::new(move |view, value| action(view, value).boxed());
    Advice::new(action)
}

/// Creates an `afterThrowing` advice, called with the dominant error.
///
/// Returning an error from it replaces the error being handled (under the
/// default `halt` policy).
pub fn after_throwing<E, F, Fut>(action: F) -> AfterThrowing<E>
where
    E: Send + 'static,
    F: Fn(SectionView, E) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), E>> + Send + 'static,
{
    let action: ThrowingAction<E> = Arc::new(move |view, error| action(view, error).boxed());
    Advice::new(action)
}
