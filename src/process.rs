//! Composes aspects into ordered advice chains.
//!
//! A [`Process`] is built once from a set of [`Aspect`]s and then run many
//! times. Building merges the advice of each kind into one chain, ordered so
//! that every `depends_on` edge is respected (Kahn's algorithm, ties broken
//! by the order in which aspects were added), attaches the per-kind
//! [`Policies`] and the error resolution hooks.
use std::{
    collections::{BTreeSet, HashMap, HashSet},
    fmt,
    sync::Arc,
};

use futures::{FutureExt, future::BoxFuture};
use tracing::debug;

use crate::{
    advice::{
        Advice, AdviceKind, AroundAction, ReturningAction, SideEffectAction, ThrowingAction,
    },
    aspect::Aspect,
    error::{BuildError, ContextError},
    executor::{Halt, Invocation},
    policy::{AfterThrow, Aggregation, Execution, KindPolicy, Policies},
    rejection::Rejections,
    restricted::{RestrictedContext, Sections},
    target::Target,
};

/// Values a process can return.
pub trait Value: Clone + Send + Sync + 'static {}

impl<T: Clone + Send + Sync + 'static> Value for T {}

/// Errors a process can fail with.
///
/// Section access errors raised while leasing an advice's sections become
/// that advice's rejection, hence the `From<ContextError>` requirement.
pub trait Failure: Clone + Send + Sync + From<ContextError> + 'static {}

impl<E: Clone + Send + Sync + From<ContextError> + 'static> Failure for E {}

type DetermineError<E> = Arc<dyn Fn(Rejections<E>) -> E + Send + Sync>;
type HandleError<T, E> = Arc<dyn Fn(Halt<T, E>) -> BoxFuture<'static, Result<T, E>> + Send + Sync>;
type ResolveContinuous<T, E> = Arc<dyn Fn(Rejections<E>, T) -> Result<T, E> + Send + Sync>;

pub(crate) struct Link<A> {
    pub(crate) aspect: Arc<str>,
    pub(crate) advice: Advice<A>,
    pub(crate) after: Vec<usize>,
}

pub(crate) struct Chains<T, E> {
    pub(crate) before: Vec<Link<SideEffectAction<E>>>,
    pub(crate) around: Vec<Link<AroundAction<T, E>>>,
    pub(crate) after_returning: Vec<Link<ReturningAction<T, E>>>,
    pub(crate) after_throwing: Vec<Link<ThrowingAction<E>>>,
    pub(crate) after: Vec<Link<SideEffectAction<E>>>,
}

struct Inner<T, E> {
    aspects: Vec<String>,
    chains: Chains<T, E>,
    policies: Policies,
    determine_error: DetermineError<E>,
    handle_error: Option<HandleError<T, E>>,
    resolve_continuous: Option<ResolveContinuous<T, E>>,
}

/// A composed set of aspects, ready to enhance targets.
///
/// Cloning is cheap; clones share the composed chains.
pub struct Process<T, E> {
    inner: Arc<Inner<T, E>>,
}

impl<T, E> Clone for Process<T, E> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T, E> fmt::Debug for Process<T, E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Process")
            .field("aspects", &self.inner.aspects)
            .field("policies", &self.inner.policies)
            .finish_non_exhaustive()
    }
}

impl<T: Value, E: Failure> Process<T, E> {
    #[must_use]
    pub fn builder() -> ProcessBuilder<T, E> {
        ProcessBuilder::new()
    }

    /// Aspect names in the order they were added.
    #[must_use]
    pub fn aspects(&self) -> &[String] {
        &self.inner.aspects
    }

    #[must_use]
    pub fn policies(&self) -> &Policies {
        &self.inner.policies
    }

    /// Aspect names of the resolved chain for `kind`, in execution order.
    #[must_use]
    pub fn order(&self, kind: AdviceKind) -> Vec<&str> {
        fn names<A>(links: &[Link<A>]) -> Vec<&str> {
            links.iter().map(|link| &*link.aspect).collect()
        }
        let chains = &self.inner.chains;
        match kind {
            AdviceKind::Before => names(&chains.before),
            AdviceKind::Around => names(&chains.around),
            AdviceKind::AfterReturning => names(&chains.after_returning),
            AdviceKind::AfterThrowing => names(&chains.after_throwing),
            AdviceKind::After => names(&chains.after),
        }
    }

    /// Runs `target` through the advice chain with a fresh context built by
    /// `context`.
    ///
    /// The context is shared by every attempt of this invocation (including
    /// attempts started by [`Halt::retry`]) and dropped when it returns.
    ///
    /// # Errors
    ///
    /// The error chosen by `determine_error` (or returned by the resolution
    /// hooks) when the invocation is not recovered.
    pub async fn run<C>(&self, context: C, target: Target<T, E>) -> Result<T, E>
    where
        C: FnOnce() -> Sections,
    {
        self.run_in(RestrictedContext::new(context()), target).await
    }

    /// Runs `target` through the advice chain with an existing context.
    ///
    /// # Errors
    ///
    /// See [`Process::run`].
    pub async fn run_in(&self, context: RestrictedContext, target: Target<T, E>) -> Result<T, E> {
        Invocation::new(self.clone(), context, target).attempt().await
    }

    pub(crate) fn chains(&self) -> &Chains<T, E> {
        &self.inner.chains
    }

    pub(crate) fn determine_error(&self, rejections: Rejections<E>) -> E {
        (self.inner.determine_error)(rejections)
    }

    /// Produces the fallback for a halted attempt.
    pub(crate) fn resolve_halt_rejection(&self, halt: Halt<T, E>) -> BoxFuture<'static, Result<T, E>> {
        match &self.inner.handle_error {
            Some(handle_error) => handle_error(halt),
            None => futures::future::ready(Err(halt.into_error())).boxed(),
        }
    }

    /// Decides what a successful attempt with carried rejections returns.
    pub(crate) fn resolve_continuous_rejection(&self, rejections: Rejections<E>, value: T) -> Result<T, E> {
        match &self.inner.resolve_continuous {
            Some(resolve) => resolve(rejections, value),
            None => Err(self.determine_error(rejections)),
        }
    }
}

/// Builder for [`Process`].
///
/// # Example
/// ```
/// # use aspectron::{AdviceKind, Aspect, ContextError, Process, Sections, Target, advice};
/// #
/// # futures::executor::block_on(async {
/// let process = Process::<u32, ContextError>::builder()
///     .aspect(Aspect::new("auth").before(advice::before(|_| async { Ok(()) })))
///     .aspect(
///         Aspect::new("metrics")
///             .before(advice::before(|_| async { Ok(()) }).depends_on(["auth"])),
///     )
///     .build()
///     .unwrap();
///
/// assert_eq!(process.order(AdviceKind::Before), ["auth", "metrics"]);
///
/// let value = process
///     .run(Sections::new, Target::new(|| async { Ok(7) }))
///     .await;
/// assert_eq!(value, Ok(7));
/// # });
/// ```
pub struct ProcessBuilder<T, E> {
    aspects: Vec<Aspect<T, E>>,
    policies: Policies,
    determine_error: Option<DetermineError<E>>,
    handle_error: Option<HandleError<T, E>>,
    resolve_continuous: Option<ResolveContinuous<T, E>>,
}

impl<T: Value, E: Failure> Default for ProcessBuilder<T, E> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Value, E: Failure> ProcessBuilder<T, E> {
    #[must_use]
    pub fn new() -> Self {
        Self {
            aspects: Vec::new(),
            policies: Policies::default(),
            determine_error: None,
            handle_error: None,
            resolve_continuous: None,
        }
    }

    pub fn aspect(mut self, aspect: Aspect<T, E>) -> Self {
        self.aspects.push(aspect);
        self
    }

    pub fn aspects(mut self, aspects: impl IntoIterator<Item = Aspect<T, E>>) -> Self {
        self.aspects.extend(aspects);
        self
    }

    /// Replaces all five policies, e.g. with ones loaded from configuration.
    pub fn policies(mut self, policies: Policies) -> Self {
        self.policies = policies;
        self
    }

    pub fn policy(mut self, kind: AdviceKind, policy: KindPolicy) -> Self {
        *self.policies.get_mut(kind) = policy;
        self
    }

    /// Sets how the advice of `kind` are scheduled.
    ///
    /// [`AdviceKind::Around`] ignores this: around advice always run
    /// sequentially so their wrappers compose in chain order.
    pub fn execution(mut self, kind: AdviceKind, execution: Execution) -> Self {
        self.policies.get_mut(kind).execution = execution;
        self
    }

    pub fn aggregation(mut self, kind: AdviceKind, aggregation: Aggregation) -> Self {
        self.policies.get_mut(kind).error.aggregation = aggregation;
        self
    }

    pub fn after_throw(mut self, kind: AdviceKind, after_throw: AfterThrow) -> Self {
        self.policies.get_mut(kind).error.runtime.after_throw = after_throw;
        self
    }

    /// Picks the dominant error out of an aggregated set.
    ///
    /// Defaults to the first rejection. For errors implementing
    /// [`Prioritized`](crate::Prioritized), pass
    /// `Rejections::into_dominant`.
    pub fn determine_error(mut self, determine: impl Fn(Rejections<E>) -> E + Send + Sync + 'static) -> Self {
        let determine: DetermineError<E> = Arc::new(determine);
        self.determine_error = Some(determine);
        self
    }

    /// Decides how a halted attempt ends: recover with a value, re-run the
    /// chain with [`Halt::retry`], or fail.
    ///
    /// Without this hook a halted attempt fails with its dominant error.
    pub fn handle_error<F, Fut>(mut self, handle: F) -> Self
    where
        F: Fn(Halt<T, E>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<T, E>> + Send + 'static,
    {
        let handle: HandleError<T, E> = Arc::new(move |halt| handle(halt).boxed());
        self.handle_error = Some(handle);
        self
    }

    /// Decides what a successful attempt returns when rejections were carried
    /// forward by `continue` stages.
    ///
    /// Without this hook the dominant carried rejection is returned as the
    /// error.
    pub fn resolve_continuous(
        mut self,
        resolve: impl Fn(Rejections<E>, T) -> Result<T, E> + Send + Sync + 'static,
    ) -> Self {
        let resolve: ResolveContinuous<T, E> = Arc::new(resolve);
        self.resolve_continuous = Some(resolve);
        self
    }

    /// Validates the aspects and composes the five chains.
    ///
    /// # Errors
    ///
    /// - [`BuildError::DuplicateAspect`] when two aspects share a name.
    /// - [`BuildError::UnknownDependency`] when an advice depends on an aspect
    ///   that is not part of the process.
    /// - [`BuildError::DependencyCycle`] when the dependencies of one kind are
    ///   cyclic.
    pub fn build(self) -> Result<Process<T, E>, BuildError> {
        let mut known = HashSet::with_capacity(self.aspects.len());
        for aspect in &self.aspects {
            if !known.insert(aspect.name()) {
                return Err(BuildError::DuplicateAspect(aspect.name().to_string()));
            }
        }

        let aspects = &self.aspects;
        let chains = Chains {
            before: compose(AdviceKind::Before, aspects, |a| a.before.as_ref())?,
            around: compose(AdviceKind::Around, aspects, |a| a.around.as_ref())?,
            after_returning: compose(AdviceKind::AfterReturning, aspects, |a| {
                a.after_returning.as_ref()
            })?,
            after_throwing: compose(AdviceKind::AfterThrowing, aspects, |a| {
                a.after_throwing.as_ref()
            })?,
            after: compose(AdviceKind::After, aspects, |a| a.after.as_ref())?,
        };

        let names: Vec<String> = aspects.iter().map(|a| a.name().to_string()).collect();
        if self.policies.around.execution != Execution::Sequential {
            debug!(
                execution = ?self.policies.around.execution,
                "around advice ignore their execution setting and run sequentially"
            );
        }
        debug!(aspects = ?names, policies = ?self.policies, "process built");

        let determine_error = self.determine_error.unwrap_or_else(|| {
            let first: DetermineError<E> = Arc::new(|rejections: Rejections<E>| rejections.into_first());
            first
        });
        Ok(Process {
            inner: Arc::new(Inner {
                aspects: names,
                chains,
                policies: self.policies,
                determine_error,
                handle_error: self.handle_error,
                resolve_continuous: self.resolve_continuous,
            }),
        })
    }
}

// Orders the advice of one kind so that dependencies come first.
fn compose<T, E, A: Clone>(
    kind: AdviceKind,
    aspects: &[Aspect<T, E>],
    slot: impl Fn(&Aspect<T, E>) -> Option<&Advice<A>>,
) -> Result<Vec<Link<A>>, BuildError> {
    let known: HashSet<&str> = aspects.iter().map(Aspect::name).collect();
    let nodes: Vec<(&str, &Advice<A>)> = aspects
        .iter()
        .filter_map(|aspect| slot(aspect).map(|advice| (aspect.name(), advice)))
        .collect();
    let position: HashMap<&str, usize> = nodes
        .iter()
        .enumerate()
        .map(|(index, (name, _))| (*name, index))
        .collect();

    let mut requires: Vec<Vec<usize>> = vec![Vec::new(); nodes.len()];
    let mut dependents: Vec<Vec<usize>> = vec![Vec::new(); nodes.len()];
    let mut indegree = vec![0usize; nodes.len()];
    for (index, (name, advice)) in nodes.iter().enumerate() {
        for dependency in advice.dependencies() {
            if !known.contains(dependency.as_str()) {
                return Err(BuildError::UnknownDependency {
                    kind,
                    aspect: (*name).to_string(),
                    dependency: dependency.clone(),
                });
            }
            // An aspect without advice of this kind imposes no order.
            let Some(&required) = position.get(dependency.as_str()) else {
                continue;
            };
            if !requires[index].contains(&required) {
                requires[index].push(required);
                dependents[required].push(index);
                indegree[index] += 1;
            }
        }
    }

    let mut ready: BTreeSet<usize> = (0..nodes.len()).filter(|&n| indegree[n] == 0).collect();
    let mut order = Vec::with_capacity(nodes.len());
    let mut placed: Vec<Option<usize>> = vec![None; nodes.len()];
    while let Some(node) = ready.pop_first() {
        placed[node] = Some(order.len());
        order.push(node);
        for &dependent in &dependents[node] {
            indegree[dependent] -= 1;
            if indegree[dependent] == 0 {
                ready.insert(dependent);
            }
        }
    }

    if order.len() < nodes.len() {
        let aspects = (0..nodes.len())
            .filter(|&n| placed[n].is_none())
            .map(|n| nodes[n].0.to_string())
            .collect();
        return Err(BuildError::DependencyCycle { kind, aspects });
    }

    let links: Vec<Link<A>> = order
        .into_iter()
        .map(|node| Link {
            aspect: Arc::from(nodes[node].0),
            advice: nodes[node].1.clone(),
            after: requires[node].iter().filter_map(|&r| placed[r]).collect(),
        })
        .collect();
    debug!(
        kind = %kind,
        order = ?links.iter().map(|l| &*l.aspect).collect::<Vec<_>>(),
        "advice chain composed"
    );
    Ok(links)
}
