//! Error types shared by the composer, the restricted context and the
//! async context.

use thiserror::Error;

use crate::advice::AdviceKind;

/// Errors raised while building a [`Process`](crate::Process).
///
/// These are always fatal: a process that fails to build never runs a target.
#[derive(Clone, Debug, PartialEq, Eq, Error)]
pub enum BuildError {
    #[error("aspect `{0}` is registered more than once")]
    DuplicateAspect(String),

    #[error("{kind} advice of aspect `{aspect}` depends on unknown aspect `{dependency}`")]
    UnknownDependency {
        kind: AdviceKind,
        aspect: String,
        dependency: String,
    },

    #[error("{kind} advice dependencies form a cycle between: {}", .aspects.join(", "))]
    DependencyCycle {
        kind: AdviceKind,
        aspects: Vec<String>,
    },
}

/// Contract violations reported by [`RestrictedContext`](crate::RestrictedContext)
/// and [`AsyncContext`](crate::AsyncContext).
#[derive(Clone, Debug, PartialEq, Eq, Error)]
pub enum ContextError {
    #[error("section `{0}` does not exist in this context")]
    UnknownSection(String),

    #[error("section `{0}` was not granted to this caller")]
    NotAllowedSection(String),

    #[error("section `{0}` is already in use")]
    SectionInUse(String),

    #[error("section `{0}` is currently held by another caller")]
    SectionInUseByOther(String),

    #[error("section `{0}` does not hold a value of the requested type")]
    TypeMismatch(String),

    #[error("no context generator configured")]
    NoGenerator,

    #[error("context accessed outside of an active scope")]
    OutsideScope,
}
