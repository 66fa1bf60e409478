//! Per-kind execution and error policy.
//!
//! Policies are fixed when a [`Process`](crate::Process) is built and apply to
//! every advice of a kind. They serialize in the shape
//! `{ execution, error: { aggregation, runtime: { afterThrow } } }`, so a
//! process can take them from a configuration file:
//!
//! ```
//! # use aspectron::{AdviceKind, Execution, Aggregation, Policies};
//! #
//! let policies: Policies = toml::from_str(
//!     r#"
//!     [before]
//!     execution = "sequential"
//!     error = { aggregation = "all", runtime = { afterThrow = "continue" } }
//!     "#,
//! )
//! .unwrap();
//!
//! assert_eq!(policies.get(AdviceKind::Before).execution, Execution::Sequential);
//! assert_eq!(policies.get(AdviceKind::Before).error.aggregation, Aggregation::All);
//! assert_eq!(policies.get(AdviceKind::After), &Policies::default().after);
//! ```
use serde::{Deserialize, Serialize};

use crate::advice::AdviceKind;

/// How the advice of one kind are scheduled.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Execution {
    /// Every advice whose dependencies have settled is polled concurrently.
    #[default]
    Parallel,
    /// Each advice settles before the next one starts, in chain order.
    Sequential,
}

/// How many rejections a stage collects before it completes.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Aggregation {
    /// The first rejection completes the stage; unsettled advice are dropped.
    #[default]
    Unit,
    /// Every advice settles and every rejection is collected.
    All,
}

/// What a rejected stage does to the rest of the attempt.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AfterThrow {
    /// Skip to `afterThrowing`/`after` and route the attempt to halt resolution.
    #[default]
    Halt,
    /// Keep going and carry the rejections to continuous resolution.
    Continue,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RuntimePolicy {
    pub after_throw: AfterThrow,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ErrorPolicy {
    pub aggregation: Aggregation,
    pub runtime: RuntimePolicy,
}

/// Policy for the advice of one kind.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct KindPolicy {
    pub execution: Execution,
    pub error: ErrorPolicy,
}

impl KindPolicy {
    pub const fn new(execution: Execution, aggregation: Aggregation, after_throw: AfterThrow) -> Self {
        Self {
            execution,
            error: ErrorPolicy {
                aggregation,
                runtime: RuntimePolicy { after_throw },
            },
        }
    }

    /// Run advice one at a time in chain order.
    pub const fn sequential(mut self) -> Self {
        self.execution = Execution::Sequential;
        self
    }

    /// Run advice concurrently (respecting dependencies).
    pub const fn parallel(mut self) -> Self {
        self.execution = Execution::Parallel;
        self
    }

    /// Collect every rejection before completing the stage.
    pub const fn collect_all(mut self) -> Self {
        self.error.aggregation = Aggregation::All;
        self
    }

    /// Complete the stage on the first rejection.
    pub const fn first_rejection(mut self) -> Self {
        self.error.aggregation = Aggregation::Unit;
        self
    }

    /// Halt the attempt when the stage rejects.
    pub const fn halt(mut self) -> Self {
        self.error.runtime.after_throw = AfterThrow::Halt;
        self
    }

    /// Carry the stage's rejections forward and keep going.
    pub const fn carry_on(mut self) -> Self {
        self.error.runtime.after_throw = AfterThrow::Continue;
        self
    }

    #[must_use]
    pub const fn halts(&self) -> bool {
        matches!(self.error.runtime.after_throw, AfterThrow::Halt)
    }
}

/// Policies for all five kinds.
///
/// Defaults: every kind runs in parallel and completes on the first
/// rejection; every kind halts except `after`, whose rejections continue.
/// `around` advice always run sequentially whatever their execution setting.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Policies {
    pub before: KindPolicy,
    /// Its `execution` is ignored; around advice always run sequentially.
    pub around: KindPolicy,
    pub after_returning: KindPolicy,
    pub after_throwing: KindPolicy,
    pub after: KindPolicy,
}

impl Default for Policies {
    fn default() -> Self {
        let base = KindPolicy::new(Execution::Parallel, Aggregation::Unit, AfterThrow::Halt);
        Self {
            before: base,
            around: base.sequential(),
            after_returning: base,
            after_throwing: base,
            after: base.carry_on(),
        }
    }
}

impl Policies {
    #[must_use]
    pub fn get(&self, kind: AdviceKind) -> &KindPolicy {
        match kind {
            AdviceKind::Before => &self.before,
            AdviceKind::Around => &self.around,
            AdviceKind::AfterReturning => &self.after_returning,
            AdviceKind::AfterThrowing => &self.after_throwing,
            AdviceKind::After => &self.after,
        }
    }

    pub fn get_mut(&mut self, kind: AdviceKind) -> &mut KindPolicy {
        match kind {
            AdviceKind::Before => &mut self.before,
            AdviceKind::Around => &mut self.around,
            AdviceKind::AfterReturning => &mut self.after_returning,
            AdviceKind::AfterThrowing => &mut self.after_throwing,
            AdviceKind::After => &mut self.after,
        }
    }
}
