//! Composable advice around asynchronous operations.
//!
//! `aspectron` runs cross-cutting behaviors ("advice") around an async
//! target with well-defined ordering, isolation and failure semantics. It is
//! the layer resilience policies (retry, timeout, backoff) and request-scoped
//! middleware are built on.
//!
//! The crate is designed to work independently of any specific async runtime:
//! nothing is spawned, advice run as cooperatively polled futures inside the
//! caller's task.
//!
//! Features include:
//! - [`Aspect`]s bundling up to five [`advice`] (`before`, `around`,
//!   `afterReturning`, `afterThrowing`, `after`) with declared section usage
//!   and dependencies
//! - A [`Process`] composing aspects into dependency-ordered chains and
//!   running targets through them under per-kind [`Policies`]
//! - A [`RestrictedContext`] granting each advice exclusive, all-or-nothing
//!   access to the sections it declared
//! - An [`AsyncContext`] for task-scoped values that follow a future across
//!   `.await` points and never leak into concurrent executions
//!
//! # Example
//! ```
//! # use aspectron::{AroundHooks, Aspect, ContextError, Process, Sections, Target, advice};
//! #
//! # futures::executor::block_on(async {
//! let process = Process::<u32, ContextError>::builder()
//!     .aspect(
//!         Aspect::new("double").around(advice::around(|_, hooks: AroundHooks<u32, ContextError>| async move {
//!             hooks.attach_to_target(|target| {
//!                 Target::new(move || {
//!                     let target = target.clone();
//!                     async move { target.call().await.map(|v| v * 2) }
//!                 })
//!             });
//!             Ok(())
//!         })),
//!     )
//!     .build()
//!     .unwrap();
//!
//! let value = process.run(Sections::new, Target::new(|| async { Ok(21) })).await;
//! assert_eq!(value, Ok(42));
//! # });
//! ```

pub mod advice;
pub mod aspect;
pub mod async_context;
pub mod error;
pub mod executor;
pub mod policy;
pub mod priority;
pub mod process;
pub mod rejection;
pub mod restricted;
mod stage;
pub mod target;

pub use advice::AdviceKind;
pub use aspect::Aspect;
pub use async_context::{Accessor, AsyncContext, Exit, Scope};
pub use error::{BuildError, ContextError};
pub use executor::{Halt, current_context, exit_invocation};
pub use policy::{AfterThrow, Aggregation, ErrorPolicy, Execution, KindPolicy, Policies, RuntimePolicy};
pub use priority::{Prioritized, Priority};
pub use process::{Failure, Process, ProcessBuilder, Value};
pub use rejection::Rejections;
pub use restricted::{RestrictedContext, SectionView, Sections};
pub use target::{AroundHooks, Target};
