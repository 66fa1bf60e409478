use std::fmt;

use crate::advice::{AdviceKind, After, AfterReturning, AfterThrowing, Around, Before};

/// A named bundle of advice contributed by one feature or middleware.
///
/// Every slot is optional; names must be unique within a
/// [`Process`](crate::Process).
///
/// # Example
/// ```
/// # use aspectron::{Aspect, ContextError, advice};
/// #
/// let audit: Aspect<u32, ContextError> = Aspect::new("audit")
///     .before(advice::before(|_| async { Ok(()) }))
///     .after(advice::after(|_| async { Ok(()) }));
///
/// assert_eq!(audit.name(), "audit");
/// assert!(audit.has(aspectron::AdviceKind::Before));
/// assert!(!audit.has(aspectron::AdviceKind::Around));
/// ```
pub struct Aspect<T, E> {
    name: String,
    pub(crate) before: Option<Before<E>>,
    pub(crate) around: Option<Around<T, E>>,
    pub(crate) after_returning: Option<AfterReturning<T, E>>,
    pub(crate) after_throwing: Option<AfterThrowing<E>>,
    pub(crate) after: Option<After<E>>,
}

impl<T, E> Aspect<T, E> {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            before: None,
            around: None,
            after_returning: None,
            after_throwing: None,
            after: None,
        }
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn before(mut self, advice: Before<E>) -> Self {
        self.before = Some(advice);
        self
    }

    pub fn around(mut self, advice: Around<T, E>) -> Self {
        self.around = Some(advice);
        self
    }

    pub fn after_returning(mut self, advice: AfterReturning<T, E>) -> Self {
        self.after_returning = Some(advice);
        self
    }

    pub fn after_throwing(mut self, advice: AfterThrowing<E>) -> Self {
        self.after_throwing = Some(advice);
        self
    }

    pub fn after(mut self, advice: After<E>) -> Self {
        self.after = Some(advice);
        self
    }

    /// Returns `true` if the aspect has an advice of this kind.
    #[must_use]
    pub fn has(&self, kind: AdviceKind) -> bool {
        self.dependencies(kind).is_some()
    }

    pub(crate) fn dependencies(&self, kind: AdviceKind) -> Option<&[String]> {
        match kind {
            AdviceKind::Before => self.before.as_ref().map(|a| a.dependencies()),
            AdviceKind::Around => self.around.as_ref().map(|a| a.dependencies()),
            AdviceKind::AfterReturning => self.after_returning.as_ref().map(|a| a.dependencies()),
            AdviceKind::AfterThrowing => self.after_throwing.as_ref().map(|a| a.dependencies()),
            AdviceKind::After => self.after.as_ref().map(|a| a.dependencies()),
        }
    }
}

impl<T, E> fmt::Debug for Aspect<T, E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let kinds: Vec<_> = AdviceKind::ALL
            .into_iter()
            .filter(|kind| self.has(*kind))
            .collect();
        f.debug_struct("Aspect")
            .field("name", &self.name)
            .field("advice", &kinds)
            .finish()
    }
}
