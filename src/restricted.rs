//! Section-scoped access to a shared invocation context.
//!
//! A [`RestrictedContext`] owns a set of named sections. Callers never touch
//! the sections directly: they ask for a list of section names through
//! [`RestrictedContext::use_sections`] (fail fast) or
//! [`RestrictedContext::wait_sections`] (wait until free), and receive a
//! [`SectionView`] that only grants access to the sections they asked for.
//!
//! Sections are leased all-or-nothing. While a lease is alive no other caller
//! can acquire any of its sections; leases over disjoint sections never
//! contend. A lease is released when the caller's action settles, fails,
//! panics or is dropped.
use std::{
    any::Any,
    collections::HashMap,
    fmt,
    pin::Pin,
    sync::Arc,
    task::{Context, Poll, Waker},
};

use parking_lot::Mutex;
use tracing::trace;

use crate::error::ContextError;

type SectionValue = Box<dyn Any + Send>;

/// The raw sections an invocation starts with.
///
/// # Example
/// ```
/// # use aspectron::Sections;
/// #
/// let sections = Sections::new()
///     .with("retry", 0u32)
///     .with("timeout", std::time::Duration::from_millis(250));
///
/// assert!(sections.contains("retry"));
/// assert_eq!(sections.len(), 2);
/// ```
#[derive(Default)]
pub struct Sections {
    values: HashMap<String, SectionValue>,
}

impl Sections {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds (or replaces) a section.
    pub fn with(mut self, name: impl Into<String>, value: impl Any + Send) -> Self {
        self.insert(name, value);
        self
    }

    /// Adds (or replaces) a section.
    pub fn insert(&mut self, name: impl Into<String>, value: impl Any + Send) -> &mut Self {
        self.values.insert(name.into(), Box::new(value));
        self
    }

    #[must_use]
    pub fn contains(&self, name: &str) -> bool {
        self.values.contains_key(name)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.values.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

impl fmt::Debug for Sections {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_set().entries(self.values.keys()).finish()
    }
}

// Section name -> id of the lease holding it. Waiters are keyed by the id
// of the `Acquire` future that registered them.
#[derive(Default)]
struct LeaseTable {
    holders: HashMap<String, u64>,
    next_lease: u64,
    waiters: Vec<(u64, Waker)>,
    next_waiter: u64,
}

impl LeaseTable {
    fn held<'a>(&self, requested: &'a [String]) -> Option<&'a String> {
        requested
            .iter()
            .find(|section| self.holders.contains_key(*section))
    }

    fn grant(&mut self, requested: &[String]) -> u64 {
        self.next_lease += 1;
        let lease = self.next_lease;
        for section in requested {
            self.holders.insert(section.clone(), lease);
        }
        lease
    }

    fn register(&mut self, waiter: u64, waker: &Waker) {
        match self.waiters.iter_mut().find(|(id, _)| *id == waiter) {
            Some((_, registered)) => registered.clone_from(waker),
            None => self.waiters.push((waiter, waker.clone())),
        }
    }

    fn unregister(&mut self, waiter: u64) {
        self.waiters.retain(|(id, _)| *id != waiter);
    }
}

struct Shared {
    // Key set is fixed at construction; only the values mutate.
    values: HashMap<String, Mutex<SectionValue>>,
    leases: Mutex<LeaseTable>,
}

/// Guard over a sectioned context object.
///
/// Cloning is cheap and every clone refers to the same sections and leases.
#[derive(Clone)]
pub struct RestrictedContext {
    shared: Arc<Shared>,
}

impl fmt::Debug for RestrictedContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RestrictedContext")
            .field("sections", &self.shared.values.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl RestrictedContext {
    #[must_use]
    pub fn new(sections: Sections) -> Self {
        let values = sections
            .values
            .into_iter()
            .map(|(name, value)| (name, Mutex::new(value)))
            .collect();
        Self {
            shared: Arc::new(Shared {
                values,
                leases: Mutex::new(LeaseTable::default()),
            }),
        }
    }

    /// Returns `true` if the context has a section with this name.
    #[must_use]
    pub fn contains(&self, section: &str) -> bool {
        self.shared.values.contains_key(section)
    }

    /// Returns `true` if the section is currently leased by some caller.
    #[must_use]
    pub fn is_held(&self, section: &str) -> bool {
        self.shared.leases.lock().holders.contains_key(section)
    }

    /// Number of [`wait_sections`](Self::wait_sections) callers currently
    /// waiting for a section to be released.
    #[must_use]
    pub fn waiting(&self) -> usize {
        self.shared.leases.lock().waiters.len()
    }

    /// Leases `sections` and runs `action` with a view restricted to them.
    ///
    /// The lease is all-or-nothing: if any requested section is already held
    /// by another caller this fails with [`ContextError::SectionInUse`] and
    /// `action` is never called. Requesting the same name twice is the same
    /// as requesting it once.
    ///
    /// # Errors
    ///
    /// - [`ContextError::UnknownSection`] if a requested section does not exist.
    /// - [`ContextError::SectionInUse`] if a requested section is held.
    ///
    /// # Example
    /// ```
    /// # use aspectron::{RestrictedContext, Sections};
    /// #
    /// # futures::executor::block_on(async {
    /// let context = RestrictedContext::new(Sections::new().with("hits", 0u32));
    ///
    /// let hits = context
    ///     .use_sections(["hits"], |view| async move {
    ///         view.with_mut("hits", |hits: &mut u32| {
    ///             *hits += 1;
    ///             *hits
    ///         })
    ///     })
    ///     .await;
    ///
    /// assert_eq!(hits, Ok(Ok(1)));
    /// # });
    /// ```
    pub async fn use_sections<I, S, F, Fut>(
        &self,
        sections: I,
        action: F,
    ) -> Result<Fut::Output, ContextError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
        F: FnOnce(SectionView) -> Fut,
        Fut: Future,
    {
        let requested = self.requested(sections)?;
        let lease = self.try_acquire(requested)?;
        Ok(action(lease.view()).await)
    }

    /// Leases `sections`, waiting until all of them are free, and runs
    /// `action` with a view restricted to them.
    ///
    /// Sections are acquired together once every one of them is free, so
    /// callers with partially overlapping requests serialize without
    /// deadlocking.
    ///
    /// # Errors
    ///
    /// [`ContextError::UnknownSection`] if a requested section does not exist.
    pub async fn wait_sections<I, S, F, Fut>(
        &self,
        sections: I,
        action: F,
    ) -> Result<Fut::Output, ContextError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
        F: FnOnce(SectionView) -> Fut,
        Fut: Future,
    {
        let requested = self.requested(sections)?;
        let lease = Acquire {
            context: self,
            requested,
            waiter: None,
        }
        .await;
        Ok(action(lease.view()).await)
    }

    fn requested<I, S>(&self, sections: I) -> Result<Arc<[String]>, ContextError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut requested: Vec<String> = Vec::new();
        for section in sections {
            let section = section.as_ref();
            if !self.contains(section) {
                return Err(ContextError::UnknownSection(section.to_string()));
            }
            if !requested.iter().any(|s| s == section) {
                requested.push(section.to_string());
            }
        }
        Ok(requested.into())
    }

    fn try_acquire(&self, requested: Arc<[String]>) -> Result<Lease, ContextError> {
        let mut leases = self.shared.leases.lock();
        if let Some(section) = leases.held(&requested) {
            trace!(section = %section, "section already leased");
            return Err(ContextError::SectionInUse(section.clone()));
        }
        let id = leases.grant(&requested);
        trace!(lease = id, sections = ?requested, "sections leased");
        Ok(Lease {
            shared: Arc::clone(&self.shared),
            id,
            sections: requested,
        })
    }
}

// Waits until every requested section is free, then leases them together.
// Dropping it while waiting removes its waker from the table.
struct Acquire<'a> {
    context: &'a RestrictedContext,
    requested: Arc<[String]>,
    waiter: Option<u64>,
}

impl Future for Acquire<'_> {
    type Output = Lease;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Lease> {
        let this = self.get_mut();
        let shared = &this.context.shared;
        let mut leases = shared.leases.lock();
        if leases.held(&this.requested).is_some() {
            let waiter = *this.waiter.get_or_insert_with(|| {
                leases.next_waiter += 1;
                leases.next_waiter
            });
            leases.register(waiter, cx.waker());
            return Poll::Pending;
        }
        if let Some(waiter) = this.waiter.take() {
            leases.unregister(waiter);
        }
        let id = leases.grant(&this.requested);
        trace!(lease = id, sections = ?this.requested, "sections leased after waiting");
        Poll::Ready(Lease {
            shared: Arc::clone(shared),
            id,
            sections: Arc::clone(&this.requested),
        })
    }
}

impl Drop for Acquire<'_> {
    fn drop(&mut self) {
        if let Some(waiter) = self.waiter.take() {
            self.context.shared.leases.lock().unregister(waiter);
        }
    }
}

// Releases its sections when dropped and wakes every waiting caller.
struct Lease {
    shared: Arc<Shared>,
    id: u64,
    sections: Arc<[String]>,
}

impl Lease {
    fn view(&self) -> SectionView {
        SectionView {
            shared: Arc::clone(&self.shared),
            lease: self.id,
            granted: Arc::clone(&self.sections),
        }
    }
}

impl Drop for Lease {
    fn drop(&mut self) {
        let waiters = {
            let mut leases = self.shared.leases.lock();
            for section in self.sections.iter() {
                if leases.holders.get(section) == Some(&self.id) {
                    leases.holders.remove(section);
                }
            }
            std::mem::take(&mut leases.waiters)
        };
        trace!(lease = self.id, "sections released");
        for (_, waker) in waiters {
            waker.wake();
        }
    }
}

/// Capability over the sections granted to one lease.
///
/// Every accessor checks the lease first:
/// - a section held by this lease is accessible;
/// - a section held by any other lease fails with
///   [`ContextError::SectionInUseByOther`];
/// - anything else (never granted, unknown, or the lease has ended) fails
///   with [`ContextError::NotAllowedSection`].
///
/// Accessors take closures and never hold a section across an `.await`.
/// Nesting accessors for the same section on one view deadlocks.
#[derive(Clone)]
pub struct SectionView {
    shared: Arc<Shared>,
    lease: u64,
    granted: Arc<[String]>,
}

impl fmt::Debug for SectionView {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SectionView")
            .field("lease", &self.lease)
            .field("granted", &self.granted)
            .finish()
    }
}

impl SectionView {
    /// Names of the sections granted to this view.
    pub fn sections(&self) -> impl Iterator<Item = &str> {
        self.granted.iter().map(String::as_str)
    }

    /// Returns `true` if `section` is accessible through this view right now.
    #[must_use]
    pub fn is_granted(&self, section: &str) -> bool {
        self.slot(section).is_ok()
    }

    fn slot(&self, section: &str) -> Result<&Mutex<SectionValue>, ContextError> {
        let holder = self.shared.leases.lock().holders.get(section).copied();
        match holder {
            Some(lease) if lease == self.lease => self
                .shared
                .values
                .get(section)
                .ok_or_else(|| ContextError::NotAllowedSection(section.to_string())),
            Some(_) => Err(ContextError::SectionInUseByOther(section.to_string())),
            None => Err(ContextError::NotAllowedSection(section.to_string())),
        }
    }

    /// Returns a clone of the section's value.
    ///
    /// # Errors
    ///
    /// See [`SectionView`]; additionally [`ContextError::TypeMismatch`] if the
    /// section does not hold a `T`.
    pub fn get<T: Clone + 'static>(&self, section: &str) -> Result<T, ContextError> {
        self.with(section, T::clone)
    }

    /// Calls `f` with a shared reference to the section's value.
    ///
    /// # Errors
    ///
    /// See [`SectionView::get`].
    pub fn with<T: 'static, R>(
        &self,
        section: &str,
        f: impl FnOnce(&T) -> R,
    ) -> Result<R, ContextError> {
        let slot = self.slot(section)?;
        let value = slot.lock();
        let value = (**value)
            .downcast_ref::<T>()
            .ok_or_else(|| ContextError::TypeMismatch(section.to_string()))?;
        Ok(f(value))
    }

    /// Calls `f` with a mutable reference to the section's value.
    ///
    /// # Errors
    ///
    /// See [`SectionView::get`].
    pub fn with_mut<T: 'static, R>(
        &self,
        section: &str,
        f: impl FnOnce(&mut T) -> R,
    ) -> Result<R, ContextError> {
        let slot = self.slot(section)?;
        let mut value = slot.lock();
        let value = (**value)
            .downcast_mut::<T>()
            .ok_or_else(|| ContextError::TypeMismatch(section.to_string()))?;
        Ok(f(value))
    }

    /// Replaces the section's value, possibly with a value of another type.
    ///
    /// # Errors
    ///
    /// See [`SectionView`].
    pub fn set<T: Any + Send>(&self, section: &str, value: T) -> Result<(), ContextError> {
        let slot = self.slot(section)?;
        *slot.lock() = Box::new(value);
        Ok(())
    }
}
