//! Aggregated advice and target failures.

use std::{fmt, vec};

use crate::priority::Prioritized;

/// A non-empty, ordered set of errors collected from one stage (or from
/// several stages when errors were allowed to continue).
///
/// Errors keep the order in which they settled.
#[derive(Clone, PartialEq, Eq)]
pub struct Rejections<E> {
    first: E,
    rest: Vec<E>,
}

impl<E> Rejections<E> {
    pub fn new(first: E) -> Self {
        Self {
            first,
            rest: Vec::new(),
        }
    }

    /// Builds a set from a vector, returning `None` if it is empty.
    pub fn from_vec(errors: Vec<E>) -> Option<Self> {
        let mut errors = errors.into_iter();
        let first = errors.next()?;
        Some(Self {
            first,
            rest: errors.collect(),
        })
    }

    pub fn push(&mut self, error: E) {
        self.rest.push(error);
    }

    /// Appends every error of `other`, keeping its order.
    pub fn extend(&mut self, other: Rejections<E>) {
        self.rest.push(other.first);
        self.rest.extend(other.rest);
    }

    #[must_use]
    pub fn len(&self) -> usize {
        1 + self.rest.len()
    }

    /// Always `false`; present for API symmetry with collections.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        false
    }

    /// The error that settled first.
    #[must_use]
    pub fn first(&self) -> &E {
        &self.first
    }

    pub fn into_first(self) -> E {
        self.first
    }

    pub fn iter(&self) -> impl Iterator<Item = &E> {
        std::iter::once(&self.first).chain(self.rest.iter())
    }

    #[must_use]
    pub fn into_vec(self) -> Vec<E> {
        let mut all = Vec::with_capacity(self.len());
        all.push(self.first);
        all.extend(self.rest);
        all
    }
}

impl<E: Prioritized> Rejections<E> {
    /// Reduces the set to the error with the highest priority.
    ///
    /// Ties go to the error that settled first.
    pub fn into_dominant(self) -> E {
        let mut dominant = self.first;
        for error in self.rest {
            if error.priority() > dominant.priority() {
                dominant = error;
            }
        }
        dominant
    }
}

impl<E> IntoIterator for Rejections<E> {
    type Item = E;
    type IntoIter = vec::IntoIter<E>;

    fn into_iter(self) -> Self::IntoIter {
        self.into_vec().into_iter()
    }
}

impl<E: fmt::Debug> fmt::Debug for Rejections<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.iter()).finish()
    }
}
