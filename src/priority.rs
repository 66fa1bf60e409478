//! Error priorities, used to pick the dominant error of an aggregated set.
use crate::error::ContextError;

/// Priority of a rejection. Higher values (0-255) dominate lower ones.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[must_use]
pub struct Priority(u8);

impl Priority {
    /// Control-flow signals that must win over everything else (255)
    pub const CRITICAL: Self = Self(255);

    /// Signals raised by resilience aspects, such as a retry request (200)
    pub const HIGH: Self = Self(200);

    /// Ordinary failures (150)
    pub const NORMAL: Self = Self(150);

    /// Failures that only matter when nothing else went wrong (100)
    pub const LOW: Self = Self(100);

    /// Diagnostics carried along for reporting (50)
    pub const BACKGROUND: Self = Self(50);

    pub const fn new(value: u8) -> Self {
        Self(value)
    }

    #[must_use]
    pub const fn value(&self) -> u8 {
        self.0
    }
}

impl From<u8> for Priority {
    fn from(value: u8) -> Self {
        Self(value)
    }
}

/// Errors that carry a [`Priority`].
///
/// Implementing this lets [`Rejections::into_dominant`](crate::Rejections::into_dominant)
/// reduce an aggregated set to the error that should drive resolution.
pub trait Prioritized {
    fn priority(&self) -> Priority;
}

impl Prioritized for ContextError {
    /// Lease conflicts are ordinary contention; everything else is a
    /// contract violation in the advice or target that raised it.
    fn priority(&self) -> Priority {
        match self {
            ContextError::SectionInUse(_) | ContextError::SectionInUseByOther(_) => Priority::NORMAL,
            _ => Priority::HIGH,
        }
    }
}
