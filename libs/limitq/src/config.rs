//! Concurrency limit configuration.
use std::{fmt, num::NonZeroUsize, str::FromStr};


/// Error returned when constructing a `Concurrency` from an invalid value.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum InvalidConcurrency {
    /// Concurrency limit has to be positive.
    #[error("concurrency limit has to be positive, got 0")]
    Zero,
    /// Concurrency limit is not a non-negative integer.
    #[error("concurrency limit {0:?} is not a non-negative integer")]
    Malformed(String),
}

/// Maximal number of tasks which a component runs simultaneously.
/// Always positive, so that every constructed component can make progress.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[derive(serde::Serialize, serde::Deserialize)]
#[serde(try_from = "usize", into = "usize")]
pub struct Concurrency(NonZeroUsize);

impl Concurrency {
    /// No concurrency: tasks run one at a time.
    pub const ONE: Self = Self(NonZeroUsize::MIN);
    /// Effectively unlimited concurrency.
    pub const UNLIMITED: Self = Self(NonZeroUsize::MAX);

    /// Validates the limit.
    pub fn new(limit: usize) -> Result<Self, InvalidConcurrency> {
        NonZeroUsize::new(limit)
            .map(Self)
            .ok_or(InvalidConcurrency::Zero)
    }

    /// The limit as an integer.
    pub fn get(self) -> usize {
        self.0.get()
    }
}

impl Default for Concurrency {
    fn default() -> Self {
        Self::ONE
    }
}

impl From<NonZeroUsize> for Concurrency {
    fn from(limit: NonZeroUsize) -> Self {
        Self(limit)
    }
}

impl TryFrom<usize> for Concurrency {
    type Error = InvalidConcurrency;
    fn try_from(limit: usize) -> Result<Self, Self::Error> {
        Self::new(limit)
    }
}

impl From<Concurrency> for usize {
    fn from(c: Concurrency) -> Self {
        c.get()
    }
}

impl FromStr for Concurrency {
    type Err = InvalidConcurrency;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let limit: usize = s
            .trim()
            .parse()
            .map_err(|_| InvalidConcurrency::Malformed(s.to_owned()))?;
        Self::new(limit)
    }
}

impl fmt::Display for Concurrency {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}
