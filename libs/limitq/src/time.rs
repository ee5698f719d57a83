//! Time primitives shared by `Ctx` and the executors.
//! Durations are signed (`time::Duration`), so that arithmetic on them
//! never panics; instants come from tokio, so that `tokio::time::pause()`
//! works in tests.

/// A signed Duration.
pub type Duration = time::Duration;

/// Monotonic clock time.
pub type Instant = tokio::time::Instant;

/// Represents an optional deadline.
/// Isomorphic to `Option<Instant>`,
/// however the total ordering on `Deadline` is purposefully
/// defined, while on `Option<Instant>` it is accidental.
/// By the definition of derive(PartialOrd), Finite(...) < Infinite.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Deadline {
    /// Finite deadline.
    Finite(Instant),
    /// Infinite deadline.
    Infinite,
}

impl From<Instant> for Deadline {
    fn from(t: Instant) -> Self {
        Self::Finite(t)
    }
}

/// Saturating conversion to `std::time::Duration`.
/// Negative durations are clamped to zero.
pub(crate) fn to_std(d: Duration) -> std::time::Duration {
    d.try_into().unwrap_or_default()
}

/// Adds a signed duration to an instant.
/// Returns `Deadline::Infinite` if the result is not representable.
pub(crate) fn add(t: Instant, d: Duration) -> Deadline {
    match t.checked_add(to_std(d)) {
        Some(t) => Deadline::Finite(t),
        None => Deadline::Infinite,
    }
}
