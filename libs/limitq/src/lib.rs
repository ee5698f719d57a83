//! Bounded-concurrency task execution.
//!
//! * [`queue::Queue`] runs submitted futures with at most `concurrency` of them at once.
//! * [`iter::map_limit`] (and the derived helpers in [`iter`]) maps a sequence
//!   through an async function with a concurrency limit, preserving the input order.
//! * [`mutex::PriorityMutex`] serializes a critical section, admitting waiters by priority.
//!
//! All blocking calls take a [`ctx::Ctx`], which bounds the waiting time.

pub mod config;
pub mod ctx;
pub mod iter;
mod metrics;
pub mod mutex;
pub mod queue;
mod signal;
pub mod testonly;
pub mod time;

pub use config::Concurrency;
