//! Metrics of the concurrency primitives.
//! They are aggregated over all the instances in the process.
use std::time;

#[vise::register]
pub(crate) static QUEUE: vise::Global<Queue> = vise::Global::new();

#[derive(Debug, vise::Metrics)]
#[metrics(prefix = "limitq_queue")]
pub(crate) struct Queue {
    /// Number of tasks submitted to any queue.
    pub(crate) submitted: vise::Counter,
    /// Number of tasks which had to wait for a free slot.
    pub(crate) queued: vise::Counter,
    /// Time between submitting a task and starting it.
    #[metrics(unit = vise::Unit::Seconds, buckets = vise::Buckets::LATENCIES)]
    pub(crate) wait_latency: vise::Histogram<time::Duration>,
}

#[vise::register]
pub(crate) static ITER: vise::Global<Iter> = vise::Global::new();

#[derive(Debug, vise::Metrics)]
#[metrics(prefix = "limitq_iter")]
pub(crate) struct Iter {
    /// Number of iterations which short-circuited (error or decisive result)
    /// while some elements were still in flight or not started.
    pub(crate) abandoned: vise::Counter,
}

#[vise::register]
pub(crate) static MUTEX: vise::Global<Mutex> = vise::Global::new();

#[derive(Debug, vise::Metrics)]
#[metrics(prefix = "limitq_mutex")]
pub(crate) struct Mutex {
    /// Time spent waiting for a slot of a priority mutex.
    #[metrics(unit = vise::Unit::Seconds, buckets = vise::Buckets::LATENCIES)]
    pub(crate) wait_latency: vise::Histogram<time::Duration>,
    /// Number of waiters which were canceled before getting a slot.
    pub(crate) canceled_waiters: vise::Counter,
}
