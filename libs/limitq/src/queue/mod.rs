//! Bounded-concurrency executor.
//!
//! `Queue` accepts an unbounded stream of tasks and keeps at most `concurrency`
//! of them running on the tokio runtime. Tasks which don't fit are kept in a FIFO
//! queue and started one by one as running tasks complete: the slot of a completed
//! task is handed directly to the oldest pending task.
//!
//! The queue doesn't interpret the outcomes of the tasks, it just forwards them to
//! the `JoinHandle` returned by `submit`. Dropping a `JoinHandle` (or canceling the
//! context passed to `JoinHandle::join`) detaches the task: it still runs to completion.
use crate::{config::Concurrency, ctx, metrics, time};
use std::{
    collections::VecDeque,
    fmt,
    future::Future,
    panic,
    pin::Pin,
    sync::{Arc, Mutex},
    task, thread,
};
use tokio::sync::oneshot;
use tracing::Instrument as _;


type BoxFuture = Pin<Box<dyn Send + Future<Output = ()>>>;

/// Task waiting for a slot. It is constructed when submitted,
/// and it gets the slot as an argument once admitted.
type Job = Box<dyn Send + FnOnce(Slot) -> BoxFuture>;

/// Mutable state of the queue.
/// Invariant: `pending` is non-empty only if `running == concurrency`.
struct State {
    /// Number of admitted tasks which didn't complete yet.
    running: usize,
    /// Tasks waiting for a slot, in submission order.
    pending: VecDeque<Job>,
}

struct Inner {
    concurrency: Concurrency,
    state: Mutex<State>,
}

/// Ownership of one of the `concurrency` slots of the queue.
/// Dropping it (also when the task panics) passes the slot
/// to the next pending task, or frees it.
struct Slot(Arc<Inner>);

impl Drop for Slot {
    fn drop(&mut self) {
        let next = {
            let mut state = self.0.state.lock().unwrap();
            let next = state.pending.pop_front();
            if next.is_none() {
                state.running -= 1;
            }
            next
        };
        if let Some(job) = next {
            tracing::trace!("handing slot over to a pending task");
            self.0.start(job);
        }
    }
}

/// Future catching the panics of the wrapped future,
/// so that they can be passed to the receiver of the outcome.
#[pin_project::pin_project]
struct CatchUnwind<F>(#[pin] F);

impl<F: Future> Future for CatchUnwind<F> {
    type Output = thread::Result<F::Output>;
    fn poll(self: Pin<&mut Self>, cx: &mut task::Context<'_>) -> task::Poll<Self::Output> {
        let fut = self.project().0;
        match panic::catch_unwind(panic::AssertUnwindSafe(|| fut.poll(cx))) {
            Ok(task::Poll::Pending) => task::Poll::Pending,
            Ok(task::Poll::Ready(v)) => task::Poll::Ready(Ok(v)),
            Err(payload) => task::Poll::Ready(Err(payload)),
        }
    }
}

impl Inner {
    /// Starts a pending `job` on the runtime of the task releasing the slot.
    fn start(self: &Arc<Self>, job: Job) {
        let fut = job(Slot(self.clone()));
        match tokio::runtime::Handle::try_current() {
            Ok(rt) => {
                rt.spawn(fut);
            }
            // Only possible while the runtime is shutting down.
            Err(err) => tracing::warn!("dropping a queued task: {err}"),
        }
    }

    /// Panics if called outside of a tokio runtime.
    fn admit(self: &Arc<Self>, job: Job) {
        let rt = tokio::runtime::Handle::current();
        let mut state = self.state.lock().unwrap();
        if state.running < self.concurrency.get() {
            state.running += 1;
            drop(state);
            rt.spawn(job(Slot(self.clone())));
        } else {
            state.pending.push_back(job);
            tracing::trace!(pending = state.pending.len(), "task queued");
            metrics::QUEUE.queued.inc();
        }
    }
}

/// Bounded-concurrency executor. Cloning produces another handle
/// to the same queue (sharing the same slots).
#[derive(Clone)]
pub struct Queue(Arc<Inner>);

impl fmt::Debug for Queue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Queue")
            .field("concurrency", &self.concurrency())
            .field("running", &self.running())
            .field("pending", &self.pending())
            .finish()
    }
}

impl Queue {
    /// Constructs a new queue running at most `concurrency` tasks at once.
    pub fn new(concurrency: Concurrency) -> Self {
        Self(Arc::new(Inner {
            concurrency,
            state: Mutex::new(State {
                running: 0,
                pending: VecDeque::new(),
            }),
        }))
    }

    /// Maximal number of tasks running at once.
    pub fn concurrency(&self) -> Concurrency {
        self.0.concurrency
    }

    /// Number of tasks started but not completed yet.
    pub fn running(&self) -> usize {
        self.0.state.lock().unwrap().running
    }

    /// Number of tasks submitted but not started yet.
    pub fn pending(&self) -> usize {
        self.0.state.lock().unwrap().pending.len()
    }

    /// Submits a task. The task is started immediately if there is a free slot,
    /// otherwise it is started after all the previously submitted tasks.
    ///
    /// # Panics
    ///
    /// Panics if called outside of a tokio runtime.
    pub fn submit<T, F>(&self, fut: F) -> JoinHandle<T>
    where
        T: 'static + Send,
        F: 'static + Send + Future<Output = T>,
    {
        let (send, recv) = oneshot::channel();
        self.submit_with(fut, move |v| {
            // The handle might have been dropped already.
            let _ = send.send(v);
        });
        JoinHandle(recv)
    }

    /// Submits a task which passes its output (or its panic) to `deliver`.
    /// `deliver` is called after the task's slot has been released,
    /// so that the receiver of the output can immediately submit another task
    /// without having it queued.
    pub(crate) fn submit_with<T, F>(
        &self,
        fut: F,
        deliver: impl 'static + Send + FnOnce(thread::Result<T>),
    )
    where
        T: 'static + Send,
        F: 'static + Send + Future<Output = T>,
    {
        metrics::QUEUE.submitted.inc();
        let submitted = time::Instant::now();
        let fut = CatchUnwind(fut.in_current_span());
        self.0.admit(Box::new(move |slot: Slot| -> BoxFuture {
            Box::pin(async move {
                metrics::QUEUE.wait_latency.observe(submitted.elapsed());
                let output = fut.await;
                drop(slot);
                deliver(output);
            })
        }));
    }
}

/// Handle to the outcome of a task submitted to a `Queue`.
#[must_use = "dropping the handle detaches the task"]
pub struct JoinHandle<T>(oneshot::Receiver<thread::Result<T>>);

impl<T> fmt::Debug for JoinHandle<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("JoinHandle").finish_non_exhaustive()
    }
}

impl<T> JoinHandle<T> {
    /// Awaits completion of the task and returns its output.
    /// Returns `Canceled` if `ctx` gets canceled first; the task keeps running then.
    /// Resumes the panic if the task panicked.
    pub fn join<'a>(
        self,
        ctx: &'a ctx::Ctx,
    ) -> ctx::CtxAware<impl 'a + Future<Output = ctx::OrCanceled<T>>>
    where
        T: 'a,
    {
        ctx::CtxAware(async move {
            match ctx.wait(self.0).await? {
                Ok(Ok(v)) => Ok(v),
                Ok(Err(payload)) => panic::resume_unwind(payload),
                Err(_) => panic!("queued task was dropped without running"),
            }
        })
    }
}
