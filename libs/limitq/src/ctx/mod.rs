//! Cancellation context, modeled after the golang Context (https://pkg.go.dev/context).
//!
//! Every blocking call of this crate takes a `&Ctx` and awaits the blocking
//! operation together with the context cancellation: instead of "awaiting the
//! next completion" you "await the next completion OR the context getting
//! canceled". Cancellation only abandons the wait. It never interrupts work
//! which has already been started on the runtime, since tokio tasks have
//! no cooperative cancellation hook.
//!
//! Contexts form a tree: a child gets canceled as soon as its parent is canceled
//! or its deadline passes. Timeouts are expressed by waiting under a child
//! context with a deadline (see [`Ctx::with_timeout`]).
use crate::{signal, time};
use std::{fmt, future::Future, pin::Pin, sync::Arc, task};


/// Cancellation context.
/// We maintain an invariant `_parent.deadline <= deadline`.
/// If a parent gets canceled, the child also gets canceled immediately afterwards,
/// although not atomically.
pub struct Ctx(Arc<Inner>);

struct Inner {
    /// Signal sent once this context is canceled.
    canceled: Arc<signal::Once>,
    /// Deadline after which the context will be automatically canceled.
    deadline: time::Deadline,
    /// Parent context.
    _parent: Option<Arc<Inner>>,
}

impl Drop for Inner {
    fn drop(&mut self) {
        // Wakes the task propagating parent cancellation, so that it doesn't leak.
        self.canceled.send();
    }
}

/// Error returned when the blocking operation was interrupted
/// due to context getting canceled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("canceled")]
pub struct Canceled;

/// Wraps result with `Canceled` as an error.
pub type OrCanceled<T> = Result<T, Canceled>;

/// Blocks the current thread until future f is completed, using
/// the local tokio runtime.
/// Blocking.
#[track_caller]
pub(crate) fn block_on<F: Future>(f: F) -> F::Output {
    tokio::runtime::Handle::current().block_on(f)
}

/// Constructs a top-level context, which is never canceled.
pub fn root() -> Ctx {
    Ctx(Arc::new(Inner {
        canceled: Arc::new(signal::Once::new()),
        deadline: time::Deadline::Infinite,
        _parent: None,
    }))
}

impl fmt::Debug for Ctx {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        formatter
            .debug_struct("Ctx")
            .field("deadline", &self.0.deadline)
            .finish_non_exhaustive()
    }
}

/// Context-aware future, that an async task can await and
/// a blocking thread can block on.
#[must_use = "futures do nothing unless you `.await` or poll them"]
#[pin_project::pin_project]
pub struct CtxAware<F>(#[pin] pub(crate) F);

impl<F: Future> Future for CtxAware<F> {
    type Output = F::Output;
    fn poll(self: Pin<&mut Self>, cx: &mut task::Context<'_>) -> task::Poll<Self::Output> {
        self.project().0.poll(cx)
    }
}

impl<F: Future> CtxAware<F> {
    /// Blocks the current thread until the future is completed.
    /// Must be called outside of the async context (e.g. from `spawn_blocking`).
    pub fn block(self) -> F::Output {
        block_on(self)
    }
}

impl Ctx {
    /// Constructs a new child context.
    pub(crate) fn child(&self, deadline: time::Deadline) -> Self {
        let deadline = std::cmp::min(self.0.deadline, deadline);
        let parent_canceled = self.0.canceled.clone();
        let child_canceled = Arc::new(signal::Once::new());
        let child = Self(Arc::new(Inner {
            canceled: child_canceled.clone(),
            deadline,
            _parent: Some(self.0.clone()),
        }));
        // Propagate cancelation. The task holds only the signals (not the contexts),
        // so that dropping the child terminates it.
        tokio::spawn(async move {
            let expired = async move {
                match deadline {
                    time::Deadline::Finite(t) => tokio::time::sleep_until(t).await,
                    time::Deadline::Infinite => std::future::pending().await,
                }
            };
            tokio::select! {
                () = expired => child_canceled.send(),
                () = parent_canceled.recv() => child_canceled.send(),
                () = child_canceled.recv() => {},
            }
        });
        child
    }

    /// Cancels this context and (asynchronously) all its descendants.
    pub fn cancel(&self) {
        self.0.canceled.send();
    }

    /// Awaits until this context gets canceled.
    pub fn canceled(&self) -> CtxAware<impl '_ + Future<Output = ()>> {
        CtxAware(self.0.canceled.recv())
    }

    /// Checks if this context is still active (i.e., not canceled).
    pub fn is_active(&self) -> bool {
        !self.0.canceled.is_sent()
    }

    /// The time at which this context will be canceled.
    pub fn deadline(&self) -> time::Deadline {
        self.0.deadline
    }

    /// Awaits until the provided future `fut` completes, or the context gets canceled.
    /// `fut` is required to be cancel-safe.
    pub fn wait<'a, F: 'a + Future>(
        &'a self,
        fut: F,
    ) -> CtxAware<impl 'a + Future<Output = OrCanceled<F::Output>>> {
        CtxAware(async {
            tokio::select! {
                output = fut => Ok(output),
                () = self.0.canceled.recv() => Err(Canceled),
            }
        })
    }

    /// Constructs a sub-context with deadline `d`.
    pub fn with_deadline(&self, d: time::Deadline) -> Self {
        self.child(d)
    }

    /// Constructs a sub-context with deadline `now() + d`.
    pub fn with_timeout(&self, d: time::Duration) -> Self {
        self.child(time::add(self.now(), d))
    }

    /// Constructs a sub-context which gets canceled only
    /// when `self` gets canceled (or via [`Ctx::cancel`]).
    pub fn with_cancel(&self) -> Self {
        self.child(time::Deadline::Infinite)
    }

    /// Current time according to the monotone clock.
    pub fn now(&self) -> time::Instant {
        time::Instant::now()
    }

    /// Waits for `d` to pass.
    pub fn sleep(&self, d: time::Duration) -> CtxAware<impl '_ + Future<Output = OrCanceled<()>>> {
        self.wait(tokio::time::sleep(time::to_std(d)))
    }

    /// Waits until `t`.
    pub fn sleep_until(
        &self,
        t: time::Instant,
    ) -> CtxAware<impl '_ + Future<Output = OrCanceled<()>>> {
        self.wait(tokio::time::sleep_until(t))
    }
}

/// anyhow::Error + "canceled" variant.
/// Convenient task error type for callers which don't need structured errors,
/// but need to handle cancelation explicitly.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// Context has been canceled before call completion.
    #[error(transparent)]
    Canceled(#[from] Canceled),
    /// Other error.
    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}
