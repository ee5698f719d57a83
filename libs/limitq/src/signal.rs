//! Cancelation flag shared between a `Ctx` and its propagation task.

/// Flag which gets set at most once and can be awaited by any number of tasks.
/// Backed by a semaphore which never has permits: setting the flag closes it,
/// which wakes every pending `acquire()`.
#[derive(Debug)]
pub(crate) struct Once(tokio::sync::Semaphore);

impl Once {
    pub(crate) fn new() -> Self {
        Self(tokio::sync::Semaphore::new(0))
    }

    /// Sets the flag. Idempotent.
    pub(crate) fn send(&self) {
        self.0.close();
    }

    /// Waits until the flag is set. Cancel-safe.
    pub(crate) async fn recv(&self) {
        // The semaphore has no permits, so `acquire` can only fail with "closed".
        let _ = self.0.acquire().await;
    }

    pub(crate) fn is_sent(&self) -> bool {
        self.0.is_closed()
    }
}
