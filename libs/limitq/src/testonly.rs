//! Testonly utilities for concurrent tests.
use std::{
    future::Future,
    io::IsTerminal as _,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
};

/// Installs a tracing subscriber writing to the test output and,
/// iff the current process is executed under nextest in process-per-test mode,
/// changes the behavior of the process to [panic=abort].
/// In particular it doesn't enable [panic=abort] when run via "cargo test",
/// so tests expecting a panic still work there.
pub fn abort_on_panic() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .with_ansi(std::env::var("NO_COLOR").is_err() && std::io::stdout().is_terminal())
        .with_line_number(true)
        .try_init();

    // https://nexte.st/book/env-vars.html#environment-variables-nextest-sets
    let Ok(nextest) = std::env::var("NEXTEST") else {
        return;
    };
    let Ok(mode) = std::env::var("NEXTEST_EXECUTION_MODE") else {
        return;
    };
    if nextest != "1" || mode != "process-per-test" {
        return;
    }
    tracing::info!("[panic=abort] enabled");
    let orig_hook = std::panic::take_hook();
    std::panic::set_hook(Box::new(move |panic_info| {
        orig_hook(panic_info);
        std::process::abort();
    }));
}

/// Executes a test under both flavors of the tokio runtime.
pub fn with_runtimes<Fut: Future>(test: impl Fn() -> Fut) {
    for (name, mut b) in [
        (
            "current_thread",
            tokio::runtime::Builder::new_current_thread(),
        ),
        ("multi_thread", tokio::runtime::Builder::new_multi_thread()),
    ] {
        tracing::info!("tokio runtime: {name}");
        let r = b.enable_all().build().unwrap();
        r.block_on(test());
    }
}

/// Tracks how many tasks are inside of a section at once,
/// and the maximum observed so far.
#[derive(Debug, Default, Clone)]
pub struct Probe(Arc<ProbeInner>);

#[derive(Debug, Default)]
struct ProbeInner {
    current: AtomicUsize,
    max: AtomicUsize,
    entered: AtomicUsize,
}

/// Marks a task as being inside of the section of a `Probe` until dropped.
#[derive(Debug)]
#[must_use]
pub struct ProbeGuard(Arc<ProbeInner>);

impl Drop for ProbeGuard {
    fn drop(&mut self) {
        self.0.current.fetch_sub(1, Ordering::SeqCst);
    }
}

impl Probe {
    /// Enters the section.
    pub fn enter(&self) -> ProbeGuard {
        let current = self.0.current.fetch_add(1, Ordering::SeqCst) + 1;
        self.0.max.fetch_max(current, Ordering::SeqCst);
        self.0.entered.fetch_add(1, Ordering::SeqCst);
        ProbeGuard(self.0.clone())
    }

    /// Number of tasks currently inside of the section.
    pub fn current(&self) -> usize {
        self.0.current.load(Ordering::SeqCst)
    }

    /// Maximal number of tasks inside of the section at once.
    pub fn max(&self) -> usize {
        self.0.max.load(Ordering::SeqCst)
    }

    /// Total number of times the section has been entered.
    pub fn entered(&self) -> usize {
        self.0.entered.load(Ordering::SeqCst)
    }
}
