//! Cancellation and background-thread bookkeeping shared by a loader's stages

use std::any::Any;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use tracing::{debug, warn};

use crate::error::Result;

/// How often blocked background loops re-check for cancellation
pub const POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Default time allowed for background threads to exit on shutdown
pub const DEFAULT_SHUTDOWN_GRACE: Duration = Duration::from_secs(2);

struct Tracked {
    name: String,
    handle: JoinHandle<()>,
}

/// Outcome of joining background threads
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ShutdownReport {
    /// Threads that exited within the grace period
    pub joined: usize,

    /// Threads still running at the deadline, left detached
    pub detached: usize,
}

impl ShutdownReport {
    /// Whether every thread exited in time
    pub fn is_clean(&self) -> bool {
        self.detached == 0
    }
}

/// Cancellation flag and thread registry for one loader
///
/// Every background context a stage starts (worker threads, prefetch
/// threads) is spawned through the lifecycle so that closing the loader can
/// signal and join all of them.
pub struct Lifecycle {
    cancelled: AtomicBool,
    live: Arc<AtomicUsize>,
    threads: Mutex<Vec<Tracked>>,
    grace: Duration,
}

/// Decrements the live-thread counter when a tracked thread exits, including
/// by unwinding
struct LiveGuard(Arc<AtomicUsize>);

impl Drop for LiveGuard {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

impl Lifecycle {
    /// Create a lifecycle with the given shutdown grace period
    pub fn new(grace: Duration) -> Arc<Self> {
        Arc::new(Self {
            cancelled: AtomicBool::new(false),
            live: Arc::new(AtomicUsize::new(0)),
            threads: Mutex::new(Vec::new()),
            grace,
        })
    }

    /// Shutdown grace period
    pub fn grace(&self) -> Duration {
        self.grace
    }

    /// Whether cancellation was requested
    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    /// Ask every background loop to stop pulling
    pub fn cancel(&self) {
        if !self.cancelled.swap(true, Ordering::SeqCst) {
            debug!("Lifecycle cancelled");
        }
    }

    /// Number of tracked threads that have not exited yet
    pub fn live_threads(&self) -> usize {
        self.live.load(Ordering::SeqCst)
    }

    /// Spawn a named, tracked background thread
    pub fn spawn<F>(&self, name: impl Into<String>, f: F) -> Result<()>
    where
        F: FnOnce() + Send + 'static,
    {
        let name = name.into();
        let guard = LiveGuard(self.live.clone());
        self.live.fetch_add(1, Ordering::SeqCst);

        let handle = thread::Builder::new().name(name.clone()).spawn(move || {
            let _guard = guard;
            f();
        })?;

        let mut threads = self.threads.lock().unwrap_or_else(PoisonError::into_inner);
        threads.retain(|t| !t.handle.is_finished());
        threads.push(Tracked { name, handle });
        Ok(())
    }

    /// Join every tracked thread, sharing one grace-period deadline
    pub fn join_all(&self) -> ShutdownReport {
        let threads: Vec<Tracked> = {
            let mut guard = self.threads.lock().unwrap_or_else(PoisonError::into_inner);
            guard.drain(..).collect()
        };

        let deadline = Instant::now() + self.grace;
        let mut report = ShutdownReport::default();
        for Tracked { name, handle } in threads {
            if join_with_deadline(handle, deadline, &name) {
                report.joined += 1;
            } else {
                report.detached += 1;
            }
        }
        report
    }
}

impl std::fmt::Debug for Lifecycle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Lifecycle")
            .field("cancelled", &self.is_cancelled())
            .field("live_threads", &self.live_threads())
            .field("grace", &self.grace)
            .finish()
    }
}

/// Join `handle` if it exits before `deadline`, otherwise detach it
///
/// Returns whether the thread was joined.
pub fn join_with_deadline(handle: JoinHandle<()>, deadline: Instant, name: &str) -> bool {
    loop {
        if handle.is_finished() {
            if handle.join().is_err() {
                warn!(thread = name, "Background thread exited by panicking");
            }
            return true;
        }
        if Instant::now() >= deadline {
            warn!(thread = name, "Background thread did not exit within grace period, detaching");
            return false;
        }
        thread::sleep(Duration::from_millis(1));
    }
}

/// Block until `counter` drops to zero or `grace` elapses
///
/// Returns the number of holders still alive at the deadline.
pub fn wait_for_zero(counter: &AtomicUsize, grace: Duration) -> usize {
    let deadline = Instant::now() + grace;
    loop {
        let live = counter.load(Ordering::SeqCst);
        if live == 0 || Instant::now() >= deadline {
            return live;
        }
        thread::sleep(Duration::from_millis(1));
    }
}

/// Render a panic payload caught with `catch_unwind`
pub fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(msg) = payload.downcast_ref::<&str>() {
        (*msg).to_string()
    } else if let Some(msg) = payload.downcast_ref::<String>() {
        msg.clone()
    } else {
        "panic with non-string payload".to_string()
    }
}
