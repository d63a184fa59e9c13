//! Devices and alternate execution streams used to overlap copies with compute

use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crossbeam::channel::{self, Receiver, Sender};
use tracing::{debug, trace};

use crate::error::{Error, Result};
use crate::item::{Completer, CompletionHandle};
use crate::lifecycle::{join_with_deadline, panic_message, DEFAULT_SHUTDOWN_GRACE};

/// Work submitted to an execution stream
pub type Job = Box<dyn FnOnce() -> Result<()> + Send + 'static>;

/// An ordered queue of asynchronous operations, executed concurrently with the
/// thread that submits them
pub trait ExecutionStream: Send + Sync {
    /// Stream name for logging
    fn name(&self) -> &str;

    /// Enqueue a job; the returned handle settles when the job finishes
    fn submit(&self, job: Job) -> Result<CompletionHandle>;

    /// Block until every job submitted so far has finished
    fn synchronize(&self) -> Result<()>;

    /// Stop accepting work and release the stream
    ///
    /// Jobs still queued are failed without running.
    fn shutdown(&self);
}

/// A device able to provide alternate execution streams
pub trait Device: Send + Sync {
    /// Device name for logging
    fn name(&self) -> &str;

    /// Whether the device can run work on an alternate stream
    fn supports_streams(&self) -> bool;

    /// Create a new alternate stream
    fn create_stream(&self) -> Result<Arc<dyn ExecutionStream>>;

    /// Limit the execution units copies may occupy, leaving the rest for
    /// compute running alongside them
    fn set_max_copy_units(&self, units: usize) -> Result<()>;
}

/// Device whose streams are dedicated host threads
#[derive(Debug)]
pub struct HostDevice {
    max_copy_units: AtomicUsize,
    streams_created: AtomicUsize,
}

impl HostDevice {
    /// Create a host device
    pub fn new() -> Self {
        Self {
            max_copy_units: AtomicUsize::new(0),
            streams_created: AtomicUsize::new(0),
        }
    }

    /// Current copy-unit limit (0 when never set)
    pub fn max_copy_units(&self) -> usize {
        self.max_copy_units.load(Ordering::SeqCst)
    }

    /// Number of streams created on this device
    pub fn streams_created(&self) -> usize {
        self.streams_created.load(Ordering::SeqCst)
    }
}

impl Default for HostDevice {
    fn default() -> Self {
        Self::new()
    }
}

impl Device for HostDevice {
    fn name(&self) -> &str {
        "host"
    }

    fn supports_streams(&self) -> bool {
        true
    }

    fn create_stream(&self) -> Result<Arc<dyn ExecutionStream>> {
        let index = self.streams_created.fetch_add(1, Ordering::SeqCst);
        let stream = HostStream::spawn(format!("host-stream-{index}"))?;
        Ok(Arc::new(stream))
    }

    fn set_max_copy_units(&self, units: usize) -> Result<()> {
        if units == 0 {
            return Err(Error::InvalidConfiguration(
                "max_concurrent_copy_units must be a positive integer".into(),
            ));
        }
        self.max_copy_units.store(units, Ordering::SeqCst);
        Ok(())
    }
}

struct Task {
    job: Job,
    completer: Completer,
}

/// Execution stream backed by one host thread running jobs in FIFO order
pub struct HostStream {
    name: String,
    sender: Mutex<Option<Sender<Task>>>,
    worker: Mutex<Option<JoinHandle<()>>>,
    closed: Arc<AtomicBool>,
    grace: Duration,
}

impl HostStream {
    /// Start a stream thread
    pub fn spawn(name: impl Into<String>) -> Result<Self> {
        let name = name.into();
        let (sender, receiver) = channel::unbounded::<Task>();
        let closed = Arc::new(AtomicBool::new(false));

        let thread_closed = closed.clone();
        let worker = thread::Builder::new()
            .name(name.clone())
            .spawn(move || run_stream(&receiver, &thread_closed))?;

        debug!(stream = %name, "Execution stream started");
        Ok(Self {
            name,
            sender: Mutex::new(Some(sender)),
            worker: Mutex::new(Some(worker)),
            closed,
            grace: DEFAULT_SHUTDOWN_GRACE,
        })
    }
}

fn run_stream(receiver: &Receiver<Task>, closed: &AtomicBool) {
    for Task { job, completer } in receiver {
        if closed.load(Ordering::SeqCst) {
            completer.fail("execution stream shut down");
            continue;
        }
        match panic::catch_unwind(AssertUnwindSafe(job)) {
            Ok(Ok(())) => completer.complete(),
            Ok(Err(e)) => completer.fail(e.to_string()),
            Err(payload) => completer.fail(panic_message(payload.as_ref())),
        }
    }
}

impl ExecutionStream for HostStream {
    fn name(&self) -> &str {
        &self.name
    }

    fn submit(&self, job: Job) -> Result<CompletionHandle> {
        let sender = self.sender.lock().unwrap_or_else(PoisonError::into_inner);
        let sender = sender.as_ref().ok_or(Error::Closed)?;

        let (completer, handle) = CompletionHandle::pending();
        sender
            .send(Task { job, completer })
            .map_err(|_| Error::Closed)?;
        trace!(stream = %self.name, "Job submitted");
        Ok(handle)
    }

    fn synchronize(&self) -> Result<()> {
        self.submit(Box::new(|| -> Result<()> { Ok(()) }))?.wait()
    }

    fn shutdown(&self) {
        self.closed.store(true, Ordering::SeqCst);
        self.sender
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();

        let worker = self
            .worker
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(worker) = worker {
            join_with_deadline(worker, Instant::now() + self.grace, &self.name);
            debug!(stream = %self.name, "Execution stream shut down");
        }
    }
}

impl Drop for HostStream {
    fn drop(&mut self) {
        self.shutdown();
    }
}
