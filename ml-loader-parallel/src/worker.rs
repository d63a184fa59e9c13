//! Worker offload: runs the upstream sub-pipeline in dedicated worker threads
//!
//! Every worker opens its own instance of the upstream sub-pipeline with a
//! [`WorkerInfo`] in its context and sends results over a private bounded
//! channel. The consumer visits the workers round-robin. Each pass over a pool
//! is an epoch: starting a pass bumps the epoch and signals every worker, and
//! messages tagged with an older epoch are discarded.

use std::collections::VecDeque;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use crossbeam::channel::{self, Receiver, RecvTimeoutError, SendTimeoutError, Sender, TryRecvError};
use ml_loader_core::lifecycle::{panic_message, wait_for_zero, POLL_INTERVAL};
use ml_loader_core::{
    Error, Item, ItemStream, Lifecycle, OpenContext, Result, Role, Stage, StageWrapper, Upstream,
    WorkerInfo,
};
use tracing::{debug, trace, warn};

enum Command {
    Start(u64),
    Shutdown,
}

enum Message<T> {
    Item(u64, T),
    Failed(u64, String),
    Done(u64),
}

/// How a worker's pass ended
enum PassEnd {
    Finished,
    Abandoned,
    Stopped,
}

struct WorkerHandle<T> {
    control: Sender<Command>,
    results: Receiver<Message<T>>,
}

/// State shared between a pool and its worker threads
struct PoolSignals {
    epoch: AtomicU64,
    shutdown: AtomicBool,
    alive: AtomicUsize,
}

/// A set of worker threads serving passes over one sub-pipeline
struct WorkerPool<T> {
    name: String,
    workers: Vec<WorkerHandle<T>>,
    signals: Arc<PoolSignals>,
    grace: Duration,
}

impl<T: Item> WorkerPool<T> {
    fn spawn(
        name: &str,
        num_workers: usize,
        capacity: usize,
        upstream: &Upstream<T>,
        ctx: &OpenContext,
    ) -> Result<Arc<Self>> {
        let signals = Arc::new(PoolSignals {
            epoch: AtomicU64::new(0),
            shutdown: AtomicBool::new(false),
            alive: AtomicUsize::new(0),
        });
        let mut pool = Self {
            name: name.to_string(),
            workers: Vec::with_capacity(num_workers),
            signals,
            grace: ctx.lifecycle().grace(),
        };

        for id in 0..num_workers {
            let (control_tx, control_rx) = channel::unbounded();
            let (result_tx, result_rx) = channel::bounded(capacity);
            let worker = Worker {
                id,
                upstream: upstream.clone(),
                ctx: ctx.clone().with_worker(WorkerInfo { id, num_workers }),
                control: control_rx,
                results: result_tx,
                signals: pool.signals.clone(),
            };

            pool.signals.alive.fetch_add(1, Ordering::SeqCst);
            let spawned = ctx
                .lifecycle()
                .spawn(format!("{name}-worker-{id}"), move || worker.run());
            if let Err(e) = spawned {
                pool.signals.alive.fetch_sub(1, Ordering::SeqCst);
                pool.shutdown();
                return Err(e);
            }
            pool.workers.push(WorkerHandle {
                control: control_tx,
                results: result_rx,
            });
        }

        debug!(stage = %name, num_workers, capacity, "Worker pool started");
        Ok(Arc::new(pool))
    }

    fn current_epoch(&self) -> u64 {
        self.signals.epoch.load(Ordering::SeqCst)
    }

    fn is_shut_down(&self) -> bool {
        self.signals.shutdown.load(Ordering::SeqCst)
    }

    /// Begin a new epoch and signal every worker
    fn start_pass(&self) -> Result<u64> {
        let epoch = self.signals.epoch.fetch_add(1, Ordering::SeqCst) + 1;
        for (id, worker) in self.workers.iter().enumerate() {
            worker
                .control
                .send(Command::Start(epoch))
                .map_err(|_| Error::WorkerFailure {
                    worker: id,
                    reason: "worker exited unexpectedly".into(),
                })?;
        }
        debug!(stage = %self.name, epoch, "Pass started");
        Ok(epoch)
    }

    /// Make workers drop `epoch` if it is still the current one
    fn abandon(&self, epoch: u64) {
        if self
            .signals
            .epoch
            .compare_exchange(epoch, epoch + 1, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
        {
            debug!(stage = %self.name, epoch, "Pass abandoned");
        }
    }

    fn shutdown(&self) {
        if self.signals.shutdown.swap(true, Ordering::SeqCst) {
            return;
        }
        for worker in &self.workers {
            let _ = worker.control.send(Command::Shutdown);
        }

        let remaining = wait_for_zero(&self.signals.alive, self.grace);
        if remaining > 0 {
            warn!(
                stage = %self.name,
                remaining,
                "Workers did not exit within grace period, detaching"
            );
        } else {
            debug!(stage = %self.name, "Worker pool shut down");
        }
    }
}

/// Everything one worker thread owns
struct Worker<T: Item> {
    id: usize,
    upstream: Upstream<T>,
    ctx: OpenContext,
    control: Receiver<Command>,
    results: Sender<Message<T>>,
    signals: Arc<PoolSignals>,
}

/// Decrements the pool's live-worker count when the thread exits
struct AliveGuard(Arc<PoolSignals>);

impl Drop for AliveGuard {
    fn drop(&mut self) {
        self.0.alive.fetch_sub(1, Ordering::SeqCst);
    }
}

impl<T: Item> Worker<T> {
    fn run(self) {
        let _alive = AliveGuard(self.signals.clone());
        debug!(worker = self.id, "Worker started");

        loop {
            let command = match self.control.recv_timeout(POLL_INTERVAL) {
                Ok(command) => command,
                Err(RecvTimeoutError::Timeout) => {
                    if self.should_stop() {
                        break;
                    }
                    continue;
                }
                Err(RecvTimeoutError::Disconnected) => break,
            };

            match command {
                Command::Shutdown => break,
                Command::Start(epoch) => match self.serve(epoch) {
                    PassEnd::Finished | PassEnd::Abandoned => {}
                    PassEnd::Stopped => break,
                },
            }
        }

        debug!(worker = self.id, "Worker exited");
    }

    fn should_stop(&self) -> bool {
        self.signals.shutdown.load(Ordering::SeqCst) || self.ctx.is_cancelled()
    }

    fn is_current(&self, epoch: u64) -> bool {
        self.signals.epoch.load(Ordering::SeqCst) == epoch
    }

    /// Run one pass, reporting a panic as a failure of that pass
    fn serve(&self, epoch: u64) -> PassEnd {
        match panic::catch_unwind(AssertUnwindSafe(|| self.pass(epoch))) {
            Ok(end) => end,
            Err(payload) => {
                let reason = panic_message(payload.as_ref());
                warn!(worker = self.id, epoch, reason = %reason, "Worker panicked");
                self.deliver(epoch, Message::Failed(epoch, reason))
                    .unwrap_or(PassEnd::Finished)
            }
        }
    }

    fn pass(&self, epoch: u64) -> PassEnd {
        if !self.is_current(epoch) {
            return PassEnd::Abandoned;
        }

        let input = match self.upstream.open_single(&self.ctx) {
            Ok(input) => input,
            Err(e) => {
                return self
                    .deliver(epoch, Message::Failed(epoch, e.to_string()))
                    .unwrap_or(PassEnd::Finished);
            }
        };

        for item in input {
            if !self.is_current(epoch) {
                trace!(worker = self.id, epoch, "Epoch superseded");
                return PassEnd::Abandoned;
            }
            match item {
                Ok(item) => {
                    if let Some(end) = self.deliver(epoch, Message::Item(epoch, item)) {
                        return end;
                    }
                }
                Err(e) => {
                    warn!(worker = self.id, epoch, error = %e, "Worker sub-pipeline failed");
                    return self
                        .deliver(epoch, Message::Failed(epoch, e.to_string()))
                        .unwrap_or(PassEnd::Finished);
                }
            }
        }

        self.deliver(epoch, Message::Done(epoch))
            .unwrap_or(PassEnd::Finished)
    }

    /// Send a message, polling for shutdown and epoch changes while the
    /// channel is full; `None` means delivered
    fn deliver(&self, epoch: u64, mut message: Message<T>) -> Option<PassEnd> {
        loop {
            match self.results.send_timeout(message, POLL_INTERVAL) {
                Ok(()) => return None,
                Err(SendTimeoutError::Timeout(returned)) => {
                    if self.should_stop() {
                        return Some(PassEnd::Stopped);
                    }
                    if !self.is_current(epoch) {
                        return Some(PassEnd::Abandoned);
                    }
                    message = returned;
                }
                Err(SendTimeoutError::Disconnected(_)) => return Some(PassEnd::Stopped),
            }
        }
    }
}

type FailureSlot = Arc<Mutex<Option<(usize, String)>>>;

/// Stage running its single upstream in `num_workers` worker threads
///
/// With zero workers the upstream is iterated directly on the caller's
/// thread. A persistent stage keeps its pool across passes until
/// [`Stage::close`]; otherwise every pass starts and stops its own pool.
/// After a worker failure the stage refuses further passes.
pub struct WorkerOffload<T: Item> {
    name: String,
    num_workers: usize,
    persistent: bool,
    prefetch_factor: usize,
    pool: Mutex<Option<Arc<WorkerPool<T>>>>,
    failure: FailureSlot,
    pools_started: AtomicUsize,
}

impl<T: Item> WorkerOffload<T> {
    /// Create an offload stage
    pub fn new(num_workers: usize, persistent: bool, prefetch_factor: usize) -> Result<Self> {
        if prefetch_factor == 0 {
            return Err(Error::InvalidConfiguration(
                "prefetch_factor must be a positive integer".into(),
            ));
        }
        Ok(Self {
            name: "worker_offload".to_string(),
            num_workers,
            persistent,
            prefetch_factor,
            pool: Mutex::new(None),
            failure: Arc::new(Mutex::new(None)),
            pools_started: AtomicUsize::new(0),
        })
    }

    /// Number of worker threads per pass
    pub fn num_workers(&self) -> usize {
        self.num_workers
    }

    /// Whether workers survive across passes
    pub fn is_persistent(&self) -> bool {
        self.persistent
    }

    /// Number of pools started so far
    pub fn pools_started(&self) -> usize {
        self.pools_started.load(Ordering::SeqCst)
    }

    fn spawn_pool(&self, upstream: &Upstream<T>, ctx: &OpenContext) -> Result<Arc<WorkerPool<T>>> {
        let pool = WorkerPool::spawn(
            &self.name,
            self.num_workers,
            self.prefetch_factor,
            upstream,
            ctx,
        )?;
        self.pools_started.fetch_add(1, Ordering::SeqCst);
        Ok(pool)
    }
}

impl<T: Item> Stage<T> for WorkerOffload<T> {
    fn name(&self) -> &str {
        &self.name
    }

    fn role(&self) -> Role {
        Role::WorkerOffload
    }

    fn open(&self, upstream: Upstream<T>, ctx: &OpenContext) -> Result<ItemStream<T>> {
        if self.num_workers == 0 {
            return upstream.open_single(ctx);
        }
        if let Some((worker, reason)) = self
            .failure
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
        {
            return Err(Error::WorkerFailure { worker, reason });
        }

        let (pool, owned) = if self.persistent {
            let mut slot = self.pool.lock().unwrap_or_else(PoisonError::into_inner);
            let pool = match slot.as_ref() {
                Some(pool) if !pool.is_shut_down() => pool.clone(),
                _ => {
                    let pool = self.spawn_pool(&upstream, ctx)?;
                    *slot = Some(pool.clone());
                    pool
                }
            };
            (pool, false)
        } else {
            (self.spawn_pool(&upstream, ctx)?, true)
        };

        let epoch = match pool.start_pass() {
            Ok(epoch) => epoch,
            Err(e) => {
                pool.shutdown();
                return Err(e);
            }
        };

        Ok(Box::new(PassStream {
            active: vec![true; pool.workers.len()],
            pool,
            epoch,
            cursor: 0,
            owned,
            failure: self.failure.clone(),
            lifecycle: ctx.lifecycle().clone(),
            state: PassState::Running,
        }))
    }

    fn close(&self) {
        let pool = self
            .pool
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(pool) = pool {
            pool.shutdown();
        }
    }
}

enum PassState<T> {
    Running,
    Flushing(VecDeque<T>, Error),
    Finished,
}

/// Consumer side of one pass over a worker pool
struct PassStream<T: Item> {
    pool: Arc<WorkerPool<T>>,
    epoch: u64,
    active: Vec<bool>,
    cursor: usize,
    owned: bool,
    failure: FailureSlot,
    lifecycle: Arc<Lifecycle>,
    state: PassState<T>,
}

impl<T: Item> PassStream<T> {
    fn next_active(&self) -> Option<usize> {
        let n = self.active.len();
        (0..n)
            .map(|offset| (self.cursor + offset) % n)
            .find(|w| self.active[*w])
    }

    /// Collect items the other workers already transported for this epoch
    fn drain_others(&self, failed: usize) -> VecDeque<T> {
        let mut drained = VecDeque::new();
        for (id, worker) in self.pool.workers.iter().enumerate() {
            if id == failed || !self.active[id] {
                continue;
            }
            loop {
                match worker.results.try_recv() {
                    Ok(Message::Item(epoch, item)) if epoch == self.epoch => drained.push_back(item),
                    Ok(Message::Item(..)) => {}
                    Ok(Message::Done(_) | Message::Failed(..))
                    | Err(TryRecvError::Empty | TryRecvError::Disconnected) => break,
                }
            }
        }
        drained
    }

    fn fail(&mut self, worker: usize, reason: String) {
        warn!(worker, epoch = self.epoch, reason = %reason, "Worker failed");
        *self.failure.lock().unwrap_or_else(PoisonError::into_inner) = Some((worker, reason.clone()));
        let drained = self.drain_others(worker);
        self.state = PassState::Flushing(drained, Error::WorkerFailure { worker, reason });
    }

    fn finish(&mut self) {
        self.state = PassState::Finished;
        if self.owned || self.failure.lock().unwrap_or_else(PoisonError::into_inner).is_some() {
            self.pool.shutdown();
        }
    }
}

impl<T: Item> Iterator for PassStream<T> {
    type Item = Result<T>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            match &mut self.state {
                PassState::Finished => return None,
                PassState::Flushing(queue, _) => {
                    if let Some(item) = queue.pop_front() {
                        return Some(Ok(item));
                    }
                    let state = std::mem::replace(&mut self.state, PassState::Finished);
                    self.finish();
                    if let PassState::Flushing(_, error) = state {
                        return Some(Err(error));
                    }
                    return None;
                }
                PassState::Running => {}
            }

            if self.pool.current_epoch() != self.epoch {
                self.state = PassState::Finished;
                return Some(Err(Error::stage(
                    "pass superseded by a newer pass over the same workers",
                )));
            }
            if self.lifecycle.is_cancelled() {
                self.finish();
                return None;
            }
            let Some(worker) = self.next_active() else {
                trace!(epoch = self.epoch, "All workers finished");
                self.finish();
                return None;
            };

            match self.pool.workers[worker].results.recv_timeout(POLL_INTERVAL) {
                Ok(Message::Item(epoch, item)) if epoch == self.epoch => {
                    self.cursor = worker + 1;
                    trace!(worker, epoch, "Received item");
                    return Some(Ok(item));
                }
                Ok(Message::Done(epoch)) if epoch == self.epoch => {
                    self.active[worker] = false;
                }
                Ok(Message::Failed(epoch, reason)) if epoch == self.epoch => {
                    self.active[worker] = false;
                    self.fail(worker, reason);
                }
                Ok(_) => trace!(worker, "Discarded stale message"),
                Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => {
                    self.active[worker] = false;
                    self.fail(worker, "worker exited unexpectedly".to_string());
                }
            }
        }
    }
}

impl<T: Item> Drop for PassStream<T> {
    fn drop(&mut self) {
        if matches!(self.state, PassState::Finished) {
            return;
        }
        let failed = self.failure.lock().unwrap_or_else(PoisonError::into_inner).is_some();
        if self.owned || failed {
            self.pool.shutdown();
        } else {
            self.pool.abandon(self.epoch);
        }
    }
}

/// Inserts a [`WorkerOffload`] above each matched stage
#[derive(Debug, Clone, Copy)]
pub struct OffloadWrapper {
    num_workers: usize,
    persistent: bool,
    prefetch_factor: usize,
}

impl OffloadWrapper {
    /// Create a wrapper inserting offload stages with the given settings
    pub fn new(num_workers: usize, persistent: bool, prefetch_factor: usize) -> Self {
        Self {
            num_workers,
            persistent,
            prefetch_factor,
        }
    }
}

impl<T: Item> StageWrapper<T> for OffloadWrapper {
    fn role(&self) -> Role {
        Role::WorkerOffload
    }

    fn wrap(&self, _target: &dyn Stage<T>) -> Result<Arc<dyn Stage<T>>> {
        Ok(Arc::new(WorkerOffload::<T>::new(
            self.num_workers,
            self.persistent,
            self.prefetch_factor,
        )?))
    }
}
