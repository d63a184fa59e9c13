//! Ahead-of-time prefetcher: runs the upstream on a background thread

use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crossbeam::channel::{self, Receiver, RecvTimeoutError, SendTimeoutError, Sender};
use ml_loader_core::lifecycle::{panic_message, POLL_INTERVAL};
use ml_loader_core::{
    Error, Item, ItemStream, Lifecycle, OpenContext, Result, Role, Stage, StageWrapper, Upstream,
};
use tracing::{debug, trace, warn};

/// Stage pulling its single upstream on a background thread, at most
/// `buffer_size` items ahead of the consumer
///
/// The background thread holds one credit per item it may pull. It starts
/// with `buffer_size` credits and receives one back for every item the
/// consumer takes, so pulled-but-unconsumed items never exceed `buffer_size`.
#[derive(Debug, Clone)]
pub struct Prefetcher {
    name: String,
    buffer_size: usize,
}

impl Prefetcher {
    /// Create a prefetcher with the given look-ahead
    pub fn new(buffer_size: usize) -> Result<Self> {
        if buffer_size == 0 {
            return Err(Error::InvalidConfiguration(
                "prefetch buffer_size must be a positive integer".into(),
            ));
        }
        Ok(Self {
            name: "prefetcher".to_string(),
            buffer_size,
        })
    }

    /// Maximum look-ahead
    pub fn buffer_size(&self) -> usize {
        self.buffer_size
    }
}

impl<T: Item> Stage<T> for Prefetcher {
    fn name(&self) -> &str {
        &self.name
    }

    fn role(&self) -> Role {
        Role::Prefetcher
    }

    fn open(&self, upstream: Upstream<T>, ctx: &OpenContext) -> Result<ItemStream<T>> {
        let (data_tx, data_rx) = channel::bounded(self.buffer_size);
        let (credit_tx, credit_rx) = channel::unbounded();
        for _ in 0..self.buffer_size {
            credit_tx.send(()).map_err(|_| Error::Closed)?;
        }

        let stop = Arc::new(AtomicBool::new(false));
        let producer = Producer {
            upstream,
            ctx: ctx.clone(),
            data: data_tx,
            credits: credit_rx,
            stop: stop.clone(),
        };
        let thread_name = match ctx.worker() {
            Some(worker) => format!("{}-{}", self.name, worker.id),
            None => self.name.clone(),
        };
        ctx.lifecycle().spawn(thread_name, move || producer.run())?;
        debug!(stage = %self.name, buffer_size = self.buffer_size, "Prefetch thread started");

        Ok(Box::new(PrefetchStream {
            data: data_rx,
            credits: credit_tx,
            stop,
            lifecycle: ctx.lifecycle().clone(),
            done: false,
        }))
    }
}

/// Background side of a prefetch pass
struct Producer<T: Item> {
    upstream: Upstream<T>,
    ctx: OpenContext,
    data: Sender<Result<T>>,
    credits: Receiver<()>,
    stop: Arc<AtomicBool>,
}

impl<T: Item> Producer<T> {
    fn run(self) {
        match panic::catch_unwind(AssertUnwindSafe(|| self.produce())) {
            Ok(()) => trace!("Prefetch thread finished"),
            Err(payload) => {
                let reason = panic_message(payload.as_ref());
                warn!(reason = %reason, "Prefetch thread panicked");
                self.deliver(Err(Error::BackgroundFailure(reason)));
            }
        }
    }

    fn stopped(&self) -> bool {
        self.stop.load(Ordering::SeqCst) || self.ctx.is_cancelled()
    }

    fn produce(&self) {
        let mut input = match self.upstream.open_single(&self.ctx) {
            Ok(input) => input,
            Err(e) => {
                self.deliver(Err(e));
                return;
            }
        };

        while self.acquire_credit() {
            let Some(item) = input.next() else {
                return;
            };
            if !self.deliver(item) {
                return;
            }
        }
    }

    /// Wait for permission to pull one more item
    fn acquire_credit(&self) -> bool {
        loop {
            if self.stopped() {
                return false;
            }
            match self.credits.recv_timeout(POLL_INTERVAL) {
                Ok(()) => return true,
                Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => return false,
            }
        }
    }

    fn deliver(&self, mut item: Result<T>) -> bool {
        loop {
            match self.data.send_timeout(item, POLL_INTERVAL) {
                Ok(()) => return true,
                Err(SendTimeoutError::Timeout(returned)) => {
                    if self.stopped() {
                        return false;
                    }
                    item = returned;
                }
                Err(SendTimeoutError::Disconnected(_)) => return false,
            }
        }
    }
}

/// Consumer side of a prefetch pass
struct PrefetchStream<T> {
    data: Receiver<Result<T>>,
    credits: Sender<()>,
    stop: Arc<AtomicBool>,
    lifecycle: Arc<Lifecycle>,
    done: bool,
}

impl<T: Item> Iterator for PrefetchStream<T> {
    type Item = Result<T>;

    fn next(&mut self) -> Option<Self::Item> {
        while !self.done {
            if self.lifecycle.is_cancelled() {
                self.done = true;
                break;
            }
            match self.data.recv_timeout(POLL_INTERVAL) {
                Ok(item) => {
                    let _ = self.credits.send(());
                    return Some(item);
                }
                Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => self.done = true,
            }
        }
        None
    }
}

impl<T> Drop for PrefetchStream<T> {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::SeqCst);
    }
}

/// Inserts a [`Prefetcher`] above each matched stage
#[derive(Debug, Clone, Copy)]
pub struct PrefetchWrapper {
    buffer_size: usize,
}

impl PrefetchWrapper {
    /// Create a wrapper inserting prefetchers with the given look-ahead
    pub fn new(buffer_size: usize) -> Result<Self> {
        Prefetcher::new(buffer_size)?;
        Ok(Self { buffer_size })
    }
}

impl<T: Item> StageWrapper<T> for PrefetchWrapper {
    fn role(&self) -> Role {
        Role::Prefetcher
    }

    fn wrap(&self, _target: &dyn Stage<T>) -> Result<Arc<dyn Stage<T>>> {
        Ok(Arc::new(Prefetcher::new(self.buffer_size)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ml_loader_core::lifecycle::DEFAULT_SHUTDOWN_GRACE;
    use ml_loader_core::{Graph, ItemSampler, MapStage, PipelineBuilder};
    use std::sync::atomic::AtomicUsize;
    use std::thread;
    use std::time::{Duration, Instant};

    fn counted(items: u64, buffer_size: usize, pulled: Arc<AtomicUsize>) -> Graph<u64> {
        let mut builder = PipelineBuilder::new();
        let sampler = builder.add(ItemSampler::new(0..items), &[]).unwrap();
        let count = builder
            .add(
                MapStage::new("count", move |x: u64, _| {
                    pulled.fetch_add(1, Ordering::SeqCst);
                    Ok(x)
                }),
                &[sampler],
            )
            .unwrap();
        let prefetch = builder
            .add(Prefetcher::new(buffer_size).unwrap(), &[count])
            .unwrap();
        builder.build(prefetch).unwrap()
    }

    fn wait_until(mut condition: impl FnMut() -> bool) -> bool {
        let deadline = Instant::now() + Duration::from_secs(2);
        while Instant::now() < deadline {
            if condition() {
                return true;
            }
            thread::sleep(Duration::from_millis(5));
        }
        condition()
    }

    #[test]
    fn test_zero_buffer_is_rejected() {
        assert!(matches!(Prefetcher::new(0), Err(Error::InvalidConfiguration(_))));
        assert!(PrefetchWrapper::new(0).is_err());
    }

    #[test]
    fn test_order_is_preserved() {
        let lifecycle = Lifecycle::new(DEFAULT_SHUTDOWN_GRACE);
        let graph = counted(100, 3, Arc::new(AtomicUsize::new(0)));
        let items: Vec<u64> = graph
            .open(&OpenContext::new(lifecycle.clone()))
            .unwrap()
            .map(Result::unwrap)
            .collect();
        assert_eq!(items, (0..100).collect::<Vec<_>>());
        assert!(lifecycle.join_all().is_clean());
    }

    #[test]
    fn test_slow_consumer_bounds_look_ahead() {
        let lifecycle = Lifecycle::new(DEFAULT_SHUTDOWN_GRACE);
        let pulled = Arc::new(AtomicUsize::new(0));
        let graph = counted(5, 2, pulled.clone());

        let mut stream = graph.open(&OpenContext::new(lifecycle.clone())).unwrap();
        assert!(wait_until(|| pulled.load(Ordering::SeqCst) == 2));

        let mut consumed = 0;
        while let Some(item) = stream.next() {
            item.unwrap();
            consumed += 1;
            thread::sleep(Duration::from_millis(20));
            assert!(pulled.load(Ordering::SeqCst) <= consumed + 2);
        }
        assert_eq!(consumed, 5);
    }

    #[test]
    fn test_drop_stops_the_thread() {
        let lifecycle = Lifecycle::new(DEFAULT_SHUTDOWN_GRACE);
        let pulled = Arc::new(AtomicUsize::new(0));
        let graph = counted(10_000, 2, pulled.clone());

        let mut stream = graph.open(&OpenContext::new(lifecycle.clone())).unwrap();
        stream.next().unwrap().unwrap();
        drop(stream);

        assert!(wait_until(|| lifecycle.live_threads() == 0));
        assert!(pulled.load(Ordering::SeqCst) <= 3);
    }

    #[test]
    fn test_cancel_ends_stream_and_thread() {
        let lifecycle = Lifecycle::new(DEFAULT_SHUTDOWN_GRACE);
        let graph = counted(10_000, 2, Arc::new(AtomicUsize::new(0)));

        let mut stream = graph.open(&OpenContext::new(lifecycle.clone())).unwrap();
        stream.next().unwrap().unwrap();
        lifecycle.cancel();
        assert!(stream.next().is_none());
        assert!(lifecycle.join_all().is_clean());
    }

    #[test]
    fn test_upstream_panic_becomes_background_failure() {
        let lifecycle = Lifecycle::new(DEFAULT_SHUTDOWN_GRACE);
        let mut builder = PipelineBuilder::new();
        let sampler = builder.add(ItemSampler::new(0..3u64), &[]).unwrap();
        let boom = builder
            .add(
                MapStage::new("boom", |x: u64, _| -> Result<u64> {
                    if x == 1 {
                        panic!("loader thread exploded");
                    }
                    Ok(x)
                }),
                &[sampler],
            )
            .unwrap();
        let prefetch = builder.add(Prefetcher::new(2).unwrap(), &[boom]).unwrap();
        let graph = builder.build(prefetch).unwrap();

        let results: Vec<Result<u64>> = graph.open(&OpenContext::new(lifecycle.clone())).unwrap().collect();
        assert_eq!(results.len(), 2);
        assert_eq!(results[0].as_ref().unwrap(), &0);
        assert!(matches!(results[1], Err(Error::BackgroundFailure(_))));
    }
}
