//! The data loader: composes the stage graph, rewrites it and drives passes

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use ml_loader_core::{
    wrap_parents_of, wrap_stages, Device, EndMarker, Error, ExecutionStream, Graph, Item,
    ItemStream, Lifecycle, LoaderConfig, OpenContext, PipelineBuilder, Result, Role,
    ShutdownReport, StageId,
};
use ml_loader_parallel::{
    AwaiterWrapper, BufferWrapper, OffloadWrapper, PrefetchWrapper, ShardingWrapper,
};
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Apply the loader's rewrite passes to `graph`, in order:
///
/// 1. a sharding splitter after every item sampler
/// 2. worker offload at the parent of every feature fetcher
/// 3. when `stream` is given, attach it to every feature fetcher and wrap the
///    end marker's parent with a bounded buffer and then a completion awaiter
/// 4. a prefetcher at the parent of every device copy
///
/// Running the passes again over an already rewritten graph leaves it
/// unchanged.
pub fn apply_rewrites<T: Item>(
    graph: &mut Graph<T>,
    config: &LoaderConfig,
    stream: Option<&Arc<dyn ExecutionStream>>,
) -> Result<()> {
    wrap_stages(graph, &Role::ItemSampler, &ShardingWrapper)?;

    let offload = OffloadWrapper::new(
        config.num_workers,
        config.effective_persistent(),
        config.prefetch_factor,
    );
    let index = graph.adjacency();
    wrap_parents_of(graph, &index, &Role::FeatureFetcher, &offload)?;

    if let Some(stream) = stream {
        for fetcher in graph.find(&Role::FeatureFetcher) {
            graph.attach_stream(fetcher, stream.clone())?;
        }
        if !overlap_applied(graph)? {
            let index = graph.adjacency();
            wrap_parents_of(
                graph,
                &index,
                &Role::EndMarker,
                &BufferWrapper::new(config.buffer_size)?,
            )?;
            let index = graph.adjacency();
            wrap_parents_of(graph, &index, &Role::EndMarker, &AwaiterWrapper)?;
        }
    }

    let index = graph.adjacency();
    wrap_parents_of(
        graph,
        &index,
        &Role::DeviceCopy,
        &PrefetchWrapper::new(config.buffer_size)?,
    )?;
    Ok(())
}

/// Whether every end marker already pulls through a completion awaiter
fn overlap_applied<T: Item>(graph: &Graph<T>) -> Result<bool> {
    for end in graph.find(&Role::EndMarker) {
        for parent in graph.parents(end)? {
            if graph.role(*parent)? != Role::Awaiter {
                return Ok(false);
            }
        }
    }
    Ok(true)
}

/// A staged data loader
///
/// Construction wraps the caller's terminal stage in an end marker and
/// rewrites the graph once. Each call to [`DataLoader::iter`] then runs one
/// full pass. Closing (explicitly or on drop) cancels every background
/// context, shuts down worker pools and the alternate stream, and joins the
/// loader's threads within the configured grace period.
pub struct DataLoader<T: Item> {
    id: Uuid,
    graph: Graph<T>,
    config: LoaderConfig,
    lifecycle: Arc<Lifecycle>,
    stream: Option<Arc<dyn ExecutionStream>>,
    closed: AtomicBool,
}

impl<T: Item> DataLoader<T> {
    /// Create a loader without an accelerator device
    pub fn new(builder: PipelineBuilder<T>, terminal: StageId, config: LoaderConfig) -> Result<Self> {
        Self::with_device(builder, terminal, config, None)
    }

    /// Create a loader that may overlap feature fetching on `device`
    pub fn with_device(
        mut builder: PipelineBuilder<T>,
        terminal: StageId,
        config: LoaderConfig,
        device: Option<Arc<dyn Device>>,
    ) -> Result<Self> {
        config.validate()?;
        let id = Uuid::new_v4();

        let end = builder.add(EndMarker::new(), &[terminal])?;
        let mut graph = builder.build(end)?;

        let stream = match device {
            Some(device)
                if config.overlap_feature_fetch
                    && config.num_workers == 0
                    && device.supports_streams() =>
            {
                device.set_max_copy_units(config.max_concurrent_copy_units)?;
                let stream = device.create_stream()?;
                debug!(loader = %id, device = device.name(), stream = stream.name(), "Overlapping feature fetch");
                Some(stream)
            }
            Some(device) if config.overlap_feature_fetch => {
                debug!(
                    loader = %id,
                    device = device.name(),
                    num_workers = config.num_workers,
                    "Feature fetch overlap not applicable"
                );
                None
            }
            _ => None,
        };

        if let Err(e) = apply_rewrites(&mut graph, &config, stream.as_ref()) {
            if let Some(stream) = &stream {
                stream.shutdown();
            }
            return Err(e);
        }

        info!(
            loader = %id,
            stages = graph.stage_count(),
            num_workers = config.num_workers,
            persistent = config.effective_persistent(),
            overlap = stream.is_some(),
            "Data loader ready"
        );
        debug!(loader = %id, graph = %graph.describe(), "Rewritten pipeline");

        let lifecycle = Lifecycle::new(config.shutdown_grace());
        Ok(Self {
            id,
            graph,
            config,
            lifecycle,
            stream,
            closed: AtomicBool::new(false),
        })
    }

    /// Unique id of this loader, used as the `loader` field in logs
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Configuration the loader was built with
    pub fn config(&self) -> &LoaderConfig {
        &self.config
    }

    /// The rewritten graph
    pub fn graph(&self) -> &Graph<T> {
        &self.graph
    }

    /// Whether feature fetching runs on an alternate stream
    pub fn overlap_active(&self) -> bool {
        self.stream.is_some()
    }

    /// Background threads of this loader that have not exited yet
    pub fn live_background_threads(&self) -> usize {
        self.lifecycle.live_threads()
    }

    /// Whether the loader was closed
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Start a full pass over the pipeline
    pub fn iter(&self) -> Result<LoaderIter<T>> {
        if self.is_closed() {
            return Err(Error::Closed);
        }
        let ctx = OpenContext::new(self.lifecycle.clone());
        let inner = self.graph.open(&ctx)?;
        debug!(loader = %self.id, "Pass started");
        Ok(LoaderIter {
            inner,
            lifecycle: self.lifecycle.clone(),
            loader: self.id,
            yielded: 0,
            done: false,
        })
    }

    /// Stop every background context and release the loader's resources
    ///
    /// Iterators still alive end at their next pull. Calling `close` again
    /// returns an empty report.
    pub fn close(&self) -> ShutdownReport {
        if self.closed.swap(true, Ordering::SeqCst) {
            return ShutdownReport::default();
        }

        self.lifecycle.cancel();
        self.graph.close_all();
        if let Some(stream) = &self.stream {
            stream.shutdown();
        }

        let report = self.lifecycle.join_all();
        if report.is_clean() {
            info!(loader = %self.id, joined = report.joined, "Data loader closed");
        } else {
            warn!(
                loader = %self.id,
                joined = report.joined,
                detached = report.detached,
                "Data loader closed with detached threads"
            );
        }
        report
    }
}

impl<T: Item> Drop for DataLoader<T> {
    fn drop(&mut self) {
        self.close();
    }
}

impl<T: Item> std::fmt::Debug for DataLoader<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DataLoader")
            .field("id", &self.id)
            .field("config", &self.config)
            .field("overlap", &self.overlap_active())
            .field("closed", &self.is_closed())
            .finish_non_exhaustive()
    }
}

/// One pass over a [`DataLoader`]
pub struct LoaderIter<T> {
    inner: ItemStream<T>,
    lifecycle: Arc<Lifecycle>,
    loader: Uuid,
    yielded: usize,
    done: bool,
}

impl<T> LoaderIter<T> {
    /// Number of items yielded so far
    pub fn yielded(&self) -> usize {
        self.yielded
    }
}

impl<T> Iterator for LoaderIter<T> {
    type Item = Result<T>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        if self.lifecycle.is_cancelled() {
            self.done = true;
            return None;
        }
        match self.inner.next() {
            Some(Ok(item)) => {
                self.yielded += 1;
                Some(Ok(item))
            }
            Some(Err(e)) => {
                if e.is_fatal() {
                    warn!(loader = %self.loader, error = %e, "Pass aborted");
                    self.done = true;
                }
                Some(Err(e))
            }
            None => {
                self.done = true;
                debug!(loader = %self.loader, items = self.yielded, "Pass finished");
                None
            }
        }
    }
}
