//! Stage trait and the context stages are opened with

use std::fmt;
use std::sync::Arc;

use crate::device::ExecutionStream;
use crate::error::Result;
use crate::graph::Upstream;
use crate::item::Item;
use crate::lifecycle::Lifecycle;

/// A lazily evaluated sequence of items; `None` marks exhaustion
pub type ItemStream<T> = Box<dyn Iterator<Item = Result<T>> + Send>;

/// Role tag used by rewrite passes to locate stages by capability
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Role {
    /// Produces the raw items (minibatch seeds) of the pipeline
    ItemSampler,
    /// Looks up features for an item
    FeatureFetcher,
    /// Moves an item to the compute device
    DeviceCopy,
    /// Marks the terminal stage of a pipeline
    EndMarker,
    /// Splits items across worker contexts
    ShardingSplitter,
    /// Runs its sub-pipeline in worker contexts
    WorkerOffload,
    /// Bounded look-ahead buffer
    Buffer,
    /// Waits for pending asynchronous operations
    Awaiter,
    /// Runs its sub-pipeline ahead of the consumer on a background thread
    Prefetcher,
    /// Any other transformation
    Transform,
}

impl Role {
    /// Whether stages of this role are inserted by rewrite passes
    pub fn is_wrapper(&self) -> bool {
        matches!(
            self,
            Role::ShardingSplitter
                | Role::WorkerOffload
                | Role::Buffer
                | Role::Awaiter
                | Role::Prefetcher
        )
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Role::ItemSampler => write!(f, "item-sampler"),
            Role::FeatureFetcher => write!(f, "feature-fetcher"),
            Role::DeviceCopy => write!(f, "device-copy"),
            Role::EndMarker => write!(f, "end-marker"),
            Role::ShardingSplitter => write!(f, "sharding-splitter"),
            Role::WorkerOffload => write!(f, "worker-offload"),
            Role::Buffer => write!(f, "buffer"),
            Role::Awaiter => write!(f, "awaiter"),
            Role::Prefetcher => write!(f, "prefetcher"),
            Role::Transform => write!(f, "transform"),
        }
    }
}

/// Position of a worker context among its siblings
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct WorkerInfo {
    /// Index of this worker, `0..num_workers`
    pub id: usize,
    /// Number of workers sharing the sub-pipeline
    pub num_workers: usize,
}

/// Execution context a stage is opened in
///
/// Carries the loader's lifecycle, the worker the stage runs in (if any), and
/// the alternate execution stream attached to the stage being opened (if any).
/// Streams are attached per stage and are not inherited by upstream stages.
#[derive(Clone)]
pub struct OpenContext {
    lifecycle: Arc<Lifecycle>,
    worker: Option<WorkerInfo>,
    stream: Option<Arc<dyn ExecutionStream>>,
}

impl OpenContext {
    /// Create a root context
    pub fn new(lifecycle: Arc<Lifecycle>) -> Self {
        Self {
            lifecycle,
            worker: None,
            stream: None,
        }
    }

    /// Context for a stage running inside a worker
    #[must_use]
    pub fn with_worker(mut self, worker: WorkerInfo) -> Self {
        self.worker = Some(worker);
        self
    }

    /// Context carrying the given stream
    #[must_use]
    pub fn with_stream(mut self, stream: Option<Arc<dyn ExecutionStream>>) -> Self {
        self.stream = stream;
        self
    }

    /// The loader lifecycle
    pub fn lifecycle(&self) -> &Arc<Lifecycle> {
        &self.lifecycle
    }

    /// Whether the loader is shutting down
    pub fn is_cancelled(&self) -> bool {
        self.lifecycle.is_cancelled()
    }

    /// Worker this stage runs in, `None` on the main thread
    pub fn worker(&self) -> Option<WorkerInfo> {
        self.worker
    }

    /// Stream attached to the stage being opened
    pub fn stream(&self) -> Option<&Arc<dyn ExecutionStream>> {
        self.stream.as_ref()
    }
}

impl fmt::Debug for OpenContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OpenContext")
            .field("worker", &self.worker)
            .field("stream", &self.stream.as_ref().map(|s| s.name().to_string()))
            .finish_non_exhaustive()
    }
}

/// A node of the pipeline graph
///
/// A stage is an immutable description; every call to [`Stage::open`] starts
/// an independent pass with its own iteration state, so the same stage can be
/// opened in several worker contexts at once.
pub trait Stage<T: Item>: Send + Sync {
    /// Name used in logs and graph descriptions
    fn name(&self) -> &str;

    /// Role tag for rewrite matching
    fn role(&self) -> Role {
        Role::Transform
    }

    /// Start a pass over this stage's output
    fn open(&self, upstream: Upstream<T>, ctx: &OpenContext) -> Result<ItemStream<T>>;

    /// Release resources kept across passes
    fn close(&self) {}
}
