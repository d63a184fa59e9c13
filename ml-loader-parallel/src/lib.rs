//! Wrapper stages that add parallelism or look-ahead to a loader pipeline
//!
//! Each stage here has a matching [`StageWrapper`](ml_loader_core::StageWrapper)
//! so rewrite passes can splice it into a graph.

#![warn(missing_docs)]

pub mod awaiter;
pub mod buffer;
pub mod prefetch;
pub mod sharding;
pub mod worker;

pub use awaiter::{AwaiterWrapper, CompletionAwaiter};
pub use buffer::{BoundedBuffer, BufferStream, BufferWrapper};
pub use prefetch::{PrefetchWrapper, Prefetcher};
pub use sharding::{ShardingSplitter, ShardingWrapper};
pub use worker::{OffloadWrapper, WorkerOffload};
