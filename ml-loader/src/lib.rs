//! Staged data loader for graph learning pipelines
//!
//! Build a pipeline with [`PipelineBuilder`], tag stages with roles
//! ([`ItemSampler`], feature fetchers, device copies) and hand the terminal
//! stage to [`DataLoader`]. The loader rewrites the graph to shard items
//! across workers, offload the pre-fetch sub-pipeline, overlap feature
//! fetching with compute and prefetch ahead of device copies.

#![warn(missing_docs)]

pub mod loader;

pub use loader::{apply_rewrites, DataLoader, LoaderIter};

pub use ml_loader_core::{
    CompletionHandle, Device, EndMarker, Error, ExecutionStream, Graph, HostDevice, Item,
    ItemSampler, LoaderConfig, MapStage, OpenContext, PipelineBuilder, Result, Role,
    ShutdownReport, Stage, StageId,
};
