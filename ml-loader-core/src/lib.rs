//! Core traits, graph model and rewrite engine for staged data loaders
//!
//! A loader pipeline is a DAG of [`Stage`]s pulling items from their parents.
//! This crate provides the graph arena, the rewrite passes that splice wrapper
//! stages into it, the device/stream abstraction used to overlap copies with
//! compute, and the lifecycle that tracks every background thread a pipeline
//! starts.

#![warn(missing_docs)]

pub mod config;
pub mod device;
pub mod error;
pub mod graph;
pub mod item;
pub mod lifecycle;
pub mod rewrite;
pub mod stage;
pub mod stages;

// Re-export key types for convenience
pub use config::LoaderConfig;
pub use device::{Device, ExecutionStream, HostDevice, HostStream, Job};
pub use error::{Error, Result};
pub use graph::{Adjacency, Graph, GraphSnapshot, PipelineBuilder, StageId, Upstream};
pub use item::{Completer, CompletionHandle, Item};
pub use lifecycle::{Lifecycle, ShutdownReport, POLL_INTERVAL};
pub use rewrite::{wrap_parents_of, wrap_stages, StageWrapper};
pub use stage::{ItemStream, OpenContext, Role, Stage, WorkerInfo};
pub use stages::{EndMarker, ItemSampler, MapStage};
