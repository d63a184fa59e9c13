//! Shared fixtures for loader integration tests

#![allow(dead_code)]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use ml_loader::{
    CompletionHandle, Error, Item, ItemSampler, MapStage, OpenContext, PipelineBuilder, Result,
    Role, StageId,
};

/// Install a test subscriber once per process
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_test_writer()
        .with_max_level(tracing::Level::DEBUG)
        .try_init();
}

/// Poll `condition` for up to two seconds
pub fn wait_until(mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + Duration::from_secs(2);
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        thread::sleep(Duration::from_millis(5));
    }
    condition()
}

/// A minibatch whose features may still be copying
#[derive(Debug, Clone)]
pub struct Batch {
    pub seed: u64,
    pub features: Option<Vec<f32>>,
    pub copy: Option<CompletionHandle>,
}

impl Batch {
    pub fn new(seed: u64) -> Self {
        Self {
            seed,
            features: None,
            copy: None,
        }
    }
}

impl Item for Batch {
    fn completion(&self) -> Option<&CompletionHandle> {
        self.copy.as_ref()
    }
}

/// sampler -> feature fetcher, returning the fetcher as terminal stage
pub fn fetch_pipeline(seeds: u64) -> (PipelineBuilder<Batch>, StageId) {
    let mut builder = PipelineBuilder::new();
    let sampler = builder
        .add(ItemSampler::new((0..seeds).map(Batch::new)), &[])
        .unwrap();
    let fetch = builder
        .add(
            MapStage::feature_fetcher("fetch", |mut batch: Batch, _: &OpenContext| {
                batch.features = Some(vec![batch.seed as f32; 4]);
                Ok(batch)
            }),
            &[sampler],
        )
        .unwrap();
    (builder, fetch)
}

/// sampler -> decode (failing on `fail_on`) -> feature fetcher
pub fn failing_pipeline(seeds: u64, fail_on: u64) -> (PipelineBuilder<Batch>, StageId) {
    let mut builder = PipelineBuilder::new();
    let sampler = builder
        .add(ItemSampler::new((0..seeds).map(Batch::new)), &[])
        .unwrap();
    let decode = builder
        .add(
            MapStage::new("decode", move |batch: Batch, _: &OpenContext| {
                if batch.seed == fail_on {
                    Err(Error::stage(format!("corrupt seed {}", batch.seed)))
                } else {
                    Ok(batch)
                }
            }),
            &[sampler],
        )
        .unwrap();
    let fetch = builder
        .add(
            MapStage::feature_fetcher("fetch", |batch: Batch, _: &OpenContext| Ok(batch)),
            &[decode],
        )
        .unwrap();
    (builder, fetch)
}

/// sampler -> feature fetcher submitting a simulated copy to the attached
/// stream; every submitted handle is recorded
pub fn overlapped_pipeline(
    seeds: u64,
    copy_time: Duration,
    handles: Arc<Mutex<Vec<CompletionHandle>>>,
) -> (PipelineBuilder<Batch>, StageId) {
    let mut builder = PipelineBuilder::new();
    let sampler = builder
        .add(ItemSampler::new((0..seeds).map(Batch::new)), &[])
        .unwrap();
    let fetch = builder
        .add(
            MapStage::feature_fetcher("fetch", move |mut batch: Batch, ctx: &OpenContext| {
                if let Some(stream) = ctx.stream() {
                    let handle = stream.submit(Box::new(move || -> Result<()> {
                        thread::sleep(copy_time);
                        Ok(())
                    }))?;
                    handles.lock().unwrap().push(handle.clone());
                    batch.copy = Some(handle);
                }
                batch.features = Some(vec![1.0; 4]);
                Ok(batch)
            }),
            &[sampler],
        )
        .unwrap();
    (builder, fetch)
}

/// sampler -> overlapped feature fetcher -> device copy
pub fn overlapped_copy_pipeline(
    seeds: u64,
    copy_time: Duration,
    handles: Arc<Mutex<Vec<CompletionHandle>>>,
) -> (PipelineBuilder<Batch>, StageId) {
    let (mut builder, fetch) = overlapped_pipeline(seeds, copy_time, handles);
    let copy = builder
        .add(MapStage::copy_to("copy", |batch: Batch, _: &OpenContext| Ok(batch)), &[fetch])
        .unwrap();
    (builder, copy)
}

/// sampler -> counter -> device copy; `pulled` counts items leaving the
/// counter
pub fn copy_pipeline(seeds: u64, pulled: Arc<AtomicUsize>) -> (PipelineBuilder<u64>, StageId) {
    let mut builder = PipelineBuilder::new();
    let sampler = builder.add(ItemSampler::new(0..seeds), &[]).unwrap();
    let count = builder
        .add(
            MapStage::new("count", move |x: u64, _: &OpenContext| {
                pulled.fetch_add(1, Ordering::SeqCst);
                Ok(x)
            }),
            &[sampler],
        )
        .unwrap();
    let copy = builder
        .add(MapStage::copy_to("copy", |x: u64, _: &OpenContext| Ok(x)), &[count])
        .unwrap();
    (builder, copy)
}

/// Roles along the single-parent chain from the root
pub fn chain<T: Item>(graph: &ml_loader::Graph<T>) -> Vec<Role> {
    let mut roles = Vec::new();
    let mut current = Some(graph.root());
    while let Some(id) = current {
        roles.push(graph.role(id).unwrap());
        current = graph.parents(id).unwrap().first().copied();
    }
    roles
}
