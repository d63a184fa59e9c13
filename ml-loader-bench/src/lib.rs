//! Benchmarks for staged data loaders

use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{ensure, Context, Result};
use ml_loader::{
    CompletionHandle, DataLoader, Device, HostDevice, Item, ItemSampler, LoaderConfig, MapStage,
    OpenContext, PipelineBuilder,
};

/// Benchmark configuration
#[derive(Debug, Clone)]
pub struct BenchConfig {
    /// Number of measured passes
    pub iterations: usize,

    /// Warmup passes
    pub warmup_iterations: usize,

    /// Minibatches per pass
    pub num_batches: u64,

    /// Simulated sampling cost per minibatch
    pub sample_latency: Duration,

    /// Simulated feature copy cost per minibatch
    pub copy_latency: Duration,

    /// Simulated compute cost per minibatch on the consumer side
    pub compute_latency: Duration,

    /// Worker threads
    pub num_workers: usize,

    /// Look-ahead depth
    pub buffer_size: usize,
}

impl Default for BenchConfig {
    fn default() -> Self {
        Self {
            iterations: 5,
            warmup_iterations: 1,
            num_batches: 64,
            sample_latency: Duration::from_micros(200),
            copy_latency: Duration::from_micros(300),
            compute_latency: Duration::from_micros(300),
            num_workers: 0,
            buffer_size: 2,
        }
    }
}

/// Benchmark result
#[derive(Debug, Clone)]
pub struct BenchResult {
    /// Name of the benchmark
    pub name: String,

    /// Total time taken
    pub total_time: Duration,

    /// Average time per pass
    pub avg_time: Duration,

    /// Min time per pass
    pub min_time: Duration,

    /// Max time per pass
    pub max_time: Duration,

    /// Throughput (minibatches/second)
    pub throughput: f64,
}

/// Run `func` as one pass `config.iterations` times; `func` returns the
/// number of minibatches it consumed
pub fn run_benchmark<F>(name: &str, config: &BenchConfig, func: F) -> Result<BenchResult>
where
    F: Fn() -> Result<usize>,
{
    ensure!(config.iterations > 0, "at least one measured iteration is required");

    for _ in 0..config.warmup_iterations {
        func()?;
    }

    let mut times = Vec::with_capacity(config.iterations);
    let mut consumed = 0;
    let start_total = Instant::now();
    for _ in 0..config.iterations {
        let start = Instant::now();
        consumed += func()?;
        times.push(start.elapsed());
    }
    let total_time = start_total.elapsed();

    let passes = u32::try_from(times.len()).context("too many iterations")?;
    let avg_time = times.iter().sum::<Duration>() / passes;
    let min_time = times.iter().min().copied().unwrap_or_default();
    let max_time = times.iter().max().copied().unwrap_or_default();

    #[allow(clippy::cast_precision_loss)]
    let throughput = consumed as f64 / total_time.as_secs_f64();

    Ok(BenchResult {
        name: name.to_string(),
        total_time,
        avg_time,
        min_time,
        max_time,
        throughput,
    })
}

/// A minibatch carrying its in-flight feature copy
#[derive(Debug, Clone)]
pub struct MiniBatch {
    /// Seed id
    pub seed: u64,

    /// Pending copy of the fetched features
    pub copy: Option<CompletionHandle>,
}

impl Item for MiniBatch {
    fn completion(&self) -> Option<&CompletionHandle> {
        self.copy.as_ref()
    }
}

/// Build a loader over simulated sample, fetch and copy costs
///
/// With a device the feature copy is submitted to the loader's alternate
/// stream; without one it runs inline in the fetch stage.
pub fn build_loader(
    config: &BenchConfig,
    loader_config: LoaderConfig,
    device: Option<Arc<dyn Device>>,
) -> Result<DataLoader<MiniBatch>> {
    let sample_latency = config.sample_latency;
    let copy_latency = config.copy_latency;

    let mut builder = PipelineBuilder::new();
    let seeds = (0..config.num_batches).map(|seed| MiniBatch { seed, copy: None });
    let sampler = builder.add(ItemSampler::new(seeds), &[])?;
    let sample = builder.add(
        MapStage::new("sample_neighbors", move |batch: MiniBatch, _: &OpenContext| {
            thread::sleep(sample_latency);
            Ok(batch)
        }),
        &[sampler],
    )?;
    let fetch = builder.add(
        MapStage::feature_fetcher("fetch_features", move |mut batch: MiniBatch, ctx: &OpenContext| {
            match ctx.stream() {
                Some(stream) => {
                    let handle = stream.submit(Box::new(move || -> ml_loader::Result<()> {
                        thread::sleep(copy_latency);
                        Ok(())
                    }))?;
                    batch.copy = Some(handle);
                }
                None => thread::sleep(copy_latency),
            }
            Ok(batch)
        }),
        &[sample],
    )?;

    Ok(DataLoader::with_device(builder, fetch, loader_config, device)?)
}

/// Drain one pass, simulating compute per minibatch
pub fn consume(loader: &DataLoader<MiniBatch>, compute_latency: Duration) -> Result<usize> {
    let mut consumed = 0;
    for batch in loader.iter()? {
        let _batch = batch?;
        thread::sleep(compute_latency);
        consumed += 1;
    }
    Ok(consumed)
}

/// Benchmark one loader configuration
pub fn bench_loader(
    name: &str,
    config: &BenchConfig,
    loader_config: LoaderConfig,
    device: Option<Arc<dyn Device>>,
) -> Result<BenchResult> {
    let loader = build_loader(config, loader_config, device)?;
    let result = run_benchmark(name, config, || consume(&loader, config.compute_latency));
    let report = loader.close();
    ensure!(report.is_clean(), "{} background threads did not exit", report.detached);
    result
}

/// Compare the loader with feature fetch overlap on and off
pub fn compare_overlap(config: &BenchConfig) -> Result<Vec<BenchResult>> {
    let base = LoaderConfig::default()
        .with_num_workers(config.num_workers)
        .with_buffer_size(config.buffer_size);

    let inline = bench_loader(
        "inline copy",
        config,
        base.clone().with_overlap_feature_fetch(false),
        None,
    )?;
    let device: Arc<dyn Device> = Arc::new(HostDevice::new());
    let overlapped = bench_loader(
        "overlapped copy",
        config,
        base.with_overlap_feature_fetch(true),
        Some(device),
    )?;

    Ok(vec![inline, overlapped])
}
