//! Benchmark runner for staged data loaders

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use ml_loader::{Device, HostDevice, LoaderConfig};
use ml_loader_bench::{bench_loader, compare_overlap, BenchConfig, BenchResult};
use tracing::Level;

fn print_result(result: &BenchResult) {
    println!("\nBenchmark: {}", result.name);
    println!("  Total time:   {:?}", result.total_time);
    println!("  Average time: {:?}", result.avg_time);
    println!("  Min time:     {:?}", result.min_time);
    println!("  Max time:     {:?}", result.max_time);
    println!("  Throughput:   {:.2} batches/sec", result.throughput);
}

fn main() -> Result<()> {
    tracing_subscriber::fmt().with_max_level(Level::WARN).init();

    println!("=== Data Loader Benchmarks ===");

    let config = BenchConfig::default();
    println!("\n=== Feature Fetch Overlap ===");
    for result in compare_overlap(&config)? {
        print_result(&result);
    }

    println!("\n=== Worker Scaling ===");
    for num_workers in [0, 1, 2, 4] {
        let config = BenchConfig {
            num_workers,
            ..BenchConfig::default()
        };
        let loader_config = LoaderConfig::default()
            .with_num_workers(num_workers)
            .with_overlap_feature_fetch(false);
        let result = bench_loader(&format!("{num_workers} workers"), &config, loader_config, None)?;
        print_result(&result);
    }

    println!("\n=== Look-ahead Depth ===");
    for buffer_size in [1, 2, 4, 8] {
        let config = BenchConfig {
            buffer_size,
            compute_latency: Duration::from_micros(500),
            ..BenchConfig::default()
        };
        let loader_config = LoaderConfig::default().with_buffer_size(buffer_size);
        let device: Arc<dyn Device> = Arc::new(HostDevice::new());
        let result = bench_loader(
            &format!("buffer {buffer_size}"),
            &config,
            loader_config,
            Some(device),
        )?;
        print_result(&result);
    }

    Ok(())
}
