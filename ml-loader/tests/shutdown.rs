//! Closing, failure propagation and worker reuse

mod common;

use std::sync::atomic::AtomicUsize;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use common::{
    copy_pipeline, failing_pipeline, fetch_pipeline, init_tracing, overlapped_copy_pipeline,
    overlapped_pipeline, wait_until,
};
use ml_loader::{DataLoader, Device, Error, HostDevice, LoaderConfig, Role};
use test_case::test_case;

#[test_case(0, true, false ; "in process")]
#[test_case(0, true, true ; "in process with overlap")]
#[test_case(2, true, false ; "persistent workers")]
#[test_case(2, false, false ; "transient workers")]
#[test_case(3, true, true ; "workers with overlap requested")]
fn test_close_mid_iteration_leaves_no_threads(num_workers: usize, persistent: bool, overlap: bool) {
    init_tracing();
    let handles = Arc::new(Mutex::new(Vec::new()));
    let (builder, fetch) = overlapped_pipeline(10_000, Duration::from_micros(200), handles);
    let config = LoaderConfig::default()
        .with_num_workers(num_workers)
        .with_persistent_workers(persistent)
        .with_overlap_feature_fetch(overlap)
        .with_shutdown_grace(Duration::from_secs(2));
    let device: Arc<dyn Device> = Arc::new(HostDevice::new());
    let loader = DataLoader::with_device(builder, fetch, config, Some(device)).unwrap();
    assert_eq!(loader.overlap_active(), overlap && num_workers == 0);

    let mut iter = loader.iter().unwrap();
    for _ in 0..5 {
        iter.next().unwrap().unwrap();
    }

    let report = loader.close();
    assert!(report.is_clean(), "detached threads: {report:?}");
    assert_eq!(loader.live_background_threads(), 0);
    assert!(iter.next().is_none());
    assert!(matches!(loader.iter(), Err(Error::Closed)));
}

#[test_case(0, true ; "overlap in process")]
#[test_case(2, true ; "persistent workers")]
#[test_case(2, false ; "transient workers")]
fn test_close_mid_iteration_with_prefetched_copy(num_workers: usize, persistent: bool) {
    init_tracing();
    let handles = Arc::new(Mutex::new(Vec::new()));
    let (builder, copy) = overlapped_copy_pipeline(10_000, Duration::from_micros(200), handles);
    let config = LoaderConfig::default()
        .with_num_workers(num_workers)
        .with_persistent_workers(persistent)
        .with_shutdown_grace(Duration::from_secs(2));
    let device: Arc<dyn Device> = Arc::new(HostDevice::new());
    let loader = DataLoader::with_device(builder, copy, config, Some(device)).unwrap();
    assert_eq!(loader.overlap_active(), num_workers == 0);
    assert_eq!(loader.graph().find(&Role::Prefetcher).len(), 1);
    assert_eq!(loader.graph().find(&Role::WorkerOffload).len(), 1);

    let mut iter = loader.iter().unwrap();
    for _ in 0..5 {
        iter.next().unwrap().unwrap();
    }
    assert!(loader.live_background_threads() >= 1 + num_workers);

    let report = loader.close();
    assert!(report.is_clean(), "detached threads: {report:?}");
    assert_eq!(loader.live_background_threads(), 0);
    assert!(iter.next().is_none());
}

#[test]
fn test_close_with_prefetch_mid_iteration() {
    let (builder, copy) = copy_pipeline(100_000, Arc::new(AtomicUsize::new(0)));
    let loader = DataLoader::new(builder, copy, LoaderConfig::default()).unwrap();

    let mut iter = loader.iter().unwrap();
    iter.next().unwrap().unwrap();
    assert!(loader.live_background_threads() >= 1);

    assert!(loader.close().is_clean());
    assert_eq!(loader.live_background_threads(), 0);
    assert!(iter.next().is_none());
}

#[test]
fn test_second_close_is_a_no_op() {
    let (builder, fetch) = fetch_pipeline(3);
    let loader = DataLoader::new(builder, fetch, LoaderConfig::default().with_num_workers(1)).unwrap();
    let _ = loader.iter().unwrap().count();

    let first = loader.close();
    assert_eq!(first.joined, 1);
    let second = loader.close();
    assert_eq!((second.joined, second.detached), (0, 0));
    assert!(loader.is_closed());
}

#[test]
fn test_drop_joins_workers() {
    let (builder, fetch) = fetch_pipeline(100);
    let loader = DataLoader::new(builder, fetch, LoaderConfig::default().with_num_workers(2)).unwrap();
    let mut iter = loader.iter().unwrap();
    iter.next().unwrap().unwrap();
    drop(iter);
    drop(loader);
}

#[test]
fn test_worker_failure_is_reported_after_delivered_items() {
    init_tracing();
    let (builder, fetch) = failing_pipeline(10, 5);
    let loader = DataLoader::new(builder, fetch, LoaderConfig::default().with_num_workers(2)).unwrap();

    let results: Vec<_> = loader.iter().unwrap().collect();
    let (errors, batches): (Vec<_>, Vec<_>) = results.into_iter().partition(Result::is_err);

    assert_eq!(errors.len(), 1);
    match &errors[0] {
        Err(Error::WorkerFailure { worker, reason }) => {
            assert_eq!(*worker, 1);
            assert!(reason.contains("corrupt seed 5"));
        }
        other => panic!("unexpected error: {other:?}"),
    }
    let seeds: Vec<u64> = batches.into_iter().map(|b| b.unwrap().seed).collect();
    assert!(seeds.contains(&1) && seeds.contains(&3) && seeds.contains(&4));
    assert!(!seeds.contains(&5));

    assert!(matches!(loader.iter(), Err(Error::WorkerFailure { .. })));
    assert!(loader.close().is_clean());
}

#[test]
fn test_stage_error_without_workers_is_yielded_in_place() {
    let (builder, fetch) = failing_pipeline(4, 2);
    let loader = DataLoader::new(builder, fetch, LoaderConfig::default()).unwrap();

    let results: Vec<_> = loader.iter().unwrap().collect();
    assert_eq!(results.len(), 4);
    assert!(matches!(results[2], Err(Error::Stage(_))));
    assert_eq!(results[3].as_ref().unwrap().seed, 3);
}

#[test]
fn test_persistent_workers_survive_between_passes() {
    let (builder, fetch) = fetch_pipeline(8);
    let config = LoaderConfig::default().with_num_workers(2).with_persistent_workers(true);
    let loader = DataLoader::new(builder, fetch, config).unwrap();

    for _ in 0..3 {
        assert_eq!(loader.iter().unwrap().count(), 8);
        assert_eq!(loader.live_background_threads(), 2);
    }
    assert_eq!(loader.close().joined, 2);
}

#[test]
fn test_transient_workers_exit_after_each_pass() {
    let (builder, fetch) = fetch_pipeline(8);
    let config = LoaderConfig::default().with_num_workers(2).with_persistent_workers(false);
    let loader = DataLoader::new(builder, fetch, config).unwrap();

    for _ in 0..2 {
        assert_eq!(loader.iter().unwrap().count(), 8);
        assert!(wait_until(|| loader.live_background_threads() == 0));
    }
    assert!(loader.close().is_clean());
}

#[test]
fn test_abandoned_persistent_pass_does_not_leak_into_the_next() {
    let (builder, fetch) = fetch_pipeline(200);
    let loader = DataLoader::new(builder, fetch, LoaderConfig::default().with_num_workers(2)).unwrap();

    let mut partial = loader.iter().unwrap();
    for _ in 0..3 {
        partial.next().unwrap().unwrap();
    }
    drop(partial);

    let mut seeds: Vec<u64> = loader.iter().unwrap().map(|b| b.unwrap().seed).collect();
    seeds.sort_unstable();
    assert_eq!(seeds, (0..200).collect::<Vec<_>>());
}
