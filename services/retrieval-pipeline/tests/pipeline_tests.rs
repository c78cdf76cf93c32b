//! Integration tests for the download/process pipeline.

mod common;

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use common::{day, FakeProcessor, FakeSource};
use retrieval_pipeline::{
    run_from_config, FileRetrieval, FileState, InputSource, LogCapture, Pipeline,
    PipelineConfig, ProcessingLog, WorkItem,
};
use test_utils::ScriptedPredictor;
use tiled_inference::{RetrievalSettings, Target};
use tokio::sync::Semaphore;
use tracing_subscriber::prelude::*;

fn items(source: &Arc<FakeSource>, days: std::ops::RangeInclusive<u32>) -> Vec<WorkItem> {
    let input: Arc<dyn InputSource> = source.clone();
    days.map(|d| WorkItem::new(input.clone(), day(d))).collect()
}

#[tokio::test]
async fn test_all_items_are_processed() {
    let source = Arc::new(FakeSource::new());
    source.mark_local(day(2));
    let processor = Arc::new(FakeProcessor::new());
    let log = ProcessingLog::open_memory().await.unwrap();

    let report = Pipeline::new(processor.clone(), log.clone())
        .run(items(&source, 1..=5))
        .await
        .unwrap();

    assert_eq!(report.download.forwarded, 5);
    assert_eq!(report.download.failed, 0);
    assert_eq!(report.process.processed, 5);
    assert_eq!(processor.processed().len(), 5);
    // Day 2 was already available locally.
    assert_eq!(source.download_count(), 4);

    let stats = log.stats().await.unwrap();
    assert_eq!(stats.total, 5);
    assert_eq!(stats.succeeded, 5);

    let entry = log.entry("fake_202001030000.nc").await.unwrap().unwrap();
    assert_eq!(entry.output_file, "/out/fake_202001030000.nc.zarr");
    assert_eq!(entry.stat_mean, Some(2.5));
    assert_eq!(entry.n_missing, 0);
}

#[tokio::test]
async fn test_failed_download_does_not_stop_pipeline() {
    let source = Arc::new(FakeSource::failing_on(&[day(2)]));
    let processor = Arc::new(FakeProcessor::new());
    let log = ProcessingLog::open_memory().await.unwrap();

    let report = Pipeline::new(processor.clone(), log.clone())
        .run(items(&source, 1..=4))
        .await
        .unwrap();

    assert_eq!(report.download.forwarded, 3);
    assert_eq!(report.download.failed, 1);
    assert_eq!(report.process.processed, 3);
    assert!(!processor.processed().contains(&day(2)));
    assert_eq!(
        log.state("fake_202001020000.nc").await.unwrap(),
        FileState::Unseen
    );
}

#[tokio::test]
async fn test_failed_retrieval_is_logged_and_isolated() {
    let capture = LogCapture::new();
    let _default =
        tracing::subscriber::set_default(tracing_subscriber::registry().with(capture.layer()));

    let source = Arc::new(FakeSource::new());
    let processor = Arc::new(FakeProcessor::failing_on(&[day(1)]));
    let log = ProcessingLog::open_memory().await.unwrap();

    let report = Pipeline::new(processor, log.clone())
        .with_capture(capture.clone())
        .run(items(&source, 1..=3))
        .await
        .unwrap();

    assert_eq!(report.process.processed, 2);
    assert_eq!(report.process.failed, 1);

    let failed = log.failed().await.unwrap();
    assert_eq!(failed.len(), 1);
    assert_eq!(failed[0].name, "fake_202001010000.nc");
    assert!(!failed[0].success);
    assert!(failed[0].log.contains("Retrieval failed"));
    assert!(failed[0].log.contains("scripted retrieval failure"));

    let ok = log.entry("fake_202001020000.nc").await.unwrap().unwrap();
    assert!(ok.log.contains("Running fake retrieval"));
    assert!(!ok.log.contains("scripted retrieval failure"));
    assert_eq!(capture.active(), 0);
}

#[tokio::test]
async fn test_retry_appends_to_captured_log() {
    let capture = LogCapture::new();
    let _default =
        tracing::subscriber::set_default(tracing_subscriber::registry().with(capture.layer()));

    let source = Arc::new(FakeSource::new());
    let log = ProcessingLog::open_memory().await.unwrap();

    let failing = Pipeline::new(Arc::new(FakeProcessor::failing_on(&[day(1)])), log.clone())
        .with_capture(capture.clone());
    failing.run(items(&source, 1..=1)).await.unwrap();
    let first = log.entry("fake_202001010000.nc").await.unwrap().unwrap();
    assert_eq!(first.state(), FileState::Pending);

    let working = Pipeline::new(Arc::new(FakeProcessor::new()), log.clone())
        .with_capture(capture.clone());
    working.run(items(&source, 1..=1)).await.unwrap();
    let second = log.entry("fake_202001010000.nc").await.unwrap().unwrap();

    assert_eq!(second.state(), FileState::Finalized);
    assert!(second.log.starts_with(&first.log));
    assert!(second.log.len() > first.log.len());
    assert!(second.log.contains("Retrieval failed"));
    assert!(second.log.contains("Retrieval finished"));
}

#[tokio::test]
async fn test_download_stage_waits_until_work_queue_closes() {
    let source = Arc::new(FakeSource::new());
    let processor = Arc::new(FakeProcessor::new());
    let pipeline = Pipeline::new(processor.clone(), ProcessingLog::disabled());

    let (sender, handle) = pipeline.start();
    for item in items(&source, 1..=2) {
        sender.send(item).unwrap();
    }

    tokio::time::timeout(Duration::from_secs(5), async {
        while processor.processed().len() < 2 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("items were not processed");

    // All work is done, but the queue is still open.
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(!handle.is_finished());

    drop(sender);
    let report = tokio::time::timeout(Duration::from_secs(5), handle.join())
        .await
        .expect("pipeline did not stop after the work queue closed")
        .unwrap();
    assert_eq!(report.process.processed, 2);
}

#[tokio::test]
async fn test_processing_queue_applies_backpressure() {
    let source = Arc::new(FakeSource::new());
    let gate = Arc::new(Semaphore::new(0));
    let processor = Arc::new(FakeProcessor::gated(gate.clone()));
    let pipeline =
        Pipeline::new(processor.clone(), ProcessingLog::disabled()).with_queue_capacity(2);

    let (sender, handle) = pipeline.start();
    for item in items(&source, 1..=10) {
        sender.send(item).unwrap();
    }
    drop(sender);

    tokio::time::sleep(Duration::from_millis(200)).await;
    // One item blocked in the processor, two queued, one waiting to be sent.
    assert_eq!(source.download_count(), 4);
    assert!(processor.processed().is_empty());

    gate.add_permits(10);
    let report = tokio::time::timeout(Duration::from_secs(5), handle.join())
        .await
        .expect("pipeline did not finish")
        .unwrap();
    assert_eq!(report.download.forwarded, 10);
    assert_eq!(report.process.processed, 10);
    assert_eq!(source.download_count(), 10);
}

#[tokio::test]
async fn test_processing_order_follows_download_order() {
    let source = Arc::new(FakeSource::new());
    let processor = Arc::new(FakeProcessor::new());

    let days = [day(3), day(1), day(2)];
    let input: Arc<dyn InputSource> = source.clone();
    let work: Vec<_> = days.iter().map(|&d| WorkItem::new(input.clone(), d)).collect();

    Pipeline::new(processor.clone(), ProcessingLog::disabled())
        .run(work)
        .await
        .unwrap();
    assert_eq!(processor.processed(), days.to_vec());
}

#[tokio::test]
async fn test_end_to_end_retrieval() {
    let capture = LogCapture::new();
    let _default =
        tracing::subscriber::set_default(tracing_subscriber::registry().with(capture.layer()));

    let output_dir = tempfile::tempdir().unwrap();
    let settings = RetrievalSettings {
        tile_size: 32,
        overlap: 8,
        targets: vec![Target::Tiwp, Target::CloudType],
        database_path: None,
        ..Default::default()
    };
    let retrieval = Arc::new(FileRetrieval::new(
        ScriptedPredictor::new(),
        settings,
        output_dir.path(),
    ));
    let log = ProcessingLog::open_memory().await.unwrap();
    let source = Arc::new(FakeSource::new());

    let report = Pipeline::new(retrieval.clone(), log.clone())
        .with_capture(capture)
        .run(items(&source, 1..=2))
        .await
        .unwrap();
    assert_eq!(report.process.processed, 2);
    assert_eq!(report.process.failed, 0);

    let output = output_dir.path().join("ccic_fake_202001010000.zarr");
    assert!(output.join("zarr.json").exists());
    assert!(output.join("tiwp").exists());
    assert!(output.join("cloud_type").exists());

    let entry = log.entry("fake_202001010000.nc").await.unwrap().unwrap();
    assert_eq!(entry.state(), FileState::Finalized);
    assert_eq!(entry.output_file, output.display().to_string());
    assert_eq!(entry.n_missing, 0);
    assert!(entry.stat_min.unwrap() > 0.0);
    assert!(entry.log.contains("Tiled inference complete"));

    let predictor = retrieval.predictor();
    let predictor = predictor.lock().unwrap();
    // 24 x 48 input with 32-pixel tiles: one row of two tiles per file.
    assert_eq!(predictor.calls(), 4);
    assert_eq!(predictor.device.as_deref(), Some("cpu"));
}

#[tokio::test]
async fn test_predictor_failure_fails_only_that_file() {
    let output_dir = tempfile::tempdir().unwrap();
    let settings = RetrievalSettings {
        tile_size: 32,
        overlap: 8,
        targets: vec![Target::Tiwp],
        database_path: None,
        ..Default::default()
    };
    let retrieval = Arc::new(FileRetrieval::new(
        ScriptedPredictor::failing_on(0),
        settings,
        output_dir.path(),
    ));
    let log = ProcessingLog::open_memory().await.unwrap();
    let source = Arc::new(FakeSource::new());

    let report = Pipeline::new(retrieval, log.clone())
        .run(items(&source, 1..=2))
        .await
        .unwrap();

    assert_eq!(report.process.failed, 1);
    assert_eq!(report.process.processed, 1);
    assert_eq!(log.failed().await.unwrap()[0].name, "fake_202001010000.nc");
    assert!(!output_dir.path().join("ccic_fake_202001010000.zarr").exists());
    assert!(output_dir.path().join("ccic_fake_202001020000.zarr").exists());
}

fn retrieval_settings(database_path: Option<std::path::PathBuf>) -> RetrievalSettings {
    RetrievalSettings {
        tile_size: 32,
        overlap: 8,
        targets: vec![Target::Tiwp],
        database_path,
        ..Default::default()
    }
}

#[tokio::test]
async fn test_run_from_yaml_config_without_database() {
    let root = tempfile::tempdir().unwrap();
    let input_dir = root.path().join("input");
    std::fs::create_dir_all(&input_dir).unwrap();
    for name in [
        "fake_202001010000.nc",
        "fake_202001020000.nc",
        "fake_202001090000.nc",
    ] {
        std::fs::write(input_dir.join(name), b"").unwrap();
    }
    let output_dir = root.path().join("output");

    let config_path = root.path().join("pipeline.yaml");
    let yaml = format!(
        "output_dir: {}\ninput_path: {}\nqueue_capacity: 2\nretrieval:\n  tile_size: 32\n  overlap: 8\n  targets: [tiwp]\n  database_path: null\n",
        output_dir.display(),
        input_dir.display()
    );
    std::fs::write(&config_path, yaml).unwrap();

    let config = PipelineConfig::load(&config_path).unwrap();
    assert!(config.retrieval.database_path.is_none());

    let pipeline = Pipeline::from_config(Arc::new(FakeProcessor::new()), &config)
        .await
        .unwrap();
    assert!(!pipeline.log().is_enabled());

    let source: Arc<dyn InputSource> = Arc::new(FakeSource::new());
    let report = run_from_config(
        &config,
        source,
        ScriptedPredictor::new(),
        day(1),
        Some(day(3)),
        None,
    )
    .await
    .unwrap();

    assert_eq!(report.download.forwarded, 2);
    assert_eq!(report.process.processed, 2);
    assert_eq!(report.process.failed, 0);
    assert!(output_dir
        .join("ccic_fake_202001010000.zarr")
        .join("zarr.json")
        .exists());
    assert!(output_dir.join("ccic_fake_202001020000.zarr").exists());
    assert!(!output_dir.join("ccic_fake_202001090000.zarr").exists());
}

#[tokio::test]
async fn test_configured_queue_capacity_bounds_downloads() {
    let mut config = PipelineConfig::new("/unused");
    config.queue_capacity = 2;
    config.retrieval = retrieval_settings(None);

    let source = Arc::new(FakeSource::new());
    let gate = Arc::new(Semaphore::new(0));
    let processor = Arc::new(FakeProcessor::gated(gate.clone()));
    let pipeline = Pipeline::from_config(processor, &config).await.unwrap();

    let (sender, handle) = pipeline.start();
    for item in items(&source, 1..=8) {
        sender.send(item).unwrap();
    }
    drop(sender);

    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(source.download_count(), 4);

    gate.add_permits(8);
    let report = tokio::time::timeout(Duration::from_secs(5), handle.join())
        .await
        .expect("pipeline did not finish")
        .unwrap();
    assert_eq!(report.process.processed, 8);
}

#[tokio::test]
async fn test_run_from_config_downloads_into_working_dir() {
    let root = tempfile::tempdir().unwrap();
    let database = root.path().join("processing.db");
    let mut config = PipelineConfig::new(root.path().join("output"));
    config.working_dir = Some(root.path().join("work"));
    config.retrieval = retrieval_settings(Some(database.clone()));

    let fake = Arc::new(FakeSource::with_remote_files(&[
        "fake_202001010000.nc",
        "fake_202001020000.nc",
    ]));
    let report = run_from_config(
        &config,
        fake.clone(),
        ScriptedPredictor::new(),
        day(1),
        Some(day(2)),
        None,
    )
    .await
    .unwrap();

    assert_eq!(report.process.processed, 2);
    assert_eq!(fake.file_downloads.load(Ordering::SeqCst), 2);
    assert!(root.path().join("work").join("fake_202001010000.nc").exists());
    assert!(root
        .path()
        .join("output")
        .join("ccic_fake_202001020000.zarr")
        .exists());

    let log = ProcessingLog::open(&database).await.unwrap();
    let entry = log.entry("fake_202001020000.nc").await.unwrap().unwrap();
    assert_eq!(entry.state(), FileState::Finalized);
    assert_eq!(entry.input_date, day(2));
}

#[tokio::test]
async fn test_remote_input_without_working_dir_fails_downloads() {
    let root = tempfile::tempdir().unwrap();
    let mut config = PipelineConfig::new(root.path().join("output"));
    config.retrieval = retrieval_settings(None);

    let fake = Arc::new(FakeSource::with_remote_files(&["fake_202001010000.nc"]));
    let report = run_from_config(
        &config,
        fake.clone(),
        ScriptedPredictor::new(),
        day(1),
        None,
        None,
    )
    .await
    .unwrap();

    assert_eq!(report.download.failed, 1);
    assert_eq!(report.process.processed, 0);
    assert_eq!(fake.file_downloads.load(Ordering::SeqCst), 0);
}
