//! Fakes shared by the pipeline integration tests.

#![allow(dead_code)]

use std::collections::HashSet;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{bail, Result};
use async_trait::async_trait;
use chrono::{DateTime, NaiveDateTime, TimeZone, Utc};
use retrieval_pipeline::{BoxedReader, DayOutput, DayProcessor, InputSource, WorkItem};
use test_utils::{gradient_raster, MemoryReader};
use tiled_inference::{RetrievalResults, Variable, VariableData};
use tokio::sync::Semaphore;
use tracing::info;

pub fn day(day: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2020, 1, day, 0, 0, 0).unwrap()
}

/// Input source serving small in-memory rasters.
#[derive(Default)]
pub struct FakeSource {
    local: Mutex<HashSet<DateTime<Utc>>>,
    downloads: Mutex<Vec<DateTime<Utc>>>,
    failing: HashSet<DateTime<Utc>>,
    remote_files: Vec<String>,
    pub file_downloads: AtomicUsize,
}

impl FakeSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn failing_on(dates: &[DateTime<Utc>]) -> Self {
        Self {
            failing: dates.iter().copied().collect(),
            ..Self::default()
        }
    }

    pub fn with_remote_files(names: &[&str]) -> Self {
        Self {
            remote_files: names.iter().map(|n| n.to_string()).collect(),
            ..Self::default()
        }
    }

    pub fn mark_local(&self, date: DateTime<Utc>) {
        self.local.lock().unwrap().insert(date);
    }

    pub fn download_count(&self) -> usize {
        self.downloads.lock().unwrap().len()
    }

    fn reader() -> BoxedReader {
        Box::new(MemoryReader::new(gradient_raster(1, 1, 24, 48)))
    }
}

#[async_trait]
impl InputSource for FakeSource {
    fn kind(&self) -> &str {
        "fake"
    }

    fn filename(&self, date: DateTime<Utc>) -> String {
        format!("fake_{}.nc", date.format("%Y%m%d%H%M"))
    }

    fn file_date(&self, filename: &str) -> Option<DateTime<Utc>> {
        let stamp = filename.strip_prefix("fake_")?.strip_suffix(".nc")?;
        NaiveDateTime::parse_from_str(stamp, "%Y%m%d%H%M")
            .ok()
            .map(|d| d.and_utc())
    }

    async fn has_data(&self, date: DateTime<Utc>) -> Result<bool> {
        Ok(self.local.lock().unwrap().contains(&date))
    }

    async fn download_data(&self, date: DateTime<Utc>) -> Result<()> {
        self.downloads.lock().unwrap().push(date);
        if self.failing.contains(&date) {
            bail!("scripted download failure for {date}");
        }
        tokio::time::sleep(Duration::from_millis(1)).await;
        self.local.lock().unwrap().insert(date);
        Ok(())
    }

    async fn get_available_files(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<String>> {
        Ok(self
            .remote_files
            .iter()
            .filter(|name| {
                self.file_date(name)
                    .is_some_and(|d| d >= start && d <= end)
            })
            .cloned()
            .collect())
    }

    async fn download_file(&self, filename: &str, destination: &Path) -> Result<()> {
        if let Some(parent) = destination.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(destination, filename.as_bytes()).await?;
        self.file_downloads.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn open(&self, date: DateTime<Utc>) -> Result<BoxedReader> {
        if !self.local.lock().unwrap().contains(&date) {
            bail!("no data for {date}");
        }
        Ok(Self::reader())
    }

    fn open_file(&self, path: &Path) -> Result<BoxedReader> {
        if !path.exists() {
            bail!("{} does not exist", path.display());
        }
        Ok(Self::reader())
    }
}

/// Processor that records the dates it sees instead of running a model.
#[derive(Default)]
pub struct FakeProcessor {
    processed: Mutex<Vec<DateTime<Utc>>>,
    failing: HashSet<DateTime<Utc>>,
    gate: Option<Arc<Semaphore>>,
}

impl FakeProcessor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn failing_on(dates: &[DateTime<Utc>]) -> Self {
        Self {
            failing: dates.iter().copied().collect(),
            ..Self::default()
        }
    }

    /// A processor that handles one item per permit of `gate`.
    pub fn gated(gate: Arc<Semaphore>) -> Self {
        Self {
            gate: Some(gate),
            ..Self::default()
        }
    }

    pub fn processed(&self) -> Vec<DateTime<Utc>> {
        self.processed.lock().unwrap().clone()
    }
}

#[async_trait]
impl DayProcessor for FakeProcessor {
    async fn process_day(&self, item: &WorkItem) -> Result<DayOutput> {
        if let Some(gate) = &self.gate {
            gate.acquire().await?.forget();
        }
        info!(date = %item.date, "Running fake retrieval");
        self.processed.lock().unwrap().push(item.date);

        if self.failing.contains(&item.date) {
            bail!("scripted retrieval failure");
        }

        let mut results = RetrievalResults::new();
        let tiwp = ndarray::ArrayD::from_elem(ndarray::IxDyn(&[1, 2, 2]), 2.5_f32);
        results.insert(
            "tiwp",
            Variable::new(&["time", "latitude", "longitude"], VariableData::Float32(tiwp))?,
        );
        Ok(DayOutput {
            output_file: format!("/out/{}.zarr", item.name()).into(),
            results,
        })
    }
}
