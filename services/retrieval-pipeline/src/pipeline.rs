//! Two-stage download/process pipeline.
//!
//! ```text
//! work queue (unbounded) ──► download stage ──► processing queue (bounded) ──► process stage
//! ```
//!
//! The download stage makes the input of each work item available locally
//! and forwards it to the processing queue, which holds at most
//! `queue_capacity` items so downloads cannot run arbitrarily far ahead of
//! inference. The process stage runs the retrieval for each item and records
//! the outcome in the processing log. Both stages isolate failures per item.
//!
//! The download stage stops once the work queue is closed, that is once every
//! sender has been dropped. It owns the only sender of the processing queue,
//! so its exit, normal or not, always stops the process stage as well.

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tiled_inference::RetrievalResults;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{error, info, info_span, warn, Instrument};

use crate::config::{PipelineConfig, DEFAULT_QUEUE_CAPACITY};
use crate::log_capture::LogCapture;
use crate::processing_log::ProcessingLog;
use crate::sources::{BoxedReader, InputFile, InputSource};

/// Input for one retrieval run.
///
/// Items created with [`WorkItem::new`] are acquired through the source's
/// `has_data`/`download_data` and opened by date. Items created from an
/// [`InputFile`] are fetched into the pipeline's working directory and
/// opened from there.
pub struct WorkItem {
    pub input: Arc<dyn InputSource>,
    pub date: DateTime<Utc>,
    file: Option<InputFile>,
}

impl WorkItem {
    pub fn new(input: Arc<dyn InputSource>, date: DateTime<Utc>) -> Self {
        Self {
            input,
            date,
            file: None,
        }
    }

    /// Work item for a listed input file.
    pub fn from_file(file: InputFile) -> Result<Self> {
        let date = file.date().with_context(|| {
            format!("Cannot determine the observation time of {}", file.name())
        })?;
        Ok(Self {
            input: file.source().clone(),
            date,
            file: Some(file),
        })
    }

    /// Input filename, the key of the processing log.
    pub fn name(&self) -> String {
        match &self.file {
            Some(file) => file.name(),
            None => self.input.filename(self.date),
        }
    }

    pub fn file(&self) -> Option<&InputFile> {
        self.file.as_ref()
    }

    /// Open the input of this item. The input must have been acquired.
    pub async fn open(&self) -> Result<BoxedReader> {
        match &self.file {
            Some(file) => file.open(None).await,
            None => self.input.open(self.date),
        }
    }
}

impl fmt::Debug for WorkItem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkItem")
            .field("kind", &self.input.kind())
            .field("date", &self.date)
            .field("file", &self.file)
            .finish()
    }
}

/// Result of processing one work item.
#[derive(Debug, Clone)]
pub struct DayOutput {
    pub output_file: PathBuf,
    pub results: RetrievalResults,
}

/// Per-item retrieval entry point used by the process stage.
#[async_trait]
pub trait DayProcessor: Send + Sync {
    /// Run the retrieval for `item` and write its output.
    async fn process_day(&self, item: &WorkItem) -> Result<DayOutput>;
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DownloadReport {
    /// Items forwarded to the processing queue.
    pub forwarded: usize,
    /// Items whose input could not be acquired.
    pub failed: usize,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ProcessReport {
    pub processed: usize,
    pub failed: usize,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PipelineReport {
    pub download: DownloadReport,
    pub process: ProcessReport,
}

/// Acquire the input of every work item and forward it for processing.
///
/// Remote input files are downloaded into `working_dir`. Returns once
/// `work` is closed and drained, or when the process stage has gone away.
/// Dropping `processing` on return closes the processing queue.
pub async fn download_stage(
    mut work: mpsc::UnboundedReceiver<WorkItem>,
    processing: mpsc::Sender<WorkItem>,
    working_dir: Option<PathBuf>,
) -> DownloadReport {
    let mut report = DownloadReport::default();

    while let Some(item) = work.recv().await {
        let name = item.name();
        match acquire(item, working_dir.as_deref()).await {
            Ok(item) => {
                if processing.send(item).await.is_err() {
                    warn!(file = %name, "Process stage stopped, discarding remaining work");
                    break;
                }
                report.forwarded += 1;
            }
            Err(e) => {
                error!(file = %name, error = %format!("{e:#}"), "Failed to acquire input");
                report.failed += 1;
            }
        }
    }

    info!(
        forwarded = report.forwarded,
        failed = report.failed,
        "Download stage finished"
    );
    report
}

async fn acquire(mut item: WorkItem, working_dir: Option<&Path>) -> Result<WorkItem> {
    match item.file.take() {
        Some(file) => {
            if let InputFile::Remote(remote) = &file {
                info!(file = %remote.filename(), "Downloading input file");
            }
            item.file = Some(file.into_local(working_dir).await?);
        }
        None => {
            if !item.input.has_data(item.date).await? {
                info!(file = %item.name(), "Downloading input");
                item.input.download_data(item.date).await?;
            }
        }
    }
    Ok(item)
}

/// Run the retrieval for every item of the processing queue.
///
/// Each item is processed inside a `process_file` span whose log output is
/// captured, when `capture` is set, and appended to the item's processing
/// log entry.
pub async fn process_stage<P>(
    mut queue: mpsc::Receiver<WorkItem>,
    processor: Arc<P>,
    log: ProcessingLog,
    capture: Option<LogCapture>,
) -> ProcessReport
where
    P: DayProcessor + ?Sized,
{
    let mut report = ProcessReport::default();

    while let Some(item) = queue.recv().await {
        let name = item.name();
        if let Err(e) = log.begin(&name, item.date).await {
            warn!(file = %name, error = %format!("{e:#}"), "Failed to create processing log entry");
        }

        let span = info_span!("process_file", file = %name);
        let guard = capture.as_ref().map(|c| c.start(&span));

        let success = process_item(processor.as_ref(), &item, &log, &name)
            .instrument(span)
            .await;
        if success {
            report.processed += 1;
        } else {
            report.failed += 1;
        }

        if let Some(guard) = guard {
            let text = guard.finish();
            if let Err(e) = log.append_log(&name, &text).await {
                warn!(file = %name, error = %format!("{e:#}"), "Failed to store captured log");
            }
        }
    }

    info!(
        processed = report.processed,
        failed = report.failed,
        "Process stage finished"
    );
    report
}

async fn process_item<P>(processor: &P, item: &WorkItem, log: &ProcessingLog, name: &str) -> bool
where
    P: DayProcessor + ?Sized,
{
    info!(kind = item.input.kind(), date = %item.date, "Starting retrieval");

    match processor.process_day(item).await {
        Ok(output) => {
            let output_file = output.output_file.display().to_string();
            if let Err(e) = log.finalize(name, &output.results, &output_file).await {
                error!(error = %format!("{e:#}"), "Failed to finalize processing log entry");
            }
            info!(output = %output_file, "Retrieval finished");
            true
        }
        Err(e) => {
            error!(error = %format!("{e:#}"), "Retrieval failed");
            false
        }
    }
}

/// Handle to a running pipeline.
pub struct PipelineHandle {
    download: JoinHandle<DownloadReport>,
    process: JoinHandle<ProcessReport>,
}

impl PipelineHandle {
    pub fn is_finished(&self) -> bool {
        self.download.is_finished() && self.process.is_finished()
    }

    /// Wait for both stages to finish.
    pub async fn join(self) -> Result<PipelineReport> {
        let download = self.download.await.context("Download stage panicked")?;
        let process = self.process.await.context("Process stage panicked")?;
        Ok(PipelineReport { download, process })
    }
}

/// Pipeline connecting a download stage to a process stage.
pub struct Pipeline<P: ?Sized> {
    processor: Arc<P>,
    log: ProcessingLog,
    capture: Option<LogCapture>,
    queue_capacity: usize,
    working_dir: Option<PathBuf>,
}

impl<P> Pipeline<P>
where
    P: DayProcessor + ?Sized + 'static,
{
    pub fn new(processor: Arc<P>, log: ProcessingLog) -> Self {
        Self {
            processor,
            log,
            capture: None,
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
            working_dir: None,
        }
    }

    /// Pipeline with the processing log, queue capacity and working
    /// directory of `config`. Without a configured database the processing
    /// log is disabled.
    pub async fn from_config(processor: Arc<P>, config: &PipelineConfig) -> Result<Self> {
        let log = ProcessingLog::from_settings(config.retrieval.database_path.as_deref()).await?;
        let mut pipeline = Self::new(processor, log).with_queue_capacity(config.queue_capacity);
        if let Some(dir) = &config.working_dir {
            pipeline = pipeline.with_working_dir(dir);
        }
        Ok(pipeline)
    }

    pub fn log(&self) -> &ProcessingLog {
        &self.log
    }

    /// Store the log output of every file in the processing log.
    pub fn with_capture(mut self, capture: LogCapture) -> Self {
        self.capture = Some(capture);
        self
    }

    pub fn with_queue_capacity(mut self, capacity: usize) -> Self {
        self.queue_capacity = capacity.max(1);
        self
    }

    /// Directory receiving downloaded input files.
    pub fn with_working_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_dir = Some(dir.into());
        self
    }

    /// Process all `items` and wait for both stages to finish.
    ///
    /// The work queue is filled and closed before the stages start.
    pub async fn run(&self, items: impl IntoIterator<Item = WorkItem>) -> Result<PipelineReport> {
        let (sender, receiver) = mpsc::unbounded_channel();
        let mut submitted = 0usize;
        for item in items {
            sender
                .send(item)
                .map_err(|_| anyhow!("work queue closed before all items were submitted"))?;
            submitted += 1;
        }
        drop(sender);

        info!(items = submitted, capacity = self.queue_capacity, "Starting pipeline");
        self.spawn_stages(receiver).join().await
    }

    /// Start both stages and return the work queue sender.
    ///
    /// The download stage runs until every clone of the returned sender has
    /// been dropped.
    pub fn start(&self) -> (mpsc::UnboundedSender<WorkItem>, PipelineHandle) {
        let (sender, receiver) = mpsc::unbounded_channel();
        (sender, self.spawn_stages(receiver))
    }

    fn spawn_stages(&self, work: mpsc::UnboundedReceiver<WorkItem>) -> PipelineHandle {
        let (processing_tx, processing_rx) = mpsc::channel(self.queue_capacity);

        let download = tokio::spawn(download_stage(
            work,
            processing_tx,
            self.working_dir.clone(),
        ));
        let process = tokio::spawn(process_stage(
            processing_rx,
            self.processor.clone(),
            self.log.clone(),
            self.capture.clone(),
        ));

        PipelineHandle { download, process }
    }
}
