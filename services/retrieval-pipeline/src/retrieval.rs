//! Per-file retrieval: open the input, run the tiled driver, write Zarr.

use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tiled_inference::{
    output_filename, process_input_file, Predictor, RetrievalSettings, ZarrWriter,
};
use tracing::{debug, info, warn, Span};

use crate::config::PipelineConfig;
use crate::log_capture::LogCapture;
use crate::pipeline::{DayOutput, DayProcessor, Pipeline, PipelineReport, WorkItem};
use crate::sources::{get_input_files, InputSource};

/// [`DayProcessor`] running a predictor over one input file per work item.
///
/// Inference is compute-bound and runs on the blocking thread pool, holding
/// the predictor lock for the duration of one file. The caller's span and
/// subscriber are carried over so driver logs end up in the file's
/// captured log.
pub struct FileRetrieval<P> {
    predictor: Arc<Mutex<P>>,
    settings: RetrievalSettings,
    output_dir: PathBuf,
    writer: ZarrWriter,
}

impl<P> FileRetrieval<P>
where
    P: Predictor + Send + 'static,
{
    pub fn new(predictor: P, settings: RetrievalSettings, output_dir: impl Into<PathBuf>) -> Self {
        let writer = ZarrWriter::new(settings.output.clone());
        Self {
            predictor: Arc::new(Mutex::new(predictor)),
            settings,
            output_dir: output_dir.into(),
            writer,
        }
    }

    pub fn from_config(predictor: P, config: &PipelineConfig) -> Self {
        Self::new(predictor, config.retrieval.clone(), config.output_dir.clone())
    }

    /// Shared handle to the predictor.
    pub fn predictor(&self) -> Arc<Mutex<P>> {
        self.predictor.clone()
    }
}

#[async_trait]
impl<P> DayProcessor for FileRetrieval<P>
where
    P: Predictor + Send + 'static,
{
    async fn process_day(&self, item: &WorkItem) -> Result<DayOutput> {
        let reader = item
            .open()
            .await
            .with_context(|| format!("Failed to open input {}", item.name()))?;
        let output_file = self
            .output_dir
            .join(output_filename(item.input.kind(), item.date));

        let predictor = self.predictor.clone();
        let settings = self.settings.clone();
        let writer = self.writer.clone();
        let path = output_file.clone();
        let span = Span::current();
        let dispatch = tracing::dispatcher::get_default(|d| d.clone());

        let results = tokio::task::spawn_blocking(move || {
            tracing::dispatcher::with_default(&dispatch, || {
                span.in_scope(|| {
                    let mut predictor = predictor
                        .lock()
                        .map_err(|_| anyhow!("predictor lock poisoned"))?;
                    let results = process_input_file(&mut *predictor, reader.as_ref(), &settings)?;
                    drop(predictor);

                    let written = writer.write(&path, &results)?;
                    debug!(
                        arrays = written.arrays.len(),
                        bytes = written.bytes_written,
                        "Wrote retrieval output"
                    );
                    Ok::<_, anyhow::Error>(results)
                })
            })
        })
        .await
        .context("Retrieval task panicked")??;

        Ok(DayOutput {
            output_file,
            results,
        })
    }
}

/// Run the retrieval for all input files of `source` in `[start, end]`.
///
/// Input files are searched below `config.input_path` or listed remotely
/// and downloaded into `config.working_dir`. Files whose observation time
/// cannot be determined are skipped.
pub async fn run_from_config<P>(
    config: &PipelineConfig,
    source: Arc<dyn InputSource>,
    predictor: P,
    start: DateTime<Utc>,
    end: Option<DateTime<Utc>>,
    capture: Option<LogCapture>,
) -> Result<PipelineReport>
where
    P: Predictor + Send + 'static,
{
    config.validate()?;

    let files = get_input_files(
        source,
        start,
        end,
        config.input_path.as_deref(),
        config.working_dir.as_deref(),
        config.prefetch,
    )
    .await?;

    let mut items = Vec::with_capacity(files.len());
    for file in files {
        let name = file.name();
        match WorkItem::from_file(file) {
            Ok(item) => items.push(item),
            Err(e) => warn!(file = %name, error = %format!("{e:#}"), "Skipping input file"),
        }
    }

    let retrieval = Arc::new(FileRetrieval::from_config(predictor, config));
    let mut pipeline = Pipeline::from_config(retrieval, config).await?;
    if let Some(capture) = capture {
        pipeline = pipeline.with_capture(capture);
    }

    let report = pipeline.run(items).await?;
    info!(
        processed = report.process.processed,
        failed = report.process.failed + report.download.failed,
        "Retrieval run finished"
    );
    Ok(report)
}
