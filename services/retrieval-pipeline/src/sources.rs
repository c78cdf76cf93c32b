//! Input sources: listing, downloading and opening retrieval input.

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tiled_inference::InputReader;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::error::ConfigurationError;

/// Reader handed to the tiled inference driver.
pub type BoxedReader = Box<dyn InputReader + Send>;

/// A type of satellite input, such as a global infrared composite, that
/// can be listed, downloaded and opened for a given time.
#[async_trait]
pub trait InputSource: Send + Sync {
    /// Short name of the input type, used in output filenames.
    fn kind(&self) -> &str;

    /// Name of the input file holding the observations at `date`.
    fn filename(&self, date: DateTime<Utc>) -> String;

    /// Observation time encoded in `filename`, or `None` if the file does
    /// not belong to this source.
    fn file_date(&self, filename: &str) -> Option<DateTime<Utc>>;

    /// Whether the input for `date` is already available locally.
    async fn has_data(&self, date: DateTime<Utc>) -> Result<bool>;

    /// Acquire the input for `date`.
    async fn download_data(&self, date: DateTime<Utc>) -> Result<()>;

    /// Names of remote files with observation times in `[start, end]`.
    async fn get_available_files(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<String>>;

    /// Download a single remote file to `destination`.
    async fn download_file(&self, filename: &str, destination: &Path) -> Result<()>;

    /// Files of this source below `path` with observation times in
    /// `[start, end]`, sorted by path.
    fn find_files(
        &self,
        path: &Path,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<PathBuf>> {
        find_matching_files(path, |name| {
            self.file_date(name)
                .is_some_and(|date| date >= start && date <= end)
        })
    }

    /// Open the input for `date`. The data must have been acquired.
    fn open(&self, date: DateTime<Utc>) -> Result<BoxedReader>;

    /// Open a local file of this source.
    fn open_file(&self, path: &Path) -> Result<BoxedReader>;
}

/// Walk `root` and return all files whose name satisfies `matches`.
pub fn find_matching_files<F>(root: &Path, mut matches: F) -> Result<Vec<PathBuf>>
where
    F: FnMut(&str) -> bool,
{
    let mut files = Vec::new();
    for entry in walkdir::WalkDir::new(root) {
        let entry = entry.with_context(|| format!("Failed to scan {}", root.display()))?;
        if !entry.file_type().is_file() {
            continue;
        }
        if let Some(name) = entry.file_name().to_str() {
            if matches(name) {
                files.push(entry.into_path());
            }
        }
    }
    files.sort();
    debug!(root = %root.display(), count = files.len(), "Found input files");
    Ok(files)
}

/// A file that is not available locally and is downloaded on demand.
///
/// When created with prefetching and a working directory, the download
/// starts right away on a background task and [`RemoteFile::get`] waits for
/// it to complete.
pub struct RemoteFile {
    source: Arc<dyn InputSource>,
    filename: String,
    working_dir: Option<PathBuf>,
    prefetch: Mutex<Option<(PathBuf, JoinHandle<Result<()>>)>>,
}

impl RemoteFile {
    pub fn new(
        source: Arc<dyn InputSource>,
        filename: impl Into<String>,
        working_dir: Option<PathBuf>,
        prefetch: bool,
    ) -> Self {
        let filename = filename.into();
        let mut task = None;

        if prefetch {
            match (&working_dir, tokio::runtime::Handle::try_current()) {
                (Some(dir), Ok(handle)) => {
                    let output_path = dir.join(&filename);
                    let source = source.clone();
                    let name = filename.clone();
                    let path = output_path.clone();
                    debug!(file = %filename, "Prefetching remote file");
                    let join = handle.spawn(async move { source.download_file(&name, &path).await });
                    task = Some((output_path, join));
                }
                (None, _) => {
                    debug!(file = %filename, "No working directory, prefetching disabled");
                }
                (_, Err(_)) => {
                    warn!(file = %filename, "No async runtime, prefetching disabled");
                }
            }
        }

        Self {
            source,
            filename,
            working_dir,
            prefetch: Mutex::new(task),
        }
    }

    pub fn filename(&self) -> &str {
        &self.filename
    }

    pub async fn is_prefetching(&self) -> bool {
        self.prefetch.lock().await.is_some()
    }

    /// Download the file, or wait for its prefetch, and return its local
    /// path.
    ///
    /// `working_dir` overrides the directory given on creation. Fails with
    /// [`ConfigurationError::MissingWorkingDirectory`] if neither is set.
    pub async fn fetch(&self, working_dir: Option<&Path>) -> Result<PathBuf> {
        if let Some((path, task)) = self.prefetch.lock().await.take() {
            task.await
                .with_context(|| format!("Prefetch of {} did not complete", self.filename))??;
            return Ok(path);
        }

        let dir = working_dir
            .map(Path::to_path_buf)
            .or_else(|| self.working_dir.clone())
            .ok_or(ConfigurationError::MissingWorkingDirectory)?;

        let output_path = dir.join(&self.filename);
        self.source
            .download_file(&self.filename, &output_path)
            .await
            .with_context(|| format!("Failed to download {}", self.filename))?;
        Ok(output_path)
    }

    /// Fetch the file and open it.
    pub async fn get(&self, working_dir: Option<&Path>) -> Result<BoxedReader> {
        let path = self.fetch(working_dir).await?;
        self.source.open_file(&path)
    }
}

impl fmt::Debug for RemoteFile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RemoteFile")
            .field("kind", &self.source.kind())
            .field("filename", &self.filename)
            .field("working_dir", &self.working_dir)
            .finish()
    }
}

/// An input file that is either on disk or still remote.
pub enum InputFile {
    Local {
        source: Arc<dyn InputSource>,
        path: PathBuf,
    },
    Remote(RemoteFile),
}

impl InputFile {
    pub fn name(&self) -> String {
        match self {
            Self::Local { path, .. } => path
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default(),
            Self::Remote(remote) => remote.filename().to_string(),
        }
    }

    pub fn source(&self) -> &Arc<dyn InputSource> {
        match self {
            Self::Local { source, .. } => source,
            Self::Remote(remote) => &remote.source,
        }
    }

    /// Observation time of the file according to its source.
    pub fn date(&self) -> Option<DateTime<Utc>> {
        self.source().file_date(&self.name())
    }

    /// Make the file available on disk, downloading it into `working_dir`
    /// if it is remote.
    pub async fn into_local(self, working_dir: Option<&Path>) -> Result<Self> {
        match self {
            Self::Local { .. } => Ok(self),
            Self::Remote(remote) => {
                let path = remote.fetch(working_dir).await?;
                Ok(Self::Local {
                    source: remote.source,
                    path,
                })
            }
        }
    }

    pub async fn open(&self, working_dir: Option<&Path>) -> Result<BoxedReader> {
        match self {
            Self::Local { source, path } => source.open_file(path),
            Self::Remote(remote) => remote.get(working_dir).await,
        }
    }
}

impl fmt::Debug for InputFile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Local { path, .. } => f.debug_tuple("Local").field(path).finish(),
            Self::Remote(remote) => f.debug_tuple("Remote").field(remote).finish(),
        }
    }
}

/// Input files of `source` for `start`, or for `[start, end]` when an end
/// time is given.
///
/// With a local `path` the matching files below it are returned. Otherwise
/// the remote listing is turned into [`RemoteFile`]s, which start
/// downloading into `working_dir` right away when `prefetch` is set.
pub async fn get_input_files(
    source: Arc<dyn InputSource>,
    start: DateTime<Utc>,
    end: Option<DateTime<Utc>>,
    path: Option<&Path>,
    working_dir: Option<&Path>,
    prefetch: bool,
) -> Result<Vec<InputFile>> {
    let end = end.unwrap_or(start);

    let files = match path {
        Some(path) => source
            .find_files(path, start, end)?
            .into_iter()
            .map(|path| InputFile::Local {
                source: source.clone(),
                path,
            })
            .collect::<Vec<_>>(),
        None => source
            .get_available_files(start, end)
            .await?
            .into_iter()
            .map(|name| {
                InputFile::Remote(RemoteFile::new(
                    source.clone(),
                    name,
                    working_dir.map(Path::to_path_buf),
                    prefetch,
                ))
            })
            .collect(),
    };

    info!(
        kind = source.kind(),
        count = files.len(),
        local = path.is_some(),
        "Determined input files"
    );
    Ok(files)
}
