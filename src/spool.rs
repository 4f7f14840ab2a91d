use std::ffi::{OsStr, OsString};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use thiserror::Error;
use tokio::fs;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::{SeriesConfig, SpoolConfig};
use crate::livestatus::Enricher;
use crate::parser::{parse_spool, SpoolFormat};
use crate::queue::{CollectQueue, QueueClosed};
use crate::stats::PipelineStats;

/// Appended to a spool file name while one task owns it.
pub const CLAIM_SUFFIX: &str = ".perfflux-claimed";

/// State shared by every watcher task.
pub struct SpoolContext {
    pub queue: Arc<CollectQueue>,
    pub stats: Arc<PipelineStats>,
    pub series: SeriesConfig,
    pub enricher: Option<Arc<dyn Enricher>>,
    pub poll_interval: Duration,
    pub min_file_age: Duration,
    pub read_timeout: Duration,
    pub archive_folder: Option<PathBuf>,
}

impl SpoolContext {
    #[must_use]
    pub fn new(
        queue: Arc<CollectQueue>,
        stats: Arc<PipelineStats>,
        series: SeriesConfig,
        spool: &SpoolConfig,
    ) -> Self {
        SpoolContext {
            queue,
            stats,
            series,
            enricher: None,
            poll_interval: spool.poll_interval,
            min_file_age: spool.min_file_age,
            read_timeout: spool.read_timeout,
            archive_folder: spool.archive_folder.clone(),
        }
    }
}

/// Polls one spool folder and feeds its files into the collect queue.
///
/// Several tasks may watch the same folder; a file is owned by whichever
/// task manages to rename it to its claimed name first.
pub struct SpoolWatcher {
    folder: PathBuf,
    format: SpoolFormat,
    ctx: Arc<SpoolContext>,
}

impl SpoolWatcher {
    #[must_use]
    pub fn new(folder: PathBuf, format: SpoolFormat, ctx: Arc<SpoolContext>) -> Self {
        SpoolWatcher { folder, format, ctx }
    }

    #[must_use]
    pub fn folder(&self) -> &Path {
        &self.folder
    }

    /// Renames claimed files left by a previous run back to their original
    /// name so they are picked up again.
    ///
    /// # Errors
    ///
    /// Errors if the folder cannot be listed or a claim cannot be released.
    pub async fn recover_claims(&self) -> Result<usize, SpoolError> {
        let mut recovered = 0usize;
        let mut entries = fs::read_dir(&self.folder).await.map_err(|source| self.io(source))?;
        while let Some(entry) = entries.next_entry().await.map_err(|source| self.io(source))? {
            let claimed = entry.path();
            let Some(original) = unclaimed_path(&claimed) else {
                continue;
            };

            fs::rename(&claimed, &original)
                .await
                .map_err(|source| SpoolError::Io { path: claimed.clone(), source })?;
            recovered = recovered.saturating_add(1);
        }

        if recovered > 0 {
            info!(folder = %self.folder.display(), recovered, "recovered claimed spool files");
        }

        Ok(recovered)
    }

    /// Starts `workers` polling tasks on this folder.
    pub fn spawn(self, workers: usize, cxl: &CancellationToken) -> Vec<JoinHandle<()>> {
        let watcher = Arc::new(self);

        (0..workers.max(1))
            .map(|id| tokio::spawn(watcher.clone().run(id, cxl.clone())))
            .collect()
    }

    async fn run(self: Arc<Self>, id: usize, cxl: CancellationToken) {
        debug!(id, folder = %self.folder.display(), "spool watcher started");

        let mut interval = tokio::time::interval(self.ctx.poll_interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;

                () = cxl.cancelled() => break,
                _ = interval.tick() => {}
            }

            if let Err(err) = self.scan_once(&cxl).await {
                warn!(%err, id, "spool scan failed");
            }
        }

        debug!(id, folder = %self.folder.display(), "spool watcher stopped");
    }

    /// Processes every eligible file currently in the folder, oldest first.
    ///
    /// Returns the number of files this call consumed. Failures on single
    /// files are logged and counted; the file is left for a later scan.
    ///
    /// # Errors
    ///
    /// Errors if the folder cannot be listed or the queue is closed.
    pub async fn scan_once(&self, cxl: &CancellationToken) -> Result<usize, SpoolError> {
        let mut processed = 0usize;
        for path in self.candidates().await? {
            if cxl.is_cancelled() {
                break;
            }

            match self.process(&path).await {
                Ok(true) => processed = processed.saturating_add(1),
                Ok(false) => {}
                Err(err @ SpoolError::QueueClosed(_)) => return Err(err),
                Err(err) => {
                    warn!(%err, "failed to process spool file");
                    self.ctx.stats.record_file_error();
                }
            }
        }

        Ok(processed)
    }

    async fn candidates(&self) -> Result<Vec<PathBuf>, SpoolError> {
        let mut files = Vec::new();
        let mut entries = fs::read_dir(&self.folder).await.map_err(|source| self.io(source))?;
        while let Some(entry) = entries.next_entry().await.map_err(|source| self.io(source))? {
            let name = entry.file_name();
            let name = name.to_string_lossy();
            if name.starts_with('.') || name.ends_with(CLAIM_SUFFIX) {
                continue;
            }

            // Vanished or unreadable entries are picked up on a later scan.
            let Ok(metadata) = entry.metadata().await else {
                continue;
            };
            if !metadata.is_file() {
                continue;
            }
            let modified = metadata.modified().unwrap_or(SystemTime::UNIX_EPOCH);
            if modified.elapsed().unwrap_or(Duration::ZERO) < self.ctx.min_file_age {
                continue;
            }

            files.push((modified, entry.path()));
        }
        files.sort_unstable();

        Ok(files.into_iter().map(|(_, path)| path).collect())
    }

    /// Returns `false` if another task claimed the file first.
    async fn process(&self, path: &Path) -> Result<bool, SpoolError> {
        let claimed = claimed_path(path);
        match fs::rename(path, &claimed).await {
            Ok(()) => {}
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(false),
            Err(source) => return Err(SpoolError::Io { path: path.to_path_buf(), source }),
        }

        let contents = match tokio::time::timeout(self.ctx.read_timeout, fs::read(&claimed)).await {
            Ok(Ok(contents)) => contents,
            Ok(Err(source)) => {
                self.release(&claimed, path).await;
                return Err(SpoolError::Io { path: path.to_path_buf(), source });
            }
            Err(_) => {
                self.release(&claimed, path).await;
                return Err(SpoolError::ReadTimeout {
                    path: path.to_path_buf(),
                    timeout: self.ctx.read_timeout,
                });
            }
        };

        let text = String::from_utf8_lossy(&contents);
        let mut parsed = parse_spool(&text, self.format, &self.ctx.series);
        if let Some(enricher) = &self.ctx.enricher {
            enricher.enrich(&mut parsed.points);
        }
        self.ctx.stats.record_file(parsed.lines, parsed.errors);

        let points = parsed.points.len();
        for point in parsed.points {
            self.ctx.queue.enqueue(point).await?;
        }
        self.ctx.stats.record_enqueued(points);
        debug!(path = %path.display(), points, errors = parsed.errors, "spool file consumed");

        self.finish(&claimed, path).await?;

        Ok(true)
    }

    async fn finish(&self, claimed: &Path, original: &Path) -> Result<(), SpoolError> {
        let Some(archive) = &self.ctx.archive_folder else {
            return fs::remove_file(claimed)
                .await
                .map_err(|source| SpoolError::Io { path: claimed.to_path_buf(), source });
        };

        let target = archive_target(archive, original.file_name().unwrap_or_default()).await?;
        // Rename fails across filesystems.
        match fs::rename(claimed, &target).await {
            Ok(()) => return Ok(()),
            Err(err) => debug!(%err, target = %target.display(), "archive rename failed; copying"),
        }

        fs::copy(claimed, &target)
            .await
            .map_err(|source| SpoolError::Io { path: target.clone(), source })?;
        fs::remove_file(claimed)
            .await
            .map_err(|source| SpoolError::Io { path: claimed.to_path_buf(), source })
    }

    async fn release(&self, claimed: &Path, original: &Path) {
        if let Err(err) = fs::rename(claimed, original).await {
            warn!(%err, path = %claimed.display(), "failed to release spool claim");
        }
    }

    fn io(&self, source: std::io::Error) -> SpoolError {
        SpoolError::Io { path: self.folder.clone(), source }
    }
}

/// First free name for `name` inside `archive`: `name`, then `name.1`,
/// `name.2` and so on.
async fn archive_target(archive: &Path, name: &OsStr) -> Result<PathBuf, SpoolError> {
    let mut target = archive.join(name);
    let mut suffix = 0u32;
    while fs::try_exists(&target)
        .await
        .map_err(|source| SpoolError::Io { path: target.clone(), source })?
    {
        suffix = suffix.saturating_add(1);
        let mut numbered = name.to_os_string();
        numbered.push(format!(".{suffix}"));
        target = archive.join(numbered);
    }

    Ok(target)
}

fn claimed_path(path: &Path) -> PathBuf {
    let mut name = OsString::from(path.as_os_str());
    name.push(CLAIM_SUFFIX);

    PathBuf::from(name)
}

fn unclaimed_path(path: &Path) -> Option<PathBuf> {
    let name = path.file_name()?.to_str()?;
    let original = name.strip_suffix(CLAIM_SUFFIX).filter(|original| !original.is_empty())?;

    Some(path.with_file_name(original))
}

#[derive(Debug, Error)]
pub enum SpoolError {
    #[error("Spool io; path={}; err={source}", .path.display())]
    Io { path: PathBuf, source: std::io::Error },
    #[error("Spool read timed out; path={}; timeout={timeout:?}", .path.display())]
    ReadTimeout { path: PathBuf, timeout: Duration },
    #[error("Enqueue spool points; err={0}")]
    QueueClosed(#[from] QueueClosed),
}
