use std::io::{ErrorKind, SeekFrom};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::fs::{self, OpenOptions};
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncSeekExt, AsyncWriteExt, BufReader, Take};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::point::DataPoint;
use crate::queue::{CollectQueue, QueueClosed};
use crate::stats::PipelineStats;
use crate::transmitter::{Destination, DestinationHealth};

/// Append-only JSON-lines log of batches the destination did not accept.
///
/// Each line is `{"seq":<u64>,"points":[...]}`. Appends hold the state lock
/// for one write. Replay notes the current length under the lock, streams
/// that prefix into the queue without the lock and finally cuts it off,
/// keeping anything appended in the meantime.
#[derive(Debug)]
pub struct DumpFile {
    path: PathBuf,
    tmp_path: PathBuf,
    read_timeout: Duration,
    state: Mutex<DumpState>,
    replay: Mutex<()>,
}

#[derive(Debug)]
struct DumpState {
    next_seq: u64,
}

#[derive(Serialize)]
struct OverflowRecordBorrowed<'a> {
    seq: u64,
    points: &'a [DataPoint],
}

#[derive(Deserialize)]
struct OverflowRecord {
    seq: u64,
    points: Vec<DataPoint>,
}

#[derive(Deserialize)]
struct RecordHeader {
    seq: u64,
}

/// Result of one [`DumpFile::drain_and_replay`] pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReplaySummary {
    pub records: usize,
    pub points: usize,
    pub corrupt: usize,
}

impl DumpFile {
    /// Opens (or prepares to create) the dump at `path`. Every later read of
    /// the file is bounded by `read_timeout`.
    ///
    /// A torn last line left by a crash is terminated so later appends start
    /// on a fresh line; replay then skips it as corrupt.
    ///
    /// # Errors
    ///
    /// Errors if the parent folder cannot be created or the existing file
    /// cannot be read in time.
    pub async fn open(path: impl Into<PathBuf>, read_timeout: Duration) -> Result<Self, DumpError> {
        let path = path.into();
        let mut tmp_path = path.clone().into_os_string();
        tmp_path.push(".tmp");
        let tmp_path = PathBuf::from(tmp_path);

        if let Some(parent) = path.parent().filter(|parent| !parent.as_os_str().is_empty()) {
            fs::create_dir_all(parent).await.map_err(|source| io_error(parent, source))?;
        }
        match fs::remove_file(&tmp_path).await {
            Ok(()) => debug!(path = %tmp_path.display(), "removed stale dump rewrite"),
            Err(err) if err.kind() == ErrorKind::NotFound => {}
            Err(source) => return Err(io_error(&tmp_path, source)),
        }

        let mut next_seq = 0u64;
        let mut torn = false;
        if let Some(mut reader) = RecordReader::open(&path, u64::MAX, read_timeout).await? {
            while let Some(line) = reader.next_line().await? {
                if let Ok(header) = serde_json::from_slice::<RecordHeader>(line) {
                    next_seq = next_seq.max(header.seq.saturating_add(1));
                }
            }
            torn = reader.torn;
        }
        if torn {
            warn!(path = %path.display(), "dump ends with a torn record");
            append_bytes(&path, b"\n").await?;
        }

        Ok(DumpFile {
            path,
            tmp_path,
            read_timeout,
            state: Mutex::new(DumpState { next_seq }),
            replay: Mutex::new(()),
        })
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Appends one batch as a single record.
    ///
    /// # Errors
    ///
    /// Errors if the record cannot be serialized or written durably.
    pub async fn append(&self, batch: &[DataPoint]) -> Result<(), DumpError> {
        if batch.is_empty() {
            return Ok(());
        }

        let mut state = self.state.lock().await;
        let record = OverflowRecordBorrowed { seq: state.next_seq, points: batch };
        let mut line = serde_json::to_vec(&record)?;
        line.push(b'\n');

        append_bytes(&self.path, &line).await?;
        state.next_seq = state.next_seq.saturating_add(1);

        Ok(())
    }

    /// Current size of the dump, zero if it does not exist.
    ///
    /// # Errors
    ///
    /// Errors if the file metadata cannot be read.
    pub async fn len_bytes(&self) -> Result<u64, DumpError> {
        match fs::metadata(&self.path).await {
            Ok(metadata) => Ok(metadata.len()),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(0),
            Err(source) => Err(io_error(&self.path, source)),
        }
    }

    /// Re-enqueues every complete record and removes them from the dump.
    ///
    /// Records are streamed into the queue in file order. If this future is
    /// dropped before it finishes, the dump is left untouched and the records
    /// already enqueued will be delivered again on the next pass.
    ///
    /// # Errors
    ///
    /// Errors on I/O failure, a read exceeding the timeout or if the queue is
    /// closed.
    pub async fn drain_and_replay(&self, queue: &CollectQueue) -> Result<ReplaySummary, DumpError> {
        let _replay = self.replay.lock().await;

        let limit = {
            let _state = self.state.lock().await;
            self.len_bytes().await?
        };
        if limit == 0 {
            return Ok(ReplaySummary::default());
        }
        let Some(mut reader) = RecordReader::open(&self.path, limit, self.read_timeout).await?
        else {
            return Ok(ReplaySummary::default());
        };

        let mut summary = ReplaySummary::default();
        let mut index = 0usize;
        while let Some(line) = reader.next_line().await? {
            index = index.saturating_add(1);
            if line.is_empty() {
                continue;
            }

            let record = match serde_json::from_slice::<OverflowRecord>(line) {
                Ok(record) => record,
                Err(err) => {
                    warn!(%err, line = index, "skipping corrupt dump record");
                    summary.corrupt = summary.corrupt.saturating_add(1);
                    continue;
                }
            };

            summary.records = summary.records.saturating_add(1);
            summary.points = summary.points.saturating_add(record.points.len());
            for point in record.points {
                queue.enqueue(point).await?;
            }
        }
        let consumed = reader.consumed;

        let _state = self.state.lock().await;
        self.cut_prefix(consumed).await?;

        Ok(summary)
    }

    /// Replaces the dump with everything after its first `offset` bytes.
    async fn cut_prefix(&self, offset: u64) -> Result<(), DumpError> {
        let mut source =
            fs::File::open(&self.path).await.map_err(|source| io_error(&self.path, source))?;
        source
            .seek(SeekFrom::Start(offset))
            .await
            .map_err(|source| io_error(&self.path, source))?;

        let mut file = fs::File::create(&self.tmp_path)
            .await
            .map_err(|source| io_error(&self.tmp_path, source))?;
        tokio::time::timeout(self.read_timeout, tokio::io::copy(&mut source, &mut file))
            .await
            .map_err(|_| DumpError::ReadTimeout {
                path: self.path.clone(),
                timeout: self.read_timeout,
            })?
            .map_err(|source| io_error(&self.tmp_path, source))?;
        file.sync_all()
            .await
            .map_err(|source| io_error(&self.tmp_path, source))?;
        drop(file);

        fs::rename(&self.tmp_path, &self.path)
            .await
            .map_err(|source| io_error(&self.path, source))
    }
}

/// Streams newline-terminated records from the start of a dump, at most
/// `limit` bytes, each read bounded by a timeout.
struct RecordReader<'a> {
    path: &'a Path,
    reader: BufReader<Take<fs::File>>,
    timeout: Duration,
    line: Vec<u8>,
    /// Bytes of complete records returned so far.
    consumed: u64,
    /// Set when the stream ended in a fragment without a newline.
    torn: bool,
}

impl<'a> RecordReader<'a> {
    async fn open(
        path: &'a Path,
        limit: u64,
        timeout: Duration,
    ) -> Result<Option<Self>, DumpError> {
        let file = match fs::File::open(path).await {
            Ok(file) => file,
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(None),
            Err(source) => return Err(io_error(path, source)),
        };

        Ok(Some(RecordReader {
            path,
            reader: BufReader::new(file.take(limit)),
            timeout,
            line: Vec::new(),
            consumed: 0,
            torn: false,
        }))
    }

    /// Next complete record without its newline.
    async fn next_line(&mut self) -> Result<Option<&[u8]>, DumpError> {
        self.line.clear();
        let read = tokio::time::timeout(self.timeout, self.reader.read_until(b'\n', &mut self.line))
            .await
            .map_err(|_| DumpError::ReadTimeout {
                path: self.path.to_path_buf(),
                timeout: self.timeout,
            })?
            .map_err(|source| io_error(self.path, source))?;
        if read == 0 {
            return Ok(None);
        }

        let Some(line) = self.line.strip_suffix(b"\n") else {
            self.torn = true;
            return Ok(None);
        };
        self.consumed = self.consumed.saturating_add(u64::try_from(read).unwrap_or(u64::MAX));

        Ok(Some(line))
    }
}

async fn append_bytes(path: &Path, bytes: &[u8]) -> Result<(), DumpError> {
    let mut file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .await
        .map_err(|source| io_error(path, source))?;
    file.write_all(bytes).await.map_err(|source| io_error(path, source))?;
    file.sync_data().await.map_err(|source| io_error(path, source))
}

fn io_error(path: &Path, source: std::io::Error) -> DumpError {
    DumpError::Io { path: path.to_path_buf(), source }
}

#[derive(Debug, Error)]
pub enum DumpError {
    #[error("Dump io; path={}; err={source}", .path.display())]
    Io { path: PathBuf, source: std::io::Error },
    #[error("Dump read timed out; path={}; timeout={timeout:?}", .path.display())]
    ReadTimeout { path: PathBuf, timeout: Duration },
    #[error("Serialize dump record; err={0}")]
    Serialize(#[from] serde_json::Error),
    #[error("Replay enqueue; err={0}")]
    QueueClosed(#[from] QueueClosed),
}

/// Periodically moves the dump back into the queue once the destination is
/// reachable.
pub struct Replayer {
    pub(crate) dump: Arc<DumpFile>,
    pub(crate) queue: Arc<CollectQueue>,
    pub(crate) destination: Arc<dyn Destination>,
    pub(crate) health: Arc<DestinationHealth>,
    pub(crate) stats: Arc<PipelineStats>,
    pub(crate) interval: Duration,
}

impl Replayer {
    pub(crate) fn spawn(self, cxl: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(self.run(cxl))
    }

    async fn run(self, cxl: CancellationToken) {
        let mut interval = tokio::time::interval(self.interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;

                () = cxl.cancelled() => break,
                _ = interval.tick() => {}
            }

            tokio::select! {
                biased;

                () = cxl.cancelled() => break,
                () = self.tick() => {}
            }
        }
    }

    async fn tick(&self) {
        let bytes = match self.dump.len_bytes().await {
            Ok(bytes) => bytes,
            Err(err) => {
                warn!(%err, "failed to stat dump");
                return;
            }
        };
        self.stats.set_dump_bytes(bytes);
        if bytes == 0 {
            return;
        }

        if !self.health.is_up() {
            if !self.destination.ping().await {
                debug!(bytes, "destination still unreachable; keeping dump");
                return;
            }
            self.health.mark_up();
            info!(bytes, "destination reachable; replaying dump");
        }

        match self.dump.drain_and_replay(&self.queue).await {
            Ok(summary) => {
                self.stats.record_replayed(summary.points);
                self.stats.record_corrupt(summary.corrupt);
                info!(summary.records, summary.points, summary.corrupt, "replayed dump");
            }
            Err(err) => warn!(%err, "dump replay failed"),
        }

        if let Ok(bytes) = self.dump.len_bytes().await {
            self.stats.set_dump_bytes(bytes);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const READ_TIMEOUT: Duration = Duration::from_secs(5);

    fn point(i: i64) -> DataPoint {
        DataPoint::new(format!("p{i}"), i, 1.0)
    }

    async fn collect(queue: &CollectQueue, n: usize) -> Vec<DataPoint> {
        let mut points = Vec::new();
        while points.len() < n {
            let batch = queue
                .next_batch(n, Duration::from_millis(10), &CancellationToken::new())
                .await
                .unwrap();
            points.extend(batch);
        }

        points
    }

    #[tokio::test]
    async fn replay_preserves_order_and_empties() {
        let dir = tempfile::tempdir().unwrap();
        let dump =
            DumpFile::open(dir.path().join("nested/perfflux.dump"), READ_TIMEOUT).await.unwrap();
        dump.append(&[point(0), point(1)]).await.unwrap();
        dump.append(&[point(2)]).await.unwrap();
        let queue = CollectQueue::new(16);

        let summary = dump.drain_and_replay(&queue).await.unwrap();

        assert_eq!(summary, ReplaySummary { records: 2, points: 3, corrupt: 0 });
        assert_eq!(queue.drain().await, [point(0), point(1), point(2)]);
        assert_eq!(dump.len_bytes().await.unwrap(), 0);
        assert_eq!(dump.drain_and_replay(&queue).await.unwrap(), ReplaySummary::default());
    }

    #[tokio::test]
    async fn records_appended_during_replay_survive() {
        let dir = tempfile::tempdir().unwrap();
        let dump = Arc::new(DumpFile::open(dir.path().join("dump"), READ_TIMEOUT).await.unwrap());
        dump.append(&[point(0), point(1), point(2)]).await.unwrap();
        let queue = Arc::new(CollectQueue::new(1));

        let replay = tokio::spawn({
            let dump = dump.clone();
            let queue = queue.clone();
            async move { dump.drain_and_replay(&queue).await }
        });
        tokio::time::sleep(Duration::from_millis(20)).await;
        dump.append(&[point(9)]).await.unwrap();

        assert_eq!(collect(&queue, 3).await, [point(0), point(1), point(2)]);
        assert_eq!(replay.await.unwrap().unwrap().points, 3);

        let queue = CollectQueue::new(16);
        dump.drain_and_replay(&queue).await.unwrap();
        assert_eq!(queue.drain().await, [point(9)]);
    }

    #[tokio::test]
    async fn corrupt_and_torn_records_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("dump");
        let good = serde_json::to_string(&OverflowRecordBorrowed { seq: 4, points: &[point(1)] })
            .unwrap();
        std::fs::write(&path, format!("not json\n{good}\n{{\"seq\":5,\"poi")).unwrap();

        let dump = DumpFile::open(&path, READ_TIMEOUT).await.unwrap();
        dump.append(&[point(2)]).await.unwrap();
        let queue = CollectQueue::new(16);
        let summary = dump.drain_and_replay(&queue).await.unwrap();

        assert_eq!(summary, ReplaySummary { records: 2, points: 2, corrupt: 2 });
        assert_eq!(queue.drain().await, [point(1), point(2)]);
        let appended = std::fs::read_to_string(&path).unwrap();
        assert!(appended.is_empty());
    }

    #[tokio::test]
    async fn sequence_continues_after_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("dump");
        {
            let dump = DumpFile::open(&path, READ_TIMEOUT).await.unwrap();
            dump.append(&[point(0)]).await.unwrap();
            dump.append(&[point(1)]).await.unwrap();
        }

        let dump = DumpFile::open(&path, READ_TIMEOUT).await.unwrap();
        dump.append(&[point(2)]).await.unwrap();

        let contents = std::fs::read_to_string(&path).unwrap();
        let seqs: Vec<u64> = contents
            .lines()
            .map(|line| serde_json::from_str::<OverflowRecord>(line).unwrap().seq)
            .collect();
        assert_eq!(seqs, [0, 1, 2]);
    }

    #[tokio::test]
    async fn empty_batch_not_recorded() {
        let dir = tempfile::tempdir().unwrap();
        let dump = DumpFile::open(dir.path().join("dump"), READ_TIMEOUT).await.unwrap();

        dump.append(&[]).await.unwrap();

        assert_eq!(dump.len_bytes().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn replay_streams_large_dump_and_keeps_unterminated_tail() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("dump");
        let dump = DumpFile::open(&path, READ_TIMEOUT).await.unwrap();
        for i in 0..200 {
            dump.append(&[point(i)]).await.unwrap();
        }
        // A failed append can leave a fragment behind.
        let mut file = std::fs::OpenOptions::new().append(true).open(&path).unwrap();
        std::io::Write::write_all(&mut file, b"{\"seq\":9").unwrap();
        drop(file);
        let queue = CollectQueue::new(1_000);

        let summary = dump.drain_and_replay(&queue).await.unwrap();

        assert_eq!(summary, ReplaySummary { records: 200, points: 200, corrupt: 0 });
        assert_eq!(queue.drain().await, (0..200).map(point).collect::<Vec<_>>());
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "{\"seq\":9");
    }
}
