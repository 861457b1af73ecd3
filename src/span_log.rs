//! Append-only span log backed by a JSONL file.
//!
//! Single source of truth for all coordination. One span per line; the byte
//! offset at which a line starts is its position, so positions grow
//! monotonically and `read_from` can seek straight to a checkpoint.
//! Appends serialize through an in-process mutex plus an exclusive file
//! lock, so handles in other processes (the CLI, a second swarm) never
//! interleave with the index catch-up and write. Readers take no lock.

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use fs2::FileExt;
use opentelemetry::KeyValue;
use tokio::fs::{File, OpenOptions};
use tokio::io::{AsyncBufReadExt, AsyncSeekExt, AsyncWriteExt, BufReader};
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::error::{Error, Result};
use crate::model::Span;
use crate::telemetry::metrics;

/// Upper bound on entries returned by one `read_from` call.
const MAX_BATCH: usize = 1024;

/// Configuration for opening a span log.
#[derive(Debug, Clone)]
pub struct LogConfig {
    pub path: PathBuf,
    /// `fsync` after every append so a returned position survives a crash.
    pub sync_on_append: bool,
}

impl LogConfig {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            sync_on_append: true,
        }
    }
}

/// One decoded record and where it lives in the file.
#[derive(Debug, Clone)]
pub struct LogEntry {
    /// Offset of the first byte of the line.
    pub position: u64,
    /// Offset just past the line's newline; where the next read starts.
    pub next: u64,
    pub span: Span,
}

/// A line that could not be decoded. Reported, then stepped over.
#[derive(Debug, Clone)]
pub struct SkippedLine {
    pub position: u64,
    pub reason: String,
}

impl From<SkippedLine> for Error {
    fn from(line: SkippedLine) -> Self {
        Error::Parse {
            position: line.position,
            reason: line.reason,
        }
    }
}

/// Result of one read pass.
#[derive(Debug, Default)]
pub struct ReadBatch {
    pub entries: Vec<LogEntry>,
    pub skipped: Vec<SkippedLine>,
    /// Offset after the last complete line consumed. Equal to the requested
    /// offset when nothing new was available.
    pub end: u64,
}

impl ReadBatch {
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty() && self.skipped.is_empty()
    }
}

/// Writer-side state, guarded by the append lock.
struct Writer {
    file: File,
    /// Second handle on the same open file, used only for `flock`.
    lock: std::fs::File,
    /// How far the span-id index has been built.
    indexed_upto: u64,
    span_ids: HashSet<String>,
}

/// The shared span log.
pub struct SpanLog {
    path: PathBuf,
    sync_on_append: bool,
    writer: Mutex<Writer>,
}

impl SpanLog {
    /// Open or create the log at `config.path`, indexing existing span ids.
    pub async fn open(config: LogConfig) -> Result<Self> {
        if let Some(parent) = config.path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await?;
            }
        }

        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&config.path)
            .await?;
        let lock = file.try_clone().await?.into_std().await;

        let log = Self {
            path: config.path,
            sync_on_append: config.sync_on_append,
            writer: Mutex::new(Writer {
                file,
                lock,
                indexed_upto: 0,
                span_ids: HashSet::new(),
            }),
        };

        {
            let mut writer = log.writer.lock().await;
            let _guard = FileLock::acquire(&writer.lock).await?;
            log.catch_up_index(&mut writer).await?;
            log.terminate_torn_tail(&mut writer).await?;

            debug!(
                path = %log.path.display(),
                spans = writer.span_ids.len(),
                "span log opened"
            );
        }

        Ok(log)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append a span. Returns its position once the line is written (and
    /// synced, if configured).
    pub async fn append(&self, span: &Span) -> Result<u64> {
        let mut writer = self.writer.lock().await;
        let _guard = FileLock::acquire(&writer.lock).await?;
        self.catch_up_index(&mut writer).await?;
        self.write_locked(&mut writer, span).await
    }

    /// Append unless a span with the same `span_id` is already in the log.
    /// Returns `None` for a duplicate. Spans without an id always append.
    pub async fn append_unique(&self, span: &Span) -> Result<Option<u64>> {
        let mut writer = self.writer.lock().await;
        let _guard = FileLock::acquire(&writer.lock).await?;
        self.catch_up_index(&mut writer).await?;

        if let Some(id) = &span.span_id {
            if writer.span_ids.contains(id) {
                debug!(span = %span.name, span_id = %id, "duplicate span not appended");
                metrics::spans_deduplicated().add(1, &[KeyValue::new("span", span.name.clone())]);
                return Ok(None);
            }
        }

        self.write_locked(&mut writer, span).await.map(Some)
    }

    /// Whether a span id has been appended (as of the last index catch-up).
    pub async fn contains_span_id(&self, span_id: &str) -> Result<bool> {
        let mut writer = self.writer.lock().await;
        self.catch_up_index(&mut writer).await?;
        Ok(writer.span_ids.contains(span_id))
    }

    /// Read complete records starting at `offset`. A trailing line without
    /// its newline is left for a later call. Malformed lines are skipped and
    /// reported in the batch.
    pub async fn read_from(&self, offset: u64) -> Result<ReadBatch> {
        let file = match File::open(&self.path).await {
            Ok(file) => file,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Ok(ReadBatch {
                    end: offset,
                    ..ReadBatch::default()
                });
            }
            Err(e) => return Err(e.into()),
        };

        let len = file.metadata().await?.len();
        if len < offset {
            return Err(Error::Other(format!(
                "span log {} shrank to {len} bytes, below offset {offset}",
                self.path.display()
            )));
        }

        let mut reader = BufReader::new(file);
        reader.seek(std::io::SeekFrom::Start(offset)).await?;

        let mut batch = ReadBatch {
            end: offset,
            ..ReadBatch::default()
        };
        let mut buf = Vec::new();

        while batch.entries.len() < MAX_BATCH {
            buf.clear();
            let n = reader.read_until(b'\n', &mut buf).await?;
            if n == 0 || buf.last() != Some(&b'\n') {
                break;
            }

            let position = batch.end;
            batch.end += n as u64;

            let line = match std::str::from_utf8(&buf) {
                Ok(line) => line.trim(),
                Err(e) => {
                    batch.skipped.push(skip(&self.path, position, e.to_string()));
                    continue;
                }
            };
            if line.is_empty() {
                continue;
            }

            match Span::from_json_line(line) {
                Ok(span) => batch.entries.push(LogEntry {
                    position,
                    next: batch.end,
                    span,
                }),
                Err(e) => batch.skipped.push(skip(&self.path, position, e.to_string())),
            }
        }

        Ok(batch)
    }

    /// Every decodable span currently in the log, in order.
    pub async fn read_all(&self) -> Result<Vec<LogEntry>> {
        let mut entries = Vec::new();
        let mut offset = 0;
        loop {
            let batch = self.read_from(offset).await?;
            if batch.end == offset {
                return Ok(entries);
            }
            offset = batch.end;
            entries.extend(batch.entries);
        }
    }

    /// All spans of one trace, in log order.
    pub async fn trace(&self, trace_id: &str) -> Result<Vec<Span>> {
        Ok(self
            .read_all()
            .await?
            .into_iter()
            .filter(|entry| entry.span.trace_id == trace_id)
            .map(|entry| entry.span)
            .collect())
    }

    /// Write one line at the end of the log. Caller holds both locks and
    /// has caught the index up, so the end of the indexed region is the end
    /// of the file once any torn tail is terminated.
    async fn write_locked(&self, writer: &mut Writer, span: &Span) -> Result<u64> {
        let mut line = span.to_json_line()?;
        line.push('\n');

        self.terminate_torn_tail(writer).await?;
        let position = writer.indexed_upto;
        writer.file.write_all(line.as_bytes()).await?;
        writer.file.flush().await?;
        if self.sync_on_append {
            writer.file.sync_data().await?;
        }

        writer.indexed_upto = position + line.len() as u64;
        if let Some(id) = &span.span_id {
            writer.span_ids.insert(id.clone());
        }

        metrics::spans_appended().add(1, &[KeyValue::new("span", span.name.clone())]);
        debug!(span = %span.name, trace_id = %span.trace_id, position, "span appended");
        Ok(position)
    }

    /// A writer that died mid-append can leave a line without its newline.
    /// Terminate it so the next record starts on a fresh line; the torn
    /// line then reads as one malformed record.
    async fn terminate_torn_tail(&self, writer: &mut Writer) -> Result<()> {
        let len = tokio::fs::metadata(&self.path).await?.len();
        if len > writer.indexed_upto {
            warn!(
                path = %self.path.display(),
                position = writer.indexed_upto,
                "terminating torn trailing line"
            );
            writer.file.write_all(b"\n").await?;
            writer.file.flush().await?;
            self.catch_up_index(writer).await?;
        }
        Ok(())
    }

    /// Fold lines appended since the last catch-up (possibly by another
    /// process) into the span-id index.
    async fn catch_up_index(&self, writer: &mut Writer) -> Result<()> {
        loop {
            let batch = self.read_from(writer.indexed_upto).await?;
            if batch.end == writer.indexed_upto {
                return Ok(());
            }
            writer.indexed_upto = batch.end;
            writer
                .span_ids
                .extend(batch.entries.into_iter().filter_map(|entry| entry.span.span_id));
        }
    }
}

/// Exclusive advisory lock on the log file, released on drop.
struct FileLock(std::fs::File);

impl FileLock {
    async fn acquire(file: &std::fs::File) -> Result<Self> {
        let file = file.try_clone()?;
        tokio::task::spawn_blocking(move || file.lock_exclusive().map(|()| Self(file)))
            .await
            .map_err(|e| Error::Other(format!("span log lock task failed: {e}")))?
            .map_err(Error::from)
    }
}

impl Drop for FileLock {
    fn drop(&mut self) {
        let _ = FileExt::unlock(&self.0);
    }
}

fn skip(path: &Path, position: u64, reason: String) -> SkippedLine {
    warn!(path = %path.display(), position, %reason, "skipping malformed span line");
    metrics::parse_errors().add(1, &[]);
    SkippedLine { position, reason }
}
