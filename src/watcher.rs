//! Span watcher: tails the log from a cursor and hands out spans in order.
//!
//! Delivery is at-least-once. `next` keeps returning the same span until the
//! caller `commit`s it, so a crash between the two replays that span on
//! restart.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tracing::{debug, warn};

use crate::span_log::{LogEntry, SpanLog};

/// Poll timing for a watcher.
#[derive(Debug, Clone)]
pub struct WatchConfig {
    /// Sleep after the first empty poll.
    pub poll_min: Duration,
    /// Backoff ceiling while the log stays idle.
    pub poll_max: Duration,
}

impl Default for WatchConfig {
    fn default() -> Self {
        Self {
            poll_min: Duration::from_millis(25),
            poll_max: Duration::from_secs(1),
        }
    }
}

// ---------------------------------------------------------------------------
// Shutdown
// ---------------------------------------------------------------------------

/// Cooperative shutdown signal shared by every watcher in a process.
///
/// Cloning shares the signal. Once triggered it stays triggered.
#[derive(Clone)]
pub struct Shutdown {
    tx: Arc<watch::Sender<bool>>,
}

impl Shutdown {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(false);
        Self { tx: Arc::new(tx) }
    }

    pub fn trigger(&self) {
        self.tx.send_replace(true);
    }

    pub fn is_triggered(&self) -> bool {
        *self.tx.borrow()
    }

    /// Resolve once the signal has been triggered.
    pub async fn wait(&self) {
        let mut rx = self.tx.subscribe();
        // The sender lives in `self`, so the channel cannot close under us.
        let _ = rx.wait_for(|stop| *stop).await;
    }
}

impl Default for Shutdown {
    fn default() -> Self {
        Self::new()
    }
}

// ---------------------------------------------------------------------------
// Watcher
// ---------------------------------------------------------------------------

/// Per-consumer cursor over a [`SpanLog`].
pub struct SpanWatcher {
    log: Arc<SpanLog>,
    config: WatchConfig,
    shutdown: Shutdown,
    /// Offset of the first uncommitted byte.
    cursor: u64,
    /// Offset up to which the log has been fetched into `pending`.
    fetched_upto: u64,
    pending: VecDeque<LogEntry>,
    backoff: Duration,
}

impl SpanWatcher {
    /// Watch `log` starting at `offset` (0, or a checkpointed cursor).
    pub fn new(log: Arc<SpanLog>, offset: u64, config: WatchConfig, shutdown: Shutdown) -> Self {
        let backoff = config.poll_min;
        Self {
            log,
            config,
            shutdown,
            cursor: offset,
            fetched_upto: offset,
            pending: VecDeque::new(),
            backoff,
        }
    }

    /// Current committed offset. Persist this to resume after a restart.
    pub fn cursor(&self) -> u64 {
        self.cursor
    }

    /// Next uncommitted span. Suspends with backoff while the log is idle.
    /// Returns `None` once shutdown has been triggered.
    pub async fn next(&mut self) -> Option<LogEntry> {
        loop {
            if self.shutdown.is_triggered() {
                return None;
            }
            if let Some(entry) = self.pending.front() {
                return Some(entry.clone());
            }

            match self.fetch().await {
                Ok(true) => {
                    self.backoff = self.config.poll_min;
                    continue;
                }
                Ok(false) => {}
                Err(e) => warn!(offset = self.fetched_upto, "span log read failed, backing off: {e}"),
            }

            tokio::select! {
                _ = self.shutdown.wait() => return None,
                _ = tokio::time::sleep(self.backoff) => {}
            }
            self.backoff = (self.backoff * 2).min(self.config.poll_max);
        }
    }

    /// Non-blocking variant of [`next`](Self::next): one fetch attempt,
    /// `None` when the log has nothing new.
    pub async fn try_next(&mut self) -> crate::error::Result<Option<LogEntry>> {
        if self.pending.is_empty() {
            self.fetch().await?;
        }
        Ok(self.pending.front().cloned())
    }

    /// Mark the span last returned by `next` as fully processed.
    pub fn commit(&mut self) {
        if let Some(entry) = self.pending.pop_front() {
            self.cursor = entry.next;
        }
        if self.pending.is_empty() {
            // Anything between the last entry and the fetch horizon was
            // blank or malformed; nothing left to redeliver there.
            self.cursor = self.fetched_upto;
        }
    }

    /// Pull newly appended records. Returns whether anything was consumed.
    async fn fetch(&mut self) -> crate::error::Result<bool> {
        let batch = self.log.read_from(self.fetched_upto).await?;
        if batch.end == self.fetched_upto {
            return Ok(false);
        }

        debug!(
            from = self.fetched_upto,
            to = batch.end,
            spans = batch.entries.len(),
            skipped = batch.skipped.len(),
            "fetched spans"
        );

        self.fetched_upto = batch.end;
        self.pending.extend(batch.entries);
        if self.pending.is_empty() {
            self.cursor = self.fetched_upto;
        }
        Ok(true)
    }
}
