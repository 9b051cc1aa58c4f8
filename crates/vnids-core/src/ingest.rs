//! Event ingest: turns the engine's EVE stream into queued records.
//!
//! The engine writes one JSON object per line. [`LineBuffer`] reassembles
//! lines from arbitrary read chunks, holding back an unterminated tail
//! until its newline arrives. [`EventIngest::ingest_line`] parses each line
//! on its own: a bad line is counted and dropped and never affects its
//! neighbours.
//!
//! Two sources feed it: [`EventIngest::tail_file`] follows a growing EVE
//! log across truncation and rotation, and [`EventIngest::follow_socket`]
//! reads the engine's `unix_stream` EVE output, reconnecting on loss.

use std::os::unix::fs::MetadataExt;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::fs::File;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncSeekExt, SeekFrom};
use tokio::net::UnixStream;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use crate::daemon::ShutdownSignal;
use crate::dispatch::EventDispatcher;
use crate::event::{EngineStats, EventKind, EveLine, ParseError, parse_line};
use crate::queue::EventQueue;

/// Longest EVE line accepted before it is discarded.
pub const MAX_LINE_BYTES: usize = 1024 * 1024;

const READ_CHUNK: usize = 16 * 1024;

/// Leading bytes compared to spot a log truncated and rewritten in place.
const HEAD_BYTES: u64 = 256;

/// Reassembles newline-delimited lines from a byte stream.
#[derive(Debug)]
pub struct LineBuffer {
    buf: Vec<u8>,
    scanned: usize,
    max_line: usize,
    discarding: bool,
}

impl LineBuffer {
    pub fn new(max_line: usize) -> Self {
        Self {
            buf: Vec::new(),
            scanned: 0,
            max_line,
            discarding: false,
        }
    }

    pub fn extend(&mut self, chunk: &[u8]) {
        self.buf.extend_from_slice(chunk);
    }

    /// Bytes held back waiting for a terminator.
    pub fn pending(&self) -> usize {
        self.buf.len()
    }

    pub fn clear(&mut self) {
        self.buf.clear();
        self.scanned = 0;
        self.discarding = false;
    }

    /// Next complete line, without its `\n` (or `\r\n`).
    ///
    /// A line that grows past the limit yields one [`ParseError::LineTooLong`]
    /// and the rest of it is skipped up to its terminator.
    pub fn next_line(&mut self) -> Option<Result<String, ParseError>> {
        loop {
            let newline = self.buf[self.scanned..]
                .iter()
                .position(|&b| b == b'\n')
                .map(|i| self.scanned + i);

            let Some(end) = newline else {
                self.scanned = self.buf.len();
                if !self.discarding && self.buf.len() > self.max_line {
                    let len = self.buf.len();
                    self.discarding = true;
                    self.buf.clear();
                    self.scanned = 0;
                    return Some(Err(ParseError::LineTooLong {
                        len,
                        limit: self.max_line,
                    }));
                }
                if self.discarding {
                    self.buf.clear();
                    self.scanned = 0;
                }
                return None;
            };

            let mut line: Vec<u8> = self.buf.drain(..=end).collect();
            self.scanned = 0;
            line.pop();
            if line.last() == Some(&b'\r') {
                line.pop();
            }

            if self.discarding {
                self.discarding = false;
                continue;
            }
            if line.len() > self.max_line {
                return Some(Err(ParseError::LineTooLong {
                    len: line.len(),
                    limit: self.max_line,
                }));
            }
            return Some(String::from_utf8(line).map_err(|_| ParseError::InvalidUtf8));
        }
    }
}

/// What happened to one line.
#[derive(Debug)]
pub enum IngestOutcome {
    Queued,
    /// Parsed, but the queue was full.
    Dropped,
    Rejected(ParseError),
    /// An engine `stats` record; the snapshot was replaced.
    Stats,
    Blank,
}

/// Ingest counters, shared with the IPC server.
#[derive(Debug, Default)]
pub struct IngestStats {
    lines: AtomicU64,
    parsed: AtomicU64,
    parse_errors: AtomicU64,
    alerts: AtomicU64,
    flows: AtomicU64,
    anomalies: AtomicU64,
    stats_records: AtomicU64,
    reconnects: AtomicU64,
    engine: Mutex<Option<EngineStats>>,
}

/// Point-in-time copy of [`IngestStats`].
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct IngestCounters {
    pub lines_read: u64,
    pub events_processed: u64,
    pub parse_errors: u64,
    pub alerts_total: u64,
    pub flows_total: u64,
    pub anomalies_total: u64,
    pub stats_records: u64,
    pub source_reconnects: u64,
}

impl IngestStats {
    pub fn counters(&self) -> IngestCounters {
        IngestCounters {
            lines_read: self.lines.load(Ordering::Relaxed),
            events_processed: self.parsed.load(Ordering::Relaxed),
            parse_errors: self.parse_errors.load(Ordering::Relaxed),
            alerts_total: self.alerts.load(Ordering::Relaxed),
            flows_total: self.flows.load(Ordering::Relaxed),
            anomalies_total: self.anomalies.load(Ordering::Relaxed),
            stats_records: self.stats_records.load(Ordering::Relaxed),
            source_reconnects: self.reconnects.load(Ordering::Relaxed),
        }
    }

    /// Latest engine `stats` record, if one has been seen.
    pub fn engine_stats(&self) -> Option<EngineStats> {
        self.engine
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

/// Parses EVE lines and feeds the event queue.
#[derive(Debug, Clone)]
pub struct EventIngest {
    queue: EventQueue,
    dispatcher: Option<EventDispatcher>,
    stats: Arc<IngestStats>,
    max_line: usize,
}

impl EventIngest {
    pub fn new(queue: EventQueue) -> Self {
        Self {
            queue,
            dispatcher: None,
            stats: Arc::new(IngestStats::default()),
            max_line: MAX_LINE_BYTES,
        }
    }

    /// Also publish every parsed record, whether or not the queue takes it.
    pub fn with_dispatcher(mut self, dispatcher: EventDispatcher) -> Self {
        self.dispatcher = Some(dispatcher);
        self
    }

    pub fn with_max_line(mut self, max_line: usize) -> Self {
        self.max_line = max_line;
        self
    }

    pub fn stats(&self) -> Arc<IngestStats> {
        Arc::clone(&self.stats)
    }

    pub fn queue(&self) -> &EventQueue {
        &self.queue
    }

    /// Parse one line and queue the result.
    pub fn ingest_line(&self, line: &str) -> IngestOutcome {
        if line.trim().is_empty() {
            return IngestOutcome::Blank;
        }
        self.stats.lines.fetch_add(1, Ordering::Relaxed);

        match parse_line(line) {
            Ok(EveLine::Event(record)) => {
                self.stats.parsed.fetch_add(1, Ordering::Relaxed);
                let counter = match record.event_type {
                    EventKind::Alert => Some(&self.stats.alerts),
                    EventKind::Flow => Some(&self.stats.flows),
                    EventKind::Anomaly => Some(&self.stats.anomalies),
                    EventKind::Other(_) => None,
                };
                if let Some(counter) = counter {
                    counter.fetch_add(1, Ordering::Relaxed);
                }
                let record = Arc::new(record);
                if let Some(dispatcher) = &self.dispatcher {
                    dispatcher.publish(Arc::clone(&record));
                }
                if self.queue.push(record) {
                    IngestOutcome::Queued
                } else {
                    IngestOutcome::Dropped
                }
            }
            Ok(EveLine::Stats(snapshot)) => {
                self.stats.stats_records.fetch_add(1, Ordering::Relaxed);
                *self
                    .stats
                    .engine
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner) = Some(snapshot);
                IngestOutcome::Stats
            }
            Err(e) => self.reject(e),
        }
    }

    fn reject(&self, error: ParseError) -> IngestOutcome {
        self.stats.parse_errors.fetch_add(1, Ordering::Relaxed);
        debug!(error = %error, "dropping unparseable EVE line");
        IngestOutcome::Rejected(error)
    }

    /// Feed a raw chunk and ingest every line it completes.
    pub fn ingest_chunk(&self, buffer: &mut LineBuffer, chunk: &[u8]) -> usize {
        buffer.extend(chunk);
        let mut lines = 0;
        while let Some(line) = buffer.next_line() {
            lines += 1;
            match line {
                Ok(line) => {
                    self.ingest_line(&line);
                }
                Err(e) => {
                    self.stats.lines.fetch_add(1, Ordering::Relaxed);
                    self.reject(e);
                }
            }
        }
        lines
    }

    /// Ingest from `reader` until EOF or shutdown.
    ///
    /// An unterminated fragment left at EOF is discarded.
    pub async fn read_stream<R>(
        &self,
        mut reader: R,
        shutdown: &mut broadcast::Receiver<ShutdownSignal>,
    ) -> std::io::Result<()>
    where
        R: AsyncRead + Unpin,
    {
        let mut buffer = LineBuffer::new(self.max_line);
        let mut chunk = vec![0u8; READ_CHUNK];
        loop {
            let n = tokio::select! {
                _ = shutdown.recv() => return Ok(()),
                n = reader.read(&mut chunk) => n?,
            };
            if n == 0 {
                if buffer.pending() > 0 {
                    debug!(bytes = buffer.pending(), "discarding unterminated EVE fragment at EOF");
                }
                return Ok(());
            }
            self.ingest_chunk(&mut buffer, &chunk[..n]);
        }
    }

    /// Follow a growing EVE log file until shutdown.
    ///
    /// A file present at startup is read from its current end; a file that
    /// appears later, or replaces a rotated or truncated one, is read from
    /// the beginning. After a read error the same file is picked up again
    /// at the last offset.
    pub async fn tail_file(
        &self,
        path: &Path,
        poll_interval: Duration,
        mut shutdown: broadcast::Receiver<ShutdownSignal>,
    ) {
        let mut buffer = LineBuffer::new(self.max_line);
        let mut chunk = vec![0u8; READ_CHUNK];
        let mut current: Option<TailedFile> = None;
        let mut start = StartAt::End;

        loop {
            if current.is_none() {
                let resume_at = match &start {
                    StartAt::Resume(position) => Some(position.offset),
                    _ => None,
                };
                current = TailedFile::open(path, std::mem::replace(&mut start, StartAt::Beginning)).await;
                if resume_at.is_none() || current.as_ref().map(|t| t.offset) != resume_at {
                    buffer.clear();
                }
            }

            if let Some(tailed) = current.as_mut() {
                match tailed.read_available(&mut chunk, |bytes| {
                    self.ingest_chunk(&mut buffer, bytes);
                })
                .await
                {
                    Ok(()) => {
                        if tailed.replaced(path).await {
                            info!(path = %path.display(), "EVE log rotated or truncated, reopening");
                            self.stats.reconnects.fetch_add(1, Ordering::Relaxed);
                            current = None;
                            continue;
                        }
                    }
                    Err(e) => {
                        warn!(
                            path = %path.display(),
                            offset = tailed.offset,
                            error = %e,
                            "EVE log read failed, reopening"
                        );
                        start = StartAt::Resume(tailed.position());
                        current = None;
                    }
                }
            }

            tokio::select! {
                _ = shutdown.recv() => break,
                _ = tokio::time::sleep(poll_interval) => {}
            }
        }
        debug!(path = %path.display(), "EVE tail stopped");
    }

    /// Read the engine's EVE unix-stream socket until shutdown, reconnecting
    /// after `retry_delay` whenever the connection is lost.
    pub async fn follow_socket(
        &self,
        path: &Path,
        retry_delay: Duration,
        mut shutdown: broadcast::Receiver<ShutdownSignal>,
    ) {
        loop {
            match UnixStream::connect(path).await {
                Ok(stream) => {
                    info!(path = %path.display(), "connected to EVE socket");
                    if let Err(e) = self.read_stream(stream, &mut shutdown).await {
                        warn!(path = %path.display(), error = %e, "EVE socket read failed");
                    }
                }
                Err(e) => debug!(path = %path.display(), error = %e, "EVE socket not available"),
            }

            self.stats.reconnects.fetch_add(1, Ordering::Relaxed);
            tokio::select! {
                _ = shutdown.recv() => break,
                _ = tokio::time::sleep(retry_delay) => {}
            }
        }
        debug!(path = %path.display(), "EVE socket reader stopped");
    }
}

/// Where a freshly opened EVE log is read from.
#[derive(Debug)]
enum StartAt {
    End,
    Beginning,
    /// Continue a previous handle if the file is still the one it read.
    Resume(Position),
}

/// Identity of a tailed file and how far into it we have read.
#[derive(Debug, Clone, PartialEq, Eq)]
struct Position {
    ino: u64,
    offset: u64,
    head: Vec<u8>,
}

/// An open EVE log and how far into it we have read.
struct TailedFile {
    file: File,
    offset: u64,
    ino: u64,
    head: Vec<u8>,
}

impl TailedFile {
    async fn open(path: &Path, start: StartAt) -> Option<Self> {
        let mut file = match File::open(path).await {
            Ok(f) => f,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return None,
            Err(e) => {
                warn!(path = %path.display(), error = %e, "cannot open EVE log");
                return None;
            }
        };
        let meta = file.metadata().await.ok()?;
        let ino = meta.ino();
        let head = read_head(&mut file).await.ok()?;

        let offset = match start {
            StartAt::End => meta.len(),
            StartAt::Beginning => 0,
            StartAt::Resume(pos) if pos.ino == ino && pos.offset <= meta.len() && head.starts_with(&pos.head) => {
                pos.offset
            }
            StartAt::Resume(pos) => {
                info!(path = %path.display(), offset = pos.offset, "EVE log changed while reopening, starting over");
                0
            }
        };
        let offset = file.seek(SeekFrom::Start(offset)).await.ok()?;
        info!(path = %path.display(), offset, "tailing EVE log");
        Some(Self {
            file,
            offset,
            ino,
            head,
        })
    }

    fn position(&self) -> Position {
        Position {
            ino: self.ino,
            offset: self.offset,
            head: self.head.clone(),
        }
    }

    async fn read_available(
        &mut self,
        chunk: &mut [u8],
        mut sink: impl FnMut(&[u8]),
    ) -> std::io::Result<()> {
        loop {
            let n = self.file.read(chunk).await?;
            if n == 0 {
                return Ok(());
            }
            self.offset += n as u64;
            sink(&chunk[..n]);
        }
    }

    /// Whether the path now names a different, shorter, or rewritten file.
    ///
    /// A copytruncate rotation followed by enough new writes to pass our
    /// offset keeps the inode and the length check happy; the leading bytes
    /// give it away.
    async fn replaced(&mut self, path: &Path) -> bool {
        match tokio::fs::metadata(path).await {
            Ok(meta) if meta.ino() != self.ino || meta.len() < self.offset => return true,
            Ok(_) => {}
            Err(_) => return true,
        }
        let head = match File::open(path).await {
            Ok(mut file) => read_head(&mut file).await,
            Err(e) => Err(e),
        };
        match head {
            Ok(head) if head.starts_with(&self.head) => {
                self.head = head;
                false
            }
            Ok(_) => true,
            Err(e) => {
                debug!(path = %path.display(), error = %e, "cannot fingerprint EVE log");
                e.kind() == std::io::ErrorKind::NotFound
            }
        }
    }
}

/// Up to [`HEAD_BYTES`] from the start of `file`. Leaves the cursor moved.
async fn read_head(file: &mut File) -> std::io::Result<Vec<u8>> {
    let mut head = Vec::with_capacity(HEAD_BYTES as usize);
    file.seek(SeekFrom::Start(0)).await?;
    (&mut *file).take(HEAD_BYTES).read_to_end(&mut head).await?;
    Ok(head)
}
