//! Append-only file (AOF) persistence.
//!
//! Mutating commands are queued by `add_aof` and written by a single
//! dedicated thread in queue order, so the order on disk is the order the
//! writes completed. The file is a flat stream of RESP command arrays with a
//! `SELECT <db>` entry whenever the database index changes, which means it can
//! be replayed through the same decoder as live client traffic.
//!
//! Lifecycle: `Uninitialized -> Replaying -> Running -> Draining -> Closed`.

use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread;
use std::time::{Duration, Instant};

use anyhow::Context;
use bytes::{Buf, Bytes, BytesMut};
use redis_protocol::codec::Resp2;
use redis_protocol::resp2::types::BytesFrame;
use tokio::io::AsyncReadExt;
use tokio::sync::{mpsc, oneshot};
use tokio_util::codec::Decoder;

use crate::connection::{Connection, ReplayConnection};
use crate::database::Database;
use crate::protocol::{encode_cmd_line, frame_to_cmd_line, is_error_reply, to_cmd_line, CmdLine};

/// Default capacity of the producer queue.
pub const AOF_QUEUE_SIZE: usize = 1 << 16;
/// Interval between syncs in `everysec` mode.
const FSYNC_INTERVAL: Duration = Duration::from_secs(1);
/// Read size used while replaying.
const REPLAY_READ_CHUNK: usize = 64 * 1024;
/// How often `close` reports that it is still waiting on the writer.
const CLOSE_WAIT_WARN: Duration = Duration::from_secs(5);

/// When the writer forces appended data to stable storage.
#[derive(Clone, Copy, Debug, PartialEq, Eq, clap::ValueEnum)]
pub enum AppendFsync {
    /// Sync after every entry.
    Always,
    /// Sync at most once per second.
    #[value(name = "everysec")]
    EverySec,
    /// Leave syncing to the operating system.
    No,
}

/// AOF options of one node.
#[derive(Clone, Debug)]
pub struct AofSettings {
    /// When false, `add_aof` drops every entry.
    pub enabled: bool,
    pub filename: PathBuf,
    pub fsync: AppendFsync,
    /// Capacity of the producer queue; producers wait when it is full.
    pub queue_size: usize,
}

impl AofSettings {
    /// Enabled, `everysec`, default queue size.
    pub fn new(filename: impl Into<PathBuf>) -> Self {
        Self {
            enabled: true,
            filename: filename.into(),
            fsync: AppendFsync::EverySec,
            queue_size: AOF_QUEUE_SIZE,
        }
    }
}

/// Lifecycle of an [`AofHandler`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AofState {
    Uninitialized,
    Replaying,
    Running,
    Draining,
    Closed,
}

/// Outcome of a replay pass.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ReplaySummary {
    /// Commands executed without an error reply.
    pub applied: u64,
    /// Commands that executed but returned an error reply.
    pub failed: u64,
    /// Frames or byte ranges that could not be decoded as commands.
    pub skipped: u64,
}

/// Snapshot of writer counters.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct AofStatsSnapshot {
    pub entries: u64,
    pub bytes: u64,
    pub write_errors: u64,
    pub fsyncs: u64,
}

#[derive(Default)]
struct AofStats {
    entries: AtomicU64,
    bytes: AtomicU64,
    write_errors: AtomicU64,
    fsyncs: AtomicU64,
}

impl AofStats {
    fn record_entry(&self, bytes: usize) {
        self.entries.fetch_add(1, Ordering::Relaxed);
        self.bytes.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    fn record_write_error(&self) {
        self.write_errors.fetch_add(1, Ordering::Relaxed);
    }

    fn record_fsync(&self) {
        self.fsyncs.fetch_add(1, Ordering::Relaxed);
    }

    fn snapshot(&self) -> AofStatsSnapshot {
        AofStatsSnapshot {
            entries: self.entries.load(Ordering::Relaxed),
            bytes: self.bytes.load(Ordering::Relaxed),
            write_errors: self.write_errors.load(Ordering::Relaxed),
            fsyncs: self.fsyncs.load(Ordering::Relaxed),
        }
    }
}

/// One logged mutation.
struct Payload {
    cmd_line: CmdLine,
    db_index: usize,
}

/// Pause handshake: the writer acks on `paused`, then waits on `resume`.
struct PauseWork {
    paused: oneshot::Sender<()>,
    resume: oneshot::Receiver<()>,
}

/// Work items consumed by the writer thread, in queue order.
enum AofCommand {
    Append(Payload),
    Pause(PauseWork),
}

/// Handle to the AOF of one node.
pub struct AofHandler {
    settings: AofSettings,
    state: Mutex<AofState>,
    queue: Mutex<Option<mpsc::Sender<AofCommand>>>,
    finished: Mutex<Option<oneshot::Receiver<File>>>,
    /// Database selected at the end of the file, when known from a full
    /// replay. The writer starts from it.
    file_db: Mutex<Option<usize>>,
    stats: Arc<AofStats>,
}

/// Held while appends are paused. Dropping it lets the writer continue.
pub struct AofPauseGuard {
    path: PathBuf,
    _resume: oneshot::Sender<()>,
}

impl AofPauseGuard {
    /// Path of the AOF; its contents are stable until the guard is dropped.
    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn resume(self) {}
}

impl AofHandler {
    /// Create a handler without touching the file.
    pub fn new(settings: AofSettings) -> Self {
        Self {
            settings,
            state: Mutex::new(AofState::Uninitialized),
            queue: Mutex::new(None),
            finished: Mutex::new(None),
            file_db: Mutex::new(None),
            stats: Arc::new(AofStats::default()),
        }
    }

    /// Replay the existing file into `db`, then start the writer.
    pub async fn open(settings: AofSettings, db: &dyn Database) -> anyhow::Result<Arc<Self>> {
        let handler = Arc::new(Self::new(settings));
        let summary = handler.load_aof(db, 0).await;
        tracing::info!(
            path = %handler.settings.filename.display(),
            applied = summary.applied,
            failed = summary.failed,
            skipped = summary.skipped,
            "aof replay finished"
        );
        handler.start()?;
        Ok(handler)
    }

    pub fn state(&self) -> AofState {
        *lock(&self.state)
    }

    pub fn path(&self) -> &Path {
        &self.settings.filename
    }

    pub fn stats(&self) -> AofStatsSnapshot {
        self.stats.snapshot()
    }

    /// Open the file for appending and spawn the writer thread.
    ///
    /// Without a prior full `load_aof` the database context at the end of the
    /// file is unknown, so the first entry is preceded by `SELECT`.
    pub fn start(&self) -> anyhow::Result<()> {
        let mut finished = lock(&self.finished);
        anyhow::ensure!(finished.is_none(), "aof writer already started");

        let file = open_for_append(&self.settings.filename).with_context(|| {
            format!("open aof {}", self.settings.filename.display())
        })?;
        let (tx, rx) = mpsc::channel(self.settings.queue_size.max(1));
        let (finished_tx, finished_rx) = oneshot::channel();
        let writer = AofWriter {
            file,
            fsync: self.settings.fsync,
            current_db: *lock(&self.file_db),
            stats: self.stats.clone(),
        };
        thread::Builder::new()
            .name("aof-writer".to_string())
            .spawn(move || {
                // Drives the queue and the everysec timer on this thread.
                match tokio::runtime::Builder::new_current_thread()
                    .enable_time()
                    .build()
                {
                    Ok(runtime) => writer.run(runtime, rx, finished_tx),
                    Err(err) => tracing::error!(error = ?err, "build aof writer runtime failed"),
                }
            })
            .context("spawn aof writer thread")?;

        *finished = Some(finished_rx);
        *lock(&self.queue) = Some(tx);
        *lock(&self.state) = AofState::Running;
        Ok(())
    }

    /// Queue a mutation for the writer.
    ///
    /// Waits only when the queue is full. A no-op when persistence is
    /// disabled or the queue is detached (replaying, closed).
    pub async fn add_aof(&self, db_index: usize, cmd_line: CmdLine) {
        if !self.settings.enabled {
            return;
        }
        let tx = lock(&self.queue).clone();
        let Some(tx) = tx else {
            return;
        };
        let payload = Payload { cmd_line, db_index };
        if tx.send(AofCommand::Append(payload)).await.is_err() {
            tracing::warn!("aof writer stopped, dropping entry");
        }
    }

    /// Replay the file through `db`, reading at most `max_bytes` bytes
    /// (0 reads the whole file).
    ///
    /// The producer queue is detached for the duration so replayed commands
    /// are not appended to the file being read. A missing file is not an
    /// error; undecodable input is logged and skipped.
    pub async fn load_aof(&self, db: &dyn Database, max_bytes: u64) -> ReplaySummary {
        let previous = std::mem::replace(&mut *lock(&self.state), AofState::Replaying);
        let detached = lock(&self.queue).take();

        let (summary, file_db) = match replay_file(&self.settings.filename, db, max_bytes).await {
            // A bounded read may stop before the last SELECT.
            Ok((summary, db_index)) => (summary, (max_bytes == 0).then_some(db_index)),
            Err(err) => {
                tracing::warn!(error = ?err, "aof replay aborted");
                (ReplaySummary::default(), None)
            }
        };

        *lock(&self.file_db) = file_db;
        *lock(&self.queue) = detached;
        *lock(&self.state) = previous;
        summary
    }

    /// Stop appends until the returned guard is dropped.
    ///
    /// Resolves once every entry queued before the call is written, so the
    /// file can be snapshotted or rewritten while the guard is held. Entries
    /// queued meanwhile wait in the queue.
    ///
    /// `close` cannot finish while a guard is alive; it keeps waiting and
    /// logs a warning every few seconds until the guard is dropped.
    pub async fn pause(&self) -> anyhow::Result<AofPauseGuard> {
        let tx = lock(&self.queue)
            .clone()
            .context("aof writer is not running")?;
        let (paused_tx, paused_rx) = oneshot::channel();
        let (resume_tx, resume_rx) = oneshot::channel();
        let work = PauseWork {
            paused: paused_tx,
            resume: resume_rx,
        };
        tx.send(AofCommand::Pause(work))
            .await
            .map_err(|_| anyhow::anyhow!("aof writer closed"))?;
        paused_rx
            .await
            .context("aof writer exited before pausing")?;
        Ok(AofPauseGuard {
            path: self.settings.filename.clone(),
            _resume: resume_tx,
        })
    }

    /// Drain queued entries, then close the file. Safe to call repeatedly.
    ///
    /// Waits for any outstanding [`AofPauseGuard`] to be dropped.
    pub async fn close(&self) {
        let finished = lock(&self.finished).take();
        let Some(mut finished) = finished else {
            return;
        };
        *lock(&self.state) = AofState::Draining;
        // Dropping the last sender closes the queue; the writer drains it and
        // hands the file back.
        drop(lock(&self.queue).take());

        let returned = loop {
            match tokio::time::timeout(CLOSE_WAIT_WARN, &mut finished).await {
                Ok(returned) => break returned,
                Err(_) => tracing::warn!(
                    path = %self.settings.filename.display(),
                    "aof close still waiting for the writer, is a pause guard held?"
                ),
            }
        };
        match returned {
            Ok(file) => {
                if let Err(err) = file.sync_all() {
                    tracing::warn!(error = ?err, "sync aof on close failed");
                }
            }
            Err(_) => tracing::warn!("aof writer exited without returning the file"),
        }
        *lock(&self.state) = AofState::Closed;
    }
}

/// State owned by the writer thread.
struct AofWriter {
    file: File,
    fsync: AppendFsync,
    /// Database of the last entry in the file; `None` forces a `SELECT`.
    current_db: Option<usize>,
    stats: Arc<AofStats>,
}

impl AofWriter {
    /// Consume the queue in order until every sender is gone, then hand the
    /// file back.
    fn run(
        mut self,
        runtime: tokio::runtime::Runtime,
        mut rx: mpsc::Receiver<AofCommand>,
        finished: oneshot::Sender<File>,
    ) {
        let mut last_sync = Instant::now();
        let mut dirty = false;
        let mut buf = BytesMut::new();

        loop {
            let next = if self.fsync == AppendFsync::EverySec && dirty {
                // Unsynced data is flushed once the interval passes, even if
                // no further entry arrives.
                let wait = FSYNC_INTERVAL.saturating_sub(last_sync.elapsed());
                match runtime.block_on(async { tokio::time::timeout(wait, rx.recv()).await }) {
                    Ok(next) => next,
                    Err(_) => {
                        self.sync();
                        last_sync = Instant::now();
                        dirty = false;
                        continue;
                    }
                }
            } else {
                runtime.block_on(rx.recv())
            };
            let Some(cmd) = next else {
                break;
            };

            match cmd {
                AofCommand::Append(payload) => {
                    self.write_payload(&mut buf, payload);
                    dirty = true;
                    let due = match self.fsync {
                        AppendFsync::Always => true,
                        AppendFsync::EverySec => last_sync.elapsed() >= FSYNC_INTERVAL,
                        AppendFsync::No => false,
                    };
                    if due {
                        self.sync();
                        last_sync = Instant::now();
                        dirty = false;
                    }
                }
                AofCommand::Pause(work) => {
                    if self.fsync != AppendFsync::No {
                        self.sync();
                        last_sync = Instant::now();
                        dirty = false;
                    }
                    if work.paused.send(()).is_ok() {
                        // Blocks until the guard is dropped.
                        let _ = work.resume.blocking_recv();
                    }
                }
            }
        }

        if self.fsync != AppendFsync::No {
            self.sync();
        }
        let _ = finished.send(self.file);
    }

    /// Write one payload, preceded by `SELECT` when the database changed.
    /// A failed write drops only this entry.
    fn write_payload(&mut self, buf: &mut BytesMut, payload: Payload) {
        if self.current_db != Some(payload.db_index) {
            let select = to_cmd_line(["SELECT".to_string(), payload.db_index.to_string()]);
            if let Err(err) = write_frame(&mut self.file, buf, &select) {
                tracing::warn!(error = ?err, db = payload.db_index, "aof select write failed");
                self.stats.record_write_error();
                return;
            }
            self.current_db = Some(payload.db_index);
        }
        match write_frame(&mut self.file, buf, &payload.cmd_line) {
            Ok(written) => self.stats.record_entry(written),
            Err(err) => {
                tracing::warn!(error = ?err, "aof write failed");
                self.stats.record_write_error();
            }
        }
    }

    fn sync(&self) {
        match self.file.sync_data() {
            Ok(()) => self.stats.record_fsync(),
            Err(err) => tracing::warn!(error = ?err, "aof fsync failed"),
        }
    }
}

fn write_frame(file: &mut File, buf: &mut BytesMut, cmd_line: &[Bytes]) -> anyhow::Result<usize> {
    buf.clear();
    encode_cmd_line(cmd_line, buf)?;
    file.write_all(buf).context("append to aof")?;
    Ok(buf.len())
}

fn open_for_append(path: &Path) -> std::io::Result<File> {
    OpenOptions::new().create(true).append(true).open(path)
}

/// Decode and execute every command frame in the file. Also returns the
/// database selected when replay stopped.
async fn replay_file(
    path: &Path,
    db: &dyn Database,
    max_bytes: u64,
) -> anyhow::Result<(ReplaySummary, usize)> {
    let file = match tokio::fs::File::open(path).await {
        Ok(file) => file,
        // Missing AOF means a fresh node.
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
            return Ok((ReplaySummary::default(), 0))
        }
        Err(err) => return Err(err).with_context(|| format!("open aof {}", path.display())),
    };
    let limit = if max_bytes > 0 { max_bytes } else { u64::MAX };
    let mut reader = file.take(limit);
    let mut codec = Resp2::default();
    let mut buf = BytesMut::with_capacity(REPLAY_READ_CHUNK);
    let mut conn = ReplayConnection::default();
    let mut summary = ReplaySummary::default();
    let mut eof = false;

    loop {
        match codec.decode(&mut buf) {
            Ok(Some(frame)) => {
                apply_frame(db, &mut conn, frame, &mut summary).await;
                continue;
            }
            Ok(None) => {}
            Err(err) => {
                // Resynchronize on the next line and keep going.
                if let Some(pos) = buf.windows(2).position(|w| w == b"\r\n") {
                    tracing::error!(error = %err, "aof parse error");
                    summary.skipped += 1;
                    buf.advance(pos + 2);
                    continue;
                }
                if eof {
                    tracing::error!(error = %err, "aof parse error at end of file");
                    summary.skipped += 1;
                    buf.clear();
                }
            }
        }

        if eof {
            if !buf.is_empty() {
                tracing::warn!(bytes = buf.len(), "aof ends with a truncated entry");
                summary.skipped += 1;
            }
            break;
        }
        buf.reserve(REPLAY_READ_CHUNK);
        let read = reader.read_buf(&mut buf).await.context("read aof")?;
        eof = read == 0;
    }
    Ok((summary, conn.db_index()))
}

async fn apply_frame(
    db: &dyn Database,
    conn: &mut ReplayConnection,
    frame: BytesFrame,
    summary: &mut ReplaySummary,
) {
    let cmd_line = match frame_to_cmd_line(frame) {
        Ok(cmd_line) if !cmd_line.is_empty() => cmd_line,
        Ok(_) => {
            tracing::error!("aof contains an empty command");
            summary.skipped += 1;
            return;
        }
        Err(err) => {
            tracing::error!(error = %err, "aof entry is not a command");
            summary.skipped += 1;
            return;
        }
    };
    let reply = db.exec(conn, &cmd_line).await;
    if is_error_reply(&reply) {
        tracing::error!(reply = ?reply, "aof replay exec error");
        summary.failed += 1;
    } else {
        summary.applied += 1;
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
