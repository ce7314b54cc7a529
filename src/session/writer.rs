//! Batched asynchronous writer for a session's append-only JSONL log.
//!
//! A dedicated background task owns the file; callers hand it whole
//! records over an unbounded command channel. The buffer flushes when it
//! reaches the batch size or when the flush interval elapses, and a flush
//! always writes complete newline-terminated lines, so readers never see a
//! record split across flushes.

use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::fs::OpenOptions;
use tokio::io::AsyncWriteExt;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, warn};

use crate::error::{Result, session_err};

pub const MESSAGES_FILE: &str = "messages.jsonl";
const BACKUP_FILE: &str = "messages.backup.jsonl";
const QUEUE_HIGH_WATER: usize = 1000;

enum WriteCommand {
    Append(String),
    Flush(oneshot::Sender<()>),
    Close(oneshot::Sender<()>),
}

pub struct JsonlWriter {
    tx: mpsc::UnboundedSender<WriteCommand>,
    queued: Arc<AtomicUsize>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl JsonlWriter {
    pub fn new(session_dir: PathBuf, batch_size: usize, flush_interval: Duration) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let queued = Arc::new(AtomicUsize::new(0));

        let worker = Worker {
            session_dir,
            batch_size: batch_size.max(1),
            buffer: Vec::new(),
            queued: Arc::clone(&queued),
        };
        let handle = tokio::spawn(worker.run(rx, flush_interval));

        Self {
            tx,
            queued,
            handle: Mutex::new(Some(handle)),
        }
    }

    /// Enqueue one record. The record must serialize to a single JSON
    /// object; it becomes exactly one line in the file.
    pub fn append<T: serde::Serialize>(&self, record: &T) -> Result<()> {
        let line = serde_json::to_string(record)?;

        let depth = self.queued.fetch_add(1, Ordering::Relaxed) + 1;
        if depth == QUEUE_HIGH_WATER {
            warn!(queued = depth, "JSONL write queue passed high-water mark");
        }

        self.tx
            .send(WriteCommand::Append(line))
            .map_err(|_| session_err("JSONL writer is closed"))
    }

    /// Force a flush of everything appended so far.
    pub async fn flush(&self) -> Result<()> {
        let (ack, done) = oneshot::channel();
        self.tx
            .send(WriteCommand::Flush(ack))
            .map_err(|_| session_err("JSONL writer is closed"))?;
        done.await
            .map_err(|_| session_err("JSONL writer task ended during flush"))
    }

    /// Final flush plus fsync, then stop the background task. Idempotent.
    pub async fn close(&self) -> Result<()> {
        let (ack, done) = oneshot::channel();
        if self.tx.send(WriteCommand::Close(ack)).is_err() {
            return Ok(());
        }
        let _ = done.await;

        let handle = self.handle.lock().take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                warn!(error = %e, "JSONL writer task panicked");
            }
        }
        Ok(())
    }
}

struct Worker {
    session_dir: PathBuf,
    batch_size: usize,
    buffer: Vec<String>,
    queued: Arc<AtomicUsize>,
}

impl Worker {
    async fn run(mut self, mut rx: mpsc::UnboundedReceiver<WriteCommand>, flush_interval: Duration) {
        let mut ticker = tokio::time::interval(flush_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                command = rx.recv() => match command {
                    Some(WriteCommand::Append(line)) => {
                        self.queued.fetch_sub(1, Ordering::Relaxed);
                        self.buffer.push(line);
                        if self.buffer.len() >= self.batch_size {
                            self.flush_buffer(false).await;
                        }
                    }
                    Some(WriteCommand::Flush(ack)) => {
                        self.flush_buffer(false).await;
                        let _ = ack.send(());
                    }
                    Some(WriteCommand::Close(ack)) => {
                        self.flush_buffer(true).await;
                        let _ = ack.send(());
                        break;
                    }
                    None => {
                        self.flush_buffer(true).await;
                        break;
                    }
                },
                _ = ticker.tick() => {
                    if !self.buffer.is_empty() {
                        self.flush_buffer(false).await;
                    }
                }
            }
        }
    }

    async fn flush_buffer(&mut self, sync: bool) {
        if self.buffer.is_empty() {
            if sync {
                self.sync_existing().await;
            }
            return;
        }

        let mut batch = self.buffer.join("\n");
        batch.push('\n');
        let path = self.session_dir.join(MESSAGES_FILE);

        match self.write_batch(&path, &batch, sync).await {
            Ok(()) => {
                debug!(records = self.buffer.len(), path = %path.display(), "Flushed JSONL batch");
                self.buffer.clear();
            }
            Err(e) => {
                error!(error = %e, path = %path.display(), "JSONL write failed, trying backup");
                self.emergency_backup(&batch).await;
            }
        }
    }

    async fn write_batch(&self, path: &PathBuf, batch: &str, sync: bool) -> std::io::Result<()> {
        tokio::fs::create_dir_all(&self.session_dir).await?;
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .await?;
        file.write_all(batch.as_bytes()).await?;
        file.flush().await?;
        if sync {
            file.sync_all().await?;
        }
        Ok(())
    }

    /// Last resort when the primary file cannot be written: park the batch
    /// in a sibling file. Records that fail both paths are lost and logged.
    async fn emergency_backup(&mut self, batch: &str) {
        let path = self.session_dir.join(BACKUP_FILE);
        match self.write_batch(&path, batch, false).await {
            Ok(()) => {
                warn!(records = self.buffer.len(), path = %path.display(), "Parked batch in backup file");
                self.buffer.clear();
            }
            Err(e) => {
                error!(error = %e, records = self.buffer.len(), "Backup write failed, records dropped");
                self.buffer.clear();
            }
        }
    }

    async fn sync_existing(&self) {
        let path = self.session_dir.join(MESSAGES_FILE);
        if !path.exists() {
            return;
        }
        match OpenOptions::new().append(true).open(&path).await {
            Ok(file) => {
                if let Err(e) = file.sync_all().await {
                    warn!(error = %e, "fsync on close failed");
                }
            }
            Err(e) => warn!(error = %e, "Cannot reopen log for fsync"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn writer_in(dir: &std::path::Path, batch_size: usize, interval_ms: u64) -> JsonlWriter {
        JsonlWriter::new(
            dir.to_path_buf(),
            batch_size,
            Duration::from_millis(interval_ms),
        )
    }

    fn read_lines(dir: &std::path::Path) -> Vec<serde_json::Value> {
        let content = std::fs::read_to_string(dir.join(MESSAGES_FILE)).unwrap_or_default();
        content
            .lines()
            .map(|line| serde_json::from_str(line).unwrap())
            .collect()
    }

    #[tokio::test]
    async fn test_batch_size_triggers_flush() {
        let dir = tempfile::tempdir().unwrap();
        let writer = writer_in(dir.path(), 3, 60_000);

        for i in 0..3 {
            writer.append(&json!({"seq": i})).unwrap();
        }
        writer.flush().await.unwrap();

        let lines = read_lines(dir.path());
        assert_eq!(lines.len(), 3);
        assert_eq!(lines[2]["seq"], 2);
        writer.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_interval_flush() {
        let dir = tempfile::tempdir().unwrap();
        let writer = writer_in(dir.path(), 100, 50);

        writer.append(&json!({"seq": 0})).unwrap();
        tokio::time::sleep(Duration::from_millis(200)).await;

        assert_eq!(read_lines(dir.path()).len(), 1);
        writer.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_close_flushes_remaining() {
        let dir = tempfile::tempdir().unwrap();
        let writer = writer_in(dir.path(), 100, 60_000);

        for i in 0..7 {
            writer.append(&json!({"seq": i})).unwrap();
        }
        writer.close().await.unwrap();

        assert_eq!(read_lines(dir.path()).len(), 7);
    }

    #[tokio::test]
    async fn test_append_order_preserved() {
        let dir = tempfile::tempdir().unwrap();
        let writer = writer_in(dir.path(), 4, 60_000);

        for i in 0..25 {
            writer.append(&json!({"seq": i})).unwrap();
        }
        writer.close().await.unwrap();

        let lines = read_lines(dir.path());
        assert_eq!(lines.len(), 25);
        for (i, line) in lines.iter().enumerate() {
            assert_eq!(line["seq"], i);
        }
    }

    #[tokio::test]
    async fn test_close_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let writer = writer_in(dir.path(), 10, 60_000);

        writer.append(&json!({"seq": 0})).unwrap();
        writer.close().await.unwrap();
        writer.close().await.unwrap();

        assert!(writer.append(&json!({"seq": 1})).is_err());
        assert_eq!(read_lines(dir.path()).len(), 1);
    }
}
