// SPDX-License-Identifier: MIT OR Apache-2.0
//! Single-writer append task with timed flush and size rotation.

use crate::{DEFAULT_FLUSH_INTERVAL_MS, DEFAULT_ROTATE_BYTES, HistoryError};
use serde::Serialize;
use serde_json::Value;
use std::path::{Path, PathBuf};
use tokio::fs::{File, OpenOptions};
use tokio::io::{AsyncWriteExt, BufWriter};
use tokio::sync::{mpsc, oneshot};
use tokio::time::{Duration, interval};
use tracing::{error, warn};

/// Writer tuning knobs.
#[derive(Debug, Clone)]
pub struct LogWriterConfig {
    /// Rotate the current file once it exceeds this many bytes.
    pub rotate_bytes: u64,
    /// Flush the buffered writer this often.
    pub flush_interval: Duration,
}

impl Default for LogWriterConfig {
    fn default() -> Self {
        Self {
            rotate_bytes: DEFAULT_ROTATE_BYTES,
            flush_interval: Duration::from_millis(DEFAULT_FLUSH_INTERVAL_MS),
        }
    }
}

enum Command {
    Append(Value),
    Flush(oneshot::Sender<()>),
}

/// Cheap cloneable handle to a log writer task.
///
/// Appends are fire-and-forget; sequencing and persistence happen on the
/// writer task. Dropping every handle ends the task after a final flush.
#[derive(Debug, Clone)]
pub struct LogHandle {
    tx: mpsc::UnboundedSender<Command>,
}

impl LogHandle {
    /// Append a record. The writer stamps the `seq` field.
    pub fn append<T: Serialize>(&self, record: &T) -> Result<(), HistoryError> {
        let value = serde_json::to_value(record)?;
        self.tx
            .send(Command::Append(value))
            .map_err(|_| HistoryError::WriterClosed)
    }

    /// Flush buffered records to disk and wait for completion.
    pub async fn flush(&self) -> Result<(), HistoryError> {
        let (done_tx, done_rx) = oneshot::channel();
        self.tx
            .send(Command::Flush(done_tx))
            .map_err(|_| HistoryError::WriterClosed)?;
        done_rx.await.map_err(|_| HistoryError::WriterClosed)
    }
}

/// Spawn the writer task for `<dir>/<stem>.jsonl`.
///
/// Rotated siblings are named `<stem>.1.jsonl`, `<stem>.2.jsonl`, … in
/// rotation order; the unnumbered file is always the newest.
pub async fn spawn_log_writer(
    dir: &Path,
    stem: &str,
    config: LogWriterConfig,
) -> Result<LogHandle, HistoryError> {
    tokio::fs::create_dir_all(dir).await?;
    let state = WriterState::open(dir.to_path_buf(), stem.to_string(), config).await?;
    let (tx, rx) = mpsc::unbounded_channel();
    tokio::spawn(writer_loop(state, rx));
    Ok(LogHandle { tx })
}

struct WriterState {
    dir: PathBuf,
    stem: String,
    config: LogWriterConfig,
    file: BufWriter<File>,
    bytes: u64,
    next_seq: u64,
    rotations: u32,
}

impl WriterState {
    async fn open(dir: PathBuf, stem: String, config: LogWriterConfig) -> Result<Self, HistoryError> {
        let path = dir.join(format!("{stem}.jsonl"));
        let existing = tokio::fs::metadata(&path).await.map(|m| m.len()).unwrap_or(0);
        let rotations = count_rotations(&dir, &stem);
        // A restart reopens a populated log; the sequence must continue
        // past whatever is already on disk, never restart at zero.
        let next_seq = restore_next_seq(&dir, &stem, rotations);
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await?;
        Ok(Self {
            dir,
            stem,
            config,
            file: BufWriter::new(file),
            bytes: existing,
            next_seq,
            rotations,
        })
    }

    async fn append(&mut self, mut value: Value) -> Result<(), HistoryError> {
        if let Some(obj) = value.as_object_mut() {
            obj.insert("seq".to_string(), Value::from(self.next_seq));
            self.next_seq += 1;
        }
        let mut line = serde_json::to_string(&value)?;
        line.push('\n');
        self.file.write_all(line.as_bytes()).await?;
        self.bytes += line.len() as u64;

        if self.bytes >= self.config.rotate_bytes {
            self.rotate().await?;
        }
        Ok(())
    }

    async fn rotate(&mut self) -> Result<(), HistoryError> {
        self.file.flush().await?;
        self.rotations += 1;
        let current = self.dir.join(format!("{}.jsonl", self.stem));
        let sibling = self.dir.join(format!("{}.{}.jsonl", self.stem, self.rotations));
        tokio::fs::rename(&current, &sibling).await?;
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&current)
            .await?;
        self.file = BufWriter::new(file);
        self.bytes = 0;
        Ok(())
    }

    async fn flush(&mut self) -> Result<(), HistoryError> {
        self.file.flush().await?;
        Ok(())
    }
}

/// Highest `seq` already persisted, plus one. Scans the current file and
/// the newest rotated sibling (the current file may be freshly rotated and
/// empty); earlier siblings only hold lower sequence numbers.
fn restore_next_seq(dir: &Path, stem: &str, rotations: u32) -> u64 {
    let mut paths = vec![dir.join(format!("{stem}.jsonl"))];
    if rotations > 0 {
        paths.push(dir.join(format!("{stem}.{rotations}.jsonl")));
    }

    let mut highest: Option<u64> = None;
    for path in paths {
        let Ok(text) = std::fs::read_to_string(&path) else {
            continue;
        };
        for line in text.lines() {
            if line.trim().is_empty() {
                continue;
            }
            if let Ok(value) = serde_json::from_str::<Value>(line)
                && let Some(seq) = value.get("seq").and_then(Value::as_u64)
            {
                highest = Some(highest.map_or(seq, |h| h.max(seq)));
            }
        }
    }
    highest.map_or(0, |h| h + 1)
}

fn count_rotations(dir: &Path, stem: &str) -> u32 {
    let mut highest = 0;
    if let Ok(entries) = std::fs::read_dir(dir) {
        for entry in entries.flatten() {
            let name = entry.file_name();
            let name = name.to_string_lossy();
            if let Some(middle) = name
                .strip_prefix(&format!("{stem}."))
                .and_then(|rest| rest.strip_suffix(".jsonl"))
                && let Ok(n) = middle.parse::<u32>()
            {
                highest = highest.max(n);
            }
        }
    }
    highest
}

async fn writer_loop(mut state: WriterState, mut rx: mpsc::UnboundedReceiver<Command>) {
    let mut ticker = interval(state.config.flush_interval);
    loop {
        tokio::select! {
            cmd = rx.recv() => match cmd {
                Some(Command::Append(value)) => {
                    if let Err(e) = state.append(value).await {
                        error!(error = %e, stem = %state.stem, "history append failed");
                    }
                }
                Some(Command::Flush(done)) => {
                    if let Err(e) = state.flush().await {
                        error!(error = %e, stem = %state.stem, "history flush failed");
                    }
                    let _ = done.send(());
                }
                None => break,
            },
            _ = ticker.tick() => {
                if let Err(e) = state.flush().await {
                    warn!(error = %e, stem = %state.stem, "periodic history flush failed");
                }
            }
        }
    }
    // Final flush on shutdown.
    if let Err(e) = state.flush().await {
        error!(error = %e, stem = %state.stem, "final history flush failed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{HISTORY_STEM, HistoryRecord, reader::HistoryReader};
    use mew_core::EnvelopeDraft;
    use serde_json::json;

    fn sample_record(n: usize) -> HistoryRecord {
        let env = EnvelopeDraft::new("chat", json!({"text": format!("msg-{n}")})).seal("alice");
        HistoryRecord::received(&env)
    }

    #[tokio::test]
    async fn appends_are_sequenced_and_flushed() {
        let tmp = tempfile::tempdir().unwrap();
        let handle = spawn_log_writer(tmp.path(), HISTORY_STEM, LogWriterConfig::default())
            .await
            .unwrap();

        for n in 0..5 {
            handle.append(&sample_record(n)).unwrap();
        }
        handle.flush().await.unwrap();

        let records = HistoryReader::open(tmp.path(), HISTORY_STEM).records().unwrap();
        assert_eq!(records.len(), 5);
        let seqs: Vec<u64> = records.iter().map(|r| r.seq).collect();
        assert_eq!(seqs, vec![0, 1, 2, 3, 4]);
    }

    #[tokio::test]
    async fn reopen_continues_the_sequence() {
        let tmp = tempfile::tempdir().unwrap();
        {
            let handle = spawn_log_writer(tmp.path(), HISTORY_STEM, LogWriterConfig::default())
                .await
                .unwrap();
            for n in 0..3 {
                handle.append(&sample_record(n)).unwrap();
            }
            handle.flush().await.unwrap();
        }

        // A fresh writer over the same directory picks up where the last
        // one stopped instead of re-issuing seq 0.
        let handle = spawn_log_writer(tmp.path(), HISTORY_STEM, LogWriterConfig::default())
            .await
            .unwrap();
        handle.append(&sample_record(3)).unwrap();
        handle.flush().await.unwrap();

        let records = HistoryReader::open(tmp.path(), HISTORY_STEM).records().unwrap();
        let seqs: Vec<u64> = records.iter().map(|r| r.seq).collect();
        assert_eq!(seqs, vec![0, 1, 2, 3]);

        // The replay cursor contract survives the restart.
        let tail = HistoryReader::open(tmp.path(), HISTORY_STEM)
            .replay_from(3)
            .unwrap();
        assert_eq!(tail.len(), 1);
        assert_eq!(tail[0].seq, 3);
    }

    #[tokio::test]
    async fn reopen_after_rotation_stays_monotonic() {
        let tmp = tempfile::tempdir().unwrap();
        let config = LogWriterConfig {
            rotate_bytes: 512,
            ..LogWriterConfig::default()
        };
        {
            let handle = spawn_log_writer(tmp.path(), HISTORY_STEM, config.clone())
                .await
                .unwrap();
            for n in 0..32 {
                handle.append(&sample_record(n)).unwrap();
            }
            handle.flush().await.unwrap();
        }
        assert!(tmp.path().join("envelope-history.1.jsonl").exists());

        let handle = spawn_log_writer(tmp.path(), HISTORY_STEM, config).await.unwrap();
        handle.append(&sample_record(32)).unwrap();
        handle.flush().await.unwrap();

        let records = HistoryReader::open(tmp.path(), HISTORY_STEM).records().unwrap();
        assert_eq!(records.len(), 33);
        for (i, record) in records.iter().enumerate() {
            assert_eq!(record.seq, i as u64);
        }
    }

    #[tokio::test]
    async fn rotation_produces_numbered_siblings() {
        let tmp = tempfile::tempdir().unwrap();
        let config = LogWriterConfig {
            rotate_bytes: 512,
            ..LogWriterConfig::default()
        };
        let handle = spawn_log_writer(tmp.path(), HISTORY_STEM, config).await.unwrap();

        for n in 0..32 {
            handle.append(&sample_record(n)).unwrap();
        }
        handle.flush().await.unwrap();

        assert!(tmp.path().join("envelope-history.1.jsonl").exists());

        // Replay still sees every record exactly once, in order.
        let records = HistoryReader::open(tmp.path(), HISTORY_STEM).records().unwrap();
        assert_eq!(records.len(), 32);
        for (i, record) in records.iter().enumerate() {
            assert_eq!(record.seq, i as u64);
        }
    }
}
