// SPDX-License-Identifier: MIT OR Apache-2.0
//! Sequential reader over a rotated JSONL log family.

use crate::{HistoryError, HistoryRecord};
use serde::de::DeserializeOwned;
use std::fs;
use std::io::{BufRead, BufReader};
use std::path::{Path, PathBuf};

/// Reads a log family (`<stem>.1.jsonl`, …, `<stem>.jsonl`) in sequence
/// order. Blank lines are skipped.
#[derive(Debug, Clone)]
pub struct HistoryReader {
    dir: PathBuf,
    stem: String,
}

impl HistoryReader {
    /// Reader over `<dir>/<stem>*.jsonl`.
    #[must_use]
    pub fn open(dir: &Path, stem: &str) -> Self {
        Self {
            dir: dir.to_path_buf(),
            stem: stem.to_string(),
        }
    }

    /// Rotated siblings in rotation order, then the current file.
    fn files(&self) -> Vec<PathBuf> {
        let mut numbered: Vec<(u32, PathBuf)> = Vec::new();
        if let Ok(entries) = fs::read_dir(&self.dir) {
            for entry in entries.flatten() {
                let name = entry.file_name();
                let name = name.to_string_lossy().to_string();
                if let Some(middle) = name
                    .strip_prefix(&format!("{}.", self.stem))
                    .and_then(|rest| rest.strip_suffix(".jsonl"))
                    && let Ok(n) = middle.parse::<u32>()
                {
                    numbered.push((n, entry.path()));
                }
            }
        }
        numbered.sort_by_key(|(n, _)| *n);

        let mut files: Vec<PathBuf> = numbered.into_iter().map(|(_, p)| p).collect();
        let current = self.dir.join(format!("{}.jsonl", self.stem));
        if current.exists() {
            files.push(current);
        }
        files
    }

    /// Parse every record of type `T` across the whole family.
    pub fn records_as<T: DeserializeOwned>(&self) -> Result<Vec<T>, HistoryError> {
        let mut out = Vec::new();
        for path in self.files() {
            let file = fs::File::open(&path)?;
            for line in BufReader::new(file).lines() {
                let line = line?;
                if line.trim().is_empty() {
                    continue;
                }
                out.push(serde_json::from_str(&line)?);
            }
        }
        Ok(out)
    }

    /// Parse every [`HistoryRecord`] across the whole family.
    pub fn records(&self) -> Result<Vec<HistoryRecord>, HistoryError> {
        self.records_as()
    }

    /// Records with `seq >= cursor`, for replay after a checkpoint.
    pub fn replay_from(&self, cursor: u64) -> Result<Vec<HistoryRecord>, HistoryError> {
        Ok(self
            .records()?
            .into_iter()
            .filter(|r| r.seq >= cursor)
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{HISTORY_STEM, HistoryEventKind};
    use std::io::Write;

    fn write_lines(path: &Path, records: &[serde_json::Value]) {
        let mut f = fs::File::create(path).unwrap();
        for r in records {
            writeln!(f, "{r}").unwrap();
        }
    }

    fn record(seq: u64) -> serde_json::Value {
        serde_json::json!({
            "seq": seq,
            "event": "received",
            "ts": "2026-01-01T00:00:00Z",
            "envelope_id": uuid::Uuid::new_v4(),
            "from": "alice",
            "kind": "chat",
        })
    }

    #[test]
    fn reads_rotated_family_in_order() {
        let tmp = tempfile::tempdir().unwrap();
        write_lines(
            &tmp.path().join("envelope-history.1.jsonl"),
            &[record(0), record(1)],
        );
        write_lines(&tmp.path().join("envelope-history.jsonl"), &[record(2)]);

        let records = HistoryReader::open(tmp.path(), HISTORY_STEM).records().unwrap();
        assert_eq!(records.len(), 3);
        assert_eq!(records[0].seq, 0);
        assert_eq!(records[2].seq, 2);
        assert_eq!(records[0].event, HistoryEventKind::Received);
    }

    #[test]
    fn replay_cursor_filters_earlier_records() {
        let tmp = tempfile::tempdir().unwrap();
        write_lines(
            &tmp.path().join("envelope-history.jsonl"),
            &[record(0), record(1), record(2)],
        );

        let tail = HistoryReader::open(tmp.path(), HISTORY_STEM).replay_from(1).unwrap();
        assert_eq!(tail.len(), 2);
        assert_eq!(tail[0].seq, 1);
    }

    #[test]
    fn missing_log_reads_as_empty() {
        let tmp = tempfile::tempdir().unwrap();
        let records = HistoryReader::open(tmp.path(), HISTORY_STEM).records().unwrap();
        assert!(records.is_empty());
    }
}
