//! On-disk journal: an append-only JSON-lines log plus a compacted snapshot.
//!
//! Layout under the store directory:
//! - `todo.log`: one [`LogRecord`] per line, strictly increasing `seq`
//! - `todo.snapshot.json`: [`SnapshotFile`], rewritten atomically
//!
//! Recovery loads the snapshot and replays log records with
//! `seq > snapshot.last_seq`. A torn final line (crash mid-append) is dropped
//! and cut off the file before the next append; an undecodable line anywhere
//! else is reported as corruption.

use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tempfile::NamedTempFile;
use tracing::{debug, warn};

use crate::error::TodoError;
use crate::model::{Todo, TodoOp};
use crate::Result;

const LOG_FILE: &str = "todo.log";
const SNAPSHOT_FILE: &str = "todo.snapshot.json";

/// One line of the transition log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogRecord {
    pub seq: u64,
    #[serde(flatten)]
    pub op: TodoOp,
}

/// Persisted compacted state.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotFile {
    pub last_seq: u64,
    pub todos: Vec<Todo>,
}

/// What [`Journal::open`] found on disk.
#[derive(Debug, Default)]
pub struct Recovered {
    pub snapshot: SnapshotFile,
    /// Records newer than the snapshot, in log order.
    pub records: Vec<LogRecord>,
}

/// Handle on the store directory.
pub struct Journal {
    dir: PathBuf,
    log: File,
}

impl std::fmt::Debug for Journal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Journal").field("dir", &self.dir).finish()
    }
}

impl Journal {
    /// Open (creating if needed) the journal in `dir` and read back its contents.
    pub fn open(dir: impl AsRef<Path>) -> Result<(Self, Recovered)> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir)?;

        let snapshot = read_snapshot(&dir.join(SNAPSHOT_FILE))?;
        let scan = read_log(&dir.join(LOG_FILE), snapshot.last_seq)?;

        let mut log = OpenOptions::new()
            .create(true)
            .append(true)
            .open(dir.join(LOG_FILE))?;
        repair_tail(&mut log, &scan)?;
        let records = scan.records;

        debug!(
            dir = %dir.display(),
            snapshot_seq = snapshot.last_seq,
            replay = records.len(),
            "todo journal opened"
        );

        Ok((Self { dir, log }, Recovered { snapshot, records }))
    }

    /// Directory backing this journal.
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Append one record and flush it to stable storage.
    pub fn append(&mut self, record: &LogRecord) -> Result<()> {
        let mut line = serde_json::to_vec(record)?;
        line.push(b'\n');
        self.log.write_all(&line)?;
        self.log.flush()?;
        self.log.sync_data()?;
        Ok(())
    }

    /// Atomically replace the snapshot, then drop log records it covers.
    ///
    /// A crash between the two steps is harmless: recovery skips records with
    /// `seq <= last_seq`.
    pub fn write_snapshot(&mut self, snapshot: &SnapshotFile) -> Result<()> {
        let content = serde_json::to_vec_pretty(snapshot)?;
        let mut tmp = NamedTempFile::new_in(&self.dir)?;
        tmp.write_all(&content)?;
        tmp.as_file().sync_all()?;
        tmp.persist(self.dir.join(SNAPSHOT_FILE))
            .map_err(|e| e.error)?;

        let log = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(self.dir.join(LOG_FILE))?;
        log.sync_all()?;
        self.log = OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.dir.join(LOG_FILE))?;

        debug!(last_seq = snapshot.last_seq, todos = snapshot.todos.len(), "todo snapshot written");
        Ok(())
    }
}

fn read_snapshot(path: &Path) -> Result<SnapshotFile> {
    match fs::read(path) {
        Ok(bytes) => Ok(serde_json::from_slice(&bytes)?),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(SnapshotFile::default()),
        Err(e) => Err(e.into()),
    }
}

/// Result of scanning the log file.
#[derive(Debug, Default)]
struct LogScan {
    records: Vec<LogRecord>,
    /// Length of the file on disk.
    file_len: u64,
    /// Byte length covering every intact line.
    valid_len: u64,
    /// Whether the intact prefix ends with a newline (or is empty).
    terminated: bool,
}

fn read_log(path: &Path, after_seq: u64) -> Result<LogScan> {
    let bytes = match fs::read(path) {
        Ok(b) => b,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            return Ok(LogScan {
                terminated: true,
                ..LogScan::default()
            })
        }
        Err(e) => return Err(e.into()),
    };

    let mut scan = LogScan {
        file_len: bytes.len() as u64,
        terminated: true,
        ..LogScan::default()
    };
    let mut prev_seq = after_seq;
    let mut offset = 0usize;
    let mut lines = bytes.split_inclusive(|b| *b == b'\n').enumerate().peekable();

    while let Some((idx, chunk)) = lines.next() {
        let is_last = lines.peek().is_none();
        let end = offset + chunk.len();
        offset = end;

        let parsed = std::str::from_utf8(chunk)
            .map_err(|e| e.to_string())
            .and_then(|text| {
                let text = text.trim();
                if text.is_empty() {
                    Ok(None)
                } else {
                    serde_json::from_str::<LogRecord>(text)
                        .map(Some)
                        .map_err(|e| e.to_string())
                }
            });
        let record = match parsed {
            Ok(Some(r)) => r,
            Ok(None) => {
                scan.valid_len = end as u64;
                scan.terminated = chunk.ends_with(b"\n");
                continue;
            }
            Err(detail) if is_last => {
                warn!(line = idx + 1, error = %detail, "dropping torn trailing todo log record");
                break;
            }
            Err(detail) => return Err(TodoError::CorruptLog { line: idx + 1, detail }),
        };

        scan.valid_len = end as u64;
        scan.terminated = chunk.ends_with(b"\n");
        if record.seq <= after_seq {
            continue;
        }
        if record.seq <= prev_seq {
            return Err(TodoError::CorruptLog {
                line: idx + 1,
                detail: format!("sequence {} not after {}", record.seq, prev_seq),
            });
        }
        prev_seq = record.seq;
        scan.records.push(record);
    }
    Ok(scan)
}

/// Cut a torn trailing record off the log and make sure the next append
/// starts on its own line.
fn repair_tail(log: &mut File, scan: &LogScan) -> Result<()> {
    if scan.valid_len < scan.file_len {
        warn!(
            kept = scan.valid_len,
            dropped = scan.file_len - scan.valid_len,
            "truncating torn todo log tail"
        );
        log.set_len(scan.valid_len)?;
    }
    if !scan.terminated {
        log.write_all(b"\n")?;
    }
    if scan.valid_len < scan.file_len || !scan.terminated {
        log.sync_data()?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::TodoId;
    use chrono::Utc;

    fn released(seq: u64) -> LogRecord {
        LogRecord {
            seq,
            op: TodoOp::Released {
                id: TodoId::new(),
                at: Utc::now(),
            },
        }
    }

    #[test]
    fn test_append_and_reopen_returns_records() {
        let dir = tempfile::tempdir().unwrap();
        {
            let (mut journal, recovered) = Journal::open(dir.path()).unwrap();
            assert!(recovered.records.is_empty());
            journal.append(&released(1)).unwrap();
            journal.append(&released(2)).unwrap();
        }
        let (_journal, recovered) = Journal::open(dir.path()).unwrap();
        let seqs: Vec<u64> = recovered.records.iter().map(|r| r.seq).collect();
        assert_eq!(seqs, vec![1, 2]);
    }

    #[test]
    fn test_snapshot_truncates_log() {
        let dir = tempfile::tempdir().unwrap();
        let (mut journal, _) = Journal::open(dir.path()).unwrap();
        journal.append(&released(1)).unwrap();
        journal
            .write_snapshot(&SnapshotFile {
                last_seq: 1,
                todos: vec![],
            })
            .unwrap();
        journal.append(&released(2)).unwrap();

        let (_journal, recovered) = Journal::open(dir.path()).unwrap();
        assert_eq!(recovered.snapshot.last_seq, 1);
        assert_eq!(recovered.records.len(), 1);
        assert_eq!(recovered.records[0].seq, 2);
    }

    #[test]
    fn test_records_covered_by_snapshot_are_ignored() {
        let dir = tempfile::tempdir().unwrap();
        let (mut journal, _) = Journal::open(dir.path()).unwrap();
        journal.append(&released(1)).unwrap();
        journal.append(&released(2)).unwrap();
        drop(journal);

        // Snapshot written but log not yet truncated (crash between steps).
        let snap = SnapshotFile {
            last_seq: 2,
            todos: vec![],
        };
        fs::write(
            dir.path().join(SNAPSHOT_FILE),
            serde_json::to_vec(&snap).unwrap(),
        )
        .unwrap();

        let (_journal, recovered) = Journal::open(dir.path()).unwrap();
        assert!(recovered.records.is_empty());
    }

    #[test]
    fn test_torn_trailing_line_is_dropped() {
        let dir = tempfile::tempdir().unwrap();
        let (mut journal, _) = Journal::open(dir.path()).unwrap();
        journal.append(&released(1)).unwrap();
        drop(journal);

        let mut f = OpenOptions::new()
            .append(true)
            .open(dir.path().join(LOG_FILE))
            .unwrap();
        f.write_all(br#"{"seq":2,"op":"rel"#).unwrap();

        let (_journal, recovered) = Journal::open(dir.path()).unwrap();
        assert_eq!(recovered.records.len(), 1);
    }

    #[test]
    fn test_corrupt_middle_line_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let content = format!(
            "garbage\n{}\n",
            serde_json::to_string(&released(2)).unwrap()
        );
        fs::write(dir.path().join(LOG_FILE), content).unwrap();

        match Journal::open(dir.path()) {
            Err(TodoError::CorruptLog { line, .. }) => assert_eq!(line, 1),
            other => panic!("expected CorruptLog, got {other:?}"),
        }
    }

    #[test]
    fn test_torn_tail_is_truncated_before_next_append() {
        let dir = tempfile::tempdir().unwrap();
        let (mut journal, _) = Journal::open(dir.path()).unwrap();
        journal.append(&released(1)).unwrap();
        drop(journal);

        let mut f = OpenOptions::new()
            .append(true)
            .open(dir.path().join(LOG_FILE))
            .unwrap();
        f.write_all(br#"{"seq":2,"op":"rel"#).unwrap();
        drop(f);

        let (mut journal, _) = Journal::open(dir.path()).unwrap();
        journal.append(&released(2)).unwrap();
        journal.append(&released(3)).unwrap();
        drop(journal);

        let (_journal, recovered) = Journal::open(dir.path()).unwrap();
        let seqs: Vec<u64> = recovered.records.iter().map(|r| r.seq).collect();
        assert_eq!(seqs, vec![1, 2, 3]);
    }

    #[test]
    fn test_unterminated_last_record_gets_a_newline() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(
            dir.path().join(LOG_FILE),
            serde_json::to_string(&released(1)).unwrap(),
        )
        .unwrap();

        let (mut journal, recovered) = Journal::open(dir.path()).unwrap();
        assert_eq!(recovered.records.len(), 1);
        journal.append(&released(2)).unwrap();
        drop(journal);

        let (_journal, recovered) = Journal::open(dir.path()).unwrap();
        assert_eq!(recovered.records.len(), 2);
    }
}
