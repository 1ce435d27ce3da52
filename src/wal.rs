//! JSON-lines write-ahead log.
//!
//! One [`CommitRecord`] per line, appended by the sequencer in clock order.
//! On startup the file is read back with [`read_log`] and fed to
//! `Sequencer::replay`, which rebuilds the index and watermarks.
//!
//! A crash mid-append can leave a final line without its newline. If that
//! line does not parse it is a torn tail: ignored on read and cut off by
//! [`JsonlWal::open`]. If it parses, the record is kept and `open` writes
//! the missing newline, so the next append starts on a line of its own. Any other malformed line, or a clock that does not
//! increase, is an error: the log is not silently repaired.

use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use parking_lot::Mutex;

use fintech_rag_core::log::{CommitLog, CommitRecord};
use fintech_rag_core::models::LogicalClock;

/// Result of reading a log file.
#[derive(Debug, Default)]
pub struct LogContents {
    pub records: Vec<CommitRecord>,
    /// Byte length of the well-formed prefix.
    pub valid_len: u64,
    pub torn_tail: bool,
    /// The last record parsed but is missing its trailing newline.
    pub unterminated: bool,
}

impl LogContents {
    pub fn last_clock(&self) -> LogicalClock {
        self.records
            .last()
            .map(|r| r.clock)
            .unwrap_or(LogicalClock::ZERO)
    }
}

/// Read every record of the log at `path`. A missing file is an empty log.
pub fn read_log(path: &Path) -> Result<LogContents> {
    let file = match File::open(path) {
        Ok(f) => f,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(LogContents::default()),
        Err(e) => {
            return Err(e).with_context(|| format!("Failed to open commit log: {}", path.display()))
        }
    };

    let mut reader = BufReader::new(file);
    let mut contents = LogContents::default();
    let mut buf = String::new();
    let mut line_no = 0usize;

    loop {
        buf.clear();
        let n = reader
            .read_line(&mut buf)
            .with_context(|| format!("Failed to read commit log: {}", path.display()))?;
        if n == 0 {
            break;
        }
        line_no += 1;
        let complete = buf.ends_with('\n');
        let line = buf.trim_end();

        if line.is_empty() {
            contents.valid_len += n as u64;
            continue;
        }

        let record: CommitRecord = match serde_json::from_str(line) {
            Ok(r) => r,
            Err(_) if !complete => {
                tracing::warn!(
                    path = %path.display(),
                    line = line_no,
                    "ignoring torn final commit log record"
                );
                contents.torn_tail = true;
                break;
            }
            Err(e) => {
                return Err(e).with_context(|| {
                    format!("Malformed commit log record at {}:{}", path.display(), line_no)
                })
            }
        };

        if record.clock <= contents.last_clock() {
            anyhow::bail!(
                "commit log {} line {}: clock {} does not follow {}",
                path.display(),
                line_no,
                record.clock,
                contents.last_clock()
            );
        }
        contents.records.push(record);
        contents.valid_len += n as u64;
        contents.unterminated = !complete;
    }

    Ok(contents)
}

/// Append-only JSON-lines [`CommitLog`].
pub struct JsonlWal {
    path: PathBuf,
    fsync: bool,
    file: Mutex<File>,
}

impl JsonlWal {
    /// Open (or create) the log at `path` and return it with its existing
    /// records. A torn final line is truncated away.
    pub fn open(path: &Path, fsync: bool) -> Result<(Self, LogContents)> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).with_context(|| {
                    format!("Failed to create commit log directory: {}", parent.display())
                })?;
            }
        }

        let contents = read_log(path)?;

        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .with_context(|| format!("Failed to open commit log: {}", path.display()))?;

        if contents.torn_tail {
            file.set_len(contents.valid_len)
                .with_context(|| format!("Failed to truncate commit log: {}", path.display()))?;
        }
        if contents.unterminated {
            tracing::warn!(path = %path.display(), "terminating final commit log record");
            (&file)
                .write_all(b"\n")
                .and_then(|_| file.sync_data())
                .with_context(|| format!("Failed to repair commit log: {}", path.display()))?;
        }

        Ok((
            Self {
                path: path.to_path_buf(),
                fsync,
                file: Mutex::new(file),
            },
            contents,
        ))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl CommitLog for JsonlWal {
    fn append(&self, record: &CommitRecord) -> Result<()> {
        let mut line = serde_json::to_vec(record)?;
        line.push(b'\n');

        let mut file = self.file.lock();
        file.write_all(&line)
            .with_context(|| format!("Failed to append to commit log: {}", self.path.display()))?;
        if self.fsync {
            file.sync_data()?;
        }
        Ok(())
    }

    fn flush(&self) -> Result<()> {
        let file = self.file.lock();
        file.sync_all()?;
        Ok(())
    }
}
