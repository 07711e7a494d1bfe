//! Write-ahead log fronting each shard store.
//!
//! Append-only record of shard mutations, split into size-capped segment
//! files with a bounded retention count. Offsets are assigned sequentially
//! from 0 and stay monotonic across segment rotation; `replay` spans
//! segments and yields every surviving record exactly once in append order.
//!
//! ## On-disk layout
//!
//! A segment is named `wal_{first_offset:020}.log` and holds consecutive
//! frames of `[offset: u64 BE][len: u32 BE][len bytes]`. A torn final frame
//! (crash mid-append) is tolerated on the newest segment and truncated away
//! on the next open.

use std::fs::{self, File, OpenOptions};
use std::io::{BufWriter, Read, Write};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, warn};

const SEGMENT_PREFIX: &str = "wal_";
const SEGMENT_SUFFIX: &str = ".log";
const FRAME_HEADER: usize = 8 + 4;

#[derive(Error, Debug)]
pub enum WalError {
    #[error("wal io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("corrupt wal frame in {segment} at byte {at}")]
    Corrupt { segment: String, at: u64 },

    #[error("failed to encode wal entry: {0}")]
    Encode(String),

    #[error("failed to decode wal entry: {0}")]
    Decode(String),
}

/// Mutation kinds recorded in the log.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum LogOp {
    #[serde(rename = "set")]
    Set,
    #[serde(rename = "delete")]
    Delete,
}

/// One shard mutation: an encoded job (`Set`) or a job id (`Delete`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogEntry {
    pub op: LogOp,
    pub collection: String,
    pub payload: Vec<u8>,
}

impl LogEntry {
    pub fn set(collection: &str, job_bytes: Vec<u8>) -> LogEntry {
        LogEntry {
            op: LogOp::Set,
            collection: collection.to_string(),
            payload: job_bytes,
        }
    }

    pub fn delete(collection: &str, job_id: &str) -> LogEntry {
        LogEntry {
            op: LogOp::Delete,
            collection: collection.to_string(),
            payload: job_id.as_bytes().to_vec(),
        }
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, WalError> {
        serde_json::to_vec(self).map_err(|e| WalError::Encode(e.to_string()))
    }

    pub fn from_bytes(by: &[u8]) -> Result<LogEntry, WalError> {
        serde_json::from_slice(by).map_err(|e| WalError::Decode(e.to_string()))
    }
}

#[derive(Debug, Clone)]
pub struct WalOptions {
    /// Rotate the active segment once it grows past this many bytes.
    pub max_log_size: u64,

    /// Number of segments retained; older ones are deleted on rotation.
    pub max_segments: usize,

    /// Upper bound on how long appended data may stay un-fsynced.
    pub max_wait_before_sync: Duration,
}

impl Default for WalOptions {
    fn default() -> Self {
        WalOptions {
            max_log_size: 10_000_000,
            max_segments: 5,
            max_wait_before_sync: Duration::from_secs(1),
        }
    }
}

/// A segmented write-ahead log rooted at a directory.
pub struct Wal {
    dir: PathBuf,
    opts: WalOptions,

    /// Sorted list of sealed + active segment files by first offset.
    segments: Vec<(i64, PathBuf)>,

    writer: BufWriter<File>,
    active_size: u64,
    next_offset: i64,
    last_sync: Instant,
}

impl Wal {
    /// Opens (or creates) the log in `dir`, recovering the next offset from
    /// the newest segment.
    pub fn open(dir: impl AsRef<Path>, opts: WalOptions) -> Result<Wal, WalError> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir)?;

        let mut segments = list_segments(&dir)?;
        let next_offset = match segments.last() {
            Some((first, path)) => recover_segment(path, *first)?,
            None => 0,
        };

        if segments.is_empty() {
            let path = segment_path(&dir, 0);
            File::create(&path)?;
            segments.push((0, path));
        }

        let (_, active_path) = segments.last().expect("at least one segment");
        let file = OpenOptions::new().append(true).open(active_path)?;
        let active_size = file.metadata()?.len();

        debug!(
            dir = %dir.display(),
            segments = segments.len(),
            next_offset,
            "opened write-ahead log"
        );

        Ok(Wal {
            dir,
            opts,
            segments,
            writer: BufWriter::new(file),
            active_size,
            next_offset,
            last_sync: Instant::now(),
        })
    }

    /// Appends one entry and returns its offset. The record is on its way to
    /// disk when this returns; fsync lags by at most `max_wait_before_sync`.
    pub fn append(&mut self, entry: &LogEntry) -> Result<i64, WalError> {
        let body = entry.to_bytes()?;
        let offset = self.next_offset;

        self.writer.write_all(&(offset as u64).to_be_bytes())?;
        self.writer.write_all(&(body.len() as u32).to_be_bytes())?;
        self.writer.write_all(&body)?;
        self.writer.flush()?;

        self.next_offset += 1;
        self.active_size += (FRAME_HEADER + body.len()) as u64;

        if self.last_sync.elapsed() >= self.opts.max_wait_before_sync {
            self.writer.get_ref().sync_data()?;
            self.last_sync = Instant::now();
        }

        if self.active_size >= self.opts.max_log_size {
            self.rotate()?;
        }

        Ok(offset)
    }

    /// Offset of the most recent record, or -1 when the log is empty.
    pub fn latest_offset(&self) -> i64 {
        self.next_offset - 1
    }

    /// Invokes `f(offset, bytes)` for every record with offset >= `from`,
    /// in append order across all retained segments.
    pub fn replay<F>(&mut self, from: i64, mut f: F) -> Result<(), WalError>
    where
        F: FnMut(i64, &[u8]) -> Result<(), WalError>,
    {
        // Everything buffered must be visible to the read path.
        self.writer.flush()?;

        for i in 0..self.segments.len() {
            // Skip segments that end before `from`.
            if let Some((next_first, _)) = self.segments.get(i + 1) {
                if *next_first <= from {
                    continue;
                }
            }
            let (first, path) = &self.segments[i];
            read_segment(path, *first, |offset, bytes| {
                if offset >= from {
                    f(offset, bytes)?;
                }
                Ok(())
            })?;
        }
        Ok(())
    }

    /// Flushes and fsyncs the active segment.
    pub fn sync(&mut self) -> Result<(), WalError> {
        self.writer.flush()?;
        self.writer.get_ref().sync_data()?;
        self.last_sync = Instant::now();
        Ok(())
    }

    /// Flushes, fsyncs and releases the log.
    pub fn close(mut self) -> Result<(), WalError> {
        self.sync()
    }

    fn rotate(&mut self) -> Result<(), WalError> {
        self.sync()?;

        let path = segment_path(&self.dir, self.next_offset);
        let file = File::create(&path)?;
        self.writer = BufWriter::new(file);
        self.active_size = 0;
        self.segments.push((self.next_offset, path));

        while self.segments.len() > self.opts.max_segments {
            let (first, old) = self.segments.remove(0);
            warn!(segment = %old.display(), first_offset = first, "dropping oldest wal segment");
            fs::remove_file(&old)?;
        }
        Ok(())
    }
}

fn segment_path(dir: &Path, first_offset: i64) -> PathBuf {
    dir.join(format!("{}{:020}{}", SEGMENT_PREFIX, first_offset, SEGMENT_SUFFIX))
}

fn list_segments(dir: &Path) -> Result<Vec<(i64, PathBuf)>, WalError> {
    let mut segments = Vec::new();
    for entry in fs::read_dir(dir)? {
        let path = entry?.path();
        let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
            continue;
        };
        if let Some(first) = name
            .strip_prefix(SEGMENT_PREFIX)
            .and_then(|n| n.strip_suffix(SEGMENT_SUFFIX))
            .and_then(|n| n.parse::<i64>().ok())
        {
            segments.push((first, path));
        }
    }
    segments.sort_by_key(|(first, _)| *first);
    Ok(segments)
}

/// Reads every complete frame in a segment. A truncated tail frame stops the
/// scan cleanly; a frame whose offset disagrees with the running counter is
/// reported as corruption.
fn read_segment<F>(path: &Path, first_offset: i64, mut f: F) -> Result<(), WalError>
where
    F: FnMut(i64, &[u8]) -> Result<(), WalError>,
{
    let mut file = File::open(path)?;
    let len = file.metadata()?.len();
    let mut pos: u64 = 0;
    let mut expected = first_offset;

    let mut header = [0u8; FRAME_HEADER];
    while pos + FRAME_HEADER as u64 <= len {
        file.read_exact(&mut header)?;
        let offset = u64::from_be_bytes(header[..8].try_into().unwrap()) as i64;
        let body_len = u32::from_be_bytes(header[8..].try_into().unwrap()) as u64;

        if offset != expected {
            return Err(WalError::Corrupt {
                segment: path.display().to_string(),
                at: pos,
            });
        }
        if pos + FRAME_HEADER as u64 + body_len > len {
            // Torn final frame, stop here.
            break;
        }

        let mut body = vec![0u8; body_len as usize];
        file.read_exact(&mut body)?;
        f(offset, &body)?;

        pos += FRAME_HEADER as u64 + body_len;
        expected += 1;
    }
    Ok(())
}

/// Scans the newest segment to find the next offset, truncating a torn tail.
fn recover_segment(path: &Path, first_offset: i64) -> Result<i64, WalError> {
    let mut next = first_offset;
    let mut valid_bytes: u64 = 0;
    read_segment(path, first_offset, |_, bytes| {
        next += 1;
        valid_bytes += (FRAME_HEADER + bytes.len()) as u64;
        Ok(())
    })?;

    let actual = fs::metadata(path)?.len();
    if actual > valid_bytes {
        warn!(
            segment = %path.display(),
            torn_bytes = actual - valid_bytes,
            "truncating torn wal tail"
        );
        let file = OpenOptions::new().write(true).open(path)?;
        file.set_len(valid_bytes)?;
        file.sync_data()?;
    }
    Ok(next)
}

// ── Tests ─────────────────────────────────────────────────────────────────────
