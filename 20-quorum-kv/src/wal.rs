//! Append-only write-ahead log backing the durable store.
//!
//! Every record is framed as a big-endian `u32` length followed by a
//! bincode-encoded [`WalEntry`]. Records are only ever appended and replay
//! reads them back in file order.
//!
//! A crash in the middle of an append can leave a partial frame at the end of
//! the file. [`WriteAheadLog::open`] detects that torn tail and truncates the
//! file back to the last complete frame so later appends stay readable.
//!
//! A failed write or sync also cuts the file back, to where it stood before
//! the unsynced records, so a record the caller saw fail is never replayed.

use std::fs::{self, File, OpenOptions};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use serde::{Deserialize, Serialize};
use tracing::warn;

/// File name of the log inside a node's data directory.
pub const WAL_FILE: &str = "wal.log";

const FRAME_HEADER_LEN: usize = 4;

/// One durable record: a sequence number plus an opaque encoded command.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WalEntry {
    pub sequence: u64,
    pub data: Vec<u8>,
}

pub struct WriteAheadLog {
    path: PathBuf,
    file: File,
    next_sequence: u64,
    /// File length and sequence before the first record not yet synced.
    unsynced: Option<Checkpoint>,
    #[cfg(test)]
    fail_next: Option<Fault>,
}

#[derive(Debug, Clone, Copy)]
struct Checkpoint {
    len: u64,
    next_sequence: u64,
}

/// Failure to simulate on the next append or flush.
#[cfg(test)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Fault {
    /// Writes half of the next frame, then fails.
    Write,
    /// Fails the next sync after the data reached the file.
    Sync,
}

impl WriteAheadLog {
    /// Opens (or creates) the log in `dir`, repairing a torn final frame.
    pub fn open(dir: &Path) -> Result<Self> {
        fs::create_dir_all(dir)
            .with_context(|| format!("failed to create data dir {}", dir.display()))?;
        let path = dir.join(WAL_FILE);
        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .append(true)
            .open(&path)
            .with_context(|| format!("failed to open {}", path.display()))?;

        let scan = scan_frames(&path)?;
        let on_disk = file.metadata()?.len();
        if scan.valid_len < on_disk {
            warn!(
                path = %path.display(),
                valid_len = scan.valid_len,
                on_disk,
                "truncating torn tail of write-ahead log"
            );
            file.set_len(scan.valid_len)
                .context("failed to truncate torn wal tail")?;
        }

        let next_sequence = scan.entries.last().map_or(1, |entry| entry.sequence + 1);
        Ok(Self {
            path,
            file,
            next_sequence,
            unsynced: None,
            #[cfg(test)]
            fail_next: None,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Sequence number the next append will receive.
    pub fn next_sequence(&self) -> u64 {
        self.next_sequence
    }

    /// Appends one record and returns its sequence number.
    ///
    /// The record is written but not yet synced; call [`flush`](Self::flush)
    /// before treating it as durable. If the write fails the file is cut back
    /// to its previous length so no partial frame is left in front of later
    /// records.
    pub fn append(&mut self, data: Vec<u8>) -> Result<u64> {
        let sequence = self.next_sequence;
        let frame = encode_frame(&WalEntry { sequence, data })?;
        let checkpoint = Checkpoint {
            len: self.file.metadata()?.len(),
            next_sequence: sequence,
        };

        if let Err(err) = self.write_frame(&frame) {
            self.roll_back(checkpoint);
            return Err(err).with_context(|| format!("failed to append wal entry {sequence}"));
        }

        self.unsynced.get_or_insert(checkpoint);
        self.next_sequence += 1;
        Ok(sequence)
    }

    /// Forces appended records to stable storage.
    ///
    /// If the sync fails every record appended since the last successful
    /// flush is removed again and their sequence numbers are reused.
    pub fn flush(&mut self) -> Result<()> {
        if let Err(err) = self.sync() {
            if let Some(checkpoint) = self.unsynced.take() {
                self.roll_back(checkpoint);
            }
            return Err(err).with_context(|| format!("failed to sync {}", self.path.display()));
        }
        self.unsynced = None;
        Ok(())
    }

    fn roll_back(&mut self, checkpoint: Checkpoint) {
        warn!(
            path = %self.path.display(),
            len = checkpoint.len,
            next_sequence = checkpoint.next_sequence,
            "rolling back unsynced wal records"
        );
        if let Err(err) = self.file.set_len(checkpoint.len) {
            warn!(error = ?err, "failed to truncate wal after a failed write");
        }
        self.next_sequence = checkpoint.next_sequence;
    }

    fn write_frame(&mut self, frame: &[u8]) -> std::io::Result<()> {
        #[cfg(test)]
        if self.fail_next == Some(Fault::Write) {
            self.fail_next = None;
            self.file.write_all(&frame[..frame.len() / 2])?;
            return Err(std::io::Error::other("injected write failure"));
        }
        self.file.write_all(frame)
    }

    fn sync(&mut self) -> std::io::Result<()> {
        #[cfg(test)]
        if self.fail_next == Some(Fault::Sync) {
            self.fail_next = None;
            return Err(std::io::Error::other("injected sync failure"));
        }
        self.file.sync_data()
    }

    #[cfg(test)]
    pub(crate) fn inject_fault(&mut self, fault: Fault) {
        self.fail_next = Some(fault);
    }

    /// Reads every complete record from the start of the log.
    pub fn read_all(&self) -> Result<Vec<WalEntry>> {
        Ok(scan_frames(&self.path)?.entries)
    }
}

struct FrameScan {
    entries: Vec<WalEntry>,
    /// Byte offset just past the last complete frame.
    valid_len: u64,
}

fn encode_frame(entry: &WalEntry) -> Result<Vec<u8>> {
    let body = bincode::serialize(entry).context("failed to encode wal entry")?;
    let len = u32::try_from(body.len()).context("wal entry too large")?;
    let mut frame = Vec::with_capacity(FRAME_HEADER_LEN + body.len());
    frame.extend_from_slice(&len.to_be_bytes());
    frame.extend_from_slice(&body);
    Ok(frame)
}

fn scan_frames(path: &Path) -> Result<FrameScan> {
    let mut bytes = Vec::new();
    File::open(path)
        .and_then(|mut file| file.read_to_end(&mut bytes))
        .with_context(|| format!("failed to read {}", path.display()))?;

    let mut entries = Vec::new();
    let mut offset = 0;
    while bytes.len() - offset >= FRAME_HEADER_LEN {
        let mut header = [0u8; FRAME_HEADER_LEN];
        header.copy_from_slice(&bytes[offset..offset + FRAME_HEADER_LEN]);
        let start = offset + FRAME_HEADER_LEN;
        let end = start + u32::from_be_bytes(header) as usize;
        if end > bytes.len() {
            break;
        }

        match bincode::deserialize::<WalEntry>(&bytes[start..end]) {
            Ok(entry) => entries.push(entry),
            // A garbled final frame is a torn write; anything earlier is corruption.
            Err(_) if end == bytes.len() => break,
            Err(err) => bail!(
                "corrupt wal entry at offset {offset} in {}: {err}",
                path.display()
            ),
        }
        offset = end;
    }

    Ok(FrameScan {
        entries,
        valid_len: offset as u64,
    })
}
