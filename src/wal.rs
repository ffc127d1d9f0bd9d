//! The write-ahead log.
//!
//! An append-only stream of records, each framed as
//! `total_len (u32 LE) · crc (u32 LE) · bincode body` so the stream can be
//! scanned unambiguously even though page images may contain any byte.
//! Every append is synced to disk before it returns. A `PageWrite` record
//! must be durable before the buffer pool may evict the corresponding
//! dirty frame; callers append the record as part of the mutation, while
//! the frame is still pinned.

use crc32fast::Hasher;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::Path;

use crate::error::{Error, Result};
use crate::{PageId, TransactionId};

/// Frame header: total record length plus the checksum of the body.
const RECORD_HEADER_SIZE: usize = 8;

/// A single log record.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub enum WalRecord {
    Begin {
        tx_id: TransactionId,
    },
    Commit {
        tx_id: TransactionId,
    },
    Abort {
        tx_id: TransactionId,
    },
    /// Full page images around one modification. The record names the
    /// owning table so a log spanning per-table files replays unambiguously.
    PageWrite {
        tx_id: TransactionId,
        table: String,
        page_id: PageId,
        before: Vec<u8>,
        after: Vec<u8>,
    },
    Checkpoint,
}

impl WalRecord {
    pub fn tx_id(&self) -> TransactionId {
        match self {
            WalRecord::Begin { tx_id }
            | WalRecord::Commit { tx_id }
            | WalRecord::Abort { tx_id }
            | WalRecord::PageWrite { tx_id, .. } => *tx_id,
            WalRecord::Checkpoint => 0,
        }
    }
}

/// Transactions classified by the last lifecycle record seen for each.
#[derive(Debug, Default)]
pub struct LogSummary {
    pub committed: HashSet<TransactionId>,
    pub aborted: HashSet<TransactionId>,
    pub begun: HashSet<TransactionId>,
    /// Highest transaction id appearing anywhere in the log.
    pub highest_tx_id: TransactionId,
}

impl LogSummary {
    pub fn of(records: &[WalRecord]) -> Self {
        let mut summary = Self::default();
        for record in records {
            summary.highest_tx_id = summary.highest_tx_id.max(record.tx_id());
            match record {
                WalRecord::Begin { tx_id } => {
                    summary.begun.insert(*tx_id);
                }
                WalRecord::Commit { tx_id } => {
                    summary.committed.insert(*tx_id);
                }
                WalRecord::Abort { tx_id } => {
                    summary.aborted.insert(*tx_id);
                }
                _ => {}
            }
        }
        summary
    }

    /// Transactions whose effects must be rolled back: begun but never
    /// committed. Aborted transactions are included; abort releases locks
    /// without restoring pages, so their images are reversed here.
    pub fn needs_undo(&self, tx_id: TransactionId) -> bool {
        self.begun.contains(&tx_id) && !self.committed.contains(&tx_id)
    }
}

/// The log stream. One per database, shared by every table.
pub struct WalManager {
    file: File,
}

impl WalManager {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path.as_ref())?;
        Ok(Self { file })
    }

    /// Append one record and flush it to disk.
    pub fn append(&mut self, record: &WalRecord) -> Result<()> {
        let body = bincode::serialize(record).unwrap();
        let mut hasher = Hasher::new();
        hasher.update(&body);
        let crc = hasher.finalize();
        let total_len = (RECORD_HEADER_SIZE + body.len()) as u32;

        self.file.seek(SeekFrom::End(0))?;
        self.file.write_all(&total_len.to_le_bytes())?;
        self.file.write_all(&crc.to_le_bytes())?;
        self.file.write_all(&body)?;
        self.file.sync_all()?;
        Ok(())
    }

    /// Scan every complete record from the start of the log. An incomplete
    /// record at the tail ends the scan (a torn final write); a checksum
    /// mismatch on a complete record is corruption.
    pub fn records(&mut self) -> Result<Vec<WalRecord>> {
        let mut buf = Vec::new();
        self.file.seek(SeekFrom::Start(0))?;
        self.file.read_to_end(&mut buf)?;

        let mut records = Vec::new();
        let mut pos = 0;
        while pos + RECORD_HEADER_SIZE <= buf.len() {
            let total_len = u32::from_le_bytes(buf[pos..pos + 4].try_into().unwrap()) as usize;
            let crc = u32::from_le_bytes(buf[pos + 4..pos + 8].try_into().unwrap());
            if total_len <= RECORD_HEADER_SIZE {
                return Err(Error::Corruption(format!(
                    "wal record at {pos} claims impossible length {total_len}"
                )));
            }
            if pos + total_len > buf.len() {
                crate::basalt_debug_log!("[WalManager::records] Torn record at {pos}, ending scan");
                break;
            }
            let body = &buf[pos + RECORD_HEADER_SIZE..pos + total_len];
            let mut hasher = Hasher::new();
            hasher.update(body);
            if hasher.finalize() != crc {
                return Err(Error::Corruption(format!(
                    "wal record at {pos} fails its checksum"
                )));
            }
            let record = bincode::deserialize(body)
                .map_err(|e| Error::Corruption(format!("wal record at {pos}: {e}")))?;
            records.push(record);
            pos += total_len;
        }
        Ok(records)
    }

    /// Truncate the log to zero length. Only safe once every dirty page
    /// covered by earlier records has reached its data file.
    pub fn truncate(&mut self) -> Result<()> {
        self.file.set_len(0)?;
        self.file.seek(SeekFrom::Start(0))?;
        self.file.sync_all()?;
        Ok(())
    }
}
