use crate::config::{DurabilityMode, MetaConfig, RecoveryMode};
use crate::error::MetaError;
use crate::wal::frame::{
    FrameCursor, FrameError, FrameKind, HEADER_SIZE, JournalFrame, check_header, encode_frame,
    encode_header,
};
use crate::wal::{Journal, JournalBatch};
use std::fs::{self, File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::{info, warn};

pub const JOURNAL_FILE_NAME: &str = "journal.log";

/// Single-file durable journal: a header followed by one crc-checked frame
/// per committed batch.
#[derive(Debug)]
pub struct FileJournal {
    path: PathBuf,
    file: File,
    /// Length of the valid prefix; appends start here.
    len: u64,
    durability_mode: DurabilityMode,
    recovery_mode: RecoveryMode,
}

impl FileJournal {
    pub fn open(dir: &Path, config: &MetaConfig) -> Result<Self, MetaError> {
        fs::create_dir_all(dir)?;
        let path = dir.join(JOURNAL_FILE_NAME);
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)?;
        let mut len = file.metadata()?.len();
        if len == 0 {
            file.write_all(&encode_header())?;
            file.sync_all()?;
            len = HEADER_SIZE as u64;
        }
        info!(path = %path.display(), bytes = len, "opened journal");
        Ok(Self {
            path,
            file,
            len,
            durability_mode: config.durability_mode,
            recovery_mode: config.recovery_mode,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn write_frame(&mut self, bytes: &[u8]) -> std::io::Result<()> {
        self.file.seek(SeekFrom::Start(self.len))?;
        self.file.write_all(bytes)?;
        if self.durability_mode == DurabilityMode::Full {
            self.file.sync_data()?;
        }
        Ok(())
    }

    fn truncate_to(&mut self, len: u64) -> Result<(), MetaError> {
        self.file.set_len(len)?;
        self.file.sync_all()?;
        self.len = len;
        Ok(())
    }
}

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

impl Journal for FileJournal {
    fn append(&mut self, batch: &JournalBatch) -> Result<(), MetaError> {
        let frame = JournalFrame {
            seq: batch.seq,
            timestamp_ms: now_ms(),
            kind: FrameKind::Batch,
            payload: batch.encode()?,
        };
        let bytes = encode_frame(&frame).map_err(|e| MetaError::Encode(e.to_string()))?;
        if let Err(e) = self.write_frame(&bytes) {
            // drop whatever part of the frame reached the file
            if let Err(truncate) = self.file.set_len(self.len) {
                warn!(error = %truncate, "failed to truncate torn journal frame");
            }
            return Err(MetaError::JournalCommit {
                message: format!("append of seq {} failed: {e}", batch.seq),
            });
        }
        self.len += bytes.len() as u64;
        Ok(())
    }

    fn replay(&mut self) -> Result<Vec<JournalBatch>, MetaError> {
        let mut bytes = Vec::new();
        self.file.seek(SeekFrom::Start(0))?;
        self.file.read_to_end(&mut bytes)?;
        check_header(&bytes).map_err(|e| MetaError::Corruption {
            message: format!("{}: {e}", self.path.display()),
        })?;

        let mut batches = Vec::new();
        let mut cursor = FrameCursor::new(&bytes, HEADER_SIZE);
        loop {
            match cursor.next_frame() {
                Ok(Some(frame)) => batches.push(JournalBatch::decode(&frame.payload)?),
                Ok(None) => break,
                Err(FrameError::Truncation { offset }) => {
                    warn!(offset, "dropping torn journal tail");
                    self.truncate_to(offset as u64)?;
                    return Ok(batches);
                }
                Err(FrameError::Corruption { offset })
                    if self.recovery_mode == RecoveryMode::Permissive =>
                {
                    warn!(offset, "journal corruption, truncating at last valid frame");
                    self.truncate_to(offset as u64)?;
                    return Ok(batches);
                }
                Err(e) => {
                    return Err(MetaError::Corruption {
                        message: format!("{}: {e}", self.path.display()),
                    });
                }
            }
        }
        self.len = bytes.len() as u64;
        Ok(batches)
    }
}
