//! Write-ahead log file format.
//!
//! A single append-only file per store partition. The file starts with an
//! 8-byte header, followed by self-delimiting records:
//!
//! ```text
//! ┌──────────────────────────────┐
//! │ Magic "RVWL" (4) │ Version(4)│
//! ├──────────────────────────────┤
//! │ Record 1                     │
//! ├──────────────────────────────┤
//! │ ...                          │
//! └──────────────────────────────┘
//!
//! Record:
//! ┌──────────────┬─────────────────┬────────────────────┬───────────┐
//! │ Length (4)   │ Format Ver (1)  │ Payload (variable) │ CRC32 (4) │
//! └──────────────┴─────────────────┴────────────────────┴───────────┘
//! ```
//!
//! The length field covers format version + payload + CRC. The checksum is
//! computed over format version + payload. The payload is a bincode-encoded
//! batch of mutations, one record per committed batch.
//!
//! A torn record at the tail (crash mid-append) is truncated away on open.
//! A checksum mismatch anywhere before the tail is corruption and fails the
//! open.

use crate::engine::WalOp;
use rivulet_core::{Result, StateError};
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

/// Magic bytes identifying a Rivulet WAL file
pub const WAL_MAGIC: [u8; 4] = *b"RVWL";

/// Current WAL file format version
pub const WAL_FORMAT_VERSION: u32 = 1;

/// Current record format version
pub const WAL_RECORD_FORMAT_VERSION: u8 = 1;

/// Size of the file header in bytes
pub const WAL_HEADER_SIZE: usize = 8;

fn encode_record(batch: &[WalOp]) -> Result<Vec<u8>> {
    let payload = bincode::serialize(batch)?;
    let mut body = Vec::with_capacity(1 + payload.len());
    body.push(WAL_RECORD_FORMAT_VERSION);
    body.extend_from_slice(&payload);
    let crc = crc32fast::hash(&body);

    let length = (body.len() + 4) as u32;
    let mut record = Vec::with_capacity(4 + body.len() + 4);
    record.extend_from_slice(&length.to_le_bytes());
    record.extend_from_slice(&body);
    record.extend_from_slice(&crc.to_le_bytes());
    Ok(record)
}

/// Append-only WAL writer.
///
/// `open` replays nothing by itself; use [`read_wal`] first to load state,
/// then open the writer, which truncates any torn tail so appends land on
/// a record boundary.
pub struct WalWriter {
    file: File,
    path: PathBuf,
}

impl WalWriter {
    /// Open (or create) the WAL at `path`, truncating a torn tail.
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let exists = path.exists();
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(path)?;

        if exists && file.metadata()?.len() as usize >= WAL_HEADER_SIZE {
            let valid_len = scan_valid_length(&mut file)?;
            file.set_len(valid_len)?;
            file.seek(SeekFrom::End(0))?;
        } else {
            let mut header = [0u8; WAL_HEADER_SIZE];
            header[0..4].copy_from_slice(&WAL_MAGIC);
            header[4..8].copy_from_slice(&WAL_FORMAT_VERSION.to_le_bytes());
            file.set_len(0)?;
            file.write_all(&header)?;
            file.sync_all()?;
        }

        Ok(WalWriter {
            file,
            path: path.to_path_buf(),
        })
    }

    /// Append a batch and fsync before returning.
    ///
    /// A batch that returns `Ok` survives process crash.
    pub fn append(&mut self, batch: &[WalOp]) -> Result<()> {
        let record = encode_record(batch)?;
        self.file.write_all(&record)?;
        self.file.sync_data()?;
        Ok(())
    }

    /// Path of the underlying file.
    pub fn path(&self) -> &Path {
        &self.path
    }
}

/// Read every intact batch from the WAL at `path`.
///
/// Returns an empty list when the file does not exist. A torn tail is
/// ignored (the writer truncates it on open); a checksum mismatch before
/// the tail is `Corruption`.
pub fn read_wal(path: &Path) -> Result<Vec<Vec<WalOp>>> {
    if !path.exists() {
        return Ok(Vec::new());
    }
    let mut file = File::open(path)?;
    let mut bytes = Vec::new();
    file.read_to_end(&mut bytes)?;

    if bytes.len() < WAL_HEADER_SIZE {
        return Ok(Vec::new());
    }
    if bytes[0..4] != WAL_MAGIC {
        return Err(StateError::corruption(format!(
            "bad WAL magic in {}",
            path.display()
        )));
    }
    let version = u32::from_le_bytes(bytes[4..8].try_into().expect("4 bytes"));
    if version != WAL_FORMAT_VERSION {
        return Err(StateError::corruption(format!(
            "unsupported WAL format version {}",
            version
        )));
    }

    let mut batches = Vec::new();
    let mut pos = WAL_HEADER_SIZE;
    while pos < bytes.len() {
        // Torn length prefix: tail, stop.
        if pos + 4 > bytes.len() {
            break;
        }
        let length = u32::from_le_bytes(bytes[pos..pos + 4].try_into().expect("4 bytes")) as usize;
        let record_end = pos + 4 + length;
        if length < 5 {
            return Err(StateError::corruption("WAL record shorter than framing"));
        }
        // Torn record body: tail, stop.
        if record_end > bytes.len() {
            break;
        }

        let body = &bytes[pos + 4..record_end - 4];
        let stored_crc =
            u32::from_le_bytes(bytes[record_end - 4..record_end].try_into().expect("4 bytes"));
        let computed_crc = crc32fast::hash(body);
        if stored_crc != computed_crc {
            // Only the final record may be torn; a bad checksum earlier is
            // real corruption.
            if record_end == bytes.len() {
                break;
            }
            return Err(StateError::corruption(format!(
                "WAL checksum mismatch at byte {}: stored {:#010x}, computed {:#010x}",
                pos, stored_crc, computed_crc
            )));
        }

        if body[0] != WAL_RECORD_FORMAT_VERSION {
            return Err(StateError::corruption(format!(
                "unsupported WAL record version {}",
                body[0]
            )));
        }
        let batch: Vec<WalOp> = bincode::deserialize(&body[1..])?;
        batches.push(batch);
        pos = record_end;
    }
    Ok(batches)
}

/// Byte length of the valid prefix (header + intact records).
fn scan_valid_length(file: &mut File) -> Result<u64> {
    let mut bytes = Vec::new();
    file.seek(SeekFrom::Start(0))?;
    file.read_to_end(&mut bytes)?;
    if bytes.len() < WAL_HEADER_SIZE || bytes[0..4] != WAL_MAGIC {
        return Err(StateError::corruption("bad WAL header"));
    }

    let mut pos = WAL_HEADER_SIZE;
    loop {
        if pos + 4 > bytes.len() {
            break;
        }
        let length = u32::from_le_bytes(bytes[pos..pos + 4].try_into().expect("4 bytes")) as usize;
        let record_end = pos + 4 + length;
        if length < 5 || record_end > bytes.len() {
            break;
        }
        let body = &bytes[pos + 4..record_end - 4];
        let stored_crc =
            u32::from_le_bytes(bytes[record_end - 4..record_end].try_into().expect("4 bytes"));
        if crc32fast::hash(body) != stored_crc {
            break;
        }
        pos = record_end;
    }
    Ok(pos as u64)
}
