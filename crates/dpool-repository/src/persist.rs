//! Versioned blob framing and atomic file replacement
//!
//! Control and storage-info files share one framing:
//!
//! ```text
//! +-------+---------+--------+-----------------+--------+
//! | Magic | Version | Length | bincode payload | CRC32C |
//! | 4B    | 4B      | 4B     | var             | 4B     |
//! +-------+---------+--------+-----------------+--------+
//! ```
//!
//! A frame that fails any check decodes to `ErrorKind::InvalidData`.

use serde::Serialize;
use serde::de::DeserializeOwned;
use std::fs::{self, File, OpenOptions};
use std::io::{self, ErrorKind, Write};
use std::path::Path;

const HEADER_SIZE: usize = 12;
const CRC_SIZE: usize = 4;

/// Magic and version identifying one kind of blob
#[derive(Clone, Copy, Debug)]
pub(crate) struct BlobFormat {
    pub magic: u32,
    pub version: u32,
}

impl BlobFormat {
    /// Serialize `value` into a framed blob
    pub fn encode<T: Serialize>(self, value: &T) -> io::Result<Vec<u8>> {
        let payload =
            bincode::serialize(value).map_err(|e| io::Error::new(ErrorKind::InvalidData, e))?;
        let len = u32::try_from(payload.len())
            .map_err(|_| io::Error::new(ErrorKind::InvalidInput, "blob payload too large"))?;

        let mut buf = Vec::with_capacity(HEADER_SIZE + payload.len() + CRC_SIZE);
        buf.extend_from_slice(&self.magic.to_le_bytes());
        buf.extend_from_slice(&self.version.to_le_bytes());
        buf.extend_from_slice(&len.to_le_bytes());
        buf.extend_from_slice(&payload);

        let crc = crc32c::crc32c(&buf);
        buf.extend_from_slice(&crc.to_le_bytes());
        Ok(buf)
    }

    /// Parse and verify a framed blob
    pub fn decode<T: DeserializeOwned>(self, data: &[u8]) -> io::Result<T> {
        if data.len() < HEADER_SIZE + CRC_SIZE {
            return Err(corrupt("blob too small"));
        }

        let magic = read_u32(&data[0..4]);
        if magic != self.magic {
            return Err(corrupt("invalid blob magic"));
        }
        let version = read_u32(&data[4..8]);
        if version != self.version {
            return Err(corrupt(format!("unsupported blob version {version}")));
        }

        let len = read_u32(&data[8..12]) as usize;
        let total = HEADER_SIZE + len + CRC_SIZE;
        if data.len() != total {
            return Err(corrupt("blob length mismatch"));
        }

        let stored_crc = read_u32(&data[HEADER_SIZE + len..total]);
        let computed_crc = crc32c::crc32c(&data[..HEADER_SIZE + len]);
        if stored_crc != computed_crc {
            return Err(corrupt("blob CRC mismatch"));
        }

        bincode::deserialize(&data[HEADER_SIZE..HEADER_SIZE + len])
            .map_err(|e| io::Error::new(ErrorKind::InvalidData, e))
    }

    /// Read and decode the blob stored at `path`
    pub fn read_from<T: DeserializeOwned>(self, path: &Path) -> io::Result<T> {
        let data = fs::read(path)?;
        self.decode(&data)
    }
}

fn read_u32(bytes: &[u8]) -> u32 {
    let mut buf = [0u8; 4];
    buf.copy_from_slice(bytes);
    u32::from_le_bytes(buf)
}

fn corrupt(msg: impl Into<String>) -> io::Error {
    io::Error::new(ErrorKind::InvalidData, msg.into())
}

/// Replace `path` with `data` via `temp` and an atomic rename
///
/// The temp file is removed again if any step fails. With `sync` the temp
/// file and the parent directory are fsynced around the rename.
pub(crate) fn write_atomically(path: &Path, temp: &Path, data: &[u8], sync: bool) -> io::Result<()> {
    let result = write_and_rename(path, temp, data, sync);
    if result.is_err() {
        let _ = fs::remove_file(temp);
    }
    result
}

fn write_and_rename(path: &Path, temp: &Path, data: &[u8], sync: bool) -> io::Result<()> {
    {
        let mut file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(temp)?;
        file.write_all(data)?;
        if sync {
            file.sync_all()?;
        }
    }

    fs::rename(temp, path)?;

    if sync {
        if let Some(parent) = path.parent() {
            File::open(parent)?.sync_all()?;
        }
    }
    Ok(())
}

/// Remove a file, treating a missing file as success
///
/// Returns whether a file was actually removed.
pub(crate) fn remove_if_exists(path: &Path) -> io::Result<bool> {
    match fs::remove_file(path) {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
        Err(e) => Err(e),
    }
}
