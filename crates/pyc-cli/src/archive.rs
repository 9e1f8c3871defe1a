//! Single-file bundle of compiled units and resource files.
//!
//! Layout, all integers big-endian:
//!
//! ```text
//! magic "PYAR" | version u16 | entry count u32
//! per entry:   kind u8 | name length u16 | name utf8 | data length u32 | sha256 [32]
//! data of every entry, in table order
//! ```

use std::fs;
use std::path::Path;

use sha2::{Digest, Sha256};
use thiserror::Error;

pub const MAGIC: &[u8; 4] = b"PYAR";
pub const VERSION: u16 = 1;

#[derive(Debug, Error)]
pub enum ArchiveError {
    #[error("not a pyjvm archive")]
    BadMagic,
    #[error("unsupported archive version {0}")]
    Version(u16),
    #[error("archive truncated")]
    Truncated,
    #[error("unknown entry kind {0}")]
    Kind(u8),
    #[error("entry name is not utf-8")]
    Name,
    #[error("entry '{0}' is too large")]
    TooLarge(String),
    #[error("digest mismatch for entry '{0}'")]
    Digest(String),
    #[error("{0}")]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryKind {
    Unit,
    Resource,
}

impl EntryKind {
    fn tag(self) -> u8 {
        match self {
            EntryKind::Unit => 0,
            EntryKind::Resource => 1,
        }
    }

    fn from_tag(tag: u8) -> Result<Self, ArchiveError> {
        match tag {
            0 => Ok(EntryKind::Unit),
            1 => Ok(EntryKind::Resource),
            other => Err(ArchiveError::Kind(other)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Entry {
    pub kind: EntryKind,
    /// Relative path: `pkg/mod.class` for units.
    pub name: String,
    pub data: Vec<u8>,
}

pub fn digest(data: &[u8]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(data);
    let mut out = [0u8; 32];
    out.copy_from_slice(&hasher.finalize());
    out
}

pub fn encode(entries: &[Entry]) -> Result<Vec<u8>, ArchiveError> {
    let mut out = Vec::new();
    out.extend_from_slice(MAGIC);
    out.extend_from_slice(&VERSION.to_be_bytes());
    let count = u32::try_from(entries.len()).map_err(|_| ArchiveError::TooLarge("<table>".into()))?;
    out.extend_from_slice(&count.to_be_bytes());
    for entry in entries {
        let name_len = u16::try_from(entry.name.len()).map_err(|_| ArchiveError::TooLarge(entry.name.clone()))?;
        let data_len = u32::try_from(entry.data.len()).map_err(|_| ArchiveError::TooLarge(entry.name.clone()))?;
        out.push(entry.kind.tag());
        out.extend_from_slice(&name_len.to_be_bytes());
        out.extend_from_slice(entry.name.as_bytes());
        out.extend_from_slice(&data_len.to_be_bytes());
        out.extend_from_slice(&digest(&entry.data));
    }
    for entry in entries {
        out.extend_from_slice(&entry.data);
    }
    Ok(out)
}

struct Reader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn take(&mut self, n: usize) -> Result<&'a [u8], ArchiveError> {
        let end = self.pos.checked_add(n).ok_or(ArchiveError::Truncated)?;
        let bytes = self.data.get(self.pos..end).ok_or(ArchiveError::Truncated)?;
        self.pos = end;
        Ok(bytes)
    }

    fn u8(&mut self) -> Result<u8, ArchiveError> {
        Ok(self.take(1)?[0])
    }

    fn u16(&mut self) -> Result<u16, ArchiveError> {
        let b = self.take(2)?;
        Ok(u16::from_be_bytes([b[0], b[1]]))
    }

    fn u32(&mut self) -> Result<u32, ArchiveError> {
        let b = self.take(4)?;
        Ok(u32::from_be_bytes([b[0], b[1], b[2], b[3]]))
    }
}

/// Decode an archive, checking every entry against its recorded digest.
pub fn decode(data: &[u8]) -> Result<Vec<Entry>, ArchiveError> {
    let mut r = Reader { data, pos: 0 };
    if r.take(4).map_err(|_| ArchiveError::BadMagic)? != MAGIC {
        return Err(ArchiveError::BadMagic);
    }
    let version = r.u16()?;
    if version != VERSION {
        return Err(ArchiveError::Version(version));
    }
    let count = r.u32()? as usize;
    let mut table = Vec::with_capacity(count.min(4096));
    for _ in 0..count {
        let kind = EntryKind::from_tag(r.u8()?)?;
        let name_len = r.u16()? as usize;
        let name = std::str::from_utf8(r.take(name_len)?).map_err(|_| ArchiveError::Name)?.to_string();
        let len = r.u32()? as usize;
        let mut sum = [0u8; 32];
        sum.copy_from_slice(r.take(32)?);
        table.push((kind, name, len, sum));
    }
    let mut entries = Vec::with_capacity(table.len());
    for (kind, name, len, sum) in table {
        let data = r.take(len)?.to_vec();
        if digest(&data) != sum {
            return Err(ArchiveError::Digest(name));
        }
        entries.push(Entry { kind, name, data });
    }
    Ok(entries)
}

pub fn write(path: &Path, entries: &[Entry]) -> Result<(), ArchiveError> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent)?;
    }
    fs::write(path, encode(entries)?)?;
    Ok(())
}

pub fn read(path: &Path) -> Result<Vec<Entry>, ArchiveError> {
    decode(&fs::read(path)?)
}
