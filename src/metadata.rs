//! Per-entry filesystem metadata and its self-delimiting record encoding,
//! used to build the `.bupm` fragment of every directory tree.

use std::io;
use std::path::Path;

use bincode::Options;
use filetime::FileTime;
use serde::{Deserialize, Serialize};

use crate::vint;

/// A second/nanosecond timestamp pair.
#[derive(Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Debug, Default)]
pub struct Timespec {
    pub sec: i64,
    pub nsec: u32,
}

impl Timespec {
    pub fn new(sec: i64, nsec: u32) -> Self {
        Self { sec, nsec }
    }
}

impl From<FileTime> for Timespec {
    fn from(t: FileTime) -> Self {
        Self {
            sec: t.unix_seconds(),
            nsec: t.nanoseconds(),
        }
    }
}

/// Metadata of a single filesystem entry. An all-default value stands in
/// for "no metadata" (grafted roots, collided roots, unreadable paths).
#[derive(Clone, Serialize, Deserialize, PartialEq, Eq, Debug, Default)]
pub struct Metadata {
    pub mode: u32,
    pub uid: u32,
    pub gid: u32,
    pub rdev: u64,
    pub atime: Timespec,
    pub mtime: Timespec,
    pub ctime: Timespec,
    pub size: Option<u64>,
    pub symlink_target: Option<Vec<u8>>,
    pub hardlink_target: Option<Vec<u8>>,
}

#[derive(Debug, thiserror::Error)]
pub enum MetadataError {
    #[error("truncated metadata record")]
    Truncated,
    #[error("{0}")]
    Serialization(#[from] bincode::Error),
}

impl Metadata {
    /// Captures metadata from the filesystem without following symlinks.
    pub fn from_path(
        path: &Path,
        hardlink_target: Option<Vec<u8>>,
    ) -> io::Result<Self> {
        use std::os::unix::fs::MetadataExt;

        let md = std::fs::symlink_metadata(path)?;
        let symlink_target = if md.file_type().is_symlink() {
            use std::os::unix::ffi::OsStrExt;
            Some(std::fs::read_link(path)?.as_os_str().as_bytes().to_vec())
        } else {
            None
        };

        Ok(Self {
            mode: md.mode(),
            uid: md.uid(),
            gid: md.gid(),
            rdev: md.rdev(),
            atime: FileTime::from_last_access_time(&md).into(),
            mtime: FileTime::from_last_modification_time(&md).into(),
            ctime: Timespec::new(md.ctime(), md.ctime_nsec() as u32),
            size: md.file_type().is_file().then(|| md.len()),
            symlink_target,
            hardlink_target,
        })
    }

    /// Encodes one self-delimiting record: a vuint length prefix followed by
    /// the varint-packed body.
    pub fn encode(&self) -> Result<Vec<u8>, MetadataError> {
        let body = bincode::options().with_varint_encoding().serialize(self)?;
        let mut out = Vec::with_capacity(body.len() + 2);
        vint::write_vuint(&mut out, body.len() as u64);
        out.extend_from_slice(&body);
        Ok(out)
    }

    /// Decodes one record from the front of `buf`, returning it and the
    /// number of bytes consumed.
    pub fn decode_record(buf: &[u8]) -> Result<(Self, usize), MetadataError> {
        let (len, prefix) = vint::decode_vuint(buf).ok_or(MetadataError::Truncated)?;
        let end = prefix
            .checked_add(len as usize)
            .filter(|&end| end <= buf.len())
            .ok_or(MetadataError::Truncated)?;
        let meta = bincode::options()
            .with_varint_encoding()
            .deserialize(&buf[prefix..end])?;
        Ok((meta, end))
    }

    /// Decodes a whole `.bupm` stream into its records.
    pub fn decode_stream(mut buf: &[u8]) -> Result<Vec<Self>, MetadataError> {
        let mut out = Vec::new();
        while !buf.is_empty() {
            let (meta, used) = Self::decode_record(buf)?;
            out.push(meta);
            buf = &buf[used..];
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn record_roundtrip() {
        let meta = Metadata {
            mode: 0o100644,
            uid: 1000,
            gid: 1000,
            rdev: 0,
            atime: Timespec::new(1_700_000_000, 1),
            mtime: Timespec::new(1_700_000_001, 2),
            ctime: Timespec::new(1_700_000_002, 3),
            size: Some(42),
            symlink_target: None,
            hardlink_target: Some(b"/a/b".to_vec()),
        };
        let encoded = meta.encode().unwrap();
        let (decoded, used) = Metadata::decode_record(&encoded).unwrap();
        assert_eq!(decoded, meta);
        assert_eq!(used, encoded.len());
    }

    #[test]
    fn stream_of_records() {
        let a = Metadata::default();
        let b = Metadata {
            mode: 0o120777,
            symlink_target: Some(b"target".to_vec()),
            ..Default::default()
        };
        let mut stream = a.encode().unwrap();
        stream.extend_from_slice(&b.encode().unwrap());
        let decoded = Metadata::decode_stream(&stream).unwrap();
        assert_eq!(decoded, vec![a, b]);
    }

    #[test]
    fn truncated_record_is_an_error() {
        let encoded = Metadata::default().encode().unwrap();
        assert!(Metadata::decode_record(&encoded[..encoded.len() - 1]).is_err());
    }

    #[test]
    fn from_path_captures_symlink_target() {
        let dir = tempfile::tempdir().unwrap();
        let link = dir.path().join("l");
        std::os::unix::fs::symlink("/nowhere", &link).unwrap();
        let meta = Metadata::from_path(&link, None).unwrap();
        assert_eq!(meta.symlink_target, Some(b"/nowhere".to_vec()));
        assert_eq!(meta.size, None);
    }
}
