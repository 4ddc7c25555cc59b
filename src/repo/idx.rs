//! Pack idx files: a fanout-indexed `sha → offset` map per pack, cached
//! locally in plaintext, plus a merged index over all packs that is
//! regenerated whenever the pack set changes.

use std::io;
use std::path::{Path, PathBuf};

use tokio::fs;
use tokio_stream::{wrappers::ReadDirStream, StreamExt};

use crate::defaults::{IDX_SUFFIX, MIDX_NAME};
use crate::object::Oid;

const IDX_MAGIC: &[u8; 4] = b"PIDX";
const MIDX_MAGIC: &[u8; 4] = b"PMDX";
const VERSION: u32 = 1;

#[derive(Debug, thiserror::Error)]
pub enum IdxError {
    #[error("bad idx magic in {0}")]
    BadMagic(String),
    #[error("truncated or corrupt idx file {0}")]
    Truncated(String),
    #[error("{0}")]
    Io(#[from] io::Error),
}

/// Collects `(sha, objtype, offset)` records while a pack is being written
/// and serializes them into the idx format on finish.
#[derive(Default)]
pub struct PackIdxWriter {
    entries: Vec<(Oid, u8, u64)>,
}

impl PackIdxWriter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, sha: Oid, objtype: u8, offset: u64) {
        self.entries.push((sha, objtype, offset));
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn serialize(mut self) -> Vec<u8> {
        self.entries.sort_unstable_by_key(|(sha, _, _)| *sha);

        let n = self.entries.len();
        let mut out = Vec::with_capacity(8 + 1024 + n * 29);
        out.extend_from_slice(IDX_MAGIC);
        out.extend_from_slice(&VERSION.to_be_bytes());

        let mut fanout = [0u32; 256];
        for (sha, _, _) in &self.entries {
            fanout[sha[0] as usize] += 1;
        }
        let mut cumulative = 0u32;
        for count in &mut fanout {
            cumulative += *count;
            *count = cumulative;
            out.extend_from_slice(&count.to_be_bytes());
        }
        for (sha, _, _) in &self.entries {
            out.extend_from_slice(sha);
        }
        for (_, objtype, _) in &self.entries {
            out.push(*objtype);
        }
        for (_, _, offset) in &self.entries {
            out.extend_from_slice(&offset.to_be_bytes());
        }
        out
    }
}

/// Parsed idx of a single pack.
pub struct PackIdx {
    /// Cache file name, `pack-<hex>.idx`.
    pub name: String,
    fanout: [u32; 256],
    shas: Vec<Oid>,
    offsets: Vec<u64>,
}

fn be_u32(buf: &[u8]) -> u32 {
    u32::from_be_bytes(buf.try_into().expect("4 bytes"))
}

fn be_u64(buf: &[u8]) -> u64 {
    u64::from_be_bytes(buf.try_into().expect("8 bytes"))
}

impl PackIdx {
    pub fn parse(name: &str, data: &[u8]) -> Result<Self, IdxError> {
        if data.len() < 8 + 1024 {
            return Err(IdxError::Truncated(name.to_string()));
        }
        if &data[..4] != IDX_MAGIC || be_u32(&data[4..8]) != VERSION {
            return Err(IdxError::BadMagic(name.to_string()));
        }
        let mut fanout = [0u32; 256];
        for (i, slot) in fanout.iter_mut().enumerate() {
            *slot = be_u32(&data[8 + i * 4..12 + i * 4]);
        }
        let n = fanout[255] as usize;
        let shas_start = 8 + 1024;
        let types_start = shas_start + n * 20;
        let offsets_start = types_start + n;
        if data.len() != offsets_start + n * 8 {
            return Err(IdxError::Truncated(name.to_string()));
        }
        let mut shas = Vec::with_capacity(n);
        for i in 0..n {
            let mut sha = [0u8; 20];
            sha.copy_from_slice(&data[shas_start + i * 20..shas_start + (i + 1) * 20]);
            shas.push(sha);
        }
        let mut offsets = Vec::with_capacity(n);
        for i in 0..n {
            offsets.push(be_u64(&data[offsets_start + i * 8..offsets_start + (i + 1) * 8]));
        }
        Ok(Self {
            name: name.to_string(),
            fanout,
            shas,
            offsets,
        })
    }

    pub fn len(&self) -> usize {
        self.shas.len()
    }

    pub fn is_empty(&self) -> bool {
        self.shas.is_empty()
    }

    pub fn lookup(&self, sha: &Oid) -> Option<u64> {
        let bucket = sha[0] as usize;
        let start = if bucket == 0 {
            0
        } else {
            self.fanout[bucket - 1] as usize
        };
        let end = self.fanout[bucket] as usize;
        let idx = self.shas[start..end].binary_search(sha).ok()?;
        Some(self.offsets[start + idx])
    }

    /// Iterates all `(sha, offset)` pairs in sha order.
    pub fn entries(&self) -> impl Iterator<Item = (&Oid, u64)> {
        self.shas.iter().zip(self.offsets.iter().copied())
    }
}

#[derive(Clone, Copy)]
struct MergedEntry {
    sha: Oid,
    pack: u32,
    offset: u64,
}

/// Combined lookup over all cached pack idx files, backed by the merged
/// index file when it is up to date.
pub struct PackIdxList {
    cachedir: PathBuf,
    names: Vec<String>,
    entries: Vec<MergedEntry>,
}

async fn list_idx_names(cachedir: &Path) -> Result<Vec<String>, IdxError> {
    let mut names = Vec::new();
    let mut entries = ReadDirStream::new(fs::read_dir(cachedir).await?);
    while let Some(entry) = entries.next().await {
        let entry = entry?;
        if let Ok(name) = entry.file_name().into_string() {
            if name.ends_with(IDX_SUFFIX) {
                names.push(name);
            }
        }
    }
    names.sort();
    Ok(names)
}

fn parse_midx(data: &[u8], name: &str) -> Result<(Vec<String>, Vec<MergedEntry>), IdxError> {
    let truncated = || IdxError::Truncated(name.to_string());
    if data.len() < 12 {
        return Err(truncated());
    }
    if &data[..4] != MIDX_MAGIC || be_u32(&data[4..8]) != VERSION {
        return Err(IdxError::BadMagic(name.to_string()));
    }
    let npacks = be_u32(&data[8..12]) as usize;
    let mut pos = 12;
    let mut names = Vec::with_capacity(npacks);
    for _ in 0..npacks {
        if data.len() < pos + 2 {
            return Err(truncated());
        }
        let len = u16::from_be_bytes([data[pos], data[pos + 1]]) as usize;
        pos += 2;
        if data.len() < pos + len {
            return Err(truncated());
        }
        let pack_name =
            String::from_utf8(data[pos..pos + len].to_vec()).map_err(|_| truncated())?;
        names.push(pack_name);
        pos += len;
    }
    if data.len() < pos + 8 {
        return Err(truncated());
    }
    let count = be_u64(&data[pos..pos + 8]) as usize;
    pos += 8;
    if data.len() != pos + count * 32 {
        return Err(truncated());
    }
    let mut entries = Vec::with_capacity(count);
    for i in 0..count {
        let base = pos + i * 32;
        let mut sha = [0u8; 20];
        sha.copy_from_slice(&data[base..base + 20]);
        entries.push(MergedEntry {
            sha,
            pack: be_u32(&data[base + 20..base + 24]),
            offset: be_u64(&data[base + 24..base + 32]),
        });
    }
    Ok((names, entries))
}

fn encode_midx(names: &[String], entries: &[MergedEntry]) -> Vec<u8> {
    let mut out = Vec::with_capacity(12 + entries.len() * 32);
    out.extend_from_slice(MIDX_MAGIC);
    out.extend_from_slice(&VERSION.to_be_bytes());
    out.extend_from_slice(&(names.len() as u32).to_be_bytes());
    for name in names {
        out.extend_from_slice(&(name.len() as u16).to_be_bytes());
        out.extend_from_slice(name.as_bytes());
    }
    out.extend_from_slice(&(entries.len() as u64).to_be_bytes());
    for entry in entries {
        out.extend_from_slice(&entry.sha);
        out.extend_from_slice(&entry.pack.to_be_bytes());
        out.extend_from_slice(&entry.offset.to_be_bytes());
    }
    out
}

async fn merge_from_idx_files(
    cachedir: &Path,
    names: &[String],
) -> Result<Vec<MergedEntry>, IdxError> {
    let mut entries = Vec::new();
    for (pack_ix, name) in names.iter().enumerate() {
        let data = fs::read(cachedir.join(name)).await?;
        let idx = PackIdx::parse(name, &data)?;
        for (sha, offset) in idx.entries() {
            entries.push(MergedEntry {
                sha: *sha,
                pack: pack_ix as u32,
                offset,
            });
        }
    }
    entries.sort_unstable_by_key(|e| e.sha);
    Ok(entries)
}

/// Rebuilds the merged index from the cached per-pack idx files.
pub async fn auto_midx(cachedir: &Path) -> Result<(), IdxError> {
    let names = list_idx_names(cachedir).await?;
    let entries = merge_from_idx_files(cachedir, &names).await?;
    let encoded = encode_midx(&names, &entries);
    let tmp = cachedir.join(format!("{MIDX_NAME}.tmp"));
    fs::write(&tmp, &encoded).await?;
    fs::rename(&tmp, cachedir.join(MIDX_NAME)).await?;
    Ok(())
}

impl PackIdxList {
    pub async fn load(cachedir: &Path) -> Result<Self, IdxError> {
        let names = list_idx_names(cachedir).await?;
        if let Ok(data) = fs::read(cachedir.join(MIDX_NAME)).await {
            if let Ok((midx_names, entries)) = parse_midx(&data, MIDX_NAME) {
                if midx_names == names {
                    return Ok(Self {
                        cachedir: cachedir.to_owned(),
                        names,
                        entries,
                    });
                }
                log::debug!("merged index is stale, rebuilding from pack idx files");
            }
        }
        let entries = merge_from_idx_files(cachedir, &names).await?;
        Ok(Self {
            cachedir: cachedir.to_owned(),
            names,
            entries,
        })
    }

    pub async fn refresh(&mut self) -> Result<(), IdxError> {
        let fresh = Self::load(&self.cachedir).await?;
        self.names = fresh.names;
        self.entries = fresh.entries;
        Ok(())
    }

    pub fn exists(&self, sha: &Oid) -> bool {
        self.find(sha).is_some()
    }

    /// Finds the idx cache file name and pack offset holding `sha`.
    pub fn find(&self, sha: &Oid) -> Option<(&str, u64)> {
        let idx = self
            .entries
            .binary_search_by_key(sha, |e| e.sha)
            .ok()?;
        let entry = &self.entries[idx];
        Some((self.names[entry.pack as usize].as_str(), entry.offset))
    }

    /// Number of objects across all packs.
    pub fn object_count(&self) -> usize {
        self.entries.len()
    }

    /// Idx cache file names currently loaded.
    pub fn pack_names(&self) -> &[String] {
        &self.names
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::{rngs::StdRng, RngCore, SeedableRng};

    fn random_oid(rng: &mut StdRng) -> Oid {
        let mut oid = [0u8; 20];
        rng.fill_bytes(&mut oid);
        oid
    }

    #[test]
    fn writer_reader_roundtrip() {
        let mut rng = StdRng::seed_from_u64(10);
        let mut writer = PackIdxWriter::new();
        let mut expected = Vec::new();
        for i in 0..1000u64 {
            let sha = random_oid(&mut rng);
            writer.add(sha, 3, i * 17);
            expected.push((sha, i * 17));
        }
        let data = writer.serialize();
        let idx = PackIdx::parse("pack-test.idx", &data).unwrap();
        assert_eq!(idx.len(), 1000);
        for (sha, offset) in &expected {
            assert_eq!(idx.lookup(sha), Some(*offset));
        }
        // absent keys stay absent
        for _ in 0..100 {
            let sha = random_oid(&mut rng);
            if !expected.iter().any(|(s, _)| s == &sha) {
                assert_eq!(idx.lookup(&sha), None);
            }
        }
    }

    #[test]
    fn corrupt_idx_is_rejected() {
        let data = PackIdxWriter::new().serialize();
        assert!(PackIdx::parse("x.idx", &data).is_ok());
        assert!(PackIdx::parse("x.idx", &data[..10]).is_err());
        let mut bad = data.clone();
        bad[0] ^= 0xff;
        assert!(PackIdx::parse("x.idx", &bad).is_err());
    }

    #[tokio::test]
    async fn merged_list_spans_packs_and_survives_midx_rebuild() {
        let dir = tempfile::tempdir().unwrap();
        let mut rng = StdRng::seed_from_u64(11);
        let mut all = Vec::new();
        for pack in 0..3 {
            let mut writer = PackIdxWriter::new();
            for i in 0..50u64 {
                let sha = random_oid(&mut rng);
                writer.add(sha, 3, i);
                all.push((sha, format!("pack-{pack}.idx"), i));
            }
            fs::write(dir.path().join(format!("pack-{pack}.idx")), writer.serialize())
                .await
                .unwrap();
        }

        // without a midx file
        let list = PackIdxList::load(dir.path()).await.unwrap();
        assert_eq!(list.object_count(), 150);
        for (sha, pack, offset) in &all {
            assert_eq!(list.find(sha), Some((pack.as_str(), *offset)));
        }

        // with a midx file
        auto_midx(dir.path()).await.unwrap();
        let list = PackIdxList::load(dir.path()).await.unwrap();
        for (sha, pack, offset) in &all {
            assert_eq!(list.find(sha), Some((pack.as_str(), *offset)));
        }

        // a new pack makes the midx stale; lookups still see everything
        let mut writer = PackIdxWriter::new();
        let sha = random_oid(&mut rng);
        writer.add(sha, 3, 7);
        fs::write(dir.path().join("pack-9.idx"), writer.serialize())
            .await
            .unwrap();
        let list = PackIdxList::load(dir.path()).await.unwrap();
        assert_eq!(list.find(&sha), Some(("pack-9.idx", 7)));
    }
}
