//! The filesystem index the save driver consumes: a stream of entries in
//! walk order (a directory's contents precede its terminator entry), a
//! metadata store addressed by offset, and the hardlink path lookup.
//!
//! Directory entries carry a trailing `/` and an empty file name; they tell
//! the driver when to close the open tree frame.

use std::collections::{BTreeMap, HashMap};
use std::os::unix::ffi::OsStrExt;
use std::os::unix::fs::MetadataExt;
use std::path::{Path, PathBuf};

use filetime::FileTime;

use crate::metadata::{Metadata, Timespec};
use crate::object::{Oid, GIT_MODE_FILE, GIT_MODE_SYMLINK, GIT_MODE_TREE};

/// Placeholder object id of a never-saved entry.
pub const EMPTY_SHA: Oid = [0u8; 20];

/// Sentinel for "no stored metadata".
pub const NO_META: u64 = u64::MAX;

/// One index entry. `name` is the absolute path, with a trailing slash on
/// directory (terminator) entries.
#[derive(Clone, Debug)]
pub struct IndexEntry {
    pub name: Vec<u8>,
    pub mode: u32,
    pub gitmode: u32,
    pub size: u64,
    pub dev: u64,
    pub ino: u64,
    pub nlink: u64,
    pub atime: Timespec,
    pub mtime: Timespec,
    pub ctime: Timespec,
    pub sha: Oid,
    pub exists: bool,
    pub sha_valid: bool,
    pub meta_ofs: u64,
}

impl IndexEntry {
    pub fn is_dir(&self) -> bool {
        self.name.ends_with(b"/")
    }

    /// The filesystem path, without the terminator slash.
    pub fn fs_path(&self) -> PathBuf {
        let mut bytes = self.name.as_slice();
        if bytes.len() > 1 && bytes.ends_with(b"/") {
            bytes = &bytes[..bytes.len() - 1];
        }
        PathBuf::from(std::ffi::OsStr::from_bytes(bytes))
    }

    /// Whether the recorded object id can be trusted.
    pub fn is_valid(&self) -> bool {
        self.sha_valid && self.sha != EMPTY_SHA
    }

    pub fn validate(&mut self, gitmode: u32, oid: Oid) {
        self.gitmode = gitmode;
        self.sha = oid;
        self.sha_valid = true;
    }

    pub fn invalidate(&mut self) {
        self.sha_valid = false;
    }
}

/// In-memory index over one or more source trees, with its metadata store.
pub struct Index {
    pub entries: Vec<IndexEntry>,
    metas: Vec<Metadata>,
}

impl Index {
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Fetches stored metadata by the offset recorded in an entry.
    pub fn metadata_at(&self, ofs: u64) -> Option<Metadata> {
        if ofs == NO_META {
            return None;
        }
        self.metas.get(ofs as usize).cloned()
    }

    /// Stores metadata, returning its offset.
    pub fn store_meta(&mut self, meta: Metadata) -> u64 {
        self.metas.push(meta);
        (self.metas.len() - 1) as u64
    }
}

/// Opaque `(dev, ino) → [paths]` lookup for hardlink attribution.
#[derive(Default)]
pub struct HLinkDb {
    paths: HashMap<(u64, u64), Vec<Vec<u8>>>,
}

impl HLinkDb {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_path(&mut self, dev: u64, ino: u64, name: Vec<u8>) {
        self.paths.entry((dev, ino)).or_default().push(name);
    }

    /// First known path of a link group, attached to metadata so restore
    /// can recreate the links.
    pub fn first_path(&self, dev: u64, ino: u64) -> Option<&[u8]> {
        self.paths
            .get(&(dev, ino))
            .and_then(|paths| paths.first())
            .map(Vec::as_slice)
    }
}

fn mode_to_gitmode(mode: u32) -> u32 {
    match mode & 0o170000 {
        0o040000 => GIT_MODE_TREE,
        0o120000 => GIT_MODE_SYMLINK,
        _ => GIT_MODE_FILE,
    }
}

fn path_bytes(path: &Path) -> Vec<u8> {
    path.as_os_str().as_bytes().to_vec()
}

fn entry_from_metadata(name: Vec<u8>, md: &std::fs::Metadata, meta_ofs: u64) -> IndexEntry {
    IndexEntry {
        name,
        mode: md.mode(),
        gitmode: mode_to_gitmode(md.mode()),
        size: md.len(),
        dev: md.dev(),
        ino: md.ino(),
        nlink: md.nlink(),
        atime: FileTime::from_last_access_time(md).into(),
        mtime: FileTime::from_last_modification_time(md).into(),
        ctime: Timespec::new(md.ctime(), md.ctime_nsec() as u32),
        sha: EMPTY_SHA,
        exists: true,
        sha_valid: false,
        meta_ofs,
    }
}

fn emit_terminator(index: &mut Index, dir: &Path) {
    let mut name = path_bytes(dir);
    if !name.ends_with(b"/") {
        name.push(b'/');
    }
    match std::fs::symlink_metadata(dir) {
        Ok(md) => index.entries.push(entry_from_metadata(name, &md, NO_META)),
        Err(e) => log::warn!("cannot stat directory {}: {e}", dir.display()),
    }
}

fn emit_file(index: &mut Index, hlinks: &mut HLinkDb, path: &Path, md: &std::fs::Metadata) {
    let name = path_bytes(path);
    if md.nlink() > 1 {
        hlinks.add_path(md.dev(), md.ino(), name.clone());
    }
    let meta_ofs = match Metadata::from_path(path, None) {
        Ok(meta) => index.store_meta(meta),
        Err(e) => {
            log::warn!("cannot read metadata of {}: {e}", path.display());
            NO_META
        }
    };
    index.entries.push(entry_from_metadata(name, md, meta_ofs));
}

fn walk_dir(index: &mut Index, hlinks: &mut HLinkDb, dir: &Path) {
    let reader = match std::fs::read_dir(dir) {
        Ok(reader) => reader,
        Err(e) => {
            log::warn!("cannot read directory {}: {e}, skipping", dir.display());
            return;
        }
    };
    let mut children: BTreeMap<Vec<u8>, PathBuf> = BTreeMap::new();
    for entry in reader {
        match entry {
            Ok(entry) => {
                let path = entry.path();
                children.insert(path_bytes(&path), path);
            }
            Err(e) => log::warn!("error listing {}: {e}, continuing", dir.display()),
        }
    }
    for path in children.values() {
        match std::fs::symlink_metadata(path) {
            Ok(md) if md.is_dir() => {
                walk_dir(index, hlinks, path);
                emit_terminator(index, path);
            }
            Ok(md) => emit_file(index, hlinks, path, &md),
            Err(e) => log::warn!("cannot stat {}: {e}, continuing", path.display()),
        }
    }
}

/// Walks the given source paths and builds the index stream plus the
/// hardlink database. Paths are canonicalized and visited in sorted order.
/// Only paths at or below the sources appear; the save driver closes their
/// ancestors itself when the walk ends.
pub fn build_index(roots: &[PathBuf]) -> std::io::Result<(Index, HLinkDb)> {
    let mut canonical = Vec::with_capacity(roots.len());
    for root in roots {
        canonical.push(std::fs::canonicalize(root)?);
    }
    canonical.sort();
    canonical.dedup();

    let mut index = Index {
        entries: Vec::new(),
        metas: Vec::new(),
    };
    let mut hlinks = HLinkDb::new();

    for root in &canonical {
        let md = std::fs::symlink_metadata(root)?;
        if md.is_dir() {
            walk_dir(&mut index, &mut hlinks, root);
            emit_terminator(&mut index, root);
        } else {
            emit_file(&mut index, &mut hlinks, root, &md);
        }
    }
    Ok((index, hlinks))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn names(index: &Index) -> Vec<String> {
        index
            .entries
            .iter()
            .map(|e| String::from_utf8_lossy(&e.name).into_owned())
            .collect()
    }

    #[test]
    fn contents_precede_terminators() {
        let tmp = tempfile::tempdir().unwrap();
        let root = tmp.path().join("src");
        std::fs::create_dir_all(root.join("sub")).unwrap();
        std::fs::write(root.join("a.txt"), b"a").unwrap();
        std::fs::write(root.join("sub/b.txt"), b"b").unwrap();

        let (index, _) = build_index(&[root.clone()]).unwrap();
        let all = names(&index);
        let root = tmp.path().join("src").canonicalize().unwrap();
        let pos = |suffix: &str| {
            all.iter()
                .position(|n| n.ends_with(suffix))
                .unwrap_or_else(|| panic!("no entry ending with {suffix}: {all:?}"))
        };
        assert!(pos("a.txt") < pos(&format!("{}/", root.display())));
        assert!(pos("b.txt") < pos("sub/"));
        assert!(pos("sub/") < pos(&format!("{}/", root.display())));
        // the source's own terminator closes the stream
        assert_eq!(all.last().unwrap(), &format!("{}/", root.display()));
    }

    #[test]
    fn file_entries_carry_metadata() {
        let tmp = tempfile::tempdir().unwrap();
        let root = tmp.path().join("d");
        std::fs::create_dir(&root).unwrap();
        std::fs::write(root.join("f"), b"hello").unwrap();

        let (index, _) = build_index(&[root]).unwrap();
        let file = index
            .entries
            .iter()
            .find(|e| e.name.ends_with(b"/f"))
            .unwrap();
        assert!(!file.is_dir());
        assert_eq!(file.size, 5);
        assert!(!file.is_valid());
        let meta = index.metadata_at(file.meta_ofs).unwrap();
        assert_eq!(meta.size, Some(5));
    }

    #[test]
    fn hardlinks_are_grouped() {
        let tmp = tempfile::tempdir().unwrap();
        let root = tmp.path().join("d");
        std::fs::create_dir(&root).unwrap();
        std::fs::write(root.join("one"), b"x").unwrap();
        std::fs::hard_link(root.join("one"), root.join("two")).unwrap();

        let (index, hlinks) = build_index(&[root.clone()]).unwrap();
        let entry = index
            .entries
            .iter()
            .find(|e| e.name.ends_with(b"/one"))
            .unwrap();
        assert!(entry.nlink > 1);
        let first = hlinks.first_path(entry.dev, entry.ino).unwrap();
        assert!(first.ends_with(b"/one"));
    }

    #[test]
    fn multiple_roots_are_walked_in_order() {
        let tmp = tempfile::tempdir().unwrap();
        let a = tmp.path().join("a");
        let b = tmp.path().join("b");
        std::fs::create_dir_all(&a).unwrap();
        std::fs::create_dir_all(&b).unwrap();
        std::fs::write(a.join("f"), b"1").unwrap();
        std::fs::write(b.join("g"), b"2").unwrap();

        let (index, _) = build_index(&[b.clone(), a.clone()]).unwrap();
        let all = names(&index);
        let term_a = format!("{}/", a.canonicalize().unwrap().display());
        // roots are visited sorted regardless of argument order, and only
        // paths below them appear
        assert_eq!(all.iter().filter(|n| **n == term_a).count(), 1);
        assert!(!all.iter().any(|n| *n == "/"));
        let pos_a = all.iter().position(|n| *n == term_a).unwrap();
        let pos_g = all.iter().position(|n| n.ends_with("/g")).unwrap();
        assert!(pos_a < pos_g);
    }
}
