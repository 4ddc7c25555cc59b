//! The save driver: walks the file index, aligns the directory stack,
//! splits changed files into the repository and assembles a commit on the
//! target branch. Per-file failures are recorded and skipped; everything
//! else aborts the tentative packs.

use std::io;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use anyhow::bail;

use crate::hashsplit::{split_to_blob_or_tree, BlobDest, HashSplitter, SplitError};
use crate::index::{HLinkDb, Index};
use crate::metadata::Metadata;
use crate::object::{Oid, GIT_MODE_FILE, GIT_MODE_SYMLINK, GIT_MODE_TREE};
use crate::repo::Repository;
use crate::tree::{Stack, TreeItem};

/// One component of the archive path: the name under the archive root and
/// the filesystem path it came from, if any.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PathComponent {
    pub name: Vec<u8>,
    pub fs_path: Option<Vec<u8>>,
}

/// Lexically normalizes an absolute byte path: collapses slashes and
/// resolves `.` and `..`.
pub fn normalize_path(path: &[u8]) -> Vec<u8> {
    let mut parts: Vec<&[u8]> = Vec::new();
    for part in path.split(|&b| b == b'/') {
        match part {
            b"" | b"." => {}
            b".." => {
                parts.pop();
            }
            other => parts.push(other),
        }
    }
    if parts.is_empty() {
        return b"/".to_vec();
    }
    let mut out = Vec::new();
    for part in parts {
        out.push(b'/');
        out.extend_from_slice(part);
    }
    out
}

/// `/foo/bar` → `[("", /), ("foo", /foo), ("bar", /foo/bar)]`.
pub fn path_components(dir: &[u8]) -> Vec<PathComponent> {
    let dir = normalize_path(dir);
    let mut out = vec![PathComponent {
        name: Vec::new(),
        fs_path: Some(b"/".to_vec()),
    }];
    let mut acc: Vec<u8> = Vec::new();
    for part in dir.split(|&b| b == b'/').filter(|p| !p.is_empty()) {
        acc.push(b'/');
        acc.extend_from_slice(part);
        out.push(PathComponent {
            name: part.to_vec(),
            fs_path: Some(acc.clone()),
        });
    }
    out
}

/// Like `path_components`, but the longest matching strip prefix becomes
/// the archive root.
pub fn stripped_path_components(dir: &[u8], strip_prefixes: &[Vec<u8>]) -> Vec<PathComponent> {
    let dir = normalize_path(dir);
    let mut prefixes: Vec<Vec<u8>> = strip_prefixes.iter().map(|p| normalize_path(p)).collect();
    prefixes.sort_by_key(|p| std::cmp::Reverse(p.len()));
    for prefix in &prefixes {
        if dir.starts_with(prefix) {
            let mut out = vec![PathComponent {
                name: Vec::new(),
                fs_path: Some(prefix.clone()),
            }];
            let mut acc = prefix.clone();
            for part in dir[prefix.len()..].split(|&b| b == b'/').filter(|p| !p.is_empty()) {
                acc.push(b'/');
                acc.extend_from_slice(part);
                out.push(PathComponent {
                    name: part.to_vec(),
                    fs_path: Some(acc.clone()),
                });
            }
            return out;
        }
    }
    path_components(&dir)
}

/// Applies the first matching `old=new` graft point. Components introduced
/// by the new prefix have no filesystem counterpart, except the last one,
/// which maps back to the grafted-away directory.
pub fn grafted_path_components(
    grafts: &[(Vec<u8>, Vec<u8>)],
    dir: &[u8],
) -> Vec<PathComponent> {
    let dir = normalize_path(dir);
    for (old, new) in grafts {
        let old = normalize_path(old);
        let new = normalize_path(new);
        let matches = dir == old
            || old == b"/"
            || (dir.starts_with(&old) && dir.get(old.len()) == Some(&b'/'));
        if !matches {
            continue;
        }
        let mut out = vec![PathComponent {
            name: Vec::new(),
            fs_path: Some(b"/".to_vec()),
        }];
        let new_parts: Vec<&[u8]> = new.split(|&b| b == b'/').filter(|p| !p.is_empty()).collect();
        if new_parts.is_empty() {
            out[0].fs_path = Some(old.clone());
        }
        for (i, part) in new_parts.iter().enumerate() {
            let fs_path = (i == new_parts.len() - 1).then(|| old.clone());
            out.push(PathComponent {
                name: part.to_vec(),
                fs_path,
            });
        }
        let mut acc = old.clone();
        for part in dir[old.len()..].split(|&b| b == b'/').filter(|p| !p.is_empty()) {
            acc.push(b'/');
            acc.extend_from_slice(part);
            out.push(PathComponent {
                name: part.to_vec(),
                fs_path: Some(acc.clone()),
            });
        }
        return out;
    }
    path_components(&dir)
}

/// Splits an index entry name into its directory and file parts; directory
/// terminators have an empty file part.
fn split_entry_name(name: &[u8]) -> (&[u8], &[u8]) {
    let trimmed = if name.len() > 1 && name.ends_with(b"/") {
        &name[..name.len() - 1]
    } else {
        name
    };
    if name.ends_with(b"/") {
        return (trimmed, b"");
    }
    match trimmed.iter().rposition(|&b| b == b'/') {
        Some(0) => (b"/", &trimmed[1..]),
        Some(pos) => (&trimmed[..pos], &trimmed[pos + 1..]),
        None => (b"/", trimmed),
    }
}

/// Opens a file for reading without updating its access time, falling back
/// to a plain open where that is not permitted.
pub fn open_noatime(path: &Path) -> io::Result<std::fs::File> {
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        match std::fs::OpenOptions::new()
            .read(true)
            .custom_flags(libc::O_NOATIME)
            .open(path)
        {
            Ok(file) => return Ok(file),
            Err(e) if e.raw_os_error() == Some(libc::EPERM) => {}
            Err(e) => return Err(e),
        }
    }
    std::fs::File::open(path)
}

pub(crate) fn now_secs() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

pub(crate) fn default_userline() -> String {
    let user = std::env::var("USER")
        .or_else(|_| std::env::var("LOGNAME"))
        .unwrap_or_else(|_| "unknown".to_string());
    let host = std::env::var("HOSTNAME").unwrap_or_else(|_| "localhost".to_string());
    format!("{user} <{user}@{host}>")
}

/// Options for a save run.
#[derive(Default)]
pub struct SaveOptions {
    /// Branch to update (`refs/heads/<name>`).
    pub name: Option<String>,
    /// Write a commit even without a branch name.
    pub commit: bool,
    /// Strip the source paths from archive paths.
    pub strip: bool,
    /// Strip this one prefix from archive paths.
    pub strip_path: Option<Vec<u8>>,
    /// `old=new` graft points.
    pub grafts: Vec<(Vec<u8>, Vec<u8>)>,
    /// Only back up files smaller than this many bytes.
    pub smaller: Option<u64>,
    /// Commit timestamp override (seconds since the epoch).
    pub date: Option<i64>,
    /// Commit timezone offset in seconds.
    pub tz_offset: Option<i32>,
    /// Author/committer identity, `name <mail>`.
    pub author: Option<String>,
    /// Commit message override.
    pub message: Option<String>,
}

/// Result of a save run.
pub struct SaveOutcome {
    pub tree: Oid,
    pub commit: Option<Oid>,
    /// Recorded per-file errors; the affected entries were skipped.
    pub errors: Vec<String>,
}

fn already_saved(repo: &Repository, valid: bool, sha: &Oid) -> bool {
    valid && repo.exists(sha)
}

/// Marks for skipping every entry below a directory whose tree is already
/// present in the repository; the terminator itself stays and passes the
/// stored tree through.
fn mark_saved_subtrees(repo: &Repository, index: &Index) -> Vec<bool> {
    let mut skip = vec![false; index.entries.len()];
    for (i, entry) in index.entries.iter().enumerate() {
        if entry.is_dir() && already_saved(repo, entry.is_valid(), &entry.sha) {
            let mut j = i;
            while j > 0 && index.entries[j - 1].name.starts_with(&entry.name) {
                j -= 1;
                skip[j] = true;
            }
        }
    }
    skip
}

/// Saves the indexed trees into the repository as one commit.
pub async fn save(
    repo: &mut Repository,
    index: &mut Index,
    hlinks: &HLinkDb,
    sources: &[PathBuf],
    opts: &SaveOptions,
) -> anyhow::Result<SaveOutcome> {
    match save_inner(repo, index, hlinks, sources, opts).await {
        Ok(outcome) => Ok(outcome),
        Err(e) => {
            repo.abort_writing().await;
            Err(e)
        }
    }
}

async fn save_inner(
    repo: &mut Repository,
    index: &mut Index,
    hlinks: &HLinkDb,
    sources: &[PathBuf],
    opts: &SaveOptions,
) -> anyhow::Result<SaveOutcome> {
    use std::os::unix::ffi::OsStrExt;

    if index.is_empty() {
        bail!("nothing to save");
    }

    let refname = opts.name.as_ref().map(|n| format!("refs/heads/{n}"));
    let oldref = match &refname {
        Some(name) => repo.read_ref(name).await?,
        None => None,
    };
    let use_treesplit = repo.treesplit();
    let blobbits = repo.blobbits();
    let strip_roots: Vec<Vec<u8>> = sources
        .iter()
        .map(|p| p.as_os_str().as_bytes().to_vec())
        .collect();

    let mut errors: Vec<String> = Vec::new();
    let mut stack = Stack::new();
    let mut first_root: Option<PathComponent> = None;
    let mut root_collision = false;
    let mut lastskip_name: Option<Vec<u8>> = None;

    let skip = mark_saved_subtrees(repo, index);

    for i in 0..index.entries.len() {
        if skip[i] {
            continue;
        }
        let ent_name = index.entries[i].name.clone();
        let (dir, file) = split_entry_name(&ent_name);
        let (file, dir) = (file.to_vec(), dir.to_vec());
        let hashvalid = {
            let entry = &index.entries[i];
            already_saved(repo, entry.is_valid(), &entry.sha)
        };

        if !index.entries[i].exists {
            continue;
        }
        if let Some(smaller) = opts.smaller {
            if !index.entries[i].is_dir() && index.entries[i].size >= smaller {
                if !hashvalid {
                    log::info!(
                        "skipping large file '{}'",
                        String::from_utf8_lossy(&ent_name)
                    );
                    lastskip_name = Some(ent_name.clone());
                }
                continue;
            }
        }

        let dirp = if opts.strip {
            stripped_path_components(&dir, &strip_roots)
        } else if let Some(strip_path) = &opts.strip_path {
            stripped_path_components(&dir, std::slice::from_ref(strip_path))
        } else if !opts.grafts.is_empty() {
            grafted_path_components(&opts.grafts, &dir)
        } else {
            path_components(&dir)
        };

        // strip/graft can map several source parents onto one archive root
        match &first_root {
            None => first_root = Some(dirp[0].clone()),
            Some(root) if *root != dirp[0] => root_collision = true,
            Some(_) => {}
        }

        // close finished subtrees
        let dirp_names: Vec<Vec<u8>> = dirp.iter().map(|c| c.name.clone()).collect();
        while stack.namestack() > dirp_names {
            stack.pop(repo, None, None, use_treesplit, &mut errors).await?;
        }

        // open new ones, capturing their filesystem metadata
        for component in dirp.iter().skip(stack.len()) {
            let meta = match &component.fs_path {
                Some(fs_path) => {
                    let path = Path::new(std::ffi::OsStr::from_bytes(fs_path));
                    match Metadata::from_path(path, None) {
                        Ok(meta) => Some(meta),
                        Err(e) => {
                            errors.push(format!("{}: {e}", String::from_utf8_lossy(fs_path)));
                            lastskip_name = Some(fs_path.clone());
                            None
                        }
                    }
                }
                None => None,
            };
            stack.push(component.name.clone(), meta);
        }

        if file.is_empty() {
            if stack.len() == 1 {
                continue; // the top-level root stays open
            }
            let oldtree = if hashvalid {
                Some(index.entries[i].sha)
            } else {
                None
            };
            let newtree = stack
                .pop(repo, oldtree, None, use_treesplit, &mut errors)
                .await?;
            if oldtree.is_none() {
                let had_skip_below = lastskip_name
                    .as_ref()
                    .is_some_and(|skipped| skipped.starts_with(ent_name.as_slice()));
                if had_skip_below {
                    // a skipped child means this tree is incomplete; retry
                    // it on the next run
                    index.entries[i].invalidate();
                } else {
                    index.entries[i].validate(GIT_MODE_TREE, newtree);
                }
            }
            continue;
        }

        if hashvalid {
            let entry = &index.entries[i];
            let mut meta = index.metadata_at(entry.meta_ofs).unwrap_or_default();
            meta.hardlink_target = (entry.nlink > 1)
                .then(|| hlinks.first_path(entry.dev, entry.ino))
                .flatten()
                .map(<[u8]>::to_vec);
            meta.atime = entry.atime;
            meta.mtime = entry.mtime;
            meta.ctime = entry.ctime;
            let item = TreeItem::new(file, entry.mode, entry.gitmode, entry.sha, Some(meta));
            stack.append(item);
            continue;
        }

        let fs_path = index.entries[i].fs_path();
        let kind = index.entries[i].mode & 0o170000;
        let mut saved: Option<(u32, Oid)> = None;
        if kind == 0o100000 {
            match open_noatime(&fs_path) {
                Ok(input) => {
                    let mut splitter = HashSplitter::new(vec![input], false, blobbits, None);
                    match split_to_blob_or_tree(repo, BlobDest::Data, &mut splitter).await {
                        Ok((gitmode, oid)) => saved = Some((gitmode, oid)),
                        Err(SplitError::Source(e)) => {
                            errors.push(format!("{}: {e}", fs_path.display()));
                            lastskip_name = Some(ent_name.clone());
                        }
                        Err(SplitError::Repo(e)) => return Err(e.into()),
                    }
                }
                Err(e) => {
                    errors.push(format!("{}: {e}", fs_path.display()));
                    lastskip_name = Some(ent_name.clone());
                }
            }
        } else if kind == 0o120000 {
            match std::fs::read_link(&fs_path) {
                Ok(target) => {
                    let target = target.as_os_str().as_bytes().to_vec();
                    let oid = repo.write_symlink(&target).await?;
                    saved = Some((GIT_MODE_SYMLINK, oid));
                }
                Err(e) => {
                    errors.push(format!("{}: {e}", fs_path.display()));
                    lastskip_name = Some(ent_name.clone());
                }
            }
        } else {
            // devices, fifos, sockets: fully described by their metadata
            // record, so a shared empty blob keeps the paths aligned
            let oid = repo.write_data(b"").await?;
            saved = Some((GIT_MODE_FILE, oid));
        }

        if let Some((gitmode, oid)) = saved {
            index.entries[i].validate(gitmode, oid);
            let hlink = (index.entries[i].nlink > 1)
                .then(|| hlinks.first_path(index.entries[i].dev, index.entries[i].ino))
                .flatten()
                .map(<[u8]>::to_vec);
            let meta = match Metadata::from_path(&fs_path, hlink) {
                Ok(meta) => meta,
                Err(e) => {
                    errors.push(format!("{}: {e}", fs_path.display()));
                    lastskip_name = Some(ent_name.clone());
                    Metadata::default()
                }
            };
            let meta_ofs = index.store_meta(meta.clone());
            index.entries[i].meta_ofs = meta_ofs;
            let mode = index.entries[i].mode;
            stack.append(TreeItem::new(file, mode, gitmode, oid, Some(meta)));
        }
    }

    // close everything above the archive root
    while stack.len() >= 2 {
        stack.pop(repo, None, None, use_treesplit, &mut errors).await?;
    }
    if stack.is_empty() {
        bail!("nothing to save");
    }
    // a root collision means no single directory's metadata fits the root
    let root_meta = root_collision.then(Metadata::default);
    let tree = stack
        .pop(repo, None, root_meta, use_treesplit, &mut errors)
        .await?;

    let commit = if refname.is_some() || opts.commit {
        let date = opts.date.unwrap_or_else(now_secs);
        let tz = opts.tz_offset.unwrap_or(0);
        let userline = opts.author.clone().unwrap_or_else(default_userline);
        let message = opts
            .message
            .clone()
            .unwrap_or_else(|| "coffer save\n".to_string());
        Some(
            repo.write_commit(
                &tree,
                oldref.as_ref(),
                userline.as_bytes(),
                date,
                tz,
                userline.as_bytes(),
                date,
                tz,
                message.as_bytes(),
            )
            .await?,
        )
    } else {
        None
    };

    match (&refname, commit) {
        (Some(name), Some(commit)) => repo.update_ref(name, commit, oldref).await?,
        _ => repo.finish_writing().await?,
    }

    if !errors.is_empty() {
        log::warn!("{} errors encountered while saving", errors.len());
    }
    Ok(SaveOutcome {
        tree,
        commit,
        errors,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn comp(name: &str, fs: Option<&str>) -> PathComponent {
        PathComponent {
            name: name.as_bytes().to_vec(),
            fs_path: fs.map(|p| p.as_bytes().to_vec()),
        }
    }

    #[test]
    fn normalization() {
        assert_eq!(normalize_path(b"/"), b"/");
        assert_eq!(normalize_path(b"//foo//bar/"), b"/foo/bar");
        assert_eq!(normalize_path(b"/foo/./bar/.."), b"/foo");
        assert_eq!(normalize_path(b"/.."), b"/");
    }

    #[test]
    fn plain_components() {
        assert_eq!(path_components(b"/"), vec![comp("", Some("/"))]);
        assert_eq!(
            path_components(b"/foo/bar"),
            vec![
                comp("", Some("/")),
                comp("foo", Some("/foo")),
                comp("bar", Some("/foo/bar")),
            ]
        );
    }

    #[test]
    fn stripping_makes_the_prefix_the_root() {
        let roots = vec![b"/data/src".to_vec()];
        assert_eq!(
            stripped_path_components(b"/data/src/a/b", &roots),
            vec![
                comp("", Some("/data/src")),
                comp("a", Some("/data/src/a")),
                comp("b", Some("/data/src/a/b")),
            ]
        );
        // the longest prefix wins
        let roots = vec![b"/data".to_vec(), b"/data/src".to_vec()];
        assert_eq!(
            stripped_path_components(b"/data/src/a", &roots)[0],
            comp("", Some("/data/src"))
        );
        // non-matching paths fall back to plain components
        assert_eq!(
            stripped_path_components(b"/other", &[b"/data".to_vec()]),
            path_components(b"/other")
        );
    }

    #[test]
    fn grafting_rewrites_the_prefix() {
        let grafts = vec![(b"/data/src".to_vec(), b"/archive/code".to_vec())];
        assert_eq!(
            grafted_path_components(&grafts, b"/data/src/a"),
            vec![
                comp("", Some("/")),
                comp("archive", None),
                comp("code", Some("/data/src")),
                comp("a", Some("/data/src/a")),
            ]
        );
        // a graft must match whole components
        assert_eq!(
            grafted_path_components(&grafts, b"/data/srcx"),
            path_components(b"/data/srcx")
        );
    }

    #[test]
    fn entry_name_splitting() {
        assert_eq!(split_entry_name(b"/a/b/c"), (&b"/a/b"[..], &b"c"[..]));
        assert_eq!(split_entry_name(b"/a/b/"), (&b"/a/b"[..], &b""[..]));
        assert_eq!(split_entry_name(b"/f"), (&b"/"[..], &b"f"[..]));
        assert_eq!(split_entry_name(b"/"), (&b"/"[..], &b""[..]));
    }
}
