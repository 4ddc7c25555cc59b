//! Object model: content addressing, tree and commit encodings, name
//! mangling and the tree sort order.

use sha1::{Digest, Sha1};

/// The type for an object id, the SHA-1 of `"<kind> <len>\0<payload>"`.
pub type Oid = [u8; 20];

/// Tree entry mode of a regular file.
pub const GIT_MODE_FILE: u32 = 0o100644;
/// Tree entry mode of a subtree.
pub const GIT_MODE_TREE: u32 = 0o40000;
/// Tree entry mode of a symlink.
pub const GIT_MODE_SYMLINK: u32 = 0o120000;

/// Kind of a stored object; the discriminant is the type byte stored in the
/// pack record.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum ObjType {
    Commit = 1,
    Tree = 2,
    Blob = 3,
}

impl ObjType {
    pub fn name(self) -> &'static str {
        match self {
            ObjType::Commit => "commit",
            ObjType::Tree => "tree",
            ObjType::Blob => "blob",
        }
    }

    pub fn from_byte(b: u8) -> Option<Self> {
        match b {
            1 => Some(ObjType::Commit),
            2 => Some(ObjType::Tree),
            3 => Some(ObjType::Blob),
            _ => None,
        }
    }
}

/// Computes the content address of an object.
pub fn calc_hash(kind: ObjType, payload: &[u8]) -> Oid {
    let mut hasher = Sha1::new();
    hasher.update(kind.name().as_bytes());
    hasher.update(b" ");
    hasher.update(payload.len().to_string().as_bytes());
    hasher.update([0u8]);
    hasher.update(payload);
    hasher.finalize().into()
}

/// Sort key for tree entries: subtrees compare as if their name had a
/// trailing slash.
pub fn shalist_item_sort_key(mode: u32, name: &[u8]) -> Vec<u8> {
    let mut key = name.to_vec();
    if mode & 0o170000 == 0o040000 {
        key.push(b'/');
    }
    key
}

/// Mangles a tree entry name so that a chunked file (stored with tree mode)
/// can be told apart from a real subdirectory on read.
pub fn mangle_name(name: &[u8], mode: u32, gitmode: u32) -> Vec<u8> {
    let is_reg = mode & 0o170000 == 0o100000;
    if is_reg && mode != gitmode {
        let mut out = name.to_vec();
        out.extend_from_slice(b".bup");
        out
    } else if name.ends_with(b".bup") || (!name.is_empty() && name[..name.len() - 1].ends_with(b".bup"))
    {
        let mut out = name.to_vec();
        out.extend_from_slice(b".bupl");
        out
    } else {
        name.to_vec()
    }
}

/// Encodes a tree object from `(mode, name, oid)` triples; entries are
/// sorted by `shalist_item_sort_key`.
pub fn tree_encode(shalist: &[(u32, Vec<u8>, Oid)]) -> Vec<u8> {
    let mut sorted: Vec<&(u32, Vec<u8>, Oid)> = shalist.iter().collect();
    sorted.sort_by_key(|(mode, name, _)| shalist_item_sort_key(*mode, name));

    let mut out = Vec::new();
    for (mode, name, oid) in sorted {
        out.extend_from_slice(format!("{mode:o}").as_bytes());
        out.push(b' ');
        out.extend_from_slice(name);
        out.push(0);
        out.extend_from_slice(oid);
    }
    out
}

/// Decodes a tree object back into `(mode, name, oid)` triples.
pub fn tree_decode(data: &[u8]) -> Option<Vec<(u32, Vec<u8>, Oid)>> {
    let mut out = Vec::new();
    let mut rest = data;
    while !rest.is_empty() {
        let sp = rest.iter().position(|&b| b == b' ')?;
        let mode = u32::from_str_radix(std::str::from_utf8(&rest[..sp]).ok()?, 8).ok()?;
        rest = &rest[sp + 1..];
        let nul = rest.iter().position(|&b| b == 0)?;
        let name = rest[..nul].to_vec();
        rest = &rest[nul + 1..];
        if rest.len() < 20 {
            return None;
        }
        let mut oid = [0u8; 20];
        oid.copy_from_slice(&rest[..20]);
        rest = &rest[20..];
        out.push((mode, name, oid));
    }
    Some(out)
}

fn timezone_str(offset_sec: i32) -> String {
    let sign = if offset_sec < 0 { '-' } else { '+' };
    let offset = offset_sec.abs() / 60;
    format!("{}{:02}{:02}", sign, offset / 60, offset % 60)
}

/// Encodes a commit object.
#[allow(clippy::too_many_arguments)]
pub fn create_commit(
    tree: &Oid,
    parent: Option<&Oid>,
    author: &[u8],
    author_sec: i64,
    author_offset: i32,
    committer: &[u8],
    committer_sec: i64,
    committer_offset: i32,
    message: &[u8],
) -> Vec<u8> {
    let mut out = Vec::new();
    out.extend_from_slice(b"tree ");
    out.extend_from_slice(hex::encode(tree).as_bytes());
    out.push(b'\n');
    if let Some(parent) = parent {
        out.extend_from_slice(b"parent ");
        out.extend_from_slice(hex::encode(parent).as_bytes());
        out.push(b'\n');
    }
    out.extend_from_slice(b"author ");
    out.extend_from_slice(author);
    out.extend_from_slice(format!(" {} {}", author_sec, timezone_str(author_offset)).as_bytes());
    out.push(b'\n');
    out.extend_from_slice(b"committer ");
    out.extend_from_slice(committer);
    out.extend_from_slice(
        format!(" {} {}", committer_sec, timezone_str(committer_offset)).as_bytes(),
    );
    out.push(b'\n');
    out.push(b'\n');
    out.extend_from_slice(message);
    out
}

/// A parsed commit object.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CommitInfo {
    pub tree: Oid,
    pub parents: Vec<Oid>,
    pub author: Vec<u8>,
    pub author_sec: i64,
    pub author_offset: i32,
    pub committer: Vec<u8>,
    pub committer_sec: i64,
    pub committer_offset: i32,
    pub message: Vec<u8>,
}

fn parse_ident(line: &[u8]) -> Option<(Vec<u8>, i64, i32)> {
    // "<name> <<mail>> <sec> <tzoff>"; the identity runs up to the closing '>'
    let close = line.iter().rposition(|&b| b == b'>')?;
    let ident = line[..=close].to_vec();
    let rest = std::str::from_utf8(line.get(close + 2..)?).ok()?;
    let mut parts = rest.split(' ');
    let sec: i64 = parts.next()?.parse().ok()?;
    let tz = parts.next()?;
    let (sign, digits) = tz.split_at(1);
    let raw: i32 = digits.parse().ok()?;
    let mut offset = (raw / 100) * 3600 + (raw % 100) * 60;
    if sign == "-" {
        offset = -offset;
    }
    Some((ident, sec, offset))
}

/// Parses a commit object produced by `create_commit`.
pub fn parse_commit(data: &[u8]) -> Option<CommitInfo> {
    let mut tree = None;
    let mut parents = Vec::new();
    let mut author = None;
    let mut committer = None;

    let mut rest = data;
    loop {
        let eol = rest.iter().position(|&b| b == b'\n')?;
        let line = &rest[..eol];
        rest = &rest[eol + 1..];
        if line.is_empty() {
            break;
        }
        if let Some(v) = line.strip_prefix(b"tree ") {
            let mut oid = [0u8; 20];
            hex::decode_to_slice(v, &mut oid).ok()?;
            tree = Some(oid);
        } else if let Some(v) = line.strip_prefix(b"parent ") {
            let mut oid = [0u8; 20];
            hex::decode_to_slice(v, &mut oid).ok()?;
            parents.push(oid);
        } else if let Some(v) = line.strip_prefix(b"author ") {
            author = parse_ident(v);
        } else if let Some(v) = line.strip_prefix(b"committer ") {
            committer = parse_ident(v);
        }
    }

    let (author, author_sec, author_offset) = author?;
    let (committer, committer_sec, committer_offset) = committer?;
    Some(CommitInfo {
        tree: tree?,
        parents,
        author,
        author_sec,
        author_offset,
        committer,
        committer_sec,
        committer_offset,
        message: rest.to_vec(),
    })
}
