//! Tree construction during a walk: the stack of open directories, the flat
//! tree writer with its `.bupm` metadata fragment, and the hash-split
//! writer for very large directories.

use std::collections::HashMap;
use std::io::Cursor;

use crate::defaults::TREE_BLOBBITS;
use crate::hashsplit::{split_to_blob_or_tree, BlobDest, HashSplitter, RecordHashSplitter};
use crate::metadata::Metadata;
use crate::object::{mangle_name, shalist_item_sort_key, Oid, GIT_MODE_FILE, GIT_MODE_TREE};
use crate::repo::{RepoError, Repository};

/// One entry of an in-progress directory tree.
#[derive(Clone)]
pub struct TreeItem {
    pub name: Vec<u8>,
    pub mode: u32,
    pub gitmode: u32,
    pub oid: Oid,
    pub meta: Option<Metadata>,
    raw_name: bool,
}

impl TreeItem {
    pub fn new(name: Vec<u8>, mode: u32, gitmode: u32, oid: Oid, meta: Option<Metadata>) -> Self {
        Self {
            name,
            mode,
            gitmode,
            oid,
            meta,
            raw_name: false,
        }
    }

    /// An entry whose name is stored as-is, with no mangling: split-tree
    /// internals and sentinel markers.
    fn raw(name: Vec<u8>, mode: u32, gitmode: u32, oid: Oid) -> Self {
        Self {
            name,
            mode,
            gitmode,
            oid,
            meta: None,
            raw_name: true,
        }
    }

    fn mangled_name(&self) -> Vec<u8> {
        if self.raw_name {
            self.name.clone()
        } else {
            mangle_name(&self.name, self.mode, self.gitmode)
        }
    }
}

/// Writes one tree object; unless omitted, the encoded metadata fragment is
/// prepended as the `.bupm` entry. The first metadata record is the
/// directory's own, the rest follow the tree sort order of the non-subdir
/// entries.
async fn write_tree_obj(
    repo: &mut Repository,
    dir_meta: Option<&Metadata>,
    items: &[TreeItem],
    omit_meta: bool,
) -> Result<Oid, RepoError> {
    let mut shalist = Vec::with_capacity(items.len() + 1);
    if !omit_meta {
        let empty = Metadata::default();
        let mut metalist: Vec<(Vec<u8>, &Metadata)> =
            vec![(Vec::new(), dir_meta.unwrap_or(&empty))];
        for item in items.iter().filter(|item| item.mode != GIT_MODE_TREE) {
            metalist.push((
                shalist_item_sort_key(item.mode, &item.name),
                item.meta.as_ref().unwrap_or(&empty),
            ));
        }
        metalist.sort_by(|a, b| a.0.cmp(&b.0));

        let mut stream = Vec::new();
        for (_, meta) in &metalist {
            stream.extend_from_slice(&meta.encode()?);
        }
        let mut splitter = HashSplitter::new(vec![Cursor::new(stream)], false, None, None);
        let (mode, oid) = split_to_blob_or_tree(repo, BlobDest::Meta, &mut splitter).await?;
        shalist.push((mode, b".bupm".to_vec(), oid));
    }
    for item in items {
        shalist.push((item.gitmode, item.mangled_name(), item.oid));
    }
    repo.write_tree(&shalist).await
}

struct TrieNode {
    parent: usize,
    children: HashMap<u8, usize>,
}

/// Abbreviates the item names in place by backtracking a trie built over
/// the whole name set: a name keeps shrinking until its trie path hits a
/// branch point (or the name would become empty, `"."` or `".."`).
/// Returns the original names.
fn abbreviate_names(items: &mut [TreeItem]) -> Vec<Vec<u8>> {
    let originals: Vec<Vec<u8>> = items.iter().map(|item| item.name.clone()).collect();

    // node 0 is the root; it has no backpointer of its own
    let mut nodes = vec![TrieNode {
        parent: 0,
        children: HashMap::new(),
    }];
    for name in &originals {
        let mut at = 0;
        for &c in name {
            at = match nodes[at].children.get(&c) {
                Some(&next) => next,
                None => {
                    let next = nodes.len();
                    nodes.push(TrieNode {
                        parent: at,
                        children: HashMap::new(),
                    });
                    nodes[at].children.insert(c, next);
                    next
                }
            };
        }
    }

    for (item, name) in items.iter_mut().zip(&originals) {
        let mut at = 0;
        for &c in name {
            at = nodes[at].children[&c];
        }
        let mut keep = name.len();
        loop {
            // backtrack a level; a node with more than one child (its
            // backpointer counts too, except at the root) ends the walk
            at = nodes[at].parent;
            let width = nodes[at].children.len() + usize::from(at != 0);
            if width > 2 {
                break;
            }
            let candidate = &name[..keep - 1];
            if candidate.is_empty()
                || candidate == b".".as_slice()
                || candidate == b"..".as_slice()
            {
                break;
            }
            keep -= 1;
        }
        item.name = name[..keep].to_vec();
    }
    originals
}

/// Writes a large directory as a multi-level split tree: entry names are
/// fed through a record hash splitter, flushed subtrees become the next
/// level's entries, and a `<level>.bupd` sentinel marks where a level
/// collapsed into a single tree.
async fn write_split_tree(
    repo: &mut Repository,
    dir_meta: Option<&Metadata>,
    items: Vec<TreeItem>,
) -> Result<Oid, RepoError> {
    if items.is_empty() {
        return write_tree_obj(repo, dir_meta, &[], false).await;
    }
    let mut items = items;
    let mut level: u32 = 0;
    loop {
        let mut newtree: Vec<TreeItem> = Vec::new();
        let mut subtree: Vec<TreeItem> = Vec::new();
        let mut splitter = RecordHashSplitter::new(TREE_BLOBBITS);
        // names are abbreviated per level, but the splitter sees the full
        // names so it has enough input to split on
        let names: Vec<Vec<u8>> = if level > 0 {
            abbreviate_names(&mut items)
        } else {
            items.iter().map(|item| item.name.clone()).collect()
        };
        let count = items.len();
        for (idx, item) in items.into_iter().enumerate() {
            subtree.push(item);
            let (split, _) = splitter.feed(&names[idx]);
            // single-entry subtrees are only allowed at the very end;
            // otherwise a name containing a split point would recurse forever
            if (subtree.len() > 1 && split) || idx == count - 1 {
                let all_in_one = newtree.is_empty() && idx == count - 1;
                if all_in_one && level > 0 {
                    let sentinel = repo.write_data(b"").await?;
                    subtree.push(TreeItem::raw(
                        format!("{level}.bupd").into_bytes(),
                        GIT_MODE_FILE,
                        GIT_MODE_FILE,
                        sentinel,
                    ));
                }
                let meta = if all_in_one { dir_meta } else { None };
                let omit_meta = level > 0 && !all_in_one;
                let tree = write_tree_obj(repo, meta, &subtree, omit_meta).await?;
                if all_in_one {
                    return Ok(tree);
                }
                newtree.push(TreeItem::raw(
                    subtree[0].name.clone(),
                    GIT_MODE_TREE,
                    GIT_MODE_TREE,
                    tree,
                ));
                subtree.clear();
            }
        }
        items = newtree;
        level += 1;
    }
}

struct Frame {
    name: Vec<u8>,
    meta: Option<Metadata>,
    items: Vec<TreeItem>,
}

impl Frame {
    async fn write(
        mut self,
        repo: &mut Repository,
        parent_path: Vec<u8>,
        use_treesplit: bool,
        errors: &mut Vec<String>,
    ) -> Result<Oid, RepoError> {
        // duplicate names are dropped, first occurrence wins
        let mut seen: std::collections::HashSet<Vec<u8>> = std::collections::HashSet::new();
        let mut items = Vec::with_capacity(self.items.len());
        for item in std::mem::take(&mut self.items) {
            if seen.insert(item.name.clone()) {
                items.push(item);
            } else {
                let message = format!(
                    "ignoring duplicate path '{}' in '{}'",
                    String::from_utf8_lossy(&item.name),
                    String::from_utf8_lossy(&parent_path),
                );
                log::warn!("{message}");
                errors.push(message);
            }
        }
        items.sort_by(|a, b| a.name.cmp(&b.name));

        if use_treesplit {
            write_split_tree(repo, self.meta.as_ref(), items).await
        } else {
            write_tree_obj(repo, self.meta.as_ref(), &items, false).await
        }
    }
}

/// The path from the archive root to the currently open directory. The
/// bottom frame is a sentinel; the top of the stack is the tail.
pub struct Stack {
    frames: Vec<Frame>,
}

impl Stack {
    pub fn new() -> Self {
        Self {
            frames: vec![Frame {
                name: Vec::new(),
                meta: None,
                items: Vec::new(),
            }],
        }
    }

    /// Number of open directories, the sentinel excluded.
    pub fn len(&self) -> usize {
        self.frames.len() - 1
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Names of the open directories, root first.
    pub fn namestack(&self) -> Vec<Vec<u8>> {
        self.frames[1..].iter().map(|f| f.name.clone()).collect()
    }

    fn path(&self) -> Vec<u8> {
        let mut out = Vec::new();
        for frame in &self.frames[1..] {
            out.extend_from_slice(&frame.name);
            out.push(b'/');
        }
        out
    }

    pub fn push(&mut self, name: Vec<u8>, meta: Option<Metadata>) {
        self.frames.push(Frame {
            name,
            meta,
            items: Vec::new(),
        });
    }

    /// Appends an entry to the currently open directory.
    pub fn append(&mut self, item: TreeItem) {
        self.frames
            .last_mut()
            .expect("sentinel frame always present")
            .items
            .push(item);
    }

    /// Closes the top directory: writes its tree (or passes through an
    /// existing one), appends it to the parent frame, and returns the tree
    /// OID.
    pub async fn pop(
        &mut self,
        repo: &mut Repository,
        override_tree: Option<Oid>,
        override_meta: Option<Metadata>,
        use_treesplit: bool,
        errors: &mut Vec<String>,
    ) -> Result<Oid, RepoError> {
        assert!(self.frames.len() >= 2, "bug: pop on an empty stack");
        let parent_path = self.path();
        let mut frame = self.frames.pop().expect("stack checked non-empty");
        if override_meta.is_some() {
            frame.meta = override_meta;
        }
        let name = frame.name.clone();
        let tree = match override_tree {
            Some(tree) => tree,
            None => frame.write(repo, parent_path, use_treesplit, errors).await?,
        };
        self.append(TreeItem::new(name, GIT_MODE_TREE, GIT_MODE_TREE, tree, None));
        Ok(tree)
    }
}

impl Default for Stack {
    fn default() -> Self {
        Self::new()
    }
}
