//! The stream split driver: feeds arbitrary inputs through the splitter
//! into the repository, producing a tree and optionally a commit on a
//! branch.

use std::io::Read;

use crate::hashsplit::{
    split_to_blob_or_tree, split_to_shalist, BlobDest, HashSplitter,
};
use crate::object::{mangle_name, Oid, GIT_MODE_FILE};
use crate::repo::Repository;
use crate::save::{default_userline, now_secs};

/// Options for a split run.
#[derive(Default)]
pub struct SplitOptions {
    /// Branch to update (`refs/heads/<name>`).
    pub name: Option<String>,
    /// Write a commit even without a branch name.
    pub commit: bool,
    /// Force a chunk boundary at every input boundary.
    pub keep_boundaries: bool,
    /// Splitter bits override.
    pub blobbits: Option<u32>,
    /// Chunk tree fanout override.
    pub fanout: Option<u32>,
    /// Commit timestamp override (seconds since the epoch).
    pub date: Option<i64>,
    /// Commit timezone offset in seconds.
    pub tz_offset: Option<i32>,
    /// Author/committer identity, `name <mail>`.
    pub author: Option<String>,
    /// Commit message override.
    pub message: Option<String>,
}

/// Result of a split run.
pub struct SplitOutcome {
    pub tree: Oid,
    pub commit: Option<Oid>,
}

/// Splits the concatenation of `sources` into the repository.
pub async fn split<R: Read>(
    repo: &mut Repository,
    sources: Vec<R>,
    opts: &SplitOptions,
) -> anyhow::Result<SplitOutcome> {
    match split_inner(repo, sources, opts).await {
        Ok(outcome) => Ok(outcome),
        Err(e) => {
            repo.abort_writing().await;
            Err(e)
        }
    }
}

async fn split_inner<R: Read>(
    repo: &mut Repository,
    sources: Vec<R>,
    opts: &SplitOptions,
) -> anyhow::Result<SplitOutcome> {
    let refname = opts.name.as_ref().map(|n| format!("refs/heads/{n}"));
    let oldref = match &refname {
        Some(name) => repo.read_ref(name).await?,
        None => None,
    };

    let blobbits = opts.blobbits.or(repo.blobbits());
    let mut splitter = HashSplitter::new(sources, opts.keep_boundaries, blobbits, opts.fanout);

    let shalist = if opts.name.is_some() {
        // a single mangled entry gives restores a stable target name
        let (mode, oid) = split_to_blob_or_tree(repo, BlobDest::Data, &mut splitter).await?;
        vec![(mode, mangle_name(b"data", GIT_MODE_FILE, mode), oid)]
    } else {
        split_to_shalist(repo, BlobDest::Data, &mut splitter).await?
    };
    let tree = repo.write_tree(&shalist).await?;

    let commit = if refname.is_some() || opts.commit {
        let date = opts.date.unwrap_or_else(now_secs);
        let tz = opts.tz_offset.unwrap_or(0);
        let userline = opts.author.clone().unwrap_or_else(default_userline);
        let message = opts
            .message
            .clone()
            .unwrap_or_else(|| "coffer split\n".to_string());
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

    Ok(SplitOutcome { tree, commit })
}
