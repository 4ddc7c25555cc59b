//! End-to-end scenarios: whole saves through the encrypted repository and
//! back out again.

use std::future::Future;
use std::io::Cursor;
use std::path::{Path, PathBuf};
use std::pin::Pin;

use rand::{rngs::StdRng, RngCore, SeedableRng};
use tempfile::TempDir;

use coffer::index::build_index;
use coffer::keys::generate_keys;
use coffer::metadata::Metadata;
use coffer::object::{parse_commit, tree_decode, ObjType, Oid, GIT_MODE_TREE};
use coffer::repo::idx::PackIdx;
use coffer::repo::{open_repository, RepoError, Repository};
use coffer::save::{save, SaveOptions};
use coffer::split::{split, SplitOptions};

struct TestEnv {
    _dir: TempDir,
    url: String,
    storage: PathBuf,
    cache: PathBuf,
}

fn new_env(extra: &str) -> TestEnv {
    let dir = tempfile::tempdir().unwrap();
    let keys = generate_keys().unwrap();
    let storage = dir.path().join("store");
    let cache = dir.path().join("cache");
    let conf = dir.path().join("repo.conf");
    std::fs::write(
        &conf,
        format!(
            "[bup]\n\
             \ttype = Encrypted\n\
             \tstorage = file\n\
             \tpath = {}\n\
             \tcachedir = {}\n\
             \trepokey = {}\n\
             \treadkey = {}\n\
             {extra}",
            storage.display(),
            cache.display(),
            keys.repokey,
            keys.readkey,
        ),
    )
    .unwrap();
    TestEnv {
        url: format!("config://{}", conf.display()),
        _dir: dir,
        storage,
        cache,
    }
}

async fn open(env: &TestEnv) -> Repository {
    open_repository(&env.url, true).await.unwrap()
}

/// Saves `source` with `--strip` onto a branch, so the archive root is the
/// source directory itself.
async fn save_stripped(repo: &mut Repository, source: &Path, branch: &str) -> (Oid, Oid) {
    let sources = vec![source.canonicalize().unwrap()];
    let (mut index, hlinks) = build_index(&sources).unwrap();
    let opts = SaveOptions {
        name: Some(branch.to_string()),
        strip: true,
        ..Default::default()
    };
    let outcome = save(repo, &mut index, &hlinks, &sources, &opts)
        .await
        .unwrap();
    assert!(outcome.errors.is_empty(), "{:?}", outcome.errors);
    (outcome.tree, outcome.commit.unwrap())
}

async fn read_tree(repo: &mut Repository, oid: &Oid) -> Vec<(u32, Vec<u8>, Oid)> {
    let (objtype, data) = repo.cat_oid(oid).await.unwrap().unwrap();
    assert_eq!(objtype, ObjType::Tree);
    tree_decode(&data).unwrap()
}

fn entry<'a>(entries: &'a [(u32, Vec<u8>, Oid)], name: &[u8]) -> &'a (u32, Vec<u8>, Oid) {
    entries
        .iter()
        .find(|(_, n, _)| n == name)
        .unwrap_or_else(|| {
            let names: Vec<String> = entries
                .iter()
                .map(|(_, n, _)| String::from_utf8_lossy(n).into_owned())
                .collect();
            panic!("no entry {:?} in {names:?}", String::from_utf8_lossy(name))
        })
}

/// Reassembles a file stored as either a direct blob or a chunk tree.
fn restore<'a>(
    repo: &'a mut Repository,
    gitmode: u32,
    oid: Oid,
) -> Pin<Box<dyn Future<Output = Vec<u8>> + 'a>> {
    Box::pin(async move {
        if gitmode == GIT_MODE_TREE {
            let entries = read_tree(repo, &oid).await;
            let mut out = Vec::new();
            for (mode, _, child) in entries {
                out.extend(restore(repo, mode, child).await);
            }
            out
        } else {
            let (objtype, data) = repo.cat_oid(&oid).await.unwrap().unwrap();
            assert_eq!(objtype, ObjType::Blob);
            data
        }
    })
}

fn count_chunks<'a>(
    repo: &'a mut Repository,
    gitmode: u32,
    oid: Oid,
) -> Pin<Box<dyn Future<Output = usize> + 'a>> {
    Box::pin(async move {
        if gitmode == GIT_MODE_TREE {
            let entries = read_tree(repo, &oid).await;
            let mut count = 0;
            for (mode, _, child) in entries {
                count += count_chunks(repo, mode, child).await;
            }
            count
        } else {
            1
        }
    })
}

fn random_bytes(seed: u64, len: usize) -> Vec<u8> {
    let mut rng = StdRng::seed_from_u64(seed);
    let mut data = vec![0u8; len];
    rng.fill_bytes(&mut data);
    data
}

fn list_suffix(dir: &Path, suffix: &str) -> Vec<String> {
    let mut names: Vec<String> = std::fs::read_dir(dir)
        .unwrap()
        .filter_map(|e| e.unwrap().file_name().into_string().ok())
        .filter(|n| n.ends_with(suffix))
        .collect();
    names.sort();
    names
}

#[tokio::test]
async fn empty_file_yields_the_empty_blob_oid() {
    let env = new_env("");
    let mut repo = open(&env).await;
    let data = env._dir.path().join("data");
    std::fs::create_dir(&data).unwrap();
    std::fs::write(data.join("a"), b"").unwrap();

    let (_, commit) = save_stripped(&mut repo, &data, "main").await;
    let (objtype, blob) = repo.cat_oid(&commit).await.unwrap().unwrap();
    assert_eq!(objtype, ObjType::Commit);
    let info = parse_commit(&blob).unwrap();
    assert!(info.parents.is_empty());

    let entries = read_tree(&mut repo, &info.tree).await;
    let (mode, _, oid) = entry(&entries, b"a");
    assert_eq!(*mode, 0o100644);
    assert_eq!(
        hex::encode(oid),
        "e69de29bb2d1d6434b8b29ae775ad8c2e48c5391"
    );
}

#[tokio::test]
async fn small_file_is_a_direct_blob_with_metadata() {
    let env = new_env("");
    let mut repo = open(&env).await;
    let data = env._dir.path().join("data");
    std::fs::create_dir(&data).unwrap();
    std::fs::write(data.join("greeting"), b"hello\n").unwrap();

    let (tree, _) = save_stripped(&mut repo, &data, "main").await;
    let entries = read_tree(&mut repo, &tree).await;
    // no mangling for a single-chunk file
    let (mode, _, oid) = entry(&entries, b"greeting");
    assert_eq!(*mode, 0o100644);
    let (_, content) = repo.cat_oid(oid).await.unwrap().unwrap();
    assert_eq!(content, b"hello\n");

    // the metadata fragment has the directory record plus one file record
    let (bupm_mode, _, bupm_oid) = entry(&entries, b".bupm");
    let stream = restore(&mut repo, *bupm_mode, *bupm_oid).await;
    let records = Metadata::decode_stream(&stream).unwrap();
    assert_eq!(records.len(), 2);
    assert!(records[0].mode & 0o170000 == 0o040000);
    assert_eq!(records[1].size, Some(6));
}

#[tokio::test]
async fn large_file_becomes_a_mangled_chunk_tree() {
    let env = new_env("");
    let mut repo = open(&env).await;
    let data = env._dir.path().join("data");
    std::fs::create_dir(&data).unwrap();
    let content = random_bytes(42, 10 * 1024 * 1024);
    std::fs::write(data.join("file"), &content).unwrap();

    let (tree, _) = save_stripped(&mut repo, &data, "main").await;
    let entries = read_tree(&mut repo, &tree).await;
    assert!(!entries.iter().any(|(_, n, _)| n == b"file"));
    let (mode, _, oid) = entry(&entries, b"file.bup");
    assert_eq!(*mode, GIT_MODE_TREE);

    let chunks = count_chunks(&mut repo, *mode, *oid).await;
    assert!((500..=3000).contains(&chunks), "chunk count {chunks}");
    let restored = restore(&mut repo, *mode, *oid).await;
    assert_eq!(restored, content);
}

#[tokio::test]
async fn identical_files_share_one_pack_record() {
    let env = new_env("");
    let mut repo = open(&env).await;
    let data = env._dir.path().join("data");
    std::fs::create_dir(&data).unwrap();
    std::fs::write(data.join("x"), b"same bytes").unwrap();
    std::fs::write(data.join("y"), b"same bytes").unwrap();

    let (tree, _) = save_stripped(&mut repo, &data, "main").await;
    let entries = read_tree(&mut repo, &tree).await;
    let (_, _, oid_x) = entry(&entries, b"x");
    let (_, _, oid_y) = entry(&entries, b"y");
    assert_eq!(oid_x, oid_y);

    let mut records = 0;
    for idx_name in list_suffix(&env.cache, ".idx") {
        let data = std::fs::read(env.cache.join(&idx_name)).unwrap();
        let idx = PackIdx::parse(&idx_name, &data).unwrap();
        if idx.lookup(oid_x).is_some() {
            records += 1;
        }
    }
    assert_eq!(records, 1);
}

#[tokio::test]
async fn packs_rotate_and_everything_stays_reachable() {
    let env = new_env("[pack]\n\tpackSizeLimit = 64k\n");
    let mut repo = open(&env).await;
    let data = env._dir.path().join("data");
    std::fs::create_dir(&data).unwrap();
    let content = random_bytes(7, 512 * 1024);
    std::fs::write(data.join("big"), &content).unwrap();

    save_stripped(&mut repo, &data, "big").await;
    repo.close().await.unwrap();
    drop(repo);

    let packs = list_suffix(&env.storage, ".encpack");
    assert!(packs.len() >= 8, "only {} packs", packs.len());
    let idxes = list_suffix(&env.storage, ".encidx");
    let stems = |names: &[String], suffix: &str| -> Vec<String> {
        names
            .iter()
            .map(|n| n.trim_end_matches(suffix).to_string())
            .collect()
    };
    assert_eq!(stems(&packs, ".encpack"), stems(&idxes, ".encidx"));

    // a fresh cache must resynchronize every idx and still reach all data
    std::fs::remove_dir_all(&env.cache).unwrap();
    let mut repo = open(&env).await;
    assert_eq!(list_suffix(&env.cache, ".idx").len(), packs.len());
    let (_, _, blob) = repo.cat("refs/heads/big").await.unwrap().unwrap();
    let info = parse_commit(&blob).unwrap();
    let entries = read_tree(&mut repo, &info.tree).await;
    let (mode, _, oid) = entry(&entries, b"big.bup");
    let restored = restore(&mut repo, *mode, *oid).await;
    assert_eq!(restored, content);
}

#[tokio::test]
async fn unchanged_save_writes_no_new_data_objects() {
    let env = new_env("");
    let mut repo = open(&env).await;
    let data = env._dir.path().join("data");
    std::fs::create_dir_all(data.join("sub")).unwrap();
    std::fs::write(data.join("one"), b"first file").unwrap();
    std::fs::write(data.join("sub/two"), random_bytes(3, 100_000)).unwrap();

    let sources = vec![data.canonicalize().unwrap()];
    let (mut index, hlinks) = build_index(&sources).unwrap();
    let opts = SaveOptions {
        name: Some("main".to_string()),
        strip: true,
        ..Default::default()
    };

    let first = save(&mut repo, &mut index, &hlinks, &sources, &opts)
        .await
        .unwrap();
    let packs_after_first = list_suffix(&env.storage, ".encpack").len();

    // the same index again: everything is hash-valid and present
    let second = save(&mut repo, &mut index, &hlinks, &sources, &opts)
        .await
        .unwrap();
    assert_eq!(second.tree, first.tree);

    // only the new commit got written
    let packs_after_second = list_suffix(&env.storage, ".encpack");
    assert_eq!(packs_after_second.len(), packs_after_first + 1);
    let mut new_pack_objects = 0;
    for idx_name in list_suffix(&env.cache, ".idx") {
        let bytes = std::fs::read(env.cache.join(&idx_name)).unwrap();
        let idx = PackIdx::parse(&idx_name, &bytes).unwrap();
        if idx.lookup(&second.commit.unwrap()).is_some() {
            new_pack_objects = idx.len();
        }
    }
    assert_eq!(new_pack_objects, 1);

    // the branch moved and the new commit points at the old one
    assert_eq!(
        repo.read_ref("refs/heads/main").await.unwrap(),
        second.commit
    );
    let (_, blob) = repo.cat_oid(&second.commit.unwrap()).await.unwrap().unwrap();
    assert_eq!(parse_commit(&blob).unwrap().parents, vec![first.commit.unwrap()]);
}

#[tokio::test]
async fn split_trees_cover_every_entry() {
    let env = new_env("[bup]\n\ttreesplit = true\n");
    let mut repo = open(&env).await;
    let data = env._dir.path().join("data");
    std::fs::create_dir(&data).unwrap();
    for i in 0..2000 {
        std::fs::write(data.join(format!("file-{i:04}")), format!("content {i}")).unwrap();
    }

    let (tree, _) = save_stripped(&mut repo, &data, "main").await;

    // flatten the split tree: collect every non-special leaf entry
    let mut files: Vec<(Vec<u8>, Oid)> = Vec::new();
    let mut stack = vec![tree];
    while let Some(next) = stack.pop() {
        for (mode, name, oid) in read_tree(&mut repo, &next).await {
            if name == b".bupm" || name.ends_with(b".bupd") {
                continue;
            }
            if mode == GIT_MODE_TREE {
                stack.push(oid);
            } else {
                files.push((name, oid));
            }
        }
    }
    assert_eq!(files.len(), 2000);
    files.sort();
    files.dedup();
    assert_eq!(files.len(), 2000);

    let (_, oid) = files
        .iter()
        .find(|(name, _)| name == b"file-1234")
        .cloned()
        .unwrap();
    let (_, content) = repo.cat_oid(&oid).await.unwrap().unwrap();
    assert_eq!(content, b"content 1234");
}

#[tokio::test]
async fn symlinks_and_special_files() {
    let env = new_env("");
    let mut repo = open(&env).await;
    let data = env._dir.path().join("data");
    std::fs::create_dir(&data).unwrap();
    std::fs::write(data.join("real"), b"x").unwrap();
    std::os::unix::fs::symlink("real", data.join("link")).unwrap();
    let _listener = std::os::unix::net::UnixListener::bind(data.join("sock")).unwrap();

    let (tree, _) = save_stripped(&mut repo, &data, "main").await;
    let entries = read_tree(&mut repo, &tree).await;

    let (mode, _, oid) = entry(&entries, b"link");
    assert_eq!(*mode, 0o120000);
    let (_, target) = repo.cat_oid(oid).await.unwrap().unwrap();
    assert_eq!(target, b"real");

    // sockets are fully described by metadata; their blob is empty
    let (_, _, sock_oid) = entry(&entries, b"sock");
    assert_eq!(
        hex::encode(sock_oid),
        "e69de29bb2d1d6434b8b29ae775ad8c2e48c5391"
    );

    let (bupm_mode, _, bupm_oid) = entry(&entries, b".bupm");
    let stream = restore(&mut repo, *bupm_mode, *bupm_oid).await;
    let records = Metadata::decode_stream(&stream).unwrap();
    // dir + link + real + sock
    assert_eq!(records.len(), 4);
    assert!(records
        .iter()
        .any(|r| r.symlink_target.as_deref() == Some(b"real")));
    assert!(records.iter().any(|r| r.mode & 0o170000 == 0o140000));
}

#[tokio::test]
async fn root_collision_falls_back_to_empty_root_metadata() {
    let env = new_env("");
    let mut repo = open(&env).await;
    let a = env._dir.path().join("a");
    let b = env._dir.path().join("b");
    std::fs::create_dir(&a).unwrap();
    std::fs::create_dir(&b).unwrap();
    std::fs::write(a.join("f"), b"1").unwrap();
    std::fs::write(b.join("g"), b"2").unwrap();

    let sources = vec![a.canonicalize().unwrap(), b.canonicalize().unwrap()];
    let (mut index, hlinks) = build_index(&sources).unwrap();
    let opts = SaveOptions {
        name: Some("main".to_string()),
        strip: true,
        ..Default::default()
    };
    let outcome = save(&mut repo, &mut index, &hlinks, &sources, &opts)
        .await
        .unwrap();

    let entries = read_tree(&mut repo, &outcome.tree).await;
    entry(&entries, b"f");
    entry(&entries, b"g");
    let (bupm_mode, _, bupm_oid) = entry(&entries, b".bupm");
    let stream = restore(&mut repo, *bupm_mode, *bupm_oid).await;
    let records = Metadata::decode_stream(&stream).unwrap();
    assert_eq!(records[0], Metadata::default());
}

#[tokio::test]
async fn unreadable_sources_are_skipped_and_recorded() {
    let env = new_env("");
    let mut repo = open(&env).await;
    let data = env._dir.path().join("data");
    std::fs::create_dir(&data).unwrap();
    std::fs::write(data.join("keep"), b"fine").unwrap();
    std::fs::write(data.join("gone"), b"about to vanish").unwrap();

    let sources = vec![data.canonicalize().unwrap()];
    let (mut index, hlinks) = build_index(&sources).unwrap();
    // the file disappears between indexing and saving
    std::fs::remove_file(data.join("gone")).unwrap();

    let opts = SaveOptions {
        name: Some("main".to_string()),
        strip: true,
        ..Default::default()
    };
    let outcome = save(&mut repo, &mut index, &hlinks, &sources, &opts)
        .await
        .unwrap();
    assert_eq!(outcome.errors.len(), 1);

    let entries = read_tree(&mut repo, &outcome.tree).await;
    entry(&entries, b"keep");
    assert!(!entries.iter().any(|(_, n, _)| n == b"gone"));
    // the containing directory is left invalid so the next run retries it
    let dir_entry = index.entries.iter().find(|e| e.is_dir()).unwrap();
    assert!(!dir_entry.is_valid());
}

#[tokio::test]
async fn split_respects_input_boundaries() {
    let env = new_env("");
    let mut repo = open(&env).await;

    // constant bytes never produce a rolling-hash boundary, so the only
    // cuts are the forced input boundaries
    let first = vec![0u8; 10_000];
    let second = vec![0u8; 12_000];
    let opts = SplitOptions {
        keep_boundaries: true,
        commit: true,
        ..Default::default()
    };
    let outcome = split(
        &mut repo,
        vec![Cursor::new(first.clone()), Cursor::new(second.clone())],
        &opts,
    )
    .await
    .unwrap();

    let entries = read_tree(&mut repo, &outcome.tree).await;
    assert_eq!(entries.len(), 2);
    let mut all = Vec::new();
    for (mode, _, oid) in &entries {
        all.extend(restore(&mut repo, *mode, *oid).await);
    }
    let mut expected = first.clone();
    expected.extend_from_slice(&second);
    assert_eq!(all, expected);
    // the first chunk ends exactly at the input boundary
    let (_, first_chunk) = repo.cat_oid(&entries[0].2).await.unwrap().unwrap();
    assert_eq!(first_chunk, first);
}

#[tokio::test]
async fn split_to_a_branch_uses_a_mangled_data_entry() {
    let env = new_env("");
    let mut repo = open(&env).await;
    let content = random_bytes(23, 200_000);
    let opts = SplitOptions {
        name: Some("stream".to_string()),
        ..Default::default()
    };
    let outcome = split(&mut repo, vec![Cursor::new(content.clone())], &opts)
        .await
        .unwrap();
    assert_eq!(
        repo.read_ref("refs/heads/stream").await.unwrap(),
        outcome.commit
    );

    let entries = read_tree(&mut repo, &outcome.tree).await;
    assert_eq!(entries.len(), 1);
    let (mode, name, oid) = &entries[0];
    assert_eq!(name.as_slice(), b"data.bup");
    let restored = restore(&mut repo, *mode, *oid).await;
    assert_eq!(restored, content);
}

#[tokio::test]
async fn chunk_tree_fanout_is_bounded() {
    let env = new_env("");
    let mut repo = open(&env).await;
    // constant input never hits a content boundary, so every chunk is a
    // level-0 forced cut and only the per-tree cap limits the fanout
    let content = vec![0u8; 40 * 1024 * 1024];
    let opts = SplitOptions {
        blobbits: Some(9),
        ..Default::default()
    };
    let outcome = split(&mut repo, vec![Cursor::new(content.clone())], &opts)
        .await
        .unwrap();

    let entries = read_tree(&mut repo, &outcome.tree).await;
    assert!(entries.len() <= 256);
    // 40 MiB in 128 KiB forced cuts
    assert_eq!(
        count_chunks(&mut repo, GIT_MODE_TREE, outcome.tree).await,
        320
    );
    let restored = restore(&mut repo, GIT_MODE_TREE, outcome.tree).await;
    assert_eq!(restored, content);
}

#[tokio::test]
async fn grafts_remap_archive_paths() {
    let env = new_env("");
    let mut repo = open(&env).await;
    let data = env._dir.path().join("data");
    std::fs::create_dir(&data).unwrap();
    std::fs::write(data.join("f"), b"grafted").unwrap();

    let sources = vec![data.canonicalize().unwrap()];
    let (mut index, hlinks) = build_index(&sources).unwrap();
    use std::os::unix::ffi::OsStrExt;
    let opts = SaveOptions {
        name: Some("main".to_string()),
        grafts: vec![(
            sources[0].as_os_str().as_bytes().to_vec(),
            b"/backup/set".to_vec(),
        )],
        ..Default::default()
    };
    let outcome = save(&mut repo, &mut index, &hlinks, &sources, &opts)
        .await
        .unwrap();

    let root = read_tree(&mut repo, &outcome.tree).await;
    let (mode, _, backup) = entry(&root, b"backup");
    assert_eq!(*mode, GIT_MODE_TREE);
    let backup = read_tree(&mut repo, backup).await;
    let (_, _, set) = entry(&backup, b"set");
    let set = read_tree(&mut repo, set).await;
    let (_, _, f) = entry(&set, b"f");
    let (_, content) = repo.cat_oid(f).await.unwrap().unwrap();
    assert_eq!(content, b"grafted");
}

#[tokio::test]
async fn append_only_repositories_cannot_read_back() {
    let dir = tempfile::tempdir().unwrap();
    let keys = generate_keys().unwrap();
    let conf = dir.path().join("repo.conf");
    std::fs::write(
        &conf,
        format!(
            "[bup]\n\
             \ttype = Encrypted\n\
             \tstorage = file\n\
             \tpath = {}\n\
             \tcachedir = {}\n\
             \trepokey = {}\n\
             \twritekey = {}\n",
            dir.path().join("store").display(),
            dir.path().join("cache").display(),
            keys.repokey,
            keys.writekey,
        ),
    )
    .unwrap();
    let url = format!("config://{}", conf.display());
    let mut repo = open_repository(&url, true).await.unwrap();

    let sha = repo.write_data(b"write-only world").await.unwrap();
    repo.finish_writing().await.unwrap();
    // dedup still works through the idx
    assert!(repo.exists(&sha));
    assert!(matches!(
        repo.cat_oid(&sha).await,
        Err(RepoError::ReadKeyRequired)
    ));
}
