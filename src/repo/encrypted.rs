//! The encrypted repository: owns the open pack writers, the tentative
//! object sets, the backend session and the local idx cache.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};

use flate2::Compression;

use crate::config::{Config, ConfigError};
use crate::defaults::{ENCIDX_SUFFIX, ENCPACK_SUFFIX, IDX_SUFFIX, MAX_PACK_SIZE, REFSNAME};
use crate::keys::RepoKeys;
use crate::object::{calc_hash, create_commit, tree_encode, ObjType, Oid};
use crate::repo::container::{
    ContainerError, ContainerReader, ContainerWriter, FileType, HeaderReadKey, HeaderWriteKey,
};
use crate::repo::idx::{auto_midx, PackIdxList, PackIdxWriter};
use crate::repo::{storage_from_config, RepoError};
use crate::storage::{Storage, StorageError};

/// One tentative pack under construction, with its idx builder.
struct PackWriter {
    id: [u8; 20],
    container: ContainerWriter,
    idx: PackIdxWriter,
}

impl PackWriter {
    async fn create(
        storage: &Storage,
        keys: &RepoKeys,
        compression: Compression,
    ) -> Result<Self, RepoError> {
        // random, so the name reveals nothing about the content
        let mut id = [0u8; 20];
        getrandom::getrandom(&mut id).map_err(ContainerError::from)?;
        let name = format!("pack-{}{ENCPACK_SUFFIX}", hex::encode(id));
        let container = ContainerWriter::create(
            storage,
            &name,
            FileType::Pack,
            compression,
            HeaderWriteKey::Sealed(&keys.writekey),
            None,
        )
        .await?;
        Ok(Self {
            id,
            container,
            idx: PackIdxWriter::new(),
        })
    }

    async fn write(
        &mut self,
        objtype: ObjType,
        sha: Oid,
        payload: &[u8],
    ) -> Result<u64, RepoError> {
        let offset = self.container.write(objtype as u8, payload).await?;
        self.idx.add(sha, objtype as u8, offset);
        Ok(offset)
    }

    fn size(&self) -> u64 {
        self.container.size()
    }
}

/// Repository facade over encrypted pack storage.
pub struct Repository {
    config: Config,
    storage: Storage,
    cachedir: PathBuf,
    keys: RepoKeys,
    refsname: String,
    compression: Compression,
    separatemeta: bool,
    treesplit: bool,
    blobbits: Option<u32>,
    max_pack_size: u64,
    data_writer: Option<PackWriter>,
    meta_writer: Option<PackWriter>,
    data_written: HashSet<Oid>,
    meta_written: HashSet<Oid>,
    idxlist: PackIdxList,
    reader_cache: HashMap<String, ContainerReader>,
}

async fn sync_idx_cache(
    storage: &Storage,
    cachedir: &Path,
    keys: &RepoKeys,
) -> Result<bool, RepoError> {
    let mut changed = false;

    let mut local: HashSet<String> = HashSet::new();
    let mut dir = tokio::fs::read_dir(cachedir).await?;
    while let Some(entry) = dir.next_entry().await? {
        if let Ok(name) = entry.file_name().into_string() {
            if name.ends_with(IDX_SUFFIX) {
                local.insert(name);
            }
        }
    }

    for remote_name in storage.list(ENCIDX_SUFFIX).await? {
        let stem = remote_name
            .strip_suffix(ENCIDX_SUFFIX)
            .unwrap_or(&remote_name);
        let local_name = format!("{stem}{IDX_SUFFIX}");
        if local.remove(&local_name) {
            continue;
        }
        let mut reader = ContainerReader::open(
            storage,
            &remote_name,
            FileType::Idx,
            HeaderReadKey::Secret(&keys.repokey),
        )
        .await?;
        let (_, payload) = reader.read_first().await?;
        tokio::fs::write(cachedir.join(&local_name), payload).await?;
        log::debug!("fetched idx {local_name}");
        changed = true;
    }

    // anything left locally has no remote counterpart anymore
    for stale in local {
        tokio::fs::remove_file(cachedir.join(&stale)).await?;
        log::debug!("dropped stale idx {stale}");
        changed = true;
    }
    Ok(changed)
}

impl Repository {
    /// Opens the repository described by an already-loaded config.
    pub async fn open(config: Config, create: bool) -> Result<Self, RepoError> {
        let cachedir = config
            .get_path("bup.cachedir")
            .ok_or(ConfigError::Missing("bup.cachedir"))?;
        if create {
            tokio::fs::create_dir_all(&cachedir).await?;
        } else if !tokio::fs::try_exists(&cachedir).await? {
            return Err(ConfigError::Invalid {
                key: "bup.cachedir".to_string(),
                reason: "directory does not exist; initialize the repository first".to_string(),
            }
            .into());
        }

        let storage = storage_from_config(&config, create).await?;
        let keys = RepoKeys::from_config(&config)?;
        let refsname = config.get("bup.refsname").unwrap_or(REFSNAME).to_string();

        let level = match config.get_int("pack.compression")? {
            Some(level) => Some(level),
            None => config.get_int("core.compression")?,
        };
        let compression = match level {
            None | Some(-1) => Compression::default(),
            Some(level @ 0..=9) => Compression::new(level as u32),
            Some(other) => {
                return Err(ConfigError::Invalid {
                    key: "pack.compression".to_string(),
                    reason: format!("level {other} out of range"),
                }
                .into())
            }
        };

        let separatemeta = config.get_bool("bup.separatemeta")?.unwrap_or(false);
        let treesplit = config.get_bool("bup.treesplit")?.unwrap_or(false);
        let blobbits = match config.get_int("bup.blobbits")? {
            None => None,
            Some(bits @ 9..=21) => Some(bits as u32),
            Some(other) => {
                return Err(ConfigError::Invalid {
                    key: "bup.blobbits".to_string(),
                    reason: format!("{other} out of range"),
                }
                .into())
            }
        };
        let max_pack_size = config
            .get_int("pack.packsizelimit")?
            .map_or(MAX_PACK_SIZE, |v| v.max(0) as u64);

        if sync_idx_cache(&storage, &cachedir, &keys).await? {
            auto_midx(&cachedir).await?;
        }
        let idxlist = PackIdxList::load(&cachedir).await?;
        log::debug!(
            "repository open: {} packs, {} objects",
            idxlist.pack_names().len(),
            idxlist.object_count()
        );

        Ok(Self {
            config,
            storage,
            cachedir,
            keys,
            refsname,
            compression,
            separatemeta,
            treesplit,
            blobbits,
            max_pack_size,
            data_writer: None,
            meta_writer: None,
            data_written: HashSet::new(),
            meta_written: HashSet::new(),
            idxlist,
            reader_cache: HashMap::new(),
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Whether large directories are stored as split trees.
    pub fn treesplit(&self) -> bool {
        self.treesplit
    }

    /// Configured splitter bits, if overridden.
    pub fn blobbits(&self) -> Option<u32> {
        self.blobbits
    }

    /// Monotonic count of bytes handed to the backend.
    pub fn bytes_written(&self) -> u64 {
        self.storage.bytes_written()
    }

    /// Object count across all synchronized idx files.
    pub fn object_count(&self) -> usize {
        self.idxlist.object_count()
    }

    /// Checks the tentative sets and the combined idx list.
    pub fn exists(&self, sha: &Oid) -> bool {
        self.data_written.contains(sha)
            || (self.separatemeta && self.meta_written.contains(sha))
            || self.idxlist.exists(sha)
    }

    /// Like `exists`, but names the pack idx and offset holding the object.
    pub fn find_object(&self, sha: &Oid) -> Option<(String, u64)> {
        self.idxlist
            .find(sha)
            .map(|(name, offset)| (name.to_string(), offset))
    }

    async fn ensure_data_writer(&mut self) -> Result<(), RepoError> {
        if self
            .data_writer
            .as_ref()
            .is_some_and(|w| w.size() > self.max_pack_size)
        {
            if let Some(writer) = self.data_writer.take() {
                self.finish_pack(writer, false).await?;
            }
        }
        if self.data_writer.is_none() {
            self.data_writer =
                Some(PackWriter::create(&self.storage, &self.keys, self.compression).await?);
        }
        Ok(())
    }

    async fn ensure_meta_writer(&mut self) -> Result<(), RepoError> {
        if self
            .meta_writer
            .as_ref()
            .is_some_and(|w| w.size() > self.max_pack_size)
        {
            if let Some(writer) = self.meta_writer.take() {
                self.finish_pack(writer, true).await?;
            }
        }
        if self.meta_writer.is_none() {
            self.meta_writer =
                Some(PackWriter::create(&self.storage, &self.keys, self.compression).await?);
        }
        Ok(())
    }

    async fn write_object(
        &mut self,
        objtype: ObjType,
        payload: &[u8],
        meta: bool,
    ) -> Result<Oid, RepoError> {
        let sha = calc_hash(objtype, payload);
        if self.exists(&sha) {
            return Ok(sha);
        }
        if meta && self.separatemeta {
            self.ensure_meta_writer().await?;
            if let Some(writer) = self.meta_writer.as_mut() {
                writer.write(objtype, sha, payload).await?;
            }
            self.meta_written.insert(sha);
        } else {
            self.ensure_data_writer().await?;
            if let Some(writer) = self.data_writer.as_mut() {
                writer.write(objtype, sha, payload).await?;
            }
            self.data_written.insert(sha);
        }
        Ok(sha)
    }

    pub async fn write_data(&mut self, data: &[u8]) -> Result<Oid, RepoError> {
        self.write_object(ObjType::Blob, data, false).await
    }

    pub async fn write_symlink(&mut self, target: &[u8]) -> Result<Oid, RepoError> {
        self.write_object(ObjType::Blob, target, true).await
    }

    pub async fn write_bupm(&mut self, data: &[u8]) -> Result<Oid, RepoError> {
        self.write_object(ObjType::Blob, data, true).await
    }

    pub async fn write_tree(
        &mut self,
        shalist: &[(u32, Vec<u8>, Oid)],
    ) -> Result<Oid, RepoError> {
        let encoded = tree_encode(shalist);
        self.write_object(ObjType::Tree, &encoded, true).await
    }

    #[allow(clippy::too_many_arguments)]
    pub async fn write_commit(
        &mut self,
        tree: &Oid,
        parent: Option<&Oid>,
        author: &[u8],
        author_sec: i64,
        author_offset: i32,
        committer: &[u8],
        committer_sec: i64,
        committer_offset: i32,
        message: &[u8],
    ) -> Result<Oid, RepoError> {
        let encoded = create_commit(
            tree,
            parent,
            author,
            author_sec,
            author_offset,
            committer,
            committer_sec,
            committer_offset,
            message,
        );
        self.write_object(ObjType::Commit, &encoded, true).await
    }

    async fn finish_pack(&mut self, writer: PackWriter, is_meta: bool) -> Result<(), RepoError> {
        let PackWriter { id, container, idx } = writer;
        let hexid = hex::encode(id);
        container.finish().await?;

        let idx_bytes = idx.serialize();
        let idx_name = format!("pack-{hexid}{IDX_SUFFIX}");
        tokio::fs::write(self.cachedir.join(&idx_name), &idx_bytes).await?;

        let mut encidx = ContainerWriter::create(
            &self.storage,
            &format!("pack-{hexid}{ENCIDX_SUFFIX}"),
            FileType::Idx,
            self.compression,
            HeaderWriteKey::Secret(&self.keys.repokey),
            None,
        )
        .await?;
        encidx.write(0, &idx_bytes).await?;
        encidx.finish().await?;
        log::debug!("finished pack {hexid}");

        auto_midx(&self.cachedir).await?;
        self.idxlist.refresh().await?;

        // the idx list now covers these objects
        let (written, idxlist) = if is_meta && self.separatemeta {
            (&mut self.meta_written, &self.idxlist)
        } else {
            (&mut self.data_written, &self.idxlist)
        };
        debug_assert!(written.iter().all(|sha| idxlist.exists(sha)));
        written.clear();
        Ok(())
    }

    /// Really adds the tentatively written objects to the repository.
    pub async fn finish_writing(&mut self) -> Result<(), RepoError> {
        if let Some(writer) = self.meta_writer.take() {
            self.finish_pack(writer, true).await?;
        }
        if let Some(writer) = self.data_writer.take() {
            self.finish_pack(writer, false).await?;
        }
        Ok(())
    }

    /// Discards the tentative packs and their in-memory object sets.
    pub async fn abort_writing(&mut self) {
        for writer in [self.meta_writer.take(), self.data_writer.take()]
            .into_iter()
            .flatten()
        {
            let hexid = hex::encode(writer.id);
            if let Err(e) = writer.container.abort().await {
                log::warn!("failed to abort pack {hexid}: {e}");
            } else {
                log::debug!("aborted pack {hexid}");
            }
        }
        self.data_written.clear();
        self.meta_written.clear();
    }

    fn decode_refs(payload: &[u8]) -> Result<HashMap<String, Oid>, RepoError> {
        let raw: HashMap<String, String> = serde_json::from_slice(payload)
            .map_err(|e| RepoError::BadRefs(e.to_string()))?;
        let mut refs = HashMap::with_capacity(raw.len());
        for (name_hex, oid_hex) in raw {
            let name_bytes = hex::decode(&name_hex)
                .map_err(|_| RepoError::BadRefs(format!("bad ref name {name_hex}")))?;
            let name = String::from_utf8(name_bytes)
                .map_err(|_| RepoError::BadRefs(format!("non-utf8 ref name {name_hex}")))?;
            let mut oid = [0u8; 20];
            hex::decode_to_slice(&oid_hex, &mut oid)
                .map_err(|_| RepoError::BadRefs(format!("bad oid for ref {name}")))?;
            refs.insert(name, oid);
        }
        Ok(refs)
    }

    async fn json_refs(
        &self,
    ) -> Result<(Option<crate::storage::OverwriteToken>, HashMap<String, Oid>), RepoError> {
        let reader = ContainerReader::open(
            &self.storage,
            &self.refsname,
            FileType::Config,
            HeaderReadKey::Secret(&self.keys.repokey),
        )
        .await;
        match reader {
            Ok(mut reader) => {
                let token = reader.token();
                let (_, payload) = reader.read_first().await?;
                Ok((Some(token), Self::decode_refs(&payload)?))
            }
            Err(ContainerError::Storage(StorageError::NotFound(_))) => Ok((None, HashMap::new())),
            Err(e) => Err(e.into()),
        }
    }

    /// Lists refs, optionally filtered by component-suffix patterns and
    /// limited to heads and/or tags.
    pub async fn refs(
        &self,
        patterns: &[&str],
        limit_to_heads: bool,
        limit_to_tags: bool,
    ) -> Result<Vec<(String, Oid)>, RepoError> {
        let (_, refs) = self.json_refs().await?;
        let patterns: Vec<Vec<&str>> = patterns.iter().map(|p| p.split('/').collect()).collect();
        let mut out: Vec<(String, Oid)> = refs
            .into_iter()
            .filter(|(name, _)| {
                if !patterns.is_empty() {
                    // match only whole trailing path components
                    let path: Vec<&str> = name.split('/').collect();
                    let matched = patterns.iter().any(|pattern| {
                        path.len() >= pattern.len()
                            && path[path.len() - pattern.len()..] == pattern[..]
                    });
                    if !matched {
                        return false;
                    }
                }
                if limit_to_heads && !name.starts_with("refs/heads/") {
                    return false;
                }
                if limit_to_tags && !name.starts_with("refs/tags/") {
                    return false;
                }
                true
            })
            .collect();
        out.sort();
        Ok(out)
    }

    /// Resolves a branch ref to its commit OID.
    pub async fn read_ref(&self, refname: &str) -> Result<Option<Oid>, RepoError> {
        let mut matches = self.refs(&[refname], true, false).await?;
        match matches.len() {
            0 => Ok(None),
            1 => Ok(Some(matches.remove(0).1)),
            _ => Err(RepoError::BadRefs(format!("ambiguous ref {refname}"))),
        }
    }

    /// Compare-and-swap update of a ref; `oldval` of `None` asserts the ref
    /// did not exist. All tentative packs are finished first.
    pub async fn update_ref(
        &mut self,
        refname: &str,
        newval: Oid,
        oldval: Option<Oid>,
    ) -> Result<(), RepoError> {
        self.finish_writing().await?;
        let (token, mut refs) = self.json_refs().await?;
        if refs.get(refname).copied() != oldval {
            return Err(RepoError::RefCas {
                refname: refname.to_string(),
            });
        }
        refs.insert(refname.to_string(), newval);

        let encoded: HashMap<String, String> = refs
            .iter()
            .map(|(name, oid)| (hex::encode(name.as_bytes()), hex::encode(oid)))
            .collect();
        let json = serde_json::to_vec(&encoded).map_err(|e| RepoError::BadRefs(e.to_string()))?;

        let mut writer = ContainerWriter::create(
            &self.storage,
            &self.refsname,
            FileType::Config,
            self.compression,
            HeaderWriteKey::Secret(&self.keys.repokey),
            token,
        )
        .await?;
        writer.write(0, &json).await?;
        writer.finish().await?;
        log::debug!("ref {refname} -> {}", hex::encode(newval));
        Ok(())
    }

    async fn read_object(&mut self, pack_name: &str, offset: u64) -> Result<(u8, Vec<u8>), RepoError> {
        if !self.reader_cache.contains_key(pack_name) {
            let readkey = self
                .keys
                .readkey
                .as_ref()
                .ok_or(RepoError::ReadKeyRequired)?;
            let reader = ContainerReader::open(
                &self.storage,
                pack_name,
                FileType::Pack,
                HeaderReadKey::Sealed(readkey),
            )
            .await?;
            self.reader_cache.insert(pack_name.to_string(), reader);
        }
        let reader = self
            .reader_cache
            .get_mut(pack_name)
            .expect("reader just cached");
        Ok(reader.read_at(offset).await?)
    }

    /// Reads the object with the given OID, if present.
    pub async fn cat_oid(&mut self, oid: &Oid) -> Result<Option<(ObjType, Vec<u8>)>, RepoError> {
        let Some((idx_name, offset)) = self.find_object(oid) else {
            return Ok(None);
        };
        let stem = idx_name.strip_suffix(IDX_SUFFIX).unwrap_or(&idx_name);
        let pack_name = format!("{stem}{ENCPACK_SUFFIX}");
        let (objtype, data) = self.read_object(&pack_name, offset).await?;
        let objtype = ObjType::from_byte(objtype).ok_or(RepoError::BadObjectType(objtype))?;
        Ok(Some((objtype, data)))
    }

    /// Resolves a hex OID or ref name and reads the object, yielding
    /// `(oidx, type, payload)`.
    pub async fn cat(
        &mut self,
        reference: &str,
    ) -> Result<Option<(String, ObjType, Vec<u8>)>, RepoError> {
        let oid: Oid = if reference.len() == 40
            && reference.bytes().all(|b| b.is_ascii_hexdigit())
        {
            let mut oid = [0u8; 20];
            hex::decode_to_slice(reference.to_ascii_lowercase(), &mut oid)
                .map_err(|_| RepoError::RefNotFound(reference.to_string()))?;
            oid
        } else {
            self.read_ref(reference)
                .await?
                .ok_or_else(|| RepoError::RefNotFound(reference.to_string()))?
        };
        Ok(self
            .cat_oid(&oid)
            .await?
            .map(|(objtype, data)| (hex::encode(oid), objtype, data)))
    }

    /// Finishes all writing and drops the cached pack readers.
    pub async fn close(&mut self) -> Result<(), RepoError> {
        self.finish_writing().await?;
        self.reader_cache.clear();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keys::generate_keys;

    async fn test_repo(dir: &tempfile::TempDir, extra: &str) -> Repository {
        let conf = dir.path().join("repo.conf");
        // reopening must keep the original keys
        if !conf.exists() {
            let keys = generate_keys().unwrap();
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
                    dir.path().join("store").display(),
                    dir.path().join("cache").display(),
                    keys.repokey,
                    keys.readkey,
                ),
            )
            .unwrap();
        }
        let config = Config::load(&conf).unwrap();
        Repository::open(config, true).await.unwrap()
    }

    #[tokio::test]
    async fn write_dedup_and_cat() {
        let dir = tempfile::tempdir().unwrap();
        let mut repo = test_repo(&dir, "").await;

        let a = repo.write_data(b"payload one").await.unwrap();
        let b = repo.write_data(b"payload one").await.unwrap();
        assert_eq!(a, b);
        let c = repo.write_data(b"payload two").await.unwrap();
        assert_ne!(a, c);

        repo.finish_writing().await.unwrap();
        assert_eq!(repo.object_count(), 2);

        let (objtype, data) = repo.cat_oid(&a).await.unwrap().unwrap();
        assert_eq!(objtype, ObjType::Blob);
        assert_eq!(data, b"payload one");
        assert!(repo.cat_oid(&[0u8; 20]).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn dedup_across_sessions_is_a_pack_level_noop() {
        let dir = tempfile::tempdir().unwrap();
        let mut repo = test_repo(&dir, "").await;
        repo.write_data(b"stable contents").await.unwrap();
        repo.finish_writing().await.unwrap();
        drop(repo);

        let mut repo = test_repo(&dir, "").await;
        assert_eq!(repo.object_count(), 1);
        repo.write_data(b"stable contents").await.unwrap();
        repo.finish_writing().await.unwrap();
        assert_eq!(repo.object_count(), 1);
    }

    #[tokio::test]
    async fn packs_rotate_at_the_size_limit() {
        let dir = tempfile::tempdir().unwrap();
        let mut repo = test_repo(&dir, "[pack]\n\tpackSizeLimit = 4k\n\tcompression = 0\n").await;
        for i in 0..40u32 {
            let payload = vec![i as u8; 1024];
            repo.write_data(&payload).await.unwrap();
        }
        repo.finish_writing().await.unwrap();
        assert!(repo.idxlist.pack_names().len() >= 2);
        // every object is still reachable through the combined index
        for i in 0..40u32 {
            let payload = vec![i as u8; 1024];
            let sha = calc_hash(ObjType::Blob, &payload);
            assert!(repo.exists(&sha));
            let (_, data) = repo.cat_oid(&sha).await.unwrap().unwrap();
            assert_eq!(data, payload);
        }
    }

    #[tokio::test]
    async fn abort_leaves_no_durable_state() {
        let dir = tempfile::tempdir().unwrap();
        let mut repo = test_repo(&dir, "").await;
        let sha = repo.write_data(b"doomed").await.unwrap();
        assert!(repo.exists(&sha));
        repo.abort_writing().await;
        assert!(!repo.exists(&sha));
        repo.close().await.unwrap();
        drop(repo);

        let repo = test_repo(&dir, "").await;
        assert_eq!(repo.object_count(), 0);
    }

    #[tokio::test]
    async fn separate_metadata_packs() {
        let dir = tempfile::tempdir().unwrap();
        let mut repo = test_repo(&dir, "\tseparatemeta = true\n").await;
        let blob = repo.write_data(b"file data").await.unwrap();
        let tree = repo
            .write_tree(&[(0o100644, b"f".to_vec(), blob)])
            .await
            .unwrap();
        repo.finish_writing().await.unwrap();

        assert_eq!(repo.idxlist.pack_names().len(), 2);
        let (data_pack, _) = repo.find_object(&blob).unwrap();
        let (meta_pack, _) = repo.find_object(&tree).unwrap();
        assert_ne!(data_pack, meta_pack);

        let (_, payload) = repo.cat_oid(&tree).await.unwrap().unwrap();
        assert!(payload.ends_with(&blob));
    }

    #[tokio::test]
    async fn ref_cas_allows_exactly_one_winner() {
        let dir = tempfile::tempdir().unwrap();
        let mut repo = test_repo(&dir, "").await;
        let base = [1u8; 20];
        let y1 = [2u8; 20];
        let y2 = [3u8; 20];

        repo.update_ref("refs/heads/main", base, None).await.unwrap();
        assert_eq!(repo.read_ref("refs/heads/main").await.unwrap(), Some(base));

        repo.update_ref("refs/heads/main", y1, Some(base)).await.unwrap();
        let err = repo.update_ref("refs/heads/main", y2, Some(base)).await;
        assert!(matches!(err, Err(RepoError::RefCas { .. })));
        assert_eq!(repo.read_ref("refs/heads/main").await.unwrap(), Some(y1));
    }

    #[tokio::test]
    async fn ref_patterns_match_whole_components() {
        let dir = tempfile::tempdir().unwrap();
        let mut repo = test_repo(&dir, "").await;
        repo.update_ref("refs/heads/main", [1u8; 20], None).await.unwrap();
        repo.update_ref("refs/heads/domain", [2u8; 20], None).await.unwrap();

        let all = repo.refs(&[], false, false).await.unwrap();
        assert_eq!(all.len(), 2);
        // "main" must not match the tail of "domain"
        let named = repo.refs(&["main"], false, false).await.unwrap();
        assert_eq!(named.len(), 1);
        assert_eq!(named[0].0, "refs/heads/main");
        let heads = repo.refs(&["heads/main"], true, false).await.unwrap();
        assert_eq!(heads.len(), 1);
    }
}
