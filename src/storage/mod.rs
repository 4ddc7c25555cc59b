//! Backend storage for encrypted repository files. The `file` backend keeps
//! everything under one directory; writes go to a temporary file fed by a
//! single background task with a bounded queue, and become visible with an
//! atomic rename on finish.

use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering::Relaxed};
use std::sync::Arc;

use tokio::fs::{self, File, OpenOptions};
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_stream::{wrappers::ReadDirStream, StreamExt};

#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("file not found: {0}")]
    NotFound(String),
    #[error("file already exists: {0}")]
    AlreadyExists(String),
    #[error("file was modified concurrently: {0}")]
    Modified(String),
    #[error("{0}")]
    Io(#[from] io::Error),
}

/// Identity of a stored file at read time, checked again before a writer
/// replaces it.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct OverwriteToken {
    ino: u64,
    size: u64,
}

impl OverwriteToken {
    async fn of(path: &Path) -> io::Result<Self> {
        use std::os::unix::fs::MetadataExt;
        let md = fs::metadata(path).await?;
        Ok(Self {
            ino: md.ino(),
            size: md.len(),
        })
    }
}

/// Serializes commit-time renames within one storage directory.
struct LockGuard {
    path: PathBuf,
}

impl LockGuard {
    async fn acquire(root: &Path) -> Result<Self, StorageError> {
        let path = root.join(".lock");
        for _ in 0..500 {
            match OpenOptions::new()
                .write(true)
                .create_new(true)
                .open(&path)
                .await
            {
                Ok(_) => return Ok(Self { path }),
                Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {
                    tokio::time::sleep(std::time::Duration::from_millis(10)).await;
                }
                Err(e) => return Err(e.into()),
            }
        }
        Err(StorageError::Io(io::Error::new(
            io::ErrorKind::TimedOut,
            "timed out waiting for the storage lock",
        )))
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.path);
    }
}

/// Local-directory storage backend.
pub struct FileStorage {
    root: PathBuf,
    bytes_written: Arc<AtomicU64>,
}

impl FileStorage {
    pub async fn open(root: PathBuf, create: bool) -> Result<Self, StorageError> {
        if create {
            fs::create_dir_all(&root).await?;
        } else if !fs::try_exists(&root).await? {
            return Err(StorageError::NotFound(root.display().to_string()));
        }
        Ok(Self {
            root,
            bytes_written: Arc::new(AtomicU64::new(0)),
        })
    }

    /// Lists stored file names with the given suffix, sorted.
    pub async fn list(&self, suffix: &str) -> Result<Vec<String>, StorageError> {
        let mut entries = ReadDirStream::new(fs::read_dir(&self.root).await?);
        let mut names = Vec::new();
        while let Some(entry) = entries.next().await {
            let entry = entry?;
            if let Ok(name) = entry.file_name().into_string() {
                if name.ends_with(suffix) {
                    names.push(name);
                }
            }
        }
        names.sort();
        Ok(names)
    }

    pub async fn get_reader(&self, name: &str) -> Result<FileReader, StorageError> {
        let path = self.root.join(name);
        let file = match File::open(&path).await {
            Ok(f) => f,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                return Err(StorageError::NotFound(name.to_string()))
            }
            Err(e) => return Err(e.into()),
        };
        let token = OverwriteToken::of(&path).await?;
        let size = token.size;
        Ok(FileReader {
            name: name.to_string(),
            file,
            size,
            token,
        })
    }

    /// Opens a writer for a new file. `overwrite` carries the token of the
    /// existing file this write is meant to replace; without it, the name
    /// must not exist yet.
    pub async fn get_writer(
        &self,
        name: &str,
        overwrite: Option<OverwriteToken>,
    ) -> Result<FileWriter, StorageError> {
        let final_path = self.root.join(name);
        if overwrite.is_none() && fs::try_exists(&final_path).await? {
            return Err(StorageError::AlreadyExists(name.to_string()));
        }
        let tmp_path = self.root.join(format!("{name}.tmp"));
        // a leftover .tmp from a crashed writer is fair game
        let file = File::create(&tmp_path).await?;

        let (tx, mut rx) = mpsc::channel::<Vec<u8>>(1);
        let counter = Arc::clone(&self.bytes_written);
        let task = tokio::spawn(async move {
            let mut file = file;
            while let Some(buf) = rx.recv().await {
                file.write_all(&buf).await?;
                counter.fetch_add(buf.len() as u64, Relaxed);
            }
            file.flush().await?;
            file.sync_all().await?;
            Ok::<(), io::Error>(())
        });

        Ok(FileWriter {
            name: name.to_string(),
            root: self.root.clone(),
            tmp_path,
            final_path,
            overwrite,
            tx: Some(tx),
            task: Some(task),
        })
    }

    /// Monotonic counter of bytes handed to the backend; a bandwidth-limited
    /// transport may sleep against it.
    pub fn bytes_written(&self) -> u64 {
        self.bytes_written.load(Relaxed)
    }
}

/// Closed enumeration of storage backends.
pub enum Storage {
    File(FileStorage),
}

impl Storage {
    pub async fn list(&self, suffix: &str) -> Result<Vec<String>, StorageError> {
        match self {
            Storage::File(fs) => fs.list(suffix).await,
        }
    }

    pub async fn get_reader(&self, name: &str) -> Result<FileReader, StorageError> {
        match self {
            Storage::File(fs) => fs.get_reader(name).await,
        }
    }

    pub async fn get_writer(
        &self,
        name: &str,
        overwrite: Option<OverwriteToken>,
    ) -> Result<FileWriter, StorageError> {
        match self {
            Storage::File(fs) => fs.get_writer(name, overwrite).await,
        }
    }

    pub fn bytes_written(&self) -> u64 {
        match self {
            Storage::File(fs) => fs.bytes_written(),
        }
    }
}

/// Random-access reader over one stored file.
pub struct FileReader {
    name: String,
    file: File,
    size: u64,
    token: OverwriteToken,
}

impl FileReader {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn token(&self) -> OverwriteToken {
        self.token
    }

    pub async fn seek(&mut self, offset: u64) -> Result<(), StorageError> {
        self.file.seek(io::SeekFrom::Start(offset)).await?;
        Ok(())
    }

    pub async fn read_exact(&mut self, buf: &mut [u8]) -> Result<(), StorageError> {
        self.file.read_exact(buf).await?;
        Ok(())
    }
}

/// Writer for one new stored file. Buffers are handed to a background task
/// through a depth-1 queue; the task's first error resurfaces on the next
/// write and on finish.
pub struct FileWriter {
    name: String,
    root: PathBuf,
    tmp_path: PathBuf,
    final_path: PathBuf,
    overwrite: Option<OverwriteToken>,
    tx: Option<mpsc::Sender<Vec<u8>>>,
    task: Option<JoinHandle<io::Result<()>>>,
}

impl FileWriter {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub async fn write(&mut self, buf: Vec<u8>) -> Result<(), StorageError> {
        let alive = match &self.tx {
            Some(tx) => tx.send(buf).await.is_ok(),
            None => false,
        };
        if alive {
            return Ok(());
        }
        Err(self.task_error().await)
    }

    async fn task_error(&mut self) -> StorageError {
        self.tx = None;
        if let Some(task) = self.task.take() {
            match task.await {
                Ok(Err(e)) => return e.into(),
                Err(e) => return StorageError::Io(io::Error::other(e.to_string())),
                Ok(Ok(())) => {}
            }
        }
        StorageError::Io(io::Error::other("background writer is gone"))
    }

    async fn join_task(&mut self) -> Result<(), StorageError> {
        self.tx = None;
        if let Some(task) = self.task.take() {
            match task.await {
                Ok(Ok(())) => Ok(()),
                Ok(Err(e)) => Err(e.into()),
                Err(e) => Err(StorageError::Io(io::Error::other(e.to_string()))),
            }
        } else {
            Ok(())
        }
    }

    /// Waits out the queue and atomically publishes the file, enforcing the
    /// overwrite token when one was given.
    pub async fn finish(mut self) -> Result<(), StorageError> {
        if let Err(e) = self.join_task().await {
            let _ = fs::remove_file(&self.tmp_path).await;
            return Err(e);
        }
        let _lock = LockGuard::acquire(&self.root).await?;
        match self.overwrite {
            None => {
                if fs::try_exists(&self.final_path).await? {
                    let _ = fs::remove_file(&self.tmp_path).await;
                    return Err(StorageError::AlreadyExists(self.name.clone()));
                }
            }
            Some(expected) => {
                let current = match OverwriteToken::of(&self.final_path).await {
                    Ok(t) => Some(t),
                    Err(e) if e.kind() == io::ErrorKind::NotFound => None,
                    Err(e) => return Err(e.into()),
                };
                if current != Some(expected) {
                    let _ = fs::remove_file(&self.tmp_path).await;
                    return Err(StorageError::Modified(self.name.clone()));
                }
            }
        }
        fs::rename(&self.tmp_path, &self.final_path).await?;
        Ok(())
    }

    /// Discards the partial file.
    pub async fn abort(mut self) -> Result<(), StorageError> {
        let _ = self.join_task().await;
        let _ = fs::remove_file(&self.tmp_path).await;
        Ok(())
    }
}

impl Drop for FileWriter {
    fn drop(&mut self) {
        // abandoned writers must not leave a partial file behind
        if self.task.is_some() {
            self.tx = None;
            if let Some(task) = self.task.take() {
                task.abort();
            }
            let _ = std::fs::remove_file(&self.tmp_path);
        }
    }
}
