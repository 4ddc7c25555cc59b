//! Repository access: URL parsing, the backend registry, and the encrypted
//! repository facade.

pub mod container;
mod encrypted;
pub mod idx;

use std::path::PathBuf;

pub use encrypted::Repository;

use crate::config::{Config, ConfigError};
use crate::repo::container::ContainerError;
use crate::repo::idx::IdxError;
use crate::storage::{FileStorage, Storage, StorageError};

#[derive(Debug, thiserror::Error)]
pub enum RepoError {
    #[error(transparent)]
    Storage(#[from] StorageError),
    #[error(transparent)]
    Container(#[from] ContainerError),
    #[error(transparent)]
    Idx(#[from] IdxError),
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("{0}")]
    Io(#[from] std::io::Error),
    #[error("{0}")]
    Metadata(#[from] crate::metadata::MetadataError),
    #[error("refs file is corrupt: {0}")]
    BadRefs(String),
    #[error("ref '{refname}' changed concurrently")]
    RefCas { refname: String },
    #[error("ref not found: {0}")]
    RefNotFound(String),
    #[error("unknown object type {0} in pack record")]
    BadObjectType(u8),
    #[error("reading objects requires bup.readkey")]
    ReadKeyRequired,
}

/// The recognized repository address forms.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RepoUrl {
    /// `config:///path/to/repo.conf` — a keyed config file naming the
    /// backend.
    Config(PathBuf),
    /// `reverse://…` — server-side handle for a remote pipe pair.
    Reverse(String),
    /// A plain path: a local git-style repository.
    Local(PathBuf),
}

pub fn parse_url(url: &str) -> RepoUrl {
    if let Some(path) = url.strip_prefix("config://") {
        RepoUrl::Config(PathBuf::from(path))
    } else if let Some(rest) = url.strip_prefix("reverse://") {
        RepoUrl::Reverse(rest.to_string())
    } else {
        RepoUrl::Local(PathBuf::from(url))
    }
}

/// Opens the repository a URL points at. Only `config:` URLs selecting the
/// `Encrypted` backend are handled by this crate; the other forms belong to
/// external collaborators.
pub async fn open_repository(url: &str, create: bool) -> Result<Repository, RepoError> {
    match parse_url(url) {
        RepoUrl::Config(path) => {
            let config = Config::load(&path)?;
            match config.get("bup.type") {
                Some("Encrypted") => Repository::open(config, create).await,
                Some(other) => Err(ConfigError::UnsupportedType(other.to_string()).into()),
                None => Err(ConfigError::Missing("bup.type").into()),
            }
        }
        RepoUrl::Reverse(_) | RepoUrl::Local(_) => {
            Err(ConfigError::UnsupportedUrl(url.to_string()).into())
        }
    }
}

/// Storage backend registry, keyed by `bup.storage`.
pub(crate) async fn storage_from_config(
    config: &Config,
    create: bool,
) -> Result<Storage, RepoError> {
    match config.get("bup.storage").unwrap_or("file") {
        "file" => {
            let path = config
                .get_path("bup.path")
                .ok_or(ConfigError::Missing("bup.path"))?;
            Ok(Storage::File(FileStorage::open(path, create).await?))
        }
        other => Err(ConfigError::UnsupportedStorage(other.to_string()).into()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn url_forms() {
        assert_eq!(
            parse_url("config:///tmp/repo.conf"),
            RepoUrl::Config(PathBuf::from("/tmp/repo.conf"))
        );
        assert_eq!(
            parse_url("reverse://handle"),
            RepoUrl::Reverse("handle".to_string())
        );
        assert_eq!(parse_url("/var/repo"), RepoUrl::Local(PathBuf::from("/var/repo")));
    }

    #[tokio::test]
    async fn unsupported_urls_are_rejected() {
        assert!(matches!(
            open_repository("/plain/path", false).await,
            Err(RepoError::Config(ConfigError::UnsupportedUrl(_)))
        ));
        assert!(matches!(
            open_repository("reverse://x", false).await,
            Err(RepoError::Config(ConfigError::UnsupportedUrl(_)))
        ));
    }
}
