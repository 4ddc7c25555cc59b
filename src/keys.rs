//! Repository key material: the symmetric repo key plus the asymmetric
//! data keypair (public write half, secret read half).

use crypto_box::{PublicKey, SecretKey};

use crate::config::{Config, ConfigError};

/// The type for a 32-byte symmetric key.
pub type SymKey = [u8; 32];

/// Keys loaded from the repository configuration.
///
/// The repo key is always required (refs, idx and config files). The write
/// key alone yields an append-only repository; the read key implies the
/// write key.
pub struct RepoKeys {
    pub repokey: SymKey,
    pub writekey: PublicKey,
    pub readkey: Option<SecretKey>,
}

impl std::fmt::Debug for RepoKeys {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "RepoKeys")
    }
}

impl RepoKeys {
    pub fn from_config(cfg: &Config) -> Result<Self, ConfigError> {
        let repokey = cfg
            .get_key32("bup.repokey")?
            .ok_or(ConfigError::Missing("bup.repokey"))?;
        let readkey = cfg.get_key32("bup.readkey")?.map(SecretKey::from);
        let writekey = match (cfg.get_key32("bup.writekey")?, &readkey) {
            (Some(pk), Some(sk)) => {
                let derived = sk.public_key();
                if derived.as_bytes() != &pk {
                    return Err(ConfigError::Invalid {
                        key: "bup.writekey".to_string(),
                        reason: "does not match bup.readkey".to_string(),
                    });
                }
                derived
            }
            (Some(pk), None) => PublicKey::from(pk),
            (None, Some(sk)) => sk.public_key(),
            (None, None) => return Err(ConfigError::Missing("bup.writekey")),
        };
        Ok(Self {
            repokey,
            writekey,
            readkey,
        })
    }
}

/// Freshly generated key material, hex-encoded for the config file.
pub struct GeneratedKeys {
    pub repokey: String,
    pub writekey: String,
    pub readkey: String,
}

/// Generates a new repo key and data keypair.
pub fn generate_keys() -> Result<GeneratedKeys, getrandom::Error> {
    let mut repokey: SymKey = Default::default();
    getrandom::getrandom(&mut repokey)?;
    let mut seed: SymKey = Default::default();
    getrandom::getrandom(&mut seed)?;
    let readkey = SecretKey::from(seed);
    let writekey = readkey.public_key();
    Ok(GeneratedKeys {
        repokey: hex::encode(repokey),
        writekey: hex::encode(writekey.as_bytes()),
        readkey: hex::encode(readkey.to_bytes()),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::Path;

    fn cfg(text: &str) -> Config {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("repo.conf");
        std::fs::write(&path, text).unwrap();
        Config::load(Path::new(&path)).unwrap()
    }

    #[test]
    fn readkey_implies_writekey() {
        let keys = generate_keys().unwrap();
        let loaded = RepoKeys::from_config(&cfg(&format!(
            "[bup]\nrepokey = {}\nreadkey = {}\n",
            keys.repokey, keys.readkey
        )))
        .unwrap();
        assert_eq!(hex::encode(loaded.writekey.as_bytes()), keys.writekey);
        assert!(loaded.readkey.is_some());
    }

    #[test]
    fn writekey_only_is_append_only() {
        let keys = generate_keys().unwrap();
        let loaded = RepoKeys::from_config(&cfg(&format!(
            "[bup]\nrepokey = {}\nwritekey = {}\n",
            keys.repokey, keys.writekey
        )))
        .unwrap();
        assert!(loaded.readkey.is_none());
    }

    #[test]
    fn mismatched_keypair_is_rejected() {
        let a = generate_keys().unwrap();
        let b = generate_keys().unwrap();
        let err = RepoKeys::from_config(&cfg(&format!(
            "[bup]\nrepokey = {}\nwritekey = {}\nreadkey = {}\n",
            a.repokey, a.writekey, b.readkey
        )));
        assert!(err.is_err());
    }

    #[test]
    fn repokey_is_required() {
        let keys = generate_keys().unwrap();
        assert!(RepoKeys::from_config(&cfg(&format!(
            "[bup]\nwritekey = {}\n",
            keys.writekey
        )))
        .is_err());
    }
}
