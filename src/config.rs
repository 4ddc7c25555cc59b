//! Repository configuration: a git-style keyed config file
//! (`[section]` headers with `key = value` lines), addressed as
//! `section.key`.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("cannot read config file {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("malformed config line {line} in {path}")]
    Parse { path: PathBuf, line: usize },
    #[error("missing required config key '{0}'")]
    Missing(&'static str),
    #[error("invalid value for config key '{key}': {reason}")]
    Invalid { key: String, reason: String },
    #[error("unsupported repository type '{0}'")]
    UnsupportedType(String),
    #[error("unsupported storage backend '{0}'")]
    UnsupportedStorage(String),
    #[error("unsupported repository url '{0}'")]
    UnsupportedUrl(String),
}

/// Parsed repository configuration.
#[derive(Clone, Debug)]
pub struct Config {
    path: PathBuf,
    values: HashMap<String, String>,
}

impl Config {
    /// Loads and parses the config file at `path`.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_owned(),
            source,
        })?;
        Self::parse(path, &text)
    }

    fn parse(path: &Path, text: &str) -> Result<Self, ConfigError> {
        let mut values = HashMap::new();
        let mut section = String::new();
        for (lineno, raw) in text.lines().enumerate() {
            let line = raw.trim();
            if line.is_empty() || line.starts_with('#') || line.starts_with(';') {
                continue;
            }
            if let Some(rest) = line.strip_prefix('[') {
                let inner = rest.strip_suffix(']').ok_or(ConfigError::Parse {
                    path: path.to_owned(),
                    line: lineno + 1,
                })?;
                section = inner.trim().to_ascii_lowercase();
                continue;
            }
            let (key, value) = match line.split_once('=') {
                Some((k, v)) => (k.trim(), v.trim()),
                // a bare key means boolean true, like git
                None => (line, "true"),
            };
            if key.is_empty() || section.is_empty() {
                return Err(ConfigError::Parse {
                    path: path.to_owned(),
                    line: lineno + 1,
                });
            }
            let value = value.trim_matches('"');
            values.insert(
                format!("{section}.{}", key.to_ascii_lowercase()),
                value.to_string(),
            );
        }
        Ok(Self {
            path: path.to_owned(),
            values,
        })
    }

    /// Path of the config file itself.
    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.values.get(&key.to_ascii_lowercase()).map(String::as_str)
    }

    /// Boolean per git's rules: true/yes/on/1 or false/no/off/0.
    pub fn get_bool(&self, key: &str) -> Result<Option<bool>, ConfigError> {
        match self.get(key) {
            None => Ok(None),
            Some(v) => match v.to_ascii_lowercase().as_str() {
                "true" | "yes" | "on" | "1" => Ok(Some(true)),
                "false" | "no" | "off" | "0" | "" => Ok(Some(false)),
                other => Err(ConfigError::Invalid {
                    key: key.to_string(),
                    reason: format!("'{other}' is not a boolean"),
                }),
            },
        }
    }

    /// Integer with optional k/m/g (binary) suffix.
    pub fn get_int(&self, key: &str) -> Result<Option<i64>, ConfigError> {
        let Some(v) = self.get(key) else {
            return Ok(None);
        };
        let (digits, mult) = match v.chars().last() {
            Some('k' | 'K') => (&v[..v.len() - 1], 1i64 << 10),
            Some('m' | 'M') => (&v[..v.len() - 1], 1 << 20),
            Some('g' | 'G') => (&v[..v.len() - 1], 1 << 30),
            _ => (v, 1),
        };
        digits
            .parse::<i64>()
            .map(|n| Some(n * mult))
            .map_err(|_| ConfigError::Invalid {
                key: key.to_string(),
                reason: format!("'{v}' is not an integer"),
            })
    }

    /// Path value, resolved relative to the config file's directory.
    pub fn get_path(&self, key: &str) -> Option<PathBuf> {
        self.get(key).map(|v| {
            let p = PathBuf::from(v);
            if p.is_absolute() {
                p
            } else {
                self.path.parent().unwrap_or(Path::new(".")).join(p)
            }
        })
    }

    /// A 32-byte hex-encoded key.
    pub fn get_key32(&self, key: &str) -> Result<Option<[u8; 32]>, ConfigError> {
        let Some(v) = self.get(key) else {
            return Ok(None);
        };
        let mut out = [0u8; 32];
        hex::decode_to_slice(v, &mut out).map_err(|_| ConfigError::Invalid {
            key: key.to_string(),
            reason: "expected 64 hex digits".to_string(),
        })?;
        Ok(Some(out))
    }
}
