//! The encrypted file envelope: a sealed or secret-boxed header carrying a
//! per-file key, followed by a sequence of zlib-compressed, secret-boxed
//! objects whose size prefixes are keystream-encrypted. Nonces are derived
//! from the object's file offset, so they are unique by construction; the
//! writer still records them to catch accidental reuse.

use std::collections::HashSet;
use std::io::{self, Read, Write};

use crypto_box::{PublicKey, SecretKey};
use crypto_secretbox::aead::{Aead, KeyInit, OsRng};
use crypto_secretbox::{Key, Nonce, XSalsa20Poly1305};
use flate2::read::ZlibDecoder;
use flate2::write::ZlibEncoder;
use flate2::Compression;
use salsa20::cipher::{KeyIvInit, StreamCipher};
use salsa20::XSalsa20;

use crate::defaults::{MAX_ENC_OBJECT, MAX_ENC_OBJECT_VUINT_LEN};
use crate::keys::SymKey;
use crate::storage::{FileReader, FileWriter, OverwriteToken, Storage, StorageError};
use crate::vint::{self, VuintDecoder};

const MAGIC: &[u8; 4] = b"BUPe";
const NONCE_DATA: u8 = 0x00;
const NONCE_LEN: u8 = 0x80;

#[derive(Debug, thiserror::Error)]
pub enum ContainerError {
    #[error("bad magic in {0}")]
    BadMagic(String),
    #[error("unexpected envelope header in {0}")]
    BadHeader(String),
    #[error("header authentication failed in {0}")]
    HeaderMac(String),
    #[error("wrong file type {found} in {name}")]
    WrongFileType { name: String, found: u8 },
    #[error("object authentication failed in {name} at offset {offset}")]
    Mac { name: String, offset: u64 },
    #[error("oversized object in {name} at offset {offset}")]
    Oversized { name: String, offset: u64 },
    #[error("truncated object in {name} at offset {offset}")]
    Truncated { name: String, offset: u64 },
    #[error("nonce reuse in {0}")]
    NonceReuse(String),
    #[error("sealing the envelope header failed")]
    Seal,
    #[error("{0}")]
    Rng(#[from] getrandom::Error),
    #[error(transparent)]
    Storage(#[from] StorageError),
    #[error("{0}")]
    Io(#[from] io::Error),
}

/// Contents of an encrypted file; data and metadata packs share the `Pack`
/// envelope type.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum FileType {
    Pack = 1,
    Idx = 2,
    Config = 3,
}

impl FileType {
    fn header_alg(self) -> u8 {
        match self {
            FileType::Pack => 1,
            FileType::Idx | FileType::Config => 2,
        }
    }

    /// Length of the encrypted header: 36 inner bytes plus the construction
    /// overhead (sealed box: 32-byte ephemeral key + 16-byte MAC; secret
    /// box: 24-byte nonce + 16-byte MAC).
    fn encrypted_header_len(self) -> usize {
        match self.header_alg() {
            1 => 36 + 32 + 16,
            _ => 36 + 24 + 16,
        }
    }
}

/// Key used to protect the envelope header on write.
pub enum HeaderWriteKey<'a> {
    Sealed(&'a PublicKey),
    Secret(&'a SymKey),
}

/// Key used to open the envelope header on read.
pub enum HeaderReadKey<'a> {
    Sealed(&'a SecretKey),
    Secret(&'a SymKey),
}

fn make_nonce(domain: u8, offset: u64) -> [u8; 24] {
    let mut nonce = [0u8; 24];
    nonce[0] = domain;
    nonce[16..].copy_from_slice(&offset.to_be_bytes());
    nonce
}

fn size_prefix_keystream(filekey: &[u8; 32], offset: u64) -> [u8; MAX_ENC_OBJECT_VUINT_LEN] {
    let nonce = make_nonce(NONCE_LEN, offset);
    let mut keystream = [0u8; MAX_ENC_OBJECT_VUINT_LEN];
    let mut cipher =
        XSalsa20::new_from_slices(filekey, &nonce).expect("fixed key and nonce sizes");
    cipher.apply_keystream(&mut keystream);
    keystream
}

/// Appends encrypted objects to one envelope file.
pub struct ContainerWriter {
    name: String,
    writer: FileWriter,
    cipher: XSalsa20Poly1305,
    filekey: [u8; 32],
    compression: Compression,
    offset: u64,
    used_nonces: HashSet<[u8; 24]>,
}

impl ContainerWriter {
    pub async fn create(
        storage: &Storage,
        name: &str,
        filetype: FileType,
        compression: Compression,
        key: HeaderWriteKey<'_>,
        overwrite: Option<OverwriteToken>,
    ) -> Result<Self, ContainerError> {
        let mut filekey = [0u8; 32];
        getrandom::getrandom(&mut filekey)?;

        let mut inner = Vec::with_capacity(36);
        inner.extend_from_slice(&[1, 1, filetype as u8, 1]);
        inner.extend_from_slice(&filekey);

        let encrypted_header = match key {
            HeaderWriteKey::Sealed(pk) => {
                pk.seal(&mut OsRng, &inner).map_err(|_| ContainerError::Seal)?
            }
            HeaderWriteKey::Secret(k) => {
                let mut nonce = [0u8; 24];
                getrandom::getrandom(&mut nonce)?;
                let cipher = XSalsa20Poly1305::new(Key::from_slice(k));
                let boxed = cipher
                    .encrypt(Nonce::from_slice(&nonce), inner.as_slice())
                    .map_err(|_| ContainerError::Seal)?;
                let mut out = nonce.to_vec();
                out.extend_from_slice(&boxed);
                out
            }
        };
        debug_assert_eq!(encrypted_header.len(), filetype.encrypted_header_len());

        let mut header = Vec::with_capacity(8 + encrypted_header.len());
        header.extend_from_slice(MAGIC);
        header.push(filetype.header_alg());
        header.push(0);
        header.extend_from_slice(&(encrypted_header.len() as u16).to_le_bytes());
        header.extend_from_slice(&encrypted_header);

        let mut writer = storage.get_writer(name, overwrite).await?;
        let offset = header.len() as u64;
        writer.write(header).await?;

        Ok(Self {
            name: name.to_string(),
            writer,
            cipher: XSalsa20Poly1305::new(Key::from_slice(&filekey)),
            filekey,
            compression,
            offset,
            used_nonces: HashSet::new(),
        })
    }

    fn claim_nonce(&mut self, domain: u8, offset: u64) -> Result<[u8; 24], ContainerError> {
        let nonce = make_nonce(domain, offset);
        if !self.used_nonces.insert(nonce) {
            return Err(ContainerError::NonceReuse(self.name.clone()));
        }
        Ok(nonce)
    }

    /// Writes one object record, returning its offset within the file.
    pub async fn write(&mut self, objtype: u8, payload: &[u8]) -> Result<u64, ContainerError> {
        let mut encoder =
            ZlibEncoder::new(Vec::with_capacity(payload.len() / 2 + 64), self.compression);
        encoder.write_all(&[objtype])?;
        encoder.write_all(payload)?;
        let compressed = encoder.finish()?;

        let offset = self.offset;
        let data_nonce = self.claim_nonce(NONCE_DATA, offset)?;
        let ciphertext = self
            .cipher
            .encrypt(Nonce::from_slice(&data_nonce), compressed.as_slice())
            .map_err(|_| ContainerError::Seal)?;
        if ciphertext.len() as u64 > MAX_ENC_OBJECT {
            return Err(ContainerError::Oversized {
                name: self.name.clone(),
                offset,
            });
        }

        self.claim_nonce(NONCE_LEN, offset)?;
        let keystream = size_prefix_keystream(&self.filekey, offset);
        let mut record = vint::encode_vuint(ciphertext.len() as u64);
        for (byte, ks) in record.iter_mut().zip(keystream.iter()) {
            *byte ^= ks;
        }
        record.extend_from_slice(&ciphertext);

        self.offset += record.len() as u64;
        self.writer.write(record).await?;
        Ok(offset)
    }

    /// Bytes emitted so far, header included.
    pub fn size(&self) -> u64 {
        self.offset
    }

    pub async fn finish(self) -> Result<(), ContainerError> {
        self.writer.finish().await?;
        Ok(())
    }

    pub async fn abort(self) -> Result<(), ContainerError> {
        self.writer.abort().await?;
        Ok(())
    }
}

/// Random-access reader over one envelope file.
pub struct ContainerReader {
    name: String,
    reader: FileReader,
    cipher: XSalsa20Poly1305,
    filekey: [u8; 32],
    header_len: u64,
}

impl ContainerReader {
    pub async fn open(
        storage: &Storage,
        name: &str,
        expected: FileType,
        key: HeaderReadKey<'_>,
    ) -> Result<Self, ContainerError> {
        let mut reader = storage.get_reader(name).await?;

        let bad_header = || ContainerError::BadHeader(name.to_string());
        let mut fixed = [0u8; 8];
        reader
            .read_exact(&mut fixed)
            .await
            .map_err(|_| bad_header())?;
        if &fixed[..4] != MAGIC {
            return Err(ContainerError::BadMagic(name.to_string()));
        }
        let (alg, reserved) = (fixed[4], fixed[5]);
        let eh_len = u16::from_le_bytes([fixed[6], fixed[7]]) as usize;
        if alg != expected.header_alg()
            || reserved != 0
            || eh_len != expected.encrypted_header_len()
        {
            return Err(bad_header());
        }

        let mut encrypted_header = vec![0u8; eh_len];
        reader
            .read_exact(&mut encrypted_header)
            .await
            .map_err(|_| bad_header())?;
        let inner = match key {
            HeaderReadKey::Sealed(sk) => sk
                .unseal(&encrypted_header)
                .map_err(|_| ContainerError::HeaderMac(name.to_string()))?,
            HeaderReadKey::Secret(k) => {
                let cipher = XSalsa20Poly1305::new(Key::from_slice(k));
                cipher
                    .decrypt(
                        Nonce::from_slice(&encrypted_header[..24]),
                        &encrypted_header[24..],
                    )
                    .map_err(|_| ContainerError::HeaderMac(name.to_string()))?
            }
        };
        if inner.len() != 36 || inner[0] != 1 || inner[1] != 1 || inner[3] != 1 {
            return Err(bad_header());
        }
        if inner[2] != expected as u8 {
            return Err(ContainerError::WrongFileType {
                name: name.to_string(),
                found: inner[2],
            });
        }
        let mut filekey = [0u8; 32];
        filekey.copy_from_slice(&inner[4..36]);

        Ok(Self {
            name: name.to_string(),
            reader,
            cipher: XSalsa20Poly1305::new(Key::from_slice(&filekey)),
            filekey,
            header_len: (8 + eh_len) as u64,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Identity token of the underlying file, for compare-and-swap rewrites.
    pub fn token(&self) -> OverwriteToken {
        self.reader.token()
    }

    /// Reads the first (for idx/config files, the only) object.
    pub async fn read_first(&mut self) -> Result<(u8, Vec<u8>), ContainerError> {
        self.read_at(self.header_len).await
    }

    /// Reads the object stored at `offset`.
    pub async fn read_at(&mut self, offset: u64) -> Result<(u8, Vec<u8>), ContainerError> {
        let truncated = |name: &str| ContainerError::Truncated {
            name: name.to_string(),
            offset,
        };

        self.reader.seek(offset).await?;
        let mut prefix = [0u8; MAX_ENC_OBJECT_VUINT_LEN];
        self.reader
            .read_exact(&mut prefix)
            .await
            .map_err(|_| truncated(&self.name.clone()))?;

        let keystream = size_prefix_keystream(&self.filekey, offset);
        let mut decoder = VuintDecoder::new();
        let mut size = None;
        for (byte, ks) in prefix.iter().zip(keystream.iter()) {
            if let Some(value) = decoder.feed(byte ^ ks) {
                size = Some(value);
                break;
            }
        }
        let size = size.ok_or(ContainerError::Oversized {
            name: self.name.clone(),
            offset,
        })?;
        if size > MAX_ENC_OBJECT {
            return Err(ContainerError::Oversized {
                name: self.name.clone(),
                offset,
            });
        }

        let mut ciphertext = Vec::with_capacity(size as usize);
        ciphertext.extend_from_slice(&prefix[decoder.consumed()..]);
        if ciphertext.len() < size as usize {
            let mut rest = vec![0u8; size as usize - ciphertext.len()];
            self.reader
                .read_exact(&mut rest)
                .await
                .map_err(|_| truncated(&self.name.clone()))?;
            ciphertext.extend_from_slice(&rest);
        } else {
            ciphertext.truncate(size as usize);
        }

        let data_nonce = make_nonce(NONCE_DATA, offset);
        let compressed = self
            .cipher
            .decrypt(Nonce::from_slice(&data_nonce), ciphertext.as_slice())
            .map_err(|_| ContainerError::Mac {
                name: self.name.clone(),
                offset,
            })?;

        let mut decoder = ZlibDecoder::new(compressed.as_slice());
        let mut data = Vec::new();
        decoder.read_to_end(&mut data)?;
        if data.is_empty() {
            return Err(truncated(&self.name.clone()));
        }
        let payload = data.split_off(1);
        Ok((data[0], payload))
    }
}
