//! Object codec: encrypt, checksum and optionally compress one object.
//!
//! Every object in a volume is stored as one AES-256-CBC ciphertext whose
//! plaintext frame carries, in order: a SHA-256 checksum, a compression flag,
//! a 64-bit big-endian payload length, the (possibly deflated) payload, zero
//! padding up to the next 32-byte multiple, and a fixed 13-byte magic used to
//! detect decryption with the wrong key.
//!
//! The IV is deterministic per object path (`MD5(SALT ‖ path)`): a PUT
//! replaces the whole object, and the same IV is what lets a later open with
//! the same key decrypt it. The `config` object is encrypted under the
//! passphrase-derived key and never compressed; everything else uses the
//! volume data key.

#![deny(unsafe_code)]

use std::borrow::Cow;
use std::io::{self, Write};

use aes::cipher::{block_padding::NoPadding, BlockDecryptMut, BlockEncryptMut, KeyIvInit};
use flate2::write::{ZlibDecoder, ZlibEncoder};
use flate2::Compression;
use md5::Md5;
use sha2::{Digest, Sha256};

use stratus_core::keys::{DataKey, PassKey, KEY_LEN};
use stratus_core::{CONFIG_PATH, CRYPT_MAGIC, SALT};

type Aes256CbcEnc = cbc::Encryptor<aes::Aes256>;
type Aes256CbcDec = cbc::Decryptor<aes::Aes256>;

/// Checksum length inside the frame.
const CHECKSUM_LEN: usize = 32;

/// Checksum + flag byte + big-endian payload length.
const HEADER_LEN: usize = CHECKSUM_LEN + 1 + 8;

/// Frames are padded to a multiple of this. Kept at 32 (not the AES block
/// size) for compatibility with existing volumes; decrypt rejects anything
/// not aligned to it.
const PAD_MULTIPLE: usize = 32;

/// Errors produced while decoding or encoding an object.
#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    /// Structurally invalid ciphertext or frame.
    #[error("decryption of '{0}' failed due to possible corruption")]
    Corrupt(String),
    /// The trailing magic did not match: wrong key or passphrase.
    #[error("decryption of '{0}' failed possibly due to an invalid encryption key (or passphrase)")]
    InvalidKey(String),
    /// The embedded checksum did not match the decoded payload.
    #[error("remote and calculated checksums for object '{0}' don't match")]
    Checksum(String),
    /// A non-config object was processed before the data key was known.
    #[error("no data key available for object '{0}'")]
    NoDataKey(String),
    /// Compression failed while building a frame.
    #[error("compress: {0}")]
    Compress(#[from] io::Error),
}

/// Payload compression applied inside the frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Compressor {
    /// zlib deflate at maximum level, kept only when strictly smaller.
    Deflate,
    /// Store payloads as-is.
    Plain,
}

impl Compressor {
    /// Look up a compressor by the name embedded in a `compress-<name>`
    /// capability tag.
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "deflate" => Some(Self::Deflate),
            "plain" => Some(Self::Plain),
            _ => None,
        }
    }

    /// Pick the compressor from a volume's capability tags. Falls back to
    /// plain when no `compress-*` tag is present.
    pub fn from_requirements<'a, I: IntoIterator<Item = &'a String>>(tags: I) -> Option<Self> {
        for tag in tags {
            if let Some(name) = tag.strip_prefix("compress-") {
                return Self::from_name(name);
            }
        }
        Some(Self::Plain)
    }

    fn compress(self, data: &[u8]) -> io::Result<Vec<u8>> {
        match self {
            Self::Plain => Ok(data.to_vec()),
            Self::Deflate => {
                let mut encoder = ZlibEncoder::new(Vec::new(), Compression::new(9));
                encoder.write_all(data)?;
                encoder.finish()
            }
        }
    }

    fn decompress(data: &[u8]) -> io::Result<Vec<u8>> {
        let mut decoder = ZlibDecoder::new(Vec::new());
        decoder.write_all(data)?;
        decoder.finish()
    }
}

/// Derive the deterministic 128-bit IV for an object path.
pub fn derive_iv(path: &str) -> [u8; 16] {
    let mut hasher = Md5::new();
    hasher.update(SALT);
    hasher.update(path.as_bytes());
    hasher.finalize().into()
}

fn build_checksum(key: &[u8; KEY_LEN], path: &str, data: &[u8]) -> [u8; CHECKSUM_LEN] {
    let mut hasher = Sha256::new();
    hasher.update(SALT);
    hasher.update(key);
    hasher.update(path.as_bytes());
    hasher.update(data);
    hasher.finalize().into()
}

/// Stateless object codec holding the two volume keys.
#[derive(Debug, Clone)]
pub struct Codec {
    pass_key: PassKey,
    data_key: Option<DataKey>,
    compressor: Compressor,
}

impl Codec {
    /// A codec for a volume. `data_key` may be absent during init and
    /// passphrase changes, which only ever touch the `config` object.
    pub fn new(pass_key: PassKey, data_key: Option<DataKey>, compressor: Compressor) -> Self {
        Self { pass_key, data_key, compressor }
    }

    /// Install the data key once the config object has been decoded.
    pub fn set_data_key(&mut self, key: DataKey) {
        self.data_key = Some(key);
    }

    fn key_for(&self, path: &str) -> Result<&[u8; KEY_LEN], CodecError> {
        if path == CONFIG_PATH {
            Ok(self.pass_key.as_bytes())
        } else {
            self.data_key
                .as_ref()
                .map(DataKey::as_bytes)
                .ok_or_else(|| CodecError::NoDataKey(path.to_string()))
        }
    }

    /// Encrypt `data` for storage at `path`.
    ///
    /// Fully deterministic: the same key, path and payload always produce the
    /// same ciphertext.
    pub fn encrypt(&self, path: &str, data: &[u8]) -> Result<Vec<u8>, CodecError> {
        let key = self.key_for(path)?;
        let checksum = build_checksum(key, path, data);

        // The config object must stay readable by older software; never
        // compress it.
        let (flag, payload): (u8, Cow<'_, [u8]>) = if path == CONFIG_PATH {
            (0, Cow::Borrowed(data))
        } else {
            let compressed = self.compressor.compress(data)?;
            if compressed.len() < data.len() {
                (1, Cow::Owned(compressed))
            } else {
                (0, Cow::Borrowed(data))
            }
        };

        let body_len = HEADER_LEN + payload.len() + CRYPT_MAGIC.len();
        let pad_len = (body_len / PAD_MULTIPLE + 1) * PAD_MULTIPLE - body_len;
        let mut frame = Vec::with_capacity(body_len + pad_len);
        frame.extend_from_slice(&checksum);
        frame.push(flag);
        frame.extend_from_slice(&(payload.len() as u64).to_be_bytes());
        frame.extend_from_slice(&payload);
        frame.resize(frame.len() + pad_len, 0);
        frame.extend_from_slice(CRYPT_MAGIC);
        debug_assert_eq!(frame.len() % PAD_MULTIPLE, 0);

        let iv = derive_iv(path);
        let cipher = Aes256CbcEnc::new(key.into(), (&iv).into());
        Ok(cipher.encrypt_padded_vec_mut::<NoPadding>(&frame))
    }

    /// Decrypt the object stored at `path`, returning the original payload.
    pub fn decrypt(&self, path: &str, data: &[u8]) -> Result<Vec<u8>, CodecError> {
        if data.is_empty() || data.len() % PAD_MULTIPLE != 0 {
            return Err(CodecError::Corrupt(path.to_string()));
        }
        let key = self.key_for(path)?;
        let iv = derive_iv(path);
        let cipher = Aes256CbcDec::new(key.into(), (&iv).into());
        let frame = cipher
            .decrypt_padded_vec_mut::<NoPadding>(data)
            .map_err(|_| CodecError::Corrupt(path.to_string()))?;

        if frame.len() < HEADER_LEN + CRYPT_MAGIC.len()
            || &frame[frame.len() - CRYPT_MAGIC.len()..] != CRYPT_MAGIC
        {
            return Err(CodecError::InvalidKey(path.to_string()));
        }

        let checksum = &frame[..CHECKSUM_LEN];
        let flag = frame[CHECKSUM_LEN];
        let mut len_bytes = [0u8; 8];
        len_bytes.copy_from_slice(&frame[CHECKSUM_LEN + 1..HEADER_LEN]);
        let payload_len = usize::try_from(u64::from_be_bytes(len_bytes))
            .map_err(|_| CodecError::Corrupt(path.to_string()))?;

        let end = HEADER_LEN
            .checked_add(payload_len)
            .ok_or_else(|| CodecError::Corrupt(path.to_string()))?;
        if end > frame.len() - CRYPT_MAGIC.len() {
            return Err(CodecError::Corrupt(path.to_string()));
        }
        let raw = &frame[HEADER_LEN..end];

        let payload = if flag == 0 {
            raw.to_vec()
        } else {
            Compressor::decompress(raw).map_err(|_| CodecError::Corrupt(path.to_string()))?
        };

        if checksum != build_checksum(key, path, &payload) {
            return Err(CodecError::Checksum(path.to_string()));
        }
        Ok(payload)
    }
}
