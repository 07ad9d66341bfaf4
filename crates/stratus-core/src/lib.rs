//! Stratus core primitives and shared types.
//!
//! Everything here is part of the on-disk volume format: the salt and key
//! verification magic, the passphrase key schedule, and the JSON config
//! object stored at path `config`. Changing any constant in this crate
//! breaks compatibility with existing volumes.

#![deny(unsafe_code)]

/// Version of the stratus core library.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// 64-byte salt mixed into every checksum, IV and derived key.
pub const SALT: [u8; 64] = [
    0xbe, 0xee, 0x0f, 0xac, 0x81, 0xb9, 0x78, 0x37, 0x6e, 0xce, 0xd6, 0xd0, 0xdf, 0x63, 0xc8,
    0x11, 0x91, 0x2b, 0x9d, 0x32, 0x26, 0xe5, 0x14, 0x3c, 0x4f, 0x0b, 0xab, 0x79, 0x46, 0x5b,
    0xea, 0xdc, 0x41, 0xc8, 0x5c, 0x8c, 0xae, 0x7a, 0x26, 0xf8, 0xb9, 0x48, 0xcc, 0xe4, 0xf5,
    0x9b, 0x73, 0xc0, 0xba, 0xab, 0xf0, 0x1b, 0xb4, 0xdb, 0xf6, 0x54, 0xe9, 0xe2, 0xc1, 0xc3,
    0x52, 0x5d, 0xc0, 0xd1,
];

/// Trailing magic appended to every plaintext frame before encryption.
/// A mismatch after decryption means the wrong key was used.
pub const CRYPT_MAGIC: &[u8; 13] = b"C10Ud-LiC1ou5";

/// Object path of the volume metadata object.
pub const CONFIG_PATH: &str = "config";

/// Key prefix under which block objects are stored.
pub const BLOCKS_PREFIX: &str = "blocks/";

/// Default virtual block size in bytes.
pub const DEFAULT_BLOCK_SIZE: u32 = 1 << 16;

/// Default TCP port the NBD server listens on.
pub const DEFAULT_PORT: u16 = 7323;

/// Default in-memory cache budget in bytes.
pub const DEFAULT_TOTAL_CACHE: u64 = 1 << 24;

/// Fraction of the cache budget dedicated to the dirty (write) queue.
pub const WRITE_TO_TOTAL_CACHE_RATIO: f64 = 0.5;

/// Fraction of the write queue that must fill before workers start draining.
pub const WRITE_QUEUE_TO_FLUSH_RATIO: f64 = 0.7;

/// Default number of upload worker threads.
pub const DEFAULT_WRITER_THREADS: usize = 10;

/// Default number of bulk-delete worker threads.
pub const DEFAULT_DELETE_THREADS: usize = 30;

/// Default number of blocks prefetched after a sequential read.
pub const DEFAULT_READ_AHEAD: usize = 3;

/// Object path for the block with the given index.
pub fn block_path(index: u64) -> String {
    format!("{BLOCKS_PREFIX}{index}")
}

/// Parse a `blocks/<N>` object path back into a block index.
///
/// Returns `None` for anything else, including indices with leading zeros
/// (the writer never produces them).
pub fn parse_block_path(path: &str) -> Option<u64> {
    let digits = path.strip_prefix(BLOCKS_PREFIX)?;
    if digits.is_empty() || (digits.len() > 1 && digits.starts_with('0')) {
        return None;
    }
    if !digits.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    digits.parse().ok()
}

/// Render a byte count the way the stat reporter does.
pub fn size_to_hum(size: u64) -> String {
    #[allow(clippy::cast_precision_loss)]
    let s = size as f64;
    if size < 1_100 {
        format!("{size} B")
    } else if size < 1_100_000 {
        format!("{:.1} KB", s / 1e3)
    } else if size < 1_100_000_000 {
        format!("{:.1} MB", s / 1e6)
    } else if size < 1_100_000_000_000 {
        format!("{:.1} GB", s / 1e9)
    } else if size < 1_100_000_000_000_000 {
        format!("{:.1} TB", s / 1e12)
    } else {
        format!("{:.1} PB", s / 1e15)
    }
}

pub mod keys {
    //! Key schedule: passphrase-derived key and the per-volume data key.

    use super::SALT;
    use rand::rngs::OsRng;
    use rand::RngCore;
    use sha2::{Digest, Sha256};

    /// Length in bytes of both key kinds.
    pub const KEY_LEN: usize = 32;

    /// Key derived from the user passphrase; encrypts only the `config`
    /// object.
    #[derive(Clone, PartialEq, Eq)]
    pub struct PassKey([u8; KEY_LEN]);

    /// Randomly generated volume data key; encrypts every block object.
    #[derive(Clone, PartialEq, Eq)]
    pub struct DataKey([u8; KEY_LEN]);

    impl PassKey {
        /// Raw key bytes.
        pub fn as_bytes(&self) -> &[u8; KEY_LEN] {
            &self.0
        }
    }

    impl DataKey {
        /// Draw a fresh key from the OS CSPRNG.
        pub fn generate() -> Self {
            let mut key = [0u8; KEY_LEN];
            OsRng.fill_bytes(&mut key);
            Self(key)
        }

        /// Rebuild a key from its hex encoding in the config object.
        pub fn from_hex(s: &str) -> Result<Self, hex::FromHexError> {
            let raw = hex::decode(s)?;
            let key: [u8; KEY_LEN] =
                raw.try_into().map_err(|_| hex::FromHexError::InvalidStringLength)?;
            Ok(Self(key))
        }

        /// Hex encoding stored in the config object.
        pub fn to_hex(&self) -> String {
            hex::encode(self.0)
        }

        /// Raw key bytes.
        pub fn as_bytes(&self) -> &[u8; KEY_LEN] {
            &self.0
        }
    }

    impl From<[u8; KEY_LEN]> for DataKey {
        fn from(key: [u8; KEY_LEN]) -> Self {
            Self(key)
        }
    }

    // Key material stays out of logs and error messages.
    impl std::fmt::Debug for PassKey {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            f.write_str("PassKey(..)")
        }
    }

    impl std::fmt::Debug for DataKey {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            f.write_str("DataKey(..)")
        }
    }

    /// Map a passphrase to its encryption key: `SHA-256(SALT ‖ passphrase)`.
    pub fn derive_pass_key(passphrase: &str) -> PassKey {
        let mut hasher = Sha256::new();
        hasher.update(SALT);
        hasher.update(passphrase.as_bytes());
        PassKey(hasher.finalize().into())
    }

}

pub mod config {
    //! The JSON volume metadata stored encrypted at object path `config`.

    use super::keys::DataKey;
    use serde::{Deserialize, Serialize};
    use std::collections::BTreeSet;

    /// Errors from encoding or decoding the config object.
    #[derive(Debug, thiserror::Error)]
    pub enum ConfigError {
        /// JSON encoding or decoding failed.
        #[error("serialize: {0}")]
        Serialize(#[from] serde_json::Error),
        /// The stored data key is not 32 hex-encoded bytes.
        #[error("invalid data key in config: {0}")]
        BadDataKey(hex::FromHexError),
    }

    /// Capability tags this implementation can honor.
    pub fn supported_capabilities() -> BTreeSet<String> {
        ["compress-deflate", "compress-plain"].iter().map(|s| (*s).to_string()).collect()
    }

    /// Capability tag written by `init`.
    pub const DEFAULT_CAPABILITY: &str = "compress-deflate";

    /// Volume metadata. Unknown keys written by newer software are carried
    /// through rewrites untouched.
    #[derive(Debug, Clone, Serialize, Deserialize)]
    pub struct VolumeConfig {
        /// Virtual disk length in bytes.
        pub size: u64,
        /// Block size in bytes; fixed at init.
        pub bs: u32,
        /// Hex-encoded 32-byte volume data key.
        pub crypt_key: String,
        /// Capability tags a reader must support to use this volume.
        pub requires: BTreeSet<String>,
        /// Present when the volume is mid-deletion and must not be opened.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        pub deleted: Option<bool>,
        /// Fields this version does not know about.
        #[serde(flatten)]
        pub extra: serde_json::Map<String, serde_json::Value>,
    }

    impl VolumeConfig {
        /// Build the config written by `init`.
        pub fn new(size: u64, bs: u32, data_key: &DataKey) -> Self {
            Self {
                size,
                bs,
                crypt_key: data_key.to_hex(),
                requires: [DEFAULT_CAPABILITY.to_string()].into_iter().collect(),
                deleted: None,
                extra: serde_json::Map::new(),
            }
        }

        /// Encode to the JSON bytes that get encrypted and stored.
        pub fn to_json(&self) -> Result<Vec<u8>, ConfigError> {
            Ok(serde_json::to_vec(self)?)
        }

        /// Decode from decrypted config bytes.
        pub fn from_json(raw: &[u8]) -> Result<Self, ConfigError> {
            Ok(serde_json::from_slice(raw)?)
        }

        /// Decode the volume data key.
        pub fn data_key(&self) -> Result<DataKey, ConfigError> {
            DataKey::from_hex(&self.crypt_key).map_err(ConfigError::BadDataKey)
        }

        /// Whether the volume is marked for deletion. Presence of the key is
        /// what counts, matching what older writers produced.
        pub fn is_deleted(&self) -> bool {
            self.deleted.is_some()
        }

        /// Capability tags required by this volume that we do not support.
        pub fn unsupported_requirements(&self) -> Vec<String> {
            let supported = supported_capabilities();
            self.requires.iter().filter(|r| !supported.contains(*r)).cloned().collect()
        }
    }

}
