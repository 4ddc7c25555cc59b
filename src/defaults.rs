//! Contains the default values for the configuration and various constants.

/// Number of low rolling-hash bits that must match for a chunk boundary,
/// giving an expected chunk size of 8 KiB.
pub const BLOBBITS: u32 = 13;

/// Splitter bits used when hash-splitting tree entry names.
pub const TREE_BLOBBITS: u32 = 13;

/// Default fanout of the chunk tree (one extra tree level per `log2(fanout)`
/// matched bits).
pub const DEFAULT_FANOUT: u32 = 16;

/// Hard cap on entries per tree node in the chunk tree builder.
pub const MAX_PER_TREE: usize = 256;

/// Size of the rolling checksum window in bytes.
pub const ROLLSUM_WINDOW: usize = 64;

/// Default pack rotation threshold in bytes.
pub const MAX_PACK_SIZE: u64 = 1_000_000_000;

/// The most we are willing to store as a single object, after compression
/// and encryption.
pub const MAX_ENC_OBJECT: u64 = 1024 * 1024 * 1024;

/// Longest possible encrypted size prefix (the vuint of `MAX_ENC_OBJECT`).
pub const MAX_ENC_OBJECT_VUINT_LEN: usize = 5;

/// Name of the refs object in the backend, unless overridden by
/// `bup.refsname`.
pub const REFSNAME: &str = "refs";

/// File name of the merged index inside the cache directory.
pub const MIDX_NAME: &str = "cache.midx";

/// Suffix of encrypted pack files in the backend.
pub const ENCPACK_SUFFIX: &str = ".encpack";

/// Suffix of encrypted idx files in the backend.
pub const ENCIDX_SUFFIX: &str = ".encidx";

/// Suffix of plaintext idx files in the local cache.
pub const IDX_SUFFIX: &str = ".idx";
