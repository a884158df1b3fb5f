//! Content-addressed package blob store.
//!
//! The cache is the single authority for blob state: blobs are keyed by
//! their SHA-256 fingerprint, created through [`traits::PackageCache::put`]
//! (which hashes while reading and rejects mismatches), and protected
//! from deletion while any reader is live.

pub mod error;
pub mod fs;
pub mod in_memory;
pub mod traits;

pub use error::CacheError;
pub use fs::FsPackageCache;
pub use in_memory::MemoryPackageCache;
pub use traits::{BlobReader, CachedBlobMeta, PackageCache};
