//! Package retrieval: HTTP mirror fetching with retry and stats
//! ([`mirror`]), chunk sources over peers and mirrors ([`source`]), the
//! parallel chunked downloader with hash verification ([`parallel`]),
//! request coalescing ([`coalesce`]) and optional resume state
//! ([`resume`]).

pub mod coalesce;
pub mod mirror;
pub mod parallel;
pub mod resume;
pub mod source;

pub use coalesce::Coalescer;
pub use mirror::{FetchError, MirrorConfig, MirrorFetcher, MirrorStats};
pub use parallel::{DownloadError, DownloadResult, DownloaderConfig, ParallelDownloader};
pub use resume::{DirStateStore, DownloadStateStore};
pub use source::{ChunkSource, ChunkSourceKind, MirrorSource, PeerSource, SourceError};

/// Default cap for a mirror response body: 500 MiB.
pub const DEFAULT_MAX_RESPONSE_SIZE: u64 = 500 * 1024 * 1024;
