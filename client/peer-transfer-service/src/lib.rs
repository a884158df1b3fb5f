//! Peer-to-peer package transfer.
//!
//! Two stream-oriented exchanges over one listener: a full-content
//! request (`<64-hex-sha256>\n`) and a range request
//! (`<64-hex-sha256><8-byte BE start><8-byte BE end>\n`), both answered
//! with an 8-byte big-endian size word followed by exactly that many
//! payload bytes. A zero size means "not available" and is also the
//! polite reply to malformed or inadmissible requests, so clients can
//! back off instead of seeing an abrupt close.

pub mod client;
pub mod handler;
pub mod wire;

pub use client::{PeerTransferClient, TransferError};
pub use handler::{PeerTransferService, TransferServiceConfig};
pub use wire::TransferRequest;

/// Default cap for a single transfer payload: 500 MiB.
pub const DEFAULT_MAX_TRANSFER_SIZE: u64 = 500 * 1024 * 1024;

/// Default global concurrent-upload admission limit.
pub const DEFAULT_MAX_CONCURRENT_UPLOADS: usize = 20;

/// Default per-peer concurrent-upload admission limit.
pub const DEFAULT_MAX_UPLOADS_PER_PEER: usize = 4;
