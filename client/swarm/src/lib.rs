//! Swarm integration: the provider-record DHT contract ([`dht`]), node
//! identity and pre-shared-key persistence ([`identity`]), and the
//! bounded announce worker pool with its periodic reannounce pass
//! ([`announce`]).

pub mod announce;
pub mod dht;
pub mod identity;

pub use announce::{AnnounceConfig, AnnouncePool};
pub use dht::{DhtError, MemoryDht, ProviderDht};
pub use identity::{load_or_create_identity, load_or_create_psk, Identity, IdentityError};
