//! Peer resource management: who to talk to ([`scorer`]), how fast
//! ([`rate_limit`]) and for how long ([`timeouts`]).

pub mod rate_limit;
pub mod scorer;
pub mod timeouts;

pub use rate_limit::{PeerRateLimiters, RateLimitConfig, RateLimiter};
pub use scorer::{PeerScore, PeerScorer, ScorerConfig};
pub use timeouts::{Operation, TimeoutManager};
