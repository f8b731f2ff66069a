//! Peer freshness, TCP reachability and clock-offset tracking (§4.4, C4).
//!
//! Each tracker runs its own interval loop the way `garage_rpc::system`
//! runs `status_exchange_loop`/`discovery_loop`: a `watch::Receiver<bool>`
//! stop signal raced against `tokio::time::sleep_until` in a `select!`,
//! so a caller can shut every loop down promptly without polling.

pub mod freshness;
pub mod ntp;
pub mod ping;

pub use freshness::{FreshnessSnapshot, FreshnessTracker};
pub use ntp::{NtpChecker, NtpPhase, NtpStatus};
pub use ping::{PingSnapshot, PingTracker};
