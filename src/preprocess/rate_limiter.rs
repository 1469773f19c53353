// src/preprocess/rate_limiter.rs
// Per-peer and global inbound throttling (spec §4.2 step 3). Adapted from
// the teacher's utils/rate_limiter.rs: same governor/Jitter wiring, extended
// with a per-peer registry (the teacher only ever needed one global limiter).

use std::collections::HashMap;
use std::num::NonZeroU32;
use std::sync::Arc;
use std::time::Duration;

use governor::clock::DefaultClock;
use governor::state::{InMemoryState, NotKeyed};
use governor::{Jitter, Quota, RateLimiter as GovRateLimiter};
use parking_lot::RwLock;

type DirectLimiter = GovRateLimiter<NotKeyed, InMemoryState, DefaultClock>;

fn build_limiter(per_minute: u32, burst: u32) -> anyhow::Result<DirectLimiter> {
    let rate = NonZeroU32::new(per_minute).ok_or_else(|| anyhow::anyhow!("rate must be > 0"))?;
    let burst = NonZeroU32::new(burst.max(1)).unwrap();
    let quota = Quota::per_minute(rate).allow_burst(burst);
    Ok(GovRateLimiter::direct(quota))
}

/// Tracks one token bucket per peer plus a single global bucket, per spec §4.2.
pub struct PeerRateLimiter {
    per_peer_per_minute: u32,
    per_peer_burst: u32,
    peers: RwLock<HashMap<String, Arc<DirectLimiter>>>,
    global: Arc<DirectLimiter>,
    jitter: Jitter,
}

impl PeerRateLimiter {
    pub fn new(per_peer_per_minute: u32, per_peer_burst: u32, global_per_minute: u32) -> Self {
        Self {
            per_peer_per_minute,
            per_peer_burst,
            peers: RwLock::new(HashMap::new()),
            global: Arc::new(
                build_limiter(global_per_minute, global_per_minute).expect("global quota is valid"),
            ),
            jitter: Jitter::new(Duration::from_millis(5), Duration::from_millis(50)),
        }
    }

    fn peer_limiter(&self, peer_id: &str) -> Arc<DirectLimiter> {
        if let Some(limiter) = self.peers.read().get(peer_id) {
            return limiter.clone();
        }
        let mut peers = self.peers.write();
        peers
            .entry(peer_id.to_string())
            .or_insert_with(|| {
                Arc::new(
                    build_limiter(self.per_peer_per_minute, self.per_peer_burst)
                        .expect("peer quota is valid"),
                )
            })
            .clone()
    }

    /// Non-blocking admission check: true if both the peer's bucket and the
    /// global bucket have capacity right now. Never awaits (spec §4.2: drops
    /// are observable but never throw upward, and must not stall the worker).
    pub fn try_admit(&self, peer_id: &str) -> bool {
        let peer = self.peer_limiter(peer_id);
        peer.check().is_ok() && self.global.check().is_ok()
    }

    #[allow(dead_code)]
    pub async fn wait_for_admission(&self, peer_id: &str) {
        let peer = self.peer_limiter(peer_id);
        peer.until_ready_with_jitter(self.jitter).await;
        self.global.until_ready_with_jitter(self.jitter).await;
    }
}
