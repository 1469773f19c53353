// src/config/rate_limit.rs
// Per-peer and global inbound rate limiting (C2 preprocessor gate).

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitConfig {
    pub per_peer_per_minute: u32,
    pub per_peer_burst: u32,
    pub global_per_minute: u32,
}

impl RateLimitConfig {
    pub fn from_env() -> Self {
        Self {
            per_peer_per_minute: super::helpers::env_usize("RATE_LIMIT_PER_PEER_PER_MIN", 10) as u32,
            per_peer_burst: super::helpers::env_usize("RATE_LIMIT_PER_PEER_BURST", 3) as u32,
            global_per_minute: super::helpers::env_usize("RATE_LIMIT_GLOBAL_PER_MIN", 600) as u32,
        }
    }
}
