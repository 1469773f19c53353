// src/config/gateway.rs
// Inbound webhook authentication and outbound gateway client configuration.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayConfig {
    pub webhook_shared_secret: String,
    pub send_base_url: String,
    pub send_auth_key: String,
    /// Gateway instance identifiers this process is allowed to deliver to.
    pub allowed_instances: Vec<String>,
    pub startup_deadline_secs: u64,
}

impl GatewayConfig {
    pub fn from_env() -> Self {
        let allowed_instances = super::helpers::env_or("GATEWAY_ALLOWED_INSTANCES", "")
            .split(',')
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect();

        Self {
            webhook_shared_secret: super::helpers::env_or("GATEWAY_WEBHOOK_SECRET", ""),
            send_base_url: super::helpers::env_or(
                "GATEWAY_SEND_BASE_URL",
                "http://localhost:9000",
            ),
            send_auth_key: super::helpers::env_or("GATEWAY_SEND_AUTH_KEY", ""),
            allowed_instances,
            startup_deadline_secs: super::helpers::env_u64("STARTUP_DEADLINE_SECS", 10),
        }
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.webhook_shared_secret.is_empty() {
            return Err(anyhow::anyhow!("GATEWAY_WEBHOOK_SECRET must be set"));
        }
        if self.allowed_instances.is_empty() {
            return Err(anyhow::anyhow!(
                "GATEWAY_ALLOWED_INSTANCES must list at least one gateway instance id"
            ));
        }
        Ok(())
    }
}
