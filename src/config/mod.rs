// src/config/mod.rs
// Central configuration for the receptionist service.

pub mod business;
pub mod gateway;
pub mod helpers;
pub mod llm;
pub mod rate_limit;
pub mod server;
pub mod workflow;

use lazy_static::lazy_static;
use serde::{Deserialize, Serialize};

lazy_static! {
    pub static ref CONFIG: Config = Config::from_env();
}

/// Flat, validated configuration composing all domain configs, per spec §6.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub server: server::ServerConfig,
    pub database: server::DatabaseConfig,
    pub logging: server::LoggingConfig,
    pub hours: business::BusinessHoursConfig,
    pub pricing: business::PricingConfig,
    pub scope: business::ScopeConfig,
    pub llm: llm::LlmConfig,
    pub rate_limit: rate_limit::RateLimitConfig,
    pub workflow: workflow::WorkflowConfig,
    pub outbox: workflow::OutboxConfig,
    pub gateway: gateway::GatewayConfig,
    /// Feature flags: RAG and calendar are optional capabilities (design note §9).
    pub rag_enabled: bool,
    pub calendar_enabled: bool,
}

impl Config {
    pub fn from_env() -> Self {
        dotenv::dotenv().ok();

        Self {
            server: server::ServerConfig::from_env(),
            database: server::DatabaseConfig::from_env(),
            logging: server::LoggingConfig::from_env(),
            hours: business::BusinessHoursConfig::from_env(),
            pricing: business::PricingConfig::from_env(),
            scope: business::ScopeConfig::from_env(),
            llm: llm::LlmConfig::from_env(),
            rate_limit: rate_limit::RateLimitConfig::from_env(),
            workflow: workflow::WorkflowConfig::from_env(),
            outbox: workflow::OutboxConfig::from_env(),
            gateway: gateway::GatewayConfig::from_env(),
            rag_enabled: helpers::env_bool("RAG_ENABLED", false),
            calendar_enabled: helpers::env_bool("CALENDAR_ENABLED", false),
        }
    }

    /// Validate config on startup; invalid configuration is fatal per spec §6/§7.
    pub fn validate(&self) -> anyhow::Result<()> {
        self.llm.validate()?;
        self.gateway.validate()?;
        if self.server.port == 0 {
            return Err(anyhow::anyhow!("RECEPTIONIST_PORT must be non-zero"));
        }
        Ok(())
    }

    pub fn bind_address(&self) -> String {
        self.server.bind_address()
    }
}

impl Default for Config {
    fn default() -> Self {
        Self::from_env()
    }
}
