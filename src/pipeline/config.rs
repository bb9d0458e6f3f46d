//! Pipeline configuration from environment variables
//!
//! Process-level settings only (paths, endpoints, credentials, timeouts).
//! Thresholds, budgets and feature flags are persisted in `pipeline_settings`
//! and edited at runtime, see `settings.rs`.

use crate::pipeline::error::PipelineError;
use std::env;
use std::time::Duration;

/// Configuration for the pipeline runtime
///
/// Loaded from environment variables with sensible defaults.
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    /// Path to SQLite database file
    pub db_path: String,

    /// Directory holding the `*.sql` schema files
    pub schema_dir: String,

    pub dexscreener_base_url: String,

    /// DexScreener request quota (requests per minute)
    pub dexscreener_requests_per_minute: u32,

    /// Chain id used to filter DexScreener listings
    pub chain: String,

    /// Helius API key (required for enrichment)
    pub helius_api_key: Option<String>,

    pub helius_rpc_url: String,

    /// Endpoint of the full-analysis workflow
    pub analysis_url: String,

    /// Per-request HTTP timeout in seconds
    pub http_timeout_secs: u64,

    /// Soft deadline for a single run in seconds
    pub run_soft_deadline_secs: u64,

    /// Master enable flag for recurring triggers
    pub scheduler_enabled: bool,
}

impl PipelineConfig {
    /// Load configuration from environment variables
    ///
    /// Environment variables:
    /// - `TIERFLOW_DB_PATH` (default: tierflow.db)
    /// - `TIERFLOW_SCHEMA_DIR` (default: sql)
    /// - `DEXSCREENER_BASE_URL` (default: https://api.dexscreener.com)
    /// - `DEXSCREENER_REQUESTS_PER_MINUTE` (default: 60)
    /// - `DEXSCREENER_CHAIN` (default: solana)
    /// - `HELIUS_API_KEY` (no default)
    /// - `HELIUS_RPC_URL` (default: https://mainnet.helius-rpc.com)
    /// - `ANALYSIS_URL` (default: http://localhost:5003/analysis/run)
    /// - `HTTP_TIMEOUT_SECS` (default: 15)
    /// - `RUN_SOFT_DEADLINE_SECS` (default: 900)
    /// - `ENABLE_SCHEDULER` (default: false)
    pub fn from_env() -> Self {
        Self {
            db_path: env::var("TIERFLOW_DB_PATH").unwrap_or_else(|_| "tierflow.db".to_string()),

            schema_dir: env::var("TIERFLOW_SCHEMA_DIR").unwrap_or_else(|_| "sql".to_string()),

            dexscreener_base_url: env::var("DEXSCREENER_BASE_URL")
                .unwrap_or_else(|_| "https://api.dexscreener.com".to_string()),

            dexscreener_requests_per_minute: env::var("DEXSCREENER_REQUESTS_PER_MINUTE")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(60),

            chain: env::var("DEXSCREENER_CHAIN").unwrap_or_else(|_| "solana".to_string()),

            helius_api_key: env::var("HELIUS_API_KEY").ok().filter(|k| !k.is_empty()),

            helius_rpc_url: env::var("HELIUS_RPC_URL")
                .unwrap_or_else(|_| "https://mainnet.helius-rpc.com".to_string()),

            analysis_url: env::var("ANALYSIS_URL")
                .unwrap_or_else(|_| "http://localhost:5003/analysis/run".to_string()),

            http_timeout_secs: env::var("HTTP_TIMEOUT_SECS")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(15),

            run_soft_deadline_secs: env::var("RUN_SOFT_DEADLINE_SECS")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(900),

            scheduler_enabled: env::var("ENABLE_SCHEDULER")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(false),
        }
    }

    pub fn http_timeout(&self) -> Duration {
        Duration::from_secs(self.http_timeout_secs)
    }

    pub fn run_soft_deadline(&self) -> Duration {
        Duration::from_secs(self.run_soft_deadline_secs)
    }

    pub fn require_helius_key(&self) -> Result<&str, PipelineError> {
        self.helius_api_key
            .as_deref()
            .ok_or_else(|| PipelineError::Config("HELIUS_API_KEY must be set".to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const VARS: [&str; 5] = [
        "TIERFLOW_DB_PATH",
        "DEXSCREENER_REQUESTS_PER_MINUTE",
        "HELIUS_API_KEY",
        "RUN_SOFT_DEADLINE_SECS",
        "ENABLE_SCHEDULER",
    ];

    #[test]
    fn test_default_and_custom_config() {
        // Single test so env mutations don't race across test threads
        for var in VARS {
            env::remove_var(var);
        }

        let config = PipelineConfig::from_env();

        assert_eq!(config.db_path, "tierflow.db");
        assert_eq!(config.dexscreener_requests_per_minute, 60);
        assert_eq!(config.run_soft_deadline_secs, 900);
        assert!(!config.scheduler_enabled);
        assert!(config.require_helius_key().is_err());

        env::set_var("TIERFLOW_DB_PATH", "/tmp/test.db");
        env::set_var("DEXSCREENER_REQUESTS_PER_MINUTE", "30");
        env::set_var("HELIUS_API_KEY", "key-123");
        env::set_var("RUN_SOFT_DEADLINE_SECS", "60");
        env::set_var("ENABLE_SCHEDULER", "true");

        let config = PipelineConfig::from_env();

        assert_eq!(config.db_path, "/tmp/test.db");
        assert_eq!(config.dexscreener_requests_per_minute, 30);
        assert_eq!(config.require_helius_key().unwrap(), "key-123");
        assert_eq!(config.run_soft_deadline(), Duration::from_secs(60));
        assert!(config.scheduler_enabled);

        // Cleanup
        for var in VARS {
            env::remove_var(var);
        }
    }
}
