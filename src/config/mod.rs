use serde::{Deserialize, Serialize};
use std::str::FromStr;

/// Runtime configuration, loaded from `BOSUN_*` environment variables with
/// sensible defaults for a single-node deployment.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// RPC command surface bind address
    pub rpc_addr: String,
    /// webhook / metric ingress bind address
    pub webhook_addr: String,
    /// prometheus metrics bind address
    pub metrics_addr: String,
    /// base URL of the platform adapter
    pub platform_url: String,
    /// base URL of the metric monitorers
    pub monitorer_url: String,
    /// deadline for outbound platform/monitorer calls (seconds)
    pub call_deadline: u64,
    /// load-controller sweep period (seconds)
    pub sweep_interval: u64,
    /// a latest_ruleset older than this is re-executed by the sweep (seconds)
    pub stale_after: u64,
    /// registry reconciliation period (seconds)
    pub reconcile_interval: u64,
    /// maximum number of assignments requested from the solver
    pub solver_limit: usize,
    /// per-component mailbox capacity
    pub mailbox_capacity: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            rpc_addr: "0.0.0.0:8080".to_string(),
            webhook_addr: "0.0.0.0:8081".to_string(),
            metrics_addr: "0.0.0.0:9090".to_string(),
            platform_url: "http://scaler-docker:8000".to_string(),
            monitorer_url: "http://monitorer:8000".to_string(),
            call_deadline: 10,
            sweep_interval: 15,
            stale_after: 30,
            reconcile_interval: 1800,
            solver_limit: 64,
            mailbox_capacity: 256,
        }
    }
}

impl Config {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            rpc_addr: parse_env("BOSUN_RPC_ADDR", defaults.rpc_addr),
            webhook_addr: parse_env("BOSUN_WEBHOOK_ADDR", defaults.webhook_addr),
            metrics_addr: parse_env("BOSUN_METRICS_ADDR", defaults.metrics_addr),
            platform_url: parse_env("BOSUN_PLATFORM_URL", defaults.platform_url),
            monitorer_url: parse_env("BOSUN_MONITORER_URL", defaults.monitorer_url),
            call_deadline: parse_env("BOSUN_CALL_DEADLINE", defaults.call_deadline),
            sweep_interval: parse_env("BOSUN_SWEEP_INTERVAL", defaults.sweep_interval),
            stale_after: parse_env("BOSUN_STALE_AFTER", defaults.stale_after),
            reconcile_interval: parse_env("BOSUN_RECONCILE_INTERVAL", defaults.reconcile_interval),
            solver_limit: parse_env("BOSUN_SOLVER_LIMIT", defaults.solver_limit),
            mailbox_capacity: parse_env("BOSUN_MAILBOX_CAPACITY", defaults.mailbox_capacity),
        }
    }
}

fn parse_env<T: FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|value| value.parse().ok())
        .unwrap_or(default)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.sweep_interval, 15);
        assert_eq!(config.stale_after, 30);
        assert_eq!(config.reconcile_interval, 1800);
        assert_eq!(config.solver_limit, 64);
    }

    #[test]
    fn test_parse_env_fallback() {
        assert_eq!(parse_env("BOSUN_TEST_UNSET_VARIABLE", 42u64), 42);
    }
}
