use std::env;
use std::time::Duration;

use crate::errors::ConfigError;

/// Runtime environment used by the process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Environment {
    #[default]
    Development,
    Staging,
    Production,
}

impl Environment {
    fn from_str(value: &str) -> Self {
        match value.to_ascii_lowercase().as_str() {
            "production" | "prod" => Environment::Production,
            "staging" | "stage" => Environment::Staging,
            _ => Environment::Development,
        }
    }
}

/// Global configuration shared across the control-plane components.
#[derive(Debug, Clone)]
pub struct WeirConfig {
    /// Base URL of the cluster control API filters are deployed through.
    pub controller_url: String,
    /// Token forwarded on control-API calls via `X-Auth-Token`.
    pub auth_token: Option<String>,
    pub environment: Environment,
    pub node_name: String,
    /// Bind address for the policy HTTP API, when enabled.
    pub http_bind: Option<String>,
    /// Exchange metric payloads are consumed from.
    pub metrics_exchange: String,
    /// Exchange bandwidth change records are published to.
    pub bandwidth_exchange: String,
    /// Default aggregation window for metric hubs.
    pub aggregation_period: Duration,
    /// Ceiling for one account's bandwidth at one disk, in MB/s.
    pub per_disk_capacity: f64,
    /// Total disk bandwidth available to the cluster, in MB/s.
    pub disk_capacity: f64,
    /// Total proxy-tier bandwidth, in MB/s.
    pub proxy_capacity: f64,
    /// Global budget for replication traffic, in MB/s.
    pub replication_budget: f64,
}

impl WeirConfig {
    /// Loads configuration from the process environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        dotenvy::dotenv().ok();
        Self::from_env_with_prefix("WEIR_")
    }

    /// Loads configuration from env vars prefixed with the provided value
    /// (e.g. `ENFORCER_`).
    pub fn from_env_with_prefix(prefix: &str) -> Result<Self, ConfigError> {
        let key = |suffix: &str| format!("{}{}", prefix, suffix);

        let controller_key = key("CONTROLLER_URL");
        let controller_url = env::var(&controller_key)
            .map_err(|_| ConfigError::MissingEnvVar(controller_key.clone()))?;

        let auth_token = env::var(key("AUTH_TOKEN")).ok();

        let environment = env::var(key("ENV"))
            .map(|raw| Environment::from_str(&raw))
            .unwrap_or_default();

        let node_name = env::var(key("NODE_NAME")).unwrap_or_else(|_| "weir-node".to_string());
        let http_bind = env::var(key("HTTP_BIND")).ok();

        let metrics_exchange =
            env::var(key("METRICS_EXCHANGE")).unwrap_or_else(|_| "metrics".to_string());
        let bandwidth_exchange =
            env::var(key("BANDWIDTH_EXCHANGE")).unwrap_or_else(|_| "bandwidth".to_string());

        let period_key = key("AGGREGATION_PERIOD_MS");
        let aggregation_period = match env::var(&period_key) {
            Ok(raw) => {
                let millis: u64 = raw.parse().map_err(|_| ConfigError::InvalidValue {
                    key: period_key,
                    value: raw.clone(),
                })?;
                Duration::from_millis(millis)
            }
            Err(_) => Duration::from_millis(500),
        };

        let float = |suffix: &str, default: f64| -> Result<f64, ConfigError> {
            let var = key(suffix);
            match env::var(&var) {
                Ok(raw) => raw.parse().map_err(|_| ConfigError::InvalidValue {
                    key: var,
                    value: raw.clone(),
                }),
                Err(_) => Ok(default),
            }
        };
        let per_disk_capacity = float("PER_DISK_CAPACITY", 70.0)?;
        let disk_capacity = float("DISK_CAPACITY", 1000.0)?;
        let proxy_capacity = float("PROXY_CAPACITY", 1000.0)?;
        let replication_budget = float("REPLICATION_BUDGET", 100.0)?;

        Ok(Self {
            controller_url,
            auth_token,
            environment,
            node_name,
            http_bind,
            metrics_exchange,
            bandwidth_exchange,
            aggregation_period,
            per_disk_capacity,
            disk_capacity,
            proxy_capacity,
            replication_budget,
        })
    }

}
