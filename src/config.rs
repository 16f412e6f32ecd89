use serde::Deserialize;
use std::{fs, time::Duration};
use thiserror::Error;
use tracing::{error, info};

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Configuration error: {0}")]
    ConfigError(String),
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct Config {
    pub controller: Option<ControllerConfig>,
    pub dispatcher: Option<DispatcherConfig>,
    pub kubernetes: Option<KubernetesConfig>,
}

impl Config {
    /// Applies defaults and validates the configuration.
    /// After this, every non-timeout field of every section is `Some`.
    pub fn finalize(mut self) -> Result<Self, ConfigError> {
        let mut controller = self.controller.take().unwrap_or_default();
        controller.registration_url = Some(validate_registration_url(
            controller
                .registration_url
                .unwrap_or_else(|| DEFAULT_REGISTRATION_URL.to_string()),
        )?);
        controller.publish_status = controller.publish_status.or(Some(false));
        controller.service_name =
            controller.service_name.or_else(|| Some(DEFAULT_SERVICE_NAME.to_string()));
        controller.service_namespace =
            controller.service_namespace.or_else(|| Some(DEFAULT_SERVICE_NAMESPACE.to_string()));
        if controller.service_name.as_deref().is_some_and(|name| name.trim().is_empty()) {
            return Err(ConfigError::ConfigError("service_name must not be empty".to_string()));
        }
        self.controller = Some(controller);

        let mut dispatcher = self.dispatcher.take().unwrap_or_default();
        dispatcher.pool_idle_timeout_secs =
            dispatcher.pool_idle_timeout_secs.or(Some(DEFAULT_POOL_IDLE_TIMEOUT_SECS));
        dispatcher.pool_max_idle_per_host =
            dispatcher.pool_max_idle_per_host.or(Some(DEFAULT_POOL_MAX_IDLE_PER_HOST));
        self.dispatcher = Some(dispatcher);

        self.kubernetes = Some(self.kubernetes.take().unwrap_or_default());
        Ok(self)
    }
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct ControllerConfig {
    /// Where the sync pipeline POSTs new workers.
    pub registration_url: Option<String>,
    /// Write the balancer's address back onto synced ingresses.
    pub publish_status: Option<bool>,
    /// The well-known Service whose addresses are published.
    pub service_name: Option<String>,
    pub service_namespace: Option<String>,
    /// Unset means registration calls never time out.
    pub registration_timeout_secs: Option<u64>,
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct DispatcherConfig {
    /// Unset means forwards to workers never time out.
    pub upstream_timeout_secs: Option<u64>,
    pub connect_timeout_ms: Option<u64>,
    pub pool_idle_timeout_secs: Option<u64>,
    pub pool_max_idle_per_host: Option<usize>,
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct KubernetesConfig {
    /// Explicit kubeconfig; otherwise in-cluster or default inference.
    pub kubeconfig: Option<String>,
    pub context: Option<String>,
    /// Restrict list/watch to one namespace. All namespaces when unset.
    pub namespace: Option<String>,
}

/// Fixed listening port of the registration API.
pub const API_PORT: u16 = 8080;
/// Fixed listening port of the dispatcher.
pub const DISPATCH_PORT: u16 = 8081;

pub const DEFAULT_SERVICE_NAME: &str = "divvy-test-divvy-ingress-controller";
pub const DEFAULT_SERVICE_NAMESPACE: &str = "default";
pub const DEFAULT_REGISTRATION_URL: &str = "http://divvy-test-divvy-ingress-controller";
pub const DEFAULT_POOL_IDLE_TIMEOUT_SECS: u64 = 20;
pub const DEFAULT_POOL_MAX_IDLE_PER_HOST: usize = 50;

/// Builds the HTTP client used to forward requests to workers.
pub fn build_upstream_client(cfg: &DispatcherConfig) -> Result<reqwest::Client, ConfigError> {
    let mut builder = reqwest::Client::builder()
        .tcp_nodelay(true)
        .pool_idle_timeout(Some(Duration::from_secs(
            cfg.pool_idle_timeout_secs.unwrap_or(DEFAULT_POOL_IDLE_TIMEOUT_SECS),
        )))
        .pool_max_idle_per_host(
            cfg.pool_max_idle_per_host.unwrap_or(DEFAULT_POOL_MAX_IDLE_PER_HOST),
        );
    if let Some(ms) = cfg.connect_timeout_ms {
        builder = builder.connect_timeout(Duration::from_millis(ms));
    }
    if let Some(secs) = cfg.upstream_timeout_secs {
        builder = builder.timeout(Duration::from_secs(secs));
    }
    builder.build().map_err(|e| ConfigError::ConfigError(e.to_string()))
}

pub fn try_load_config(path: &str) -> Result<Option<Config>, ConfigError> {
    match fs::read_to_string(path) {
        Ok(raw) => match toml::from_str::<Config>(&raw) {
            Ok(cfg) => {
                info!(path = %path, "Loaded config");
                Ok(Some(cfg))
            }
            Err(e) => {
                error!(path = %path, error = %e, "Failed to parse config");
                Err(ConfigError::ConfigError(e.to_string()))
            }
        },
        Err(e) => {
            if e.kind() == std::io::ErrorKind::NotFound {
                info!(path = %path, "No config file found, using defaults");
                Ok(None)
            } else {
                Err(ConfigError::ConfigError(e.to_string()))
            }
        }
    }
}

/// Trims the URL and drops trailing slashes; only plain http(s) URLs pass.
pub fn validate_registration_url(url: String) -> Result<String, ConfigError> {
    let mut url = url.trim().to_string();
    let lower = url.to_lowercase();
    if !lower.starts_with("http://") && !lower.starts_with("https://") {
        return Err(ConfigError::ConfigError(format!("Invalid registration_url: {}", url)));
    }
    if url.chars().any(|c| c.is_control() || c.is_whitespace()) {
        return Err(ConfigError::ConfigError(format!(
            "registration_url contains invalid characters: {}",
            url
        )));
    }
    while url.ends_with('/') {
        url.pop();
    }
    Ok(url)
}
