//! This module defines the core data structures for the load balancer.
//!
//! It contains the `Worker` struct, which describes a single backend
//! registered under a virtual host, and the `BalancerError` enum for
//! handling all error conditions within the application.

use crate::config::ConfigError;
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum BalancerError {
    #[error("Configuration error: {0}")]
    ConfigError(String),
    #[error("Invalid worker payload: {0}")]
    DecodeError(String),
    #[error("Forwarding error: {0}")]
    ForwardError(String),
    #[error("Not routable: {0}")]
    NotFound(String),
    #[error("Status update error: {0}")]
    StatusUpdateError(String),
    #[error("Registration error: {0}")]
    RegistrationError(String),
    #[error("Change source error: {0}")]
    SourceError(String),
}

impl From<ConfigError> for BalancerError {
    fn from(err: ConfigError) -> Self {
        BalancerError::ConfigError(err.to_string())
    }
}

/// One backend endpoint registered under a virtual host.
///
/// This is also the JSON body accepted by the registration API:
/// `{"address": "...", "port": 9000, "host": "..."}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Worker {
    /// The routing key this worker serves.
    pub host: String,
    /// Network name or IP of the backend.
    pub address: String,
    pub port: u16,
    /// Reserved. Workers are never health checked.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub healthcheck_path: Option<String>,
}

impl Worker {
    pub fn new(host: impl Into<String>, address: impl Into<String>, port: u16) -> Self {
        Self { host: host.into(), address: address.into(), port, healthcheck_path: None }
    }

    /// Returns `true` if both describe the same backend for the same host.
    /// `healthcheck_path` does not take part in identity.
    pub fn same_endpoint(&self, other: &Worker) -> bool {
        self.host == other.host && self.address == other.address && self.port == other.port
    }

    /// The `address:port` authority used when forwarding to this worker.
    pub fn authority(&self) -> String {
        format!("{}:{}", self.address, self.port)
    }
}

impl fmt::Display for Worker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{} ({})", self.address, self.port, self.host)
    }
}
