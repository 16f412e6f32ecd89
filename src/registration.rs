//! HTTP client for the registration API, used by the sync pipeline.

use reqwest::{header, Client};
use std::time::Duration;
use tracing::{debug, error};

use crate::endpoint::{BalancerError, Worker};

#[derive(Debug, Clone)]
pub struct RegistrationClient {
    client: Client,
    url: String,
}

impl RegistrationClient {
    /// `timeout` of `None` lets a call wait indefinitely.
    pub fn new(url: impl Into<String>, timeout: Option<Duration>) -> Result<Self, BalancerError> {
        let mut builder = Client::builder();
        if let Some(timeout) = timeout {
            builder = builder.timeout(timeout);
        }
        let client = builder.build().map_err(|e| BalancerError::ConfigError(e.to_string()))?;
        Ok(Self { client, url: url.into() })
    }

    /// POSTs `worker` to the registration API and returns its confirmation text.
    pub async fn register(&self, worker: &Worker) -> Result<String, BalancerError> {
        debug!(url = %self.url, worker = %worker, "Registering worker");
        let response = self
            .client
            .post(&self.url)
            .header(header::CONTENT_TYPE, "application/json")
            .json(worker)
            .send()
            .await
            .map_err(|e| {
                error!(url = %self.url, error = %e, "Registration request failed");
                BalancerError::RegistrationError(e.to_string())
            })?;

        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| BalancerError::RegistrationError(e.to_string()))?;
        if !status.is_success() {
            return Err(BalancerError::RegistrationError(format!(
                "registration API returned {}: {}",
                status,
                body.trim()
            )));
        }
        Ok(body)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{balancer::WorkerRegistry, server::api_router, server::spawn_server};
    use std::sync::Arc;

    #[tokio::test]
    async fn test_register_returns_confirmation() {
        let registry = Arc::new(WorkerRegistry::new());
        let addr = spawn_server(api_router(registry.clone()));
        let client = RegistrationClient::new(format!("http://{}", addr), None).unwrap();

        let text = client.register(&Worker::new("app.local", "svcA", 8080)).await.unwrap();
        assert_eq!(
            text,
            "added worker svcA to workers for host app.local. There are now 1 workers for app.local\n"
        );
        assert_eq!(registry.get("app.local"), vec![Worker::new("app.local", "svcA", 8080)]);
    }

    #[tokio::test]
    async fn test_register_non_success_is_error() {
        let addr = spawn_server(axum::Router::new().fallback(|| async {
            (axum::http::StatusCode::SERVICE_UNAVAILABLE, "busy")
        }));
        let client = RegistrationClient::new(format!("http://{}", addr), None).unwrap();

        let err = client.register(&Worker::new("app.local", "svcA", 8080)).await.unwrap_err();
        match err {
            BalancerError::RegistrationError(msg) => {
                assert!(msg.contains("503"));
                assert!(msg.contains("busy"));
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_register_unreachable_is_error() {
        let port = {
            let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
            listener.local_addr().unwrap().port()
        };
        let client = RegistrationClient::new(
            format!("http://127.0.0.1:{}", port),
            Some(Duration::from_secs(2)),
        )
        .unwrap();
        assert!(matches!(
            client.register(&Worker::new("app.local", "svcA", 8080)).await,
            Err(BalancerError::RegistrationError(_))
        ));
    }
}
