//! This module is responsible for the I/O layer of the dispatcher.
//!
//! It forwards an inbound request to the selected worker and buffers the
//! worker's response. Connection-level headers are stripped in both
//! directions; everything else passes through untouched.

use axum::http::{header, HeaderMap, HeaderName, Method, StatusCode, Uri};
use bytes::Bytes;
use reqwest::Client;
use tracing::{debug, error};

use crate::endpoint::{BalancerError, Worker};
use crate::metrics::UPSTREAM_LATENCY;

pub const X_FORWARDED_HOST: &str = "x-forwarded-host";

const HOP_BY_HOP: [&str; 8] = [
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

/// A fully buffered upstream response.
#[derive(Debug)]
pub struct UpstreamResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Bytes,
}

/// Returns a copy of `headers` without hop-by-hop headers, including any
/// header listed in the `Connection` header itself.
pub fn strip_hop_by_hop(headers: &HeaderMap) -> HeaderMap {
    let listed: Vec<String> = headers
        .get_all(header::CONNECTION)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(|value| value.split(','))
        .map(|name| name.trim().to_ascii_lowercase())
        .filter(|name| !name.is_empty())
        .collect();

    let mut out = HeaderMap::with_capacity(headers.len());
    for (name, value) in headers {
        if HOP_BY_HOP.contains(&name.as_str()) || listed.iter().any(|l| l == name.as_str()) {
            continue;
        }
        out.append(name.clone(), value.clone());
    }
    out
}

/// Builds the request URL on `worker`, keeping the path and query of `uri`.
pub fn upstream_url(worker: &Worker, uri: &Uri) -> String {
    let path = if uri.path().is_empty() { "/" } else { uri.path() };
    match uri.query() {
        Some(query) => format!("http://{}{}?{}", worker.authority(), path, query),
        None => format!("http://{}{}", worker.authority(), path),
    }
}

/// Forwards a request to `worker` and reads the full response.
///
/// The inbound `Host` is replaced by the worker's authority and passed on
/// as `X-Forwarded-Host`. Any failure to send the request or read the
/// response body is a `ForwardError`; non-2xx statuses are relayed as-is.
pub async fn forward_request(
    client: &Client,
    worker: &Worker,
    method: Method,
    uri: &Uri,
    headers: &HeaderMap,
    body: Bytes,
) -> Result<UpstreamResponse, BalancerError> {
    let url = upstream_url(worker, uri);
    let timer = UPSTREAM_LATENCY.with_label_values(&[&worker.host]).start_timer();

    let mut outbound = strip_hop_by_hop(headers);
    outbound.remove(header::CONTENT_LENGTH);
    if let Some(host) = outbound.remove(header::HOST) {
        outbound.insert(HeaderName::from_static(X_FORWARDED_HOST), host);
    }

    debug!(url = %url, method = %method, "Forwarding request");
    let response =
        client.request(method, &url).headers(outbound).body(body).send().await.map_err(|e| {
            error!(worker = %worker, error = %e, "Network error from worker");
            BalancerError::ForwardError(e.to_string())
        })?;

    let status = response.status();
    let mut response_headers = strip_hop_by_hop(response.headers());
    response_headers.remove(header::CONTENT_LENGTH);

    let body = response.bytes().await.map_err(|e| {
        error!(worker = %worker, error = %e, "Failed to read response body");
        BalancerError::ForwardError(e.to_string())
    })?;
    timer.observe_duration();

    Ok(UpstreamResponse { status, headers: response_headers, body })
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
        headers.get(name).and_then(|v| v.to_str().ok())
    }

    #[test]
    fn test_strip_hop_by_hop_removes_standard_headers() {
        let mut headers = HeaderMap::new();
        headers.insert(header::CONNECTION, HeaderValue::from_static("keep-alive"));
        headers.insert("keep-alive", HeaderValue::from_static("timeout=5"));
        headers.insert(header::TRANSFER_ENCODING, HeaderValue::from_static("chunked"));
        headers.insert(header::UPGRADE, HeaderValue::from_static("websocket"));
        headers.insert(header::CONTENT_TYPE, HeaderValue::from_static("text/plain"));

        let stripped = strip_hop_by_hop(&headers);
        assert_eq!(stripped.len(), 1);
        assert_eq!(header_str(&stripped, "content-type"), Some("text/plain"));
    }

    #[test]
    fn test_strip_hop_by_hop_removes_connection_listed_headers() {
        let mut headers = HeaderMap::new();
        headers.insert(header::CONNECTION, HeaderValue::from_static("close, X-Trace-Hop"));
        headers.insert("x-trace-hop", HeaderValue::from_static("1"));
        headers.insert("x-request-id", HeaderValue::from_static("abc"));

        let stripped = strip_hop_by_hop(&headers);
        assert!(stripped.get("x-trace-hop").is_none());
        assert_eq!(header_str(&stripped, "x-request-id"), Some("abc"));
    }

    #[test]
    fn test_strip_hop_by_hop_keeps_repeated_headers() {
        let mut headers = HeaderMap::new();
        headers.append(header::SET_COOKIE, HeaderValue::from_static("a=1"));
        headers.append(header::SET_COOKIE, HeaderValue::from_static("b=2"));
        let stripped = strip_hop_by_hop(&headers);
        assert_eq!(stripped.get_all(header::SET_COOKIE).iter().count(), 2);
    }

    #[test]
    fn test_upstream_url_keeps_path_and_query() {
        let worker = Worker::new("app.local", "svcA", 8080);
        let uri: Uri = "/api/items?page=2".parse().unwrap();
        assert_eq!(upstream_url(&worker, &uri), "http://svcA:8080/api/items?page=2");
    }

    #[test]
    fn test_upstream_url_defaults_to_root() {
        let worker = Worker::new("app.local", "10.0.0.1", 9000);
        let uri: Uri = "http://app.local".parse().unwrap();
        assert_eq!(upstream_url(&worker, &uri), "http://10.0.0.1:9000/");
    }

    #[tokio::test]
    async fn test_forward_to_unreachable_worker_is_forward_error() {
        let client = Client::new();
        let port = {
            let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
            listener.local_addr().unwrap().port()
        };
        let worker = Worker::new("h", "127.0.0.1", port);
        let uri: Uri = "/".parse().unwrap();
        let result =
            forward_request(&client, &worker, Method::GET, &uri, &HeaderMap::new(), Bytes::new())
                .await;
        assert!(matches!(result, Err(BalancerError::ForwardError(_))));
    }
}
