//! HTTP transport for the QuickStats `api_GET` endpoint.

use super::{StatsQuery, StatsSource};
use crate::config::{ApiKey, ExtractConfig};
use crate::error::FetchError;
use crate::model::RawRecord;
use async_trait::async_trait;
use reqwest::StatusCode;
use serde::Deserialize;

/// Longest error body echoed back in a FetchError.
const MAX_ERROR_BODY: usize = 300;

#[derive(Debug, Deserialize)]
struct Envelope {
    #[serde(default)]
    data: Option<Vec<RawRecord>>,
    #[serde(default)]
    error: Option<serde_json::Value>,
}

pub struct QuickStatsClient {
    http: reqwest::Client,
    base_url: String,
    api_key: ApiKey,
}

impl QuickStatsClient {
    pub fn new(config: &ExtractConfig, api_key: ApiKey) -> Result<Self, reqwest::Error> {
        let http = reqwest::Client::builder()
            .timeout(config.request_timeout)
            .user_agent(concat!("quickstats-pipeline/", env!("CARGO_PKG_VERSION")))
            .build()?;
        Ok(Self {
            http,
            base_url: config.base_url.clone(),
            api_key,
        })
    }
}

#[async_trait]
impl StatsSource for QuickStatsClient {
    async fn query(&self, query: &StatsQuery) -> Result<Vec<RawRecord>, FetchError> {
        let resp = self
            .http
            .get(&self.base_url)
            .query(&[("key", self.api_key.expose())])
            .query(&query.params())
            .send()
            .await
            .map_err(classify_transport)?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(classify_status(status, &body));
        }

        let body = resp.bytes().await.map_err(classify_transport)?;
        parse_payload(&body)
    }
}

/// Network-layer failures are worth retrying; a body we cannot decode is not.
fn classify_transport(err: reqwest::Error) -> FetchError {
    if err.is_decode() {
        FetchError::permanent(format!("undecodable response: {}", err))
    } else {
        FetchError::transient(format!("request failed: {}", err))
    }
}

pub(crate) fn classify_status(status: StatusCode, body: &str) -> FetchError {
    let snippet: String = body.chars().take(MAX_ERROR_BODY).collect();
    let cause = format!("API error {}: {}", status.as_u16(), snippet.trim());
    if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
        FetchError::transient(cause)
    } else {
        FetchError::permanent(cause)
    }
}

/// Decode the `{"data": [...]}` envelope.
pub(crate) fn parse_payload(body: &[u8]) -> Result<Vec<RawRecord>, FetchError> {
    let envelope: Envelope = serde_json::from_slice(body)
        .map_err(|e| FetchError::permanent(format!("JSON decode error: {}", e)))?;
    match (envelope.data, envelope.error) {
        (Some(data), _) => Ok(data),
        (None, Some(error)) => Err(FetchError::permanent(format!("API reported error: {}", error))),
        (None, None) => Err(FetchError::permanent("response has no data field")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::FetchErrorKind;
    use crate::model::{Metric, Task};
    use std::time::Duration;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;
    use tokio::task::JoinHandle;

    fn client(base_url: String, timeout: Duration) -> QuickStatsClient {
        let config = ExtractConfig {
            base_url,
            request_timeout: timeout,
            ..ExtractConfig::default()
        };
        QuickStatsClient::new(&config, ApiKey::new("secret")).unwrap()
    }

    fn corn_query() -> StatsQuery {
        StatsQuery::from_task(&Task {
            commodity: "CORN".to_string(),
            metric: Metric::Price,
            region: "IA".to_string(),
            year_from: 2020,
            year_to: 2024,
        })
    }

    /// Answer one request with `status` and `body`; the handle yields the
    /// request head that was received.
    async fn serve_once(status: &'static str, body: &'static str) -> (String, JoinHandle<String>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let handle = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut head = Vec::new();
            let mut buf = [0u8; 1024];
            while !head.windows(4).any(|w| w == b"\r\n\r\n") {
                let n = socket.read(&mut buf).await.unwrap();
                if n == 0 {
                    break;
                }
                head.extend_from_slice(&buf[..n]);
            }
            let response = format!(
                "HTTP/1.1 {}\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
                status,
                body.len(),
                body
            );
            socket.write_all(response.as_bytes()).await.unwrap();
            socket.shutdown().await.ok();
            String::from_utf8_lossy(&head).to_string()
        });
        (format!("http://{}/api/api_GET/", addr), handle)
    }

    // -------------------------------------------------------------------------
    // TRANSPORT
    // -------------------------------------------------------------------------

    #[tokio::test]
    async fn test_query_sends_key_and_facets() {
        let (url, server) = serve_once("200 OK", r#"{"data": [{"year": 2023, "Value": "4.50"}]}"#).await;

        let rows = client(url, Duration::from_secs(5)).query(&corn_query()).await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].value.as_deref(), Some("4.50"));

        let head = server.await.unwrap();
        let request_line = head.lines().next().unwrap();
        assert!(request_line.starts_with("GET /api/api_GET/?"));
        assert!(request_line.contains("key=secret"));
        assert!(request_line.contains("commodity_desc=CORN"));
        assert!(request_line.contains("state_alpha=IA"));
        assert!(request_line.contains("format=JSON"));
    }

    #[tokio::test]
    async fn test_server_error_is_transient() {
        let (url, server) = serve_once("503 Service Unavailable", "busy").await;
        let err = client(url, Duration::from_secs(5)).query(&corn_query()).await.unwrap_err();
        assert!(err.is_transient());
        assert!(err.cause.contains("503"));
        server.await.unwrap();
    }

    #[tokio::test]
    async fn test_bad_request_is_permanent() {
        let (url, server) = serve_once("400 Bad Request", r#"{"error": ["bad request"]}"#).await;
        let err = client(url, Duration::from_secs(5)).query(&corn_query()).await.unwrap_err();
        assert_eq!(err.kind, FetchErrorKind::Permanent);
        server.await.unwrap();
    }

    #[tokio::test]
    async fn test_connection_refused_is_transient() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let err = client(format!("http://{}/api/api_GET/", addr), Duration::from_secs(5))
            .query(&corn_query())
            .await
            .unwrap_err();
        assert!(err.is_transient());
    }

    #[tokio::test]
    async fn test_timeout_is_transient() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        // accept and never answer
        let server = tokio::spawn(async move {
            let (socket, _) = listener.accept().await.unwrap();
            tokio::time::sleep(Duration::from_secs(5)).await;
            drop(socket);
        });

        let err = client(format!("http://{}/api/api_GET/", addr), Duration::from_millis(50))
            .query(&corn_query())
            .await
            .unwrap_err();
        assert!(err.is_transient());
        server.abort();
    }

    // -------------------------------------------------------------------------
    // PAYLOAD
    // -------------------------------------------------------------------------

    #[test]
    fn test_parse_payload_rows() {
        let body = br#"{"data": [{"year": 2023, "state_name": "IOWA", "Value": "4.50"}]}"#;
        let rows = parse_payload(body).unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].state_name.as_deref(), Some("IOWA"));
    }

    #[test]
    fn test_parse_payload_empty_data_is_ok() {
        let rows = parse_payload(br#"{"data": []}"#).unwrap();
        assert!(rows.is_empty());
    }

    #[test]
    fn test_parse_payload_malformed_is_permanent() {
        let err = parse_payload(b"<html>oops</html>").unwrap_err();
        assert_eq!(err.kind, FetchErrorKind::Permanent);

        let err = parse_payload(br#"{"error": ["bad request - invalid query"]}"#).unwrap_err();
        assert_eq!(err.kind, FetchErrorKind::Permanent);
        assert!(err.cause.contains("invalid query"));
    }

    #[test]
    fn test_classify_status() {
        assert!(classify_status(StatusCode::BAD_GATEWAY, "").is_transient());
        assert!(classify_status(StatusCode::SERVICE_UNAVAILABLE, "").is_transient());
        assert!(classify_status(StatusCode::TOO_MANY_REQUESTS, "").is_transient());
        assert!(!classify_status(StatusCode::BAD_REQUEST, "").is_transient());
        assert!(!classify_status(StatusCode::UNAUTHORIZED, "").is_transient());
    }

    #[test]
    fn test_classify_status_truncates_body() {
        let body = "x".repeat(5000);
        let err = classify_status(StatusCode::BAD_REQUEST, &body);
        assert!(err.cause.len() < 400);
    }
}
