use std::time::Duration;

use futures::StreamExt;
use reqwest::header::ACCEPT;
use serde_json::Value;
use snafu::ResultExt;

use super::error::{BuildHttpClientSnafu, HttpStatusSnafu, StreamResult, TransportSnafu};
use super::transport::{BoxFuture, ByteStream, SearchRequest, SearchTransport};

pub const DEFAULT_SEARCH_PATH: &str = "/search/stream";
pub const DEFAULT_SELECT_PATH: &str = "/search/select";
pub const DEFAULT_HEALTH_PATH: &str = "/health";

const STREAM_ACCEPT: &str = "application/x-ndjson, text/event-stream";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpTransportConfig {
    pub endpoint: String,
    pub search_path: String,
    pub select_path: String,
    pub health_path: String,
    pub request_timeout: Duration,
}

impl HttpTransportConfig {
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into().trim().to_string(),
            search_path: DEFAULT_SEARCH_PATH.to_string(),
            select_path: DEFAULT_SELECT_PATH.to_string(),
            health_path: DEFAULT_HEALTH_PATH.to_string(),
            request_timeout: Duration::from_secs(300),
        }
    }

    fn url(&self, path: &str) -> String {
        format!(
            "{}/{}",
            self.endpoint.trim_end_matches('/'),
            path.trim_start_matches('/')
        )
    }
}

/// Streams searches from the backend over HTTP.
pub struct HttpTransport {
    client: reqwest::Client,
    config: HttpTransportConfig,
}

impl HttpTransport {
    pub fn new(config: HttpTransportConfig) -> StreamResult<Self> {
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .timeout(config.request_timeout)
            .build()
            .context(BuildHttpClientSnafu {
                stage: "build-http-client",
            })?;

        Ok(Self { client, config })
    }

    pub fn config(&self) -> &HttpTransportConfig {
        &self.config
    }

    /// Reads the health body: `{"connected": bool}` or `{"status": "..."}`.
    /// Any other successful body counts as healthy.
    fn parse_health_body(body: &str) -> bool {
        let Ok(value) = serde_json::from_str::<Value>(body) else {
            return true;
        };

        if let Some(connected) = value.get("connected").and_then(Value::as_bool) {
            return connected;
        }

        match value.get("status").and_then(Value::as_str) {
            Some(status) => matches!(
                status.to_ascii_lowercase().as_str(),
                "ok" | "healthy" | "up" | "connected"
            ),
            None => true,
        }
    }
}

impl SearchTransport for HttpTransport {
    fn name(&self) -> &str {
        "http"
    }

    fn open<'a>(&'a self, request: &'a SearchRequest) -> BoxFuture<'a, StreamResult<ByteStream>> {
        Box::pin(async move {
            let path = if request.is_selection() {
                &self.config.select_path
            } else {
                &self.config.search_path
            };

            let response = self
                .client
                .post(self.config.url(path))
                .header(ACCEPT, STREAM_ACCEPT)
                .json(request)
                .send()
                .await
                .context(TransportSnafu {
                    stage: "send-search-request",
                })?;

            let status = response.status();
            if !status.is_success() {
                let body = response.text().await.unwrap_or_default();
                return HttpStatusSnafu {
                    stage: "search-http-status",
                    status: status.as_u16(),
                    body,
                }
                .fail();
            }

            let body = response.bytes_stream().map(|item| {
                item.map(|bytes| bytes.to_vec()).context(TransportSnafu {
                    stage: "read-search-stream",
                })
            });
            Ok(body.boxed())
        })
    }

    fn probe<'a>(&'a self) -> BoxFuture<'a, StreamResult<bool>> {
        Box::pin(async move {
            let response = self
                .client
                .get(self.config.url(&self.config.health_path))
                .timeout(Duration::from_secs(10))
                .send()
                .await
                .context(TransportSnafu {
                    stage: "send-health-probe",
                })?;

            if !response.status().is_success() {
                return Ok(false);
            }

            let body = response.text().await.context(TransportSnafu {
                stage: "read-health-probe",
            })?;
            Ok(Self::parse_health_body(&body))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn urls_join_without_double_slashes() {
        let config = HttpTransportConfig::new("http://localhost:8000/api/");
        assert_eq!(
            config.url(DEFAULT_SEARCH_PATH),
            "http://localhost:8000/api/search/stream"
        );
        assert_eq!(config.url("health"), "http://localhost:8000/api/health");
    }

    #[test]
    fn health_bodies_are_interpreted() {
        assert!(HttpTransport::parse_health_body(r#"{"connected":true}"#));
        assert!(!HttpTransport::parse_health_body(r#"{"connected":false}"#));
        assert!(HttpTransport::parse_health_body(r#"{"status":"OK"}"#));
        assert!(!HttpTransport::parse_health_body(r#"{"status":"degraded"}"#));
        assert!(HttpTransport::parse_health_body("pong"));
    }
}
