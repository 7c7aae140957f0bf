//! HTTP transport on top of reqwest.

use async_trait::async_trait;
use reqwest::{header, Client};
use serde_json::Value;
use tracing::debug;
use url::Url;

use synceddb_common::{Error, Result};

use crate::transport::{Method, RemoteRequest, RemoteResponse, RemoteTransport};

/// Remote transport issuing real HTTP requests against a base URL.
///
/// Paths are appended to the base URL verbatim, so a base of
/// `https://example.com/app` and a path of `/api/read` address
/// `https://example.com/app/api/read`.
pub struct HttpTransport {
    http: Client,
    base_url: String,
    bearer_token: Option<String>,
}

impl HttpTransport {
    /// Create a transport for the given base URL.
    ///
    /// # Errors
    /// - `InvalidInput` if the base URL does not parse
    /// - `Network` if the HTTP client cannot be built
    pub fn new(base_url: impl Into<String>) -> Result<Self> {
        let http = Client::builder()
            .user_agent("SyncedDB/0.1")
            .build()
            .map_err(|e| Error::Network(format!("Failed to create HTTP client: {}", e)))?;
        Self::with_client(http, base_url)
    }

    /// Create a transport reusing an existing client.
    pub fn with_client(http: Client, base_url: impl Into<String>) -> Result<Self> {
        let base_url = base_url.into();
        Url::parse(&base_url)
            .map_err(|e| Error::InvalidInput(format!("Invalid base URL '{}': {}", base_url, e)))?;

        Ok(Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
            bearer_token: None,
        })
    }

    /// Pass an opaque credential with every request.
    pub fn with_bearer_token(mut self, token: impl Into<String>) -> Self {
        self.bearer_token = Some(token.into());
        self
    }

    /// Base URL requests are resolved against.
    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Resolve a request path against the base URL.
    pub fn url_for(&self, path: &str) -> Result<Url> {
        Url::parse(&format!("{}{}", self.base_url, path))
            .map_err(|e| Error::InvalidInput(format!("Invalid request path '{}': {}", path, e)))
    }
}

fn to_reqwest(method: Method) -> reqwest::Method {
    match method {
        Method::Get => reqwest::Method::GET,
        Method::Post => reqwest::Method::POST,
        Method::Put => reqwest::Method::PUT,
        Method::Delete => reqwest::Method::DELETE,
    }
}

#[async_trait]
impl RemoteTransport for HttpTransport {
    fn name(&self) -> &str {
        "http"
    }

    async fn send(&self, request: RemoteRequest) -> Result<RemoteResponse> {
        let url = self.url_for(&request.path)?;

        let mut builder = self
            .http
            .request(to_reqwest(request.method), url)
            .query(&request.query);

        if let Some(token) = &self.bearer_token {
            builder = builder.header(header::AUTHORIZATION, format!("Bearer {}", token));
        }
        if let Some(body) = &request.body {
            builder = builder.json(body);
        }

        let response = builder
            .send()
            .await
            .map_err(|e| Error::Network(format!("{} failed: {}", request, e)))?;

        let status = response.status();
        let text = response
            .text()
            .await
            .map_err(|e| Error::Network(format!("Failed to read response body: {}", e)))?;

        debug!("{} -> {}", request, status);

        let body = if text.trim().is_empty() {
            None
        } else {
            // Non-JSON bodies are kept as text. Callers that need a body
            // decode it through `RemoteResponse::json`.
            match serde_json::from_str::<Value>(&text) {
                Ok(json) => Some(json),
                Err(_) => Some(Value::String(text)),
            }
        };

        Ok(RemoteResponse {
            status: status.as_u16(),
            body,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    #[test]
    fn test_url_resolution() {
        let transport = HttpTransport::new("http://localhost:8080/app/").unwrap();
        assert_eq!(transport.base_url(), "http://localhost:8080/app");

        let url = transport.url_for("/api/read").unwrap();
        assert_eq!(url.as_str(), "http://localhost:8080/app/api/read");
    }

    #[test]
    fn test_invalid_base_url() {
        assert!(matches!(
            HttpTransport::new("not a url"),
            Err(Error::InvalidInput(_))
        ));
    }

    #[test]
    fn test_method_mapping() {
        assert_eq!(to_reqwest(Method::Put), reqwest::Method::PUT);
        assert_eq!(to_reqwest(Method::Delete), reqwest::Method::DELETE);
    }

    #[tokio::test]
    async fn test_unreachable_host_is_network_error() {
        // Port 9 (discard) on localhost is closed in test environments.
        let transport = HttpTransport::new("http://127.0.0.1:9").unwrap();
        let result = transport
            .send(RemoteRequest::new(Method::Get, "/api/read_all"))
            .await;
        assert!(matches!(result, Err(Error::Network(_))));
    }

    /// Accept one connection, answer it with `response` and hand back the
    /// request head.
    async fn serve_once(response: &'static str) -> (String, tokio::task::JoinHandle<String>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let base_url = format!("http://{}", listener.local_addr().unwrap());

        let server = tokio::spawn(async move {
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
            socket.write_all(response.as_bytes()).await.unwrap();
            let _ = socket.shutdown().await;
            String::from_utf8_lossy(&head).into_owned()
        });

        (base_url, server)
    }

    #[tokio::test]
    async fn test_plain_text_success_is_kept() {
        let (base_url, server) = serve_once(
            "HTTP/1.1 200 OK\r\nContent-Type: text/plain\r\nContent-Length: 2\r\nConnection: close\r\n\r\nOK",
        )
        .await;
        let transport = HttpTransport::new(base_url).unwrap();

        let response = transport
            .send(RemoteRequest::new(Method::Delete, "/api/delete").with_query("id", "1"))
            .await
            .unwrap();
        assert!(response.is_success());
        assert_eq!(response.body, Some(Value::String("OK".to_string())));
        assert!(matches!(
            response.json::<serde_json::Map<String, Value>>(),
            Err(Error::Decode(_))
        ));

        let head = server.await.unwrap();
        assert!(head.starts_with("DELETE /api/delete?id=1 HTTP/1.1"));
    }

    #[tokio::test]
    async fn test_json_body_query_and_token() {
        let (base_url, server) = serve_once(
            "HTTP/1.1 200 OK\r\nContent-Type: application/json\r\nContent-Length: 11\r\nConnection: close\r\n\r\n{\"id\": \"5\"}",
        )
        .await;
        let transport = HttpTransport::new(base_url)
            .unwrap()
            .with_bearer_token("secret");

        let response = transport
            .send(RemoteRequest::new(Method::Get, "/api/read").with_query("id", "5"))
            .await
            .unwrap();
        assert_eq!(response.status, 200);
        assert_eq!(response.body, Some(serde_json::json!({"id": "5"})));

        let head = server.await.unwrap().to_ascii_lowercase();
        assert!(head.starts_with("get /api/read?id=5 http/1.1"));
        assert!(head.contains("authorization: bearer secret"));
    }

    #[tokio::test]
    async fn test_empty_body_is_none() {
        let (base_url, server) =
            serve_once("HTTP/1.1 204 No Content\r\nConnection: close\r\n\r\n").await;
        let transport = HttpTransport::new(base_url).unwrap();

        let response = transport
            .send(RemoteRequest::new(Method::Delete, "/api/delete").with_query("id", "1"))
            .await
            .unwrap();
        assert_eq!(response.status, 204);
        assert!(response.body.is_none());
        server.await.unwrap();
    }
}
