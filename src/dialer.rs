//! Outbound leg: builds the backend upgrade request and performs the dial.

use anyhow::Result;
use std::{io, time::Duration};
use thiserror::Error;
use tokio::{net::TcpStream, time::timeout};
use tokio_tungstenite::{
    MaybeTlsStream, WebSocketStream, connect_async,
    tungstenite::{
        Error as WsError,
        client::IntoClientRequest,
        handshake::client::Request,
        http::{
            HeaderMap, HeaderName, HeaderValue,
            header::{HOST, ORIGIN, USER_AGENT},
        },
    },
};
use tracing::debug;

use crate::config::BackendConfig;

pub type BackendStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

const X_FORWARDED_FOR: HeaderName = HeaderName::from_static("x-forwarded-for");
const X_FORWARDED_PROTO: HeaderName = HeaderName::from_static("x-forwarded-proto");

/// Longest backend response body kept for logs and close reasons.
const MAX_CAPTURED_BODY: usize = 512;

#[derive(Debug, Error)]
pub enum DialError {
    #[error("invalid backend request: {0}")]
    InvalidRequest(String),
    #[error("connection refused by backend")]
    Refused,
    #[error("handshake timed out after {0:?}")]
    Timeout(Duration),
    #[error("backend answered {status} instead of switching protocols")]
    Rejected { status: u16, body: String },
    #[error("transport error: {0}")]
    Transport(#[source] Box<WsError>),
}

impl DialError {
    /// Close reason sent on the client leg when the backend leg cannot be opened.
    #[must_use]
    pub fn close_reason(&self) -> String {
        format!("No WebSocket from origin: {self}")
    }

    fn from_ws(err: WsError) -> Self {
        match err {
            WsError::Io(io_err) if io_err.kind() == io::ErrorKind::ConnectionRefused => {
                Self::Refused
            }
            WsError::Http(response) => {
                let body = response
                    .body()
                    .as_deref()
                    .map(|bytes| {
                        let end = bytes.len().min(MAX_CAPTURED_BODY);
                        String::from_utf8_lossy(&bytes[..end]).into_owned()
                    })
                    .unwrap_or_default();
                Self::Rejected {
                    status: response.status().as_u16(),
                    body,
                }
            }
            WsError::Url(url_err) => Self::InvalidRequest(url_err.to_string()),
            other => Self::Transport(Box::new(other)),
        }
    }
}

#[derive(Debug, Clone)]
pub struct BackendDialer {
    base_url: String,
    host: HeaderValue,
    default_origin: HeaderValue,
    default_user_agent: HeaderValue,
    handshake_timeout: Duration,
}

impl BackendDialer {
    pub fn from_config(config: &BackendConfig) -> Result<Self> {
        Ok(Self {
            base_url: config.url.trim_end_matches('/').to_string(),
            host: HeaderValue::from_str(&config.canonical_host()?)?,
            default_origin: HeaderValue::from_str(&config.default_origin()?)?,
            default_user_agent: HeaderValue::from_str(&config.user_agent)?,
            handshake_timeout: config.handshake_timeout(),
        })
    }

    #[must_use]
    pub fn url_for(&self, target: &str) -> String {
        format!("{}{target}", self.base_url)
    }

    /// Headers presented to the backend, derived from the client's upgrade request.
    pub fn backend_headers(
        &self,
        incoming: &HeaderMap,
        source_ip: &str,
    ) -> Result<HeaderMap, DialError> {
        let mut headers = HeaderMap::new();
        headers.insert(
            ORIGIN,
            incoming
                .get(ORIGIN)
                .cloned()
                .unwrap_or_else(|| self.default_origin.clone()),
        );
        headers.insert(
            USER_AGENT,
            incoming
                .get(USER_AGENT)
                .cloned()
                .unwrap_or_else(|| self.default_user_agent.clone()),
        );
        headers.insert(HOST, self.host.clone());
        headers.insert(
            X_FORWARDED_FOR,
            HeaderValue::from_str(source_ip)
                .map_err(|_| DialError::InvalidRequest(format!("bad source ip {source_ip:?}")))?,
        );
        headers.insert(X_FORWARDED_PROTO, HeaderValue::from_static("https"));
        Ok(headers)
    }

    pub fn build_request(
        &self,
        target: &str,
        incoming: &HeaderMap,
        source_ip: &str,
    ) -> Result<Request, DialError> {
        let mut request = self
            .url_for(target)
            .into_client_request()
            .map_err(|err| DialError::InvalidRequest(err.to_string()))?;
        for (name, value) in &self.backend_headers(incoming, source_ip)? {
            request.headers_mut().insert(name.clone(), value.clone());
        }
        Ok(request)
    }

    pub async fn dial(
        &self,
        target: &str,
        incoming: &HeaderMap,
        source_ip: &str,
    ) -> Result<BackendStream, DialError> {
        let request = self.build_request(target, incoming, source_ip)?;
        debug!(backend_url = %request.uri(), "Connecting to backend");

        let (stream, response) = timeout(self.handshake_timeout, connect_async(request))
            .await
            .map_err(|_| DialError::Timeout(self.handshake_timeout))?
            .map_err(DialError::from_ws)?;

        debug!(status = response.status().as_u16(), "Backend upgrade response");
        Ok(stream)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::StreamExt;
    use tokio::{
        io::{AsyncReadExt, AsyncWriteExt},
        net::TcpListener,
        sync::oneshot,
    };
    use tokio_tungstenite::{
        accept_hdr_async,
        tungstenite::handshake::server::{
            ErrorResponse, Request as ServerRequest, Response as ServerResponse,
        },
    };

    const TEST_TIMEOUT: Duration = Duration::from_secs(2);

    fn dialer(url: &str, handshake_timeout_ms: u64) -> BackendDialer {
        BackendDialer::from_config(&BackendConfig {
            url: url.to_string(),
            host: Some("scan.example.com".to_string()),
            handshake_timeout_ms,
            ..BackendConfig::default()
        })
        .unwrap()
    }

    fn header_map(pairs: &[(&'static str, &'static str)]) -> HeaderMap {
        pairs
            .iter()
            .map(|&(k, v)| (HeaderName::from_static(k), HeaderValue::from_static(v)))
            .collect()
    }

    #[test]
    fn forwards_client_origin_and_agent() {
        let dialer = dialer("ws://127.0.0.1:4000", 1000);
        let incoming = header_map(&[
            ("origin", "https://scan.example.com"),
            ("user-agent", "Mozilla/5.0"),
            ("host", "relay.example.com"),
        ]);

        let headers = dialer.backend_headers(&incoming, "203.0.113.7").unwrap();
        assert_eq!(headers[ORIGIN], "https://scan.example.com");
        assert_eq!(headers[USER_AGENT], "Mozilla/5.0");
        assert_eq!(headers[HOST], "scan.example.com");
        assert_eq!(headers[X_FORWARDED_FOR], "203.0.113.7");
        assert_eq!(headers[X_FORWARDED_PROTO], "https");
    }

    #[test]
    fn fills_defaults_when_client_sent_nothing() {
        let dialer = dialer("ws://127.0.0.1:4000", 1000);
        let headers = dialer.backend_headers(&HeaderMap::new(), "::1").unwrap();
        assert_eq!(headers[ORIGIN], "https://scan.example.com");
        assert_eq!(headers[USER_AGENT], "WebSocket-Relay/1.0");
        assert_eq!(headers[X_FORWARDED_FOR], "::1");
    }

    #[test]
    fn request_targets_base_url_plus_path() {
        let dialer = dialer("ws://127.0.0.1:4000/", 1000);
        let request = dialer
            .build_request("/socket/v2/websocket?vsn=2.0.0", &HeaderMap::new(), "203.0.113.7")
            .unwrap();
        assert_eq!(
            request.uri().to_string(),
            "ws://127.0.0.1:4000/socket/v2/websocket?vsn=2.0.0"
        );
        assert_eq!(request.headers()[HOST], "scan.example.com");
        assert!(request.headers().contains_key("sec-websocket-key"));
    }

    #[test]
    fn close_reason_mentions_origin() {
        let reason = DialError::Timeout(Duration::from_secs(10)).close_reason();
        assert!(reason.starts_with("No WebSocket from origin"));
    }

    #[tokio::test]
    async fn dial_sends_rewritten_request() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let (seen_tx, seen_rx) = oneshot::channel();

        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let callback = move |req: &ServerRequest,
                                 response: ServerResponse|
                  -> Result<ServerResponse, ErrorResponse> {
                let _ = seen_tx.send((req.uri().to_string(), req.headers().clone()));
                Ok(response)
            };
            let mut ws = accept_hdr_async(stream, callback).await.unwrap();
            while ws.next().await.is_some() {}
        });

        let dialer = dialer(&format!("ws://127.0.0.1:{port}"), 1000);
        let incoming = header_map(&[("origin", "https://scan.example.com")]);
        let _stream = dialer
            .dial("/socket/v2/websocket", &incoming, "203.0.113.7")
            .await
            .unwrap();

        let (uri, headers) = tokio::time::timeout(TEST_TIMEOUT, seen_rx)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(uri, "/socket/v2/websocket");
        assert_eq!(headers[HOST], "scan.example.com");
        assert_eq!(headers[X_FORWARDED_FOR], "203.0.113.7");
        assert_eq!(headers[X_FORWARDED_PROTO], "https");
        assert_eq!(headers[ORIGIN], "https://scan.example.com");
    }

    #[tokio::test]
    async fn silent_backend_times_out() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            tokio::time::sleep(Duration::from_secs(5)).await;
            drop(stream);
        });

        let dialer = dialer(&format!("ws://127.0.0.1:{port}"), 200);
        let err = dialer
            .dial("/socket", &HeaderMap::new(), "203.0.113.7")
            .await
            .unwrap_err();
        assert!(matches!(err, DialError::Timeout(_)), "got {err:?}");
    }

    #[tokio::test]
    async fn closed_port_is_refused() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let dialer = dialer(&format!("ws://127.0.0.1:{port}"), 1000);
        let err = dialer
            .dial("/socket", &HeaderMap::new(), "203.0.113.7")
            .await
            .unwrap_err();
        assert!(matches!(err, DialError::Refused), "got {err:?}");
    }

    #[tokio::test]
    async fn non_upgrade_response_captures_status() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let mut buffer = [0u8; 4096];
            let _ = stream.read(&mut buffer).await;
            let _ = stream
                .write_all(b"HTTP/1.1 403 Forbidden\r\nContent-Length: 6\r\nConnection: close\r\n\r\ndenied")
                .await;
            let _ = stream.shutdown().await;
        });

        let dialer = dialer(&format!("ws://127.0.0.1:{port}"), 1000);
        let err = dialer
            .dial("/socket", &HeaderMap::new(), "203.0.113.7")
            .await
            .unwrap_err();
        match err {
            DialError::Rejected { status, .. } => assert_eq!(status, 403),
            other => panic!("expected rejection, got {other:?}"),
        }
    }
}
