//! HTTP/1.1 surface served through hyper: the status and info pages, upgrade
//! detection and the `101 Switching Protocols` answer.

use http_body_util::Full;
use hyper::{
    Method, Request, Response, StatusCode,
    body::Bytes,
    header::{
        CONNECTION, CONTENT_TYPE, HeaderValue, SEC_WEBSOCKET_ACCEPT, SEC_WEBSOCKET_KEY,
        SEC_WEBSOCKET_VERSION, UPGRADE,
    },
};
use std::time::Duration;
use tokio_tungstenite::tungstenite::handshake::derive_accept_key;
use tracing::warn;

use crate::{admission::Rejection, lifecycle::StatusReport};

pub type Body = Full<Bytes>;

/// Largest request head the server buffers before giving up on the connection.
pub const MAX_HEAD_BYTES: usize = 16 * 1024;
pub const HEAD_READ_TIMEOUT: Duration = Duration::from_secs(10);

pub const INFO_BODY: &str =
    "WebSocket Relay Server\nConnect via WebSocket to /socket/v2/websocket";

const JSON: &str = "application/json";
const TEXT: &str = "text/plain";

pub fn is_websocket_upgrade<B>(req: &Request<B>) -> bool {
    req.headers()
        .get(UPGRADE)
        .and_then(|value| value.to_str().ok())
        .is_some_and(|value| value.trim().eq_ignore_ascii_case("websocket"))
}

pub fn is_status_query(path: &str) -> bool {
    path == "/health" || path == "/"
}

fn respond_with(
    status: StatusCode,
    content_type: &'static str,
    body: impl Into<Bytes>,
) -> Response<Body> {
    let mut response = Response::new(Full::new(body.into()));
    *response.status_mut() = status;
    response
        .headers_mut()
        .insert(CONTENT_TYPE, HeaderValue::from_static(content_type));
    response
}

/// Answers a non-upgrade request: JSON status on `/` and `/health`, the info text elsewhere.
pub fn plain_response(path: &str, report: &StatusReport) -> Response<Body> {
    if !is_status_query(path) {
        return respond_with(StatusCode::OK, TEXT, INFO_BODY);
    }
    match serde_json::to_vec(report) {
        Ok(body) => respond_with(StatusCode::OK, JSON, body),
        Err(e) => {
            warn!(error = %e, "Failed to encode status report");
            respond_with(StatusCode::INTERNAL_SERVER_ERROR, TEXT, "Status unavailable")
        }
    }
}

/// The refusal sent instead of `101`: the rejection's status with its reason as the body.
pub fn rejection_response(rejection: &Rejection) -> Response<Body> {
    respond_with(rejection.status(), TEXT, rejection.to_string())
}

fn bad_handshake() -> Response<Body> {
    respond_with(StatusCode::BAD_REQUEST, TEXT, "Invalid WebSocket handshake")
}

/// Validates the client's handshake headers and builds the `101` answer.
///
/// Only `GET` with `Sec-WebSocket-Version: 13` and a key is accepted; anything
/// else gets the `400` carried in `Err`.
pub fn switching_protocols<B>(req: &Request<B>) -> Result<Response<Body>, Response<Body>> {
    let headers = req.headers();
    let version_ok = headers
        .get(SEC_WEBSOCKET_VERSION)
        .is_some_and(|value| value.as_bytes() == b"13");
    let key = headers
        .get(SEC_WEBSOCKET_KEY)
        .filter(|_| version_ok && req.method() == Method::GET)
        .ok_or_else(bad_handshake)?;
    let accept =
        HeaderValue::from_str(&derive_accept_key(key.as_bytes())).map_err(|_| bad_handshake())?;

    let mut response = Response::new(Body::default());
    *response.status_mut() = StatusCode::SWITCHING_PROTOCOLS;
    let out = response.headers_mut();
    out.insert(CONNECTION, HeaderValue::from_static("Upgrade"));
    out.insert(UPGRADE, HeaderValue::from_static("websocket"));
    out.insert(SEC_WEBSOCKET_ACCEPT, accept);
    Ok(response)
}
