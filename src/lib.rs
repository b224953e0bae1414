//! WebSocket Relay Server
//!
//! Accepts browser WebSocket upgrades, admits them against global and per-IP
//! limits, an origin allow-list and a path prefix, then pairs each client with
//! its own WebSocket to a fixed backend and relays frames verbatim both ways.
//! Frames sent before the backend is ready are queued, close codes are
//! translated across legs, and shutdown closes every client with 1001.

pub mod admission;
pub mod config;
pub mod dialer;
pub mod http;
pub mod lifecycle;
pub mod proxy;
pub mod registry;
pub mod relay;
pub mod security;
pub mod server;
pub mod stream;
pub mod tls;

// Re-export commonly used types and functions
pub use admission::{AdmissionGate, OriginPolicy, PathRules, Rejection};
pub use config::{BackendConfig, Config, LimitsConfig, ListenConfig, RelayConfig, TlsConfig};
pub use dialer::{BackendDialer, DialError};
pub use lifecycle::{Shutdown, StatusReport, termination_signal};
pub use proxy::{RelayContext, handle_connection};
pub use registry::{CapacityError, ConnectionLease, Limits, Registry};
pub use relay::{PairState, RelaySettings, relayable_close_code};
pub use security::{TrustedProxies, parse_original_client_ip};
pub use server::RelayServer;
pub use stream::StreamType;
