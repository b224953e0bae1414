use anyhow::{Context, Result, anyhow, bail};
use serde::Deserialize;
use std::{env, fs, path::Path, str::FromStr, time::Duration};
use tokio_tungstenite::tungstenite::http::Uri;

pub const DEFAULT_CONFIG_FILE: &str = "config.toml";
pub const CONFIG_PATH_ENV: &str = "RELAY_CONFIG";

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    pub listen: ListenConfig,
    pub backend: BackendConfig,
    pub limits: LimitsConfig,
    pub relay: RelayConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ListenConfig {
    pub ip: String,
    pub port: u16,
    /// Peers allowed to supply `X-Forwarded-For`. `None` trusts every peer.
    pub trusted_proxies: Option<Vec<String>>,
    pub tls: Option<TlsConfig>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TlsConfig {
    pub cert_file: String,
    pub key_file: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct BackendConfig {
    /// Base URL; the client's (rewritten) path is appended to it.
    pub url: String,
    /// Canonical Host header sent to the backend. Defaults to the URL's host.
    pub host: Option<String>,
    /// Origin used when the client did not send one. Defaults to `https://<host>`.
    pub origin: Option<String>,
    pub user_agent: String,
    pub handshake_timeout_ms: u64,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct LimitsConfig {
    pub max_connections: usize,
    pub max_connections_per_ip: usize,
    pub max_queued_messages: usize,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RelayConfig {
    /// Exact origins, or `*` as the first entry to accept any.
    pub allowed_origins: Vec<String>,
    pub path_prefix: String,
    /// Alternate prefix accepted in front of `path_prefix` and removed before dialing.
    pub strip_prefix: String,
    pub ping_interval_ms: u64,
    pub close_timeout_ms: u64,
    pub shutdown_grace_ms: u64,
    pub service_name: String,
}

impl Default for ListenConfig {
    fn default() -> Self {
        Self {
            ip: "0.0.0.0".to_string(),
            port: 3000,
            trusted_proxies: None,
            tls: None,
        }
    }
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            url: "ws://127.0.0.1:4000".to_string(),
            host: None,
            origin: None,
            user_agent: "WebSocket-Relay/1.0".to_string(),
            handshake_timeout_ms: 10_000,
        }
    }
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            max_connections: 1000,
            max_connections_per_ip: 10,
            max_queued_messages: 1024,
        }
    }
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            allowed_origins: vec!["*".to_string()],
            path_prefix: "/socket".to_string(),
            strip_prefix: "/ws-relay".to_string(),
            ping_interval_ms: 30_000,
            close_timeout_ms: 5_000,
            shutdown_grace_ms: 10_000,
            service_name: "websocket-relay".to_string(),
        }
    }
}

impl BackendConfig {
    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_millis(self.handshake_timeout_ms)
    }

    /// Host header value presented to the backend.
    pub fn canonical_host(&self) -> Result<String> {
        if let Some(host) = &self.host {
            return Ok(host.clone());
        }
        let uri = parse_backend_uri(&self.url)?;
        uri.host()
            .map(str::to_string)
            .ok_or_else(|| anyhow!("Backend URL has no host: {}", self.url))
    }

    pub fn default_origin(&self) -> Result<String> {
        match &self.origin {
            Some(origin) => Ok(origin.clone()),
            None => Ok(format!("https://{}", self.canonical_host()?)),
        }
    }
}

impl RelayConfig {
    pub fn ping_interval(&self) -> Duration {
        Duration::from_millis(self.ping_interval_ms)
    }

    pub fn close_timeout(&self) -> Duration {
        Duration::from_millis(self.close_timeout_ms)
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_millis(self.shutdown_grace_ms)
    }
}

impl Config {
    /// Loads the TOML file (if any), applies environment overrides and validates.
    pub fn load() -> Result<Self> {
        let path = env::var(CONFIG_PATH_ENV).unwrap_or_else(|_| DEFAULT_CONFIG_FILE.to_string());
        let mut config = if Path::new(&path).exists() {
            Self::from_file(&path)?
        } else {
            Self::default()
        };
        config.apply_overrides(|key| env::var(key).ok())?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: &str) -> Result<Self> {
        let content =
            fs::read_to_string(path).with_context(|| format!("Failed to read {path} file"))?;
        Self::from_toml(&content).with_context(|| format!("Failed to parse {path} as valid TOML"))
    }

    pub fn from_toml(content: &str) -> Result<Self> {
        Ok(toml::from_str(content)?)
    }

    /// Applies the deployment environment variables on top of the file values.
    pub fn apply_overrides<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(ip) = lookup("LISTEN_IP") {
            self.listen.ip = ip;
        }
        if let Some(port) = lookup("PORT") {
            self.listen.port = parse_override("PORT", &port)?;
        }
        if let Some(url) = lookup("BACKEND_WS_URL") {
            self.backend.url = url;
        }
        if let Some(host) = lookup("BACKEND_HOST") {
            self.backend.host = Some(host);
        }
        if let Some(origins) = lookup("ALLOWED_ORIGINS") {
            self.relay.allowed_origins = parse_origin_list(&origins);
        }
        if let Some(max) = lookup("MAX_CONNECTIONS") {
            self.limits.max_connections = parse_override("MAX_CONNECTIONS", &max)?;
        }
        if let Some(max) = lookup("MAX_CONNECTIONS_PER_IP") {
            self.limits.max_connections_per_ip = parse_override("MAX_CONNECTIONS_PER_IP", &max)?;
        }
        if let Some(ms) = lookup("PING_INTERVAL_MS") {
            self.relay.ping_interval_ms = parse_override("PING_INTERVAL_MS", &ms)?;
        }
        if let Some(ms) = lookup("HANDSHAKE_TIMEOUT_MS") {
            self.backend.handshake_timeout_ms = parse_override("HANDSHAKE_TIMEOUT_MS", &ms)?;
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        parse_backend_uri(&self.backend.url)?;
        self.backend.canonical_host()?;
        if self.limits.max_connections == 0 {
            bail!("limits.max_connections must be greater than zero");
        }
        if self.limits.max_connections_per_ip == 0 {
            bail!("limits.max_connections_per_ip must be greater than zero");
        }
        if self.limits.max_queued_messages == 0 {
            bail!("limits.max_queued_messages must be greater than zero");
        }
        if self.relay.ping_interval_ms == 0 {
            bail!("relay.ping_interval_ms must be greater than zero");
        }
        if self.backend.handshake_timeout_ms == 0 {
            bail!("backend.handshake_timeout_ms must be greater than zero");
        }
        if self.relay.allowed_origins.is_empty() {
            bail!("relay.allowed_origins must list at least one origin or \"*\"");
        }
        if !self.relay.path_prefix.starts_with('/') {
            bail!("relay.path_prefix must start with '/'");
        }
        Ok(())
    }
}

/// Splits a comma separated origin list, dropping empty entries.
#[must_use]
pub fn parse_origin_list(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(str::trim)
        .filter(|origin| !origin.is_empty())
        .map(str::to_string)
        .collect()
}

fn parse_override<T>(key: &str, value: &str) -> Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    value
        .trim()
        .parse()
        .with_context(|| format!("Invalid value for {key}: {value:?}"))
}

fn parse_backend_uri(url: &str) -> Result<Uri> {
    let uri: Uri = url
        .parse()
        .with_context(|| format!("Invalid backend URL: {url}"))?;
    match uri.scheme_str() {
        Some("ws" | "wss") => {}
        _ => bail!("Backend URL must use ws:// or wss://: {url}"),
    }
    if uri.host().is_none() {
        bail!("Backend URL has no host: {url}");
    }
    Ok(uri)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect();
        move |key| vars.get(key).cloned()
    }

    #[test]
    fn defaults_are_valid() {
        let config = Config::default();
        config.validate().unwrap();
        assert_eq!(config.listen.port, 3000);
        assert_eq!(config.limits.max_connections, 1000);
        assert_eq!(config.limits.max_connections_per_ip, 10);
        assert_eq!(config.relay.allowed_origins, vec!["*"]);
        assert_eq!(config.relay.ping_interval(), Duration::from_secs(30));
        assert_eq!(config.backend.handshake_timeout(), Duration::from_secs(10));
    }

    #[test]
    fn parses_partial_toml() {
        let config = Config::from_toml(
            r#"
            [listen]
            port = 8080
            trusted_proxies = ["10.0.0.0/8"]

            [backend]
            url = "wss://backend.internal:4443"
            host = "scan.example.com"

            [relay]
            allowed_origins = ["https://scan.example.com"]
            "#,
        )
        .unwrap();

        assert_eq!(config.listen.port, 8080);
        assert_eq!(config.listen.ip, "0.0.0.0");
        assert_eq!(
            config.listen.trusted_proxies,
            Some(vec!["10.0.0.0/8".to_string()])
        );
        assert_eq!(config.backend.canonical_host().unwrap(), "scan.example.com");
        assert_eq!(
            config.backend.default_origin().unwrap(),
            "https://scan.example.com"
        );
        assert_eq!(config.limits.max_connections_per_ip, 10);
        config.validate().unwrap();
    }

    #[test]
    fn rejects_unknown_fields() {
        assert!(Config::from_toml("[listen]\nprot = 1\n").is_err());
    }

    #[test]
    fn canonical_host_falls_back_to_url_host() {
        let backend = BackendConfig {
            url: "ws://blockscout-backend:4000".to_string(),
            ..BackendConfig::default()
        };
        assert_eq!(backend.canonical_host().unwrap(), "blockscout-backend");
        assert_eq!(
            backend.default_origin().unwrap(),
            "https://blockscout-backend"
        );
    }

    #[test]
    fn environment_overrides_file_values() {
        let mut config = Config::default();
        config
            .apply_overrides(lookup_from(&[
                ("PORT", "9000"),
                ("BACKEND_WS_URL", "ws://backend:4000"),
                ("ALLOWED_ORIGINS", "https://a.example, https://b.example,"),
                ("MAX_CONNECTIONS", "2"),
                ("MAX_CONNECTIONS_PER_IP", "5"),
                ("PING_INTERVAL_MS", "1500"),
            ]))
            .unwrap();

        assert_eq!(config.listen.port, 9000);
        assert_eq!(config.backend.url, "ws://backend:4000");
        assert_eq!(
            config.relay.allowed_origins,
            vec!["https://a.example", "https://b.example"]
        );
        assert_eq!(config.limits.max_connections, 2);
        assert_eq!(config.limits.max_connections_per_ip, 5);
        assert_eq!(config.relay.ping_interval(), Duration::from_millis(1500));
        config.validate().unwrap();
    }

    #[test]
    fn invalid_numeric_override_is_an_error() {
        let mut config = Config::default();
        let err = config
            .apply_overrides(lookup_from(&[("MAX_CONNECTIONS", "lots")]))
            .unwrap_err();
        assert!(err.to_string().contains("MAX_CONNECTIONS"));
    }

    #[test]
    fn validation_catches_bad_values() {
        let mut config = Config::default();
        config.backend.url = "http://backend:4000".to_string();
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.limits.max_connections_per_ip = 0;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.relay.allowed_origins.clear();
        assert!(config.validate().is_err());
    }
}
