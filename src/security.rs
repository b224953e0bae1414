use anyhow::{Result, anyhow};
use ipnet::IpNet;
use std::net::IpAddr;

/// Parses the original client IP from X-Forwarded-For header
/// Format: "client, proxy1, proxy2, ..." - returns the leftmost (original client) IP
#[must_use]
pub fn parse_original_client_ip(xff_header: &str) -> Option<String> {
    xff_header
        .split(',')
        .next()
        .map(|ip| ip.trim().to_string())
        .filter(|ip| !ip.is_empty())
}

/// Peers whose `X-Forwarded-For` header is believed.
#[derive(Debug, Clone, Default)]
pub struct TrustedProxies {
    networks: Option<Vec<IpNet>>,
}

impl TrustedProxies {
    /// `None` trusts every peer, which is the usual deployment behind a tunnel.
    pub fn parse(entries: Option<&[String]>) -> Result<Self> {
        let Some(entries) = entries else {
            return Ok(Self::default());
        };

        let networks = entries
            .iter()
            .map(|entry| {
                entry
                    .parse::<IpAddr>()
                    .map(IpNet::from)
                    .or_else(|_| entry.parse::<IpNet>())
                    .map_err(|_| anyhow!("Invalid IP address or CIDR in trusted_proxies: {entry}"))
            })
            .collect::<Result<Vec<_>>>()?;

        Ok(Self {
            networks: Some(networks),
        })
    }

    #[must_use]
    pub fn trusts(&self, peer: IpAddr) -> bool {
        self.networks
            .as_ref()
            .is_none_or(|networks| networks.iter().any(|net| net.contains(&peer)))
    }

    /// Source IP used for per-IP accounting and `X-Forwarded-For` on the backend leg.
    #[must_use]
    pub fn resolve_source_ip(&self, peer: IpAddr, forwarded_for: Option<&str>) -> String {
        forwarded_for
            .filter(|_| self.trusts(peer))
            .and_then(parse_original_client_ip)
            .unwrap_or_else(|| peer.to_string())
    }
}
