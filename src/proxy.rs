use anyhow::{Context, Result};
use hyper::{
    Request, Response,
    body::Incoming,
    header::ORIGIN,
    server::conn::http1,
    service::service_fn,
    upgrade::OnUpgrade,
};
use hyper_util::rt::{TokioIo, TokioTimer};
use std::{
    convert::Infallible,
    net::SocketAddr,
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
};
use tokio_tungstenite::{
    WebSocketStream,
    tungstenite::{http::HeaderMap, protocol::Role},
};
use tracing::{Instrument, debug, info, warn};

use crate::{
    admission::{Admission, AdmissionGate, OriginPolicy, PathRules, UpgradeRequest},
    config::Config,
    dialer::BackendDialer,
    http::{self, Body, HEAD_READ_TIMEOUT, MAX_HEAD_BYTES},
    lifecycle::{Shutdown, Uptime},
    registry::{Limits, Registry},
    relay::{self, PairInfo, RelaySettings},
    security::TrustedProxies,
    stream::StreamType,
};

/// State shared by every connection handled by one server.
#[derive(Debug)]
pub struct RelayContext {
    pub registry: Arc<Registry>,
    pub gate: AdmissionGate,
    pub dialer: BackendDialer,
    pub trusted_proxies: TrustedProxies,
    pub settings: RelaySettings,
    pub uptime: Uptime,
    pub shutdown: Shutdown,
    next_pair_id: AtomicU64,
}

impl RelayContext {
    pub fn from_config(config: &Config) -> Result<Self> {
        let registry = Registry::new(Limits {
            max_connections: config.limits.max_connections,
            max_connections_per_ip: config.limits.max_connections_per_ip,
        });
        let gate = AdmissionGate::new(
            Arc::clone(&registry),
            OriginPolicy::from_list(&config.relay.allowed_origins),
            PathRules::new(&config.relay.path_prefix, &config.relay.strip_prefix),
        );
        let trusted_proxies = TrustedProxies::parse(config.listen.trusted_proxies.as_deref())
            .context("Invalid trusted_proxies")?;

        Ok(Self {
            registry,
            gate,
            dialer: BackendDialer::from_config(&config.backend)
                .context("Invalid backend configuration")?,
            trusted_proxies,
            settings: RelaySettings {
                ping_interval: config.relay.ping_interval(),
                close_timeout: config.relay.close_timeout(),
                max_queued_messages: config.limits.max_queued_messages,
            },
            uptime: Uptime::start(&config.relay.service_name),
            shutdown: Shutdown::new(),
            next_pair_id: AtomicU64::new(1),
        })
    }

    fn next_pair_id(&self) -> u64 {
        self.next_pair_id.fetch_add(1, Ordering::Relaxed)
    }
}

/// Serves one inbound connection: a plain HTTP request gets the status or info
/// page, an upgrade request goes through admission and becomes a relay pair.
#[tracing::instrument(skip_all, fields(peer = %peer))]
pub async fn handle_connection(
    stream: StreamType,
    peer: SocketAddr,
    ctx: Arc<RelayContext>,
) -> Result<()> {
    let service = service_fn(move |req: Request<Incoming>| {
        let response = route(req, peer, &ctx);
        async move { Ok::<_, Infallible>(response) }
    });

    http1::Builder::new()
        .timer(TokioTimer::new())
        .header_read_timeout(HEAD_READ_TIMEOUT)
        .max_buf_size(MAX_HEAD_BYTES)
        .keep_alive(false)
        .serve_connection(TokioIo::new(stream), service)
        .with_upgrades()
        .await
        .context("Failed to serve HTTP connection")
}

fn header<'a>(req: &'a Request<Incoming>, name: &str) -> Option<&'a str> {
    req.headers().get(name).and_then(|value| value.to_str().ok())
}

fn route(
    mut req: Request<Incoming>,
    peer: SocketAddr,
    ctx: &Arc<RelayContext>,
) -> Response<Body> {
    let target = req
        .uri()
        .path_and_query()
        .map_or_else(|| req.uri().path().to_string(), ToString::to_string);

    if !http::is_websocket_upgrade(&req) {
        debug!(method = %req.method(), target = %target, "Plain HTTP request");
        let report = ctx.uptime.report(ctx.registry.connection_count());
        return http::plain_response(req.uri().path(), &report);
    }

    // A malformed handshake is refused before admission so it never holds a slot.
    let accepted = match http::switching_protocols(&req) {
        Ok(response) => response,
        Err(response) => {
            warn!(target = %target, "Malformed WebSocket handshake");
            return response;
        }
    };

    let source_ip = ctx
        .trusted_proxies
        .resolve_source_ip(peer.ip(), header(&req, "x-forwarded-for"));

    let decision = ctx.gate.evaluate(&UpgradeRequest {
        source_ip: &source_ip,
        origin: header(&req, ORIGIN.as_str()),
        target: &target,
    });
    let admission = match decision {
        Ok(admission) => admission,
        Err(rejection) => {
            warn!(
                client_ip = %source_ip,
                target = %target,
                status = rejection.status().as_u16(),
                reason = %rejection,
                "Upgrade rejected"
            );
            return http::rejection_response(&rejection);
        }
    };

    let headers = req.headers().clone();
    let upgrade = hyper::upgrade::on(&mut req);
    let info = PairInfo {
        id: ctx.next_pair_id(),
        source_ip,
        path: target,
    };
    let pair = start_pair(Arc::clone(ctx), upgrade, admission, headers, info);
    tokio::spawn(pair.in_current_span());
    accepted
}

/// Waits for hyper to hand over the upgraded socket, then relays until the pair closes.
async fn start_pair(
    ctx: Arc<RelayContext>,
    upgrade: OnUpgrade,
    admission: Admission,
    headers: HeaderMap,
    info: PairInfo,
) {
    let Admission {
        lease,
        backend_target,
    } = admission;

    let upgraded = match upgrade.await {
        Ok(upgraded) => upgraded,
        Err(e) => {
            warn!(client_ip = %info.source_ip, error = %e, "Client upgrade did not complete");
            return;
        }
    };
    let websocket =
        WebSocketStream::from_raw_socket(TokioIo::new(upgraded), Role::Server, None).await;

    info!(
        client_ip = %info.source_ip,
        backend_target = %backend_target,
        backend_url = %ctx.dialer.url_for(&backend_target),
        "Routing request"
    );
    let source_ip = info.source_ip.clone();
    let dial = ctx.dialer.dial(&backend_target, &headers, &source_ip);
    relay::run(
        info,
        ctx.settings,
        websocket,
        dial,
        ctx.shutdown.subscribe(),
        lease,
    )
    .await;
}
