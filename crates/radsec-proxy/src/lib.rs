//! RADIUS forwarding proxy
//!
//! Accepts authentication requests from configured clients over UDP and
//! RADIUS-over-TLS, routes them by User-Name realm to an upstream server,
//! rewrites password-bearing attributes between the shared secrets,
//! correlates the reply and relays it back. Upstreams are probed with
//! Status-Server keepalives when enabled.
//!
//! # Task layout
//!
//! - one datagram ingest task plus one datagram reply writer, if any UDP
//!   clients are configured (all UDP clients share the listening socket
//!   and one reply queue)
//! - one stream listener task if any TLS clients are configured; each
//!   accepted session runs a reader inline and spawns a reply writer
//! - one writer task per upstream, which spawns the upstream's reader
//!   after the first connect

pub mod client;
pub mod config;
pub mod error;
pub mod handler;
pub mod peers;
pub mod realm;
pub mod replyq;
pub mod tls;
pub mod transport;
pub mod upstream;

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::Arc;

use tokio::net::{TcpListener, UdpSocket};
use tracing::{info, warn};

use crate::client::Client;
use crate::config::{Config, DEFAULT_TLS_PORT, DEFAULT_UDP_PORT, ListenAddr, Transport};
use crate::error::{ConfigError, ConfigResult};
use crate::handler::Request;
use crate::peers::ResolvedPeer;
use crate::realm::Realm;
use crate::replyq::ReplyQueue;
use crate::upstream::{MAX_REQUESTS, Upstream};

/// Everything the steady-state tasks share: startup-frozen peer tables
/// and the realm list. Request slots refer to clients by index into
/// `clients`, never by owning reference.
pub struct ProxyCtx {
    pub clients: Vec<Arc<Client>>,
    pub upstreams: Vec<Arc<Upstream>>,
    pub realms: Vec<Realm>,
    /// Reply queue shared by all datagram clients.
    pub udp_replyq: Option<Arc<ReplyQueue>>,
}

/// Resolve the configuration into the runtime peer tables. All failures
/// here are configuration-fatal.
pub fn build(config: &Config) -> ConfigResult<ProxyCtx> {
    if config.servers.is_empty() {
        return Err(ConfigError::Invalid(
            "no servers configured, nothing to do".to_string(),
        ));
    }
    if config.clients.is_empty() {
        return Err(ConfigError::Invalid(
            "no clients configured, nothing to do".to_string(),
        ));
    }
    if config.realms.is_empty() {
        return Err(ConfigError::Invalid(
            "no realms configured, nothing to do".to_string(),
        ));
    }

    let contexts = tls::build_contexts(&config.tls)?;
    let context_for =
        |entry: &config::PeerEntry| -> ConfigResult<Option<Arc<tls::TlsContext>>> {
            match &entry.tls {
                Some(name) => Ok(Some(
                    tls::get_context(&contexts, name)
                        .ok_or_else(|| ConfigError::NoTlsContext(entry.host.clone()))?
                        .clone(),
                )),
                None => Ok(None),
            }
        };

    let udp_client_count = config
        .clients
        .iter()
        .filter(|c| c.transport == Transport::Udp)
        .count();
    let udp_replyq = (udp_client_count > 0)
        .then(|| Arc::new(ReplyQueue::new(udp_client_count * MAX_REQUESTS)));

    let mut clients = Vec::with_capacity(config.clients.len());
    for entry in &config.clients {
        let tls = context_for(entry)?;
        let replyq = match entry.transport {
            Transport::Udp => udp_replyq.as_ref().unwrap().clone(),
            Transport::Tls => Arc::new(ReplyQueue::new(MAX_REQUESTS)),
        };
        let conf = ResolvedPeer::new(entry.clone(), 0)?;
        clients.push(Client::new(conf, tls, replyq));
    }

    let mut upstreams = Vec::with_capacity(config.servers.len());
    for entry in &config.servers {
        let tls = context_for(entry)?;
        let default_port = match entry.transport {
            Transport::Udp => DEFAULT_UDP_PORT,
            Transport::Tls => DEFAULT_TLS_PORT,
        };
        let conf = ResolvedPeer::new(entry.clone(), default_port)?;
        upstreams.push(Upstream::new(conf, tls));
    }

    let realms = Realm::build(&config.realms, |name| {
        config
            .servers
            .iter()
            .position(|s| s.host.eq_ignore_ascii_case(name))
    })?;

    Ok(ProxyCtx {
        clients,
        upstreams,
        realms,
        udp_replyq,
    })
}

/// Run the proxy until interrupted. Startup errors are fatal; after the
/// listeners and upstream writers are up, nothing is.
pub async fn run(config: Config) -> ConfigResult<()> {
    let ctx = Arc::new(build(&config)?);

    for upstream in &ctx.upstreams {
        upstream.prepare().await?;
    }

    let has_udp_clients = ctx
        .clients
        .iter()
        .any(|c| c.conf.entry.transport == Transport::Udp);
    let has_tls_clients = ctx
        .clients
        .iter()
        .any(|c| c.conf.entry.transport == Transport::Tls);

    if has_udp_clients {
        let listen = config.listen_udp.clone().unwrap_or(ListenAddr {
            host: None,
            port: DEFAULT_UDP_PORT,
        });
        let socket = Arc::new(bind_udp(&listen).await?);
        warn!(
            host = listen.host.as_deref().unwrap_or("*"),
            port = listen.port,
            "listening for UDP"
        );
        tokio::spawn(client::udp_reply_writer(
            socket.clone(),
            ctx.udp_replyq.as_ref().unwrap().clone(),
        ));
        tokio::spawn(udp_ingest(socket, ctx.clone()));
    }

    for upstream in &ctx.upstreams {
        tokio::spawn(upstream::writer_task(upstream.clone(), ctx.clone()));
    }

    if has_tls_clients {
        let listen = config.listen_tcp.clone().unwrap_or(ListenAddr {
            host: None,
            port: DEFAULT_TLS_PORT,
        });
        let listener = bind_tcp(&listen).await?;
        warn!(
            host = listen.host.as_deref().unwrap_or("*"),
            port = listen.port,
            "listening for incoming TCP"
        );
        tokio::spawn(tls_listener(listener, ctx.clone()));
    }

    tokio::signal::ctrl_c().await.ok();
    info!("shutting down");
    Ok(())
}

fn listen_addrs(listen: &ListenAddr) -> ConfigResult<Vec<SocketAddr>> {
    match &listen.host {
        Some(host) => peers::resolve(host, listen.port),
        None => Ok(vec![
            SocketAddr::new(IpAddr::V6(Ipv6Addr::UNSPECIFIED), listen.port),
            SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), listen.port),
        ]),
    }
}

async fn bind_udp(listen: &ListenAddr) -> ConfigResult<UdpSocket> {
    for addr in listen_addrs(listen)? {
        if let Ok(socket) = UdpSocket::bind(addr).await {
            return Ok(socket);
        }
    }
    Err(ConfigError::Invalid(format!(
        "cannot bind UDP listener on port {}",
        listen.port
    )))
}

async fn bind_tcp(listen: &ListenAddr) -> ConfigResult<TcpListener> {
    for addr in listen_addrs(listen)? {
        if let Ok(listener) = TcpListener::bind(addr).await {
            return Ok(listener);
        }
    }
    Err(ConfigError::Invalid(format!(
        "cannot bind TCP listener on port {}",
        listen.port
    )))
}

/// Datagram ingest: receive, validate, attribute the packet to a
/// configured client and hand it to the request handler.
async fn udp_ingest(socket: Arc<UdpSocket>, ctx: Arc<ProxyCtx>) {
    let mut buf = vec![0u8; transport::UDP_RECV_SIZE];
    loop {
        let (cnt, src) = match socket.recv_from(&mut buf).await {
            Ok(received) => received,
            Err(e) => {
                warn!(error = %e, "recv failed");
                continue;
            }
        };
        let Some(len) = transport::check_datagram(cnt, &buf) else {
            continue;
        };
        let Some(from) = peers::find_peer(
            ctx.clients.iter().map(|c| &c.conf),
            Transport::Udp,
            src.ip(),
        ) else {
            warn!(%src, "got packet from wrong or unknown UDP peer, ignoring");
            continue;
        };
        handler::handle_request(
            &ctx,
            Request {
                buf: buf[..len].to_vec(),
                from,
                from_addr: Some(src),
            },
        );
    }
}

/// Stream listener: attribute each connection to a configured TLS client,
/// enforce the single-session rule and spawn the session task.
async fn tls_listener(listener: TcpListener, ctx: Arc<ProxyCtx>) {
    loop {
        let (stream, src) = match listener.accept().await {
            Ok(accepted) => accepted,
            Err(e) => {
                warn!(error = %e, "accept failed");
                continue;
            }
        };
        warn!(%src, "incoming TLS connection");

        let Some(from) = peers::find_peer(
            ctx.clients.iter().map(|c| &c.conf),
            Transport::Tls,
            src.ip(),
        ) else {
            warn!(%src, "ignoring connection, not a known TLS client");
            continue;
        };
        if !ctx.clients[from].try_claim_session() {
            warn!(%src, "ignoring incoming TLS connection, already have one from this client");
            continue;
        }
        tokio::spawn(client::tls_session(ctx.clone(), from, stream));
    }
}
