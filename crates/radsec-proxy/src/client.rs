//! Inbound peers and their reply writers
//!
//! A client is a configured inbound peer. Replies to it flow through a
//! bounded [`ReplyQueue`] drained by exactly one writer task: the shared
//! datagram writer on the listening socket, or the per-session stream
//! writer. TLS clients get at most one live session; a second connection
//! from the same client while one is established is rejected at accept
//! time.

use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpStream, UdpSocket};
use tokio::sync::Notify;
use tokio_rustls::TlsAcceptor;
use tracing::{debug, warn};

use radsec_proto::auth;

use crate::ProxyCtx;
use crate::handler::{self, Request};
use crate::peers::ResolvedPeer;
use crate::replyq::{Reply, ReplyQueue};
use crate::tls::{self, TlsContext};
use crate::transport;

pub struct Client {
    pub conf: ResolvedPeer,
    pub tls: Option<Arc<TlsContext>>,
    pub replyq: Arc<ReplyQueue>,
    session_active: AtomicBool,
}

impl Client {
    pub fn new(
        conf: ResolvedPeer,
        tls: Option<Arc<TlsContext>>,
        replyq: Arc<ReplyQueue>,
    ) -> Arc<Client> {
        Arc::new(Client {
            conf,
            tls,
            replyq,
            session_active: AtomicBool::new(false),
        })
    }

    pub fn secret(&self) -> &[u8] {
        self.conf.entry.secret.as_bytes()
    }

    /// Claim the single stream session slot. Returns false if a session
    /// is already established.
    pub fn try_claim_session(&self) -> bool {
        !self.session_active.swap(true, Ordering::AcqRel)
    }

    pub fn release_session(&self) {
        self.session_active.store(false, Ordering::Release);
    }
}

/// Sign a reply under the client's secret and queue it for transmission.
///
/// The authenticator field must hold the request authenticator at this
/// point; the signature replaces it.
pub fn send_reply(client: &Client, mut buf: Vec<u8>, to: Option<SocketAddr>) {
    auth::sign_reply(&mut buf, client.secret());
    client.replyq.push(Reply { buf, to });
}

/// Writer task for all datagram clients, sending on the listening socket.
pub async fn udp_reply_writer(socket: Arc<UdpSocket>, replyq: Arc<ReplyQueue>) {
    loop {
        let reply = replyq.pop().await;
        let Some(to) = reply.to else { continue };
        if let Err(e) = socket.send_to(&reply.buf, to).await {
            warn!(error = %e, "send failed");
        }
    }
}

/// Writer task for one stream session. Exits on the shutdown signal,
/// answering the peer's close with a clean shutdown of its own.
pub async fn stream_reply_writer<W: AsyncWrite + Unpin>(
    mut writer: W,
    replyq: Arc<ReplyQueue>,
    shutdown: Arc<Notify>,
) {
    loop {
        tokio::select! {
            reply = replyq.pop() => {
                if let Err(e) = transport::write_frame(&mut writer, &reply.buf).await {
                    warn!(error = %e, "stream write failed");
                } else {
                    debug!(len = reply.buf.len(), "sent radius reply on stream");
                }
            }
            _ = shutdown.notified() => {
                let _ = writer.shutdown().await;
                debug!("stream reply writer exiting as requested");
                return;
            }
        }
    }
}

/// One accepted TLS session: handshake, identity check, then a reply
/// writer task plus the inline read loop feeding the request handler.
///
/// The caller has already claimed the client's session slot; it is
/// released on every exit path here.
pub async fn tls_session(ctx: Arc<ProxyCtx>, client_idx: usize, tcp: TcpStream) {
    let client = ctx.clients[client_idx].clone();
    let host = client.conf.entry.host.clone();
    debug!(host, "tls session starting");

    let result = async {
        let Some(tls) = client.tls.clone() else {
            return Err("no tls context".to_string());
        };
        let acceptor = TlsAcceptor::from(tls.server.clone());
        let stream = acceptor.accept(tcp).await.map_err(|e| e.to_string())?;

        let (_, conn) = stream.get_ref();
        let certs = conn.peer_certificates().unwrap_or(&[]);
        if !tls::peer_matches_host(certs, &host) {
            return Err("peer certificate does not match host".to_string());
        }
        Ok(stream)
    }
    .await;

    let stream = match result {
        Ok(stream) => stream,
        Err(e) => {
            warn!(host, error = %e, "rejecting TLS connection");
            client.release_session();
            return;
        }
    };

    let (mut reader, writer) = tokio::io::split(stream);
    let shutdown = Arc::new(Notify::new());
    let writer_task = tokio::spawn(stream_reply_writer(
        writer,
        client.replyq.clone(),
        shutdown.clone(),
    ));

    loop {
        match transport::read_frame(&mut reader).await {
            Ok(Some(buf)) => {
                debug!(host, "got radius message from client");
                handler::handle_request(
                    &ctx,
                    Request {
                        buf,
                        from: client_idx,
                        from_addr: None,
                    },
                );
            }
            Ok(None) => break,
            Err(e) => {
                debug!(host, error = %e, "stream read failed");
                break;
            }
        }
    }
    warn!(host, "connection lost");

    shutdown.notify_one();
    let _ = writer_task.await;
    client.release_session();
    debug!(host, "tls session ended");
}
