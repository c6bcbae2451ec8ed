//! Upstream servers: request table, correlation and transport tasks
//!
//! Each upstream owns a 256-slot table of outstanding requests indexed by
//! the RADIUS identifier byte, a writer task that transmits and retries
//! them, and a reader task that correlates replies. The table mutex also
//! guards the new-request flag; the connection state has its own lock so
//! a blocked reconnect never stalls request ingestion.
//!
//! Slot lifecycle: a slot is taken by [`Upstream::send_request`], holds the
//! outgoing buffer (byte 1 patched to the slot index) plus the origin
//! bookkeeping, and is only cleared by the writer sweep once the reader
//! has marked it received or its retry budget is gone. While a slot is
//! live, a second request with the same (origin client, original id) is a
//! retransmit and is dropped.

use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use rand::Rng;
use tokio::io::{ReadHalf, WriteHalf};
use tokio::net::{TcpStream, UdpSocket};
use tokio::sync::Notify;
use tokio_rustls::TlsConnector;
use tokio_rustls::client::TlsStream;
use tokio_rustls::rustls::pki_types::ServerName;
use tracing::{debug, info, warn};

use radsec_proto::packet::{self, Code};
use radsec_proto::{attrs, auth, message_auth, mppe};

use crate::client::{Client, send_reply};
use crate::config::Transport;
use crate::error::{ConfigError, ConfigResult};
use crate::peers::ResolvedPeer;
use crate::tls::{self, TlsContext};
use crate::ProxyCtx;
use crate::transport::{self, Backoff, UDP_RECV_SIZE};

/// Request table size; also the id space, so one slot per identifier.
pub const MAX_REQUESTS: usize = 256;
/// Send attempts for datagram requests.
pub const REQUEST_RETRIES: u8 = 3;
/// Total time a request may stay in the table without a reply.
pub const REQUEST_EXPIRY: Duration = Duration::from_secs(20);
/// Keepalive probe interval (jittered by 0-7 s).
pub const STATUS_SERVER_PERIOD: Duration = Duration::from_secs(25);

/// One outstanding forwarded request (or keepalive probe).
pub struct PendingRequest {
    /// Outgoing wire buffer; byte 1 holds the slot index once queued.
    pub buf: Vec<u8>,
    /// Origin client as an index into the startup-frozen client table;
    /// `None` for Status-Server probes.
    pub from: Option<usize>,
    /// Source address of the originating datagram.
    pub from_addr: Option<SocketAddr>,
    /// Identifier the origin client used.
    pub orig_id: u8,
    /// Request authenticator the origin client sent.
    pub orig_auth: [u8; 16],
    pub tries: u8,
    pub expiry: Option<Instant>,
    pub received: bool,
}

impl PendingRequest {
    pub fn forwarded(
        buf: Vec<u8>,
        from: usize,
        from_addr: Option<SocketAddr>,
        orig_id: u8,
        orig_auth: [u8; 16],
    ) -> PendingRequest {
        PendingRequest {
            buf,
            from: Some(from),
            from_addr,
            orig_id,
            orig_auth,
            tries: 0,
            expiry: None,
            received: false,
        }
    }

    pub fn probe(buf: Vec<u8>) -> PendingRequest {
        PendingRequest {
            buf,
            from: None,
            from_addr: None,
            orig_id: 0,
            orig_auth: [0; 16],
            tries: 0,
            expiry: None,
            received: false,
        }
    }

    fn is_status_server(&self) -> bool {
        self.buf[0] == Code::StatusServer.as_u8()
    }
}

struct RequestTable {
    slots: Vec<Option<PendingRequest>>,
    next_id: usize,
    new_request: bool,
}

/// Connection bookkeeping readable without taking the connection lock.
struct ConnMeta {
    last_attempt: Option<Instant>,
    connection_ok: bool,
}

enum Link {
    Udp(Arc<UdpSocket>),
    Tls(WriteHalf<TlsStream<TcpStream>>),
}

struct ConnIo {
    link: Option<Link>,
    /// Read half of a fresh stream, parked here until the reader task
    /// picks it up.
    reader: Option<ReadHalf<TlsStream<TcpStream>>>,
}

struct SweepPlan {
    send: Vec<Vec<u8>>,
    next_expiry: Option<Instant>,
}

pub struct Upstream {
    pub conf: ResolvedPeer,
    pub tls: Option<Arc<TlsContext>>,
    table: Mutex<RequestTable>,
    new_request: Notify,
    io: tokio::sync::Mutex<ConnIo>,
    meta: Mutex<ConnMeta>,
    reader_ready: Notify,
}

impl Upstream {
    pub fn new(conf: ResolvedPeer, tls: Option<Arc<TlsContext>>) -> Arc<Upstream> {
        Arc::new(Upstream {
            conf,
            tls,
            table: Mutex::new(RequestTable {
                slots: (0..MAX_REQUESTS).map(|_| None).collect(),
                next_id: 0,
                new_request: false,
            }),
            new_request: Notify::new(),
            io: tokio::sync::Mutex::new(ConnIo {
                link: None,
                reader: None,
            }),
            meta: Mutex::new(ConnMeta {
                last_attempt: None,
                connection_ok: false,
            }),
            reader_ready: Notify::new(),
        })
    }

    pub fn secret(&self) -> &[u8] {
        self.conf.entry.secret.as_bytes()
    }

    fn is_stream(&self) -> bool {
        self.conf.entry.transport == Transport::Tls
    }

    pub fn outstanding(&self) -> usize {
        self.table.lock().unwrap().slots.iter().flatten().count()
    }

    /// Is a request from this (client, id) pair already in flight?
    pub fn request_in_table(&self, from: usize, id: u8) -> bool {
        self.table
            .lock()
            .unwrap()
            .slots
            .iter()
            .flatten()
            .any(|rq| rq.from == Some(from) && rq.orig_id == id)
    }

    /// Queue a request: allocate a slot, patch the identifier into the
    /// buffer, refresh any Message-Authenticator under this upstream's
    /// secret and wake the writer. A full table drops the request.
    pub fn send_request(&self, mut rq: PendingRequest) {
        let mut table = self.table.lock().unwrap();
        let start = table.next_id;
        let slot = (start..MAX_REQUESTS)
            .chain(0..start)
            .find(|&i| table.slots[i].is_none());
        let Some(i) = slot else {
            warn!(host = %self.conf.entry.host, "no room in queue, dropping request");
            return;
        };

        rq.buf[1] = i as u8;

        let len = packet::radius_len(&rq.buf);
        // ingest rejected any Message-Authenticator that is not 16 bytes
        if let Some(off) = attrs::find(&rq.buf[20..len], attrs::MESSAGE_AUTHENTICATOR) {
            message_auth::stamp(&mut rq.buf, self.secret(), 20 + off + 2);
        }

        debug!(id = i, host = %self.conf.entry.host, "inserting request in queue");
        table.slots[i] = Some(rq);
        table.next_id = (i + 1) % MAX_REQUESTS;

        if !table.new_request {
            table.new_request = true;
            self.new_request.notify_one();
        }
    }

    /// Walk the table once: drop received and exhausted slots, collect
    /// buffers due for (re)transmission and the nearest remaining expiry.
    fn sweep(&self, table: &mut RequestTable, now: Instant) -> SweepPlan {
        let mut plan = SweepPlan {
            send: Vec::new(),
            next_expiry: None,
        };
        let mut track = |p: &mut SweepPlan, exp: Instant| {
            p.next_expiry = Some(match p.next_expiry {
                Some(cur) if cur < exp => cur,
                _ => exp,
            });
        };

        for i in 0..MAX_REQUESTS {
            let Some(rq) = table.slots[i].as_mut() else {
                continue;
            };

            if rq.received {
                debug!(id = i, "freeing received request from queue");
                table.slots[i] = None;
                continue;
            }

            if let Some(exp) = rq.expiry
                && now < exp
            {
                track(&mut plan, exp);
                continue;
            }

            let single_try = rq.is_status_server() || self.is_stream();
            let limit = if single_try { 1 } else { REQUEST_RETRIES };
            if rq.tries >= limit {
                if rq.is_status_server() {
                    warn!(host = %self.conf.entry.host, "no status server response, server dead?");
                } else {
                    debug!(id = i, "removing expired request from queue");
                }
                table.slots[i] = None;
                continue;
            }

            let step = if single_try {
                REQUEST_EXPIRY
            } else {
                REQUEST_EXPIRY / REQUEST_RETRIES as u32
            };
            let exp = now + step;
            rq.expiry = Some(exp);
            track(&mut plan, exp);
            rq.tries += 1;
            plan.send.push(rq.buf.clone());
        }
        plan
    }

    /// Correlate a received packet with its table slot and, for forwarded
    /// requests, rewrite it for the origin client and queue the reply.
    pub fn handle_reply(&self, mut buf: Vec<u8>, clients: &[Arc<Client>]) {
        let id = buf[1] as usize;
        match Code::from_u8(buf[0]) {
            Some(Code::AccessAccept) => debug!(id, "got Access-Accept"),
            Some(Code::AccessReject) => debug!(id, "got Access-Reject"),
            Some(Code::AccessChallenge) => debug!(id, "got Access-Challenge"),
            _ => {
                info!("discarding, accepting only accept, reject and challenge messages");
                return;
            }
        }

        let mut table = self.table.lock().unwrap();
        let Some(rq) = table.slots[id].as_mut() else {
            info!(id, "no matching request sent with this id, ignoring");
            return;
        };
        if rq.tries == 0 {
            info!(id, "no matching request sent with this id, ignoring");
            return;
        }
        if rq.received {
            info!(id, "already received, ignoring");
            return;
        }

        let sent_auth: [u8; 16] = rq.buf[4..20].try_into().unwrap();
        if !auth::verify_reply(&buf, &sent_auth, self.secret()) {
            warn!(id, "invalid auth, ignoring");
            return;
        }

        let len = packet::radius_len(&buf);
        match attrs::validate(&buf[20..len]) {
            Err(e) => {
                warn!(error = %e, "attribute validation failed, ignoring packet");
                return;
            }
            Ok(true) => warn!("malformed packet? remaining byte after last attribute"),
            Ok(false) => {}
        }

        let msgauth = attrs::find(&buf[20..len], attrs::MESSAGE_AUTHENTICATOR);
        if let Some(off) = msgauth {
            if attrs::value(&buf[20..len], off).len() != 16 {
                warn!("illegal message auth attribute length, ignoring packet");
                return;
            }
            // the HMAC covers the reply with the request authenticator in
            // the header; splice it in, verify, restore
            let received_auth: [u8; 16] = buf[4..20].try_into().unwrap();
            buf[4..20].copy_from_slice(&sent_auth);
            let ok = message_auth::verify(&buf, self.secret(), 20 + off + 2);
            buf[4..20].copy_from_slice(&received_auth);
            if !ok {
                warn!("message authentication failed");
                return;
            }
            debug!("message auth ok");
        }

        if rq.is_status_server() {
            rq.received = true;
            info!(host = %self.conf.entry.host, "got status server response");
            return;
        }

        // only probes have no origin, and they returned above
        let Some(from) = rq.from else { return };
        let client = &clients[from];
        let orig_auth = rq.orig_auth;

        if !recrypt_mppe_keys(&mut buf[20..len], self.secret(), client.secret(), &sent_auth, &orig_auth) {
            warn!("MS attribute handling failed, ignoring packet");
            return;
        }

        if matches!(
            Code::from_u8(buf[0]),
            Some(Code::AccessAccept | Code::AccessReject)
        ) {
            let request_attrs = &rq.buf[20..packet::radius_len(&rq.buf)];
            if let Some(off) = attrs::find(request_attrs, attrs::USER_NAME) {
                let username = String::from_utf8_lossy(attrs::value(request_attrs, off));
                info!(%username, host = %self.conf.entry.host, code = buf[0], "reply for user");
            }
        }

        buf[1] = rq.orig_id;
        buf[4..20].copy_from_slice(&orig_auth);
        if let Some(off) = msgauth {
            message_auth::stamp(&mut buf, client.secret(), 20 + off + 2);
        }

        let to = rq.from_addr;
        // once received is set the slot may be reclaimed by the writer
        rq.received = true;
        drop(table);

        debug!("giving packet back to where it came from");
        send_reply(&clients[from], buf, to);
    }

    /// Create and connect the datagram socket. Startup, fatal on failure.
    pub async fn prepare(&self) -> ConfigResult<()> {
        if self.is_stream() {
            return Ok(());
        }
        for addr in &self.conf.addrs {
            let bind: SocketAddr = if addr.is_ipv4() {
                "0.0.0.0:0".parse().unwrap()
            } else {
                "[::]:0".parse().unwrap()
            };
            let Ok(socket) = UdpSocket::bind(bind).await else {
                continue;
            };
            if socket.connect(addr).await.is_ok() {
                self.io.lock().await.link = Some(Link::Udp(Arc::new(socket)));
                return Ok(());
            }
        }
        Err(ConfigError::Invalid(format!(
            "cannot create socket for server {}",
            self.conf.entry.host
        )))
    }

    async fn udp_socket(&self) -> Option<Arc<UdpSocket>> {
        match &self.io.lock().await.link {
            Some(Link::Udp(socket)) => Some(socket.clone()),
            _ => None,
        }
    }

    /// Transmit one buffer. Datagram sends are best effort; stream sends
    /// loop through the reconnect protocol until the write succeeds.
    async fn transmit(&self, buf: &[u8]) {
        if !self.is_stream() {
            let Some(socket) = self.udp_socket().await else {
                return;
            };
            match socket.send(&buf[..packet::radius_len(buf)]).await {
                Ok(_) => debug!(
                    len = packet::radius_len(buf),
                    host = %self.conf.entry.host,
                    "sent UDP to server"
                ),
                Err(e) => warn!(error = %e, "send failed"),
            }
            return;
        }

        let mut observed = self.meta.lock().unwrap().last_attempt;
        loop {
            {
                let mut io = self.io.lock().await;
                if let Some(Link::Tls(writer)) = io.link.as_mut() {
                    match transport::write_frame(writer, buf).await {
                        Ok(()) => {
                            self.meta.lock().unwrap().connection_ok = true;
                            debug!(
                                len = packet::radius_len(buf),
                                host = %self.conf.entry.host,
                                "sent radius packet to TLS peer"
                            );
                            return;
                        }
                        Err(e) => {
                            warn!(error = %e, "TLS write failed");
                            io.link = None;
                        }
                    }
                }
            }
            self.reconnect(observed).await;
            observed = self.meta.lock().unwrap().last_attempt;
        }
    }

    /// (Re)establish the outbound TLS session, honoring the backoff
    /// schedule. `observed` is the `last_attempt` value the caller saw
    /// before its failure: if it changed, another task already
    /// reconnected and there is nothing to do.
    async fn reconnect(&self, observed: Option<Instant>) {
        let mut io = self.io.lock().await;
        if observed.is_some() && self.meta.lock().unwrap().last_attempt != observed {
            debug!(host = %self.conf.entry.host, "seems already reconnected");
            return;
        }

        loop {
            let backoff = {
                let mut meta = self.meta.lock().unwrap();
                let backoff = transport::reconnect_backoff(
                    meta.connection_ok,
                    meta.last_attempt.map(|t| t.elapsed()),
                );
                meta.connection_ok = false;
                if backoff == Backoff::Immediate {
                    meta.last_attempt = Some(Instant::now());
                }
                backoff
            };
            if let Backoff::Sleep(wait) = backoff {
                info!(secs = wait.as_secs(), "sleeping before connect attempt");
                tokio::time::sleep(wait).await;
            }

            warn!(
                host = %self.conf.entry.host,
                "trying to open TLS connection to server"
            );
            io.link = None;
            io.reader = None;

            match self.try_connect().await {
                Ok(stream) => {
                    let (reader, writer) = tokio::io::split(stream);
                    io.link = Some(Link::Tls(writer));
                    io.reader = Some(reader);
                    self.meta.lock().unwrap().last_attempt = Some(Instant::now());
                    self.reader_ready.notify_one();
                    warn!(host = %self.conf.entry.host, "TLS connection up");
                    return;
                }
                Err(e) => {
                    warn!(host = %self.conf.entry.host, error = %e, "connect failed");
                }
            }
        }
    }

    /// Connect to the first reachable resolved address, complete the
    /// handshake and check the peer identity.
    async fn try_connect(&self) -> Result<TlsStream<TcpStream>, String> {
        let tls = self.tls.as_ref().ok_or("no tls context")?;
        let host = &self.conf.entry.host;

        let mut tcp = None;
        for addr in &self.conf.addrs {
            match TcpStream::connect(addr).await {
                Ok(stream) => {
                    tcp = Some(stream);
                    break;
                }
                Err(e) => debug!(%addr, error = %e, "connect failed"),
            }
        }
        let tcp = tcp.ok_or("no address reachable")?;

        let server_name =
            ServerName::try_from(host.clone()).map_err(|e| format!("bad server name: {e}"))?;
        let connector = TlsConnector::from(tls.client.clone());
        let stream = connector
            .connect(server_name, tcp)
            .await
            .map_err(|e| format!("handshake failed: {e}"))?;

        let (_, conn) = stream.get_ref();
        let certs = conn.peer_certificates().unwrap_or(&[]);
        if !tls::peer_matches_host(certs, host) {
            return Err("peer certificate does not match host".to_string());
        }
        Ok(stream)
    }

    async fn take_reader(&self) -> ReadHalf<TlsStream<TcpStream>> {
        loop {
            let notified = self.reader_ready.notified();
            if let Some(reader) = self.io.lock().await.reader.take() {
                return reader;
            }
            notified.await;
        }
    }
}

/// Re-encrypt MS-MPPE-Send-Key/Recv-Key sub-attributes of every Microsoft
/// Vendor-Specific attribute from the upstream secret to the origin
/// client's. Returns false if any vendor attribute is malformed or a key
/// fails to re-encrypt; the packet must then be dropped.
fn recrypt_mppe_keys(
    attrs_buf: &mut [u8],
    old_secret: &[u8],
    new_secret: &[u8],
    old_auth: &[u8; 16],
    new_auth: &[u8; 16],
) -> bool {
    let vendor_attrs: Vec<(usize, usize)> = attrs::iter(attrs_buf)
        .filter(|&(_, t, _)| t == attrs::VENDOR_SPECIFIC)
        .map(|(off, _, len)| (off, len))
        .collect();

    for (off, len) in vendor_attrs {
        if len <= 2 + 4 {
            return false;
        }
        let value_start = off + 2;
        if attrs::vendor_id(&attrs_buf[value_start..off + len]) != Some(attrs::VENDOR_MS) {
            continue;
        }
        let sub_start = value_start + 4;
        let sub_region = sub_start..off + len;
        if attrs::validate(&attrs_buf[sub_region.clone()]).is_err() {
            return false;
        }
        let keys: Vec<(usize, usize)> = attrs::iter(&attrs_buf[sub_region.clone()])
            .filter(|&(_, t, _)| t == attrs::MS_MPPE_SEND_KEY || t == attrs::MS_MPPE_RECV_KEY)
            .map(|(o, _, l)| (o, l))
            .collect();
        for (key_off, key_len) in keys {
            debug!("got MS MPPE key");
            let range = sub_start + key_off + 2..sub_start + key_off + key_len;
            if mppe::recrypt(
                &mut attrs_buf[range],
                old_secret,
                new_secret,
                old_auth,
                new_auth,
            )
            .is_err()
            {
                warn!("failed to recrypt msppe key");
                return false;
            }
        }
    }
    true
}

/// Writer task: one per upstream. Waits for new requests or the nearest
/// deadline, sweeps the table, transmits what is due and injects
/// Status-Server probes.
pub async fn writer_task(upstream: Arc<Upstream>, ctx: Arc<ProxyCtx>) {
    if upstream.is_stream() {
        upstream.reconnect(None).await;
    }

    tokio::spawn(reader_task(upstream.clone(), ctx));

    let status_server = upstream.conf.entry.status_server;
    let mut last_send = Instant::now();
    let mut next_expiry: Option<Instant> = None;

    loop {
        {
            let notified = upstream.new_request.notified();
            let pending = upstream.table.lock().unwrap().new_request;
            if !pending {
                let mut deadline = next_expiry;
                if status_server {
                    // random 0-7 seconds
                    let jitter = Duration::from_secs((rand::rng().random::<u8>() / 32) as u64);
                    let probe_at = last_send + STATUS_SERVER_PERIOD + jitter;
                    deadline = Some(deadline.map_or(probe_at, |d| d.min(probe_at)));
                }
                match deadline {
                    Some(deadline) => {
                        debug!("waiting for new request or deadline");
                        let _ = tokio::time::timeout_at(
                            tokio::time::Instant::from_std(deadline),
                            notified,
                        )
                        .await;
                    }
                    None => {
                        debug!("waiting for new request");
                        notified.await;
                    }
                }
            }
            let mut table = upstream.table.lock().unwrap();
            if table.new_request {
                debug!("got new request");
                table.new_request = false;
            }
        }

        let plan = {
            let mut table = upstream.table.lock().unwrap();
            upstream.sweep(&mut table, Instant::now())
        };
        next_expiry = plan.next_expiry;
        for buf in plan.send {
            upstream.transmit(&buf).await;
            last_send = Instant::now();
        }

        if status_server && last_send.elapsed() >= STATUS_SERVER_PERIOD {
            debug!(host = %upstream.conf.entry.host, "sending status server probe");
            last_send = Instant::now();
            upstream.send_request(PendingRequest::probe(build_probe()));
        }
    }
}

/// Status-Server probe: code 12, random authenticator, one
/// Message-Authenticator attribute (stamped when the slot is allocated).
fn build_probe() -> Vec<u8> {
    let mut buf = vec![0u8; 38];
    buf[0] = Code::StatusServer.as_u8();
    packet::set_radius_len(&mut buf, 38);
    buf[4..20].copy_from_slice(&auth::request_authenticator());
    buf[20] = attrs::MESSAGE_AUTHENTICATOR;
    buf[21] = 18;
    buf
}

/// Reader task: one per upstream, spawned by its writer.
async fn reader_task(upstream: Arc<Upstream>, ctx: Arc<ProxyCtx>) {
    if !upstream.is_stream() {
        let Some(socket) = upstream.udp_socket().await else {
            return;
        };
        let mut buf = vec![0u8; UDP_RECV_SIZE];
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
            if !upstream.conf.matches(src.ip()) {
                warn!(%src, "got packet from wrong or unknown UDP peer, ignoring");
                continue;
            }
            upstream.meta.lock().unwrap().connection_ok = true;
            upstream.handle_reply(buf[..len].to_vec(), &ctx.clients);
        }
    } else {
        let mut reader = upstream.take_reader().await;
        loop {
            let observed = upstream.meta.lock().unwrap().last_attempt;
            match transport::read_frame(&mut reader).await {
                Ok(Some(msg)) => {
                    upstream.meta.lock().unwrap().connection_ok = true;
                    upstream.handle_reply(msg, &ctx.clients);
                }
                Ok(None) | Err(_) => {
                    debug!(host = %upstream.conf.entry.host, "connection lost");
                    drop(reader);
                    upstream.reconnect(observed).await;
                    reader = upstream.take_reader().await;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PeerEntry;
    use crate::replyq::ReplyQueue;

    fn peer(transport: Transport, status_server: bool) -> ResolvedPeer {
        ResolvedPeer {
            entry: PeerEntry {
                host: "radius.example.org".to_string(),
                transport,
                secret: "up-secret".to_string(),
                port: None,
                tls: None,
                status_server,
            },
            addrs: vec!["192.0.2.10:1812".parse().unwrap()],
        }
    }

    fn test_upstream() -> Arc<Upstream> {
        Upstream::new(peer(Transport::Udp, false), None)
    }

    fn test_client() -> Arc<Client> {
        let conf = ResolvedPeer {
            entry: PeerEntry {
                host: "nas.example.com".to_string(),
                transport: Transport::Udp,
                secret: "testing123".to_string(),
                port: None,
                tls: None,
                status_server: false,
            },
            addrs: vec!["192.0.2.1:1812".parse().unwrap()],
        };
        Client::new(conf, None, Arc::new(ReplyQueue::new(8)))
    }

    fn access_request(id: u8) -> Vec<u8> {
        let mut buf = vec![Code::AccessRequest.as_u8(), id, 0, 0];
        buf.extend_from_slice(&[7u8; 16]);
        buf.extend_from_slice(&[attrs::USER_NAME, 7]);
        buf.extend_from_slice(b"alice");
        let len = buf.len();
        packet::set_radius_len(&mut buf, len);
        buf
    }

    fn queue(upstream: &Upstream, from: usize, orig_id: u8) {
        let mut buf = access_request(orig_id);
        // what ingest does: record the client's authenticator, stamp a
        // fresh one into the outgoing buffer
        let orig_auth = [7u8; 16];
        buf[4..20].copy_from_slice(&[9u8; 16]);
        upstream.send_request(PendingRequest::forwarded(buf, from, None, orig_id, orig_auth));
    }

    #[test]
    fn test_slot_index_matches_buffer_id() {
        let upstream = test_upstream();
        for orig_id in 0..5 {
            queue(&upstream, 0, orig_id);
        }
        let table = upstream.table.lock().unwrap();
        for (i, slot) in table.slots.iter().enumerate() {
            if let Some(rq) = slot {
                assert_eq!(rq.buf[1], i as u8);
            }
        }
        assert_eq!(table.next_id, 5);
    }

    #[test]
    fn test_duplicate_detection() {
        let upstream = test_upstream();
        queue(&upstream, 0, 42);
        assert!(upstream.request_in_table(0, 42));
        assert!(!upstream.request_in_table(0, 43));
        assert!(!upstream.request_in_table(1, 42));
    }

    #[test]
    fn test_full_table_drops() {
        let upstream = test_upstream();
        for i in 0..MAX_REQUESTS {
            queue(&upstream, 0, i as u8);
        }
        assert_eq!(upstream.outstanding(), MAX_REQUESTS);
        queue(&upstream, 1, 0);
        assert_eq!(upstream.outstanding(), MAX_REQUESTS);
        assert!(!upstream.request_in_table(1, 0));
    }

    #[test]
    fn test_retry_budget_datagram() {
        let upstream = test_upstream();
        queue(&upstream, 0, 1);

        let t0 = Instant::now();
        let step = REQUEST_EXPIRY / REQUEST_RETRIES as u32;
        let mut sends = 0;
        let mut table = upstream.table.lock().unwrap();
        // sweep well past the full expiry window
        for tick in 0..8u32 {
            let plan = upstream.sweep(&mut table, t0 + step * tick);
            sends += plan.send.len();
        }
        assert_eq!(sends, REQUEST_RETRIES as usize);
        assert!(table.slots[0].is_none(), "slot released after retries");
    }

    #[test]
    fn test_stream_requests_sent_once() {
        let upstream = Upstream::new(peer(Transport::Tls, false), None);
        queue(&upstream, 0, 1);

        let t0 = Instant::now();
        let mut table = upstream.table.lock().unwrap();
        assert_eq!(upstream.sweep(&mut table, t0).send.len(), 1);
        let plan = upstream.sweep(&mut table, t0 + REQUEST_EXPIRY + Duration::from_secs(1));
        assert!(plan.send.is_empty());
        assert!(table.slots[0].is_none());
    }

    #[test]
    fn test_sweep_frees_received() {
        let upstream = test_upstream();
        queue(&upstream, 0, 1);
        let mut table = upstream.table.lock().unwrap();
        table.slots[0].as_mut().unwrap().received = true;
        let plan = upstream.sweep(&mut table, Instant::now());
        assert!(plan.send.is_empty());
        assert!(table.slots[0].is_none());
    }

    fn sent_request(upstream: &Upstream, id: usize) -> (Vec<u8>, [u8; 16]) {
        // mark as sent once so replies are acceptable
        let mut table = upstream.table.lock().unwrap();
        let rq = table.slots[id].as_mut().unwrap();
        rq.tries = 1;
        let sent_auth: [u8; 16] = rq.buf[4..20].try_into().unwrap();
        (rq.buf.clone(), sent_auth)
    }

    fn accept_reply(id: u8, sent_auth: &[u8; 16], secret: &[u8]) -> Vec<u8> {
        let mut reply = vec![Code::AccessAccept.as_u8(), id, 0, 20];
        reply.extend_from_slice(sent_auth);
        auth::sign_reply(&mut reply, secret);
        reply
    }

    #[test]
    fn test_reply_round_trip() {
        let upstream = test_upstream();
        let clients = vec![test_client()];
        let orig_auth = [7u8; 16];
        queue(&upstream, 0, 42);
        let (_, sent_auth) = sent_request(&upstream, 0);

        upstream.handle_reply(accept_reply(0, &sent_auth, b"up-secret"), &clients);

        let reply = clients[0].replyq.try_pop().expect("reply queued");
        assert_eq!(reply.buf[0], Code::AccessAccept.as_u8());
        assert_eq!(reply.buf[1], 42, "client id restored");
        assert!(auth::verify_reply(&reply.buf, &orig_auth, b"testing123"));
        assert!(upstream.table.lock().unwrap().slots[0].as_ref().unwrap().received);
    }

    #[test]
    fn test_reply_bad_authenticator_ignored() {
        let upstream = test_upstream();
        let clients = vec![test_client()];
        queue(&upstream, 0, 42);
        sent_request(&upstream, 0);

        let mut reply = vec![Code::AccessAccept.as_u8(), 0, 0, 20];
        reply.extend_from_slice(&[0xEE; 16]);
        upstream.handle_reply(reply, &clients);

        assert!(clients[0].replyq.is_empty());
        let table = upstream.table.lock().unwrap();
        let rq = table.slots[0].as_ref().unwrap();
        assert!(!rq.received, "slot still outstanding");
    }

    #[test]
    fn test_reply_unknown_id_ignored() {
        let upstream = test_upstream();
        let clients = vec![test_client()];
        let reply = accept_reply(9, &[0u8; 16], b"up-secret");
        upstream.handle_reply(reply, &clients);
        assert!(clients[0].replyq.is_empty());
    }

    #[test]
    fn test_duplicate_reply_ignored() {
        let upstream = test_upstream();
        let clients = vec![test_client()];
        queue(&upstream, 0, 42);
        let (_, sent_auth) = sent_request(&upstream, 0);

        upstream.handle_reply(accept_reply(0, &sent_auth, b"up-secret"), &clients);
        upstream.handle_reply(accept_reply(0, &sent_auth, b"up-secret"), &clients);

        assert!(clients[0].replyq.try_pop().is_some());
        assert!(clients[0].replyq.try_pop().is_none(), "one reply only");
    }

    #[test]
    fn test_status_server_reply_marks_received() {
        let upstream = Upstream::new(peer(Transport::Udp, true), None);
        let clients = vec![test_client()];
        upstream.send_request(PendingRequest::probe(build_probe()));
        let (probe, sent_auth) = sent_request(&upstream, 0);
        assert_eq!(probe[0], Code::StatusServer.as_u8());

        upstream.handle_reply(accept_reply(0, &sent_auth, b"up-secret"), &clients);

        assert!(clients[0].replyq.is_empty(), "probes produce no client reply");
        assert!(upstream.table.lock().unwrap().slots[0].as_ref().unwrap().received);
    }

    #[test]
    fn test_probe_layout() {
        let probe = build_probe();
        assert_eq!(probe.len(), 38);
        assert_eq!(probe[0], 12);
        assert_eq!(packet::radius_len(&probe), 38);
        assert_eq!(probe[20], attrs::MESSAGE_AUTHENTICATOR);
        assert_eq!(probe[21], 18);
        assert_ne!(probe[4..20], [0u8; 16]);
    }

    #[test]
    fn test_probe_gets_message_auth_on_queue() {
        let upstream = test_upstream();
        upstream.send_request(PendingRequest::probe(build_probe()));
        let table = upstream.table.lock().unwrap();
        let rq = table.slots[0].as_ref().unwrap();
        assert!(message_auth::verify(&rq.buf, b"up-secret", 22));
    }

    #[test]
    fn test_mppe_keys_rewritten_in_reply() {
        let upstream = test_upstream();
        let clients = vec![test_client()];
        let orig_auth = [7u8; 16];
        queue(&upstream, 0, 42);
        let (sent, sent_auth) = sent_request(&upstream, 0);
        assert_eq!(sent[4..20], sent_auth);

        // reply carrying an MS-MPPE-Send-Key in a Microsoft vendor attribute
        let plain_key = [0x5Au8; 16];
        let salt = [0x80, 0x11];
        let mut wrapped = plain_key.to_vec();
        mppe::encrypt_in_place(&mut wrapped, b"up-secret", &sent_auth, &salt);

        let mut reply = vec![Code::AccessAccept.as_u8(), 0, 0, 0];
        reply.extend_from_slice(&sent_auth);
        let sub_len = 2 + 2 + wrapped.len();
        reply.extend_from_slice(&[attrs::VENDOR_SPECIFIC, (2 + 4 + sub_len) as u8]);
        reply.extend_from_slice(&attrs::VENDOR_MS.to_be_bytes());
        reply.extend_from_slice(&[attrs::MS_MPPE_SEND_KEY, sub_len as u8]);
        reply.extend_from_slice(&salt);
        reply.extend_from_slice(&wrapped);
        let len = reply.len();
        packet::set_radius_len(&mut reply, len);
        auth::sign_reply(&mut reply, b"up-secret");

        upstream.handle_reply(reply, &clients);

        let out = clients[0].replyq.try_pop().expect("reply queued").buf;
        // the key must now unwrap under the client secret and original auth
        let key_at = out.len() - 16;
        let salt_at = key_at - 2;
        assert_eq!(out[salt_at..key_at], salt, "salt preserved");
        let mut unwrapped = out[key_at..].to_vec();
        mppe::decrypt_in_place(&mut unwrapped, b"testing123", &orig_auth, &salt);
        assert_eq!(unwrapped, plain_key);
    }
}
