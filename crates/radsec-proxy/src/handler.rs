//! Request ingest
//!
//! Every packet a client sends, datagram or stream, lands here with its
//! origin client handle. Only Access-Request and Status-Server pass.
//! Access-Requests are routed by realm: forwarded requests get their
//! password attributes moved to the destination secret under a fresh
//! authenticator and go into the destination's request table; realm rules
//! without a server synthesize an Access-Reject; Status-Server gets an
//! immediate Access-Accept. Anything that fails a check is dropped.

use std::net::SocketAddr;

use tracing::{debug, info, warn};

use radsec_proto::packet::{self, Code};
use radsec_proto::{attrs, auth, message_auth, password};

use crate::ProxyCtx;
use crate::client::send_reply;
use crate::realm::find_realm;
use crate::upstream::PendingRequest;

/// A validated-length inbound packet and where it came from.
pub struct Request {
    pub buf: Vec<u8>,
    /// Origin client index in the startup-frozen table.
    pub from: usize,
    /// Source address, datagram only; replies go back to it.
    pub from_addr: Option<SocketAddr>,
}

pub fn handle_request(ctx: &ProxyCtx, mut rq: Request) {
    let id = rq.buf[1];
    let len = packet::radius_len(&rq.buf);
    let client = &ctx.clients[rq.from];
    debug!(code = rq.buf[0], id, len, "incoming request");

    let code = match Code::from_u8(rq.buf[0]) {
        Some(code @ (Code::AccessRequest | Code::StatusServer)) => code,
        _ => {
            info!("only access-requests and status-server accepted, ignoring");
            return;
        }
    };

    match attrs::validate(&rq.buf[20..len]) {
        Err(e) => {
            warn!(error = %e, "attribute validation failed, ignoring packet");
            return;
        }
        Ok(true) => warn!("malformed packet? remaining byte after last attribute"),
        Ok(false) => {}
    }

    enum Route {
        Forward(usize),
        Reject {
            username: String,
            message: Option<String>,
        },
    }

    // realm routing for Access-Request
    let mut route = None;
    if code == Code::AccessRequest {
        let Some(user_off) = attrs::find(&rq.buf[20..len], attrs::USER_NAME) else {
            warn!("ignoring request, no username attribute");
            return;
        };
        let username =
            String::from_utf8_lossy(attrs::value(&rq.buf[20..len], user_off)).into_owned();
        debug!(%username, "access request");

        let Some(realm) = find_realm(&ctx.realms, &username) else {
            info!(%username, "ignoring request, don't know where to send it");
            return;
        };
        route = Some(match realm.server {
            Some(to) => {
                if ctx.upstreams[to].request_in_table(rq.from, id) {
                    info!(
                        id,
                        host = %client.conf.entry.host,
                        "already got request from this client with this id, ignoring"
                    );
                    return;
                }
                Route::Forward(to)
            }
            None => Route::Reject {
                username,
                message: realm.reply_message.clone(),
            },
        });
    }

    let msgauth = attrs::find(&rq.buf[20..len], attrs::MESSAGE_AUTHENTICATOR);
    if let Some(off) = msgauth
        && (attrs::value(&rq.buf[20..len], off).len() != 16
            || !message_auth::verify(&rq.buf, client.secret(), 20 + off + 2))
    {
        warn!("message authentication failed");
        return;
    }

    if code == Code::StatusServer {
        let mut resp = rq.buf[..20].to_vec();
        resp[0] = Code::AccessAccept.as_u8();
        packet::set_radius_len(&mut resp, 20);
        debug!(host = %client.conf.entry.host, "responding to status-server");
        send_reply(client, resp, rq.from_addr);
        return;
    }

    let to = match route {
        Some(Route::Forward(to)) => to,
        Some(Route::Reject { username, message }) => {
            info!(%username, host = %client.conf.entry.host, "sending reject");
            let mut resp = rq.buf[..20].to_vec();
            resp[0] = Code::AccessReject.as_u8();
            if let Some(message) = message {
                resp.push(attrs::REPLY_MESSAGE);
                resp.push(2 + message.len() as u8);
                resp.extend_from_slice(message.as_bytes());
            }
            let resp_len = resp.len();
            packet::set_radius_len(&mut resp, resp_len);
            send_reply(client, resp, rq.from_addr);
            return;
        }
        // a Status-Server request was answered above, so this is
        // unreachable for valid codes; drop anything else
        None => return,
    };
    let upstream = &ctx.upstreams[to];

    let orig_auth: [u8; 16] = rq.buf[4..20].try_into().unwrap();
    let new_auth = auth::request_authenticator();

    for attr_type in [attrs::USER_PASSWORD, attrs::TUNNEL_PASSWORD] {
        if let Some(off) = attrs::find(&rq.buf[20..len], attr_type) {
            let range = attrs::value_range(&rq.buf[20..len], off);
            debug!(attr = attr_type, len = range.len(), "re-encrypting password attribute");
            let range = 20 + range.start..20 + range.end;
            if let Err(e) = password::recrypt(
                &mut rq.buf[range],
                client.secret(),
                upstream.secret(),
                &orig_auth,
                &new_auth,
            ) {
                warn!(error = %e, "cannot re-encrypt password");
                return;
            }
        }
    }

    rq.buf[4..20].copy_from_slice(&new_auth);
    upstream.send_request(PendingRequest::forwarded(
        rq.buf,
        rq.from,
        rq.from_addr,
        id,
        orig_auth,
    ));
}
