//! Wire-level RADIUS for the radsec proxy
//!
//! This crate implements the parts of RFC 2865, 2868, 2869 and RFC 2548 a
//! forwarding proxy needs: packet header access, in-place attribute walking,
//! authenticator computation and verification, Message-Authenticator
//! (HMAC-MD5), and re-encryption of User-Password, Tunnel-Password and
//! MS-MPPE key attributes between shared secrets.
//!
//! Everything here operates on raw on-wire buffers. A proxy never needs a
//! fully decoded packet: it validates, locates a handful of attributes,
//! rewrites them in place and forwards the bytes untouched otherwise.
//!
//! # Example
//!
//! ```rust
//! use radsec_proto::{attrs, auth, packet};
//!
//! // Minimal Access-Request with a User-Name attribute.
//! let mut buf = vec![1u8, 7, 0, 27];
//! buf.extend_from_slice(&auth::request_authenticator());
//! buf.extend_from_slice(&[attrs::USER_NAME, 7]);
//! buf.extend_from_slice(b"alice");
//!
//! assert_eq!(packet::radius_len(&buf), 27);
//! let off = attrs::find(&buf[20..], attrs::USER_NAME).unwrap();
//! assert_eq!(attrs::value(&buf[20..], off), b"alice");
//! ```

pub mod attrs;
pub mod auth;
pub mod message_auth;
pub mod mppe;
pub mod packet;
pub mod password;

pub use attrs::AttrError;
pub use packet::{Code, PacketError};
pub use password::KeyWrapError;
