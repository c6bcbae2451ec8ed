//! Request and reply authenticators per RFC 2865 Section 3

use crate::packet::{AUTH_OFFSET, radius_len};
use rand::Rng;

/// Generate a random Request Authenticator (16 bytes).
///
/// Authenticators seed password encryption, so the thread-local CSPRNG is
/// mandatory here, not a convenience.
pub fn request_authenticator() -> [u8; 16] {
    let mut rng = rand::rng();
    let mut authenticator = [0u8; 16];
    rng.fill(&mut authenticator[..]);
    authenticator
}

/// Sign a reply in place.
///
/// Response Authenticator = MD5(Code + ID + Length + Request Authenticator
/// + Attributes + Secret). The caller has already placed the request
/// authenticator in the authenticator field (replies built by copying the
/// request header get it for free), so the digest simply runs over the
/// whole packet followed by the secret, and the result replaces the field.
pub fn sign_reply(buf: &mut [u8], secret: &[u8]) {
    let len = radius_len(buf);
    let mut data = Vec::with_capacity(len + secret.len());
    data.extend_from_slice(&buf[..len]);
    data.extend_from_slice(secret);
    let digest = md5::compute(&data);
    buf[AUTH_OFFSET..AUTH_OFFSET + 16].copy_from_slice(&digest.0);
}

/// Verify a reply against the stored request authenticator.
pub fn verify_reply(reply: &[u8], request_auth: &[u8; 16], secret: &[u8]) -> bool {
    let len = radius_len(reply);
    if reply.len() < len || len < 20 {
        return false;
    }
    let mut data = Vec::with_capacity(len + secret.len());
    data.extend_from_slice(&reply[..4]);
    data.extend_from_slice(request_auth);
    data.extend_from_slice(&reply[20..len]);
    data.extend_from_slice(secret);
    let digest = md5::compute(&data);
    digest.0 == reply[AUTH_OFFSET..AUTH_OFFSET + 16]
}
