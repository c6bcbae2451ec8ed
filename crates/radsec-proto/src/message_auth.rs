//! Message-Authenticator attribute (RFC 2869 Section 5.14)
//!
//! HMAC-MD5 over the entire packet, keyed by the shared secret, with the
//! attribute's own 16-byte value zeroed during computation. For replies the
//! authenticator field must hold the request authenticator while the HMAC
//! is computed; arranging that is the caller's job.

use hmac::{Hmac, Mac};
use md5_digest::Md5;

use crate::packet::radius_len;

type HmacMd5 = Hmac<Md5>;

/// HMAC-MD5 of a packet whose Message-Authenticator value is already zeroed.
pub fn calculate(packet: &[u8], secret: &[u8]) -> [u8; 16] {
    let mut mac = HmacMd5::new_from_slice(secret).expect("HMAC accepts any key size");
    mac.update(&packet[..radius_len(packet)]);
    let mut output = [0u8; 16];
    output.copy_from_slice(&mac.finalize().into_bytes());
    output
}

/// Verify the Message-Authenticator whose value starts at `value_offset`.
pub fn verify(packet: &[u8], secret: &[u8], value_offset: usize) -> bool {
    if value_offset + 16 > packet.len() {
        return false;
    }
    let mut copy = packet.to_vec();
    copy[value_offset..value_offset + 16].fill(0);
    let expected = calculate(&copy, secret);
    packet[value_offset..value_offset + 16] == expected
}

/// Recompute the Message-Authenticator in place after a rewrite.
pub fn stamp(packet: &mut [u8], secret: &[u8], value_offset: usize) {
    packet[value_offset..value_offset + 16].fill(0);
    let mac = calculate(packet, secret);
    packet[value_offset..value_offset + 16].copy_from_slice(&mac);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packet::set_radius_len;

    fn packet_with_message_auth() -> (Vec<u8>, usize) {
        let mut buf = vec![1u8, 9, 0, 0];
        buf.extend_from_slice(&[3u8; 16]);
        buf.extend_from_slice(&[80, 18]);
        let value_offset = buf.len();
        buf.extend_from_slice(&[0u8; 16]);
        let len = buf.len();
        set_radius_len(&mut buf, len);
        (buf, value_offset)
    }

    #[test]
    fn test_stamp_then_verify() {
        let (mut buf, off) = packet_with_message_auth();
        stamp(&mut buf, b"testing123", off);
        assert!(verify(&buf, b"testing123", off));
        assert!(!verify(&buf, b"other", off));
    }

    #[test]
    fn test_verify_rejects_modified_packet() {
        let (mut buf, off) = packet_with_message_auth();
        stamp(&mut buf, b"testing123", off);
        buf[1] ^= 1;
        assert!(!verify(&buf, b"testing123", off));
    }

    #[test]
    fn test_verify_out_of_bounds() {
        let (buf, _) = packet_with_message_auth();
        assert!(!verify(&buf, b"testing123", buf.len()));
    }

    #[test]
    fn test_calculate_deterministic() {
        let (buf, _) = packet_with_message_auth();
        assert_eq!(calculate(&buf, b"s"), calculate(&buf, b"s"));
        assert_ne!(calculate(&buf, b"s"), calculate(&buf, b"t"));
    }
}
