//! RADIUS packet header as defined in RFC 2865 Section 3
//!
//! ```text
//!  0                   1                   2                   3
//!  0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |     Code      |  Identifier   |            Length             |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |                                                               |
//! |                         Authenticator                         |
//! |                                                               |
//! |                                                               |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |  Attributes ...
//! +-+-+-+-+-+-+-+-+-+-+-+-+-
//! ```

use thiserror::Error;

/// Minimum RADIUS packet size (1 code + 1 id + 2 length + 16 authenticator)
pub const MIN_PACKET_SIZE: usize = 20;
/// Maximum RADIUS packet size per RFC 2865
pub const MAX_PACKET_SIZE: usize = 4096;
/// Offset of the 16-byte authenticator field
pub const AUTH_OFFSET: usize = 4;
/// Offset of the first attribute
pub const ATTR_OFFSET: usize = 20;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PacketError {
    #[error("invalid packet length: {0}")]
    InvalidLength(usize),
    #[error("packet truncated: have {have} bytes, header says {want}")]
    Truncated { have: usize, want: usize },
}

/// Packet codes handled by the proxy
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Code {
    AccessRequest = 1,
    AccessAccept = 2,
    AccessReject = 3,
    AccessChallenge = 11,
    StatusServer = 12,
}

impl Code {
    pub fn from_u8(code: u8) -> Option<Code> {
        match code {
            1 => Some(Code::AccessRequest),
            2 => Some(Code::AccessAccept),
            3 => Some(Code::AccessReject),
            11 => Some(Code::AccessChallenge),
            12 => Some(Code::StatusServer),
            _ => None,
        }
    }

    pub fn as_u8(self) -> u8 {
        self as u8
    }
}

/// Length field of a RADIUS packet. The buffer must hold at least 4 bytes.
pub fn radius_len(buf: &[u8]) -> usize {
    u16::from_be_bytes([buf[2], buf[3]]) as usize
}

/// Check the header of a received buffer and return the packet length.
///
/// Fails if the buffer or the declared length is below the RADIUS minimum,
/// the declared length exceeds the RFC maximum, or the buffer holds fewer
/// bytes than the header declares. Trailing padding beyond the declared
/// length is the caller's business (datagrams may be padded).
pub fn check_header(buf: &[u8]) -> Result<usize, PacketError> {
    if buf.len() < MIN_PACKET_SIZE {
        return Err(PacketError::InvalidLength(buf.len()));
    }
    let len = radius_len(buf);
    if !(MIN_PACKET_SIZE..=MAX_PACKET_SIZE).contains(&len) {
        return Err(PacketError::InvalidLength(len));
    }
    if buf.len() < len {
        return Err(PacketError::Truncated {
            have: buf.len(),
            want: len,
        });
    }
    Ok(len)
}

/// Write the length field.
pub fn set_radius_len(buf: &mut [u8], len: usize) {
    let len = len as u16;
    buf[2..4].copy_from_slice(&len.to_be_bytes());
}
