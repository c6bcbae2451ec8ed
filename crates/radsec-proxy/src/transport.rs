//! Transport plumbing shared by clients and upstreams
//!
//! Datagram reception applies the RADIUS length rules to each packet in
//! isolation; stream reception derives framing from the RADIUS length
//! field itself: four header bytes, then the remaining `length - 4`.
//! Reconnecting an outbound stream follows a fixed backoff schedule keyed
//! on how long ago the last attempt was made.

use std::io;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::{debug, warn};

use radsec_proto::packet::{self, MIN_PACKET_SIZE};

/// Largest datagram we accept from the wire.
pub const UDP_RECV_SIZE: usize = 65536;

/// Validate a received datagram and return the RADIUS length to use.
///
/// Undersized packets are dropped; oversized packets (padding after the
/// declared length) are silently truncated.
pub fn check_datagram(cnt: usize, buf: &[u8]) -> Option<usize> {
    if cnt < MIN_PACKET_SIZE {
        warn!(cnt, "packet too small");
        return None;
    }
    let len = packet::radius_len(buf);
    if len < MIN_PACKET_SIZE {
        warn!(len, "length too small");
        return None;
    }
    if cnt < len {
        warn!(cnt, len, "packet smaller than length field in radius header");
        return None;
    }
    if cnt > len {
        debug!(padding = cnt - len, "packet was padded");
    }
    Some(len)
}

/// Read one RADIUS message from a stream.
///
/// Returns `Ok(None)` on a clean end of stream at a message boundary.
/// Messages shorter than the RADIUS minimum are skipped with a warning.
pub async fn read_frame<R: AsyncRead + Unpin>(stream: &mut R) -> io::Result<Option<Vec<u8>>> {
    loop {
        let mut header = [0u8; 4];
        match stream.read(&mut header).await? {
            0 => return Ok(None),
            mut cnt => {
                while cnt < 4 {
                    let more = stream.read(&mut header[cnt..]).await?;
                    if more == 0 {
                        return Err(io::ErrorKind::UnexpectedEof.into());
                    }
                    cnt += more;
                }
            }
        }

        let len = packet::radius_len(&header);
        if len < MIN_PACKET_SIZE {
            warn!(len, "packet smaller than minimum radius size");
            if len > 4 {
                let mut discard = vec![0u8; len - 4];
                stream.read_exact(&mut discard).await?;
            }
            continue;
        }

        let mut buf = vec![0u8; len];
        buf[..4].copy_from_slice(&header);
        stream.read_exact(&mut buf[4..]).await?;
        debug!(len, "got radius message from stream");
        return Ok(Some(buf));
    }
}

/// Write one RADIUS message to a stream.
pub async fn write_frame<W: AsyncWrite + Unpin>(stream: &mut W, buf: &[u8]) -> io::Result<()> {
    stream.write_all(&buf[..packet::radius_len(buf)]).await?;
    stream.flush().await
}

/// Next step of the outbound reconnect schedule.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Backoff {
    /// Sleep this long before the attempt.
    Sleep(Duration),
    /// Cold start: stamp the attempt time and connect immediately.
    Immediate,
}

/// Compute the backoff before the next connect attempt.
///
/// `connection_ok` is whether traffic has flowed since the last (re)connect;
/// `elapsed` is the time since the last attempt, `None` if there never was
/// one. The schedule: a working connection that just broke waits 10 s, as
/// does one that failed again within 5 s; between 5 s and 5 min the wait
/// mirrors the elapsed time; beyond that it is pinned to 10 min, until the
/// gap is so large the attempt counts as a cold start.
pub fn reconnect_backoff(connection_ok: bool, elapsed: Option<Duration>) -> Backoff {
    const LONG_GAP: Duration = Duration::from_secs(100_000);
    if connection_ok {
        return Backoff::Sleep(Duration::from_secs(10));
    }
    match elapsed {
        None => Backoff::Immediate,
        Some(e) if e < Duration::from_secs(5) => Backoff::Sleep(Duration::from_secs(10)),
        Some(e) if e < Duration::from_secs(300) => Backoff::Sleep(e),
        Some(e) if e < LONG_GAP => Backoff::Sleep(Duration::from_secs(600)),
        Some(_) => Backoff::Immediate,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use radsec_proto::packet::set_radius_len;

    fn message(len: usize) -> Vec<u8> {
        let mut buf = vec![0u8; len];
        buf[0] = 1;
        set_radius_len(&mut buf, len);
        buf
    }

    #[test]
    fn test_check_datagram() {
        let buf = message(24);
        assert_eq!(check_datagram(24, &buf), Some(24));
        // padded
        let mut padded = buf.clone();
        padded.extend_from_slice(&[0, 0, 0]);
        assert_eq!(check_datagram(27, &padded), Some(24));
        // truncated on the wire
        assert_eq!(check_datagram(20, &buf), None);
        // length field below minimum
        let mut short = buf;
        set_radius_len(&mut short, 10);
        assert_eq!(check_datagram(24, &short), None);
        assert_eq!(check_datagram(10, &[0u8; 10]), None);
    }

    #[tokio::test]
    async fn test_read_frame_round_trip() {
        let (mut tx, mut rx) = tokio::io::duplex(256);
        let msg = message(31);
        write_frame(&mut tx, &msg).await.unwrap();
        drop(tx);

        assert_eq!(read_frame(&mut rx).await.unwrap(), Some(msg));
        assert_eq!(read_frame(&mut rx).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_read_frame_skips_short_messages() {
        let (mut tx, mut rx) = tokio::io::duplex(256);
        // framed message claiming 8 bytes total, then a valid one
        let mut runt = vec![0u8; 8];
        set_radius_len(&mut runt, 8);
        tx.write_all(&runt).await.unwrap();
        let msg = message(20);
        tx.write_all(&msg).await.unwrap();
        drop(tx);

        assert_eq!(read_frame(&mut rx).await.unwrap(), Some(msg));
    }

    #[tokio::test]
    async fn test_read_frame_truncated_stream() {
        let (mut tx, mut rx) = tokio::io::duplex(256);
        let msg = message(40);
        tx.write_all(&msg[..10]).await.unwrap();
        drop(tx);

        assert!(read_frame(&mut rx).await.is_err());
    }

    #[test]
    fn test_reconnect_backoff_schedule() {
        let secs = |s| Some(Duration::from_secs(s));
        assert_eq!(
            reconnect_backoff(true, secs(1000)),
            Backoff::Sleep(Duration::from_secs(10))
        );
        assert_eq!(
            reconnect_backoff(false, secs(3)),
            Backoff::Sleep(Duration::from_secs(10))
        );
        assert_eq!(
            reconnect_backoff(false, secs(200)),
            Backoff::Sleep(Duration::from_secs(200))
        );
        assert_eq!(
            reconnect_backoff(false, secs(1000)),
            Backoff::Sleep(Duration::from_secs(600))
        );
        assert_eq!(reconnect_backoff(false, secs(200_000)), Backoff::Immediate);
        assert_eq!(reconnect_backoff(false, None), Backoff::Immediate);
    }
}
