//! Guest channel framing.
//!
//! Stream channels prefix every ethernet frame with its length; datagram
//! channels carry one frame per message.

use std::fmt;
use std::io;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::net::connection::{read_exact, write_all};
use crate::net::Connection;

/// Ethernet header preceding the MTU-sized payload.
pub const ETHERNET_HEADER_LEN: usize = 14;

/// Framing spoken by the hypervisor on the guest channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    /// 16-bit little-endian length prefix over a stream.
    #[default]
    HyperKit,
    /// 32-bit big-endian length prefix over a stream.
    Qemu,
    /// One frame per datagram (SOCK_SEQPACKET style).
    Bess,
    /// One frame per datagram over a unix datagram socket.
    Vfkit,
}

impl Protocol {
    /// Whether frames carry a length prefix.
    pub fn is_stream(self) -> bool {
        matches!(self, Protocol::HyperKit | Protocol::Qemu)
    }

    /// Largest frame the length prefix can describe, if it is bounded.
    pub fn max_frame_len(self) -> Option<usize> {
        match self {
            Protocol::HyperKit => Some(usize::from(u16::MAX)),
            Protocol::Qemu => usize::try_from(u32::MAX).ok(),
            Protocol::Bess | Protocol::Vfkit => None,
        }
    }

    fn header_len(self) -> usize {
        match self {
            Protocol::HyperKit => 2,
            Protocol::Qemu => 4,
            Protocol::Bess | Protocol::Vfkit => 0,
        }
    }

    /// Read one frame into `buf`.
    ///
    /// Returns `None` when the channel closes between frames. A unix datagram
    /// socket never closes: empty datagrams are skipped, and datagrams longer
    /// than `max_frame` are dropped. Length prefixes above `max_frame` are
    /// rejected with `InvalidData`.
    pub async fn read_frame(
        self,
        conn: &dyn Connection,
        buf: &mut Vec<u8>,
        max_frame: usize,
    ) -> io::Result<Option<usize>> {
        if !self.is_stream() {
            return self.read_datagram(conn, buf, max_frame).await;
        }

        let mut header = [0u8; 4];
        let header = &mut header[..self.header_len()];
        if !read_header(conn, header).await? {
            return Ok(None);
        }

        let len = match self {
            Protocol::HyperKit => usize::from(u16::from_le_bytes([header[0], header[1]])),
            _ => u32::from_be_bytes([header[0], header[1], header[2], header[3]]) as usize,
        };
        if len > max_frame {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("frame of {len} bytes exceeds limit of {max_frame}"),
            ));
        }

        buf.resize(len, 0);
        read_exact(conn, buf).await?;
        Ok(Some(len))
    }

    async fn read_datagram(
        self,
        conn: &dyn Connection,
        buf: &mut Vec<u8>,
        max_frame: usize,
    ) -> io::Result<Option<usize>> {
        loop {
            // One spare byte tells a full-sized frame from a truncated one.
            buf.resize(max_frame + 1, 0);
            let n = conn.read(buf).await?;
            buf.truncate(n);
            match n {
                // End of a SOCK_SEQPACKET channel.
                0 if self == Protocol::Bess => return Ok(None),
                0 => tracing::debug!("Empty datagram ignored"),
                n if n > max_frame => {
                    tracing::warn!(max_frame, "Datagram exceeds the frame limit; dropped");
                }
                n => return Ok(Some(n)),
            }
        }
    }

    /// Write one frame, with its length prefix on stream channels.
    pub async fn write_frame(self, conn: &dyn Connection, frame: &[u8]) -> io::Result<()> {
        match self {
            Protocol::HyperKit => {
                let len = u16::try_from(frame.len()).map_err(|_| oversized(frame.len()))?;
                write_all(conn, &len.to_le_bytes()).await?;
                write_all(conn, frame).await
            }
            Protocol::Qemu => {
                let len = u32::try_from(frame.len()).map_err(|_| oversized(frame.len()))?;
                write_all(conn, &len.to_be_bytes()).await?;
                write_all(conn, frame).await
            }
            Protocol::Bess | Protocol::Vfkit => {
                let n = conn.write(frame).await?;
                if n != frame.len() {
                    return Err(io::Error::new(
                        io::ErrorKind::WriteZero,
                        format!("short datagram write: {n} of {} bytes", frame.len()),
                    ));
                }
                Ok(())
            }
        }
    }
}

fn oversized(len: usize) -> io::Error {
    io::Error::new(
        io::ErrorKind::InvalidInput,
        format!("frame of {len} bytes does not fit the length prefix"),
    )
}

/// Fill `header`; `false` if the channel closed before its first byte.
async fn read_header(conn: &dyn Connection, header: &mut [u8]) -> io::Result<bool> {
    match conn.read(header).await? {
        0 => Ok(false),
        n => {
            read_exact(conn, &mut header[n..]).await?;
            Ok(true)
        }
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Protocol::HyperKit => "hyperkit",
            Protocol::Qemu => "qemu",
            Protocol::Bess => "bess",
            Protocol::Vfkit => "vfkit",
        };
        f.write_str(name)
    }
}

impl FromStr for Protocol {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "hyperkit" => Ok(Protocol::HyperKit),
            "qemu" => Ok(Protocol::Qemu),
            "bess" => Ok(Protocol::Bess),
            "vfkit" => Ok(Protocol::Vfkit),
            other => Err(format!(
                "unknown protocol `{other}` (expected hyperkit, qemu, bess or vfkit)"
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::net::StreamConnection;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::UnixStream;

    async fn pair() -> (StreamConnection, UnixStream) {
        let (a, b) = UnixStream::pair().unwrap();
        (StreamConnection::new(a), b)
    }

    #[tokio::test]
    async fn hyperkit_prefix_is_little_endian() {
        let (conn, mut peer) = pair().await;
        Protocol::HyperKit.write_frame(&conn, &[1, 2, 3]).await.unwrap();

        let mut wire = [0u8; 5];
        peer.read_exact(&mut wire).await.unwrap();
        assert_eq!(wire, [3, 0, 1, 2, 3]);
    }

    #[tokio::test]
    async fn qemu_frames_are_read_back() {
        let (conn, mut peer) = pair().await;
        peer.write_all(&[0, 0, 0, 2, 0xaa, 0xbb]).await.unwrap();
        drop(peer);

        let mut buf = Vec::new();
        let n = Protocol::Qemu.read_frame(&conn, &mut buf, 1514).await.unwrap();
        assert_eq!(n, Some(2));
        assert_eq!(buf, vec![0xaa, 0xbb]);

        let eof = Protocol::Qemu.read_frame(&conn, &mut buf, 1514).await.unwrap();
        assert_eq!(eof, None);
    }

    #[tokio::test]
    async fn oversized_frame_is_rejected() {
        let (conn, mut peer) = pair().await;
        peer.write_all(&[0xff, 0xff]).await.unwrap();

        let mut buf = Vec::new();
        let err = Protocol::HyperKit
            .read_frame(&conn, &mut buf, 1514)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }

    #[tokio::test]
    async fn truncated_frame_is_unexpected_eof() {
        let (conn, mut peer) = pair().await;
        peer.write_all(&[4, 0, 1]).await.unwrap();
        drop(peer);

        let mut buf = Vec::new();
        let err = Protocol::HyperKit
            .read_frame(&conn, &mut buf, 1514)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::UnexpectedEof);
    }

    #[tokio::test]
    async fn datagram_reads_skip_empty_and_oversized_messages() {
        let dir = tempfile::tempdir().unwrap();
        let socket = crate::net::listen_datagram(&dir.path().join("vm.sock")).unwrap();
        let conn = socket.connection();
        let guest = tokio::net::UnixDatagram::unbound().unwrap();

        guest.send_to(&[], socket.path()).await.unwrap();
        guest.send_to(&[7u8; 17], socket.path()).await.unwrap();
        guest.send_to(&[9u8; 16], socket.path()).await.unwrap();

        let mut buf = Vec::new();
        let n = Protocol::Vfkit.read_frame(&conn, &mut buf, 16).await.unwrap();
        assert_eq!(n, Some(16));
        assert_eq!(buf, vec![9u8; 16]);
    }

    #[tokio::test]
    async fn bess_channel_ends_on_empty_read() {
        let (conn, peer) = pair().await;
        drop(peer);

        let mut buf = Vec::new();
        let eof = Protocol::Bess.read_frame(&conn, &mut buf, 1514).await.unwrap();
        assert_eq!(eof, None);
    }

    #[test]
    fn hyperkit_prefix_bounds_the_frame() {
        assert_eq!(Protocol::HyperKit.max_frame_len(), Some(65535));
        assert_eq!(Protocol::Vfkit.max_frame_len(), None);
    }

    #[test]
    fn names_round_trip_through_serde() {
        let parsed: Protocol = serde_json::from_str("\"qemu\"").unwrap();
        assert_eq!(parsed, Protocol::Qemu);
        assert_eq!(serde_json::to_string(&Protocol::Vfkit).unwrap(), "\"vfkit\"");
        assert_eq!(Protocol::default().to_string(), "hyperkit");
        assert_eq!("QEMU".parse::<Protocol>(), Ok(Protocol::Qemu));
        assert!("vde".parse::<Protocol>().is_err());
    }
}
