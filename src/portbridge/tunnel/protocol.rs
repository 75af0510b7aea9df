//! Relay stream framing.
//!
//! Client -> server frames carry an explicit command tag; server -> client frames do not,
//! because only the reply shape travels that way. All integers are little-endian `i32`.
//!
//! ```text
//! forward: [cmd=FRWD][16B conn id][remote port][len][len bytes]
//! close:   [cmd=CLOS][16B conn id]
//! reply:   [16B conn id][len][len bytes]
//! ```
//!
//! A zero-length reply tells the client that the target side of the connection is gone.

use std::fmt;

use bytes::{BufMut, Bytes, BytesMut};
use serde::Serialize;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt};
use uuid::Uuid;

pub const CMD_FORWARD: i32 = i32::from_le_bytes(*b"FRWD");
pub const CMD_CLOSE_FORWARD_CLIENT: i32 = i32::from_le_bytes(*b"CLOS");

pub const MAX_FRAME_PAYLOAD: usize = 16 << 20; // 16 MiB
pub const READ_CHUNK: usize = 64 * 1024;

const ID_LEN: usize = 16;
const FORWARD_HEADER_LEN: usize = ID_LEN + 4 + 4;
const REPLY_HEADER_LEN: usize = ID_LEN + 4;

#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("unknown command {0:#010x}")]
    UnknownCommand(i32),
    #[error("invalid payload length {0}")]
    InvalidLength(i32),
    #[error("payload too large: {0}")]
    PayloadTooLarge(usize),
    #[error("stream ended mid-frame")]
    Truncated,
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
}

/// Correlates one end-user TCP connection across the relay stream.
///
/// On the wire this is the 16-byte mixed-endian GUID layout, so ids interoperate with
/// peers that serialize GUIDs natively.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(transparent)]
pub struct ConnectionId(Uuid);

impl ConnectionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn from_wire(b: [u8; ID_LEN]) -> Self {
        Self(Uuid::from_bytes_le(b))
    }

    pub fn to_wire(self) -> [u8; ID_LEN] {
        self.0.to_bytes_le()
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Local identity of one accepted relay stream; never sent over the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(transparent)]
pub struct RelayStreamId(Uuid);

impl RelayStreamId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl fmt::Display for RelayStreamId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Header of a client -> server frame. The forward payload is read separately so the
/// server can validate the port before pulling the body.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientHeader {
    Forward {
        id: ConnectionId,
        remote_port: i32,
        len: usize,
    },
    Close {
        id: ConnectionId,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientFrame {
    Forward {
        id: ConnectionId,
        remote_port: i32,
        payload: Bytes,
    },
    Close {
        id: ConnectionId,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReplyFrame {
    pub id: ConnectionId,
    pub payload: Bytes,
}

pub fn encode_forward(
    id: ConnectionId,
    remote_port: i32,
    data: &[u8],
) -> Result<Bytes, ProtocolError> {
    let len = wire_len(data.len())?;
    let mut b = BytesMut::with_capacity(4 + FORWARD_HEADER_LEN + data.len());
    b.put_i32_le(CMD_FORWARD);
    b.put_slice(&id.to_wire());
    b.put_i32_le(remote_port);
    b.put_i32_le(len);
    b.put_slice(data);
    Ok(b.freeze())
}

pub fn encode_close(id: ConnectionId) -> Bytes {
    let mut b = BytesMut::with_capacity(4 + ID_LEN);
    b.put_i32_le(CMD_CLOSE_FORWARD_CLIENT);
    b.put_slice(&id.to_wire());
    b.freeze()
}

pub fn encode_reply(id: ConnectionId, data: &[u8]) -> Result<Bytes, ProtocolError> {
    let len = wire_len(data.len())?;
    let mut b = BytesMut::with_capacity(REPLY_HEADER_LEN + data.len());
    b.put_slice(&id.to_wire());
    b.put_i32_le(len);
    b.put_slice(data);
    Ok(b.freeze())
}

/// Encoders refuse anything the decoder would refuse.
fn wire_len(n: usize) -> Result<i32, ProtocolError> {
    if n > MAX_FRAME_PAYLOAD {
        return Err(ProtocolError::PayloadTooLarge(n));
    }
    i32::try_from(n).map_err(|_| ProtocolError::PayloadTooLarge(n))
}

/// Reads the next client -> server header. `Ok(None)` means the stream ended cleanly on a
/// frame boundary.
pub async fn read_client_header<R: AsyncRead + Unpin>(
    r: &mut R,
) -> Result<Option<ClientHeader>, ProtocolError> {
    let mut cmd = [0u8; 4];
    if !read_full(r, &mut cmd).await? {
        return Ok(None);
    }

    match i32::from_le_bytes(cmd) {
        CMD_FORWARD => {
            let mut h = [0u8; FORWARD_HEADER_LEN];
            if !read_full(r, &mut h).await? {
                return Err(ProtocolError::Truncated);
            }
            let id = ConnectionId::from_wire(id_at(&h));
            let remote_port = i32_at(&h, ID_LEN);
            let len = checked_len(i32_at(&h, ID_LEN + 4))?;
            Ok(Some(ClientHeader::Forward {
                id,
                remote_port,
                len,
            }))
        }
        CMD_CLOSE_FORWARD_CLIENT => {
            let mut h = [0u8; ID_LEN];
            if !read_full(r, &mut h).await? {
                return Err(ProtocolError::Truncated);
            }
            Ok(Some(ClientHeader::Close {
                id: ConnectionId::from_wire(h),
            }))
        }
        other => Err(ProtocolError::UnknownCommand(other)),
    }
}

/// Reads exactly `len` payload bytes in bounded chunks.
pub async fn read_payload<R: AsyncRead + Unpin>(
    r: &mut R,
    len: usize,
) -> Result<Bytes, ProtocolError> {
    if len > MAX_FRAME_PAYLOAD {
        return Err(ProtocolError::PayloadTooLarge(len));
    }
    let mut out = BytesMut::with_capacity(len.min(READ_CHUNK));
    while out.len() < len {
        let want = (len - out.len()).min(READ_CHUNK);
        out.reserve(want);
        let n = r.read_buf(&mut (&mut out).limit(want)).await?;
        if n == 0 {
            return Err(ProtocolError::Truncated);
        }
    }
    Ok(out.freeze())
}

pub async fn read_client_frame<R: AsyncRead + Unpin>(
    r: &mut R,
) -> Result<Option<ClientFrame>, ProtocolError> {
    let Some(h) = read_client_header(r).await? else {
        return Ok(None);
    };
    match h {
        ClientHeader::Forward {
            id,
            remote_port,
            len,
        } => {
            let payload = read_payload(r, len).await?;
            Ok(Some(ClientFrame::Forward {
                id,
                remote_port,
                payload,
            }))
        }
        ClientHeader::Close { id } => Ok(Some(ClientFrame::Close { id })),
    }
}

pub async fn read_reply<R: AsyncRead + Unpin>(
    r: &mut R,
) -> Result<Option<ReplyFrame>, ProtocolError> {
    let mut h = [0u8; REPLY_HEADER_LEN];
    if !read_full(r, &mut h).await? {
        return Ok(None);
    }
    let id = ConnectionId::from_wire(id_at(&h));
    let len = checked_len(i32_at(&h, ID_LEN))?;
    let payload = read_payload(r, len).await?;
    Ok(Some(ReplyFrame { id, payload }))
}

/// Fills `buf` completely, accumulating partial reads. Returns `false` when the stream is
/// at EOF before the first byte.
async fn read_full<R: AsyncRead + Unpin>(r: &mut R, buf: &mut [u8]) -> Result<bool, ProtocolError> {
    let mut filled = 0;
    while filled < buf.len() {
        let n = r.read(&mut buf[filled..]).await?;
        if n == 0 {
            if filled == 0 {
                return Ok(false);
            }
            return Err(ProtocolError::Truncated);
        }
        filled += n;
    }
    Ok(true)
}

fn checked_len(n: i32) -> Result<usize, ProtocolError> {
    let len = usize::try_from(n).map_err(|_| ProtocolError::InvalidLength(n))?;
    if len > MAX_FRAME_PAYLOAD {
        return Err(ProtocolError::PayloadTooLarge(len));
    }
    Ok(len)
}

fn id_at(b: &[u8]) -> [u8; ID_LEN] {
    let mut id = [0u8; ID_LEN];
    id.copy_from_slice(&b[..ID_LEN]);
    id
}

fn i32_at(b: &[u8], off: usize) -> i32 {
    i32::from_le_bytes([b[off], b[off + 1], b[off + 2], b[off + 3]])
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncWriteExt;

    #[tokio::test]
    async fn forward_roundtrip_across_payload_sizes() {
        let id = ConnectionId::new();
        for n in [0usize, 1, 7, READ_CHUNK - 1, READ_CHUNK, READ_CHUNK * 2 + 3] {
            let data: Vec<u8> = (0..n).map(|i| (i % 251) as u8).collect();
            let frame = encode_forward(id, 2222, &data).unwrap();

            let (mut a, mut b) = tokio::io::duplex(4096);
            let w = tokio::spawn(async move {
                a.write_all(&frame).await.unwrap();
            });
            let got = read_client_frame(&mut b).await.unwrap().unwrap();
            w.await.unwrap();

            assert_eq!(
                got,
                ClientFrame::Forward {
                    id,
                    remote_port: 2222,
                    payload: Bytes::from(data),
                },
                "payload size {n}"
            );
        }
    }

    #[tokio::test]
    async fn reply_roundtrip_including_empty() {
        let id = ConnectionId::new();
        let mut wire = Vec::new();
        wire.extend_from_slice(&encode_reply(id, b"PONG").unwrap());
        wire.extend_from_slice(&encode_reply(id, b"").unwrap());

        let mut r = &wire[..];
        let first = read_reply(&mut r).await.unwrap().unwrap();
        assert_eq!(first.id, id);
        assert_eq!(&first.payload[..], b"PONG");

        let second = read_reply(&mut r).await.unwrap().unwrap();
        assert_eq!(second.id, id);
        assert!(second.payload.is_empty());

        assert!(read_reply(&mut r).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn close_frame_layout() {
        let id = ConnectionId::new();
        let b = encode_close(id);
        assert_eq!(b.len(), 20);
        assert_eq!(&b[..4], b"CLOS");
        assert_eq!(&b[4..], &id.to_wire());

        let mut r = &b[..];
        assert_eq!(
            read_client_frame(&mut r).await.unwrap(),
            Some(ClientFrame::Close { id })
        );
    }

    #[test]
    fn forward_header_is_little_endian() {
        let id = ConnectionId::new();
        let b = encode_forward(id, 0x0102_0304, b"xy").unwrap();
        assert_eq!(&b[..4], b"FRWD");
        assert_eq!(&b[20..24], &[0x04, 0x03, 0x02, 0x01]);
        assert_eq!(&b[24..28], &[2, 0, 0, 0]);
        assert_eq!(&b[28..], b"xy");
    }

    #[tokio::test]
    async fn header_accumulates_byte_by_byte_writes() {
        let id = ConnectionId::new();
        let frame = encode_forward(id, 80, b"hello").unwrap();
        let (mut a, mut b) = tokio::io::duplex(1);
        tokio::spawn(async move {
            for byte in frame.iter() {
                a.write_all(&[*byte]).await.unwrap();
                a.flush().await.unwrap();
            }
        });

        let got = read_client_frame(&mut b).await.unwrap().unwrap();
        match got {
            ClientFrame::Forward { payload, .. } => assert_eq!(&payload[..], b"hello"),
            other => panic!("unexpected frame: {other:?}"),
        }
    }

    #[tokio::test]
    async fn eof_on_boundary_is_clean_and_mid_frame_is_truncated() {
        let mut empty: &[u8] = &[];
        assert!(read_client_header(&mut empty).await.unwrap().is_none());

        let frame = encode_forward(ConnectionId::new(), 80, b"abcdef").unwrap();
        let mut cut = &frame[..frame.len() - 2];
        let err = read_client_frame(&mut cut).await.unwrap_err();
        assert!(matches!(err, ProtocolError::Truncated), "got {err:?}");
    }

    #[test]
    fn encoders_reject_payloads_over_the_frame_cap() {
        let big = vec![0u8; MAX_FRAME_PAYLOAD + 1];
        let id = ConnectionId::new();
        assert!(matches!(
            encode_forward(id, 80, &big),
            Err(ProtocolError::PayloadTooLarge(n)) if n == MAX_FRAME_PAYLOAD + 1
        ));
        assert!(matches!(
            encode_reply(id, &big),
            Err(ProtocolError::PayloadTooLarge(_))
        ));
        assert!(encode_reply(id, &big[..MAX_FRAME_PAYLOAD]).is_ok());
    }

    #[tokio::test]
    async fn rejects_unknown_command_and_bad_lengths() {
        let mut bad = &b"XXXX"[..];
        assert!(matches!(
            read_client_header(&mut bad).await.unwrap_err(),
            ProtocolError::UnknownCommand(_)
        ));

        let mut neg = BytesMut::new();
        neg.put_slice(&ConnectionId::new().to_wire());
        neg.put_i32_le(-1);
        let mut r = &neg[..];
        assert!(matches!(
            read_reply(&mut r).await.unwrap_err(),
            ProtocolError::InvalidLength(-1)
        ));

        let mut big = BytesMut::new();
        big.put_i32_le(CMD_FORWARD);
        big.put_slice(&ConnectionId::new().to_wire());
        big.put_i32_le(80);
        big.put_i32_le((MAX_FRAME_PAYLOAD + 1) as i32);
        let mut r = &big[..];
        assert!(matches!(
            read_client_header(&mut r).await.unwrap_err(),
            ProtocolError::PayloadTooLarge(_)
        ));
    }

    #[test]
    fn connection_id_wire_roundtrip() {
        let id = ConnectionId::new();
        assert_eq!(ConnectionId::from_wire(id.to_wire()), id);
        assert_ne!(ConnectionId::new(), id);
    }
}
