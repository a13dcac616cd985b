//! Packet envelope
//!
//! Wire format: `[u32 BE body length][body]`, where body is
//! `[kind][payload]`, sealed by the packet cipher when one is configured.
//! Kind 0 is a heartbeat, 1 text, 2 binary.

use std::io;
use std::sync::Arc;

use bytes::{BufMut, Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use super::{MessageType, Packet};
use crate::cipher::BlockCrypt;
use crate::error::SessionError;

/// Length prefix size
pub const FRAME_HEADER_LEN: usize = 4;

const KIND_HEARTBEAT: u8 = 0;
const KIND_TEXT: u8 = 1;
const KIND_BINARY: u8 = 2;

/// Encodes and decodes packets for a byte stream
#[derive(Debug, Clone)]
pub struct FrameCodec {
    max_msg_len: usize,
    cipher: Option<Arc<BlockCrypt>>,
}

impl FrameCodec {
    pub fn new(max_msg_len: usize, cipher: Option<Arc<BlockCrypt>>) -> Self {
        Self { max_msg_len, cipher }
    }

    /// Largest body a peer may announce
    pub fn max_body_len(&self) -> usize {
        let overhead = self.cipher.as_ref().map_or(0, |c| c.overhead());
        1 + self.max_msg_len + overhead
    }

    /// Encode a packet including its length prefix
    pub fn encode(&self, packet: &Packet) -> Result<Bytes, SessionError> {
        let (kind, payload): (u8, &[u8]) = match packet {
            Packet::Heartbeat => (KIND_HEARTBEAT, &[]),
            Packet::Data { msg_type, payload } => {
                if payload.len() > self.max_msg_len {
                    return Err(SessionError::MessageTooLarge {
                        len: payload.len(),
                        max: self.max_msg_len,
                    });
                }
                let kind = match msg_type {
                    MessageType::Text => KIND_TEXT,
                    MessageType::Binary => KIND_BINARY,
                };
                (kind, payload)
            }
        };

        let mut plain = Vec::with_capacity(1 + payload.len());
        plain.push(kind);
        plain.extend_from_slice(payload);

        let body = match &self.cipher {
            Some(cipher) => cipher.seal(&plain)?,
            None => plain,
        };

        let mut buf = BytesMut::with_capacity(FRAME_HEADER_LEN + body.len());
        buf.put_u32(body.len() as u32);
        buf.extend_from_slice(&body);
        Ok(buf.freeze())
    }

    /// Decode a body that was read after its length prefix
    pub fn decode(&self, mut body: Vec<u8>) -> Result<Packet, SessionError> {
        let plain: &[u8] = match &self.cipher {
            Some(cipher) => cipher.open(&mut body)?,
            None => &body,
        };

        let (&kind, payload) = plain
            .split_first()
            .ok_or(SessionError::Protocol("empty packet body"))?;
        if payload.len() > self.max_msg_len {
            return Err(SessionError::MessageTooLarge {
                len: payload.len(),
                max: self.max_msg_len,
            });
        }

        match kind {
            KIND_HEARTBEAT => Ok(Packet::Heartbeat),
            KIND_TEXT => Ok(Packet::text(Bytes::copy_from_slice(payload))),
            KIND_BINARY => Ok(Packet::binary(Bytes::copy_from_slice(payload))),
            _ => Err(SessionError::Protocol("unknown packet kind")),
        }
    }

    /// Read one packet from a stream
    pub async fn read_packet<R>(&self, reader: &mut R) -> Result<Packet, SessionError>
    where
        R: AsyncRead + Unpin,
    {
        let mut header = [0u8; FRAME_HEADER_LEN];
        reader.read_exact(&mut header).await.map_err(map_io)?;

        let len = u32::from_be_bytes(header) as usize;
        if len > self.max_body_len() {
            return Err(SessionError::MessageTooLarge {
                len,
                max: self.max_body_len(),
            });
        }

        let mut body = vec![0u8; len];
        reader.read_exact(&mut body).await.map_err(map_io)?;
        self.decode(body)
    }

    /// Write one packet to a stream
    pub async fn write_packet<W>(&self, writer: &mut W, packet: &Packet) -> Result<(), SessionError>
    where
        W: AsyncWrite + Unpin,
    {
        let frame = self.encode(packet)?;
        writer.write_all(&frame).await.map_err(map_io)?;
        Ok(())
    }
}

/// Orderly ends of a stream become [`SessionError::Closed`]
fn map_io(err: io::Error) -> SessionError {
    match err.kind() {
        io::ErrorKind::UnexpectedEof
        | io::ErrorKind::ConnectionAborted
        | io::ErrorKind::ConnectionReset
        | io::ErrorKind::NotConnected
        | io::ErrorKind::BrokenPipe => SessionError::Closed,
        _ => SessionError::Io(err),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cipher::CipherKind;

    fn codec(cipher: bool) -> FrameCodec {
        let cipher = cipher.then(|| Arc::new(BlockCrypt::new(CipherKind::Aes128, "key", "salt").unwrap()));
        FrameCodec::new(16, cipher)
    }

    #[tokio::test]
    async fn test_stream_exchange() {
        let codec = codec(true);
        let (mut a, mut b) = tokio::io::duplex(1024);

        codec.write_packet(&mut a, &Packet::Heartbeat).await.unwrap();
        codec.write_packet(&mut a, &Packet::text("hey")).await.unwrap();
        codec.write_packet(&mut a, &Packet::binary(vec![1, 2, 3])).await.unwrap();

        assert_eq!(codec.read_packet(&mut b).await.unwrap(), Packet::Heartbeat);
        assert_eq!(codec.read_packet(&mut b).await.unwrap(), Packet::text("hey"));
        assert_eq!(
            codec.read_packet(&mut b).await.unwrap(),
            Packet::binary(vec![1, 2, 3])
        );
    }

    #[test]
    fn test_plain_layout() {
        let frame = codec(false).encode(&Packet::binary(vec![9, 8])).unwrap();
        assert_eq!(&frame[..], &[0, 0, 0, 3, KIND_BINARY, 9, 8]);
    }

    #[test]
    fn test_oversized_payload_refused() {
        let err = codec(false).encode(&Packet::binary(vec![0u8; 17])).unwrap_err();
        assert!(matches!(err, SessionError::MessageTooLarge { len: 17, max: 16 }));
    }

    #[tokio::test]
    async fn test_oversized_header_refused() {
        let codec = codec(false);
        let (mut a, mut b) = tokio::io::duplex(64);
        a.write_all(&1000u32.to_be_bytes()).await.unwrap();

        let err = codec.read_packet(&mut b).await.unwrap_err();
        assert!(matches!(err, SessionError::MessageTooLarge { len: 1000, .. }));
    }

    #[tokio::test]
    async fn test_eof_is_closed() {
        let codec = codec(false);
        let (a, mut b) = tokio::io::duplex(64);
        drop(a);

        assert!(codec.read_packet(&mut b).await.unwrap_err().is_closed());
    }

    #[test]
    fn test_bad_bodies_rejected() {
        let codec = codec(false);
        assert!(matches!(codec.decode(vec![]), Err(SessionError::Protocol(_))));
        assert!(matches!(codec.decode(vec![7]), Err(SessionError::Protocol(_))));
    }
}
