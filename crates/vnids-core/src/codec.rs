//! Wire codec for the control protocol.
//!
//! Every transmission is a fixed 16-byte big-endian header followed by
//! exactly `length` bytes of JSON payload.
//!
//! ```text
//! +------------+-------------+------------+--------------+----------------+----------------+
//! | magic (4B) | version (2B)| type (2B)  | length (4B)  | reserved (4B)  | payload (N B)  |
//! +------------+-------------+------------+--------------+----------------+----------------+
//! ```
//!
//! [`encode`] and [`decode`] are pure transforms. [`read_frame`] and
//! [`write_frame`] drive them over an async byte stream.

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// `"VNID"` in ASCII.
pub const MAGIC: u32 = 0x564E_4944;

/// Protocol version 1.0. The high byte is the major version.
pub const PROTOCOL_VERSION: u16 = 0x0100;

/// Size of the fixed header in bytes.
pub const HEADER_LEN: usize = 16;

/// Errors from framing or unframing a message.
#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("bad magic 0x{0:08X}")]
    BadMagic(u32),

    #[error("unsupported protocol version 0x{0:04X}")]
    UnsupportedVersion(u16),

    #[error("unknown message type {0}")]
    UnknownMessageType(u16),

    #[error("truncated frame: expected {expected} bytes, got {actual}")]
    Truncated { expected: usize, actual: usize },

    #[error("payload of {length} bytes exceeds limit of {limit}")]
    PayloadTooLarge { length: u64, limit: u64 },

    #[error("header declares {declared} payload bytes but {actual} were supplied")]
    LengthMismatch { declared: u32, actual: usize },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Kind of frame, carried in the header `type` field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u16)]
pub enum MessageType {
    Request = 1,
    Response = 2,
    Event = 3,
    Heartbeat = 4,
}

impl MessageType {
    pub const ALL: [MessageType; 4] = [
        MessageType::Request,
        MessageType::Response,
        MessageType::Event,
        MessageType::Heartbeat,
    ];
}

impl TryFrom<u16> for MessageType {
    type Error = ProtocolError;

    fn try_from(value: u16) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(MessageType::Request),
            2 => Ok(MessageType::Response),
            3 => Ok(MessageType::Event),
            4 => Ok(MessageType::Heartbeat),
            other => Err(ProtocolError::UnknownMessageType(other)),
        }
    }
}

/// Decoded frame header. `magic` and `reserved` are implicit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header {
    pub version: u16,
    pub msg_type: MessageType,
    pub length: u32,
}

impl Header {
    /// Header for a payload of `payload_len` bytes at the current version.
    pub fn new(msg_type: MessageType, payload_len: usize) -> Result<Self, ProtocolError> {
        let length = u32::try_from(payload_len).map_err(|_| ProtocolError::PayloadTooLarge {
            length: payload_len as u64,
            limit: u64::from(u32::MAX),
        })?;
        Ok(Self {
            version: PROTOCOL_VERSION,
            msg_type,
            length,
        })
    }

    /// Total frame size: header plus payload.
    pub fn frame_len(&self) -> usize {
        HEADER_LEN + self.length as usize
    }

    pub fn to_bytes(&self) -> [u8; HEADER_LEN] {
        let mut buf = [0u8; HEADER_LEN];
        buf[0..4].copy_from_slice(&MAGIC.to_be_bytes());
        buf[4..6].copy_from_slice(&self.version.to_be_bytes());
        buf[6..8].copy_from_slice(&(self.msg_type as u16).to_be_bytes());
        buf[8..12].copy_from_slice(&self.length.to_be_bytes());
        // bytes 12..16 are the reserved word, always zero on send
        buf
    }

    /// Parse a header from the start of `bytes`.
    ///
    /// The magic is checked against whatever prefix is available before
    /// anything else, so a foreign stream is rejected even when short.
    pub fn parse(bytes: &[u8]) -> Result<Self, ProtocolError> {
        let magic_bytes = MAGIC.to_be_bytes();
        let prefix = &bytes[..bytes.len().min(4)];
        if prefix != &magic_bytes[..prefix.len()] {
            let mut found = [0u8; 4];
            found[..prefix.len()].copy_from_slice(prefix);
            return Err(ProtocolError::BadMagic(u32::from_be_bytes(found)));
        }
        if bytes.len() < HEADER_LEN {
            return Err(ProtocolError::Truncated {
                expected: HEADER_LEN,
                actual: bytes.len(),
            });
        }

        let version = u16::from_be_bytes([bytes[4], bytes[5]]);
        if version >> 8 > PROTOCOL_VERSION >> 8 {
            return Err(ProtocolError::UnsupportedVersion(version));
        }
        let msg_type = MessageType::try_from(u16::from_be_bytes([bytes[6], bytes[7]]))?;
        let length = u32::from_be_bytes([bytes[8], bytes[9], bytes[10], bytes[11]]);

        Ok(Self {
            version,
            msg_type,
            length,
        })
    }
}

/// Encode a header and payload into one contiguous frame.
///
/// The header's `length` must match the payload exactly.
pub fn encode(header: &Header, payload: &[u8]) -> Result<Vec<u8>, ProtocolError> {
    if header.length as usize != payload.len() {
        return Err(ProtocolError::LengthMismatch {
            declared: header.length,
            actual: payload.len(),
        });
    }
    let mut buf = Vec::with_capacity(header.frame_len());
    buf.extend_from_slice(&header.to_bytes());
    buf.extend_from_slice(payload);
    Ok(buf)
}

/// Build a current-version header for `payload` and encode both.
pub fn encode_message(msg_type: MessageType, payload: &[u8]) -> Result<Vec<u8>, ProtocolError> {
    let header = Header::new(msg_type, payload.len())?;
    encode(&header, payload)
}

/// Decode one frame from the front of `bytes`.
///
/// Bytes after the frame are left alone; use [`Header::frame_len`] to
/// advance past it.
pub fn decode(bytes: &[u8]) -> Result<(Header, &[u8]), ProtocolError> {
    let header = Header::parse(bytes)?;
    let end = header.frame_len();
    if bytes.len() < end {
        return Err(ProtocolError::Truncated {
            expected: end,
            actual: bytes.len(),
        });
    }
    Ok((header, &bytes[HEADER_LEN..end]))
}

/// Read one frame from `reader`.
///
/// Returns `Ok(None)` on a clean EOF before the first header byte.
/// Payloads larger than `max_payload` are refused before any payload
/// byte is read.
pub async fn read_frame<R>(
    reader: &mut R,
    max_payload: u32,
) -> Result<Option<(Header, Vec<u8>)>, ProtocolError>
where
    R: AsyncRead + Unpin,
{
    let mut head = [0u8; HEADER_LEN];
    let got = read_full(reader, &mut head).await?;
    if got == 0 {
        return Ok(None);
    }
    let header = Header::parse(&head[..got])?;

    if header.length > max_payload {
        return Err(ProtocolError::PayloadTooLarge {
            length: u64::from(header.length),
            limit: u64::from(max_payload),
        });
    }

    let mut payload = vec![0u8; header.length as usize];
    let got = read_full(reader, &mut payload).await?;
    if got < payload.len() {
        return Err(ProtocolError::Truncated {
            expected: header.frame_len(),
            actual: HEADER_LEN + got,
        });
    }
    Ok(Some((header, payload)))
}

/// Frame `payload` and write it to `writer`, flushing afterwards.
pub async fn write_frame<W>(
    writer: &mut W,
    msg_type: MessageType,
    payload: &[u8],
) -> Result<(), ProtocolError>
where
    W: AsyncWrite + Unpin,
{
    let frame = encode_message(msg_type, payload)?;
    writer.write_all(&frame).await?;
    writer.flush().await?;
    Ok(())
}

/// Fill `buf` until it is full or the reader hits EOF; returns bytes read.
async fn read_full<R>(reader: &mut R, buf: &mut [u8]) -> std::io::Result<usize>
where
    R: AsyncRead + Unpin,
{
    let mut filled = 0;
    while filled < buf.len() {
        let n = reader.read(&mut buf[filled..]).await?;
        if n == 0 {
            break;
        }
        filled += n;
    }
    Ok(filled)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use proptest::prelude::*;

    fn status_payload() -> &'static [u8] {
        br#"{"command":"status","request_id":1}"#
    }

    #[test]
    fn test_header_layout_is_big_endian() {
        let frame = encode_message(MessageType::Request, status_payload()).unwrap();
        assert_eq!(frame.len(), HEADER_LEN + status_payload().len());
        assert_eq!(&frame[0..4], &[0x56, 0x4E, 0x49, 0x44]);
        assert_eq!(&frame[4..6], &[0x01, 0x00]);
        assert_eq!(&frame[6..8], &[0x00, 0x01]);
        assert_eq!(
            u32::from_be_bytes([frame[8], frame[9], frame[10], frame[11]]) as usize,
            status_payload().len()
        );
        assert_eq!(&frame[12..16], &[0, 0, 0, 0]);
    }

    #[test]
    fn test_decode_ignores_reserved_word() {
        let mut frame = encode_message(MessageType::Heartbeat, b"{}").unwrap();
        frame[12..16].copy_from_slice(&[0xDE, 0xAD, 0xBE, 0xEF]);
        let (header, payload) = decode(&frame).unwrap();
        assert_eq!(header.msg_type, MessageType::Heartbeat);
        assert_eq!(payload, b"{}");
    }

    #[test]
    fn test_decode_truncated_payload() {
        let frame = encode_message(MessageType::Request, status_payload()).unwrap();
        let err = decode(&frame[..frame.len() - 3]).unwrap_err();
        assert!(matches!(
            err,
            ProtocolError::Truncated { expected, actual } if expected == frame.len() && actual == frame.len() - 3
        ));
    }

    #[test]
    fn test_decode_truncated_header() {
        let frame = encode_message(MessageType::Request, b"").unwrap();
        let err = decode(&frame[..10]).unwrap_err();
        assert!(matches!(err, ProtocolError::Truncated { expected: 16, actual: 10 }));
    }

    #[test]
    fn test_decode_future_major_version() {
        let mut frame = encode_message(MessageType::Request, b"{}").unwrap();
        frame[4..6].copy_from_slice(&0x0200u16.to_be_bytes());
        assert!(matches!(
            decode(&frame),
            Err(ProtocolError::UnsupportedVersion(0x0200))
        ));
    }

    #[test]
    fn test_decode_accepts_newer_minor_version() {
        let mut frame = encode_message(MessageType::Request, b"{}").unwrap();
        frame[4..6].copy_from_slice(&0x0107u16.to_be_bytes());
        let (header, _) = decode(&frame).unwrap();
        assert_eq!(header.version, 0x0107);
    }

    #[test]
    fn test_decode_unknown_type() {
        let mut frame = encode_message(MessageType::Request, b"{}").unwrap();
        frame[6..8].copy_from_slice(&9u16.to_be_bytes());
        assert!(matches!(
            decode(&frame),
            Err(ProtocolError::UnknownMessageType(9))
        ));
    }

    #[test]
    fn test_encode_rejects_length_mismatch() {
        let header = Header::new(MessageType::Request, 10).unwrap();
        assert!(matches!(
            encode(&header, b"short"),
            Err(ProtocolError::LengthMismatch { declared: 10, actual: 5 })
        ));
    }

    #[tokio::test]
    async fn test_read_write_frame_roundtrip() {
        let mut buffer = Vec::new();
        write_frame(&mut buffer, MessageType::Response, b"{\"status\":\"ok\"}")
            .await
            .unwrap();
        write_frame(&mut buffer, MessageType::Heartbeat, b"{}")
            .await
            .unwrap();

        let mut reader = buffer.as_slice();
        let (first, body) = read_frame(&mut reader, 1024).await.unwrap().unwrap();
        assert_eq!(first.msg_type, MessageType::Response);
        assert_eq!(body, b"{\"status\":\"ok\"}");

        let (second, _) = read_frame(&mut reader, 1024).await.unwrap().unwrap();
        assert_eq!(second.msg_type, MessageType::Heartbeat);

        assert!(read_frame(&mut reader, 1024).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_read_frame_rejects_oversized_payload() {
        let frame = encode_message(MessageType::Request, &[b'x'; 64]).unwrap();
        let mut reader = frame.as_slice();
        let err = read_frame(&mut reader, 32).await.unwrap_err();
        assert!(matches!(err, ProtocolError::PayloadTooLarge { length: 64, limit: 32 }));
    }

    #[tokio::test]
    async fn test_read_frame_eof_mid_payload() {
        let frame = encode_message(MessageType::Request, status_payload()).unwrap();
        let mut reader = &frame[..20];
        let err = read_frame(&mut reader, 1024).await.unwrap_err();
        assert!(matches!(err, ProtocolError::Truncated { actual: 20, .. }));
    }

    #[tokio::test]
    async fn test_read_frame_bad_magic_reads_no_payload() {
        let mut bytes = b"GET / HTTP/1.1\r\n".to_vec();
        bytes.extend_from_slice(b"payload that must stay unread");
        let mut reader = bytes.as_slice();
        let err = read_frame(&mut reader, 1024).await.unwrap_err();
        assert!(matches!(err, ProtocolError::BadMagic(_)));
        assert_eq!(reader, b"payload that must stay unread");
    }

    fn any_message_type() -> impl Strategy<Value = MessageType> {
        prop::sample::select(MessageType::ALL.to_vec())
    }

    proptest! {
        #[test]
        fn prop_encode_decode_roundtrip(
            msg_type in any_message_type(),
            minor in 0u16..=0xFF,
            payload in prop::collection::vec(any::<u8>(), 0..512),
        ) {
            let header = Header {
                version: 0x0100 | minor,
                msg_type,
                length: payload.len() as u32,
            };
            let frame = encode(&header, &payload).unwrap();
            prop_assert_eq!(frame.len(), HEADER_LEN + payload.len());

            let (decoded, body) = decode(&frame).unwrap();
            prop_assert_eq!(decoded, header);
            prop_assert_eq!(body, payload.as_slice());
        }

        #[test]
        fn prop_foreign_prefix_is_bad_magic(
            mut bytes in prop::collection::vec(any::<u8>(), 4..64),
        ) {
            if bytes[..4] == MAGIC.to_be_bytes() {
                bytes[0] ^= 0xFF;
            }
            prop_assert!(matches!(decode(&bytes), Err(ProtocolError::BadMagic(_))));
        }
    }
}
