//! Length-prefixed framing for tunnel connections
//!
//! Format: `[length: u32 big-endian][kind: u8][payload]`, where `length`
//! counts the kind byte plus the payload.

use bytes::{Buf, BufMut, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use super::{Frame, FrameKind, Message};
use crate::constants::MAX_FRAME_SIZE_BYTES;
use crate::error::TunnelError;

const LENGTH_FIELD_BYTES: usize = 4;

/// Tunnel frame codec, usable with `tokio_util::codec::Framed`
#[derive(Debug, Clone)]
pub struct TunnelCodec {
    max_frame_size: usize,
}

impl TunnelCodec {
    pub fn new(max_frame_size: usize) -> Self {
        Self { max_frame_size }
    }
}

impl Default for TunnelCodec {
    fn default() -> Self {
        Self::new(MAX_FRAME_SIZE_BYTES)
    }
}

impl Decoder for TunnelCodec {
    type Item = Frame;
    type Error = TunnelError;

    fn decode(&mut self, buf: &mut BytesMut) -> Result<Option<Frame>, TunnelError> {
        // Need at least 4 bytes for length header
        if buf.len() < LENGTH_FIELD_BYTES {
            return Ok(None);
        }

        let mut length_bytes = [0u8; LENGTH_FIELD_BYTES];
        length_bytes.copy_from_slice(&buf[..LENGTH_FIELD_BYTES]);
        let length = u32::from_be_bytes(length_bytes) as usize;

        if length > self.max_frame_size {
            return Err(TunnelError::FrameTooLarge(length, self.max_frame_size));
        }
        if length == 0 {
            return Err(TunnelError::ConnectionError(
                "Zero-length frame has no kind byte".to_string(),
            ));
        }

        if buf.len() < LENGTH_FIELD_BYTES + length {
            buf.reserve(LENGTH_FIELD_BYTES + length - buf.len());
            return Ok(None);
        }

        buf.advance(LENGTH_FIELD_BYTES);
        let kind = FrameKind::try_from(buf.get_u8())?;
        let payload = buf.split_to(length - 1).freeze();

        Ok(Some(Frame { kind, payload }))
    }
}

impl Encoder<Frame> for TunnelCodec {
    type Error = TunnelError;

    fn encode(&mut self, frame: Frame, buf: &mut BytesMut) -> Result<(), TunnelError> {
        let length = frame.payload.len() + 1;
        if length > self.max_frame_size {
            return Err(TunnelError::FrameTooLarge(length, self.max_frame_size));
        }

        buf.reserve(LENGTH_FIELD_BYTES + length);
        buf.put_u32(length as u32);
        buf.put_u8(frame.kind as u8);
        buf.put_slice(&frame.payload);
        Ok(())
    }
}

impl Encoder<Message> for TunnelCodec {
    type Error = TunnelError;

    fn encode(&mut self, message: Message, buf: &mut BytesMut) -> Result<(), TunnelError> {
        let frame = message.into_frame()?;
        Encoder::<Frame>::encode(self, frame, buf)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{HttpRequest, HttpResponse};
    use bytes::Bytes;

    const REQ_ID: &str = "V1StGXR8_Z5jdHi6B-myT";

    fn encode(message: Message) -> BytesMut {
        let mut buf = BytesMut::new();
        TunnelCodec::default().encode(message, &mut buf).unwrap();
        buf
    }

    #[test]
    fn test_encode_layout() {
        let buf = encode(Message::HttpResponse {
            request_id: REQ_ID.to_string(),
            response: HttpResponse::new(204),
        });

        let length = u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]) as usize;
        assert_eq!(length, buf.len() - 4);
        assert_eq!(buf[4], FrameKind::Response as u8);
        assert!(buf[5..].starts_with(REQ_ID.as_bytes()));
    }

    #[test]
    fn test_decode_incomplete() {
        let encoded = encode(Message::HttpRequest(HttpRequest::new(
            REQ_ID.to_string(),
            "GET".to_string(),
            "/".to_string(),
        )));
        let mut codec = TunnelCodec::default();

        // Only provide part of the header, then part of the payload
        let mut buf = BytesMut::from(&encoded[..3]);
        assert_eq!(codec.decode(&mut buf).unwrap(), None);
        buf.extend_from_slice(&encoded[3..10]);
        assert_eq!(codec.decode(&mut buf).unwrap(), None);

        // Provide rest of message
        buf.extend_from_slice(&encoded[10..]);
        let frame = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(frame.kind, FrameKind::Request);
        assert!(buf.is_empty());
    }

    #[test]
    fn test_decode_back_to_back_frames() {
        let mut request =
            HttpRequest::new(REQ_ID.to_string(), "POST".to_string(), "/a".to_string());
        request.body = Bytes::from_static(b"\n\nbody\n");
        let first = Message::HttpRequest(request);
        let second = Message::HttpResponse {
            request_id: REQ_ID.to_string(),
            response: HttpResponse::new(200).with_text_body("ok"),
        };

        let mut buf = encode(first.clone());
        buf.extend_from_slice(&encode(second.clone()));

        let mut codec = TunnelCodec::default();
        let a = codec.decode(&mut buf).unwrap().unwrap();
        let b = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(codec.decode(&mut buf).unwrap(), None);

        assert_eq!(Message::try_from(a).unwrap(), first);
        assert_eq!(Message::try_from(b).unwrap(), second);
    }

    #[test]
    fn test_decode_rejects_oversized_frame() {
        let mut codec = TunnelCodec::new(16);
        let mut buf = BytesMut::new();
        buf.put_u32(17);
        buf.put_u8(FrameKind::Response as u8);

        let err = codec.decode(&mut buf).unwrap_err();
        assert!(matches!(err, TunnelError::FrameTooLarge(17, 16)));
        assert!(err.is_fatal());
    }

    #[test]
    fn test_encode_rejects_oversized_frame() {
        let mut codec = TunnelCodec::new(8);
        let mut buf = BytesMut::new();
        let frame = Frame::new(FrameKind::Response, vec![0u8; 8]);

        assert!(matches!(
            codec.encode(frame, &mut buf),
            Err(TunnelError::FrameTooLarge(9, 8))
        ));
        assert!(buf.is_empty());
    }

    #[test]
    fn test_decode_rejects_unknown_kind_and_empty_frame() {
        let mut codec = TunnelCodec::default();

        let mut buf = BytesMut::new();
        buf.put_u32(1);
        buf.put_u8(0x42);
        assert!(matches!(
            codec.decode(&mut buf),
            Err(TunnelError::UnknownFrameKind(0x42))
        ));

        let mut buf = BytesMut::new();
        buf.put_u32(0);
        assert!(codec.decode(&mut buf).unwrap_err().is_fatal());
    }
}
