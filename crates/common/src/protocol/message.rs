use bytes::Bytes;

use super::{HttpRequest, HttpResponse};
use crate::error::{Result, TunnelError};
use crate::models::SessionInfo;

/// Frame kind byte following the length prefix
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum FrameKind {
    /// Broker -> agent: session identity and public URL
    SessionEstablished = 0x01,
    /// Broker -> agent: forwarded HTTP request
    Request = 0x02,
    /// Agent -> broker: answer to a forwarded request
    Response = 0x03,
}

impl TryFrom<u8> for FrameKind {
    type Error = TunnelError;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            0x01 => Ok(FrameKind::SessionEstablished),
            0x02 => Ok(FrameKind::Request),
            0x03 => Ok(FrameKind::Response),
            _ => Err(TunnelError::UnknownFrameKind(value)),
        }
    }
}

/// A structurally valid frame whose payload has not been interpreted yet
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub kind: FrameKind,
    pub payload: Bytes,
}

impl Frame {
    pub fn new(kind: FrameKind, payload: impl Into<Bytes>) -> Self {
        Self {
            kind,
            payload: payload.into(),
        }
    }
}

/// Every message exchanged over a tunnel connection
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    /// Connection lifecycle
    SessionEstablished(SessionInfo),

    /// Data plane messages
    HttpRequest(HttpRequest),
    HttpResponse {
        request_id: String,
        response: HttpResponse,
    },
}

impl Message {
    pub fn kind(&self) -> FrameKind {
        match self {
            Message::SessionEstablished(_) => FrameKind::SessionEstablished,
            Message::HttpRequest(_) => FrameKind::Request,
            Message::HttpResponse { .. } => FrameKind::Response,
        }
    }

    /// Serialize the message into a frame
    pub fn into_frame(self) -> Result<Frame> {
        let kind = self.kind();
        let payload: Bytes = match self {
            Message::SessionEstablished(info) => serde_json::to_vec(&info)?.into(),
            Message::HttpRequest(request) => request.encode_payload(),
            Message::HttpResponse {
                request_id,
                response,
            } => response.encode_payload(&request_id)?.into(),
        };
        Ok(Frame::new(kind, payload))
    }
}

impl TryFrom<Frame> for Message {
    type Error = TunnelError;

    /// Interpret a frame payload. Failures here are malformed payloads,
    /// which never invalidate the framing of the connection itself.
    fn try_from(frame: Frame) -> Result<Self> {
        match frame.kind {
            FrameKind::SessionEstablished => Ok(Message::SessionEstablished(
                serde_json::from_slice(&frame.payload)?,
            )),
            FrameKind::Request => Ok(Message::HttpRequest(HttpRequest::parse_payload(
                &frame.payload,
            )?)),
            FrameKind::Response => {
                let (request_id, response) = HttpResponse::parse_payload(&frame.payload)?;
                Ok(Message::HttpResponse {
                    request_id,
                    response,
                })
            }
        }
    }
}
