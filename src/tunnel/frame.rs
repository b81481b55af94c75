//! Frame encoding/decoding for the tunnel protocol
//!
//! Every frame carries one HTTP exchange message. Frame format (all integers
//! big endian, strings UTF-8):
//! ```text
//! +--------+--------+--------+--------+
//! |           Length (4B)             |   bytes that follow
//! +--------+--------+--------+--------+
//! |  Kind  |      Correlation ID (8B) ...
//! +--------+--------+--------+--------+
//! |   Status (2B)   |
//! +--------+--------+--------+--------+
//! | Method len (4B) | Method          |
//! | Path len (4B)   | Path            |
//! | Header count (4B)                 |
//! |   Name len (4B) | Name            |   repeated per header,
//! |   Value len (4B)| Value           |   in original order
//! | Body len (4B)   | Body            |
//! +--------+--------+--------+--------+
//! ```
//! Request frames use method/path/headers/body, Response frames use
//! status/headers/body, Error frames carry their message in the body.

use super::TunnelError;
use crate::MAX_FRAME_SIZE;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use http::header::{HeaderName, HeaderValue};
use http::{HeaderMap, Method, StatusCode};

/// Size of the length prefix in bytes
pub const FRAME_LENGTH_SIZE: usize = 4;

/// Ordered multi-value header list
pub type Headers = Vec<(String, String)>;

/// Frame kinds
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum FrameKind {
    /// HTTP request to be handled by the peer
    Request = 0x01,
    /// HTTP response to an earlier request
    Response = 0x02,
    /// Peer failed to produce a response
    Error = 0x03,
}

impl TryFrom<u8> for FrameKind {
    type Error = TunnelError;

    fn try_from(value: u8) -> Result<Self, TunnelError> {
        match value {
            0x01 => Ok(FrameKind::Request),
            0x02 => Ok(FrameKind::Response),
            0x03 => Ok(FrameKind::Error),
            _ => Err(TunnelError::InvalidFrame(format!(
                "Unknown frame kind: {}",
                value
            ))),
        }
    }
}

/// A protocol frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    /// Correlation ID, chosen by the side that sent the request
    pub id: u64,
    /// Frame kind
    pub kind: FrameKind,
    /// Request method (empty for other kinds)
    pub method: String,
    /// Request path and query (empty for other kinds)
    pub path: String,
    /// Response status (0 for other kinds)
    pub status: u16,
    /// Headers in wire order, repeated names allowed
    pub headers: Headers,
    /// Opaque body; the failure message for Error frames
    pub body: Bytes,
}

impl Frame {
    /// Create a request frame
    pub fn request(
        id: u64,
        method: impl Into<String>,
        path: impl Into<String>,
        headers: Headers,
        body: Bytes,
    ) -> Self {
        Self {
            id,
            kind: FrameKind::Request,
            method: method.into(),
            path: path.into(),
            status: 0,
            headers,
            body,
        }
    }

    /// Create a response frame
    pub fn response(id: u64, status: u16, headers: Headers, body: Bytes) -> Self {
        Self {
            id,
            kind: FrameKind::Response,
            method: String::new(),
            path: String::new(),
            status,
            headers,
            body,
        }
    }

    /// Create an error frame
    pub fn error(id: u64, message: impl Into<String>) -> Self {
        Self {
            id,
            kind: FrameKind::Error,
            method: String::new(),
            path: String::new(),
            status: 0,
            headers: Vec::new(),
            body: Bytes::from(message.into()),
        }
    }

    /// Build a request frame from an HTTP request.
    ///
    /// The body is shared, not consumed, so the caller's request stays usable.
    pub fn from_request(id: u64, request: &http::Request<Bytes>) -> Self {
        let path = request
            .uri()
            .path_and_query()
            .map(|pq| pq.as_str().to_string())
            .unwrap_or_else(|| "/".to_string());

        Self::request(
            id,
            request.method().as_str(),
            path,
            headers_from_map(request.headers()),
            request.body().clone(),
        )
    }

    /// Build a response frame from an HTTP response
    pub fn from_response(id: u64, response: http::Response<Bytes>) -> Self {
        let (parts, body) = response.into_parts();
        Self::response(id, parts.status.as_u16(), headers_from_map(&parts.headers), body)
    }

    /// Convert a request frame back into an HTTP request
    pub fn into_request(self) -> Result<http::Request<Bytes>, TunnelError> {
        if self.kind != FrameKind::Request {
            return Err(TunnelError::InvalidFrame(format!(
                "Expected request frame, got {:?}",
                self.kind
            )));
        }

        let method = Method::from_bytes(self.method.as_bytes())
            .map_err(|_| TunnelError::InvalidFrame(format!("Invalid method: {}", self.method)))?;

        let mut request = http::Request::builder()
            .method(method)
            .uri(self.path.as_str())
            .body(self.body)
            .map_err(|e| TunnelError::InvalidFrame(e.to_string()))?;

        *request.headers_mut() = headers_to_map(&self.headers)?;
        Ok(request)
    }

    /// Convert a response frame back into an HTTP response
    pub fn into_response(self) -> Result<http::Response<Bytes>, TunnelError> {
        if self.kind != FrameKind::Response {
            return Err(TunnelError::InvalidFrame(format!(
                "Expected response frame, got {:?}",
                self.kind
            )));
        }

        let status = StatusCode::from_u16(self.status)
            .map_err(|_| TunnelError::InvalidFrame(format!("Invalid status: {}", self.status)))?;

        let mut response = http::Response::new(self.body);
        *response.status_mut() = status;
        *response.headers_mut() = headers_to_map(&self.headers)?;
        Ok(response)
    }

    /// Message carried by an Error frame
    pub fn error_message(&self) -> Option<String> {
        match self.kind {
            FrameKind::Error => Some(String::from_utf8_lossy(&self.body).into_owned()),
            _ => None,
        }
    }

    /// Whether this frame ends an exchange
    pub fn is_terminal(&self) -> bool {
        matches!(self.kind, FrameKind::Response | FrameKind::Error)
    }

    /// Get the total encoded size of this frame, including the length prefix
    pub fn encoded_size(&self) -> usize {
        let headers: usize = self
            .headers
            .iter()
            .map(|(name, value)| 8 + name.len() + value.len())
            .sum();

        FRAME_LENGTH_SIZE
            + 1 // kind
            + 8 // id
            + 2 // status
            + 4 + self.method.len()
            + 4 + self.path.len()
            + 4 + headers
            + 4 + self.body.len()
    }

    /// Encode frame to bytes
    pub fn encode(&self) -> Result<BytesMut, TunnelError> {
        let total_len = self.encoded_size();
        if total_len > MAX_FRAME_SIZE {
            return Err(TunnelError::FrameTooLarge(total_len, MAX_FRAME_SIZE));
        }

        let mut buf = BytesMut::with_capacity(total_len);

        buf.put_u32((total_len - FRAME_LENGTH_SIZE) as u32);
        buf.put_u8(self.kind as u8);
        buf.put_u64(self.id);
        buf.put_u16(self.status);
        put_bytes(&mut buf, self.method.as_bytes());
        put_bytes(&mut buf, self.path.as_bytes());

        buf.put_u32(self.headers.len() as u32);
        for (name, value) in &self.headers {
            put_bytes(&mut buf, name.as_bytes());
            put_bytes(&mut buf, value.as_bytes());
        }

        put_bytes(&mut buf, &self.body);

        Ok(buf)
    }

    /// Decode one frame from a stream buffer.
    ///
    /// Returns `Ok(None)` until the buffer holds a complete frame; the
    /// consumed bytes are removed from `buf`.
    pub fn decode(buf: &mut BytesMut) -> Result<Option<Self>, TunnelError> {
        if buf.len() < FRAME_LENGTH_SIZE {
            return Ok(None);
        }

        let payload_len = u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]) as usize;
        let total_len = FRAME_LENGTH_SIZE + payload_len;

        if total_len > MAX_FRAME_SIZE {
            return Err(TunnelError::FrameTooLarge(total_len, MAX_FRAME_SIZE));
        }

        if buf.len() < total_len {
            buf.reserve(total_len - buf.len());
            return Ok(None);
        }

        buf.advance(FRAME_LENGTH_SIZE);
        let payload = buf.split_to(payload_len).freeze();

        Self::decode_payload(payload).map(Some)
    }

    /// Decode a single complete encoded frame
    pub fn from_bytes(data: &[u8]) -> Result<Self, TunnelError> {
        let mut buf = BytesMut::from(data);
        let frame = Self::decode(&mut buf)?
            .ok_or_else(|| TunnelError::InvalidFrame("Truncated frame".to_string()))?;

        if !buf.is_empty() {
            return Err(TunnelError::InvalidFrame(format!(
                "{} trailing bytes after frame",
                buf.len()
            )));
        }
        Ok(frame)
    }

    fn decode_payload(mut payload: Bytes) -> Result<Self, TunnelError> {
        ensure_remaining(&payload, 1 + 8 + 2, "header")?;
        let kind = FrameKind::try_from(payload.get_u8())?;
        let id = payload.get_u64();
        let status = payload.get_u16();

        let method = take_string(&mut payload, "method")?;
        let path = take_string(&mut payload, "path")?;

        ensure_remaining(&payload, 4, "header count")?;
        let count = payload.get_u32() as usize;
        // Each header needs at least its two length fields
        if count > payload.remaining() / 8 {
            return Err(TunnelError::InvalidFrame(format!(
                "Header count {} exceeds frame size",
                count
            )));
        }

        let mut headers = Vec::with_capacity(count);
        for _ in 0..count {
            let name = take_string(&mut payload, "header name")?;
            if name.is_empty() {
                return Err(TunnelError::InvalidFrame("Empty header name".to_string()));
            }
            let value = take_string(&mut payload, "header value")?;
            headers.push((name, value));
        }

        let body = take_bytes(&mut payload, "body")?;

        if payload.has_remaining() {
            return Err(TunnelError::InvalidFrame(format!(
                "{} unexpected bytes after body",
                payload.remaining()
            )));
        }

        if kind == FrameKind::Request && method.is_empty() {
            return Err(TunnelError::InvalidFrame("Request without method".to_string()));
        }

        Ok(Self {
            id,
            kind,
            method,
            path,
            status,
            headers,
            body,
        })
    }
}

fn put_bytes(buf: &mut BytesMut, data: &[u8]) {
    buf.put_u32(data.len() as u32);
    buf.extend_from_slice(data);
}

fn ensure_remaining(buf: &Bytes, needed: usize, field: &str) -> Result<(), TunnelError> {
    if buf.remaining() < needed {
        return Err(TunnelError::InvalidFrame(format!("Truncated {}", field)));
    }
    Ok(())
}

fn take_bytes(buf: &mut Bytes, field: &str) -> Result<Bytes, TunnelError> {
    ensure_remaining(buf, 4, field)?;
    let len = buf.get_u32() as usize;
    ensure_remaining(buf, len, field)?;
    Ok(buf.split_to(len))
}

fn take_string(buf: &mut Bytes, field: &str) -> Result<String, TunnelError> {
    let raw = take_bytes(buf, field)?;
    String::from_utf8(raw.to_vec())
        .map_err(|_| TunnelError::InvalidFrame(format!("Invalid UTF-8 in {}", field)))
}

fn headers_from_map(map: &HeaderMap) -> Headers {
    map.iter()
        .map(|(name, value)| {
            (
                name.as_str().to_string(),
                String::from_utf8_lossy(value.as_bytes()).into_owned(),
            )
        })
        .collect()
}

fn headers_to_map(headers: &Headers) -> Result<HeaderMap, TunnelError> {
    let mut map = HeaderMap::with_capacity(headers.len());
    for (name, value) in headers {
        let name = HeaderName::from_bytes(name.as_bytes())
            .map_err(|_| TunnelError::InvalidFrame(format!("Invalid header name: {}", name)))?;
        let value = HeaderValue::from_bytes(value.as_bytes())
            .map_err(|_| TunnelError::InvalidFrame(format!("Invalid value for header {}", name)))?;
        map.append(name, value);
    }
    Ok(map)
}
