//! Streaming HTTP/1.x decoders.
//!
//! # Responsibilities
//! - Parse request and response heads with `httparse`
//! - Frame bodies (Content-Length, chunked, close-delimited)
//! - Emit body bytes raw, as they appeared on the wire, so a relay can
//!   forward them without re-encoding
//!
//! # Design Decisions
//! - Decoders are `tokio_util::codec::Decoder`s driven by `FramedRead`
//! - Every message ends with an explicit `End` event, including bodiless ones
//! - A close-delimited response body ends on EOF with `End { by_close: true }`

use bytes::{Buf, Bytes, BytesMut};
use http::header::{HeaderMap, HeaderName, HeaderValue};
use http::{Method, StatusCode, Version};
use tokio_util::codec::Decoder;

use crate::http::message::{content_length, BodyKind, RequestHead, ResponseHead};

/// Upper bound for a request line or status line plus headers.
pub const MAX_HEAD_BYTES: usize = 8192 + 16384;
const MAX_HEADERS: usize = 100;
const MAX_CHUNK_LINE: usize = 4096;

/// Error type for HTTP framing.
#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("malformed message head: {0}")]
    Parse(#[from] httparse::Error),
    #[error("message head exceeds {0} bytes")]
    HeadTooLarge(usize),
    #[error("invalid {0}")]
    Invalid(&'static str),
    #[error("invalid chunked framing")]
    InvalidChunk,
    #[error("connection closed in the middle of a message")]
    UnexpectedEof,
}

/// Events produced by [`RequestDecoder`].
#[derive(Debug)]
pub enum RequestEvent {
    Head(RequestHead),
    /// Raw body bytes including any chunk framing.
    Body(Bytes),
    End,
}

/// Events produced by [`ResponseDecoder`].
#[derive(Debug)]
pub enum ResponseEvent {
    Head(ResponseHead),
    /// Raw body bytes including any chunk framing.
    Body(Bytes),
    /// The response is complete. `by_close` is set when only the peer closing
    /// the connection delimited it.
    End { by_close: bool },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ChunkState {
    Size,
    Data(u64),
    DataEnd,
    Trailer,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BodyState {
    Length(u64),
    Chunked(ChunkState),
    UntilClose,
}

impl BodyState {
    fn for_kind(kind: BodyKind) -> Option<Self> {
        match kind {
            BodyKind::None | BodyKind::Length(0) => None,
            BodyKind::Length(n) => Some(BodyState::Length(n)),
            BodyKind::Chunked => Some(BodyState::Chunked(ChunkState::Size)),
            BodyKind::CloseDelimited => Some(BodyState::UntilClose),
        }
    }

    /// Consume as much framed body as `src` holds. Returns the consumed raw
    /// bytes and whether the body is now complete.
    fn advance(&mut self, src: &mut BytesMut) -> Result<(Bytes, bool), CodecError> {
        let mut pos = 0;
        let done = loop {
            let available = src.len() - pos;
            match *self {
                BodyState::UntilClose => {
                    pos = src.len();
                    break false;
                }
                BodyState::Length(remaining) => {
                    let take = remaining.min(available as u64);
                    pos += take as usize;
                    *self = BodyState::Length(remaining - take);
                    break remaining == take;
                }
                BodyState::Chunked(ChunkState::Size) => {
                    let Some(end) = find_crlf(&src[pos..]) else {
                        if available > MAX_CHUNK_LINE {
                            return Err(CodecError::InvalidChunk);
                        }
                        break false;
                    };
                    let size = parse_chunk_size(&src[pos..pos + end])?;
                    pos += end + 2;
                    *self = BodyState::Chunked(if size == 0 {
                        ChunkState::Trailer
                    } else {
                        ChunkState::Data(size)
                    });
                }
                BodyState::Chunked(ChunkState::Data(remaining)) => {
                    if available == 0 {
                        break false;
                    }
                    let take = remaining.min(available as u64);
                    pos += take as usize;
                    *self = BodyState::Chunked(if take == remaining {
                        ChunkState::DataEnd
                    } else {
                        ChunkState::Data(remaining - take)
                    });
                }
                BodyState::Chunked(ChunkState::DataEnd) => {
                    if available < 2 {
                        break false;
                    }
                    if &src[pos..pos + 2] != b"\r\n" {
                        return Err(CodecError::InvalidChunk);
                    }
                    pos += 2;
                    *self = BodyState::Chunked(ChunkState::Size);
                }
                BodyState::Chunked(ChunkState::Trailer) => {
                    let Some(end) = find_crlf(&src[pos..]) else {
                        if available > MAX_CHUNK_LINE {
                            return Err(CodecError::InvalidChunk);
                        }
                        break false;
                    };
                    pos += end + 2;
                    if end == 0 {
                        break true;
                    }
                }
            }
        };
        Ok((src.split_to(pos).freeze(), done))
    }
}

/// Decoder for the client side of a connection.
#[derive(Debug, Default)]
pub struct RequestDecoder {
    body: Option<BodyState>,
    ending: bool,
}

impl Decoder for RequestDecoder {
    type Item = RequestEvent;
    type Error = CodecError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<RequestEvent>, CodecError> {
        if self.ending {
            self.ending = false;
            return Ok(Some(RequestEvent::End));
        }

        if let Some(state) = self.body.as_mut() {
            let (bytes, done) = state.advance(src)?;
            if done {
                self.body = None;
                if bytes.is_empty() {
                    return Ok(Some(RequestEvent::End));
                }
                self.ending = true;
                return Ok(Some(RequestEvent::Body(bytes)));
            }
            if bytes.is_empty() {
                return Ok(None);
            }
            return Ok(Some(RequestEvent::Body(bytes)));
        }

        let Some(head) = parse_request_head(src)? else {
            return Ok(None);
        };
        self.body = BodyState::for_kind(head.body_kind());
        self.ending = self.body.is_none();
        Ok(Some(RequestEvent::Head(head)))
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<RequestEvent>, CodecError> {
        match self.decode(src)? {
            Some(event) => Ok(Some(event)),
            None if src.is_empty() && self.body.is_none() => Ok(None),
            None => Err(CodecError::UnexpectedEof),
        }
    }
}

/// Decoder for the upstream side of a connection.
///
/// Response framing depends on the request method, so the relay announces
/// each request with [`ResponseDecoder::expect_response_to`] before reading.
#[derive(Debug)]
pub struct ResponseDecoder {
    request_method: Method,
    body: Option<BodyState>,
    ending: Option<bool>,
}

impl Default for ResponseDecoder {
    fn default() -> Self {
        Self::new(Method::GET)
    }
}

impl ResponseDecoder {
    pub fn new(request_method: Method) -> Self {
        Self {
            request_method,
            body: None,
            ending: None,
        }
    }

    pub fn expect_response_to(&mut self, method: Method) {
        self.request_method = method;
    }
}

impl Decoder for ResponseDecoder {
    type Item = ResponseEvent;
    type Error = CodecError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<ResponseEvent>, CodecError> {
        if let Some(by_close) = self.ending.take() {
            return Ok(Some(ResponseEvent::End { by_close }));
        }

        if let Some(state) = self.body.as_mut() {
            let (bytes, done) = state.advance(src)?;
            if done {
                self.body = None;
                if bytes.is_empty() {
                    return Ok(Some(ResponseEvent::End { by_close: false }));
                }
                self.ending = Some(false);
                return Ok(Some(ResponseEvent::Body(bytes)));
            }
            if bytes.is_empty() {
                return Ok(None);
            }
            return Ok(Some(ResponseEvent::Body(bytes)));
        }

        let Some(head) = parse_response_head(src)? else {
            return Ok(None);
        };
        if !head.is_interim() {
            self.body = BodyState::for_kind(head.body_kind(&self.request_method));
            if self.body.is_none() {
                self.ending = Some(false);
            }
        }
        Ok(Some(ResponseEvent::Head(head)))
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<ResponseEvent>, CodecError> {
        if self.body == Some(BodyState::UntilClose) {
            if !src.is_empty() {
                return Ok(Some(ResponseEvent::Body(src.split().freeze())));
            }
            self.body = None;
            return Ok(Some(ResponseEvent::End { by_close: true }));
        }
        match self.decode(src)? {
            Some(event) => Ok(Some(event)),
            None if src.is_empty() && self.body.is_none() => Ok(None),
            None => Err(CodecError::UnexpectedEof),
        }
    }
}

/// Strip chunk framing from a complete chunked body, dropping any trailers.
pub fn decode_chunked(raw: &[u8]) -> Result<Bytes, CodecError> {
    let mut out = BytesMut::with_capacity(raw.len());
    let mut pos = 0;
    loop {
        let end = find_crlf(&raw[pos..]).ok_or(CodecError::InvalidChunk)?;
        let size = parse_chunk_size(&raw[pos..pos + end])? as usize;
        pos += end + 2;
        if size == 0 {
            return Ok(out.freeze());
        }
        if raw.len() < pos + size + 2 || &raw[pos + size..pos + size + 2] != b"\r\n" {
            return Err(CodecError::InvalidChunk);
        }
        out.extend_from_slice(&raw[pos..pos + size]);
        pos += size + 2;
    }
}

fn find_crlf(buf: &[u8]) -> Option<usize> {
    buf.windows(2).position(|w| w == b"\r\n")
}

fn parse_chunk_size(line: &[u8]) -> Result<u64, CodecError> {
    let line = std::str::from_utf8(line).map_err(|_| CodecError::InvalidChunk)?;
    let size = line.split(';').next().unwrap_or("").trim();
    u64::from_str_radix(size, 16).map_err(|_| CodecError::InvalidChunk)
}

fn parse_request_head(src: &mut BytesMut) -> Result<Option<RequestHead>, CodecError> {
    let (head, len) = {
        let mut headers = [httparse::EMPTY_HEADER; MAX_HEADERS];
        let mut req = httparse::Request::new(&mut headers);
        let len = match req.parse(src)? {
            httparse::Status::Complete(len) => len,
            httparse::Status::Partial => return partial(src),
        };
        let method = Method::from_bytes(req.method.unwrap_or_default().as_bytes())
            .map_err(|_| CodecError::Invalid("method"))?;
        let head = RequestHead {
            method,
            target: req.path.unwrap_or("/").to_string(),
            version: version_from(req.version),
            headers: header_map(req.headers)?,
        };
        (head, len)
    };
    if content_length(&head.headers).is_err() {
        return Err(CodecError::Invalid("content-length"));
    }
    src.advance(len);
    Ok(Some(head))
}

fn parse_response_head(src: &mut BytesMut) -> Result<Option<ResponseHead>, CodecError> {
    let (head, len) = {
        let mut headers = [httparse::EMPTY_HEADER; MAX_HEADERS];
        let mut resp = httparse::Response::new(&mut headers);
        let len = match resp.parse(src)? {
            httparse::Status::Complete(len) => len,
            httparse::Status::Partial => return partial(src),
        };
        let status = StatusCode::from_u16(resp.code.unwrap_or_default())
            .map_err(|_| CodecError::Invalid("status code"))?;
        let head = ResponseHead {
            version: version_from(resp.version),
            status,
            reason: resp.reason.unwrap_or("").to_string(),
            headers: header_map(resp.headers)?,
        };
        (head, len)
    };
    if content_length(&head.headers).is_err() {
        return Err(CodecError::Invalid("content-length"));
    }
    src.advance(len);
    Ok(Some(head))
}

fn partial<T>(src: &BytesMut) -> Result<Option<T>, CodecError> {
    if src.len() > MAX_HEAD_BYTES {
        return Err(CodecError::HeadTooLarge(MAX_HEAD_BYTES));
    }
    Ok(None)
}

fn version_from(minor: Option<u8>) -> Version {
    match minor {
        Some(0) => Version::HTTP_10,
        _ => Version::HTTP_11,
    }
}

fn header_map(raw: &[httparse::Header<'_>]) -> Result<HeaderMap, CodecError> {
    let mut map = HeaderMap::with_capacity(raw.len());
    for h in raw {
        let name = HeaderName::from_bytes(h.name.as_bytes()).map_err(|_| CodecError::Invalid("header name"))?;
        let value = HeaderValue::from_bytes(h.value).map_err(|_| CodecError::Invalid("header value"))?;
        map.append(name, value);
    }
    Ok(map)
}
