use bytes::{Buf, Bytes, BytesMut};
use http::StatusCode;
use tracing::{debug, trace};

use crate::types::Headers;

/// Hard cap on the response head (and on any single trailer section).
const MAX_HEAD_BYTES: usize = 64 * 1024;

/// How many headers we hand httparse room for.
const MAX_HEADERS: usize = 100;

/// Everything we learned from the origin's status line and headers.
#[derive(Debug)]
pub struct ResponseHead {
    pub status: StatusCode,
    /// (major, minor): the 'b' in `HTTP/1.b`, with major pinned to 1.
    pub version: (u8, u8),
    /// Wire order, name case preserved.
    pub headers: Headers,
    pub chunked: bool,
    /// Derived from `connection` / `proxy-connection` tokens, the HTTP/1.0
    /// default, or an EOF-delimited body.
    pub connection_close: bool,
    pub content_length: Option<u64>,
}

#[derive(Debug)]
pub enum ResponseEvent {
    HeaderComplete(ResponseHead),
    Body(Bytes),
    MsgComplete,
}

#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum ParseError {
    #[error("malformed response head: {0}")]
    BadHead(httparse::Error),

    #[error("response head exceeds {limit} bytes")]
    HeadTooLarge { limit: usize },

    #[error("unknown status code {0}")]
    BadStatus(u16),

    #[error("invalid content-length value")]
    BadContentLength,

    #[error("invalid chunk framing")]
    BadChunk,

    #[error("origin sent data after the end of the message")]
    UnexpectedData,

    #[error("parser already failed")]
    Failed,
}

#[derive(Debug, Clone, Copy)]
enum ChunkState {
    Size,
    Data { left: u64 },
    DataEnd,
    Trailer,
}

#[derive(Debug)]
enum BodyFraming {
    ContentLength { left: u64 },
    Chunked(ChunkState),
    UntilEof,
}

#[derive(Debug, Default)]
enum State {
    Head,
    Body(BodyFraming),
    Done,
    Failed,

    // only observable while an arm below is mid-swap
    #[default]
    Transition,
}

/// Incremental HTTP/1.1 response parser.
///
/// Feed it whatever the origin socket produced; it buffers partial heads
/// and chunk framing internally and hands back complete events. Message
/// completion is only ever signalled by framing; an EOF-delimited body is
/// the caller's call to make when the socket closes.
pub struct ResponseParser {
    state: State,
    buf: BytesMut,
    /// The request was HEAD: the response has a head and no body.
    head_only: bool,
}

impl ResponseParser {
    pub fn new(head_only: bool) -> Self {
        Self {
            state: State::Head,
            buf: BytesMut::new(),
            head_only,
        }
    }

    /// True once the current message is fully parsed.
    pub fn is_complete(&self) -> bool {
        matches!(self.state, State::Done)
    }

    pub fn feed(&mut self, input: &[u8]) -> Result<Vec<ResponseEvent>, ParseError> {
        let mut events = Vec::new();
        if !input.is_empty() {
            self.buf.extend_from_slice(input);
        }

        loop {
            match std::mem::take(&mut self.state) {
                State::Head => {
                    let (head_len, mut head) = match self.parse_head() {
                        Ok(Some(parsed)) => parsed,
                        Ok(None) => {
                            if self.buf.len() > MAX_HEAD_BYTES {
                                self.state = State::Failed;
                                return Err(ParseError::HeadTooLarge {
                                    limit: MAX_HEAD_BYTES,
                                });
                            }
                            self.state = State::Head;
                            return Ok(events);
                        }
                        Err(err) => {
                            self.state = State::Failed;
                            return Err(err);
                        }
                    };
                    self.buf.advance(head_len);

                    if head.status.is_informational() {
                        // interim response; the real one follows
                        debug!(status = %head.status, "skipping informational response");
                        self.state = State::Head;
                        continue;
                    }

                    match self.pick_framing(&head) {
                        None => {
                            events.push(ResponseEvent::HeaderComplete(head));
                            events.push(ResponseEvent::MsgComplete);
                            self.state = State::Done;
                        }
                        Some(framing) => {
                            if matches!(framing, BodyFraming::UntilEof) {
                                // an unframed body can only end with the
                                // connection
                                head.connection_close = true;
                            }
                            trace!(?framing, "response body framing");
                            events.push(ResponseEvent::HeaderComplete(head));
                            self.state = State::Body(framing);
                        }
                    }
                }

                State::Body(BodyFraming::ContentLength { mut left }) => {
                    if self.buf.is_empty() {
                        self.state = State::Body(BodyFraming::ContentLength { left });
                        return Ok(events);
                    }
                    let n = (self.buf.len() as u64).min(left) as usize;
                    left -= n as u64;
                    events.push(ResponseEvent::Body(self.buf.split_to(n).freeze()));
                    if left == 0 {
                        events.push(ResponseEvent::MsgComplete);
                        self.state = State::Done;
                    } else {
                        self.state = State::Body(BodyFraming::ContentLength { left });
                        return Ok(events);
                    }
                }

                State::Body(BodyFraming::UntilEof) => {
                    if !self.buf.is_empty() {
                        events.push(ResponseEvent::Body(self.buf.split().freeze()));
                    }
                    self.state = State::Body(BodyFraming::UntilEof);
                    return Ok(events);
                }

                State::Body(BodyFraming::Chunked(chunk_state)) => {
                    match self.advance_chunked(chunk_state, &mut events)? {
                        // reached the final CRLF; loop to catch trailing junk
                        true => self.state = State::Done,
                        false => return Ok(events),
                    }
                }

                State::Done => {
                    if self.buf.is_empty() {
                        self.state = State::Done;
                        return Ok(events);
                    }
                    self.state = State::Failed;
                    if events.is_empty() {
                        return Err(ParseError::UnexpectedData);
                    }
                    // surface the complete message now; the trailing junk
                    // fails the next feed
                    self.buf.clear();
                    return Ok(events);
                }

                State::Failed => {
                    self.state = State::Failed;
                    return Err(ParseError::Failed);
                }

                State::Transition => unreachable!("parser state left in transition"),
            }
        }
    }

    /// `Ok(None)` means the head is still incomplete.
    fn parse_head(&self) -> Result<Option<(usize, ResponseHead)>, ParseError> {
        let mut storage = [httparse::EMPTY_HEADER; MAX_HEADERS];
        let mut resp = httparse::Response::new(&mut storage);
        let head_len = match resp.parse(&self.buf) {
            Ok(httparse::Status::Complete(len)) => len,
            Ok(httparse::Status::Partial) => return Ok(None),
            Err(err) => return Err(ParseError::BadHead(err)),
        };

        let code = resp.code.unwrap_or_default();
        let status = StatusCode::from_u16(code).map_err(|_| ParseError::BadStatus(code))?;
        let minor = resp.version.unwrap_or(1);

        let mut headers = Headers::new();
        let mut chunked = false;
        let mut content_length = None;
        let mut saw_close = false;
        let mut saw_keep_alive = false;
        for h in resp.headers.iter() {
            let name = h.name.as_bytes();
            if name.eq_ignore_ascii_case(b"transfer-encoding") && value_has_token(h.value, b"chunked")
            {
                chunked = true;
            } else if name.eq_ignore_ascii_case(b"content-length") && content_length.is_none() {
                let value = std::str::from_utf8(h.value)
                    .ok()
                    .and_then(|s| s.trim().parse::<u64>().ok())
                    .ok_or(ParseError::BadContentLength)?;
                content_length = Some(value);
            } else if name.eq_ignore_ascii_case(b"connection")
                || name.eq_ignore_ascii_case(b"proxy-connection")
            {
                saw_close |= value_has_token(h.value, b"close");
                saw_keep_alive |= value_has_token(h.value, b"keep-alive");
            }
            headers.push(
                Bytes::copy_from_slice(name),
                Bytes::copy_from_slice(h.value),
            );
        }

        let connection_close = saw_close || (minor == 0 && !saw_keep_alive);
        Ok(Some((
            head_len,
            ResponseHead {
                status,
                version: (1, minor),
                headers,
                chunked,
                connection_close,
                content_length,
            },
        )))
    }

    /// Decides body framing; `None` means the message ends with the head.
    fn pick_framing(&self, head: &ResponseHead) -> Option<BodyFraming> {
        if self.head_only
            || head.status == StatusCode::NO_CONTENT
            || head.status == StatusCode::NOT_MODIFIED
        {
            return None;
        }
        if head.chunked {
            return Some(BodyFraming::Chunked(ChunkState::Size));
        }
        match head.content_length {
            Some(0) => None,
            Some(n) => Some(BodyFraming::ContentLength { left: n }),
            None => Some(BodyFraming::UntilEof),
        }
    }

    /// Runs the chunked machine as far as the buffer allows. Returns true
    /// once the terminating chunk and its trailer section are consumed; on
    /// false, the state has been parked and the caller should return.
    fn advance_chunked(
        &mut self,
        start: ChunkState,
        events: &mut Vec<ResponseEvent>,
    ) -> Result<bool, ParseError> {
        let mut cs = start;
        loop {
            match cs {
                ChunkState::Size => {
                    if self.buf.is_empty() {
                        self.state = State::Body(BodyFraming::Chunked(cs));
                        return Ok(false);
                    }
                    match httparse::parse_chunk_size(&self.buf) {
                        Ok(httparse::Status::Complete((idx, size))) => {
                            self.buf.advance(idx);
                            cs = if size == 0 {
                                ChunkState::Trailer
                            } else {
                                ChunkState::Data { left: size }
                            };
                        }
                        Ok(httparse::Status::Partial) => {
                            self.state = State::Body(BodyFraming::Chunked(cs));
                            return Ok(false);
                        }
                        Err(_) => {
                            self.state = State::Failed;
                            return Err(ParseError::BadChunk);
                        }
                    }
                }

                ChunkState::Data { left } => {
                    if self.buf.is_empty() {
                        self.state = State::Body(BodyFraming::Chunked(cs));
                        return Ok(false);
                    }
                    let n = (self.buf.len() as u64).min(left) as usize;
                    events.push(ResponseEvent::Body(self.buf.split_to(n).freeze()));
                    let left = left - n as u64;
                    if left == 0 {
                        cs = ChunkState::DataEnd;
                    } else {
                        self.state = State::Body(BodyFraming::Chunked(ChunkState::Data { left }));
                        return Ok(false);
                    }
                }

                ChunkState::DataEnd => {
                    if self.buf.len() < 2 {
                        self.state = State::Body(BodyFraming::Chunked(cs));
                        return Ok(false);
                    }
                    if &self.buf[..2] != b"\r\n" {
                        self.state = State::Failed;
                        return Err(ParseError::BadChunk);
                    }
                    self.buf.advance(2);
                    cs = ChunkState::Size;
                }

                ChunkState::Trailer => match find_crlf(&self.buf) {
                    None => {
                        if self.buf.len() > MAX_HEAD_BYTES {
                            self.state = State::Failed;
                            return Err(ParseError::HeadTooLarge {
                                limit: MAX_HEAD_BYTES,
                            });
                        }
                        self.state = State::Body(BodyFraming::Chunked(cs));
                        return Ok(false);
                    }
                    Some(0) => {
                        self.buf.advance(2);
                        events.push(ResponseEvent::MsgComplete);
                        return Ok(true);
                    }
                    Some(pos) => {
                        // trailer header; nobody downstream wants it
                        self.buf.advance(pos + 2);
                    }
                },
            }
        }
    }
}

fn value_has_token(value: &[u8], token: &[u8]) -> bool {
    value
        .split(|&b| b == b',')
        .any(|part| trim_ascii(part).eq_ignore_ascii_case(token))
}

fn trim_ascii(mut s: &[u8]) -> &[u8] {
    while let [b' ' | b'\t', rest @ ..] = s {
        s = rest;
    }
    while let [rest @ .., b' ' | b'\t'] = s {
        s = rest;
    }
    s
}

fn find_crlf(buf: &[u8]) -> Option<usize> {
    buf.windows(2).position(|w| w == b"\r\n")
}
