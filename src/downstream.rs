use bytes::{Bytes, BytesMut};
use http::StatusCode;
use tracing::trace;

use crate::downstream_connection::{AttachError, ConnId, DownstreamConnection};
use crate::h1::ResponseHead;
use crate::io_control::IoCtrlReason;
use crate::session::StreamId;
use crate::types::Headers;

/// Where one side of a proxied exchange stands.
///
/// Request and response march through these independently. INITIAL →
/// HEADER_COMPLETE → MSG_COMPLETE is the forward path; STREAM_CLOSED and
/// CONNECT_FAIL are terminal. IDLE only exists for keep-alive upstreams
/// that recycle their state between exchanges.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DownstreamState {
    #[default]
    Initial,
    HeaderComplete,
    MsgComplete,
    StreamClosed,
    ConnectFail,
    Idle,
}

/// Per-stream bridge state: one of these exists for every live SPDY stream,
/// owning the request we built for the origin, the response coming back,
/// and (while attached) the origin connection carrying both.
pub struct Downstream {
    stream_id: StreamId,
    priority: u8,

    request_state: DownstreamState,
    request_method: Bytes,
    request_path: Bytes,
    request_major: u8,
    request_minor: u8,
    request_headers: Headers,
    chunked_request: bool,
    request_connection_close: bool,
    request_expect_100_continue: bool,

    response_state: DownstreamState,
    response_http_status: Option<StatusCode>,
    response_major: u8,
    response_minor: u8,
    response_headers: Headers,
    chunked_response: bool,
    response_connection_close: bool,
    response_submitted: bool,
    // the session drains this through its per-stream data pull
    response_body_buf: BytesMut,

    recv_window_size: i32,

    conn: Option<DownstreamConnection>,
}

impl Downstream {
    pub fn new(stream_id: StreamId, priority: u8) -> Self {
        Self {
            stream_id,
            priority,
            request_state: DownstreamState::Initial,
            request_method: Bytes::new(),
            request_path: Bytes::new(),
            request_major: 1,
            request_minor: 1,
            request_headers: Headers::new(),
            chunked_request: false,
            request_connection_close: false,
            request_expect_100_continue: false,
            response_state: DownstreamState::Initial,
            response_http_status: None,
            response_major: 1,
            response_minor: 1,
            response_headers: Headers::new(),
            chunked_response: false,
            response_connection_close: false,
            response_submitted: false,
            response_body_buf: BytesMut::new(),
            recv_window_size: 0,
            conn: None,
        }
    }

    pub fn stream_id(&self) -> StreamId {
        self.stream_id
    }

    pub fn priority(&self) -> u8 {
        self.priority
    }

    // --- request side ---

    pub fn request_state(&self) -> DownstreamState {
        self.request_state
    }

    pub fn set_request_state(&mut self, state: DownstreamState) {
        trace!(stream_id = %self.stream_id, ?state, "request state");
        self.request_state = state;
    }

    pub fn set_request_method(&mut self, method: Bytes) {
        self.request_method = method;
    }

    pub fn request_method(&self) -> &[u8] {
        &self.request_method
    }

    pub fn set_request_path(&mut self, path: Bytes) {
        self.request_path = path;
    }

    pub fn request_path(&self) -> &[u8] {
        &self.request_path
    }

    pub fn request_version(&self) -> (u8, u8) {
        (self.request_major, self.request_minor)
    }

    /// Appends a request header, deriving the flags the bridge cares about
    /// on the way through.
    pub fn add_request_header(&mut self, name: Bytes, value: Bytes) {
        if name.eq_ignore_ascii_case(b"expect") && value.eq_ignore_ascii_case(b"100-continue") {
            self.request_expect_100_continue = true;
        } else if name.eq_ignore_ascii_case(b"connection")
            || name.eq_ignore_ascii_case(b"proxy-connection")
        {
            if value.eq_ignore_ascii_case(b"close") {
                self.request_connection_close = true;
            }
        } else if name.eq_ignore_ascii_case(b"transfer-encoding")
            && value.eq_ignore_ascii_case(b"chunked")
        {
            self.chunked_request = true;
        }
        self.request_headers.push(name, value);
    }

    pub fn request_headers(&self) -> &Headers {
        &self.request_headers
    }

    pub fn chunked_request(&self) -> bool {
        self.chunked_request
    }

    pub fn request_connection_close(&self) -> bool {
        self.request_connection_close
    }

    pub fn request_expect_100_continue(&self) -> bool {
        self.request_expect_100_continue
    }

    // --- response side ---

    pub fn response_state(&self) -> DownstreamState {
        self.response_state
    }

    pub fn set_response_state(&mut self, state: DownstreamState) {
        trace!(stream_id = %self.stream_id, ?state, "response state");
        self.response_state = state;
    }

    pub fn response_http_status(&self) -> Option<StatusCode> {
        self.response_http_status
    }

    pub fn set_response_http_status(&mut self, status: StatusCode) {
        self.response_http_status = Some(status);
    }

    pub fn response_version(&self) -> (u8, u8) {
        (self.response_major, self.response_minor)
    }

    pub fn response_headers(&self) -> &Headers {
        &self.response_headers
    }

    pub fn chunked_response(&self) -> bool {
        self.chunked_response
    }

    pub fn response_connection_close(&self) -> bool {
        self.response_connection_close
    }

    /// Takes everything the response parser learned from the head.
    pub fn apply_response_head(&mut self, head: ResponseHead) {
        self.response_http_status = Some(head.status);
        self.response_major = head.version.0;
        self.response_minor = head.version.1;
        self.response_headers = head.headers;
        self.chunked_response = head.chunked;
        self.response_connection_close = head.connection_close;
    }

    pub fn response_submitted(&self) -> bool {
        self.response_submitted
    }

    pub fn mark_response_submitted(&mut self) {
        debug_assert!(!self.response_submitted, "response submitted twice");
        self.response_submitted = true;
    }

    pub fn append_response_body(&mut self, data: &[u8]) {
        debug_assert!(
            matches!(
                self.response_state,
                DownstreamState::HeaderComplete | DownstreamState::MsgComplete
            ),
            "response body appended in state {:?}",
            self.response_state
        );
        self.response_body_buf.extend_from_slice(data);
    }

    pub fn clear_response_body(&mut self) {
        self.response_body_buf.clear();
    }

    pub fn response_body_len(&self) -> usize {
        self.response_body_buf.len()
    }

    /// Moves up to `buf.len()` buffered body bytes out; returns the count.
    pub fn drain_response_body(&mut self, buf: &mut [u8]) -> usize {
        let n = self.response_body_buf.len().min(buf.len());
        let chunk = self.response_body_buf.split_to(n);
        buf[..n].copy_from_slice(&chunk);
        n
    }

    // --- flow control ---

    pub fn recv_window_size(&self) -> i32 {
        self.recv_window_size
    }

    pub fn inc_recv_window_size(&mut self, amount: i32) {
        self.recv_window_size = self.recv_window_size.saturating_add(amount);
    }

    pub fn reset_recv_window_size(&mut self) {
        self.recv_window_size = 0;
    }

    // --- origin connection ---

    /// Attaches an origin connection to this stream. On failure the
    /// connection comes back so the caller can dispose of it.
    pub fn attach_connection(
        &mut self,
        mut conn: DownstreamConnection,
    ) -> Result<(), (DownstreamConnection, AttachError)> {
        if let Some(existing) = &self.conn {
            return Err((conn, AttachError::StreamBusy(existing.id())));
        }
        if let Err(err) = conn.attach(self.stream_id) {
            return Err((conn, err));
        }
        self.conn = Some(conn);
        Ok(())
    }

    /// Unlinks the origin connection, if any. The caller decides whether it
    /// goes back to the pool or dies.
    pub fn take_connection(&mut self) -> Option<DownstreamConnection> {
        self.conn.take()
    }

    pub fn conn(&self) -> Option<&DownstreamConnection> {
        self.conn.as_ref()
    }

    pub fn conn_mut(&mut self) -> Option<&mut DownstreamConnection> {
        self.conn.as_mut()
    }

    pub fn conn_id(&self) -> Option<ConnId> {
        self.conn.as_ref().map(|c| c.id())
    }

    /// Pauses origin reads for `reason`; `Some(conn)` if the read side just
    /// transitioned to paused and the event loop should act on it.
    pub fn pause_read(&mut self, reason: IoCtrlReason) -> Option<ConnId> {
        let conn = self.conn.as_mut()?;
        conn.pause_read(reason).then(|| conn.id())
    }

    /// Counterpart of [`pause_read`](Self::pause_read); `Some(conn)` if
    /// reads should start flowing again.
    pub fn resume_read(&mut self, reason: IoCtrlReason) -> Option<ConnId> {
        let conn = self.conn.as_mut()?;
        conn.resume_read(reason).then(|| conn.id())
    }
}
