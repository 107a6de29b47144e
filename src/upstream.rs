use std::collections::VecDeque;
use std::rc::Rc;

use bytes::{Bytes, BytesMut};
use http::StatusCode;
use smallvec::SmallVec;
use tracing::{debug, trace, warn};

use crate::client_handler::{DconnPool, IoAction};
use crate::config::Config;
use crate::downstream::{Downstream, DownstreamState};
use crate::downstream_connection::ConnId;
use crate::downstream_queue::DownstreamQueue;
use crate::error::ServeError;
use crate::h1;
use crate::io_control::IoCtrlReason;
use crate::rewrite;
use crate::session::{
    DataPull, DataSource, FrameSink, RstStatus, SessionEvent, SettingsEntry, SettingsId,
    SinkResult, SpdySession, SpdyVersion, StreamId,
};

/// Upper threshold for the client-side output buffer, and the watermark on
/// each stream's response body buffer. Crossing either one stalls the
/// producing side until the consumer catches up.
pub(crate) const OUTPUT_UPPER_THRES: usize = 64 * 1024;

/// The translator: SPDY streams on one side, HTTP/1.1 origin exchanges on
/// the other.
///
/// Owns the session and the queue of live streams. Every handler resolves
/// its stream by id at entry, so a stream deleted earlier in the same event
/// chain is just an ignored event.
pub struct SpdyUpstream<S> {
    session: S,
    version: SpdyVersion,
    flow_control: bool,
    initial_window_size: i32,
    queue: DownstreamQueue,
    actions: VecDeque<IoAction>,
    config: Rc<Config>,
}

impl<S: SpdySession> SpdyUpstream<S> {
    /// Sets up the session (flow control per version) and submits the
    /// initial SETTINGS frame, which is always the first frame on the wire.
    pub(crate) fn new(
        version: SpdyVersion,
        mut session: S,
        config: Rc<Config>,
    ) -> Result<Self, ServeError> {
        let flow_control = version.flow_control();
        let initial_window_size = version.initial_window_size();
        if flow_control {
            // WINDOW_UPDATE is amortized by hand, half a window at a time
            session.set_auto_window_update(false);
        }
        session.submit_settings(&[
            SettingsEntry {
                id: SettingsId::MaxConcurrentStreams,
                value: config.spdy_max_concurrent_streams,
            },
            SettingsEntry {
                id: SettingsId::InitialWindowSize,
                value: initial_window_size as u32,
            },
        ])?;
        debug!(%version, %flow_control, "spdy upstream ready");
        Ok(Self {
            session,
            version,
            flow_control,
            initial_window_size,
            queue: DownstreamQueue::new(),
            actions: VecDeque::new(),
            config,
        })
    }

    pub(crate) fn config(&self) -> &Rc<Config> {
        &self.config
    }

    pub(crate) fn queue_len(&self) -> usize {
        self.queue.len()
    }

    pub(crate) fn poll_action(&mut self) -> Option<IoAction> {
        self.actions.pop_front()
    }

    pub(crate) fn actions_mut(&mut self) -> &mut VecDeque<IoAction> {
        &mut self.actions
    }

    // --- client side ---

    pub(crate) fn on_client_read(
        &mut self,
        data: &[u8],
        pool: &mut DconnPool,
    ) -> Result<(), ServeError> {
        self.session.recv(data)?;
        self.drain_session(pool)
    }

    /// Handles every pending session event. Submissions made while handling
    /// one event may queue more (an RST turns into a stream close), so this
    /// keeps going until the session runs dry.
    pub(crate) fn drain_session(&mut self, pool: &mut DconnPool) -> Result<(), ServeError> {
        while let Some(event) = self.session.poll_event() {
            match event {
                SessionEvent::SynStream {
                    stream_id,
                    priority,
                    fin,
                    headers,
                } => self.on_syn_stream(pool, stream_id, priority, fin, headers)?,
                SessionEvent::Data {
                    stream_id,
                    fin,
                    data,
                } => self.on_data(stream_id, fin, data)?,
                SessionEvent::StreamClose { stream_id, status } => {
                    self.on_stream_close(pool, stream_id, status)
                }
            }
        }
        Ok(())
    }

    /// Produces SPDY frames into `out`, stopping at the output watermark.
    /// Response body bytes are pulled straight out of each stream's buffer.
    pub(crate) fn produce_output(
        &mut self,
        out: &mut BytesMut,
        pool: &mut DconnPool,
    ) -> Result<(), ServeError> {
        self.drain_session(pool)?;
        {
            let Self {
                session,
                queue,
                actions,
                ..
            } = self;
            let mut sink = WatermarkSink { out };
            let mut source = BodySource { queue, actions };
            session.send(&mut sink, &mut source)?;
        }
        // sending the tail of a response closes its stream
        self.drain_session(pool)
    }

    // --- frame handling ---

    fn on_syn_stream(
        &mut self,
        pool: &mut DconnPool,
        stream_id: StreamId,
        priority: u8,
        fin: bool,
        headers: Vec<(Bytes, Bytes)>,
    ) -> Result<(), ServeError> {
        debug!(%stream_id, priority, fin, "SYN_STREAM");
        let mut downstream = Downstream::new(stream_id, priority);
        for (name, value) in headers {
            if name.as_ref() == b":path" {
                downstream.set_request_path(value);
            } else if name.as_ref() == b":method" {
                downstream.set_request_method(value);
            } else if !name.starts_with(b":") {
                downstream.add_request_header(name, value);
            }
        }
        downstream.add_request_header(
            Bytes::from_static(b"X-Forwarded-Spdy"),
            Bytes::from_static(b"true"),
        );

        let conn = pool.get(&mut self.actions);
        if let Err((conn, err)) = downstream.attach_connection(conn) {
            warn!(%stream_id, %err, "could not attach origin connection");
            self.actions.push_back(IoAction::CloseOrigin { conn: conn.id() });
            self.session
                .submit_rst_stream(stream_id, RstStatus::InternalError)?;
            downstream.set_request_state(DownstreamState::ConnectFail);
            self.queue.add(downstream);
            return Ok(());
        }

        push_request_headers(&mut downstream, &mut self.actions);
        downstream.set_request_state(DownstreamState::HeaderComplete);
        if fin {
            downstream.set_request_state(DownstreamState::MsgComplete);
        }
        self.queue.add(downstream);
        Ok(())
    }

    fn on_data(&mut self, stream_id: StreamId, fin: bool, data: Bytes) -> Result<(), ServeError> {
        let Some(downstream) = self.queue.find_mut(stream_id) else {
            trace!(%stream_id, "DATA for unknown stream, dropping");
            return Ok(());
        };

        if let Some(conn) = downstream.conn_mut() {
            conn.queue_write(&data);
            let conn = conn.id();
            self.actions.push_back(IoAction::WriteOrigin { conn });
        }

        let mut overflow = false;
        if self.flow_control {
            downstream.inc_recv_window_size(data.len() as i32);
            if downstream.recv_window_size() > self.initial_window_size {
                debug!(
                    %stream_id,
                    recv_window_size = downstream.recv_window_size(),
                    initial_window_size = self.initial_window_size,
                    "flow control violated"
                );
                overflow = true;
            }
        }
        if overflow {
            return self
                .session
                .submit_rst_stream(stream_id, RstStatus::FlowControlError)
                .map_err(ServeError::from);
        }
        if fin {
            downstream.set_request_state(DownstreamState::MsgComplete);
        }
        Ok(())
    }

    fn on_stream_close(
        &mut self,
        pool: &mut DconnPool,
        stream_id: StreamId,
        status: Option<RstStatus>,
    ) {
        let Some(mut downstream) = self.queue.remove(stream_id) else {
            trace!(%stream_id, "close for unknown stream");
            return;
        };
        debug!(%stream_id, ?status, "stream closed");

        if downstream.request_state() == DownstreamState::ConnectFail {
            // never had a connection (and must not: see attach failure)
            return;
        }
        downstream.set_request_state(DownstreamState::StreamClosed);

        if downstream.response_state() == DownstreamState::MsgComplete
            && !downstream.response_connection_close()
        {
            if let Some(mut conn) = downstream.take_connection() {
                conn.detach();
                pool.pool(conn, &mut self.actions);
            }
        } else if let Some(conn) = downstream.take_connection() {
            // response incomplete or origin asked to close: the connection
            // dies with the stream
            self.actions.push_back(IoAction::CloseOrigin { conn: conn.id() });
        }
    }

    // --- origin side ---

    pub(crate) fn on_origin_connected(&mut self, conn: ConnId) {
        let Some(stream_id) = self.queue.find_by_conn(conn) else {
            return;
        };
        debug!(%stream_id, %conn, "origin connection established");
        if let Some(c) = self
            .queue
            .find_mut(stream_id)
            .and_then(|ds| ds.conn_mut())
        {
            c.set_connected();
        }
    }

    pub(crate) fn take_origin_output(&mut self, conn: ConnId) -> Option<Bytes> {
        let stream_id = self.queue.find_by_conn(conn)?;
        let c = self.queue.find_mut(stream_id)?.conn_mut()?;
        c.has_pending_write().then(|| c.take_output())
    }

    pub(crate) fn on_origin_read(
        &mut self,
        pool: &mut DconnPool,
        conn: ConnId,
        data: &[u8],
    ) -> Result<(), ServeError> {
        if pool.contains(conn) {
            // an idle origin has nothing legitimate to say
            debug!(%conn, "pooled origin connection sent data, discarding it");
            pool.remove(conn, &mut self.actions);
            return Ok(());
        }
        let Some(stream_id) = self.queue.find_by_conn(conn) else {
            trace!(%conn, "read event for unknown origin connection");
            return Ok(());
        };

        let parsed = match self
            .queue
            .find_mut(stream_id)
            .and_then(|ds| ds.conn_mut())
        {
            Some(c) => c.on_read(data),
            None => return Ok(()),
        };

        match parsed {
            Ok(events) => {
                for event in events {
                    match event {
                        h1::ResponseEvent::HeaderComplete(head) => {
                            self.on_downstream_header_complete(stream_id, head)?
                        }
                        h1::ResponseEvent::Body(chunk) => {
                            self.on_downstream_body(stream_id, &chunk)
                        }
                        h1::ResponseEvent::MsgComplete => {
                            self.on_downstream_body_complete(stream_id)
                        }
                    }
                }
            }
            Err(err) => {
                debug!(%stream_id, %err, "origin response parse failure");
                self.on_parse_failure(stream_id)?;
            }
        }
        self.drain_session(pool)
    }

    /// A writable edge on the origin socket: the moment to pay back
    /// accumulated window credit, half a window at a time.
    pub(crate) fn on_origin_flushed(&mut self, conn: ConnId) -> Result<(), ServeError> {
        if !self.flow_control {
            return Ok(());
        }
        let Some(stream_id) = self.queue.find_by_conn(conn) else {
            return Ok(());
        };
        let window = self
            .queue
            .find(stream_id)
            .map(|ds| ds.recv_window_size())
            .unwrap_or(0);
        if window >= self.initial_window_size / 2 {
            self.window_update(stream_id)?;
        }
        Ok(())
    }

    pub(crate) fn on_origin_eof(
        &mut self,
        pool: &mut DconnPool,
        conn: ConnId,
    ) -> Result<(), ServeError> {
        if pool.contains(conn) {
            debug!(%conn, "pooled origin connection closed");
            pool.remove(conn, &mut self.actions);
            return Ok(());
        }
        let Some(stream_id) = self.queue.find_by_conn(conn) else {
            trace!(%conn, "EOF for unknown origin connection");
            return Ok(());
        };
        debug!(%stream_id, %conn, "origin EOF");

        let response_state = self.unlink_and_close_conn(stream_id);
        match response_state {
            Some(DownstreamState::HeaderComplete) => {
                // the origin is allowed to end an unframed body with EOF
                if let Some(ds) = self.queue.find_mut(stream_id) {
                    ds.set_response_state(DownstreamState::MsgComplete);
                }
                self.session.resume_data(stream_id);
            }
            Some(DownstreamState::MsgComplete) | None => {}
            Some(_) => {
                // not a single response byte to show for it
                self.error_reply(stream_id, StatusCode::BAD_GATEWAY)?;
            }
        }
        self.drain_session(pool)
    }

    pub(crate) fn on_origin_failure(
        &mut self,
        pool: &mut DconnPool,
        conn: ConnId,
        timeout: bool,
    ) -> Result<(), ServeError> {
        if pool.contains(conn) {
            debug!(%conn, timeout, "pooled origin connection failed");
            pool.remove(conn, &mut self.actions);
            return Ok(());
        }
        let Some(stream_id) = self.queue.find_by_conn(conn) else {
            trace!(%conn, "failure event for unknown origin connection");
            return Ok(());
        };
        debug!(%stream_id, %conn, timeout, "origin connection failed");

        let response_state = self.unlink_and_close_conn(stream_id);
        match response_state {
            Some(DownstreamState::MsgComplete) | None => {}
            Some(DownstreamState::HeaderComplete) => {
                // the client already has headers; all we can do is reset
                self.session
                    .submit_rst_stream(stream_id, RstStatus::InternalError)?;
                if let Some(ds) = self.queue.find_mut(stream_id) {
                    ds.set_response_state(DownstreamState::MsgComplete);
                }
            }
            Some(_) => {
                let status = if timeout {
                    StatusCode::GATEWAY_TIMEOUT
                } else {
                    StatusCode::BAD_GATEWAY
                };
                self.error_reply(stream_id, status)?;
            }
        }
        self.drain_session(pool)
    }

    pub(crate) fn on_origin_connect_fail(
        &mut self,
        pool: &mut DconnPool,
        conn: ConnId,
    ) -> Result<(), ServeError> {
        let Some(stream_id) = self.queue.find_by_conn(conn) else {
            trace!(%conn, "connect failure for unknown origin connection");
            return Ok(());
        };
        debug!(%stream_id, %conn, "origin connect failed");

        // unlink first: a CONNECT_FAIL stream never has a connection
        self.unlink_and_close_conn(stream_id);
        self.session
            .submit_rst_stream(stream_id, RstStatus::InternalError)?;
        if let Some(ds) = self.queue.find_mut(stream_id) {
            ds.set_request_state(DownstreamState::ConnectFail);
        }
        self.drain_session(pool)
    }

    /// Unlinks the stream's connection (queueing its close) and reports the
    /// stream's response state; `None` if the stream is gone.
    fn unlink_and_close_conn(&mut self, stream_id: StreamId) -> Option<DownstreamState> {
        let downstream = self.queue.find_mut(stream_id)?;
        if let Some(conn) = downstream.take_connection() {
            self.actions.push_back(IoAction::CloseOrigin { conn: conn.id() });
        }
        Some(downstream.response_state())
    }

    fn on_parse_failure(&mut self, stream_id: StreamId) -> Result<(), ServeError> {
        // a connection that produced garbage is never reused
        let response_state = self.unlink_and_close_conn(stream_id);
        match response_state {
            Some(DownstreamState::HeaderComplete) => {
                self.session
                    .submit_rst_stream(stream_id, RstStatus::InternalError)?;
            }
            Some(DownstreamState::MsgComplete) | None => {}
            Some(_) => {
                self.error_reply(stream_id, StatusCode::BAD_GATEWAY)?;
            }
        }
        if let Some(ds) = self.queue.find_mut(stream_id) {
            if ds.response_state() != DownstreamState::MsgComplete {
                ds.set_response_state(DownstreamState::MsgComplete);
            }
        }
        Ok(())
    }

    // --- response path ---

    fn on_downstream_header_complete(
        &mut self,
        stream_id: StreamId,
        head: h1::ResponseHead,
    ) -> Result<(), ServeError> {
        let Some(downstream) = self.queue.find_mut(stream_id) else {
            return Ok(());
        };
        debug!(%stream_id, status = %head.status, "origin response headers complete");
        downstream.apply_response_head(head);
        downstream.set_response_state(DownstreamState::HeaderComplete);

        let Some(status) = downstream.response_http_status() else {
            return Ok(());
        };

        let mut nv: SmallVec<[(Bytes, Bytes); 16]> = SmallVec::new();
        nv.push((
            Bytes::from_static(b":status"),
            Bytes::from(rewrite::status_string(status)),
        ));
        nv.push((
            Bytes::from_static(b":version"),
            Bytes::from_static(b"HTTP/1.1"),
        ));

        let mut via_value: Option<Bytes> = None;
        let mut location: Option<Bytes> = None;
        for (name, value) in downstream.response_headers() {
            if rewrite::is_hop_by_hop(name) {
                continue;
            }
            if name.eq_ignore_ascii_case(b"via") {
                via_value = Some(value.clone());
            } else if name.eq_ignore_ascii_case(b"location") {
                location = Some(value.clone());
            } else {
                nv.push((name.clone(), value.clone()));
            }
        }
        if let Some(location) = location {
            let rewritten = rewrite::rewrite_location(
                &location,
                &self.config.downstream_authority,
                &self.config.rewrite_authority,
            )
            .map(Bytes::from)
            .unwrap_or(location);
            nv.push((Bytes::from_static(b"location"), rewritten));
        }
        let via = rewrite::append_via_token(
            via_value.as_deref().unwrap_or(b""),
            downstream.response_version(),
            &self.config.server_name,
        );
        nv.push((Bytes::from_static(b"via"), Bytes::from(via)));

        self.submit_response(stream_id, &nv)
    }

    fn on_downstream_body(&mut self, stream_id: StreamId, chunk: &[u8]) {
        let Some(downstream) = self.queue.find_mut(stream_id) else {
            return;
        };
        downstream.append_response_body(chunk);
        self.session.resume_data(stream_id);

        if downstream.response_body_len() > OUTPUT_UPPER_THRES {
            if let Some(conn) = downstream.pause_read(IoCtrlReason::NoBuffer) {
                trace!(%stream_id, %conn, "response buffer over watermark, pausing origin read");
                self.actions.push_back(IoAction::PauseOriginRead { conn });
            }
        }
    }

    fn on_downstream_body_complete(&mut self, stream_id: StreamId) {
        let Some(downstream) = self.queue.find_mut(stream_id) else {
            return;
        };
        debug!(%stream_id, "origin response complete");
        downstream.set_response_state(DownstreamState::MsgComplete);
        self.session.resume_data(stream_id);
    }

    /// Submits the response headers for a stream, at most once.
    fn submit_response(
        &mut self,
        stream_id: StreamId,
        nv: &[(Bytes, Bytes)],
    ) -> Result<(), ServeError> {
        let Some(downstream) = self.queue.find_mut(stream_id) else {
            return Ok(());
        };
        if downstream.response_submitted() {
            debug_assert!(false, "second response submission for {stream_id}");
            return Ok(());
        }
        self.session.submit_response(stream_id, nv)?;
        downstream.mark_response_submitted();
        Ok(())
    }

    /// Synthesizes an error response for the stream: a small HTML body
    /// served from the response buffer like any proxied one.
    fn error_reply(&mut self, stream_id: StreamId, status: StatusCode) -> Result<(), ServeError> {
        debug!(%stream_id, %status, "synthesizing error reply");
        {
            let Some(downstream) = self.queue.find_mut(stream_id) else {
                return Ok(());
            };
            if downstream.response_submitted() {
                downstream.set_response_state(DownstreamState::MsgComplete);
                return Ok(());
            }
            let html = rewrite::error_html(status);
            downstream.set_response_http_status(status);
            downstream.set_response_state(DownstreamState::MsgComplete);
            downstream.clear_response_body();
            downstream.append_response_body(html.as_bytes());
        }
        let nv = [
            (
                Bytes::from_static(b":status"),
                Bytes::from(rewrite::status_string(status)),
            ),
            (
                Bytes::from_static(b":version"),
                Bytes::from_static(b"http/1.1"),
            ),
            (
                Bytes::from_static(b"content-type"),
                Bytes::from_static(b"text/html; charset=UTF-8"),
            ),
            (
                Bytes::from_static(b"server"),
                Bytes::from(self.config.server_name.clone()),
            ),
        ];
        self.submit_response(stream_id, &nv)
    }

    fn window_update(&mut self, stream_id: StreamId) -> Result<(), ServeError> {
        let Some(downstream) = self.queue.find_mut(stream_id) else {
            return Ok(());
        };
        let delta = downstream.recv_window_size();
        downstream.reset_recv_window_size();
        trace!(%stream_id, delta, "WINDOW_UPDATE");
        self.session.submit_window_update(stream_id, delta)?;
        Ok(())
    }

    /// Drops every live stream, queueing a close for each attached origin
    /// connection. Called when the client connection dies.
    pub(crate) fn shutdown(&mut self) {
        for mut downstream in self.queue.drain() {
            if let Some(conn) = downstream.take_connection() {
                self.actions.push_back(IoAction::CloseOrigin { conn: conn.id() });
            }
        }
    }

    pub fn version(&self) -> SpdyVersion {
        self.version
    }
}

/// Serializes the request head into the attached connection's write queue.
fn push_request_headers(downstream: &mut Downstream, actions: &mut VecDeque<IoAction>) {
    let head_only = downstream.request_method().eq_ignore_ascii_case(b"HEAD");
    let mut head = BytesMut::with_capacity(256);
    h1::encode_request(
        downstream.request_method(),
        downstream.request_path(),
        downstream.request_version(),
        downstream.request_headers(),
        &mut head,
    );
    if let Some(conn) = downstream.conn_mut() {
        conn.start_exchange(head_only);
        conn.queue_write(&head);
        let conn = conn.id();
        actions.push_back(IoAction::WriteOrigin { conn });
    }
}

/// Enforces the client output watermark on frames the session produces.
struct WatermarkSink<'a> {
    out: &'a mut BytesMut,
}

impl FrameSink for WatermarkSink<'_> {
    fn accept(&mut self, frame: &[u8]) -> SinkResult {
        if self.out.len() > OUTPUT_UPPER_THRES {
            return SinkResult::WouldBlock;
        }
        self.out.extend_from_slice(frame);
        SinkResult::Accepted
    }
}

/// Feeds the session's per-stream data pulls from the response buffers,
/// resuming paused origin reads once a buffer drops back under the
/// watermark.
struct BodySource<'a> {
    queue: &'a mut DownstreamQueue,
    actions: &'a mut VecDeque<IoAction>,
}

impl DataSource for BodySource<'_> {
    fn pull(&mut self, stream_id: StreamId, buf: &mut [u8]) -> DataPull {
        let Some(downstream) = self.queue.find_mut(stream_id) else {
            return DataPull::Deferred;
        };
        let n = downstream.drain_response_body(buf);
        if downstream.response_body_len() <= OUTPUT_UPPER_THRES {
            if let Some(conn) = downstream.resume_read(IoCtrlReason::NoBuffer) {
                self.actions.push_back(IoAction::ResumeOriginRead { conn });
            }
        }
        if downstream.response_state() == DownstreamState::MsgComplete
            && downstream.response_body_len() == 0
        {
            DataPull::Fin(n)
        } else if n == 0 {
            DataPull::Deferred
        } else {
            DataPull::Data(n)
        }
    }
}
