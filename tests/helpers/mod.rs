#![allow(dead_code)]

use std::cell::RefCell;
use std::collections::{BTreeMap, VecDeque};
use std::rc::Rc;

use bytes::Bytes;
use skein::session::{
    DataPull, DataSource, FrameSink, RstStatus, SessionError, SessionEvent, SettingsEntry,
    SinkResult, SpdySession, SpdyVersion, StreamId,
};
use skein::{ClientHandler, Config, ConnId, IoAction};

pub(crate) mod tracing_common;

/// Everything the bridge asked the session to do, in order.
#[derive(Debug, Clone, PartialEq)]
pub enum Submission {
    Settings(Vec<SettingsEntry>),
    Response {
        stream_id: StreamId,
        headers: Vec<(Bytes, Bytes)>,
    },
    RstStream {
        stream_id: StreamId,
        status: RstStatus,
    },
    WindowUpdate {
        stream_id: StreamId,
        delta: i32,
    },
}

#[derive(Default)]
struct OutStream {
    headers_sent: bool,
    body: Vec<u8>,
    deferred: bool,
    done: bool,
}

#[derive(Default)]
struct SessionState {
    events: VecDeque<SessionEvent>,
    submissions: Vec<Submission>,
    recv_bytes: usize,
    auto_window_update: Option<bool>,
    streams: BTreeMap<StreamId, OutStream>,
}

/// A scripted stand-in for the SPDY session library: the test injects
/// events through a [`SessionHandle`] and inspects what the bridge
/// submitted. Egress is real in the one way that matters: response body
/// bytes are pulled through the data source, honoring deferral and the
/// sink's watermark.
pub struct ScriptedSession {
    state: Rc<RefCell<SessionState>>,
}

#[derive(Clone)]
pub struct SessionHandle {
    state: Rc<RefCell<SessionState>>,
}

pub fn scripted_session() -> (ScriptedSession, SessionHandle) {
    let state = Rc::new(RefCell::new(SessionState::default()));
    (
        ScriptedSession {
            state: state.clone(),
        },
        SessionHandle { state },
    )
}

impl SessionHandle {
    pub fn push_event(&self, event: SessionEvent) {
        self.state.borrow_mut().events.push_back(event);
    }

    pub fn submissions(&self) -> Vec<Submission> {
        self.state.borrow().submissions.clone()
    }

    pub fn recv_bytes(&self) -> usize {
        self.state.borrow().recv_bytes
    }

    pub fn auto_window_update(&self) -> Option<bool> {
        self.state.borrow().auto_window_update
    }

    /// Headers of the (single) response submitted for a stream.
    pub fn response_for(&self, stream_id: StreamId) -> Option<Vec<(Bytes, Bytes)>> {
        self.state.borrow().submissions.iter().find_map(|s| match s {
            Submission::Response {
                stream_id: id,
                headers,
            } if *id == stream_id => Some(headers.clone()),
            _ => None,
        })
    }

    pub fn response_count(&self, stream_id: StreamId) -> usize {
        self.state
            .borrow()
            .submissions
            .iter()
            .filter(|s| matches!(s, Submission::Response { stream_id: id, .. } if *id == stream_id))
            .count()
    }

    pub fn rst_for(&self, stream_id: StreamId) -> Option<RstStatus> {
        self.state.borrow().submissions.iter().find_map(|s| match s {
            Submission::RstStream {
                stream_id: id,
                status,
            } if *id == stream_id => Some(*status),
            _ => None,
        })
    }

    pub fn window_updates_for(&self, stream_id: StreamId) -> Vec<i32> {
        self.state
            .borrow()
            .submissions
            .iter()
            .filter_map(|s| match s {
                Submission::WindowUpdate {
                    stream_id: id,
                    delta,
                } if *id == stream_id => Some(*delta),
                _ => None,
            })
            .collect()
    }

    /// Response body bytes the session has pulled and framed for a stream.
    pub fn sent_body(&self, stream_id: StreamId) -> Vec<u8> {
        self.state
            .borrow()
            .streams
            .get(&stream_id)
            .map(|s| s.body.clone())
            .unwrap_or_default()
    }

    pub fn stream_done(&self, stream_id: StreamId) -> bool {
        self.state
            .borrow()
            .streams
            .get(&stream_id)
            .map(|s| s.done)
            .unwrap_or(false)
    }
}

impl SpdySession for ScriptedSession {
    fn recv(&mut self, input: &[u8]) -> Result<(), SessionError> {
        self.state.borrow_mut().recv_bytes += input.len();
        Ok(())
    }

    fn poll_event(&mut self) -> Option<SessionEvent> {
        self.state.borrow_mut().events.pop_front()
    }

    fn send(
        &mut self,
        sink: &mut dyn FrameSink,
        source: &mut dyn DataSource,
    ) -> Result<(), SessionError> {
        let mut state = self.state.borrow_mut();
        let active: Vec<StreamId> = state
            .streams
            .iter()
            .filter(|(_, s)| !s.done && !s.deferred)
            .map(|(id, _)| *id)
            .collect();
        let mut closed = Vec::new();

        'streams: for id in active {
            loop {
                // probe the watermark before pulling anything
                if sink.accept(&[]) == SinkResult::WouldBlock {
                    break 'streams;
                }
                let stream = match state.streams.get_mut(&id) {
                    Some(s) => s,
                    None => continue 'streams,
                };
                if !stream.headers_sent {
                    stream.headers_sent = true;
                    let frame = format!("SYN_REPLY[{id}]\n");
                    sink.accept(frame.as_bytes());
                }
                let mut buf = [0u8; 4096];
                match source.pull(id, &mut buf) {
                    DataPull::Deferred => {
                        stream.deferred = true;
                        continue 'streams;
                    }
                    DataPull::Data(n) => {
                        stream.body.extend_from_slice(&buf[..n]);
                        sink.accept(&buf[..n]);
                    }
                    DataPull::Fin(n) => {
                        stream.body.extend_from_slice(&buf[..n]);
                        stream.done = true;
                        sink.accept(&buf[..n]);
                        closed.push(id);
                        continue 'streams;
                    }
                }
            }
        }

        for stream_id in closed {
            state.events.push_back(SessionEvent::StreamClose {
                stream_id,
                status: None,
            });
        }
        Ok(())
    }

    fn submit_settings(&mut self, entries: &[SettingsEntry]) -> Result<(), SessionError> {
        self.state
            .borrow_mut()
            .submissions
            .push(Submission::Settings(entries.to_vec()));
        Ok(())
    }

    fn submit_response(
        &mut self,
        stream_id: StreamId,
        headers: &[(Bytes, Bytes)],
    ) -> Result<(), SessionError> {
        let mut state = self.state.borrow_mut();
        if state.streams.contains_key(&stream_id) {
            return Err(SessionError::Protocol("response submitted twice"));
        }
        state.streams.insert(stream_id, OutStream::default());
        state.submissions.push(Submission::Response {
            stream_id,
            headers: headers.to_vec(),
        });
        Ok(())
    }

    fn submit_rst_stream(
        &mut self,
        stream_id: StreamId,
        status: RstStatus,
    ) -> Result<(), SessionError> {
        let mut state = self.state.borrow_mut();
        state
            .submissions
            .push(Submission::RstStream { stream_id, status });
        // no more frames for a reset stream, and the close surfaces as an
        // event on the next poll
        state.streams.remove(&stream_id);
        state.events.push_back(SessionEvent::StreamClose {
            stream_id,
            status: Some(status),
        });
        Ok(())
    }

    fn submit_window_update(
        &mut self,
        stream_id: StreamId,
        delta: i32,
    ) -> Result<(), SessionError> {
        self.state
            .borrow_mut()
            .submissions
            .push(Submission::WindowUpdate { stream_id, delta });
        Ok(())
    }

    fn resume_data(&mut self, stream_id: StreamId) {
        if let Some(stream) = self.state.borrow_mut().streams.get_mut(&stream_id) {
            stream.deferred = false;
        }
    }

    fn set_auto_window_update(&mut self, enabled: bool) {
        self.state.borrow_mut().auto_window_update = Some(enabled);
    }
}

// --- builders ---

pub fn test_config() -> Config {
    Config {
        server_name: "skein-test".to_string(),
        downstream_authority: "127.0.0.1:8080".to_string(),
        rewrite_authority: "front.example".to_string(),
        ..Default::default()
    }
}

pub fn new_handler(version: SpdyVersion) -> (ClientHandler<ScriptedSession>, SessionHandle) {
    new_handler_with(version, test_config())
}

pub fn new_handler_with(
    version: SpdyVersion,
    config: Config,
) -> (ClientHandler<ScriptedSession>, SessionHandle) {
    tracing_common::setup_tracing();
    let (session, handle) = scripted_session();
    let handler =
        ClientHandler::new(version, session, Rc::new(config)).expect("handler construction");
    (handler, handle)
}

pub fn syn_stream(stream_id: i32, fin: bool, nv: &[(&[u8], &[u8])]) -> SessionEvent {
    SessionEvent::SynStream {
        stream_id: StreamId(stream_id),
        priority: 0,
        fin,
        headers: nv
            .iter()
            .map(|(n, v)| (Bytes::copy_from_slice(n), Bytes::copy_from_slice(v)))
            .collect(),
    }
}

pub fn data(stream_id: i32, fin: bool, payload: &[u8]) -> SessionEvent {
    SessionEvent::Data {
        stream_id: StreamId(stream_id),
        fin,
        data: Bytes::copy_from_slice(payload),
    }
}

pub fn client_rst(stream_id: i32, status: RstStatus) -> SessionEvent {
    SessionEvent::StreamClose {
        stream_id: StreamId(stream_id),
        status: Some(status),
    }
}

// --- driving ---

pub fn drain_actions<S: SpdySession>(handler: &mut ClientHandler<S>) -> Vec<IoAction> {
    let mut actions = Vec::new();
    while let Some(action) = handler.poll_action() {
        actions.push(action);
    }
    actions
}

/// Produces client output until the session has nothing more to say,
/// simulating a client that reads promptly. Returns total bytes produced.
pub fn pump_output<S: SpdySession>(handler: &mut ClientHandler<S>) -> usize {
    let mut total = 0;
    loop {
        let mut out = bytes::BytesMut::new();
        handler
            .produce_client_output(&mut out)
            .expect("produce_client_output");
        if out.is_empty() {
            break;
        }
        total += out.len();
    }
    total
}

pub fn connected_conn<S: SpdySession>(handler: &mut ClientHandler<S>) -> (ConnId, Vec<IoAction>) {
    let actions = drain_actions(handler);
    let conn = actions
        .iter()
        .find_map(|a| match a {
            IoAction::ConnectOrigin { conn, .. } => Some(*conn),
            _ => None,
        })
        .expect("expected a ConnectOrigin action");
    handler.on_origin_connected(conn);
    (conn, actions)
}

// --- assertions ---

pub fn header_value(headers: &[(Bytes, Bytes)], name: &str) -> Option<Bytes> {
    headers
        .iter()
        .find(|(n, _)| n.eq_ignore_ascii_case(name.as_bytes()))
        .map(|(_, v)| v.clone())
}

pub fn has_close_for(actions: &[IoAction], conn: ConnId) -> bool {
    actions
        .iter()
        .any(|a| matches!(a, IoAction::CloseOrigin { conn: c } if *c == conn))
}
