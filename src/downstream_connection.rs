use std::fmt;
use std::net::SocketAddr;

use bytes::{Bytes, BytesMut};
use tracing::trace;

use crate::h1::{ParseError, ResponseEvent, ResponseParser};
use crate::io_control::{IoControl, IoCtrlReason};
use crate::session::StreamId;

/// Identifies one origin connection for its whole life. Ids are never
/// reused within a client handler, so a stale id simply stops resolving.
/// The stream queue plays the same trick with stream ids.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnId(u64);

impl ConnId {
    pub(crate) fn new(id: u64) -> Self {
        Self(id)
    }
}

impl fmt::Display for ConnId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "dconn-{}", self.0)
    }
}

#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum AttachError {
    #[error("connection already attached to stream {0}")]
    AlreadyAttached(StreamId),

    #[error("stream already holds connection {0}")]
    StreamBusy(ConnId),
}

/// One connection to the origin.
///
/// This is the protocol half: queued request bytes waiting for the socket,
/// the incremental response parser, and the read-side pause state. The
/// socket itself lives with the event loop, keyed by [`ConnId`]; connects
/// happen lazily after creation.
pub struct DownstreamConnection {
    id: ConnId,
    addr: SocketAddr,
    connected: bool,
    attached: Option<StreamId>,
    write_buf: BytesMut,
    parser: ResponseParser,
    ioctrl: IoControl,
}

impl DownstreamConnection {
    pub(crate) fn new(id: ConnId, addr: SocketAddr) -> Self {
        Self {
            id,
            addr,
            connected: false,
            attached: None,
            write_buf: BytesMut::new(),
            parser: ResponseParser::new(false),
            ioctrl: IoControl::new(),
        }
    }

    pub fn id(&self) -> ConnId {
        self.id
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn is_connected(&self) -> bool {
        self.connected
    }

    pub(crate) fn set_connected(&mut self) {
        self.connected = true;
    }

    pub fn attached_stream(&self) -> Option<StreamId> {
        self.attached
    }

    pub(crate) fn attach(&mut self, stream_id: StreamId) -> Result<(), AttachError> {
        if let Some(existing) = self.attached {
            return Err(AttachError::AlreadyAttached(existing));
        }
        trace!(conn = %self.id, %stream_id, "attaching origin connection");
        self.attached = Some(stream_id);
        Ok(())
    }

    /// Unlinks from the stream and clears pause state; used when a
    /// keep-alive connection goes back to the pool.
    pub(crate) fn detach(&mut self) {
        trace!(conn = %self.id, "detaching origin connection");
        self.attached = None;
        self.ioctrl.force_resume_read();
    }

    /// Resets the response parser for a fresh exchange.
    pub(crate) fn start_exchange(&mut self, head_only: bool) {
        self.parser = ResponseParser::new(head_only);
    }

    pub(crate) fn queue_write(&mut self, data: &[u8]) {
        self.write_buf.extend_from_slice(data);
    }

    pub(crate) fn has_pending_write(&self) -> bool {
        !self.write_buf.is_empty()
    }

    /// Hands the queued request bytes to the event loop for the socket.
    pub(crate) fn take_output(&mut self) -> Bytes {
        self.write_buf.split().freeze()
    }

    pub(crate) fn on_read(&mut self, data: &[u8]) -> Result<Vec<ResponseEvent>, ParseError> {
        self.parser.feed(data)
    }

    pub(crate) fn pause_read(&mut self, reason: IoCtrlReason) -> bool {
        self.ioctrl.pause_read(reason)
    }

    pub(crate) fn resume_read(&mut self, reason: IoCtrlReason) -> bool {
        self.ioctrl.resume_read(reason)
    }

    pub fn is_read_paused(&self) -> bool {
        self.ioctrl.is_paused()
    }
}
