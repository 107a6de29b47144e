//! The boundary to the SPDY session library.
//!
//! The wire codec (framing, header-block compression, version quirks) is
//! not this crate's business. What the translation core needs from a
//! session is narrow: feed it client bytes, drain the events it parsed out
//! of them, submit frames, and let it pull response body bytes lazily per
//! stream. [`SpdySession`] captures exactly that surface.

use std::fmt;

use bytes::Bytes;

/// A SPDY stream identifier. Client-initiated streams are odd and
/// monotonically increasing; the value fits in 31 bits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct StreamId(pub i32);

impl fmt::Display for StreamId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.0, f)
    }
}

/// The SPDY protocol versions this proxy terminates.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpdyVersion {
    V2,
    V3,
}

impl SpdyVersion {
    /// Per-stream flow control only exists in SPDY/3.
    pub fn flow_control(self) -> bool {
        matches!(self, SpdyVersion::V3)
    }

    /// Initial per-stream receive window: 64 KiB as specified by SPDY/3.
    /// SPDY/2 has no windows, so every window operation is a no-op.
    pub fn initial_window_size(self) -> i32 {
        match self {
            SpdyVersion::V2 => 0,
            SpdyVersion::V3 => 64 * 1024,
        }
    }
}

impl fmt::Display for SpdyVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SpdyVersion::V2 => f.write_str("spdy/2"),
            SpdyVersion::V3 => f.write_str("spdy/3"),
        }
    }
}

/// RST_STREAM status codes, as numbered by the SPDY drafts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum RstStatus {
    ProtocolError = 1,
    InvalidStream = 2,
    RefusedStream = 3,
    UnsupportedVersion = 4,
    Cancel = 5,
    InternalError = 6,
    FlowControlError = 7,
}

/// SETTINGS identifiers, as numbered by the SPDY drafts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum SettingsId {
    UploadBandwidth = 1,
    DownloadBandwidth = 2,
    RoundTripTime = 3,
    MaxConcurrentStreams = 4,
    CurrentCwnd = 5,
    DownloadRetransRate = 6,
    InitialWindowSize = 7,
    ClientCertificateVectorSize = 8,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SettingsEntry {
    pub id: SettingsId,
    pub value: u32,
}

/// An event the session parsed out of client input.
#[derive(Debug)]
pub enum SessionEvent {
    /// SYN_STREAM: the client opened a stream. `headers` is the raw
    /// name/value block in wire order, `:`-prefixed pairs included.
    SynStream {
        stream_id: StreamId,
        priority: u8,
        fin: bool,
        headers: Vec<(Bytes, Bytes)>,
    },

    /// A chunk of request body on an open stream.
    Data {
        stream_id: StreamId,
        fin: bool,
        data: Bytes,
    },

    /// The stream is done, successfully (`None`) or not. Locally submitted
    /// RST_STREAMs surface here too, once the session has acted on them.
    StreamClose {
        stream_id: StreamId,
        status: Option<RstStatus>,
    },
}

/// Outcome of offering a frame to the client-side output.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SinkResult {
    Accepted,
    /// The output buffer is above its watermark; stop producing until the
    /// next writable edge.
    WouldBlock,
}

/// Where the session writes the frames it produces.
pub trait FrameSink {
    fn accept(&mut self, frame: &[u8]) -> SinkResult;
}

/// Result of pulling response body bytes for one stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DataPull {
    /// `n` bytes were written into the buffer; more may follow.
    Data(usize),
    /// `n` bytes were written and the stream's response body is finished.
    Fin(usize),
    /// Nothing available yet. The session must not pull this stream again
    /// until [`SpdySession::resume_data`] is called for it.
    Deferred,
}

/// Supplies response body bytes, resolved by stream id at pull time.
pub trait DataSource {
    fn pull(&mut self, stream_id: StreamId, buf: &mut [u8]) -> DataPull;
}

#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum SessionError {
    /// The peer violated the protocol in a way that poisons the whole
    /// session (stream-level violations are reported as events instead).
    #[error("spdy protocol error: {0}")]
    Protocol(&'static str),

    /// The session library failed internally; the connection is done for.
    #[error("spdy session failure: {0}")]
    Fatal(String),
}

/// A server-mode SPDY session.
///
/// Implementations own all wire concerns. The contract the translation core
/// relies on:
///
/// - [`recv`](Self::recv) consumes client bytes; everything parsed becomes an
///   event retrievable through [`poll_event`](Self::poll_event).
/// - [`submit_response`](Self::submit_response) may be called at most once
///   per stream and registers the stream with the [`DataSource`] passed to
///   subsequent [`send`](Self::send) calls.
/// - [`send`](Self::send) writes queued frames into the sink until there is
///   nothing left or the sink reports [`SinkResult::WouldBlock`]. A
///   [`DataPull::Deferred`] answer parks the stream until
///   [`resume_data`](Self::resume_data).
/// - a submitted RST_STREAM eventually produces a
///   [`SessionEvent::StreamClose`] for the same stream.
pub trait SpdySession {
    fn recv(&mut self, input: &[u8]) -> Result<(), SessionError>;

    fn poll_event(&mut self) -> Option<SessionEvent>;

    fn send(
        &mut self,
        sink: &mut dyn FrameSink,
        source: &mut dyn DataSource,
    ) -> Result<(), SessionError>;

    fn submit_settings(&mut self, entries: &[SettingsEntry]) -> Result<(), SessionError>;

    fn submit_response(
        &mut self,
        stream_id: StreamId,
        headers: &[(Bytes, Bytes)],
    ) -> Result<(), SessionError>;

    fn submit_rst_stream(
        &mut self,
        stream_id: StreamId,
        status: RstStatus,
    ) -> Result<(), SessionError>;

    fn submit_window_update(&mut self, stream_id: StreamId, delta: i32)
        -> Result<(), SessionError>;

    fn resume_data(&mut self, stream_id: StreamId);

    /// SPDY/3 sessions update peer windows automatically unless told not
    /// to; the proxy amortizes WINDOW_UPDATE itself and always disables it.
    fn set_auto_window_update(&mut self, enabled: bool);
}
