use crate::session::SessionError;

/// Any error that ends the whole client connection.
///
/// Per-stream failures never show up here: they are resolved inside the
/// bridge as a synthesized response or an RST_STREAM, and the session keeps
/// going.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum ServeError {
    /// The SPDY session failed fatally; everything it multiplexed dies
    /// with it.
    #[error("spdy session error: {0}")]
    Session(#[from] SessionError),

    /// I/O failure on the client transport.
    #[error("client transport error: {0}")]
    ClientIo(#[from] std::io::Error),

    /// The client transport hit a configured timeout.
    #[error("client transport timed out")]
    ClientTimeout,
}
