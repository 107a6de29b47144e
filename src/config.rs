use std::net::SocketAddr;
use std::time::Duration;

/// Proxy configuration, captured once at [`ClientHandler`] construction and
/// immutable afterwards.
///
/// Loading this from files or flags is the embedder's business.
///
/// [`ClientHandler`]: crate::ClientHandler
#[derive(Debug, Clone)]
pub struct Config {
    /// Advertised in synthesized responses and appended to `via`.
    pub server_name: String,

    /// Sent to the client in the initial SETTINGS frame.
    pub spdy_max_concurrent_streams: u32,

    /// Client-side socket timeouts.
    pub spdy_upstream_read_timeout: Duration,
    pub spdy_upstream_write_timeout: Duration,

    /// Where origin connections go.
    pub downstream_addr: SocketAddr,

    /// Authority the origin knows itself by; `location` values carrying it
    /// are rewritten to `rewrite_authority`.
    pub downstream_authority: String,
    pub rewrite_authority: String,

    /// Origin-side socket timeouts. A read timeout on an origin that has
    /// not finished its response surfaces as a 504.
    pub downstream_read_timeout: Duration,
    pub downstream_write_timeout: Duration,
    pub downstream_connect_timeout: Duration,

    /// Idle keep-alive connections kept per client handler; overflow is
    /// closed instead of parked.
    pub downstream_pool_max: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            server_name: concat!("skein/", env!("CARGO_PKG_VERSION")).to_string(),
            spdy_max_concurrent_streams: 100,
            spdy_upstream_read_timeout: Duration::from_secs(180),
            spdy_upstream_write_timeout: Duration::from_secs(60),
            downstream_addr: "127.0.0.1:80".parse().unwrap(),
            downstream_authority: "127.0.0.1:80".to_string(),
            rewrite_authority: "localhost".to_string(),
            downstream_read_timeout: Duration::from_secs(120),
            downstream_write_timeout: Duration::from_secs(30),
            downstream_connect_timeout: Duration::from_secs(30),
            downstream_pool_max: 8,
        }
    }
}
