//! skein terminates SPDY (versions 2 and 3) from clients and speaks plain
//! HTTP/1.1 to an origin server: each SPDY stream becomes one origin
//! exchange, with the response streamed back on the same stream.
//!
//! This crate is the upstream translation core. The pieces:
//!
//! - [`SpdyUpstream`] drives a [`session::SpdySession`] and translates in
//!   both directions,
//! - [`Downstream`] holds the per-stream bridge state,
//! - [`DownstreamConnection`] is one (possibly pooled) origin connection,
//! - [`ClientHandler`] ties those together for one client connection and
//!   exposes the event surface,
//! - [`serve()`] is the tokio event loop feeding that surface.
//!
//! TLS termination, protocol negotiation, and the SPDY wire codec live
//! outside: the embedder accepts and negotiates, then hands [`serve()`] a
//! transport plus a session speaking the negotiated version.

mod client_handler;
mod config;
mod downstream;
mod downstream_connection;
mod downstream_queue;
mod error;
pub mod h1;
mod io_control;
mod rewrite;
mod serve;
pub mod session;
mod types;
mod upstream;

pub use client_handler::{ClientHandler, IoAction};
pub use config::Config;
pub use downstream::{Downstream, DownstreamState};
pub use downstream_connection::{AttachError, ConnId, DownstreamConnection};
pub use downstream_queue::DownstreamQueue;
pub use error::ServeError;
pub use io_control::{IoControl, IoCtrlReason};
pub use serve::serve;
pub use types::Headers;
pub use upstream::SpdyUpstream;
