use std::collections::VecDeque;
use std::net::SocketAddr;
use std::rc::Rc;

use bytes::{Bytes, BytesMut};
use tracing::{debug, trace};

use crate::config::Config;
use crate::downstream_connection::{ConnId, DownstreamConnection};
use crate::error::ServeError;
use crate::session::{SpdySession, SpdyVersion};
use crate::upstream::SpdyUpstream;

/// A socket intent the core wants the event loop to carry out.
///
/// The core never touches sockets itself; it queues these and the driver
/// drains them after every entry point.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IoAction {
    /// Start connecting `conn` to the origin.
    ConnectOrigin { conn: ConnId, addr: SocketAddr },
    /// `conn` has queued request bytes; flush them to the socket.
    WriteOrigin { conn: ConnId },
    /// Stop reading from `conn` until resumed.
    PauseOriginRead { conn: ConnId },
    ResumeOriginRead { conn: ConnId },
    /// `conn` is gone; close and forget its socket.
    CloseOrigin { conn: ConnId },
}

/// Idle keep-alive origin connections, plus the id counter for new ones.
pub(crate) struct DconnPool {
    idle: Vec<DownstreamConnection>,
    max: usize,
    addr: SocketAddr,
    next_id: u64,
}

impl DconnPool {
    fn new(addr: SocketAddr, max: usize) -> Self {
        Self {
            idle: Vec::new(),
            max,
            addr,
            next_id: 0,
        }
    }

    /// An arbitrary pooled connection if there is one, else a fresh one
    /// that still has to connect (the driver gets a ConnectOrigin intent).
    pub(crate) fn get(&mut self, actions: &mut VecDeque<IoAction>) -> DownstreamConnection {
        if let Some(conn) = self.idle.pop() {
            trace!(conn = %conn.id(), "reusing pooled origin connection");
            return conn;
        }
        let id = ConnId::new(self.next_id);
        self.next_id += 1;
        debug!(conn = %id, addr = %self.addr, "opening origin connection");
        actions.push_back(IoAction::ConnectOrigin {
            conn: id,
            addr: self.addr,
        });
        DownstreamConnection::new(id, self.addr)
    }

    /// Parks a detached connection for reuse; a full pool closes it instead.
    pub(crate) fn pool(
        &mut self,
        conn: DownstreamConnection,
        actions: &mut VecDeque<IoAction>,
    ) {
        if self.idle.len() >= self.max {
            debug!(conn = %conn.id(), "pool full, closing origin connection");
            actions.push_back(IoAction::CloseOrigin { conn: conn.id() });
            return;
        }
        trace!(conn = %conn.id(), "pooling origin connection");
        self.idle.push(conn);
    }

    pub(crate) fn remove(&mut self, conn: ConnId, actions: &mut VecDeque<IoAction>) -> bool {
        let Some(pos) = self.idle.iter().position(|c| c.id() == conn) else {
            return false;
        };
        self.idle.swap_remove(pos);
        actions.push_back(IoAction::CloseOrigin { conn });
        true
    }

    pub(crate) fn contains(&self, conn: ConnId) -> bool {
        self.idle.iter().any(|c| c.id() == conn)
    }

    pub(crate) fn len(&self) -> usize {
        self.idle.len()
    }

    fn clear(&mut self, actions: &mut VecDeque<IoAction>) {
        for conn in self.idle.drain(..) {
            actions.push_back(IoAction::CloseOrigin { conn: conn.id() });
        }
    }
}

/// Owns everything belonging to one client connection: the SPDY upstream
/// (which owns the session and every live stream) and the idle origin
/// connection pool.
///
/// This is also the event surface the driver talks to. Every entry point
/// may queue [`IoAction`]s; the driver drains them with
/// [`poll_action`](Self::poll_action) afterwards.
pub struct ClientHandler<S: SpdySession> {
    upstream: SpdyUpstream<S>,
    pool: DconnPool,
}

impl<S: SpdySession> ClientHandler<S> {
    /// Builds the handler and submits the initial SETTINGS frame through
    /// the session.
    pub fn new(
        version: SpdyVersion,
        session: S,
        config: Rc<Config>,
    ) -> Result<Self, ServeError> {
        let pool = DconnPool::new(config.downstream_addr, config.downstream_pool_max);
        let upstream = SpdyUpstream::new(version, session, config)?;
        Ok(Self { upstream, pool })
    }

    pub fn config(&self) -> &Rc<Config> {
        self.upstream.config()
    }

    /// Bytes arrived on the client socket.
    pub fn on_client_read(&mut self, data: &[u8]) -> Result<(), ServeError> {
        self.upstream.on_client_read(data, &mut self.pool)
    }

    /// Handles any session events already pending (e.g. right after
    /// construction, before the first client read).
    pub fn pump(&mut self) -> Result<(), ServeError> {
        self.upstream.drain_session(&mut self.pool)
    }

    /// Produces SPDY output for the client, up to the output watermark.
    pub fn produce_client_output(&mut self, out: &mut BytesMut) -> Result<(), ServeError> {
        self.upstream.produce_output(out, &mut self.pool)
    }

    pub fn poll_action(&mut self) -> Option<IoAction> {
        self.upstream.poll_action()
    }

    /// Request bytes queued for `conn`, if it still exists.
    pub fn take_origin_output(&mut self, conn: ConnId) -> Option<Bytes> {
        self.upstream.take_origin_output(conn)
    }

    pub fn on_origin_connected(&mut self, conn: ConnId) {
        self.upstream.on_origin_connected(conn);
    }

    pub fn on_origin_read(&mut self, conn: ConnId, data: &[u8]) -> Result<(), ServeError> {
        self.upstream.on_origin_read(&mut self.pool, conn, data)
    }

    /// The origin socket drained its queued bytes (a writable edge).
    pub fn on_origin_flushed(&mut self, conn: ConnId) -> Result<(), ServeError> {
        self.upstream.on_origin_flushed(conn)
    }

    pub fn on_origin_eof(&mut self, conn: ConnId) -> Result<(), ServeError> {
        self.upstream.on_origin_eof(&mut self.pool, conn)
    }

    pub fn on_origin_error(&mut self, conn: ConnId) -> Result<(), ServeError> {
        self.upstream
            .on_origin_failure(&mut self.pool, conn, /* timeout */ false)
    }

    pub fn on_origin_timeout(&mut self, conn: ConnId) -> Result<(), ServeError> {
        self.upstream
            .on_origin_failure(&mut self.pool, conn, /* timeout */ true)
    }

    pub fn on_origin_connect_fail(&mut self, conn: ConnId) -> Result<(), ServeError> {
        self.upstream.on_origin_connect_fail(&mut self.pool, conn)
    }

    /// Tears down every live stream and the idle pool. After this the
    /// stream queue is empty and every origin connection has a CloseOrigin
    /// intent queued.
    pub fn close(&mut self) {
        debug!("closing client handler");
        self.upstream.shutdown();
        self.pool.clear(self.upstream.actions_mut());
    }

    pub fn active_streams(&self) -> usize {
        self.upstream.queue_len()
    }

    pub fn pooled_connections(&self) -> usize {
        self.pool.len()
    }
}
