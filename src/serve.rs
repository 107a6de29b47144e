//! The event loop for one client connection.
//!
//! Everything interesting happens in the sans-io core; this module is the
//! plumbing that feeds it: client bytes in, SPDY frames out, one reader
//! future per origin connection, and an action pump translating the core's
//! socket intents into tokio calls. Everything runs on a single task, so
//! per-connection concurrency is one event loop with no locks, exactly
//! what the rest of the design assumes.

use std::collections::HashMap;
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use futures_util::future::LocalBoxFuture;
use futures_util::stream::{FuturesUnordered, StreamExt};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tokio::time::timeout;
use tracing::{debug, trace};

use crate::client_handler::{ClientHandler, IoAction};
use crate::downstream_connection::ConnId;
use crate::error::ServeError;
use crate::session::SpdySession;
use crate::upstream::OUTPUT_UPPER_THRES;

const READ_CHUNK: usize = 16 * 1024;

/// What an origin socket reported back to the event loop.
enum OriginEvent {
    /// Connect finished; here is the write half to flush into.
    Connected(OwnedWriteHalf),
    ConnectFailed,
    Data(Bytes),
    Eof,
    Error(std::io::Error),
    Timeout,
}

struct OriginIo {
    /// None until the connect completes.
    write: Option<OwnedWriteHalf>,
    pause: watch::Sender<bool>,
}

type OriginEventTx = mpsc::UnboundedSender<(ConnId, OriginEvent)>;

/// Serves one already-negotiated client connection until it ends.
///
/// `client` is the transport after TLS and protocol negotiation; `handler`
/// carries the session built for whichever SPDY version was negotiated.
/// Returns cleanly on client EOF; session failures and client I/O errors
/// tear everything down through the error path.
pub async fn serve<S, C>(client: C, mut handler: ClientHandler<S>) -> Result<(), ServeError>
where
    S: SpdySession,
    C: AsyncRead + AsyncWrite + Unpin,
{
    let (mut client_r, mut client_w) = tokio::io::split(client);
    let (ev_tx, mut ev_rx) = mpsc::unbounded_channel::<(ConnId, OriginEvent)>();
    let mut origins: HashMap<ConnId, OriginIo> = HashMap::new();
    let mut tasks: FuturesUnordered<LocalBoxFuture<'static, ()>> = FuturesUnordered::new();
    let mut inbuf = vec![0u8; READ_CHUNK];
    let mut outbuf = BytesMut::new();

    let read_timeout = handler.config().spdy_upstream_read_timeout;
    let write_timeout = handler.config().spdy_upstream_write_timeout;
    let connect_timeout = handler.config().downstream_connect_timeout;
    let origin_read_timeout = handler.config().downstream_read_timeout;

    // the initial SETTINGS frame is already queued in the session
    handler.pump()?;

    let result = 'serve: loop {
        if let Err(err) = pump_actions(
            &mut handler,
            &mut origins,
            &mut tasks,
            &ev_tx,
            connect_timeout,
            origin_read_timeout,
        )
        .await
        {
            break 'serve Err(err);
        }

        outbuf.clear();
        if let Err(err) = handler.produce_client_output(&mut outbuf) {
            break 'serve Err(err);
        }
        // producing output can pause/resume/close origins in turn
        if let Err(err) = pump_actions(
            &mut handler,
            &mut origins,
            &mut tasks,
            &ev_tx,
            connect_timeout,
            origin_read_timeout,
        )
        .await
        {
            break 'serve Err(err);
        }

        if !outbuf.is_empty() {
            trace!(len = outbuf.len(), "writing to client");
            match timeout(write_timeout, client_w.write_all(&outbuf)).await {
                Err(_) => break 'serve Err(ServeError::ClientTimeout),
                Ok(Err(err)) => break 'serve Err(err.into()),
                Ok(Ok(())) => {}
            }
            if outbuf.len() > OUTPUT_UPPER_THRES {
                // the session stopped at the watermark with more to say
                continue 'serve;
            }
        }

        tokio::select! {
            res = timeout(read_timeout, client_r.read(&mut inbuf)) => {
                let n = match res {
                    Err(_) => break 'serve Err(ServeError::ClientTimeout),
                    Ok(Err(err)) => break 'serve Err(err.into()),
                    Ok(Ok(n)) => n,
                };
                if n == 0 {
                    debug!("client EOF, shutting down");
                    break 'serve Ok(());
                }
                if let Err(err) = handler.on_client_read(&inbuf[..n]) {
                    break 'serve Err(err);
                }
            }

            ev = ev_rx.recv() => {
                if let Some((conn, event)) = ev {
                    if let Err(err) = handle_origin_event(&mut handler, &mut origins, conn, event).await {
                        break 'serve Err(err);
                    }
                }
            }

            Some(()) = tasks.next(), if !tasks.is_empty() => {
                // a connect or reader future ran to completion; its events
                // are already in the channel
            }
        }
    };

    handler.close();
    // drain the close intents; dropping `origins` closes the sockets and
    // ends any reader still running
    while let Some(action) = handler.poll_action() {
        if let IoAction::CloseOrigin { conn } = action {
            origins.remove(&conn);
        }
    }
    result
}

async fn pump_actions<S: SpdySession>(
    handler: &mut ClientHandler<S>,
    origins: &mut HashMap<ConnId, OriginIo>,
    tasks: &mut FuturesUnordered<LocalBoxFuture<'static, ()>>,
    ev_tx: &OriginEventTx,
    connect_timeout: Duration,
    origin_read_timeout: Duration,
) -> Result<(), ServeError> {
    while let Some(action) = handler.poll_action() {
        trace!(?action, "io action");
        match action {
            IoAction::ConnectOrigin { conn, addr } => {
                let (pause_tx, pause_rx) = watch::channel(false);
                origins.insert(
                    conn,
                    OriginIo {
                        write: None,
                        pause: pause_tx,
                    },
                );
                let ev_tx = ev_tx.clone();
                tasks.push(Box::pin(async move {
                    let stream = match timeout(connect_timeout, TcpStream::connect(addr)).await {
                        Ok(Ok(stream)) => stream,
                        Ok(Err(err)) => {
                            debug!(%conn, %err, "origin connect failed");
                            let _ = ev_tx.send((conn, OriginEvent::ConnectFailed));
                            return;
                        }
                        Err(_) => {
                            debug!(%conn, "origin connect timed out");
                            let _ = ev_tx.send((conn, OriginEvent::ConnectFailed));
                            return;
                        }
                    };
                    let (read, write) = stream.into_split();
                    if ev_tx.send((conn, OriginEvent::Connected(write))).is_err() {
                        return;
                    }
                    origin_read_loop(conn, read, pause_rx, origin_read_timeout, ev_tx).await;
                }));
            }

            IoAction::WriteOrigin { conn } => {
                flush_origin(handler, origins, conn).await?;
            }

            IoAction::PauseOriginRead { conn } => {
                if let Some(io) = origins.get(&conn) {
                    let _ = io.pause.send(true);
                }
            }

            IoAction::ResumeOriginRead { conn } => {
                if let Some(io) = origins.get(&conn) {
                    let _ = io.pause.send(false);
                }
            }

            IoAction::CloseOrigin { conn } => {
                trace!(%conn, "closing origin connection");
                // dropping the write half and the pause sender shuts the
                // reader down
                origins.remove(&conn);
            }
        }
    }
    Ok(())
}

/// Writes whatever the core queued for `conn` and reports the writable
/// edge back. A write error is this connection's problem, not the
/// client's: it goes back into the core as an origin failure.
async fn flush_origin<S: SpdySession>(
    handler: &mut ClientHandler<S>,
    origins: &mut HashMap<ConnId, OriginIo>,
    conn: ConnId,
) -> Result<(), ServeError> {
    let Some(io) = origins.get_mut(&conn) else {
        return Ok(());
    };
    let Some(write) = io.write.as_mut() else {
        // not connected yet; flushed when Connected arrives
        return Ok(());
    };
    let Some(data) = handler.take_origin_output(conn) else {
        return Ok(());
    };
    trace!(%conn, len = data.len(), "writing to origin");
    if let Err(err) = write.write_all(&data).await {
        debug!(%conn, %err, "origin write failed");
        handler.on_origin_error(conn)?;
        return Ok(());
    }
    handler.on_origin_flushed(conn)?;
    Ok(())
}

async fn handle_origin_event<S: SpdySession>(
    handler: &mut ClientHandler<S>,
    origins: &mut HashMap<ConnId, OriginIo>,
    conn: ConnId,
    event: OriginEvent,
) -> Result<(), ServeError> {
    match event {
        OriginEvent::Connected(write) => {
            let Some(io) = origins.get_mut(&conn) else {
                // discarded while connecting; the socket just drops
                return Ok(());
            };
            io.write = Some(write);
            handler.on_origin_connected(conn);
            flush_origin(handler, origins, conn).await?;
        }
        OriginEvent::ConnectFailed => {
            origins.remove(&conn);
            handler.on_origin_connect_fail(conn)?;
        }
        OriginEvent::Data(data) => {
            handler.on_origin_read(conn, &data)?;
        }
        OriginEvent::Eof => {
            handler.on_origin_eof(conn)?;
        }
        OriginEvent::Error(err) => {
            debug!(%conn, %err, "origin read failed");
            handler.on_origin_error(conn)?;
        }
        OriginEvent::Timeout => {
            handler.on_origin_timeout(conn)?;
        }
    }
    Ok(())
}

/// Reads one origin socket until it ends, reporting everything as events.
/// Pausing parks the loop between reads; a dropped pause sender means the
/// connection was discarded and the reader should just go away.
async fn origin_read_loop(
    conn: ConnId,
    mut read: OwnedReadHalf,
    mut pause: watch::Receiver<bool>,
    read_timeout: Duration,
    ev_tx: OriginEventTx,
) {
    let mut buf = vec![0u8; READ_CHUNK];
    loop {
        loop {
            let paused = *pause.borrow_and_update();
            if !paused {
                break;
            }
            if pause.changed().await.is_err() {
                return;
            }
        }

        tokio::select! {
            changed = pause.changed() => {
                if changed.is_err() {
                    return;
                }
                // pause state flipped; re-evaluate before reading
                continue;
            }
            res = timeout(read_timeout, read.read(&mut buf)) => {
                match res {
                    Err(_) => {
                        let _ = ev_tx.send((conn, OriginEvent::Timeout));
                        return;
                    }
                    Ok(Ok(0)) => {
                        let _ = ev_tx.send((conn, OriginEvent::Eof));
                        return;
                    }
                    Ok(Ok(n)) => {
                        let _ = ev_tx.send((conn, OriginEvent::Data(Bytes::copy_from_slice(&buf[..n]))));
                    }
                    Ok(Err(err)) => {
                        let _ = ev_tx.send((conn, OriginEvent::Error(err)));
                        return;
                    }
                }
            }
        }
    }
}
