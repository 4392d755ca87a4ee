//! Per-connection task.
//!
//! A connection reads from its socket, feeds a [`Request`] until the
//! command is complete, writes the response, and starts over. Bytes that
//! arrived after a command (pipelining) are kept and fed to the next one.
//! Every read and write also races the manager's stop signal.

use super::manager::{ConnectionId, ConnectionManager, Registration};
use crate::metrics::Metrics;
use crate::protocol::{ProtocolError, Request, State};
use crate::store::Store;
use bytes::{Buf, BytesMut};
use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::Notify;
use tokio::time::{timeout_at, Instant};
use tracing::{debug, trace};

/// Read buffer size
pub const READ_BUFFER_SIZE: usize = 8 * 1024;

/// Per-connection limits.
#[derive(Debug, Clone, Default)]
pub struct ConnectionConfig {
    /// Deadline for receiving one whole command. `None` waits forever.
    pub read_timeout: Option<Duration>,
    /// Deadline for writing one response. `None` waits forever.
    pub write_timeout: Option<Duration>,
    /// Maximum bytes one command may span (0 = unlimited).
    pub max_request_bytes: usize,
}

/// State shared by every connection of a server.
#[derive(Clone)]
pub struct ConnectionContext {
    pub store: Option<Arc<dyn Store>>,
    pub metrics: Arc<dyn Metrics>,
    pub manager: Arc<ConnectionManager>,
    pub config: ConnectionConfig,
}

/// Why a connection ended without a response.
#[derive(Debug, Error)]
pub enum ConnectionError {
    #[error("read timed out")]
    ReadTimeout,

    #[error("write timed out")]
    WriteTimeout,

    #[error("connection closed mid-request")]
    UnexpectedEof,

    #[error("connection stopped")]
    Stopped,

    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

/// A client connection over any byte stream.
pub struct Connection<S> {
    id: ConnectionId,
    peer: SocketAddr,
    stream: S,
    buffer: BytesMut,
    request: Request,
    stop: Arc<Notify>,
    manager: Arc<ConnectionManager>,
    metrics: Arc<dyn Metrics>,
    config: ConnectionConfig,
}

impl<S> Connection<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    pub fn new(
        stream: S,
        peer: SocketAddr,
        registration: Registration,
        ctx: &ConnectionContext,
    ) -> Self {
        Self {
            id: registration.id,
            peer,
            stream,
            buffer: BytesMut::with_capacity(READ_BUFFER_SIZE),
            request: Request::new(
                ctx.store.clone(),
                Arc::clone(&ctx.metrics),
                ctx.config.max_request_bytes,
            ),
            stop: registration.stop,
            manager: Arc::clone(&ctx.manager),
            metrics: Arc::clone(&ctx.metrics),
            config: ctx.config.clone(),
        }
    }

    #[cfg(test)]
    pub fn id(&self) -> ConnectionId {
        self.id
    }

    /// Serve commands until the client quits, an error occurs, or the
    /// manager stops this connection. Always deregisters and closes.
    pub async fn run(mut self) {
        debug!(conn = %self.id, peer = %self.peer, "Connection opened");

        match self.serve().await {
            Ok(()) => debug!(conn = %self.id, peer = %self.peer, "Connection closed"),
            Err(e) => debug!(conn = %self.id, peer = %self.peer, error = %e, "Connection closed"),
        }

        self.manager.stop(self.id);
        self.close().await;
    }

    async fn serve(&mut self) -> Result<(), ConnectionError> {
        loop {
            let deadline = self.config.read_timeout.map(|t| Instant::now() + t);
            let Some(started) = self.read_request(deadline).await? else {
                trace!(conn = %self.id, "Connection closed by client");
                return Ok(());
            };

            if self.request.state() == State::Quitting {
                trace!(conn = %self.id, "Client quit");
                return Ok(());
            }

            if !self.request.no_reply() {
                self.write_response().await?;
            }
            self.metrics
                .timer("request.duration_ms", started.elapsed().as_millis() as u64);

            let close = self.request.close_after_response();
            self.request.reset();
            if close {
                return Ok(());
            }
        }
    }

    /// Read until the request is complete.
    ///
    /// Returns when the first byte of the command was seen, or `None` if
    /// the client closed the connection between commands.
    async fn read_request(
        &mut self,
        deadline: Option<Instant>,
    ) -> Result<Option<Instant>, ConnectionError> {
        let mut started = None;

        loop {
            if !self.buffer.is_empty() {
                started.get_or_insert_with(Instant::now);
                let consumed = self.request.process(&self.buffer);
                self.buffer.advance(consumed);
                if self.request.is_terminal() {
                    return Ok(started);
                }
            }

            self.buffer.reserve(READ_BUFFER_SIZE);
            let n = guarded(
                &self.stop,
                deadline,
                ConnectionError::ReadTimeout,
                self.stream.read_buf(&mut self.buffer),
            )
            .await?;

            if n == 0 {
                let idle =
                    self.request.state() == State::Command && self.request.buffer().is_empty();
                return if idle {
                    Ok(None)
                } else {
                    Err(ConnectionError::UnexpectedEof)
                };
            }
        }
    }

    async fn write_response(&mut self) -> Result<(), ConnectionError> {
        let deadline = self.config.write_timeout.map(|t| Instant::now() + t);
        let response = self.request.response()?;
        let stream = &mut self.stream;

        guarded(&self.stop, deadline, ConnectionError::WriteTimeout, async move {
            stream.write_all(response).await?;
            stream.flush().await
        })
        .await
    }

    async fn close(mut self) {
        // Shutdown fails on a socket the peer already reset
        let _ = self.stream.shutdown().await;
    }
}

/// Run `op` under an optional deadline, giving up early if `stop` fires.
async fn guarded<F, T>(
    stop: &Notify,
    deadline: Option<Instant>,
    on_timeout: ConnectionError,
    op: F,
) -> Result<T, ConnectionError>
where
    F: Future<Output = io::Result<T>>,
{
    let op = async move {
        match deadline {
            Some(deadline) => match timeout_at(deadline, op).await {
                Ok(result) => result.map_err(ConnectionError::from),
                Err(_) => Err(on_timeout),
            },
            None => op.await.map_err(ConnectionError::from),
        }
    };

    tokio::select! {
        result = op => result,
        () = stop.notified() => Err(ConnectionError::Stopped),
    }
}
