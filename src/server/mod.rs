//! TCP front end.
//!
//! Accepts client connections, registers each with the
//! [`ConnectionManager`] and runs it as its own task. The worker pool is
//! the tokio multi-thread runtime the server is started on; all
//! connections share its reactor.

mod connection;
mod manager;

pub use connection::{Connection, ConnectionConfig, ConnectionContext};
pub use manager::ConnectionManager;

use crate::metrics::Metrics;
use crate::store::Store;
use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

/// Pending connections the kernel will queue
const LISTEN_BACKLOG: i32 = 1024;

/// Pause after a failed accept (e.g. out of file descriptors)
const ACCEPT_BACKOFF: Duration = Duration::from_millis(10);

/// Create the listening socket.
///
/// Must be called from within a tokio runtime.
pub fn bind(addr: SocketAddr) -> io::Result<TcpListener> {
    let socket = socket2::Socket::new(
        match addr {
            SocketAddr::V4(_) => socket2::Domain::IPV4,
            SocketAddr::V6(_) => socket2::Domain::IPV6,
        },
        socket2::Type::STREAM,
        Some(socket2::Protocol::TCP),
    )?;

    socket.set_reuse_address(true)?;
    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;
    socket.listen(LISTEN_BACKLOG)?;

    TcpListener::from_std(socket.into())
}

/// Server instance
pub struct Server {
    ctx: ConnectionContext,
}

impl Server {
    pub fn new(
        store: Option<Arc<dyn Store>>,
        metrics: Arc<dyn Metrics>,
        config: ConnectionConfig,
    ) -> Self {
        let manager = Arc::new(ConnectionManager::new(Arc::clone(&metrics)));
        Server {
            ctx: ConnectionContext {
                store,
                metrics,
                manager,
                config,
            },
        }
    }

    /// Get a reference to the connection manager for testing
    #[cfg(test)]
    pub fn manager(&self) -> &Arc<ConnectionManager> {
        &self.ctx.manager
    }

    /// Accept connections until `shutdown` resolves, then stop every
    /// connection and wait for their tasks to finish.
    pub async fn serve<F>(&self, listener: TcpListener, shutdown: F)
    where
        F: Future<Output = ()>,
    {
        if let Ok(addr) = listener.local_addr() {
            info!(address = %addr, "Server listening");
        }

        tokio::pin!(shutdown);
        let mut tasks = JoinSet::new();

        loop {
            tokio::select! {
                () = &mut shutdown => break,
                accepted = listener.accept() => match accepted {
                    Ok((stream, peer)) => self.spawn_connection(&mut tasks, stream, peer),
                    Err(e) => {
                        error!(error = %e, "Failed to accept connection");
                        tokio::time::sleep(ACCEPT_BACKOFF).await;
                    }
                },
                Some(joined) = tasks.join_next(), if !tasks.is_empty() => {
                    if let Err(e) = joined {
                        warn!(error = %e, "Connection task failed");
                    }
                }
            }
        }

        drop(listener);
        let stopped = self.ctx.manager.stop_all();
        info!(connections = stopped, "Shutting down, stopping connections");

        while let Some(joined) = tasks.join_next().await {
            if let Err(e) = joined {
                warn!(error = %e, "Connection task failed");
            }
        }
        info!("Server stopped");
    }

    fn spawn_connection(&self, tasks: &mut JoinSet<()>, stream: TcpStream, peer: SocketAddr) {
        if let Err(e) = stream.set_nodelay(true) {
            debug!(peer = %peer, error = %e, "Failed to set TCP_NODELAY");
        }

        let registration = self.ctx.manager.register(peer);
        let conn = Connection::new(stream, peer, registration, &self.ctx);
        tasks.spawn(conn.run());
    }
}

/// Resolves on SIGINT or SIGTERM.
pub async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "Failed to listen for SIGINT");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => info!("Received SIGINT, shutting down"),
        () = terminate => info!("Received SIGTERM, shutting down"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::NullMetrics;
    use crate::store::{MemoryStore, StoreConfig};
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::sync::oneshot;

    struct Running {
        addr: SocketAddr,
        server: Arc<Server>,
        shutdown: oneshot::Sender<()>,
        handle: tokio::task::JoinHandle<()>,
    }

    fn start(config: ConnectionConfig) -> Running {
        let listener = bind("127.0.0.1:0".parse().unwrap()).unwrap();
        let addr = listener.local_addr().unwrap();
        let store = MemoryStore::new(&StoreConfig::default(), NullMetrics::shared());
        let server = Arc::new(Server::new(Some(store), NullMetrics::shared(), config));
        let (shutdown, rx) = oneshot::channel::<()>();

        let serving = Arc::clone(&server);
        let handle = tokio::spawn(async move {
            serving
                .serve(listener, async {
                    let _ = rx.await;
                })
                .await;
        });

        Running {
            addr,
            server,
            shutdown,
            handle,
        }
    }

    async fn read_exactly(stream: &mut TcpStream, len: usize) -> Vec<u8> {
        let mut buf = vec![0u8; len];
        stream.read_exact(&mut buf).await.unwrap();
        buf
    }

    #[tokio::test]
    async fn test_bind_reports_local_addr() {
        let listener = bind("127.0.0.1:0".parse().unwrap()).unwrap();
        let addr = listener.local_addr().unwrap();
        assert_ne!(addr.port(), 0);
    }

    #[tokio::test]
    async fn test_end_to_end_session() {
        let running = start(ConnectionConfig::default());
        let mut client = TcpStream::connect(running.addr).await.unwrap();

        client.write_all(b"set greeting 0 0 5\r\nhello\r\n").await.unwrap();
        assert_eq!(read_exactly(&mut client, 8).await, b"STORED\r\n");

        client.write_all(b"add greeting 0 0 3\r\nbye\r\n").await.unwrap();
        assert_eq!(read_exactly(&mut client, 12).await, b"NOT_STORED\r\n");

        let expected = b"VALUE greeting 0 5\r\nhello\r\nEND\r\n";
        client.write_all(b"get greeting\r\n").await.unwrap();
        assert_eq!(read_exactly(&mut client, expected.len()).await, expected);

        client.write_all(b"delete greeting\r\n").await.unwrap();
        assert_eq!(read_exactly(&mut client, 9).await, b"DELETED\r\n");

        client.write_all(b"quit\r\n").await.unwrap();
        let mut rest = Vec::new();
        client.read_to_end(&mut rest).await.unwrap();
        assert!(rest.is_empty());

        running.shutdown.send(()).unwrap();
        running.handle.await.unwrap();
    }

    #[tokio::test]
    async fn test_clients_share_the_store() {
        let running = start(ConnectionConfig::default());
        let mut writer = TcpStream::connect(running.addr).await.unwrap();
        let mut reader = TcpStream::connect(running.addr).await.unwrap();

        writer.write_all(b"set shared 0 0 2\r\nok\r\n").await.unwrap();
        assert_eq!(read_exactly(&mut writer, 8).await, b"STORED\r\n");

        let expected = b"VALUE shared 0 2\r\nok\r\nEND\r\n";
        reader.write_all(b"gets shared\r\n").await.unwrap();
        assert_eq!(read_exactly(&mut reader, expected.len()).await, expected);

        running.shutdown.send(()).unwrap();
        running.handle.await.unwrap();
    }

    #[tokio::test]
    async fn test_shutdown_stops_open_connections() {
        let running = start(ConnectionConfig::default());
        let mut clients = Vec::new();
        for _ in 0..3 {
            let mut client = TcpStream::connect(running.addr).await.unwrap();
            client.write_all(b"ping\r\n").await.unwrap();
            assert_eq!(read_exactly(&mut client, 6).await, b"PONG\r\n");
            clients.push(client);
        }
        assert_eq!(running.server.manager().len(), 3);

        running.shutdown.send(()).unwrap();
        tokio::time::timeout(Duration::from_secs(5), running.handle)
            .await
            .expect("serve should return after shutdown")
            .unwrap();
        assert!(running.server.manager().is_empty());

        for mut client in clients {
            let mut rest = Vec::new();
            let _ = client.read_to_end(&mut rest).await;
            assert!(rest.is_empty());
        }
    }

    #[tokio::test]
    async fn test_idle_connection_times_out() {
        let running = start(ConnectionConfig {
            read_timeout: Some(Duration::from_millis(100)),
            ..Default::default()
        });
        let mut client = TcpStream::connect(running.addr).await.unwrap();

        let mut rest = Vec::new();
        tokio::time::timeout(Duration::from_secs(5), client.read_to_end(&mut rest))
            .await
            .expect("server should close the idle connection")
            .unwrap();
        assert!(rest.is_empty());

        running.shutdown.send(()).unwrap();
        running.handle.await.unwrap();
    }
}
