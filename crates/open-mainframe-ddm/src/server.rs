//! TCP server for DRDA connections.
//!
//! Listens on a TCP port and spawns a task per client connection.
//! Each connection gets its own [`ConnectionDriver`] around a handler built
//! by the caller's factory.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::BufReader;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio::task::JoinSet;

use crate::config::DrdaServerConfig;
use crate::driver::{CommandHandler, ConnectionDriver};
use crate::error::{DrdaError, DrdaResult};
use crate::stats::ServerStats;

/// How long open connections get to finish their current chain on shutdown.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

/// Requests shutdown of a running [`DrdaServer`].
#[derive(Debug, Clone)]
pub struct ShutdownHandle {
    tx: Arc<watch::Sender<bool>>,
}

impl ShutdownHandle {
    /// Stop accepting connections and close open ones between chains.
    pub fn shutdown(&self) {
        self.tx.send_replace(true);
    }
}

/// A bound DRDA listener.
pub struct DrdaServer {
    listener: TcpListener,
    config: Arc<DrdaServerConfig>,
    stats: Arc<ServerStats>,
    shutdown: Arc<watch::Sender<bool>>,
}

impl DrdaServer {
    /// Bind the configured address.
    pub async fn bind(config: DrdaServerConfig) -> DrdaResult<Self> {
        let bind_addr = config.bind_addr();
        let listener = TcpListener::bind(&bind_addr).await?;
        tracing::info!(
            addr = %bind_addr,
            database = %config.database,
            "DRDA server listening"
        );
        let (tx, _) = watch::channel(false);
        Ok(Self {
            listener,
            config: Arc::new(config),
            stats: Arc::new(ServerStats::new()),
            shutdown: Arc::new(tx),
        })
    }

    pub fn local_addr(&self) -> DrdaResult<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    pub fn stats(&self) -> Arc<ServerStats> {
        Arc::clone(&self.stats)
    }

    pub fn shutdown_handle(&self) -> ShutdownHandle {
        ShutdownHandle {
            tx: Arc::clone(&self.shutdown),
        }
    }

    /// Accept connections until shutdown is requested.
    ///
    /// `factory` builds the command handler for each accepted peer.
    pub async fn run<F, H>(self, factory: F) -> DrdaResult<()>
    where
        F: Fn(SocketAddr) -> H + Send + Sync + 'static,
        H: CommandHandler + 'static,
    {
        let mut shutdown = self.shutdown.subscribe();
        let mut tasks = JoinSet::new();

        loop {
            tokio::select! {
                accepted = self.listener.accept() => match accepted {
                    Ok((stream, peer_addr)) => {
                        tracing::info!(peer = %peer_addr, "DRDA connection accepted");
                        let driver = ConnectionDriver::from_config(factory(peer_addr), &self.config)
                            .with_stats(Arc::clone(&self.stats))
                            .with_shutdown(self.shutdown.subscribe());
                        let guard = ConnectionGuard::new(driver, Arc::clone(&self.stats));
                        tasks.spawn(serve_connection(stream, peer_addr, guard));
                    }
                    Err(e) => {
                        tracing::error!(error = %e, "Failed to accept DRDA connection");
                    }
                },
                Some(_) = tasks.join_next(), if !tasks.is_empty() => {}
                _ = shutdown.wait_for(|stop| *stop) => break,
            }
        }

        tracing::info!(open = tasks.len(), "DRDA server shutting down");
        drop(self.listener);
        let drained = tokio::time::timeout(SHUTDOWN_GRACE, async {
            while tasks.join_next().await.is_some() {}
        })
        .await;
        if drained.is_err() {
            tracing::warn!(open = tasks.len(), "Aborting DRDA connections after grace period");
            tasks.abort_all();
        }
        Ok(())
    }
}

/// Start the DRDA server and run it until shutdown.
///
/// Returns at once when the configuration has the server disabled.
pub async fn start_server<F, H>(config: DrdaServerConfig, factory: F) -> DrdaResult<()>
where
    F: Fn(SocketAddr) -> H + Send + Sync + 'static,
    H: CommandHandler + 'static,
{
    if !config.enabled {
        tracing::info!(addr = %config.bind_addr(), "DRDA server disabled");
        return Ok(());
    }
    DrdaServer::bind(config).await?.run(factory).await
}

/// Counts a connection as active until its task finishes or is aborted.
struct ConnectionGuard<H: CommandHandler> {
    driver: ConnectionDriver<H>,
    stats: Arc<ServerStats>,
}

impl<H: CommandHandler> ConnectionGuard<H> {
    fn new(driver: ConnectionDriver<H>, stats: Arc<ServerStats>) -> Self {
        stats.record_connect();
        Self { driver, stats }
    }
}

impl<H: CommandHandler> Drop for ConnectionGuard<H> {
    fn drop(&mut self) {
        self.stats
            .record_disconnect(self.driver.bytes_received(), self.driver.bytes_sent());
    }
}

/// Drive one client connection and log how it ended.
async fn serve_connection<H: CommandHandler>(
    stream: TcpStream,
    peer_addr: SocketAddr,
    mut guard: ConnectionGuard<H>,
) {
    if let Err(e) = stream.set_nodelay(true) {
        tracing::debug!(peer = %peer_addr, error = %e, "Could not set TCP_NODELAY");
    }
    let (reader, writer) = stream.into_split();

    match guard.driver.run(BufReader::new(reader), writer).await {
        Ok(()) | Err(DrdaError::ConnectionClosed) => {
            tracing::info!(peer = %peer_addr, "DRDA connection closed");
        }
        Err(e @ DrdaError::Syntax { .. }) => {
            tracing::warn!(peer = %peer_addr, error = %e, "DRDA connection dropped");
        }
        Err(e) => {
            tracing::error!(peer = %peer_addr, error = %e, "DRDA connection error");
        }
    }
}
