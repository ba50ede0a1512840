//! CoordinatorServer — the coordination service process.
//!
//! Owns the session store and file index, a UDP receive loop feeding the
//! [`Dispatcher`], and the liveness sweeper. [`start()`](CoordinatorServer::start)
//! spawns both tasks; [`stop()`](CoordinatorServer::stop) signals them through
//! a broadcast channel and waits for them to finish.

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::UdpSocket;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::config::CoordinatorConfig;
use crate::credentials::CredentialStore;
use crate::directory::DirectoryView;
use crate::dispatcher::Dispatcher;
use crate::error::NetworkError;
use crate::file_index::FileIndex;
use crate::liveness;
use crate::session::SessionStore;

/// The coordination service.
pub struct CoordinatorServer {
    config: CoordinatorConfig,
    sessions: Arc<SessionStore>,
    files: Arc<FileIndex>,
    credentials: Arc<dyn CredentialStore>,
    local_addr: Option<SocketAddr>,
    shutdown_tx: Option<broadcast::Sender<()>>,
    tasks: Vec<JoinHandle<()>>,
}

impl CoordinatorServer {
    pub fn new(config: CoordinatorConfig, credentials: Arc<dyn CredentialStore>) -> Self {
        Self {
            config,
            sessions: Arc::new(SessionStore::new()),
            files: Arc::new(FileIndex::new()),
            credentials,
            local_addr: None,
            shutdown_tx: None,
            tasks: Vec::new(),
        }
    }

    pub fn config(&self) -> &CoordinatorConfig {
        &self.config
    }

    /// The bound control address, once started. Useful when the configured
    /// port was 0.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }

    pub fn is_running(&self) -> bool {
        self.shutdown_tx.is_some()
    }

    /// A read-only view over the live stores.
    pub fn directory(&self) -> DirectoryView {
        DirectoryView::new(Arc::clone(&self.sessions), Arc::clone(&self.files))
    }

    /// Bind the control socket and spawn the receive loop and sweeper.
    pub async fn start(&mut self) -> Result<SocketAddr, NetworkError> {
        if let Some(addr) = self.local_addr.filter(|_| self.is_running()) {
            return Ok(addr);
        }
        self.config
            .validate()
            .map_err(NetworkError::InvalidArgument)?;

        let socket = UdpSocket::bind(self.config.listen_addr).await?;
        let local_addr = socket.local_addr()?;
        let socket = Arc::new(socket);

        let (shutdown_tx, _) = broadcast::channel(4);

        let dispatcher = Arc::new(Dispatcher::new(
            Arc::clone(&self.sessions),
            Arc::clone(&self.files),
            Arc::clone(&self.credentials),
            &self.config,
        ));
        self.tasks.push(tokio::spawn(Self::receive_loop(
            socket,
            dispatcher,
            self.config.max_datagram_bytes,
            shutdown_tx.subscribe(),
        )));

        self.tasks.push(tokio::spawn(liveness::run_sweeper(
            Arc::clone(&self.sessions),
            Arc::clone(&self.files),
            self.config.liveness.clone(),
            shutdown_tx.subscribe(),
        )));

        self.shutdown_tx = Some(shutdown_tx);
        self.local_addr = Some(local_addr);
        info!("Coordinator listening on {local_addr} (udp)");
        Ok(local_addr)
    }

    /// Signal shutdown and wait for the background tasks.
    pub async fn stop(&mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
        for task in self.tasks.drain(..) {
            if let Err(e) = task.await {
                warn!("Coordinator task ended abnormally: {e}");
            }
        }
        info!("Coordinator stopped");
    }

    /// Receive datagrams until shutdown. Each one is handled on the blocking
    /// pool, since Authenticate may run a password hash.
    async fn receive_loop(
        socket: Arc<UdpSocket>,
        dispatcher: Arc<Dispatcher>,
        max_datagram_bytes: usize,
        mut shutdown: broadcast::Receiver<()>,
    ) {
        let mut buf = vec![0u8; max_datagram_bytes];
        loop {
            tokio::select! {
                result = socket.recv_from(&mut buf) => {
                    let (len, source) = match result {
                        Ok(received) => received,
                        Err(e) => {
                            // e.g. ICMP port-unreachable from a vanished peer.
                            debug!("Control socket receive error: {e}");
                            continue;
                        }
                    };
                    let datagram = buf[..len].to_vec();
                    let socket = Arc::clone(&socket);
                    let dispatcher = Arc::clone(&dispatcher);
                    tokio::spawn(async move {
                        let handled = tokio::task::spawn_blocking(move || {
                            dispatcher.handle_datagram(&datagram, source)
                        })
                        .await;
                        let reply = match handled {
                            Ok(Some(reply)) => reply,
                            Ok(None) => return,
                            Err(e) => {
                                error!("Handler for datagram from {source} failed: {e}");
                                return;
                            }
                        };
                        if let Err(e) = socket.send_to(&reply, source).await {
                            error!("Failed to send reply to {source}: {e}");
                        }
                    });
                }
                _ = shutdown.recv() => {
                    debug!("Control receive loop shutting down");
                    break;
                }
            }
        }
    }
}

impl Drop for CoordinatorServer {
    fn drop(&mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
