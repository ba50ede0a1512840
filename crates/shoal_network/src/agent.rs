//! PeerAgent — the peer-side half of the control plane.
//!
//! Runs two independent activities: a fixed-interval heartbeat task keeping
//! the session ONLINE, and the on-demand operations its caller issues
//! (share, remove, list, search, fetch). The agent also owns this peer's
//! [`TransferManager`], serving `<shared_root>/<username>/` and downloading
//! into the same directory.
//!
//! When the coordinator answers `UNAUTHENTICATED` (the session was evicted)
//! the agent logs in again with its stored credentials and replays its
//! local share set before carrying on.

use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::client::ControlClient;
use crate::config::PeerConfig;
use crate::error::NetworkError;
use crate::identity::{SessionToken, validate_file_name};
use crate::message::{Command, FileRecord, Listing, PeerRecord, SearchHit};
use crate::transfer::{LocalDirectory, TransferEvent, TransferManager, TransferSession};

/// State shared between the agent handle and its heartbeat task.
struct AgentState {
    username: String,
    password: String,
    transfer_port: u16,
    client: ControlClient,
    token: RwLock<Option<SessionToken>>,
    /// What this peer believes it shares, replayed after re-authentication.
    shared: Mutex<BTreeMap<String, u64>>,
    /// Serializes re-authentication so concurrent callers log in once.
    reauth: tokio::sync::Mutex<()>,
}

impl AgentState {
    fn token(&self) -> Result<SessionToken, NetworkError> {
        self.token.read().clone().ok_or(NetworkError::Unauthenticated)
    }

    async fn authenticate(&self) -> Result<SessionToken, NetworkError> {
        let data = self
            .client
            .call(Command::Authenticate {
                username: self.username.clone(),
                password: self.password.clone(),
                transfer_port: self.transfer_port,
            })
            .await?;
        let token = SessionToken::from_string(data.trim());
        *self.token.write() = Some(token.clone());
        info!("Authenticated as {} (session {token})", self.username);
        Ok(token)
    }

    /// Log in again after `stale` stopped resolving and re-announce every
    /// shared file. A no-op if someone else already replaced `stale`.
    async fn recover(&self, stale: &SessionToken) -> Result<SessionToken, NetworkError> {
        let _guard = self.reauth.lock().await;
        let current = self.token.read().clone();
        if let Some(current) = current.filter(|t| t != stale) {
            return Ok(current);
        }

        warn!("Session for {} expired, re-authenticating", self.username);
        let token = self.authenticate().await?;
        let shares: Vec<(String, u64)> = self
            .shared
            .lock()
            .iter()
            .map(|(name, size)| (name.clone(), *size))
            .collect();
        for (file_name, size_bytes) in shares {
            self.client
                .call(Command::ShareFile {
                    token: token.clone(),
                    file_name,
                    size_bytes,
                })
                .await?;
        }
        Ok(token)
    }

    /// Issue a token-bearing command, recovering once from an expired session.
    async fn call_authed<F>(&self, make: F) -> Result<String, NetworkError>
    where
        F: Fn(SessionToken) -> Command,
    {
        let token = self.token()?;
        match self.client.call(make(token.clone())).await {
            Err(NetworkError::Unauthenticated) => {
                let fresh = self.recover(&token).await?;
                self.client.call(make(fresh)).await
            }
            other => other,
        }
    }

    async fn heartbeat(&self) -> Result<(), NetworkError> {
        let port = self.transfer_port;
        self.call_authed(|token| Command::Heartbeat {
            token,
            transfer_port: port,
        })
        .await
        .map(|_| ())
    }
}

/// A logged-in peer.
pub struct PeerAgent {
    state: Arc<AgentState>,
    transfer: TransferManager,
    shared_dir: LocalDirectory,
    transfer_addr: SocketAddr,
    shutdown_tx: broadcast::Sender<()>,
    heartbeat_task: Option<JoinHandle<()>>,
}

impl PeerAgent {
    /// Start the transfer listener, authenticate, and begin heartbeating.
    ///
    /// `shared_dir` is the directory served to other peers and the one
    /// downloads land in.
    pub async fn start(
        config: PeerConfig,
        username: impl Into<String>,
        password: impl Into<String>,
        shared_dir: LocalDirectory,
    ) -> Result<Self, NetworkError> {
        let username = username.into();
        shared_dir.ensure_exists().await?;

        let (shutdown_tx, _) = broadcast::channel(4);
        let transfer = TransferManager::new(
            config.transfer.clone(),
            Arc::new(shared_dir.clone()),
            Arc::new(shared_dir.clone()),
        );
        let transfer_addr = transfer
            .start(config.transfer_bind, shutdown_tx.subscribe())
            .await?;

        let client = ControlClient::connect(config.coordinator_addr, config.retry.clone()).await?;
        let state = Arc::new(AgentState {
            username,
            password: password.into(),
            transfer_port: transfer_addr.port(),
            client,
            token: RwLock::new(None),
            shared: Mutex::new(BTreeMap::new()),
            reauth: tokio::sync::Mutex::new(()),
        });

        if let Err(e) = state.authenticate().await {
            let _ = shutdown_tx.send(());
            return Err(e);
        }

        let heartbeat_task = tokio::spawn(Self::heartbeat_loop(
            Arc::clone(&state),
            config.heartbeat_interval,
            shutdown_tx.subscribe(),
        ));

        Ok(Self {
            state,
            transfer,
            shared_dir,
            transfer_addr,
            shutdown_tx,
            heartbeat_task: Some(heartbeat_task),
        })
    }

    pub fn username(&self) -> &str {
        &self.state.username
    }

    pub fn transfer_addr(&self) -> SocketAddr {
        self.transfer_addr
    }

    pub fn shared_dir(&self) -> &LocalDirectory {
        &self.shared_dir
    }

    /// Current session token, if logged in.
    pub fn token(&self) -> Option<SessionToken> {
        self.state.token.read().clone()
    }

    pub fn subscribe_transfers(&self) -> broadcast::Receiver<TransferEvent> {
        self.transfer.subscribe()
    }

    /// Names this agent believes it currently shares.
    pub fn local_shares(&self) -> Vec<String> {
        self.state.shared.lock().keys().cloned().collect()
    }

    /// Send one heartbeat now, outside the periodic schedule.
    pub async fn heartbeat(&self) -> Result<(), NetworkError> {
        self.state.heartbeat().await
    }

    /// Announce a file from the shared directory. Returns its size.
    pub async fn share(&self, file_name: &str) -> Result<u64, NetworkError> {
        let size_bytes = self.shared_dir.file_size(file_name).await?;
        self.state
            .call_authed(|token| Command::ShareFile {
                token,
                file_name: file_name.to_string(),
                size_bytes,
            })
            .await?;
        self.state
            .shared
            .lock()
            .insert(file_name.to_string(), size_bytes);
        info!("Shared {file_name} ({size_bytes} bytes)");
        Ok(size_bytes)
    }

    /// Stop sharing a file. Succeeds even if it was never shared.
    pub async fn remove(&self, file_name: &str) -> Result<(), NetworkError> {
        validate_file_name(file_name)?;
        self.state
            .call_authed(|token| Command::RemoveFile {
                token,
                file_name: file_name.to_string(),
            })
            .await?;
        self.state.shared.lock().remove(file_name);
        info!("Removed {file_name}");
        Ok(())
    }

    pub async fn list_peers(&self) -> Result<Listing<PeerRecord>, NetworkError> {
        let data = self
            .state
            .call_authed(|token| Command::ListPeers { token })
            .await?;
        Listing::decode(&data)
    }

    /// This peer's entries as the coordinator sees them.
    pub async fn list_files(&self) -> Result<Listing<FileRecord>, NetworkError> {
        let data = self
            .state
            .call_authed(|token| Command::ListFiles { token })
            .await?;
        Listing::decode(&data)
    }

    pub async fn search(&self, pattern: &str) -> Result<Listing<SearchHit>, NetworkError> {
        let data = self
            .state
            .call_authed(|token| Command::Search {
                token,
                pattern: pattern.to_string(),
            })
            .await?;
        Listing::decode(&data)
    }

    /// Every other peer that shares exactly `file_name`, best first.
    pub async fn locate(&self, file_name: &str) -> Result<Vec<SearchHit>, NetworkError> {
        validate_file_name(file_name)?;
        let data = self
            .state
            .call_authed(|token| Command::Locate {
                token,
                file_name: file_name.to_string(),
            })
            .await?;
        Ok(Listing::decode(&data)?.items)
    }

    /// Download `file_name` from whichever owner delivers it first.
    ///
    /// Owners are tried in the coordinator's order. Each attempt is a fresh
    /// transfer session; the error from the last attempt is returned if all
    /// of them fail.
    pub async fn fetch(&self, file_name: &str) -> Result<TransferSession, NetworkError> {
        let candidates = self.locate(file_name).await?;
        let mut last_error = NetworkError::NotFound(file_name.to_string());

        for hit in candidates {
            let address = hit.address.transfer_addr();
            debug!("Fetching {file_name} from {} at {address}", hit.owner);
            match self
                .transfer
                .initiate_transfer(address, file_name, &self.state.username)
                .await
            {
                Ok(session) => return Ok(session),
                Err(
                    e @ (NetworkError::NotFound(_)
                    | NetworkError::PeerUnavailable(_)
                    | NetworkError::TransferAborted { .. }
                    | NetworkError::Timeout(_)),
                ) => {
                    warn!("Fetch of {file_name} from {} failed: {e}", hit.owner);
                    last_error = e;
                }
                Err(e) => return Err(e),
            }
        }
        Err(last_error)
    }

    /// End the session and stop background work. Logout is best effort: the
    /// coordinator evicts the session on its own if the datagram is lost.
    pub async fn logout(&mut self) {
        let _ = self.shutdown_tx.send(());
        if let Some(task) = self.heartbeat_task.take() {
            let _ = task.await;
        }
        let token = self.state.token.write().take();
        if let Some(token) = token {
            match self.state.client.call(Command::Logout { token }).await {
                Ok(_) => info!("Logged out {}", self.state.username),
                Err(e) => warn!("Logout failed: {e}"),
            }
        }
    }

    async fn heartbeat_loop(
        state: Arc<AgentState>,
        interval: std::time::Duration,
        mut shutdown: broadcast::Receiver<()>,
    ) {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // The first tick fires immediately; authentication just refreshed us.
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    match state.heartbeat().await {
                        Ok(()) => debug!("Heartbeat sent"),
                        Err(NetworkError::PeerUnavailable(e)) => {
                            warn!("Coordinator unreachable: {e}");
                        }
                        Err(e) => warn!("Heartbeat failed: {e}"),
                    }
                }
                _ = shutdown.recv() => {
                    debug!("Heartbeat loop shutting down");
                    break;
                }
            }
        }
    }
}

impl Drop for PeerAgent {
    fn drop(&mut self) {
        let _ = self.shutdown_tx.send(());
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
