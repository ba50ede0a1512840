//! Control-plane dispatcher — classifies datagrams and handles each command.
//!
//! Every command except Authenticate needs a token that resolves to a live
//! session; otherwise the reply is `FAIL UNAUTHENTICATED` and nothing is
//! touched. Every mutating command is safe to replay: a retried
//! Authenticate (same source, same seq) gets the token minted the first time.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::config::CoordinatorConfig;
use crate::credentials::CredentialStore;
use crate::directory::DirectoryView;
use crate::file_index::{FileIndex, Upsert};
use crate::identity::{
    PeerAddress, PeerId, SessionToken, validate_file_name, validate_pattern, validate_username,
};
use crate::message::{Command, FailReason, Reply, ReplyData, Request};
use crate::session::{PeerStatus, SessionStore, SessionTable};

/// Room reserved in a reply for `OK <seq> ` ahead of the data.
const REPLY_HEADER_RESERVE: usize = 32;

/// How long a successful Authenticate is remembered for replay.
const AUTH_REPLAY_WINDOW: Duration = Duration::from_secs(30);

/// The token handed out for one Authenticate request.
struct RecentAuth {
    seq: u64,
    peer_id: PeerId,
    token: SessionToken,
    at: Instant,
}

/// Handles one control request at a time against the shared stores.
pub struct Dispatcher {
    sessions: Arc<SessionStore>,
    files: Arc<FileIndex>,
    directory: DirectoryView,
    credentials: Arc<dyn CredentialStore>,
    search_cap: usize,
    list_cap: usize,
    data_budget: usize,
    /// Keyed by request source. Locked after the session table.
    recent_auth: Mutex<HashMap<SocketAddr, RecentAuth>>,
}

impl Dispatcher {
    pub fn new(
        sessions: Arc<SessionStore>,
        files: Arc<FileIndex>,
        credentials: Arc<dyn CredentialStore>,
        config: &CoordinatorConfig,
    ) -> Self {
        let directory = DirectoryView::new(Arc::clone(&sessions), Arc::clone(&files));
        Self {
            sessions,
            files,
            directory,
            credentials,
            search_cap: config.search_result_cap,
            list_cap: config.list_result_cap,
            data_budget: config.max_datagram_bytes.saturating_sub(REPLY_HEADER_RESERVE),
            recent_auth: Mutex::new(HashMap::new()),
        }
    }

    /// Handle a raw datagram. `None` means drop it without a reply, which is
    /// what happens to anything unparseable.
    pub fn handle_datagram(&self, datagram: &[u8], source: SocketAddr) -> Option<Vec<u8>> {
        let Some(request) = Request::decode(datagram) else {
            debug!("Dropping unparseable datagram ({} bytes) from {source}", datagram.len());
            return None;
        };
        let reply = self.dispatch(request, source, Instant::now());
        Some(reply.encode().into_bytes())
    }

    /// Handle a parsed request as of `now`.
    pub fn dispatch(&self, request: Request, source: SocketAddr, now: Instant) -> Reply {
        let seq = request.seq;
        let tag = request.command.tag();
        match self.handle(request.command, source, seq, now) {
            Ok(data) => {
                debug!("{tag} #{seq} from {source}: OK");
                Reply::ok(seq, data)
            }
            Err(reason) => {
                debug!("{tag} #{seq} from {source}: FAIL {reason}");
                Reply::fail(seq, reason)
            }
        }
    }

    fn handle(
        &self,
        command: Command,
        source: SocketAddr,
        seq: u64,
        now: Instant,
    ) -> Result<ReplyData, FailReason> {
        match command {
            Command::Authenticate {
                username,
                password,
                transfer_port,
            } => self.authenticate(&username, &password, source, transfer_port, seq, now),
            Command::Heartbeat {
                token,
                transfer_port,
            } => self.heartbeat(&token, PeerAddress::observed(source, transfer_port), now),
            Command::ShareFile {
                token,
                file_name,
                size_bytes,
            } => self.share_file(&token, &file_name, size_bytes),
            Command::RemoveFile { token, file_name } => self.remove_file(&token, &file_name),
            Command::ListPeers { token } => {
                self.caller(&token)?;
                let peers = self.directory.list_peers(self.list_cap);
                Ok(ReplyData::Peers(peers.fit_within(self.data_budget)))
            }
            Command::ListFiles { token } => {
                let owner = self.caller(&token)?;
                let files = self.directory.list_files(&owner, self.list_cap);
                Ok(ReplyData::Files(files.fit_within(self.data_budget)))
            }
            Command::Search { token, pattern } => {
                self.caller(&token)?;
                validate_pattern(&pattern).map_err(|_| FailReason::InvalidArgument)?;
                let hits = self.directory.search(&pattern, self.search_cap);
                Ok(ReplyData::Hits(hits.fit_within(self.data_budget)))
            }
            Command::Locate { token, file_name } => {
                let requester = self.caller(&token)?;
                validate_file_name(&file_name).map_err(|_| FailReason::InvalidArgument)?;
                let hits = self.directory.locate(&requester, &file_name, self.search_cap);
                if hits.items.is_empty() {
                    return Err(FailReason::NotFound);
                }
                Ok(ReplyData::Hits(hits.fit_within(self.data_budget)))
            }
            Command::Logout { token } => Ok(self.logout(&token)),
        }
    }

    /// Resolve a token to its peer. The session guard is released before
    /// returning, so directory queries can take their own.
    fn caller(&self, token: &SessionToken) -> Result<PeerId, FailReason> {
        self.sessions
            .read()
            .resolve(token)
            .map(|s| s.peer_id.clone())
            .ok_or(FailReason::Unauthenticated)
    }

    /// Credential checks can be slow (Argon2), so callers on an async
    /// runtime should run [`handle_datagram`](Self::handle_datagram) off the
    /// reactor threads.
    fn authenticate(
        &self,
        username: &str,
        password: &str,
        source: SocketAddr,
        transfer_port: u16,
        seq: u64,
        now: Instant,
    ) -> Result<ReplyData, FailReason> {
        let peer_id = PeerId::from_string(username);
        let address = PeerAddress::observed(source, transfer_port);
        if let Some(token) = self.replayed_auth(&self.sessions.read(), source, seq, &peer_id, now) {
            debug!("Replaying AUTH #{seq} for {username}");
            return Ok(ReplyData::Token(token));
        }

        if validate_username(username).is_err() || !self.credentials.verify(username, password) {
            warn!("Authentication failed for '{username}' from {}", address.host);
            return Err(FailReason::AuthFailed);
        }

        let mut sessions = self.sessions.write();
        let mut recent = self.recent_auth.lock();
        // A copy of this request may have finished while we verified.
        if let Some(token) = replayed(&recent, &sessions, source, seq, &peer_id, now) {
            return Ok(ReplyData::Token(token));
        }
        let token = sessions.authenticate(peer_id.clone(), address, now);
        recent.retain(|_, r| now.saturating_duration_since(r.at) < AUTH_REPLAY_WINDOW);
        recent.insert(
            source,
            RecentAuth {
                seq,
                peer_id,
                token: token.clone(),
                at: now,
            },
        );
        info!("Authenticated {username} (transfer endpoint {address})");
        Ok(ReplyData::Token(token))
    }

    fn replayed_auth(
        &self,
        sessions: &SessionTable,
        source: SocketAddr,
        seq: u64,
        peer_id: &PeerId,
        now: Instant,
    ) -> Option<SessionToken> {
        replayed(&self.recent_auth.lock(), sessions, source, seq, peer_id, now)
    }

    fn heartbeat(
        &self,
        token: &SessionToken,
        address: PeerAddress,
        now: Instant,
    ) -> Result<ReplyData, FailReason> {
        let mut sessions = self.sessions.write();
        let previous = sessions
            .heartbeat(token, address, now)
            .map_err(|_| FailReason::Unauthenticated)?;
        if previous != PeerStatus::Online {
            if let Some(session) = sessions.resolve(token) {
                info!("Peer {} is back online (was {previous})", session.peer_id);
            }
        }
        Ok(ReplyData::Ack)
    }

    fn share_file(
        &self,
        token: &SessionToken,
        file_name: &str,
        size_bytes: u64,
    ) -> Result<ReplyData, FailReason> {
        // Held across the file write so an eviction cannot slip in between.
        let sessions = self.sessions.read();
        let owner = &sessions.resolve(token).ok_or(FailReason::Unauthenticated)?.peer_id;
        validate_file_name(file_name).map_err(|_| FailReason::InvalidArgument)?;

        match self.files.write().upsert(owner, file_name, size_bytes) {
            Upsert::Inserted => info!("{owner} shared {file_name} ({size_bytes} bytes)"),
            Upsert::Updated => info!("{owner} re-shared {file_name} ({size_bytes} bytes)"),
            Upsert::Unchanged => debug!("{owner} repeated share of {file_name}"),
        }
        Ok(ReplyData::Ack)
    }

    fn remove_file(&self, token: &SessionToken, file_name: &str) -> Result<ReplyData, FailReason> {
        let sessions = self.sessions.read();
        let owner = &sessions.resolve(token).ok_or(FailReason::Unauthenticated)?.peer_id;
        validate_file_name(file_name).map_err(|_| FailReason::InvalidArgument)?;

        if self.files.write().remove(owner, file_name) {
            info!("{owner} stopped sharing {file_name}");
        }
        Ok(ReplyData::Ack)
    }

    fn logout(&self, token: &SessionToken) -> ReplyData {
        let mut sessions = self.sessions.write();
        if let Some(peer_id) = sessions.logout(token) {
            let dropped = self.files.write().remove_owner(&peer_id);
            info!("{peer_id} logged out ({dropped} shared file(s) removed)");
        }
        ReplyData::Ack
    }
}

/// The token an earlier copy of this Authenticate produced, if it is recent
/// and still the live one for that peer.
fn replayed(
    recent: &HashMap<SocketAddr, RecentAuth>,
    sessions: &SessionTable,
    source: SocketAddr,
    seq: u64,
    peer_id: &PeerId,
    now: Instant,
) -> Option<SessionToken> {
    let entry = recent.get(&source)?;
    let fresh = now.saturating_duration_since(entry.at) < AUTH_REPLAY_WINDOW;
    let live = sessions
        .resolve(&entry.token)
        .is_some_and(|s| &s.peer_id == peer_id);
    (entry.seq == seq && &entry.peer_id == peer_id && fresh && live).then(|| entry.token.clone())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
