//! Peer directory view — read-only projection over both stores.
//!
//! Every query takes the session read guard, then the file read guard, and
//! returns owned records reflecting the state committed at that moment.

use std::sync::Arc;

use crate::file_index::FileIndex;
use crate::identity::PeerId;
use crate::message::{FileRecord, Listing, PeerRecord, SearchHit};
use crate::session::SessionStore;

/// Answers ListPeers / ListFiles / Search / Locate. Never mutates.
#[derive(Clone)]
pub struct DirectoryView {
    sessions: Arc<SessionStore>,
    files: Arc<FileIndex>,
}

impl DirectoryView {
    pub fn new(sessions: Arc<SessionStore>, files: Arc<FileIndex>) -> Self {
        Self { sessions, files }
    }

    /// Every peer whose status is not OFFLINE, ordered by peer id.
    pub fn list_peers(&self, cap: usize) -> Listing<PeerRecord> {
        let sessions = self.sessions.read();
        let mut peers: Vec<PeerRecord> = sessions
            .iter()
            .filter(|s| s.status.is_visible())
            .map(|s| PeerRecord {
                peer_id: s.peer_id.clone(),
                address: s.address,
                status: s.status,
            })
            .collect();
        peers.sort_by(|a, b| a.peer_id.cmp(&b.peer_id));
        Listing::capped(peers, cap)
    }

    /// The caller's own entries, sorted by file name. Empty while the owner
    /// is OFFLINE.
    pub fn list_files(&self, owner: &PeerId, cap: usize) -> Listing<FileRecord> {
        let sessions = self.sessions.read();
        if !sessions.status_of(owner).is_some_and(|s| s.is_visible()) {
            return Listing::capped(Vec::new(), cap);
        }
        let files = self.files.read();
        let records = files
            .files_of(owner)
            .map(|e| FileRecord {
                file_name: e.file_name.clone(),
                size_bytes: e.size_bytes,
                shared_at: e.shared_at,
            })
            .collect();
        Listing::capped(records, cap)
    }

    /// Case-insensitive substring match on file names across visible owners,
    /// ordered by (file name, owner) and capped.
    pub fn search(&self, pattern: &str, cap: usize) -> Listing<SearchHit> {
        let needle = pattern.to_lowercase();
        let sessions = self.sessions.read();
        let files = self.files.read();

        let mut hits: Vec<SearchHit> = files
            .iter()
            .filter(|e| e.file_name.to_lowercase().contains(&needle))
            .filter_map(|e| {
                let owner = sessions.get(&e.owner)?;
                owner.status.is_visible().then(|| SearchHit {
                    owner: e.owner.clone(),
                    file_name: e.file_name.clone(),
                    size_bytes: e.size_bytes,
                    address: owner.address,
                    status: owner.status,
                })
            })
            .collect();
        hits.sort_by(|a, b| {
            a.file_name
                .cmp(&b.file_name)
                .then_with(|| a.owner.cmp(&b.owner))
        });
        Listing::capped(hits, cap)
    }

    /// Every visible peer other than `requester` that shares exactly
    /// `file_name`. ONLINE owners come before STALE ones.
    pub fn locate(&self, requester: &PeerId, file_name: &str, cap: usize) -> Listing<SearchHit> {
        let sessions = self.sessions.read();
        let files = self.files.read();

        let mut hits: Vec<SearchHit> = sessions
            .iter()
            .filter(|s| s.status.is_visible() && &s.peer_id != requester)
            .filter_map(|s| {
                let entry = files.get(&s.peer_id, file_name)?;
                Some(SearchHit {
                    owner: s.peer_id.clone(),
                    file_name: entry.file_name.clone(),
                    size_bytes: entry.size_bytes,
                    address: s.address,
                    status: s.status,
                })
            })
            .collect();
        hits.sort_by(|a, b| a.status.cmp(&b.status).then_with(|| a.owner.cmp(&b.owner)));
        Listing::capped(hits, cap)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
