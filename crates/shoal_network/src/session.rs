//! Session & liveness store — the authoritative table of authenticated peers.
//!
//! A [`SessionStore`] wraps a [`SessionTable`] in one `RwLock`. Callers take
//! the guard explicitly (`read()` / `write()`) so that a command touching the
//! file index can hold the session lock across both stores. The lock order
//! everywhere is: sessions first, then files.

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use parking_lot::{RwLock, RwLockReadGuard, RwLockWriteGuard};
use serde::{Deserialize, Serialize};

use crate::config::LivenessConfig;
use crate::error::NetworkError;
use crate::identity::{PeerAddress, PeerId, SessionToken};

/// Liveness of a session, derived purely from time since the last heartbeat.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PeerStatus {
    Online,
    Stale,
    Offline,
}

impl PeerStatus {
    /// Status for a session whose last heartbeat was `elapsed` ago.
    pub fn for_elapsed(elapsed: Duration, liveness: &LivenessConfig) -> Self {
        if elapsed < liveness.stale_after {
            Self::Online
        } else if elapsed < liveness.offline_after {
            Self::Stale
        } else {
            Self::Offline
        }
    }

    /// Whether peers in this status show up in discovery results.
    pub fn is_visible(&self) -> bool {
        *self != Self::Offline
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Online => "ONLINE",
            Self::Stale => "STALE",
            Self::Offline => "OFFLINE",
        }
    }
}

impl FromStr for PeerStatus {
    type Err = NetworkError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "ONLINE" => Ok(Self::Online),
            "STALE" => Ok(Self::Stale),
            "OFFLINE" => Ok(Self::Offline),
            other => Err(NetworkError::Protocol(format!("unknown peer status: {other}"))),
        }
    }
}

impl fmt::Display for PeerStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One authenticated peer.
#[derive(Debug, Clone)]
pub struct PeerSession {
    pub peer_id: PeerId,
    pub token: SessionToken,
    pub address: PeerAddress,
    /// Monotonic time of the newest heartbeat (or authentication).
    pub last_heartbeat_at: Instant,
    pub authenticated_at: DateTime<Utc>,
    pub status: PeerStatus,
}

/// What a sweep changed.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct SweepReport {
    pub went_stale: Vec<PeerId>,
    pub went_offline: Vec<PeerId>,
    pub evicted: Vec<PeerId>,
}

impl SweepReport {
    pub fn is_empty(&self) -> bool {
        self.went_stale.is_empty() && self.went_offline.is_empty() && self.evicted.is_empty()
    }
}

/// The session table itself. At most one session per peer id; every token
/// maps to exactly one live session.
#[derive(Debug, Default)]
pub struct SessionTable {
    by_peer: HashMap<PeerId, PeerSession>,
    by_token: HashMap<SessionToken, PeerId>,
}

impl SessionTable {
    /// Create or replace the session for `peer_id` and return its fresh token.
    /// The previous token, if any, stops resolving immediately.
    pub fn authenticate(
        &mut self,
        peer_id: PeerId,
        address: PeerAddress,
        now: Instant,
    ) -> SessionToken {
        let token = SessionToken::generate();
        let session = PeerSession {
            peer_id: peer_id.clone(),
            token: token.clone(),
            address,
            last_heartbeat_at: now,
            authenticated_at: Utc::now(),
            status: PeerStatus::Online,
        };
        if let Some(previous) = self.by_peer.insert(peer_id.clone(), session) {
            self.by_token.remove(&previous.token);
        }
        self.by_token.insert(token.clone(), peer_id);
        token
    }

    /// Look up the session a token belongs to.
    pub fn resolve(&self, token: &SessionToken) -> Option<&PeerSession> {
        self.by_token.get(token).and_then(|id| self.by_peer.get(id))
    }

    /// Refresh a session: newest heartbeat time wins, address is updated and
    /// status goes back to Online. Returns the status it had before.
    pub fn heartbeat(
        &mut self,
        token: &SessionToken,
        address: PeerAddress,
        now: Instant,
    ) -> Result<PeerStatus, NetworkError> {
        let peer_id = self.by_token.get(token).ok_or(NetworkError::Unauthenticated)?;
        let session = self
            .by_peer
            .get_mut(peer_id)
            .ok_or(NetworkError::Unauthenticated)?;

        let previous = session.status;
        session.last_heartbeat_at = session.last_heartbeat_at.max(now);
        session.address = address;
        session.status = PeerStatus::Online;
        Ok(previous)
    }

    /// Drop the session owning `token`. Returns the peer id if one existed.
    pub fn logout(&mut self, token: &SessionToken) -> Option<PeerId> {
        let peer_id = self.by_token.remove(token)?;
        self.by_peer.remove(&peer_id);
        Some(peer_id)
    }

    /// Get the session for a peer by id.
    pub fn get(&self, peer_id: &PeerId) -> Option<&PeerSession> {
        self.by_peer.get(peer_id)
    }

    /// Status of a peer, `None` once evicted or never seen.
    pub fn status_of(&self, peer_id: &PeerId) -> Option<PeerStatus> {
        self.by_peer.get(peer_id).map(|s| s.status)
    }

    /// All sessions, in no particular order.
    pub fn iter(&self) -> impl Iterator<Item = &PeerSession> {
        self.by_peer.values()
    }

    pub fn len(&self) -> usize {
        self.by_peer.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_peer.is_empty()
    }

    /// Advance every session's status by elapsed time and evict those past
    /// the grace period. Request volume never affects this; only `now` does.
    pub fn sweep(&mut self, now: Instant, liveness: &LivenessConfig) -> SweepReport {
        let mut report = SweepReport::default();

        for session in self.by_peer.values_mut() {
            let elapsed = now.saturating_duration_since(session.last_heartbeat_at);
            if elapsed >= liveness.evict_after {
                report.evicted.push(session.peer_id.clone());
                continue;
            }
            let next = PeerStatus::for_elapsed(elapsed, liveness);
            if next != session.status {
                match next {
                    PeerStatus::Stale => report.went_stale.push(session.peer_id.clone()),
                    PeerStatus::Offline => report.went_offline.push(session.peer_id.clone()),
                    PeerStatus::Online => {}
                }
                session.status = next;
            }
        }

        for peer_id in &report.evicted {
            if let Some(session) = self.by_peer.remove(peer_id) {
                self.by_token.remove(&session.token);
            }
        }

        report
    }
}

/// Concurrency-safe handle around the session table.
#[derive(Debug, Default)]
pub struct SessionStore {
    inner: RwLock<SessionTable>,
}

impl SessionStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Shared access. Concurrent readers never block each other.
    pub fn read(&self) -> RwLockReadGuard<'_, SessionTable> {
        self.inner.read()
    }

    /// Exclusive access. All mutations go through here.
    pub fn write(&self) -> RwLockWriteGuard<'_, SessionTable> {
        self.inner.write()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
