//! TransferSession — one direct file exchange and its state machine.

use std::fmt;
use std::net::SocketAddr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::NetworkError;

/// Lifecycle of a transfer. COMPLETED and ABORTED are final.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TransferState {
    Negotiating,
    Streaming,
    Completed,
    Aborted,
}

impl TransferState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Aborted)
    }
}

impl fmt::Display for TransferState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Negotiating => "NEGOTIATING",
            Self::Streaming => "STREAMING",
            Self::Completed => "COMPLETED",
            Self::Aborted => "ABORTED",
        };
        f.write_str(s)
    }
}

/// Which end of the connection this session is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransferRole {
    /// Serving a local file to a requester.
    Sending,
    /// Fetching a file from a remote peer.
    Receiving,
}

/// One in-progress or finished exchange. A retried fetch is always a new
/// session with a new id.
#[derive(Debug, Clone)]
pub struct TransferSession {
    pub id: Uuid,
    pub role: TransferRole,
    pub peer: SocketAddr,
    /// Username of the fetching peer.
    pub requester: String,
    pub file_name: String,
    /// Negotiated size, known once streaming starts.
    pub size_bytes: Option<u64>,
    pub transferred: u64,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub abort_reason: Option<String>,
    state: TransferState,
}

impl TransferSession {
    pub fn new(
        role: TransferRole,
        peer: SocketAddr,
        requester: impl Into<String>,
        file_name: impl Into<String>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            role,
            peer,
            requester: requester.into(),
            file_name: file_name.into(),
            size_bytes: None,
            transferred: 0,
            started_at: Utc::now(),
            finished_at: None,
            abort_reason: None,
            state: TransferState::Negotiating,
        }
    }

    pub fn state(&self) -> TransferState {
        self.state
    }

    /// NEGOTIATING → STREAMING with the agreed size.
    pub fn begin_streaming(&mut self, size_bytes: u64) -> Result<(), NetworkError> {
        if self.state != TransferState::Negotiating {
            return Err(self.illegal("STREAMING"));
        }
        self.size_bytes = Some(size_bytes);
        self.state = TransferState::Streaming;
        Ok(())
    }

    /// Count bytes moved while streaming.
    pub fn record_progress(&mut self, bytes: u64) {
        if self.state == TransferState::Streaming {
            self.transferred += bytes;
        }
    }

    /// STREAMING → COMPLETED. Only legal once every negotiated byte moved.
    pub fn complete(&mut self) -> Result<(), NetworkError> {
        if self.state != TransferState::Streaming {
            return Err(self.illegal("COMPLETED"));
        }
        let expected = self.size_bytes.unwrap_or_default();
        if self.transferred != expected {
            return Err(NetworkError::TransferAborted {
                received: self.transferred,
                expected,
                reason: "byte count mismatch".into(),
            });
        }
        self.state = TransferState::Completed;
        self.finished_at = Some(Utc::now());
        Ok(())
    }

    /// Move to ABORTED. Returns `false` if the session had already finished,
    /// in which case nothing changes.
    pub fn abort(&mut self, reason: impl Into<String>) -> bool {
        if self.state.is_terminal() {
            return false;
        }
        self.state = TransferState::Aborted;
        self.abort_reason = Some(reason.into());
        self.finished_at = Some(Utc::now());
        true
    }

    /// The error a caller sees for an aborted session.
    pub fn aborted_error(&self) -> NetworkError {
        NetworkError::TransferAborted {
            received: self.transferred,
            expected: self.size_bytes.unwrap_or_default(),
            reason: self.abort_reason.clone().unwrap_or_default(),
        }
    }

    fn illegal(&self, to: &str) -> NetworkError {
        NetworkError::Protocol(format!(
            "transfer {} cannot move from {} to {to}",
            self.id, self.state
        ))
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
