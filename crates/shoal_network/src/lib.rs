//! Shoal Network — a coordinated peer-to-peer file sharing system.
//!
//! A central coordination service tracks which peers are alive and which
//! files they share. Peers talk to it over a lightweight datagram control
//! protocol and exchange file contents directly with each other over TCP.
//!
//! # Architecture
//!
//! - **Session & liveness store** ([`session`], [`liveness`]): authenticated
//!   peers, their tokens and addresses, aged ONLINE → STALE → OFFLINE →
//!   evicted by a periodic sweep.
//! - **File index** ([`file_index`]): per-peer shared file name → size.
//! - **Dispatcher** ([`dispatcher`]): parses control datagrams and applies
//!   each command to the stores.
//! - **Directory view** ([`directory`]): read-only discovery queries.
//! - **Coordinator** ([`coordinator`]): the UDP service wiring it together.
//! - **Peer agent** ([`agent`], [`client`]): heartbeats, retries, and the
//!   operations a user issues.
//! - **Transfer plane** ([`transfer`]): direct peer-to-peer streaming.
//!
//! # Quick start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use shoal_network::{CoordinatorConfig, CoordinatorServer, CredentialFile};
//! use shoal_network::{LocalDirectory, PeerAgent, PeerConfig};
//!
//! # async fn example() -> Result<(), shoal_network::NetworkError> {
//! let creds = CredentialFile::from_pairs([("alice", "secret")]);
//! let mut server = CoordinatorServer::new(CoordinatorConfig::default(), Arc::new(creds));
//! let addr = server.start().await?;
//!
//! let config = PeerConfig { coordinator_addr: addr, ..PeerConfig::default() };
//! let agent = PeerAgent::start(config, "alice", "secret", LocalDirectory::new("alice")).await?;
//! let hits = agent.search("book").await?;
//! # Ok(())
//! # }
//! ```

pub mod agent;
pub mod client;
pub mod config;
pub mod coordinator;
pub mod credentials;
pub mod directory;
pub mod dispatcher;
pub mod error;
pub mod file_index;
pub mod identity;
pub mod liveness;
pub mod message;
pub mod session;
pub mod transfer;

// ── Re-exports for convenience ──────────────────────────────────────────

pub use agent::PeerAgent;
pub use config::{CoordinatorConfig, LivenessConfig, PeerConfig, RetryPolicy, TransferConfig};
pub use coordinator::CoordinatorServer;
pub use credentials::{CredentialFile, CredentialStore};
pub use error::NetworkError;
pub use identity::{PeerAddress, PeerId, SessionToken};
pub use message::{FailReason, FileRecord, Listing, PeerRecord, SearchHit};
pub use session::PeerStatus;
pub use transfer::{LocalDirectory, TransferEvent, TransferManager, TransferSession, TransferState};
