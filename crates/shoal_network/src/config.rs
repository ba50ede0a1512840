//! Configuration for the coordinator and for peer processes.

use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde::de::DeserializeOwned;

use crate::message::MAX_DATAGRAM_BYTES;

/// Thresholds driving the ONLINE → STALE → OFFLINE → evicted progression.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LivenessConfig {
    /// Silence after which a session is STALE.
    #[serde(with = "duration_serde")]
    pub stale_after: Duration,
    /// Silence after which a session is OFFLINE and hidden from discovery.
    #[serde(with = "duration_serde")]
    pub offline_after: Duration,
    /// Silence after which a session and its file entries are destroyed.
    #[serde(with = "duration_serde")]
    pub evict_after: Duration,
    /// How often the sweep task runs.
    #[serde(with = "duration_serde")]
    pub sweep_interval: Duration,
}

impl Default for LivenessConfig {
    fn default() -> Self {
        Self {
            stale_after: Duration::from_secs(3),
            offline_after: Duration::from_secs(6),
            evict_after: Duration::from_secs(30),
            sweep_interval: Duration::from_secs(1),
        }
    }
}

impl LivenessConfig {
    /// Check the thresholds are ordered and the sweep actually runs.
    pub fn validate(&self) -> Result<(), String> {
        if self.stale_after >= self.offline_after {
            return Err("stale_after must be shorter than offline_after".into());
        }
        if self.offline_after > self.evict_after {
            return Err("offline_after must not exceed evict_after".into());
        }
        if self.sweep_interval.is_zero() {
            return Err("sweep_interval must be non-zero".into());
        }
        Ok(())
    }
}

/// Configuration for the coordination service.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CoordinatorConfig {
    /// UDP address the control plane listens on.
    #[serde(with = "socket_addr_serde")]
    pub listen_addr: SocketAddr,

    pub liveness: LivenessConfig,

    /// Largest datagram accepted or sent.
    pub max_datagram_bytes: usize,

    /// Maximum number of Search/Locate results per reply.
    pub search_result_cap: usize,

    /// Maximum number of records in ListPeers/ListFiles replies.
    pub list_result_cap: usize,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            listen_addr: SocketAddr::from(([127, 0, 0, 1], 9470)),
            liveness: LivenessConfig::default(),
            max_datagram_bytes: MAX_DATAGRAM_BYTES,
            search_result_cap: 50,
            list_result_cap: 128,
        }
    }
}

/// Smallest datagram limit that still fits a token or a few records.
const MIN_DATAGRAM_BYTES: usize = 512;

impl CoordinatorConfig {
    /// Check liveness thresholds and that replies fit a peer's receive
    /// buffer, which is always [`MAX_DATAGRAM_BYTES`].
    pub fn validate(&self) -> Result<(), String> {
        self.liveness.validate()?;
        if !(MIN_DATAGRAM_BYTES..=MAX_DATAGRAM_BYTES).contains(&self.max_datagram_bytes) {
            return Err(format!(
                "max_datagram_bytes must be between {MIN_DATAGRAM_BYTES} and {MAX_DATAGRAM_BYTES}"
            ));
        }
        if self.search_result_cap == 0 || self.list_result_cap == 0 {
            return Err("result caps must be non-zero".into());
        }
        Ok(())
    }

    pub fn save_to_file(&self, path: &Path) -> Result<(), String> {
        save_json(self, path)
    }

    /// Load config from a JSON file, or return defaults if the file is missing.
    pub fn load_or_default(path: &Path) -> Self {
        load_json_or_default(path)
    }
}

/// How a peer agent retries control requests.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// How long to wait for each reply.
    #[serde(with = "duration_serde")]
    pub timeout: Duration,
    /// Extra attempts after the first one.
    pub max_retries: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(1),
            max_retries: 3,
        }
    }
}

impl RetryPolicy {
    pub fn attempts(&self) -> u32 {
        self.max_retries.saturating_add(1)
    }
}

/// Timeouts and buffer sizes for direct transfers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferConfig {
    #[serde(with = "duration_serde")]
    pub connect_timeout: Duration,
    /// Bound on exchanging the request/response frames.
    #[serde(with = "duration_serde")]
    pub negotiation_timeout: Duration,
    /// Bound on any single read or write while streaming.
    #[serde(with = "duration_serde")]
    pub idle_timeout: Duration,
    pub chunk_size: usize,
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(5),
            negotiation_timeout: Duration::from_secs(5),
            idle_timeout: Duration::from_secs(10),
            chunk_size: 16 * 1024,
        }
    }
}

/// Configuration for a peer process.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PeerConfig {
    /// Where the coordination service listens.
    #[serde(with = "socket_addr_serde")]
    pub coordinator_addr: SocketAddr,

    /// Local address for the transfer listener (port 0 picks one).
    #[serde(with = "socket_addr_serde")]
    pub transfer_bind: SocketAddr,

    #[serde(with = "duration_serde")]
    pub heartbeat_interval: Duration,

    pub retry: RetryPolicy,

    pub transfer: TransferConfig,
}

impl Default for PeerConfig {
    fn default() -> Self {
        Self {
            coordinator_addr: SocketAddr::from(([127, 0, 0, 1], 9470)),
            transfer_bind: SocketAddr::from(([127, 0, 0, 1], 0)),
            heartbeat_interval: Duration::from_secs(2),
            retry: RetryPolicy::default(),
            transfer: TransferConfig::default(),
        }
    }
}

impl PeerConfig {
    pub fn save_to_file(&self, path: &Path) -> Result<(), String> {
        save_json(self, path)
    }

    /// Load config from a JSON file, or return defaults if the file is missing.
    pub fn load_or_default(path: &Path) -> Self {
        load_json_or_default(path)
    }
}

fn save_json<T: Serialize>(value: &T, path: &Path) -> Result<(), String> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).map_err(|e| format!("Failed to create directory: {e}"))?;
    }
    let json = serde_json::to_string_pretty(value)
        .map_err(|e| format!("Failed to serialize config: {e}"))?;
    std::fs::write(path, json).map_err(|e| format!("Failed to write config file: {e}"))
}

fn load_json_or_default<T: DeserializeOwned + Default>(path: &Path) -> T {
    if path.exists() {
        match std::fs::read_to_string(path) {
            Ok(data) => match serde_json::from_str::<T>(&data) {
                Ok(config) => return config,
                Err(e) => {
                    tracing::warn!("Corrupt config file {}, using defaults: {e}", path.display());
                }
            },
            Err(e) => {
                tracing::warn!("Cannot read config file {}, using defaults: {e}", path.display());
            }
        }
    }
    T::default()
}

// ---------------------------------------------------------------------------
// Serde helpers
// ---------------------------------------------------------------------------

mod socket_addr_serde {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::net::SocketAddr;

    pub fn serialize<S: Serializer>(addr: &SocketAddr, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&addr.to_string())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<SocketAddr, D::Error> {
        let s = String::deserialize(d)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// Durations travel as whole milliseconds; sub-second liveness thresholds
/// are common in tests.
mod duration_serde {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(dur: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(dur.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        let millis = u64::deserialize(d)?;
        Ok(Duration::from_millis(millis))
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_coordinator_config() {
        let config = CoordinatorConfig::default();
        assert_eq!(config.listen_addr.port(), 9470);
        assert_eq!(config.search_result_cap, 50);
        assert_eq!(config.list_result_cap, 128);
        assert_eq!(config.max_datagram_bytes, MAX_DATAGRAM_BYTES);
        assert!(config.liveness.validate().is_ok());
    }

    #[test]
    fn test_liveness_validation() {
        let mut liveness = LivenessConfig::default();
        liveness.offline_after = liveness.stale_after;
        assert!(liveness.validate().is_err());

        let mut liveness = LivenessConfig::default();
        liveness.evict_after = Duration::from_secs(1);
        assert!(liveness.validate().is_err());

        let mut liveness = LivenessConfig::default();
        liveness.sweep_interval = Duration::ZERO;
        assert!(liveness.validate().is_err());
    }

    #[test]
    fn test_coordinator_validation_bounds_datagram_size() {
        let mut config = CoordinatorConfig::default();
        assert!(config.validate().is_ok());

        config.max_datagram_bytes = MAX_DATAGRAM_BYTES + 1;
        assert!(config.validate().unwrap_err().contains("max_datagram_bytes"));

        config.max_datagram_bytes = 100;
        assert!(config.validate().is_err());

        config.max_datagram_bytes = MAX_DATAGRAM_BYTES;
        config.list_result_cap = 0;
        assert!(config.validate().is_err());

        let mut config = CoordinatorConfig::default();
        config.liveness.sweep_interval = Duration::ZERO;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_retry_attempts() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.attempts(), 4);
    }

    #[test]
    fn test_peer_config_serialize_roundtrip() {
        let mut config = PeerConfig::default();
        config.heartbeat_interval = Duration::from_millis(250);
        let json = serde_json::to_string(&config).unwrap();
        let deserialized: PeerConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(deserialized.heartbeat_interval, Duration::from_millis(250));
        assert_eq!(deserialized.coordinator_addr, config.coordinator_addr);
        assert_eq!(deserialized.retry, config.retry);
    }

    #[test]
    fn test_config_save_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("coordinator.json");

        let mut original = CoordinatorConfig::default();
        original.search_result_cap = 10;
        original.liveness.evict_after = Duration::from_secs(90);
        original.save_to_file(&path).unwrap();

        let loaded = CoordinatorConfig::load_or_default(&path);
        assert_eq!(loaded.search_result_cap, 10);
        assert_eq!(loaded.liveness.evict_after, Duration::from_secs(90));
    }

    #[test]
    fn test_config_load_corrupt_returns_default() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("peer.json");
        std::fs::write(&path, "{ not json").unwrap();

        let config = PeerConfig::load_or_default(&path);
        assert_eq!(config.heartbeat_interval, Duration::from_secs(2));
    }

    #[test]
    fn test_config_load_missing_returns_default() {
        let dir = tempfile::tempdir().unwrap();
        let config = CoordinatorConfig::load_or_default(&dir.path().join("absent.json"));
        assert_eq!(config.list_result_cap, 128);
    }
}
