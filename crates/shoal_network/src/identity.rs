//! Peer identity, session tokens, and addresses.

use std::fmt;
use std::net::{IpAddr, SocketAddr};

use serde::{Deserialize, Serialize};

use crate::error::NetworkError;

/// Longest accepted username, in bytes.
pub const MAX_USERNAME_LEN: usize = 64;

/// Longest accepted file name or search pattern, in bytes.
pub const MAX_FILE_NAME_LEN: usize = 255;

/// A peer's identity. Identical credentials always resolve to the same id,
/// so this is the authenticated username.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PeerId(pub String);

impl PeerId {
    /// Create a PeerId from an existing string.
    pub fn from_string(s: impl Into<String>) -> Self {
        Self(s.into())
    }

    /// Return the inner string representation.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Opaque bearer token identifying one authenticated session.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SessionToken(String);

impl SessionToken {
    /// Generate a fresh token from 128 random bits.
    pub fn generate() -> Self {
        let bytes: [u8; 16] = rand::random();
        Self(hex::encode(bytes))
    }

    /// Wrap a token received over the wire.
    pub fn from_string(s: impl Into<String>) -> Self {
        Self(s.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SessionToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Only a prefix, so tokens never land in logs whole.
        let prefix: String = self.0.chars().take(8).collect();
        write!(f, "{prefix}…")
    }
}

/// Where a peer can be reached: its control endpoint as observed by the
/// coordinator plus the port its transfer listener accepts on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerAddress {
    pub host: IpAddr,
    pub control_port: u16,
    pub transfer_port: u16,
}

impl PeerAddress {
    /// Build an address from a datagram source and an advertised transfer port.
    pub fn observed(source: SocketAddr, transfer_port: u16) -> Self {
        Self {
            host: source.ip(),
            control_port: source.port(),
            transfer_port,
        }
    }

    /// The socket address of the peer's transfer listener.
    pub fn transfer_addr(&self) -> SocketAddr {
        SocketAddr::new(self.host, self.transfer_port)
    }
}

impl fmt::Display for PeerAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.transfer_addr())
    }
}

/// Reject usernames that are empty, too long, or contain whitespace.
pub fn validate_username(name: &str) -> Result<(), NetworkError> {
    if name.is_empty() || name.len() > MAX_USERNAME_LEN {
        return Err(NetworkError::InvalidArgument(format!(
            "username must be 1..={MAX_USERNAME_LEN} bytes"
        )));
    }
    if name.chars().any(|c| c.is_whitespace() || c.is_control()) {
        return Err(NetworkError::InvalidArgument(
            "username must not contain whitespace".into(),
        ));
    }
    Ok(())
}

/// Accept only plain file names: no path separators, no `.`/`..`, no NUL.
///
/// Shared files live flat in one directory per peer, so anything that could
/// walk out of it is refused on both the control and transfer planes.
pub fn validate_file_name(name: &str) -> Result<(), NetworkError> {
    if name.is_empty() || name.len() > MAX_FILE_NAME_LEN {
        return Err(NetworkError::InvalidArgument(format!(
            "file name must be 1..={MAX_FILE_NAME_LEN} bytes"
        )));
    }
    if name == "." || name == ".." {
        return Err(NetworkError::InvalidArgument(format!("invalid file name: {name}")));
    }
    if name.contains(['/', '\\', '\0']) {
        return Err(NetworkError::InvalidArgument(format!(
            "file name must not contain path separators: {name}"
        )));
    }
    Ok(())
}

/// Search patterns share the file-name length bound but may contain anything.
pub fn validate_pattern(pattern: &str) -> Result<(), NetworkError> {
    if pattern.is_empty() || pattern.len() > MAX_FILE_NAME_LEN {
        return Err(NetworkError::InvalidArgument(format!(
            "pattern must be 1..={MAX_FILE_NAME_LEN} bytes"
        )));
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_token_generation_is_unique() {
        let a = SessionToken::generate();
        let b = SessionToken::generate();
        assert_ne!(a, b);
        assert_eq!(a.as_str().len(), 32);
        assert!(a.as_str().chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn test_token_display_is_truncated() {
        let token = SessionToken::from_string("0123456789abcdef");
        assert_eq!(format!("{token}"), "01234567…");
    }

    #[test]
    fn test_peer_address_observed() {
        let source: SocketAddr = "10.0.0.7:40000".parse().unwrap();
        let addr = PeerAddress::observed(source, 5555);
        assert_eq!(addr.control_port, 40000);
        assert_eq!(addr.transfer_addr(), "10.0.0.7:5555".parse().unwrap());
    }

    #[test]
    fn test_file_name_validation() {
        assert!(validate_file_name("book.pdf").is_ok());
        assert!(validate_file_name("my notes.txt").is_ok());
        assert!(validate_file_name("").is_err());
        assert!(validate_file_name("..").is_err());
        assert!(validate_file_name("../etc/passwd").is_err());
        assert!(validate_file_name("a\\b").is_err());
        assert!(validate_file_name(&"x".repeat(256)).is_err());
    }

    #[test]
    fn test_username_validation() {
        assert!(validate_username("alice").is_ok());
        assert!(validate_username("").is_err());
        assert!(validate_username("al ice").is_err());
        assert!(validate_username(&"a".repeat(65)).is_err());
    }
}
