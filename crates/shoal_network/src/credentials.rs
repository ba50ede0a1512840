//! Credential verification for the Authenticate command.
//!
//! The coordinator only needs a yes/no answer for a username/password pair,
//! expressed by [`CredentialStore`]. [`CredentialFile`] is the stock backend:
//! a text file with one `<username> <password>` pair per line. A password
//! stored as an Argon2 PHC string is verified with Argon2; anything else is
//! compared as plaintext.

use std::collections::HashMap;
use std::path::Path;

use argon2::password_hash::PasswordHash;
use argon2::{Argon2, PasswordVerifier};
use tracing::{debug, warn};

use crate::error::NetworkError;

/// Answers whether a username/password pair is valid.
pub trait CredentialStore: Send + Sync {
    fn verify(&self, username: &str, password: &str) -> bool;
}

/// In-memory credentials loaded from a `credentials.txt`-style file.
#[derive(Debug, Default, Clone)]
pub struct CredentialFile {
    entries: HashMap<String, String>,
}

impl CredentialFile {
    /// Build from explicit pairs.
    pub fn from_pairs<I, U, P>(pairs: I) -> Self
    where
        I: IntoIterator<Item = (U, P)>,
        U: Into<String>,
        P: Into<String>,
    {
        Self {
            entries: pairs
                .into_iter()
                .map(|(u, p)| (u.into(), p.into()))
                .collect(),
        }
    }

    /// Parse file contents. Blank lines and `#` comments are skipped; a line
    /// without a password is rejected.
    pub fn parse(contents: &str) -> Result<Self, NetworkError> {
        let mut entries = HashMap::new();
        for (lineno, line) in contents.lines().enumerate() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let (user, pass) = line.split_once(char::is_whitespace).ok_or_else(|| {
                NetworkError::InvalidArgument(format!(
                    "credentials line {} has no password",
                    lineno + 1
                ))
            })?;
            if entries.insert(user.to_string(), pass.trim().to_string()).is_some() {
                warn!("Duplicate credentials for '{user}', last one wins");
            }
        }
        Ok(Self { entries })
    }

    /// Read and parse a credentials file.
    pub fn load(path: &Path) -> Result<Self, NetworkError> {
        let contents = std::fs::read_to_string(path)?;
        let creds = Self::parse(&contents)?;
        debug!("Loaded {} credential(s) from {}", creds.len(), path.display());
        Ok(creds)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn usernames(&self) -> impl Iterator<Item = &str> {
        self.entries.keys().map(String::as_str)
    }
}

impl CredentialStore for CredentialFile {
    fn verify(&self, username: &str, password: &str) -> bool {
        let Some(stored) = self.entries.get(username) else {
            return false;
        };
        if stored.starts_with("$argon2") {
            match PasswordHash::new(stored) {
                Ok(hash) => Argon2::default()
                    .verify_password(password.as_bytes(), &hash)
                    .is_ok(),
                Err(e) => {
                    warn!("Malformed Argon2 hash for '{username}': {e}");
                    false
                }
            }
        } else {
            stored == password
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
