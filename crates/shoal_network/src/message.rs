//! Control protocol — text datagrams shaped `<COMMAND> <seq> <field>*`.
//!
//! Replies are `OK <seq> <data>` or `FAIL <seq> <REASON>`. The `seq` is
//! chosen by the client and echoed back so a retried request (same seq) and
//! its possibly-duplicated replies can be paired up. Fields are separated by
//! a single space; `%`, space, CR and LF inside a field are percent-escaped.
//!
//! List data starts with a `<returned> <total>` header line followed by one
//! record per line, so a capped result is visible to the caller.

use std::fmt;
use std::net::IpAddr;
use std::str::FromStr;

use chrono::{DateTime, Utc};

use crate::error::NetworkError;
use crate::identity::{PeerAddress, PeerId, SessionToken};
use crate::session::PeerStatus;

/// Largest datagram either side sends or accepts.
pub const MAX_DATAGRAM_BYTES: usize = 60_000;

/// A command sent by a peer agent to the coordinator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Authenticate {
        username: String,
        password: String,
        transfer_port: u16,
    },
    Heartbeat {
        token: SessionToken,
        transfer_port: u16,
    },
    ShareFile {
        token: SessionToken,
        file_name: String,
        size_bytes: u64,
    },
    RemoveFile {
        token: SessionToken,
        file_name: String,
    },
    ListPeers {
        token: SessionToken,
    },
    ListFiles {
        token: SessionToken,
    },
    Search {
        token: SessionToken,
        pattern: String,
    },
    /// Exact-name lookup of every other peer that can serve a file.
    Locate {
        token: SessionToken,
        file_name: String,
    },
    /// End the session immediately instead of waiting for eviction.
    Logout {
        token: SessionToken,
    },
}

impl Command {
    /// The wire tag for this command.
    pub fn tag(&self) -> &'static str {
        match self {
            Self::Authenticate { .. } => "AUTH",
            Self::Heartbeat { .. } => "HEARTBEAT",
            Self::ShareFile { .. } => "SHARE",
            Self::RemoveFile { .. } => "REMOVE",
            Self::ListPeers { .. } => "PEERS",
            Self::ListFiles { .. } => "FILES",
            Self::Search { .. } => "SEARCH",
            Self::Locate { .. } => "LOCATE",
            Self::Logout { .. } => "LOGOUT",
        }
    }

    fn fields(&self) -> Vec<String> {
        match self {
            Self::Authenticate {
                username,
                password,
                transfer_port,
            } => vec![username.clone(), password.clone(), transfer_port.to_string()],
            Self::Heartbeat {
                token,
                transfer_port,
            } => vec![token.as_str().to_string(), transfer_port.to_string()],
            Self::ShareFile {
                token,
                file_name,
                size_bytes,
            } => vec![
                token.as_str().to_string(),
                file_name.clone(),
                size_bytes.to_string(),
            ],
            Self::RemoveFile { token, file_name } | Self::Locate { token, file_name } => {
                vec![token.as_str().to_string(), file_name.clone()]
            }
            Self::Search { token, pattern } => vec![token.as_str().to_string(), pattern.clone()],
            Self::ListPeers { token } | Self::ListFiles { token } | Self::Logout { token } => {
                vec![token.as_str().to_string()]
            }
        }
    }

    /// Build a command from its tag and unescaped fields. `None` for unknown
    /// tags or the wrong field count/shape.
    fn from_parts(tag: &str, fields: Vec<String>) -> Option<Self> {
        let mut it = fields.into_iter();
        let mut next = || it.next();
        let command = match tag {
            "AUTH" => Self::Authenticate {
                username: next()?,
                password: next()?,
                transfer_port: next()?.parse().ok()?,
            },
            "HEARTBEAT" => Self::Heartbeat {
                token: SessionToken::from_string(next()?),
                transfer_port: next()?.parse().ok()?,
            },
            "SHARE" => Self::ShareFile {
                token: SessionToken::from_string(next()?),
                file_name: next()?,
                size_bytes: next()?.parse().ok()?,
            },
            "REMOVE" => Self::RemoveFile {
                token: SessionToken::from_string(next()?),
                file_name: next()?,
            },
            "PEERS" => Self::ListPeers {
                token: SessionToken::from_string(next()?),
            },
            "FILES" => Self::ListFiles {
                token: SessionToken::from_string(next()?),
            },
            "SEARCH" => Self::Search {
                token: SessionToken::from_string(next()?),
                pattern: next()?,
            },
            "LOCATE" => Self::Locate {
                token: SessionToken::from_string(next()?),
                file_name: next()?,
            },
            "LOGOUT" => Self::Logout {
                token: SessionToken::from_string(next()?),
            },
            _ => return None,
        };
        // Trailing fields mean the sender speaks something else.
        if next().is_some() {
            return None;
        }
        Some(command)
    }
}

/// A command paired with the client's sequence number.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Request {
    pub seq: u64,
    pub command: Command,
}

impl Request {
    pub fn new(seq: u64, command: Command) -> Self {
        Self { seq, command }
    }

    /// Serialize to the datagram text.
    pub fn encode(&self) -> String {
        let mut out = format!("{} {}", self.command.tag(), self.seq);
        for field in self.command.fields() {
            out.push(' ');
            out.push_str(&escape_field(&field));
        }
        out
    }

    /// Parse a datagram. `None` means unparseable: the caller drops it.
    pub fn decode(bytes: &[u8]) -> Option<Self> {
        let text = std::str::from_utf8(bytes).ok()?;
        let mut parts = text.split(' ');
        let tag = parts.next()?;
        let seq = parts.next()?.parse().ok()?;
        let fields = parts.map(unescape_field).collect::<Option<Vec<_>>>()?;
        let command = Command::from_parts(tag, fields)?;
        Some(Self { seq, command })
    }
}

/// Closed set of failure codes carried by `FAIL` replies.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailReason {
    AuthFailed,
    Unauthenticated,
    NotFound,
    InvalidArgument,
}

impl FailReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::AuthFailed => "AUTH_FAILED",
            Self::Unauthenticated => "UNAUTHENTICATED",
            Self::NotFound => "NOT_FOUND",
            Self::InvalidArgument => "INVALID_ARGUMENT",
        }
    }
}

impl FromStr for FailReason {
    type Err = NetworkError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "AUTH_FAILED" => Ok(Self::AuthFailed),
            "UNAUTHENTICATED" => Ok(Self::Unauthenticated),
            "NOT_FOUND" => Ok(Self::NotFound),
            "INVALID_ARGUMENT" => Ok(Self::InvalidArgument),
            other => Err(NetworkError::Protocol(format!("unknown reason code: {other}"))),
        }
    }
}

impl fmt::Display for FailReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A reply datagram. Success data stays as text until the caller, who knows
/// which command it sent, decodes it with [`ReplyData`] helpers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reply {
    pub seq: u64,
    pub outcome: Result<String, FailReason>,
}

impl Reply {
    pub fn ok(seq: u64, data: ReplyData) -> Self {
        Self {
            seq,
            outcome: Ok(data.encode()),
        }
    }

    pub fn fail(seq: u64, reason: FailReason) -> Self {
        Self {
            seq,
            outcome: Err(reason),
        }
    }

    pub fn encode(&self) -> String {
        match &self.outcome {
            Ok(data) if data.is_empty() => format!("OK {}", self.seq),
            Ok(data) => format!("OK {} {data}", self.seq),
            Err(reason) => format!("FAIL {} {reason}", self.seq),
        }
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, NetworkError> {
        let text = std::str::from_utf8(bytes)
            .map_err(|e| NetworkError::Protocol(format!("reply is not UTF-8: {e}")))?;
        let mut parts = text.splitn(3, ' ');
        let tag = parts.next().unwrap_or_default();
        let seq = parts
            .next()
            .and_then(|s| s.parse().ok())
            .ok_or_else(|| NetworkError::Protocol(format!("reply without seq: {text}")))?;
        let rest = parts.next().unwrap_or_default();
        let outcome = match tag {
            "OK" => Ok(rest.to_string()),
            "FAIL" => Err(rest.parse()?),
            other => return Err(NetworkError::Protocol(format!("unknown reply tag: {other}"))),
        };
        Ok(Self { seq, outcome })
    }
}

/// Typed success payloads.
#[derive(Debug, Clone, PartialEq)]
pub enum ReplyData {
    Ack,
    Token(SessionToken),
    Peers(Listing<PeerRecord>),
    Files(Listing<FileRecord>),
    Hits(Listing<SearchHit>),
}

impl ReplyData {
    fn encode(&self) -> String {
        match self {
            Self::Ack => String::new(),
            Self::Token(token) => token.as_str().to_string(),
            Self::Peers(listing) => listing.encode(),
            Self::Files(listing) => listing.encode(),
            Self::Hits(listing) => listing.encode(),
        }
    }
}

/// A possibly-capped list of records plus the uncapped total.
#[derive(Debug, Clone, PartialEq)]
pub struct Listing<T> {
    pub items: Vec<T>,
    pub total: usize,
}

impl<T> Listing<T> {
    /// Whether the coordinator left records out.
    pub fn is_truncated(&self) -> bool {
        self.items.len() < self.total
    }
}

impl<T: WireRecord> Listing<T> {
    /// Keep at most `cap` items from `all`, remembering how many there were.
    pub fn capped(mut all: Vec<T>, cap: usize) -> Self {
        let total = all.len();
        all.truncate(cap);
        Self { items: all, total }
    }

    /// Drop trailing records until the encoded listing fits in `budget`
    /// bytes. `total` is left alone so the caller still sees the truncation.
    pub fn fit_within(mut self, budget: usize) -> Self {
        let mut used = format!("{} {}", self.items.len(), self.total).len();
        let mut keep = 0;
        for item in &self.items {
            let line = encode_record(item).len() + 1;
            if used + line > budget {
                break;
            }
            used += line;
            keep += 1;
        }
        self.items.truncate(keep);
        self
    }

    fn encode(&self) -> String {
        let mut out = format!("{} {}", self.items.len(), self.total);
        for item in &self.items {
            out.push('\n');
            out.push_str(&encode_record(item));
        }
        out
    }

    pub fn decode(data: &str) -> Result<Self, NetworkError> {
        let mut lines = data.split('\n');
        let header = lines.next().unwrap_or_default();
        let (returned, total) = header
            .split_once(' ')
            .and_then(|(r, t)| Some((r.parse::<usize>().ok()?, t.parse::<usize>().ok()?)))
            .ok_or_else(|| NetworkError::Protocol(format!("bad listing header: {header}")))?;

        let items = lines
            .map(|line| {
                let fields = line
                    .split(' ')
                    .map(unescape_field)
                    .collect::<Option<Vec<_>>>()
                    .ok_or_else(|| NetworkError::Protocol(format!("bad escape in: {line}")))?;
                T::from_fields(&fields)
            })
            .collect::<Result<Vec<_>, _>>()?;

        if items.len() != returned {
            return Err(NetworkError::Protocol(format!(
                "listing announced {returned} records, carried {}",
                items.len()
            )));
        }
        Ok(Self { items, total })
    }
}

fn encode_record<T: WireRecord>(record: &T) -> String {
    record
        .to_fields()
        .iter()
        .map(|f| escape_field(f))
        .collect::<Vec<_>>()
        .join(" ")
}

/// A record that travels as one line of space-separated fields.
pub trait WireRecord: Sized {
    fn to_fields(&self) -> Vec<String>;
    fn from_fields(fields: &[String]) -> Result<Self, NetworkError>;
}

/// One entry of a ListPeers reply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerRecord {
    pub peer_id: PeerId,
    pub address: PeerAddress,
    pub status: PeerStatus,
}

/// One entry of a ListFiles reply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileRecord {
    pub file_name: String,
    pub size_bytes: u64,
    pub shared_at: DateTime<Utc>,
}

/// One entry of a Search or Locate reply: a file and where to fetch it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SearchHit {
    pub owner: PeerId,
    pub file_name: String,
    pub size_bytes: u64,
    pub address: PeerAddress,
    pub status: PeerStatus,
}

fn field<'a>(fields: &'a [String], idx: usize, what: &str) -> Result<&'a str, NetworkError> {
    fields
        .get(idx)
        .map(String::as_str)
        .ok_or_else(|| NetworkError::Protocol(format!("record missing {what}")))
}

fn parse_field<T: FromStr>(fields: &[String], idx: usize, what: &str) -> Result<T, NetworkError> {
    field(fields, idx, what)?
        .parse()
        .map_err(|_| NetworkError::Protocol(format!("record has invalid {what}")))
}

fn address_fields(addr: &PeerAddress) -> [String; 3] {
    [
        addr.host.to_string(),
        addr.control_port.to_string(),
        addr.transfer_port.to_string(),
    ]
}

fn parse_address(fields: &[String], start: usize) -> Result<PeerAddress, NetworkError> {
    Ok(PeerAddress {
        host: parse_field::<IpAddr>(fields, start, "host")?,
        control_port: parse_field(fields, start + 1, "control port")?,
        transfer_port: parse_field(fields, start + 2, "transfer port")?,
    })
}

impl WireRecord for PeerRecord {
    fn to_fields(&self) -> Vec<String> {
        let mut out = vec![self.peer_id.to_string()];
        out.extend(address_fields(&self.address));
        out.push(self.status.as_str().to_string());
        out
    }

    fn from_fields(fields: &[String]) -> Result<Self, NetworkError> {
        Ok(Self {
            peer_id: PeerId::from_string(field(fields, 0, "peer id")?),
            address: parse_address(fields, 1)?,
            status: parse_field(fields, 4, "status")?,
        })
    }
}

impl WireRecord for FileRecord {
    fn to_fields(&self) -> Vec<String> {
        vec![
            self.file_name.clone(),
            self.size_bytes.to_string(),
            self.shared_at.to_rfc3339(),
        ]
    }

    fn from_fields(fields: &[String]) -> Result<Self, NetworkError> {
        let shared_at = DateTime::parse_from_rfc3339(field(fields, 2, "shared_at")?)
            .map_err(|e| NetworkError::Protocol(format!("record has invalid shared_at: {e}")))?
            .with_timezone(&Utc);
        Ok(Self {
            file_name: field(fields, 0, "file name")?.to_string(),
            size_bytes: parse_field(fields, 1, "size")?,
            shared_at,
        })
    }
}

impl WireRecord for SearchHit {
    fn to_fields(&self) -> Vec<String> {
        let mut out = vec![
            self.owner.to_string(),
            self.file_name.clone(),
            self.size_bytes.to_string(),
        ];
        out.extend(address_fields(&self.address));
        out.push(self.status.as_str().to_string());
        out
    }

    fn from_fields(fields: &[String]) -> Result<Self, NetworkError> {
        Ok(Self {
            owner: PeerId::from_string(field(fields, 0, "owner")?),
            file_name: field(fields, 1, "file name")?.to_string(),
            size_bytes: parse_field(fields, 2, "size")?,
            address: parse_address(fields, 3)?,
            status: parse_field(fields, 6, "status")?,
        })
    }
}

// ---------------------------------------------------------------------------
// Field escaping
// ---------------------------------------------------------------------------

fn escape_field(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    for c in raw.chars() {
        match c {
            '%' => out.push_str("%25"),
            ' ' => out.push_str("%20"),
            '\n' => out.push_str("%0A"),
            '\r' => out.push_str("%0D"),
            c => out.push(c),
        }
    }
    out
}

fn unescape_field(escaped: &str) -> Option<String> {
    let mut out = String::with_capacity(escaped.len());
    let mut rest = escaped;
    while let Some(pos) = rest.find('%') {
        out.push_str(&rest[..pos]);
        let code = rest.get(pos + 1..pos + 3)?;
        out.push(match code {
            "25" => '%',
            "20" => ' ',
            "0A" => '\n',
            "0D" => '\r',
            _ => return None,
        });
        rest = &rest[pos + 3..];
    }
    out.push_str(rest);
    Some(out)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn token() -> SessionToken {
        SessionToken::from_string("abc123")
    }

    #[test]
    fn test_request_wire_shape() {
        let req = Request::new(
            7,
            Command::ShareFile {
                token: token(),
                file_name: "book.pdf".into(),
                size_bytes: 1000,
            },
        );
        assert_eq!(req.encode(), "SHARE 7 abc123 book.pdf 1000");
    }

    #[test]
    fn test_request_escapes_spaces_in_names() {
        let req = Request::new(
            1,
            Command::Search {
                token: token(),
                pattern: "100% done notes".into(),
            },
        );
        let wire = req.encode();
        assert_eq!(wire, "SEARCH 1 abc123 100%25%20done%20notes");
        assert_eq!(Request::decode(wire.as_bytes()), Some(req));
    }

    #[test]
    fn test_decode_rejects_unknown_tag_and_bad_shapes() {
        assert!(Request::decode(b"FROBNICATE 1 abc").is_none());
        assert!(Request::decode(b"PEERS notanumber abc").is_none());
        assert!(Request::decode(b"PEERS 1").is_none());
        assert!(Request::decode(b"PEERS 1 abc extra").is_none());
        assert!(Request::decode(b"SHARE 1 abc f.txt -5").is_none());
        assert!(Request::decode(b"SEARCH 1 abc bad%zz").is_none());
        assert!(Request::decode(&[0xff, 0xfe, 0x00]).is_none());
        assert!(Request::decode(b"").is_none());
    }

    #[test]
    fn test_decode_authenticate() {
        let req = Request::decode(b"AUTH 3 alice s3cret 5000").unwrap();
        assert_eq!(req.seq, 3);
        assert_eq!(
            req.command,
            Command::Authenticate {
                username: "alice".into(),
                password: "s3cret".into(),
                transfer_port: 5000,
            }
        );
    }

    #[test]
    fn test_reply_ok_and_fail() {
        let ack = Reply::ok(9, ReplyData::Ack);
        assert_eq!(ack.encode(), "OK 9");
        assert_eq!(Reply::decode(b"OK 9").unwrap(), ack);

        let fail = Reply::fail(4, FailReason::Unauthenticated);
        assert_eq!(fail.encode(), "FAIL 4 UNAUTHENTICATED");
        assert_eq!(Reply::decode(b"FAIL 4 UNAUTHENTICATED").unwrap(), fail);

        assert!(Reply::decode(b"FAIL 4 TEAPOT").is_err());
        assert!(Reply::decode(b"MAYBE 4").is_err());
    }

    #[test]
    fn test_search_listing_on_the_wire() {
        let hit = SearchHit {
            owner: PeerId::from_string("alice"),
            file_name: "my book.pdf".into(),
            size_bytes: 1000,
            address: PeerAddress {
                host: "127.0.0.1".parse().unwrap(),
                control_port: 40000,
                transfer_port: 5000,
            },
            status: PeerStatus::Online,
        };
        let reply = Reply::ok(2, ReplyData::Hits(Listing::capped(vec![hit.clone()], 50)));
        let wire = reply.encode();
        assert_eq!(
            wire,
            "OK 2 1 1\nalice my%20book.pdf 1000 127.0.0.1 40000 5000 ONLINE"
        );

        let decoded = Reply::decode(wire.as_bytes()).unwrap();
        let listing = Listing::<SearchHit>::decode(&decoded.outcome.unwrap()).unwrap();
        assert_eq!(listing.items, vec![hit]);
        assert!(!listing.is_truncated());
    }

    #[test]
    fn test_listing_cap_keeps_total() {
        let records: Vec<FileRecord> = (0..5)
            .map(|i| FileRecord {
                file_name: format!("f{i}"),
                size_bytes: i,
                shared_at: Utc::now(),
            })
            .collect();
        let listing = Listing::capped(records, 2);
        assert_eq!(listing.items.len(), 2);
        assert_eq!(listing.total, 5);
        assert!(listing.is_truncated());
    }

    #[test]
    fn test_fit_within_drops_tail_records() {
        let records: Vec<FileRecord> = (0..10)
            .map(|i| FileRecord {
                file_name: format!("{i}-{}", "x".repeat(100)),
                size_bytes: 1,
                shared_at: Utc::now(),
            })
            .collect();
        let listing = Listing::capped(records, 10).fit_within(400);
        assert!(listing.items.len() < 10);
        assert_eq!(listing.total, 10);
        assert!(listing.encode().len() <= 400);
    }

    #[test]
    fn test_empty_listing_decodes() {
        let listing = Listing::<PeerRecord>::decode("0 0").unwrap();
        assert!(listing.items.is_empty());
        assert!(Listing::<PeerRecord>::decode("1 1").is_err());
    }
}
