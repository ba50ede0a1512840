//! Interactive peer console: `peers`, `myfiles`, `share`, `find`, `remove`,
//! `fetch`, `quit`.

use std::fmt::Write as _;

use anyhow::{Context, Result};
use shoal_network::transfer::TransferRole;
use shoal_network::{
    FileRecord, Listing, NetworkError, PeerAgent, PeerRecord, SearchHit, TransferEvent,
};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Lines, Stdin};
use tracing::{info, warn};

/// One line typed at the prompt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CliCommand {
    Peers,
    MyFiles,
    Share(String),
    Find(String),
    Remove(String),
    Fetch(String),
    Help,
    Quit,
}

impl CliCommand {
    /// Parse a console line. The argument is everything after the first
    /// space, so file names may contain spaces.
    pub fn parse(line: &str) -> Result<Self, String> {
        let line = line.trim();
        let (verb, arg) = match line.split_once(' ') {
            Some((verb, arg)) => (verb, arg.trim()),
            None => (line, ""),
        };
        let needs_arg = |make: fn(String) -> CliCommand, usage: &str| {
            if arg.is_empty() {
                Err(format!("Usage: {usage}"))
            } else {
                Ok(make(arg.to_string()))
            }
        };
        match verb {
            "peers" => Ok(Self::Peers),
            "myfiles" => Ok(Self::MyFiles),
            "share" => needs_arg(Self::Share, "share <filename>"),
            "find" => needs_arg(Self::Find, "find <pattern>"),
            "remove" => needs_arg(Self::Remove, "remove <filename>"),
            "fetch" => needs_arg(Self::Fetch, "fetch <filename>"),
            "help" => Ok(Self::Help),
            "quit" | "exit" => Ok(Self::Quit),
            "" => Err(String::new()),
            other => Err(format!("Unknown command '{other}'. Type 'help' for a list.")),
        }
    }
}

pub const HELP: &str = "\
Available commands:
  peers              List active peers
  myfiles            List your shared files
  share <filename>   Share a file from your directory
  find <pattern>     Search shared files by name
  remove <filename>  Stop sharing a file
  fetch <filename>   Download a file from another peer
  quit               Log out and exit";

/// Run one command against the agent and render the result.
pub async fn execute(agent: &PeerAgent, command: &CliCommand) -> Result<String, NetworkError> {
    match command {
        CliCommand::Peers => Ok(format_peers(&agent.list_peers().await?)),
        CliCommand::MyFiles => Ok(format_files(&agent.list_files().await?)),
        CliCommand::Share(name) => {
            let size = agent.share(name).await?;
            Ok(format!("Sharing {name} ({size} bytes)"))
        }
        CliCommand::Find(pattern) => Ok(format_hits(pattern, &agent.search(pattern).await?)),
        CliCommand::Remove(name) => {
            agent.remove(name).await?;
            Ok(format!("No longer sharing {name}"))
        }
        CliCommand::Fetch(name) => {
            let session = agent.fetch(name).await?;
            Ok(format!(
                "{name} downloaded successfully ({} bytes from {})",
                session.transferred, session.peer
            ))
        }
        CliCommand::Help => Ok(HELP.to_string()),
        CliCommand::Quit => Ok("Goodbye!".to_string()),
    }
}

/// Human-readable text for a failed command.
pub fn describe_error(err: &NetworkError) -> String {
    match err {
        NetworkError::NotFound(what) => format!("Not found: {what}"),
        NetworkError::PeerUnavailable(_) => {
            "The coordination service is not responding. Try again shortly.".to_string()
        }
        NetworkError::TransferAborted {
            received, expected, ..
        } => format!("Download interrupted after {received} of {expected} bytes; nothing was saved."),
        NetworkError::InvalidArgument(msg) => msg.clone(),
        other => other.to_string(),
    }
}

fn truncation_note<T>(out: &mut String, listing: &Listing<T>) {
    if listing.is_truncated() {
        let _ = write!(
            out,
            "\n  ... showing {} of {}",
            listing.items.len(),
            listing.total
        );
    }
}

pub fn format_peers(peers: &Listing<PeerRecord>) -> String {
    if peers.items.is_empty() {
        return "No active peers".to_string();
    }
    let mut out = format!("Active peers ({}):", peers.total);
    for peer in &peers.items {
        let _ = write!(
            out,
            "\n  {:<16} {:<22} {}",
            peer.peer_id.as_str(),
            peer.address.to_string(),
            peer.status
        );
    }
    truncation_note(&mut out, peers);
    out
}

pub fn format_files(files: &Listing<FileRecord>) -> String {
    if files.items.is_empty() {
        return "You are not sharing any files".to_string();
    }
    let mut out = format!("Your shared files ({}):", files.total);
    for file in &files.items {
        let _ = write!(
            out,
            "\n  {:<32} {:>12} bytes  since {}",
            file.file_name,
            file.size_bytes,
            file.shared_at.format("%Y-%m-%d %H:%M:%S")
        );
    }
    truncation_note(&mut out, files);
    out
}

pub fn format_hits(pattern: &str, hits: &Listing<SearchHit>) -> String {
    if hits.items.is_empty() {
        return format!("No files match '{pattern}'");
    }
    let mut out = format!("Found {} file(s) matching '{pattern}':", hits.total);
    for hit in &hits.items {
        let _ = write!(
            out,
            "\n  {:<32} {:>12} bytes  {} @ {} ({})",
            hit.file_name, hit.size_bytes, hit.owner, hit.address, hit.status
        );
    }
    truncation_note(&mut out, hits);
    out
}

/// Line-oriented stdin with a prompt.
pub struct Console {
    lines: Lines<BufReader<Stdin>>,
}

impl Console {
    pub fn new() -> Self {
        Self {
            lines: BufReader::new(tokio::io::stdin()).lines(),
        }
    }

    /// Print `label` and read one line. `None` at end of input.
    pub async fn prompt(&mut self, label: &str) -> Result<Option<String>> {
        let mut stdout = tokio::io::stdout();
        stdout.write_all(label.as_bytes()).await?;
        stdout.flush().await?;
        self.lines.next_line().await.context("Failed to read from stdin")
    }
}

impl Default for Console {
    fn default() -> Self {
        Self::new()
    }
}

/// Read commands until `quit` or end of input, then log out.
pub async fn run(mut agent: PeerAgent, console: &mut Console) -> Result<()> {
    println!("Welcome, {}! Type 'help' for available commands.", agent.username());

    let mut events = agent.subscribe_transfers();
    let notifier = tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(TransferEvent::Completed {
                    role: TransferRole::Sending,
                    file_name,
                    size_bytes,
                    ..
                }) => println!("\n[served {file_name} ({size_bytes} bytes)]"),
                Ok(TransferEvent::Aborted {
                    role: TransferRole::Sending,
                    file_name,
                    reason,
                    ..
                }) => println!("\n[upload of {file_name} stopped: {reason}]"),
                Ok(_) => {}
                Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => {}
                Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
            }
        }
    });

    while let Some(line) = console.prompt("> ").await? {
        let command = match CliCommand::parse(&line) {
            Ok(command) => command,
            Err(msg) if msg.is_empty() => continue,
            Err(msg) => {
                println!("{msg}");
                continue;
            }
        };
        if command == CliCommand::Quit {
            break;
        }
        match execute(&agent, &command).await {
            Ok(text) => println!("{text}"),
            Err(e) => {
                warn!("{command:?} failed: {e}");
                println!("{}", describe_error(&e));
            }
        }
    }

    let shares = agent.local_shares();
    if !shares.is_empty() {
        info!("Withdrawing {} share(s): {}", shares.len(), shares.join(", "));
    }
    agent.logout().await;
    notifier.abort();
    println!("Goodbye!");
    Ok(())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use shoal_network::{PeerAddress, PeerId, PeerStatus};

    fn address(port: u16) -> PeerAddress {
        PeerAddress {
            host: "127.0.0.1".parse().unwrap(),
            control_port: 40000,
            transfer_port: port,
        }
    }

    #[test]
    fn test_parse_commands() {
        assert_eq!(CliCommand::parse("peers"), Ok(CliCommand::Peers));
        assert_eq!(CliCommand::parse("  myfiles "), Ok(CliCommand::MyFiles));
        assert_eq!(
            CliCommand::parse("share my book.pdf"),
            Ok(CliCommand::Share("my book.pdf".into()))
        );
        assert_eq!(CliCommand::parse("find book"), Ok(CliCommand::Find("book".into())));
        assert_eq!(
            CliCommand::parse("fetch book.pdf"),
            Ok(CliCommand::Fetch("book.pdf".into()))
        );
        assert_eq!(CliCommand::parse("quit"), Ok(CliCommand::Quit));
    }

    #[test]
    fn test_parse_rejects_missing_argument_and_unknown_verbs() {
        assert_eq!(
            CliCommand::parse("share"),
            Err("Usage: share <filename>".to_string())
        );
        assert!(CliCommand::parse("fetch   ").is_err());
        assert!(CliCommand::parse("download x").unwrap_err().contains("Unknown command"));
        assert_eq!(CliCommand::parse(""), Err(String::new()));
    }

    #[test]
    fn test_format_hits() {
        let hits = Listing {
            items: vec![SearchHit {
                owner: PeerId::from_string("alice"),
                file_name: "book.pdf".into(),
                size_bytes: 1000,
                address: address(5000),
                status: PeerStatus::Online,
            }],
            total: 3,
        };
        let text = format_hits("book", &hits);
        assert!(text.starts_with("Found 3 file(s) matching 'book':"));
        assert!(text.contains("alice @ 127.0.0.1:5000 (ONLINE)"));
        assert!(text.ends_with("showing 1 of 3"));
        assert_eq!(
            format_hits("zzz", &Listing { items: vec![], total: 0 }),
            "No files match 'zzz'"
        );
    }

    #[test]
    fn test_format_peers_and_files_empty() {
        assert_eq!(
            format_peers(&Listing { items: vec![], total: 0 }),
            "No active peers"
        );
        assert_eq!(
            format_files(&Listing { items: vec![], total: 0 }),
            "You are not sharing any files"
        );
    }

    #[test]
    fn test_format_peers_lists_status() {
        let peers = Listing {
            items: vec![PeerRecord {
                peer_id: PeerId::from_string("bob"),
                address: address(6000),
                status: PeerStatus::Stale,
            }],
            total: 1,
        };
        let text = format_peers(&peers);
        assert!(text.contains("bob"));
        assert!(text.contains("127.0.0.1:6000"));
        assert!(text.contains("STALE"));
        assert!(!text.contains("showing"));
    }

    #[test]
    fn test_describe_transfer_abort() {
        let err = NetworkError::TransferAborted {
            received: 10,
            expected: 1000,
            reason: "stream ended early".into(),
        };
        assert_eq!(
            describe_error(&err),
            "Download interrupted after 10 of 1000 bytes; nothing was saved."
        );
    }
}
