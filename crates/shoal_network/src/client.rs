//! ControlClient — request/reply over the unreliable control channel.
//!
//! One UDP socket connected to the coordinator, plus a background task that
//! reads every reply and hands it to whichever request is waiting on that
//! `seq`. A request with no reply inside the timeout is re-sent with the
//! same seq; late or duplicated replies for finished requests are dropped.

use std::collections::HashMap;
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;
use tokio::net::UdpSocket;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, trace};

use crate::config::RetryPolicy;
use crate::error::NetworkError;
use crate::message::{Command, MAX_DATAGRAM_BYTES, Reply, Request};

type PendingMap = Arc<Mutex<HashMap<u64, oneshot::Sender<Reply>>>>;

pub struct ControlClient {
    socket: Arc<UdpSocket>,
    server: SocketAddr,
    retry: RetryPolicy,
    next_seq: AtomicU64,
    pending: PendingMap,
    receiver: JoinHandle<()>,
}

impl ControlClient {
    /// Bind an ephemeral local port and aim it at `server`.
    pub async fn connect(server: SocketAddr, retry: RetryPolicy) -> Result<Self, NetworkError> {
        let local: SocketAddr = if server.is_ipv4() {
            (Ipv4Addr::UNSPECIFIED, 0).into()
        } else {
            (Ipv6Addr::UNSPECIFIED, 0).into()
        };
        let socket = UdpSocket::bind(local).await?;
        socket.connect(server).await?;
        let socket = Arc::new(socket);
        debug!(
            "Control client {} -> coordinator {server}",
            socket.local_addr()?
        );

        let pending: PendingMap = Arc::new(Mutex::new(HashMap::new()));
        let receiver = tokio::spawn(Self::receive_loop(
            Arc::clone(&socket),
            Arc::clone(&pending),
        ));

        Ok(Self {
            socket,
            server,
            retry,
            next_seq: AtomicU64::new(1),
            pending,
            receiver,
        })
    }

    pub fn server(&self) -> SocketAddr {
        self.server
    }

    pub fn local_addr(&self) -> Result<SocketAddr, NetworkError> {
        Ok(self.socket.local_addr()?)
    }

    /// Send `command` and wait for its reply, retrying per the policy.
    ///
    /// `OK` data comes back as-is. `FAIL` becomes the matching
    /// [`NetworkError`]; silence after every attempt is `PeerUnavailable`.
    pub async fn call(&self, command: Command) -> Result<String, NetworkError> {
        let seq = self.next_seq.fetch_add(1, Ordering::Relaxed);
        let tag = command.tag();
        let subject = subject_of(&command);
        let datagram = Request::new(seq, command).encode();

        let (tx, mut rx) = oneshot::channel();
        self.pending.lock().insert(seq, tx);
        let _waiter = PendingGuard {
            pending: &self.pending,
            seq,
        };

        let attempts = self.retry.attempts();
        for attempt in 1..=attempts {
            if let Err(e) = self.socket.send(datagram.as_bytes()).await {
                debug!("Send of {tag} #{seq} failed: {e}");
            }
            match timeout(self.retry.timeout, &mut rx).await {
                Ok(Ok(reply)) => {
                    return reply
                        .outcome
                        .map_err(|reason| NetworkError::from_fail(reason, &subject));
                }
                Ok(Err(_)) => break,
                Err(_) => debug!("No reply to {tag} #{seq} (attempt {attempt}/{attempts})"),
            }
        }

        Err(NetworkError::PeerUnavailable(format!(
            "coordinator {} did not answer {tag} after {attempts} attempt(s)",
            self.server
        )))
    }

    async fn receive_loop(socket: Arc<UdpSocket>, pending: PendingMap) {
        let mut buf = vec![0u8; MAX_DATAGRAM_BYTES];
        loop {
            let len = match socket.recv(&mut buf).await {
                Ok(len) => len,
                Err(e) => {
                    trace!("Control receive error: {e}");
                    continue;
                }
            };
            match Reply::decode(&buf[..len]) {
                Ok(reply) => {
                    let waiter = pending.lock().remove(&reply.seq);
                    match waiter {
                        Some(tx) => {
                            let _ = tx.send(reply);
                        }
                        None => trace!("Dropping duplicate or late reply #{}", reply.seq),
                    }
                }
                Err(e) => debug!("Ignoring malformed reply: {e}"),
            }
        }
    }
}

impl Drop for ControlClient {
    fn drop(&mut self) {
        self.receiver.abort();
    }
}

/// Clears a request's waiter however `call` ends, including when the
/// caller drops the future mid-wait.
struct PendingGuard<'a> {
    pending: &'a PendingMap,
    seq: u64,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        self.pending.lock().remove(&self.seq);
    }
}

/// What a `FAIL` refers to, for error messages.
fn subject_of(command: &Command) -> String {
    match command {
        Command::Authenticate { username, .. } => username.clone(),
        Command::ShareFile { file_name, .. }
        | Command::RemoveFile { file_name, .. }
        | Command::Locate { file_name, .. } => file_name.clone(),
        Command::Search { pattern, .. } => pattern.clone(),
        other => other.tag().to_string(),
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    use crate::identity::SessionToken;

    fn fast_retry() -> RetryPolicy {
        RetryPolicy {
            timeout: Duration::from_millis(100),
            max_retries: 3,
        }
    }

    /// A fake coordinator that ignores the first `drop_first` datagrams and
    /// answers the rest with `reply(seq)`.
    async fn fake_server(
        drop_first: usize,
        reply: fn(u64) -> String,
    ) -> (SocketAddr, Arc<AtomicUsize>) {
        let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let addr = socket.local_addr().unwrap();
        let seen = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&seen);
        tokio::spawn(async move {
            let mut buf = vec![0u8; 2048];
            loop {
                let Ok((len, from)) = socket.recv_from(&mut buf).await else {
                    return;
                };
                let n = counter.fetch_add(1, Ordering::SeqCst);
                if n < drop_first {
                    continue;
                }
                let request = Request::decode(&buf[..len]).unwrap();
                let text = reply(request.seq);
                // Duplicate every reply to exercise late-reply handling.
                socket.send_to(text.as_bytes(), from).await.unwrap();
                socket.send_to(text.as_bytes(), from).await.unwrap();
            }
        });
        (addr, seen)
    }

    fn peers() -> Command {
        Command::ListPeers {
            token: SessionToken::from_string("t"),
        }
    }

    #[tokio::test]
    async fn test_call_returns_ok_data() {
        let (addr, _) = fake_server(0, |seq| format!("OK {seq} 0 0")).await;
        let client = ControlClient::connect(addr, fast_retry()).await.unwrap();
        assert_eq!(client.call(peers()).await.unwrap(), "0 0");
        // The duplicate reply for the first call must not satisfy the second.
        assert_eq!(client.call(peers()).await.unwrap(), "0 0");
    }

    #[tokio::test]
    async fn test_call_retries_lost_datagrams_with_same_seq() {
        let (addr, seen) = fake_server(2, |seq| format!("OK {seq}")).await;
        let client = ControlClient::connect(addr, fast_retry()).await.unwrap();
        assert_eq!(client.call(peers()).await.unwrap(), "");
        assert_eq!(seen.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_call_maps_fail_reasons() {
        let (addr, _) = fake_server(0, |seq| format!("FAIL {seq} UNAUTHENTICATED")).await;
        let client = ControlClient::connect(addr, fast_retry()).await.unwrap();
        assert!(matches!(
            client.call(peers()).await,
            Err(NetworkError::Unauthenticated)
        ));
    }

    #[tokio::test]
    async fn test_silence_is_peer_unavailable() {
        let (addr, seen) = fake_server(usize::MAX, |seq| format!("OK {seq}")).await;
        let client = ControlClient::connect(addr, fast_retry()).await.unwrap();
        assert!(matches!(
            client.call(peers()).await,
            Err(NetworkError::PeerUnavailable(_))
        ));
        assert_eq!(seen.load(Ordering::SeqCst), 4);
        assert!(client.pending.lock().is_empty());
    }

    #[tokio::test]
    async fn test_abandoned_call_leaves_no_waiter() {
        let (addr, seen) = fake_server(usize::MAX, |seq| format!("OK {seq}")).await;
        let client = ControlClient::connect(addr, fast_retry()).await.unwrap();

        let abandoned = timeout(Duration::from_millis(150), client.call(peers())).await;
        assert!(abandoned.is_err());
        assert!(seen.load(Ordering::SeqCst) >= 1);
        assert!(client.pending.lock().is_empty());
    }
}
