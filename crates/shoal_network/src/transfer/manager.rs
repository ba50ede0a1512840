//! TransferManager — serves local files and fetches remote ones.
//!
//! Each accepted connection runs on its own task with its own buffers, so a
//! slow or vanished requester only ever affects its own session. Cancellation
//! is connection closure: the blocked read or write fails and the session
//! moves to ABORTED.

use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast;
use tokio::time::timeout;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::TransferConfig;
use crate::error::NetworkError;
use crate::identity::validate_file_name;
use crate::transfer::protocol::{
    TransferRequest, TransferResponse, TransferStatus, read_frame, write_frame,
};
use crate::transfer::session::{TransferRole, TransferSession};
use crate::transfer::store::{ByteSink, ByteSource};

const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Lifecycle notifications for every session this manager runs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransferEvent {
    Started {
        id: Uuid,
        role: TransferRole,
        peer: SocketAddr,
        file_name: String,
        size_bytes: u64,
    },
    Progress {
        id: Uuid,
        transferred: u64,
        size_bytes: u64,
    },
    Completed {
        id: Uuid,
        role: TransferRole,
        file_name: String,
        size_bytes: u64,
    },
    Aborted {
        id: Uuid,
        role: TransferRole,
        file_name: String,
        transferred: u64,
        reason: String,
    },
}

/// Both ends of the transfer plane for one peer. Cheap to clone.
#[derive(Clone)]
pub struct TransferManager {
    config: TransferConfig,
    source: Arc<dyn ByteSource>,
    sink: Arc<dyn ByteSink>,
    events: broadcast::Sender<TransferEvent>,
}

impl TransferManager {
    pub fn new(
        config: TransferConfig,
        source: Arc<dyn ByteSource>,
        sink: Arc<dyn ByteSink>,
    ) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            config,
            source,
            sink,
            events,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<TransferEvent> {
        self.events.subscribe()
    }

    /// Bind the transfer listener and accept until shutdown. Returns the
    /// bound address.
    pub async fn start(
        &self,
        bind: SocketAddr,
        shutdown: broadcast::Receiver<()>,
    ) -> Result<SocketAddr, NetworkError> {
        let listener = TcpListener::bind(bind).await?;
        let local_addr = listener.local_addr()?;
        info!("Transfer listener on {local_addr}");
        tokio::spawn(self.clone().accept_loop(listener, shutdown));
        Ok(local_addr)
    }

    async fn accept_loop(self, listener: TcpListener, mut shutdown: broadcast::Receiver<()>) {
        loop {
            tokio::select! {
                accepted = listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        let manager = self.clone();
                        tokio::spawn(async move {
                            if let Err(e) = manager.accept_transfer(stream, peer).await {
                                debug!("Transfer to {peer} ended: {e}");
                            }
                        });
                    }
                    Err(e) => warn!("Transfer accept failed: {e}"),
                },
                _ = shutdown.recv() => {
                    debug!("Transfer listener shutting down");
                    break;
                }
            }
        }
    }

    /// Serve one requester: read its request, answer from the byte source,
    /// and stream exactly the promised number of bytes.
    pub async fn accept_transfer<S>(
        &self,
        mut stream: S,
        peer: SocketAddr,
    ) -> Result<TransferSession, NetworkError>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send,
    {
        let request: TransferRequest = self.negotiate(read_frame(&mut stream)).await?;
        let mut session = TransferSession::new(
            TransferRole::Sending,
            peer,
            request.requester.as_str(),
            request.file_name.as_str(),
        );
        debug!(
            "Transfer {} requested: {} by '{}' at {peer}",
            session.id, session.file_name, session.requester
        );

        let source = match self.source.open(&request.file_name).await {
            Ok(source) => source,
            Err(e) => {
                warn!("Cannot open {} for {peer}: {e}", request.file_name);
                None
            }
        };
        let Some(source) = source else {
            let _ = self
                .negotiate(write_frame(&mut stream, &TransferResponse::not_found()))
                .await;
            session.abort("not found");
            self.emit_aborted(&session);
            return Err(NetworkError::NotFound(request.file_name));
        };

        let accepted = TransferResponse::accepted(source.size_bytes);
        if let Err(e) = self.negotiate(write_frame(&mut stream, &accepted)).await {
            return Err(self.fail(&mut session, format!("negotiation failed: {e}")));
        }
        session.begin_streaming(source.size_bytes)?;
        self.emit_started(&session);

        let reader = source.reader.take(source.size_bytes);
        if let Err(reason) = self.pump(&mut session, reader, &mut stream).await {
            return Err(self.fail(&mut session, reason));
        }
        if let Err(e) = timeout(self.config.idle_timeout, stream.shutdown()).await {
            debug!("Transfer {} shutdown timed out: {e}", session.id);
        }
        self.finish(&mut session)?;
        Ok(session)
    }

    /// Fetch `file_name` from the peer listening at `address` into the sink.
    ///
    /// `NotFound` if the peer refuses, `PeerUnavailable` if it cannot be
    /// reached, `TransferAborted` if the stream breaks. Nothing is kept from
    /// an aborted fetch.
    pub async fn initiate_transfer(
        &self,
        address: SocketAddr,
        file_name: &str,
        requester: &str,
    ) -> Result<TransferSession, NetworkError> {
        validate_file_name(file_name)?;
        let mut stream = match timeout(self.config.connect_timeout, TcpStream::connect(address)).await
        {
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) => return Err(NetworkError::PeerUnavailable(format!("{address}: {e}"))),
            Err(_) => {
                return Err(NetworkError::PeerUnavailable(format!(
                    "{address}: connect timed out"
                )));
            }
        };

        let mut session =
            TransferSession::new(TransferRole::Receiving, address, requester, file_name);
        let request = TransferRequest {
            file_name: file_name.to_string(),
            requester: requester.to_string(),
        };
        let negotiation = self.negotiate(async {
            write_frame(&mut stream, &request).await?;
            read_frame::<_, TransferResponse>(&mut stream).await
        });
        let response = match negotiation.await {
            Ok(response) => response,
            Err(e) => return Err(self.fail(&mut session, format!("negotiation failed: {e}"))),
        };

        if response.status == TransferStatus::NotFound {
            session.abort("not found");
            self.emit_aborted(&session);
            info!("{address} does not have {file_name}");
            return Err(NetworkError::NotFound(format!("{file_name} at {address}")));
        }

        session.begin_streaming(response.size_bytes)?;
        let mut writer = match self.sink.begin(session.id, file_name).await {
            Ok(writer) => writer,
            Err(e) => return Err(self.fail(&mut session, format!("cannot stage download: {e}"))),
        };
        self.emit_started(&session);

        if let Err(reason) = self.pump(&mut session, &mut stream, &mut writer).await {
            drop(writer);
            return Err(self.abort_download(&mut session, reason).await);
        }
        if let Err(e) = writer.shutdown().await {
            drop(writer);
            return Err(self.abort_download(&mut session, format!("write failed: {e}")).await);
        }
        drop(writer);
        if let Err(e) = self.sink.commit(session.id, file_name).await {
            return Err(self.abort_download(&mut session, format!("commit failed: {e}")).await);
        }
        self.finish(&mut session)?;
        Ok(session)
    }

    /// Copy until the session's negotiated size has moved. Every read and
    /// write is bounded by the idle timeout. The error is an abort reason.
    async fn pump<R, W>(
        &self,
        session: &mut TransferSession,
        mut reader: R,
        writer: &mut W,
    ) -> Result<(), String>
    where
        R: AsyncRead + Unpin,
        W: AsyncWrite + Unpin,
    {
        let total = session.size_bytes.unwrap_or_default();
        let idle = self.config.idle_timeout;
        let mut buf = vec![0u8; self.config.chunk_size.max(1)];

        while session.transferred < total {
            let remaining = total - session.transferred;
            let want = buf.len().min(usize::try_from(remaining).unwrap_or(usize::MAX));
            let n = match timeout(idle, reader.read(&mut buf[..want])).await {
                Err(_) => return Err(format!("no data for {idle:?}")),
                Ok(Err(e)) => return Err(format!("read failed: {e}")),
                Ok(Ok(0)) => return Err("stream ended early".into()),
                Ok(Ok(n)) => n,
            };
            match timeout(idle, writer.write_all(&buf[..n])).await {
                Err(_) => return Err(format!("write stalled for {idle:?}")),
                Ok(Err(e)) => return Err(format!("write failed: {e}")),
                Ok(Ok(())) => {}
            }
            session.record_progress(n as u64);
            let _ = self.events.send(TransferEvent::Progress {
                id: session.id,
                transferred: session.transferred,
                size_bytes: total,
            });
        }

        match timeout(idle, writer.flush()).await {
            Err(_) => Err(format!("flush stalled for {idle:?}")),
            Ok(Err(e)) => Err(format!("flush failed: {e}")),
            Ok(Ok(())) => Ok(()),
        }
    }

    async fn negotiate<T>(
        &self,
        exchange: impl Future<Output = Result<T, NetworkError>>,
    ) -> Result<T, NetworkError> {
        let limit = self.config.negotiation_timeout;
        timeout(limit, exchange)
            .await
            .map_err(|_| NetworkError::Timeout(limit))?
    }

    async fn abort_download(&self, session: &mut TransferSession, reason: String) -> NetworkError {
        self.sink.discard(session.id, &session.file_name).await;
        self.fail(session, reason)
    }

    /// Abort the session and return the error its caller should see.
    fn fail(&self, session: &mut TransferSession, reason: impl Into<String>) -> NetworkError {
        let reason = reason.into();
        if session.abort(reason.clone()) {
            warn!(
                "Transfer {} ({:?} {} with {}) aborted after {}/{} bytes: {reason}",
                session.id,
                session.role,
                session.file_name,
                session.peer,
                session.transferred,
                session.size_bytes.unwrap_or_default()
            );
            self.emit_aborted(session);
        }
        session.aborted_error()
    }

    fn finish(&self, session: &mut TransferSession) -> Result<(), NetworkError> {
        session.complete()?;
        let size_bytes = session.size_bytes.unwrap_or_default();
        info!(
            "Transfer {} ({:?} {} with {}) completed: {size_bytes} bytes",
            session.id, session.role, session.file_name, session.peer
        );
        let _ = self.events.send(TransferEvent::Completed {
            id: session.id,
            role: session.role,
            file_name: session.file_name.clone(),
            size_bytes,
        });
        Ok(())
    }

    fn emit_started(&self, session: &TransferSession) {
        let _ = self.events.send(TransferEvent::Started {
            id: session.id,
            role: session.role,
            peer: session.peer,
            file_name: session.file_name.clone(),
            size_bytes: session.size_bytes.unwrap_or_default(),
        });
    }

    fn emit_aborted(&self, session: &TransferSession) {
        let _ = self.events.send(TransferEvent::Aborted {
            id: session.id,
            role: session.role,
            file_name: session.file_name.clone(),
            transferred: session.transferred,
            reason: session.abort_reason.clone().unwrap_or_default(),
        });
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
