//! Client sessions: one per accepted connection, wiring a [`MessageTransport`]
//! to the application's [`ConnectionHandler`].

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use thiserror::Error;
use tokio::net::UnixStream;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::error::DaemonError;
use crate::transport::{LengthDelimitedTransport, MessageTransport};

/// Stable, per-listener-unique handle for a live session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SessionId(u64);

/// Monotonic generator for [`SessionId`]s, owned by a [`crate::SocketListener`].
#[derive(Default)]
pub(crate) struct SessionIdGen(AtomicU64);

impl SessionIdGen {
    pub(crate) fn next(&self) -> SessionId {
        SessionId(self.0.fetch_add(1, Ordering::Relaxed))
    }
}

/// Registry of live sessions for a single listener. Keyed by [`SessionId`]
/// for O(1) removal on teardown; the listener owns the `Arc` and hands a
/// clone to every session it spawns.
pub(crate) type SessionRegistry = Arc<Mutex<HashMap<SessionId, ()>>>;

/// Error an application's [`ConnectionHandler::on_message`] returns to signal
/// that the session should be torn down.
#[derive(Debug, Error)]
pub enum HandlerError {
    #[error("{0}")]
    Message(String),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl From<String> for HandlerError {
    fn from(s: String) -> Self {
        HandlerError::Message(s)
    }
}

impl From<&str> for HandlerError {
    fn from(s: &str) -> Self {
        HandlerError::Message(s.to_string())
    }
}

/// Per-connection application callbacks for one [`crate::SocketListener`].
///
/// Only `on_message` is required; the others default to the behavior named
/// in their docs.
#[async_trait]
pub trait ConnectionHandler<P: Send + Sync + 'static>: Send + Sync + 'static {
    /// Called synchronously (relative to the session's own task) right after
    /// the transport is constructed, before the session is registered.
    /// Returning `false` rejects the connection: it is torn down immediately,
    /// `on_message` is never called, and no error is reported.
    async fn on_connect(&self, _session: &Session, _private: &P) -> bool {
        true
    }

    /// Called once, when the peer disconnects or the transport reports an
    /// unrecoverable error — before the session's resources are released.
    async fn on_disconnect(&self, _session: &Session, _private: &P) {}

    /// Called once per complete inbound message, in order, never re-entrant
    /// for the same session. Returning `Err` tears the session down.
    async fn on_message(
        &self,
        session: &Session,
        msg: Bytes,
        private: &P,
    ) -> Result<(), HandlerError>;
}

struct WriteRequest {
    msg: Bytes,
    responder: oneshot::Sender<Result<(), DaemonError>>,
}

/// Handle to a live session, passed to [`ConnectionHandler`] callbacks.
///
/// Cloning is cheap (an `Arc`-backed channel handle); clones all address the
/// same underlying connection.
#[derive(Clone)]
pub struct Session {
    id: SessionId,
    write_tx: mpsc::UnboundedSender<WriteRequest>,
}

impl Session {
    /// This session's stable identifier, unique within its listener.
    pub fn id(&self) -> SessionId {
        self.id
    }

    /// Send one complete message and await the result.
    ///
    /// Resolves with the first error latched on this session (transport
    /// failure, or the session having already torn down) if one occurred,
    /// collapsing the source's `write_send`/`write_recv` pair into a single
    /// awaited call.
    pub async fn write(&self, msg: impl Into<Bytes>) -> Result<(), DaemonError> {
        let (responder, done) = oneshot::channel();
        let req = WriteRequest { msg: msg.into(), responder };
        if self.write_tx.send(req).is_err() {
            return Err(DaemonError::Transport(std::io::Error::new(
                std::io::ErrorKind::NotConnected,
                "session already torn down",
            )));
        }
        match done.await {
            Ok(result) => result,
            Err(_) => Err(DaemonError::Transport(std::io::Error::new(
                std::io::ErrorKind::NotConnected,
                "session torn down before write completed",
            ))),
        }
    }
}

/// Spawns the task owning one accepted connection's transport and read loop.
///
/// Returns `Ok(true)` if the session was accepted and registered, `Ok(false)`
/// if `on_connect` rejected it (the connection is simply closed — not an
/// error), matching the source's accept-and-reject-without-error contract.
pub(crate) async fn spawn<P: Send + Sync + 'static>(
    stream: UnixStream,
    registry: SessionRegistry,
    id_gen: Arc<SessionIdGen>,
    handler: Arc<dyn ConnectionHandler<P>>,
    private: Arc<P>,
    token: CancellationToken,
) -> bool {
    let transport = LengthDelimitedTransport::new(stream);
    spawn_with_transport(Box::new(transport), registry, id_gen, handler, private, token).await
}

pub(crate) async fn spawn_with_transport<P: Send + Sync + 'static>(
    transport: Box<dyn MessageTransport>,
    registry: SessionRegistry,
    id_gen: Arc<SessionIdGen>,
    handler: Arc<dyn ConnectionHandler<P>>,
    private: Arc<P>,
    token: CancellationToken,
) -> bool {
    let id = id_gen.next();
    let (write_tx, write_rx) = mpsc::unbounded_channel();
    let session = Session { id, write_tx };

    if !handler.on_connect(&session, &private).await {
        debug!(session_id = ?id, "connection rejected by on_connect");
        return false;
    }

    registry.lock().insert(id, ());
    tokio::spawn(run(session, transport, write_rx, registry, handler, private, token));
    true
}

async fn run<P: Send + Sync + 'static>(
    session: Session,
    mut transport: Box<dyn MessageTransport>,
    mut write_rx: mpsc::UnboundedReceiver<WriteRequest>,
    registry: SessionRegistry,
    handler: Arc<dyn ConnectionHandler<P>>,
    private: Arc<P>,
    token: CancellationToken,
) {
    let id = session.id;
    loop {
        tokio::select! {
            _ = token.cancelled() => {
                debug!(session_id = ?id, "session cancelled by listener teardown");
                break;
            }
            req = write_rx.recv() => {
                let Some(req) = req else { continue };
                let result = transport.send(&req.msg).await.map_err(DaemonError::Transport);
                let _ = req.responder.send(result);
            }
            msg = transport.recv() => {
                match msg {
                    Ok(Some(bytes)) => {
                        if let Err(e) = handler.on_message(&session, bytes, &private).await {
                            warn!(session_id = ?id, error = %e, "on_message failed, tearing down session");
                            break;
                        }
                    }
                    Ok(None) => {
                        debug!(session_id = ?id, "peer disconnected");
                        handler.on_disconnect(&session, &private).await;
                        break;
                    }
                    Err(e) => {
                        warn!(session_id = ?id, error = %e, "transport error, tearing down session");
                        handler.on_disconnect(&session, &private).await;
                        break;
                    }
                }
            }
        }
    }

    registry.lock().remove(&id);
    // Drain any writers still waiting, so `Session::write` never hangs.
    write_rx.close();
    while let Ok(req) = write_rx.try_recv() {
        let _ = req.responder.send(Err(DaemonError::Transport(std::io::Error::new(
            std::io::ErrorKind::NotConnected,
            "session torn down",
        ))));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicBool;
    use tokio::net::UnixListener;

    struct Echo;

    #[async_trait]
    impl ConnectionHandler<()> for Echo {
        async fn on_message(
            &self,
            session: &Session,
            msg: Bytes,
            _private: &(),
        ) -> Result<(), HandlerError> {
            session.write(msg).await.map_err(|e| HandlerError::Message(e.to_string()))
        }
    }

    struct Reject;

    #[async_trait]
    impl ConnectionHandler<()> for Reject {
        async fn on_connect(&self, _session: &Session, _private: &()) -> bool {
            false
        }

        async fn on_message(&self, _s: &Session, _m: Bytes, _p: &()) -> Result<(), HandlerError> {
            panic!("on_message must never be called for a rejected connection");
        }
    }

    struct DisconnectFlag(Arc<AtomicBool>);

    #[async_trait]
    impl ConnectionHandler<()> for DisconnectFlag {
        async fn on_disconnect(&self, _session: &Session, _private: &()) {
            self.0.store(true, Ordering::SeqCst);
        }

        async fn on_message(&self, _s: &Session, _m: Bytes, _p: &()) -> Result<(), HandlerError> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn echo_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("t.sock");
        let listener = UnixListener::bind(&path).unwrap();
        let registry: SessionRegistry = Arc::new(Mutex::new(HashMap::new()));
        let id_gen = Arc::new(SessionIdGen::default());
        let token = CancellationToken::new();

        let client = tokio::spawn({
            let path = path.clone();
            async move {
                let stream = UnixStream::connect(&path).await.unwrap();
                let mut t = LengthDelimitedTransport::new(stream);
                t.send(b"hello").await.unwrap();
                t.recv().await.unwrap()
            }
        });

        let (stream, _) = listener.accept().await.unwrap();
        let accepted = spawn::<()>(
            stream,
            registry.clone(),
            id_gen,
            Arc::new(Echo),
            Arc::new(()),
            token.child_token(),
        )
        .await;
        assert!(accepted);

        let echoed = client.await.unwrap().unwrap();
        assert_eq!(&echoed[..], b"hello");
    }

    #[tokio::test]
    async fn on_connect_false_rejects_without_registering() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("t.sock");
        let listener = UnixListener::bind(&path).unwrap();
        let registry: SessionRegistry = Arc::new(Mutex::new(HashMap::new()));
        let id_gen = Arc::new(SessionIdGen::default());
        let token = CancellationToken::new();

        let _client = tokio::spawn({
            let path = path.clone();
            async move { UnixStream::connect(&path).await.unwrap() }
        });

        let (stream, _) = listener.accept().await.unwrap();
        let accepted = spawn::<()>(
            stream,
            registry.clone(),
            id_gen,
            Arc::new(Reject),
            Arc::new(()),
            token.child_token(),
        )
        .await;
        assert!(!accepted);
        assert_eq!(registry.lock().len(), 0);
    }

    #[tokio::test]
    async fn disconnect_fires_before_session_released() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("t.sock");
        let listener = UnixListener::bind(&path).unwrap();
        let registry: SessionRegistry = Arc::new(Mutex::new(HashMap::new()));
        let id_gen = Arc::new(SessionIdGen::default());
        let token = CancellationToken::new();
        let flag = Arc::new(AtomicBool::new(false));

        tokio::spawn({
            let path = path.clone();
            async move {
                let _stream = UnixStream::connect(&path).await.unwrap();
            }
        });

        let (stream, _) = listener.accept().await.unwrap();
        spawn::<()>(
            stream,
            registry.clone(),
            id_gen,
            Arc::new(DisconnectFlag(flag.clone())),
            Arc::new(()),
            token.child_token(),
        )
        .await;

        // Give the spawned session task a chance to observe EOF and run.
        for _ in 0..50 {
            if flag.load(Ordering::SeqCst) && registry.lock().is_empty() {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }

        assert!(flag.load(Ordering::SeqCst), "on_disconnect should have fired");
        assert!(registry.lock().is_empty(), "session should be deregistered");
    }
}
