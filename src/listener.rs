//! A single bound Unix-domain listener and its accept loop.

use std::collections::HashMap;
use std::os::unix::ffi::OsStrExt;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::net::{UnixListener, UnixStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::DaemonError;
use crate::session::{self, ConnectionHandler, SessionIdGen, SessionRegistry};

/// `sockaddr_un.sun_path` capacity on this platform, including the NUL
/// terminator — a path must fit within it or `bind(2)` never even runs.
const SUN_PATH_CAPACITY: usize =
    std::mem::size_of::<libc::sockaddr_un>() - std::mem::size_of::<libc::sa_family_t>();

/// Errno values `accept(2)` can return for a condition local to the one
/// connection being accepted, or to a transient resource shortage — never
/// for the listening socket itself being broken. The accept loop logs and
/// keeps running for any of these; anything else is request-level and
/// ends the loop.
const SOFT_ACCEPT_ERRNOS: &[i32] = &[
    libc::ECONNABORTED,
    libc::EMFILE,
    libc::ENFILE,
    libc::ENOBUFS,
    libc::ENOMEM,
    libc::EPROTO,
    libc::EINTR,
    libc::EAGAIN,
];

fn is_soft_accept_error(err: &std::io::Error) -> bool {
    matches!(err.raw_os_error(), Some(errno) if SOFT_ACCEPT_ERRNOS.contains(&errno))
}

/// The accept side of a listener, abstracted so tests can inject failures
/// a real kernel socket won't reliably produce on demand.
///
/// Hidden from the crate's documentation: it exists only so an integration
/// test can exercise the accept loop's soft/hard error handling through
/// [`SocketListener::bind_with_source`] without reaching into crate
/// internals.
#[doc(hidden)]
#[async_trait]
pub trait AcceptSource: Send + Sync {
    async fn accept(&self) -> std::io::Result<UnixStream>;
}

#[async_trait]
impl AcceptSource for UnixListener {
    async fn accept(&self) -> std::io::Result<UnixStream> {
        let (stream, _addr) = UnixListener::accept(self).await?;
        Ok(stream)
    }
}

/// Knobs for [`SocketListener::bind`] beyond the socket path itself.
#[derive(Debug, Clone, Default)]
pub struct ListenerOptions {
    /// Restrict the socket's file permissions to the owner only (`0600`)
    /// once bound, instead of leaving them at the process umask's default.
    pub private: bool,
    /// Unlink a pre-existing file at the path before binding. Without this,
    /// a stale socket from an unclean previous exit causes `bind` to fail
    /// with `AddrInUse`. [`crate::Controller::add_unix`] derives this from
    /// whether the controller holds an active PID file rather than taking
    /// it from the caller.
    pub remove_stale: bool,
}

/// One bound Unix listener: its accept loop and the sessions it has
/// accepted, all torn down together when [`SocketListener::shutdown`] is
/// called or the parent token is cancelled.
pub struct SocketListener<P> {
    path: PathBuf,
    inner: Box<dyn AcceptSource>,
    handler: Arc<dyn ConnectionHandler<P>>,
    private: Arc<P>,
    registry: SessionRegistry,
    id_gen: Arc<SessionIdGen>,
    token: CancellationToken,
}

impl<P: Send + Sync + 'static> SocketListener<P> {
    /// Bind a new listener at `path`.
    ///
    /// `parent` becomes this listener's cancellation parent: cancelling it
    /// (directly, or by cancelling an ancestor) tears the listener and every
    /// session it has accepted down without any of them calling back here.
    pub fn bind(
        path: impl Into<PathBuf>,
        handler: Arc<dyn ConnectionHandler<P>>,
        private: Arc<P>,
        opts: ListenerOptions,
        parent: &CancellationToken,
    ) -> Result<Self, DaemonError> {
        let path = path.into();
        let len = path.as_os_str().as_bytes().len();
        if len >= SUN_PATH_CAPACITY {
            return Err(DaemonError::InvalidArgument(format!(
                "socket path {} is {len} bytes, exceeds sun_path capacity of {SUN_PATH_CAPACITY}",
                path.display(),
            )));
        }

        if opts.remove_stale {
            match std::fs::remove_file(&path) {
                Ok(()) => debug!(path = %path.display(), "removed stale socket"),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(source) => return Err(DaemonError::Io { path: path.clone(), source }),
            }
        }

        let inner =
            UnixListener::bind(&path).map_err(|source| DaemonError::Io { path: path.clone(), source })?;

        if opts.private {
            let perms = std::fs::Permissions::from_mode(0o600);
            std::fs::set_permissions(&path, perms)
                .map_err(|source| DaemonError::Io { path: path.clone(), source })?;
        }

        Ok(Self::from_parts(path, Box::new(inner), handler, private, parent))
    }

    /// Bind-equivalent entry point for tests: takes an [`AcceptSource`]
    /// directly instead of binding a real `UnixListener`, so a test can make
    /// `accept()` fail on demand. Skips path-length validation and stale-file
    /// removal, neither of which this property needs.
    #[doc(hidden)]
    #[cfg(feature = "test-util")]
    pub fn bind_with_source(
        path: impl Into<PathBuf>,
        source: impl AcceptSource + 'static,
        handler: Arc<dyn ConnectionHandler<P>>,
        private: Arc<P>,
        parent: &CancellationToken,
    ) -> Self {
        Self::from_parts(path.into(), Box::new(source), handler, private, parent)
    }

    fn from_parts(
        path: PathBuf,
        inner: Box<dyn AcceptSource>,
        handler: Arc<dyn ConnectionHandler<P>>,
        private: Arc<P>,
        parent: &CancellationToken,
    ) -> Self {
        Self {
            path,
            inner,
            handler,
            private,
            registry: Arc::new(Mutex::new(HashMap::new())),
            id_gen: Arc::new(SessionIdGen::default()),
            token: parent.child_token(),
        }
    }

    /// Path this listener is bound to.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Number of sessions currently accepted and live on this listener.
    pub fn session_count(&self) -> usize {
        self.registry.lock().len()
    }

    /// Cancel this listener's accept loop and every session it owns.
    /// Idempotent; safe to call more than once or after the loop has
    /// already exited on its own.
    pub fn shutdown(&self) {
        self.token.cancel();
    }

    /// Run the accept loop until cancelled or a terminal accept failure.
    /// Each accepted connection is handed to a freshly spawned session task
    /// immediately, so a slow `on_connect` on one connection never delays
    /// accepting the next.
    ///
    /// A transient, per-connection accept error (resource exhaustion, a
    /// connection reset before the kernel handed it off) is logged and the
    /// loop keeps running. Anything else — a failure of the listening
    /// socket itself — is terminal: the loop exits and `Err` is returned
    /// so [`crate::Controller::run`] can treat it as this listener's
    /// failure rather than silently going deaf.
    pub async fn run(self: Arc<Self>) -> Result<(), DaemonError> {
        let result = loop {
            tokio::select! {
                _ = self.token.cancelled() => {
                    debug!(path = %self.path.display(), "listener cancelled");
                    break Ok(());
                }
                accepted = self.inner.accept() => {
                    match accepted {
                        Ok(stream) => {
                            let registry = self.registry.clone();
                            let id_gen = self.id_gen.clone();
                            let handler = self.handler.clone();
                            let private = self.private.clone();
                            let child = self.token.child_token();
                            tokio::spawn(async move {
                                session::spawn(stream, registry, id_gen, handler, private, child).await;
                            });
                        }
                        Err(source) if is_soft_accept_error(&source) => {
                            warn!(path = %self.path.display(), error = %source, "transient accept error, continuing");
                        }
                        Err(source) => {
                            warn!(path = %self.path.display(), error = %source, "terminal accept error, listener exiting");
                            break Err(DaemonError::Io { path: self.path.clone(), source });
                        }
                    }
                }
            }
        };

        match std::fs::remove_file(&self.path) {
            Ok(()) => info!(path = %self.path.display(), "listener socket removed"),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(source) => warn!(path = %self.path.display(), error = %source, "failed to remove listener socket"),
        }

        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::{HandlerError, Session};
    use bytes::Bytes;
    use std::sync::atomic::{AtomicU32, Ordering};

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

    /// Delegates to a real listener, but fails the first `failures`
    /// accepts with a soft, transient errno before letting real
    /// connections through.
    struct FlakyAcceptor {
        inner: UnixListener,
        remaining_soft_failures: AtomicU32,
    }

    #[async_trait]
    impl AcceptSource for FlakyAcceptor {
        async fn accept(&self) -> std::io::Result<UnixStream> {
            loop {
                let remaining = self.remaining_soft_failures.load(Ordering::SeqCst);
                if remaining == 0 {
                    let (stream, _addr) = self.inner.accept().await?;
                    return Ok(stream);
                }
                self.remaining_soft_failures.store(remaining - 1, Ordering::SeqCst);
                return Err(std::io::Error::from_raw_os_error(libc::ECONNABORTED));
            }
        }
    }

    #[test]
    fn rejects_path_over_sun_path_capacity() {
        let dir = tempfile::tempdir().unwrap();
        let long_name = "x".repeat(SUN_PATH_CAPACITY);
        let path = dir.path().join(long_name);
        let token = CancellationToken::new();
        let result = SocketListener::<()>::bind(
            path,
            Arc::new(Echo),
            Arc::new(()),
            ListenerOptions::default(),
            &token,
        );
        assert!(matches!(result, Err(DaemonError::InvalidArgument(_))));
    }

    #[test]
    fn remove_stale_unlinks_preexisting_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("stale.sock");
        std::fs::write(&path, b"not a socket").unwrap();
        let token = CancellationToken::new();
        let listener = SocketListener::<()>::bind(
            &path,
            Arc::new(Echo),
            Arc::new(()),
            ListenerOptions { private: false, remove_stale: true },
            &token,
        );
        assert!(listener.is_ok());
    }

    #[tokio::test]
    async fn cancelling_parent_stops_accept_loop_and_unlinks_socket() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("t.sock");
        let parent = CancellationToken::new();
        let listener = Arc::new(
            SocketListener::<()>::bind(
                &path,
                Arc::new(Echo),
                Arc::new(()),
                ListenerOptions::default(),
                &parent,
            )
            .unwrap(),
        );

        let run_task = tokio::spawn(listener.clone().run());
        parent.cancel();
        assert!(run_task.await.unwrap().is_ok());

        assert!(!path.exists());
    }

    #[tokio::test]
    async fn accepted_connection_is_registered_and_served() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("t.sock");
        let parent = CancellationToken::new();
        let listener = Arc::new(
            SocketListener::<()>::bind(
                &path,
                Arc::new(Echo),
                Arc::new(()),
                ListenerOptions::default(),
                &parent,
            )
            .unwrap(),
        );

        let run_task = tokio::spawn(listener.clone().run());

        let mut client = {
            let stream = UnixStream::connect(&path).await.unwrap();
            crate::transport::LengthDelimitedTransport::new(stream)
        };
        use crate::transport::MessageTransport;
        client.send(b"ping").await.unwrap();
        let reply = client.recv().await.unwrap().unwrap();
        assert_eq!(&reply[..], b"ping");

        for _ in 0..50 {
            if listener.session_count() == 1 {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
        assert_eq!(listener.session_count(), 1);

        parent.cancel();
        assert!(run_task.await.unwrap().is_ok());
    }

    #[tokio::test]
    async fn transient_accept_errors_are_logged_and_the_loop_keeps_serving() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("t.sock");
        let real = UnixListener::bind(&path).unwrap();
        let acceptor = FlakyAcceptor { inner: real, remaining_soft_failures: AtomicU32::new(3) };
        let parent = CancellationToken::new();
        let listener = Arc::new(SocketListener::from_parts(
            path.clone(),
            Box::new(acceptor),
            Arc::new(Echo),
            Arc::new(()),
            &parent,
        ));

        let run_task = tokio::spawn(listener.clone().run());

        let mut client = {
            let stream = UnixStream::connect(&path).await.unwrap();
            crate::transport::LengthDelimitedTransport::new(stream)
        };
        use crate::transport::MessageTransport;
        client.send(b"still works").await.unwrap();
        let reply = client.recv().await.unwrap().unwrap();
        assert_eq!(&reply[..], b"still works");

        parent.cancel();
        assert!(run_task.await.unwrap().is_ok());
    }

    struct AlwaysBroken;

    #[async_trait]
    impl AcceptSource for AlwaysBroken {
        async fn accept(&self) -> std::io::Result<UnixStream> {
            Err(std::io::Error::from(std::io::ErrorKind::InvalidInput))
        }
    }

    #[tokio::test]
    async fn terminal_accept_error_ends_the_loop_with_err() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("t.sock");
        let parent = CancellationToken::new();
        let listener = Arc::new(SocketListener::from_parts(
            path,
            Box::new(AlwaysBroken),
            Arc::new(Echo),
            Arc::new(()),
            &parent,
        ));

        let result = listener.run().await;
        assert!(matches!(result, Err(DaemonError::Io { .. })));
    }
}
