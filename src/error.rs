//! Error and exit-reason types crossing the framework's public API boundary.

use std::io;
use std::path::PathBuf;

use thiserror::Error;

/// Errors surfaced by the framework's public API.
///
/// Per-session transport failures never reach this type directly — they are
/// observed only through a session's own [`crate::Session::write`] calls or
/// logged and the session torn down (see [`crate::ConnectionHandler`]).
#[derive(Debug, Error)]
pub enum DaemonError {
    /// A socket path exceeds the platform's `sockaddr_un` path capacity, or a
    /// required callback was missing.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// Socket bind/listen, PID-file I/O, or a terminal accept-loop failure.
    #[error("I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// A PID file lock could not be acquired — another instance is running.
    #[error("daemon already running (pid file {0} is locked)")]
    AlreadyRunning(PathBuf),

    /// A session's transport read or write failed. Local to that session;
    /// never propagates out of [`crate::Controller::run`].
    #[error("transport error: {0}")]
    Transport(#[from] io::Error),

    /// Registering a Unix signal handler failed (signal already taken by
    /// another handler in-process, or the platform does not support it).
    #[error("failed to install signal handler: {0}")]
    Signal(#[source] io::Error),
}

/// The ways [`crate::Controller::run`] can resolve — not all of them happy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExitReason {
    /// `SIGINT` or `SIGTERM` was received.
    Interrupted,
    /// The watched PID (see [`crate::Controller::watch_pid`]) no longer
    /// exists.
    PidGone,
    /// A listener's accept loop ended on its own — a terminal accept
    /// error, or its task panicked — before any shutdown was requested.
    /// Carries a description of the failure that triggered it.
    Failed(String),
}
