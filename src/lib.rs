//! Framework for Unix-domain-socket daemons: multi-listener accept loops,
//! per-connection client sessions, and a lifecycle controller with
//! signal-driven reconfigure/shutdown and optional parent-PID liveness
//! watching.
//!
//! An embedding application implements [`ConnectionHandler`] for its wire
//! protocol and, optionally, [`DaemonHooks`] for startup/reconfigure/
//! shutdown behavior, then drives everything from a [`Controller`]:
//!
//! ```no_run
//! use std::sync::Arc;
//! use async_trait::async_trait;
//! use bytes::Bytes;
//! use sockd::{ConnectionHandler, Controller, HandlerError, ListenerOptions, Session};
//!
//! struct Echo;
//!
//! #[async_trait]
//! impl ConnectionHandler<()> for Echo {
//!     async fn on_message(&self, session: &Session, msg: Bytes, _private: &()) -> Result<(), HandlerError> {
//!         session.write(msg).await.map_err(|e| e.to_string().into())
//!     }
//! }
//!
//! # async fn run() -> Result<(), sockd::DaemonError> {
//! let mut controller = Controller::new(Arc::new(()), Arc::new(()), Some("/run/echod.pid"))?;
//! controller.add_unix("/run/echod.sock", Arc::new(Echo), ListenerOptions::default())?;
//! controller.run().await?;
//! # Ok(())
//! # }
//! ```
//!
//! This crate never installs a `tracing` subscriber on its own — call
//! [`logging::init`] (or set one up yourself) before constructing a
//! [`Controller`] if you want its events on screen.

#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]
#![cfg_attr(test, allow(clippy::panic))]

mod controller;
mod error;
mod listener;
mod logging;
mod pidfile;
mod session;
mod transport;

pub use controller::{Controller, DaemonHooks};
pub use error::{DaemonError, ExitReason};
pub use listener::{ListenerOptions, SocketListener};
pub use logging::{init as init_logging, LogTarget};
pub use pidfile::PidFile;
pub use session::{ConnectionHandler, HandlerError, Session, SessionId};
pub use transport::{LengthDelimitedTransport, MessageTransport};

#[cfg(feature = "test-util")]
#[doc(hidden)]
pub use listener::AcceptSource;

/// Ignore `SIGPIPE`, restoring the default most non-Unix runtimes already
/// have: a write to a peer that hung up fails with `EPIPE` instead of
/// killing the process. Every [`Session`] write already goes through this
/// crate's own session task, which turns a broken pipe into a normal
/// transport error, so without this the only thing `SIGPIPE`'s default
/// disposition can do is take the whole daemon down. Call it once, before
/// [`Controller::run`].
pub fn ignore_sigpipe() -> Result<(), DaemonError> {
    // SAFETY: touches only this process's signal disposition table.
    #[allow(unsafe_code)]
    let rc = unsafe { libc::signal(libc::SIGPIPE, libc::SIG_IGN) };
    if rc == libc::SIG_ERR {
        return Err(DaemonError::Signal(std::io::Error::last_os_error()));
    }
    Ok(())
}
