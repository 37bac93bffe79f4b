//! Daemon lifecycle: startup hooks, signal-driven reconfigure/shutdown, and
//! optional parent-PID liveness watching, tying together however many
//! [`SocketListener`]s the embedding application registers.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::stream::{FuturesUnordered, StreamExt};
use nix::errno::Errno;
use nix::sys::signal::kill;
use nix::unistd::Pid;
use tokio::signal::unix::{signal, SignalKind};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::error::{DaemonError, ExitReason};
use crate::listener::{ListenerOptions, SocketListener};
use crate::pidfile::PidFile;
use crate::session::ConnectionHandler;

/// Delay before the first watched-PID liveness probe.
const INITIAL_PID_WATCH_DELAY: Duration = Duration::from_secs(1);
/// Delay between every probe after the first.
const PID_WATCH_INTERVAL: Duration = Duration::from_secs(5);

/// Application-level lifecycle callbacks. All default to doing nothing, so
/// an application only implements the hooks it cares about.
#[async_trait]
pub trait DaemonHooks<P: Send + Sync + 'static>: Send + Sync + 'static {
    /// Called once, after every registered listener's accept loop has been
    /// spawned, before [`Controller::run`] starts waiting on signals.
    async fn on_startup(&self, _private: &P) {}

    /// Called on `SIGHUP`. Runs to completion before the next signal or
    /// PID-watch tick is serviced — two overlapping reconfigures never run
    /// concurrently.
    async fn on_reconfigure(&self, _private: &P) {}

    /// Called once, after every listener has finished tearing down
    /// (sockets unlinked, sessions released) but before the PID file is
    /// released.
    async fn on_shutdown(&self, _private: &P) {}
}

/// No-op hooks, for applications that only care about listeners and
/// sessions and have nothing to do on startup, reconfigure, or shutdown.
#[async_trait]
impl DaemonHooks<()> for () {}

/// Owns every registered listener and drives the daemon's lifecycle.
///
/// Dropping a `Controller` does not shut it down gracefully — call
/// [`Controller::run`] and let a signal or watched-PID loss end it, or call
/// [`Controller::shutdown`] from another task to end it early.
pub struct Controller<P> {
    listeners: Vec<Arc<SocketListener<P>>>,
    hooks: Arc<dyn DaemonHooks<P>>,
    private: Arc<P>,
    token: CancellationToken,
    pid_file: Option<PidFile>,
    pid_watch: Option<u32>,
}

impl<P: Send + Sync + 'static> Controller<P> {
    /// Start building a controller. `pid_file`, if given, is acquired
    /// immediately (see [`PidFile::acquire`]) so a second instance of the
    /// daemon fails fast, before any socket is bound.
    pub fn new(
        hooks: Arc<dyn DaemonHooks<P>>,
        private: Arc<P>,
        pid_file: Option<impl Into<std::path::PathBuf>>,
    ) -> Result<Self, DaemonError> {
        let pid_file = pid_file.map(PidFile::acquire).transpose()?;
        Ok(Self {
            listeners: Vec::new(),
            hooks,
            private,
            token: CancellationToken::new(),
            pid_file,
            pid_watch: None,
        })
    }

    /// Watch `pid` for liveness with a zero-signal `kill` probe, ending
    /// [`Controller::run`] with [`ExitReason::PidGone`] once the process
    /// disappears. Typically the daemon's own parent, so it exits when
    /// whatever spawned it dies.
    ///
    /// The first probe fires one second after [`Controller::run`] starts;
    /// every probe after that is five seconds apart.
    pub fn watch_pid(&mut self, pid: u32) {
        self.pid_watch = Some(pid);
    }

    /// Bind and register a new Unix listener. Its accept loop is spawned
    /// when [`Controller::run`] starts, not before.
    ///
    /// `opts.remove_stale` is overridden here: it is always set to whether
    /// this controller holds an active PID file. A daemon that has proven
    /// (via the PID lock) that no other instance is running may safely
    /// unlink a stale socket left by an unclean previous exit; a daemon
    /// with no PID file has no such proof and must not clobber a socket
    /// another process might still own.
    pub fn add_unix(
        &mut self,
        path: impl Into<std::path::PathBuf>,
        handler: Arc<dyn ConnectionHandler<P>>,
        opts: ListenerOptions,
    ) -> Result<(), DaemonError> {
        let opts = ListenerOptions { remove_stale: self.pid_file.is_some(), ..opts };
        let listener =
            SocketListener::bind(path, handler, self.private.clone(), opts, &self.token)?;
        self.listeners.push(Arc::new(listener));
        Ok(())
    }

    /// Cancel the run loop from outside, as if a shutdown signal had been
    /// received. Useful for tests and for embedding applications that have
    /// their own reason to end the daemon.
    pub fn shutdown(&self) {
        self.token.cancel();
    }

    /// Run until interrupted: spawn every listener's accept loop, call
    /// `on_startup`, then service signals, PID-watch ticks, and listener
    /// task completions until `SIGINT`/`SIGTERM` arrives, the watched PID
    /// disappears, a listener ends on its own, or [`Controller::shutdown`]
    /// is called — at which point every listener and session is torn down,
    /// `on_shutdown` runs, and the PID file (if any) is released.
    pub async fn run(mut self) -> Result<ExitReason, DaemonError> {
        let mut sigterm = signal(SignalKind::terminate()).map_err(DaemonError::Signal)?;
        let mut sigint = signal(SignalKind::interrupt()).map_err(DaemonError::Signal)?;
        let mut sighup = signal(SignalKind::hangup()).map_err(DaemonError::Signal)?;

        let mut listener_tasks: FuturesUnordered<JoinHandle<Result<(), DaemonError>>> =
            self.listeners.iter().map(|l| tokio::spawn(l.clone().run())).collect();

        self.hooks.on_startup(&self.private).await;
        info!(listeners = self.listeners.len(), "controller started");

        let mut pid_watch_delay = self.pid_watch.map(|_| INITIAL_PID_WATCH_DELAY);

        let exit_reason = loop {
            let current_delay = pid_watch_delay;
            let pid_tick = async {
                match current_delay {
                    Some(d) => tokio::time::sleep(d).await,
                    None => std::future::pending().await,
                }
            };

            tokio::select! {
                _ = self.token.cancelled() => {
                    break ExitReason::Interrupted;
                }
                _ = sigterm.recv() => {
                    info!("received SIGTERM");
                    break ExitReason::Interrupted;
                }
                _ = sigint.recv() => {
                    info!("received SIGINT");
                    break ExitReason::Interrupted;
                }
                _ = sighup.recv() => {
                    info!("received SIGHUP, reconfiguring");
                    self.hooks.on_reconfigure(&self.private).await;
                }
                _ = pid_tick => {
                    if let Some(pid) = self.pid_watch {
                        if !pid_alive(pid) {
                            info!(pid, "watched pid is gone");
                            break ExitReason::PidGone;
                        }
                        pid_watch_delay = Some(PID_WATCH_INTERVAL);
                    }
                }
                Some(joined) = listener_tasks.next(), if !listener_tasks.is_empty() => {
                    break match joined {
                        Ok(Ok(())) => {
                            warn!("a listener exited before any shutdown was requested");
                            ExitReason::Failed("listener exited unexpectedly".to_string())
                        }
                        Ok(Err(e)) => {
                            warn!(error = %e, "listener failed");
                            ExitReason::Failed(e.to_string())
                        }
                        Err(join_err) => {
                            warn!(error = %join_err, "listener task panicked");
                            ExitReason::Failed(join_err.to_string())
                        }
                    };
                }
            }
        };

        self.token.cancel();
        for listener in &self.listeners {
            listener.shutdown();
        }
        while listener_tasks.next().await.is_some() {}

        self.hooks.on_shutdown(&self.private).await;

        if let Some(pid_file) = self.pid_file.take() {
            pid_file.release();
        }

        Ok(exit_reason)
    }
}

/// Zero-signal liveness probe: `true` if `pid` still exists, `false` if
/// it's gone (`ESRCH`). Any other error (e.g. permission) is logged and
/// treated as "still alive" — an unreadable process is not the same claim
/// as a dead one.
fn pid_alive(pid: u32) -> bool {
    match kill(Pid::from_raw(pid as i32), None) {
        Ok(()) => true,
        Err(Errno::ESRCH) => false,
        Err(e) => {
            warn!(pid, error = %e, "pid liveness probe failed, assuming alive");
            true
        }
    }
}
