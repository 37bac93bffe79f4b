//! Tracing subscriber initialization for embedding applications.
//!
//! The framework only emits `tracing` events; it never installs a global
//! subscriber on its own (a library doing so would fight an embedding
//! binary's own setup). Call [`init`] once, at process start, before
//! constructing a [`crate::Controller`].

use std::path::Path;

use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, EnvFilter};

/// Where log output should go.
pub enum LogTarget<'a> {
    /// Human-readable lines on stderr, filtered by `env_var` (falls back to
    /// `info` when unset or unparsable).
    Stderr { env_var: &'static str },
    /// Newline-delimited JSON appended to `path`, via a non-blocking writer
    /// so logging never stalls the daemon on disk I/O.
    JsonFile { path: &'a Path, env_var: &'static str },
}

/// Initializes the global `tracing` subscriber for the given target.
///
/// For [`LogTarget::JsonFile`], returns a [`WorkerGuard`] that must be kept
/// alive for the duration of the process (dropping it stops the background
/// flush task) — callers typically store it in a `static` or hold it in
/// `main`'s local scope.
///
/// Safe to call more than once; a second call is a no-op (the global
/// subscriber can only be set once per process).
pub fn init(target: LogTarget<'_>) -> Option<WorkerGuard> {
    match target {
        LogTarget::Stderr { env_var } => {
            let filter =
                EnvFilter::try_from_env(env_var).unwrap_or_else(|_| EnvFilter::new("info"));
            let _ = fmt().with_env_filter(filter).with_target(false).with_writer(std::io::stderr).try_init();
            None
        }
        LogTarget::JsonFile { path, env_var } => {
            if let Some(parent) = path.parent() {
                let _ = std::fs::create_dir_all(parent);
            }
            let file = match std::fs::OpenOptions::new().create(true).append(true).open(path) {
                Ok(f) => f,
                Err(_) => return None,
            };
            let (writer, guard) = tracing_appender::non_blocking(file);
            let filter =
                EnvFilter::try_from_env(env_var).unwrap_or_else(|_| EnvFilter::new("info"));
            let _ = fmt()
                .with_env_filter(filter)
                .with_target(false)
                .json()
                .with_writer(writer)
                .try_init();
            Some(guard)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn json_file_target_creates_parent_dirs() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("daemon.log");
        let _guard = init(LogTarget::JsonFile { path: &path, env_var: "SOCKD_LOG_TEST_NESTED" });
        assert!(path.parent().unwrap().is_dir());
    }
}
