//! ---
//! ems_section: "01-core-functionality"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Debounced reading-log change notifications with a polling fallback."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
use std::ffi::OsString;
use std::path::Path;
use std::time::Duration;

use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use r_gw_rt::RateLimiter;
use tokio::sync::mpsc;
use tracing::{debug, warn};

/// Why the forwarder was woken.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Trigger {
    /// The log file changed on disk.
    Changed,
    /// The fallback interval elapsed.
    Fallback,
}

/// Debounced change notification for the reading log with a fallback
/// polling interval. When the OS watcher cannot be installed only the
/// fallback interval fires.
pub struct LogWatcher {
    _watcher: Option<RecommendedWatcher>,
    events: mpsc::UnboundedReceiver<()>,
    debounce: Duration,
    fallback: RateLimiter,
}

impl LogWatcher {
    pub fn new(log_path: &Path, debounce: Duration, fallback: Duration) -> Self {
        let (tx, events) = mpsc::unbounded_channel();
        let watcher = match install(log_path, tx) {
            Ok(watcher) => Some(watcher),
            Err(err) => {
                warn!(log = %log_path.display(), error = %err, "file watcher unavailable; polling only");
                None
            }
        };
        Self {
            _watcher: watcher,
            events,
            debounce,
            fallback: RateLimiter::new(fallback),
        }
    }

    /// Fallback-only trigger.
    pub fn polling(fallback: Duration) -> Self {
        let (_, events) = mpsc::unbounded_channel();
        Self {
            _watcher: None,
            events,
            debounce: Duration::ZERO,
            fallback: RateLimiter::new(fallback),
        }
    }

    /// Wait for the next trigger. Bursts of change events within the
    /// debounce window collapse into one.
    pub async fn next(&mut self) -> Trigger {
        tokio::select! {
            Some(()) = self.events.recv() => {
                tokio::time::sleep(self.debounce).await;
                while self.events.try_recv().is_ok() {}
                Trigger::Changed
            }
            _ = self.fallback.tick() => Trigger::Fallback,
        }
    }
}

fn install(log_path: &Path, tx: mpsc::UnboundedSender<()>) -> notify::Result<RecommendedWatcher> {
    let file_name: Option<OsString> = log_path.file_name().map(OsString::from);
    let dir = match log_path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
        _ => Path::new(".").to_path_buf(),
    };
    std::fs::create_dir_all(&dir).map_err(notify::Error::io)?;

    let mut watcher = notify::recommended_watcher(move |res: notify::Result<Event>| match res {
        Ok(event) => {
            let relevant = matches!(event.kind, EventKind::Create(_) | EventKind::Modify(_))
                && event
                    .paths
                    .iter()
                    .any(|path| path.file_name().map(OsString::from) == file_name);
            if relevant {
                let _ = tx.send(());
            }
        }
        Err(err) => warn!(error = %err, "file watch error"),
    })?;
    watcher.watch(&dir, RecursiveMode::NonRecursive)?;
    debug!(dir = %dir.display(), "watching reading log directory");
    Ok(watcher)
}

impl std::fmt::Debug for LogWatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LogWatcher")
            .field("os_watcher", &self._watcher.is_some())
            .field("debounce", &self.debounce)
            .finish()
    }
}
