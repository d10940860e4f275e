use log::{debug, info, warn};
use notify::{RecommendedWatcher, RecursiveMode, Watcher};
use notify_debouncer_mini::{new_debouncer, DebounceEventResult, Debouncer};
use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::sync::mpsc::{self, error::TrySendError, Receiver, Sender};
use tokio::time::{interval, Interval, MissedTickBehavior};

/// Why the status file should be parsed again.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchTrigger {
    Changed,
    Poll,
}

/// Turns status file modifications into parse triggers.
///
/// Change notifications are debounced and funnelled through a channel of
/// capacity one, so any burst of writes collapses into a single pending
/// trigger. A polling interval always runs next to it and keeps the loop
/// moving when notifications are unavailable.
pub struct StatusFileWatcher {
    rx: Receiver<()>,
    // Kept alive for as long as notifications should flow.
    debouncer: Option<Debouncer<RecommendedWatcher>>,
    poll: Interval,
}

impl StatusFileWatcher {
    pub fn new(path: &Path, debounce: Duration, poll_every: Duration, notifications: bool) -> Self {
        let (tx, rx) = mpsc::channel(1);
        let debouncer = if notifications {
            match Self::start_debouncer(path, debounce, tx) {
                Ok(d) => {
                    info!("Watching {} for changes", path.display());
                    Some(d)
                }
                Err(e) => {
                    warn!(
                        "File notifications unavailable for {} ({}), polling every {:?}",
                        path.display(),
                        e,
                        poll_every
                    );
                    None
                }
            }
        } else {
            info!("Polling {} every {:?}", path.display(), poll_every);
            None
        };

        let mut poll = interval(poll_every);
        poll.set_missed_tick_behavior(MissedTickBehavior::Delay);

        Self {
            rx,
            debouncer,
            poll,
        }
    }

    pub fn notifications_active(&self) -> bool {
        self.debouncer.is_some()
    }

    /// Waits for the next reason to re-read the status file.
    pub async fn next_trigger(&mut self) -> WatchTrigger {
        tokio::select! {
            Some(()) = self.rx.recv() => WatchTrigger::Changed,
            _ = self.poll.tick() => WatchTrigger::Poll,
        }
    }

    fn start_debouncer(
        path: &Path,
        debounce: Duration,
        tx: Sender<()>,
    ) -> Result<Debouncer<RecommendedWatcher>, notify::Error> {
        // The server may replace the file instead of rewriting it, so the
        // parent directory is watched and events are filtered by name.
        let dir = match path.parent() {
            Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
            _ => PathBuf::from("."),
        };
        let file_name: Option<OsString> = path.file_name().map(|n| n.to_os_string());

        let mut debouncer = new_debouncer(debounce, move |res: DebounceEventResult| match res {
            Ok(events) => {
                let relevant = events
                    .iter()
                    .any(|e| e.path.file_name().map(|n| n.to_os_string()) == file_name);
                if relevant {
                    signal(&tx);
                }
            }
            Err(e) => debug!("File watcher error: {:?}", e),
        })?;
        debouncer.watcher().watch(&dir, RecursiveMode::NonRecursive)?;
        Ok(debouncer)
    }
}

/// Queues a trigger unless one is already pending.
fn signal(tx: &Sender<()>) -> bool {
    match tx.try_send(()) {
        Ok(()) => true,
        Err(TrySendError::Full(())) => false,
        Err(TrySendError::Closed(())) => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn bursts_collapse_into_one_pending_trigger() {
        let (tx, mut rx) = mpsc::channel(1);
        assert!(signal(&tx));
        assert!(!signal(&tx));
        assert!(!signal(&tx));
        assert_eq!(rx.recv().await, Some(()));
        assert!(rx.try_recv().is_err());
        assert!(signal(&tx));
    }

    #[tokio::test]
    async fn polling_fallback_triggers_without_notifications() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("status.log");
        let mut watcher =
            StatusFileWatcher::new(&path, Duration::from_millis(50), Duration::from_millis(20), false);
        assert!(!watcher.notifications_active());
        assert_eq!(watcher.next_trigger().await, WatchTrigger::Poll);
        assert_eq!(watcher.next_trigger().await, WatchTrigger::Poll);
    }

    #[tokio::test]
    async fn file_change_produces_a_trigger() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("status.log");
        std::fs::write(&path, "initial").unwrap();
        let mut watcher =
            StatusFileWatcher::new(&path, Duration::from_millis(50), Duration::from_secs(3600), true);
        // first poll tick fires immediately
        assert_eq!(watcher.next_trigger().await, WatchTrigger::Poll);

        std::fs::write(&path, "changed").unwrap();
        let trigger = tokio::time::timeout(Duration::from_secs(10), watcher.next_trigger()).await;
        if watcher.notifications_active() {
            assert_eq!(trigger.unwrap(), WatchTrigger::Changed);
        }
    }
}
