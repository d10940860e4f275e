use super::parser::parse_status;
use super::types::{Observation, UnavailableReason};
use log::{debug, warn};
use std::io::{self, ErrorKind};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::task::JoinHandle;

type PendingRead = JoinHandle<io::Result<Vec<u8>>>;

/// Bounded reads of the status file.
///
/// File reads run on the blocking pool and cannot be cancelled. When one
/// outlives the timeout its handle is kept, and no further read is started
/// until it has returned, so a hung filesystem costs at most one thread.
#[derive(Debug)]
pub struct StatusReader {
    path: PathBuf,
    limit: Duration,
    stalled: Option<PendingRead>,
}

impl StatusReader {
    pub fn new(path: &Path, limit: Duration) -> Self {
        Self {
            path: path.to_path_buf(),
            limit,
            stalled: None,
        }
    }

    /// True while a timed out read is still blocked.
    pub fn is_stalled(&self) -> bool {
        self.stalled.as_ref().is_some_and(|h| !h.is_finished())
    }

    pub async fn read(&mut self) -> Observation {
        if let Some(previous) = self.stalled.take() {
            if !previous.is_finished() {
                self.stalled = Some(previous);
                return Observation::Unavailable(UnavailableReason::Stalled);
            }
            // content of a read that missed its deadline is stale
            debug!("Blocked status read of {} returned", self.path.display());
        }

        let path = self.path.clone();
        let mut pending = tokio::task::spawn_blocking(move || std::fs::read(path));
        match tokio::time::timeout(self.limit, &mut pending).await {
            Err(_) => {
                warn!(
                    "Reading {} took longer than {:?}, no new read until it returns",
                    self.path.display(),
                    self.limit
                );
                self.stalled = Some(pending);
                Observation::Unavailable(UnavailableReason::Timeout)
            }
            Ok(Err(e)) => Observation::Unavailable(UnavailableReason::Io(e.to_string())),
            Ok(Ok(Err(e))) if e.kind() == ErrorKind::NotFound => {
                Observation::Unavailable(UnavailableReason::Missing)
            }
            Ok(Ok(Err(e))) => Observation::Unavailable(UnavailableReason::Io(e.to_string())),
            Ok(Ok(Ok(bytes))) => parse_status(&String::from_utf8_lossy(&bytes)),
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::ffi::CString;
    use std::fs::OpenOptions;
    use std::os::unix::ffi::OsStrExt;
    use tempfile::TempDir;

    const STATUS: &str = "OpenVPN CLIENT LIST
Updated,2024-03-01 12:00:00
Common Name,Real Address,Bytes Received,Bytes Sent,Connected Since
alice,10.0.0.5:51234,1000,500,2024-03-01 11:00:00
ROUTING TABLE
Virtual Address,Common Name,Real Address,Last Ref
10.8.0.6,alice,10.0.0.5:51234,2024-03-01 11:59:58
GLOBAL STATS
END
";

    /// A FIFO without a writer blocks `open` forever, like a hung mount.
    pub(crate) fn make_fifo(path: &Path) {
        let c_path = CString::new(path.as_os_str().as_bytes()).unwrap();
        assert_eq!(unsafe { libc::mkfifo(c_path.as_ptr(), 0o600) }, 0);
    }

    /// Releases a reader blocked on the FIFO by opening and closing its write end.
    pub(crate) fn release_fifo(path: &Path) {
        drop(OpenOptions::new().write(true).open(path).unwrap());
    }

    #[tokio::test]
    async fn reports_missing_file() {
        let dir = TempDir::new().unwrap();
        let mut reader = StatusReader::new(&dir.path().join("status.log"), Duration::from_secs(1));
        assert_eq!(
            reader.read().await,
            Observation::Unavailable(UnavailableReason::Missing)
        );
    }

    #[tokio::test]
    async fn parses_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("status.log");
        std::fs::write(&path, STATUS).unwrap();
        let mut reader = StatusReader::new(&path, Duration::from_secs(1));
        match reader.read().await {
            Observation::Snapshot(s) => assert_eq!(s.sessions.len(), 1),
            other => panic!("expected a snapshot, got {:?}", other),
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn blocked_read_times_out_and_is_not_repeated() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("status.log");
        make_fifo(&path);
        let mut reader = StatusReader::new(&path, Duration::from_millis(200));

        assert_eq!(
            reader.read().await,
            Observation::Unavailable(UnavailableReason::Timeout)
        );
        assert!(reader.is_stalled());
        assert_eq!(
            reader.read().await,
            Observation::Unavailable(UnavailableReason::Stalled)
        );

        release_fifo(&path);
        for _ in 0..100 {
            if !reader.is_stalled() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(!reader.is_stalled());

        std::fs::remove_file(&path).unwrap();
        std::fs::write(&path, STATUS).unwrap();
        assert!(matches!(reader.read().await, Observation::Snapshot(_)));
    }
}
