use crate::accounting::types::TrafficRecord;
use crate::error_handling::types::SinkError;
use log::{debug, error, info, warn};
use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::time::Duration;

const MAX_BACKOFF: Duration = Duration::from_secs(30);

/// Append-only destination for traffic log lines.
pub trait LogSink: Send {
    /// Appends one complete line; the newline is added by the sink.
    fn append(&mut self, line: &str) -> io::Result<()>;

    fn flush(&mut self) -> io::Result<()>;
}

/// Traffic log file opened in append mode.
///
/// After a failed write the handle is dropped and the file is reopened on
/// the next attempt, which recovers from rotation and remounts. Bytes of a
/// line that was only partly written are cut off again; if that is not
/// possible the next line starts on a fresh one.
#[derive(Debug)]
pub struct FileSink {
    path: PathBuf,
    file: Option<File>,
    torn: bool,
}

impl FileSink {
    pub fn open(path: &Path) -> io::Result<Self> {
        let mut sink = Self {
            path: path.to_path_buf(),
            file: None,
            torn: false,
        };
        sink.ensure_open()?;
        Ok(sink)
    }

    fn ensure_open(&mut self) -> io::Result<&mut File> {
        if self.file.is_none() {
            if let Some(dir) = self.path.parent().filter(|d| !d.as_os_str().is_empty()) {
                fs::create_dir_all(dir)?;
            }
            let file = OpenOptions::new().create(true).append(true).open(&self.path)?;
            debug!("Opened traffic log {}", self.path.display());
            self.file = Some(file);
        }
        self.file
            .as_mut()
            .ok_or_else(|| io::Error::new(io::ErrorKind::Other, "traffic log not open"))
    }
}

impl LogSink for FileSink {
    fn append(&mut self, line: &str) -> io::Result<()> {
        let mut buf = String::with_capacity(line.len() + 2);
        if self.torn {
            buf.push('\n');
        }
        buf.push_str(line);
        buf.push('\n');

        let result = match self.ensure_open() {
            Ok(file) => append_whole(file, buf.as_bytes()),
            Err(e) => Err((e, false)),
        };
        match result {
            Ok(()) => {
                self.torn = false;
                Ok(())
            }
            Err((e, torn)) => {
                self.torn |= torn;
                self.file = None;
                Err(e)
            }
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match self.file.as_mut() {
            Some(f) => f.sync_data(),
            None => Ok(()),
        }
    }
}

/// Output that can be cut back to an earlier length.
trait Truncatable: Write {
    fn size(&self) -> io::Result<u64>;
    fn truncate_to(&mut self, len: u64) -> io::Result<()>;
}

impl Truncatable for File {
    fn size(&self) -> io::Result<u64> {
        Ok(self.metadata()?.len())
    }

    fn truncate_to(&mut self, len: u64) -> io::Result<()> {
        self.set_len(len)
    }
}

/// Writes all of `buf` or nothing. The flag in the error is set when a
/// partial write could not be cut off.
fn append_whole<T: Truncatable>(out: &mut T, buf: &[u8]) -> Result<(), (io::Error, bool)> {
    let start = out.size().map_err(|e| (e, false))?;
    let Err(e) = out.write_all(buf) else {
        return Ok(());
    };
    let torn = match out.truncate_to(start) {
        Ok(()) => false,
        Err(cut) => {
            warn!("Cannot remove partial traffic log line: {}", cut);
            true
        }
    };
    Err((e, torn))
}

/// Writes traffic records as JSON lines, retrying failed writes.
pub struct TrafficLogger {
    sink: Box<dyn LogSink>,
    retry_limit: u32,
    backoff: Duration,
    written: u64,
}

impl TrafficLogger {
    pub fn new(sink: Box<dyn LogSink>, retry_limit: u32, backoff: Duration) -> Self {
        Self {
            sink,
            retry_limit: retry_limit.max(1),
            backoff,
            written: 0,
        }
    }

    pub fn written(&self) -> u64 {
        self.written
    }

    /// Serializes one record to its log line.
    pub fn format_line(record: &TrafficRecord) -> Result<String, SinkError> {
        serde_json::to_string(record).map_err(|e| SinkError::Serialization(e.to_string()))
    }

    /// Writes every record in order, stopping at the first one that cannot
    /// be written within the retry budget.
    pub async fn write_all(&mut self, records: &[TrafficRecord]) -> Result<(), SinkError> {
        for record in records {
            self.write_record(record).await?;
        }
        Ok(())
    }

    pub async fn write_record(&mut self, record: &TrafficRecord) -> Result<(), SinkError> {
        let line = Self::format_line(record)?;
        self.append_with_retry(&line).await?;
        self.written += 1;

        for hit in &record.watchlist_hits {
            info!(
                "{} ({}/{}) visited {} matching {}",
                record.identity.display_name(),
                record
                    .virtual_address
                    .map(|a| a.to_string())
                    .unwrap_or_else(|| String::from("-")),
                record.real_address,
                hit.destination,
                hit.pattern
            );
        }
        Ok(())
    }

    pub async fn flush(&mut self) -> Result<(), SinkError> {
        self.sink.flush().map_err(SinkError::WriteFailed)
    }

    async fn append_with_retry(&mut self, line: &str) -> Result<(), SinkError> {
        let mut delay = self.backoff;
        let mut attempt = 1;
        loop {
            match self.sink.append(line) {
                Ok(()) => {
                    if attempt > 1 {
                        info!("Traffic log writable again after {} attempts", attempt);
                    }
                    return Ok(());
                }
                Err(e) if attempt >= self.retry_limit => {
                    error!("Giving up on traffic log after {} attempts: {}", attempt, e);
                    return Err(SinkError::RetriesExhausted {
                        attempts: attempt,
                        last: e,
                    });
                }
                Err(e) => {
                    warn!(
                        "Traffic log write failed (attempt {}/{}): {}, retrying in {:?}",
                        attempt, self.retry_limit, e, delay
                    );
                    tokio::time::sleep(delay).await;
                    delay = (delay * 2).min(MAX_BACKOFF);
                    attempt += 1;
                }
            }
        }
    }
}
