//! Operational logging: `log` records to stderr and the configured log file.

use chrono::Local;
use env_logger::{Builder, Logger, Target};
use log::{warn, LevelFilter};
use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::Path;

/// Copies every formatted record to stderr and, when available, a file.
struct TeeWriter {
    file: Option<File>,
}

impl Write for TeeWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let _ = io::stderr().write_all(buf);
        if let Some(file) = self.file.as_mut() {
            if file.write_all(buf).is_err() {
                // nowhere left to report this; keep stderr going
                self.file = None;
            }
        }
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        let _ = io::stderr().flush();
        match self.file.as_mut() {
            Some(f) => f.flush(),
            None => Ok(()),
        }
    }
}

fn open_log_file(path: &Path) -> io::Result<File> {
    if let Some(dir) = path.parent().filter(|d| !d.as_os_str().is_empty()) {
        fs::create_dir_all(dir)?;
    }
    OpenOptions::new().create(true).append(true).open(path)
}

fn build_logger(level: LevelFilter, file: Option<File>) -> Logger {
    Builder::new()
        .filter_level(level)
        .parse_default_env()
        .format(|buf, record| {
            writeln!(
                buf,
                "[{} {}] {} -- {}",
                Local::now().format("%Y-%m-%d %H:%M:%S"),
                record.level(),
                record.target(),
                record.args()
            )
        })
        .target(Target::Pipe(Box::new(TeeWriter { file })))
        .build()
}

/// Installs the global logger. `RUST_LOG` takes precedence over `level`.
///
/// A log file that cannot be opened is reported once and logging carries on
/// with stderr only.
pub fn init_logging(level: LevelFilter, log_file: Option<&Path>) -> Result<(), log::SetLoggerError> {
    let mut open_error = None;
    let file = match log_file {
        Some(path) => match open_log_file(path) {
            Ok(f) => Some(f),
            Err(e) => {
                open_error = Some((path.display().to_string(), e));
                None
            }
        },
        None => None,
    };

    let logger = build_logger(level, file);
    let max_level = logger.filter();
    log::set_boxed_logger(Box::new(logger))?;
    log::set_max_level(max_level);

    if let Some((path, e)) = open_error {
        warn!("Cannot open log file {} ({}), logging to stderr only", path, e);
    }
    Ok(())
}
