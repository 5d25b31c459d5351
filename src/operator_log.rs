use std::{
    fs::{File, OpenOptions},
    io,
    io::Write,
    path::{Path, PathBuf},
    sync::Mutex,
};

use chrono::Utc;
use std::sync::OnceLock;

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum Level {
    Trace,
    Debug,
    Info,
    Warn,
    Error,
}

impl Level {
    pub fn for_debug_flag(debug: bool) -> Self {
        if debug { Self::Debug } else { Self::Info }
    }
}

struct Logger {
    writer: Mutex<File>,
    min_level: Level,
    echo_stderr: bool,
}

static LOGGER: OnceLock<Logger> = OnceLock::new();

const LOG_FILE: &str = "console.log";

/// Opens `console.log` under `log_dir`, falling back to `./logs`.
pub fn init(log_dir: PathBuf, min_level: Level, echo_stderr: bool) -> anyhow::Result<PathBuf> {
    let fallback = std::env::current_dir()
        .unwrap_or_else(|_| PathBuf::from("."))
        .join("logs");

    let mut candidates = vec![log_dir.clone()];
    if fallback != log_dir {
        candidates.push(fallback);
    }

    let mut last_error: Option<(PathBuf, io::Error)> = None;
    for candidate in candidates {
        match open_log_file(&candidate) {
            Ok(file) => {
                let logger = Logger {
                    writer: Mutex::new(file),
                    min_level,
                    echo_stderr,
                };
                if LOGGER.set(logger).is_err() {
                    anyhow::bail!("console logger already initialized");
                }
                if candidate != log_dir {
                    eprintln!(
                        "unable to write {LOG_FILE} at {}; falling back to {}",
                        log_dir.display(),
                        candidate.display()
                    );
                }
                return Ok(candidate.join(LOG_FILE));
            }
            Err(err) => {
                last_error = Some((candidate, err));
            }
        }
    }

    match last_error {
        Some((path, err)) => Err(anyhow::anyhow!(
            "unable to open console log at {}: {}",
            path.display(),
            err
        )),
        None => anyhow::bail!("unable to initialize console log"),
    }
}

fn open_log_file(log_dir: &Path) -> io::Result<File> {
    std::fs::create_dir_all(log_dir)?;
    OpenOptions::new()
        .create(true)
        .append(true)
        .open(log_dir.join(LOG_FILE))
}

pub fn enabled(level: Level) -> bool {
    LOGGER
        .get()
        .map(|logger| level >= logger.min_level)
        .unwrap_or(false)
}

pub fn log(level: Level, target: &str, message: String) {
    let logger = match LOGGER.get() {
        Some(logger) => logger,
        None => return,
    };
    if level < logger.min_level {
        return;
    }
    let timestamp = Utc::now().to_rfc3339();
    let line = format!("{timestamp} [{level:?}] {target} - {message}");
    if logger.echo_stderr && level >= Level::Warn {
        eprintln!("{line}");
    }
    let mut writer = match logger.writer.lock() {
        Ok(writer) => writer,
        Err(_) => return,
    };
    if writeln!(*writer, "{line}").is_err() {
        let _ = writer.flush();
    }
}

pub fn trace(target: &str, message: impl AsRef<str>) {
    log(Level::Trace, target, message.as_ref().to_string());
}

pub fn debug(target: &str, message: impl AsRef<str>) {
    log(Level::Debug, target, message.as_ref().to_string());
}

pub fn info(target: &str, message: impl AsRef<str>) {
    log(Level::Info, target, message.as_ref().to_string());
}

pub fn warn(target: &str, message: impl AsRef<str>) {
    log(Level::Warn, target, message.as_ref().to_string());
}

pub fn error(target: &str, message: impl AsRef<str>) {
    log(Level::Error, target, message.as_ref().to_string());
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::tempdir;

    #[test]
    fn writes_console_log_and_filters_levels() -> anyhow::Result<()> {
        let dir = tempdir()?;
        let path = init(dir.path().to_path_buf(), Level::Info, false)?;
        debug("tests::filters", "hidden detail");
        info("tests::filters", "instance created id=inst-1");
        let contents = fs::read_to_string(path)?;
        assert!(contents.contains("instance created id=inst-1"));
        assert!(!contents.contains("hidden detail"));
        assert!(enabled(Level::Warn));
        assert!(!enabled(Level::Trace));
        Ok(())
    }
}
