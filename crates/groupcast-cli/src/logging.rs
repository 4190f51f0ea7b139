//! Daily log files with retention cleanup, plus the stderr layer

use anyhow::Result;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

pub const LOG_RETENTION_DAYS: u64 = 7;
const LOG_PREFIX: &str = "groupcast";

pub struct LogManager {
    log_dir: PathBuf,
}

impl LogManager {
    pub fn new(log_dir: PathBuf) -> Self {
        Self { log_dir }
    }

    pub fn current_log_path(&self) -> PathBuf {
        let today = chrono::Local::now().format("%Y-%m-%d");
        self.log_dir.join(format!("{}.{}.log", LOG_PREFIX, today))
    }

    fn is_log_file(path: &Path) -> bool {
        path.is_file()
            && path
                .file_name()
                .and_then(|name| name.to_str())
                .is_some_and(|name| name.starts_with(LOG_PREFIX) && name.ends_with(".log"))
    }

    /// Log files, newest first.
    pub fn log_files(&self) -> Result<Vec<PathBuf>> {
        if !self.log_dir.exists() {
            return Ok(Vec::new());
        }
        let mut files = Vec::new();
        for entry in fs::read_dir(&self.log_dir)? {
            let path = entry?.path();
            if Self::is_log_file(&path) {
                files.push(path);
            }
        }
        files.sort();
        files.reverse();
        Ok(files)
    }

    /// Remove log files last modified more than `retention_days` ago.
    pub fn cleanup(&self, retention_days: u64) -> Result<usize> {
        let cutoff = SystemTime::now() - Duration::from_secs(retention_days * 24 * 60 * 60);
        let mut deleted = 0;
        for path in self.log_files()? {
            let modified = fs::metadata(&path)?.modified()?;
            if modified >= cutoff {
                continue;
            }
            match fs::remove_file(&path) {
                Ok(()) => deleted += 1,
                Err(e) => eprintln!("Failed to delete old log {}: {}", path.display(), e),
            }
        }
        if deleted > 0 {
            tracing::info!("Cleaned up {} old log file(s)", deleted);
        }
        Ok(deleted)
    }

    pub fn total_size(&self) -> Result<u64> {
        let mut total = 0u64;
        for file in self.log_files()? {
            if let Ok(metadata) = fs::metadata(&file) {
                total += metadata.len();
            }
        }
        Ok(total)
    }

    pub fn format_size(bytes: u64) -> String {
        const KB: u64 = 1024;
        const MB: u64 = KB * 1024;
        if bytes >= MB {
            format!("{:.2} MB", bytes as f64 / MB as f64)
        } else if bytes >= KB {
            format!("{:.2} KB", bytes as f64 / KB as f64)
        } else {
            format!("{} B", bytes)
        }
    }
}

pub struct LoggingGuard {
    _guard: WorkerGuard,
}

// RUST_LOG wins over the --log-level flag.
fn build_filter(log_level: &str) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::try_new(log_level).unwrap_or_else(|_| EnvFilter::new("info"))
    })
}

pub fn init_logging(log_dir: &Path, log_level: &str) -> Result<LoggingGuard> {
    fs::create_dir_all(log_dir)?;
    let manager = LogManager::new(log_dir.to_path_buf());
    manager.cleanup(LOG_RETENTION_DAYS)?;

    let file = fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(manager.current_log_path())?;
    let (non_blocking, guard) = tracing_appender::non_blocking(file);

    let file_layer = fmt::layer()
        .with_writer(non_blocking)
        .with_ansi(false)
        .with_target(true)
        .with_line_number(true)
        .with_filter(build_filter(log_level));

    let stderr_layer = fmt::layer()
        .with_writer(std::io::stderr)
        .with_ansi(true)
        .with_target(false)
        .with_filter(build_filter(log_level));

    tracing_subscriber::registry()
        .with(file_layer)
        .with(stderr_layer)
        .try_init()?;

    Ok(LoggingGuard { _guard: guard })
}

#[cfg(test)]
mod tests {
    use super::LogManager;
    use std::time::{SystemTime, UNIX_EPOCH};

    fn temp_log_dir(name: &str) -> std::path::PathBuf {
        let ts = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("clock")
            .as_nanos();
        let dir = std::env::temp_dir().join(format!("groupcast-logs-{}-{}", name, ts));
        std::fs::create_dir_all(&dir).expect("create dir");
        dir
    }

    #[test]
    fn only_prefixed_log_files_are_listed() {
        let dir = temp_log_dir("list");
        std::fs::write(dir.join("groupcast.2026-01-01.log"), "a").expect("write");
        std::fs::write(dir.join("groupcast.2026-01-02.log"), "bb").expect("write");
        std::fs::write(dir.join("other.log"), "c").expect("write");

        let manager = LogManager::new(dir);
        let files = manager.log_files().expect("list");
        assert_eq!(files.len(), 2);
        assert!(files[0].ends_with("groupcast.2026-01-02.log"));
        assert_eq!(manager.total_size().expect("size"), 3);
        assert_eq!(manager.cleanup(7).expect("cleanup"), 0);
    }

    #[test]
    fn missing_directory_has_no_files() {
        let manager = LogManager::new(std::env::temp_dir().join("groupcast-logs-missing-dir"));
        assert!(manager.log_files().expect("list").is_empty());
    }

    #[test]
    fn sizes_are_human_readable() {
        assert_eq!(LogManager::format_size(512), "512 B");
        assert_eq!(LogManager::format_size(2048), "2.00 KB");
        assert_eq!(LogManager::format_size(3 * 1024 * 1024), "3.00 MB");
    }
}
