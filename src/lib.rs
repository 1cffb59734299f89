pub mod agent_tools;
pub mod commands;
pub mod config;
pub mod mcp_client;

use std::path::{Path, PathBuf};

/// Environment variable overriding the data directory.
pub const DATA_DIR_ENV: &str = "COGNISPHERE_DATA_DIR";

/// Return the data directory for Cognisphere.
///
/// `$COGNISPHERE_DATA_DIR` when set, otherwise the platform-standard data
/// directory:
/// - macOS: `~/Library/Application Support/cognisphere/`
/// - Windows: `{FOLDERID_RoamingAppData}\cognisphere\`
/// - Linux: `$XDG_DATA_HOME/cognisphere/` (fallback `~/.local/share/...`)
///
/// Falls back to `~/.cognisphere/` only if none of the above can be resolved.
pub fn data_dir() -> PathBuf {
    if let Some(dir) = std::env::var_os(DATA_DIR_ENV).filter(|d| !d.is_empty()) {
        return PathBuf::from(dir);
    }
    if let Some(dir) = dirs::data_dir() {
        return dir.join("cognisphere");
    }
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".cognisphere")
}

/// Where log output goes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogTarget {
    /// `<data_dir>/cognisphere.log`, rotated on every start.
    File,
    Stderr,
}

/// Initialize the tracing subscriber.
///
/// For `LogTarget::File`, on each startup:
/// 1. Rotates existing logs (cognisphere.log → .1 → .2 → .3, keeps last 3).
/// 2. Opens a fresh cognisphere.log with a line-flushing writer.
/// 3. Logs a startup banner with the data directory path.
pub fn init_tracing(data_dir: &Path, target: LogTarget) -> std::io::Result<()> {
    use tracing_subscriber::fmt;
    use tracing_subscriber::EnvFilter;

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("cognisphere_mcp=info,warn"));

    let builder = fmt::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(false);

    match target {
        LogTarget::Stderr => {
            builder.with_writer(std::io::stderr).init();
            tracing::debug!(data_dir = %data_dir.display(), "logging to stderr");
        }
        LogTarget::File => {
            std::fs::create_dir_all(data_dir)?;
            let log_path = data_dir.join("cognisphere.log");

            // Rotate: cognisphere.log.2 → .3, .1 → .2, cognisphere.log → .1
            rotate_log_file(&log_path, 3);

            let log_file = std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(&log_path)?;

            builder
                .with_writer(FlushingWriter::new(log_file))
                .with_ansi(false)
                .init();

            tracing::info!(
                version = env!("CARGO_PKG_VERSION"),
                data_dir = %data_dir.display(),
                log_file = %log_path.display(),
                pid = std::process::id(),
                "=== Cognisphere MCP starting ==="
            );
        }
    }

    Ok(())
}

/// Rotate log files: `cognisphere.log` → `cognisphere.log.1` → `.2` → … → `.{keep}`.
///
/// Oldest file beyond `keep` is deleted. Missing files in the chain are skipped.
fn rotate_log_file(base_path: &Path, keep: u32) {
    let oldest = format!("{}.{keep}", base_path.display());
    let _ = std::fs::remove_file(&oldest);

    for i in (1..keep).rev() {
        let from = format!("{}.{i}", base_path.display());
        let to = format!("{}.{}", base_path.display(), i + 1);
        let _ = std::fs::rename(&from, &to);
    }

    if base_path.exists() {
        let to = format!("{}.1", base_path.display());
        let _ = std::fs::rename(base_path, &to);
    }
}

/// A writer that wraps `std::fs::File` and flushes after every write.
///
/// Each log line is on disk immediately, so the tail of the log survives a
/// crash of the process.
#[derive(Clone)]
struct FlushingWriter {
    file: std::sync::Arc<parking_lot::Mutex<std::fs::File>>,
}

impl FlushingWriter {
    fn new(file: std::fs::File) -> Self {
        Self {
            file: std::sync::Arc::new(parking_lot::Mutex::new(file)),
        }
    }
}

impl std::io::Write for FlushingWriter {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        let mut f = self.file.lock();
        let n = std::io::Write::write(&mut *f, buf)?;
        std::io::Write::flush(&mut *f)?;
        Ok(n)
    }

    fn flush(&mut self) -> std::io::Result<()> {
        std::io::Write::flush(&mut *self.file.lock())
    }
}

impl<'a> tracing_subscriber::fmt::MakeWriter<'a> for FlushingWriter {
    type Writer = FlushingWriter;

    fn make_writer(&'a self) -> Self::Writer {
        self.clone()
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────
