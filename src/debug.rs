// Debug logging module for Steerlink
// Installs the tracing subscriber; --debug routes everything to a log file

use std::fs::OpenOptions;
use std::io::{self, Write};
use std::path::PathBuf;
use std::sync::Mutex;
use std::time::SystemTime;

use tracing_subscriber::EnvFilter;

const LOG_FILE_NAME: &str = "steerlink-debug.log";

/// Where `--debug` output goes
pub fn log_path() -> PathBuf {
    std::env::temp_dir().join(LOG_FILE_NAME)
}

/// Initialize logging
///
/// # Behavior
/// - enabled=false: WARN and above to stderr, `RUST_LOG` overrides
/// - enabled=true: creates/truncates the log file, writes a header and
///   logs at DEBUG (stderr stays clean for the status line)
pub fn init(enabled: bool) -> io::Result<()> {
    if !enabled {
        let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
        // A second init (e.g. from tests) keeps the first subscriber
        let _ = tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(io::stderr)
            .try_init();
        return Ok(());
    }

    let path = log_path();
    let mut file = OpenOptions::new()
        .create(true)
        .write(true)
        .truncate(true)
        .open(&path)?;

    writeln!(file, "=== Steerlink Debug Log ===")?;
    writeln!(file, "Session started: {:?}", SystemTime::now())?;
    writeln!(file, "To monitor: tail -f {}", path.display())?;
    writeln!(file, "========================================\n")?;

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("steerlink=debug,str0m=info"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_ansi(false)
        .with_writer(Mutex::new(file))
        .try_init();

    Ok(())
}
