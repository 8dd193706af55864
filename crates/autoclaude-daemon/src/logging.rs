//! Logging setup.
//!
//! Records always go to a daily-rotated file under the configured log
//! path. In headless mode they are mirrored to stderr, colorized when
//! stderr is a terminal and `NO_COLOR` is unset. In TUI mode the terminal
//! belongs to the status view, so only the file layer is installed.

use std::io::IsTerminal;

use autoclaude_core::config::Config;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

/// Keeps the non-blocking file writer flushing. Hold it for the life of
/// the process.
pub struct LogGuard {
    _file: WorkerGuard,
}

/// Installs the global tracing subscriber.
///
/// # Errors
///
/// Returns an error when the log directory cannot be created.
pub fn init(config: &Config, tui_active: bool) -> std::io::Result<LogGuard> {
    let log_file = config.log_file();
    let log_dir = log_file
        .parent()
        .map_or_else(|| std::path::PathBuf::from("."), std::path::Path::to_path_buf);
    std::fs::create_dir_all(&log_dir)?;

    let file_name = log_file
        .file_name()
        .map_or_else(|| "auto-claude.log".into(), std::ffi::OsStr::to_os_string);

    let (file_writer, guard) = tracing_appender::non_blocking(tracing_appender::rolling::daily(
        &log_dir, &file_name,
    ));

    let filter = EnvFilter::new(config.log.level.as_str());
    let file_layer = tracing_subscriber::fmt::layer()
        .with_writer(file_writer)
        .with_ansi(false);

    let registry = tracing_subscriber::registry().with(filter).with(file_layer);

    if tui_active {
        registry.init();
    } else {
        let ansi = std::io::stderr().is_terminal() && std::env::var_os("NO_COLOR").is_none();
        let stderr_layer = tracing_subscriber::fmt::layer()
            .with_writer(std::io::stderr)
            .with_ansi(ansi);
        registry.with(stderr_layer).init();
    }

    Ok(LogGuard { _file: guard })
}
