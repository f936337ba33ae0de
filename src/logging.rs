//! Logging configuration for noidd.
//!
//! - Debug builds: console (stderr) + file output (debug level)
//! - Release builds: file output only (info level)

use std::fs;
use std::path::Path;

use tracing_appender::rolling;
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

pub fn init(logfile: &Path) {
    let is_debug = cfg!(debug_assertions);

    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        let level = if is_debug { "debug" } else { "info" };
        EnvFilter::new(format!("noidd={level},warn"))
    });

    let (dir, file_name) = match (logfile.parent(), logfile.file_name()) {
        (Some(dir), Some(name)) if !dir.as_os_str().is_empty() => (dir.to_path_buf(), name),
        _ => (std::path::PathBuf::from("."), logfile.as_os_str()),
    };
    fs::create_dir_all(&dir).ok();

    let file_appender = rolling::never(dir, file_name);
    let file_layer = fmt::layer()
        .with_target(false)
        .with_ansi(false)
        .with_writer(file_appender);

    // Console output goes to stderr: stdout belongs to the stdout
    // notification sink.
    let console_layer = is_debug.then(|| fmt::layer().with_target(false).with_writer(std::io::stderr));

    tracing_subscriber::registry()
        .with(env_filter)
        .with(file_layer)
        .with(console_layer)
        .init();
}
