//! Tracing subscriber setup.
//!
//! Logs go to stdout by default. `EQ_LOG_LEVEL` holds an env-filter
//! directive, `EQ_LOG_FILE` switches output to a daily-rotated file, and
//! `EQ_LOG=off` silences everything.

use std::env;
use std::path::PathBuf;
use std::sync::OnceLock;

use tracing::level_filters::LevelFilter;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::{fmt, EnvFilter};

const LOG_SWITCH_ENV: &str = "EQ_LOG";
const LOG_LEVEL_ENV: &str = "EQ_LOG_LEVEL";
const LOG_FILE_ENV: &str = "EQ_LOG_FILE";
const MAX_LOG_FILES: usize = 7;

// The non-blocking writer stops on guard drop; pin it for process lifetime.
static FILE_GUARD: OnceLock<WorkerGuard> = OnceLock::new();

fn env_filter() -> EnvFilter {
    if matches!(env::var(LOG_SWITCH_ENV).as_deref(), Ok("off" | "0" | "false")) {
        return EnvFilter::new("off");
    }
    EnvFilter::builder()
        .with_default_directive(LevelFilter::INFO.into())
        .with_env_var(LOG_LEVEL_ENV)
        .from_env_lossy()
}

/// Install the global subscriber. Call once, early in startup.
pub fn init() {
    let builder = fmt().with_env_filter(env_filter()).with_target(true);

    match env::var(LOG_FILE_ENV).map(PathBuf::from) {
        Ok(path) => {
            let directory = path.parent().unwrap_or_else(|| ".".as_ref());
            let prefix = path
                .file_name()
                .map(|name| name.to_string_lossy().into_owned())
                .unwrap_or_else(|| "eq.log".to_string());
            let appender = RollingFileAppender::builder()
                .rotation(Rotation::DAILY)
                .filename_prefix(prefix)
                .max_log_files(MAX_LOG_FILES)
                .build(directory)
                .expect("failed to create rolling file appender");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let _ = FILE_GUARD.set(guard);
            builder.with_writer(writer).with_ansi(false).init();
        }
        Err(_) => builder.init(),
    }
}
