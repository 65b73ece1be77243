//! Structured logging for debugging kiln.
//!
//! Log levels:
//! - ERROR: Run-aborting failures (deadlock, cancellation)
//! - WARN: Recoverable conditions (failed attempts, git unavailable)
//! - INFO: Run and task lifecycle
//! - DEBUG: Budget, commit, and gate bookkeeping
//! - TRACE: Prompt and agent payloads
//!
//! Debug mode can be enabled with `--debug` or `KILN_DEBUG=1`. `KILN_LOG`
//! takes a full filter directive (for example `kiln=trace`) and wins over both.
//! Logs go to `~/.kiln/kiln.log` so stdout stays free for the event stream.

use std::fs::File;
use std::sync::Mutex;

use tracing_subscriber::EnvFilter;

use crate::config::Config;

/// Environment variable holding a filter directive.
pub const LOG_ENV: &str = "KILN_LOG";
/// Environment variable enabling debug output.
pub const DEBUG_ENV: &str = "KILN_DEBUG";

/// Initialize logging with explicit debug mode setting.
///
/// Safe to call more than once; later calls are ignored.
pub fn init_with_debug(debug: bool) {
    let filter = EnvFilter::new(filter_directive(debug, std::env::var(LOG_ENV).ok(), env_debug()));

    let log_file = Config::kiln_dir().ok().and_then(|dir| {
        std::fs::create_dir_all(&dir).ok()?;
        // Truncated on startup.
        File::create(dir.join("kiln.log")).ok()
    });

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_ansi(false);

    let result = match log_file {
        Some(file) => builder.with_writer(Mutex::new(file)).try_init(),
        None => builder.with_writer(std::io::stderr).try_init(),
    };
    if result.is_err() {
        tracing::debug!("logging already initialised");
    }
}

fn env_debug() -> bool {
    std::env::var(DEBUG_ENV)
        .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
        .unwrap_or(false)
}

fn filter_directive(debug: bool, directive: Option<String>, env_debug: bool) -> String {
    if let Some(directive) = directive {
        if EnvFilter::try_new(&directive).is_ok() {
            return directive;
        }
    }
    if debug || env_debug {
        "debug".to_string()
    } else {
        "info".to_string()
    }
}
