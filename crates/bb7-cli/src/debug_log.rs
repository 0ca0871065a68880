//! Hand-rolled debug file logger, gated by `BB7_DEBUG=1` or the presence of
//! `~/.bb7/debug`. No `log`/`tracing` dependency — one timestamped line per
//! calendar-day file under `~/.bb7/logs/`, the same texture the teacher uses
//! for its own debug output.

use chrono::Utc;
use std::fs::{self, OpenOptions};
use std::io::Write;

fn todays_log_path() -> std::path::PathBuf {
    bb7_core::logs_dir().join(format!("{}.log", Utc::now().format("%Y-%m-%d")))
}

/// Append one timestamped line if debug logging is enabled. Failures to
/// write are swallowed — a broken log file must never take down the
/// request/response loop it's meant to help debug.
pub fn debug_log(message: &str) {
    if !bb7_core::debug_enabled() {
        return;
    }
    let path = todays_log_path();
    let Some(parent) = path.parent() else { return };
    if fs::create_dir_all(parent).is_err() {
        return;
    }
    if let Ok(mut f) = OpenOptions::new().create(true).append(true).open(&path) {
        let _ = writeln!(f, "{} {message}", Utc::now().to_rfc3339());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn disabled_by_default_is_a_silent_noop() {
        // SAFETY: test runs single-threaded w.r.t. this var within the process;
        // this crate sets no other env vars.
        unsafe {
            std::env::remove_var("BB7_DEBUG");
        }
        debug_log("should not panic or write anywhere reachable");
    }
}
