//! Error diagnostics.
//!
//! Errors are reported as `<prefix>: <reason>.` lines on the error level.
//! The binary routes the subscriber to stderr.

use std::fmt::Display;
use tracing::error;

pub const LISTEN: &str = "Error on listening";
pub const ACCEPT: &str = "Error on accepting client connection";
pub const READ: &str = "Error on reading client stream";
pub const WRITE: &str = "Error on writing client stream";
pub const BIND: &str = "Error on binding";
pub const PARSE_ADDR: &str = "Error on parsing address";

/// Log `err` under `prefix`.
pub fn report(prefix: &str, err: &dyn Display) {
    error!("{}", format_line(prefix, err));
}

/// Format a diagnostic line without logging it.
pub fn format_line(prefix: &str, err: &dyn Display) -> String {
    format!("{prefix}: {err}.")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io;

    #[test]
    fn test_format_line() {
        let err = io::Error::new(io::ErrorKind::BrokenPipe, "broken pipe");
        assert_eq!(
            format_line(WRITE, &err),
            "Error on writing client stream: broken pipe."
        );
    }
}
