//! Logger setup shared by the binaries
//!
//! `RUST_LOG`, when set, overrides the level given on the command line.

use std::path::Path;

use flexi_logger::{Cleanup, Criterion, Duplicate, FileSpec, FlexiLoggerError, Logger, LoggerHandle, Naming};

/// Log to stderr only.
pub fn setup_logging(level: &str) -> Result<LoggerHandle, FlexiLoggerError> {
    Logger::try_with_env_or_str(level)?
        .log_to_stderr()
        .start()
}

/// Log everything to rotating files in `dir`, echo warnings to stderr.
pub fn setup_file_logging(level: &str, dir: &Path) -> Result<LoggerHandle, FlexiLoggerError> {
    Logger::try_with_env_or_str(level)?
        .log_to_file(FileSpec::default().directory(dir))
        .duplicate_to_stderr(Duplicate::Warn)
        .rotate(Criterion::Size(1024 * 1024), Naming::Timestamps, Cleanup::KeepLogFiles(5))
        .start()
}
