//! Destinations for the progress and configuration messages of a
//! registration or dose computation.
//!
//! Library code never prints: it reports to a `DiagnosticSink` handed in by
//! the caller.

use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;
use std::sync::Mutex;

pub use log::Level;

pub trait DiagnosticSink: Send + Sync {
    fn report(&self, level: Level, message: &str);

    fn info(&self, message: &str) { self.report(Level::Info, message) }
    fn warn(&self, message: &str) { self.report(Level::Warn, message) }
}

/// Forwards to the `log` facade
#[derive(Clone, Copy, Debug, Default)]
pub struct LogSink;

impl DiagnosticSink for LogSink {
    fn report(&self, level: Level, message: &str) {
        log::log!(target: "rtreg", level, "{message}");
    }
}

/// Appends to a text file, and forwards to `log`
pub struct FileSink {
    file: Mutex<BufWriter<File>>,
}

impl FileSink {
    pub fn create(path: &Path) -> std::io::Result<Self> {
        if let Some(dir) = path.parent() {
            if !dir.as_os_str().is_empty() { std::fs::create_dir_all(dir)? }
        }
        Ok(Self { file: Mutex::new(BufWriter::new(File::create(path)?)) })
    }
}

impl DiagnosticSink for FileSink {
    fn report(&self, level: Level, message: &str) {
        LogSink.report(level, message);
        if let Ok(mut file) = self.file.lock() {
            // A failing log file must not abort the computation
            if writeln!(file, "[{level}] {message}").and_then(|_| file.flush()).is_err() {
                log::warn!("could not write to registration log file");
            }
        }
    }
}

/// Keeps messages in memory
#[derive(Debug, Default)]
pub struct CollectSink {
    messages: Mutex<Vec<(Level, String)>>,
}

impl CollectSink {
    pub fn messages(&self) -> Vec<(Level, String)> {
        self.messages.lock().map(|m| m.clone()).unwrap_or_default()
    }
}

impl DiagnosticSink for CollectSink {
    fn report(&self, level: Level, message: &str) {
        if let Ok(mut m) = self.messages.lock() { m.push((level, message.into())) }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use tempfile::tempdir;
    #[allow(unused)] use pretty_assertions::{assert_eq, assert_ne};

    #[test]
    fn collected_in_order() {
        let sink = CollectSink::default();
        sink.info("stage 1");
        sink.warn("odd value");
        assert_eq!(sink.messages(), vec![(Level::Info, "stage 1".to_string()),
                                         (Level::Warn, "odd value".to_string())]);
    }

    #[test]
    fn file_sink_writes_every_message() -> std::io::Result<()> {
        let dir = tempdir()?;
        let path = dir.path().join("logs/reg.log");
        let sink = FileSink::create(&path)?;
        sink.info("one");
        sink.report(Level::Debug, "two");
        let text = std::fs::read_to_string(&path)?;
        assert_eq!(text, "[INFO] one\n[DEBUG] two\n");
        Ok(())
    }
}
