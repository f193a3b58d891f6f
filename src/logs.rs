use parking_lot::Mutex;
use std::sync::Arc;

/// Kind of a user-facing log entry
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogKind {
    Info,
    Success,
    Warning,
    Error,
}

/// A user-facing progress message.
///
/// `verbosity` runs from 0 (always shown) to 3 (debug chatter).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogEntry {
    pub message: String,
    pub verbosity: u8,
    pub kind: LogKind,
}

impl LogEntry {
    pub fn new(kind: LogKind, verbosity: u8, message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            verbosity: verbosity.min(3),
            kind,
        }
    }
}

/// Destination for user-facing log entries. Delivery is best-effort.
pub trait LogSink: Send + Sync {
    fn emit(&self, entry: &LogEntry);
}

/// Forwards entries to `tracing`
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingSink;

impl LogSink for TracingSink {
    fn emit(&self, entry: &LogEntry) {
        let verbosity = entry.verbosity;
        match entry.kind {
            LogKind::Info => tracing::info!(verbosity, "{}", entry.message),
            LogKind::Success => tracing::info!(verbosity, success = true, "{}", entry.message),
            LogKind::Warning => tracing::warn!(verbosity, "{}", entry.message),
            LogKind::Error => tracing::error!(verbosity, "{}", entry.message),
        }
    }
}

/// Keeps every entry in memory
#[derive(Debug, Default)]
pub struct MemorySink {
    entries: Mutex<Vec<LogEntry>>,
}

impl MemorySink {
    pub fn entries(&self) -> Vec<LogEntry> {
        self.entries.lock().clone()
    }

    pub fn contains(&self, kind: LogKind, needle: &str) -> bool {
        self.entries
            .lock()
            .iter()
            .any(|e| e.kind == kind && e.message.contains(needle))
    }
}

impl LogSink for MemorySink {
    fn emit(&self, entry: &LogEntry) {
        self.entries.lock().push(entry.clone());
    }
}

/// Drops entries above the configured verbosity and hands the rest to a sink
#[derive(Clone)]
pub struct Reporter {
    sink: Arc<dyn LogSink>,
    verbosity: u8,
}

impl std::fmt::Debug for Reporter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Reporter")
            .field("verbosity", &self.verbosity)
            .finish_non_exhaustive()
    }
}

impl Default for Reporter {
    fn default() -> Self {
        Self::new(Arc::new(TracingSink), 1)
    }
}

impl Reporter {
    pub fn new(sink: Arc<dyn LogSink>, verbosity: u8) -> Self {
        Self { sink, verbosity }
    }

    pub fn log(&self, kind: LogKind, verbosity: u8, message: impl Into<String>) {
        let entry = LogEntry::new(kind, verbosity, message);
        if entry.verbosity <= self.verbosity {
            self.sink.emit(&entry);
        }
    }

    pub fn info(&self, verbosity: u8, message: impl Into<String>) {
        self.log(LogKind::Info, verbosity, message);
    }

    pub fn success(&self, verbosity: u8, message: impl Into<String>) {
        self.log(LogKind::Success, verbosity, message);
    }

    pub fn warning(&self, verbosity: u8, message: impl Into<String>) {
        self.log(LogKind::Warning, verbosity, message);
    }

    pub fn error(&self, verbosity: u8, message: impl Into<String>) {
        self.log(LogKind::Error, verbosity, message);
    }
}

/// Reassembles lines from the arbitrary chunks a container stream delivers.
///
/// Bytes are held until a newline arrives, so a character split across two
/// frames is decoded whole.
#[derive(Debug, Default)]
pub struct LineBuffer {
    pending: Vec<u8>,
}

impl LineBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed a chunk and get back every line it completed
    pub fn push(&mut self, chunk: &[u8]) -> Vec<String> {
        self.pending.extend_from_slice(chunk);

        let mut lines = Vec::new();
        while let Some(idx) = self.pending.iter().position(|&b| b == b'\n') {
            let line: Vec<u8> = self.pending.drain(..=idx).collect();
            lines.push(clean_line(&line));
        }
        lines
    }

    /// Whatever is left after the stream closed
    pub fn finish(&mut self) -> Option<String> {
        if self.pending.is_empty() {
            return None;
        }
        let rest = std::mem::take(&mut self.pending);
        Some(clean_line(&rest))
    }

    /// Split a whole buffer at once
    pub fn split(chunk: &[u8]) -> Vec<String> {
        let mut buffer = Self::new();
        let mut lines = buffer.push(chunk);
        lines.extend(buffer.finish());
        lines
    }
}

/// Drop the line terminator and any CSI escape sequences, then decode
fn clean_line(mut line: &[u8]) -> String {
    while let [rest @ .., b'\n' | b'\r'] = line {
        line = rest;
    }

    let mut text = Vec::with_capacity(line.len());
    let mut bytes = line.iter().copied();
    while let Some(byte) = bytes.next() {
        if byte != 0x1b {
            text.push(byte);
            continue;
        }
        if bytes.clone().next() == Some(b'[') {
            bytes.next();
            // parameters run until a final byte in '@'..='~'
            for next in bytes.by_ref() {
                if (b'@'..=b'~').contains(&next) {
                    break;
                }
            }
        }
    }
    String::from_utf8_lossy(&text).into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lines_span_chunks() {
        let mut buffer = LineBuffer::new();
        assert!(buffer.push(b"Step 1/4 : FROM wordpress").is_empty());
        assert_eq!(
            buffer.push(b"\nStep 2/4\r\nStep"),
            vec!["Step 1/4 : FROM wordpress", "Step 2/4"]
        );
        assert_eq!(buffer.finish().as_deref(), Some("Step"));
        assert_eq!(buffer.finish(), None);
    }

    #[test]
    fn characters_split_across_chunks_survive() {
        let text = "café ok\n".as_bytes();
        let mut buffer = LineBuffer::new();
        assert!(buffer.push(&text[..4]).is_empty());
        assert_eq!(buffer.push(&text[4..]), vec!["café ok"]);

        assert!(buffer.push(&"naïve".as_bytes()[..3]).is_empty());
        assert!(buffer.push(&"naïve".as_bytes()[3..]).is_empty());
        assert_eq!(buffer.finish().as_deref(), Some("naïve"));
    }

    #[test]
    fn ansi_codes_are_removed() {
        assert_eq!(
            LineBuffer::split(b"\x1b[32mSuccess:\x1b[0m pulled\n"),
            vec!["Success: pulled"]
        );
        assert_eq!(LineBuffer::split(b"plain"), vec!["plain"]);
    }

    #[test]
    fn reporter_filters_by_verbosity() {
        let sink = Arc::new(MemorySink::default());
        let reporter = Reporter::new(sink.clone(), 1);

        reporter.info(0, "creating network");
        reporter.warning(1, "slow database");
        reporter.info(3, "raw build output");
        reporter.error(9, "clamped to 3 and dropped");

        let entries = sink.entries();
        assert_eq!(entries.len(), 2);
        assert!(sink.contains(LogKind::Warning, "slow database"));
        assert!(!sink.contains(LogKind::Info, "raw build output"));
    }
}
