// SPDX-License-Identifier: PolyForm-Noncommercial-1.0.0
// Copyright (c) 2025 Sylvex. All rights reserved.

//! Output sinks for progress and diagnostic text.
//!
//! Every component receives an `Arc<dyn OutputSink>` at construction time;
//! there is no process-wide output. A sink only serializes writes: calls
//! appear in the order they were made and each line is written whole.
//!
//! - [`ConsoleSink`]: standard output
//! - [`FileSink`]: append-only file
//! - [`MemorySink`]: captured lines, for tests and embedding
//! - [`TeeSink`]: fan-out to several sinks

use std::fs::{self, File, OpenOptions};
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::{Local, Timelike};
use parking_lot::{Mutex, RwLock};

// =============================================================================
// OutputSink
// =============================================================================

/// Destination for human-readable progress lines.
pub trait OutputSink: Send + Sync {
    /// Writes one line.
    fn write_line(&self, line: &str);

    /// Flushes buffered lines.
    fn flush(&self) {}

    /// Returns the name of this sink.
    fn name(&self) -> &str;
}

impl<S: OutputSink + ?Sized> OutputSink for Arc<S> {
    fn write_line(&self, line: &str) {
        (**self).write_line(line)
    }

    fn flush(&self) {
        (**self).flush()
    }

    fn name(&self) -> &str {
        (**self).name()
    }
}

// =============================================================================
// ConsoleSink
// =============================================================================

/// Writes lines to standard output.
#[derive(Debug, Default, Clone, Copy)]
pub struct ConsoleSink;

impl ConsoleSink {
    /// Creates a console sink.
    pub fn new() -> Self {
        Self
    }
}

impl OutputSink for ConsoleSink {
    fn write_line(&self, line: &str) {
        let stdout = io::stdout();
        let mut handle = stdout.lock();
        if let Err(e) = writeln!(handle, "{line}") {
            tracing::warn!(error = %e, "Failed to write to stdout");
        }
    }

    fn flush(&self) {
        let _ = io::stdout().flush();
    }

    fn name(&self) -> &str {
        "console"
    }
}

// =============================================================================
// FileSink
// =============================================================================

/// Appends lines to a file.
pub struct FileSink {
    path: PathBuf,
    writer: Mutex<BufWriter<File>>,
    lines_written: AtomicU64,
}

impl FileSink {
    /// Opens (or creates) `path` for appending.
    pub fn new(path: impl AsRef<Path>) -> io::Result<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }
        let file = OpenOptions::new().create(true).append(true).open(&path)?;

        Ok(Self {
            path,
            writer: Mutex::new(BufWriter::new(file)),
            lines_written: AtomicU64::new(0),
        })
    }

    /// Opens a new file with a unique timestamped name inside `dir`.
    pub fn unique_in(dir: impl AsRef<Path>, prefix: &str) -> io::Result<Self> {
        Self::new(unique_log_path(dir, prefix, "txt"))
    }

    /// Path of the file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Number of lines written so far.
    pub fn lines_written(&self) -> u64 {
        self.lines_written.load(Ordering::Relaxed)
    }
}

impl OutputSink for FileSink {
    fn write_line(&self, line: &str) {
        let mut writer = self.writer.lock();
        match writeln!(writer, "{line}") {
            Ok(()) => {
                self.lines_written.fetch_add(1, Ordering::Relaxed);
            }
            Err(e) => {
                tracing::warn!(path = %self.path.display(), error = %e, "Failed to write output line");
            }
        }
    }

    fn flush(&self) {
        if let Err(e) = self.writer.lock().flush() {
            tracing::warn!(path = %self.path.display(), error = %e, "Failed to flush output file");
        }
    }

    fn name(&self) -> &str {
        "file"
    }
}

impl Drop for FileSink {
    fn drop(&mut self) {
        let _ = self.writer.get_mut().flush();
    }
}

impl std::fmt::Debug for FileSink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FileSink")
            .field("path", &self.path)
            .field("lines_written", &self.lines_written())
            .finish()
    }
}

/// Returns `<dir>/<prefix>_<yyyyMMddHHmmssffff>.<ext>` for a file that does
/// not exist yet.
///
/// The timestamp is regenerated until the name is free, so two calls in the
/// same tenth of a millisecond never collide.
pub fn unique_log_path(dir: impl AsRef<Path>, prefix: &str, ext: &str) -> PathBuf {
    let dir = dir.as_ref();
    loop {
        let now = Local::now();
        let stamp = format!(
            "{}{:04}",
            now.format("%Y%m%d%H%M%S"),
            now.nanosecond() % 1_000_000_000 / 100_000
        );
        let candidate = dir.join(format!("{prefix}_{stamp}.{ext}"));
        if !candidate.exists() {
            return candidate;
        }
        std::thread::sleep(std::time::Duration::from_micros(100));
    }
}

// =============================================================================
// MemorySink
// =============================================================================

/// Keeps every line in memory.
#[derive(Debug, Clone, Default)]
pub struct MemorySink {
    lines: Arc<RwLock<Vec<String>>>,
}

impl MemorySink {
    /// Creates an empty memory sink.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns all lines written so far.
    pub fn lines(&self) -> Vec<String> {
        self.lines.read().clone()
    }

    /// Returns lines containing `needle`.
    pub fn lines_containing(&self, needle: &str) -> Vec<String> {
        self.lines
            .read()
            .iter()
            .filter(|l| l.contains(needle))
            .cloned()
            .collect()
    }

    /// Returns `true` if any line contains `needle`.
    pub fn contains(&self, needle: &str) -> bool {
        self.lines.read().iter().any(|l| l.contains(needle))
    }

    /// Number of lines.
    pub fn len(&self) -> usize {
        self.lines.read().len()
    }

    /// Returns `true` if nothing was written.
    pub fn is_empty(&self) -> bool {
        self.lines.read().is_empty()
    }

    /// Clears all lines.
    pub fn clear(&self) {
        self.lines.write().clear();
    }
}

impl OutputSink for MemorySink {
    fn write_line(&self, line: &str) {
        self.lines.write().push(line.to_string());
    }

    fn name(&self) -> &str {
        "memory"
    }
}

// =============================================================================
// TeeSink
// =============================================================================

/// Writes every line to all inner sinks, in order.
#[derive(Default)]
pub struct TeeSink {
    sinks: Vec<Arc<dyn OutputSink>>,
}

impl TeeSink {
    /// Creates an empty tee.
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a sink.
    pub fn with(mut self, sink: Arc<dyn OutputSink>) -> Self {
        self.sinks.push(sink);
        self
    }

    /// Number of inner sinks.
    pub fn len(&self) -> usize {
        self.sinks.len()
    }

    /// Returns `true` if there are no inner sinks.
    pub fn is_empty(&self) -> bool {
        self.sinks.is_empty()
    }
}

impl OutputSink for TeeSink {
    fn write_line(&self, line: &str) {
        for sink in &self.sinks {
            sink.write_line(line);
        }
    }

    fn flush(&self) {
        for sink in &self.sinks {
            sink.flush();
        }
    }

    fn name(&self) -> &str {
        "tee"
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_memory_sink_keeps_order() {
        let sink = MemorySink::new();
        sink.write_line("first");
        sink.write_line("second");
        assert_eq!(sink.lines(), vec!["first", "second"]);
        assert!(sink.contains("sec"));
        assert_eq!(sink.lines_containing("first").len(), 1);

        sink.clear();
        assert!(sink.is_empty());
    }

    #[test]
    fn test_file_sink_appends() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out.txt");

        {
            let sink = FileSink::new(&path).unwrap();
            sink.write_line("Connected");
            sink.write_line("Client disconnected.");
            sink.flush();
            assert_eq!(sink.lines_written(), 2);
        }
        {
            let sink = FileSink::new(&path).unwrap();
            sink.write_line("again");
        }

        let content = fs::read_to_string(&path).unwrap();
        assert_eq!(content, "Connected\nClient disconnected.\nagain\n");
    }

    #[test]
    fn test_unique_log_path_never_collides() {
        let dir = tempfile::tempdir().unwrap();
        let first = FileSink::unique_in(dir.path(), "ConsoleLog").unwrap();
        first.write_line("x");
        first.flush();
        let second_path = unique_log_path(dir.path(), "ConsoleLog", "txt");

        assert_ne!(first.path(), second_path.as_path());
        let name = second_path.file_name().unwrap().to_string_lossy().to_string();
        assert!(name.starts_with("ConsoleLog_"));
        assert!(name.ends_with(".txt"));
        // prefix + '_' + 18 digit stamp + ".txt"
        assert_eq!(name.len(), "ConsoleLog_".len() + 18 + 4);
    }

    #[test]
    fn test_tee_sink_fans_out() {
        let a = MemorySink::new();
        let b = MemorySink::new();
        let tee = TeeSink::new()
            .with(Arc::new(a.clone()))
            .with(Arc::new(b.clone()));

        tee.write_line("hello");
        assert_eq!(tee.len(), 2);
        assert_eq!(a.lines(), vec!["hello"]);
        assert_eq!(b.lines(), vec!["hello"]);
    }
}
