// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Logging output backends (console and file).

use log::Level;
use parking_lot::Mutex;
use std::fs::{File, OpenOptions};
use std::io::{self, Write};
use std::path::Path;

/// Output destination for formatted log lines.
///
/// Implementations must be thread-safe: the stack logs from the reading
/// threads, the reactors and application threads concurrently.
pub trait Output: Send + Sync {
    /// Write one formatted line (without trailing newline).
    fn write(&self, level: Level, line: &str) -> io::Result<()>;

    /// Flush any buffered output.
    fn flush(&self) -> io::Result<()>;
}

/// Fixed-width level tag.
pub(crate) fn level_tag(level: Level) -> &'static str {
    match level {
        Level::Error => "ERROR",
        Level::Warn => "WARN ",
        Level::Info => "INFO ",
        Level::Debug => "DEBUG",
        Level::Trace => "TRACE",
    }
}

/// Writes to stderr.
pub struct ConsoleOutput {
    min_level: Mutex<Level>,
}

impl ConsoleOutput {
    /// Lines less severe than `min_level` are dropped.
    pub fn new(min_level: Level) -> Self {
        Self {
            min_level: Mutex::new(min_level),
        }
    }

    pub fn set_level(&self, level: Level) {
        *self.min_level.lock() = level;
    }
}

impl Output for ConsoleOutput {
    fn write(&self, level: Level, line: &str) -> io::Result<()> {
        if level > *self.min_level.lock() {
            return Ok(());
        }
        let mut stderr = io::stderr().lock();
        writeln!(stderr, "[{}] {}", level_tag(level), line)
    }

    fn flush(&self) -> io::Result<()> {
        io::stderr().flush()
    }
}

/// Appends to a file, truncated on creation.
pub struct FileOutput {
    file: Mutex<File>,
    min_level: Mutex<Level>,
}

impl FileOutput {
    pub fn new(path: impl AsRef<Path>, min_level: Level) -> io::Result<Self> {
        let file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)?;
        Ok(Self {
            file: Mutex::new(file),
            min_level: Mutex::new(min_level),
        })
    }

    pub fn set_level(&self, level: Level) {
        *self.min_level.lock() = level;
    }
}

impl Output for FileOutput {
    fn write(&self, level: Level, line: &str) -> io::Result<()> {
        if level > *self.min_level.lock() {
            return Ok(());
        }
        let mut file = self.file.lock();
        writeln!(file, "[{}] {}", level_tag(level), line)
    }

    fn flush(&self) -> io::Result<()> {
        self.file.lock().flush()
    }
}
