// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Process-wide `log` backend.

use super::output::Output;
use log::{LevelFilter, Log, Metadata, Record};
use parking_lot::Mutex;
use std::io;
use std::sync::{Arc, OnceLock};
use std::time::Instant;

static LOGGER: OnceLock<GlobalLogger> = OnceLock::new();

/// Forwards `log` records to one [`Output`], prefixed with the time since
/// initialisation.
pub struct GlobalLogger {
    output: Mutex<Arc<dyn Output>>,
    started: Instant,
}

impl Log for GlobalLogger {
    fn enabled(&self, metadata: &Metadata<'_>) -> bool {
        metadata.level() <= log::max_level()
    }

    fn log(&self, record: &Record<'_>) {
        if !self.enabled(record.metadata()) {
            return;
        }
        let elapsed = self.started.elapsed();
        let line = format!(
            "{:>5}.{:03} {}",
            elapsed.as_secs(),
            elapsed.subsec_millis(),
            record.args()
        );
        // Nowhere left to report a failing log sink.
        let _ = self.output.lock().write(record.level(), &line);
    }

    fn flush(&self) {
        let _ = self.output.lock().flush();
    }
}

/// Install the logger with `output` and set the maximum level.
///
/// Only the first call installs the backend; later calls only change the
/// level. Returns `false` when another `log` backend was installed first.
pub fn init_logger(output: Arc<dyn Output>, level: LevelFilter) -> bool {
    let mut fresh = false;
    let logger = LOGGER.get_or_init(|| {
        fresh = true;
        GlobalLogger {
            output: Mutex::new(output),
            started: Instant::now(),
        }
    });
    let installed = if fresh {
        log::set_logger(logger).is_ok()
    } else {
        true
    };
    if installed {
        log::set_max_level(level);
    }
    installed
}

/// Flush the installed output. No-op before [`init_logger`].
pub fn flush_logger() -> io::Result<()> {
    match LOGGER.get() {
        Some(logger) => logger.output.lock().flush(),
        None => Ok(()),
    }
}
