// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Ready-made backend for the `log` facade.
//!
//! Every component logs through `log` macros with a bracketed component
//! prefix (`[queue]`, `[sdo]`, `[pdo]`...). Applications that already run a
//! `log` backend need nothing from here; others can install this one:
//!
//! ```ignore
//! use comaster::logging::{init_logger, ConsoleOutput};
//! use std::sync::Arc;
//!
//! init_logger(Arc::new(ConsoleOutput::new(log::Level::Debug)), log::LevelFilter::Debug);
//! ```
//!
//! Timeouts log at `warn`, aborts and emergencies at `error`, frame traffic
//! at `trace`.

pub mod logger;
mod output;

pub use logger::{flush_logger, init_logger};
pub use output::{ConsoleOutput, FileOutput, Output};
