// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Dictionaries by model name.

use super::{Dictionary, MINIMAL_MODEL};
use crate::error::{Error, Result};
use dashmap::DashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Shared dictionaries keyed by device model name.
///
/// The built-in [`MINIMAL_MODEL`] is always present. Models not registered
/// explicitly are looked up as `<schema_dir>/<model>.eds` on first use.
pub struct DictionaryRegistry {
    models: DashMap<String, Arc<Dictionary>>,
    schema_dir: Option<PathBuf>,
}

impl DictionaryRegistry {
    pub fn new(schema_dir: Option<PathBuf>) -> Self {
        let models = DashMap::new();
        models.insert(MINIMAL_MODEL.to_string(), Arc::new(Dictionary::minimal()));
        Self { models, schema_dir }
    }

    /// Register an already-built dictionary, replacing any previous one.
    pub fn insert(&self, model: &str, dictionary: Dictionary) -> Arc<Dictionary> {
        let dict = Arc::new(dictionary);
        self.models.insert(model.to_string(), Arc::clone(&dict));
        dict
    }

    /// Parse `path` under `model` unless the model is already known.
    pub fn create(&self, model: &str, path: impl AsRef<Path>) -> Result<Arc<Dictionary>> {
        if let Some(existing) = self.models.get(model) {
            return Ok(Arc::clone(existing.value()));
        }
        let dict = Dictionary::from_file(path)?;
        log::info!("[schema] model '{}' loaded ({} registers)", model, dict.len());
        Ok(self.insert(model, dict))
    }

    /// Re-parse `path` and replace the model. Devices keep the dictionary
    /// they were built with until they are explicitly rebuilt.
    pub fn reload(&self, model: &str, path: impl AsRef<Path>) -> Result<Arc<Dictionary>> {
        let dict = Dictionary::from_file(path)?;
        log::info!("[schema] model '{}' reloaded ({} registers)", model, dict.len());
        Ok(self.insert(model, dict))
    }

    /// Known model, or `<schema_dir>/<model>.eds` when a schema directory is
    /// configured.
    pub fn get(&self, model: &str) -> Result<Arc<Dictionary>> {
        if let Some(existing) = self.models.get(model) {
            return Ok(Arc::clone(existing.value()));
        }
        match &self.schema_dir {
            Some(dir) => {
                let path = dir.join(format!("{}.eds", model));
                if path.is_file() {
                    self.create(model, path)
                } else {
                    Err(Error::DictionaryNotFound(model.to_string()))
                }
            }
            None => Err(Error::DictionaryNotFound(model.to_string())),
        }
    }

    pub fn contains(&self, model: &str) -> bool {
        self.models.contains_key(model)
    }

    pub fn models(&self) -> Vec<String> {
        let mut names: Vec<String> = self.models.iter().map(|e| e.key().clone()).collect();
        names.sort();
        names
    }
}

impl Default for DictionaryRegistry {
    fn default() -> Self {
        Self::new(None)
    }
}
