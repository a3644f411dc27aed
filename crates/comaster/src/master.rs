// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Top-level context: reactors, open ports, dictionaries and devices.
//!
//! # Architecture
//!
//! ```text
//! Master
//! +-- queue_reactor   (reply timeouts)
//! +-- event_reactor   (reactor-synchronous callbacks)
//! +-- ports:     DashMap<name, Arc<CanPort>>
//! +-- registry:  DictionaryRegistry (model -> Arc<Dictionary>)
//! +-- devices:   DashMap<device_id, Arc<ProtocolEngine>>
//! ```
//!
//! # Teardown
//!
//! [`Master::shutdown`] (also run on drop) stops both reactors first, then
//! detaches every device and closes the ports.

use crate::config::{self, MasterConfig, PortConfig};
use crate::dictionary::{DictionaryRegistry, MINIMAL_MODEL};
use crate::engine::{EngineOptions, ProtocolEngine};
use crate::error::{Error, Result};
use crate::protocol::sync_frame;
use crate::reactor::Reactor;
use crate::transport::{open_driver, CanDriver, CanPort, PortOptions};
use dashmap::DashMap;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Owner of every shared resource of the stack.
pub struct Master {
    queue_reactor: Arc<Reactor>,
    event_reactor: Arc<Reactor>,
    ports: DashMap<String, Arc<CanPort>>,
    devices: DashMap<u16, Arc<ProtocolEngine>>,
    registry: DictionaryRegistry,
    engine_options: EngineOptions,
    port_options: PortOptions,
    /// Serialises the duplicate checks of device creation.
    admission: Mutex<()>,
    shut_down: AtomicBool,
}

impl Master {
    /// Empty context with default timeouts; open ports and create devices
    /// explicitly.
    pub fn new() -> Self {
        Self::with_settings(&MasterConfig::default())
    }

    fn with_settings(config: &MasterConfig) -> Self {
        Self {
            queue_reactor: Arc::new(Reactor::start("queue")),
            event_reactor: Arc::new(Reactor::start("events")),
            ports: DashMap::new(),
            devices: DashMap::new(),
            registry: DictionaryRegistry::new(config.schema_dir.clone()),
            engine_options: EngineOptions {
                reply_timeout: config.reply_timeout(),
                init_timeout: config.init_timeout(),
            },
            port_options: PortOptions {
                reader_poll: config.reader_poll(),
                trace_capacity: config.trace_capacity,
            },
            admission: Mutex::new(()),
            shut_down: AtomicBool::new(false),
        }
    }

    /// Validate `config`, open its ports and create its devices.
    ///
    /// Devices flagged `init` run [`ProtocolEngine::init`]; a failure there
    /// aborts start-up.
    pub fn from_config(config: &MasterConfig) -> Result<Self> {
        config.validate()?;
        let master = Self::with_settings(config);
        for port in &config.ports {
            master.open_port(port)?;
        }
        for device in &config.devices {
            let model = device.model.as_deref().unwrap_or(MINIMAL_MODEL);
            let engine = master.create_device(device.device_id, device.node_id, &device.port, model)?;
            if device.init {
                engine.init()?;
            }
        }
        log::info!(
            "[master] started: {} ports, {} devices",
            master.ports.len(),
            master.devices.len()
        );
        Ok(master)
    }

    pub fn registry(&self) -> &DictionaryRegistry {
        &self.registry
    }

    /// Open a port with the driver selected by `config`.
    pub fn open_port(&self, config: &PortConfig) -> Result<Arc<CanPort>> {
        if config.bitrate.is_some() && config.driver == config::DriverKind::Virtual {
            log::debug!("[master] bitrate ignored for virtual port '{}'", config.name);
        }
        let driver = open_driver(config)?;
        self.attach_port(&config.name, driver)
    }

    /// Register a port over an already opened driver.
    pub fn attach_port(&self, name: &str, driver: Box<dyn CanDriver>) -> Result<Arc<CanPort>> {
        self.ensure_running()?;
        if self.ports.contains_key(name) {
            return Err(Error::Config(format!("port '{}' is already open", name)));
        }
        let port = Arc::new(CanPort::start(name, driver, self.port_options));
        self.ports.insert(name.to_string(), Arc::clone(&port));
        log::info!("[master] port '{}' open", name);
        Ok(port)
    }

    pub fn port(&self, name: &str) -> Result<Arc<CanPort>> {
        self.ports
            .get(name)
            .map(|p| Arc::clone(p.value()))
            .ok_or_else(|| Error::PortNotFound(name.to_string()))
    }

    /// Sorted names of the open ports.
    pub fn ports(&self) -> Vec<String> {
        let mut names: Vec<String> = self.ports.iter().map(|p| p.key().clone()).collect();
        names.sort();
        names
    }

    /// Create a device on `port` using dictionary `model`.
    pub fn create_device(
        &self,
        device_id: u16,
        node_id: u8,
        port: &str,
        model: &str,
    ) -> Result<Arc<ProtocolEngine>> {
        self.ensure_running()?;
        let node_id = config::check_node_id(node_id)?;
        let port_handle = self.port(port)?;
        let dictionary = self.registry.get(model)?;

        let _admission = self.admission.lock();
        if self.devices.contains_key(&device_id) {
            return Err(Error::DuplicateDevice(device_id));
        }
        let node_taken = self
            .devices
            .iter()
            .any(|d| d.node_id() == node_id && d.port().name() == port);
        if node_taken {
            return Err(Error::DuplicateNode {
                port: port.to_string(),
                node_id,
            });
        }

        let engine = ProtocolEngine::new(
            device_id,
            node_id,
            dictionary,
            port_handle,
            Arc::clone(&self.queue_reactor),
            Arc::clone(&self.event_reactor),
            self.engine_options,
        )?;
        self.devices.insert(device_id, Arc::clone(&engine));
        Ok(engine)
    }

    pub fn device(&self, device_id: u16) -> Result<Arc<ProtocolEngine>> {
        self.devices
            .get(&device_id)
            .map(|d| Arc::clone(d.value()))
            .ok_or(Error::DeviceNotFound(device_id))
    }

    /// Sorted application ids of the registered devices.
    pub fn devices(&self) -> Vec<u16> {
        let mut ids: Vec<u16> = self.devices.iter().map(|d| *d.key()).collect();
        ids.sort_unstable();
        ids
    }

    /// Detach and forget a device.
    pub fn remove_device(&self, device_id: u16) -> Result<()> {
        let (_, engine) = self
            .devices
            .remove(&device_id)
            .ok_or(Error::DeviceNotFound(device_id))?;
        engine.detach();
        Ok(())
    }

    /// Broadcast trigger on every open port, bypassing device queues.
    pub fn send_sync(&self) -> Result<()> {
        let frame = sync_frame();
        for port in self.ports.iter() {
            port.send(&frame)?;
        }
        Ok(())
    }

    /// Node-state command to every node of `port` (node 0).
    pub fn broadcast_nmt(&self, port: &str, command: crate::protocol::NmtCommand) -> Result<()> {
        self.port(port)?.send(&command.frame(0))
    }

    fn ensure_running(&self) -> Result<()> {
        if self.shut_down.load(Ordering::Acquire) {
            return Err(Error::ReactorStopped);
        }
        Ok(())
    }

    /// Stop reactors, detach devices, close ports. Idempotent.
    pub fn shutdown(&self) {
        if self.shut_down.swap(true, Ordering::AcqRel) {
            return;
        }
        self.queue_reactor.stop();
        self.event_reactor.stop();
        for device in self.devices.iter() {
            device.detach();
        }
        for port in self.ports.iter() {
            if let Err(e) = port.close() {
                log::warn!("[master] closing port '{}': {}", port.key(), e);
            }
        }
        log::info!("[master] shut down");
    }

    pub fn is_shut_down(&self) -> bool {
        self.shut_down.load(Ordering::Acquire)
    }
}

impl Default for Master {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for Master {
    fn drop(&mut self) {
        self.shutdown();
    }
}
