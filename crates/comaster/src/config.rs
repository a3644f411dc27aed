// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Master configuration - single source of truth for constants.
//!
//! # Architecture
//!
//! - **Level 1 (Static)**: protocol constants (identifier bands, node range,
//!   channel counts) and runtime defaults.
//! - **Level 2 (Dynamic)**: [`MasterConfig`], built in code or loaded from
//!   YAML with the `config-loaders` feature.
//!
//! # Example
//!
//! ```yaml
//! reply_timeout_ms: 200
//! ports:
//!   - name: bus0
//!     driver: socketcan
//!     channel: can0
//!     bitrate: 500000
//! devices:
//!   - device_id: 1
//!     node_id: 5
//!     port: bus0
//!     model: drive
//!     init: true
//! ```

use crate::error::{Error, Result};
use std::path::PathBuf;
use std::time::Duration;

#[cfg(feature = "config-loaders")]
use serde::{Deserialize, Serialize};

// =======================================================================
// Identifier bands (base + node id, not reconfigurable)
// =======================================================================

/// Node-state command identifier.
pub const COB_NMT: u16 = 0x000;

/// Broadcast trigger identifier.
pub const COB_SYNC: u16 = 0x080;

/// Async status (emergency) band.
pub const COB_EMCY: u16 = 0x080;

/// First transmit broadcast channel band (peer -> master).
pub const COB_TPDO1: u16 = 0x180;

/// First receive broadcast channel band (master -> peer).
pub const COB_RPDO1: u16 = 0x200;

/// Register reply band (peer -> master).
pub const COB_SDO_REPLY: u16 = 0x580;

/// Register request band (master -> peer).
pub const COB_SDO_REQUEST: u16 = 0x600;

/// Node guard / heartbeat band.
pub const COB_NMT_ERROR: u16 = 0x700;

/// Bit 31 of a channel identifier entry: channel disabled.
pub const COB_DISABLED_BIT: u32 = 1 << 31;

// =======================================================================
// Protocol limits
// =======================================================================

/// Lowest valid node id.
pub const MIN_NODE_ID: u8 = 1;

/// Highest valid node id.
pub const MAX_NODE_ID: u8 = 127;

/// Broadcast channels per direction.
pub const PDO_COUNT: u8 = 8;

/// Largest broadcast payload.
pub const PDO_MAX_BYTES: usize = 8;

/// Largest expedited register payload.
pub const EXPEDITED_MAX_BYTES: usize = 4;

/// Payload bytes per segment.
pub const SEGMENT_BYTES: usize = 7;

/// Largest segmented read accepted for a variable-length register. Fixed
/// width registers accept their own size only.
pub const MAX_UPLOAD_BYTES: usize = 4096;

// =======================================================================
// Runtime defaults
// =======================================================================

/// Time a correlated request waits for its answer.
pub const DEFAULT_REPLY_TIMEOUT: Duration = Duration::from_millis(200);

/// Trace queue capacity per port.
pub const DEFAULT_TRACE_CAPACITY: usize = 50;

/// Upper bound of one blocking driver receive.
pub const DEFAULT_READER_POLL: Duration = Duration::from_millis(100);

/// Blocking read timeout used during device initialisation.
pub const DEFAULT_INIT_TIMEOUT: Duration = Duration::from_millis(100);

/// Validate a bus node id.
pub fn check_node_id(node_id: u8) -> Result<u8> {
    if (MIN_NODE_ID..=MAX_NODE_ID).contains(&node_id) {
        Ok(node_id)
    } else {
        Err(Error::InvalidNodeId(node_id))
    }
}

// =======================================================================
// Dynamic configuration
// =======================================================================

/// Transport driver selected by name.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "config-loaders", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "config-loaders", serde(rename_all = "lowercase"))]
pub enum DriverKind {
    /// In-process bus (simulation, tests).
    Virtual,
    /// Linux SocketCAN interface.
    SocketCan,
}

/// One port to open.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "config-loaders", derive(Serialize, Deserialize))]
pub struct PortConfig {
    /// Name used by devices to reference this port.
    pub name: String,
    pub driver: DriverKind,
    /// Interface (`can0`) or virtual bus name.
    pub channel: String,
    /// Requested bitrate in bit/s.
    #[cfg_attr(feature = "config-loaders", serde(default))]
    pub bitrate: Option<u32>,
}

impl PortConfig {
    /// Port on a process-wide virtual bus named `channel`.
    pub fn virtual_bus(name: &str, channel: &str) -> Self {
        Self {
            name: name.to_string(),
            driver: DriverKind::Virtual,
            channel: channel.to_string(),
            bitrate: None,
        }
    }
}

/// One device to create at start-up.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "config-loaders", derive(Serialize, Deserialize))]
pub struct DeviceConfig {
    /// Application-side identifier.
    pub device_id: u16,
    /// Bus address (1..=127).
    pub node_id: u8,
    /// Name of a configured port.
    pub port: String,
    /// Dictionary model; the built-in minimal model when absent.
    #[cfg_attr(feature = "config-loaders", serde(default))]
    pub model: Option<String>,
    /// Run the device initialisation sequence after creation.
    #[cfg_attr(feature = "config-loaders", serde(default))]
    pub init: bool,
}

/// Top-level master configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "config-loaders", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "config-loaders", serde(default))]
pub struct MasterConfig {
    pub reply_timeout_ms: u64,
    pub trace_capacity: usize,
    pub reader_poll_ms: u64,
    pub init_timeout_ms: u64,
    /// Directory searched for `<model>.eds` schema files.
    pub schema_dir: Option<PathBuf>,
    pub ports: Vec<PortConfig>,
    pub devices: Vec<DeviceConfig>,
}

impl Default for MasterConfig {
    fn default() -> Self {
        Self {
            reply_timeout_ms: DEFAULT_REPLY_TIMEOUT.as_millis() as u64,
            trace_capacity: DEFAULT_TRACE_CAPACITY,
            reader_poll_ms: DEFAULT_READER_POLL.as_millis() as u64,
            init_timeout_ms: DEFAULT_INIT_TIMEOUT.as_millis() as u64,
            schema_dir: None,
            ports: Vec::new(),
            devices: Vec::new(),
        }
    }
}

impl MasterConfig {
    pub fn reply_timeout(&self) -> Duration {
        Duration::from_millis(self.reply_timeout_ms)
    }

    pub fn reader_poll(&self) -> Duration {
        Duration::from_millis(self.reader_poll_ms)
    }

    pub fn init_timeout(&self) -> Duration {
        Duration::from_millis(self.init_timeout_ms)
    }

    /// Structural checks that do not need any open resource.
    pub fn validate(&self) -> Result<()> {
        if self.reply_timeout_ms == 0 {
            return Err(Error::Config("reply_timeout_ms must be > 0".to_string()));
        }
        if self.reader_poll_ms == 0 {
            return Err(Error::Config("reader_poll_ms must be > 0".to_string()));
        }
        for (i, port) in self.ports.iter().enumerate() {
            if self.ports[..i].iter().any(|p| p.name == port.name) {
                return Err(Error::Config(format!("duplicate port '{}'", port.name)));
            }
        }
        for (i, dev) in self.devices.iter().enumerate() {
            check_node_id(dev.node_id)?;
            if !self.ports.iter().any(|p| p.name == dev.port) {
                return Err(Error::PortNotFound(dev.port.clone()));
            }
            let earlier = &self.devices[..i];
            if earlier.iter().any(|d| d.device_id == dev.device_id) {
                return Err(Error::DuplicateDevice(dev.device_id));
            }
            if earlier
                .iter()
                .any(|d| d.port == dev.port && d.node_id == dev.node_id)
            {
                return Err(Error::DuplicateNode {
                    port: dev.port.clone(),
                    node_id: dev.node_id,
                });
            }
        }
        Ok(())
    }

    /// Parse and validate a YAML document.
    #[cfg(feature = "config-loaders")]
    pub fn from_yaml_str(text: &str) -> Result<Self> {
        let config: Self = serde_yaml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    /// Load and validate a YAML file.
    #[cfg(feature = "config-loaders")]
    pub fn from_yaml_file(path: impl AsRef<std::path::Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)?;
        log::debug!("[master] loading configuration {}", path.display());
        Self::from_yaml_str(&text)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_node_id_range() {
        assert!(check_node_id(0).is_err());
        assert_eq!(check_node_id(1).unwrap(), 1);
        assert_eq!(check_node_id(127).unwrap(), 127);
        assert!(matches!(check_node_id(128), Err(Error::InvalidNodeId(128))));
    }

    #[test]
    fn test_defaults() {
        let config = MasterConfig::default();
        assert_eq!(config.reply_timeout(), Duration::from_millis(200));
        assert_eq!(config.trace_capacity, 50);
        assert_eq!(config.init_timeout(), Duration::from_millis(100));
        config.validate().unwrap();
    }

    #[test]
    fn test_validate_duplicates() {
        let mut config = MasterConfig {
            ports: vec![PortConfig::virtual_bus("bus0", "cfg-test")],
            ..MasterConfig::default()
        };
        let dev = DeviceConfig {
            device_id: 1,
            node_id: 5,
            port: "bus0".to_string(),
            model: None,
            init: false,
        };
        config.devices = vec![dev.clone(), DeviceConfig { device_id: 2, ..dev.clone() }];
        assert!(matches!(config.validate(), Err(Error::DuplicateNode { node_id: 5, .. })));

        config.devices = vec![dev.clone(), DeviceConfig { node_id: 6, ..dev.clone() }];
        assert!(matches!(config.validate(), Err(Error::DuplicateDevice(1))));

        config.devices = vec![DeviceConfig { port: "nope".to_string(), ..dev }];
        assert!(matches!(config.validate(), Err(Error::PortNotFound(_))));
    }

    #[cfg(feature = "config-loaders")]
    #[test]
    fn test_from_yaml_str() {
        let yaml = r#"
reply_timeout_ms: 50
ports:
  - name: bus0
    driver: virtual
    channel: yaml-bus
  - name: bus1
    driver: socketcan
    channel: can0
    bitrate: 500000
devices:
  - device_id: 10
    node_id: 3
    port: bus0
    model: drive
    init: true
  - device_id: 11
    node_id: 3
    port: bus1
"#;
        let config = MasterConfig::from_yaml_str(yaml).unwrap();
        assert_eq!(config.reply_timeout(), Duration::from_millis(50));
        assert_eq!(config.trace_capacity, DEFAULT_TRACE_CAPACITY);
        assert_eq!(config.ports[1].driver, DriverKind::SocketCan);
        assert_eq!(config.ports[1].bitrate, Some(500_000));
        assert_eq!(config.devices[0].model.as_deref(), Some("drive"));
        assert!(config.devices[0].init);
        assert!(!config.devices[1].init);
        assert_eq!(config.devices[1].model, None);
    }

    #[cfg(feature = "config-loaders")]
    #[test]
    fn test_from_yaml_rejects_bad_node() {
        let yaml = r#"
ports: [{ name: bus0, driver: virtual, channel: x }]
devices: [{ device_id: 1, node_id: 0, port: bus0 }]
"#;
        assert!(matches!(
            MasterConfig::from_yaml_str(yaml),
            Err(Error::InvalidNodeId(0))
        ));
        assert!(matches!(
            MasterConfig::from_yaml_str("reply_timeout_ms: [1"),
            Err(Error::Yaml(_))
        ));
    }
}
