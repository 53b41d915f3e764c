// rust/switch-core/src/config.rs

//! Configuration management for the aggregation controller.
//!
//! This module provides configuration parsing from TOML files, environment
//! variable overrides, and validation of configuration values.

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use crate::dataplane::REGISTER_SIZE;
use crate::error::{ControlError, Result};
use crate::job::MacAddr;

/// Device ports are 9 bits wide.
pub const MAX_DEV_PORT: u16 = 512;

/// Top-level controller configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ControllerConfig {
    pub switch: SwitchConfig,
    pub pool: PoolConfig,
    pub multicast: MulticastConfig,
    pub dataplane: DataplaneConfig,
    pub job: JobConfig,
    pub server: ServerConfig,
    /// Machines attached to the switch, one per device port.
    pub ports: Vec<PortConfig>,
}

/// The switch's own addresses as seen by workers.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SwitchConfig {
    pub mac: MacAddr,
    pub ipv4: Ipv4Addr,
    /// Base UDP port workers send aggregation packets to.
    pub udp_port: u16,
    /// Mask applied to the destination port; the low bits select a pipeline.
    pub udp_port_mask: u16,
    /// RoCE partition key.
    pub partition_key: u16,
}

/// Slice of the register space handed to jobs.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    pub base: u32,
    pub size: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MulticastConfig {
    pub aggregation_group_id: u16,
    pub all_ports_group_id: u16,
}

/// Dataplane backend type.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DataplaneBackend {
    /// In-process tables, used for development and tests.
    #[default]
    Memory,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DataplaneConfig {
    pub backend: DataplaneBackend,
    /// Deadline for a single table-programming call.
    pub call_timeout_ms: u64,
    /// Maximum number of retries for a failed call.
    pub max_retries: u32,
    /// Initial delay (milliseconds) between retries.
    pub retry_delay_ms: u64,
    /// Maximum delay (milliseconds) between retries.
    pub max_retry_delay_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct JobConfig {
    /// Treat an admission of rank 0 as the start of a new job.
    pub clear_on_rank_zero: bool,
    /// Job description loaded at start-up.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub job_file: Option<PathBuf>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub address: String,
    pub port: u16,
}

/// One machine attached to a switch port.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortConfig {
    pub mac: MacAddr,
    pub dev_port: u16,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ipv4: Option<Ipv4Addr>,
}

impl Default for SwitchConfig {
    fn default() -> Self {
        Self {
            mac: MacAddr::new([0x06, 0x00, 0x00, 0x00, 0x00, 0x01]),
            ipv4: Ipv4Addr::new(198, 19, 200, 200),
            udp_port: 0xbee0,
            udp_port_mask: 0xfff0,
            partition_key: 0xffff,
        }
    }
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            base: 0,
            size: REGISTER_SIZE,
        }
    }
}

impl Default for MulticastConfig {
    fn default() -> Self {
        Self {
            aggregation_group_id: 0x1234,
            all_ports_group_id: 0x1235,
        }
    }
}

impl Default for DataplaneConfig {
    fn default() -> Self {
        Self {
            backend: DataplaneBackend::Memory,
            call_timeout_ms: 3_000,
            max_retries: 3,
            retry_delay_ms: 50,
            max_retry_delay_ms: 1_000,
        }
    }
}

impl Default for JobConfig {
    fn default() -> Self {
        Self {
            clear_on_rank_zero: true,
            job_file: None,
        }
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            address: "0.0.0.0".to_string(),
            port: 50099,
        }
    }
}

impl FromStr for ControllerConfig {
    type Err = ControlError;

    /// Parse configuration from a TOML string.
    fn from_str(s: &str) -> Result<Self> {
        toml::from_str(s).map_err(|e| ControlError::config_with_source("failed to parse TOML config", e))
    }
}

/// Parses decimal or `0x`-prefixed hexadecimal integers.
fn parse_int<T: TryFrom<u64>>(val: &str) -> Option<T> {
    let val = val.trim();
    let parsed = match val.strip_prefix("0x").or_else(|| val.strip_prefix("0X")) {
        Some(hex) => u64::from_str_radix(hex, 16).ok()?,
        None => val.parse::<u64>().ok()?,
    };
    T::try_from(parsed).ok()
}

impl ControllerConfig {
    /// Load configuration from a TOML file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read, parsed or validated.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .map_err(|e| ControlError::io(path, "failed to read config file", e))?;
        let config: Self = content.parse()?;
        config.validate()?;
        Ok(config)
    }

    // Apply environment variable overrides.
    //
    // Variables are prefixed with `SML_` followed by the section and field
    // name, e.g. `SML_SWITCH_IPV4` or `SML_DATAPLANE_CALL_TIMEOUT_MS`.
    // Unparseable values are ignored.
    #[must_use]
    pub fn with_env_overrides(mut self) -> Self {
        // Switch overrides
        if let Ok(val) = std::env::var("SML_SWITCH_MAC") {
            if let Ok(v) = val.parse() {
                self.switch.mac = v;
            }
        }
        if let Ok(val) = std::env::var("SML_SWITCH_IPV4") {
            if let Ok(v) = val.parse() {
                self.switch.ipv4 = v;
            }
        }
        if let Ok(val) = std::env::var("SML_SWITCH_UDP_PORT") {
            if let Some(v) = parse_int(&val) {
                self.switch.udp_port = v;
            }
        }
        if let Ok(val) = std::env::var("SML_SWITCH_UDP_PORT_MASK") {
            if let Some(v) = parse_int(&val) {
                self.switch.udp_port_mask = v;
            }
        }
        if let Ok(val) = std::env::var("SML_SWITCH_PARTITION_KEY") {
            if let Some(v) = parse_int(&val) {
                self.switch.partition_key = v;
            }
        }

        // Pool overrides
        if let Ok(val) = std::env::var("SML_POOL_BASE") {
            if let Some(v) = parse_int(&val) {
                self.pool.base = v;
            }
        }
        if let Ok(val) = std::env::var("SML_POOL_SIZE") {
            if let Some(v) = parse_int(&val) {
                self.pool.size = v;
            }
        }

        // Multicast overrides
        if let Ok(val) = std::env::var("SML_MULTICAST_AGGREGATION_GROUP_ID") {
            if let Some(v) = parse_int(&val) {
                self.multicast.aggregation_group_id = v;
            }
        }
        if let Ok(val) = std::env::var("SML_MULTICAST_ALL_PORTS_GROUP_ID") {
            if let Some(v) = parse_int(&val) {
                self.multicast.all_ports_group_id = v;
            }
        }

        // Dataplane overrides
        if let Ok(val) = std::env::var("SML_DATAPLANE_BACKEND") {
            if val.eq_ignore_ascii_case("memory") {
                self.dataplane.backend = DataplaneBackend::Memory;
            }
        }
        if let Ok(val) = std::env::var("SML_DATAPLANE_CALL_TIMEOUT_MS") {
            if let Ok(v) = val.parse() {
                self.dataplane.call_timeout_ms = v;
            }
        }
        if let Ok(val) = std::env::var("SML_DATAPLANE_MAX_RETRIES") {
            if let Ok(v) = val.parse() {
                self.dataplane.max_retries = v;
            }
        }
        if let Ok(val) = std::env::var("SML_DATAPLANE_RETRY_DELAY_MS") {
            if let Ok(v) = val.parse() {
                self.dataplane.retry_delay_ms = v;
            }
        }
        if let Ok(val) = std::env::var("SML_DATAPLANE_MAX_RETRY_DELAY_MS") {
            if let Ok(v) = val.parse() {
                self.dataplane.max_retry_delay_ms = v;
            }
        }

        // Job overrides
        if let Ok(val) = std::env::var("SML_JOB_CLEAR_ON_RANK_ZERO") {
            if let Ok(v) = val.parse() {
                self.job.clear_on_rank_zero = v;
            }
        }
        if let Ok(val) = std::env::var("SML_JOB_FILE") {
            self.job.job_file = Some(PathBuf::from(val));
        }

        // Server overrides
        if let Ok(val) = std::env::var("SML_SERVER_ADDRESS") {
            self.server.address = val;
        }
        if let Ok(val) = std::env::var("SML_SERVER_PORT") {
            if let Ok(v) = val.parse() {
                self.server.port = v;
            }
        }

        self
    }

    /// Validate all configuration values.
    ///
    /// # Errors
    ///
    /// Returns an error naming the first invalid value.
    pub fn validate(&self) -> Result<()> {
        // Switch validation
        if self.switch.mac.is_zero() || self.switch.mac.is_broadcast() {
            return Err(ControlError::config(format!(
                "switch.mac {} is not a usable unicast address",
                self.switch.mac
            )));
        }
        if self.switch.udp_port_mask == 0 {
            return Err(ControlError::config("switch.udp_port_mask must be non-zero"));
        }

        // Pool validation
        if self.pool.size == 0 {
            return Err(ControlError::config("pool.size must be greater than 0"));
        }
        if u64::from(self.pool.base) + u64::from(self.pool.size) > u64::from(REGISTER_SIZE) {
            return Err(ControlError::config(format!(
                "pool.base + pool.size must not exceed the register size of {}",
                REGISTER_SIZE
            )));
        }

        // Multicast validation
        if self.multicast.aggregation_group_id == 0 || self.multicast.all_ports_group_id == 0 {
            return Err(ControlError::config("multicast group ids must be non-zero"));
        }
        if self.multicast.aggregation_group_id == self.multicast.all_ports_group_id {
            return Err(ControlError::config(
                "multicast.aggregation_group_id and multicast.all_ports_group_id must differ",
            ));
        }

        // Dataplane validation
        if self.dataplane.call_timeout_ms == 0 {
            return Err(ControlError::config("dataplane.call_timeout_ms must be greater than 0"));
        }
        if self.dataplane.retry_delay_ms > self.dataplane.max_retry_delay_ms {
            return Err(ControlError::config(
                "dataplane.retry_delay_ms must not exceed dataplane.max_retry_delay_ms",
            ));
        }

        // Server validation
        if self.server.address.is_empty() {
            return Err(ControlError::config("server.address must not be empty"));
        }

        // Port validation
        let mut macs = HashSet::new();
        let mut dev_ports = HashSet::new();
        for port in &self.ports {
            if port.dev_port >= MAX_DEV_PORT {
                return Err(ControlError::config(format!(
                    "dev_port {} must be less than {}",
                    port.dev_port, MAX_DEV_PORT
                )));
            }
            if !macs.insert(port.mac) {
                return Err(ControlError::config(format!("port MAC {} is listed twice", port.mac)));
            }
            if !dev_ports.insert(port.dev_port) {
                return Err(ControlError::config(format!("dev_port {} is listed twice", port.dev_port)));
            }
        }

        Ok(())
    }
}

/// Process-wide job parameters, derived from [`ControllerConfig`] at start-up
/// and replaced wholesale on reconfiguration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobConfiguration {
    pub switch_mac: MacAddr,
    pub switch_ipv4: Ipv4Addr,
    pub udp_port: u16,
    pub udp_port_mask: u16,
    pub partition_key: u16,
    pub pool_base: u32,
    pub pool_size: u32,
    pub aggregation_group_id: u16,
    pub all_ports_group_id: u16,
    pub clear_on_rank_zero: bool,
    pub ports: Vec<PortConfig>,
}

impl From<&ControllerConfig> for JobConfiguration {
    fn from(config: &ControllerConfig) -> Self {
        Self {
            switch_mac: config.switch.mac,
            switch_ipv4: config.switch.ipv4,
            udp_port: config.switch.udp_port,
            udp_port_mask: config.switch.udp_port_mask,
            partition_key: config.switch.partition_key,
            pool_base: config.pool.base,
            pool_size: config.pool.size,
            aggregation_group_id: config.multicast.aggregation_group_id,
            all_ports_group_id: config.multicast.all_ports_group_id,
            clear_on_rank_zero: config.job.clear_on_rank_zero,
            ports: config.ports.clone(),
        }
    }
}

impl Default for JobConfiguration {
    fn default() -> Self {
        Self::from(&ControllerConfig::default())
    }
}
