//! Configuration structures for the IO controller.
//!
//! Supports TOML deserialization with sensible defaults for
//! development and explicit values for production deployment.
//! Wire constants that differ between field devices (data-hold factor,
//! alarm payload size, tag headers, block padding) live here rather
//! than in the codec.

use crate::mac::MacAddress;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::net::{Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use std::time::Duration;
use tracing::debug;

/// Well-known UDP port for connection and control requests.
pub const PNIO_RPC_PORT: u16 = 34964;

/// Base time unit of the send clock (31.25 µs).
pub const SEND_CLOCK_BASE: Duration = Duration::from_nanos(31_250);

/// Top-level controller configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ControllerConfig {
    /// Network interface name (e.g., "enp3s0", "eth0").
    /// Must be explicitly configured for hardware operation.
    pub interface: Option<String>,

    /// Controller MAC address; read from the interface when absent.
    pub controller_mac: Option<MacAddress>,

    /// Station name the controller announces in the session block.
    pub station_name: String,

    /// Vendor id used in the controller object UUID.
    pub vendor_id: u16,

    /// Device id used in the controller object UUID.
    pub device_id: u16,

    /// Connection/control request transport.
    pub rpc: RpcConfig,

    /// Identify request settings.
    pub discovery: DiscoveryConfig,

    /// Parameter-end / application-ready timeouts.
    pub handshake: HandshakeConfig,

    /// Cyclic exchange timing.
    pub cyclic: CyclicConfig,

    /// Alarm relationship parameters.
    pub alarm: AlarmConfig,

    /// Block codec options.
    pub codec: CodecConfig,

    /// Configured field devices.
    pub devices: Vec<DeviceConfig>,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            interface: None,
            controller_mac: None,
            station_name: String::from("pnio-controller"),
            vendor_id: 0x0000,
            device_id: 0x0000,
            rpc: RpcConfig::default(),
            discovery: DiscoveryConfig::default(),
            handshake: HandshakeConfig::default(),
            cyclic: CyclicConfig::default(),
            alarm: AlarmConfig::default(),
            codec: CodecConfig::default(),
            devices: Vec::new(),
        }
    }
}

/// UDP transport settings for connect, control, and release requests.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RpcConfig {
    /// Local bind address; the device sends application-ready here.
    pub bind: SocketAddr,

    /// Remote port on the device.
    pub device_port: u16,

    /// Deadline for a response to any request.
    #[serde(with = "humantime_serde")]
    pub response_timeout: Duration,

    /// Advertised maximum argument size in the NDR header.
    pub args_maximum: u32,
}

impl Default for RpcConfig {
    fn default() -> Self {
        Self {
            bind: SocketAddr::from((Ipv4Addr::UNSPECIFIED, PNIO_RPC_PORT)),
            device_port: PNIO_RPC_PORT,
            response_timeout: Duration::from_secs(5),
            args_maximum: 16_384,
        }
    }
}

/// Identify request settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DiscoveryConfig {
    /// How long to collect identify responses.
    #[serde(with = "humantime_serde")]
    pub timeout: Duration,

    /// Response delay factor carried in the identify request.
    pub response_delay: u16,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(2),
            response_delay: 1,
        }
    }
}

/// Handshake timeouts.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HandshakeConfig {
    /// Deadline for the parameter-end response.
    #[serde(with = "humantime_serde")]
    pub prm_end_timeout: Duration,

    /// Deadline for the device-initiated application-ready request.
    #[serde(with = "humantime_serde")]
    pub app_ready_timeout: Duration,
}

impl Default for HandshakeConfig {
    fn default() -> Self {
        Self {
            prm_end_timeout: Duration::from_secs(5),
            app_ready_timeout: Duration::from_secs(10),
        }
    }
}

/// Real-time class carried in the IOCR properties.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum RtClass {
    /// Legacy RT class 1.
    Class1,
    /// RT class 2 (unsynchronized, the usual choice).
    #[default]
    Class2,
    /// RT class 3 (isochronous).
    Class3,
}

impl RtClass {
    /// Value of the RTClass field in IOCRProperties.
    #[must_use]
    pub fn iocr_properties(self) -> u32 {
        match self {
            Self::Class1 => 0x0000_0001,
            Self::Class2 => 0x0000_0002,
            Self::Class3 => 0x0000_0003,
        }
    }
}

/// Cyclic exchange timing.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CyclicConfig {
    /// Send clock factor (multiples of 31.25 µs).
    pub send_clock_factor: u16,

    /// Reduction ratio applied to the send clock.
    pub reduction_ratio: u16,

    /// Watchdog factor (cycles without input before failure).
    pub watchdog_factor: u16,

    /// Data-hold factor (cycles the device holds outputs).
    pub data_hold_factor: u16,

    /// Explicit cycle interval; derived from the factors when absent.
    #[serde(with = "humantime_serde_opt")]
    pub cycle_time: Option<Duration>,

    /// Bounded wait when joining the output activity.
    #[serde(with = "humantime_serde")]
    pub stop_timeout: Duration,

    /// Pause after a failed frame send.
    #[serde(with = "humantime_serde")]
    pub error_backoff: Duration,

    /// Real-time class.
    pub rt_class: RtClass,

    /// Frame id for device → controller frames.
    pub input_frame_id: u16,

    /// Frame id for controller → device frames.
    pub output_frame_id: u16,
}

impl Default for CyclicConfig {
    fn default() -> Self {
        Self {
            send_clock_factor: 32,
            reduction_ratio: 32,
            watchdog_factor: 3,
            data_hold_factor: 3,
            cycle_time: None,
            stop_timeout: Duration::from_millis(500),
            error_backoff: Duration::from_millis(10),
            rt_class: RtClass::Class2,
            input_frame_id: 0x8001,
            output_frame_id: 0x8000,
        }
    }
}

impl CyclicConfig {
    /// Effective cycle interval.
    #[must_use]
    pub fn cycle_interval(&self) -> Duration {
        self.cycle_time.unwrap_or_else(|| {
            SEND_CLOCK_BASE * u32::from(self.send_clock_factor) * u32::from(self.reduction_ratio)
        })
    }

    /// Time without valid input after which the device counts as lost.
    #[must_use]
    pub fn watchdog_timeout(&self) -> Duration {
        self.cycle_interval() * u32::from(self.watchdog_factor.max(1))
    }

    /// Grace period after start-up before the watchdog applies.
    #[must_use]
    pub fn data_hold_timeout(&self) -> Duration {
        self.cycle_interval() * u32::from(self.data_hold_factor.max(1))
    }
}

/// Alarm relationship parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AlarmConfig {
    /// RTA timeout factor (units of 100 ms).
    pub timeout_factor: u16,

    /// RTA retry count.
    pub retries: u16,

    /// Controller-side alarm endpoint reference.
    pub local_alarm_reference: u16,

    /// Maximum alarm payload length.
    pub max_alarm_data_length: u16,

    /// Emit the VLAN tag header fields in the alarm block.
    pub tag_headers: bool,
}

impl Default for AlarmConfig {
    fn default() -> Self {
        Self {
            timeout_factor: 1,
            retries: 3,
            local_alarm_reference: 0x0001,
            max_alarm_data_length: 200,
            tag_headers: true,
        }
    }
}

/// Block codec options.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct CodecConfig {
    /// Align each request block to a 4-byte boundary on the wire.
    pub pad_blocks: bool,
}

/// One configured field device.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct DeviceConfig {
    /// Station name (DCP NameOfStation).
    pub station_name: String,

    /// Static IPv4 address; discovered when absent.
    pub ip: Option<Ipv4Addr>,

    /// Static MAC address; discovered when absent.
    pub mac: Option<MacAddress>,

    /// Vendor id; discovered when absent.
    pub vendor_id: Option<u16>,

    /// Device id; discovered when absent.
    pub device_id: Option<u16>,

    /// Instance number used in the device object UUID.
    pub instance: u16,

    /// Expected modules; must contain the DAP at slot 0.
    pub modules: Vec<ModuleConfig>,
}

/// One expected module (a plugged slot).
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct ModuleConfig {
    /// Application process identifier.
    pub api: u32,
    /// Slot number.
    pub slot: u16,
    /// Module ident number.
    pub ident: u32,
    /// Module properties.
    pub properties: u16,
    /// Submodules in this slot.
    pub submodules: Vec<SubmoduleConfig>,
}

/// One expected submodule.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SubmoduleConfig {
    /// Subslot number.
    pub subslot: u16,
    /// Submodule ident number.
    pub ident: u32,
    /// Input data length in bytes, if the submodule provides inputs.
    pub input_length: Option<u16>,
    /// Output data length in bytes, if the submodule consumes outputs.
    pub output_length: Option<u16>,
    /// Provider status length.
    pub iops_length: u8,
    /// Consumer status length.
    pub iocs_length: u8,
}

impl Default for SubmoduleConfig {
    fn default() -> Self {
        Self {
            subslot: 1,
            ident: 0,
            input_length: None,
            output_length: None,
            iops_length: 1,
            iocs_length: 1,
        }
    }
}

impl ControllerConfig {
    /// Load configuration from a TOML file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn from_file(path: &std::path::Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::Io {
            path: path.to_path_buf(),
            source: e,
        })?;
        debug!(?path, bytes = content.len(), "Read controller configuration");
        Self::from_toml(&content)
    }

    /// Parse configuration from a TOML string.
    ///
    /// # Errors
    ///
    /// Returns an error if the TOML is invalid.
    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        toml::from_str(content).map_err(ConfigError::Parse)
    }

    /// Serialize configuration to TOML string.
    ///
    /// # Errors
    ///
    /// Returns an error if serialization fails.
    pub fn to_toml(&self) -> Result<String, ConfigError> {
        toml::to_string_pretty(self).map_err(ConfigError::Serialize)
    }

    /// Look up a configured device by station name.
    #[must_use]
    pub fn device(&self, station_name: &str) -> Option<&DeviceConfig> {
        self.devices.iter().find(|d| d.station_name == station_name)
    }

    /// Check semantic constraints that serde cannot express.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::Invalid` describing the first violation.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let cyclic = &self.cyclic;
        if cyclic.send_clock_factor == 0 || cyclic.reduction_ratio == 0 {
            return Err(ConfigError::Invalid(
                "send_clock_factor and reduction_ratio must be non-zero".into(),
            ));
        }
        if cyclic.watchdog_factor == 0 || cyclic.data_hold_factor == 0 {
            return Err(ConfigError::Invalid(
                "watchdog_factor and data_hold_factor must be non-zero".into(),
            ));
        }
        if cyclic.input_frame_id == cyclic.output_frame_id {
            return Err(ConfigError::Invalid(
                "input and output frame ids must differ".into(),
            ));
        }
        if self.station_name.is_empty() {
            return Err(ConfigError::Invalid("controller station_name is empty".into()));
        }

        let mut names = HashSet::new();
        for device in &self.devices {
            if device.station_name.is_empty() {
                return Err(ConfigError::Invalid("device with empty station_name".into()));
            }
            if !names.insert(device.station_name.as_str()) {
                return Err(ConfigError::Invalid(format!(
                    "duplicate device station_name '{}'",
                    device.station_name
                )));
            }
            device.validate()?;
        }
        Ok(())
    }
}

impl DeviceConfig {
    /// Check the module layout of this device.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::Invalid` if the DAP is missing or a slot repeats.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let has_dap = self.modules.iter().any(|m| {
            m.api == 0 && m.slot == 0 && m.submodules.iter().any(|s| s.subslot == 1)
        });
        if !has_dap {
            return Err(ConfigError::Invalid(format!(
                "device '{}' has no device access point (api 0, slot 0, subslot 1)",
                self.station_name
            )));
        }

        let mut slots = HashSet::new();
        for module in &self.modules {
            if !slots.insert((module.api, module.slot)) {
                return Err(ConfigError::Invalid(format!(
                    "device '{}' lists api {} slot {} twice",
                    self.station_name, module.api, module.slot
                )));
            }
        }
        Ok(())
    }
}

/// Configuration-related errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// File I/O error.
    #[error("failed to read config file {path}: {source}")]
    Io {
        /// Path to the configuration file.
        path: PathBuf,
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// TOML parsing error.
    #[error("failed to parse TOML: {0}")]
    Parse(#[from] toml::de::Error),

    /// TOML serialization error.
    #[error("failed to serialize TOML: {0}")]
    Serialize(#[from] toml::ser::Error),

    /// Semantically invalid configuration.
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Serde helper module for `Duration` using humantime format.
mod humantime_serde {
    use serde::{self, Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let s = humantime::format_duration(*duration).to_string();
        serializer.serialize_str(&s)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        humantime::parse_duration(&s).map_err(serde::de::Error::custom)
    }
}

/// Serde helper module for `Option<Duration>` using humantime format.
mod humantime_serde_opt {
    use serde::{self, Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Option<Duration>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        match duration {
            Some(d) => serializer.serialize_str(&humantime::format_duration(*d).to_string()),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<Duration>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = Option::<String>::deserialize(deserializer)?;
        s.map(|s| humantime::parse_duration(&s).map_err(serde::de::Error::custom))
            .transpose()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dap_module() -> ModuleConfig {
        ModuleConfig {
            api: 0,
            slot: 0,
            ident: 0x0000_0001,
            properties: 0,
            submodules: vec![SubmoduleConfig {
                subslot: 1,
                ident: 0x0000_0001,
                ..SubmoduleConfig::default()
            }],
        }
    }

    #[test]
    fn test_default_config() {
        let config = ControllerConfig::default();
        assert_eq!(config.rpc.bind.port(), PNIO_RPC_PORT);
        assert_eq!(config.cyclic.input_frame_id, 0x8001);
        assert_eq!(config.cyclic.output_frame_id, 0x8000);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_cycle_interval_from_factors() {
        let cyclic = CyclicConfig::default();
        // 32 * 32 * 31.25us = 32ms
        assert_eq!(cyclic.cycle_interval(), Duration::from_millis(32));
        assert_eq!(cyclic.watchdog_timeout(), Duration::from_millis(96));

        let explicit = CyclicConfig {
            cycle_time: Some(Duration::from_millis(4)),
            ..CyclicConfig::default()
        };
        assert_eq!(explicit.cycle_interval(), Duration::from_millis(4));
    }

    #[test]
    fn test_parse_toml() {
        let toml = r#"
            interface = "enp3s0"
            station_name = "plc-main"

            [cyclic]
            send_clock_factor = 32
            reduction_ratio = 4
            data_hold_factor = 10
            cycle_time = "4ms"

            [alarm]
            max_alarm_data_length = 128
            tag_headers = false

            [[devices]]
            station_name = "et200sp-1"
            ip = "192.168.0.10"
            mac = "00:1b:1b:aa:bb:cc"

            [[devices.modules]]
            slot = 0
            ident = 1
            [[devices.modules.submodules]]
            subslot = 1
            ident = 1

            [[devices.modules]]
            slot = 1
            ident = 0x20
            [[devices.modules.submodules]]
            subslot = 1
            ident = 0x21
            input_length = 2
        "#;

        let config = ControllerConfig::from_toml(toml).unwrap();
        assert_eq!(config.interface.as_deref(), Some("enp3s0"));
        assert_eq!(config.cyclic.data_hold_factor, 10);
        assert_eq!(config.cyclic.cycle_time, Some(Duration::from_millis(4)));
        assert_eq!(config.alarm.max_alarm_data_length, 128);
        assert!(!config.alarm.tag_headers);

        let device = config.device("et200sp-1").unwrap();
        assert_eq!(device.ip, Some(Ipv4Addr::new(192, 168, 0, 10)));
        assert_eq!(device.modules.len(), 2);
        assert_eq!(device.modules[1].submodules[0].input_length, Some(2));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_requires_dap() {
        let mut config = ControllerConfig::default();
        config.devices.push(DeviceConfig {
            station_name: "io-1".into(),
            modules: vec![ModuleConfig {
                slot: 1,
                ..ModuleConfig::default()
            }],
            ..DeviceConfig::default()
        });
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));

        config.devices[0].modules.push(dap_module());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_duplicates() {
        let device = DeviceConfig {
            station_name: "io-1".into(),
            modules: vec![dap_module()],
            ..DeviceConfig::default()
        };
        let mut config = ControllerConfig::default();
        config.devices = vec![device.clone(), device];
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("duplicate"));
    }

    #[test]
    fn test_roundtrip_toml() {
        let mut config = ControllerConfig::default();
        config.cyclic.cycle_time = Some(Duration::from_millis(8));
        let toml = config.to_toml().unwrap();
        let parsed = ControllerConfig::from_toml(&toml).unwrap();
        assert_eq!(parsed.cyclic.cycle_time, Some(Duration::from_millis(8)));
        assert_eq!(parsed.rpc.response_timeout, config.rpc.response_timeout);
    }

    #[test]
    fn test_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("controller.toml");
        std::fs::write(&path, "station_name = \"line-3\"\n").unwrap();

        let config = ControllerConfig::from_file(&path).unwrap();
        assert_eq!(config.station_name, "line-3");

        let missing = ControllerConfig::from_file(&dir.path().join("missing.toml"));
        assert!(matches!(missing, Err(ConfigError::Io { .. })));
    }
}
