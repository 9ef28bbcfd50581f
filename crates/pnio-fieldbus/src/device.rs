//! Device identity, session, and communication-relationship model.
//!
//! A [`DeviceLayout`] is derived once from the configured module list and
//! fixes the byte offsets of every submodule's data and status octets in
//! both cyclic frames. The same layout drives the connect request (IOCR and
//! expected-submodule blocks) and the cyclic engine's buffers.

use pnio_common::config::{AlarmConfig, CyclicConfig, DeviceConfig, ModuleConfig, SubmoduleConfig};
use pnio_common::error::{PnioError, PnioResult};
use pnio_common::mac::MacAddress;
use serde::{Deserialize, Serialize};
use std::net::Ipv4Addr;
use uuid::Uuid;

/// Minimum C_SDU length of a cyclic frame.
pub const MIN_IO_DATA_LENGTH: u16 = 40;

/// Good provider/consumer status octet.
pub const IOXS_GOOD: u8 = 0x80;

/// Session (AR) type for a single IO controller relationship.
pub const AR_TYPE_IOCAR_SINGLE: u16 = 0x0001;

/// Default activity timeout factor (units of 100 ms).
pub const DEFAULT_ACTIVITY_TIMEOUT: u16 = 100;

/// What a device answers to an identify request.
///
/// Immutable once created; rediscovery replaces the value as a whole.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceIdentity {
    /// NameOfStation.
    pub station_name: String,
    /// IPv4 address (unspecified if the device did not report one).
    pub ip: Ipv4Addr,
    /// Hardware address, taken from the frame source.
    pub mac: MacAddress,
    /// Vendor id.
    pub vendor_id: u16,
    /// Device id.
    pub device_id: u16,
}

impl DeviceIdentity {
    /// Identity known only by name, to be completed by discovery.
    #[must_use]
    pub fn unresolved(station_name: impl Into<String>) -> Self {
        Self {
            station_name: station_name.into(),
            ip: Ipv4Addr::UNSPECIFIED,
            mac: MacAddress::ZERO,
            vendor_id: 0,
            device_id: 0,
        }
    }

    /// Identity from static configuration, if it names both addresses.
    #[must_use]
    pub fn from_config(device: &DeviceConfig) -> Self {
        Self {
            station_name: device.station_name.clone(),
            ip: device.ip.unwrap_or(Ipv4Addr::UNSPECIFIED),
            mac: device.mac.unwrap_or(MacAddress::ZERO),
            vendor_id: device.vendor_id.unwrap_or(0),
            device_id: device.device_id.unwrap_or(0),
        }
    }

    /// Whether IP and MAC are known.
    #[must_use]
    pub fn is_resolved(&self) -> bool {
        !self.ip.is_unspecified() && self.mac != MacAddress::ZERO
    }
}

/// Session state bits (ARProperties bits 0-2).
pub const AR_STATE_ACTIVE: u32 = 0x0000_0001;
const AR_STATE_MASK: u32 = 0x0000_0007;
const AR_SUPERVISOR_TAKEOVER: u32 = 1 << 3;
const AR_PARAMETERIZATION_SERVER: u32 = 1 << 4;
const AR_DEVICE_ACCESS: u32 = 1 << 8;
const AR_STARTUP_MODE_ADVANCED: u32 = 1 << 30;
const AR_PULL_MODULE_ALARM: u32 = 1 << 31;

/// Session property flags.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArProperties {
    /// Session state (1 = active).
    pub state: u8,
    /// Another supervisor may take over.
    pub supervisor_takeover_allowed: bool,
    /// The controller acts as parameterization server.
    pub parameterization_server_is_controller: bool,
    /// Device-access session (not valid for a controller session).
    pub device_access: bool,
    /// Advanced start-up mode.
    pub startup_mode_advanced: bool,
    /// Pull-module alarms allowed.
    pub pull_module_alarm_allowed: bool,
}

impl Default for ArProperties {
    fn default() -> Self {
        Self {
            state: 1,
            supervisor_takeover_allowed: false,
            parameterization_server_is_controller: true,
            device_access: false,
            startup_mode_advanced: false,
            pull_module_alarm_allowed: false,
        }
    }
}

impl ArProperties {
    /// Encode to the 32-bit wire value.
    #[must_use]
    pub fn to_bits(&self) -> u32 {
        let mut bits = u32::from(self.state) & AR_STATE_MASK;
        if self.supervisor_takeover_allowed {
            bits |= AR_SUPERVISOR_TAKEOVER;
        }
        if self.parameterization_server_is_controller {
            bits |= AR_PARAMETERIZATION_SERVER;
        }
        if self.device_access {
            bits |= AR_DEVICE_ACCESS;
        }
        if self.startup_mode_advanced {
            bits |= AR_STARTUP_MODE_ADVANCED;
        }
        if self.pull_module_alarm_allowed {
            bits |= AR_PULL_MODULE_ALARM;
        }
        bits
    }

    /// Decode from the 32-bit wire value.
    #[must_use]
    pub fn from_bits(bits: u32) -> Self {
        Self {
            state: (bits & AR_STATE_MASK) as u8,
            supervisor_takeover_allowed: bits & AR_SUPERVISOR_TAKEOVER != 0,
            parameterization_server_is_controller: bits & AR_PARAMETERIZATION_SERVER != 0,
            device_access: bits & AR_DEVICE_ACCESS != 0,
            startup_mode_advanced: bits & AR_STARTUP_MODE_ADVANCED != 0,
            pull_module_alarm_allowed: bits & AR_PULL_MODULE_ALARM != 0,
        }
    }
}

/// Logical relationship between the controller and one device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Session {
    /// Session key, unique per controller lifetime.
    pub session_key: u16,
    /// Session (AR) UUID.
    pub ar_uuid: Uuid,
    /// Session type.
    pub ar_type: u16,
    /// Controller hardware address.
    pub controller_mac: MacAddress,
    /// Device hardware address.
    pub device_mac: MacAddress,
    /// Controller object UUID.
    pub initiator_object: Uuid,
    /// Property flags.
    pub properties: ArProperties,
    /// Controller station name carried in the session block.
    pub station_name: String,
    /// Activity timeout factor.
    pub activity_timeout_factor: u16,
    /// UDP real-time port.
    pub udp_rt_port: u16,
}

impl Session {
    /// Create a fresh session with a random AR UUID.
    ///
    /// # Errors
    ///
    /// Returns `PnioError::Config` if `properties` requests device access,
    /// which a controller session must never carry.
    pub fn new(
        session_key: u16,
        controller_mac: MacAddress,
        device_mac: MacAddress,
        initiator_object: Uuid,
        station_name: &str,
        properties: ArProperties,
    ) -> PnioResult<Self> {
        if properties.device_access {
            return Err(PnioError::Config(
                "device-access sessions are not supported by a controller".into(),
            ));
        }
        Ok(Self {
            session_key,
            ar_uuid: Uuid::new_v4(),
            ar_type: AR_TYPE_IOCAR_SINGLE,
            controller_mac,
            device_mac,
            initiator_object,
            properties,
            station_name: station_name.to_string(),
            activity_timeout_factor: DEFAULT_ACTIVITY_TIMEOUT,
            udp_rt_port: crate::ethernet::ETHERTYPE_PROFINET,
        })
    }
}

/// IOCR direction, as carried in the IOCRType field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum IocrDirection {
    /// Device to controller.
    Input,
    /// Controller to device.
    Output,
}

impl IocrDirection {
    /// IOCRType wire value.
    #[must_use]
    pub fn wire_type(self) -> u16 {
        match self {
            Self::Input => 0x0001,
            Self::Output => 0x0002,
        }
    }

    /// Parse the IOCRType wire value.
    #[must_use]
    pub fn from_wire(value: u16) -> Option<Self> {
        match value {
            0x0001 => Some(Self::Input),
            0x0002 => Some(Self::Output),
            _ => None,
        }
    }
}

/// Where one submodule's octets sit inside a cyclic frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IoDataEntry {
    /// Application process identifier.
    pub api: u32,
    /// Slot number.
    pub slot: u16,
    /// Subslot number.
    pub subslot: u16,
    /// Byte offset of the entry within the frame data.
    pub frame_offset: u16,
    /// Payload length preceding the status octets (0 for IOCS entries).
    pub data_length: u16,
    /// Status octets following the payload.
    pub status_length: u8,
}

impl IoDataEntry {
    /// Range of the payload bytes.
    #[must_use]
    pub fn data_range(&self) -> std::ops::Range<usize> {
        let start = usize::from(self.frame_offset);
        start..start + usize::from(self.data_length)
    }

    /// Range of the status bytes.
    #[must_use]
    pub fn status_range(&self) -> std::ops::Range<usize> {
        let start = usize::from(self.frame_offset) + usize::from(self.data_length);
        start..start + usize::from(self.status_length)
    }
}

/// Parameters of one cyclic communication relationship.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IocrSpec {
    /// Direction.
    pub direction: IocrDirection,
    /// IOCR reference.
    pub reference: u16,
    /// Frame id.
    pub frame_id: u16,
    /// IOCRProperties (RT class).
    pub properties: u32,
    /// Send clock factor.
    pub send_clock_factor: u16,
    /// Reduction ratio.
    pub reduction_ratio: u16,
    /// Phase.
    pub phase: u16,
    /// Watchdog factor.
    pub watchdog_factor: u16,
    /// Data-hold factor.
    pub data_hold_factor: u16,
    /// Frame data length.
    pub data_length: u16,
    /// Provider entries (payload plus IOPS).
    pub data_objects: Vec<IoDataEntry>,
    /// Consumer status entries.
    pub iocs: Vec<IoDataEntry>,
}

impl IocrSpec {
    /// Find the provider entry for a submodule.
    #[must_use]
    pub fn data_object(&self, api: u32, slot: u16, subslot: u16) -> Option<&IoDataEntry> {
        self.data_objects
            .iter()
            .find(|e| e.api == api && e.slot == slot && e.subslot == subslot)
    }

    /// Buffer of `data_length` bytes with every status octet set to good.
    #[must_use]
    pub fn initial_buffer(&self) -> Vec<u8> {
        let mut buf = vec![0u8; usize::from(self.data_length)];
        for entry in self.data_objects.iter().chain(&self.iocs) {
            for byte in &mut buf[entry.status_range()] {
                *byte = IOXS_GOOD;
            }
        }
        buf
    }
}

/// Alarm relationship parameters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AlarmCrSpec {
    /// RTA timeout factor.
    pub timeout_factor: u16,
    /// RTA retries.
    pub retries: u16,
    /// Controller alarm endpoint reference.
    pub local_alarm_reference: u16,
    /// Maximum alarm payload.
    pub max_alarm_data_length: u16,
    /// Emit the tag header fields.
    pub tag_headers: bool,
}

impl From<&AlarmConfig> for AlarmCrSpec {
    fn from(config: &AlarmConfig) -> Self {
        Self {
            timeout_factor: config.timeout_factor,
            retries: config.retries,
            local_alarm_reference: config.local_alarm_reference,
            max_alarm_data_length: config.max_alarm_data_length,
            tag_headers: config.tag_headers,
        }
    }
}

/// Data direction of a submodule.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SubmoduleKind {
    /// No cyclic data (DAP, interface, port).
    NoIo,
    /// Inputs only.
    Input,
    /// Outputs only.
    Output,
    /// Inputs and outputs.
    InputOutput,
}

impl SubmoduleKind {
    /// Submodule properties wire value.
    #[must_use]
    pub fn properties(self) -> u16 {
        match self {
            Self::NoIo => 0x0000,
            Self::Input => 0x0001,
            Self::Output => 0x0002,
            Self::InputOutput => 0x0003,
        }
    }

    /// Whether the submodule provides input data (or a zero-length placeholder).
    #[must_use]
    pub fn in_input_frame(self) -> bool {
        matches!(self, Self::NoIo | Self::Input | Self::InputOutput)
    }

    /// Whether the submodule consumes output data.
    #[must_use]
    pub fn has_output(self) -> bool {
        matches!(self, Self::Output | Self::InputOutput)
    }
}

/// Length and status sizes of one data direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DataDescription {
    /// Payload length.
    pub length: u16,
    /// Provider status length.
    pub iops_length: u8,
    /// Consumer status length.
    pub iocs_length: u8,
}

/// An expected submodule.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExpectedSubmodule {
    /// Subslot number.
    pub subslot: u16,
    /// Submodule ident number.
    pub ident: u32,
    /// Input description.
    pub input: Option<DataDescription>,
    /// Output description.
    pub output: Option<DataDescription>,
}

impl ExpectedSubmodule {
    /// Data direction.
    #[must_use]
    pub fn kind(&self) -> SubmoduleKind {
        match (self.input.is_some(), self.output.is_some()) {
            (false, false) => SubmoduleKind::NoIo,
            (true, false) => SubmoduleKind::Input,
            (false, true) => SubmoduleKind::Output,
            (true, true) => SubmoduleKind::InputOutput,
        }
    }

    fn input_length(&self) -> u16 {
        self.input.map_or(0, |d| d.length)
    }

    fn output_length(&self) -> u16 {
        self.output.map_or(0, |d| d.length)
    }

    fn iops_length(&self) -> u8 {
        self.input.or(self.output).map_or(1, |d| d.iops_length)
    }

    fn iocs_length(&self) -> u8 {
        self.input.or(self.output).map_or(1, |d| d.iocs_length)
    }
}

impl From<&SubmoduleConfig> for ExpectedSubmodule {
    fn from(config: &SubmoduleConfig) -> Self {
        let describe = |length: Option<u16>| {
            length.map(|length| DataDescription {
                length,
                iops_length: config.iops_length,
                iocs_length: config.iocs_length,
            })
        };
        Self {
            subslot: config.subslot,
            ident: config.ident,
            input: describe(config.input_length),
            output: describe(config.output_length),
        }
    }
}

/// An expected module (one plugged slot).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExpectedModule {
    /// Application process identifier.
    pub api: u32,
    /// Slot number.
    pub slot: u16,
    /// Module ident number.
    pub ident: u32,
    /// Module properties.
    pub properties: u16,
    /// Submodules, sorted by subslot.
    pub submodules: Vec<ExpectedSubmodule>,
}

impl From<&ModuleConfig> for ExpectedModule {
    fn from(config: &ModuleConfig) -> Self {
        let mut submodules: Vec<ExpectedSubmodule> =
            config.submodules.iter().map(ExpectedSubmodule::from).collect();
        submodules.sort_by_key(|s| s.subslot);
        Self {
            api: config.api,
            slot: config.slot,
            ident: config.ident,
            properties: config.properties,
            submodules,
        }
    }
}

/// Sort modules by (API, slot) so the DAP at slot 0 always leads.
pub fn sort_modules(modules: &mut [ExpectedModule]) {
    modules.sort_by_key(|m| (m.api, m.slot));
}

/// Frame layout and connect parameters for one device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceLayout {
    /// Expected modules, DAP first.
    pub modules: Vec<ExpectedModule>,
    /// Device → controller relationship.
    pub input: IocrSpec,
    /// Controller → device relationship.
    pub output: IocrSpec,
}

impl DeviceLayout {
    /// Derive the layout from a module list.
    #[must_use]
    pub fn new(modules: &[ModuleConfig], cyclic: &CyclicConfig) -> Self {
        let mut modules: Vec<ExpectedModule> = modules.iter().map(ExpectedModule::from).collect();
        sort_modules(&mut modules);

        let input = build_iocr(IocrDirection::Input, 1, cyclic.input_frame_id, &modules, cyclic);
        let output = build_iocr(IocrDirection::Output, 2, cyclic.output_frame_id, &modules, cyclic);

        Self {
            modules,
            input,
            output,
        }
    }

    /// Layout of a device that only exposes its access point.
    #[must_use]
    pub fn access_point_only(cyclic: &CyclicConfig) -> Self {
        let dap = ModuleConfig {
            api: 0,
            slot: 0,
            ident: 0x0000_0001,
            properties: 0,
            submodules: vec![SubmoduleConfig {
                subslot: 1,
                ident: 0x0000_0001,
                ..SubmoduleConfig::default()
            }],
        };
        Self::new(&[dap], cyclic)
    }

    /// Find an expected submodule.
    #[must_use]
    pub fn submodule(&self, api: u32, slot: u16, subslot: u16) -> Option<&ExpectedSubmodule> {
        self.modules
            .iter()
            .find(|m| m.api == api && m.slot == slot)?
            .submodules
            .iter()
            .find(|s| s.subslot == subslot)
    }
}

fn build_iocr(
    direction: IocrDirection,
    reference: u16,
    frame_id: u16,
    modules: &[ExpectedModule],
    cyclic: &CyclicConfig,
) -> IocrSpec {
    let mut offset: u16 = 0;
    let mut data_objects = Vec::new();
    let mut iocs = Vec::new();

    let provides = |s: &ExpectedSubmodule| match direction {
        IocrDirection::Input => s.kind().in_input_frame(),
        IocrDirection::Output => s.kind().has_output(),
    };

    for module in modules {
        for sub in &module.submodules {
            if !provides(sub) {
                continue;
            }
            let data_length = match direction {
                IocrDirection::Input => sub.input_length(),
                IocrDirection::Output => sub.output_length(),
            };
            let status_length = sub.iops_length();
            data_objects.push(IoDataEntry {
                api: module.api,
                slot: module.slot,
                subslot: sub.subslot,
                frame_offset: offset,
                data_length,
                status_length,
            });
            offset = offset.saturating_add(data_length + u16::from(status_length));
        }
    }

    // Consumer status for everything the other direction provides
    for module in modules {
        for sub in &module.submodules {
            let consumes = match direction {
                IocrDirection::Input => sub.kind().has_output(),
                IocrDirection::Output => sub.kind().in_input_frame(),
            };
            if !consumes {
                continue;
            }
            let status_length = sub.iocs_length();
            iocs.push(IoDataEntry {
                api: module.api,
                slot: module.slot,
                subslot: sub.subslot,
                frame_offset: offset,
                data_length: 0,
                status_length,
            });
            offset = offset.saturating_add(u16::from(status_length));
        }
    }

    IocrSpec {
        direction,
        reference,
        frame_id,
        properties: cyclic.rt_class.iocr_properties(),
        send_clock_factor: cyclic.send_clock_factor,
        reduction_ratio: cyclic.reduction_ratio,
        phase: 1,
        watchdog_factor: cyclic.watchdog_factor,
        data_hold_factor: cyclic.data_hold_factor,
        data_length: offset.max(MIN_IO_DATA_LENGTH),
        data_objects,
        iocs,
    }
}
