//! Controller configuration loaded from disk.

use super::mock_device::CONTROLLER_MAC;
use pnio_common::config::{ConfigError, ControllerConfig};
use pnio_common::state::ConnectionState;
use pnio_fieldbus::device::DeviceLayout;
use pnio_fieldbus::{ConnectionManager, SimulatedLink};
use std::io::Write;
use std::net::Ipv4Addr;
use std::sync::Arc;
use std::time::Duration;

const PLANT_CONFIG: &str = r#"
station_name = "line-3-controller"
vendor_id = 0x00B0
device_id = 0x0001

[rpc]
bind = "127.0.0.1:0"
response_timeout = "250ms"

[cyclic]
send_clock_factor = 32
reduction_ratio = 4
watchdog_factor = 10
data_hold_factor = 10

[alarm]
max_alarm_data_length = 128
tag_headers = false

[codec]
pad_blocks = true

[[devices]]
station_name = "et200-a"
ip = "192.168.10.21"
mac = "00:1b:1b:12:34:56"

[[devices.modules]]
slot = 0
ident = 0x00000001

[[devices.modules.submodules]]
subslot = 1
ident = 0x00000001

[[devices.modules]]
slot = 1
ident = 0x00000030

[[devices.modules.submodules]]
subslot = 1
ident = 0x00000001
input_length = 8

[[devices]]
station_name = "et200-b"

[[devices.modules]]
slot = 0
ident = 0x00000001

[[devices.modules.submodules]]
subslot = 1
ident = 0x00000001
"#;

fn write_config(content: &str) -> tempfile::NamedTempFile {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    file.write_all(content.as_bytes()).unwrap();
    file
}

#[test]
fn test_plant_config_loads_and_drives_manager() {
    let file = write_config(PLANT_CONFIG);
    let config = ControllerConfig::from_file(file.path()).unwrap();
    config.validate().unwrap();

    assert_eq!(config.station_name, "line-3-controller");
    assert_eq!(config.rpc.response_timeout, Duration::from_millis(250));
    assert_eq!(config.cyclic.cycle_interval(), Duration::from_millis(4));
    assert_eq!(config.cyclic.watchdog_timeout(), Duration::from_millis(40));
    assert!(!config.alarm.tag_headers);
    assert!(config.codec.pad_blocks);

    let a = config.device("et200-a").unwrap();
    assert_eq!(a.ip, Some(Ipv4Addr::new(192, 168, 10, 21)));
    assert_eq!(a.mac.unwrap().to_string(), "00:1b:1b:12:34:56");
    let layout = DeviceLayout::new(&a.modules, &config.cyclic);
    assert_eq!(layout.input.data_object(0, 1, 1).unwrap().frame_offset, 1);

    let link = Arc::new(SimulatedLink::new(CONTROLLER_MAC));
    let manager = ConnectionManager::new(config, link).unwrap();
    assert_eq!(manager.add_configured_devices().unwrap(), 2);

    let a = manager.device("et200-a").unwrap();
    assert!(a.identity.is_resolved());
    assert_eq!(a.state, ConnectionState::Offline);
    assert!(!manager.device("et200-b").unwrap().identity.is_resolved());
}

#[test]
fn test_saved_config_loads_back() {
    let original = ControllerConfig::from_toml(PLANT_CONFIG).unwrap();
    let file = write_config(&original.to_toml().unwrap());

    let loaded = ControllerConfig::from_file(file.path()).unwrap();
    assert_eq!(loaded.devices.len(), 2);
    let slots = |c: &ControllerConfig| -> Vec<(u16, Option<u16>)> {
        c.devices[0]
            .modules
            .iter()
            .flat_map(|m| m.submodules.iter().map(move |s| (m.slot, s.input_length)))
            .collect()
    };
    assert_eq!(slots(&loaded), vec![(0, None), (1, Some(8))]);
    assert_eq!(slots(&loaded), slots(&original));
    assert_eq!(loaded.devices[0].mac, original.devices[0].mac);
    assert_eq!(loaded.cyclic.cycle_interval(), original.cyclic.cycle_interval());
}

#[test]
fn test_layout_without_access_point_is_rejected() {
    let config = ControllerConfig::from_toml(
        r#"
[[devices]]
station_name = "broken"

[[devices.modules]]
slot = 1
ident = 0x30
"#,
    )
    .unwrap();
    assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));
}

#[test]
fn test_missing_file_reports_path() {
    let path = std::path::Path::new("/nonexistent/pnio.toml");
    let err = ControllerConfig::from_file(path).unwrap_err();
    assert!(matches!(err, ConfigError::Io { .. }));
    assert!(err.to_string().contains("/nonexistent/pnio.toml"));
}
