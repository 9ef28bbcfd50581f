//! Full controller flow against mock devices.
//!
//! # Acceptance Criteria
//!
//! - Devices known only by name are found by discovery and connected
//! - Outputs reach the device and inputs reach the controller while RUNNING
//! - Disconnect releases the session, stops cyclic exchange, and returns
//!   the device to OFFLINE
//! - Several devices connect one after another and run side by side

use super::mock_device::{controller_config, MockBehavior, MockDevice, CONTROLLER_MAC};
use pnio_common::config::DeviceConfig;
use pnio_common::mac::MacAddress;
use pnio_common::state::ConnectionState;
use pnio_fieldbus::{ConnectionManager, SimulatedLink};
use std::sync::Arc;
use std::time::{Duration, Instant};

const WAIT: Duration = Duration::from_secs(2);

fn wait_until(mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + WAIT;
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(2));
    }
    false
}

#[test]
fn test_discover_connect_run_disconnect() {
    let link = SimulatedLink::new(CONTROLLER_MAC);
    let device = MockDevice::start_local(&link, "io-1", MockBehavior::default());
    let manager =
        ConnectionManager::new(controller_config(&device, false), Arc::new(link)).unwrap();

    assert_eq!(manager.add_configured_devices().unwrap(), 1);
    assert_eq!(manager.device("io-1").unwrap().state, ConnectionState::Offline);

    let found = manager.discover(None).unwrap();
    assert_eq!(found, vec![device.identity()]);
    assert!(manager.device("io-1").unwrap().identity.is_resolved());

    manager.connect("io-1").unwrap();
    let status = manager.status();
    assert_eq!(status.running, 1);
    assert_eq!(status.connecting, None);

    // Input slot 1 carries 4 bytes, output slot 2 carries 2 bytes
    manager.set_submodule_output("io-1", 0, 2, 1, &[0x12, 0x34]).unwrap();
    assert!(device.wait_for(WAIT, |r| r.output_frames >= 10));
    assert!(wait_until(|| manager.submodule_input("io-1", 0, 1, 1).is_ok_and(|d| d.len() == 4)));
    assert!(manager.supervise().is_empty());

    manager.disconnect("io-1", "end of shift").unwrap();
    let snapshot = manager.device("io-1").unwrap();
    assert_eq!(snapshot.state, ConnectionState::Offline);
    assert!(snapshot.session_key.is_none());
    assert!(manager.cyclic_stats().is_empty());
    assert!(device.wait_for(WAIT, |r| r.released.is_some()));

    manager.remove_device("io-1").unwrap();
    assert_eq!(manager.status().devices, 0);
}

#[test]
fn test_unknown_device_stays_out_of_running() {
    let link = SimulatedLink::new(CONTROLLER_MAC);
    let device = MockDevice::start_local(
        &link,
        "io-1",
        MockBehavior {
            answer_identify: false,
            ..MockBehavior::default()
        },
    );
    let manager =
        ConnectionManager::new(controller_config(&device, false), Arc::new(link)).unwrap();

    assert!(manager.connect("io-1").is_err());
    let snapshot = manager.device("io-1").unwrap();
    assert_eq!(snapshot.state, ConnectionState::Error);
    assert!(snapshot.last_error.is_some());
    assert_eq!(device.record().connect_requests, 0);

    // ERROR devices can be deleted
    manager.remove_device("io-1").unwrap();
}

// A second loopback address lets both devices share the configured RPC port
#[cfg(target_os = "linux")]
#[test]
fn test_two_devices_connect_sequentially() {
    use std::net::Ipv4Addr;

    let link = SimulatedLink::new(CONTROLLER_MAC);
    let first = MockDevice::start_local(&link, "io-1", MockBehavior::default());
    let second = MockDevice::start(
        &link,
        "io-2",
        MacAddress::new([0x02, 0x00, 0x00, 0x00, 0x00, 0x11]),
        Ipv4Addr::new(127, 0, 0, 2),
        first.rpc_port(),
        MockBehavior::default(),
    );

    let mut config = controller_config(&first, false);
    let template = config.devices[0].clone();
    config.devices.push(DeviceConfig {
        station_name: "io-2".into(),
        ..template
    });
    let manager = ConnectionManager::new(config, Arc::new(link)).unwrap();
    manager.add_configured_devices().unwrap();

    manager.connect("io-1").unwrap();
    manager.connect("io-2").unwrap();

    let status = manager.status();
    assert_eq!(status.running, 2);
    assert_eq!(manager.device("io-1").unwrap().session_key, Some(1));
    assert_eq!(manager.device("io-2").unwrap().session_key, Some(2));
    assert_eq!(manager.device("io-2").unwrap().identity, second.identity());

    assert!(first.wait_for(WAIT, |r| r.output_frames > 0));
    assert!(second.wait_for(WAIT, |r| r.output_frames > 0));
    assert!(wait_until(|| manager.cyclic_stats().iter().all(|s| s.valid)));

    manager.shutdown();
    assert_eq!(manager.status().running, 0);
    assert!(first.wait_for(WAIT, |r| r.released.is_some()));
    assert!(second.wait_for(WAIT, |r| r.released.is_some()));
}
