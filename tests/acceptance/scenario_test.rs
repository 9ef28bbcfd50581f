//! Scenario acceptance tests.
//!
//! # Acceptance Criteria
//!
//! - A: discovery with no responders returns an empty list after the timeout
//! - B: a failed connect leaves the device in ERROR with the message, and
//!   the next connect clears it
//! - C: a 10-character station name is padded to a 4-byte boundary and
//!   decodes back unchanged
//! - D: the device access point module is always encoded first

use super::mock_device::{io_modules, CONTROLLER_MAC};
use pnio_common::config::{AlarmConfig, CodecConfig, CyclicConfig};
use pnio_common::error::PnioError;
use pnio_common::mac::MacAddress;
use pnio_common::state::ConnectionState;
use pnio_fieldbus::blocks::{
    decode_ar_block, decode_expected_module_block, encode_connect, parse_blocks, BLOCK_AR_REQ,
    BLOCK_EXPECTED_SUBMODULE_REQ,
};
use pnio_fieldbus::device::{AlarmCrSpec, ArProperties, DeviceIdentity, DeviceLayout, Session};
use pnio_fieldbus::rpc::object_uuid;
use pnio_fieldbus::{DeviceConnection, Discoverer, SimulatedLink};
use std::sync::Arc;
use std::time::{Duration, Instant};

const DEVICE_MAC: MacAddress = MacAddress::new([0x02, 0x00, 0x00, 0x00, 0x00, 0x20]);

fn session(station_name: &str) -> Session {
    Session::new(
        1,
        CONTROLLER_MAC,
        DEVICE_MAC,
        object_uuid(1, 0, 0),
        station_name,
        ArProperties::default(),
    )
    .unwrap()
}

fn encode(station_name: &str, codec: &CodecConfig, reverse_modules: bool) -> Vec<u8> {
    let layout = DeviceLayout::new(&io_modules(), &CyclicConfig::default());
    let mut modules = layout.modules.clone();
    if reverse_modules {
        modules.reverse();
    }
    let alarm = AlarmCrSpec::from(&AlarmConfig::default());
    encode_connect(
        &session(station_name),
        &layout.input,
        &layout.output,
        &alarm,
        &modules,
        codec,
    )
}

#[test]
fn test_scenario_a_discovery_without_responses_is_empty() {
    let link = SimulatedLink::new(CONTROLLER_MAC);
    let discoverer = Discoverer::new(Arc::new(link), 1);

    let start = Instant::now();
    let found = discoverer.discover(None, Duration::from_millis(100)).unwrap();

    assert!(found.is_empty());
    assert!(start.elapsed() >= Duration::from_millis(100));
}

#[test]
fn test_scenario_b_connect_failed_then_connect_clears_message() {
    let layout = DeviceLayout::new(&io_modules(), &CyclicConfig::default());
    let mut device = DeviceConnection::new(DeviceIdentity::unresolved("io-1"), layout, None);

    device.connect().unwrap();
    assert_eq!(device.state(), ConnectionState::Connecting);

    device
        .connect_failed(PnioError::TransportTimeout("device did not answer".into()))
        .unwrap();
    assert_eq!(device.state(), ConnectionState::Error);
    assert!(device
        .last_error()
        .unwrap()
        .to_string()
        .contains("device did not answer"));

    device.connect().unwrap();
    assert_eq!(device.state(), ConnectionState::Connecting);
    assert!(device.last_error().is_none());
}

#[test]
fn test_scenario_c_station_name_padding() {
    let bytes = encode("plc-line-1", &CodecConfig::default(), false);
    let blocks = parse_blocks(&bytes, false).unwrap();
    let ar = &blocks[0];
    assert_eq!(ar.block_type, BLOCK_AR_REQ);

    // Fixed fields, 2-byte length, 10 name bytes, 2 pad bytes
    assert_eq!(ar.body.len(), 50 + 2 + 10 + 2);
    assert_eq!(&ar.body[50..52], &10u16.to_be_bytes());
    assert_eq!(&ar.body[ar.body.len() - 2..], &[0, 0]);
    assert_eq!(ar.body.len() % 4, 0);

    let decoded = decode_ar_block(ar.body).unwrap();
    assert_eq!(decoded.station_name, "plc-line-1");
}

#[test]
fn test_scenario_d_access_point_module_first() {
    for codec in [CodecConfig { pad_blocks: false }, CodecConfig { pad_blocks: true }] {
        let bytes = encode("controller", &codec, true);
        let blocks = parse_blocks(&bytes, codec.pad_blocks).unwrap();

        let slots: Vec<(u32, u16, u16)> = blocks
            .iter()
            .filter(|b| b.block_type == BLOCK_EXPECTED_SUBMODULE_REQ)
            .flat_map(|b| decode_expected_module_block(b.body).unwrap())
            .map(|m| (m.api, m.slot, m.submodules[0].subslot))
            .collect();
        assert_eq!(slots, vec![(0, 0, 1), (0, 1, 1), (0, 2, 1)]);
    }
}
