//! PROFINET IO controller engine.
//!
//! This crate provides:
//! - [`ethernet`] raw link abstraction with a packet-socket and a simulated link
//! - [`dcp`] identify-based discovery of field devices
//! - [`rpc`] connection-oriented request framing over UDP
//! - [`blocks`] connect/control block codec
//! - [`handshake`] parameter-end and application-ready exchange
//! - [`cyclic`] periodic real-time exchange and its registry
//! - [`alarm`] transport-level alarm acknowledgement
//! - [`device`] identity, session, and frame layout model
//! - [`connection`] per-device state machine
//! - [`manager`] [`ConnectionManager`] owning every device connection

pub mod alarm;
pub mod blocks;
pub mod connection;
pub mod cyclic;
pub mod dcp;
pub mod device;
pub mod ethernet;
pub mod handshake;
pub mod manager;
pub mod rpc;
pub mod wire;

pub use blocks::{decode_connect_response, encode_connect, PnioStatus};
pub use connection::{DeviceConnection, DeviceSnapshot, StateObserver};
pub use cyclic::{CyclicEngine, CyclicRegistry, CyclicStats, InputSnapshot};
pub use dcp::Discoverer;
pub use device::{DeviceIdentity, DeviceLayout, Session};
pub use ethernet::{EthernetLink, FrameChannel, SimulatedLink};
pub use handshake::HandshakeCoordinator;
pub use manager::{ConnectionManager, InputObserver, ManagerStatus};
pub use rpc::RpcEndpoint;
