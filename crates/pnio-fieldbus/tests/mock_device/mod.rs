//! Mock PROFINET IO device for integration tests.
//!
//! Provides:
//! - a UDP responder for connect, control, and release requests that
//!   also sends application-ready back to the controller
//! - a station on a [`SimulatedLink`] answering identify requests,
//!   sending input frames, recording output frames, and raising alarms
//!
//! Behaviour can be changed while the device runs to inject failures.

#![allow(dead_code)] // Not every test uses every helper

use pnio_common::config::{ControllerConfig, DeviceConfig, ModuleConfig, SubmoduleConfig};
use pnio_common::mac::MacAddress;
use pnio_fieldbus::alarm::{RtaHeader, RtaPduType, FRAME_ID_ALARM_HIGH};
use pnio_fieldbus::blocks::{
    decode_ar_block, decode_control_block, decode_expected_module_block, decode_iocr_block,
    encode_block, encode_control_block, parse_blocks, ArBlockReq, ControlBlock, IocrBlockReq,
    PnioStatus, BLOCK_ALARM_CR_RES, BLOCK_AR_REQ, BLOCK_AR_RES, BLOCK_EXPECTED_SUBMODULE_REQ,
    BLOCK_IOCR_REQ, BLOCK_IOCR_RES, BLOCK_IOD_CONTROL_REQ, BLOCK_IOD_CONTROL_RES,
    BLOCK_IOX_CONTROL_REQ, BLOCK_IOX_CONTROL_RES, BLOCK_RELEASE_REQ, CONTROL_APPLICATION_READY,
    CONTROL_DONE,
};
use pnio_fieldbus::cyclic::CyclicPdu;
use pnio_fieldbus::dcp::{encode_identify_response, DCP_MULTICAST, FRAME_ID_IDENTIFY_REQUEST};
use pnio_fieldbus::device::{DeviceIdentity, IocrDirection};
use pnio_fieldbus::ethernet::{
    build_frame, EthernetFrame, FrameChannel, SimulatedLink, ETHERTYPE_PROFINET, ETH_MAX_FRAME,
};
use pnio_fieldbus::rpc::{
    encode_ndr_request, encode_ndr_response, ndr_blocks, Opnum, PacketType, RpcHeader,
    PNIO_CONTROLLER_INTERFACE,
};
use std::net::{Ipv4Addr, SocketAddr, UdpSocket};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use uuid::Uuid;

/// Vendor id the mock reports.
pub const MOCK_VENDOR_ID: u16 = 0x002A;
/// Device id the mock reports.
pub const MOCK_DEVICE_ID: u16 = 0x0302;
/// Alarm endpoint reference the mock uses.
pub const MOCK_ALARM_REFERENCE: u16 = 0x0033;

/// Controller MAC used by tests.
pub const CONTROLLER_MAC: MacAddress = MacAddress::new([0x02, 0x00, 0x00, 0x00, 0x00, 0x01]);

/// Adjustable device behaviour.
#[derive(Debug, Clone)]
pub struct MockBehavior {
    /// Answer identify requests.
    pub answer_identify: bool,
    /// Answer connect requests at all.
    pub answer_connect: bool,
    /// Status returned for a connect request.
    pub connect_status: PnioStatus,
    /// Frame id confirmed for the input IOCR (defaults to the requested one).
    pub confirmed_input_frame_id: Option<u16>,
    /// Answer parameter-end.
    pub answer_prm_end: bool,
    /// Send application-ready after parameter-end.
    pub send_app_ready: bool,
    /// Send input frames once connected.
    pub send_cyclic: bool,
    /// Data status of input frames.
    pub input_data_status: u8,
    /// Input frame data (padded or cut to the IOCR data length).
    pub input_data: Vec<u8>,
    /// Input frame period.
    pub input_interval: Duration,
}

impl Default for MockBehavior {
    fn default() -> Self {
        Self {
            answer_identify: true,
            answer_connect: true,
            connect_status: PnioStatus::OK,
            confirmed_input_frame_id: None,
            answer_prm_end: true,
            send_app_ready: true,
            send_cyclic: true,
            input_data_status: 0x15,
            input_data: Vec::new(),
            input_interval: Duration::from_millis(2),
        }
    }
}

/// What the mock observed.
#[derive(Debug, Clone, Default)]
pub struct MockRecord {
    /// Identify requests received.
    pub identify_requests: usize,
    /// Connect requests received.
    pub connect_requests: usize,
    /// Session block of the last connect request.
    pub ar: Option<ArBlockReq>,
    /// IOCR blocks of the last connect request.
    pub iocrs: Vec<IocrBlockReq>,
    /// (API, slot) of each expected-module block, in wire order.
    pub modules: Vec<(u32, u16)>,
    /// Block types of the last connect request, in wire order.
    pub block_types: Vec<u16>,
    /// Last parameter-end request.
    pub prm_end: Option<ControlBlock>,
    /// Controller's answer to application-ready.
    pub app_ready_reply: Option<ControlBlock>,
    /// Status of that answer.
    pub app_ready_status: Option<PnioStatus>,
    /// Last release request.
    pub released: Option<ControlBlock>,
    /// Output frames received.
    pub output_frames: u64,
    /// Counters of received output frames.
    pub output_counters: Vec<u16>,
    /// Data status of the last output frame.
    pub output_data_status: Option<u8>,
    /// Data of the last output frame.
    pub last_output: Vec<u8>,
    /// Input frames sent.
    pub input_frames: u64,
    /// Alarm acknowledgements received.
    pub alarm_acks: Vec<RtaHeader>,
}

impl MockRecord {
    fn input_iocr(&self) -> Option<&IocrBlockReq> {
        self.iocrs.iter().find(|i| i.direction == IocrDirection::Input)
    }
}

struct Shared {
    name: String,
    mac: MacAddress,
    ip: Ipv4Addr,
    behavior: Mutex<MockBehavior>,
    record: Mutex<MockRecord>,
    stop: AtomicBool,
    pending_alarm: AtomicBool,
}

impl Shared {
    fn behavior(&self) -> MockBehavior {
        self.behavior.lock().unwrap().clone()
    }

    fn identity(&self) -> DeviceIdentity {
        DeviceIdentity {
            station_name: self.name.clone(),
            ip: self.ip,
            mac: self.mac,
            vendor_id: MOCK_VENDOR_ID,
            device_id: MOCK_DEVICE_ID,
        }
    }
}

/// A running mock device.
pub struct MockDevice {
    shared: Arc<Shared>,
    rpc_addr: SocketAddr,
    threads: Vec<JoinHandle<()>>,
}

impl MockDevice {
    /// Start a device named `name` on the controller's `link`.
    ///
    /// The RPC responder binds `ip:port` (port 0 picks a free one).
    pub fn start(
        link: &SimulatedLink,
        name: &str,
        mac: MacAddress,
        ip: Ipv4Addr,
        port: u16,
        behavior: MockBehavior,
    ) -> Self {
        let socket = UdpSocket::bind((ip, port)).unwrap();
        socket.set_read_timeout(Some(Duration::from_millis(10))).unwrap();
        let rpc_addr = socket.local_addr().unwrap();

        let shared = Arc::new(Shared {
            name: name.to_string(),
            mac,
            ip,
            behavior: Mutex::new(behavior),
            record: Mutex::new(MockRecord::default()),
            stop: AtomicBool::new(false),
            pending_alarm: AtomicBool::new(false),
        });

        let rpc_shared = Arc::clone(&shared);
        let rpc = thread::Builder::new()
            .name(format!("mock-rpc-{name}"))
            .spawn(move || run_rpc(&rpc_shared, &socket))
            .unwrap();

        let channel = link.attach(mac).channel();
        let eth_shared = Arc::clone(&shared);
        let eth = thread::Builder::new()
            .name(format!("mock-eth-{name}"))
            .spawn(move || run_ethernet(&eth_shared, channel))
            .unwrap();

        Self {
            shared,
            rpc_addr,
            threads: vec![rpc, eth],
        }
    }

    /// Device on 127.0.0.1 with a free port.
    pub fn start_local(link: &SimulatedLink, name: &str, behavior: MockBehavior) -> Self {
        Self::start(
            link,
            name,
            MacAddress::new([0x02, 0x00, 0x00, 0x00, 0x00, 0x10]),
            Ipv4Addr::LOCALHOST,
            0,
            behavior,
        )
    }

    /// Identity the device reports.
    pub fn identity(&self) -> DeviceIdentity {
        self.shared.identity()
    }

    /// RPC port.
    pub fn rpc_port(&self) -> u16 {
        self.rpc_addr.port()
    }

    /// Snapshot of what the device observed.
    pub fn record(&self) -> MockRecord {
        self.shared.record.lock().unwrap().clone()
    }

    /// Change behaviour while running.
    pub fn update(&self, f: impl FnOnce(&mut MockBehavior)) {
        f(&mut self.shared.behavior.lock().unwrap());
    }

    /// Send one alarm to the controller on the next cycle.
    pub fn raise_alarm(&self) {
        self.shared.pending_alarm.store(true, Ordering::Release);
    }

    /// Poll until `condition` holds or `timeout` passes.
    pub fn wait_for(&self, timeout: Duration, condition: impl Fn(&MockRecord) -> bool) -> bool {
        let deadline = Instant::now() + timeout;
        while Instant::now() < deadline {
            if condition(&self.record()) {
                return true;
            }
            thread::sleep(Duration::from_millis(2));
        }
        false
    }

    /// Stop both activities.
    pub fn stop(&mut self) {
        self.shared.stop.store(true, Ordering::Release);
        for handle in self.threads.drain(..) {
            let _ = handle.join();
        }
    }
}

impl Drop for MockDevice {
    fn drop(&mut self) {
        self.stop();
    }
}

/// DAP, a 4-byte input module in slot 1, a 2-byte output module in slot 2.
pub fn io_modules() -> Vec<ModuleConfig> {
    vec![
        ModuleConfig {
            api: 0,
            slot: 2,
            ident: 0x0000_0031,
            properties: 0,
            submodules: vec![SubmoduleConfig {
                subslot: 1,
                ident: 0x0000_0001,
                output_length: Some(2),
                ..SubmoduleConfig::default()
            }],
        },
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
        },
        ModuleConfig {
            api: 0,
            slot: 1,
            ident: 0x0000_0030,
            properties: 0,
            submodules: vec![SubmoduleConfig {
                subslot: 1,
                ident: 0x0000_0001,
                input_length: Some(4),
                ..SubmoduleConfig::default()
            }],
        },
    ]
}

/// Controller configuration pointing at `device`, with fast timing.
pub fn controller_config(device: &MockDevice, resolved: bool) -> ControllerConfig {
    let identity = device.identity();
    let mut config = ControllerConfig::default();
    config.controller_mac = Some(CONTROLLER_MAC);
    config.rpc.bind = "127.0.0.1:0".parse().unwrap();
    config.rpc.device_port = device.rpc_port();
    config.rpc.response_timeout = Duration::from_millis(300);
    config.discovery.timeout = Duration::from_millis(100);
    config.handshake.prm_end_timeout = Duration::from_millis(300);
    config.handshake.app_ready_timeout = Duration::from_millis(500);
    config.cyclic.cycle_time = Some(Duration::from_millis(2));
    config.cyclic.watchdog_factor = 50;
    config.cyclic.data_hold_factor = 100;
    config.devices.push(DeviceConfig {
        station_name: identity.station_name.clone(),
        ip: resolved.then_some(identity.ip),
        mac: resolved.then_some(identity.mac),
        vendor_id: Some(MOCK_VENDOR_ID),
        device_id: Some(MOCK_DEVICE_ID),
        instance: 1,
        modules: io_modules(),
    });
    config
}

fn respond(
    socket: &UdpSocket,
    request: &RpcHeader,
    peer: SocketAddr,
    status: PnioStatus,
    blocks: &[u8],
) {
    let body = encode_ndr_response(status, blocks);
    let header = RpcHeader::response_to(request, u16::try_from(body.len()).unwrap());
    let mut datagram = header.to_bytes().to_vec();
    datagram.extend_from_slice(&body);
    socket.send_to(&datagram, peer).unwrap();
}

fn connect_response(
    shared: &Shared,
    ar: &ArBlockReq,
    iocrs: &[IocrBlockReq],
    behavior: &MockBehavior,
) -> Vec<u8> {
    let mut out = Vec::new();

    let mut content = Vec::new();
    content.extend_from_slice(&ar.ar_type.to_be_bytes());
    content.extend_from_slice(ar.ar_uuid.as_bytes());
    content.extend_from_slice(&ar.session_key.to_be_bytes());
    content.extend_from_slice(&shared.mac.octets());
    content.extend_from_slice(&ETHERTYPE_PROFINET.to_be_bytes());
    out.extend_from_slice(&encode_block(BLOCK_AR_RES, &content));

    for iocr in iocrs {
        let frame_id = match (iocr.direction, behavior.confirmed_input_frame_id) {
            (IocrDirection::Input, Some(id)) => id,
            _ => iocr.frame_id,
        };
        let mut content = Vec::new();
        content.extend_from_slice(&iocr.direction.wire_type().to_be_bytes());
        content.extend_from_slice(&iocr.reference.to_be_bytes());
        content.extend_from_slice(&frame_id.to_be_bytes());
        out.extend_from_slice(&encode_block(BLOCK_IOCR_RES, &content));
    }

    let mut content = Vec::new();
    content.extend_from_slice(&1u16.to_be_bytes());
    content.extend_from_slice(&MOCK_ALARM_REFERENCE.to_be_bytes());
    content.extend_from_slice(&200u16.to_be_bytes());
    out.extend_from_slice(&encode_block(BLOCK_ALARM_CR_RES, &content));
    out
}

fn handle_connect(
    shared: &Shared,
    socket: &UdpSocket,
    header: &RpcHeader,
    peer: SocketAddr,
    blocks: &[u8],
) {
    let behavior = shared.behavior();
    let parsed = parse_blocks(blocks, false).unwrap();

    let mut ar = None;
    let mut iocrs = Vec::new();
    let mut modules = Vec::new();
    for block in &parsed {
        match block.block_type {
            BLOCK_AR_REQ => ar = Some(decode_ar_block(block.body).unwrap()),
            BLOCK_IOCR_REQ => iocrs.push(decode_iocr_block(block.body).unwrap()),
            BLOCK_EXPECTED_SUBMODULE_REQ => {
                for module in decode_expected_module_block(block.body).unwrap() {
                    modules.push((module.api, module.slot));
                }
            }
            _ => {}
        }
    }
    let ar = ar.unwrap();

    {
        let mut record = shared.record.lock().unwrap();
        record.connect_requests += 1;
        record.block_types = parsed.iter().map(|b| b.block_type).collect();
        record.ar = Some(ar.clone());
        record.iocrs.clone_from(&iocrs);
        record.modules = modules;
    }

    if !behavior.answer_connect {
        return;
    }
    if behavior.connect_status.is_ok() {
        let blocks = connect_response(shared, &ar, &iocrs, &behavior);
        respond(socket, header, peer, PnioStatus::OK, &blocks);
    } else {
        respond(socket, header, peer, behavior.connect_status, &[]);
    }
}

fn send_application_ready(
    socket: &UdpSocket,
    object: Uuid,
    peer: SocketAddr,
    prm_end: &ControlBlock,
) -> Uuid {
    let block = encode_control_block(
        BLOCK_IOX_CONTROL_REQ,
        &ControlBlock {
            ar_uuid: prm_end.ar_uuid,
            session_key: prm_end.session_key,
            command: CONTROL_APPLICATION_READY,
            properties: 0,
        },
    );
    let body = encode_ndr_request(16_384, &block);
    let header = RpcHeader::request(
        object,
        PNIO_CONTROLLER_INTERFACE,
        Opnum::Control,
        1,
        u16::try_from(body.len()).unwrap(),
    );
    let mut datagram = header.to_bytes().to_vec();
    datagram.extend_from_slice(&body);
    socket.send_to(&datagram, peer).unwrap();
    header.activity
}

fn handle_control(
    shared: &Shared,
    socket: &UdpSocket,
    header: &RpcHeader,
    peer: SocketAddr,
    blocks: &[u8],
) -> Option<Uuid> {
    let behavior = shared.behavior();
    let parsed = parse_blocks(blocks, false).unwrap();
    let block = parsed.iter().find(|b| b.block_type == BLOCK_IOD_CONTROL_REQ)?;
    let control = decode_control_block(block.body).unwrap();
    shared.record.lock().unwrap().prm_end = Some(control);

    if !behavior.answer_prm_end {
        return None;
    }
    let reply = encode_control_block(
        BLOCK_IOD_CONTROL_RES,
        &ControlBlock {
            command: CONTROL_DONE,
            ..control
        },
    );
    respond(socket, header, peer, PnioStatus::OK, &reply);

    if !behavior.send_app_ready {
        return None;
    }
    thread::sleep(Duration::from_millis(5));
    Some(send_application_ready(socket, header.object, peer, &control))
}

fn run_rpc(shared: &Shared, socket: &UdpSocket) {
    let mut buf = vec![0u8; 65_535];
    let mut app_ready_activity: Option<Uuid> = None;

    while !shared.stop.load(Ordering::Acquire) {
        let Ok((len, peer)) = socket.recv_from(&mut buf) else {
            continue;
        };
        let datagram = &buf[..len];
        let Ok(header) = RpcHeader::from_bytes(datagram) else {
            continue;
        };
        let Ok(blocks) = ndr_blocks(&datagram[80..], header.is_little_endian()) else {
            continue;
        };

        if header.packet_type == PacketType::Response {
            if Some(header.activity) == app_ready_activity {
                let status = PnioStatus::from_bytes(&datagram[80..]);
                let reply = parse_blocks(blocks, false)
                    .ok()
                    .and_then(|b| b.into_iter().find(|b| b.block_type == BLOCK_IOX_CONTROL_RES))
                    .and_then(|b| decode_control_block(b.body).ok());
                let mut record = shared.record.lock().unwrap();
                record.app_ready_status = status;
                record.app_ready_reply = reply;
            }
            continue;
        }
        if header.packet_type != PacketType::Request {
            continue;
        }

        match header.opnum {
            op if op == Opnum::Connect as u16 => {
                handle_connect(shared, socket, &header, peer, blocks);
            }
            op if op == Opnum::Control as u16 => {
                if let Some(activity) = handle_control(shared, socket, &header, peer, blocks) {
                    app_ready_activity = Some(activity);
                }
            }
            op if op == Opnum::Release as u16 => {
                let released = parse_blocks(blocks, false)
                    .ok()
                    .and_then(|b| b.into_iter().find(|b| b.block_type == BLOCK_RELEASE_REQ))
                    .and_then(|b| decode_control_block(b.body).ok());
                shared.record.lock().unwrap().released = released;
            }
            _ => {}
        }
    }
}

/// Station name filter of an identify request, if any.
fn identify_filter(payload: &[u8]) -> Option<String> {
    // frame id, service id/type, xid, delay, length
    let blocks = payload.get(12..)?;
    if blocks.len() < 4 || blocks[0] != 2 || blocks[1] != 2 {
        return None;
    }
    let len = usize::from(u16::from_be_bytes([blocks[2], blocks[3]]));
    blocks.get(4..4 + len).map(|n| String::from_utf8_lossy(n).into_owned())
}

fn handle_identify(shared: &Shared, channel: &mut dyn FrameChannel, eth: &EthernetFrame<'_>) {
    shared.record.lock().unwrap().identify_requests += 1;
    if !shared.behavior().answer_identify {
        return;
    }
    if let Some(filter) = identify_filter(eth.payload) {
        if filter != shared.name {
            return;
        }
    }
    let xid = u32::from_be_bytes([eth.payload[4], eth.payload[5], eth.payload[6], eth.payload[7]]);
    let response = encode_identify_response(xid, &shared.identity());
    let _ = channel.send(&build_frame(eth.src, shared.mac, ETHERTYPE_PROFINET, &response));
}

fn handle_frame(shared: &Shared, channel: &mut dyn FrameChannel, bytes: &[u8]) {
    let Some(eth) = EthernetFrame::parse(bytes) else {
        return;
    };
    if eth.ethertype != ETHERTYPE_PROFINET || (eth.dst != shared.mac && eth.dst != DCP_MULTICAST) {
        return;
    }
    let frame_id = u16::from_be_bytes([eth.payload[0], eth.payload[1]]);

    if frame_id == FRAME_ID_IDENTIFY_REQUEST {
        handle_identify(shared, channel, &eth);
        return;
    }
    if frame_id == FRAME_ID_ALARM_HIGH {
        if let Ok(header) = RtaHeader::decode(&eth.payload[2..]) {
            if header.pdu_type == RtaPduType::Ack {
                shared.record.lock().unwrap().alarm_acks.push(header);
            }
        }
        return;
    }

    let mut record = shared.record.lock().unwrap();
    let output_id = record
        .iocrs
        .iter()
        .find(|i| i.direction == IocrDirection::Output)
        .map(|i| i.frame_id);
    if Some(frame_id) == output_id {
        if let Some(pdu) = CyclicPdu::decode(eth.payload) {
            record.output_frames += 1;
            record.output_counters.push(pdu.counter);
            record.output_data_status = Some(pdu.data_status);
            record.last_output = pdu.data.to_vec();
        }
    }
}

fn send_alarm(shared: &Shared, channel: &mut dyn FrameChannel, controller: MacAddress, seq: u16) {
    let mut payload = RtaHeader {
        dst_endpoint: 1,
        src_endpoint: MOCK_ALARM_REFERENCE,
        pdu_type: RtaPduType::Data,
        version: 1,
        add_flags: 0x11,
        send_seq: seq,
        ack_seq: 0xFFFF,
        var_part_len: 4,
    }
    .encode(FRAME_ID_ALARM_HIGH);
    payload.extend_from_slice(&[0x00, 0x01, 0x00, 0x00]);
    let _ = channel.send(&build_frame(controller, shared.mac, ETHERTYPE_PROFINET, &payload));
}

fn send_input(shared: &Shared, channel: &mut dyn FrameChannel, counter: u16) {
    let behavior = shared.behavior();
    let (controller, frame_id, length) = {
        let record = shared.record.lock().unwrap();
        let (Some(ar), Some(input)) = (record.ar.as_ref(), record.input_iocr()) else {
            return;
        };
        if record.app_ready_reply.is_none() {
            return;
        }
        let frame_id = behavior.confirmed_input_frame_id.unwrap_or(input.frame_id);
        (ar.initiator_mac, frame_id, usize::from(input.data_length))
    };

    let mut data = behavior.input_data.clone();
    if data.is_empty() {
        data = vec![0x80; length];
    }
    data.resize(length, 0);
    let pdu = CyclicPdu {
        frame_id,
        counter,
        data_status: behavior.input_data_status,
        transfer_status: 0,
        data: &data,
    };
    if channel
        .send(&build_frame(controller, shared.mac, ETHERTYPE_PROFINET, &pdu.encode()))
        .is_ok()
    {
        shared.record.lock().unwrap().input_frames += 1;
    }
}

fn run_ethernet(shared: &Shared, mut channel: impl FrameChannel) {
    let mut buf = vec![0u8; ETH_MAX_FRAME];
    let mut counter: u16 = 0;
    let mut alarm_seq: u16 = 0;
    let mut next_input = Instant::now();

    while !shared.stop.load(Ordering::Acquire) {
        let behavior = shared.behavior();
        if behavior.send_cyclic && Instant::now() >= next_input {
            counter = counter.wrapping_add(1);
            send_input(shared, &mut channel, counter);
            next_input = Instant::now() + behavior.input_interval;
        }

        if shared.pending_alarm.swap(false, Ordering::AcqRel) {
            let controller = shared.record.lock().unwrap().ar.as_ref().map(|a| a.initiator_mac);
            if let Some(controller) = controller {
                send_alarm(shared, &mut channel, controller, alarm_seq);
                alarm_seq = alarm_seq.wrapping_add(1);
            }
        }

        match channel.recv(&mut buf, Duration::from_millis(1)) {
            Ok(Some(len)) => handle_frame(shared, &mut channel, &buf[..len]),
            Ok(None) => {}
            Err(_) => break,
        }
    }
}
