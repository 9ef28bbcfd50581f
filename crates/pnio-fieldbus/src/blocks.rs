//! Connection request/response block codec.
//!
//! Every block is `[type u16][length u16][version u16][content]`, big-endian,
//! where `length` counts everything after itself (version included). A
//! connect request is, in order: one session block, the input and output
//! IOCR blocks, the alarm CR block, and one expected-submodule block per
//! (API, slot), DAP first.

use crate::device::{
    sort_modules, AlarmCrSpec, DataDescription, ExpectedModule, ExpectedSubmodule, IocrDirection,
    IocrSpec, Session,
};
use crate::ethernet::ETHERTYPE_PROFINET;
use crate::rpc::RPC_HEADER_LEN;
use crate::wire::ByteReader;
use pnio_common::config::CodecConfig;
use pnio_common::error::{PnioError, PnioResult};
use pnio_common::mac::MacAddress;
use std::collections::BTreeSet;
use std::fmt;
use uuid::Uuid;

/// Block version 1.0.
pub const BLOCK_VERSION: u16 = 0x0100;

/// Bytes before the content: type, length, version.
pub const BLOCK_HEADER_LEN: usize = 6;

/// Session request.
pub const BLOCK_AR_REQ: u16 = 0x0101;
/// IOCR request.
pub const BLOCK_IOCR_REQ: u16 = 0x0102;
/// Alarm CR request.
pub const BLOCK_ALARM_CR_REQ: u16 = 0x0103;
/// Expected submodule request.
pub const BLOCK_EXPECTED_SUBMODULE_REQ: u16 = 0x0104;
/// Parameter-end request.
pub const BLOCK_IOD_CONTROL_REQ: u16 = 0x0110;
/// Application-ready request (device → controller).
pub const BLOCK_IOX_CONTROL_REQ: u16 = 0x0112;
/// Release request.
pub const BLOCK_RELEASE_REQ: u16 = 0x0114;
/// Session response.
pub const BLOCK_AR_RES: u16 = 0x8101;
/// IOCR response.
pub const BLOCK_IOCR_RES: u16 = 0x8102;
/// Alarm CR response.
pub const BLOCK_ALARM_CR_RES: u16 = 0x8103;
/// Module difference report.
pub const BLOCK_MODULE_DIFF: u16 = 0x8104;
/// Parameter-end response.
pub const BLOCK_IOD_CONTROL_RES: u16 = 0x8110;
/// Application-ready response.
pub const BLOCK_IOX_CONTROL_RES: u16 = 0x8112;
/// Release response.
pub const BLOCK_RELEASE_RES: u16 = 0x8114;

/// Control command: parameter end.
pub const CONTROL_PRM_END: u16 = 0x0001;
/// Control command: application ready.
pub const CONTROL_APPLICATION_READY: u16 = 0x0002;
/// Control command: release.
pub const CONTROL_RELEASE: u16 = 0x0004;
/// Control command: done.
pub const CONTROL_DONE: u16 = 0x0008;

/// VLAN tag header used in IOCR blocks (priority 6).
pub const IOCR_TAG_HEADER: u16 = 0xC000;
/// Alarm high-priority tag header (priority 6).
pub const ALARM_TAG_HEADER_HIGH: u16 = 0xC000;
/// Alarm low-priority tag header (priority 5).
pub const ALARM_TAG_HEADER_LOW: u16 = 0xA000;

const FRAME_SEND_OFFSET_BEST_EFFORT: u32 = 0xFFFF_FFFF;
const ALARM_CR_TYPE: u16 = 0x0001;
const DATA_DESCRIPTION_INPUT: u16 = 0x0001;
const DATA_DESCRIPTION_OUTPUT: u16 = 0x0002;

/// Status tuple carried at the start of every NDR response.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PnioStatus {
    /// Error code.
    pub error_code: u8,
    /// Error decode.
    pub error_decode: u8,
    /// Error code 1 (identifies the faulty block).
    pub error_code1: u8,
    /// Error code 2 (reason within that block).
    pub error_code2: u8,
}

impl PnioStatus {
    /// Success.
    pub const OK: Self = Self {
        error_code: 0,
        error_decode: 0,
        error_code1: 0,
        error_code2: 0,
    };

    /// Wire bytes.
    #[must_use]
    pub fn to_bytes(self) -> [u8; 4] {
        [self.error_code, self.error_decode, self.error_code1, self.error_code2]
    }

    /// Parse from the first four bytes.
    #[must_use]
    pub fn from_bytes(bytes: &[u8]) -> Option<Self> {
        let b = bytes.get(..4)?;
        Some(Self {
            error_code: b[0],
            error_decode: b[1],
            error_code1: b[2],
            error_code2: b[3],
        })
    }

    /// All-zero status.
    #[must_use]
    pub fn is_ok(&self) -> bool {
        *self == Self::OK
    }

    /// Name of the request block identified by error code 1.
    #[must_use]
    pub fn block_name(&self) -> &'static str {
        match self.error_code1 {
            0x01 => "AR",
            0x02 => "IOCR",
            0x03 => "ExpectedSubmodule",
            0x04 => "AlarmCR",
            0x05 => "PrmServer",
            0x06 => "MCR",
            0x07 => "ARRPC",
            0x14 => "IODControl",
            0x15 => "IODRelease",
            0x3C => "CMDEV",
            0x3D => "CMCTL",
            0x3F => "CMRPC",
            _ => "unknown",
        }
    }

    /// Rejection error for a non-zero status.
    #[must_use]
    pub fn to_error(&self) -> PnioError {
        PnioError::ConnectRejected {
            status: self.to_string(),
            block: self.block_name().to_string(),
            reason: self.error_code2,
        }
    }
}

impl fmt::Display for PnioStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:02x}/{:02x}/{:02x}/{:02x}",
            self.error_code, self.error_decode, self.error_code1, self.error_code2
        )
    }
}

/// A block located in a byte stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Block<'a> {
    /// Block type.
    pub block_type: u16,
    /// Block version.
    pub version: u16,
    /// Content after the version.
    pub body: &'a [u8],
}

/// Frame `content` as a block of `block_type`.
#[must_use]
pub fn encode_block(block_type: u16, content: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(BLOCK_HEADER_LEN + content.len());
    push_block(&mut out, block_type, content, false);
    out
}

fn push_block(out: &mut Vec<u8>, block_type: u16, content: &[u8], pad: bool) {
    let length = u16::try_from(content.len() + 2).unwrap_or(u16::MAX);
    out.extend_from_slice(&block_type.to_be_bytes());
    out.extend_from_slice(&length.to_be_bytes());
    out.extend_from_slice(&BLOCK_VERSION.to_be_bytes());
    out.extend_from_slice(content);
    if pad {
        while out.len() % 4 != 0 {
            out.push(0);
        }
    }
}

/// Split a byte stream into blocks.
///
/// With `padded`, zero bytes up to the next 4-byte boundary after each
/// block are skipped.
///
/// # Errors
///
/// Returns `PnioError::Malformed` if a header or body is truncated.
pub fn parse_blocks(bytes: &[u8], padded: bool) -> PnioResult<Vec<Block<'_>>> {
    let mut blocks = Vec::new();
    let mut reader = ByteReader::new(bytes, "block header");
    while reader.remaining() > 0 {
        if padded
            && reader.remaining() < BLOCK_HEADER_LEN
            && bytes[reader.position()..].iter().all(|b| *b == 0)
        {
            break;
        }
        let block_type = reader.u16()?;
        let length = usize::from(reader.u16()?);
        if length < 2 {
            return Err(PnioError::Malformed(format!(
                "block {block_type:#06x} length {length} shorter than its version"
            )));
        }
        let version = reader.u16()?;
        let body = reader.bytes(length - 2)?;
        blocks.push(Block {
            block_type,
            version,
            body,
        });
        if padded {
            let pad = (4 - reader.position() % 4) % 4;
            reader.skip(pad.min(reader.remaining()))?;
        }
    }
    Ok(blocks)
}

fn put_u16(out: &mut Vec<u8>, value: u16) {
    out.extend_from_slice(&value.to_be_bytes());
}

fn put_u32(out: &mut Vec<u8>, value: u32) {
    out.extend_from_slice(&value.to_be_bytes());
}

fn put_uuid(out: &mut Vec<u8>, value: &Uuid) {
    out.extend_from_slice(value.as_bytes());
}

fn station_name_padding(len: usize) -> usize {
    (4 - len % 4) % 4
}

fn ar_block_content(session: &Session) -> Vec<u8> {
    let name = session.station_name.as_bytes();
    let mut out = Vec::with_capacity(54 + name.len());
    put_u16(&mut out, session.ar_type);
    put_uuid(&mut out, &session.ar_uuid);
    put_u16(&mut out, session.session_key);
    out.extend_from_slice(&session.controller_mac.octets());
    put_uuid(&mut out, &session.initiator_object);
    put_u32(&mut out, session.properties.to_bits());
    put_u16(&mut out, session.activity_timeout_factor);
    put_u16(&mut out, session.udp_rt_port);
    put_u16(&mut out, u16::try_from(name.len()).unwrap_or(u16::MAX));
    out.extend_from_slice(name);
    out.resize(out.len() + station_name_padding(name.len()), 0);
    out
}

fn iocr_block_content(iocr: &IocrSpec) -> Vec<u8> {
    let mut out = Vec::with_capacity(64);
    put_u16(&mut out, iocr.direction.wire_type());
    put_u16(&mut out, iocr.reference);
    put_u16(&mut out, ETHERTYPE_PROFINET);
    put_u32(&mut out, iocr.properties);
    put_u16(&mut out, iocr.data_length);
    put_u16(&mut out, iocr.frame_id);
    put_u16(&mut out, iocr.send_clock_factor);
    put_u16(&mut out, iocr.reduction_ratio);
    put_u16(&mut out, iocr.phase);
    put_u16(&mut out, 0); // sequence
    put_u32(&mut out, FRAME_SEND_OFFSET_BEST_EFFORT);
    put_u16(&mut out, iocr.watchdog_factor);
    put_u16(&mut out, iocr.data_hold_factor);
    put_u16(&mut out, IOCR_TAG_HEADER);
    out.extend_from_slice(&MacAddress::ZERO.octets());

    let apis: BTreeSet<u32> = iocr
        .data_objects
        .iter()
        .chain(&iocr.iocs)
        .map(|e| e.api)
        .collect();
    put_u16(&mut out, u16::try_from(apis.len()).unwrap_or(u16::MAX));
    for api in apis {
        put_u32(&mut out, api);
        for list in [&iocr.data_objects, &iocr.iocs] {
            let entries: Vec<_> = list.iter().filter(|e| e.api == api).collect();
            put_u16(&mut out, u16::try_from(entries.len()).unwrap_or(u16::MAX));
            for entry in entries {
                put_u16(&mut out, entry.slot);
                put_u16(&mut out, entry.subslot);
                put_u16(&mut out, entry.frame_offset);
            }
        }
    }
    out
}

fn alarm_block_content(alarm: &AlarmCrSpec) -> Vec<u8> {
    let mut out = Vec::with_capacity(20);
    put_u16(&mut out, ALARM_CR_TYPE);
    put_u16(&mut out, ETHERTYPE_PROFINET);
    put_u32(&mut out, 0); // properties
    put_u16(&mut out, alarm.timeout_factor);
    put_u16(&mut out, alarm.retries);
    put_u16(&mut out, alarm.local_alarm_reference);
    put_u16(&mut out, alarm.max_alarm_data_length);
    if alarm.tag_headers {
        put_u16(&mut out, ALARM_TAG_HEADER_HIGH);
        put_u16(&mut out, ALARM_TAG_HEADER_LOW);
    }
    out
}

fn put_data_description(out: &mut Vec<u8>, kind: u16, desc: DataDescription) {
    put_u16(out, kind);
    put_u16(out, desc.length);
    out.push(desc.iops_length);
    out.push(desc.iocs_length);
}

fn expected_module_content(module: &ExpectedModule) -> Vec<u8> {
    let mut out = Vec::with_capacity(16 + module.submodules.len() * 14);
    put_u16(&mut out, 1); // one API per block
    put_u32(&mut out, module.api);
    put_u16(&mut out, module.slot);
    put_u32(&mut out, module.ident);
    put_u16(&mut out, module.properties);
    put_u16(&mut out, u16::try_from(module.submodules.len()).unwrap_or(u16::MAX));
    for sub in &module.submodules {
        put_u16(&mut out, sub.subslot);
        put_u32(&mut out, sub.ident);
        put_u16(&mut out, sub.kind().properties());
        match (sub.input, sub.output) {
            (None, None) => put_data_description(
                &mut out,
                DATA_DESCRIPTION_INPUT,
                DataDescription {
                    length: 0,
                    iops_length: 1,
                    iocs_length: 1,
                },
            ),
            (input, output) => {
                if let Some(desc) = input {
                    put_data_description(&mut out, DATA_DESCRIPTION_INPUT, desc);
                }
                if let Some(desc) = output {
                    put_data_description(&mut out, DATA_DESCRIPTION_OUTPUT, desc);
                }
            }
        }
    }
    out
}

/// Encode a complete connect request.
///
/// Modules are emitted sorted by (API, slot) so the DAP is always first.
#[must_use]
pub fn encode_connect(
    session: &Session,
    iocr_in: &IocrSpec,
    iocr_out: &IocrSpec,
    alarm: &AlarmCrSpec,
    modules: &[ExpectedModule],
    codec: &CodecConfig,
) -> Vec<u8> {
    let pad = codec.pad_blocks;
    let mut out = Vec::with_capacity(512);
    push_block(&mut out, BLOCK_AR_REQ, &ar_block_content(session), pad);
    push_block(&mut out, BLOCK_IOCR_REQ, &iocr_block_content(iocr_in), pad);
    push_block(&mut out, BLOCK_IOCR_REQ, &iocr_block_content(iocr_out), pad);
    push_block(&mut out, BLOCK_ALARM_CR_REQ, &alarm_block_content(alarm), pad);

    let mut ordered = modules.to_vec();
    sort_modules(&mut ordered);
    for module in &ordered {
        push_block(
            &mut out,
            BLOCK_EXPECTED_SUBMODULE_REQ,
            &expected_module_content(module),
            pad,
        );
    }
    out
}

/// Read the status of a connect (or control) response datagram.
///
/// The status sits immediately after the RPC header.
///
/// # Errors
///
/// Returns `PnioError::Malformed` if the datagram ends before the status.
pub fn decode_connect_response(datagram: &[u8]) -> PnioResult<PnioStatus> {
    datagram
        .get(RPC_HEADER_LEN..)
        .and_then(PnioStatus::from_bytes)
        .ok_or_else(|| {
            PnioError::Malformed(format!(
                "response of {} bytes ends before its status field",
                datagram.len()
            ))
        })
}

/// Decoded session request block.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArBlockReq {
    /// Session type.
    pub ar_type: u16,
    /// Session UUID.
    pub ar_uuid: Uuid,
    /// Session key.
    pub session_key: u16,
    /// Controller MAC.
    pub initiator_mac: MacAddress,
    /// Controller object UUID.
    pub initiator_object: Uuid,
    /// Raw property bits.
    pub properties: u32,
    /// Activity timeout factor.
    pub activity_timeout_factor: u16,
    /// UDP RT port.
    pub udp_rt_port: u16,
    /// Controller station name.
    pub station_name: String,
}

/// Decode a session request body.
///
/// # Errors
///
/// Returns `PnioError::Malformed` on truncation or a non-UTF-8 name.
pub fn decode_ar_block(body: &[u8]) -> PnioResult<ArBlockReq> {
    let mut r = ByteReader::new(body, "ARBlockReq");
    let ar_type = r.u16()?;
    let ar_uuid = r.uuid()?;
    let session_key = r.u16()?;
    let initiator_mac = r.mac()?;
    let initiator_object = r.uuid()?;
    let properties = r.u32()?;
    let activity_timeout_factor = r.u16()?;
    let udp_rt_port = r.u16()?;
    let name_len = usize::from(r.u16()?);
    let name = r.bytes(name_len)?;
    let station_name = String::from_utf8(name.to_vec())
        .map_err(|_| PnioError::Malformed("station name is not UTF-8".into()))?;
    Ok(ArBlockReq {
        ar_type,
        ar_uuid,
        session_key,
        initiator_mac,
        initiator_object,
        properties,
        activity_timeout_factor,
        udp_rt_port,
        station_name,
    })
}

/// IOCR entry as (API, slot, subslot, frame offset).
pub type IocrWireEntry = (u32, u16, u16, u16);

/// Decoded IOCR request block.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IocrBlockReq {
    /// Direction.
    pub direction: IocrDirection,
    /// IOCR reference.
    pub reference: u16,
    /// IOCRProperties.
    pub properties: u32,
    /// Frame data length.
    pub data_length: u16,
    /// Frame id.
    pub frame_id: u16,
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
    /// Provider entries.
    pub data_objects: Vec<IocrWireEntry>,
    /// Consumer status entries.
    pub iocs: Vec<IocrWireEntry>,
}

/// Decode an IOCR request body.
///
/// # Errors
///
/// Returns `PnioError::Malformed` on truncation or an unknown IOCR type.
pub fn decode_iocr_block(body: &[u8]) -> PnioResult<IocrBlockReq> {
    let mut r = ByteReader::new(body, "IOCRBlockReq");
    let iocr_type = r.u16()?;
    let direction = IocrDirection::from_wire(iocr_type)
        .ok_or_else(|| PnioError::Malformed(format!("IOCR type {iocr_type:#06x}")))?;
    let reference = r.u16()?;
    let _lt = r.u16()?;
    let properties = r.u32()?;
    let data_length = r.u16()?;
    let frame_id = r.u16()?;
    let send_clock_factor = r.u16()?;
    let reduction_ratio = r.u16()?;
    let phase = r.u16()?;
    let _sequence = r.u16()?;
    let _send_offset = r.u32()?;
    let watchdog_factor = r.u16()?;
    let data_hold_factor = r.u16()?;
    let _tag_header = r.u16()?;
    let _multicast = r.mac()?;

    let mut data_objects = Vec::new();
    let mut iocs = Vec::new();
    let apis = r.u16()?;
    for _ in 0..apis {
        let api = r.u32()?;
        for list in [&mut data_objects, &mut iocs] {
            let count = r.u16()?;
            for _ in 0..count {
                list.push((api, r.u16()?, r.u16()?, r.u16()?));
            }
        }
    }

    Ok(IocrBlockReq {
        direction,
        reference,
        properties,
        data_length,
        frame_id,
        send_clock_factor,
        reduction_ratio,
        phase,
        watchdog_factor,
        data_hold_factor,
        data_objects,
        iocs,
    })
}

/// Decode an expected-submodule request body.
///
/// # Errors
///
/// Returns `PnioError::Malformed` on truncation.
pub fn decode_expected_module_block(body: &[u8]) -> PnioResult<Vec<ExpectedModule>> {
    let mut r = ByteReader::new(body, "ExpectedSubmoduleBlockReq");
    let apis = r.u16()?;
    let mut modules = Vec::with_capacity(usize::from(apis));
    for _ in 0..apis {
        let api = r.u32()?;
        let slot = r.u16()?;
        let ident = r.u32()?;
        let properties = r.u16()?;
        let count = r.u16()?;
        let mut submodules = Vec::with_capacity(usize::from(count));
        for _ in 0..count {
            let subslot = r.u16()?;
            let sub_ident = r.u32()?;
            let sub_properties = r.u16()?;
            let descriptions = if sub_properties & 0x0003 == 0x0003 {
                2
            } else {
                1
            };
            let mut input = None;
            let mut output = None;
            for _ in 0..descriptions {
                let kind = r.u16()?;
                let desc = DataDescription {
                    length: r.u16()?,
                    iops_length: r.u8()?,
                    iocs_length: r.u8()?,
                };
                match kind {
                    DATA_DESCRIPTION_OUTPUT => output = Some(desc),
                    _ if sub_properties & 0x0003 == 0 => {} // NO_IO placeholder
                    _ => input = Some(desc),
                }
            }
            submodules.push(ExpectedSubmodule {
                subslot,
                ident: sub_ident,
                input,
                output,
            });
        }
        modules.push(ExpectedModule {
            api,
            slot,
            ident,
            properties,
            submodules,
        });
    }
    Ok(modules)
}

/// Decoded session response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArBlockRes {
    /// Session type.
    pub ar_type: u16,
    /// Session UUID.
    pub ar_uuid: Uuid,
    /// Session key.
    pub session_key: u16,
    /// Device MAC.
    pub responder_mac: MacAddress,
    /// Device UDP RT port.
    pub responder_udp_port: u16,
}

/// Decoded IOCR response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IocrBlockRes {
    /// Direction.
    pub direction: IocrDirection,
    /// IOCR reference.
    pub reference: u16,
    /// Frame id the device will use or accept.
    pub frame_id: u16,
}

/// Decoded alarm CR response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AlarmCrBlockRes {
    /// Alarm CR type.
    pub alarm_type: u16,
    /// Device alarm endpoint reference.
    pub remote_alarm_reference: u16,
    /// Device maximum alarm payload.
    pub max_alarm_data_length: u16,
}

/// Everything a successful connect response carries.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ConnectResponse {
    /// Session response.
    pub ar: Option<ArBlockRes>,
    /// IOCR responses.
    pub iocrs: Vec<IocrBlockRes>,
    /// Alarm CR response.
    pub alarm: Option<AlarmCrBlockRes>,
    /// Raw module difference block body, if the device reported one.
    pub module_diff: Option<Vec<u8>>,
}

impl ConnectResponse {
    /// Frame id the device confirmed for a direction.
    #[must_use]
    pub fn frame_id(&self, direction: IocrDirection) -> Option<u16> {
        self.iocrs
            .iter()
            .find(|r| r.direction == direction)
            .map(|r| r.frame_id)
    }
}

/// Parse the blocks of a connect response.
///
/// Unknown block types are skipped.
///
/// # Errors
///
/// Returns `PnioError::Malformed` if a known block is truncated.
pub fn parse_connect_response(blocks: &[u8], padded: bool) -> PnioResult<ConnectResponse> {
    let mut response = ConnectResponse::default();
    for block in parse_blocks(blocks, padded)? {
        match block.block_type {
            BLOCK_AR_RES => {
                let mut r = ByteReader::new(block.body, "ARBlockRes");
                response.ar = Some(ArBlockRes {
                    ar_type: r.u16()?,
                    ar_uuid: r.uuid()?,
                    session_key: r.u16()?,
                    responder_mac: r.mac()?,
                    responder_udp_port: r.u16()?,
                });
            }
            BLOCK_IOCR_RES => {
                let mut r = ByteReader::new(block.body, "IOCRBlockRes");
                let iocr_type = r.u16()?;
                let direction = IocrDirection::from_wire(iocr_type)
                    .ok_or_else(|| PnioError::Malformed(format!("IOCR type {iocr_type:#06x}")))?;
                response.iocrs.push(IocrBlockRes {
                    direction,
                    reference: r.u16()?,
                    frame_id: r.u16()?,
                });
            }
            BLOCK_ALARM_CR_RES => {
                let mut r = ByteReader::new(block.body, "AlarmCRBlockRes");
                response.alarm = Some(AlarmCrBlockRes {
                    alarm_type: r.u16()?,
                    remote_alarm_reference: r.u16()?,
                    max_alarm_data_length: r.u16()?,
                });
            }
            BLOCK_MODULE_DIFF => response.module_diff = Some(block.body.to_vec()),
            _ => {}
        }
    }
    Ok(response)
}

/// Body shared by control, application-ready, and release blocks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ControlBlock {
    /// Session UUID.
    pub ar_uuid: Uuid,
    /// Session key.
    pub session_key: u16,
    /// Control command.
    pub command: u16,
    /// Control block properties.
    pub properties: u16,
}

/// Encode a control-style block.
#[must_use]
pub fn encode_control_block(block_type: u16, control: &ControlBlock) -> Vec<u8> {
    let mut content = Vec::with_capacity(26);
    put_u16(&mut content, 0); // reserved
    put_uuid(&mut content, &control.ar_uuid);
    put_u16(&mut content, control.session_key);
    put_u16(&mut content, 0); // reserved
    put_u16(&mut content, control.command);
    put_u16(&mut content, control.properties);
    encode_block(block_type, &content)
}

/// Decode a control-style block body.
///
/// # Errors
///
/// Returns `PnioError::Malformed` on truncation.
pub fn decode_control_block(body: &[u8]) -> PnioResult<ControlBlock> {
    let mut r = ByteReader::new(body, "ControlBlock");
    r.skip(2)?;
    let ar_uuid = r.uuid()?;
    let session_key = r.u16()?;
    r.skip(2)?;
    Ok(ControlBlock {
        ar_uuid,
        session_key,
        command: r.u16()?,
        properties: r.u16()?,
    })
}
