//! Connectionless RPC transport for connect, control, and release requests.
//!
//! Every datagram starts with an 80-byte header followed by a 20-byte NDR
//! header and the block payload. Multi-byte header fields follow the data
//! representation flag (the controller always sends little-endian); UUIDs
//! are stored with their first three fields byte-swapped when little-endian.
//!
//! One [`RpcEndpoint`] is shared by the whole controller. Only one device
//! at a time may be waiting on it (see the connection manager's connecting
//! slot), so request/response matching is by activity UUID alone.

use crate::blocks::PnioStatus;
use pnio_common::error::{PnioError, PnioResult};
use std::collections::VecDeque;
use std::io;
use std::net::{SocketAddr, UdpSocket};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Mutex;
use std::time::{Duration, Instant};
use tracing::{debug, trace, warn};
use uuid::Uuid;

/// RPC header length.
pub const RPC_HEADER_LEN: usize = 80;

/// NDR header length.
pub const NDR_HEADER_LEN: usize = 20;

/// Protocol version.
pub const RPC_VERSION: u8 = 4;

/// Flags1: last fragment.
pub const FLAG1_LAST_FRAGMENT: u8 = 0x02;
/// Flags1: no fragment acknowledgement requested.
pub const FLAG1_NO_FACK: u8 = 0x08;
/// Flags1: idempotent request.
pub const FLAG1_IDEMPOTENT: u8 = 0x20;

/// Little-endian, ASCII, IEEE float.
pub const DREP_LITTLE_ENDIAN: [u8; 3] = [0x10, 0x00, 0x00];

/// PNIO device interface UUID.
pub const PNIO_DEVICE_INTERFACE: Uuid = Uuid::from_u128(0xDEA0_0001_6C97_11D1_8271_00A0_2442_DF7D);

/// PNIO controller interface UUID (device-initiated requests).
pub const PNIO_CONTROLLER_INTERFACE: Uuid =
    Uuid::from_u128(0xDEA0_0002_6C97_11D1_8271_00A0_2442_DF7D);

const OBJECT_UUID_BASE: u128 = 0xDEA0_0000_6C97_11D1_8271_0000_0000_0000;

/// Interface version.
pub const INTERFACE_VERSION: u32 = 1;

/// Hint value meaning "no hint".
pub const NO_HINT: u16 = 0xFFFF;

/// Object UUID addressing a device instance.
#[must_use]
pub fn object_uuid(instance: u16, device_id: u16, vendor_id: u16) -> Uuid {
    Uuid::from_u128(
        OBJECT_UUID_BASE
            | (u128::from(instance) << 32)
            | (u128::from(device_id) << 16)
            | u128::from(vendor_id),
    )
}

/// Byte-swap the first three UUID fields (4, 2, and 2 bytes).
///
/// Converts between the canonical big-endian layout and the little-endian
/// wire layout. Applying it twice yields the input.
#[must_use]
pub fn swap_uuid_fields(bytes: [u8; 16]) -> [u8; 16] {
    let mut out = bytes;
    out[0..4].reverse();
    out[4..6].reverse();
    out[6..8].reverse();
    out
}

/// Packet type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PacketType {
    /// Request.
    Request,
    /// Ping.
    Ping,
    /// Response.
    Response,
    /// Fault.
    Fault,
    /// Working.
    Working,
    /// Reject.
    Reject,
    /// Anything else.
    Other(u8),
}

impl PacketType {
    fn to_wire(self) -> u8 {
        match self {
            Self::Request => 0,
            Self::Ping => 1,
            Self::Response => 2,
            Self::Fault => 3,
            Self::Working => 4,
            Self::Reject => 6,
            Self::Other(v) => v,
        }
    }

    fn from_wire(value: u8) -> Self {
        match value {
            0 => Self::Request,
            1 => Self::Ping,
            2 => Self::Response,
            3 => Self::Fault,
            4 => Self::Working,
            6 => Self::Reject,
            v => Self::Other(v),
        }
    }
}

/// Operation numbers of the PNIO interface.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum Opnum {
    /// Establish a session.
    Connect = 0,
    /// Release a session.
    Release = 1,
    /// Record read.
    Read = 2,
    /// Record write.
    Write = 3,
    /// Control (parameter-end, application-ready).
    Control = 4,
}

/// Connectionless RPC header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RpcHeader {
    /// Packet type.
    pub packet_type: PacketType,
    /// Flags1.
    pub flags1: u8,
    /// Flags2.
    pub flags2: u8,
    /// Data representation.
    pub drep: [u8; 3],
    /// Serial number (high byte).
    pub serial_high: u8,
    /// Object UUID.
    pub object: Uuid,
    /// Interface UUID.
    pub interface: Uuid,
    /// Activity UUID.
    pub activity: Uuid,
    /// Server boot time.
    pub server_boot_time: u32,
    /// Interface version.
    pub interface_version: u32,
    /// Sequence number.
    pub sequence_number: u32,
    /// Operation number.
    pub opnum: u16,
    /// Interface hint.
    pub interface_hint: u16,
    /// Activity hint.
    pub activity_hint: u16,
    /// Body length.
    pub fragment_length: u16,
    /// Fragment number.
    pub fragment_number: u16,
    /// Authentication protocol.
    pub auth_protocol: u8,
    /// Serial number (low byte).
    pub serial_low: u8,
}

impl RpcHeader {
    /// Request header with a fresh activity UUID.
    #[must_use]
    pub fn request(
        object: Uuid,
        interface: Uuid,
        opnum: Opnum,
        sequence_number: u32,
        body_length: u16,
    ) -> Self {
        Self {
            packet_type: PacketType::Request,
            flags1: FLAG1_LAST_FRAGMENT | FLAG1_IDEMPOTENT,
            flags2: 0,
            drep: DREP_LITTLE_ENDIAN,
            serial_high: 0,
            object,
            interface,
            activity: Uuid::new_v4(),
            server_boot_time: 0,
            interface_version: INTERFACE_VERSION,
            sequence_number,
            opnum: opnum as u16,
            interface_hint: NO_HINT,
            activity_hint: NO_HINT,
            fragment_length: body_length,
            fragment_number: 0,
            auth_protocol: 0,
            serial_low: 0,
        }
    }

    /// Response header echoing a request's identifiers.
    #[must_use]
    pub fn response_to(request: &RpcHeader, body_length: u16) -> Self {
        Self {
            packet_type: PacketType::Response,
            flags1: FLAG1_LAST_FRAGMENT | FLAG1_NO_FACK,
            flags2: 0,
            drep: DREP_LITTLE_ENDIAN,
            serial_high: 0,
            object: request.object,
            interface: request.interface,
            activity: request.activity,
            server_boot_time: request.server_boot_time,
            interface_version: request.interface_version,
            sequence_number: request.sequence_number,
            opnum: request.opnum,
            interface_hint: NO_HINT,
            activity_hint: NO_HINT,
            fragment_length: body_length,
            fragment_number: 0,
            auth_protocol: 0,
            serial_low: 0,
        }
    }

    /// Packet type.
    #[must_use]
    pub fn packet_type(&self) -> PacketType {
        self.packet_type
    }

    /// Encode little-endian.
    #[must_use]
    pub fn to_bytes(&self) -> [u8; RPC_HEADER_LEN] {
        let mut out = [0u8; RPC_HEADER_LEN];
        out[0] = RPC_VERSION;
        out[1] = self.packet_type.to_wire();
        out[2] = self.flags1;
        out[3] = self.flags2;
        out[4..7].copy_from_slice(&DREP_LITTLE_ENDIAN);
        out[7] = self.serial_high;
        out[8..24].copy_from_slice(&swap_uuid_fields(*self.object.as_bytes()));
        out[24..40].copy_from_slice(&swap_uuid_fields(*self.interface.as_bytes()));
        out[40..56].copy_from_slice(&swap_uuid_fields(*self.activity.as_bytes()));
        out[56..60].copy_from_slice(&self.server_boot_time.to_le_bytes());
        out[60..64].copy_from_slice(&self.interface_version.to_le_bytes());
        out[64..68].copy_from_slice(&self.sequence_number.to_le_bytes());
        out[68..70].copy_from_slice(&self.opnum.to_le_bytes());
        out[70..72].copy_from_slice(&self.interface_hint.to_le_bytes());
        out[72..74].copy_from_slice(&self.activity_hint.to_le_bytes());
        out[74..76].copy_from_slice(&self.fragment_length.to_le_bytes());
        out[76..78].copy_from_slice(&self.fragment_number.to_le_bytes());
        out[78] = self.auth_protocol;
        out[79] = self.serial_low;
        out
    }

    /// Decode, honouring the sender's byte order.
    ///
    /// # Errors
    ///
    /// Returns `PnioError::Malformed` if the input is short or the version is wrong.
    pub fn from_bytes(bytes: &[u8]) -> PnioResult<Self> {
        if bytes.len() < RPC_HEADER_LEN {
            return Err(PnioError::Malformed(format!(
                "RPC header needs {RPC_HEADER_LEN} bytes, got {}",
                bytes.len()
            )));
        }
        if bytes[0] != RPC_VERSION {
            return Err(PnioError::Malformed(format!("RPC version {}", bytes[0])));
        }

        let little = bytes[4] & 0x10 != 0;
        let u16_at = |i: usize| {
            let b = [bytes[i], bytes[i + 1]];
            if little {
                u16::from_le_bytes(b)
            } else {
                u16::from_be_bytes(b)
            }
        };
        let u32_at = |i: usize| {
            let b = [bytes[i], bytes[i + 1], bytes[i + 2], bytes[i + 3]];
            if little {
                u32::from_le_bytes(b)
            } else {
                u32::from_be_bytes(b)
            }
        };
        let uuid_at = |i: usize| {
            let mut raw = [0u8; 16];
            raw.copy_from_slice(&bytes[i..i + 16]);
            if little {
                raw = swap_uuid_fields(raw);
            }
            Uuid::from_bytes(raw)
        };

        Ok(Self {
            packet_type: PacketType::from_wire(bytes[1]),
            flags1: bytes[2],
            flags2: bytes[3],
            drep: [bytes[4], bytes[5], bytes[6]],
            serial_high: bytes[7],
            object: uuid_at(8),
            interface: uuid_at(24),
            activity: uuid_at(40),
            server_boot_time: u32_at(56),
            interface_version: u32_at(60),
            sequence_number: u32_at(64),
            opnum: u16_at(68),
            interface_hint: u16_at(70),
            activity_hint: u16_at(72),
            fragment_length: u16_at(74),
            fragment_number: u16_at(76),
            auth_protocol: bytes[78],
            serial_low: bytes[79],
        })
    }

    /// Whether the body is little-endian.
    #[must_use]
    pub fn is_little_endian(&self) -> bool {
        self.drep[0] & 0x10 != 0
    }
}

/// NDR request header preceding the request blocks.
#[must_use]
pub fn encode_ndr_request(args_maximum: u32, blocks: &[u8]) -> Vec<u8> {
    let len = u32::try_from(blocks.len()).unwrap_or(u32::MAX);
    let mut out = Vec::with_capacity(NDR_HEADER_LEN + blocks.len());
    out.extend_from_slice(&args_maximum.to_le_bytes());
    out.extend_from_slice(&len.to_le_bytes()); // args length
    out.extend_from_slice(&args_maximum.to_le_bytes()); // maximum count
    out.extend_from_slice(&0u32.to_le_bytes()); // offset
    out.extend_from_slice(&len.to_le_bytes()); // actual count
    out.extend_from_slice(blocks);
    out
}

/// NDR response header (status first) preceding the response blocks.
#[must_use]
pub fn encode_ndr_response(status: PnioStatus, blocks: &[u8]) -> Vec<u8> {
    let len = u32::try_from(blocks.len()).unwrap_or(u32::MAX);
    let mut out = Vec::with_capacity(NDR_HEADER_LEN + blocks.len());
    out.extend_from_slice(&status.to_bytes());
    out.extend_from_slice(&len.to_le_bytes());
    out.extend_from_slice(&len.to_le_bytes());
    out.extend_from_slice(&0u32.to_le_bytes());
    out.extend_from_slice(&len.to_le_bytes());
    out.extend_from_slice(blocks);
    out
}

/// Block payload of an NDR body, bounded by its args-length field.
///
/// # Errors
///
/// Returns `PnioError::Malformed` if the body is shorter than its header claims.
pub fn ndr_blocks(body: &[u8], little_endian: bool) -> PnioResult<&[u8]> {
    if body.len() < NDR_HEADER_LEN {
        return Err(PnioError::Malformed(format!(
            "NDR header needs {NDR_HEADER_LEN} bytes, got {}",
            body.len()
        )));
    }
    let raw = [body[4], body[5], body[6], body[7]];
    let args_length = if little_endian {
        u32::from_le_bytes(raw)
    } else {
        u32::from_be_bytes(raw)
    } as usize;
    let end = NDR_HEADER_LEN + args_length;
    body.get(NDR_HEADER_LEN..end).ok_or_else(|| {
        PnioError::Malformed(format!(
            "NDR args length {args_length} exceeds body of {} bytes",
            body.len() - NDR_HEADER_LEN
        ))
    })
}

/// A received datagram with its decoded header.
#[derive(Debug, Clone)]
pub struct RpcMessage {
    /// Decoded header.
    pub header: RpcHeader,
    /// The complete datagram, header included.
    pub datagram: Vec<u8>,
    /// Sender address.
    pub peer: SocketAddr,
}

impl RpcMessage {
    /// Bytes after the RPC header.
    #[must_use]
    pub fn body(&self) -> &[u8] {
        &self.datagram[RPC_HEADER_LEN..]
    }

    /// Block payload after the NDR header.
    ///
    /// # Errors
    ///
    /// Returns `PnioError::Malformed` if the NDR header is truncated.
    pub fn blocks(&self) -> PnioResult<&[u8]> {
        ndr_blocks(self.body(), self.header.is_little_endian())
    }
}

const MAX_DATAGRAM: usize = 65_535;

/// Device requests held for `recv_request`; the oldest is dropped beyond this.
pub const MAX_PENDING_REQUESTS: usize = 16;

/// UDP endpoint shared by all connection and control traffic.
#[derive(Debug)]
pub struct RpcEndpoint {
    socket: UdpSocket,
    args_maximum: u32,
    sequence: AtomicU32,
    // Device-initiated requests that arrived while a call was waiting
    pending: Mutex<VecDeque<RpcMessage>>,
}

impl RpcEndpoint {
    /// Bind the endpoint.
    ///
    /// # Errors
    ///
    /// Returns `PnioError::Io` if the socket cannot be bound.
    pub fn bind(addr: SocketAddr, args_maximum: u32) -> PnioResult<Self> {
        let socket = UdpSocket::bind(addr)?;
        debug!(local = ?socket.local_addr().ok(), "RPC endpoint bound");
        Ok(Self {
            socket,
            args_maximum,
            sequence: AtomicU32::new(0),
            pending: Mutex::new(VecDeque::new()),
        })
    }

    /// Local address.
    ///
    /// # Errors
    ///
    /// Returns `PnioError::Io` if the socket has no local address.
    pub fn local_addr(&self) -> PnioResult<SocketAddr> {
        Ok(self.socket.local_addr()?)
    }

    fn next_sequence(&self) -> u32 {
        self.sequence.fetch_add(1, Ordering::Relaxed)
    }

    fn build_request(
        &self,
        object: Uuid,
        opnum: Opnum,
        blocks: &[u8],
    ) -> PnioResult<(RpcHeader, Vec<u8>)> {
        let body = encode_ndr_request(self.args_maximum, blocks);
        let body_length = u16::try_from(body.len())
            .map_err(|_| PnioError::Malformed(format!("request body of {} bytes", body.len())))?;
        let header = RpcHeader::request(
            object,
            PNIO_DEVICE_INTERFACE,
            opnum,
            self.next_sequence(),
            body_length,
        );
        let mut datagram = Vec::with_capacity(RPC_HEADER_LEN + body.len());
        datagram.extend_from_slice(&header.to_bytes());
        datagram.extend_from_slice(&body);
        Ok((header, datagram))
    }

    /// Send a request and wait for the matching response.
    ///
    /// # Errors
    ///
    /// Returns:
    /// - `PnioError::TransportTimeout` if no matching response arrives in time
    /// - `PnioError::ConnectRejected` if the peer answers with a fault or reject
    /// - `PnioError::Io` on socket failure
    pub fn call(
        &self,
        peer: SocketAddr,
        object: Uuid,
        opnum: Opnum,
        blocks: &[u8],
        timeout: Duration,
    ) -> PnioResult<RpcMessage> {
        let (request, datagram) = self.build_request(object, opnum, blocks)?;
        self.socket.send_to(&datagram, peer)?;
        debug!(
            %peer,
            opnum = request.opnum,
            seq = request.sequence_number,
            activity = %request.activity,
            len = datagram.len(),
            "RPC request sent"
        );

        let deadline = Instant::now() + timeout;
        loop {
            let Some(message) = self.recv_until(deadline)? else {
                return Err(PnioError::TransportTimeout(format!(
                    "no response to opnum {} from {peer} within {timeout:?}",
                    request.opnum
                )));
            };
            if message.header.activity != request.activity {
                if message.header.packet_type == PacketType::Request {
                    trace!(from = %message.peer, "Queueing device request received during call");
                    self.queue_request(message);
                } else {
                    trace!(from = %message.peer, "Ignoring datagram for another activity");
                }
                continue;
            }
            match message.header.packet_type {
                PacketType::Response => return Ok(message),
                PacketType::Fault | PacketType::Reject => {
                    let code = message
                        .body()
                        .get(..4)
                        .map(|b| u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
                        .unwrap_or(0);
                    return Err(PnioError::ConnectRejected {
                        status: format!("{:#010x}", code),
                        block: "RPC".into(),
                        reason: 0,
                    });
                }
                other => {
                    trace!(?other, "Ignoring non-response packet for our activity");
                }
            }
        }
    }

    /// Send a request without waiting for a response.
    ///
    /// # Errors
    ///
    /// Returns `PnioError::Io` on socket failure.
    pub fn notify(
        &self,
        peer: SocketAddr,
        object: Uuid,
        opnum: Opnum,
        blocks: &[u8],
    ) -> PnioResult<()> {
        let (request, datagram) = self.build_request(object, opnum, blocks)?;
        self.socket.send_to(&datagram, peer)?;
        debug!(%peer, opnum = request.opnum, "RPC notification sent");
        Ok(())
    }

    /// Wait for a device-initiated request.
    ///
    /// Returns `Ok(None)` once `deadline` passes.
    ///
    /// # Errors
    ///
    /// Returns `PnioError::Io` on socket failure.
    pub fn recv_request(&self, deadline: Instant) -> PnioResult<Option<RpcMessage>> {
        if let Some(message) = self.pending.lock().ok().and_then(|mut q| q.pop_front()) {
            return Ok(Some(message));
        }
        loop {
            let Some(message) = self.recv_until(deadline)? else {
                return Ok(None);
            };
            if message.header.packet_type == PacketType::Request {
                return Ok(Some(message));
            }
            trace!(
                from = %message.peer,
                kind = ?message.header.packet_type,
                "Ignoring non-request datagram"
            );
        }
    }

    /// Answer a device-initiated request.
    ///
    /// # Errors
    ///
    /// Returns `PnioError::Io` on socket failure.
    pub fn respond(
        &self,
        request: &RpcMessage,
        status: PnioStatus,
        blocks: &[u8],
    ) -> PnioResult<()> {
        let body = encode_ndr_response(status, blocks);
        let body_length = u16::try_from(body.len())
            .map_err(|_| PnioError::Malformed(format!("response body of {} bytes", body.len())))?;
        let header = RpcHeader::response_to(&request.header, body_length);
        let mut datagram = Vec::with_capacity(RPC_HEADER_LEN + body.len());
        datagram.extend_from_slice(&header.to_bytes());
        datagram.extend_from_slice(&body);
        self.socket.send_to(&datagram, request.peer)?;
        debug!(peer = %request.peer, opnum = header.opnum, "RPC response sent");
        Ok(())
    }

    fn queue_request(&self, message: RpcMessage) {
        if let Ok(mut queue) = self.pending.lock() {
            if queue.len() >= MAX_PENDING_REQUESTS {
                if let Some(dropped) = queue.pop_front() {
                    warn!(
                        from = %dropped.peer,
                        activity = %dropped.header.activity,
                        "Pending request queue full, oldest request dropped"
                    );
                }
            }
            queue.push_back(message);
        }
    }

    fn recv_until(&self, deadline: Instant) -> PnioResult<Option<RpcMessage>> {
        let mut buf = vec![0u8; MAX_DATAGRAM];
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Ok(None);
            }
            self.socket.set_read_timeout(Some(remaining))?;
            let (len, peer) = match self.socket.recv_from(&mut buf) {
                Ok(received) => received,
                Err(e)
                    if matches!(e.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut) =>
                {
                    return Ok(None);
                }
                Err(e) => return Err(e.into()),
            };
            match RpcHeader::from_bytes(&buf[..len]) {
                Ok(header) => {
                    return Ok(Some(RpcMessage {
                        header,
                        datagram: buf[..len].to_vec(),
                        peer,
                    }));
                }
                Err(e) => warn!(%peer, len, error = %e, "Discarding malformed RPC datagram"),
            }
        }
    }
}
