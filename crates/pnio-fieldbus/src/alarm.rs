//! Alarm transport acknowledgement.
//!
//! Devices report alarms as RTA-DATA PDUs on frame id 0xFC01 (high
//! priority) or 0xFE01 (low). The controller answers each with an RTA-ACK
//! so the device does not retransmit. Alarm contents are not interpreted.

use crate::wire::ByteReader;
use pnio_common::error::{PnioError, PnioResult};
use tracing::{debug, trace};

/// High-priority alarm frame id.
pub const FRAME_ID_ALARM_HIGH: u16 = 0xFC01;
/// Low-priority alarm frame id.
pub const FRAME_ID_ALARM_LOW: u16 = 0xFE01;

/// RTA header length after the frame id.
pub const RTA_HEADER_LEN: usize = 12;

const RTA_VERSION: u8 = 1;
const ADD_FLAGS_WINDOW_ONE: u8 = 0x01;

/// RTA PDU type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RtaPduType {
    /// Alarm payload.
    Data,
    /// Negative acknowledgement.
    Nack,
    /// Acknowledgement.
    Ack,
    /// Error.
    Err,
    /// Anything else.
    Other(u8),
}

impl RtaPduType {
    fn to_wire(self) -> u8 {
        match self {
            Self::Data => 1,
            Self::Nack => 2,
            Self::Ack => 3,
            Self::Err => 4,
            Self::Other(v) => v & 0x0F,
        }
    }

    fn from_wire(value: u8) -> Self {
        match value & 0x0F {
            1 => Self::Data,
            2 => Self::Nack,
            3 => Self::Ack,
            4 => Self::Err,
            v => Self::Other(v),
        }
    }
}

/// Whether a frame id belongs to the alarm channel.
#[must_use]
pub fn is_alarm_frame(frame_id: u16) -> bool {
    frame_id == FRAME_ID_ALARM_HIGH || frame_id == FRAME_ID_ALARM_LOW
}

/// RTA PDU header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RtaHeader {
    /// Receiver endpoint reference.
    pub dst_endpoint: u16,
    /// Sender endpoint reference.
    pub src_endpoint: u16,
    /// PDU type.
    pub pdu_type: RtaPduType,
    /// Protocol version (high nibble of the type octet).
    pub version: u8,
    /// Window size and TACK flag.
    pub add_flags: u8,
    /// Sender sequence number.
    pub send_seq: u16,
    /// Acknowledged sequence number.
    pub ack_seq: u16,
    /// Length of the variable part.
    pub var_part_len: u16,
}

impl RtaHeader {
    /// Decode the header following the frame id.
    ///
    /// # Errors
    ///
    /// Returns `PnioError::Malformed` if fewer than 12 bytes are present.
    pub fn decode(bytes: &[u8]) -> PnioResult<Self> {
        let mut r = ByteReader::new(bytes, "RTA header");
        let dst_endpoint = r.u16()?;
        let src_endpoint = r.u16()?;
        let type_octet = r.u8()?;
        Ok(Self {
            dst_endpoint,
            src_endpoint,
            pdu_type: RtaPduType::from_wire(type_octet),
            version: type_octet >> 4,
            add_flags: r.u8()?,
            send_seq: r.u16()?,
            ack_seq: r.u16()?,
            var_part_len: r.u16()?,
        })
    }

    /// Encode frame id plus header.
    #[must_use]
    pub fn encode(&self, frame_id: u16) -> Vec<u8> {
        let mut out = Vec::with_capacity(2 + RTA_HEADER_LEN);
        out.extend_from_slice(&frame_id.to_be_bytes());
        out.extend_from_slice(&self.dst_endpoint.to_be_bytes());
        out.extend_from_slice(&self.src_endpoint.to_be_bytes());
        out.push((self.version << 4) | self.pdu_type.to_wire());
        out.push(self.add_flags);
        out.extend_from_slice(&self.send_seq.to_be_bytes());
        out.extend_from_slice(&self.ack_seq.to_be_bytes());
        out.extend_from_slice(&self.var_part_len.to_be_bytes());
        out
    }
}

/// Acknowledges alarm PDUs for one session.
#[derive(Debug, Clone)]
pub struct AlarmResponder {
    local_reference: u16,
    last_send_seq: u16,
    acknowledged: u64,
}

impl AlarmResponder {
    /// Responder using `local_reference` as our endpoint.
    #[must_use]
    pub fn new(local_reference: u16) -> Self {
        Self {
            local_reference,
            // Nothing sent yet
            last_send_seq: 0xFFFF,
            acknowledged: 0,
        }
    }

    /// Alarms acknowledged so far.
    #[must_use]
    pub fn acknowledged(&self) -> u64 {
        self.acknowledged
    }

    /// Handle an alarm-channel payload (frame id included).
    ///
    /// Returns the ACK payload to send back for RTA-DATA; other PDU types
    /// need no answer.
    ///
    /// # Errors
    ///
    /// Returns `PnioError::Malformed` if the PDU is truncated.
    pub fn handle(&mut self, payload: &[u8]) -> PnioResult<Option<Vec<u8>>> {
        let mut r = ByteReader::new(payload, "alarm frame");
        let frame_id = r.u16()?;
        if !is_alarm_frame(frame_id) {
            return Err(PnioError::Malformed(format!(
                "frame id {frame_id:#06x} is not an alarm frame"
            )));
        }
        let header = RtaHeader::decode(&payload[2..])?;

        match header.pdu_type {
            RtaPduType::Data => {
                let ack = RtaHeader {
                    dst_endpoint: header.src_endpoint,
                    src_endpoint: self.local_reference,
                    pdu_type: RtaPduType::Ack,
                    version: RTA_VERSION,
                    add_flags: ADD_FLAGS_WINDOW_ONE,
                    send_seq: self.last_send_seq,
                    ack_seq: header.send_seq,
                    var_part_len: 0,
                };
                self.acknowledged += 1;
                debug!(
                    frame_id,
                    remote = header.src_endpoint,
                    seq = header.send_seq,
                    len = header.var_part_len,
                    "Acknowledging alarm"
                );
                Ok(Some(ack.encode(frame_id)))
            }
            other => {
                trace!(frame_id, pdu = ?other, "Alarm PDU needs no answer");
                Ok(None)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn data_pdu(frame_id: u16, src: u16, seq: u16) -> Vec<u8> {
        let mut out = RtaHeader {
            dst_endpoint: 1,
            src_endpoint: src,
            pdu_type: RtaPduType::Data,
            version: 1,
            add_flags: 0x11,
            send_seq: seq,
            ack_seq: 0xFFFF,
            var_part_len: 4,
        }
        .encode(frame_id);
        out.extend_from_slice(&[0xDE, 0xAD, 0xBE, 0xEF]);
        out
    }

    #[test]
    fn test_ack_for_data() {
        let mut responder = AlarmResponder::new(0x0001);
        let ack = responder.handle(&data_pdu(FRAME_ID_ALARM_HIGH, 0x0042, 7)).unwrap().unwrap();

        assert_eq!(&ack[0..2], &[0xFC, 0x01]);
        let header = RtaHeader::decode(&ack[2..]).unwrap();
        assert_eq!(header.dst_endpoint, 0x0042);
        assert_eq!(header.src_endpoint, 0x0001);
        assert_eq!(header.pdu_type, RtaPduType::Ack);
        assert_eq!(ack[6], 0x13);
        assert_eq!(header.ack_seq, 7);
        assert_eq!(header.send_seq, 0xFFFF);
        assert_eq!(header.var_part_len, 0);
        assert_eq!(responder.acknowledged(), 1);
    }

    #[test]
    fn test_low_priority_keeps_frame_id() {
        let mut responder = AlarmResponder::new(1);
        let ack = responder.handle(&data_pdu(FRAME_ID_ALARM_LOW, 2, 0)).unwrap().unwrap();
        assert_eq!(&ack[0..2], &[0xFE, 0x01]);
    }

    #[test]
    fn test_ack_needs_no_answer() {
        let mut responder = AlarmResponder::new(1);
        let mut ack = data_pdu(FRAME_ID_ALARM_HIGH, 2, 0);
        ack[6] = 0x13;
        assert_eq!(responder.handle(&ack).unwrap(), None);
        assert_eq!(responder.acknowledged(), 0);
    }

    #[test]
    fn test_truncated_pdu() {
        let mut responder = AlarmResponder::new(1);
        assert!(responder.handle(&[0xFC, 0x01, 0x00]).is_err());
        assert!(responder.handle(&[0x80, 0x01, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0]).is_err());
    }
}
