//! DCP identify: find devices on the local segment.
//!
//! One identify request is multicast; every response that arrives before
//! the deadline and carries our transaction id becomes a
//! [`DeviceIdentity`]. A malformed response is logged and dropped on its
//! own, and silence is an empty result rather than an error.

use crate::device::DeviceIdentity;
use crate::ethernet::{build_frame, EthernetFrame, EthernetLink, ETHERTYPE_PROFINET, ETH_MAX_FRAME};
use crate::wire::ByteReader;
use pnio_common::error::{PnioError, PnioResult};
use pnio_common::mac::MacAddress;
use std::net::Ipv4Addr;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, trace, warn};

/// Identify multicast address.
pub const DCP_MULTICAST: MacAddress = MacAddress::new([0x01, 0x0E, 0xCF, 0x00, 0x00, 0x00]);

/// Frame id of identify requests.
pub const FRAME_ID_IDENTIFY_REQUEST: u16 = 0xFEFE;
/// Frame id of identify responses.
pub const FRAME_ID_IDENTIFY_RESPONSE: u16 = 0xFEFF;

const SERVICE_ID_IDENTIFY: u8 = 0x05;
const SERVICE_TYPE_REQUEST: u8 = 0x00;
const SERVICE_TYPE_RESPONSE_SUCCESS: u8 = 0x01;

const OPTION_IP: u8 = 0x01;
const SUBOPTION_IP_PARAMETER: u8 = 0x02;
const OPTION_DEVICE: u8 = 0x02;
const SUBOPTION_NAME_OF_STATION: u8 = 0x02;
const SUBOPTION_DEVICE_ID: u8 = 0x03;
const OPTION_ALL: u8 = 0xFF;
const SUBOPTION_ALL: u8 = 0xFF;

/// Frame id plus DCP header.
const DCP_HEADER_LEN: usize = 12;

/// A decoded identify response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IdentifyResponse {
    /// Transaction id echoed by the device.
    pub xid: u32,
    /// Device identity (MAC from the frame source).
    pub identity: DeviceIdentity,
}

fn push_request_block(out: &mut Vec<u8>, option: u8, suboption: u8, value: &[u8]) {
    out.push(option);
    out.push(suboption);
    out.extend_from_slice(&u16::try_from(value.len()).unwrap_or(u16::MAX).to_be_bytes());
    out.extend_from_slice(value);
    if value.len() % 2 == 1 {
        out.push(0);
    }
}

fn push_response_block(out: &mut Vec<u8>, option: u8, suboption: u8, value: &[u8]) {
    out.push(option);
    out.push(suboption);
    out.extend_from_slice(&u16::try_from(value.len() + 2).unwrap_or(u16::MAX).to_be_bytes());
    out.extend_from_slice(&0u16.to_be_bytes()); // block info
    out.extend_from_slice(value);
    if value.len() % 2 == 1 {
        out.push(0);
    }
}

fn dcp_payload(frame_id: u16, service_type: u8, xid: u32, delay: u16, blocks: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(DCP_HEADER_LEN + blocks.len());
    out.extend_from_slice(&frame_id.to_be_bytes());
    out.push(SERVICE_ID_IDENTIFY);
    out.push(service_type);
    out.extend_from_slice(&xid.to_be_bytes());
    out.extend_from_slice(&delay.to_be_bytes());
    out.extend_from_slice(&u16::try_from(blocks.len()).unwrap_or(u16::MAX).to_be_bytes());
    out.extend_from_slice(blocks);
    out
}

/// Identify request payload (everything after the ethertype).
///
/// With a filter, only the device with that station name should answer.
#[must_use]
pub fn encode_identify_request(xid: u32, filter: Option<&str>, response_delay: u16) -> Vec<u8> {
    let mut blocks = Vec::new();
    match filter {
        Some(name) => push_request_block(
            &mut blocks,
            OPTION_DEVICE,
            SUBOPTION_NAME_OF_STATION,
            name.as_bytes(),
        ),
        None => push_request_block(&mut blocks, OPTION_ALL, SUBOPTION_ALL, &[]),
    }
    dcp_payload(FRAME_ID_IDENTIFY_REQUEST, SERVICE_TYPE_REQUEST, xid, response_delay, &blocks)
}

/// Identify response payload, as a device would send it.
#[must_use]
pub fn encode_identify_response(xid: u32, identity: &DeviceIdentity) -> Vec<u8> {
    let mut blocks = Vec::new();
    push_response_block(
        &mut blocks,
        OPTION_DEVICE,
        SUBOPTION_NAME_OF_STATION,
        identity.station_name.as_bytes(),
    );
    let mut ip = Vec::with_capacity(12);
    ip.extend_from_slice(&identity.ip.octets());
    ip.extend_from_slice(&[255, 255, 255, 0]);
    ip.extend_from_slice(&Ipv4Addr::UNSPECIFIED.octets());
    push_response_block(&mut blocks, OPTION_IP, SUBOPTION_IP_PARAMETER, &ip);
    let mut ids = Vec::with_capacity(4);
    ids.extend_from_slice(&identity.vendor_id.to_be_bytes());
    ids.extend_from_slice(&identity.device_id.to_be_bytes());
    push_response_block(&mut blocks, OPTION_DEVICE, SUBOPTION_DEVICE_ID, &ids);
    dcp_payload(FRAME_ID_IDENTIFY_RESPONSE, SERVICE_TYPE_RESPONSE_SUCCESS, xid, 0, &blocks)
}

/// Decode an identify response payload.
///
/// Returns `Ok(None)` for frames that are not successful identify responses.
///
/// # Errors
///
/// Returns `PnioError::Malformed` if a block is truncated or the station
/// name is missing.
pub fn decode_identify_response(
    payload: &[u8],
    src: MacAddress,
) -> PnioResult<Option<IdentifyResponse>> {
    let mut r = ByteReader::new(payload, "DCP header");
    if r.remaining() < DCP_HEADER_LEN {
        return Ok(None);
    }
    let frame_id = r.u16()?;
    let service_id = r.u8()?;
    let service_type = r.u8()?;
    if frame_id != FRAME_ID_IDENTIFY_RESPONSE
        || service_id != SERVICE_ID_IDENTIFY
        || service_type != SERVICE_TYPE_RESPONSE_SUCCESS
    {
        return Ok(None);
    }
    let xid = r.u32()?;
    let _reserved = r.u16()?;
    let data_length = usize::from(r.u16()?);
    let data = r.bytes(data_length)?;

    let mut station_name = None;
    let mut ip = Ipv4Addr::UNSPECIFIED;
    let mut vendor_id = 0;
    let mut device_id = 0;

    let mut blocks = ByteReader::new(data, "DCP block");
    while blocks.remaining() >= 4 {
        let option = blocks.u8()?;
        let suboption = blocks.u8()?;
        let length = usize::from(blocks.u16()?);
        let value = blocks.bytes(length)?;
        if length % 2 == 1 && blocks.remaining() > 0 {
            blocks.skip(1)?;
        }
        if length < 2 {
            continue;
        }
        // Response blocks lead with two bytes of block info
        let mut v = ByteReader::new(&value[2..], "DCP block value");
        match (option, suboption) {
            (OPTION_DEVICE, SUBOPTION_NAME_OF_STATION) => {
                let raw = v.bytes(v.remaining())?;
                let name = std::str::from_utf8(raw)
                    .map_err(|_| PnioError::Malformed("NameOfStation is not UTF-8".into()))?;
                station_name = Some(name.trim_end_matches('\0').to_string());
            }
            (OPTION_IP, SUBOPTION_IP_PARAMETER) => {
                let octets = v.bytes(4)?;
                ip = Ipv4Addr::new(octets[0], octets[1], octets[2], octets[3]);
            }
            (OPTION_DEVICE, SUBOPTION_DEVICE_ID) => {
                vendor_id = v.u16()?;
                device_id = v.u16()?;
            }
            _ => {}
        }
    }

    let station_name = station_name
        .filter(|name| !name.is_empty())
        .ok_or_else(|| {
            PnioError::Malformed(format!("identify response from {src} has no station name"))
        })?;

    Ok(Some(IdentifyResponse {
        xid,
        identity: DeviceIdentity {
            station_name,
            ip,
            mac: src,
            vendor_id,
            device_id,
        },
    }))
}

/// Sends identify requests and collects the answers.
pub struct Discoverer {
    link: Arc<dyn EthernetLink>,
    response_delay: u16,
    next_xid: AtomicU32,
}

impl std::fmt::Debug for Discoverer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Discoverer")
            .field("mac", &self.link.mac())
            .field("response_delay", &self.response_delay)
            .finish_non_exhaustive()
    }
}

impl Discoverer {
    /// Create a discoverer on `link`.
    #[must_use]
    pub fn new(link: Arc<dyn EthernetLink>, response_delay: u16) -> Self {
        let seed = (uuid::Uuid::new_v4().as_u128() & 0xFFFF_FFFF) as u32;
        Self {
            link,
            response_delay,
            next_xid: AtomicU32::new(seed),
        }
    }

    /// Identify devices, optionally only the one named `filter`.
    ///
    /// Duplicate answers from the same MAC are collapsed.
    ///
    /// # Errors
    ///
    /// Returns `PnioError::Io` if the request cannot be sent. Timeouts and
    /// malformed responses never fail the call.
    pub fn discover(
        &self,
        filter: Option<&str>,
        timeout: Duration,
    ) -> PnioResult<Vec<DeviceIdentity>> {
        let xid = self.next_xid.fetch_add(1, Ordering::Relaxed);
        let mut channel = self.link.open_channel()?;

        let request = encode_identify_request(xid, filter, self.response_delay);
        let frame = build_frame(DCP_MULTICAST, self.link.mac(), ETHERTYPE_PROFINET, &request);
        channel.send(&frame)?;
        debug!(xid, filter, ?timeout, "DCP identify sent");

        let deadline = Instant::now() + timeout;
        let mut found: Vec<DeviceIdentity> = Vec::new();
        let mut buf = vec![0u8; ETH_MAX_FRAME];

        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                break;
            }
            let Some(len) = channel.recv(&mut buf, remaining)? else {
                break;
            };
            let Some(eth) = EthernetFrame::parse(&buf[..len]) else {
                continue;
            };
            if eth.ethertype != ETHERTYPE_PROFINET {
                continue;
            }

            let response = match decode_identify_response(eth.payload, eth.src) {
                Ok(Some(response)) => response,
                Ok(None) => continue,
                Err(e) => {
                    warn!(src = %eth.src, error = %e, "Dropping malformed identify response");
                    continue;
                }
            };
            if response.xid != xid {
                trace!(
                    src = %eth.src,
                    got = response.xid,
                    want = xid,
                    "Identify response for another request"
                );
                continue;
            }
            if let Some(name) = filter {
                if response.identity.station_name != name {
                    continue;
                }
            }
            if found.iter().any(|d| d.mac == response.identity.mac) {
                continue;
            }
            debug!(
                device = %response.identity.station_name,
                ip = %response.identity.ip,
                mac = %response.identity.mac,
                "Device identified"
            );
            found.push(response.identity);
        }

        info!(count = found.len(), filter, "DCP identify complete");
        Ok(found)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ethernet::{FrameChannel, SimulatedLink};

    const CONTROLLER: MacAddress = MacAddress::new([0x02, 0, 0, 0, 0, 0x01]);
    const DEVICE: MacAddress = MacAddress::new([0x00, 0x1B, 0x1B, 0x11, 0x22, 0x33]);

    fn identity(name: &str) -> DeviceIdentity {
        DeviceIdentity {
            station_name: name.into(),
            ip: Ipv4Addr::new(192, 168, 0, 10),
            mac: DEVICE,
            vendor_id: 0x002A,
            device_id: 0x0302,
        }
    }

    #[test]
    fn test_identify_request_all_selector() {
        let payload = encode_identify_request(0x1234_5678, None, 1);
        assert_eq!(
            payload,
            vec![
                0xFE, 0xFE, 0x05, 0x00, 0x12, 0x34, 0x56, 0x78, 0x00, 0x01, 0x00, 0x04, 0xFF, 0xFF,
                0x00, 0x00
            ]
        );
    }

    #[test]
    fn test_identify_request_name_filter_padded() {
        let payload = encode_identify_request(1, Some("io-1a"), 1);
        // 5-byte name padded to even length
        assert_eq!(&payload[10..12], &[0x00, 0x0A]);
        assert_eq!(&payload[12..16], &[0x02, 0x02, 0x00, 0x05]);
        assert_eq!(&payload[16..21], b"io-1a");
        assert_eq!(payload[21], 0);
    }

    #[test]
    fn test_response_roundtrip() {
        let payload = encode_identify_response(99, &identity("et200sp-1"));
        let response = decode_identify_response(&payload, DEVICE).unwrap().unwrap();
        assert_eq!(response.xid, 99);
        assert_eq!(response.identity, identity("et200sp-1"));
    }

    #[test]
    fn test_non_response_frames_are_ignored() {
        let request = encode_identify_request(1, None, 1);
        assert_eq!(decode_identify_response(&request, DEVICE).unwrap(), None);
        assert_eq!(decode_identify_response(&[0x80, 0x01], DEVICE).unwrap(), None);
    }

    #[test]
    fn test_truncated_response_is_malformed() {
        let mut payload = encode_identify_response(5, &identity("et200sp-1"));
        let claimed = payload.len() - DCP_HEADER_LEN + 8;
        payload[10..12].copy_from_slice(&(claimed as u16).to_be_bytes());
        assert!(decode_identify_response(&payload, DEVICE).is_err());
    }

    #[test]
    fn test_discover_with_no_devices_is_empty() {
        let link = SimulatedLink::new(CONTROLLER);
        let discoverer = Discoverer::new(Arc::new(link), 1);
        let start = Instant::now();
        let devices = discoverer.discover(None, Duration::from_millis(100)).unwrap();
        assert!(devices.is_empty());
        assert!(start.elapsed() >= Duration::from_millis(100));
    }

    #[test]
    fn test_discover_collects_matching_response() {
        let link = SimulatedLink::new(CONTROLLER);
        let peer = link.attach(DEVICE);
        let mut device = peer.channel();

        let responder = std::thread::spawn(move || {
            let mut buf = [0u8; ETH_MAX_FRAME];
            let len = device.recv(&mut buf, Duration::from_secs(2)).unwrap().unwrap();
            let eth = EthernetFrame::parse(&buf[..len]).unwrap();
            assert_eq!(eth.dst, DCP_MULTICAST);
            let mut xid = [0u8; 4];
            xid.copy_from_slice(&eth.payload[4..8]);
            let xid = u32::from_be_bytes(xid);

            // Stale transaction first, then the real answer twice
            for id in [xid.wrapping_sub(1), xid, xid] {
                let reply = encode_identify_response(id, &identity("et200sp-1"));
                device.send(&build_frame(CONTROLLER, DEVICE, ETHERTYPE_PROFINET, &reply)).unwrap();
            }
        });

        let discoverer = Discoverer::new(Arc::new(link), 1);
        let devices = discoverer.discover(None, Duration::from_millis(300)).unwrap();
        responder.join().unwrap();

        assert_eq!(devices, vec![identity("et200sp-1")]);
    }
}
