//! Raw Ethernet link abstraction.
//!
//! Discovery, cyclic exchange, and alarm acknowledgement all travel as raw
//! Ethernet frames with ethertype 0x8892. Every consumer opens its own
//! [`FrameChannel`] on the shared [`EthernetLink`]; each channel sees a copy
//! of every inbound frame and sends are serialized by the link itself.
//!
//! Two backends are provided:
//! - [`SimulatedLink`]: an in-memory hub for tests and dry runs
//! - `PacketSocketLink`: Linux `AF_PACKET` raw sockets (requires CAP_NET_RAW)

use pnio_common::error::{PnioError, PnioResult};
use pnio_common::mac::MacAddress;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{mpsc, Arc, Mutex};
use std::time::Duration;
use tracing::{debug, trace};

/// PROFINET real-time ethertype.
pub const ETHERTYPE_PROFINET: u16 = 0x8892;

/// IEEE 802.1Q VLAN tag ethertype.
pub const ETHERTYPE_VLAN: u16 = 0x8100;

/// Untagged Ethernet header length.
pub const ETH_HEADER_LEN: usize = 14;

/// Minimum Ethernet payload (frames are zero-padded up to this).
pub const ETH_MIN_PAYLOAD: usize = 46;

/// Largest frame the controller will receive.
pub const ETH_MAX_FRAME: usize = 1522;

/// Frames a simulated channel buffers before further frames are dropped,
/// like a full receive ring.
pub const SIMULATED_QUEUE_DEPTH: usize = 256;

/// A parsed Ethernet frame borrowing its payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EthernetFrame<'a> {
    /// Destination address.
    pub dst: MacAddress,
    /// Source address.
    pub src: MacAddress,
    /// Ethertype after any VLAN tag.
    pub ethertype: u16,
    /// Bytes following the ethertype.
    pub payload: &'a [u8],
}

impl<'a> EthernetFrame<'a> {
    /// Parse a frame, skipping a single 802.1Q tag if present.
    #[must_use]
    pub fn parse(bytes: &'a [u8]) -> Option<Self> {
        if bytes.len() < ETH_HEADER_LEN {
            return None;
        }
        let dst = MacAddress::from_slice(&bytes[0..6])?;
        let src = MacAddress::from_slice(&bytes[6..12])?;
        let mut ethertype = u16::from_be_bytes([bytes[12], bytes[13]]);
        let mut offset = ETH_HEADER_LEN;

        if ethertype == ETHERTYPE_VLAN {
            if bytes.len() < ETH_HEADER_LEN + 4 {
                return None;
            }
            ethertype = u16::from_be_bytes([bytes[16], bytes[17]]);
            offset += 4;
        }

        Some(Self {
            dst,
            src,
            ethertype,
            payload: &bytes[offset..],
        })
    }
}

/// Build an untagged frame, zero-padding short payloads to the Ethernet minimum.
#[must_use]
pub fn build_frame(dst: MacAddress, src: MacAddress, ethertype: u16, payload: &[u8]) -> Vec<u8> {
    let mut frame = Vec::with_capacity(ETH_HEADER_LEN + payload.len().max(ETH_MIN_PAYLOAD));
    frame.extend_from_slice(&dst.octets());
    frame.extend_from_slice(&src.octets());
    frame.extend_from_slice(&ethertype.to_be_bytes());
    frame.extend_from_slice(payload);
    if payload.len() < ETH_MIN_PAYLOAD {
        frame.resize(ETH_HEADER_LEN + ETH_MIN_PAYLOAD, 0);
    }
    frame
}

/// A network interface capable of carrying raw PROFINET frames.
pub trait EthernetLink: Send + Sync {
    /// Hardware address of the controller on this link.
    fn mac(&self) -> MacAddress;

    /// Open an independent send/receive channel.
    fn open_channel(&self) -> PnioResult<Box<dyn FrameChannel>>;
}

/// One consumer's view of an [`EthernetLink`].
pub trait FrameChannel: Send {
    /// Transmit a complete Ethernet frame.
    fn send(&mut self, frame: &[u8]) -> PnioResult<()>;

    /// Receive one frame into `buf`, waiting at most `timeout`.
    ///
    /// Returns `Ok(None)` when the timeout elapses without a frame.
    fn recv(&mut self, buf: &mut [u8], timeout: Duration) -> PnioResult<Option<usize>>;
}

/// Shared state of a simulated segment.
#[derive(Debug, Default)]
struct Hub {
    ports: Mutex<Vec<HubPort>>,
    next_id: AtomicUsize,
    fail_sends: AtomicBool,
}

#[derive(Debug)]
struct HubPort {
    id: usize,
    tx: mpsc::SyncSender<Vec<u8>>,
}

impl Hub {
    fn attach(self: &Arc<Self>) -> SimulatedChannel {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::sync_channel(SIMULATED_QUEUE_DEPTH);
        if let Ok(mut ports) = self.ports.lock() {
            ports.push(HubPort { id, tx });
        }
        SimulatedChannel {
            id,
            rx,
            hub: Arc::clone(self),
        }
    }

    fn broadcast(&self, from: usize, frame: &[u8]) -> PnioResult<()> {
        if self.fail_sends.load(Ordering::Relaxed) {
            return Err(PnioError::Io("simulated link send failure".into()));
        }
        let mut ports = self
            .ports
            .lock()
            .map_err(|_| PnioError::Io("simulated hub poisoned".into()))?;
        ports.retain(|port| {
            if port.id == from {
                return true;
            }
            match port.tx.try_send(frame.to_vec()) {
                Ok(()) => true,
                Err(mpsc::TrySendError::Full(_)) => {
                    trace!(channel = port.id, "Simulated receive queue full, frame dropped");
                    true
                }
                Err(mpsc::TrySendError::Disconnected(_)) => false,
            }
        });
        Ok(())
    }

    fn detach(&self, id: usize) {
        if let Ok(mut ports) = self.ports.lock() {
            ports.retain(|port| port.id != id);
        }
    }
}

/// In-memory Ethernet segment.
///
/// Every channel opened on any handle sharing the same hub receives a copy
/// of every frame sent by the other channels. Use [`SimulatedLink::attach`]
/// to create a peer (e.g. a test device) with its own MAC on the same hub.
#[derive(Debug, Clone)]
pub struct SimulatedLink {
    mac: MacAddress,
    hub: Arc<Hub>,
}

impl SimulatedLink {
    /// Create a new segment with a controller at `mac`.
    #[must_use]
    pub fn new(mac: MacAddress) -> Self {
        debug!(%mac, "Creating simulated link");
        Self {
            mac,
            hub: Arc::new(Hub::default()),
        }
    }

    /// Another station on the same segment.
    #[must_use]
    pub fn attach(&self, mac: MacAddress) -> Self {
        Self {
            mac,
            hub: Arc::clone(&self.hub),
        }
    }

    /// Make every send on this segment fail (fault injection).
    pub fn set_send_failure(&self, fail: bool) {
        self.hub.fail_sends.store(fail, Ordering::Relaxed);
    }

    /// Open a concrete simulated channel.
    #[must_use]
    pub fn channel(&self) -> SimulatedChannel {
        self.hub.attach()
    }
}

impl EthernetLink for SimulatedLink {
    fn mac(&self) -> MacAddress {
        self.mac
    }

    fn open_channel(&self) -> PnioResult<Box<dyn FrameChannel>> {
        Ok(Box::new(self.channel()))
    }
}

/// Channel on a [`SimulatedLink`].
#[derive(Debug)]
pub struct SimulatedChannel {
    id: usize,
    rx: mpsc::Receiver<Vec<u8>>,
    hub: Arc<Hub>,
}

impl FrameChannel for SimulatedChannel {
    fn send(&mut self, frame: &[u8]) -> PnioResult<()> {
        trace!(channel = self.id, len = frame.len(), "Simulated send");
        self.hub.broadcast(self.id, frame)
    }

    fn recv(&mut self, buf: &mut [u8], timeout: Duration) -> PnioResult<Option<usize>> {
        match self.rx.recv_timeout(timeout) {
            Ok(frame) => {
                let len = frame.len().min(buf.len());
                buf[..len].copy_from_slice(&frame[..len]);
                Ok(Some(len))
            }
            Err(mpsc::RecvTimeoutError::Timeout) => Ok(None),
            Err(mpsc::RecvTimeoutError::Disconnected) => {
                Err(PnioError::Io("simulated link detached".into()))
            }
        }
    }
}

impl Drop for SimulatedChannel {
    fn drop(&mut self) {
        self.hub.detach(self.id);
    }
}

// AF_PACKET raw socket backend (Linux-only)
#[cfg(target_os = "linux")]
mod packet_socket {
    //! Linux `AF_PACKET` backend.
    //!
    //! Each channel is its own `SOCK_RAW` socket bound to the interface and
    //! the PROFINET ethertype, so the kernel hands every channel a copy of
    //! each inbound frame. The DCP multicast group is joined on every socket.

    use super::{EthernetLink, FrameChannel, ETHERTYPE_PROFINET};
    use crate::dcp::DCP_MULTICAST;
    use pnio_common::error::{PnioError, PnioResult};
    use pnio_common::mac::MacAddress;
    use std::ffi::c_int;
    use std::fs;
    use std::io;
    use std::os::fd::{AsRawFd, FromRawFd, OwnedFd};
    use std::path::Path;
    use std::time::{Duration, Instant};
    use tracing::{debug, info};

    /// Linux capability bit for CAP_NET_RAW.
    const CAP_NET_RAW_BIT: u32 = 13;

    /// Raw packet socket link bound to one interface.
    #[derive(Debug)]
    pub struct PacketSocketLink {
        interface: String,
        ifindex: c_int,
        mac: MacAddress,
    }

    impl PacketSocketLink {
        fn check_interface_exists(interface: &str) -> PnioResult<()> {
            let path = format!("/sys/class/net/{interface}");
            if !Path::new(&path).exists() {
                return Err(PnioError::Config(format!(
                    "interface '{interface}' not found (expected {path})"
                )));
            }
            Ok(())
        }

        fn has_cap_net_raw() -> bool {
            let Ok(status) = fs::read_to_string("/proc/self/status") else {
                return false;
            };

            for line in status.lines() {
                if let Some(value) = line.strip_prefix("CapEff:\t") {
                    if let Ok(bits) = u64::from_str_radix(value.trim(), 16) {
                        return (bits & (1u64 << CAP_NET_RAW_BIT)) != 0;
                    }
                    break;
                }
            }
            false
        }

        fn check_raw_socket_privilege() -> PnioResult<()> {
            // SAFETY: geteuid(2) has no preconditions and cannot fail.
            let is_root = unsafe { libc::geteuid() == 0 };
            if is_root || Self::has_cap_net_raw() {
                return Ok(());
            }

            Err(PnioError::Config(
                "raw PROFINET frames require CAP_NET_RAW (or root)".into(),
            ))
        }

        fn read_interface_mac(interface: &str) -> PnioResult<MacAddress> {
            let path = format!("/sys/class/net/{interface}/address");
            let text = fs::read_to_string(&path)?;
            text.trim()
                .parse()
                .map_err(|e| PnioError::Config(format!("{path}: {e}")))
        }

        /// Open the link on `interface`.
        ///
        /// # Errors
        ///
        /// Returns an error if:
        /// - The interface does not exist
        /// - The process lacks CAP_NET_RAW
        /// - The MAC address cannot be determined
        pub fn open(interface: &str, mac: Option<MacAddress>) -> PnioResult<Self> {
            if interface.is_empty() {
                return Err(PnioError::Config("interface name cannot be empty".into()));
            }

            Self::check_interface_exists(interface)?;
            Self::check_raw_socket_privilege()?;

            let ifindex = nix::net::if_::if_nametoindex(interface)
                .map_err(|e| PnioError::Config(format!("if_nametoindex({interface}): {e}")))?;
            let ifindex = c_int::try_from(ifindex)
                .map_err(|_| PnioError::Config(format!("interface index {ifindex} out of range")))?;

            let mac = match mac {
                Some(mac) => mac,
                None => Self::read_interface_mac(interface)?,
            };

            info!(interface, ifindex, %mac, "Opened packet socket link");

            Ok(Self {
                interface: interface.to_string(),
                ifindex,
                mac,
            })
        }

        /// Interface name.
        #[must_use]
        pub fn interface(&self) -> &str {
            &self.interface
        }
    }

    fn link_address(ifindex: c_int, dst: Option<MacAddress>) -> libc::sockaddr_ll {
        // SAFETY: sockaddr_ll is plain old data; all-zero is a valid value.
        let mut addr: libc::sockaddr_ll = unsafe { std::mem::zeroed() };
        addr.sll_family = libc::AF_PACKET as u16;
        addr.sll_protocol = ETHERTYPE_PROFINET.to_be();
        addr.sll_ifindex = ifindex;
        if let Some(dst) = dst {
            addr.sll_halen = 6;
            addr.sll_addr[..6].copy_from_slice(&dst.octets());
        }
        addr
    }

    impl EthernetLink for PacketSocketLink {
        fn mac(&self) -> MacAddress {
            self.mac
        }

        fn open_channel(&self) -> PnioResult<Box<dyn FrameChannel>> {
            // SAFETY: plain socket(2) call; the result is checked before use.
            let raw = unsafe {
                libc::socket(
                    libc::AF_PACKET,
                    libc::SOCK_RAW | libc::SOCK_CLOEXEC,
                    c_int::from(ETHERTYPE_PROFINET.to_be()),
                )
            };
            if raw < 0 {
                return Err(io::Error::last_os_error().into());
            }
            // SAFETY: `raw` is a freshly created descriptor owned by nobody else.
            let fd = unsafe { OwnedFd::from_raw_fd(raw) };

            let addr = link_address(self.ifindex, None);
            // SAFETY: `addr` is a valid sockaddr_ll and the length matches.
            let rc = unsafe {
                libc::bind(
                    fd.as_raw_fd(),
                    std::ptr::addr_of!(addr).cast::<libc::sockaddr>(),
                    std::mem::size_of::<libc::sockaddr_ll>() as libc::socklen_t,
                )
            };
            if rc < 0 {
                return Err(io::Error::last_os_error().into());
            }

            let mut mreq = libc::packet_mreq {
                mr_ifindex: self.ifindex,
                mr_type: libc::PACKET_MR_MULTICAST as u16,
                mr_alen: 6,
                mr_address: [0; 8],
            };
            mreq.mr_address[..6].copy_from_slice(&DCP_MULTICAST.octets());
            // SAFETY: `mreq` is a valid packet_mreq and the length matches.
            let rc = unsafe {
                libc::setsockopt(
                    fd.as_raw_fd(),
                    libc::SOL_PACKET,
                    libc::PACKET_ADD_MEMBERSHIP,
                    std::ptr::addr_of!(mreq).cast::<libc::c_void>(),
                    std::mem::size_of::<libc::packet_mreq>() as libc::socklen_t,
                )
            };
            if rc < 0 {
                return Err(io::Error::last_os_error().into());
            }

            debug!(interface = %self.interface, fd = fd.as_raw_fd(), "Opened packet channel");
            Ok(Box::new(PacketSocketChannel {
                fd,
                ifindex: self.ifindex,
            }))
        }
    }

    /// One raw socket on a [`PacketSocketLink`].
    #[derive(Debug)]
    struct PacketSocketChannel {
        fd: OwnedFd,
        ifindex: c_int,
    }

    impl FrameChannel for PacketSocketChannel {
        fn send(&mut self, frame: &[u8]) -> PnioResult<()> {
            let dst = MacAddress::from_slice(frame)
                .ok_or_else(|| PnioError::Malformed("frame shorter than header".into()))?;
            let addr = link_address(self.ifindex, Some(dst));
            // SAFETY: buffer and address pointers are valid for the given lengths.
            let sent = unsafe {
                libc::sendto(
                    self.fd.as_raw_fd(),
                    frame.as_ptr().cast::<libc::c_void>(),
                    frame.len(),
                    0,
                    std::ptr::addr_of!(addr).cast::<libc::sockaddr>(),
                    std::mem::size_of::<libc::sockaddr_ll>() as libc::socklen_t,
                )
            };
            if sent < 0 {
                return Err(io::Error::last_os_error().into());
            }
            Ok(())
        }

        fn recv(&mut self, buf: &mut [u8], timeout: Duration) -> PnioResult<Option<usize>> {
            let deadline = Instant::now() + timeout;
            loop {
                let remaining = deadline.saturating_duration_since(Instant::now());
                let timeout_ms = c_int::try_from(remaining.as_millis()).unwrap_or(c_int::MAX);
                let mut pfd = libc::pollfd {
                    fd: self.fd.as_raw_fd(),
                    events: libc::POLLIN,
                    revents: 0,
                };
                // SAFETY: `pfd` is a single valid pollfd.
                let ready = unsafe { libc::poll(&mut pfd, 1, timeout_ms) };
                if ready < 0 {
                    let err = io::Error::last_os_error();
                    if err.kind() == io::ErrorKind::Interrupted {
                        continue;
                    }
                    return Err(err.into());
                }
                if ready == 0 {
                    return Ok(None);
                }

                // SAFETY: all-zero is a valid sockaddr_ll.
                let mut from: libc::sockaddr_ll = unsafe { std::mem::zeroed() };
                let mut from_len = std::mem::size_of::<libc::sockaddr_ll>() as libc::socklen_t;
                // SAFETY: buffer and address pointers are valid for the given lengths.
                let received = unsafe {
                    libc::recvfrom(
                        self.fd.as_raw_fd(),
                        buf.as_mut_ptr().cast::<libc::c_void>(),
                        buf.len(),
                        0,
                        std::ptr::addr_of_mut!(from).cast::<libc::sockaddr>(),
                        &mut from_len,
                    )
                };
                if received < 0 {
                    return Err(io::Error::last_os_error().into());
                }
                // Our own transmissions are looped back to every packet socket.
                if from.sll_pkttype == libc::PACKET_OUTGOING {
                    if Instant::now() >= deadline {
                        return Ok(None);
                    }
                    continue;
                }
                return Ok(Some(received.unsigned_abs()));
            }
        }
    }

}

#[cfg(target_os = "linux")]
pub use packet_socket::PacketSocketLink;
