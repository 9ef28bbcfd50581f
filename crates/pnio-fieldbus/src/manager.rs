//! Connection manager: one record per device, one connecting slot.
//!
//! The manager owns the RPC endpoint, the discoverer, and the cyclic
//! registry. A connect runs the whole sequence for one device:
//!
//! 1. resolve the device by name if its addresses are unknown
//! 2. send the connect request and check the returned status
//! 3. parameter-end, then wait for application-ready
//! 4. DISCOVERY, then start cyclic exchange and enter RUNNING
//!
//! Only one device may be connecting at a time. Network I/O happens
//! without the device record locked, so snapshots stay responsive while a
//! connect is in flight.

use crate::blocks::{
    decode_connect_response, encode_connect, parse_connect_response, ConnectResponse,
};
use crate::connection::{DeviceConnection, DeviceSnapshot, StateObserver};
use crate::cyclic::{CyclicParams, CyclicRegistry, CyclicStats, InputCallback};
use crate::dcp::Discoverer;
use crate::device::{
    AlarmCrSpec, ArProperties, DeviceIdentity, DeviceLayout, IocrDirection, Session,
};
use crate::ethernet::EthernetLink;
use crate::handshake::{ControlTarget, HandshakeCoordinator};
use crate::rpc::{object_uuid, Opnum, RpcEndpoint};
use pnio_common::config::ControllerConfig;
use pnio_common::error::{PnioError, PnioResult};
use pnio_common::mac::MacAddress;
use pnio_common::state::ConnectionState;
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::net::{SocketAddr, SocketAddrV4};
use std::sync::atomic::{AtomicU16, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::{self, JoinHandle};
use std::time::Instant;
use tracing::{debug, error, info, warn};

/// Receives every input frame of every device.
pub type InputObserver = Arc<dyn Fn(&str, &[u8], Instant) + Send + Sync>;

/// Instance number of the controller's own object UUID.
const CONTROLLER_INSTANCE: u16 = 0x0001;

type SharedConnection = Arc<Mutex<DeviceConnection>>;

fn lock_record(record: &SharedConnection) -> PnioResult<MutexGuard<'_, DeviceConnection>> {
    record
        .lock()
        .map_err(|_| PnioError::Io("device record lock poisoned".into()))
}

/// Summary returned by [`ConnectionManager::status`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ManagerStatus {
    /// Controller hardware address.
    pub controller_mac: MacAddress,
    /// Device holding the connecting slot.
    pub connecting: Option<String>,
    /// Number of known devices.
    pub devices: usize,
    /// Number of devices in RUNNING.
    pub running: usize,
    /// State per device.
    pub states: BTreeMap<String, ConnectionState>,
}

/// What a successful connect exchange produced.
struct Established {
    session: Session,
    target: ControlTarget,
    response: ConnectResponse,
}

/// Owns every device connection of one controller.
pub struct ConnectionManager {
    config: ControllerConfig,
    controller_mac: MacAddress,
    rpc: RpcEndpoint,
    discoverer: Discoverer,
    registry: CyclicRegistry,
    records: Mutex<HashMap<String, SharedConnection>>,
    connecting: Mutex<Option<String>>,
    next_session_key: AtomicU16,
    observer: Option<Arc<dyn StateObserver>>,
    on_input: Option<InputObserver>,
}

impl std::fmt::Debug for ConnectionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionManager")
            .field("controller_mac", &self.controller_mac)
            .field("rpc", &self.rpc)
            .field("registry", &self.registry)
            .finish_non_exhaustive()
    }
}

impl ConnectionManager {
    /// Bind the RPC endpoint and prepare an empty manager.
    ///
    /// # Errors
    ///
    /// Returns `PnioError::Io` if the RPC endpoint cannot be bound.
    pub fn new(config: ControllerConfig, link: Arc<dyn EthernetLink>) -> PnioResult<Self> {
        let controller_mac = config.controller_mac.unwrap_or_else(|| link.mac());
        let rpc = RpcEndpoint::bind(config.rpc.bind, config.rpc.args_maximum)?;
        let discoverer = Discoverer::new(Arc::clone(&link), config.discovery.response_delay);
        let registry = CyclicRegistry::new(link);

        info!(
            mac = %controller_mac,
            rpc = ?rpc.local_addr().ok(),
            cycle = ?config.cyclic.cycle_interval(),
            "Connection manager ready"
        );

        Ok(Self {
            config,
            controller_mac,
            rpc,
            discoverer,
            registry,
            records: Mutex::new(HashMap::new()),
            connecting: Mutex::new(None),
            next_session_key: AtomicU16::new(1),
            observer: None,
            on_input: None,
        })
    }

    /// Report every state change to `observer`.
    ///
    /// Applies to records created after this call.
    #[must_use]
    pub fn with_observer(mut self, observer: Arc<dyn StateObserver>) -> Self {
        self.observer = Some(observer);
        self
    }

    /// Deliver every input frame to `callback`.
    #[must_use]
    pub fn with_input_callback(mut self, callback: InputObserver) -> Self {
        self.on_input = Some(callback);
        self
    }

    /// Controller configuration.
    #[must_use]
    pub fn config(&self) -> &ControllerConfig {
        &self.config
    }

    /// Local RPC address.
    ///
    /// # Errors
    ///
    /// Returns `PnioError::Io` if the socket has no local address.
    pub fn rpc_addr(&self) -> PnioResult<SocketAddr> {
        self.rpc.local_addr()
    }

    fn records(&self) -> PnioResult<MutexGuard<'_, HashMap<String, SharedConnection>>> {
        self.records
            .lock()
            .map_err(|_| PnioError::Io("device table lock poisoned".into()))
    }

    fn slot(&self) -> PnioResult<MutexGuard<'_, Option<String>>> {
        self.connecting
            .lock()
            .map_err(|_| PnioError::Io("connecting slot lock poisoned".into()))
    }

    fn new_record(&self, identity: DeviceIdentity) -> DeviceConnection {
        let layout = match self.config.device(&identity.station_name) {
            Some(device) if !device.modules.is_empty() => {
                DeviceLayout::new(&device.modules, &self.config.cyclic)
            }
            _ => DeviceLayout::access_point_only(&self.config.cyclic),
        };
        DeviceConnection::new(identity, layout, self.observer.clone())
    }

    /// Get or lazily create the record for `name`.
    fn record(&self, name: &str) -> PnioResult<SharedConnection> {
        let mut records = self.records()?;
        if let Some(record) = records.get(name) {
            return Ok(Arc::clone(record));
        }
        let identity = self
            .config
            .device(name)
            .map_or_else(|| DeviceIdentity::unresolved(name), DeviceIdentity::from_config);
        let record = Arc::new(Mutex::new(self.new_record(identity)));
        records.insert(name.to_string(), Arc::clone(&record));
        debug!(device = name, "Device record created");
        Ok(record)
    }

    fn existing(&self, name: &str) -> PnioResult<SharedConnection> {
        self.records()?
            .get(name)
            .cloned()
            .ok_or_else(|| PnioError::UnknownDevice(name.to_string()))
    }

    fn all_records(&self) -> PnioResult<Vec<(String, SharedConnection)>> {
        let mut all: Vec<(String, SharedConnection)> = self
            .records()?
            .iter()
            .map(|(name, record)| (name.clone(), Arc::clone(record)))
            .collect();
        all.sort_by(|a, b| a.0.cmp(&b.0));
        Ok(all)
    }

    /// Register or update a device identity.
    ///
    /// # Errors
    ///
    /// Returns `PnioError::Io` if an internal lock is poisoned.
    pub fn add_device(&self, identity: DeviceIdentity) -> PnioResult<()> {
        let record = self.record(&identity.station_name)?;
        let mut record = lock_record(&record)?;
        info!(
            device = %identity.station_name,
            ip = %identity.ip,
            mac = %identity.mac,
            "Device added"
        );
        record.set_identity(identity);
        Ok(())
    }

    /// Register every device named in the configuration.
    ///
    /// # Errors
    ///
    /// Returns `PnioError::Io` if an internal lock is poisoned.
    pub fn add_configured_devices(&self) -> PnioResult<usize> {
        for device in &self.config.devices {
            self.record(&device.station_name)?;
        }
        Ok(self.config.devices.len())
    }

    /// Forget a device.
    ///
    /// # Errors
    ///
    /// Returns `PnioError::UnknownDevice` if the name is unknown, or
    /// `PnioError::DeviceInUse` unless the device is OFFLINE or ERROR.
    pub fn remove_device(&self, name: &str) -> PnioResult<()> {
        let mut records = self.records()?;
        let record = records
            .get(name)
            .ok_or_else(|| PnioError::UnknownDevice(name.to_string()))?;
        {
            let record = lock_record(record)?;
            if !record.can_delete() {
                return Err(PnioError::DeviceInUse {
                    name: name.to_string(),
                    state: record.state().to_string(),
                });
            }
        }
        records.remove(name);
        info!(device = name, "Device removed");
        Ok(())
    }

    /// Whether `name` may take the connecting slot, and who holds it if not.
    #[must_use]
    pub fn can_start_connecting(&self, name: &str) -> (bool, Option<String>) {
        match self.slot() {
            Ok(slot) => match slot.as_deref() {
                Some(holder) if holder != name => (false, Some(holder.to_string())),
                _ => (true, None),
            },
            Err(_) => (false, None),
        }
    }

    /// Take the connecting slot for `name`.
    ///
    /// # Errors
    ///
    /// Returns `PnioError::ConnectSlotBusy` if another device holds it.
    pub fn set_connecting(&self, name: &str) -> PnioResult<()> {
        self.take_slot(name).map(|_| ())
    }

    /// Take the slot; `true` only if this call took it rather than finding
    /// `name` already holding it.
    fn take_slot(&self, name: &str) -> PnioResult<bool> {
        let mut slot = self.slot()?;
        match slot.as_deref() {
            Some(holder) if holder != name => Err(PnioError::ConnectSlotBusy {
                requested: name.to_string(),
                holder: holder.to_string(),
            }),
            Some(_) => Ok(false),
            None => {
                *slot = Some(name.to_string());
                debug!(device = name, "Connecting slot taken");
                Ok(true)
            }
        }
    }

    /// Release the connecting slot if `name` holds it.
    pub fn clear_connecting(&self, name: &str) {
        if let Ok(mut slot) = self.slot() {
            if slot.as_deref() == Some(name) {
                *slot = None;
                debug!(device = name, "Connecting slot released");
            }
        }
    }

    /// Connect one device and start its cyclic exchange.
    ///
    /// On a connect or handshake failure the device ends in ERROR with the
    /// failure recorded; if cyclic exchange cannot start it is aborted back
    /// to OFFLINE.
    ///
    /// # Errors
    ///
    /// Returns:
    /// - `PnioError::ConnectSlotBusy` if another device is connecting
    /// - `PnioError::InvalidTransition` unless the device is OFFLINE or ERROR
    /// - the failure of the connect sequence otherwise
    pub fn connect(&self, name: &str) -> PnioResult<()> {
        let taken = self.take_slot(name)?;
        let result = self.run_connect(name);
        // A slot held by an earlier caller is theirs to release
        if taken {
            self.clear_connecting(name);
        }
        result
    }

    fn run_connect(&self, name: &str) -> PnioResult<()> {
        let record = self.record(name)?;
        let (identity, layout) = {
            let mut record = lock_record(&record)?;
            record.connect()?;
            (record.identity().clone(), record.layout().clone())
        };

        let established = match self.establish(identity, &layout) {
            Ok(established) => established,
            Err(e) => {
                error!(device = name, error = %e, "Connect sequence failed");
                lock_record(&record)?.connect_failed(e.clone())?;
                return Err(e);
            }
        };
        let Established {
            session,
            target,
            response,
        } = established;

        let params = self.cyclic_params(name, &session, &layout, &response);
        let mut record = lock_record(&record)?;
        record.session_established(session.clone(), target)?;
        self.clear_connecting(name);

        if let Some(diff) = &response.module_diff {
            warn!(device = name, len = diff.len(), "Device reported a module difference");
        }

        let on_input = self.input_callback(name);
        if let Err(e) = record.discovery_complete(&self.registry, params, on_input) {
            error!(device = name, error = %e, "Cyclic exchange did not start");
            if let Err(release) = HandshakeCoordinator::new(&self.rpc, target).release(&session) {
                warn!(device = name, error = %release, "Release after failed start not sent");
            }
            record.abort(&self.registry, &e.to_string())?;
            return Err(e);
        }
        Ok(())
    }

    fn resolve(&self, identity: DeviceIdentity) -> PnioResult<DeviceIdentity> {
        if identity.is_resolved() {
            return Ok(identity);
        }
        let name = identity.station_name.clone();
        debug!(device = %name, "Resolving device by name");
        let found = self
            .discoverer
            .discover(Some(&name), self.config.discovery.timeout)?
            .into_iter()
            .find(|d| d.station_name == name)
            .ok_or_else(|| {
                PnioError::TransportTimeout(format!(
                    "no identify response from '{name}' within {:?}",
                    self.config.discovery.timeout
                ))
            })?;

        let resolved = DeviceIdentity {
            vendor_id: if found.vendor_id == 0 {
                identity.vendor_id
            } else {
                found.vendor_id
            },
            device_id: if found.device_id == 0 {
                identity.device_id
            } else {
                found.device_id
            },
            ..found
        };
        if let Ok(record) = self.existing(&name) {
            if let Ok(mut record) = record.lock() {
                record.set_identity(resolved.clone());
            }
        }
        info!(device = %name, ip = %resolved.ip, mac = %resolved.mac, "Device resolved");
        Ok(resolved)
    }

    fn establish(
        &self,
        identity: DeviceIdentity,
        layout: &DeviceLayout,
    ) -> PnioResult<Established> {
        let identity = self.resolve(identity)?;
        let name = identity.station_name.as_str();
        let instance = self.config.device(name).map_or(1, |d| d.instance);

        let session_key = self.allocate_session_key();
        let session = Session::new(
            session_key,
            self.controller_mac,
            identity.mac,
            object_uuid(CONTROLLER_INSTANCE, self.config.device_id, self.config.vendor_id),
            &self.config.station_name,
            ArProperties::default(),
        )?;
        let target = ControlTarget {
            peer: SocketAddr::V4(SocketAddrV4::new(identity.ip, self.config.rpc.device_port)),
            object: object_uuid(instance, identity.device_id, identity.vendor_id),
        };

        let request = encode_connect(
            &session,
            &layout.input,
            &layout.output,
            &AlarmCrSpec::from(&self.config.alarm),
            &layout.modules,
            &self.config.codec,
        );
        info!(
            device = name,
            peer = %target.peer,
            session = session_key,
            ar = %session.ar_uuid,
            "Connecting"
        );

        let reply = self.rpc.call(
            target.peer,
            target.object,
            Opnum::Connect,
            &request,
            self.config.rpc.response_timeout,
        )?;
        let status = decode_connect_response(&reply.datagram)?;
        if !status.is_ok() {
            return Err(status.to_error());
        }
        let response = parse_connect_response(reply.blocks()?, self.config.codec.pad_blocks)?;
        debug!(
            device = name,
            iocrs = response.iocrs.len(),
            alarm = response.alarm.is_some(),
            "Connect accepted"
        );

        let handshake = HandshakeCoordinator::new(&self.rpc, target);
        handshake.send_parameter_end(&session, self.config.handshake.prm_end_timeout)?;
        handshake.wait_for_application_ready(&session, self.config.handshake.app_ready_timeout)?;

        Ok(Established {
            session,
            target,
            response,
        })
    }

    /// Next session key; 0 is never handed out.
    fn allocate_session_key(&self) -> u16 {
        let key = self.next_session_key.fetch_add(1, Ordering::Relaxed);
        if key == 0 {
            self.next_session_key.fetch_add(1, Ordering::Relaxed)
        } else {
            key
        }
    }

    fn cyclic_params(
        &self,
        name: &str,
        session: &Session,
        layout: &DeviceLayout,
        response: &ConnectResponse,
    ) -> CyclicParams {
        let cyclic = &self.config.cyclic;
        CyclicParams {
            device: name.to_string(),
            controller_mac: self.controller_mac,
            device_mac: session.device_mac,
            input_frame_id: response
                .frame_id(IocrDirection::Input)
                .unwrap_or(layout.input.frame_id),
            output_frame_id: response
                .frame_id(IocrDirection::Output)
                .unwrap_or(layout.output.frame_id),
            cycle_interval: cyclic.cycle_interval(),
            stop_timeout: cyclic.stop_timeout,
            error_backoff: cyclic.error_backoff,
            input_length: usize::from(layout.input.data_length),
            initial_output: layout.output.initial_buffer(),
            alarm_reference: self.config.alarm.local_alarm_reference,
        }
    }

    fn input_callback(&self, name: &str) -> Option<InputCallback> {
        let observer = self.on_input.clone()?;
        let name = name.to_string();
        Some(Arc::new(move |data: &[u8], at: Instant| observer(&name, data, at)))
    }

    /// Run [`connect`](Self::connect) on its own thread.
    ///
    /// # Errors
    ///
    /// Returns `PnioError::Io` if the thread cannot be spawned.
    pub fn connect_in_background(
        self: &Arc<Self>,
        name: &str,
    ) -> PnioResult<JoinHandle<PnioResult<()>>> {
        let manager = Arc::clone(self);
        let device = name.to_string();
        thread::Builder::new()
            .name(format!("pnio-connect-{name}"))
            .spawn(move || manager.connect(&device))
            .map_err(|e| PnioError::Io(format!("failed to spawn connect thread: {e}")))
    }

    /// Release the session and stop cyclic exchange.
    ///
    /// # Errors
    ///
    /// Returns `PnioError::UnknownDevice` for an unknown name, or
    /// `PnioError::InvalidTransition` unless the device is RUNNING or ERROR.
    pub fn disconnect(&self, name: &str, reason: &str) -> PnioResult<()> {
        let record = self.existing(name)?;
        let mut record = lock_record(&record)?;
        if let (Some(session), Some(target)) = (record.session(), record.target()) {
            if record.state() == ConnectionState::Running {
                if let Err(e) = HandshakeCoordinator::new(&self.rpc, target).release(session) {
                    warn!(device = name, error = %e, "Release not sent");
                }
            }
        }
        record.disconnect(&self.registry, reason)
    }

    /// Replace the start of a device's output frame data.
    ///
    /// # Errors
    ///
    /// Returns `PnioError::UnknownDevice` unless cyclic exchange runs for
    /// the device, or `PnioError::CyclicIo` if `bytes` is too long.
    pub fn set_output(&self, name: &str, bytes: &[u8]) -> PnioResult<()> {
        self.registry.set_output(name, bytes)
    }

    /// Write one submodule's output data at its frame offset.
    ///
    /// # Errors
    ///
    /// Returns `PnioError::UnknownDevice` for an unknown device or a
    /// submodule without output data, or `PnioError::CyclicIo` if `bytes`
    /// is longer than the submodule's data.
    pub fn set_submodule_output(
        &self,
        name: &str,
        api: u32,
        slot: u16,
        subslot: u16,
        bytes: &[u8],
    ) -> PnioResult<()> {
        let entry = {
            let record = self.existing(name)?;
            let record = lock_record(&record)?;
            record
                .layout()
                .output
                .data_object(api, slot, subslot)
                .copied()
                .ok_or_else(|| {
                    PnioError::UnknownDevice(format!(
                        "{name} api {api} slot {slot} subslot {subslot}"
                    ))
                })?
        };
        if bytes.len() > usize::from(entry.data_length) {
            return Err(PnioError::CyclicIo(format!(
                "{} bytes for a {}-byte submodule",
                bytes.len(),
                entry.data_length
            )));
        }
        self.registry.write_output(name, usize::from(entry.frame_offset), bytes)
    }

    /// Latest input data of one submodule.
    ///
    /// # Errors
    ///
    /// Returns `PnioError::UnknownDevice` for an unknown device or a
    /// submodule without input data.
    pub fn submodule_input(
        &self,
        name: &str,
        api: u32,
        slot: u16,
        subslot: u16,
    ) -> PnioResult<Vec<u8>> {
        let entry = {
            let record = self.existing(name)?;
            let record = lock_record(&record)?;
            record
                .layout()
                .input
                .data_object(api, slot, subslot)
                .copied()
                .ok_or_else(|| {
                    PnioError::UnknownDevice(format!(
                        "{name} api {api} slot {slot} subslot {subslot}"
                    ))
                })?
        };
        let input = self.registry.get_input(name)?;
        Ok(input.data.get(entry.data_range()).map(<[u8]>::to_vec).unwrap_or_default())
    }

    /// Raise `comm_failure` for running devices whose input went quiet.
    ///
    /// Before the first valid input the data-hold period applies; after it
    /// the watchdog period. Returns the devices that failed.
    pub fn supervise(&self) -> Vec<String> {
        let cyclic = &self.config.cyclic;
        let watchdog = cyclic.watchdog_timeout();
        let grace = cyclic.data_hold_timeout().max(watchdog);
        let mut failed = Vec::new();

        let Ok(records) = self.all_records() else {
            return failed;
        };
        for (name, record) in records {
            let Ok(mut record) = record.lock() else {
                continue;
            };
            if record.state() != ConnectionState::Running {
                continue;
            }
            let silence = record
                .cyclic()
                .and_then(|c| c.lock().ok())
                .map(|s| match s.last_valid_input {
                    Some(at) => (at.elapsed(), watchdog),
                    None => (s.started.elapsed(), grace),
                });
            let Some((silence, limit)) = silence else {
                continue;
            };
            if silence > limit {
                let err = PnioError::CyclicIo(format!(
                    "no valid input for {silence:?} (limit {limit:?})"
                ));
                if record.comm_failure(&self.registry, err).is_ok() {
                    failed.push(name);
                }
            }
        }
        failed
    }

    /// Identify devices and update the identities of known ones.
    ///
    /// # Errors
    ///
    /// Returns `PnioError::Io` if the identify request cannot be sent.
    pub fn discover(&self, filter: Option<&str>) -> PnioResult<Vec<DeviceIdentity>> {
        let found = self.discoverer.discover(filter, self.config.discovery.timeout)?;
        for identity in &found {
            if let Ok(record) = self.existing(&identity.station_name) {
                if let Ok(mut record) = record.lock() {
                    record.set_identity(identity.clone());
                }
            }
        }
        info!(count = found.len(), filter, "Discovery finished");
        Ok(found)
    }

    /// Disconnect every device and stop all cyclic exchange.
    pub fn shutdown(&self) {
        if let Ok(records) = self.all_records() {
            for (name, record) in records {
                let state = record.lock().map(|r| r.state()).unwrap_or(ConnectionState::Offline);
                if matches!(state, ConnectionState::Running | ConnectionState::Error) {
                    if let Err(e) = self.disconnect(&name, "controller shutdown") {
                        warn!(device = %name, error = %e, "Disconnect on shutdown failed");
                    }
                }
            }
        }
        let stopped = self.registry.stop_all();
        info!(stopped, "Connection manager shut down");
    }

    /// Summary of all devices.
    #[must_use]
    pub fn status(&self) -> ManagerStatus {
        let states: BTreeMap<String, ConnectionState> = self
            .all_records()
            .unwrap_or_default()
            .into_iter()
            .filter_map(|(name, record)| record.lock().ok().map(|r| (name, r.state())))
            .collect();
        ManagerStatus {
            controller_mac: self.controller_mac,
            connecting: self.slot().ok().and_then(|s| s.as_ref().cloned()),
            devices: states.len(),
            running: states.values().filter(|s| s.is_running()).count(),
            states,
        }
    }

    /// State of one device.
    ///
    /// # Errors
    ///
    /// Returns `PnioError::UnknownDevice` for an unknown name.
    pub fn device(&self, name: &str) -> PnioResult<DeviceSnapshot> {
        let record = self.existing(name)?;
        let record = lock_record(&record)?;
        Ok(record.snapshot())
    }

    /// Identity, state, and IO data of every device, sorted by name.
    #[must_use]
    pub fn devices(&self) -> Vec<DeviceSnapshot> {
        self.all_records()
            .unwrap_or_default()
            .into_iter()
            .filter_map(|(_, record)| record.lock().ok().map(|r| r.snapshot()))
            .collect()
    }

    /// Cyclic counters of every running device.
    #[must_use]
    pub fn cyclic_stats(&self) -> Vec<CyclicStats> {
        self.registry.stats()
    }
}

impl Drop for ConnectionManager {
    fn drop(&mut self) {
        self.registry.stop_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ethernet::SimulatedLink;
    use std::net::Ipv4Addr;
    use std::time::Duration;

    const CONTROLLER: MacAddress = MacAddress::new([0x02, 0, 0, 0, 0, 0x01]);

    fn manager() -> ConnectionManager {
        let mut config = ControllerConfig::default();
        config.rpc.bind = "127.0.0.1:0".parse().unwrap();
        config.rpc.response_timeout = Duration::from_millis(100);
        config.discovery.timeout = Duration::from_millis(50);
        ConnectionManager::new(config, Arc::new(SimulatedLink::new(CONTROLLER))).unwrap()
    }

    #[test]
    fn test_connecting_slot() {
        let manager = manager();
        assert_eq!(manager.can_start_connecting("a"), (true, None));

        manager.set_connecting("a").unwrap();
        assert_eq!(manager.can_start_connecting("a"), (true, None));
        assert_eq!(manager.can_start_connecting("b"), (false, Some("a".to_string())));
        assert!(matches!(
            manager.set_connecting("b"),
            Err(PnioError::ConnectSlotBusy { ref holder, .. }) if holder == "a"
        ));

        manager.clear_connecting("b");
        assert_eq!(manager.can_start_connecting("b"), (false, Some("a".to_string())));
        manager.clear_connecting("a");
        assert_eq!(manager.can_start_connecting("b"), (true, None));
    }

    #[test]
    fn test_connect_refused_while_slot_held() {
        let manager = manager();
        manager.set_connecting("other").unwrap();
        let err = manager.connect("io-1").unwrap_err();
        assert!(matches!(err, PnioError::ConnectSlotBusy { .. }));
        assert!(manager.status().states.is_empty());
    }

    #[test]
    fn test_unresolvable_device_ends_in_error() {
        let manager = manager();
        let err = manager.connect("ghost").unwrap_err();
        assert!(matches!(err, PnioError::TransportTimeout(_)));

        let device = manager.device("ghost").unwrap();
        assert_eq!(device.state, ConnectionState::Error);
        assert!(device.last_error.unwrap().contains("ghost"));
        assert_eq!(manager.can_start_connecting("other"), (true, None));
    }

    #[test]
    fn test_unanswered_connect_ends_in_error() {
        let mut config = ControllerConfig::default();
        config.rpc.bind = "127.0.0.1:0".parse().unwrap();
        config.rpc.response_timeout = Duration::from_millis(100);
        // Nothing answers on the discard port
        config.rpc.device_port = 9;
        let link = Arc::new(SimulatedLink::new(CONTROLLER));
        let manager = ConnectionManager::new(config, link).unwrap();
        manager
            .add_device(DeviceIdentity {
                station_name: "io-1".into(),
                ip: Ipv4Addr::LOCALHOST,
                mac: MacAddress::new([0x02, 0, 0, 0, 0, 0x02]),
                vendor_id: 0x002A,
                device_id: 0x0302,
            })
            .unwrap();

        assert!(manager.connect("io-1").is_err());
        let device = manager.device("io-1").unwrap();
        assert_eq!(device.state, ConnectionState::Error);
        assert!(device.last_error.is_some());

        manager.disconnect("io-1", "cleanup").unwrap();
        assert_eq!(manager.device("io-1").unwrap().state, ConnectionState::Offline);
    }

    #[test]
    fn test_remove_device() {
        let manager = manager();
        manager.add_device(DeviceIdentity::unresolved("io-1")).unwrap();
        assert_eq!(manager.devices().len(), 1);
        manager.remove_device("io-1").unwrap();
        assert!(matches!(manager.remove_device("io-1"), Err(PnioError::UnknownDevice(_))));
    }

    #[test]
    fn test_session_keys_start_at_one() {
        let manager = manager();
        assert_eq!(manager.allocate_session_key(), 1);
        assert_eq!(manager.allocate_session_key(), 2);
    }

    #[test]
    fn test_session_key_skips_zero_on_wrap() {
        let manager = manager();
        manager.next_session_key.store(u16::MAX, Ordering::Relaxed);
        assert_eq!(manager.allocate_session_key(), u16::MAX);
        assert_eq!(manager.allocate_session_key(), 1);
        assert_eq!(manager.allocate_session_key(), 2);
    }

    #[test]
    fn test_connect_while_holding_slot_keeps_it() {
        let manager = manager();
        manager.set_connecting("ghost").unwrap();
        assert!(manager.connect("ghost").is_err());
        assert_eq!(manager.can_start_connecting("other"), (false, Some("ghost".to_string())));
        manager.clear_connecting("ghost");
        assert_eq!(manager.can_start_connecting("other"), (true, None));
    }

    #[test]
    fn test_output_for_unknown_device() {
        let manager = manager();
        assert!(matches!(manager.set_output("io-1", &[1]), Err(PnioError::UnknownDevice(_))));
        assert!(manager.cyclic_stats().is_empty());
        assert!(manager.supervise().is_empty());
    }
}
