//! Per-device connection record and state machine.
//!
//! [`DeviceConnection`] wraps the transition table from
//! [`pnio_common::state`] with the side effects each transition owns:
//! recording errors and reasons, holding the session, and starting or
//! stopping the device's cyclic exchange. A transition is validated before
//! any side effect runs, so a rejected event leaves the record untouched.

use crate::cyclic::{CyclicParams, CyclicRegistry, InputCallback, SharedCyclicState};
use crate::device::{DeviceIdentity, DeviceLayout, Session};
use crate::handshake::ControlTarget;
use pnio_common::error::{PnioError, PnioResult};
use pnio_common::state::{ConnectionEvent, ConnectionState};
use serde::Serialize;
use std::fmt;
use std::sync::Arc;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Receives every state change.
///
/// Observers run while the device record is locked and must not call back
/// into the connection manager.
pub trait StateObserver: Send + Sync {
    /// Called after `device` moved from `old` to `new`.
    fn on_transition(&self, device: &str, old: ConnectionState, new: ConnectionState, reason: &str);
}

impl<F> StateObserver for F
where
    F: Fn(&str, ConnectionState, ConnectionState, &str) + Send + Sync,
{
    fn on_transition(
        &self,
        device: &str,
        old: ConnectionState,
        new: ConnectionState,
        reason: &str,
    ) {
        self(device, old, new, reason);
    }
}

/// Serializable view of one device.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DeviceSnapshot {
    /// Identity.
    pub identity: DeviceIdentity,
    /// Current state.
    pub state: ConnectionState,
    /// Message of the last recorded error.
    pub last_error: Option<String>,
    /// Reason given when the current state was entered.
    pub reason: String,
    /// Session key, while a session exists.
    pub session_key: Option<u16>,
    /// Session UUID, while a session exists.
    pub ar_uuid: Option<Uuid>,
    /// Latest input data.
    pub inputs: Vec<u8>,
    /// Current output data.
    pub outputs: Vec<u8>,
    /// Validity of the latest input.
    pub input_valid: bool,
}

/// Connection record of one device.
pub struct DeviceConnection {
    identity: DeviceIdentity,
    layout: DeviceLayout,
    state: ConnectionState,
    last_error: Option<PnioError>,
    reason: String,
    session: Option<Session>,
    target: Option<ControlTarget>,
    cyclic: Option<SharedCyclicState>,
    observer: Option<Arc<dyn StateObserver>>,
}

impl fmt::Debug for DeviceConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeviceConnection")
            .field("identity", &self.identity)
            .field("state", &self.state)
            .field("last_error", &self.last_error)
            .field("reason", &self.reason)
            .field("session", &self.session.as_ref().map(|s| s.session_key))
            .finish_non_exhaustive()
    }
}

impl DeviceConnection {
    /// New record in OFFLINE.
    #[must_use]
    pub fn new(
        identity: DeviceIdentity,
        layout: DeviceLayout,
        observer: Option<Arc<dyn StateObserver>>,
    ) -> Self {
        Self {
            identity,
            layout,
            state: ConnectionState::Offline,
            last_error: None,
            reason: String::from("created"),
            session: None,
            target: None,
            cyclic: None,
            observer,
        }
    }

    /// Station name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.identity.station_name
    }

    /// Identity.
    #[must_use]
    pub fn identity(&self) -> &DeviceIdentity {
        &self.identity
    }

    /// Replace the identity (rediscovery or `add_device`).
    pub fn set_identity(&mut self, identity: DeviceIdentity) {
        self.identity = identity;
    }

    /// Frame layout.
    #[must_use]
    pub fn layout(&self) -> &DeviceLayout {
        &self.layout
    }

    /// Current state.
    #[must_use]
    pub fn state(&self) -> ConnectionState {
        self.state
    }

    /// Last recorded error.
    #[must_use]
    pub fn last_error(&self) -> Option<&PnioError> {
        self.last_error.as_ref()
    }

    /// Reason the current state was entered with.
    #[must_use]
    pub fn reason(&self) -> &str {
        &self.reason
    }

    /// Active session.
    #[must_use]
    pub fn session(&self) -> Option<&Session> {
        self.session.as_ref()
    }

    /// Where control and release requests go.
    #[must_use]
    pub fn target(&self) -> Option<ControlTarget> {
        self.target
    }

    /// Cyclic state, while the exchange runs.
    #[must_use]
    pub fn cyclic(&self) -> Option<&SharedCyclicState> {
        self.cyclic.as_ref()
    }

    /// Only OFFLINE and ERROR records may be removed.
    #[must_use]
    pub fn can_delete(&self) -> bool {
        self.state.can_delete()
    }

    fn check(&self, event: ConnectionEvent) -> PnioResult<ConnectionState> {
        event.apply(self.state)
    }

    fn enter(&mut self, event: ConnectionEvent, target: ConnectionState, reason: &str) {
        let old = self.state;
        self.state = target;
        self.reason = reason.to_string();
        info!(
            device = %self.identity.station_name,
            %event,
            from = %old,
            to = %target,
            reason,
            "State change"
        );
        if let Some(observer) = &self.observer {
            observer.on_transition(&self.identity.station_name, old, target, reason);
        }
    }

    fn drop_session(&mut self, registry: &CyclicRegistry) {
        if registry.stop(&self.identity.station_name) {
            debug!(device = %self.identity.station_name, "Cyclic exchange stopped");
        }
        self.cyclic = None;
        self.session = None;
        self.target = None;
    }

    /// OFFLINE | ERROR → CONNECTING. Clears the last error.
    ///
    /// # Errors
    ///
    /// Returns `PnioError::InvalidTransition` from any other state.
    pub fn connect(&mut self) -> PnioResult<()> {
        let target = self.check(ConnectionEvent::Connect)?;
        self.last_error = None;
        self.session = None;
        self.target = None;
        self.enter(ConnectionEvent::Connect, target, "connect requested");
        Ok(())
    }

    /// CONNECTING → DISCOVERY, keeping the session.
    ///
    /// # Errors
    ///
    /// Returns `PnioError::InvalidTransition` from any other state.
    pub fn session_established(
        &mut self,
        session: Session,
        target: ControlTarget,
    ) -> PnioResult<()> {
        let next = self.check(ConnectionEvent::SessionEstablished)?;
        let reason = format!("session {} established", session.session_key);
        self.session = Some(session);
        self.target = Some(target);
        self.enter(ConnectionEvent::SessionEstablished, next, &reason);
        Ok(())
    }

    /// DISCOVERY → RUNNING, starting the cyclic exchange.
    ///
    /// If the engine fails to start the record stays in DISCOVERY.
    ///
    /// # Errors
    ///
    /// Returns `PnioError::InvalidTransition` from any other state, or the
    /// engine start failure.
    pub fn discovery_complete(
        &mut self,
        registry: &CyclicRegistry,
        params: CyclicParams,
        on_input: Option<InputCallback>,
    ) -> PnioResult<()> {
        let next = self.check(ConnectionEvent::DiscoveryComplete)?;
        let state = registry.start(params, on_input)?;
        self.cyclic = Some(state);
        self.enter(ConnectionEvent::DiscoveryComplete, next, "cyclic exchange running");
        Ok(())
    }

    /// RUNNING | ERROR → OFFLINE, stopping the cyclic exchange.
    ///
    /// # Errors
    ///
    /// Returns `PnioError::InvalidTransition` from any other state.
    pub fn disconnect(&mut self, registry: &CyclicRegistry, reason: &str) -> PnioResult<()> {
        let next = self.check(ConnectionEvent::Disconnect)?;
        self.drop_session(registry);
        self.enter(ConnectionEvent::Disconnect, next, reason);
        Ok(())
    }

    /// CONNECTING → ERROR, recording `error`.
    ///
    /// # Errors
    ///
    /// Returns `PnioError::InvalidTransition` from any other state.
    pub fn connect_failed(&mut self, error: PnioError) -> PnioResult<()> {
        let next = self.check(ConnectionEvent::ConnectFailed)?;
        let reason = error.to_string();
        warn!(device = %self.identity.station_name, error = %reason, "Connect failed");
        self.session = None;
        self.target = None;
        self.last_error = Some(error);
        self.enter(ConnectionEvent::ConnectFailed, next, &reason);
        Ok(())
    }

    /// RUNNING → ERROR, recording `error` and stopping the cyclic exchange.
    ///
    /// # Errors
    ///
    /// Returns `PnioError::InvalidTransition` from any other state.
    pub fn comm_failure(&mut self, registry: &CyclicRegistry, error: PnioError) -> PnioResult<()> {
        let next = self.check(ConnectionEvent::CommFailure)?;
        let reason = error.to_string();
        warn!(device = %self.identity.station_name, error = %reason, "Communication failure");
        registry.stop(&self.identity.station_name);
        self.cyclic = None;
        self.last_error = Some(error);
        self.enter(ConnectionEvent::CommFailure, next, &reason);
        Ok(())
    }

    /// CONNECTING | DISCOVERY → OFFLINE.
    ///
    /// # Errors
    ///
    /// Returns `PnioError::InvalidTransition` from any other state.
    pub fn abort(&mut self, registry: &CyclicRegistry, reason: &str) -> PnioResult<()> {
        let next = self.check(ConnectionEvent::Abort)?;
        self.drop_session(registry);
        self.enter(ConnectionEvent::Abort, next, reason);
        Ok(())
    }

    /// Serializable view including the current IO data.
    #[must_use]
    pub fn snapshot(&self) -> DeviceSnapshot {
        let (inputs, outputs, input_valid) = self
            .cyclic
            .as_ref()
            .and_then(|c| c.lock().ok().map(|s| (s.input.clone(), s.output.clone(), s.valid)))
            .unwrap_or_default();
        DeviceSnapshot {
            identity: self.identity.clone(),
            state: self.state,
            last_error: self.last_error.as_ref().map(ToString::to_string),
            reason: self.reason.clone(),
            session_key: self.session.as_ref().map(|s| s.session_key),
            ar_uuid: self.session.as_ref().map(|s| s.ar_uuid),
            inputs,
            outputs,
            input_valid,
        }
    }
}
