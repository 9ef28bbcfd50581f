//! Cyclic real-time exchange with one device.
//!
//! Each running device gets two OS threads sharing one [`CyclicState`]
//! behind a mutex:
//!
//! - the output activity sends one frame per cycle with the current output
//!   buffer and an incrementing 16-bit counter
//! - the input activity receives the device's frames, tracks validity,
//!   and acknowledges alarm PDUs arriving on the same link
//!
//! Frame payload after the ethertype:
//! `[frame id u16][counter u16][data status][transfer status][data]`.
//!
//! A single stop flag ends both activities. The output activity is joined
//! with a bounded wait; the input activity is detached and exits at its next
//! receive deadline.

use crate::alarm::{is_alarm_frame, AlarmResponder};
use crate::ethernet::{
    build_frame, EthernetFrame, EthernetLink, FrameChannel, ETHERTYPE_PROFINET, ETH_MAX_FRAME,
};
use pnio_common::error::{PnioError, PnioResult};
use pnio_common::mac::MacAddress;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::{debug, info, trace, warn};

/// Data status: primary provider.
pub const DATA_STATUS_PRIMARY: u8 = 0x01;
/// Data status: data valid.
pub const DATA_STATUS_VALID: u8 = 0x04;
/// Data status: provider running.
pub const DATA_STATUS_PROVIDER_RUN: u8 = 0x10;
/// Data status: station problem indicator (set means a problem).
pub const DATA_STATUS_STATION_PROBLEM: u8 = 0x20;

/// Data status the controller sends: primary, valid, running, no problem.
pub const OUTPUT_DATA_STATUS: u8 =
    DATA_STATUS_PRIMARY | DATA_STATUS_VALID | DATA_STATUS_PROVIDER_RUN;

/// Frame id plus counter, data status, and transfer status.
pub const CYCLIC_HEADER_LEN: usize = 6;

/// Receive deadline of the input activity; bounds how long it outlives a stop.
const INPUT_POLL: Duration = Duration::from_millis(20);

/// Longest single sleep of the output activity between stop-flag checks.
const OUTPUT_SLEEP_SLICE: Duration = Duration::from_millis(5);

/// Next cycle counter value (wraps 65535 → 0).
#[must_use]
pub fn next_counter(counter: u16) -> u16 {
    counter.wrapping_add(1)
}

/// Provider running and no station problem.
#[must_use]
pub fn data_status_valid(data_status: u8) -> bool {
    data_status & DATA_STATUS_PROVIDER_RUN != 0 && data_status & DATA_STATUS_STATION_PROBLEM == 0
}

/// One cyclic frame's payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CyclicPdu<'a> {
    /// Frame id.
    pub frame_id: u16,
    /// Cycle counter.
    pub counter: u16,
    /// Data status.
    pub data_status: u8,
    /// Transfer status.
    pub transfer_status: u8,
    /// IO data.
    pub data: &'a [u8],
}

impl<'a> CyclicPdu<'a> {
    /// Decode the bytes following the ethertype.
    #[must_use]
    pub fn decode(payload: &'a [u8]) -> Option<Self> {
        if payload.len() < CYCLIC_HEADER_LEN {
            return None;
        }
        Some(Self {
            frame_id: u16::from_be_bytes([payload[0], payload[1]]),
            counter: u16::from_be_bytes([payload[2], payload[3]]),
            data_status: payload[4],
            transfer_status: payload[5],
            data: &payload[CYCLIC_HEADER_LEN..],
        })
    }

    /// Encode to the bytes following the ethertype.
    #[must_use]
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(CYCLIC_HEADER_LEN + self.data.len());
        out.extend_from_slice(&self.frame_id.to_be_bytes());
        out.extend_from_slice(&self.counter.to_be_bytes());
        out.push(self.data_status);
        out.push(self.transfer_status);
        out.extend_from_slice(self.data);
        out
    }

    /// Whether the provider reports usable data.
    #[must_use]
    pub fn is_valid(&self) -> bool {
        data_status_valid(self.data_status)
    }
}

/// Mutable exchange state of one device.
#[derive(Debug, Clone)]
pub struct CyclicState {
    /// Last output counter sent.
    pub counter: u16,
    /// Counter of the last received input frame.
    pub input_counter: Option<u16>,
    /// When the last input frame arrived.
    pub last_input: Option<Instant>,
    /// When the last valid input frame arrived.
    pub last_valid_input: Option<Instant>,
    /// When the last output frame was sent.
    pub last_output: Option<Instant>,
    /// Latest input data.
    pub input: Vec<u8>,
    /// Output data sent every cycle.
    pub output: Vec<u8>,
    /// Validity of the latest input frame.
    pub valid: bool,
    /// Failed sends, receive errors, and malformed frames.
    pub error_count: u64,
    /// Frames sent.
    pub frames_sent: u64,
    /// Input frames received.
    pub frames_received: u64,
    /// Alarm PDUs acknowledged.
    pub alarms_acknowledged: u64,
    /// When the engine started.
    pub started: Instant,
}

impl CyclicState {
    fn new(output: Vec<u8>, input_length: usize) -> Self {
        Self {
            counter: 0,
            input_counter: None,
            last_input: None,
            last_valid_input: None,
            last_output: None,
            input: vec![0; input_length],
            output,
            valid: false,
            error_count: 0,
            frames_sent: 0,
            frames_received: 0,
            alarms_acknowledged: 0,
            started: Instant::now(),
        }
    }
}

/// Shared handle to a device's cyclic state.
pub type SharedCyclicState = Arc<Mutex<CyclicState>>;

/// Called by the input activity with each input frame's data.
pub type InputCallback = Arc<dyn Fn(&[u8], Instant) + Send + Sync>;

fn lock(state: &SharedCyclicState) -> PnioResult<MutexGuard<'_, CyclicState>> {
    state
        .lock()
        .map_err(|_| PnioError::CyclicIo("cyclic state lock poisoned".into()))
}

/// Latest input as seen by the application.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InputSnapshot {
    /// Input data.
    pub data: Vec<u8>,
    /// Arrival time of the last frame.
    pub timestamp: Option<Instant>,
    /// Validity of the last frame.
    pub valid: bool,
}

/// Counters reported by [`CyclicRegistry::stats`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CyclicStats {
    /// Device station name.
    pub device: String,
    /// Last output counter.
    pub counter: u16,
    /// Validity of the latest input.
    pub valid: bool,
    /// Error counter.
    pub error_count: u64,
    /// Frames sent.
    pub frames_sent: u64,
    /// Frames received.
    pub frames_received: u64,
    /// Alarms acknowledged.
    pub alarms_acknowledged: u64,
    /// Milliseconds since the last input frame.
    pub last_input_age_ms: Option<u64>,
}

impl CyclicStats {
    fn from_state(device: &str, state: &CyclicState) -> Self {
        Self {
            device: device.to_string(),
            counter: state.counter,
            valid: state.valid,
            error_count: state.error_count,
            frames_sent: state.frames_sent,
            frames_received: state.frames_received,
            alarms_acknowledged: state.alarms_acknowledged,
            last_input_age_ms: state
                .last_input
                .map(|t| u64::try_from(t.elapsed().as_millis()).unwrap_or(u64::MAX)),
        }
    }
}

/// Everything the engine needs to talk to one device.
#[derive(Debug, Clone)]
pub struct CyclicParams {
    /// Device station name.
    pub device: String,
    /// Controller MAC (frame source).
    pub controller_mac: MacAddress,
    /// Device MAC (frame destination, input filter).
    pub device_mac: MacAddress,
    /// Frame id of device → controller frames.
    pub input_frame_id: u16,
    /// Frame id of controller → device frames.
    pub output_frame_id: u16,
    /// Output period.
    pub cycle_interval: Duration,
    /// Bounded wait for the output activity on stop.
    pub stop_timeout: Duration,
    /// Pause after a failed send.
    pub error_backoff: Duration,
    /// Input data length.
    pub input_length: usize,
    /// Initial output buffer (its length is the output data length).
    pub initial_output: Vec<u8>,
    /// Controller alarm endpoint reference.
    pub alarm_reference: u16,
}

fn sleep_while_running(stop: &AtomicBool, duration: Duration) {
    let deadline = Instant::now() + duration;
    loop {
        if stop.load(Ordering::Acquire) {
            return;
        }
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            return;
        }
        thread::sleep(remaining.min(OUTPUT_SLEEP_SLICE));
    }
}

struct OutputActivity {
    channel: Box<dyn FrameChannel>,
    state: SharedCyclicState,
    stop: Arc<AtomicBool>,
    device: String,
    dst: MacAddress,
    src: MacAddress,
    frame_id: u16,
    interval: Duration,
    backoff: Duration,
}

impl OutputActivity {
    fn run(mut self) {
        debug!(
            device = %self.device,
            frame_id = self.frame_id,
            interval = ?self.interval,
            "Output activity started"
        );
        let mut next = Instant::now();

        while !self.stop.load(Ordering::Acquire) {
            let frame = match lock(&self.state) {
                Ok(mut state) => {
                    state.counter = next_counter(state.counter);
                    let pdu = CyclicPdu {
                        frame_id: self.frame_id,
                        counter: state.counter,
                        data_status: OUTPUT_DATA_STATUS,
                        transfer_status: 0,
                        data: &state.output,
                    };
                    build_frame(self.dst, self.src, ETHERTYPE_PROFINET, &pdu.encode())
                }
                Err(e) => {
                    warn!(device = %self.device, error = %e, "Output activity abandoned");
                    break;
                }
            };

            match self.channel.send(&frame) {
                Ok(()) => {
                    if let Ok(mut state) = lock(&self.state) {
                        state.frames_sent += 1;
                        state.last_output = Some(Instant::now());
                    }
                }
                Err(e) => {
                    let err = PnioError::CyclicIo(e.to_string());
                    warn!(device = %self.device, error = %err, "Output frame not sent");
                    if let Ok(mut state) = lock(&self.state) {
                        state.error_count += 1;
                    }
                    sleep_while_running(&self.stop, self.backoff);
                }
            }

            next += self.interval;
            let now = Instant::now();
            if next > now {
                sleep_while_running(&self.stop, next - now);
            } else {
                trace!(device = %self.device, late = ?(now - next), "Output cycle overrun");
                next = now;
            }
        }

        debug!(device = %self.device, "Output activity stopped");
    }
}

struct InputActivity {
    channel: Box<dyn FrameChannel>,
    state: SharedCyclicState,
    stop: Arc<AtomicBool>,
    device: String,
    device_mac: MacAddress,
    controller_mac: MacAddress,
    frame_id: u16,
    input_length: usize,
    backoff: Duration,
    alarms: AlarmResponder,
    on_input: Option<InputCallback>,
}

impl InputActivity {
    fn run(mut self) {
        debug!(device = %self.device, frame_id = self.frame_id, "Input activity started");
        let mut buf = vec![0u8; ETH_MAX_FRAME];

        while !self.stop.load(Ordering::Acquire) {
            let len = match self.channel.recv(&mut buf, INPUT_POLL) {
                Ok(Some(len)) => len,
                Ok(None) => continue,
                Err(e) => {
                    warn!(device = %self.device, error = %e, "Input receive failed");
                    self.count_error();
                    sleep_while_running(&self.stop, self.backoff);
                    continue;
                }
            };
            if self.stop.load(Ordering::Acquire) {
                break;
            }
            self.handle_frame(&buf[..len]);
        }

        debug!(device = %self.device, "Input activity stopped");
    }

    fn count_error(&self) {
        if let Ok(mut state) = lock(&self.state) {
            state.error_count += 1;
        }
    }

    fn handle_frame(&mut self, bytes: &[u8]) {
        let Some(eth) = EthernetFrame::parse(bytes) else {
            return;
        };
        if eth.src != self.device_mac
            || eth.ethertype != ETHERTYPE_PROFINET
            || eth.payload.len() < 2
        {
            return;
        }
        let frame_id = u16::from_be_bytes([eth.payload[0], eth.payload[1]]);

        if frame_id == self.frame_id {
            self.handle_input(eth.payload);
        } else if is_alarm_frame(frame_id) {
            self.handle_alarm(eth.payload);
        }
    }

    fn handle_input(&mut self, payload: &[u8]) {
        let Some(pdu) = CyclicPdu::decode(payload) else {
            warn!(device = %self.device, len = payload.len(), "Truncated input frame");
            self.count_error();
            return;
        };
        let now = Instant::now();
        let valid = pdu.is_valid();
        let data = &pdu.data[..pdu.data.len().min(self.input_length)];

        match lock(&self.state) {
            Ok(mut state) => {
                state.frames_received += 1;
                state.input_counter = Some(pdu.counter);
                state.last_input = Some(now);
                state.valid = valid;
                if valid {
                    state.last_valid_input = Some(now);
                }
                state.input.clear();
                state.input.extend_from_slice(data);
            }
            Err(e) => {
                warn!(device = %self.device, error = %e, "Input dropped");
                return;
            }
        }
        trace!(
            device = %self.device,
            counter = pdu.counter,
            status = pdu.data_status,
            valid,
            "Input frame"
        );

        if let Some(callback) = &self.on_input {
            callback(data, now);
        }
    }

    fn handle_alarm(&mut self, payload: &[u8]) {
        match self.alarms.handle(payload) {
            Ok(Some(ack)) => {
                let frame =
                    build_frame(self.device_mac, self.controller_mac, ETHERTYPE_PROFINET, &ack);
                if let Err(e) = self.channel.send(&frame) {
                    warn!(device = %self.device, error = %e, "Alarm acknowledgement not sent");
                    self.count_error();
                } else if let Ok(mut state) = lock(&self.state) {
                    state.alarms_acknowledged = self.alarms.acknowledged();
                }
            }
            Ok(None) => {}
            Err(e) => {
                warn!(device = %self.device, error = %e, "Malformed alarm frame");
                self.count_error();
            }
        }
    }
}

/// Running cyclic exchange with one device.
#[derive(Debug)]
pub struct CyclicEngine {
    device: String,
    state: SharedCyclicState,
    stop: Arc<AtomicBool>,
    output_handle: Option<JoinHandle<()>>,
    input_handle: Option<JoinHandle<()>>,
    stop_timeout: Duration,
}

impl CyclicEngine {
    /// Open channels on `link` and start both activities.
    ///
    /// # Errors
    ///
    /// Returns `PnioError::Io` if a channel cannot be opened, or
    /// `PnioError::CyclicIo` if a thread cannot be spawned.
    pub fn start(
        link: &dyn EthernetLink,
        params: CyclicParams,
        on_input: Option<InputCallback>,
    ) -> PnioResult<Self> {
        let output_channel = link.open_channel()?;
        let input_channel = link.open_channel()?;

        let state = Arc::new(Mutex::new(CyclicState::new(
            params.initial_output.clone(),
            params.input_length,
        )));
        let stop = Arc::new(AtomicBool::new(false));

        let output = OutputActivity {
            channel: output_channel,
            state: Arc::clone(&state),
            stop: Arc::clone(&stop),
            device: params.device.clone(),
            dst: params.device_mac,
            src: params.controller_mac,
            frame_id: params.output_frame_id,
            interval: params.cycle_interval,
            backoff: params.error_backoff,
        };
        let output_handle = thread::Builder::new()
            .name(format!("pnio-out-{}", params.device))
            .spawn(move || output.run())
            .map_err(|e| PnioError::CyclicIo(format!("failed to spawn output activity: {e}")))?;

        let input = InputActivity {
            channel: input_channel,
            state: Arc::clone(&state),
            stop: Arc::clone(&stop),
            device: params.device.clone(),
            device_mac: params.device_mac,
            controller_mac: params.controller_mac,
            frame_id: params.input_frame_id,
            input_length: params.input_length,
            backoff: params.error_backoff,
            alarms: AlarmResponder::new(params.alarm_reference),
            on_input,
        };
        let input_handle = match thread::Builder::new()
            .name(format!("pnio-in-{}", params.device))
            .spawn(move || input.run())
        {
            Ok(handle) => handle,
            Err(e) => {
                stop.store(true, Ordering::Release);
                let _ = output_handle.join();
                return Err(PnioError::CyclicIo(format!("failed to spawn input activity: {e}")));
            }
        };

        info!(
            device = %params.device,
            mac = %params.device_mac,
            cycle = ?params.cycle_interval,
            output_len = params.initial_output.len(),
            input_len = params.input_length,
            "Cyclic exchange started"
        );

        Ok(Self {
            device: params.device,
            state,
            stop,
            output_handle: Some(output_handle),
            input_handle: Some(input_handle),
            stop_timeout: params.stop_timeout,
        })
    }

    /// Device station name.
    #[must_use]
    pub fn device(&self) -> &str {
        &self.device
    }

    /// Shared state handle.
    #[must_use]
    pub fn state(&self) -> SharedCyclicState {
        Arc::clone(&self.state)
    }

    /// Whether both activities are still meant to run.
    #[must_use]
    pub fn is_running(&self) -> bool {
        !self.stop.load(Ordering::Acquire)
    }

    /// Replace the start of the output buffer with `bytes`.
    ///
    /// # Errors
    ///
    /// Returns `PnioError::CyclicIo` if `bytes` exceeds the output length.
    pub fn set_output(&self, bytes: &[u8]) -> PnioResult<()> {
        self.write_output(0, bytes)
    }

    /// Write `bytes` into the output buffer at `offset`.
    ///
    /// # Errors
    ///
    /// Returns `PnioError::CyclicIo` if the write would run past the buffer.
    pub fn write_output(&self, offset: usize, bytes: &[u8]) -> PnioResult<()> {
        let mut state = lock(&self.state)?;
        let len = state.output.len();
        let end = match offset.checked_add(bytes.len()) {
            Some(end) if end <= len => end,
            _ => {
                return Err(PnioError::CyclicIo(format!(
                    "output write of {} bytes at {offset} exceeds data length {len}",
                    bytes.len()
                )));
            }
        };
        state.output[offset..end].copy_from_slice(bytes);
        Ok(())
    }

    /// Latest input.
    ///
    /// # Errors
    ///
    /// Returns `PnioError::CyclicIo` if the state lock is poisoned.
    pub fn get_input(&self) -> PnioResult<InputSnapshot> {
        let state = lock(&self.state)?;
        Ok(InputSnapshot {
            data: state.input.clone(),
            timestamp: state.last_input,
            valid: state.valid,
        })
    }

    /// Counter snapshot.
    #[must_use]
    pub fn stats(&self) -> Option<CyclicStats> {
        lock(&self.state).ok().map(|s| CyclicStats::from_state(&self.device, &s))
    }

    /// Stop both activities.
    ///
    /// Waits at most the configured stop timeout for the output activity.
    pub fn stop(&mut self) {
        if self.stop.swap(true, Ordering::AcqRel) && self.output_handle.is_none() {
            return;
        }
        info!(device = %self.device, "Stopping cyclic exchange");

        if let Some(handle) = self.output_handle.take() {
            let deadline = Instant::now() + self.stop_timeout;
            while !handle.is_finished() && Instant::now() < deadline {
                thread::sleep(Duration::from_millis(1));
            }
            if handle.is_finished() {
                if let Err(e) = handle.join() {
                    warn!(device = %self.device, "Output activity panicked: {:?}", e);
                }
            } else {
                warn!(
                    device = %self.device,
                    timeout = ?self.stop_timeout,
                    "Output activity did not stop in time; detaching"
                );
            }
        }

        // Exits on its own at the next receive deadline
        self.input_handle.take();
    }
}

impl Drop for CyclicEngine {
    fn drop(&mut self) {
        self.stop();
    }
}

/// All running engines, keyed by device name.
pub struct CyclicRegistry {
    link: Arc<dyn EthernetLink>,
    engines: Mutex<HashMap<String, CyclicEngine>>,
}

impl std::fmt::Debug for CyclicRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CyclicRegistry")
            .field("devices", &self.devices())
            .finish_non_exhaustive()
    }
}

impl CyclicRegistry {
    /// Empty registry on `link`.
    #[must_use]
    pub fn new(link: Arc<dyn EthernetLink>) -> Self {
        Self {
            link,
            engines: Mutex::new(HashMap::new()),
        }
    }

    fn engines(&self) -> PnioResult<MutexGuard<'_, HashMap<String, CyclicEngine>>> {
        self.engines
            .lock()
            .map_err(|_| PnioError::CyclicIo("cyclic registry lock poisoned".into()))
    }

    /// Start an engine, replacing any engine already running for the device.
    ///
    /// # Errors
    ///
    /// Propagates [`CyclicEngine::start`] failures.
    pub fn start(
        &self,
        params: CyclicParams,
        on_input: Option<InputCallback>,
    ) -> PnioResult<SharedCyclicState> {
        let device = params.device.clone();
        // Stopping waits on threads; never do that under the registry lock
        let previous = self.engines()?.remove(&device);
        drop(previous);

        let engine = CyclicEngine::start(self.link.as_ref(), params, on_input)?;
        let state = engine.state();
        self.engines()?.insert(device, engine);
        Ok(state)
    }

    /// Stop one device's engine. Returns whether one was running.
    pub fn stop(&self, device: &str) -> bool {
        let engine = self.engines().ok().and_then(|mut e| e.remove(device));
        match engine {
            Some(mut engine) => {
                engine.stop();
                true
            }
            None => false,
        }
    }

    /// Stop every engine. Returns how many were running.
    pub fn stop_all(&self) -> usize {
        let drained: Vec<CyclicEngine> = match self.engines() {
            Ok(mut engines) => engines.drain().map(|(_, e)| e).collect(),
            Err(_) => Vec::new(),
        };
        let count = drained.len();
        for mut engine in drained {
            engine.stop();
        }
        if count > 0 {
            info!(count, "All cyclic exchanges stopped");
        }
        count
    }

    /// Whether an engine runs for `device`.
    #[must_use]
    pub fn is_running(&self, device: &str) -> bool {
        self.engines().map(|e| e.contains_key(device)).unwrap_or(false)
    }

    /// Names of devices with a running engine, sorted.
    #[must_use]
    pub fn devices(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .engines()
            .map(|e| e.keys().cloned().collect())
            .unwrap_or_default();
        names.sort();
        names
    }

    /// Replace the start of a device's output buffer.
    ///
    /// # Errors
    ///
    /// Returns `PnioError::UnknownDevice` if no engine runs for `device`.
    pub fn set_output(&self, device: &str, bytes: &[u8]) -> PnioResult<()> {
        self.write_output(device, 0, bytes)
    }

    /// Write into a device's output buffer at `offset`.
    ///
    /// # Errors
    ///
    /// Returns `PnioError::UnknownDevice` if no engine runs for `device`, or
    /// `PnioError::CyclicIo` if the write is out of range.
    pub fn write_output(&self, device: &str, offset: usize, bytes: &[u8]) -> PnioResult<()> {
        let engines = self.engines()?;
        let engine = engines
            .get(device)
            .ok_or_else(|| PnioError::UnknownDevice(device.to_string()))?;
        engine.write_output(offset, bytes)
    }

    /// Latest input of a device.
    ///
    /// # Errors
    ///
    /// Returns `PnioError::UnknownDevice` if no engine runs for `device`.
    pub fn get_input(&self, device: &str) -> PnioResult<InputSnapshot> {
        let engines = self.engines()?;
        let engine = engines
            .get(device)
            .ok_or_else(|| PnioError::UnknownDevice(device.to_string()))?;
        engine.get_input()
    }

    /// Counters of every running engine, sorted by device.
    #[must_use]
    pub fn stats(&self) -> Vec<CyclicStats> {
        let mut stats: Vec<CyclicStats> = self
            .engines()
            .map(|e| e.values().filter_map(CyclicEngine::stats).collect())
            .unwrap_or_default();
        stats.sort_by(|a, b| a.device.cmp(&b.device));
        stats
    }
}

impl Drop for CyclicRegistry {
    fn drop(&mut self) {
        self.stop_all();
    }
}
