//! Signal handling for the daemon.
//!
//! SIGTERM and SIGINT request shutdown, SIGHUP requests an immediate
//! status report. The signals are blocked for every thread and collected
//! by one `sigwait` thread, which only flips atomic flags that the
//! supervision loop polls.

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info};

/// Signals the daemon reacts to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignalKind {
    /// SIGTERM - graceful termination request.
    Terminate = 1,
    /// SIGINT - interrupt (Ctrl+C).
    Interrupt = 2,
    /// SIGHUP - log status now.
    Hangup = 3,
}

impl SignalKind {
    fn from_code(code: u32) -> Option<Self> {
        match code {
            1 => Some(Self::Terminate),
            2 => Some(Self::Interrupt),
            3 => Some(Self::Hangup),
            _ => None,
        }
    }
}

impl std::fmt::Display for SignalKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SignalKind::Terminate => write!(f, "SIGTERM"),
            SignalKind::Interrupt => write!(f, "SIGINT"),
            SignalKind::Hangup => write!(f, "SIGHUP"),
        }
    }
}

/// Flags shared between the signal thread and the supervision loop.
#[derive(Debug, Default)]
pub struct SignalState {
    shutdown_requested: AtomicBool,
    status_requested: AtomicBool,
    signal_count: AtomicU32,
    last_signal: AtomicU32,
}

impl SignalState {
    /// Create a state with no pending requests.
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether shutdown has been requested.
    #[inline]
    pub fn shutdown_requested(&self) -> bool {
        self.shutdown_requested.load(Ordering::Acquire)
    }

    /// Whether a status report was requested; clears the flag.
    #[inline]
    pub fn take_status_request(&self) -> bool {
        self.status_requested.swap(false, Ordering::AcqRel)
    }

    /// Request shutdown.
    pub fn request_shutdown(&self) {
        self.shutdown_requested.store(true, Ordering::Release);
    }

    /// Request a status report.
    pub fn request_status(&self) {
        self.status_requested.store(true, Ordering::Release);
    }

    /// Record a delivered signal and raise the matching request.
    pub fn deliver(&self, kind: SignalKind) {
        self.signal_count.fetch_add(1, Ordering::Relaxed);
        self.last_signal.store(kind as u32, Ordering::Relaxed);
        match kind {
            SignalKind::Terminate | SignalKind::Interrupt => self.request_shutdown(),
            SignalKind::Hangup => self.request_status(),
        }
    }

    /// Number of signals received.
    pub fn signal_count(&self) -> u32 {
        self.signal_count.load(Ordering::Relaxed)
    }

    /// Most recent signal received.
    pub fn last_signal(&self) -> Option<SignalKind> {
        SignalKind::from_code(self.last_signal.load(Ordering::Relaxed))
    }
}

/// Cloneable handle to the shared signal state.
#[derive(Debug, Clone, Default)]
pub struct SignalHandler {
    state: Arc<SignalState>,
}

impl SignalHandler {
    /// Block the handled signals and start the signal thread.
    ///
    /// Must run before any other thread is spawned: the signal mask is
    /// inherited, and a thread that does not block the signals would
    /// receive them with the default disposition.
    ///
    /// # Errors
    ///
    /// Returns an error if the signal mask cannot be changed or the
    /// signal thread cannot be spawned.
    pub fn install() -> std::io::Result<Self> {
        let handler = Self::default();

        #[cfg(unix)]
        handler.spawn_unix_waiter()?;

        Ok(handler)
    }

    #[cfg(unix)]
    fn spawn_unix_waiter(&self) -> std::io::Result<()> {
        use nix::sys::signal::{SigSet, Signal};

        let mut set = SigSet::empty();
        set.add(Signal::SIGTERM);
        set.add(Signal::SIGINT);
        set.add(Signal::SIGHUP);
        set.thread_block().map_err(std::io::Error::from)?;

        let state = Arc::clone(&self.state);
        std::thread::Builder::new()
            .name("pnio-signals".into())
            .spawn(move || loop {
                let kind = match set.wait() {
                    Ok(Signal::SIGTERM) => SignalKind::Terminate,
                    Ok(Signal::SIGINT) => SignalKind::Interrupt,
                    Ok(Signal::SIGHUP) => SignalKind::Hangup,
                    Ok(other) => {
                        debug!(signal = %other, "Ignoring unexpected signal");
                        continue;
                    }
                    Err(e) => {
                        tracing::warn!(error = %e, "sigwait failed, signal thread exiting");
                        break;
                    }
                };
                info!(signal = %kind, "Signal received");
                state.deliver(kind);
            })?;

        debug!("Unix signal handling installed");
        Ok(())
    }

    /// Whether shutdown has been requested.
    #[inline]
    pub fn shutdown_requested(&self) -> bool {
        self.state.shutdown_requested()
    }

    /// Whether a status report was requested; clears the flag.
    #[inline]
    pub fn take_status_request(&self) -> bool {
        self.state.take_status_request()
    }

    /// Request shutdown from inside the process.
    pub fn request_shutdown(&self) {
        info!("Manual shutdown requested");
        self.state.request_shutdown();
    }

    /// Shared state, for inspection.
    pub fn state(&self) -> &SignalState {
        &self.state
    }
}

/// Sleep up to `timeout`, returning early with `true` once shutdown is requested.
pub fn wait_for_shutdown(handler: &SignalHandler, timeout: Duration) -> bool {
    let start = Instant::now();
    let poll_interval = Duration::from_millis(10);

    loop {
        if handler.shutdown_requested() {
            return true;
        }
        let elapsed = start.elapsed();
        if elapsed >= timeout {
            return false;
        }
        std::thread::sleep(poll_interval.min(timeout - elapsed));
    }
}
