use thiserror::Error;

/// Controller error types covering configuration, wire codec, session setup,
/// cyclic exchange, and connection state failures.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum PnioError {
    /// Configuration or initialization error.
    #[error("configuration error: {0}")]
    Config(String),

    /// Socket or interface I/O error.
    #[error("I/O error: {0}")]
    Io(String),

    /// A frame or block could not be decoded.
    #[error("malformed data: {0}")]
    Malformed(String),

    /// The device answered the connect request with a non-zero status.
    #[error("connect rejected by device: {block} block, reason {reason:#04x} (status {status})")]
    ConnectRejected {
        /// Raw status tuple as `code/decode/code1/code2`.
        status: String,
        /// Name of the rejected request block.
        block: String,
        /// Device-specific reason code (error code 2).
        reason: u8,
    },

    /// No response arrived before the deadline.
    #[error("transport timeout: {0}")]
    TransportTimeout(String),

    /// Parameter-end or application-ready did not complete in time.
    #[error("handshake timeout: {0}")]
    HandshakeTimeout(String),

    /// A single cyclic frame could not be sent or received.
    #[error("cyclic I/O error: {0}")]
    CyclicIo(String),

    /// A state transition was requested that the current state does not define.
    #[error("invalid transition '{event}' from state {from}")]
    InvalidTransition {
        /// Requested transition.
        event: String,
        /// State the device was in.
        from: String,
    },

    /// Another device currently holds the system-wide connecting slot.
    #[error("cannot connect {requested}: {holder} is already connecting")]
    ConnectSlotBusy {
        /// Device that asked for the slot.
        requested: String,
        /// Device holding the slot.
        holder: String,
    },

    /// No device with the given station name is known.
    #[error("unknown device: {0}")]
    UnknownDevice(String),

    /// The device cannot be removed in its current state.
    #[error("device {name} cannot be removed while {state}")]
    DeviceInUse {
        /// Station name.
        name: String,
        /// Current connection state.
        state: String,
    },
}

impl From<std::io::Error> for PnioError {
    fn from(err: std::io::Error) -> Self {
        Self::Io(err.to_string())
    }
}

/// Convenience type alias for controller operations.
pub type PnioResult<T> = Result<T, PnioError>;
