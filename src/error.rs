use thiserror::Error;

/// Errors that can occur while driving a trainer, a heart-rate source or a workout session
#[derive(Error, Debug)]
pub enum ErgZoneError {
    /// Bluetooth Low Energy related errors
    #[error("BLE error: {0}")]
    Ble(#[from] btleplug::Error),

    /// Device not found during scanning
    #[error("Device not found")]
    DeviceNotFound,

    /// Device connection failed
    #[error("Failed to connect to device: {0}")]
    ConnectionFailed(String),

    /// Device disconnected unexpectedly
    #[error("Device disconnected")]
    Disconnected,

    /// Operation did not complete before its deadline
    #[error("Operation timed out after {timeout_ms}ms")]
    Timeout {
        /// Timeout duration in milliseconds
        timeout_ms: u64,
    },

    /// Invalid command or configuration parameters
    #[error("Invalid parameters: {0}")]
    InvalidParameters(String),

    /// Protocol error (missing service, missing characteristic, bad frame)
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// The trainer answered a control-point command with a non-success result code
    #[error("Command {opcode:#04X} rejected with result code {result_code:#04X}")]
    CommandRejected {
        /// Echoed opcode
        opcode: u8,
        /// Raw result code reported by the trainer
        result_code: u8,
    },

    /// Component is not ready for the requested operation
    #[error("Not ready: {reason}")]
    NotReady {
        /// Reason why the component is not ready
        reason: String,
    },

    /// Operation is not valid in the current state
    #[error("Invalid state: {state}")]
    InvalidState {
        /// Current state description
        state: String,
    },

    /// A dependent session could not start because authorization is missing
    #[error("Not authorized: {0}")]
    NotAuthorized(String),

    /// A heart-rate source switch is already in flight
    #[error("Heart-rate source switch already in progress")]
    SwitchInProgress,

    /// Message parsing failed
    #[error("Failed to parse message: {0}")]
    ParseError(String),

    /// Settings document could not be read
    #[error("Settings error: {0}")]
    Settings(#[from] serde_json::Error),

    /// Other errors
    #[error("Other error: {0}")]
    Other(String),
}

/// Result type for ergzone operations
pub type Result<T> = std::result::Result<T, ErgZoneError>;

impl ErgZoneError {
    /// Check if this error indicates a transient connection issue
    #[must_use]
    pub const fn is_connection_error(&self) -> bool {
        matches!(
            self,
            Self::Ble(_)
                | Self::ConnectionFailed(_)
                | Self::Disconnected
                | Self::DeviceNotFound
                | Self::Timeout { .. }
        )
    }

    /// Check if the caller can simply retry the operation
    #[must_use]
    pub const fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Self::Timeout { .. }
                | Self::NotReady { .. }
                | Self::SwitchInProgress
                | Self::CommandRejected { .. }
        )
    }

    /// Check if the trainer itself refused a command (as opposed to an I/O failure)
    #[must_use]
    pub const fn is_protocol_rejection(&self) -> bool {
        matches!(self, Self::CommandRejected { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_classification() {
        let connection_error = ErgZoneError::ConnectionFailed("out of range".to_string());
        assert!(connection_error.is_connection_error());
        assert!(!connection_error.is_recoverable());
        assert!(!connection_error.is_protocol_rejection());

        let rejected = ErgZoneError::CommandRejected {
            opcode: 0x05,
            result_code: 0x05,
        };
        assert!(!rejected.is_connection_error());
        assert!(rejected.is_recoverable());
        assert!(rejected.is_protocol_rejection());

        let unauthorized = ErgZoneError::NotAuthorized("health data".to_string());
        assert!(!unauthorized.is_connection_error());
        assert!(!unauthorized.is_recoverable());
    }

    #[test]
    fn test_error_display() {
        let error = ErgZoneError::CommandRejected {
            opcode: 0x00,
            result_code: 0x05,
        };
        let error_string = format!("{error}");
        assert!(error_string.contains("0x00"));
        assert!(error_string.contains("0x05"));

        let error = ErgZoneError::InvalidParameters("zone minimum must be below maximum".to_string());
        assert!(format!("{error}").contains("zone minimum"));
    }
}
