//! Error types for the client layer.

use std::time::Duration;
use thiserror::Error;
use treeline_engine::status::{
    self, INSUFFSUBS, INVSTRLEN, INVVARNAME, LOCK_TIMEOUT, MAXNRSUBSCRIPTS, NOTOK, PARAMINVALID,
    PARMOFLOW, STRUCTNOTALLOCD, TP_RESTART, TP_ROLLBACK,
};

/// Status codes for conditions detected by the client rather than the engine.
///
/// They share the engine's negative, facility-coded layout under a separate
/// facility so they never collide with engine codes.
pub mod codes {
    const FACILITY: i32 = 2295;

    const fn code(message: i32) -> i32 {
        -((FACILITY << 16) | (message << 3) | 2)
    }

    /// The engine broke the capacity-report contract.
    pub const PROTOCOL_VIOLATION: i32 = code(1);
    /// Engine rundown did not finish within the allotted wait.
    pub const SHUTDOWN_INCOMPLETE: i32 = code(2);
    /// A transaction trampoline was invoked with an unknown token.
    pub const CALLBACK_NOT_FOUND: i32 = code(3);
}

/// Result type for client operations.
pub type ClientResult<T> = Result<T, ClientError>;

/// Errors that can occur in client operations.
#[derive(Debug, Clone, Error)]
pub enum ClientError {
    /// A buffer or buffer set was used before it was allocated or after release.
    #[error("buffer not allocated")]
    NotAllocated,

    /// A buffer's used length exceeds its capacity.
    #[error("stale buffer length: {used} bytes used, {capacity} allocated")]
    StaleLength {
        /// The bytes that fit in the buffer.
        partial: Vec<u8>,
        /// Recorded used length.
        used: u32,
        /// Buffer capacity.
        capacity: u32,
    },

    /// A value does not fit the buffer; `required` is what would fit it.
    #[error("capacity exceeded: {required} bytes required, {capacity} allocated")]
    CapacityExceeded {
        /// Length needed.
        required: u32,
        /// Buffer capacity.
        capacity: u32,
    },

    /// More result elements than the buffer set holds.
    #[error("too many result elements: {required} required, {capacity} allocated")]
    TooManyResultElements {
        /// Element count needed.
        required: u32,
        /// Elements allocated.
        capacity: u32,
    },

    /// Element index outside the allocated range.
    #[error("index {index} out of range for {len} elements")]
    IndexOutOfRange {
        /// Requested index or count.
        index: usize,
        /// Allocated elements.
        len: usize,
    },

    /// A variadic call needs more argument slots than the parameter block has.
    #[error("argument overflow: {count} slots needed, {max} available")]
    ArgumentOverflow {
        /// Slots needed.
        count: usize,
        /// Slots available.
        max: usize,
    },

    /// Variable name is empty or too long.
    #[error("invalid variable name: {name:?}")]
    InvalidVarname {
        /// The rejected name.
        name: String,
    },

    /// More subscripts than the engine allows.
    #[error("too many subscripts: {count} (max {max})")]
    TooManySubscripts {
        /// Subscripts supplied.
        count: usize,
        /// Engine limit.
        max: usize,
    },

    /// An argument cannot be passed to the engine.
    #[error("invalid argument: {message}")]
    InvalidArgument {
        /// What was wrong.
        message: String,
    },

    /// The engine broke the call contract (for example an endless retry).
    #[error("protocol violation: {message}")]
    ProtocolViolation {
        /// Description of the violation.
        message: String,
    },

    /// The engine reported an error.
    #[error("engine error {code}: {message}")]
    Engine {
        /// Native status code.
        code: i32,
        /// Message text from the engine.
        message: String,
    },

    /// Engine rundown did not finish in time.
    #[error("shutdown incomplete after {waited:?}")]
    ShutdownIncomplete {
        /// How long shutdown waited.
        waited: Duration,
    },
}

impl ClientError {
    /// Creates an engine error.
    pub fn engine(code: i32, message: impl Into<String>) -> Self {
        Self::Engine {
            code,
            message: message.into(),
        }
    }

    /// Creates a protocol violation error.
    pub fn protocol_violation(message: impl Into<String>) -> Self {
        Self::ProtocolViolation {
            message: message.into(),
        }
    }

    /// Creates an invalid varname error.
    pub fn invalid_varname(name: impl Into<String>) -> Self {
        Self::InvalidVarname { name: name.into() }
    }

    /// Creates an invalid argument error.
    pub fn invalid_argument(message: impl Into<String>) -> Self {
        Self::InvalidArgument {
            message: message.into(),
        }
    }

    /// Returns the status code this error corresponds to.
    pub fn code(&self) -> i32 {
        match self {
            Self::NotAllocated => STRUCTNOTALLOCD,
            Self::StaleLength { .. } | Self::CapacityExceeded { .. } => INVSTRLEN,
            Self::TooManyResultElements { .. } | Self::IndexOutOfRange { .. } => INSUFFSUBS,
            Self::ArgumentOverflow { .. } => PARMOFLOW,
            Self::InvalidVarname { .. } => INVVARNAME,
            Self::TooManySubscripts { .. } => MAXNRSUBSCRIPTS,
            Self::InvalidArgument { .. } => PARAMINVALID,
            Self::ProtocolViolation { .. } => codes::PROTOCOL_VIOLATION,
            Self::Engine { code, .. } => *code,
            Self::ShutdownIncomplete { .. } => codes::SHUTDOWN_INCOMPLETE,
        }
    }

    /// Returns true if this error carries `code`.
    pub fn is(&self, code: i32) -> bool {
        self.code() == code
    }

    /// Returns the engine mnemonic for this error's code, if it has one.
    pub fn mnemonic(&self) -> Option<&'static str> {
        status::mnemonic(self.code())
    }
}

/// Message text for positive status codes, which carry no error string.
pub(crate) fn special_message(code: i32) -> Option<&'static str> {
    match code {
        TP_RESTART => Some("transaction restart requested"),
        TP_ROLLBACK => Some("transaction rolled back"),
        NOTOK => Some("operation failed"),
        LOCK_TIMEOUT => Some("lock request timed out"),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use treeline_engine::status::GVUNDEF;

    #[test]
    fn codes_preserve_identity() {
        assert_eq!(ClientError::NotAllocated.code(), STRUCTNOTALLOCD);
        assert_eq!(
            ClientError::CapacityExceeded { required: 9, capacity: 4 }.code(),
            INVSTRLEN
        );
        assert_eq!(ClientError::ArgumentOverflow { count: 40, max: 36 }.code(), PARMOFLOW);
        assert!(ClientError::engine(GVUNDEF, "x").is(GVUNDEF));
        assert_eq!(ClientError::engine(GVUNDEF, "x").mnemonic(), Some("GVUNDEF"));
    }

    #[test]
    fn client_codes_are_distinct_errors() {
        let all = [
            codes::PROTOCOL_VIOLATION,
            codes::SHUTDOWN_INCOMPLETE,
            codes::CALLBACK_NOT_FOUND,
        ];
        for (i, a) in all.iter().enumerate() {
            assert!(*a < 0);
            assert!(status::message(*a).is_none());
            assert!(all[i + 1..].iter().all(|b| b != a));
        }
    }

    #[test]
    fn error_display() {
        let err = ClientError::StaleLength {
            partial: b"ab".to_vec(),
            used: 5,
            capacity: 2,
        };
        assert_eq!(err.to_string(), "stale buffer length: 5 bytes used, 2 allocated");
        let err = ClientError::engine(LOCK_TIMEOUT, "lock request timed out");
        assert!(err.to_string().contains("lock request timed out"));
    }
}
