//! Error types for device reservation
use thiserror::Error;

/// Result type for device pool operations
pub type Result<T> = std::result::Result<T, Error>;

/// How the pool and the test harness react to an [`Error`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// A structural invariant was violated or the platform is unusable.
    /// Indicates a caller bug or a broken environment.
    Fatal,
    /// The requested configuration is categorically unsupported; the test
    /// should be skipped rather than failed.
    Skip,
    /// The test failed, but the device is still safe to hand out again.
    Recoverable,
    /// The device must be discarded and recreated on next reservation.
    NonRecoverable,
}

/// Error type for device pool operations
#[derive(Error, Debug)]
pub enum Error {
    /// Pool configuration is invalid
    #[error("Configuration error: {message}")]
    Configuration {
        /// The error message
        message: String,
    },

    /// Adapter or device creation failed
    #[error("Initialization failed for device '{resource_id}': {reason}")]
    Initialization {
        /// The descriptor key (or `default`)
        resource_id: String,
        /// The failure reason
        reason: String,
    },

    /// Device is not available and will not be retried
    #[error("Device '{resource_id}' is unavailable: {reason}")]
    Unavailable {
        /// The descriptor key (or `default`)
        resource_id: String,
        /// The unavailability reason
        reason: String,
        /// Whether the device might become available later
        retryable: bool,
    },

    /// The adapter lacks one or more required features
    #[error("Features not supported for device '{resource_id}': {}", .features.join(", "))]
    FeaturesNotSupported {
        /// The descriptor key
        resource_id: String,
        /// The missing features
        features: Vec<String>,
    },

    /// The adapter cannot satisfy one or more required limits
    #[error("Limits not supported for device '{resource_id}': {}", .limits.join(", "))]
    LimitsNotSupported {
        /// The descriptor key
        resource_id: String,
        /// The unsatisfiable limits
        limits: Vec<String>,
    },

    /// The descriptor is known to be unsupported; skip the test
    #[error("Skipping test for device '{resource_id}': {reason}")]
    Skip {
        /// The descriptor key
        resource_id: String,
        /// Why the configuration is unsupported
        reason: String,
    },

    /// A validation error was captured while the device was acquired
    #[error("Validation error on device '{resource_id}': {message}")]
    Validation {
        /// The descriptor key (or `default`)
        resource_id: String,
        /// The captured error message
        message: String,
    },

    /// An out-of-memory error was captured while the device was acquired
    #[error("Out of memory on device '{resource_id}': {message}")]
    OutOfMemory {
        /// The descriptor key (or `default`)
        resource_id: String,
        /// The captured error message
        message: String,
    },

    /// Popping an error scope was rejected
    #[error("Error scope pop rejected on device '{resource_id}': {message}")]
    ScopeRejected {
        /// The descriptor key (or `default`)
        resource_id: String,
        /// The rejection message
        message: String,
    },

    /// An extra error scope was left on the device's stack
    #[error("Error scope stack corrupted on device '{resource_id}': extra scope left behind")]
    ScopeStackCorrupted {
        /// The descriptor key (or `default`)
        resource_id: String,
    },

    /// The device was lost in a way the test did not expect
    #[error("Device '{resource_id}' lost: {reason}")]
    DeviceLost {
        /// The descriptor key (or `default`)
        resource_id: String,
        /// The recorded loss message
        reason: String,
    },

    /// Operation timeout
    #[error("Operation timed out after {timeout_ms}ms for device '{resource_id}'")]
    Timeout {
        /// The descriptor key (or `default`)
        resource_id: String,
        /// The timeout duration in milliseconds
        timeout_ms: u64,
        /// The operation that timed out
        operation: String,
    },

    /// Holder state error
    #[error("Invalid state transition for device '{resource_id}': {from} -> {to}")]
    InvalidStateTransition {
        /// The descriptor key (or `default`)
        resource_id: String,
        /// The current state
        from: String,
        /// The attempted target state
        to: String,
    },
}

impl Error {
    /// Create a configuration error
    pub fn configuration<S: Into<String>>(message: S) -> Self {
        Self::Configuration {
            message: message.into(),
        }
    }

    /// Create an initialization error
    pub fn initialization(resource_id: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Initialization {
            resource_id: resource_id.into(),
            reason: reason.into(),
        }
    }

    /// Create a skip error
    pub fn skip(resource_id: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Skip {
            resource_id: resource_id.into(),
            reason: reason.into(),
        }
    }

    /// Create an invalid state transition error
    pub fn invalid_transition(
        resource_id: impl Into<String>,
        from: impl std::fmt::Display,
        to: impl std::fmt::Display,
    ) -> Self {
        Self::InvalidStateTransition {
            resource_id: resource_id.into(),
            from: from.to_string(),
            to: to.to_string(),
        }
    }

    /// Classify this error for the pool and the test harness.
    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Configuration { .. }
            | Self::Initialization { .. }
            | Self::Unavailable { .. }
            | Self::InvalidStateTransition { .. } => ErrorKind::Fatal,
            Self::FeaturesNotSupported { .. }
            | Self::LimitsNotSupported { .. }
            | Self::Skip { .. } => ErrorKind::Skip,
            Self::Validation { .. } => ErrorKind::Recoverable,
            Self::OutOfMemory { .. }
            | Self::ScopeRejected { .. }
            | Self::ScopeStackCorrupted { .. }
            | Self::DeviceLost { .. }
            | Self::Timeout { .. } => ErrorKind::NonRecoverable,
        }
    }

    /// Whether the device that produced this error may be handed out again.
    #[must_use]
    pub fn is_device_reusable(&self) -> bool {
        self.kind() == ErrorKind::Recoverable
    }

    /// Whether the configuration was rejected as unsupported by the adapter.
    #[must_use]
    pub fn is_unsupported(&self) -> bool {
        matches!(
            self,
            Self::FeaturesNotSupported { .. } | Self::LimitsNotSupported { .. }
        )
    }

    /// Check if this error is retryable
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Unavailable { retryable, .. } => *retryable,
            Self::Initialization { .. } => true,
            _ => false,
        }
    }

    /// Get the descriptor key associated with this error (if any)
    #[must_use]
    pub fn resource_id(&self) -> Option<&str> {
        match self {
            Self::Configuration { .. } => None,
            Self::Initialization { resource_id, .. }
            | Self::Unavailable { resource_id, .. }
            | Self::FeaturesNotSupported { resource_id, .. }
            | Self::LimitsNotSupported { resource_id, .. }
            | Self::Skip { resource_id, .. }
            | Self::Validation { resource_id, .. }
            | Self::OutOfMemory { resource_id, .. }
            | Self::ScopeRejected { resource_id, .. }
            | Self::ScopeStackCorrupted { resource_id }
            | Self::DeviceLost { resource_id, .. }
            | Self::Timeout { resource_id, .. }
            | Self::InvalidStateTransition { resource_id, .. } => Some(resource_id),
        }
    }
}
