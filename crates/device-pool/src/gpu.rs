//! Capability traits for the adapter and device the pool manages.
//!
//! The pool never talks to a graphics API directly. The hosting environment
//! supplies a [`GpuProvider`]; the pool treats everything behind it as opaque.

use std::sync::Arc;

use async_trait::async_trait;
use futures::future::BoxFuture;

use crate::descriptor::CanonicalDescriptor;

/// Class of error captured by an error scope.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorFilter {
    /// Validation errors.
    Validation,
    /// Out-of-memory errors.
    OutOfMemory,
}

impl std::fmt::Display for ErrorFilter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Validation => f.write_str("validation"),
            Self::OutOfMemory => f.write_str("out-of-memory"),
        }
    }
}

/// An error captured by an error scope.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GpuError {
    /// Implementation-provided message.
    pub message: String,
}

impl GpuError {
    /// Create a captured error with the given message.
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

/// `pop_error_scope` was rejected by the device.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ScopeError {
    /// No scope was left to pop.
    #[error("error scope stack is empty")]
    EmptyStack,
    /// The device refused the operation (e.g. it has been lost).
    #[error("{0}")]
    Rejected(String),
}

/// Why a device was lost.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DeviceLostReason {
    /// Lost for an implementation-specific reason.
    Unknown,
    /// Lost because `destroy` was called.
    Destroyed,
}

/// Resolution of [`GpuDevice::lost`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceLostInfo {
    /// Why the device was lost.
    pub reason: DeviceLostReason,
    /// Implementation-provided message.
    pub message: String,
}

/// Entry point into the platform's GPU support.
#[async_trait]
pub trait GpuProvider: Send + Sync {
    /// Request an adapter. `None` means no adapter is available.
    async fn request_adapter(&self) -> Option<Arc<dyn GpuAdapter>>;
}

/// A physical adapter that can create devices.
#[async_trait]
pub trait GpuAdapter: Send + Sync {
    /// Whether the adapter supports a feature.
    fn has_feature(&self, feature: &str) -> bool;

    /// The adapter's supported value for a limit, if it reports one.
    ///
    /// Unreported limits are assumed to be at their default.
    fn limit(&self, _name: &str) -> Option<u64> {
        None
    }

    /// Create a device. `None` means the request could not be satisfied.
    async fn request_device(
        &self,
        descriptor: &CanonicalDescriptor,
    ) -> Option<Arc<dyn GpuDevice>>;
}

/// A logical device handed to tests.
#[async_trait]
pub trait GpuDevice: Send + Sync {
    /// Push an error scope capturing errors of `filter`.
    fn push_error_scope(&self, filter: ErrorFilter);

    /// Pop the innermost error scope, returning its captured error if any.
    ///
    /// Rejects when there is no scope to pop.
    async fn pop_error_scope(&self) -> Result<Option<GpuError>, ScopeError>;

    /// One-shot future resolving when the device is lost.
    fn lost(&self) -> BoxFuture<'static, DeviceLostInfo>;

    /// Destroy the device, releasing its resources.
    fn destroy(&self) {}
}

/// Whether two handles refer to the same device.
#[must_use]
pub fn same_device(a: &Arc<dyn GpuDevice>, b: &Arc<dyn GpuDevice>) -> bool {
    std::ptr::addr_eq(Arc::as_ptr(a), Arc::as_ptr(b))
}
