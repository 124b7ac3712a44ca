//! # CTS Device Pool
//!
//! Hands GPU devices to conformance tests and decides when a device is safe
//! to reuse. Each test reserves a device, acquires it (which wraps the test in
//! validation and out-of-memory error scopes), and releases it. Release
//! classifies what the scopes captured:
//!
//! - a validation error fails the test but keeps the device pooled;
//! - out-of-memory, a corrupted scope stack, a timeout or an unexpected loss
//!   discards the device so the next reservation gets a fresh one;
//! - descriptors the adapter cannot satisfy are remembered and skipped.
//!
//! The adapter and device are opaque capabilities supplied through
//! [`GpuProvider`].

pub mod descriptor;
pub mod error;
pub mod gpu;
pub mod holder;
pub mod keyed;
pub mod outcome;
pub mod pool;
pub mod testing;

pub use descriptor::{CanonicalDescriptor, DescriptorKey, DeviceDescriptor, canonicalize};
pub use error::{Error, ErrorKind, Result};
pub use gpu::{
    DeviceLostInfo, DeviceLostReason, ErrorFilter, GpuAdapter, GpuDevice, GpuError, GpuProvider,
    ScopeError, same_device,
};
pub use holder::{DeviceHolder, Disposition, HolderState};
pub use keyed::{HolderMap, Lookup};
pub use outcome::{TestDevice, TestOutcome};
pub use pool::{DEFAULT_RESOURCE_ID, DevicePool, DevicePoolConfig, PoolStats};
