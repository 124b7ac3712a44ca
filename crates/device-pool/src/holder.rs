//! A pooled device and its reservation lifecycle.
//!
//! A holder moves `Free -> Reserved -> Acquired -> Free`. Acquisition wraps
//! the test in an out-of-memory scope and a validation scope; release pops
//! both and classifies what they captured.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::descriptor::{CanonicalDescriptor, LimitClass, default_limit};
use crate::error::{Error, Result};
use crate::gpu::{
    DeviceLostInfo, DeviceLostReason, ErrorFilter, GpuAdapter, GpuDevice, GpuError, GpuProvider,
    same_device,
};

/// Reservation state of a [`DeviceHolder`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HolderState {
    /// Available for reservation.
    Free,
    /// Handed to a caller that has not yet acquired the device.
    Reserved,
    /// Device handed out with error scopes pushed.
    Acquired,
}

impl std::fmt::Display for HolderState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Free => f.write_str("free"),
            Self::Reserved => f.write_str("reserved"),
            Self::Acquired => f.write_str("acquired"),
        }
    }
}

/// What the pool should do with a holder after a clean release.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    /// Return the holder to the pool.
    Reusable,
    /// The device was lost as the test expected; drop the holder.
    Retire,
}

/// Owns one device and tracks its reservation state.
pub struct DeviceHolder {
    resource_id: String,
    device: Arc<dyn GpuDevice>,
    state: Mutex<HolderState>,
    expected_loss: Mutex<Option<DeviceLostReason>>,
    lost: watch::Receiver<Option<DeviceLostInfo>>,
    lost_watcher: JoinHandle<()>,
}

impl std::fmt::Debug for DeviceHolder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceHolder")
            .field("resource_id", &self.resource_id)
            .field("state", &*self.state.lock())
            .field("lost", &*self.lost.borrow())
            .finish()
    }
}

impl DeviceHolder {
    /// Create a device for `descriptor` (or a default device for `None`).
    ///
    /// Fails with [`Error::FeaturesNotSupported`] or
    /// [`Error::LimitsNotSupported`] when the adapter cannot satisfy the
    /// descriptor, and with [`Error::Initialization`] when no adapter or device
    /// is available.
    ///
    /// Must run inside a tokio runtime, which watches the device for loss.
    /// Outside one this fails with [`Error::Initialization`].
    pub async fn create(
        provider: &dyn GpuProvider,
        descriptor: Option<&CanonicalDescriptor>,
        resource_id: impl Into<String>,
    ) -> Result<Self> {
        let resource_id = resource_id.into();
        let runtime = tokio::runtime::Handle::try_current()
            .map_err(|err| Error::initialization(&resource_id, err.to_string()))?;
        let adapter = provider
            .request_adapter()
            .await
            .ok_or_else(|| Error::initialization(&resource_id, "no adapter available"))?;

        if let Some(descriptor) = descriptor {
            check_support(adapter.as_ref(), descriptor, &resource_id)?;
        }

        let default_descriptor = CanonicalDescriptor::default();
        let device = adapter
            .request_device(descriptor.unwrap_or(&default_descriptor))
            .await
            .ok_or_else(|| Error::initialization(&resource_id, "adapter returned no device"))?;

        let (lost_tx, lost_rx) = watch::channel(None);
        let lost = device.lost();
        let watched_id = resource_id.clone();
        let lost_watcher = runtime.spawn(async move {
            let info = lost.await;
            tracing::debug!(
                resource_id = %watched_id,
                reason = ?info.reason,
                message = %info.message,
                "Device lost"
            );
            lost_tx.send_replace(Some(info));
        });

        tracing::info!(resource_id = %resource_id, "Created device");
        Ok(Self {
            resource_id,
            device,
            state: Mutex::new(HolderState::Free),
            expected_loss: Mutex::new(None),
            lost: lost_rx,
            lost_watcher,
        })
    }

    /// The descriptor key this holder serves, or `default`.
    #[must_use]
    pub fn resource_id(&self) -> &str {
        &self.resource_id
    }

    /// Current reservation state.
    #[must_use]
    pub fn state(&self) -> HolderState {
        *self.state.lock()
    }

    /// Message recorded when the device reported loss, if it has.
    #[must_use]
    pub fn lost_reason(&self) -> Option<String> {
        self.lost.borrow().as_ref().map(|info| info.message.clone())
    }

    /// Whether this holder owns `device`.
    #[must_use]
    pub fn wraps(&self, device: &Arc<dyn GpuDevice>) -> bool {
        same_device(&self.device, device)
    }

    pub(crate) fn reserve(&self) -> Result<()> {
        let mut state = self.state.lock();
        if *state != HolderState::Free {
            return Err(Error::invalid_transition(
                &self.resource_id,
                *state,
                HolderState::Reserved,
            ));
        }
        *state = HolderState::Reserved;
        *self.expected_loss.lock() = None;
        Ok(())
    }

    /// Take the device for the duration of a test.
    ///
    /// Pushes an out-of-memory scope and then a validation scope. Only valid
    /// once per reservation.
    pub fn acquire(&self) -> Result<Arc<dyn GpuDevice>> {
        let mut state = self.state.lock();
        if *state != HolderState::Reserved {
            return Err(Error::invalid_transition(
                &self.resource_id,
                *state,
                HolderState::Acquired,
            ));
        }
        self.device.push_error_scope(ErrorFilter::OutOfMemory);
        self.device.push_error_scope(ErrorFilter::Validation);
        *state = HolderState::Acquired;
        tracing::debug!(resource_id = %self.resource_id, "Acquired device");
        Ok(Arc::clone(&self.device))
    }

    /// Declare that the test will lose the device with `reason`.
    ///
    /// Release then waits for the loss instead of popping error scopes, and
    /// the holder is retired from the pool.
    pub fn expect_device_lost(&self, reason: DeviceLostReason) -> Result<()> {
        let state = *self.state.lock();
        if state == HolderState::Free {
            return Err(Error::invalid_transition(&self.resource_id, state, "lost"));
        }
        *self.expected_loss.lock() = Some(reason);
        Ok(())
    }

    /// End the current reservation.
    ///
    /// For an acquired device, pops the error scopes under `timeout` and
    /// reports what they captured. The holder is `Free` afterwards whatever
    /// the outcome; the caller decides whether it stays pooled.
    pub async fn ensure_release(&self, timeout: Duration) -> Result<Disposition> {
        let state = *self.state.lock();
        if state == HolderState::Free {
            return Err(Error::invalid_transition(
                &self.resource_id,
                state,
                HolderState::Free,
            ));
        }

        let result = if state == HolderState::Acquired {
            match tokio::time::timeout(timeout, self.release_scopes()).await {
                Ok(result) => result,
                Err(_) => Err(Error::Timeout {
                    resource_id: self.resource_id.clone(),
                    timeout_ms: u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX),
                    operation: "pop_error_scope".to_string(),
                }),
            }
        } else {
            Ok(Disposition::Reusable)
        };

        *self.state.lock() = HolderState::Free;
        tracing::debug!(resource_id = %self.resource_id, ok = result.is_ok(), "Released device");
        result
    }

    pub(crate) fn device(&self) -> &Arc<dyn GpuDevice> {
        &self.device
    }

    pub(crate) fn destroy(&self) {
        self.device.destroy();
    }

    async fn release_scopes(&self) -> Result<Disposition> {
        let expected = *self.expected_loss.lock();
        if let Some(expected) = expected {
            return self.await_expected_loss(expected).await;
        }

        let validation = self.pop_scope().await?;
        let out_of_memory = self.pop_scope().await?;

        // Both scopes are gone; a further pop must be rejected.
        if self.device.pop_error_scope().await.is_ok() {
            return Err(Error::ScopeStackCorrupted {
                resource_id: self.resource_id.clone(),
            });
        }

        // A lost device is never reusable, whatever its scopes captured.
        if let Some(lost) = self.lost_reason() {
            let reason = match validation.or(out_of_memory) {
                Some(GpuError { message }) => format!("{lost} (captured: {message})"),
                None => lost,
            };
            return Err(Error::DeviceLost {
                resource_id: self.resource_id.clone(),
                reason,
            });
        }
        if let Some(GpuError { message }) = validation {
            return Err(Error::Validation {
                resource_id: self.resource_id.clone(),
                message,
            });
        }
        if let Some(GpuError { message }) = out_of_memory {
            return Err(Error::OutOfMemory {
                resource_id: self.resource_id.clone(),
                message,
            });
        }
        Ok(Disposition::Reusable)
    }

    async fn pop_scope(&self) -> Result<Option<GpuError>> {
        self.device.pop_error_scope().await.map_err(|err| {
            match self.lost_reason() {
                Some(lost) => tracing::debug!(
                    resource_id = %self.resource_id,
                    lost = %lost,
                    error = %err,
                    "Error scope pop rejected after device loss"
                ),
                None => tracing::warn!(
                    resource_id = %self.resource_id,
                    error = %err,
                    "Error scope pop rejected"
                ),
            }
            Error::ScopeRejected {
                resource_id: self.resource_id.clone(),
                message: err.to_string(),
            }
        })
    }

    async fn await_expected_loss(&self, expected: DeviceLostReason) -> Result<Disposition> {
        let mut lost = self.lost.clone();
        let info = lost
            .wait_for(Option::is_some)
            .await
            .ok()
            .and_then(|info| (*info).clone());

        match info {
            Some(info) if info.reason == expected => Ok(Disposition::Retire),
            Some(info) => Err(Error::DeviceLost {
                resource_id: self.resource_id.clone(),
                reason: format!(
                    "expected {expected:?} loss, got {:?}: {}",
                    info.reason, info.message
                ),
            }),
            None => Err(Error::DeviceLost {
                resource_id: self.resource_id.clone(),
                reason: "loss notification dropped".to_string(),
            }),
        }
    }
}

impl Drop for DeviceHolder {
    fn drop(&mut self) {
        self.lost_watcher.abort();
    }
}

fn check_support(
    adapter: &dyn GpuAdapter,
    descriptor: &CanonicalDescriptor,
    resource_id: &str,
) -> Result<()> {
    let missing: Vec<String> = descriptor
        .required_features
        .iter()
        .filter(|feature| !adapter.has_feature(feature))
        .cloned()
        .collect();
    if !missing.is_empty() {
        return Err(Error::FeaturesNotSupported {
            resource_id: resource_id.to_string(),
            features: missing,
        });
    }

    let mut unsatisfied = Vec::new();
    for (name, &requested) in &descriptor.required_limits {
        let Some((default, class)) = default_limit(name) else {
            continue;
        };
        let supported = adapter.limit(name).unwrap_or(default);
        let ok = match class {
            LimitClass::Maximum => requested <= supported,
            LimitClass::Alignment => requested >= supported,
        };
        if !ok {
            unsatisfied.push(format!("{name}={requested} (adapter: {supported})"));
        }
    }
    if !unsatisfied.is_empty() {
        return Err(Error::LimitsNotSupported {
            resource_id: resource_id.to_string(),
            limits: unsatisfied,
        });
    }
    Ok(())
}
