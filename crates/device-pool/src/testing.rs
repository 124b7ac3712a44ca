//! Testing utilities: an in-memory GPU provider with controllable failures.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

use async_trait::async_trait;
use futures::future::BoxFuture;
use parking_lot::Mutex;
use tokio::sync::watch;

use crate::descriptor::CanonicalDescriptor;
use crate::gpu::{
    DeviceLostInfo, DeviceLostReason, ErrorFilter, GpuAdapter, GpuDevice, GpuError, GpuProvider,
    ScopeError,
};

#[derive(Default)]
struct MockState {
    features: Mutex<HashSet<String>>,
    limits: Mutex<HashMap<String, u64>>,
    adapter_unavailable: AtomicBool,
    device_creation_fails: AtomicBool,
    adapter_requests: AtomicU32,
    device_requests: AtomicU32,
    devices: Mutex<Vec<Arc<MockDevice>>>,
    requested: Mutex<Vec<CanonicalDescriptor>>,
}

/// Mock GPU provider for unit testing.
///
/// Counts adapter and device requests and keeps every device it creates so
/// tests can inject errors into them.
#[derive(Clone, Default)]
pub struct MockGpu {
    state: Arc<MockState>,
}

impl std::fmt::Debug for MockGpu {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MockGpu")
            .field("adapter_requests", &self.adapter_requests())
            .field("device_requests", &self.device_requests())
            .finish()
    }
}

impl MockGpu {
    /// Create a provider whose adapter supports no optional features.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Advertise a feature on the adapter.
    pub fn with_feature(self, feature: impl Into<String>) -> Self {
        self.state.features.lock().insert(feature.into());
        self
    }

    /// Advertise several features on the adapter.
    pub fn with_features<I, S>(self, features: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.state
            .features
            .lock()
            .extend(features.into_iter().map(Into::into));
        self
    }

    /// Advertise a supported limit value on the adapter.
    pub fn with_limit(self, name: impl Into<String>, value: u64) -> Self {
        self.state.limits.lock().insert(name.into(), value);
        self
    }

    /// Make `request_adapter` return `None` (or recover).
    pub fn set_adapter_available(&self, available: bool) {
        self.state
            .adapter_unavailable
            .store(!available, Ordering::SeqCst);
    }

    /// Make `request_device` return `None` (or recover).
    pub fn set_device_creation_fails(&self, fails: bool) {
        self.state
            .device_creation_fails
            .store(fails, Ordering::SeqCst);
    }

    /// Number of `request_adapter` calls so far.
    #[must_use]
    pub fn adapter_requests(&self) -> u32 {
        self.state.adapter_requests.load(Ordering::SeqCst)
    }

    /// Number of `request_device` calls so far.
    #[must_use]
    pub fn device_requests(&self) -> u32 {
        self.state.device_requests.load(Ordering::SeqCst)
    }

    /// Descriptors passed to `request_device`, in call order.
    #[must_use]
    pub fn requested_descriptors(&self) -> Vec<CanonicalDescriptor> {
        self.state.requested.lock().clone()
    }

    /// Every device created so far, oldest first.
    #[must_use]
    pub fn devices(&self) -> Vec<Arc<MockDevice>> {
        self.state.devices.lock().clone()
    }

    /// The most recently created device.
    #[must_use]
    pub fn last_device(&self) -> Option<Arc<MockDevice>> {
        self.state.devices.lock().last().cloned()
    }
}

#[async_trait]
impl GpuProvider for MockGpu {
    async fn request_adapter(&self) -> Option<Arc<dyn GpuAdapter>> {
        self.state.adapter_requests.fetch_add(1, Ordering::SeqCst);
        if self.state.adapter_unavailable.load(Ordering::SeqCst) {
            return None;
        }
        Some(Arc::new(MockAdapter {
            state: Arc::clone(&self.state),
        }))
    }
}

/// Adapter handed out by [`MockGpu`].
pub struct MockAdapter {
    state: Arc<MockState>,
}

#[async_trait]
impl GpuAdapter for MockAdapter {
    fn has_feature(&self, feature: &str) -> bool {
        self.state.features.lock().contains(feature)
    }

    fn limit(&self, name: &str) -> Option<u64> {
        self.state.limits.lock().get(name).copied()
    }

    async fn request_device(
        &self,
        descriptor: &CanonicalDescriptor,
    ) -> Option<Arc<dyn GpuDevice>> {
        let id = self.state.device_requests.fetch_add(1, Ordering::SeqCst);
        self.state.requested.lock().push(descriptor.clone());
        if self.state.device_creation_fails.load(Ordering::SeqCst) {
            return None;
        }
        let device = Arc::new(MockDevice::new(id));
        self.state.devices.lock().push(Arc::clone(&device));
        Some(device)
    }
}

/// How [`MockDevice::pop_error_scope`] behaves.
#[derive(Debug, Clone, Default)]
enum PopBehavior {
    #[default]
    Normal,
    Hang,
    Reject(String),
}

#[derive(Debug)]
struct Scope {
    filter: ErrorFilter,
    error: Option<GpuError>,
}

/// Device handed out by [`MockAdapter`].
pub struct MockDevice {
    id: u32,
    scopes: Mutex<Vec<Scope>>,
    uncaptured: Mutex<Vec<GpuError>>,
    pop_behavior: Mutex<PopBehavior>,
    lost: watch::Sender<Option<DeviceLostInfo>>,
    destroyed: AtomicBool,
}

impl std::fmt::Debug for MockDevice {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MockDevice")
            .field("id", &self.id)
            .field("scopes", &*self.scopes.lock())
            .field("destroyed", &self.is_destroyed())
            .finish()
    }
}

impl MockDevice {
    fn new(id: u32) -> Self {
        Self {
            id,
            scopes: Mutex::new(Vec::new()),
            uncaptured: Mutex::new(Vec::new()),
            pop_behavior: Mutex::new(PopBehavior::Normal),
            lost: watch::Sender::new(None),
            destroyed: AtomicBool::new(false),
        }
    }

    /// Creation order of this device, starting at 0.
    #[must_use]
    pub fn id(&self) -> u32 {
        self.id
    }

    /// Filters of the scopes currently pushed, outermost first.
    #[must_use]
    pub fn scope_filters(&self) -> Vec<ErrorFilter> {
        self.scopes.lock().iter().map(|scope| scope.filter).collect()
    }

    /// Raise an error as if a GPU operation failed.
    ///
    /// The innermost scope with a matching filter captures it, unless that
    /// scope already holds an error. Without a matching scope the error is
    /// uncaptured.
    pub fn inject_error(&self, filter: ErrorFilter, message: impl Into<String>) {
        let error = GpuError::new(message);
        let mut scopes = self.scopes.lock();
        match scopes.iter_mut().rev().find(|scope| scope.filter == filter) {
            Some(scope) => {
                if scope.error.is_none() {
                    scope.error = Some(error);
                }
            }
            None => self.uncaptured.lock().push(error),
        }
    }

    /// Errors raised with no matching scope.
    #[must_use]
    pub fn uncaptured_errors(&self) -> Vec<GpuError> {
        self.uncaptured.lock().clone()
    }

    /// Make every later `pop_error_scope` call never resolve.
    pub fn hang_pops(&self) {
        *self.pop_behavior.lock() = PopBehavior::Hang;
    }

    /// Make every later `pop_error_scope` call reject with `message`.
    pub fn reject_pops(&self, message: impl Into<String>) {
        *self.pop_behavior.lock() = PopBehavior::Reject(message.into());
    }

    /// Report the device as lost. Only the first loss is recorded.
    pub fn lose(&self, reason: DeviceLostReason, message: impl Into<String>) {
        let info = DeviceLostInfo {
            reason,
            message: message.into(),
        };
        self.lost.send_if_modified(|lost| {
            if lost.is_some() {
                return false;
            }
            *lost = Some(info);
            true
        });
    }

    /// Whether `destroy` has been called.
    #[must_use]
    pub fn is_destroyed(&self) -> bool {
        self.destroyed.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl GpuDevice for MockDevice {
    fn push_error_scope(&self, filter: ErrorFilter) {
        self.scopes.lock().push(Scope {
            filter,
            error: None,
        });
    }

    async fn pop_error_scope(&self) -> Result<Option<GpuError>, ScopeError> {
        let behavior = self.pop_behavior.lock().clone();
        match behavior {
            PopBehavior::Normal => {
                let popped = self.scopes.lock().pop();
                popped.map(|scope| scope.error).ok_or(ScopeError::EmptyStack)
            }
            PopBehavior::Reject(message) => Err(ScopeError::Rejected(message)),
            PopBehavior::Hang => std::future::pending().await,
        }
    }

    fn lost(&self) -> BoxFuture<'static, DeviceLostInfo> {
        let mut lost = self.lost.subscribe();
        Box::pin(async move {
            let info = lost
                .wait_for(Option::is_some)
                .await
                .ok()
                .and_then(|info| (*info).clone());
            match info {
                Some(info) => info,
                None => std::future::pending().await,
            }
        })
    }

    fn destroy(&self) {
        self.destroyed.store(true, Ordering::SeqCst);
        self.lose(DeviceLostReason::Destroyed, "device destroyed");
    }
}
