//! Device pool: hands out devices to tests and decides their reuse.
//!
//! The pool keeps one default device plus a bounded set of devices keyed by
//! canonical descriptor. Release pops the holder's error scopes; a captured
//! validation error fails the test but keeps the device, anything else
//! discards it so the next reservation creates a fresh one.

pub mod config;

use std::sync::Arc;

use parking_lot::Mutex;

use crate::descriptor::DeviceDescriptor;
use crate::error::{Error, Result};
use crate::gpu::GpuProvider;
use crate::holder::{DeviceHolder, Disposition, HolderState};
use crate::keyed::{HolderMap, Lookup};

pub use config::DevicePoolConfig;

/// Resource id used for the default device.
pub const DEFAULT_RESOURCE_ID: &str = "default";

/// Lifecycle of the default device slot.
enum DefaultSlot {
    Uninitialized,
    Ready(Arc<DeviceHolder>),
    /// Creation failed once; never retried.
    Failed,
}

/// Pool statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PoolStats {
    /// Total successful reservations.
    pub reservations: u64,
    /// Total releases, successful or not.
    pub releases: u64,
    /// Total devices ever created.
    pub created: u64,
    /// Devices discarded after a release.
    pub retired: u64,
    /// Devices dropped to stay within capacity.
    pub evictions: u64,
    /// Releases that failed the test but kept the device.
    pub reusable_failures: u64,
    /// Reservations answered with a skip.
    pub skipped: u64,
}

/// Inner shared state for the pool.
struct PoolInner {
    provider: Arc<dyn GpuProvider>,
    config: DevicePoolConfig,
    default: tokio::sync::Mutex<DefaultSlot>,
    keyed: tokio::sync::Mutex<HolderMap>,
    stats: Mutex<PoolStats>,
}

/// Pool of devices shared by the tests of one run.
///
/// Cloning is cheap and yields a handle to the same pool. Callers must
/// release a reservation before making the next one for the same
/// descriptor; a holder that is not free is never handed out.
#[derive(Clone)]
pub struct DevicePool {
    inner: Arc<PoolInner>,
}

impl std::fmt::Debug for DevicePool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let stats = self.inner.stats.lock().clone();
        f.debug_struct("DevicePool")
            .field("config", &self.inner.config)
            .field("stats", &stats)
            .finish()
    }
}

impl DevicePool {
    /// Create a pool drawing devices from `provider`.
    ///
    /// # Errors
    /// Returns error if `config` is invalid (e.g. capacity == 0).
    pub fn new(provider: Arc<dyn GpuProvider>, config: DevicePoolConfig) -> Result<Self> {
        config.validate()?;
        let capacity = config.capacity;
        Ok(Self {
            inner: Arc::new(PoolInner {
                provider,
                config,
                default: tokio::sync::Mutex::new(DefaultSlot::Uninitialized),
                keyed: tokio::sync::Mutex::new(HolderMap::new(capacity)),
                stats: Mutex::new(PoolStats::default()),
            }),
        })
    }

    /// The pool's configuration.
    #[must_use]
    pub fn config(&self) -> &DevicePoolConfig {
        &self.inner.config
    }

    /// Get current pool statistics.
    #[must_use]
    pub fn stats(&self) -> PoolStats {
        self.inner.stats.lock().clone()
    }

    /// Reserve a device for `descriptor`, or the default device for `None`.
    ///
    /// The default device is created first in either case. If it ever fails
    /// to create, every later reservation fails without retrying.
    pub async fn reserve(&self, descriptor: Option<&DeviceDescriptor>) -> Result<Arc<DeviceHolder>> {
        let default = self.default_holder().await?;

        let holder = match descriptor {
            None => default,
            Some(descriptor) => self.keyed_holder(descriptor).await?,
        };

        holder.reserve()?;
        self.inner.stats.lock().reservations += 1;
        tracing::debug!(resource_id = %holder.resource_id(), "Reserved device");
        Ok(holder)
    }

    /// End a reservation made with [`reserve`](Self::reserve).
    ///
    /// A validation failure is returned but the device stays pooled. Any
    /// other failure discards the device before the error is returned.
    pub async fn release(&self, holder: &Arc<DeviceHolder>) -> Result<()> {
        let state = holder.state();
        if state == HolderState::Free {
            return Err(Error::invalid_transition(
                holder.resource_id(),
                state,
                HolderState::Free,
            ));
        }

        let result = holder.ensure_release(self.inner.config.release_timeout).await;
        self.inner.stats.lock().releases += 1;

        match result {
            Ok(Disposition::Reusable) => {
                self.destroy_if_orphaned(holder).await;
                Ok(())
            }
            Ok(Disposition::Retire) => {
                tracing::debug!(resource_id = %holder.resource_id(), "Retiring lost device");
                self.retire(holder).await;
                Ok(())
            }
            Err(err) if err.is_device_reusable() => {
                self.inner.stats.lock().reusable_failures += 1;
                self.destroy_if_orphaned(holder).await;
                Err(err)
            }
            Err(err) => {
                tracing::warn!(
                    resource_id = %holder.resource_id(),
                    error = %err,
                    "Discarding device after failed release"
                );
                self.retire(holder).await;
                Err(err)
            }
        }
    }

    /// Number of devices currently pooled, default included.
    pub async fn pooled(&self) -> usize {
        let default = usize::from(matches!(
            &*self.inner.default.lock().await,
            DefaultSlot::Ready(_)
        ));
        default + self.inner.keyed.lock().await.len()
    }

    /// Drop every pooled device, destroying those not currently reserved.
    ///
    /// A default slot that failed stays failed.
    pub async fn shutdown(&self) {
        let mut holders = self.inner.keyed.lock().await.drain();
        {
            let mut slot = self.inner.default.lock().await;
            if let DefaultSlot::Ready(holder) = &*slot {
                holders.push(Arc::clone(holder));
                *slot = DefaultSlot::Uninitialized;
            }
        }

        for holder in holders {
            if holder.state() == HolderState::Free {
                holder.destroy();
            }
        }
        tracing::info!("Device pool shut down");
    }

    async fn default_holder(&self) -> Result<Arc<DeviceHolder>> {
        let mut slot = self.inner.default.lock().await;
        match &*slot {
            DefaultSlot::Ready(holder) => return Ok(Arc::clone(holder)),
            DefaultSlot::Failed => return Err(default_unavailable(None)),
            DefaultSlot::Uninitialized => {}
        }

        match DeviceHolder::create(self.inner.provider.as_ref(), None, DEFAULT_RESOURCE_ID).await {
            Ok(holder) => {
                let holder = Arc::new(holder);
                *slot = DefaultSlot::Ready(Arc::clone(&holder));
                self.inner.stats.lock().created += 1;
                Ok(holder)
            }
            Err(err) => {
                tracing::warn!(error = %err, "Default device failed to initialize");
                *slot = DefaultSlot::Failed;
                Err(default_unavailable(Some(&err)))
            }
        }
    }

    async fn keyed_holder(&self, descriptor: &DeviceDescriptor) -> Result<Arc<DeviceHolder>> {
        let lookup = {
            let mut keyed = self.inner.keyed.lock().await;
            keyed
                .get_or_create(self.inner.provider.as_ref(), descriptor)
                .await
        };

        match lookup {
            Ok(Lookup::Hit(holder)) => Ok(holder),
            Ok(Lookup::Created { holder, evicted }) => {
                let mut stats = self.inner.stats.lock();
                stats.created += 1;
                if let Some(evicted) = evicted {
                    stats.evictions += 1;
                    if evicted.state() == HolderState::Free {
                        evicted.destroy();
                    }
                }
                Ok(holder)
            }
            Err(err) => {
                if matches!(err, Error::Skip { .. }) {
                    self.inner.stats.lock().skipped += 1;
                }
                Err(err)
            }
        }
    }

    /// Whether `holder` is still the default holder or in the keyed map.
    async fn is_pooled(&self, holder: &Arc<DeviceHolder>) -> bool {
        let is_default = matches!(
            &*self.inner.default.lock().await,
            DefaultSlot::Ready(current) if Arc::ptr_eq(current, holder)
        );
        is_default || self.inner.keyed.lock().await.contains_device(holder.device())
    }

    /// Destroy a released holder that was evicted or drained while reserved.
    async fn destroy_if_orphaned(&self, holder: &Arc<DeviceHolder>) {
        if !self.is_pooled(holder).await {
            tracing::debug!(
                resource_id = %holder.resource_id(),
                "Destroying device dropped from the pool while reserved"
            );
            holder.destroy();
        }
    }

    async fn retire(&self, holder: &Arc<DeviceHolder>) {
        let was_default = {
            let mut slot = self.inner.default.lock().await;
            let is_default =
                matches!(&*slot, DefaultSlot::Ready(current) if Arc::ptr_eq(current, holder));
            if is_default {
                *slot = DefaultSlot::Uninitialized;
            }
            is_default
        };
        if !was_default {
            self.inner
                .keyed
                .lock()
                .await
                .delete_by_device(holder.device());
        }

        holder.destroy();
        self.inner.stats.lock().retired += 1;
    }
}

fn default_unavailable(cause: Option<&Error>) -> Error {
    const REASON: &str = "device failed to initialize, not retrying";
    Error::Unavailable {
        resource_id: DEFAULT_RESOURCE_ID.to_string(),
        reason: match cause {
            Some(cause) => format!("{REASON}: {cause}"),
            None => REASON.to_string(),
        },
        retryable: false,
    }
}
