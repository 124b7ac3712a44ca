//! Descriptor-keyed holders with LRU eviction.

use std::collections::HashSet;
use std::sync::Arc;

use lru::LruCache;

use crate::descriptor::{DescriptorKey, DeviceDescriptor, canonicalize};
use crate::error::{Error, Result};
use crate::gpu::{GpuDevice, GpuProvider};
use crate::holder::DeviceHolder;

/// Result of [`HolderMap::get_or_create`].
#[derive(Debug)]
pub enum Lookup {
    /// An existing holder, now most recently used.
    Hit(Arc<DeviceHolder>),
    /// A freshly created holder, plus the holder evicted to make room.
    Created {
        /// The new holder.
        holder: Arc<DeviceHolder>,
        /// The least recently used holder, if capacity was exceeded.
        evicted: Option<Arc<DeviceHolder>>,
    },
}

impl Lookup {
    /// The holder that serves the request.
    #[must_use]
    pub fn holder(&self) -> &Arc<DeviceHolder> {
        match self {
            Self::Hit(holder) | Self::Created { holder, .. } => holder,
        }
    }
}

/// Bounded map from canonical descriptor key to holder.
///
/// Keys whose descriptor the adapter rejected are remembered for the
/// lifetime of the map and fail fast with [`Error::Skip`].
pub struct HolderMap {
    holders: LruCache<DescriptorKey, Arc<DeviceHolder>>,
    unsupported: HashSet<DescriptorKey>,
    capacity: usize,
}

impl std::fmt::Debug for HolderMap {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HolderMap")
            .field("len", &self.holders.len())
            .field("capacity", &self.capacity)
            .field("unsupported", &self.unsupported.len())
            .finish()
    }
}

impl HolderMap {
    /// Create an empty map holding at most `capacity` devices.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            holders: LruCache::unbounded(),
            unsupported: HashSet::new(),
            capacity,
        }
    }

    /// Find the holder for `descriptor`, creating it if needed.
    pub async fn get_or_create(
        &mut self,
        provider: &dyn GpuProvider,
        descriptor: &DeviceDescriptor,
    ) -> Result<Lookup> {
        let (canonical, key) = canonicalize(Some(descriptor));

        if self.unsupported.contains(&key) {
            return Err(Error::skip(
                key.as_str(),
                "descriptor previously found unsupported",
            ));
        }

        if let Some(holder) = self.holders.get(&key) {
            return Ok(Lookup::Hit(Arc::clone(holder)));
        }

        let holder = match DeviceHolder::create(provider, Some(&canonical), key.as_str()).await {
            Ok(holder) => Arc::new(holder),
            Err(err) if err.is_unsupported() => {
                tracing::info!(resource_id = %key, error = %err, "Descriptor unsupported");
                self.unsupported.insert(key.clone());
                return Err(Error::skip(key.as_str(), err.to_string()));
            }
            Err(err) => return Err(err),
        };

        self.holders.put(key, Arc::clone(&holder));

        let evicted = if self.holders.len() > self.capacity {
            // The new entry is most recently used, so it is never the one popped.
            self.holders.pop_lru().map(|(key, evicted)| {
                tracing::info!(resource_id = %key, "Evicted least recently used device");
                evicted
            })
        } else {
            None
        };

        Ok(Lookup::Created { holder, evicted })
    }

    /// Remove the holder wrapping `device`, if any.
    pub fn delete_by_device(&mut self, device: &Arc<dyn GpuDevice>) -> Option<Arc<DeviceHolder>> {
        let key = self
            .holders
            .iter()
            .find(|(_, holder)| holder.wraps(device))
            .map(|(key, _)| key.clone())?;
        self.holders.pop(&key)
    }

    /// Whether some pooled holder wraps `device`. Does not touch recency.
    #[must_use]
    pub fn contains_device(&self, device: &Arc<dyn GpuDevice>) -> bool {
        self.holders.iter().any(|(_, holder)| holder.wraps(device))
    }

    /// Whether a holder exists for `descriptor`. Does not touch recency.
    #[must_use]
    pub fn contains(&self, descriptor: &DeviceDescriptor) -> bool {
        let (_, key) = canonicalize(Some(descriptor));
        self.holders.contains(&key)
    }

    /// Whether `descriptor` has been memoized as unsupported.
    #[must_use]
    pub fn is_unsupported(&self, descriptor: &DeviceDescriptor) -> bool {
        let (_, key) = canonicalize(Some(descriptor));
        self.unsupported.contains(&key)
    }

    /// Number of unsupported descriptors remembered.
    #[must_use]
    pub fn unsupported_len(&self) -> usize {
        self.unsupported.len()
    }

    /// Number of pooled holders.
    #[must_use]
    pub fn len(&self) -> usize {
        self.holders.len()
    }

    /// Whether no holders are pooled.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.holders.is_empty()
    }

    /// Remove and return every pooled holder, least recently used first.
    pub fn drain(&mut self) -> Vec<Arc<DeviceHolder>> {
        let mut drained = Vec::with_capacity(self.holders.len());
        while let Some((_, holder)) = self.holders.pop_lru() {
            drained.push(holder);
        }
        drained
    }
}
