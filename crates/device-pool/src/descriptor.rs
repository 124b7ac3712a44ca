//! Device descriptors and their canonical form.
//!
//! Canonicalization folds equivalent requests onto one cache key so the pool
//! can reuse a device across tests: features are sorted and deduplicated, and
//! limits are kept only when they name a known limit and differ from its
//! default.

use std::collections::{BTreeMap, BTreeSet, HashMap};

use serde::{Deserialize, Serialize};

/// Whether a larger or a smaller value of a limit is the stronger request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LimitClass {
    /// Higher is better (`max*` limits).
    Maximum,
    /// Lower is better (`min*Alignment` limits).
    Alignment,
}

/// Default values of the core device limits.
pub const DEFAULT_LIMITS: &[(&str, u64, LimitClass)] = &[
    ("maxTextureDimension1D", 8192, LimitClass::Maximum),
    ("maxTextureDimension2D", 8192, LimitClass::Maximum),
    ("maxTextureDimension3D", 2048, LimitClass::Maximum),
    ("maxTextureArrayLayers", 256, LimitClass::Maximum),
    ("maxBindGroups", 4, LimitClass::Maximum),
    ("maxBindGroupsPlusVertexBuffers", 24, LimitClass::Maximum),
    ("maxBindingsPerBindGroup", 1000, LimitClass::Maximum),
    ("maxDynamicUniformBuffersPerPipelineLayout", 8, LimitClass::Maximum),
    ("maxDynamicStorageBuffersPerPipelineLayout", 4, LimitClass::Maximum),
    ("maxSampledTexturesPerShaderStage", 16, LimitClass::Maximum),
    ("maxSamplersPerShaderStage", 16, LimitClass::Maximum),
    ("maxStorageBuffersPerShaderStage", 8, LimitClass::Maximum),
    ("maxStorageTexturesPerShaderStage", 4, LimitClass::Maximum),
    ("maxUniformBuffersPerShaderStage", 12, LimitClass::Maximum),
    ("maxUniformBufferBindingSize", 65_536, LimitClass::Maximum),
    ("maxStorageBufferBindingSize", 134_217_728, LimitClass::Maximum),
    ("minUniformBufferOffsetAlignment", 256, LimitClass::Alignment),
    ("minStorageBufferOffsetAlignment", 256, LimitClass::Alignment),
    ("maxVertexBuffers", 8, LimitClass::Maximum),
    ("maxBufferSize", 268_435_456, LimitClass::Maximum),
    ("maxVertexAttributes", 16, LimitClass::Maximum),
    ("maxVertexBufferArrayStride", 2048, LimitClass::Maximum),
    ("maxInterStageShaderVariables", 16, LimitClass::Maximum),
    ("maxColorAttachments", 8, LimitClass::Maximum),
    ("maxColorAttachmentBytesPerSample", 32, LimitClass::Maximum),
    ("maxComputeWorkgroupStorageSize", 16_384, LimitClass::Maximum),
    ("maxComputeInvocationsPerWorkgroup", 256, LimitClass::Maximum),
    ("maxComputeWorkgroupSizeX", 256, LimitClass::Maximum),
    ("maxComputeWorkgroupSizeY", 256, LimitClass::Maximum),
    ("maxComputeWorkgroupSizeZ", 64, LimitClass::Maximum),
    ("maxComputeWorkgroupsPerDimension", 65_535, LimitClass::Maximum),
];

/// Look up the default value and class of a limit.
#[must_use]
pub fn default_limit(name: &str) -> Option<(u64, LimitClass)> {
    DEFAULT_LIMITS
        .iter()
        .find(|(limit, _, _)| *limit == name)
        .map(|&(_, value, class)| (value, class))
}

/// A device configuration as requested by a test.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default, rename_all = "camelCase")]
pub struct DeviceDescriptor {
    /// Feature names the device must enable.
    pub required_features: Vec<String>,
    /// Limit names mapped to the values the device must support.
    pub required_limits: HashMap<String, u64>,
}

impl DeviceDescriptor {
    /// Create an empty descriptor.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Require a feature.
    pub fn with_feature(mut self, feature: impl Into<String>) -> Self {
        self.required_features.push(feature.into());
        self
    }

    /// Require a limit value.
    pub fn with_limit(mut self, name: impl Into<String>, value: u64) -> Self {
        self.required_limits.insert(name.into(), value);
        self
    }
}

/// The normalized, comparable form of a [`DeviceDescriptor`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CanonicalDescriptor {
    /// Sorted, deduplicated feature names.
    pub required_features: Vec<String>,
    /// Known limits whose requested value differs from the default.
    pub required_limits: BTreeMap<String, u64>,
}

impl CanonicalDescriptor {
    /// Whether this requests nothing beyond a default device.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.required_features.is_empty() && self.required_limits.is_empty()
    }
}

impl From<&CanonicalDescriptor> for DeviceDescriptor {
    fn from(canonical: &CanonicalDescriptor) -> Self {
        Self {
            required_features: canonical.required_features.clone(),
            required_limits: canonical
                .required_limits
                .iter()
                .map(|(name, value)| (name.clone(), *value))
                .collect(),
        }
    }
}

/// Cache key derived from a [`CanonicalDescriptor`].
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DescriptorKey(String);

impl DescriptorKey {
    /// The serialized key.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for DescriptorKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Canonicalize a descriptor and derive its cache key.
///
/// `None` canonicalizes to the empty descriptor.
#[must_use]
pub fn canonicalize(descriptor: Option<&DeviceDescriptor>) -> (CanonicalDescriptor, DescriptorKey) {
    let canonical = match descriptor {
        None => CanonicalDescriptor::default(),
        Some(descriptor) => {
            let features: BTreeSet<&str> = descriptor
                .required_features
                .iter()
                .map(String::as_str)
                .collect();

            let mut required_limits = BTreeMap::new();
            for &(name, default, _) in DEFAULT_LIMITS {
                if let Some(&value) = descriptor.required_limits.get(name) {
                    if value != default {
                        required_limits.insert(name.to_string(), value);
                    }
                }
            }

            CanonicalDescriptor {
                required_features: features.into_iter().map(str::to_string).collect(),
                required_limits,
            }
        }
    };
    let key = DescriptorKey(encode_key(&canonical));
    (canonical, key)
}

fn encode_key(canonical: &CanonicalDescriptor) -> String {
    // Serializing a Vec<String> and a BTreeMap<String, u64> cannot fail.
    serde_json::to_string(canonical).unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use proptest::prelude::*;

    #[test]
    fn none_is_empty() {
        let (canonical, key) = canonicalize(None);
        assert!(canonical.is_empty());
        assert_eq!(key.as_str(), r#"{"requiredFeatures":[],"requiredLimits":{}}"#);
    }

    #[test]
    fn features_are_sorted_and_deduplicated() {
        let descriptor = DeviceDescriptor::new()
            .with_feature("timestamp-query")
            .with_feature("depth-clip-control")
            .with_feature("timestamp-query");
        let (canonical, _) = canonicalize(Some(&descriptor));
        assert_eq!(
            canonical.required_features,
            vec!["depth-clip-control".to_string(), "timestamp-query".to_string()]
        );
    }

    #[test]
    fn default_and_unknown_limits_are_dropped() {
        let descriptor = DeviceDescriptor::new()
            .with_limit("maxBindGroups", 4)
            .with_limit("maxColorAttachments", 16)
            .with_limit("notARealLimit", 7);
        let (canonical, key) = canonicalize(Some(&descriptor));
        assert_eq!(canonical.required_limits.len(), 1);
        assert_eq!(canonical.required_limits.get("maxColorAttachments"), Some(&16));
        assert_eq!(
            key.as_str(),
            r#"{"requiredFeatures":[],"requiredLimits":{"maxColorAttachments":16}}"#
        );
    }

    #[test]
    fn defaulted_request_matches_empty_request() {
        let defaulted = DeviceDescriptor::new().with_limit("maxVertexBuffers", 8);
        assert_eq!(canonicalize(Some(&defaulted)).1, canonicalize(Some(&DeviceDescriptor::new())).1);
    }

    #[test]
    fn default_limit_lookup() {
        assert_eq!(
            default_limit("minUniformBufferOffsetAlignment"),
            Some((256, LimitClass::Alignment))
        );
        assert_eq!(default_limit("maxBufferSize"), Some((268_435_456, LimitClass::Maximum)));
        assert_eq!(default_limit("bogus"), None);
    }

    fn feature_names() -> impl Strategy<Value = Vec<String>> {
        prop::collection::vec(
            prop::sample::select(vec![
                "bgra8unorm-storage",
                "depth32float-stencil8",
                "float32-filterable",
                "shader-f16",
                "texture-compression-bc",
            ])
            .prop_map(str::to_string),
            0..8,
        )
    }

    fn limit_requests() -> impl Strategy<Value = HashMap<String, u64>> {
        prop::collection::hash_map(
            prop::sample::select(
                DEFAULT_LIMITS.iter().map(|(name, _, _)| (*name).to_string()).collect::<Vec<_>>(),
            ),
            prop::sample::select(vec![4u64, 8, 16, 256, 8192]),
            0..6,
        )
    }

    proptest! {
        #[test]
        fn canonicalization_is_idempotent(
            features in feature_names(),
            limits in limit_requests(),
        ) {
            let descriptor = DeviceDescriptor { required_features: features, required_limits: limits };
            let (canonical, key) = canonicalize(Some(&descriptor));
            let (again, again_key) = canonicalize(Some(&DeviceDescriptor::from(&canonical)));
            prop_assert_eq!(canonical, again);
            prop_assert_eq!(key, again_key);
        }

        #[test]
        fn feature_order_does_not_change_key(features in feature_names()) {
            let mut reversed = features.clone();
            reversed.reverse();
            let forward = DeviceDescriptor { required_features: features, ..Default::default() };
            let backward = DeviceDescriptor { required_features: reversed, ..Default::default() };
            prop_assert_eq!(canonicalize(Some(&forward)).1, canonicalize(Some(&backward)).1);
        }
    }
}
