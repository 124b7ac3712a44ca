//! Device creation failure handling.
//!
//! A default device that fails to initialize poisons the pool for the rest of
//! the run. Unsupported descriptors are skipped and never retried; other
//! creation failures stay retryable.

use std::sync::Arc;

use cts_device_pool::DeviceDescriptor;
use cts_device_pool::error::{Error, ErrorKind};
use cts_device_pool::pool::{DevicePool, DevicePoolConfig};
use cts_device_pool::testing::MockGpu;

fn pool(gpu: &Arc<MockGpu>) -> DevicePool {
    DevicePool::new(gpu.clone(), DevicePoolConfig::default()).unwrap()
}

// ---------------------------------------------------------------------------
// Default device failure
// ---------------------------------------------------------------------------

#[tokio::test]
async fn default_failure_is_sticky() {
    let gpu = Arc::new(MockGpu::new().with_feature("shader-f16"));
    gpu.set_device_creation_fails(true);
    let pool = pool(&gpu);

    let err = pool.reserve(None).await.unwrap_err();
    assert!(matches!(err, Error::Unavailable { retryable: false, .. }));
    let first_message = err.to_string();
    assert!(first_message.contains("not retrying"), "{first_message}");
    assert!(first_message.contains("adapter returned no device"), "{first_message}");
    assert_eq!(gpu.device_requests(), 1);

    // Recovery of the platform does not matter: the pool never retries.
    gpu.set_device_creation_fails(false);
    for _ in 0..3 {
        let err = pool.reserve(None).await.unwrap_err();
        assert!(matches!(err, Error::Unavailable { retryable: false, .. }));
        assert!(err.to_string().contains("not retrying"));
    }

    let err = pool
        .reserve(Some(&DeviceDescriptor::new().with_feature("shader-f16")))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Unavailable { .. }));
    assert_eq!(gpu.device_requests(), 1);
}

#[tokio::test]
async fn missing_adapter_poisons_pool() {
    let gpu = Arc::new(MockGpu::new());
    gpu.set_adapter_available(false);
    let pool = pool(&gpu);

    let err = pool.reserve(None).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Fatal);
    assert_eq!(gpu.adapter_requests(), 1);

    gpu.set_adapter_available(true);
    assert!(pool.reserve(None).await.is_err());
    assert_eq!(gpu.adapter_requests(), 1);
}

#[tokio::test]
async fn failed_recreation_after_discard_is_sticky() {
    let gpu = Arc::new(MockGpu::new());
    let pool = pool(&gpu);

    let holder = pool.reserve(None).await.unwrap();
    let device = holder.acquire().unwrap();
    device.push_error_scope(cts_device_pool::ErrorFilter::Validation);
    let err = pool.release(&holder).await.unwrap_err();
    assert!(matches!(err, Error::ScopeStackCorrupted { .. }));

    gpu.set_device_creation_fails(true);
    assert!(matches!(
        pool.reserve(None).await.unwrap_err(),
        Error::Unavailable { retryable: false, .. }
    ));
    gpu.set_device_creation_fails(false);
    assert!(matches!(
        pool.reserve(None).await.unwrap_err(),
        Error::Unavailable { .. }
    ));
}

// ---------------------------------------------------------------------------
// Unsupported descriptors
// ---------------------------------------------------------------------------

#[tokio::test]
async fn unsupported_features_are_memoized() {
    let gpu = Arc::new(MockGpu::new());
    let pool = pool(&gpu);
    let descriptor = DeviceDescriptor::new().with_feature("texture-compression-etc2");

    let err = pool.reserve(Some(&descriptor)).await.unwrap_err();
    assert!(matches!(err, Error::Skip { .. }));
    assert_eq!(err.kind(), ErrorKind::Skip);
    let adapter_requests = gpu.adapter_requests();

    let err = pool.reserve(Some(&descriptor)).await.unwrap_err();
    assert!(matches!(err, Error::Skip { .. }));
    assert_eq!(gpu.adapter_requests(), adapter_requests);
    assert_eq!(gpu.device_requests(), 1);
    assert_eq!(pool.stats().skipped, 2);
}

#[tokio::test]
async fn unsupported_limits_are_memoized() {
    let gpu = Arc::new(MockGpu::new().with_limit("maxComputeWorkgroupStorageSize", 32_768));
    let pool = pool(&gpu);
    let supported = DeviceDescriptor::new().with_limit("maxComputeWorkgroupStorageSize", 32_768);
    let unsupported = DeviceDescriptor::new().with_limit("maxComputeWorkgroupStorageSize", 65_536);

    assert!(pool.reserve(Some(&supported)).await.is_ok());
    let err = pool.reserve(Some(&unsupported)).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Skip);
    let adapter_requests = gpu.adapter_requests();
    assert!(pool.reserve(Some(&unsupported)).await.is_err());
    assert_eq!(gpu.adapter_requests(), adapter_requests);
}

#[tokio::test]
async fn transient_keyed_failure_is_retried() {
    let gpu = Arc::new(MockGpu::new().with_feature("shader-f16"));
    let pool = pool(&gpu);
    let descriptor = DeviceDescriptor::new().with_feature("shader-f16");

    let default = pool.reserve(None).await.unwrap();
    pool.release(&default).await.unwrap();

    gpu.set_device_creation_fails(true);
    let err = pool.reserve(Some(&descriptor)).await.unwrap_err();
    assert!(matches!(err, Error::Initialization { .. }));
    assert!(err.is_retryable());

    gpu.set_device_creation_fails(false);
    assert!(pool.reserve(Some(&descriptor)).await.is_ok());
}
