//! Release of a device whose error scopes never resolve.

use std::sync::Arc;
use std::time::Duration;

use cts_device_pool::error::{Error, ErrorKind};
use cts_device_pool::gpu::same_device;
use cts_device_pool::holder::HolderState;
use cts_device_pool::pool::{DevicePool, DevicePoolConfig};
use cts_device_pool::testing::MockGpu;

#[tokio::test(start_paused = true)]
async fn hung_pop_times_out_and_discards_device() {
    let gpu = Arc::new(MockGpu::new());
    let pool = DevicePool::new(gpu.clone(), DevicePoolConfig::default()).unwrap();

    let holder = pool.reserve(None).await.unwrap();
    let device = holder.acquire().unwrap();
    gpu.last_device().unwrap().hang_pops();

    let started = tokio::time::Instant::now();
    let err = pool.release(&holder).await.unwrap_err();
    let elapsed = started.elapsed();
    assert!(elapsed >= Duration::from_millis(5000), "released after {elapsed:?}");
    assert!(elapsed < Duration::from_millis(5100), "released after {elapsed:?}");

    match &err {
        Error::Timeout {
            timeout_ms,
            operation,
            ..
        } => {
            assert_eq!(*timeout_ms, 5000);
            assert_eq!(operation, "pop_error_scope");
        }
        other => panic!("expected timeout, got {other:?}"),
    }
    assert_eq!(err.kind(), ErrorKind::NonRecoverable);
    assert_eq!(holder.state(), HolderState::Free);

    let fresh = pool.reserve(None).await.unwrap();
    assert!(!same_device(&device, &fresh.acquire().unwrap()));
    assert_eq!(gpu.device_requests(), 2);
}

#[tokio::test(start_paused = true)]
async fn configured_timeout_is_used() {
    let gpu = Arc::new(MockGpu::new());
    let config = DevicePoolConfig {
        release_timeout: Duration::from_millis(250),
        ..Default::default()
    };
    let pool = DevicePool::new(gpu.clone(), config).unwrap();

    let holder = pool.reserve(None).await.unwrap();
    holder.acquire().unwrap();
    gpu.last_device().unwrap().hang_pops();

    let started = tokio::time::Instant::now();
    let err = pool.release(&holder).await.unwrap_err();
    let elapsed = started.elapsed();
    assert!(elapsed >= Duration::from_millis(250), "released after {elapsed:?}");
    assert!(elapsed < Duration::from_millis(5000), "released after {elapsed:?}");
    assert!(matches!(err, Error::Timeout { timeout_ms: 250, .. }));
}

#[tokio::test(start_paused = true)]
async fn reserved_but_unacquired_release_never_pops() {
    let gpu = Arc::new(MockGpu::new());
    let pool = DevicePool::new(gpu.clone(), DevicePoolConfig::default()).unwrap();

    let holder = pool.reserve(None).await.unwrap();
    gpu.last_device().unwrap().hang_pops();

    pool.release(&holder).await.unwrap();
    assert_eq!(holder.state(), HolderState::Free);
}
