//! Running a test body against a pooled device.

use std::future::Future;
use std::sync::Arc;

use crate::descriptor::DeviceDescriptor;
use crate::error::{Error, ErrorKind, Result};
use crate::gpu::{DeviceLostReason, GpuDevice};
use crate::holder::DeviceHolder;
use crate::pool::DevicePool;

/// Result of one test case as reported to the harness.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TestOutcome {
    /// The body succeeded and the device released cleanly.
    Passed,
    /// The requested configuration is unsupported.
    Skipped {
        /// Why the test was skipped.
        reason: String,
    },
    /// The body or the release failed.
    Failed {
        /// The failure message.
        message: String,
    },
}

impl TestOutcome {
    /// Map a pool error to the outcome the harness should record.
    #[must_use]
    pub fn from_error(err: &Error) -> Self {
        match err.kind() {
            ErrorKind::Skip => Self::Skipped {
                reason: err.to_string(),
            },
            _ => Self::Failed {
                message: err.to_string(),
            },
        }
    }

    /// Whether the test passed.
    #[must_use]
    pub fn is_passed(&self) -> bool {
        matches!(self, Self::Passed)
    }

    /// Whether the test was skipped.
    #[must_use]
    pub fn is_skipped(&self) -> bool {
        matches!(self, Self::Skipped { .. })
    }

    /// Whether the test failed.
    #[must_use]
    pub fn is_failed(&self) -> bool {
        matches!(self, Self::Failed { .. })
    }
}

/// The device handed to a test body.
pub struct TestDevice {
    device: Arc<dyn GpuDevice>,
    holder: Arc<DeviceHolder>,
}

impl std::fmt::Debug for TestDevice {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TestDevice")
            .field("resource_id", &self.holder.resource_id())
            .finish()
    }
}

impl TestDevice {
    /// The acquired device.
    #[must_use]
    pub fn device(&self) -> &Arc<dyn GpuDevice> {
        &self.device
    }

    /// Declare that the body will lose the device with `reason`.
    pub fn expect_device_lost(&self, reason: DeviceLostReason) -> Result<()> {
        self.holder.expect_device_lost(reason)
    }
}

impl DevicePool {
    /// Reserve and acquire a device, run `body` with it, then release it.
    ///
    /// A failing body takes precedence over a failing release; the release
    /// error is still logged and still decides whether the device is reused.
    pub async fn run_test<F, Fut, E>(
        &self,
        descriptor: Option<&DeviceDescriptor>,
        body: F,
    ) -> TestOutcome
    where
        F: FnOnce(TestDevice) -> Fut,
        Fut: Future<Output = std::result::Result<(), E>>,
        E: std::fmt::Display,
    {
        let holder = match self.reserve(descriptor).await {
            Ok(holder) => holder,
            Err(err) => return TestOutcome::from_error(&err),
        };

        let device = match holder.acquire() {
            Ok(device) => device,
            Err(err) => {
                if let Err(release_err) = self.release(&holder).await {
                    tracing::warn!(error = %release_err, "Release after failed acquire failed");
                }
                return TestOutcome::from_error(&err);
            }
        };

        let body_result = body(TestDevice {
            device,
            holder: Arc::clone(&holder),
        })
        .await;
        let release_result = self.release(&holder).await;

        match (body_result, release_result) {
            (Ok(()), Ok(())) => TestOutcome::Passed,
            (Ok(()), Err(err)) => TestOutcome::from_error(&err),
            (Err(body_err), release_result) => {
                if let Err(err) = release_result {
                    tracing::warn!(
                        resource_id = %holder.resource_id(),
                        error = %err,
                        "Release failed after test body failure"
                    );
                }
                TestOutcome::Failed {
                    message: body_err.to_string(),
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gpu::ErrorFilter;
    use crate::pool::DevicePoolConfig;
    use crate::testing::MockGpu;

    fn pool(gpu: &Arc<MockGpu>) -> DevicePool {
        DevicePool::new(gpu.clone(), DevicePoolConfig::default()).unwrap()
    }

    #[tokio::test]
    async fn clean_body_passes() {
        let gpu = Arc::new(MockGpu::new());
        let pool = pool(&gpu);
        let outcome = pool
            .run_test(None, |_device| async { Ok::<(), String>(()) })
            .await;
        assert_eq!(outcome, TestOutcome::Passed);
    }

    #[tokio::test]
    async fn unsupported_descriptor_skips() {
        let gpu = Arc::new(MockGpu::new());
        let pool = pool(&gpu);
        let descriptor = DeviceDescriptor::new().with_feature("texture-compression-astc");
        let outcome = pool
            .run_test(Some(&descriptor), |_device| async { Ok::<(), String>(()) })
            .await;
        assert!(outcome.is_skipped());
    }

    #[tokio::test]
    async fn validation_error_fails_the_test() {
        let gpu = Arc::new(MockGpu::new());
        let pool = pool(&gpu);
        let mock = Arc::clone(&gpu);
        let outcome = pool
            .run_test(None, move |_device| async move {
                if let Some(device) = mock.last_device() {
                    device.inject_error(ErrorFilter::Validation, "bad pipeline layout");
                }
                Ok::<(), String>(())
            })
            .await;
        match outcome {
            TestOutcome::Failed { message } => assert!(message.contains("bad pipeline layout")),
            other => panic!("expected failure, got {other:?}"),
        }
        assert_eq!(gpu.device_requests(), 1);
    }

    #[tokio::test]
    async fn body_error_wins_over_release_error() {
        let gpu = Arc::new(MockGpu::new());
        let pool = pool(&gpu);
        let mock = Arc::clone(&gpu);
        let outcome = pool
            .run_test(None, move |_device| async move {
                if let Some(device) = mock.last_device() {
                    device.inject_error(ErrorFilter::OutOfMemory, "oom");
                }
                Err::<(), _>("assertion failed: pixel mismatch")
            })
            .await;
        assert_eq!(
            outcome,
            TestOutcome::Failed {
                message: "assertion failed: pixel mismatch".to_string()
            }
        );
        assert_eq!(pool.stats().retired, 1);
    }

    #[tokio::test]
    async fn expected_loss_passes_and_retires_device() {
        let gpu = Arc::new(MockGpu::new());
        let pool = pool(&gpu);
        let outcome = pool
            .run_test(None, |test| async move {
                test.expect_device_lost(DeviceLostReason::Destroyed)
                    .map_err(|err| err.to_string())?;
                test.device().destroy();
                Ok::<(), String>(())
            })
            .await;
        assert_eq!(outcome, TestOutcome::Passed);
        assert_eq!(pool.stats().retired, 1);

        let next = pool
            .run_test(None, |_device| async { Ok::<(), String>(()) })
            .await;
        assert!(next.is_passed());
        assert_eq!(gpu.device_requests(), 2);
    }
}
