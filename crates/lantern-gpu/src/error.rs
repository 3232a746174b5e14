//! GPU error types.
//!
//! Errors come in two tiers. [`GpuError`] is fatal: it aborts initialization
//! or the running renderer. [`FrameError`] covers the per-frame swapchain
//! anomalies that heal themselves by recreating the chain or skipping a frame;
//! it never escapes the swapchain manager.

use ash::vk;
use thiserror::Error;

/// Fatal GPU errors.
#[derive(Error, Debug)]
pub enum GpuError {
    /// Vulkan error without further context.
    #[error("Vulkan error: {0}")]
    Vulkan(#[from] vk::Result),

    /// A named Vulkan call failed.
    #[error("{operation} failed: {result}")]
    Call {
        operation: &'static str,
        result: vk::Result,
    },

    /// The Vulkan loader could not be loaded.
    #[error("Failed to load Vulkan: {0}")]
    Loader(String),

    /// Enumeration returned no physical devices at all.
    #[error("No Vulkan devices found. The graphics card may have no Vulkan support or the driver may be too old")]
    NoDevices,

    /// Devices exist but none passes the feature, extension and queue checks.
    #[error("No Vulkan device supports the minimum requirements of this application")]
    NoCompatibleDevice,

    /// Memory allocation failed.
    #[error("Memory allocation failed: {0}")]
    AllocationFailed(String),

    /// Surface creation failed.
    #[error("Surface creation failed: {0}")]
    SurfaceCreation(String),

    /// Swapchain creation failed.
    #[error("Swapchain creation failed: {0}")]
    SwapchainCreation(String),

    /// A configuration value could not be parsed.
    #[error("Invalid configuration: {0}")]
    Config(String),

    /// API misuse, such as mapping a buffer twice.
    #[error("Invalid state: {0}")]
    InvalidState(String),
}

/// Result type alias.
pub type Result<T> = std::result::Result<T, GpuError>;

/// Attach the name of the failing Vulkan call to a raw result.
pub trait VkResultExt<T> {
    /// Convert the error into [`GpuError::Call`] naming `operation`.
    fn op(self, operation: &'static str) -> Result<T>;
}

impl<T> VkResultExt<T> for std::result::Result<T, vk::Result> {
    fn op(self, operation: &'static str) -> Result<T> {
        self.map_err(|result| GpuError::Call { operation, result })
    }
}

/// Recoverable per-frame presentation conditions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameError {
    /// The chain still works but no longer matches the surface exactly.
    Suboptimal,
    /// The chain is unusable and must be rebuilt before acquiring again.
    OutOfDate,
    /// The surface went away; rebuild on the next frame.
    SurfaceLost,
    /// No image was available without waiting.
    NotReady,
    /// The bounded acquire wait expired.
    Timeout,
}

impl FrameError {
    /// Split a Vulkan result into a recoverable frame condition or a fatal error.
    pub fn classify(result: vk::Result, operation: &'static str) -> Result<Self> {
        match result {
            vk::Result::SUBOPTIMAL_KHR => Ok(Self::Suboptimal),
            vk::Result::ERROR_OUT_OF_DATE_KHR => Ok(Self::OutOfDate),
            vk::Result::ERROR_SURFACE_LOST_KHR => Ok(Self::SurfaceLost),
            vk::Result::NOT_READY => Ok(Self::NotReady),
            vk::Result::TIMEOUT => Ok(Self::Timeout),
            result => Err(GpuError::Call { operation, result }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn swapchain_codes_are_recoverable() {
        let op = "vkAcquireNextImageKHR";
        assert_eq!(
            FrameError::classify(vk::Result::ERROR_OUT_OF_DATE_KHR, op).unwrap(),
            FrameError::OutOfDate
        );
        assert_eq!(
            FrameError::classify(vk::Result::TIMEOUT, op).unwrap(),
            FrameError::Timeout
        );
        assert_eq!(
            FrameError::classify(vk::Result::ERROR_SURFACE_LOST_KHR, op).unwrap(),
            FrameError::SurfaceLost
        );
    }

    #[test]
    fn memory_and_device_loss_are_fatal() {
        for code in [
            vk::Result::ERROR_OUT_OF_HOST_MEMORY,
            vk::Result::ERROR_OUT_OF_DEVICE_MEMORY,
            vk::Result::ERROR_DEVICE_LOST,
        ] {
            let err = FrameError::classify(code, "vkQueuePresentKHR").unwrap_err();
            assert!(matches!(err, GpuError::Call { result, .. } if result == code));
        }
    }

    #[test]
    fn call_error_names_operation() {
        let err: Result<()> = Err(vk::Result::ERROR_INITIALIZATION_FAILED).op("vkCreateDevice");
        let message = err.unwrap_err().to_string();
        assert!(message.starts_with("vkCreateDevice failed"));
    }
}
