//! GPU resource and frame-lifecycle layer for the Lantern renderer.
//!
//! This crate provides:
//! - Physical device selection and logical device creation
//! - Memory allocation via gpu-allocator
//! - Buffers with static, persistent, mappable and resizable update policies
//! - Swapchain acquire/present with automatic recreation
//! - Frame-tagged deferred destruction
//! - Buffer uploads on a dedicated transfer queue

pub mod buffer;
pub mod capabilities;
pub mod command;
pub mod config;
pub mod context;
pub mod debug;
pub mod deferred;
pub mod error;
pub mod instance;
pub mod kind;
pub mod memory;
pub mod platform;
pub mod registry;
pub mod selection;
pub mod surface;
pub mod swapchain;
pub mod sync;
pub mod transfer;
pub mod upload;

#[cfg(test)]
mod testing;

pub use buffer::{Buffer, BufferDevice, BufferPolicy, DeviceBuffer, MapSlots, TransferTicket};
pub use capabilities::{DeviceFeatures, DeviceType, GpuVendor, PhysicalDeviceInfo};
pub use config::GpuConfig;
pub use context::{list_devices, DeviceListing, GpuContext, GpuContextBuilder};
pub use debug::ObjectNamer;
pub use deferred::{DeferredHandle, DeferredResource, FrameReaper, VulkanDestroyer};
pub use error::{FrameError, GpuError, Result};
pub use kind::{BufferKind, IndexFormat, VertexLayout};
pub use memory::{GpuAllocator, GpuBuffer, GpuImage, MemoryStats};
pub use platform::Platform;
pub use registry::{BufferHandle, BufferRegistry};
pub use selection::{select_device, DeviceRequirements, SelectedDevice};
pub use surface::SurfaceContext;
pub use swapchain::{FrameStatus, SkipReason, SwapchainManager, SwapchainState};
pub use sync::{create_fence, create_semaphore, FrameCounter, FrameSync, FrameSyncManager, SlotFences};
pub use transfer::TransferQueue;
pub use upload::VulkanBufferDevice;
