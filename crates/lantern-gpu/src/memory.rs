//! Device memory: the sub-allocator and the buffers and images it backs.

use crate::buffer::DeviceBuffer;
use crate::debug::ObjectNamer;
use crate::error::{GpuError, Result, VkResultExt};
use ash::vk;
use gpu_allocator::vulkan::{
    Allocation, AllocationCreateDesc, AllocationScheme, Allocator, AllocatorCreateDesc,
};
use gpu_allocator::{AllocatorReport, MemoryLocation};
use std::fmt;
use std::sync::Arc;

const MIB: f64 = 1024.0 * 1024.0;

/// Allocator usage summary.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MemoryStats {
    /// Live sub-allocations.
    pub allocations: usize,
    /// `VkDeviceMemory` blocks backing them.
    pub blocks: usize,
    pub allocated_bytes: u64,
    pub reserved_bytes: u64,
}

impl MemoryStats {
    pub fn from_report(report: &AllocatorReport) -> Self {
        Self {
            allocations: report.allocations.len(),
            blocks: report.blocks.len(),
            allocated_bytes: report.total_allocated_bytes,
            reserved_bytes: report.total_reserved_bytes,
        }
    }

    /// Fraction of reserved memory in use; zero when nothing is reserved.
    pub fn utilization(&self) -> f64 {
        if self.reserved_bytes == 0 {
            0.0
        } else {
            self.allocated_bytes as f64 / self.reserved_bytes as f64
        }
    }
}

impl fmt::Display for MemoryStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} allocations in {} blocks, {:.1} MiB used of {:.1} MiB ({:.0}%)",
            self.allocations,
            self.blocks,
            self.allocated_bytes as f64 / MIB,
            self.reserved_bytes as f64 / MIB,
            self.utilization() * 100.0
        )
    }
}

/// Sub-allocator shared by every buffer and image of one device.
pub struct GpuAllocator {
    allocator: Option<Allocator>,
    device: Arc<ash::Device>,
    namer: Option<ObjectNamer>,
}

impl GpuAllocator {
    /// Wrap a `gpu-allocator` pool for `device`.
    ///
    /// With a `namer`, buffers and images get their debug names.
    ///
    /// # Safety
    /// `device` and `physical_device` must come from `instance`.
    pub unsafe fn new(
        instance: &ash::Instance,
        device: Arc<ash::Device>,
        physical_device: vk::PhysicalDevice,
        buffer_device_address: bool,
        namer: Option<ObjectNamer>,
    ) -> Result<Self> {
        let allocator = Allocator::new(&AllocatorCreateDesc {
            instance: instance.clone(),
            device: (*device).clone(),
            physical_device,
            debug_settings: gpu_allocator::AllocatorDebugSettings {
                log_memory_information: cfg!(debug_assertions),
                log_leaks_on_shutdown: true,
                store_stack_traces: false,
                log_allocations: false,
                log_frees: false,
                log_stack_traces: false,
            },
            buffer_device_address,
            allocation_sizes: Default::default(),
        })
        .map_err(|e| GpuError::AllocationFailed(e.to_string()))?;

        Ok(Self {
            allocator: Some(allocator),
            device,
            namer,
        })
    }

    /// Current usage of the pool.
    pub fn stats(&self) -> Result<MemoryStats> {
        let allocator = self
            .allocator
            .as_ref()
            .ok_or_else(|| GpuError::InvalidState("allocator already shut down".to_string()))?;
        Ok(MemoryStats::from_report(&allocator.generate_report()))
    }

    fn inner(&mut self) -> Result<&mut Allocator> {
        self.allocator
            .as_mut()
            .ok_or_else(|| GpuError::InvalidState("allocator already shut down".to_string()))
    }

    /// Sub-allocate memory for one resource.
    fn allocate(
        &mut self,
        name: &str,
        requirements: vk::MemoryRequirements,
        location: MemoryLocation,
        linear: bool,
    ) -> Result<Allocation> {
        self.inner()?
            .allocate(&AllocationCreateDesc {
                name,
                requirements,
                location,
                linear,
                allocation_scheme: AllocationScheme::GpuAllocatorManaged,
            })
            .map_err(|e| GpuError::AllocationFailed(format!("{name}: {e}")))
    }

    fn release(&mut self, allocation: Option<Allocation>) -> Result<()> {
        match allocation {
            Some(allocation) => self
                .inner()?
                .free(allocation)
                .map_err(|e| GpuError::AllocationFailed(e.to_string())),
            None => Ok(()),
        }
    }

    /// Allocate a buffer.
    ///
    /// Host-visible locations come back mapped; the mapping lives as long as
    /// the allocation.
    pub fn create_buffer(
        &mut self,
        size: u64,
        usage: vk::BufferUsageFlags,
        location: MemoryLocation,
        name: &str,
    ) -> Result<GpuBuffer> {
        let info = vk::BufferCreateInfo::default()
            .size(size)
            .usage(usage)
            .sharing_mode(vk::SharingMode::EXCLUSIVE);

        // SAFETY: the device outlives the allocator.
        let buffer = unsafe { self.device.create_buffer(&info, None) }.op("vkCreateBuffer")?;
        let requirements = unsafe { self.device.get_buffer_memory_requirements(buffer) };

        let mut gpu_buffer = GpuBuffer {
            buffer,
            allocation: None,
            size,
            location,
        };
        let bound = self
            .allocate(name, requirements, location, true)
            .and_then(|allocation| {
                // SAFETY: neither the buffer nor the allocation is bound yet.
                let result = unsafe {
                    self.device
                        .bind_buffer_memory(buffer, allocation.memory(), allocation.offset())
                };
                gpu_buffer.allocation = Some(allocation);
                result.op("vkBindBufferMemory")
            });
        if let Err(e) = bound {
            self.free_buffer(&mut gpu_buffer)?;
            return Err(e);
        }
        if let Some(namer) = &self.namer {
            namer.name(buffer, name);
        }
        Ok(gpu_buffer)
    }

    /// Free a buffer and its allocation.
    pub fn free_buffer(&mut self, buffer: &mut GpuBuffer) -> Result<()> {
        let allocation = buffer.allocation.take();
        // SAFETY: callers only free buffers the GPU no longer references.
        unsafe { self.device.destroy_buffer(buffer.buffer, None) };
        buffer.buffer = vk::Buffer::null();
        self.release(allocation)
    }

    /// Allocate an optimal-tiling image.
    pub fn create_image(
        &mut self,
        info: &vk::ImageCreateInfo,
        location: MemoryLocation,
        name: &str,
    ) -> Result<GpuImage> {
        // SAFETY: the device outlives the allocator.
        let image = unsafe { self.device.create_image(info, None) }.op("vkCreateImage")?;
        let requirements = unsafe { self.device.get_image_memory_requirements(image) };

        let mut gpu_image = GpuImage {
            image,
            allocation: None,
            format: info.format,
            extent: info.extent,
        };
        let bound = self
            .allocate(name, requirements, location, false)
            .and_then(|allocation| {
                // SAFETY: neither the image nor the allocation is bound yet.
                let result = unsafe {
                    self.device
                        .bind_image_memory(image, allocation.memory(), allocation.offset())
                };
                gpu_image.allocation = Some(allocation);
                result.op("vkBindImageMemory")
            });
        if let Err(e) = bound {
            self.free_image(&mut gpu_image)?;
            return Err(e);
        }
        if let Some(namer) = &self.namer {
            namer.name(image, name);
        }
        Ok(gpu_image)
    }

    /// Free an image and its allocation.
    pub fn free_image(&mut self, image: &mut GpuImage) -> Result<()> {
        let allocation = image.allocation.take();
        // SAFETY: callers only free images the GPU no longer references.
        unsafe { self.device.destroy_image(image.image, None) };
        image.image = vk::Image::null();
        self.release(allocation)
    }

    /// Drop the underlying pool. Allocations still alive are reported as
    /// leaks. Must run before the device is destroyed.
    pub fn shutdown(&mut self) {
        drop(self.allocator.take());
    }
}

impl Drop for GpuAllocator {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Buffer handle plus the memory bound to it.
pub struct GpuBuffer {
    pub buffer: vk::Buffer,
    pub allocation: Option<Allocation>,
    pub size: u64,
    pub location: MemoryLocation,
}

impl GpuBuffer {
    /// Device address, for shaders reading through buffer references.
    ///
    /// Requires the `BUFFER_DEVICE_ADDRESS` capability.
    pub fn device_address(&self, device: &ash::Device) -> vk::DeviceAddress {
        let info = vk::BufferDeviceAddressInfo::default().buffer(self.buffer);
        unsafe { device.get_buffer_device_address(&info) }
    }
}

impl DeviceBuffer for GpuBuffer {
    fn size(&self) -> u64 {
        self.size
    }

    fn host_bytes(&self) -> Option<&[u8]> {
        let len = self.size as usize;
        self.allocation
            .as_ref()?
            .mapped_slice()
            .map(|bytes| &bytes[..len])
    }

    fn host_bytes_mut(&mut self) -> Option<&mut [u8]> {
        let len = self.size as usize;
        self.allocation
            .as_mut()?
            .mapped_slice_mut()
            .map(|bytes| &mut bytes[..len])
    }
}

/// Image handle plus the memory bound to it.
pub struct GpuImage {
    pub image: vk::Image,
    pub allocation: Option<Allocation>,
    pub format: vk::Format,
    pub extent: vk::Extent3D,
}
