//! Deferred resource destruction for multi-frame-in-flight rendering.
//!
//! GPU objects cannot be destroyed while a submitted command buffer may still
//! reference them. Released objects are tagged with the frame that released
//! them and are only destroyed once that frame's fence has signalled.

use crate::error::{Result, VkResultExt};
use crate::memory::{GpuAllocator, GpuBuffer, GpuImage};
use ash::vk;
use slotmap::{new_key_type, SlotMap};

/// Resources that can wait in a [`FrameReaper`].
pub trait Deferrable {
    /// Destruction order inside one flush; lower ranks go first.
    fn destroy_rank(&self) -> u8 {
        0
    }
}

/// Destroys what the reaper hands it.
pub trait ResourceSink<R> {
    fn destroy(&mut self, resource: R) -> Result<()>;
}

/// A resource waiting for its frame to complete.
pub struct Deferred<R> {
    resource: R,
    frame: u64,
    sequence: u64,
}

impl<R> Deferred<R> {
    /// Frame in which the resource was released.
    pub fn frame(&self) -> u64 {
        self.frame
    }

    pub fn resource(&self) -> &R {
        &self.resource
    }
}

new_key_type! {
    /// Handle to a resource pending destruction.
    pub struct DeferredHandle;
}

/// Frame-tagged destruction queue.
pub struct FrameReaper<R> {
    pending: SlotMap<DeferredHandle, Deferred<R>>,
    next_sequence: u64,
}

impl<R> Default for FrameReaper<R> {
    fn default() -> Self {
        Self {
            pending: SlotMap::with_key(),
            next_sequence: 0,
        }
    }
}

impl<R: Deferrable> FrameReaper<R> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue `resource`, released during `frame`.
    pub fn release(&mut self, resource: R, frame: u64) -> DeferredHandle {
        self.next_sequence += 1;
        self.pending.insert(Deferred {
            resource,
            frame,
            sequence: self.next_sequence,
        })
    }

    /// Whether the resource behind `handle` is still waiting.
    pub fn is_pending(&self, handle: DeferredHandle) -> bool {
        self.pending.contains_key(handle)
    }

    pub fn get(&self, handle: DeferredHandle) -> Option<&Deferred<R>> {
        self.pending.get(handle)
    }

    /// Destroy everything released in frames up to and including
    /// `completed_frame`.
    ///
    /// Call after waiting on that frame's fence. Every ready resource is
    /// handed to the sink even if one fails; the first error is returned.
    #[cfg_attr(feature = "profiling-tracy", tracing::instrument(level = "trace", skip_all))]
    pub fn flush(&mut self, completed_frame: u64, sink: &mut impl ResourceSink<R>) -> Result<usize> {
        let ready = self.take_where(|deferred| deferred.frame <= completed_frame);
        let count = ready.len();
        if count > 0 {
            tracing::debug!(completed_frame, count, "Reaping deferred resources");
        }
        Self::destroy_all(ready, sink).map(|()| count)
    }

    /// Destroy everything regardless of frame.
    ///
    /// Only valid after the device is idle, typically at shutdown.
    pub fn flush_all(&mut self, sink: &mut impl ResourceSink<R>) -> Result<usize> {
        let all: Vec<_> = self.pending.drain().map(|(_, deferred)| deferred).collect();
        let count = all.len();
        Self::destroy_all(all, sink).map(|()| count)
    }

    fn take_where(&mut self, mut ready: impl FnMut(&Deferred<R>) -> bool) -> Vec<Deferred<R>> {
        let keys: Vec<DeferredHandle> = self
            .pending
            .iter()
            .filter(|(_, deferred)| ready(*deferred))
            .map(|(key, _)| key)
            .collect();
        keys.into_iter()
            .filter_map(|key| self.pending.remove(key))
            .collect()
    }

    fn destroy_all(mut ready: Vec<Deferred<R>>, sink: &mut impl ResourceSink<R>) -> Result<()> {
        ready.sort_by_key(|deferred| {
            (
                deferred.resource.destroy_rank(),
                deferred.frame,
                deferred.sequence,
            )
        });
        let mut first_error = None;
        for deferred in ready {
            if let Err(e) = sink.destroy(deferred.resource) {
                tracing::error!("Deferred destruction failed: {e}");
                first_error.get_or_insert(e);
            }
        }
        first_error.map_or(Ok(()), Err)
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    /// Oldest frame still holding resources.
    pub fn oldest_pending_frame(&self) -> Option<u64> {
        self.pending.values().map(|deferred| deferred.frame).min()
    }
}

impl<R> Drop for FrameReaper<R> {
    fn drop(&mut self) {
        if !self.pending.is_empty() {
            tracing::warn!(
                count = self.pending.len(),
                "Frame reaper dropped with resources still pending"
            );
        }
    }
}

/// Vulkan objects the renderer defers.
pub enum DeferredResource {
    Framebuffer(vk::Framebuffer),
    ImageView(vk::ImageView),
    Image(GpuImage),
    Buffer(GpuBuffer),
    DescriptorSet {
        pool: vk::DescriptorPool,
        set: vk::DescriptorSet,
    },
    DescriptorPool(vk::DescriptorPool),
    CommandBuffer {
        pool: vk::CommandPool,
        buffer: vk::CommandBuffer,
    },
    Semaphore(vk::Semaphore),
}

impl Deferrable for DeferredResource {
    fn destroy_rank(&self) -> u8 {
        // Users before what they were created from.
        match self {
            Self::Framebuffer(_) => 0,
            Self::ImageView(_) => 1,
            Self::Image(_) => 2,
            Self::Buffer(_) => 3,
            Self::DescriptorSet { .. } => 4,
            Self::DescriptorPool(_) => 5,
            Self::CommandBuffer { .. } => 6,
            Self::Semaphore(_) => 7,
        }
    }
}

/// Sink that destroys Vulkan objects and frees their memory.
pub struct VulkanDestroyer<'a> {
    device: &'a ash::Device,
    allocator: &'a mut GpuAllocator,
}

impl<'a> VulkanDestroyer<'a> {
    pub fn new(device: &'a ash::Device, allocator: &'a mut GpuAllocator) -> Self {
        Self { device, allocator }
    }
}

impl ResourceSink<DeferredResource> for VulkanDestroyer<'_> {
    fn destroy(&mut self, resource: DeferredResource) -> Result<()> {
        // SAFETY: the reaper only hands over objects whose frame fence has
        // signalled, or everything after device idle.
        unsafe {
            match resource {
                DeferredResource::Framebuffer(framebuffer) => {
                    self.device.destroy_framebuffer(framebuffer, None);
                }
                DeferredResource::ImageView(view) => self.device.destroy_image_view(view, None),
                DeferredResource::Image(mut image) => self.allocator.free_image(&mut image)?,
                DeferredResource::Buffer(mut buffer) => self.allocator.free_buffer(&mut buffer)?,
                DeferredResource::DescriptorSet { pool, set } => self
                    .device
                    .free_descriptor_sets(pool, &[set])
                    .op("vkFreeDescriptorSets")?,
                DeferredResource::DescriptorPool(pool) => {
                    self.device.destroy_descriptor_pool(pool, None);
                }
                DeferredResource::CommandBuffer { pool, buffer } => {
                    self.device.free_command_buffers(pool, &[buffer]);
                }
                DeferredResource::Semaphore(semaphore) => {
                    self.device.destroy_semaphore(semaphore, None);
                }
            }
        }
        Ok(())
    }
}
