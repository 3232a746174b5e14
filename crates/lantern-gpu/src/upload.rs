//! Vulkan implementation of [`BufferDevice`].
//!
//! Borrow the allocator, transfer queue and frame reaper for the duration of
//! a batch of buffer updates. Buffers retired here are tagged with the
//! current frame and only destroyed once that frame's fence signals.

use crate::buffer::{BufferDevice, MapSlots, TransferTicket};
use crate::deferred::{DeferredResource, FrameReaper};
use crate::error::Result;
use crate::memory::{GpuAllocator, GpuBuffer};
use crate::transfer::TransferQueue;
use ash::vk;
use gpu_allocator::MemoryLocation;
use parking_lot::Mutex;

/// Buffer device backed by the real allocator and transfer queue.
pub struct VulkanBufferDevice<'a> {
    allocator: &'a Mutex<GpuAllocator>,
    transfer: &'a mut TransferQueue,
    reaper: &'a mut FrameReaper<DeferredResource>,
    map_slots: &'a mut MapSlots,
    frame: u64,
}

impl<'a> VulkanBufferDevice<'a> {
    /// `frame` is the number of the frame currently being recorded.
    pub fn new(
        allocator: &'a Mutex<GpuAllocator>,
        transfer: &'a mut TransferQueue,
        reaper: &'a mut FrameReaper<DeferredResource>,
        map_slots: &'a mut MapSlots,
        frame: u64,
    ) -> Self {
        Self {
            allocator,
            transfer,
            reaper,
            map_slots,
            frame,
        }
    }
}

impl BufferDevice for VulkanBufferDevice<'_> {
    type Buffer = GpuBuffer;

    fn create_buffer(
        &mut self,
        size: u64,
        usage: vk::BufferUsageFlags,
        location: MemoryLocation,
        name: &str,
    ) -> Result<GpuBuffer> {
        tracing::trace!(size, ?location, name, "Allocating buffer");
        self.allocator
            .lock()
            .create_buffer(size, usage, location, name)
    }

    fn copy_buffer(
        &mut self,
        src: &GpuBuffer,
        dst: &mut GpuBuffer,
        region: vk::BufferCopy,
    ) -> Result<TransferTicket> {
        self.transfer.copy_buffer(
            src.buffer,
            dst.buffer,
            region.src_offset,
            region.dst_offset,
            region.size,
        )
    }

    fn is_complete(&self, ticket: TransferTicket) -> bool {
        self.transfer.is_complete(ticket)
    }

    fn wait(&mut self, ticket: TransferTicket) -> Result<()> {
        self.transfer.wait(ticket)
    }

    fn retire(&mut self, buffer: GpuBuffer) {
        self.transfer.forget(buffer.buffer);
        self.reaper
            .release(DeferredResource::Buffer(buffer), self.frame);
    }

    fn map_slots(&mut self) -> &mut MapSlots {
        self.map_slots
    }
}
