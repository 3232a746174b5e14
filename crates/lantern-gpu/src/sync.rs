//! Synchronization primitives and frame pacing.

use crate::error::{GpuError, Result, VkResultExt};
use ash::vk;

/// Create a semaphore.
///
/// # Safety
/// The device must be valid.
pub unsafe fn create_semaphore(device: &ash::Device) -> Result<vk::Semaphore> {
    let create_info = vk::SemaphoreCreateInfo::default();
    device
        .create_semaphore(&create_info, None)
        .op("vkCreateSemaphore")
}

/// Create a fence, optionally already signaled.
///
/// # Safety
/// The device must be valid.
pub unsafe fn create_fence(device: &ash::Device, signaled: bool) -> Result<vk::Fence> {
    let flags = if signaled {
        vk::FenceCreateFlags::SIGNALED
    } else {
        vk::FenceCreateFlags::empty()
    };

    let create_info = vk::FenceCreateInfo::default().flags(flags);
    device.create_fence(&create_info, None).op("vkCreateFence")
}

/// Block until `fence` signals or `timeout_ns` passes.
///
/// # Safety
/// The device and fence must be valid.
#[cfg_attr(feature = "profiling-tracy", tracing::instrument(level = "trace", skip_all))]
pub unsafe fn wait_for_fence(device: &ash::Device, fence: vk::Fence, timeout_ns: u64) -> Result<()> {
    device
        .wait_for_fences(&[fence], true, timeout_ns)
        .op("vkWaitForFences")
}

/// Return `fence` to unsignaled.
///
/// # Safety
/// The device and fence must be valid.
pub unsafe fn reset_fence(device: &ash::Device, fence: vk::Fence) -> Result<()> {
    device.reset_fences(&[fence]).op("vkResetFences")
}

/// Per-slot synchronization objects.
///
/// Render-finished semaphores belong to swapchain images, not frame slots;
/// the application keeps those next to the chain.
pub struct FrameSync {
    /// Signaled when the acquired image is available.
    pub image_available: vk::Semaphore,
    /// Signaled when this slot's uploads have landed.
    pub transfer_done: vk::Semaphore,
    /// Signaled when the slot's graphics work retires.
    pub in_flight: vk::Fence,
}

impl FrameSync {
    /// Create one slot's semaphores and its signaled fence.
    ///
    /// # Safety
    /// The device must be valid.
    pub unsafe fn new(device: &ash::Device) -> Result<Self> {
        Ok(Self {
            image_available: create_semaphore(device)?,
            transfer_done: create_semaphore(device)?,
            in_flight: create_fence(device, true)?,
        })
    }

    /// Destroy the slot's objects.
    ///
    /// # Safety
    /// The device must be valid and resources must not be in use.
    pub unsafe fn destroy(&self, device: &ash::Device) {
        device.destroy_semaphore(self.image_available, None);
        device.destroy_semaphore(self.transfer_done, None);
        device.destroy_fence(self.in_flight, None);
    }
}

/// Fence operations on frame slots.
pub trait SlotFences {
    /// Block until the slot's last submission retires.
    fn wait(&mut self, slot: usize) -> Result<()>;

    /// Unsignal the slot's fence ahead of a submission.
    fn reset(&mut self, slot: usize) -> Result<()>;
}

struct DeviceFences<'a> {
    device: &'a ash::Device,
    syncs: &'a [FrameSync],
}

impl SlotFences for DeviceFences<'_> {
    fn wait(&mut self, slot: usize) -> Result<()> {
        // SAFETY: only built by `FrameSyncManager` methods whose callers
        // vouch for the device.
        unsafe { wait_for_fence(self.device, self.syncs[slot].in_flight, u64::MAX) }
    }

    fn reset(&mut self, slot: usize) -> Result<()> {
        // SAFETY: as above.
        unsafe { reset_fence(self.device, self.syncs[slot].in_flight) }
    }
}

/// Frame numbering and retirement over a ring of slots.
///
/// Frame numbers start at 1 and increase by one per
/// [`FrameCounter::begin_frame`]. A frame only counts as submitted once
/// [`FrameCounter::mark_submitted`] hands out its fence; skipped frames never
/// do. [`FrameCounter::completed_frame`] is the newest submitted frame whose
/// fence has been waited.
#[derive(Debug)]
pub struct FrameCounter {
    /// Frame last submitted from each slot.
    submitted: Vec<Option<u64>>,
    current_slot: usize,
    frame_number: u64,
    completed_frame: u64,
    in_frame: bool,
}

impl FrameCounter {
    /// Create a ring of `slots` slots (at least one).
    pub fn new(slots: usize) -> Self {
        Self {
            submitted: vec![None; slots.max(1)],
            current_slot: 0,
            frame_number: 0,
            completed_frame: 0,
            in_frame: false,
        }
    }

    /// Move to the next slot and wait for its previous submission.
    ///
    /// Returns the new frame number.
    pub fn begin_frame(&mut self, fences: &mut impl SlotFences) -> Result<u64> {
        if self.in_frame {
            return Err(GpuError::InvalidState("begin_frame inside a frame".into()));
        }
        let slot = if self.frame_number == 0 {
            0
        } else {
            (self.current_slot + 1) % self.submitted.len()
        };
        fences.wait(slot)?;

        self.current_slot = slot;
        self.frame_number += 1;
        self.in_frame = true;
        if let Some(frame) = self.submitted[slot] {
            self.completed_frame = self.completed_frame.max(frame);
        }
        Ok(self.frame_number)
    }

    /// Reset the current slot's fence for this frame's submission.
    pub fn mark_submitted(&mut self, fences: &mut impl SlotFences) -> Result<()> {
        if !self.in_frame {
            return Err(GpuError::InvalidState("submission outside a frame".into()));
        }
        fences.reset(self.current_slot)?;
        self.submitted[self.current_slot] = Some(self.frame_number);
        Ok(())
    }

    /// Close the frame, submitted or skipped.
    pub fn end_frame(&mut self) {
        self.in_frame = false;
    }

    /// Frame that work recorded now belongs to.
    ///
    /// Outside of a frame that is the next one.
    pub fn recording_frame(&self) -> u64 {
        if self.in_frame {
            self.frame_number
        } else {
            self.frame_number + 1
        }
    }

    /// Treat every frame so far as complete; call after device idle.
    pub fn mark_all_complete(&mut self) {
        self.completed_frame = self.frame_number;
    }

    pub fn current_slot(&self) -> usize {
        self.current_slot
    }

    pub fn frame_number(&self) -> u64 {
        self.frame_number
    }

    pub fn completed_frame(&self) -> u64 {
        self.completed_frame
    }

    pub fn slots(&self) -> usize {
        self.submitted.len()
    }
}

/// Ring of frame slots with frame numbering.
///
/// After `begin_frame` returns, every frame up to
/// [`FrameSyncManager::completed_frame`] has retired on the GPU.
pub struct FrameSyncManager {
    frame_syncs: Vec<FrameSync>,
    counter: FrameCounter,
}

impl FrameSyncManager {
    /// Create `frames_in_flight` slots (at least one).
    ///
    /// # Safety
    /// The device must be valid.
    pub unsafe fn new(device: &ash::Device, frames_in_flight: usize) -> Result<Self> {
        let mut frame_syncs = Vec::with_capacity(frames_in_flight.max(1));
        for _ in 0..frames_in_flight.max(1) {
            match FrameSync::new(device) {
                Ok(sync) => frame_syncs.push(sync),
                Err(e) => {
                    for sync in &frame_syncs {
                        sync.destroy(device);
                    }
                    return Err(e);
                }
            }
        }

        let counter = FrameCounter::new(frame_syncs.len());
        Ok(Self {
            frame_syncs,
            counter,
        })
    }

    /// Start the next frame by waiting for the slot's fence.
    ///
    /// The fence stays signaled until [`FrameSyncManager::take_submit_fence`],
    /// so a frame that ends up skipped never leaves it unsignaled. Returns the
    /// new frame number.
    ///
    /// # Safety
    /// The device must be valid.
    #[cfg_attr(feature = "profiling-tracy", tracing::instrument(level = "trace", skip_all))]
    pub unsafe fn begin_frame(&mut self, device: &ash::Device) -> Result<u64> {
        let mut fences = DeviceFences {
            device,
            syncs: &self.frame_syncs,
        };
        self.counter.begin_frame(&mut fences)
    }

    /// Reset the current slot's fence and hand it out for this frame's
    /// graphics submission.
    ///
    /// # Safety
    /// The device must be valid.
    pub unsafe fn take_submit_fence(&mut self, device: &ash::Device) -> Result<vk::Fence> {
        let mut fences = DeviceFences {
            device,
            syncs: &self.frame_syncs,
        };
        self.counter.mark_submitted(&mut fences)?;
        Ok(self.current().in_flight)
    }

    /// Close the current frame.
    pub fn end_frame(&mut self) {
        self.counter.end_frame();
    }

    /// Treat every submitted frame as complete; call after device idle.
    pub fn mark_all_complete(&mut self) {
        self.counter.mark_all_complete();
    }

    /// Slot of the frame being recorded.
    pub fn current(&self) -> &FrameSync {
        &self.frame_syncs[self.counter.current_slot()]
    }

    /// Current slot index.
    pub fn current_slot(&self) -> usize {
        self.counter.current_slot()
    }

    /// Number of the frame being recorded.
    pub fn frame_number(&self) -> u64 {
        self.counter.frame_number()
    }

    /// Frame that work recorded now belongs to.
    pub fn recording_frame(&self) -> u64 {
        self.counter.recording_frame()
    }

    /// Newest frame known to have retired.
    pub fn completed_frame(&self) -> u64 {
        self.counter.completed_frame()
    }

    pub fn frames_in_flight(&self) -> usize {
        self.frame_syncs.len()
    }

    /// Destroy every slot.
    ///
    /// # Safety
    /// The device must be valid and all resources must not be in use.
    pub unsafe fn destroy(&self, device: &ash::Device) {
        for sync in &self.frame_syncs {
            sync.destroy(device);
        }
    }
}
