//! Command pools, recording and queue submission.

use crate::error::{Result, VkResultExt};
use ash::vk;

/// Pool of primary command buffers for one queue family.
pub struct CommandPool {
    pool: vk::CommandPool,
    queue_family: u32,
}

impl CommandPool {
    /// Create a pool whose buffers can be reset one at a time.
    ///
    /// # Safety
    /// The device must be valid and the queue family must exist.
    pub unsafe fn new(device: &ash::Device, queue_family: u32, transient: bool) -> Result<Self> {
        let mut flags = vk::CommandPoolCreateFlags::RESET_COMMAND_BUFFER;
        if transient {
            flags |= vk::CommandPoolCreateFlags::TRANSIENT;
        }
        let create_info = vk::CommandPoolCreateInfo::default()
            .queue_family_index(queue_family)
            .flags(flags);

        let pool = device
            .create_command_pool(&create_info, None)
            .op("vkCreateCommandPool")?;

        Ok(Self { pool, queue_family })
    }

    pub fn queue_family(&self) -> u32 {
        self.queue_family
    }

    /// Allocate `count` primary command buffers.
    ///
    /// # Safety
    /// The device must be the one the pool was created on.
    pub unsafe fn allocate(&self, device: &ash::Device, count: u32) -> Result<Vec<vk::CommandBuffer>> {
        let alloc_info = vk::CommandBufferAllocateInfo::default()
            .command_pool(self.pool)
            .level(vk::CommandBufferLevel::PRIMARY)
            .command_buffer_count(count);

        device
            .allocate_command_buffers(&alloc_info)
            .op("vkAllocateCommandBuffers")
    }

    /// Destroy the pool and every buffer allocated from it.
    ///
    /// # Safety
    /// None of the pool's buffers may be pending on a queue.
    pub unsafe fn destroy(&self, device: &ash::Device) {
        device.destroy_command_pool(self.pool, None);
    }
}

/// Reset `cmd` and begin a one-time-submit recording.
///
/// # Safety
/// `cmd` must come from a pool created by [`CommandPool::new`] and its last
/// submission must have retired.
pub unsafe fn restart(device: &ash::Device, cmd: vk::CommandBuffer) -> Result<()> {
    device
        .reset_command_buffer(cmd, vk::CommandBufferResetFlags::empty())
        .op("vkResetCommandBuffer")?;
    let begin_info =
        vk::CommandBufferBeginInfo::default().flags(vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT);
    device
        .begin_command_buffer(cmd, &begin_info)
        .op("vkBeginCommandBuffer")
}

/// Finish recording.
///
/// # Safety
/// `cmd` must be recording.
pub unsafe fn finish(device: &ash::Device, cmd: vk::CommandBuffer) -> Result<()> {
    device.end_command_buffer(cmd).op("vkEndCommandBuffer")
}

/// One queue submission: command buffers plus the semaphores around them.
#[derive(Debug, Default)]
pub struct Submission {
    command_buffers: Vec<vk::CommandBuffer>,
    wait_semaphores: Vec<vk::Semaphore>,
    wait_stages: Vec<vk::PipelineStageFlags>,
    signal_semaphores: Vec<vk::Semaphore>,
    fence: vk::Fence,
}

impl Submission {
    pub fn new(cmd: vk::CommandBuffer) -> Self {
        Self {
            command_buffers: vec![cmd],
            ..Self::default()
        }
    }

    /// Wait on `semaphore` before `stage`.
    pub fn wait(mut self, semaphore: vk::Semaphore, stage: vk::PipelineStageFlags) -> Self {
        self.wait_semaphores.push(semaphore);
        self.wait_stages.push(stage);
        self
    }

    pub fn signal(mut self, semaphores: &[vk::Semaphore]) -> Self {
        self.signal_semaphores.extend_from_slice(semaphores);
        self
    }

    /// Fence signalled when the submission retires.
    pub fn fence(mut self, fence: vk::Fence) -> Self {
        self.fence = fence;
        self
    }

    /// Semaphores waited on, in order.
    pub fn waits(&self) -> &[vk::Semaphore] {
        &self.wait_semaphores
    }

    /// Submit to `queue`.
    ///
    /// # Safety
    /// Every handle must belong to `device`, the command buffers must be
    /// executable and the fence unsignalled.
    #[cfg_attr(feature = "profiling-tracy", tracing::instrument(level = "trace", skip_all))]
    pub unsafe fn submit(&self, device: &ash::Device, queue: vk::Queue) -> Result<()> {
        let submit_info = vk::SubmitInfo::default()
            .command_buffers(&self.command_buffers)
            .wait_semaphores(&self.wait_semaphores)
            .wait_dst_stage_mask(&self.wait_stages)
            .signal_semaphores(&self.signal_semaphores);

        device
            .queue_submit(queue, &[submit_info], self.fence)
            .op("vkQueueSubmit")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ash::vk::Handle;

    #[test]
    fn submission_pairs_waits_with_stages() {
        let image = vk::Semaphore::from_raw(1);
        let upload = vk::Semaphore::from_raw(2);
        let submission = Submission::new(vk::CommandBuffer::from_raw(3))
            .wait(image, vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT)
            .wait(upload, vk::PipelineStageFlags::ALL_COMMANDS)
            .signal(&[vk::Semaphore::from_raw(4)]);

        assert_eq!(submission.waits(), [image, upload]);
        assert_eq!(submission.wait_stages.len(), submission.wait_semaphores.len());
        assert_eq!(submission.wait_stages[1], vk::PipelineStageFlags::ALL_COMMANDS);
        assert_eq!(submission.signal_semaphores.len(), 1);
        assert_eq!(submission.fence, vk::Fence::null());
    }
}
