//! Application context.

use std::time::Instant;

use ash::vk;
use lantern_gpu::command::CommandPool;
use lantern_gpu::sync::{create_semaphore, FrameSyncManager};
use lantern_gpu::{
    DeferredHandle, DeferredResource, FrameReaper, GpuConfig, GpuContext, MapSlots,
    SurfaceContext, SwapchainManager, TransferQueue, VulkanBufferDevice, VulkanDestroyer,
};
use lantern_platform::WindowPlatform;

/// Application context shared across all app methods.
///
/// Field order is drop order: everything holding the device is declared
/// before `gpu`, and the window outlives the surface.
pub struct AppContext {
    /// Swapchain and its recreation state.
    pub swapchain: SwapchainManager<SurfaceContext>,
    /// Upload queue used by [`AppContext::buffer_device`].
    pub transfer: TransferQueue,
    /// Objects waiting for their frame to retire.
    pub reaper: FrameReaper<DeferredResource>,
    pub(crate) map_slots: MapSlots,
    pub(crate) command_pool: CommandPool,
    pub(crate) command_buffers: Vec<vk::CommandBuffer>,
    pub(crate) sync: FrameSyncManager,
    /// Per-swapchain-image semaphores, rebuilt with the chain.
    pub(crate) render_finished: Vec<vk::Semaphore>,
    pub(crate) render_finished_generation: u64,
    pub(crate) last_frame_time: Instant,
    /// Renderer settings; vsync and HDR are re-read every frame.
    pub config: GpuConfig,
    /// Frames actually presented.
    pub frame_count: u64,
    /// GPU context with device and queues.
    pub gpu: GpuContext,
    /// The window.
    pub platform: WindowPlatform,
}

impl AppContext {
    /// Create the per-frame resources for a context.
    pub(crate) fn new(
        platform: WindowPlatform,
        gpu: GpuContext,
        config: GpuConfig,
    ) -> anyhow::Result<Self> {
        let device = gpu.device();
        let swapchain = SwapchainManager::new(SurfaceContext::new(&gpu)?);

        // SAFETY: both queues belong to this device and the named families.
        let transfer = unsafe {
            TransferQueue::new(
                gpu.device_arc(),
                gpu.transfer_queue(),
                gpu.transfer_queue_family(),
                gpu.graphics_queue(),
                gpu.graphics_queue_family(),
            )
        }?;
        if transfer.is_cross_family() {
            tracing::info!(
                family = transfer.family(),
                "Uploads use a dedicated transfer queue"
            );
        }

        // SAFETY: the device is valid; partially created objects are
        // destroyed before an error returns.
        let (command_pool, command_buffers, sync) = unsafe {
            let command_pool = CommandPool::new(device, gpu.graphics_queue_family(), false)?;
            let frames = config.frames_in_flight.max(1);
            let resources = command_pool
                .allocate(device, frames as u32)
                .and_then(|buffers| Ok((buffers, FrameSyncManager::new(device, frames)?)));
            match resources {
                Ok((buffers, sync)) => (command_pool, buffers, sync),
                Err(e) => {
                    command_pool.destroy(device);
                    return Err(e.into());
                }
            }
        };

        for (slot, cmd) in command_buffers.iter().enumerate() {
            gpu.set_object_name(*cmd, &format!("frame slot {slot} commands"));
        }

        Ok(Self {
            swapchain,
            transfer,
            reaper: FrameReaper::new(),
            map_slots: MapSlots::default(),
            command_pool,
            command_buffers,
            sync,
            render_finished: Vec::new(),
            render_finished_generation: 0,
            last_frame_time: Instant::now(),
            config,
            frame_count: 0,
            gpu,
            platform,
        })
    }

    /// Frame that the next submission will belong to.
    ///
    /// Outside of a frame (during `init` or `update`) work is picked up by
    /// the next frame.
    pub fn recording_frame(&self) -> u64 {
        self.sync.recording_frame()
    }

    /// Device for creating and updating buffers.
    pub fn buffer_device(&mut self) -> VulkanBufferDevice<'_> {
        let frame = self.recording_frame();
        VulkanBufferDevice::new(
            self.gpu.allocator(),
            &mut self.transfer,
            &mut self.reaper,
            &mut self.map_slots,
            frame,
        )
    }

    /// Destroy `resource` once the current frame has retired.
    pub fn defer(&mut self, resource: DeferredResource) -> DeferredHandle {
        let frame = self.recording_frame();
        self.reaper.release(resource, frame)
    }

    /// Destroy everything released in retired frames.
    pub(crate) fn reap(&mut self) -> lantern_gpu::Result<usize> {
        let completed = self.sync.completed_frame();
        let mut allocator = self.gpu.allocator().lock();
        let mut destroyer = VulkanDestroyer::new(self.gpu.device(), &mut allocator);
        self.reaper.flush(completed, &mut destroyer)
    }

    /// Make sure there is one render-finished semaphore per swapchain image.
    ///
    /// Semaphores of the previous chain go through the reaper.
    pub(crate) fn sync_render_finished(&mut self) -> lantern_gpu::Result<()> {
        let generation = self.swapchain.generation();
        if generation == self.render_finished_generation {
            return Ok(());
        }
        let frame = self.recording_frame();
        for semaphore in self.render_finished.drain(..) {
            self.reaper
                .release(DeferredResource::Semaphore(semaphore), frame);
        }
        let count = self.swapchain.chain().map_or(0, |chain| chain.image_count());
        for image in 0..count {
            // SAFETY: the device is valid.
            let semaphore = unsafe { create_semaphore(self.gpu.device()) }?;
            self.gpu
                .set_object_name(semaphore, &format!("render finished (image {image})"));
            self.render_finished.push(semaphore);
        }
        self.render_finished_generation = generation;
        Ok(())
    }

    /// Get the current swapchain extent, zero while there is no chain.
    pub fn extent(&self) -> vk::Extent2D {
        self.swapchain
            .config()
            .map(|config| config.extent)
            .unwrap_or_default()
    }

    pub fn width(&self) -> u32 {
        self.extent().width
    }

    pub fn height(&self) -> u32 {
        self.extent().height
    }

    /// Get the aspect ratio (width / height).
    pub fn aspect_ratio(&self) -> f32 {
        let extent = self.extent();
        if extent.height == 0 {
            1.0
        } else {
            extent.width as f32 / extent.height as f32
        }
    }

    /// Get the number of frames in flight.
    pub fn frames_in_flight(&self) -> usize {
        self.sync.frames_in_flight()
    }

    /// Newest frame known to have retired on the GPU.
    pub fn completed_frame(&self) -> u64 {
        self.sync.completed_frame()
    }

    /// Log allocator usage.
    pub fn log_memory_stats(&self) {
        match self.gpu.memory_stats() {
            Ok(stats) => tracing::info!(frame = self.frame_count, "GPU memory: {stats}"),
            Err(e) => tracing::warn!("Memory statistics unavailable: {e}"),
        }
    }

    /// Release frame resources after the application has cleaned up.
    ///
    /// Must only run once, at shutdown.
    pub(crate) fn cleanup(&mut self) {
        if let Err(e) = self.transfer.flush() {
            tracing::error!("Failed to flush transfers: {e}");
        }
        if let Err(e) = self.gpu.wait_idle() {
            tracing::error!("Failed to wait idle: {e}");
        }
        self.sync.mark_all_complete();

        let device = self.gpu.device();
        for semaphore in self.render_finished.drain(..) {
            self.reaper
                .release(DeferredResource::Semaphore(semaphore), 0);
        }
        {
            let mut allocator = self.gpu.allocator().lock();
            let mut destroyer = VulkanDestroyer::new(device, &mut allocator);
            match self.reaper.flush_all(&mut destroyer) {
                Ok(count) => tracing::debug!(count, "Reaper drained"),
                Err(e) => tracing::error!("Deferred destruction failed at shutdown: {e}"),
            }
        }

        // SAFETY: the device is idle.
        unsafe {
            self.sync.destroy(device);
            self.command_pool.destroy(device);
        }
        self.command_buffers.clear();
        self.swapchain.destroy_chain();
    }
}
