//! Per-frame context for rendering.

use ash::vk;

/// Context for the frame being recorded.
pub struct FrameContext {
    /// Command buffer for recording rendering commands.
    pub command_buffer: vk::CommandBuffer,
    /// Index of the acquired swapchain image.
    pub image_index: u32,
    /// The swapchain image for this frame.
    pub swapchain_image: vk::Image,
    /// View of the acquired image.
    pub swapchain_view: vk::ImageView,
    pub extent: vk::Extent2D,
    /// Whether the chain will be rebuilt after this frame.
    pub suboptimal: bool,
    /// Delta time since last frame in seconds.
    pub dt: f32,
    /// Current frame number, starting at 1.
    pub frame_number: u64,
}
