//! `LanternApp` trait definition.

use crate::context::AppContext;
use crate::frame::FrameContext;
use winit::event::{DeviceEvent, DeviceId, WindowEvent};

/// Trait for Lantern applications.
///
/// The framework owns the window, the GPU context, the swapchain, frame
/// pacing and deferred destruction. Applications upload data and record
/// commands.
pub trait LanternApp: Sized {
    /// Initialize the application.
    ///
    /// Called once after the GPU context and window have been created.
    /// Uploads issued here are submitted with the first frame.
    fn init(ctx: &mut AppContext) -> anyhow::Result<Self>;

    /// Update application state. Called every frame before uploads.
    ///
    /// # Arguments
    /// * `ctx` - Application context with GPU and window access
    /// * `dt` - Delta time in seconds since last frame
    fn update(&mut self, ctx: &AppContext, dt: f32);

    /// Write buffer data for this frame.
    ///
    /// Called after an image has been acquired and before the frame's
    /// command buffer is recorded, so copies issued here are visible to
    /// [`LanternApp::render`]. Default implementation does nothing.
    #[allow(unused_variables)]
    fn upload(&mut self, ctx: &mut AppContext) -> anyhow::Result<()> {
        Ok(())
    }

    /// Record rendering commands for the acquired image.
    ///
    /// The image is in `UNDEFINED` layout on entry and must be in
    /// `PRESENT_SRC_KHR` layout when recording ends.
    fn render(&mut self, ctx: &AppContext, frame: &FrameContext) -> anyhow::Result<()>;

    /// Called when the swapchain was rebuilt with a new extent.
    ///
    /// Default implementation does nothing.
    #[allow(unused_variables)]
    fn on_resize(&mut self, ctx: &mut AppContext, width: u32, height: u32) -> anyhow::Result<()> {
        Ok(())
    }

    /// Handle window events.
    ///
    /// Return `true` if the event was handled and should not be processed
    /// further. Default implementation returns `false`.
    #[allow(unused_variables)]
    fn on_event(&mut self, event: &WindowEvent) -> bool {
        false
    }

    /// Handle raw device events. Default implementation does nothing.
    #[allow(unused_variables)]
    fn on_device_event(&mut self, device_id: DeviceId, event: &DeviceEvent) {}

    /// Release GPU resources before shutdown.
    ///
    /// The GPU is idle when this is called; resources handed to the reaper
    /// here are destroyed right after it returns.
    #[allow(unused_variables)]
    fn cleanup(&mut self, ctx: &mut AppContext) {}
}
