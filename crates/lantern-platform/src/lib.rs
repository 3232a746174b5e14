//! Window system integration for the Lantern renderer.
//!
//! Implements the [`Platform`] contract for winit windows via ash-window.

use ash::vk;
use lantern_gpu::{GpuError, Platform};
use raw_window_handle::{HasDisplayHandle, HasWindowHandle};
use std::ffi::CStr;
use std::sync::Arc;
use thiserror::Error;
use winit::dpi::PhysicalSize;
use winit::event_loop::ActiveEventLoop;
use winit::window::Window;

#[derive(Error, Debug)]
pub enum PlatformError {
    #[error("Window creation failed: {0}")]
    WindowCreation(String),
    #[error("Window handle unavailable: {0}")]
    Handle(String),
}

pub type Result<T> = std::result::Result<T, PlatformError>;

impl From<PlatformError> for GpuError {
    fn from(error: PlatformError) -> Self {
        Self::SurfaceCreation(error.to_string())
    }
}

/// Window configuration.
#[derive(Debug, Clone)]
pub struct WindowConfig {
    pub title: String,
    pub width: u32,
    pub height: u32,
    pub resizable: bool,
}

impl Default for WindowConfig {
    fn default() -> Self {
        Self {
            title: "Lantern".to_string(),
            width: 1280,
            height: 720,
            resizable: true,
        }
    }
}

/// A winit window presented through Vulkan.
pub struct WindowPlatform {
    window: Arc<Window>,
}

impl WindowPlatform {
    /// Create a window on an active event loop.
    pub fn create(event_loop: &ActiveEventLoop, config: &WindowConfig) -> Result<Self> {
        let attributes = Window::default_attributes()
            .with_title(&config.title)
            .with_inner_size(PhysicalSize::new(config.width, config.height))
            .with_resizable(config.resizable);
        let window = event_loop
            .create_window(attributes)
            .map_err(|e| PlatformError::WindowCreation(e.to_string()))?;
        tracing::debug!(width = config.width, height = config.height, "Window created");
        Ok(Self::from_window(Arc::new(window)))
    }

    /// Wrap an existing window.
    pub fn from_window(window: Arc<Window>) -> Self {
        Self { window }
    }

    pub fn window(&self) -> &Arc<Window> {
        &self.window
    }

    fn raw_handles(
        &self,
    ) -> Result<(
        raw_window_handle::RawDisplayHandle,
        raw_window_handle::RawWindowHandle,
    )> {
        let display = self
            .window
            .display_handle()
            .map_err(|e| PlatformError::Handle(e.to_string()))?;
        let window = self
            .window
            .window_handle()
            .map_err(|e| PlatformError::Handle(e.to_string()))?;
        Ok((display.as_raw(), window.as_raw()))
    }
}

impl Platform for WindowPlatform {
    fn required_instance_extensions(&self) -> lantern_gpu::Result<Vec<&'static CStr>> {
        let (display, _) = self.raw_handles()?;
        let names = ash_window::enumerate_required_extensions(display)
            .map_err(|e| GpuError::SurfaceCreation(e.to_string()))?;
        // SAFETY: ash-window returns pointers to static extension name strings.
        Ok(names
            .iter()
            .map(|&name| unsafe { CStr::from_ptr(name) })
            .collect())
    }

    unsafe fn create_surface(
        &self,
        entry: &ash::Entry,
        instance: &ash::Instance,
    ) -> lantern_gpu::Result<vk::SurfaceKHR> {
        let (display, window) = self.raw_handles()?;
        ash_window::create_surface(entry, instance, display, window, None)
            .map_err(|e| GpuError::SurfaceCreation(e.to_string()))
    }

    fn drawable_size(&self) -> (u32, u32) {
        let size = self.window.inner_size();
        (size.width, size.height)
    }
}
