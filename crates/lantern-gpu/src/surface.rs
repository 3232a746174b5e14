//! Vulkan presentation backend.
//!
//! [`SurfaceContext`] implements [`SwapchainBackend`] against the surface
//! owned by the [`GpuContext`]; wrap it in a
//! [`SwapchainManager`](crate::swapchain::SwapchainManager) to drive it.

use crate::context::GpuContext;
use crate::error::{GpuError, Result};
use crate::swapchain::{SurfaceInfo, Swapchain, SwapchainBackend, SwapchainConfig};
use ash::prelude::VkResult;
use ash::vk;
use std::sync::Arc;

/// Surface, present queue and swapchain loader for one window.
pub struct SurfaceContext {
    surface: vk::SurfaceKHR,
    surface_loader: ash::khr::surface::Instance,
    swapchain_loader: ash::khr::swapchain::Device,
    device: Arc<ash::Device>,
    physical_device: vk::PhysicalDevice,
    present_queue: vk::Queue,
}

impl SurfaceContext {
    /// Borrow the context's surface for presentation.
    ///
    /// The context keeps ownership of the surface and must outlive this value.
    pub fn new(gpu: &GpuContext) -> Result<Self> {
        let (surface_loader, surface) = gpu
            .surface()
            .ok_or_else(|| GpuError::SurfaceCreation("context was created headless".into()))?;

        Ok(Self {
            surface,
            surface_loader: surface_loader.clone(),
            swapchain_loader: ash::khr::swapchain::Device::new(gpu.instance(), gpu.device()),
            device: gpu.device_arc(),
            physical_device: gpu.physical_device(),
            present_queue: gpu.present_queue(),
        })
    }

    /// Raw surface handle.
    pub fn surface(&self) -> vk::SurfaceKHR {
        self.surface
    }
}

impl SwapchainBackend for SurfaceContext {
    type Chain = Swapchain;

    fn surface_info(&mut self) -> VkResult<SurfaceInfo> {
        let loader = &self.surface_loader;
        // SAFETY: surface and physical device belong to the same instance.
        unsafe {
            Ok(SurfaceInfo {
                capabilities: loader
                    .get_physical_device_surface_capabilities(self.physical_device, self.surface)?,
                formats: loader
                    .get_physical_device_surface_formats(self.physical_device, self.surface)?,
                present_modes: loader
                    .get_physical_device_surface_present_modes(self.physical_device, self.surface)?,
            })
        }
    }

    fn create_chain(
        &mut self,
        config: &SwapchainConfig,
        old: Option<&Swapchain>,
    ) -> VkResult<Swapchain> {
        // SAFETY: all handles come from the same live context.
        unsafe {
            Swapchain::new(
                &self.device,
                &self.swapchain_loader,
                self.surface,
                config,
                old.map(|chain| chain.swapchain),
            )
        }
    }

    fn destroy_chain(&mut self, chain: Swapchain) {
        // SAFETY: the chain's images may still be referenced by in-flight
        // frames until the device is idle.
        unsafe {
            if let Err(e) = self.device.device_wait_idle() {
                tracing::error!("vkDeviceWaitIdle failed before swapchain teardown: {e}");
            }
            chain.destroy(&self.device, &self.swapchain_loader);
        }
    }

    fn acquire(
        &mut self,
        chain: &Swapchain,
        semaphore: vk::Semaphore,
        timeout_ns: u64,
    ) -> VkResult<(u32, bool)> {
        // SAFETY: chain and semaphore are live; the semaphore is unsignaled.
        unsafe {
            self.swapchain_loader.acquire_next_image(
                chain.swapchain,
                timeout_ns,
                semaphore,
                vk::Fence::null(),
            )
        }
    }

    fn present(
        &mut self,
        chain: &Swapchain,
        image_index: u32,
        wait: &[vk::Semaphore],
    ) -> VkResult<bool> {
        let swapchains = [chain.swapchain];
        let indices = [image_index];
        let present_info = vk::PresentInfoKHR::default()
            .wait_semaphores(wait)
            .swapchains(&swapchains)
            .image_indices(&indices);
        // SAFETY: the image was acquired from this chain.
        unsafe {
            self.swapchain_loader
                .queue_present(self.present_queue, &present_info)
        }
    }
}
