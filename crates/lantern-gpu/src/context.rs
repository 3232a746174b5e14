//! GPU context management.

use crate::capabilities::{DeviceFeatures, DeviceType, PhysicalDeviceInfo};
use crate::config::GpuConfig;
use crate::debug::ObjectNamer;
use crate::error::{GpuError, Result, VkResultExt};
use crate::instance::VulkanInstance;
use crate::memory::{GpuAllocator, MemoryStats};
use crate::platform::Platform;
use crate::selection::{find_compatible_devices, select_device, DeviceRequirements, SelectedDevice};
use ash::vk;
use parking_lot::Mutex;
use std::ffi::{c_char, CString};
use std::sync::Arc;

type OwnedSurface = (ash::khr::surface::Instance, vk::SurfaceKHR);

/// Device, queues, allocator and the optional presentation surface.
///
/// Exactly one exists per renderer. Objects holding a clone of
/// [`GpuContext::device_arc`] must be dropped before the context.
pub struct GpuContext {
    allocator: Mutex<GpuAllocator>,
    device: Arc<ash::Device>,
    selected: SelectedDevice,
    graphics_queue: vk::Queue,
    present_queue: vk::Queue,
    transfer_queue: vk::Queue,
    surface: Option<OwnedSurface>,
    namer: Option<ObjectNamer>,
    // Dropped last, after `Drop::drop` has torn down its children.
    instance: VulkanInstance,
}

impl GpuContext {
    /// Get the Vulkan device handle.
    pub fn device(&self) -> &ash::Device {
        &self.device
    }

    /// Shared device handle for long-lived helpers such as the transfer queue.
    pub fn device_arc(&self) -> Arc<ash::Device> {
        Arc::clone(&self.device)
    }

    /// Get the Vulkan instance handle.
    pub fn instance(&self) -> &ash::Instance {
        self.instance.raw()
    }

    pub fn physical_device(&self) -> vk::PhysicalDevice {
        self.selected.info.handle
    }

    /// The selected device with its resolved queues and extensions.
    pub fn selected(&self) -> &SelectedDevice {
        &self.selected
    }

    pub fn graphics_queue(&self) -> vk::Queue {
        self.graphics_queue
    }

    pub fn graphics_queue_family(&self) -> u32 {
        self.selected.graphics_family
    }

    pub fn present_queue(&self) -> vk::Queue {
        self.present_queue
    }

    /// Queue used for uploads: the dedicated transfer queue when the device
    /// has one, otherwise the graphics queue.
    pub fn transfer_queue(&self) -> vk::Queue {
        self.transfer_queue
    }

    pub fn transfer_queue_family(&self) -> u32 {
        self.selected.upload_family()
    }

    /// Presentation surface, absent for headless contexts.
    pub fn surface(&self) -> Option<(&ash::khr::surface::Instance, vk::SurfaceKHR)> {
        self.surface.as_ref().map(|(loader, surface)| (loader, *surface))
    }

    /// Get access to the GPU allocator.
    pub fn allocator(&self) -> &Mutex<GpuAllocator> {
        &self.allocator
    }

    /// Whether the validation layer is active.
    pub fn validation_enabled(&self) -> bool {
        self.instance.validation_enabled()
    }

    /// Object namer, present while validation is active.
    pub fn namer(&self) -> Option<&ObjectNamer> {
        self.namer.as_ref()
    }

    /// Give `handle` a debug name when validation is active.
    pub fn set_object_name<H: vk::Handle>(&self, handle: H, name: &str) {
        if let Some(namer) = &self.namer {
            namer.name(handle, name);
        }
    }

    /// Allocator usage right now.
    pub fn memory_stats(&self) -> Result<MemoryStats> {
        self.allocator.lock().stats()
    }

    /// Wait for device to be idle.
    #[cfg_attr(
        feature = "profiling-tracy",
        tracing::instrument(level = "trace", skip_all)
    )]
    pub fn wait_idle(&self) -> Result<()> {
        // SAFETY: the device is valid for the context's lifetime.
        unsafe { self.device.device_wait_idle() }.op("vkDeviceWaitIdle")
    }
}

impl Drop for GpuContext {
    fn drop(&mut self) {
        // SAFETY: every child object is owned by something that has already
        // been dropped; the instance field is dropped after this.
        unsafe {
            let _ = self.device.device_wait_idle();

            // Frees all VkDeviceMemory before the device goes away.
            self.allocator.lock().shutdown();

            self.device.destroy_device(None);

            if let Some((loader, surface)) = self.surface.take() {
                loader.destroy_surface(surface, None);
            }
        }
    }
}

/// Tears down a half-built context when initialization fails.
struct InitGuard {
    surface: Option<OwnedSurface>,
    device: Option<ash::Device>,
}

impl InitGuard {
    fn disarm(mut self) -> (Option<OwnedSurface>, Option<ash::Device>) {
        (self.surface.take(), self.device.take())
    }
}

impl Drop for InitGuard {
    fn drop(&mut self) {
        // SAFETY: nothing has been created from these handles yet.
        unsafe {
            if let Some(device) = self.device.take() {
                device.destroy_device(None);
            }
            if let Some((loader, surface)) = self.surface.take() {
                loader.destroy_surface(surface, None);
            }
        }
    }
}

/// One entry of [`list_devices`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceListing {
    /// Index accepted by `--device` / [`GpuConfig::preferred_device`].
    pub index: usize,
    pub name: String,
    pub device_type: DeviceType,
    pub summary: String,
}

/// Rank the compatible devices the way windowed context creation would.
///
/// No surface is created, so present support is not checked.
pub fn list_devices() -> Result<Vec<DeviceListing>> {
    let instance = VulkanInstance::new("Lantern device query", false, &[])?;
    // SAFETY: no surface is passed.
    let infos = unsafe { instance.enumerate_devices(None) }?;
    Ok(rank_listings(&infos))
}

fn rank_listings(infos: &[PhysicalDeviceInfo]) -> Vec<DeviceListing> {
    let requirements = DeviceRequirements::default().with_presentation_unchecked();
    find_compatible_devices(infos, &requirements)
        .into_iter()
        .enumerate()
        .map(|(index, device)| DeviceListing {
            index,
            name: device.info.name.clone(),
            device_type: device.info.device_type,
            summary: device.info.summary(),
        })
        .collect()
}

/// Builder for creating a GPU context.
pub struct GpuContextBuilder {
    config: GpuConfig,
    requirements: DeviceRequirements,
}

impl Default for GpuContextBuilder {
    fn default() -> Self {
        Self {
            config: GpuConfig::default(),
            requirements: DeviceRequirements::default(),
        }
    }
}

impl GpuContextBuilder {
    /// Create a new builder.
    pub fn new() -> Self {
        Self::default()
    }

    /// Take application name, validation and device preference from `config`.
    pub fn config(mut self, config: &GpuConfig) -> Self {
        self.config = config.clone();
        self
    }

    /// Set the application name.
    pub fn app_name(mut self, name: impl Into<String>) -> Self {
        self.config.app_name = name.into();
        self
    }

    /// Enable or disable validation layers.
    pub fn validation(mut self, enable: bool) -> Self {
        self.config.validation = enable;
        self
    }

    /// Replace the device requirements.
    pub fn requirements(mut self, requirements: DeviceRequirements) -> Self {
        self.requirements = requirements;
        self
    }

    /// Build the GPU context.
    ///
    /// With a platform, a surface is created first and presentation becomes a
    /// device requirement. On failure everything created so far is destroyed
    /// in reverse order.
    pub fn build(self, platform: Option<&dyn Platform>) -> Result<GpuContext> {
        let extensions = match platform {
            Some(platform) => platform.required_instance_extensions()?,
            None => Vec::new(),
        };

        let instance =
            VulkanInstance::new(&self.config.app_name, self.config.validation, &extensions)?;

        let mut guard = InitGuard {
            surface: None,
            device: None,
        };

        let mut requirements = self.requirements;
        if let Some(platform) = platform {
            // SAFETY: the instance was created with the platform's extensions.
            let surface = unsafe { platform.create_surface(instance.entry(), instance.raw()) }?;
            let loader = ash::khr::surface::Instance::new(instance.entry(), instance.raw());
            guard.surface = Some((loader, surface));
            requirements = requirements.with_presentation();
        }

        // SAFETY: the surface, if any, belongs to this instance.
        let infos = unsafe {
            instance.enumerate_devices(
                guard
                    .surface
                    .as_ref()
                    .map(|(loader, surface)| (loader, *surface)),
            )
        }?;
        for info in &infos {
            tracing::debug!(index = info.enumeration_index, "Found GPU: {}", info.summary());
        }

        let selected = select_device(&infos, &requirements, self.config.preferred_device)?;
        for line in selected.startup_report() {
            tracing::info!("{line}");
        }
        tracing::debug!(
            graphics = selected.graphics_family,
            present = selected.present_family,
            transfer = ?selected.transfer_family,
            extensions = ?selected.enabled_extensions,
            features = ?selected.enabled_features,
            "Device queues and extensions resolved"
        );

        // SAFETY: the physical device came from this instance.
        let device = unsafe { create_device(instance.raw(), &selected) }?;
        guard.device = Some(device.clone());

        let graphics_queue;
        let present_queue;
        let transfer_queue;
        // SAFETY: one queue was requested for each of these families.
        unsafe {
            graphics_queue = device.get_device_queue(selected.graphics_family, 0);
            present_queue = device.get_device_queue(selected.present_family, 0);
            transfer_queue = device.get_device_queue(selected.upload_family(), 0);
        }

        let namer = instance
            .validation_enabled()
            .then(|| ObjectNamer::new(instance.raw(), &device));

        let device = Arc::new(device);
        // SAFETY: instance, device and physical device are valid and related.
        let allocator = unsafe {
            GpuAllocator::new(
                instance.raw(),
                Arc::clone(&device),
                selected.info.handle,
                selected
                    .enabled_features
                    .contains(DeviceFeatures::BUFFER_DEVICE_ADDRESS),
                namer.clone(),
            )
        }?;

        let (surface, _) = guard.disarm();

        Ok(GpuContext {
            allocator: Mutex::new(allocator),
            device,
            selected,
            graphics_queue,
            present_queue,
            transfer_queue,
            surface,
            namer,
            instance,
        })
    }
}

/// Create the logical device with one queue per distinct family.
///
/// # Safety
/// The instance and the selected physical device must be valid.
unsafe fn create_device(instance: &ash::Instance, selected: &SelectedDevice) -> Result<ash::Device> {
    let queue_priority = [1.0_f32];
    let queue_create_infos: Vec<vk::DeviceQueueCreateInfo> = selected
        .unique_queue_families()
        .into_iter()
        .map(|family| {
            vk::DeviceQueueCreateInfo::default()
                .queue_family_index(family)
                .queue_priorities(&queue_priority)
        })
        .collect();

    let extensions: Vec<CString> = selected
        .enabled_extensions
        .iter()
        .filter_map(|name| CString::new(name.as_str()).ok())
        .collect();
    let extension_names: Vec<*const c_char> = extensions.iter().map(|ext| ext.as_ptr()).collect();

    let features = selected.enabled_features;
    let mut vulkan12 = features.to_vulkan12();
    let mut features2 = vk::PhysicalDeviceFeatures2::default().features(features.to_core());

    let mut device_create_info = vk::DeviceCreateInfo::default()
        .queue_create_infos(&queue_create_infos)
        .enabled_extension_names(&extension_names);

    // The 1.2 struct is only chained when one of its bits is on, so pre-1.2
    // devices never see it.
    if features.needs_vulkan12() {
        features2 = features2.push_next(&mut vulkan12);
    }
    device_create_info = device_create_info.push_next(&mut features2);

    instance
        .create_device(selected.info.handle, &device_create_info, None)
        .op("vkCreateDevice")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capabilities::{DeviceLimits, GpuVendor, QueueFamilyInfo};
    use std::collections::HashSet;

    fn device(name: &str, device_type: DeviceType, uuid: u8, swapchain: bool) -> PhysicalDeviceInfo {
        let mut extensions = HashSet::new();
        if swapchain {
            extensions.insert(ash::khr::swapchain::NAME.to_string_lossy().into_owned());
        }
        PhysicalDeviceInfo {
            handle: vk::PhysicalDevice::null(),
            enumeration_index: 0,
            name: name.to_string(),
            vendor: GpuVendor::Other(0),
            device_type,
            api_version: vk::API_VERSION_1_2,
            driver_version: 1,
            pipeline_cache_uuid: [uuid; vk::UUID_SIZE],
            limits: DeviceLimits::default(),
            features: DeviceFeatures::REQUIRED,
            // Enumerated without a surface, as the listing is.
            queue_families: vec![QueueFamilyInfo {
                flags: vk::QueueFlags::GRAPHICS | vk::QueueFlags::TRANSFER,
                queue_count: 1,
                timestamp_valid_bits: 64,
                present_supported: false,
            }],
            memory_types: vec![vk::MemoryPropertyFlags::DEVICE_LOCAL],
            device_local_memory_mb: 2048,
            extensions,
        }
    }

    #[test]
    fn listing_indices_match_windowed_selection() {
        let infos = [
            device("dgpu-headless", DeviceType::Discrete, 1, false),
            device("igpu", DeviceType::Integrated, 2, true),
            device("vgpu", DeviceType::Virtual, 3, true),
        ];
        let listed: Vec<String> = rank_listings(&infos).into_iter().map(|d| d.name).collect();
        assert_eq!(listed, ["igpu", "vgpu"]);

        // Once a surface exists every family of the listed devices presents.
        let with_surface: Vec<PhysicalDeviceInfo> = infos
            .iter()
            .cloned()
            .map(|mut info| {
                for family in &mut info.queue_families {
                    family.present_supported = true;
                }
                info
            })
            .collect();
        let requirements = DeviceRequirements::default().with_presentation();
        for (index, name) in listed.iter().enumerate() {
            let selected = select_device(&with_surface, &requirements, index).unwrap();
            assert_eq!(&selected.info.name, name);
        }
    }
}
