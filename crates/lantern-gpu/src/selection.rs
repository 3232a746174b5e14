//! Physical device selection.
//!
//! Filtering and ranking operate on [`PhysicalDeviceInfo`] snapshots only.
//! The same device list always produces the same ranking: devices are
//! stable-sorted by type preference and tie-broken by pipeline-cache UUID, so
//! the driver's enumeration order never decides which GPU index 0 maps to.

use crate::capabilities::{DeviceFeatures, PhysicalDeviceInfo};
use crate::error::{GpuError, Result};
use ash::vk;
use std::collections::BTreeSet;
use std::ffi::CStr;

fn ext_name(name: &CStr) -> String {
    name.to_string_lossy().into_owned()
}

/// Extensions enabled whenever the selected device advertises them.
pub fn optional_device_extensions() -> Vec<&'static CStr> {
    vec![
        ash::khr::dedicated_allocation::NAME,
        ash::khr::get_memory_requirements2::NAME,
        ash::khr::buffer_device_address::NAME,
        ash::khr::acceleration_structure::NAME,
        ash::khr::deferred_host_operations::NAME,
        ash::khr::ray_query::NAME,
        ash::ext::descriptor_indexing::NAME,
        ash::ext::hdr_metadata::NAME,
        #[cfg(target_os = "windows")]
        ash::ext::full_screen_exclusive::NAME,
        #[cfg(target_os = "macos")]
        ash::khr::portability_subset::NAME,
    ]
}

/// What a device must (and may) provide to be selected.
#[derive(Debug, Clone)]
pub struct DeviceRequirements {
    /// Exact boolean AND over these feature bits.
    pub features: DeviceFeatures,
    pub required_extensions: BTreeSet<String>,
    pub optional_extensions: BTreeSet<String>,
    /// Whether a present-capable queue family is mandatory.
    pub require_present: bool,
}

impl Default for DeviceRequirements {
    fn default() -> Self {
        Self {
            features: DeviceFeatures::REQUIRED,
            required_extensions: BTreeSet::new(),
            optional_extensions: optional_device_extensions()
                .into_iter()
                .map(ext_name)
                .collect(),
            require_present: false,
        }
    }
}

impl DeviceRequirements {
    /// Require presentation: the swapchain extension and a present queue.
    pub fn with_presentation(mut self) -> Self {
        self.required_extensions
            .insert(ext_name(ash::khr::swapchain::NAME));
        self.require_present = true;
        self
    }

    /// Presentation requirements for ranking before a surface exists.
    ///
    /// The swapchain extension stays mandatory. Queue-family present support
    /// needs a surface to query, so it is not checked.
    pub fn with_presentation_unchecked(self) -> Self {
        let mut requirements = self.with_presentation();
        requirements.require_present = false;
        requirements
    }

    /// Add a required extension.
    pub fn require_extension(mut self, name: impl Into<String>) -> Self {
        self.required_extensions.insert(name.into());
        self
    }

    /// Add an optional extension.
    pub fn optional_extension(mut self, name: impl Into<String>) -> Self {
        self.optional_extensions.insert(name.into());
        self
    }

    /// Replace the required feature set.
    pub fn require_features(mut self, features: DeviceFeatures) -> Self {
        self.features = features;
        self
    }
}

/// A device that passed filtering, with its queues and extensions resolved.
#[derive(Debug, Clone)]
pub struct SelectedDevice {
    pub info: PhysicalDeviceInfo,
    pub graphics_family: u32,
    /// Equal to `graphics_family` when presentation was not requested.
    pub present_family: u32,
    /// A transfer-only family, when the device has one.
    pub transfer_family: Option<u32>,
    pub enabled_extensions: BTreeSet<String>,
    pub enabled_features: DeviceFeatures,
    pub timestamp_queries: bool,
}

impl SelectedDevice {
    /// Family used for uploads: the dedicated one if present, else graphics.
    pub fn upload_family(&self) -> u32 {
        self.transfer_family.unwrap_or(self.graphics_family)
    }

    /// Lines logged when the device is chosen.
    pub fn startup_report(&self) -> Vec<String> {
        let info = &self.info;
        let extensions: Vec<&str> = self.enabled_extensions.iter().map(String::as_str).collect();
        vec![
            format!("GPU: {} ({:?}, {})", info.name, info.vendor, info.device_type),
            format!(
                "Vulkan API version: {}.{}.{}",
                vk::api_version_major(info.api_version),
                vk::api_version_minor(info.api_version),
                vk::api_version_patch(info.api_version)
            ),
            format!("Driver version: {}", info.driver_version_string()),
            format!("Device extensions: {}", extensions.join(", ")),
            format!("Max 2D image dimension: {}", info.limits.max_image_dimension_2d),
            format!("Max uniform buffer range: {}", info.limits.max_uniform_buffer_range),
            format!(
                "Min uniform buffer offset alignment: {}",
                info.limits.min_uniform_buffer_offset_alignment
            ),
        ]
    }

    /// Distinct queue families that need a queue, in ascending order.
    pub fn unique_queue_families(&self) -> Vec<u32> {
        let families: BTreeSet<u32> = [
            Some(self.graphics_family),
            Some(self.present_family),
            self.transfer_family,
        ]
        .into_iter()
        .flatten()
        .collect();
        families.into_iter().collect()
    }
}

fn resolve(info: &PhysicalDeviceInfo, requirements: &DeviceRequirements) -> Option<SelectedDevice> {
    if !requirements
        .required_extensions
        .iter()
        .all(|ext| info.supports_extension(ext))
    {
        return None;
    }

    if !info.features.contains(requirements.features) {
        return None;
    }

    let usable = |family: &&crate::capabilities::QueueFamilyInfo| family.queue_count > 0;

    let present_family = info
        .queue_families
        .iter()
        .enumerate()
        .filter(|(_, family)| usable(family))
        .find(|(_, family)| family.present_supported)
        .map(|(index, _)| index as u32);

    let (graphics_family, graphics) = info
        .queue_families
        .iter()
        .enumerate()
        .filter(|(_, family)| usable(family))
        .find(|(_, family)| family.flags.contains(vk::QueueFlags::GRAPHICS))
        .map(|(index, family)| (index as u32, family))?;

    let present_family = match present_family {
        Some(family) => family,
        None if requirements.require_present => return None,
        None => graphics_family,
    };

    let transfer_family = info
        .queue_families
        .iter()
        .enumerate()
        .filter(|(_, family)| usable(family))
        .find(|(_, family)| {
            family.flags.contains(vk::QueueFlags::TRANSFER)
                && !family
                    .flags
                    .intersects(vk::QueueFlags::GRAPHICS | vk::QueueFlags::COMPUTE)
        })
        .map(|(index, _)| index as u32);

    let mut enabled_extensions = requirements.required_extensions.clone();
    enabled_extensions.extend(
        requirements
            .optional_extensions
            .iter()
            .filter(|ext| info.supports_extension(ext))
            .cloned(),
    );

    let enabled_features =
        requirements.features | (info.features & DeviceFeatures::OPTIONAL);

    Some(SelectedDevice {
        info: info.clone(),
        graphics_family,
        present_family,
        transfer_family,
        enabled_extensions,
        enabled_features,
        timestamp_queries: graphics.timestamp_valid_bits != 0,
    })
}

/// Filter and rank devices, best first.
pub fn find_compatible_devices(
    devices: &[PhysicalDeviceInfo],
    requirements: &DeviceRequirements,
) -> Vec<SelectedDevice> {
    let mut compatible: Vec<SelectedDevice> = devices
        .iter()
        .filter_map(|info| resolve(info, requirements))
        .collect();

    // `sort_by` is stable, so full ties keep enumeration order.
    compatible.sort_by(|a, b| {
        a.info
            .device_type
            .rank()
            .cmp(&b.info.device_type.rank())
            .then_with(|| a.info.pipeline_cache_uuid.cmp(&b.info.pipeline_cache_uuid))
    });
    compatible
}

/// Pick one device.
///
/// `preferred_index` indexes the ranked list; out-of-range values fall back
/// to the best device.
pub fn select_device(
    devices: &[PhysicalDeviceInfo],
    requirements: &DeviceRequirements,
    preferred_index: usize,
) -> Result<SelectedDevice> {
    if devices.is_empty() {
        return Err(GpuError::NoDevices);
    }

    let mut compatible = find_compatible_devices(devices, requirements);
    if compatible.is_empty() {
        return Err(GpuError::NoCompatibleDevice);
    }

    let index = if preferred_index < compatible.len() {
        preferred_index
    } else {
        0
    };
    Ok(compatible.swap_remove(index))
}
