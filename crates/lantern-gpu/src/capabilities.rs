//! Physical device snapshots.
//!
//! [`PhysicalDeviceInfo`] is captured once per device at startup and never
//! changes afterwards. Selection works purely on these snapshots, so it can be
//! exercised without a GPU.

use ash::vk;
use bitflags::bitflags;
use std::collections::HashSet;
use std::ffi::CStr;
use std::fmt;

/// GPU vendor identification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum GpuVendor {
    Nvidia,
    Amd,
    Intel,
    Apple,
    Other(u32),
}

impl GpuVendor {
    /// Identify vendor from PCI vendor ID.
    pub fn from_vendor_id(id: u32) -> Self {
        match id {
            0x10DE => Self::Nvidia,
            0x1002 => Self::Amd,
            0x8086 => Self::Intel,
            0x106B => Self::Apple,
            other => Self::Other(other),
        }
    }
}

/// Physical device type, ordered by selection preference.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DeviceType {
    Discrete,
    Integrated,
    Virtual,
    Cpu,
    Other,
}

impl DeviceType {
    /// Preference rank; lower is better.
    pub fn rank(self) -> u8 {
        match self {
            Self::Discrete => 0,
            Self::Integrated => 1,
            Self::Virtual => 2,
            Self::Cpu => 3,
            Self::Other => 4,
        }
    }
}

impl From<vk::PhysicalDeviceType> for DeviceType {
    fn from(ty: vk::PhysicalDeviceType) -> Self {
        match ty {
            vk::PhysicalDeviceType::DISCRETE_GPU => Self::Discrete,
            vk::PhysicalDeviceType::INTEGRATED_GPU => Self::Integrated,
            vk::PhysicalDeviceType::VIRTUAL_GPU => Self::Virtual,
            vk::PhysicalDeviceType::CPU => Self::Cpu,
            _ => Self::Other,
        }
    }
}

impl fmt::Display for DeviceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Discrete => "discrete",
            Self::Integrated => "integrated",
            Self::Virtual => "virtual",
            Self::Cpu => "cpu",
            Self::Other => "other",
        };
        f.write_str(name)
    }
}

bitflags! {
    /// Device features the renderer cares about.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct DeviceFeatures: u32 {
        const SAMPLER_ANISOTROPY = 1 << 0;
        const FRAGMENT_STORES_AND_ATOMICS = 1 << 1;
        const DEPTH_CLAMP = 1 << 2;
        const SHADER_CLIP_DISTANCE = 1 << 3;
        const BUFFER_DEVICE_ADDRESS = 1 << 4;
        const RUNTIME_DESCRIPTOR_ARRAY = 1 << 5;
        const DESCRIPTOR_BINDING_PARTIALLY_BOUND = 1 << 6;
        const DESCRIPTOR_BINDING_VARIABLE_COUNT = 1 << 7;
    }
}

impl DeviceFeatures {
    /// Features every selected device must have.
    pub const REQUIRED: Self = Self::SAMPLER_ANISOTROPY.union(Self::FRAGMENT_STORES_AND_ATOMICS);

    /// Features enabled whenever the device has them.
    pub const OPTIONAL: Self = Self::DEPTH_CLAMP
        .union(Self::SHADER_CLIP_DISTANCE)
        .union(Self::BUFFER_DEVICE_ADDRESS)
        .union(Self::RUNTIME_DESCRIPTOR_ARRAY)
        .union(Self::DESCRIPTOR_BINDING_PARTIALLY_BOUND)
        .union(Self::DESCRIPTOR_BINDING_VARIABLE_COUNT);

    fn from_core(features: &vk::PhysicalDeviceFeatures) -> Self {
        let mut out = Self::empty();
        out.set(Self::SAMPLER_ANISOTROPY, features.sampler_anisotropy == vk::TRUE);
        out.set(
            Self::FRAGMENT_STORES_AND_ATOMICS,
            features.fragment_stores_and_atomics == vk::TRUE,
        );
        out.set(Self::DEPTH_CLAMP, features.depth_clamp == vk::TRUE);
        out.set(
            Self::SHADER_CLIP_DISTANCE,
            features.shader_clip_distance == vk::TRUE,
        );
        out
    }

    fn from_vulkan12(features: &vk::PhysicalDeviceVulkan12Features<'_>) -> Self {
        let mut out = Self::empty();
        out.set(
            Self::BUFFER_DEVICE_ADDRESS,
            features.buffer_device_address == vk::TRUE,
        );
        out.set(
            Self::RUNTIME_DESCRIPTOR_ARRAY,
            features.runtime_descriptor_array == vk::TRUE,
        );
        out.set(
            Self::DESCRIPTOR_BINDING_PARTIALLY_BOUND,
            features.descriptor_binding_partially_bound == vk::TRUE,
        );
        out.set(
            Self::DESCRIPTOR_BINDING_VARIABLE_COUNT,
            features.descriptor_binding_variable_descriptor_count == vk::TRUE,
        );
        out
    }

    /// Core feature struct with the bits of `self` turned on.
    pub fn to_core(self) -> vk::PhysicalDeviceFeatures {
        vk::PhysicalDeviceFeatures::default()
            .sampler_anisotropy(self.contains(Self::SAMPLER_ANISOTROPY))
            .fragment_stores_and_atomics(self.contains(Self::FRAGMENT_STORES_AND_ATOMICS))
            .depth_clamp(self.contains(Self::DEPTH_CLAMP))
            .shader_clip_distance(self.contains(Self::SHADER_CLIP_DISTANCE))
    }

    /// Vulkan 1.2 feature struct with the bits of `self` turned on.
    pub fn to_vulkan12(self) -> vk::PhysicalDeviceVulkan12Features<'static> {
        vk::PhysicalDeviceVulkan12Features::default()
            .buffer_device_address(self.contains(Self::BUFFER_DEVICE_ADDRESS))
            .runtime_descriptor_array(self.contains(Self::RUNTIME_DESCRIPTOR_ARRAY))
            .descriptor_binding_partially_bound(
                self.contains(Self::DESCRIPTOR_BINDING_PARTIALLY_BOUND),
            )
            .descriptor_binding_variable_descriptor_count(
                self.contains(Self::DESCRIPTOR_BINDING_VARIABLE_COUNT),
            )
    }

    /// Whether any Vulkan 1.2 feature bit is set.
    pub fn needs_vulkan12(self) -> bool {
        self.intersects(
            Self::BUFFER_DEVICE_ADDRESS
                | Self::RUNTIME_DESCRIPTOR_ARRAY
                | Self::DESCRIPTOR_BINDING_PARTIALLY_BOUND
                | Self::DESCRIPTOR_BINDING_VARIABLE_COUNT,
        )
    }
}

/// One queue family of a physical device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueFamilyInfo {
    pub flags: vk::QueueFlags,
    pub queue_count: u32,
    pub timestamp_valid_bits: u32,
    /// Whether this family can present to the surface used during enumeration.
    pub present_supported: bool,
}

/// Limits reported at startup.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DeviceLimits {
    pub max_image_dimension_2d: u32,
    pub max_uniform_buffer_range: u32,
    pub min_uniform_buffer_offset_alignment: u64,
}

impl From<&vk::PhysicalDeviceLimits> for DeviceLimits {
    fn from(limits: &vk::PhysicalDeviceLimits) -> Self {
        Self {
            max_image_dimension_2d: limits.max_image_dimension2_d,
            max_uniform_buffer_range: limits.max_uniform_buffer_range,
            min_uniform_buffer_offset_alignment: limits.min_uniform_buffer_offset_alignment,
        }
    }
}

/// Immutable snapshot of one physical device.
#[derive(Debug, Clone)]
pub struct PhysicalDeviceInfo {
    pub handle: vk::PhysicalDevice,
    /// Position in the driver's enumeration order.
    pub enumeration_index: usize,
    pub name: String,
    pub vendor: GpuVendor,
    pub device_type: DeviceType,
    pub api_version: u32,
    pub driver_version: u32,
    pub pipeline_cache_uuid: [u8; vk::UUID_SIZE],
    pub limits: DeviceLimits,
    pub features: DeviceFeatures,
    pub queue_families: Vec<QueueFamilyInfo>,
    pub memory_types: Vec<vk::MemoryPropertyFlags>,
    pub device_local_memory_mb: u64,
    pub extensions: HashSet<String>,
}

impl PhysicalDeviceInfo {
    /// Query a snapshot from a physical device.
    ///
    /// When a surface is given, per-family present support is recorded.
    ///
    /// # Safety
    /// The instance, physical device and surface must be valid.
    pub unsafe fn query(
        instance: &ash::Instance,
        physical_device: vk::PhysicalDevice,
        enumeration_index: usize,
        surface: Option<(&ash::khr::surface::Instance, vk::SurfaceKHR)>,
    ) -> Self {
        let properties = instance.get_physical_device_properties(physical_device);
        let memory_properties = instance.get_physical_device_memory_properties(physical_device);

        let extensions: HashSet<String> = instance
            .enumerate_device_extension_properties(physical_device)
            .unwrap_or_default()
            .iter()
            .filter_map(|ext| {
                CStr::from_ptr(ext.extension_name.as_ptr())
                    .to_str()
                    .ok()
                    .map(String::from)
            })
            .collect();

        let name = CStr::from_ptr(properties.device_name.as_ptr())
            .to_string_lossy()
            .into_owned();

        let api_version = properties.api_version;
        let has_vulkan_1_2 = vk::api_version_major(api_version) > 1
            || vk::api_version_minor(api_version) >= 2;

        let mut features =
            DeviceFeatures::from_core(&instance.get_physical_device_features(physical_device));
        // The 1.2 feature struct may only be chained on devices that know it.
        if has_vulkan_1_2 {
            let mut vulkan12 = vk::PhysicalDeviceVulkan12Features::default();
            {
                let mut features2 =
                    vk::PhysicalDeviceFeatures2::default().push_next(&mut vulkan12);
                instance.get_physical_device_features2(physical_device, &mut features2);
            }
            features |= DeviceFeatures::from_vulkan12(&vulkan12);
        }

        let queue_families = instance
            .get_physical_device_queue_family_properties(physical_device)
            .iter()
            .enumerate()
            .map(|(index, family)| {
                let present_supported = surface.is_some_and(|(loader, surface)| {
                    loader
                        .get_physical_device_surface_support(physical_device, index as u32, surface)
                        .unwrap_or(false)
                });
                QueueFamilyInfo {
                    flags: family.queue_flags,
                    queue_count: family.queue_count,
                    timestamp_valid_bits: family.timestamp_valid_bits,
                    present_supported,
                }
            })
            .collect();

        let memory_types = memory_properties
            .memory_types
            .iter()
            .take(memory_properties.memory_type_count as usize)
            .map(|ty| ty.property_flags)
            .collect();

        let device_local_memory_mb: u64 = memory_properties
            .memory_heaps
            .iter()
            .take(memory_properties.memory_heap_count as usize)
            .filter(|heap| heap.flags.contains(vk::MemoryHeapFlags::DEVICE_LOCAL))
            .map(|heap| heap.size / (1024 * 1024))
            .sum();

        Self {
            handle: physical_device,
            enumeration_index,
            name,
            vendor: GpuVendor::from_vendor_id(properties.vendor_id),
            device_type: properties.device_type.into(),
            api_version,
            driver_version: properties.driver_version,
            pipeline_cache_uuid: properties.pipeline_cache_uuid,
            limits: DeviceLimits::from(&properties.limits),
            features,
            queue_families,
            memory_types,
            device_local_memory_mb,
            extensions,
        }
    }

    /// Whether the device advertises an extension.
    pub fn supports_extension(&self, name: &str) -> bool {
        self.extensions.contains(name)
    }

    /// Whether some memory type is both device-local and host-visible.
    pub fn has_host_visible_device_memory(&self) -> bool {
        self.memory_types.iter().any(|flags| {
            flags.contains(vk::MemoryPropertyFlags::DEVICE_LOCAL | vk::MemoryPropertyFlags::HOST_VISIBLE)
        })
    }

    /// Driver version in the vendor's own numbering.
    pub fn driver_version_string(&self) -> String {
        let v = self.driver_version;
        match self.vendor {
            GpuVendor::Nvidia => format!(
                "{}.{}.{}.{}",
                v >> 22,
                (v >> 14) & 0xff,
                (v >> 6) & 0xff,
                v & 0x3f
            ),
            _ => format!(
                "{}.{}.{}",
                vk::api_version_major(v),
                vk::api_version_minor(v),
                vk::api_version_patch(v)
            ),
        }
    }

    /// Get a human-readable summary of capabilities.
    pub fn summary(&self) -> String {
        format!(
            "{} ({:?}, {}) - Vulkan {}.{}.{} - {} MB VRAM",
            self.name,
            self.vendor,
            self.device_type,
            vk::api_version_major(self.api_version),
            vk::api_version_minor(self.api_version),
            vk::api_version_patch(self.api_version),
            self.device_local_memory_mb,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn vendor_identification() {
        assert_eq!(GpuVendor::from_vendor_id(0x10DE), GpuVendor::Nvidia);
        assert_eq!(GpuVendor::from_vendor_id(0x1002), GpuVendor::Amd);
        assert_eq!(GpuVendor::from_vendor_id(0x8086), GpuVendor::Intel);
    }

    #[test]
    fn device_type_preference_order() {
        let mut types = [
            DeviceType::Other,
            DeviceType::Cpu,
            DeviceType::Integrated,
            DeviceType::Virtual,
            DeviceType::Discrete,
        ];
        types.sort_by_key(|ty| ty.rank());
        assert_eq!(
            types,
            [
                DeviceType::Discrete,
                DeviceType::Integrated,
                DeviceType::Virtual,
                DeviceType::Cpu,
                DeviceType::Other,
            ]
        );
    }

    #[test]
    fn feature_round_trip_through_core_struct() {
        let features = DeviceFeatures::REQUIRED | DeviceFeatures::DEPTH_CLAMP;
        let core = features.to_core();
        assert_eq!(DeviceFeatures::from_core(&core), features);
        assert!(!features.needs_vulkan12());
    }

    #[test]
    fn driver_version_follows_vendor_scheme() {
        let mut info = PhysicalDeviceInfo {
            handle: vk::PhysicalDevice::null(),
            enumeration_index: 0,
            name: "gpu".into(),
            vendor: GpuVendor::Nvidia,
            device_type: DeviceType::Discrete,
            api_version: vk::API_VERSION_1_3,
            driver_version: (535 << 22) | (104 << 14) | (5 << 6),
            pipeline_cache_uuid: [0; vk::UUID_SIZE],
            limits: DeviceLimits::default(),
            features: DeviceFeatures::REQUIRED,
            queue_families: Vec::new(),
            memory_types: Vec::new(),
            device_local_memory_mb: 0,
            extensions: HashSet::new(),
        };
        assert_eq!(info.driver_version_string(), "535.104.5.0");

        info.vendor = GpuVendor::Amd;
        info.driver_version = vk::make_api_version(0, 2, 0, 279);
        assert_eq!(info.driver_version_string(), "2.0.279");
    }
}
