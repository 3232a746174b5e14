//! Vulkan instance creation.

use crate::capabilities::PhysicalDeviceInfo;
use crate::debug::{messenger_create_info, DebugSink};
use crate::error::{GpuError, Result, VkResultExt};
use ash::vk;
use std::collections::HashSet;
use std::ffi::{c_char, CStr, CString};

/// Instance extensions enabled when the loader offers them.
fn optional_instance_extensions() -> Vec<&'static CStr> {
    vec![
        ash::khr::get_physical_device_properties2::NAME,
        ash::khr::get_surface_capabilities2::NAME,
        // HDR color spaces
        ash::ext::swapchain_colorspace::NAME,
        #[cfg(target_os = "macos")]
        ash::khr::portability_enumeration::NAME,
    ]
}

/// Validation layers to enable when requested.
pub fn validation_layers() -> Vec<&'static CStr> {
    vec![c"VK_LAYER_KHRONOS_validation"]
}

struct DebugMessenger {
    loader: ash::ext::debug_utils::Instance,
    messenger: vk::DebugUtilsMessengerEXT,
    // Boxed so the address registered with the driver stays put.
    _sink: Box<DebugSink>,
}

/// Loaded Vulkan entry, instance and optional debug messenger.
///
/// Dropping it destroys the messenger and the instance.
pub struct VulkanInstance {
    entry: ash::Entry,
    instance: ash::Instance,
    debug: Option<DebugMessenger>,
    validation: bool,
}

impl VulkanInstance {
    /// Load Vulkan and create an instance.
    ///
    /// `required_extensions` usually comes from the platform. Validation is
    /// best-effort: a missing layer or `VK_EXT_debug_utils` is logged and
    /// skipped.
    pub fn new(
        app_name: &str,
        enable_validation: bool,
        required_extensions: &[&'static CStr],
    ) -> Result<Self> {
        // SAFETY: loading the system Vulkan loader.
        let entry =
            unsafe { ash::Entry::load() }.map_err(|e| GpuError::Loader(e.to_string()))?;

        let app_name = CString::new(app_name).unwrap_or_else(|_| c"Lantern".to_owned());

        let app_info = vk::ApplicationInfo::default()
            .application_name(&app_name)
            .application_version(vk::make_api_version(0, 0, 1, 0))
            .engine_name(c"Lantern")
            .engine_version(vk::make_api_version(0, 0, 1, 0))
            .api_version(vk::API_VERSION_1_2);

        // SAFETY: entry is loaded.
        let available: HashSet<String> =
            unsafe { entry.enumerate_instance_extension_properties(None) }
                .op("vkEnumerateInstanceExtensionProperties")?
                .iter()
                .filter_map(|ext| ext.extension_name_as_c_str().ok())
                .map(|name| name.to_string_lossy().into_owned())
                .collect();
        let is_available = |name: &CStr| available.contains(name.to_string_lossy().as_ref());

        let mut extensions: Vec<&CStr> = required_extensions.to_vec();
        extensions.extend(
            optional_instance_extensions()
                .into_iter()
                .filter(|name| is_available(name)),
        );

        let mut layers = Vec::new();
        let mut validation = false;
        if enable_validation {
            // SAFETY: entry is loaded.
            let available_layers = unsafe { entry.enumerate_instance_layer_properties() }
                .op("vkEnumerateInstanceLayerProperties")?;
            for layer in validation_layers() {
                let found = available_layers
                    .iter()
                    .any(|props| props.layer_name_as_c_str() == Ok(layer));
                if found {
                    layers.push(layer);
                } else {
                    tracing::warn!("Validation layer {} not available", layer.to_string_lossy());
                }
            }

            if is_available(ash::ext::debug_utils::NAME) {
                extensions.push(ash::ext::debug_utils::NAME);
                validation = !layers.is_empty();
            } else {
                tracing::warn!("VK_EXT_debug_utils not available; validation messages disabled");
            }
        }

        extensions.sort();
        extensions.dedup();

        let extension_names: Vec<*const c_char> = extensions.iter().map(|ext| ext.as_ptr()).collect();
        let layer_names: Vec<*const c_char> = layers.iter().map(|l| l.as_ptr()).collect();

        let create_flags = if extensions.contains(&ash::khr::portability_enumeration::NAME) {
            vk::InstanceCreateFlags::ENUMERATE_PORTABILITY_KHR
        } else {
            vk::InstanceCreateFlags::empty()
        };

        let create_info = vk::InstanceCreateInfo::default()
            .application_info(&app_info)
            .enabled_extension_names(&extension_names)
            .enabled_layer_names(&layer_names)
            .flags(create_flags);

        // SAFETY: all pointers in create_info outlive the call.
        let instance =
            unsafe { entry.create_instance(&create_info, None) }.op("vkCreateInstance")?;

        let mut this = Self {
            entry,
            instance,
            debug: None,
            validation,
        };

        if validation {
            let sink = Box::new(DebugSink::default());
            let loader = ash::ext::debug_utils::Instance::new(&this.entry, &this.instance);
            // SAFETY: the sink is boxed and owned by the messenger wrapper.
            match unsafe {
                loader.create_debug_utils_messenger(&messenger_create_info(&sink), None)
            } {
                Ok(messenger) => {
                    this.debug = Some(DebugMessenger {
                        loader,
                        messenger,
                        _sink: sink,
                    });
                }
                Err(e) => tracing::warn!("Failed to create debug messenger: {e}"),
            }
        }

        tracing::debug!(
            extensions = ?extensions,
            validation = this.debug.is_some(),
            "Vulkan instance created"
        );

        Ok(this)
    }

    /// Vulkan entry point.
    pub fn entry(&self) -> &ash::Entry {
        &self.entry
    }

    /// Raw instance.
    pub fn raw(&self) -> &ash::Instance {
        &self.instance
    }

    /// Whether the validation layer is active.
    pub fn validation_enabled(&self) -> bool {
        self.validation
    }

    /// Snapshot every physical device.
    ///
    /// # Safety
    /// The surface, if given, must belong to this instance.
    pub unsafe fn enumerate_devices(
        &self,
        surface: Option<(&ash::khr::surface::Instance, vk::SurfaceKHR)>,
    ) -> Result<Vec<PhysicalDeviceInfo>> {
        let devices = self
            .instance
            .enumerate_physical_devices()
            .op("vkEnumeratePhysicalDevices")?;

        Ok(devices
            .into_iter()
            .enumerate()
            .map(|(index, device)| PhysicalDeviceInfo::query(&self.instance, device, index, surface))
            .collect())
    }
}

impl Drop for VulkanInstance {
    fn drop(&mut self) {
        // SAFETY: children of the instance are destroyed by their owners,
        // which hold the instance alive through GpuContext field order.
        unsafe {
            if let Some(debug) = self.debug.take() {
                debug
                    .loader
                    .destroy_debug_utils_messenger(debug.messenger, None);
            }
            self.instance.destroy_instance(None);
        }
    }
}
