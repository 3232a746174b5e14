//! Platform callback contract.
//!
//! The window system is opaque to this crate. A host supplies the instance
//! extensions its surfaces need, creates the surface on request, and reports
//! the drawable size in pixels.

use crate::error::Result;
use ash::vk;
use std::ffi::CStr;

/// Host platform hooks.
pub trait Platform {
    /// Instance extensions required to create surfaces for this platform.
    fn required_instance_extensions(&self) -> Result<Vec<&'static CStr>>;

    /// Create a presentation surface.
    ///
    /// # Safety
    /// The instance must be valid and created with the extensions returned by
    /// [`Platform::required_instance_extensions`].
    unsafe fn create_surface(
        &self,
        entry: &ash::Entry,
        instance: &ash::Instance,
    ) -> Result<vk::SurfaceKHR>;

    /// Current drawable size in pixels.
    fn drawable_size(&self) -> (u32, u32);
}
