//! Validation layer message sink and object naming.
//!
//! Messages are forwarded to `tracing` by severity. Repeats of a message are
//! dropped, and after [`MAX_REPORTED_MESSAGES`] distinct messages the sink goes
//! quiet for the rest of the process.

use ash::vk;
use parking_lot::Mutex;
use std::collections::HashSet;
use std::ffi::{CStr, CString};

/// Distinct messages reported per process run.
pub const MAX_REPORTED_MESSAGES: usize = 20;

const TARGET: &str = "lantern-validation";

/// Severity of a debug message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageSeverity {
    Error,
    Warning,
    Info,
    Verbose,
}

impl MessageSeverity {
    fn from_flags(flags: vk::DebugUtilsMessageSeverityFlagsEXT) -> Self {
        if flags.contains(vk::DebugUtilsMessageSeverityFlagsEXT::ERROR) {
            Self::Error
        } else if flags.contains(vk::DebugUtilsMessageSeverityFlagsEXT::WARNING) {
            Self::Warning
        } else if flags.contains(vk::DebugUtilsMessageSeverityFlagsEXT::INFO) {
            Self::Info
        } else {
            Self::Verbose
        }
    }
}

/// Deduplicating, capped filter in front of the log.
#[derive(Debug, Default)]
pub struct DebugMessageFilter {
    seen: HashSet<String>,
    reported: usize,
}

impl DebugMessageFilter {
    /// Create an empty filter.
    pub fn new() -> Self {
        Self::default()
    }

    /// Decide whether `message` should be reported, recording it if so.
    pub fn admit(&mut self, message: &str) -> bool {
        if self.reported >= MAX_REPORTED_MESSAGES || self.seen.contains(message) {
            return false;
        }
        self.seen.insert(message.to_owned());
        self.reported += 1;
        if self.reported == MAX_REPORTED_MESSAGES {
            tracing::warn!(
                target: TARGET,
                "Validation message limit of {MAX_REPORTED_MESSAGES} reached; further messages are suppressed"
            );
        }
        true
    }

    /// Number of messages reported so far.
    pub fn reported(&self) -> usize {
        self.reported
    }
}

/// Filter plus log forwarding; handed to the driver as callback user data.
#[derive(Debug, Default)]
pub struct DebugSink {
    filter: Mutex<DebugMessageFilter>,
}

impl DebugSink {
    /// Report a message if the filter admits it.
    pub fn report(&self, severity: MessageSeverity, kind: &str, message: &str) {
        if !self.filter.lock().admit(message) {
            return;
        }
        match severity {
            MessageSeverity::Error => tracing::error!(target: TARGET, "[{kind}] {message}"),
            MessageSeverity::Warning => tracing::warn!(target: TARGET, "[{kind}] {message}"),
            MessageSeverity::Info => tracing::info!(target: TARGET, "[{kind}] {message}"),
            MessageSeverity::Verbose => tracing::trace!(target: TARGET, "[{kind}] {message}"),
        }
    }
}

/// Debug messenger create info routing into `sink`.
///
/// The sink must outlive the messenger.
pub fn messenger_create_info(sink: &DebugSink) -> vk::DebugUtilsMessengerCreateInfoEXT<'_> {
    vk::DebugUtilsMessengerCreateInfoEXT::default()
        .message_severity(
            vk::DebugUtilsMessageSeverityFlagsEXT::ERROR
                | vk::DebugUtilsMessageSeverityFlagsEXT::WARNING
                | vk::DebugUtilsMessageSeverityFlagsEXT::INFO,
        )
        .message_type(
            vk::DebugUtilsMessageTypeFlagsEXT::GENERAL
                | vk::DebugUtilsMessageTypeFlagsEXT::VALIDATION
                | vk::DebugUtilsMessageTypeFlagsEXT::PERFORMANCE,
        )
        .pfn_user_callback(Some(debug_callback))
        .user_data(std::ptr::from_ref(sink).cast_mut().cast())
}

unsafe extern "system" fn debug_callback(
    message_severity: vk::DebugUtilsMessageSeverityFlagsEXT,
    message_type: vk::DebugUtilsMessageTypeFlagsEXT,
    p_callback_data: *const vk::DebugUtilsMessengerCallbackDataEXT<'_>,
    p_user_data: *mut std::ffi::c_void,
) -> vk::Bool32 {
    if p_callback_data.is_null() || p_user_data.is_null() {
        return vk::FALSE;
    }

    // SAFETY: the driver passes valid callback data; user data is the
    // `DebugSink` registered in `messenger_create_info`.
    let (message, sink) = unsafe {
        let data = &*p_callback_data;
        if data.p_message.is_null() {
            return vk::FALSE;
        }
        (
            CStr::from_ptr(data.p_message).to_string_lossy(),
            &*p_user_data.cast::<DebugSink>(),
        )
    };

    let kind = match message_type {
        vk::DebugUtilsMessageTypeFlagsEXT::GENERAL => "general",
        vk::DebugUtilsMessageTypeFlagsEXT::VALIDATION => "validation",
        vk::DebugUtilsMessageTypeFlagsEXT::PERFORMANCE => "performance",
        _ => "unknown",
    };

    sink.report(MessageSeverity::from_flags(message_severity), kind, &message);
    vk::FALSE
}

/// Debug-utils name for an object; interior NULs become spaces.
pub fn object_name(name: &str) -> CString {
    CString::new(name.replace('\0', " ")).unwrap_or_default()
}

/// Attaches names to Vulkan objects so validation messages and capture
/// tools can show them. Only created when validation is on.
#[derive(Clone)]
pub struct ObjectNamer {
    loader: ash::ext::debug_utils::Device,
}

impl ObjectNamer {
    pub fn new(instance: &ash::Instance, device: &ash::Device) -> Self {
        Self {
            loader: ash::ext::debug_utils::Device::new(instance, device),
        }
    }

    /// Name `handle`. Failures are logged and otherwise ignored.
    pub fn name<H: vk::Handle>(&self, handle: H, name: &str) {
        let name = object_name(name);
        let info = vk::DebugUtilsObjectNameInfoEXT::default()
            .object_handle(handle)
            .object_name(&name);
        // SAFETY: the handle belongs to the device the loader was made for.
        if let Err(e) = unsafe { self.loader.set_debug_utils_object_name(&info) } {
            tracing::trace!("Failed to name {name:?}: {e}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn duplicates_are_dropped() {
        let mut filter = DebugMessageFilter::new();
        assert!(filter.admit("vkCmdDraw: missing pipeline"));
        assert!(!filter.admit("vkCmdDraw: missing pipeline"));
        assert!(filter.admit("other"));
        assert_eq!(filter.reported(), 2);
    }

    #[test]
    fn reporting_stops_at_cap() {
        let mut filter = DebugMessageFilter::new();
        let admitted = (0..50)
            .filter(|i| filter.admit(&format!("message {i}")))
            .count();
        assert_eq!(admitted, MAX_REPORTED_MESSAGES);
        assert!(!filter.admit("one more"));
    }

    #[test]
    fn severity_picks_most_severe_bit() {
        let flags = vk::DebugUtilsMessageSeverityFlagsEXT::WARNING
            | vk::DebugUtilsMessageSeverityFlagsEXT::ERROR;
        assert_eq!(MessageSeverity::from_flags(flags), MessageSeverity::Error);
        assert_eq!(
            MessageSeverity::from_flags(vk::DebugUtilsMessageSeverityFlagsEXT::VERBOSE),
            MessageSeverity::Verbose
        );
    }

    #[test]
    fn object_names_survive_interior_nul() {
        assert_eq!(object_name("frame slot 0").as_bytes(), b"frame slot 0");
        assert_eq!(object_name("bad\0name").as_bytes(), b"bad name");
    }
}
