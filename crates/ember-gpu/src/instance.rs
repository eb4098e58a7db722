//! Vulkan instance, layer/extension discovery, and validation plumbing.
//!
//! The instance is the explicit ownership root: it is created once at
//! startup and handed down to whoever needs device access. High-severity
//! validation messages are latched here and surfaced as errors at the next
//! frame boundary in debug builds.

use crate::error::{GpuError, Result};
use ash::vk;
use ember_core::constants::{ENGINE_NAME, ENGINE_VERSION_MAJOR, ENGINE_VERSION_MINOR};
use parking_lot::Mutex;
use std::ffi::{c_void, CStr, CString};
use std::sync::Arc;

/// Extensions advertised by some drivers that must not be requested.
/// `VK_EXT_debug_report` is superseded by debug utils and misbehaves when
/// both are active on older loaders.
const KNOWN_BROKEN_EXTENSIONS: &[&CStr] = &[c"VK_EXT_debug_report"];

/// A validation message pattern known to be a false positive: the surface
/// extent can legitimately race a window resize between query and swapchain
/// creation.
const BENIGN_VALIDATION_PATTERNS: &[&str] = &["VUID-VkSwapchainCreateInfoKHR-imageExtent-01274"];

/// Message class derived from the driver's message type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum LogClass {
    Message,
    Warning,
    Error,
}

/// Message weight derived from the driver's severity.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum LogSeverity {
    Low,
    Medium,
    High,
}

/// Map the driver's severity/type enums into the engine's own taxonomy.
pub(crate) fn classify_message(
    message_type: vk::DebugUtilsMessageTypeFlagsEXT,
    severity: vk::DebugUtilsMessageSeverityFlagsEXT,
) -> (LogClass, LogSeverity) {
    let class = if message_type.contains(vk::DebugUtilsMessageTypeFlagsEXT::VALIDATION) {
        LogClass::Error
    } else if message_type.contains(vk::DebugUtilsMessageTypeFlagsEXT::PERFORMANCE) {
        LogClass::Warning
    } else {
        LogClass::Message
    };

    let severity = if severity.contains(vk::DebugUtilsMessageSeverityFlagsEXT::ERROR) {
        LogSeverity::High
    } else if severity.contains(vk::DebugUtilsMessageSeverityFlagsEXT::WARNING) {
        LogSeverity::Medium
    } else {
        LogSeverity::Low
    };

    (class, severity)
}

/// Whether a message matches the recognized-benign carve-out.
pub(crate) fn is_benign_validation_message(message: &str) -> bool {
    BENIGN_VALIDATION_PATTERNS
        .iter()
        .any(|pattern| message.contains(pattern))
}

/// Latches the first high-severity validation message for the frame loop to
/// surface.
pub(crate) struct ValidationMonitor {
    error: Mutex<Option<String>>,
}

impl ValidationMonitor {
    fn new() -> Self {
        Self {
            error: Mutex::new(None),
        }
    }

    fn record(&self, message: String) {
        let mut error = self.error.lock();
        if error.is_none() {
            *error = Some(message);
        }
    }

    pub(crate) fn take(&self) -> Option<String> {
        self.error.lock().take()
    }
}

unsafe extern "system" fn debug_callback(
    severity: vk::DebugUtilsMessageSeverityFlagsEXT,
    message_type: vk::DebugUtilsMessageTypeFlagsEXT,
    data: *const vk::DebugUtilsMessengerCallbackDataEXT,
    user_data: *mut c_void,
) -> vk::Bool32 {
    if data.is_null() {
        return vk::FALSE;
    }
    let message = unsafe { CStr::from_ptr((*data).p_message) }.to_string_lossy();

    let (class, message_severity) = classify_message(message_type, severity);
    match class {
        LogClass::Message => tracing::debug!(target: "vulkan", "{message}"),
        LogClass::Warning => tracing::warn!(target: "vulkan", "{message}"),
        LogClass::Error => tracing::error!(target: "vulkan", "{message}"),
    }

    if class == LogClass::Error
        && message_severity == LogSeverity::High
        && !is_benign_validation_message(&message)
        && !user_data.is_null()
    {
        let monitor = unsafe { &*user_data.cast::<ValidationMonitor>() };
        monitor.record(message.into_owned());
    }

    vk::FALSE
}

/// Builder for creating an [`Instance`].
pub struct InstanceBuilder {
    app_name: String,
    enable_validation: bool,
}

impl Default for InstanceBuilder {
    fn default() -> Self {
        Self {
            app_name: ENGINE_NAME.to_string(),
            enable_validation: cfg!(debug_assertions),
        }
    }
}

impl InstanceBuilder {
    /// Create a new builder.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the application name.
    pub fn app_name(mut self, name: impl Into<String>) -> Self {
        self.app_name = name.into();
        self
    }

    /// Enable or disable validation layers.
    pub fn validation(mut self, enable: bool) -> Self {
        self.enable_validation = enable;
        self
    }

    /// Build the instance.
    pub fn build(self) -> Result<Arc<Instance>> {
        let entry = unsafe { ash::Entry::load() }
            .map_err(|e| GpuError::Other(format!("Failed to load Vulkan: {e}")))?;

        let (supported_extensions, supported_layers) =
            unsafe { load_supported_layers_and_extensions(&entry)? };

        let mut validation = self.enable_validation;
        let validation_layer = c"VK_LAYER_KHRONOS_validation";
        if validation && !supported_layers.iter().any(|l| l.as_c_str() == validation_layer) {
            tracing::warn!("Validation layer not available, continuing without it");
            validation = false;
        }

        let requested_extensions = requested_instance_extensions(validation);
        for extension in &requested_extensions {
            if !supported_extensions
                .iter()
                .any(|e| e.as_c_str() == *extension)
            {
                return Err(GpuError::ExtensionNotSupported(
                    extension.to_string_lossy().into_owned(),
                ));
            }
        }

        let app_name = CString::new(self.app_name.clone()).unwrap();
        let engine_name = CString::new(ENGINE_NAME).unwrap();
        let app_info = vk::ApplicationInfo::default()
            .application_name(&app_name)
            .application_version(vk::make_api_version(0, 1, 0, 0))
            .engine_name(&engine_name)
            .engine_version(vk::make_api_version(
                0,
                ENGINE_VERSION_MAJOR,
                ENGINE_VERSION_MINOR,
                0,
            ))
            .api_version(vk::API_VERSION_1_3);

        let extension_names: Vec<*const i8> =
            requested_extensions.iter().map(|e| e.as_ptr()).collect();
        let layer_names: Vec<*const i8> = if validation {
            vec![validation_layer.as_ptr()]
        } else {
            Vec::new()
        };

        // Required for MoltenVK on macOS.
        #[cfg(target_os = "macos")]
        let create_flags = vk::InstanceCreateFlags::ENUMERATE_PORTABILITY_KHR;
        #[cfg(not(target_os = "macos"))]
        let create_flags = vk::InstanceCreateFlags::empty();

        let create_info = vk::InstanceCreateInfo::default()
            .application_info(&app_info)
            .enabled_extension_names(&extension_names)
            .enabled_layer_names(&layer_names)
            .flags(create_flags);

        let instance = unsafe { entry.create_instance(&create_info, None)? };

        let monitor = Arc::new(ValidationMonitor::new());
        let (debug_utils, messenger, monitor_ptr) = if validation {
            let debug_utils = ash::ext::debug_utils::Instance::new(&entry, &instance);
            let monitor_ptr = Arc::into_raw(monitor.clone()) as *mut c_void;
            let messenger_info = vk::DebugUtilsMessengerCreateInfoEXT::default()
                .message_severity(
                    vk::DebugUtilsMessageSeverityFlagsEXT::VERBOSE
                        | vk::DebugUtilsMessageSeverityFlagsEXT::INFO
                        | vk::DebugUtilsMessageSeverityFlagsEXT::WARNING
                        | vk::DebugUtilsMessageSeverityFlagsEXT::ERROR,
                )
                .message_type(
                    vk::DebugUtilsMessageTypeFlagsEXT::GENERAL
                        | vk::DebugUtilsMessageTypeFlagsEXT::VALIDATION
                        | vk::DebugUtilsMessageTypeFlagsEXT::PERFORMANCE,
                )
                .pfn_user_callback(Some(debug_callback))
                .user_data(monitor_ptr);
            let messenger =
                unsafe { debug_utils.create_debug_utils_messenger(&messenger_info, None)? };
            (Some(debug_utils), messenger, monitor_ptr)
        } else {
            (None, vk::DebugUtilsMessengerEXT::null(), std::ptr::null_mut())
        };

        tracing::info!(app = %self.app_name, validation, "created Vulkan instance");

        Ok(Arc::new(Instance {
            entry,
            instance,
            debug_utils,
            messenger,
            monitor,
            monitor_ptr,
            validation,
            supported_extensions,
        }))
    }
}

/// Owns the API entry point, the instance, and the debug messenger.
pub struct Instance {
    entry: ash::Entry,
    pub(crate) instance: ash::Instance,
    debug_utils: Option<ash::ext::debug_utils::Instance>,
    messenger: vk::DebugUtilsMessengerEXT,
    monitor: Arc<ValidationMonitor>,
    monitor_ptr: *mut c_void,
    validation: bool,
    supported_extensions: Vec<CString>,
}

// The raw monitor pointer is only dereferenced by the driver callback while
// the messenger is alive; the monitor itself is Sync.
unsafe impl Send for Instance {}
unsafe impl Sync for Instance {}

impl Instance {
    /// The Vulkan entry point.
    pub fn entry(&self) -> &ash::Entry {
        &self.entry
    }

    /// The native instance handle.
    pub fn handle(&self) -> &ash::Instance {
        &self.instance
    }

    /// Whether validation layers are active.
    pub fn validation_enabled(&self) -> bool {
        self.validation
    }

    /// Whether the given instance extension is supported (after filtering
    /// known-problematic entries).
    pub fn extension_supported(&self, name: &CStr) -> bool {
        self.supported_extensions
            .iter()
            .any(|e| e.as_c_str() == name)
    }

    /// Take the latched high-severity validation message, if any.
    pub(crate) fn take_validation_error(&self) -> Option<String> {
        self.monitor.take()
    }
}

impl Drop for Instance {
    fn drop(&mut self) {
        unsafe {
            if let Some(debug_utils) = &self.debug_utils {
                debug_utils.destroy_debug_utils_messenger(self.messenger, None);
            }
            if !self.monitor_ptr.is_null() {
                drop(Arc::from_raw(self.monitor_ptr.cast::<ValidationMonitor>()));
            }
            self.instance.destroy_instance(None);
        }
    }
}

/// Instance extensions requested for this build configuration.
fn requested_instance_extensions(validation: bool) -> Vec<&'static CStr> {
    let mut extensions: Vec<&'static CStr> = Vec::new();

    #[cfg(not(feature = "headless"))]
    {
        extensions.push(ash::khr::surface::NAME);
        #[cfg(target_os = "windows")]
        extensions.push(ash::khr::win32_surface::NAME);
        #[cfg(target_os = "linux")]
        extensions.push(ash::khr::xlib_surface::NAME);
        #[cfg(target_os = "linux")]
        extensions.push(ash::khr::wayland_surface::NAME);
        #[cfg(target_os = "macos")]
        extensions.push(ash::ext::metal_surface::NAME);
    }

    #[cfg(target_os = "macos")]
    extensions.push(ash::khr::portability_enumeration::NAME);

    extensions.push(ash::khr::get_physical_device_properties2::NAME);

    if validation {
        extensions.push(ash::ext::debug_utils::NAME);
    }

    extensions
}

/// Enumerate supported extensions and layers once, dropping
/// known-problematic extension entries.
///
/// # Safety
/// The entry must be a valid Vulkan entry point.
unsafe fn load_supported_layers_and_extensions(
    entry: &ash::Entry,
) -> Result<(Vec<CString>, Vec<CString>)> {
    let extension_properties =
        unsafe { entry.enumerate_instance_extension_properties(None)? };
    let extensions: Vec<CString> = extension_properties
        .iter()
        .map(|props| unsafe { CStr::from_ptr(props.extension_name.as_ptr()) }.to_owned())
        .filter(|name| {
            let broken = KNOWN_BROKEN_EXTENSIONS.contains(&name.as_c_str());
            if broken {
                tracing::debug!(extension = ?name, "ignoring known-problematic instance extension");
            }
            !broken
        })
        .collect();

    let layer_properties = unsafe { entry.enumerate_instance_layer_properties()? };
    let layers: Vec<CString> = layer_properties
        .iter()
        .map(|props| unsafe { CStr::from_ptr(props.layer_name.as_ptr()) }.to_owned())
        .collect();

    Ok((extensions, layers))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn validation_errors_map_to_high_severity() {
        let (class, severity) = classify_message(
            vk::DebugUtilsMessageTypeFlagsEXT::VALIDATION,
            vk::DebugUtilsMessageSeverityFlagsEXT::ERROR,
        );
        assert_eq!(class, LogClass::Error);
        assert_eq!(severity, LogSeverity::High);
    }

    #[test]
    fn performance_messages_are_warnings() {
        let (class, severity) = classify_message(
            vk::DebugUtilsMessageTypeFlagsEXT::PERFORMANCE,
            vk::DebugUtilsMessageSeverityFlagsEXT::WARNING,
        );
        assert_eq!(class, LogClass::Warning);
        assert_eq!(severity, LogSeverity::Medium);

        let (class, severity) = classify_message(
            vk::DebugUtilsMessageTypeFlagsEXT::GENERAL,
            vk::DebugUtilsMessageSeverityFlagsEXT::VERBOSE,
        );
        assert_eq!(class, LogClass::Message);
        assert_eq!(severity, LogSeverity::Low);
    }

    #[test]
    fn benign_swapchain_extent_race_is_carved_out() {
        assert!(is_benign_validation_message(
            "vkCreateSwapchainKHR: VUID-VkSwapchainCreateInfoKHR-imageExtent-01274 \
             imageExtent does not match the currentExtent"
        ));
        assert!(!is_benign_validation_message(
            "VUID-vkCmdDraw-None-02699 descriptor set not bound"
        ));
    }

    #[test]
    fn monitor_latches_first_error_only() {
        let monitor = ValidationMonitor::new();
        monitor.record("first".to_string());
        monitor.record("second".to_string());
        assert_eq!(monitor.take().as_deref(), Some("first"));
        assert!(monitor.take().is_none());
    }
}
