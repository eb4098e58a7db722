//! Surface management for windowed rendering.
//!
//! Wraps Vulkan surface creation behind `raw-window-handle` so the layer
//! never depends on a specific windowing library. Headless builds skip
//! surfaces entirely.

use crate::error::{GpuError, Result};
use crate::instance::Instance;
use ash::vk;
use raw_window_handle::{HasDisplayHandle, HasWindowHandle};

/// A presentable surface and its extension loader.
pub struct Surface {
    pub(crate) handle: vk::SurfaceKHR,
    pub(crate) loader: ash::khr::surface::Instance,
}

impl Surface {
    /// Create a surface from a platform window.
    ///
    /// # Safety
    /// The window handles must stay valid for the surface's lifetime.
    pub unsafe fn from_window<W>(instance: &Instance, window: &W) -> Result<Self>
    where
        W: HasDisplayHandle + HasWindowHandle,
    {
        let display = window
            .display_handle()
            .map_err(|e| GpuError::SurfaceCreation(format!("Failed to get display handle: {e}")))?;
        let window_handle = window
            .window_handle()
            .map_err(|e| GpuError::SurfaceCreation(format!("Failed to get window handle: {e}")))?;

        let handle = unsafe {
            ash_window::create_surface(
                instance.entry(),
                instance.handle(),
                display.as_raw(),
                window_handle.as_raw(),
                None,
            )
        }
        .map_err(|e| GpuError::SurfaceCreation(e.to_string()))?;

        let loader = ash::khr::surface::Instance::new(instance.entry(), instance.handle());

        Ok(Self { handle, loader })
    }

    /// Whether the given queue family can present to this surface.
    pub fn supports_family(&self, physical_device: vk::PhysicalDevice, family: u32) -> bool {
        unsafe {
            self.loader
                .get_physical_device_surface_support(physical_device, family, self.handle)
                .unwrap_or(false)
        }
    }

    /// Query swapchain support for a physical device.
    pub fn swapchain_support(
        &self,
        physical_device: vk::PhysicalDevice,
    ) -> Result<SwapchainSupport> {
        unsafe {
            let capabilities = self
                .loader
                .get_physical_device_surface_capabilities(physical_device, self.handle)?;
            let formats = self
                .loader
                .get_physical_device_surface_formats(physical_device, self.handle)?;
            let present_modes = self
                .loader
                .get_physical_device_surface_present_modes(physical_device, self.handle)?;

            Ok(SwapchainSupport {
                capabilities,
                formats,
                present_modes,
            })
        }
    }

    /// # Safety
    /// The surface must not be in use.
    pub(crate) unsafe fn destroy(&self) {
        unsafe { self.loader.destroy_surface(self.handle, None) };
    }
}

/// Swapchain support query result.
pub struct SwapchainSupport {
    /// Raw surface capabilities.
    pub capabilities: vk::SurfaceCapabilitiesKHR,
    /// Supported surface formats.
    pub formats: Vec<vk::SurfaceFormatKHR>,
    /// Supported present modes.
    pub present_modes: Vec<vk::PresentModeKHR>,
}

impl SwapchainSupport {
    /// A surface is usable only when it reports at least one format and one
    /// present mode.
    pub fn is_adequate(&self) -> bool {
        !self.formats.is_empty() && !self.present_modes.is_empty()
    }
}
