//! Swapchain management.
//!
//! The swapchain owns its presentable images plus a presentation render pass
//! and one framebuffer per image, so a frame that recorded nothing against
//! the swapchain can still be given a well-defined present dependency.
//! Staleness (out-of-date or suboptimal results) is reported to the caller,
//! never raised as an error.

use crate::error::{GpuError, Result};
use crate::surface::SwapchainSupport;
use ash::vk;

/// Swapchain wrapper.
pub struct Swapchain {
    pub(crate) handle: vk::SwapchainKHR,
    pub images: Vec<vk::Image>,
    pub image_views: Vec<vk::ImageView>,
    render_pass: vk::RenderPass,
    framebuffers: Vec<vk::Framebuffer>,
    pub format: vk::Format,
    pub extent: vk::Extent2D,
}

impl Swapchain {
    /// Create a new swapchain.
    ///
    /// # Safety
    /// All handles must be valid.
    #[allow(clippy::too_many_arguments)]
    pub(crate) unsafe fn new(
        device: &ash::Device,
        swapchain_loader: &ash::khr::swapchain::Device,
        surface: vk::SurfaceKHR,
        support: &SwapchainSupport,
        present_mode: vk::PresentModeKHR,
        extent: vk::Extent2D,
        old_swapchain: Option<vk::SwapchainKHR>,
        present_queue_family: u32,
    ) -> Result<Self> {
        let surface_format = select_surface_format(&support.formats);
        let present_mode = select_present_mode(&support.present_modes, present_mode);

        let mut image_count = support.capabilities.min_image_count + 1;
        if support.capabilities.max_image_count > 0
            && image_count > support.capabilities.max_image_count
        {
            image_count = support.capabilities.max_image_count;
        }

        let queue_families = [present_queue_family];
        let create_info = vk::SwapchainCreateInfoKHR::default()
            .surface(surface)
            .min_image_count(image_count)
            .image_format(surface_format.format)
            .image_color_space(surface_format.color_space)
            .image_extent(extent)
            .image_array_layers(1)
            .image_usage(vk::ImageUsageFlags::COLOR_ATTACHMENT | vk::ImageUsageFlags::TRANSFER_DST)
            .image_sharing_mode(vk::SharingMode::EXCLUSIVE)
            .queue_family_indices(&queue_families)
            .pre_transform(support.capabilities.current_transform)
            .composite_alpha(vk::CompositeAlphaFlagsKHR::OPAQUE)
            .present_mode(present_mode)
            .clipped(true)
            .old_swapchain(old_swapchain.unwrap_or(vk::SwapchainKHR::null()));

        let handle = unsafe {
            swapchain_loader
                .create_swapchain(&create_info, None)
                .map_err(|e| GpuError::SwapchainCreation(e.to_string()))?
        };

        let images = unsafe { swapchain_loader.get_swapchain_images(handle)? };

        let image_views: Vec<vk::ImageView> = images
            .iter()
            .map(|&image| {
                let view_info = vk::ImageViewCreateInfo::default()
                    .image(image)
                    .view_type(vk::ImageViewType::TYPE_2D)
                    .format(surface_format.format)
                    .components(vk::ComponentMapping::default())
                    .subresource_range(
                        vk::ImageSubresourceRange::default()
                            .aspect_mask(vk::ImageAspectFlags::COLOR)
                            .base_mip_level(0)
                            .level_count(1)
                            .base_array_layer(0)
                            .layer_count(1),
                    );
                unsafe { device.create_image_view(&view_info, None) }
            })
            .collect::<std::result::Result<Vec<_>, _>>()?;

        // Presentation render pass: a single color attachment transitioning
        // to present layout.
        let attachments = [vk::AttachmentDescription::default()
            .format(surface_format.format)
            .samples(vk::SampleCountFlags::TYPE_1)
            .load_op(vk::AttachmentLoadOp::CLEAR)
            .store_op(vk::AttachmentStoreOp::STORE)
            .initial_layout(vk::ImageLayout::UNDEFINED)
            .final_layout(vk::ImageLayout::PRESENT_SRC_KHR)];
        let color_refs = [vk::AttachmentReference::default()
            .attachment(0)
            .layout(vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL)];
        let subpasses = [vk::SubpassDescription::default()
            .pipeline_bind_point(vk::PipelineBindPoint::GRAPHICS)
            .color_attachments(&color_refs)];
        let pass_info = vk::RenderPassCreateInfo::default()
            .attachments(&attachments)
            .subpasses(&subpasses);
        let render_pass = unsafe { device.create_render_pass(&pass_info, None)? };

        let framebuffers: Vec<vk::Framebuffer> = image_views
            .iter()
            .map(|view| {
                let views = [*view];
                let fb_info = vk::FramebufferCreateInfo::default()
                    .render_pass(render_pass)
                    .attachments(&views)
                    .width(extent.width)
                    .height(extent.height)
                    .layers(1);
                unsafe { device.create_framebuffer(&fb_info, None) }
            })
            .collect::<std::result::Result<Vec<_>, _>>()?;

        Ok(Self {
            handle,
            images,
            image_views,
            render_pass,
            framebuffers,
            format: surface_format.format,
            extent,
        })
    }

    /// The presentation render pass.
    pub fn render_pass(&self) -> vk::RenderPass {
        self.render_pass
    }

    /// The framebuffer for the given swapchain image.
    pub fn framebuffer(&self, image_index: u32) -> vk::Framebuffer {
        self.framebuffers[image_index as usize]
    }

    /// Acquire the next image. Returns the image index and whether the
    /// swapchain is suboptimal for the surface.
    ///
    /// # Safety
    /// All handles must be valid and the semaphore must be unsignaled.
    pub(crate) unsafe fn acquire_next_image(
        &self,
        swapchain_loader: &ash::khr::swapchain::Device,
        semaphore: vk::Semaphore,
    ) -> Result<(u32, bool)> {
        let result = unsafe {
            swapchain_loader.acquire_next_image(
                self.handle,
                u64::MAX,
                semaphore,
                vk::Fence::null(),
            )
        };

        match result {
            Ok((index, suboptimal)) => Ok((index, suboptimal)),
            // OUT_OF_DATE means no image was acquired; the caller must
            // recreate the swapchain.
            Err(e) => Err(GpuError::from(e)),
        }
    }

    /// Present an image. Returns true when the swapchain has gone stale and
    /// must be recreated.
    ///
    /// # Safety
    /// All handles must be valid and `image_index` must be acquired.
    pub(crate) unsafe fn present(
        &self,
        swapchain_loader: &ash::khr::swapchain::Device,
        queue: vk::Queue,
        image_index: u32,
        wait_semaphores: &[vk::Semaphore],
    ) -> Result<bool> {
        let swapchains = [self.handle];
        let image_indices = [image_index];

        let present_info = vk::PresentInfoKHR::default()
            .wait_semaphores(wait_semaphores)
            .swapchains(&swapchains)
            .image_indices(&image_indices);

        let result = unsafe { swapchain_loader.queue_present(queue, &present_info) };

        match result {
            Ok(suboptimal) => Ok(suboptimal),
            Err(vk::Result::ERROR_OUT_OF_DATE_KHR) => Ok(true),
            Err(e) => Err(GpuError::from(e)),
        }
    }

    /// Destroy the swapchain.
    ///
    /// # Safety
    /// All handles must be valid and the swapchain must not be in use.
    pub(crate) unsafe fn destroy(
        &self,
        device: &ash::Device,
        swapchain_loader: &ash::khr::swapchain::Device,
    ) {
        unsafe {
            for &framebuffer in &self.framebuffers {
                device.destroy_framebuffer(framebuffer, None);
            }
            device.destroy_render_pass(self.render_pass, None);
            for &view in &self.image_views {
                device.destroy_image_view(view, None);
            }
            swapchain_loader.destroy_swapchain(self.handle, None);
        }
    }
}

/// Select the best surface format, preferring SRGB.
pub fn select_surface_format(available: &[vk::SurfaceFormatKHR]) -> vk::SurfaceFormatKHR {
    for format in available {
        if format.format == vk::Format::B8G8R8A8_SRGB
            && format.color_space == vk::ColorSpaceKHR::SRGB_NONLINEAR
        {
            return *format;
        }
    }

    available[0]
}

/// Select the requested present mode if available, falling back to FIFO
/// which is always supported.
pub fn select_present_mode(
    available: &[vk::PresentModeKHR],
    desired: vk::PresentModeKHR,
) -> vk::PresentModeKHR {
    if available.contains(&desired) {
        return desired;
    }
    vk::PresentModeKHR::FIFO
}

/// Calculate swapchain extent from the surface capabilities.
pub fn calculate_extent(
    capabilities: &vk::SurfaceCapabilitiesKHR,
    desired_width: u32,
    desired_height: u32,
) -> vk::Extent2D {
    if capabilities.current_extent.width != u32::MAX {
        capabilities.current_extent
    } else {
        vk::Extent2D {
            width: desired_width.clamp(
                capabilities.min_image_extent.width,
                capabilities.max_image_extent.width,
            ),
            height: desired_height.clamp(
                capabilities.min_image_extent.height,
                capabilities.max_image_extent.height,
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn surface_format_prefers_srgb() {
        let formats = [
            vk::SurfaceFormatKHR {
                format: vk::Format::R8G8B8A8_UNORM,
                color_space: vk::ColorSpaceKHR::SRGB_NONLINEAR,
            },
            vk::SurfaceFormatKHR {
                format: vk::Format::B8G8R8A8_SRGB,
                color_space: vk::ColorSpaceKHR::SRGB_NONLINEAR,
            },
        ];
        assert_eq!(
            select_surface_format(&formats).format,
            vk::Format::B8G8R8A8_SRGB
        );

        // Without an SRGB candidate the first advertised format wins.
        assert_eq!(
            select_surface_format(&formats[..1]).format,
            vk::Format::R8G8B8A8_UNORM
        );
    }

    #[test]
    fn present_mode_falls_back_to_fifo() {
        let available = [vk::PresentModeKHR::FIFO, vk::PresentModeKHR::MAILBOX];
        assert_eq!(
            select_present_mode(&available, vk::PresentModeKHR::MAILBOX),
            vk::PresentModeKHR::MAILBOX
        );
        assert_eq!(
            select_present_mode(&available[..1], vk::PresentModeKHR::MAILBOX),
            vk::PresentModeKHR::FIFO
        );
    }

    #[test]
    fn extent_honors_surface_limits() {
        let mut capabilities = vk::SurfaceCapabilitiesKHR::default();
        capabilities.current_extent = vk::Extent2D {
            width: 1280,
            height: 720,
        };
        // A fixed current extent overrides the desired size.
        let extent = calculate_extent(&capabilities, 640, 480);
        assert_eq!((extent.width, extent.height), (1280, 720));

        // A wildcard extent clamps the desired size to the surface range.
        capabilities.current_extent.width = u32::MAX;
        capabilities.min_image_extent = vk::Extent2D {
            width: 800,
            height: 600,
        };
        capabilities.max_image_extent = vk::Extent2D {
            width: 1920,
            height: 1080,
        };
        let extent = calculate_extent(&capabilities, 640, 2000);
        assert_eq!((extent.width, extent.height), (800, 1080));
    }
}
