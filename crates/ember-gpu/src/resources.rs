//! Device-owned GPU objects and their creation descriptors.
//!
//! These types are deliberately thin: renderer passes decide what goes in
//! them, this layer only owns creation, registry storage, and ordered
//! destruction. Shader input is pre-compiled SPIR-V; compiling shading
//! language source is someone else's job.

use crate::error::{GpuError, Result};
use crate::frame::FRAMES_IN_FLIGHT;
use crate::memory::Buffer;
use crate::registry::Handle;
use ash::vk;
use std::sync::atomic::{AtomicUsize, Ordering};

/// Render pass creation parameters.
#[derive(Clone)]
pub struct RenderPassDesc {
    pub color_formats: Vec<vk::Format>,
    pub depth_format: Option<vk::Format>,
}

/// A render pass and its attachment count.
pub struct RenderPass {
    pub(crate) handle: vk::RenderPass,
    pub color_count: u32,
}

impl RenderPass {
    /// # Safety
    /// The device must be valid.
    pub(crate) unsafe fn new(device: &ash::Device, desc: &RenderPassDesc) -> Result<Self> {
        let mut attachments: Vec<vk::AttachmentDescription> = desc
            .color_formats
            .iter()
            .map(|&format| {
                vk::AttachmentDescription::default()
                    .format(format)
                    .samples(vk::SampleCountFlags::TYPE_1)
                    .load_op(vk::AttachmentLoadOp::CLEAR)
                    .store_op(vk::AttachmentStoreOp::STORE)
                    .initial_layout(vk::ImageLayout::UNDEFINED)
                    .final_layout(vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL)
            })
            .collect();

        let color_refs: Vec<vk::AttachmentReference> = (0..desc.color_formats.len())
            .map(|i| {
                vk::AttachmentReference::default()
                    .attachment(i as u32)
                    .layout(vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL)
            })
            .collect();

        let depth_ref = desc.depth_format.map(|format| {
            attachments.push(
                vk::AttachmentDescription::default()
                    .format(format)
                    .samples(vk::SampleCountFlags::TYPE_1)
                    .load_op(vk::AttachmentLoadOp::CLEAR)
                    .store_op(vk::AttachmentStoreOp::STORE)
                    .initial_layout(vk::ImageLayout::UNDEFINED)
                    .final_layout(vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL),
            );
            vk::AttachmentReference::default()
                .attachment(attachments.len() as u32 - 1)
                .layout(vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL)
        });

        let mut subpass = vk::SubpassDescription::default()
            .pipeline_bind_point(vk::PipelineBindPoint::GRAPHICS)
            .color_attachments(&color_refs);
        if let Some(depth_ref) = depth_ref.as_ref() {
            subpass = subpass.depth_stencil_attachment(depth_ref);
        }

        let subpasses = [subpass];
        let create_info = vk::RenderPassCreateInfo::default()
            .attachments(&attachments)
            .subpasses(&subpasses);

        let handle = unsafe { device.create_render_pass(&create_info, None)? };
        Ok(Self {
            handle,
            color_count: desc.color_formats.len() as u32,
        })
    }

    /// The native render pass handle.
    pub fn handle(&self) -> vk::RenderPass {
        self.handle
    }

    /// # Safety
    /// The device must be valid and the pass must not be in use.
    pub(crate) unsafe fn destroy(&self, device: &ash::Device) {
        unsafe { device.destroy_render_pass(self.handle, None) };
    }
}

/// Framebuffer creation parameters. Attachment views must outlive the
/// framebuffer; the caller keeps the owning images alive.
#[derive(Clone)]
pub struct FramebufferDesc {
    pub render_pass: Handle<RenderPass>,
    pub attachments: Vec<vk::ImageView>,
    pub extent: vk::Extent2D,
}

pub struct Framebuffer {
    pub(crate) handle: vk::Framebuffer,
    pub extent: vk::Extent2D,
}

impl Framebuffer {
    /// # Safety
    /// The device and render pass must be valid.
    pub(crate) unsafe fn new(
        device: &ash::Device,
        render_pass: vk::RenderPass,
        desc: &FramebufferDesc,
    ) -> Result<Self> {
        let create_info = vk::FramebufferCreateInfo::default()
            .render_pass(render_pass)
            .attachments(&desc.attachments)
            .width(desc.extent.width)
            .height(desc.extent.height)
            .layers(1);
        let handle = unsafe { device.create_framebuffer(&create_info, None)? };
        Ok(Self {
            handle,
            extent: desc.extent,
        })
    }

    pub fn handle(&self) -> vk::Framebuffer {
        self.handle
    }

    /// # Safety
    /// The device must be valid and the framebuffer must not be in use.
    pub(crate) unsafe fn destroy(&self, device: &ash::Device) {
        unsafe { device.destroy_framebuffer(self.handle, None) };
    }
}

/// Shader creation parameters: one stage of pre-compiled SPIR-V.
#[derive(Clone)]
pub struct ShaderDesc {
    pub stage: vk::ShaderStageFlags,
    pub spirv: Vec<u32>,
}

pub struct Shader {
    pub(crate) module: vk::ShaderModule,
    pub stage: vk::ShaderStageFlags,
}

impl Shader {
    /// # Safety
    /// The device must be valid and the code must be valid SPIR-V.
    pub(crate) unsafe fn new(device: &ash::Device, desc: &ShaderDesc) -> Result<Self> {
        let create_info = vk::ShaderModuleCreateInfo::default().code(&desc.spirv);
        let module = unsafe { device.create_shader_module(&create_info, None)? };
        Ok(Self {
            module,
            stage: desc.stage,
        })
    }

    /// # Safety
    /// The device must be valid and no pipeline may still be created from
    /// this module.
    pub(crate) unsafe fn destroy(&self, device: &ash::Device) {
        unsafe { device.destroy_shader_module(self.module, None) };
    }
}

/// Graphics pipeline creation parameters.
#[derive(Clone)]
pub struct GraphicsPipelineDesc {
    pub vertex_shader: Handle<Shader>,
    pub fragment_shader: Handle<Shader>,
    pub render_pass: Handle<RenderPass>,
    pub set_layouts: Vec<Handle<DescriptorSetLayout>>,
    pub push_constant_size: u32,
    pub vertex_bindings: Vec<vk::VertexInputBindingDescription>,
    pub vertex_attributes: Vec<vk::VertexInputAttributeDescription>,
    pub topology: vk::PrimitiveTopology,
    pub polygon_mode: vk::PolygonMode,
    pub cull_mode: vk::CullModeFlags,
    pub front_face: vk::FrontFace,
    pub depth_test: bool,
    pub depth_write: bool,
}

impl GraphicsPipelineDesc {
    /// Descriptor with common rasterization defaults.
    pub fn new(
        vertex_shader: Handle<Shader>,
        fragment_shader: Handle<Shader>,
        render_pass: Handle<RenderPass>,
    ) -> Self {
        Self {
            vertex_shader,
            fragment_shader,
            render_pass,
            set_layouts: Vec::new(),
            push_constant_size: 0,
            vertex_bindings: Vec::new(),
            vertex_attributes: Vec::new(),
            topology: vk::PrimitiveTopology::TRIANGLE_LIST,
            polygon_mode: vk::PolygonMode::FILL,
            cull_mode: vk::CullModeFlags::BACK,
            front_face: vk::FrontFace::COUNTER_CLOCKWISE,
            depth_test: true,
            depth_write: true,
        }
    }
}

/// Compute pipeline creation parameters.
#[derive(Clone)]
pub struct ComputePipelineDesc {
    pub shader: Handle<Shader>,
    pub set_layouts: Vec<Handle<DescriptorSetLayout>>,
    pub push_constant_size: u32,
}

/// A graphics or compute pipeline with its layout.
pub struct Pipeline {
    pub(crate) pipeline: vk::Pipeline,
    pub(crate) layout: vk::PipelineLayout,
    pub bind_point: vk::PipelineBindPoint,
}

impl Pipeline {
    /// # Safety
    /// The device, modules, render pass, and set layouts must be valid.
    #[allow(clippy::too_many_arguments)]
    pub(crate) unsafe fn graphics(
        device: &ash::Device,
        vertex_module: vk::ShaderModule,
        fragment_module: vk::ShaderModule,
        render_pass: vk::RenderPass,
        color_count: u32,
        set_layouts: &[vk::DescriptorSetLayout],
        desc: &GraphicsPipelineDesc,
    ) -> Result<Self> {
        let layout = unsafe { Self::create_layout(device, set_layouts, desc.push_constant_size)? };

        let stages = [
            vk::PipelineShaderStageCreateInfo::default()
                .stage(vk::ShaderStageFlags::VERTEX)
                .module(vertex_module)
                .name(c"main"),
            vk::PipelineShaderStageCreateInfo::default()
                .stage(vk::ShaderStageFlags::FRAGMENT)
                .module(fragment_module)
                .name(c"main"),
        ];

        let vertex_input = vk::PipelineVertexInputStateCreateInfo::default()
            .vertex_binding_descriptions(&desc.vertex_bindings)
            .vertex_attribute_descriptions(&desc.vertex_attributes);

        let input_assembly =
            vk::PipelineInputAssemblyStateCreateInfo::default().topology(desc.topology);

        // Viewport and scissor are dynamic; callers set them per draw.
        let viewport_state = vk::PipelineViewportStateCreateInfo::default()
            .viewport_count(1)
            .scissor_count(1);
        let dynamic_states = [vk::DynamicState::VIEWPORT, vk::DynamicState::SCISSOR];
        let dynamic_state =
            vk::PipelineDynamicStateCreateInfo::default().dynamic_states(&dynamic_states);

        let rasterization = vk::PipelineRasterizationStateCreateInfo::default()
            .polygon_mode(desc.polygon_mode)
            .cull_mode(desc.cull_mode)
            .front_face(desc.front_face)
            .line_width(1.0);

        let multisample = vk::PipelineMultisampleStateCreateInfo::default()
            .rasterization_samples(vk::SampleCountFlags::TYPE_1);

        let depth_stencil = vk::PipelineDepthStencilStateCreateInfo::default()
            .depth_test_enable(desc.depth_test)
            .depth_write_enable(desc.depth_write)
            .depth_compare_op(vk::CompareOp::LESS_OR_EQUAL);

        let blend_attachments: Vec<vk::PipelineColorBlendAttachmentState> = (0..color_count)
            .map(|_| {
                vk::PipelineColorBlendAttachmentState::default()
                    .color_write_mask(vk::ColorComponentFlags::RGBA)
            })
            .collect();
        let color_blend =
            vk::PipelineColorBlendStateCreateInfo::default().attachments(&blend_attachments);

        let create_info = vk::GraphicsPipelineCreateInfo::default()
            .stages(&stages)
            .vertex_input_state(&vertex_input)
            .input_assembly_state(&input_assembly)
            .viewport_state(&viewport_state)
            .dynamic_state(&dynamic_state)
            .rasterization_state(&rasterization)
            .multisample_state(&multisample)
            .depth_stencil_state(&depth_stencil)
            .color_blend_state(&color_blend)
            .layout(layout)
            .render_pass(render_pass)
            .subpass(0);

        let pipelines = unsafe {
            device
                .create_graphics_pipelines(vk::PipelineCache::null(), &[create_info], None)
                .map_err(|(_, e)| GpuError::Vulkan(e))?
        };

        Ok(Self {
            pipeline: pipelines[0],
            layout,
            bind_point: vk::PipelineBindPoint::GRAPHICS,
        })
    }

    /// # Safety
    /// The device, module, and set layouts must be valid.
    pub(crate) unsafe fn compute(
        device: &ash::Device,
        module: vk::ShaderModule,
        set_layouts: &[vk::DescriptorSetLayout],
        push_constant_size: u32,
    ) -> Result<Self> {
        let layout = unsafe { Self::create_layout(device, set_layouts, push_constant_size)? };

        let stage = vk::PipelineShaderStageCreateInfo::default()
            .stage(vk::ShaderStageFlags::COMPUTE)
            .module(module)
            .name(c"main");

        let create_info = vk::ComputePipelineCreateInfo::default()
            .stage(stage)
            .layout(layout);

        let pipelines = unsafe {
            device
                .create_compute_pipelines(vk::PipelineCache::null(), &[create_info], None)
                .map_err(|(_, e)| GpuError::Vulkan(e))?
        };

        Ok(Self {
            pipeline: pipelines[0],
            layout,
            bind_point: vk::PipelineBindPoint::COMPUTE,
        })
    }

    unsafe fn create_layout(
        device: &ash::Device,
        set_layouts: &[vk::DescriptorSetLayout],
        push_constant_size: u32,
    ) -> Result<vk::PipelineLayout> {
        let ranges;
        let mut layout_info = vk::PipelineLayoutCreateInfo::default().set_layouts(set_layouts);
        if push_constant_size > 0 {
            ranges = [vk::PushConstantRange::default()
                .stage_flags(vk::ShaderStageFlags::ALL)
                .offset(0)
                .size(push_constant_size)];
            layout_info = layout_info.push_constant_ranges(&ranges);
        }
        Ok(unsafe { device.create_pipeline_layout(&layout_info, None)? })
    }

    pub fn handle(&self) -> vk::Pipeline {
        self.pipeline
    }

    pub fn layout(&self) -> vk::PipelineLayout {
        self.layout
    }

    /// # Safety
    /// The device must be valid and the pipeline must not be in use.
    pub(crate) unsafe fn destroy(&self, device: &ash::Device) {
        unsafe {
            device.destroy_pipeline(self.pipeline, None);
            device.destroy_pipeline_layout(self.layout, None);
        }
    }
}

/// 2D image creation parameters.
#[derive(Clone)]
pub struct ImageDesc {
    pub width: u32,
    pub height: u32,
    pub format: vk::Format,
    pub usage: vk::ImageUsageFlags,
    pub aspect: vk::ImageAspectFlags,
    pub mip_levels: u32,
    pub name: String,
}

impl ImageDesc {
    /// Single-mip color image descriptor.
    pub fn new(width: u32, height: u32, format: vk::Format, usage: vk::ImageUsageFlags) -> Self {
        Self {
            width,
            height,
            format,
            usage,
            aspect: vk::ImageAspectFlags::COLOR,
            mip_levels: 1,
            name: String::new(),
        }
    }
}

/// Sampler creation parameters.
#[derive(Clone, Copy)]
pub struct SamplerDesc {
    pub mag_filter: vk::Filter,
    pub min_filter: vk::Filter,
    pub mipmap_mode: vk::SamplerMipmapMode,
    pub address_mode: vk::SamplerAddressMode,
    pub max_anisotropy: Option<f32>,
}

impl Default for SamplerDesc {
    fn default() -> Self {
        Self {
            mag_filter: vk::Filter::LINEAR,
            min_filter: vk::Filter::LINEAR,
            mipmap_mode: vk::SamplerMipmapMode::LINEAR,
            address_mode: vk::SamplerAddressMode::REPEAT,
            max_anisotropy: None,
        }
    }
}

pub struct Sampler {
    pub(crate) handle: vk::Sampler,
}

impl Sampler {
    /// # Safety
    /// The device must be valid.
    pub(crate) unsafe fn new(device: &ash::Device, desc: &SamplerDesc) -> Result<Self> {
        let mut create_info = vk::SamplerCreateInfo::default()
            .mag_filter(desc.mag_filter)
            .min_filter(desc.min_filter)
            .mipmap_mode(desc.mipmap_mode)
            .address_mode_u(desc.address_mode)
            .address_mode_v(desc.address_mode)
            .address_mode_w(desc.address_mode)
            .max_lod(vk::LOD_CLAMP_NONE);
        if let Some(max_anisotropy) = desc.max_anisotropy {
            create_info = create_info
                .anisotropy_enable(true)
                .max_anisotropy(max_anisotropy);
        }
        let handle = unsafe { device.create_sampler(&create_info, None)? };
        Ok(Self { handle })
    }

    pub fn handle(&self) -> vk::Sampler {
        self.handle
    }

    /// # Safety
    /// The device must be valid and the sampler must not be in use.
    pub(crate) unsafe fn destroy(&self, device: &ash::Device) {
        unsafe { device.destroy_sampler(self.handle, None) };
    }
}

/// One binding in a descriptor set layout.
#[derive(Clone, Copy)]
pub struct DescriptorBinding {
    pub binding: u32,
    pub descriptor_type: vk::DescriptorType,
    pub count: u32,
    pub stages: vk::ShaderStageFlags,
}

/// Descriptor set layout creation parameters.
#[derive(Clone, Default)]
pub struct DescriptorSetLayoutDesc {
    pub bindings: Vec<DescriptorBinding>,
}

pub struct DescriptorSetLayout {
    pub(crate) handle: vk::DescriptorSetLayout,
}

impl DescriptorSetLayout {
    /// # Safety
    /// The device must be valid.
    pub(crate) unsafe fn new(
        device: &ash::Device,
        desc: &DescriptorSetLayoutDesc,
    ) -> Result<Self> {
        let bindings: Vec<vk::DescriptorSetLayoutBinding> = desc
            .bindings
            .iter()
            .map(|b| {
                vk::DescriptorSetLayoutBinding::default()
                    .binding(b.binding)
                    .descriptor_type(b.descriptor_type)
                    .descriptor_count(b.count)
                    .stage_flags(b.stages)
            })
            .collect();
        let create_info = vk::DescriptorSetLayoutCreateInfo::default().bindings(&bindings);
        let handle = unsafe { device.create_descriptor_set_layout(&create_info, None)? };
        Ok(Self { handle })
    }

    pub fn handle(&self) -> vk::DescriptorSetLayout {
        self.handle
    }

    /// # Safety
    /// The device must be valid and the layout must not be in use.
    pub(crate) unsafe fn destroy(&self, device: &ash::Device) {
        unsafe { device.destroy_descriptor_set_layout(self.handle, None) };
    }
}

/// Descriptor pool creation parameters.
#[derive(Clone)]
pub struct DescriptorPoolDesc {
    pub max_sets: u32,
    pub sizes: Vec<(vk::DescriptorType, u32)>,
}

pub struct DescriptorPool {
    pub(crate) handle: vk::DescriptorPool,
}

impl DescriptorPool {
    /// # Safety
    /// The device must be valid.
    pub(crate) unsafe fn new(device: &ash::Device, desc: &DescriptorPoolDesc) -> Result<Self> {
        let sizes: Vec<vk::DescriptorPoolSize> = desc
            .sizes
            .iter()
            .map(|&(ty, count)| {
                vk::DescriptorPoolSize::default()
                    .ty(ty)
                    .descriptor_count(count)
            })
            .collect();
        let create_info = vk::DescriptorPoolCreateInfo::default()
            .max_sets(desc.max_sets)
            .pool_sizes(&sizes);
        let handle = unsafe { device.create_descriptor_pool(&create_info, None)? };
        Ok(Self { handle })
    }

    pub fn handle(&self) -> vk::DescriptorPool {
        self.handle
    }

    /// # Safety
    /// The device must be valid and no set from this pool may be in use.
    pub(crate) unsafe fn destroy(&self, device: &ash::Device) {
        unsafe { device.destroy_descriptor_pool(self.handle, None) };
    }
}

/// Query pool creation parameters.
#[derive(Clone, Copy)]
pub struct QueryPoolDesc {
    pub query_type: vk::QueryType,
    pub count: u32,
}

pub struct QueryPool {
    pub(crate) handle: vk::QueryPool,
    pub count: u32,
}

impl QueryPool {
    /// # Safety
    /// The device must be valid.
    pub(crate) unsafe fn new(device: &ash::Device, desc: &QueryPoolDesc) -> Result<Self> {
        let create_info = vk::QueryPoolCreateInfo::default()
            .query_type(desc.query_type)
            .query_count(desc.count);
        let handle = unsafe { device.create_query_pool(&create_info, None)? };
        Ok(Self {
            handle,
            count: desc.count,
        })
    }

    pub fn handle(&self) -> vk::QueryPool {
        self.handle
    }

    /// # Safety
    /// The device must be valid and the pool must not be in use.
    pub(crate) unsafe fn destroy(&self, device: &ash::Device) {
        unsafe { device.destroy_query_pool(self.handle, None) };
    }
}

/// Acceleration structure creation parameters: the size reported by the
/// driver's build-size query.
#[derive(Clone, Copy)]
pub struct AccelerationStructureDesc {
    pub size: u64,
}

/// A bottom- or top-level acceleration structure with its backing buffer.
pub struct AccelerationStructure {
    pub(crate) handle: vk::AccelerationStructureKHR,
    pub(crate) buffer: Buffer,
    pub level: vk::AccelerationStructureTypeKHR,
}

impl AccelerationStructure {
    /// # Safety
    /// The loader and backing buffer must be valid.
    pub(crate) unsafe fn new(
        loader: &ash::khr::acceleration_structure::Device,
        buffer: Buffer,
        level: vk::AccelerationStructureTypeKHR,
        size: u64,
    ) -> Result<Self> {
        let create_info = vk::AccelerationStructureCreateInfoKHR::default()
            .buffer(buffer.buffer)
            .size(size)
            .ty(level);
        let handle = unsafe { loader.create_acceleration_structure(&create_info, None)? };
        Ok(Self {
            handle,
            buffer,
            level,
        })
    }

    pub fn handle(&self) -> vk::AccelerationStructureKHR {
        self.handle
    }
}

/// A buffer multi-buffered across the frame ring, so each in-flight frame
/// writes its own copy.
pub struct MultiBuffer {
    pub(crate) buffers: Vec<Buffer>,
    current: AtomicUsize,
}

impl MultiBuffer {
    pub(crate) fn new(buffers: Vec<Buffer>) -> Self {
        debug_assert_eq!(buffers.len(), FRAMES_IN_FLIGHT);
        Self {
            buffers,
            current: AtomicUsize::new(0),
        }
    }

    /// The buffer backing the current frame.
    pub fn current(&self) -> &Buffer {
        &self.buffers[self.current.load(Ordering::Acquire)]
    }

    /// Advance to the next frame's buffer. Called once per frame by the
    /// submission path.
    pub(crate) fn advance(&self) {
        let next = (self.current.load(Ordering::Acquire) + 1) % self.buffers.len();
        self.current.store(next, Ordering::Release);
    }

    #[cfg(test)]
    pub(crate) fn current_index(&self) -> usize {
        self.current.load(Ordering::Acquire)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn null_buffer() -> Buffer {
        Buffer {
            buffer: vk::Buffer::null(),
            allocation: None,
            size: 0,
        }
    }

    #[test]
    fn multi_buffer_index_wraps_with_the_ring() {
        let multi = MultiBuffer::new((0..FRAMES_IN_FLIGHT).map(|_| null_buffer()).collect());
        assert_eq!(multi.current_index(), 0);

        for expected in (1..FRAMES_IN_FLIGHT).chain([0]) {
            multi.advance();
            assert_eq!(multi.current_index(), expected);
        }
    }
}
