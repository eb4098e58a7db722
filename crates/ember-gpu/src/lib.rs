//! Vulkan device, queue, and frame-lifecycle layer for the Ember engine.
//!
//! This crate provides:
//! - Vulkan instance and device management
//! - Queue family negotiation and serialized queue access
//! - Reusable command lists with per-frame and frame-independent lifetimes
//! - A fixed frame ring bounding frames in flight
//! - Handle-table ownership of GPU objects with deferred destruction
//! - Ordered multi-queue submission with semaphore chaining and present

pub mod command;
pub mod device;
pub mod error;
pub mod frame;
pub mod instance;
pub mod memory;
pub mod queue;
pub mod registry;
pub mod resources;
pub(crate) mod submit;
pub mod surface;
pub mod swapchain;

pub use command::CommandList;
pub use device::GraphicsDevice;
pub use error::{GpuError, Result};
pub use frame::FRAMES_IN_FLIGHT;
pub use instance::{Instance, InstanceBuilder};
pub use memory::{Buffer, GpuAllocator, Image};
pub use queue::{QueueCaps, QueueFamilyAssignment, QueueRef, QueueType};
pub use registry::{Handle, ResourceTable};
pub use resources::{
    AccelerationStructure, AccelerationStructureDesc, ComputePipelineDesc, DescriptorBinding,
    DescriptorPool, DescriptorPoolDesc, DescriptorSetLayout, DescriptorSetLayoutDesc, Framebuffer,
    FramebufferDesc, GraphicsPipelineDesc, ImageDesc, MultiBuffer, Pipeline, QueryPool,
    QueryPoolDesc, RenderPass, RenderPassDesc, Sampler, SamplerDesc, Shader, ShaderDesc,
};
pub use surface::{Surface, SwapchainSupport};
pub use swapchain::Swapchain;

/// Bounded GPU wait applied to every fence wait; exceeding it is treated as
/// a device hang.
pub(crate) const GPU_WAIT_TIMEOUT_NS: u64 = 30_000_000_000;
