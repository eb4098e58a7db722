//! The graphics device: selection, object factories, and the frame loop.
//!
//! `GraphicsDevice` owns everything with a GPU lifetime: the logical device,
//! the queue registry, the frame ring, the per-type object tables, and the
//! allocator. Renderer passes only ever touch it through `command_list`,
//! `submit`/`flush`, and the `create_*` factories.

use crate::command::{claim_matching, CommandList};
use crate::error::{GpuError, Result};
use crate::frame::{FrameRing, Submission, FRAMES_IN_FLIGHT};
use crate::instance::Instance;
use crate::memory::{Buffer, GpuAllocator, Image};
use crate::queue::{assign_queue_families, QueueCaps, QueueRef, QueueRegistry, QueueType};
use crate::registry::{Handle, ResourceTable};
use crate::resources::{
    AccelerationStructure, AccelerationStructureDesc, ComputePipelineDesc, DescriptorPool,
    DescriptorPoolDesc, DescriptorSetLayout, DescriptorSetLayoutDesc, Framebuffer,
    FramebufferDesc, GraphicsPipelineDesc, ImageDesc, MultiBuffer, Pipeline, QueryPool,
    QueryPoolDesc, RenderPass, RenderPassDesc, Sampler, SamplerDesc, Shader, ShaderDesc,
};
use crate::submit::{plan_chain, SubmitRequest, SubmitWorker};
use crate::surface::Surface;
use crate::swapchain::{calculate_extent, Swapchain};
use crate::GPU_WAIT_TIMEOUT_NS;
use ash::vk;
use gpu_allocator::MemoryLocation;
use parking_lot::Mutex;
use std::ffi::CStr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

/// Everything rating a physical device needs to know, gathered up front so
/// the scoring itself stays a pure function.
pub(crate) struct DeviceRating {
    pub device_type: vk::PhysicalDeviceType,
    pub max_image_dimension_2d: u32,
    pub queues_complete: bool,
    pub extensions_supported: bool,
    pub swapchain_adequate: bool,
    pub supports_anisotropy: bool,
}

/// Score a physical device. Zero disqualifies; the discrete-GPU bonus
/// outweighs any texture-dimension difference.
pub(crate) fn rate_device(rating: &DeviceRating) -> i32 {
    if !rating.queues_complete
        || !rating.extensions_supported
        || !rating.swapchain_adequate
        || !rating.supports_anisotropy
    {
        return 0;
    }

    let mut score = 0;
    if rating.device_type == vk::PhysicalDeviceType::DISCRETE_GPU {
        score += 10_000;
    }
    score += rating.max_image_dimension_2d as i32;
    score
}

/// Typed object tables, one per device object kind.
struct DeviceTables {
    render_passes: ResourceTable<RenderPass>,
    framebuffers: ResourceTable<Framebuffer>,
    shaders: ResourceTable<Shader>,
    pipelines: ResourceTable<Pipeline>,
    buffers: ResourceTable<Buffer>,
    multi_buffers: ResourceTable<MultiBuffer>,
    images: ResourceTable<Image>,
    samplers: ResourceTable<Sampler>,
    descriptor_set_layouts: ResourceTable<DescriptorSetLayout>,
    descriptor_pools: ResourceTable<DescriptorPool>,
    query_pools: ResourceTable<QueryPool>,
    blas: ResourceTable<AccelerationStructure>,
    tlas: ResourceTable<AccelerationStructure>,
}

impl DeviceTables {
    fn new() -> Self {
        Self {
            render_passes: ResourceTable::new("render pass"),
            framebuffers: ResourceTable::new("framebuffer"),
            shaders: ResourceTable::new("shader"),
            pipelines: ResourceTable::new("pipeline"),
            buffers: ResourceTable::new("buffer"),
            multi_buffers: ResourceTable::new("multi-buffer"),
            images: ResourceTable::new("image"),
            samplers: ResourceTable::new("sampler"),
            descriptor_set_layouts: ResourceTable::new("descriptor set layout"),
            descriptor_pools: ResourceTable::new("descriptor pool"),
            query_pools: ResourceTable::new("query pool"),
            blas: ResourceTable::new("BLAS"),
            tlas: ResourceTable::new("TLAS"),
        }
    }
}

struct SwapchainState {
    swapchain: Option<Swapchain>,
    acquired: Option<u32>,
    stale: bool,
    present_mode: vk::PresentModeKHR,
    desired_extent: vk::Extent2D,
}

struct Candidate {
    physical_device: vk::PhysicalDevice,
    score: i32,
    family_caps: Vec<(QueueCaps, u32)>,
    supports_ray_tracing: bool,
}

/// Top-level owner of the GPU: logical device, queues, frame ring, object
/// tables, allocator, and the swapchain.
pub struct GraphicsDevice {
    instance: Arc<Instance>,
    physical_device: vk::PhysicalDevice,
    device_name: String,
    device: ash::Device,
    queues: QueueRegistry,
    allocator: Mutex<GpuAllocator>,
    tables: DeviceTables,
    ring: FrameRing,
    frame_index: AtomicU64,
    independent_lists: Mutex<Vec<Arc<CommandList>>>,
    surface: Option<Surface>,
    swapchain_loader: Option<ash::khr::swapchain::Device>,
    accel_loader: Option<ash::khr::acceleration_structure::Device>,
    swapchain: Mutex<SwapchainState>,
    worker: SubmitWorker,
    idle_lock: Mutex<()>,
    weak_self: Weak<GraphicsDevice>,
}

impl Instance {
    /// Bootstrap entry point: select a physical device and create the
    /// graphics device, optionally bound to a presentable surface.
    pub fn initialize_graphics_device(
        self: &Arc<Self>,
        surface: Option<Surface>,
    ) -> Result<Arc<GraphicsDevice>> {
        GraphicsDevice::new(self.clone(), surface)
    }
}

impl GraphicsDevice {
    /// Select the best physical device and create the logical device.
    pub fn new(instance: Arc<Instance>, surface: Option<Surface>) -> Result<Arc<Self>> {
        let candidate = Self::select_physical_device(&instance, surface.as_ref())?;
        let physical_device = candidate.physical_device;

        let properties =
            unsafe { instance.handle().get_physical_device_properties(physical_device) };
        let device_name = unsafe { CStr::from_ptr(properties.device_name.as_ptr()) }
            .to_string_lossy()
            .into_owned();
        tracing::info!(device = %device_name, score = candidate.score, "selected GPU");

        let mut queues =
            QueueRegistry::new(&candidate.family_caps).ok_or(GpuError::NoSuitableDevice)?;

        let device = unsafe {
            Self::create_logical_device(
                &instance,
                physical_device,
                &queues,
                surface.is_some(),
                candidate.supports_ray_tracing,
            )?
        };
        unsafe { queues.attach_device(&device) };

        let allocator =
            unsafe { GpuAllocator::new(instance.handle(), device.clone(), physical_device)? };
        let ring = unsafe { FrameRing::new(&device)? };

        let swapchain_loader = surface
            .as_ref()
            .map(|_| ash::khr::swapchain::Device::new(instance.handle(), &device));
        let accel_loader = candidate.supports_ray_tracing.then(|| {
            ash::khr::acceleration_structure::Device::new(instance.handle(), &device)
        });

        Ok(Arc::new_cyclic(|weak| Self {
            instance,
            physical_device,
            device_name,
            device,
            queues,
            allocator: Mutex::new(allocator),
            tables: DeviceTables::new(),
            ring,
            frame_index: AtomicU64::new(0),
            independent_lists: Mutex::new(Vec::new()),
            surface,
            swapchain_loader,
            accel_loader,
            swapchain: Mutex::new(SwapchainState {
                swapchain: None,
                acquired: None,
                stale: false,
                present_mode: vk::PresentModeKHR::FIFO,
                desired_extent: vk::Extent2D::default(),
            }),
            worker: SubmitWorker::new(),
            idle_lock: Mutex::new(()),
            weak_self: weak.clone(),
        }))
    }

    fn select_physical_device(
        instance: &Arc<Instance>,
        surface: Option<&Surface>,
    ) -> Result<Candidate> {
        let devices = unsafe { instance.handle().enumerate_physical_devices()? };
        if devices.is_empty() {
            return Err(GpuError::NoSuitableDevice);
        }

        let mut best: Option<Candidate> = None;
        for physical_device in devices {
            let candidate = Self::evaluate_physical_device(instance, physical_device, surface);
            if candidate.score > best.as_ref().map_or(0, |b| b.score) {
                best = Some(candidate);
            }
        }

        best.ok_or(GpuError::NoSuitableDevice)
    }

    fn evaluate_physical_device(
        instance: &Arc<Instance>,
        physical_device: vk::PhysicalDevice,
        surface: Option<&Surface>,
    ) -> Candidate {
        let handle = instance.handle();
        let properties = unsafe { handle.get_physical_device_properties(physical_device) };
        let features = unsafe { handle.get_physical_device_features(physical_device) };
        let family_properties =
            unsafe { handle.get_physical_device_queue_family_properties(physical_device) };

        let family_caps: Vec<(QueueCaps, u32)> = family_properties
            .iter()
            .enumerate()
            .map(|(index, family)| {
                // With no presentation engine around, every graphics family
                // counts as present-capable so the three-way assignment
                // still resolves.
                let present = surface.map_or(
                    family.queue_flags.contains(vk::QueueFlags::GRAPHICS),
                    |s| s.supports_family(physical_device, index as u32),
                );
                (
                    QueueCaps::from_vk(family.queue_flags, present),
                    family.queue_count,
                )
            })
            .collect();

        let caps_only: Vec<QueueCaps> = family_caps.iter().map(|(c, _)| *c).collect();
        let queues_complete = assign_queue_families(&caps_only).is_some();

        let extension_properties = unsafe {
            handle
                .enumerate_device_extension_properties(physical_device)
                .unwrap_or_default()
        };
        let has_extension = |name: &CStr| {
            extension_properties
                .iter()
                .any(|props| unsafe { CStr::from_ptr(props.extension_name.as_ptr()) } == name)
        };

        let extensions_supported =
            surface.is_none() || has_extension(ash::khr::swapchain::NAME);
        let supports_ray_tracing = has_extension(ash::khr::acceleration_structure::NAME)
            && has_extension(ash::khr::deferred_host_operations::NAME);

        let swapchain_adequate = surface.map_or(true, |s| {
            s.swapchain_support(physical_device)
                .map(|support| support.is_adequate())
                .unwrap_or(false)
        });

        let score = rate_device(&DeviceRating {
            device_type: properties.device_type,
            max_image_dimension_2d: properties.limits.max_image_dimension2_d,
            queues_complete,
            extensions_supported,
            swapchain_adequate,
            supports_anisotropy: features.sampler_anisotropy == vk::TRUE,
        });

        Candidate {
            physical_device,
            score,
            family_caps,
            supports_ray_tracing,
        }
    }

    unsafe fn create_logical_device(
        instance: &Arc<Instance>,
        physical_device: vk::PhysicalDevice,
        queues: &QueueRegistry,
        windowed: bool,
        ray_tracing: bool,
    ) -> Result<ash::Device> {
        let assigned = queues.unique_assigned_families();
        let priorities: Vec<Vec<f32>> = assigned
            .iter()
            .map(|&(_, count)| vec![1.0_f32; count as usize])
            .collect();
        let queue_create_infos: Vec<vk::DeviceQueueCreateInfo> = assigned
            .iter()
            .zip(&priorities)
            .map(|(&(family, _), priorities)| {
                vk::DeviceQueueCreateInfo::default()
                    .queue_family_index(family)
                    .queue_priorities(priorities)
            })
            .collect();

        let mut extensions: Vec<*const i8> = Vec::new();
        if windowed {
            extensions.push(ash::khr::swapchain::NAME.as_ptr());
        }
        if ray_tracing {
            extensions.push(ash::khr::acceleration_structure::NAME.as_ptr());
            extensions.push(ash::khr::deferred_host_operations::NAME.as_ptr());
        }

        let features = vk::PhysicalDeviceFeatures::default().sampler_anisotropy(true);

        let mut vulkan_1_2_features = vk::PhysicalDeviceVulkan12Features::default()
            .buffer_device_address(true)
            .descriptor_indexing(true);
        let mut vulkan_1_3_features = vk::PhysicalDeviceVulkan13Features::default()
            .synchronization2(true)
            .maintenance4(true);
        let mut accel_features =
            vk::PhysicalDeviceAccelerationStructureFeaturesKHR::default()
                .acceleration_structure(true);

        let mut features2 = vk::PhysicalDeviceFeatures2::default()
            .features(features)
            .push_next(&mut vulkan_1_2_features)
            .push_next(&mut vulkan_1_3_features);
        if ray_tracing {
            features2 = features2.push_next(&mut accel_features);
        }

        let create_info = vk::DeviceCreateInfo::default()
            .queue_create_infos(&queue_create_infos)
            .enabled_extension_names(&extensions)
            .push_next(&mut features2);

        let device = unsafe {
            instance
                .handle()
                .create_device(physical_device, &create_info, None)?
        };
        Ok(device)
    }

    /// The logical device handle.
    pub fn device(&self) -> &ash::Device {
        &self.device
    }

    /// The selected physical device.
    pub fn physical_device(&self) -> vk::PhysicalDevice {
        self.physical_device
    }

    /// Marketing name of the selected GPU.
    pub fn device_name(&self) -> &str {
        &self.device_name
    }

    /// The monotonically increasing frame counter.
    pub fn frame_index(&self) -> u64 {
        self.frame_index.load(Ordering::Acquire)
    }

    /// The family index serving a queue type.
    pub fn queue_family(&self, queue_type: QueueType) -> u32 {
        self.queues.assignment().family_for(queue_type)
    }

    /// Whether acceleration structure creation is available.
    pub fn supports_ray_tracing(&self) -> bool {
        self.accel_loader.is_some()
    }

    // ---- command lists ------------------------------------------------

    /// Check out a command list for the given queue type.
    ///
    /// Per-frame lists are pooled in the current frame ring slot,
    /// frame-independent lists in a device-global pool. The returned list is
    /// exclusively claimed until it is flushed (frame-independent) or its
    /// slot retires (per-frame).
    pub fn command_list(
        &self,
        queue_type: QueueType,
        frame_independent: bool,
    ) -> Result<Arc<CommandList>> {
        let family_index = self.queues.assignment().family_for(queue_type);

        if frame_independent {
            let mut pool = self.independent_lists.lock();
            if let Some(list) = claim_matching(&pool, queue_type, frame_independent) {
                return Ok(list);
            }
            let list = unsafe {
                CommandList::new(&self.device, queue_type, family_index, frame_independent)?
            };
            pool.push(list.clone());
            Ok(list)
        } else {
            let slot = self.ring.slot(self.frame_index.load(Ordering::Acquire));
            let mut state = slot.state.lock();
            if let Some(list) = claim_matching(&state.lists, queue_type, frame_independent) {
                return Ok(list);
            }
            let list = unsafe {
                CommandList::new(&self.device, queue_type, family_index, frame_independent)?
            };
            state.lists.push(list.clone());
            Ok(list)
        }
    }

    /// Queue a per-frame command list for submission at frame end.
    ///
    /// Panics on double submission, on frame-independent lists, and while
    /// the swapchain is stale; all three are programmer-contract violations.
    pub fn submit(&self, cmd: &Arc<CommandList>, wait_stage: vk::PipelineStageFlags) {
        assert!(
            !cmd.is_frame_independent(),
            "frame-independent command lists are flushed, not submitted"
        );
        {
            let state = self.swapchain.lock();
            assert!(
                state.swapchain.is_none() || !state.stale,
                "submission while the swapchain is awaiting recreation"
            );
        }

        let slot = self.ring.slot(self.frame_index.load(Ordering::Acquire));
        let mut state = slot.state.lock();
        // The slot mutex serializes concurrent submitters, so the
        // double-submit check is race-free here.
        assert!(!cmd.is_submitted(), "command list was already submitted");
        cmd.mark_submitted();
        state.submissions.push(Submission {
            list: cmd.clone(),
            wait_stage,
        });
    }

    /// Submit a frame-independent list synchronously and block until its GPU
    /// work completes. Used for setup work that must finish before the
    /// caller proceeds.
    pub fn flush(&self, cmd: &Arc<CommandList>) -> Result<()> {
        assert!(
            cmd.is_frame_independent(),
            "per-frame command lists are submitted, not flushed"
        );

        let queue_ref = self.queues.lock_family_queue(cmd.family_index());
        let buffers = [cmd.handle()];
        let submit_info = vk::SubmitInfo::default().command_buffers(&buffers);
        unsafe {
            self.device
                .queue_submit(queue_ref.handle(), &[submit_info], cmd.fence())?;
            self.device
                .wait_for_fences(&[cmd.fence()], true, GPU_WAIT_TIMEOUT_NS)
                .map_err(|err| match err {
                    vk::Result::TIMEOUT => GpuError::Timeout("command list flush"),
                    other => GpuError::Vulkan(other),
                })?;
            self.device.reset_fences(&[cmd.fence()])?;
        }
        drop(queue_ref);
        cmd.release_claim();
        Ok(())
    }

    // ---- frame loop ---------------------------------------------------

    /// Submit the current frame: order the recorded submissions, chain their
    /// semaphores, present, reclaim matured resources, and advance the ring.
    pub fn submit_frame(&self) -> Result<()> {
        let frame_index = self.frame_index.load(Ordering::Acquire);
        let slot = self.ring.slot(frame_index);

        // A present must always have a submission-signaled semaphore to wait
        // on; synthesize an empty pass when nothing touched the swapchain.
        let need_noop = {
            let sc_state = self.swapchain.lock();
            sc_state.swapchain.is_some()
                && !sc_state.stale
                && sc_state.acquired.is_some()
                && !slot
                    .state
                    .lock()
                    .lists
                    .iter()
                    .any(|list| list.touched_swapchain())
        };
        if need_noop {
            let cmd = self.command_list(QueueType::Graphics, false)?;
            unsafe {
                cmd.begin(&self.device)?;
                {
                    let sc_state = self.swapchain.lock();
                    let swapchain = sc_state.swapchain.as_ref().expect("checked above");
                    let image = sc_state.acquired.expect("checked above");
                    cmd.begin_swapchain_pass(&self.device, swapchain, image)?;
                }
                cmd.end_render_pass(&self.device);
                cmd.end(&self.device)?;
            }
            self.submit(&cmd, vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT);
        }

        // Close the frame: everything handed out this slot must have been
        // submitted.
        let submissions: Vec<(Arc<CommandList>, vk::PipelineStageFlags)> = {
            let state = slot.state.lock();
            for list in &state.lists {
                assert!(
                    list.is_submitted(),
                    "a command list checked out this frame was never submitted; \
                     use a frame-independent list for work spanning frames"
                );
            }
            state
                .submissions
                .iter()
                .map(|s| (s.list.clone(), s.wait_stage))
                .collect()
        };

        // Gate the next slot before anything can record into it. This is the
        // backpressure bounding frames in flight.
        let next_slot = self.ring.slot(frame_index + 1);
        unsafe { next_slot.wait_and_begin_reuse(&self.device)? };

        // Submit in recorded order along the semaphore chain.
        let acquire_semaphore = {
            let sc_state = self.swapchain.lock();
            sc_state
                .acquired
                .map(|_| *slot.acquire_semaphore.lock())
        };
        let requests: Vec<SubmitRequest> = submissions
            .iter()
            .map(|(list, wait_stage)| SubmitRequest {
                family: list.family_index(),
                semaphore: list.semaphore(),
                wait_stage: *wait_stage,
                dependencies: list.dependencies(),
            })
            .collect();
        let planned = plan_chain(&requests, acquire_semaphore);

        unsafe { self.execute_chain(&submissions, &planned, slot.fence)? };
        slot.mark_in_flight();

        let handoff = planned.last().map(|p| p.signal);
        if let Some(handoff) = handoff {
            *slot.handoff_semaphore.lock() = handoff;
        }

        // Present, absorbing staleness.
        {
            let mut sc_state = self.swapchain.lock();
            if let (Some(swapchain), Some(image), Some(handoff)) =
                (&sc_state.swapchain, sc_state.acquired, handoff)
            {
                if !sc_state.stale {
                    let loader = self.swapchain_loader.as_ref().expect("windowed device");
                    let queue_ref = self.queues.lock_queue(QueueType::Present);
                    let wait = [handoff];
                    let suboptimal = unsafe {
                        swapchain.present(loader, queue_ref.handle(), image, &wait)?
                    };
                    sc_state.acquired = None;
                    if suboptimal {
                        sc_state.stale = true;
                    }
                }
            }
        }

        // Reclaim matured resources and advance the frame.
        self.sweep_tables(frame_index);
        let new_frame = frame_index + 1;
        self.frame_index.store(new_frame, Ordering::Release);
        self.tables.multi_buffers.for_each_mut(|mb| mb.advance());

        // Acquire the next image; failure schedules recreation.
        {
            let mut sc_state = self.swapchain.lock();
            if sc_state.swapchain.is_some() && !sc_state.stale {
                let loader = self.swapchain_loader.as_ref().expect("windowed device");
                let semaphore = *self.ring.slot(new_frame).acquire_semaphore.lock();
                let swapchain = sc_state.swapchain.as_ref().expect("checked above");
                match unsafe { swapchain.acquire_next_image(loader, semaphore) } {
                    Ok((index, suboptimal)) => {
                        sc_state.acquired = Some(index);
                        if suboptimal {
                            sc_state.stale = true;
                        }
                    }
                    Err(GpuError::Vulkan(vk::Result::ERROR_OUT_OF_DATE_KHR)) => {
                        sc_state.acquired = None;
                        sc_state.stale = true;
                    }
                    Err(err) => return Err(err),
                }
            }
        }

        // Recreation gate.
        let needs_recreation = {
            let sc_state = self.swapchain.lock();
            sc_state.stale && sc_state.swapchain.is_some()
        };
        if needs_recreation {
            self.recreate_swapchain_now()?;
        }

        if cfg!(debug_assertions) {
            if let Some(message) = self.instance.take_validation_error() {
                return Err(GpuError::Validation(message));
            }
        }

        Ok(())
    }

    /// Run [`Self::submit_frame`] on the dedicated submission worker.
    ///
    /// The caller must [`Self::wait_for_previous_submission`] before touching
    /// frame ring state again; recording CPU-side work for the next frame may
    /// proceed in the meantime.
    pub fn submit_frame_async(&self) -> Result<()> {
        self.worker.wait_idle()?;
        let device = self
            .weak_self
            .upgrade()
            .expect("device is alive while a method runs on it");
        self.worker.schedule(Box::new(move || device.submit_frame()));
        Ok(())
    }

    /// Block until the in-flight asynchronous frame submission completes.
    pub fn wait_for_previous_submission(&self) -> Result<()> {
        self.worker.wait_idle()
    }

    unsafe fn execute_chain(
        &self,
        submissions: &[(Arc<CommandList>, vk::PipelineStageFlags)],
        planned: &[crate::submit::PlannedSubmit],
        fence: vk::Fence,
    ) -> Result<()> {
        if planned.is_empty() {
            // Nothing recorded this frame; the slot fence still has to
            // signal so the ring can be reused.
            let queue_ref = self.queues.lock_queue(QueueType::Graphics);
            unsafe { self.device.queue_submit(queue_ref.handle(), &[], fence)? };
            return Ok(());
        }

        // Hold the queue lock across consecutive submissions to the same
        // family to reduce lock churn.
        let mut queue_ref: Option<QueueRef> = None;
        for (i, plan) in planned.iter().enumerate() {
            let reuse = queue_ref
                .as_ref()
                .is_some_and(|q| q.family_index() == plan.family);
            if !reuse {
                queue_ref = Some(self.queues.lock_family_queue(plan.family));
            }
            let queue = queue_ref.as_ref().expect("just resolved");

            let buffers = [submissions[i].0.handle()];
            let signal = [plan.signal];
            let submit_info = vk::SubmitInfo::default()
                .command_buffers(&buffers)
                .wait_semaphores(&plan.wait_semaphores)
                .wait_dst_stage_mask(&plan.wait_stages)
                .signal_semaphores(&signal);

            let submit_fence = if i + 1 == planned.len() {
                fence
            } else {
                vk::Fence::null()
            };
            unsafe {
                self.device
                    .queue_submit(queue.handle(), &[submit_info], submit_fence)?;
            }
        }

        Ok(())
    }

    // ---- swapchain ----------------------------------------------------

    /// Create (or recreate) the swapchain and acquire its first image so the
    /// render loop always has a valid target at frame start.
    pub fn create_swapchain(
        &self,
        present_mode: vk::PresentModeKHR,
        width: u32,
        height: u32,
    ) -> Result<()> {
        self.worker.wait_idle()?;
        {
            let mut sc_state = self.swapchain.lock();
            sc_state.present_mode = present_mode;
            sc_state.desired_extent = vk::Extent2D { width, height };
        }
        self.recreate_swapchain_now()
    }

    /// Note a window resize; the swapchain is recreated at the next frame
    /// boundary.
    pub fn notify_resize(&self, width: u32, height: u32) {
        let mut sc_state = self.swapchain.lock();
        sc_state.desired_extent = vk::Extent2D { width, height };
        if sc_state.swapchain.is_some() {
            sc_state.stale = true;
        }
    }

    /// Recreate the swapchain in place. Runs on whichever thread holds the
    /// frame (the worker during a frame, the caller at bootstrap), so it
    /// must not wait on the worker.
    fn recreate_swapchain_now(&self) -> Result<()> {
        let surface = self
            .surface
            .as_ref()
            .ok_or_else(|| GpuError::InvalidState("device has no surface".to_string()))?;
        let loader = self.swapchain_loader.as_ref().expect("windowed device");

        self.device_wait_idle()?;
        unsafe {
            self.ring.reset_after_idle(&self.device)?;
            // Semaphores from the dead present chain must not be reused.
            self.ring.recreate_semaphores(&self.device)?;
        }

        let support = surface.swapchain_support(self.physical_device)?;
        if !support.is_adequate() {
            return Err(GpuError::SwapchainCreation(
                "surface reports no formats or present modes".to_string(),
            ));
        }

        let mut sc_state = self.swapchain.lock();
        if let Some(old) = sc_state.swapchain.take() {
            unsafe { old.destroy(&self.device, loader) };
        }

        let extent = calculate_extent(
            &support.capabilities,
            sc_state.desired_extent.width,
            sc_state.desired_extent.height,
        );
        let swapchain = unsafe {
            Swapchain::new(
                &self.device,
                loader,
                surface.handle,
                &support,
                sc_state.present_mode,
                extent,
                None,
                self.queues.assignment().present,
            )?
        };

        let frame = self.frame_index.load(Ordering::Acquire);
        let semaphore = *self.ring.slot(frame).acquire_semaphore.lock();
        match unsafe { swapchain.acquire_next_image(loader, semaphore) } {
            Ok((index, suboptimal)) => {
                sc_state.acquired = Some(index);
                sc_state.stale = suboptimal;
            }
            Err(GpuError::Vulkan(vk::Result::ERROR_OUT_OF_DATE_KHR)) => {
                sc_state.acquired = None;
                sc_state.stale = true;
            }
            Err(err) => return Err(err),
        }
        sc_state.swapchain = Some(swapchain);

        tracing::debug!(width = extent.width, height = extent.height, "swapchain created");
        Ok(())
    }

    // ---- idle and cleanup ---------------------------------------------

    /// Wait for the previous async frame, then block until the device has no
    /// outstanding work.
    pub fn wait_for_idle(&self) -> Result<()> {
        self.worker.wait_idle()?;
        self.device_wait_idle()
    }

    fn device_wait_idle(&self) -> Result<()> {
        let _guard = self.idle_lock.lock();
        unsafe { self.device.device_wait_idle()? };
        Ok(())
    }

    /// Destroy all pending retired objects immediately, independent of the
    /// frame-paced reclamation cadence. Used before large scene reloads.
    pub fn force_memory_cleanup(&self) -> Result<()> {
        self.wait_for_idle()?;
        self.drain_pending_tables();
        Ok(())
    }

    fn sweep_tables(&self, frame: u64) {
        let device = &self.device;
        self.tables
            .pipelines
            .sweep(frame, |p| unsafe { p.destroy(device) });
        self.tables
            .framebuffers
            .sweep(frame, |f| unsafe { f.destroy(device) });
        self.tables
            .render_passes
            .sweep(frame, |r| unsafe { r.destroy(device) });
        self.tables
            .shaders
            .sweep(frame, |s| unsafe { s.destroy(device) });
        self.tables
            .samplers
            .sweep(frame, |s| unsafe { s.destroy(device) });
        self.tables
            .descriptor_pools
            .sweep(frame, |p| unsafe { p.destroy(device) });
        self.tables
            .descriptor_set_layouts
            .sweep(frame, |l| unsafe { l.destroy(device) });
        self.tables
            .query_pools
            .sweep(frame, |q| unsafe { q.destroy(device) });

        let mut allocator = self.allocator.lock();
        self.tables.buffers.sweep(frame, |b| allocator.free_buffer(b));
        self.tables.multi_buffers.sweep(frame, |mb| {
            for buffer in mb.buffers {
                allocator.free_buffer(buffer);
            }
        });
        self.tables.images.sweep(frame, |i| allocator.free_image(i));

        if let Some(loader) = &self.accel_loader {
            let mut free_accel = |a: AccelerationStructure| {
                unsafe { loader.destroy_acceleration_structure(a.handle, None) };
                allocator.free_buffer(a.buffer);
            };
            self.tables.tlas.sweep(frame, &mut free_accel);
            self.tables.blas.sweep(frame, &mut free_accel);
        }
    }

    fn drain_pending_tables(&self) {
        let device = &self.device;
        self.tables
            .pipelines
            .drain_pending(|p| unsafe { p.destroy(device) });
        self.tables
            .framebuffers
            .drain_pending(|f| unsafe { f.destroy(device) });
        self.tables
            .render_passes
            .drain_pending(|r| unsafe { r.destroy(device) });
        self.tables
            .shaders
            .drain_pending(|s| unsafe { s.destroy(device) });
        self.tables
            .samplers
            .drain_pending(|s| unsafe { s.destroy(device) });
        self.tables
            .descriptor_pools
            .drain_pending(|p| unsafe { p.destroy(device) });
        self.tables
            .descriptor_set_layouts
            .drain_pending(|l| unsafe { l.destroy(device) });
        self.tables
            .query_pools
            .drain_pending(|q| unsafe { q.destroy(device) });

        let mut allocator = self.allocator.lock();
        self.tables.buffers.drain_pending(|b| allocator.free_buffer(b));
        self.tables.multi_buffers.drain_pending(|mb| {
            for buffer in mb.buffers {
                allocator.free_buffer(buffer);
            }
        });
        self.tables.images.drain_pending(|i| allocator.free_image(i));

        if let Some(loader) = &self.accel_loader {
            let mut free_accel = |a: AccelerationStructure| {
                unsafe { loader.destroy_acceleration_structure(a.handle, None) };
                allocator.free_buffer(a.buffer);
            };
            self.tables.tlas.drain_pending(&mut free_accel);
            self.tables.blas.drain_pending(&mut free_accel);
        }
    }

    // ---- object factories ---------------------------------------------

    fn retire_frame(&self) -> u64 {
        self.frame_index.load(Ordering::Acquire) + FRAMES_IN_FLIGHT as u64
    }

    pub fn create_render_pass(&self, desc: &RenderPassDesc) -> Result<Handle<RenderPass>> {
        let pass = unsafe { RenderPass::new(&self.device, desc)? };
        Ok(self.tables.render_passes.insert(pass))
    }

    pub fn destroy_render_pass(&self, handle: Handle<RenderPass>) {
        self.tables.render_passes.retire(handle, self.retire_frame());
    }

    pub fn create_framebuffer(&self, desc: &FramebufferDesc) -> Result<Handle<Framebuffer>> {
        let render_pass = self
            .tables
            .render_passes
            .with(desc.render_pass, |rp| rp.handle())
            .ok_or_else(|| GpuError::InvalidState("stale render pass handle".to_string()))?;
        let framebuffer = unsafe { Framebuffer::new(&self.device, render_pass, desc)? };
        Ok(self.tables.framebuffers.insert(framebuffer))
    }

    pub fn destroy_framebuffer(&self, handle: Handle<Framebuffer>) {
        self.tables.framebuffers.retire(handle, self.retire_frame());
    }

    pub fn create_shader(&self, desc: &ShaderDesc) -> Result<Handle<Shader>> {
        let shader = unsafe { Shader::new(&self.device, desc)? };
        Ok(self.tables.shaders.insert(shader))
    }

    pub fn destroy_shader(&self, handle: Handle<Shader>) {
        self.tables.shaders.retire(handle, self.retire_frame());
    }

    pub fn create_graphics_pipeline(
        &self,
        desc: &GraphicsPipelineDesc,
    ) -> Result<Handle<Pipeline>> {
        let stale = || GpuError::InvalidState("stale handle in pipeline descriptor".to_string());
        let vertex = self
            .tables
            .shaders
            .with(desc.vertex_shader, |s| s.module)
            .ok_or_else(stale)?;
        let fragment = self
            .tables
            .shaders
            .with(desc.fragment_shader, |s| s.module)
            .ok_or_else(stale)?;
        let (render_pass, color_count) = self
            .tables
            .render_passes
            .with(desc.render_pass, |rp| (rp.handle(), rp.color_count))
            .ok_or_else(stale)?;
        let set_layouts = self.resolve_set_layouts(&desc.set_layouts)?;

        let pipeline = unsafe {
            Pipeline::graphics(
                &self.device,
                vertex,
                fragment,
                render_pass,
                color_count,
                &set_layouts,
                desc,
            )?
        };
        Ok(self.tables.pipelines.insert(pipeline))
    }

    pub fn create_compute_pipeline(&self, desc: &ComputePipelineDesc) -> Result<Handle<Pipeline>> {
        let module = self
            .tables
            .shaders
            .with(desc.shader, |s| s.module)
            .ok_or_else(|| GpuError::InvalidState("stale shader handle".to_string()))?;
        let set_layouts = self.resolve_set_layouts(&desc.set_layouts)?;

        let pipeline = unsafe {
            Pipeline::compute(&self.device, module, &set_layouts, desc.push_constant_size)?
        };
        Ok(self.tables.pipelines.insert(pipeline))
    }

    pub fn destroy_pipeline(&self, handle: Handle<Pipeline>) {
        self.tables.pipelines.retire(handle, self.retire_frame());
    }

    fn resolve_set_layouts(
        &self,
        handles: &[Handle<DescriptorSetLayout>],
    ) -> Result<Vec<vk::DescriptorSetLayout>> {
        handles
            .iter()
            .map(|&handle| {
                self.tables
                    .descriptor_set_layouts
                    .with(handle, |l| l.handle())
                    .ok_or_else(|| {
                        GpuError::InvalidState("stale descriptor set layout handle".to_string())
                    })
            })
            .collect()
    }

    pub fn create_buffer(
        &self,
        size: u64,
        usage: vk::BufferUsageFlags,
        location: MemoryLocation,
        name: &str,
    ) -> Result<Handle<Buffer>> {
        let buffer = self.allocator.lock().create_buffer(size, usage, location, name)?;
        Ok(self.tables.buffers.insert(buffer))
    }

    pub fn destroy_buffer(&self, handle: Handle<Buffer>) {
        self.tables.buffers.retire(handle, self.retire_frame());
    }

    /// Create a buffer multi-buffered across the frame ring; writes target
    /// the copy belonging to the current frame.
    pub fn create_multi_buffer(
        &self,
        size: u64,
        usage: vk::BufferUsageFlags,
        location: MemoryLocation,
        name: &str,
    ) -> Result<Handle<MultiBuffer>> {
        let mut allocator = self.allocator.lock();
        let mut buffers = Vec::with_capacity(FRAMES_IN_FLIGHT);
        for _ in 0..FRAMES_IN_FLIGHT {
            buffers.push(allocator.create_buffer(size, usage, location, name)?);
        }
        Ok(self.tables.multi_buffers.insert(MultiBuffer::new(buffers)))
    }

    pub fn destroy_multi_buffer(&self, handle: Handle<MultiBuffer>) {
        self.tables.multi_buffers.retire(handle, self.retire_frame());
    }

    pub fn create_image(&self, desc: &ImageDesc) -> Result<Handle<Image>> {
        let create_info = vk::ImageCreateInfo::default()
            .image_type(vk::ImageType::TYPE_2D)
            .format(desc.format)
            .extent(vk::Extent3D {
                width: desc.width,
                height: desc.height,
                depth: 1,
            })
            .mip_levels(desc.mip_levels)
            .array_layers(1)
            .samples(vk::SampleCountFlags::TYPE_1)
            .tiling(vk::ImageTiling::OPTIMAL)
            .usage(desc.usage)
            .sharing_mode(vk::SharingMode::EXCLUSIVE)
            .initial_layout(vk::ImageLayout::UNDEFINED);

        let image = self.allocator.lock().create_image(
            &create_info,
            desc.aspect,
            MemoryLocation::GpuOnly,
            &desc.name,
        )?;
        Ok(self.tables.images.insert(image))
    }

    pub fn destroy_image(&self, handle: Handle<Image>) {
        self.tables.images.retire(handle, self.retire_frame());
    }

    pub fn create_sampler(&self, desc: &SamplerDesc) -> Result<Handle<Sampler>> {
        let sampler = unsafe { Sampler::new(&self.device, desc)? };
        Ok(self.tables.samplers.insert(sampler))
    }

    pub fn destroy_sampler(&self, handle: Handle<Sampler>) {
        self.tables.samplers.retire(handle, self.retire_frame());
    }

    pub fn create_descriptor_set_layout(
        &self,
        desc: &DescriptorSetLayoutDesc,
    ) -> Result<Handle<DescriptorSetLayout>> {
        let layout = unsafe { DescriptorSetLayout::new(&self.device, desc)? };
        Ok(self.tables.descriptor_set_layouts.insert(layout))
    }

    pub fn destroy_descriptor_set_layout(&self, handle: Handle<DescriptorSetLayout>) {
        self.tables
            .descriptor_set_layouts
            .retire(handle, self.retire_frame());
    }

    pub fn create_descriptor_pool(
        &self,
        desc: &DescriptorPoolDesc,
    ) -> Result<Handle<DescriptorPool>> {
        let pool = unsafe { DescriptorPool::new(&self.device, desc)? };
        Ok(self.tables.descriptor_pools.insert(pool))
    }

    pub fn destroy_descriptor_pool(&self, handle: Handle<DescriptorPool>) {
        self.tables
            .descriptor_pools
            .retire(handle, self.retire_frame());
    }

    pub fn create_query_pool(&self, desc: &QueryPoolDesc) -> Result<Handle<QueryPool>> {
        let pool = unsafe { QueryPool::new(&self.device, desc)? };
        Ok(self.tables.query_pools.insert(pool))
    }

    pub fn destroy_query_pool(&self, handle: Handle<QueryPool>) {
        self.tables.query_pools.retire(handle, self.retire_frame());
    }

    pub fn create_blas(
        &self,
        desc: &AccelerationStructureDesc,
    ) -> Result<Handle<AccelerationStructure>> {
        let blas = self.create_acceleration_structure(
            desc,
            vk::AccelerationStructureTypeKHR::BOTTOM_LEVEL,
        )?;
        Ok(self.tables.blas.insert(blas))
    }

    pub fn destroy_blas(&self, handle: Handle<AccelerationStructure>) {
        self.tables.blas.retire(handle, self.retire_frame());
    }

    pub fn create_tlas(
        &self,
        desc: &AccelerationStructureDesc,
    ) -> Result<Handle<AccelerationStructure>> {
        let tlas = self
            .create_acceleration_structure(desc, vk::AccelerationStructureTypeKHR::TOP_LEVEL)?;
        Ok(self.tables.tlas.insert(tlas))
    }

    pub fn destroy_tlas(&self, handle: Handle<AccelerationStructure>) {
        self.tables.tlas.retire(handle, self.retire_frame());
    }

    fn create_acceleration_structure(
        &self,
        desc: &AccelerationStructureDesc,
        level: vk::AccelerationStructureTypeKHR,
    ) -> Result<AccelerationStructure> {
        let loader = self.accel_loader.as_ref().ok_or_else(|| {
            GpuError::ExtensionNotSupported("VK_KHR_acceleration_structure".to_string())
        })?;

        let buffer = self.allocator.lock().create_buffer(
            desc.size,
            vk::BufferUsageFlags::ACCELERATION_STRUCTURE_STORAGE_KHR
                | vk::BufferUsageFlags::SHADER_DEVICE_ADDRESS,
            MemoryLocation::GpuOnly,
            "acceleration structure",
        )?;

        unsafe { AccelerationStructure::new(loader, buffer, level, desc.size) }
    }

    /// Run `f` against a buffer behind its handle.
    pub fn with_buffer<R>(&self, handle: Handle<Buffer>, f: impl FnOnce(&Buffer) -> R) -> Option<R> {
        self.tables.buffers.with(handle, f)
    }

    /// Run `f` against a multi-buffer behind its handle.
    pub fn with_multi_buffer<R>(
        &self,
        handle: Handle<MultiBuffer>,
        f: impl FnOnce(&MultiBuffer) -> R,
    ) -> Option<R> {
        self.tables.multi_buffers.with(handle, f)
    }

    // ---- uploads ------------------------------------------------------

    /// Upload data into a device-local buffer through a staging copy on the
    /// transfer queue, blocking until the copy completes.
    pub fn upload_buffer<T: bytemuck::Pod>(
        &self,
        buffer: Handle<Buffer>,
        offset: u64,
        data: &[T],
    ) -> Result<()> {
        let bytes: &[u8] = bytemuck::cast_slice(data);
        let dst = self
            .tables
            .buffers
            .with(buffer, |b| b.buffer)
            .ok_or_else(|| GpuError::InvalidState("stale buffer handle".to_string()))?;

        let staging = self.allocator.lock().create_buffer(
            bytes.len() as u64,
            vk::BufferUsageFlags::TRANSFER_SRC,
            MemoryLocation::CpuToGpu,
            "staging upload",
        )?;
        staging.write_bytes(0, bytes)?;

        let cmd = self.command_list(QueueType::Transfer, true)?;
        let region = vk::BufferCopy {
            src_offset: 0,
            dst_offset: offset,
            size: bytes.len() as u64,
        };
        unsafe {
            cmd.begin(&self.device)?;
            cmd.copy_buffer(&self.device, staging.buffer, dst, region);
            cmd.end(&self.device)?;
        }
        let result = self.flush(&cmd);

        // The flush blocked on the copy, so the staging buffer is free to go.
        self.allocator.lock().free_buffer(staging);
        result
    }
}

impl Drop for GraphicsDevice {
    fn drop(&mut self) {
        if !self.worker.on_worker_thread() {
            let _ = self.worker.wait_idle();
        }

        unsafe {
            let _ = self.device.device_wait_idle();

            // Teardown order: swapchain, frame state, pending destructions,
            // then the tables from most-dependent to least.
            {
                let sc_state = self.swapchain.get_mut();
                if let Some(swapchain) = sc_state.swapchain.take() {
                    let loader = self.swapchain_loader.as_ref().expect("windowed device");
                    swapchain.destroy(&self.device, loader);
                }
            }

            self.ring.destroy(&self.device);
            for list in self.independent_lists.get_mut().iter() {
                list.destroy(&self.device);
            }

            self.drain_pending_tables();

            let device = self.device.clone();
            let accel_loader = self.accel_loader.clone();
            let allocator = self.allocator.get_mut();

            for table in [&self.tables.tlas, &self.tables.blas] {
                table.assert_drained();
                table.drain_all(|a| {
                    if let Some(loader) = &accel_loader {
                        loader.destroy_acceleration_structure(a.handle, None);
                    }
                    allocator.free_buffer(a.buffer);
                });
            }

            self.tables.pipelines.assert_drained();
            self.tables.pipelines.drain_all(|p| p.destroy(&device));
            self.tables.framebuffers.assert_drained();
            self.tables.framebuffers.drain_all(|f| f.destroy(&device));
            self.tables.render_passes.assert_drained();
            self.tables.render_passes.drain_all(|r| r.destroy(&device));
            self.tables.shaders.assert_drained();
            self.tables.shaders.drain_all(|s| s.destroy(&device));

            self.tables.buffers.assert_drained();
            self.tables.buffers.drain_all(|b| allocator.free_buffer(b));
            self.tables.multi_buffers.assert_drained();
            self.tables.multi_buffers.drain_all(|mb| {
                for buffer in mb.buffers {
                    allocator.free_buffer(buffer);
                }
            });
            self.tables.images.assert_drained();
            self.tables.images.drain_all(|i| allocator.free_image(i));

            self.tables.samplers.assert_drained();
            self.tables.samplers.drain_all(|s| s.destroy(&device));
            self.tables.descriptor_pools.assert_drained();
            self.tables
                .descriptor_pools
                .drain_all(|p| p.destroy(&device));
            self.tables.descriptor_set_layouts.assert_drained();
            self.tables
                .descriptor_set_layouts
                .drain_all(|l| l.destroy(&device));
            self.tables.query_pools.assert_drained();
            self.tables.query_pools.drain_all(|q| q.destroy(&device));

            allocator.shutdown();

            if let Some(surface) = &self.surface {
                surface.destroy();
            }
            self.device.destroy_device(None);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn suitable() -> DeviceRating {
        DeviceRating {
            device_type: vk::PhysicalDeviceType::INTEGRATED_GPU,
            max_image_dimension_2d: 4096,
            queues_complete: true,
            extensions_supported: true,
            swapchain_adequate: true,
            supports_anisotropy: true,
        }
    }

    #[test]
    fn discrete_gpu_outranks_larger_integrated() {
        let discrete = DeviceRating {
            device_type: vk::PhysicalDeviceType::DISCRETE_GPU,
            max_image_dimension_2d: 4096,
            ..suitable()
        };
        let integrated = DeviceRating {
            max_image_dimension_2d: 16384,
            ..suitable()
        };
        assert!(rate_device(&discrete) > rate_device(&integrated));
    }

    #[test]
    fn image_dimension_breaks_ties() {
        let small = DeviceRating {
            device_type: vk::PhysicalDeviceType::DISCRETE_GPU,
            max_image_dimension_2d: 8192,
            ..suitable()
        };
        let large = DeviceRating {
            device_type: vk::PhysicalDeviceType::DISCRETE_GPU,
            max_image_dimension_2d: 16384,
            ..suitable()
        };
        assert!(rate_device(&large) > rate_device(&small));
    }

    #[test]
    fn missing_requirements_disqualify() {
        assert!(rate_device(&suitable()) > 0);

        for rating in [
            DeviceRating {
                queues_complete: false,
                ..suitable()
            },
            DeviceRating {
                extensions_supported: false,
                ..suitable()
            },
            DeviceRating {
                swapchain_adequate: false,
                ..suitable()
            },
            DeviceRating {
                supports_anisotropy: false,
                ..suitable()
            },
        ] {
            assert_eq!(rate_device(&rating), 0);
        }
    }
}
