//! Reusable command lists.
//!
//! A [`CommandList`] bundles a command pool, one primary command buffer, and
//! the synchronization objects its submissions signal. Lists are created
//! lazily, claimed through an atomic checkout flag, and reused across frames;
//! the pool never hands the same list to two callers at once.

use crate::error::Result;
use crate::queue::QueueType;
use crate::swapchain::Swapchain;
use ash::vk;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// A command recording object bound to one queue family.
///
/// Frame-independent lists span multiple frames and are flushed
/// synchronously; per-frame lists belong to one frame ring slot and are
/// batched into the frame's submission chain.
pub struct CommandList {
    queue_type: QueueType,
    family_index: u32,
    pool: vk::CommandPool,
    buffer: vk::CommandBuffer,
    fence: vk::Fence,
    semaphore: vk::Semaphore,
    frame_independent: bool,
    claimed: AtomicBool,
    submitted: AtomicBool,
    touches_swapchain: AtomicBool,
    dependencies: Mutex<Vec<vk::Semaphore>>,
}

impl CommandList {
    /// Create a new list bound to the given queue family.
    ///
    /// The list is returned already claimed, matching pool checkout
    /// semantics on the allocation miss path.
    ///
    /// # Safety
    /// The device must be valid and the queue family must exist.
    pub(crate) unsafe fn new(
        device: &ash::Device,
        queue_type: QueueType,
        family_index: u32,
        frame_independent: bool,
    ) -> Result<Arc<Self>> {
        let pool_info = vk::CommandPoolCreateInfo::default().queue_family_index(family_index);
        let pool = unsafe { device.create_command_pool(&pool_info, None)? };

        let alloc_info = vk::CommandBufferAllocateInfo::default()
            .command_pool(pool)
            .level(vk::CommandBufferLevel::PRIMARY)
            .command_buffer_count(1);
        let buffer = unsafe { device.allocate_command_buffers(&alloc_info)?[0] };

        let fence = unsafe { device.create_fence(&vk::FenceCreateInfo::default(), None)? };
        let semaphore =
            unsafe { device.create_semaphore(&vk::SemaphoreCreateInfo::default(), None)? };

        Ok(Arc::new(Self {
            queue_type,
            family_index,
            pool,
            buffer,
            fence,
            semaphore,
            frame_independent,
            claimed: AtomicBool::new(true),
            submitted: AtomicBool::new(false),
            touches_swapchain: AtomicBool::new(false),
            dependencies: Mutex::new(Vec::new()),
        }))
    }

    /// Queue type this list submits to.
    pub fn queue_type(&self) -> QueueType {
        self.queue_type
    }

    /// Queue family this list is bound to.
    pub fn family_index(&self) -> u32 {
        self.family_index
    }

    /// Semaphore signaled when this list's submission completes.
    pub(crate) fn semaphore(&self) -> vk::Semaphore {
        self.semaphore
    }

    /// Private completion fence, used by the synchronous flush path.
    pub(crate) fn fence(&self) -> vk::Fence {
        self.fence
    }

    /// The native command buffer handle.
    pub fn handle(&self) -> vk::CommandBuffer {
        self.buffer
    }

    /// Whether this list outlives a single frame ring slot.
    pub fn is_frame_independent(&self) -> bool {
        self.frame_independent
    }

    /// Whether this list has been handed to the submission queue.
    pub fn is_submitted(&self) -> bool {
        self.submitted.load(Ordering::Acquire)
    }

    pub(crate) fn mark_submitted(&self) {
        self.submitted.store(true, Ordering::Release);
    }

    /// Whether a recorded command touched the swapchain this frame.
    pub(crate) fn touched_swapchain(&self) -> bool {
        self.touches_swapchain.load(Ordering::Acquire)
    }

    /// Record a wait on another list's completion into this list's
    /// submission. Ordering across submissions stays linear; dependencies
    /// only widen one submission's wait set.
    pub fn add_dependency(&self, other: &CommandList) {
        self.dependencies.lock().push(other.semaphore);
    }

    pub(crate) fn dependencies(&self) -> Vec<vk::Semaphore> {
        self.dependencies.lock().clone()
    }

    pub(crate) fn try_claim(&self) -> bool {
        self.claimed
            .compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_ok()
    }

    pub(crate) fn release_claim(&self) {
        self.claimed.store(false, Ordering::Release);
    }

    #[cfg(test)]
    pub(crate) fn is_claimed(&self) -> bool {
        self.claimed.load(Ordering::Acquire)
    }

    /// Reset checkout state when a pooled list is handed out again.
    pub(crate) fn reset_for_reuse(&self) {
        self.submitted.store(false, Ordering::Release);
        self.touches_swapchain.store(false, Ordering::Release);
        self.dependencies.lock().clear();
    }

    /// Begin recording. Resets the backing pool, so the previous contents
    /// must have retired on the GPU.
    ///
    /// # Safety
    /// The device must be valid and the list's prior submission must not be
    /// executing.
    pub unsafe fn begin(&self, device: &ash::Device) -> Result<()> {
        unsafe {
            device.reset_command_pool(self.pool, vk::CommandPoolResetFlags::empty())?;
            let begin_info = vk::CommandBufferBeginInfo::default()
                .flags(vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT);
            device.begin_command_buffer(self.buffer, &begin_info)?;
        }
        Ok(())
    }

    /// End recording.
    ///
    /// # Safety
    /// The device must be valid and recording must have begun.
    pub unsafe fn end(&self, device: &ash::Device) -> Result<()> {
        unsafe { device.end_command_buffer(self.buffer)? };
        Ok(())
    }

    /// Begin the swapchain's presentation render pass on the acquired image.
    ///
    /// # Safety
    /// The device must be valid, recording must have begun, and
    /// `image_index` must be the currently acquired image.
    pub unsafe fn begin_swapchain_pass(
        &self,
        device: &ash::Device,
        swapchain: &Swapchain,
        image_index: u32,
    ) -> Result<()> {
        self.touches_swapchain.store(true, Ordering::Release);

        let clear_values = [vk::ClearValue {
            color: vk::ClearColorValue {
                float32: [0.0, 0.0, 0.0, 1.0],
            },
        }];
        let begin_info = vk::RenderPassBeginInfo::default()
            .render_pass(swapchain.render_pass())
            .framebuffer(swapchain.framebuffer(image_index))
            .render_area(vk::Rect2D {
                offset: vk::Offset2D::default(),
                extent: swapchain.extent,
            })
            .clear_values(&clear_values);

        unsafe {
            device.cmd_begin_render_pass(self.buffer, &begin_info, vk::SubpassContents::INLINE);
        }
        Ok(())
    }

    /// End the current render pass.
    ///
    /// # Safety
    /// The device must be valid and a render pass must be active.
    pub unsafe fn end_render_pass(&self, device: &ash::Device) {
        unsafe { device.cmd_end_render_pass(self.buffer) };
    }

    /// Record a buffer-to-buffer copy.
    ///
    /// # Safety
    /// The device and both buffers must be valid and recording must have
    /// begun.
    pub unsafe fn copy_buffer(
        &self,
        device: &ash::Device,
        src: vk::Buffer,
        dst: vk::Buffer,
        region: vk::BufferCopy,
    ) {
        unsafe { device.cmd_copy_buffer(self.buffer, src, dst, &[region]) };
    }

    /// Destroy the list's native objects.
    ///
    /// # Safety
    /// The device must be valid and the list must not be in use on the GPU.
    pub(crate) unsafe fn destroy(&self, device: &ash::Device) {
        unsafe {
            device.destroy_semaphore(self.semaphore, None);
            device.destroy_fence(self.fence, None);
            device.destroy_command_pool(self.pool, None);
        }
    }

    #[cfg(test)]
    pub(crate) fn for_tests(
        queue_type: QueueType,
        family_index: u32,
        frame_independent: bool,
    ) -> Arc<Self> {
        Arc::new(Self {
            queue_type,
            family_index,
            pool: vk::CommandPool::null(),
            buffer: vk::CommandBuffer::null(),
            fence: vk::Fence::null(),
            semaphore: vk::Semaphore::null(),
            frame_independent,
            claimed: AtomicBool::new(false),
            submitted: AtomicBool::new(false),
            touches_swapchain: AtomicBool::new(false),
            dependencies: Mutex::new(Vec::new()),
        })
    }
}

/// Scan a pool for a free list matching the requested queue type and
/// lifetime, claiming it atomically. The winner gets its checkout state
/// reset; losers see the claim flag and move on.
pub(crate) fn claim_matching(
    lists: &[Arc<CommandList>],
    queue_type: QueueType,
    frame_independent: bool,
) -> Option<Arc<CommandList>> {
    for list in lists {
        if list.queue_type == queue_type
            && list.frame_independent == frame_independent
            && list.try_claim()
        {
            list.reset_for_reuse();
            return Some(list.clone());
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn claim_is_exclusive() {
        let pool = vec![CommandList::for_tests(QueueType::Graphics, 0, false)];

        let first = claim_matching(&pool, QueueType::Graphics, false).unwrap();
        // Same parameters, same pool: the only candidate is claimed.
        assert!(claim_matching(&pool, QueueType::Graphics, false).is_none());

        first.release_claim();
        let second = claim_matching(&pool, QueueType::Graphics, false).unwrap();
        assert!(Arc::ptr_eq(&first, &second));
    }

    #[test]
    fn claim_matches_type_and_lifetime() {
        let pool = vec![
            CommandList::for_tests(QueueType::Graphics, 0, false),
            CommandList::for_tests(QueueType::Transfer, 1, false),
            CommandList::for_tests(QueueType::Graphics, 0, true),
        ];

        let list = claim_matching(&pool, QueueType::Transfer, false).unwrap();
        assert_eq!(list.queue_type(), QueueType::Transfer);

        // Frame-independent graphics list must not satisfy a per-frame
        // request.
        let list = claim_matching(&pool, QueueType::Graphics, false).unwrap();
        assert!(!list.is_frame_independent());
        assert!(claim_matching(&pool, QueueType::Graphics, false).is_none());
    }

    #[test]
    fn reuse_resets_submission_state() {
        let pool = vec![CommandList::for_tests(QueueType::Graphics, 0, false)];
        let other = CommandList::for_tests(QueueType::Transfer, 1, false);

        let list = claim_matching(&pool, QueueType::Graphics, false).unwrap();
        list.add_dependency(&other);
        list.mark_submitted();
        assert!(list.is_submitted());
        list.release_claim();

        let list = claim_matching(&pool, QueueType::Graphics, false).unwrap();
        assert!(!list.is_submitted());
        assert!(list.dependencies().is_empty());
    }

    #[test]
    fn concurrent_claims_never_alias() {
        let pool: Vec<_> = (0..4)
            .map(|_| CommandList::for_tests(QueueType::Graphics, 0, false))
            .collect();

        std::thread::scope(|scope| {
            let handles: Vec<_> = (0..4)
                .map(|_| {
                    scope.spawn(|| {
                        claim_matching(&pool, QueueType::Graphics, false)
                            .map(|list| Arc::as_ptr(&list) as usize)
                    })
                })
                .collect();

            let mut claimed: Vec<usize> = handles
                .into_iter()
                .map(|h| h.join().unwrap().unwrap())
                .collect();
            claimed.sort_unstable();
            claimed.dedup();
            assert_eq!(claimed.len(), 4, "two threads claimed the same list");
        });
    }
}
