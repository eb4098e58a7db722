//! Per-frame synchronization state and the fixed frame ring.
//!
//! The ring bounds how far the CPU can run ahead of the GPU: a slot is never
//! advanced into until its fence has been waited on and reset, so at most
//! [`FRAMES_IN_FLIGHT`] frames are in flight at once.

use crate::command::CommandList;
use crate::error::{GpuError, Result};
use crate::GPU_WAIT_TIMEOUT_NS;
use ash::vk;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Number of frame ring slots, and therefore the maximum number of frames
/// in flight.
pub const FRAMES_IN_FLIGHT: usize = 3;

/// Ring slot serving a given frame index.
pub const fn slot_index(frame_index: u64) -> usize {
    frame_index as usize % FRAMES_IN_FLIGHT
}

/// One queued submission: a command list and the pipeline stage its chained
/// wait applies to.
pub(crate) struct Submission {
    pub list: Arc<CommandList>,
    pub wait_stage: vk::PipelineStageFlags,
}

/// Mutable per-slot bookkeeping, guarded by the slot mutex so multiple
/// threads can queue submissions within one frame.
#[derive(Default)]
pub(crate) struct SlotState {
    /// Submissions in recorded order.
    pub submissions: Vec<Submission>,
    /// Every list handed out for this slot; doubles as the per-slot pool.
    pub lists: Vec<Arc<CommandList>>,
}

/// One reusable bundle of per-frame synchronization state.
pub(crate) struct FrameSlot {
    /// Signaled when the slot's last submission retires on the GPU.
    pub fence: vk::Fence,
    /// True while the fence is pending a GPU signal.
    in_flight: AtomicBool,
    /// Waited on by the slot's first submission; signaled by image acquire.
    pub acquire_semaphore: Mutex<vk::Semaphore>,
    /// The semaphore signaled by the slot's final submission, handed to
    /// present.
    pub handoff_semaphore: Mutex<vk::Semaphore>,
    pub state: Mutex<SlotState>,
}

impl FrameSlot {
    /// # Safety
    /// The device must be valid.
    unsafe fn new(device: &ash::Device) -> Result<Self> {
        let fence = unsafe { device.create_fence(&vk::FenceCreateInfo::default(), None)? };
        let semaphore =
            unsafe { device.create_semaphore(&vk::SemaphoreCreateInfo::default(), None)? };

        Ok(Self {
            fence,
            in_flight: AtomicBool::new(false),
            acquire_semaphore: Mutex::new(semaphore),
            handoff_semaphore: Mutex::new(vk::Semaphore::null()),
            state: Mutex::new(SlotState::default()),
        })
    }

    /// Record that the slot's fence has been handed to a submission.
    pub fn mark_in_flight(&self) {
        self.in_flight.store(true, Ordering::Release);
    }

    /// Block until the slot's GPU work has retired, then reset the fence and
    /// release the slot's command lists back to its pool.
    ///
    /// # Safety
    /// The device must be valid.
    pub unsafe fn wait_and_begin_reuse(&self, device: &ash::Device) -> Result<()> {
        if self.in_flight.swap(false, Ordering::AcqRel) {
            unsafe {
                device
                    .wait_for_fences(&[self.fence], true, GPU_WAIT_TIMEOUT_NS)
                    .map_err(|err| match err {
                        vk::Result::TIMEOUT => GpuError::Timeout("frame fence"),
                        other => GpuError::Vulkan(other),
                    })?;
                device.reset_fences(&[self.fence])?;
            }
        }
        self.begin_reuse();
        Ok(())
    }

    /// Release claims and clear queued submissions; the list vec survives as
    /// the slot's pool.
    pub(crate) fn begin_reuse(&self) {
        let mut state = self.state.lock();
        state.submissions.clear();
        for list in &state.lists {
            list.release_claim();
        }
    }

    /// # Safety
    /// The device must be valid and the slot's work must have retired.
    unsafe fn destroy(&self, device: &ash::Device) {
        let state = self.state.lock();
        for list in &state.lists {
            unsafe { list.destroy(device) };
        }
        unsafe {
            device.destroy_semaphore(*self.acquire_semaphore.lock(), None);
            device.destroy_fence(self.fence, None);
        }
    }

    #[cfg(test)]
    fn for_tests() -> Self {
        Self {
            fence: vk::Fence::null(),
            in_flight: AtomicBool::new(false),
            acquire_semaphore: Mutex::new(vk::Semaphore::null()),
            handoff_semaphore: Mutex::new(vk::Semaphore::null()),
            state: Mutex::new(SlotState::default()),
        }
    }
}

/// The fixed ring of frame slots.
pub(crate) struct FrameRing {
    slots: Vec<FrameSlot>,
}

impl FrameRing {
    /// # Safety
    /// The device must be valid.
    pub unsafe fn new(device: &ash::Device) -> Result<Self> {
        let mut slots = Vec::with_capacity(FRAMES_IN_FLIGHT);
        for _ in 0..FRAMES_IN_FLIGHT {
            slots.push(unsafe { FrameSlot::new(device)? });
        }
        Ok(Self { slots })
    }

    /// Pure modular lookup; no allocation.
    pub fn slot(&self, frame_index: u64) -> &FrameSlot {
        &self.slots[slot_index(frame_index)]
    }

    /// Destroy and recreate every slot's acquire semaphore.
    ///
    /// A semaphore that was part of a now-invalid present/acquire chain must
    /// not be reused after a device idle, so swapchain recreation replaces
    /// them all.
    ///
    /// # Safety
    /// The device must be valid and idle.
    pub unsafe fn recreate_semaphores(&self, device: &ash::Device) -> Result<()> {
        for slot in &self.slots {
            let mut semaphore = slot.acquire_semaphore.lock();
            unsafe {
                device.destroy_semaphore(*semaphore, None);
                *semaphore =
                    device.create_semaphore(&vk::SemaphoreCreateInfo::default(), None)?;
            }
        }
        Ok(())
    }

    /// Clear in-flight tracking after a device idle: every fence has
    /// signaled, so reset them and release each slot's lists.
    ///
    /// # Safety
    /// The device must be valid and idle.
    pub unsafe fn reset_after_idle(&self, device: &ash::Device) -> Result<()> {
        for slot in &self.slots {
            if slot.in_flight.swap(false, Ordering::AcqRel) {
                unsafe { device.reset_fences(&[slot.fence])? };
            }
            slot.begin_reuse();
        }
        Ok(())
    }

    /// # Safety
    /// The device must be valid and idle.
    pub unsafe fn destroy(&self, device: &ash::Device) {
        for slot in &self.slots {
            unsafe { slot.destroy(device) };
        }
    }

    #[cfg(test)]
    fn for_tests() -> Self {
        Self {
            slots: (0..FRAMES_IN_FLIGHT).map(|_| FrameSlot::for_tests()).collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::{claim_matching, CommandList};
    use crate::queue::QueueType;

    #[test]
    fn slot_lookup_is_modular() {
        assert_eq!(slot_index(0), 0);
        assert_eq!(slot_index(1), 1);
        assert_eq!(slot_index(FRAMES_IN_FLIGHT as u64), 0);
        assert_eq!(slot_index(FRAMES_IN_FLIGHT as u64 + 2), 2);

        let ring = FrameRing::for_tests();
        let first = ring.slot(0) as *const FrameSlot;
        let wrapped = ring.slot(FRAMES_IN_FLIGHT as u64) as *const FrameSlot;
        assert_eq!(first, wrapped);
        assert_ne!(first, ring.slot(1) as *const FrameSlot);
    }

    #[test]
    fn reuse_releases_slot_lists_to_the_pool() {
        let ring = FrameRing::for_tests();
        let slot = ring.slot(0);

        let list = CommandList::for_tests(QueueType::Graphics, 0, false);
        assert!(list.try_claim());
        list.mark_submitted();
        slot.state.lock().lists.push(list.clone());
        slot.state.lock().submissions.push(Submission {
            list: list.clone(),
            wait_stage: vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT,
        });

        slot.begin_reuse();

        let state = slot.state.lock();
        assert!(state.submissions.is_empty());
        assert!(!list.is_claimed());
        // Still in the pool, reclaimable with reset checkout state.
        let again = claim_matching(&state.lists, QueueType::Graphics, false).unwrap();
        assert!(!again.is_submitted());
    }
}
