//! Submission ordering and the dedicated frame-submission worker.
//!
//! Submissions within a frame execute in recorded order, linked by a linear
//! semaphore chain: submission *i* signals the semaphore submission *i+1*
//! waits on. The layer deliberately avoids a DAG scheduler; strict
//! sequential ordering is simpler and predictable.

use crate::error::Result;
use ash::vk;
use crossbeam::channel::{unbounded, Receiver, Sender};
use parking_lot::Mutex;
use std::thread::JoinHandle;

/// Inputs for one queued submission: its target family, the semaphore it
/// signals on completion, the stage its chained wait applies to, and any
/// extra semaphores it must wait on.
pub(crate) struct SubmitRequest {
    pub family: u32,
    pub semaphore: vk::Semaphore,
    pub wait_stage: vk::PipelineStageFlags,
    pub dependencies: Vec<vk::Semaphore>,
}

/// A fully resolved submission ready for `vkQueueSubmit`.
pub(crate) struct PlannedSubmit {
    pub family: u32,
    pub wait_semaphores: Vec<vk::Semaphore>,
    pub wait_stages: Vec<vk::PipelineStageFlags>,
    pub signal: vk::Semaphore,
}

/// Thread the semaphore chain through the frame's submissions.
///
/// The first submission waits on the swapchain acquire semaphore when one
/// exists; each later submission waits on its predecessor's signal. The last
/// element's `signal` is what present (or the next frame) consumes.
pub(crate) fn plan_chain(
    requests: &[SubmitRequest],
    acquire: Option<vk::Semaphore>,
) -> Vec<PlannedSubmit> {
    let mut planned = Vec::with_capacity(requests.len());

    for (i, request) in requests.iter().enumerate() {
        let mut wait_semaphores = Vec::new();
        let mut wait_stages = Vec::new();

        if i == 0 {
            if let Some(acquire) = acquire {
                wait_semaphores.push(acquire);
                wait_stages.push(request.wait_stage);
            }
        } else {
            wait_semaphores.push(requests[i - 1].semaphore);
            wait_stages.push(request.wait_stage);
        }

        for &dependency in &request.dependencies {
            if !wait_semaphores.contains(&dependency) {
                wait_semaphores.push(dependency);
                wait_stages.push(request.wait_stage);
            }
        }

        planned.push(PlannedSubmit {
            family: request.family,
            wait_semaphores,
            wait_stages,
            signal: request.semaphore,
        });
    }

    planned
}

type Job = Box<dyn FnOnce() -> Result<()> + Send + 'static>;

/// The dedicated worker running frame submission off the render thread.
///
/// One frame may be in flight at a time: callers schedule the next frame
/// only after waiting for the previous one, so the ring slot rules hold.
pub(crate) struct SubmitWorker {
    sender: Option<Sender<Job>>,
    results: Receiver<Result<()>>,
    pending: Mutex<usize>,
    thread: Option<JoinHandle<()>>,
    thread_id: std::thread::ThreadId,
}

impl SubmitWorker {
    pub fn new() -> Self {
        let (sender, jobs): (Sender<Job>, Receiver<Job>) = unbounded();
        let (done, results) = unbounded();

        let thread = std::thread::Builder::new()
            .name("ember-frame-submit".to_string())
            .spawn(move || {
                for job in jobs {
                    if done.send(job()).is_err() {
                        break;
                    }
                }
            })
            .expect("failed to spawn frame submission worker");
        let thread_id = thread.thread().id();

        Self {
            sender: Some(sender),
            results,
            pending: Mutex::new(0),
            thread: Some(thread),
            thread_id,
        }
    }

    /// Whether the calling thread is the worker itself. Teardown must not
    /// wait on the worker from inside one of its own jobs.
    pub fn on_worker_thread(&self) -> bool {
        std::thread::current().id() == self.thread_id
    }

    /// Queue work on the worker thread.
    pub fn schedule(&self, job: Job) {
        let mut pending = self.pending.lock();
        if let Some(sender) = &self.sender {
            if sender.send(job).is_ok() {
                *pending += 1;
            }
        }
    }

    /// Block until every scheduled job has finished, returning the last
    /// error encountered.
    pub fn wait_idle(&self) -> Result<()> {
        let mut pending = self.pending.lock();
        let mut result = Ok(());
        while *pending > 0 {
            match self.results.recv() {
                Ok(job_result) => {
                    if job_result.is_err() {
                        result = job_result;
                    }
                }
                Err(_) => break,
            }
            *pending -= 1;
        }
        result
    }
}

impl Drop for SubmitWorker {
    fn drop(&mut self) {
        // Closing the channel ends the worker loop.
        self.sender.take();
        if let Some(thread) = self.thread.take() {
            if thread.thread().id() != std::thread::current().id() {
                let _ = thread.join();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::GpuError;
    use ash::vk::Handle as _;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    fn semaphore(id: u64) -> vk::Semaphore {
        vk::Semaphore::from_raw(id)
    }

    fn request(family: u32, id: u64) -> SubmitRequest {
        SubmitRequest {
            family,
            semaphore: semaphore(id),
            wait_stage: vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT,
            dependencies: Vec::new(),
        }
    }

    #[test]
    fn chain_links_signal_to_next_wait() {
        // Submissions spanning two distinct families.
        let requests = vec![request(0, 1), request(1, 2), request(0, 3), request(1, 4)];
        let planned = plan_chain(&requests, Some(semaphore(100)));

        assert_eq!(planned.len(), 4);
        assert_eq!(planned[0].wait_semaphores, vec![semaphore(100)]);
        for i in 1..planned.len() {
            assert_eq!(
                planned[i].wait_semaphores,
                vec![planned[i - 1].signal],
                "submission {i} must wait on its predecessor's signal"
            );
        }
        assert_eq!(planned[3].signal, semaphore(4));
    }

    #[test]
    fn first_submission_waits_nothing_without_acquire() {
        let planned = plan_chain(&[request(0, 1)], None);
        assert!(planned[0].wait_semaphores.is_empty());
        assert!(planned[0].wait_stages.is_empty());
    }

    #[test]
    fn dependencies_widen_the_wait_set() {
        let mut second = request(0, 2);
        second.dependencies = vec![semaphore(50), semaphore(1)];
        let requests = vec![request(0, 1), second];

        let planned = plan_chain(&requests, None);
        // The chained wait on semaphore 1 is not duplicated by the
        // dependency entry.
        assert_eq!(
            planned[1].wait_semaphores,
            vec![semaphore(1), semaphore(50)]
        );
        assert_eq!(planned[1].wait_stages.len(), 2);
    }

    #[test]
    fn worker_runs_jobs_and_drains() {
        let worker = SubmitWorker::new();
        let counter = Arc::new(AtomicUsize::new(0));

        for _ in 0..3 {
            let counter = counter.clone();
            worker.schedule(Box::new(move || {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }));
        }

        worker.wait_idle().unwrap();
        assert_eq!(counter.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn worker_propagates_job_errors() {
        let worker = SubmitWorker::new();
        worker.schedule(Box::new(|| Err(GpuError::Timeout("frame fence"))));
        assert!(matches!(
            worker.wait_idle(),
            Err(GpuError::Timeout("frame fence"))
        ));
        // The worker keeps running after a failed frame.
        worker.schedule(Box::new(|| Ok(())));
        worker.wait_idle().unwrap();
    }
}
