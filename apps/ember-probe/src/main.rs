//! Ember GPU bring-up probe.
//!
//! Boots the instance and graphics device headlessly, runs a buffer upload
//! through the synchronous flush path, pumps a few empty frames through the
//! frame ring, and tears everything down. Useful for checking a machine's
//! driver stack without opening a window.
//!
//! ## Usage
//!
//! ```bash
//! cargo run -p ember-probe
//! ```
//!
//! ## Environment Variables
//!
//! - `RUST_LOG`: Set log level (e.g. info, debug, trace)

use ash::vk;
use ember_core::Error;
use ember_gpu::{InstanceBuilder, QueueType, FRAMES_IN_FLIGHT};
use gpu_allocator::MemoryLocation;
use tracing_subscriber::EnvFilter;

fn main() -> ember_core::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let instance = InstanceBuilder::new()
        .app_name("ember-probe")
        .build()
        .map_err(|e| Error::Gpu(e.to_string()))?;

    let device = instance
        .initialize_graphics_device(None)
        .map_err(|e| Error::Gpu(e.to_string()))?;

    tracing::info!(
        device = device.device_name(),
        graphics_family = device.queue_family(QueueType::Graphics),
        transfer_family = device.queue_family(QueueType::Transfer),
        present_family = device.queue_family(QueueType::Present),
        ray_tracing = device.supports_ray_tracing(),
        "device ready"
    );

    // Round-trip an upload through the staging + flush path.
    let buffer = device
        .create_buffer(
            1024,
            vk::BufferUsageFlags::STORAGE_BUFFER | vk::BufferUsageFlags::TRANSFER_DST,
            MemoryLocation::GpuOnly,
            "probe buffer",
        )
        .map_err(|e| Error::Gpu(e.to_string()))?;
    let payload: Vec<u32> = (0..256).collect();
    device
        .upload_buffer(buffer, 0, &payload)
        .map_err(|e| Error::Gpu(e.to_string()))?;
    tracing::info!(bytes = payload.len() * 4, "staging upload flushed");

    // Pump enough empty frames to wrap the ring once.
    for _ in 0..FRAMES_IN_FLIGHT + 1 {
        device
            .submit_frame_async()
            .map_err(|e| Error::Gpu(e.to_string()))?;
        device
            .wait_for_previous_submission()
            .map_err(|e| Error::Gpu(e.to_string()))?;
    }
    tracing::info!(frames = device.frame_index(), "frame ring cycled");

    device.destroy_buffer(buffer);
    device
        .force_memory_cleanup()
        .map_err(|e| Error::Gpu(e.to_string()))?;
    device.wait_for_idle().map_err(|e| Error::Gpu(e.to_string()))?;

    tracing::info!("probe complete");
    Ok(())
}
