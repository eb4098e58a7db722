//! GPU error types.

use ash::vk;
use thiserror::Error;

/// GPU-related errors.
///
/// Initialization failures (`NoSuitableDevice`, `ExtensionNotSupported`) are
/// fatal: the caller observes them once at startup and aborts. Swapchain
/// staleness is never surfaced here; it is absorbed by the recreation path.
#[derive(Error, Debug)]
pub enum GpuError {
    /// Vulkan error.
    #[error("Vulkan error: {0}")]
    Vulkan(#[from] vk::Result),

    /// No suitable GPU found.
    #[error("No suitable GPU found")]
    NoSuitableDevice,

    /// Required extension not supported.
    #[error("Required extension not supported: {0}")]
    ExtensionNotSupported(String),

    /// Required layer not supported.
    #[error("Required layer not supported: {0}")]
    LayerNotSupported(String),

    /// Memory allocation failed.
    #[error("Memory allocation failed: {0}")]
    AllocationFailed(String),

    /// Surface creation failed.
    #[error("Surface creation failed: {0}")]
    SurfaceCreation(String),

    /// Swapchain creation failed.
    #[error("Swapchain creation failed: {0}")]
    SwapchainCreation(String),

    /// A bounded wait on a fence ran out. Indicates a GPU hang or a driver
    /// issue; there is no retry policy for this.
    #[error("Timed out waiting for {0}")]
    Timeout(&'static str),

    /// A high-severity message from the validation layers, escalated in
    /// debug builds.
    #[error("Validation error: {0}")]
    Validation(String),

    /// Invalid state.
    #[error("Invalid state: {0}")]
    InvalidState(String),

    /// Other error.
    #[error("{0}")]
    Other(String),
}

/// Result type alias.
pub type Result<T> = std::result::Result<T, GpuError>;
