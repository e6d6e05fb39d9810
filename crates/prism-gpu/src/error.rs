//! GPU error types.

use ash::vk;
use std::path::PathBuf;
use thiserror::Error;

/// GPU-related errors.
#[derive(Error, Debug)]
pub enum GpuError {
    /// Vulkan error.
    #[error("Vulkan error: {0}")]
    Vulkan(#[from] vk::Result),

    /// No physical device was enumerated.
    #[error("No suitable GPU found")]
    NoSuitableDevice,

    /// No queue family supports both graphics work and presentation to the surface.
    #[error("No queue family supports graphics and presentation to the surface")]
    NoSuitableQueueFamily,

    /// No memory type matches the filter and required property flags.
    #[error("No memory type matches filter {type_filter:#b} with properties {required:?}")]
    NoSuitableMemoryType {
        type_filter: u32,
        required: vk::MemoryPropertyFlags,
    },

    /// A shader binary does not exist.
    #[error("File not found: {}", .0.display())]
    FileNotFound(PathBuf),

    /// A shader binary exists but could not be read as SPIR-V.
    #[error("Failed to load shader {}: {reason}", path.display())]
    ShaderLoad { path: PathBuf, reason: String },

    /// Surface creation failed.
    #[error("Surface creation failed: {0}")]
    SurfaceCreation(String),

    /// Swapchain creation failed.
    #[error("Swapchain creation failed: {0}")]
    SwapchainCreation(String),

    /// Pipeline creation failed.
    #[error("Pipeline creation failed: {0}")]
    PipelineCreation(String),

    /// Invalid state.
    #[error("Invalid state: {0}")]
    InvalidState(String),

    /// Other error.
    #[error("{0}")]
    Other(String),
}

/// Result type alias.
pub type Result<T> = std::result::Result<T, GpuError>;
