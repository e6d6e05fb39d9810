//! Vulkan abstraction layer for the Prism renderer.
//!
//! This crate provides:
//! - Vulkan instance, surface and device management
//! - Host-visible buffer allocation with explicit memory-type selection
//! - Swapchain, render pass and framebuffer handling
//! - Descriptor, pipeline and shader setup
//! - Pre-recorded command buffers and per-frame synchronization

pub mod command;
pub mod context;
pub mod descriptors;
pub mod device_info;
pub mod error;
pub mod instance;
pub mod memory;
pub mod pipeline;
pub mod shader;
pub mod surface;
pub mod swapchain;
pub mod sync;
pub mod vertex;

pub use command::{
    submit_command_buffer, CommandPool, DrawCommand, RecordedCommands, RecordingContext,
    RecordingDevice, SceneBindings,
};
pub use context::{GpuContext, GpuContextBuilder};
pub use descriptors::{DescriptorPool, DescriptorSetLayoutBuilder, UniformDescriptor};
pub use device_info::{GpuVendor, PhysicalDeviceInfo};
pub use error::{GpuError, Result};
pub use memory::{create_buffer, find_memory_type, GpuBuffer, MappedMemory, MemoryDevice};
pub use pipeline::{GraphicsPipeline, GraphicsPipelineConfig};
pub use shader::{load_spirv, ShaderPair, ShaderPaths};
pub use surface::{SurfaceCapabilities, SurfaceContext};
pub use swapchain::{
    ensure_matching_counts, AcquireOutcome, PresentOutcome, RenderTargets, Swapchain,
    SwapchainSettings, TargetDevice,
};
pub use sync::{create_fence, create_semaphore, FrameSync, FrameSyncManager};
pub use vertex::{ColorUniform, InstanceData, Vertex, VertexInputLayout, COLOR_UNIFORM_SIZE};
