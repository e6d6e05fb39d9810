//! Application framework for the Prism renderer.
//!
//! This crate wires the GPU layer to a window and runs the frame loop:
//! - Configuration of the window, shaders, pipeline variant and geometry
//! - GPU resource creation in startup order and teardown in reverse
//! - Per-frame acquire, uniform update, submit and present
//! - Swapchain rebuilds on resize or when presentation reports it out of date
//!
//! # Example
//!
//! ```no_run
//! use prism_app::{run_app, AppConfig};
//!
//! fn main() -> anyhow::Result<()> {
//!     run_app(AppConfig::new("Prism").with_size(800, 800))?;
//!     Ok(())
//! }
//! ```

mod config;
mod frame;
mod geometry;
mod renderer;
mod runner;
mod window;

pub use config::{AppConfig, RenderConfig};
pub use frame::{EventSource, FrameBackend, FrameLoop, FrameStats};
pub use geometry::Geometry;
pub use renderer::Renderer;
pub use runner::run_app;
pub use window::PlatformWindow;

// Re-export commonly used types for convenience
pub use prism_gpu::{GpuContext, ShaderPaths, VertexInputLayout};
