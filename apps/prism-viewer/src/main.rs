//! Prism demo viewer
//!
//! Draws five instances of a red square through a pre-recorded Vulkan
//! command buffer per swapchain image, tinting them with a uniform color
//! that changes every frame.
//!
//! ## Usage
//!
//! ```bash
//! cargo run -p prism-viewer
//! ```
//!
//! The shader binaries are read from `assets/shaders/quad.vert.spv` and
//! `assets/shaders/quad.frag.spv` relative to the working directory.
//!
//! ## Environment Variables
//!
//! - `RUST_LOG`: Set log level (e.g., info, debug, trace)

use prism_app::{run_app, AppConfig};

const WIDTH: u32 = 800;
const HEIGHT: u32 = 800;

fn main() -> anyhow::Result<()> {
    let stats = run_app(AppConfig::new("Prism Viewer").with_size(WIDTH, HEIGHT))?;
    tracing::debug!("Viewer exited after {} frames", stats.frames);
    Ok(())
}
