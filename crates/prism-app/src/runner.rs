//! Application bootstrap: logging, window, renderer, frame loop.

use anyhow::Context;
use tracing::info;
use tracing_subscriber::EnvFilter;

use crate::config::AppConfig;
use crate::frame::{FrameLoop, FrameStats};
use crate::renderer::Renderer;
use crate::window::PlatformWindow;

/// Run the renderer with the given configuration until the window closes.
///
/// This function initializes logging, creates the window and every GPU
/// resource, and drives the frame loop. Startup failures are returned with
/// the stage that failed.
pub fn run_app(config: AppConfig) -> anyhow::Result<FrameStats> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    info!("{} starting...", config.title);

    config
        .render
        .validate(&config.geometry)
        .context("Invalid render configuration")?;

    let shaders = config
        .shaders
        .load()
        .context("Failed to load shaders")?;

    let mut window = PlatformWindow::new(&config.title, config.width, config.height)
        .context("Failed to create window")?;

    let mut renderer = Renderer::new(window.window()?, &config, shaders)
        .context("Failed to initialize renderer")?;

    info!("Application ready!");

    let stats = FrameLoop::new().run(&mut window, &mut renderer)?;

    log_stats(&stats);

    info!("Starting cleanup...");
    drop(renderer);
    info!("Cleanup complete");

    Ok(stats)
}

fn log_stats(stats: &FrameStats) {
    if stats.frames > 0 {
        info!("FPS Statistics:");
        info!("  Min: {:.1}", stats.min_fps);
        info!("  Max: {:.1}", stats.max_fps);
        info!("  Avg: {:.1}", stats.avg_fps());
        info!("  Total frames: {}", stats.frames);
    }
    info!(
        "Swapchain rebuilds: {}, elapsed: {:.2}s",
        stats.rebuilds,
        stats.elapsed.as_secs_f64()
    );
}
