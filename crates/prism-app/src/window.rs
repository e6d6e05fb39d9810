//! Platform window driven by pumping the winit event loop.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, bail};
use tracing::info;
use winit::application::ApplicationHandler;
use winit::dpi::PhysicalSize;
use winit::event::WindowEvent;
use winit::event_loop::{ActiveEventLoop, ControlFlow, EventLoop};
use winit::platform::pump_events::{EventLoopExtPumpEvents, PumpStatus};
use winit::window::{Window, WindowAttributes, WindowId};

use crate::frame::EventSource;

const WAIT_TIMEOUT: Duration = Duration::from_millis(16);

/// Window state updated from winit callbacks.
struct WindowHandler {
    attributes: WindowAttributes,
    window: Option<Arc<Window>>,
    creation_error: Option<String>,
    close_requested: bool,
    resized: bool,
}

impl ApplicationHandler for WindowHandler {
    fn resumed(&mut self, event_loop: &ActiveEventLoop) {
        if self.window.is_some() {
            return;
        }

        match event_loop.create_window(self.attributes.clone()) {
            Ok(window) => self.window = Some(Arc::new(window)),
            Err(e) => {
                self.creation_error = Some(e.to_string());
                event_loop.exit();
            }
        }
    }

    fn window_event(&mut self, _event_loop: &ActiveEventLoop, _id: WindowId, event: WindowEvent) {
        match event {
            WindowEvent::CloseRequested => {
                info!("Close requested");
                self.close_requested = true;
            }
            WindowEvent::Resized(size) => {
                tracing::debug!("Resized to {}x{}", size.width, size.height);
                self.resized = true;
            }
            _ => {}
        }
    }
}

/// A single window whose events are processed once per frame.
pub struct PlatformWindow {
    event_loop: EventLoop<()>,
    handler: WindowHandler,
}

impl PlatformWindow {
    /// Open a window and pump events until it exists.
    pub fn new(title: &str, width: u32, height: u32) -> anyhow::Result<Self> {
        let event_loop = EventLoop::new()?;
        event_loop.set_control_flow(ControlFlow::Poll);

        let attributes = Window::default_attributes()
            .with_title(title)
            .with_inner_size(PhysicalSize::new(width, height));

        let mut platform = Self {
            event_loop,
            handler: WindowHandler {
                attributes,
                window: None,
                creation_error: None,
                close_requested: false,
                resized: false,
            },
        };

        while platform.handler.window.is_none() {
            let status = platform
                .event_loop
                .pump_app_events(Some(WAIT_TIMEOUT), &mut platform.handler);

            if let Some(error) = platform.handler.creation_error.take() {
                bail!("Failed to create window: {error}");
            }
            if let PumpStatus::Exit(code) = status {
                bail!("Event loop exited with code {code} before the window was created");
            }
        }

        // The initial size is not a resize.
        platform.handler.resized = false;
        Ok(platform)
    }

    /// The window handle shared with the renderer.
    pub fn window(&self) -> anyhow::Result<Arc<Window>> {
        self.handler
            .window
            .clone()
            .ok_or_else(|| anyhow!("window has not been created"))
    }

    fn pump(&mut self, timeout: Duration) {
        let status = self
            .event_loop
            .pump_app_events(Some(timeout), &mut self.handler);
        if let PumpStatus::Exit(_) = status {
            self.handler.close_requested = true;
        }
    }
}

impl EventSource for PlatformWindow {
    fn poll_events(&mut self) {
        self.pump(Duration::ZERO);
    }

    fn wait_events(&mut self) {
        self.pump(WAIT_TIMEOUT);
    }

    fn should_close(&self) -> bool {
        self.handler.close_requested
    }

    fn take_resized(&mut self) -> bool {
        std::mem::take(&mut self.handler.resized)
    }
}
