//! GPU resources for the instanced-quad scene and the per-frame protocol.

use std::ops::Deref;
use std::sync::Arc;

use anyhow::anyhow;
use ash::vk;
use prism_gpu::swapchain::ensure_matching_counts;
use prism_gpu::{
    create_buffer, submit_command_buffer, AcquireOutcome, ColorUniform, CommandPool, DrawCommand,
    FrameSyncManager, GpuBuffer, GpuContext, GpuContextBuilder, GraphicsPipeline,
    GraphicsPipelineConfig, PresentOutcome, RecordedCommands, RecordingContext, RenderTargets,
    SceneBindings, ShaderPair, Swapchain, UniformDescriptor, VertexInputLayout, COLOR_UNIFORM_SIZE,
};
use tracing::info;
use winit::window::Window;

use crate::config::{AppConfig, RenderConfig};
use crate::frame::FrameBackend;
use crate::geometry::Geometry;

/// Vertex, index and optional instance buffers.
struct SceneBuffers {
    vertex: GpuBuffer,
    index: GpuBuffer,
    instance: Option<GpuBuffer>,
}

impl SceneBuffers {
    /// # Safety
    /// The context must be valid.
    unsafe fn new(gpu: &GpuContext, geometry: &Geometry, instanced: bool) -> anyhow::Result<Self> {
        let device = gpu.device();
        let props = gpu.memory_properties();
        let (vertex_size, index_size, instance_size) = geometry.byte_sizes();

        // SAFETY: Device is valid and the memory properties describe it
        let vertex = unsafe {
            create_buffer(
                device,
                props,
                vertex_size,
                vk::BufferUsageFlags::VERTEX_BUFFER,
                Some(bytemuck::cast_slice(&geometry.vertices)),
            )?
        };

        // SAFETY: As above
        let index = match unsafe {
            create_buffer(
                device,
                props,
                index_size,
                vk::BufferUsageFlags::INDEX_BUFFER,
                Some(bytemuck::cast_slice(&geometry.indices)),
            )
        } {
            Ok(buffer) => buffer,
            Err(e) => {
                // SAFETY: The buffer was never used
                unsafe { vertex.destroy(device) };
                return Err(e.into());
            }
        };

        let instance = if instanced {
            // SAFETY: As above
            match unsafe {
                create_buffer(
                    device,
                    props,
                    instance_size,
                    vk::BufferUsageFlags::VERTEX_BUFFER,
                    Some(bytemuck::cast_slice(&geometry.instances)),
                )
            } {
                Ok(buffer) => Some(buffer),
                Err(e) => {
                    // SAFETY: The buffers were never used
                    unsafe {
                        index.destroy(device);
                        vertex.destroy(device);
                    }
                    return Err(e.into());
                }
            }
        } else {
            None
        };

        Ok(Self {
            vertex,
            index,
            instance,
        })
    }

    fn bindings(&self) -> SceneBindings {
        SceneBindings {
            vertex: self.vertex.buffer,
            instance: self.instance.as_ref().map(|b| b.buffer),
            index: self.index.buffer,
        }
    }

    /// # Safety
    /// The buffers must not be in use.
    unsafe fn destroy(&self, device: &ash::Device) {
        // SAFETY: Caller guarantees the buffers are idle
        unsafe {
            if let Some(instance) = &self.instance {
                instance.destroy(device);
            }
            self.index.destroy(device);
            self.vertex.destroy(device);
        }
    }
}

/// Everything that is rebuilt with the swapchain.
struct SwapchainResources {
    swapchain: Swapchain,
    targets: RenderTargets,
    pipeline: GraphicsPipeline,
    commands: RecordedCommands,
    sync: FrameSyncManager,
}

impl SwapchainResources {
    /// # Safety
    /// The device must be valid and must not be using the resources being replaced.
    unsafe fn destroy(&self, gpu: &GpuContext, pool: &CommandPool) {
        let device = gpu.device();
        // SAFETY: Caller guarantees the resources are idle
        unsafe {
            self.sync.destroy(device);
            self.commands.free(device, pool);
            self.pipeline.destroy(device);
            self.targets.destroy(device);
            self.swapchain.destroy(device, gpu.swapchain_loader());
        }
    }
}

/// A value created from a window's handles, dropped before the window.
struct WindowBound<T, W = Arc<Window>> {
    value: T,
    window: W,
}

impl<T, W> Deref for WindowBound<T, W> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.value
    }
}

/// Owns every GPU resource and implements the frame protocol.
pub struct Renderer {
    config: RenderConfig,
    shaders: ShaderPair,
    draws: Vec<DrawCommand>,
    uniform_buffer: GpuBuffer,
    scene: Option<SceneBuffers>,
    descriptor: UniformDescriptor,
    command_pool: CommandPool,
    frame: SwapchainResources,
    // Destroyed last, after `Drop` has released everything above. The
    // surface goes with the context, before the window.
    gpu: WindowBound<GpuContext>,
}

impl Renderer {
    /// Create the device and every resource in startup order.
    pub fn new(window: Arc<Window>, config: &AppConfig, shaders: ShaderPair) -> anyhow::Result<Self> {
        let render = config.render.clone();
        let geometry = &config.geometry;
        let draws = render.plan(geometry)?;

        // SAFETY: `WindowBound` releases the context before the window
        let context = unsafe {
            GpuContextBuilder::new()
                .app_name(&config.title)
                .validation(config.validation)
                .build(window.as_ref())?
        };
        let gpu = WindowBound {
            value: context,
            window,
        };
        let device = gpu.device();

        // SAFETY: Device is valid
        let uniform_buffer = unsafe {
            create_buffer(
                device,
                gpu.memory_properties(),
                COLOR_UNIFORM_SIZE,
                vk::BufferUsageFlags::UNIFORM_BUFFER,
                Some(bytemuck::bytes_of(&ColorUniform::from_elapsed(0.0))),
            )?
        };

        let resources = create_startup_resources(
            &gpu,
            &gpu.window,
            &render,
            geometry,
            &shaders,
            &draws,
            &uniform_buffer,
        );
        let StartupResources {
            scene,
            descriptor,
            command_pool,
            frame,
        } = match resources {
            Ok(resources) => resources,
            Err(e) => {
                // SAFETY: Nothing has been submitted yet
                unsafe { uniform_buffer.destroy(device) };
                return Err(e);
            }
        };

        info!(
            "Renderer ready: {} swapchain images, {} draws per frame",
            frame.swapchain.image_count(),
            draws.len()
        );

        Ok(Self {
            config: render,
            shaders,
            draws,
            uniform_buffer,
            scene,
            descriptor,
            command_pool,
            frame,
            gpu,
        })
    }

    fn window_size(&self) -> (u32, u32) {
        let size = self.gpu.window.inner_size();
        (size.width, size.height)
    }
}

/// Resources created after the uniform buffer at startup.
struct StartupResources {
    scene: Option<SceneBuffers>,
    descriptor: UniformDescriptor,
    command_pool: CommandPool,
    frame: SwapchainResources,
}

/// Create the startup resources, releasing what was created if a step fails.
fn create_startup_resources(
    gpu: &GpuContext,
    window: &Window,
    render: &RenderConfig,
    geometry: &Geometry,
    shaders: &ShaderPair,
    draws: &[DrawCommand],
    uniform_buffer: &GpuBuffer,
) -> anyhow::Result<StartupResources> {
    let device = gpu.device();

    let scene = match render.vertex_input {
        VertexInputLayout::Empty => None,
        // SAFETY: Context is valid
        VertexInputLayout::PerVertex => unsafe {
            Some(SceneBuffers::new(gpu, geometry, render.instanced())?)
        },
    };
    let destroy_scene = |scene: &Option<SceneBuffers>| {
        if let Some(scene) = scene {
            // SAFETY: Nothing has been submitted yet
            unsafe { scene.destroy(device) };
        }
    };

    // SAFETY: Device and buffer are valid
    let descriptor = match unsafe { UniformDescriptor::new(device, uniform_buffer) } {
        Ok(descriptor) => descriptor,
        Err(e) => {
            destroy_scene(&scene);
            return Err(e.into());
        }
    };

    // SAFETY: Device is valid and the queue family exists
    let command_pool = match unsafe {
        CommandPool::new(
            device,
            gpu.graphics_queue_family(),
            vk::CommandPoolCreateFlags::empty(),
        )
    } {
        Ok(pool) => pool,
        Err(e) => {
            // SAFETY: Nothing has been submitted yet
            unsafe { descriptor.destroy(device) };
            destroy_scene(&scene);
            return Err(e.into());
        }
    };

    let size = window.inner_size();
    let built = build_swapchain_resources(
        gpu,
        (size.width, size.height),
        vk::SwapchainKHR::null(),
        &FrameInputs {
            render,
            shaders,
            descriptor: &descriptor,
            bindings: scene.as_ref().map(SceneBuffers::bindings),
            draws,
            command_pool: &command_pool,
        },
    )
    .and_then(|frame| frame.ok_or_else(|| anyhow!("window has no drawable area at startup")));

    match built {
        Ok(frame) => Ok(StartupResources {
            scene,
            descriptor,
            command_pool,
            frame,
        }),
        Err(e) => {
            // SAFETY: Nothing has been submitted yet
            unsafe {
                command_pool.destroy(device);
                descriptor.destroy(device);
            }
            destroy_scene(&scene);
            Err(e)
        }
    }
}

/// Swapchain-independent inputs to [`build_swapchain_resources`].
struct FrameInputs<'a> {
    render: &'a RenderConfig,
    shaders: &'a ShaderPair,
    descriptor: &'a UniformDescriptor,
    bindings: Option<SceneBindings>,
    draws: &'a [DrawCommand],
    command_pool: &'a CommandPool,
}

/// Swapchain, render targets, pipeline, recorded commands and sync objects.
///
/// Returns `Ok(None)` when the surface has no area.
fn build_swapchain_resources(
    gpu: &GpuContext,
    (width, height): (u32, u32),
    old_swapchain: vk::SwapchainKHR,
    inputs: &FrameInputs<'_>,
) -> anyhow::Result<Option<SwapchainResources>> {
    let device = gpu.device();

    // SAFETY: The old swapchain, if any, belongs to this surface
    let Some(swapchain) = (unsafe { Swapchain::create(gpu, width, height, old_swapchain)? }) else {
        return Ok(None);
    };

    // SAFETY: Device and swapchain are valid
    let targets = match unsafe { RenderTargets::new(device, &swapchain) } {
        Ok(targets) => targets,
        Err(e) => {
            // SAFETY: Nothing references the new swapchain yet
            unsafe { swapchain.destroy(device, gpu.swapchain_loader()) };
            return Err(e.into());
        }
    };

    let pipeline_config = GraphicsPipelineConfig {
        shaders: inputs.shaders,
        vertex_input: inputs.render.vertex_input,
        instanced: inputs.render.instanced(),
        extent: swapchain.extent,
        render_pass: targets.render_pass,
        descriptor_set_layout: inputs.descriptor.layout,
    };
    // SAFETY: Device is valid and the shaders were loaded from SPIR-V files
    let pipeline = match unsafe { GraphicsPipeline::new(device, &pipeline_config) } {
        Ok(pipeline) => pipeline,
        Err(e) => {
            // SAFETY: Nothing references the new targets yet
            unsafe {
                targets.destroy(device);
                swapchain.destroy(device, gpu.swapchain_loader());
            }
            return Err(e.into());
        }
    };

    let recording = RecordingContext {
        targets: &targets,
        pipeline: &pipeline,
        descriptor_set: inputs.descriptor.set,
        bindings: inputs.bindings,
        draws: inputs.draws,
        clear_color: inputs.render.clear_color,
        extent: swapchain.extent,
    };
    // SAFETY: All recorded handles are valid
    let commands = match unsafe { RecordedCommands::record(device, inputs.command_pool, &recording) } {
        Ok(commands) => commands,
        Err(e) => {
            // SAFETY: Nothing was submitted
            unsafe {
                pipeline.destroy(device);
                targets.destroy(device);
                swapchain.destroy(device, gpu.swapchain_loader());
            }
            return Err(e.into());
        }
    };

    let checked = ensure_matching_counts(
        swapchain.image_count(),
        targets.framebuffers.len(),
        commands.len(),
    )
    .and_then(|()| {
        // SAFETY: Device is valid
        unsafe { FrameSyncManager::new(device, swapchain.image_count()) }
    });

    match checked {
        Ok(sync) => Ok(Some(SwapchainResources {
            swapchain,
            targets,
            pipeline,
            commands,
            sync,
        })),
        Err(e) => {
            // SAFETY: Nothing was submitted
            unsafe {
                commands.free(device, inputs.command_pool);
                pipeline.destroy(device);
                targets.destroy(device);
                swapchain.destroy(device, gpu.swapchain_loader());
            }
            Err(e.into())
        }
    }
}

impl FrameBackend for Renderer {
    fn acquire_image(&mut self) -> anyhow::Result<AcquireOutcome> {
        let device = self.gpu.device();
        let sync = self.frame.sync.current();

        // SAFETY: Device, fence, swapchain and semaphore are valid
        let outcome = unsafe {
            sync.wait(device)?;
            self.frame
                .swapchain
                .acquire_next_image(self.gpu.swapchain_loader(), sync.image_available)?
        };
        Ok(outcome)
    }

    fn update_uniform(&mut self, uniform: &ColorUniform) -> anyhow::Result<()> {
        let device = self.gpu.device();
        // Every recorded command buffer reads the same uniform buffer.
        // SAFETY: Once all slot fences are signaled the device is not reading it
        unsafe {
            self.frame.sync.wait_all(device)?;
            self.uniform_buffer
                .write(device, std::slice::from_ref(uniform))?;
        }
        Ok(())
    }

    fn submit(&mut self, image_index: u32) -> anyhow::Result<()> {
        let device = self.gpu.device();
        let sync = *self.frame.sync.current();
        let render_finished = self.frame.sync.render_finished(image_index)?;
        let command_buffer = self
            .frame
            .commands
            .command_buffers
            .get(image_index as usize)
            .copied()
            .ok_or_else(|| anyhow!("no command buffer for image {image_index}"))?;

        // SAFETY: All handles are valid; the slot fence was waited on in acquire
        unsafe {
            sync.reset(device)?;
            submit_command_buffer(
                device,
                self.gpu.graphics_queue(),
                command_buffer,
                sync.image_available,
                vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT,
                render_finished,
                sync.in_flight,
            )?;
        }
        Ok(())
    }

    fn present(&mut self, image_index: u32) -> anyhow::Result<PresentOutcome> {
        let render_finished = self.frame.sync.render_finished(image_index)?;

        // SAFETY: Swapchain, queue and semaphore are valid
        let outcome = unsafe {
            self.frame.swapchain.present(
                self.gpu.swapchain_loader(),
                self.gpu.graphics_queue(),
                image_index,
                &[render_finished],
            )?
        };

        self.frame.sync.advance();
        Ok(outcome)
    }

    fn rebuild_swapchain(&mut self) -> anyhow::Result<bool> {
        self.gpu.wait_idle()?;

        let size = self.window_size();
        let inputs = FrameInputs {
            render: &self.config,
            shaders: &self.shaders,
            descriptor: &self.descriptor,
            bindings: self.scene.as_ref().map(SceneBuffers::bindings),
            draws: &self.draws,
            command_pool: &self.command_pool,
        };

        let Some(frame) =
            build_swapchain_resources(&self.gpu, size, self.frame.swapchain.swapchain, &inputs)?
        else {
            tracing::debug!("Surface has no area; skipping rebuild");
            return Ok(false);
        };

        let old = std::mem::replace(&mut self.frame, frame);
        // SAFETY: The device is idle and the old swapchain has been retired
        unsafe { old.destroy(&self.gpu, &self.command_pool) };

        info!(
            "Swapchain rebuilt: {}x{}",
            self.frame.swapchain.extent.width, self.frame.swapchain.extent.height
        );
        Ok(true)
    }

    fn wait_idle(&mut self) -> anyhow::Result<()> {
        self.gpu.wait_idle()?;
        Ok(())
    }
}

impl Drop for Renderer {
    fn drop(&mut self) {
        if let Err(e) = self.gpu.wait_idle() {
            tracing::error!("Failed to wait idle: {e}");
        }

        let device = self.gpu.device();
        // SAFETY: The device is idle; the context outlives these resources
        unsafe {
            self.frame.destroy(&self.gpu, &self.command_pool);
            self.command_pool.destroy(device);
            self.descriptor.destroy(device);
            if let Some(scene) = &self.scene {
                scene.destroy(device);
            }
            self.uniform_buffer.destroy(device);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;
    use std::rc::Rc;

    struct Released(&'static str, Rc<RefCell<Vec<&'static str>>>);

    impl Drop for Released {
        fn drop(&mut self) {
            self.1.borrow_mut().push(self.0);
        }
    }

    #[test]
    fn window_outlives_the_context_created_from_it() {
        let order = Rc::new(RefCell::new(Vec::new()));
        let bound = WindowBound {
            value: Released("context", Rc::clone(&order)),
            window: Released("window", Rc::clone(&order)),
        };
        assert_eq!(bound.0, "context");

        drop(bound);

        assert_eq!(*order.borrow(), ["context", "window"]);
    }
}
