//! Command buffer management.

use crate::error::Result;
use crate::pipeline::GraphicsPipeline;
use crate::swapchain::RenderTargets;
use crate::vertex::{INSTANCE_BINDING, VERTEX_BINDING};
use ash::prelude::VkResult;
use ash::vk;

/// The device calls used to allocate and record command buffers.
///
/// Implemented for [`ash::Device`]; tests substitute a recorder.
pub trait RecordingDevice {
    /// # Safety
    /// Same contract as `vkAllocateCommandBuffers`.
    unsafe fn allocate_command_buffers(
        &self,
        info: &vk::CommandBufferAllocateInfo<'_>,
    ) -> VkResult<Vec<vk::CommandBuffer>>;

    /// # Safety
    /// None of `buffers` may be executing.
    unsafe fn free_command_buffers(&self, pool: vk::CommandPool, buffers: &[vk::CommandBuffer]);

    /// # Safety
    /// `cmd` must not be executing.
    unsafe fn begin_command_buffer(
        &self,
        cmd: vk::CommandBuffer,
        info: &vk::CommandBufferBeginInfo<'_>,
    ) -> VkResult<()>;

    /// # Safety
    /// `cmd` must be recording, outside a render pass.
    unsafe fn end_command_buffer(&self, cmd: vk::CommandBuffer) -> VkResult<()>;

    /// # Safety
    /// `cmd` must be recording and every handle must be valid.
    unsafe fn cmd_begin_render_pass(
        &self,
        cmd: vk::CommandBuffer,
        info: &vk::RenderPassBeginInfo<'_>,
    );

    /// # Safety
    /// `cmd` must be recording and every handle must be valid.
    unsafe fn cmd_end_render_pass(&self, cmd: vk::CommandBuffer);

    /// # Safety
    /// `cmd` must be recording and every handle must be valid.
    unsafe fn cmd_bind_pipeline(&self, cmd: vk::CommandBuffer, pipeline: vk::Pipeline);

    /// # Safety
    /// `cmd` must be recording and every handle must be valid.
    unsafe fn cmd_bind_descriptor_set(
        &self,
        cmd: vk::CommandBuffer,
        layout: vk::PipelineLayout,
        set: vk::DescriptorSet,
    );

    /// # Safety
    /// `cmd` must be recording and every handle must be valid.
    unsafe fn cmd_bind_vertex_buffer(&self, cmd: vk::CommandBuffer, binding: u32, buffer: vk::Buffer);

    /// # Safety
    /// `cmd` must be recording and every handle must be valid.
    unsafe fn cmd_bind_index_buffer(&self, cmd: vk::CommandBuffer, buffer: vk::Buffer);

    /// # Safety
    /// `cmd` must be recording and every handle must be valid.
    unsafe fn cmd_draw_indexed(&self, cmd: vk::CommandBuffer, index_count: u32, instance_count: u32);

    /// # Safety
    /// `cmd` must be recording and every handle must be valid.
    unsafe fn cmd_draw(&self, cmd: vk::CommandBuffer, vertex_count: u32, instance_count: u32);
}

impl RecordingDevice for ash::Device {
    unsafe fn allocate_command_buffers(
        &self,
        info: &vk::CommandBufferAllocateInfo<'_>,
    ) -> VkResult<Vec<vk::CommandBuffer>> {
        ash::Device::allocate_command_buffers(self, info)
    }

    unsafe fn free_command_buffers(&self, pool: vk::CommandPool, buffers: &[vk::CommandBuffer]) {
        ash::Device::free_command_buffers(self, pool, buffers);
    }

    unsafe fn begin_command_buffer(
        &self,
        cmd: vk::CommandBuffer,
        info: &vk::CommandBufferBeginInfo<'_>,
    ) -> VkResult<()> {
        ash::Device::begin_command_buffer(self, cmd, info)
    }

    unsafe fn end_command_buffer(&self, cmd: vk::CommandBuffer) -> VkResult<()> {
        ash::Device::end_command_buffer(self, cmd)
    }

    unsafe fn cmd_begin_render_pass(
        &self,
        cmd: vk::CommandBuffer,
        info: &vk::RenderPassBeginInfo<'_>,
    ) {
        ash::Device::cmd_begin_render_pass(self, cmd, info, vk::SubpassContents::INLINE);
    }

    unsafe fn cmd_end_render_pass(&self, cmd: vk::CommandBuffer) {
        ash::Device::cmd_end_render_pass(self, cmd);
    }

    unsafe fn cmd_bind_pipeline(&self, cmd: vk::CommandBuffer, pipeline: vk::Pipeline) {
        ash::Device::cmd_bind_pipeline(self, cmd, vk::PipelineBindPoint::GRAPHICS, pipeline);
    }

    unsafe fn cmd_bind_descriptor_set(
        &self,
        cmd: vk::CommandBuffer,
        layout: vk::PipelineLayout,
        set: vk::DescriptorSet,
    ) {
        ash::Device::cmd_bind_descriptor_sets(
            self,
            cmd,
            vk::PipelineBindPoint::GRAPHICS,
            layout,
            0,
            &[set],
            &[],
        );
    }

    unsafe fn cmd_bind_vertex_buffer(&self, cmd: vk::CommandBuffer, binding: u32, buffer: vk::Buffer) {
        ash::Device::cmd_bind_vertex_buffers(self, cmd, binding, &[buffer], &[0]);
    }

    unsafe fn cmd_bind_index_buffer(&self, cmd: vk::CommandBuffer, buffer: vk::Buffer) {
        ash::Device::cmd_bind_index_buffer(self, cmd, buffer, 0, vk::IndexType::UINT16);
    }

    unsafe fn cmd_draw_indexed(&self, cmd: vk::CommandBuffer, index_count: u32, instance_count: u32) {
        ash::Device::cmd_draw_indexed(self, cmd, index_count, instance_count, 0, 0, 0);
    }

    unsafe fn cmd_draw(&self, cmd: vk::CommandBuffer, vertex_count: u32, instance_count: u32) {
        ash::Device::cmd_draw(self, cmd, vertex_count, instance_count, 0, 0);
    }
}

/// Command pool for allocating command buffers.
pub struct CommandPool {
    pool: vk::CommandPool,
}

impl CommandPool {
    /// Create a new command pool.
    ///
    /// # Safety
    /// The device must be valid and the queue family must exist.
    pub unsafe fn new(
        device: &ash::Device,
        queue_family: u32,
        flags: vk::CommandPoolCreateFlags,
    ) -> Result<Self> {
        let create_info = vk::CommandPoolCreateInfo::default()
            .queue_family_index(queue_family)
            .flags(flags);

        let pool = device.create_command_pool(&create_info, None)?;

        Ok(Self { pool })
    }

    /// Get the raw pool handle.
    pub fn handle(&self) -> vk::CommandPool {
        self.pool
    }

    /// Allocate primary command buffers.
    ///
    /// # Safety
    /// The device must be valid.
    pub unsafe fn allocate_command_buffers<D: RecordingDevice + ?Sized>(
        &self,
        device: &D,
        count: u32,
    ) -> Result<Vec<vk::CommandBuffer>> {
        let alloc_info = vk::CommandBufferAllocateInfo::default()
            .command_pool(self.pool)
            .level(vk::CommandBufferLevel::PRIMARY)
            .command_buffer_count(count);

        let buffers = device.allocate_command_buffers(&alloc_info)?;
        Ok(buffers)
    }

    /// Destroy the command pool.
    ///
    /// # Safety
    /// The device must be valid and the pool must not be in use.
    pub unsafe fn destroy(&self, device: &ash::Device) {
        device.destroy_command_pool(self.pool, None);
    }
}

/// One draw call of the recorded plan.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DrawCommand {
    /// `vkCmdDrawIndexed` over the bound index buffer.
    Indexed { index_count: u32, instance_count: u32 },
    /// `vkCmdDraw` without an index buffer.
    Vertices { vertex_count: u32, instance_count: u32 },
}

/// Buffers bound before the draw calls. `None` for a vertex-less pipeline.
#[derive(Debug, Clone, Copy)]
pub struct SceneBindings {
    pub vertex: vk::Buffer,
    pub instance: Option<vk::Buffer>,
    pub index: vk::Buffer,
}

impl SceneBindings {
    /// Vertex buffers in binding order.
    pub fn vertex_buffers(&self) -> Vec<(u32, vk::Buffer)> {
        let mut buffers = vec![(VERTEX_BINDING, self.vertex)];
        if let Some(instance) = self.instance {
            buffers.push((INSTANCE_BINDING, instance));
        }
        buffers
    }
}

/// Everything a frame's command buffer draws with.
pub struct RecordingContext<'a> {
    pub targets: &'a RenderTargets,
    pub pipeline: &'a GraphicsPipeline,
    pub descriptor_set: vk::DescriptorSet,
    pub bindings: Option<SceneBindings>,
    pub draws: &'a [DrawCommand],
    pub clear_color: [f32; 4],
    pub extent: vk::Extent2D,
}

/// One pre-recorded primary command buffer per framebuffer.
pub struct RecordedCommands {
    pub command_buffers: Vec<vk::CommandBuffer>,
}

impl RecordedCommands {
    /// Allocate and record a command buffer for every framebuffer.
    ///
    /// # Safety
    /// All handles in `ctx` must be valid.
    pub unsafe fn record<D: RecordingDevice + ?Sized>(
        device: &D,
        pool: &CommandPool,
        ctx: &RecordingContext<'_>,
    ) -> Result<Self> {
        let count = u32::try_from(ctx.targets.framebuffers.len()).unwrap_or(u32::MAX);
        let command_buffers = pool.allocate_command_buffers(device, count)?;
        let recorded = Self { command_buffers };

        for (&cmd, &framebuffer) in recorded.command_buffers.iter().zip(&ctx.targets.framebuffers) {
            if let Err(e) = record_one(device, cmd, framebuffer, ctx) {
                recorded.free(device, pool);
                return Err(e);
            }
        }

        tracing::debug!(
            "Recorded {} command buffers with {} draws each",
            recorded.command_buffers.len(),
            ctx.draws.len()
        );

        Ok(recorded)
    }

    /// Number of recorded command buffers.
    pub fn len(&self) -> usize {
        self.command_buffers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.command_buffers.is_empty()
    }

    /// Return the command buffers to the pool.
    ///
    /// # Safety
    /// None of the buffers may be executing.
    pub unsafe fn free<D: RecordingDevice + ?Sized>(&self, device: &D, pool: &CommandPool) {
        if !self.command_buffers.is_empty() {
            device.free_command_buffers(pool.handle(), &self.command_buffers);
        }
    }
}

unsafe fn record_one<D: RecordingDevice + ?Sized>(
    device: &D,
    cmd: vk::CommandBuffer,
    framebuffer: vk::Framebuffer,
    ctx: &RecordingContext<'_>,
) -> Result<()> {
    let begin_info =
        vk::CommandBufferBeginInfo::default().flags(vk::CommandBufferUsageFlags::SIMULTANEOUS_USE);
    device.begin_command_buffer(cmd, &begin_info)?;

    let clear_values = [vk::ClearValue {
        color: vk::ClearColorValue {
            float32: ctx.clear_color,
        },
    }];
    let render_pass_begin = vk::RenderPassBeginInfo::default()
        .render_pass(ctx.targets.render_pass)
        .framebuffer(framebuffer)
        .render_area(vk::Rect2D {
            offset: vk::Offset2D { x: 0, y: 0 },
            extent: ctx.extent,
        })
        .clear_values(&clear_values);

    device.cmd_begin_render_pass(cmd, &render_pass_begin);
    device.cmd_bind_pipeline(cmd, ctx.pipeline.pipeline);
    device.cmd_bind_descriptor_set(cmd, ctx.pipeline.layout, ctx.descriptor_set);

    if let Some(bindings) = &ctx.bindings {
        for (binding, buffer) in bindings.vertex_buffers() {
            device.cmd_bind_vertex_buffer(cmd, binding, buffer);
        }
        device.cmd_bind_index_buffer(cmd, bindings.index);
    }

    for draw in ctx.draws {
        match *draw {
            DrawCommand::Indexed {
                index_count,
                instance_count,
            } => device.cmd_draw_indexed(cmd, index_count, instance_count),
            DrawCommand::Vertices {
                vertex_count,
                instance_count,
            } => device.cmd_draw(cmd, vertex_count, instance_count),
        }
    }

    device.cmd_end_render_pass(cmd);
    device.end_command_buffer(cmd)?;
    Ok(())
}

/// Submit a command buffer to a queue.
///
/// # Safety
/// All handles must be valid.
pub unsafe fn submit_command_buffer(
    device: &ash::Device,
    queue: vk::Queue,
    command_buffer: vk::CommandBuffer,
    wait_semaphore: vk::Semaphore,
    wait_stage: vk::PipelineStageFlags,
    signal_semaphore: vk::Semaphore,
    fence: vk::Fence,
) -> Result<()> {
    let command_buffers = [command_buffer];
    let wait_semaphores = [wait_semaphore];
    let wait_stages = [wait_stage];
    let signal_semaphores = [signal_semaphore];

    let submit_info = vk::SubmitInfo::default()
        .command_buffers(&command_buffers)
        .wait_semaphores(&wait_semaphores)
        .wait_dst_stage_mask(&wait_stages)
        .signal_semaphores(&signal_semaphores);

    device.queue_submit(queue, &[submit_info], fence)?;
    Ok(())
}
