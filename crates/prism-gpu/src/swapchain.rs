//! Swapchain, render pass and framebuffers.

use crate::context::GpuContext;
use crate::error::{GpuError, Result};
use crate::surface::SurfaceCapabilities;
use ash::prelude::VkResult;
use ash::vk;

/// Parameters negotiated with the surface before creating a swapchain.
#[derive(Debug, Clone, Copy)]
pub struct SwapchainSettings {
    pub format: vk::SurfaceFormatKHR,
    pub present_mode: vk::PresentModeKHR,
    pub image_count: u32,
    pub extent: vk::Extent2D,
}

impl SwapchainSettings {
    /// Take the first format, the first present mode and the minimum image count.
    pub fn choose(caps: &SurfaceCapabilities, window_width: u32, window_height: u32) -> Result<Self> {
        Ok(Self {
            format: caps.first_format()?,
            present_mode: caps.first_present_mode()?,
            image_count: choose_image_count(&caps.capabilities),
            extent: calculate_extent(&caps.capabilities, window_width, window_height),
        })
    }

    /// A zero-sized extent means the window is minimized and cannot be presented to.
    pub fn is_zero_extent(&self) -> bool {
        self.extent.width == 0 || self.extent.height == 0
    }
}

/// Result of acquiring a swapchain image.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AcquireOutcome {
    /// An image was acquired; `suboptimal` asks for a rebuild after this frame.
    Ready { index: u32, suboptimal: bool },
    /// No image was acquired; the swapchain must be rebuilt first.
    OutOfDate,
}

/// Result of presenting a swapchain image.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PresentOutcome {
    Optimal,
    NeedsRebuild,
}

/// Swapchain wrapper.
pub struct Swapchain {
    pub swapchain: vk::SwapchainKHR,
    pub images: Vec<vk::Image>,
    pub image_views: Vec<vk::ImageView>,
    pub format: vk::Format,
    pub extent: vk::Extent2D,
}

impl Swapchain {
    /// Create a swapchain for the context's surface sized for the window.
    ///
    /// Returns `Ok(None)` when the surface extent is zero (minimized window).
    ///
    /// # Safety
    /// `old_swapchain` must be null or a swapchain of the same surface; it is
    /// retired, not destroyed.
    pub unsafe fn create(
        gpu: &GpuContext,
        window_width: u32,
        window_height: u32,
        old_swapchain: vk::SwapchainKHR,
    ) -> Result<Option<Self>> {
        let caps = gpu.surface().capabilities(gpu.physical_device())?;
        let settings = SwapchainSettings::choose(&caps, window_width, window_height)?;
        if settings.is_zero_extent() {
            return Ok(None);
        }

        let swapchain = Self::new(
            gpu.device(),
            gpu.swapchain_loader(),
            gpu.surface().surface,
            &settings,
            old_swapchain,
        )?;

        tracing::info!(
            "Swapchain created: {}x{}, {} images, {:?}, {:?}",
            swapchain.extent.width,
            swapchain.extent.height,
            swapchain.images.len(),
            swapchain.format,
            settings.present_mode
        );

        Ok(Some(swapchain))
    }

    /// Create a new swapchain from negotiated settings.
    ///
    /// # Safety
    /// All handles must be valid.
    pub unsafe fn new(
        device: &ash::Device,
        swapchain_loader: &ash::khr::swapchain::Device,
        surface: vk::SurfaceKHR,
        settings: &SwapchainSettings,
        old_swapchain: vk::SwapchainKHR,
    ) -> Result<Self> {
        let create_info = vk::SwapchainCreateInfoKHR::default()
            .surface(surface)
            .min_image_count(settings.image_count)
            .image_format(settings.format.format)
            .image_color_space(settings.format.color_space)
            .image_extent(settings.extent)
            .image_array_layers(1)
            .image_usage(vk::ImageUsageFlags::COLOR_ATTACHMENT)
            .image_sharing_mode(vk::SharingMode::EXCLUSIVE)
            .pre_transform(vk::SurfaceTransformFlagsKHR::IDENTITY)
            .composite_alpha(vk::CompositeAlphaFlagsKHR::OPAQUE)
            .present_mode(settings.present_mode)
            .clipped(true)
            .old_swapchain(old_swapchain);

        let swapchain = swapchain_loader
            .create_swapchain(&create_info, None)
            .map_err(|e| GpuError::SwapchainCreation(e.to_string()))?;

        let images = match swapchain_loader.get_swapchain_images(swapchain) {
            Ok(images) => images,
            Err(e) => {
                swapchain_loader.destroy_swapchain(swapchain, None);
                return Err(e.into());
            }
        };

        let mut image_views = Vec::with_capacity(images.len());
        for &image in &images {
            match create_image_view(device, image, settings.format.format) {
                Ok(view) => image_views.push(view),
                Err(e) => {
                    for &view in &image_views {
                        device.destroy_image_view(view, None);
                    }
                    swapchain_loader.destroy_swapchain(swapchain, None);
                    return Err(e);
                }
            }
        }

        Ok(Self {
            swapchain,
            images,
            image_views,
            format: settings.format.format,
            extent: settings.extent,
        })
    }

    /// Number of presentable images.
    pub fn image_count(&self) -> usize {
        self.images.len()
    }

    /// Acquire the next image, signalling `semaphore` when it is ready.
    ///
    /// # Safety
    /// All handles must be valid.
    pub unsafe fn acquire_next_image(
        &self,
        swapchain_loader: &ash::khr::swapchain::Device,
        semaphore: vk::Semaphore,
    ) -> Result<AcquireOutcome> {
        let result = swapchain_loader.acquire_next_image(
            self.swapchain,
            u64::MAX,
            semaphore,
            vk::Fence::null(),
        );

        match result {
            Ok((index, suboptimal)) => Ok(AcquireOutcome::Ready { index, suboptimal }),
            Err(vk::Result::ERROR_OUT_OF_DATE_KHR) => Ok(AcquireOutcome::OutOfDate),
            Err(e) => Err(GpuError::from(e)),
        }
    }

    /// Present an image once `wait_semaphores` are signalled.
    ///
    /// # Safety
    /// All handles must be valid.
    pub unsafe fn present(
        &self,
        swapchain_loader: &ash::khr::swapchain::Device,
        queue: vk::Queue,
        image_index: u32,
        wait_semaphores: &[vk::Semaphore],
    ) -> Result<PresentOutcome> {
        let swapchains = [self.swapchain];
        let image_indices = [image_index];

        let present_info = vk::PresentInfoKHR::default()
            .wait_semaphores(wait_semaphores)
            .swapchains(&swapchains)
            .image_indices(&image_indices);

        match swapchain_loader.queue_present(queue, &present_info) {
            Ok(false) => Ok(PresentOutcome::Optimal),
            Ok(true) | Err(vk::Result::ERROR_OUT_OF_DATE_KHR) => Ok(PresentOutcome::NeedsRebuild),
            Err(e) => Err(GpuError::from(e)),
        }
    }

    /// Destroy the image views and the swapchain.
    ///
    /// # Safety
    /// The swapchain must not be in use.
    pub unsafe fn destroy(
        &self,
        device: &ash::Device,
        swapchain_loader: &ash::khr::swapchain::Device,
    ) {
        for &view in &self.image_views {
            device.destroy_image_view(view, None);
        }
        swapchain_loader.destroy_swapchain(self.swapchain, None);
    }
}

unsafe fn create_image_view(
    device: &ash::Device,
    image: vk::Image,
    format: vk::Format,
) -> Result<vk::ImageView> {
    let view_info = vk::ImageViewCreateInfo::default()
        .image(image)
        .view_type(vk::ImageViewType::TYPE_2D)
        .format(format)
        .components(vk::ComponentMapping::default())
        .subresource_range(
            vk::ImageSubresourceRange::default()
                .aspect_mask(vk::ImageAspectFlags::COLOR)
                .base_mip_level(0)
                .level_count(1)
                .base_array_layer(0)
                .layer_count(1),
        );

    Ok(device.create_image_view(&view_info, None)?)
}

/// The device calls used to create and destroy render targets.
///
/// Implemented for [`ash::Device`]; tests substitute a fake.
pub trait TargetDevice {
    /// # Safety
    /// Same contract as `vkCreateRenderPass`.
    unsafe fn create_render_pass(
        &self,
        info: &vk::RenderPassCreateInfo<'_>,
    ) -> VkResult<vk::RenderPass>;

    /// # Safety
    /// `render_pass` must not be in use.
    unsafe fn destroy_render_pass(&self, render_pass: vk::RenderPass);

    /// # Safety
    /// Same contract as `vkCreateFramebuffer`.
    unsafe fn create_framebuffer(
        &self,
        info: &vk::FramebufferCreateInfo<'_>,
    ) -> VkResult<vk::Framebuffer>;

    /// # Safety
    /// `framebuffer` must not be in use.
    unsafe fn destroy_framebuffer(&self, framebuffer: vk::Framebuffer);
}

impl TargetDevice for ash::Device {
    unsafe fn create_render_pass(
        &self,
        info: &vk::RenderPassCreateInfo<'_>,
    ) -> VkResult<vk::RenderPass> {
        ash::Device::create_render_pass(self, info, None)
    }

    unsafe fn destroy_render_pass(&self, render_pass: vk::RenderPass) {
        ash::Device::destroy_render_pass(self, render_pass, None);
    }

    unsafe fn create_framebuffer(
        &self,
        info: &vk::FramebufferCreateInfo<'_>,
    ) -> VkResult<vk::Framebuffer> {
        ash::Device::create_framebuffer(self, info, None)
    }

    unsafe fn destroy_framebuffer(&self, framebuffer: vk::Framebuffer) {
        ash::Device::destroy_framebuffer(self, framebuffer, None);
    }
}

/// Render pass and one framebuffer per swapchain image view.
pub struct RenderTargets {
    pub render_pass: vk::RenderPass,
    pub framebuffers: Vec<vk::Framebuffer>,
}

impl RenderTargets {
    /// Create the render pass and framebuffers for `swapchain`.
    ///
    /// # Safety
    /// The device and swapchain must be valid.
    pub unsafe fn new<D: TargetDevice + ?Sized>(device: &D, swapchain: &Swapchain) -> Result<Self> {
        let render_pass = create_render_pass(device, swapchain.format)?;

        let mut framebuffers = Vec::with_capacity(swapchain.image_views.len());
        for &view in &swapchain.image_views {
            let attachments = [view];
            let framebuffer_info = vk::FramebufferCreateInfo::default()
                .render_pass(render_pass)
                .attachments(&attachments)
                .width(swapchain.extent.width)
                .height(swapchain.extent.height)
                .layers(1);

            match device.create_framebuffer(&framebuffer_info) {
                Ok(framebuffer) => framebuffers.push(framebuffer),
                Err(e) => {
                    for &framebuffer in &framebuffers {
                        device.destroy_framebuffer(framebuffer);
                    }
                    device.destroy_render_pass(render_pass);
                    return Err(e.into());
                }
            }
        }

        tracing::debug!("Created {} framebuffers", framebuffers.len());

        Ok(Self {
            render_pass,
            framebuffers,
        })
    }

    /// Destroy the framebuffers and the render pass.
    ///
    /// # Safety
    /// No command buffer referencing them may be executing.
    pub unsafe fn destroy<D: TargetDevice + ?Sized>(&self, device: &D) {
        for &framebuffer in &self.framebuffers {
            device.destroy_framebuffer(framebuffer);
        }
        device.destroy_render_pass(self.render_pass);
    }
}

/// Single-subpass render pass with one cleared color attachment that ends
/// ready for presentation.
unsafe fn create_render_pass<D: TargetDevice + ?Sized>(
    device: &D,
    format: vk::Format,
) -> Result<vk::RenderPass> {
    let attachments = [vk::AttachmentDescription::default()
        .format(format)
        .samples(vk::SampleCountFlags::TYPE_1)
        .load_op(vk::AttachmentLoadOp::CLEAR)
        .store_op(vk::AttachmentStoreOp::STORE)
        .stencil_load_op(vk::AttachmentLoadOp::DONT_CARE)
        .stencil_store_op(vk::AttachmentStoreOp::DONT_CARE)
        .initial_layout(vk::ImageLayout::UNDEFINED)
        .final_layout(vk::ImageLayout::PRESENT_SRC_KHR)];

    let color_refs = [vk::AttachmentReference::default()
        .attachment(0)
        .layout(vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL)];

    let subpasses = [vk::SubpassDescription::default()
        .pipeline_bind_point(vk::PipelineBindPoint::GRAPHICS)
        .color_attachments(&color_refs)];

    // The layout transition must wait for the acquire semaphore.
    let dependencies = [vk::SubpassDependency::default()
        .src_subpass(vk::SUBPASS_EXTERNAL)
        .dst_subpass(0)
        .src_stage_mask(vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT)
        .src_access_mask(vk::AccessFlags::empty())
        .dst_stage_mask(vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT)
        .dst_access_mask(vk::AccessFlags::COLOR_ATTACHMENT_WRITE)];

    let render_pass_info = vk::RenderPassCreateInfo::default()
        .attachments(&attachments)
        .subpasses(&subpasses)
        .dependencies(&dependencies);

    Ok(device.create_render_pass(&render_pass_info)?)
}

/// Swapchain image count: the surface minimum.
pub fn choose_image_count(capabilities: &vk::SurfaceCapabilitiesKHR) -> u32 {
    capabilities.min_image_count.max(1)
}

/// Calculate swapchain extent.
///
/// `u32::MAX` in `current_extent` means the surface size follows the swapchain,
/// so the window size is clamped into the supported range instead.
pub fn calculate_extent(
    capabilities: &vk::SurfaceCapabilitiesKHR,
    desired_width: u32,
    desired_height: u32,
) -> vk::Extent2D {
    if capabilities.current_extent.width != u32::MAX {
        capabilities.current_extent
    } else {
        vk::Extent2D {
            width: desired_width.clamp(
                capabilities.min_image_extent.width,
                capabilities.max_image_extent.width,
            ),
            height: desired_height.clamp(
                capabilities.min_image_extent.height,
                capabilities.max_image_extent.height,
            ),
        }
    }
}

/// Swapchain images, framebuffers and command buffers must pair up one to one.
pub fn ensure_matching_counts(images: usize, framebuffers: usize, command_buffers: usize) -> Result<()> {
    if images == framebuffers && framebuffers == command_buffers {
        Ok(())
    } else {
        Err(GpuError::InvalidState(format!(
            "{images} swapchain images, {framebuffers} framebuffers, {command_buffers} command buffers"
        )))
    }
}

#[cfg(test)]
pub(crate) mod testing {
    //! Stand-ins for a presentable swapchain and the device that builds its targets.

    use super::{Swapchain, TargetDevice};
    use ash::prelude::VkResult;
    use ash::vk::{self, Handle};
    use std::cell::{Cell, RefCell};

    /// A swapchain with one fake image and view per image, as a driver
    /// reports for `image_count` requested images.
    pub fn fake_swapchain(image_count: u32, format: vk::Format, extent: vk::Extent2D) -> Swapchain {
        let count = u64::from(image_count);
        Swapchain {
            swapchain: vk::SwapchainKHR::from_raw(1),
            images: (0..count).map(|i| vk::Image::from_raw(100 + i)).collect(),
            image_views: (0..count).map(|i| vk::ImageView::from_raw(200 + i)).collect(),
            format,
            extent,
        }
    }

    /// Render pass state captured at creation.
    #[derive(Debug, Clone, Copy)]
    pub struct RenderPassRecord {
        pub format: vk::Format,
        pub final_layout: vk::ImageLayout,
        pub dependency: Option<vk::SubpassDependency>,
    }

    #[derive(Default)]
    pub struct FakeTargetDevice {
        pub(crate) next_handle: Cell<u64>,
        /// Framebuffer creation fails once this many have been created.
        pub fail_framebuffer_at: Option<usize>,
        pub render_passes: RefCell<Vec<RenderPassRecord>>,
        pub render_passes_destroyed: Cell<u32>,
        /// Attachment and size of every framebuffer created.
        pub framebuffers: RefCell<Vec<(vk::ImageView, u32, u32)>>,
        pub framebuffers_destroyed: Cell<u32>,
    }

    impl FakeTargetDevice {
        fn next(&self) -> u64 {
            let handle = self.next_handle.get() + 1;
            self.next_handle.set(handle);
            handle
        }

        pub fn live_framebuffers(&self) -> usize {
            self.framebuffers.borrow().len() - self.framebuffers_destroyed.get() as usize
        }
    }

    impl TargetDevice for FakeTargetDevice {
        unsafe fn create_render_pass(
            &self,
            info: &vk::RenderPassCreateInfo<'_>,
        ) -> VkResult<vk::RenderPass> {
            let attachments =
                std::slice::from_raw_parts(info.p_attachments, info.attachment_count as usize);
            let dependencies =
                std::slice::from_raw_parts(info.p_dependencies, info.dependency_count as usize);
            self.render_passes.borrow_mut().push(RenderPassRecord {
                format: attachments[0].format,
                final_layout: attachments[0].final_layout,
                dependency: dependencies.first().copied(),
            });
            Ok(vk::RenderPass::from_raw(self.next()))
        }

        unsafe fn destroy_render_pass(&self, _render_pass: vk::RenderPass) {
            self.render_passes_destroyed
                .set(self.render_passes_destroyed.get() + 1);
        }

        unsafe fn create_framebuffer(
            &self,
            info: &vk::FramebufferCreateInfo<'_>,
        ) -> VkResult<vk::Framebuffer> {
            let mut framebuffers = self.framebuffers.borrow_mut();
            if self.fail_framebuffer_at == Some(framebuffers.len()) {
                return Err(vk::Result::ERROR_OUT_OF_DEVICE_MEMORY);
            }
            let attachments =
                std::slice::from_raw_parts(info.p_attachments, info.attachment_count as usize);
            framebuffers.push((attachments[0], info.width, info.height));
            Ok(vk::Framebuffer::from_raw(self.next()))
        }

        unsafe fn destroy_framebuffer(&self, _framebuffer: vk::Framebuffer) {
            self.framebuffers_destroyed
                .set(self.framebuffers_destroyed.get() + 1);
        }
    }
}
