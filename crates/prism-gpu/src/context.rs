//! GPU context management.

use crate::device_info::PhysicalDeviceInfo;
use crate::error::{GpuError, Result};
use crate::instance::{create_instance, select_physical_device};
use crate::surface::SurfaceContext;
use ash::vk;
use raw_window_handle::{HasDisplayHandle, HasWindowHandle};
use std::ffi::{c_char, CStr};

/// Main GPU context holding the instance, surface, logical device and its queue.
pub struct GpuContext {
    // Entry must be kept alive for the lifetime of the context
    #[allow(dead_code)]
    pub(crate) entry: ash::Entry,
    pub(crate) instance: ash::Instance,
    pub(crate) surface: SurfaceContext,
    pub(crate) physical_device: vk::PhysicalDevice,
    pub(crate) device_info: PhysicalDeviceInfo,
    pub(crate) device: ash::Device,
    pub(crate) swapchain_loader: ash::khr::swapchain::Device,

    // One family serves both graphics and presentation.
    pub(crate) graphics_queue_family: u32,
    pub(crate) graphics_queue: vk::Queue,
}

impl GpuContext {
    /// Get the Vulkan device handle.
    pub fn device(&self) -> &ash::Device {
        &self.device
    }

    /// Get the physical device handle.
    pub fn physical_device(&self) -> vk::PhysicalDevice {
        self.physical_device
    }

    /// Get the information queried from the physical device.
    pub fn device_info(&self) -> &PhysicalDeviceInfo {
        &self.device_info
    }

    /// Get the device's memory type table.
    pub fn memory_properties(&self) -> &vk::PhysicalDeviceMemoryProperties {
        &self.device_info.memory_properties
    }

    /// Get the presentation surface.
    pub fn surface(&self) -> &SurfaceContext {
        &self.surface
    }

    /// Get the swapchain extension loader.
    pub fn swapchain_loader(&self) -> &ash::khr::swapchain::Device {
        &self.swapchain_loader
    }

    /// Get the graphics (and present) queue.
    pub fn graphics_queue(&self) -> vk::Queue {
        self.graphics_queue
    }

    /// Get the graphics queue family index.
    pub fn graphics_queue_family(&self) -> u32 {
        self.graphics_queue_family
    }

    /// Get the Vulkan instance handle.
    pub fn instance(&self) -> &ash::Instance {
        &self.instance
    }

    /// Wait for device to be idle.
    pub fn wait_idle(&self) -> Result<()> {
        unsafe {
            self.device.device_wait_idle()?;
        }
        Ok(())
    }
}

impl Drop for GpuContext {
    fn drop(&mut self) {
        unsafe {
            let _ = self.device.device_wait_idle();

            self.device.destroy_device(None);
            self.surface.destroy();
            self.instance.destroy_instance(None);
        }
    }
}

/// Builder for creating a GPU context.
pub struct GpuContextBuilder {
    app_name: String,
    enable_validation: bool,
}

impl Default for GpuContextBuilder {
    fn default() -> Self {
        Self {
            app_name: "Prism".to_string(),
            enable_validation: cfg!(debug_assertions),
        }
    }
}

impl GpuContextBuilder {
    /// Create a new builder.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the application name.
    pub fn app_name(mut self, name: impl Into<String>) -> Self {
        self.app_name = name.into();
        self
    }

    /// Enable or disable validation layers.
    pub fn validation(mut self, enable: bool) -> Self {
        self.enable_validation = enable;
        self
    }

    /// Build the GPU context for presenting to `window`.
    ///
    /// # Safety
    /// The window must outlive the returned context.
    pub unsafe fn build<W>(self, window: &W) -> Result<GpuContext>
    where
        W: HasDisplayHandle + HasWindowHandle,
    {
        let entry = ash::Entry::load()
            .map_err(|e| GpuError::Other(format!("Failed to load Vulkan: {e}")))?;

        let display = window
            .display_handle()
            .map_err(|e| GpuError::SurfaceCreation(format!("Failed to get display handle: {e}")))?
            .as_raw();

        let instance = create_instance(&entry, &self.app_name, display, self.enable_validation)?;

        let surface = match SurfaceContext::from_window(&entry, &instance, window) {
            Ok(surface) => surface,
            Err(e) => {
                instance.destroy_instance(None);
                return Err(e);
            }
        };

        let (physical_device, device_info, graphics_queue_family, device) =
            match select_device(&instance, &surface) {
                Ok(selected) => selected,
                Err(e) => {
                    surface.destroy();
                    instance.destroy_instance(None);
                    return Err(e);
                }
            };

        tracing::info!("Selected GPU: {}", device_info.summary());
        tracing::debug!("Graphics/present queue family: {graphics_queue_family}");

        let graphics_queue = device.get_device_queue(graphics_queue_family, 0);
        let swapchain_loader = ash::khr::swapchain::Device::new(&instance, &device);

        Ok(GpuContext {
            entry,
            instance,
            surface,
            physical_device,
            device_info,
            device,
            swapchain_loader,
            graphics_queue_family,
            graphics_queue,
        })
    }
}

/// Pick the physical device and queue family, then create the logical device.
unsafe fn select_device(
    instance: &ash::Instance,
    surface: &SurfaceContext,
) -> Result<(vk::PhysicalDevice, PhysicalDeviceInfo, u32, ash::Device)> {
    let physical_device = select_physical_device(instance)?;
    let device_info = PhysicalDeviceInfo::query(instance, physical_device);

    let graphics_queue_family = select_queue_family(&device_info.queue_families, |index| {
        surface.supports_queue_family(physical_device, index)
    })?;

    let device = create_device(instance, physical_device, graphics_queue_family)?;

    Ok((physical_device, device_info, graphics_queue_family, device))
}

/// Select the first queue family with graphics support that can present.
pub fn select_queue_family<F>(
    families: &[vk::QueueFamilyProperties],
    mut supports_present: F,
) -> Result<u32>
where
    F: FnMut(u32) -> Result<bool>,
{
    for (index, family) in (0u32..).zip(families) {
        if family.queue_flags.contains(vk::QueueFlags::GRAPHICS) && supports_present(index)? {
            return Ok(index);
        }
    }

    Err(GpuError::NoSuitableQueueFamily)
}

/// Required device extensions.
fn required_device_extensions() -> Vec<&'static CStr> {
    vec![
        ash::khr::swapchain::NAME,
        #[cfg(target_os = "macos")]
        ash::khr::portability_subset::NAME,
    ]
}

/// Create the logical device with a single queue at priority 1.0.
///
/// # Safety
/// The instance and physical device must be valid.
unsafe fn create_device(
    instance: &ash::Instance,
    physical_device: vk::PhysicalDevice,
    queue_family: u32,
) -> Result<ash::Device> {
    let queue_priority = 1.0_f32;
    let queue_create_infos = [vk::DeviceQueueCreateInfo::default()
        .queue_family_index(queue_family)
        .queue_priorities(std::slice::from_ref(&queue_priority))];

    let extensions = required_device_extensions();
    let extension_names: Vec<*const c_char> = extensions.iter().map(|ext| ext.as_ptr()).collect();

    let features = vk::PhysicalDeviceFeatures::default();

    let device_create_info = vk::DeviceCreateInfo::default()
        .queue_create_infos(&queue_create_infos)
        .enabled_extension_names(&extension_names)
        .enabled_features(&features);

    let device = instance
        .create_device(physical_device, &device_create_info, None)
        .map_err(GpuError::from)?;

    Ok(device)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn family(flags: vk::QueueFlags) -> vk::QueueFamilyProperties {
        vk::QueueFamilyProperties {
            queue_flags: flags,
            queue_count: 1,
            ..Default::default()
        }
    }

    #[test]
    fn first_graphics_family_with_present_is_selected() {
        let families = [
            family(vk::QueueFlags::COMPUTE),
            family(vk::QueueFlags::GRAPHICS | vk::QueueFlags::COMPUTE),
            family(vk::QueueFlags::GRAPHICS),
        ];

        let index = select_queue_family(&families, |_| Ok(true)).unwrap();
        assert_eq!(index, 1);
    }

    #[test]
    fn graphics_family_without_present_is_skipped() {
        let families = [
            family(vk::QueueFlags::GRAPHICS),
            family(vk::QueueFlags::TRANSFER),
            family(vk::QueueFlags::GRAPHICS),
        ];

        let index = select_queue_family(&families, |i| Ok(i == 2)).unwrap();
        assert_eq!(index, 2);
    }

    #[test]
    fn present_only_family_is_not_enough() {
        let families = [family(vk::QueueFlags::COMPUTE | vk::QueueFlags::TRANSFER)];

        let result = select_queue_family(&families, |_| Ok(true));
        assert!(matches!(result, Err(GpuError::NoSuitableQueueFamily)));
    }

    #[test]
    fn present_query_errors_propagate() {
        let families = [family(vk::QueueFlags::GRAPHICS)];

        let result = select_queue_family(&families, |_| {
            Err(GpuError::Vulkan(vk::Result::ERROR_SURFACE_LOST_KHR))
        });
        assert!(matches!(
            result,
            Err(GpuError::Vulkan(vk::Result::ERROR_SURFACE_LOST_KHR))
        ));
    }

    #[test]
    fn swapchain_extension_is_required() {
        assert!(required_device_extensions().contains(&ash::khr::swapchain::NAME));
    }
}
