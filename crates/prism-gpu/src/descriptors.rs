//! Descriptor set management.

use crate::error::Result;
use crate::memory::GpuBuffer;
use ash::vk;

/// Binding of the color uniform in set 0.
pub const COLOR_UNIFORM_BINDING: u32 = 0;

/// Descriptor set layout builder.
pub struct DescriptorSetLayoutBuilder<'a> {
    bindings: Vec<vk::DescriptorSetLayoutBinding<'a>>,
}

impl DescriptorSetLayoutBuilder<'_> {
    /// Create a new builder.
    pub fn new() -> Self {
        Self {
            bindings: Vec::new(),
        }
    }

    /// Add a binding.
    pub fn binding(
        mut self,
        binding: u32,
        descriptor_type: vk::DescriptorType,
        count: u32,
        stage_flags: vk::ShaderStageFlags,
    ) -> Self {
        self.bindings.push(
            vk::DescriptorSetLayoutBinding::default()
                .binding(binding)
                .descriptor_type(descriptor_type)
                .descriptor_count(count)
                .stage_flags(stage_flags),
        );
        self
    }

    /// Add a uniform buffer binding.
    pub fn uniform_buffer(self, binding: u32, stage_flags: vk::ShaderStageFlags) -> Self {
        self.binding(binding, vk::DescriptorType::UNIFORM_BUFFER, 1, stage_flags)
    }

    /// Bindings added so far.
    pub fn bindings(&self) -> &[vk::DescriptorSetLayoutBinding<'_>] {
        &self.bindings
    }

    /// Build the descriptor set layout.
    ///
    /// # Safety
    /// The device must be valid.
    pub unsafe fn build(self, device: &ash::Device) -> Result<vk::DescriptorSetLayout> {
        let layout_info = vk::DescriptorSetLayoutCreateInfo::default().bindings(&self.bindings);

        let layout = device.create_descriptor_set_layout(&layout_info, None)?;
        Ok(layout)
    }
}

impl Default for DescriptorSetLayoutBuilder<'_> {
    fn default() -> Self {
        Self::new()
    }
}

/// Descriptor pool for allocating descriptor sets.
pub struct DescriptorPool {
    pool: vk::DescriptorPool,
}

impl DescriptorPool {
    /// Create a new descriptor pool.
    ///
    /// # Safety
    /// The device must be valid.
    pub unsafe fn new(
        device: &ash::Device,
        max_sets: u32,
        pool_sizes: &[vk::DescriptorPoolSize],
    ) -> Result<Self> {
        let create_info = vk::DescriptorPoolCreateInfo::default()
            .max_sets(max_sets)
            .pool_sizes(pool_sizes);

        let pool = device.create_descriptor_pool(&create_info, None)?;
        Ok(Self { pool })
    }

    /// Allocate descriptor sets.
    ///
    /// # Safety
    /// The device must be valid.
    pub unsafe fn allocate(
        &self,
        device: &ash::Device,
        layouts: &[vk::DescriptorSetLayout],
    ) -> Result<Vec<vk::DescriptorSet>> {
        let alloc_info = vk::DescriptorSetAllocateInfo::default()
            .descriptor_pool(self.pool)
            .set_layouts(layouts);

        let sets = device.allocate_descriptor_sets(&alloc_info)?;
        Ok(sets)
    }

    /// Destroy the pool and every set allocated from it.
    ///
    /// # Safety
    /// The device must be valid and the pool must not be in use.
    pub unsafe fn destroy(&self, device: &ash::Device) {
        device.destroy_descriptor_pool(self.pool, None);
    }
}

/// Descriptor range covering the whole of `buffer`.
pub fn uniform_buffer_info(buffer: &GpuBuffer) -> vk::DescriptorBufferInfo {
    vk::DescriptorBufferInfo::default()
        .buffer(buffer.buffer)
        .offset(0)
        .range(buffer.size)
}

/// Write a uniform buffer descriptor.
///
/// # Safety
/// Device and buffer must be valid.
pub unsafe fn write_uniform_buffer(
    device: &ash::Device,
    dst_set: vk::DescriptorSet,
    binding: u32,
    buffer_info: vk::DescriptorBufferInfo,
) {
    let write = vk::WriteDescriptorSet::default()
        .dst_set(dst_set)
        .dst_binding(binding)
        .descriptor_type(vk::DescriptorType::UNIFORM_BUFFER)
        .buffer_info(std::slice::from_ref(&buffer_info));

    device.update_descriptor_sets(&[write], &[]);
}

/// The single descriptor set exposing the color uniform to the fragment stage.
///
/// Written once at creation; survives swapchain rebuilds.
pub struct UniformDescriptor {
    pub layout: vk::DescriptorSetLayout,
    pub pool: DescriptorPool,
    pub set: vk::DescriptorSet,
}

impl UniformDescriptor {
    /// Create the layout, a pool for one set, and the set pointing at `uniform_buffer`.
    ///
    /// # Safety
    /// The device and buffer must be valid.
    pub unsafe fn new(device: &ash::Device, uniform_buffer: &GpuBuffer) -> Result<Self> {
        let layout = DescriptorSetLayoutBuilder::new()
            .uniform_buffer(COLOR_UNIFORM_BINDING, vk::ShaderStageFlags::FRAGMENT)
            .build(device)?;

        let pool_sizes = [vk::DescriptorPoolSize {
            ty: vk::DescriptorType::UNIFORM_BUFFER,
            descriptor_count: 1,
        }];
        let pool = match DescriptorPool::new(device, 1, &pool_sizes) {
            Ok(pool) => pool,
            Err(e) => {
                device.destroy_descriptor_set_layout(layout, None);
                return Err(e);
            }
        };

        let set = match pool.allocate(device, &[layout]) {
            Ok(sets) => sets[0],
            Err(e) => {
                pool.destroy(device);
                device.destroy_descriptor_set_layout(layout, None);
                return Err(e);
            }
        };

        write_uniform_buffer(
            device,
            set,
            COLOR_UNIFORM_BINDING,
            uniform_buffer_info(uniform_buffer),
        );

        tracing::debug!("Uniform descriptor written ({} bytes)", uniform_buffer.size);

        Ok(Self { layout, pool, set })
    }

    /// Destroy the pool (freeing the set) and the layout.
    ///
    /// # Safety
    /// No command buffer using the set may be executing.
    pub unsafe fn destroy(&self, device: &ash::Device) {
        self.pool.destroy(device);
        device.destroy_descriptor_set_layout(self.layout, None);
    }
}
