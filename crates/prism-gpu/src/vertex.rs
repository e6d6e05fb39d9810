//! Vertex, instance and uniform data layouts shared with the shaders.

use ash::vk;
use bytemuck::{Pod, Zeroable};
use glam::Vec4;
use std::mem::{offset_of, size_of};

/// Per-vertex data: 2D position and RGB color.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Pod, Zeroable)]
pub struct Vertex {
    pub position: [f32; 2],
    pub color: [f32; 3],
}

impl Vertex {
    pub const fn new(position: [f32; 2], color: [f32; 3]) -> Self {
        Self { position, color }
    }
}

/// Per-instance data: offset added to every vertex position.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Pod, Zeroable)]
pub struct InstanceData {
    pub offset: [f32; 2],
}

impl InstanceData {
    pub const fn new(offset: [f32; 2]) -> Self {
        Self { offset }
    }
}

/// Fragment-stage uniform: a single RGBA color.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Pod, Zeroable)]
pub struct ColorUniform {
    pub color: Vec4,
}

/// Byte size of [`ColorUniform`], and therefore of the uniform buffer and its descriptor range.
pub const COLOR_UNIFORM_SIZE: vk::DeviceSize = size_of::<ColorUniform>() as vk::DeviceSize;

impl ColorUniform {
    pub const fn new(color: Vec4) -> Self {
        Self { color }
    }

    /// Slowly cycling color for `seconds` since startup. Components stay in `[0, 1]`.
    pub fn from_elapsed(seconds: f32) -> Self {
        Self::new(Vec4::new(
            0.5 + 0.5 * seconds.sin(),
            0.5 + 0.5 * (seconds * 0.7).cos(),
            0.5 + 0.5 * (seconds * 1.3).sin(),
            1.0,
        ))
    }
}

/// Vertex input layout of the graphics pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum VertexInputLayout {
    /// No vertex buffers; the vertex shader generates positions itself.
    Empty,
    /// Binding 0 carries [`Vertex`] per vertex; binding 1 optionally carries
    /// [`InstanceData`] per instance.
    #[default]
    PerVertex,
}

/// Binding index of the per-vertex stream.
pub const VERTEX_BINDING: u32 = 0;
/// Binding index of the per-instance stream.
pub const INSTANCE_BINDING: u32 = 1;

impl VertexInputLayout {
    /// Binding descriptions for this layout.
    pub fn bindings(self, instanced: bool) -> Vec<vk::VertexInputBindingDescription> {
        match self {
            Self::Empty => Vec::new(),
            Self::PerVertex => {
                let mut bindings = vec![vk::VertexInputBindingDescription {
                    binding: VERTEX_BINDING,
                    stride: size_of::<Vertex>() as u32,
                    input_rate: vk::VertexInputRate::VERTEX,
                }];
                if instanced {
                    bindings.push(vk::VertexInputBindingDescription {
                        binding: INSTANCE_BINDING,
                        stride: size_of::<InstanceData>() as u32,
                        input_rate: vk::VertexInputRate::INSTANCE,
                    });
                }
                bindings
            }
        }
    }

    /// Attribute descriptions for this layout.
    pub fn attributes(self, instanced: bool) -> Vec<vk::VertexInputAttributeDescription> {
        match self {
            Self::Empty => Vec::new(),
            Self::PerVertex => {
                let mut attributes = vec![
                    vk::VertexInputAttributeDescription {
                        location: 0,
                        binding: VERTEX_BINDING,
                        format: vk::Format::R32G32_SFLOAT,
                        offset: offset_of!(Vertex, position) as u32,
                    },
                    vk::VertexInputAttributeDescription {
                        location: 1,
                        binding: VERTEX_BINDING,
                        format: vk::Format::R32G32B32_SFLOAT,
                        offset: offset_of!(Vertex, color) as u32,
                    },
                ];
                if instanced {
                    attributes.push(vk::VertexInputAttributeDescription {
                        location: 2,
                        binding: INSTANCE_BINDING,
                        format: vk::Format::R32G32_SFLOAT,
                        offset: offset_of!(InstanceData, offset) as u32,
                    });
                }
                attributes
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn layouts_match_shader_expectations() {
        assert_eq!(size_of::<Vertex>(), 20);
        assert_eq!(offset_of!(Vertex, color), 8);
        assert_eq!(size_of::<InstanceData>(), 8);
        assert_eq!(COLOR_UNIFORM_SIZE, 16);
    }

    #[test]
    fn empty_layout_has_no_streams() {
        assert!(VertexInputLayout::Empty.bindings(true).is_empty());
        assert!(VertexInputLayout::Empty.attributes(true).is_empty());
    }

    #[test]
    fn per_vertex_layout_without_instances() {
        let bindings = VertexInputLayout::PerVertex.bindings(false);
        let attributes = VertexInputLayout::PerVertex.attributes(false);

        assert_eq!(bindings.len(), 1);
        assert_eq!(bindings[0].input_rate, vk::VertexInputRate::VERTEX);
        assert_eq!(bindings[0].stride, 20);
        assert_eq!(attributes.len(), 2);
        assert!(attributes.iter().all(|a| a.binding == VERTEX_BINDING));
    }

    #[test]
    fn per_vertex_layout_with_instance_stream() {
        let bindings = VertexInputLayout::PerVertex.bindings(true);
        let attributes = VertexInputLayout::PerVertex.attributes(true);

        assert_eq!(bindings.len(), 2);
        assert_eq!(bindings[1].binding, INSTANCE_BINDING);
        assert_eq!(bindings[1].input_rate, vk::VertexInputRate::INSTANCE);
        assert_eq!(bindings[1].stride, 8);

        let offset = attributes.iter().find(|a| a.location == 2).unwrap();
        assert_eq!(offset.binding, INSTANCE_BINDING);
        assert_eq!(offset.format, vk::Format::R32G32_SFLOAT);
    }

    #[test]
    fn elapsed_color_is_opaque_and_in_range() {
        for step in 0..100 {
            let uniform = ColorUniform::from_elapsed(step as f32 * 0.37);
            assert!(uniform.color.cmpge(Vec4::ZERO).all());
            assert!(uniform.color.cmple(Vec4::ONE).all());
            assert_eq!(uniform.color.w, 1.0);
        }
    }
}
