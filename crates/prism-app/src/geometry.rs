//! Immutable geometry uploaded once at startup.

use prism_gpu::{InstanceData, Vertex};

/// Vertex, index and instance arrays drawn every frame.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Geometry {
    pub vertices: Vec<Vertex>,
    pub indices: Vec<u16>,
    pub instances: Vec<InstanceData>,
}

impl Geometry {
    /// A 0.2-wide red square drawn at five offsets.
    pub fn instanced_squares() -> Self {
        const RED: [f32; 3] = [1.0, 0.0, 0.0];

        Self {
            vertices: vec![
                Vertex::new([-0.1, -0.1], RED),
                Vertex::new([0.1, -0.1], RED),
                Vertex::new([0.1, 0.1], RED),
                Vertex::new([-0.1, 0.1], RED),
            ],
            indices: vec![0, 1, 2, 2, 3, 0],
            instances: vec![
                InstanceData::new([-0.4, -0.4]),
                InstanceData::new([0.4, -0.4]),
                InstanceData::new([0.0, 0.4]),
                InstanceData::new([-0.2, 0.0]),
                InstanceData::new([0.2, 0.0]),
            ],
        }
    }

    /// Number of indices, as passed to the indexed draw.
    pub fn index_count(&self) -> u32 {
        u32::try_from(self.indices.len()).unwrap_or(u32::MAX)
    }

    /// Byte sizes of the vertex, index and instance arrays.
    pub fn byte_sizes(&self) -> (u64, u64, u64) {
        (
            std::mem::size_of_val(self.vertices.as_slice()) as u64,
            std::mem::size_of_val(self.indices.as_slice()) as u64,
            std::mem::size_of_val(self.instances.as_slice()) as u64,
        )
    }
}
