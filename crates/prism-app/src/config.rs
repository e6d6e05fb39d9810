//! Application and renderer configuration.

use prism_gpu::{DrawCommand, GpuError, ShaderPaths, VertexInputLayout};

use crate::geometry::Geometry;

/// Pipeline variant and draw plan.
#[derive(Debug, Clone, PartialEq)]
pub struct RenderConfig {
    /// Vertex input of the graphics pipeline.
    pub vertex_input: VertexInputLayout,
    /// Instances drawn by every draw call.
    pub instance_count: u32,
    /// Bind the per-instance offset stream at binding 1.
    pub instance_buffer: bool,
    /// Record a second, non-indexed three-vertex draw after the indexed one.
    pub overlay_draw: bool,
    /// Clear color of the single color attachment.
    pub clear_color: [f32; 4],
}

impl Default for RenderConfig {
    fn default() -> Self {
        Self {
            vertex_input: VertexInputLayout::PerVertex,
            instance_count: 5,
            instance_buffer: true,
            overlay_draw: false,
            clear_color: [0.1, 0.1, 0.1, 1.0],
        }
    }
}

impl RenderConfig {
    /// Set the vertex input layout.
    pub fn with_vertex_input(mut self, vertex_input: VertexInputLayout) -> Self {
        self.vertex_input = vertex_input;
        self
    }

    /// Set the number of instances per draw.
    pub fn with_instance_count(mut self, count: u32) -> Self {
        self.instance_count = count;
        self
    }

    /// Enable or disable the per-instance vertex stream.
    pub fn with_instance_buffer(mut self, enabled: bool) -> Self {
        self.instance_buffer = enabled;
        self
    }

    /// Enable or disable the trailing non-indexed draw.
    pub fn with_overlay_draw(mut self, enabled: bool) -> Self {
        self.overlay_draw = enabled;
        self
    }

    /// Set the clear color.
    pub fn with_clear_color(mut self, color: [f32; 4]) -> Self {
        self.clear_color = color;
        self
    }

    /// Whether the pipeline reads the instance stream.
    pub fn instanced(&self) -> bool {
        self.vertex_input == VertexInputLayout::PerVertex && self.instance_buffer
    }

    /// Check the configuration against the geometry it will draw.
    pub fn validate(&self, geometry: &Geometry) -> prism_gpu::Result<()> {
        if self.instance_count == 0 {
            return Err(GpuError::InvalidState("instance count must be at least 1".into()));
        }

        match self.vertex_input {
            VertexInputLayout::Empty => {
                if self.instance_buffer {
                    return Err(GpuError::InvalidState(
                        "an instance buffer needs the per-vertex input layout".into(),
                    ));
                }
            }
            VertexInputLayout::PerVertex => {
                if geometry.vertices.is_empty() || geometry.indices.is_empty() {
                    return Err(GpuError::InvalidState(
                        "per-vertex input needs vertices and indices".into(),
                    ));
                }
                if self.instance_buffer && self.instance_count as usize > geometry.instances.len() {
                    return Err(GpuError::InvalidState(format!(
                        "{} instances requested but only {} instance offsets supplied",
                        self.instance_count,
                        geometry.instances.len()
                    )));
                }
            }
        }

        Ok(())
    }

    /// Validate against `geometry` and produce the draw plan for it.
    pub fn plan(&self, geometry: &Geometry) -> prism_gpu::Result<Vec<DrawCommand>> {
        self.validate(geometry)?;
        Ok(self.draw_commands(geometry.index_count()))
    }

    /// Draw calls recorded into every command buffer.
    pub fn draw_commands(&self, index_count: u32) -> Vec<DrawCommand> {
        let triangle = DrawCommand::Vertices {
            vertex_count: 3,
            instance_count: self.instance_count,
        };

        match self.vertex_input {
            VertexInputLayout::Empty => vec![triangle],
            VertexInputLayout::PerVertex => {
                let mut draws = vec![DrawCommand::Indexed {
                    index_count,
                    instance_count: self.instance_count,
                }];
                if self.overlay_draw {
                    draws.push(triangle);
                }
                draws
            }
        }
    }
}

/// Application configuration.
#[derive(Debug, Clone)]
pub struct AppConfig {
    /// Window title, also reported to the driver as the application name.
    pub title: String,
    /// Initial window width.
    pub width: u32,
    /// Initial window height.
    pub height: u32,
    /// Enable Vulkan validation layers (default: debug builds only).
    pub validation: bool,
    /// SPIR-V binaries for the two shader stages.
    pub shaders: ShaderPaths,
    /// Pipeline variant and draw plan.
    pub render: RenderConfig,
    /// Geometry uploaded once at startup.
    pub geometry: Geometry,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            title: "Prism".to_string(),
            width: 800,
            height: 800,
            validation: cfg!(debug_assertions),
            shaders: ShaderPaths::new("assets/shaders/quad.vert.spv", "assets/shaders/quad.frag.spv"),
            render: RenderConfig::default(),
            geometry: Geometry::instanced_squares(),
        }
    }
}

impl AppConfig {
    /// Create a new config with the given title.
    pub fn new(title: impl Into<String>) -> Self {
        Self {
            title: title.into(),
            ..Default::default()
        }
    }

    /// Set the window dimensions.
    pub fn with_size(mut self, width: u32, height: u32) -> Self {
        self.width = width;
        self.height = height;
        self
    }

    /// Enable or disable validation layers.
    pub fn with_validation(mut self, validation: bool) -> Self {
        self.validation = validation;
        self
    }

    /// Set the shader binary paths.
    pub fn with_shaders(mut self, shaders: ShaderPaths) -> Self {
        self.shaders = shaders;
        self
    }

    /// Set the renderer configuration.
    pub fn with_render(mut self, render: RenderConfig) -> Self {
        self.render = render;
        self
    }

    /// Set the geometry to draw.
    pub fn with_geometry(mut self, geometry: Geometry) -> Self {
        self.geometry = geometry;
        self
    }
}
