// =============================================================================
// SCENE CONTENT - vertex format, mesh loading, per-frame transform
// =============================================================================

use anyhow::{Context, Result};
use ash::vk;
use bytemuck::{Pod, Zeroable};
use glam::{Mat4, Vec2, Vec3};
use std::collections::HashMap;
use std::io::BufRead;
use std::mem::{offset_of, size_of};
use std::path::Path;

use crate::backend::pipeline::VertexInputLayout;

/// Vertex layout shared with shaders/shader.vert (locations 0, 1, 2)
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Pod, Zeroable)]
pub struct Vertex {
    pub pos: Vec3,
    pub color: Vec3,
    pub tex_coord: Vec2,
}

impl Vertex {
    pub const fn new(pos: Vec3, color: Vec3, tex_coord: Vec2) -> Self {
        Self { pos, color, tex_coord }
    }

    pub fn layout() -> VertexInputLayout {
        VertexInputLayout::interleaved(size_of::<Self>())
            .attribute(vk::Format::R32G32B32_SFLOAT, offset_of!(Self, pos))
            .attribute(vk::Format::R32G32B32_SFLOAT, offset_of!(Self, color))
            .attribute(vk::Format::R32G32_SFLOAT, offset_of!(Self, tex_coord))
    }

    /// Bit pattern, for de-duplication (f32 is not `Hash`)
    fn key(&self) -> [u32; 8] {
        bytemuck::cast(*self)
    }
}

/// Indexed triangle list
#[derive(Debug, Default)]
pub struct Mesh {
    pub vertices: Vec<Vertex>,
    pub indices: Vec<u32>,
}

impl Mesh {
    /// Load every model in an OBJ file into one mesh; materials are ignored
    pub fn load_obj(path: &Path) -> Result<Self> {
        let file = std::fs::File::open(path)
            .with_context(|| format!("Failed to open model {:?}", path))?;
        let mesh = Self::from_obj_reader(&mut std::io::BufReader::new(file))
            .with_context(|| format!("Failed to load model {:?}", path))?;

        log::info!(
            "Loaded model {:?}: {} vertices, {} indices",
            path,
            mesh.vertices.len(),
            mesh.indices.len()
        );
        Ok(mesh)
    }

    pub fn from_obj_reader<R: BufRead>(reader: &mut R) -> Result<Self> {
        let (models, _materials) = tobj::load_obj_buf(
            reader,
            &tobj::LoadOptions {
                triangulate: true,
                single_index: true,
                ..Default::default()
            },
            |_| Ok(Default::default()),
        )?;

        let mut mesh = Mesh::default();
        let mut unique: HashMap<[u32; 8], u32> = HashMap::new();

        for model in &models {
            let source = &model.mesh;
            for &index in &source.indices {
                let i = index as usize;
                let pos = source
                    .positions
                    .get(3 * i..3 * i + 3)
                    .context("Vertex index out of range")?;
                // OBJ puts v=0 at the bottom, Vulkan samples from the top
                let tex_coord = match source.texcoords.get(2 * i..2 * i + 2) {
                    Some(uv) => Vec2::new(uv[0], 1.0 - uv[1]),
                    None => Vec2::ZERO,
                };

                let vertex = Vertex::new(Vec3::from_slice(pos), Vec3::ONE, tex_coord);
                let next = mesh.vertices.len() as u32;
                let index = *unique.entry(vertex.key()).or_insert_with(|| {
                    mesh.vertices.push(vertex);
                    next
                });
                mesh.indices.push(index);
            }
        }

        if mesh.indices.is_empty() {
            anyhow::bail!("Model contains no triangles");
        }
        Ok(mesh)
    }
}

/// Uniform block read by the vertex shader (binding 0)
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Pod, Zeroable)]
pub struct UniformBufferObject {
    pub model: Mat4,
    pub view: Mat4,
    pub proj: Mat4,
}

impl UniformBufferObject {
    /// Model spinning 90 degrees per second about Z, seen from (2, 2, 2)
    pub fn spinning(elapsed_secs: f32, aspect: f32) -> Self {
        let model = Mat4::from_rotation_z(elapsed_secs * 90f32.to_radians());
        let view = Mat4::look_at_rh(Vec3::splat(2.0), Vec3::ZERO, Vec3::Z);

        // glam targets a Y-up clip space; Vulkan's Y points down
        let mut proj = Mat4::perspective_rh(45f32.to_radians(), aspect, 0.1, 10.0);
        proj.y_axis.y *= -1.0;

        Self { model, view, proj }
    }
}
