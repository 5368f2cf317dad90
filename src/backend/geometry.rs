// Triangle geometry uploaded for acceleration structure builds
//
// Vertex and index data live in device-local buffers whose device addresses
// feed the BLAS build inputs.

use anyhow::{Context, Result};
use ash::vk;
use bytemuck::{Pod, Zeroable};
use super::buffer::{self, Buffer};
use super::VulkanDevice;

/// Vertex layout matching VK_FORMAT_R32G32B32_SFLOAT
#[repr(C)]
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
pub struct Vertex {
    pub position: [f32; 3],
}

impl Vertex {
    pub const FORMAT: vk::Format = vk::Format::R32G32B32_SFLOAT;
    pub const STRIDE: vk::DeviceSize = std::mem::size_of::<Vertex>() as vk::DeviceSize;
}

/// A single triangle around the origin, the demo's whole scene
pub const TRIANGLE_VERTICES: [Vertex; 3] = [
    Vertex {
        position: [-1.0, 1.0, 0.0],
    },
    Vertex {
        position: [1.0, 1.0, 0.0],
    },
    Vertex {
        position: [0.0, -1.0, 0.0],
    },
];

pub const TRIANGLE_INDICES: [u32; 3] = [0, 1, 2];

/// Device-local mesh buffers used as BLAS build input
pub struct TriangleMesh {
    pub vertex_buffer: Buffer,
    pub index_buffer: Buffer,
    pub vertex_count: u32,
    pub index_count: u32,
}

impl TriangleMesh {
    /// Upload vertices and indices to device-local buffers. Both double as
    /// storage buffers so a future ray tracing pipeline can fetch
    /// attributes by device address.
    pub fn upload(
        device: &VulkanDevice,
        pool: vk::CommandPool,
        vertices: &[Vertex],
        indices: &[u32],
    ) -> Result<Self> {
        if indices.len() % 3 != 0 {
            anyhow::bail!("Index count {} is not a multiple of 3", indices.len());
        }

        let usage = vk::BufferUsageFlags::ACCELERATION_STRUCTURE_BUILD_INPUT_READ_ONLY_KHR
            | vk::BufferUsageFlags::STORAGE_BUFFER
            | vk::BufferUsageFlags::SHADER_DEVICE_ADDRESS;

        let vertex_buffer = buffer::upload_buffer(device, pool, usage, vertices)
            .context("Failed to upload vertex buffer")?;
        let index_buffer = match buffer::upload_buffer(device, pool, usage, indices) {
            Ok(buffer) => buffer,
            Err(e) => {
                vertex_buffer.destroy(device);
                return Err(e).context("Failed to upload index buffer");
            }
        };

        log::info!(
            "Uploaded mesh: {} vertices, {} triangles",
            vertices.len(),
            indices.len() / 3
        );

        Ok(Self {
            vertex_buffer,
            index_buffer,
            vertex_count: vertices.len() as u32,
            index_count: indices.len() as u32,
        })
    }

    pub fn triangle_count(&self) -> u32 {
        self.index_count / 3
    }

    pub fn destroy(&self, device: &VulkanDevice) {
        self.index_buffer.destroy(device);
        self.vertex_buffer.destroy(device);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn vertex_stride_matches_float3_format() {
        assert_eq!(Vertex::STRIDE, 12);
        assert_eq!(std::mem::align_of::<Vertex>(), 4);
    }

    #[test]
    fn vertex_bytes_are_raw_floats() {
        let vertex = Vertex {
            position: [1.0, 2.0, 3.0],
        };
        let bytes: &[u8] = bytemuck::bytes_of(&vertex);
        assert_eq!(bytes.len(), 12);
        assert_eq!(&bytes[0..4], 1.0f32.to_ne_bytes());
        assert_eq!(&bytes[4..8], 2.0f32.to_ne_bytes());
        assert_eq!(&bytes[8..12], 3.0f32.to_ne_bytes());
    }

    #[test]
    fn demo_triangle_is_one_primitive() {
        assert_eq!(TRIANGLE_VERTICES.len(), 3);
        assert_eq!(TRIANGLE_INDICES.len() % 3, 0);
        assert!(TRIANGLE_INDICES
            .iter()
            .all(|&i| (i as usize) < TRIANGLE_VERTICES.len()));
    }
}
