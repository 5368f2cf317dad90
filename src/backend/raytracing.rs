// Acceleration structure construction
//
// BLAS: spatial index over one mesh's triangles. TLAS: index over placed
// instances of BLAS objects. Both follow the same sequence: assemble the
// geometry descriptor from buffer device addresses, ask the driver for
// storage and scratch sizes, allocate those buffers, create the structure
// inside the storage buffer, and build it with a one-shot command buffer.

use anyhow::{Context, Result};
use ash::vk;
use glam::Mat4;
use super::buffer::{self, Buffer};
use super::command;
use super::geometry::{TriangleMesh, Vertex};
use super::VulkanDevice;

/// Extension function table for VK_KHR_acceleration_structure
pub struct RayTracingContext {
    pub loader: ash::extensions::khr::AccelerationStructure,
}

impl RayTracingContext {
    pub fn new(device: &VulkanDevice) -> Self {
        let loader =
            ash::extensions::khr::AccelerationStructure::new(&device.instance, &device.device);
        Self { loader }
    }
}

/// A built acceleration structure, its storage buffer, and its device
/// address. The address is what TLAS instances and shaders reference, so
/// the buffer must outlive every structure that points at it.
pub struct AccelerationStructure {
    pub handle: vk::AccelerationStructureKHR,
    pub buffer: Buffer,
    pub address: vk::DeviceAddress,
}

impl AccelerationStructure {
    pub fn destroy(&self, device: &VulkanDevice, context: &RayTracingContext) {
        unsafe {
            context.loader.destroy_acceleration_structure(self.handle, None);
        }
        self.buffer.destroy(device);
    }
}

/// One placement of a BLAS inside a TLAS
pub struct BlasInstance {
    pub blas_address: vk::DeviceAddress,
    pub transform: Mat4,
    /// 24-bit value exposed to shaders as gl_InstanceCustomIndexEXT
    pub custom_index: u32,
    /// Visibility mask tested against the traceRay cull mask
    pub mask: u8,
}

impl BlasInstance {
    fn to_vk(&self) -> vk::AccelerationStructureInstanceKHR {
        vk::AccelerationStructureInstanceKHR {
            transform: transform_to_khr(&self.transform),
            instance_custom_index_and_mask: vk::Packed24_8::new(
                self.custom_index & 0x00ff_ffff,
                self.mask,
            ),
            instance_shader_binding_table_record_offset_and_flags: vk::Packed24_8::new(
                0,
                vk::GeometryInstanceFlagsKHR::TRIANGLE_FACING_CULL_DISABLE.as_raw() as u8,
            ),
            acceleration_structure_reference: vk::AccelerationStructureReferenceKHR {
                device_handle: self.blas_address,
            },
        }
    }
}

/// Convert a column-major Mat4 into the row-major 3x4 matrix the
/// acceleration structure API expects. The dropped fourth row is assumed
/// affine.
pub fn transform_to_khr(transform: &Mat4) -> vk::TransformMatrixKHR {
    let m = transform.transpose().to_cols_array();
    let mut matrix = [0.0f32; 12];
    matrix.copy_from_slice(&m[0..12]);
    vk::TransformMatrixKHR { matrix }
}

/// Build a bottom-level acceleration structure over a triangle mesh
pub fn build_blas(
    device: &VulkanDevice,
    context: &RayTracingContext,
    pool: vk::CommandPool,
    mesh: &TriangleMesh,
    prefer_fast_trace: bool,
) -> Result<AccelerationStructure> {
    let vertex_address = mesh.vertex_buffer.device_address(device);
    let index_address = mesh.index_buffer.device_address(device);

    let triangles = vk::AccelerationStructureGeometryTrianglesDataKHR::builder()
        .vertex_format(Vertex::FORMAT)
        .vertex_data(vk::DeviceOrHostAddressConstKHR {
            device_address: vertex_address,
        })
        .vertex_stride(Vertex::STRIDE)
        .max_vertex(mesh.vertex_count.saturating_sub(1))
        .index_type(vk::IndexType::UINT32)
        .index_data(vk::DeviceOrHostAddressConstKHR {
            device_address: index_address,
        })
        .build();

    let geometry = vk::AccelerationStructureGeometryKHR::builder()
        .geometry_type(vk::GeometryTypeKHR::TRIANGLES)
        .flags(vk::GeometryFlagsKHR::OPAQUE)
        .geometry(vk::AccelerationStructureGeometryDataKHR { triangles })
        .build();

    let flags = if prefer_fast_trace {
        vk::BuildAccelerationStructureFlagsKHR::PREFER_FAST_TRACE
    } else {
        vk::BuildAccelerationStructureFlagsKHR::empty()
    };

    let blas = create_and_build(
        device,
        context,
        pool,
        vk::AccelerationStructureTypeKHR::BOTTOM_LEVEL,
        &geometry,
        mesh.triangle_count(),
        flags,
    )
    .context("Failed to build BLAS")?;

    log::info!(
        "Built BLAS over {} triangles at device address {:#x}",
        mesh.triangle_count(),
        blas.address
    );

    Ok(blas)
}

/// Build a top-level acceleration structure over the given instances
pub fn build_tlas(
    device: &VulkanDevice,
    context: &RayTracingContext,
    pool: vk::CommandPool,
    instances: &[BlasInstance],
    allow_update: bool,
) -> Result<AccelerationStructure> {
    if instances.is_empty() {
        anyhow::bail!("Cannot build a TLAS with no instances");
    }

    let records: Vec<vk::AccelerationStructureInstanceKHR> =
        instances.iter().map(BlasInstance::to_vk).collect();

    // Instance records are build input read by the GPU, so they go
    // device-local like the mesh buffers.
    let instance_buffer = buffer::upload_buffer(
        device,
        pool,
        vk::BufferUsageFlags::ACCELERATION_STRUCTURE_BUILD_INPUT_READ_ONLY_KHR
            | vk::BufferUsageFlags::SHADER_DEVICE_ADDRESS,
        &records,
    )
    .context("Failed to upload TLAS instance buffer")?;

    let instances_data = vk::AccelerationStructureGeometryInstancesDataKHR::builder()
        .array_of_pointers(false)
        .data(vk::DeviceOrHostAddressConstKHR {
            device_address: instance_buffer.device_address(device),
        })
        .build();

    let geometry = vk::AccelerationStructureGeometryKHR::builder()
        .geometry_type(vk::GeometryTypeKHR::INSTANCES)
        .flags(vk::GeometryFlagsKHR::OPAQUE)
        .geometry(vk::AccelerationStructureGeometryDataKHR {
            instances: instances_data,
        })
        .build();

    let flags = if allow_update {
        vk::BuildAccelerationStructureFlagsKHR::ALLOW_UPDATE
    } else {
        vk::BuildAccelerationStructureFlagsKHR::empty()
    };

    let result = create_and_build(
        device,
        context,
        pool,
        vk::AccelerationStructureTypeKHR::TOP_LEVEL,
        &geometry,
        records.len() as u32,
        flags,
    );

    // The build has completed (or failed) by now, so the instance buffer
    // can go either way.
    instance_buffer.destroy(device);

    let tlas = result.context("Failed to build TLAS")?;

    log::info!(
        "Built TLAS over {} instance(s) at device address {:#x}",
        records.len(),
        tlas.address
    );

    Ok(tlas)
}

/// Shared tail of the BLAS and TLAS builds: query sizes, allocate storage
/// and scratch, create the structure, and run the build synchronously.
fn create_and_build(
    device: &VulkanDevice,
    context: &RayTracingContext,
    pool: vk::CommandPool,
    ty: vk::AccelerationStructureTypeKHR,
    geometry: &vk::AccelerationStructureGeometryKHR,
    primitive_count: u32,
    flags: vk::BuildAccelerationStructureFlagsKHR,
) -> Result<AccelerationStructure> {
    let size_query_info = vk::AccelerationStructureBuildGeometryInfoKHR::builder()
        .ty(ty)
        .flags(flags)
        .mode(vk::BuildAccelerationStructureModeKHR::BUILD)
        .geometries(std::slice::from_ref(geometry))
        .build();

    let sizes = unsafe {
        context.loader.get_acceleration_structure_build_sizes(
            vk::AccelerationStructureBuildTypeKHR::DEVICE,
            &size_query_info,
            &[primitive_count],
        )
    };

    log::debug!(
        "{:?} build sizes: storage {} bytes, scratch {} bytes",
        ty,
        sizes.acceleration_structure_size,
        sizes.build_scratch_size
    );

    let storage = buffer::create_buffer(
        device,
        sizes.acceleration_structure_size,
        vk::BufferUsageFlags::ACCELERATION_STRUCTURE_STORAGE_KHR
            | vk::BufferUsageFlags::SHADER_DEVICE_ADDRESS,
        vk::MemoryPropertyFlags::DEVICE_LOCAL,
    )
    .context("Failed to allocate acceleration structure storage")?;

    let create_info = vk::AccelerationStructureCreateInfoKHR::builder()
        .buffer(storage.handle)
        .size(sizes.acceleration_structure_size)
        .ty(ty);

    let handle = match unsafe {
        context
            .loader
            .create_acceleration_structure(&create_info, None)
    } {
        Ok(handle) => handle,
        Err(e) => {
            storage.destroy(device);
            return Err(e).context("Failed to create acceleration structure");
        }
    };

    let scratch = match buffer::create_buffer(
        device,
        sizes.build_scratch_size,
        vk::BufferUsageFlags::STORAGE_BUFFER | vk::BufferUsageFlags::SHADER_DEVICE_ADDRESS,
        vk::MemoryPropertyFlags::DEVICE_LOCAL,
    ) {
        Ok(scratch) => scratch,
        Err(e) => {
            unsafe { context.loader.destroy_acceleration_structure(handle, None) };
            storage.destroy(device);
            return Err(e).context("Failed to allocate build scratch buffer");
        }
    };

    let build_info = vk::AccelerationStructureBuildGeometryInfoKHR::builder()
        .ty(ty)
        .flags(flags)
        .mode(vk::BuildAccelerationStructureModeKHR::BUILD)
        .geometries(std::slice::from_ref(geometry))
        .dst_acceleration_structure(handle)
        .scratch_data(vk::DeviceOrHostAddressKHR {
            device_address: scratch.device_address(device),
        })
        .build();

    let range_info = vk::AccelerationStructureBuildRangeInfoKHR::builder()
        .primitive_count(primitive_count)
        .build();

    let build_result = command::execute_one_time_commands(device, pool, |cmd| unsafe {
        context.loader.cmd_build_acceleration_structures(
            cmd,
            std::slice::from_ref(&build_info),
            &[std::slice::from_ref(&range_info)],
        );
    });

    // Scratch memory is only referenced during the build, which has
    // finished once the one-shot submit returns.
    scratch.destroy(device);

    if let Err(e) = build_result {
        unsafe { context.loader.destroy_acceleration_structure(handle, None) };
        storage.destroy(device);
        return Err(e);
    }

    let address_info =
        vk::AccelerationStructureDeviceAddressInfoKHR::builder().acceleration_structure(handle);
    let address = unsafe {
        context
            .loader
            .get_acceleration_structure_device_address(&address_info)
    };

    Ok(AccelerationStructure {
        handle,
        buffer: storage,
        address,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use glam::Vec3;

    #[test]
    fn identity_transform_is_row_major_identity() {
        let khr = transform_to_khr(&Mat4::IDENTITY);
        #[rustfmt::skip]
        let expected = [
            1.0, 0.0, 0.0, 0.0,
            0.0, 1.0, 0.0, 0.0,
            0.0, 0.0, 1.0, 0.0,
        ];
        assert_eq!(khr.matrix, expected);
    }

    #[test]
    fn translation_lands_in_fourth_column() {
        let khr = transform_to_khr(&Mat4::from_translation(Vec3::new(1.0, 2.0, 3.0)));
        assert_eq!(khr.matrix[3], 1.0);
        assert_eq!(khr.matrix[7], 2.0);
        assert_eq!(khr.matrix[11], 3.0);
    }

    #[test]
    fn scale_lands_on_the_diagonal() {
        let khr = transform_to_khr(&Mat4::from_scale(Vec3::new(2.0, 3.0, 4.0)));
        assert_eq!(khr.matrix[0], 2.0);
        assert_eq!(khr.matrix[5], 3.0);
        assert_eq!(khr.matrix[10], 4.0);
    }

    #[test]
    fn instance_packs_custom_index_and_mask() {
        let instance = BlasInstance {
            blas_address: 0xdead_beef,
            transform: Mat4::IDENTITY,
            custom_index: 0x0012_3456,
            mask: 0xab,
        };

        let record = instance.to_vk();
        assert_eq!(record.instance_custom_index_and_mask.low_24(), 0x0012_3456);
        assert_eq!(record.instance_custom_index_and_mask.high_8(), 0xab);
        unsafe {
            assert_eq!(
                record.acceleration_structure_reference.device_handle,
                0xdead_beef
            );
        }
    }

    #[test]
    fn instance_custom_index_is_truncated_to_24_bits() {
        let instance = BlasInstance {
            blas_address: 0,
            transform: Mat4::IDENTITY,
            custom_index: 0xff00_0001,
            mask: 0xff,
        };

        let record = instance.to_vk();
        assert_eq!(record.instance_custom_index_and_mask.low_24(), 0x0000_0001);
    }

    #[test]
    fn instance_disables_triangle_facing_cull() {
        let instance = BlasInstance {
            blas_address: 0,
            transform: Mat4::IDENTITY,
            custom_index: 0,
            mask: 0xff,
        };

        let record = instance.to_vk();
        let flags = record
            .instance_shader_binding_table_record_offset_and_flags
            .high_8();
        assert_eq!(
            u32::from(flags),
            vk::GeometryInstanceFlagsKHR::TRIANGLE_FACING_CULL_DISABLE.as_raw()
        );
    }
}
