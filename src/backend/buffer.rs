// GPU buffer allocation
//
// Buffers are backed by manually allocated device memory: pick a memory
// type that satisfies the requested property flags, allocate, bind.
// Uploads to device-local memory go through a host-visible staging buffer
// and a one-shot copy command.

use anyhow::{Context, Result};
use ash::vk;
use super::{command, VulkanDevice};

/// A buffer and the memory allocation backing it
pub struct Buffer {
    pub handle: vk::Buffer,
    pub memory: vk::DeviceMemory,
    pub size: vk::DeviceSize,
}

impl Buffer {
    /// Query the buffer's GPU device address.
    ///
    /// Only valid for buffers created with SHADER_DEVICE_ADDRESS usage; the
    /// address stays valid for the lifetime of the buffer.
    pub fn device_address(&self, device: &VulkanDevice) -> vk::DeviceAddress {
        let info = vk::BufferDeviceAddressInfo::builder().buffer(self.handle);
        unsafe { device.device.get_buffer_device_address(&info) }
    }

    /// Copy a slice into the buffer's memory. The memory must be host
    /// visible and host coherent.
    pub fn fill<T: Copy>(&self, device: &VulkanDevice, data: &[T]) -> Result<()> {
        let size = std::mem::size_of_val(data) as vk::DeviceSize;
        debug_assert!(size <= self.size);

        unsafe {
            let ptr = device
                .device
                .map_memory(self.memory, 0, size, vk::MemoryMapFlags::empty())
                .context("Failed to map buffer memory")? as *mut T;

            ptr.copy_from_nonoverlapping(data.as_ptr(), data.len());
            device.device.unmap_memory(self.memory);
        }

        Ok(())
    }

    pub fn destroy(&self, device: &VulkanDevice) {
        unsafe {
            device.device.destroy_buffer(self.handle, None);
            device.device.free_memory(self.memory, None);
        }
    }
}

/// Find a memory type index allowed by `type_filter` whose property flags
/// contain all of `properties`.
pub fn find_memory_type(
    memory_properties: &vk::PhysicalDeviceMemoryProperties,
    type_filter: u32,
    properties: vk::MemoryPropertyFlags,
) -> Result<u32> {
    for i in 0..memory_properties.memory_type_count {
        let has_type = (type_filter & (1 << i)) != 0;
        let has_properties = memory_properties.memory_types[i as usize]
            .property_flags
            .contains(properties);

        if has_type && has_properties {
            return Ok(i);
        }
    }

    anyhow::bail!("Failed to find suitable memory type")
}

/// Create a buffer with a fresh memory allocation satisfying the flags
pub fn create_buffer(
    device: &VulkanDevice,
    size: vk::DeviceSize,
    usage: vk::BufferUsageFlags,
    memory_flags: vk::MemoryPropertyFlags,
) -> Result<Buffer> {
    let buffer_info = vk::BufferCreateInfo::builder()
        .size(size)
        .usage(usage)
        .sharing_mode(vk::SharingMode::EXCLUSIVE);

    let handle = unsafe {
        device
            .device
            .create_buffer(&buffer_info, None)
            .context("Failed to create buffer")?
    };

    let mem_requirements = unsafe { device.device.get_buffer_memory_requirements(handle) };

    let memory_type_index = find_memory_type(
        &device.memory_properties,
        mem_requirements.memory_type_bits,
        memory_flags,
    )?;

    // Taking a device address from memory allocated without the
    // DEVICE_ADDRESS flag is invalid, so chain it whenever the usage asks
    // for addresses.
    let mut flags_info =
        vk::MemoryAllocateFlagsInfo::builder().flags(vk::MemoryAllocateFlags::DEVICE_ADDRESS);

    let mut alloc_info = vk::MemoryAllocateInfo::builder()
        .allocation_size(mem_requirements.size)
        .memory_type_index(memory_type_index);

    if usage.contains(vk::BufferUsageFlags::SHADER_DEVICE_ADDRESS) {
        alloc_info = alloc_info.push_next(&mut flags_info);
    }

    let memory = unsafe {
        device
            .device
            .allocate_memory(&alloc_info, None)
            .context("Failed to allocate buffer memory")?
    };

    unsafe {
        device
            .device
            .bind_buffer_memory(handle, memory, 0)
            .context("Failed to bind buffer memory")?;
    }

    Ok(Buffer {
        handle,
        memory,
        size,
    })
}

/// Upload a slice to a device-local buffer through a staging copy
pub fn upload_buffer<T: Copy>(
    device: &VulkanDevice,
    pool: vk::CommandPool,
    usage: vk::BufferUsageFlags,
    data: &[T],
) -> Result<Buffer> {
    let size = std::mem::size_of_val(data) as vk::DeviceSize;

    let staging = create_buffer(
        device,
        size,
        vk::BufferUsageFlags::TRANSFER_SRC,
        vk::MemoryPropertyFlags::HOST_VISIBLE | vk::MemoryPropertyFlags::HOST_COHERENT,
    )?;
    staging.fill(device, data)?;

    let buffer = create_buffer(
        device,
        size,
        usage | vk::BufferUsageFlags::TRANSFER_DST,
        vk::MemoryPropertyFlags::DEVICE_LOCAL,
    )?;

    let copy_result = command::execute_one_time_commands(device, pool, |cmd| {
        let region = vk::BufferCopy::builder().size(size).build();
        unsafe {
            device
                .device
                .cmd_copy_buffer(cmd, staging.handle, buffer.handle, &[region]);
        }
    });

    staging.destroy(device);

    if let Err(e) = copy_result {
        buffer.destroy(device);
        return Err(e).context("Failed to copy staging buffer to device-local buffer");
    }

    Ok(buffer)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn memory_properties(types: &[vk::MemoryPropertyFlags]) -> vk::PhysicalDeviceMemoryProperties {
        let mut props = vk::PhysicalDeviceMemoryProperties {
            memory_type_count: types.len() as u32,
            ..Default::default()
        };
        for (i, &flags) in types.iter().enumerate() {
            props.memory_types[i].property_flags = flags;
        }
        props
    }

    #[test]
    fn picks_first_matching_type() {
        let props = memory_properties(&[
            vk::MemoryPropertyFlags::DEVICE_LOCAL,
            vk::MemoryPropertyFlags::HOST_VISIBLE | vk::MemoryPropertyFlags::HOST_COHERENT,
            vk::MemoryPropertyFlags::HOST_VISIBLE | vk::MemoryPropertyFlags::HOST_COHERENT,
        ]);

        let index = find_memory_type(
            &props,
            0b111,
            vk::MemoryPropertyFlags::HOST_VISIBLE | vk::MemoryPropertyFlags::HOST_COHERENT,
        )
        .unwrap();
        assert_eq!(index, 1);
    }

    #[test]
    fn respects_type_filter() {
        // Type 0 has the right flags but is excluded by the filter
        let props = memory_properties(&[
            vk::MemoryPropertyFlags::DEVICE_LOCAL,
            vk::MemoryPropertyFlags::DEVICE_LOCAL,
        ]);

        let index =
            find_memory_type(&props, 0b10, vk::MemoryPropertyFlags::DEVICE_LOCAL).unwrap();
        assert_eq!(index, 1);
    }

    #[test]
    fn requires_all_requested_flags() {
        // HOST_VISIBLE alone must not satisfy HOST_VISIBLE | HOST_COHERENT
        let props = memory_properties(&[vk::MemoryPropertyFlags::HOST_VISIBLE]);

        let result = find_memory_type(
            &props,
            0b1,
            vk::MemoryPropertyFlags::HOST_VISIBLE | vk::MemoryPropertyFlags::HOST_COHERENT,
        );
        assert!(result.is_err());
    }

    #[test]
    fn errors_when_no_type_matches() {
        let props = memory_properties(&[vk::MemoryPropertyFlags::DEVICE_LOCAL]);

        let result = find_memory_type(&props, 0b1, vk::MemoryPropertyFlags::HOST_VISIBLE);
        assert!(result.is_err());
    }

    #[test]
    fn superset_flags_still_match() {
        let props = memory_properties(&[
            vk::MemoryPropertyFlags::DEVICE_LOCAL
                | vk::MemoryPropertyFlags::HOST_VISIBLE
                | vk::MemoryPropertyFlags::HOST_COHERENT,
        ]);

        let index =
            find_memory_type(&props, 0b1, vk::MemoryPropertyFlags::DEVICE_LOCAL).unwrap();
        assert_eq!(index, 0);
    }
}
