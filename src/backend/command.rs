// One-shot command submission
//
// Buffer uploads and acceleration structure builds are recorded into a
// transient command buffer, submitted once, and waited on synchronously.

use anyhow::{Context, Result};
use ash::vk;
use super::VulkanDevice;

/// Create a transient command pool on the device's generic queue family.
pub fn create_command_pool(device: &VulkanDevice) -> Result<vk::CommandPool> {
    let pool_info = vk::CommandPoolCreateInfo::builder()
        .queue_family_index(device.graphics_queue_family)
        .flags(vk::CommandPoolCreateFlags::TRANSIENT);

    let pool = unsafe { device.device.create_command_pool(&pool_info, None) }
        .context("Failed to create command pool")?;

    Ok(pool)
}

/// Record commands into a one-time-submit buffer, submit it, and block
/// until the queue drains. The closure only records; submission and the
/// wait happen here.
pub fn execute_one_time_commands<F>(
    device: &VulkanDevice,
    pool: vk::CommandPool,
    record: F,
) -> Result<()>
where
    F: FnOnce(vk::CommandBuffer),
{
    let alloc_info = vk::CommandBufferAllocateInfo::builder()
        .command_pool(pool)
        .level(vk::CommandBufferLevel::PRIMARY)
        .command_buffer_count(1);

    let command_buffer = unsafe { device.device.allocate_command_buffers(&alloc_info) }
        .context("Failed to allocate one-shot command buffer")?[0];

    let begin_info = vk::CommandBufferBeginInfo::builder()
        .flags(vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT);

    unsafe {
        device
            .device
            .begin_command_buffer(command_buffer, &begin_info)
            .context("Failed to begin one-shot command buffer")?;

        record(command_buffer);

        device
            .device
            .end_command_buffer(command_buffer)
            .context("Failed to end one-shot command buffer")?;

        let command_buffers = [command_buffer];
        let submit_info = vk::SubmitInfo::builder().command_buffers(&command_buffers);

        device
            .device
            .queue_submit(device.graphics_queue, &[submit_info.build()], vk::Fence::null())
            .context("Failed to submit one-shot command buffer")?;

        // Staging and scratch buffers referenced by the recorded commands
        // must stay alive until this wait returns.
        device
            .device
            .queue_wait_idle(device.graphics_queue)
            .context("Failed to wait for one-shot command buffer")?;

        device
            .device
            .free_command_buffers(pool, &command_buffers);
    }

    Ok(())
}
