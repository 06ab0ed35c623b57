// Command pool and one-shot command buffers
//
// Uploads record a throwaway command buffer, submit it, and block until the
// queue drains. Simple and slow, fine for load-time work.

use anyhow::{Context, Result};
use ash::vk;
use std::sync::Arc;
use super::VulkanDevice;

pub struct CommandPool {
    pub pool: vk::CommandPool,
    device: Arc<VulkanDevice>,
}

impl CommandPool {
    /// Pool on the graphics queue family
    pub fn new(device: &Arc<VulkanDevice>) -> Result<Self> {
        let pool_info = vk::CommandPoolCreateInfo::builder()
            .queue_family_index(device.graphics_queue_family)
            // RESET: Allow individual buffer reset
            .flags(vk::CommandPoolCreateFlags::RESET_COMMAND_BUFFER);

        let pool = unsafe { device.device.create_command_pool(&pool_info, None) }
            .context("Failed to create command pool")?;

        Ok(Self {
            pool,
            device: device.clone(),
        })
    }

    pub fn allocate(&self, count: u32) -> Result<Vec<vk::CommandBuffer>> {
        let alloc_info = vk::CommandBufferAllocateInfo::builder()
            .command_pool(self.pool)
            .level(vk::CommandBufferLevel::PRIMARY)
            .command_buffer_count(count);

        unsafe { self.device.device.allocate_command_buffers(&alloc_info) }
            .context("Failed to allocate command buffers")
    }

    pub fn free(&self, command_buffers: &[vk::CommandBuffer]) {
        if command_buffers.is_empty() {
            return;
        }
        unsafe { self.device.device.free_command_buffers(self.pool, command_buffers) };
    }

    /// Record `record` into a fresh command buffer, submit it to the graphics
    /// queue and wait for completion.
    pub fn one_shot<F>(&self, record: F) -> Result<()>
    where
        F: FnOnce(&ash::Device, vk::CommandBuffer),
    {
        let command_buffers = self.allocate(1)?;
        let result = self.submit_and_wait(command_buffers[0], record);
        self.free(&command_buffers);
        result
    }

    fn submit_and_wait<F>(&self, cmd: vk::CommandBuffer, record: F) -> Result<()>
    where
        F: FnOnce(&ash::Device, vk::CommandBuffer),
    {
        let device = &self.device.device;
        let begin_info = vk::CommandBufferBeginInfo::builder()
            .flags(vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT);

        unsafe {
            device
                .begin_command_buffer(cmd, &begin_info)
                .context("Failed to begin one-shot command buffer")?;
            record(device, cmd);
            device
                .end_command_buffer(cmd)
                .context("Failed to end one-shot command buffer")?;

            let command_buffers = [cmd];
            let submit_info = vk::SubmitInfo::builder().command_buffers(&command_buffers);
            device
                .queue_submit(self.device.graphics_queue, &[submit_info.build()], vk::Fence::null())
                .context("Failed to submit one-shot command buffer")?;
            device
                .queue_wait_idle(self.device.graphics_queue)
                .context("Failed waiting for one-shot command buffer")?;
        }

        Ok(())
    }
}

impl Drop for CommandPool {
    fn drop(&mut self) {
        // Also frees every command buffer allocated from it
        unsafe { self.device.device.destroy_command_pool(self.pool, None) };
    }
}
