// Synchronization primitives
//
// Two binary semaphores order a frame on the GPU side:
// acquire signals image_available, submit waits on it and signals
// render_finished, present waits on render_finished.

use ash::vk;
use anyhow::{Context, Result};
use std::sync::Arc;
use super::VulkanDevice;
use crate::frame::FrameSemaphores;

pub struct FrameSync {
    pub image_available: vk::Semaphore,
    pub render_finished: vk::Semaphore,
    device: Arc<VulkanDevice>,
}

impl FrameSync {
    pub fn new(device: &Arc<VulkanDevice>) -> Result<Self> {
        let semaphore_info = vk::SemaphoreCreateInfo::builder();

        let image_available = unsafe { device.device.create_semaphore(&semaphore_info, None) }
            .context("Failed to create image-available semaphore")?;
        let render_finished = match unsafe { device.device.create_semaphore(&semaphore_info, None) } {
            Ok(semaphore) => semaphore,
            Err(e) => {
                unsafe { device.device.destroy_semaphore(image_available, None) };
                return Err(e).context("Failed to create render-finished semaphore");
            }
        };

        Ok(Self {
            image_available,
            render_finished,
            device: device.clone(),
        })
    }

    pub fn semaphores(&self) -> FrameSemaphores {
        FrameSemaphores {
            image_available: self.image_available,
            render_finished: self.render_finished,
        }
    }
}

impl Drop for FrameSync {
    fn drop(&mut self) {
        unsafe {
            self.device.device.destroy_semaphore(self.image_available, None);
            self.device.device.destroy_semaphore(self.render_finished, None);
        }
    }
}
