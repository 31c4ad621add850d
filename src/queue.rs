use ash::{prelude::VkResult, vk};
use std::sync::Arc;

use crate::fence::Fence;
use crate::Device;

pub struct Queue {
    pub(crate) device: Arc<Device>,
    pub(crate) queue: vk::Queue,
    family_index: u32,
}

impl crate::HasDevice for Queue {
    fn device(&self) -> &Arc<Device> {
        &self.device
    }
}

impl Queue {
    pub fn new(device: Arc<Device>, family_index: u32, queue_index: u32) -> Self {
        // Safety: No Host Syncronization rules for vkGetDeviceQueue.
        let queue = unsafe { device.get_device_queue(family_index, queue_index) };
        Self {
            device,
            queue,
            family_index,
        }
    }
    pub fn raw(&self) -> vk::Queue {
        self.queue
    }
    pub fn family_index(&self) -> u32 {
        self.family_index
    }

    /// Submits `command_buffer`, signaling `fence` once it completes.
    pub fn submit(
        &mut self,
        command_buffer: vk::CommandBuffer,
        wait: &[vk::SemaphoreSubmitInfo],
        signal: &[vk::SemaphoreSubmitInfo],
        fence: &Fence,
    ) -> VkResult<()> {
        let command_buffers = [vk::CommandBufferSubmitInfo::builder()
            .command_buffer(command_buffer)
            .build()];
        let submit = vk::SubmitInfo2::builder()
            .wait_semaphore_infos(wait)
            .command_buffer_infos(&command_buffers)
            .signal_semaphore_infos(signal)
            .build();
        // Safety: Host Syncronization rule for vkQueueSubmit2:
        // - Host access to queue must be externally synchronized.
        // - Host access to fence must be externally synchronized.
        // We have &mut self and therefore exclusive control on queue.
        // The fence is owned by the submitting command buffer, which only submits while it
        // is not running.
        unsafe {
            self.device
                .queue_submit2(self.queue, &[submit], fence.raw())
        }
    }
}
