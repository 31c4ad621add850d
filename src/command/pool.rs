use ash::{prelude::VkResult, vk};
use std::sync::Arc;

use crate::Device;

/// A command pool backing exactly one primary command buffer, so resetting the pool is
/// how the buffer is recycled between submissions.
pub struct CommandPool {
    device: Arc<Device>,
    pool: vk::CommandPool,
    buffer: vk::CommandBuffer,
}

impl crate::HasDevice for CommandPool {
    fn device(&self) -> &Arc<Device> {
        &self.device
    }
}

impl CommandPool {
    pub fn new(device: Arc<Device>, queue_family_index: u32) -> VkResult<CommandPool> {
        // Safety: No Host Syncronization rules for vkCreateCommandPool.
        let pool = unsafe {
            device.create_command_pool(
                &vk::CommandPoolCreateInfo::builder()
                    .flags(vk::CommandPoolCreateFlags::TRANSIENT)
                    .queue_family_index(queue_family_index)
                    .build(),
                None,
            )?
        };
        // Safety: Host Syncronization rule for vkAllocateCommandBuffers:
        // - Host access to pAllocateInfo->commandPool must be externally synchronized.
        // The pool was created above and is not shared yet.
        let allocated = unsafe {
            device.allocate_command_buffers(
                &vk::CommandBufferAllocateInfo::builder()
                    .command_pool(pool)
                    .level(vk::CommandBufferLevel::PRIMARY)
                    .command_buffer_count(1)
                    .build(),
            )
        };
        let buffer = match allocated {
            Ok(buffers) => buffers[0],
            Err(err) => {
                // Safety: the pool has no allocated buffers and is owned by us.
                unsafe { device.destroy_command_pool(pool, None) };
                return Err(err);
            }
        };
        Ok(CommandPool {
            device,
            pool,
            buffer,
        })
    }

    pub fn buffer(&self) -> vk::CommandBuffer {
        self.buffer
    }

    /// Returns the buffer to the initial state.
    pub fn reset(&mut self) -> VkResult<()> {
        // Safety: Host Syncronization rule for vkResetCommandPool:
        // - Host access to commandPool must be externally synchronized.
        // We have &mut self and thus exclusive control on the pool. The caller guarantees the
        // buffer is not pending execution.
        unsafe {
            self.device
                .reset_command_pool(self.pool, vk::CommandPoolResetFlags::empty())
        }
    }
}

impl Drop for CommandPool {
    fn drop(&mut self) {
        tracing::debug!(pool = ?self.pool, "drop command pool");
        // Safety: Host Syncronization rule for vkDestroyCommandPool:
        // - Host access to commandPool must be externally synchronized
        // We have &mut self and thus ownership on commandPool. Destroying the pool frees
        // its buffer.
        unsafe {
            self.device.destroy_command_pool(self.pool, None);
        }
    }
}
