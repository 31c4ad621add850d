use std::sync::Arc;

use ash::{prelude::VkResult, vk};

use crate::Device;

pub struct Fence {
    device: Arc<Device>,
    pub(crate) fence: vk::Fence,
}
impl crate::HasDevice for Fence {
    fn device(&self) -> &Arc<Device> {
        &self.device
    }
}

impl std::fmt::Debug for Fence {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_fmt(format_args!("Fence({:?})", self.fence))
    }
}
impl Fence {
    pub fn new(device: Arc<Device>, signaled: bool) -> VkResult<Self> {
        let mut flags = vk::FenceCreateFlags::empty();
        if signaled {
            flags |= vk::FenceCreateFlags::SIGNALED;
        }
        // Safety: No Host Syncronization rules for vkCreateFence.
        let fence = unsafe {
            device.create_fence(&vk::FenceCreateInfo::builder().flags(flags).build(), None)?
        };
        Ok(Self { device, fence })
    }
    pub fn raw(&self) -> vk::Fence {
        self.fence
    }
    /// Non-blocking status poll.
    pub fn signaled(&self) -> VkResult<bool> {
        // Safety: No Host Syncronization rules for vkGetFenceStatus.
        unsafe { self.device.get_fence_status(self.fence) }
    }
    /// Blocks until the fence was signaled. Only teardown waits.
    pub fn wait(&self) -> VkResult<()> {
        // Safety: No Host Syncronization rules for vkWaitForFences.
        unsafe {
            self.device
                .wait_for_fences(&[self.fence], true, std::u64::MAX)
        }
    }
    pub fn reset(&mut self) -> VkResult<()> {
        // Safety: Host Syncronization rule for vkResetFences:
        // - Host access to each member of pFences must be externally synchronized.
        // We have &mut self and thus exclusive control on the fence.
        unsafe { self.device.reset_fences(&[self.fence]) }
    }
}

impl Drop for Fence {
    fn drop(&mut self) {
        tracing::debug!(fence = ?self.fence, "drop fence");
        // Safety: Host Syncronization rule for vkDestroyFence:
        // - Host access to fence must be externally synchronized
        // We have &mut self and thus exclusive control on the fence.
        unsafe {
            self.device.destroy_fence(self.fence, None);
        }
    }
}
