use std::ptr::null;

use ash::vk;

/// A batch of two-sided barriers for `vkCmdPipelineBarrier2`. Every barrier carries its
/// own source and destination scopes, so nothing is widened.
pub struct PipelineBarrier<'a> {
    dependency_flags: vk::DependencyFlags,
    memory_barriers: &'a [vk::MemoryBarrier2],
    buffer_barriers: &'a [vk::BufferMemoryBarrier2],
    image_barriers: &'a [vk::ImageMemoryBarrier2],
}

impl<'a> PipelineBarrier<'a> {
    pub fn new(
        memory_barriers: &'a [vk::MemoryBarrier2],
        buffer_barriers: &'a [vk::BufferMemoryBarrier2],
        image_barriers: &'a [vk::ImageMemoryBarrier2],
        dependency_flags: vk::DependencyFlags,
    ) -> Self {
        Self {
            dependency_flags,
            memory_barriers,
            buffer_barriers,
            image_barriers,
        }
    }

    /// The returned struct borrows the barrier slices held by `self`.
    pub fn to_dependency_info(&self) -> vk::DependencyInfo {
        vk::DependencyInfo {
            dependency_flags: self.dependency_flags,
            memory_barrier_count: self.memory_barriers.len() as u32,
            p_memory_barriers: if self.memory_barriers.is_empty() {
                null()
            } else {
                self.memory_barriers.as_ptr()
            },
            buffer_memory_barrier_count: self.buffer_barriers.len() as u32,
            p_buffer_memory_barriers: self.buffer_barriers.as_ptr(),
            image_memory_barrier_count: self.image_barriers.len() as u32,
            p_image_memory_barriers: self.image_barriers.as_ptr(),
            ..Default::default()
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn dependency_info_counts() {
        let images = [vk::ImageMemoryBarrier2 {
            src_stage_mask: vk::PipelineStageFlags2::NONE,
            dst_stage_mask: vk::PipelineStageFlags2::TRANSFER,
            dst_access_mask: vk::AccessFlags2::TRANSFER_WRITE,
            old_layout: vk::ImageLayout::UNDEFINED,
            new_layout: vk::ImageLayout::TRANSFER_DST_OPTIMAL,
            ..Default::default()
        }];
        let barrier = PipelineBarrier::new(&[], &[], &images, vk::DependencyFlags::empty());
        let info = barrier.to_dependency_info();
        assert_eq!(info.memory_barrier_count, 0);
        assert!(info.p_memory_barriers.is_null());
        assert_eq!(info.buffer_memory_barrier_count, 0);
        assert_eq!(info.image_memory_barrier_count, 1);
        assert_eq!(info.p_image_memory_barriers, images.as_ptr());
    }
}
