//! Legacy emission path for devices without synchronization2.
//!
//! `vkCmdPipelineBarrier` takes one source and one destination stage mask for the whole
//! batch, so the masks are the union over every barrier in it. Each `*Flags2` bit is
//! narrowed to the legacy bit that covers it.

use ash::vk;

const LOW_BITS: u64 = 0xFFFF_FFFF;

pub fn narrow_stages(stages: vk::PipelineStageFlags2) -> vk::PipelineStageFlags {
    use vk::PipelineStageFlags as F1;
    use vk::PipelineStageFlags2 as F2;
    let mut narrowed = F1::from_raw((stages.as_raw() & LOW_BITS) as u32);
    if stages.intersects(F2::COPY | F2::RESOLVE | F2::BLIT | F2::CLEAR) {
        narrowed |= F1::TRANSFER;
    }
    if stages.intersects(F2::INDEX_INPUT | F2::VERTEX_ATTRIBUTE_INPUT) {
        narrowed |= F1::VERTEX_INPUT;
    }
    if stages.contains(F2::PRE_RASTERIZATION_SHADERS) {
        narrowed |= F1::VERTEX_SHADER
            | F1::TESSELLATION_CONTROL_SHADER
            | F1::TESSELLATION_EVALUATION_SHADER
            | F1::GEOMETRY_SHADER;
    }
    narrowed
}

pub fn narrow_access(access: vk::AccessFlags2) -> vk::AccessFlags {
    use vk::AccessFlags as F1;
    use vk::AccessFlags2 as F2;
    let mut narrowed = F1::from_raw((access.as_raw() & LOW_BITS) as u32);
    if access.intersects(F2::SHADER_SAMPLED_READ | F2::SHADER_STORAGE_READ) {
        narrowed |= F1::SHADER_READ;
    }
    if access.contains(F2::SHADER_STORAGE_WRITE) {
        narrowed |= F1::SHADER_WRITE;
    }
    narrowed
}

/// A batch converted for `vkCmdPipelineBarrier`.
pub struct LegacyBarrier {
    pub src_stage_mask: vk::PipelineStageFlags,
    pub dst_stage_mask: vk::PipelineStageFlags,
    pub memory_barriers: Vec<vk::MemoryBarrier>,
    pub buffer_barriers: Vec<vk::BufferMemoryBarrier>,
    pub image_barriers: Vec<vk::ImageMemoryBarrier>,
}

impl LegacyBarrier {
    pub fn new(
        memory_barriers: &[vk::MemoryBarrier2],
        buffer_barriers: &[vk::BufferMemoryBarrier2],
        image_barriers: &[vk::ImageMemoryBarrier2],
    ) -> Self {
        let mut src = vk::PipelineStageFlags2::empty();
        let mut dst = vk::PipelineStageFlags2::empty();
        let memory_barriers = memory_barriers
            .iter()
            .map(|b| {
                src |= b.src_stage_mask;
                dst |= b.dst_stage_mask;
                vk::MemoryBarrier {
                    src_access_mask: narrow_access(b.src_access_mask),
                    dst_access_mask: narrow_access(b.dst_access_mask),
                    ..Default::default()
                }
            })
            .collect();
        let buffer_barriers = buffer_barriers
            .iter()
            .map(|b| {
                src |= b.src_stage_mask;
                dst |= b.dst_stage_mask;
                vk::BufferMemoryBarrier {
                    src_access_mask: narrow_access(b.src_access_mask),
                    dst_access_mask: narrow_access(b.dst_access_mask),
                    src_queue_family_index: b.src_queue_family_index,
                    dst_queue_family_index: b.dst_queue_family_index,
                    buffer: b.buffer,
                    offset: b.offset,
                    size: b.size,
                    ..Default::default()
                }
            })
            .collect();
        let image_barriers = image_barriers
            .iter()
            .map(|b| {
                src |= b.src_stage_mask;
                dst |= b.dst_stage_mask;
                vk::ImageMemoryBarrier {
                    src_access_mask: narrow_access(b.src_access_mask),
                    dst_access_mask: narrow_access(b.dst_access_mask),
                    old_layout: b.old_layout,
                    new_layout: b.new_layout,
                    src_queue_family_index: b.src_queue_family_index,
                    dst_queue_family_index: b.dst_queue_family_index,
                    image: b.image,
                    subresource_range: b.subresource_range,
                    ..Default::default()
                }
            })
            .collect();

        let mut src_stage_mask = narrow_stages(src);
        if src_stage_mask.is_empty() {
            src_stage_mask = vk::PipelineStageFlags::TOP_OF_PIPE;
        }
        let mut dst_stage_mask = narrow_stages(dst);
        if dst_stage_mask.is_empty() {
            dst_stage_mask = vk::PipelineStageFlags::BOTTOM_OF_PIPE;
        }
        Self {
            src_stage_mask,
            dst_stage_mask,
            memory_barriers,
            buffer_barriers,
            image_barriers,
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn narrows_split_stages() {
        use vk::PipelineStageFlags as F1;
        use vk::PipelineStageFlags2 as F2;
        assert_eq!(narrow_stages(F2::COPY), F1::TRANSFER);
        assert_eq!(narrow_stages(F2::CLEAR | F2::BLIT), F1::TRANSFER);
        assert_eq!(narrow_stages(F2::INDEX_INPUT), F1::VERTEX_INPUT);
        assert_eq!(
            narrow_stages(F2::FRAGMENT_SHADER | F2::COMPUTE_SHADER),
            F1::FRAGMENT_SHADER | F1::COMPUTE_SHADER
        );
        assert_eq!(
            narrow_stages(F2::ACCELERATION_STRUCTURE_BUILD_KHR),
            F1::ACCELERATION_STRUCTURE_BUILD_KHR
        );
        assert!(narrow_stages(F2::PRE_RASTERIZATION_SHADERS).contains(F1::GEOMETRY_SHADER));
        assert!(narrow_stages(F2::NONE).is_empty());
    }

    #[test]
    fn narrows_split_accesses() {
        use vk::AccessFlags as F1;
        use vk::AccessFlags2 as F2;
        assert_eq!(narrow_access(F2::SHADER_SAMPLED_READ), F1::SHADER_READ);
        assert_eq!(
            narrow_access(F2::SHADER_STORAGE_READ | F2::SHADER_STORAGE_WRITE),
            F1::SHADER_READ | F1::SHADER_WRITE
        );
        assert_eq!(
            narrow_access(F2::COLOR_ATTACHMENT_WRITE),
            F1::COLOR_ATTACHMENT_WRITE
        );
    }

    /// The legacy call orders at least everything the two-sided barriers would.
    #[test]
    fn legacy_masks_contain_every_precise_mask() {
        let buffers = [
            vk::BufferMemoryBarrier2 {
                src_stage_mask: vk::PipelineStageFlags2::COPY,
                src_access_mask: vk::AccessFlags2::TRANSFER_WRITE,
                dst_stage_mask: vk::PipelineStageFlags2::VERTEX_ATTRIBUTE_INPUT,
                dst_access_mask: vk::AccessFlags2::VERTEX_ATTRIBUTE_READ,
                size: vk::WHOLE_SIZE,
                ..Default::default()
            },
            vk::BufferMemoryBarrier2 {
                src_stage_mask: vk::PipelineStageFlags2::COMPUTE_SHADER,
                src_access_mask: vk::AccessFlags2::SHADER_STORAGE_WRITE,
                dst_stage_mask: vk::PipelineStageFlags2::FRAGMENT_SHADER,
                dst_access_mask: vk::AccessFlags2::SHADER_STORAGE_READ,
                size: vk::WHOLE_SIZE,
                ..Default::default()
            },
        ];
        let images = [vk::ImageMemoryBarrier2 {
            src_stage_mask: vk::PipelineStageFlags2::NONE,
            dst_stage_mask: vk::PipelineStageFlags2::COLOR_ATTACHMENT_OUTPUT,
            dst_access_mask: vk::AccessFlags2::COLOR_ATTACHMENT_WRITE,
            old_layout: vk::ImageLayout::UNDEFINED,
            new_layout: vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL,
            ..Default::default()
        }];
        let legacy = LegacyBarrier::new(&[], &buffers, &images);
        for (src, dst) in buffers
            .iter()
            .map(|b| (b.src_stage_mask, b.dst_stage_mask))
            .chain(images.iter().map(|b| (b.src_stage_mask, b.dst_stage_mask)))
        {
            assert!(legacy.src_stage_mask.contains(narrow_stages(src)));
            assert!(legacy.dst_stage_mask.contains(narrow_stages(dst)));
        }
        for (precise, narrowed) in buffers.iter().zip(&legacy.buffer_barriers) {
            assert!(!narrow_access(precise.src_access_mask).is_empty());
            assert_eq!(narrowed.src_access_mask, narrow_access(precise.src_access_mask));
            assert_eq!(narrowed.dst_access_mask, narrow_access(precise.dst_access_mask));
        }
        assert_eq!(legacy.image_barriers[0].old_layout, vk::ImageLayout::UNDEFINED);
    }

    #[test]
    fn empty_scopes_become_pipe_ends() {
        let images = [vk::ImageMemoryBarrier2 {
            src_stage_mask: vk::PipelineStageFlags2::NONE,
            dst_stage_mask: vk::PipelineStageFlags2::NONE,
            old_layout: vk::ImageLayout::UNDEFINED,
            new_layout: vk::ImageLayout::PRESENT_SRC_KHR,
            ..Default::default()
        }];
        let legacy = LegacyBarrier::new(&[], &[], &images);
        assert_eq!(legacy.src_stage_mask, vk::PipelineStageFlags::TOP_OF_PIPE);
        assert_eq!(legacy.dst_stage_mask, vk::PipelineStageFlags::BOTTOM_OF_PIPE);
    }
}
