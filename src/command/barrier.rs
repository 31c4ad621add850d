//! Barrier insertion: requirements in, one batched dependency boundary out.

use ash::vk;
use smallvec::SmallVec;

use super::encoder::Encoder;
use super::stream::BufferBarrierCommand;
use super::sync::LegacyBarrier;
use crate::descriptor::DescriptorResource;
use crate::resources::{
    AccelStructHandle, BarrierState, BufferHandle, DescriptorSetHandle, ImageHandle,
    ImageViewHandle, ResourceRegistry, SubresourceRange,
};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Target {
    Buffer(BufferHandle),
    Image {
        image: ImageHandle,
        range: SubresourceRange,
    },
    AccelStruct(AccelStructHandle),
}

/// The state a resource must be in right before a command executes.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Requirement {
    pub target: Target,
    pub state: BarrierState,
    /// Previous contents may be thrown away, so the transition starts from `UNDEFINED`.
    pub discard: bool,
}

/// Requirements of one dependency boundary, merged per resource, in discovery order.
#[derive(Clone, Debug, Default)]
pub struct Requirements {
    list: Vec<Requirement>,
}

impl Requirements {
    pub fn new() -> Self {
        Self::default()
    }
    pub fn len(&self) -> usize {
        self.list.len()
    }
    pub fn is_empty(&self) -> bool {
        self.list.is_empty()
    }
    pub fn iter(&self) -> std::slice::Iter<'_, Requirement> {
        self.list.iter()
    }
    pub fn clear(&mut self) {
        self.list.clear();
    }

    pub fn push(&mut self, requirement: Requirement) {
        match self
            .list
            .iter_mut()
            .find(|existing| existing.target == requirement.target)
        {
            Some(existing) => {
                existing.state = existing.state.merge(&requirement.state);
                existing.discard &= requirement.discard;
            }
            None => self.list.push(requirement),
        }
    }

    pub fn buffer(&mut self, buffer: BufferHandle, state: BarrierState) {
        self.push(Requirement {
            target: Target::Buffer(buffer),
            state,
            discard: false,
        });
    }

    pub fn image(&mut self, image: ImageHandle, range: SubresourceRange, state: BarrierState) {
        self.push(Requirement {
            target: Target::Image { image, range },
            state,
            discard: false,
        });
    }

    /// Requires the view's whole range of its image.
    pub fn image_view(
        &mut self,
        registry: &ResourceRegistry,
        view: ImageViewHandle,
        state: BarrierState,
        discard: bool,
    ) {
        let Some(view) = registry.image_view(view) else {
            debug_assert!(false, "unknown image view {:?}", view);
            return;
        };
        self.push(Requirement {
            target: Target::Image {
                image: view.image(),
                range: view.range(),
            },
            state,
            discard,
        });
    }

    pub fn accel_struct(&mut self, accel_struct: AccelStructHandle, state: BarrierState) {
        self.push(Requirement {
            target: Target::AccelStruct(accel_struct),
            state,
            discard: false,
        });
    }

    /// Every populated slot of every binding visible at `bind_point`, bindless arrays
    /// included.
    pub fn descriptor_set(
        &mut self,
        registry: &ResourceRegistry,
        set: DescriptorSetHandle,
        bind_point: vk::PipelineBindPoint,
    ) {
        let Some(set) = registry.descriptor_set(set) else {
            debug_assert!(false, "unknown descriptor set {:?}", set);
            return;
        };
        for binding in set.bindings() {
            let Some(state) = binding.required_state(bind_point) else {
                continue;
            };
            for resource in binding.resources() {
                match resource {
                    DescriptorResource::Buffer(buffer) => self.buffer(buffer, state),
                    DescriptorResource::ImageView(view) => {
                        self.image_view(registry, view, state, false)
                    }
                    DescriptorResource::AccelerationStructure(accel_struct) => {
                        self.accel_struct(accel_struct, state)
                    }
                }
            }
        }
    }
}

impl<'a> IntoIterator for &'a Requirements {
    type Item = &'a Requirement;
    type IntoIter = std::slice::Iter<'a, Requirement>;

    fn into_iter(self) -> Self::IntoIter {
        self.list.iter()
    }
}

/// Equal states need no barrier unless the access writes: two writes in a row still
/// have to be ordered.
#[inline]
fn needs_barrier(old: &BarrierState, new: &BarrierState) -> bool {
    old != new || new.is_write()
}

/// Resolves image ranges and splits images required through overlapping ranges, so that
/// no subresource is transitioned twice within one dependency. A subresource required
/// more than once gets the merged state, and only discards if every requirement does.
fn disjoint(registry: &ResourceRegistry, requirements: &Requirements) -> Vec<Requirement> {
    let mut list: Vec<Requirement> = requirements
        .iter()
        .map(|requirement| {
            let mut requirement = *requirement;
            if let Target::Image { image, range } = &mut requirement.target {
                if let Some(info) = registry.image(*image) {
                    *range = range.resolve(info.mip_levels(), info.array_layers());
                }
            }
            requirement
        })
        .collect();

    let mut overlapping: SmallVec<[ImageHandle; 2]> = SmallVec::new();
    for (i, a) in list.iter().enumerate() {
        let Target::Image { image, range } = a.target else {
            continue;
        };
        let overlaps = list[i + 1..].iter().any(|b| match b.target {
            Target::Image { image: other, range: r } => other == image && r.overlaps(&range),
            _ => false,
        });
        if overlaps && !overlapping.contains(&image) {
            overlapping.push(image);
        }
    }

    for handle in overlapping {
        let Some(image) = registry.image(handle) else {
            continue;
        };
        let (mip_levels, array_layers) = (image.mip_levels(), image.array_layers());
        let on_image =
            |r: &Requirement| matches!(r.target, Target::Image { image, .. } if image == handle);
        let Some(first) = list.iter().position(on_image) else {
            continue;
        };

        let mut merged: Vec<Option<(BarrierState, bool)>> =
            vec![None; (mip_levels * array_layers) as usize];
        for requirement in list.iter().filter(|r| on_image(*r)) {
            let Target::Image { range, .. } = requirement.target else {
                continue;
            };
            for (mip, layer) in range.iter() {
                let Some(slot) = merged.get_mut((mip * array_layers + layer) as usize) else {
                    continue;
                };
                *slot = Some(match *slot {
                    Some((state, discard)) => (
                        state.merge(&requirement.state),
                        discard && requirement.discard,
                    ),
                    None => (requirement.state, requirement.discard),
                });
            }
        }

        let mut pieces: Vec<Requirement> = Vec::new();
        let piece = |range: SubresourceRange, (state, discard): (BarrierState, bool)| Requirement {
            target: Target::Image {
                image: handle,
                range,
            },
            state,
            discard,
        };
        match merged.first().copied().flatten() {
            // Uniform over the whole image keeps the single-barrier path.
            Some(value) if merged.iter().all(|slot| *slot == Some(value)) => {
                pieces.push(piece(SubresourceRange::full(mip_levels, array_layers), value));
            }
            _ => {
                // Runs of equal mips, layer by layer.
                for layer in 0..array_layers {
                    let mut mip = 0;
                    while mip < mip_levels {
                        let Some(value) = merged[(mip * array_layers + layer) as usize] else {
                            mip += 1;
                            continue;
                        };
                        let base = mip;
                        while mip < mip_levels
                            && merged[(mip * array_layers + layer) as usize] == Some(value)
                        {
                            mip += 1;
                        }
                        pieces.push(piece(
                            SubresourceRange {
                                base_mip_level: base,
                                mip_level_count: mip - base,
                                base_array_layer: layer,
                                array_layer_count: 1,
                            },
                            value,
                        ));
                    }
                }
            }
        }
        list.retain(|r| !on_image(r));
        list.splice(first..first, pieces);
    }
    list
}

/// Pending transitions of the current dependency boundary, grouped by barrier kind.
#[derive(Default)]
pub struct BarrierBatch {
    memory: Option<vk::MemoryBarrier2>,
    buffers: Vec<vk::BufferMemoryBarrier2>,
    images: Vec<vk::ImageMemoryBarrier2>,
}

impl BarrierBatch {
    pub fn new() -> Self {
        Self::default()
    }
    pub fn is_empty(&self) -> bool {
        self.memory.is_none() && self.buffers.is_empty() && self.images.is_empty()
    }
    pub fn memory_barriers(&self) -> &[vk::MemoryBarrier2] {
        self.memory.as_ref().map(std::slice::from_ref).unwrap_or(&[])
    }
    pub fn buffer_barriers(&self) -> &[vk::BufferMemoryBarrier2] {
        &self.buffers
    }
    pub fn image_barriers(&self) -> &[vk::ImageMemoryBarrier2] {
        &self.images
    }
    pub fn clear(&mut self) {
        self.memory = None;
        self.buffers.clear();
        self.images.clear();
    }

    pub fn apply_all(&mut self, registry: &mut ResourceRegistry, requirements: &Requirements) {
        for requirement in disjoint(registry, requirements) {
            self.apply(registry, &requirement);
        }
    }

    /// Diffs one requirement against the table, queues the transitions it needs and
    /// moves the table to the required state.
    pub fn apply(&mut self, registry: &mut ResourceRegistry, requirement: &Requirement) {
        let new = requirement.state;
        match requirement.target {
            Target::Buffer(handle) => {
                let Some(buffer) = registry.buffer(handle) else {
                    debug_assert!(false, "unknown buffer {:?}", handle);
                    return;
                };
                let old = buffer.state();
                if needs_barrier(&old, &new) {
                    self.buffers.push(vk::BufferMemoryBarrier2 {
                        src_stage_mask: old.stage,
                        src_access_mask: old.src_access(),
                        dst_stage_mask: new.stage,
                        dst_access_mask: new.access,
                        src_queue_family_index: vk::QUEUE_FAMILY_IGNORED,
                        dst_queue_family_index: vk::QUEUE_FAMILY_IGNORED,
                        buffer: buffer.raw(),
                        offset: 0,
                        size: vk::WHOLE_SIZE,
                        ..Default::default()
                    });
                }
                registry.set_buffer_state(handle, new);
            }
            Target::Image { image: handle, range } => {
                let Some(image) = registry.image(handle) else {
                    debug_assert!(false, "unknown image {:?}", handle);
                    return;
                };
                debug_assert_ne!(new.layout, vk::ImageLayout::UNDEFINED);
                let (mip_levels, array_layers) = (image.mip_levels(), image.array_layers());
                let range = range.resolve(mip_levels, array_layers);
                let barrier = |old: BarrierState, range: SubresourceRange| vk::ImageMemoryBarrier2 {
                    src_stage_mask: old.stage,
                    src_access_mask: old.src_access(),
                    dst_stage_mask: new.stage,
                    dst_access_mask: new.access,
                    old_layout: if requirement.discard {
                        vk::ImageLayout::UNDEFINED
                    } else {
                        old.layout
                    },
                    new_layout: new.layout,
                    src_queue_family_index: vk::QUEUE_FAMILY_IGNORED,
                    dst_queue_family_index: vk::QUEUE_FAMILY_IGNORED,
                    image: image.raw(),
                    subresource_range: range.to_vk(image.aspect()),
                    ..Default::default()
                };
                match image.states().uniform() {
                    Some(old) if range.covers(mip_levels, array_layers) => {
                        if needs_barrier(&old, &new) {
                            self.images.push(barrier(old, range));
                        }
                    }
                    _ => {
                        for (mip, layer) in range.iter() {
                            let old = image.states().get(mip, layer);
                            if needs_barrier(&old, &new) {
                                self.images
                                    .push(barrier(old, SubresourceRange::single(mip, layer)));
                            }
                        }
                    }
                }
                registry.set_image_state(handle, &range, new);
            }
            Target::AccelStruct(handle) => {
                let old = registry.accel_state(handle);
                if needs_barrier(&old, &new) {
                    let memory = self.memory.get_or_insert_with(vk::MemoryBarrier2::default);
                    memory.src_stage_mask |= old.stage;
                    memory.src_access_mask |= old.src_access();
                    memory.dst_stage_mask |= new.stage;
                    memory.dst_access_mask |= new.access;
                }
                registry.set_accel_state(handle, new);
            }
        }
    }

    /// Queues a caller-specified buffer barrier verbatim.
    pub fn apply_explicit(&mut self, registry: &mut ResourceRegistry, command: &BufferBarrierCommand) {
        let Some(buffer) = registry.buffer(command.buffer) else {
            debug_assert!(false, "unknown buffer {:?}", command.buffer);
            return;
        };
        self.buffers.push(vk::BufferMemoryBarrier2 {
            src_stage_mask: command.src.stage,
            src_access_mask: command.src.src_access(),
            dst_stage_mask: command.dst.stage,
            dst_access_mask: command.dst.access,
            src_queue_family_index: command.src_queue_family_index,
            dst_queue_family_index: command.dst_queue_family_index,
            buffer: buffer.raw(),
            offset: command.offset,
            size: command.size,
            ..Default::default()
        });
        registry.set_buffer_state(command.buffer, command.dst);
    }

    /// Emits every pending transition as one barrier command and empties the batch.
    pub fn flush(&mut self, encoder: &mut dyn Encoder, synchronization2: bool) {
        if self.is_empty() {
            return;
        }
        tracing::trace!(
            memory = self.memory.is_some(),
            buffers = self.buffers.len(),
            images = self.images.len(),
            synchronization2,
            "flush barriers"
        );
        if synchronization2 {
            encoder.pipeline_barrier2(self.memory_barriers(), &self.buffers, &self.images);
        } else {
            let legacy = LegacyBarrier::new(self.memory_barriers(), &self.buffers, &self.images);
            encoder.pipeline_barrier(
                legacy.src_stage_mask,
                legacy.dst_stage_mask,
                &legacy.memory_barriers,
                &legacy.buffer_barriers,
                &legacy.image_barriers,
            );
        }
        self.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::testing::{Call, RecordingEncoder};
    use crate::resources::{BufferInfo, ImageInfo};
    use ash::vk::Handle;

    const SHADER_READ: BarrierState = BarrierState::new(
        vk::PipelineStageFlags2::FRAGMENT_SHADER,
        vk::AccessFlags2::SHADER_SAMPLED_READ,
        vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
    );

    fn registry_with_image(mips: u32) -> (ResourceRegistry, ImageHandle) {
        let mut registry = ResourceRegistry::new();
        let image = registry.create_image(
            ImageInfo::new_2d(vk::Image::from_raw(1), vk::Format::R8G8B8A8_UNORM, 16, 16)
                .mip_levels(mips),
        );
        (registry, image)
    }

    #[test]
    fn repeated_read_needs_one_barrier() {
        let mut registry = ResourceRegistry::new();
        let buffer = registry.create_buffer(BufferInfo {
            raw: vk::Buffer::from_raw(3),
            size: 64,
        });
        let mut batch = BarrierBatch::new();
        let mut requirements = Requirements::new();
        requirements.buffer(buffer, BarrierState::VERTEX_BUFFER);
        batch.apply_all(&mut registry, &requirements);
        assert_eq!(batch.buffer_barriers().len(), 1);
        batch.clear();
        batch.apply_all(&mut registry, &requirements);
        assert!(batch.is_empty());
    }

    #[test]
    fn repeated_write_is_ordered() {
        let mut registry = ResourceRegistry::new();
        let buffer = registry.create_buffer(BufferInfo {
            raw: vk::Buffer::from_raw(3),
            size: 64,
        });
        let mut batch = BarrierBatch::new();
        let mut requirements = Requirements::new();
        requirements.buffer(buffer, BarrierState::TRANSFER_WRITE);
        batch.apply_all(&mut registry, &requirements);
        batch.clear();
        batch.apply_all(&mut registry, &requirements);
        let barrier = batch.buffer_barriers()[0];
        assert_eq!(barrier.src_access_mask, vk::AccessFlags2::TRANSFER_WRITE);
        assert_eq!(barrier.dst_access_mask, vk::AccessFlags2::TRANSFER_WRITE);
    }

    #[test]
    fn read_source_access_is_dropped() {
        let mut registry = ResourceRegistry::new();
        let buffer = registry.create_buffer(BufferInfo {
            raw: vk::Buffer::from_raw(3),
            size: 64,
        });
        registry.set_buffer_state(buffer, BarrierState::VERTEX_BUFFER);
        let mut batch = BarrierBatch::new();
        batch.apply(
            &mut registry,
            &Requirement {
                target: Target::Buffer(buffer),
                state: BarrierState::TRANSFER_WRITE,
                discard: false,
            },
        );
        let barrier = batch.buffer_barriers()[0];
        assert_eq!(barrier.src_stage_mask, vk::PipelineStageFlags2::VERTEX_ATTRIBUTE_INPUT);
        assert_eq!(barrier.src_access_mask, vk::AccessFlags2::NONE);
    }

    #[test]
    fn full_transition_uses_one_barrier() {
        let (mut registry, image) = registry_with_image(4);
        let mut batch = BarrierBatch::new();
        let mut requirements = Requirements::new();
        requirements.image(image, SubresourceRange::full(4, 1), BarrierState::TRANSFER_DST);
        batch.apply_all(&mut registry, &requirements);
        assert_eq!(batch.image_barriers().len(), 1);
        assert_eq!(batch.image_barriers()[0].subresource_range.level_count, 4);
        assert!(registry.is_full_barrier(image));
    }

    #[test]
    fn partial_transition_splits_per_subresource() {
        let (mut registry, image) = registry_with_image(4);
        let mut batch = BarrierBatch::new();
        let mut requirements = Requirements::new();
        requirements.image(image, SubresourceRange::mips(0, 2, 1), SHADER_READ);
        batch.apply_all(&mut registry, &requirements);
        assert_eq!(batch.image_barriers().len(), 2);
        assert!(!registry.is_full_barrier(image));

        // Converging back over the whole extent restores the fast path.
        batch.clear();
        let mut requirements = Requirements::new();
        requirements.image(image, SubresourceRange::full(4, 1), BarrierState::TRANSFER_SRC);
        batch.apply_all(&mut registry, &requirements);
        assert_eq!(batch.image_barriers().len(), 4);
        let old_layouts: Vec<_> = batch.image_barriers().iter().map(|b| b.old_layout).collect();
        assert_eq!(
            old_layouts,
            vec![
                vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
                vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
                vk::ImageLayout::UNDEFINED,
                vk::ImageLayout::UNDEFINED
            ]
        );
        assert!(registry.is_full_barrier(image));
    }

    #[test]
    fn fast_path_matches_per_subresource_transitions() {
        let (mut fast, fast_image) = registry_with_image(3);
        let (mut slow, slow_image) = registry_with_image(3);
        let mut batch = BarrierBatch::new();

        let mut requirements = Requirements::new();
        requirements.image(fast_image, SubresourceRange::full(3, 1), SHADER_READ);
        batch.apply_all(&mut fast, &requirements);

        for mip in 0..3 {
            let mut requirements = Requirements::new();
            requirements.image(slow_image, SubresourceRange::single(mip, 0), SHADER_READ);
            batch.apply_all(&mut slow, &requirements);
        }
        assert_eq!(
            fast.image(fast_image).map(|i| i.states().clone()),
            slow.image(slow_image).map(|i| i.states().clone())
        );
    }

    #[test]
    fn discard_starts_from_undefined() {
        let (mut registry, image) = registry_with_image(1);
        registry.set_image_state(image, &SubresourceRange::full(1, 1), SHADER_READ);
        let mut batch = BarrierBatch::new();
        batch.apply(
            &mut registry,
            &Requirement {
                target: Target::Image {
                    image,
                    range: SubresourceRange::full(1, 1),
                },
                state: BarrierState::COLOR_ATTACHMENT,
                discard: true,
            },
        );
        assert_eq!(batch.image_barriers()[0].old_layout, vk::ImageLayout::UNDEFINED);
        assert_eq!(
            batch.image_barriers()[0].new_layout,
            vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL
        );
    }

    #[test]
    fn merges_requirements_per_resource() {
        let mut requirements = Requirements::new();
        let (registry, image) = registry_with_image(1);
        let range = SubresourceRange::full(1, 1);
        requirements.image(image, range, SHADER_READ);
        requirements.image(image, range, BarrierState::new(
            vk::PipelineStageFlags2::COMPUTE_SHADER,
            vk::AccessFlags2::SHADER_STORAGE_WRITE,
            vk::ImageLayout::GENERAL,
        ));
        assert_eq!(requirements.len(), 1);
        let merged = requirements.iter().next().map(|r| r.state);
        assert_eq!(merged.map(|s| s.layout), Some(vk::ImageLayout::GENERAL));
        assert!(merged.map_or(false, |s| s.is_write()));
        drop(registry);
    }

    #[test]
    fn overlapping_views_transition_each_mip_once() {
        let (mut registry, image) = registry_with_image(4);
        let storage = BarrierState::new(
            vk::PipelineStageFlags2::COMPUTE_SHADER,
            vk::AccessFlags2::SHADER_STORAGE_WRITE,
            vk::ImageLayout::GENERAL,
        );
        let mut requirements = Requirements::new();
        requirements.image(image, SubresourceRange::full(4, 1), SHADER_READ);
        requirements.image(image, SubresourceRange::single(1, 0), storage);
        let mut batch = BarrierBatch::new();
        batch.apply_all(&mut registry, &requirements);

        let on_mip = |mip: u32| -> Vec<vk::ImageMemoryBarrier2> {
            batch
                .image_barriers()
                .iter()
                .filter(|b| {
                    let r = b.subresource_range;
                    r.base_mip_level <= mip && mip < r.base_mip_level + r.level_count
                })
                .copied()
                .collect()
        };
        let mip1 = on_mip(1);
        assert_eq!(mip1.len(), 1);
        assert_eq!(mip1[0].new_layout, vk::ImageLayout::GENERAL);
        assert!(mip1[0].dst_access_mask.contains(vk::AccessFlags2::SHADER_STORAGE_WRITE));
        assert!(mip1[0].dst_access_mask.contains(vk::AccessFlags2::SHADER_SAMPLED_READ));
        for mip in [0, 2, 3] {
            let barriers = on_mip(mip);
            assert_eq!(barriers.len(), 1);
            assert_eq!(barriers[0].new_layout, vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL);
        }

        assert_eq!(registry.image_state(image, 1, 0).layout, vk::ImageLayout::GENERAL);
        assert_eq!(
            registry.image_state(image, 0, 0).layout,
            vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL
        );
    }

    #[test]
    fn overlapping_views_of_one_state_keep_the_fast_path() {
        let (mut registry, image) = registry_with_image(4);
        let mut requirements = Requirements::new();
        requirements.image(image, SubresourceRange::mips(0, 3, 1), SHADER_READ);
        requirements.image(image, SubresourceRange::mips(2, 2, 1), SHADER_READ);
        let mut batch = BarrierBatch::new();
        batch.apply_all(&mut registry, &requirements);
        assert_eq!(batch.image_barriers().len(), 1);
        assert_eq!(batch.image_barriers()[0].subresource_range.level_count, 4);
        assert!(registry.is_full_barrier(image));
    }

    #[test]
    fn flush_paths() {
        let (mut registry, image) = registry_with_image(1);
        let mut batch = BarrierBatch::new();
        let mut requirements = Requirements::new();
        requirements.image(image, SubresourceRange::full(1, 1), BarrierState::TRANSFER_DST);
        batch.apply_all(&mut registry, &requirements);

        let mut encoder = RecordingEncoder::new();
        batch.flush(&mut encoder, false);
        assert!(batch.is_empty());
        batch.flush(&mut encoder, false);
        match encoder.calls() {
            [Call::PipelineBarrier {
                src_stage_mask,
                dst_stage_mask,
                images,
                ..
            }] => {
                assert_eq!(*src_stage_mask, vk::PipelineStageFlags::TOP_OF_PIPE);
                assert_eq!(*dst_stage_mask, vk::PipelineStageFlags::TRANSFER);
                assert_eq!(images.len(), 1);
            }
            calls => panic!("unexpected calls {:?}", calls),
        }
    }
}
