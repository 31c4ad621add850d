//! Groups consecutive builds of one level into a single native build call.

use ash::{prelude::VkResult, vk};

use super::{BuildDescription, Level, NativeBuild, PendingCompaction};
use crate::command::barrier::{BarrierBatch, Requirements};
use crate::command::encoder::Encoder;
use crate::resources::{AccelStructHandle, BarrierState, ResourceRegistry};

#[derive(Default)]
pub(crate) struct BuildBatch {
    level: Option<Level>,
    builds: Vec<BuildDescription>,
}

impl BuildBatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.builds.is_empty()
    }

    pub fn level(&self) -> Option<Level> {
        self.level
    }

    /// Adds a build. Returns it back when it belongs to the other level or touches a
    /// structure another build of the batch writes, in which case the batch has to be
    /// flushed first.
    pub fn push(
        &mut self,
        registry: &ResourceRegistry,
        build: BuildDescription,
    ) -> Result<(), BuildDescription> {
        let Some(level) = registry.accel_struct(build.dst).map(|a| a.level()) else {
            debug_assert!(false, "unknown acceleration structure {:?}", build.dst);
            return Ok(());
        };
        debug_assert!(
            build.geometries.iter().all(|g| g.level() == level),
            "geometry kind does not match the level of {:?}",
            build.dst
        );
        if matches!(self.level, Some(current) if current != level) || self.aliases(&build) {
            return Err(build);
        }
        self.level = Some(level);
        self.builds.push(build);
        Ok(())
    }

    /// One native call must not write a structure any of its other builds reads or
    /// writes.
    fn aliases(&self, build: &BuildDescription) -> bool {
        self.builds.iter().any(|batched| {
            batched.dst == build.dst
                || batched.src == Some(build.dst)
                || build.src == Some(batched.dst)
        })
    }

    /// Issues one native build for everything accumulated, then queries compacted sizes
    /// for the builds that asked for it.
    pub fn flush(
        &mut self,
        registry: &mut ResourceRegistry,
        barriers: &mut BarrierBatch,
        encoder: &mut dyn Encoder,
        synchronization2: bool,
    ) -> VkResult<()> {
        let Some(level) = self.level.take() else {
            return Ok(());
        };
        let builds = std::mem::take(&mut self.builds);

        let mut requirements = Requirements::new();
        for build in &builds {
            for geometry in &build.geometries {
                for input in geometry.inputs() {
                    requirements.buffer(input, BarrierState::ACCELERATION_STRUCTURE_BUILD_INPUT);
                }
            }
            for blas in &build.bottom_levels {
                requirements.accel_struct(*blas, BarrierState::ACCELERATION_STRUCTURE_READ);
            }
            if let Some(src) = build.src {
                requirements.accel_struct(src, BarrierState::ACCELERATION_STRUCTURE_READ);
            }
            requirements.accel_struct(build.dst, BarrierState::ACCELERATION_STRUCTURE_WRITE);
        }
        barriers.apply_all(registry, &requirements);
        barriers.flush(encoder, synchronization2);

        let raw = |handle: AccelStructHandle| {
            registry
                .accel_struct(handle)
                .map_or(vk::AccelerationStructureKHR::null(), |a| a.raw())
        };
        let natives: Vec<NativeBuild> = builds
            .iter()
            .map(|build| NativeBuild {
                ty: level.into(),
                mode: if build.src.is_some() {
                    vk::BuildAccelerationStructureModeKHR::UPDATE
                } else {
                    vk::BuildAccelerationStructureModeKHR::BUILD
                },
                flags: build.flags,
                src: build.src.map_or(vk::AccelerationStructureKHR::null(), raw),
                dst: raw(build.dst),
                scratch_address: build.scratch_address,
                geometries: build.geometries.iter().map(|g| g.to_vk()).collect(),
                ranges: build
                    .geometries
                    .iter()
                    .map(|g| vk::AccelerationStructureBuildRangeInfoKHR {
                        primitive_count: g.primitive_count(),
                        primitive_offset: 0,
                        first_vertex: 0,
                        transform_offset: 0,
                    })
                    .collect(),
            })
            .collect();
        tracing::trace!(?level, count = natives.len(), "build acceleration structures");
        encoder.build_acceleration_structures(&natives);

        let compacting: Vec<AccelStructHandle> = builds
            .iter()
            .filter(|build| build.compact)
            .map(|build| build.dst)
            .collect();
        if compacting.is_empty() {
            return Ok(());
        }
        // The size query reads what the build just wrote.
        let mut requirements = Requirements::new();
        for handle in &compacting {
            requirements.accel_struct(*handle, BarrierState::ACCELERATION_STRUCTURE_READ);
        }
        barriers.apply_all(registry, &requirements);
        barriers.flush(encoder, synchronization2);

        let raws: Vec<_> = compacting
            .iter()
            .filter_map(|handle| registry.accel_struct(*handle).map(|a| a.raw()))
            .collect();
        let query = encoder.write_compacted_sizes(&raws)?;
        for (index, handle) in compacting.into_iter().enumerate() {
            if let Some(accel_struct) = registry.accel_struct_mut(handle) {
                accel_struct.pending_compaction = Some(PendingCompaction {
                    query: query.clone(),
                    index: index as u32,
                });
            }
        }
        Ok(())
    }
}

/// Copies one structure into another. A compacting copy consumes the source's pending
/// compaction marker.
pub(crate) fn copy(
    registry: &mut ResourceRegistry,
    barriers: &mut BarrierBatch,
    encoder: &mut dyn Encoder,
    synchronization2: bool,
    src: AccelStructHandle,
    dst: AccelStructHandle,
    mode: vk::CopyAccelerationStructureModeKHR,
) {
    let mut requirements = Requirements::new();
    requirements.accel_struct(src, BarrierState::ACCELERATION_STRUCTURE_READ);
    requirements.accel_struct(dst, BarrierState::ACCELERATION_STRUCTURE_WRITE);
    barriers.apply_all(registry, &requirements);
    barriers.flush(encoder, synchronization2);

    if mode == vk::CopyAccelerationStructureModeKHR::COMPACT {
        let marker = registry
            .accel_struct_mut(src)
            .and_then(|a| a.pending_compaction.take());
        debug_assert!(
            marker.is_some(),
            "compacting copy from {:?}, which was not built for compaction",
            src
        );
    }
    let (Some(src_raw), Some(dst_raw)) = (
        registry.accel_struct(src).map(|a| a.raw()),
        registry.accel_struct(dst).map(|a| a.raw()),
    ) else {
        return;
    };
    encoder.copy_acceleration_structure(src_raw, dst_raw, mode);
}
