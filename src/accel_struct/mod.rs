use std::sync::Arc;

use ash::{prelude::VkResult, vk};
use smallvec::SmallVec;

use crate::resources::{AccelStructHandle, BarrierState, BufferHandle};

pub(crate) mod batch;

/// Bottom-level and top-level structures are never built by the same native call.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Level {
    BottomLevel,
    TopLevel,
}

impl From<Level> for vk::AccelerationStructureTypeKHR {
    fn from(level: Level) -> Self {
        match level {
            Level::BottomLevel => vk::AccelerationStructureTypeKHR::BOTTOM_LEVEL,
            Level::TopLevel => vk::AccelerationStructureTypeKHR::TOP_LEVEL,
        }
    }
}

#[derive(Clone, Copy, Debug)]
pub struct AccelerationStructureInfo {
    pub raw: vk::AccelerationStructureKHR,
    pub level: Level,
    pub device_address: vk::DeviceAddress,
    pub size: vk::DeviceSize,
}

/// Reads back sizes written by a compaction query. Implementations never block.
pub trait CompactionQuery: Send + Sync {
    /// `None` while the GPU has not produced the result yet.
    fn compacted_size(&self, index: u32) -> VkResult<Option<vk::DeviceSize>>;
}

/// Marker left on a structure whose build asked for compaction. Consumed by the
/// compacting copy.
#[derive(Clone)]
pub struct PendingCompaction {
    pub(crate) query: Arc<dyn CompactionQuery>,
    pub(crate) index: u32,
}

impl PendingCompaction {
    pub fn compacted_size(&self) -> VkResult<Option<vk::DeviceSize>> {
        self.query.compacted_size(self.index)
    }
}

impl std::fmt::Debug for PendingCompaction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_fmt(format_args!("PendingCompaction({})", self.index))
    }
}

pub struct AccelerationStructure {
    pub(crate) raw: vk::AccelerationStructureKHR,
    pub(crate) level: Level,
    pub(crate) device_address: vk::DeviceAddress,
    pub(crate) size: vk::DeviceSize,
    pub(crate) state: BarrierState,
    pub(crate) pending_compaction: Option<PendingCompaction>,
}

impl AccelerationStructure {
    pub(crate) fn new(info: AccelerationStructureInfo) -> Self {
        Self {
            raw: info.raw,
            level: info.level,
            device_address: info.device_address,
            size: info.size,
            state: BarrierState::UNDEFINED,
            pending_compaction: None,
        }
    }
    pub fn raw(&self) -> vk::AccelerationStructureKHR {
        self.raw
    }
    pub fn level(&self) -> Level {
        self.level
    }
    pub fn device_address(&self) -> vk::DeviceAddress {
        self.device_address
    }
    pub fn size(&self) -> vk::DeviceSize {
        self.size
    }
    pub fn state(&self) -> BarrierState {
        self.state
    }
    pub fn pending_compaction(&self) -> Option<&PendingCompaction> {
        self.pending_compaction.as_ref()
    }
}

/// A device address inside a tracked buffer.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BufferAddress {
    pub buffer: BufferHandle,
    pub address: vk::DeviceAddress,
}

#[derive(Clone, Copy, Debug)]
pub enum BuildGeometry {
    Triangles {
        vertex_format: vk::Format,
        vertices: BufferAddress,
        vertex_stride: vk::DeviceSize,
        max_vertex: u32,
        index_type: vk::IndexType,
        indices: Option<BufferAddress>,
        transform: Option<BufferAddress>,
        primitive_count: u32,
        flags: vk::GeometryFlagsKHR,
    },
    Aabbs {
        data: BufferAddress,
        stride: vk::DeviceSize,
        primitive_count: u32,
        flags: vk::GeometryFlagsKHR,
    },
    Instances {
        data: BufferAddress,
        primitive_count: u32,
        flags: vk::GeometryFlagsKHR,
    },
}

impl BuildGeometry {
    /// Buffers the build reads from.
    pub fn inputs(&self) -> impl Iterator<Item = BufferHandle> {
        let inputs: [Option<BufferAddress>; 3] = match *self {
            BuildGeometry::Triangles {
                vertices,
                indices,
                transform,
                ..
            } => [Some(vertices), indices, transform],
            BuildGeometry::Aabbs { data, .. } | BuildGeometry::Instances { data, .. } => {
                [Some(data), None, None]
            }
        };
        inputs.into_iter().flatten().map(|input| input.buffer)
    }

    pub fn primitive_count(&self) -> u32 {
        match *self {
            BuildGeometry::Triangles {
                primitive_count, ..
            }
            | BuildGeometry::Aabbs {
                primitive_count, ..
            }
            | BuildGeometry::Instances {
                primitive_count, ..
            } => primitive_count,
        }
    }

    pub fn level(&self) -> Level {
        match self {
            BuildGeometry::Instances { .. } => Level::TopLevel,
            _ => Level::BottomLevel,
        }
    }

    pub fn to_vk(&self) -> vk::AccelerationStructureGeometryKHR {
        match *self {
            BuildGeometry::Triangles {
                vertex_format,
                vertices,
                vertex_stride,
                max_vertex,
                index_type,
                indices,
                transform,
                flags,
                ..
            } => vk::AccelerationStructureGeometryKHR {
                geometry_type: vk::GeometryTypeKHR::TRIANGLES,
                geometry: vk::AccelerationStructureGeometryDataKHR {
                    triangles: vk::AccelerationStructureGeometryTrianglesDataKHR {
                        vertex_format,
                        vertex_data: vk::DeviceOrHostAddressConstKHR {
                            device_address: vertices.address,
                        },
                        vertex_stride,
                        max_vertex,
                        index_type: if indices.is_some() {
                            index_type
                        } else {
                            vk::IndexType::NONE_KHR
                        },
                        index_data: vk::DeviceOrHostAddressConstKHR {
                            device_address: indices.map_or(0, |i| i.address),
                        },
                        transform_data: vk::DeviceOrHostAddressConstKHR {
                            device_address: transform.map_or(0, |t| t.address),
                        },
                        ..Default::default()
                    },
                },
                flags,
                ..Default::default()
            },
            BuildGeometry::Aabbs {
                data, stride, flags, ..
            } => vk::AccelerationStructureGeometryKHR {
                geometry_type: vk::GeometryTypeKHR::AABBS,
                geometry: vk::AccelerationStructureGeometryDataKHR {
                    aabbs: vk::AccelerationStructureGeometryAabbsDataKHR {
                        data: vk::DeviceOrHostAddressConstKHR {
                            device_address: data.address,
                        },
                        stride,
                        ..Default::default()
                    },
                },
                flags,
                ..Default::default()
            },
            BuildGeometry::Instances { data, flags, .. } => vk::AccelerationStructureGeometryKHR {
                geometry_type: vk::GeometryTypeKHR::INSTANCES,
                geometry: vk::AccelerationStructureGeometryDataKHR {
                    instances: vk::AccelerationStructureGeometryInstancesDataKHR {
                        array_of_pointers: vk::FALSE,
                        data: vk::DeviceOrHostAddressConstKHR {
                            device_address: data.address,
                        },
                        ..Default::default()
                    },
                },
                flags,
                ..Default::default()
            },
        }
    }
}

/// One acceleration structure build as recorded into a command stream.
#[derive(Clone, Debug)]
pub struct BuildDescription {
    pub dst: AccelStructHandle,
    /// Set for updates: the structure refitted into `dst`.
    pub src: Option<AccelStructHandle>,
    pub flags: vk::BuildAccelerationStructureFlagsKHR,
    pub geometries: SmallVec<[BuildGeometry; 1]>,
    pub scratch_address: vk::DeviceAddress,
    /// Write the compacted size after the build so the structure can be compacted later.
    pub compact: bool,
    /// Bottom-level structures referenced by the instances of a top-level build.
    pub bottom_levels: SmallVec<[AccelStructHandle; 4]>,
}

impl BuildDescription {
    pub fn new(dst: AccelStructHandle, scratch_address: vk::DeviceAddress) -> Self {
        Self {
            dst,
            src: None,
            flags: vk::BuildAccelerationStructureFlagsKHR::PREFER_FAST_TRACE,
            geometries: SmallVec::new(),
            scratch_address,
            compact: false,
            bottom_levels: SmallVec::new(),
        }
    }
    pub fn geometry(mut self, geometry: BuildGeometry) -> Self {
        self.geometries.push(geometry);
        self
    }
    pub fn update(mut self, src: AccelStructHandle) -> Self {
        self.src = Some(src);
        self.flags |= vk::BuildAccelerationStructureFlagsKHR::ALLOW_UPDATE;
        self
    }
    pub fn compact(mut self) -> Self {
        self.compact = true;
        self.flags |= vk::BuildAccelerationStructureFlagsKHR::ALLOW_COMPACTION;
        self
    }
    pub fn flags(mut self, flags: vk::BuildAccelerationStructureFlagsKHR) -> Self {
        self.flags |= flags;
        self
    }
    pub fn bottom_level(mut self, blas: AccelStructHandle) -> Self {
        self.bottom_levels.push(blas);
        self
    }
}

/// A build resolved to native handles, ready for one `vkCmdBuildAccelerationStructuresKHR`.
pub struct NativeBuild {
    pub ty: vk::AccelerationStructureTypeKHR,
    pub mode: vk::BuildAccelerationStructureModeKHR,
    pub flags: vk::BuildAccelerationStructureFlagsKHR,
    pub src: vk::AccelerationStructureKHR,
    pub dst: vk::AccelerationStructureKHR,
    pub scratch_address: vk::DeviceAddress,
    pub geometries: Vec<vk::AccelerationStructureGeometryKHR>,
    pub ranges: Vec<vk::AccelerationStructureBuildRangeInfoKHR>,
}

impl NativeBuild {
    /// The geometry info points into `self.geometries`; `self` must outlive its use.
    pub fn geometry_info(&self) -> vk::AccelerationStructureBuildGeometryInfoKHR {
        vk::AccelerationStructureBuildGeometryInfoKHR {
            ty: self.ty,
            flags: self.flags,
            mode: self.mode,
            src_acceleration_structure: self.src,
            dst_acceleration_structure: self.dst,
            geometry_count: self.geometries.len() as u32,
            p_geometries: self.geometries.as_ptr(),
            scratch_data: vk::DeviceOrHostAddressKHR {
                device_address: self.scratch_address,
            },
            ..Default::default()
        }
    }
}
