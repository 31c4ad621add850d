use ash::vk;

/// The last-known synchronization state of a buffer, an image subresource or an
/// acceleration structure: which pipeline stages touched it, with which memory accesses,
/// and (for images) in which layout it was left.
///
/// Buffers and acceleration structures always carry `vk::ImageLayout::UNDEFINED`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct BarrierState {
    pub stage: vk::PipelineStageFlags2,
    pub access: vk::AccessFlags2,
    pub layout: vk::ImageLayout,
}

impl Default for BarrierState {
    fn default() -> Self {
        Self::UNDEFINED
    }
}

const fn stages(a: vk::PipelineStageFlags2, b: vk::PipelineStageFlags2) -> vk::PipelineStageFlags2 {
    vk::PipelineStageFlags2::from_raw(a.as_raw() | b.as_raw())
}
const fn accesses(a: vk::AccessFlags2, b: vk::AccessFlags2) -> vk::AccessFlags2 {
    vk::AccessFlags2::from_raw(a.as_raw() | b.as_raw())
}

impl BarrierState {
    #[inline]
    pub const fn new(
        stage: vk::PipelineStageFlags2,
        access: vk::AccessFlags2,
        layout: vk::ImageLayout,
    ) -> Self {
        Self {
            stage,
            access,
            layout,
        }
    }
    #[inline]
    pub const fn buffer(stage: vk::PipelineStageFlags2, access: vk::AccessFlags2) -> Self {
        Self::new(stage, access, vk::ImageLayout::UNDEFINED)
    }

    /// Nothing has touched the resource yet.
    pub const UNDEFINED: Self = Self::new(
        vk::PipelineStageFlags2::NONE,
        vk::AccessFlags2::NONE,
        vk::ImageLayout::UNDEFINED,
    );

    /// Placeholder written into the table for attachments of a multi-subpass render pass.
    /// Intra-pass dependencies are expressed by the native subpass dependencies instead.
    pub const GENERAL: Self = Self::new(
        vk::PipelineStageFlags2::ALL_COMMANDS,
        accesses(vk::AccessFlags2::MEMORY_READ, vk::AccessFlags2::MEMORY_WRITE),
        vk::ImageLayout::GENERAL,
    );

    pub const COLOR_ATTACHMENT: Self = Self::new(
        vk::PipelineStageFlags2::COLOR_ATTACHMENT_OUTPUT,
        accesses(
            vk::AccessFlags2::COLOR_ATTACHMENT_READ,
            vk::AccessFlags2::COLOR_ATTACHMENT_WRITE,
        ),
        vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL,
    );

    pub const DEPTH_STENCIL_ATTACHMENT: Self = Self::new(
        stages(
            vk::PipelineStageFlags2::EARLY_FRAGMENT_TESTS,
            vk::PipelineStageFlags2::LATE_FRAGMENT_TESTS,
        ),
        accesses(
            vk::AccessFlags2::DEPTH_STENCIL_ATTACHMENT_READ,
            vk::AccessFlags2::DEPTH_STENCIL_ATTACHMENT_WRITE,
        ),
        vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL,
    );

    pub const TRANSFER_SRC: Self = Self::new(
        vk::PipelineStageFlags2::TRANSFER,
        vk::AccessFlags2::TRANSFER_READ,
        vk::ImageLayout::TRANSFER_SRC_OPTIMAL,
    );

    pub const TRANSFER_DST: Self = Self::new(
        vk::PipelineStageFlags2::TRANSFER,
        vk::AccessFlags2::TRANSFER_WRITE,
        vk::ImageLayout::TRANSFER_DST_OPTIMAL,
    );

    pub const PRESENT: Self = Self::new(
        vk::PipelineStageFlags2::NONE,
        vk::AccessFlags2::NONE,
        vk::ImageLayout::PRESENT_SRC_KHR,
    );

    pub const VERTEX_BUFFER: Self = Self::buffer(
        vk::PipelineStageFlags2::VERTEX_ATTRIBUTE_INPUT,
        vk::AccessFlags2::VERTEX_ATTRIBUTE_READ,
    );

    pub const INDEX_BUFFER: Self = Self::buffer(
        vk::PipelineStageFlags2::INDEX_INPUT,
        vk::AccessFlags2::INDEX_READ,
    );

    pub const INDIRECT_BUFFER: Self = Self::buffer(
        vk::PipelineStageFlags2::DRAW_INDIRECT,
        vk::AccessFlags2::INDIRECT_COMMAND_READ,
    );

    pub const TRANSFER_READ: Self = Self::buffer(
        vk::PipelineStageFlags2::TRANSFER,
        vk::AccessFlags2::TRANSFER_READ,
    );

    pub const TRANSFER_WRITE: Self = Self::buffer(
        vk::PipelineStageFlags2::TRANSFER,
        vk::AccessFlags2::TRANSFER_WRITE,
    );

    /// Geometry, instance and AABB data consumed by an acceleration structure build.
    pub const ACCELERATION_STRUCTURE_BUILD_INPUT: Self = Self::buffer(
        vk::PipelineStageFlags2::ACCELERATION_STRUCTURE_BUILD_KHR,
        vk::AccessFlags2::SHADER_READ,
    );

    pub const ACCELERATION_STRUCTURE_READ: Self = Self::buffer(
        vk::PipelineStageFlags2::ACCELERATION_STRUCTURE_BUILD_KHR,
        vk::AccessFlags2::ACCELERATION_STRUCTURE_READ_KHR,
    );

    pub const ACCELERATION_STRUCTURE_WRITE: Self = Self::buffer(
        vk::PipelineStageFlags2::ACCELERATION_STRUCTURE_BUILD_KHR,
        vk::AccessFlags2::ACCELERATION_STRUCTURE_WRITE_KHR,
    );

    const WRITE_ACCESS: vk::AccessFlags2 = vk::AccessFlags2::from_raw(
        vk::AccessFlags2::SHADER_WRITE.as_raw()
            | vk::AccessFlags2::SHADER_STORAGE_WRITE.as_raw()
            | vk::AccessFlags2::COLOR_ATTACHMENT_WRITE.as_raw()
            | vk::AccessFlags2::DEPTH_STENCIL_ATTACHMENT_WRITE.as_raw()
            | vk::AccessFlags2::TRANSFER_WRITE.as_raw()
            | vk::AccessFlags2::HOST_WRITE.as_raw()
            | vk::AccessFlags2::MEMORY_WRITE.as_raw()
            | vk::AccessFlags2::ACCELERATION_STRUCTURE_WRITE_KHR.as_raw(),
    );

    #[inline]
    pub fn is_write(&self) -> bool {
        self.access.intersects(Self::WRITE_ACCESS)
    }

    /// Accesses that need an availability operation when this state is the source of a
    /// barrier. Reads never need to be made available.
    #[inline]
    pub fn src_access(&self) -> vk::AccessFlags2 {
        self.access & Self::WRITE_ACCESS
    }

    /// Combines two requirements on the same resource within one dependency boundary.
    /// Conflicting layouts fall back to `GENERAL`.
    pub fn merge(&self, other: &Self) -> Self {
        let layout = if self.layout == other.layout {
            self.layout
        } else {
            vk::ImageLayout::GENERAL
        };
        Self {
            stage: self.stage | other.stage,
            access: self.access | other.access,
            layout,
        }
    }
}

/// A (mip, layer) rectangle of an image.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct SubresourceRange {
    pub base_mip_level: u32,
    pub mip_level_count: u32,
    pub base_array_layer: u32,
    pub array_layer_count: u32,
}

impl SubresourceRange {
    pub const fn full(mip_levels: u32, array_layers: u32) -> Self {
        Self {
            base_mip_level: 0,
            mip_level_count: mip_levels,
            base_array_layer: 0,
            array_layer_count: array_layers,
        }
    }
    pub const fn single(mip_level: u32, array_layer: u32) -> Self {
        Self {
            base_mip_level: mip_level,
            mip_level_count: 1,
            base_array_layer: array_layer,
            array_layer_count: 1,
        }
    }
    pub const fn mips(base_mip_level: u32, mip_level_count: u32, array_layers: u32) -> Self {
        Self {
            base_mip_level,
            mip_level_count,
            base_array_layer: 0,
            array_layer_count: array_layers,
        }
    }

    /// Replaces `vk::REMAINING_MIP_LEVELS` / `vk::REMAINING_ARRAY_LAYERS` (and zero counts)
    /// with the actual remainder of an image of the given dimensions.
    pub fn resolve(mut self, mip_levels: u32, array_layers: u32) -> Self {
        if self.mip_level_count == 0 || self.mip_level_count == vk::REMAINING_MIP_LEVELS {
            self.mip_level_count = mip_levels.saturating_sub(self.base_mip_level);
        }
        if self.array_layer_count == 0 || self.array_layer_count == vk::REMAINING_ARRAY_LAYERS {
            self.array_layer_count = array_layers.saturating_sub(self.base_array_layer);
        }
        self
    }

    pub fn covers(&self, mip_levels: u32, array_layers: u32) -> bool {
        self.base_mip_level == 0
            && self.base_array_layer == 0
            && self.mip_level_count >= mip_levels
            && self.array_layer_count >= array_layers
    }

    pub fn contains(&self, mip_level: u32, array_layer: u32) -> bool {
        (self.base_mip_level..self.base_mip_level + self.mip_level_count).contains(&mip_level)
            && (self.base_array_layer..self.base_array_layer + self.array_layer_count)
                .contains(&array_layer)
    }

    pub fn overlaps(&self, other: &Self) -> bool {
        self.base_mip_level < other.base_mip_level + other.mip_level_count
            && other.base_mip_level < self.base_mip_level + self.mip_level_count
            && self.base_array_layer < other.base_array_layer + other.array_layer_count
            && other.base_array_layer < self.base_array_layer + self.array_layer_count
    }

    pub fn len(&self) -> usize {
        self.mip_level_count as usize * self.array_layer_count as usize
    }

    /// Iterates (mip, layer) pairs, mip-major.
    pub fn iter(&self) -> impl Iterator<Item = (u32, u32)> {
        let layers = self.base_array_layer..self.base_array_layer + self.array_layer_count;
        (self.base_mip_level..self.base_mip_level + self.mip_level_count)
            .flat_map(move |mip| layers.clone().map(move |layer| (mip, layer)))
    }

    pub fn to_vk(&self, aspect_mask: vk::ImageAspectFlags) -> vk::ImageSubresourceRange {
        vk::ImageSubresourceRange {
            aspect_mask,
            base_mip_level: self.base_mip_level,
            level_count: self.mip_level_count,
            base_array_layer: self.base_array_layer,
            layer_count: self.array_layer_count,
        }
    }
}

impl From<vk::ImageSubresourceLayers> for SubresourceRange {
    fn from(layers: vk::ImageSubresourceLayers) -> Self {
        Self {
            base_mip_level: layers.mip_level,
            mip_level_count: 1,
            base_array_layer: layers.base_array_layer,
            array_layer_count: layers.layer_count,
        }
    }
}

impl From<vk::ImageSubresourceRange> for SubresourceRange {
    fn from(range: vk::ImageSubresourceRange) -> Self {
        Self {
            base_mip_level: range.base_mip_level,
            mip_level_count: range.level_count,
            base_array_layer: range.base_array_layer,
            array_layer_count: range.layer_count,
        }
    }
}

/// Per-subresource states of one image.
///
/// While every subresource agrees (`is_full`), only `uniform` is kept and the
/// per-subresource array stays empty. The first transition of a sub-range that diverges
/// from the rest expands the array; the next transition covering the whole extent
/// collapses it again.
#[derive(Clone, Debug)]
pub struct ImageStates {
    mip_levels: u32,
    array_layers: u32,
    full: bool,
    uniform: BarrierState,
    subresources: Vec<BarrierState>,
}

impl ImageStates {
    pub fn new(mip_levels: u32, array_layers: u32) -> Self {
        Self {
            mip_levels: mip_levels.max(1),
            array_layers: array_layers.max(1),
            full: true,
            uniform: BarrierState::UNDEFINED,
            subresources: Vec::new(),
        }
    }

    #[inline]
    pub fn is_full(&self) -> bool {
        self.full
    }

    /// The shared state when the full-barrier fast path holds.
    #[inline]
    pub fn uniform(&self) -> Option<BarrierState> {
        self.full.then_some(self.uniform)
    }

    pub fn mip_levels(&self) -> u32 {
        self.mip_levels
    }
    pub fn array_layers(&self) -> u32 {
        self.array_layers
    }

    #[inline]
    fn index(&self, mip_level: u32, array_layer: u32) -> usize {
        mip_level as usize * self.array_layers as usize + array_layer as usize
    }

    pub fn get(&self, mip_level: u32, array_layer: u32) -> BarrierState {
        debug_assert!(mip_level < self.mip_levels && array_layer < self.array_layers);
        if self.full {
            self.uniform
        } else {
            self.subresources[self.index(mip_level, array_layer)]
        }
    }

    pub fn set(&mut self, range: &SubresourceRange, state: BarrierState) {
        if range.covers(self.mip_levels, self.array_layers) {
            self.full = true;
            self.uniform = state;
            self.subresources.clear();
            return;
        }
        if self.full {
            if self.uniform == state {
                // Nothing diverges.
                return;
            }
            let len = self.mip_levels as usize * self.array_layers as usize;
            self.subresources = vec![self.uniform; len];
            self.full = false;
        }
        for (mip, layer) in range.iter() {
            if mip < self.mip_levels && layer < self.array_layers {
                let index = self.index(mip, layer);
                self.subresources[index] = state;
            }
        }
    }
}

impl PartialEq for ImageStates {
    /// Compares what the table believes about every subresource, regardless of
    /// whether the fast path is in use.
    fn eq(&self, other: &Self) -> bool {
        self.mip_levels == other.mip_levels
            && self.array_layers == other.array_layers
            && SubresourceRange::full(self.mip_levels, self.array_layers)
                .iter()
                .all(|(mip, layer)| self.get(mip, layer) == other.get(mip, layer))
    }
}

/// State of an image view's range as read from / written to the table.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ImageRangeState {
    Uniform(BarrierState),
    /// One state per subresource of the range, mip-major.
    Mixed(Vec<BarrierState>),
}

impl ImageRangeState {
    pub fn from_states(states: Vec<BarrierState>) -> Self {
        match states.first() {
            Some(first) if states.iter().all(|s| s == first) => Self::Uniform(*first),
            Some(_) => Self::Mixed(states),
            None => Self::Uniform(BarrierState::UNDEFINED),
        }
    }
    pub fn as_uniform(&self) -> Option<BarrierState> {
        match self {
            Self::Uniform(state) => Some(*state),
            Self::Mixed(_) => None,
        }
    }
}
