use ash::vk;

use crate::resources::{AccelStructHandle, BarrierState, BufferHandle, ImageViewHandle};

/// What a descriptor slot points at.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum DescriptorResource {
    Buffer(BufferHandle),
    ImageView(ImageViewHandle),
    AccelerationStructure(AccelStructHandle),
}

impl From<BufferHandle> for DescriptorResource {
    fn from(handle: BufferHandle) -> Self {
        Self::Buffer(handle)
    }
}
impl From<ImageViewHandle> for DescriptorResource {
    fn from(handle: ImageViewHandle) -> Self {
        Self::ImageView(handle)
    }
}
impl From<AccelStructHandle> for DescriptorResource {
    fn from(handle: AccelStructHandle) -> Self {
        Self::AccelerationStructure(handle)
    }
}

#[derive(Clone, Copy, Debug)]
pub struct DescriptorBindingInfo {
    pub binding: u32,
    pub ty: vk::DescriptorType,
    pub stages: vk::ShaderStageFlags,
    /// Shaders may write through this binding.
    pub writable: bool,
    /// Number of slots. Bindless arrays have many.
    pub count: u32,
}

impl DescriptorBindingInfo {
    pub fn new(binding: u32, ty: vk::DescriptorType, stages: vk::ShaderStageFlags) -> Self {
        Self {
            binding,
            ty,
            stages,
            writable: false,
            count: 1,
        }
    }
    pub fn writable(mut self) -> Self {
        self.writable = true;
        self
    }
    pub fn count(mut self, count: u32) -> Self {
        self.count = count;
        self
    }
}

#[derive(Clone, Debug)]
pub struct DescriptorSetInfo {
    pub raw: vk::DescriptorSet,
    pub bindings: Vec<DescriptorBindingInfo>,
}

pub struct DescriptorBinding {
    info: DescriptorBindingInfo,
    slots: Vec<Option<DescriptorResource>>,
}

impl DescriptorBinding {
    pub fn info(&self) -> &DescriptorBindingInfo {
        &self.info
    }

    /// Every populated slot, in slot order.
    pub fn resources(&self) -> impl Iterator<Item = DescriptorResource> + '_ {
        self.slots.iter().flatten().copied()
    }

    /// The state a resource bound here must be in before a command at `bind_point` runs.
    /// `None` when no shader stage of that bind point can see the binding.
    pub fn required_state(&self, bind_point: vk::PipelineBindPoint) -> Option<BarrierState> {
        let stages = self.info.stages & bind_point_shader_stages(bind_point);
        let stage = shader_stages_to_pipeline_stages(stages);
        if stage.is_empty() {
            return None;
        }
        let mut access = descriptor_type_to_access_flags_read(self.info.ty);
        if self.info.writable {
            access |= descriptor_type_to_access_flags_write(self.info.ty);
        }
        Some(BarrierState::new(stage, access, descriptor_type_to_layout(self.info.ty)))
    }

    fn accepts(&self, resource: &DescriptorResource) -> bool {
        use vk::DescriptorType as T;
        match resource {
            DescriptorResource::Buffer(_) => matches!(
                self.info.ty,
                T::UNIFORM_BUFFER
                    | T::UNIFORM_BUFFER_DYNAMIC
                    | T::STORAGE_BUFFER
                    | T::STORAGE_BUFFER_DYNAMIC
                    | T::UNIFORM_TEXEL_BUFFER
                    | T::STORAGE_TEXEL_BUFFER
            ),
            DescriptorResource::ImageView(_) => matches!(
                self.info.ty,
                T::SAMPLED_IMAGE | T::COMBINED_IMAGE_SAMPLER | T::STORAGE_IMAGE | T::INPUT_ATTACHMENT
            ),
            DescriptorResource::AccelerationStructure(_) => {
                self.info.ty == T::ACCELERATION_STRUCTURE_KHR
            }
        }
    }
}

pub struct DescriptorSet {
    raw: vk::DescriptorSet,
    bindings: Vec<DescriptorBinding>,
}

impl DescriptorSet {
    pub(crate) fn new(info: DescriptorSetInfo) -> Self {
        let bindings = info
            .bindings
            .into_iter()
            .map(|info| DescriptorBinding {
                slots: vec![None; info.count as usize],
                info,
            })
            .collect();
        Self {
            raw: info.raw,
            bindings,
        }
    }
    pub fn raw(&self) -> vk::DescriptorSet {
        self.raw
    }
    pub fn bindings(&self) -> &[DescriptorBinding] {
        &self.bindings
    }
    pub fn binding(&self, binding: u32) -> Option<&DescriptorBinding> {
        self.bindings.iter().find(|b| b.info.binding == binding)
    }

    pub(crate) fn write(&mut self, binding: u32, slot: u32, resource: DescriptorResource) {
        let Some(target) = self.bindings.iter_mut().find(|b| b.info.binding == binding) else {
            debug_assert!(false, "descriptor set has no binding {}", binding);
            return;
        };
        debug_assert!(
            target.accepts(&resource),
            "{:?} cannot be bound to a {:?} descriptor",
            resource,
            target.info.ty
        );
        match target.slots.get_mut(slot as usize) {
            Some(entry) => *entry = Some(resource),
            None => debug_assert!(false, "slot {} out of range for binding {}", slot, binding),
        }
    }
}

fn bind_point_shader_stages(bind_point: vk::PipelineBindPoint) -> vk::ShaderStageFlags {
    match bind_point {
        vk::PipelineBindPoint::COMPUTE => vk::ShaderStageFlags::COMPUTE,
        vk::PipelineBindPoint::RAY_TRACING_KHR => {
            vk::ShaderStageFlags::RAYGEN_KHR
                | vk::ShaderStageFlags::ANY_HIT_KHR
                | vk::ShaderStageFlags::CLOSEST_HIT_KHR
                | vk::ShaderStageFlags::MISS_KHR
                | vk::ShaderStageFlags::INTERSECTION_KHR
                | vk::ShaderStageFlags::CALLABLE_KHR
        }
        _ => {
            vk::ShaderStageFlags::ALL_GRAPHICS
                | vk::ShaderStageFlags::TASK_NV
                | vk::ShaderStageFlags::MESH_NV
        }
    }
}

/// Maps every set bit of a shader stage mask onto its pipeline stage.
pub(crate) fn shader_stages_to_pipeline_stages(
    shader_stage_flags: vk::ShaderStageFlags,
) -> vk::PipelineStageFlags2 {
    use vk::PipelineStageFlags2 as P;
    use vk::ShaderStageFlags as S;
    const TABLE: [(S, P); 10] = [
        (S::VERTEX, P::VERTEX_SHADER),
        (S::TESSELLATION_CONTROL, P::TESSELLATION_CONTROL_SHADER),
        (S::TESSELLATION_EVALUATION, P::TESSELLATION_EVALUATION_SHADER),
        (S::GEOMETRY, P::GEOMETRY_SHADER),
        (S::FRAGMENT, P::FRAGMENT_SHADER),
        (S::COMPUTE, P::COMPUTE_SHADER),
        (S::TASK_NV, P::TASK_SHADER_NV),
        (S::MESH_NV, P::MESH_SHADER_NV),
        (
            S::from_raw(
                S::RAYGEN_KHR.as_raw()
                    | S::ANY_HIT_KHR.as_raw()
                    | S::CLOSEST_HIT_KHR.as_raw()
                    | S::MISS_KHR.as_raw()
                    | S::INTERSECTION_KHR.as_raw(),
            ),
            P::RAY_TRACING_SHADER_KHR,
        ),
        (S::CALLABLE_KHR, P::RAY_TRACING_SHADER_KHR),
    ];
    TABLE
        .iter()
        .filter(|(shader, _)| shader_stage_flags.intersects(*shader))
        .fold(P::empty(), |acc, (_, pipeline)| acc | *pipeline)
}

pub(crate) fn descriptor_type_to_access_flags_read(
    descriptor_type: vk::DescriptorType,
) -> vk::AccessFlags2 {
    match descriptor_type {
        vk::DescriptorType::ACCELERATION_STRUCTURE_KHR => {
            vk::AccessFlags2::ACCELERATION_STRUCTURE_READ_KHR
        }
        vk::DescriptorType::STORAGE_IMAGE
        | vk::DescriptorType::STORAGE_BUFFER
        | vk::DescriptorType::STORAGE_TEXEL_BUFFER
        | vk::DescriptorType::STORAGE_BUFFER_DYNAMIC => vk::AccessFlags2::SHADER_STORAGE_READ,
        vk::DescriptorType::UNIFORM_BUFFER
        | vk::DescriptorType::UNIFORM_BUFFER_DYNAMIC
        | vk::DescriptorType::UNIFORM_TEXEL_BUFFER => vk::AccessFlags2::UNIFORM_READ,
        vk::DescriptorType::SAMPLED_IMAGE | vk::DescriptorType::COMBINED_IMAGE_SAMPLER => {
            vk::AccessFlags2::SHADER_SAMPLED_READ
        }
        vk::DescriptorType::INPUT_ATTACHMENT => vk::AccessFlags2::INPUT_ATTACHMENT_READ,
        _ => vk::AccessFlags2::empty(),
    }
}

pub(crate) fn descriptor_type_to_access_flags_write(
    descriptor_type: vk::DescriptorType,
) -> vk::AccessFlags2 {
    match descriptor_type {
        vk::DescriptorType::STORAGE_IMAGE
        | vk::DescriptorType::STORAGE_BUFFER
        | vk::DescriptorType::STORAGE_TEXEL_BUFFER
        | vk::DescriptorType::STORAGE_BUFFER_DYNAMIC => vk::AccessFlags2::SHADER_STORAGE_WRITE,
        _ => vk::AccessFlags2::empty(),
    }
}

fn descriptor_type_to_layout(descriptor_type: vk::DescriptorType) -> vk::ImageLayout {
    match descriptor_type {
        vk::DescriptorType::SAMPLED_IMAGE
        | vk::DescriptorType::COMBINED_IMAGE_SAMPLER
        | vk::DescriptorType::INPUT_ATTACHMENT => vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
        vk::DescriptorType::STORAGE_IMAGE => vk::ImageLayout::GENERAL,
        _ => vk::ImageLayout::UNDEFINED,
    }
}
