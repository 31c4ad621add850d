//! Arena of every resource the barrier engine knows about, and the table of their
//! last-known synchronization states.
//!
//! Entries are keyed by generational handles. Destruction is requested from any thread
//! and carried out by [`ResourceRegistry::collect_garbage`] once no command buffer still
//! holds a ready-lock on the entry.

use ash::vk;
use crossbeam_queue::SegQueue;
use slotmap::{Key, SlotMap};
use std::any::Any;
use std::sync::atomic::{AtomicU32, Ordering};

pub mod buffer;
pub mod framebuffer;
pub mod image;
pub mod state;

pub use buffer::{Buffer, BufferInfo, HasBuffer};
pub use framebuffer::{
    AttachmentKind, Framebuffer, FramebufferAttachment, FramebufferInfo, LoadOp, StoreOp,
};
pub use image::{HasImage, Image, ImageInfo, ImageView, ImageViewInfo};
pub use state::{BarrierState, ImageRangeState, ImageStates, SubresourceRange};

use crate::accel_struct::{AccelerationStructure, AccelerationStructureInfo};
use crate::descriptor::{DescriptorResource, DescriptorSet, DescriptorSetInfo};

slotmap::new_key_type! {
    pub struct BufferHandle;
    pub struct ImageHandle;
    pub struct ImageViewHandle;
    pub struct AccelStructHandle;
    pub struct DescriptorSetHandle;
    pub struct FramebufferHandle;
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ResourceId {
    Buffer(BufferHandle),
    Image(ImageHandle),
    ImageView(ImageViewHandle),
    AccelStruct(AccelStructHandle),
    DescriptorSet(DescriptorSetHandle),
    Framebuffer(FramebufferHandle),
}

macro_rules! impl_resource_id_from {
    ($($handle:ident => $variant:ident),*) => {
        $(
            impl From<$handle> for ResourceId {
                fn from(handle: $handle) -> Self {
                    ResourceId::$variant(handle)
                }
            }
        )*
    };
}
impl_resource_id_from!(
    BufferHandle => Buffer,
    ImageHandle => Image,
    ImageViewHandle => ImageView,
    AccelStructHandle => AccelStruct,
    DescriptorSetHandle => DescriptorSet,
    FramebufferHandle => Framebuffer
);

struct Slot<T> {
    value: T,
    ready_lock: AtomicU32,
    retiring: bool,
    /// Dropped together with the entry.
    owner: Option<Box<dyn Any + Send + Sync>>,
}

struct Pool<K: Key, T> {
    slots: SlotMap<K, Slot<T>>,
}

impl<K: Key, T> Pool<K, T> {
    fn new() -> Self {
        Self {
            slots: SlotMap::with_key(),
        }
    }
    fn insert(&mut self, value: T) -> K {
        self.slots.insert(Slot {
            value,
            ready_lock: AtomicU32::new(0),
            retiring: false,
            owner: None,
        })
    }
    fn get(&self, key: K) -> Option<&T> {
        self.slots.get(key).map(|slot| &slot.value)
    }
    fn get_mut(&mut self, key: K) -> Option<&mut T> {
        self.slots.get_mut(key).map(|slot| &mut slot.value)
    }
    fn is_ready(&self, key: K) -> bool {
        self.slots.get(key).map_or(false, |slot| !slot.retiring)
    }
    fn lock(&self, key: K) {
        if let Some(slot) = self.slots.get(key) {
            slot.ready_lock.fetch_add(1, Ordering::AcqRel);
        }
    }
    fn unlock(&self, key: K) {
        if let Some(slot) = self.slots.get(key) {
            let previous = slot.ready_lock.fetch_sub(1, Ordering::AcqRel);
            debug_assert!(previous > 0, "unbalanced ready-lock release");
        }
    }
    fn ready_lock(&self, key: K) -> u32 {
        self.slots
            .get(key)
            .map_or(0, |slot| slot.ready_lock.load(Ordering::Acquire))
    }
    fn set_owner(&mut self, key: K, owner: Box<dyn Any + Send + Sync>) {
        if let Some(slot) = self.slots.get_mut(key) {
            slot.owner = Some(owner);
        }
    }
    fn retire(&mut self, key: K) {
        if let Some(slot) = self.slots.get_mut(key) {
            slot.retiring = true;
        }
    }
    /// Removes retired entries nobody holds a ready-lock on.
    fn sweep(&mut self) -> usize {
        let before = self.slots.len();
        self.slots
            .retain(|_, slot| !(slot.retiring && *slot.ready_lock.get_mut() == 0));
        before - self.slots.len()
    }
    fn len(&self) -> usize {
        self.slots.len()
    }
}

macro_rules! with_pool {
    ($registry:expr, $id:expr, |$pool:ident, $key:ident| $body:expr) => {
        match $id {
            ResourceId::Buffer($key) => {
                let $pool = &$registry.buffers;
                $body
            }
            ResourceId::Image($key) => {
                let $pool = &$registry.images;
                $body
            }
            ResourceId::ImageView($key) => {
                let $pool = &$registry.image_views;
                $body
            }
            ResourceId::AccelStruct($key) => {
                let $pool = &$registry.accel_structs;
                $body
            }
            ResourceId::DescriptorSet($key) => {
                let $pool = &$registry.descriptor_sets;
                $body
            }
            ResourceId::Framebuffer($key) => {
                let $pool = &$registry.framebuffers;
                $body
            }
        }
    };
}

macro_rules! with_pool_mut {
    ($registry:expr, $id:expr, |$pool:ident, $key:ident| $body:expr) => {
        match $id {
            ResourceId::Buffer($key) => {
                let $pool = &mut $registry.buffers;
                $body
            }
            ResourceId::Image($key) => {
                let $pool = &mut $registry.images;
                $body
            }
            ResourceId::ImageView($key) => {
                let $pool = &mut $registry.image_views;
                $body
            }
            ResourceId::AccelStruct($key) => {
                let $pool = &mut $registry.accel_structs;
                $body
            }
            ResourceId::DescriptorSet($key) => {
                let $pool = &mut $registry.descriptor_sets;
                $body
            }
            ResourceId::Framebuffer($key) => {
                let $pool = &mut $registry.framebuffers;
                $body
            }
        }
    };
}

pub struct ResourceRegistry {
    buffers: Pool<BufferHandle, Buffer>,
    images: Pool<ImageHandle, Image>,
    image_views: Pool<ImageViewHandle, ImageView>,
    accel_structs: Pool<AccelStructHandle, AccelerationStructure>,
    descriptor_sets: Pool<DescriptorSetHandle, DescriptorSet>,
    framebuffers: Pool<FramebufferHandle, Framebuffer>,
    destroy_requests: SegQueue<ResourceId>,
}

impl Default for ResourceRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl ResourceRegistry {
    pub fn new() -> Self {
        Self {
            buffers: Pool::new(),
            images: Pool::new(),
            image_views: Pool::new(),
            accel_structs: Pool::new(),
            descriptor_sets: Pool::new(),
            framebuffers: Pool::new(),
            destroy_requests: SegQueue::new(),
        }
    }

    pub fn create_buffer(&mut self, info: BufferInfo) -> BufferHandle {
        let handle = self.buffers.insert(Buffer::new(info));
        tracing::debug!(buffer = ?info.raw, ?handle, "register buffer");
        handle
    }

    /// Registers a buffer and keeps `owner` alive until the entry is removed.
    pub fn adopt_buffer<B: HasBuffer>(&mut self, owner: B, size: vk::DeviceSize) -> BufferHandle {
        let handle = self.create_buffer(BufferInfo {
            raw: owner.raw_buffer(),
            size,
        });
        self.buffers.set_owner(handle, Box::new(owner));
        handle
    }

    pub fn create_image(&mut self, info: ImageInfo) -> ImageHandle {
        let handle = self.images.insert(Image::new(info));
        tracing::debug!(image = ?info.raw, ?handle, "register image");
        handle
    }

    /// Registers an image and keeps `owner` alive until the entry is removed.
    /// `info.raw` is taken from the owner.
    pub fn adopt_image<I: HasImage>(&mut self, owner: I, mut info: ImageInfo) -> ImageHandle {
        info.raw = owner.raw_image();
        let handle = self.create_image(info);
        self.images.set_owner(handle, Box::new(owner));
        handle
    }

    pub fn create_image_view(&mut self, info: ImageViewInfo) -> ImageViewHandle {
        let image = self.images.get(info.image);
        debug_assert!(image.is_some(), "image view over an unknown image");
        let range = SubresourceRange {
            base_mip_level: info.base_mip_level,
            mip_level_count: info.mip_level_count,
            base_array_layer: info.base_array_layer,
            array_layer_count: info.array_layer_count,
        };
        let range = match image {
            Some(image) => range.resolve(image.mip_levels(), image.array_layers()),
            None => range,
        };
        self.image_views.insert(ImageView {
            raw: info.raw,
            image: info.image,
            ty: info.ty,
            format: info.format,
            range,
        })
    }

    pub fn create_acceleration_structure(
        &mut self,
        info: AccelerationStructureInfo,
    ) -> AccelStructHandle {
        let handle = self
            .accel_structs
            .insert(AccelerationStructure::new(info));
        tracing::debug!(accel_struct = ?info.raw, ?handle, "register acceleration structure");
        handle
    }

    pub fn create_descriptor_set(&mut self, info: DescriptorSetInfo) -> DescriptorSetHandle {
        self.descriptor_sets.insert(DescriptorSet::new(info))
    }

    pub fn create_framebuffer(&mut self, info: FramebufferInfo) -> FramebufferHandle {
        debug_assert!(
            info.attachments
                .iter()
                .all(|a| self.image_views.get(a.view).is_some()),
            "framebuffer attachment is not a known image view"
        );
        self.framebuffers.insert(Framebuffer { info })
    }

    /// Attaches a value that is dropped when the entry is finally removed.
    pub fn set_owner(&mut self, id: impl Into<ResourceId>, owner: Box<dyn Any + Send + Sync>) {
        with_pool_mut!(self, id.into(), |pool, key| pool.set_owner(key, owner))
    }

    pub fn buffer(&self, handle: BufferHandle) -> Option<&Buffer> {
        self.buffers.get(handle)
    }
    pub fn image(&self, handle: ImageHandle) -> Option<&Image> {
        self.images.get(handle)
    }
    pub fn image_view(&self, handle: ImageViewHandle) -> Option<&ImageView> {
        self.image_views.get(handle)
    }
    pub fn accel_struct(&self, handle: AccelStructHandle) -> Option<&AccelerationStructure> {
        self.accel_structs.get(handle)
    }
    pub(crate) fn accel_struct_mut(
        &mut self,
        handle: AccelStructHandle,
    ) -> Option<&mut AccelerationStructure> {
        self.accel_structs.get_mut(handle)
    }
    pub fn descriptor_set(&self, handle: DescriptorSetHandle) -> Option<&DescriptorSet> {
        self.descriptor_sets.get(handle)
    }
    pub fn framebuffer(&self, handle: FramebufferHandle) -> Option<&Framebuffer> {
        self.framebuffers.get(handle)
    }

    /// The entry exists and no destruction was requested for it.
    pub fn is_ready(&self, id: impl Into<ResourceId>) -> bool {
        with_pool!(self, id.into(), |pool, key| pool.is_ready(key))
    }

    pub fn lock(&self, id: impl Into<ResourceId>) {
        with_pool!(self, id.into(), |pool, key| pool.lock(key))
    }

    pub fn unlock(&self, id: impl Into<ResourceId>) {
        with_pool!(self, id.into(), |pool, key| pool.unlock(key))
    }

    pub fn ready_lock(&self, id: impl Into<ResourceId>) -> u32 {
        with_pool!(self, id.into(), |pool, key| pool.ready_lock(key))
    }

    /// Requests destruction. The entry stops being ready once the request is collected
    /// and is removed as soon as its ready-lock drops to zero.
    pub fn destroy(&self, id: impl Into<ResourceId>) {
        self.destroy_requests.push(id.into());
    }

    /// Applies queued destruction requests and removes every retired entry that no
    /// command buffer references anymore. Returns the number of removed entries.
    pub fn collect_garbage(&mut self) -> usize {
        while let Some(id) = self.destroy_requests.pop() {
            with_pool_mut!(self, id, |pool, key| pool.retire(key));
        }
        let removed = self.buffers.sweep()
            + self.images.sweep()
            + self.image_views.sweep()
            + self.accel_structs.sweep()
            + self.descriptor_sets.sweep()
            + self.framebuffers.sweep();
        if removed > 0 {
            tracing::debug!(removed, "collect garbage");
        }
        removed
    }

    pub fn len(&self) -> usize {
        self.buffers.len()
            + self.images.len()
            + self.image_views.len()
            + self.accel_structs.len()
            + self.descriptor_sets.len()
            + self.framebuffers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn buffer_state(&self, handle: BufferHandle) -> BarrierState {
        self.buffers
            .get(handle)
            .map(|buffer| buffer.state)
            .unwrap_or_default()
    }

    pub fn set_buffer_state(&mut self, handle: BufferHandle, state: BarrierState) {
        if let Some(buffer) = self.buffers.get_mut(handle) {
            buffer.state = state;
        }
    }

    pub fn image_state(&self, handle: ImageHandle, mip_level: u32, array_layer: u32) -> BarrierState {
        self.images
            .get(handle)
            .map(|image| image.states.get(mip_level, array_layer))
            .unwrap_or_default()
    }

    pub fn set_image_state(&mut self, handle: ImageHandle, range: &SubresourceRange, state: BarrierState) {
        if let Some(image) = self.images.get_mut(handle) {
            let range = range.resolve(image.mip_levels(), image.array_layers());
            image.states.set(&range, state);
        }
    }

    pub fn is_full_barrier(&self, handle: ImageHandle) -> bool {
        self.images
            .get(handle)
            .map_or(true, |image| image.states.is_full())
    }

    /// Reads the states of a view's range from the owning image's entry.
    pub fn view_state(&self, handle: ImageViewHandle) -> ImageRangeState {
        let Some(view) = self.image_views.get(handle) else {
            return ImageRangeState::Uniform(BarrierState::UNDEFINED);
        };
        let Some(image) = self.images.get(view.image) else {
            return ImageRangeState::Uniform(BarrierState::UNDEFINED);
        };
        if let Some(uniform) = image.states.uniform() {
            return ImageRangeState::Uniform(uniform);
        }
        ImageRangeState::from_states(
            view.range
                .iter()
                .map(|(mip, layer)| image.states.get(mip, layer))
                .collect(),
        )
    }

    pub fn set_view_state(&mut self, handle: ImageViewHandle, state: ImageRangeState) {
        let Some(view) = self.image_views.get(handle) else {
            return;
        };
        let (image, range) = (view.image, view.range);
        match state {
            ImageRangeState::Uniform(state) => self.set_image_state(image, &range, state),
            ImageRangeState::Mixed(states) => {
                debug_assert_eq!(states.len(), range.len());
                if let ImageRangeState::Uniform(state) = ImageRangeState::from_states(states.clone()) {
                    self.set_image_state(image, &range, state);
                    return;
                }
                for ((mip, layer), state) in range.iter().zip(states) {
                    self.set_image_state(image, &SubresourceRange::single(mip, layer), state);
                }
            }
        }
    }

    pub fn accel_state(&self, handle: AccelStructHandle) -> BarrierState {
        self.accel_structs
            .get(handle)
            .map(|accel| accel.state)
            .unwrap_or_default()
    }

    pub fn set_accel_state(&mut self, handle: AccelStructHandle, state: BarrierState) {
        if let Some(accel) = self.accel_structs.get_mut(handle) {
            accel.state = state;
        }
    }

    /// Points one slot of a descriptor binding at a resource. Bindless bindings have many
    /// slots and may be populated sparsely.
    pub fn write_descriptor(
        &mut self,
        set: DescriptorSetHandle,
        binding: u32,
        slot: u32,
        resource: impl Into<DescriptorResource>,
    ) {
        let resource = resource.into();
        debug_assert!(
            match resource {
                DescriptorResource::Buffer(h) => self.buffers.get(h).is_some(),
                DescriptorResource::ImageView(h) => self.image_views.get(h).is_some(),
                DescriptorResource::AccelerationStructure(h) => self.accel_structs.get(h).is_some(),
            },
            "descriptor write references an unknown resource"
        );
        if let Some(set) = self.descriptor_sets.get_mut(set) {
            set.write(binding, slot, resource);
        }
    }
}
