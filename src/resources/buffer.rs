use ash::vk;
use std::sync::Arc;

use super::state::BarrierState;

#[derive(Clone, Copy, Debug)]
pub struct BufferInfo {
    pub raw: vk::Buffer,
    pub size: vk::DeviceSize,
}

/// A buffer known to the resource table. Buffers are tracked as a whole.
pub struct Buffer {
    pub(crate) raw: vk::Buffer,
    pub(crate) size: vk::DeviceSize,
    pub(crate) state: BarrierState,
}

impl Buffer {
    pub(crate) fn new(info: BufferInfo) -> Self {
        Self {
            raw: info.raw,
            size: info.size,
            state: BarrierState::UNDEFINED,
        }
    }
    pub fn raw(&self) -> vk::Buffer {
        self.raw
    }
    pub fn size(&self) -> vk::DeviceSize {
        self.size
    }
    pub fn state(&self) -> BarrierState {
        self.state
    }
}

impl HasBuffer for Buffer {
    fn raw_buffer(&self) -> vk::Buffer {
        self.raw
    }
}

/// Anything that owns a native buffer. Registering one through
/// [`ResourceRegistry::adopt_buffer`](super::ResourceRegistry::adopt_buffer) keeps it alive
/// until the table entry is finally removed.
pub trait HasBuffer: Send + Sync + 'static {
    fn raw_buffer(&self) -> vk::Buffer;
}

impl HasBuffer for vk::Buffer {
    fn raw_buffer(&self) -> vk::Buffer {
        *self
    }
}

impl<T: HasBuffer> HasBuffer for Arc<T> {
    fn raw_buffer(&self) -> vk::Buffer {
        let r: &T = self.as_ref();
        r.raw_buffer()
    }
}
