use ash::vk;

use super::state::BarrierState;
use super::ImageViewHandle;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AttachmentKind {
    Color,
    DepthStencil,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LoadOp {
    Load,
    Clear,
    DontCare,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StoreOp {
    Store,
    DontCare,
}

/// One attachment of a framebuffer, with the load/store policy the native render pass
/// was created with. The native render pass is expected to use the attachment-optimal
/// layout as its initial layout and `final_layout` (or the attachment-optimal layout
/// when unset) as its final layout. An attachment that is not stored is tracked as
/// `UNDEFINED` after the render pass, so its next transition discards.
#[derive(Clone, Copy, Debug)]
pub struct FramebufferAttachment {
    pub view: ImageViewHandle,
    pub kind: AttachmentKind,
    pub load: LoadOp,
    pub store: StoreOp,
    pub final_layout: Option<vk::ImageLayout>,
}

impl FramebufferAttachment {
    pub fn color(view: ImageViewHandle) -> Self {
        Self {
            view,
            kind: AttachmentKind::Color,
            load: LoadOp::Load,
            store: StoreOp::Store,
            final_layout: None,
        }
    }
    pub fn depth_stencil(view: ImageViewHandle) -> Self {
        Self {
            view,
            kind: AttachmentKind::DepthStencil,
            load: LoadOp::Load,
            store: StoreOp::Store,
            final_layout: None,
        }
    }
    pub fn load(mut self, load: LoadOp) -> Self {
        self.load = load;
        self
    }
    pub fn store(mut self, store: StoreOp) -> Self {
        self.store = store;
        self
    }
    pub fn final_layout(mut self, layout: vk::ImageLayout) -> Self {
        self.final_layout = Some(layout);
        self
    }

    /// The state the attachment must be in when the render pass begins.
    pub fn attachment_state(&self) -> BarrierState {
        match self.kind {
            AttachmentKind::Color => BarrierState::COLOR_ATTACHMENT,
            AttachmentKind::DepthStencil => BarrierState::DEPTH_STENCIL_ATTACHMENT,
        }
    }

    /// The state the attachment is left in once the render pass ends.
    pub fn final_state(&self) -> BarrierState {
        let mut state = self.attachment_state();
        if let Some(layout) = self.final_layout {
            state.layout = layout;
        }
        state
    }

    /// Previous contents do not need to survive the layout transition.
    pub fn discards_contents(&self) -> bool {
        self.load != LoadOp::Load
    }
}

#[derive(Clone, Debug)]
pub struct FramebufferInfo {
    pub raw: vk::Framebuffer,
    pub render_pass: vk::RenderPass,
    pub extent: vk::Extent2D,
    pub subpass_count: u32,
    pub attachments: Vec<FramebufferAttachment>,
}

pub struct Framebuffer {
    pub(crate) info: FramebufferInfo,
}

impl Framebuffer {
    pub fn raw(&self) -> vk::Framebuffer {
        self.info.raw
    }
    pub fn render_pass(&self) -> vk::RenderPass {
        self.info.render_pass
    }
    pub fn extent(&self) -> vk::Extent2D {
        self.info.extent
    }
    pub fn subpass_count(&self) -> u32 {
        self.info.subpass_count.max(1)
    }
    pub fn attachments(&self) -> &[FramebufferAttachment] {
        &self.info.attachments
    }
    pub fn full_area(&self) -> vk::Rect2D {
        vk::Rect2D {
            offset: vk::Offset2D { x: 0, y: 0 },
            extent: self.info.extent,
        }
    }
}
