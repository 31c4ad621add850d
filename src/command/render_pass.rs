use ash::vk;
use smallvec::SmallVec;

use super::barrier::Requirements;
use crate::resources::{
    BarrierState, FramebufferAttachment, FramebufferHandle, ImageRangeState, ResourceRegistry,
    StoreOp,
};

/// `Idle -> Active { subpass: 0 } -> Active { subpass: n } -> Idle`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum RenderPassState {
    #[default]
    Idle,
    Active {
        framebuffer: FramebufferHandle,
        subpass: u32,
        subpass_count: u32,
    },
}

impl RenderPassState {
    pub fn is_active(&self) -> bool {
        matches!(self, RenderPassState::Active { .. })
    }

    pub fn framebuffer(&self) -> Option<FramebufferHandle> {
        match *self {
            RenderPassState::Active { framebuffer, .. } => Some(framebuffer),
            RenderPassState::Idle => None,
        }
    }

    pub fn begin(&mut self, framebuffer: FramebufferHandle, subpass_count: u32) {
        debug_assert!(!self.is_active(), "render pass begun inside a render pass");
        *self = RenderPassState::Active {
            framebuffer,
            subpass: 0,
            subpass_count: subpass_count.max(1),
        };
    }

    pub fn next_subpass(&mut self) {
        match self {
            RenderPassState::Active {
                subpass,
                subpass_count,
                ..
            } => {
                debug_assert!(*subpass + 1 < *subpass_count, "no subpass left to advance to");
                *subpass += 1;
            }
            RenderPassState::Idle => debug_assert!(false, "next subpass outside a render pass"),
        }
    }

    pub fn end(&mut self) -> Option<FramebufferHandle> {
        let framebuffer = self.framebuffer();
        debug_assert!(framebuffer.is_some(), "render pass ended while idle");
        *self = RenderPassState::Idle;
        framebuffer
    }
}

fn attachments(
    registry: &ResourceRegistry,
    framebuffer: FramebufferHandle,
) -> (SmallVec<[FramebufferAttachment; 8]>, u32) {
    match registry.framebuffer(framebuffer) {
        Some(fb) => (fb.attachments().iter().copied().collect(), fb.subpass_count()),
        None => {
            debug_assert!(false, "unknown framebuffer {:?}", framebuffer);
            (SmallVec::new(), 1)
        }
    }
}

/// Attachment-optimal states every attachment must reach before the pass begins.
pub(crate) fn begin_requirements(
    registry: &ResourceRegistry,
    framebuffer: FramebufferHandle,
    requirements: &mut Requirements,
) {
    let (attachments, _) = attachments(registry, framebuffer);
    for attachment in attachments {
        requirements.image_view(
            registry,
            attachment.view,
            attachment.attachment_state(),
            attachment.discards_contents(),
        );
    }
}

/// Called right after the native begin. Attachments of a multi-subpass pass hold the
/// general placeholder until the pass ends.
pub(crate) fn enter(registry: &mut ResourceRegistry, framebuffer: FramebufferHandle) {
    let (attachments, subpass_count) = attachments(registry, framebuffer);
    if subpass_count <= 1 {
        return;
    }
    for attachment in attachments {
        registry.set_view_state(attachment.view, ImageRangeState::Uniform(BarrierState::GENERAL));
    }
}

/// Called right after the native end: attachments are left in their final states.
pub(crate) fn leave(registry: &mut ResourceRegistry, framebuffer: FramebufferHandle) {
    let (attachments, _) = attachments(registry, framebuffer);
    for attachment in attachments {
        let mut state = attachment.final_state();
        if attachment.store == StoreOp::DontCare {
            // Contents are undefined now, the next transition starts from scratch.
            state.layout = vk::ImageLayout::UNDEFINED;
        }
        registry.set_view_state(attachment.view, ImageRangeState::Uniform(state));
    }
}
