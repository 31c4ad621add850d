//! Walks a recorded stream, inserts the barriers each command needs and forwards the
//! resolved native calls to an encoder.

use ash::{prelude::VkResult, vk};

use super::barrier::{BarrierBatch, Requirement, Requirements, Target};
use super::encoder::{Encoder, RenderPassBegin};
use super::render_pass::{self, RenderPassState};
use super::stream::{Command, CommandStream};
use crate::accel_struct::batch::{self, BuildBatch};
use crate::resources::{
    BarrierState, BufferHandle, DescriptorSetHandle, ImageHandle, ResourceRegistry,
    SubresourceRange,
};
use crate::ContextOptions;

/// Descriptor sets, vertex buffers and index buffer currently bound, as seen by replay.
#[derive(Default)]
struct BoundResources {
    graphics: Vec<Option<DescriptorSetHandle>>,
    compute: Vec<Option<DescriptorSetHandle>>,
    ray_tracing: Vec<Option<DescriptorSetHandle>>,
    vertex_buffers: Vec<Option<BufferHandle>>,
    index_buffer: Option<BufferHandle>,
}

impl BoundResources {
    fn sets_mut(&mut self, bind_point: vk::PipelineBindPoint) -> &mut Vec<Option<DescriptorSetHandle>> {
        match bind_point {
            vk::PipelineBindPoint::COMPUTE => &mut self.compute,
            vk::PipelineBindPoint::RAY_TRACING_KHR => &mut self.ray_tracing,
            _ => &mut self.graphics,
        }
    }
    fn sets(&self, bind_point: vk::PipelineBindPoint) -> impl Iterator<Item = DescriptorSetHandle> + '_ {
        let sets = match bind_point {
            vk::PipelineBindPoint::COMPUTE => &self.compute,
            vk::PipelineBindPoint::RAY_TRACING_KHR => &self.ray_tracing,
            _ => &self.graphics,
        };
        sets.iter().flatten().copied()
    }
    fn bind_sets(
        &mut self,
        bind_point: vk::PipelineBindPoint,
        first_set: u32,
        sets: &[DescriptorSetHandle],
    ) {
        let slots = self.sets_mut(bind_point);
        let end = first_set as usize + sets.len();
        if slots.len() < end {
            slots.resize(end, None);
        }
        for (slot, set) in slots[first_set as usize..end].iter_mut().zip(sets) {
            *slot = Some(*set);
        }
    }
    fn bind_vertex_buffers(&mut self, first_binding: u32, buffers: &[(BufferHandle, vk::DeviceSize)]) {
        let end = first_binding as usize + buffers.len();
        if self.vertex_buffers.len() < end {
            self.vertex_buffers.resize(end, None);
        }
        for (slot, (buffer, _)) in self.vertex_buffers[first_binding as usize..end]
            .iter_mut()
            .zip(buffers)
        {
            *slot = Some(*buffer);
        }
    }
}

/// Requirements of the descriptor sets bound since the previous major command, for a
/// dispatch or trace-rays at `position`, in the order the sets were bound.
pub(crate) fn discover_dispatch_requirements(
    registry: &ResourceRegistry,
    stream: &CommandStream,
    position: usize,
    bind_point: vk::PipelineBindPoint,
) -> Requirements {
    let mut bound: Vec<DescriptorSetHandle> = Vec::new();
    for (_, command) in stream.lookbehind(position) {
        if let Command::BindDescriptorSets {
            bind_point: bp,
            sets,
            ..
        } = command
        {
            if *bp == bind_point {
                // Walking backwards: prepend so the result stays in bind order.
                bound.splice(0..0, sets.iter().copied());
            }
        }
    }
    let mut requirements = Requirements::new();
    for set in bound {
        requirements.descriptor_set(registry, set, bind_point);
    }
    requirements
}

fn graphics_binding_requirements(
    registry: &ResourceRegistry,
    command: &Command,
    requirements: &mut Requirements,
) {
    match command {
        Command::BindDescriptorSets {
            bind_point: vk::PipelineBindPoint::GRAPHICS,
            sets,
            ..
        } => {
            for set in sets {
                requirements.descriptor_set(registry, *set, vk::PipelineBindPoint::GRAPHICS);
            }
        }
        Command::BindVertexBuffers { buffers, .. } => {
            for (buffer, _) in buffers {
                requirements.buffer(*buffer, BarrierState::VERTEX_BUFFER);
            }
        }
        Command::BindIndexBuffer { buffer, .. } => {
            requirements.buffer(*buffer, BarrierState::INDEX_BUFFER);
        }
        Command::DrawIndirect { buffer, .. } | Command::DrawIndexedIndirect { buffer, .. } => {
            requirements.buffer(*buffer, BarrierState::INDIRECT_BUFFER);
        }
        Command::Execute(secondaries) => {
            for secondary in secondaries {
                for command in secondary {
                    graphics_binding_requirements(registry, command, requirements);
                }
            }
        }
        _ => {}
    }
}

/// Everything a render pass begun at `position` touches: its attachments, the graphics
/// bindings made since the previous major command, and every binding, indirect buffer
/// and spliced secondary up to the matching end.
pub(crate) fn discover_render_pass_requirements(
    registry: &ResourceRegistry,
    stream: &CommandStream,
    position: usize,
) -> Requirements {
    let mut requirements = Requirements::new();
    if let Some(Command::BeginRenderPass { framebuffer, .. }) = stream.get(position) {
        render_pass::begin_requirements(registry, *framebuffer, &mut requirements);
    }
    let behind: Vec<&Command> = stream.lookbehind(position).map(|(_, c)| c).collect();
    for command in behind.into_iter().rev() {
        graphics_binding_requirements(registry, command, &mut requirements);
    }
    let end = stream.matching_end(position).unwrap_or(stream.len());
    for command in stream.iter().take(end).skip(position + 1) {
        graphics_binding_requirements(registry, command, &mut requirements);
    }
    requirements
}

pub(crate) struct Replay<'a> {
    registry: &'a mut ResourceRegistry,
    encoder: &'a mut dyn Encoder,
    options: ContextOptions,
    barriers: BarrierBatch,
    builds: BuildBatch,
    render_pass: RenderPassState,
    bound: BoundResources,
}

impl<'a> Replay<'a> {
    pub fn new(
        registry: &'a mut ResourceRegistry,
        encoder: &'a mut dyn Encoder,
        options: ContextOptions,
    ) -> Self {
        Self {
            registry,
            encoder,
            options,
            barriers: BarrierBatch::new(),
            builds: BuildBatch::new(),
            render_pass: RenderPassState::Idle,
            bound: BoundResources::default(),
        }
    }

    pub fn run(&mut self, stream: &CommandStream) -> VkResult<()> {
        for (position, command) in stream.iter().enumerate() {
            if !matches!(command, Command::BuildAccelerationStructure(_)) {
                self.flush_builds()?;
            }
            self.command(stream, position, command)?;
        }
        self.flush_builds()?;
        debug_assert!(self.barriers.is_empty());
        Ok(())
    }

    fn flush_builds(&mut self) -> VkResult<()> {
        if self.builds.is_empty() {
            return Ok(());
        }
        self.builds.flush(
            self.registry,
            &mut self.barriers,
            self.encoder,
            self.options.synchronization2,
        )
    }

    fn barrier(&mut self, requirements: &Requirements) {
        self.barriers.apply_all(self.registry, requirements);
        self.barriers
            .flush(self.encoder, self.options.synchronization2);
    }

    fn buffer_raw(&self, handle: BufferHandle) -> vk::Buffer {
        let raw = self.registry.buffer(handle).map(|b| b.raw());
        debug_assert!(raw.is_some(), "unknown buffer {:?}", handle);
        raw.unwrap_or_default()
    }

    fn image_raw(&self, handle: ImageHandle) -> (vk::Image, vk::ImageAspectFlags) {
        let image = self.registry.image(handle).map(|i| (i.raw(), i.aspect()));
        debug_assert!(image.is_some(), "unknown image {:?}", handle);
        image.unwrap_or_default()
    }

    /// Layout the table holds for the first subresource of `range`.
    fn layout_of(&self, image: ImageHandle, range: &SubresourceRange) -> vk::ImageLayout {
        self.registry
            .image_state(image, range.base_mip_level, range.base_array_layer)
            .layout
    }

    fn dispatch_requirements(
        &self,
        stream: &CommandStream,
        position: usize,
        bind_point: vk::PipelineBindPoint,
    ) -> Requirements {
        let mut requirements =
            discover_dispatch_requirements(self.registry, stream, position, bind_point);
        // Sets bound before the previous major command are still in effect.
        for set in self.bound.sets(bind_point) {
            requirements.descriptor_set(self.registry, set, bind_point);
        }
        requirements
    }

    fn render_pass_requirements(&self, stream: &CommandStream, position: usize) -> Requirements {
        let mut requirements = discover_render_pass_requirements(self.registry, stream, position);
        for set in self.bound.sets(vk::PipelineBindPoint::GRAPHICS) {
            requirements.descriptor_set(self.registry, set, vk::PipelineBindPoint::GRAPHICS);
        }
        for buffer in self.bound.vertex_buffers.iter().flatten() {
            requirements.buffer(*buffer, BarrierState::VERTEX_BUFFER);
        }
        if let Some(buffer) = self.bound.index_buffer {
            requirements.buffer(buffer, BarrierState::INDEX_BUFFER);
        }
        requirements
    }

    fn command(&mut self, stream: &CommandStream, position: usize, command: &Command) -> VkResult<()> {
        match command {
            Command::Draw {
                vertex_count,
                instance_count,
                first_vertex,
                first_instance,
            } => {
                debug_assert!(self.render_pass.is_active());
                self.encoder
                    .draw(*vertex_count, *instance_count, *first_vertex, *first_instance);
            }
            Command::DrawIndexed {
                index_count,
                instance_count,
                first_index,
                vertex_offset,
                first_instance,
            } => {
                debug_assert!(self.render_pass.is_active());
                self.encoder.draw_indexed(
                    *index_count,
                    *instance_count,
                    *first_index,
                    *vertex_offset,
                    *first_instance,
                );
            }
            Command::DrawIndirect {
                buffer,
                offset,
                draw_count,
                stride,
            } => {
                let raw = self.buffer_raw(*buffer);
                self.encoder.draw_indirect(raw, *offset, *draw_count, *stride);
            }
            Command::DrawIndexedIndirect {
                buffer,
                offset,
                draw_count,
                stride,
            } => {
                let raw = self.buffer_raw(*buffer);
                self.encoder
                    .draw_indexed_indirect(raw, *offset, *draw_count, *stride);
            }
            Command::Dispatch { x, y, z } => {
                let requirements =
                    self.dispatch_requirements(stream, position, vk::PipelineBindPoint::COMPUTE);
                self.barrier(&requirements);
                self.encoder.dispatch(*x, *y, *z);
            }
            Command::DispatchIndirect { buffer, offset } => {
                let mut requirements =
                    self.dispatch_requirements(stream, position, vk::PipelineBindPoint::COMPUTE);
                requirements.buffer(*buffer, BarrierState::INDIRECT_BUFFER);
                self.barrier(&requirements);
                let raw = self.buffer_raw(*buffer);
                self.encoder.dispatch_indirect(raw, *offset);
            }
            Command::TraceRays {
                regions,
                width,
                height,
                depth,
            } => {
                let requirements = self.dispatch_requirements(
                    stream,
                    position,
                    vk::PipelineBindPoint::RAY_TRACING_KHR,
                );
                self.barrier(&requirements);
                self.encoder.trace_rays(regions, *width, *height, *depth);
            }
            Command::CopyBuffer { src, dst, regions } => {
                let mut requirements = Requirements::new();
                requirements.buffer(*src, BarrierState::TRANSFER_READ);
                requirements.buffer(*dst, BarrierState::TRANSFER_WRITE);
                self.barrier(&requirements);
                let (src, dst) = (self.buffer_raw(*src), self.buffer_raw(*dst));
                self.encoder.copy_buffer(src, dst, regions);
            }
            Command::CopyImage { src, dst, regions } => {
                let mut requirements = Requirements::new();
                for region in regions {
                    requirements.image(*src, region.src_subresource.into(), BarrierState::TRANSFER_SRC);
                    requirements.image(*dst, region.dst_subresource.into(), BarrierState::TRANSFER_DST);
                }
                self.barrier(&requirements);
                let Some(region) = regions.first() else {
                    return Ok(());
                };
                let src_layout = self.layout_of(*src, &region.src_subresource.into());
                let dst_layout = self.layout_of(*dst, &region.dst_subresource.into());
                let ((src, _), (dst, _)) = (self.image_raw(*src), self.image_raw(*dst));
                self.encoder
                    .copy_image(src, src_layout, dst, dst_layout, regions);
            }
            Command::CopyBufferToImage { src, dst, regions } => {
                let mut requirements = Requirements::new();
                requirements.buffer(*src, BarrierState::TRANSFER_READ);
                for region in regions {
                    requirements.image(*dst, region.image_subresource.into(), BarrierState::TRANSFER_DST);
                }
                self.barrier(&requirements);
                let Some(region) = regions.first() else {
                    return Ok(());
                };
                let dst_layout = self.layout_of(*dst, &region.image_subresource.into());
                let (src, (dst, _)) = (self.buffer_raw(*src), self.image_raw(*dst));
                self.encoder
                    .copy_buffer_to_image(src, dst, dst_layout, regions);
            }
            Command::CopyImageToBuffer { src, dst, regions } => {
                let mut requirements = Requirements::new();
                for region in regions {
                    requirements.image(*src, region.image_subresource.into(), BarrierState::TRANSFER_SRC);
                }
                requirements.buffer(*dst, BarrierState::TRANSFER_WRITE);
                self.barrier(&requirements);
                let Some(region) = regions.first() else {
                    return Ok(());
                };
                let src_layout = self.layout_of(*src, &region.image_subresource.into());
                let ((src, _), dst) = (self.image_raw(*src), self.buffer_raw(*dst));
                self.encoder
                    .copy_image_to_buffer(src, src_layout, dst, regions);
            }
            Command::BlitImage {
                src,
                dst,
                regions,
                filter,
            } => {
                let mut requirements = Requirements::new();
                for region in regions {
                    requirements.image(*src, region.src_subresource.into(), BarrierState::TRANSFER_SRC);
                    requirements.image(*dst, region.dst_subresource.into(), BarrierState::TRANSFER_DST);
                }
                self.barrier(&requirements);
                let Some(region) = regions.first() else {
                    return Ok(());
                };
                let src_layout = self.layout_of(*src, &region.src_subresource.into());
                let dst_layout = self.layout_of(*dst, &region.dst_subresource.into());
                let ((src, _), (dst, _)) = (self.image_raw(*src), self.image_raw(*dst));
                self.encoder
                    .blit_image(src, src_layout, dst, dst_layout, regions, *filter);
            }
            Command::ClearColorImage {
                image,
                color,
                ranges,
            } => {
                let vk_ranges = self.clear_image(*image, ranges);
                let layout = ranges
                    .first()
                    .map_or(vk::ImageLayout::TRANSFER_DST_OPTIMAL, |r| self.layout_of(*image, r));
                let (raw, _) = self.image_raw(*image);
                self.encoder.clear_color_image(raw, layout, color, &vk_ranges);
            }
            Command::ClearDepthStencilImage {
                image,
                value,
                ranges,
            } => {
                let vk_ranges = self.clear_image(*image, ranges);
                let layout = ranges
                    .first()
                    .map_or(vk::ImageLayout::TRANSFER_DST_OPTIMAL, |r| self.layout_of(*image, r));
                let (raw, _) = self.image_raw(*image);
                self.encoder
                    .clear_depth_stencil_image(raw, layout, value, &vk_ranges);
            }
            Command::FillBuffer {
                buffer,
                offset,
                size,
                data,
            } => {
                let mut requirements = Requirements::new();
                requirements.buffer(*buffer, BarrierState::TRANSFER_WRITE);
                self.barrier(&requirements);
                let raw = self.buffer_raw(*buffer);
                self.encoder.fill_buffer(raw, *offset, *size, *data);
            }
            Command::ClearAttachments { attachments, rects } => {
                debug_assert!(self.render_pass.is_active());
                self.encoder.clear_attachments(attachments, rects);
            }
            Command::BeginRenderPass {
                framebuffer,
                area,
                clear_values,
                contents,
            } => {
                let requirements = self.render_pass_requirements(stream, position);
                self.barrier(&requirements);
                let Some(fb) = self.registry.framebuffer(*framebuffer) else {
                    debug_assert!(false, "unknown framebuffer {:?}", framebuffer);
                    return Ok(());
                };
                let subpass_count = fb.subpass_count();
                self.encoder.begin_render_pass(&RenderPassBegin {
                    render_pass: fb.render_pass(),
                    framebuffer: fb.raw(),
                    area: *area,
                    clear_values,
                    contents: *contents,
                });
                self.render_pass.begin(*framebuffer, subpass_count);
                render_pass::enter(self.registry, *framebuffer);
            }
            Command::NextSubpass { contents } => {
                self.render_pass.next_subpass();
                self.encoder.next_subpass(*contents);
            }
            Command::EndRenderPass => {
                self.encoder.end_render_pass();
                if let Some(framebuffer) = self.render_pass.end() {
                    render_pass::leave(self.registry, framebuffer);
                }
            }
            Command::BindPipeline {
                bind_point,
                pipeline,
            } => self.encoder.bind_pipeline(*bind_point, *pipeline),
            Command::BindDescriptorSets {
                bind_point,
                layout,
                first_set,
                sets,
                dynamic_offsets,
            } => {
                self.bound.bind_sets(*bind_point, *first_set, sets);
                let raws: Vec<vk::DescriptorSet> = sets
                    .iter()
                    .map(|set| self.registry.descriptor_set(*set).map(|s| s.raw()).unwrap_or_default())
                    .collect();
                self.encoder.bind_descriptor_sets(
                    *bind_point,
                    *layout,
                    *first_set,
                    &raws,
                    dynamic_offsets,
                );
            }
            Command::PushConstants {
                layout,
                stages,
                offset,
                data,
            } => self.encoder.push_constants(*layout, *stages, *offset, data),
            Command::SetViewport { first, viewports } => self.encoder.set_viewport(*first, viewports),
            Command::SetScissor { first, scissors } => self.encoder.set_scissor(*first, scissors),
            Command::BindVertexBuffers {
                first_binding,
                buffers,
            } => {
                self.bound.bind_vertex_buffers(*first_binding, buffers);
                let raws: Vec<vk::Buffer> = buffers.iter().map(|(b, _)| self.buffer_raw(*b)).collect();
                let offsets: Vec<vk::DeviceSize> = buffers.iter().map(|(_, o)| *o).collect();
                self.encoder
                    .bind_vertex_buffers(*first_binding, &raws, &offsets);
            }
            Command::BindIndexBuffer {
                buffer,
                offset,
                index_type,
            } => {
                self.bound.index_buffer = Some(*buffer);
                let raw = self.buffer_raw(*buffer);
                self.encoder.bind_index_buffer(raw, *offset, *index_type);
            }
            Command::BuildAccelerationStructure(build) => {
                if let Err(build) = self.builds.push(self.registry, (**build).clone()) {
                    self.flush_builds()?;
                    let pushed = self.builds.push(self.registry, build);
                    debug_assert!(pushed.is_ok());
                }
            }
            Command::CopyAccelerationStructure { src, dst, mode } => batch::copy(
                self.registry,
                &mut self.barriers,
                self.encoder,
                self.options.synchronization2,
                *src,
                *dst,
                *mode,
            ),
            Command::BufferBarrier(barrier) => {
                self.barriers.apply_explicit(self.registry, barrier);
                self.barriers
                    .flush(self.encoder, self.options.synchronization2);
            }
            Command::Execute(secondaries) => {
                for secondary in secondaries {
                    self.run(secondary)?;
                }
            }
            Command::BeginLabel { name, color } => {
                if self.options.debug_labels {
                    self.encoder.begin_label(name, *color);
                }
            }
            Command::EndLabel => {
                if self.options.debug_labels {
                    self.encoder.end_label();
                }
            }
            Command::InsertLabel { name, color } => {
                if self.options.debug_labels {
                    self.encoder.insert_label(name, *color);
                }
            }
            Command::PrepareForPresent { image } => {
                let Some(range) = self.registry.image(*image).map(|i| i.full_range()) else {
                    debug_assert!(false, "unknown image {:?}", image);
                    return Ok(());
                };
                let mut requirements = Requirements::new();
                requirements.image(*image, range, BarrierState::PRESENT);
                self.barrier(&requirements);
            }
            Command::Custom { name, f } => {
                tracing::trace!(name, "custom command");
                f(&mut *self.encoder);
            }
        }
        Ok(())
    }

    /// Moves the cleared ranges into the transfer destination layout, discarding their
    /// contents, and returns them in native form.
    fn clear_image(
        &mut self,
        image: ImageHandle,
        ranges: &[SubresourceRange],
    ) -> Vec<vk::ImageSubresourceRange> {
        let mut requirements = Requirements::new();
        for range in ranges {
            requirements.push(Requirement {
                target: Target::Image {
                    image,
                    range: *range,
                },
                state: BarrierState::TRANSFER_DST,
                discard: true,
            });
        }
        self.barrier(&requirements);
        let (_, aspect) = self.image_raw(image);
        ranges.iter().map(|r| r.to_vk(aspect)).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::accel_struct::{
        AccelerationStructureInfo, BufferAddress, BuildDescription, BuildGeometry, Level,
    };
    use crate::command::testing::{init_tracing, Call, RecordingEncoder};
    use crate::command::{BufferBarrierCommand, CommandBuffer, SubmitStatus};
    use crate::descriptor::{DescriptorBindingInfo, DescriptorSetInfo};
    use crate::resources::{
        AccelStructHandle, BufferInfo, FramebufferAttachment, FramebufferHandle, FramebufferInfo, ImageInfo,
        ImageViewInfo, LoadOp,
    };
    use crate::Context;
    use ash::vk::Handle;
    use std::sync::atomic::Ordering;

    const COMPUTE: vk::PipelineBindPoint = vk::PipelineBindPoint::COMPUTE;
    const GRAPHICS: vk::PipelineBindPoint = vk::PipelineBindPoint::GRAPHICS;

    fn buffer(ctx: &mut Context, raw: u64) -> BufferHandle {
        ctx.resources_mut().create_buffer(BufferInfo {
            raw: vk::Buffer::from_raw(raw),
            size: 1024,
        })
    }

    fn storage_set(ctx: &mut Context, raw: u64, buffer: BufferHandle, writable: bool) -> DescriptorSetHandle {
        let mut binding = DescriptorBindingInfo::new(
            0,
            vk::DescriptorType::STORAGE_BUFFER,
            vk::ShaderStageFlags::COMPUTE,
        );
        if writable {
            binding = binding.writable();
        }
        let set = ctx.resources_mut().create_descriptor_set(DescriptorSetInfo {
            raw: vk::DescriptorSet::from_raw(raw),
            bindings: vec![binding],
        });
        ctx.resources_mut().write_descriptor(set, 0, 0, buffer);
        set
    }

    /// A single-attachment framebuffer left in `final_layout` after the pass.
    fn color_target(ctx: &mut Context, raw: u64, final_layout: vk::ImageLayout) -> (FramebufferHandle, ImageHandle) {
        let format = vk::Format::B8G8R8A8_UNORM;
        let image = ctx
            .resources_mut()
            .create_image(ImageInfo::new_2d(vk::Image::from_raw(raw), format, 16, 16));
        let view = ctx
            .resources_mut()
            .create_image_view(ImageViewInfo::whole(vk::ImageView::from_raw(raw + 1), image, format));
        let framebuffer = ctx.resources_mut().create_framebuffer(FramebufferInfo {
            raw: vk::Framebuffer::from_raw(raw + 2),
            render_pass: vk::RenderPass::from_raw(raw + 3),
            extent: vk::Extent2D {
                width: 16,
                height: 16,
            },
            subpass_count: 1,
            attachments: vec![FramebufferAttachment::color(view)
                .load(LoadOp::Clear)
                .final_layout(final_layout)],
        });
        (framebuffer, image)
    }

    fn submit(ctx: &mut Context, cb: &mut CommandBuffer<RecordingEncoder>) {
        cb.native().fence().store(true, Ordering::Release);
        assert_eq!(cb.submit(ctx), Ok(SubmitStatus::Submitted));
    }

    #[test]
    fn repeated_draws_share_one_vertex_barrier() {
        init_tracing();
        let mut ctx = Context::default();
        let vertices = buffer(&mut ctx, 10);
        let (framebuffer, _) = color_target(&mut ctx, 20, vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL);
        let mut cb = CommandBuffer::new(RecordingEncoder::new());

        for frame in 0..2 {
            {
                let mut recorder = cb.record(&ctx);
                let mut pass = recorder.begin_render_pass(framebuffer, &[vk::ClearValue::default()], None);
                pass.bind_vertex_buffers(0, &[(vertices, 0)]);
                for _ in 0..3 {
                    pass.draw(3, 1, 0, 0);
                }
            }
            submit(&mut ctx, &mut cb);
            let vertex_barriers = cb
                .native()
                .buffer_barriers()
                .into_iter()
                .filter(|(raw, _, dst)| {
                    *raw == vk::Buffer::from_raw(10)
                        && dst.contains(vk::AccessFlags2::VERTEX_ATTRIBUTE_READ)
                })
                .count();
            let expected = if frame == 0 { 1 } else { 0 };
            assert_eq!(vertex_barriers, expected, "frame {frame}");
            cb.native_mut().take_calls();
        }
    }

    #[test]
    fn dispatch_sees_sets_bound_since_previous_dispatch_in_bind_order() {
        let mut ctx = Context::default();
        let (a, b, c) = (buffer(&mut ctx, 1), buffer(&mut ctx, 2), buffer(&mut ctx, 3));
        let set_a = storage_set(&mut ctx, 11, a, false);
        let set_b = storage_set(&mut ctx, 12, b, true);
        let set_c = storage_set(&mut ctx, 13, c, false);
        let layout = vk::PipelineLayout::from_raw(99);
        let mut cb = CommandBuffer::new(RecordingEncoder::new());
        {
            let mut recorder = cb.record(&ctx);
            recorder
                .bind_descriptor_sets(COMPUTE, layout, 0, &[set_c], &[])
                .dispatch(1, 1, 1)
                .bind_descriptor_sets(COMPUTE, layout, 0, &[set_a], &[])
                .bind_pipeline(COMPUTE, vk::Pipeline::from_raw(98))
                .bind_descriptor_sets(GRAPHICS, layout, 0, &[set_c], &[])
                .bind_descriptor_sets(COMPUTE, layout, 1, &[set_b], &[])
                .dispatch(1, 1, 1);
        }
        let requirements = discover_dispatch_requirements(ctx.resources(), cb.stream(), 6, COMPUTE);
        let targets: Vec<Target> = requirements.iter().map(|r| r.target).collect();
        assert_eq!(targets, vec![Target::Buffer(a), Target::Buffer(b)]);
        let b_state = requirements.iter().find(|r| r.target == Target::Buffer(b)).map(|r| r.state);
        assert!(b_state.is_some_and(|state| state.is_write()));

        let first = discover_dispatch_requirements(ctx.resources(), cb.stream(), 1, COMPUTE);
        let targets: Vec<Target> = first.iter().map(|r| r.target).collect();
        assert_eq!(targets, vec![Target::Buffer(c)]);
    }

    #[test]
    fn bound_writable_set_orders_consecutive_dispatches() {
        let mut ctx = Context::default();
        let output = buffer(&mut ctx, 5);
        let set = storage_set(&mut ctx, 15, output, true);
        let mut cb = CommandBuffer::new(RecordingEncoder::new());
        {
            let mut recorder = cb.record(&ctx);
            recorder
                .bind_descriptor_sets(COMPUTE, vk::PipelineLayout::null(), 0, &[set], &[])
                .dispatch(8, 1, 1)
                .dispatch(8, 1, 1);
        }
        submit(&mut ctx, &mut cb);
        let barriers: Vec<_> = cb
            .native()
            .buffer_barriers()
            .into_iter()
            .filter(|(raw, _, _)| *raw == vk::Buffer::from_raw(5))
            .collect();
        assert_eq!(barriers.len(), 2);
        assert!(barriers[0].1.is_empty());
        assert!(barriers[1].1.contains(vk::AccessFlags2::SHADER_STORAGE_WRITE));
    }

    #[test]
    fn render_pass_barriers_precede_the_begin() {
        init_tracing();
        let mut ctx = Context::default();
        let staging = buffer(&mut ctx, 1);
        let texture = ctx.resources_mut().create_image(ImageInfo::new_2d(
            vk::Image::from_raw(40),
            vk::Format::R8G8B8A8_UNORM,
            4,
            4,
        ));
        let texture_view = ctx.resources_mut().create_image_view(ImageViewInfo::whole(
            vk::ImageView::from_raw(41),
            texture,
            vk::Format::R8G8B8A8_UNORM,
        ));
        let set = ctx.resources_mut().create_descriptor_set(DescriptorSetInfo {
            raw: vk::DescriptorSet::from_raw(42),
            bindings: vec![DescriptorBindingInfo::new(
                0,
                vk::DescriptorType::COMBINED_IMAGE_SAMPLER,
                vk::ShaderStageFlags::FRAGMENT,
            )],
        });
        ctx.resources_mut().write_descriptor(set, 0, 0, texture_view);
        let (framebuffer, target) = color_target(&mut ctx, 20, vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL);

        let mut cb = CommandBuffer::new(RecordingEncoder::new());
        {
            let mut recorder = cb.record(&ctx);
            recorder.copy_buffer_to_image(staging, texture, &[]);
            let mut pass = recorder.begin_render_pass(framebuffer, &[vk::ClearValue::default()], None);
            pass.bind_descriptor_sets(GRAPHICS, vk::PipelineLayout::null(), 0, &[set], &[])
                .draw(3, 1, 0, 0);
        }
        submit(&mut ctx, &mut cb);

        let native = cb.native();
        let begin = native
            .position(|c| matches!(c, Call::BeginRenderPass { .. }))
            .expect("render pass begun");
        let last_barrier = native
            .calls()
            .iter()
            .rposition(Call::is_barrier)
            .expect("barriers emitted");
        assert!(last_barrier < begin);

        let images = native.image_barriers();
        assert!(images.iter().any(|b| b.image == vk::Image::from_raw(40)
            && b.old_layout == vk::ImageLayout::TRANSFER_DST_OPTIMAL
            && b.new_layout == vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL));
        assert!(images.iter().any(|b| b.image == vk::Image::from_raw(20)
            && b.old_layout == vk::ImageLayout::UNDEFINED
            && b.new_layout == vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL));
        assert_eq!(
            ctx.resources().image_state(target, 0, 0).layout,
            vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL
        );
    }

    #[test]
    fn legacy_path_merges_stages() {
        let mut ctx = Context::new(crate::ContextOptions {
            synchronization2: false,
            debug_labels: false,
        });
        let (src, dst) = (buffer(&mut ctx, 1), buffer(&mut ctx, 2));
        let mut cb = CommandBuffer::new(RecordingEncoder::new());
        cb.record(&ctx).copy_buffer(src, dst, &[]);
        submit(&mut ctx, &mut cb);

        let calls = cb.native().calls();
        assert!(!calls.iter().any(|c| matches!(c, Call::PipelineBarrier2 { .. })));
        let legacy = calls.iter().find_map(|c| match c {
            Call::PipelineBarrier {
                src_stage_mask,
                dst_stage_mask,
                buffers,
                ..
            } => Some((*src_stage_mask, *dst_stage_mask, buffers.len())),
            _ => None,
        });
        assert_eq!(
            legacy,
            Some((
                vk::PipelineStageFlags::TOP_OF_PIPE,
                vk::PipelineStageFlags::TRANSFER,
                2
            ))
        );
    }

    #[test]
    fn parallel_recording_splices_in_task_order() {
        let mut ctx = Context::default();
        let mut scratch = [0xffu8; 6];
        let mut cb = CommandBuffer::new(RecordingEncoder::new());
        cb.record_parallel(&ctx, 3, &mut scratch, |index, recorder, slice| {
            slice.fill(index as u8);
            recorder.dispatch(index as u32 + 1, 1, 1);
        });
        assert_eq!(scratch, [0, 0, 1, 1, 2, 2]);
        submit(&mut ctx, &mut cb);

        let dispatched: Vec<u32> = cb
            .native()
            .calls()
            .iter()
            .filter_map(|c| match c {
                Call::Dispatch(x, _, _) => Some(*x),
                _ => None,
            })
            .collect();
        assert_eq!(dispatched, vec![1, 2, 3]);
    }

    fn accel(ctx: &mut Context, raw: u64, level: Level) -> AccelStructHandle {
        ctx.resources_mut()
            .create_acceleration_structure(AccelerationStructureInfo {
                raw: vk::AccelerationStructureKHR::from_raw(raw),
                level,
                device_address: raw << 8,
                size: 4096,
            })
    }

    #[test]
    fn builds_batch_per_level() {
        let mut ctx = Context::default();
        let aabbs = buffer(&mut ctx, 1);
        let instances = buffer(&mut ctx, 2);
        let blas_a = accel(&mut ctx, 10, Level::BottomLevel);
        let blas_b = accel(&mut ctx, 11, Level::BottomLevel);
        let tlas = accel(&mut ctx, 12, Level::TopLevel);
        let geometry = BuildGeometry::Aabbs {
            data: BufferAddress {
                buffer: aabbs,
                address: 0x1000,
            },
            stride: 24,
            primitive_count: 1,
            flags: vk::GeometryFlagsKHR::OPAQUE,
        };
        let mut cb = CommandBuffer::new(RecordingEncoder::new());
        {
            let mut recorder = cb.record(&ctx);
            recorder
                .build_acceleration_structure(BuildDescription::new(blas_a, 0x10000).geometry(geometry))
                .build_acceleration_structure(BuildDescription::new(blas_b, 0x20000).geometry(geometry))
                .build_acceleration_structure(
                    BuildDescription::new(tlas, 0x30000)
                        .geometry(BuildGeometry::Instances {
                            data: BufferAddress {
                                buffer: instances,
                                address: 0x2000,
                            },
                            primitive_count: 2,
                            flags: vk::GeometryFlagsKHR::empty(),
                        })
                        .bottom_level(blas_a)
                        .bottom_level(blas_b),
                );
        }
        submit(&mut ctx, &mut cb);

        let calls = cb.native().calls();
        let builds: Vec<(usize, usize)> = calls
            .iter()
            .enumerate()
            .filter_map(|(i, c)| match c {
                Call::BuildAccelerationStructures(builds) => Some((i, builds.len())),
                _ => None,
            })
            .collect();
        assert_eq!(builds.len(), 2);
        assert_eq!((builds[0].1, builds[1].1), (2, 1));
        assert!(calls[builds[0].0..builds[1].0].iter().any(Call::is_barrier));
    }

    #[test]
    fn refit_after_build_is_a_separate_call() {
        let mut ctx = Context::default();
        let aabbs = buffer(&mut ctx, 1);
        let blas = accel(&mut ctx, 10, Level::BottomLevel);
        let geometry = BuildGeometry::Aabbs {
            data: BufferAddress {
                buffer: aabbs,
                address: 0x1000,
            },
            stride: 24,
            primitive_count: 1,
            flags: vk::GeometryFlagsKHR::OPAQUE,
        };
        let mut cb = CommandBuffer::new(RecordingEncoder::new());
        cb.record(&ctx)
            .build_acceleration_structure(BuildDescription::new(blas, 0x10000).geometry(geometry))
            .build_acceleration_structure(
                BuildDescription::new(blas, 0x20000)
                    .geometry(geometry)
                    .update(blas),
            );
        submit(&mut ctx, &mut cb);

        let calls = cb.native().calls();
        let builds: Vec<usize> = calls
            .iter()
            .enumerate()
            .filter(|(_, c)| matches!(c, Call::BuildAccelerationStructures(_)))
            .map(|(i, _)| i)
            .collect();
        assert_eq!(builds.len(), 2);
        let ordered = calls[builds[0]..builds[1]].iter().any(|c| match c {
            Call::PipelineBarrier2 { memory, .. } => memory.iter().any(|m| {
                m.src_access_mask
                    .contains(vk::AccessFlags2::ACCELERATION_STRUCTURE_WRITE_KHR)
            }),
            _ => false,
        });
        assert!(ordered);
    }

    #[test]
    fn labels_follow_the_option() {
        for debug_labels in [false, true] {
            let mut ctx = Context::new(crate::ContextOptions {
                synchronization2: true,
                debug_labels,
            });
            let target = buffer(&mut ctx, 1);
            let mut cb = CommandBuffer::new(RecordingEncoder::new());
            {
                let mut recorder = cb.record(&ctx);
                let mut scope = recorder.debug_scope("clear");
                scope.fill_buffer(target, 0, 0, 7);
            }
            submit(&mut ctx, &mut cb);
            let native = cb.native();
            let fill = native.position(|c| {
                matches!(c, Call::FillBuffer { size, data: 7, .. } if *size == vk::WHOLE_SIZE)
            });
            let begin = native.position(|c| matches!(c, Call::BeginLabel(name) if name == "clear"));
            let end = native.position(|c| matches!(c, Call::EndLabel));
            assert!(fill.is_some());
            if debug_labels {
                assert!(begin.is_some() && begin < fill && fill < end);
            } else {
                assert_eq!((begin, end), (None, None));
            }
        }
    }

    #[test]
    fn explicit_barrier_keeps_queue_families() {
        let mut ctx = Context::default();
        let target = buffer(&mut ctx, 1);
        let mut cb = CommandBuffer::new(RecordingEncoder::new());
        cb.record(&ctx).buffer_barrier(
            BufferBarrierCommand::new(target, BarrierState::TRANSFER_WRITE, BarrierState::VERTEX_BUFFER)
                .queue_family_transfer(1, 0),
        );
        submit(&mut ctx, &mut cb);

        let families = cb.native().calls().iter().find_map(|c| match c {
            Call::PipelineBarrier2 { buffers, .. } => buffers
                .first()
                .map(|b| (b.src_queue_family_index, b.dst_queue_family_index)),
            _ => None,
        });
        assert_eq!(families, Some((1, 0)));
        assert_eq!(ctx.resources().buffer_state(target), BarrierState::VERTEX_BUFFER);
    }

    #[test]
    fn custom_commands_run_after_pending_barriers() {
        let mut ctx = Context::default();
        let target = buffer(&mut ctx, 1);
        let mut cb = CommandBuffer::new(RecordingEncoder::new());
        cb.record(&ctx)
            .fill_buffer(target, 0, 0, 0)
            .custom("marker", |encoder| encoder.insert_label("marker", [0.0; 4]));
        submit(&mut ctx, &mut cb);
        let native = cb.native();
        let fill = native.position(|c| matches!(c, Call::FillBuffer { .. }));
        let marker = native.position(|c| matches!(c, Call::InsertLabel(name) if name == "marker"));
        assert!(fill.is_some() && fill < marker);
    }
}
