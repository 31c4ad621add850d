use std::ops::{Deref, DerefMut};
use std::sync::Arc;

use ash::vk;
use smallvec::{smallvec, SmallVec};

use super::buffer::SecondaryCommandBuffer;
use super::encoder::Encoder;
use super::render_pass::RenderPassState;
use super::stream::{BufferBarrierCommand, Command, CommandStream, TraceRaysRegions};
use crate::accel_struct::BuildDescription;
use crate::descriptor::DescriptorResource;
use crate::resources::{
    AccelStructHandle, BufferHandle, DescriptorSetHandle, FramebufferHandle, ImageHandle,
    ImageViewHandle, ResourceId, ResourceRegistry, SubresourceRange,
};

// Appends commands to a stream.
// Every resource a command references is asserted ready and ready-locked for as long as
// the owning command buffer may still execute it. Nothing is resolved to native objects
// here; that happens when the stream is replayed at submission.
pub struct CommandRecorder<'a> {
    registry: &'a ResourceRegistry,
    stream: &'a mut CommandStream,
    locking: &'a mut Vec<ResourceId>,
    render_pass: RenderPassState,
    secondary: bool,
}

impl<'a> CommandRecorder<'a> {
    pub(crate) fn new(
        registry: &'a ResourceRegistry,
        stream: &'a mut CommandStream,
        locking: &'a mut Vec<ResourceId>,
        secondary: bool,
    ) -> Self {
        Self {
            registry,
            stream,
            locking,
            render_pass: RenderPassState::Idle,
            secondary,
        }
    }

    pub fn registry(&self) -> &'a ResourceRegistry {
        self.registry
    }

    pub fn is_secondary(&self) -> bool {
        self.secondary
    }

    fn reference(&mut self, id: impl Into<ResourceId>) {
        let id = id.into();
        debug_assert!(self.registry.is_ready(id), "{:?} is not ready", id);
        self.registry.lock(id);
        self.locking.push(id);
    }

    fn reference_view(&mut self, view: ImageViewHandle) {
        self.reference(view);
        if let Some(image) = self.registry.image_view(view).map(|v| v.image()) {
            self.reference(image);
        }
    }

    fn reference_descriptor_set(&mut self, set: DescriptorSetHandle) {
        self.reference(set);
        let Some(descriptor_set) = self.registry.descriptor_set(set) else {
            return;
        };
        let resources: Vec<DescriptorResource> = descriptor_set
            .bindings()
            .iter()
            .flat_map(|binding| binding.resources())
            .collect();
        for resource in resources {
            match resource {
                DescriptorResource::Buffer(buffer) => self.reference(buffer),
                DescriptorResource::ImageView(view) => self.reference_view(view),
                DescriptorResource::AccelerationStructure(accel_struct) => {
                    self.reference(accel_struct)
                }
            }
        }
    }

    fn reference_framebuffer(&mut self, framebuffer: FramebufferHandle) {
        self.reference(framebuffer);
        let views: SmallVec<[ImageViewHandle; 8]> = self
            .registry
            .framebuffer(framebuffer)
            .map(|fb| fb.attachments().iter().map(|a| a.view).collect())
            .unwrap_or_default();
        for view in views {
            self.reference_view(view);
        }
    }

    fn push(&mut self, command: Command) {
        debug_assert!(
            self.secondary || !(command.kind().is_transfer() && self.render_pass.is_active()),
            "{:?} recorded inside a render pass",
            command
        );
        self.stream.push(command);
    }

    fn assert_in_render_pass(&self) {
        debug_assert!(
            self.secondary || self.render_pass.is_active(),
            "draw recorded outside a render pass"
        );
    }

    fn buffer_size(&self, buffer: BufferHandle) -> vk::DeviceSize {
        self.registry.buffer(buffer).map_or(0, |b| b.size())
    }

    fn image_range(&self, image: ImageHandle, ranges: &[SubresourceRange]) -> SmallVec<[SubresourceRange; 1]> {
        let Some(image) = self.registry.image(image) else {
            return SmallVec::new();
        };
        if ranges.is_empty() {
            return smallvec![image.full_range()];
        }
        ranges
            .iter()
            .map(|range| range.resolve(image.mip_levels(), image.array_layers()))
            .collect()
    }

    pub fn bind_pipeline(&mut self, bind_point: vk::PipelineBindPoint, pipeline: vk::Pipeline) -> &mut Self {
        self.push(Command::BindPipeline {
            bind_point,
            pipeline,
        });
        self
    }

    pub fn bind_descriptor_sets(
        &mut self,
        bind_point: vk::PipelineBindPoint,
        layout: vk::PipelineLayout,
        first_set: u32,
        sets: &[DescriptorSetHandle],
        dynamic_offsets: &[u32],
    ) -> &mut Self {
        for set in sets {
            self.reference_descriptor_set(*set);
        }
        self.push(Command::BindDescriptorSets {
            bind_point,
            layout,
            first_set,
            sets: SmallVec::from_slice(sets),
            dynamic_offsets: SmallVec::from_slice(dynamic_offsets),
        });
        self
    }

    pub fn push_constants(
        &mut self,
        layout: vk::PipelineLayout,
        stages: vk::ShaderStageFlags,
        offset: u32,
        data: &[u8],
    ) -> &mut Self {
        self.push(Command::PushConstants {
            layout,
            stages,
            offset,
            data: SmallVec::from_slice(data),
        });
        self
    }

    pub fn set_viewport(&mut self, first: u32, viewports: &[vk::Viewport]) -> &mut Self {
        self.push(Command::SetViewport {
            first,
            viewports: SmallVec::from_slice(viewports),
        });
        self
    }

    pub fn set_scissor(&mut self, first: u32, scissors: &[vk::Rect2D]) -> &mut Self {
        self.push(Command::SetScissor {
            first,
            scissors: SmallVec::from_slice(scissors),
        });
        self
    }

    pub fn bind_vertex_buffers(
        &mut self,
        first_binding: u32,
        buffers: &[(BufferHandle, vk::DeviceSize)],
    ) -> &mut Self {
        for (buffer, _) in buffers {
            self.reference(*buffer);
        }
        self.push(Command::BindVertexBuffers {
            first_binding,
            buffers: SmallVec::from_slice(buffers),
        });
        self
    }

    pub fn bind_index_buffer(
        &mut self,
        buffer: BufferHandle,
        offset: vk::DeviceSize,
        index_type: vk::IndexType,
    ) -> &mut Self {
        self.reference(buffer);
        self.push(Command::BindIndexBuffer {
            buffer,
            offset,
            index_type,
        });
        self
    }

    pub fn draw(
        &mut self,
        vertex_count: u32,
        instance_count: u32,
        first_vertex: u32,
        first_instance: u32,
    ) -> &mut Self {
        self.assert_in_render_pass();
        self.push(Command::Draw {
            vertex_count,
            instance_count,
            first_vertex,
            first_instance,
        });
        self
    }

    pub fn draw_indexed(
        &mut self,
        index_count: u32,
        instance_count: u32,
        first_index: u32,
        vertex_offset: i32,
        first_instance: u32,
    ) -> &mut Self {
        self.assert_in_render_pass();
        self.push(Command::DrawIndexed {
            index_count,
            instance_count,
            first_index,
            vertex_offset,
            first_instance,
        });
        self
    }

    pub fn draw_indirect(
        &mut self,
        buffer: BufferHandle,
        offset: vk::DeviceSize,
        draw_count: u32,
        stride: u32,
    ) -> &mut Self {
        self.assert_in_render_pass();
        self.reference(buffer);
        self.push(Command::DrawIndirect {
            buffer,
            offset,
            draw_count,
            stride,
        });
        self
    }

    pub fn draw_indexed_indirect(
        &mut self,
        buffer: BufferHandle,
        offset: vk::DeviceSize,
        draw_count: u32,
        stride: u32,
    ) -> &mut Self {
        self.assert_in_render_pass();
        self.reference(buffer);
        self.push(Command::DrawIndexedIndirect {
            buffer,
            offset,
            draw_count,
            stride,
        });
        self
    }

    pub fn dispatch(&mut self, x: u32, y: u32, z: u32) -> &mut Self {
        debug_assert!(!self.render_pass.is_active(), "dispatch inside a render pass");
        self.push(Command::Dispatch { x, y, z });
        self
    }

    pub fn dispatch_indirect(&mut self, buffer: BufferHandle, offset: vk::DeviceSize) -> &mut Self {
        debug_assert!(!self.render_pass.is_active(), "dispatch inside a render pass");
        self.reference(buffer);
        self.push(Command::DispatchIndirect { buffer, offset });
        self
    }

    pub fn trace_rays(
        &mut self,
        regions: &TraceRaysRegions,
        width: u32,
        height: u32,
        depth: u32,
    ) -> &mut Self {
        debug_assert!(!self.render_pass.is_active(), "trace rays inside a render pass");
        self.push(Command::TraceRays {
            regions: *regions,
            width,
            height,
            depth,
        });
        self
    }

    /// An empty region list copies the whole of the smaller buffer.
    pub fn copy_buffer(
        &mut self,
        src: BufferHandle,
        dst: BufferHandle,
        regions: &[vk::BufferCopy],
    ) -> &mut Self {
        self.reference(src);
        self.reference(dst);
        let regions = if regions.is_empty() {
            smallvec![vk::BufferCopy {
                src_offset: 0,
                dst_offset: 0,
                size: self.buffer_size(src).min(self.buffer_size(dst)),
            }]
        } else {
            SmallVec::from_slice(regions)
        };
        self.push(Command::CopyBuffer { src, dst, regions });
        self
    }

    /// An empty region list copies every mip level both images have, all layers.
    pub fn copy_image(&mut self, src: ImageHandle, dst: ImageHandle, regions: &[vk::ImageCopy]) -> &mut Self {
        self.reference(src);
        self.reference(dst);
        let regions = if regions.is_empty() {
            match (self.registry.image(src), self.registry.image(dst)) {
                (Some(src), Some(dst)) => (0..src.mip_levels().min(dst.mip_levels()))
                    .map(|mip| vk::ImageCopy {
                        src_subresource: src.subresource_layers(mip),
                        src_offset: vk::Offset3D::default(),
                        dst_subresource: dst.subresource_layers(mip),
                        dst_offset: vk::Offset3D::default(),
                        extent: src.mip_extent(mip),
                    })
                    .collect(),
                _ => SmallVec::new(),
            }
        } else {
            SmallVec::from_slice(regions)
        };
        self.push(Command::CopyImage { src, dst, regions });
        self
    }

    /// An empty region list fills the first mip level, all layers, from tightly packed
    /// data at offset zero.
    pub fn copy_buffer_to_image(
        &mut self,
        src: BufferHandle,
        dst: ImageHandle,
        regions: &[vk::BufferImageCopy],
    ) -> &mut Self {
        self.reference(src);
        self.reference(dst);
        let regions = if regions.is_empty() {
            self.whole_image_copy(dst)
        } else {
            SmallVec::from_slice(regions)
        };
        self.push(Command::CopyBufferToImage { src, dst, regions });
        self
    }

    /// An empty region list reads back the first mip level, all layers, tightly packed.
    pub fn copy_image_to_buffer(
        &mut self,
        src: ImageHandle,
        dst: BufferHandle,
        regions: &[vk::BufferImageCopy],
    ) -> &mut Self {
        self.reference(src);
        self.reference(dst);
        let regions = if regions.is_empty() {
            self.whole_image_copy(src)
        } else {
            SmallVec::from_slice(regions)
        };
        self.push(Command::CopyImageToBuffer { src, dst, regions });
        self
    }

    fn whole_image_copy(&self, image: ImageHandle) -> SmallVec<[vk::BufferImageCopy; 1]> {
        self.registry
            .image(image)
            .map(|image| {
                smallvec![vk::BufferImageCopy {
                    buffer_offset: 0,
                    buffer_row_length: 0,
                    buffer_image_height: 0,
                    image_subresource: image.subresource_layers(0),
                    image_offset: vk::Offset3D::default(),
                    image_extent: image.extent(),
                }]
            })
            .unwrap_or_default()
    }

    /// An empty region list stretches the first mip level of `src` over the first mip
    /// level of `dst`.
    pub fn blit_image(
        &mut self,
        src: ImageHandle,
        dst: ImageHandle,
        regions: &[vk::ImageBlit],
        filter: vk::Filter,
    ) -> &mut Self {
        self.reference(src);
        self.reference(dst);
        let regions = if regions.is_empty() {
            match (self.registry.image(src), self.registry.image(dst)) {
                (Some(src), Some(dst)) => smallvec![vk::ImageBlit {
                    src_subresource: src.subresource_layers(0),
                    src_offsets: [vk::Offset3D::default(), extent_to_offset(src.extent())],
                    dst_subresource: dst.subresource_layers(0),
                    dst_offsets: [vk::Offset3D::default(), extent_to_offset(dst.extent())],
                }],
                _ => SmallVec::new(),
            }
        } else {
            SmallVec::from_slice(regions)
        };
        self.push(Command::BlitImage {
            src,
            dst,
            regions,
            filter,
        });
        self
    }

    /// An empty range list clears every subresource.
    pub fn clear_color_image(
        &mut self,
        image: ImageHandle,
        color: vk::ClearColorValue,
        ranges: &[SubresourceRange],
    ) -> &mut Self {
        self.reference(image);
        let ranges = self.image_range(image, ranges);
        self.push(Command::ClearColorImage {
            image,
            color,
            ranges,
        });
        self
    }

    /// An empty range list clears every subresource.
    pub fn clear_depth_stencil_image(
        &mut self,
        image: ImageHandle,
        value: vk::ClearDepthStencilValue,
        ranges: &[SubresourceRange],
    ) -> &mut Self {
        self.reference(image);
        let ranges = self.image_range(image, ranges);
        self.push(Command::ClearDepthStencilImage {
            image,
            value,
            ranges,
        });
        self
    }

    /// A zero `size` fills from `offset` to the end of the buffer.
    pub fn fill_buffer(
        &mut self,
        buffer: BufferHandle,
        offset: vk::DeviceSize,
        size: vk::DeviceSize,
        data: u32,
    ) -> &mut Self {
        self.reference(buffer);
        let size = if size == 0 { vk::WHOLE_SIZE } else { size };
        self.push(Command::FillBuffer {
            buffer,
            offset,
            size,
            data,
        });
        self
    }

    /// An empty rect list clears the whole render area of the active framebuffer.
    pub fn clear_attachments(
        &mut self,
        attachments: &[vk::ClearAttachment],
        rects: &[vk::ClearRect],
    ) -> &mut Self {
        self.assert_in_render_pass();
        let rects = if rects.is_empty() {
            let area = self
                .render_pass
                .framebuffer()
                .and_then(|fb| self.registry.framebuffer(fb))
                .map(|fb| fb.full_area());
            debug_assert!(area.is_some(), "no framebuffer to take the clear area from");
            area.map(|rect| {
                smallvec![vk::ClearRect {
                    rect,
                    base_array_layer: 0,
                    layer_count: 1,
                }]
            })
            .unwrap_or_default()
        } else {
            SmallVec::from_slice(rects)
        };
        self.push(Command::ClearAttachments {
            attachments: SmallVec::from_slice(attachments),
            rects,
        });
        self
    }

    /// Begins a render pass on `framebuffer`. The pass ends when the returned guard is
    /// dropped. `area` defaults to the whole framebuffer.
    pub fn begin_render_pass(
        &mut self,
        framebuffer: FramebufferHandle,
        clear_values: &[vk::ClearValue],
        area: Option<vk::Rect2D>,
    ) -> RenderPass<'_, 'a> {
        debug_assert!(!self.secondary, "render passes are begun on primary streams");
        self.reference_framebuffer(framebuffer);
        let (full_area, subpass_count) = self
            .registry
            .framebuffer(framebuffer)
            .map_or((vk::Rect2D::default(), 1), |fb| {
                (fb.full_area(), fb.subpass_count())
            });
        self.push(Command::BeginRenderPass {
            framebuffer,
            area: area.unwrap_or(full_area),
            clear_values: SmallVec::from_slice(clear_values),
            contents: vk::SubpassContents::INLINE,
        });
        self.render_pass.begin(framebuffer, subpass_count);
        RenderPass { recorder: self }
    }

    pub fn build_acceleration_structure(&mut self, build: BuildDescription) -> &mut Self {
        self.reference(build.dst);
        if let Some(src) = build.src {
            self.reference(src);
        }
        for blas in build.bottom_levels.iter() {
            self.reference(*blas);
        }
        for geometry in build.geometries.iter() {
            for input in geometry.inputs() {
                self.reference(input);
            }
        }
        self.push(Command::BuildAccelerationStructure(Box::new(build)));
        self
    }

    /// With `COMPACT`, `src` must have been built with compaction requested and `dst`
    /// sized from its compacted size.
    pub fn copy_acceleration_structure(
        &mut self,
        src: AccelStructHandle,
        dst: AccelStructHandle,
        mode: vk::CopyAccelerationStructureModeKHR,
    ) -> &mut Self {
        self.reference(src);
        self.reference(dst);
        self.push(Command::CopyAccelerationStructure { src, dst, mode });
        self
    }

    /// Emits `barrier` as-is for synchronization the engine cannot infer.
    pub fn buffer_barrier(&mut self, barrier: BufferBarrierCommand) -> &mut Self {
        self.reference(barrier.buffer);
        self.push(Command::BufferBarrier(barrier));
        self
    }

    /// Opens a label region that closes when the returned guard is dropped.
    pub fn debug_scope(&mut self, name: &str) -> DebugScope<'_, 'a> {
        self.push(Command::BeginLabel {
            name: name.to_owned(),
            color: [0.0; 4],
        });
        DebugScope { recorder: self }
    }

    pub fn insert_label(&mut self, name: &str, color: [f32; 4]) -> &mut Self {
        self.push(Command::InsertLabel {
            name: name.to_owned(),
            color,
        });
        self
    }

    /// Runs `f` against the native encoder at replay, after every barrier recorded before
    /// it has been flushed. Resources touched by `f` are not tracked.
    pub fn custom(
        &mut self,
        name: &'static str,
        f: impl Fn(&mut dyn Encoder) + Send + Sync + 'static,
    ) -> &mut Self {
        self.push(Command::Custom {
            name,
            f: Arc::new(f),
        });
        self
    }

    /// Splices secondary streams, in iteration order, through one `Execute` record.
    pub fn execute(&mut self, secondaries: impl IntoIterator<Item = SecondaryCommandBuffer>) -> &mut Self {
        let mut streams = Vec::new();
        for secondary in secondaries {
            let (stream, locking) = secondary.into_parts();
            self.locking.extend(locking);
            if !stream.is_empty() {
                streams.push(stream);
            }
        }
        if !streams.is_empty() {
            self.stream.push(Command::Execute(streams));
        }
        self
    }

    /// Records `task_count` secondary streams in parallel. Task `i` receives its own
    /// recorder and the `i`-th equal slice of `scratch`; the results are spliced in task
    /// order.
    pub fn record_parallel<F>(&mut self, task_count: usize, scratch: &mut [u8], f: F) -> &mut Self
    where
        F: Fn(usize, &mut CommandRecorder<'_>, &mut [u8]) + Sync,
    {
        let registry = self.registry;
        let chunk = scratch.len().checked_div(task_count).unwrap_or(0);
        let mut slices = Vec::with_capacity(task_count);
        let mut rest = scratch;
        for _ in 0..task_count {
            let (head, tail) = std::mem::take(&mut rest).split_at_mut(chunk);
            slices.push(head);
            rest = tail;
        }
        let f = &f;
        let secondaries: Vec<SecondaryCommandBuffer> = std::thread::scope(|scope| {
            let tasks: Vec<_> = slices
                .into_iter()
                .enumerate()
                .map(|(index, slice)| {
                    scope.spawn(move || {
                        let mut secondary = SecondaryCommandBuffer::new();
                        f(index, &mut secondary.recorder(registry), slice);
                        secondary
                    })
                })
                .collect();
            tasks
                .into_iter()
                .map(|task| task.join().unwrap_or_else(|panic| std::panic::resume_unwind(panic)))
                .collect()
        });
        tracing::trace!(task_count, "spliced parallel recording");
        self.execute(secondaries)
    }

    pub(crate) fn prepare_for_present(&mut self, image: ImageHandle) {
        self.reference(image);
        self.push(Command::PrepareForPresent { image });
    }
}

fn extent_to_offset(extent: vk::Extent3D) -> vk::Offset3D {
    vk::Offset3D {
        x: extent.width as i32,
        y: extent.height as i32,
        z: extent.depth as i32,
    }
}

/// An active render pass. Dereferences to the recorder; records the end of the pass when
/// dropped, including on early return.
pub struct RenderPass<'r, 'a> {
    recorder: &'r mut CommandRecorder<'a>,
}

impl<'r, 'a> RenderPass<'r, 'a> {
    pub fn next_subpass(&mut self) -> &mut Self {
        self.recorder.render_pass.next_subpass();
        self.recorder.push(Command::NextSubpass {
            contents: vk::SubpassContents::INLINE,
        });
        self
    }

    pub fn end(self) {}
}

impl<'r, 'a> Deref for RenderPass<'r, 'a> {
    type Target = CommandRecorder<'a>;

    fn deref(&self) -> &Self::Target {
        self.recorder
    }
}

impl<'r, 'a> DerefMut for RenderPass<'r, 'a> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        self.recorder
    }
}

impl<'r, 'a> Drop for RenderPass<'r, 'a> {
    fn drop(&mut self) {
        self.recorder.render_pass.end();
        self.recorder.push(Command::EndRenderPass);
    }
}

pub struct DebugScope<'r, 'a> {
    recorder: &'r mut CommandRecorder<'a>,
}

impl<'r, 'a> Deref for DebugScope<'r, 'a> {
    type Target = CommandRecorder<'a>;

    fn deref(&self) -> &Self::Target {
        self.recorder
    }
}

impl<'r, 'a> DerefMut for DebugScope<'r, 'a> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        self.recorder
    }
}

impl<'r, 'a> Drop for DebugScope<'r, 'a> {
    fn drop(&mut self) {
        self.recorder.push(Command::EndLabel);
    }
}
