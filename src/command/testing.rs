//! A native command buffer stand-in that logs every call, so barrier placement can be
//! asserted without a device.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use ash::{prelude::VkResult, vk};

use super::buffer::NativeCommandBuffer;
use super::encoder::{Encoder, RenderPassBegin};
use super::stream::TraceRaysRegions;
use crate::accel_struct::{CompactionQuery, NativeBuild};

#[derive(Clone, Debug)]
pub enum Call {
    Begin,
    Submit,
    PipelineBarrier2 {
        memory: Vec<vk::MemoryBarrier2>,
        buffers: Vec<vk::BufferMemoryBarrier2>,
        images: Vec<vk::ImageMemoryBarrier2>,
    },
    PipelineBarrier {
        src_stage_mask: vk::PipelineStageFlags,
        dst_stage_mask: vk::PipelineStageFlags,
        memory: Vec<vk::MemoryBarrier>,
        buffers: Vec<vk::BufferMemoryBarrier>,
        images: Vec<vk::ImageMemoryBarrier>,
    },
    BeginRenderPass {
        render_pass: vk::RenderPass,
        framebuffer: vk::Framebuffer,
        clear_value_count: usize,
    },
    NextSubpass,
    EndRenderPass,
    BindPipeline(vk::PipelineBindPoint, vk::Pipeline),
    BindDescriptorSets {
        bind_point: vk::PipelineBindPoint,
        first_set: u32,
        sets: Vec<vk::DescriptorSet>,
    },
    PushConstants(Vec<u8>),
    SetViewport(u32),
    SetScissor(u32),
    BindVertexBuffers(Vec<vk::Buffer>),
    BindIndexBuffer(vk::Buffer),
    Draw {
        vertex_count: u32,
        instance_count: u32,
    },
    DrawIndexed {
        index_count: u32,
    },
    DrawIndirect(vk::Buffer),
    DrawIndexedIndirect(vk::Buffer),
    Dispatch(u32, u32, u32),
    DispatchIndirect(vk::Buffer),
    TraceRays(u32, u32, u32),
    CopyBuffer {
        src: vk::Buffer,
        dst: vk::Buffer,
        regions: Vec<vk::BufferCopy>,
    },
    CopyImage {
        src: vk::Image,
        src_layout: vk::ImageLayout,
        dst: vk::Image,
        dst_layout: vk::ImageLayout,
        regions: Vec<vk::ImageCopy>,
    },
    CopyBufferToImage {
        src: vk::Buffer,
        dst: vk::Image,
        dst_layout: vk::ImageLayout,
        regions: Vec<vk::BufferImageCopy>,
    },
    CopyImageToBuffer {
        src: vk::Image,
        src_layout: vk::ImageLayout,
        dst: vk::Buffer,
    },
    BlitImage {
        src: vk::Image,
        dst: vk::Image,
    },
    ClearColorImage {
        image: vk::Image,
        layout: vk::ImageLayout,
        ranges: Vec<vk::ImageSubresourceRange>,
    },
    ClearDepthStencilImage {
        image: vk::Image,
        layout: vk::ImageLayout,
    },
    FillBuffer {
        buffer: vk::Buffer,
        offset: vk::DeviceSize,
        size: vk::DeviceSize,
        data: u32,
    },
    ClearAttachments(usize),
    BuildAccelerationStructures(Vec<(vk::AccelerationStructureTypeKHR, vk::AccelerationStructureKHR)>),
    CopyAccelerationStructure {
        src: vk::AccelerationStructureKHR,
        dst: vk::AccelerationStructureKHR,
        mode: vk::CopyAccelerationStructureModeKHR,
    },
    WriteCompactedSizes(Vec<vk::AccelerationStructureKHR>),
    BeginLabel(String),
    EndLabel,
    InsertLabel(String),
}

impl Call {
    pub fn is_barrier(&self) -> bool {
        matches!(self, Call::PipelineBarrier2 { .. } | Call::PipelineBarrier { .. })
    }
}

/// Answers once the owning encoder's fence is signaled.
pub struct RecordedQuery {
    signaled: Arc<AtomicBool>,
    count: u32,
}

impl CompactionQuery for RecordedQuery {
    fn compacted_size(&self, index: u32) -> VkResult<Option<vk::DeviceSize>> {
        debug_assert!(index < self.count);
        Ok(self
            .signaled
            .load(Ordering::Acquire)
            .then(|| RecordingEncoder::compacted_size_of(index)))
    }
}

pub struct RecordingEncoder {
    calls: Vec<Call>,
    signaled: Arc<AtomicBool>,
    submissions: usize,
    submit_error: Option<vk::Result>,
}

impl Default for RecordingEncoder {
    fn default() -> Self {
        Self::new()
    }
}

impl RecordingEncoder {
    pub fn new() -> Self {
        Self {
            calls: Vec::new(),
            signaled: Arc::new(AtomicBool::new(true)),
            submissions: 0,
            submit_error: None,
        }
    }

    /// Makes the next submission fail with `error`.
    pub fn fail_submit(&mut self, error: vk::Result) {
        self.submit_error = Some(error);
    }

    /// Shared fence flag. Set it to simulate the GPU finishing the last submission.
    pub fn fence(&self) -> Arc<AtomicBool> {
        self.signaled.clone()
    }

    pub fn compacted_size_of(index: u32) -> vk::DeviceSize {
        256 * (index as vk::DeviceSize + 1)
    }

    pub fn calls(&self) -> &[Call] {
        &self.calls
    }

    pub fn take_calls(&mut self) -> Vec<Call> {
        std::mem::take(&mut self.calls)
    }

    pub fn submissions(&self) -> usize {
        self.submissions
    }

    pub fn barriers(&self) -> impl Iterator<Item = &Call> {
        self.calls.iter().filter(|call| call.is_barrier())
    }

    /// Buffer barriers across every barrier call, as (buffer, src access, dst access).
    pub fn buffer_barriers(&self) -> Vec<(vk::Buffer, vk::AccessFlags2, vk::AccessFlags2)> {
        self.calls
            .iter()
            .flat_map(|call| match call {
                Call::PipelineBarrier2 { buffers, .. } => buffers
                    .iter()
                    .map(|b| (b.buffer, b.src_access_mask, b.dst_access_mask))
                    .collect(),
                _ => Vec::new(),
            })
            .collect()
    }

    /// Image barriers across every two-sided barrier call.
    pub fn image_barriers(&self) -> Vec<vk::ImageMemoryBarrier2> {
        self.calls
            .iter()
            .flat_map(|call| match call {
                Call::PipelineBarrier2 { images, .. } => images.clone(),
                _ => Vec::new(),
            })
            .collect()
    }

    /// Index of the first call matching `f`.
    pub fn position(&self, f: impl Fn(&Call) -> bool) -> Option<usize> {
        self.calls.iter().position(f)
    }
}

impl NativeCommandBuffer for RecordingEncoder {
    fn begin(&mut self) -> VkResult<()> {
        self.calls.push(Call::Begin);
        Ok(())
    }
    fn submit(&mut self) -> VkResult<()> {
        if let Some(error) = self.submit_error.take() {
            return Err(error);
        }
        self.calls.push(Call::Submit);
        self.signaled.store(false, Ordering::Release);
        self.submissions += 1;
        Ok(())
    }
    fn is_complete(&self) -> VkResult<bool> {
        Ok(self.signaled.load(Ordering::Acquire))
    }
}

impl Encoder for RecordingEncoder {
    fn raw_command_buffer(&self) -> vk::CommandBuffer {
        vk::CommandBuffer::null()
    }
    fn pipeline_barrier2(
        &mut self,
        memory_barriers: &[vk::MemoryBarrier2],
        buffer_barriers: &[vk::BufferMemoryBarrier2],
        image_barriers: &[vk::ImageMemoryBarrier2],
    ) {
        self.calls.push(Call::PipelineBarrier2 {
            memory: memory_barriers.to_vec(),
            buffers: buffer_barriers.to_vec(),
            images: image_barriers.to_vec(),
        });
    }
    fn pipeline_barrier(
        &mut self,
        src_stage_mask: vk::PipelineStageFlags,
        dst_stage_mask: vk::PipelineStageFlags,
        memory_barriers: &[vk::MemoryBarrier],
        buffer_barriers: &[vk::BufferMemoryBarrier],
        image_barriers: &[vk::ImageMemoryBarrier],
    ) {
        self.calls.push(Call::PipelineBarrier {
            src_stage_mask,
            dst_stage_mask,
            memory: memory_barriers.to_vec(),
            buffers: buffer_barriers.to_vec(),
            images: image_barriers.to_vec(),
        });
    }
    fn begin_render_pass(&mut self, begin: &RenderPassBegin) {
        self.calls.push(Call::BeginRenderPass {
            render_pass: begin.render_pass,
            framebuffer: begin.framebuffer,
            clear_value_count: begin.clear_values.len(),
        });
    }
    fn next_subpass(&mut self, _contents: vk::SubpassContents) {
        self.calls.push(Call::NextSubpass);
    }
    fn end_render_pass(&mut self) {
        self.calls.push(Call::EndRenderPass);
    }
    fn bind_pipeline(&mut self, bind_point: vk::PipelineBindPoint, pipeline: vk::Pipeline) {
        self.calls.push(Call::BindPipeline(bind_point, pipeline));
    }
    fn bind_descriptor_sets(
        &mut self,
        bind_point: vk::PipelineBindPoint,
        _layout: vk::PipelineLayout,
        first_set: u32,
        sets: &[vk::DescriptorSet],
        _dynamic_offsets: &[u32],
    ) {
        self.calls.push(Call::BindDescriptorSets {
            bind_point,
            first_set,
            sets: sets.to_vec(),
        });
    }
    fn push_constants(
        &mut self,
        _layout: vk::PipelineLayout,
        _stages: vk::ShaderStageFlags,
        _offset: u32,
        data: &[u8],
    ) {
        self.calls.push(Call::PushConstants(data.to_vec()));
    }
    fn set_viewport(&mut self, first: u32, _viewports: &[vk::Viewport]) {
        self.calls.push(Call::SetViewport(first));
    }
    fn set_scissor(&mut self, first: u32, _scissors: &[vk::Rect2D]) {
        self.calls.push(Call::SetScissor(first));
    }
    fn bind_vertex_buffers(
        &mut self,
        _first_binding: u32,
        buffers: &[vk::Buffer],
        _offsets: &[vk::DeviceSize],
    ) {
        self.calls.push(Call::BindVertexBuffers(buffers.to_vec()));
    }
    fn bind_index_buffer(
        &mut self,
        buffer: vk::Buffer,
        _offset: vk::DeviceSize,
        _index_type: vk::IndexType,
    ) {
        self.calls.push(Call::BindIndexBuffer(buffer));
    }
    fn draw(&mut self, vertex_count: u32, instance_count: u32, _first_vertex: u32, _first_instance: u32) {
        self.calls.push(Call::Draw {
            vertex_count,
            instance_count,
        });
    }
    fn draw_indexed(
        &mut self,
        index_count: u32,
        _instance_count: u32,
        _first_index: u32,
        _vertex_offset: i32,
        _first_instance: u32,
    ) {
        self.calls.push(Call::DrawIndexed { index_count });
    }
    fn draw_indirect(&mut self, buffer: vk::Buffer, _offset: vk::DeviceSize, _draw_count: u32, _stride: u32) {
        self.calls.push(Call::DrawIndirect(buffer));
    }
    fn draw_indexed_indirect(
        &mut self,
        buffer: vk::Buffer,
        _offset: vk::DeviceSize,
        _draw_count: u32,
        _stride: u32,
    ) {
        self.calls.push(Call::DrawIndexedIndirect(buffer));
    }
    fn dispatch(&mut self, x: u32, y: u32, z: u32) {
        self.calls.push(Call::Dispatch(x, y, z));
    }
    fn dispatch_indirect(&mut self, buffer: vk::Buffer, _offset: vk::DeviceSize) {
        self.calls.push(Call::DispatchIndirect(buffer));
    }
    fn trace_rays(&mut self, _regions: &TraceRaysRegions, width: u32, height: u32, depth: u32) {
        self.calls.push(Call::TraceRays(width, height, depth));
    }
    fn copy_buffer(&mut self, src: vk::Buffer, dst: vk::Buffer, regions: &[vk::BufferCopy]) {
        self.calls.push(Call::CopyBuffer {
            src,
            dst,
            regions: regions.to_vec(),
        });
    }
    fn copy_image(
        &mut self,
        src: vk::Image,
        src_layout: vk::ImageLayout,
        dst: vk::Image,
        dst_layout: vk::ImageLayout,
        regions: &[vk::ImageCopy],
    ) {
        self.calls.push(Call::CopyImage {
            src,
            src_layout,
            dst,
            dst_layout,
            regions: regions.to_vec(),
        });
    }
    fn copy_buffer_to_image(
        &mut self,
        src: vk::Buffer,
        dst: vk::Image,
        dst_layout: vk::ImageLayout,
        regions: &[vk::BufferImageCopy],
    ) {
        self.calls.push(Call::CopyBufferToImage {
            src,
            dst,
            dst_layout,
            regions: regions.to_vec(),
        });
    }
    fn copy_image_to_buffer(
        &mut self,
        src: vk::Image,
        src_layout: vk::ImageLayout,
        dst: vk::Buffer,
        _regions: &[vk::BufferImageCopy],
    ) {
        self.calls.push(Call::CopyImageToBuffer {
            src,
            src_layout,
            dst,
        });
    }
    fn blit_image(
        &mut self,
        src: vk::Image,
        _src_layout: vk::ImageLayout,
        dst: vk::Image,
        _dst_layout: vk::ImageLayout,
        _regions: &[vk::ImageBlit],
        _filter: vk::Filter,
    ) {
        self.calls.push(Call::BlitImage { src, dst });
    }
    fn clear_color_image(
        &mut self,
        image: vk::Image,
        layout: vk::ImageLayout,
        _color: &vk::ClearColorValue,
        ranges: &[vk::ImageSubresourceRange],
    ) {
        self.calls.push(Call::ClearColorImage {
            image,
            layout,
            ranges: ranges.to_vec(),
        });
    }
    fn clear_depth_stencil_image(
        &mut self,
        image: vk::Image,
        layout: vk::ImageLayout,
        _value: &vk::ClearDepthStencilValue,
        _ranges: &[vk::ImageSubresourceRange],
    ) {
        self.calls.push(Call::ClearDepthStencilImage { image, layout });
    }
    fn fill_buffer(&mut self, buffer: vk::Buffer, offset: vk::DeviceSize, size: vk::DeviceSize, data: u32) {
        self.calls.push(Call::FillBuffer {
            buffer,
            offset,
            size,
            data,
        });
    }
    fn clear_attachments(&mut self, attachments: &[vk::ClearAttachment], _rects: &[vk::ClearRect]) {
        self.calls.push(Call::ClearAttachments(attachments.len()));
    }
    fn build_acceleration_structures(&mut self, builds: &[NativeBuild]) {
        self.calls.push(Call::BuildAccelerationStructures(
            builds.iter().map(|b| (b.ty, b.dst)).collect(),
        ));
    }
    fn copy_acceleration_structure(
        &mut self,
        src: vk::AccelerationStructureKHR,
        dst: vk::AccelerationStructureKHR,
        mode: vk::CopyAccelerationStructureModeKHR,
    ) {
        self.calls
            .push(Call::CopyAccelerationStructure { src, dst, mode });
    }
    fn write_compacted_sizes(
        &mut self,
        structures: &[vk::AccelerationStructureKHR],
    ) -> VkResult<Arc<dyn CompactionQuery>> {
        self.calls
            .push(Call::WriteCompactedSizes(structures.to_vec()));
        Ok(Arc::new(RecordedQuery {
            signaled: self.signaled.clone(),
            count: structures.len() as u32,
        }))
    }
    fn begin_label(&mut self, name: &str, _color: [f32; 4]) {
        self.calls.push(Call::BeginLabel(name.to_owned()));
    }
    fn end_label(&mut self) {
        self.calls.push(Call::EndLabel);
    }
    fn insert_label(&mut self, name: &str, _color: [f32; 4]) {
        self.calls.push(Call::InsertLabel(name.to_owned()));
    }
}

/// Installs a subscriber that routes `tracing` output to the test harness.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_max_level(tracing::Level::TRACE)
        .with_test_writer()
        .try_init();
}
