use std::sync::{Arc, Mutex, PoisonError};

use ash::{prelude::VkResult, vk};

use super::buffer::NativeCommandBuffer;
use super::encoder::{Encoder, RenderPassBegin};
use super::pool::CommandPool;
use super::stream::TraceRaysRegions;
use super::sync2::PipelineBarrier;
use crate::accel_struct::{CompactionQuery, NativeBuild};
use crate::fence::Fence;
use crate::queue::Queue;
use crate::{Device, HasDevice};

/// A primary `VkCommandBuffer` with its own pool and fence, submitting to a shared queue.
///
/// Host synchronization for every `vkCmd*` below: the command buffer and the pool it was
/// allocated from must be externally synchronized. Both are owned by `self` and every
/// encoder call takes `&mut self`.
pub struct AshCommandBuffer {
    device: Arc<Device>,
    pool: CommandPool,
    fence: Fence,
    queue: Arc<Mutex<Queue>>,
    wait_semaphores: Vec<vk::SemaphoreSubmitInfo>,
    signal_semaphores: Vec<vk::SemaphoreSubmitInfo>,
}

impl HasDevice for AshCommandBuffer {
    fn device(&self) -> &Arc<Device> {
        &self.device
    }
}

impl AshCommandBuffer {
    pub fn new(device: Arc<Device>, queue: Arc<Mutex<Queue>>) -> VkResult<Self> {
        let family_index = queue
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .family_index();
        let pool = CommandPool::new(device.clone(), family_index)?;
        // Signaled, so the first submission is not deferred.
        let fence = Fence::new(device.clone(), true)?;
        Ok(Self {
            device,
            pool,
            fence,
            queue,
            wait_semaphores: Vec::new(),
            signal_semaphores: Vec::new(),
        })
    }

    pub fn fence(&self) -> &Fence {
        &self.fence
    }

    /// Semaphores the next submission waits on, such as a swapchain acquire.
    pub fn wait_semaphores(&mut self, semaphores: &[vk::SemaphoreSubmitInfo]) -> &mut Self {
        self.wait_semaphores.clear();
        self.wait_semaphores.extend_from_slice(semaphores);
        self
    }

    /// Semaphores the next submission signals, such as a present wait.
    pub fn signal_semaphores(&mut self, semaphores: &[vk::SemaphoreSubmitInfo]) -> &mut Self {
        self.signal_semaphores.clear();
        self.signal_semaphores.extend_from_slice(semaphores);
        self
    }

    fn buffer(&self) -> vk::CommandBuffer {
        self.pool.buffer()
    }

    fn accel_struct_loader(&self) -> Option<&ash::extensions::khr::AccelerationStructure> {
        let loader = self.device.accel_struct_loader();
        debug_assert!(loader.is_some(), "VK_KHR_acceleration_structure is not enabled");
        loader
    }
}

impl Drop for AshCommandBuffer {
    fn drop(&mut self) {
        // The pool frees the buffer right after this, so it must not be pending.
        if let Err(error) = self.fence.wait() {
            tracing::error!(fence = ?self.fence, ?error, "wait before freeing command buffer");
        }
    }
}

impl NativeCommandBuffer for AshCommandBuffer {
    fn begin(&mut self) -> VkResult<()> {
        self.pool.reset()?;
        // Safety: Host Syncronization rule for vkBeginCommandBuffer:
        // - Host access to commandBuffer must be externally synchronized.
        // - Host access to the VkCommandPool that commandBuffer was allocated from must be externally synchronized.
        // We have &mut self and thus exclusive control on both.
        unsafe {
            self.device.begin_command_buffer(
                self.buffer(),
                &vk::CommandBufferBeginInfo::builder()
                    .flags(vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT)
                    .build(),
            )
        }
    }

    fn submit(&mut self) -> VkResult<()> {
        // Safety: Host Syncronization rule for vkEndCommandBuffer:
        // - Host access to commandBuffer must be externally synchronized.
        // - Host access to the VkCommandPool that commandBuffer was allocated from must be externally synchronized.
        // We have &mut self and thus exclusive control on both.
        unsafe { self.device.end_command_buffer(self.buffer())? };
        self.fence.reset()?;
        let buffer = self.buffer();
        let result = self
            .queue
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .submit(buffer, &self.wait_semaphores, &self.signal_semaphores, &self.fence);
        self.wait_semaphores.clear();
        self.signal_semaphores.clear();
        result
    }

    fn is_complete(&self) -> VkResult<bool> {
        self.fence.signaled()
    }
}

impl Encoder for AshCommandBuffer {
    fn raw_command_buffer(&self) -> vk::CommandBuffer {
        self.buffer()
    }

    fn pipeline_barrier2(
        &mut self,
        memory_barriers: &[vk::MemoryBarrier2],
        buffer_barriers: &[vk::BufferMemoryBarrier2],
        image_barriers: &[vk::ImageMemoryBarrier2],
    ) {
        let barrier = PipelineBarrier::new(
            memory_barriers,
            buffer_barriers,
            image_barriers,
            vk::DependencyFlags::BY_REGION,
        );
        unsafe {
            self.device
                .cmd_pipeline_barrier2(self.buffer(), &barrier.to_dependency_info())
        }
    }
    fn pipeline_barrier(
        &mut self,
        src_stage_mask: vk::PipelineStageFlags,
        dst_stage_mask: vk::PipelineStageFlags,
        memory_barriers: &[vk::MemoryBarrier],
        buffer_barriers: &[vk::BufferMemoryBarrier],
        image_barriers: &[vk::ImageMemoryBarrier],
    ) {
        unsafe {
            self.device.cmd_pipeline_barrier(
                self.buffer(),
                src_stage_mask,
                dst_stage_mask,
                vk::DependencyFlags::BY_REGION,
                memory_barriers,
                buffer_barriers,
                image_barriers,
            )
        }
    }

    fn begin_render_pass(&mut self, begin: &RenderPassBegin) {
        let info = vk::RenderPassBeginInfo::builder()
            .render_pass(begin.render_pass)
            .framebuffer(begin.framebuffer)
            .render_area(begin.area)
            .clear_values(begin.clear_values);
        unsafe {
            self.device
                .cmd_begin_render_pass(self.buffer(), &info, begin.contents)
        }
    }
    fn next_subpass(&mut self, contents: vk::SubpassContents) {
        unsafe { self.device.cmd_next_subpass(self.buffer(), contents) }
    }
    fn end_render_pass(&mut self) {
        unsafe { self.device.cmd_end_render_pass(self.buffer()) }
    }

    fn bind_pipeline(&mut self, bind_point: vk::PipelineBindPoint, pipeline: vk::Pipeline) {
        unsafe {
            self.device
                .cmd_bind_pipeline(self.buffer(), bind_point, pipeline)
        }
    }
    fn bind_descriptor_sets(
        &mut self,
        bind_point: vk::PipelineBindPoint,
        layout: vk::PipelineLayout,
        first_set: u32,
        sets: &[vk::DescriptorSet],
        dynamic_offsets: &[u32],
    ) {
        unsafe {
            self.device.cmd_bind_descriptor_sets(
                self.buffer(),
                bind_point,
                layout,
                first_set,
                sets,
                dynamic_offsets,
            )
        }
    }
    fn push_constants(
        &mut self,
        layout: vk::PipelineLayout,
        stages: vk::ShaderStageFlags,
        offset: u32,
        data: &[u8],
    ) {
        unsafe {
            self.device
                .cmd_push_constants(self.buffer(), layout, stages, offset, data)
        }
    }
    fn set_viewport(&mut self, first: u32, viewports: &[vk::Viewport]) {
        unsafe { self.device.cmd_set_viewport(self.buffer(), first, viewports) }
    }
    fn set_scissor(&mut self, first: u32, scissors: &[vk::Rect2D]) {
        unsafe { self.device.cmd_set_scissor(self.buffer(), first, scissors) }
    }
    fn bind_vertex_buffers(
        &mut self,
        first_binding: u32,
        buffers: &[vk::Buffer],
        offsets: &[vk::DeviceSize],
    ) {
        unsafe {
            self.device
                .cmd_bind_vertex_buffers(self.buffer(), first_binding, buffers, offsets)
        }
    }
    fn bind_index_buffer(
        &mut self,
        buffer: vk::Buffer,
        offset: vk::DeviceSize,
        index_type: vk::IndexType,
    ) {
        unsafe {
            self.device
                .cmd_bind_index_buffer(self.buffer(), buffer, offset, index_type)
        }
    }

    fn draw(&mut self, vertex_count: u32, instance_count: u32, first_vertex: u32, first_instance: u32) {
        unsafe {
            self.device.cmd_draw(
                self.buffer(),
                vertex_count,
                instance_count,
                first_vertex,
                first_instance,
            )
        }
    }
    fn draw_indexed(
        &mut self,
        index_count: u32,
        instance_count: u32,
        first_index: u32,
        vertex_offset: i32,
        first_instance: u32,
    ) {
        unsafe {
            self.device.cmd_draw_indexed(
                self.buffer(),
                index_count,
                instance_count,
                first_index,
                vertex_offset,
                first_instance,
            )
        }
    }
    fn draw_indirect(&mut self, buffer: vk::Buffer, offset: vk::DeviceSize, draw_count: u32, stride: u32) {
        unsafe {
            self.device
                .cmd_draw_indirect(self.buffer(), buffer, offset, draw_count, stride)
        }
    }
    fn draw_indexed_indirect(
        &mut self,
        buffer: vk::Buffer,
        offset: vk::DeviceSize,
        draw_count: u32,
        stride: u32,
    ) {
        unsafe {
            self.device
                .cmd_draw_indexed_indirect(self.buffer(), buffer, offset, draw_count, stride)
        }
    }
    fn dispatch(&mut self, x: u32, y: u32, z: u32) {
        unsafe { self.device.cmd_dispatch(self.buffer(), x, y, z) }
    }
    fn dispatch_indirect(&mut self, buffer: vk::Buffer, offset: vk::DeviceSize) {
        unsafe {
            self.device
                .cmd_dispatch_indirect(self.buffer(), buffer, offset)
        }
    }
    fn trace_rays(&mut self, regions: &TraceRaysRegions, width: u32, height: u32, depth: u32) {
        let loader = self.device.ray_tracing_loader();
        debug_assert!(loader.is_some(), "VK_KHR_ray_tracing_pipeline is not enabled");
        if let Some(loader) = loader {
            unsafe {
                loader.cmd_trace_rays(
                    self.buffer(),
                    &regions.raygen,
                    &regions.miss,
                    &regions.hit,
                    &regions.callable,
                    width,
                    height,
                    depth,
                )
            }
        }
    }

    fn copy_buffer(&mut self, src: vk::Buffer, dst: vk::Buffer, regions: &[vk::BufferCopy]) {
        unsafe { self.device.cmd_copy_buffer(self.buffer(), src, dst, regions) }
    }
    fn copy_image(
        &mut self,
        src: vk::Image,
        src_layout: vk::ImageLayout,
        dst: vk::Image,
        dst_layout: vk::ImageLayout,
        regions: &[vk::ImageCopy],
    ) {
        unsafe {
            self.device
                .cmd_copy_image(self.buffer(), src, src_layout, dst, dst_layout, regions)
        }
    }
    fn copy_buffer_to_image(
        &mut self,
        src: vk::Buffer,
        dst: vk::Image,
        dst_layout: vk::ImageLayout,
        regions: &[vk::BufferImageCopy],
    ) {
        unsafe {
            self.device
                .cmd_copy_buffer_to_image(self.buffer(), src, dst, dst_layout, regions)
        }
    }
    fn copy_image_to_buffer(
        &mut self,
        src: vk::Image,
        src_layout: vk::ImageLayout,
        dst: vk::Buffer,
        regions: &[vk::BufferImageCopy],
    ) {
        unsafe {
            self.device
                .cmd_copy_image_to_buffer(self.buffer(), src, src_layout, dst, regions)
        }
    }
    fn blit_image(
        &mut self,
        src: vk::Image,
        src_layout: vk::ImageLayout,
        dst: vk::Image,
        dst_layout: vk::ImageLayout,
        regions: &[vk::ImageBlit],
        filter: vk::Filter,
    ) {
        unsafe {
            self.device.cmd_blit_image(
                self.buffer(),
                src,
                src_layout,
                dst,
                dst_layout,
                regions,
                filter,
            )
        }
    }
    fn clear_color_image(
        &mut self,
        image: vk::Image,
        layout: vk::ImageLayout,
        color: &vk::ClearColorValue,
        ranges: &[vk::ImageSubresourceRange],
    ) {
        unsafe {
            self.device
                .cmd_clear_color_image(self.buffer(), image, layout, color, ranges)
        }
    }
    fn clear_depth_stencil_image(
        &mut self,
        image: vk::Image,
        layout: vk::ImageLayout,
        value: &vk::ClearDepthStencilValue,
        ranges: &[vk::ImageSubresourceRange],
    ) {
        unsafe {
            self.device
                .cmd_clear_depth_stencil_image(self.buffer(), image, layout, value, ranges)
        }
    }
    fn fill_buffer(&mut self, buffer: vk::Buffer, offset: vk::DeviceSize, size: vk::DeviceSize, data: u32) {
        unsafe {
            self.device
                .cmd_fill_buffer(self.buffer(), buffer, offset, size, data)
        }
    }
    fn clear_attachments(&mut self, attachments: &[vk::ClearAttachment], rects: &[vk::ClearRect]) {
        unsafe {
            self.device
                .cmd_clear_attachments(self.buffer(), attachments, rects)
        }
    }

    fn build_acceleration_structures(&mut self, builds: &[NativeBuild]) {
        let Some(loader) = self.accel_struct_loader() else {
            return;
        };
        // The geometry infos point into `builds`, which outlives the call.
        let infos: Vec<vk::AccelerationStructureBuildGeometryInfoKHR> =
            builds.iter().map(NativeBuild::geometry_info).collect();
        let ranges: Vec<&[vk::AccelerationStructureBuildRangeInfoKHR]> =
            builds.iter().map(|build| build.ranges.as_slice()).collect();
        unsafe { loader.cmd_build_acceleration_structures(self.buffer(), &infos, &ranges) }
    }
    fn copy_acceleration_structure(
        &mut self,
        src: vk::AccelerationStructureKHR,
        dst: vk::AccelerationStructureKHR,
        mode: vk::CopyAccelerationStructureModeKHR,
    ) {
        let Some(loader) = self.accel_struct_loader() else {
            return;
        };
        let info = vk::CopyAccelerationStructureInfoKHR::builder()
            .src(src)
            .dst(dst)
            .mode(mode);
        unsafe { loader.cmd_copy_acceleration_structure(self.buffer(), &info) }
    }
    fn write_compacted_sizes(
        &mut self,
        structures: &[vk::AccelerationStructureKHR],
    ) -> VkResult<Arc<dyn CompactionQuery>> {
        let count = structures.len() as u32;
        let query = CompactedSizeQuery::new(self.device.clone(), count)?;
        if let Some(loader) = self.accel_struct_loader() {
            unsafe {
                self.device
                    .cmd_reset_query_pool(self.buffer(), query.pool, 0, count);
                loader.cmd_write_acceleration_structures_properties(
                    self.buffer(),
                    structures,
                    vk::QueryType::ACCELERATION_STRUCTURE_COMPACTED_SIZE_KHR,
                    query.pool,
                    0,
                );
            }
        }
        Ok(Arc::new(query))
    }

    fn begin_label(&mut self, name: &str, color: [f32; 4]) {
        unsafe {
            self.device
                .instance()
                .debug_utils()
                .begin_label(self.buffer(), name, color)
        }
    }
    fn end_label(&mut self) {
        unsafe { self.device.instance().debug_utils().end_label(self.buffer()) }
    }
    fn insert_label(&mut self, name: &str, color: [f32; 4]) {
        unsafe {
            self.device
                .instance()
                .debug_utils()
                .insert_label(self.buffer(), name, color)
        }
    }
}

/// A query pool receiving the compacted sizes of one build batch.
pub struct CompactedSizeQuery {
    device: Arc<Device>,
    pool: vk::QueryPool,
    count: u32,
}

impl CompactedSizeQuery {
    fn new(device: Arc<Device>, count: u32) -> VkResult<Self> {
        // Safety: No Host Syncronization rules for vkCreateQueryPool.
        let pool = unsafe {
            device.create_query_pool(
                &vk::QueryPoolCreateInfo::builder()
                    .query_type(vk::QueryType::ACCELERATION_STRUCTURE_COMPACTED_SIZE_KHR)
                    .query_count(count)
                    .build(),
                None,
            )?
        };
        Ok(Self {
            device,
            pool,
            count,
        })
    }
}

impl CompactionQuery for CompactedSizeQuery {
    fn compacted_size(&self, index: u32) -> VkResult<Option<vk::DeviceSize>> {
        debug_assert!(index < self.count);
        let mut size = [0u64; 1];
        // Safety: No Host Syncronization rules for vkGetQueryPoolResults. Without WAIT
        // the call returns NOT_READY instead of blocking.
        let result = unsafe {
            self.device.get_query_pool_results(
                self.pool,
                index,
                1,
                &mut size,
                vk::QueryResultFlags::TYPE_64,
            )
        };
        match result {
            Ok(()) => Ok(Some(size[0])),
            Err(vk::Result::NOT_READY) => Ok(None),
            Err(err) => Err(err),
        }
    }
}

impl Drop for CompactedSizeQuery {
    fn drop(&mut self) {
        // Safety: Host Syncronization rule for vkDestroyQueryPool:
        // - Host access to queryPool must be externally synchronized.
        // We have &mut self and thus exclusive control on the pool. It is only dropped once
        // the last structure waiting for compaction has consumed its marker.
        unsafe {
            self.device.destroy_query_pool(self.pool, None);
        }
    }
}
