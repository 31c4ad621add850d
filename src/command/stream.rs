use std::sync::Arc;

use ash::vk;
use smallvec::SmallVec;

use super::encoder::Encoder;
use crate::accel_struct::BuildDescription;
use crate::resources::{
    AccelStructHandle, BarrierState, BufferHandle, DescriptorSetHandle, FramebufferHandle,
    ImageHandle, SubresourceRange,
};

#[derive(Clone, Copy, Debug, Default)]
pub struct TraceRaysRegions {
    pub raygen: vk::StridedDeviceAddressRegionKHR,
    pub miss: vk::StridedDeviceAddressRegionKHR,
    pub hit: vk::StridedDeviceAddressRegionKHR,
    pub callable: vk::StridedDeviceAddressRegionKHR,
}

/// Explicit synchronization point for cases the automatic engine cannot infer, such as a
/// queue family ownership transfer. Emitted as-is; the table takes `dst` afterwards.
#[derive(Clone, Copy, Debug)]
pub struct BufferBarrierCommand {
    pub buffer: BufferHandle,
    pub src: BarrierState,
    pub dst: BarrierState,
    pub offset: vk::DeviceSize,
    pub size: vk::DeviceSize,
    pub src_queue_family_index: u32,
    pub dst_queue_family_index: u32,
}

impl BufferBarrierCommand {
    pub fn new(buffer: BufferHandle, src: BarrierState, dst: BarrierState) -> Self {
        Self {
            buffer,
            src,
            dst,
            offset: 0,
            size: vk::WHOLE_SIZE,
            src_queue_family_index: vk::QUEUE_FAMILY_IGNORED,
            dst_queue_family_index: vk::QUEUE_FAMILY_IGNORED,
        }
    }
    pub fn queue_family_transfer(mut self, src: u32, dst: u32) -> Self {
        self.src_queue_family_index = src;
        self.dst_queue_family_index = dst;
        self
    }
}

pub type CustomCommandFn = Arc<dyn Fn(&mut dyn Encoder) + Send + Sync>;

/// One recorded operation. Inline arrays stay in the record; handles are resolved to
/// native objects only at replay.
#[derive(Clone)]
pub enum Command {
    Draw {
        vertex_count: u32,
        instance_count: u32,
        first_vertex: u32,
        first_instance: u32,
    },
    DrawIndexed {
        index_count: u32,
        instance_count: u32,
        first_index: u32,
        vertex_offset: i32,
        first_instance: u32,
    },
    DrawIndirect {
        buffer: BufferHandle,
        offset: vk::DeviceSize,
        draw_count: u32,
        stride: u32,
    },
    DrawIndexedIndirect {
        buffer: BufferHandle,
        offset: vk::DeviceSize,
        draw_count: u32,
        stride: u32,
    },
    Dispatch {
        x: u32,
        y: u32,
        z: u32,
    },
    DispatchIndirect {
        buffer: BufferHandle,
        offset: vk::DeviceSize,
    },
    TraceRays {
        regions: TraceRaysRegions,
        width: u32,
        height: u32,
        depth: u32,
    },
    CopyBuffer {
        src: BufferHandle,
        dst: BufferHandle,
        regions: SmallVec<[vk::BufferCopy; 1]>,
    },
    CopyImage {
        src: ImageHandle,
        dst: ImageHandle,
        regions: SmallVec<[vk::ImageCopy; 1]>,
    },
    CopyBufferToImage {
        src: BufferHandle,
        dst: ImageHandle,
        regions: SmallVec<[vk::BufferImageCopy; 1]>,
    },
    CopyImageToBuffer {
        src: ImageHandle,
        dst: BufferHandle,
        regions: SmallVec<[vk::BufferImageCopy; 1]>,
    },
    BlitImage {
        src: ImageHandle,
        dst: ImageHandle,
        regions: SmallVec<[vk::ImageBlit; 1]>,
        filter: vk::Filter,
    },
    ClearColorImage {
        image: ImageHandle,
        color: vk::ClearColorValue,
        ranges: SmallVec<[SubresourceRange; 1]>,
    },
    ClearDepthStencilImage {
        image: ImageHandle,
        value: vk::ClearDepthStencilValue,
        ranges: SmallVec<[SubresourceRange; 1]>,
    },
    FillBuffer {
        buffer: BufferHandle,
        offset: vk::DeviceSize,
        size: vk::DeviceSize,
        data: u32,
    },
    ClearAttachments {
        attachments: SmallVec<[vk::ClearAttachment; 2]>,
        rects: SmallVec<[vk::ClearRect; 1]>,
    },
    BeginRenderPass {
        framebuffer: FramebufferHandle,
        area: vk::Rect2D,
        clear_values: SmallVec<[vk::ClearValue; 4]>,
        contents: vk::SubpassContents,
    },
    NextSubpass {
        contents: vk::SubpassContents,
    },
    EndRenderPass,
    BindPipeline {
        bind_point: vk::PipelineBindPoint,
        pipeline: vk::Pipeline,
    },
    BindDescriptorSets {
        bind_point: vk::PipelineBindPoint,
        layout: vk::PipelineLayout,
        first_set: u32,
        sets: SmallVec<[DescriptorSetHandle; 4]>,
        dynamic_offsets: SmallVec<[u32; 4]>,
    },
    PushConstants {
        layout: vk::PipelineLayout,
        stages: vk::ShaderStageFlags,
        offset: u32,
        data: SmallVec<[u8; 128]>,
    },
    SetViewport {
        first: u32,
        viewports: SmallVec<[vk::Viewport; 1]>,
    },
    SetScissor {
        first: u32,
        scissors: SmallVec<[vk::Rect2D; 1]>,
    },
    BindVertexBuffers {
        first_binding: u32,
        buffers: SmallVec<[(BufferHandle, vk::DeviceSize); 4]>,
    },
    BindIndexBuffer {
        buffer: BufferHandle,
        offset: vk::DeviceSize,
        index_type: vk::IndexType,
    },
    BuildAccelerationStructure(Box<BuildDescription>),
    CopyAccelerationStructure {
        src: AccelStructHandle,
        dst: AccelStructHandle,
        mode: vk::CopyAccelerationStructureModeKHR,
    },
    BufferBarrier(BufferBarrierCommand),
    /// Secondary streams spliced in order.
    Execute(Vec<CommandStream>),
    BeginLabel {
        name: String,
        color: [f32; 4],
    },
    EndLabel,
    InsertLabel {
        name: String,
        color: [f32; 4],
    },
    /// Moves a swapchain image into the presentable layout. Always the last record of a
    /// frame.
    PrepareForPresent {
        image: ImageHandle,
    },
    Custom {
        name: &'static str,
        f: CustomCommandFn,
    },
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum CommandKind {
    Draw,
    DrawIndexed,
    DrawIndirect,
    DrawIndexedIndirect,
    Dispatch,
    DispatchIndirect,
    TraceRays,
    CopyBuffer,
    CopyImage,
    CopyBufferToImage,
    CopyImageToBuffer,
    BlitImage,
    ClearColorImage,
    ClearDepthStencilImage,
    FillBuffer,
    ClearAttachments,
    BeginRenderPass,
    NextSubpass,
    EndRenderPass,
    BindPipeline,
    BindDescriptorSets,
    PushConstants,
    SetViewport,
    SetScissor,
    BindVertexBuffers,
    BindIndexBuffer,
    BuildAccelerationStructure,
    CopyAccelerationStructure,
    BufferBarrier,
    Execute,
    BeginLabel,
    EndLabel,
    InsertLabel,
    PrepareForPresent,
    Custom,
}

impl Command {
    pub fn kind(&self) -> CommandKind {
        match self {
            Command::Draw { .. } => CommandKind::Draw,
            Command::DrawIndexed { .. } => CommandKind::DrawIndexed,
            Command::DrawIndirect { .. } => CommandKind::DrawIndirect,
            Command::DrawIndexedIndirect { .. } => CommandKind::DrawIndexedIndirect,
            Command::Dispatch { .. } => CommandKind::Dispatch,
            Command::DispatchIndirect { .. } => CommandKind::DispatchIndirect,
            Command::TraceRays { .. } => CommandKind::TraceRays,
            Command::CopyBuffer { .. } => CommandKind::CopyBuffer,
            Command::CopyImage { .. } => CommandKind::CopyImage,
            Command::CopyBufferToImage { .. } => CommandKind::CopyBufferToImage,
            Command::CopyImageToBuffer { .. } => CommandKind::CopyImageToBuffer,
            Command::BlitImage { .. } => CommandKind::BlitImage,
            Command::ClearColorImage { .. } => CommandKind::ClearColorImage,
            Command::ClearDepthStencilImage { .. } => CommandKind::ClearDepthStencilImage,
            Command::FillBuffer { .. } => CommandKind::FillBuffer,
            Command::ClearAttachments { .. } => CommandKind::ClearAttachments,
            Command::BeginRenderPass { .. } => CommandKind::BeginRenderPass,
            Command::NextSubpass { .. } => CommandKind::NextSubpass,
            Command::EndRenderPass => CommandKind::EndRenderPass,
            Command::BindPipeline { .. } => CommandKind::BindPipeline,
            Command::BindDescriptorSets { .. } => CommandKind::BindDescriptorSets,
            Command::PushConstants { .. } => CommandKind::PushConstants,
            Command::SetViewport { .. } => CommandKind::SetViewport,
            Command::SetScissor { .. } => CommandKind::SetScissor,
            Command::BindVertexBuffers { .. } => CommandKind::BindVertexBuffers,
            Command::BindIndexBuffer { .. } => CommandKind::BindIndexBuffer,
            Command::BuildAccelerationStructure(_) => CommandKind::BuildAccelerationStructure,
            Command::CopyAccelerationStructure { .. } => CommandKind::CopyAccelerationStructure,
            Command::BufferBarrier(_) => CommandKind::BufferBarrier,
            Command::Execute(_) => CommandKind::Execute,
            Command::BeginLabel { .. } => CommandKind::BeginLabel,
            Command::EndLabel => CommandKind::EndLabel,
            Command::InsertLabel { .. } => CommandKind::InsertLabel,
            Command::PrepareForPresent { .. } => CommandKind::PrepareForPresent,
            Command::Custom { .. } => CommandKind::Custom,
        }
    }
}

impl CommandKind {
    /// Commands that end a descriptor-binding lookbehind scan.
    pub fn is_major(self) -> bool {
        matches!(
            self,
            CommandKind::Dispatch
                | CommandKind::DispatchIndirect
                | CommandKind::TraceRays
                | CommandKind::EndRenderPass
        )
    }

    /// Transfer-class commands may not appear inside a render pass.
    pub fn is_transfer(self) -> bool {
        matches!(
            self,
            CommandKind::CopyBuffer
                | CommandKind::CopyImage
                | CommandKind::CopyBufferToImage
                | CommandKind::CopyImageToBuffer
                | CommandKind::BlitImage
                | CommandKind::ClearColorImage
                | CommandKind::ClearDepthStencilImage
                | CommandKind::FillBuffer
                | CommandKind::BuildAccelerationStructure
                | CommandKind::CopyAccelerationStructure
        )
    }
}

impl std::fmt::Debug for Command {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Command::Execute(streams) => f
                .debug_tuple("Execute")
                .field(&streams.iter().map(CommandStream::len).collect::<Vec<_>>())
                .finish(),
            Command::BuildAccelerationStructure(build) => f
                .debug_tuple("BuildAccelerationStructure")
                .field(&build.dst)
                .finish(),
            Command::BeginLabel { name, .. } | Command::InsertLabel { name, .. } => {
                f.debug_tuple(&format!("{:?}", self.kind())).field(name).finish()
            }
            Command::Custom { name, .. } => f.debug_tuple("Custom").field(name).finish(),
            _ => f.write_fmt(format_args!("{:?}", self.kind())),
        }
    }
}

/// Append-only arena of commands, indexed by position. Walkable in both directions, so
/// barrier discovery can look ahead to the end of a render pass and back to the previous
/// major command without a separate index.
#[derive(Clone, Debug, Default)]
pub struct CommandStream {
    commands: Vec<Command>,
}

impl CommandStream {
    pub fn new() -> Self {
        Self::default()
    }
    pub fn push(&mut self, command: Command) {
        self.commands.push(command);
    }
    pub fn len(&self) -> usize {
        self.commands.len()
    }
    pub fn is_empty(&self) -> bool {
        self.commands.is_empty()
    }
    pub fn clear(&mut self) {
        self.commands.clear();
    }
    pub fn get(&self, position: usize) -> Option<&Command> {
        self.commands.get(position)
    }
    pub fn iter(&self) -> std::slice::Iter<'_, Command> {
        self.commands.iter()
    }
    pub fn last(&self) -> Option<&Command> {
        self.commands.last()
    }

    /// Records strictly before `position`, nearest first, up to (not including) the
    /// previous major command.
    pub fn lookbehind(&self, position: usize) -> impl Iterator<Item = (usize, &Command)> + '_ {
        let end = position.min(self.commands.len());
        self.commands[..end]
            .iter()
            .enumerate()
            .rev()
            .take_while(|(_, command)| !command.kind().is_major())
    }

    pub fn previous_major(&self, position: usize) -> Option<usize> {
        let end = position.min(self.commands.len());
        self.commands[..end]
            .iter()
            .rposition(|command| command.kind().is_major())
    }

    /// Position of the `EndRenderPass` closing the pass begun at `begin`.
    pub fn matching_end(&self, begin: usize) -> Option<usize> {
        self.commands
            .iter()
            .enumerate()
            .skip(begin + 1)
            .find(|(_, command)| matches!(command, Command::EndRenderPass))
            .map(|(position, _)| position)
    }
}

impl<'a> IntoIterator for &'a CommandStream {
    type Item = &'a Command;
    type IntoIter = std::slice::Iter<'a, Command>;

    fn into_iter(self) -> Self::IntoIter {
        self.commands.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dispatch() -> Command {
        Command::Dispatch { x: 1, y: 1, z: 1 }
    }

    #[test]
    fn walks_both_directions() {
        let mut stream = CommandStream::new();
        stream.push(dispatch());
        stream.push(Command::BindPipeline {
            bind_point: vk::PipelineBindPoint::COMPUTE,
            pipeline: vk::Pipeline::null(),
        });
        stream.push(Command::EndLabel);
        stream.push(dispatch());

        let behind: Vec<_> = stream.lookbehind(3).map(|(p, _)| p).collect();
        assert_eq!(behind, vec![2, 1]);
        assert_eq!(stream.previous_major(3), Some(0));
        assert_eq!(stream.previous_major(0), None);
        let forward: Vec<_> = stream.iter().map(Command::kind).collect();
        assert_eq!(
            forward,
            vec![
                CommandKind::Dispatch,
                CommandKind::BindPipeline,
                CommandKind::EndLabel,
                CommandKind::Dispatch
            ]
        );
    }

    #[test]
    fn finds_matching_end() {
        let mut stream = CommandStream::new();
        stream.push(Command::EndRenderPass);
        stream.push(Command::NextSubpass {
            contents: vk::SubpassContents::INLINE,
        });
        stream.push(Command::Draw {
            vertex_count: 3,
            instance_count: 1,
            first_vertex: 0,
            first_instance: 0,
        });
        stream.push(Command::EndRenderPass);
        assert_eq!(stream.matching_end(0), Some(3));
        assert_eq!(stream.matching_end(3), None);
    }
}
