pub mod barrier;
pub mod buffer;
pub mod encoder;
pub mod native;
pub mod pool;
pub mod recorder;
pub mod render_pass;
pub(crate) mod replay;
pub mod stream;
pub mod sync;
pub mod sync2;

#[cfg(test)]
pub(crate) mod testing;

pub use buffer::{CommandBuffer, NativeCommandBuffer, SecondaryCommandBuffer, SubmitStatus};
pub use encoder::{Encoder, RenderPassBegin};
pub use native::AshCommandBuffer;
pub use recorder::{CommandRecorder, DebugScope, RenderPass};
pub use stream::{BufferBarrierCommand, Command, CommandKind, CommandStream, TraceRaysRegions};
