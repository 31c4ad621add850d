use ash::{prelude::VkResult, vk};

use super::encoder::Encoder;
use super::recorder::CommandRecorder;
use super::replay::Replay;
use super::stream::CommandStream;
use crate::resources::{ImageHandle, ResourceId, ResourceRegistry};
use crate::Context;

/// The native side of a command buffer: the encoder replay writes into, plus the
/// begin/submit/poll lifecycle around it.
pub trait NativeCommandBuffer: Encoder {
    /// Resets the native buffer and starts recording.
    fn begin(&mut self) -> VkResult<()>;
    /// Ends recording and submits. Completion is observed through `is_complete`.
    fn submit(&mut self) -> VkResult<()>;
    /// Non-blocking fence poll.
    fn is_complete(&self) -> VkResult<bool>;
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SubmitStatus {
    Submitted,
    /// The previous submission is still executing. Everything recorded is kept for the
    /// next attempt.
    Deferred,
    /// Nothing was recorded; the device queue was not touched.
    Empty,
}

/// A primary command buffer.
///
/// Commands are recorded into a stream and only encoded into the native buffer at
/// submission, when barriers are inserted against the context's state table. Resources
/// referenced by the recording are ready-locked until the submission that used them is
/// observed complete.
pub struct CommandBuffer<N: NativeCommandBuffer> {
    native: N,
    stream: CommandStream,
    locking: Vec<ResourceId>,
    locked: Vec<ResourceId>,
    running: bool,
}

impl<N: NativeCommandBuffer> CommandBuffer<N> {
    pub fn new(native: N) -> Self {
        Self {
            native,
            stream: CommandStream::new(),
            locking: Vec::new(),
            locked: Vec::new(),
            running: false,
        }
    }
    pub fn native(&self) -> &N {
        &self.native
    }
    pub fn native_mut(&mut self) -> &mut N {
        &mut self.native
    }
    pub fn stream(&self) -> &CommandStream {
        &self.stream
    }
    pub fn is_running(&self) -> bool {
        self.running
    }

    pub fn record<'a>(&'a mut self, ctx: &'a Context) -> CommandRecorder<'a> {
        CommandRecorder::new(&ctx.resources, &mut self.stream, &mut self.locking, false)
    }

    /// Records `task_count` secondary streams on worker threads and splices them in task
    /// order. See [`CommandRecorder::record_parallel`].
    pub fn record_parallel<F>(&mut self, ctx: &Context, task_count: usize, scratch: &mut [u8], f: F)
    where
        F: Fn(usize, &mut CommandRecorder<'_>, &mut [u8]) + Sync,
    {
        self.record(ctx).record_parallel(task_count, scratch, f);
    }

    /// Releases the resources of a completed submission. Returns false while the
    /// previous submission is still executing.
    pub fn poll(&mut self, ctx: &mut Context) -> VkResult<bool> {
        if !self.running {
            return Ok(true);
        }
        if !self.native.is_complete()? {
            return Ok(false);
        }
        self.retire(ctx);
        Ok(true)
    }

    fn retire(&mut self, ctx: &mut Context) {
        for id in self.locked.drain(..) {
            ctx.resources.unlock(id);
        }
        self.running = false;
        ctx.resources.collect_garbage();
    }

    /// Inserts barriers, encodes and submits everything recorded since the last
    /// submission. Never blocks: if the previous submission has not completed yet the
    /// call returns `Deferred` and can be retried later. A device error discards the
    /// recording.
    pub fn submit(&mut self, ctx: &mut Context) -> VkResult<SubmitStatus> {
        if !self.poll(ctx)? {
            tracing::warn!(
                command_buffer = ?self.native.raw_command_buffer(),
                "command buffer still running, submission deferred"
            );
            return Ok(SubmitStatus::Deferred);
        }
        if self.stream.is_empty() {
            for id in self.locking.drain(..) {
                ctx.resources.unlock(id);
            }
            return Ok(SubmitStatus::Empty);
        }
        self.encode_and_submit(ctx)?;
        Ok(SubmitStatus::Submitted)
    }

    /// Submits a frame's primary buffer, ending it with the transition of the acquired
    /// swapchain `image` into the presentable layout. If nothing was recorded the image
    /// is cleared first so presentation never reads uninitialized memory.
    ///
    /// Frame buffers are not fence-gated: the swapchain's in-flight frame protocol must
    /// already have waited for this buffer's previous submission.
    pub fn submit_frame(&mut self, ctx: &mut Context, image: ImageHandle) -> VkResult<SubmitStatus> {
        if self.running {
            self.retire(ctx);
        }
        let nothing_recorded = self.stream.is_empty();
        {
            let mut recorder =
                CommandRecorder::new(&ctx.resources, &mut self.stream, &mut self.locking, false);
            if nothing_recorded {
                recorder.clear_color_image(image, vk::ClearColorValue::default(), &[]);
            }
            recorder.prepare_for_present(image);
        }
        self.encode_and_submit(ctx)?;
        Ok(SubmitStatus::Submitted)
    }

    /// Barriers are committed to the state table while encoding, so on failure the
    /// table no longer matches the device and the recording is discarded instead of
    /// being kept for a retry. Such an error is fatal for the context.
    fn encode_and_submit(&mut self, ctx: &mut Context) -> VkResult<()> {
        let encoded = self
            .native
            .begin()
            .and_then(|()| {
                Replay::new(&mut ctx.resources, &mut self.native, ctx.options).run(&self.stream)
            })
            .and_then(|()| self.native.submit());
        if let Err(error) = encoded {
            tracing::error!(
                command_buffer = ?self.native.raw_command_buffer(),
                ?error,
                "submission failed, recording discarded"
            );
            self.discard(ctx);
            return Err(error);
        }
        tracing::debug!(
            command_buffer = ?self.native.raw_command_buffer(),
            commands = self.stream.len(),
            resources = self.locking.len(),
            "submit"
        );
        std::mem::swap(&mut self.locking, &mut self.locked);
        self.stream.clear();
        self.running = true;
        Ok(())
    }

    /// Throws away everything recorded since the last submission and releases its
    /// ready-locks.
    pub fn discard(&mut self, ctx: &Context) {
        self.stream.clear();
        for id in self.locking.drain(..) {
            ctx.resources.unlock(id);
        }
    }
}

/// A stream recorded independently of any primary buffer, typically on a worker thread,
/// and later spliced into one with [`CommandRecorder::execute`]. Its ready-locks move to
/// the primary buffer on splice.
#[derive(Debug, Default)]
pub struct SecondaryCommandBuffer {
    stream: CommandStream,
    locking: Vec<ResourceId>,
}

impl SecondaryCommandBuffer {
    pub fn new() -> Self {
        Self::default()
    }
    pub fn record<'a>(&'a mut self, ctx: &'a Context) -> CommandRecorder<'a> {
        self.recorder(&ctx.resources)
    }
    pub(crate) fn recorder<'a>(&'a mut self, registry: &'a ResourceRegistry) -> CommandRecorder<'a> {
        CommandRecorder::new(registry, &mut self.stream, &mut self.locking, true)
    }
    pub fn stream(&self) -> &CommandStream {
        &self.stream
    }
    pub fn len(&self) -> usize {
        self.stream.len()
    }
    pub fn is_empty(&self) -> bool {
        self.stream.is_empty()
    }
    pub(crate) fn into_parts(self) -> (CommandStream, Vec<ResourceId>) {
        (self.stream, self.locking)
    }
}
