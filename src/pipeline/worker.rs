//! Body of a stream worker thread: open, decode, convert, publish

use super::health::StreamHealth;
use super::state::{PipelineState, SharedState};
use super::types::{ConvertedFrame, StreamId};
use crate::config::PipelineSettings;
use crate::convert::{Converter, FrameBuffer};
use crate::delivery::Mailbox;
use crate::error::{ErrorRecord, PipelineError, Stage};
use crate::media::{MediaBackend, MediaSource, OpenedMedia, SourceLocator, VideoDecoder};
use crate::utils::sos::SignalOfStop;
use bytes::Bytes;
use log::{debug, error, info, trace, warn};
use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::time::Instant;

/// Normal ways out of the decode loop
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerExit {
    /// Keep-alive flag cleared by the owner
    StopRequested,
    /// Source has no more packets
    EndOfStream,
}

pub(crate) struct WorkerContext {
    pub id: StreamId,
    pub index: usize,
    pub locator: SourceLocator,
    pub backend: Arc<dyn MediaBackend>,
    pub settings: Arc<PipelineSettings>,
    pub keep_alive: SignalOfStop,
    pub state: SharedState,
    pub health: Arc<StreamHealth>,
    pub mailbox: Arc<Mailbox>,
}

impl WorkerContext {
    fn tag(&self) -> String {
        format!("#{} [{}]", self.index, self.id.short())
    }
}

/// Everything a run acquires, released exactly once when it goes out of scope
struct StreamResources {
    source: Box<dyn MediaSource>,
    decoder: Box<dyn VideoDecoder>,
    converter: Converter,
    buffer: FrameBuffer,
    health: Arc<StreamHealth>,
    reported_allocations: u64,
}

impl StreamResources {
    fn new(media: OpenedMedia, ctx: &WorkerContext) -> Self {
        Self {
            source: media.source,
            decoder: media.decoder,
            converter: Converter::new(ctx.settings.dest_format, ctx.settings.downscale),
            buffer: FrameBuffer::new(ctx.settings.max_frame_bytes),
            health: ctx.health.clone(),
            reported_allocations: 0,
        }
    }

    fn sync_allocations(&mut self) {
        while self.reported_allocations < self.buffer.allocations() {
            self.health.record_allocation();
            self.reported_allocations += 1;
        }
    }
}

impl Drop for StreamResources {
    fn drop(&mut self) {
        let buffer = self.buffer.release();
        let context = self.converter.release();
        self.health.record_release();
        debug!(
            "Released stream resources (buffer: {}, scale context: {})",
            buffer, context
        );
        // source and decoder close when the fields drop
    }
}

#[derive(Default)]
struct DecodeCursor {
    sequence: u64,
    consecutive_convert_failures: u32,
}

/// Thread entry point. Never panics, never returns an error: the outcome is
/// written to the shared state and, on failure, to the mailbox.
pub(crate) fn run(ctx: WorkerContext) {
    info!("Stream {} worker started for {}", ctx.tag(), ctx.locator);

    let result = match panic::catch_unwind(AssertUnwindSafe(|| decode_session(&ctx))) {
        Ok(result) => result,
        Err(payload) => Err(PipelineError::decode(format!(
            "worker panicked: {}",
            panic_message(&*payload)
        ))),
    };

    finish(&ctx, result);
}

/// Record the outcome of a run in the shared state and the mailbox
fn finish(ctx: &WorkerContext, result: Result<WorkerExit, PipelineError>) {
    match result {
        Ok(exit) => {
            ctx.state.transition_if(PipelineState::is_active, PipelineState::Stopping);
            ctx.state.transition(PipelineState::Stopped);
            info!("Stream {} stopped: {:?}", ctx.tag(), exit);
        }
        Err(err) => {
            if !ctx.keep_alive.cancelled()
                && ctx.state.transition(PipelineState::Failed { stage: err.stage })
            {
                error!("Stream {} failed: {}", ctx.tag(), err);
                ctx.mailbox.post_error(ErrorRecord::new(ctx.id, &err));
                return;
            }
            // raised while tearing down on request, or a stop landed after the
            // check and Stopping rejected Failed
            debug!("Stream {} error during stop: {}", ctx.tag(), err);
            ctx.state.transition_if(PipelineState::is_active, PipelineState::Stopping);
            ctx.state.transition(PipelineState::Stopped);
        }
    }
}

fn decode_session(ctx: &WorkerContext) -> Result<WorkerExit, PipelineError> {
    ctx.state.transition(PipelineState::Opening);

    let Some(media) = open_with_retry(ctx)? else {
        return Ok(WorkerExit::StopRequested);
    };
    let mut resources = StreamResources::new(media, ctx);

    if ctx.locator.is_live() {
        resources.source.begin_playback().map_err(PipelineError::open)?;
    }

    let started = PipelineState::Streaming {
        started_at: Instant::now(),
    };
    if !ctx.state.transition_if(|state| *state == PipelineState::Opening, started) {
        // stop arrived while opening
        return Ok(WorkerExit::StopRequested);
    }

    let info = resources.source.stream_info().clone();
    info!(
        "Stream {} streaming {} {}x{}",
        ctx.tag(),
        info.codec,
        info.width,
        info.height
    );

    let mut cursor = DecodeCursor::default();
    loop {
        if ctx.keep_alive.cancelled() {
            return Ok(WorkerExit::StopRequested);
        }

        let packet = match resources.source.read_packet() {
            Ok(Some(packet)) => packet,
            Ok(None) => break,
            Err(e) => return Err(PipelineError::demux(e)),
        };
        if packet.stream_index != info.index {
            continue;
        }

        match resources.decoder.send_packet(packet) {
            Ok(()) => {}
            Err(e) if e.is_transient() => {
                ctx.health.record_decoder_stall();
                trace!("Stream {} decoder: {}", ctx.tag(), e);
            }
            Err(e) => return Err(PipelineError::decode(e)),
        }

        if let Some(exit) = drain_frames(ctx, &mut resources, &mut cursor)? {
            return Ok(exit);
        }
    }

    debug!("Stream {} reached end of source", ctx.tag());
    match resources.decoder.flush() {
        Ok(()) => {
            if let Some(exit) = drain_frames(ctx, &mut resources, &mut cursor)? {
                return Ok(exit);
            }
        }
        Err(e) => debug!("Stream {} flush: {}", ctx.tag(), e),
    }

    Ok(WorkerExit::EndOfStream)
}

/// Convert and publish every frame the decoder has ready
fn drain_frames(
    ctx: &WorkerContext,
    res: &mut StreamResources,
    cursor: &mut DecodeCursor,
) -> Result<Option<WorkerExit>, PipelineError> {
    loop {
        let frame = match res.decoder.receive_frame() {
            Ok(Some(frame)) => frame,
            Ok(None) => return Ok(None),
            Err(e) if e.is_transient() => return Ok(None),
            Err(e) => return Err(PipelineError::decode(e)),
        };
        ctx.health.record_decoded();

        if ctx.keep_alive.cancelled() {
            return Ok(Some(WorkerExit::StopRequested));
        }

        match res.converter.convert(&frame, &mut res.buffer) {
            Ok(desc) => {
                res.sync_allocations();
                cursor.consecutive_convert_failures = 0;

                let converted = ConvertedFrame {
                    width: desc.width,
                    height: desc.height,
                    stride: desc.stride,
                    format: desc.format,
                    sequence: cursor.sequence,
                    pts: frame.pts,
                    data: Bytes::copy_from_slice(&res.buffer.as_slice()[..desc.byte_len]),
                };
                cursor.sequence += 1;

                if ctx.keep_alive.cancelled() {
                    return Ok(Some(WorkerExit::StopRequested));
                }
                ctx.mailbox.post_frame(converted);
            }
            Err(err) if err.stage == Stage::Convert => {
                res.sync_allocations();
                cursor.consecutive_convert_failures += 1;
                ctx.health.record_convert_failure();
                warn!("Stream {} skipped frame: {}", ctx.tag(), err.message);

                if cursor.consecutive_convert_failures >= ctx.settings.max_convert_failures {
                    return Err(PipelineError::convert(format!(
                        "{} consecutive frames failed to convert, last: {}",
                        cursor.consecutive_convert_failures, err.message
                    )));
                }
            }
            Err(err) => return Err(err),
        }
    }
}

/// `Ok(None)` when stopped while connecting
fn open_with_retry(ctx: &WorkerContext) -> Result<Option<OpenedMedia>, PipelineError> {
    let attempts = if ctx.locator.is_live() {
        ctx.settings.open_retries + 1
    } else {
        1
    };
    let mut backoff = ctx.settings.open_backoff;
    let mut attempt = 1;

    loop {
        if ctx.keep_alive.cancelled() {
            return Ok(None);
        }

        match ctx.backend.open(&ctx.locator, &ctx.settings.open) {
            Ok(media) => {
                debug!("Stream {} opened {:?}", ctx.tag(), media);
                return Ok(Some(media));
            }
            Err(e) if attempt >= attempts => {
                return Err(PipelineError::open(format!("{}: {}", ctx.locator, e)));
            }
            Err(e) => {
                warn!(
                    "Stream {} open attempt {}/{} failed: {}, retrying in {:?}",
                    ctx.tag(),
                    attempt,
                    attempts,
                    e,
                    backoff
                );
                if ctx.keep_alive.wait_timeout(backoff) {
                    return Ok(None);
                }
                backoff = (backoff * 2).min(ctx.settings.max_backoff);
                attempt += 1;
            }
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::delivery::DeliveryHub;
    use crate::media::testing::ScriptedBackend;

    fn context(hub: &DeliveryHub) -> WorkerContext {
        let id = StreamId::new();
        let health = Arc::new(StreamHealth::new());
        WorkerContext {
            id,
            index: 0,
            locator: SourceLocator::parse("rtsp://cam.invalid/live").unwrap(),
            backend: Arc::new(ScriptedBackend::new()),
            settings: Arc::new(PipelineSettings::default()),
            keep_alive: SignalOfStop::new(),
            state: SharedState::new(),
            mailbox: hub.register(id, health.clone()),
            health,
        }
    }

    #[test]
    fn test_error_is_reported_as_failure() {
        let hub = DeliveryHub::new(1);
        let ctx = context(&hub);
        ctx.state.transition(PipelineState::Opening);

        finish(&ctx, Err(PipelineError::demux("read timed out")));

        assert_eq!(ctx.state.get(), PipelineState::Failed { stage: Stage::Demux });
        assert_eq!(ctx.mailbox.pending(), 1);
    }

    #[test]
    fn test_error_racing_a_stop_ends_stopped() {
        let hub = DeliveryHub::new(1);
        let ctx = context(&hub);
        ctx.state.transition(PipelineState::Opening);
        // the owner moved the state before the worker saw its keep-alive cleared
        ctx.state.transition(PipelineState::Stopping);

        finish(&ctx, Err(PipelineError::demux("connection reset")));

        assert_eq!(ctx.state.get(), PipelineState::Stopped);
        assert_eq!(ctx.mailbox.pending(), 0);
    }

    #[test]
    fn test_error_after_cancel_is_not_reported() {
        let hub = DeliveryHub::new(1);
        let ctx = context(&hub);
        ctx.state.transition(PipelineState::Opening);
        ctx.keep_alive.cancel();

        finish(&ctx, Err(PipelineError::decode("flush failed")));

        assert_eq!(ctx.state.get(), PipelineState::Stopped);
        assert_eq!(ctx.mailbox.pending(), 0);
    }
}
