//! One running frame tap: throttle, geometry, conversion and hand-off,
//! wired to a frame source through an [`AttachmentController`].
//!
//! All per-frame work happens synchronously on the source's thread inside
//! [`FramePipeline::on_frame`]. The only thing that crosses threads is the
//! finished [`Payload`].

use std::fmt;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use parking_lot::Mutex;

use crate::attach::{AttachState, AttachmentController, FrameObserver, FrameSource};
use crate::config::PipelineConfig;
use crate::convert::convert_frame;
use crate::delivery::{DeliveryBridge, DeliveryContext, DeliveryStats, SinkHandle};
use crate::frame::Frame;
use crate::geometry::{CropFallback, GeometryPolicy, plan};
use crate::payload::{PAYLOAD_FORMAT, Payload};
use crate::pool::{BufferRing, PayloadRecycler};
use crate::throttle::{Clock, MonotonicClock, ThrottleGate};
use crate::types::{TapKind, TargetDescriptor};

/// Why [`FramePipeline::on_frame`] did not produce a payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[non_exhaustive]
pub enum DropReason {
    Stopped,
    /// A previous frame was still being converted.
    Busy,
    Throttled,
    EmptyFrame,
    /// Smaller than the target under [`CropFallback::Reject`].
    SourceTooSmall,
    ConversionFailed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FrameOutcome {
    Submitted,
    Dropped(DropReason),
}

/// Counters for one pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PipelineStats {
    /// Frames seen by [`FramePipeline::on_frame`].
    pub frames: u64,
    pub submitted: u64,
    pub busy: u64,
    pub throttled: u64,
    /// Empty, too small or failed conversion.
    pub rejected: u64,
    /// Scratch canvas allocations.
    pub scratch_allocations: u64,
    /// Payload storage allocations.
    pub payload_allocations: u64,
    pub delivery: DeliveryStats,
}

#[derive(Default)]
struct Counters {
    frames: AtomicU64,
    submitted: AtomicU64,
    busy: AtomicU64,
    throttled: AtomicU64,
    rejected: AtomicU64,
}

/// State only the frame currently being converted may touch.
struct FrameWorker {
    throttle: ThrottleGate,
    ring: BufferRing,
}

struct Shared {
    descriptor: TargetDescriptor,
    tap: TapKind,
    policy: GeometryPolicy,
    fallback: CropFallback,
    clock: Arc<dyn Clock>,
    running: AtomicBool,
    worker: Mutex<FrameWorker>,
    recycler: PayloadRecycler,
    bridge: DeliveryBridge,
    counters: Counters,
}

impl Shared {
    fn on_frame(&self, frame: &dyn Frame) -> FrameOutcome {
        self.counters.frames.fetch_add(1, Ordering::Relaxed);
        let outcome = self.process(frame);
        let counter = match outcome {
            FrameOutcome::Submitted => &self.counters.submitted,
            FrameOutcome::Dropped(DropReason::Busy) => &self.counters.busy,
            FrameOutcome::Dropped(DropReason::Throttled) => &self.counters.throttled,
            FrameOutcome::Dropped(DropReason::Stopped) => return outcome,
            FrameOutcome::Dropped(_) => &self.counters.rejected,
        };
        counter.fetch_add(1, Ordering::Relaxed);
        outcome
    }

    fn process(&self, frame: &dyn Frame) -> FrameOutcome {
        if !self.running.load(Ordering::SeqCst) {
            return FrameOutcome::Dropped(DropReason::Stopped);
        }
        let Some(mut worker) = self.worker.try_lock() else {
            log::trace!("conversion in progress, dropping frame");
            return FrameOutcome::Dropped(DropReason::Busy);
        };

        let src = frame.size();
        if src.is_empty() {
            log::trace!("dropping empty frame");
            return FrameOutcome::Dropped(DropReason::EmptyFrame);
        }
        let target = self.descriptor.size();
        let Some(mapping) = plan(self.policy, self.fallback, src, target) else {
            log::trace!(
                "dropping {}x{} frame, smaller than target",
                src.width,
                src.height
            );
            return FrameOutcome::Dropped(DropReason::SourceTooSmall);
        };

        if !worker.throttle.check(self.clock.now()) {
            return FrameOutcome::Dropped(DropReason::Throttled);
        }

        let mut slot = worker.ring.acquire(self.descriptor.output_len());
        slot.prepare(mapping.dst);
        let converted = catch_unwind(AssertUnwindSafe(|| {
            convert_frame(frame, &mapping, slot.bytes_mut(), target.width)
        }));
        match converted {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                log::warn!("dropping frame: {e}");
                return FrameOutcome::Dropped(DropReason::ConversionFailed);
            }
            Err(_) => {
                log::warn!("frame conversion panicked, dropping frame");
                return FrameOutcome::Dropped(DropReason::ConversionFailed);
            }
        }
        let bytes = self.recycler.copy_of(slot.bytes());
        slot.release();
        drop(worker);

        let rotation = match self.tap {
            TapKind::Track => Some(frame.rotation()),
            TapKind::Render => None,
        };
        self.bridge.submit(Payload {
            bytes,
            width: target.width,
            height: target.height,
            src_width: src.width,
            src_height: src.height,
            timestamp_us: frame.timestamp().as_micros() as u64,
            format: PAYLOAD_FORMAT,
            rotation,
        });
        FrameOutcome::Submitted
    }
}

/// Configures and starts a [`FramePipeline`].
pub struct PipelineBuilder {
    descriptor: TargetDescriptor,
    sink: SinkHandle,
    context: Arc<dyn DeliveryContext>,
    tap: TapKind,
    config: PipelineConfig,
    clock: Option<Arc<dyn Clock>>,
}

impl PipelineBuilder {
    pub fn new(
        descriptor: TargetDescriptor,
        sink: SinkHandle,
        context: Arc<dyn DeliveryContext>,
    ) -> Self {
        PipelineBuilder {
            descriptor,
            sink,
            context,
            tap: TapKind::default(),
            config: PipelineConfig::default(),
            clock: None,
        }
    }

    pub fn tap(mut self, tap: TapKind) -> Self {
        self.tap = tap;
        self
    }

    pub fn config(mut self, config: PipelineConfig) -> Self {
        self.config = config;
        self
    }

    /// Clock the throttle measures frame arrival with. Defaults to
    /// [`MonotonicClock`].
    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    /// Build the pipeline and subscribe it to `source`, now or once the
    /// source becomes ready.
    pub fn start(self, source: Arc<dyn FrameSource>) -> FramePipeline {
        let clock = self
            .clock
            .unwrap_or_else(|| Arc::new(MonotonicClock::new()) as Arc<dyn Clock>);
        let slots = self.config.ring_slots;
        let shared = Arc::new(Shared {
            descriptor: self.descriptor,
            tap: self.tap,
            policy: self.tap.geometry_policy(),
            fallback: self.config.crop_fallback,
            clock,
            running: AtomicBool::new(true),
            worker: Mutex::new(FrameWorker {
                throttle: ThrottleGate::new(self.descriptor.fps()),
                ring: BufferRing::new(slots),
            }),
            // one being filled, one queued, one at the consumer
            recycler: PayloadRecycler::new(slots + 1),
            bridge: DeliveryBridge::new(self.sink, Arc::clone(&self.context)),
            counters: Counters::default(),
        });

        let weak = Arc::downgrade(&shared);
        let observer: FrameObserver = Arc::new(move |frame: &dyn Frame| {
            if let Some(shared) = weak.upgrade() {
                shared.on_frame(frame);
            }
        });
        let attachment =
            AttachmentController::new(source, observer, self.context, self.config.retry);

        log::info!(
            "starting {:?} tap at {}x{} @ {} fps",
            self.tap,
            self.descriptor.width(),
            self.descriptor.height(),
            self.descriptor.fps()
        );
        attachment.start();
        FramePipeline { shared, attachment }
    }
}

/// A running frame tap. Stopped when dropped.
pub struct FramePipeline {
    shared: Arc<Shared>,
    attachment: AttachmentController,
}

impl FramePipeline {
    /// Process one frame. This is what the registered observer calls; it is
    /// public so hosts can also feed frames directly.
    pub fn on_frame(&self, frame: &dyn Frame) -> FrameOutcome {
        self.shared.on_frame(frame)
    }

    /// Stop producing and delivering frames. Safe to call repeatedly and
    /// while a frame is being processed on another thread.
    pub fn stop(&self) {
        let was_running = self.shared.running.swap(false, Ordering::SeqCst);
        self.shared.bridge.close();
        self.attachment.stop();
        if was_running {
            log::info!("stopped {:?} tap", self.shared.tap);
        }
    }

    pub fn is_running(&self) -> bool {
        self.shared.running.load(Ordering::SeqCst)
    }

    pub fn state(&self) -> AttachState {
        self.attachment.state()
    }

    pub fn attachment(&self) -> &AttachmentController {
        &self.attachment
    }

    pub fn descriptor(&self) -> TargetDescriptor {
        self.shared.descriptor
    }

    pub fn tap(&self) -> TapKind {
        self.shared.tap
    }

    /// Blocks while a frame is being converted.
    pub fn stats(&self) -> PipelineStats {
        let c = &self.shared.counters;
        let scratch_allocations = self.shared.worker.lock().ring.allocations();
        PipelineStats {
            frames: c.frames.load(Ordering::Relaxed),
            submitted: c.submitted.load(Ordering::Relaxed),
            busy: c.busy.load(Ordering::Relaxed),
            throttled: c.throttled.load(Ordering::Relaxed),
            rejected: c.rejected.load(Ordering::Relaxed),
            scratch_allocations,
            payload_allocations: self.shared.recycler.allocations(),
            delivery: self.shared.bridge.stats(),
        }
    }
}

impl fmt::Debug for FramePipeline {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FramePipeline")
            .field("tap", &self.shared.tap)
            .field("descriptor", &self.shared.descriptor)
            .field("running", &self.is_running())
            .field("delivering", &self.shared.bridge.is_open())
            .field("state", &self.state())
            .finish()
    }
}

impl Drop for FramePipeline {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::attach::{DeliveryMode, ReadyCallback};
    use crate::delivery::PumpedContext;
    use crate::error::{SinkError, SourceError};
    use crate::frame::{BorrowedFrame, Plane};
    use crate::throttle::ManualClock;
    use crate::types::{Rotation, Size};
    use std::time::Duration;

    /// Always ready, never calls back.
    struct IdleSource;

    impl FrameSource for IdleSource {
        fn is_ready(&self) -> bool {
            true
        }
        fn register_observer(&self, _: FrameObserver) -> Result<(), SourceError> {
            Ok(())
        }
        fn unregister_observer(&self) {}
        fn on_ready(&self, _: ReadyCallback) {}
        fn clear_on_ready(&self) {}
        fn delivery_mode(&self) -> DeliveryMode {
            DeliveryMode::Continuous
        }
    }

    struct Rig {
        clock: Arc<ManualClock>,
        context: Arc<PumpedContext>,
        delivered: Arc<Mutex<Vec<Payload>>>,
        pipeline: FramePipeline,
    }

    fn rig(tap: TapKind, width: u32, height: u32, config: PipelineConfig) -> Rig {
        let clock = Arc::new(ManualClock::new());
        let context = Arc::new(PumpedContext::new(clock.clone()));
        let delivered = Arc::new(Mutex::new(Vec::new()));
        let sink = SinkHandle::new();
        let store = Arc::clone(&delivered);
        sink.set(Arc::new(move |p: Payload| -> Result<(), SinkError> {
            store.lock().push(p);
            Ok(())
        }));
        let descriptor = TargetDescriptor::new(width, height, 10).unwrap();
        let pipeline = PipelineBuilder::new(descriptor, sink, context.clone())
            .tap(tap)
            .config(config)
            .clock(clock.clone())
            .start(Arc::new(IdleSource));
        Rig {
            clock,
            context,
            delivered,
            pipeline,
        }
    }

    fn rgba_frame(pixels: &[u8], width: u32, height: u32) -> BorrowedFrame<'_> {
        BorrowedFrame::rgba(
            Size::new(width, height),
            Plane::new(pixels, width as usize * 4),
            Duration::from_millis(5),
        )
    }

    #[test]
    fn render_tap_letterboxes_and_omits_rotation() {
        let r = rig(TapKind::Render, 4, 2, PipelineConfig::default());
        // 2x2 white into 4x2: drawn 2x2 at x=1
        let pixels = [255u8; 16];
        let frame = rgba_frame(&pixels, 2, 2).with_rotation(Rotation::Deg90);
        assert_eq!(r.pipeline.on_frame(&frame), FrameOutcome::Submitted);
        r.context.pump();

        let delivered = r.delivered.lock();
        let payload = &delivered[0];
        assert_eq!(payload.rotation, None);
        assert_eq!(payload.source_size(), Size::new(2, 2));
        assert_eq!(payload.timestamp_us, 5_000);
        for row in payload.bytes.chunks(12) {
            assert_eq!(row, &[0, 0, 0, 255, 255, 255, 255, 255, 255, 0, 0, 0]);
        }
    }

    #[test]
    fn busy_worker_drops_without_touching_the_throttle() {
        let r = rig(TapKind::Track, 1, 1, PipelineConfig::default());
        let pixels = [1u8, 2, 3, 4];
        let frame = rgba_frame(&pixels, 1, 1);

        let held = r.pipeline.shared.worker.lock();
        assert_eq!(
            r.pipeline.on_frame(&frame),
            FrameOutcome::Dropped(DropReason::Busy)
        );
        assert_eq!(held.throttle.last_accepted(), None);
        drop(held);

        assert_eq!(r.pipeline.on_frame(&frame), FrameOutcome::Submitted);
        assert_eq!(r.pipeline.stats().busy, 1);
    }

    #[test]
    fn throttles_to_the_target_rate() {
        let r = rig(TapKind::Track, 1, 1, PipelineConfig::default());
        let pixels = [0u8; 4];
        let frame = rgba_frame(&pixels, 1, 1);

        assert_eq!(r.pipeline.on_frame(&frame), FrameOutcome::Submitted);
        r.clock.advance(Duration::from_millis(99));
        assert_eq!(
            r.pipeline.on_frame(&frame),
            FrameOutcome::Dropped(DropReason::Throttled)
        );
        r.clock.advance(Duration::from_millis(1));
        assert_eq!(r.pipeline.on_frame(&frame), FrameOutcome::Submitted);
    }

    #[test]
    fn undersized_source_follows_the_crop_fallback() {
        let pixels = [7u8; 4];
        let frame = rgba_frame(&pixels, 1, 1);

        let reject = PipelineConfig {
            crop_fallback: CropFallback::Reject,
            ..PipelineConfig::default()
        };
        let r = rig(TapKind::Track, 2, 2, reject);
        assert_eq!(
            r.pipeline.on_frame(&frame),
            FrameOutcome::Dropped(DropReason::SourceTooSmall)
        );
        // a rejected frame does not use up the throttle interval
        let big = [7u8; 16];
        assert_eq!(
            r.pipeline.on_frame(&rgba_frame(&big, 2, 2)),
            FrameOutcome::Submitted
        );

        let clamp = PipelineConfig {
            crop_fallback: CropFallback::Clamp,
            ..PipelineConfig::default()
        };
        let r = rig(TapKind::Track, 2, 2, clamp);
        assert_eq!(r.pipeline.on_frame(&frame), FrameOutcome::Submitted);
        r.context.pump();
        assert_eq!(
            &*r.delivered.lock()[0].bytes,
            &[7, 7, 7, 0, 0, 0, 0, 0, 0, 0, 0, 0]
        );
    }

    #[test]
    fn malformed_frames_are_dropped() {
        let r = rig(TapKind::Track, 2, 2, PipelineConfig::default());
        let short = [0u8; 4];
        let frame = BorrowedFrame::rgba(Size::new(2, 2), Plane::new(&short, 8), Duration::ZERO);
        assert_eq!(
            r.pipeline.on_frame(&frame),
            FrameOutcome::Dropped(DropReason::ConversionFailed)
        );

        let empty = BorrowedFrame::rgba(Size::new(0, 2), Plane::new(&short, 0), Duration::ZERO);
        assert_eq!(
            r.pipeline.on_frame(&empty),
            FrameOutcome::Dropped(DropReason::EmptyFrame)
        );
        assert_eq!(r.pipeline.stats().rejected, 2);
    }

    #[test]
    fn stopped_pipeline_ignores_frames() {
        let r = rig(TapKind::Track, 1, 1, PipelineConfig::default());
        let pixels = [0u8; 4];
        r.pipeline.stop();
        r.pipeline.stop();
        assert!(!r.pipeline.is_running());
        assert!(!r.pipeline.shared.bridge.is_open());
        assert_eq!(r.pipeline.state(), AttachState::Stopped);
        assert_eq!(
            r.pipeline.on_frame(&rgba_frame(&pixels, 1, 1)),
            FrameOutcome::Dropped(DropReason::Stopped)
        );
    }
}
