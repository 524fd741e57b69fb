//! Starting and stopping taps on behalf of a host.
//!
//! [`StreamController`] owns at most one running [`FramePipeline`]. Hosts
//! that talk in method calls with marshalled arguments can go through
//! [`StreamController::handle`] with a deserialized [`ControlCommand`].

use std::fmt;
use std::sync::Arc;

use parking_lot::Mutex;
use serde::de::IgnoredAny;
use serde::{Deserialize, Deserializer, Serialize};

use crate::attach::{AttachState, FrameSource};
use crate::config::PipelineConfig;
use crate::delivery::{DeliveryContext, SinkHandle};
use crate::error::StartError;
use crate::pipeline::{FramePipeline, PipelineBuilder, PipelineStats};
use crate::throttle::Clock;
use crate::types::{TapKind, TargetDescriptor};

/// Something frames can be tapped from, such as a video view.
pub trait CaptureTarget: Send + Sync {
    /// Planar frames straight off the attached media track, if any.
    fn track(&self) -> Option<Arc<dyn FrameSource>>;

    /// Rendered RGBA output, if the target renders.
    fn render_output(&self) -> Option<Arc<dyn FrameSource>>;
}

impl<T: CaptureTarget + ?Sized> CaptureTarget for Arc<T> {
    fn track(&self) -> Option<Arc<dyn FrameSource>> {
        (**self).track()
    }

    fn render_output(&self) -> Option<Arc<dyn FrameSource>> {
        (**self).render_output()
    }
}

/// Host-side lookup of capture targets by id.
pub trait TargetRegistry: Send + Sync {
    type Target: CaptureTarget;

    fn target(&self, id: i64) -> Option<Self::Target>;
}

/// Arguments of a start call as a host marshals them. Every field is
/// optional here and validated by [`StreamController::start_stream`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct StartRequest {
    pub target_id: Option<i64>,
    pub width: Option<i64>,
    pub height: Option<i64>,
    pub fps: Option<i64>,
    pub tap: TapKind,
}

impl StartRequest {
    pub fn new(target_id: i64, width: i64, height: i64, fps: i64) -> Self {
        StartRequest {
            target_id: Some(target_id),
            width: Some(width),
            height: Some(height),
            fps: Some(fps),
            tap: TapKind::default(),
        }
    }

    pub fn with_tap(mut self, tap: TapKind) -> Self {
        self.tap = tap;
        self
    }

    /// The target id and output descriptor, if all arguments are present
    /// and in range.
    pub fn validate(&self) -> Result<(i64, TargetDescriptor), StartError> {
        let Some(target_id) = self.target_id else {
            return Err(StartError::InvalidArgs("missing targetId"));
        };
        let width = positive(self.width, "width must be a positive integer")?;
        let height = positive(self.height, "height must be a positive integer")?;
        let fps = positive(self.fps, "fps must be a positive integer")?;
        let Some(descriptor) = TargetDescriptor::new(width, height, fps) else {
            return Err(StartError::InvalidArgs("target exceeds 7680x4320 pixels"));
        };
        Ok((target_id, descriptor))
    }
}

fn positive(value: Option<i64>, reason: &'static str) -> Result<u32, StartError> {
    value
        .filter(|&v| v > 0)
        .and_then(|v| u32::try_from(v).ok())
        .ok_or(StartError::InvalidArgs(reason))
}

/// A control call.
///
/// Deserializes from `{"method": "...", "args": {...}}`. A `startStream`
/// without usable `args` carries an empty request, which then fails
/// validation. Any other method parses as [`ControlCommand::Unknown`],
/// whatever its `args`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlCommand {
    StartStream(StartRequest),
    StopStream,
    Unknown,
}

impl<'de> Deserialize<'de> for ControlCommand {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        #[derive(Deserialize)]
        struct Call {
            method: String,
            #[serde(default)]
            args: Option<Args>,
        }

        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Args {
            Start(StartRequest),
            Other(#[allow(dead_code)] IgnoredAny),
        }

        let call = Call::deserialize(deserializer)?;
        let command = match (call.method.as_str(), call.args) {
            ("startStream", Some(Args::Start(request))) => ControlCommand::StartStream(request),
            ("startStream", _) => ControlCommand::StartStream(StartRequest::default()),
            ("stopStream", _) => ControlCommand::StopStream,
            _ => ControlCommand::Unknown,
        };
        Ok(command)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "camelCase")]
pub enum ControlResponse {
    Success { value: bool },
    Error { code: &'static str, message: String },
    NotImplemented,
}

impl From<Result<(), StartError>> for ControlResponse {
    fn from(result: Result<(), StartError>) -> Self {
        match result {
            Ok(()) => ControlResponse::Success { value: true },
            Err(e) => ControlResponse::Error {
                code: e.code(),
                message: e.to_string(),
            },
        }
    }
}

/// Starts and stops the single tap a host exposes.
pub struct StreamController<R> {
    registry: R,
    sink: SinkHandle,
    context: Arc<dyn DeliveryContext>,
    config: PipelineConfig,
    clock: Option<Arc<dyn Clock>>,
    active: Mutex<Option<FramePipeline>>,
}

impl<R: TargetRegistry> StreamController<R> {
    pub fn new(
        registry: R,
        sink: SinkHandle,
        context: Arc<dyn DeliveryContext>,
        config: PipelineConfig,
    ) -> Self {
        StreamController {
            registry,
            sink,
            context,
            config,
            clock: None,
            active: Mutex::new(None),
        }
    }

    /// Clock handed to every pipeline this controller starts.
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    /// The handle the host sets and clears as its consumer comes and goes.
    pub fn sink(&self) -> &SinkHandle {
        &self.sink
    }

    pub fn registry(&self) -> &R {
        &self.registry
    }

    /// Start a tap, replacing any running one.
    ///
    /// Nothing is registered with any source unless this returns `Ok`. A
    /// previous stream is stopped once the new target has been found, even
    /// if that target then turns out to have no media.
    pub fn start_stream(&self, request: &StartRequest) -> Result<(), StartError> {
        if !self.sink.is_set() {
            return Err(StartError::NoSink);
        }
        let (target_id, descriptor) = request.validate()?;
        let target = self
            .registry
            .target(target_id)
            .ok_or(StartError::NoSource(target_id))?;

        let mut active = self.active.lock();
        if let Some(previous) = active.take() {
            log::debug!("replacing running stream");
            previous.stop();
        }

        let source = match request.tap {
            TapKind::Track => target.track(),
            TapKind::Render => target.render_output(),
        }
        .ok_or(StartError::NoTrack(target_id))?;

        let context = Arc::clone(&self.context);
        let mut builder = PipelineBuilder::new(descriptor, self.sink.clone(), context)
            .tap(request.tap)
            .config(self.config);
        if let Some(clock) = &self.clock {
            builder = builder.clock(Arc::clone(clock));
        }
        *active = Some(builder.start(source));
        Ok(())
    }

    /// Stop the running tap, if any.
    pub fn stop_stream(&self) {
        let previous = self.active.lock().take();
        if let Some(pipeline) = previous {
            pipeline.stop();
        }
    }

    pub fn is_streaming(&self) -> bool {
        self.active.lock().is_some()
    }

    pub fn state(&self) -> Option<AttachState> {
        self.active.lock().as_ref().map(FramePipeline::state)
    }

    pub fn stats(&self) -> Option<PipelineStats> {
        self.active.lock().as_ref().map(FramePipeline::stats)
    }

    /// Stop any stream and forget the consumer. For host teardown.
    pub fn shutdown(&self) {
        self.stop_stream();
        self.sink.clear();
        log::info!("stream controller shut down");
    }

    pub fn handle(&self, command: ControlCommand) -> ControlResponse {
        match command {
            ControlCommand::StartStream(request) => {
                let result = self.start_stream(&request);
                if let Err(e) = &result {
                    log::debug!("startStream failed: {e}");
                }
                result.into()
            }
            ControlCommand::StopStream => {
                self.stop_stream();
                ControlResponse::Success { value: true }
            }
            ControlCommand::Unknown => ControlResponse::NotImplemented,
        }
    }
}

impl<R> fmt::Debug for StreamController<R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StreamController")
            .field("sink", &self.sink)
            .field("config", &self.config)
            .field("active", &self.active.lock().as_ref())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::delivery::PumpedContext;
    use crate::error::SinkError;
    use crate::payload::Payload;
    use crate::throttle::ManualClock;
    use serde_json::json;

    struct NoTargets;

    impl TargetRegistry for NoTargets {
        type Target = Arc<dyn CaptureTarget>;

        fn target(&self, _: i64) -> Option<Self::Target> {
            None
        }
    }

    fn controller() -> StreamController<NoTargets> {
        let context = Arc::new(PumpedContext::new(Arc::new(ManualClock::new())));
        let config = PipelineConfig::default();
        StreamController::new(NoTargets, SinkHandle::new(), context, config)
    }

    fn parse(value: serde_json::Value) -> ControlCommand {
        serde_json::from_value(value).unwrap()
    }

    fn listen(controller: &StreamController<NoTargets>) {
        controller
            .sink()
            .set(Arc::new(|_: Payload| -> Result<(), SinkError> { Ok(()) }));
    }

    #[test]
    fn parses_commands() {
        let start = parse(json!({
            "method": "startStream",
            "args": { "targetId": 4, "width": 320, "height": 240, "fps": 15, "tap": "render" },
        }));
        let expected = StartRequest::new(4, 320, 240, 15).with_tap(TapKind::Render);
        assert_eq!(start, ControlCommand::StartStream(expected));

        let stop = parse(json!({ "method": "stopStream" }));
        assert_eq!(stop, ControlCommand::StopStream);

        let other = parse(json!({ "method": "setVolume" }));
        assert_eq!(other, ControlCommand::Unknown);
    }

    #[test]
    fn start_without_args_is_an_argument_error() {
        let controller = controller();
        listen(&controller);
        let empty = ControlCommand::StartStream(StartRequest::default());

        for bare in [
            json!({ "method": "startStream" }),
            json!({ "method": "startStream", "args": null }),
            json!({ "method": "startStream", "args": 7 }),
        ] {
            let command = parse(bare);
            assert_eq!(command, empty);
            match controller.handle(command) {
                ControlResponse::Error { code, .. } => assert_eq!(code, "INVALID_ARGS"),
                other => panic!("unexpected response {other:?}"),
            }
        }
        assert!(!controller.is_streaming());
    }

    #[test]
    fn unknown_methods_with_args_are_not_implemented() {
        let controller = controller();
        for call in [
            json!({ "method": "captureFrame", "args": { "x": 1 } }),
            json!({ "method": "setVolume", "args": [0.5] }),
            json!({ "method": "setMuted", "args": true, "id": 12 }),
        ] {
            let command = parse(call);
            assert_eq!(command, ControlCommand::Unknown);
            assert_eq!(controller.handle(command), ControlResponse::NotImplemented);
        }
        let headless = serde_json::from_value::<ControlCommand>(json!({ "args": {} }));
        assert!(headless.is_err());
    }

    #[test]
    fn missing_arguments_parse_and_fail_validation() {
        let request: StartRequest =
            serde_json::from_value(json!({ "targetId": 1, "width": 10 })).unwrap();
        assert_eq!(request.height, None);
        assert_eq!(request.tap, TapKind::Track);
        assert_eq!(request.validate().unwrap_err().code(), "INVALID_ARGS");

        for bad in [
            StartRequest::new(1, 0, 10, 10),
            StartRequest::new(1, 10, -1, 10),
            StartRequest::new(1, 10, 10, 0),
            StartRequest::new(1, 1 << 40, 10, 10),
        ] {
            assert!(
                matches!(bad.validate(), Err(StartError::InvalidArgs(_))),
                "{bad:?}"
            );
        }
        let (id, descriptor) = StartRequest::new(9, 64, 48, 30).validate().unwrap();
        assert_eq!(id, 9);
        assert_eq!(
            (descriptor.width(), descriptor.height(), descriptor.fps()),
            (64, 48, 30)
        );
    }

    #[test]
    fn oversized_targets_are_argument_errors() {
        for huge in [
            StartRequest::new(1, 4_000_000_000, 4_000_000_000, 1),
            StartRequest::new(1, 4_000_000_000, 1, 1),
            StartRequest::new(1, 7681, 4320, 30),
        ] {
            assert_eq!(
                huge.validate(),
                Err(StartError::InvalidArgs("target exceeds 7680x4320 pixels")),
                "{huge:?}"
            );
        }
        let (_, largest) = StartRequest::new(1, 7680, 4320, 60).validate().unwrap();
        assert_eq!(largest.output_len(), 7680 * 4320 * 3);

        let controller = controller();
        listen(&controller);
        let huge = StartRequest::new(1, 4_000_000_000, 4_000_000_000, 1);
        match controller.handle(ControlCommand::StartStream(huge)) {
            ControlResponse::Error { code, .. } => assert_eq!(code, "INVALID_ARGS"),
            other => panic!("unexpected response {other:?}"),
        }
        assert!(!controller.is_streaming());
    }

    #[test]
    fn checks_the_sink_before_the_arguments() {
        let controller = controller();
        let bad = StartRequest::default();
        assert_eq!(controller.start_stream(&bad), Err(StartError::NoSink));

        listen(&controller);
        assert!(matches!(
            controller.start_stream(&bad),
            Err(StartError::InvalidArgs(_))
        ));
        assert_eq!(
            controller.start_stream(&StartRequest::new(3, 4, 4, 4)),
            Err(StartError::NoSource(3))
        );
        assert!(!controller.is_streaming());
    }

    #[test]
    fn responses_serialize_with_a_status_tag() {
        let controller = controller();
        let start = ControlCommand::StartStream(StartRequest::new(1, 2, 2, 1));
        let response = controller.handle(start);
        assert_eq!(
            serde_json::to_value(&response).unwrap(),
            json!({
                "status": "error",
                "code": "NO_SINK",
                "message": "no frame sink is listening",
            })
        );

        let response = controller.handle(ControlCommand::StopStream);
        assert_eq!(
            serde_json::to_value(&response).unwrap(),
            json!({ "status": "success", "value": true })
        );

        let response = controller.handle(ControlCommand::Unknown);
        assert_eq!(
            serde_json::to_value(&response).unwrap(),
            json!({ "status": "notImplemented" })
        );
    }

    #[test]
    fn shutdown_clears_the_sink() {
        let controller = controller();
        listen(&controller);
        controller.shutdown();
        controller.stop_stream();
        assert!(!controller.sink().is_set());
    }
}
