//! Subscribing a pipeline to a frame source.
//!
//! A source may not be producing output yet when a stream starts. The
//! controller then arms the source's ready callback and also polls on a
//! fixed interval, because a ready notification that fires between the
//! readiness check and arming the callback would otherwise be missed.
//! Whichever path gets there first registers the observer; the state lock
//! makes sure it happens once.
//!
//! Sources with one-shot delivery drop their observer after each frame and
//! refuse registration from inside their own callback, so the controller
//! re-registers from the delivery context after every frame.

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;
use serde::Deserialize;

use crate::delivery::DeliveryContext;
use crate::error::SourceError;
use crate::frame::Frame;

/// Callback a source invokes, on its own thread, for every frame.
pub type FrameObserver = Arc<dyn Fn(&dyn Frame) + Send + Sync>;

/// One-time notification that a source started producing output.
pub type ReadyCallback = Box<dyn FnOnce() + Send + 'static>;

/// Whether a registered observer keeps receiving frames.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum DeliveryMode {
    #[default]
    Continuous,
    /// The observer is dropped by the source after one frame.
    OneShot,
}

/// A live media track or rendering surface frames can be observed on.
///
/// Sources hold at most one observer. Frames are delivered synchronously
/// on the source's own thread and must not be retained past the callback.
pub trait FrameSource: Send + Sync {
    /// Whether the source currently has output an observer would receive.
    fn is_ready(&self) -> bool;

    /// Install `observer`, replacing any previous one.
    fn register_observer(&self, observer: FrameObserver) -> Result<(), SourceError>;

    /// Remove the current observer. A no-op when there is none. Must not
    /// return while the observer is still executing on another thread.
    fn unregister_observer(&self);

    /// Call `callback` once when the source becomes ready.
    fn on_ready(&self, callback: ReadyCallback);

    /// Forget a callback passed to [`on_ready`](Self::on_ready).
    fn clear_on_ready(&self);

    fn delivery_mode(&self) -> DeliveryMode {
        DeliveryMode::Continuous
    }
}

/// How long to keep polling a source that is not ready yet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    pub interval_ms: u64,
    pub max_attempts: u32,
}

impl RetryPolicy {
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        RetryPolicy {
            interval_ms: 300,
            max_attempts: 10,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AttachState {
    Unattached,
    WaitingForFirstFrame,
    Attached,
    Stopped,
}

struct RetryToken {
    cancelled: AtomicBool,
}

impl RetryToken {
    fn new() -> Arc<Self> {
        Arc::new(RetryToken {
            cancelled: AtomicBool::new(false),
        })
    }

    fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }
}

struct ControlState {
    attach: AttachState,
    retry: Option<Arc<RetryToken>>,
}

struct Inner {
    source: Arc<dyn FrameSource>,
    context: Arc<dyn DeliveryContext>,
    policy: RetryPolicy,
    /// What actually gets registered: the pipeline's observer plus
    /// re-registration for one-shot sources.
    observer: FrameObserver,
    state: Mutex<ControlState>,
    attempts: AtomicU32,
}

impl Inner {
    /// Register the observer if still waiting. Called from the delivery
    /// context only.
    fn try_attach(self: &Arc<Self>, via: &str) -> bool {
        let mut state = self.state.lock();
        if state.attach != AttachState::WaitingForFirstFrame {
            return state.attach == AttachState::Attached;
        }
        if !self.source.is_ready() {
            return false;
        }
        if let Err(e) = self.source.register_observer(Arc::clone(&self.observer)) {
            log::warn!("frame source refused observer ({via}): {e}");
            return false;
        }
        state.attach = AttachState::Attached;
        if let Some(token) = state.retry.take() {
            token.cancel();
        }
        drop(state);
        self.source.clear_on_ready();
        log::info!("attached to frame source via {via}");
        true
    }

    fn schedule_retry(self: &Arc<Self>, token: Arc<RetryToken>) {
        let weak = Arc::downgrade(self);
        self.context.post_after(
            self.policy.interval(),
            Box::new(move || {
                if token.is_cancelled() {
                    return;
                }
                if let Some(inner) = weak.upgrade() {
                    inner.retry(token);
                }
            }),
        );
    }

    fn retry(self: &Arc<Self>, token: Arc<RetryToken>) {
        let attempt = self.attempts.fetch_add(1, Ordering::SeqCst) + 1;
        log::debug!("attach attempt {attempt}/{}", self.policy.max_attempts);
        if self.try_attach("retry") {
            return;
        }

        let mut state = self.state.lock();
        if state.attach != AttachState::WaitingForFirstFrame || token.is_cancelled() {
            return;
        }
        if attempt >= self.policy.max_attempts {
            state.retry = None;
            log::warn!(
                "source not ready after {attempt} attempts, waiting for its ready notification"
            );
            return;
        }
        drop(state);
        self.schedule_retry(token);
    }

    fn rearm(&self) {
        let state = self.state.lock();
        if state.attach != AttachState::Attached {
            return;
        }
        if let Err(e) = self.source.register_observer(Arc::clone(&self.observer)) {
            log::warn!("failed to re-register one-shot observer: {e}");
        }
    }
}

fn wrap_observer(observer: FrameObserver, mode: DeliveryMode, inner: Weak<Inner>) -> FrameObserver {
    match mode {
        DeliveryMode::Continuous => observer,
        DeliveryMode::OneShot => Arc::new(move |frame: &dyn Frame| {
            observer(frame);
            // registering from inside the source's callback is not allowed
            if let Some(strong) = inner.upgrade() {
                let weak = Arc::downgrade(&strong);
                strong.context.post(Box::new(move || {
                    if let Some(inner) = weak.upgrade() {
                        inner.rearm();
                    }
                }));
            }
        }),
    }
}

/// Keeps one observer subscribed to one frame source.
pub struct AttachmentController {
    inner: Arc<Inner>,
}

impl AttachmentController {
    pub fn new(
        source: Arc<dyn FrameSource>,
        observer: FrameObserver,
        context: Arc<dyn DeliveryContext>,
        policy: RetryPolicy,
    ) -> Self {
        let mode = source.delivery_mode();
        let inner = Arc::new_cyclic(|weak| Inner {
            observer: wrap_observer(observer, mode, weak.clone()),
            source,
            context,
            policy,
            state: Mutex::new(ControlState {
                attach: AttachState::Unattached,
                retry: None,
            }),
            attempts: AtomicU32::new(0),
        });
        AttachmentController { inner }
    }

    /// Subscribe now if the source is ready, otherwise wait for it. Only the
    /// first call has any effect.
    pub fn start(&self) {
        let inner = &self.inner;
        let mut state = inner.state.lock();
        if state.attach != AttachState::Unattached {
            return;
        }

        if inner.source.is_ready() {
            match inner.source.register_observer(Arc::clone(&inner.observer)) {
                Ok(()) => {
                    state.attach = AttachState::Attached;
                    log::info!("attached to frame source");
                    return;
                }
                Err(e) => log::warn!("frame source refused observer: {e}"),
            }
        }

        state.attach = AttachState::WaitingForFirstFrame;
        let token = RetryToken::new();
        state.retry = Some(Arc::clone(&token));
        log::debug!("frame source not ready, waiting for first frame");

        // armed under the lock so a concurrent stop() always sees it
        let weak = Arc::downgrade(inner);
        let context = Arc::clone(&inner.context);
        inner.source.on_ready(Box::new(move || {
            // may fire on any thread; attach from the delivery context
            context.post(Box::new(move || {
                if let Some(inner) = weak.upgrade() {
                    inner.try_attach("ready callback");
                }
            }));
        }));
        drop(state);
        inner.schedule_retry(token);
    }

    /// Unsubscribe and cancel anything pending. Safe to call in any state
    /// and any number of times.
    pub fn stop(&self) {
        let inner = &self.inner;
        let mut state = inner.state.lock();
        let previous = state.attach;
        if previous == AttachState::Stopped {
            return;
        }
        state.attach = AttachState::Stopped;
        if let Some(token) = state.retry.take() {
            token.cancel();
        }
        match previous {
            AttachState::Attached => inner.source.unregister_observer(),
            AttachState::WaitingForFirstFrame => inner.source.clear_on_ready(),
            AttachState::Unattached | AttachState::Stopped => {}
        }
        drop(state);
        log::debug!("detached from frame source (was {previous:?})");
    }

    pub fn state(&self) -> AttachState {
        self.inner.state.lock().attach
    }

    /// Whether a readiness poll is still pending.
    pub fn retry_scheduled(&self) -> bool {
        self.inner.state.lock().retry.is_some()
    }

    /// Readiness polls made so far.
    pub fn attempts(&self) -> u32 {
        self.inner.attempts.load(Ordering::SeqCst)
    }
}

impl fmt::Debug for AttachmentController {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AttachmentController")
            .field("state", &self.state())
            .field("attempts", &self.attempts())
            .finish()
    }
}

impl Drop for AttachmentController {
    fn drop(&mut self) {
        self.stop();
    }
}
