/// Reasons a stream could not be started.
///
/// Every variant maps to a stable wire code through [`StartError::code`].
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[non_exhaustive]
pub enum StartError {
    #[error("no frame sink is listening")]
    NoSink,
    #[error("invalid arguments: {0}")]
    InvalidArgs(&'static str),
    #[error("no capture target with id {0}")]
    NoSource(i64),
    #[error("capture target {0} has no live media attached")]
    NoTrack(i64),
}

impl StartError {
    pub const fn code(&self) -> &'static str {
        match self {
            Self::NoSink => "NO_SINK",
            Self::InvalidArgs(_) => "INVALID_ARGS",
            Self::NoSource(_) => "NO_SOURCE",
            Self::NoTrack(_) => "NO_TRACK",
        }
    }
}

/// Failure to register an observer with a frame source.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[non_exhaustive]
pub enum SourceError {
    #[error("frame source has no output yet")]
    NotReady,
    #[error("frame source already has an observer")]
    Occupied,
    #[error("frame source rejected the observer: {0}")]
    Rejected(String),
}

/// Failure reported by a consumer sink. Logged and dropped by the delivery
/// bridge.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[non_exhaustive]
pub enum SinkError {
    #[error("sink is closed")]
    Closed,
    #[error("sink rejected the frame: {0}")]
    Rejected(String),
}
