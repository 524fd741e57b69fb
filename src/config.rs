use serde::Deserialize;

use crate::attach::RetryPolicy;
use crate::geometry::CropFallback;
use crate::pool::MIN_RING_SLOTS;

/// Tunables shared by every pipeline a controller starts.
///
/// Deserializes from a partial map; anything missing keeps its default.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Scratch canvases in the conversion ring, clamped to 2..=8.
    pub ring_slots: usize,
    pub retry: RetryPolicy,
    pub crop_fallback: CropFallback,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        PipelineConfig {
            ring_slots: MIN_RING_SLOTS,
            retry: RetryPolicy::default(),
            crop_fallback: CropFallback::default(),
        }
    }
}
