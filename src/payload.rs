use serde::Serialize;

use crate::pool::PayloadBytes;
use crate::types::{Rotation, Size};

/// Format tag carried by every payload.
pub const PAYLOAD_FORMAT: &str = "RGB";

/// One converted frame as handed to the consumer.
///
/// Serializes to the wire shape consumers expect: `bytes`, `width`,
/// `height`, `srcW`, `srcH`, `ts_us`, `format` and, for track taps only,
/// `rotation` in clockwise degrees.
#[derive(Debug, Serialize)]
pub struct Payload {
    /// Packed RGB, row-major, `width * height * 3` bytes.
    pub bytes: PayloadBytes,
    pub width: u32,
    pub height: u32,
    #[serde(rename = "srcW")]
    pub src_width: u32,
    #[serde(rename = "srcH")]
    pub src_height: u32,
    /// Capture timestamp in microseconds.
    #[serde(rename = "ts_us")]
    pub timestamp_us: u64,
    pub format: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rotation: Option<Rotation>,
}

impl Payload {
    pub fn size(&self) -> Size {
        Size::new(self.width, self.height)
    }

    pub fn source_size(&self) -> Size {
        Size::new(self.src_width, self.src_height)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn payload(rotation: Option<Rotation>) -> Payload {
        Payload {
            bytes: PayloadBytes::from(vec![1, 2, 3]),
            width: 1,
            height: 1,
            src_width: 4,
            src_height: 2,
            timestamp_us: 1_500,
            format: PAYLOAD_FORMAT,
            rotation,
        }
    }

    #[test]
    fn serializes_to_wire_shape() {
        let value = serde_json::to_value(payload(Some(Rotation::Deg270))).unwrap();
        assert_eq!(
            value,
            serde_json::json!({
                "bytes": [1, 2, 3],
                "width": 1,
                "height": 1,
                "srcW": 4,
                "srcH": 2,
                "ts_us": 1500,
                "format": "RGB",
                "rotation": 270,
            })
        );
    }

    #[test]
    fn rotation_is_omitted_when_absent() {
        let value = serde_json::to_value(payload(None)).unwrap();
        assert!(value.get("rotation").is_none());
        assert_eq!(value["srcW"], 4);
    }
}
