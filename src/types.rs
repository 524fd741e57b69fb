use serde::{Deserialize, Serialize, Serializer};

/// Pixel layouts a frame source may hand to the pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[non_exhaustive]
pub enum PixelFormat {
    /// Planar YUV 4:2:0: a full-resolution Y plane followed by U and V
    /// planes at half resolution in both dimensions.
    I420,
    /// Packed, interleaved 8-bit RGBA.
    Rgba,
}

impl PixelFormat {
    /// Number of planes a frame of this format carries.
    pub const fn plane_count(self) -> usize {
        match self {
            Self::I420 => 3,
            Self::Rgba => 1,
        }
    }
}

/// Pixel dimensions of a frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Size {
    pub width: u32,
    pub height: u32,
}

impl Size {
    pub const fn new(width: u32, height: u32) -> Self {
        Size { width, height }
    }

    pub const fn is_empty(&self) -> bool {
        self.width == 0 || self.height == 0
    }
}

/// Clockwise rotation a consumer has to apply to display a frame upright.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Rotation {
    #[default]
    Deg0,
    Deg90,
    Deg180,
    Deg270,
}

impl Rotation {
    /// Map a rotation in degrees to one of the four quadrants.
    ///
    /// Negative and over-range values are normalised (`-90` is `Deg270`,
    /// `450` is `Deg90`); anything that is not a multiple of 90 is `None`.
    pub const fn from_degrees(degrees: i32) -> Option<Self> {
        match degrees.rem_euclid(360) {
            0 => Some(Self::Deg0),
            90 => Some(Self::Deg90),
            180 => Some(Self::Deg180),
            270 => Some(Self::Deg270),
            _ => None,
        }
    }

    pub const fn degrees(self) -> u16 {
        match self {
            Self::Deg0 => 0,
            Self::Deg90 => 90,
            Self::Deg180 => 180,
            Self::Deg270 => 270,
        }
    }
}

impl Serialize for Rotation {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u16(self.degrees())
    }
}

/// Which stage of the media path a pipeline observes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TapKind {
    /// Planar frames straight off the media track, center-cropped to the
    /// target. Payloads carry the frame rotation.
    #[default]
    Track,
    /// Packed RGBA frames from a rendering surface, letterboxed into the
    /// target.
    Render,
}

/// Most pixels a target may have: one 7680x4320 frame.
pub const MAX_TARGET_PIXELS: u64 = 7680 * 4320;

/// Output geometry and rate of one running pipeline.
///
/// Fixed for the lifetime of the pipeline; a different size or rate means
/// starting a new one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TargetDescriptor {
    size: Size,
    fps: u32,
    output_len: usize,
}

impl TargetDescriptor {
    /// Returns `None` if any of the three values is zero or the target has
    /// more than [`MAX_TARGET_PIXELS`] pixels.
    pub const fn new(width: u32, height: u32, fps: u32) -> Option<Self> {
        if width == 0 || height == 0 || fps == 0 {
            return None;
        }
        let pixels = width as u64 * height as u64;
        if pixels > MAX_TARGET_PIXELS {
            return None;
        }
        Some(TargetDescriptor {
            size: Size { width, height },
            fps,
            output_len: pixels as usize * crate::convert::RGB_BYTES_PER_PIXEL,
        })
    }

    pub const fn size(&self) -> Size {
        self.size
    }

    pub const fn width(&self) -> u32 {
        self.size.width
    }

    pub const fn height(&self) -> u32 {
        self.size.height
    }

    pub const fn fps(&self) -> u32 {
        self.fps
    }

    /// Length in bytes of one packed RGB output frame.
    pub const fn output_len(&self) -> usize {
        self.output_len
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rotation_normalises_degrees() {
        assert_eq!(Rotation::from_degrees(0), Some(Rotation::Deg0));
        assert_eq!(Rotation::from_degrees(-90), Some(Rotation::Deg270));
        assert_eq!(Rotation::from_degrees(450), Some(Rotation::Deg90));
        assert_eq!(Rotation::from_degrees(45), None);
        assert_eq!(Rotation::Deg180.degrees(), 180);
    }

    #[test]
    fn target_descriptor_rejects_zero_values() {
        assert!(TargetDescriptor::new(0, 480, 30).is_none());
        assert!(TargetDescriptor::new(640, 0, 30).is_none());
        assert!(TargetDescriptor::new(640, 480, 0).is_none());

        let target = TargetDescriptor::new(640, 480, 15).unwrap();
        assert_eq!(target.size(), Size::new(640, 480));
        assert_eq!(target.fps(), 15);
        assert_eq!(target.output_len(), 640 * 480 * 3);
    }

    #[test]
    fn target_descriptor_rejects_oversized_targets() {
        assert!(TargetDescriptor::new(7680, 4320, 30).is_some());
        assert!(TargetDescriptor::new(7681, 4320, 30).is_none());
        assert!(TargetDescriptor::new(u32::MAX, u32::MAX, 1).is_none());
        // long and thin is fine as long as the pixel count fits
        let strip = TargetDescriptor::new(1_000_000, 1, 1).unwrap();
        assert_eq!(strip.output_len(), 3_000_000);
    }
}
