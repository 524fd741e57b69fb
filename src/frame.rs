use arrayvec::ArrayVec;
use core::time::Duration;

use crate::types::{PixelFormat, Rotation, Size};

/// A single plane of image data.
#[derive(Debug, Clone, Copy)]
pub struct Plane<'a> {
    pub data: &'a [u8],
    pub bytes_per_row: usize,
}

impl<'a> Plane<'a> {
    pub const fn new(data: &'a [u8], bytes_per_row: usize) -> Self {
        Plane {
            data,
            bytes_per_row,
        }
    }
}

/// A borrowed video frame. Only valid for the duration of the observer
/// callback it was passed to; implementations must not be retained.
pub trait Frame {
    fn pixel_format(&self) -> PixelFormat;
    fn size(&self) -> Size;
    /// Y, U, V for [`PixelFormat::I420`]; a single plane for
    /// [`PixelFormat::Rgba`].
    fn planes(&self) -> &[Plane<'_>];
    /// Capture time on the source's clock.
    fn timestamp(&self) -> Duration;
    fn rotation(&self) -> Rotation {
        Rotation::Deg0
    }
}

/// A [`Frame`] over memory the caller already owns.
///
/// Frame sources that receive raw pointers or byte slices from a capture
/// API can wrap them in this instead of implementing [`Frame`] themselves.
#[derive(Debug, Clone)]
pub struct BorrowedFrame<'a> {
    pixel_format: PixelFormat,
    size: Size,
    planes: ArrayVec<Plane<'a>, 3>,
    timestamp: Duration,
    rotation: Rotation,
}

impl<'a> BorrowedFrame<'a> {
    pub fn i420(size: Size, y: Plane<'a>, u: Plane<'a>, v: Plane<'a>, timestamp: Duration) -> Self {
        let mut planes = ArrayVec::new();
        planes.push(y);
        planes.push(u);
        planes.push(v);
        BorrowedFrame {
            pixel_format: PixelFormat::I420,
            size,
            planes,
            timestamp,
            rotation: Rotation::Deg0,
        }
    }

    pub fn rgba(size: Size, pixels: Plane<'a>, timestamp: Duration) -> Self {
        let mut planes = ArrayVec::new();
        planes.push(pixels);
        BorrowedFrame {
            pixel_format: PixelFormat::Rgba,
            size,
            planes,
            timestamp,
            rotation: Rotation::Deg0,
        }
    }

    pub fn with_rotation(mut self, rotation: Rotation) -> Self {
        self.rotation = rotation;
        self
    }
}

impl Frame for BorrowedFrame<'_> {
    fn pixel_format(&self) -> PixelFormat {
        self.pixel_format
    }

    fn size(&self) -> Size {
        self.size
    }

    fn planes(&self) -> &[Plane<'_>] {
        &self.planes
    }

    fn timestamp(&self) -> Duration {
        self.timestamp
    }

    fn rotation(&self) -> Rotation {
        self.rotation
    }
}
