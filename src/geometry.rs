//! Placement of a source frame on the fixed output canvas.
//!
//! Two policies exist. [`letterbox`] scales the whole source to fit the
//! canvas with its aspect ratio intact and centres it. [`center_crop`] cuts
//! a target-sized window out of the middle of the source without any
//! scaling, for sources already conditioned so that their smaller side
//! reaches the target. Both produce a [`Mapping`], which is all the pixel
//! converter looks at.

use serde::Deserialize;

use crate::types::{Size, TapKind};

/// An axis-aligned pixel rectangle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Rect {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
}

impl Rect {
    pub const fn new(x: u32, y: u32, width: u32, height: u32) -> Self {
        Rect {
            x,
            y,
            width,
            height,
        }
    }

    pub const fn from_size(size: Size) -> Self {
        Rect::new(0, 0, size.width, size.height)
    }

    pub const fn is_empty(&self) -> bool {
        self.width == 0 || self.height == 0
    }

    /// One past the last column, widened so it cannot overflow.
    pub const fn right(&self) -> u64 {
        self.x as u64 + self.width as u64
    }

    /// One past the last row, widened so it cannot overflow.
    pub const fn bottom(&self) -> u64 {
        self.y as u64 + self.height as u64
    }

    pub const fn fits_within(&self, size: Size) -> bool {
        self.right() <= size.width as u64 && self.bottom() <= size.height as u64
    }
}

/// A window of the source frame and the rectangle of the output canvas it
/// is drawn into. When both have the same dimensions no resampling happens.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Mapping {
    pub src: Rect,
    pub dst: Rect,
}

impl Mapping {
    /// Whole source onto a canvas of the same size.
    pub const fn identity(size: Size) -> Self {
        Mapping {
            src: Rect::from_size(size),
            dst: Rect::from_size(size),
        }
    }

    pub const fn is_unscaled(&self) -> bool {
        self.src.width == self.dst.width && self.src.height == self.dst.height
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum GeometryPolicy {
    Letterbox,
    CenterCrop,
}

impl TapKind {
    pub const fn geometry_policy(self) -> GeometryPolicy {
        match self {
            TapKind::Track => GeometryPolicy::CenterCrop,
            TapKind::Render => GeometryPolicy::Letterbox,
        }
    }
}

/// What the center-crop policy does with a source smaller than the target
/// in either dimension.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CropFallback {
    /// Pin the window to the source origin and copy what exists. The rest of
    /// the canvas stays black.
    Clamp,
    /// Scale the source into the canvas as [`letterbox`] would.
    #[default]
    Letterbox,
    /// Drop the frame.
    Reject,
}

/// Largest aspect-preserving rectangle of `src` that fits in `target`,
/// centred with symmetric padding.
///
/// Exactly one of the returned width and height equals the target's
/// (both when the aspect ratios match). Empty input yields an empty rect.
pub fn letterbox(src: Size, target: Size) -> Rect {
    if src.is_empty() || target.is_empty() {
        return Rect::default();
    }
    let (sw, sh) = (src.width as u64, src.height as u64);
    let (tw, th) = (target.width as u64, target.height as u64);

    // scale = min(tw / sw, th / sh), compared without division.
    let (draw_w, draw_h) = if tw * sh <= th * sw {
        (tw, div_round(sh * tw, sw).clamp(1, th))
    } else {
        (div_round(sw * th, sh).clamp(1, tw), th)
    };

    Rect::new(
        ((tw - draw_w) / 2) as u32,
        ((th - draw_h) / 2) as u32,
        draw_w as u32,
        draw_h as u32,
    )
}

/// Target-sized window centred in `src`.
///
/// The origin is clamped to `[0, src - target]`; when the source is smaller
/// than the target along an axis the window starts at 0 on that axis and is
/// only as long as the source.
pub fn center_crop(src: Size, target: Size) -> Rect {
    let (x, width) = crop_axis(src.width, target.width);
    let (y, height) = crop_axis(src.height, target.height);
    Rect::new(x, y, width, height)
}

fn crop_axis(src: u32, target: u32) -> (u32, u32) {
    match src.checked_sub(target) {
        Some(slack) => (slack / 2, target),
        None => (0, src),
    }
}

/// Resolve the mapping for one frame. `None` means the frame is dropped.
pub fn plan(
    policy: GeometryPolicy,
    fallback: CropFallback,
    src: Size,
    target: Size,
) -> Option<Mapping> {
    if src.is_empty() || target.is_empty() {
        return None;
    }
    let letterboxed = Mapping {
        src: Rect::from_size(src),
        dst: letterbox(src, target),
    };
    match policy {
        GeometryPolicy::Letterbox => Some(letterboxed),
        GeometryPolicy::CenterCrop => {
            let window = center_crop(src, target);
            if src.width >= target.width && src.height >= target.height {
                return Some(Mapping {
                    src: window,
                    dst: Rect::from_size(target),
                });
            }
            match fallback {
                CropFallback::Clamp => Some(Mapping {
                    src: window,
                    dst: Rect::new(0, 0, window.width, window.height),
                }),
                CropFallback::Letterbox => Some(letterboxed),
                CropFallback::Reject => None,
            }
        }
    }
}

/// `round(n / d)` with halves rounded up.
const fn div_round(n: u64, d: u64) -> u64 {
    (2 * n + d) / (2 * d)
}

#[cfg(test)]
mod tests {
    use super::*;

    const SIZES: [u32; 9] = [1, 2, 3, 17, 240, 320, 480, 641, 1920];

    #[test]
    fn letterbox_binds_exactly_one_dimension() {
        for &sw in &SIZES {
            for &sh in &SIZES {
                for &tw in &SIZES {
                    for &th in &SIZES {
                        let src = Size::new(sw, sh);
                        let target = Size::new(tw, th);
                        let draw = letterbox(src, target);
                        assert!(
                            draw.width <= tw && draw.height <= th,
                            "{src:?} -> {target:?}"
                        );
                        assert!(draw.fits_within(target));
                        assert!(
                            draw.width == tw || draw.height == th,
                            "{src:?} -> {target:?} gave {draw:?}"
                        );
                        // both bind only when the aspect ratios agree up to rounding
                        if draw.width == tw && draw.height == th {
                            let (a, b) = (sw as u64 * th as u64, sh as u64 * tw as u64);
                            assert!(a.abs_diff(b) <= (sw.max(sh) as u64) * 2);
                        }
                    }
                }
            }
        }
    }

    #[test]
    fn letterbox_centres_with_symmetric_padding() {
        let draw = letterbox(Size::new(1280, 720), Size::new(640, 640));
        assert_eq!(draw, Rect::new(0, 140, 640, 360));

        let draw = letterbox(Size::new(480, 640), Size::new(640, 640));
        assert_eq!(draw, Rect::new(80, 0, 480, 640));

        let draw = letterbox(Size::new(100, 100), Size::new(50, 50));
        assert_eq!(draw, Rect::new(0, 0, 50, 50));
    }

    #[test]
    fn crop_window_stays_inside_source() {
        for &sw in &SIZES {
            for &sh in &SIZES {
                for &tw in SIZES.iter().filter(|&&t| t <= sw) {
                    for &th in SIZES.iter().filter(|&&t| t <= sh) {
                        let window = center_crop(Size::new(sw, sh), Size::new(tw, th));
                        assert!(window.x <= sw - tw);
                        assert!(window.y <= sh - th);
                        assert_eq!((window.width, window.height), (tw, th));
                        assert!(window.fits_within(Size::new(sw, sh)));
                    }
                }
            }
        }
    }

    #[test]
    fn crop_is_centred() {
        let window = center_crop(Size::new(1280, 720), Size::new(640, 640));
        assert_eq!(window, Rect::new(320, 40, 640, 640));
    }

    #[test]
    fn undersized_source_follows_crop_fallback() {
        let src = Size::new(320, 720);
        let target = Size::new(640, 640);
        let crop = GeometryPolicy::CenterCrop;

        let clamped = plan(crop, CropFallback::Clamp, src, target).unwrap();
        assert_eq!(clamped.src, Rect::new(0, 40, 320, 640));
        assert_eq!(clamped.dst, Rect::new(0, 0, 320, 640));
        assert!(clamped.is_unscaled());

        let scaled = plan(crop, CropFallback::Letterbox, src, target).unwrap();
        assert_eq!(scaled.src, Rect::from_size(src));
        assert_eq!(scaled.dst, letterbox(src, target));

        assert!(plan(crop, CropFallback::Reject, src, target).is_none());
    }

    #[test]
    fn empty_source_is_never_planned() {
        let target = Size::new(64, 64);
        let (fit, crop) = (GeometryPolicy::Letterbox, GeometryPolicy::CenterCrop);
        let clamp = CropFallback::Clamp;
        assert!(plan(fit, clamp, Size::new(0, 10), target).is_none());
        assert!(plan(crop, clamp, Size::new(10, 0), target).is_none());
    }
}
