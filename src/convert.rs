//! Conversion of I420 and RGBA frames into packed RGB.
//!
//! Output is 3 bytes per pixel, row-major, with rows exactly
//! `width * 3` bytes apart. Nothing here allocates; every function writes
//! into a caller-provided slice after validating that all reads and writes
//! stay in bounds.

use crate::frame::{Frame, Plane};
use crate::geometry::{Mapping, Rect};
use crate::types::{PixelFormat, Size};

pub const RGB_BYTES_PER_PIXEL: usize = 3;
const RGBA_BYTES_PER_PIXEL: usize = 4;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[non_exhaustive]
pub enum ConvertError {
    #[error("unsupported pixel format {0:?}")]
    UnsupportedFormat(PixelFormat),
    #[error("frame is missing plane {index}")]
    MissingPlane { index: usize },
    #[error("plane {index} holds {actual} bytes, {needed} required")]
    PlaneTooShort {
        index: usize,
        needed: usize,
        actual: usize,
    },
    #[error("plane {index} stride {stride} is narrower than a row ({row_bytes} bytes)")]
    StrideTooSmall {
        index: usize,
        stride: usize,
        row_bytes: usize,
    },
    #[error("source window {window:?} exceeds frame {frame:?}")]
    WindowOutOfBounds { window: Rect, frame: Size },
    #[error("output holds {actual} bytes, {needed} required")]
    OutputTooSmall { needed: usize, actual: usize },
}

/// The three planes of an I420 frame.
#[derive(Debug, Clone, Copy)]
pub struct I420Planes<'a> {
    pub y: Plane<'a>,
    pub u: Plane<'a>,
    pub v: Plane<'a>,
}

impl<'a> I420Planes<'a> {
    pub fn from_planes(planes: &[Plane<'a>]) -> Result<Self, ConvertError> {
        match planes {
            [y, u, v, ..] => Ok(I420Planes {
                y: *y,
                u: *u,
                v: *v,
            }),
            _ => Err(ConvertError::MissingPlane {
                index: planes.len(),
            }),
        }
    }
}

/// ITU-R BT.601 limited-range YUV to RGB, integer arithmetic.
#[inline]
pub fn yuv_to_rgb(y: u8, u: u8, v: u8) -> [u8; 3] {
    let c = (y as i32 - 16).max(0);
    let d = u as i32 - 128;
    let e = v as i32 - 128;

    let r = (298 * c + 409 * e + 128) >> 8;
    let g = (298 * c - 100 * d - 208 * e + 128) >> 8;
    let b = (298 * c + 516 * d + 128) >> 8;

    [clamp_u8(r), clamp_u8(g), clamp_u8(b)]
}

#[inline]
fn clamp_u8(value: i32) -> u8 {
    value.clamp(0, 255) as u8
}

/// Convert a whole I420 image of `width` x `height` into `out`.
pub fn i420_to_rgb(
    planes: &I420Planes<'_>,
    width: u32,
    height: u32,
    out: &mut [u8],
) -> Result<(), ConvertError> {
    let mapping = Mapping::identity(Size::new(width, height));
    check_output(&mapping.dst, width, out.len())?;
    check_i420(planes, &mapping.src)?;
    write_i420(planes, &mapping, out, width);
    Ok(())
}

/// Drop the alpha channel of a whole RGBA image of `width` x `height`.
pub fn rgba_to_rgb(
    pixels: &Plane<'_>,
    width: u32,
    height: u32,
    out: &mut [u8],
) -> Result<(), ConvertError> {
    let mapping = Mapping::identity(Size::new(width, height));
    check_output(&mapping.dst, width, out.len())?;
    check_rgba(pixels, &mapping.src)?;
    write_rgba(pixels, &mapping, out, width);
    Ok(())
}

/// Draw `mapping.src` of `frame` into `mapping.dst` of an RGB canvas
/// `canvas_width` pixels wide, resampling with nearest neighbour when the
/// two rectangles differ in size. Pixels outside `mapping.dst` are left
/// untouched.
pub fn convert_frame<F: Frame + ?Sized>(
    frame: &F,
    mapping: &Mapping,
    out: &mut [u8],
    canvas_width: u32,
) -> Result<(), ConvertError> {
    let size = frame.size();
    if !mapping.src.fits_within(size) {
        return Err(ConvertError::WindowOutOfBounds {
            window: mapping.src,
            frame: size,
        });
    }
    check_output(&mapping.dst, canvas_width, out.len())?;
    if mapping.src.is_empty() || mapping.dst.is_empty() {
        return Ok(());
    }

    let format = frame.pixel_format();
    let planes = frame.planes();
    if planes.len() < format.plane_count() {
        return Err(ConvertError::MissingPlane {
            index: planes.len(),
        });
    }

    match format {
        PixelFormat::I420 => {
            let planes = I420Planes::from_planes(planes)?;
            check_i420(&planes, &mapping.src)?;
            write_i420(&planes, mapping, out, canvas_width);
        }
        PixelFormat::Rgba => {
            check_rgba(&planes[0], &mapping.src)?;
            write_rgba(&planes[0], mapping, out, canvas_width);
        }
    }
    Ok(())
}

fn check_output(dst: &Rect, canvas_width: u32, len: usize) -> Result<(), ConvertError> {
    if dst.right() > canvas_width as u64 {
        return Err(ConvertError::OutputTooSmall {
            needed: dst.right() as usize * RGB_BYTES_PER_PIXEL,
            actual: canvas_width as usize * RGB_BYTES_PER_PIXEL,
        });
    }
    if dst.is_empty() {
        return Ok(());
    }
    let needed = ((dst.bottom() as usize - 1) * canvas_width as usize + dst.right() as usize)
        * RGB_BYTES_PER_PIXEL;
    if len < needed {
        return Err(ConvertError::OutputTooSmall {
            needed,
            actual: len,
        });
    }
    Ok(())
}

/// Check that `rows` rows of `row_bytes` bytes each can be read from
/// `plane`.
fn check_plane(
    plane: &Plane<'_>,
    index: usize,
    rows: usize,
    row_bytes: usize,
) -> Result<(), ConvertError> {
    if rows == 0 || row_bytes == 0 {
        return Ok(());
    }
    if plane.bytes_per_row < row_bytes {
        return Err(ConvertError::StrideTooSmall {
            index,
            stride: plane.bytes_per_row,
            row_bytes,
        });
    }
    let needed = (rows - 1) * plane.bytes_per_row + row_bytes;
    if plane.data.len() < needed {
        return Err(ConvertError::PlaneTooShort {
            index,
            needed,
            actual: plane.data.len(),
        });
    }
    Ok(())
}

fn check_i420(planes: &I420Planes<'_>, window: &Rect) -> Result<(), ConvertError> {
    if window.is_empty() {
        return Ok(());
    }
    let rows = window.bottom() as usize;
    let cols = window.right() as usize;
    check_plane(&planes.y, 0, rows, cols)?;
    let chroma_rows = (rows - 1) / 2 + 1;
    let chroma_cols = (cols - 1) / 2 + 1;
    check_plane(&planes.u, 1, chroma_rows, chroma_cols)?;
    check_plane(&planes.v, 2, chroma_rows, chroma_cols)
}

fn check_rgba(pixels: &Plane<'_>, window: &Rect) -> Result<(), ConvertError> {
    if window.is_empty() {
        return Ok(());
    }
    check_plane(
        pixels,
        0,
        window.bottom() as usize,
        window.right() as usize * RGBA_BYTES_PER_PIXEL,
    )
}

/// Source coordinate sampled for destination offset `d`, taken at the
/// centre of the destination pixel.
#[inline]
fn source_coord(origin: u32, src_len: u32, dst_len: u32, d: u32) -> usize {
    if src_len == dst_len {
        return (origin + d) as usize;
    }
    let offset = ((2 * d as u64 + 1) * src_len as u64) / (2 * dst_len as u64);
    origin as usize + offset as usize
}

#[inline]
fn canvas_row<'o>(out: &'o mut [u8], dst: &Rect, canvas_width: u32, dy: u32) -> &'o mut [u8] {
    let start =
        ((dst.y + dy) as usize * canvas_width as usize + dst.x as usize) * RGB_BYTES_PER_PIXEL;
    &mut out[start..start + dst.width as usize * RGB_BYTES_PER_PIXEL]
}

fn write_i420(planes: &I420Planes<'_>, mapping: &Mapping, out: &mut [u8], canvas_width: u32) {
    let (src, dst) = (&mapping.src, &mapping.dst);
    for dy in 0..dst.height {
        let sy = source_coord(src.y, src.height, dst.height, dy);
        let y_row = &planes.y.data[sy * planes.y.bytes_per_row..];
        let u_row = &planes.u.data[(sy / 2) * planes.u.bytes_per_row..];
        let v_row = &planes.v.data[(sy / 2) * planes.v.bytes_per_row..];

        let row = canvas_row(out, dst, canvas_width, dy);
        for (dx, px) in row.chunks_exact_mut(RGB_BYTES_PER_PIXEL).enumerate() {
            let sx = source_coord(src.x, src.width, dst.width, dx as u32);
            px.copy_from_slice(&yuv_to_rgb(y_row[sx], u_row[sx / 2], v_row[sx / 2]));
        }
    }
}

fn write_rgba(pixels: &Plane<'_>, mapping: &Mapping, out: &mut [u8], canvas_width: u32) {
    let (src, dst) = (&mapping.src, &mapping.dst);
    for dy in 0..dst.height {
        let sy = source_coord(src.y, src.height, dst.height, dy);
        let src_row = &pixels.data[sy * pixels.bytes_per_row..];
        let row = canvas_row(out, dst, canvas_width, dy);

        if mapping.is_unscaled() {
            let start = src.x as usize * RGBA_BYTES_PER_PIXEL;
            let src_px = src_row[start..].chunks_exact(RGBA_BYTES_PER_PIXEL);
            for (px, rgba) in row.chunks_exact_mut(RGB_BYTES_PER_PIXEL).zip(src_px) {
                px.copy_from_slice(&rgba[..RGB_BYTES_PER_PIXEL]);
            }
            continue;
        }

        for (dx, px) in row.chunks_exact_mut(RGB_BYTES_PER_PIXEL).enumerate() {
            let sx = source_coord(src.x, src.width, dst.width, dx as u32) * RGBA_BYTES_PER_PIXEL;
            px.copy_from_slice(&src_row[sx..sx + RGB_BYTES_PER_PIXEL]);
        }
    }
}
