//! Planning of 3D pitched copies into `COPY_LINEAR_RECT` packets.
//!
//! Callers describe surfaces in bytes. The planner picks the widest element
//! size (4, 8 or 16 bytes) that divides every base, pitch, offset and width,
//! then tiles the rectangle so no packet exceeds the hardware extents. Each
//! tile carries an absolute base address and zero offsets.

use crate::packets::{
    CopyRectPacket, Dim3, RECT_MAX_PITCH, RECT_MAX_SLICE_PITCH, RECT_MAX_X, RECT_MAX_Y, RECT_MAX_Z,
};

/// A pitched surface: `pitch` bytes between rows, `slice_pitch` bytes between
/// slices. `slice_pitch` is ignored for single-slice copies.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct PitchedSurface {
    pub base: u64,
    pub pitch: u64,
    pub slice_pitch: u64,
}

/// Offsets are `x` in bytes, `y` in rows, `z` in slices; `extent` likewise.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RectCopy {
    pub dst: PitchedSurface,
    pub dst_offset: Dim3,
    pub src: PitchedSurface,
    pub src_offset: Dim3,
    pub extent: Dim3,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum RectCopyError {
    #[error("rect copy operands are not 4-byte aligned")]
    Misaligned,
    #[error("row pitch {pitch} bytes exceeds the engine limit")]
    PitchTooLarge { pitch: u64 },
    #[error("slice pitch {slice_pitch} bytes exceeds the engine limit")]
    SlicePitchTooLarge { slice_pitch: u64 },
    #[error("rect row of {bytes} bytes at x={x} overruns pitch {pitch}")]
    RowOverrun { x: u32, bytes: u32, pitch: u64 },
    #[error("rect rows overrun the slice pitch")]
    SliceOverrun,
}

const MIN_ELEMENT_LOG2: u32 = 2;
const MAX_ELEMENT_LOG2: u32 = 4;

impl RectCopy {
    pub fn is_empty(&self) -> bool {
        self.extent.volume() == 0
    }

    /// Widest element size dividing every byte quantity of the copy.
    pub fn element_log2(&self) -> Result<u32, RectCopyError> {
        let mut bits = self.dst.base
            | self.src.base
            | self.dst.pitch
            | self.src.pitch
            | u64::from(self.dst_offset.x)
            | u64::from(self.src_offset.x)
            | u64::from(self.extent.x);
        if self.extent.z > 1 {
            bits |= self.dst.slice_pitch | self.src.slice_pitch;
        }
        bits |= 1 << MAX_ELEMENT_LOG2;
        let log2 = bits.trailing_zeros();
        if log2 < MIN_ELEMENT_LOG2 {
            return Err(RectCopyError::Misaligned);
        }
        Ok(log2)
    }

    /// Split the copy into hardware-sized packets. An empty copy yields none.
    pub fn plan(&self) -> Result<Vec<CopyRectPacket>, RectCopyError> {
        if self.is_empty() {
            return Ok(Vec::new());
        }
        let log2 = self.element_log2()?;
        let elem = 1u64 << log2;

        let (src_pitch, src_slice) = surface_limits(&self.src, &self.src_offset, &self.extent, log2)?;
        let (dst_pitch, dst_slice) = surface_limits(&self.dst, &self.dst_offset, &self.extent, log2)?;

        let width = self.extent.x >> log2;
        let mut tiles = Vec::new();
        for z in (0..self.extent.z).step_by(RECT_MAX_Z as usize) {
            let depth = (self.extent.z - z).min(RECT_MAX_Z);
            for y in (0..self.extent.y).step_by(RECT_MAX_Y as usize) {
                let height = (self.extent.y - y).min(RECT_MAX_Y);
                for x in (0..width).step_by(RECT_MAX_X as usize) {
                    let cols = (width - x).min(RECT_MAX_X);
                    let at = Dim3::new(x, y, z);
                    tiles.push(CopyRectPacket {
                        element_log2: log2,
                        src_addr: tile_base(&self.src, &self.src_offset, &at, elem),
                        src_offset: Dim3::default(),
                        src_pitch,
                        src_slice_pitch: src_slice,
                        dst_addr: tile_base(&self.dst, &self.dst_offset, &at, elem),
                        dst_offset: Dim3::default(),
                        dst_pitch,
                        dst_slice_pitch: dst_slice,
                        rect: Dim3::new(cols, height, depth),
                    });
                }
            }
        }
        Ok(tiles)
    }
}

fn surface_limits(
    surface: &PitchedSurface,
    offset: &Dim3,
    extent: &Dim3,
    log2: u32,
) -> Result<(u32, u32), RectCopyError> {
    let row_end = u64::from(offset.x) + u64::from(extent.x);
    if extent.y > 1 && row_end > surface.pitch {
        return Err(RectCopyError::RowOverrun {
            x: offset.x,
            bytes: extent.x,
            pitch: surface.pitch,
        });
    }
    let pitch = (surface.pitch >> log2).max(1);
    if pitch > u64::from(RECT_MAX_PITCH) {
        return Err(RectCopyError::PitchTooLarge {
            pitch: surface.pitch,
        });
    }

    let slice = if extent.z > 1 {
        let rows_end = (u64::from(offset.y) + u64::from(extent.y)) * surface.pitch;
        if rows_end > surface.slice_pitch {
            return Err(RectCopyError::SliceOverrun);
        }
        let slice = surface.slice_pitch >> log2;
        if slice > u64::from(RECT_MAX_SLICE_PITCH) {
            return Err(RectCopyError::SlicePitchTooLarge {
                slice_pitch: surface.slice_pitch,
            });
        }
        slice
    } else {
        // Unused by the engine for a single slice; keep the field in range.
        (surface.slice_pitch >> log2).clamp(1, u64::from(RECT_MAX_SLICE_PITCH))
    };
    Ok((pitch as u32, slice as u32))
}

fn tile_base(surface: &PitchedSurface, offset: &Dim3, at: &Dim3, elem: u64) -> u64 {
    surface.base
        + u64::from(offset.z + at.z) * surface.slice_pitch
        + u64::from(offset.y + at.y) * surface.pitch
        + u64::from(offset.x)
        + u64::from(at.x) * elem
}
