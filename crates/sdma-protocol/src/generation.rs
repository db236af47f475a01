//! Per-generation numeric conventions.
//!
//! SDMA engines across hardware generations share one packet vocabulary but
//! differ in a handful of conventions:
//!
//! | generation | hw ring pointers            | count field | GCR |
//! |------------|-----------------------------|-------------|-----|
//! | [`SdmaV2`] | 32-bit, ring-relative       | `bytes`     | no  |
//! | [`SdmaV4`] | 64-bit, monotonic           | `bytes - 1` | no  |
//! | [`SdmaV5`] | 64-bit, monotonic           | `bytes - 1` | yes |
//!
//! The marker types are uninhabited; they only parameterize generic code.

/// Width of the count field in copy and fill packets.
pub const COUNT_FIELD_MASK: u32 = 0x003F_FFFF;

pub trait SdmaGeneration: Send + Sync + 'static {
    const NAME: &'static str;

    /// `true` when the hardware read/write pointers are 64-bit byte indices
    /// that never wrap; `false` when they are 32-bit offsets taken modulo the
    /// ring size.
    const HW_INDEX_MONOTONIC: bool;

    /// Added to a byte count to form the hardware count field.
    const SIZE_TO_COUNT_OFFSET: i32;

    /// Whether the engine supports (and needs) a GCR cache invalidate after
    /// writes that other agents will consume.
    const USE_GCR: bool;

    const MAX_SINGLE_COPY_BYTES: u32 = 0x003F_FFE0;
    const MAX_SINGLE_FILL_BYTES: u32 = 0x003F_FFE0;

    /// Convert a monotonic software index into the value the hardware expects
    /// in its write pointer / doorbell.
    #[inline]
    fn hw_index(index: u64, ring_size: u64) -> u64 {
        if Self::HW_INDEX_MONOTONIC {
            index
        } else {
            u64::from((index % ring_size) as u32)
        }
    }

    #[inline]
    fn count_field(bytes: u32) -> u32 {
        bytes.wrapping_add_signed(Self::SIZE_TO_COUNT_OFFSET) & COUNT_FIELD_MASK
    }

    #[inline]
    fn bytes_from_count(count: u32) -> u32 {
        (count & COUNT_FIELD_MASK).wrapping_add_signed(-Self::SIZE_TO_COUNT_OFFSET)
    }
}

/// Volcanic Islands class engines (gfx8).
#[derive(Debug, Clone, Copy)]
pub enum SdmaV2 {}

/// Vega class engines (gfx9).
#[derive(Debug, Clone, Copy)]
pub enum SdmaV4 {}

/// Navi class engines (gfx10 and later).
#[derive(Debug, Clone, Copy)]
pub enum SdmaV5 {}

impl SdmaGeneration for SdmaV2 {
    const NAME: &'static str = "sdma-v2";
    const HW_INDEX_MONOTONIC: bool = false;
    const SIZE_TO_COUNT_OFFSET: i32 = 0;
    const USE_GCR: bool = false;
}

impl SdmaGeneration for SdmaV4 {
    const NAME: &'static str = "sdma-v4";
    const HW_INDEX_MONOTONIC: bool = true;
    const SIZE_TO_COUNT_OFFSET: i32 = -1;
    const USE_GCR: bool = false;
}

impl SdmaGeneration for SdmaV5 {
    const NAME: &'static str = "sdma-v5";
    const HW_INDEX_MONOTONIC: bool = true;
    const SIZE_TO_COUNT_OFFSET: i32 = -1;
    const USE_GCR: bool = true;
}
