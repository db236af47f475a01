//! SDMA command packet formats.
//!
//! The SDMA (system DMA) engine consumes a ring of little-endian dwords. Each
//! command is a fixed-layout packet whose first dword carries the opcode in
//! bits 7:0 and the sub-opcode in bits 15:8. This crate contains:
//!
//! 1. **Layouts** ([`packets`]): `#[repr(C)]` packet structs plus pure encoders
//!    that serialize one packet into a caller-supplied dword slice.
//! 2. **Decoding** ([`decode`]): the inverse, used by the software engine and by
//!    tests to check what the hardware would see.
//! 3. **Rect planning** ([`rect`]): element-size selection and tiling of
//!    pitched 3D copies into hardware-sized packets.
//! 4. **Command building** ([`cmd_writer`]): a writer that streams packets into
//!    a [`PacketSink`] and knows their exact sizes, so a submission can size
//!    its ring reservation before encoding anything.
//!
//! Generation differences (index width, count-field bias, cache-invalidate
//! support) are expressed through the [`SdmaGeneration`] trait and resolved at
//! compile time.

#![forbid(unsafe_code)]

pub mod cmd_writer;
pub mod decode;
pub mod generation;
pub mod packets;
pub mod rect;

pub use cmd_writer::{PacketSink, SdmaCmdWriter};
pub use decode::{decode_command, SdmaCommand, SdmaDecodeError};
pub use generation::{SdmaGeneration, SdmaV2, SdmaV4, SdmaV5};
pub use packets::{CopyRectPacket, Dim3, GcrControl, HdpFlushRegisters, PollFunc, PollParams};
pub use rect::{PitchedSurface, RectCopy, RectCopyError};
