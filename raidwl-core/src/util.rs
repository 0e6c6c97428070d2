// vim: tw=80
//! Common utility functions used throughout the write engine

use crate::types::*;
use divbuf::DivBufShared;
use std::ops::{Add, Div, Sub};

/// Each block is 512 bytes of data followed by 8 bytes of metadata.
pub const BYTES_PER_BLOCK: usize = 520;

/// Length of the data portion of a block.
pub const DATA_BYTES_PER_BLOCK: usize = 512;

/// Marker trait for types that `div_roundup` may be used with.
pub trait RoundupAble {}
impl RoundupAble for u16 {}
impl RoundupAble for u32 {}
impl RoundupAble for u64 {}
impl RoundupAble for usize {}

/// Divide two unsigned numbers (usually integers), rounding up.
pub fn div_roundup<T>(dividend: T, divisor: T) -> T
    where T: Add<Output=T> + Copy + Div<Output=T> + From<u8> + RoundupAble +
             Sub<Output=T> {
    (dividend + divisor - T::from(1u8)) / divisor
}

/// Round `lba` down to a multiple of `alignment`.
pub fn align_down(lba: LbaT, alignment: BlockCountT) -> LbaT {
    lba - lba % alignment
}

/// Round `lba` up to a multiple of `alignment`, detecting overflow.
pub fn align_up(lba: LbaT, alignment: BlockCountT) -> Result<LbaT> {
    match lba % alignment {
        0 => Ok(lba),
        r => lba.checked_add(alignment - r).ok_or(Error::Sizing)
    }
}

/// Convert a block count to a byte count that must fit downstream `u32`
/// length fields.
pub fn blocks_to_bytes(blocks: BlockCountT) -> Result<u32> {
    blocks.checked_mul(BYTES_PER_BLOCK as u64)
        .and_then(|b| u32::try_from(b).ok())
        .ok_or(Error::Sizing)
}

/// Wrap an owned buffer as an `IoVec`.
pub fn iovec_from(v: Vec<u8>) -> IoVec {
    let dbs = DivBufShared::from(v);
    // A freshly created DivBufShared has no mutable references
    dbs.try_const().unwrap()
}

// LCOV_EXCL_START
#[cfg(test)]
/// Helper to generate the runtime used by most unit tests
pub fn basic_runtime() -> tokio::runtime::Runtime {
    tokio::runtime::Builder::new_current_thread()
        .enable_time()
        .build()
        .unwrap()
}

// LCOV_EXCL_STOP
