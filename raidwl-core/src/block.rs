// vim: tw=80
//! On-disk block format
//!
//! Every block is 512 bytes of data followed by 8 bytes of metadata:
//!
//! | offset | size | field         |
//! |--------|------|---------------|
//! | 512    | 2    | `crc`         |
//! | 514    | 2    | `lba_stamp`   |
//! | 516    | 4    | `write_stamp` |
//!
//! Data blocks are stamped with their own live LBA.  Parity blocks are stamped
//! with the XOR of the LBA stamps of the data blocks in their row, which lets
//! a reader cross-check parity against the geometry.

use crate::{types::*, util::*};
use metrohash::MetroHash64;
use std::hash::Hasher;

/// `write_stamp` value of a block that was deliberately invalidated because
/// its contents could not be reconstructed.
pub const INVALIDATED_MARKER: u32 = 0x494e_5644;

const CRC_OFFSET: usize = DATA_BYTES_PER_BLOCK;
const STAMP_OFFSET: usize = DATA_BYTES_PER_BLOCK + 2;
const WSTAMP_OFFSET: usize = DATA_BYTES_PER_BLOCK + 4;

/// Result of checking a single block's metadata
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum BlockCheck {
    Ok,
    /// The stored checksum does not match the data
    BadCrc,
    /// The checksum is fine, but the block belongs to a different LBA
    BadLbaStamp,
    /// Deliberately invalidated by a previous recovery-verify
    Invalidated,
}

impl BlockCheck {
    pub fn is_err(&self) -> bool {
        matches!(self, BlockCheck::BadCrc | BlockCheck::BadLbaStamp)
    }
}

/// Compute the 16-bit checksum of a block's data portion.
pub fn crc(data: &[u8]) -> u16 {
    debug_assert_eq!(data.len(), DATA_BYTES_PER_BLOCK);
    let mut hasher = MetroHash64::new();
    hasher.write(data);
    let h = hasher.finish();
    (h ^ (h >> 16) ^ (h >> 32) ^ (h >> 48)) as u16
}

/// Fold a live LBA into the 16-bit stamp stored with its data.
pub fn lba_stamp(lba: LbaT) -> u16 {
    (lba ^ (lba >> 16) ^ (lba >> 32) ^ (lba >> 48)) as u16
}

pub fn stored_crc(block: &[u8]) -> u16 {
    u16::from_le_bytes([block[CRC_OFFSET], block[CRC_OFFSET + 1]])
}

pub fn stored_lba_stamp(block: &[u8]) -> u16 {
    u16::from_le_bytes([block[STAMP_OFFSET], block[STAMP_OFFSET + 1]])
}

pub fn stored_write_stamp(block: &[u8]) -> u32 {
    let mut b = [0u8; 4];
    b.copy_from_slice(&block[WSTAMP_OFFSET..WSTAMP_OFFSET + 4]);
    u32::from_le_bytes(b)
}

fn set_crc(block: &mut [u8], crc: u16) {
    block[CRC_OFFSET..CRC_OFFSET + 2].copy_from_slice(&crc.to_le_bytes());
}

fn set_lba_stamp(block: &mut [u8], stamp: u16) {
    block[STAMP_OFFSET..STAMP_OFFSET + 2].copy_from_slice(&stamp.to_le_bytes());
}

fn set_write_stamp(block: &mut [u8], ws: u32) {
    block[WSTAMP_OFFSET..WSTAMP_OFFSET + 4].copy_from_slice(&ws.to_le_bytes());
}

/// Recompute a block's checksum, as a host would before submitting it.
pub fn seal(block: &mut [u8]) {
    let c = crc(&block[..DATA_BYTES_PER_BLOCK]);
    set_crc(block, c);
}

/// Stamp a data block with its destination LBA.  The checksum is left alone:
/// it covers only the data portion.
pub fn stamp_lba(block: &mut [u8], lba: LbaT) {
    set_lba_stamp(block, lba_stamp(lba));
}

/// Seal a freshly computed parity block.
pub fn seal_parity(block: &mut [u8], row_stamp: u16) {
    seal(block);
    set_lba_stamp(block, row_stamp);
    set_write_stamp(block, 0);
}

/// Overwrite a block with the invalidated pattern.
pub fn invalidate(block: &mut [u8], lba: LbaT) {
    block[..DATA_BYTES_PER_BLOCK].fill(0xdb);
    let c = crc(&block[..DATA_BYTES_PER_BLOCK]);
    // Deliberately wrong, so readers outside the write engine fail it.
    set_crc(block, !c);
    set_lba_stamp(block, lba_stamp(lba));
    set_write_stamp(block, INVALIDATED_MARKER);
}

fn check(block: &[u8], stamp: u16) -> BlockCheck {
    let c = crc(&block[..DATA_BYTES_PER_BLOCK]);
    if stored_crc(block) != c {
        if stored_write_stamp(block) == INVALIDATED_MARKER {
            BlockCheck::Invalidated
        } else {
            BlockCheck::BadCrc
        }
    } else if stored_lba_stamp(block) != stamp {
        BlockCheck::BadLbaStamp
    } else {
        BlockCheck::Ok
    }
}

/// Check a data block read from live LBA `lba`.
pub fn check_data(block: &[u8], lba: LbaT) -> BlockCheck {
    check(block, lba_stamp(lba))
}

/// Check a parity block against the expected row stamp.
pub fn check_parity(block: &[u8], row_stamp: u16) -> BlockCheck {
    check(block, row_stamp)
}

/// Check only the checksum of a block.  Used for host supplied data, which
/// has not been stamped yet.
pub fn check_crc(block: &[u8]) -> bool {
    stored_crc(block) == crc(&block[..DATA_BYTES_PER_BLOCK])
}

/// Build `blocks` sealed host blocks whose data bytes are all `fill`.
pub fn host_blocks(blocks: usize, fill: u8) -> Vec<u8> {
    let mut v = vec![0u8; blocks * BYTES_PER_BLOCK];
    for b in v.chunks_exact_mut(BYTES_PER_BLOCK) {
        b[..DATA_BYTES_PER_BLOCK].fill(fill);
        seal(b);
    }
    v
}

/// Build `blocks` valid data blocks stamped for consecutive LBAs starting at
/// `lba`, filled with zeros.  This is what a freshly initialized drive holds.
pub fn zeroed_blocks(lba: LbaT, blocks: usize) -> Vec<u8> {
    let mut v = vec![0u8; blocks * BYTES_PER_BLOCK];
    for (i, b) in v.chunks_exact_mut(BYTES_PER_BLOCK).enumerate() {
        seal(b);
        stamp_lba(b, lba + i as LbaT);
    }
    v
}

// LCOV_EXCL_STOP
