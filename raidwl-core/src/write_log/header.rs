// vim: tw=80
//! On-disk write log slot headers
//!
//! Each participating position stores its own copy of the header in the first
//! block of the slot.  The common fields are identical in every copy; `lba`,
//! `blocks`, and `csum_of_csums` describe that position's shadow data.

use crate::{
    block,
    geometry::StripeRange,
    types::*,
    util::*,
};
use serde_derive::{Deserialize, Serialize};

pub const HEADER_VERSION: u32 = 1;

/// Mixed into every checksum-of-checksums, so that an all-zero slot never
/// validates.
const CSUM_SEED: u16 = 0x5a17;

#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub enum HeaderState {
    /// The slot's shadow data has been, or is being, written
    Valid,
    /// The slot was invalidated after its live write completed
    Invalid,
}

#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct SlotHeader {
    pub version: u32,
    pub state: HeaderState,
    /// Strictly increasing for each use of any slot
    pub generation: u64,
    pub start_lba: LbaT,
    pub xfer_count: BlockCountT,
    pub parity_start: LbaT,
    pub parity_count: BlockCountT,
    /// Every position written by the request
    pub write_bitmap: PosBitmap,
    /// First live drive LBA journaled by this position
    pub lba: LbaT,
    pub blocks: BlockCountT,
    pub csum_of_csums: u16,
}

/// Result of decoding one header block
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum HeaderRead {
    /// All zeros: the slot was never written on this position
    Blank,
    Ok(SlotHeader),
    /// Unreadable: bad checksum, bad stamp, or undecodable contents
    Corrupt,
}

/// XOR of every block's stored checksum, and the seed
pub fn csum_of_csums(buf: &[u8]) -> u16 {
    buf.chunks_exact(BYTES_PER_BLOCK)
        .map(block::stored_crc)
        .fold(CSUM_SEED, |acc, c| acc ^ c)
}

impl SlotHeader {
    pub fn new(generation: u64, range: &StripeRange, write_bitmap: PosBitmap,
               lba: LbaT, data: &[u8]) -> Self
    {
        SlotHeader {
            version: HEADER_VERSION,
            state: HeaderState::Valid,
            generation,
            start_lba: range.start_lba,
            xfer_count: range.xfer_count,
            parity_start: range.parity_start,
            parity_count: range.parity_count,
            write_bitmap,
            lba,
            blocks: (data.len() / BYTES_PER_BLOCK) as BlockCountT,
            csum_of_csums: csum_of_csums(data),
        }
    }

    /// An invalidation header.  It carries no range.
    pub fn invalid(generation: u64) -> Self {
        SlotHeader {
            version: HEADER_VERSION,
            state: HeaderState::Invalid,
            generation,
            start_lba: 0,
            xfer_count: 0,
            parity_start: 0,
            parity_count: 0,
            write_bitmap: PosBitmap::EMPTY,
            lba: 0,
            blocks: 0,
            csum_of_csums: 0,
        }
    }

    /// Do two copies describe the same request?
    pub fn agrees(&self, other: &SlotHeader) -> bool {
        self.generation == other.generation &&
            self.start_lba == other.start_lba &&
            self.xfer_count == other.xfer_count &&
            self.parity_start == other.parity_start &&
            self.parity_count == other.parity_count &&
            self.write_bitmap == other.write_bitmap
    }

    /// The live range this header protects
    pub fn range(&self, row_blocks: BlockCountT) -> StripeRange {
        StripeRange {
            row: self.start_lba / row_blocks,
            start_lba: self.start_lba,
            xfer_count: self.xfer_count,
            parity_start: self.parity_start,
            parity_count: self.parity_count,
        }
    }

    /// Serialize into one sealed block, stamped with its own drive LBA.
    pub fn encode(&self, block_lba: LbaT) -> Result<Vec<u8>> {
        let mut blk = vec![0u8; BYTES_PER_BLOCK];
        let bytes = bincode::serialize(self)?;
        if bytes.len() > DATA_BYTES_PER_BLOCK {
            return Err(Error::Serialization);
        }
        blk[..bytes.len()].copy_from_slice(&bytes);
        block::seal(&mut blk);
        block::stamp_lba(&mut blk, block_lba);
        Ok(blk)
    }

    pub fn decode(blk: &[u8], block_lba: LbaT) -> HeaderRead {
        if blk.iter().all(|b| *b == 0) {
            return HeaderRead::Blank;
        }
        if block::check_data(blk, block_lba) != block::BlockCheck::Ok {
            return HeaderRead::Corrupt;
        }
        match bincode::deserialize::<SlotHeader>(&blk[..DATA_BYTES_PER_BLOCK])
        {
            Ok(h) if h.version == HEADER_VERSION => HeaderRead::Ok(h),
            _ => HeaderRead::Corrupt
        }
    }
}

// LCOV_EXCL_STOP
