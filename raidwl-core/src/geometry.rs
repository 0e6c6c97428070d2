// vim: tw=80
//! RAID group geometry: where host blocks, parity, and the write log live.

use crate::{
    block,
    config::GroupConfig,
    types::*,
    util::*,
};
use std::ops::Range;

/// Number of header blocks at the start of every write log slot
pub const HEADER_BLOCKS: BlockCountT = 1;

/// Placement of one stripe row's positions.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct StripeLayout {
    /// Data positions, in data-index order
    pub data: Vec<PosT>,
    /// Parity positions: P, then Q for RAID-6
    pub parity: Vec<PosT>,
}

impl StripeLayout {
    /// Data index of `pos`, if it holds data in this row.
    pub fn data_index(&self, pos: PosT) -> Option<usize> {
        self.data.iter().position(|p| *p == pos)
    }

    /// Index of `pos` among the parity positions, if it holds parity.
    pub fn parity_index(&self, pos: PosT) -> Option<usize> {
        self.parity.iter().position(|p| *p == pos)
    }

    pub fn is_parity(&self, pos: PosT) -> bool {
        self.parity.contains(&pos)
    }
}

/// The per-stripe-row piece of a host write.
///
/// `parity_start..parity_start + parity_count` is the drive LBA range that
/// covers the write on every written data position.  Parity is read and
/// written over exactly that range.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct StripeRange {
    pub row: u64,
    /// First host LBA
    pub start_lba: LbaT,
    /// Number of host blocks
    pub xfer_count: BlockCountT,
    /// First drive LBA of the parity range
    pub parity_start: LbaT,
    pub parity_count: BlockCountT,
}

#[derive(Clone, Debug)]
pub struct RaidGeometry {
    width: u16,
    parity: u16,
    element_size: BlockCountT,
    alignment: BlockCountT,
    slot_count: u32,
    journal_start: LbaT,
}

impl RaidGeometry {
    pub fn new(cfg: &GroupConfig) -> Result<Self> {
        cfg.validate()?;
        let slot_blocks = cfg.element_size + HEADER_BLOCKS;
        let journal_start = cfg.drive_blocks -
            slot_blocks * u64::from(cfg.slot_count);
        Ok(RaidGeometry {
            width: cfg.width,
            parity: cfg.parity,
            element_size: cfg.element_size,
            alignment: cfg.alignment,
            slot_count: cfg.slot_count,
            journal_start
        })
    }

    pub fn alignment(&self) -> BlockCountT {
        self.alignment
    }

    pub fn data_disks(&self) -> u16 {
        self.width - self.parity
    }

    pub fn element_size(&self) -> BlockCountT {
        self.element_size
    }

    /// Number of host blocks the group can store.
    pub fn host_capacity(&self) -> LbaT {
        self.rows() * self.row_blocks()
    }

    pub fn parity_count(&self) -> u16 {
        self.parity
    }

    /// Host blocks per stripe row
    pub fn row_blocks(&self) -> BlockCountT {
        self.element_size * BlockCountT::from(self.data_disks())
    }

    /// Number of stripe rows that fit in front of the write log
    pub fn rows(&self) -> u64 {
        self.journal_start / self.element_size
    }

    pub fn width(&self) -> u16 {
        self.width
    }

    /// Left-symmetric placement of row `row`.
    pub fn layout(&self, row: u64) -> StripeLayout {
        let w = u64::from(self.width);
        let p = (w - 1 - row % w) as PosT;
        let parity = (0..self.parity)
            .map(|i| (p + i) % self.width)
            .collect::<Vec<_>>();
        let first_data = (p + self.parity) % self.width;
        let data = (0..self.data_disks())
            .map(|i| (first_data + i) % self.width)
            .collect::<Vec<_>>();
        StripeLayout{data, parity}
    }

    /// Host LBA stored at drive LBA `lba` of data index `idx`.
    pub fn host_lba(&self, idx: usize, lba: LbaT) -> LbaT {
        let row = lba / self.element_size;
        row * self.row_blocks() + idx as u64 * self.element_size +
            lba % self.element_size
    }

    /// Stamp expected on the parity blocks at drive LBA `lba`.
    pub fn row_stamp(&self, lba: LbaT) -> u16 {
        (0..self.data_disks() as usize)
            .map(|idx| block::lba_stamp(self.host_lba(idx, lba)))
            .fold(0, |acc, s| acc ^ s)
    }

    /// Split a host write into one `StripeRange` per row it touches.
    pub fn decompose(&self, start_lba: LbaT, blocks: BlockCountT)
        -> Result<Vec<StripeRange>>
    {
        let end = start_lba.checked_add(blocks).ok_or(Error::Sizing)?;
        if blocks == 0 || end > self.host_capacity() {
            return Err(Error::Sizing);
        }
        let rb = self.row_blocks();
        let mut ranges = Vec::new();
        let mut lba = start_lba;
        while lba < end {
            let row = lba / rb;
            let row_end = (row + 1) * rb;
            let xfer_count = end.min(row_end) - lba;
            ranges.push(self.stripe_range(lba, xfer_count));
            lba += xfer_count;
        }
        Ok(ranges)
    }

    fn stripe_range(&self, start_lba: LbaT, xfer_count: BlockCountT)
        -> StripeRange
    {
        let row = start_lba / self.row_blocks();
        let mut range = StripeRange {
            row,
            start_lba,
            xfer_count,
            parity_start: 0,
            parity_count: 0
        };
        let (lo, hi) = (0..self.data_disks() as usize)
            .filter_map(|idx| self.column_write(&range, idx))
            .fold((LbaT::MAX, 0), |(lo, hi), r| {
                (lo.min(r.start), hi.max(r.end))
            });
        range.parity_start = lo;
        range.parity_count = hi - lo;
        range
    }

    /// The drive range written on data index `idx` by `range`, if any.
    pub fn column_write(&self, range: &StripeRange, idx: usize)
        -> Option<Range<LbaT>>
    {
        let col_start = range.row * self.row_blocks() +
            idx as u64 * self.element_size;
        let col_end = col_start + self.element_size;
        let s = range.start_lba.max(col_start);
        let e = (range.start_lba + range.xfer_count).min(col_end);
        if s >= e {
            return None;
        }
        let base = range.row * self.element_size;
        Some(base + (s - col_start)..base + (e - col_start))
    }

    /// Does an I/O to `lba..lba+blocks` need to be widened to the physical
    /// alignment unit?
    pub fn needs_alignment(&self, lba: LbaT, blocks: BlockCountT) -> bool {
        self.alignment > 1 &&
            (lba % self.alignment != 0 || (lba + blocks) % self.alignment != 0)
    }

    /// Widen `lba..lba+blocks` to the physical alignment unit.
    pub fn align(&self, lba: LbaT, blocks: BlockCountT)
        -> Result<(LbaT, BlockCountT)>
    {
        let start = align_down(lba, self.alignment);
        let end = lba.checked_add(blocks).ok_or(Error::Sizing)?;
        let end = align_up(end, self.alignment)?;
        Ok((start, end - start))
    }

    /// The drive range covering `range` on every written position, widened
    /// to the alignment unit.
    pub fn parity_span(&self, range: &StripeRange) -> Result<Range<LbaT>> {
        let (lba, blocks) = self.align(range.parity_start, range.parity_count)?;
        Ok(lba..lba + blocks)
    }

    pub fn slot_blocks(&self) -> BlockCountT {
        self.element_size + HEADER_BLOCKS
    }

    pub fn slot_count(&self) -> u32 {
        self.slot_count
    }

    /// First drive LBA of write log slot `slot`
    pub fn slot_base(&self, slot: SlotT) -> Result<LbaT> {
        if slot >= self.slot_count {
            return Err(Error::InvalidSlot);
        }
        Ok(self.journal_start + u64::from(slot) * self.slot_blocks())
    }

    /// Drive LBA where the shadow copy of live block `lba` is journaled.
    ///
    /// Every position's shadow copy starts right after the slot header, so
    /// `extent_start` is the first live LBA that position journals.
    pub fn journal_lba(&self, slot: SlotT, extent_start: LbaT, lba: LbaT)
        -> Result<LbaT>
    {
        debug_assert!(lba >= extent_start);
        Ok(self.slot_base(slot)? + HEADER_BLOCKS + (lba - extent_start))
    }

    /// Inverse of `journal_lba`
    pub fn live_lba(&self, slot: SlotT, extent_start: LbaT, jlba: LbaT)
        -> Result<LbaT>
    {
        let data_base = self.slot_base(slot)? + HEADER_BLOCKS;
        if jlba < data_base {
            return Err(Error::InvalidSlot);
        }
        Ok(extent_start + (jlba - data_base))
    }
}

// LCOV_EXCL_STOP
