// vim: tw=80
//! Resource planning
//!
//! Before a `StripeOp` issues any I/O, the planner decides which algorithm it
//! will use and computes every DriveOp, every buffer, and the number of pages
//! that will back them.  Planning is a pure function of a `RequestShape`, so
//! it can be repeated (after a position dies, for example) and always gives
//! the same answer for the same input.

use crate::{
    drive_op::PreRead,
    geometry::{RaidGeometry, StripeLayout, StripeRange, HEADER_BLOCKS},
    memory::{Carver, PageSize},
    types::*,
    util::*,
};
use serde_derive::Serialize;
use std::ops::Range;

/// Small-write parity update strategies
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq, Serialize)]
pub enum Algorithm {
    /// Read-modify-write: pre-read the blocks being overwritten plus the old
    /// parity, and XOR the delta into parity.
    Rmw,
    /// Read-construct-write: pre-read every data block *not* being written
    /// and compute parity from scratch.
    Rcw,
    /// Read every live position over the whole parity range, reconstruct
    /// missing columns, then compute parity from scratch.
    DegradedRcw,
}

/// The role a position plays in its stripe row
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum Role {
    /// Data, with its data index
    Data(usize),
    /// Parity: 0 is P, 1 is Q
    Parity(usize),
}

/// Where one DriveOp goes, before any memory is bound to it.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct FruInfo {
    pub position: PosT,
    pub role: Role,
    pub lba: LbaT,
    pub blocks: BlockCountT,
    /// For writes widened to the alignment unit: the original range
    pub preread: Option<PreRead>,
}

impl FruInfo {
    pub fn range(&self) -> Range<LbaT> {
        self.lba..self.lba + self.blocks
    }
}

/// Everything about a request that affects its resource needs.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct RequestShape {
    pub range: StripeRange,
    /// Positions known to be dead
    pub dead: PosBitmap,
    /// Reserve one journal header block per written position
    pub write_log_header_required: bool,
}

/// Scatter-gather list size classes, by maximum number of data elements
pub const SG_CLASSES: [usize; 5] = [1, 8, 32, 128, 2048];

/// Index into `SG_CLASSES` of the smallest class that can hold `count`
/// elements.
pub fn sg_class(count: usize) -> Result<usize> {
    SG_CLASSES.iter()
        .position(|max| count <= *max)
        .ok_or(Error::OutOfResource)
}

/// Scatter-gather requirements of a plan
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct SgCounts {
    /// Per DriveOp of `ResourcePlan::reads`
    pub reads: Vec<usize>,
    /// Per DriveOp of `ResourcePlan::reads2`
    pub reads2: Vec<usize>,
    /// Per DriveOp of `ResourcePlan::writes`
    pub writes: Vec<usize>,
    /// Number of lists needed in each size class
    pub classes: [u32; 5],
}

/// The output of the planner.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ResourcePlan {
    pub algorithm: Algorithm,
    pub layout: StripeLayout,
    /// Number of data positions the request writes
    pub data_disks: u16,
    /// Parity range, widened to the alignment unit
    pub parity_range: Range<LbaT>,
    pub reads: Vec<FruInfo>,
    /// Secondary reads: the pieces after each write, for `Rcw`
    pub reads2: Vec<FruInfo>,
    pub writes: Vec<FruInfo>,
    pub header_blocks: BlockCountT,
    pub sg: SgCounts,
    pub total_blocks: BlockCountT,
    pub page_size: PageSize,
    pub page_count: u32,
}

impl ResourcePlan {
    /// Number of DriveOps of every opcode
    pub fn drive_ops(&self) -> usize {
        self.reads.len() + self.reads2.len() + self.writes.len()
    }

    /// Total blocks pre-read
    pub fn read_blocks(&self) -> BlockCountT {
        self.reads.iter().chain(self.reads2.iter()).map(|f| f.blocks).sum()
    }

    /// Total blocks written
    pub fn write_blocks(&self) -> BlockCountT {
        self.writes.iter().map(|f| f.blocks).sum()
    }
}

/// Written range of every data column, if any.
fn column_writes(geo: &RaidGeometry, range: &StripeRange)
    -> Vec<Option<Range<LbaT>>>
{
    (0..geo.data_disks() as usize)
        .map(|idx| geo.column_write(range, idx))
        .collect()
}

fn aligned(geo: &RaidGeometry, r: &Range<LbaT>) -> Result<Range<LbaT>> {
    let (lba, blocks) = geo.align(r.start, r.end - r.start)?;
    Ok(lba..lba + blocks)
}

/// Pieces of the parity range a read-construct-write must pre-read on one
/// data column: before and after the written range.  Each piece is widened to
/// the alignment unit, so it also seeds the write's alignment padding.
fn rcw_pieces(geo: &RaidGeometry, prange: &Range<LbaT>,
              w: Option<&Range<LbaT>>)
    -> Result<(Option<Range<LbaT>>, Option<Range<LbaT>>)>
{
    let Some(w) = w else {
        return Ok((Some(prange.clone()), None));
    };
    let a = geo.alignment();
    let r1 = if w.start > prange.start {
        Some(prange.start..align_up(w.start, a)?)
    } else {
        None
    };
    let r2 = if w.end < prange.end {
        Some(align_down(w.end, a)..prange.end)
    } else {
        None
    };
    match (r1, r2) {
        // Both pads fall in the same alignment unit
        (Some(r1), Some(r2)) if r1.end > r2.start => {
            Ok((Some(r1.start..r2.end), None))
        }
        pieces => Ok(pieces)
    }
}

fn len(r: &Range<LbaT>) -> BlockCountT {
    r.end - r.start
}

fn sum_blocks<'a, I>(mut it: I) -> Result<BlockCountT>
    where I: Iterator<Item=&'a FruInfo>
{
    it.try_fold(0u64, |acc, f| acc.checked_add(f.blocks).ok_or(Error::Sizing))
}

/// Compute the complete resource plan for one request.
pub fn plan(geo: &RaidGeometry, shape: &RequestShape) -> Result<ResourcePlan>
{
    let range = &shape.range;
    if range.parity_count == 0 || range.xfer_count == 0 {
        return Err(Error::Sizing);
    }
    let layout = geo.layout(range.row);
    let writes_by_col = column_writes(geo, range);
    let prange = geo.parity_span(range)?;
    let degraded = layout.data.iter().chain(layout.parity.iter())
        .any(|p| shape.dead.contains(*p));

    // Writes are the same for every algorithm
    let mut writes = Vec::new();
    for (idx, w) in writes_by_col.iter().enumerate() {
        if let Some(w) = w {
            let a = aligned(geo, w)?;
            let preread = if a != *w {
                Some(PreRead{lba: w.start, blocks: len(w)})
            } else {
                None
            };
            writes.push(FruInfo {
                position: layout.data[idx],
                role: Role::Data(idx),
                lba: a.start,
                blocks: len(&a),
                preread
            });
        }
    }
    let data_disks = writes.len() as u16;
    for (pidx, p) in layout.parity.iter().enumerate() {
        writes.push(FruInfo {
            position: *p,
            role: Role::Parity(pidx),
            lba: prange.start,
            blocks: len(&prange),
            preread: None
        });
    }

    // Reads for each candidate algorithm
    let rmw_reads = writes.iter()
        .map(|w| FruInfo{preread: None, ..*w})
        .collect::<Vec<_>>();
    let mut rcw_reads = Vec::new();
    let mut rcw_reads2 = Vec::new();
    for (idx, w) in writes_by_col.iter().enumerate() {
        let (r1, r2) = rcw_pieces(geo, &prange, w.as_ref())?;
        let mk = |r: Range<LbaT>| FruInfo {
            position: layout.data[idx],
            role: Role::Data(idx),
            lba: r.start,
            blocks: len(&r),
            preread: None
        };
        rcw_reads.extend(r1.map(mk));
        rcw_reads2.extend(r2.map(mk));
    }

    let (algorithm, reads, reads2) = if degraded {
        let reads = layout.data.iter().enumerate()
            .map(|(idx, p)| (*p, Role::Data(idx)))
            .chain(layout.parity.iter().enumerate()
                   .map(|(pidx, p)| (*p, Role::Parity(pidx))))
            .map(|(position, role)| FruInfo {
                position,
                role,
                lba: prange.start,
                blocks: len(&prange),
                preread: None
            }).collect::<Vec<_>>();
        (Algorithm::DegradedRcw, reads, Vec::new())
    } else {
        let rmw = sum_blocks(rmw_reads.iter())?;
        let rcw = sum_blocks(rcw_reads.iter().chain(rcw_reads2.iter()))?;
        if rcw < rmw {
            (Algorithm::Rcw, rcw_reads, rcw_reads2)
        } else {
            (Algorithm::Rmw, rmw_reads, Vec::new())
        }
    };

    let header_blocks = if shape.write_log_header_required {
        HEADER_BLOCKS * writes.len() as u64
    } else {
        0
    };
    let total_blocks = sum_blocks(
        reads.iter().chain(reads2.iter()).chain(writes.iter())
    )?.checked_add(header_blocks).ok_or(Error::Sizing)?;
    // Every downstream length field is 32 bits wide
    blocks_to_bytes(total_blocks)?;

    let largest = reads.iter().chain(reads2.iter()).chain(writes.iter())
        .map(|f| f.blocks)
        .max()
        .unwrap_or(0);
    let page_size = if largest <= PageSize::Small.blocks() {
        PageSize::Small
    } else {
        PageSize::Large
    };

    let mut carver = Carver::new(page_size);
    let mut sg = SgCounts::default();
    for f in reads.iter() {
        sg.reads.push(carver.carve(f.blocks)?.len());
    }
    for f in reads2.iter() {
        sg.reads2.push(carver.carve(f.blocks)?.len());
    }
    for f in writes.iter() {
        let mut n = 0;
        for piece in write_pieces(f) {
            n += carver.carve(piece)?.len();
        }
        sg.writes.push(n);
    }
    for _ in 0..header_blocks {
        carver.carve(HEADER_BLOCKS)?;
    }
    for count in sg.reads.iter().chain(sg.reads2.iter())
        .chain(sg.writes.iter())
    {
        sg.classes[sg_class(*count)?] += 1;
    }
    if header_blocks > 0 {
        sg.classes[0] += header_blocks as u32;
    }

    Ok(ResourcePlan {
        algorithm,
        layout,
        data_disks,
        parity_range: prange,
        reads,
        reads2,
        writes,
        header_blocks,
        sg,
        total_blocks,
        page_size,
        page_count: carver.pages(),
    })
}

/// Block counts of the separately carved pieces of a write buffer: the
/// alignment head pad, the host data, and the tail pad.
pub fn write_pieces(f: &FruInfo) -> impl Iterator<Item=BlockCountT> {
    let pieces = match f.preread {
        None => [0, f.blocks, 0],
        Some(pr) => {
            let head = pr.lba - f.lba;
            let tail = f.lba + f.blocks - (pr.lba + pr.blocks);
            [head, pr.blocks, tail]
        }
    };
    pieces.into_iter().filter(|b| *b > 0)
}

// LCOV_EXCL_STOP
