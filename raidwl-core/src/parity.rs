// vim: tw=80
//! The parity compute engine
//!
//! Parity covers only the data portion of each block.  After computing it, the
//! engine reseals every parity block with its own checksum and the row stamp.
//! The engine never performs I/O and never reconstructs on its own; degraded
//! callers run [`reconstruct`] over their read buffers first.

use crate::{
    block::{self, BlockCheck},
    geometry::RaidGeometry,
    gf256,
    planner::Algorithm,
    types::*,
    util::*,
};
use std::ops::Range;

/// Classified parity compute failures
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum ParityError {
    /// A pre-read block failed its checksum or its LBA stamp
    Checksum,
    /// Cross-checked metadata disagrees, such as a parity row stamp
    Consistency,
    /// The caller supplied blocks with invalid checksums
    BadHostData,
}

/// A run of whole blocks starting at drive LBA `lba`
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct Extent {
    pub lba: LbaT,
    pub buf: Vec<u8>,
}

impl Extent {
    pub fn new(lba: LbaT, buf: Vec<u8>) -> Self {
        debug_assert_eq!(buf.len() % BYTES_PER_BLOCK, 0);
        Extent{lba, buf}
    }

    pub fn blocks(&self) -> BlockCountT {
        (self.buf.len() / BYTES_PER_BLOCK) as BlockCountT
    }

    pub fn range(&self) -> Range<LbaT> {
        self.lba..self.lba + self.blocks()
    }

    pub fn block(&self, lba: LbaT) -> Option<&[u8]> {
        if !self.range().contains(&lba) {
            return None;
        }
        let s = (lba - self.lba) as usize * BYTES_PER_BLOCK;
        Some(&self.buf[s..s + BYTES_PER_BLOCK])
    }

    pub fn block_mut(&mut self, lba: LbaT) -> Option<&mut [u8]> {
        if !self.range().contains(&lba) {
            return None;
        }
        let s = (lba - self.lba) as usize * BYTES_PER_BLOCK;
        Some(&mut self.buf[s..s + BYTES_PER_BLOCK])
    }
}

/// Everything the engine knows about one data column
#[derive(Clone, Debug, Default)]
pub struct DataColumn {
    /// Data index within the row
    pub index: usize,
    /// Pre-read contents, possibly in several pieces
    pub old: Vec<Extent>,
    /// The write buffer, when the column is written
    pub new: Option<Extent>,
    /// Blocks of `new` that carry host data.  The rest of `new` is alignment
    /// padding, seeded from `old`.
    pub host: Option<Range<LbaT>>,
}

impl DataColumn {
    fn old_block(&self, lba: LbaT) -> Option<&[u8]> {
        self.old.iter().find_map(|e| e.block(lba))
    }

    /// Contents after the write: new data where written, old elsewhere.
    fn current_block(&self, lba: LbaT) -> Option<&[u8]> {
        self.new.as_ref()
            .and_then(|e| e.block(lba))
            .or_else(|| self.old_block(lba))
    }
}

#[derive(Clone, Debug, Default)]
pub struct ParityColumn {
    /// 0 for P, 1 for Q
    pub index: usize,
    /// Pre-read contents, for read-modify-write
    pub old: Option<Extent>,
    /// Receives the new parity.  Its range is the parity range.
    pub new: Extent,
}

/// All buffers of one compute
#[derive(Clone, Debug, Default)]
pub struct ParityVectors {
    pub data: Vec<DataColumn>,
    pub parity: Vec<ParityColumn>,
}

/// Coefficient of data index `didx` in parity column `pidx`
fn coeff(pidx: usize, didx: usize) -> u8 {
    if pidx == 0 {
        1
    } else {
        gf256::exp2(didx)
    }
}

fn data_of(block: &[u8]) -> &[u8] {
    &block[..DATA_BYTES_PER_BLOCK]
}

fn data_of_mut(block: &mut [u8]) -> &mut [u8] {
    &mut block[..DATA_BYTES_PER_BLOCK]
}

fn check_old(geo: &RaidGeometry, v: &ParityVectors)
    -> std::result::Result<(), ParityError>
{
    for col in v.data.iter() {
        for ext in col.old.iter() {
            for lba in ext.range() {
                let blk = ext.block(lba).ok_or(ParityError::Consistency)?;
                if block::check_data(blk, geo.host_lba(col.index, lba)).is_err()
                {
                    tracing::debug!(idx = col.index, lba, "bad pre-read block");
                    return Err(ParityError::Checksum);
                }
            }
        }
    }
    for p in v.parity.iter() {
        if let Some(ext) = &p.old {
            for lba in ext.range() {
                let blk = ext.block(lba).ok_or(ParityError::Consistency)?;
                match block::check_parity(blk, geo.row_stamp(lba)) {
                    BlockCheck::Ok | BlockCheck::Invalidated => (),
                    BlockCheck::BadCrc => return Err(ParityError::Checksum),
                    BlockCheck::BadLbaStamp => {
                        tracing::debug!(pidx = p.index, lba,
                                        "parity row stamp mismatch");
                        return Err(ParityError::Consistency);
                    }
                }
            }
        }
    }
    Ok(())
}

/// Validate host data, seed alignment padding, and stamp destination LBAs.
fn prepare_writes(geo: &RaidGeometry, v: &mut ParityVectors)
    -> std::result::Result<(), ParityError>
{
    for col in v.data.iter_mut() {
        let Some(new) = col.new.as_ref() else { continue };
        let range = new.range();
        let host = col.host.clone().unwrap_or_else(|| range.clone());
        for lba in range.clone() {
            if host.contains(&lba) {
                let blk = new.block(lba).ok_or(ParityError::Consistency)?;
                if !block::check_crc(blk) {
                    tracing::warn!(idx = col.index, lba, "bad host data");
                    return Err(ParityError::BadHostData);
                }
            }
        }
        let mut new = col.new.take().unwrap_or_default();
        for lba in range {
            if host.contains(&lba) {
                if let Some(blk) = new.block_mut(lba) {
                    block::stamp_lba(blk, geo.host_lba(col.index, lba));
                }
            } else {
                let old = col.old_block(lba).ok_or(ParityError::Consistency)?;
                if let Some(blk) = new.block_mut(lba) {
                    blk.copy_from_slice(old);
                }
            }
        }
        col.new = Some(new);
    }
    Ok(())
}

fn rmw(v: &mut ParityVectors) -> std::result::Result<(), ParityError> {
    for p in v.parity.iter_mut() {
        let old = p.old.as_ref().ok_or(ParityError::Consistency)?;
        if old.range() != p.new.range() {
            return Err(ParityError::Consistency);
        }
        p.new.buf.copy_from_slice(&old.buf);
    }
    let mut delta = vec![0u8; DATA_BYTES_PER_BLOCK];
    for col in v.data.iter() {
        let Some(new) = col.new.as_ref() else { continue };
        for lba in new.range() {
            let old = col.old_block(lba).ok_or(ParityError::Consistency)?;
            let nb = new.block(lba).ok_or(ParityError::Consistency)?;
            delta.copy_from_slice(data_of(old));
            gf256::xor_into(&mut delta, data_of(nb));
            for p in v.parity.iter_mut() {
                let c = coeff(p.index, col.index);
                let dst = p.new.block_mut(lba).ok_or(ParityError::Consistency)?;
                gf256::mul_xor_into(data_of_mut(dst), &delta, c);
            }
        }
    }
    Ok(())
}

fn rcw(v: &mut ParityVectors) -> std::result::Result<(), ParityError> {
    for p in v.parity.iter_mut() {
        p.new.buf.fill(0);
    }
    let Some(range) = v.parity.first().map(|p| p.new.range()) else {
        return Ok(());
    };
    for col in v.data.iter() {
        for lba in range.clone() {
            let src = col.current_block(lba).ok_or(ParityError::Consistency)?;
            for p in v.parity.iter_mut() {
                let c = coeff(p.index, col.index);
                let dst = p.new.block_mut(lba).ok_or(ParityError::Consistency)?;
                gf256::mul_xor_into(data_of_mut(dst), data_of(src), c);
            }
        }
    }
    Ok(())
}

/// Compute new parity for a small write.
///
/// On success every `ParityColumn::new` holds sealed parity, and every data
/// column's `new` extent is padded and stamped, ready to write.
pub fn compute_parity(geo: &RaidGeometry, algorithm: Algorithm,
                      v: &mut ParityVectors)
    -> std::result::Result<(), ParityError>
{
    prepare_writes(geo, v)?;
    check_old(geo, v)?;
    match algorithm {
        Algorithm::Rmw => rmw(v)?,
        Algorithm::Rcw | Algorithm::DegradedRcw => rcw(v)?,
    }
    for p in v.parity.iter_mut() {
        for lba in p.new.range() {
            if let Some(blk) = p.new.block_mut(lba) {
                block::seal_parity(blk, geo.row_stamp(lba));
            }
        }
    }
    Ok(())
}

/// Compute parity from complete data columns.  Used by recovery-verify.
///
/// `data` is indexed by data index; every column, and every element of
/// `parity`, covers the same drive LBAs.  Parity blocks are not sealed.
pub fn encode(data: &[Vec<u8>], parity: &mut [Vec<u8>]) {
    for (pidx, p) in parity.iter_mut().enumerate() {
        p.fill(0);
        for (didx, d) in data.iter().enumerate() {
            let c = coeff(pidx, didx);
            for (dst, src) in p.chunks_exact_mut(BYTES_PER_BLOCK)
                .zip(d.chunks_exact(BYTES_PER_BLOCK))
            {
                gf256::mul_xor_into(data_of_mut(dst), data_of(src), c);
            }
        }
    }
}

/// Rebuild erased data columns from the survivors.
///
/// `data` is indexed by data index and `parity` by parity index; all columns
/// have the same length.  `erased` lists the data indices to rebuild and
/// `parity_ok` says which parity columns are usable.  Only data portions are
/// rebuilt; the caller reseals the blocks.  Returns `false`, without changing
/// anything, if there are more erasures than usable parity.
pub fn reconstruct(data: &mut [Vec<u8>], parity: &[Vec<u8>], erased: &[usize],
                   parity_ok: &[bool]) -> bool
{
    let avail = parity_ok.iter()
        .enumerate()
        .filter(|(_, ok)| **ok)
        .map(|(j, _)| j)
        .collect::<Vec<_>>();
    if erased.is_empty() {
        return true;
    }
    if erased.len() > avail.len() || erased.len() > 2 {
        return false;
    }
    let len = data.first().map(Vec::len).unwrap_or(0);
    let mut syn = vec![vec![0u8; DATA_BYTES_PER_BLOCK]; avail.len()];
    for off in (0..len).step_by(BYTES_PER_BLOCK) {
        let end = off + DATA_BYTES_PER_BLOCK;
        // Syndromes: each usable parity minus the surviving data
        for (s, j) in syn.iter_mut().zip(avail.iter()) {
            s.copy_from_slice(&parity[*j][off..end]);
            for (i, d) in data.iter().enumerate() {
                if !erased.contains(&i) {
                    gf256::mul_xor_into(s, &d[off..end], coeff(*j, i));
                }
            }
        }
        match erased {
            [x] => {
                let c = gf256::inv(coeff(avail[0], *x));
                let dst = &mut data[*x][off..end];
                dst.copy_from_slice(&syn[0]);
                gf256::scale(dst, c);
            }
            [x, y] => {
                // dx ^ dy = Sp;  gx*dx ^ gy*dy = Sq
                let (gx, gy) = (coeff(1, *x), coeff(1, *y));
                let denom = gf256::inv(gx ^ gy);
                let mut dx = syn[1].clone();
                gf256::mul_xor_into(&mut dx, &syn[0], gy);
                gf256::scale(&mut dx, denom);
                let mut dy = syn[0].clone();
                gf256::xor_into(&mut dy, &dx);
                data[*x][off..end].copy_from_slice(&dx);
                data[*y][off..end].copy_from_slice(&dy);
            }
            _ => unreachable!(),
        }
    }
    true
}

// LCOV_EXCL_STOP
