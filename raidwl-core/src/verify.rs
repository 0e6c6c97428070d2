// vim: tw=80
//! Recovery-verify: re-derive correct data and parity over part of a row
//!
//! A `StripeOp` runs this after a media error or a checksum failure, and
//! journal recovery runs it when it cannot trust a slot.  Every live position
//! is read over the span.  Each drive LBA of the span is then repaired on its
//! own: unreadable, corrupt, or dead columns are erasures, rebuilt from parity
//! when there are few enough of them.  LBAs with too many erasures are
//! invalidated, so later readers fail them instead of trusting stale data.

use crate::{
    block,
    drive_op::{ChainKind, DriveOp, DriveOpArena},
    eboard::FruErrorStatus,
    engine::WriteEngine,
    memory::{PageSet, SgList},
    parity,
    transport::Opcode,
    types::*,
    util::*,
};
use itertools::Itertools;
use serde_derive::Serialize;
use std::{ops::Range, sync::atomic::Ordering};

#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Serialize)]
pub struct VerifyReport {
    /// Data blocks rebuilt from parity
    pub repaired: u32,
    /// Parity blocks recomputed because they were wrong or unreadable
    pub parity_rewritten: u32,
    /// Data blocks that could not be recovered
    pub invalidated: u32,
    pub status: Status,
}

/// One position's buffer over the whole span
struct Column {
    position: PosT,
    sg: SgList,
    buf: Vec<u8>,
    /// Read failed, or the position is dead
    erased: bool,
    dirty: bool,
}

fn block_of(buf: &[u8], i: usize) -> &[u8] {
    &buf[i * BYTES_PER_BLOCK..(i + 1) * BYTES_PER_BLOCK]
}

fn block_of_mut(buf: &mut [u8], i: usize) -> &mut [u8] {
    &mut buf[i * BYTES_PER_BLOCK..(i + 1) * BYTES_PER_BLOCK]
}

impl WriteEngine {
    /// Verify and repair drive LBAs `span` of stripe row `row`.
    pub async fn recovery_verify(&self, row: u64, span: Range<LbaT>)
        -> Result<VerifyReport>
    {
        self.verify_span(row, span, false).await
    }

    /// Like [`recovery_verify`](Self::recovery_verify), optionally on the
    /// monitor's behalf.  A position that dies during a monitor op is treated
    /// as one more erasure.
    #[tracing::instrument(skip(self))]
    pub(crate) async fn verify_span(&self, row: u64, span: Range<LbaT>,
                                    monitor_op: bool)
        -> Result<VerifyReport>
    {
        self.stats.recovery_verifies.fetch_add(1, Ordering::Relaxed);
        tracing::warn!(row, ?span, "recovery verify");
        let geo = self.geometry();
        let layout = geo.layout(row);
        let blocks = span.end - span.start;
        let mut dead = self.monitor.dead();
        let mut report = VerifyReport::default();

        let mut pages = PageSet::for_blocks(
            blocks.checked_mul(u64::from(geo.width())).ok_or(Error::Sizing)?);
        let mut arena = DriveOpArena::default();
        let positions = layout.data.iter()
            .chain(layout.parity.iter())
            .copied()
            .collect_vec();
        let mut sgs = Vec::with_capacity(positions.len());
        for pos in positions.iter() {
            let sg = pages.carve(blocks)?;
            sgs.push(sg.clone());
            arena.push(ChainKind::Read,
                       DriveOp::new(*pos, Opcode::Read, span.start, blocks,
                                    sg));
        }
        arena.set_degraded_nop(ChainKind::Read, dead);
        let (verdict, _) = self.run_chain(&mut arena, &mut pages,
                                          ChainKind::Read, &mut dead,
                                          monitor_op).await;
        if verdict == FruErrorStatus::Shutdown {
            report.status = Status::ShutdownError;
            return Ok(report);
        }

        let mut cols = positions.iter().zip(sgs)
            .map(|(pos, sg)| {
                let erased = arena.find(ChainKind::Read, *pos)
                    .map(|id| !arena.get(id).is_ok())
                    .unwrap_or(true);
                let buf = pages.gather(&sg);
                Column{position: *pos, sg, buf, erased, dirty: false}
            }).collect_vec();
        let nd = layout.data.len();
        let np = layout.parity.len();

        for i in 0..blocks as usize {
            let lba = span.start + i as LbaT;
            let row_stamp = geo.row_stamp(lba);
            let erased = (0..nd)
                .filter(|idx| {
                    let c = &cols[*idx];
                    c.erased || block::check_data(block_of(&c.buf, i),
                                                  geo.host_lba(*idx, lba))
                        .is_err()
                }).collect::<Vec<_>>();
            let parity_ok = (0..np)
                .map(|j| {
                    let c = &cols[nd + j];
                    !c.erased &&
                        !block::check_parity(block_of(&c.buf, i), row_stamp)
                            .is_err()
                }).collect::<Vec<_>>();
            let mut data = (0..nd)
                .map(|idx| block_of(&cols[idx].buf, i).to_vec())
                .collect::<Vec<_>>();
            let old_parity = (0..np)
                .map(|j| block_of(&cols[nd + j].buf, i).to_vec())
                .collect::<Vec<_>>();

            if parity::reconstruct(&mut data, &old_parity, &erased,
                                   &parity_ok)
            {
                for idx in erased.iter() {
                    let blk = &mut data[*idx];
                    block::seal(blk);
                    block::stamp_lba(blk, geo.host_lba(*idx, lba));
                    if !dead.contains(cols[*idx].position) {
                        report.repaired += 1;
                    }
                }
            } else {
                tracing::error!(row, lba, erasures = erased.len(),
                                "uncorrectable; invalidating");
                for idx in erased.iter() {
                    block::invalidate(&mut data[*idx],
                                      geo.host_lba(*idx, lba));
                    if !dead.contains(cols[*idx].position) {
                        report.invalidated += 1;
                    }
                }
            }
            for idx in erased.iter() {
                let c = &mut cols[*idx];
                block_of_mut(&mut c.buf, i).copy_from_slice(&data[*idx]);
                c.dirty = true;
            }

            // Parity always follows the data, even invalidated data
            let mut new_parity = vec![vec![0u8; BYTES_PER_BLOCK]; np];
            parity::encode(&data, &mut new_parity);
            for (j, p) in new_parity.iter_mut().enumerate() {
                block::seal_parity(p, row_stamp);
                let c = &mut cols[nd + j];
                if !parity_ok[j] || block_of(&c.buf, i) != &p[..] {
                    block_of_mut(&mut c.buf, i).copy_from_slice(p);
                    c.dirty = true;
                    if !dead.contains(c.position) {
                        report.parity_rewritten += 1;
                    }
                }
            }
        }

        arena.retire(ChainKind::Read);
        for c in cols.iter().filter(|c| c.dirty && !dead.contains(c.position))
        {
            pages.scatter(&c.sg, &c.buf);
            arena.push(ChainKind::Write,
                       DriveOp::new(c.position, Opcode::Write, span.start,
                                    blocks, c.sg.clone()));
        }
        if !arena.is_empty(ChainKind::Write) {
            match self.run_chain(&mut arena, &mut pages, ChainKind::Write,
                                 &mut dead, monitor_op).await.0
            {
                FruErrorStatus::Shutdown => {
                    report.status = Status::ShutdownError;
                }
                FruErrorStatus::Success => (),
                verdict => {
                    // Nothing more can be done for a drive that won't take
                    // the repair.
                    tracing::error!(row, ?verdict, "repair write failed");
                }
            }
        }
        tracing::info!(row, repaired = report.repaired,
                       parity = report.parity_rewritten,
                       invalidated = report.invalidated,
                       "recovery verify complete");
        Ok(report)
    }
}

// LCOV_EXCL_STOP
