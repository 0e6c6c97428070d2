// vim: tw=80
//! Journal recovery
//!
//! Run when a group is activated, before it accepts new writes.  Every slot
//! left valid by a crash is either replayed onto the live stripe or, if it
//! cannot be trusted, discarded and the live stripe verified instead.

use crate::{
    block,
    drive_op::{ChainKind, DriveOp, DriveOpArena},
    eboard::FruErrorStatus,
    engine::WriteEngine,
    geometry::{HEADER_BLOCKS, StripeRange},
    memory::{PageSet, SgList},
    planner::{self, FruInfo, RequestShape, Role},
    transport::Opcode,
    types::*,
    util::*,
};
use serde_derive::Serialize;
use std::sync::atomic::Ordering;
use super::{
    HeaderRead,
    HeaderState,
    InvalidateResult,
    SlotHeader,
    SlotState,
    csum_of_csums
};

/// What recovery did with one slot
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize)]
pub enum FlushOutcome {
    /// Never written, or already invalidated.  Nothing was replayed.
    Clean,
    /// The journaled write was replayed onto the live stripe.
    Replayed,
    /// The slot could not be trusted and was discarded.  `verified` is set
    /// if the live stripe it covered was verified afterwards.
    Abandoned { verified: bool },
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize)]
pub struct FlushReport {
    pub slot: SlotT,
    /// Newest generation found in any of the slot's headers
    pub generation: Option<u64>,
    pub outcome: FlushOutcome,
}

/// One live position's copy of a slot header
#[derive(Clone, Copy, Debug)]
enum HeaderCopy {
    Unreadable,
    Read(HeaderRead),
}

impl HeaderCopy {
    fn header(&self) -> Option<&SlotHeader> {
        match self {
            HeaderCopy::Read(HeaderRead::Ok(h)) => Some(h),
            _ => None
        }
    }
}

impl WriteEngine {
    /// Recover every slot of the write log, in order.
    ///
    /// The engine must be idle: no slot may be allocated.
    pub async fn flush_all(&self) -> Result<Vec<FlushReport>> {
        let mut reports = Vec::new();
        for slot in 0..self.geometry().slot_count() {
            reports.push(self.flush_slot(slot).await?);
        }
        let replayed = reports.iter()
            .filter(|r| r.outcome == FlushOutcome::Replayed)
            .count();
        tracing::info!(slots = reports.len(), replayed, "write log flushed");
        Ok(reports)
    }

    /// Recover one write log slot.
    ///
    /// The slot is free again afterwards, unless it may still hold a valid
    /// journal copy.  Then it stays orphaned for the next flush.
    #[tracing::instrument(skip(self))]
    pub async fn flush_slot(&self, slot: SlotT) -> Result<FlushReport> {
        let pool = self.write_log().pool().clone();
        pool.allocate_for_flush(slot)?;
        pool.set_flushing(slot);
        let r = self.flush_flushing(slot).await;
        match (pool.state(slot)?, &r) {
            (SlotState::Free | SlotState::Orphaned, _) => (),
            // Nothing valid was found, so there is nothing to invalidate
            (_, Ok((_, FlushOutcome::Clean))) => pool.release(slot),
            _ => pool.orphan(slot)
        }
        let (generation, outcome) = r?;
        if let Some(g) = generation {
            self.write_log().observe_generation(g);
        }
        match outcome {
            FlushOutcome::Clean => (),
            FlushOutcome::Replayed => {
                self.stats.flush_replayed.fetch_add(1, Ordering::Relaxed);
            }
            FlushOutcome::Abandoned{..} => {
                self.stats.flush_abandoned.fetch_add(1, Ordering::Relaxed);
            }
        }
        Ok(FlushReport{slot, generation, outcome})
    }

    async fn flush_flushing(&self, slot: SlotT)
        -> Result<(Option<u64>, FlushOutcome)>
    {
        let geo = self.geometry();
        let mut dead = self.monitor.dead();
        let Some(copies) = self.read_headers(slot, &mut dead).await? else {
            tracing::error!(slot, "too many positions lost to read headers");
            return Ok((None, FlushOutcome::Abandoned{verified: false}));
        };

        let newest = copies.iter()
            .filter_map(|(_, c)| c.header())
            .max_by_key(|h| h.generation)
            .copied();
        let Some(model) = newest else {
            if copies.iter()
                .all(|(_, c)| matches!(c, HeaderCopy::Read(HeaderRead::Blank)))
            {
                return Ok((None, FlushOutcome::Clean));
            }
            let unreadable = copies.iter()
                .filter(|(_, c)| matches!(c, HeaderCopy::Unreadable))
                .count();
            tracing::warn!(slot, unreadable,
                           "flush abandoned: no valid header");
            let outcome = self.abandon(slot, dead, None).await?;
            return Ok((None, outcome));
        };
        let generation = Some(model.generation);
        if model.state == HeaderState::Invalid {
            return Ok((generation, FlushOutcome::Clean));
        }

        let range = model.range(geo.row_blocks());
        let sane = geo.decompose(range.start_lba, range.xfer_count)
            .map(|r| r == [range])
            .unwrap_or(false);
        if !sane {
            tracing::warn!(slot, ?range, "flush abandoned: impossible range");
            let outcome = self.abandon(slot, dead, None).await?;
            return Ok((generation, outcome));
        }

        // Every copy of the newest generation must describe the same
        // request.  Unreadable copies are assumed to match.
        let mut present = PosBitmap::EMPTY;
        for (pos, c) in copies.iter() {
            match c {
                HeaderCopy::Read(HeaderRead::Ok(h))
                    if h.generation == model.generation =>
                {
                    if !h.agrees(&model) || !model.write_bitmap.contains(*pos)
                    {
                        tracing::warn!(slot, pos, "flush abandoned: headers \
                                       disagree");
                        let outcome = self.abandon(slot, dead, Some(range))
                            .await?;
                        return Ok((generation, outcome));
                    }
                    present.insert(*pos);
                }
                HeaderCopy::Unreadable if model.write_bitmap.contains(*pos) => {
                    present.insert(*pos);
                }
                _ => ()
            }
        }
        let expected = model.write_bitmap.difference(dead);
        if present != expected {
            tracing::warn!(slot, %present, %expected,
                           "flush abandoned: slot write was incomplete");
            let outcome = self.abandon(slot, dead, Some(range)).await?;
            return Ok((generation, outcome));
        }

        // The journaled extents are the request's write extents
        let shape = RequestShape {
            range,
            dead: PosBitmap::EMPTY,
            write_log_header_required: true
        };
        let extents = planner::plan(geo, &shape)?.writes.into_iter()
            .filter(|w| present.contains(w.position))
            .collect::<Vec<_>>();
        let mismatched = copies.iter()
            .filter_map(|(pos, c)| c.header().map(|h| (*pos, h)))
            .filter(|(_, h)| h.generation == model.generation)
            .any(|(pos, h)| {
                extents.iter()
                    .find(|w| w.position == pos)
                    .map(|w| w.lba != h.lba || w.blocks != h.blocks)
                    .unwrap_or(true)
            });
        if mismatched || extents.len() != present.count() as usize {
            tracing::warn!(slot, "flush abandoned: extents disagree");
            let outcome = self.abandon(slot, dead, Some(range)).await?;
            return Ok((generation, outcome));
        }

        let outcome = self.replay(slot, &range, &extents, &copies, &mut dead)
            .await?;
        Ok((generation, outcome))
    }

    /// Read the header block of `slot` from every live position.  Returns
    /// `None` if too many positions are gone.
    async fn read_headers(&self, slot: SlotT, dead: &mut PosBitmap)
        -> Result<Option<Vec<(PosT, HeaderCopy)>>>
    {
        let geo = self.geometry();
        let base = geo.slot_base(slot)?;
        let mut pages = PageSet::for_blocks(
            HEADER_BLOCKS * u64::from(geo.width()));
        let mut arena = DriveOpArena::default();
        for pos in (0..geo.width()).filter(|p| !dead.contains(*p)) {
            let sg = pages.carve(HEADER_BLOCKS)?;
            arena.push(ChainKind::Read,
                       DriveOp::new(pos, Opcode::Read, base, HEADER_BLOCKS,
                                    sg));
        }
        // A position that dies now just loses its copy of the header
        let (verdict, _) = self.run_chain(&mut arena, &mut pages,
                                          ChainKind::Read, dead, true).await;
        if verdict == FruErrorStatus::Shutdown {
            return Ok(None);
        }
        let copies = arena.iter(ChainKind::Read)
            .filter(|(_, op)| !op.degraded_nop)
            .map(|(_, op)| {
                let c = if op.is_ok() {
                    let blk = pages.gather(&op.sg);
                    HeaderCopy::Read(SlotHeader::decode(&blk, base))
                } else {
                    HeaderCopy::Unreadable
                };
                (op.position, c)
            }).collect();
        Ok(Some(copies))
    }

    /// Read, check, and replay the journaled extents, then invalidate.
    async fn replay(&self, slot: SlotT, range: &StripeRange,
                    extents: &[FruInfo], copies: &[(PosT, HeaderCopy)],
                    dead: &mut PosBitmap) -> Result<FlushOutcome>
    {
        let geo = self.geometry();
        let total = extents.iter().map(|w| w.blocks).sum();
        let mut pages = PageSet::for_blocks(total);
        let mut arena = DriveOpArena::default();
        for w in extents {
            let sg = pages.carve(w.blocks)?;
            let jlba = geo.journal_lba(slot, w.lba, w.lba)?;
            arena.push(ChainKind::Read,
                       DriveOp::new(w.position, Opcode::Read, jlba, w.blocks,
                                    sg));
        }
        match self.run_chain(&mut arena, &mut pages, ChainKind::Read, dead,
                             true).await.0
        {
            FruErrorStatus::Success => (),
            FruErrorStatus::Shutdown => {
                tracing::error!(slot, "too many positions lost to replay");
                return Ok(FlushOutcome::Abandoned{verified: false});
            }
            _ => {
                tracing::warn!(slot, "flush abandoned: journal unreadable");
                return self.abandon(slot, *dead, Some(*range)).await;
            }
        }

        let mut live = Vec::<(PosT, LbaT, BlockCountT, SgList)>::new();
        let reads = arena.iter(ChainKind::Read)
            .filter(|(_, op)| !op.degraded_nop);
        for (_, op) in reads {
            let Some(w) = extents.iter().find(|w| w.position == op.position)
            else {
                continue;
            };
            let buf = pages.gather(&op.sg);
            let mut intact = true;
            for (i, blk) in buf.chunks_exact(BYTES_PER_BLOCK).enumerate() {
                // Shadow blocks are stamped for their live LBA
                let lba = geo.live_lba(slot, w.lba, op.lba + i as LbaT)?;
                let check = match w.role {
                    Role::Data(idx) => {
                        block::check_data(blk, geo.host_lba(idx, lba))
                    }
                    Role::Parity(_) => {
                        block::check_parity(blk, geo.row_stamp(lba))
                    }
                };
                intact &= !check.is_err();
            }
            let csum_ok = copies.iter()
                .find(|(pos, _)| *pos == op.position)
                .and_then(|(_, c)| c.header())
                .map(|h| h.csum_of_csums == csum_of_csums(&buf))
                .unwrap_or(true);
            if !intact || !csum_ok {
                tracing::warn!(slot, pos = op.position, intact, csum_ok,
                               "flush abandoned: journal data corrupt");
                return self.abandon(slot, *dead, Some(*range)).await;
            }
            live.push((op.position, w.lba, w.blocks, op.sg.clone()));
        }

        arena.retire(ChainKind::Read);
        for (pos, lba, blocks, sg) in live {
            arena.push(ChainKind::Write,
                       DriveOp::new(pos, Opcode::Write, lba, blocks, sg));
        }
        match self.run_chain(&mut arena, &mut pages, ChainKind::Write, dead,
                             true).await.0
        {
            FruErrorStatus::Success => (),
            FruErrorStatus::Shutdown => {
                // Leave the slot valid on disk for the next activation
                tracing::error!(slot, "too many positions lost to replay");
                return Ok(FlushOutcome::Abandoned{verified: false});
            }
            verdict => {
                tracing::warn!(slot, ?verdict, "replay write failed");
                let span = geo.parity_span(range)?;
                self.verify_span(range.row, span, true).await?;
            }
        }
        match self.write_log().invalidate(slot, *dead).await? {
            InvalidateResult::Dead => {
                tracing::warn!(slot, "replayed slot invalidated degraded");
            }
            InvalidateResult::Incomplete => {
                tracing::error!(slot, "replayed slot still valid on disk");
            }
            InvalidateResult::Success | InvalidateResult::AlreadyFree => ()
        }
        tracing::info!(slot, start = range.start_lba,
                       blocks = range.xfer_count, "write log slot replayed");
        Ok(FlushOutcome::Replayed)
    }

    /// Discard a slot.  The live stripe is verified first, if the slot said
    /// which one it covered.
    async fn abandon(&self, slot: SlotT, dead: PosBitmap,
                     range: Option<StripeRange>) -> Result<FlushOutcome>
    {
        let verified = match range {
            Some(r) => {
                let span = self.geometry().parity_span(&r)?;
                let report = self.verify_span(r.row, span, true).await?;
                report.status == Status::Success
            }
            None => false
        };
        self.write_log().invalidate(slot, dead).await?;
        Ok(FlushOutcome::Abandoned{verified})
    }
}
