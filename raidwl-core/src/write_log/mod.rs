// vim: tw=80
//! The write log journal
//!
//! Degraded small writes first record their new data and parity in a write
//! log slot at the end of every member drive.  Only after that copy is durable
//! do they touch the live stripe, and only after the live write is durable do
//! they invalidate the slot.  A crash at any point therefore leaves either the
//! old contents or a complete journal copy of the new ones.

use crate::{
    drive_op::{ChainKind, DriveOp, DriveOpArena},
    geometry::{RaidGeometry, StripeLayout, StripeRange, HEADER_BLOCKS},
    memory::{PageSet, PageSize},
    scheduler,
    transport::{DriveTransport, Opcode},
    types::*,
    util::*,
};
use std::{
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering}
    },
    time::{SystemTime, UNIX_EPOCH}
};

mod flush;
mod header;
mod pool;

pub use self::flush::{FlushOutcome, FlushReport};
pub use self::header::{
    HeaderRead,
    HeaderState,
    SlotHeader,
    csum_of_csums
};
pub use self::pool::{Acquire, InvalidateState, SlotPool, SlotState};

/// Outcome of invalidating a slot
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum InvalidateResult {
    Success,
    /// The slot was already free.  Nothing was written.
    AlreadyFree,
    /// A position died while the slot was written.  The invalidation is
    /// durable and the slot was released.
    Dead,
    /// Too few positions took the invalidation for it to be durable.  The
    /// slot was orphaned, so journal recovery still owns it.
    Incomplete,
}

/// Does a write need to go through the write log?
///
/// Only degraded writes are journaled, and only when a crash could leave
/// surviving parity inconsistent with surviving data.
pub fn is_write_logging_required(geo: &RaidGeometry, range: &StripeRange,
                                 layout: &StripeLayout, dead: PosBitmap)
    -> bool
{
    let row_dead = layout.data.iter()
        .chain(layout.parity.iter())
        .filter(|p| dead.contains(**p))
        .count();
    if row_dead == 0 {
        return false;
    }
    let dead_parity = layout.parity.iter()
        .filter(|p| dead.contains(**p))
        .count();
    let parity_count = layout.parity.len();
    if dead_parity == parity_count {
        // No parity left to become inconsistent
        return false;
    }
    let written = (0..layout.data.len())
        .filter(|idx| geo.column_write(range, *idx).is_some())
        .map(|idx| layout.data[idx])
        .collect::<Vec<_>>();
    if let [only] = written[..] {
        if dead.contains(only) && dead_parity == parity_count - 1 {
            // Only one parity column will be written
            return false;
        }
    }
    true
}

/// The journal: its slots and the I/O that manages them
pub struct WriteLog {
    geo: RaidGeometry,
    transport: Arc<dyn DriveTransport>,
    pool: Arc<SlotPool>,
    generation: AtomicU64,
}

impl WriteLog {
    pub fn new(geo: RaidGeometry, transport: Arc<dyn DriveTransport>) -> Self {
        let pool = SlotPool::new(geo.slot_count());
        // Seeded from the clock so generations keep increasing across
        // restarts
        let seed = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_micros() as u64)
            .unwrap_or(1);
        WriteLog{geo, transport, pool, generation: AtomicU64::new(seed)}
    }

    pub fn pool(&self) -> &Arc<SlotPool> {
        &self.pool
    }

    pub fn next_generation(&self) -> u64 {
        self.generation.fetch_add(1, Ordering::Relaxed) + 1
    }

    /// Make sure the next generation issued is newer than `generation`.
    pub fn observe_generation(&self, generation: u64) {
        self.generation.fetch_max(generation, Ordering::Relaxed);
    }

    /// Overwrite the slot's header with an invalidation header on every live
    /// position, then release the slot.  If too many positions missed the
    /// invalidation, the slot is orphaned instead of released.
    ///
    /// Invalidating a free slot is a no-op that reports `AlreadyFree`.
    #[tracing::instrument(skip(self))]
    pub async fn invalidate(&self, slot: SlotT, dead: PosBitmap)
        -> Result<InvalidateResult>
    {
        if self.pool.state(slot)? == SlotState::Free {
            return Ok(InvalidateResult::AlreadyFree);
        }
        let base = self.geo.slot_base(slot)?;
        let hdr = SlotHeader::invalid(self.next_generation()).encode(base)?;
        let width = self.geo.width();
        let mut pages = PageSet::unpooled(
            div_roundup(u32::from(width), PageSize::Small.blocks() as u32),
            PageSize::Small);
        let mut arena = DriveOpArena::default();
        for pos in (0..width).filter(|p| !dead.contains(*p)) {
            let sg = pages.carve(HEADER_BLOCKS)?;
            pages.scatter(&sg, &hdr);
            arena.push(ChainKind::Write,
                       DriveOp::new(pos, Opcode::Write, base, HEADER_BLOCKS,
                                    sg));
        }
        scheduler::send_chain(&*self.transport, &mut arena, &mut pages,
                              ChainKind::Write).await;
        let failed = arena.iter(ChainKind::Write)
            .filter(|(_, op)| !op.is_ok())
            .count() as u32;
        let lost = failed + dead.count();
        if lost > u32::from(self.geo.parity_count()) {
            tracing::error!(slot, failed, "slot invalidation not durable");
            self.pool.orphan(slot);
            return Ok(InvalidateResult::Incomplete);
        }
        let dead_slot =
            self.pool.invalidate_state(slot) == InvalidateState::Dead;
        let result = if dead_slot {
            tracing::warn!(slot, failed, "slot invalidation degraded");
            InvalidateResult::Dead
        } else {
            InvalidateResult::Success
        };
        self.pool.release(slot);
        Ok(result)
    }
}

// LCOV_EXCL_STOP
