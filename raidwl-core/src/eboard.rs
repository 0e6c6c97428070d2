// vim: tw=80
//! The Error Board: one classified verdict per completed DriveOp chain
//!
//! An `Eboard` is built fresh every time a chain must be classified and is
//! returned by value.  The decision it leads to is a pure function of its
//! counts and of the request's context, so the precedence rules can be tested
//! as a table.

use crate::{
    drive_op::{ChainKind, DriveOpArena, OpStatus},
    transport::{DriveStatus, Qualifier},
    types::*,
};

/// Aggregate verdict for one chain
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum FruErrorStatus {
    /// Every op succeeded
    Success,
    /// Some ops failed, none fatally.  Consult the board for details.
    Error,
    /// A live position went away during a monitor-initiated operation
    Dead,
    /// Failures exceed the group's redundancy
    Shutdown,
    /// A newly dead position must be acknowledged before proceeding
    Waiting,
    /// Every failure is retryable
    Retry,
}

/// What the classifier needs to know about the request.
#[derive(Clone, Copy, Debug)]
pub struct ClassifyCtx {
    pub parity_count: u16,
    /// Positions already known, and acknowledged, to be dead
    pub known_dead: PosBitmap,
    /// Set for operations issued by the group monitor itself, which cannot
    /// wait for the monitor's decision.
    pub monitor_op: bool,
    pub max_retries: u32,
}

#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct Eboard {
    pub dead_count: u32,
    pub dead_bitmap: PosBitmap,
    pub hard_media_count: u32,
    pub hard_media_bitmap: PosBitmap,
    pub crc_count: u32,
    pub crc_bitmap: PosBitmap,
    pub drop_count: u32,
    pub drop_bitmap: PosBitmap,
    pub retry_count: u32,
    pub retry_bitmap: PosBitmap,
    pub abort_count: u32,
    pub abort_bitmap: PosBitmap,
}

impl Eboard {
    fn dead(&mut self, pos: PosT) {
        self.dead_count += 1;
        self.dead_bitmap.insert(pos);
    }

    /// Every position that failed in a way that loses its data for this
    /// chain: dead, media errors, checksum errors, and dropped requests.
    pub fn erasures(&self) -> PosBitmap {
        self.dead_bitmap
            .union(self.hard_media_bitmap)
            .union(self.crc_bitmap)
            .union(self.drop_bitmap)
    }

    /// Positions that died for the first time during this chain
    pub fn newly_dead(&self, ctx: &ClassifyCtx) -> PosBitmap {
        self.dead_bitmap.difference(ctx.known_dead)
    }

    /// The one branch decision for this chain.
    ///
    /// Precedence: `Waiting`, then `Shutdown` or `Dead`, then `Retry`, then
    /// `Error`.  A retry must never be issued while a shutdown decision is
    /// outstanding.
    pub fn verdict(&self, ctx: &ClassifyCtx) -> FruErrorStatus {
        let newly_dead = self.newly_dead(ctx);
        let all_dead = ctx.known_dead.union(self.dead_bitmap);
        if !newly_dead.is_empty() && !ctx.monitor_op {
            FruErrorStatus::Waiting
        } else if all_dead.count() > u32::from(ctx.parity_count) {
            FruErrorStatus::Shutdown
        } else if !newly_dead.is_empty() {
            FruErrorStatus::Dead
        } else if self.retry_count > 0 {
            FruErrorStatus::Retry
        } else if self.hard_media_count + self.crc_count + self.drop_count +
            self.abort_count + self.dead_count > 0
        {
            FruErrorStatus::Error
        } else {
            FruErrorStatus::Success
        }
    }
}

/// Walk a completed chain once and classify it.
///
/// Degraded-nop ops are ignored.  A retryable failure that has already been
/// retried `max_retries` times counts as a dead position.
pub fn get_fruts_error(arena: &DriveOpArena, chain: ChainKind,
                       ctx: &ClassifyCtx) -> (FruErrorStatus, Eboard)
{
    let mut eb = Eboard::default();
    for (_, op) in arena.iter(chain).filter(|(_, op)| !op.degraded_nop) {
        let pos = op.position;
        match op.status {
            OpStatus::Pending => {
                debug_assert!(false, "classifying an incomplete chain");
            }
            OpStatus::Done(DriveStatus::Ok, Qualifier::None) => (),
            OpStatus::Done(DriveStatus::Ok, Qualifier::CrcError) => {
                eb.crc_count += 1;
                eb.crc_bitmap.insert(pos);
            }
            OpStatus::Done(DriveStatus::MediaError(_), _) => {
                eb.hard_media_count += 1;
                eb.hard_media_bitmap.insert(pos);
            }
            OpStatus::Done(DriveStatus::Dead, _) => eb.dead(pos),
            OpStatus::Done(DriveStatus::Retryable, _) => {
                if op.retries >= ctx.max_retries {
                    tracing::warn!(pos, retries = op.retries,
                                   "retries exhausted; treating as dead");
                    eb.dead(pos);
                } else {
                    eb.retry_count += 1;
                    eb.retry_bitmap.insert(pos);
                }
            }
            OpStatus::Done(DriveStatus::Dropped, _) => {
                eb.drop_count += 1;
                eb.drop_bitmap.insert(pos);
            }
            OpStatus::Done(DriveStatus::Aborted, _) => {
                eb.abort_count += 1;
                eb.abort_bitmap.insert(pos);
            }
        }
    }
    // Positions already acknowledged dead don't count again
    let stale = eb.dead_bitmap.iter()
        .filter(|p| ctx.known_dead.contains(*p))
        .count() as u32;
    eb.dead_count -= stale;
    eb.dead_bitmap = eb.dead_bitmap.difference(ctx.known_dead);
    (eb.verdict(ctx), eb)
}

// LCOV_EXCL_STOP
