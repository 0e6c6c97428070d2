// vim: tw=80
//! The small-write engine
//!
//! `WriteEngine` owns everything `StripeOp`s share: the geometry, the drive
//! transport, the buffer pool, the write log, and the group monitor.  Callers
//! decompose a host write into `StripeOp`s with [`WriteEngine::stripe_ops`]
//! and run each with [`WriteEngine::execute`], or do both with
//! [`WriteEngine::write`].

use crate::{
    config::GroupConfig,
    drive_op::{ChainKind, DriveOpArena},
    eboard::{ClassifyCtx, Eboard, FruErrorStatus, get_fruts_error},
    geometry::RaidGeometry,
    memory::{PagePool, PageSet},
    monitor::{Decision, GroupMonitor},
    planner::{self, RequestShape, ResourcePlan},
    scheduler,
    stripe_op::StripeOp,
    transport::DriveTransport,
    types::*,
    util::*,
    write_log::{self, WriteLog},
};
use futures::future;
use serde_derive::Serialize;
use std::sync::{
    Arc,
    atomic::{AtomicBool, AtomicU64, Ordering}
};

/// Running totals of the events callers only see through statistics
#[derive(Debug, Default)]
pub struct Stats {
    pub(crate) retries: AtomicU64,
    pub(crate) degraded_writes: AtomicU64,
    pub(crate) journaled_writes: AtomicU64,
    pub(crate) recovery_verifies: AtomicU64,
    pub(crate) shutdowns: AtomicU64,
    pub(crate) flush_replayed: AtomicU64,
    pub(crate) flush_abandoned: AtomicU64,
}

/// A point-in-time copy of [`Stats`]
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Serialize)]
pub struct StatsSnapshot {
    pub retries: u64,
    pub degraded_writes: u64,
    pub journaled_writes: u64,
    pub recovery_verifies: u64,
    pub shutdowns: u64,
    pub flush_replayed: u64,
    pub flush_abandoned: u64,
}

impl Stats {
    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            retries: self.retries.load(Ordering::Relaxed),
            degraded_writes: self.degraded_writes.load(Ordering::Relaxed),
            journaled_writes: self.journaled_writes.load(Ordering::Relaxed),
            recovery_verifies: self.recovery_verifies.load(Ordering::Relaxed),
            shutdowns: self.shutdowns.load(Ordering::Relaxed),
            flush_replayed: self.flush_replayed.load(Ordering::Relaxed),
            flush_abandoned: self.flush_abandoned.load(Ordering::Relaxed),
        }
    }
}

pub struct WriteEngine {
    geo: RaidGeometry,
    pub(crate) transport: Arc<dyn DriveTransport>,
    pub(crate) pages: PagePool,
    log: WriteLog,
    pub(crate) monitor: Arc<dyn GroupMonitor>,
    max_retries: u32,
    pub(crate) stats: Stats,
}

impl WriteEngine {
    pub fn new(cfg: &GroupConfig, transport: Arc<dyn DriveTransport>,
               monitor: Arc<dyn GroupMonitor>) -> Result<Self>
    {
        let geo = RaidGeometry::new(cfg)?;
        let pages = PagePool::new(cfg.buffer_blocks)?;
        let log = WriteLog::new(geo.clone(), transport.clone());
        tracing::debug!(width = geo.width(), parity = geo.parity_count(),
                        rows = geo.rows(), "write engine created");
        Ok(WriteEngine {
            geo,
            transport,
            pages,
            log,
            monitor,
            max_retries: cfg.max_retries,
            stats: Stats::default(),
        })
    }

    pub fn geometry(&self) -> &RaidGeometry {
        &self.geo
    }

    pub fn monitor(&self) -> &Arc<dyn GroupMonitor> {
        &self.monitor
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }

    pub fn write_log(&self) -> &WriteLog {
        &self.log
    }

    pub(crate) fn classify_ctx(&self, known_dead: PosBitmap, monitor_op: bool)
        -> ClassifyCtx
    {
        ClassifyCtx {
            parity_count: self.geo.parity_count(),
            known_dead,
            monitor_op,
            max_retries: self.max_retries,
        }
    }

    /// Plan every stripe row of a host write, without executing anything.
    pub fn plan(&self, lba: LbaT, blocks: BlockCountT)
        -> Result<Vec<ResourcePlan>>
    {
        let dead = self.monitor.dead();
        self.geo.decompose(lba, blocks)?
            .into_iter()
            .map(|range| {
                let layout = self.geo.layout(range.row);
                let shape = RequestShape {
                    range,
                    dead,
                    write_log_header_required:
                        write_log::is_write_logging_required(&self.geo, &range,
                                                             &layout, dead)
                };
                planner::plan(&self.geo, &shape)
            }).collect()
    }

    /// Split a host write into one `StripeOp` per stripe row.
    ///
    /// `data` must hold whole, sealed blocks.  Every returned op shares one
    /// abort flag.
    pub fn stripe_ops(&self, lba: LbaT, data: &[u8], queue: QueueT)
        -> Result<Vec<StripeOp>>
    {
        if data.is_empty() || data.len() % BYTES_PER_BLOCK != 0 {
            return Err(Error::Sizing);
        }
        let blocks = (data.len() / BYTES_PER_BLOCK) as BlockCountT;
        let aborted = Arc::new(AtomicBool::new(false));
        let ops = self.geo.decompose(lba, blocks)?
            .into_iter()
            .map(|range| {
                let s = (range.start_lba - lba) as usize * BYTES_PER_BLOCK;
                let e = s + range.xfer_count as usize * BYTES_PER_BLOCK;
                StripeOp::new(range, data[s..e].to_vec(), queue,
                              aborted.clone())
            }).collect();
        Ok(ops)
    }

    /// Run one `StripeOp` to its terminal status.
    ///
    /// `Err` is reserved for requests that could not even be attempted, such
    /// as planner sizing errors.  Every I/O outcome is a `Status`.
    #[tracing::instrument(skip(self, op),
                          fields(lba = op.range().start_lba,
                                 blocks = op.range().xfer_count))]
    pub async fn execute(&self, op: &mut StripeOp) -> Result<Status> {
        let r = op.run(self).await;
        if matches!(r, Ok(Status::ShutdownError)) {
            self.stats.shutdowns.fetch_add(1, Ordering::Relaxed);
        }
        match &r {
            Ok(Status::Success) => tracing::debug!("stripe op complete"),
            Ok(status) => tracing::warn!(%status, "stripe op failed"),
            Err(e) => tracing::error!(%e, "stripe op not attempted"),
        }
        r
    }

    /// Write `data` at host LBA `lba`.
    ///
    /// Every stripe row is written concurrently.  Returns the first
    /// unsuccessful status, in LBA order, or `Success`.
    pub async fn write(&self, lba: LbaT, data: &[u8]) -> Result<Status> {
        let mut ops = self.stripe_ops(lba, data, 0)?;
        let results = future::join_all(
            ops.iter_mut().map(|op| self.execute(op))
        ).await;
        let mut status = Status::Success;
        for r in results {
            let s = r?;
            if status == Status::Success {
                status = s;
            }
        }
        Ok(status)
    }

    /// Dispatch a sub-request chain until it stops asking for retries.
    ///
    /// Newly dead positions are reported to the monitor.  If it lets the
    /// request continue they join `dead`, and their ops become nops.
    ///
    /// A `monitor_op` is issued on the monitor's own behalf, so it can't wait
    /// for the monitor.  Newly dead positions still join `dead`, but the
    /// verdict is `Dead` and the caller decides what to do with it.
    pub(crate) async fn run_chain(&self, arena: &mut DriveOpArena,
                                  pages: &mut PageSet, chain: ChainKind,
                                  dead: &mut PosBitmap, monitor_op: bool)
        -> (FruErrorStatus, Eboard)
    {
        loop {
            if arena.count_active(chain) > 0 {
                scheduler::send_chain(&*self.transport, arena, pages, chain)
                    .await;
            }
            let ctx = self.classify_ctx(*dead, monitor_op);
            let (verdict, eb) = get_fruts_error(arena, chain, &ctx);
            match verdict {
                FruErrorStatus::Retry => {
                    self.stats.retries.fetch_add(u64::from(eb.retry_count),
                                                 Ordering::Relaxed);
                    scheduler::retry_chain(arena, chain, &eb, *dead);
                }
                FruErrorStatus::Waiting => {
                    let newly = eb.newly_dead(&ctx);
                    match self.monitor.continue_request(newly).await {
                        Decision::Continue => {
                            *dead = dead.union(newly);
                            arena.set_degraded_nop(chain, *dead);
                        }
                        Decision::Shutdown => {
                            return (FruErrorStatus::Shutdown, eb);
                        }
                    }
                }
                FruErrorStatus::Dead => {
                    let newly = eb.newly_dead(&ctx);
                    tracing::warn!(?newly, "position died under monitor op");
                    *dead = dead.union(newly);
                    arena.set_degraded_nop(chain, *dead);
                    return (verdict, eb);
                }
                _ => return (verdict, eb)
            }
        }
    }
}
