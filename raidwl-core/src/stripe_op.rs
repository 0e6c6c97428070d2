// vim: tw=80
//! StripeOp: one small write against one stripe row
//!
//! A `StripeOp` is an explicit state machine.  Each state has one step
//! function that returns the next state; `run` drives the steps until a
//! terminal status.  Waiting happens only inside a step, at the suspension
//! points: buffer allocation, chain dispatch, slot acquisition, and nested
//! recovery-verify.
//!
//! Healthy writes go Generate, Allocate, PreRead, Compute, Commit.  Writes
//! that need the write log insert AcquireSlot, Stage, and WriteSlot before
//! Commit and finish with Invalidate.

use crate::{
    block,
    drive_op::{ChainKind, DriveOp, DriveOpArena, DriveOpId},
    eboard::{Eboard, FruErrorStatus, get_fruts_error},
    engine::WriteEngine,
    geometry::{RaidGeometry, StripeRange},
    memory::{PageSet, PageSize, SgList},
    monitor::Decision,
    parity::{self, DataColumn, Extent, ParityColumn, ParityError,
             ParityVectors},
    planner::{self, Algorithm, RequestShape, ResourcePlan, Role},
    scheduler,
    transport::Opcode,
    types::*,
    util::*,
    write_log::{self, InvalidateResult, SlotHeader},
};
use std::sync::{
    Arc,
    atomic::{AtomicBool, Ordering}
};

/// How many recovery-verify excursions one request may take before giving
/// up
const MAX_VERIFIES: u32 = 2;

/// State machine entry points
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum State {
    /// Check redundancy, choose the algorithm, and plan resources
    Generate,
    /// Allocate buffers and build every DriveOp
    Allocate,
    /// Dispatch the read and secondary read chains
    PreRead,
    Compute,
    /// Repair the parity range after a read or checksum failure
    Verify,
    AcquireSlot,
    /// Aim the writes at the slot and attach their headers
    Stage,
    WriteSlot,
    /// Write the live stripe
    Commit,
    /// Invalidate and release the slot
    Invalidate,
    /// Clean up after an abort
    Abort,
    Done(Status),
}

#[derive(Clone, Copy, Debug, Default)]
struct Flags {
    /// Writes have been dispatched.  Abort is no longer honored.
    write_started: bool,
    write_log_header_required: bool,
    done_generating: bool,
    /// Journal writes have been dispatched to the slot
    slot_written: bool,
}

pub struct StripeOp {
    range: StripeRange,
    /// Host blocks for `range`, sealed by the host
    data: Vec<u8>,
    queue: QueueT,
    aborted: Arc<AtomicBool>,
    state: State,
    history: Vec<State>,
    dead: PosBitmap,
    plan: Option<ResourcePlan>,
    arena: DriveOpArena,
    pages: PageSet,
    /// One journal header buffer per write op, in write chain order
    header_sgs: Vec<SgList>,
    /// Live LBAs of write ops that are aimed at the slot
    live_lbas: Vec<(DriveOpId, LbaT)>,
    slot: Option<SlotT>,
    /// Reported once the slot is invalidated
    failure: Option<Status>,
    wait_count: usize,
    flags: Flags,
    verifies: u32,
}

fn empty_pages() -> PageSet {
    PageSet::unpooled(0, PageSize::Small)
}

impl StripeOp {
    pub(crate) fn new(range: StripeRange, data: Vec<u8>, queue: QueueT,
                      aborted: Arc<AtomicBool>) -> Self
    {
        debug_assert_eq!(data.len(),
                         range.xfer_count as usize * BYTES_PER_BLOCK);
        StripeOp {
            range,
            data,
            queue,
            aborted,
            state: State::Generate,
            history: Vec::new(),
            dead: PosBitmap::EMPTY,
            plan: None,
            arena: DriveOpArena::default(),
            pages: empty_pages(),
            header_sgs: Vec::new(),
            live_lbas: Vec::new(),
            slot: None,
            failure: None,
            wait_count: 0,
            flags: Flags::default(),
            verifies: 0,
        }
    }

    /// Request that the op stop at its next state boundary.  Ops that have
    /// already started writing run to completion.
    pub fn abort(&self) {
        self.aborted.store(true, Ordering::Relaxed);
    }

    /// The flag shared by every op of one host write
    pub fn abort_handle(&self) -> Arc<AtomicBool> {
        self.aborted.clone()
    }

    pub fn algorithm(&self) -> Option<Algorithm> {
        self.plan.as_ref().map(|p| p.algorithm)
    }

    pub fn arena(&self) -> &DriveOpArena {
        &self.arena
    }

    pub fn dead(&self) -> PosBitmap {
        self.dead
    }

    /// Every state entered, in order
    pub fn history(&self) -> &[State] {
        &self.history
    }

    pub fn range(&self) -> &StripeRange {
        &self.range
    }

    pub fn slot(&self) -> Option<SlotT> {
        self.slot
    }

    pub fn state(&self) -> State {
        self.state
    }

    /// Number of DriveOps outstanding.  Zero whenever no chain is in flight.
    pub fn wait_count(&self) -> usize {
        self.wait_count
    }

    fn is_aborted(&self) -> bool {
        self.aborted.load(Ordering::Relaxed)
    }

    fn plan(&self) -> Result<&ResourcePlan> {
        self.plan.as_ref().ok_or(Error::Sizing)
    }

    /// Drive the state machine to a terminal status.
    pub(crate) async fn run(&mut self, eng: &WriteEngine) -> Result<Status> {
        let r = self.drive(eng).await;
        self.cleanup(eng);
        r
    }

    async fn drive(&mut self, eng: &WriteEngine) -> Result<Status> {
        loop {
            if let State::Done(status) = self.state {
                return Ok(status);
            }
            self.history.push(self.state);
            let abortable = !self.flags.write_started &&
                !matches!(self.state, State::Abort);
            let next = if abortable && self.is_aborted() {
                State::Abort
            } else {
                self.step(eng).await?
            };
            tracing::trace!(from = ?self.state, to = ?next, "stripe op step");
            self.state = next;
        }
    }

    async fn step(&mut self, eng: &WriteEngine) -> Result<State> {
        match self.state {
            State::Generate => self.generate(eng),
            State::Allocate => self.allocate(eng).await,
            State::PreRead => self.pre_read(eng).await,
            State::Compute => self.compute(eng),
            State::Verify => self.verify(eng).await,
            State::AcquireSlot => self.acquire_slot(eng).await,
            State::Stage => self.stage(eng),
            State::WriteSlot => self.write_slot(eng).await,
            State::Commit => self.commit(eng).await,
            State::Invalidate => self.invalidate(eng).await,
            State::Abort => Ok(self.abort_cleanup(eng)),
            State::Done(s) => Ok(State::Done(s)),
        }
    }

    fn cleanup(&mut self, eng: &WriteEngine) {
        if let Some(slot) = self.slot.take() {
            let pool = eng.write_log().pool();
            if self.flags.slot_written {
                // The journal copy may be all that's left of the write
                pool.orphan(slot);
            } else {
                pool.release(slot);
            }
        }
        // Return the buffers to the pool
        self.pages = empty_pages();
        self.wait_count = 0;
    }

    fn abort_cleanup(&mut self, eng: &WriteEngine) -> State {
        tracing::info!(lba = self.range.start_lba, "stripe op aborted");
        self.cleanup(eng);
        State::Done(Status::Aborted)
    }

    fn generate(&mut self, eng: &WriteEngine) -> Result<State> {
        let geo = eng.geometry();
        self.dead = self.dead.union(eng.monitor().dead());
        if self.dead.count() > u32::from(geo.parity_count()) {
            tracing::error!(dead = %self.dead, "redundancy exhausted");
            return Ok(State::Done(Status::ShutdownError));
        }
        // A regenerated op starts over with fresh resources
        self.arena = DriveOpArena::default();
        self.pages = empty_pages();
        self.header_sgs.clear();
        self.live_lbas.clear();
        let layout = geo.layout(self.range.row);
        self.flags.write_log_header_required =
            write_log::is_write_logging_required(geo, &self.range, &layout,
                                                 self.dead);
        let shape = RequestShape {
            range: self.range,
            dead: self.dead,
            write_log_header_required: self.flags.write_log_header_required
        };
        let plan = planner::plan(geo, &shape)?;
        tracing::debug!(algorithm = ?plan.algorithm, pages = plan.page_count,
                        journal = self.flags.write_log_header_required,
                        "planned");
        self.plan = Some(plan);
        self.flags.done_generating = true;
        Ok(State::Allocate)
    }

    async fn allocate(&mut self, eng: &WriteEngine) -> Result<State> {
        debug_assert!(self.flags.done_generating);
        let plan = self.plan()?.clone();
        self.pages = match eng.pages.request(plan.page_count, plan.page_size)
            .await
        {
            Ok(pages) => pages,
            Err(e) => {
                tracing::warn!(%e, pages = plan.page_count,
                               "buffer allocation failed");
                return Ok(State::Done(Status::AllocationFailed));
            }
        };
        for (chain, frus) in [(ChainKind::Read, &plan.reads),
                              (ChainKind::Read2, &plan.reads2)]
        {
            for f in frus.iter() {
                let sg = self.pages.carve(f.blocks)?;
                self.arena.push(chain, DriveOp::new(f.position, Opcode::Read,
                                                    f.lba, f.blocks, sg));
            }
        }
        for f in plan.writes.iter() {
            let mut sg = SgList::new();
            for piece in planner::write_pieces(f) {
                sg.extend(self.pages.carve(piece)?);
            }
            let mut op = DriveOp::new(f.position, Opcode::Write, f.lba,
                                      f.blocks, sg);
            op.preread = f.preread;
            if let Role::Data(idx) = f.role {
                self.fill_host_data(eng.geometry(), idx, &op)?;
            }
            self.arena.push(ChainKind::Write, op);
        }
        let per_write = plan.header_blocks / plan.writes.len().max(1) as u64;
        if per_write > 0 {
            for _ in plan.writes.iter() {
                self.header_sgs.push(self.pages.carve(per_write)?);
            }
        }
        for chain in [ChainKind::Read, ChainKind::Read2, ChainKind::Write] {
            self.arena.set_degraded_nop(chain, self.dead);
        }
        debug_assert!(self.arena.chains_are_disjoint());
        Ok(State::PreRead)
    }

    /// Copy the host blocks for data index `idx` into its write buffer.
    /// Alignment padding is filled in later, from the pre-read.
    fn fill_host_data(&mut self, geo: &RaidGeometry, idx: usize, op: &DriveOp)
        -> Result<()>
    {
        let w = geo.column_write(&self.range, idx).ok_or(Error::Sizing)?;
        let host_first = geo.host_lba(idx, w.start) - self.range.start_lba;
        let s = host_first as usize * BYTES_PER_BLOCK;
        let e = s + (w.end - w.start) as usize * BYTES_PER_BLOCK;
        let mut buf = vec![0u8; op.blocks as usize * BYTES_PER_BLOCK];
        let off = (w.start - op.lba) as usize * BYTES_PER_BLOCK;
        buf[off..off + (e - s)].copy_from_slice(&self.data[s..e]);
        self.pages.scatter(&op.sg, &buf);
        Ok(())
    }

    /// Dispatch `chain` until it stops asking for retries, then classify
    /// it.
    async fn dispatch(&mut self, eng: &WriteEngine, chain: ChainKind)
        -> (FruErrorStatus, Eboard)
    {
        loop {
            self.wait_count = self.arena.count_active(chain);
            if self.wait_count > 0 {
                let n = scheduler::send_chain(&*eng.transport,
                                              &mut self.arena,
                                              &mut self.pages, chain).await;
                debug_assert_eq!(n, self.wait_count);
            }
            self.wait_count = 0;
            let ctx = eng.classify_ctx(self.dead, false);
            let (verdict, eb) = get_fruts_error(&self.arena, chain, &ctx);
            if verdict != FruErrorStatus::Retry {
                return (verdict, eb);
            }
            eng.stats.retries.fetch_add(u64::from(eb.retry_count),
                                        Ordering::Relaxed);
            scheduler::retry_chain(&mut self.arena, chain, &eb, self.dead);
        }
    }

    /// Ask the monitor whether to go on without the newly dead positions.
    async fn acknowledge(&mut self, eng: &WriteEngine, eb: &Eboard) -> bool {
        let newly = eb.dead_bitmap.difference(self.dead);
        tracing::warn!(newly_dead = %newly, "position died mid-request");
        match eng.monitor().continue_request(newly).await {
            Decision::Continue => {
                self.dead = self.dead.union(newly);
                true
            }
            Decision::Shutdown => false
        }
    }

    async fn pre_read(&mut self, eng: &WriteEngine) -> Result<State> {
        for chain in [ChainKind::Read, ChainKind::Read2] {
            let (verdict, eb) = self.dispatch(eng, chain).await;
            match verdict {
                FruErrorStatus::Success => (),
                FruErrorStatus::Waiting => {
                    return if self.acknowledge(eng, &eb).await {
                        // The algorithm may change now that it's degraded
                        Ok(State::Generate)
                    } else {
                        Ok(State::Done(Status::ShutdownError))
                    };
                }
                FruErrorStatus::Shutdown => {
                    return Ok(State::Done(Status::ShutdownError));
                }
                FruErrorStatus::Retry | FruErrorStatus::Dead => {
                    unreachable!("stripe ops are never monitor ops")
                }
                FruErrorStatus::Error if eb.abort_count > 0 => {
                    return Ok(State::Done(Status::Aborted));
                }
                FruErrorStatus::Error => {
                    tracing::warn!(?chain, media = %eb.hard_media_bitmap,
                                   crc = %eb.crc_bitmap,
                                   dropped = %eb.drop_bitmap,
                                   "pre-read failed");
                    return Ok(State::Verify);
                }
            }
        }
        Ok(State::Compute)
    }

    async fn verify(&mut self, eng: &WriteEngine) -> Result<State> {
        self.verifies += 1;
        if self.verifies > MAX_VERIFIES {
            tracing::error!(verifies = self.verifies,
                            "recovery verify did not converge");
            return Ok(State::Done(Status::ShutdownError));
        }
        let span = self.plan()?.parity_range.clone();
        let report = eng.recovery_verify(self.range.row, span).await?;
        if report.status != Status::Success {
            return Ok(State::Done(report.status));
        }
        self.arena.reset(ChainKind::Read);
        self.arena.reset(ChainKind::Read2);
        Ok(State::PreRead)
    }

    fn extent(&self, id: DriveOpId) -> Extent {
        let op = self.arena.get(id);
        Extent::new(op.lba, self.pages.gather(&op.sg))
    }

    /// Rebuild the dead columns of a degraded pre-read.  Returns every data
    /// column over the parity range, by data index.
    fn reconstruct_degraded(&self, geo: &RaidGeometry, plan: &ResourcePlan)
        -> std::result::Result<Vec<Extent>, ParityError>
    {
        let layout = &plan.layout;
        let start = plan.parity_range.start;
        let len = (plan.parity_range.end - start) as usize * BYTES_PER_BLOCK;
        let column = |pos: PosT| {
            self.arena.find(ChainKind::Read, pos)
                .filter(|id| self.arena.get(*id).is_ok())
                .map(|id| self.pages.gather(&self.arena.get(id).sg))
        };
        let mut erased = Vec::new();
        let mut data = Vec::with_capacity(layout.data.len());
        for (idx, pos) in layout.data.iter().enumerate() {
            match column(*pos) {
                Some(buf) => {
                    // Survivors must be sound before they are trusted
                    for (i, blk) in buf.chunks_exact(BYTES_PER_BLOCK)
                        .enumerate()
                    {
                        let lba = geo.host_lba(idx, start + i as LbaT);
                        if block::check_data(blk, lba).is_err() {
                            return Err(ParityError::Checksum);
                        }
                    }
                    data.push(buf);
                }
                None => {
                    erased.push(idx);
                    data.push(vec![0u8; len]);
                }
            }
        }
        let mut parity_ok = Vec::with_capacity(layout.parity.len());
        let mut pbufs = Vec::with_capacity(layout.parity.len());
        for pos in layout.parity.iter() {
            match column(*pos) {
                Some(buf) => {
                    for (i, blk) in buf.chunks_exact(BYTES_PER_BLOCK)
                        .enumerate()
                    {
                        let stamp = geo.row_stamp(start + i as LbaT);
                        match block::check_parity(blk, stamp) {
                            block::BlockCheck::BadCrc => {
                                return Err(ParityError::Checksum);
                            }
                            block::BlockCheck::BadLbaStamp => {
                                return Err(ParityError::Consistency);
                            }
                            _ => ()
                        }
                    }
                    parity_ok.push(true);
                    pbufs.push(buf);
                }
                None => {
                    parity_ok.push(false);
                    pbufs.push(vec![0u8; len]);
                }
            }
        }
        if !parity::reconstruct(&mut data, &pbufs, &erased, &parity_ok) {
            return Err(ParityError::Consistency);
        }
        for idx in erased {
            for (i, blk) in data[idx].chunks_exact_mut(BYTES_PER_BLOCK)
                .enumerate()
            {
                block::seal(blk);
                block::stamp_lba(blk, geo.host_lba(idx, start + i as LbaT));
            }
        }
        Ok(data.into_iter().map(|buf| Extent::new(start, buf)).collect())
    }

    fn vectors(&self, geo: &RaidGeometry, plan: &ResourcePlan)
        -> std::result::Result<ParityVectors, ParityError>
    {
        let layout = &plan.layout;
        let mut data = (0..layout.data.len())
            .map(|index| DataColumn{index, ..Default::default()})
            .collect::<Vec<_>>();
        let mut parity_old = vec![None; layout.parity.len()];
        if plan.algorithm == Algorithm::DegradedRcw {
            for (col, ext) in data.iter_mut()
                .zip(self.reconstruct_degraded(geo, plan)?)
            {
                col.old.push(ext);
            }
        } else {
            for chain in [ChainKind::Read, ChainKind::Read2] {
                for (id, op) in self.arena.iter(chain) {
                    if let Some(idx) = layout.data_index(op.position) {
                        data[idx].old.push(self.extent(id));
                    } else if let Some(pidx) =
                        layout.parity_index(op.position)
                    {
                        parity_old[pidx] = Some(self.extent(id));
                    }
                }
            }
        }
        let mut parity = Vec::with_capacity(layout.parity.len());
        for (id, op) in self.arena.iter(ChainKind::Write) {
            // Writes to dead positions are nops, but their data still
            // contributes to parity.
            if let Some(idx) = layout.data_index(op.position) {
                data[idx].new = Some(self.extent(id));
                data[idx].host = op.preread.map(|p| p.lba..p.lba + p.blocks);
            } else if let Some(pidx) = layout.parity_index(op.position) {
                let blank = vec![0u8; op.blocks as usize * BYTES_PER_BLOCK];
                parity.push(ParityColumn {
                    index: pidx,
                    old: parity_old[pidx].take(),
                    new: Extent::new(op.lba, blank)
                });
            }
        }
        data.retain(|c| c.new.is_some() || !c.old.is_empty());
        Ok(ParityVectors{data, parity})
    }

    fn compute(&mut self, eng: &WriteEngine) -> Result<State> {
        let geo = eng.geometry();
        let plan = self.plan()?.clone();
        let r = self.vectors(geo, &plan)
            .and_then(|mut v| {
                parity::compute_parity(geo, plan.algorithm, &mut v)?;
                Ok(v)
            });
        let v = match r {
            Ok(v) => v,
            Err(ParityError::BadHostData) => {
                return Ok(State::Done(Status::WriteCrcError));
            }
            Err(e) => {
                tracing::warn!(?e, "pre-read data failed its checks");
                return Ok(State::Verify);
            }
        };
        for col in v.data.iter() {
            let Some(new) = &col.new else { continue };
            let pos = plan.layout.data[col.index];
            if let Some(id) = self.arena.find(ChainKind::Write, pos) {
                let sg = self.arena.get(id).sg.clone();
                self.pages.scatter(&sg, &new.buf);
            }
        }
        for p in v.parity.iter() {
            let pos = plan.layout.parity[p.index];
            if let Some(id) = self.arena.find(ChainKind::Write, pos) {
                let sg = self.arena.get(id).sg.clone();
                self.pages.scatter(&sg, &p.new.buf);
            }
        }
        if self.flags.write_log_header_required {
            Ok(State::AcquireSlot)
        } else {
            Ok(State::Commit)
        }
    }

    async fn acquire_slot(&mut self, eng: &WriteEngine) -> Result<State> {
        match eng.write_log().pool().acquire(self.queue).await {
            Ok(slot) => {
                tracing::debug!(slot, "acquired write log slot");
                self.slot = Some(slot);
                Ok(State::Stage)
            }
            Err(Error::Aborted) => Ok(State::Done(Status::Aborted)),
            Err(e) => Err(e)
        }
    }

    fn stage(&mut self, eng: &WriteEngine) -> Result<State> {
        let geo = eng.geometry();
        let slot = self.slot.ok_or(Error::InvalidSlot)?;
        let base = geo.slot_base(slot)?;
        let generation = eng.write_log().next_generation();
        let bitmap = self.arena.iter(ChainKind::Write)
            .map(|(_, op)| op.position)
            .filter(|p| !self.dead.contains(*p))
            .collect::<PosBitmap>();
        let ids = self.arena.chain(ChainKind::Write).to_vec();
        for (id, hsg) in ids.into_iter().zip(self.header_sgs.iter()) {
            let op = self.arena.get(id);
            let data = self.pages.gather(&op.sg);
            let hdr = SlotHeader::new(generation, &self.range, bitmap, op.lba,
                                      &data)
                .encode(base)?;
            self.pages.scatter(hsg, &hdr);
            let header = iovec_from(self.pages.gather(hsg));
            let live = op.lba;
            let op = self.arena.get_mut(id);
            op.lba = geo.journal_lba(slot, live, live)?;
            op.header = Some(header);
            self.live_lbas.push((id, live));
        }
        eng.stats.journaled_writes.fetch_add(1, Ordering::Relaxed);
        tracing::debug!(slot, generation, %bitmap, "staged journal write");
        Ok(State::WriteSlot)
    }

    async fn write_slot(&mut self, eng: &WriteEngine) -> Result<State> {
        let slot = self.slot.ok_or(Error::InvalidSlot)?;
        self.flags.write_started = true;
        self.flags.slot_written = true;
        loop {
            let (verdict, eb) = self.dispatch(eng, ChainKind::Write).await;
            match verdict {
                FruErrorStatus::Success => return Ok(State::Commit),
                FruErrorStatus::Waiting => {
                    if !self.acknowledge(eng, &eb).await {
                        return Ok(self.fail_slot(Status::ShutdownError));
                    }
                    eng.write_log().pool().set_invalidate_dead(slot);
                    self.arena.set_degraded_nop(ChainKind::Write, self.dead);
                }
                FruErrorStatus::Error => {
                    tracing::warn!(slot, media = %eb.hard_media_bitmap,
                                   dropped = %eb.drop_bitmap,
                                   "journal write incomplete; continuing");
                    return Ok(State::Commit);
                }
                FruErrorStatus::Shutdown => {
                    return Ok(self.fail_slot(Status::ShutdownError));
                }
                FruErrorStatus::Retry | FruErrorStatus::Dead => {
                    unreachable!("stripe ops are never monitor ops")
                }
            }
        }
    }

    /// The journal write failed before the live stripe was touched.  The
    /// partial journal copy must be invalidated before failing the op.
    fn fail_slot(&mut self, status: Status) -> State {
        tracing::error!(slot = ?self.slot, ?status, "journal write failed");
        self.failure = Some(status);
        State::Invalidate
    }

    async fn commit(&mut self, eng: &WriteEngine) -> Result<State> {
        for (id, live) in self.live_lbas.drain(..) {
            let op = self.arena.get_mut(id);
            op.lba = live;
            op.header = None;
        }
        self.arena.reset(ChainKind::Write);
        self.flags.write_started = true;
        loop {
            let (verdict, eb) = self.dispatch(eng, ChainKind::Write).await;
            match verdict {
                FruErrorStatus::Success => break,
                FruErrorStatus::Waiting => {
                    if !self.acknowledge(eng, &eb).await {
                        return Ok(State::Done(Status::ShutdownError));
                    }
                    if let Some(slot) = self.slot {
                        eng.write_log().pool().set_invalidate_dead(slot);
                    }
                    self.arena.set_degraded_nop(ChainKind::Write, self.dead);
                }
                FruErrorStatus::Error => {
                    tracing::warn!(media = %eb.hard_media_bitmap,
                                   dropped = %eb.drop_bitmap,
                                   "live write failed");
                    let span = self.plan()?.parity_range.clone();
                    let report = eng.recovery_verify(self.range.row, span)
                        .await?;
                    if report.status != Status::Success {
                        return Ok(State::Done(report.status));
                    }
                    break;
                }
                // The live stripe may be half written, so a journal copy
                // stays valid for recovery to replay.
                FruErrorStatus::Shutdown => {
                    return Ok(State::Done(Status::ShutdownError));
                }
                FruErrorStatus::Retry | FruErrorStatus::Dead => {
                    unreachable!("stripe ops are never monitor ops")
                }
            }
        }
        if !self.dead.is_empty() {
            eng.stats.degraded_writes.fetch_add(1, Ordering::Relaxed);
        }
        if self.slot.is_some() {
            Ok(State::Invalidate)
        } else {
            Ok(State::Done(Status::Success))
        }
    }

    async fn invalidate(&mut self, eng: &WriteEngine) -> Result<State> {
        let slot = self.slot.ok_or(Error::InvalidSlot)?;
        let r = eng.write_log().invalidate(slot, self.dead).await?;
        // Released, or orphaned, by the invalidation
        self.slot = None;
        let status = match r {
            InvalidateResult::Incomplete => Status::ShutdownError,
            InvalidateResult::Dead => Status::DeadError,
            InvalidateResult::Success | InvalidateResult::AlreadyFree => {
                Status::Success
            }
        };
        Ok(State::Done(self.failure.unwrap_or(status)))
    }
}
