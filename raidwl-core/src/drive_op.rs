// vim: tw=80
//! DriveOps and the chains that own them
//!
//! Every DriveOp of a `StripeOp` lives in one `DriveOpArena` and is addressed
//! by a `DriveOpId`.  Each op belongs to exactly one of four chains: read,
//! secondary read, write, or freed.

use crate::{
    memory::{SgList, sg_bytes},
    transport::{DriveCompletion, DriveRequest, DriveStatus, Opcode, Qualifier},
    types::*,
    util::*,
};

#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct DriveOpId(u32);

#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum ChainKind {
    Read,
    Read2,
    Write,
    Freed,
}

impl ChainKind {
    fn idx(self) -> usize {
        match self {
            ChainKind::Read => 0,
            ChainKind::Read2 => 1,
            ChainKind::Write => 2,
            ChainKind::Freed => 3,
        }
    }
}

/// The original, unaligned range of a write that had to be widened to the
/// physical alignment unit.  Only this range carries new host data; the rest
/// of the write is seeded from the pre-read.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct PreRead {
    pub lba: LbaT,
    pub blocks: BlockCountT,
}

#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub enum OpStatus {
    /// Not yet dispatched, or dispatched and not yet complete
    #[default]
    Pending,
    Done(DriveStatus, Qualifier),
}

/// One read or write against one member position.
#[derive(Debug)]
pub struct DriveOp {
    pub position: PosT,
    pub opcode: Opcode,
    pub lba: LbaT,
    pub blocks: BlockCountT,
    /// The buffer.  Always exactly `blocks` blocks long.
    pub sg: SgList,
    pub preread: Option<PreRead>,
    /// Journal header block, written in front of the data while the op is
    /// aimed at a write log slot.
    pub header: Option<IoVec>,
    pub status: OpStatus,
    /// Skipped by the scheduler because its position is dead.
    pub degraded_nop: bool,
    pub retries: u32,
}

impl DriveOp {
    pub fn new(position: PosT, opcode: Opcode, lba: LbaT, blocks: BlockCountT,
               sg: SgList) -> Self
    {
        debug_assert_eq!(sg_bytes(&sg), blocks as usize * BYTES_PER_BLOCK);
        DriveOp {
            position,
            opcode,
            lba,
            blocks,
            sg,
            preread: None,
            header: None,
            status: OpStatus::Pending,
            degraded_nop: false,
            retries: 0,
        }
    }

    /// Build the transport request.  `data` is the gathered buffer, for
    /// writes.
    pub fn request(&self, data: Option<IoVec>) -> DriveRequest {
        let (lba, blocks) = if self.header.is_some() {
            (self.lba - 1, self.blocks + 1)
        } else {
            (self.lba, self.blocks)
        };
        DriveRequest {
            position: self.position,
            opcode: self.opcode,
            lba,
            blocks,
            data
        }
    }

    pub fn complete(&mut self, c: &DriveCompletion) {
        self.status = OpStatus::Done(c.status, c.qualifier);
    }

    pub fn is_ok(&self) -> bool {
        self.status == OpStatus::Done(DriveStatus::Ok, Qualifier::None)
    }
}

/// Owner of every DriveOp of one request.
#[derive(Debug, Default)]
pub struct DriveOpArena {
    ops: Vec<DriveOp>,
    chains: [Vec<DriveOpId>; 4],
}

impl DriveOpArena {
    /// Add a new op to the tail of `chain`.
    pub fn push(&mut self, chain: ChainKind, op: DriveOp) -> DriveOpId {
        let id = DriveOpId(self.ops.len() as u32);
        self.ops.push(op);
        self.chains[chain.idx()].push(id);
        id
    }

    pub fn chain(&self, chain: ChainKind) -> &[DriveOpId] {
        &self.chains[chain.idx()]
    }

    pub fn is_empty(&self, chain: ChainKind) -> bool {
        self.chains[chain.idx()].is_empty()
    }

    pub fn get(&self, id: DriveOpId) -> &DriveOp {
        &self.ops[id.0 as usize]
    }

    pub fn get_mut(&mut self, id: DriveOpId) -> &mut DriveOp {
        &mut self.ops[id.0 as usize]
    }

    /// Iterate over the ops of `chain`, in order.
    pub fn iter(&self, chain: ChainKind)
        -> impl Iterator<Item=(DriveOpId, &DriveOp)> + '_
    {
        self.chains[chain.idx()].iter().map(move |id| (*id, self.get(*id)))
    }

    /// Find the op of `chain` addressed to `position`.
    pub fn find(&self, chain: ChainKind, position: PosT) -> Option<DriveOpId> {
        self.iter(chain)
            .find(|(_, op)| op.position == position)
            .map(|(id, _)| id)
    }

    /// Number of ops in `chain` that will generate a completion when the
    /// chain is next dispatched.
    pub fn count_active(&self, chain: ChainKind) -> usize {
        self.iter(chain)
            .filter(|(_, op)| {
                !op.degraded_nop && op.status == OpStatus::Pending
            })
            .count()
    }

    /// Mark every op of `chain` addressed to a dead position as a nop.
    pub fn set_degraded_nop(&mut self, chain: ChainKind, dead: PosBitmap) {
        for id in self.chains[chain.idx()].clone() {
            let op = self.get_mut(id);
            if dead.contains(op.position) {
                op.degraded_nop = true;
            }
        }
    }

    /// Reset every op of `chain` so it can be dispatched again.
    pub fn reset(&mut self, chain: ChainKind) {
        for id in self.chains[chain.idx()].clone() {
            let op = self.get_mut(id);
            op.status = OpStatus::Pending;
            op.retries = 0;
        }
    }

    /// Move every op of `chain` onto the freed chain.
    pub fn retire(&mut self, chain: ChainKind) {
        debug_assert_ne!(chain, ChainKind::Freed);
        let mut ids = std::mem::take(&mut self.chains[chain.idx()]);
        self.chains[ChainKind::Freed.idx()].append(&mut ids);
    }

    /// Total number of ops ever allocated
    pub fn len(&self) -> usize {
        self.ops.len()
    }

    /// Check that no op is on more than one chain and every op is on one.
    pub fn chains_are_disjoint(&self) -> bool {
        let mut seen = vec![false; self.ops.len()];
        for chain in &self.chains {
            for id in chain {
                if std::mem::replace(&mut seen[id.0 as usize], true) {
                    return false;
                }
            }
        }
        seen.into_iter().all(|s| s)
    }
}

// LCOV_EXCL_STOP
