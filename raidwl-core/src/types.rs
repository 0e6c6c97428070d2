// vim: tw=80
//! Common type definitions used throughout the write engine

use divbuf::{DivBuf, DivBufMut};
use serde_derive::{Deserialize, Serialize};
use std::fmt::{self, Display, Formatter};
use thiserror::Error;

/// Our `IoVec`.  Reference-counted so a block buffer can have more than one
/// owner, for example a journal write and the live write that follows it.
pub type IoVec = DivBuf;

/// Mutable version of `IoVec`.  Uniquely owned.
pub type IoVecMut = DivBufMut;

/// Indexes a block on a member drive, or on the host's address space.
pub type LbaT = u64;

/// A count of blocks
pub type BlockCountT = u64;

/// A member position within a RAID group
pub type PosT = u16;

/// Identifies one write-log slot
pub type SlotT = u32;

/// Identifies the submission queue (usually a CPU) that issued a request.
pub type QueueT = u32;

/// The widest group supported.  Position bitmaps are 16 bits wide.
pub const MAX_WIDTH: usize = 16;

/// Errors that indicate a request could not even be attempted.
///
/// I/O outcomes are not `Error`s; they are reported through the terminal
/// [`Status`] of each `StripeOp`.
#[derive(Clone, Copy, Debug, Deserialize, Error, Eq, PartialEq, Serialize)]
pub enum Error {
    #[error("Block count arithmetic overflowed")]
    Sizing,
    #[error("Too many scatter-gather elements for any size class")]
    OutOfResource,
    #[error("Memory allocation failed")]
    AllocationFailed,
    #[error("Invalid RAID geometry")]
    InvalidGeometry,
    #[error("Invalid configuration")]
    InvalidConfig,
    #[error("Request aborted")]
    Aborted,
    #[error("The write log slot pool is quiesced")]
    SlotPoolQuiesced,
    #[error("No such write log slot")]
    InvalidSlot,
    #[error("Serialization error")]
    Serialization,
}

impl From<bincode::Error> for Error {
    fn from(_e: bincode::Error) -> Self {
        Error::Serialization
    }
}

impl From<serde_yaml_ng::Error> for Error {
    fn from(_e: serde_yaml_ng::Error) -> Self {
        Error::InvalidConfig
    }
}

pub type Result<T> = ::std::result::Result<T, Error>;

/// The one terminal status every `StripeOp` completes with.
#[derive(Clone, Copy, Debug, Default, Deserialize, Eq, Hash, PartialEq,
         Serialize)]
pub enum Status {
    #[default]
    Success,
    /// Failures exceeded the group's redundancy.
    ShutdownError,
    /// A position died during an operation that cannot wait for the monitor.
    DeadError,
    /// The host supplied blocks with invalid checksums.
    WriteCrcError,
    Aborted,
    /// Buffers could not be allocated.  Distinct from any I/O failure.
    AllocationFailed,
}

impl Display for Status {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        let s = match self {
            Status::Success => "success",
            Status::ShutdownError => "shutdown error",
            Status::DeadError => "dead error",
            Status::WriteCrcError => "write CRC error",
            Status::Aborted => "aborted",
            Status::AllocationFailed => "allocation failed",
        };
        f.write_str(s)
    }
}

/// A set of member positions.
#[derive(Clone, Copy, Debug, Default, Deserialize, Eq, Hash, Ord, PartialEq,
         PartialOrd, Serialize)]
pub struct PosBitmap(pub u16);

impl PosBitmap {
    pub const EMPTY: PosBitmap = PosBitmap(0);

    pub fn single(pos: PosT) -> Self {
        debug_assert!((pos as usize) < MAX_WIDTH);
        PosBitmap(1 << pos)
    }

    pub fn contains(&self, pos: PosT) -> bool {
        (pos as usize) < MAX_WIDTH && self.0 & (1 << pos) != 0
    }

    pub fn count(&self) -> u32 {
        self.0.count_ones()
    }

    pub fn insert(&mut self, pos: PosT) {
        debug_assert!((pos as usize) < MAX_WIDTH);
        self.0 |= 1 << pos;
    }

    pub fn is_empty(&self) -> bool {
        self.0 == 0
    }

    pub fn iter(&self) -> impl Iterator<Item=PosT> + '_ {
        (0..MAX_WIDTH as PosT).filter(move |p| self.contains(*p))
    }

    pub fn remove(&mut self, pos: PosT) {
        if (pos as usize) < MAX_WIDTH {
            self.0 &= !(1 << pos);
        }
    }

    pub fn union(self, other: PosBitmap) -> PosBitmap {
        PosBitmap(self.0 | other.0)
    }

    pub fn difference(self, other: PosBitmap) -> PosBitmap {
        PosBitmap(self.0 & !other.0)
    }
}

impl Display for PosBitmap {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        write!(f, "{:#06x}", self.0)
    }
}

impl FromIterator<PosT> for PosBitmap {
    fn from_iter<I: IntoIterator<Item=PosT>>(iter: I) -> Self {
        let mut bm = PosBitmap::EMPTY;
        for p in iter {
            bm.insert(p);
        }
        bm
    }
}

// LCOV_EXCL_STOP
