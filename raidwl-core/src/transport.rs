// vim: tw=80
//! The drive transport seam
//!
//! The write engine never talks to drives directly.  It hands each DriveOp to
//! a `DriveTransport` and expects exactly one completion per submission.

use crate::types::*;
use futures::Future;
#[cfg(test)] use mockall::automock;
use std::pin::Pin;

#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum Opcode {
    Read,
    Write,
}

/// Outcome of one drive request.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum DriveStatus {
    Ok,
    /// Unrecoverable media error at the given drive LBA
    MediaError(LbaT),
    /// The drive is gone or not ready
    Dead,
    /// A transient failure.  The same request may succeed if retried.
    Retryable,
    /// The drive declined an optional request
    Dropped,
    Aborted,
}

/// Extra detail about a completion
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub enum Qualifier {
    #[default]
    None,
    /// The drive detected a checksum error in the data it returned
    CrcError,
}

/// One request handed to the transport.
#[derive(Clone, Debug)]
pub struct DriveRequest {
    pub position: PosT,
    pub opcode: Opcode,
    pub lba: LbaT,
    pub blocks: BlockCountT,
    /// Payload for writes.  Exactly `blocks` blocks long.
    pub data: Option<IoVec>,
}

/// The one completion delivered for each `DriveRequest`.
#[derive(Clone, Debug)]
pub struct DriveCompletion {
    pub status: DriveStatus,
    pub qualifier: Qualifier,
    /// Payload for successful reads
    pub data: Option<IoVec>,
}

impl DriveCompletion {
    pub fn ok(data: Option<IoVec>) -> Self {
        DriveCompletion{status: DriveStatus::Ok, qualifier: Qualifier::None,
                        data}
    }

    pub fn err(status: DriveStatus) -> Self {
        DriveCompletion{status, qualifier: Qualifier::None, data: None}
    }
}

pub type BoxDriveFut = Pin<Box<dyn Future<Output=DriveCompletion> + Send>>;

/// Moves blocks to and from member drives.
#[cfg_attr(test, automock)]
pub trait DriveTransport: Send + Sync {
    /// Submit one request.  The returned future completes exactly once.
    fn submit(&self, req: DriveRequest) -> BoxDriveFut;
}
