// vim: tw=80
//! The group monitor: the authority on which positions are dead

use crate::types::*;
use futures::{Future, future};
#[cfg(test)] use mockall::automock;
use serde_derive::{Deserialize, Serialize};
use std::{
    fmt,
    num::NonZeroU8,
    pin::Pin,
    sync::Mutex
};

/// Represents the health of a RAID group
///
/// The ordering reflects which Health is "sicker".
#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, PartialOrd, Ord,
         Serialize)]
pub enum Health {
    /// Perfectly healthy
    Online,
    /// Operating with reduced redundancy
    Degraded(NonZeroU8),
    /// More positions are missing than parity can cover.  No I/O is possible.
    Faulted,
}

impl fmt::Display for Health {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            Self::Online => "Online".fmt(f),
            Self::Degraded(n) => write!(f, "Degraded({})", n),
            Self::Faulted => "Faulted".fmt(f),
        }
    }
}

/// The monitor's answer when a request finds newly dead positions
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Decision {
    Continue,
    Shutdown,
}

pub type BoxDecisionFut = Pin<Box<dyn Future<Output=Decision> + Send>>;

/// Decides whether requests may continue after a position dies.
#[cfg_attr(test, automock)]
pub trait GroupMonitor: Send + Sync {
    /// Positions currently acknowledged as dead
    fn dead(&self) -> PosBitmap;

    /// Report newly dead positions and wait for a decision.
    fn continue_request(&self, newly_dead: PosBitmap) -> BoxDecisionFut;
}

/// A monitor that lets requests continue as long as parity covers every dead
/// position.
#[derive(Debug)]
pub struct RedundancyMonitor {
    parity: u16,
    dead: Mutex<PosBitmap>,
}

impl RedundancyMonitor {
    pub fn new(parity: u16) -> Self {
        RedundancyMonitor{parity, dead: Mutex::new(PosBitmap::EMPTY)}
    }

    pub fn health(&self) -> Health {
        let n = self.dead().count();
        if n > u32::from(self.parity) {
            Health::Faulted
        } else {
            NonZeroU8::new(n as u8)
                .map(Health::Degraded)
                .unwrap_or(Health::Online)
        }
    }
}

impl GroupMonitor for RedundancyMonitor {
    fn dead(&self) -> PosBitmap {
        *self.dead.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn continue_request(&self, newly_dead: PosBitmap) -> BoxDecisionFut {
        let mut guard = self.dead.lock().unwrap_or_else(|e| e.into_inner());
        *guard = guard.union(newly_dead);
        let decision = if guard.count() > u32::from(self.parity) {
            tracing::error!(dead = %*guard, "redundancy exhausted");
            Decision::Shutdown
        } else {
            tracing::warn!(dead = %*guard, "continuing degraded");
            Decision::Continue
        };
        Box::pin(future::ready(decision))
    }
}

// LCOV_EXCL_STOP
