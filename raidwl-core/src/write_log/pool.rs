// vim: tw=80
//! The shared write log slot pool
//!
//! The pool is the only state shared between `StripeOp`s.  Slots are handed out
//! first-come first-served: once anybody is waiting, new acquirers queue behind
//! them even if a slot is free.

use crate::types::*;
use fixedbitset::FixedBitSet;
use futures::{
    Future,
    channel::oneshot,
    task::{Context, Poll}
};
use pin_project::{pin_project, pinned_drop};
use std::{
    collections::VecDeque,
    pin::Pin,
    sync::{Arc, Mutex, MutexGuard, PoisonError}
};

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum SlotState {
    Free,
    /// Held by a `StripeOp`
    Allocated,
    /// Reserved by journal recovery, before its headers are read
    AllocatedForFlush,
    /// Journal recovery is replaying the slot
    Flushing,
    /// The owner gave up before the slot's invalidation was durable.  Only
    /// journal recovery may take it.
    Orphaned,
}

/// How a slot's eventual invalidation must be reported
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub enum InvalidateState {
    #[default]
    Success,
    /// A position died while the slot was being written
    Dead,
}

#[derive(Debug)]
struct Waiter {
    queue: QueueT,
    tx: oneshot::Sender<Result<SlotT>>,
}

#[derive(Debug)]
struct Inner {
    states: Vec<SlotState>,
    invalidate: Vec<InvalidateState>,
    free: FixedBitSet,
    waiters: VecDeque<Waiter>,
    quiesced: bool,
}

impl Inner {
    fn take_free(&mut self, state: SlotState) -> Option<SlotT> {
        let slot = self.free.ones().next()?;
        self.free.set(slot, false);
        self.states[slot] = state;
        self.invalidate[slot] = InvalidateState::Success;
        Some(slot as SlotT)
    }

    /// Hand free slots to waiters, oldest first.
    fn wake(&mut self) {
        while !self.quiesced && !self.waiters.is_empty() {
            let Some(slot) = self.take_free(SlotState::Allocated) else {
                break;
            };
            let mut delivered = false;
            while let Some(w) = self.waiters.pop_front() {
                tracing::trace!(slot, queue = w.queue, "slot handed to waiter");
                // A failed send means that waiter gave up
                if w.tx.send(Ok(slot)).is_ok() {
                    delivered = true;
                    break;
                }
            }
            if !delivered {
                self.states[slot as usize] = SlotState::Free;
                self.free.insert(slot as usize);
            }
        }
    }
}

/// The pool of write log slots
#[derive(Debug)]
pub struct SlotPool {
    inner: Mutex<Inner>,
}

impl SlotPool {
    /// The pool's state stays consistent even if a holder panicked.
    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn new(slots: SlotT) -> Arc<Self> {
        let n = slots as usize;
        let mut free = FixedBitSet::with_capacity(n);
        free.insert_range(..);
        let inner = Inner {
            states: vec![SlotState::Free; n],
            invalidate: vec![InvalidateState::Success; n],
            free,
            waiters: VecDeque::new(),
            quiesced: false,
        };
        Arc::new(SlotPool{inner: Mutex::new(inner)})
    }

    /// Acquire a slot on behalf of a request issued from `queue`.
    ///
    /// The returned future completes once a slot is assigned.  Dropping it
    /// before then gives up the place in line, and returns the slot if one
    /// had already been assigned.
    pub fn acquire(self: &Arc<Self>, queue: QueueT) -> Acquire {
        let mut inner = self.lock();
        let ready = if !inner.quiesced && inner.waiters.is_empty() {
            inner.take_free(SlotState::Allocated)
        } else {
            None
        };
        let rx = if ready.is_none() {
            let (tx, rx) = oneshot::channel();
            tracing::debug!(queue, waiters = inner.waiters.len(),
                            "waiting for a write log slot");
            inner.waiters.push_back(Waiter{queue, tx});
            Some(rx)
        } else {
            None
        };
        Acquire {
            pool: self.clone(),
            ready: ready.map(Ok),
            rx,
            done: false
        }
    }

    /// Acquire a slot only if one is immediately available.
    pub fn try_acquire(&self) -> Result<Option<SlotT>> {
        let mut inner = self.lock();
        if inner.quiesced {
            return Err(Error::SlotPoolQuiesced);
        }
        if !inner.waiters.is_empty() {
            return Ok(None);
        }
        Ok(inner.take_free(SlotState::Allocated))
    }

    /// Return a slot to the pool.  Its invalidation must already be durable.
    pub fn release(&self, slot: SlotT) {
        let mut inner = self.lock();
        let i = slot as usize;
        debug_assert_ne!(inner.states[i], SlotState::Free);
        inner.states[i] = SlotState::Free;
        inner.invalidate[i] = InvalidateState::Success;
        inner.free.insert(i);
        inner.wake();
    }

    /// Reserve a specific slot for journal recovery.
    pub fn allocate_for_flush(&self, slot: SlotT) -> Result<()> {
        let mut inner = self.lock();
        let i = slot as usize;
        if i >= inner.states.len() {
            return Err(Error::InvalidSlot);
        }
        if !matches!(inner.states[i], SlotState::Free | SlotState::Orphaned) {
            return Err(Error::InvalidSlot);
        }
        inner.free.set(i, false);
        inner.states[i] = SlotState::AllocatedForFlush;
        Ok(())
    }

    /// Give up a slot whose journal copy may still be valid on disk.
    ///
    /// The slot stays out of circulation until journal recovery flushes it.
    pub fn orphan(&self, slot: SlotT) {
        let mut inner = self.lock();
        let i = slot as usize;
        debug_assert_ne!(inner.states[i], SlotState::Free);
        tracing::warn!(slot, "write log slot left for recovery");
        inner.states[i] = SlotState::Orphaned;
        inner.free.set(i, false);
    }

    pub fn set_flushing(&self, slot: SlotT) {
        let mut inner = self.lock();
        debug_assert_eq!(inner.states[slot as usize],
                         SlotState::AllocatedForFlush);
        inner.states[slot as usize] = SlotState::Flushing;
    }

    /// Stop handing out slots.  Returns `true` if any are still allocated.
    pub fn quiesce(&self) -> bool {
        let mut inner = self.lock();
        inner.quiesced = true;
        inner.free.count_ones(..) < inner.states.len()
    }

    /// Resume handing out slots, waking waiters in order.
    pub fn unquiesce(&self) {
        let mut inner = self.lock();
        inner.quiesced = false;
        inner.wake();
    }

    /// Fail every waiter with `Error::Aborted`.
    pub fn abort(&self) {
        let mut inner = self.lock();
        for w in inner.waiters.drain(..) {
            // The waiter may already be gone; that's fine
            let _ = w.tx.send(Err(Error::Aborted));
        }
    }

    pub fn state(&self, slot: SlotT) -> Result<SlotState> {
        let inner = self.lock();
        inner.states.get(slot as usize).copied().ok_or(Error::InvalidSlot)
    }

    pub fn invalidate_state(&self, slot: SlotT) -> InvalidateState {
        let inner = self.lock();
        inner.invalidate.get(slot as usize).copied().unwrap_or_default()
    }

    /// Report the slot's invalidation as dead, once it completes.
    pub fn set_invalidate_dead(&self, slot: SlotT) {
        let mut inner = self.lock();
        if let Some(s) = inner.invalidate.get_mut(slot as usize) {
            *s = InvalidateState::Dead;
        }
    }

    pub fn allocated(&self) -> usize {
        let inner = self.lock();
        inner.states.len() - inner.free.count_ones(..)
    }

    pub fn waiters(&self) -> usize {
        self.lock().waiters.len()
    }
}

/// Future returned by [`SlotPool::acquire`]
#[pin_project(PinnedDrop)]
pub struct Acquire {
    pool: Arc<SlotPool>,
    ready: Option<Result<SlotT>>,
    #[pin]
    rx: Option<oneshot::Receiver<Result<SlotT>>>,
    done: bool,
}

impl Future for Acquire {
    type Output = Result<SlotT>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context) -> Poll<Self::Output> {
        let this = self.project();
        if let Some(r) = this.ready.take() {
            *this.done = true;
            return Poll::Ready(r);
        }
        match this.rx.as_pin_mut() {
            None => Poll::Ready(Err(Error::Aborted)),
            Some(rx) => match rx.poll(cx) {
                Poll::Pending => Poll::Pending,
                Poll::Ready(r) => {
                    *this.done = true;
                    Poll::Ready(r.unwrap_or(Err(Error::Aborted)))
                }
            }
        }
    }
}

#[pinned_drop]
impl PinnedDrop for Acquire {
    fn drop(self: Pin<&mut Self>) {
        let this = self.project();
        if *this.done {
            return;
        }
        if let Some(Ok(slot)) = this.ready.take() {
            this.pool.release(slot);
        }
        if let Some(mut rx) = this.rx.as_pin_mut() {
            rx.close();
            if let Ok(Some(Ok(slot))) = rx.try_recv() {
                this.pool.release(slot);
            }
        }
    }
}

// LCOV_EXCL_STOP
