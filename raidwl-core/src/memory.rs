// vim: tw=80
//! Buffer pages for in-flight requests
//!
//! A request's buffers come from one `PageSet`, allocated all at once from a
//! `PagePool` according to the `ResourcePlan`.  Buffers are carved out of the
//! set sequentially and described by scatter-gather lists of
//! `(page, offset, len)` elements, so a buffer never outlives or aliases
//! another request's memory.

use crate::{types::*, util::*};
use serde_derive::Serialize;
use std::sync::Arc;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

/// Page size classes.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq, Serialize)]
pub enum PageSize {
    Small,
    Large,
}

impl PageSize {
    pub fn blocks(&self) -> BlockCountT {
        match self {
            PageSize::Small => 16,
            PageSize::Large => 128,
        }
    }

    pub fn bytes(&self) -> usize {
        self.blocks() as usize * BYTES_PER_BLOCK
    }
}

/// One element of a scatter-gather list
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct SgElement {
    pub page: u32,
    /// Byte offset within the page
    pub offset: u32,
    /// Length in bytes.  Always a whole number of blocks.
    pub len: u32,
}

/// Describes one buffer within a `PageSet`.
pub type SgList = Vec<SgElement>;

/// Total byte length of a buffer
pub fn sg_bytes(sg: &[SgElement]) -> usize {
    sg.iter().map(|e| e.len as usize).sum()
}

/// Walks page space the same way `PageSet::carve` does, without any memory.
///
/// The resource planner uses this to count scatter-gather elements before
/// anything is allocated, so the counts and the real lists always agree.
#[derive(Clone, Copy, Debug)]
pub struct Carver {
    page_bytes: usize,
    page: u32,
    offset: usize,
}

impl Carver {
    pub fn new(size: PageSize) -> Self {
        Carver{page_bytes: size.bytes(), page: 0, offset: 0}
    }

    /// Carve `blocks` worth of bytes, returning the elements that describe
    /// them.
    pub fn carve(&mut self, blocks: BlockCountT) -> Result<SgList> {
        let mut remaining = blocks_to_bytes(blocks)? as usize;
        let mut sg = SgList::new();
        while remaining > 0 {
            if self.offset == self.page_bytes {
                self.page = self.page.checked_add(1).ok_or(Error::Sizing)?;
                self.offset = 0;
            }
            let len = remaining.min(self.page_bytes - self.offset);
            sg.push(SgElement {
                page: self.page,
                offset: self.offset as u32,
                len: len as u32
            });
            self.offset += len;
            remaining -= len;
        }
        Ok(sg)
    }

    /// Number of pages touched so far
    pub fn pages(&self) -> u32 {
        if self.page == 0 && self.offset == 0 {
            0
        } else {
            self.page + 1
        }
    }
}

/// The shared budget of buffer space.
#[derive(Debug)]
pub struct PagePool {
    sem: Arc<Semaphore>,
    total_blocks: u32,
}

impl PagePool {
    pub fn new(total_blocks: BlockCountT) -> Result<Self> {
        let total_blocks = u32::try_from(total_blocks)
            .map_err(|_| Error::InvalidConfig)?;
        let sem = Arc::new(Semaphore::new(total_blocks as usize));
        Ok(PagePool{sem, total_blocks})
    }

    /// Blocks not currently allocated to any request
    pub fn available(&self) -> usize {
        self.sem.available_permits()
    }

    /// Allocate `pages` pages of the given size.
    ///
    /// Completes immediately if the space is free, otherwise waits until
    /// other requests return enough.  A request that could never be
    /// satisfied fails with `AllocationFailed`.
    pub async fn request(&self, pages: u32, size: PageSize)
        -> Result<PageSet>
    {
        let blocks = u64::from(pages) * size.blocks();
        if blocks > u64::from(self.total_blocks) {
            tracing::warn!(pages, ?size, "buffer request exceeds the pool");
            return Err(Error::AllocationFailed);
        }
        let permit = self.sem.clone()
            .acquire_many_owned(blocks as u32)
            .await
            .map_err(|_| Error::AllocationFailed)?;
        Ok(PageSet::new(pages, size, Some(permit)))
    }

    /// Fail all future requests.  Used at shutdown.
    pub fn close(&self) {
        self.sem.close();
    }
}

/// Memory backing every buffer of one request.
pub struct PageSet {
    pages: Vec<Box<[u8]>>,
    carver: Carver,
    _permit: Option<OwnedSemaphorePermit>,
}

impl PageSet {
    fn new(pages: u32, size: PageSize, permit: Option<OwnedSemaphorePermit>)
        -> Self
    {
        let pages = (0..pages)
            .map(|_| vec![0u8; size.bytes()].into_boxed_slice())
            .collect();
        PageSet{pages, carver: Carver::new(size), _permit: permit}
    }

    /// A set that does not count against any pool.  Used by sub-requests
    /// that size their own buffers.
    pub fn unpooled(pages: u32, size: PageSize) -> Self {
        PageSet::new(pages, size, None)
    }

    /// An unpooled set just big enough for `blocks` blocks of buffers.
    pub fn for_blocks(blocks: BlockCountT) -> Self {
        let size = if blocks <= PageSize::Small.blocks() {
            PageSize::Small
        } else {
            PageSize::Large
        };
        let pages = div_roundup(blocks, size.blocks()) as u32;
        PageSet::new(pages, size, None)
    }

    /// Carve the next `blocks` blocks.
    pub fn carve(&mut self, blocks: BlockCountT) -> Result<SgList> {
        let sg = self.carver.carve(blocks)?;
        if self.carver.pages() as usize > self.pages.len() {
            return Err(Error::OutOfResource);
        }
        Ok(sg)
    }

    /// Copy a buffer out into contiguous memory.
    pub fn gather(&self, sg: &[SgElement]) -> Vec<u8> {
        let mut v = Vec::with_capacity(sg_bytes(sg));
        for e in sg {
            let (s, l) = (e.offset as usize, e.len as usize);
            v.extend_from_slice(&self.pages[e.page as usize][s..s + l]);
        }
        v
    }

    /// Copy contiguous memory into a buffer.
    pub fn scatter(&mut self, sg: &[SgElement], src: &[u8]) {
        debug_assert_eq!(sg_bytes(sg), src.len());
        let mut cursor = 0;
        for e in sg {
            let (s, l) = (e.offset as usize, e.len as usize);
            self.pages[e.page as usize][s..s + l]
                .copy_from_slice(&src[cursor..cursor + l]);
            cursor += l;
        }
    }

    pub fn len(&self) -> usize {
        self.pages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pages.is_empty()
    }
}

// LCOV_EXCL_STOP
