// vim: tw=80
//! RAM-backed member drives, with fault injection
//!
//! `MemDrives` stands in for real hardware in tests and in the CLI.  Blocks
//! that were never written read back as a freshly initialized group would:
//! zeroed data stamped for its host LBA, zero parity stamped with its row
//! stamp, and an all-zero write log.

use crate::{
    block,
    geometry::RaidGeometry,
    transport::{
        BoxDriveFut,
        DriveCompletion,
        DriveRequest,
        DriveStatus,
        DriveTransport,
        Opcode,
        Qualifier
    },
    types::*,
    util::*,
};
use futures::future;
use std::{
    collections::{BTreeMap, BTreeSet},
    sync::Mutex
};

/// A request as the drives saw it
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct IoRecord {
    pub position: PosT,
    pub opcode: Opcode,
    pub lba: LbaT,
    pub blocks: BlockCountT,
    pub status: DriveStatus,
}

#[derive(Debug, Default)]
struct Drive {
    blocks: BTreeMap<LbaT, Box<[u8]>>,
    dead: bool,
    media_errors: BTreeSet<LbaT>,
    /// Fail this many requests with `Retryable`
    retryable: u32,
    /// Fail this many requests with `Dropped`
    dropped: u32,
    /// Return this many reads with `CrcError`
    crc_errors: u32,
    /// Die after completing this many more requests
    die_after: Option<u32>,
}

#[derive(Debug, Default)]
struct Inner {
    drives: Vec<Drive>,
    history: Vec<IoRecord>,
    /// Acknowledge, but discard, writes after this many more
    freeze_after: Option<u32>,
}

pub struct MemDrives {
    geo: RaidGeometry,
    live_end: LbaT,
    inner: Mutex<Inner>,
}

impl MemDrives {
    pub fn new(geo: RaidGeometry) -> Self {
        let live_end = geo.rows() * geo.element_size();
        let drives = (0..geo.width()).map(|_| Drive::default()).collect();
        let inner = Inner{drives, ..Default::default()};
        MemDrives{geo, live_end, inner: Mutex::new(inner)}
    }

    /// What a never-written block holds
    fn initial_block(&self, pos: PosT, lba: LbaT) -> Vec<u8> {
        if lba >= self.live_end {
            return vec![0u8; BYTES_PER_BLOCK];
        }
        let layout = self.geo.layout(lba / self.geo.element_size());
        match layout.data_index(pos) {
            Some(idx) => block::zeroed_blocks(self.geo.host_lba(idx, lba), 1),
            None => {
                // Zero data has zero parity, for P and Q alike
                let mut b = vec![0u8; BYTES_PER_BLOCK];
                block::seal_parity(&mut b, self.geo.row_stamp(lba));
                b
            }
        }
    }

    /// Current contents of one block
    pub fn peek(&self, pos: PosT, lba: LbaT) -> Vec<u8> {
        let inner = self.inner.lock().unwrap();
        match inner.drives[pos as usize].blocks.get(&lba) {
            Some(b) => b.to_vec(),
            None => self.initial_block(pos, lba),
        }
    }

    /// Overwrite blocks directly, bypassing fault injection.
    pub fn poke(&self, pos: PosT, lba: LbaT, data: &[u8]) {
        let mut inner = self.inner.lock().unwrap();
        let drive = &mut inner.drives[pos as usize];
        for (i, b) in data.chunks_exact(BYTES_PER_BLOCK).enumerate() {
            drive.blocks.insert(lba + i as LbaT, b.into());
        }
    }

    pub fn kill(&self, pos: PosT) {
        self.inner.lock().unwrap().drives[pos as usize].dead = true;
    }

    /// Reads touching `lba` fail until it is rewritten.
    pub fn media_error(&self, pos: PosT, lba: LbaT) {
        self.inner.lock().unwrap().drives[pos as usize].media_errors
            .insert(lba);
    }

    pub fn retryable(&self, pos: PosT, count: u32) {
        self.inner.lock().unwrap().drives[pos as usize].retryable = count;
    }

    pub fn drop_requests(&self, pos: PosT, count: u32) {
        self.inner.lock().unwrap().drives[pos as usize].dropped = count;
    }

    pub fn crc_errors(&self, pos: PosT, count: u32) {
        self.inner.lock().unwrap().drives[pos as usize].crc_errors = count;
    }

    /// The drive dies after completing `count` more requests.
    pub fn die_after(&self, pos: PosT, count: u32) {
        self.inner.lock().unwrap().drives[pos as usize].die_after =
            Some(count);
    }

    /// Simulate power loss: after `count` more writes, acknowledge writes
    /// without storing them.
    pub fn freeze_writes_after(&self, count: u32) {
        self.inner.lock().unwrap().freeze_after = Some(count);
    }

    /// Undo `freeze_writes_after`, as if the group were powered back on.
    /// Dead drives stay dead.
    pub fn power_cycle(&self) {
        let mut inner = self.inner.lock().unwrap();
        inner.freeze_after = None;
        for d in inner.drives.iter_mut() {
            d.die_after = None;
        }
    }

    /// Every request completed so far
    pub fn history(&self) -> Vec<IoRecord> {
        self.inner.lock().unwrap().history.clone()
    }

    pub fn clear_history(&self) {
        self.inner.lock().unwrap().history.clear();
    }

    fn complete(&self, req: &DriveRequest) -> DriveCompletion {
        let mut inner = self.inner.lock().unwrap();
        let pos = req.position as usize;
        if pos >= inner.drives.len() {
            return DriveCompletion::err(DriveStatus::Dead);
        }
        let range = req.lba..req.lba + req.blocks;
        let freeze = inner.freeze_after;
        let drive = &mut inner.drives[pos];
        if let Some(n) = drive.die_after {
            if n == 0 {
                drive.dead = true;
                drive.die_after = None;
            } else {
                drive.die_after = Some(n - 1);
            }
        }
        if drive.dead {
            return DriveCompletion::err(DriveStatus::Dead);
        }
        if drive.retryable > 0 {
            drive.retryable -= 1;
            return DriveCompletion::err(DriveStatus::Retryable);
        }
        if drive.dropped > 0 {
            drive.dropped -= 1;
            return DriveCompletion::err(DriveStatus::Dropped);
        }
        match req.opcode {
            Opcode::Read => {
                if let Some(bad) = drive.media_errors.range(range.clone())
                    .next()
                {
                    return DriveCompletion::err(DriveStatus::MediaError(*bad));
                }
                let crc_error = drive.crc_errors > 0;
                if crc_error {
                    drive.crc_errors -= 1;
                }
                let mut v = Vec::with_capacity(req.blocks as usize *
                                               BYTES_PER_BLOCK);
                for lba in range {
                    match drive.blocks.get(&lba) {
                        Some(b) => v.extend_from_slice(b),
                        None => v.extend(self.initial_block(req.position, lba)),
                    }
                }
                let mut c = DriveCompletion::ok(Some(iovec_from(v)));
                if crc_error {
                    c.qualifier = Qualifier::CrcError;
                }
                c
            }
            Opcode::Write => {
                let Some(data) = req.data.as_ref() else {
                    return DriveCompletion::err(DriveStatus::Dropped);
                };
                if data.len() != req.blocks as usize * BYTES_PER_BLOCK {
                    return DriveCompletion::err(DriveStatus::Dropped);
                }
                let store = match freeze {
                    Some(0) => false,
                    Some(n) => {
                        inner.freeze_after = Some(n - 1);
                        true
                    }
                    None => true
                };
                let drive = &mut inner.drives[pos];
                for lba in range.clone() {
                    drive.media_errors.remove(&lba);
                }
                if store {
                    let blocks = data.chunks_exact(BYTES_PER_BLOCK);
                    for (lba, b) in range.zip(blocks) {
                        drive.blocks.insert(lba, b.into());
                    }
                }
                DriveCompletion::ok(None)
            }
        }
    }
}

impl DriveTransport for MemDrives {
    fn submit(&self, req: DriveRequest) -> BoxDriveFut {
        let c = self.complete(&req);
        self.inner.lock().unwrap().history.push(IoRecord {
            position: req.position,
            opcode: req.opcode,
            lba: req.lba,
            blocks: req.blocks,
            status: c.status,
        });
        Box::pin(future::ready(c))
    }
}

// LCOV_EXCL_STOP
