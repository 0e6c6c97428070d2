// vim: tw=80
// rstest_reuse must be imported at the crate root for macro reasons
// https://github.com/la10736/rstest/issues/128
#![allow(clippy::single_component_path_imports)]
use rstest_reuse;

use std::sync::Arc;

use raidwl_core::{
    block,
    config::GroupConfig,
    engine::WriteEngine,
    geometry::RaidGeometry,
    mem_drive::MemDrives,
    monitor::{GroupMonitor, RedundancyMonitor},
    parity,
    transport::{DriveTransport, Opcode},
    types::*,
    util::*,
    write_log::{HeaderRead, SlotHeader},
};

/// A RAM-backed group with its engine
struct Harness {
    cfg: GroupConfig,
    geo: RaidGeometry,
    drives: Arc<MemDrives>,
    monitor: Arc<RedundancyMonitor>,
    engine: WriteEngine,
}

impl Harness {
    /// Small elements and few slots, so tests run over a handful of blocks.
    fn new(width: u16, parity: u16) -> Self {
        let mut cfg = GroupConfig::new(width, parity);
        cfg.element_size = 16;
        cfg.slot_count = 4;
        cfg.drive_blocks = 1024;
        cfg.buffer_blocks = 4096;
        let geo = RaidGeometry::new(&cfg).unwrap();
        let drives = Arc::new(MemDrives::new(geo.clone()));
        let monitor = Arc::new(RedundancyMonitor::new(parity));
        let engine = Self::engine(&cfg, &drives, &monitor);
        Harness{cfg, geo, drives, monitor, engine}
    }

    fn engine(cfg: &GroupConfig, drives: &Arc<MemDrives>,
              monitor: &Arc<RedundancyMonitor>) -> WriteEngine
    {
        let transport: Arc<dyn DriveTransport> = drives.clone();
        let monitor: Arc<dyn GroupMonitor> = monitor.clone();
        WriteEngine::new(cfg, transport, monitor).unwrap()
    }

    /// Kill a drive, and tell the monitor before any request notices.
    async fn kill(&self, pos: PosT) {
        self.drives.kill(pos);
        self.monitor.continue_request(PosBitmap::single(pos)).await;
    }

    /// Replace the engine, as after a crash.  The drives keep their
    /// contents.
    fn restart(&mut self) {
        self.drives.power_cycle();
        self.engine = Self::engine(&self.cfg, &self.drives, &self.monitor);
    }

    /// Drive position and drive LBA holding host LBA `lba`
    fn locate(&self, lba: LbaT) -> (PosT, LbaT) {
        let es = self.geo.element_size();
        let row = lba / self.geo.row_blocks();
        let idx = (lba % self.geo.row_blocks()) / es;
        let pos = self.geo.layout(row).data[idx as usize];
        (pos, row * es + lba % es)
    }

    /// Data bytes of host LBA `lba`, rebuilt from RAID-5 parity if its
    /// position is dead.
    fn read_host(&self, lba: LbaT) -> Vec<u8> {
        let (pos, dlba) = self.locate(lba);
        if !self.monitor.dead().contains(pos) {
            let blk = self.drives.peek(pos, dlba);
            assert_eq!(block::check_data(&blk, lba), block::BlockCheck::Ok,
                       "host LBA {lba}");
            return blk[..DATA_BYTES_PER_BLOCK].to_vec();
        }
        assert_eq!(self.geo.parity_count(), 1);
        let mut acc = vec![0u8; DATA_BYTES_PER_BLOCK];
        for other in (0..self.geo.width()).filter(|p| *p != pos) {
            let blk = self.drives.peek(other, dlba);
            for (a, b) in acc.iter_mut().zip(blk.iter()) {
                *a ^= *b;
            }
        }
        acc
    }

    fn assert_host(&self, lba: LbaT, blocks: BlockCountT, fill: u8) {
        for l in lba..lba + blocks {
            assert_eq!(self.read_host(l), vec![fill; DATA_BYTES_PER_BLOCK],
                       "host LBA {l}");
        }
    }

    /// Every live parity block of `row` matches its data and row stamp.
    fn assert_consistent(&self, row: u64) {
        let layout = self.geo.layout(row);
        let es = self.geo.element_size();
        for lba in row * es..(row + 1) * es {
            let data = layout.data.iter()
                .map(|p| self.drives.peek(*p, lba))
                .collect::<Vec<_>>();
            let mut expected = vec![vec![0u8; BYTES_PER_BLOCK];
                                    layout.parity.len()];
            parity::encode(&data, &mut expected);
            for (e, pos) in expected.iter().zip(layout.parity.iter()) {
                let actual = self.drives.peek(*pos, lba);
                assert_eq!(&actual[..DATA_BYTES_PER_BLOCK],
                           &e[..DATA_BYTES_PER_BLOCK],
                           "parity at position {pos} LBA {lba}");
                assert_eq!(block::check_parity(&actual,
                                               self.geo.row_stamp(lba)),
                           block::BlockCheck::Ok);
            }
        }
    }

    /// `slot`'s header, as stored on every position the monitor thinks is
    /// alive
    fn slot_headers(&self, slot: SlotT) -> Vec<(PosT, HeaderRead)> {
        let base = self.geo.slot_base(slot).unwrap();
        (0..self.geo.width())
            .filter(|p| !self.monitor.dead().contains(*p))
            .map(|p| (p, SlotHeader::decode(&self.drives.peek(p, base), base)))
            .collect()
    }

    fn writes(&self) -> usize {
        self.drives.history().iter()
            .filter(|r| r.opcode == Opcode::Write)
            .count()
    }

    fn reads(&self) -> usize {
        self.drives.history().iter()
            .filter(|r| r.opcode == Opcode::Read)
            .count()
    }
}

mod journal;
mod write;
