// vim: tw=80
//! Write log recovery after a crash
use super::*;
use pretty_assertions::assert_eq;
use raidwl_core::write_log::{
    FlushOutcome,
    HeaderRead,
    HeaderState,
    InvalidateResult,
    SlotHeader,
    SlotState,
};
use rstest::{fixture, rstest};

/// A degraded RAID-5 group that crashed right after journaling a write of
/// host LBAs 14..18, before any of it reached the live stripe.
#[fixture]
async fn crashed() -> Harness {
    let mut h = Harness::new(5, 1);
    h.kill(0).await;
    // Journal writes go to positions 1 and 4.  Nothing after them sticks.
    h.drives.freeze_writes_after(2);
    let data = block::host_blocks(4, 0xc4);
    let status = h.engine.write(14, &data).await.unwrap();
    assert_eq!(status, Status::Success);
    h.restart();
    h
}

/// Every valid header the live positions hold, by slot
fn valid_headers(h: &Harness) -> Vec<(SlotT, PosT, SlotHeader)> {
    let mut v = Vec::new();
    for slot in 0..h.geo.slot_count() {
        for (pos, read) in h.slot_headers(slot) {
            if let HeaderRead::Ok(hdr) = read {
                if hdr.state == HeaderState::Valid {
                    v.push((slot, pos, hdr));
                }
            }
        }
    }
    v
}

#[test_log::test(tokio::test)]
async fn clean() {
    let h = Harness::new(5, 1);
    let reports = h.engine.flush_all().await.unwrap();
    assert_eq!(reports.len(), 4);
    for (slot, r) in reports.iter().enumerate() {
        assert_eq!(r.slot, slot as SlotT);
        assert_eq!(r.outcome, FlushOutcome::Clean);
        assert_eq!(r.generation, None);
    }
    assert_eq!(h.engine.write_log().pool().allocated(), 0);
    assert_eq!(h.writes(), 0);
}

#[test_log::test(tokio::test)]
async fn invalidate_twice() {
    let h = Harness::new(5, 1);
    let pool = h.engine.write_log().pool();
    let slot = pool.try_acquire().unwrap().unwrap();
    let r = h.engine.write_log().invalidate(slot, PosBitmap::EMPTY).await;
    assert_eq!(r, Ok(InvalidateResult::Success));
    assert_eq!(h.writes(), 5);
    let r = h.engine.write_log().invalidate(slot, PosBitmap::EMPTY).await;
    assert_eq!(r, Ok(InvalidateResult::AlreadyFree));
    assert_eq!(h.writes(), 5);
}

/// The crash left a complete journal copy, which recovery replays.
#[rstest]
#[test_log::test(tokio::test)]
async fn replay(#[future(awt)] crashed: Harness) {
    let h = crashed;
    // The live stripe still holds the old data
    assert_eq!(h.read_host(16), vec![0u8; DATA_BYTES_PER_BLOCK]);
    let journaled = valid_headers(&h);
    assert_eq!(journaled.len(), 2);

    let reports = h.engine.flush_all().await.unwrap();
    let replayed = reports.iter()
        .filter(|r| r.outcome == FlushOutcome::Replayed)
        .collect::<Vec<_>>();
    assert_eq!(replayed.len(), 1);
    assert_eq!(replayed[0].slot, journaled[0].0);
    assert_eq!(replayed[0].generation, Some(journaled[0].2.generation));
    h.assert_host(14, 4, 0xc4);
    assert!(valid_headers(&h).is_empty());
    let stats = h.engine.stats();
    assert_eq!(stats.flush_replayed, 1);
    assert_eq!(stats.flush_abandoned, 0);
    // New writes are never older than what was recovered
    assert!(h.engine.write_log().next_generation() >
            journaled[0].2.generation);

    // A second pass finds nothing left to do
    let again = h.engine.flush_all().await.unwrap();
    assert!(again.iter().all(|r| r.outcome == FlushOutcome::Clean));
}

/// Checksum-of-checksums is wrong on every live copy of the
/// header.  The slot is abandoned and the live stripe verified instead.
#[rstest]
#[test_log::test(tokio::test)]
async fn bad_csum_of_csums(#[future(awt)] crashed: Harness) {
    let h = crashed;
    for (slot, pos, mut hdr) in valid_headers(&h) {
        let base = h.geo.slot_base(slot).unwrap();
        hdr.csum_of_csums ^= 0xffff;
        h.drives.poke(pos, base, &hdr.encode(base).unwrap());
    }
    let reports = h.engine.flush_all().await.unwrap();
    let abandoned = reports.iter()
        .filter(|r| r.outcome != FlushOutcome::Clean)
        .collect::<Vec<_>>();
    assert_eq!(abandoned.len(), 1);
    assert_eq!(abandoned[0].outcome, FlushOutcome::Abandoned{verified: true});
    // Nothing was replayed
    assert_eq!(h.read_host(16), vec![0u8; DATA_BYTES_PER_BLOCK]);
    h.assert_host(14, 2, 0);
    h.assert_consistent(0);
    assert!(valid_headers(&h).is_empty());
    let stats = h.engine.stats();
    assert_eq!(stats.flush_replayed, 0);
    assert_eq!(stats.flush_abandoned, 1);
    assert_eq!(stats.recovery_verifies, 1);
}

/// Corrupt journal data is caught by its stamps, even when the headers are
/// fine.
#[rstest]
#[test_log::test(tokio::test)]
async fn corrupt_shadow_block(#[future(awt)] crashed: Harness) {
    let h = crashed;
    let (slot, pos, _) = valid_headers(&h)[0];
    let shadow = h.geo.slot_base(slot).unwrap() + 1;
    let mut blk = h.drives.peek(pos, shadow);
    blk[100] ^= 0x01;
    h.drives.poke(pos, shadow, &blk);
    let reports = h.engine.flush_all().await.unwrap();
    assert!(reports.iter()
            .any(|r| r.outcome == FlushOutcome::Abandoned{verified: true}));
    assert_eq!(h.read_host(16), vec![0u8; DATA_BYTES_PER_BLOCK]);
    assert_eq!(h.engine.stats().flush_replayed, 0);
}

/// A crash partway through the journal write leaves the slot incomplete.
#[test_log::test(tokio::test)]
async fn incomplete() {
    let mut h = Harness::new(5, 1);
    h.kill(0).await;
    h.drives.freeze_writes_after(1);
    let data = block::host_blocks(4, 0xd5);
    assert_eq!(h.engine.write(14, &data).await.unwrap(), Status::Success);
    h.restart();
    assert_eq!(valid_headers(&h).len(), 1);

    let reports = h.engine.flush_all().await.unwrap();
    assert!(reports.iter()
            .any(|r| r.outcome == FlushOutcome::Abandoned{verified: true}));
    assert_eq!(h.read_host(16), vec![0u8; DATA_BYTES_PER_BLOCK]);
    h.assert_consistent(0);
}

/// Headers too damaged to say what they covered are discarded without a
/// verify.
#[rstest]
#[test_log::test(tokio::test)]
async fn unreadable_headers(#[future(awt)] crashed: Harness) {
    let h = crashed;
    for (slot, pos, _) in valid_headers(&h) {
        let base = h.geo.slot_base(slot).unwrap();
        let mut blk = h.drives.peek(pos, base);
        blk[0] ^= 0xff;
        h.drives.poke(pos, base, &blk);
    }
    let reports = h.engine.flush_all().await.unwrap();
    assert!(reports.iter()
            .any(|r| r.outcome == FlushOutcome::Abandoned{verified: false}));
    assert_eq!(h.engine.stats().recovery_verifies, 0);
    assert_eq!(h.read_host(16), vec![0u8; DATA_BYTES_PER_BLOCK]);
}

/// Too few positions take the invalidation, so the slot is kept from new
/// writers rather than released.
#[test_log::test(tokio::test)]
async fn invalidate_incomplete() {
    let h = Harness::new(5, 1);
    // The monitor hasn't heard about either drive yet
    h.drives.kill(1);
    h.drives.kill(2);
    let pool = h.engine.write_log().pool();
    let slot = pool.try_acquire().unwrap().unwrap();
    let r = h.engine.write_log().invalidate(slot, PosBitmap::EMPTY).await;
    assert_eq!(r, Ok(InvalidateResult::Incomplete));
    assert_eq!(pool.state(slot), Ok(SlotState::Orphaned));
    assert_eq!(pool.allocated(), 1);
    let next = pool.try_acquire().unwrap().unwrap();
    assert_ne!(next, slot);
}

/// A position dies while recovery is replaying a slot.  Recovery runs on the
/// monitor's behalf, so it carries on without that position rather than
/// waiting for a decision.
#[test_log::test(tokio::test)]
async fn dies_during_replay() {
    let mut h = Harness::new(6, 2);
    h.kill(1).await;
    // Journal writes go to positions 2, 5, and 0.  Nothing after them
    // sticks.
    h.drives.freeze_writes_after(3);
    let data = block::host_blocks(4, 0xc4);
    assert_eq!(h.engine.write(14, &data).await.unwrap(), Status::Success);
    h.restart();
    let journaled = valid_headers(&h);
    assert_eq!(journaled.iter().map(|(_, pos, _)| *pos).collect::<Vec<_>>(),
               vec![0, 2, 5]);

    h.drives.kill(5);
    let reports = h.engine.flush_all().await.unwrap();
    let replayed = reports.iter()
        .filter(|r| r.outcome == FlushOutcome::Replayed)
        .collect::<Vec<_>>();
    assert_eq!(replayed.len(), 1);
    assert_eq!(replayed[0].slot, journaled[0].0);
    assert!(reports.iter()
            .all(|r| r.outcome != FlushOutcome::Abandoned{verified: false}));
    // Host LBAs 16 and 17 are on live position 2
    h.assert_host(16, 2, 0xc4);
    // Only the drive that died mid-flush still holds a valid header
    assert!(valid_headers(&h).iter().all(|(_, pos, _)| *pos == 5));
    let pool = h.engine.write_log().pool();
    assert_eq!(pool.allocated(), 0);
    let stats = h.engine.stats();
    assert_eq!(stats.flush_replayed, 1);
    assert_eq!(stats.flush_abandoned, 0);
}
