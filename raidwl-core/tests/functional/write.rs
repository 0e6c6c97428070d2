// vim: tw=80
//! Host writes through the small-write engine, healthy and degraded
use super::*;
use pretty_assertions::assert_eq;
use raidwl_core::{
    planner::Algorithm,
    stripe_op::State,
    write_log::{FlushOutcome, SlotState},
};
use rstest::{fixture, rstest};
use rstest_reuse::{apply, template};

#[fixture]
fn raid5() -> Harness {
    Harness::new(5, 1)
}

/// Healthy small writes read back intact, with consistent parity.
mod healthy {
    use super::*;
    use pretty_assertions::assert_eq;

    #[template]
    #[rstest]
    #[case::narrow_raid5(3, 1)]
    #[case::raid5(5, 1)]
    #[case::narrow_raid6(4, 2)]
    #[case::raid6(6, 2)]
    fn geometries(#[case] width: u16, #[case] parity: u16) {}

    #[apply(geometries)]
    #[test_log::test(tokio::test)]
    async fn partial_row(width: u16, parity: u16) {
        let h = Harness::new(width, parity);
        let data = block::host_blocks(20, 0x3c);
        let status = h.engine.write(5, &data).await.unwrap();
        assert_eq!(status, Status::Success);
        h.assert_host(5, 20, 0x3c);
        h.assert_consistent(0);
    }

    #[apply(geometries)]
    #[test_log::test(tokio::test)]
    async fn two_rows(width: u16, parity: u16) {
        let h = Harness::new(width, parity);
        let start = h.geo.row_blocks() - 4;
        let data = block::host_blocks(8, 0x96);
        let mut ops = h.engine.stripe_ops(start, &data, 0).unwrap();
        assert_eq!(ops.len(), 2);
        for op in ops.iter_mut() {
            assert_eq!(h.engine.execute(op).await.unwrap(), Status::Success);
        }
        h.assert_host(start, 8, 0x96);
        h.assert_consistent(0);
        h.assert_consistent(1);
    }

    /// Successive writes to the same blocks leave the last one.
    #[rstest]
    #[test_log::test(tokio::test)]
    async fn overwrite(raid5: Harness) {
        let h = raid5;
        for fill in 1..=3u8 {
            let data = block::host_blocks(3, fill);
            assert_eq!(h.engine.write(30, &data).await.unwrap(),
                       Status::Success);
        }
        h.assert_host(30, 3, 3);
        h.assert_consistent(0);
    }

    /// A write that covers most of the row pre-reads the rest instead.
    #[rstest]
    #[test_log::test(tokio::test)]
    async fn rcw(raid5: Harness) {
        let h = raid5;
        let data = block::host_blocks(40, 0x77);
        let mut ops = h.engine.stripe_ops(2, &data, 0).unwrap();
        let status = h.engine.execute(&mut ops[0]).await.unwrap();
        assert_eq!(status, Status::Success);
        assert_eq!(ops[0].algorithm(), Some(Algorithm::Rcw));
        h.assert_host(2, 40, 0x77);
        h.assert_consistent(0);
    }

    /// One block inside one stripe takes the read-modify-write
    /// path, with two reads and two writes.
    #[rstest]
    #[test_log::test(tokio::test)]
    async fn rmw(raid5: Harness) {
        let h = raid5;
        let data = block::host_blocks(1, 0xa5);
        let mut ops = h.engine.stripe_ops(3, &data, 0).unwrap();
        assert_eq!(ops.len(), 1);
        let status = h.engine.execute(&mut ops[0]).await.unwrap();
        assert_eq!(status, Status::Success);
        assert_eq!(ops[0].algorithm(), Some(Algorithm::Rmw));
        assert_eq!(ops[0].history(), &[State::Generate, State::Allocate,
                   State::PreRead, State::Compute, State::Commit]);
        assert_eq!(ops[0].wait_count(), 0);
        assert_eq!(ops[0].slot(), None);
        assert_eq!(h.reads(), 2);
        assert_eq!(h.writes(), 2);
        h.assert_host(3, 1, 0xa5);
        h.assert_consistent(0);
        assert_eq!(h.engine.stats().journaled_writes, 0);
    }
}

/// Writes to a group with a dead position
mod degraded {
    use super::*;
    use pretty_assertions::assert_eq;

    /// A write that touches the dead position and a live one
    /// goes through the write log.
    #[rstest]
    #[test_log::test(tokio::test)]
    async fn journaled(raid5: Harness) {
        let mut h = raid5;
        h.kill(0).await;
        let data = block::host_blocks(4, 0x5b);
        let mut ops = h.engine.stripe_ops(14, &data, 0).unwrap();
        let status = h.engine.execute(&mut ops[0]).await.unwrap();
        assert_eq!(status, Status::Success);
        assert_eq!(ops[0].algorithm(), Some(Algorithm::DegradedRcw));
        assert_eq!(ops[0].history(), &[State::Generate, State::Allocate,
                   State::PreRead, State::Compute, State::AcquireSlot,
                   State::Stage, State::WriteSlot, State::Commit,
                   State::Invalidate]);
        assert_eq!(ops[0].slot(), None);
        let pool = h.engine.write_log().pool();
        assert_eq!(pool.allocated(), 0);
        for slot in 0..h.geo.slot_count() {
            assert_eq!(pool.state(slot), Ok(SlotState::Free));
        }
        h.assert_host(14, 4, 0x5b);

        // Both live positions wrote their journal copy first
        let journal_start = h.geo.slot_base(0).unwrap();
        let history = h.drives.history();
        let writes = history.iter()
            .filter(|r| r.opcode == Opcode::Write)
            .collect::<Vec<_>>();
        assert!(writes[0].lba >= journal_start);
        assert!(writes[1].lba >= journal_start);
        assert_eq!(writes[0].position, 1);
        assert_eq!(writes[1].position, 4);
        assert!(writes[2].lba < journal_start);

        let stats = h.engine.stats();
        assert_eq!(stats.journaled_writes, 1);
        assert_eq!(stats.degraded_writes, 1);

        // Nothing left for recovery to do
        h.restart();
        let reports = h.engine.flush_all().await.unwrap();
        assert!(reports.iter().all(|r| r.outcome == FlushOutcome::Clean));
    }

    /// A single-column write to the dead position needs no journal.
    #[rstest]
    #[test_log::test(tokio::test)]
    async fn to_dead_column(raid5: Harness) {
        let h = raid5;
        h.kill(0).await;
        let data = block::host_blocks(1, 0x11);
        let mut ops = h.engine.stripe_ops(3, &data, 0).unwrap();
        let status = h.engine.execute(&mut ops[0]).await.unwrap();
        assert_eq!(status, Status::Success);
        assert_eq!(ops[0].history(), &[State::Generate, State::Allocate,
                   State::PreRead, State::Compute, State::Commit]);
        // Only parity is written
        assert_eq!(h.writes(), 1);
        h.assert_host(3, 1, 0x11);
        assert_eq!(h.engine.stats().degraded_writes, 1);
    }

    /// A write to a row whose parity is dead is a plain data write.
    #[rstest]
    #[test_log::test(tokio::test)]
    async fn dead_parity(raid5: Harness) {
        let h = raid5;
        h.kill(4).await;
        let data = block::host_blocks(20, 0x22);
        assert_eq!(h.engine.write(10, &data).await.unwrap(), Status::Success);
        h.assert_host(10, 20, 0x22);
        assert_eq!(h.engine.stats().journaled_writes, 0);
    }

    /// A position that dies during the pre-read is acknowledged, and the
    /// request is replanned around it.
    #[rstest]
    #[test_log::test(tokio::test)]
    async fn dies_during_preread(raid5: Harness) {
        let h = raid5;
        h.drives.die_after(0, 0);
        let data = block::host_blocks(1, 0x44);
        let mut ops = h.engine.stripe_ops(3, &data, 0).unwrap();
        let status = h.engine.execute(&mut ops[0]).await.unwrap();
        assert_eq!(status, Status::Success);
        assert_eq!(ops[0].history(), &[State::Generate, State::Allocate,
                   State::PreRead, State::Generate, State::Allocate,
                   State::PreRead, State::Compute, State::Commit]);
        assert_eq!(ops[0].dead(), PosBitmap::single(0));
        assert_eq!(h.monitor.dead(), PosBitmap::single(0));
        h.assert_host(3, 1, 0x44);
    }

    /// More positions die than parity can cover.  The request
    /// shuts down without writing anything.
    #[rstest]
    #[test_log::test(tokio::test)]
    async fn shutdown(raid5: Harness) {
        let h = raid5;
        h.drives.kill(0);
        h.drives.kill(4);
        let data = block::host_blocks(1, 0x55);
        let status = h.engine.write(3, &data).await.unwrap();
        assert_eq!(status, Status::ShutdownError);
        assert_eq!(h.writes(), 0);
        assert_eq!(h.engine.stats().shutdowns, 1);
    }

    /// A group that is already past its redundancy rejects writes up front.
    #[rstest]
    #[test_log::test(tokio::test)]
    async fn already_faulted(raid5: Harness) {
        let h = raid5;
        h.kill(1).await;
        h.kill(2).await;
        h.drives.clear_history();
        let data = block::host_blocks(1, 0x66);
        let mut ops = h.engine.stripe_ops(3, &data, 0).unwrap();
        let status = h.engine.execute(&mut ops[0]).await.unwrap();
        assert_eq!(status, Status::ShutdownError);
        assert_eq!(ops[0].history(), &[State::Generate]);
        assert!(h.drives.history().is_empty());
    }

    /// RAID-6 survives two dead positions.
    #[test_log::test(tokio::test)]
    async fn raid6_two_dead() {
        let h = Harness::new(6, 2);
        h.kill(2).await;
        h.kill(3).await;
        let data = block::host_blocks(6, 0x88);
        assert_eq!(h.engine.write(14, &data).await.unwrap(), Status::Success);
        // Host LBAs 14..16 are on live position 1.  The rest of the write
        // lands on dead position 2 and survives only in P and Q.
        let (pos, _) = h.locate(14);
        assert_eq!(pos, 1);
        h.assert_host(14, 2, 0x88);
    }
}

/// Failures that don't lose a position
mod errors {
    use super::*;
    use pretty_assertions::assert_eq;

    /// A media error on the pre-read leads to recovery-verify,
    /// not to shutdown.
    #[rstest]
    #[test_log::test(tokio::test)]
    async fn media_error(raid5: Harness) {
        let h = raid5;
        h.drives.media_error(0, 3);
        let data = block::host_blocks(1, 0x99);
        let mut ops = h.engine.stripe_ops(3, &data, 0).unwrap();
        let status = h.engine.execute(&mut ops[0]).await.unwrap();
        assert_eq!(status, Status::Success);
        assert_eq!(ops[0].history(), &[State::Generate, State::Allocate,
                   State::PreRead, State::Verify, State::PreRead,
                   State::Compute, State::Commit]);
        assert_eq!(h.engine.stats().recovery_verifies, 1);
        assert_eq!(h.engine.stats().shutdowns, 0);
        h.assert_host(3, 1, 0x99);
        h.assert_consistent(0);
    }

    /// Corrupt pre-read data is also repaired by recovery-verify.
    #[rstest]
    #[test_log::test(tokio::test)]
    async fn corrupt_preread(raid5: Harness) {
        let h = raid5;
        let (pos, dlba) = h.locate(3);
        let mut blk = h.drives.peek(pos, dlba);
        blk[0] ^= 0xff;
        h.drives.poke(pos, dlba, &blk);
        let data = block::host_blocks(1, 0x12);
        assert_eq!(h.engine.write(3, &data).await.unwrap(), Status::Success);
        assert_eq!(h.engine.stats().recovery_verifies, 1);
        h.assert_host(3, 1, 0x12);
        h.assert_consistent(0);
    }

    #[rstest]
    #[test_log::test(tokio::test)]
    async fn retried(raid5: Harness) {
        let h = raid5;
        h.drives.retryable(0, 2);
        let data = block::host_blocks(1, 0x13);
        assert_eq!(h.engine.write(3, &data).await.unwrap(), Status::Success);
        assert_eq!(h.engine.stats().retries, 2);
        assert!(h.monitor.dead().is_empty());
        h.assert_host(3, 1, 0x13);
    }

    /// A position that keeps failing retryably is eventually treated as
    /// dead.
    #[rstest]
    #[test_log::test(tokio::test)]
    async fn retries_exhausted(raid5: Harness) {
        let h = raid5;
        h.drives.retryable(0, 100);
        let data = block::host_blocks(1, 0x14);
        assert_eq!(h.engine.write(3, &data).await.unwrap(), Status::Success);
        assert_eq!(h.monitor.dead(), PosBitmap::single(0));
    }

    /// Host blocks with bad checksums are rejected without writing.
    #[rstest]
    #[test_log::test(tokio::test)]
    async fn bad_host_crc(raid5: Harness) {
        let h = raid5;
        let mut data = block::host_blocks(2, 0x15);
        data[BYTES_PER_BLOCK + 7] ^= 1;
        let status = h.engine.write(3, &data).await.unwrap();
        assert_eq!(status, Status::WriteCrcError);
        assert_eq!(h.writes(), 0);
    }

    #[rstest]
    #[test_log::test(tokio::test)]
    async fn sizing(raid5: Harness) {
        let h = raid5;
        assert_eq!(h.engine.write(3, &[]).await.err(), Some(Error::Sizing));
        assert_eq!(h.engine.write(3, &[0u8; 100]).await.err(),
                   Some(Error::Sizing));
        let past_end = h.geo.host_capacity();
        let data = block::host_blocks(1, 0);
        assert!(h.engine.write(past_end, &data).await.is_err());
    }

    /// An op aborted before it starts does no I/O.
    #[rstest]
    #[test_log::test(tokio::test)]
    async fn abort(raid5: Harness) {
        let h = raid5;
        let start = h.geo.row_blocks() - 1;
        let data = block::host_blocks(2, 0x16);
        let mut ops = h.engine.stripe_ops(start, &data, 0).unwrap();
        assert_eq!(ops.len(), 2);
        ops[0].abort();
        // The flag is shared by every op of the host write
        let shared = ops[1].abort_handle();
        assert!(shared.load(std::sync::atomic::Ordering::Relaxed));
        for op in ops.iter_mut() {
            assert_eq!(h.engine.execute(op).await.unwrap(), Status::Aborted);
            assert_eq!(op.history(), &[State::Generate, State::Abort]);
        }
        assert!(h.drives.history().is_empty());
    }
}

/// Journaled writes that lose a position after taking a slot
mod journal_failures {
    use super::*;
    use pretty_assertions::assert_eq;
    use raidwl_core::write_log::{HeaderRead, HeaderState};

    /// Every live position holds an invalidation header for `slot`.
    fn assert_invalidated(h: &Harness, slot: SlotT) {
        for (pos, read) in h.slot_headers(slot) {
            match read {
                HeaderRead::Ok(hdr) => {
                    assert_eq!(hdr.state, HeaderState::Invalid,
                               "position {pos}");
                }
                other => panic!("position {pos} holds {other:?}"),
            }
        }
    }

    /// Positions that wrote a journal copy, with header, into `slot`
    fn journal_writers(h: &Harness, slot: SlotT) -> Vec<PosT> {
        let base = h.geo.slot_base(slot).unwrap();
        let mut v = h.drives.history().iter()
            .filter(|r| r.opcode == Opcode::Write && r.lba == base &&
                    r.blocks > 1)
            .map(|r| r.position)
            .collect::<Vec<_>>();
        v.sort_unstable();
        v
    }

    /// A RAID-6 position dies partway through a journaled write.  The write
    /// finishes without it, and the slot is invalidated and freed before
    /// the death is reported.
    #[rstest]
    #[case::journal_write(1)]
    #[case::live_write(2)]
    #[test_log::test(tokio::test)]
    async fn raid6_dies(#[case] after: u32) {
        let h = Harness::new(6, 2);
        h.kill(1).await;
        // Position 2 completes its pre-read, then dies
        h.drives.die_after(2, after);
        let data = block::host_blocks(4, 0x7a);
        let mut ops = h.engine.stripe_ops(14, &data, 0).unwrap();
        let status = h.engine.execute(&mut ops[0]).await.unwrap();
        assert_eq!(status, Status::DeadError);
        assert_eq!(ops[0].history(), &[State::Generate, State::Allocate,
                   State::PreRead, State::Compute, State::AcquireSlot,
                   State::Stage, State::WriteSlot, State::Commit,
                   State::Invalidate]);
        let both = PosBitmap::single(1).union(PosBitmap::single(2));
        assert_eq!(ops[0].dead(), both);
        assert_eq!(h.monitor.dead(), both);
        assert_eq!(ops[0].slot(), None);
        let pool = h.engine.write_log().pool();
        assert_eq!(pool.state(0), Ok(SlotState::Free));
        assert_eq!(pool.allocated(), 0);
        assert_invalidated(&h, 0);

        // The same slot serves the next journaled write
        h.drives.clear_history();
        let data = block::host_blocks(4, 0x7b);
        let mut ops = h.engine.stripe_ops(14, &data, 0).unwrap();
        let status = h.engine.execute(&mut ops[0]).await.unwrap();
        assert_eq!(status, Status::Success);
        assert!(ops[0].history().contains(&State::WriteSlot));
        // Only P and Q are left to journal
        assert_eq!(journal_writers(&h, 0), vec![0, 5]);
        assert_eq!(pool.state(0), Ok(SlotState::Free));
        assert_invalidated(&h, 0);
        assert_eq!(h.engine.stats().journaled_writes, 2);
    }

    /// A second RAID-5 position dies during the journal write.  The live
    /// stripe was never touched, so the partial journal copy is invalidated
    /// where it can be.  Too few positions took the invalidation, so the
    /// slot stays out of service until recovery.
    #[rstest]
    #[test_log::test(tokio::test)]
    async fn shutdown_during_journal_write(raid5: Harness) {
        let h = raid5;
        h.kill(0).await;
        h.drives.die_after(1, 1);
        let data = block::host_blocks(4, 0x5c);
        let mut ops = h.engine.stripe_ops(14, &data, 0).unwrap();
        let status = h.engine.execute(&mut ops[0]).await.unwrap();
        assert_eq!(status, Status::ShutdownError);
        assert_eq!(ops[0].history(), &[State::Generate, State::Allocate,
                   State::PreRead, State::Compute, State::AcquireSlot,
                   State::Stage, State::WriteSlot, State::Invalidate]);
        assert_eq!(ops[0].slot(), None);
        let pool = h.engine.write_log().pool();
        assert_eq!(pool.state(0), Ok(SlotState::Orphaned));
        assert_eq!(pool.allocated(), 1);
        assert_invalidated(&h, 0);
        assert_eq!(pool.try_acquire(), Ok(Some(1)));
    }

    /// A second RAID-5 position dies during the live write.  The journal
    /// copy is all that's left of the write, so it stays valid and the slot
    /// is left for recovery.
    #[rstest]
    #[test_log::test(tokio::test)]
    async fn shutdown_during_live_write(raid5: Harness) {
        let h = raid5;
        h.kill(0).await;
        h.drives.die_after(1, 2);
        let data = block::host_blocks(4, 0x5d);
        let mut ops = h.engine.stripe_ops(14, &data, 0).unwrap();
        let status = h.engine.execute(&mut ops[0]).await.unwrap();
        assert_eq!(status, Status::ShutdownError);
        assert_eq!(ops[0].history(), &[State::Generate, State::Allocate,
                   State::PreRead, State::Compute, State::AcquireSlot,
                   State::Stage, State::WriteSlot, State::Commit]);
        let pool = h.engine.write_log().pool();
        assert_eq!(pool.state(0), Ok(SlotState::Orphaned));
        assert_eq!(pool.allocated(), 1);
        let parity_copy = h.slot_headers(0).into_iter()
            .find(|(pos, _)| *pos == 4)
            .map(|(_, read)| read);
        let Some(HeaderRead::Ok(hdr)) = parity_copy else {
            panic!("no header on position 4: {parity_copy:?}");
        };
        assert_eq!(hdr.state, HeaderState::Valid);
        assert_eq!(hdr.write_bitmap,
                   PosBitmap::single(1).union(PosBitmap::single(4)));

        // Recovery may take the slot, but can't replay it in a group this
        // far gone.  It stays valid, and orphaned, for the next activation.
        let report = h.engine.flush_slot(0).await.unwrap();
        assert_eq!(report.outcome, FlushOutcome::Abandoned{verified: false});
        assert_eq!(pool.state(0), Ok(SlotState::Orphaned));
        let after = h.slot_headers(0).into_iter()
            .find(|(pos, _)| *pos == 4)
            .map(|(_, read)| read);
        assert_eq!(after, Some(HeaderRead::Ok(hdr)));
    }
}
