// vim: tw=80
//! DriveOp chain dispatch

use crate::{
    drive_op::{ChainKind, DriveOp, DriveOpArena, OpStatus},
    eboard::Eboard,
    memory::{PageSet, sg_bytes},
    transport::{DriveCompletion, DriveStatus, DriveTransport, Opcode},
    types::*,
    util::*,
};
use futures::{FutureExt, StreamExt, stream::FuturesUnordered};

/// Build the payload of a write op: its header, if any, then its buffer.
fn write_payload(op: &DriveOp, pages: &PageSet) -> IoVec {
    let data = pages.gather(&op.sg);
    match &op.header {
        None => iovec_from(data),
        Some(hdr) => {
            let mut v = Vec::with_capacity(hdr.len() + data.len());
            v.extend_from_slice(&hdr[..]);
            v.extend_from_slice(&data);
            iovec_from(v)
        }
    }
}

/// Dispatch every pending, non-nop DriveOp of `chain` concurrently, and
/// complete once the last of them has completed.
///
/// Returns the number of ops dispatched, which always equals the chain's
/// `count_active` beforehand.  Read data is scattered into `pages`.
pub async fn send_chain(transport: &dyn DriveTransport,
                        arena: &mut DriveOpArena,
                        pages: &mut PageSet,
                        chain: ChainKind) -> usize
{
    let reqs = arena.iter(chain)
        .filter(|(_, op)| !op.degraded_nop && op.status == OpStatus::Pending)
        .map(|(id, op)| {
            let data = match op.opcode {
                Opcode::Read => None,
                Opcode::Write => Some(write_payload(op, pages))
            };
            (id, op.request(data))
        }).collect::<Vec<_>>();
    let n = reqs.len();
    tracing::trace!(?chain, n, "send_chain");
    let mut futs = reqs.into_iter()
        .map(|(id, req)| transport.submit(req).map(move |c| (id, c)))
        .collect::<FuturesUnordered<_>>();
    while let Some((id, mut c)) = futs.next().await {
        let op = arena.get_mut(id);
        if op.opcode == Opcode::Read && c.status == DriveStatus::Ok {
            match c.data.take() {
                Some(d) if d.len() == sg_bytes(&op.sg) => {
                    pages.scatter(&op.sg, &d[..]);
                }
                _ => {
                    tracing::error!(pos = op.position, lba = op.lba,
                                    "read completed with the wrong length");
                    c = DriveCompletion::err(DriveStatus::Dropped);
                }
            }
        }
        op.complete(&c);
    }
    n
}

/// Prepare a classified chain for another dispatch.
///
/// Ops addressed to `dead` become degraded nops first, so a position is never
/// retried after it has died.  Returns the number of ops that will be
/// reissued.
pub fn retry_chain(arena: &mut DriveOpArena, chain: ChainKind, eb: &Eboard,
                   dead: PosBitmap) -> usize
{
    arena.set_degraded_nop(chain, dead);
    for id in arena.chain(chain).to_vec() {
        let op = arena.get_mut(id);
        let retryable = matches!(op.status,
                                 OpStatus::Done(DriveStatus::Retryable, _));
        if !op.degraded_nop && retryable &&
            eb.retry_bitmap.contains(op.position)
        {
            op.status = OpStatus::Pending;
            op.retries += 1;
        }
    }
    let n = arena.count_active(chain);
    tracing::debug!(?chain, n, retry = %eb.retry_bitmap, "retrying chain");
    n
}

// LCOV_EXCL_START
#[cfg(test)]
mod t {
    use super::*;
    use crate::{
        memory::PageSize,
        transport::{DriveRequest, MockDriveTransport, Qualifier},
    };
    use futures::future;
    use mockall::Sequence;
    use pretty_assertions::assert_eq;

    fn setup(opcode: Opcode, positions: &[PosT])
        -> (DriveOpArena, PageSet)
    {
        let mut pages = PageSet::unpooled(1, PageSize::Small);
        let mut arena = DriveOpArena::default();
        for p in positions {
            let sg = pages.carve(2).unwrap();
            arena.push(ChainKind::Read, DriveOp::new(*p, opcode, 10, 2, sg));
        }
        (arena, pages)
    }

    #[test]
    fn read_scatters() {
        let rt = basic_runtime();
        let (mut arena, mut pages) = setup(Opcode::Read, &[0, 3]);
        let mut t = MockDriveTransport::new();
        t.expect_submit()
            .times(2)
            .withf(|req: &DriveRequest| req.lba == 10 && req.blocks == 2)
            .returning(|req| {
                let v = vec![req.position as u8; 1040];
                let c = DriveCompletion::ok(Some(iovec_from(v)));
                Box::pin(future::ready(c))
            });
        let n = rt.block_on(send_chain(&t, &mut arena, &mut pages,
                                       ChainKind::Read));
        assert_eq!(n, 2);
        let id = arena.find(ChainKind::Read, 3).unwrap();
        assert!(arena.get(id).is_ok());
        assert!(pages.gather(&arena.get(id).sg).iter().all(|b| *b == 3));
    }

    #[test]
    fn short_read() {
        let rt = basic_runtime();
        let (mut arena, mut pages) = setup(Opcode::Read, &[1]);
        let mut t = MockDriveTransport::new();
        t.expect_submit()
            .returning(|_| {
                let c = DriveCompletion::ok(Some(iovec_from(vec![0; 520])));
                Box::pin(future::ready(c))
            });
        rt.block_on(send_chain(&t, &mut arena, &mut pages, ChainKind::Read));
        let id = arena.find(ChainKind::Read, 1).unwrap();
        assert_eq!(arena.get(id).status,
                   OpStatus::Done(DriveStatus::Dropped, Qualifier::None));
    }

    #[test]
    fn write_with_header() {
        let rt = basic_runtime();
        let (mut arena, mut pages) = setup(Opcode::Write, &[2]);
        let id = arena.find(ChainKind::Read, 2).unwrap();
        pages.scatter(&arena.get(id).sg.clone(), &[7u8; 1040]);
        arena.get_mut(id).header = Some(iovec_from(vec![9u8; 520]));
        let mut t = MockDriveTransport::new();
        t.expect_submit()
            .once()
            .withf(|req: &DriveRequest| {
                let d = req.data.as_ref().unwrap();
                req.lba == 9 && req.blocks == 3 && d.len() == 1560 &&
                    d[..520].iter().all(|b| *b == 9) &&
                    d[520..].iter().all(|b| *b == 7)
            }).returning(|_| {
                Box::pin(future::ready(DriveCompletion::ok(None)))
            });
        let n = rt.block_on(send_chain(&t, &mut arena, &mut pages,
                                       ChainKind::Read));
        assert_eq!(n, 1);
    }

    /// Nops are never dispatched, and an empty chain completes immediately.
    #[test]
    fn nops_skipped() {
        let rt = basic_runtime();
        let (mut arena, mut pages) = setup(Opcode::Read, &[0]);
        arena.set_degraded_nop(ChainKind::Read, PosBitmap::single(0));
        let t = MockDriveTransport::new();
        let n = rt.block_on(send_chain(&t, &mut arena, &mut pages,
                                       ChainKind::Read));
        assert_eq!(n, 0);
    }

    #[test]
    fn retry_only_retryable() {
        let rt = basic_runtime();
        let (mut arena, mut pages) = setup(Opcode::Read, &[0, 1, 2]);
        let mut seq = Sequence::new();
        let mut t = MockDriveTransport::new();
        t.expect_submit()
            .times(3)
            .in_sequence(&mut seq)
            .returning(|req| {
                let c = match req.position {
                    0 => DriveCompletion::err(DriveStatus::Retryable),
                    1 => DriveCompletion::err(DriveStatus::Dead),
                    _ => DriveCompletion::ok(Some(iovec_from(vec![0; 1040])))
                };
                Box::pin(future::ready(c))
            });
        t.expect_submit()
            .once()
            .in_sequence(&mut seq)
            .withf(|req: &DriveRequest| req.position == 0)
            .returning(|_| {
                let c = DriveCompletion::ok(Some(iovec_from(vec![0; 1040])));
                Box::pin(future::ready(c))
            });
        rt.block_on(async {
            send_chain(&t, &mut arena, &mut pages, ChainKind::Read).await;
            let eb = Eboard {
                retry_count: 1,
                retry_bitmap: PosBitmap::single(0),
                ..Default::default()
            };
            let n = retry_chain(&mut arena, ChainKind::Read, &eb,
                                PosBitmap::single(1));
            assert_eq!(n, 1);
            let n = send_chain(&t, &mut arena, &mut pages, ChainKind::Read)
                .await;
            assert_eq!(n, 1);
        });
        let id = arena.find(ChainKind::Read, 0).unwrap();
        assert!(arena.get(id).is_ok());
        assert_eq!(arena.get(id).retries, 1);
        assert_eq!(arena.count_active(ChainKind::Read), 0);
    }
}
// LCOV_EXCL_STOP
