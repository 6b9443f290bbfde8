//! Ready pipeline and emit-ack accounting.
//!
//! Draining pops one CCB at a time and emits at most one of each pending
//! event kind into the event ring. Counters reset as they are emitted; each
//! emitted event holds an ack against the CCB until the application drains
//! its batch. The CCB is never re-enqueued from here; that happens on the
//! ack path once the count returns to zero.

use super::ccb::{CcbFlags, ConnTable, Handle};
use super::*;
use crate::desc::EventCode;
use crate::logger::BreadcrumbFlags;

impl CpuPlane {
    /// Drain the local ready queue into the event ring. Stops early when the
    /// ring lacks headroom for a CCB's full burst, leaving it at the front.
    pub fn pump_ready(&mut self) -> usize {
        let mut emitted = 0;
        loop {
            let progress = {
                let mut guard = self.engine.shared(self.cpu).conns.lock();
                let table = &mut *guard;
                match table.ready.pop_front(&mut table.pool) {
                    None => None,
                    Some(idx) => match emit_events(table, idx, &mut self.events) {
                        Some(n) => Some(n),
                        None => {
                            table.ready.push_front(&mut table.pool, idx);
                            None
                        }
                    },
                }
            };
            match progress {
                Some(n) => emitted += n,
                None => break,
            }
        }
        self.counters.events_emitted += emitted as u64;
        emitted
    }

    /// Ack the batch the application just consumed. Each TCP event slot is
    /// finished on its owner CPU: directly when local, through the owner's
    /// call queue (plus a nudge if it has been idle) when remote.
    pub fn finish_events(&mut self) {
        for i in 0..self.events.len() {
            let slot = self.events.slots()[i];
            let origin = self.events.origins()[i];
            let Some(code) = slot.event_code() else { continue };
            if !code.is_tcp() {
                continue;
            }
            let Some(origin) = origin else { continue };
            let handle = Handle::from_raw(slot.arga);
            let Some(home) = self.engine.fg_owner(handle.fg()) else {
                continue;
            };
            if home == self.cpu {
                finish_emit(self.engine.shared(home), origin);
                self.counters.acks_finished += 1;
            } else {
                let _ = self
                    .engine
                    .shared(home)
                    .calls_tx
                    .send(PlaneCall::FinishEmit(origin));
                self.nudge(home);
            }
        }
        self.events.clear();
    }

    /// Owner-side bookkeeping: requests routed here from other CPUs first,
    /// then ack calls dispatched by their finishers.
    pub fn bookkeeping(&mut self, core: &mut dyn TcpCore, user: &dyn crate::usermem::UserMem) {
        let routed = {
            let mut queue = self.engine.shared(self.cpu).remote_reqs.lock();
            queue.drain()
        };
        for desc in &routed {
            logger::breadcrumb(
                BreadcrumbFlags::ROUTE,
                format!("cpu {} draining {}", self.cpu, desc.describe_req()),
            );
            self.dispatch_one(core, user, desc);
        }

        loop {
            let call = self.engine.shared(self.cpu).calls_rx.try_recv();
            match call {
                Ok(PlaneCall::FinishEmit(origin)) => {
                    finish_emit(self.engine.shared(self.cpu), origin);
                    self.counters.acks_finished += 1;
                }
                Err(_) => break,
            }
        }
    }
}

/// Emit every pending event of one CCB into `ring`, counting each against
/// the CCB. Returns `None` without side effects when the ring lacks headroom
/// for the full burst; the caller re-queues. The caller holds the owner's
/// conn lock; on a steal, `ring` belongs to a different CPU than `table`.
pub(super) fn emit_events(
    table: &mut ConnTable,
    idx: u32,
    ring: &mut crate::desc::EventRing,
) -> Option<usize> {
    let origin = table.pool.ccb_ref(idx);
    let ConnTable { pool, ids, .. } = table;
    let Some(ccb) = pool.get_mut(idx) else {
        return Some(0);
    };
    debug_assert!(ccb.flags.is_empty());
    debug_assert_eq!(ccb.inflight, 0);

    let burst = ccb.pending.bits().count_ones() as usize
        + usize::from(ccb.xmit_len > 0)
        + usize::from(ccb.sent_len > 0)
        + ccb.emit_queue.iter().map(|chain| chain.segs.len()).sum::<usize>()
        + usize::from(!ccb.alive)
        + usize::from(ccb.deferred_ret.is_some());
    if !ring.has_room(burst) {
        return None;
    }

    let handle = ccb.handle.raw();
    let cookie = ccb.cookie;
    let mut emitted = 0;

    if ccb.pending.contains(ccb::PendingEvents::KNOCK) {
        let iomap = ccb.id.map(|id| ids.iomap_addr(id)).unwrap_or(0);
        ring.push(
            Descriptor::event(EventCode::Knock, handle, iomap, 0, 0),
            origin,
        );
        ccb.inflight += 1;
        emitted += 1;
    }
    if ccb.pending.contains(ccb::PendingEvents::CONNECTED) {
        ring.push(
            Descriptor::event(EventCode::Connected, handle, cookie, 0, 0),
            origin,
        );
        ccb.inflight += 1;
        emitted += 1;
    }
    ccb.pending = ccb::PendingEvents::empty();

    if ccb.xmit_len > 0 {
        ring.push(
            Descriptor::event(EventCode::SendvRet, handle, cookie, ccb.xmit_len as u64, 0),
            origin,
        );
        ccb.xmit_len = 0;
        ccb.inflight += 1;
        emitted += 1;
    }
    if ccb.sent_len > 0 {
        ring.push(
            Descriptor::event(EventCode::Sent, handle, cookie, ccb.sent_len as u64, 0),
            origin,
        );
        ccb.sent_len = 0;
        ccb.inflight += 1;
        emitted += 1;
    }

    for chain in ccb.emit_queue.drain(..) {
        for seg in &chain.segs {
            ring.push(
                Descriptor::event(EventCode::Recv, handle, cookie, seg.iomap, seg.len as u64),
                origin,
            );
            ccb.inflight += 1;
            emitted += 1;
        }
    }

    if !ccb.alive {
        ring.push(Descriptor::event(EventCode::Dead, handle, cookie, 0, 0), origin);
        ccb.inflight += 1;
        emitted += 1;
    }

    if let Some((req, err)) = ccb.deferred_ret.take() {
        // No ack is held for this slot: a CALL_RET carries no handle, so the
        // finish walk cannot attribute it.
        ring.push(Descriptor::call_ret(req, err, cookie), None);
        emitted += 1;
    }

    Some(emitted)
}

/// Land one ack on its owner CPU: decrement the in-flight count and, at
/// zero, either free a closed CCB or replay a deferred ready-enqueue.
pub(super) fn finish_emit(shared: &CpuShared, origin: CcbRef) {
    let mut guard = shared.conns.lock();
    let table = &mut *guard;
    let Some(idx) = table.pool.resolve(origin) else {
        logger::breadcrumb(BreadcrumbFlags::EMIT, "ack for recycled CCB dropped");
        return;
    };
    let Some(ccb) = table.pool.get_mut(idx) else {
        return;
    };
    if ccb.inflight == 0 {
        // An unaccounted synchronous event (failed connect) was acked.
        logger::breadcrumb(BreadcrumbFlags::EMIT, "ack without matching emit");
        return;
    }
    ccb.inflight -= 1;
    if ccb.inflight != 0 {
        return;
    }
    let flags = ccb.flags;
    ccb.flags.remove(CcbFlags::READY);
    if flags.contains(CcbFlags::CLOSED) {
        table.free_ccb(idx);
    } else if flags.contains(CcbFlags::READY) {
        table.ready_enqueue(idx);
    }
}
