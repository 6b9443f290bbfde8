//! TCP-core event handlers.
//!
//! The core fires bounded notifications that only mutate a CCB and schedule
//! a ready-queue entry; everything heavy happens later in the ready
//! pipeline. All of these run on the CPU owning the connection's flow group.

use std::sync::Arc;

use super::ccb::{Ccb, ConnTable, Handle, PendingEvents};
use super::*;
use crate::desc::{EventCode, RetCode};
use crate::logger::BreadcrumbFlags;
use crate::nic::FilterTuple;
use crate::transport::{CoreError, CoreEvent, PayloadChain};

impl CpuPlane {
    /// Single dispatch point for core callbacks.
    pub fn dispatch_core_event(
        &mut self,
        core: &mut dyn TcpCore,
        event: CoreEvent,
    ) -> Result<(), CoreError> {
        match event {
            CoreEvent::Accept { pcb, fg } => self.on_accept(core, pcb, fg),
            CoreEvent::Recv { ctx, payload } => {
                self.on_recv(ctx, payload);
                Ok(())
            }
            CoreEvent::Sent { ctx, len } => {
                self.on_sent(ctx, len);
                Ok(())
            }
            CoreEvent::Connected { ctx, err } => {
                self.on_connected(ctx, err);
                Ok(())
            }
            CoreEvent::Err { ctx, err } => {
                self.on_err(ctx, err);
                Ok(())
            }
        }
    }

    /// A listener completed a handshake. Pool exhaustion propagates back so
    /// the core rebuffs the peer.
    fn on_accept(&mut self, core: &mut dyn TcpCore, pcb: PcbId, fg: FgId) -> Result<(), CoreError> {
        let (remote_ip, remote_port) = core.peer(pcb);
        let local_port = core.local_port(pcb);
        let host = self.engine.config.host_addr_u32();

        let ctx = self.with_conns(|table| {
            let Some(idx) = table.pool.alloc(|idx| Ccb::new(Handle::pack(fg, idx), pcb)) else {
                return Err(CoreError::Mem);
            };
            let tuple = IpTuple {
                src_ip: remote_ip,
                dst_ip: host,
                src_port: remote_port,
                dst_port: local_port,
            };
            let Some(id) = table.ids.alloc(tuple) else {
                table.pool.free(idx);
                return Err(CoreError::Mem);
            };
            if let Some(ccb) = table.pool.get_mut(idx) {
                ccb.id = Some(id);
                ccb.pending |= PendingEvents::KNOCK;
            }
            let ctx = table.pool.ccb_ref(idx);
            table.ready_enqueue(idx);
            Ok(ctx)
        })?;

        core.tcp_nagle_disable(pcb);
        if let Some(ctx) = ctx {
            core.set_conn_ctx(pcb, ctx.to_ctx());
        }
        self.counters.open_connections += 1;
        logger::breadcrumb(
            BreadcrumbFlags::CCB,
            format!(
                "accepted {:#x}:{} on fg {} (cpu {})",
                remote_ip, remote_port, fg, self.cpu
            ),
        );
        Ok(())
    }

    /// Payload arrived, or the peer half closed when `payload` is `None`.
    /// Chains buffer in arrival order; emission is deferred until the
    /// application accepts.
    fn on_recv(&mut self, ctx: u64, payload: Option<PayloadChain>) {
        let Some(chain) = payload else {
            self.mark_dead_ctx(ctx);
            return;
        };
        self.with_conns(|table| {
            let Some(idx) = resolve_ctx(table, ctx) else {
                logger::breadcrumb(BreadcrumbFlags::CCB, "recv for stale connection dropped");
                return;
            };
            let Some(ccb) = table.pool.get_mut(idx) else {
                return;
            };
            let chain = Arc::new(chain);
            ccb.recvd.push_back(Arc::clone(&chain));
            if !ccb.accepted {
                return;
            }
            ccb.emit_queue.push_back(chain);
            table.ready_enqueue(idx);
        });
    }

    fn on_sent(&mut self, ctx: u64, len: u32) {
        self.with_conns(|table| {
            let Some(idx) = resolve_ctx(table, ctx) else {
                return;
            };
            if let Some(ccb) = table.pool.get_mut(idx) {
                ccb.sent_len += len;
            }
            table.ready_enqueue(idx);
        });
    }

    /// Out-of-band failure. A null context means the callback raced the
    /// handshake before the CCB was linked; nothing to do. On fatal errors
    /// the core-side PCB is gone and must not be referenced again.
    fn on_err(&mut self, ctx: u64, err: CoreError) {
        if ctx == 0 || !err.is_fatal() {
            return;
        }
        let found = self.with_conns(|table| {
            let idx = resolve_ctx(table, ctx)?;
            if let Some(ccb) = table.pool.get_mut(idx) {
                ccb.pcb = None;
            }
            Some(mark_dead(table, idx))
        });
        if let Some(fdir) = found {
            self.finish_dead(fdir);
        }
    }

    /// An earlier connect resolved. Failure emits the synchronous
    /// `CONNECTED` error event; the CCB stays alive until the application
    /// issues a CLOSE for it.
    ///
    /// TODO: mark the CCB dead on failure so a refused connect the
    /// application never closes cannot pin its pool slot forever.
    fn on_connected(&mut self, ctx: u64, err: Option<CoreError>) {
        if let Some(err) = err {
            let info = self.with_conns(|table| {
                let idx = resolve_ctx(table, ctx)?;
                table.pool.get(idx).map(|ccb| (ccb.handle, ccb.cookie))
            });
            let Some((handle, cookie)) = info else {
                return;
            };
            logger::error(format!("connect failed for {handle}: {err}"));
            self.events.push(
                Descriptor::event(
                    EventCode::Connected,
                    handle.raw(),
                    cookie,
                    RetCode::ConnRefused.wire() as u64,
                    0,
                ),
                None,
            );
            return;
        }
        self.with_conns(|table| {
            let Some(idx) = resolve_ctx(table, ctx) else {
                return;
            };
            if let Some(ccb) = table.pool.get_mut(idx) {
                ccb.pending |= PendingEvents::CONNECTED;
            }
            table.ready_enqueue(idx);
        });
    }

    fn mark_dead_ctx(&mut self, ctx: u64) {
        let found = self.with_conns(|table| {
            let idx = resolve_ctx(table, ctx)?;
            Some(mark_dead(table, idx))
        });
        if let Some(fdir) = found {
            self.finish_dead(fdir);
        }
    }

    fn finish_dead(&mut self, fdir: Option<FilterTuple>) {
        if let Some(filter) = fdir {
            self.engine.dev.fdir_remove_perfect_filter(&filter);
        }
        self.counters.open_connections -= 1;
    }
}

/// Resolve a core context word to a live slot; stale generations miss.
pub(super) fn resolve_ctx(table: &ConnTable, ctx: u64) -> Option<u32> {
    CcbRef::from_ctx(ctx).and_then(|r| table.pool.resolve(r))
}

/// Kill a connection: the peer half is gone. Returns the flow-director
/// filter to remove, if this connection installed one.
pub(super) fn mark_dead(table: &mut ConnTable, idx: u32) -> Option<FilterTuple> {
    let fdir = match table.pool.get_mut(idx) {
        Some(ccb) => {
            ccb.alive = false;
            ccb.fdir.take()
        }
        None => return None,
    };
    table.ready_enqueue(idx);
    fdir
}
