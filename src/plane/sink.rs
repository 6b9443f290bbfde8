//! Descriptor sink: the application-to-kernel half of the plane.
//!
//! A submitted batch is first routed: TCP requests whose home CPU differs
//! from the submitting one move to the owner's bounded queue and leave a NOP
//! behind. Each remaining request is then dispatched locally.

use super::ccb::{Ccb, CcbFlags, ConnTable, Handle};
use super::*;
use crate::desc::{ReqCode, RetCode};
use crate::logger::BreadcrumbFlags;
use crate::usermem::{SgEntry, UserMem, SG_ENTRY_SIZE};

/// Outcome of the locked validation phase of a request.
enum Validated {
    BadHandle,
    /// The failure was recorded on the CCB for deferred delivery.
    Reported,
    Go { idx: u32, pcb: PcbId },
}

impl CpuPlane {
    /// Consume a request batch. TCP slots are handled (or routed, becoming
    /// NOP); everything else is left in place for its own sink.
    pub fn submit(&mut self, core: &mut dyn TcpCore, user: &dyn UserMem, reqs: &mut [Descriptor]) {
        self.route(reqs);
        for i in 0..reqs.len() {
            let desc = reqs[i];
            self.dispatch_one(core, user, &desc);
        }
    }

    /// Move TCP requests owned elsewhere to their home CPU. CONNECT is
    /// always local by construction and never routed.
    fn route(&mut self, reqs: &mut [Descriptor]) {
        for slot in reqs.iter_mut() {
            let Some(code) = slot.req_code() else { continue };
            if !code.is_tcp() || code == ReqCode::Connect {
                continue;
            }
            let handle = Handle::from_raw(slot.arga);
            let Some(home) = self.engine.fg_owner(handle.fg()) else {
                // Unknown flow group: dispatch locally so it surfaces BADH.
                continue;
            };
            if home == self.cpu {
                continue;
            }
            logger::breadcrumb(
                BreadcrumbFlags::ROUTE,
                format!("{} routed {} -> cpu {}", self.cpu, slot.describe_req(), home),
            );
            let pushed = self.engine.shared(home).remote_reqs.lock().push(*slot);
            if pushed {
                self.counters.reqs_routed += 1;
            } else {
                logger::warn(format!(
                    "remote request queue of cpu {} full, failing {}",
                    home,
                    slot.describe_req()
                ));
                self.push_ret(code, RetCode::NoMem, 0);
            }
            *slot = Descriptor::new(ReqCode::Nop as u64, 0, 0, 0, 0);
        }
    }

    /// Dispatch one request on its home CPU.
    pub(super) fn dispatch_one(
        &mut self,
        core: &mut dyn TcpCore,
        user: &dyn UserMem,
        desc: &Descriptor,
    ) {
        let Some(code) = desc.req_code() else { return };
        match code {
            ReqCode::Connect => self.req_connect(core, user, desc.arga, desc.argb),
            ReqCode::Accept => self.req_accept(Handle::from_raw(desc.arga), desc.argb),
            ReqCode::Sendv => {
                self.req_sendv(core, user, Handle::from_raw(desc.arga), desc.argb, desc.argc)
            }
            ReqCode::RecvDone => self.req_recv_done(core, Handle::from_raw(desc.arga), desc.argb),
            ReqCode::Close => self.req_close(core, Handle::from_raw(desc.arga)),
            ReqCode::Reject | ReqCode::Send => {
                // The transport accepts synchronously; neither call can be
                // honored. The application contract is unsupported.
                logger::error(format!("{} is not supported", code));
                panic!("{code} is not supported by the transport contract");
            }
            // UDP and NOP slots belong to other sinks.
            ReqCode::UdpSend | ReqCode::UdpSendv | ReqCode::UdpRecvDone | ReqCode::Nop => {}
        }
    }

    fn push_ret(&mut self, req: ReqCode, code: RetCode, cookie: u64) {
        if !self
            .events
            .push(Descriptor::call_ret(req, code.wire(), cookie), None)
        {
            logger::warn(format!("event ring full, dropped {req} return ({code})"));
        }
    }

    fn push_ret_raw(&mut self, req: ReqCode, ret: i64, cookie: u64) {
        if !self.events.push(Descriptor::call_ret(req, ret, cookie), None) {
            logger::warn(format!("event ring full, dropped {req} return"));
        }
    }

    /// CONNECT: pick a local port bound to this CPU, set up the core
    /// connection, and return the handle synchronously. The CONNECTED (or
    /// its error) arrives later.
    fn req_connect(&mut self, core: &mut dyn TcpCore, user: &dyn UserMem, id_addr: u64, cookie: u64) {
        let Some(mut tuple) = user.read_tuple(id_addr) else {
            self.push_ret(ReqCode::Connect, RetCode::Fault, 0);
            return;
        };
        tuple.src_ip = self.engine.config.host_addr_u32();

        let Some(binding) = self.bind_outbound(&mut tuple) else {
            self.push_ret(ReqCode::Connect, RetCode::Fault, 0);
            return;
        };

        let Some(pcb) = core.tcp_new(binding.fg) else {
            if let Some(filter) = binding.fdir {
                self.engine.dev.fdir_remove_perfect_filter(&filter);
            }
            self.push_ret(ReqCode::Connect, RetCode::NoMem, 0);
            return;
        };
        core.tcp_nagle_disable(pcb);

        let fg = binding.fg;
        let fdir = binding.fdir;
        let alloc = self.with_conns(|table| {
            let idx = table.pool.alloc(|idx| {
                let mut ccb = Ccb::new(Handle::pack(fg, idx), pcb);
                ccb.accepted = true;
                ccb.cookie = cookie;
                ccb.fdir = fdir;
                ccb
            })?;
            Some((idx, table.pool.ccb_ref(idx)))
        });
        let Some((idx, Some(ctx))) = alloc else {
            core.tcp_abort(pcb);
            if let Some(filter) = fdir {
                self.engine.dev.fdir_remove_perfect_filter(&filter);
            }
            self.push_ret(ReqCode::Connect, RetCode::NoMem, 0);
            return;
        };
        core.set_conn_ctx(pcb, ctx.to_ctx());

        let setup = core
            .tcp_bind(pcb, tuple.src_ip, tuple.src_port)
            .and_then(|_| core.tcp_connect(pcb, tuple.dst_ip, tuple.dst_port));
        if let Err(err) = setup {
            logger::warn(format!("connect setup failed: {err}"));
            core.tcp_abort(pcb);
            let fdir = self.with_conns(|table| {
                let fdir = table.pool.get_mut(idx).and_then(|ccb| ccb.fdir.take());
                table.free_ccb(idx);
                fdir
            });
            if let Some(filter) = fdir {
                self.engine.dev.fdir_remove_perfect_filter(&filter);
            }
            self.push_ret(ReqCode::Connect, RetCode::NoMem, 0);
            return;
        }

        let handle = Handle::pack(fg, idx);
        self.counters.open_connections += 1;
        logger::breadcrumb(
            BreadcrumbFlags::SINK,
            format!(
                "connect {:#x}:{} from port {} as {}",
                tuple.dst_ip, tuple.dst_port, tuple.src_port, handle
            ),
        );
        self.push_ret_raw(ReqCode::Connect, handle.raw() as i64, cookie);
    }

    /// ACCEPT: adopt an inbound connection. The transport already completed
    /// the handshake; this records the cookie, releases the identity record,
    /// and replays any payload buffered before the application got here.
    fn req_accept(&mut self, handle: Handle, cookie: u64) {
        let found = self.with_conns(|table| {
            let idx = lookup(&self.engine, table, handle)?;
            let ccb = table.pool.get_mut(idx)?;
            let id = ccb.id.take();
            ccb.cookie = cookie;
            ccb.accepted = true;
            let buffered: Vec<_> = ccb.recvd.iter().cloned().collect();
            let had_buffered = !buffered.is_empty();
            ccb.emit_queue.extend(buffered);
            if let Some(id) = id {
                table.ids.free(id);
            }
            if had_buffered {
                table.ready_enqueue(idx);
            }
            Some(())
        });
        if found.is_none() {
            self.push_ret(ReqCode::Accept, RetCode::BadHandle, 0);
        }
    }

    /// SENDV: walk the scatter-gather list, clamping each entry to what the
    /// core will take and stopping once the clamp bites. Partial progress is
    /// progress; the byte count comes back via SENDV_RET.
    fn req_sendv(
        &mut self,
        core: &mut dyn TcpCore,
        user: &dyn UserMem,
        handle: Handle,
        ents_addr: u64,
        nrents: u64,
    ) {
        let ents_ok = user.range_ok(ents_addr, nrents.saturating_mul(SG_ENTRY_SIZE));
        let validated = self.with_conns(|table| {
            let Some(idx) = lookup(&self.engine, table, handle) else {
                return Validated::BadHandle;
            };
            let Some(ccb) = table.pool.get_mut(idx) else {
                return Validated::BadHandle;
            };
            if !ccb.alive {
                ccb.deferred_ret = Some((ReqCode::Sendv, RetCode::Closed.wire()));
                table.ready_enqueue(idx);
                return Validated::Reported;
            }
            if !ents_ok {
                ccb.deferred_ret = Some((ReqCode::Sendv, RetCode::Fault.wire()));
                table.ready_enqueue(idx);
                return Validated::Reported;
            }
            match ccb.pcb {
                Some(pcb) => Validated::Go { idx, pcb },
                None => {
                    ccb.deferred_ret = Some((ReqCode::Sendv, RetCode::Closed.wire()));
                    table.ready_enqueue(idx);
                    Validated::Reported
                }
            }
        });
        let (idx, pcb) = match validated {
            Validated::BadHandle => {
                self.push_ret(ReqCode::Sendv, RetCode::BadHandle, 0);
                return;
            }
            Validated::Reported => return,
            Validated::Go { idx, pcb } => (idx, pcb),
        };

        let entries = user.read_sg(ents_addr, nrents as usize).unwrap_or_default();
        let mut xmited: u64 = 0;
        for SgEntry { base, len } in entries {
            let clamp = core.snd_buf(pcb).min(0xffff) as u64;
            let buf_full = len > clamp;
            if !user.range_ok(base, len) {
                break;
            }
            let len = if buf_full { clamp } else { len };
            if len == 0 {
                break;
            }
            if core.tcp_write(pcb, base, len as usize).is_err() {
                break;
            }
            xmited += len;
            if buf_full {
                break;
            }
        }

        if xmited > 0 {
            core.tcp_output(pcb);
            self.with_conns(|table| {
                if let Some(ccb) = table.pool.get_mut(idx) {
                    ccb.xmit_len += xmited as u32;
                }
                table.ready_enqueue(idx);
            });
        }
    }

    /// RECV_DONE: open the receive window, then release buffers the
    /// application has fully consumed; a partially consumed chain stays.
    fn req_recv_done(&mut self, core: &mut dyn TcpCore, handle: Handle, len: u64) {
        let pcb = {
            let engine = &self.engine;
            self.with_conns(|table| {
                lookup(engine, table, handle)
                    .map(|idx| (idx, table.pool.get(idx).and_then(|ccb| ccb.pcb)))
            })
        };
        let Some((idx, pcb)) = pcb else {
            self.push_ret(ReqCode::RecvDone, RetCode::BadHandle, 0);
            return;
        };
        if let Some(pcb) = pcb {
            core.tcp_recved(pcb, len as usize);
        }
        self.with_conns(|table| {
            let Some(ccb) = table.pool.get_mut(idx) else {
                return;
            };
            let mut remaining = len;
            while let Some(front) = ccb.recvd.front() {
                let chain_len = front.total_len() as u64;
                if remaining < chain_len {
                    break;
                }
                remaining -= chain_len;
                ccb.recvd.pop_front();
            }
        });
    }

    /// CLOSE: reset-close the transport side, release buffers, identity and
    /// NIC state, and free the CCB now or once the last ack drains.
    fn req_close(&mut self, core: &mut dyn TcpCore, handle: Handle) {
        let plan = self.with_conns(|table| {
            let idx = lookup(&self.engine, table, handle)?;
            let ccb = table.pool.get_mut(idx)?;
            let pcb = ccb.pcb.take();
            ccb.recvd.clear();
            ccb.emit_queue.clear();
            let fdir = ccb.fdir.take();
            let id = ccb.id.take();
            let defer = ccb.inflight > 0;
            if defer {
                ccb.flags |= CcbFlags::CLOSED;
            }
            if let Some(id) = id {
                table.ids.free(id);
            }
            if !defer {
                table.free_ccb(idx);
            }
            Some((pcb, fdir, defer))
        });
        let Some((pcb, fdir, defer)) = plan else {
            self.push_ret(ReqCode::Close, RetCode::BadHandle, 0);
            return;
        };
        if let Some(pcb) = pcb {
            core.tcp_close_with_reset(pcb);
        }
        if let Some(filter) = fdir {
            self.engine.dev.fdir_remove_perfect_filter(&filter);
        }
        logger::breadcrumb(
            BreadcrumbFlags::SINK,
            format!("close {handle}{}", if defer { " (deferred)" } else { "" }),
        );
    }
}

/// Decode a handle against this CPU's table. The flow-group id must be in
/// range and the slot allocated; anything else is a stale handle.
pub(super) fn lookup(engine: &Engine, table: &ConnTable, handle: Handle) -> Option<u32> {
    engine.fg_owner(handle.fg())?;
    table.lookup(handle)
}
