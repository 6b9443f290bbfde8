//! Connection control blocks, the pools that hold them, and handle packing.

use std::collections::VecDeque;
use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use bitflags::bitflags;

use crate::desc::ReqCode;
use crate::nic::{FgId, FilterTuple};
use crate::transport::{PayloadChain, PcbId};
use crate::usermem::IpTuple;

const HANDLE_INDEX_BITS: u32 = 48;
const HANDLE_INDEX_MASK: u64 = (1 << HANDLE_INDEX_BITS) - 1;

/// Opaque connection identifier handed to the application: flow-group id in
/// the top 16 bits, pool index in the low 48.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct Handle(u64);

impl Handle {
    pub(crate) fn pack(fg: FgId, idx: u32) -> Self {
        Handle(((fg as u64) << HANDLE_INDEX_BITS) | idx as u64)
    }

    pub fn from_raw(raw: u64) -> Self {
        Handle(raw)
    }

    pub fn raw(self) -> u64 {
        self.0
    }

    pub fn fg(self) -> FgId {
        (self.0 >> HANDLE_INDEX_BITS) as FgId
    }

    pub(crate) fn index(self) -> u64 {
        self.0 & HANDLE_INDEX_MASK
    }
}

impl fmt::Debug for Handle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Handle({:#x})", self.0)
    }
}

impl fmt::Display for Handle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

/// Generation-stamped reference to a pool slot. This is what the TCP core
/// stores as its per-connection context word and what cross-CPU ack calls
/// carry; the stamp turns use-after-free into a detectable no-op.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CcbRef {
    pub(crate) idx: u32,
    pub(crate) gen: u32,
}

impl CcbRef {
    pub(crate) fn to_ctx(self) -> u64 {
        ((self.gen as u64) << 32) | self.idx as u64
    }

    pub(crate) fn from_ctx(ctx: u64) -> Option<Self> {
        if ctx == 0 {
            return None;
        }
        Some(Self {
            idx: ctx as u32,
            gen: (ctx >> 32) as u32,
        })
    }
}

bitflags! {
    /// Teardown latch. `READY` records an enqueue requested while acks were
    /// outstanding; `CLOSED` requests a free once they drain.
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
    pub struct CcbFlags: u8 {
        const READY = 1;
        const CLOSED = 2;
    }
}

bitflags! {
    /// One-shot events pending emission.
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
    pub struct PendingEvents: u8 {
        const KNOCK = 1;
        const CONNECTED = 2;
    }
}

/// Per-connection state owned by the event plane.
pub(crate) struct Ccb {
    /// Cleared once the peer half closes or resets.
    pub alive: bool,
    /// Core-side connection; cleared on fatal transport errors independently
    /// of `alive`.
    pub pcb: Option<PcbId>,
    pub cookie: u64,
    /// Identity-record slot, present until accept or close releases it.
    pub id: Option<u32>,
    /// Reverse-tuple filter installed in the NIC, if flow director steered
    /// this connection.
    pub fdir: Option<FilterTuple>,
    pub handle: Handle,
    /// Received chains not yet acknowledged by the application, wire order.
    pub recvd: VecDeque<Arc<PayloadChain>>,
    /// Received chains queued for emission (populated once accepted).
    pub emit_queue: VecDeque<Arc<PayloadChain>>,
    /// Intrusive ready-FIFO link.
    pub ready_next: Option<u32>,
    pub accepted: bool,
    /// Bytes acknowledged by the peer since the last drain.
    pub sent_len: u32,
    /// Bytes handed to the core since the last drain.
    pub xmit_len: u32,
    pub pending: PendingEvents,
    /// Emitted events not yet acknowledged by the application. Signed: a
    /// failed connect emits a synchronous event that is acked but never
    /// counted (see plane/bridge.rs).
    pub inflight: i32,
    pub flags: CcbFlags,
    /// Deferred error surfaced as a synchronous-return event at next drain.
    pub deferred_ret: Option<(ReqCode, i64)>,
}

impl Ccb {
    pub fn new(handle: Handle, pcb: PcbId) -> Self {
        Self {
            alive: true,
            pcb: Some(pcb),
            cookie: 0,
            id: None,
            fdir: None,
            handle,
            recvd: VecDeque::new(),
            emit_queue: VecDeque::new(),
            ready_next: None,
            accepted: false,
            sent_len: 0,
            xmit_len: 0,
            pending: PendingEvents::empty(),
            inflight: 0,
            flags: CcbFlags::empty(),
            deferred_ret: None,
        }
    }
}

enum Slot {
    Free { next: Option<u32> },
    Used(Ccb),
}

struct SlotEntry {
    gen: u32,
    state: Slot,
}

/// Fixed-capacity CCB arena with an intrusive free list. The free/used state
/// lives in the slot discriminant, so staleness checks never dereference
/// connection fields; generations are bumped on free.
pub(crate) struct CcbPool {
    slots: Vec<SlotEntry>,
    free_head: Option<u32>,
    free_count: usize,
}

impl CcbPool {
    pub fn with_capacity(cap: usize) -> Self {
        let mut slots = Vec::with_capacity(cap);
        for i in 0..cap {
            let next = if i + 1 < cap { Some(i as u32 + 1) } else { None };
            slots.push(SlotEntry {
                gen: 1,
                state: Slot::Free { next },
            });
        }
        Self {
            slots,
            free_head: (cap > 0).then_some(0),
            free_count: cap,
        }
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    #[allow(dead_code)]
    pub fn free_count(&self) -> usize {
        self.free_count
    }

    /// O(1) allocation; the builder sees the slot index so it can pack the
    /// handle before the CCB is stored.
    pub fn alloc(&mut self, build: impl FnOnce(u32) -> Ccb) -> Option<u32> {
        let idx = self.free_head?;
        let entry = &mut self.slots[idx as usize];
        let Slot::Free { next } = entry.state else {
            return None;
        };
        self.free_head = next;
        self.free_count -= 1;
        entry.state = Slot::Used(build(idx));
        Some(idx)
    }

    pub fn free(&mut self, idx: u32) {
        let entry = &mut self.slots[idx as usize];
        debug_assert!(matches!(entry.state, Slot::Used(_)));
        entry.state = Slot::Free {
            next: self.free_head,
        };
        entry.gen = entry.gen.wrapping_add(1).max(1);
        self.free_head = Some(idx);
        self.free_count += 1;
    }

    pub fn get(&self, idx: u32) -> Option<&Ccb> {
        match self.slots.get(idx as usize)?.state {
            Slot::Used(ref ccb) => Some(ccb),
            Slot::Free { .. } => None,
        }
    }

    pub fn get_mut(&mut self, idx: u32) -> Option<&mut Ccb> {
        match self.slots.get_mut(idx as usize)?.state {
            Slot::Used(ref mut ccb) => Some(ccb),
            Slot::Free { .. } => None,
        }
    }

    /// Reference to a live slot, stamped with its current generation.
    pub fn ccb_ref(&self, idx: u32) -> Option<CcbRef> {
        let entry = self.slots.get(idx as usize)?;
        match entry.state {
            Slot::Used(_) => Some(CcbRef {
                idx,
                gen: entry.gen,
            }),
            Slot::Free { .. } => None,
        }
    }

    /// Resolve a stamped reference; stale stamps and freed slots miss.
    pub fn resolve(&self, r: CcbRef) -> Option<u32> {
        let entry = self.slots.get(r.idx as usize)?;
        match entry.state {
            Slot::Used(_) if entry.gen == r.gen => Some(r.idx),
            _ => None,
        }
    }
}

enum IdSlot {
    Free { next: Option<u32> },
    Used(IpTuple),
}

/// Identity-record pool, mapped into the application address space; records
/// are reported by their address in that mapping.
pub(crate) struct IdPool {
    slots: Vec<IdSlot>,
    free_head: Option<u32>,
    iomap_base: u64,
}

impl IdPool {
    pub fn with_capacity(cap: usize, iomap_base: u64) -> Self {
        let mut slots = Vec::with_capacity(cap);
        for i in 0..cap {
            let next = if i + 1 < cap { Some(i as u32 + 1) } else { None };
            slots.push(IdSlot::Free { next });
        }
        Self {
            slots,
            free_head: (cap > 0).then_some(0),
            iomap_base,
        }
    }

    pub fn alloc(&mut self, tuple: IpTuple) -> Option<u32> {
        let idx = self.free_head?;
        let slot = &mut self.slots[idx as usize];
        let IdSlot::Free { next } = *slot else {
            return None;
        };
        self.free_head = next;
        *slot = IdSlot::Used(tuple);
        Some(idx)
    }

    pub fn free(&mut self, idx: u32) {
        let slot = &mut self.slots[idx as usize];
        debug_assert!(matches!(slot, IdSlot::Used(_)));
        *slot = IdSlot::Free {
            next: self.free_head,
        };
        self.free_head = Some(idx);
    }

    #[allow(dead_code)]
    pub fn get(&self, idx: u32) -> Option<&IpTuple> {
        match self.slots.get(idx as usize)? {
            IdSlot::Used(tuple) => Some(tuple),
            IdSlot::Free { .. } => None,
        }
    }

    pub fn iomap_addr(&self, idx: u32) -> u64 {
        self.iomap_base + idx as u64 * std::mem::size_of::<IpTuple>() as u64
    }
}

/// Intrusive single-membership FIFO over pool indices. Pushing a linked CCB
/// is a no-op; the shared length hint lets remote CPUs probe emptiness
/// without the lock.
pub(crate) struct ReadyFifo {
    head: Option<u32>,
    tail: Option<u32>,
    hint: Arc<AtomicUsize>,
}

impl ReadyFifo {
    pub fn new(hint: Arc<AtomicUsize>) -> Self {
        Self {
            head: None,
            tail: None,
            hint,
        }
    }

    #[allow(dead_code)]
    pub fn is_empty(&self) -> bool {
        self.head.is_none()
    }

    pub fn contains(&self, pool: &CcbPool, idx: u32) -> bool {
        match pool.get(idx) {
            Some(ccb) => ccb.ready_next.is_some() || self.tail == Some(idx),
            None => false,
        }
    }

    pub fn push_back(&mut self, pool: &mut CcbPool, idx: u32) {
        if self.contains(pool, idx) {
            return;
        }
        match self.tail {
            None => {
                self.head = Some(idx);
                self.tail = Some(idx);
            }
            Some(tail) => {
                if let Some(ccb) = pool.get_mut(tail) {
                    ccb.ready_next = Some(idx);
                }
                self.tail = Some(idx);
            }
        }
        self.hint.fetch_add(1, Ordering::Relaxed);
    }

    /// Re-queue at the front; used when the event ring lacks headroom.
    pub fn push_front(&mut self, pool: &mut CcbPool, idx: u32) {
        if self.contains(pool, idx) {
            return;
        }
        if let Some(ccb) = pool.get_mut(idx) {
            ccb.ready_next = self.head;
        }
        if self.head.is_none() {
            self.tail = Some(idx);
        }
        self.head = Some(idx);
        self.hint.fetch_add(1, Ordering::Relaxed);
    }

    pub fn pop_front(&mut self, pool: &mut CcbPool) -> Option<u32> {
        let idx = self.head?;
        let next = pool.get_mut(idx).and_then(|ccb| ccb.ready_next.take());
        self.head = next;
        if self.head.is_none() {
            self.tail = None;
        }
        self.hint.fetch_sub(1, Ordering::Relaxed);
        Some(idx)
    }

    /// Unlink an arbitrary member; needed when a close frees a CCB that is
    /// still queued. O(n), but only teardown takes this path.
    pub fn remove(&mut self, pool: &mut CcbPool, idx: u32) {
        if !self.contains(pool, idx) {
            return;
        }
        if self.head == Some(idx) {
            self.pop_front(pool);
            return;
        }
        let mut cursor = self.head;
        while let Some(cur) = cursor {
            let next = pool.get(cur).and_then(|ccb| ccb.ready_next);
            if next == Some(idx) {
                let after = pool.get_mut(idx).and_then(|ccb| ccb.ready_next.take());
                if let Some(ccb) = pool.get_mut(cur) {
                    ccb.ready_next = after;
                }
                if self.tail == Some(idx) {
                    self.tail = Some(cur);
                }
                self.hint.fetch_sub(1, Ordering::Relaxed);
                return;
            }
            cursor = next;
        }
    }
}

/// A CPU's connection state: both pools plus the ready FIFO, guarded
/// together by one lock (the ready-queue lock of the design).
pub(crate) struct ConnTable {
    pub pool: CcbPool,
    pub ids: IdPool,
    pub ready: ReadyFifo,
}

impl ConnTable {
    pub fn new(ccb_cap: usize, id_cap: usize, iomap_base: u64, hint: Arc<AtomicUsize>) -> Self {
        Self {
            pool: CcbPool::with_capacity(ccb_cap),
            ids: IdPool::with_capacity(id_cap, iomap_base),
            ready: ReadyFifo::new(hint),
        }
    }

    /// Queue a CCB for the ready pipeline. While emitted events await acks
    /// the CCB must stay out of the FIFO; the request is latched instead and
    /// replayed when the last ack lands.
    pub fn ready_enqueue(&mut self, idx: u32) {
        let Some(ccb) = self.pool.get_mut(idx) else {
            return;
        };
        if ccb.inflight > 0 {
            ccb.flags |= CcbFlags::READY;
            return;
        }
        self.ready.push_back(&mut self.pool, idx);
    }

    /// Decode a handle into this table. `None` is a stale or foreign handle.
    pub fn lookup(&self, handle: Handle) -> Option<u32> {
        let idx = handle.index();
        if idx >= self.pool.capacity() as u64 {
            return None;
        }
        let idx = idx as u32;
        self.pool.get(idx).map(|_| idx)
    }

    /// Release a CCB, unlinking it from the ready FIFO first if needed.
    pub fn free_ccb(&mut self, idx: u32) {
        self.ready.remove(&mut self.pool, idx);
        self.pool.free(idx);
    }
}
