//! The per-CPU event plane.
//!
//! [`Engine`] holds everything the CPUs share: connection tables, the bounded
//! cross-CPU request queues, the ack call channels, and the idle/nudge
//! bookkeeping. Each dataplane CPU owns one [`CpuPlane`], the context passed
//! into every entry point; no module-level mutable state exists.

pub(crate) mod ccb;

mod bind;
mod bridge;
mod emit;
mod sink;
mod steal;

pub use ccb::Handle;

use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Instant;

use anyhow::{ensure, Context, Result};
use crossbeam_channel::{unbounded, Receiver, Sender};
use parking_lot::Mutex;
use rand::rngs::SmallRng;
use rand::SeedableRng;
use rustc_hash::FxHashMap;

use crate::config::{Config, REMOTE_QUEUE_CAP};
use crate::desc::{Descriptor, EventRing};
use crate::logger;
use crate::nic::{self, CpuId, EthDev, FgId, IpiSender};
use crate::transport::{PcbId, TcpCore, LISTEN_BACKLOG};
use crate::usermem::IpTuple;
use ccb::{CcbRef, ConnTable};

/// Minimum spacing between nudges aimed at the same CPU.
pub(crate) const IPI_MIN_SPACING_NS: u64 = 4_000;

/// Cross-CPU calls executed by the owning CPU during bookkeeping; the
/// run-on-one dispatch of the emit-ack path.
pub(crate) enum PlaneCall {
    FinishEmit(CcbRef),
}

/// Bounded queue of requests routed from other CPUs.
pub(crate) struct RemoteReqs {
    descs: Vec<Descriptor>,
}

impl RemoteReqs {
    fn new() -> Self {
        Self {
            descs: Vec::with_capacity(REMOTE_QUEUE_CAP),
        }
    }

    pub fn len(&self) -> usize {
        self.descs.len()
    }

    pub fn push(&mut self, desc: Descriptor) -> bool {
        if self.descs.len() >= REMOTE_QUEUE_CAP {
            return false;
        }
        self.descs.push(desc);
        true
    }

    pub fn drain(&mut self) -> Vec<Descriptor> {
        std::mem::replace(&mut self.descs, Vec::with_capacity(REMOTE_QUEUE_CAP))
    }
}

/// One CPU's cross-CPU-visible state. Races on the atomics are tolerated;
/// they are hints, never ground truth.
pub(crate) struct CpuShared {
    /// Pools plus ready FIFO, guarded together (the ready-queue lock).
    pub conns: Mutex<ConnTable>,
    pub remote_reqs: Mutex<RemoteReqs>,
    /// Mirror of the ready FIFO length, probed lock-free by stealers.
    pub ready_hint: Arc<AtomicUsize>,
    pub calls_tx: Sender<PlaneCall>,
    pub calls_rx: Receiver<PlaneCall>,
    /// False while the CPU runs application code; such CPUs are steal
    /// victims and nudge targets.
    pub in_kernel: AtomicBool,
    /// Nanosecond timestamp of the last nudge aimed at this CPU; zero when
    /// none is outstanding.
    pub last_ipi_ns: AtomicU64,
}

/// Everything the dataplane CPUs share.
pub struct Engine {
    config: Config,
    dev: Arc<dyn EthDev>,
    ipi: Option<Arc<dyn IpiSender>>,
    cpus: Vec<CpuShared>,
    epoch: Instant,
}

impl Engine {
    pub fn new(
        config: Config,
        dev: Arc<dyn EthDev>,
        ipi: Option<Arc<dyn IpiSender>>,
    ) -> Result<Arc<Self>> {
        config.validate()?;
        let nb_rx_fgs = dev.nb_rx_fgs();
        ensure!(nb_rx_fgs > 0, "device reports no flow groups");
        ensure!(
            nb_rx_fgs.is_power_of_two(),
            "flow-group count {} is not a power of two",
            nb_rx_fgs
        );
        ensure!(
            nb_rx_fgs as usize + config.num_cpus <= FgId::MAX as usize + 1,
            "flow-group id space exhausted"
        );

        let id_span = config.id_pool_size as u64 * std::mem::size_of::<IpTuple>() as u64;
        let cpus = (0..config.num_cpus)
            .map(|cpu| {
                let ready_hint = Arc::new(AtomicUsize::new(0));
                let (calls_tx, calls_rx) = unbounded();
                CpuShared {
                    conns: Mutex::new(ConnTable::new(
                        config.ccb_pool_size,
                        config.id_pool_size,
                        config.id_iomap_base + cpu as u64 * id_span,
                        Arc::clone(&ready_hint),
                    )),
                    remote_reqs: Mutex::new(RemoteReqs::new()),
                    ready_hint,
                    calls_tx,
                    calls_rx,
                    in_kernel: AtomicBool::new(true),
                    last_ipi_ns: AtomicU64::new(0),
                }
            })
            .collect();

        Ok(Arc::new(Self {
            config,
            dev,
            ipi,
            cpus,
            epoch: Instant::now(),
        }))
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn num_cpus(&self) -> usize {
        self.cpus.len()
    }

    pub(crate) fn shared(&self, cpu: CpuId) -> &CpuShared {
        &self.cpus[cpu]
    }

    pub(crate) fn fg_owner(&self, fg: FgId) -> Option<CpuId> {
        nic::fg_owner(self.dev.as_ref(), self.cpus.len(), fg)
    }

    /// Monotonic nanoseconds since engine start; never zero, so zero can
    /// mean "no nudge outstanding".
    pub(crate) fn now_ns(&self) -> u64 {
        (self.epoch.elapsed().as_nanos() as u64).max(1)
    }
}

/// Per-CPU connection and steal statistics.
#[derive(Clone, Copy, Debug, Default)]
pub struct PlaneCounters {
    pub open_connections: i64,
    pub events_emitted: u64,
    pub acks_finished: u64,
    pub reqs_routed: u64,
    pub steals: u64,
    pub stolen_events: u64,
    pub ipis_sent: u64,
}

/// One CPU's event-plane context. All entry points run on the owning CPU;
/// only the steal and ack paths reach across, through `Engine`.
pub struct CpuPlane {
    engine: Arc<Engine>,
    cpu: CpuId,
    events: EventRing,
    /// Outbound local-port cursor within this CPU's reserved range; zero
    /// until the first connect.
    local_port: u32,
    rng: SmallRng,
    listeners: FxHashMap<u16, PcbId>,
    counters: PlaneCounters,
}

impl CpuPlane {
    /// Build the context for one CPU and install its listeners.
    pub fn new(engine: &Arc<Engine>, cpu: CpuId, core: &mut dyn TcpCore) -> Result<Self> {
        ensure!(cpu < engine.cpus.len(), "cpu {} out of range", cpu);

        let mut listeners = FxHashMap::default();
        for port in engine.config.listen_ports() {
            let pcb = core
                .listen(port, LISTEN_BACKLOG)
                .with_context(|| format!("installing listener on port {port}"))?;
            listeners.insert(port, pcb);
        }
        logger::info(format!(
            "cpu {} online, {} listener(s)",
            cpu,
            listeners.len()
        ));

        Ok(Self {
            engine: Arc::clone(engine),
            cpu,
            events: EventRing::with_capacity(engine.config.event_ring_size),
            local_port: 0,
            rng: SmallRng::seed_from_u64(0x9e37_79b9_7f4a_7c15 ^ cpu as u64),
            listeners,
            counters: PlaneCounters::default(),
        })
    }

    pub fn cpu(&self) -> CpuId {
        self.cpu
    }

    pub fn engine(&self) -> &Arc<Engine> {
        &self.engine
    }

    pub fn counters(&self) -> PlaneCounters {
        self.counters
    }

    /// The event batch pending application consumption.
    pub fn events(&self) -> &[Descriptor] {
        self.events.slots()
    }

    pub fn listener(&self, port: u16) -> Option<PcbId> {
        self.listeners.get(&port).copied()
    }

    pub fn enter_kernel(&self) {
        self.engine
            .shared(self.cpu)
            .in_kernel
            .store(true, Ordering::Relaxed);
    }

    pub fn return_to_app(&self) {
        self.engine
            .shared(self.cpu)
            .in_kernel
            .store(false, Ordering::Relaxed);
    }

    /// One kernel-side iteration: ack the batch the application consumed,
    /// sink its new requests, drain cross-CPU work, and refill the event
    /// ring. NIC RX and core timers are driven by the embedder around this.
    pub fn poll(
        &mut self,
        core: &mut dyn TcpCore,
        user: &dyn crate::usermem::UserMem,
        reqs: &mut [Descriptor],
    ) -> usize {
        self.enter_kernel();
        self.finish_events();
        self.submit(core, user, reqs);
        self.bookkeeping(core, user);
        self.pump_ready();
        self.return_to_app();
        self.events.len()
    }

    pub(crate) fn with_conns<R>(&self, f: impl FnOnce(&mut ConnTable) -> R) -> R {
        let mut guard = self.engine.shared(self.cpu).conns.lock();
        f(&mut guard)
    }
}
