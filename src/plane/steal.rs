//! Idle-time work stealing and IPI nudging.
//!
//! A CPU with nothing to do may lift one ready CCB from a CPU that is busy
//! in application code and emit its events locally. When no queue is worth
//! stealing from, a CPU with pending RX gets a rate-limited nudge instead.

use std::sync::atomic::Ordering;
use std::time::{Duration, Instant};

use rand::Rng;
use smallvec::SmallVec;

use super::emit::emit_events;
use super::*;
use crate::config::MAX_CPUS;
use crate::logger::BreadcrumbFlags;

impl CpuPlane {
    /// Spin until the deadline, bailing out as soon as local work appears.
    /// Each round may steal one remote CCB or nudge one idle CPU.
    pub fn idle_wait(&mut self, usecs: u64) {
        let deadline = Instant::now() + Duration::from_micros(usecs);
        loop {
            if self.engine.shared(self.cpu).remote_reqs.lock().len() > 0 {
                return;
            }
            if self.engine.dev.rxq_ready(self.cpu) {
                return;
            }
            if self.try_steal() {
                return;
            }
            std::hint::spin_loop();
            if Instant::now() >= deadline {
                return;
            }
        }
    }

    /// Pick one victim uniformly among CPUs that are in application code
    /// with a non-empty ready queue, and move one CCB's events into our
    /// ring. Lock contention means someone else is making progress there;
    /// give up the round.
    fn try_steal(&mut self) -> bool {
        let mut victims: SmallVec<[CpuId; MAX_CPUS]> = SmallVec::new();
        for cpu in 0..self.engine.num_cpus() {
            if cpu == self.cpu {
                continue;
            }
            let shared = self.engine.shared(cpu);
            if shared.in_kernel.load(Ordering::Relaxed) {
                continue;
            }
            if shared.ready_hint.load(Ordering::Relaxed) == 0 {
                continue;
            }
            victims.push(cpu);
        }
        if victims.is_empty() {
            self.steal_nudge();
            return false;
        }

        let victim = victims[self.rng.gen_range(0..victims.len())];
        let stolen = {
            let shared = self.engine.shared(victim);
            let Some(mut guard) = shared.conns.try_lock() else {
                return false;
            };
            let table = &mut *guard;
            let Some(idx) = table.ready.pop_front(&mut table.pool) else {
                return false;
            };
            match emit_events(table, idx, &mut self.events) {
                Some(n) => Some(n),
                None => {
                    table.ready.push_front(&mut table.pool, idx);
                    None
                }
            }
        };
        match stolen {
            Some(n) => {
                self.counters.steals += 1;
                self.counters.stolen_events += n as u64;
                logger::breadcrumb(
                    BreadcrumbFlags::STEAL,
                    format!("cpu {} stole {} event(s) from cpu {}", self.cpu, n, victim),
                );
                true
            }
            None => false,
        }
    }

    /// No stealable queues: wake one CPU that is sitting in application code
    /// with packets pending, subject to the per-target minimum spacing.
    fn steal_nudge(&mut self) {
        if self.engine.ipi.is_none() {
            return;
        }
        let now = self.engine.now_ns();
        let mut targets: SmallVec<[CpuId; MAX_CPUS]> = SmallVec::new();
        for cpu in 0..self.engine.num_cpus() {
            if cpu == self.cpu {
                continue;
            }
            let shared = self.engine.shared(cpu);
            if shared.in_kernel.load(Ordering::Relaxed) {
                continue;
            }
            let last = shared.last_ipi_ns.load(Ordering::Relaxed);
            if last != 0 && now.saturating_sub(last) < IPI_MIN_SPACING_NS {
                continue;
            }
            if self.engine.dev.rxq_ready(cpu) {
                targets.push(cpu);
            }
        }
        if targets.is_empty() {
            return;
        }
        let target = targets[self.rng.gen_range(0..targets.len())];
        self.send_ipi(target, now);
    }

    /// Rate-limited nudge used by the remote ack dispatch.
    pub(super) fn nudge(&mut self, cpu: CpuId) {
        if self.engine.ipi.is_none() {
            return;
        }
        let shared = self.engine.shared(cpu);
        let now = self.engine.now_ns();
        let last = shared.last_ipi_ns.load(Ordering::Relaxed);
        if last == 0 || now.saturating_sub(last) >= IPI_MIN_SPACING_NS {
            self.send_ipi(cpu, now);
        }
    }

    fn send_ipi(&mut self, cpu: CpuId, now: u64) {
        let Some(ipi) = self.engine.ipi.as_ref() else {
            return;
        };
        self.engine
            .shared(cpu)
            .last_ipi_ns
            .store(now, Ordering::Relaxed);
        ipi.send_ipi(cpu);
        self.counters.ipis_sent += 1;
        logger::breadcrumb(BreadcrumbFlags::IPI, format!("nudged cpu {cpu}"));
    }

    /// Entry point for the embedder's nudge handler. Skips the work when the
    /// CPU is already in the kernel half; always clears the nudge stamp.
    pub fn on_ipi(&mut self, core: &mut dyn TcpCore, user: &dyn crate::usermem::UserMem) {
        let in_kernel = self
            .engine
            .shared(self.cpu)
            .in_kernel
            .load(Ordering::Relaxed);
        if !in_kernel {
            self.bookkeeping(core, user);
            self.pump_ready();
        }
        self.engine
            .shared(self.cpu)
            .last_ipi_ns
            .store(0, Ordering::Relaxed);
    }
}
