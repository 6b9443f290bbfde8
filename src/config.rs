//! Static dataplane configuration shared by every CPU.

use std::net::Ipv4Addr;

use anyhow::{ensure, Result};

/// Listening port installed when the configuration names none.
pub const DEFAULT_PORT: u16 = 8000;

/// Width of each CPU's reserved outbound local-port range.
pub const PORTS_PER_CPU: u32 = 2048;

/// Default capacity of the per-CPU CCB and identity pools.
pub const DEFAULT_POOL_SIZE: usize = 512 * 1024;

/// Default capacity of the per-CPU event ring.
pub const DEFAULT_EVENT_RING_SIZE: usize = 4096;

/// Capacity of the bounded cross-CPU request queue.
pub const REMOTE_QUEUE_CAP: usize = 64;

/// Upper bound on CPUs addressable by the plane.
pub const MAX_CPUS: usize = 64;

#[derive(Clone, Debug)]
pub struct Config {
    /// Local IPv4 address used as the source of outbound connections and
    /// recorded as the destination in inbound identity records.
    pub host_addr: Ipv4Addr,
    /// TCP ports to listen on; empty means [`DEFAULT_PORT`].
    pub ports: Vec<u16>,
    /// Number of dataplane CPUs.
    pub num_cpus: usize,
    /// Capacity of each CPU's CCB pool.
    pub ccb_pool_size: usize,
    /// Capacity of each CPU's identity-record pool.
    pub id_pool_size: usize,
    /// Capacity of each CPU's event ring.
    pub event_ring_size: usize,
    /// Base address of the identity-record mapping shared with the
    /// application. Each CPU's pool occupies a contiguous span above it.
    pub id_iomap_base: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host_addr: Ipv4Addr::UNSPECIFIED,
            ports: Vec::new(),
            num_cpus: 1,
            ccb_pool_size: DEFAULT_POOL_SIZE,
            id_pool_size: DEFAULT_POOL_SIZE,
            event_ring_size: DEFAULT_EVENT_RING_SIZE,
            id_iomap_base: 0x2000_0000_0000,
        }
    }
}

impl Config {
    pub fn validate(&self) -> Result<()> {
        ensure!(self.num_cpus >= 1, "at least one CPU required");
        ensure!(
            self.num_cpus <= MAX_CPUS,
            "num_cpus {} exceeds the {} CPU limit",
            self.num_cpus,
            MAX_CPUS
        );
        ensure!(self.ccb_pool_size >= 1, "CCB pool must hold at least one entry");
        ensure!(
            (self.ccb_pool_size as u64) < (1 << 48),
            "CCB pool index must fit in 48 bits"
        );
        ensure!(self.id_pool_size >= 1, "identity pool must hold at least one entry");
        ensure!(
            self.event_ring_size >= 16,
            "event ring too small to hold a single burst"
        );
        Ok(())
    }

    pub fn host_addr_u32(&self) -> u32 {
        u32::from(self.host_addr)
    }

    /// Listening ports, applying the default when none are configured.
    pub fn listen_ports(&self) -> Vec<u16> {
        if self.ports.is_empty() {
            vec![DEFAULT_PORT]
        } else {
            self.ports.clone()
        }
    }
}
