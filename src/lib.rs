//! Per-CPU event plane between an in-process TCP engine and a batched
//! descriptor interface.
//!
//! The plane translates the transport's synchronous callback style into the
//! application's asynchronous request/event protocol: requests arrive in
//! per-CPU descriptor arrays, events leave through per-CPU event rings, and
//! connections are pinned to CPUs by the NIC's flow-group steering. Work for
//! a connection owned elsewhere is routed to its home CPU; idle CPUs may
//! steal ready work from CPUs that are busy in application code.
//!
//! The transport, the NIC, and the application address space are consumed as
//! traits ([`transport::TcpCore`], [`nic::EthDev`], [`usermem::UserMem`]);
//! the embedder drives NIC RX and transport timers around the plane's entry
//! points:
//!
//! ```ignore
//! let engine = Engine::new(config, dev, Some(ipi))?;
//! let mut plane = CpuPlane::new(&engine, cpu, &mut core)?;
//! loop {
//!     // poll NIC RX, run the transport, deliver CoreEvents ...
//!     plane.poll(&mut core, &user, &mut requests);
//!     // hand plane.events() to the application, or:
//!     plane.idle_wait(spin_usecs);
//! }
//! ```

pub mod config;
pub mod desc;
pub mod logger;
pub mod nic;
pub mod transport;
pub mod usermem;

mod plane;

pub use config::Config;
pub use desc::{Descriptor, EventCode, ReqCode, RetCode};
pub use plane::{CpuPlane, Engine, Handle, PlaneCounters};
