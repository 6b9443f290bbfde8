//! Consumed TCP-core interface.
//!
//! The in-process TCP engine owns segment processing, retransmission, and
//! congestion control; the plane drives it through [`TcpCore`] and receives
//! its callbacks as [`CoreEvent`]s, always on the CPU that owns the
//! connection's flow group.

use smallvec::SmallVec;
use thiserror::Error;

use crate::nic::FgId;

/// Opaque reference to a core-side protocol control block.
pub type PcbId = u64;

/// Listen backlog installed for every configured port.
pub const LISTEN_BACKLOG: usize = 255;

#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum CoreError {
    #[error("out of memory")]
    Mem,
    #[error("address in use")]
    InUse,
    #[error("no route")]
    Route,
    #[error("connection aborted")]
    Aborted,
    #[error("connection reset")]
    Reset,
    #[error("connection closed")]
    Closed,
    #[error("connection refused")]
    Refused,
    #[error("invalid argument")]
    Arg,
}

impl CoreError {
    /// Errors after which the core-side PCB must no longer be referenced.
    pub fn is_fatal(self) -> bool {
        matches!(self, CoreError::Aborted | CoreError::Reset | CoreError::Closed)
    }
}

/// One received payload segment, already resident in the mapping shared with
/// the application.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PayloadSeg {
    pub iomap: u64,
    pub len: u16,
}

/// An ordered chain of segments delivered by one receive callback. The plane
/// takes ownership; dropping the chain releases the buffers.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct PayloadChain {
    pub segs: SmallVec<[PayloadSeg; 2]>,
}

impl PayloadChain {
    pub fn single(iomap: u64, len: u16) -> Self {
        let mut segs = SmallVec::new();
        segs.push(PayloadSeg { iomap, len });
        Self { segs }
    }

    pub fn total_len(&self) -> usize {
        self.segs.iter().map(|seg| seg.len as usize).sum()
    }
}

/// A core callback, delivered to the owning CPU's plane.
///
/// `ctx` is the word previously registered through
/// [`TcpCore::set_conn_ctx`]; zero means the connection was never linked to a
/// CCB (possible when a reset races the handshake).
#[derive(Clone, Debug)]
pub enum CoreEvent {
    /// A listener completed a handshake on the given flow group.
    Accept { pcb: PcbId, fg: FgId },
    /// Payload arrived, or the peer half closed (`payload` is `None`).
    Recv { ctx: u64, payload: Option<PayloadChain> },
    /// The peer acknowledged `len` bytes.
    Sent { ctx: u64, len: u32 },
    /// An earlier connect attempt resolved.
    Connected { ctx: u64, err: Option<CoreError> },
    /// The connection failed out of band.
    Err { ctx: u64, err: CoreError },
}

/// The call surface the plane uses against the TCP core.
///
/// All calls run on the CPU owning the connection's flow group. `tcp_write`
/// transmits zero-copy out of the caller-owned buffer at `base`; the plane
/// guarantees the buffer stays valid until the matching sent notification.
pub trait TcpCore {
    /// Allocate a connection bound to a flow group. `None` when the core is
    /// out of PCBs.
    fn tcp_new(&mut self, fg: FgId) -> Option<PcbId>;

    fn tcp_bind(&mut self, pcb: PcbId, ip: u32, port: u16) -> Result<(), CoreError>;

    /// Begin a handshake; resolution arrives later as [`CoreEvent::Connected`].
    fn tcp_connect(&mut self, pcb: PcbId, ip: u32, port: u16) -> Result<(), CoreError>;

    fn tcp_write(&mut self, pcb: PcbId, base: u64, len: usize) -> Result<(), CoreError>;

    /// Flush anything queued by prior writes.
    fn tcp_output(&mut self, pcb: PcbId);

    /// Open the receive window by `len` bytes.
    fn tcp_recved(&mut self, pcb: PcbId, len: usize);

    fn tcp_close_with_reset(&mut self, pcb: PcbId);

    fn tcp_abort(&mut self, pcb: PcbId);

    fn tcp_nagle_disable(&mut self, pcb: PcbId);

    /// Register the context word echoed back in every [`CoreEvent`] for this
    /// connection. Zero is reserved for "unset".
    fn set_conn_ctx(&mut self, pcb: PcbId, ctx: u64);

    /// Bytes the core can accept from `tcp_write` right now.
    fn snd_buf(&self, pcb: PcbId) -> usize;

    /// Remote address (host order) and remote port of a connection.
    fn peer(&self, pcb: PcbId) -> (u32, u16);

    /// Local port of a connection.
    fn local_port(&self, pcb: PcbId) -> u16;

    /// Install a listener on every local address for `port`.
    fn listen(&mut self, port: u16, backlog: usize) -> Result<PcbId, CoreError>;
}
