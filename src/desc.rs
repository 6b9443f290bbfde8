//! The 40-byte descriptor ABI shared with the application.
//!
//! Requests flow from the application into the plane, events flow back out.
//! Both directions use the same five-word descriptor; only the code spaces
//! differ.

use std::fmt;

use crate::plane::ccb::CcbRef;

/// One application-visible descriptor slot.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Descriptor {
    pub sysnr: u64,
    pub arga: u64,
    pub argb: u64,
    pub argc: u64,
    pub argd: u64,
}

impl Descriptor {
    pub fn new(sysnr: u64, arga: u64, argb: u64, argc: u64, argd: u64) -> Self {
        Self {
            sysnr,
            arga,
            argb,
            argc,
            argd,
        }
    }

    pub(crate) fn event(code: EventCode, arga: u64, argb: u64, argc: u64, argd: u64) -> Self {
        Self::new(code as u64, arga, argb, argc, argd)
    }

    /// Synchronous return slot: the failing (or succeeding) request code, a
    /// signed result word, and the cookie.
    pub(crate) fn call_ret(req: ReqCode, ret: i64, cookie: u64) -> Self {
        Self::event(EventCode::CallRet, req as u64, ret as u64, cookie, 0)
    }

    pub fn req_code(&self) -> Option<ReqCode> {
        ReqCode::from_sysnr(self.sysnr)
    }

    pub fn event_code(&self) -> Option<EventCode> {
        EventCode::from_sysnr(self.sysnr)
    }

    /// Render this slot as a request, for diagnostics.
    pub fn describe_req(&self) -> String {
        match self.req_code() {
            Some(code) => format_args_of(code.name(), code.arg_count(), self),
            None => format!("REQ?[{}]", self.sysnr),
        }
    }

    /// Render this slot as an event, for diagnostics.
    pub fn describe_event(&self) -> String {
        match self.event_code() {
            Some(code) => format_args_of(code.name(), code.arg_count(), self),
            None => format!("EVENT?[{}]", self.sysnr),
        }
    }
}

fn format_args_of(name: &str, count: usize, d: &Descriptor) -> String {
    match count {
        1 => format!("{}({:#x})", name, d.arga),
        2 => format!("{}({:#x}, {:#x})", name, d.arga, d.argb),
        3 => format!("{}({:#x}, {:#x}, {:#x})", name, d.arga, d.argb, d.argc),
        _ => format!(
            "{}({:#x}, {:#x}, {:#x}, {:#x})",
            name, d.arga, d.argb, d.argc, d.argd
        ),
    }
}

/// Request codes (application to plane).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u64)]
pub enum ReqCode {
    UdpSend = 0,
    UdpSendv = 1,
    UdpRecvDone = 2,
    Connect = 3,
    Accept = 4,
    Reject = 5,
    Send = 6,
    Sendv = 7,
    RecvDone = 8,
    Close = 9,
    Nop = 10,
}

impl ReqCode {
    pub fn from_sysnr(sysnr: u64) -> Option<Self> {
        Some(match sysnr {
            0 => ReqCode::UdpSend,
            1 => ReqCode::UdpSendv,
            2 => ReqCode::UdpRecvDone,
            3 => ReqCode::Connect,
            4 => ReqCode::Accept,
            5 => ReqCode::Reject,
            6 => ReqCode::Send,
            7 => ReqCode::Sendv,
            8 => ReqCode::RecvDone,
            9 => ReqCode::Close,
            10 => ReqCode::Nop,
            _ => return None,
        })
    }

    /// TCP-bearing requests are the plane's to consume; everything else is
    /// passed through to its own sink.
    pub fn is_tcp(self) -> bool {
        matches!(
            self,
            ReqCode::Connect
                | ReqCode::Accept
                | ReqCode::Reject
                | ReqCode::Send
                | ReqCode::Sendv
                | ReqCode::RecvDone
                | ReqCode::Close
        )
    }

    pub fn arg_count(self) -> usize {
        match self {
            ReqCode::UdpSend => 4,
            ReqCode::UdpSendv => 4,
            ReqCode::UdpRecvDone => 1,
            ReqCode::Connect => 2,
            ReqCode::Accept => 2,
            ReqCode::Reject => 1,
            ReqCode::Send => 3,
            ReqCode::Sendv => 3,
            ReqCode::RecvDone => 2,
            ReqCode::Close => 1,
            ReqCode::Nop => 4,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            ReqCode::UdpSend => "UDP_SEND",
            ReqCode::UdpSendv => "UDP_SENDV",
            ReqCode::UdpRecvDone => "UDP_RECV_DONE",
            ReqCode::Connect => "TCP_CONNECT",
            ReqCode::Accept => "TCP_ACCEPT",
            ReqCode::Reject => "TCP_REJECT",
            ReqCode::Send => "TCP_SEND",
            ReqCode::Sendv => "TCP_SENDV",
            ReqCode::RecvDone => "TCP_RECV_DONE",
            ReqCode::Close => "TCP_CLOSE",
            ReqCode::Nop => "NOP",
        }
    }
}

impl fmt::Display for ReqCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Event codes (plane to application).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u64)]
pub enum EventCode {
    UdpRecv = 0,
    UdpSent = 1,
    Connected = 2,
    Knock = 3,
    Recv = 4,
    Sent = 5,
    Dead = 6,
    Timer = 7,
    SendvRet = 8,
    /// Synchronous return channel; carries a request code, not a handle.
    CallRet = 9,
}

impl EventCode {
    pub fn from_sysnr(sysnr: u64) -> Option<Self> {
        Some(match sysnr {
            0 => EventCode::UdpRecv,
            1 => EventCode::UdpSent,
            2 => EventCode::Connected,
            3 => EventCode::Knock,
            4 => EventCode::Recv,
            5 => EventCode::Sent,
            6 => EventCode::Dead,
            7 => EventCode::Timer,
            8 => EventCode::SendvRet,
            9 => EventCode::CallRet,
            _ => return None,
        })
    }

    /// TCP events carry a handle in `arga` and participate in emit-ack
    /// accounting. `CallRet` does not: it has no handle to ack against.
    pub fn is_tcp(self) -> bool {
        matches!(
            self,
            EventCode::Connected
                | EventCode::Knock
                | EventCode::Recv
                | EventCode::Sent
                | EventCode::Dead
                | EventCode::SendvRet
        )
    }

    pub fn arg_count(self) -> usize {
        match self {
            EventCode::UdpRecv => 3,
            EventCode::UdpSent => 1,
            EventCode::Connected => 3,
            EventCode::Knock => 2,
            EventCode::Recv => 4,
            EventCode::Sent => 3,
            EventCode::Dead => 2,
            EventCode::Timer => 1,
            EventCode::SendvRet => 4,
            EventCode::CallRet => 3,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            EventCode::UdpRecv => "UDP_RECV",
            EventCode::UdpSent => "UDP_SENT",
            EventCode::Connected => "TCP_CONNECTED",
            EventCode::Knock => "TCP_KNOCK",
            EventCode::Recv => "TCP_RECV",
            EventCode::Sent => "TCP_SENT",
            EventCode::Dead => "TCP_DEAD",
            EventCode::Timer => "TIMER",
            EventCode::SendvRet => "TCP_SENDV_RET",
            EventCode::CallRet => "CALL_RET",
        }
    }
}

impl fmt::Display for EventCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Interface-level result codes, negative on the wire.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(i64)]
pub enum RetCode {
    Ok = 0,
    BadHandle = 1,
    Closed = 2,
    Fault = 3,
    NoMem = 4,
    ConnRefused = 5,
}

impl RetCode {
    pub fn wire(self) -> i64 {
        -(self as i64)
    }
}

impl fmt::Display for RetCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            RetCode::Ok => "OK",
            RetCode::BadHandle => "BADH",
            RetCode::Closed => "CLOSED",
            RetCode::Fault => "FAULT",
            RetCode::NoMem => "NOMEM",
            RetCode::ConnRefused => "CONNREFUSED",
        };
        f.write_str(name)
    }
}

/// Per-CPU event array handed to the application, plus a kernel-private side
/// array recording which CCB each slot was emitted for. The side array never
/// crosses the application boundary; it lets the emit-ack walk find the
/// originating CCB without trusting handles that may have gone stale.
pub struct EventRing {
    slots: Vec<Descriptor>,
    origins: Vec<Option<CcbRef>>,
    cap: usize,
}

impl EventRing {
    pub fn with_capacity(cap: usize) -> Self {
        Self {
            slots: Vec::with_capacity(cap),
            origins: Vec::with_capacity(cap),
            cap,
        }
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub fn has_room(&self, n: usize) -> bool {
        self.slots.len() + n <= self.cap
    }

    pub fn slots(&self) -> &[Descriptor] {
        &self.slots
    }

    pub(crate) fn origins(&self) -> &[Option<CcbRef>] {
        &self.origins
    }

    pub(crate) fn push(&mut self, desc: Descriptor, origin: Option<CcbRef>) -> bool {
        if self.slots.len() >= self.cap {
            return false;
        }
        self.slots.push(desc);
        self.origins.push(origin);
        true
    }

    pub(crate) fn clear(&mut self) {
        self.slots.clear();
        self.origins.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn req_codes_round_trip() {
        for sysnr in 0..=10 {
            let code = ReqCode::from_sysnr(sysnr).expect("request code");
            assert_eq!(code as u64, sysnr);
        }
        assert!(ReqCode::from_sysnr(11).is_none());
    }

    #[test]
    fn event_codes_round_trip() {
        for sysnr in 0..=9 {
            let code = EventCode::from_sysnr(sysnr).expect("event code");
            assert_eq!(code as u64, sysnr);
        }
        assert!(EventCode::from_sysnr(10).is_none());
    }

    #[test]
    fn tcp_classification_matches_interface() {
        let tcp_reqs = [
            ReqCode::Connect,
            ReqCode::Accept,
            ReqCode::Reject,
            ReqCode::Send,
            ReqCode::Sendv,
            ReqCode::RecvDone,
            ReqCode::Close,
        ];
        for code in tcp_reqs {
            assert!(code.is_tcp());
        }
        assert!(!ReqCode::UdpSend.is_tcp());
        assert!(!ReqCode::Nop.is_tcp());
        assert!(!EventCode::CallRet.is_tcp());
        assert!(EventCode::Knock.is_tcp());
    }

    #[test]
    fn ret_codes_are_negative_on_the_wire() {
        assert_eq!(RetCode::Ok.wire(), 0);
        assert_eq!(RetCode::BadHandle.wire(), -1);
        assert_eq!(RetCode::ConnRefused.wire(), -5);
    }

    #[test]
    fn describe_renders_name_and_args() {
        let desc = Descriptor::new(ReqCode::Close as u64, 0xabc, 0, 0, 0);
        assert_eq!(desc.describe_req(), "TCP_CLOSE(0xabc)");
        let ev = Descriptor::event(EventCode::Knock, 0xabc, 0x1000, 0, 0);
        assert_eq!(ev.describe_event(), "TCP_KNOCK(0xabc, 0x1000)");
    }

    #[test]
    fn ring_rejects_pushes_past_capacity() {
        let mut ring = EventRing::with_capacity(2);
        assert!(ring.push(Descriptor::default(), None));
        assert!(ring.has_room(1));
        assert!(ring.push(Descriptor::default(), None));
        assert!(!ring.push(Descriptor::default(), None));
        assert_eq!(ring.len(), 2);
        ring.clear();
        assert!(ring.is_empty());
    }
}
