//! Application address-space access.
//!
//! Descriptors carry raw addresses into the mapping shared with the
//! application. Every dereference goes through [`UserMem`] so the plane can
//! validate before it reads; the plane itself never fabricates addresses.

use smallvec::SmallVec;

/// Connection identity record: the 4-tuple as the application sees it, ports
/// and addresses in host order. Identity records handed out with `TCP_KNOCK`
/// use this exact layout inside the shared identity pool.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct IpTuple {
    pub src_ip: u32,
    pub dst_ip: u32,
    pub src_port: u16,
    pub dst_port: u16,
}

/// One scatter-gather entry of a `TCP_SENDV` request.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct SgEntry {
    pub base: u64,
    pub len: u64,
}

pub const SG_ENTRY_SIZE: u64 = std::mem::size_of::<SgEntry>() as u64;

/// Scatter-gather lists longer than this are truncated.
pub const MAX_SG_ENTRIES: usize = 32;

pub type SgList = SmallVec<[SgEntry; 8]>;

/// Guarded view of the application's address space.
pub trait UserMem {
    /// Whether `[addr, addr + len)` is readable application memory.
    fn range_ok(&self, addr: u64, len: u64) -> bool;

    /// Read one word; `None` if the address is not readable.
    fn read_u64(&self, addr: u64) -> Option<u64>;

    /// Read a 4-tuple; `None` if the range is not readable.
    fn read_tuple(&self, addr: u64) -> Option<IpTuple>;

    /// Read up to `count` scatter-gather entries after validating the array
    /// range. Entries past [`MAX_SG_ENTRIES`] are dropped.
    fn read_sg(&self, addr: u64, count: usize) -> Option<SgList> {
        if !self.range_ok(addr, count as u64 * SG_ENTRY_SIZE) {
            return None;
        }
        let count = count.min(MAX_SG_ENTRIES);
        let mut list = SgList::with_capacity(count);
        for i in 0..count {
            let entry = addr + i as u64 * SG_ENTRY_SIZE;
            list.push(SgEntry {
                base: self.read_u64(entry)?,
                len: self.read_u64(entry + 8)?,
            });
        }
        Some(list)
    }
}
