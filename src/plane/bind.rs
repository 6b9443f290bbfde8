//! Outbound flow-group binding and local-port selection.
//!
//! A connect must pick a local port whose reverse 4-tuple lands on a flow
//! group this CPU already owns. A flow-director perfect filter is the cheap
//! way out; when the NIC declines, the RSS hash is mirrored in software and
//! the port range probed until a port hashes home.

use super::*;
use crate::config::PORTS_PER_CPU;
use crate::logger::BreadcrumbFlags;
use crate::nic::{outbound_fg, FilterTuple, RssKey};

/// How an outbound connection got tied to this CPU.
pub(super) struct OutboundBinding {
    pub fg: FgId,
    /// Present when a flow-director filter was installed; it must be removed
    /// when the connection dies.
    pub fdir: Option<FilterTuple>,
}

impl CpuPlane {
    /// Choose `id.src_port` and the flow group for an outbound connection.
    /// `None` means no binding is possible; the connect fails with `FAULT`.
    pub(super) fn bind_outbound(&mut self, id: &mut IpTuple) -> Option<OutboundBinding> {
        let dev = Arc::clone(&self.engine.dev);
        if dev.dev_count() > 1 {
            logger::error("outbound connections are not supported on bonded interfaces");
            return None;
        }

        let base = self.cpu as u32 * PORTS_PER_CPU;
        if self.local_port == 0 {
            self.local_port = base;
        }
        self.local_port += 1;
        if self.local_port >= base + PORTS_PER_CPU {
            self.local_port = base + 1;
        }
        id.src_port = self.local_port as u16;

        let filter = FilterTuple::reverse_of(id);
        if dev.fdir_add_perfect_filter(&filter, self.cpu).is_ok() {
            logger::breadcrumb(
                BreadcrumbFlags::BIND,
                format!(
                    "fdir bound {:#x}:{} -> {:#x}:{} on cpu {}",
                    id.src_ip, id.src_port, id.dst_ip, id.dst_port, self.cpu
                ),
            );
            return Some(OutboundBinding {
                fg: outbound_fg(dev.nb_rx_fgs(), self.cpu),
                fdir: Some(filter),
            });
        }

        let key = match dev.rss_key() {
            Ok(key) => key,
            Err(err) => {
                logger::warn(format!("RSS key unavailable: {err}"));
                return None;
            }
        };
        let nb = dev.nb_rx_fgs() as u32;

        for _ in 0..PORTS_PER_CPU {
            if self.local_port >= base + PORTS_PER_CPU {
                self.local_port = base + 1;
            }
            id.src_port = self.local_port as u16;
            let hash = toeplitz_hash(&key, id.dst_ip, id.src_ip, id.dst_port, id.src_port);
            let fg = (hash & (nb - 1)) as FgId;
            if dev.fg_cpu(fg) == Some(self.cpu) {
                logger::breadcrumb(
                    BreadcrumbFlags::BIND,
                    format!("port {} hashes to fg {} on cpu {}", id.src_port, fg, self.cpu),
                );
                return Some(OutboundBinding { fg, fdir: None });
            }
            self.local_port += 1;
        }

        logger::warn(format!(
            "no local port in [{}, {}) hashes to cpu {}",
            base,
            base + PORTS_PER_CPU,
            self.cpu
        ));
        None
    }
}

/// The Toeplitz hash the NIC applies to inbound 4-tuples, mirrored bit for
/// bit: 96 input bits consumed MSB-first against a sliding 32-bit window of
/// the RSS key.
pub(crate) fn toeplitz_hash(
    key: &RssKey,
    src_addr: u32,
    dst_addr: u32,
    src_port: u16,
    dst_port: u16,
) -> u32 {
    let mut input = [0u8; 12];
    input[0..4].copy_from_slice(&src_addr.to_be_bytes());
    input[4..8].copy_from_slice(&dst_addr.to_be_bytes());
    input[8..10].copy_from_slice(&src_port.to_be_bytes());
    input[10..12].copy_from_slice(&dst_port.to_be_bytes());

    let mut window = u32::from_be_bytes([key.0[0], key.0[1], key.0[2], key.0[3]]);
    let mut result = 0u32;
    for (i, byte) in input.iter().enumerate() {
        let mut mask = 0x80u8;
        while mask != 0 {
            if byte & mask != 0 {
                result ^= window;
            }
            window <<= 1;
            if key.0[i + 4] & mask != 0 {
                window |= 1;
            }
            mask >>= 1;
        }
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::nic::RSS_KEY_LEN;

    #[test]
    fn hash_is_deterministic() {
        let mut key = [0u8; RSS_KEY_LEN];
        for (i, byte) in key.iter_mut().enumerate() {
            *byte = (i as u8).wrapping_mul(0x3b).wrapping_add(7);
        }
        let key = RssKey(key);
        let a = toeplitz_hash(&key, 0x0a00_0001, 0xc0a8_0101, 80, 4097);
        let b = toeplitz_hash(&key, 0x0a00_0001, 0xc0a8_0101, 80, 4097);
        assert_eq!(a, b);
        let c = toeplitz_hash(&key, 0x0a00_0001, 0xc0a8_0101, 80, 4098);
        assert_ne!(a, c);
    }

    #[test]
    fn zero_input_hashes_to_zero() {
        let mut key = [0u8; RSS_KEY_LEN];
        key[0] = 0xff;
        let key = RssKey(key);
        assert_eq!(toeplitz_hash(&key, 0, 0, 0, 0), 0);
    }

    #[test]
    fn first_input_bit_selects_initial_key_window() {
        // Key window starts as the first four key bytes; an input whose only
        // set bit is bit 0 XORs exactly that window into the result.
        let mut key = [0u8; RSS_KEY_LEN];
        key[0] = 0x80;
        let key = RssKey(key);
        assert_eq!(toeplitz_hash(&key, 0x8000_0000, 0, 0, 0), 0x8000_0000);
        // One position later the window has shifted the bit out.
        assert_eq!(toeplitz_hash(&key, 0x4000_0000, 0, 0, 0), 0);
    }

    #[test]
    fn key_bits_refill_the_window() {
        // With key byte 4 set, the refill bit reaches the window as it
        // slides; an input bit 32 positions in picks it up at the top.
        let mut key = [0u8; RSS_KEY_LEN];
        key[4] = 0x80;
        let key = RssKey(key);
        // Input bit 32 is the MSB of the second word (dst_addr here).
        assert_eq!(toeplitz_hash(&key, 0, 0x8000_0000, 0, 0), 0x8000_0000);
    }
}
