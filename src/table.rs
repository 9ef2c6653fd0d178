//! Selective-repeat bookkeeping.
//!
//! The receiver keeps a [`LossTable`]: one bit per packet of the current
//! window, addressed relative to `base`, set once the packet has been applied.
//! On CHECK it reports the dirty span of the table (first through last byte
//! with a missing packet) so the sender only retransmits what was lost.
//!
//! The sender walks the reported bytes with [`LostIds`].

use crate::consts::{MAX_NUM_LOSS_PKTS, RECV_PACKET_TAB_MAX};
use heapless::Vec;

/// Number of packets the loss table can track at once.
pub const TABLE_BITS: usize = RECV_PACKET_TAB_MAX * 8;

/// Outcome of recording a packet in the table.
#[derive(PartialEq, Eq, Clone, Copy, Debug)]
#[cfg_attr(feature = "defmt-0-3", derive(defmt::Format))]
pub enum Mark {
    /// First arrival; the payload should be applied.
    New,
    /// The packet was already received.
    Duplicate,
    /// The packet lies outside the window the table tracks.
    OutOfWindow,
}

/// Reported table bytes, at most [`MAX_NUM_LOSS_PKTS`] long.
pub type ReportBytes = Vec<u8, { MAX_NUM_LOSS_PKTS as usize }>;

/// Answer to a CHECK query.
#[derive(PartialEq, Eq, Clone, Debug)]
pub struct LossReport {
    /// Packet ID of bit 0 of the first reported byte.
    pub update: u16,
    /// Reported table bytes; empty when the whole range arrived.
    pub table: ReportBytes,
}

impl LossReport {
    /// Number of reported bytes, as carried on the wire.
    pub fn length(&self) -> u16 {
        self.table.len() as u16
    }

    /// Whether the checked range arrived in full.
    pub fn is_complete(&self) -> bool {
        self.table.is_empty()
    }
}

/// Receiver-side bitmap of the current window.
#[derive(Clone, Debug)]
pub struct LossTable {
    bits: [u8; RECV_PACKET_TAB_MAX],
    base: u16,
}

impl Default for LossTable {
    fn default() -> Self {
        Self::new()
    }
}

impl LossTable {
    /// An empty table whose window starts at packet 0.
    pub const fn new() -> Self {
        LossTable {
            bits: [0; RECV_PACKET_TAB_MAX],
            base: 0,
        }
    }

    /// Packet ID of bit 0.
    pub fn base(&self) -> u16 {
        self.base
    }

    /// Clears every bit and moves the window to start at `base`.
    pub fn reset(&mut self, base: u16) {
        self.bits.fill(0);
        self.base = base;
    }

    fn index(&self, id: u16) -> Option<usize> {
        let offset = usize::from(id.checked_sub(self.base)?);
        (offset < TABLE_BITS).then_some(offset)
    }

    /// Whether packet `id` has been recorded.
    pub fn is_marked(&self, id: u16) -> bool {
        self.index(id)
            .is_some_and(|i| self.bits[i >> 3] & (1 << (i & 7)) != 0)
    }

    /// Records the arrival of packet `id`.
    pub fn mark(&mut self, id: u16) -> Mark {
        let Some(i) = self.index(id) else {
            return Mark::OutOfWindow;
        };
        let bit = 1 << (i & 7);
        if self.bits[i >> 3] & bit != 0 {
            return Mark::Duplicate;
        }
        self.bits[i >> 3] |= bit;
        Mark::New
    }

    /// Computes the loss report for the packet range `[start, end)`.
    ///
    /// # Arguments
    /// * `start`, `end` - the range the sender just pushed
    /// * `num_of_packet` - packets in the whole frame
    ///
    /// # Returns
    /// * `None` when the range is invalid: empty, reversed, past the end of
    ///   the frame, or wider than the table
    /// * A complete report (`update == end`, no bytes) when every packet
    ///   arrived; the window then moves to start at `end`
    /// * Otherwise the dirty span, starting at the first byte with a missing
    ///   packet and capped at [`MAX_NUM_LOSS_PKTS`] bytes
    ///
    /// # Notes
    /// Bits outside `[start, end)` are reported as received so that the
    /// sender never retransmits packets it has not pushed yet.
    pub fn check_loss(&mut self, start: u16, end: u16, num_of_packet: u16) -> Option<LossReport> {
        if end > num_of_packet || end <= start {
            return None;
        }
        if end <= self.base {
            // range confirmed by an earlier CHECK whose report was lost
            return Some(LossReport {
                update: end,
                table: Vec::new(),
            });
        }
        let first = usize::from(start.max(self.base) - self.base);
        let last = usize::from(end - self.base);
        if last > TABLE_BITS {
            return None;
        }

        let mut dirty: Option<(usize, usize)> = None;
        for byte in (first >> 3)..=((last - 1) >> 3) {
            if self.bits[byte] & range_mask(byte, first, last) != range_mask(byte, first, last) {
                dirty = Some(match dirty {
                    None => (byte, byte),
                    Some((min, _)) => (min, byte),
                });
            }
        }

        match dirty {
            None => {
                self.reset(end);
                Some(LossReport {
                    update: end,
                    table: Vec::new(),
                })
            }
            Some((min, max)) => {
                let span = (max - min + 1).min(usize::from(MAX_NUM_LOSS_PKTS));
                let mut table = ReportBytes::new();
                for byte in min..min + span {
                    let _ = table.push(self.bits[byte] | !range_mask(byte, first, last));
                }
                Some(LossReport {
                    update: self.base + (min as u16) * 8,
                    table,
                })
            }
        }
    }
}

/// Mask of the bits of table byte `byte` that fall in `[first, last)`.
fn range_mask(byte: usize, first: usize, last: usize) -> u8 {
    let lo = (byte * 8).max(first);
    let hi = (byte * 8 + 8).min(last);
    if lo >= hi {
        return 0;
    }
    let width = hi - lo;
    let ones = if width == 8 { 0xff } else { (1u8 << width) - 1 };
    ones << (lo - byte * 8)
}

/// Iterator over the packet IDs a loss report marks as missing.
///
/// IDs at or beyond `limit` are skipped; they are tail padding of the last
/// reported byte.
#[derive(Clone, Debug)]
pub struct LostIds<'a> {
    update: u16,
    table: &'a [u8],
    limit: u16,
    bit: usize,
}

impl<'a> LostIds<'a> {
    /// Walks `table`, whose bit 0 is packet `update`.
    pub fn new(update: u16, table: &'a [u8], limit: u16) -> Self {
        LostIds {
            update,
            table,
            limit,
            bit: 0,
        }
    }
}

impl Iterator for LostIds<'_> {
    type Item = u16;

    fn next(&mut self) -> Option<u16> {
        while self.bit < self.table.len() * 8 {
            let bit = self.bit;
            self.bit += 1;
            if self.table[bit >> 3] & (1 << (bit & 7)) != 0 {
                continue;
            }
            let id = u32::from(self.update) + bit as u32;
            if id >= u32::from(self.limit) {
                continue;
            }
            return Some(id as u16);
        }
        None
    }
}
