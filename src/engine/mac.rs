//! IEEE 802.15.4e MAC header handling.
//!
//! The engine only deals with beacon, data and ACK frames that use either no
//! address or a 16-bit short address on each side. All multi-byte fields are
//! little-endian on air.
//!
//! An address or PAN id of `0` means "absent"; the frame-control bits for
//! addressing modes, PAN id compression and sequence suppression are derived
//! from which fields are present when a header is written.

use crate::error::MacError;

/// Frame type mask.
pub const FC_TYPE_MASK: u16 = 0x0007;
/// Beacon frame.
pub const FC_TYPE_BEACON: u16 = 0x0000;
/// Data frame.
pub const FC_TYPE_DATA: u16 = 0x0001;
/// Acknowledgement frame.
pub const FC_TYPE_ACK: u16 = 0x0002;
/// The sender wants an acknowledgement.
pub const FC_ACKREQ: u16 = 0x0020;
/// PAN id compression.
pub const FC_PANID_COMPS: u16 = 0x0040;
/// The sequence number is omitted.
pub const FC_SEQ_SUPPRESS: u16 = 0x0100;
/// Destination addressing mode mask.
pub const FC_DAMODE_MASK: u16 = 0x0c00;
/// No destination address.
pub const FC_DAMODE_NONE: u16 = 0x0000;
/// 16-bit destination address.
pub const FC_DAMODE_SHORT: u16 = 0x0800;
/// Frame version mask.
pub const FC_VERSION_MASK: u16 = 0x3000;
/// IEEE 802.15.4e (2012) frame version.
pub const FC_VERSION_E: u16 = 0x2000;
/// Source addressing mode mask.
pub const FC_SAMODE_MASK: u16 = 0xc000;
/// No source address.
pub const FC_SAMODE_NONE: u16 = 0x0000;
/// 16-bit source address.
pub const FC_SAMODE_SHORT: u16 = 0x8000;

/// Marker for an absent address.
pub const ADDR_NONE: u16 = 0x0000;
/// Marker for an absent PAN id.
pub const PANID_NONE: u16 = 0x0000;
/// Broadcast short address and PAN id.
pub const BROADCAST: u16 = 0xffff;

/// Decoded MAC header.
#[derive(PartialEq, Eq, Clone, Copy, Default, Debug)]
#[cfg_attr(feature = "defmt-0-3", derive(defmt::Format))]
pub struct MacHeader {
    /// Frame control.
    pub fc: u16,
    /// Sequence number, `None` when suppressed.
    pub seq: Option<u8>,
    /// Destination PAN id or [`PANID_NONE`].
    pub dst_panid: u16,
    /// Destination short address or [`ADDR_NONE`].
    pub dst_addr: u16,
    /// Source PAN id or [`PANID_NONE`].
    pub src_panid: u16,
    /// Source short address or [`ADDR_NONE`].
    pub src_addr: u16,
}

impl MacHeader {
    /// A data frame header from `src_addr` to `dst_addr` inside `panid`.
    pub fn data(seq: u8, panid: u16, dst_addr: u16, src_addr: u16, ack_request: bool) -> Self {
        let mut fc = FC_VERSION_E | FC_TYPE_DATA;
        if ack_request {
            fc |= FC_ACKREQ;
        }
        MacHeader {
            fc,
            seq: Some(seq),
            dst_panid: panid,
            dst_addr,
            src_panid: PANID_NONE,
            src_addr,
        }
    }

    /// Frame type bits.
    pub fn frame_type(&self) -> u16 {
        self.fc & FC_TYPE_MASK
    }

    /// Whether the ACK request bit is set.
    pub fn ack_requested(&self) -> bool {
        self.fc & FC_ACKREQ != 0
    }

    /// Serializes the header into `out` and returns its length.
    ///
    /// The addressing, compression and suppression bits of `fc` are rewritten
    /// to match the present fields. For an ACK the two addresses are swapped
    /// first, so an ACK built from a received header goes back to its sender.
    ///
    /// # Errors
    /// * [`MacError::UnsupportedFrame`] unless the frame is an 802.15.4e
    ///   beacon, data or ACK frame
    /// * [`MacError::PanIdCombination`] if the PAN ids cannot be expressed
    /// * [`MacError::BufferTooSmall`] if `out` is too short
    pub fn write_into(&mut self, out: &mut [u8]) -> Result<usize, MacError> {
        match self.fc & (FC_VERSION_MASK | FC_TYPE_MASK) {
            v if v == FC_VERSION_E | FC_TYPE_BEACON || v == FC_VERSION_E | FC_TYPE_DATA => {}
            v if v == FC_VERSION_E | FC_TYPE_ACK => {
                core::mem::swap(&mut self.dst_addr, &mut self.src_addr);
            }
            _ => return Err(MacError::UnsupportedFrame(self.fc)),
        }

        let dst_mode = if self.dst_addr == ADDR_NONE {
            FC_DAMODE_NONE
        } else {
            FC_DAMODE_SHORT
        };
        let src_mode = if self.src_addr == ADDR_NONE {
            FC_SAMODE_NONE
        } else {
            FC_SAMODE_SHORT
        };
        let dst_panid = self.dst_panid != PANID_NONE;
        let src_panid = self.src_panid != PANID_NONE;
        let comps = match (dst_mode, src_mode, dst_panid, src_panid) {
            (FC_DAMODE_NONE, FC_SAMODE_NONE, false, false) => 0,
            (FC_DAMODE_NONE, FC_SAMODE_NONE, true, false) => FC_PANID_COMPS,
            (FC_DAMODE_NONE, FC_SAMODE_SHORT, false, false) => FC_PANID_COMPS,
            (FC_DAMODE_NONE, FC_SAMODE_SHORT, false, true) => 0,
            (FC_DAMODE_SHORT, _, false, false) => FC_PANID_COMPS,
            (FC_DAMODE_SHORT, _, true, false) => 0,
            _ => return Err(MacError::PanIdCombination),
        };
        let seq_suppress = if self.seq.is_none() { FC_SEQ_SUPPRESS } else { 0 };

        self.fc &= !(FC_PANID_COMPS | FC_SEQ_SUPPRESS | FC_DAMODE_MASK | FC_SAMODE_MASK);
        self.fc |= dst_mode | src_mode | comps | seq_suppress;

        let mut writer = Writer { out, pos: 0 };
        writer.put(&self.fc.to_le_bytes())?;
        if let Some(seq) = self.seq {
            writer.put(&[seq])?;
        }
        for field in [self.dst_panid, self.dst_addr, self.src_panid, self.src_addr] {
            if field != 0 {
                writer.put(&field.to_le_bytes())?;
            }
        }
        Ok(writer.pos)
    }

    /// Parses the header at the start of `data`.
    ///
    /// # Returns
    /// * The header and the offset of the payload
    ///
    /// # Errors
    /// * [`MacError::Truncated`] if `data` ends inside the header
    /// * [`MacError::UnsupportedFrame`] for other versions or frame types
    /// * [`MacError::AddressingMode`] for extended or LLDN addresses
    pub fn parse(data: &[u8]) -> Result<(MacHeader, usize), MacError> {
        let mut reader = Reader { data, pos: 0 };
        let fc = reader.u16()?;
        match fc & (FC_VERSION_MASK | FC_TYPE_MASK) {
            v if v == FC_VERSION_E | FC_TYPE_BEACON
                || v == FC_VERSION_E | FC_TYPE_DATA
                || v == FC_VERSION_E | FC_TYPE_ACK => {}
            _ => return Err(MacError::UnsupportedFrame(fc)),
        }
        let dst_mode = fc & FC_DAMODE_MASK;
        let src_mode = fc & FC_SAMODE_MASK;
        let comps = fc & FC_PANID_COMPS != 0;

        let seq = if fc & FC_SEQ_SUPPRESS == 0 {
            Some(reader.u8()?)
        } else {
            None
        };
        let dst_panid = if (comps && dst_mode == FC_DAMODE_NONE && src_mode == FC_SAMODE_NONE)
            || (!comps && dst_mode != FC_DAMODE_NONE)
        {
            reader.u16()?
        } else {
            PANID_NONE
        };
        let dst_addr = match dst_mode {
            FC_DAMODE_NONE => ADDR_NONE,
            FC_DAMODE_SHORT => reader.u16()?,
            _ => return Err(MacError::AddressingMode(fc)),
        };
        let src_panid = if !comps && dst_mode == FC_DAMODE_NONE && src_mode != FC_SAMODE_NONE {
            reader.u16()?
        } else {
            PANID_NONE
        };
        let src_addr = match src_mode {
            FC_SAMODE_NONE => ADDR_NONE,
            FC_SAMODE_SHORT => reader.u16()?,
            _ => return Err(MacError::AddressingMode(fc)),
        };

        Ok((
            MacHeader {
                fc,
                seq,
                dst_panid,
                dst_addr,
                src_panid,
                src_addr,
            },
            reader.pos,
        ))
    }
}

struct Writer<'a> {
    out: &'a mut [u8],
    pos: usize,
}

impl Writer<'_> {
    fn put(&mut self, bytes: &[u8]) -> Result<(), MacError> {
        let end = self.pos + bytes.len();
        let Some(dst) = self.out.get_mut(self.pos..end) else {
            return Err(MacError::BufferTooSmall);
        };
        dst.copy_from_slice(bytes);
        self.pos = end;
        Ok(())
    }
}

struct Reader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl Reader<'_> {
    fn u8(&mut self) -> Result<u8, MacError> {
        let value = *self.data.get(self.pos).ok_or(MacError::Truncated)?;
        self.pos += 1;
        Ok(value)
    }

    fn u16(&mut self) -> Result<u16, MacError> {
        let lo = self.u8()?;
        let hi = self.u8()?;
        Ok(u16::from_le_bytes([lo, hi]))
    }
}
