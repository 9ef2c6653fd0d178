//! Register map and register bus of the ML7396 transceiver.
//!
//! Registers are addressed by bank and offset. Banks 8, 9 and 10 are banks
//! 0, 1 and 2 with the extended-access bit set. The [`RegisterBus`] trait is
//! the seam between the packet engine and the wire; [`SpiRegisters`] is the
//! SPI implementation with a cached bank selection.

use crate::error::BusError;
use crate::fmt::trace;
use embedded_hal::spi::SpiDevice;
use heapless::Vec;

/// A register location.
#[derive(PartialEq, Eq, Hash, Clone, Copy, Debug)]
#[cfg_attr(feature = "defmt-0-3", derive(defmt::Format))]
pub struct Register {
    /// Bank number.
    pub bank: u8,
    /// Offset inside the bank.
    pub addr: u8,
}

impl Register {
    /// Register `addr` of `bank`.
    pub const fn new(bank: u8, addr: u8) -> Self {
        Register { bank, addr }
    }
}

/// Reset control.
pub const RST_SET: Register = Register::new(0, 0x01);
/// Clock control, holds the clock-stable and sleep bits.
pub const CLK_SET: Register = Register::new(0, 0x02);
/// Clear channel assessment control and result.
pub const CCA_CNTRL: Register = Register::new(0, 0x15);
/// Interrupt sources, group 1 (three consecutive bytes).
pub const INT_SOURCE_GRP1: Register = Register::new(0, 0x24);
/// Interrupt enables, group 1 (three consecutive bytes).
pub const INT_EN_GRP1: Register = Register::new(0, 0x2a);
/// TX FIFO low-to-high alarm threshold.
pub const TX_ALARM_LH: Register = Register::new(0, 0x35);
/// TX FIFO high-to-low alarm threshold.
pub const TX_ALARM_HL: Register = Register::new(0, 0x36);
/// RX FIFO low-to-high alarm threshold.
pub const RX_ALARM_LH: Register = Register::new(0, 0x37);
/// RX FIFO high-to-low alarm threshold.
pub const RX_ALARM_HL: Register = Register::new(0, 0x38);
/// Packet format options.
pub const PACKET_MODE_SET: Register = Register::new(0, 0x45);
/// FEC and CRC options.
pub const FEC_CRC_SET: Register = Register::new(0, 0x46);
/// Automatic state transitions after TX/RX.
pub const ACK_TIMER_EN: Register = Register::new(0, 0x52);
/// FIFO fill level that starts a transmission.
pub const FAST_TX_SET: Register = Register::new(0, 0x6a);
/// RF state command.
pub const RF_STATUS: Register = Register::new(0, 0x6c);
/// TX FIFO write port.
pub const WR_TX_FIFO: Register = Register::new(0, 0x7e);
/// RX FIFO read port.
pub const RD_RX_FIFO: Register = Register::new(0, 0x7f);
/// VCO calibration trigger.
pub const VCO_CAL_START: Register = Register::new(1, 0x1d);
/// Address filter control.
pub const ADDFIL_CNTRL: Register = Register::new(2, 0x60);
/// PAN id filter, low byte first.
pub const PANID_L: Register = Register::new(2, 0x61);
/// Short address 0 filter, low byte first.
pub const SHT_ADDR0_L: Register = Register::new(2, 0x6b);
/// Short address 1 filter, low byte first.
pub const SHT_ADDR1_L: Register = Register::new(2, 0x6d);
/// Demodulator AFC threshold, touched around CCA.
pub const DEMSET3: Register = Register::new(10, 0x03);
/// Demodulator sync threshold, touched around CCA.
pub const DEMSET14: Register = Register::new(10, 0x0e);

/// Byte-level access to the transceiver's registers.
///
/// Multi-byte transfers address consecutive registers starting at `reg`,
/// except for the FIFO ports which stream.
pub trait RegisterBus {
    /// Writes `data` starting at `reg`.
    fn write(&mut self, reg: Register, data: &[u8]) -> Result<(), BusError>;

    /// Fills `buf` starting at `reg`.
    fn read(&mut self, reg: Register, buf: &mut [u8]) -> Result<(), BusError>;

    /// Forgets any cached bank selection, e.g. after the chip was reset.
    fn resync(&mut self) {}

    /// Writes a single register.
    fn write_byte(&mut self, reg: Register, value: u8) -> Result<(), BusError> {
        self.write(reg, &[value])
    }

    /// Reads a single register.
    fn read_byte(&mut self, reg: Register) -> Result<u8, BusError> {
        let mut buf = [0u8; 1];
        self.read(reg, &mut buf)?;
        Ok(buf[0])
    }
}

impl<B: RegisterBus + ?Sized> RegisterBus for &mut B {
    fn write(&mut self, reg: Register, data: &[u8]) -> Result<(), BusError> {
        (**self).write(reg, data)
    }

    fn read(&mut self, reg: Register, buf: &mut [u8]) -> Result<(), BusError> {
        (**self).read(reg, buf)
    }

    fn resync(&mut self) {
        (**self).resync()
    }
}

/// A group of bits inside one register.
#[derive(PartialEq, Eq, Clone, Copy, Debug)]
#[cfg_attr(feature = "defmt-0-3", derive(defmt::Format))]
pub struct Field {
    /// Register holding the field.
    pub reg: Register,
    /// Bits of the field.
    pub mask: u8,
}

/// `CLK_SET[7]`: the oscillator is stable.
pub const CLOCK_READY: Field = Field {
    reg: CLK_SET,
    mask: 0x80,
};

/// `CLK_SET[5]`: sleep request.
pub const SLEEP: Field = Field {
    reg: CLK_SET,
    mask: 0x20,
};

/// `CCA_CNTRL[1:0]`: result of the last assessment (0 idle, 1 busy).
pub const CCA_RESULT: Field = Field {
    reg: CCA_CNTRL,
    mask: 0x03,
};

impl Field {
    /// The field value, shifted down to bit 0.
    pub fn get<B: RegisterBus + ?Sized>(&self, bus: &mut B) -> Result<u8, BusError> {
        let value = bus.read_byte(self.reg)?;
        Ok((value & self.mask) >> self.mask.trailing_zeros())
    }

    /// Whether any bit of the field is set.
    pub fn is_set<B: RegisterBus + ?Sized>(&self, bus: &mut B) -> Result<bool, BusError> {
        Ok(self.get(bus)? != 0)
    }

    /// Sets every bit of the field, leaving the rest of the register alone.
    pub fn set<B: RegisterBus + ?Sized>(&self, bus: &mut B) -> Result<(), BusError> {
        let value = bus.read_byte(self.reg)?;
        bus.write_byte(self.reg, value | self.mask)
    }

    /// Clears every bit of the field, leaving the rest of the register alone.
    pub fn clear<B: RegisterBus + ?Sized>(&self, bus: &mut B) -> Result<(), BusError> {
        let value = bus.read_byte(self.reg)?;
        bus.write_byte(self.reg, value & !self.mask)
    }
}

/// Longest single register transfer, a full FIFO burst plus the command byte.
const MAX_TRANSFER: usize = 257;

const BANK_SELECT: u8 = 0x00;

/// [`RegisterBus`] over an SPI device.
///
/// Each transfer is one SPI transaction: a command byte
/// (`addr << 1 | write`) followed by data. Bank switches are only issued
/// when the target bank differs from the last one selected.
///
/// # Example
/// ```rust
/// # use embedded_hal_mock::eh1::spi::{Mock, Transaction};
/// use sarlink::engine::regs::{RegisterBus, SpiRegisters, RF_STATUS};
///
/// # let spi = Mock::new(&[
/// #     Transaction::transaction_start(),
/// #     Transaction::write_vec(vec![0x01, 0x00]),
/// #     Transaction::transaction_end(),
/// #     Transaction::transaction_start(),
/// #     Transaction::write_vec(vec![0xd9, 0x06]),
/// #     Transaction::transaction_end(),
/// # ]);
/// let mut regs = SpiRegisters::new(spi);
/// regs.write_byte(RF_STATUS, 0x06).unwrap();
/// # regs.release().done();
/// ```
#[derive(Debug)]
pub struct SpiRegisters<SPI> {
    spi: SPI,
    bank: Option<u8>,
}

impl<SPI: SpiDevice> SpiRegisters<SPI> {
    /// Wraps `spi`. The first access always selects its bank.
    pub fn new(spi: SPI) -> Self {
        SpiRegisters { spi, bank: None }
    }

    /// Returns the SPI device.
    pub fn release(self) -> SPI {
        self.spi
    }

    fn select_bank(&mut self, bank: u8) -> Result<(), BusError> {
        if !matches!(bank, 0..=2 | 8..=10) {
            return Err(BusError::InvalidBank(bank));
        }
        if self.bank == Some(bank) {
            return Ok(());
        }
        let mut value = bank & 0x03;
        if bank > 2 {
            value |= 0x80;
        }
        trace!("regs: select bank {}", bank);
        self.spi
            .write(&[(BANK_SELECT << 1) | 0x01, value])
            .map_err(|_| BusError::Transfer)?;
        self.bank = Some(bank);
        Ok(())
    }
}

impl<SPI: SpiDevice> RegisterBus for SpiRegisters<SPI> {
    fn write(&mut self, reg: Register, data: &[u8]) -> Result<(), BusError> {
        self.select_bank(reg.bank)?;
        let mut frame: Vec<u8, MAX_TRANSFER> = Vec::new();
        frame
            .push((reg.addr << 1) | 0x01)
            .map_err(|_| BusError::Transfer)?;
        frame
            .extend_from_slice(data)
            .map_err(|_| BusError::Transfer)?;
        self.spi.write(&frame).map_err(|_| BusError::Transfer)
    }

    fn read(&mut self, reg: Register, buf: &mut [u8]) -> Result<(), BusError> {
        self.select_bank(reg.bank)?;
        let mut frame: Vec<u8, MAX_TRANSFER> = Vec::new();
        frame.push(reg.addr << 1).map_err(|_| BusError::Transfer)?;
        frame
            .resize(buf.len() + 1, 0xff)
            .map_err(|_| BusError::Transfer)?;
        self.spi
            .transfer_in_place(&mut frame)
            .map_err(|_| BusError::Transfer)?;
        buf.copy_from_slice(&frame[1..]);
        Ok(())
    }

    fn resync(&mut self) {
        self.bank = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use embedded_hal_mock::eh1::spi::{Mock, Transaction};
    use std::vec;

    fn bank(value: u8) -> [Transaction<u8>; 3] {
        [
            Transaction::transaction_start(),
            Transaction::write_vec(vec![0x01, value]),
            Transaction::transaction_end(),
        ]
    }

    #[test]
    fn test_write_selects_bank_once() {
        let mut expectations = vec::Vec::new();
        expectations.extend(bank(0x00));
        expectations.extend([
            Transaction::transaction_start(),
            Transaction::write_vec(vec![0xd9, 0x08]),
            Transaction::transaction_end(),
            Transaction::transaction_start(),
            Transaction::write_vec(vec![0x03, 0x88]),
            Transaction::transaction_end(),
        ]);
        let mut regs = SpiRegisters::new(Mock::new(&expectations));
        regs.write_byte(RF_STATUS, 0x08).unwrap();
        regs.write_byte(RST_SET, 0x88).unwrap();
        regs.release().done();
    }

    #[test]
    fn test_extended_bank_sets_access_bit() {
        let mut expectations = vec::Vec::new();
        expectations.extend(bank(0x82));
        expectations.extend([
            Transaction::transaction_start(),
            Transaction::write_vec(vec![0x07, 0x64]),
            Transaction::transaction_end(),
        ]);
        let mut regs = SpiRegisters::new(Mock::new(&expectations));
        regs.write_byte(DEMSET3, 0x64).unwrap();
        regs.release().done();
    }

    #[test]
    fn test_read_pads_with_ones() {
        let mut expectations = vec::Vec::new();
        expectations.extend(bank(0x00));
        expectations.extend([
            Transaction::transaction_start(),
            Transaction::transfer_in_place(vec![0x48, 0xff, 0xff, 0xff], vec![0x00, 0x04, 0x00, 0x0c]),
            Transaction::transaction_end(),
        ]);
        let mut regs = SpiRegisters::new(Mock::new(&expectations));
        let mut buf = [0u8; 3];
        regs.read(INT_SOURCE_GRP1, &mut buf).unwrap();
        assert_eq!(buf, [0x04, 0x00, 0x0c]);
        regs.release().done();
    }

    #[test]
    fn test_invalid_bank_is_rejected() {
        let mut regs = SpiRegisters::new(Mock::new(&[]));
        assert_eq!(
            regs.write_byte(Register::new(3, 0x00), 0),
            Err(BusError::InvalidBank(3))
        );
        regs.release().done();
    }

    #[test]
    fn test_resync_forces_bank_select() {
        let mut expectations = vec::Vec::new();
        expectations.extend(bank(0x01));
        expectations.extend([
            Transaction::transaction_start(),
            Transaction::write_vec(vec![0x3b, 0x01]),
            Transaction::transaction_end(),
        ]);
        expectations.extend(bank(0x01));
        expectations.extend([
            Transaction::transaction_start(),
            Transaction::write_vec(vec![0x3b, 0x01]),
            Transaction::transaction_end(),
        ]);
        let mut regs = SpiRegisters::new(Mock::new(&expectations));
        regs.write_byte(VCO_CAL_START, 0x01).unwrap();
        regs.resync();
        regs.write_byte(VCO_CAL_START, 0x01).unwrap();
        regs.release().done();
    }

    #[test]
    fn test_field_masks() {
        let mut expectations = vec::Vec::new();
        expectations.extend(bank(0x00));
        expectations.extend([
            Transaction::transaction_start(),
            Transaction::transfer_in_place(vec![0x2a, 0xff], vec![0x00, 0x91]),
            Transaction::transaction_end(),
            Transaction::transaction_start(),
            Transaction::transfer_in_place(vec![0x04, 0xff], vec![0x00, 0x80]),
            Transaction::transaction_end(),
            Transaction::transaction_start(),
            Transaction::write_vec(vec![0x05, 0xa0]),
            Transaction::transaction_end(),
        ]);
        let mut regs = SpiRegisters::new(Mock::new(&expectations));
        assert_eq!(CCA_RESULT.get(&mut regs).unwrap(), 1);
        SLEEP.set(&mut regs).unwrap();
        regs.release().done();
    }
}
