//! Register sequences used by the packet engine.
//!
//! FIFO transfers are paced by the alarm thresholds programmed at setup: the
//! engine never moves more than `256 - FIFO_MARGIN` bytes per interrupt.
//! Receiving reads one byte less than that while more data is pending, so
//! the FIFO is never drained completely mid-frame.

use super::buffer::{Buffer, BufferStatus};
use super::regs::{
    CCA_CNTRL, DEMSET3, DEMSET14, INT_EN_GRP1, INT_SOURCE_GRP1, RD_RX_FIFO, RF_STATUS, RST_SET,
    Register, RegisterBus, WR_TX_FIFO,
};
use crate::error::EngineError;
use crate::fmt::trace;
use embedded_hal::delay::DelayNs;

/// Headroom kept in the 256-byte FIFOs.
pub const FIFO_MARGIN: u16 = 32;

/// CRC bytes the PHY appends to every frame.
pub const CRC_LEN: u16 = 2;

/// Pause after each TX FIFO burst.
const TX_BURST_DELAY_US: u32 = 300;

const RF_TRX_OFF: u8 = 0x08;
const RF_RX_ON: u8 = 0x06;
const RF_FORCE_TRX_OFF: u8 = 0x03;
const PHY_RESET: u8 = 0x88;
const CCA_ENABLE: u8 = 0x10;
const PHR_CRC16_WHITENING: u16 = 0x1800;

fn write<R: RegisterBus>(bus: &mut R, reg: Register, data: &[u8]) -> Result<(), EngineError> {
    bus.write(reg, data).map_err(EngineError::RegWrite)
}

fn read<R: RegisterBus>(bus: &mut R, reg: Register, buf: &mut [u8]) -> Result<(), EngineError> {
    bus.read(reg, buf).map_err(EngineError::RegRead)
}

/// Forces the PHY back to a known state.
pub fn phy_reset<R: RegisterBus>(bus: &mut R) -> Result<(), EngineError> {
    write(bus, RF_STATUS, &[RF_FORCE_TRX_OFF])?;
    write(bus, RST_SET, &[PHY_RESET])
}

/// Switches the transceiver off.
pub fn trx_off<R: RegisterBus>(bus: &mut R) -> Result<(), EngineError> {
    write(bus, RF_STATUS, &[RF_TRX_OFF])
}

/// Switches the receiver on.
pub fn rx_on<R: RegisterBus>(bus: &mut R) -> Result<(), EngineError> {
    write(bus, RF_STATUS, &[RF_RX_ON])
}

/// Arms a clear channel assessment; it runs once the receiver is on.
pub fn cca_enable<R: RegisterBus>(bus: &mut R) -> Result<(), EngineError> {
    write(bus, DEMSET3, &[0x00])?;
    write(bus, DEMSET14, &[0x00])?;
    write(bus, CCA_CNTRL, &[CCA_ENABLE])
}

/// Pending interrupt sources, group 1 to 3 as one little-endian word.
pub fn interrupt_source<R: RegisterBus>(bus: &mut R) -> Result<u32, EngineError> {
    let mut raw = [0u8; 3];
    read(bus, INT_SOURCE_GRP1, &mut raw)?;
    Ok(u32::from_le_bytes([raw[0], raw[1], raw[2], 0]))
}

/// Enables exactly the interrupt sources in `mask` and clears them.
///
/// The two top bits of group 1 are always enabled; they gate the FIFO
/// clear logic.
pub fn interrupt_enable<R: RegisterBus>(bus: &mut R, mask: u32) -> Result<(), EngineError> {
    let [b0, b1, b2, _] = mask.to_le_bytes();
    let raw = [b0 | 0xc0, b1, b2];
    write(bus, INT_SOURCE_GRP1, &raw)?;
    write(bus, INT_EN_GRP1, &raw)
}

/// Clears the interrupt sources in `done`.
pub fn interrupt_clear<R: RegisterBus>(bus: &mut R, done: u32) -> Result<(), EngineError> {
    if done == 0 {
        return Ok(());
    }
    let [b0, b1, b2, _] = (!done).to_le_bytes();
    write(bus, INT_SOURCE_GRP1, &[b0, b1, b2])
}

/// Reads the PHY header of an incoming frame into `buffer`.
///
/// Sets [`BufferStatus::ESize`] if the length is shorter than the CRC or
/// longer than the buffer, `Progress(0)` otherwise.
pub fn rx_header<R: RegisterBus>(bus: &mut R, buffer: &mut Buffer) -> Result<(), EngineError> {
    let mut phr = [0u8; 2];
    read(bus, RD_RX_FIFO, &mut phr)?;
    let length = u16::from_be_bytes(phr) & 0x07ff;
    if length < CRC_LEN {
        buffer.size = 0;
        buffer.status = BufferStatus::ESize;
    } else {
        buffer.size = length - CRC_LEN;
        buffer.status = if buffer.size > buffer.capacity {
            BufferStatus::ESize
        } else {
            BufferStatus::Progress(0)
        };
    }
    trace!("engine: rx header, {} bytes", buffer.size);
    Ok(())
}

/// Reads the next chunk of frame data, leaving CRC and ED in the FIFO.
pub fn rx_continue<R: RegisterBus>(bus: &mut R, buffer: &mut Buffer) -> Result<(), EngineError> {
    let done = buffer.processed();
    let remaining = buffer.size - done;
    let burst = 256 - FIFO_MARGIN;
    let chunk = if remaining <= burst { remaining } else { burst - 1 };
    if chunk > 0 {
        let start = usize::from(done);
        read(bus, RD_RX_FIFO, &mut buffer.data[start..start + usize::from(chunk)])?;
        buffer.status = BufferStatus::Progress(done + chunk);
    }
    Ok(())
}

/// Discards the CRC and returns the energy detection value that follows it.
pub fn rx_done<R: RegisterBus>(bus: &mut R) -> Result<u8, EngineError> {
    let mut crc = [0u8; CRC_LEN as usize];
    read(bus, RD_RX_FIFO, &mut crc)?;
    let mut ed = [0u8; 1];
    read(bus, RD_RX_FIFO, &mut ed)?;
    Ok(ed[0])
}

/// Writes the PHY header of an outgoing frame.
///
/// Sets [`BufferStatus::ESize`] if the frame exceeds the buffer capacity,
/// `Progress(0)` otherwise.
pub fn tx_header<R: RegisterBus>(bus: &mut R, buffer: &mut Buffer) -> Result<(), EngineError> {
    if buffer.size > buffer.capacity {
        buffer.status = BufferStatus::ESize;
        return Ok(());
    }
    let phr = ((buffer.size + CRC_LEN) | PHR_CRC16_WHITENING).to_be_bytes();
    write(bus, WR_TX_FIFO, &phr)?;
    buffer.status = BufferStatus::Progress(0);
    Ok(())
}

/// Writes the next chunk of frame data.
pub fn tx_continue<R: RegisterBus, D: DelayNs>(
    bus: &mut R,
    delay: &mut D,
    buffer: &mut Buffer,
) -> Result<(), EngineError> {
    let done = buffer.processed();
    let chunk = (buffer.size - done).min(256 - FIFO_MARGIN);
    if chunk > 0 {
        let start = usize::from(done);
        write(bus, WR_TX_FIFO, &buffer.data[start..start + usize::from(chunk)])?;
        buffer.status = BufferStatus::Progress(done + chunk);
        delay.delay_us(TX_BURST_DELAY_US);
    }
    Ok(())
}
