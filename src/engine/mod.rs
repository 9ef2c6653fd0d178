//! Interrupt-driven packet engine for ML7396-class sub-GHz transceivers.
//!
//! The [`Engine`] owns the register bus, the board services and the buffer
//! chains, and moves frames between them and the chip's 256-byte FIFOs. It
//! is a state machine driven from two directions:
//!
//! - software commands ([`setup`](Engine::setup), [`rx_start`](Engine::rx_start),
//!   [`tx_start`](Engine::tx_start), [`sleep`](Engine::sleep), ...) called
//!   from the main context, and
//! - hardware events delivered by [`handle_interrupt`](Engine::handle_interrupt)
//!   (the chip's interrupt line) and [`handle_timer`](Engine::handle_timer)
//!   (the one-shot timer of the [`Hardware`]).
//!
//! ## States
//!
//! | State     | Enabled events                         | Meaning                               |
//! |-----------|----------------------------------------|---------------------------------------|
//! | `Reset`   | none                                   | not configured                        |
//! | `Idle`    | RX done, FIFO full, CRC error          | receiving if a receive buffer is set  |
//! | `SendAck` | TX done, FIFO empty                    | acknowledging a received frame        |
//! | `Sending` | TX done, FIFO empty, CCA done, timer   | assessing the channel and transmitting|
//! | `WaitAck` | RX done, FIFO full, CRC error, timer   | waiting for the peer's acknowledgement|
//! | `Sleep`   | none                                   | clock stopped                         |
//!
//! Each state switch reprograms the chip's interrupt enables to exactly that
//! state's set. A known event outside the set means the hardware and the
//! engine disagree about what is going on; the engine panics.
//!
//! ## Buffers
//!
//! Buffers are handed over by value and come back through
//! [`take_completed`](Engine::take_completed) once the engine is done with
//! them, with their final [`BufferStatus`]. An optional `fn` callback on the
//! buffer is called at the same moment, from interrupt context.
//!
//! ## Example
//!
//! ```rust,ignore
//! use sarlink::engine::{Buffer, Engine, EngineConfig, RetryPolicy, regs::SpiRegisters};
//!
//! let mut engine = Engine::new(SpiRegisters::new(spi), board, delay, EngineConfig::new(0x1234, 0xabcd));
//! engine.setup()?;
//! engine.rx_start(Buffer::rx(254))?;
//! engine.tx_start(Buffer::tx(&frame, RetryPolicy::new(20, 3), RetryPolicy::new(3, 4))?)?;
//! // from the radio interrupt:
//! engine.handle_interrupt()?;
//! ```

mod buffer;
pub mod hwif;
pub mod mac;
pub mod ops;
pub mod regs;

#[cfg(feature = "timer-isr")]
mod isr;
#[cfg(feature = "timer-isr")]
pub use isr::*;

#[cfg(feature = "timer-isr")]
mod macros;

pub use buffer::{
    ACK_CAPACITY, BUFFER_CAPACITY, Buffer, BufferStatus, DoneCallback, FrameFilter, RetryPolicy,
    Role,
};
pub use hwif::Hardware;

use crate::error::EngineError;
use crate::fmt::{debug, info, trace, warn};
use embedded_hal::delay::DelayNs;
use heapless::Deque;
use mac::{BROADCAST, FC_ACKREQ, FC_TYPE_ACK, FC_TYPE_BEACON, FC_TYPE_DATA, FC_TYPE_MASK, MacHeader};
use ops::FIFO_MARGIN;
use rand::rngs::SmallRng;
use rand::{RngCore, SeedableRng};
use regs::{
    ACK_TIMER_EN, ADDFIL_CNTRL, CCA_RESULT, CLOCK_READY, DEMSET3, DEMSET14, FAST_TX_SET,
    FEC_CRC_SET, PACKET_MODE_SET, PANID_L, RX_ALARM_HL, RX_ALARM_LH, Register, RegisterBus,
    SHT_ADDR0_L, SHT_ADDR1_L, SLEEP, TX_ALARM_HL, TX_ALARM_LH, VCO_CAL_START,
};

/// Hardware event bits, as reported by the interrupt source registers.
///
/// Several bits may be reported at once. TX done, RX done and CRC error
/// each span the two bits of both data rates.
pub mod event {
    /// TX FIFO dropped below its alarm level.
    pub const FIFO_EMPTY: u32 = 0x0000_0010;
    /// RX FIFO rose above its alarm level.
    pub const FIFO_FULL: u32 = 0x0000_0020;
    /// A clear channel assessment finished.
    pub const CCA_DONE: u32 = 0x0000_0100;
    /// A frame was transmitted.
    pub const TX_DONE: u32 = 0x0003_0000;
    /// A frame was received.
    pub const RX_DONE: u32 = 0x000c_0000;
    /// A received frame failed its CRC.
    pub const CRC_ERROR: u32 = 0x0030_0000;
    /// The one-shot timer expired (never reported by the chip itself).
    pub const TIMEOUT: u32 = 0x8000_0000;
    /// VCO calibration finished.
    pub const VCO_CAL_DONE: u32 = 0x0000_0004;
}

use event::{CCA_DONE, CRC_ERROR, FIFO_EMPTY, FIFO_FULL, RX_DONE, TIMEOUT, TX_DONE, VCO_CAL_DONE};

/// Buffers per chain.
pub const CHAIN_LEN: usize = 4;

/// Pause between receiving a frame and sending its acknowledgement.
const ACK_TURNAROUND_US: u32 = 600;

/// Backoff used when the CCA policy has no exponent, or the jitter is zero.
const DEFAULT_BACKOFF_MS: u16 = 100;

/// Polls of the clock-ready and VCO-done bits before giving up.
const READY_POLLS: u32 = 10_000;
const READY_POLL_US: u32 = 10;

/// States of the packet engine.
#[derive(PartialEq, Eq, Clone, Copy, Default, Debug)]
#[cfg_attr(feature = "defmt-0-3", derive(defmt::Format))]
pub enum EngineState {
    /// Not configured; only [`Engine::setup`] is accepted.
    #[default]
    Reset,
    /// Configured; receiving if a receive buffer is registered.
    Idle,
    /// Transmitting the acknowledgement of a received frame.
    SendAck,
    /// Assessing the channel and transmitting a frame.
    Sending,
    /// Waiting for the acknowledgement of a transmitted frame.
    WaitAck,
    /// Clock stopped; only [`Engine::wakeup`] is accepted.
    Sleep,
}

impl EngineState {
    /// Hardware events handled in this state.
    pub const fn enabled(self) -> u32 {
        match self {
            EngineState::Reset | EngineState::Sleep => 0,
            EngineState::Idle => RX_DONE | FIFO_FULL | CRC_ERROR,
            EngineState::SendAck => TX_DONE | FIFO_EMPTY,
            EngineState::Sending => TX_DONE | FIFO_EMPTY | CCA_DONE | TIMEOUT,
            EngineState::WaitAck => RX_DONE | FIFO_FULL | CRC_ERROR | TIMEOUT,
        }
    }
}

/// Identity of this node and the board-specific register values.
#[derive(PartialEq, Eq, Clone, Copy, Default, Debug)]
pub struct EngineConfig {
    /// Own short address.
    pub address: u16,
    /// Own PAN id.
    pub pan_id: u16,
    /// Register values written at every setup, before the engine's own
    /// packet-format settings (channel, data rate, power, ...).
    pub settings: &'static [(Register, u8)],
}

impl EngineConfig {
    /// A configuration without board settings.
    pub const fn new(address: u16, pan_id: u16) -> Self {
        EngineConfig {
            address,
            pan_id,
            settings: &[],
        }
    }
}

#[derive(PartialEq, Eq, Clone, Copy, Default, Debug)]
struct RetryCount {
    ack: u8,
    cca: u8,
}

/// The packet engine.
///
/// # Type Parameters
/// - `R`: the [`RegisterBus`], usually [`SpiRegisters`](regs::SpiRegisters)
/// - `H`: board services, see [`Hardware`]
/// - `D`: a [`DelayNs`] for the short pauses the chip needs
#[derive(Debug)]
pub struct Engine<R, H, D> {
    bus: R,
    hw: H,
    delay: D,
    config: EngineConfig,
    state: EngineState,
    last_seq: Option<u8>,
    rx: Deque<Buffer, CHAIN_LEN>,
    tx: Deque<Buffer, CHAIN_LEN>,
    ack: Buffer,
    ack_header: MacHeader,
    count: RetryCount,
    rng: SmallRng,
    completed: Deque<Buffer, CHAIN_LEN>,
}

impl<R, H, D> Engine<R, H, D>
where
    R: RegisterBus,
    H: Hardware,
    D: DelayNs,
{
    /// An engine in the `Reset` state. Nothing touches the hardware until
    /// [`setup`](Engine::setup).
    pub fn new(bus: R, hw: H, delay: D, config: EngineConfig) -> Self {
        Engine {
            bus,
            hw,
            delay,
            config,
            state: EngineState::Reset,
            last_seq: None,
            rx: Deque::new(),
            tx: Deque::new(),
            ack: Buffer::rx(ACK_CAPACITY),
            ack_header: MacHeader::default(),
            count: RetryCount::default(),
            rng: SmallRng::seed_from_u64(0),
            completed: Deque::new(),
        }
    }

    /// Current state.
    pub fn state(&self) -> EngineState {
        self.state
    }

    /// Own short address.
    pub fn address(&self) -> u16 {
        self.config.address
    }

    /// Own PAN id.
    pub fn pan_id(&self) -> u16 {
        self.config.pan_id
    }

    /// Changes the own short address used by the receive filter.
    pub fn set_address(&mut self, address: u16) {
        self.config.address = address;
    }

    /// Changes the own PAN id.
    pub fn set_pan_id(&mut self, pan_id: u16) {
        self.config.pan_id = pan_id;
    }

    /// The receive buffer frames currently land in.
    pub fn rx_buffer(&self) -> Option<&Buffer> {
        self.rx.front()
    }

    /// The transmit buffer currently being sent.
    pub fn tx_buffer(&self) -> Option<&Buffer> {
        self.tx.front()
    }

    /// Takes the oldest buffer the engine is done with.
    pub fn take_completed(&mut self) -> Option<Buffer> {
        self.completed.pop_front()
    }

    /// Returns the bus, the board services and the delay.
    pub fn release(self) -> (R, H, D) {
        (self.bus, self.hw, self.delay)
    }

    /// Forgets every buffer and returns to `Reset` without touching the
    /// hardware. The address and PAN id are kept.
    ///
    /// Dropped buffers come back through [`take_completed`](Engine::take_completed)
    /// with [`BufferStatus::EStop`].
    pub fn reset(&mut self) {
        self.stop_chains();
        self.state = EngineState::Reset;
        self.last_seq = None;
        self.count = RetryCount::default();
        self.ack.status = BufferStatus::Init;
    }

    /// Brings the transceiver up and enters `Idle`.
    ///
    /// From `Reset` this first initialises the board, waits for the clock
    /// and seeds the backoff jitter. From `Idle` it only reconfigures the
    /// chip; registered buffers are stopped.
    ///
    /// # Errors
    /// * [`EngineError::InvalidEvent`] in any other state
    /// * [`EngineError::Init`] if the board fails to initialise
    /// * [`EngineError::NotReady`] if the clock or the VCO never settles
    /// * [`EngineError::Setup`] if a board setting cannot be written
    pub fn setup(&mut self) -> Result<(), EngineError> {
        match self.state {
            EngineState::Reset => {
                self.hw.init().map_err(|_| EngineError::Init)?;
                self.bus.resync();
                self.wait_clock()?;
                let seed = self.hw.unique_id().map_err(|_| EngineError::Init)?;
                self.rng = SmallRng::seed_from_u64(u64::from(seed));
            }
            EngineState::Idle => {}
            state => return Err(EngineError::InvalidEvent(state)),
        }

        self.switch(EngineState::Reset)?;
        ops::phy_reset(&mut self.bus)?;
        self.stop_chains();

        let settings = self.config.settings;
        for &(reg, value) in settings {
            self.bus
                .write_byte(reg, value)
                .map_err(|_| EngineError::Setup)?;
        }

        // 802.15.4g packets, automatic TX, ED appended to RX data, whitening
        let mode = self.read_reg(PACKET_MODE_SET)?;
        self.write_reg(PACKET_MODE_SET, mode | 0x1e)?;
        // CRC16 on both directions
        let crc = self.read_reg(FEC_CRC_SET)?;
        self.write_reg(FEC_CRC_SET, (crc | 0x0b) & !0x04)?;
        self.write_reg(FAST_TX_SET, (FIFO_MARGIN << 1) as u8)?;
        self.write_reg(ACK_TIMER_EN, 0x20)?;
        self.write_reg(TX_ALARM_LH, FIFO_MARGIN as u8)?;
        self.write_reg(TX_ALARM_HL, FIFO_MARGIN as u8)?;
        self.write_reg(RX_ALARM_LH, (256 - FIFO_MARGIN) as u8)?;
        self.write_reg(RX_ALARM_HL, (256 - FIFO_MARGIN) as u8)?;

        self.write_reg(VCO_CAL_START, 0x01)?;
        let mut polls = 0;
        while ops::interrupt_source(&mut self.bus)? & VCO_CAL_DONE == 0 {
            polls += 1;
            if polls >= READY_POLLS {
                return Err(EngineError::NotReady);
            }
            self.delay.delay_us(READY_POLL_US);
        }
        ops::interrupt_clear(&mut self.bus, VCO_CAL_DONE)?;

        self.switch(EngineState::Idle)?;
        info!("engine: ready as {:#x} in PAN {:#x}", self.config.address, self.config.pan_id);
        Ok(())
    }

    /// Registers a receive buffer and switches the receiver on.
    ///
    /// # Errors
    /// * [`EngineError::InvalidEvent`] outside `Idle` or if a receive buffer
    ///   is already registered (the buffer is dropped)
    /// * [`EngineError::WrongRole`] for a transmit buffer
    pub fn rx_start(&mut self, mut buffer: Buffer) -> Result<(), EngineError> {
        self.require(EngineState::Idle)?;
        if !buffer.is_rx() {
            return Err(EngineError::WrongRole);
        }
        if !self.rx.is_empty() {
            return Err(EngineError::InvalidEvent(self.state));
        }
        buffer.status = BufferStatus::Init;
        let _ = self.rx.push_back(buffer);
        ops::rx_on(&mut self.bus)
    }

    /// Queues another receive buffer behind the registered one.
    ///
    /// # Errors
    /// * [`EngineError::InvalidEvent`] if no receive buffer is registered
    /// * [`EngineError::WrongRole`] for a transmit buffer
    /// * [`EngineError::ChainFull`] if [`CHAIN_LEN`] buffers are queued
    pub fn rx_append(&mut self, mut buffer: Buffer) -> Result<(), EngineError> {
        if !buffer.is_rx() {
            return Err(EngineError::WrongRole);
        }
        if self.rx.is_empty() {
            return Err(EngineError::InvalidEvent(self.state));
        }
        buffer.status = BufferStatus::Init;
        self.rx
            .push_back(buffer)
            .map_err(|_| EngineError::ChainFull)
    }

    /// Switches the receiver off and returns every receive buffer with
    /// [`BufferStatus::EStop`].
    ///
    /// # Errors
    /// * [`EngineError::InvalidEvent`] outside `Idle` or without a receive
    ///   buffer
    pub fn rx_stop(&mut self) -> Result<(), EngineError> {
        self.require(EngineState::Idle)?;
        if self.rx.is_empty() {
            return Err(EngineError::InvalidEvent(self.state));
        }
        ops::trx_off(&mut self.bus)?;
        while let Some(mut rx) = self.rx.pop_front() {
            rx.status = BufferStatus::EStop;
            self.complete(rx);
        }
        Ok(())
    }

    /// Starts sending `buffer`: assesses the channel, transmits, and waits
    /// for an acknowledgement if the frame requests one.
    ///
    /// # Errors
    /// * [`EngineError::InvalidEvent`] outside `Idle`
    /// * [`EngineError::WrongRole`] for a receive buffer
    pub fn tx_start(&mut self, mut buffer: Buffer) -> Result<(), EngineError> {
        self.require(EngineState::Idle)?;
        if buffer.is_rx() {
            return Err(EngineError::WrongRole);
        }
        if !self.rx.is_empty() {
            ops::trx_off(&mut self.bus)?;
        }
        self.count = RetryCount::default();
        buffer.status = BufferStatus::Init;
        let _ = self.tx.push_back(buffer);
        self.switch(EngineState::Sending)?;
        ops::cca_enable(&mut self.bus)?;
        ops::rx_on(&mut self.bus)
    }

    /// Queues another transmit buffer behind the one being sent.
    ///
    /// # Errors
    /// * [`EngineError::InvalidEvent`] if nothing is being sent
    /// * [`EngineError::WrongRole`] for a receive buffer
    /// * [`EngineError::ChainFull`] if [`CHAIN_LEN`] buffers are queued
    pub fn tx_append(&mut self, mut buffer: Buffer) -> Result<(), EngineError> {
        if buffer.is_rx() {
            return Err(EngineError::WrongRole);
        }
        if self.tx.is_empty() {
            return Err(EngineError::InvalidEvent(self.state));
        }
        buffer.status = BufferStatus::Init;
        self.tx
            .push_back(buffer)
            .map_err(|_| EngineError::ChainFull)
    }

    /// Stops the clock. Registered receive buffers stay registered.
    pub fn sleep(&mut self) -> Result<(), EngineError> {
        self.require(EngineState::Idle)?;
        if !self.rx.is_empty() {
            ops::trx_off(&mut self.bus)?;
        }
        self.switch(EngineState::Sleep)?;
        SLEEP.set(&mut self.bus).map_err(EngineError::RegWrite)
    }

    /// Restarts the clock and resumes receiving if a buffer is registered.
    pub fn wakeup(&mut self) -> Result<(), EngineError> {
        self.require(EngineState::Sleep)?;
        SLEEP.clear(&mut self.bus).map_err(EngineError::RegWrite)?;
        self.wait_clock()?;
        self.switch(EngineState::Idle)?;
        if !self.rx.is_empty() {
            ops::rx_on(&mut self.bus)?;
        }
        Ok(())
    }

    /// Programs the chip's hardware address filter: frames must carry
    /// `pan_id` and one of the two short addresses.
    pub fn set_address_filter(
        &mut self,
        pan_id: u16,
        addr0: u16,
        addr1: u16,
    ) -> Result<(), EngineError> {
        self.write_reg(ADDFIL_CNTRL, 0x1a)?;
        for (reg, value) in [(PANID_L, pan_id), (SHT_ADDR0_L, addr0), (SHT_ADDR1_L, addr1)] {
            self.bus
                .write(reg, &value.to_le_bytes())
                .map_err(EngineError::RegWrite)?;
        }
        Ok(())
    }

    /// Handles the transceiver's interrupt line.
    ///
    /// Reads the pending sources, runs the handlers of the current state and
    /// clears what was handled.
    ///
    /// # Panics
    /// If a TX done, RX done, CRC or CCA event arrives that the current
    /// state never enabled, or a handler finds no buffer where its state
    /// requires one.
    pub fn handle_interrupt(&mut self) -> Result<(), EngineError> {
        let events = ops::interrupt_source(&mut self.bus)?;
        let state = self.state;
        let unexpected = events & (TX_DONE | RX_DONE | CRC_ERROR | CCA_DONE) & !state.enabled();
        if unexpected != 0 {
            panic!(
                "engine: interrupt sources {:#x} are not enabled in state {:?}",
                unexpected, state
            );
        }
        trace!("engine: events {:#x} in {:?}", events, state);
        let mut done = 0;
        let result = self.dispatch(state, events, &mut done);
        let cleared = ops::interrupt_clear(&mut self.bus, done);
        result.and(cleared)
    }

    /// Handles expiry of the one-shot timer.
    ///
    /// # Panics
    /// If the current state never arms the timer.
    pub fn handle_timer(&mut self) -> Result<(), EngineError> {
        let state = self.state;
        if state.enabled() & TIMEOUT == 0 {
            panic!("engine: timer expired in state {:?}", state);
        }
        let mut done = 0;
        self.dispatch(state, TIMEOUT, &mut done)
    }

    fn dispatch(&mut self, state: EngineState, events: u32, done: &mut u32) -> Result<(), EngineError> {
        match state {
            EngineState::Idle => {
                let ev = events & (RX_DONE | FIFO_FULL | CRC_ERROR);
                if ev != 0 {
                    // a CRC error also flushes the RX FIFO
                    *done |= ev | FIFO_EMPTY | (ev & CRC_ERROR) >> 14;
                    self.data_recv(ev)?;
                }
            }
            EngineState::SendAck => {
                let ev = events & FIFO_EMPTY;
                if ev != 0 {
                    *done |= ev | FIFO_FULL;
                    ops::tx_continue(&mut self.bus, &mut self.delay, &mut self.ack)?;
                }
                let ev = events & TX_DONE;
                if ev != 0 {
                    *done |= ev;
                    self.ack_done()?;
                }
            }
            EngineState::Sending => {
                let ev = events & CCA_DONE;
                if ev != 0 {
                    *done |= ev;
                    self.cca_done()?;
                }
                let ev = events & TIMEOUT;
                if ev != 0 {
                    *done |= ev;
                    self.cca_timeout()?;
                }
                let ev = events & FIFO_EMPTY;
                if ev != 0 {
                    *done |= ev | FIFO_FULL;
                    let Some(tx) = self.tx.front_mut() else {
                        panic!("engine: FIFO empty while sending without a transmit buffer");
                    };
                    ops::tx_continue(&mut self.bus, &mut self.delay, tx)?;
                }
                let ev = events & TX_DONE;
                if ev != 0 {
                    *done |= ev;
                    self.data_done()?;
                }
            }
            EngineState::WaitAck => {
                let ev = events & (RX_DONE | FIFO_FULL | CRC_ERROR);
                if ev != 0 {
                    *done |= ev | FIFO_EMPTY | (ev & CRC_ERROR) >> 14;
                    self.ack_recv(ev)?;
                }
                let ev = events & TIMEOUT;
                if ev != 0 {
                    *done |= ev;
                    self.ack_timeout()?;
                }
            }
            EngineState::Reset | EngineState::Sleep => {}
        }
        Ok(())
    }

    fn data_recv(&mut self, events: u32) -> Result<(), EngineError> {
        let Some(rx) = self.rx.front_mut() else {
            panic!("engine: receive event without a receive buffer");
        };
        if rx.status == BufferStatus::Init {
            ops::rx_header(&mut self.bus, rx)?;
            if rx.status.is_error() {
                warn!("engine: received frame of invalid size {}", rx.size);
                ops::phy_reset(&mut self.bus)?;
                return self.next_rx(true);
            }
        }
        if events & CRC_ERROR != 0 {
            debug!("engine: CRC error");
            rx.status = BufferStatus::ECrc;
            return self.next_rx(false);
        }
        ops::rx_continue(&mut self.bus, rx)?;
        if events & RX_DONE == 0 {
            return Ok(());
        }
        rx.ed = ops::rx_done(&mut self.bus)?;

        let address = self.config.address;
        let Some(mut header) = accept_frame(rx, address) else {
            trace!("engine: frame dropped by filter");
            rx.status = BufferStatus::Init;
            return Ok(());
        };
        if !(header.ack_requested() && header.dst_addr == address) {
            return self.next_rx(false);
        }

        header.fc &= !(FC_TYPE_MASK | FC_ACKREQ);
        header.fc |= FC_TYPE_ACK;
        let capacity = usize::from(self.ack.capacity);
        let Ok(len) = header.write_into(&mut self.ack.data[..capacity]) else {
            return self.next_rx(false);
        };
        self.ack.size = len as u16;
        self.ack.status = BufferStatus::Init;
        self.ack_header = header;
        ops::tx_header(&mut self.bus, &mut self.ack)?;
        if self.ack.status.is_error() {
            return self.next_rx(false);
        }
        self.switch(EngineState::SendAck)?;
        self.delay.delay_us(ACK_TURNAROUND_US);
        ops::tx_continue(&mut self.bus, &mut self.delay, &mut self.ack)
    }

    fn ack_done(&mut self) -> Result<(), EngineError> {
        let Some(mut rx) = self.rx.pop_front() else {
            panic!("engine: acknowledgement sent without a receive buffer");
        };
        let seq = self.ack_header.seq;
        if seq.is_some() && seq == self.last_seq {
            debug!("engine: duplicate sequence number, frame not delivered");
            rx.status = BufferStatus::Init;
            let _ = self.rx.push_front(rx);
        } else {
            self.complete(rx);
            if let Some(next) = self.rx.front_mut() {
                next.status = BufferStatus::Init;
            }
        }
        self.last_seq = seq;

        self.switch(EngineState::Idle)?;
        if !self.rx.is_empty() {
            ops::rx_on(&mut self.bus)?;
        }
        Ok(())
    }

    fn cca_done(&mut self) -> Result<(), EngineError> {
        if self.tx.is_empty() {
            panic!("engine: CCA finished without a transmit buffer");
        }
        ops::trx_off(&mut self.bus)?;
        let result = CCA_RESULT.get(&mut self.bus).map_err(EngineError::RegRead)?;
        self.write_reg(DEMSET3, 0x64)?;
        self.write_reg(DEMSET14, 0x27)?;

        match result {
            0 => {
                let Some(tx) = self.tx.front_mut() else {
                    panic!("engine: CCA finished without a transmit buffer");
                };
                if tx.status != BufferStatus::Init {
                    panic!("engine: channel clear for a buffer already in flight");
                }
                ops::tx_header(&mut self.bus, tx)?;
                if tx.status.is_error() {
                    return self.abort_tx(BufferStatus::ESize);
                }
                ops::tx_continue(&mut self.bus, &mut self.delay, tx)
            }
            1 => {
                let (_, cca) = self.tx.front().map(Buffer::policies).unwrap_or_default();
                if self.count.cca < cca.retry {
                    self.count.cca += 1;
                    let wait = self.backoff(cca.wait);
                    debug!("engine: channel busy, retry {} in {} ms", self.count.cca, wait);
                    self.hw.timer_start(wait).map_err(|_| EngineError::TimerStart)
                } else {
                    warn!("engine: channel busy, giving up");
                    self.abort_tx(BufferStatus::ECca)
                }
            }
            other => panic!("engine: invalid CCA result {}", other),
        }
    }

    fn cca_timeout(&mut self) -> Result<(), EngineError> {
        if self.tx.is_empty() {
            panic!("engine: CCA backoff expired without a transmit buffer");
        }
        self.hw.timer_stop().map_err(|_| EngineError::TimerStop)?;
        ops::trx_off(&mut self.bus)?;
        ops::cca_enable(&mut self.bus)?;
        ops::rx_on(&mut self.bus)
    }

    fn data_done(&mut self) -> Result<(), EngineError> {
        let Some(tx) = self.tx.front_mut() else {
            panic!("engine: transmission finished without a transmit buffer");
        };
        tx.ed = 0;
        let wait_ack = MacHeader::parse(tx.data())
            .ok()
            .map(|(header, _)| header)
            .filter(MacHeader::ack_requested);
        let Some(header) = wait_ack else {
            return self.next_tx();
        };
        let (ack, _) = tx.policies();
        self.ack_header = header;
        self.ack.status = BufferStatus::Init;
        self.switch(EngineState::WaitAck)?;
        self.hw
            .timer_start(ack.wait)
            .map_err(|_| EngineError::TimerStart)?;
        ops::rx_on(&mut self.bus)
    }

    fn ack_recv(&mut self, events: u32) -> Result<(), EngineError> {
        if self.ack.status == BufferStatus::Init {
            ops::rx_header(&mut self.bus, &mut self.ack)?;
            if self.ack.status.is_error() {
                ops::phy_reset(&mut self.bus)?;
                self.ack.status = BufferStatus::Init;
                return ops::rx_on(&mut self.bus);
            }
        }
        if events & CRC_ERROR != 0 {
            self.ack.status = BufferStatus::Init;
            return Ok(());
        }
        ops::rx_continue(&mut self.bus, &mut self.ack)?;
        if events & RX_DONE == 0 {
            return Ok(());
        }
        let ed = ops::rx_done(&mut self.bus)?;
        let Some(tx) = self.tx.front_mut() else {
            panic!("engine: acknowledgement received without a transmit buffer");
        };
        tx.ed = ed;

        if !self.is_expected_ack() {
            trace!("engine: not the acknowledgement we wait for");
            self.ack.status = BufferStatus::Init;
            return Ok(());
        }
        self.hw.timer_stop().map_err(|_| EngineError::TimerStop)?;
        ops::trx_off(&mut self.bus)?;
        self.next_tx()
    }

    fn ack_timeout(&mut self) -> Result<(), EngineError> {
        let Some(tx) = self.tx.front_mut() else {
            panic!("engine: acknowledgement timeout without a transmit buffer");
        };
        ops::trx_off(&mut self.bus)?;
        let (ack, _) = tx.policies();
        if self.count.ack < ack.retry {
            tx.status = BufferStatus::Init;
            self.count.ack += 1;
            self.count.cca = 0;
            debug!("engine: no acknowledgement, retry {}", self.count.ack);
            self.switch(EngineState::Sending)?;
            ops::cca_enable(&mut self.bus)?;
            ops::rx_on(&mut self.bus)
        } else {
            warn!("engine: no acknowledgement, giving up");
            self.hw.timer_stop().map_err(|_| EngineError::TimerStop)?;
            self.abort_tx(BufferStatus::ERetry)
        }
    }

    fn is_expected_ack(&self) -> bool {
        let Ok((header, _)) = MacHeader::parse(self.ack.data()) else {
            return false;
        };
        header.frame_type() == FC_TYPE_ACK
            && header.seq == self.ack_header.seq
            && header.dst_panid == self.ack_header.dst_panid
            && header.dst_addr == self.ack_header.src_addr
    }

    /// Completes the front receive buffer and readies the next one.
    ///
    /// With `restart` the receiver is switched back on for the next buffer;
    /// otherwise it is switched off when the chain runs dry.
    fn next_rx(&mut self, restart: bool) -> Result<(), EngineError> {
        if let Some(rx) = self.rx.pop_front() {
            self.complete(rx);
        }
        match self.rx.front_mut() {
            Some(next) => {
                next.status = BufferStatus::Init;
                if restart {
                    ops::rx_on(&mut self.bus)?;
                }
            }
            None if !restart => ops::trx_off(&mut self.bus)?,
            None => {}
        }
        Ok(())
    }

    /// Completes the front transmit buffer and starts the next one, or
    /// returns to `Idle`.
    fn next_tx(&mut self) -> Result<(), EngineError> {
        if let Some(tx) = self.tx.pop_front() {
            self.complete(tx);
        }
        if let Some(next) = self.tx.front_mut() {
            next.status = BufferStatus::Init;
            self.count = RetryCount::default();
            self.switch(EngineState::Sending)?;
            ops::cca_enable(&mut self.bus)?;
            return ops::rx_on(&mut self.bus);
        }
        self.switch(EngineState::Idle)?;
        if !self.rx.is_empty() {
            ops::rx_on(&mut self.bus)?;
        }
        Ok(())
    }

    /// Fails the front transmit buffer with `status`; the rest of the chain
    /// is returned unsent.
    fn abort_tx(&mut self, status: BufferStatus) -> Result<(), EngineError> {
        if let Some(mut tx) = self.tx.pop_front() {
            tx.status = status;
            self.complete(tx);
        }
        while let Some(rest) = self.tx.pop_front() {
            self.complete(rest);
        }
        self.switch(EngineState::Idle)?;
        if !self.rx.is_empty() {
            ops::rx_on(&mut self.bus)?;
        }
        Ok(())
    }

    fn stop_chains(&mut self) {
        while let Some(mut buffer) = self.rx.pop_front().or_else(|| self.tx.pop_front()) {
            buffer.status = BufferStatus::EStop;
            self.complete(buffer);
        }
    }

    fn complete(&mut self, buffer: Buffer) {
        buffer.notify();
        if self.completed.is_full() {
            warn!("engine: completion queue full, dropping the oldest buffer");
            let _ = self.completed.pop_front();
        }
        let _ = self.completed.push_back(buffer);
    }

    fn backoff(&mut self, exponent: u16) -> u16 {
        if exponent == 0 {
            return DEFAULT_BACKOFF_MS;
        }
        let jitter = self.rng.next_u32() & 0x0f;
        match jitter.checked_shl(u32::from(exponent)).unwrap_or(0) as u16 {
            0 => DEFAULT_BACKOFF_MS,
            wait => wait,
        }
    }

    fn switch(&mut self, state: EngineState) -> Result<(), EngineError> {
        if state != self.state {
            trace!("engine: {:?} -> {:?}", self.state, state);
        }
        self.state = state;
        ops::interrupt_enable(&mut self.bus, state.enabled())
    }

    fn require(&self, state: EngineState) -> Result<(), EngineError> {
        if self.state == state {
            Ok(())
        } else {
            Err(EngineError::InvalidEvent(self.state))
        }
    }

    fn wait_clock(&mut self) -> Result<(), EngineError> {
        for _ in 0..READY_POLLS {
            if CLOCK_READY
                .is_set(&mut self.bus)
                .map_err(EngineError::RegRead)?
            {
                return Ok(());
            }
            self.delay.delay_us(READY_POLL_US);
        }
        Err(EngineError::NotReady)
    }

    fn read_reg(&mut self, reg: Register) -> Result<u8, EngineError> {
        self.bus.read_byte(reg).map_err(EngineError::RegRead)
    }

    fn write_reg(&mut self, reg: Register, value: u8) -> Result<(), EngineError> {
        self.bus.write_byte(reg, value).map_err(EngineError::RegWrite)
    }
}

/// Decides whether a received frame is delivered: it must parse, be a
/// beacon or data frame addressed to `address` (or broadcast in the
/// broadcast PAN), and pass the buffer's filter.
fn accept_frame(rx: &Buffer, address: u16) -> Option<MacHeader> {
    let (header, _) = MacHeader::parse(rx.data()).ok()?;
    let broadcast = header.dst_addr == BROADCAST && header.dst_panid == BROADCAST;
    if header.dst_addr != address && !broadcast {
        return None;
    }
    if !matches!(header.frame_type(), FC_TYPE_BEACON | FC_TYPE_DATA) {
        return None;
    }
    match rx.filter() {
        Some(filter) if !filter(&header) => None,
        _ => Some(header),
    }
}
