//! Error types for the frame codec, the session state machines and the radio
//! packet engine.
//!
//! Only recoverable conditions live here. Invariant violations inside the
//! packet engine (an interrupt source the current state never enabled, a state
//! that requires an active buffer but has none) are programming or hardware
//! faults and panic instead of returning one of these values.

use crate::engine::EngineState;
use thiserror::Error;

/// Failures while encoding or decoding a session command.
#[derive(Error, Debug, PartialEq, Eq, Clone, Copy)]
#[cfg_attr(feature = "defmt-0-3", derive(defmt::Format))]
pub enum FrameError {
    /// The buffer ends before the layout announced by its header.
    #[error("frame too short: need {needed} bytes, have {got}")]
    TooShort {
        /// Bytes required by the layout.
        needed: usize,
        /// Bytes actually available.
        got: usize,
    },
    /// The length byte is smaller than the mandatory trailer.
    #[error("length byte {0} is inconsistent with the frame layout")]
    BadLength(u8),
    /// The encoded command would not fit in one link frame.
    #[error("encoded frame exceeds the link MTU")]
    TooLong,
    /// The command tag bits do not name a known command.
    #[error("unknown command tag {0:#04x}")]
    UnknownCommand(u8),
}

/// Reasons a [`SessionConfig`](crate::session::SessionConfig) or frame cannot
/// be carried by a session.
#[derive(Error, Debug, PartialEq, Eq, Clone, Copy)]
#[cfg_attr(feature = "defmt-0-3", derive(defmt::Format))]
pub enum ConfigError {
    /// A session needs at least one byte to transfer.
    #[error("frame is empty")]
    EmptyFrame,
    /// Frame lengths travel as 16-bit parameters.
    #[error("frame of {0} bytes does not fit a 16-bit length")]
    FrameTooLarge(usize),
    /// Packet payloads must fit in one link frame alongside the command header.
    #[error("packet length {0} is outside 1..=115")]
    PacketLength(u16),
    /// The window must be non-empty and fit in the receiver's loss table.
    #[error("window of {0} packets is outside 1..=2048")]
    WindowSize(u16),
    /// Poll quanta must be non-zero or the timeout never advances.
    #[error("poll interval must be non-zero")]
    ZeroPollInterval,
}

/// Errors that end a session.
///
/// `E` is the error type of the underlying [`Link`](crate::link::Link).
#[derive(Error, Debug, PartialEq, Eq, Clone, Copy)]
#[cfg_attr(feature = "defmt-0-3", derive(defmt::Format))]
pub enum SessionError<E> {
    /// The link transport failed to send or receive a frame.
    #[error("link transport failed: {0:?}")]
    Link(E),
    /// The cumulative timeout ceiling was reached without progress.
    #[error("session timed out after {elapsed_us} us without progress")]
    TimedOut {
        /// Accumulated wait time when the session gave up.
        elapsed_us: u32,
    },
    /// The session parameters cannot be expressed on the wire.
    #[error("invalid session configuration: {0}")]
    InvalidConfig(#[from] ConfigError),
    /// A command could not be encoded.
    #[error("frame codec failure: {0}")]
    Frame(#[from] FrameError),
}

impl<E> SessionError<E> {
    /// Whether this error is the session-fatal cumulative timeout.
    pub fn is_timeout(&self) -> bool {
        matches!(self, SessionError::TimedOut { .. })
    }
}

/// Failures of a register bus transfer.
#[derive(Error, Debug, PartialEq, Eq, Clone, Copy)]
#[cfg_attr(feature = "defmt-0-3", derive(defmt::Format))]
pub enum BusError {
    /// The underlying SPI transfer failed.
    #[error("register bus transfer failed")]
    Transfer,
    /// The requested bank is not one the transceiver exposes.
    #[error("invalid register bank {0}")]
    InvalidBank(u8),
}

/// Status codes returned by the radio packet engine.
#[derive(Error, Debug, PartialEq, Eq, Clone, Copy)]
#[cfg_attr(feature = "defmt-0-3", derive(defmt::Format))]
pub enum EngineError {
    /// The software command is not valid in the current state.
    #[error("command not valid in state {0:?}")]
    InvalidEvent(EngineState),
    /// Peripheral initialisation failed.
    #[error("peripheral initialisation failed")]
    Init,
    /// A register write failed.
    #[error("register write failed: {0}")]
    RegWrite(BusError),
    /// A register read failed.
    #[error("register read failed: {0}")]
    RegRead(BusError),
    /// The one-shot timer could not be armed.
    #[error("timer start failed")]
    TimerStart,
    /// The one-shot timer could not be cancelled.
    #[error("timer stop failed")]
    TimerStop,
    /// Applying the register settings list failed.
    #[error("register setup failed")]
    Setup,
    /// The clock or the VCO calibration never reported ready.
    #[error("transceiver did not become ready")]
    NotReady,
    /// The buffer chain has no room for another buffer.
    #[error("buffer chain is full")]
    ChainFull,
    /// A receive buffer was handed to a transmit command or the reverse.
    #[error("buffer has the wrong role for this command")]
    WrongRole,
    /// The frame does not fit an engine buffer.
    #[error("frame of {0} bytes exceeds the buffer capacity")]
    Oversized(usize),
}

/// Failures while building or parsing an IEEE 802.15.4e MAC header.
#[derive(Error, Debug, PartialEq, Eq, Clone, Copy)]
#[cfg_attr(feature = "defmt-0-3", derive(defmt::Format))]
pub enum MacError {
    /// Only beacon, data and ACK frames of the 2012 (802.15.4e) version are handled.
    #[error("unsupported frame control {0:#06x}")]
    UnsupportedFrame(u16),
    /// Only absent and 16-bit short addresses are handled.
    #[error("unsupported addressing mode in frame control {0:#06x}")]
    AddressingMode(u16),
    /// The PAN identifiers cannot be expressed with the given addresses.
    #[error("invalid PAN id combination")]
    PanIdCombination,
    /// The output buffer cannot hold the header.
    #[error("buffer too small for the MAC header")]
    BufferTooSmall,
    /// The frame ends inside the header.
    #[error("frame ends inside the MAC header")]
    Truncated,
}
