//! Chunked transfers of buffers larger than one session frame.
//!
//! A session carries at most 65535 bytes. [`send_buffer`] splits a larger
//! buffer into `chunk_size` pieces and runs one [`Sender`] session per piece;
//! [`receive_buffer`] runs one [`Receiver`] session per piece and writes each
//! chunk behind the previous one. A chunk shorter than `chunk_size` (or a full
//! output buffer) marks the end of the transfer.
//!
//! After the last chunk nothing follows that would prove to the receiver that
//! its final END acknowledgement arrived, so the receiver repeats it a few
//! times before returning.

use crate::consts::{END_ACK_REPEATS, END_ACK_SPACING_US, FRAME_SIZE};
use crate::error::{ConfigError, SessionError};
use crate::fmt::{info, warn};
use crate::link::Link;
use crate::session::{Diagnostics, Receiver, Sender, SessionConfig};
use embedded_hal::delay::DelayNs;

/// Parameters of a chunked transfer.
#[derive(PartialEq, Eq, Clone, Copy, Debug)]
#[cfg_attr(feature = "defmt-0-3", derive(defmt::Format))]
pub struct TransferConfig {
    /// Configuration of every session.
    pub session: SessionConfig,
    /// Bytes per session frame, `1..=65535`.
    pub chunk_size: usize,
    /// Times the receiver repeats the final END acknowledgement.
    pub end_ack_repeats: u8,
    /// Pause between repeated END acknowledgements.
    pub end_ack_spacing_us: u32,
}

impl Default for TransferConfig {
    fn default() -> Self {
        TransferConfig {
            session: SessionConfig::default(),
            chunk_size: FRAME_SIZE,
            end_ack_repeats: END_ACK_REPEATS,
            end_ack_spacing_us: END_ACK_SPACING_US,
        }
    }
}

impl TransferConfig {
    /// A default transfer for the link `local -> peer`.
    pub fn between(local_addr: u16, peer_addr: u16) -> Self {
        TransferConfig {
            session: SessionConfig::between(local_addr, peer_addr),
            ..Default::default()
        }
    }

    /// Checks the chunk size and the session parameters.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.chunk_size == 0 {
            return Err(ConfigError::EmptyFrame);
        }
        if self.chunk_size > usize::from(u16::MAX) {
            return Err(ConfigError::FrameTooLarge(self.chunk_size));
        }
        self.session.validate()
    }
}

/// Outcome of a chunked transfer.
#[derive(PartialEq, Eq, Clone, Copy, Default, Debug)]
#[cfg_attr(feature = "defmt-0-3", derive(defmt::Format))]
pub struct TransferReport {
    /// Bytes confirmed by completed sessions.
    pub bytes: usize,
    /// Sessions that reached HALT.
    pub sessions: u32,
    /// Whether the transfer stopped on a session timeout.
    pub timed_out: bool,
    /// Counters summed over every session.
    pub diagnostics: Diagnostics,
}

/// Sends `data` as a sequence of sessions.
///
/// Stops at the first session that times out; the report then tells how many
/// bytes made it across.
///
/// # Errors
/// * [`SessionError::InvalidConfig`] if `config` does not validate
/// * [`SessionError::Link`] if the link fails
pub fn send_buffer<L: Link, D: DelayNs>(
    config: &TransferConfig,
    link: &mut L,
    delay: &mut D,
    data: &[u8],
) -> Result<TransferReport, SessionError<L::Error>> {
    config.validate()?;
    let mut report = TransferReport::default();
    for chunk in data.chunks(config.chunk_size) {
        let mut sender = Sender::new(config.session, chunk)?;
        let result = sender.run(link, delay);
        report.diagnostics.accumulate(sender.diagnostics());
        match result {
            Ok(()) => {}
            Err(e) if e.is_timeout() => {
                warn!("transfer: exit due to timeout after {} bytes", report.bytes);
                report.timed_out = true;
                break;
            }
            Err(e) => return Err(e),
        }
        report.bytes += chunk.len();
        report.sessions += 1;
        info!("transfer: sent chunk {} ({} bytes)", report.sessions, chunk.len());
    }
    Ok(report)
}

/// Receives a sequence of sessions into `out`.
///
/// Chunk `n` lands at `out[n * chunk_size..]`. The transfer ends after a chunk
/// shorter than `chunk_size`, once `out` is full, or on a session timeout.
/// Unless it timed out, the final END acknowledgement is repeated
/// `end_ack_repeats` times.
///
/// # Errors
/// * [`SessionError::InvalidConfig`] if `config` does not validate
/// * [`SessionError::Link`] if the link fails
pub fn receive_buffer<L: Link, D: DelayNs>(
    config: &TransferConfig,
    link: &mut L,
    delay: &mut D,
    out: &mut [u8],
) -> Result<TransferReport, SessionError<L::Error>> {
    config.validate()?;
    let capacity = out.len();
    let mut report = TransferReport::default();
    while report.bytes < capacity {
        let end = (report.bytes + config.chunk_size).min(capacity);
        let mut receiver = Receiver::new(config.session, &mut out[report.bytes..end])?;
        let result = receiver.run(link, delay);
        report.diagnostics.accumulate(receiver.diagnostics());
        match result {
            Ok(()) => {}
            Err(e) if e.is_timeout() => {
                warn!("transfer: exit due to timeout after {} bytes", report.bytes);
                report.timed_out = true;
                break;
            }
            Err(e) => return Err(e),
        }
        if !receiver.peer_confirmed() {
            continue;
        }

        let frame_length = usize::from(receiver.frame_length());
        report.bytes += frame_length;
        report.sessions += 1;
        info!("transfer: received chunk {} ({} bytes)", report.sessions, frame_length);

        if frame_length < config.chunk_size || report.bytes >= capacity {
            receiver.repeat_end_ack(
                link,
                delay,
                config.end_ack_repeats,
                config.end_ack_spacing_us,
            )?;
            break;
        }
    }
    Ok(report)
}
