//! Send/check/resend session protocol.
//!
//! A session moves one bounded frame (at most 65535 bytes, normally a
//! [`FRAME_SIZE`](crate::consts::FRAME_SIZE) chunk of a larger file) from a
//! [`Sender`] to a [`Receiver`] over a half-duplex [`Link`](crate::link::Link).
//!
//! ## Exchange
//!
//! ```text
//! sender                          receiver
//! PING            ------------->  ACK
//! CONFIG(fl,pl,n) ------------->  ACK echoing (fl,pl,n)
//! START           ------------->  ACK
//! SEND x window   ------------->  (no ACK, packets land in the frame buffer)
//! CHECK(start,end)------------->  ACK(update, length, table)
//! SEND lost IDs   ------------->  ... until the table comes back empty
//! END             ------------->  ACK
//! ```
//!
//! Every wait is a bounded poll loop. Each poll charges a session-wide
//! accumulator ([`Timeout`]); reaching the ceiling aborts the session with
//! [`SessionError::TimedOut`](crate::error::SessionError::TimedOut). A valid
//! acknowledgement (sender) or addressed command (receiver) resets it.

mod receiver;
mod sender;

pub use receiver::{Receiver, ReceiverState};
pub use sender::{Sender, SenderState};

use crate::consts::{
    NODE_00_ADDR, NODE_01_ADDR, PACKETS_PER_TRANS, RESEND_INTERVAL_US, SCPL, SESS_TIME_OUT_US,
    SESS_WAIT_RECV_US, SESS_WAIT_SEND_US,
};
use crate::error::{ConfigError, SessionError};
use crate::table::TABLE_BITS;

/// Tunables of one session.
///
/// The defaults match the timing the protocol was designed around: 10 us
/// send polls charged as 100 us each, commands repeated every 1 ms without an
/// answer, and a 60 second cumulative timeout.
#[derive(PartialEq, Eq, Clone, Copy, Debug)]
#[cfg_attr(feature = "defmt-0-3", derive(defmt::Format))]
pub struct SessionConfig {
    /// Address of this node.
    pub local_addr: u16,
    /// Address of the other end of the session.
    pub peer_addr: u16,
    /// Payload bytes per SEND packet (sender only), `1..=115`.
    pub packet_length: u16,
    /// Packets pushed per transaction before a CHECK (sender only).
    pub window_size: u16,
    /// Pause after each SEND packet.
    pub send_delay_us: u32,
    /// Receiver idle poll quantum.
    pub recv_poll_us: u32,
    /// Sender ACK poll quantum.
    pub send_poll_us: u32,
    /// Amount each sender poll adds to the timeout accumulator.
    pub send_poll_charge_us: u32,
    /// Waiting time after which an unanswered command is sent again.
    pub resend_interval_us: u32,
    /// Cumulative timeout ceiling.
    pub timeout_us: u32,
    /// Whether windows are confirmed with CHECK. Without it packets are
    /// pushed once and never retransmitted.
    pub use_check: bool,
}

impl Default for SessionConfig {
    fn default() -> Self {
        SessionConfig {
            local_addr: NODE_00_ADDR,
            peer_addr: NODE_01_ADDR,
            packet_length: SCPL,
            window_size: PACKETS_PER_TRANS,
            send_delay_us: 0,
            recv_poll_us: SESS_WAIT_RECV_US,
            send_poll_us: SESS_WAIT_SEND_US,
            send_poll_charge_us: SESS_WAIT_RECV_US,
            resend_interval_us: RESEND_INTERVAL_US,
            timeout_us: SESS_TIME_OUT_US,
            use_check: true,
        }
    }
}

impl SessionConfig {
    /// A default configuration for the link `local -> peer`.
    pub fn between(local_addr: u16, peer_addr: u16) -> Self {
        SessionConfig {
            local_addr,
            peer_addr,
            ..Default::default()
        }
    }

    /// The same configuration seen from the other end of the link.
    pub fn reversed(&self) -> Self {
        SessionConfig {
            local_addr: self.peer_addr,
            peer_addr: self.local_addr,
            ..*self
        }
    }

    /// Checks the parameters a sender puts on the wire.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.packet_length == 0 || self.packet_length > SCPL {
            return Err(ConfigError::PacketLength(self.packet_length));
        }
        if self.window_size == 0 || usize::from(self.window_size) > TABLE_BITS {
            return Err(ConfigError::WindowSize(self.window_size));
        }
        if self.send_poll_us == 0 || self.send_poll_charge_us == 0 || self.recv_poll_us == 0 {
            return Err(ConfigError::ZeroPollInterval);
        }
        Ok(())
    }
}

/// `ceil(frame_length / packet_length)`.
pub fn packet_count(frame_length: u16, packet_length: u16) -> u16 {
    frame_length.div_ceil(packet_length)
}

/// Cumulative session timeout accumulator.
///
/// The accumulator only grows between resets, and resets only on progress.
#[derive(PartialEq, Eq, Clone, Copy, Debug)]
#[cfg_attr(feature = "defmt-0-3", derive(defmt::Format))]
pub struct Timeout {
    elapsed_us: u32,
    ceiling_us: u32,
}

impl Timeout {
    /// A fresh accumulator giving up at `ceiling_us`.
    pub const fn new(ceiling_us: u32) -> Self {
        Timeout {
            elapsed_us: 0,
            ceiling_us,
        }
    }

    /// Accumulated wait since the last reset.
    pub fn elapsed_us(&self) -> u32 {
        self.elapsed_us
    }

    /// Whether the ceiling has been reached.
    pub fn expired(&self) -> bool {
        self.elapsed_us >= self.ceiling_us
    }

    /// Adds `us` of waiting.
    ///
    /// # Errors
    /// * [`SessionError::TimedOut`] once the total reaches the ceiling
    pub fn charge<E>(&mut self, us: u32) -> Result<(), SessionError<E>> {
        self.elapsed_us = self.elapsed_us.saturating_add(us);
        if self.expired() {
            Err(SessionError::TimedOut {
                elapsed_us: self.elapsed_us,
            })
        } else {
            Ok(())
        }
    }

    /// Clears the accumulator after progress.
    pub fn reset(&mut self) {
        self.elapsed_us = 0;
    }
}

/// Per-session counters of data-integrity and recovery events.
///
/// None of these abort a session; they explain why one was slow.
#[derive(PartialEq, Eq, Clone, Copy, Default, Debug)]
#[cfg_attr(feature = "defmt-0-3", derive(defmt::Format))]
pub struct Diagnostics {
    /// SEND packets whose packet ID and trailing echo disagreed.
    pub id_mismatch: u32,
    /// Frames whose source/destination pair does not belong to the session.
    pub foreign_address: u32,
    /// SEND packets that had already been applied.
    pub duplicate_packets: u32,
    /// SEND packets outside the frame or the tracked window.
    pub out_of_window: u32,
    /// Commands not accepted in the current state, or with invalid parameters.
    pub rejected_commands: u32,
    /// Frames that failed to decode.
    pub malformed_frames: u32,
    /// Acknowledgements that arrived but failed validation.
    pub stale_acks: u32,
    /// Packets sent again after a loss report.
    pub retransmitted: u32,
    /// Commands sent again after the resend interval elapsed.
    pub command_resends: u32,
}

impl Diagnostics {
    /// Adds another session's counters to these.
    pub fn accumulate(&mut self, other: &Diagnostics) {
        self.id_mismatch += other.id_mismatch;
        self.foreign_address += other.foreign_address;
        self.duplicate_packets += other.duplicate_packets;
        self.out_of_window += other.out_of_window;
        self.rejected_commands += other.rejected_commands;
        self.malformed_frames += other.malformed_frames;
        self.stale_acks += other.stale_acks;
        self.retransmitted += other.retransmitted;
        self.command_resends += other.command_resends;
    }
}
