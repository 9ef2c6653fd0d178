//! Frame buffers handed to the packet engine.
//!
//! A [`Buffer`] carries one PHY frame (without the FCS) and the progress of
//! the FIFO transfer that fills or drains it. What the engine does with a
//! buffer depends on its [`Role`]: receive buffers carry an optional filter,
//! transmit buffers carry the ACK and CCA retry policies.

use super::mac::MacHeader;
use crate::error::EngineError;

/// Largest frame a buffer holds: 256-byte FIFO minus the 2-byte FCS.
pub const BUFFER_CAPACITY: usize = 256 - 2;

/// Capacity of the engine's ACK scratch buffer: a 127-byte PHY frame minus
/// the FCS.
pub const ACK_CAPACITY: u16 = 127 - 2;

/// Transfer status of a buffer.
#[derive(PartialEq, Eq, Clone, Copy, Default, Debug)]
#[cfg_attr(feature = "defmt-0-3", derive(defmt::Format))]
pub enum BufferStatus {
    /// Not started yet.
    #[default]
    Init,
    /// This many bytes have been moved through the FIFO.
    Progress(u16),
    /// The frame length is invalid or exceeds the buffer capacity.
    ESize,
    /// Receiving was stopped by the caller.
    EStop,
    /// The frame failed its CRC check.
    ECrc,
    /// The channel stayed busy through every CCA retry.
    ECca,
    /// No acknowledgement arrived through every retry.
    ERetry,
}

impl BufferStatus {
    /// Whether this is one of the terminal error codes.
    pub fn is_error(&self) -> bool {
        !matches!(self, BufferStatus::Init | BufferStatus::Progress(_))
    }
}

/// Wait time and retry bound of an ACK wait or a CCA.
#[derive(PartialEq, Eq, Clone, Copy, Default, Debug)]
#[cfg_attr(feature = "defmt-0-3", derive(defmt::Format))]
pub struct RetryPolicy {
    /// For ACKs, the wait in milliseconds. For CCA, the backoff exponent;
    /// `0` means a fixed 100 ms backoff.
    pub wait: u16,
    /// Retries after the first attempt.
    pub retry: u8,
}

impl RetryPolicy {
    /// A policy of `retry` retries spaced by `wait`.
    pub const fn new(wait: u16, retry: u8) -> Self {
        RetryPolicy { wait, retry }
    }
}

/// Filter deciding whether a received frame is delivered.
pub type FrameFilter = fn(&MacHeader) -> bool;

/// Called when the engine is done with a buffer.
pub type DoneCallback = fn(&Buffer);

/// Role-specific options of a buffer.
#[derive(Clone, Copy, Debug)]
pub enum Role {
    /// A receive buffer.
    Rx {
        /// Frames rejected by the filter are dropped and the buffer reused.
        filter: Option<FrameFilter>,
        /// Completion callback.
        done: Option<DoneCallback>,
    },
    /// A transmit buffer.
    Tx {
        /// How long to wait for an acknowledgement, and how often to resend.
        ack: RetryPolicy,
        /// How often to retry a busy channel, and the backoff.
        cca: RetryPolicy,
        /// Completion callback.
        done: Option<DoneCallback>,
    },
}

/// One frame and its transfer state.
#[derive(Clone, Debug)]
pub struct Buffer {
    pub(super) data: [u8; BUFFER_CAPACITY],
    pub(super) capacity: u16,
    pub(super) size: u16,
    pub(super) status: BufferStatus,
    pub(super) ed: u8,
    role: Role,
}

impl Buffer {
    /// A receive buffer accepting frames of up to `capacity` bytes.
    ///
    /// `capacity` is clamped to [`BUFFER_CAPACITY`].
    pub fn rx(capacity: u16) -> Self {
        Buffer {
            data: [0; BUFFER_CAPACITY],
            capacity: capacity.min(BUFFER_CAPACITY as u16),
            size: 0,
            status: BufferStatus::Init,
            ed: 0,
            role: Role::Rx {
                filter: None,
                done: None,
            },
        }
    }

    /// A transmit buffer holding `frame` (MAC header and payload, no FCS).
    ///
    /// # Errors
    /// * [`EngineError::Oversized`] if `frame` is longer than
    ///   [`BUFFER_CAPACITY`]
    pub fn tx(frame: &[u8], ack: RetryPolicy, cca: RetryPolicy) -> Result<Self, EngineError> {
        if frame.len() > BUFFER_CAPACITY {
            return Err(EngineError::Oversized(frame.len()));
        }
        let mut data = [0; BUFFER_CAPACITY];
        data[..frame.len()].copy_from_slice(frame);
        Ok(Buffer {
            data,
            capacity: BUFFER_CAPACITY as u16,
            size: frame.len() as u16,
            status: BufferStatus::Init,
            ed: 0,
            role: Role::Tx {
                ack,
                cca,
                done: None,
            },
        })
    }

    /// Sets the receive filter. No effect on transmit buffers.
    pub fn with_filter(mut self, filter: FrameFilter) -> Self {
        if let Role::Rx { filter: f, .. } = &mut self.role {
            *f = Some(filter);
        }
        self
    }

    /// Sets the completion callback.
    pub fn with_done(mut self, callback: DoneCallback) -> Self {
        match &mut self.role {
            Role::Rx { done, .. } | Role::Tx { done, .. } => *done = Some(callback),
        }
        self
    }

    /// Role and options.
    pub fn role(&self) -> &Role {
        &self.role
    }

    /// Whether this is a receive buffer.
    pub fn is_rx(&self) -> bool {
        matches!(self.role, Role::Rx { .. })
    }

    /// Transfer status.
    pub fn status(&self) -> BufferStatus {
        self.status
    }

    /// Largest frame the buffer accepts.
    pub fn capacity(&self) -> u16 {
        self.capacity
    }

    /// Frame length: announced by the PHY header when receiving, the frame
    /// given at construction when transmitting.
    pub fn size(&self) -> u16 {
        self.size
    }

    /// Energy detection value of the received frame (or of the ACK of a
    /// transmitted one).
    pub fn ed(&self) -> u8 {
        self.ed
    }

    /// The bytes moved so far: the whole frame once transferred, nothing if
    /// the buffer ended in an error.
    pub fn data(&self) -> &[u8] {
        match self.status {
            BufferStatus::Progress(n) => &self.data[..usize::from(n)],
            _ => &[],
        }
    }

    /// The frame held by a transmit buffer.
    pub fn frame(&self) -> &[u8] {
        &self.data[..usize::from(self.size)]
    }

    pub(super) fn filter(&self) -> Option<FrameFilter> {
        match self.role {
            Role::Rx { filter, .. } => filter,
            Role::Tx { .. } => None,
        }
    }

    pub(super) fn policies(&self) -> (RetryPolicy, RetryPolicy) {
        match self.role {
            Role::Tx { ack, cca, .. } => (ack, cca),
            Role::Rx { .. } => (RetryPolicy::default(), RetryPolicy::default()),
        }
    }

    pub(super) fn notify(&self) {
        let done = match self.role {
            Role::Rx { done, .. } | Role::Tx { done, .. } => done,
        };
        if let Some(done) = done {
            done(self);
        }
    }

    pub(super) fn processed(&self) -> u16 {
        match self.status {
            BufferStatus::Progress(n) => n,
            _ => 0,
        }
    }
}
