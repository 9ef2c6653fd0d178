//! Link transport seam between the session state machines and a radio.
//!
//! The session layer only needs three primitives: push a frame out, ask
//! whether an inbound frame is waiting, and take that frame. [`Link`] names
//! them; any radio driver, simulator or test harness can implement it.
//!
//! On interrupt-driven radios the inbound side is fed from an ISR. A
//! [`FrameSlot`] is the hand-off point for that case: the ISR publishes a
//! frame and raises an atomic ready flag, and the polling session takes the
//! frame by move. [`SlotLink`] pairs a slot with a transmit function to form a
//! complete [`Link`].

use core::cell::RefCell;
use core::fmt::Debug;
use core::sync::atomic::{AtomicBool, Ordering};
use critical_section::Mutex;

pub use crate::frame::RawFrame;

/// Frame-level transport used by both session state machines.
pub trait Link {
    /// Transport failure type.
    type Error: Debug;

    /// Transmits one encoded frame (length byte first).
    fn send_frame(&mut self, frame: &[u8]) -> Result<(), Self::Error>;

    /// Whether an inbound frame is waiting to be read.
    fn frame_ready(&mut self) -> bool;

    /// Takes the waiting inbound frame.
    ///
    /// # Returns
    /// * `Err(nb::Error::WouldBlock)` when no frame is waiting
    fn read_frame(&mut self) -> nb::Result<RawFrame, Self::Error>;
}

impl<L: Link + ?Sized> Link for &mut L {
    type Error = L::Error;

    fn send_frame(&mut self, frame: &[u8]) -> Result<(), Self::Error> {
        (**self).send_frame(frame)
    }

    fn frame_ready(&mut self) -> bool {
        (**self).frame_ready()
    }

    fn read_frame(&mut self) -> nb::Result<RawFrame, Self::Error> {
        (**self).read_frame()
    }
}

/// Single-frame mailbox shared between an interrupt handler and a poller.
///
/// The producer calls [`publish`](FrameSlot::publish) from interrupt context;
/// the consumer checks [`is_ready`](FrameSlot::is_ready) without entering a
/// critical section and then [`take`](FrameSlot::take)s the frame. A frame
/// published before the previous one was taken replaces it, which matches a
/// radio with one receive buffer.
///
/// # Example
/// ```rust
/// use sarlink::link::{FrameSlot, RawFrame};
///
/// static INBOUND: FrameSlot = FrameSlot::new();
///
/// let mut frame = RawFrame::new();
/// frame.extend_from_slice(&[7, 0x80, 0x56, 0x78, 0x12, 0x34]).unwrap();
/// let _ = INBOUND.publish(frame);
/// assert!(INBOUND.is_ready());
/// assert!(INBOUND.take().is_some());
/// assert!(!INBOUND.is_ready());
/// ```
pub struct FrameSlot {
    ready: AtomicBool,
    frame: Mutex<RefCell<Option<RawFrame>>>,
}

impl Debug for FrameSlot {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("FrameSlot")
            .field("ready", &self.is_ready())
            .finish()
    }
}

impl Default for FrameSlot {
    fn default() -> Self {
        Self::new()
    }
}

impl FrameSlot {
    /// An empty slot, usable in a `static`.
    pub const fn new() -> Self {
        FrameSlot {
            ready: AtomicBool::new(false),
            frame: Mutex::new(RefCell::new(None)),
        }
    }

    /// Stores `frame` and raises the ready flag.
    ///
    /// # Returns
    /// * `true` if an untaken frame was overwritten
    pub fn publish(&self, frame: RawFrame) -> bool {
        let overwritten = critical_section::with(|cs| {
            self.frame.borrow(cs).borrow_mut().replace(frame).is_some()
        });
        self.ready.store(true, Ordering::Release);
        overwritten
    }

    /// Whether a frame is waiting.
    pub fn is_ready(&self) -> bool {
        self.ready.load(Ordering::Acquire)
    }

    /// Moves the waiting frame out and lowers the ready flag.
    pub fn take(&self) -> Option<RawFrame> {
        if !self.ready.swap(false, Ordering::AcqRel) {
            return None;
        }
        critical_section::with(|cs| self.frame.borrow(cs).borrow_mut().take())
    }
}

/// A [`Link`] built from a [`FrameSlot`] for inbound frames and a transmit
/// function for outbound ones.
///
/// # Type Parameters
/// - `TX`: called with every outbound frame, typically queueing it on the
///   radio driver
pub struct SlotLink<'s, TX> {
    slot: &'s FrameSlot,
    transmit: TX,
}

impl<TX> Debug for SlotLink<'_, TX> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("SlotLink").field("slot", self.slot).finish()
    }
}

impl<'s, TX, E> SlotLink<'s, TX>
where
    TX: FnMut(&[u8]) -> Result<(), E>,
{
    /// Pairs `slot` with `transmit`.
    pub fn new(slot: &'s FrameSlot, transmit: TX) -> Self {
        SlotLink { slot, transmit }
    }
}

impl<TX, E> Link for SlotLink<'_, TX>
where
    TX: FnMut(&[u8]) -> Result<(), E>,
    E: Debug,
{
    type Error = E;

    fn send_frame(&mut self, frame: &[u8]) -> Result<(), E> {
        (self.transmit)(frame)
    }

    fn frame_ready(&mut self) -> bool {
        self.slot.is_ready()
    }

    fn read_frame(&mut self) -> nb::Result<RawFrame, E> {
        self.slot.take().ok_or(nb::Error::WouldBlock)
    }
}
