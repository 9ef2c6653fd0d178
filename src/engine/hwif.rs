//! Board services the packet engine needs besides the register bus.

use core::fmt::Debug;

/// Peripheral setup, a unique seed value and a one-shot millisecond timer.
///
/// The timer's expiry must be reported back through
/// [`Engine::handle_timer`](super::Engine::handle_timer), typically from the
/// timer interrupt.
pub trait Hardware {
    /// Peripheral failure type.
    type Error: Debug;

    /// Brings up the SPI bus, the interrupt line and the timer.
    fn init(&mut self) -> Result<(), Self::Error>;

    /// A value unique to this board (e.g. from an EEPROM), used to seed the
    /// backoff jitter.
    fn unique_id(&mut self) -> Result<u16, Self::Error>;

    /// Arms the one-shot timer to fire after `ms` milliseconds.
    fn timer_start(&mut self, ms: u16) -> Result<(), Self::Error>;

    /// Cancels the one-shot timer.
    fn timer_stop(&mut self) -> Result<(), Self::Error>;
}

impl<H: Hardware + ?Sized> Hardware for &mut H {
    type Error = H::Error;

    fn init(&mut self) -> Result<(), Self::Error> {
        (**self).init()
    }

    fn unique_id(&mut self) -> Result<u16, Self::Error> {
        (**self).unique_id()
    }

    fn timer_start(&mut self, ms: u16) -> Result<(), Self::Error> {
        (**self).timer_start(ms)
    }

    fn timer_stop(&mut self) -> Result<(), Self::Error> {
        (**self).timer_stop()
    }
}
