use super::regs::RegisterBus;
use super::{Engine, Hardware};
use crate::error::EngineError;
use core::cell::RefCell;
use critical_section::Mutex;
use embedded_hal::delay::DelayNs;

/// A packet engine shared between the main context and the radio and timer
/// interrupts.
pub type GlobalEngine<R, H, D> = Mutex<RefCell<Option<Engine<R, H, D>>>>;

/// Used to initialize the global static `Engine` for use with
/// `critical_section`.
///
/// # Returns
/// * An empty mutable ref-cell
///
/// # Example
/// ```rust,ignore
/// use sarlink::engine::{GlobalEngine, global_radio_engine_init};
///
/// static RADIO: GlobalEngine<Bus, Board, Delay> = global_radio_engine_init();
/// ```
pub const fn global_radio_engine_init<R, H, D>() -> GlobalEngine<R, H, D> {
    Mutex::new(RefCell::new(None))
}

/// Runs [`Engine::setup`] and stores the engine in `global` on success.
///
/// Setup runs outside the critical section: it polls the transceiver and
/// must not block interrupts meanwhile.
///
/// # Example
/// ```rust,ignore
/// fn main() {
///     let engine = Engine::new(bus, board, delay, EngineConfig::new(0x1234, 0xabcd));
///     global_radio_engine_setup(&RADIO, engine).unwrap();
/// }
/// ```
pub fn global_radio_engine_setup<R, H, D>(
    global: &GlobalEngine<R, H, D>,
    mut engine: Engine<R, H, D>,
) -> Result<(), EngineError>
where
    R: RegisterBus,
    H: Hardware,
    D: DelayNs,
{
    engine.setup()?;
    critical_section::with(|cs| {
        let _ = global.borrow(cs).replace(Some(engine));
    });
    Ok(())
}

/// Forwards the transceiver's interrupt to the global engine.
///
/// Does nothing before [`global_radio_engine_setup`].
///
/// # Example
/// ```rust,ignore
/// #[interrupt]
/// fn EXTI0() {
///     let _ = global_radio_interrupt(&RADIO);
/// }
/// ```
pub fn global_radio_interrupt<R, H, D>(global: &GlobalEngine<R, H, D>) -> Result<(), EngineError>
where
    R: RegisterBus,
    H: Hardware,
    D: DelayNs,
{
    with_radio_engine(global, |engine| engine.handle_interrupt()).unwrap_or(Ok(()))
}

/// Forwards the expiry of the board's one-shot timer to the global engine.
///
/// Does nothing before [`global_radio_engine_setup`].
pub fn global_radio_timer<R, H, D>(global: &GlobalEngine<R, H, D>) -> Result<(), EngineError>
where
    R: RegisterBus,
    H: Hardware,
    D: DelayNs,
{
    with_radio_engine(global, |engine| engine.handle_timer()).unwrap_or(Ok(()))
}

/// Runs `f` on the global engine inside a critical section.
///
/// # Returns
/// * `None` if no engine has been stored yet
pub fn with_radio_engine<R, H, D, T>(
    global: &GlobalEngine<R, H, D>,
    f: impl FnOnce(&mut Engine<R, H, D>) -> T,
) -> Option<T> {
    critical_section::with(|cs| global.borrow(cs).borrow_mut().as_mut().map(f))
}
