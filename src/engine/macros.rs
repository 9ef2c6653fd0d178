/// Declares a static global `RADIO_ENGINE` instance protected by a
/// `critical_section` mutex.
///
/// The main context and the radio and timer interrupts all reach the engine
/// through it.
///
/// # Arguments
/// - `$bus`: The concrete register bus type (must implement `RegisterBus`)
/// - `$hw`: The concrete board type (must implement `Hardware`)
/// - `$delay`: The concrete delay type (must implement `DelayNs`)
///
/// # Example
/// ```rust,ignore
/// init_radio_engine!(SpiRegisters<MySpi>, MyBoard, MyDelay);
/// ```
#[macro_export]
macro_rules! init_radio_engine {
    ( $bus:ty, $hw:ty, $delay:ty ) => {
        pub static RADIO_ENGINE: $crate::engine::GlobalEngine<$bus, $hw, $delay> =
            $crate::engine::global_radio_engine_init();
    };
}

/// Handles the transceiver's interrupt on the global `RADIO_ENGINE`.
///
/// Expands to a `Result<(), EngineError>`.
///
/// # Example
/// ```rust,ignore
/// #[interrupt]
/// fn EXTI0() {
///     let _ = radio_interrupt!();
/// }
/// ```
///
/// # Notes
/// - Requires `init_radio_engine!` to have been used earlier.
#[macro_export]
macro_rules! radio_interrupt {
    () => {
        $crate::engine::global_radio_interrupt(&RADIO_ENGINE)
    };
}

/// Handles expiry of the board timer on the global `RADIO_ENGINE`.
///
/// Expands to a `Result<(), EngineError>`.
///
/// # Notes
/// - Requires `init_radio_engine!` to have been used earlier.
#[macro_export]
macro_rules! radio_timer {
    () => {
        $crate::engine::global_radio_timer(&RADIO_ENGINE)
    };
}
