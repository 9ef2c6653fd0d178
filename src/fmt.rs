//! Logging shims.
//!
//! The macros below forward to `log` or `defmt` depending on which feature is
//! enabled, and expand to nothing otherwise. Arguments are still type-checked
//! in the no-logging build so call sites do not rot.

#![allow(unused_macros)]

#[cfg(all(feature = "log", feature = "defmt-0-3"))]
compile_error!("features `log` and `defmt-0-3` are mutually exclusive");

macro_rules! trace {
    ($($arg:tt)+) => {{
        #[cfg(feature = "log")]
        ::log::trace!($($arg)+);
        #[cfg(feature = "defmt-0-3")]
        ::defmt::trace!($($arg)+);
        #[cfg(not(any(feature = "log", feature = "defmt-0-3")))]
        let _ = ::core::format_args!($($arg)+);
    }};
}

macro_rules! debug {
    ($($arg:tt)+) => {{
        #[cfg(feature = "log")]
        ::log::debug!($($arg)+);
        #[cfg(feature = "defmt-0-3")]
        ::defmt::debug!($($arg)+);
        #[cfg(not(any(feature = "log", feature = "defmt-0-3")))]
        let _ = ::core::format_args!($($arg)+);
    }};
}

macro_rules! info {
    ($($arg:tt)+) => {{
        #[cfg(feature = "log")]
        ::log::info!($($arg)+);
        #[cfg(feature = "defmt-0-3")]
        ::defmt::info!($($arg)+);
        #[cfg(not(any(feature = "log", feature = "defmt-0-3")))]
        let _ = ::core::format_args!($($arg)+);
    }};
}

macro_rules! warn_ {
    ($($arg:tt)+) => {{
        #[cfg(feature = "log")]
        ::log::warn!($($arg)+);
        #[cfg(feature = "defmt-0-3")]
        ::defmt::warn!($($arg)+);
        #[cfg(not(any(feature = "log", feature = "defmt-0-3")))]
        let _ = ::core::format_args!($($arg)+);
    }};
}

macro_rules! error {
    ($($arg:tt)+) => {{
        #[cfg(feature = "log")]
        ::log::error!($($arg)+);
        #[cfg(feature = "defmt-0-3")]
        ::defmt::error!($($arg)+);
        #[cfg(not(any(feature = "log", feature = "defmt-0-3")))]
        let _ = ::core::format_args!($($arg)+);
    }};
}

#[allow(unused_imports)]
pub(crate) use {debug, error, info, trace, warn_ as warn};
