//! # sarlink
//!
//! A portable, no_std Rust implementation of a send/check/resend file-transfer
//! protocol for half-duplex 802.15.4 sub-GHz radios, plus an interrupt-driven
//! packet engine for ML7396-class transceivers.
//!
//! The crate is layered:
//! - [`frame`] and [`table`]: the session command codec and the
//!   selective-repeat loss table
//! - [`session`]: the [`Sender`](session::Sender) and
//!   [`Receiver`](session::Receiver) state machines, polled over a [`Link`](link::Link)
//! - [`app`]: chunked transfers of buffers larger than one session frame
//! - `pipeline` (`std` only): a threaded receive/store loop writing frames to disk
//! - [`engine`]: the transceiver's packet engine (FIFO transfers, CCA with
//!   backoff, automatic ACKs and retries)
//!
//! ## Crate features
//! | Feature               | Description |
//! |-----------------------|-------------|
//! | `std`                 | Disables `#![no_std]` and enables the storage pipeline |
//! | `timer-isr` (default) | Global engine helpers and macros built on `critical_section` |
//! | `defmt-0-3`           | Uses `defmt` logging |
//! | `log`                 | Uses `log` logging |
//!
//! ## Usage
//!
//! ```rust,ignore
//! use sarlink::app::{TransferConfig, send_buffer};
//!
//! let config = TransferConfig::between(0x0001, 0x0002);
//! let report = send_buffer(&config, &mut link, &mut delay, &file)?;
//! ```
//!
//! On the radio side the engine is wired to the board's interrupt handlers:
//!
//! ```rust,ignore
//! sarlink::init_radio_engine!(SpiRegisters<Spi>, Board, Delay);
//!
//! #[interrupt]
//! fn EXTI0() {
//!     let _ = sarlink::radio_interrupt!();
//! }
//! ```
//!
//! --
//! Designed for `#![no_std]` use in resource-constrained embedded environments.

#![deny(
    bad_style,
    dead_code,
    improper_ctypes,
    non_shorthand_field_patterns,
    no_mangle_generic_items,
    overflowing_literals,
    path_statements,
    patterns_in_fns_without_body,
    unconditional_recursion,
    unused,
    while_true,
    missing_debug_implementations,
    missing_docs,
    trivial_casts,
    trivial_numeric_casts,
    unused_extern_crates,
    unused_import_braces,
    unused_qualifications,
    unused_results
)]
#![cfg_attr(not(feature = "std"), no_std)]

#[cfg(all(test, not(feature = "std")))]
extern crate std;

pub use critical_section;
pub use heapless;

pub(crate) mod fmt;

pub mod app;
pub mod consts;
pub mod engine;
pub mod error;
pub mod frame;
pub mod link;
#[cfg(feature = "std")]
pub mod pipeline;
pub mod session;
pub mod table;
