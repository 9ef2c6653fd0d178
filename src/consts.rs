//! Constants used across the session protocol and the radio packet engine.
//!
//! This module defines the command header layout, session defaults, and
//! buffer sizing shared by the frame codec, the selective-repeat table, and
//! both session state machines.
//!
//! ## Key Concepts
//!
//! - **Command header**: bit 7 is the ACK flag, bits 5..3 carry the command tag
//!   and bits 2..0 carry the parameter-count code (number of 16-bit parameters).
//! - **Packet**: one radio frame carrying `packet_length` bytes of frame data.
//! - **Transaction / window**: a batch of packets pushed before a CHECK.
//! - **Loss table**: the receiver's bitmap of a window, reported back on CHECK.
//!
//! Timing values are expressed in microseconds, matching the delay primitive
//! every wait loop is built on.

/// Mask selecting the command tag in a command header (`0b0011_1000`).
pub const CMD_PREFIX_MASK: u8 = 0x38;

/// ACK flag in a command header.
pub const ACK_FLAG: u8 = 0x80;

/// Mask selecting the parameter-count code in a command header.
pub const PARAM_COUNT_MASK: u8 = 0x07;

/// Parameter-count code for CONFIG: three 16-bit parameters.
pub const CONFIG_PARAMS: u8 = 0x3;

/// Parameter-count code for SEND: one 16-bit parameter (the packet ID).
pub const SEND_PARAMS: u8 = 0x1;

/// Parameter-count code for CHECK: two 16-bit parameters.
pub const CHECK_PARAMS: u8 = 0x2;

/// Offset of the first parameter byte in a command, after the header byte and
/// the two 16-bit addresses.
pub const PARAM_OFFSET: usize = 5;

/// Maximum number of parameter bytes a command can carry.
pub const MAX_PARAM_LEN: usize = 14;

/// Size of the frame check sequence the radio appends to every frame.
pub const FCS_LEN: usize = 2;

/// Largest PHY frame (length byte value) the link carries.
pub const LINK_MTU: usize = 127;

/// Size of a raw frame buffer: the length byte plus the largest frame body.
pub const RAW_FRAME_LEN: usize = LINK_MTU + 1;

/// Default number of packets per transaction.
pub const PACKETS_PER_TRANS: u16 = 128;

/// Size of the receiver's loss table in bytes (up to 2048 packets per window).
pub const RECV_PACKET_TAB_MAX: usize = 256;

/// Default and maximum payload bytes per SEND packet.
///
/// `1 + 5 + 2 + 115 + 2` bytes plus the FCS fill exactly one radio frame.
pub const SCPL: u16 = 115;

/// Maximum number of loss-table bytes reported in one CHECK acknowledgement.
pub const MAX_NUM_LOSS_PKTS: u16 = 116;

/// Receiver idle poll quantum.
pub const SESS_WAIT_RECV_US: u32 = 100;

/// Sender ACK poll quantum.
pub const SESS_WAIT_SEND_US: u32 = 10;

/// Cumulative timeout ceiling of a session (60 seconds).
pub const SESS_TIME_OUT_US: u32 = 60_000_000;

/// Interval after which an unanswered command is sent again.
pub const RESEND_INTERVAL_US: u32 = SESS_WAIT_RECV_US * 10;

/// Largest frame a single session transfers.
pub const FRAME_SIZE: usize = 57_344;

/// Number of times the receiver repeats its final END acknowledgement.
pub const END_ACK_REPEATS: u8 = 10;

/// Spacing between repeated END acknowledgements.
pub const END_ACK_SPACING_US: u32 = 5_000;

/// Well-known address of the first node of a link pair.
pub const NODE_00_ADDR: u16 = 0x1234;

/// Well-known address of the second node of a link pair.
pub const NODE_01_ADDR: u16 = 0x5678;
