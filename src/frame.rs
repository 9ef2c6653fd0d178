//! Session command codec.
//!
//! Every session command travels as one link frame with the layout
//!
//! ```text
//! 0     length byte: bytes after it, plus the FCS the link appends
//! 1     header: bit 7 ACK flag, bits 5..3 command tag, bits 2..0 param count
//! 2..3  source address (big-endian)
//! 4..5  destination address (big-endian)
//! 6..   16-bit parameters (big-endian), then the command body
//! ```
//!
//! SEND frames carry `packet_length` payload bytes after the packet ID
//! parameter, followed by a second copy of the packet ID. CHECK
//! acknowledgements carry the reported loss-table bytes after their two
//! parameters.
//!
//! The codec does not cross-check the header's parameter-count field against
//! the command body on encode; [`Message::encode`] always writes the code that
//! matches the [`Body`] variant.

use crate::consts::{
    ACK_FLAG, CHECK_PARAMS, CMD_PREFIX_MASK, CONFIG_PARAMS, FCS_LEN, LINK_MTU, PARAM_COUNT_MASK,
    PARAM_OFFSET, SEND_PARAMS,
};
use crate::error::FrameError;
use heapless::Vec;

/// Raw link frame: the length byte followed by the frame body.
pub type RawFrame = Vec<u8, { LINK_MTU + 1 }>;

/// The six session commands, identified by the tag bits of the header.
#[derive(PartialEq, Eq, Clone, Copy, Debug)]
#[cfg_attr(feature = "defmt-0-3", derive(defmt::Format))]
pub enum CommandKind {
    /// Liveness probe that opens a session.
    Ping,
    /// Carries frame length, packet length and packet count.
    Config,
    /// Marks the beginning of bulk transfer.
    Start,
    /// Closes the session.
    End,
    /// One data packet.
    Send,
    /// Loss-table query and report.
    Check,
}

impl CommandKind {
    /// Header tag bits of this command.
    pub const fn tag(self) -> u8 {
        match self {
            CommandKind::Ping => 0x00,
            CommandKind::Config => 0x08,
            CommandKind::Start => 0x10,
            CommandKind::End => 0x18,
            CommandKind::Send => 0x20,
            CommandKind::Check => 0x28,
        }
    }

    /// Decodes the tag bits of a header byte.
    pub fn from_header(header: u8) -> Result<Self, FrameError> {
        match header & CMD_PREFIX_MASK {
            0x00 => Ok(CommandKind::Ping),
            0x08 => Ok(CommandKind::Config),
            0x10 => Ok(CommandKind::Start),
            0x18 => Ok(CommandKind::End),
            0x20 => Ok(CommandKind::Send),
            0x28 => Ok(CommandKind::Check),
            other => Err(FrameError::UnknownCommand(other)),
        }
    }
}

/// Command-specific content of a [`Message`].
#[derive(PartialEq, Eq, Clone, Copy, Debug)]
pub enum Body<'a> {
    /// PING, request or acknowledgement.
    Ping,
    /// START, request or acknowledgement.
    Start,
    /// END, request or acknowledgement.
    End,
    /// CONFIG parameters; the acknowledgement echoes them.
    Config {
        /// Bytes in the frame being transferred.
        frame_length: u16,
        /// Payload bytes per SEND packet.
        packet_length: u16,
        /// `ceil(frame_length / packet_length)`.
        num_of_packet: u16,
    },
    /// One data packet.
    Send {
        /// Index of this packet within the frame.
        packet_id: u16,
        /// `packet_length` bytes of frame data.
        payload: &'a [u8],
        /// Trailing copy of `packet_id` used to reject corrupted parameters.
        echo: u16,
    },
    /// Sender's loss query over the packet range `[start, end)`.
    Check {
        /// First packet of the checked range.
        start: u16,
        /// One past the last packet of the checked range.
        end: u16,
    },
    /// Receiver's loss report, sent as the CHECK acknowledgement.
    CheckReport {
        /// Packet ID matching bit 0 of `table`.
        update: u16,
        /// Number of table bytes that follow.
        length: u16,
        /// Reported bitmap, one bit per packet, set when received.
        table: &'a [u8],
    },
}

impl<'a> Body<'a> {
    /// A SEND body whose echo matches its packet ID.
    pub fn send(packet_id: u16, payload: &'a [u8]) -> Self {
        Body::Send {
            packet_id,
            payload,
            echo: packet_id,
        }
    }

    /// The command this body belongs to.
    pub fn kind(&self) -> CommandKind {
        match self {
            Body::Ping => CommandKind::Ping,
            Body::Start => CommandKind::Start,
            Body::End => CommandKind::End,
            Body::Config { .. } => CommandKind::Config,
            Body::Send { .. } => CommandKind::Send,
            Body::Check { .. } | Body::CheckReport { .. } => CommandKind::Check,
        }
    }

    fn param_code(&self) -> u8 {
        match self {
            Body::Ping | Body::Start | Body::End => 0,
            Body::Config { .. } => CONFIG_PARAMS,
            Body::Send { .. } => SEND_PARAMS,
            Body::Check { .. } | Body::CheckReport { .. } => CHECK_PARAMS,
        }
    }
}

/// A decoded or to-be-encoded session command.
#[derive(PartialEq, Eq, Clone, Copy, Debug)]
pub struct Message<'a> {
    /// Whether this is an acknowledgement.
    pub ack: bool,
    /// Sender of this message.
    pub src: u16,
    /// Intended recipient of this message.
    pub dst: u16,
    /// Command content.
    pub body: Body<'a>,
}

impl<'a> Message<'a> {
    /// A request from `src` to `dst`.
    pub fn request(src: u16, dst: u16, body: Body<'a>) -> Self {
        Message {
            ack: false,
            src,
            dst,
            body,
        }
    }

    /// An acknowledgement from `src` to `dst`.
    pub fn ack(src: u16, dst: u16, body: Body<'a>) -> Self {
        Message {
            ack: true,
            src,
            dst,
            body,
        }
    }

    /// The command tag of this message.
    pub fn kind(&self) -> CommandKind {
        self.body.kind()
    }

    /// The header byte this message encodes to.
    pub fn header(&self) -> u8 {
        let ack = if self.ack { ACK_FLAG } else { 0 };
        ack | self.kind().tag() | self.body.param_code()
    }

    /// Whether `self` answers a request of `kind` sent from `local` to `peer`.
    pub fn answers(&self, kind: CommandKind, local: u16, peer: u16) -> bool {
        self.ack && self.src == peer && self.dst == local && self.kind() == kind
    }

    /// Serializes the message into a link frame.
    ///
    /// # Returns
    /// * The encoded frame, length byte first
    ///
    /// # Errors
    /// * [`FrameError::TooLong`] if the encoded command exceeds the link MTU
    pub fn encode(&self) -> Result<RawFrame, FrameError> {
        let mut out = RawFrame::new();
        push(&mut out, &[0, self.header()])?;
        push(&mut out, &self.src.to_be_bytes())?;
        push(&mut out, &self.dst.to_be_bytes())?;
        match self.body {
            Body::Ping | Body::Start | Body::End => {}
            Body::Config {
                frame_length,
                packet_length,
                num_of_packet,
            } => {
                push(&mut out, &frame_length.to_be_bytes())?;
                push(&mut out, &packet_length.to_be_bytes())?;
                push(&mut out, &num_of_packet.to_be_bytes())?;
            }
            Body::Send {
                packet_id,
                payload,
                echo,
            } => {
                push(&mut out, &packet_id.to_be_bytes())?;
                push(&mut out, payload)?;
                push(&mut out, &echo.to_be_bytes())?;
            }
            Body::Check { start, end } => {
                push(&mut out, &start.to_be_bytes())?;
                push(&mut out, &end.to_be_bytes())?;
            }
            Body::CheckReport {
                update,
                length,
                table,
            } => {
                push(&mut out, &update.to_be_bytes())?;
                push(&mut out, &length.to_be_bytes())?;
                push(&mut out, table)?;
            }
        }
        let length = out.len() - 1 + FCS_LEN;
        if length > LINK_MTU {
            return Err(FrameError::TooLong);
        }
        out[0] = length as u8;
        Ok(out)
    }

    /// Parses a link frame whose first byte is the length byte.
    ///
    /// Bytes beyond the announced length (a trailing FCS, for instance) are
    /// ignored.
    ///
    /// # Errors
    /// * [`FrameError::BadLength`] if the length byte cannot cover the FCS
    /// * [`FrameError::TooShort`] if the buffer ends before the announced
    ///   length or before the command's parameters
    /// * [`FrameError::UnknownCommand`] for unassigned tag bits
    pub fn decode(raw: &'a [u8]) -> Result<Message<'a>, FrameError> {
        let length = *raw.first().ok_or(FrameError::TooShort { needed: 1, got: 0 })?;
        let body_len = usize::from(length)
            .checked_sub(FCS_LEN)
            .ok_or(FrameError::BadLength(length))?;
        let end = 1 + body_len;
        if raw.len() < end {
            return Err(FrameError::TooShort {
                needed: end,
                got: raw.len(),
            });
        }
        let cmd = &raw[1..end];
        need(cmd, PARAM_OFFSET)?;
        let header = cmd[0];
        let kind = CommandKind::from_header(header)?;
        let ack = header & ACK_FLAG != 0;
        let src = be16(cmd, 1);
        let dst = be16(cmd, 3);
        let params = usize::from(header & PARAM_COUNT_MASK) * 2;
        need(cmd, PARAM_OFFSET + params)?;

        let body = match kind {
            CommandKind::Ping => Body::Ping,
            CommandKind::Start => Body::Start,
            CommandKind::End => Body::End,
            CommandKind::Config => {
                need(cmd, PARAM_OFFSET + 6)?;
                Body::Config {
                    frame_length: be16(cmd, PARAM_OFFSET),
                    packet_length: be16(cmd, PARAM_OFFSET + 2),
                    num_of_packet: be16(cmd, PARAM_OFFSET + 4),
                }
            }
            CommandKind::Send => {
                need(cmd, PARAM_OFFSET + 4)?;
                let echo_at = cmd.len() - 2;
                Body::Send {
                    packet_id: be16(cmd, PARAM_OFFSET),
                    payload: &cmd[PARAM_OFFSET + 2..echo_at],
                    echo: be16(cmd, echo_at),
                }
            }
            CommandKind::Check => {
                need(cmd, PARAM_OFFSET + 4)?;
                let first = be16(cmd, PARAM_OFFSET);
                let second = be16(cmd, PARAM_OFFSET + 2);
                if ack {
                    let table = &cmd[PARAM_OFFSET + 4..];
                    Body::CheckReport {
                        update: first,
                        length: second,
                        table: &table[..table.len().min(usize::from(second))],
                    }
                } else {
                    Body::Check {
                        start: first,
                        end: second,
                    }
                }
            }
        };

        Ok(Message {
            ack,
            src,
            dst,
            body,
        })
    }
}

/// Reads the source and destination addresses of a raw frame without decoding
/// the rest of it.
pub fn peek_addresses(raw: &[u8]) -> Option<(u16, u16)> {
    if raw.len() < 1 + PARAM_OFFSET {
        return None;
    }
    Some((be16(raw, 2), be16(raw, 4)))
}

fn push(out: &mut RawFrame, bytes: &[u8]) -> Result<(), FrameError> {
    out.extend_from_slice(bytes).map_err(|_| FrameError::TooLong)
}

fn need(cmd: &[u8], needed: usize) -> Result<(), FrameError> {
    if cmd.len() < needed {
        Err(FrameError::TooShort {
            needed: needed + 1,
            got: cmd.len() + 1,
        })
    } else {
        Ok(())
    }
}

fn be16(buf: &[u8], at: usize) -> u16 {
    u16::from_be_bytes([buf[at], buf[at + 1]])
}
