use super::{Diagnostics, SessionConfig, Timeout, packet_count};
use crate::consts::SCPL;
use crate::error::{ConfigError, SessionError};
use crate::fmt::{debug, info, trace, warn};
use crate::frame::{Body, CommandKind, Message};
use crate::link::Link;
use crate::table::{LossTable, Mark};
use embedded_hal::delay::DelayNs;

/// Last command the receiving side accepted.
///
/// A command is only accepted while the receiver sits in one of the states
/// that may legally precede it; repeats of the current command are accepted
/// again and re-acknowledged.
#[derive(PartialEq, Eq, Clone, Copy, Default, Debug)]
#[cfg_attr(feature = "defmt-0-3", derive(defmt::Format))]
pub enum ReceiverState {
    /// Waiting for (or answered) PING.
    #[default]
    Ping,
    /// CONFIG accepted.
    Config,
    /// START accepted.
    Start,
    /// Receiving data packets.
    Send,
    /// Answered a CHECK.
    Check,
    /// END acknowledged; the frame is complete.
    Halt,
}

/// Receiving side of one session.
///
/// Data packets are written straight into the caller's buffer `B` at
/// `packet_id * packet_length`. The receiver never acknowledges a data packet;
/// losses are reported in the CHECK acknowledgement.
#[derive(Debug)]
pub struct Receiver<B> {
    config: SessionConfig,
    buffer: B,
    state: ReceiverState,
    frame_length: u16,
    packet_length: u16,
    num_of_packet: u16,
    table: LossTable,
    timeout: Timeout,
    peer_confirmed: bool,
    diagnostics: Diagnostics,
}

impl<B> Receiver<B>
where
    B: AsRef<[u8]> + AsMut<[u8]>,
{
    /// Prepares a session receiving into `buffer`.
    ///
    /// The buffer bounds the frame length a CONFIG may announce.
    pub fn new(config: SessionConfig, buffer: B) -> Result<Self, ConfigError> {
        config.validate()?;
        Ok(Receiver {
            config,
            buffer,
            state: ReceiverState::Ping,
            frame_length: 0,
            packet_length: 0,
            num_of_packet: 0,
            table: LossTable::new(),
            timeout: Timeout::new(config.timeout_us),
            peer_confirmed: false,
            diagnostics: Diagnostics::default(),
        })
    }

    /// Current state.
    pub fn state(&self) -> ReceiverState {
        self.state
    }

    /// Whether END has been acknowledged.
    pub fn is_complete(&self) -> bool {
        self.state == ReceiverState::Halt
    }

    /// Whether the peer opened this session with PING.
    ///
    /// A peer only starts a new session after its previous END was
    /// acknowledged, so this also confirms the previous session's END
    /// round-tripped.
    pub fn peer_confirmed(&self) -> bool {
        self.peer_confirmed
    }

    /// Frame length announced by CONFIG (0 before CONFIG).
    pub fn frame_length(&self) -> u16 {
        self.frame_length
    }

    /// Packet length announced by CONFIG.
    pub fn packet_length(&self) -> u16 {
        self.packet_length
    }

    /// Packet count announced by CONFIG.
    pub fn num_of_packet(&self) -> u16 {
        self.num_of_packet
    }

    /// The received frame so far.
    pub fn data(&self) -> &[u8] {
        &self.buffer.as_ref()[..usize::from(self.frame_length)]
    }

    /// The loss table.
    pub fn table(&self) -> &LossTable {
        &self.table
    }

    /// The timeout accumulator.
    pub fn timeout(&self) -> &Timeout {
        &self.timeout
    }

    /// Counters collected so far.
    pub fn diagnostics(&self) -> &Diagnostics {
        &self.diagnostics
    }

    /// Returns the frame buffer.
    pub fn into_inner(self) -> B {
        self.buffer
    }

    /// Polls until END has been acknowledged.
    ///
    /// # Errors
    /// * [`SessionError::TimedOut`] once the cumulative timeout is reached
    /// * [`SessionError::Link`] if the link fails
    pub fn run<L: Link, D: DelayNs>(
        &mut self,
        link: &mut L,
        delay: &mut D,
    ) -> Result<(), SessionError<L::Error>> {
        while self.state != ReceiverState::Halt {
            if let Err(e) = self.poll(link, delay) {
                if let SessionError::TimedOut { elapsed_us } = e {
                    warn!(
                        "receiver: timed out in {:?} after {} us",
                        self.state, elapsed_us
                    );
                }
                return Err(e);
            }
        }
        Ok(())
    }

    /// Handles one waiting frame, or sleeps one idle quantum if there is none.
    pub fn poll<L: Link, D: DelayNs>(
        &mut self,
        link: &mut L,
        delay: &mut D,
    ) -> Result<ReceiverState, SessionError<L::Error>> {
        if link.frame_ready() {
            match link.read_frame() {
                Ok(raw) => return self.handle_frame(link, &raw),
                Err(nb::Error::WouldBlock) => {}
                Err(nb::Error::Other(e)) => return Err(SessionError::Link(e)),
            }
        }
        delay.delay_us(self.config.recv_poll_us);
        self.timeout.charge(self.config.recv_poll_us)?;
        Ok(self.state)
    }

    /// Applies one inbound frame and sends the acknowledgement it calls for.
    ///
    /// Frames that do not decode, belong to another address pair, or are not
    /// legal in the current state are counted in [`Diagnostics`] and dropped.
    pub fn handle_frame<L: Link>(
        &mut self,
        link: &mut L,
        raw: &[u8],
    ) -> Result<ReceiverState, SessionError<L::Error>> {
        let msg = match Message::decode(raw) {
            Ok(msg) => msg,
            Err(_) => {
                self.diagnostics.malformed_frames += 1;
                return Ok(self.state);
            }
        };
        if msg.src != self.config.peer_addr || msg.dst != self.config.local_addr {
            self.diagnostics.foreign_address += 1;
            return Ok(self.state);
        }
        self.timeout.reset();
        if msg.ack || !self.accepts(msg.kind()) {
            debug!("receiver: dropped {:?} in {:?}", msg.kind(), self.state);
            self.diagnostics.rejected_commands += 1;
            return Ok(self.state);
        }

        let prev = self.state;
        match msg.body {
            Body::Send {
                packet_id,
                payload,
                echo,
            } => self.apply_packet(packet_id, payload, echo),
            Body::Ping => {
                self.peer_confirmed = true;
                self.acknowledge(link, Body::Ping)?;
                self.state = ReceiverState::Ping;
            }
            Body::Config {
                frame_length,
                packet_length,
                num_of_packet,
            } => {
                if !self.fits(frame_length, packet_length, num_of_packet) {
                    warn!(
                        "receiver: CONFIG ({}, {}, {}) rejected",
                        frame_length, packet_length, num_of_packet
                    );
                    self.diagnostics.rejected_commands += 1;
                    return Ok(self.state);
                }
                self.frame_length = frame_length;
                self.packet_length = packet_length;
                self.num_of_packet = num_of_packet;
                self.table.reset(0);
                self.acknowledge(link, msg.body)?;
                self.state = ReceiverState::Config;
            }
            Body::Start => {
                self.acknowledge(link, Body::Start)?;
                self.state = ReceiverState::Start;
            }
            Body::Check { start, end } => {
                let Some(report) = self.table.check_loss(start, end, self.num_of_packet) else {
                    warn!("receiver: CHECK [{}, {}) rejected", start, end);
                    self.diagnostics.rejected_commands += 1;
                    return Ok(self.state);
                };
                debug!(
                    "receiver: CHECK [{}, {}) -> update {} length {}",
                    start,
                    end,
                    report.update,
                    report.length()
                );
                self.acknowledge(
                    link,
                    Body::CheckReport {
                        update: report.update,
                        length: report.length(),
                        table: &report.table,
                    },
                )?;
                self.state = ReceiverState::Check;
            }
            Body::End => {
                self.acknowledge(link, Body::End)?;
                self.state = ReceiverState::Halt;
            }
            Body::CheckReport { .. } => {
                self.diagnostics.rejected_commands += 1;
            }
        }
        if prev != self.state {
            info!("receiver: {:?} -> {:?}", prev, self.state);
        }
        Ok(self.state)
    }

    /// Sends the END acknowledgement `repeats` times, `spacing_us` apart.
    ///
    /// Used after the last session of a transfer, when no following PING will
    /// tell whether the sender saw the original acknowledgement.
    pub fn repeat_end_ack<L: Link, D: DelayNs>(
        &self,
        link: &mut L,
        delay: &mut D,
        repeats: u8,
        spacing_us: u32,
    ) -> Result<(), SessionError<L::Error>> {
        for _ in 0..repeats {
            self.acknowledge(link, Body::End)?;
            delay.delay_us(spacing_us);
        }
        Ok(())
    }

    fn accepts(&self, kind: CommandKind) -> bool {
        use ReceiverState::*;
        match kind {
            CommandKind::Ping => matches!(self.state, Ping),
            CommandKind::Config => matches!(self.state, Ping | Config),
            CommandKind::Start => matches!(self.state, Config | Start),
            CommandKind::Send | CommandKind::Check => matches!(self.state, Start | Send | Check),
            CommandKind::End if self.config.use_check => {
                matches!(self.state, Check | Ping | Halt)
            }
            CommandKind::End => matches!(self.state, Start | Send | Ping | Halt),
        }
    }

    fn fits(&self, frame_length: u16, packet_length: u16, num_of_packet: u16) -> bool {
        frame_length > 0
            && usize::from(frame_length) <= self.buffer.as_ref().len()
            && (1..=SCPL).contains(&packet_length)
            && num_of_packet == packet_count(frame_length, packet_length)
    }

    fn apply_packet(&mut self, packet_id: u16, payload: &[u8], echo: u16) {
        self.state = ReceiverState::Send;
        if echo != packet_id {
            warn!("receiver: packet id {} echoed as {}", packet_id, echo);
            self.diagnostics.id_mismatch += 1;
            return;
        }
        if payload.len() != usize::from(self.packet_length) {
            warn!(
                "receiver: packet {} carries {} bytes, expected {}",
                packet_id,
                payload.len(),
                self.packet_length
            );
            self.diagnostics.malformed_frames += 1;
            return;
        }
        if packet_id >= self.num_of_packet {
            self.diagnostics.out_of_window += 1;
            return;
        }
        match self.table.mark(packet_id) {
            Mark::New => {
                let offset = usize::from(packet_id) * usize::from(self.packet_length);
                let n = payload.len().min(usize::from(self.frame_length) - offset);
                self.buffer.as_mut()[offset..offset + n].copy_from_slice(&payload[..n]);
                trace!("receiver: packet {} applied", packet_id);
            }
            Mark::Duplicate => self.diagnostics.duplicate_packets += 1,
            Mark::OutOfWindow => self.diagnostics.out_of_window += 1,
        }
    }

    fn acknowledge<L: Link>(&self, link: &mut L, body: Body<'_>) -> Result<(), SessionError<L::Error>> {
        let frame = Message::ack(self.config.local_addr, self.config.peer_addr, body).encode()?;
        link.send_frame(&frame).map_err(SessionError::Link)
    }
}
