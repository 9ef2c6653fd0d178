use super::{Diagnostics, SessionConfig, Timeout, packet_count};
use crate::consts::SCPL;
use crate::error::{ConfigError, SessionError};
use crate::fmt::{debug, info, trace, warn};
use crate::frame::{Body, CommandKind, Message, RawFrame};
use crate::link::Link;
use crate::table::{LostIds, ReportBytes};
use embedded_hal::delay::DelayNs;
use heapless::Vec;

/// States of the sending side of a session.
#[derive(PartialEq, Eq, Clone, Copy, Default, Debug)]
#[cfg_attr(feature = "defmt-0-3", derive(defmt::Format))]
pub enum SenderState {
    /// Probing the receiver.
    #[default]
    Ping,
    /// Negotiating frame length, packet length and packet count.
    Config,
    /// Announcing the start of bulk transfer.
    Start,
    /// Pushing the next window of packets.
    Send,
    /// Asking for the loss table of the last window.
    Check,
    /// Retransmitting the packets the last report marked missing.
    Resend,
    /// Closing the session.
    End,
    /// Done.
    Halt,
}

/// Sending side of one session.
///
/// Owns (or borrows, through `B`) the frame being sent and drives
/// PING, CONFIG, START, then SEND/CHECK/RESEND rounds until every packet is
/// confirmed, then END.
///
/// # Example
/// ```rust,no_run
/// # use sarlink::link::{Link, RawFrame};
/// # struct Radio;
/// # impl Link for Radio {
/// #     type Error = ();
/// #     fn send_frame(&mut self, _: &[u8]) -> Result<(), ()> { Ok(()) }
/// #     fn frame_ready(&mut self) -> bool { false }
/// #     fn read_frame(&mut self) -> nb::Result<RawFrame, ()> { Err(nb::Error::WouldBlock) }
/// # }
/// # let mut radio = Radio;
/// # let mut delay = embedded_hal_mock::eh1::delay::NoopDelay::new();
/// use sarlink::session::{SessionConfig, Sender};
///
/// let image = [0u8; 1000];
/// let mut sender = Sender::new(SessionConfig::between(0x1234, 0x5678), &image[..]).unwrap();
/// match sender.run(&mut radio, &mut delay) {
///     Ok(()) => {}
///     Err(e) if e.is_timeout() => { /* receiver went away */ }
///     Err(_) => {}
/// }
/// ```
#[derive(Debug)]
pub struct Sender<B> {
    config: SessionConfig,
    data: B,
    state: SenderState,
    frame_length: u16,
    num_of_packet: u16,
    window: u16,
    send_pktid: u16,
    chk_start: u16,
    chk_end: u16,
    update: u16,
    loss: ReportBytes,
    timeout: Timeout,
    diagnostics: Diagnostics,
}

impl<B: AsRef<[u8]>> Sender<B> {
    /// Prepares a session sending `data`.
    ///
    /// # Errors
    /// * [`ConfigError`] if `data` is empty or longer than 65535 bytes, or the
    ///   configuration cannot be put on the wire
    pub fn new(config: SessionConfig, data: B) -> Result<Self, ConfigError> {
        config.validate()?;
        let len = data.as_ref().len();
        if len == 0 {
            return Err(ConfigError::EmptyFrame);
        }
        let frame_length = u16::try_from(len).map_err(|_| ConfigError::FrameTooLarge(len))?;
        Ok(Sender {
            config,
            data,
            state: SenderState::Ping,
            frame_length,
            num_of_packet: packet_count(frame_length, config.packet_length),
            window: config.window_size,
            send_pktid: 0,
            chk_start: 0,
            chk_end: 0,
            update: 0,
            loss: ReportBytes::new(),
            timeout: Timeout::new(config.timeout_us),
            diagnostics: Diagnostics::default(),
        })
    }

    /// Current state.
    pub fn state(&self) -> SenderState {
        self.state
    }

    /// Bytes in the frame.
    pub fn frame_length(&self) -> u16 {
        self.frame_length
    }

    /// Packets the frame is split into.
    pub fn num_of_packet(&self) -> u16 {
        self.num_of_packet
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
        self.data
    }

    /// Runs the session to completion.
    ///
    /// # Errors
    /// * [`SessionError::TimedOut`] once the cumulative timeout is reached
    /// * [`SessionError::Link`] if the link fails
    pub fn run<L: Link, D: DelayNs>(
        &mut self,
        link: &mut L,
        delay: &mut D,
    ) -> Result<(), SessionError<L::Error>> {
        while self.state != SenderState::Halt {
            if let Err(e) = self.step(link, delay) {
                if let SessionError::TimedOut { elapsed_us } = e {
                    warn!("sender: timed out in {:?} after {} us", self.state, elapsed_us);
                }
                return Err(e);
            }
        }
        Ok(())
    }

    /// Executes the current state once and returns the next one.
    pub fn step<L: Link, D: DelayNs>(
        &mut self,
        link: &mut L,
        delay: &mut D,
    ) -> Result<SenderState, SessionError<L::Error>> {
        let next = match self.state {
            SenderState::Ping => {
                let _ = self.exchange(link, delay, Body::Ping, |_| true)?;
                SenderState::Config
            }
            SenderState::Config => {
                let expected = Body::Config {
                    frame_length: self.frame_length,
                    packet_length: self.config.packet_length,
                    num_of_packet: self.num_of_packet,
                };
                let _ = self.exchange(link, delay, expected, |body| *body == expected)?;
                SenderState::Start
            }
            SenderState::Start => {
                let _ = self.exchange(link, delay, Body::Start, |_| true)?;
                SenderState::Send
            }
            SenderState::Send => self.send_window(link, delay)?,
            SenderState::Check => self.check_window(link, delay)?,
            SenderState::Resend => {
                let loss = self.loss.clone();
                let (update, start, end) = (self.update, self.chk_start, self.chk_end);
                for id in LostIds::new(update, &loss, end).filter(|id| *id >= start) {
                    trace!("sender: resend packet {}", id);
                    self.send_packet(link, delay, id)?;
                    self.diagnostics.retransmitted += 1;
                }
                SenderState::Check
            }
            SenderState::End => {
                let _ = self.exchange(link, delay, Body::End, |_| true)?;
                SenderState::Halt
            }
            SenderState::Halt => SenderState::Halt,
        };
        if next != self.state {
            info!("sender: {:?} -> {:?}", self.state, next);
        }
        self.state = next;
        Ok(next)
    }

    fn send_window<L: Link, D: DelayNs>(
        &mut self,
        link: &mut L,
        delay: &mut D,
    ) -> Result<SenderState, SessionError<L::Error>> {
        if self.send_pktid >= self.num_of_packet {
            return Ok(SenderState::End);
        }
        self.window = self
            .config
            .window_size
            .min(self.num_of_packet - self.send_pktid);
        self.chk_start = self.send_pktid;
        self.chk_end = self.send_pktid + self.window;
        debug!(
            "sender: window [{}, {}) of {}",
            self.chk_start, self.chk_end, self.num_of_packet
        );
        for id in self.chk_start..self.chk_end {
            self.send_packet(link, delay, id)?;
        }
        if self.config.use_check {
            Ok(SenderState::Check)
        } else {
            self.send_pktid = self.chk_end;
            Ok(SenderState::Send)
        }
    }

    fn check_window<L: Link, D: DelayNs>(
        &mut self,
        link: &mut L,
        delay: &mut D,
    ) -> Result<SenderState, SessionError<L::Error>> {
        let (start, end) = (self.chk_start, self.chk_end);
        let max_length = self.window.div_ceil(8);
        let raw = self.exchange(link, delay, Body::Check { start, end }, move |body| {
            matches!(
                *body,
                Body::CheckReport { update, length, table }
                    if update >= start
                        && update <= end
                        && length <= max_length
                        && table.len() == usize::from(length)
                        // an empty report closes exactly this window
                        && (length > 0 || update == end)
            )
        })?;

        self.loss.clear();
        if let Ok(Message {
            body: Body::CheckReport { update, table, .. },
            ..
        }) = Message::decode(&raw)
        {
            self.update = update;
            let _ = self.loss.extend_from_slice(table);
        }

        if self.loss.is_empty() {
            self.send_pktid = end;
            Ok(SenderState::Send)
        } else {
            debug!(
                "sender: {} loss bytes from packet {}",
                self.loss.len(),
                self.update
            );
            Ok(SenderState::Resend)
        }
    }

    fn send_packet<L: Link, D: DelayNs>(
        &mut self,
        link: &mut L,
        delay: &mut D,
        id: u16,
    ) -> Result<(), SessionError<L::Error>> {
        let packet_length = usize::from(self.config.packet_length);
        let data = self.data.as_ref();
        let start = usize::from(id) * packet_length;
        let end = (start + packet_length).min(data.len());

        let mut payload: Vec<u8, { SCPL as usize }> = Vec::new();
        let _ = payload.extend_from_slice(&data[start..end]);
        let _ = payload.resize(packet_length, 0);

        let frame = Message::request(
            self.config.local_addr,
            self.config.peer_addr,
            Body::send(id, &payload),
        )
        .encode()?;
        link.send_frame(&frame).map_err(SessionError::Link)?;
        if self.config.send_delay_us > 0 {
            delay.delay_us(self.config.send_delay_us);
        }
        Ok(())
    }

    /// Sends `body` and polls until an acknowledgement accepted by `accept`
    /// arrives, repeating the command every resend interval.
    fn exchange<L, D, F>(
        &mut self,
        link: &mut L,
        delay: &mut D,
        body: Body<'_>,
        accept: F,
    ) -> Result<RawFrame, SessionError<L::Error>>
    where
        L: Link,
        D: DelayNs,
        F: Fn(&Body<'_>) -> bool,
    {
        let kind = body.kind();
        let frame =
            Message::request(self.config.local_addr, self.config.peer_addr, body).encode()?;
        link.send_frame(&frame).map_err(SessionError::Link)?;

        let mut waited = 0u32;
        loop {
            delay.delay_us(self.config.send_poll_us);
            waited = waited.saturating_add(self.config.send_poll_us);

            if link.frame_ready() {
                match link.read_frame() {
                    Ok(raw) => {
                        if self.is_expected_ack(&raw, kind, &accept) {
                            self.timeout.reset();
                            return Ok(raw);
                        }
                    }
                    Err(nb::Error::WouldBlock) => {}
                    Err(nb::Error::Other(e)) => return Err(SessionError::Link(e)),
                }
            }

            self.timeout.charge(self.config.send_poll_charge_us)?;
            if waited >= self.config.resend_interval_us {
                trace!("sender: repeat {:?}", kind);
                self.diagnostics.command_resends += 1;
                link.send_frame(&frame).map_err(SessionError::Link)?;
                waited = 0;
            }
        }
    }

    fn is_expected_ack<F>(&mut self, raw: &[u8], kind: CommandKind, accept: &F) -> bool
    where
        F: Fn(&Body<'_>) -> bool,
    {
        let (local, peer) = (self.config.local_addr, self.config.peer_addr);
        match Message::decode(raw) {
            Err(_) => {
                self.diagnostics.malformed_frames += 1;
                false
            }
            Ok(msg) if msg.answers(kind, local, peer) => {
                if accept(&msg.body) {
                    true
                } else {
                    warn!("sender: {:?} acknowledgement failed validation", kind);
                    self.diagnostics.stale_acks += 1;
                    false
                }
            }
            Ok(msg) if msg.src != peer || msg.dst != local => {
                self.diagnostics.foreign_address += 1;
                false
            }
            Ok(_) => {
                self.diagnostics.stale_acks += 1;
                false
            }
        }
    }
}
