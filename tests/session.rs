use embedded_hal_mock::eh1::delay::NoopDelay;
use sarlink::error::SessionError;
use sarlink::frame::{Body, CommandKind, Message};
use sarlink::link::{Link, RawFrame};
use sarlink::session::{Receiver, ReceiverState, Sender, SenderState, SessionConfig};
use std::collections::{HashSet, VecDeque};

const SENDER: u16 = 0x1234;
const RECEIVER: u16 = 0x5678;

#[derive(Default)]
struct Mailbox {
    frames: VecDeque<RawFrame>,
}

impl Link for Mailbox {
    type Error = ();

    fn send_frame(&mut self, frame: &[u8]) -> Result<(), ()> {
        self.frames.push_back(RawFrame::from_slice(frame).unwrap());
        Ok(())
    }

    fn frame_ready(&mut self) -> bool {
        !self.frames.is_empty()
    }

    fn read_frame(&mut self) -> nb::Result<RawFrame, ()> {
        self.frames.pop_front().ok_or(nb::Error::WouldBlock)
    }
}

/// A link whose peer never answers; inbound frames are scripted.
#[derive(Default)]
struct Silent {
    sent: usize,
    inbound: VecDeque<RawFrame>,
}

impl Link for Silent {
    type Error = ();

    fn send_frame(&mut self, _frame: &[u8]) -> Result<(), ()> {
        self.sent += 1;
        Ok(())
    }

    fn frame_ready(&mut self) -> bool {
        !self.inbound.is_empty()
    }

    fn read_frame(&mut self) -> nb::Result<RawFrame, ()> {
        self.inbound.pop_front().ok_or(nb::Error::WouldBlock)
    }
}

type LossRule = Box<dyn FnMut(&Message<'_>) -> bool>;
type ReplyRewrite = Box<dyn FnMut(&Message<'_>) -> Option<RawFrame>>;

/// The sender's side of an in-process radio: every frame is handed straight
/// to the receiver unless a loss rule eats it, and the receiver's answers
/// queue up for the sender, possibly rewritten on the way.
struct Loopback {
    receiver: Receiver<Vec<u8>>,
    replies: Mailbox,
    lose_request: LossRule,
    lose_reply: LossRule,
    rewrite_reply: ReplyRewrite,
    requests: Vec<CommandKind>,
    configs: Vec<(u16, u16, u16)>,
}

impl Loopback {
    fn new(buffer_len: usize) -> Self {
        let config = SessionConfig::between(RECEIVER, SENDER);
        Loopback {
            receiver: Receiver::new(config, vec![0u8; buffer_len]).unwrap(),
            replies: Mailbox::default(),
            lose_request: Box::new(|_: &Message<'_>| false),
            lose_reply: Box::new(|_: &Message<'_>| false),
            rewrite_reply: Box::new(|_: &Message<'_>| None),
            requests: Vec::new(),
            configs: Vec::new(),
        }
    }
}

impl Link for Loopback {
    type Error = ();

    fn send_frame(&mut self, frame: &[u8]) -> Result<(), ()> {
        let msg = Message::decode(frame).unwrap();
        self.requests.push(msg.kind());
        if let Body::Config {
            frame_length,
            packet_length,
            num_of_packet,
        } = msg.body
        {
            self.configs.push((frame_length, packet_length, num_of_packet));
        }
        if (self.lose_request)(&msg) {
            return Ok(());
        }

        let mut answers = Mailbox::default();
        let _ = self.receiver.handle_frame(&mut answers, frame).unwrap();
        for answer in answers.frames {
            let reply = Message::decode(&answer).unwrap();
            if (self.lose_reply)(&reply) {
                continue;
            }
            let rewritten = (self.rewrite_reply)(&reply);
            self.replies.frames.push_back(rewritten.unwrap_or(answer));
        }
        Ok(())
    }

    fn frame_ready(&mut self) -> bool {
        self.replies.frame_ready()
    }

    fn read_frame(&mut self) -> nb::Result<RawFrame, ()> {
        self.replies.read_frame()
    }
}

fn image(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i * 7 + 3) as u8).collect()
}

#[test]
fn test_transfer_recovers_lost_packets() {
    let data = image(1000);
    let mut link = Loopback::new(2048);
    let mut dropped = HashSet::new();
    link.lose_request = Box::new(move |msg: &Message<'_>| match msg.body {
        Body::Send { packet_id, .. } if packet_id % 4 == 0 => dropped.insert(packet_id),
        _ => false,
    });

    let mut sender = Sender::new(SessionConfig::between(SENDER, RECEIVER), &data[..]).unwrap();
    sender.run(&mut link, &mut NoopDelay::new()).unwrap();

    assert_eq!(sender.state(), SenderState::Halt);
    assert_eq!(sender.num_of_packet(), 9);
    assert_eq!(sender.diagnostics().retransmitted, 3);
    assert_eq!(link.configs, [(1000, 115, 9)]);
    assert_eq!(link.receiver.state(), ReceiverState::Halt);
    assert_eq!(link.receiver.data(), &data[..]);
    assert_eq!(link.requests.first(), Some(&CommandKind::Ping));
    assert_eq!(link.requests.last(), Some(&CommandKind::End));
}

#[test]
fn test_lost_config_ack_is_resent() {
    let data = image(300);
    let mut link = Loopback::new(1024);
    let mut lost = false;
    link.lose_reply = Box::new(move |msg: &Message<'_>| {
        if msg.kind() == CommandKind::Config && !lost {
            lost = true;
            return true;
        }
        false
    });

    let mut sender = Sender::new(SessionConfig::between(SENDER, RECEIVER), &data[..]).unwrap();
    sender.run(&mut link, &mut NoopDelay::new()).unwrap();

    assert_eq!(sender.diagnostics().command_resends, 1);
    assert_eq!(link.configs.len(), 2);
    assert_eq!(link.receiver.data(), &data[..]);
}

#[test]
fn test_mismatched_config_echo_is_resent() {
    let data = image(1000);
    let mut link = Loopback::new(2048);
    let mut rewritten = false;
    link.rewrite_reply = Box::new(move |msg: &Message<'_>| match msg.body {
        Body::Config {
            frame_length,
            packet_length,
            num_of_packet,
        } if !rewritten => {
            rewritten = true;
            let wrong = Body::Config {
                frame_length,
                packet_length,
                num_of_packet: num_of_packet + 1,
            };
            Some(Message::ack(msg.src, msg.dst, wrong).encode().unwrap())
        }
        _ => None,
    });

    let mut sender = Sender::new(SessionConfig::between(SENDER, RECEIVER), &data[..]).unwrap();
    sender.run(&mut link, &mut NoopDelay::new()).unwrap();

    assert_eq!(sender.diagnostics().stale_acks, 1);
    assert_eq!(sender.diagnostics().command_resends, 1);
    assert_eq!(link.configs, [(1000, 115, 9), (1000, 115, 9)]);
    assert_eq!(
        link.requests.iter().filter(|k| **k == CommandKind::Start).count(),
        1
    );
    assert_eq!(link.receiver.data(), &data[..]);
}

#[test]
fn test_check_report_past_window_is_resent() {
    let data = image(300);
    let mut link = Loopback::new(1024);
    let mut rewritten = false;
    link.rewrite_reply = Box::new(move |msg: &Message<'_>| match msg.body {
        Body::CheckReport { update, .. } if !rewritten => {
            rewritten = true;
            let bogus = Body::CheckReport {
                update: update + 1,
                length: 0,
                table: &[],
            };
            Some(Message::ack(msg.src, msg.dst, bogus).encode().unwrap())
        }
        _ => None,
    });

    let mut sender = Sender::new(SessionConfig::between(SENDER, RECEIVER), &data[..]).unwrap();
    sender.run(&mut link, &mut NoopDelay::new()).unwrap();

    assert_eq!(sender.diagnostics().stale_acks, 1);
    assert_eq!(
        link.requests.iter().filter(|k| **k == CommandKind::Check).count(),
        2
    );
    assert_eq!(sender.state(), SenderState::Halt);
    assert_eq!(link.receiver.data(), &data[..]);
}

#[test]
fn test_empty_report_for_earlier_window_is_not_trusted() {
    let data = image(500);
    let mut link = Loopback::new(1024);
    let mut lost = false;
    link.lose_request = Box::new(move |msg: &Message<'_>| match msg.body {
        Body::Send { packet_id: 3, .. } if !lost => {
            lost = true;
            true
        }
        _ => false,
    });
    // the second window [2, 4) gets the empty report that closed [0, 2)
    let mut rewritten = false;
    link.rewrite_reply = Box::new(move |msg: &Message<'_>| match msg.body {
        Body::CheckReport { update: 2, length, .. } if length > 0 && !rewritten => {
            rewritten = true;
            let previous = Body::CheckReport {
                update: 2,
                length: 0,
                table: &[],
            };
            Some(Message::ack(msg.src, msg.dst, previous).encode().unwrap())
        }
        _ => None,
    });
    let config = SessionConfig {
        window_size: 2,
        ..SessionConfig::between(SENDER, RECEIVER)
    };

    let mut sender = Sender::new(config, &data[..]).unwrap();
    sender.run(&mut link, &mut NoopDelay::new()).unwrap();

    assert_eq!(sender.diagnostics().stale_acks, 1);
    assert_eq!(sender.diagnostics().retransmitted, 1);
    assert_eq!(link.receiver.data(), &data[..]);
}

#[test]
fn test_transfer_without_check() {
    let data = image(500);
    let mut link = Loopback::new(1024);
    link.receiver = Receiver::new(
        SessionConfig {
            use_check: false,
            ..SessionConfig::between(RECEIVER, SENDER)
        },
        vec![0u8; 1024],
    )
    .unwrap();
    let config = SessionConfig {
        use_check: false,
        window_size: 2,
        ..SessionConfig::between(SENDER, RECEIVER)
    };

    let mut sender = Sender::new(config, &data[..]).unwrap();
    sender.run(&mut link, &mut NoopDelay::new()).unwrap();

    assert!(!link.requests.contains(&CommandKind::Check));
    assert_eq!(
        link.requests.iter().filter(|k| **k == CommandKind::Send).count(),
        5
    );
    assert_eq!(link.receiver.data(), &data[..]);
}

#[test]
fn test_silent_peer_times_out_at_ceiling() {
    let data = image(100);
    let config = SessionConfig {
        timeout_us: 50_000,
        ..SessionConfig::between(SENDER, RECEIVER)
    };
    let mut link = Silent::default();
    let mut sender = Sender::new(config, &data[..]).unwrap();

    let err = sender.run(&mut link, &mut NoopDelay::new()).unwrap_err();
    assert_eq!(err, SessionError::TimedOut { elapsed_us: 50_000 });
    assert!(err.is_timeout());
    assert_eq!(sender.state(), SenderState::Ping);
    // one PING up front, then one per full resend interval
    assert_eq!(link.sent, 5);
    assert_eq!(sender.diagnostics().command_resends, 4);
}

#[test]
fn test_foreign_acks_do_not_reset_timeout() {
    let data = image(100);
    let config = SessionConfig {
        timeout_us: 20_000,
        ..SessionConfig::between(SENDER, RECEIVER)
    };
    let mut link = Silent::default();
    for _ in 0..10 {
        let stray = Message::ack(0x9999, SENDER, Body::Ping).encode().unwrap();
        link.inbound.push_back(stray);
    }
    let mut sender = Sender::new(config, &data[..]).unwrap();

    let err = sender.run(&mut link, &mut NoopDelay::new()).unwrap_err();
    assert_eq!(err, SessionError::TimedOut { elapsed_us: 20_000 });
    assert_eq!(sender.diagnostics().foreign_address, 10);
}
