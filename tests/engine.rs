use embedded_hal_mock::eh1::delay::NoopDelay;
use sarlink::engine::event::{CCA_DONE, CRC_ERROR, RX_DONE, TX_DONE};
use sarlink::engine::mac::{FC_ACKREQ, FC_TYPE_ACK, FC_TYPE_MASK, MacHeader};
use sarlink::engine::regs::{
    ADDFIL_CNTRL, CCA_CNTRL, CLK_SET, INT_EN_GRP1, INT_SOURCE_GRP1, PANID_L, RD_RX_FIFO,
    RF_STATUS, Register, RegisterBus, SHT_ADDR0_L, SHT_ADDR1_L, VCO_CAL_START, WR_TX_FIFO,
};
use sarlink::engine::{
    Buffer, BufferStatus, Engine, EngineConfig, EngineState, Hardware, RetryPolicy,
    global_radio_engine_setup, with_radio_engine,
};
use sarlink::error::{BusError, EngineError};
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};

const ME: u16 = 0x1234;
const PEER: u16 = 0x5678;
const PAN: u16 = 0xabcd;

/// Register-level model of the transceiver: plain registers, the two FIFOs
/// and the write-zero-to-clear interrupt source word.
#[derive(Default)]
struct Chip {
    regs: HashMap<Register, u8>,
    intsrc: u32,
    int_enable: [u8; 3],
    rx_fifo: VecDeque<u8>,
    tx_fifo: Vec<u8>,
    rf: Vec<u8>,
    writes: Vec<(Register, Vec<u8>)>,
}

impl Chip {
    fn receive(&mut self, frame: &[u8], ed: u8) {
        self.push_phr(frame.len() as u16 + 2);
        self.rx_fifo.extend(frame);
        self.rx_fifo.extend([0xee, 0xee, ed]);
        self.intsrc |= RX_DONE;
    }

    fn push_phr(&mut self, length: u16) {
        self.rx_fifo.extend((length | 0x1800).to_be_bytes());
    }

    fn cca_result(&mut self, busy: bool) {
        let _ = self.regs.insert(CCA_CNTRL, 0x10 | u8::from(busy));
        self.intsrc |= CCA_DONE;
    }
}

#[derive(Clone, Default)]
pub struct Bus(Arc<Mutex<Chip>>);

impl Bus {
    fn chip(&self) -> MutexGuard<'_, Chip> {
        self.0.lock().unwrap()
    }
}

impl RegisterBus for Bus {
    fn write(&mut self, reg: Register, data: &[u8]) -> Result<(), BusError> {
        let mut chip = self.chip();
        chip.writes.push((reg, data.to_vec()));
        match reg {
            INT_SOURCE_GRP1 => {
                let keep = u32::from_le_bytes([data[0], data[1], data[2], 0xff]);
                chip.intsrc &= keep;
            }
            INT_EN_GRP1 => chip.int_enable.copy_from_slice(data),
            WR_TX_FIFO => chip.tx_fifo.extend_from_slice(data),
            RF_STATUS => chip.rf.push(data[0]),
            VCO_CAL_START if data[0] & 0x01 != 0 => chip.intsrc |= 0x04,
            _ => {
                for (i, value) in data.iter().enumerate() {
                    let _ = chip
                        .regs
                        .insert(Register::new(reg.bank, reg.addr + i as u8), *value);
                }
            }
        }
        Ok(())
    }

    fn read(&mut self, reg: Register, buf: &mut [u8]) -> Result<(), BusError> {
        let mut chip = self.chip();
        match reg {
            INT_SOURCE_GRP1 => buf.copy_from_slice(&chip.intsrc.to_le_bytes()[..3]),
            RD_RX_FIFO => {
                for byte in buf.iter_mut() {
                    *byte = chip.rx_fifo.pop_front().ok_or(BusError::Transfer)?;
                }
            }
            CLK_SET => buf[0] = chip.regs.get(&reg).copied().unwrap_or(0) | 0x80,
            _ => buf[0] = chip.regs.get(&reg).copied().unwrap_or(0),
        }
        Ok(())
    }
}

#[derive(Default)]
struct Timers {
    started: Vec<u16>,
    stopped: usize,
}

#[derive(Clone, Default)]
pub struct Board(Arc<Mutex<Timers>>);

impl Board {
    fn timers(&self) -> MutexGuard<'_, Timers> {
        self.0.lock().unwrap()
    }
}

impl Hardware for Board {
    type Error = ();

    fn init(&mut self) -> Result<(), ()> {
        Ok(())
    }

    fn unique_id(&mut self) -> Result<u16, ()> {
        Ok(0x4242)
    }

    fn timer_start(&mut self, ms: u16) -> Result<(), ()> {
        self.timers().started.push(ms);
        Ok(())
    }

    fn timer_stop(&mut self) -> Result<(), ()> {
        self.timers().stopped += 1;
        Ok(())
    }
}

type TestEngine = Engine<Bus, Board, NoopDelay>;

fn engine() -> (TestEngine, Bus, Board) {
    let bus = Bus::default();
    let board = Board::default();
    let engine = Engine::new(
        bus.clone(),
        board.clone(),
        NoopDelay::new(),
        EngineConfig::new(ME, PAN),
    );
    (engine, bus, board)
}

fn ready() -> (TestEngine, Bus, Board) {
    let (mut engine, bus, board) = engine();
    engine.setup().unwrap();
    bus.chip().writes.clear();
    bus.chip().rf.clear();
    (engine, bus, board)
}

fn data_frame(seq: u8, dst: u16, src: u16, ack: bool, payload: &[u8]) -> Vec<u8> {
    let mut out = [0u8; 32];
    let len = MacHeader::data(seq, PAN, dst, src, ack)
        .write_into(&mut out)
        .unwrap();
    let mut frame = out[..len].to_vec();
    frame.extend_from_slice(payload);
    frame
}

/// The acknowledgement a peer engine sends back for `frame`.
fn ack_for(frame: &[u8]) -> Vec<u8> {
    let (mut header, _) = MacHeader::parse(frame).unwrap();
    header.fc &= !(FC_TYPE_MASK | FC_ACKREQ);
    header.fc |= FC_TYPE_ACK;
    let mut out = [0u8; 32];
    let len = header.write_into(&mut out).unwrap();
    out[..len].to_vec()
}

fn tx(frame: &[u8], ack: RetryPolicy, cca: RetryPolicy) -> Buffer {
    Buffer::tx(frame, ack, cca).unwrap()
}

#[test]
fn test_setup_programs_idle_interrupts() {
    let (mut engine, bus, _) = engine();
    assert_eq!(engine.state(), EngineState::Reset);
    engine.setup().unwrap();

    assert_eq!(engine.state(), EngineState::Idle);
    let chip = bus.chip();
    assert_eq!(chip.int_enable, [0xe0, 0x00, 0x3c]);
    // calibration done was cleared
    assert_eq!(chip.intsrc & 0x04, 0);
    assert_eq!(chip.rf, [0x03]);
    assert!(chip
        .writes
        .iter()
        .any(|(reg, data)| *reg == VCO_CAL_START && data[..] == [0x01]));
}

#[test]
fn test_setup_is_rejected_while_sending() {
    let (mut engine, _, _) = ready();
    let frame = data_frame(1, PEER, ME, false, b"x");
    engine
        .tx_start(tx(&frame, RetryPolicy::default(), RetryPolicy::default()))
        .unwrap();
    assert_eq!(
        engine.setup(),
        Err(EngineError::InvalidEvent(EngineState::Sending))
    );
}

#[test]
fn test_commands_before_setup_are_rejected() {
    let (mut engine, _, _) = engine();
    assert_eq!(
        engine.rx_start(Buffer::rx(64)),
        Err(EngineError::InvalidEvent(EngineState::Reset))
    );
    let frame = data_frame(1, PEER, ME, false, b"x");
    assert_eq!(
        engine.tx_start(tx(&frame, RetryPolicy::default(), RetryPolicy::default())),
        Err(EngineError::InvalidEvent(EngineState::Reset))
    );
}

#[test]
fn test_buffer_roles_and_chain_limits() {
    let (mut engine, _, _) = ready();
    let frame = data_frame(1, PEER, ME, false, b"x");
    let tx_buffer = tx(&frame, RetryPolicy::default(), RetryPolicy::default());

    assert_eq!(engine.rx_append(Buffer::rx(64)), Err(EngineError::InvalidEvent(EngineState::Idle)));
    assert_eq!(engine.rx_start(tx_buffer.clone()), Err(EngineError::WrongRole));
    engine.rx_start(Buffer::rx(64)).unwrap();
    assert_eq!(
        engine.rx_start(Buffer::rx(64)),
        Err(EngineError::InvalidEvent(EngineState::Idle))
    );
    assert_eq!(engine.rx_append(tx_buffer), Err(EngineError::WrongRole));
    for _ in 0..3 {
        engine.rx_append(Buffer::rx(64)).unwrap();
    }
    assert_eq!(engine.rx_append(Buffer::rx(64)), Err(EngineError::ChainFull));
}

#[test]
fn test_receive_with_ack() {
    let (mut engine, bus, _) = ready();
    engine.rx_start(Buffer::rx(254)).unwrap();
    assert_eq!(bus.chip().rf, [0x06]);

    let frame = data_frame(7, ME, PEER, true, b"hello");
    bus.chip().receive(&frame, 0x42);
    engine.handle_interrupt().unwrap();

    assert_eq!(engine.state(), EngineState::SendAck);
    assert_eq!(bus.chip().intsrc & RX_DONE, 0);
    assert_eq!(
        bus.chip().tx_fifo,
        [0x18, 0x0b, 0x02, 0xa8, 0x07, 0xcd, 0xab, 0x78, 0x56, 0x34, 0x12]
    );
    assert!(engine.take_completed().is_none());

    bus.chip().intsrc |= TX_DONE;
    engine.handle_interrupt().unwrap();

    assert_eq!(engine.state(), EngineState::Idle);
    assert_eq!(bus.chip().int_enable, [0xe0, 0x00, 0x3c]);
    assert!(engine.rx_buffer().is_none());
    let done = engine.take_completed().unwrap();
    assert_eq!(done.status(), BufferStatus::Progress(frame.len() as u16));
    assert_eq!(done.data(), &frame[..]);
    assert_eq!(done.ed(), 0x42);
}

#[test]
fn test_duplicate_sequence_is_not_delivered() {
    let (mut engine, bus, _) = ready();
    engine.rx_start(Buffer::rx(254)).unwrap();
    engine.rx_append(Buffer::rx(254)).unwrap();

    for (seq, payload) in [(7, b"one"), (7, b"two"), (8, b"new")] {
        let frame = data_frame(seq, ME, PEER, true, payload);
        bus.chip().receive(&frame, 0);
        engine.handle_interrupt().unwrap();
        bus.chip().intsrc |= TX_DONE;
        engine.handle_interrupt().unwrap();
        assert_eq!(engine.state(), EngineState::Idle);
    }

    let first = engine.take_completed().unwrap();
    assert!(first.data().ends_with(b"one"));
    let second = engine.take_completed().unwrap();
    assert!(second.data().ends_with(b"new"));
    assert!(engine.take_completed().is_none());
    // every copy is still acknowledged
    assert_eq!(bus.chip().tx_fifo.len(), 3 * 11);
}

#[test]
fn test_frames_for_others_are_dropped() {
    fn only_from_peer(header: &MacHeader) -> bool {
        header.src_addr == PEER
    }
    let (mut engine, bus, _) = ready();
    engine
        .rx_start(Buffer::rx(254).with_filter(only_from_peer))
        .unwrap();

    for frame in [
        data_frame(1, 0x4321, PEER, true, b"not mine"),
        data_frame(2, ME, 0x9999, true, b"filtered"),
    ] {
        bus.chip().receive(&frame, 0);
        engine.handle_interrupt().unwrap();
        assert_eq!(engine.state(), EngineState::Idle);
    }
    assert!(engine.take_completed().is_none());
    assert!(bus.chip().tx_fifo.is_empty());
    assert_eq!(engine.rx_buffer().unwrap().status(), BufferStatus::Init);

    let frame = data_frame(3, ME, PEER, false, b"plain");
    bus.chip().receive(&frame, 0);
    engine.handle_interrupt().unwrap();
    assert_eq!(engine.take_completed().unwrap().data(), &frame[..]);
    // chain ran dry, receiver switched off
    assert_eq!(bus.chip().rf.last(), Some(&0x08));
}

#[test]
fn test_crc_error_moves_to_next_buffer() {
    let (mut engine, bus, _) = ready();
    engine.rx_start(Buffer::rx(254)).unwrap();
    engine.rx_append(Buffer::rx(254)).unwrap();

    {
        let mut chip = bus.chip();
        chip.push_phr(12);
        chip.intsrc |= CRC_ERROR;
    }
    engine.handle_interrupt().unwrap();

    assert_eq!(engine.take_completed().unwrap().status(), BufferStatus::ECrc);
    assert_eq!(engine.rx_buffer().unwrap().status(), BufferStatus::Init);
    assert_eq!(bus.chip().intsrc & CRC_ERROR, 0);
}

#[test]
fn test_oversized_frame_resets_phy() {
    let (mut engine, bus, _) = ready();
    engine.rx_start(Buffer::rx(32)).unwrap();
    {
        let mut chip = bus.chip();
        chip.push_phr(100);
        chip.intsrc |= RX_DONE;
    }
    engine.handle_interrupt().unwrap();

    let done = engine.take_completed().unwrap();
    assert_eq!(done.status(), BufferStatus::ESize);
    assert!(done.data().is_empty());
    assert_eq!(bus.chip().rf, [0x06, 0x03]);
}

#[test]
fn test_send_without_ack() {
    let (mut engine, bus, board) = ready();
    let frame = data_frame(1, PEER, ME, false, &[0x5a; 40]);
    engine
        .tx_start(tx(&frame, RetryPolicy::new(20, 3), RetryPolicy::new(0, 2)))
        .unwrap();
    assert_eq!(engine.state(), EngineState::Sending);
    assert_eq!(bus.chip().int_enable, [0xd0, 0x01, 0x03]);

    bus.chip().cca_result(false);
    engine.handle_interrupt().unwrap();
    let mut expected = ((frame.len() as u16 + 2) | 0x1800).to_be_bytes().to_vec();
    expected.extend_from_slice(&frame);
    assert_eq!(bus.chip().tx_fifo, expected);

    bus.chip().intsrc |= TX_DONE;
    engine.handle_interrupt().unwrap();

    assert_eq!(engine.state(), EngineState::Idle);
    let done = engine.take_completed().unwrap();
    assert_eq!(done.status(), BufferStatus::Progress(frame.len() as u16));
    assert_eq!(done.data(), &frame[..]);
    assert!(board.timers().started.is_empty());
}

#[test]
fn test_busy_channel_retries_then_fails() {
    let (mut engine, bus, board) = ready();
    let frame = data_frame(1, PEER, ME, false, b"busy");
    engine
        .tx_start(tx(&frame, RetryPolicy::new(20, 3), RetryPolicy::new(0, 2)))
        .unwrap();

    for _ in 0..2 {
        bus.chip().cca_result(true);
        engine.handle_interrupt().unwrap();
        assert_eq!(engine.state(), EngineState::Sending);
        engine.handle_timer().unwrap();
    }
    bus.chip().cca_result(true);
    engine.handle_interrupt().unwrap();

    assert_eq!(engine.state(), EngineState::Idle);
    assert_eq!(board.timers().started, [100, 100]);
    assert_eq!(board.timers().stopped, 2);
    let done = engine.take_completed().unwrap();
    assert_eq!(done.status(), BufferStatus::ECca);
    assert!(bus.chip().tx_fifo.is_empty());
}

#[test]
fn test_backoff_exponent_bounds_wait() {
    let (mut engine, bus, board) = ready();
    let frame = data_frame(1, PEER, ME, false, b"busy");
    engine
        .tx_start(tx(&frame, RetryPolicy::new(20, 3), RetryPolicy::new(3, 5)))
        .unwrap();
    for _ in 0..5 {
        bus.chip().cca_result(true);
        engine.handle_interrupt().unwrap();
        engine.handle_timer().unwrap();
    }
    let timers = board.timers();
    assert_eq!(timers.started.len(), 5);
    assert!(timers
        .started
        .iter()
        .all(|ms| *ms == 100 || (*ms % 8 == 0 && *ms <= 120)));
}

#[test]
fn test_send_with_ack() {
    let (mut engine, bus, board) = ready();
    let frame = data_frame(3, PEER, ME, true, b"please ack");
    engine
        .tx_start(tx(&frame, RetryPolicy::new(20, 3), RetryPolicy::new(0, 2)))
        .unwrap();
    bus.chip().cca_result(false);
    engine.handle_interrupt().unwrap();
    bus.chip().intsrc |= TX_DONE;
    engine.handle_interrupt().unwrap();

    assert_eq!(engine.state(), EngineState::WaitAck);
    assert_eq!(board.timers().started, [20]);

    // an ACK for another sequence number is ignored
    let mut stale = ack_for(&frame);
    stale[2] = 2;
    bus.chip().receive(&stale, 0x10);
    engine.handle_interrupt().unwrap();
    assert_eq!(engine.state(), EngineState::WaitAck);

    bus.chip().receive(&ack_for(&frame), 0x33);
    engine.handle_interrupt().unwrap();

    assert_eq!(engine.state(), EngineState::Idle);
    assert_eq!(board.timers().stopped, 1);
    let done = engine.take_completed().unwrap();
    assert_eq!(done.status(), BufferStatus::Progress(frame.len() as u16));
    assert_eq!(done.ed(), 0x33);
}

#[test]
fn test_missing_ack_exhausts_retries() {
    let (mut engine, bus, board) = ready();
    let frame = data_frame(4, PEER, ME, true, b"anyone?");
    engine
        .tx_start(tx(&frame, RetryPolicy::new(20, 1), RetryPolicy::new(0, 2)))
        .unwrap();

    for _ in 0..2 {
        bus.chip().cca_result(false);
        engine.handle_interrupt().unwrap();
        bus.chip().intsrc |= TX_DONE;
        engine.handle_interrupt().unwrap();
        assert_eq!(engine.state(), EngineState::WaitAck);
        engine.handle_timer().unwrap();
    }

    assert_eq!(engine.state(), EngineState::Idle);
    assert_eq!(board.timers().started, [20, 20]);
    let done = engine.take_completed().unwrap();
    assert_eq!(done.status(), BufferStatus::ERetry);
    assert_eq!(bus.chip().tx_fifo.len(), 2 * (frame.len() + 2));
}

#[test]
fn test_tx_chain_is_sent_in_order() {
    let (mut engine, bus, _) = ready();
    let first = data_frame(1, PEER, ME, false, b"first");
    let second = data_frame(2, PEER, ME, false, b"second");
    engine
        .tx_start(tx(&first, RetryPolicy::default(), RetryPolicy::default()))
        .unwrap();
    engine
        .tx_append(tx(&second, RetryPolicy::default(), RetryPolicy::default()))
        .unwrap();

    for _ in 0..2 {
        bus.chip().cca_result(false);
        engine.handle_interrupt().unwrap();
        bus.chip().intsrc |= TX_DONE;
        engine.handle_interrupt().unwrap();
    }

    assert_eq!(engine.state(), EngineState::Idle);
    assert_eq!(engine.take_completed().unwrap().data(), &first[..]);
    assert_eq!(engine.take_completed().unwrap().data(), &second[..]);
}

#[test]
fn test_rx_stop_returns_buffers() {
    let (mut engine, bus, _) = ready();
    engine.rx_start(Buffer::rx(64)).unwrap();
    engine.rx_append(Buffer::rx(64)).unwrap();
    engine.rx_stop().unwrap();

    assert_eq!(bus.chip().rf.last(), Some(&0x08));
    for _ in 0..2 {
        assert_eq!(engine.take_completed().unwrap().status(), BufferStatus::EStop);
    }
    assert_eq!(
        engine.rx_stop(),
        Err(EngineError::InvalidEvent(EngineState::Idle))
    );
}

#[test]
fn test_sleep_and_wakeup() {
    let (mut engine, bus, _) = ready();
    engine.rx_start(Buffer::rx(64)).unwrap();
    engine.sleep().unwrap();

    assert_eq!(engine.state(), EngineState::Sleep);
    assert_eq!(bus.chip().int_enable, [0xc0, 0x00, 0x00]);
    assert_eq!(bus.chip().regs.get(&CLK_SET).copied().unwrap_or(0) & 0x20, 0x20);
    assert_eq!(
        engine.rx_start(Buffer::rx(64)),
        Err(EngineError::InvalidEvent(EngineState::Sleep))
    );

    engine.wakeup().unwrap();
    assert_eq!(engine.state(), EngineState::Idle);
    assert_eq!(bus.chip().regs.get(&CLK_SET).copied().unwrap_or(0) & 0x20, 0);
    assert_eq!(bus.chip().rf, [0x06, 0x08, 0x06]);
}

#[test]
fn test_address_filter_registers() {
    let (mut engine, bus, _) = ready();
    engine.set_address_filter(PAN, ME, 0xffff).unwrap();
    let chip = bus.chip();
    assert_eq!(
        chip.writes,
        [
            (ADDFIL_CNTRL, vec![0x1a]),
            (PANID_L, vec![0xcd, 0xab]),
            (SHT_ADDR0_L, vec![0x34, 0x12]),
            (SHT_ADDR1_L, vec![0xff, 0xff]),
        ]
    );
}

#[test]
fn test_resetup_stops_buffers() {
    let (mut engine, _, _) = ready();
    engine.rx_start(Buffer::rx(64)).unwrap();
    engine.setup().unwrap();
    assert_eq!(engine.state(), EngineState::Idle);
    assert!(engine.rx_buffer().is_none());
    assert_eq!(engine.take_completed().unwrap().status(), BufferStatus::EStop);
}

#[test]
#[should_panic(expected = "not enabled")]
fn test_unexpected_interrupt_panics() {
    let (mut engine, bus, _) = ready();
    bus.chip().intsrc |= TX_DONE;
    let _ = engine.handle_interrupt();
}

#[test]
#[should_panic(expected = "timer expired")]
fn test_timer_in_idle_panics() {
    let (mut engine, _, _) = ready();
    let _ = engine.handle_timer();
}

sarlink::init_radio_engine!(Bus, Board, NoopDelay);

#[test]
fn test_global_engine() {
    assert_eq!(sarlink::radio_interrupt!(), Ok(()));
    assert!(with_radio_engine(&RADIO_ENGINE, |engine| engine.state()).is_none());

    let (engine, bus, _) = engine();
    global_radio_engine_setup(&RADIO_ENGINE, engine).unwrap();
    with_radio_engine(&RADIO_ENGINE, |engine| engine.rx_start(Buffer::rx(254)))
        .unwrap()
        .unwrap();

    let frame = data_frame(9, ME, PEER, false, b"via isr");
    bus.chip().receive(&frame, 0);
    assert_eq!(sarlink::radio_interrupt!(), Ok(()));

    let done = with_radio_engine(&RADIO_ENGINE, |engine| engine.take_completed())
        .flatten()
        .unwrap();
    assert_eq!(done.data(), &frame[..]);
}
