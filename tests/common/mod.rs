//! Shared test harness: a controllable timer and a scripted fake peer
//! behind the radio driver contract.

use hoplink::bytes::{ByteReader, FromBytes};
use hoplink::l2cap;
use hoplink::link::access_address::Lfsr;
use hoplink::link::advertising::ConnectRequestData;
use hoplink::link::data::{Header, Llid};
use hoplink::link::SeqNum;
use hoplink::radio::{BleRole, Irq, Radio, RadioError};
use hoplink::time::{Duration, Instant, Timer};
use std::cell::{Cell, RefCell};
use std::collections::VecDeque;
use std::rc::Rc;

/// Test configuration tying the mocks together.
pub struct TestConfig;

impl hoplink::config::Config for TestConfig {
    type Radio = MockRadio;
    type Timer = MockTimer;
    type Rng = Lfsr;
}

/// A timer the test (and the stack's waits) can move forward at will.
///
/// Every `now()` read advances time a little so that polling loops always
/// make progress; `wait_until` jumps straight to the deadline.
#[derive(Clone)]
pub struct MockTimer {
    now_us: Rc<Cell<u64>>,
}

/// Time consumed by a single `now()` read.
const READ_TICK: u64 = 5;

impl MockTimer {
    pub fn new() -> Self {
        MockTimer {
            now_us: Rc::new(Cell::new(1_000)),
        }
    }
}

impl Timer for MockTimer {
    fn now(&self) -> Instant {
        let t = self.now_us.get();
        self.now_us.set(t + READ_TICK);
        Instant::from_raw_micros(t)
    }

    fn delay(&mut self, d: Duration) {
        let t = self.now_us.get() + u64::from(d.as_micros());
        self.now_us.set(t);
    }

    fn wait_until(&mut self, deadline: Instant) {
        if deadline.raw_micros() > self.now_us.get() {
            self.now_us.set(deadline.raw_micros());
        }
    }
}

/// One scripted peer reaction, consumed per connection event.
#[derive(Clone, Debug)]
pub enum PeerStep {
    /// Receive the Master's PDU and answer with a correctly-sequenced
    /// empty PDU.
    AckEmpty,
    /// Receive and answer with an ATT PDU (wrapped in L2CAP, single
    /// fragment).
    AttRsp(Vec<u8>),
    /// Receive and answer with an LL Control PDU.
    Control(Vec<u8>),
    /// Receive, but the answer arrives corrupted (CRC error at the
    /// Master).
    Corrupt,
    /// Miss the event entirely: no ack, no reply (RX timeout at the
    /// Master).
    Silent,
}

/// An advertisement the fake peer transmits while the Master scans.
pub struct AdvPlan {
    /// Center frequency the advertisement is sent on.
    pub freq_hz: u32,
    /// Raw advertising channel PDU (header + payload).
    pub pdu: Vec<u8>,
    pub rssi: i8,
}

struct Inner {
    role: Option<BleRole>,
    freq_hz: u32,
    sync_word: [u8; 4],
    crc_init: u32,
    whitening: u8,
    rx_mode: bool,
    irq: Irq,
    rssi: i8,

    /// The Master-visible packet buffer (TX area at offset 0).
    buffer: [u8; 256],
    /// Received-packet area, exposed at offset 128.
    rx_data: Vec<u8>,

    adv: Option<AdvPlan>,
    steps: VecDeque<PeerStep>,
    default_step: PeerStep,

    in_connection: bool,
    last_tx: Vec<u8>,
    /// Slave-side ARQ state.
    slave_sn: bool,
    slave_nesn: bool,

    /// Log of every transmitted Master PDU with the frequency it left on.
    tx_log: Vec<(u32, Vec<u8>)>,
    /// The raw CONNECT_REQ PDU, once transmitted.
    connect_req: Option<Vec<u8>>,
    /// Reassembled ATT PDUs the Master delivered.
    att_rx: Vec<Vec<u8>>,
    /// LL Control PDU payloads the Master delivered.
    ctrl_rx: Vec<Vec<u8>>,
    asm: l2cap::Assembler<Box<[u8]>>,
}

/// A scripted fake peer implementing the [`Radio`] capability.
///
/// Cloning returns another handle to the same peer, so tests keep one for
/// inspection after the Link-Layer takes ownership of the other.
#[derive(Clone)]
pub struct MockRadio {
    inner: Rc<RefCell<Inner>>,
}

impl MockRadio {
    pub fn new() -> Self {
        MockRadio {
            inner: Rc::new(RefCell::new(Inner {
                role: None,
                freq_hz: 0,
                sync_word: [0; 4],
                crc_init: 0,
                whitening: 0,
                rx_mode: false,
                irq: Irq::empty(),
                rssi: -55,
                buffer: [0; 256],
                rx_data: Vec::new(),
                adv: None,
                steps: VecDeque::new(),
                default_step: PeerStep::AckEmpty,
                in_connection: false,
                last_tx: Vec::new(),
                slave_sn: false,
                slave_nesn: false,
                tx_log: Vec::new(),
                connect_req: None,
                att_rx: Vec::new(),
                ctrl_rx: Vec::new(),
                asm: l2cap::Assembler::new(vec![0; 4096 + 8].into_boxed_slice()),
            })),
        }
    }

    /// Schedules an advertisement for delivery while scanning.
    pub fn plan_advertisement(&self, adv: AdvPlan) {
        self.inner.borrow_mut().adv = Some(adv);
    }

    /// Appends peer reactions, consumed one per connection event.
    pub fn script(&self, steps: impl IntoIterator<Item = PeerStep>) {
        self.inner.borrow_mut().steps.extend(steps);
    }

    /// Sets the reaction used when the script runs dry.
    pub fn set_default_step(&self, step: PeerStep) {
        self.inner.borrow_mut().default_step = step;
    }

    pub fn connect_req(&self) -> Option<Vec<u8>> {
        self.inner.borrow().connect_req.clone()
    }

    /// Decodes the `LLData` of the captured CONNECT_REQ.
    pub fn connect_req_lldata(&self) -> Option<ConnectRequestData> {
        let raw = self.connect_req()?;
        ConnectRequestData::from_bytes(&mut ByteReader::new(&raw[2..])).ok()
    }

    pub fn att_rx(&self) -> Vec<Vec<u8>> {
        self.inner.borrow().att_rx.clone()
    }

    pub fn ctrl_rx(&self) -> Vec<Vec<u8>> {
        self.inner.borrow().ctrl_rx.clone()
    }

    pub fn tx_log(&self) -> Vec<(u32, Vec<u8>)> {
        self.inner.borrow().tx_log.clone()
    }

    pub fn sync_word(&self) -> [u8; 4] {
        self.inner.borrow().sync_word
    }

    pub fn crc_init(&self) -> u32 {
        self.inner.borrow().crc_init
    }
}

impl Inner {
    /// Receives the Master's PDU: ack bookkeeping plus payload collection.
    fn process_master_pdu(&mut self) {
        let pdu = self.last_tx.clone();
        if pdu.len() < 2 {
            return;
        }
        let header = Header::parse(&pdu[..2]);
        let payload = &pdu[2..2 + usize::from(header.payload_length())];

        // The Master's NESN acknowledges (or demands retransmission of)
        // our previous PDU.
        if header.nesn() != SeqNum::from_bit(self.slave_sn) {
            self.slave_sn = header.nesn().bit();
        }

        // New sequence number: consume the payload.
        if header.sn() == SeqNum::from_bit(self.slave_nesn) {
            self.slave_nesn = !self.slave_nesn;
            match header.llid() {
                Llid::Control => self.ctrl_rx.push(payload.to_vec()),
                Llid::DataStart | Llid::DataCont if !payload.is_empty() => {
                    if let Ok(Some(frame)) = self.asm.push(header.llid(), payload) {
                        self.att_rx.push(frame.payload.to_vec());
                    }
                }
                _ => {}
            }
        }
    }

    /// Builds a correctly-sequenced slave PDU.
    fn build_slave_pdu(&self, llid: Llid, payload: &[u8]) -> Vec<u8> {
        let mut header = Header::new(llid);
        header.set_payload_length(payload.len() as u8);
        header.set_sn(SeqNum::from_bit(self.slave_sn));
        header.set_nesn(SeqNum::from_bit(self.slave_nesn));

        let mut pdu = header.to_u16().to_le_bytes().to_vec();
        pdu.extend_from_slice(payload);
        pdu
    }

    fn deliver(&mut self, pdu: Vec<u8>) {
        self.rx_data = pdu;
        self.irq |= Irq::SYNC_VALID | Irq::RX_DONE;
    }

    /// Acts out one connection event from the peer's side.
    fn run_peer_step(&mut self) {
        let step = self
            .steps
            .pop_front()
            .unwrap_or_else(|| self.default_step.clone());

        match step {
            PeerStep::Silent => {
                self.irq |= Irq::RX_TIMEOUT;
            }
            PeerStep::Corrupt => {
                self.process_master_pdu();
                self.irq |= Irq::SYNC_VALID | Irq::CRC_ERROR;
            }
            PeerStep::AckEmpty => {
                self.process_master_pdu();
                let pdu = self.build_slave_pdu(Llid::DataCont, &[]);
                self.deliver(pdu);
            }
            PeerStep::AttRsp(att) => {
                self.process_master_pdu();
                let mut frame = vec![0; l2cap::HEADER_SIZE + att.len()];
                let n = l2cap::encode_frame(l2cap::Channel::ATT, &att, &mut frame).unwrap();
                frame.truncate(n);
                let pdu = self.build_slave_pdu(Llid::DataStart, &frame);
                self.deliver(pdu);
            }
            PeerStep::Control(ctrl) => {
                self.process_master_pdu();
                let pdu = self.build_slave_pdu(Llid::Control, &ctrl);
                self.deliver(pdu);
            }
        }
    }
}

impl Radio for MockRadio {
    fn configure_ble(&mut self, role: BleRole) -> Result<(), RadioError> {
        let mut i = self.inner.borrow_mut();
        i.role = Some(role);
        i.in_connection = role == BleRole::Master;
        i.slave_sn = false;
        i.slave_nesn = false;
        i.asm.reset();
        Ok(())
    }

    fn set_frequency(&mut self, freq_hz: u32) -> Result<(), RadioError> {
        assert!((2_402_000_000..=2_480_000_000).contains(&freq_hz));
        self.inner.borrow_mut().freq_hz = freq_hz;
        Ok(())
    }

    fn set_sync_word(&mut self, sync: [u8; 4]) -> Result<(), RadioError> {
        self.inner.borrow_mut().sync_word = sync;
        Ok(())
    }

    fn set_crc_init(&mut self, init: u32) -> Result<(), RadioError> {
        self.inner.borrow_mut().crc_init = init;
        Ok(())
    }

    fn set_whitening_seed(&mut self, seed: u8) -> Result<(), RadioError> {
        assert_eq!(seed & 0x40, 0x40, "whitening seed must set bit 6");
        self.inner.borrow_mut().whitening = seed;
        Ok(())
    }

    fn write_buffer(&mut self, offset: u8, data: &[u8]) -> Result<(), RadioError> {
        let mut i = self.inner.borrow_mut();
        let offset = usize::from(offset);
        i.buffer[offset..offset + data.len()].copy_from_slice(data);
        Ok(())
    }

    fn read_buffer(&mut self, offset: u8, buf: &mut [u8]) -> Result<(), RadioError> {
        let i = self.inner.borrow();
        if offset >= 128 {
            let start = usize::from(offset) - 128;
            let n = buf.len().min(i.rx_data.len().saturating_sub(start));
            buf[..n].copy_from_slice(&i.rx_data[start..start + n]);
        } else {
            let offset = usize::from(offset);
            buf.copy_from_slice(&i.buffer[offset..offset + buf.len()]);
        }
        Ok(())
    }

    fn rx_buffer_status(&mut self) -> Result<(u8, u8), RadioError> {
        let i = self.inner.borrow();
        Ok((i.rx_data.len() as u8, 128))
    }

    fn set_standby(&mut self) -> Result<(), RadioError> {
        self.inner.borrow_mut().rx_mode = false;
        Ok(())
    }

    fn set_tx(&mut self) -> Result<(), RadioError> {
        let mut i = self.inner.borrow_mut();
        let header = Header::parse(&i.buffer[..2]);
        let len = 2 + usize::from(header.payload_length());
        let pdu = i.buffer[..len.min(i.buffer.len())].to_vec();

        if i.in_connection {
            i.last_tx = pdu.clone();
        } else {
            // Advertising channel TX from a scanner: the CONNECT_REQ.
            i.connect_req = Some(pdu.clone());
        }
        let freq = i.freq_hz;
        i.tx_log.push((freq, pdu));
        i.irq |= Irq::TX_DONE;
        Ok(())
    }

    fn set_rx(&mut self, _timeout: Option<Duration>) -> Result<(), RadioError> {
        let mut i = self.inner.borrow_mut();
        i.rx_mode = true;
        if i.in_connection {
            i.run_peer_step();
        } else {
            let due = i.adv.as_ref().map_or(false, |a| a.freq_hz == i.freq_hz);
            if due {
                let adv = i.adv.take().unwrap();
                i.rssi = adv.rssi;
                i.rx_data = adv.pdu;
                i.irq |= Irq::SYNC_VALID | Irq::RX_DONE;
            }
        }
        Ok(())
    }

    fn irq_status(&mut self) -> Result<Irq, RadioError> {
        Ok(self.inner.borrow().irq)
    }

    fn clear_irq(&mut self, mask: Irq) -> Result<(), RadioError> {
        let mut i = self.inner.borrow_mut();
        i.irq &= !mask;
        Ok(())
    }

    fn last_rssi(&mut self) -> Result<i8, RadioError> {
        Ok(self.inner.borrow().rssi)
    }
}

/// Builds a raw `ADV_IND` PDU for `advertiser` (random address) with the
/// given advertising data.
pub fn adv_ind(advertiser: [u8; 6], adv_data: &[u8]) -> Vec<u8> {
    // Header: type 0000 (ADV_IND), TxAdd set, length = 6 + data.
    let mut pdu = vec![0b0100_0000, (6 + adv_data.len()) as u8];
    pdu.extend_from_slice(&advertiser);
    pdu.extend_from_slice(adv_data);
    pdu
}

use hoplink::link::{
    AddressKind, ConnectionParams, DeviceAddress, LinkEvent, LinkLayer, Role, ScanParams,
};

/// The peripheral address used throughout the tests.
pub fn target() -> DeviceAddress {
    DeviceAddress::new([0x66, 0x55, 0x44, 0x33, 0x22, 0x11], AddressKind::Random)
}

pub fn conn_params() -> ConnectionParams {
    ConnectionParams {
        conn_interval: Duration::from_millis(50),
        slave_latency: 0,
        supervision_timeout: Duration::from_secs(1),
        data_payload_limit: 27,
    }
}

pub fn scan_params() -> ScanParams {
    ScanParams {
        dwell: Duration::from_millis(10),
        timeout: Some(Duration::from_secs(10)),
    }
}

/// Polls until the predicate matches an emitted event, with an iteration
/// bound so broken tests fail instead of hanging.
pub fn poll_until(
    ll: &mut LinkLayer<TestConfig>,
    mut pred: impl FnMut(&LinkEvent) -> bool,
) -> LinkEvent {
    for _ in 0..200_000 {
        if let Some(event) = ll.poll(|_, _| {}).unwrap() {
            if pred(&event) {
                return event;
            }
        }
    }
    panic!("event did not occur within the iteration bound");
}

/// Establishes a connection to [`target`] against the fake peer.
pub fn connected_link(radio: &MockRadio) -> LinkLayer<TestConfig> {
    let mut ll = LinkLayer::<TestConfig>::new(
        radio.clone(),
        MockTimer::new(),
        Lfsr::new(0xBEEF),
        Role::Master,
    )
    .unwrap();

    radio.plan_advertisement(AdvPlan {
        freq_hz: 2_402_000_000,
        pdu: adv_ind(*target().raw(), &[]),
        rssi: -60,
    });

    ll.connect(target(), &scan_params(), &conn_params()).unwrap();
    let event = poll_until(&mut ll, |e| matches!(e, LinkEvent::Connected));
    assert_eq!(event, LinkEvent::Connected);
    ll
}

/// Drives connection events until the peer has seen `count` more Master
/// PDUs.
pub fn drive_events(ll: &mut LinkLayer<TestConfig>, radio: &MockRadio, count: usize) {
    let goal = radio.tx_log().len() + count;
    for _ in 0..200_000 {
        if radio.tx_log().len() >= goal {
            return;
        }
        ll.poll(|_, _| {}).unwrap();
    }
    panic!("peer did not observe {} events", count);
}
