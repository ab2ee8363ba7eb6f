//! The Central-role Link-Layer.
//!
//! The Link-Layer owns the radio and the schedule. It is a state machine
//! with four macro states:
//!
//! * **Standby** - radio silent.
//! * **Scanning** - cycling the three advertising channels, reporting
//!   advertisements that pass the configured filter.
//! * **Initiating** - scanning with connect intent: when the target's
//!   connectable advertisement arrives, a `CONNECT_REQ` is transmitted on
//!   the same channel and the state moves to a connection.
//! * **Connection** - the Master connection-event engine of
//!   [`connection`], hopping data channels at every anchor point.
//!
//! # Packet format
//!
//! On air, every Link-Layer packet is
//!
//! ```notrust
//! LSB                                                     MSB
//! +-----------+----------------+---------------+------------+
//! | Preamble  | Access Address |     PDU       |  CRC       |
//! | (1 octet) | (4 octets)     | (2-39 octets) | (3 octets) |
//! +-----------+----------------+---------------+------------+
//! ```
//!
//! with whitening applied to PDU and CRC. The radio hardware handles the
//! preamble, access-address match, CRC and whitening (see
//! [`crate::radio`]); the types in this module produce and consume the PDU
//! in the middle.

pub mod access_address;
pub mod ad_structure;
pub mod advertising;
pub mod channel_map;
mod connection;
pub mod data;
mod device_address;
mod features;
pub mod llcp;
mod seq_num;

pub use self::connection::{
    ConnectionStats, DEFAULT_DATA_PAYLOAD, MAX_PDU_PAYLOAD, REASON_CONNECTION_TIMEOUT,
    REASON_REMOTE_USER_TERMINATED,
};
pub use self::device_address::*;
pub use self::features::*;
pub use self::seq_num::SeqNum;

use self::access_address::{generate_crc_init, AccessAddress, ADVERTISING_ADDRESS};
use self::advertising::{Advertisement, ConnectRequestData, Header as AdvHeader, PduType, CONNECT_REQ_LEN};
use self::connection::{Connection, EventOutcome};
use self::data::Llid;
use crate::bytes::{ByteWriter, ToBytes};
use crate::config::Config;
use crate::crc::CRC_PRESET;
use crate::phy::AdvertisingChannel;
use crate::radio::{BleRole, Irq, Radio, RadioError};
use crate::time::{Duration, Instant, Timer};
use core::fmt;
use log::{debug, info, trace};
use rand_core::RngCore;

/// Longest advertising channel PDU (header + 37 payload octets).
const MAX_ADV_PDU: usize = 2 + 37;

/// Bound on waiting for `CONNECT_REQ` to leave the antenna.
const CONNECT_REQ_TX_TIMEOUT: Duration = Duration::from_millis(3);

/// The device role of a Link-Layer instance.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Role {
    /// Central: scans, initiates and masters connections.
    Master,
    /// Peripheral. Not implemented by this stack.
    Slave,
}

/// Errors surfaced by the Link-Layer API.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum LinkError {
    /// Invalid argument at the API boundary.
    Param,
    /// The requested resource is already engaged; try again later.
    Busy,
    /// The operation requires a live connection.
    NotConnected,
    /// The radio driver failed.
    Radio(RadioError),
}

impl From<RadioError> for LinkError {
    fn from(e: RadioError) -> Self {
        LinkError::Radio(e)
    }
}

impl fmt::Display for LinkError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LinkError::Param => f.write_str("invalid parameter"),
            LinkError::Busy => f.write_str("resource busy"),
            LinkError::NotConnected => f.write_str("not connected"),
            LinkError::Radio(e) => write!(f, "radio: {}", e),
        }
    }
}

/// Scan configuration.
#[derive(Debug, Copy, Clone)]
pub struct ScanParams {
    /// How long to listen on one advertising channel before moving to the
    /// next.
    pub dwell: Duration,
    /// Give up scanning after this long (`None` scans forever).
    pub timeout: Option<Duration>,
}

impl Default for ScanParams {
    fn default() -> Self {
        Self {
            dwell: Duration::from_millis(10),
            timeout: Some(Duration::from_secs(10)),
        }
    }
}

/// Parameters for a connection to be initiated.
#[derive(Debug, Copy, Clone)]
pub struct ConnectionParams {
    /// Connection event interval. 7.5 ms to 4 s in 1.25 ms steps.
    pub conn_interval: Duration,
    /// Events the peripheral may sleep through when idle (0..=499).
    pub slave_latency: u16,
    /// Link supervision timeout. 100 ms to 32 s in 10 ms steps.
    pub supervision_timeout: Duration,
    /// Largest data PDU payload to send in one fragment (27..=251).
    pub data_payload_limit: u8,
}

impl Default for ConnectionParams {
    fn default() -> Self {
        Self {
            conn_interval: Duration::from_millis(50),
            slave_latency: 4,
            supervision_timeout: Duration::from_secs(5),
            data_payload_limit: DEFAULT_DATA_PAYLOAD,
        }
    }
}

impl ConnectionParams {
    /// Validates ranges and converts to the on-air units of `CONNECT_REQ`.
    ///
    /// Returns `(interval, latency, timeout)` in units of 1.25 ms / events
    /// / 10 ms.
    fn to_wire_units(&self) -> Result<(u16, u16, u16), LinkError> {
        let interval_us = self.conn_interval.as_micros();
        let timeout_us = self.supervision_timeout.as_micros();
        if interval_us % 1_250 != 0 || !(7_500..=4_000_000).contains(&interval_us) {
            return Err(LinkError::Param);
        }
        if self.slave_latency > 499 {
            return Err(LinkError::Param);
        }
        if timeout_us % 10_000 != 0 || !(100_000..=32_000_000).contains(&timeout_us) {
            return Err(LinkError::Param);
        }
        if !(DEFAULT_DATA_PAYLOAD..=MAX_PDU_PAYLOAD as u8).contains(&self.data_payload_limit) {
            return Err(LinkError::Param);
        }
        // The supervision timeout must outlast one latency cycle.
        let latency_cycle = u64::from(interval_us) * (u64::from(self.slave_latency) + 1) * 2;
        if u64::from(timeout_us) < latency_cycle {
            return Err(LinkError::Param);
        }
        Ok((
            (interval_us / 1_250) as u16,
            self.slave_latency,
            (timeout_us / 10_000) as u16,
        ))
    }
}

/// Scan filter callback; returning `true` admits the advertisement.
pub type ScanFilter = fn(&Advertisement<'_>) -> bool;

/// The coarse Link-Layer state, for observers.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum LinkState {
    Idle,
    Scanning,
    Initiating,
    /// `CONNECT_REQ` sent, no response from the peer yet.
    Connecting,
    Connected,
    Disconnecting,
}

/// Events reported from [`LinkLayer::poll`].
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum LinkEvent {
    /// `CONNECT_REQ` was transmitted; the connection engine is running.
    Connected,
    /// The connection ended. The reason is a controller error code
    /// (`0x08` = supervision timeout, `0x13` = local request, peer codes
    /// verbatim).
    Disconnected { reason: u8 },
    /// An advertisement passed the scan filter.
    AdvReport {
        advertiser: DeviceAddress,
        rssi: i8,
        connectable: bool,
    },
    /// Scanning gave up after `ScanParams::timeout`.
    ScanTimeout,
}

struct ConnectIntent {
    peer: DeviceAddress,
    params: ConnectionParams,
    wire: (u16, u16, u16),
}

struct Scanner {
    params: ScanParams,
    filter: Option<ScanFilter>,
    channel: AdvertisingChannel,
    next_switch: Instant,
    deadline: Option<Instant>,
    intent: Option<ConnectIntent>,
}

enum State {
    Standby,
    Scanning(Scanner),
    Connection(Connection),
}

/// The Link-Layer: radio owner and scheduling authority.
pub struct LinkLayer<C: Config> {
    radio: C::Radio,
    timer: C::Timer,
    rng: C::Rng,
    dev_addr: DeviceAddress,
    state: State,
}

impl<C: Config> LinkLayer<C> {
    /// Creates a Link-Layer in Standby, with a fresh random static device
    /// address drawn from `rng`.
    ///
    /// Only [`Role::Master`] is supported; requesting [`Role::Slave`] is
    /// rejected with [`LinkError::Param`].
    pub fn new(radio: C::Radio, timer: C::Timer, mut rng: C::Rng, role: Role) -> Result<Self, LinkError> {
        if role != Role::Master {
            return Err(LinkError::Param);
        }
        let dev_addr = DeviceAddress::random_static(&mut rng);
        trace!("new LinkLayer, dev={:?}", dev_addr);
        Ok(Self {
            radio,
            timer,
            rng,
            dev_addr,
            state: State::Standby,
        })
    }

    /// Returns the local device address.
    pub fn device_address(&self) -> DeviceAddress {
        self.dev_addr
    }

    /// Overrides the local device address.
    ///
    /// Only allowed while in Standby; the address is baked into
    /// `CONNECT_REQ` PDUs once scanning starts.
    pub fn set_device_address(&mut self, addr: DeviceAddress) -> Result<(), LinkError> {
        match self.state {
            State::Standby => {
                self.dev_addr = addr;
                Ok(())
            }
            _ => Err(LinkError::Busy),
        }
    }

    /// Returns a reference to the timer instance used by the Link-Layer.
    pub fn timer(&mut self) -> &mut C::Timer {
        &mut self.timer
    }

    /// Reads the current time off the Link-Layer's timer.
    pub fn now(&self) -> Instant {
        self.timer.now()
    }

    /// Returns the coarse protocol state.
    pub fn state(&self) -> LinkState {
        match &self.state {
            State::Standby => LinkState::Idle,
            State::Scanning(sc) if sc.intent.is_some() => LinkState::Initiating,
            State::Scanning(_) => LinkState::Scanning,
            State::Connection(conn) if conn.terminating() => LinkState::Disconnecting,
            State::Connection(conn) if conn.established() => LinkState::Connected,
            State::Connection(_) => LinkState::Connecting,
        }
    }

    /// Whether a connection engine is running (established or not).
    pub fn is_connected(&self) -> bool {
        matches!(self.state, State::Connection(_))
    }

    /// Counters of the running connection, if any.
    pub fn connection_stats(&self) -> Option<ConnectionStats> {
        match &self.state {
            State::Connection(conn) => Some(conn.stats()),
            _ => None,
        }
    }

    /// RSSI of the last received data PDU.
    pub fn last_rssi(&self) -> Option<i8> {
        match &self.state {
            State::Connection(conn) => Some(conn.last_rssi()),
            _ => None,
        }
    }

    /// Whether the outgoing data buffer is free for another message.
    pub fn tx_idle(&self) -> bool {
        match &self.state {
            State::Connection(conn) => conn.tx_idle(),
            _ => false,
        }
    }

    /// Starts passive scanning.
    ///
    /// Advertisements that pass `filter` (all of them, when `None`) are
    /// reported as [`LinkEvent::AdvReport`].
    pub fn start_scan(
        &mut self,
        params: &ScanParams,
        filter: Option<ScanFilter>,
    ) -> Result<(), LinkError> {
        if !matches!(self.state, State::Standby) {
            return Err(LinkError::Busy);
        }
        if params.dwell == Duration::ZERO {
            return Err(LinkError::Param);
        }
        let scanner = self.enter_scan(params, filter, None)?;
        self.state = State::Scanning(scanner);
        Ok(())
    }

    /// Stops scanning (or initiating) and returns to Standby.
    pub fn stop_scan(&mut self) -> Result<(), LinkError> {
        if !matches!(self.state, State::Scanning(_)) {
            return Err(LinkError::NotConnected);
        }
        self.radio.set_standby()?;
        self.state = State::Standby;
        Ok(())
    }

    /// Starts initiating: scan for `peer` and connect when it advertises.
    ///
    /// Allowed from Standby and from plain scanning (the scan is upgraded
    /// and keeps its filter).
    pub fn connect(
        &mut self,
        peer: DeviceAddress,
        scan: &ScanParams,
        params: &ConnectionParams,
    ) -> Result<(), LinkError> {
        let wire = params.to_wire_units()?;
        let intent = ConnectIntent {
            peer,
            params: *params,
            wire,
        };
        match &mut self.state {
            State::Scanning(sc) => {
                if sc.intent.is_some() {
                    return Err(LinkError::Busy);
                }
                sc.intent = Some(intent);
                return Ok(());
            }
            State::Connection(_) => return Err(LinkError::Busy),
            State::Standby => {}
        }
        let scanner = self.enter_scan(scan, None, Some(intent))?;
        self.state = State::Scanning(scanner);
        Ok(())
    }

    /// Disconnects.
    ///
    /// In a connection, queues `LL_TERMINATE_IND` with `reason` and reports
    /// [`LinkEvent::Disconnected`] once it is acknowledged. While scanning
    /// or initiating, cancels back to Standby immediately.
    pub fn disconnect(&mut self, reason: u8) -> Result<(), LinkError> {
        match &mut self.state {
            State::Connection(conn) => {
                if conn.request_terminate(reason) {
                    info!("disconnect requested (reason {:#04x})", reason);
                    Ok(())
                } else {
                    Err(LinkError::Busy)
                }
            }
            State::Scanning(_) => {
                self.radio.set_standby()?;
                self.state = State::Standby;
                Ok(())
            }
            State::Standby => Err(LinkError::NotConnected),
        }
    }

    /// Queues an outgoing Link-Layer message (an L2CAP-framed packet).
    ///
    /// The message is fragmented over as many connection events as needed.
    /// At most one message is in flight at a time; callers poll
    /// [`tx_idle`](Self::tx_idle) or simply retry on [`LinkError::Busy`].
    pub fn send_frame(&mut self, frame: &[u8]) -> Result<(), LinkError> {
        if frame.is_empty() || frame.len() > MAX_PDU_PAYLOAD {
            return Err(LinkError::Param);
        }
        match &mut self.state {
            State::Connection(conn) => {
                if conn.enqueue_msg(frame) {
                    Ok(())
                } else {
                    Err(LinkError::Busy)
                }
            }
            _ => Err(LinkError::NotConnected),
        }
    }

    /// Runs the Link-Layer once.
    ///
    /// In Standby this returns immediately. While scanning it performs one
    /// non-blocking pass (channel switching and advertisement processing).
    /// With a connection, it blocks through one connection event when the
    /// anchor point is due. Received data-channel payloads are handed to
    /// `sink` together with their LLID.
    ///
    /// This is the stack's only dispatch point: applications call it in
    /// their main loop, and the higher layers call it while they wait for
    /// responses.
    pub fn poll(
        &mut self,
        mut sink: impl FnMut(Llid, &[u8]),
    ) -> Result<Option<LinkEvent>, LinkError> {
        match &mut self.state {
            State::Standby => Ok(None),

            State::Scanning(sc) => {
                let now = self.timer.now();

                if let Some(deadline) = sc.deadline {
                    if now >= deadline {
                        debug!("scan timeout");
                        self.radio.set_standby()?;
                        self.state = State::Standby;
                        return Ok(Some(LinkEvent::ScanTimeout));
                    }
                }

                if now >= sc.next_switch {
                    sc.channel = sc.channel.cycle();
                    sc.next_switch = now + sc.params.dwell;
                    self.radio.set_standby()?;
                    self.radio.set_frequency(sc.channel.freq_hz())?;
                    self.radio.set_whitening_seed(sc.channel.whitening_iv())?;
                    self.radio.set_rx(None)?;
                }

                let irq = self.radio.irq_status()?;
                if irq.contains(Irq::CRC_ERROR) {
                    self.radio.clear_irq(Irq::CRC_ERROR | Irq::SYNC_VALID)?;
                    self.radio.set_rx(None)?;
                    return Ok(None);
                }
                if !irq.contains(Irq::RX_DONE) {
                    return Ok(None);
                }
                self.radio.clear_irq(irq)?;

                let (len, offset) = self.radio.rx_buffer_status()?;
                let mut raw = [0; MAX_ADV_PDU];
                let pdu_len = usize::from(len).min(raw.len());
                if pdu_len < 2 {
                    self.radio.set_rx(None)?;
                    return Ok(None);
                }
                self.radio.read_buffer(offset, &mut raw[..pdu_len])?;

                let header = AdvHeader::parse(&raw[..2]);
                let payload_len = usize::from(header.payload_length()).min(pdu_len - 2);
                let payload = &raw[2..2 + payload_len];
                let adv = match Advertisement::parse(header, payload) {
                    Ok(Some(adv)) => adv,
                    _ => {
                        self.radio.set_rx(None)?;
                        return Ok(None);
                    }
                };
                let rssi = self.radio.last_rssi().unwrap_or(0);
                trace!("ADV<- {:?} rssi={}", adv, rssi);

                let wants_connect = match &sc.intent {
                    Some(intent) => {
                        adv.pdu_type.is_connectable()
                            && (adv.advertiser == intent.peer
                                || sc.filter.map_or(false, |f| f(&adv)))
                    }
                    None => false,
                };

                if wants_connect {
                    let intent = sc.intent.take().unwrap();
                    let channel = sc.channel;
                    let event = initiate::<C>(
                        &mut self.radio,
                        &mut self.timer,
                        &mut self.rng,
                        &self.dev_addr,
                        &adv,
                        channel,
                        &intent,
                    );
                    return match event {
                        Ok(conn) => {
                            self.state = State::Connection(conn);
                            Ok(Some(LinkEvent::Connected))
                        }
                        Err(e) => {
                            // Back to plain scanning; the application owns
                            // the retry policy.
                            debug!("initiation failed: {:?}", e);
                            self.state = State::Standby;
                            Err(e)
                        }
                    };
                }

                let report = sc.filter.map_or(sc.intent.is_none(), |f| f(&adv));
                self.radio.set_rx(None)?;
                if report {
                    Ok(Some(LinkEvent::AdvReport {
                        advertiser: adv.advertiser,
                        rssi,
                        connectable: adv.pdu_type.is_connectable(),
                    }))
                } else {
                    Ok(None)
                }
            }

            State::Connection(conn) => {
                if self.timer.now() < conn.next_event_due() {
                    return Ok(None);
                }
                match conn.drive_event(&mut self.radio, &mut self.timer) {
                    EventOutcome::Advanced => Ok(None),
                    EventOutcome::Received { llid, len } => {
                        sink(llid, conn.rx_payload(len));
                        Ok(None)
                    }
                    EventOutcome::Closed { reason } => {
                        info!("connection closed, reason {:#04x}", reason);
                        let _ = self.radio.set_standby();
                        // Dropping the connection context is the Idle
                        // reset: fresh sequence numbers, event counter and
                        // all-channels map next time.
                        self.state = State::Standby;
                        Ok(Some(LinkEvent::Disconnected { reason }))
                    }
                }
            }
        }
    }

    /// Programs the radio for advertising channel reception and builds the
    /// scanner state.
    fn enter_scan(
        &mut self,
        params: &ScanParams,
        filter: Option<ScanFilter>,
        intent: Option<ConnectIntent>,
    ) -> Result<Scanner, LinkError> {
        let channel = AdvertisingChannel::first();
        self.radio.set_standby()?;
        self.radio.configure_ble(BleRole::Scanner)?;
        self.radio.set_sync_word(ADVERTISING_ADDRESS.to_le_bytes())?;
        self.radio.set_crc_init(CRC_PRESET)?;
        self.radio.set_frequency(channel.freq_hz())?;
        self.radio.set_whitening_seed(channel.whitening_iv())?;
        self.radio.clear_irq(Irq::all())?;
        self.radio.set_rx(None)?;

        let now = self.timer.now();
        debug!(
            "scan start (dwell {}, timeout {:?}, intent: {})",
            params.dwell,
            params.timeout,
            intent.is_some(),
        );
        Ok(Scanner {
            params: *params,
            filter,
            channel,
            next_switch: now + params.dwell,
            deadline: params.timeout.map(|t| now + t),
            intent,
        })
    }
}

/// Transmits `CONNECT_REQ` in response to `adv` and creates the connection
/// engine.
fn initiate<C: Config>(
    radio: &mut C::Radio,
    timer: &mut C::Timer,
    rng: &mut C::Rng,
    dev_addr: &DeviceAddress,
    adv: &Advertisement<'_>,
    channel: AdvertisingChannel,
    intent: &ConnectIntent,
) -> Result<Connection, LinkError> {
    let access_address = AccessAddress::generate(rng);
    let crc_init = generate_crc_init(rng);
    let hop = 5 + (rng.next_u32() % 12) as u8;
    let (interval, latency, timeout) = intent.wire;

    // WinSize 2 (2.5 ms), WinOffset 0: first anchor 1.25 ms after the
    // request ends.
    let lldata = ConnectRequestData::new(
        dev_addr,
        &adv.advertiser,
        access_address,
        crc_init,
        2,
        0,
        interval,
        latency,
        timeout,
        channel_map::ChannelMap::with_all_channels(),
        hop,
    );

    let mut header = AdvHeader::new(PduType::ConnectReq);
    header.set_tx_add(dev_addr.is_random());
    header.set_rx_add(adv.advertiser.is_random());
    header.set_payload_length(CONNECT_REQ_LEN);

    let mut pdu = [0; 2 + CONNECT_REQ_LEN as usize];
    pdu[..2].copy_from_slice(&header.to_u16().to_le_bytes());
    lldata
        .to_bytes(&mut ByteWriter::new(&mut pdu[2..]))
        .expect("CONNECT_REQ encoding");

    info!("CONNECT_REQ -> {:?}: {:?}", adv.advertiser, lldata);

    radio.set_standby()?;
    radio.write_buffer(0, &pdu)?;
    radio.clear_irq(Irq::all())?;
    radio.set_tx()?;
    let deadline = timer.now() + CONNECT_REQ_TX_TIMEOUT;
    connection::wait_irq(radio, timer, Irq::TX_DONE, deadline)?
        .ok_or(LinkError::Radio(RadioError::Timeout))?;

    // transmitWindowOffset is measured from the end of the CONNECT_REQ
    // plus the mandatory 1.25 ms delay.
    let anchor = timer.now() + Duration::from_micros(1_250) + lldata.win_offset();

    let conn = Connection::create(&lldata, anchor, intent.params.data_payload_limit);
    radio.configure_ble(BleRole::Master)?;
    conn.configure_radio(radio)?;
    Ok(conn)
}
