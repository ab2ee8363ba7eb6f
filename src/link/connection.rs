//! The Master-side connection event engine.
//!
//! Once a `CONNECT_REQ` has been transmitted, all Link-Layer activity
//! happens in *connection events*: at every anchor point the Master hops to
//! the next data channel, transmits exactly one PDU, waits `T_IFS`, and
//! listens for the Slave's single response. The stop-and-wait ARQ rides on
//! the one-bit `SN`/`NESN` header fields; scheduling rides on the anchor
//! point, advanced by the connection interval every event and guarded by
//! the supervision timeout.
//!
//! The engine is strictly foreground code. Every blocking wait in here is
//! bounded: the anchor wait by the next anchor point, IRQ waits by explicit
//! deadlines, and the RX window by the calculated window timeout.

use crate::link::access_address::AccessAddress;
use crate::link::advertising::ConnectRequestData;
use crate::link::channel_map::ChannelMap;
use crate::link::data::{Header, Llid};
use crate::link::llcp::{ControlOpcode, ControlPdu, MAX_CONTROL_PDU};
use crate::link::{FeatureSet, SeqNum};
use crate::bytes::{ByteReader, ByteWriter, FromBytes, ToBytes};
use crate::phy::DataChannel;
use crate::radio::{Irq, Radio, RadioError};
use crate::time::{Duration, Instant, Timer};
use crate::utils::{Hex, HexSlice};
use crate::BLUETOOTH_VERSION;
use core::cmp;
use core::num::Wrapping;
use log::{debug, info, trace};

/// Maximum data channel PDU payload this stack buffers (Bluetooth 4.2).
pub const MAX_PDU_PAYLOAD: usize = 251;

/// Payload limit of a single data PDU when the length extension is not in
/// use.
pub const DEFAULT_DATA_PAYLOAD: u8 = 27;

/// Disconnect reason: supervision timeout expired (*Connection Timeout*).
pub const REASON_CONNECTION_TIMEOUT: u8 = 0x08;

/// Disconnect reason: local user requested termination.
pub const REASON_REMOTE_USER_TERMINATED: u8 = 0x13;

/// Clock drift budget applied as window widening: 32 µs per second of
/// elapsed interval since the last valid anchor.
const DRIFT_US_PER_SECOND: u32 = 32;

/// RX window used while no packet has been received on the connection yet.
const FIRST_RX_WINDOW: Duration = Duration::from_millis(2);

/// Bound on waiting for the radio to report TX_DONE.
const TX_DONE_TIMEOUT: Duration = Duration::from_millis(3);

/// Counters exposed for diagnostics.
#[derive(Debug, Default, Copy, Clone)]
pub struct ConnectionStats {
    /// Events since the last CRC-valid reception that ended in a CRC
    /// failure or an empty RX window.
    pub consecutive_crc_errors: u32,
    /// CRC failures over the lifetime of the connection.
    pub total_crc_errors: u32,
    /// RX windows that closed without a sync match.
    pub total_timeouts: u32,
    /// Data PDUs (non-empty) received and acknowledged.
    pub packets_received: u32,
    /// Data PDUs (non-empty) transmitted and acknowledged.
    pub packets_sent: u32,
}

/// What the last transmitted, not-yet-acknowledged PDU was carrying.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
enum InFlight {
    None,
    Empty,
    Control,
    Data { len: u8 },
}

/// Result of servicing one connection event.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub(crate) enum EventOutcome {
    /// Event serviced (possibly skipped under slave latency); nothing for
    /// the upper layers.
    Advanced,
    /// A new data PDU was received; payload is in the RX buffer.
    Received { llid: Llid, len: u8 },
    /// The connection ended with the given reason code.
    Closed { reason: u8 },
}

/// Connection state and parameters of an established (or establishing)
/// connection.
pub struct Connection {
    access_address: AccessAddress,
    crc_init: u32,
    channel_map: ChannelMap,

    /// Number of (unmapped) channels to hop between connection events.
    hop: u8,

    conn_interval: Duration,
    slave_latency: u16,
    supervision_timeout: Duration,
    win_size: Duration,

    /// `connEventCounter`; wraps at 2^16 like the on-air instant values.
    event_counter: Wrapping<u16>,

    /// Unmapped channel of the *previous* event (`lastUnmappedChannel`).
    last_unmapped_channel: DataChannel,
    /// Mapped channel the current event uses.
    channel: DataChannel,

    /// Scheduled start of the next connection event.
    anchor: Instant,
    /// Accumulated clock-drift allowance since the last valid reception.
    window_widening: Duration,

    transmit_seq_num: SeqNum,
    next_expected_seq_num: SeqNum,
    /// Peer's MD bit from its last PDU.
    peer_more_data: bool,

    /// Whether any CRC-valid PDU has arrived on this connection.
    received_any: bool,
    /// Time of the last CRC-valid reception.
    last_rx: Instant,
    /// Events skipped in a row under slave latency.
    latency_skipped: u16,

    /// Outgoing message (an L2CAP-framed PDU sequence), fragmented across
    /// events at `data_payload_limit`.
    tx_msg: [u8; MAX_PDU_PAYLOAD],
    tx_len: usize,
    tx_offset: usize,
    data_payload_limit: u8,

    /// One-slot queue for an outgoing LL Control PDU.
    ctrl_buf: [u8; MAX_CONTROL_PDU],
    ctrl_len: u8,
    ctrl_pending: bool,

    in_flight: InFlight,

    /// Set once `LL_TERMINATE_IND` has been queued; holds the reason to
    /// report when the terminate is acknowledged.
    terminating: Option<u8>,
    /// Whether we already answered an `LL_VERSION_IND`.
    version_answered: bool,

    rx_buf: [u8; MAX_PDU_PAYLOAD],
    last_rssi: i8,
    stats: ConnectionStats,
}

impl Connection {
    /// Creates the Master-side connection state from the `LLData` we sent
    /// in the `CONNECT_REQ` PDU.
    ///
    /// `anchor` is the scheduled start of the first connection event
    /// (`CONNECT_REQ` end + 1.25 ms + `WinOffset`).
    pub(crate) fn create(lldata: &ConnectRequestData, anchor: Instant, data_payload_limit: u8) -> Self {
        let mut this = Self {
            access_address: lldata.access_address(),
            crc_init: lldata.crc_init(),
            channel_map: *lldata.channel_map(),
            hop: lldata.hop(),
            conn_interval: lldata.interval(),
            slave_latency: lldata.latency(),
            supervision_timeout: lldata.supervision_timeout(),
            win_size: lldata.win_size(),
            event_counter: Wrapping(0),
            last_unmapped_channel: DataChannel::new(0),
            channel: DataChannel::new(0),
            anchor,
            window_widening: Duration::ZERO,
            transmit_seq_num: SeqNum::ZERO,
            next_expected_seq_num: SeqNum::ZERO,
            peer_more_data: false,
            received_any: false,
            last_rx: anchor,
            latency_skipped: 0,
            tx_msg: [0; MAX_PDU_PAYLOAD],
            tx_len: 0,
            tx_offset: 0,
            data_payload_limit: data_payload_limit.clamp(1, MAX_PDU_PAYLOAD as u8),
            ctrl_buf: [0; MAX_CONTROL_PDU],
            ctrl_len: 0,
            ctrl_pending: false,
            in_flight: InFlight::None,
            terminating: None,
            version_answered: false,
            rx_buf: [0; MAX_PDU_PAYLOAD],
            last_rssi: 0,
            stats: ConnectionStats::default(),
        };

        // The first event already hops away from the synthetic channel 0.
        this.hop_channel();
        this
    }

    /// Programs the connection-specific radio parameters that stay fixed
    /// for the lifetime of the connection.
    pub(crate) fn configure_radio<R: Radio>(&self, radio: &mut R) -> Result<(), RadioError> {
        radio.set_sync_word(self.access_address.sync_word())?;
        radio.set_crc_init(self.crc_init)?;
        Ok(())
    }

    /// Returns the instant the engine next needs the CPU.
    pub(crate) fn next_event_due(&self) -> Instant {
        self.anchor.saturating_sub(self.window_widening)
    }

    /// Whether a CRC-valid PDU has been received on this connection.
    pub(crate) fn established(&self) -> bool {
        self.received_any
    }

    /// Whether the engine is waiting out a queued `LL_TERMINATE_IND`.
    pub(crate) fn terminating(&self) -> bool {
        self.terminating.is_some()
    }

    /// RSSI of the last received data PDU, in dBm.
    pub(crate) fn last_rssi(&self) -> i8 {
        self.last_rssi
    }

    pub(crate) fn stats(&self) -> ConnectionStats {
        self.stats
    }

    /// Whether the outgoing message buffer is free.
    pub(crate) fn tx_idle(&self) -> bool {
        self.tx_len == 0
    }

    /// Queues an outgoing message (already L2CAP-framed).
    ///
    /// The message is cut into data PDU fragments over the following
    /// connection events. Returns `false` when a message is still being
    /// delivered.
    pub(crate) fn enqueue_msg(&mut self, msg: &[u8]) -> bool {
        if self.tx_len != 0 || self.terminating.is_some() || msg.is_empty() || msg.len() > MAX_PDU_PAYLOAD
        {
            return false;
        }
        self.tx_msg[..msg.len()].copy_from_slice(msg);
        self.tx_len = msg.len();
        self.tx_offset = 0;
        true
    }

    /// Queues `LL_TERMINATE_IND` with the given reason.
    ///
    /// The connection reports [`EventOutcome::Closed`] once the terminate
    /// is acknowledged (or the supervision timeout gives up on it).
    pub(crate) fn request_terminate(&mut self, reason: u8) -> bool {
        // The control slot must be free: a queued (or in-flight) control
        // PDU would be clobbered mid-retransmission otherwise.
        if self.terminating.is_some() || self.ctrl_pending {
            return false;
        }
        self.queue_control(&ControlPdu::TerminateInd {
            error_code: Hex(reason),
        });
        self.terminating = Some(reason);
        true
    }

    /// Copy of the received payload after [`EventOutcome::Received`].
    pub(crate) fn rx_payload(&self, len: u8) -> &[u8] {
        &self.rx_buf[..usize::from(len)]
    }

    /// Services one connection event.
    ///
    /// Must be called once [`next_event_due`](Self::next_event_due) has
    /// passed. Radio failures are fatal for the event but not for the
    /// connection: the event is forfeited and rescheduled.
    pub(crate) fn drive_event<R: Radio, T: Timer>(
        &mut self,
        radio: &mut R,
        timer: &mut T,
    ) -> EventOutcome {
        // Slave latency: the peer is allowed to sleep through events while
        // we have nothing for it, so servicing them would be pointless.
        if self.can_skip_event() {
            self.latency_skipped += 1;
            trace!("#{} skipped (latency)", self.event_counter.0);
            self.advance();
            return self.check_supervision(timer);
        }
        self.latency_skipped = 0;

        let outcome = match self.radio_event(radio, timer) {
            Ok(outcome) => outcome,
            Err(e) => {
                // Forfeit the event, try again at the next anchor.
                debug!("#{} radio error: {}", self.event_counter.0, e);
                self.stats.total_timeouts += 1;
                self.stats.consecutive_crc_errors += 1;
                EventOutcome::Advanced
            }
        };
        let _ = radio.set_standby();

        if let EventOutcome::Closed { .. } = outcome {
            return outcome;
        }

        self.advance();
        match self.check_supervision(timer) {
            EventOutcome::Advanced => outcome,
            closed => closed,
        }
    }

    /// The radio half of a connection event: program channel, TX at the
    /// anchor, wait `T_IFS`, RX the response, process it.
    fn radio_event<R: Radio, T: Timer>(
        &mut self,
        radio: &mut R,
        timer: &mut T,
    ) -> Result<EventOutcome, RadioError> {
        radio.set_standby()?;
        radio.set_frequency(self.channel.freq_hz())?;
        radio.set_whitening_seed(self.channel.whitening_iv())?;

        // Build this event's PDU before the anchor arrives.
        let (header, payload_len) = self.build_tx_pdu();
        let mut pdu = [0; 2 + MAX_PDU_PAYLOAD];
        pdu[..2].copy_from_slice(&header.to_u16().to_le_bytes());
        pdu[2..2 + usize::from(payload_len)].copy_from_slice(self.tx_payload(payload_len));
        radio.write_buffer(0, &pdu[..2 + usize::from(payload_len)])?;

        timer.wait_until(self.next_event_due());

        radio.clear_irq(Irq::all())?;
        radio.set_tx()?;
        let deadline = timer.now() + TX_DONE_TIMEOUT;
        wait_irq(radio, timer, Irq::TX_DONE, deadline)?.ok_or(RadioError::Timeout)?;
        trace!(
            "#{} {:?} TX {:?} {:?}",
            self.event_counter.0,
            self.channel,
            header,
            HexSlice(self.tx_payload(payload_len)),
        );

        // T_IFS separates the end of our PDU from the start of the reply.
        timer.delay(Duration::T_IFS);

        let rx_window = self.rx_window();
        radio.set_rx(Some(rx_window))?;
        let deadline = timer.now() + rx_window + Duration::from_millis(1);
        let irq = wait_irq(
            radio,
            timer,
            Irq::RX_DONE | Irq::CRC_ERROR | Irq::RX_TIMEOUT,
            deadline,
        )?;

        match irq {
            Some(irq) if irq.contains(Irq::RX_DONE) => self.process_rx(radio, timer),
            Some(irq) if irq.contains(Irq::CRC_ERROR) => {
                self.stats.total_crc_errors += 1;
                self.stats.consecutive_crc_errors += 1;
                trace!("#{} BADCRC", self.event_counter.0);
                Ok(EventOutcome::Advanced)
            }
            _ => {
                self.stats.total_timeouts += 1;
                self.stats.consecutive_crc_errors += 1;
                trace!("#{} rx timeout", self.event_counter.0);
                Ok(EventOutcome::Advanced)
            }
        }
    }

    /// Handles a CRC-valid PDU sitting in the radio's RX buffer.
    fn process_rx<R: Radio, T: Timer>(
        &mut self,
        radio: &mut R,
        timer: &mut T,
    ) -> Result<EventOutcome, RadioError> {
        let (len, offset) = radio.rx_buffer_status()?;
        if usize::from(len) < 2 {
            // Shorter than the data channel header; treat like a lost event.
            self.stats.consecutive_crc_errors += 1;
            return Ok(EventOutcome::Advanced);
        }
        let mut raw = [0; 2 + MAX_PDU_PAYLOAD];
        let pdu_len = cmp::min(usize::from(len), raw.len());
        radio.read_buffer(offset, &mut raw[..pdu_len])?;

        let header = Header::parse(&raw[..2]);
        let payload_len = usize::from(header.payload_length());
        if payload_len + 2 > pdu_len {
            self.stats.consecutive_crc_errors += 1;
            return Ok(EventOutcome::Advanced);
        }
        let payload = &raw[2..2 + payload_len];

        self.last_rssi = radio.last_rssi().unwrap_or(self.last_rssi);
        self.received_any = true;
        self.stats.consecutive_crc_errors = 0;
        self.last_rx = timer.now();
        self.window_widening = Duration::ZERO;
        self.peer_more_data = header.md();

        trace!(
            "#{} {:?} RX {:?} {:?}",
            self.event_counter.0,
            self.channel,
            header,
            HexSlice(payload),
        );

        // The peer acknowledged our last PDU iff its NESN moved past our
        // transmit sequence number.
        if header.nesn() != self.transmit_seq_num {
            self.transmit_seq_num.toggle();
            self.on_acknowledged();
            if self.terminating.is_some() && !self.ctrl_pending {
                let reason = self.terminating.take().unwrap();
                info!("terminate acknowledged, closing (reason {:?})", Hex(reason));
                return Ok(EventOutcome::Closed { reason });
            }
        }

        // A new (non-retransmitted) PDU carries the SN we expect next.
        if header.sn() != self.next_expected_seq_num {
            return Ok(EventOutcome::Advanced);
        }

        let is_empty = header.llid() == Llid::DataCont && payload.is_empty();
        if is_empty {
            self.next_expected_seq_num.toggle();
            return Ok(EventOutcome::Advanced);
        }

        if header.llid() == Llid::Control {
            return Ok(self.process_control(payload));
        }

        // L2CAP traffic. The payload is consumed synchronously by the
        // caller, so it can always be acknowledged.
        self.next_expected_seq_num.toggle();
        self.stats.packets_received += 1;
        let len = payload_len as u8;
        self.rx_buf[..payload_len].copy_from_slice(payload);
        Ok(EventOutcome::Received {
            llid: header.llid(),
            len,
        })
    }

    /// Dispatches an incoming LL Control PDU.
    fn process_control(&mut self, payload: &[u8]) -> EventOutcome {
        let pdu = match ControlPdu::from_bytes(&mut ByteReader::new(payload)) {
            Ok(pdu) => pdu,
            Err(_) => {
                // Undecodable control PDU; don't acknowledge it.
                return EventOutcome::Advanced;
            }
        };
        info!("LLCP<- {:?}", pdu);

        let response = match pdu {
            ControlPdu::TerminateInd { error_code } => {
                self.next_expected_seq_num.toggle();
                return EventOutcome::Closed {
                    reason: error_code.0,
                };
            }
            ControlPdu::UnknownRsp { unknown_type } => {
                // We only originate TERMINATE_IND, which peers must accept;
                // log and move on.
                debug!("peer rejected {:?}", unknown_type);
                None
            }
            ControlPdu::FeatureReq { features_master } => Some(ControlPdu::FeatureRsp {
                features_used: features_master & FeatureSet::supported(),
            }),
            ControlPdu::FeatureRsp { .. } => None,
            ControlPdu::VersionInd { .. } => {
                if self.version_answered {
                    None
                } else {
                    self.version_answered = true;
                    Some(ControlPdu::VersionInd {
                        vers_nr: BLUETOOTH_VERSION,
                        comp_id: Hex(0xFFFF),
                        sub_vers_nr: Hex(0x0000),
                    })
                }
            }
            ControlPdu::Unknown { opcode, .. } => Some(ControlPdu::UnknownRsp {
                unknown_type: opcode,
            }),
        };

        match response {
            None => {
                self.next_expected_seq_num.toggle();
            }
            Some(rsp) => {
                if self.ctrl_pending || self.terminating.is_some() {
                    // Control slot occupied: withhold the acknowledgement so
                    // the peer retransmits once the slot is free.
                    debug!("control slot busy, NACKing {:?}", pdu.opcode());
                } else {
                    self.next_expected_seq_num.toggle();
                    info!("LLCP-> {:?}", rsp);
                    self.queue_control(&rsp);
                }
            }
        }
        EventOutcome::Advanced
    }

    /// Serializes a Control PDU into the one-slot control queue.
    fn queue_control(&mut self, pdu: &ControlPdu<'_>) {
        let mut buf = [0; MAX_CONTROL_PDU];
        let mut writer = ByteWriter::new(&mut buf);
        pdu.to_bytes(&mut writer)
            .expect("control PDU exceeds MAX_CONTROL_PDU");
        let len = MAX_CONTROL_PDU - writer.space_left();
        self.ctrl_buf = buf;
        self.ctrl_len = len as u8;
        self.ctrl_pending = true;
    }

    /// Chooses the PDU for this event and builds its header.
    ///
    /// While a PDU is unacknowledged the same one is chosen again with the
    /// same `SN` (only `NESN` is refreshed), which is exactly the
    /// retransmission the ARQ requires.
    fn build_tx_pdu(&mut self) -> (Header, u8) {
        if self.in_flight == InFlight::None {
            self.in_flight = if self.ctrl_pending {
                InFlight::Control
            } else if self.tx_offset < self.tx_len {
                let left = self.tx_len - self.tx_offset;
                InFlight::Data {
                    len: cmp::min(left, usize::from(self.data_payload_limit)) as u8,
                }
            } else {
                InFlight::Empty
            };
        }

        let (llid, len, md) = match self.in_flight {
            InFlight::Control => (
                Llid::Control,
                self.ctrl_len,
                self.tx_offset < self.tx_len,
            ),
            InFlight::Data { len } => {
                let llid = if self.tx_offset == 0 {
                    Llid::DataStart
                } else {
                    Llid::DataCont
                };
                let more = self.tx_offset + usize::from(len) < self.tx_len;
                (llid, len, more || self.ctrl_pending)
            }
            InFlight::Empty | InFlight::None => (Llid::DataCont, 0, false),
        };

        let mut header = Header::new(llid);
        header.set_payload_length(len);
        header.set_sn(self.transmit_seq_num);
        header.set_nesn(self.next_expected_seq_num);
        header.set_md(md);
        (header, len)
    }

    /// Returns the payload bytes for the PDU chosen by `build_tx_pdu`.
    fn tx_payload(&self, len: u8) -> &[u8] {
        match self.in_flight {
            InFlight::Control => &self.ctrl_buf[..usize::from(len)],
            InFlight::Data { .. } => &self.tx_msg[self.tx_offset..self.tx_offset + usize::from(len)],
            InFlight::Empty | InFlight::None => &[],
        }
    }

    /// Advances TX bookkeeping after the peer acknowledged our PDU.
    fn on_acknowledged(&mut self) {
        match self.in_flight {
            InFlight::Data { len } => {
                self.tx_offset += usize::from(len);
                if self.tx_offset >= self.tx_len {
                    self.tx_len = 0;
                    self.tx_offset = 0;
                    self.stats.packets_sent += 1;
                }
            }
            InFlight::Control => {
                self.ctrl_pending = false;
            }
            InFlight::Empty | InFlight::None => {}
        }
        self.in_flight = InFlight::None;
    }

    /// Whether this event may be skipped under slave latency.
    fn can_skip_event(&self) -> bool {
        self.slave_latency > 0
            && self.received_any
            && self.in_flight == InFlight::None
            && !self.ctrl_pending
            && self.tx_len == 0
            && self.terminating.is_none()
            && !self.peer_more_data
            && self.latency_skipped < self.slave_latency
    }

    /// The RX window for this event's response.
    fn rx_window(&self) -> Duration {
        if self.received_any {
            cmp::max(
                self.win_size + self.window_widening + self.window_widening,
                Duration::from_micros(500),
            )
        } else {
            cmp::max(FIRST_RX_WINDOW, self.win_size)
        }
    }

    /// Closes the event: bump the counter, move the anchor, widen the RX
    /// window, hop to the next channel.
    fn advance(&mut self) {
        self.event_counter += Wrapping(1);
        self.anchor += self.conn_interval;

        let interval_us = self.conn_interval.as_micros();
        let drift = (interval_us * DRIFT_US_PER_SECOND + 999_999) / 1_000_000;
        let widened = self.window_widening + Duration::from_micros(drift);
        self.window_widening = cmp::min(widened, Duration::from_micros(interval_us / 2));

        self.hop_channel();
    }

    /// Evaluates the supervision rules after an event.
    fn check_supervision<T: Timer>(&mut self, timer: &T) -> EventOutcome {
        let lost = if self.received_any {
            timer.now() - self.last_rx > self.supervision_timeout
        } else {
            self.stats.consecutive_crc_errors > 6
        };
        if lost {
            info!(
                "supervision timeout (failures={}, established={})",
                self.stats.consecutive_crc_errors, self.received_any
            );
            EventOutcome::Closed {
                reason: REASON_CONNECTION_TIMEOUT,
            }
        } else {
            EventOutcome::Advanced
        }
    }

    /// Advances `last_unmapped_channel` and `channel` to the data channel
    /// of the next connection event (channel selection algorithm #1).
    fn hop_channel(&mut self) {
        let unmapped = DataChannel::new((self.last_unmapped_channel.index() + self.hop) % 37);

        self.last_unmapped_channel = unmapped;
        self.channel = if self.channel_map.is_used(unmapped) {
            unmapped
        } else {
            let remapping_index = unmapped.index() % self.channel_map.num_used_channels();
            self.channel_map.by_index(remapping_index)
        };
    }
}

/// Polls the radio's IRQ status until one of `want` fires or `deadline`
/// passes. Fired bits are cleared before returning.
pub(crate) fn wait_irq<R: Radio, T: Timer>(
    radio: &mut R,
    timer: &mut T,
    want: Irq,
    deadline: Instant,
) -> Result<Option<Irq>, RadioError> {
    loop {
        let status = radio.irq_status()?;
        let hit = status & want;
        if !hit.is_empty() {
            radio.clear_irq(status)?;
            return Ok(Some(hit));
        }
        if timer.now() >= deadline {
            return Ok(None);
        }
    }
}
