//! Advertising channel operations.
//!
//! The scanner half of this module parses the advertising PDUs a Central
//! cares about (the connectable advertisement types and scan responses);
//! the initiator half builds the `CONNECT_REQ` PDU that moves a connection
//! onto the data channels.

use crate::bytes::*;
use crate::link::access_address::AccessAddress;
use crate::link::channel_map::ChannelMap;
use crate::link::device_address::{AddressKind, DeviceAddress};
use crate::time::Duration;
use crate::utils::Hex;
use crate::Error;
use byteorder::{ByteOrder, LittleEndian};
use core::fmt;

/// 16-bit advertising channel PDU header preceding the payload.
///
/// ```notrust
/// LSB                                                                     MSB
/// +------------+------------+---------+---------+--------------+------------+
/// |  PDU Type  |    RFU     |  TxAdd  |  RxAdd  |    Length    |    RFU     |
/// |  (4 bits)  |  (2 bits)  | (1 bit) | (1 bit) |   (6 bits)   |  (2 bits)  |
/// +------------+------------+---------+---------+--------------+------------+
/// ```
///
/// `TxAdd`/`RxAdd` flag the sender's and receiver's addresses as random
/// (set) or public (clear) for the PDU types that carry addresses.
#[derive(Copy, Clone)]
pub struct Header(u16);

const TXADD_MASK: u16 = 0b0000_0000_0100_0000;
const RXADD_MASK: u16 = 0b0000_0000_1000_0000;

impl Header {
    /// Creates a header with the given PDU type and all flags clear.
    pub fn new(ty: PduType) -> Self {
        Header(u16::from(u8::from(ty)))
    }

    /// Parses a header from the first 2 bytes of `raw`.
    ///
    /// # Panics
    ///
    /// Panics when `raw` contains fewer than 2 bytes.
    pub fn parse(raw: &[u8]) -> Self {
        Header(LittleEndian::read_u16(raw))
    }

    /// Returns the raw header, to be transmitted LSB first.
    pub fn to_u16(&self) -> u16 {
        self.0
    }

    /// Returns the PDU type specified in the header.
    pub fn type_(&self) -> PduType {
        PduType::from((self.0 & 0b1111) as u8)
    }

    /// Returns the state of the `TxAdd` field.
    pub fn tx_add(&self) -> bool {
        self.0 & TXADD_MASK != 0
    }

    /// Sets the `TxAdd` field.
    pub fn set_tx_add(&mut self, value: bool) {
        if value {
            self.0 |= TXADD_MASK;
        } else {
            self.0 &= !TXADD_MASK;
        }
    }

    /// Returns the state of the `RxAdd` field.
    pub fn rx_add(&self) -> bool {
        self.0 & RXADD_MASK != 0
    }

    /// Sets the `RxAdd` field.
    pub fn set_rx_add(&mut self, value: bool) {
        if value {
            self.0 |= RXADD_MASK;
        } else {
            self.0 &= !RXADD_MASK;
        }
    }

    /// Returns the payload length in octets (6..=37 for valid PDUs).
    pub fn payload_length(&self) -> u8 {
        ((self.0 >> 8) & 0b11_1111) as u8
    }

    /// Sets the payload length.
    ///
    /// # Panics
    ///
    /// Panics unless `length` is in range 6..=37.
    pub fn set_payload_length(&mut self, length: u8) {
        assert!((6..=37).contains(&length));
        self.0 = (self.0 & !0b11_1111_0000_0000) | (u16::from(length) << 8);
    }
}

impl fmt::Debug for Header {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Header")
            .field("type", &self.type_())
            .field("TxAdd", &self.tx_add())
            .field("RxAdd", &self.rx_add())
            .field("len", &self.payload_length())
            .finish()
    }
}

enum_with_unknown! {
    /// 4-bit advertising channel PDU type.
    #[derive(Debug, Copy, Clone, PartialEq, Eq)]
    pub enum PduType(u8) {
        /// Connectable undirected advertising event.
        AdvInd = 0b0000,
        /// Connectable directed advertising event.
        AdvDirectInd = 0b0001,
        /// Non-connectable undirected advertising event.
        AdvNonconnInd = 0b0010,
        ScanReq = 0b0011,
        ScanRsp = 0b0100,
        ConnectReq = 0b0101,
        /// Scannable undirected advertising event.
        AdvScanInd = 0b0110,
    }
}

impl PduType {
    /// Returns whether a Central may respond to this PDU type with a
    /// `CONNECT_REQ`.
    pub fn is_connectable(&self) -> bool {
        matches!(
            self,
            PduType::AdvInd | PduType::AdvDirectInd | PduType::AdvScanInd
        )
    }
}

/// An advertisement received while scanning, reduced to the fields a
/// Central-role scanner uses.
#[derive(Debug, Copy, Clone)]
pub struct Advertisement<'a> {
    /// The PDU type that carried the advertisement.
    pub pdu_type: PduType,
    /// The advertiser's device address.
    pub advertiser: DeviceAddress,
    /// Advertising data following the address (AD structures), empty for
    /// directed advertisements.
    pub data: &'a [u8],
}

impl<'a> Advertisement<'a> {
    /// Parses an advertising channel payload received with `header`.
    ///
    /// Returns `None` for PDU types that don't carry an advertiser address
    /// in their first 6 payload octets (scan and connect requests put the
    /// scanner's address first).
    pub fn parse(header: Header, payload: &'a [u8]) -> Result<Option<Self>, Error> {
        let ty = header.type_();
        match ty {
            PduType::AdvInd | PduType::AdvDirectInd | PduType::AdvNonconnInd
            | PduType::AdvScanInd | PduType::ScanRsp => {}
            _ => return Ok(None),
        }

        let mut bytes = ByteReader::new(payload);
        let addr = bytes.read_array::<6>()?;
        let kind = if header.tx_add() {
            AddressKind::Random
        } else {
            AddressKind::Public
        };
        let data = if ty == PduType::AdvDirectInd {
            // Remainder is the initiator address, not AD structures.
            &[]
        } else {
            bytes.read_rest()
        };

        Ok(Some(Advertisement {
            pdu_type: ty,
            advertiser: DeviceAddress::new(addr, kind),
            data,
        }))
    }
}

/// The `LLData` carried in a `CONNECT_REQ` PDU: everything the two sides
/// need to agree on before hopping onto the data channels.
///
/// On-air layout of the 34-byte PDU body:
///
/// ```notrust
/// InitA[6] AdvA[6] AA[4] CRCInit[3] WinSize[1] WinOffset[2]
/// Interval[2] Latency[2] Timeout[2] ChM[5] Hop:5|SCA:3 [1]
/// ```
///
/// `WinSize`, `WinOffset` and `Interval` are in units of 1.25 ms, `Timeout`
/// in units of 10 ms. All multi-byte fields are little-endian.
#[derive(Copy, Clone, PartialEq, Eq)]
pub struct ConnectRequestData {
    init_addr: [u8; 6],
    adv_addr: [u8; 6],
    access_address: AccessAddress,
    crc_init: u32,
    win_size: u8,
    win_offset: u16,
    interval: u16,
    latency: u16,
    timeout: u16,
    channel_map: ChannelMap,
    hop: u8,
    sca: u8,
}

/// The length of the encoded `CONNECT_REQ` PDU body.
pub const CONNECT_REQ_LEN: u8 = 34;

impl ConnectRequestData {
    /// Assembles the `LLData` for an outgoing connection request.
    ///
    /// Raw field values are in their on-air units (1.25 ms for `interval`
    /// and `win_offset`/`win_size`, 10 ms for `timeout`).
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        initiator: &DeviceAddress,
        advertiser: &DeviceAddress,
        access_address: AccessAddress,
        crc_init: u32,
        win_size: u8,
        win_offset: u16,
        interval: u16,
        latency: u16,
        timeout: u16,
        channel_map: ChannelMap,
        hop: u8,
    ) -> Self {
        debug_assert!((5..=16).contains(&hop));
        Self {
            init_addr: *initiator.raw(),
            adv_addr: *advertiser.raw(),
            access_address,
            crc_init: crc_init & 0x00FF_FFFF,
            win_size,
            win_offset,
            interval,
            latency,
            timeout,
            channel_map,
            // SCA 0: the 251..500 ppm worst-case accuracy bucket.
            sca: 0,
            hop,
        }
    }

    /// Returns the Access Address the connection will use.
    pub fn access_address(&self) -> AccessAddress {
        self.access_address
    }

    /// Returns the CRC initialization value for the connection (24 bit).
    pub fn crc_init(&self) -> u32 {
        self.crc_init
    }

    /// Returns the channel map in use when the connection starts.
    pub fn channel_map(&self) -> &ChannelMap {
        &self.channel_map
    }

    /// Returns the channel hop distance (5..=16).
    pub fn hop(&self) -> u8 {
        self.hop
    }

    /// Returns the slave latency in connection events.
    pub fn latency(&self) -> u16 {
        self.latency
    }

    /// Returns the transmit window size.
    pub fn win_size(&self) -> Duration {
        Duration::from_micros(u32::from(self.win_size) * 1_250)
    }

    /// Returns the transmit window offset, measured from the end of the
    /// `CONNECT_REQ` plus 1.25 ms.
    pub fn win_offset(&self) -> Duration {
        Duration::from_micros(u32::from(self.win_offset) * 1_250)
    }

    /// Returns the connection event interval.
    pub fn interval(&self) -> Duration {
        Duration::from_micros(u32::from(self.interval) * 1_250)
    }

    /// Returns the connection supervision timeout.
    pub fn supervision_timeout(&self) -> Duration {
        Duration::from_micros(u32::from(self.timeout) * 10_000)
    }
}

impl<'a> FromBytes<'a> for ConnectRequestData {
    fn from_bytes(bytes: &mut ByteReader<'a>) -> Result<Self, Error> {
        let init_addr = bytes.read_array::<6>()?;
        let adv_addr = bytes.read_array::<6>()?;
        let access_address =
            AccessAddress::from_raw(bytes.read_u32_le()?).ok_or(Error::InvalidValue)?;
        let crc_init = bytes.read_u24_le()?;
        let win_size = bytes.read_u8()?;
        let win_offset = bytes.read_u16_le()?;
        let interval = bytes.read_u16_le()?;
        let latency = bytes.read_u16_le()?;
        let timeout = bytes.read_u16_le()?;
        let channel_map = ChannelMap::from_raw(bytes.read_array()?);
        let hop_sca = bytes.read_u8()?;
        Ok(Self {
            init_addr,
            adv_addr,
            access_address,
            crc_init,
            win_size,
            win_offset,
            interval,
            latency,
            timeout,
            channel_map,
            hop: hop_sca & 0b1_1111,
            sca: hop_sca >> 5,
        })
    }
}

impl ToBytes for ConnectRequestData {
    fn to_bytes(&self, writer: &mut ByteWriter<'_>) -> Result<(), Error> {
        writer.write_slice(&self.init_addr)?;
        writer.write_slice(&self.adv_addr)?;
        writer.write_u32_le(self.access_address.raw())?;
        writer.write_u24_le(self.crc_init)?;
        writer.write_u8(self.win_size)?;
        writer.write_u16_le(self.win_offset)?;
        writer.write_u16_le(self.interval)?;
        writer.write_u16_le(self.latency)?;
        writer.write_u16_le(self.timeout)?;
        writer.write_slice(&self.channel_map.to_raw())?;
        writer.write_u8((self.sca << 5) | (self.hop & 0b1_1111))?;
        Ok(())
    }
}

impl fmt::Debug for ConnectRequestData {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectRequestData")
            .field("aa", &self.access_address)
            .field("crc_init", &Hex(self.crc_init))
            .field("interval", &self.interval())
            .field("hop", &self.hop)
            .finish()
    }
}
