//! Data channel PDU structures.

use crate::link::SeqNum;
use byteorder::{ByteOrder, LittleEndian};
use core::fmt;

/// 16-bit data channel header preceding the payload.
///
/// Layout (Bluetooth 4.2):
///
/// ```notrust
/// LSB                                                                MSB
/// +----------+---------+---------+---------+------------+--------------+
/// |   LLID   |  NESN   |   SN    |   MD    |    RFU     |    Length    |
/// | (2 bits) | (1 bit) | (1 bit) | (1 bit) |  (3 bits)  |   (8 bits)   |
/// +----------+---------+---------+---------+------------+--------------+
/// ```
///
/// The `NESN` and `SN` fields form the Link-Layer's stop-and-wait ARQ.
/// A received packet whose `SN` equals the receiver's `nextExpectedSeqNum`
/// carries new data (acknowledge by incrementing `nextExpectedSeqNum`); a
/// received `NESN` different from the receiver's `transmitSeqNum` means the
/// peer acknowledged our last packet (increment `transmitSeqNum`, advance
/// the TX queue), otherwise the last packet must be retransmitted
/// unchanged.
///
/// `MD` signals that the sender has more data queued for this connection
/// event. The `Length` field counts payload octets only (0..=251).
#[derive(Copy, Clone, PartialEq, Eq)]
pub struct Header(u16);

const NESN_MASK: u16 = 0b0000_0100;
const SN_MASK: u16 = 0b0000_1000;
const MD_MASK: u16 = 0b0001_0000;

impl Header {
    /// Creates a header with the given `LLID` field and all other fields
    /// (including the payload length) set to 0.
    pub fn new(llid: Llid) -> Self {
        Header(llid as u16)
    }

    /// Parses a header from the first 2 bytes of `raw`.
    ///
    /// # Panics
    ///
    /// Panics when `raw` contains fewer than 2 bytes.
    pub fn parse(raw: &[u8]) -> Self {
        Header(LittleEndian::read_u16(raw))
    }

    /// Returns the raw header.
    ///
    /// Transmitted LSB first as the first 2 octets of the PDU.
    pub fn to_u16(&self) -> u16 {
        self.0
    }

    /// Returns the `LLID` field (PDU type).
    pub fn llid(&self) -> Llid {
        match self.0 & 0b11 {
            0b00 => Llid::Reserved,
            0b01 => Llid::DataCont,
            0b10 => Llid::DataStart,
            0b11 => Llid::Control,
            _ => unreachable!(),
        }
    }

    /// Returns the length of the payload in octets.
    pub fn payload_length(&self) -> u8 {
        (self.0 >> 8) as u8
    }

    /// Sets the payload length field.
    pub fn set_payload_length(&mut self, len: u8) {
        self.0 = (u16::from(len) << 8) | (self.0 & 0x00FF);
    }

    /// Returns the `NESN` field (Next Expected Sequence Number).
    pub fn nesn(&self) -> SeqNum {
        SeqNum::from_bit(self.0 & NESN_MASK != 0)
    }

    /// Sets the `NESN` field.
    pub fn set_nesn(&mut self, nesn: SeqNum) {
        if nesn.bit() {
            self.0 |= NESN_MASK;
        } else {
            self.0 &= !NESN_MASK;
        }
    }

    /// Returns the `SN` field (Sequence Number).
    pub fn sn(&self) -> SeqNum {
        SeqNum::from_bit(self.0 & SN_MASK != 0)
    }

    /// Sets the `SN` field.
    pub fn set_sn(&mut self, sn: SeqNum) {
        if sn.bit() {
            self.0 |= SN_MASK;
        } else {
            self.0 &= !SN_MASK;
        }
    }

    /// Returns whether the `MD` (More Data) field is set.
    pub fn md(&self) -> bool {
        self.0 & MD_MASK != 0
    }

    /// Sets the `MD` field.
    pub fn set_md(&mut self, md: bool) {
        if md {
            self.0 |= MD_MASK;
        } else {
            self.0 &= !MD_MASK;
        }
    }
}

impl fmt::Debug for Header {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Header")
            .field("LLID", &self.llid())
            .field("NESN", &self.nesn())
            .field("SN", &self.sn())
            .field("MD", &self.md())
            .field("Length", &self.payload_length())
            .finish()
    }
}

/// Values of the `LLID` field in [`Header`].
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Llid {
    /// Reserved for future use.
    Reserved = 0b00,

    /// Continuation of an L2CAP message, or an empty PDU.
    DataCont = 0b01,

    /// Start of an L2CAP message (or a complete unfragmented one).
    DataStart = 0b10,

    /// LL Control PDU.
    Control = 0b11,
}
