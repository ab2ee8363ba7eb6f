//! The Logical Link Control and Adaptation Protocol (L2CAP).
//!
//! LE L2CAP is thin: every upper-layer packet gets a 4-byte header carrying
//! its length and a channel identifier, and is then cut into data channel
//! PDU fragments (`LLID = 10` for the first, `01` for continuations). This
//! stack uses exactly one channel, the fixed Attribute Protocol channel
//! `0x0004`; frames addressed to any other CID are discarded on reception.

use crate::bytes::{ByteReader, ByteWriter};
use crate::link::data::Llid;
use crate::Error;
use core::fmt;
use log::debug;

/// An L2CAP channel identifier (CID).
///
/// Like TCP ports, a handful of identifiers are reserved for predefined
/// protocols; `0x0004` carries ATT on every LE connection without any setup.
#[derive(PartialEq, Eq, Copy, Clone)]
pub struct Channel(u16);

impl Channel {
    /// The null identifier. Never a valid destination.
    pub const NULL: Self = Channel(0x0000);

    /// The fixed channel of the Attribute Protocol (ATT).
    pub const ATT: Self = Channel(0x0004);

    /// LE L2CAP signaling channel.
    pub const LE_SIGNALING: Self = Channel(0x0005);

    /// LE Security Manager channel.
    pub const LE_SECURITY_MANAGER: Self = Channel(0x0006);

    /// Creates a channel from a raw CID.
    pub fn from_raw(raw: u16) -> Self {
        Channel(raw)
    }

    /// Returns the CID as a raw `u16`.
    pub fn as_raw(&self) -> u16 {
        self.0
    }
}

impl fmt::Debug for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#06X}", self.0)
    }
}

/// Size of the L2CAP basic header.
pub const HEADER_SIZE: usize = 4;

/// Encodes an L2CAP frame (header + payload) into `buf`.
///
/// Returns the number of bytes written. The result is what
/// [`LinkLayer::send_frame`](crate::link::LinkLayer::send_frame) expects;
/// the Link-Layer handles fragmentation.
pub fn encode_frame(channel: Channel, payload: &[u8], buf: &mut [u8]) -> Result<usize, Error> {
    if payload.len() > usize::from(u16::MAX) {
        return Err(Error::InvalidLength);
    }
    let mut writer = ByteWriter::new(buf);
    writer.write_u16_le(payload.len() as u16)?;
    writer.write_u16_le(channel.as_raw())?;
    writer.write_slice(payload)?;
    Ok(HEADER_SIZE + payload.len())
}

/// Reassembles L2CAP frames from data channel PDU fragments.
///
/// The assembler is generic over its storage so callers control the
/// maximum frame size they are willing to accept (the ATT client sizes it
/// for MTU_MAX; tests can hand it larger buffers).
pub struct Assembler<B> {
    buf: B,
    /// Bytes of the current partial frame present in `buf`.
    filled: usize,
    /// Total frame size (header + payload) once the header has arrived.
    expected: Option<usize>,
}

/// A fully reassembled L2CAP frame.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct Frame<'a> {
    /// Destination channel.
    pub channel: Channel,
    /// The upper-layer packet.
    pub payload: &'a [u8],
}

impl<B: AsRef<[u8]> + AsMut<[u8]>> Assembler<B> {
    /// Creates an assembler storing partial frames in `buf`.
    ///
    /// Frames larger than `buf` are discarded with a codec error.
    pub fn new(buf: B) -> Self {
        Assembler {
            buf,
            filled: 0,
            expected: None,
        }
    }

    /// Discards any partial frame, e.g. after a reconnect.
    pub fn reset(&mut self) {
        self.filled = 0;
        self.expected = None;
    }

    /// Feeds one data channel PDU payload into the assembler.
    ///
    /// Returns a complete frame when `fragment` finishes one. Frames for
    /// channels other than [`Channel::ATT`] are dropped here, matching the
    /// single-channel scope of this stack.
    pub fn push(&mut self, llid: Llid, fragment: &[u8]) -> Result<Option<Frame<'_>>, Error> {
        match llid {
            Llid::DataStart => {
                if self.filled != 0 {
                    debug!("l2cap: new frame interrupts partial reassembly");
                }
                self.filled = 0;
                self.expected = None;
                self.feed(fragment)?;
            }
            Llid::DataCont => {
                if self.filled == 0 {
                    // Continuation without a start; stale fragment.
                    return Ok(None);
                }
                self.feed(fragment)?;
            }
            _ => return Ok(None),
        }

        if self.expected.is_none() && self.filled >= HEADER_SIZE {
            let mut reader = ByteReader::new(&self.buf.as_ref()[..HEADER_SIZE]);
            let total = HEADER_SIZE + usize::from(reader.read_u16_le()?);
            if total > self.buf.as_ref().len() {
                self.reset();
                return Err(Error::InvalidLength);
            }
            self.expected = Some(total);
        }

        match self.expected {
            Some(expected) if self.filled >= expected => {
                if self.filled > expected {
                    self.reset();
                    return Err(Error::InvalidLength);
                }
                let mut reader = ByteReader::new(&self.buf.as_ref()[..expected]);
                let _len = reader.read_u16_le()?;
                let channel = Channel(reader.read_u16_le()?);
                self.filled = 0;
                self.expected = None;
                if channel != Channel::ATT {
                    debug!("l2cap: dropping frame for unsupported {:?}", channel);
                    return Ok(None);
                }
                Ok(Some(Frame {
                    channel,
                    payload: &self.buf.as_ref()[HEADER_SIZE..expected],
                }))
            }
            _ => Ok(None),
        }
    }

    fn feed(&mut self, fragment: &[u8]) -> Result<(), Error> {
        let buf = self.buf.as_mut();
        if self.filled + fragment.len() > buf.len() {
            self.filled = 0;
            self.expected = None;
            return Err(Error::InvalidLength);
        }
        buf[self.filled..self.filled + fragment.len()].copy_from_slice(fragment);
        self.filled += fragment.len();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encode_prepends_header() {
        let mut buf = [0; 16];
        let n = encode_frame(Channel::ATT, &[0x12, 0x0E, 0x00], &mut buf).unwrap();
        assert_eq!(&buf[..n], &[3, 0, 4, 0, 0x12, 0x0E, 0x00]);
    }

    #[test]
    fn single_fragment_frame() {
        let mut storage = [0; 64];
        let mut asm = Assembler::new(&mut storage);
        let frame = asm
            .push(Llid::DataStart, &[2, 0, 4, 0, 0xAA, 0xBB])
            .unwrap()
            .unwrap();
        assert_eq!(frame.channel, Channel::ATT);
        assert_eq!(frame.payload, &[0xAA, 0xBB]);
    }

    #[test]
    fn fragmented_frame_reassembles() {
        let mut storage = [0; 64];
        let mut asm = Assembler::new(&mut storage);
        // 5-byte payload split 4+3+2.
        assert!(asm.push(Llid::DataStart, &[5, 0, 4, 0]).unwrap().is_none());
        assert!(asm.push(Llid::DataCont, &[1, 2, 3]).unwrap().is_none());
        let done = asm.push(Llid::DataCont, &[4, 5]).unwrap().unwrap();
        assert_eq!(done.payload, &[1, 2, 3, 4, 5]);
    }

    #[test]
    fn non_att_channel_is_discarded() {
        let mut storage = [0; 64];
        let mut asm = Assembler::new(&mut storage);
        assert_eq!(asm.push(Llid::DataStart, &[1, 0, 5, 0, 0xFF]).unwrap(), None);
    }

    #[test]
    fn stale_continuation_is_ignored() {
        let mut storage = [0; 64];
        let mut asm = Assembler::new(&mut storage);
        assert_eq!(asm.push(Llid::DataCont, &[1, 2, 3]).unwrap(), None);
    }

    #[test]
    fn oversized_frame_is_rejected() {
        let mut storage = [0; 8];
        let mut asm = Assembler::new(&mut storage);
        assert_eq!(
            asm.push(Llid::DataStart, &[200, 0, 4, 0]),
            Err(Error::InvalidLength)
        );
    }

    #[test]
    fn empty_payload_frame() {
        let mut storage = [0; 16];
        let mut asm = Assembler::new(&mut storage);
        let frame = asm.push(Llid::DataStart, &[0, 0, 4, 0]).unwrap().unwrap();
        assert_eq!(frame.payload, &[] as &[u8]);
    }
}
