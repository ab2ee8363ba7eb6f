//! Advertising Data (AD) structures.
//!
//! The advertising payload after the advertiser address is a sequence of
//! length-prefixed AD structures. A scanner only needs to pick out a couple
//! of them - the advertised name and 16-bit service UUIDs - to decide
//! whether a device is interesting; everything else is passed through raw.

use crate::bytes::*;
use crate::uuid::Uuid16;
use crate::Error;
use core::str;

/// A single decoded AD structure.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum AdStructure<'a> {
    /// Device flags and baseband capabilities (`0x01`).
    Flags(u8),

    /// Incomplete or complete list of 16-bit service UUIDs (`0x02`/`0x03`),
    /// as raw little-endian pairs.
    ServiceUuids16 { complete: bool, uuids: &'a [u8] },

    /// Shortened local name (`0x08`).
    ShortenedLocalName(&'a str),

    /// Complete local name (`0x09`).
    CompleteLocalName(&'a str),

    /// Any other AD type, stored raw.
    Unknown { ty: u8, data: &'a [u8] },
}

impl<'a> AdStructure<'a> {
    /// Iterates over the AD structures in an advertising data payload.
    ///
    /// Decoding is lenient the way scanners have to be: a malformed trailing
    /// structure ends iteration instead of poisoning the advertisement.
    pub fn iter(data: &'a [u8]) -> AdStructureIter<'a> {
        AdStructureIter {
            reader: ByteReader::new(data),
        }
    }

    /// Searches `data` for a local name, preferring the complete one.
    pub fn find_local_name(data: &'a [u8]) -> Option<&'a str> {
        let mut short = None;
        for ad in AdStructure::iter(data) {
            match ad {
                AdStructure::CompleteLocalName(name) => return Some(name),
                AdStructure::ShortenedLocalName(name) => short = Some(name),
                _ => {}
            }
        }
        short
    }

    /// Returns whether `data` advertises the given 16-bit service UUID.
    pub fn advertises_service(data: &'a [u8], uuid: Uuid16) -> bool {
        AdStructure::iter(data).any(|ad| match ad {
            AdStructure::ServiceUuids16 { uuids, .. } => uuids
                .chunks_exact(2)
                .any(|c| u16::from_le_bytes([c[0], c[1]]) == uuid.as_u16()),
            _ => false,
        })
    }

    fn decode(bytes: &mut ByteReader<'a>) -> Result<Self, Error> {
        let len = bytes.read_u8()?;
        if len == 0 {
            return Err(Error::InvalidLength);
        }
        let mut body = ByteReader::new(bytes.read_slice(usize::from(len))?);
        let ty = body.read_u8()?;
        let data = body.read_rest();
        Ok(match ty {
            0x01 => AdStructure::Flags(*data.first().ok_or(Error::Eof)?),
            0x02 => AdStructure::ServiceUuids16 {
                complete: false,
                uuids: data,
            },
            0x03 => AdStructure::ServiceUuids16 {
                complete: true,
                uuids: data,
            },
            0x08 => {
                AdStructure::ShortenedLocalName(str::from_utf8(data).map_err(|_| Error::InvalidValue)?)
            }
            0x09 => {
                AdStructure::CompleteLocalName(str::from_utf8(data).map_err(|_| Error::InvalidValue)?)
            }
            _ => AdStructure::Unknown { ty, data },
        })
    }
}

/// Iterator over the AD structures of an advertising payload.
pub struct AdStructureIter<'a> {
    reader: ByteReader<'a>,
}

impl<'a> Iterator for AdStructureIter<'a> {
    type Item = AdStructure<'a>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.reader.is_empty() {
            return None;
        }
        match AdStructure::decode(&mut self.reader) {
            Ok(ad) => Some(ad),
            Err(_) => {
                self.reader.read_rest();
                None
            }
        }
    }
}
