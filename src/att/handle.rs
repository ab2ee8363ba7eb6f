//! Attribute handles.

use crate::bytes::*;
use crate::Error;
use core::fmt;

/// A 16-bit handle uniquely identifying an attribute on an ATT server.
///
/// The `0x0000` handle (`NULL`) never names an actual attribute; it shows
/// up as a placeholder in error responses.
#[derive(Copy, Clone, PartialEq, Eq)]
pub struct Handle(u16);

impl Handle {
    /// The null placeholder handle.
    pub const NULL: Self = Handle(0x0000);

    /// Creates an attribute handle from a raw `u16`.
    pub const fn from_raw(raw: u16) -> Self {
        Handle(raw)
    }

    /// Returns the raw 16-bit value of this handle.
    pub fn as_u16(&self) -> u16 {
        self.0
    }
}

impl fmt::Debug for Handle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#06X}", self.0)
    }
}

impl FromBytes<'_> for Handle {
    fn from_bytes(bytes: &mut ByteReader<'_>) -> Result<Self, Error> {
        Ok(Handle(bytes.read_u16_le()?))
    }
}

impl ToBytes for Handle {
    fn to_bytes(&self, writer: &mut ByteWriter<'_>) -> Result<(), Error> {
        writer.write_u16_le(self.0)
    }
}
