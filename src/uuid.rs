//! BLE UUID aliases.
//!
//! Bluetooth identifies services and characteristics by UUID. The services
//! this stack talks to (GATT declarations and the vendor UART services) all
//! use 16-bit aliases of the Bluetooth Base UUID, so only the 16-bit form is
//! implemented.

use crate::bytes::*;
use crate::Error;
use core::fmt;

/// A 16-bit UUID alias.
#[derive(PartialEq, Eq, Copy, Clone)]
pub struct Uuid16(pub u16);

impl Uuid16 {
    /// The *Primary Service* grouping declaration (GATT).
    pub const PRIMARY_SERVICE: Self = Uuid16(0x2800);

    /// The *Client Characteristic Configuration* descriptor.
    pub const CLIENT_CHARACTERISTIC_CONFIGURATION: Self = Uuid16(0x2902);

    /// Returns the raw 16-bit alias.
    pub fn as_u16(&self) -> u16 {
        self.0
    }
}

impl fmt::Debug for Uuid16 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:04X}", self.0)
    }
}

impl ToBytes for Uuid16 {
    fn to_bytes(&self, writer: &mut ByteWriter<'_>) -> Result<(), Error> {
        writer.write_u16_le(self.0)
    }
}

impl FromBytes<'_> for Uuid16 {
    fn from_bytes(bytes: &mut ByteReader<'_>) -> Result<Self, Error> {
        Ok(Uuid16(bytes.read_u16_le()?))
    }
}
