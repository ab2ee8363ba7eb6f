use crate::bytes::*;
use crate::Error;
use bitflags::bitflags;

bitflags! {
    /// The set of optional Link-Layer features, exchanged via
    /// `LL_FEATURE_REQ` / `LL_FEATURE_RSP`.
    pub struct FeatureSet: u64 {
        /// Low-Energy data encryption (requires SMP).
        const LE_ENCRYPTION = 1 << 0;

        /// Connection parameters request procedure.
        const CONN_PARAM_REQ = 1 << 1;

        /// Support for the `LL_REJECT_IND_EXT` Control PDU.
        const EXTENDED_REJECT_INDICATION = 1 << 2;

        /// Slave-initiated feature exchange.
        const SLAVE_FEATURE_EXCHANGE = 1 << 3;

        /// Link-Layer ping exchange.
        const LE_PING = 1 << 4;

        /// Data channel PDUs larger than 27 payload bytes.
        const LE_PACKET_LENGTH_EXTENSION = 1 << 5;

        /// Untrackable randomized device addresses (LL Privacy).
        const LL_PRIVACY = 1 << 6;

        /// Extended scan filter policies.
        const EXT_SCANNER_FILTER_POLICIES = 1 << 7;
    }
}

impl FeatureSet {
    /// Returns the feature set supported by this stack.
    ///
    /// Every optional feature is handled by its mandatory fallback, so the
    /// set is empty.
    pub fn supported() -> Self {
        FeatureSet::empty()
    }
}

impl ToBytes for FeatureSet {
    fn to_bytes(&self, writer: &mut ByteWriter<'_>) -> Result<(), Error> {
        writer.write_u64_le(self.bits())
    }
}

impl<'a> FromBytes<'a> for FeatureSet {
    fn from_bytes(bytes: &mut ByteReader<'a>) -> Result<Self, Error> {
        Ok(Self::from_bits_truncate(bytes.read_u64_le()?))
    }
}
