//! Packet structures of the Link Layer Control Protocol (LLCP).
//!
//! Control PDUs travel on the data channels with `LLID = 11`. The subset
//! modeled as structured variants is what a minimal Master actually
//! exchanges; everything else decodes into [`ControlPdu::Unknown`] and is
//! answered with `LL_UNKNOWN_RSP`, which is the specified fallback for
//! unsupported opcodes.

use crate::bytes::*;
use crate::link::features::FeatureSet;
use crate::utils::Hex;
use crate::Error;

enum_with_unknown! {
    /// All defined LL Control PDU opcodes (not all of which are supported).
    #[derive(Debug, Copy, Clone, PartialEq, Eq)]
    pub enum ControlOpcode(u8) {
        ConnectionUpdateReq = 0x00,
        ChannelMapReq = 0x01,
        TerminateInd = 0x02,
        EncReq = 0x03,
        EncRsp = 0x04,
        StartEncReq = 0x05,
        StartEncRsp = 0x06,
        UnknownRsp = 0x07,
        FeatureReq = 0x08,
        FeatureRsp = 0x09,
        PauseEncReq = 0x0A,
        PauseEncRsp = 0x0B,
        VersionInd = 0x0C,
        RejectInd = 0x0D,
        SlaveFeatureReq = 0x0E,
        ConnectionParamReq = 0x0F,
        ConnectionParamRsp = 0x10,
        RejectIndExt = 0x11,
        PingReq = 0x12,
        PingRsp = 0x13,
        LengthReq = 0x14,
        LengthRsp = 0x15,
    }
}

enum_with_unknown! {
    /// `VersNr` values for `LL_VERSION_IND` PDUs.
    #[derive(Debug, Copy, Clone, PartialEq, Eq)]
    pub enum VersionNumber(u8) {
        V4_0 = 6,
        V4_1 = 7,
        V4_2 = 8,
        V5_0 = 9,
        V5_1 = 10,
    }
}

/// A structured representation of an LL Control PDU.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum ControlPdu<'a> {
    /// `0x02`/`LL_TERMINATE_IND` - close the connection.
    ///
    /// Sent by either side. The recipient considers the connection closed
    /// once the PDU is acknowledged.
    TerminateInd {
        /// Controller error code naming the disconnect reason.
        error_code: Hex<u8>,
    },

    /// `0x07`/`LL_UNKNOWN_RSP` - response to an unsupported Control PDU.
    UnknownRsp {
        /// Opcode of the PDU that wasn't understood.
        unknown_type: ControlOpcode,
    },

    /// `0x08`/`LL_FEATURE_REQ` - Master requests the Slave's feature set.
    FeatureReq {
        /// Feature set supported by the Master.
        features_master: FeatureSet,
    },

    /// `0x09`/`LL_FEATURE_RSP` - answers `LL_FEATURE_REQ` with the feature
    /// set to be used for the connection (the AND of both sides).
    FeatureRsp {
        /// Features usable on this connection.
        features_used: FeatureSet,
    },

    /// `0x0C`/`LL_VERSION_IND` - Bluetooth version indication.
    VersionInd {
        vers_nr: VersionNumber,
        comp_id: Hex<u16>,
        sub_vers_nr: Hex<u16>,
    },

    /// Catch-all for unsupported opcodes.
    Unknown {
        /// The opcode that wasn't understood.
        opcode: ControlOpcode,
        /// Raw `CtrData` following the opcode.
        ctr_data: &'a [u8],
    },
}

impl ControlPdu<'_> {
    /// Returns the opcode of this Control PDU.
    pub fn opcode(&self) -> ControlOpcode {
        match self {
            ControlPdu::TerminateInd { .. } => ControlOpcode::TerminateInd,
            ControlPdu::UnknownRsp { .. } => ControlOpcode::UnknownRsp,
            ControlPdu::FeatureReq { .. } => ControlOpcode::FeatureReq,
            ControlPdu::FeatureRsp { .. } => ControlOpcode::FeatureRsp,
            ControlPdu::VersionInd { .. } => ControlOpcode::VersionInd,
            ControlPdu::Unknown { opcode, .. } => *opcode,
        }
    }
}

impl<'a> FromBytes<'a> for ControlPdu<'a> {
    fn from_bytes(bytes: &mut ByteReader<'a>) -> Result<Self, Error> {
        let opcode = ControlOpcode::from(bytes.read_u8()?);
        Ok(match opcode {
            ControlOpcode::TerminateInd => ControlPdu::TerminateInd {
                error_code: Hex(bytes.read_u8()?),
            },
            ControlOpcode::UnknownRsp => ControlPdu::UnknownRsp {
                unknown_type: ControlOpcode::from(bytes.read_u8()?),
            },
            ControlOpcode::FeatureReq => ControlPdu::FeatureReq {
                features_master: FeatureSet::from_bytes(bytes)?,
            },
            ControlOpcode::FeatureRsp => ControlPdu::FeatureRsp {
                features_used: FeatureSet::from_bytes(bytes)?,
            },
            ControlOpcode::VersionInd => ControlPdu::VersionInd {
                vers_nr: VersionNumber::from(bytes.read_u8()?),
                comp_id: Hex(bytes.read_u16_le()?),
                sub_vers_nr: Hex(bytes.read_u16_le()?),
            },
            _ => ControlPdu::Unknown {
                opcode,
                ctr_data: bytes.read_rest(),
            },
        })
    }
}

impl<'a> ToBytes for ControlPdu<'a> {
    fn to_bytes(&self, buffer: &mut ByteWriter<'_>) -> Result<(), Error> {
        buffer.write_u8(self.opcode().into())?;
        match self {
            ControlPdu::TerminateInd { error_code } => buffer.write_u8(error_code.0),
            ControlPdu::UnknownRsp { unknown_type } => buffer.write_u8(u8::from(*unknown_type)),
            ControlPdu::FeatureReq { features_master } => features_master.to_bytes(buffer),
            ControlPdu::FeatureRsp { features_used } => features_used.to_bytes(buffer),
            ControlPdu::VersionInd {
                vers_nr,
                comp_id,
                sub_vers_nr,
            } => {
                buffer.write_u8(u8::from(*vers_nr))?;
                buffer.write_u16_le(comp_id.0)?;
                buffer.write_u16_le(sub_vers_nr.0)
            }
            ControlPdu::Unknown { ctr_data, .. } => buffer.write_slice(ctr_data),
        }
    }
}

/// The longest Control PDU this stack emits (`LL_FEATURE_RSP`: opcode plus
/// 8 feature octets).
pub const MAX_CONTROL_PDU: usize = 9;

#[cfg(test)]
mod tests {
    use super::*;

    fn round_trip(pdu: ControlPdu<'_>, expect: &[u8]) {
        let mut buf = [0; 32];
        let mut writer = ByteWriter::new(&mut buf);
        pdu.to_bytes(&mut writer).unwrap();
        let len = 32 - writer.space_left();
        assert_eq!(&buf[..len], expect);
        assert!(len <= MAX_CONTROL_PDU);

        let decoded = ControlPdu::from_bytes(&mut ByteReader::new(&buf[..len])).unwrap();
        assert_eq!(decoded, pdu);
    }

    #[test]
    fn terminate_ind() {
        round_trip(
            ControlPdu::TerminateInd {
                error_code: Hex(0x13),
            },
            &[0x02, 0x13],
        );
    }

    #[test]
    fn unknown_rsp() {
        round_trip(
            ControlPdu::UnknownRsp {
                unknown_type: ControlOpcode::ChannelMapReq,
            },
            &[0x07, 0x01],
        );
    }

    #[test]
    fn feature_rsp_zero_bitmap() {
        round_trip(
            ControlPdu::FeatureRsp {
                features_used: FeatureSet::empty(),
            },
            &[0x09, 0, 0, 0, 0, 0, 0, 0, 0],
        );
    }

    #[test]
    fn version_ind() {
        round_trip(
            ControlPdu::VersionInd {
                vers_nr: VersionNumber::V4_2,
                comp_id: Hex(0xFFFF),
                sub_vers_nr: Hex(0x0000),
            },
            &[0x0C, 8, 0xFF, 0xFF, 0x00, 0x00],
        );
    }

    #[test]
    fn unknown_opcode_keeps_ctr_data() {
        let raw = [0x14, 0xAA, 0xBB];
        let decoded = ControlPdu::from_bytes(&mut ByteReader::new(&raw)).unwrap();
        match decoded {
            ControlPdu::Unknown { opcode, ctr_data } => {
                assert_eq!(opcode, ControlOpcode::LengthReq);
                assert_eq!(ctr_data, &[0xAA, 0xBB]);
            }
            other => panic!("unexpected decode: {:?}", other),
        }
    }
}
