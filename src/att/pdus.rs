//! Packets and types used by the Attribute Protocol.

use crate::att::Handle;
use crate::bytes::*;
use crate::utils::HexSlice;
use crate::uuid::Uuid16;
use crate::Error;

enum_with_unknown! {
    /// Error codes carried in `ErrorRsp` PDUs, sent by the server when a
    /// request cannot be completed.
    #[derive(Copy, Clone, Debug, PartialEq, Eq)]
    pub enum ErrorCode(u8) {
        /// The handle isn't valid on this server.
        InvalidHandle = 0x01,
        /// Attribute isn't readable.
        ReadNotPermitted = 0x02,
        /// Attribute isn't writable.
        WriteNotPermitted = 0x03,
        /// Attribute PDU is invalid.
        InvalidPdu = 0x04,
        /// Authentication needed before the attribute can be accessed.
        InsufficientAuthentication = 0x05,
        /// Server doesn't support this operation.
        RequestNotSupported = 0x06,
        /// Offset past the end of the attribute.
        InvalidOffset = 0x07,
        /// Authorization needed before the attribute can be accessed.
        InsufficientAuthorization = 0x08,
        /// Too many queued prepare-writes.
        PrepareQueueFull = 0x09,
        /// No attribute in the requested handle range.
        AttributeNotFound = 0x0A,
        /// Attribute can't be read with a *Read Blob* request.
        AttributeNotLong = 0x0B,
        /// Encryption key in use is too weak.
        InsufficientEncryptionKeySize = 0x0C,
        /// Attribute value has an invalid length for the operation.
        InvalidAttributeValueLength = 0x0D,
        /// "Unlikely" error; the request couldn't be completed.
        UnlikelyError = 0x0E,
        /// The attribute needs an encrypted connection.
        InsufficientEncryption = 0x0F,
        /// Grouping attribute type not supported in this request.
        UnsupportedGroupType = 0x10,
        /// Server ran out of resources.
        InsufficientResources = 0x11,
    }
}

enum_with_unknown! {
    /// ATT operation opcodes.
    ///
    /// Bit 6 marks *commands* (no response follows); bit 7 marks PDUs
    /// trailed by an authentication signature.
    #[derive(Debug, Copy, Clone, PartialEq, Eq)]
    pub enum Opcode(u8) {
        ErrorRsp = 0x01,
        ExchangeMtuReq = 0x02,
        ExchangeMtuRsp = 0x03,
        FindInformationReq = 0x04,
        FindInformationRsp = 0x05,
        FindByTypeValueReq = 0x06,
        FindByTypeValueRsp = 0x07,
        ReadByTypeReq = 0x08,
        ReadByTypeRsp = 0x09,
        ReadReq = 0x0A,
        ReadRsp = 0x0B,
        ReadBlobReq = 0x0C,
        ReadBlobRsp = 0x0D,
        ReadMultipleReq = 0x0E,
        ReadMultipleRsp = 0x0F,
        ReadByGroupReq = 0x10,
        ReadByGroupRsp = 0x11,
        WriteReq = 0x12,
        WriteRsp = 0x13,
        WriteCommand = 0x52,
        HandleValueNotification = 0x1B,
        HandleValueIndication = 0x1D,
        HandleValueConfirmation = 0x1E,
    }
}

impl Opcode {
    /// Returns the raw opcode byte.
    pub fn raw(&self) -> u8 {
        u8::from(*self)
    }

    /// Whether this opcode is a command (never answered by the server).
    pub fn is_command(&self) -> bool {
        self.raw() & 0x40 != 0
    }

    /// The response opcode a request of this opcode is answered with, or
    /// `None` for PDUs that don't follow the request/response pattern.
    pub fn response_opcode(&self) -> Option<Opcode> {
        Some(match self {
            Opcode::ExchangeMtuReq => Opcode::ExchangeMtuRsp,
            Opcode::FindInformationReq => Opcode::FindInformationRsp,
            Opcode::FindByTypeValueReq => Opcode::FindByTypeValueRsp,
            Opcode::ReadByTypeReq => Opcode::ReadByTypeRsp,
            Opcode::ReadReq => Opcode::ReadRsp,
            Opcode::ReadBlobReq => Opcode::ReadBlobRsp,
            Opcode::ReadMultipleReq => Opcode::ReadMultipleRsp,
            Opcode::ReadByGroupReq => Opcode::ReadByGroupRsp,
            Opcode::WriteReq => Opcode::WriteRsp,
            _ => return None,
        })
    }
}

/// Structured representation of the ATT messages a client exchanges.
///
/// Server-only request types this stack never sends (queued writes, find
/// requests) decode into [`AttMsg::Unknown`] and are ignored by the client
/// state machine.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum AttMsg<'a> {
    /// A request failed.
    ErrorRsp {
        /// Opcode of the failed request.
        request_opcode: Opcode,
        /// Handle the failure relates to (may be `NULL`).
        handle: Handle,
        /// Why the request failed.
        error_code: ErrorCode,
    },
    ExchangeMtuReq {
        mtu: u16,
    },
    ExchangeMtuRsp {
        mtu: u16,
    },
    /// Find attributes by 16-bit type in a handle range (used for service
    /// discovery by UUID).
    ReadByTypeReq {
        start: Handle,
        end: Handle,
        attribute_type: Uuid16,
    },
    ReadByTypeRsp {
        /// Size of each handle/value pair in `data_list`.
        length: u8,
        data_list: HexSlice<&'a [u8]>,
    },
    ReadReq {
        handle: Handle,
    },
    ReadRsp {
        value: HexSlice<&'a [u8]>,
    },
    WriteReq {
        handle: Handle,
        value: HexSlice<&'a [u8]>,
    },
    WriteRsp,
    WriteCommand {
        handle: Handle,
        value: HexSlice<&'a [u8]>,
    },
    HandleValueNotification {
        handle: Handle,
        value: HexSlice<&'a [u8]>,
    },
    HandleValueIndication {
        handle: Handle,
        value: HexSlice<&'a [u8]>,
    },
    HandleValueConfirmation,
    /// Any PDU this client doesn't model.
    Unknown {
        opcode: Opcode,
        params: HexSlice<&'a [u8]>,
    },
}

impl<'a> AttMsg<'a> {
    /// Returns the opcode identifying this message on the wire.
    pub fn opcode(&self) -> Opcode {
        match self {
            AttMsg::ErrorRsp { .. } => Opcode::ErrorRsp,
            AttMsg::ExchangeMtuReq { .. } => Opcode::ExchangeMtuReq,
            AttMsg::ExchangeMtuRsp { .. } => Opcode::ExchangeMtuRsp,
            AttMsg::ReadByTypeReq { .. } => Opcode::ReadByTypeReq,
            AttMsg::ReadByTypeRsp { .. } => Opcode::ReadByTypeRsp,
            AttMsg::ReadReq { .. } => Opcode::ReadReq,
            AttMsg::ReadRsp { .. } => Opcode::ReadRsp,
            AttMsg::WriteReq { .. } => Opcode::WriteReq,
            AttMsg::WriteRsp => Opcode::WriteRsp,
            AttMsg::WriteCommand { .. } => Opcode::WriteCommand,
            AttMsg::HandleValueNotification { .. } => Opcode::HandleValueNotification,
            AttMsg::HandleValueIndication { .. } => Opcode::HandleValueIndication,
            AttMsg::HandleValueConfirmation => Opcode::HandleValueConfirmation,
            AttMsg::Unknown { opcode, .. } => *opcode,
        }
    }
}

impl<'a> FromBytes<'a> for AttMsg<'a> {
    fn from_bytes(bytes: &mut ByteReader<'a>) -> Result<Self, Error> {
        let opcode = Opcode::from(bytes.read_u8()?);
        Ok(match opcode {
            Opcode::ErrorRsp => AttMsg::ErrorRsp {
                request_opcode: Opcode::from(bytes.read_u8()?),
                handle: Handle::from_bytes(bytes)?,
                error_code: ErrorCode::from(bytes.read_u8()?),
            },
            Opcode::ExchangeMtuReq => AttMsg::ExchangeMtuReq {
                mtu: bytes.read_u16_le()?,
            },
            Opcode::ExchangeMtuRsp => AttMsg::ExchangeMtuRsp {
                mtu: bytes.read_u16_le()?,
            },
            Opcode::ReadByTypeReq => AttMsg::ReadByTypeReq {
                start: Handle::from_bytes(bytes)?,
                end: Handle::from_bytes(bytes)?,
                attribute_type: Uuid16::from_bytes(bytes)?,
            },
            Opcode::ReadByTypeRsp => AttMsg::ReadByTypeRsp {
                length: bytes.read_u8()?,
                data_list: HexSlice(bytes.read_rest()),
            },
            Opcode::ReadReq => AttMsg::ReadReq {
                handle: Handle::from_bytes(bytes)?,
            },
            Opcode::ReadRsp => AttMsg::ReadRsp {
                value: HexSlice(bytes.read_rest()),
            },
            Opcode::WriteReq => AttMsg::WriteReq {
                handle: Handle::from_bytes(bytes)?,
                value: HexSlice(bytes.read_rest()),
            },
            Opcode::WriteRsp => AttMsg::WriteRsp,
            Opcode::WriteCommand => AttMsg::WriteCommand {
                handle: Handle::from_bytes(bytes)?,
                value: HexSlice(bytes.read_rest()),
            },
            Opcode::HandleValueNotification => AttMsg::HandleValueNotification {
                handle: Handle::from_bytes(bytes)?,
                value: HexSlice(bytes.read_rest()),
            },
            Opcode::HandleValueIndication => AttMsg::HandleValueIndication {
                handle: Handle::from_bytes(bytes)?,
                value: HexSlice(bytes.read_rest()),
            },
            Opcode::HandleValueConfirmation => AttMsg::HandleValueConfirmation,
            _ => AttMsg::Unknown {
                opcode,
                params: HexSlice(bytes.read_rest()),
            },
        })
    }
}

impl<'a> ToBytes for AttMsg<'a> {
    fn to_bytes(&self, writer: &mut ByteWriter<'_>) -> Result<(), Error> {
        writer.write_u8(self.opcode().raw())?;
        match *self {
            AttMsg::ErrorRsp {
                request_opcode,
                handle,
                error_code,
            } => {
                writer.write_u8(request_opcode.raw())?;
                handle.to_bytes(writer)?;
                writer.write_u8(error_code.into())?;
            }
            AttMsg::ExchangeMtuReq { mtu } | AttMsg::ExchangeMtuRsp { mtu } => {
                writer.write_u16_le(mtu)?;
            }
            AttMsg::ReadByTypeReq {
                start,
                end,
                attribute_type,
            } => {
                start.to_bytes(writer)?;
                end.to_bytes(writer)?;
                attribute_type.to_bytes(writer)?;
            }
            AttMsg::ReadByTypeRsp { length, data_list } => {
                writer.write_u8(length)?;
                writer.write_slice(data_list.0)?;
            }
            AttMsg::ReadReq { handle } => {
                handle.to_bytes(writer)?;
            }
            AttMsg::ReadRsp { value } => {
                writer.write_slice(value.0)?;
            }
            AttMsg::WriteReq { handle, value }
            | AttMsg::WriteCommand { handle, value }
            | AttMsg::HandleValueNotification { handle, value }
            | AttMsg::HandleValueIndication { handle, value } => {
                handle.to_bytes(writer)?;
                writer.write_slice(value.0)?;
            }
            AttMsg::WriteRsp | AttMsg::HandleValueConfirmation => {}
            AttMsg::Unknown { params, .. } => {
                writer.write_slice(params.0)?;
            }
        }
        Ok(())
    }
}
