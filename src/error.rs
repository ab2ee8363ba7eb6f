use core::fmt;

/// Errors returned by the wire-format codec.
#[derive(Debug, PartialEq, Eq, Copy, Clone)]
#[non_exhaustive]
pub enum Error {
    /// Packet specified an invalid length value or was too short.
    ///
    /// This indicates a protocol violation by the peer.
    InvalidLength,

    /// Invalid value supplied for a field.
    InvalidValue,

    /// Unexpectedly reached the end of a buffer while reading or writing.
    ///
    /// Returned when a PDU doesn't fit the destination buffer, and when
    /// decoding runs out of input prematurely.
    Eof,

    /// Parsing didn't consume the entire buffer.
    IncompleteParse,
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Error::InvalidLength => "invalid length value specified",
            Error::InvalidValue => "invalid value for field",
            Error::Eof => "end of buffer",
            Error::IncompleteParse => "excess data in buffer",
        })
    }
}
