//! Message types (RFC 7252 section 4.2/4.3).

use core::fmt;

/// The four CoAP message types, carried in bits 2-3 of the first header
/// byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Type {
    /// Requires an Acknowledgement or Reset.
    Confirmable,
    /// Fire and forget.
    NonConfirmable,
    /// Confirms a Confirmable message, possibly piggybacking a response.
    Acknowledgement,
    /// Rejects a message the receiver cannot or will not process.
    Reset,
}

impl Type {
    pub(crate) fn from_bits(bits: u8) -> Type {
        match bits & 0b11 {
            0 => Type::Confirmable,
            1 => Type::NonConfirmable,
            2 => Type::Acknowledgement,
            _ => Type::Reset,
        }
    }

    pub(crate) fn bits(self) -> u8 {
        match self {
            Type::Confirmable => 0,
            Type::NonConfirmable => 1,
            Type::Acknowledgement => 2,
            Type::Reset => 3,
        }
    }
}

impl fmt::Display for Type {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Type::Confirmable => "CON",
            Type::NonConfirmable => "NON",
            Type::Acknowledgement => "ACK",
            Type::Reset => "RST",
        };
        f.write_str(s)
    }
}
