//! ### 5.4.6 - Multiplexer control channel
//!
//! Control messages travel in the information field of UIH frames on DLCI 0,
//! each encoded as `type | length | value`.
pub mod types;

use crate::error::Error;
use crate::frame::{CR, EA};
pub use types::*;

/// Message type octets with the EA and C/R bits cleared.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
enum Kind {
    ParameterNegotiation = 0x80,
    PowerSaving = 0x40,
    CloseDown = 0xC0,
    Test = 0x20,
    FlowControlOn = 0xA0,
    FlowControlOff = 0x60,
    ModemStatus = 0xE0,
    NonSupportedCommand = 0x10,
}

impl Kind {
    fn from_octet(octet: u8) -> Option<Self> {
        Some(match octet & !(EA | CR) {
            0x80 => Self::ParameterNegotiation,
            0x40 => Self::PowerSaving,
            0xC0 => Self::CloseDown,
            0x20 => Self::Test,
            0xA0 => Self::FlowControlOn,
            0x60 => Self::FlowControlOff,
            0xE0 => Self::ModemStatus,
            0x10 => Self::NonSupportedCommand,
            _ => return None,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum ControlMessage<'a> {
    ParameterNegotiation(ParameterNegotiation),
    PowerSaving,
    /// Close down the multiplexer, CLD.
    CloseDown,
    /// Test pattern, echoed back by the remote.
    Test(&'a [u8]),
    FlowControlOn,
    FlowControlOff,
    ModemStatus(ModemStatus),
    /// The remote did not understand the command whose type octet is
    /// carried here.
    NonSupportedCommand(u8),
    /// A message type this implementation does not handle.
    Unsupported { kind: u8, value: &'a [u8] },
}

impl<'a> ControlMessage<'a> {
    fn kind(&self) -> u8 {
        match self {
            Self::ParameterNegotiation(_) => Kind::ParameterNegotiation as u8,
            Self::PowerSaving => Kind::PowerSaving as u8,
            Self::CloseDown => Kind::CloseDown as u8,
            Self::Test(_) => Kind::Test as u8,
            Self::FlowControlOn => Kind::FlowControlOn as u8,
            Self::FlowControlOff => Kind::FlowControlOff as u8,
            Self::ModemStatus(_) => Kind::ModemStatus as u8,
            Self::NonSupportedCommand(_) => Kind::NonSupportedCommand as u8,
            Self::Unsupported { kind, .. } => *kind & !(EA | CR),
        }
    }

    fn value_len(&self) -> usize {
        match self {
            Self::ParameterNegotiation(_) => ParameterNegotiation::LEN,
            Self::Test(pattern) => pattern.len(),
            Self::ModemStatus(msc) => msc.encoded_len(),
            Self::NonSupportedCommand(_) => 1,
            Self::Unsupported { value, .. } => value.len(),
            Self::PowerSaving | Self::CloseDown | Self::FlowControlOn | Self::FlowControlOff => 0,
        }
    }

    fn write_value(&self, buf: &mut [u8]) {
        match self {
            Self::ParameterNegotiation(pn) => pn.write(buf),
            Self::Test(pattern) => buf.copy_from_slice(pattern),
            Self::ModemStatus(msc) => msc.write(buf),
            Self::NonSupportedCommand(kind) => buf[0] = *kind,
            Self::Unsupported { value, .. } => buf.copy_from_slice(value),
            Self::PowerSaving | Self::CloseDown | Self::FlowControlOn | Self::FlowControlOff => {}
        }
    }
}

/// A control message together with its command/response bit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct ControlFrame<'a> {
    pub command: bool,
    pub message: ControlMessage<'a>,
}

impl<'a> ControlFrame<'a> {
    pub const fn command(message: ControlMessage<'a>) -> Self {
        Self {
            command: true,
            message,
        }
    }

    pub const fn response(message: ControlMessage<'a>) -> Self {
        Self {
            command: false,
            message,
        }
    }

    /// The type octet as transmitted.
    pub fn type_octet(&self) -> u8 {
        self.message.kind() | if self.command { CR } else { 0 } | EA
    }

    /// The response a receiver owes for this frame, if any.
    ///
    /// Every supported command is acknowledged by echoing its value with C/R
    /// cleared. Unknown commands are answered with NSC. NSC itself is a
    /// response only and is never answered.
    pub fn reply(&self) -> Option<ControlFrame<'a>> {
        if !self.command {
            return None;
        }
        match self.message {
            ControlMessage::NonSupportedCommand(_) => None,
            ControlMessage::Unsupported { .. } => Some(Self::response(
                ControlMessage::NonSupportedCommand(self.type_octet()),
            )),
            message => Some(Self::response(message)),
        }
    }

    pub fn encoded_len(&self) -> usize {
        let len = self.message.value_len();
        1 + ea_len_octets(len) + len
    }

    /// Encode into `buf`, returning the number of octets written.
    pub fn encode(&self, buf: &mut [u8]) -> Result<usize, Error> {
        let value_len = self.message.value_len();
        if buf.len() < self.encoded_len() {
            return Err(Error::BufferTooSmall);
        }

        buf[0] = self.type_octet();
        let mut pos = 1;

        let mut remaining = value_len;
        loop {
            let octet = ((remaining & 0x7F) as u8) << 1;
            remaining >>= 7;
            if remaining == 0 {
                buf[pos] = octet | EA;
                pos += 1;
                break;
            }
            buf[pos] = octet;
            pos += 1;
        }

        self.message.write_value(&mut buf[pos..pos + value_len]);
        Ok(pos + value_len)
    }

    /// Decode the first message in `bytes`.
    ///
    /// Returns the message and the number of octets it occupied. A UIH frame
    /// on the control channel may carry several messages back to back.
    pub fn decode(bytes: &'a [u8]) -> Result<(Self, usize), Error> {
        let (&type_octet, rest) = bytes.split_first().ok_or(Error::Truncated)?;
        if type_octet & EA == 0 {
            return Err(Error::InvalidFrameType(type_octet));
        }

        let mut len = 0usize;
        let mut pos = 0;
        loop {
            let octet = *rest.get(pos).ok_or(Error::Truncated)?;
            if pos >= 2 {
                // Longer than any frame we could ever receive.
                return Err(Error::InvalidLength);
            }
            len |= ((octet >> 1) as usize) << (7 * pos);
            pos += 1;
            if octet & EA != 0 {
                break;
            }
        }

        let value = rest.get(pos..pos + len).ok_or(Error::Truncated)?;
        let command = type_octet & CR != 0;

        let message = match Kind::from_octet(type_octet) {
            Some(Kind::ParameterNegotiation) => {
                ControlMessage::ParameterNegotiation(ParameterNegotiation::parse(value)?)
            }
            Some(Kind::PowerSaving) => ControlMessage::PowerSaving,
            Some(Kind::CloseDown) => ControlMessage::CloseDown,
            Some(Kind::Test) => ControlMessage::Test(value),
            Some(Kind::FlowControlOn) => ControlMessage::FlowControlOn,
            Some(Kind::FlowControlOff) => ControlMessage::FlowControlOff,
            Some(Kind::ModemStatus) => ControlMessage::ModemStatus(ModemStatus::parse(value)?),
            Some(Kind::NonSupportedCommand) => {
                ControlMessage::NonSupportedCommand(*value.first().ok_or(Error::Truncated)?)
            }
            None => ControlMessage::Unsupported {
                kind: type_octet,
                value,
            },
        };

        Ok((Self { command, message }, 1 + pos + len))
    }
}

fn ea_len_octets(mut len: usize) -> usize {
    let mut octets = 1;
    while len > 0x7F {
        len >>= 7;
        octets += 1;
    }
    octets
}
