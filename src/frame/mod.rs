//! ### 5.2 - Frame structure
//!
//! Encoding and streaming decoding of 3GPP TS 27.010 frames, in both the
//! basic and the advanced (transparency) option.
mod decoder;
pub mod fcs;

pub use decoder::Decoder;

use crate::error::Error;

/// Opening and closing flag, basic option.
pub const BASIC_FLAG: u8 = 0xF9;
/// Opening and closing flag, advanced option.
pub const ADVANCED_FLAG: u8 = 0x7E;
/// Control escape octet, advanced option.
pub const CONTROL_ESCAPE: u8 = 0x7D;
/// Escaped octets are transmitted XOR'ed with this mask.
pub const ESCAPE_MASK: u8 = 0x20;

const XON: u8 = 0x11;
const XOFF: u8 = 0x13;

/// Data link connection identifier. 0 is the multiplexer control channel.
pub type Dlci = u8;

/// Highest DLCI the address octet can carry.
pub const MAX_DLCI: Dlci = 63;
pub const CONTROL_DLCI: Dlci = 0;

/// Longest information field the two octet length indicator can express.
pub const MAX_BASIC_INFORMATION_LEN: usize = 0x7FFF;

/// Extension bit, set on the last octet of an EA encoded field.
pub(crate) const EA: u8 = 0x01;
pub(crate) const CR: u8 = 0x02;
const PF: u8 = 0x10;

/// Transparency mechanism, the `<mode>` parameter of `AT+CMUX`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[repr(u8)]
pub enum Transparency {
    /// Length indicated frames delimited by `0xF9`.
    Basic = 0,
    /// HDLC-like frames delimited by `0x7E`, with control octet transparency.
    Advanced = 1,
}

impl Transparency {
    pub const fn flag(self) -> u8 {
        match self {
            Self::Basic => BASIC_FLAG,
            Self::Advanced => ADVANCED_FLAG,
        }
    }
}

/// Which end of the link started the multiplexer.
///
/// The host that issued `AT+CMUX` is the initiator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Role {
    Initiator,
    Responder,
}

/// ### 5.2.1.2 - Address field
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct Address {
    pub dlci: Dlci,
    /// Command/response bit.
    pub cr: bool,
}

impl Address {
    pub const fn new(dlci: u8, cr: bool) -> Self {
        Self { dlci, cr }
    }

    /// Address of a command sent by `role`.
    pub fn command(dlci: u8, role: Role) -> Self {
        Self::new(dlci, role == Role::Initiator)
    }

    /// Address of a response sent by `role`.
    pub fn response(dlci: u8, role: Role) -> Self {
        Self::new(dlci, role == Role::Responder)
    }

    /// Whether a frame with this address, received by `receiver`, is a
    /// command.
    pub fn is_command(&self, receiver: Role) -> bool {
        match receiver {
            Role::Initiator => !self.cr,
            Role::Responder => self.cr,
        }
    }

    pub fn to_byte(self) -> u8 {
        (self.dlci << 2) | if self.cr { CR } else { 0 } | EA
    }

    pub fn from_byte(byte: u8) -> Result<Self, Error> {
        if byte & EA == 0 {
            return Err(Error::InvalidAddress);
        }
        Ok(Self {
            dlci: byte >> 2,
            cr: byte & CR != 0,
        })
    }
}

/// ### 5.2.1.3 - Control field
///
/// Discriminants are the control octet with the P/F bit cleared.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[repr(u8)]
pub enum FrameType {
    /// Set Asynchronous Balanced Mode
    Sabm = 0x2F,
    /// Unnumbered Acknowledgement
    Ua = 0x63,
    /// Disconnected Mode
    Dm = 0x0F,
    /// Disconnect
    Disc = 0x43,
    /// Unnumbered Information with Header check
    Uih = 0xEF,
    /// Unnumbered Information
    Ui = 0x03,
}

impl FrameType {
    /// Control octet for this type with the given P/F bit.
    pub fn control(self, poll_final: bool) -> u8 {
        self as u8 | if poll_final { PF } else { 0 }
    }

    /// Split a control octet into frame type and P/F bit.
    pub fn from_control(control: u8) -> Result<(Self, bool), Error> {
        let frame_type = match control & !PF {
            0x2F => Self::Sabm,
            0x63 => Self::Ua,
            0x0F => Self::Dm,
            0x43 => Self::Disc,
            0xEF => Self::Uih,
            0x03 => Self::Ui,
            _ => return Err(Error::InvalidFrameType(control)),
        };
        Ok((frame_type, control & PF != 0))
    }

    /// The FCS of every frame type except UIH also covers the information
    /// field.
    pub fn fcs_covers_information(self) -> bool {
        !matches!(self, Self::Uih)
    }
}

/// A single multiplexer frame, borrowing its information field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct Frame<'a> {
    pub address: Address,
    pub frame_type: FrameType,
    pub poll_final: bool,
    pub information: &'a [u8],
}

impl<'a> Frame<'a> {
    pub const fn new(
        address: Address,
        frame_type: FrameType,
        poll_final: bool,
        information: &'a [u8],
    ) -> Self {
        Self {
            address,
            frame_type,
            poll_final,
            information,
        }
    }

    pub fn sabm(dlci: u8, role: Role) -> Frame<'static> {
        Frame::new(Address::command(dlci, role), FrameType::Sabm, true, &[])
    }

    pub fn disc(dlci: u8, role: Role) -> Frame<'static> {
        Frame::new(Address::command(dlci, role), FrameType::Disc, true, &[])
    }

    pub fn ua(dlci: u8, role: Role, final_bit: bool) -> Frame<'static> {
        Frame::new(Address::response(dlci, role), FrameType::Ua, final_bit, &[])
    }

    pub fn dm(dlci: u8, role: Role, final_bit: bool) -> Frame<'static> {
        Frame::new(Address::response(dlci, role), FrameType::Dm, final_bit, &[])
    }

    pub fn uih(dlci: u8, role: Role, information: &'a [u8]) -> Self {
        Self::new(Address::command(dlci, role), FrameType::Uih, false, information)
    }

    pub fn dlci(&self) -> Dlci {
        self.address.dlci
    }

    /// Number of octets [`Frame::encode`] writes, flags included.
    pub fn encoded_len(&self, transparency: Transparency) -> usize {
        match transparency {
            Transparency::Basic => {
                let len_octets = if self.information.len() > 0x7F { 2 } else { 1 };
                // flag, address, control, length, information, FCS, flag
                5 + len_octets + self.information.len()
            }
            Transparency::Advanced => {
                let escaped = |b: &u8| if needs_escape(*b) { 2 } else { 1 };
                let header = [self.address.to_byte(), self.frame_type.control(self.poll_final)];
                2 + header.iter().map(escaped).sum::<usize>()
                    + self.information.iter().map(escaped).sum::<usize>()
                    + escaped(&self.fcs(&header))
            }
        }
    }

    /// Encode the frame into `buf`, opening and closing flag included.
    ///
    /// Returns the number of octets written.
    pub fn encode(&self, transparency: Transparency, buf: &mut [u8]) -> Result<usize, Error> {
        if self.address.dlci > MAX_DLCI {
            return Err(Error::InvalidAddress);
        }

        match transparency {
            Transparency::Basic => self.encode_basic(buf),
            Transparency::Advanced => self.encode_advanced(buf),
        }
    }

    fn fcs(&self, header: &[u8]) -> u8 {
        let mut crc = fcs::Crc::new();
        crc.update(header);
        if self.frame_type.fcs_covers_information() {
            crc.update(self.information);
        }
        crc.fcs()
    }

    fn encode_basic(&self, buf: &mut [u8]) -> Result<usize, Error> {
        let len = self.information.len();
        if len > MAX_BASIC_INFORMATION_LEN {
            return Err(Error::FrameTooLarge);
        }
        if buf.len() < self.encoded_len(Transparency::Basic) {
            return Err(Error::BufferTooSmall);
        }

        let mut header = [
            self.address.to_byte(),
            self.frame_type.control(self.poll_final),
            0,
            0,
        ];
        let header_len = if len > 0x7F {
            header[2] = ((len & 0x7F) << 1) as u8;
            header[3] = (len >> 7) as u8;
            4
        } else {
            header[2] = ((len as u8) << 1) | EA;
            3
        };
        let header = &header[..header_len];

        let mut pos = 0;
        buf[pos] = BASIC_FLAG;
        pos += 1;
        buf[pos..pos + header_len].copy_from_slice(header);
        pos += header_len;
        buf[pos..pos + len].copy_from_slice(self.information);
        pos += len;
        buf[pos] = self.fcs(header);
        pos += 1;
        buf[pos] = BASIC_FLAG;
        pos += 1;

        Ok(pos)
    }

    fn encode_advanced(&self, buf: &mut [u8]) -> Result<usize, Error> {
        let header = [self.address.to_byte(), self.frame_type.control(self.poll_final)];
        let fcs = self.fcs(&header);

        let mut w = EscapingWriter { buf, pos: 0 };
        w.put_raw(ADVANCED_FLAG)?;
        for &b in header.iter().chain(self.information).chain(core::iter::once(&fcs)) {
            w.put(b)?;
        }
        w.put_raw(ADVANCED_FLAG)?;

        Ok(w.pos)
    }
}

pub(crate) fn needs_escape(byte: u8) -> bool {
    matches!(byte, ADVANCED_FLAG | CONTROL_ESCAPE | XON | XOFF)
}

struct EscapingWriter<'b> {
    buf: &'b mut [u8],
    pos: usize,
}

impl EscapingWriter<'_> {
    fn put_raw(&mut self, byte: u8) -> Result<(), Error> {
        let slot = self.buf.get_mut(self.pos).ok_or(Error::BufferTooSmall)?;
        *slot = byte;
        self.pos += 1;
        Ok(())
    }

    fn put(&mut self, byte: u8) -> Result<(), Error> {
        if needs_escape(byte) {
            self.put_raw(CONTROL_ESCAPE)?;
            self.put_raw(byte ^ ESCAPE_MASK)
        } else {
            self.put_raw(byte)
        }
    }
}
