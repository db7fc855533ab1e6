use crate::error::Error;
use crate::frame::EA;

/// V.24 signals carried in the MSC control octet (TS 27.010 5.4.6.3.7).
///
/// The EA bit is never part of the value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct V24Signals(u8);

impl V24Signals {
    /// Flow control, the sender is unable to accept frames.
    pub const FC: Self = Self(0x02);
    /// Ready to communicate (DSR/DTR).
    pub const RTC: Self = Self(0x04);
    /// Ready to receive (RTS/CTS).
    pub const RTR: Self = Self(0x08);
    /// Incoming call indicator (RI).
    pub const IC: Self = Self(0x40);
    /// Data valid (DCD).
    pub const DV: Self = Self(0x80);

    const MASK: u8 = 0xCE;

    pub const fn empty() -> Self {
        Self(0)
    }

    /// Ready to communicate and receive, with valid data. What a DTE
    /// normally asserts on an open DLC.
    pub const fn ready() -> Self {
        Self::RTC.union(Self::RTR).union(Self::DV)
    }

    pub const fn from_bits(bits: u8) -> Self {
        Self(bits & Self::MASK)
    }

    pub const fn bits(self) -> u8 {
        self.0
    }

    pub const fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    pub const fn union(self, other: Self) -> Self {
        Self(self.0 | other.0)
    }

    pub const fn difference(self, other: Self) -> Self {
        Self(self.0 & !other.0)
    }

    /// Whether the remote has asked us to stop sending.
    pub const fn flow_stopped(self) -> bool {
        self.contains(Self::FC)
    }
}

/// ### 5.4.6.3.7 - Modem Status Command (MSC)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct ModemStatus {
    pub dlci: u8,
    pub signals: V24Signals,
    /// Raw break octet, EA bit excluded.
    pub break_signal: Option<u8>,
}

impl ModemStatus {
    pub const fn new(dlci: u8, signals: V24Signals) -> Self {
        Self {
            dlci,
            signals,
            break_signal: None,
        }
    }

    pub(crate) fn encoded_len(&self) -> usize {
        if self.break_signal.is_some() {
            3
        } else {
            2
        }
    }

    pub(crate) fn write(&self, buf: &mut [u8]) {
        buf[0] = (self.dlci << 2) | 0x02 | EA;
        match self.break_signal {
            Some(brk) => {
                buf[1] = self.signals.bits();
                buf[2] = (brk & !EA) | EA;
            }
            None => buf[1] = self.signals.bits() | EA,
        }
    }

    pub(crate) fn parse(value: &[u8]) -> Result<Self, Error> {
        if value.len() < 2 {
            return Err(Error::Truncated);
        }
        let break_signal = if value[1] & EA == 0 {
            Some(*value.get(2).ok_or(Error::Truncated)? & !EA)
        } else {
            None
        };
        Ok(Self {
            dlci: value[0] >> 2,
            signals: V24Signals::from_bits(value[1]),
            break_signal,
        })
    }
}

/// Frame type used on a DLC, as negotiated with PN.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[repr(u8)]
pub enum InformationFrameType {
    Uih = 0,
    Ui = 1,
    I = 2,
}

/// ### 5.4.6.3.1 - DLC parameter negotiation (PN)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct ParameterNegotiation {
    pub dlci: u8,
    pub frame_type: InformationFrameType,
    /// Convergence layer, 1 to 4.
    pub convergence_layer: u8,
    pub priority: u8,
    /// Acknowledgement timer, in units of ten milliseconds.
    pub t1: u8,
    pub n1: u16,
    pub n2: u8,
    pub k: u8,
}

impl ParameterNegotiation {
    pub(crate) const LEN: usize = 8;

    pub(crate) fn write(&self, buf: &mut [u8]) {
        buf[0] = self.dlci & 0x3F;
        buf[1] = (self.frame_type as u8) | (self.convergence_layer.saturating_sub(1) & 0x0F) << 4;
        buf[2] = self.priority & 0x3F;
        buf[3] = self.t1;
        buf[4..6].copy_from_slice(&self.n1.to_le_bytes());
        buf[6] = self.n2;
        buf[7] = self.k & 0x07;
    }

    pub(crate) fn parse(value: &[u8]) -> Result<Self, Error> {
        if value.len() < Self::LEN {
            return Err(Error::Truncated);
        }
        let frame_type = match value[1] & 0x0F {
            0 => InformationFrameType::Uih,
            1 => InformationFrameType::Ui,
            2 => InformationFrameType::I,
            _ => return Err(Error::InvalidFrameType(value[1])),
        };
        Ok(Self {
            dlci: value[0] & 0x3F,
            frame_type,
            convergence_layer: (value[1] >> 4) + 1,
            priority: value[2] & 0x3F,
            t1: value[3],
            n1: u16::from_le_bytes([value[4], value[5]]),
            n2: value[6],
            k: value[7] & 0x07,
        })
    }
}
