use heapless::Vec;

use super::{
    fcs::Crc, Address, Frame, FrameType, Transparency, ADVANCED_FLAG, BASIC_FLAG,
    CONTROL_ESCAPE, EA, ESCAPE_MASK, XOFF, XON,
};
use crate::error::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
enum State {
    /// Discarding octets until an opening flag.
    Hunt,
    /// After a flag, waiting for the address octet.
    Address,
    Control,
    Length,
    LengthHigh,
    Information,
    Fcs,
    Close,
    /// Advanced option: collecting unescaped octets until the next flag.
    Body,
}

enum Step {
    Continue,
    Frame,
    Error(Error),
}

/// Streaming frame decoder.
///
/// Bytes may be fed in arbitrary chunks; a frame split across reads is
/// reassembled. `N` is the largest information field accepted.
pub struct Decoder<const N: usize> {
    transparency: Transparency,
    state: State,

    address: Address,
    frame_type: FrameType,
    poll_final: bool,

    /// Expected information length, basic option.
    len: usize,
    crc: Crc,
    information: Vec<u8, N>,

    /// Advanced option: next octet is escaped.
    escaped: bool,
    /// Advanced option: last octet seen, which is the FCS once the flag
    /// arrives.
    pending: Option<u8>,
}

impl<const N: usize> Decoder<N> {
    pub fn new(transparency: Transparency) -> Self {
        Self {
            transparency,
            state: State::Hunt,
            address: Address::new(0, false),
            frame_type: FrameType::Uih,
            poll_final: false,
            len: 0,
            crc: Crc::new(),
            information: Vec::new(),
            escaped: false,
            pending: None,
        }
    }

    pub fn transparency(&self) -> Transparency {
        self.transparency
    }

    /// Drop any partially received frame and hunt for the next flag.
    pub fn reset(&mut self) {
        self.state = State::Hunt;
        self.information.clear();
        self.escaped = false;
        self.pending = None;
    }

    /// Whether the decoder is in the middle of a frame.
    pub fn is_busy(&self) -> bool {
        !matches!(self.state, State::Hunt | State::Address)
    }

    /// Consume bytes until one frame has been decoded, an error has been
    /// detected, or `bytes` runs out.
    ///
    /// Returns the number of bytes consumed, together with the outcome if
    /// there was one. Feed the remaining bytes on the next call.
    pub fn decode(&mut self, bytes: &[u8]) -> (usize, Option<Result<Frame<'_>, Error>>) {
        for (i, &byte) in bytes.iter().enumerate() {
            let step = match self.transparency {
                Transparency::Basic => self.step_basic(byte),
                Transparency::Advanced => self.step_advanced(byte),
            };

            match step {
                Step::Continue => {}
                Step::Frame => return (i + 1, Some(Ok(self.frame()))),
                Step::Error(e) => {
                    self.reset();
                    // A flag that ended a bad frame still opens the next one.
                    if byte == self.transparency.flag() {
                        self.state = State::Address;
                    }
                    return (i + 1, Some(Err(e)));
                }
            }
        }

        (bytes.len(), None)
    }

    fn frame(&self) -> Frame<'_> {
        Frame::new(
            self.address,
            self.frame_type,
            self.poll_final,
            &self.information,
        )
    }

    fn start_address(&mut self, byte: u8) -> Result<(), Error> {
        self.address = Address::from_byte(byte)?;
        self.information.clear();
        self.crc = Crc::new();
        self.crc.update(&[byte]);
        Ok(())
    }

    fn start_control(&mut self, byte: u8) -> Result<(), Error> {
        let (frame_type, poll_final) = FrameType::from_control(byte)?;
        self.frame_type = frame_type;
        self.poll_final = poll_final;
        self.crc.update(&[byte]);
        Ok(())
    }

    fn step_basic(&mut self, byte: u8) -> Step {
        match self.state {
            State::Hunt => {
                if byte == BASIC_FLAG {
                    self.state = State::Address;
                }
            }
            State::Address => {
                // Repeated flags between frames are idle fill.
                if byte != BASIC_FLAG {
                    if let Err(e) = self.start_address(byte) {
                        return Step::Error(e);
                    }
                    self.state = State::Control;
                }
            }
            State::Control => {
                if let Err(e) = self.start_control(byte) {
                    return Step::Error(e);
                }
                self.state = State::Length;
            }
            State::Length => {
                self.crc.update(&[byte]);
                self.len = (byte >> 1) as usize;
                if byte & EA != 0 {
                    return self.start_information();
                }
                self.state = State::LengthHigh;
            }
            State::LengthHigh => {
                self.crc.update(&[byte]);
                self.len |= (byte as usize) << 7;
                return self.start_information();
            }
            State::Information => {
                // Cannot overflow, the length was checked against N.
                let _ = self.information.push(byte);
                if self.frame_type.fcs_covers_information() {
                    self.crc.update(&[byte]);
                }
                if self.information.len() == self.len {
                    self.state = State::Fcs;
                }
            }
            State::Fcs => {
                if !self.crc.check(byte) {
                    return Step::Error(Error::BadFcs);
                }
                self.state = State::Close;
            }
            State::Close => {
                if byte != BASIC_FLAG {
                    return Step::Error(Error::MissingFlag);
                }
                // The closing flag may double as the next opening flag.
                self.state = State::Address;
                return Step::Frame;
            }
            State::Body => unreachable!(),
        }

        Step::Continue
    }

    fn start_information(&mut self) -> Step {
        if self.len > N {
            return Step::Error(Error::FrameTooLarge);
        }
        self.state = if self.len == 0 {
            State::Fcs
        } else {
            State::Information
        };
        Step::Continue
    }

    fn step_advanced(&mut self, byte: u8) -> Step {
        if self.state == State::Hunt {
            if byte == ADVANCED_FLAG {
                self.state = State::Address;
            }
            return Step::Continue;
        }

        match byte {
            ADVANCED_FLAG => return self.finish_advanced(),
            CONTROL_ESCAPE => {
                self.escaped = true;
                return Step::Continue;
            }
            // Flow control characters are never part of a frame, they are
            // always sent escaped.
            XON | XOFF => return Step::Continue,
            _ => {}
        }

        let byte = if core::mem::take(&mut self.escaped) {
            byte ^ ESCAPE_MASK
        } else {
            byte
        };

        match self.state {
            State::Address => {
                if let Err(e) = self.start_address(byte) {
                    return Step::Error(e);
                }
                self.state = State::Control;
            }
            State::Control => {
                if let Err(e) = self.start_control(byte) {
                    return Step::Error(e);
                }
                self.pending = None;
                self.state = State::Body;
            }
            State::Body => {
                if let Some(previous) = self.pending.replace(byte) {
                    if self.information.push(previous).is_err() {
                        return Step::Error(Error::FrameTooLarge);
                    }
                }
            }
            _ => unreachable!(),
        }

        Step::Continue
    }

    fn finish_advanced(&mut self) -> Step {
        let state = self.state;
        let fcs = self.pending.take();
        self.escaped = false;
        self.state = State::Address;

        match (state, fcs) {
            // Back-to-back flags, or a flag shared between two frames.
            (State::Address, _) => Step::Continue,
            (State::Body, Some(fcs)) => {
                if self.frame_type.fcs_covers_information() {
                    self.crc.update(&self.information);
                }
                if self.crc.check(fcs) {
                    Step::Frame
                } else {
                    self.information.clear();
                    Step::Error(Error::BadFcs)
                }
            }
            _ => {
                self.information.clear();
                Step::Error(Error::Truncated)
            }
        }
    }
}
