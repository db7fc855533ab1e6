//! Data link connection establishment and release, TS 27.010 section 5.4.
//!
//! This is a pure state machine: it is handed the current time and the
//! frames received for its DLCI, and hands back the frames to transmit.
use embassy_time::{Duration, Instant};

use crate::error::Error;
use crate::frame::{Frame, FrameType, Role};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum DlcState {
    Closed,
    /// SABM sent, waiting for UA.
    Opening,
    Open,
    /// DISC sent, waiting for UA.
    Closing,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Transition {
    Unchanged,
    Opened,
    Closed,
}

#[derive(Debug, Clone)]
pub struct Dlc {
    dlci: u8,
    role: Role,
    state: DlcState,
    retries: u8,
    deadline: Option<Instant>,
}

impl Dlc {
    pub const fn new(dlci: u8, role: Role) -> Self {
        Self {
            dlci,
            role,
            state: DlcState::Closed,
            retries: 0,
            deadline: None,
        }
    }

    pub fn dlci(&self) -> u8 {
        self.dlci
    }

    pub fn state(&self) -> DlcState {
        self.state
    }

    pub fn is_open(&self) -> bool {
        self.state == DlcState::Open
    }

    /// When T1 runs out for the outstanding SABM or DISC.
    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// Start establishing the link. Returns the SABM to transmit.
    pub fn open(&mut self, now: Instant, t1: Duration) -> Frame<'static> {
        self.state = DlcState::Opening;
        self.arm(now, t1);
        Frame::sabm(self.dlci, self.role)
    }

    /// Start releasing the link. Returns the DISC to transmit, or `None` if
    /// the link is already closed.
    pub fn close(&mut self, now: Instant, t1: Duration) -> Option<Frame<'static>> {
        if self.state == DlcState::Closed {
            return None;
        }
        self.state = DlcState::Closing;
        self.arm(now, t1);
        Some(Frame::disc(self.dlci, self.role))
    }

    /// Mark the link closed without any exchange, e.g. after CLD.
    pub fn reset(&mut self) {
        self.state = DlcState::Closed;
        self.deadline = None;
        self.retries = 0;
    }

    fn arm(&mut self, now: Instant, t1: Duration) {
        self.retries = 0;
        self.deadline = Some(now + t1);
    }

    /// Feed a UA or DM received for this DLCI.
    pub fn handle_response(&mut self, frame_type: FrameType) -> Result<Transition, Error> {
        let transition = match (self.state, frame_type) {
            (DlcState::Opening, FrameType::Ua) => {
                self.state = DlcState::Open;
                Transition::Opened
            }
            (DlcState::Opening, FrameType::Dm) => {
                self.reset();
                return Err(Error::Refused);
            }
            (DlcState::Closing, FrameType::Ua | FrameType::Dm)
            | (DlcState::Open, FrameType::Dm) => {
                self.state = DlcState::Closed;
                Transition::Closed
            }
            _ => return Ok(Transition::Unchanged),
        };
        self.deadline = None;
        Ok(transition)
    }

    /// Feed a SABM or DISC received for this DLCI.
    ///
    /// Returns the state change and the response to transmit.
    pub fn handle_command(
        &mut self,
        frame_type: FrameType,
        poll: bool,
    ) -> (Transition, Option<Frame<'static>>) {
        match frame_type {
            FrameType::Sabm => {
                let transition = if self.state == DlcState::Open {
                    Transition::Unchanged
                } else {
                    Transition::Opened
                };
                self.state = DlcState::Open;
                self.deadline = None;
                (transition, Some(Frame::ua(self.dlci, self.role, poll)))
            }
            FrameType::Disc if self.state == DlcState::Closed => {
                (Transition::Unchanged, Some(Frame::dm(self.dlci, self.role, poll)))
            }
            FrameType::Disc => {
                self.reset();
                (Transition::Closed, Some(Frame::ua(self.dlci, self.role, poll)))
            }
            _ => (Transition::Unchanged, None),
        }
    }

    /// Check T1. Returns the frame to retransmit once it has expired, or
    /// `Timeout` after N2 retransmissions went unanswered.
    pub fn poll_timeout(
        &mut self,
        now: Instant,
        t1: Duration,
        n2: u8,
    ) -> Result<Option<Frame<'static>>, Error> {
        match self.deadline {
            Some(deadline) if now >= deadline => {}
            _ => return Ok(None),
        }

        if self.retries >= n2 {
            warn!("DLCI {} got no answer after {} attempts", self.dlci, n2);
            self.reset();
            return Err(Error::Timeout);
        }

        self.retries += 1;
        self.deadline = Some(now + t1);
        Ok(Some(match self.state {
            DlcState::Opening => Frame::sabm(self.dlci, self.role),
            _ => Frame::disc(self.dlci, self.role),
        }))
    }
}
