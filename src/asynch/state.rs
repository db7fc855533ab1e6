use core::cell::RefCell;
use core::task::{Context, Poll};

use embassy_sync::blocking_mutex::raw::NoopRawMutex;
use embassy_sync::blocking_mutex::Mutex;
use embassy_sync::waitqueue::WakerRegistration;

use crate::control::{ModemStatus, V24Signals};
use crate::error::ChannelError;

pub(crate) type Shared<T> = Mutex<NoopRawMutex, RefCell<T>>;

pub(crate) fn with<T, R>(shared: &Shared<T>, f: impl FnOnce(&mut T) -> R) -> R {
    shared.lock(|s| f(&mut s.borrow_mut()))
}

/// Whether a channel's DLC is usable, as seen by the channel handles.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum LinkState {
    /// Not yet established by the runner.
    Pending,
    Open,
    /// Released, refused, or the multiplexer stopped.
    Closed,
}

pub(crate) struct ChannelState {
    pub(crate) link: LinkState,

    pub(crate) local_lines: V24Signals,
    pub(crate) local_break: Option<u8>,
    /// Local lines changed and must be sent with MSC.
    pub(crate) lines_dirty: bool,
    pub(crate) remote_lines: V24Signals,
    /// The rx pipe is full and we sent FC to stop the remote.
    pub(crate) rx_stopped: bool,

    /// `(mask, value)` of remote signals that mean the peer hung up.
    pub(crate) hangup: Option<(V24Signals, V24Signals)>,
    pub(crate) hung_up: bool,

    pub(crate) rx_waker: WakerRegistration,
    pub(crate) tx_waker: WakerRegistration,
    pub(crate) state_waker: WakerRegistration,
}

impl ChannelState {
    pub(crate) const fn new() -> Self {
        Self {
            link: LinkState::Pending,
            local_lines: V24Signals::empty(),
            local_break: None,
            lines_dirty: false,
            remote_lines: V24Signals::empty(),
            rx_stopped: false,
            hangup: None,
            hung_up: false,
            rx_waker: WakerRegistration::new(),
            tx_waker: WakerRegistration::new(),
            state_waker: WakerRegistration::new(),
        }
    }

    pub(crate) fn reset(&mut self) {
        self.link = LinkState::Pending;
        self.local_lines = V24Signals::empty();
        self.local_break = None;
        self.lines_dirty = false;
        self.remote_lines = V24Signals::empty();
        self.rx_stopped = false;
        self.hung_up = false;
    }

    pub(crate) fn set_link(&mut self, link: LinkState) {
        self.link = link;
        self.wake_all();
    }

    pub(crate) fn wake_all(&mut self) {
        self.rx_waker.wake();
        self.tx_waker.wake();
        self.state_waker.wake();
    }

    /// Queue an MSC for the local signals.
    pub(crate) fn set_local_lines(&mut self, signals: V24Signals, break_signal: Option<u8>) {
        self.local_lines = signals;
        self.local_break = break_signal;
        self.lines_dirty = true;
    }

    pub(crate) fn take_local_lines(&mut self, dlci: u8) -> Option<ModemStatus> {
        if !core::mem::take(&mut self.lines_dirty) {
            return None;
        }
        let signals = if self.rx_stopped {
            self.local_lines.union(V24Signals::FC)
        } else {
            self.local_lines
        };
        Some(ModemStatus {
            dlci,
            signals,
            break_signal: self.local_break.take(),
        })
    }

    /// Set or clear the FC bit we report, queueing an MSC when it changes.
    ///
    /// Returns whether it changed.
    pub(crate) fn set_rx_stopped(&mut self, stopped: bool) -> bool {
        if self.rx_stopped == stopped {
            return false;
        }
        self.rx_stopped = stopped;
        self.lines_dirty = true;
        true
    }

    /// Store the signals the remote reported with MSC.
    ///
    /// Returns whether the remote flow control state changed.
    pub(crate) fn update_remote_lines(&mut self, signals: V24Signals) -> bool {
        let flow_changed = self.remote_lines.flow_stopped() != signals.flow_stopped();
        self.remote_lines = signals;

        if let Some((mask, value)) = self.hangup {
            if signals.bits() & mask.bits() == value.bits() {
                debug!("hangup pattern matched, remote lines {:?}", signals.bits());
                self.hung_up = true;
            }
        }

        self.wake_all();
        flow_changed
    }

    /// Ready once reading can no longer return data.
    pub(crate) fn poll_read_error(&mut self, cx: &mut Context, drained: bool) -> Poll<ChannelError> {
        if self.hung_up {
            return Poll::Ready(ChannelError::Hangup);
        }
        if self.link == LinkState::Closed && drained {
            return Poll::Ready(ChannelError::Closed);
        }
        self.rx_waker.register(cx.waker());
        Poll::Pending
    }

    pub(crate) fn poll_write_error(&mut self, cx: &mut Context) -> Poll<ChannelError> {
        if self.link == LinkState::Closed {
            return Poll::Ready(ChannelError::Closed);
        }
        self.tx_waker.register(cx.waker());
        Poll::Pending
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum MuxPhase {
    Idle,
    Running,
    Stopped,
}

pub(crate) struct MuxState {
    pub(crate) phase: MuxPhase,
    pub(crate) close_requested: bool,
    /// The remote sent FCoff.
    pub(crate) flow_off: bool,
    /// Outgoing work is available: channel data, lines or a close request.
    pub(crate) tx_waker: WakerRegistration,
    pub(crate) phase_waker: WakerRegistration,
}

impl MuxState {
    pub(crate) const fn new() -> Self {
        Self {
            phase: MuxPhase::Idle,
            close_requested: false,
            flow_off: false,
            tx_waker: WakerRegistration::new(),
            phase_waker: WakerRegistration::new(),
        }
    }

    pub(crate) fn set_phase(&mut self, phase: MuxPhase) {
        self.phase = phase;
        self.phase_waker.wake();
    }
}
