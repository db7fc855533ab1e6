use core::future::poll_fn;
use core::task::Poll;

use embassy_futures::select::{select, Either};
use embassy_sync::blocking_mutex::raw::NoopRawMutex;
use embassy_sync::pipe::Pipe;
use embedded_io_async::{ErrorType, Read, Write};

use super::state::{self, ChannelState, LinkState, MuxState, Shared};
use crate::control::V24Signals;
use crate::error::ChannelError;

/// One logical channel of the multiplexer.
///
/// Bytes written are sent in UIH frames on the channel's DLCI; bytes
/// received on that DLCI are returned by reads.
pub struct Channel<'a, const BUF: usize> {
    rx: ChannelRx<'a, BUF>,
    tx: ChannelTx<'a, BUF>,
    lines: ChannelLines<'a>,
}

impl<'a, const BUF: usize> Channel<'a, BUF> {
    pub(crate) fn new(
        dlci: u8,
        state: &'a Shared<ChannelState>,
        mux: &'a Shared<MuxState>,
        rx: &'a Pipe<NoopRawMutex, BUF>,
        tx: &'a Pipe<NoopRawMutex, BUF>,
    ) -> Self {
        Self {
            rx: ChannelRx {
                state,
                mux,
                pipe: rx,
            },
            tx: ChannelTx {
                state,
                mux,
                pipe: tx,
            },
            lines: ChannelLines { dlci, state, mux },
        }
    }

    pub fn split(self) -> (ChannelRx<'a, BUF>, ChannelTx<'a, BUF>, ChannelLines<'a>) {
        (self.rx, self.tx, self.lines)
    }

    pub fn dlci(&self) -> u8 {
        self.lines.dlci
    }

    pub fn link_state(&self) -> LinkState {
        self.lines.link_state()
    }

    pub async fn wait_open(&self) -> Result<(), ChannelError> {
        self.lines.wait_open().await
    }

    pub fn set_lines(&self, signals: V24Signals, break_signal: Option<u8>) {
        self.lines.set_lines(signals, break_signal)
    }

    pub fn lines(&self) -> V24Signals {
        self.lines.lines()
    }

    pub fn set_hangup_detection(&self, mask: V24Signals, value: V24Signals) {
        self.lines.set_hangup_detection(mask, value)
    }

    pub fn clear_hangup_detection(&self) {
        self.lines.clear_hangup_detection()
    }
}

impl<'a, const BUF: usize> ErrorType for Channel<'a, BUF> {
    type Error = ChannelError;
}

impl<'a, const BUF: usize> Read for Channel<'a, BUF> {
    async fn read(&mut self, buf: &mut [u8]) -> Result<usize, Self::Error> {
        self.rx.read(buf).await
    }
}

impl<'a, const BUF: usize> Write for Channel<'a, BUF> {
    async fn write(&mut self, buf: &[u8]) -> Result<usize, Self::Error> {
        self.tx.write(buf).await
    }

    async fn flush(&mut self) -> Result<(), Self::Error> {
        self.tx.flush().await
    }
}

/// Receiving half of a [`Channel`].
pub struct ChannelRx<'a, const BUF: usize> {
    state: &'a Shared<ChannelState>,
    mux: &'a Shared<MuxState>,
    pipe: &'a Pipe<NoopRawMutex, BUF>,
}

impl<'a, const BUF: usize> ErrorType for ChannelRx<'a, BUF> {
    type Error = ChannelError;
}

impl<'a, const BUF: usize> Read for ChannelRx<'a, BUF> {
    async fn read(&mut self, buf: &mut [u8]) -> Result<usize, Self::Error> {
        if buf.is_empty() {
            return Ok(0);
        }

        // Buffered data is handed out before a hangup or close is reported.
        let error = poll_fn(|cx| {
            let drained = self.pipe.is_empty();
            state::with(self.state, |s| s.poll_read_error(cx, drained))
        });

        match select(self.pipe.read(buf), error).await {
            Either::First(n) => {
                // The runner may have data parked for us.
                if state::with(self.state, |s| s.rx_stopped) {
                    state::with(self.mux, |m| m.tx_waker.wake());
                }
                Ok(n)
            }
            Either::Second(e) => Err(e),
        }
    }
}

/// Transmitting half of a [`Channel`].
pub struct ChannelTx<'a, const BUF: usize> {
    state: &'a Shared<ChannelState>,
    mux: &'a Shared<MuxState>,
    pipe: &'a Pipe<NoopRawMutex, BUF>,
}

impl<'a, const BUF: usize> ErrorType for ChannelTx<'a, BUF> {
    type Error = ChannelError;
}

impl<'a, const BUF: usize> Write for ChannelTx<'a, BUF> {
    async fn write(&mut self, buf: &[u8]) -> Result<usize, Self::Error> {
        if buf.is_empty() {
            return Ok(0);
        }
        if state::with(self.state, |s| s.link == LinkState::Closed) {
            return Err(ChannelError::Closed);
        }

        let closed = poll_fn(|cx| state::with(self.state, |s| s.poll_write_error(cx)));

        match select(self.pipe.write(buf), closed).await {
            Either::First(n) => {
                state::with(self.mux, |m| m.tx_waker.wake());
                Ok(n)
            }
            Either::Second(e) => Err(e),
        }
    }

    /// Wait until the runner has taken every queued byte.
    async fn flush(&mut self) -> Result<(), Self::Error> {
        poll_fn(|cx| {
            let empty = self.pipe.is_empty();
            state::with(self.state, |s| {
                if empty {
                    Poll::Ready(Ok(()))
                } else if s.link == LinkState::Closed {
                    Poll::Ready(Err(ChannelError::Closed))
                } else {
                    s.tx_waker.register(cx.waker());
                    Poll::Pending
                }
            })
        })
        .await
    }
}

/// V.24 signal and link state access for a [`Channel`].
pub struct ChannelLines<'a> {
    dlci: u8,
    state: &'a Shared<ChannelState>,
    mux: &'a Shared<MuxState>,
}

impl<'a> ChannelLines<'a> {
    pub fn dlci(&self) -> u8 {
        self.dlci
    }

    pub fn link_state(&self) -> LinkState {
        state::with(self.state, |s| s.link)
    }

    /// Wait for the runner to establish this channel's DLC.
    pub async fn wait_open(&self) -> Result<(), ChannelError> {
        poll_fn(|cx| {
            state::with(self.state, |s| match s.link {
                LinkState::Open => Poll::Ready(Ok(())),
                LinkState::Closed => Poll::Ready(Err(ChannelError::Closed)),
                LinkState::Pending => {
                    s.state_waker.register(cx.waker());
                    Poll::Pending
                }
            })
        })
        .await
    }

    /// Send our V.24 signals, and optionally a break, to the remote with
    /// MSC.
    pub fn set_lines(&self, signals: V24Signals, break_signal: Option<u8>) {
        state::with(self.state, |s| s.set_local_lines(signals, break_signal));
        state::with(self.mux, |m| m.tx_waker.wake());
    }

    /// The V.24 signals last reported by the remote.
    pub fn lines(&self) -> V24Signals {
        state::with(self.state, |s| s.remote_lines)
    }

    /// Fail reads with [`ChannelError::Hangup`] once the remote reports
    /// signals where `signals & mask == value`.
    ///
    /// Only MSC received after this call is checked.
    pub fn set_hangup_detection(&self, mask: V24Signals, value: V24Signals) {
        state::with(self.state, |s| {
            s.hangup = Some((mask, value));
            s.hung_up = false;
        });
    }

    pub fn clear_hangup_detection(&self) {
        state::with(self.state, |s| {
            s.hangup = None;
            s.hung_up = false;
        });
    }
}
