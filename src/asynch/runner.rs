use core::future::poll_fn;
use core::task::{Context, Poll};

use embassy_futures::select::{select3, Either3};
use embassy_sync::blocking_mutex::raw::NoopRawMutex;
use embassy_sync::pipe::Pipe;
use embassy_time::{Instant, Timer};
use embedded_io_async::{Error as _, Read, Write};
use heapless::Vec;

use super::state::{self, ChannelState, LinkState, MuxPhase, MuxState, Shared};
use crate::config::MuxConfig;
use crate::control::{ControlFrame, ControlMessage, ModemStatus};
use crate::dlc::{Dlc, DlcState, Transition};
use crate::error::Error;
use crate::frame::{Decoder, Frame, FrameType, Role, Transparency, CONTROL_DLCI};
use crate::fmt::Hex;

/// Work picked up from the channels, ready to be transmitted.
enum Outgoing {
    CloseDown,
    Lines(ModemStatus),
    /// `len` octets of channel `index` were copied to the scratch buffer.
    Data { index: usize, len: usize },
}

/// Drives the serial port on behalf of all channels of a [`Mux`](super::Mux).
///
/// Frames of at most `BUF` octets, flags and escaping included, are sent and
/// received.
pub struct Runner<'a, const N: usize, const BUF: usize> {
    mux: &'a Shared<MuxState>,
    channels: &'a [Shared<ChannelState>; N],
    rx_pipes: &'a [Pipe<NoopRawMutex, BUF>; N],
    tx_pipes: &'a [Pipe<NoopRawMutex, BUF>; N],

    config: MuxConfig,
    control: Dlc,
    dlcs: [Dlc; N],
    /// Index of the next channel to establish.
    next_open: usize,
    /// Index of the next channel to take data from.
    next_tx: usize,
    /// CLD sent, waiting for the response until this instant.
    closing: Option<Instant>,
    /// Received data that did not fit the channel's rx pipe. The remote has
    /// been sent FC for every channel with parked data.
    parked: [Vec<u8, BUF>; N],

    scratch: [u8; BUF],
    frame_buf: [u8; BUF],
}

impl<'a, const N: usize, const BUF: usize> Runner<'a, N, BUF> {
    pub(crate) fn new(
        mux: &'a Shared<MuxState>,
        channels: &'a [Shared<ChannelState>; N],
        rx_pipes: &'a [Pipe<NoopRawMutex, BUF>; N],
        tx_pipes: &'a [Pipe<NoopRawMutex, BUF>; N],
        config: MuxConfig,
    ) -> Self {
        let role = config.role;
        Self {
            mux,
            channels,
            rx_pipes,
            tx_pipes,
            config,
            control: Dlc::new(CONTROL_DLCI, role),
            dlcs: core::array::from_fn(|i| Dlc::new(i as u8 + 1, role)),
            next_open: 0,
            next_tx: 0,
            closing: None,
            parked: core::array::from_fn(|_| Vec::new()),
            scratch: [0; BUF],
            frame_buf: [0; BUF],
        }
    }

    /// A handle that stays usable while [`Runner::run`] is in progress.
    pub fn handle(&self) -> MuxHandle<'a> {
        MuxHandle { mux: self.mux }
    }

    /// Run the multiplexer on an already switched serial port.
    ///
    /// Returns `Ok(())` once the multiplexer was closed down by either side.
    /// Every channel is closed when this returns.
    ///
    /// `rx` must be cancel safe: a read may be dropped when there is
    /// something to transmit.
    pub async fn run<R: Read, W: Write>(mut self, rx: &mut R, tx: &mut W) -> Result<(), Error> {
        state::with(self.mux, |m| m.set_phase(MuxPhase::Running));

        let result = self.run_inner(rx, tx).await;
        if let Err(ref e) = result {
            error!("multiplexer stopped: {:?}", e);
        }

        self.shutdown();
        result
    }

    async fn run_inner<R: Read, W: Write>(&mut self, rx: &mut R, tx: &mut W) -> Result<(), Error> {
        let mut decoder = Decoder::<BUF>::new(self.config.transparency);
        let mut chunk = [0u8; 128];

        if self.config.role == Role::Initiator {
            debug!("opening control channel");
            let frame = self.control.open(Instant::now(), self.config.t1);
            self.send(tx, &frame).await?;
        }

        loop {
            let deadline = self.next_deadline();
            let timeout = async move {
                match deadline {
                    Some(at) => Timer::at(at).await,
                    None => core::future::pending().await,
                }
            };

            let stop = match select3(
                rx.read(&mut chunk),
                poll_fn(|cx| self.poll_outgoing(cx)),
                timeout,
            )
            .await
            {
                Either3::First(read) => {
                    let n = read.map_err(|e| Error::Io(e.kind()))?;
                    if n == 0 {
                        warn!("serial port closed");
                        return Err(Error::Closed);
                    }
                    trace!("RX {:?}", Hex(&chunk[..n]));

                    let mut stop = false;
                    let mut pos = 0;
                    while pos < n && !stop {
                        let (used, result) = decoder.decode(&chunk[pos..n]);
                        pos += used;
                        match result {
                            Some(Ok(frame)) => stop = self.handle_frame(tx, frame).await?,
                            Some(Err(e)) => warn!("dropping frame: {:?}", e),
                            None => {}
                        }
                    }
                    stop
                }
                Either3::Second(work) => self.send_outgoing(tx, work).await?,
                Either3::Third(()) => self.handle_timeouts(tx).await?,
            };

            if stop {
                info!("multiplexer closed");
                return Ok(());
            }
        }
    }

    fn shutdown(&mut self) {
        self.control.reset();
        for (dlc, channel) in self.dlcs.iter_mut().zip(self.channels.iter()) {
            dlc.reset();
            state::with(channel, |s| s.set_link(LinkState::Closed));
        }
        state::with(self.mux, |m| m.set_phase(MuxPhase::Stopped));
    }

    fn next_deadline(&self) -> Option<Instant> {
        core::iter::once(self.control.deadline())
            .chain(self.dlcs.iter().map(Dlc::deadline))
            .chain(core::iter::once(self.closing))
            .flatten()
            .min()
    }

    fn channel_index(&self, dlci: u8) -> Option<usize> {
        let index = (dlci as usize).checked_sub(1)?;
        (index < N).then_some(index)
    }

    fn poll_outgoing(&mut self, cx: &mut Context) -> Poll<Outgoing> {
        let (close_requested, flow_off) = state::with(self.mux, |m| {
            m.tx_waker.register(cx.waker());
            (m.close_requested, m.flow_off)
        });

        self.unpark();

        if self.closing.is_some() {
            return Poll::Pending;
        }
        if close_requested {
            return Poll::Ready(Outgoing::CloseDown);
        }

        for (dlc, channel) in self.dlcs.iter().zip(self.channels.iter()) {
            if !dlc.is_open() {
                continue;
            }
            if let Some(msc) = state::with(channel, |s| s.take_local_lines(dlc.dlci())) {
                return Poll::Ready(Outgoing::Lines(msc));
            }
        }

        if flow_off {
            return Poll::Pending;
        }

        let max_len = self.config.max_information_len(BUF);
        for k in 0..N {
            let index = (self.next_tx + k) % N;
            if !self.dlcs[index].is_open() {
                continue;
            }

            let channel = &self.channels[index];
            if state::with(channel, |s| s.remote_lines.flow_stopped()) {
                continue;
            }

            match self.tx_pipes[index].try_read(&mut self.scratch[..max_len]) {
                Ok(len) if len > 0 => {
                    self.next_tx = (index + 1) % N;
                    state::with(channel, |s| s.tx_waker.wake());
                    return Poll::Ready(Outgoing::Data { index, len });
                }
                _ => {}
            }
        }

        Poll::Pending
    }

    /// Returns whether the multiplexer is done.
    async fn send_outgoing<W: Write>(&mut self, tx: &mut W, work: Outgoing) -> Result<bool, Error> {
        match work {
            Outgoing::CloseDown => {
                if !self.control.is_open() {
                    return Ok(true);
                }
                info!("closing down multiplexer");
                self.closing = Some(Instant::now() + self.config.t2);
                self.send_control(tx, ControlFrame::command(ControlMessage::CloseDown))
                    .await?;
            }
            Outgoing::Lines(msc) => {
                debug!("MSC DLCI {} lines {:?}", msc.dlci, msc.signals.bits());
                self.send_control(tx, ControlFrame::command(ControlMessage::ModemStatus(msc)))
                    .await?;
            }
            Outgoing::Data { index, len } => {
                let frame = Frame::uih(
                    self.dlcs[index].dlci(),
                    self.config.role,
                    &self.scratch[..len],
                );
                write_frame(tx, self.config.transparency, &mut self.frame_buf, &frame).await?;
            }
        }
        Ok(false)
    }

    async fn send<W: Write>(&mut self, tx: &mut W, frame: &Frame<'_>) -> Result<(), Error> {
        write_frame(tx, self.config.transparency, &mut self.frame_buf, frame).await
    }

    async fn send_control<W: Write>(
        &mut self,
        tx: &mut W,
        message: ControlFrame<'_>,
    ) -> Result<(), Error> {
        if message.encoded_len() > self.config.max_information_len(BUF) {
            warn!("control message too long for frame buffer, dropped");
            return Ok(());
        }

        let len = message.encode(&mut self.scratch)?;
        let frame = Frame::uih(CONTROL_DLCI, self.config.role, &self.scratch[..len]);
        write_frame(tx, self.config.transparency, &mut self.frame_buf, &frame).await
    }

    /// Establish the next channel, one DLC at a time.
    async fn open_next<W: Write>(&mut self, tx: &mut W) -> Result<(), Error> {
        if self.config.role != Role::Initiator || self.next_open >= N {
            return Ok(());
        }

        let index = self.next_open;
        self.next_open += 1;

        let frame = self.dlcs[index].open(Instant::now(), self.config.t1);
        debug!("opening DLCI {}", frame.dlci());
        self.send(tx, &frame).await
    }

    fn channel_opened(&mut self, index: usize) {
        info!("DLCI {} open", self.dlcs[index].dlci());
        let initial = self.config.initial_lines;
        state::with(&self.channels[index], |s| {
            if !s.lines_dirty {
                s.set_local_lines(initial, None);
            }
            s.set_link(LinkState::Open);
        });
    }

    fn channel_closed(&mut self, index: usize) {
        info!("DLCI {} closed", self.dlcs[index].dlci());
        if !self.parked[index].is_empty() {
            debug!("dropping {} parked octets", self.parked[index].len());
            self.parked[index].clear();
        }
        state::with(&self.channels[index], |s| s.set_link(LinkState::Closed));
    }

    /// Returns whether the multiplexer is done.
    async fn handle_frame<W: Write>(&mut self, tx: &mut W, frame: Frame<'_>) -> Result<bool, Error> {
        let dlci = frame.dlci();
        trace!(
            "frame {:?} DLCI {} ({} octets)",
            frame.frame_type,
            dlci,
            frame.information.len()
        );

        match frame.frame_type {
            FrameType::Ua | FrameType::Dm => self.handle_response(tx, dlci, frame.frame_type).await,
            FrameType::Sabm | FrameType::Disc => self.handle_command(tx, frame).await,
            FrameType::Uih | FrameType::Ui if dlci == CONTROL_DLCI => {
                self.handle_control(tx, frame.information).await
            }
            FrameType::Uih | FrameType::Ui => {
                self.deliver(dlci, frame.information);
                Ok(false)
            }
        }
    }

    async fn handle_response<W: Write>(
        &mut self,
        tx: &mut W,
        dlci: u8,
        frame_type: FrameType,
    ) -> Result<bool, Error> {
        if dlci == CONTROL_DLCI {
            return match self.control.handle_response(frame_type)? {
                Transition::Opened => {
                    info!("control channel open");
                    self.open_next(tx).await?;
                    Ok(false)
                }
                Transition::Closed => Ok(true),
                Transition::Unchanged => Ok(false),
            };
        }

        let Some(index) = self.channel_index(dlci) else {
            debug!("{:?} for unknown DLCI {}", frame_type, dlci);
            return Ok(false);
        };

        match self.dlcs[index].handle_response(frame_type) {
            Ok(Transition::Opened) => {
                self.channel_opened(index);
                self.open_next(tx).await?;
            }
            Ok(Transition::Closed) => self.channel_closed(index),
            Ok(Transition::Unchanged) => {}
            Err(e) => {
                warn!("DLCI {} refused: {:?}", dlci, e);
                self.channel_closed(index);
                self.open_next(tx).await?;
            }
        }
        Ok(false)
    }

    async fn handle_command<W: Write>(&mut self, tx: &mut W, frame: Frame<'_>) -> Result<bool, Error> {
        let dlci = frame.dlci();

        if dlci == CONTROL_DLCI {
            let (transition, reply) = self.control.handle_command(frame.frame_type, frame.poll_final);
            if let Some(reply) = reply {
                self.send(tx, &reply).await?;
            }
            return Ok(transition == Transition::Closed);
        }

        let Some(index) = self.channel_index(dlci) else {
            warn!("{:?} for unknown DLCI {}", frame.frame_type, dlci);
            let reply = Frame::dm(dlci, self.config.role, frame.poll_final);
            self.send(tx, &reply).await?;
            return Ok(false);
        };

        let (transition, reply) = self.dlcs[index].handle_command(frame.frame_type, frame.poll_final);
        if let Some(reply) = reply {
            self.send(tx, &reply).await?;
        }
        match transition {
            Transition::Opened => self.channel_opened(index),
            Transition::Closed => self.channel_closed(index),
            Transition::Unchanged => {}
        }
        Ok(false)
    }

    /// Hand received data to the channel.
    ///
    /// Whatever does not fit its rx pipe is parked, and the remote is told
    /// with MSC to stop sending on that DLC until the application catches up.
    fn deliver(&mut self, dlci: u8, data: &[u8]) {
        let Some(index) = self.channel_index(dlci).filter(|&i| self.dlcs[i].is_open()) else {
            warn!("dropping {} octets for closed DLCI {}", data.len(), dlci);
            return;
        };
        if data.is_empty() {
            return;
        }

        let parked = &mut self.parked[index];
        // Parked data goes first, so nothing may overtake it.
        let written = if parked.is_empty() {
            self.rx_pipes[index].try_write(data).unwrap_or(0)
        } else {
            0
        };
        let rest = &data[written..];
        if rest.is_empty() {
            return;
        }

        let keep = rest.len().min(BUF - parked.len());
        if keep < rest.len() {
            warn!(
                "DLCI {} sent past flow control, dropping {} octets",
                dlci,
                rest.len() - keep
            );
        }
        let _ = parked.extend_from_slice(&rest[..keep]);

        if state::with(&self.channels[index], |s| s.set_rx_stopped(true)) {
            debug!("DLCI {} rx full, stopping remote", dlci);
        }
    }

    /// Move parked data into rx pipes the application has made room in.
    fn unpark(&mut self) {
        for (index, parked) in self.parked.iter_mut().enumerate() {
            if parked.is_empty() {
                continue;
            }

            if let Ok(n) = self.rx_pipes[index].try_write(&parked[..]) {
                let len = parked.len();
                parked.copy_within(n.., 0);
                parked.truncate(len - n);
            }

            if parked.is_empty() && state::with(&self.channels[index], |s| s.set_rx_stopped(false))
            {
                debug!("DLCI {} rx drained, resuming remote", index + 1);
            }
        }
    }

    /// Returns whether the multiplexer is done.
    async fn handle_control<W: Write>(&mut self, tx: &mut W, mut information: &[u8]) -> Result<bool, Error> {
        while !information.is_empty() {
            let (message, used) = match ControlFrame::decode(information) {
                Ok(decoded) => decoded,
                Err(e) => {
                    warn!("bad control message: {:?}", e);
                    break;
                }
            };
            information = &information[used..];

            if self.handle_control_message(tx, message).await? {
                return Ok(true);
            }
        }
        Ok(false)
    }

    async fn handle_control_message<W: Write>(
        &mut self,
        tx: &mut W,
        message: ControlFrame<'_>,
    ) -> Result<bool, Error> {
        if !message.command {
            match message.message {
                ControlMessage::CloseDown if self.closing.is_some() => return Ok(true),
                ControlMessage::NonSupportedCommand(kind) => {
                    warn!("remote does not support control message {:#x}", kind)
                }
                _ => {}
            }
            return Ok(false);
        }

        match message.message {
            ControlMessage::ModemStatus(msc) => self.remote_lines(msc),
            ControlMessage::FlowControlOn => {
                debug!("remote flow control on");
                state::with(self.mux, |m| m.flow_off = false);
            }
            ControlMessage::FlowControlOff => {
                debug!("remote flow control off");
                state::with(self.mux, |m| m.flow_off = true);
            }
            ControlMessage::ParameterNegotiation(pn) => {
                debug!("PN for DLCI {}, N1 {}", pn.dlci, pn.n1);
            }
            ControlMessage::CloseDown => info!("remote closed down multiplexer"),
            ControlMessage::Unsupported { kind, .. } => {
                warn!("unsupported control message {:#x}", kind)
            }
            ControlMessage::PowerSaving
            | ControlMessage::Test(_)
            | ControlMessage::NonSupportedCommand(_) => {}
        }

        if let Some(reply) = message.reply() {
            self.send_control(tx, reply).await?;
        }

        Ok(message.message == ControlMessage::CloseDown)
    }

    fn remote_lines(&mut self, msc: ModemStatus) {
        let Some(index) = self.channel_index(msc.dlci) else {
            debug!("MSC for unknown DLCI {}", msc.dlci);
            return;
        };

        debug!("DLCI {} remote lines {:?}", msc.dlci, msc.signals.bits());
        let flow_changed = state::with(&self.channels[index], |s| s.update_remote_lines(msc.signals));
        if flow_changed {
            debug!(
                "DLCI {} flow {}",
                msc.dlci,
                if msc.signals.flow_stopped() { "stopped" } else { "resumed" }
            );
        }
    }

    /// Returns whether the multiplexer is done.
    async fn handle_timeouts<W: Write>(&mut self, tx: &mut W) -> Result<bool, Error> {
        let now = Instant::now();

        if let Some(deadline) = self.closing {
            if now >= deadline {
                warn!("no response to CLD");
                return Ok(true);
            }
        }

        if let Some(frame) = self.control.poll_timeout(now, self.config.t1, self.config.n2)? {
            self.send(tx, &frame).await?;
        }

        for index in 0..N {
            let opening = self.dlcs[index].state() == DlcState::Opening;
            match self.dlcs[index].poll_timeout(now, self.config.t1, self.config.n2) {
                Ok(Some(frame)) => self.send(tx, &frame).await?,
                Ok(None) => {}
                Err(_) => {
                    self.channel_closed(index);
                    if opening {
                        self.open_next(tx).await?;
                    }
                }
            }
        }

        Ok(false)
    }
}

async fn write_frame<W: Write>(
    tx: &mut W,
    transparency: Transparency,
    buf: &mut [u8],
    frame: &Frame<'_>,
) -> Result<(), Error> {
    let len = frame.encode(transparency, buf)?;
    trace!("TX {:?}", Hex(&buf[..len]));
    tx.write_all(&buf[..len])
        .await
        .map_err(|e| Error::Io(e.kind()))
}

/// Controls a running multiplexer from other tasks.
#[derive(Clone, Copy)]
pub struct MuxHandle<'a> {
    mux: &'a Shared<MuxState>,
}

impl<'a> MuxHandle<'a> {
    /// Ask the runner to close down the multiplexer with CLD.
    ///
    /// [`Runner::run`] returns once the remote has answered or T2 expired.
    pub fn close(&self) {
        state::with(self.mux, |m| {
            m.close_requested = true;
            m.tx_waker.wake();
        });
    }

    pub fn phase(&self) -> MuxPhase {
        state::with(self.mux, |m| m.phase)
    }

    pub fn is_running(&self) -> bool {
        self.phase() == MuxPhase::Running
    }

    /// Wait for the runner to stop.
    pub async fn wait_stopped(&self) {
        poll_fn(|cx| {
            state::with(self.mux, |m| {
                if m.phase == MuxPhase::Stopped {
                    Poll::Ready(())
                } else {
                    m.phase_waker.register(cx.waker());
                    Poll::Pending
                }
            })
        })
        .await
    }
}
