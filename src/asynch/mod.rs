//! Async multiplexer on top of embassy.
//!
//! [`Mux::start`] hands out a [`Runner`], which owns the serial port, and one
//! [`Channel`] per DLC. Channels implement `embedded_io_async::{Read, Write}`
//! and can be given to anything that talks to a serial port, e.g. an
//! `atat` client or a PPP stack.
mod channel;
mod runner;
mod state;

use core::cell::RefCell;

use atat::asynch::AtatClient;
use embassy_sync::blocking_mutex::raw::NoopRawMutex;
use embassy_sync::blocking_mutex::Mutex;
use embassy_sync::pipe::Pipe;
use embassy_time::{Duration, Timer};
use embedded_io_async::{ErrorKind, Read, Write};

pub use channel::{Channel, ChannelLines, ChannelRx, ChannelTx};
pub use runner::{MuxHandle, Runner};
pub use state::{LinkState, MuxPhase};

use crate::command::AT;
use crate::config::MuxConfig;
use crate::error::Error;
use crate::frame::MAX_DLCI;
use state::{ChannelState, MuxState, Shared};

/// Attempts at getting an answer to `AT` before giving up.
const AT_ATTEMPTS: usize = 3;

/// Storage for a multiplexer with `N` channels, each with `BUF` octets of
/// buffering per direction.
///
/// Channel `i` carries DLCI `i + 1`.
pub struct Mux<const N: usize, const BUF: usize> {
    state: Shared<MuxState>,
    channels: [Shared<ChannelState>; N],
    rx: [Pipe<NoopRawMutex, BUF>; N],
    tx: [Pipe<NoopRawMutex, BUF>; N],
}

impl<const N: usize, const BUF: usize> Mux<N, BUF> {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(RefCell::new(MuxState::new())),
            channels: core::array::from_fn(|_| Mutex::new(RefCell::new(ChannelState::new()))),
            rx: core::array::from_fn(|_| Pipe::new()),
            tx: core::array::from_fn(|_| Pipe::new()),
        }
    }

    /// Prepare a fresh multiplexer session.
    ///
    /// Nothing happens on the wire until the returned runner is run. Fails
    /// with [`Error::InvalidConfig`] unless `1 <= N <= 63` and a `BUF` octet
    /// frame can carry at least one octet of information.
    pub fn start(
        &mut self,
        config: MuxConfig,
    ) -> Result<(Runner<'_, N, BUF>, [Channel<'_, BUF>; N]), Error> {
        if N == 0 || N > MAX_DLCI as usize || config.max_information_len(BUF) == 0 {
            error!("invalid multiplexer setup: {} channels, {} octet frames", N, BUF);
            return Err(Error::InvalidConfig);
        }

        let this = &*self;

        state::with(&this.state, |m| {
            m.phase = MuxPhase::Idle;
            m.close_requested = false;
            m.flow_off = false;
        });
        for ((channel, rx), tx) in this.channels.iter().zip(&this.rx).zip(&this.tx) {
            state::with(channel, |s| s.reset());
            rx.clear();
            tx.clear();
        }

        let channels = core::array::from_fn(|i| {
            Channel::new(
                i as u8 + 1,
                &this.channels[i],
                &this.state,
                &this.rx[i],
                &this.tx[i],
            )
        });
        let runner = Runner::new(&this.state, &this.channels, &this.rx, &this.tx, config);

        Ok((runner, channels))
    }
}

impl<const N: usize, const BUF: usize> Default for Mux<N, BUF> {
    fn default() -> Self {
        Self::new()
    }
}

/// Switch the module behind `at` to multiplexer mode.
///
/// Checks that the module responds to `AT`, then sends `AT+CMUX` with the
/// parameters of `config`. The serial port carries frames once this returns.
pub async fn enter_mux_mode<C: AtatClient>(at: &mut C, config: &MuxConfig) -> Result<(), Error> {
    let mut attempt = 1;
    loop {
        match at.send(&AT).await {
            Ok(_) => break,
            Err(e) if attempt < AT_ATTEMPTS => {
                debug!("no answer to AT ({:?}), attempt {}", e, attempt);
                attempt += 1;
                Timer::after(Duration::from_millis(100)).await;
            }
            Err(e) => {
                error!("module does not respond to AT");
                return Err(e.into());
            }
        }
    }

    info!("entering multiplexer mode");
    at.send(&config.command()).await?;
    Ok(())
}

/// Joins the two halves of a split serial port.
pub struct ReadWriteAdapter<R, W>(pub R, pub W);

impl<R, W> embedded_io_async::ErrorType for ReadWriteAdapter<R, W> {
    type Error = ErrorKind;
}

impl<R: Read, W> Read for ReadWriteAdapter<R, W> {
    async fn read(&mut self, buf: &mut [u8]) -> Result<usize, Self::Error> {
        self.0.read(buf).await.map_err(|e| embedded_io_async::Error::kind(&e))
    }
}

impl<R, W: Write> Write for ReadWriteAdapter<R, W> {
    async fn write(&mut self, buf: &[u8]) -> Result<usize, Self::Error> {
        self.1.write(buf).await.map_err(|e| embedded_io_async::Error::kind(&e))
    }

    async fn flush(&mut self) -> Result<(), Self::Error> {
        self.1.flush().await.map_err(|e| embedded_io_async::Error::kind(&e))
    }
}

#[cfg(test)]
mod test {
    use core::cell::{Cell, RefCell};
    use core::convert::Infallible;
    use std::vec::Vec;

    use embassy_futures::block_on;
    use embassy_futures::join::join;
    use embassy_futures::select::{select, Either};
    use embassy_sync::blocking_mutex::raw::NoopRawMutex;
    use embassy_sync::pipe::Pipe;
    use embassy_time::{Duration, Timer};
    use embedded_io_async::{ErrorType, Read, Write};

    use atat::AtatCmd;

    use super::*;
    use crate::control::{
        ControlFrame, ControlMessage, InformationFrameType, ModemStatus, ParameterNegotiation,
        V24Signals,
    };
    use crate::error::ChannelError;
    use crate::frame::{Decoder, Frame, FrameType, Role, Transparency};

    type SerialPipe = Pipe<NoopRawMutex, 1024>;

    /// One direction of a simulated serial line.
    struct Wire<'a>(&'a SerialPipe);

    impl ErrorType for Wire<'_> {
        type Error = Infallible;
    }

    impl Read for Wire<'_> {
        async fn read(&mut self, buf: &mut [u8]) -> Result<usize, Infallible> {
            Ok(self.0.read(buf).await)
        }
    }

    impl Write for Wire<'_> {
        async fn write(&mut self, buf: &[u8]) -> Result<usize, Infallible> {
            Ok(self.0.write(buf).await)
        }

        async fn flush(&mut self) -> Result<(), Infallible> {
            Ok(())
        }
    }

    fn init_logger() {
        let _ = env_logger::builder().is_test(true).try_init();
    }

    async fn write_wire(wire: &SerialPipe, mut data: &[u8]) {
        while !data.is_empty() {
            let n = wire.write(data).await;
            data = &data[n..];
        }
    }

    async fn inject_as(wire: &SerialPipe, transparency: Transparency, frame: Frame<'_>) {
        let mut buf = [0u8; 512];
        let len = frame.encode(transparency, &mut buf).unwrap();
        write_wire(wire, &buf[..len]).await;
    }

    async fn inject(wire: &SerialPipe, frame: Frame<'_>) {
        inject_as(wire, Transparency::Basic, frame).await
    }

    async fn inject_control_as(
        wire: &SerialPipe,
        transparency: Transparency,
        message: ControlFrame<'_>,
    ) {
        let mut info = [0u8; 32];
        let len = message.encode(&mut info).unwrap();
        inject_as(wire, transparency, Frame::uih(0, Role::Responder, &info[..len])).await;
    }

    async fn inject_control(wire: &SerialPipe, message: ControlFrame<'_>) {
        inject_control_as(wire, Transparency::Basic, message).await
    }

    async fn settle() {
        Timer::after(Duration::from_millis(30)).await;
    }

    /// Module side of the link: accepts every DLC, acknowledges control
    /// commands and answers `AT` with `OK`.
    #[derive(Default)]
    struct Modem {
        /// Speak the advanced option instead of the basic one.
        advanced: bool,
        /// Answer SABM on this DLCI with DM.
        refuse: Option<u8>,
        /// Ignore everything.
        silent: bool,
        /// Never acknowledge CLD.
        ignore_close_down: bool,
        received: RefCell<Vec<u8>>,
        largest_frame: Cell<usize>,
        modem_status: RefCell<Vec<ModemStatus>>,
        close_down: Cell<bool>,
        /// Encoded control responses received from the host.
        responses: RefCell<Vec<Vec<u8>>>,
    }

    impl Modem {
        fn transparency(&self) -> Transparency {
            if self.advanced {
                Transparency::Advanced
            } else {
                Transparency::Basic
            }
        }

        async fn run(&self, rx: &SerialPipe, tx: &SerialPipe) {
            let mut decoder = Decoder::<512>::new(self.transparency());
            let mut chunk = [0u8; 64];

            loop {
                let n = rx.read(&mut chunk).await;
                if self.silent {
                    continue;
                }

                let mut pos = 0;
                while pos < n {
                    let (used, result) = decoder.decode(&chunk[pos..n]);
                    pos += used;
                    if let Some(Ok(frame)) = result {
                        self.handle(frame, tx).await;
                    }
                }
            }
        }

        async fn handle(&self, frame: Frame<'_>, tx: &SerialPipe) {
            let dlci = frame.dlci();
            let transparency = self.transparency();
            match frame.frame_type {
                FrameType::Sabm if self.refuse == Some(dlci) => {
                    inject_as(tx, transparency, Frame::dm(dlci, Role::Responder, true)).await
                }
                FrameType::Sabm => {
                    inject_as(tx, transparency, Frame::ua(dlci, Role::Responder, true)).await
                }
                FrameType::Uih if dlci == 0 => {
                    let mut info = frame.information;
                    while !info.is_empty() {
                        let (message, used) = ControlFrame::decode(info).unwrap();
                        let encoded = &info[..used];
                        info = &info[used..];

                        if !message.command {
                            self.responses.borrow_mut().push(encoded.to_vec());
                            continue;
                        }
                        match message.message {
                            ControlMessage::ModemStatus(msc) => {
                                self.modem_status.borrow_mut().push(msc)
                            }
                            ControlMessage::CloseDown => {
                                self.close_down.set(true);
                                if self.ignore_close_down {
                                    continue;
                                }
                            }
                            _ => {}
                        }
                        if let Some(reply) = message.reply() {
                            inject_control_as(tx, transparency, reply).await;
                        }
                    }
                }
                FrameType::Uih => {
                    self.largest_frame
                        .set(self.largest_frame.get().max(frame.information.len()));
                    self.received.borrow_mut().extend_from_slice(frame.information);
                    if frame.information.ends_with(b"AT\r\n") {
                        let ok = Frame::uih(dlci, Role::Responder, b"\r\nOK\r\n");
                        inject_as(tx, transparency, ok).await;
                    }
                }
                _ => {}
            }
        }
    }

    /// Run `app` against a mux connected to `modem`, returning the result
    /// of the runner.
    fn run_with_modem<const N: usize, F: core::future::Future>(
        runner: Runner<'_, N, 256>,
        modem: &Modem,
        to_host: &SerialPipe,
        to_modem: &SerialPipe,
        app: F,
    ) -> Result<(), Error> {
        block_on(async {
            let mut rx = Wire(to_host);
            let mut tx = Wire(to_modem);
            match select(join(runner.run(&mut rx, &mut tx), app), modem.run(to_modem, to_host)).await
            {
                Either::First((result, _)) => result,
                Either::Second(()) => unreachable!(),
            }
        })
    }

    #[test]
    fn open_exchange_and_close() {
        init_logger();

        let mut mux = Mux::<2, 256>::new();
        let (runner, [mut ch1, ch2]) = mux.start(MuxConfig::default()).unwrap();
        let handle = runner.handle();
        let (to_host, to_modem) = (SerialPipe::new(), SerialPipe::new());
        let modem = Modem::default();

        let result = run_with_modem(runner, &modem, &to_host, &to_modem, async {
            ch1.wait_open().await.unwrap();
            ch2.wait_open().await.unwrap();
            assert!(handle.is_running());

            ch1.write_all(b"AT\r\n").await.unwrap();
            let mut buf = [0u8; 6];
            ch1.read_exact(&mut buf).await.unwrap();
            assert_eq!(&buf, b"\r\nOK\r\n");

            handle.close();
        });

        assert_eq!(result, Ok(()));
        assert_eq!(handle.phase(), MuxPhase::Stopped);
        assert!(modem.close_down.get());
        assert_eq!(modem.received.borrow().as_slice(), b"AT\r\n");

        let status = modem.modem_status.borrow();
        assert!(status.contains(&ModemStatus::new(1, V24Signals::ready())));
        assert!(status.contains(&ModemStatus::new(2, V24Signals::ready())));

        assert_eq!(ch1.link_state(), LinkState::Closed);
        block_on(async {
            let mut buf = [0u8; 4];
            assert_eq!(ch1.read(&mut buf).await, Err(ChannelError::Closed));
            assert_eq!(ch1.write(b"AT\r\n").await, Err(ChannelError::Closed));
        });
    }

    #[test]
    fn data_is_split_at_n1() {
        init_logger();

        let mut mux = Mux::<1, 256>::new();
        let (runner, [mut ch1]) = mux.start(MuxConfig::default()).unwrap();
        let handle = runner.handle();
        let (to_host, to_modem) = (SerialPipe::new(), SerialPipe::new());
        let modem = Modem::default();

        let data: Vec<u8> = (0..200u8).collect();
        let result = run_with_modem(runner, &modem, &to_host, &to_modem, async {
            ch1.wait_open().await.unwrap();
            ch1.write_all(&data).await.unwrap();
            ch1.flush().await.unwrap();
            settle().await;
            handle.close();
        });

        assert_eq!(result, Ok(()));
        assert_eq!(modem.received.borrow().as_slice(), data.as_slice());
        assert_eq!(modem.largest_frame.get(), 31);
    }

    #[test]
    fn remote_flow_control_pauses_channel() {
        init_logger();

        let mut mux = Mux::<1, 256>::new();
        let (runner, [mut ch1]) = mux.start(MuxConfig::default()).unwrap();
        let handle = runner.handle();
        let (to_host, to_modem) = (SerialPipe::new(), SerialPipe::new());
        let modem = Modem::default();

        let result = run_with_modem(runner, &modem, &to_host, &to_modem, async {
            ch1.wait_open().await.unwrap();

            let stopped = V24Signals::ready().union(V24Signals::FC);
            inject_control(
                &to_host,
                ControlFrame::command(ControlMessage::ModemStatus(ModemStatus::new(1, stopped))),
            )
            .await;
            settle().await;
            assert_eq!(ch1.lines(), stopped);

            ch1.write_all(b"hello").await.unwrap();
            settle().await;
            assert!(modem.received.borrow().is_empty());

            inject_control(
                &to_host,
                ControlFrame::command(ControlMessage::ModemStatus(ModemStatus::new(
                    1,
                    V24Signals::ready(),
                ))),
            )
            .await;
            settle().await;
            assert_eq!(modem.received.borrow().as_slice(), b"hello");

            // Global flow control
            inject_control(&to_host, ControlFrame::command(ControlMessage::FlowControlOff)).await;
            settle().await;
            ch1.write_all(b"world").await.unwrap();
            settle().await;
            assert_eq!(modem.received.borrow().as_slice(), b"hello");

            inject_control(&to_host, ControlFrame::command(ControlMessage::FlowControlOn)).await;
            settle().await;
            assert_eq!(modem.received.borrow().as_slice(), b"helloworld");

            handle.close();
        });

        assert_eq!(result, Ok(()));
    }

    #[test]
    fn hangup_reported_after_buffered_data() {
        init_logger();

        let mut mux = Mux::<1, 256>::new();
        let (runner, [mut ch1]) = mux.start(MuxConfig::default()).unwrap();
        let handle = runner.handle();
        let (to_host, to_modem) = (SerialPipe::new(), SerialPipe::new());
        let modem = Modem::default();

        let result = run_with_modem(runner, &modem, &to_host, &to_modem, async {
            ch1.wait_open().await.unwrap();
            ch1.set_hangup_detection(V24Signals::DV, V24Signals::empty());

            inject(&to_host, Frame::uih(1, Role::Responder, b"NO CARRIER")).await;
            inject_control(
                &to_host,
                ControlFrame::command(ControlMessage::ModemStatus(ModemStatus::new(
                    1,
                    V24Signals::RTC.union(V24Signals::RTR),
                ))),
            )
            .await;
            settle().await;

            let mut buf = [0u8; 10];
            ch1.read_exact(&mut buf).await.unwrap();
            assert_eq!(&buf, b"NO CARRIER");
            assert_eq!(ch1.read(&mut buf).await, Err(ChannelError::Hangup));

            ch1.clear_hangup_detection();
            inject(&to_host, Frame::uih(1, Role::Responder, b"OK")).await;
            assert_eq!(ch1.read(&mut buf).await, Ok(2));

            handle.close();
        });

        assert_eq!(result, Ok(()));
    }

    #[test]
    fn local_lines_sent_with_msc() {
        init_logger();

        let mut mux = Mux::<1, 256>::new();
        let (runner, [ch1]) = mux.start(MuxConfig::default()).unwrap();
        let handle = runner.handle();
        let (to_host, to_modem) = (SerialPipe::new(), SerialPipe::new());
        let modem = Modem::default();

        let escape = V24Signals::RTC.union(V24Signals::DV);
        let result = run_with_modem(runner, &modem, &to_host, &to_modem, async {
            ch1.wait_open().await.unwrap();
            ch1.set_lines(escape, None);
            settle().await;
            handle.close();
        });

        assert_eq!(result, Ok(()));
        assert_eq!(
            modem.modem_status.borrow().last(),
            Some(&ModemStatus::new(1, escape))
        );
    }

    #[test]
    fn remote_close_down_stops_runner() {
        init_logger();

        let mut mux = Mux::<1, 256>::new();
        let (runner, [mut ch1]) = mux.start(MuxConfig::default()).unwrap();
        let (to_host, to_modem) = (SerialPipe::new(), SerialPipe::new());
        let modem = Modem::default();

        let result = run_with_modem(runner, &modem, &to_host, &to_modem, async {
            ch1.wait_open().await.unwrap();
            inject_control(&to_host, ControlFrame::command(ControlMessage::CloseDown)).await;

            let mut buf = [0u8; 4];
            assert_eq!(ch1.read(&mut buf).await, Err(ChannelError::Closed));
        });

        assert_eq!(result, Ok(()));
        // The modem saw our acknowledgement, not a command of its own.
        assert!(!modem.close_down.get());
    }

    #[test]
    fn refused_channel_is_closed() {
        init_logger();

        let mut mux = Mux::<2, 256>::new();
        let (runner, [ch1, ch2]) = mux.start(MuxConfig::default()).unwrap();
        let handle = runner.handle();
        let (to_host, to_modem) = (SerialPipe::new(), SerialPipe::new());
        let modem = Modem {
            refuse: Some(2),
            ..Modem::default()
        };

        let result = run_with_modem(runner, &modem, &to_host, &to_modem, async {
            ch1.wait_open().await.unwrap();
            assert_eq!(ch2.wait_open().await, Err(ChannelError::Closed));
            assert_eq!(ch1.link_state(), LinkState::Open);
            handle.close();
        });

        assert_eq!(result, Ok(()));
    }

    #[test]
    fn silent_modem_times_out() {
        init_logger();

        let mut mux = Mux::<1, 256>::new();
        let config = MuxConfig {
            t1: Duration::from_millis(10),
            n2: 2,
            ..MuxConfig::default()
        };
        let (runner, [ch1]) = mux.start(config).unwrap();
        let (to_host, to_modem) = (SerialPipe::new(), SerialPipe::new());
        let modem = Modem {
            silent: true,
            ..Modem::default()
        };

        let result = run_with_modem(runner, &modem, &to_host, &to_modem, async {
            assert_eq!(ch1.wait_open().await, Err(ChannelError::Closed));
        });

        assert_eq!(result, Err(Error::Timeout));
    }

    #[test]
    fn responder_accepts_remote_links() {
        init_logger();

        let mut mux = Mux::<1, 256>::new();
        let config = MuxConfig {
            role: Role::Responder,
            ..MuxConfig::default()
        };
        let (runner, [ch1]) = mux.start(config).unwrap();
        let handle = runner.handle();
        let (to_host, to_modem) = (SerialPipe::new(), SerialPipe::new());
        let modem = Modem::default();

        let result = run_with_modem(runner, &modem, &to_host, &to_modem, async {
            inject(&to_host, Frame::sabm(0, Role::Initiator)).await;
            inject(&to_host, Frame::sabm(1, Role::Initiator)).await;
            ch1.wait_open().await.unwrap();

            inject(&to_host, Frame::disc(1, Role::Initiator)).await;
            settle().await;
            assert_eq!(ch1.link_state(), LinkState::Closed);
            assert_eq!(ch1.wait_open().await, Err(ChannelError::Closed));

            handle.close();
        });

        assert_eq!(result, Ok(()));
    }

    #[test]
    fn unread_channel_does_not_block_others() {
        init_logger();

        let mut mux = Mux::<2, 256>::new();
        let (runner, [ch1, mut ch2]) = mux.start(MuxConfig::default()).unwrap();
        let handle = runner.handle();
        let (to_host, to_modem) = (SerialPipe::new(), SerialPipe::new());
        let modem = Modem::default();

        let data: Vec<u8> = (0..300u16).map(|i| i as u8).collect();
        let result = run_with_modem(runner, &modem, &to_host, &to_modem, async {
            ch1.wait_open().await.unwrap();
            ch2.wait_open().await.unwrap();

            // More than the rx pipe of channel 1 holds, and nobody reads it.
            for chunk in data.chunks(100) {
                inject(&to_host, Frame::uih(1, Role::Responder, chunk)).await;
            }
            inject(&to_host, Frame::uih(2, Role::Responder, b"hi")).await;

            let mut buf = [0u8; 2];
            ch2.read_exact(&mut buf).await.unwrap();
            assert_eq!(&buf, b"hi");

            settle().await;
            let stopped = ModemStatus::new(1, V24Signals::ready().union(V24Signals::FC));
            assert!(modem.modem_status.borrow().contains(&stopped));

            handle.close();
        });

        assert_eq!(result, Ok(()));
        assert!(modem.close_down.get());
    }

    #[test]
    fn parked_data_resumes_remote() {
        init_logger();

        let mut mux = Mux::<1, 256>::new();
        let (runner, [mut ch1]) = mux.start(MuxConfig::default()).unwrap();
        let handle = runner.handle();
        let (to_host, to_modem) = (SerialPipe::new(), SerialPipe::new());
        let modem = Modem::default();

        let data: Vec<u8> = (0..300u16).map(|i| (i * 7) as u8).collect();
        let result = run_with_modem(runner, &modem, &to_host, &to_modem, async {
            ch1.wait_open().await.unwrap();

            for chunk in data.chunks(100) {
                inject(&to_host, Frame::uih(1, Role::Responder, chunk)).await;
            }
            settle().await;
            assert_eq!(
                modem.modem_status.borrow().last(),
                Some(&ModemStatus::new(1, V24Signals::ready().union(V24Signals::FC)))
            );

            let mut buf = [0u8; 300];
            ch1.read_exact(&mut buf).await.unwrap();
            assert_eq!(buf.as_slice(), data.as_slice());

            settle().await;
            assert_eq!(
                modem.modem_status.borrow().last(),
                Some(&ModemStatus::new(1, V24Signals::ready()))
            );

            handle.close();
        });

        assert_eq!(result, Ok(()));
    }

    #[test]
    fn advanced_option_exchange() {
        init_logger();

        let mut mux = Mux::<1, 256>::new();
        let config = MuxConfig {
            transparency: Transparency::Advanced,
            ..MuxConfig::default()
        };
        let (runner, [mut ch1]) = mux.start(config).unwrap();
        let handle = runner.handle();
        let (to_host, to_modem) = (SerialPipe::new(), SerialPipe::new());
        let modem = Modem {
            advanced: true,
            ..Modem::default()
        };

        let result = run_with_modem(runner, &modem, &to_host, &to_modem, async {
            ch1.wait_open().await.unwrap();

            ch1.write_all(b"AT\r\n").await.unwrap();
            let mut buf = [0u8; 6];
            ch1.read_exact(&mut buf).await.unwrap();
            assert_eq!(&buf, b"\r\nOK\r\n");

            handle.close();
        });

        assert_eq!(result, Ok(()));
        assert!(modem.close_down.get());
        assert_eq!(modem.received.borrow().as_slice(), b"AT\r\n");
        assert_eq!(
            modem.modem_status.borrow().first(),
            Some(&ModemStatus::new(1, V24Signals::ready()))
        );
    }

    #[test]
    fn control_commands_answered() {
        init_logger();

        let mut mux = Mux::<1, 256>::new();
        let (runner, [ch1]) = mux.start(MuxConfig::default()).unwrap();
        let handle = runner.handle();
        let (to_host, to_modem) = (SerialPipe::new(), SerialPipe::new());
        let modem = Modem::default();

        let pn = ParameterNegotiation {
            dlci: 1,
            frame_type: InformationFrameType::Uih,
            convergence_layer: 1,
            priority: 7,
            t1: 10,
            n1: 31,
            n2: 3,
            k: 2,
        };
        let result = run_with_modem(runner, &modem, &to_host, &to_modem, async {
            ch1.wait_open().await.unwrap();

            let commands = [
                ControlMessage::Test(&b"ping"[..]),
                ControlMessage::ParameterNegotiation(pn),
                ControlMessage::PowerSaving,
                ControlMessage::Unsupported {
                    kind: 0x93,
                    value: &[0x07],
                },
                ControlMessage::NonSupportedCommand(0x93),
            ];
            for message in commands {
                inject_control(&to_host, ControlFrame::command(message)).await;
            }
            settle().await;

            handle.close();
        });

        assert_eq!(result, Ok(()));

        let responses = modem.responses.borrow();
        let decoded: Vec<ControlFrame> = responses
            .iter()
            .map(|r| ControlFrame::decode(r).unwrap().0)
            .collect();
        assert_eq!(
            decoded,
            [
                ControlFrame::response(ControlMessage::Test(&b"ping"[..])),
                ControlFrame::response(ControlMessage::ParameterNegotiation(pn)),
                ControlFrame::response(ControlMessage::PowerSaving),
                ControlFrame::response(ControlMessage::NonSupportedCommand(0x93)),
            ]
        );
    }

    #[test]
    fn close_down_gives_up_after_t2() {
        init_logger();

        let mut mux = Mux::<1, 256>::new();
        let config = MuxConfig {
            t2: Duration::from_millis(50),
            ..MuxConfig::default()
        };
        let (runner, [ch1]) = mux.start(config).unwrap();
        let handle = runner.handle();
        let (to_host, to_modem) = (SerialPipe::new(), SerialPipe::new());
        let modem = Modem {
            ignore_close_down: true,
            ..Modem::default()
        };

        let result = run_with_modem(runner, &modem, &to_host, &to_modem, async {
            ch1.wait_open().await.unwrap();
            handle.close();
            handle.wait_stopped().await;
        });

        assert_eq!(result, Ok(()));
        assert!(modem.close_down.get());
        assert_eq!(handle.phase(), MuxPhase::Stopped);
        assert_eq!(ch1.link_state(), LinkState::Closed);
    }

    #[test]
    fn start_checks_setup() {
        let mut mux = Mux::<63, 64>::new();
        let (_, channels) = mux.start(MuxConfig::default()).unwrap();
        assert_eq!(channels[62].dlci(), 63);

        let mut mux = Mux::<64, 64>::new();
        assert_eq!(
            mux.start(MuxConfig::default()).err(),
            Some(Error::InvalidConfig)
        );

        // Too small for even one octet of information.
        let mut mux = Mux::<1, 7>::new();
        assert_eq!(
            mux.start(MuxConfig::default()).err(),
            Some(Error::InvalidConfig)
        );
    }

    /// Answers every command with OK after `timeouts` failed attempts.
    struct MockAtClient {
        timeouts: usize,
        sent: Vec<Vec<u8>>,
    }

    impl MockAtClient {
        fn new(timeouts: usize) -> Self {
            Self {
                timeouts,
                sent: Vec::new(),
            }
        }
    }

    impl AtatClient for MockAtClient {
        async fn send<Cmd: AtatCmd>(&mut self, cmd: &Cmd) -> Result<Cmd::Response, atat::Error> {
            let mut buf = std::vec![0u8; Cmd::MAX_LEN];
            let len = cmd.write(&mut buf);
            self.sent.push(buf[..len].to_vec());

            if self.timeouts > 0 {
                self.timeouts -= 1;
                return Err(atat::Error::Timeout);
            }
            let ok: &[u8] = &[];
            cmd.parse(Ok(ok))
        }
    }

    #[test]
    fn enter_mux_mode_retries_at() {
        init_logger();

        let mut at = MockAtClient::new(2);
        let result = block_on(enter_mux_mode(&mut at, &MuxConfig::default()));

        assert_eq!(result, Ok(()));
        assert_eq!(
            at.sent,
            [
                &b"AT\r\n"[..],
                b"AT\r\n",
                b"AT\r\n",
                b"AT+CMUX=0,0,5,31,10,3,30,10\r\n",
            ]
        );
    }

    #[test]
    fn enter_mux_mode_gives_up() {
        init_logger();

        let mut at = MockAtClient::new(AT_ATTEMPTS);
        let result = block_on(enter_mux_mode(&mut at, &MuxConfig::default()));

        assert_eq!(result, Err(Error::Atat(atat::Error::Timeout)));
        assert_eq!(at.sent.len(), AT_ATTEMPTS);
        assert!(at.sent.iter().all(|cmd| cmd.as_slice() == b"AT\r\n"));
    }

    #[test]
    fn adapter_joins_halves() {
        let (a, b) = (SerialPipe::new(), SerialPipe::new());
        block_on(async {
            let mut port = ReadWriteAdapter(Wire(&a), Wire(&b));
            port.write_all(b"AT\r\n").await.unwrap();

            let mut buf = [0u8; 4];
            assert_eq!(b.read(&mut buf).await, 4);
            assert_eq!(&buf, b"AT\r\n");

            a.write(b"OK").await;
            assert_eq!(port.read(&mut buf).await, Ok(2));
        });
    }
}
