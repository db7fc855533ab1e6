use embedded_io_async::ErrorKind;

#[derive(Debug, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[non_exhaustive]
pub enum Error {
    // Framing errors
    /// Output buffer cannot hold the encoded frame or message.
    BufferTooSmall,
    /// Information field is longer than the framing allows.
    FrameTooLarge,
    /// Address octet without the EA bit, or a DLCI above 63.
    InvalidAddress,
    /// Control octet does not name a known frame type.
    InvalidFrameType(u8),
    /// Length field is malformed or disagrees with the payload.
    InvalidLength,
    /// Frame check sequence mismatch.
    BadFcs,
    /// Closing flag missing where one was expected.
    MissingFlag,
    /// Input ended in the middle of a frame or message.
    Truncated,

    // Link errors
    /// The remote answered SABM with DM.
    Refused,
    /// No answer after N2 retransmissions.
    Timeout,
    /// The DLC, or the whole multiplexer, has been closed.
    Closed,

    // Setup errors
    /// Channel count outside `1..=63`, or a frame buffer too small to carry
    /// any information.
    InvalidConfig,

    // Transport errors
    Io(ErrorKind),
    Atat(atat::Error),
}

impl From<atat::Error> for Error {
    fn from(e: atat::Error) -> Self {
        Self::Atat(e)
    }
}

impl From<ErrorKind> for Error {
    fn from(e: ErrorKind) -> Self {
        Self::Io(e)
    }
}

/// Errors reported by the [`Read`](embedded_io_async::Read) and
/// [`Write`](embedded_io_async::Write) implementations of a mux channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum ChannelError {
    /// The DLC is closed, or the multiplexer has shut down.
    Closed,
    /// The remote signalled the configured hangup pattern over MSC.
    Hangup,
}

impl embedded_io_async::Error for ChannelError {
    fn kind(&self) -> ErrorKind {
        match self {
            Self::Closed => ErrorKind::NotConnected,
            Self::Hangup => ErrorKind::ConnectionReset,
        }
    }
}
