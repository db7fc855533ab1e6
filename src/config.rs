use embassy_time::Duration;

use crate::command::ipc::SetMultiplexing;
use crate::control::V24Signals;
use crate::frame::{Role, Transparency};

/// `<port_speed>` parameter of `AT+CMUX`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[repr(u8)]
pub enum PortSpeed {
    B9600 = 1,
    B19200 = 2,
    B38400 = 3,
    B57600 = 4,
    B115200 = 5,
    B230400 = 6,
    B460800 = 7,
}

/// Multiplexer system parameters, TS 27.010 section 5.7.
#[derive(Debug, Clone)]
pub struct MuxConfig {
    pub transparency: Transparency,
    /// The host normally starts the multiplexer and is the initiator.
    pub role: Role,
    /// Interface speed once the multiplexer is running.
    pub port_speed: PortSpeed,
    /// Maximum information field length.
    pub n1: u16,
    /// Acknowledgement timer.
    pub t1: Duration,
    /// Maximum number of retransmissions.
    pub n2: u8,
    /// Response timer for the multiplexer control channel.
    pub t2: Duration,
    /// Wake up response timer.
    pub t3: Duration,
    /// Window size, advanced option with error recovery only.
    pub k: u8,
    /// Signals sent with MSC on each DLC once it is established.
    pub initial_lines: V24Signals,
}

impl Default for MuxConfig {
    fn default() -> Self {
        Self {
            transparency: Transparency::Basic,
            role: Role::Initiator,
            port_speed: PortSpeed::B115200,
            n1: 31,
            t1: Duration::from_millis(100),
            n2: 3,
            t2: Duration::from_millis(300),
            t3: Duration::from_secs(10),
            k: 2,
            initial_lines: V24Signals::ready(),
        }
    }
}

impl MuxConfig {
    /// The `AT+CMUX` command that starts a multiplexer with these
    /// parameters.
    pub fn command(&self) -> SetMultiplexing {
        SetMultiplexing {
            mode: self.transparency as u8,
            subset: 0,
            port_speed: self.port_speed as u8,
            n1: Some(self.n1),
            t1: Some(ten_millis(self.t1)),
            n2: Some(self.n2),
            t2: Some(ten_millis(self.t2)),
            t3: Some(self.t3.as_secs().clamp(1, 255) as u8),
            k: match self.transparency {
                Transparency::Basic => None,
                Transparency::Advanced => Some(self.k),
            },
        }
    }

    /// Longest information field that fits in a frame buffer of `buf_len`
    /// bytes, capped at N1.
    pub fn max_information_len(&self, buf_len: usize) -> usize {
        let fits = match self.transparency {
            // flags, address, control, two length octets and FCS
            Transparency::Basic => buf_len.saturating_sub(7),
            // Worst case every octet between the flags is escaped.
            Transparency::Advanced => (buf_len.saturating_sub(2) / 2).saturating_sub(3),
        };
        fits.min(self.n1 as usize)
    }
}

fn ten_millis(d: Duration) -> u8 {
    (d.as_millis() / 10).clamp(1, 255) as u8
}
