#![cfg_attr(not(test), no_std)]

// This mod MUST go first, so that the others see its macros.
pub(crate) mod fmt;

pub mod asynch;
pub mod command;
pub mod config;
pub mod control;
pub mod dlc;
pub mod error;
pub mod frame;

pub use atat;
pub use config::{MuxConfig, PortSpeed};
pub use error::{ChannelError, Error};
