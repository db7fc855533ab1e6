//! AT commands used to bring a u-blox cellular module into multiplexer mode.
//!
//! Following the u-blox AT commands manual, UBX-13002752.
pub mod ipc;

use atat::atat_derive::{AtatCmd, AtatResp};

#[derive(Debug, Clone, AtatResp)]
pub struct NoResponse;

/// Attention, used to check the module is responsive before switching mode.
#[derive(Debug, Clone, AtatCmd)]
#[at_cmd("", NoResponse, timeout_ms = 1000)]
pub struct AT;
