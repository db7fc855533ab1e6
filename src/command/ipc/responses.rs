//! Responses for IPC Commands
use atat::atat_derive::AtatResp;

/// 3.1 Multiplexing mode +CMUX
#[derive(Debug, Clone, PartialEq, AtatResp)]
pub struct MultiplexingParameters {
    #[at_arg(position = 0)]
    pub mode: u8,
    #[at_arg(position = 1)]
    pub subset: u8,
    #[at_arg(position = 2)]
    pub port_speed: u8,
    #[at_arg(position = 3)]
    pub n1: u16,
    #[at_arg(position = 4)]
    pub t1: u8,
    #[at_arg(position = 5)]
    pub n2: u8,
    #[at_arg(position = 6)]
    pub t2: u8,
    #[at_arg(position = 7)]
    pub t3: u8,
    #[at_arg(position = 8)]
    pub k: Option<u8>,
}
