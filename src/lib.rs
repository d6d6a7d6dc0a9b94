// Copyright 2020, 2021 Adam Greig
// Licensed under the Apache-2.0 and MIT licenses.

//! dapqueue
//!
//! Queued JTAG sequences and DAP register transfers through CMSIS-DAP probes.
//!
//! A [`dap::DAP`] session wraps a [`probe::Transport`] and hands out a
//! [`jtag::JtagCapability`] and a [`transfer::DapCapability`]. Commands are
//! queued against caller-owned buffers and only reach the probe on commit,
//! packed into as few CMSIS-DAP packets as the probe allows.

#[macro_use]
pub mod bitvec;

pub mod tap;
pub mod command;
pub mod chain;
pub mod probe;
pub mod dap;
pub mod jtag;
pub mod transfer;

#[cfg(test)]
mod mock;

pub use tap::TapState;
pub use command::{Port, RW};
pub use chain::ScanChain;
pub use probe::Transport;
pub use dap::{DAP, Mode, Skill, HostStatus, ResetKind};
pub use jtag::JtagCapability;
pub use transfer::DapCapability;
