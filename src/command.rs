//! The command module holds the logical JTAG and DAP register commands which
//! are queued by the capability handles and later packetized at commit.
//!
//! Queued commands borrow the caller's buffers for the lifetime `'a`; the
//! commit engines write results into them in place. Queueing never touches
//! the transport.

use std::collections::{TryReserveError, VecDeque};
use thiserror::Error;
use crate::tap::TapState;

#[derive(Error, Debug)]
pub enum Error {
    #[error("Out of resources while queueing command.")]
    OutOfResources(#[from] TryReserveError),
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

/// Register space addressed by a DAP transfer.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Port {
    DP,
    AP,
}

/// Direction of a DAP transfer.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum RW {
    R,
    W,
}

/// DAP_Transfer request byte.
///
/// Bit 0 selects AP (1) or DP (0), bit 1 is set for reads, bits 2 and 3
/// carry register address bits A2 and A3.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct TransferRequest(u8);

impl TransferRequest {
    pub fn new(port: Port, rw: RW, address: u8) -> Self {
        let port = match port { Port::DP => 0, Port::AP => 1 };
        let rw = match rw { RW::W => 0, RW::R => 1 };
        TransferRequest((address & 0b1100) | (rw << 1) | port)
    }

    pub fn byte(self) -> u8 {
        self.0
    }

    pub fn port(self) -> Port {
        if self.0 & 1 == 1 { Port::AP } else { Port::DP }
    }

    pub fn rw(self) -> RW {
        if self.0 & 2 == 2 { RW::R } else { RW::W }
    }

    /// Register address within the selected bank, one of 0x0, 0x4, 0x8, 0xC.
    pub fn address(self) -> u8 {
        self.0 & 0b1100
    }
}

/// A logical JTAG operation.
#[derive(Debug)]
pub enum JtagCommand<'a> {
    /// Walk the TAP to `target` along the shortest TMS path.
    StateMove { target: TapState },

    /// Shift `bits` bits of `data` out on TDI, replacing them with TDO.
    ///
    /// The final bit is clocked with TMS high, leaving the TAP in Exit1.
    ExchangeData { data: &'a mut [u8], bits: usize },

    /// Clock TCK `cycles` times in Run-Test/Idle.
    IdleWait { cycles: u32 },
}

/// Payload of a single-register transfer.
#[derive(Debug)]
pub enum SingleData<'a> {
    Write(u32),
    Read(&'a mut u32),
}

/// Payload of a block transfer to one register address.
#[derive(Debug)]
pub enum MultiData<'a> {
    Write(&'a [u32]),
    Read(&'a mut [u32]),
}

/// A logical DAP register operation.
#[derive(Debug)]
pub enum DapCommand<'a> {
    SingleReg { request: TransferRequest, data: SingleData<'a> },
    MultiReg { request: TransferRequest, data: MultiData<'a> },
}

/// Variant tag of a [`DapCommand`], used to split the queue into
/// homogeneous runs.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum DapCommandKind {
    SingleReg,
    MultiReg,
}

impl<'a> DapCommand<'a> {
    pub fn single_read(port: Port, address: u8, dest: &'a mut u32) -> Self {
        DapCommand::SingleReg {
            request: TransferRequest::new(port, RW::R, address),
            data: SingleData::Read(dest),
        }
    }

    pub fn single_write(port: Port, address: u8, value: u32) -> Self {
        DapCommand::SingleReg {
            request: TransferRequest::new(port, RW::W, address),
            data: SingleData::Write(value),
        }
    }

    pub fn multi_read(port: Port, address: u8, dest: &'a mut [u32]) -> Self {
        DapCommand::MultiReg {
            request: TransferRequest::new(port, RW::R, address),
            data: MultiData::Read(dest),
        }
    }

    pub fn multi_write(port: Port, address: u8, words: &'a [u32]) -> Self {
        DapCommand::MultiReg {
            request: TransferRequest::new(port, RW::W, address),
            data: MultiData::Write(words),
        }
    }

    pub fn kind(&self) -> DapCommandKind {
        match self {
            DapCommand::SingleReg { .. } => DapCommandKind::SingleReg,
            DapCommand::MultiReg { .. } => DapCommandKind::MultiReg,
        }
    }

    pub fn request(&self) -> TransferRequest {
        match self {
            DapCommand::SingleReg { request, .. } => *request,
            DapCommand::MultiReg { request, .. } => *request,
        }
    }

    /// Number of 32-bit words this command transfers.
    pub fn count(&self) -> usize {
        match self {
            DapCommand::SingleReg { .. } => 1,
            DapCommand::MultiReg { data: MultiData::Write(w), .. } => w.len(),
            DapCommand::MultiReg { data: MultiData::Read(r), .. } => r.len(),
        }
    }
}

/// Ordered list of pending commands.
#[derive(Debug)]
pub struct CommandQueue<C> {
    commands: VecDeque<C>,
}

pub type JtagQueue<'a> = CommandQueue<JtagCommand<'a>>;
pub type DapQueue<'a> = CommandQueue<DapCommand<'a>>;

impl<C> Default for CommandQueue<C> {
    fn default() -> Self {
        CommandQueue { commands: VecDeque::new() }
    }
}

impl<C> CommandQueue<C> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append `command` to the back of the queue.
    ///
    /// On allocation failure the queue is unchanged and the command is
    /// dropped back to the caller as an error.
    pub fn push(&mut self, command: C) -> Result<()> {
        self.commands.try_reserve(1)?;
        self.commands.push_back(command);
        Ok(())
    }

    pub fn iter(&self) -> impl Iterator<Item = &C> {
        self.commands.iter()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut C> {
        self.commands.iter_mut()
    }

    pub fn len(&self) -> usize {
        self.commands.len()
    }

    pub fn is_empty(&self) -> bool {
        self.commands.is_empty()
    }

    /// Remove the first `n` commands, or all of them if fewer are queued.
    pub fn remove_prefix(&mut self, n: usize) {
        let n = n.min(self.commands.len());
        self.commands.drain(..n);
    }

    pub fn clear(&mut self) {
        self.commands.clear();
    }
}

impl<'a> DapQueue<'a> {
    /// Tag of the command at the head of the queue.
    pub fn leading_run_type(&self) -> Option<DapCommandKind> {
        self.commands.front().map(|c| c.kind())
    }

    /// Remove and return every command at the head sharing the head's tag.
    pub fn take_leading_run(&mut self) -> Result<Vec<DapCommand<'a>>> {
        let kind = match self.leading_run_type() {
            Some(kind) => kind,
            None => return Ok(Vec::new()),
        };
        let n = self.commands.iter().take_while(|c| c.kind() == kind).count();
        let mut run = Vec::new();
        run.try_reserve_exact(n)?;
        run.extend(self.commands.drain(..n));
        Ok(run)
    }

    /// Put commands back at the head of the queue, preserving their order.
    ///
    /// Used to return the unexecuted tail of a run taken with
    /// [`take_leading_run`](Self::take_leading_run); the space they
    /// occupied is still reserved so this never reallocates.
    pub fn restore_front(&mut self, commands: Vec<DapCommand<'a>>) {
        for command in commands.into_iter().rev() {
            self.commands.push_front(command);
        }
    }
}

#[test]
fn test_transfer_request_byte() {
    assert_eq!(TransferRequest::new(Port::DP, RW::R, 0x0).byte(), 0b0010);
    assert_eq!(TransferRequest::new(Port::AP, RW::W, 0xC).byte(), 0b1101);
    assert_eq!(TransferRequest::new(Port::AP, RW::R, 0x4).byte(), 0b0111);
    // Only A2 and A3 are carried.
    assert_eq!(TransferRequest::new(Port::DP, RW::W, 0xF3).byte(), 0b0000);
    let req = TransferRequest::new(Port::AP, RW::R, 0x8);
    assert_eq!((req.port(), req.rw(), req.address()), (Port::AP, RW::R, 0x8));
}

#[test]
fn test_queue_push_remove_clear() {
    let mut q = JtagQueue::new();
    assert!(q.is_empty());
    q.push(JtagCommand::StateMove { target: TapState::Idle }).unwrap();
    q.push(JtagCommand::IdleWait { cycles: 10 }).unwrap();
    q.push(JtagCommand::StateMove { target: TapState::Reset }).unwrap();
    assert_eq!(q.len(), 3);
    q.remove_prefix(2);
    assert_eq!(q.len(), 1);
    assert!(matches!(q.iter().next(), Some(JtagCommand::StateMove { target: TapState::Reset })));
    q.remove_prefix(10);
    assert!(q.is_empty());
    q.push(JtagCommand::IdleWait { cycles: 1 }).unwrap();
    q.clear();
    assert!(q.is_empty());
}

#[test]
fn test_dap_queue_runs() {
    let mut a = 0;
    let mut b = 0;
    let mut block = [0u32; 4];
    let mut q = DapQueue::new();
    assert_eq!(q.leading_run_type(), None);
    q.push(DapCommand::single_read(Port::DP, 0x0, &mut a)).unwrap();
    q.push(DapCommand::single_write(Port::AP, 0x4, 0x1234)).unwrap();
    q.push(DapCommand::multi_read(Port::AP, 0xC, &mut block)).unwrap();
    q.push(DapCommand::single_read(Port::DP, 0x4, &mut b)).unwrap();

    assert_eq!(q.leading_run_type(), Some(DapCommandKind::SingleReg));
    let run = q.take_leading_run().unwrap();
    assert_eq!(run.len(), 2);
    assert_eq!(q.len(), 2);
    assert_eq!(q.leading_run_type(), Some(DapCommandKind::MultiReg));

    q.restore_front(run);
    assert_eq!(q.len(), 4);
    let kinds: Vec<_> = q.iter().map(|c| c.kind()).collect();
    assert_eq!(kinds, vec![DapCommandKind::SingleReg, DapCommandKind::SingleReg,
                           DapCommandKind::MultiReg, DapCommandKind::SingleReg]);
    assert_eq!(q.iter().nth(1).map(|c| c.request().byte()), Some(0b0101));

    q.remove_prefix(2);
    let run = q.take_leading_run().unwrap();
    assert_eq!(run.len(), 1);
    assert_eq!(run[0].count(), 4);
}
