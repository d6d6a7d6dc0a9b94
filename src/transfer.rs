//! DAP register access queueing and commit.
//!
//! Single-register commands are packed into DAP_Transfer packets, block
//! commands are chunked into DAP_TransferBlock packets. The queue is
//! committed one homogeneous run at a time, and a WAIT or FAULT stops the
//! commit with everything from the failing command onwards still queued.

use thiserror::Error;
use crate::command::{DapCommand, DapCommandKind, DapQueue, Error as QueueError,
                     MultiData, Port, SingleData};
use crate::dap::{Command, DAP, Error as DAPError, Request};
use crate::probe::Transport;

#[derive(Error, Debug)]
pub enum Error {
    #[error("DAP error")]
    DAP(#[from] DAPError),
    #[error("Command queue error")]
    Queue(#[from] QueueError),
    #[error("Block transfers need at least one word.")]
    EmptyBlock,
    #[error("Transfer failed with ack {ack:#04x} after {completed} commands.")]
    TransferFault { completed: usize, ack: u8 },
    #[error("Block transfer failed with ack {ack:#04x} after {words} words, {completed} commands completed.")]
    BlockFault { completed: usize, words: usize, ack: u8 },
    #[error("Unexpected transfer response length from probe.")]
    UnexpectedLength,
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

/// Transfer acknowledge meaning success.
const ACK_OK: u8 = 1;

/// Most transfers one DAP_Transfer packet can request.
const MAX_TRANSFERS: usize = 255;

/// Queue of DAP register commands bound to one adapter session.
pub struct DapCapability<'a, T: Transport> {
    dap: &'a DAP<T>,
    queue: DapQueue<'a>,
}

impl<'a, T: Transport> DapCapability<'a, T> {
    pub(crate) fn new(dap: &'a DAP<T>) -> Self {
        DapCapability { dap, queue: DapQueue::new() }
    }

    /// Queue a read of register `address` into `dest`.
    pub fn single_read(&mut self, port: Port, address: u8, dest: &'a mut u32) -> Result<()> {
        Ok(self.queue.push(DapCommand::single_read(port, address, dest))?)
    }

    pub fn single_write(&mut self, port: Port, address: u8, value: u32) -> Result<()> {
        Ok(self.queue.push(DapCommand::single_write(port, address, value))?)
    }

    /// Queue `dest.len()` consecutive reads of register `address`.
    pub fn multi_read(&mut self, port: Port, address: u8, dest: &'a mut [u32]) -> Result<()> {
        if dest.is_empty() {
            return Err(Error::EmptyBlock);
        }
        Ok(self.queue.push(DapCommand::multi_read(port, address, dest))?)
    }

    /// Queue one write of each word to register `address`.
    pub fn multi_write(&mut self, port: Port, address: u8, words: &'a [u32]) -> Result<()> {
        if words.is_empty() {
            return Err(Error::EmptyBlock);
        }
        Ok(self.queue.push(DapCommand::multi_write(port, address, words))?)
    }

    /// Drop all queued commands without touching the probe.
    pub fn cancel(&mut self) {
        log::debug!("Cancelling {} queued DAP commands", self.queue.len());
        self.queue.clear();
    }

    pub fn queue(&self) -> &DapQueue<'a> {
        &self.queue
    }

    /// Execute queued commands until the queue is empty or one fails.
    ///
    /// Completed commands are removed and their read destinations filled.
    /// On a fault the failing command and all later ones stay queued, and
    /// the error reports how many commands this call completed.
    pub fn commit(&mut self) -> Result<()> {
        let mut completed = 0;
        while let Some(kind) = self.queue.leading_run_type() {
            let mut run = self.queue.take_leading_run()?;
            log::debug!("Committing run of {} {:?} commands", run.len(), kind);
            let mut done = 0;
            let result = match kind {
                DapCommandKind::SingleReg => self.transfer(&mut run, &mut done, &mut completed),
                DapCommandKind::MultiReg => self.transfer_blocks(&mut run, &mut done, &mut completed),
            };
            run.drain(..done);
            self.queue.restore_front(run);
            result?;
        }
        Ok(())
    }

    /// Run single-register commands, one DAP_Transfer packet per round trip.
    fn transfer(&self, run: &mut [DapCommand<'a>], done: &mut usize, completed: &mut usize)
        -> Result<()>
    {
        let packet_size = self.dap.packet_size();
        while *done < run.len() {
            let start = *done;

            // Request is command, index and count, then one request byte
            // per transfer and a word per write. Response is command, count
            // and ack, then a word per read.
            let mut data = vec![self.dap.dap_index(), 0];
            let (mut request_len, mut response_len, mut reads) = (3, 3, 0);
            let mut n = 0;
            for command in &run[start..] {
                let (request, write) = match command {
                    DapCommand::SingleReg { request, data: SingleData::Write(v) } => (request, Some(*v)),
                    DapCommand::SingleReg { request, data: SingleData::Read(_) } => (request, None),
                    DapCommand::MultiReg { .. } => break,
                };
                if n == MAX_TRANSFERS {
                    break;
                }
                match write {
                    Some(value) => {
                        if request_len + 5 > packet_size {
                            break;
                        }
                        request_len += 5;
                        data.push(request.byte());
                        data.extend_from_slice(&value.to_le_bytes());
                    },
                    None => {
                        if request_len + 1 > packet_size || response_len + 4 > packet_size {
                            break;
                        }
                        request_len += 1;
                        response_len += 4;
                        reads += 1;
                        data.push(request.byte());
                    },
                }
                n += 1;
            }
            data[1] = n as u8;
            log::trace!("DAP_Transfer of {} transfers, {} reads", n, reads);

            let response = self.dap.execute(Request { command: Command::DAP_Transfer, data })?;
            let (count, ack) = match response.get(1..3) {
                Some(&[count, ack]) => (count as usize, ack),
                _ => return Err(Error::UnexpectedLength),
            };
            if count > n {
                return Err(DAPError::InvalidResponse.into());
            }

            // Check every returned word is present before writing any.
            let returned = run[start..start + count].iter()
                .filter(|c| matches!(c, DapCommand::SingleReg { data: SingleData::Read(_), .. }))
                .count();
            if response.len() < 3 + 4 * returned {
                return Err(Error::UnexpectedLength);
            }
            let mut words = response[3..].chunks_exact(4)
                .map(|b| u32::from_le_bytes([b[0], b[1], b[2], b[3]]));
            for command in run[start..start + count].iter_mut() {
                if let DapCommand::SingleReg { data: SingleData::Read(dest), .. } = command {
                    **dest = words.next().ok_or(Error::UnexpectedLength)?;
                }
            }
            *done += count;
            *completed += count;

            if count < n || ack != ACK_OK {
                log::warn!("DAP_Transfer stopped after {} of {} transfers with ack {:#04x}",
                           count, n, ack);
                return Err(Error::TransferFault { completed: *completed, ack });
            }
        }
        Ok(())
    }

    /// Run block commands, each chunked into DAP_TransferBlock packets.
    fn transfer_blocks(&self, run: &mut [DapCommand<'a>], done: &mut usize, completed: &mut usize)
        -> Result<()>
    {
        while *done < run.len() {
            self.transfer_block(&mut run[*done], *completed)?;
            *done += 1;
            *completed += 1;
        }
        Ok(())
    }

    fn transfer_block(&self, command: &mut DapCommand<'a>, completed: usize) -> Result<()> {
        let packet_size = self.dap.packet_size();
        let request = command.request();
        let header = |n: usize| {
            let mut data = vec![self.dap.dap_index()];
            data.extend_from_slice(&(n as u16).to_le_bytes());
            data.push(request.byte());
            data
        };
        let mut words = 0;

        match command {
            DapCommand::MultiReg { data: MultiData::Read(dest), .. } => {
                let per_chunk = ((packet_size - 4) >> 2).min(u16::MAX as usize);
                for chunk in dest.chunks_mut(per_chunk) {
                    log::trace!("DAP_TransferBlock read of {} words", chunk.len());
                    let data = header(chunk.len());
                    let response = self.dap.execute(Request { command: Command::DAP_TransferBlock, data })?;
                    let (count, ack) = block_status(&response)?;
                    let count = count.min(chunk.len());
                    let bytes = response.get(4..4 + 4 * count).ok_or(Error::UnexpectedLength)?;
                    for (word, b) in chunk.iter_mut().zip(bytes.chunks_exact(4)) {
                        *word = u32::from_le_bytes([b[0], b[1], b[2], b[3]]);
                    }
                    words += count;
                    if count != chunk.len() || ack != ACK_OK {
                        log::warn!("DAP_TransferBlock read stopped after {} words with ack {:#04x}",
                                   words, ack);
                        return Err(Error::BlockFault { completed, words, ack });
                    }
                }
            },
            DapCommand::MultiReg { data: MultiData::Write(src), .. } => {
                let per_chunk = ((packet_size - 5) >> 2).min(u16::MAX as usize);
                for chunk in src.chunks(per_chunk) {
                    log::trace!("DAP_TransferBlock write of {} words", chunk.len());
                    let mut data = header(chunk.len());
                    for word in chunk {
                        data.extend_from_slice(&word.to_le_bytes());
                    }
                    let response = self.dap.execute(Request { command: Command::DAP_TransferBlock, data })?;
                    let (count, ack) = block_status(&response)?;
                    words += count.min(chunk.len());
                    if count != chunk.len() || ack != ACK_OK {
                        log::warn!("DAP_TransferBlock write stopped after {} words with ack {:#04x}",
                                   words, ack);
                        return Err(Error::BlockFault { completed, words, ack });
                    }
                }
            },
            DapCommand::SingleReg { .. } => return Err(anyhow::anyhow!("single transfer in block run").into()),
        }
        Ok(())
    }
}

/// Word count and ack of a DAP_TransferBlock response.
fn block_status(response: &[u8]) -> Result<(usize, u8)> {
    match response.get(1..4) {
        Some(&[lo, hi, ack]) => Ok((u16::from_le_bytes([lo, hi]) as usize, ack)),
        _ => Err(Error::UnexpectedLength),
    }
}

#[cfg(test)]
use crate::mock::{MockProbe, ACK_FAULT, ACK_WAIT};

#[cfg(test)]
fn swd_session(packet_size: u16) -> (MockProbe, DAP<MockProbe>) {
    let probe = MockProbe::with_packet_size(packet_size);
    probe.state().capabilities = 0b01;
    let dap = DAP::new(probe.clone()).unwrap();
    probe.clear_traffic();
    (probe, dap)
}

#[test]
fn test_single_reads_short_circuit() {
    let (probe, dap) = swd_session(64);
    probe.state().ap = [0x11, 0x22, 0x33, 0x44];
    probe.state().transfers_before_fault = Some(3);
    let mut out = [0xDEAD_BEEFu32; 5];
    {
        let mut regs = dap.registers().unwrap();
        for (slot, address) in out.iter_mut().zip([0x0, 0x4, 0x8, 0xC, 0x0]) {
            regs.single_read(Port::AP, address, slot).unwrap();
        }
        match regs.commit() {
            Err(Error::TransferFault { completed: 3, ack: ACK_WAIT }) => (),
            other => panic!("unexpected commit result {:?}", other),
        }
        assert_eq!(regs.queue().len(), 2);
        assert_eq!(probe.state().writes, 1);
    }
    assert_eq!(out, [0x11, 0x22, 0x33, 0xDEAD_BEEF, 0xDEAD_BEEF]);

    // Retrying the remainder after the fault clears.
    let mut rest = [0u32; 2];
    probe.state().transfers_before_fault = None;
    {
        let mut regs = dap.registers().unwrap();
        let (first, second) = rest.split_at_mut(1);
        regs.single_read(Port::AP, 0xC, &mut first[0]).unwrap();
        regs.single_read(Port::AP, 0x0, &mut second[0]).unwrap();
        regs.commit().unwrap();
        assert!(regs.queue().is_empty());
    }
    assert_eq!(rest, [0x44, 0x11]);
}

#[test]
fn test_retry_after_fault_completes_queue() {
    let (probe, dap) = swd_session(64);
    probe.state().ap = [0x11, 0x22, 0x33, 0x44];
    probe.state().transfers_before_fault = Some(1);
    let mut out = [0u32; 3];
    {
        let mut regs = dap.registers().unwrap();
        for (slot, address) in out.iter_mut().zip([0x4, 0x8, 0xC]) {
            regs.single_read(Port::AP, address, slot).unwrap();
        }
        assert!(matches!(regs.commit(), Err(Error::TransferFault { completed: 1, .. })));
        probe.state().transfers_before_fault = None;
        regs.commit().unwrap();
        assert!(regs.queue().is_empty());
    }
    assert_eq!(out, [0x22, 0x33, 0x44]);
}

#[test]
fn test_writes_fill_packets() {
    let (probe, dap) = swd_session(64);
    let values: Vec<u32> = (0..30).collect();
    {
        let mut regs = dap.registers().unwrap();
        for &v in values.iter() {
            regs.single_write(Port::AP, 0xC, v).unwrap();
        }
        regs.commit().unwrap();
    }
    let s = probe.state();
    // Three header bytes and five bytes per write: 12 writes per 64 bytes.
    let counts: Vec<u8> = s.packets.iter().map(|p| p[2]).collect();
    assert_eq!(counts, vec![12, 12, 6]);
    assert!(s.packets.iter().all(|p| p.len() <= 64));
    assert_eq!(s.ap[3], 29);
}

#[test]
fn test_mixed_runs_in_order() {
    let (probe, dap) = swd_session(64);
    let mut idcode = 0;
    let mut block = [0u32; 20];
    let mut after = 0;
    {
        let mut regs = dap.registers().unwrap();
        regs.single_write(Port::AP, 0x4, 0x2000_0000).unwrap();
        regs.single_read(Port::DP, 0x0, &mut idcode).unwrap();
        regs.multi_read(Port::AP, 0xC, &mut block).unwrap();
        regs.single_read(Port::AP, 0x4, &mut after).unwrap();
        regs.commit().unwrap();
    }
    assert_eq!(idcode, 0x6BA0_2477);
    assert_eq!(after, 0x2000_0000);
    let expected: Vec<u32> = (0..20).map(MockProbe::stream_word).collect();
    assert_eq!(&block[..], &expected[..]);
    let commands: Vec<u8> = probe.state().packets.iter().map(|p| p[0]).collect();
    // The block needs two chunks of at most 15 words.
    assert_eq!(commands, vec![0x05, 0x06, 0x06, 0x05]);
}

#[test]
fn test_large_block_read_chunking() {
    let (probe, dap) = swd_session(64);
    let mut block = vec![0u32; 10_000];
    {
        let mut regs = dap.registers().unwrap();
        regs.multi_read(Port::AP, 0xC, &mut block).unwrap();
        regs.commit().unwrap();
    }
    let s = probe.state();
    assert_eq!((s.writes, s.reads), (667, 667));
    assert!(block.iter().enumerate().all(|(i, &w)| w == MockProbe::stream_word(i as u32)));
}

#[test]
fn test_block_read_fault_keeps_prefix() {
    let (probe, dap) = swd_session(64);
    probe.state().transfers_before_fault = Some(20);
    probe.state().fault_ack = ACK_FAULT;
    let mut block = [0xFFFF_FFFFu32; 40];
    {
        let mut regs = dap.registers().unwrap();
        regs.multi_read(Port::AP, 0xC, &mut block).unwrap();
        match regs.commit() {
            Err(Error::BlockFault { completed: 0, words: 20, ack: ACK_FAULT }) => (),
            other => panic!("unexpected commit result {:?}", other),
        }
        assert_eq!(regs.queue().len(), 1);
    }
    assert!(block[..20].iter().enumerate().all(|(i, &w)| w == MockProbe::stream_word(i as u32)));
    assert!(block[20..].iter().all(|&w| w == 0xFFFF_FFFF));
}

#[test]
fn test_block_write_fault() {
    let (probe, dap) = swd_session(64);
    let words: Vec<u32> = (100..200).collect();
    let mut status = 0;
    probe.state().transfers_before_fault = Some(31);
    {
        let mut regs = dap.registers().unwrap();
        regs.single_write(Port::AP, 0x4, 0x2000_0000).unwrap();
        regs.multi_write(Port::AP, 0xC, &words).unwrap();
        regs.single_read(Port::DP, 0x4, &mut status).unwrap();
        // One transfer for the address write, then 14-word chunks.
        match regs.commit() {
            Err(Error::BlockFault { completed: 1, words: 30, ack: ACK_WAIT }) => (),
            other => panic!("unexpected commit result {:?}", other),
        }
        assert_eq!(regs.queue().len(), 2);
    }
    assert_eq!(&probe.state().block_written[..], &words[..30]);
}

#[test]
fn test_empty_block_rejected() {
    let (probe, dap) = swd_session(64);
    let mut empty: [u32; 0] = [];
    let mut regs = dap.registers().unwrap();
    assert!(matches!(regs.multi_read(Port::AP, 0xC, &mut empty), Err(Error::EmptyBlock)));
    assert!(matches!(regs.multi_write(Port::AP, 0xC, &[]), Err(Error::EmptyBlock)));
    assert!(regs.queue().is_empty());
    assert_eq!(probe.state().writes, 0);
}

#[test]
fn test_cancel_then_commit_is_silent() {
    let (probe, dap) = swd_session(64);
    let mut value = 0;
    let mut regs = dap.registers().unwrap();
    regs.single_read(Port::DP, 0x0, &mut value).unwrap();
    regs.single_write(Port::AP, 0x4, 1).unwrap();
    regs.cancel();
    regs.commit().unwrap();
    let s = probe.state();
    assert_eq!((s.writes, s.reads), (0, 0));
}

#[test]
fn test_registers_preconditions() {
    // JTAG mode needs the scan chain configured first.
    let probe = MockProbe::new();
    let mut dap = DAP::new(probe.clone()).unwrap();
    assert!(matches!(dap.registers(), Err(DAPError::NoScanChain)));
    dap.configure_jtag(&[4, 5]).unwrap();
    dap.set_tap_index(1).unwrap();
    probe.clear_traffic();

    let mut value = 0;
    {
        let mut regs = dap.registers().unwrap();
        regs.single_read(Port::DP, 0x0, &mut value).unwrap();
        regs.commit().unwrap();
    }
    assert_eq!(value, 0x6BA0_2477);
    // The selected TAP index addresses the DAP.
    assert_eq!(probe.state().packets[0][1], 1);
}

#[test]
fn test_transport_failure_restores_tail() {
    let (probe, dap) = swd_session(64);
    probe.state().ap = [7, 0, 0, 0];
    // Reads go 15 to a packet; the second packet never reaches the probe.
    probe.state().fail_write_at = Some(2);
    let mut out = [0u32; 30];
    {
        let mut regs = dap.registers().unwrap();
        for slot in out.iter_mut() {
            regs.single_read(Port::AP, 0x0, slot).unwrap();
        }
        assert!(matches!(regs.commit(), Err(Error::DAP(DAPError::Probe(_)))));
        assert_eq!(regs.queue().len(), 15);
    }
    assert!(out[..15].iter().all(|&w| w == 7));
    assert!(out[15..].iter().all(|&w| w == 0));
}

#[test]
fn test_transport_failure_mid_block() {
    let (probe, dap) = swd_session(64);
    probe.state().fail_read_at = Some(2);
    let mut block = [0xFFFF_FFFFu32; 40];
    let mut after = 0xFFFF_FFFF;
    {
        let mut regs = dap.registers().unwrap();
        regs.multi_read(Port::AP, 0xC, &mut block).unwrap();
        regs.single_read(Port::DP, 0x0, &mut after).unwrap();
        assert!(matches!(regs.commit(), Err(Error::DAP(DAPError::Probe(_)))));
        assert_eq!(regs.queue().len(), 2);
        assert_eq!(probe.state().writes, 2);
    }
    assert!(block[..15].iter().enumerate().all(|(i, &w)| w == MockProbe::stream_word(i as u32)));
    assert!(block[15..].iter().all(|&w| w == 0xFFFF_FFFF));
    assert_eq!(after, 0xFFFF_FFFF);
}
