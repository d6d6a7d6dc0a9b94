//! JTAG sequence queueing and commit.
//!
//! Commands queued on a [`JtagCapability`] are first planned into sequence
//! descriptors grouped into packets (the size pass), then each packet is
//! encoded from the plan and executed, and finally captured TDO bits are
//! scattered back into the callers' buffers.

use thiserror::Error;
use crate::bitvec::{bytes_for_bits, copy_bits, extract_bits, read_word};
use crate::chain::ScanChain;
use crate::command::{Error as QueueError, JtagCommand, JtagQueue};
use crate::dap::{Command, DAP, Error as DAPError, Mode, Request, ResponseStatus};
use crate::probe::Transport;
use crate::tap::{TapState, TmsSequence};

#[derive(Error, Debug)]
pub enum Error {
    #[error("DAP error")]
    DAP(#[from] DAPError),
    #[error("Command queue error")]
    Queue(#[from] QueueError),
    #[error("Bit error")]
    Bits(#[from] crate::bitvec::Error),
    #[error("Scan chain error")]
    Chain(#[from] crate::chain::Error),
    #[error("Data exchange requested in {0} instead of Shift-DR or Shift-IR.")]
    NotInShiftState(TapState),
    #[error("Idle wait requested in {0} instead of Run-Test/Idle.")]
    NotInIdle(TapState),
    #[error("Cannot exchange {bits} bits using a {len} byte buffer.")]
    InvalidBitCount { bits: usize, len: usize },
    #[error("Probe is not in JTAG mode.")]
    NotJtagMode,
    #[error("Probe reported error while running JTAG sequence.")]
    SequenceRejected,
    #[error("Unexpected JTAG length returned from probe")]
    UnexpectedJTAGLength,
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

/// Most sequence descriptors a DAP_JTAG_Sequence packet can carry.
const MAX_SEQUENCES: usize = 255;

/// Most TCK cycles a single sequence descriptor can clock.
const MAX_CYCLES: usize = 64;

/// Queue of JTAG commands bound to one adapter session.
pub struct JtagCapability<'a, T: Transport> {
    dap: &'a DAP<T>,
    queue: JtagQueue<'a>,
}

impl<'a, T: Transport> JtagCapability<'a, T> {
    pub(crate) fn new(dap: &'a DAP<T>) -> Self {
        JtagCapability { dap, queue: JtagQueue::new() }
    }

    /// Queue a move of the TAP to `target`.
    pub fn to_state(&mut self, target: TapState) -> Result<()> {
        Ok(self.queue.push(JtagCommand::StateMove { target })?)
    }

    /// Queue an exchange of the first `bits` bits of `data`.
    ///
    /// TDI is taken from `data`, which is overwritten with TDO at commit.
    /// Bits of `data` beyond `bits` are left untouched.
    pub fn exchange_data(&mut self, data: &'a mut [u8], bits: usize) -> Result<()> {
        if bits == 0 || bits > data.len() * 8 {
            log::error!("Invalid exchange of {} bits from {} bytes", bits, data.len());
            return Err(Error::InvalidBitCount { bits, len: data.len() });
        }
        Ok(self.queue.push(JtagCommand::ExchangeData { data, bits })?)
    }

    /// Queue `cycles` TCK cycles in Run-Test/Idle.
    pub fn idle_wait(&mut self, cycles: u32) -> Result<()> {
        Ok(self.queue.push(JtagCommand::IdleWait { cycles })?)
    }

    /// Drop all queued commands without touching the probe.
    pub fn cancel(&mut self) {
        log::debug!("Cancelling {} queued JTAG commands", self.queue.len());
        self.queue.clear();
    }

    /// Drive the pins selected by `mask` to `out` immediately and return
    /// the pin input states after `wait_us` microseconds.
    pub fn pins(&self, mask: u8, out: u8, wait_us: u32) -> Result<u8> {
        Ok(self.dap.swj_pins(mask, out, wait_us)?)
    }

    pub fn queue(&self) -> &JtagQueue<'a> {
        &self.queue
    }

    /// TAP state as of the last successful commit.
    pub fn tap_state(&self) -> TapState {
        self.dap.tap_state()
    }

    /// Execute all queued commands.
    ///
    /// On success every command is consumed, their buffers hold TDO, and
    /// the session TAP state is updated. On failure the queue, the buffers
    /// and the TAP state are left as they were.
    pub fn commit(&mut self) -> Result<()> {
        if self.queue.is_empty() {
            return Ok(());
        }

        let (plan, tdo) = {
            let commands: Vec<&JtagCommand> = self.queue.iter().collect();
            let plan = JtagPlan::build(&commands, self.dap.tap_state(), self.dap.packet_size())?;
            if !plan.descriptors.is_empty() {
                if self.dap.mode() != Some(Mode::JTAG) {
                    return Err(Error::NotJtagMode);
                }
                if plan.exchanges && self.dap.scan_chain().is_none() {
                    log::error!("JTAG data exchange queued without a configured scan chain");
                    return Err(DAPError::NoScanChain.into());
                }
            }
            log::debug!("Committing {} JTAG commands as {} descriptors in {} packets",
                        commands.len(), plan.descriptors.len(), plan.packets.len());
            let tdo = self.execute(&commands, &plan)?;
            (plan, tdo)
        };

        self.scatter(&plan, &tdo)?;
        let n = self.queue.len();
        self.queue.remove_prefix(n);
        self.dap.set_tap_state(plan.end_state);
        Ok(())
    }

    /// Write every planned packet and collect the TDO bytes of each,
    /// keeping at most `max_packet_count` packets in flight.
    fn execute(&self, commands: &[&JtagCommand], plan: &JtagPlan) -> Result<Vec<Vec<u8>>> {
        let mut tdo = Vec::new();
        tdo.try_reserve_exact(plan.packets.len()).map_err(QueueError::from)?;

        for batch in plan.packets.chunks(self.dap.max_packet_count().max(1)) {
            let mut requests = Vec::new();
            requests.try_reserve_exact(batch.len()).map_err(QueueError::from)?;
            for packet in batch {
                requests.push(plan.encode(commands, packet)?);
            }
            for (packet, data) in batch.iter().zip(requests) {
                log::trace!("JTAG packet of {} sequences, {} bytes out, {} bytes back",
                            packet.end - packet.start, packet.request_len, packet.response_len);
                self.dap.submit(&Request { command: Command::DAP_JTAG_Sequence, data })?;
            }

            // Read every response of the batch even after a failure, so no
            // stale responses are left for the next exchange.
            let mut failure = None;
            for packet in batch {
                let response = self.dap.collect(Command::DAP_JTAG_Sequence)?;
                match response.get(1) {
                    Some(&s) if s == u8::from(ResponseStatus::DAP_OK) => {
                        if response.len() < packet.response_len {
                            failure.get_or_insert(Error::UnexpectedJTAGLength);
                        } else {
                            tdo.push(response[2..packet.response_len].to_vec());
                        }
                    },
                    _ => {
                        failure.get_or_insert(Error::SequenceRejected);
                    },
                }
            }
            if let Some(e) = failure {
                log::warn!("Probe rejected JTAG sequence: {}", e);
                return Err(e);
            }
        }

        Ok(tdo)
    }

    /// Copy captured TDO bits into the buffers of the exchange commands.
    fn scatter(&mut self, plan: &JtagPlan, tdo: &[Vec<u8>]) -> Result<()> {
        let mut commands: Vec<&mut JtagCommand<'a>> = self.queue.iter_mut().collect();
        for (packet, bytes) in plan.packets.iter().zip(tdo) {
            let mut pos = 0;
            for d in &plan.descriptors[packet.start..packet.end] {
                let (command, offset) = match d.data {
                    Some(loc) => loc,
                    None => continue,
                };
                let n = d.cycles as usize;
                match &mut *commands[command] {
                    JtagCommand::ExchangeData { data, .. } => {
                        copy_bits(&bytes[pos..], 0, &mut data[..], offset, n)?;
                    },
                    _ => return Err(anyhow::anyhow!("descriptor refers to a non-data command").into()),
                }
                pos += bytes_for_bits(n);
            }
        }
        Ok(())
    }
}

/// One DAP_JTAG_Sequence descriptor.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
struct Descriptor {
    /// TCK cycles, 1 to 64.
    cycles: u8,
    tms: bool,
    /// Exchange command index and bit offset into its buffer. Descriptors
    /// with data take TDI from and capture TDO into that buffer; the rest
    /// clock zeros out and capture nothing.
    data: Option<(usize, usize)>,
}

impl Descriptor {
    fn info(&self) -> u8 {
        let mut header = if self.cycles as usize == MAX_CYCLES { 0 } else { self.cycles };
        if self.tms {
            header |= 1 << 6;
        }
        if self.data.is_some() {
            header |= 1 << 7;
        }
        header
    }

    fn request_len(&self) -> usize {
        1 + bytes_for_bits(self.cycles as usize)
    }

    fn response_len(&self) -> usize {
        if self.data.is_some() { bytes_for_bits(self.cycles as usize) } else { 0 }
    }
}

/// A run of descriptors sent as one packet.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
struct Packet {
    start: usize,
    end: usize,
    /// Bytes written, including the command and count bytes.
    request_len: usize,
    /// Bytes expected back, including the command and status bytes.
    response_len: usize,
}

/// Result of the size pass over a JTAG queue.
#[derive(Debug)]
struct JtagPlan {
    descriptors: Vec<Descriptor>,
    packets: Vec<Packet>,
    end_state: TapState,
    exchanges: bool,
}

impl JtagPlan {
    fn build(commands: &[&JtagCommand], start: TapState, packet_size: usize) -> Result<Self> {
        let mut descriptors = Vec::new();
        let mut state = start;
        let mut exchanges = false;

        for (idx, command) in commands.iter().enumerate() {
            match command {
                JtagCommand::StateMove { target } => {
                    for (tms, cycles) in TmsSequence::between(state, *target).runs() {
                        push(&mut descriptors, Descriptor { cycles: cycles as u8, tms, data: None })?;
                    }
                    state = *target;
                },
                JtagCommand::ExchangeData { bits, .. } => {
                    if !state.is_shift() {
                        log::error!("Cannot exchange data in {}", state);
                        return Err(Error::NotInShiftState(state));
                    }
                    exchanges = true;
                    // All but the last bit with TMS low, then the last
                    // bit with TMS high to leave Shift.
                    let body = bits - 1;
                    let mut offset = 0;
                    while offset < body {
                        let n = (body - offset).min(MAX_CYCLES);
                        push(&mut descriptors,
                             Descriptor { cycles: n as u8, tms: false, data: Some((idx, offset)) })?;
                        offset += n;
                    }
                    push(&mut descriptors,
                         Descriptor { cycles: 1, tms: true, data: Some((idx, body)) })?;
                    state = if state == TapState::DrShift { TapState::DrExit1 } else { TapState::IrExit1 };
                },
                JtagCommand::IdleWait { cycles } => {
                    if state != TapState::Idle {
                        log::error!("Cannot idle in {}", state);
                        return Err(Error::NotInIdle(state));
                    }
                    let mut left = *cycles as usize;
                    while left > 0 {
                        let n = left.min(MAX_CYCLES);
                        push(&mut descriptors, Descriptor { cycles: n as u8, tms: false, data: None })?;
                        left -= n;
                    }
                },
            }
        }

        let packets = Self::split(&descriptors, packet_size)?;
        Ok(JtagPlan { descriptors, packets, end_state: state, exchanges })
    }

    /// Group descriptors into packets which respect `packet_size` in both
    /// directions and carry at most 255 descriptors each.
    fn split(descriptors: &[Descriptor], packet_size: usize) -> Result<Vec<Packet>> {
        let mut packets = Vec::new();
        let empty = |start| Packet { start, end: start, request_len: 2, response_len: 2 };
        let mut current = empty(0);

        for (idx, d) in descriptors.iter().enumerate() {
            let full = current.end - current.start == MAX_SEQUENCES
                || current.request_len + d.request_len() > packet_size
                || current.response_len + d.response_len() > packet_size;
            if full && current.end > current.start {
                push(&mut packets, current)?;
                current = empty(idx);
            }
            current.end = idx + 1;
            current.request_len += d.request_len();
            current.response_len += d.response_len();
        }
        if current.end > current.start {
            push(&mut packets, current)?;
        }
        Ok(packets)
    }

    /// Encode the payload of `packet`, following the command byte.
    fn encode(&self, commands: &[&JtagCommand], packet: &Packet) -> Result<Vec<u8>> {
        let mut data = Vec::new();
        data.try_reserve_exact(packet.request_len - 1).map_err(QueueError::from)?;
        data.push((packet.end - packet.start) as u8);
        for d in &self.descriptors[packet.start..packet.end] {
            data.push(d.info());
            let n = d.cycles as usize;
            match d.data {
                None => data.resize(data.len() + bytes_for_bits(n), 0),
                Some((command, offset)) => match commands[command] {
                    JtagCommand::ExchangeData { data: buf, .. } => {
                        data.extend(extract_bits(buf, offset, n)?);
                    },
                    _ => return Err(anyhow::anyhow!("descriptor refers to a non-data command").into()),
                },
            }
        }
        Ok(data)
    }
}

fn push<T>(v: &mut Vec<T>, item: T) -> Result<()> {
    v.try_reserve(1).map_err(QueueError::from)?;
    v.push(item);
    Ok(())
}

/// Read the IDCODE of every TAP on the scan chain.
///
/// TAPs without an IDCODE register select BYPASS after reset and report
/// `None`. Scanning stops at the all-ones fill, at an all-zeros word (TDO
/// stuck low, no target) or after `ScanChain::MAX_TAPS` entries.
pub fn idcodes<T: Transport>(dap: &DAP<T>) -> Result<Vec<Option<u32>>> {
    // Enough bits for a full chain of IDCODEs followed by a run of ones.
    const BITS: usize = 32 * 9;
    let mut buf = vec![0xFFu8; BITS / 8];
    {
        let mut jtag = dap.jtag()?;
        jtag.to_state(TapState::Reset)?;
        jtag.to_state(TapState::DrShift)?;
        jtag.exchange_data(&mut buf, BITS)?;
        jtag.to_state(TapState::Idle)?;
        jtag.commit()?;
    }

    let mut idcodes = Vec::new();
    let mut pos = 0;
    while pos + 32 <= BITS && idcodes.len() < ScanChain::MAX_TAPS {
        let word = read_word(&buf, pos, 32)? as u32;
        if word == 0xFFFF_FFFF || word == 0x0000_0000 {
            break;
        }
        if word & 1 == 0 {
            idcodes.push(None);
            pos += 1;
        } else {
            idcodes.push(Some(word));
            pos += 32;
        }
    }
    log::debug!("Found {} TAPs: {:08X?}", idcodes.len(), idcodes);
    Ok(idcodes)
}

/// Load `ir` into the selected TAP's instruction register with every other
/// TAP in BYPASS, then exchange `bits` bits of `data` through its data
/// register and return the captured bits, ending in Run-Test/Idle.
pub fn scan_tap<T: Transport>(dap: &DAP<T>, ir: u64, data: &[u8], bits: usize) -> Result<Vec<u8>> {
    let chain = dap.scan_chain().ok_or(DAPError::NoScanChain)?;
    let index = dap.tap_index();
    let (mut ir_buf, ir_bits) = chain.padded_ir(index, ir)?;
    let (mut dr_buf, dr_bits) = chain.padded_dr(index, data, bits)?;
    log::debug!("Scanning TAP {} with IR {:#x} and {} DR bits", index, ir, bits);
    {
        let mut jtag = dap.jtag()?;
        jtag.to_state(TapState::IrShift)?;
        jtag.exchange_data(&mut ir_buf, ir_bits)?;
        jtag.to_state(TapState::DrShift)?;
        jtag.exchange_data(&mut dr_buf, dr_bits)?;
        jtag.to_state(TapState::Idle)?;
        jtag.commit()?;
    }
    Ok(chain.unpad_dr(index, &dr_buf, bits)?)
}

#[cfg(test)]
use crate::mock::MockProbe;

#[cfg(test)]
fn jtag_session(packet_size: u16) -> (MockProbe, DAP<MockProbe>) {
    let probe = MockProbe::with_packet_size(packet_size);
    let mut dap = DAP::new(probe.clone()).unwrap();
    dap.configure_jtag(&[4]).unwrap();
    probe.clear_traffic();
    (probe, dap)
}

/// Descriptor counts of every DAP_JTAG_Sequence packet written.
#[cfg(test)]
fn sequence_counts(probe: &MockProbe) -> Vec<usize> {
    probe.state().packets.iter().filter(|p| p[0] == 0x14).map(|p| p[1] as usize).collect()
}

#[test]
fn test_descriptor_info() {
    let d = Descriptor { cycles: 64, tms: false, data: Some((0, 0)) };
    assert_eq!((d.info(), d.request_len(), d.response_len()), (0x80, 9, 8));
    let d = Descriptor { cycles: 1, tms: true, data: Some((0, 7)) };
    assert_eq!((d.info(), d.request_len(), d.response_len()), (0xC1, 2, 1));
    let d = Descriptor { cycles: 5, tms: true, data: None };
    assert_eq!((d.info(), d.request_len(), d.response_len()), (0x45, 2, 0));
}

#[test]
fn test_plan_state_moves_and_exchange() {
    let mut buf = [0u8; 2];
    let commands = [
        JtagCommand::StateMove { target: TapState::Reset },
        JtagCommand::StateMove { target: TapState::DrShift },
        JtagCommand::ExchangeData { data: &mut buf, bits: 10 },
        JtagCommand::StateMove { target: TapState::Idle },
        JtagCommand::IdleWait { cycles: 130 },
    ];
    let refs: Vec<&JtagCommand> = commands.iter().collect();
    let plan = JtagPlan::build(&refs, TapState::Idle, 64).unwrap();
    let infos: Vec<u8> = plan.descriptors.iter().map(|d| d.info()).collect();
    // Idle->Reset: 111. Reset->Shift-DR: 0, 1, 00. Nine bits, then one with TMS.
    // Exit1-DR->Idle: 1, 0. Idle wait: 64, 64, 2.
    assert_eq!(infos, vec![0x43, 0x01, 0x41, 0x02, 0x89, 0xC1, 0x41, 0x01, 0x00, 0x00, 0x02]);
    assert_eq!(plan.end_state, TapState::Idle);
    assert_eq!(plan.packets.len(), 1);
    let p = plan.packets[0];
    assert_eq!((p.start, p.end), (0, 11));
    assert_eq!(p.response_len, 2 + 2 + 1);
}

#[test]
fn test_plan_preconditions() {
    let mut buf = [0u8; 1];
    let commands = [JtagCommand::ExchangeData { data: &mut buf, bits: 8 }];
    let refs: Vec<&JtagCommand> = commands.iter().collect();
    assert!(matches!(JtagPlan::build(&refs, TapState::Idle, 64),
                     Err(Error::NotInShiftState(TapState::Idle))));
    let commands = [JtagCommand::IdleWait { cycles: 4 }];
    let refs: Vec<&JtagCommand> = commands.iter().collect();
    assert!(matches!(JtagPlan::build(&refs, TapState::DrPause, 64),
                     Err(Error::NotInIdle(TapState::DrPause))));
}

#[test]
fn test_split_respects_packet_size() {
    // 20 full-width descriptors of 9 bytes each: 6 fit in 64 bytes after the header.
    let d = Descriptor { cycles: 64, tms: false, data: None };
    let packets = JtagPlan::split(&[d; 20], 64).unwrap();
    let sizes: Vec<usize> = packets.iter().map(|p| p.end - p.start).collect();
    assert_eq!(sizes, vec![6, 6, 6, 2]);
    assert!(packets.iter().all(|p| p.request_len <= 64));
    assert_eq!(packets.last().map(|p| p.end), Some(20));
}

#[test]
fn test_split_at_sequence_limit() {
    let d = Descriptor { cycles: 1, tms: false, data: None };
    let sizes = |n: usize| -> Vec<usize> {
        JtagPlan::split(&vec![d; n], 1024).unwrap().iter().map(|p| p.end - p.start).collect()
    };
    assert_eq!(sizes(255), vec![255]);
    assert_eq!(sizes(256), vec![255, 1]);
    assert_eq!(sizes(511), vec![255, 255, 1]);
    assert!(sizes(0).is_empty());
}

#[test]
fn test_exchange_round_trip_with_splits() {
    use rand::{Rng, SeedableRng};
    let mut rng = rand::rngs::StdRng::seed_from_u64(0x5EED);
    let (probe, dap) = jtag_session(64);

    let bit_counts: Vec<usize> = (0..40).map(|_| rng.gen_range(1..=256)).collect();
    let mut buffers: Vec<Vec<u8>> = bit_counts.iter()
        .map(|&bits| (0..bytes_for_bits(bits)).map(|_| rng.gen()).collect())
        .collect();
    let original = buffers.clone();

    {
        let mut jtag = dap.jtag().unwrap();
        for (buf, &bits) in buffers.iter_mut().zip(&bit_counts) {
            jtag.to_state(TapState::DrShift).unwrap();
            jtag.exchange_data(buf, bits).unwrap();
        }
        jtag.commit().unwrap();
        assert!(jtag.queue().is_empty());
    }

    assert_eq!(buffers, original);
    assert!(sequence_counts(&probe).len() >= 3);
    assert_eq!(dap.tap_state(), TapState::DrExit1);
    assert_eq!(probe.state().tap, TapState::DrExit1);
    let s = probe.state();
    assert_eq!(s.writes, s.reads);
}

#[test]
fn test_exchange_overwrites_only_requested_bits() {
    let (_probe, dap) = jtag_session(64);
    let mut buf = [0x00, 0xF0];
    {
        let mut jtag = dap.jtag().unwrap();
        jtag.to_state(TapState::IrShift).unwrap();
        jtag.exchange_data(&mut buf, 12).unwrap();
        jtag.to_state(TapState::Idle).unwrap();
        jtag.commit().unwrap();
    }
    // The mock clears TDO bits beyond the clocked cycles, bits 12..16 survive.
    assert_eq!(buf, [0x00, 0xF0]);
    assert_eq!(dap.tap_state(), TapState::Idle);
}

#[test]
fn test_sequence_limit_at_command_boundary() {
    let (probe, dap) = jtag_session(1024);
    let mut singles = vec![[0u8; 1]; 64];
    for (i, b) in singles.iter_mut().enumerate() {
        b[0] = (i & 1) as u8;
    }
    let expected = singles.clone();
    {
        let mut jtag = dap.jtag().unwrap();
        // Idle->Shift-DR is two descriptors, each single-bit exchange plus
        // the return to Shift-DR is four more: 2 + 63 * 4 = 254.
        jtag.to_state(TapState::DrShift).unwrap();
        let (last, rest) = singles.split_last_mut().unwrap();
        for b in rest.iter_mut() {
            jtag.exchange_data(b, 1).unwrap();
            jtag.to_state(TapState::DrShift).unwrap();
        }
        // The 255th descriptor ends a command exactly.
        jtag.exchange_data(last, 1).unwrap();
        jtag.to_state(TapState::Idle).unwrap();
        jtag.commit().unwrap();
    }
    assert_eq!(sequence_counts(&probe), vec![255, 2]);
    assert_eq!(singles, expected);
    assert_eq!(probe.state().tap, TapState::Idle);
}

#[test]
fn test_sequence_limit_inside_command() {
    let (probe, dap) = jtag_session(1024);
    let mut singles = vec![[1u8; 1]; 63];
    let mut wide: Vec<u8> = (0..17).map(|i| (i * 37 + 11) as u8).collect();
    let expected = wide.clone();
    {
        let mut jtag = dap.jtag().unwrap();
        jtag.to_state(TapState::DrShift).unwrap();
        for b in singles.iter_mut() {
            jtag.exchange_data(b, 1).unwrap();
            jtag.to_state(TapState::DrShift).unwrap();
        }
        // 254 descriptors so far; this exchange needs 64 + 64 + 1 bits as
        // three descriptors, of which only the first fits.
        jtag.exchange_data(&mut wide, 129).unwrap();
        jtag.commit().unwrap();
    }
    assert_eq!(sequence_counts(&probe), vec![255, 2]);
    assert_eq!(wide, expected);
    assert!(singles.iter().all(|b| b[0] == 1));
    assert_eq!(dap.tap_state(), TapState::DrExit1);
}

#[test]
fn test_idle_wait_and_batches() {
    let (probe, dap) = jtag_session(64);
    {
        let mut jtag = dap.jtag().unwrap();
        jtag.idle_wait(64 * 60).unwrap();
        jtag.commit().unwrap();
    }
    // 60 descriptors of 9 bytes, 6 per packet, sent in batches of 4.
    assert_eq!(sequence_counts(&probe), vec![6; 10]);
    let s = probe.state();
    assert_eq!((s.writes, s.reads), (10, 10));
}

#[test]
fn test_rejected_sequence_leaves_queue() {
    let (probe, dap) = jtag_session(64);
    let mut buf = [0xA5u8; 4];
    let mut jtag = dap.jtag().unwrap();
    jtag.to_state(TapState::DrShift).unwrap();
    jtag.exchange_data(&mut buf, 32).unwrap();
    probe.state().reject_jtag = true;
    assert!(matches!(jtag.commit(), Err(Error::SequenceRejected)));
    assert_eq!(jtag.queue().len(), 2);
    assert_eq!(jtag.tap_state(), TapState::Idle);

    probe.state().reject_jtag = false;
    jtag.commit().unwrap();
    assert!(jtag.queue().is_empty());
    drop(jtag);
    assert_eq!(buf, [0xA5; 4]);
}

#[test]
fn test_precondition_failure_sends_nothing() {
    let (probe, dap) = jtag_session(64);
    let mut buf = [0u8; 1];
    let mut jtag = dap.jtag().unwrap();
    jtag.exchange_data(&mut buf, 8).unwrap();
    assert!(matches!(jtag.commit(), Err(Error::NotInShiftState(TapState::Idle))));
    assert_eq!(jtag.queue().len(), 1);
    assert_eq!(probe.state().writes, 0);
}

#[test]
fn test_invalid_bit_count() {
    let (_probe, dap) = jtag_session(64);
    let mut a = [0u8; 1];
    let mut b = [0u8; 1];
    let mut jtag = dap.jtag().unwrap();
    assert!(matches!(jtag.exchange_data(&mut a, 0), Err(Error::InvalidBitCount { bits: 0, len: 1 })));
    assert!(matches!(jtag.exchange_data(&mut b, 9), Err(Error::InvalidBitCount { bits: 9, len: 1 })));
    assert!(jtag.queue().is_empty());
}

#[test]
fn test_cancel_then_commit_is_silent() {
    let (probe, dap) = jtag_session(64);
    let mut buf = [0u8; 2];
    let mut jtag = dap.jtag().unwrap();
    jtag.to_state(TapState::DrShift).unwrap();
    jtag.exchange_data(&mut buf, 16).unwrap();
    jtag.cancel();
    jtag.commit().unwrap();
    let s = probe.state();
    assert_eq!((s.writes, s.reads), (0, 0));
}

#[test]
fn test_exchange_requires_scan_chain() {
    let probe = MockProbe::new();
    let dap = DAP::new(probe.clone()).unwrap();
    probe.clear_traffic();
    let mut buf = [0u8; 1];
    let mut jtag = dap.jtag().unwrap();
    jtag.to_state(TapState::DrShift).unwrap();
    jtag.exchange_data(&mut buf, 8).unwrap();
    assert!(matches!(jtag.commit(), Err(Error::DAP(DAPError::NoScanChain))));
    assert_eq!(probe.state().writes, 0);
}

#[test]
fn test_idcodes_through_echo() {
    // An echoing chain reads back the all-ones fill, so no IDCODE is found.
    let (_probe, dap) = jtag_session(64);
    assert!(idcodes(&dap).unwrap().is_empty());
    assert_eq!(dap.tap_state(), TapState::Idle);
}

#[test]
fn test_scan_tap_through_bypass() {
    let probe = MockProbe::new();
    let mut dap = DAP::new(probe.clone()).unwrap();
    assert!(matches!(scan_tap(&dap, 0, &[0], 1), Err(Error::DAP(DAPError::NoScanChain))));
    dap.configure_jtag(&[4, 5, 8]).unwrap();
    dap.set_tap_index(1).unwrap();
    probe.clear_traffic();

    let out = scan_tap(&dap, 0b00010, &[0xA5, 0x03], 10).unwrap();
    assert_eq!(out, vec![0xA5, 0x03]);
    assert_eq!(dap.tap_state(), TapState::Idle);
    assert_eq!(probe.state().tap, TapState::Idle);
    assert_eq!(probe.state().writes, 1);
}

#[test]
fn test_idcodes_with_tdo_stuck_low() {
    let (probe, dap) = jtag_session(64);
    probe.state().tdo_low = true;
    assert!(idcodes(&dap).unwrap().is_empty());
    assert_eq!(dap.tap_state(), TapState::Idle);
}

#[test]
fn test_transport_failure_leaves_state() {
    let (probe, dap) = jtag_session(64);
    probe.state().tdo_low = true;
    let mut buf = [0xA5u8; 64];
    let mut jtag = dap.jtag().unwrap();
    jtag.to_state(TapState::DrShift).unwrap();
    jtag.exchange_data(&mut buf, 512).unwrap();
    jtag.to_state(TapState::Idle).unwrap();
    // Eight 64-bit descriptors with TDO need more than one 64 byte packet.
    probe.state().fail_read_at = Some(2);
    assert!(matches!(jtag.commit(), Err(Error::DAP(DAPError::Probe(_)))));
    assert_eq!(jtag.queue().len(), 3);
    assert_eq!(jtag.tap_state(), TapState::Idle);
    drop(jtag);
    assert_eq!(buf, [0xA5; 64]);
}
