//! Simulated CMSIS-DAP probe firmware for tests.
//!
//! Every written packet is decoded and answered immediately; answers queue
//! up until read. JTAG sequences echo TDI back as TDO while a simulated TAP
//! follows TMS, DAP_Transfer works against a small register file, and
//! DAP_TransferBlock reads serve a deterministic word stream.

use std::{cell::{RefCell, RefMut}, collections::VecDeque, rc::Rc};
use crate::probe::{Transport, Error, Result};
use crate::tap::TapState;

/// Shared handle to a simulated probe. Clones observe the same state.
#[derive(Clone)]
pub(crate) struct MockProbe {
    state: Rc<RefCell<MockState>>,
}

pub(crate) struct MockState {
    /// Size of packets the transport currently moves.
    pub endpoint_size: usize,
    /// Packet size reported through DAP_Info.
    pub packet_size: u16,
    pub packet_count: u8,
    pub capabilities: u8,
    pub version: &'static str,

    pub writes: usize,
    pub reads: usize,
    pub packets: Vec<Vec<u8>>,
    responses: VecDeque<Vec<u8>>,

    pub tap: TapState,
    pub ir_lengths: Vec<u8>,
    pub reject_jtag: bool,
    /// Capture zeros instead of echoing TDI, as with no target attached.
    pub tdo_low: bool,
    /// Fail the nth write or read counted since the last `clear_traffic`.
    pub fail_write_at: Option<usize>,
    pub fail_read_at: Option<usize>,
    pub pins: u8,
    pub abort: Option<u32>,

    pub dp: [u32; 4],
    pub ap: [u32; 4],
    /// Words which may still transfer before every further one fails
    /// with `fault_ack`.
    pub transfers_before_fault: Option<usize>,
    pub fault_ack: u8,
    pub stream_pos: u32,
    pub block_written: Vec<u32>,
}

impl MockProbe {
    pub fn new() -> Self {
        Self::with_packet_size(64)
    }

    pub fn with_packet_size(packet_size: u16) -> Self {
        let state = MockState {
            endpoint_size: 64,
            packet_size,
            packet_count: 4,
            capabilities: 0b11,
            version: "2.1.0",
            writes: 0,
            reads: 0,
            packets: Vec::new(),
            responses: VecDeque::new(),
            tap: TapState::Reset,
            ir_lengths: Vec::new(),
            reject_jtag: false,
            tdo_low: false,
            fail_write_at: None,
            fail_read_at: None,
            pins: 0xFF,
            abort: None,
            dp: [0x6BA0_2477, 0, 0, 0],
            ap: [0; 4],
            transfers_before_fault: None,
            fault_ack: ACK_WAIT,
            stream_pos: 0,
            block_written: Vec::new(),
        };
        MockProbe { state: Rc::new(RefCell::new(state)) }
    }

    pub fn state(&self) -> RefMut<'_, MockState> {
        self.state.borrow_mut()
    }

    /// Word number `i` of the stream served to block reads.
    pub fn stream_word(i: u32) -> u32 {
        0x1000_0000 ^ i.wrapping_mul(0x9E37_79B9)
    }

    /// Reset the traffic counters, typically after session setup.
    pub fn clear_traffic(&self) {
        let mut s = self.state();
        s.writes = 0;
        s.reads = 0;
        s.packets.clear();
    }
}

pub(crate) const ACK_OK: u8 = 1;
pub(crate) const ACK_WAIT: u8 = 2;
pub(crate) const ACK_FAULT: u8 = 4;

impl Transport for MockProbe {
    fn write(&self, buf: &[u8]) -> Result<usize> {
        let mut s = self.state();
        s.writes += 1;
        if s.fail_write_at == Some(s.writes) {
            return Err(Error::Other(anyhow::anyhow!("write {} failed", s.writes)));
        }
        if buf.len() > s.endpoint_size {
            return Err(Error::Other(anyhow::anyhow!(
                "packet of {} bytes exceeds {}", buf.len(), s.endpoint_size)));
        }
        s.packets.push(buf.to_vec());
        let response = s.respond(buf);
        s.responses.push_back(response);
        Ok(buf.len())
    }

    fn read(&self, buf: &mut [u8]) -> Result<usize> {
        let mut s = self.state();
        s.reads += 1;
        let response = s.responses.pop_front().ok_or(Error::NoResponse)?;
        if s.fail_read_at == Some(s.reads) {
            return Err(Error::Other(anyhow::anyhow!("read {} failed", s.reads)));
        }
        let n = response.len().min(buf.len());
        buf[..n].copy_from_slice(&response[..n]);
        Ok(n)
    }

    fn packet_size(&self) -> usize {
        self.state.borrow().endpoint_size
    }

    fn set_packet_size(&mut self, packet_size: usize) {
        self.state().endpoint_size = packet_size;
    }
}

impl MockState {
    fn respond(&mut self, req: &[u8]) -> Vec<u8> {
        let cmd = req[0];
        let args = &req[1..];
        match cmd {
            0x00 => {
                let info: Vec<u8> = match args.first() {
                    Some(0x04) => {
                        let mut v = self.version.as_bytes().to_vec();
                        v.push(0);
                        v
                    },
                    Some(0xF0) => vec![self.capabilities],
                    Some(0xFE) => vec![self.packet_count],
                    Some(0xFF) => self.packet_size.to_le_bytes().to_vec(),
                    _ => vec![],
                };
                let mut resp = vec![0x00, info.len() as u8];
                resp.extend(info);
                resp
            },
            0x02 => {
                let port = match args.first() {
                    Some(0) if self.capabilities & 2 != 0 => 2,
                    Some(0) => 1,
                    Some(&p) if p <= 2 && self.capabilities & p != 0 => p,
                    _ => 0,
                };
                vec![0x02, port]
            },
            0x01 | 0x03 | 0x04 | 0x11 => vec![cmd, 0x00],
            0x12 => {
                let bits = match args[0] { 0 => 256, n => n as usize };
                for i in 0..bits {
                    self.tap = self.tap.next((args[1 + i / 8] >> (i % 8)) & 1 == 1);
                }
                vec![0x12, 0x00]
            },
            0x08 => {
                self.abort = Some(u32::from_le_bytes([args[1], args[2], args[3], args[4]]));
                vec![0x08, 0x00]
            },
            0x10 => {
                let (out, mask) = (args[0], args[1]);
                self.pins = (self.pins & !mask) | (out & mask);
                vec![0x10, self.pins]
            },
            0x14 => self.jtag_sequence(args),
            0x15 => {
                self.ir_lengths = args[1..1 + args[0] as usize].to_vec();
                vec![0x15, 0x00]
            },
            0x05 => self.transfer(args),
            0x06 => self.transfer_block(args),
            _ => vec![0xFF],
        }
    }

    fn jtag_sequence(&mut self, args: &[u8]) -> Vec<u8> {
        if self.reject_jtag {
            return vec![0x14, 0xFF];
        }
        let count = args[0] as usize;
        let mut pos = 1;
        let mut resp = vec![0x14, 0x00];
        for _ in 0..count {
            let info = args[pos];
            let cycles = match info & 0x3F { 0 => 64, n => n as usize };
            let tms = info & 0x40 != 0;
            let nbytes = (cycles + 7) / 8;
            let tdi = &args[pos + 1..pos + 1 + nbytes];
            if info & 0x80 != 0 {
                let mut tdo = if self.tdo_low { vec![0; nbytes] } else { tdi.to_vec() };
                if cycles % 8 != 0 {
                    tdo[nbytes - 1] &= (1 << (cycles % 8)) - 1;
                }
                resp.extend(tdo);
            }
            for _ in 0..cycles {
                self.tap = self.tap.next(tms);
            }
            pos += 1 + nbytes;
        }
        assert_eq!(pos, args.len(), "trailing bytes in JTAG sequence packet");
        resp
    }

    /// Consume one word of the fault budget, returning false once exhausted.
    fn take_transfer(&mut self) -> bool {
        match self.transfers_before_fault.as_mut() {
            Some(0) => false,
            Some(n) => {
                *n -= 1;
                true
            },
            None => true,
        }
    }

    fn transfer(&mut self, args: &[u8]) -> Vec<u8> {
        let count = args[1] as usize;
        let mut pos = 2;
        let mut done = 0;
        let mut ack = ACK_OK;
        let mut data = Vec::new();
        for _ in 0..count {
            let req = args[pos];
            pos += 1;
            let reg = ((req >> 2) & 3) as usize;
            let is_read = req & 2 != 0;
            let value = if is_read {
                None
            } else {
                let v = u32::from_le_bytes([args[pos], args[pos + 1], args[pos + 2], args[pos + 3]]);
                pos += 4;
                Some(v)
            };
            if !self.take_transfer() {
                ack = self.fault_ack;
                break;
            }
            let regs = if req & 1 != 0 { &mut self.ap } else { &mut self.dp };
            match value {
                Some(v) => regs[reg] = v,
                None => data.extend_from_slice(&regs[reg].to_le_bytes()),
            }
            done += 1;
        }
        let mut resp = vec![0x05, done as u8, ack];
        resp.extend(data);
        resp
    }

    fn transfer_block(&mut self, args: &[u8]) -> Vec<u8> {
        let count = u16::from_le_bytes([args[1], args[2]]) as usize;
        let req = args[3];
        let is_read = req & 2 != 0;
        let mut done = 0u16;
        let mut ack = ACK_OK;
        let mut data = Vec::new();
        for i in 0..count {
            if !self.take_transfer() {
                ack = self.fault_ack;
                break;
            }
            if is_read {
                data.extend_from_slice(&MockProbe::stream_word(self.stream_pos).to_le_bytes());
                self.stream_pos += 1;
            } else {
                let p = 4 + 4 * i;
                self.block_written.push(
                    u32::from_le_bytes([args[p], args[p + 1], args[p + 2], args[p + 3]]));
            }
            done += 1;
        }
        let mut resp = vec![0x06];
        resp.extend_from_slice(&done.to_le_bytes());
        resp.push(ack);
        resp.extend(data);
        resp
    }
}

#[test]
fn test_mock_answers_info() {
    let probe = MockProbe::with_packet_size(512);
    probe.write(&[0x00, 0xFF]).unwrap();
    let mut buf = [0u8; 64];
    let n = probe.read(&mut buf).unwrap();
    assert_eq!(&buf[..n], &[0x00, 0x02, 0x00, 0x02]);
    assert!(probe.read(&mut buf).is_err());
    let s = probe.state();
    assert_eq!((s.writes, s.reads), (1, 2));
}
