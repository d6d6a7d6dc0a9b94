//! The DAP module implements the CMSIS-DAP adapter session: it initializes
//! the probe, formats configuration commands into packets exchanged through
//! a `Transport`, tracks the TAP state, and hands out the JTAG and DAP
//! register capability handles which queue and commit commands.

use std::{cell::Cell, time::Duration, thread};
use thiserror::Error;
use num_enum::{IntoPrimitive, TryFromPrimitive};
use crate::probe::{Transport, Error as ProbeError};
use crate::chain::{ScanChain, Error as ChainError};
use crate::tap::TapState;
use crate::bitvec::{bytes_for_bits, get_bit};
use crate::jtag::JtagCapability;
use crate::transfer::DapCapability;

#[derive(Error, Debug)]
pub enum Error {
    #[error("Probe error")]
    Probe(#[from] ProbeError),
    #[error("Scan chain error")]
    Chain(#[from] ChainError),
    #[error("Command queue error")]
    Queue(#[from] crate::command::Error),
    #[error("No transfer mode selected.")]
    NoTransferMode,
    #[error("JTAG scan chain has not been configured.")]
    NoScanChain,
    #[error("TAP index {0} is outside the configured scan chain.")]
    InvalidTapIndex(usize),
    #[error("Probe does not support {0}.")]
    Unsupported(&'static str),
    #[error("Invalid response from probe.")]
    InvalidResponse,
    #[error("Probe reported error during connect.")]
    Connection,
    #[error("Probe reported error setting clock frequency.")]
    Clock,
    #[error("Probe reported error for {0:?} command.")]
    CommandFailed(Command),
    #[error("SWJ sequence of {0} bits is not in 1..=256 or lacks data.")]
    InvalidSequence(usize),
    #[error("Internal error: request of {len} bytes exceeds packet size {packet_size}.")]
    RequestTooLong { len: usize, packet_size: usize },
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

/// Wire protocol selected on the probe.
#[derive(Copy, Clone, Debug, PartialEq, Eq, IntoPrimitive, TryFromPrimitive)]
#[repr(u8)]
pub enum Mode {
    SWD                 = 1,
    JTAG                = 2,
}

impl Mode {
    fn name(self) -> &'static str {
        match self {
            Mode::SWD => "SWD",
            Mode::JTAG => "JTAG",
        }
    }
}

/// Capability bits reported by DAP_Info.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct Capabilities(u32);

impl Capabilities {
    pub fn bits(&self) -> u32 {
        self.0
    }

    pub fn swd(&self) -> bool {
        self.0 & 1 != 0
    }

    pub fn jtag(&self) -> bool {
        self.0 & 2 != 0
    }

    pub fn supports(&self, mode: Mode) -> bool {
        match mode {
            Mode::SWD => self.swd(),
            Mode::JTAG => self.jtag(),
        }
    }
}

/// Capabilities a session can hand out.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Skill {
    /// JTAG sequence queue, see [`DAP::jtag`].
    Jtag,
    /// DAP register queue, see [`DAP::registers`].
    Dap,
}

/// Host status indicators.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum HostStatus {
    Connect(bool),
    Running(bool),
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ResetKind {
    /// Pulse nRESET.
    System,
    /// JTAG TAP reset or SWD line reset, depending on the transfer mode.
    Debug,
}

/// Pin masks for [`DAP::swj_pins`].
pub mod pins {
    pub const TCK: u8 = 1 << 0;
    pub const TMS: u8 = 1 << 1;
    pub const TDI: u8 = 1 << 2;
    pub const TDO: u8 = 1 << 3;
    pub const NTRST: u8 = 1 << 5;
    pub const NRESET: u8 = 1 << 7;
}

pub struct DAP<T: Transport> {
    transport: T,
    packet_size: usize,
    max_packet_count: usize,
    capabilities: Capabilities,
    version: Option<String>,
    skills: Vec<Skill>,
    mode: Option<Mode>,
    chain: Option<ScanChain>,
    tap_index: usize,
    tap_state: Cell<TapState>,
}

impl<T: Transport> DAP<T> {
    pub fn new(transport: T) -> Result<DAP<T>> {
        // Drain any pending data in the probe's USB buffer, to
        // prevent our first reads being corrupted by unexpected
        // data.
        transport.drain()?;

        let packet_size = transport.packet_size();
        let mut dap = DAP {
            transport,
            packet_size,
            max_packet_count: 1,
            capabilities: Capabilities::default(),
            version: None,
            skills: Vec::new(),
            mode: None,
            chain: None,
            tap_index: 0,
            tap_state: Cell::new(TapState::Reset),
        };

        // Query the packet size over CMSIS-DAP using the transport's
        // endpoint size, then widen the transport to the reported size.
        dap.packet_size = dap.get_packet_size()?;
        dap.transport.set_packet_size(dap.packet_size);

        dap.max_packet_count = dap.get_packet_count()?;
        dap.capabilities = dap.get_capabilities()?;
        dap.version = dap.get_firmware_version()?;
        log::debug!("Probe firmware {:?}, packet size {}, packet count {}, capabilities {:#x}",
                    dap.version, dap.packet_size, dap.max_packet_count, dap.capabilities.bits());

        if dap.capabilities.jtag() {
            dap.skills.push(Skill::Jtag);
        }
        if dap.capabilities.jtag() || dap.capabilities.swd() {
            dap.skills.push(Skill::Dap);
        }

        let mode = dap.connect(ConnectPort::Default)?;
        dap.switch_sequence(mode)?;
        dap.mode = Some(mode);
        dap.set_host_status(HostStatus::Connect(true))?;

        Ok(dap)
    }

    pub fn packet_size(&self) -> usize {
        self.packet_size
    }

    pub fn max_packet_count(&self) -> usize {
        self.max_packet_count
    }

    pub fn capabilities(&self) -> Capabilities {
        self.capabilities
    }

    pub fn version(&self) -> Option<&str> {
        self.version.as_deref()
    }

    pub fn skills(&self) -> &[Skill] {
        &self.skills
    }

    pub fn mode(&self) -> Option<Mode> {
        self.mode
    }

    pub fn scan_chain(&self) -> Option<&ScanChain> {
        self.chain.as_ref()
    }

    pub fn tap_index(&self) -> usize {
        self.tap_index
    }

    /// Last known TAP controller state.
    pub fn tap_state(&self) -> TapState {
        self.tap_state.get()
    }

    pub(crate) fn set_tap_state(&self, state: TapState) {
        self.tap_state.set(state);
    }

    /// Index byte used to address the selected DAP in DAP_Transfer requests.
    pub(crate) fn dap_index(&self) -> u8 {
        self.tap_index as u8
    }

    /// Obtain the JTAG sequence capability.
    pub fn jtag(&self) -> Result<JtagCapability<'_, T>> {
        if !self.skills.contains(&Skill::Jtag) {
            return Err(Error::Unsupported("JTAG"));
        }
        Ok(JtagCapability::new(self))
    }

    /// Obtain the DAP register access capability.
    ///
    /// A transfer mode must be selected, and in JTAG mode the scan chain
    /// must be configured so the probe can reach the selected TAP.
    pub fn registers(&self) -> Result<DapCapability<'_, T>> {
        if !self.skills.contains(&Skill::Dap) {
            return Err(Error::Unsupported("DAP register access"));
        }
        match self.mode {
            None => return Err(Error::NoTransferMode),
            Some(Mode::JTAG) if self.chain.is_none() => return Err(Error::NoScanChain),
            _ => (),
        }
        Ok(DapCapability::new(self))
    }

    /// Disconnect and reconnect the probe using `mode`.
    pub fn set_transfer_mode(&mut self, mode: Mode) -> Result<()> {
        log::debug!("Selecting {} transfer mode", mode.name());
        if !self.capabilities.supports(mode) {
            return Err(Error::Unsupported(mode.name()));
        }
        self.disconnect()?;
        self.mode = None;
        let connected = self.connect(mode.into())?;
        if connected != mode {
            return Err(Error::Connection);
        }
        self.switch_sequence(mode)?;
        self.mode = Some(mode);
        Ok(())
    }

    /// Describe the JTAG scan chain to the probe.
    ///
    /// `ir_lengths[0]` is the TAP closest to TDO. Resets the selected
    /// TAP index to 0.
    pub fn configure_jtag(&mut self, ir_lengths: &[u8]) -> Result<()> {
        let chain = ScanChain::new(ir_lengths)?;
        log::debug!("Configuring JTAG chain with IR lengths {:?}", ir_lengths);
        let mut data = vec![chain.tap_count() as u8];
        data.extend_from_slice(chain.ir_lengths());
        self.execute_checked(Request { command: Command::DAP_JTAG_Configure, data })?;
        self.chain = Some(chain);
        self.tap_index = 0;
        Ok(())
    }

    /// Select which TAP on the chain DAP register accesses address.
    pub fn set_tap_index(&mut self, index: usize) -> Result<()> {
        let chain = self.chain.as_ref().ok_or(Error::NoScanChain)?;
        if index >= chain.tap_count() {
            return Err(Error::InvalidTapIndex(index));
        }
        log::debug!("Selecting TAP {}", index);
        self.tap_index = index;
        Ok(())
    }

    pub fn set_clock(&self, freq: u32) -> Result<()> {
        log::debug!("Setting clock to {}Hz", freq);
        let request = Request {
            command: Command::DAP_SWJ_Clock, data: freq.to_le_bytes().to_vec()
        };
        let response = self.execute(request)?;
        match response.get(1) {
            Some(status) if *status == ResponseStatus::DAP_OK.into() => Ok(()),
            _ => Err(Error::Clock),
        }
    }

    pub fn set_host_status(&self, status: HostStatus) -> Result<()> {
        log::trace!("Setting host status {:?}", status);
        let (kind, on) = match status {
            HostStatus::Connect(on) => (HostStatusType::Connect, on),
            HostStatus::Running(on) => (HostStatusType::Running, on),
        };
        let request = Request {
            command: Command::DAP_HostStatus, data: vec![kind.into(), on as u8]
        };
        self.execute(request)?;
        Ok(())
    }

    /// Configure idle cycles after each transfer and the WAIT and
    /// value-match retry counts the probe applies internally.
    pub fn transfer_configure(&self, idle_cycles: u8, wait_retry: u16, match_retry: u16)
        -> Result<()>
    {
        log::debug!("Configuring transfers: idle {}, wait retry {}, match retry {}",
                    idle_cycles, wait_retry, match_retry);
        let mut data = vec![idle_cycles];
        data.extend_from_slice(&wait_retry.to_le_bytes());
        data.extend_from_slice(&match_retry.to_le_bytes());
        self.execute_checked(Request { command: Command::DAP_TransferConfigure, data })?;
        Ok(())
    }

    /// Write `value` to the DP ABORT register of the selected DAP.
    pub fn write_abort(&self, value: u32) -> Result<()> {
        log::debug!("Writing {:#010x} to ABORT", value);
        let mut data = vec![self.dap_index()];
        data.extend_from_slice(&value.to_le_bytes());
        self.execute_checked(Request { command: Command::DAP_WriteABORT, data })?;
        Ok(())
    }

    /// Drive the pins selected by `mask` to `out`, wait up to `wait_us`
    /// microseconds for them to settle, and return the pin input states.
    pub fn swj_pins(&self, mask: u8, out: u8, wait_us: u32) -> Result<u8> {
        log::trace!("Setting pins {:#04x} to {:#04x}", mask, out);
        let mut data = vec![out, mask];
        data.extend_from_slice(&wait_us.to_le_bytes());
        let response = self.execute(Request { command: Command::DAP_SWJ_Pins, data })?;
        response.get(1).copied().ok_or(Error::InvalidResponse)
    }

    /// Clock `bits` bits of `data` out on SWDIO/TMS.
    ///
    /// The tracked TAP state follows the TMS levels.
    pub fn swj_sequence(&self, bits: usize, data: &[u8]) -> Result<()> {
        if bits == 0 || bits > 256 || data.len() < bytes_for_bits(bits) {
            log::error!("Invalid SWJ sequence of {} bits from {} bytes", bits, data.len());
            return Err(Error::InvalidSequence(bits));
        }
        log::trace!("SWJ sequence of {} bits", bits);
        let mut request = vec![(bits % 256) as u8];
        request.extend_from_slice(&data[..bytes_for_bits(bits)]);
        self.execute_checked(Request { command: Command::DAP_SWJ_Sequence, data: request })?;
        let state = (0..bits).fold(self.tap_state(), |s, i| s.next(get_bit(data, i)));
        self.set_tap_state(state);
        Ok(())
    }

    pub fn reset(&self, kind: ResetKind) -> Result<()> {
        match (kind, self.mode) {
            (ResetKind::System, _) => {
                log::debug!("Pulsing nRESET");
                self.swj_pins(pins::NRESET, 0, 0)?;
                thread::sleep(Duration::from_millis(100));
                self.swj_pins(pins::NRESET, pins::NRESET, 0)?;
                // nRESET need not reach the TAP, so put it in a known state.
                if self.mode == Some(Mode::JTAG) {
                    self.tap_reset()?;
                }
            },
            (ResetKind::Debug, Some(Mode::JTAG)) => self.tap_reset()?,
            (ResetKind::Debug, Some(Mode::SWD)) => {
                log::debug!("Resetting SWD line");
                self.swj_sequence(55, &SWD_LINE_RESET)?;
            },
            (ResetKind::Debug, None) => return Err(Error::NoTransferMode),
        }
        Ok(())
    }

    /// Clock five TMS-high cycles, reaching Test-Logic-Reset from any state.
    fn tap_reset(&self) -> Result<()> {
        log::debug!("Resetting JTAG TAP");
        let request = Request {
            command: Command::DAP_JTAG_Sequence, data: vec![1, 0x45, 0x00]
        };
        self.execute_checked(request)?;
        self.set_tap_state(TapState::Reset);
        Ok(())
    }

    fn get_info(&self, id: DAPInfoID) -> Result<Vec<u8>> {
        let request = Request { command: Command::DAP_Info, data: vec![id.into()] };
        let response = self.execute(request)?;
        let len = *response.get(1).ok_or(Error::InvalidResponse)? as usize;
        response.get(2..2 + len).map(|d| d.to_vec()).ok_or(Error::InvalidResponse)
    }

    fn get_packet_size(&self) -> Result<usize> {
        log::debug!("Requesting maximum packet size");
        let info = self.get_info(DAPInfoID::MaxPacketSize)?;
        match info[..] {
            [a, b] => {
                let size = u16::from_le_bytes([a, b]) as usize;
                log::trace!("Got packet size {} bytes", size);
                // Room for at least one full 64-cycle JTAG descriptor.
                if size < 16 {
                    return Err(Error::InvalidResponse);
                }
                Ok(size)
            },
            _ => Err(Error::InvalidResponse),
        }
    }

    fn get_packet_count(&self) -> Result<usize> {
        log::debug!("Requesting maximum packet count");
        match self.get_info(DAPInfoID::MaxPacketCount)?[..] {
            [count] if count > 0 => Ok(count as usize),
            _ => Err(Error::InvalidResponse),
        }
    }

    fn get_capabilities(&self) -> Result<Capabilities> {
        log::debug!("Requesting probe capabilities");
        let info = self.get_info(DAPInfoID::Capabilities)?;
        if info.is_empty() || info.len() > 4 {
            return Err(Error::InvalidResponse);
        }
        let bits = info.iter().enumerate().fold(0u32, |acc, (i, &b)| acc | (b as u32) << (8 * i));
        Ok(Capabilities(bits))
    }

    fn get_firmware_version(&self) -> Result<Option<String>> {
        let info = self.get_info(DAPInfoID::FirmwareVersion)?;
        let end = info.iter().position(|&b| b == 0).unwrap_or(info.len());
        if end == 0 {
            Ok(None)
        } else {
            Ok(Some(String::from_utf8_lossy(&info[..end]).into_owned()))
        }
    }

    fn connect(&self, port: ConnectPort) -> Result<Mode> {
        log::debug!("Connecting to target with port {:?}", port);
        let request = Request { command: Command::DAP_Connect, data: vec![port.into()] };
        let response = self.execute(request)?;
        match response.get(1).map(|&p| Mode::try_from(p)) {
            Some(Ok(mode)) => Ok(mode),
            _ => Err(Error::Connection),
        }
    }

    fn disconnect(&self) -> Result<()> {
        log::debug!("Disconnecting from target");
        let request = Request { command: Command::DAP_Disconnect, data: vec![] };
        let response = self.execute(request)?;
        match response.get(1) {
            Some(status) if *status == ResponseStatus::DAP_OK.into() => Ok(()),
            _ => Err(Error::Connection),
        }
    }

    /// Send the SWJ sequence which moves the target's debug port into `mode`.
    fn switch_sequence(&self, mode: Mode) -> Result<()> {
        match mode {
            Mode::SWD => self.swj_sequence(136, &JTAG_TO_SWD),
            Mode::JTAG => self.swj_sequence(84, &SWD_TO_JTAG),
        }
    }

    /// Execute a request whose response carries a status byte which must be DAP_OK.
    fn execute_checked(&self, request: Request) -> Result<Vec<u8>> {
        let command = request.command;
        let response = self.execute(request)?;
        match response.get(1) {
            Some(status) if *status == ResponseStatus::DAP_OK.into() => Ok(response),
            _ => Err(Error::CommandFailed(command)),
        }
    }

    pub(crate) fn execute(&self, request: Request) -> Result<Vec<u8>> {
        self.submit(&request)?;
        self.collect(request.command)
    }

    /// Write one request packet without waiting for its response.
    pub(crate) fn submit(&self, request: &Request) -> Result<()> {
        let bytes = request.to_bytes();
        if bytes.len() > self.packet_size {
            log::error!("Attempted request of length {} which exceeds packet size {}",
                        bytes.len(), self.packet_size);
            return Err(Error::RequestTooLong { len: bytes.len(), packet_size: self.packet_size });
        }
        let written = self.transport.write(&bytes)?;
        if written < bytes.len() {
            return Err(ProbeError::ShortWrite { written, len: bytes.len() }.into());
        }
        Ok(())
    }

    /// Read one response packet, which must answer `command`.
    pub(crate) fn collect(&self, command: Command) -> Result<Vec<u8>> {
        let mut buf = vec![0u8; self.packet_size];
        let n = self.transport.read(&mut buf[..])?;
        buf.truncate(n);
        match buf.first() {
            Some(&id) if id == u8::from(command) => Ok(buf),
            Some(_) => Err(Error::InvalidResponse),
            None => Err(ProbeError::NoResponse.into()),
        }
    }
}

impl<T: Transport> std::ops::Drop for DAP<T> {
    fn drop(&mut self) {
        log::debug!("DAP dropped, disconnecting");
        self.disconnect().ok();
        self.set_host_status(HostStatus::Connect(false)).ok();
    }
}

/// 56 ones, the 16-bit JTAG-to-SWD select code 0xE79E, 56 ones, 8 zeros.
const JTAG_TO_SWD: [u8; 17] = [
    0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0x9E, 0xE7,
    0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0x00,
];

/// 56 ones, the 16-bit SWD-to-JTAG select code 0xE73C, 8 ones, 4 zeros.
const SWD_TO_JTAG: [u8; 11] = [
    0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0x3C, 0xE7, 0xFF, 0x00,
];

/// 50 ones followed by 5 zeros.
const SWD_LINE_RESET: [u8; 7] = [0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0x03];

#[derive(Copy, Clone, Debug, PartialEq, Eq, IntoPrimitive)]
#[allow(non_camel_case_types)]
#[repr(u8)]
pub enum Command {
    DAP_Info                = 0x00,
    DAP_HostStatus          = 0x01,
    DAP_Connect             = 0x02,
    DAP_Disconnect          = 0x03,
    DAP_TransferConfigure   = 0x04,
    DAP_Transfer            = 0x05,
    DAP_TransferBlock       = 0x06,
    DAP_WriteABORT          = 0x08,
    DAP_SWJ_Pins            = 0x10,
    DAP_SWJ_Clock           = 0x11,
    DAP_SWJ_Sequence        = 0x12,
    DAP_JTAG_Sequence       = 0x14,
    DAP_JTAG_Configure      = 0x15,
}

#[derive(Copy, Clone, IntoPrimitive)]
#[allow(non_camel_case_types)]
#[repr(u8)]
pub(crate) enum ResponseStatus {
    DAP_OK                  = 0x00,
}

#[derive(Copy, Clone, IntoPrimitive)]
#[repr(u8)]
enum DAPInfoID {
    FirmwareVersion         = 0x04,
    Capabilities            = 0xF0,
    MaxPacketCount          = 0xFE,
    MaxPacketSize           = 0xFF,
}

#[derive(Copy, Clone, IntoPrimitive)]
#[repr(u8)]
enum HostStatusType {
    Connect                 = 0,
    Running                 = 1,
}

#[derive(Copy, Clone, Debug, IntoPrimitive)]
#[repr(u8)]
enum ConnectPort {
    Default                 = 0,
    SWD                     = 1,
    JTAG                    = 2,
}

impl From<Mode> for ConnectPort {
    fn from(mode: Mode) -> Self {
        match mode {
            Mode::SWD => ConnectPort::SWD,
            Mode::JTAG => ConnectPort::JTAG,
        }
    }
}

pub(crate) struct Request {
    pub(crate) command: Command,
    pub(crate) data: Vec<u8>,
}

impl Request {
    fn to_bytes(&self) -> Vec<u8> {
        // Insert command ID as first byte.
        let mut bytes = vec![self.command.into()];
        bytes.extend_from_slice(&self.data[..]);
        bytes
    }
}

#[cfg(test)]
use crate::mock::MockProbe;

#[test]
fn test_session_init() {
    let probe = MockProbe::with_packet_size(512);
    let dap = DAP::new(probe.clone()).unwrap();
    assert_eq!(dap.packet_size(), 512);
    assert_eq!(probe.state().endpoint_size, 512);
    assert_eq!(dap.max_packet_count(), 4);
    assert_eq!(dap.version(), Some("2.1.0"));
    assert_eq!(dap.capabilities().bits(), 0b11);
    assert_eq!(dap.mode(), Some(Mode::JTAG));
    assert_eq!(dap.skills(), &[Skill::Jtag, Skill::Dap]);
    // The SWD-to-JTAG switch sequence ends with four TMS-low clocks.
    assert_eq!(dap.tap_state(), TapState::Idle);
    assert_eq!(probe.state().tap, TapState::Idle);
}

#[test]
fn test_small_packet_size_rejected() {
    let probe = MockProbe::with_packet_size(8);
    assert!(matches!(DAP::new(probe), Err(Error::InvalidResponse)));
}

#[test]
fn test_swd_only_probe() {
    let probe = MockProbe::new();
    probe.state().capabilities = 0b01;
    let mut dap = DAP::new(probe.clone()).unwrap();
    assert_eq!(dap.mode(), Some(Mode::SWD));
    assert_eq!(dap.skills(), &[Skill::Dap]);
    assert!(matches!(dap.jtag(), Err(Error::Unsupported("JTAG"))));
    assert!(dap.registers().is_ok());
    assert!(matches!(dap.set_transfer_mode(Mode::JTAG), Err(Error::Unsupported("JTAG"))));
}

#[test]
fn test_set_transfer_mode() {
    let probe = MockProbe::new();
    let mut dap = DAP::new(probe.clone()).unwrap();
    probe.clear_traffic();
    dap.set_transfer_mode(Mode::SWD).unwrap();
    assert_eq!(dap.mode(), Some(Mode::SWD));
    let s = probe.state();
    let commands: Vec<u8> = s.packets.iter().map(|p| p[0]).collect();
    assert_eq!(commands, vec![0x03, 0x02, 0x12]);
    assert_eq!(s.packets[1], vec![0x02, 0x01]);
    assert_eq!(s.packets[2][1], 136);
}

#[test]
fn test_configure_jtag_and_tap_index() {
    let probe = MockProbe::new();
    let mut dap = DAP::new(probe.clone()).unwrap();
    assert!(matches!(dap.set_tap_index(0), Err(Error::NoScanChain)));
    assert!(matches!(dap.registers(), Err(Error::NoScanChain)));

    dap.configure_jtag(&[4, 5, 8]).unwrap();
    assert_eq!(probe.state().ir_lengths, vec![4, 5, 8]);
    assert_eq!(dap.scan_chain().map(|c| c.tap_count()), Some(3));
    dap.set_tap_index(2).unwrap();
    assert_eq!(dap.tap_index(), 2);
    assert!(matches!(dap.set_tap_index(3), Err(Error::InvalidTapIndex(3))));

    // Reconfiguring selects the first TAP again.
    dap.configure_jtag(&[4]).unwrap();
    assert_eq!(dap.tap_index(), 0);
    assert!(matches!(dap.configure_jtag(&[]), Err(Error::Chain(_))));
    assert_eq!(dap.scan_chain().map(|c| c.tap_count()), Some(1));
}

#[test]
fn test_write_abort_and_pins() {
    let probe = MockProbe::new();
    let dap = DAP::new(probe.clone()).unwrap();
    dap.write_abort(0x1E).unwrap();
    assert_eq!(probe.state().abort, Some(0x1E));
    assert_eq!(dap.swj_pins(pins::NRESET, 0, 0).unwrap(), 0x7F);
    assert_eq!(dap.swj_pins(pins::NRESET, pins::NRESET, 0).unwrap(), 0xFF);

    probe.clear_traffic();
    dap.reset(ResetKind::System).unwrap();
    assert_eq!(dap.tap_state(), TapState::Reset);
    let s = probe.state();
    assert_eq!(s.packets.len(), 3);
    assert_eq!(&s.packets[0][..3], &[0x10, 0x00, pins::NRESET]);
    assert_eq!(s.packets[2], vec![0x14, 1, 0x45, 0x00]);
    assert_eq!(s.pins, 0xFF);
    assert_eq!(s.tap, TapState::Reset);
}

#[test]
fn test_system_reset_in_swd_mode() {
    let probe = MockProbe::new();
    probe.state().capabilities = 0b01;
    let dap = DAP::new(probe.clone()).unwrap();
    let before = dap.tap_state();
    probe.clear_traffic();
    dap.reset(ResetKind::System).unwrap();
    let commands: Vec<u8> = probe.state().packets.iter().map(|p| p[0]).collect();
    assert_eq!(commands, vec![0x10, 0x10]);
    assert_eq!(dap.tap_state(), before);
}

#[test]
fn test_debug_reset() {
    let probe = MockProbe::new();
    let dap = DAP::new(probe.clone()).unwrap();
    dap.reset(ResetKind::Debug).unwrap();
    assert_eq!(dap.tap_state(), TapState::Reset);
    assert_eq!(probe.state().tap, TapState::Reset);
    assert_eq!(probe.state().packets.last(), Some(&vec![0x14, 1, 0x45, 0x00]));
}

#[test]
fn test_swd_line_reset() {
    let probe = MockProbe::new();
    probe.state().capabilities = 0b01;
    let dap = DAP::new(probe.clone()).unwrap();
    probe.clear_traffic();
    dap.reset(ResetKind::Debug).unwrap();
    let s = probe.state();
    assert_eq!(s.packets.len(), 1);
    assert_eq!(&s.packets[0][..2], &[0x12, 55]);
}

#[test]
fn test_swj_sequence_checks() {
    let probe = MockProbe::new();
    let dap = DAP::new(probe.clone()).unwrap();
    probe.clear_traffic();
    assert!(matches!(dap.swj_sequence(0, &[]), Err(Error::InvalidSequence(0))));
    assert!(matches!(dap.swj_sequence(257, &[0; 33]), Err(Error::InvalidSequence(257))));
    assert!(matches!(dap.swj_sequence(9, &[0xFF]), Err(Error::InvalidSequence(9))));
    assert_eq!(probe.state().writes, 0);

    // Five TMS-high clocks reach Test-Logic-Reset from anywhere.
    dap.swj_sequence(5, &[0x1F]).unwrap();
    assert_eq!(dap.tap_state(), TapState::Reset);
    dap.swj_sequence(256, &[0; 32]).unwrap();
    assert_eq!(dap.tap_state(), TapState::Idle);
    assert_eq!(probe.state().packets[1][1], 0);
}
