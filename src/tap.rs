//! The TAP module models the IEEE 1149.1 TAP controller state machine.
//!
//! It produces the TMS bit sequences needed to walk between any two states,
//! counts how many sequence descriptors such a walk costs on the wire, and
//! replays single TMS bits to track the state through raw pin sequences.
//! Everything here is pure and allocation-free.

/// One of the sixteen TAP controller states.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum TapState {
    Reset = 0,
    Idle = 1,
    DrSelect = 2,
    DrCapture = 3,
    DrShift = 4,
    DrExit1 = 5,
    DrPause = 6,
    DrExit2 = 7,
    DrUpdate = 8,
    IrSelect = 9,
    IrCapture = 10,
    IrShift = 11,
    IrExit1 = 12,
    IrPause = 13,
    IrExit2 = 14,
    IrUpdate = 15,
}

impl TapState {
    /// Every state, in encoding order.
    pub const ALL: [TapState; 16] = [
        TapState::Reset, TapState::Idle,
        TapState::DrSelect, TapState::DrCapture, TapState::DrShift, TapState::DrExit1,
        TapState::DrPause, TapState::DrExit2, TapState::DrUpdate,
        TapState::IrSelect, TapState::IrCapture, TapState::IrShift, TapState::IrExit1,
        TapState::IrPause, TapState::IrExit2, TapState::IrUpdate,
    ];

    /// True for the seven states on the data register path.
    pub fn is_dr(self) -> bool {
        (TapState::DrSelect as u8..=TapState::DrUpdate as u8).contains(&(self as u8))
    }

    /// True for the seven states on the instruction register path.
    pub fn is_ir(self) -> bool {
        (TapState::IrSelect as u8..=TapState::IrUpdate as u8).contains(&(self as u8))
    }

    /// True for Shift-DR and Shift-IR, the only states where data may be exchanged.
    pub fn is_shift(self) -> bool {
        matches!(self, TapState::DrShift | TapState::IrShift)
    }

    /// State reached after one TCK with TMS at `tms`.
    pub fn next(self, tms: bool) -> TapState {
        use TapState::*;
        match (self, tms) {
            (Reset, false) => Idle,
            (Reset, true) => Reset,
            (Idle, false) => Idle,
            (Idle, true) => DrSelect,

            (DrSelect, false) => DrCapture,
            (DrSelect, true) => IrSelect,
            (DrCapture, false) => DrShift,
            (DrCapture, true) => DrExit1,
            (DrShift, false) => DrShift,
            (DrShift, true) => DrExit1,
            (DrExit1, false) => DrPause,
            (DrExit1, true) => DrUpdate,
            (DrPause, false) => DrPause,
            (DrPause, true) => DrExit2,
            (DrExit2, false) => DrShift,
            (DrExit2, true) => DrUpdate,
            (DrUpdate, false) => Idle,
            (DrUpdate, true) => DrSelect,

            (IrSelect, false) => IrCapture,
            (IrSelect, true) => Reset,
            (IrCapture, false) => IrShift,
            (IrCapture, true) => IrExit1,
            (IrShift, false) => IrShift,
            (IrShift, true) => IrExit1,
            (IrExit1, false) => IrPause,
            (IrExit1, true) => IrUpdate,
            (IrPause, false) => IrPause,
            (IrPause, true) => IrExit2,
            (IrExit2, false) => IrShift,
            (IrExit2, true) => IrUpdate,
            (IrUpdate, false) => Idle,
            (IrUpdate, true) => DrSelect,
        }
    }

    /// TMS value for the next step from `self` towards `to`.
    ///
    /// A walk never passes through a Shift state it does not end in, and
    /// resuming a shift from Exit1 goes through Pause rather than Update.
    fn tms_towards(self, to: TapState) -> bool {
        use TapState::*;
        match self {
            Reset => false,
            Idle => true,
            DrSelect => !to.is_dr(),
            IrSelect => !to.is_ir(),
            DrCapture => to != DrShift,
            IrCapture => to != IrShift,
            DrShift | IrShift | DrPause | IrPause => true,
            DrExit1 => !matches!(to, DrPause | DrExit2 | DrShift),
            IrExit1 => !matches!(to, IrPause | IrExit2 | IrShift),
            DrExit2 => to != DrShift,
            IrExit2 => to != IrShift,
            DrUpdate | IrUpdate => to != Idle,
        }
    }

    /// Human readable name, as used in IEEE 1149.1.
    pub fn name(&self) -> &'static str {
        match self {
            TapState::Reset => "Test-Logic-Reset",
            TapState::Idle => "Run-Test/Idle",
            TapState::DrSelect => "Select-DR-Scan",
            TapState::DrCapture => "Capture-DR",
            TapState::DrShift => "Shift-DR",
            TapState::DrExit1 => "Exit1-DR",
            TapState::DrPause => "Pause-DR",
            TapState::DrExit2 => "Exit2-DR",
            TapState::DrUpdate => "Update-DR",
            TapState::IrSelect => "Select-IR-Scan",
            TapState::IrCapture => "Capture-IR",
            TapState::IrShift => "Shift-IR",
            TapState::IrExit1 => "Exit1-IR",
            TapState::IrPause => "Pause-IR",
            TapState::IrExit2 => "Exit2-IR",
            TapState::IrUpdate => "Update-IR",
        }
    }
}

impl std::fmt::Display for TapState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// A TMS bit pattern for one state-to-state walk.
///
/// Bit 0 of `bits` is clocked out first. No walk is longer than 8 bits.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct TmsSequence {
    bits: u8,
    len: u8,
}

impl TmsSequence {
    /// Build the TMS sequence which moves the TAP from `from` to `to`.
    ///
    /// Returns an empty sequence when the states are equal.
    pub fn between(mut from: TapState, to: TapState) -> Self {
        let mut seq = TmsSequence::default();
        while from != to {
            let tms = from.tms_towards(to);
            seq.bits |= (tms as u8) << seq.len;
            seq.len += 1;
            from = from.next(tms);
        }
        seq
    }

    pub fn bits(&self) -> u8 {
        self.bits
    }

    pub fn len(&self) -> usize {
        self.len as usize
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Number of constant-TMS runs in this sequence, see [`level_count`].
    pub fn level_count(&self) -> usize {
        level_count(self.bits as u32, self.len())
    }

    /// Iterate over TMS bits in transmission order.
    pub fn iter(&self) -> impl Iterator<Item = bool> + '_ {
        (0..self.len).map(move |i| (self.bits >> i) & 1 == 1)
    }

    /// Iterate over runs of constant TMS as `(tms, length)` pairs.
    ///
    /// Each run becomes one sequence descriptor on the wire.
    pub fn runs(&self) -> Runs {
        Runs { seq: *self, pos: 0 }
    }
}

/// Iterator over the constant-TMS runs of a [`TmsSequence`].
pub struct Runs {
    seq: TmsSequence,
    pos: u8,
}

impl Iterator for Runs {
    type Item = (bool, usize);

    fn next(&mut self) -> Option<Self::Item> {
        if self.pos >= self.seq.len {
            return None;
        }
        let tms = (self.seq.bits >> self.pos) & 1;
        let start = self.pos;
        while self.pos < self.seq.len && (self.seq.bits >> self.pos) & 1 == tms {
            self.pos += 1;
        }
        Some((tms == 1, (self.pos - start) as usize))
    }
}

/// Count the constant-level runs in the first `count` bits of `tms`.
///
/// For example `0b1001110` with `count = 7` has four runs: one low, three
/// high, two low, one high. Zero bits have zero runs.
pub fn level_count(tms: u32, count: usize) -> usize {
    if count == 0 {
        return 0;
    }
    let shifted = (tms << 1) | (tms & 1);
    let diff = shifted ^ tms;
    let mask = if count >= 32 { u32::MAX } else { (1 << count) - 1 };
    (diff & mask).count_ones() as usize + 1
}

#[cfg(test)]
use test_case::test_case;

#[cfg(test)]
#[test_case(TapState::Reset, TapState::Idle, 0b0, 1 ; "reset to idle")]
#[test_case(TapState::Idle, TapState::DrShift, 0b001, 3 ; "idle to shift dr")]
#[test_case(TapState::Reset, TapState::IrShift, 0b00110, 5 ; "reset to shift ir")]
#[test_case(TapState::DrShift, TapState::Idle, 0b011, 3 ; "shift dr to idle")]
#[test_case(TapState::DrExit1, TapState::DrShift, 0b010, 3 ; "exit1 dr resumes shift via pause")]
#[test_case(TapState::IrExit2, TapState::IrShift, 0b0, 1 ; "exit2 ir to shift ir")]
#[test_case(TapState::Idle, TapState::Reset, 0b111, 3 ; "idle to reset")]
#[test_case(TapState::DrPause, TapState::IrExit2, 0b1010_1111, 8 ; "longest walk")]
#[test_case(TapState::IrUpdate, TapState::IrUpdate, 0, 0 ; "no move")]
fn test_sequence_between(from: TapState, to: TapState, bits: u8, len: usize) {
    let seq = TmsSequence::between(from, to);
    assert_eq!(seq.bits(), bits);
    assert_eq!(seq.len(), len);
}

#[test]
fn test_sequence_between_all_pairs() {
    for &from in TapState::ALL.iter() {
        for &to in TapState::ALL.iter() {
            let seq = TmsSequence::between(from, to);
            assert!(seq.len() <= 8, "{} -> {} needs {} bits", from, to, seq.len());
            let end = seq.iter().fold(from, |state, tms| state.next(tms));
            assert_eq!(end, to, "walk from {} landed on {}", from, end);
        }
    }
}

#[test]
fn test_walk_never_passes_through_other_shift() {
    for &from in TapState::ALL.iter() {
        for &to in TapState::ALL.iter() {
            let seq = TmsSequence::between(from, to);
            let mut state = from;
            let mut visited = Vec::new();
            for tms in seq.iter() {
                state = state.next(tms);
                visited.push(state);
            }
            visited.pop();
            assert!(visited.iter().all(|s| !s.is_shift()),
                    "{} -> {} passes through a shift state: {:?}", from, to, visited);
        }
    }
}

#[test]
fn test_level_count() {
    assert_eq!(level_count(0b1001110, 7), 4);
    assert_eq!(level_count(0, 0), 0);
    assert_eq!(level_count(0b1, 1), 1);
    assert_eq!(level_count(0b11111, 5), 1);
    assert_eq!(level_count(0b01010, 5), 5);
    // Bits above `count` are ignored.
    assert_eq!(level_count(0b1111_0000, 4), 1);
}

#[test]
fn test_runs_match_level_count() {
    for &from in TapState::ALL.iter() {
        for &to in TapState::ALL.iter() {
            let seq = TmsSequence::between(from, to);
            let runs: Vec<(bool, usize)> = seq.runs().collect();
            assert_eq!(runs.len(), seq.level_count());
            assert_eq!(runs.iter().map(|r| r.1).sum::<usize>(), seq.len());
        }
    }
    let seq = TmsSequence::between(TapState::Reset, TapState::IrShift);
    assert_eq!(seq.runs().collect::<Vec<_>>(), vec![(false, 1), (true, 2), (false, 2)]);
}

#[test]
fn test_next_state_table() {
    assert_eq!(TapState::Reset.next(true), TapState::Reset);
    assert_eq!(TapState::IrSelect.next(true), TapState::Reset);
    assert_eq!(TapState::DrExit2.next(false), TapState::DrShift);
    assert_eq!(TapState::IrUpdate.next(true), TapState::DrSelect);
    // Five TMS-high clocks reach Reset from anywhere.
    for &state in TapState::ALL.iter() {
        let end = (0..5).fold(state, |s, _| s.next(true));
        assert_eq!(end, TapState::Reset);
    }
}
