//! Scan-chain geometry for multi-TAP JTAG chains.
//!
//! TAP index 0 is the TAP closest to TDO, so its bits are shifted out first
//! and the bits shifted in first end up in it.

use thiserror::Error;
use crate::bitvec::{append_word, bits_to_bytes, bytes_for_bits, copy_bits, extract_bits};

#[derive(Error, Debug)]
pub enum Error {
    #[error("Scan chain must contain at least one TAP.")]
    Empty,
    #[error("Scan chain of {0} TAPs exceeds the maximum of 8.")]
    TooManyTaps(usize),
    #[error("IR length {0} is not in 1..=64.")]
    InvalidIrLength(u8),
    #[error("TAP index {0} is outside the scan chain.")]
    InvalidTapIndex(usize),
    #[error("Bit error")]
    Bits(#[from] crate::bitvec::Error),
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

/// IR lengths of every TAP on the chain.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ScanChain {
    ir_lengths: Vec<u8>,
}

impl ScanChain {
    /// Largest chain DAP_JTAG_Configure accepts.
    pub const MAX_TAPS: usize = 8;

    pub fn new(ir_lengths: &[u8]) -> Result<Self> {
        if ir_lengths.is_empty() {
            return Err(Error::Empty);
        }
        if ir_lengths.len() > Self::MAX_TAPS {
            return Err(Error::TooManyTaps(ir_lengths.len()));
        }
        if let Some(&len) = ir_lengths.iter().find(|&&l| l == 0 || l > 64) {
            return Err(Error::InvalidIrLength(len));
        }
        Ok(ScanChain { ir_lengths: ir_lengths.to_vec() })
    }

    pub fn tap_count(&self) -> usize {
        self.ir_lengths.len()
    }

    pub fn ir_lengths(&self) -> &[u8] {
        &self.ir_lengths
    }

    pub fn ir_length(&self, index: usize) -> Result<usize> {
        self.ir_lengths.get(index).map(|&l| l as usize).ok_or(Error::InvalidTapIndex(index))
    }

    /// Total IR bits of the TAPs between TDO and `index`.
    pub fn ir_before(&self, index: usize) -> Result<usize> {
        self.check_index(index)?;
        Ok(self.ir_lengths[..index].iter().map(|&l| l as usize).sum())
    }

    /// Total IR bits of the TAPs between `index` and TDI.
    pub fn ir_after(&self, index: usize) -> Result<usize> {
        self.check_index(index)?;
        Ok(self.ir_lengths[index + 1..].iter().map(|&l| l as usize).sum())
    }

    pub fn ir_total(&self) -> usize {
        self.ir_lengths.iter().map(|&l| l as usize).sum()
    }

    /// Number of bypass bits `(before, after)` surrounding TAP `index` in
    /// a DR scan with every other TAP in BYPASS.
    pub fn dr_bypass(&self, index: usize) -> Result<(usize, usize)> {
        self.check_index(index)?;
        Ok((index, self.tap_count() - index - 1))
    }

    /// Build the full-chain IR scan which loads `ir` into TAP `index` and
    /// BYPASS (all ones) into every other TAP.
    ///
    /// Returns the packed buffer and its length in bits.
    pub fn padded_ir(&self, index: usize, ir: u64) -> Result<(Vec<u8>, usize)> {
        self.check_index(index)?;
        let mut bits = Vec::with_capacity(self.ir_total());
        for (i, &len) in self.ir_lengths.iter().enumerate() {
            let word = if i == index { ir } else { u64::MAX };
            append_word(&mut bits, word, len as usize);
        }
        let n = bits.len();
        Ok((bits_to_bytes(&bits), n))
    }

    /// Surround `bits` bits of `data` with bypass bits for TAP `index`.
    ///
    /// Returns the packed buffer and its length in bits.
    pub fn padded_dr(&self, index: usize, data: &[u8], bits: usize) -> Result<(Vec<u8>, usize)> {
        let (before, after) = self.dr_bypass(index)?;
        let total = before + bits + after;
        let mut out = vec![0u8; bytes_for_bits(total)];
        copy_bits(data, 0, &mut out, before, bits)?;
        Ok((out, total))
    }

    /// Extract the `bits` bits belonging to TAP `index` from a DR scan
    /// padded by [`padded_dr`](Self::padded_dr).
    pub fn unpad_dr(&self, index: usize, padded: &[u8], bits: usize) -> Result<Vec<u8>> {
        let (before, _) = self.dr_bypass(index)?;
        Ok(extract_bits(padded, before, bits)?)
    }

    fn check_index(&self, index: usize) -> Result<()> {
        if index < self.tap_count() {
            Ok(())
        } else {
            Err(Error::InvalidTapIndex(index))
        }
    }
}

#[test]
fn test_chain_validation() {
    assert!(matches!(ScanChain::new(&[]), Err(Error::Empty)));
    assert!(matches!(ScanChain::new(&[4; 9]), Err(Error::TooManyTaps(9))));
    assert!(matches!(ScanChain::new(&[4, 0]), Err(Error::InvalidIrLength(0))));
    assert!(ScanChain::new(&[4; 8]).is_ok());
}

#[test]
fn test_ir_offsets() {
    let chain = ScanChain::new(&[4, 5, 8]).unwrap();
    assert_eq!(chain.tap_count(), 3);
    assert_eq!(chain.ir_total(), 17);
    assert_eq!(chain.ir_before(0).unwrap(), 0);
    assert_eq!(chain.ir_after(0).unwrap(), 13);
    assert_eq!(chain.ir_before(1).unwrap(), 4);
    assert_eq!(chain.ir_after(1).unwrap(), 8);
    assert_eq!(chain.ir_before(2).unwrap(), 9);
    assert_eq!(chain.ir_after(2).unwrap(), 0);
    assert!(chain.ir_before(3).is_err());
    assert_eq!(chain.dr_bypass(0).unwrap(), (0, 2));
    assert_eq!(chain.dr_bypass(2).unwrap(), (2, 0));
}

#[test]
fn test_padded_ir() {
    let chain = ScanChain::new(&[4, 5, 8]).unwrap();
    let (bytes, bits) = chain.padded_ir(1, 0b00010).unwrap();
    assert_eq!(bits, 17);
    // 1111 | 01000 | 11111111, first-shifted bit first.
    assert_eq!(bytes, bits_to_bytes(bv![1, 1, 1, 1,  0, 1, 0, 0, 0,  1, 1, 1, 1, 1, 1, 1, 1]));
    assert_eq!(bytes, vec![0x2F, 0xFE, 0x01]);
}

#[test]
fn test_padded_dr_round_trip() {
    let chain = ScanChain::new(&[4, 4, 4]).unwrap();
    let (padded, bits) = chain.padded_dr(1, &[0xA5, 0x03], 10).unwrap();
    assert_eq!(bits, 12);
    assert_eq!(padded, vec![0x4A, 0x07]);
    assert_eq!(chain.unpad_dr(1, &padded, 10).unwrap(), vec![0xA5, 0x03]);
}
