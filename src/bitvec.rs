//! This module contains convenience functions for bit-level access to packed
//! byte buffers and to Vec<bool>.
//!
//! All packed buffers are least-significant-bit first: bit `i` lives in
//! byte `i / 8` at position `i % 8`, matching the order bits are clocked
//! through TDI and TDO.

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("Not enough bits to extract required data.")]
    NotEnoughBits,
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

/// Number of bytes needed to hold `bits` bits.
pub fn bytes_for_bits(bits: usize) -> usize {
    (bits + 7) / 8
}

/// Read bit `idx` from a packed buffer.
pub fn get_bit(bytes: &[u8], idx: usize) -> bool {
    (bytes[idx / 8] >> (idx % 8)) & 1 == 1
}

/// Write bit `idx` of a packed buffer, leaving all other bits untouched.
pub fn set_bit(bytes: &mut [u8], idx: usize, bit: bool) {
    let mask = 1 << (idx % 8);
    if bit {
        bytes[idx / 8] |= mask;
    } else {
        bytes[idx / 8] &= !mask;
    }
}

/// Copy `n` bits from `src` starting at bit `src_offset` into `dst`
/// starting at bit `dst_offset`.
///
/// Only the `n` destination bits are written; neighbouring bits in `dst`
/// keep their previous values. Returns an error if either range runs past
/// the end of its buffer.
pub fn copy_bits(src: &[u8], src_offset: usize, dst: &mut [u8], dst_offset: usize, n: usize)
    -> Result<()>
{
    if src_offset + n > src.len() * 8 || dst_offset + n > dst.len() * 8 {
        return Err(Error::NotEnoughBits);
    }

    // Byte-aligned fast path for the bulk of long transfers.
    if src_offset % 8 == 0 && dst_offset % 8 == 0 {
        let whole = n / 8;
        let (s, d) = (src_offset / 8, dst_offset / 8);
        dst[d..d + whole].copy_from_slice(&src[s..s + whole]);
        for i in whole * 8..n {
            set_bit(dst, dst_offset + i, get_bit(src, src_offset + i));
        }
        return Ok(());
    }

    for i in 0..n {
        set_bit(dst, dst_offset + i, get_bit(src, src_offset + i));
    }
    Ok(())
}

/// Extract `n` bits starting at bit `offset` into a new packed buffer.
///
/// Unused high-order bits of the final byte are 0.
pub fn extract_bits(src: &[u8], offset: usize, n: usize) -> Result<Vec<u8>> {
    let mut out = vec![0u8; bytes_for_bits(n)];
    copy_bits(src, offset, &mut out, 0, n)?;
    Ok(out)
}

/// Convert a slice of bits to a Vec of u8s, least-significant-bit first.
///
/// If `bits` is not a multiple of 8, the final byte has the higher-order
/// bits set to 0.
pub fn bits_to_bytes(bits: &[bool]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(bytes_for_bits(bits.len()));
    for chunk in bits.chunks(8) {
        let mut byte = 0u8;
        for (idx, bit) in chunk.iter().enumerate() {
            byte |= (*bit as u8) << idx;
        }
        bytes.push(byte);
    }
    bytes
}

/// Convert a slice of u8 to a Vec of bool, least-significant-bit first.
/// Reads exactly `n` bits; returns an error if n>bytes.len()*8.
#[cfg(test)]
pub fn bytes_to_bits(bytes: &[u8], n: usize) -> Result<Vec<bool>> {
    if n > bytes.len() * 8 {
        return Err(Error::NotEnoughBits);
    }
    Ok((0..n).map(|i| get_bit(bytes, i)).collect())
}

/// Read `n` bits (at most 64) starting at bit `offset` as a word.
pub fn read_word(bytes: &[u8], offset: usize, n: usize) -> Result<u64> {
    if n > 64 || offset + n > bytes.len() * 8 {
        return Err(Error::NotEnoughBits);
    }
    Ok((0..n).fold(0u64, |word, i| word | ((get_bit(bytes, offset + i) as u64) << i)))
}

/// Append n bits from a u64 to a Vec<bool>, least significant bit first.
pub fn append_word(bits: &mut Vec<bool>, word: u64, n: usize) {
    for idx in 0..n {
        let bit = ((word >> idx) & 1) == 1;
        bits.push(bit);
    }
}

/// Convenience macro for creating a &[bool] from &[u8] of 0/1.
#[cfg(test)]
macro_rules! bv {
    ($($x:expr),*) => {
        &[ $(($x != 0),)* ] as &[bool]
    }
}

#[test]
fn test_bits_to_bytes() {
    assert_eq!(bits_to_bytes(&[]),                                      vec![]);
    assert_eq!(bits_to_bytes(bv![1, 1, 1, 0]),                          vec![0x07]);
    assert_eq!(bits_to_bytes(bv![1, 1, 1, 0, 0, 1, 0, 0]),              vec![0x27]);
    assert_eq!(bits_to_bytes(bv![1, 1, 1, 0, 0, 1, 0, 0, 0, 0, 0, 1]),  vec![0x27, 0x08]);
}

#[test]
fn test_bytes_to_bits() {
    assert_eq!(bytes_to_bits(&[0xFF], 1).unwrap(), bv![1]);
    assert_eq!(bytes_to_bits(&[0xFF], 8).unwrap(), bv![1, 1, 1, 1, 1, 1, 1, 1]);
    assert_eq!(bytes_to_bits(&[0xFF, 0x01], 10).unwrap(), bv![1, 1, 1, 1, 1, 1, 1, 1, 1, 0]);
    assert!(bytes_to_bits(&[0xFF], 9).is_err());
}

#[test]
fn test_set_bit() {
    let mut bytes = [0x00, 0xFF];
    set_bit(&mut bytes, 3, true);
    set_bit(&mut bytes, 9, false);
    assert_eq!(bytes, [0x08, 0xFD]);
    assert!(get_bit(&bytes, 3));
    assert!(!get_bit(&bytes, 9));
}

#[test]
fn test_copy_bits_preserves_neighbours() {
    // Overwrite exactly 10 bits; bits 10..16 of the destination survive.
    let mut dst = [0xFF, 0xFF];
    copy_bits(&[0x00, 0x00], 0, &mut dst, 0, 10).unwrap();
    assert_eq!(dst, [0x00, 0xFC]);

    let mut dst = [0x00, 0x00];
    copy_bits(&[0b1011_0110], 1, &mut dst, 5, 6).unwrap();
    // Bits 1..7 of the source are 1,1,0,1,1,0 which land at 5..11.
    assert_eq!(dst, [0b0110_0000, 0b0000_0011]);
}

#[test]
fn test_copy_bits_bounds() {
    let mut dst = [0u8; 1];
    assert!(copy_bits(&[0u8; 2], 0, &mut dst, 0, 9).is_err());
    assert!(copy_bits(&[0u8; 1], 4, &mut [0u8; 2], 0, 5).is_err());
    assert!(copy_bits(&[], 0, &mut [], 0, 0).is_ok());
}

#[test]
fn test_extract_bits() {
    assert_eq!(extract_bits(&[0xA5, 0x3C], 4, 8).unwrap(), vec![0xCA]);
    assert_eq!(extract_bits(&[0xFF, 0xFF], 3, 11).unwrap(), vec![0xFF, 0x07]);
    assert!(extract_bits(&[0xFF], 3, 6).is_err());
}

#[test]
fn test_read_word() {
    assert_eq!(read_word(&[0x78, 0x56, 0x34, 0x12], 0, 32).unwrap(), 0x12345678);
    assert_eq!(read_word(&[0x78, 0x56], 4, 8).unwrap(), 0x67);
    assert!(read_word(&[0u8; 9], 0, 65).is_err());
}

#[test]
fn test_append_word() {
    let mut bits = bv![1, 1, 1, 1].to_vec();
    append_word(&mut bits, 0b1101, 4);
    assert_eq!(&bits[..], bv![1, 1, 1, 1, 1, 0, 1, 1]);
}
