//! Bit- and byte-level copies between target memory, registers, and host
//! integers.
//!
//! Target values rarely line up with host integers: registers can be wider
//! than the value they hold, bit fields start at arbitrary bit offsets, and
//! the target byte order need not match the host. The helpers in this module
//! define one vocabulary for those conversions that the rest of the
//! workspace builds on.
//!
//! Bit numbering follows the target byte order: with `lsb0` (little-endian
//! targets), bit `i` of a buffer is bit `i % 8` counted from the least
//! significant bit of byte `i / 8`; without it (big-endian targets), bit `i`
//! is counted from the most significant bit instead.

/// Returns the maximum value of an unsigned integer of `bytes` bytes.
///
/// `bytes` values of 8 or more saturate to `u64::MAX`.
#[inline]
pub fn uint_max(bytes: u8) -> u64 {
    if bytes >= 8 {
        u64::MAX
    } else {
        (1u64 << (8 * u32::from(bytes))) - 1
    }
}

/// Reinterprets the low `bits` bits of `value` as a signed integer.
///
/// # Panics
///
/// Panics if `bits` is zero or greater than 64.
#[inline]
pub fn truncate_signed(value: u64, bits: u32) -> i64 {
    assert!(bits >= 1 && bits <= 64);
    let shift = 64 - bits;
    ((value << shift) as i64) >> shift
}

/// Copies the least significant bytes of `src` into `dst`.
///
/// `min(dst.len(), src.len())` bytes are copied; if `dst` is larger than
/// `src`, its remaining most significant bytes are zeroed. Each buffer's
/// byte order determines where its least significant bytes live.
pub fn copy_lsbytes(dst: &mut [u8], dst_little_endian: bool, src: &[u8], src_little_endian: bool) {
    let n = dst.len().min(src.len());
    let src_lsb = if src_little_endian {
        &src[..n]
    } else {
        &src[src.len() - n..]
    };
    if dst_little_endian {
        dst[..n].copy_from_slice(src_lsb);
        if !src_little_endian {
            dst[..n].reverse();
        }
        dst[n..].fill(0);
    } else {
        let start = dst.len() - n;
        dst[start..].copy_from_slice(src_lsb);
        if src_little_endian {
            dst[start..].reverse();
        }
        dst[..start].fill(0);
    }
}

#[inline]
fn get_bit(buf: &[u8], i: u64, lsb0: bool) -> bool {
    let byte = buf[(i / 8) as usize];
    let bit = (i % 8) as u32;
    if lsb0 {
        byte & (1 << bit) != 0
    } else {
        byte & (0x80 >> bit) != 0
    }
}

#[inline]
fn set_bit(buf: &mut [u8], i: u64, lsb0: bool, value: bool) {
    let byte = &mut buf[(i / 8) as usize];
    let mask = if lsb0 {
        1 << ((i % 8) as u32)
    } else {
        0x80 >> ((i % 8) as u32)
    };
    if value {
        *byte |= mask;
    } else {
        *byte &= !mask;
    }
}

/// Copies `bit_size` bits from `src` starting at `src_bit_offset` into `dst`
/// starting at `dst_bit_offset`.
///
/// Bits of `dst` outside the destination range are preserved. `lsb0` selects
/// the bit numbering (see the module documentation).
pub fn copy_bits(
    dst: &mut [u8],
    dst_bit_offset: u64,
    src: &[u8],
    src_bit_offset: u64,
    bit_size: u64,
    lsb0: bool,
) {
    for i in 0..bit_size {
        let bit = get_bit(src, src_bit_offset + i, lsb0);
        set_bit(dst, dst_bit_offset + i, lsb0, bit);
    }
}
