// This module holds the pure bit-level immediate encoders of the AArch64 back end.
// Floating-point immediates use the 8-bit "aBbbbbbc defgh" form that fmov accepts:
// a value qualifies when its low mantissa bits are clear, one run of exponent bits is
// uniform and the two exponent bits next to it are complementary. Logical
// immediates use the bitmask form (N, immr, imms) shared by and, orr, eor and tst:
// a rotated run of ones inside an element of 2, 4, 8, 16, 32 or 64 bits, replicated
// across the register. The encoder follows the classic run-length test with
// half-width recursion; the decoder is its exact inverse and is kept alongside it so
// that every encoding can be checked by reconstruction. Shift and extend operand
// descriptors are packed into one small integer, with bit 6 telling the two apart.
// Nothing here allocates or logs.

//! Immediate and operand-descriptor encodings.

/// Shift applied to the last register operand of a data-processing instruction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShiftType {
    Lsl = 0,
    Lsr = 1,
    Asr = 2,
    Ror = 3,
}

/// Extension applied to an index or last register operand.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExtendType {
    Uxtb = 0,
    Uxth = 1,
    Uxtw = 2,
    Uxtx = 3,
    Sxtb = 4,
    Sxth = 5,
    Sxtw = 6,
    Sxtx = 7,
}

/// `lsl #0`, the descriptor meaning "no shift".
pub const ENCODE_NO_SHIFT: u32 = 0;

pub fn encode_shift(shift: ShiftType, amount: u32) -> u32 {
    ((shift as u32 & 0x3) << 7) | (amount & 0x1f)
}

pub fn encode_extend(extend: ExtendType, amount: u32) -> u32 {
    (1 << 6) | ((extend as u32 & 0x7) << 3) | (amount & 0x7)
}

pub fn is_extend_encoding(encoded: u32) -> bool {
    encoded & (1 << 6) != 0
}

/// Whether `value` fits a signed 9-bit field.
pub fn fits_signed_imm9(value: i32) -> bool {
    (-256..=255).contains(&value)
}

/// 8-bit fmov immediate for a single-precision bit pattern.
///
/// Encodable values look like `aBbb.bbbc.defg.h000.0000.0000.0000.0000`
/// with `B = !b`.
pub fn encode_imm_single(bits: u32) -> Option<u8> {
    if bits & 0x0007_ffff != 0 {
        return None;
    }
    // bits[29..25] uniform
    let b_pattern = (bits >> 16) & 0x3e00;
    if b_pattern != 0 && b_pattern != 0x3e00 {
        return None;
    }
    // bit 30 == !bit 29
    if (bits ^ (bits << 1)) & 0x4000_0000 == 0 {
        return None;
    }
    let bit7 = ((bits >> 31) & 0x1) << 7;
    let bit6 = ((bits >> 29) & 0x1) << 6;
    let bit5_to_0 = (bits >> 19) & 0x3f;
    Some((bit7 | bit6 | bit5_to_0) as u8)
}

/// 8-bit fmov immediate for a double-precision bit pattern.
pub fn encode_imm_double(bits: u64) -> Option<u8> {
    if bits & 0xffff_ffff_ffff != 0 {
        return None;
    }
    // bits[61..54] uniform
    let b_pattern = (bits >> 48) & 0x3fc0;
    if b_pattern != 0 && b_pattern != 0x3fc0 {
        return None;
    }
    // bit 62 == !bit 61
    if (bits ^ (bits << 1)) & 0x4000_0000_0000_0000 == 0 {
        return None;
    }
    let bit7 = ((bits >> 63) & 0x1) << 7;
    let bit6 = ((bits >> 61) & 0x1) << 6;
    let bit5_to_0 = (bits >> 48) & 0x3f;
    Some((bit7 | bit6 | bit5_to_0) as u8)
}

/// Expand an fmov immediate back to single-precision bits.
pub fn decode_imm_single(imm8: u8) -> u32 {
    let imm8 = imm8 as u32;
    let sign = (imm8 >> 7) & 1;
    let b = (imm8 >> 6) & 1;
    let exponent = ((b ^ 1) << 7) | ((b * 0x1f) << 2) | ((imm8 >> 4) & 0x3);
    let fraction = (imm8 & 0xf) << 19;
    (sign << 31) | (exponent << 23) | fraction
}

/// Expand an fmov immediate back to double-precision bits.
pub fn decode_imm_double(imm8: u8) -> u64 {
    let imm8 = imm8 as u64;
    let sign = (imm8 >> 7) & 1;
    let b = (imm8 >> 6) & 1;
    let exponent = ((b ^ 1) << 10) | ((b * 0xff) << 2) | ((imm8 >> 4) & 0x3);
    let fraction = (imm8 & 0xf) << 48;
    (sign << 63) | (exponent << 52) | fraction
}

/// Encode `value` as a logical immediate, returning `N:immr:imms` packed as
/// `n << 12 | immr << 6 | imms`.
///
/// `value` is read as 32 bits unless `is_wide`. Zero and all-ones have no
/// encoding. The inverse is [`decode_logical_immediate`].
///
/// ```text
///  N   imms    immr    size
///  1  ssssss  rrrrrr    64
///  0  0sssss  xrrrrr    32
///  0  10ssss  xxrrrr    16
///  0  110sss  xxxrrr     8
///  0  1110ss  xxxxrr     4
///  0  11110s  xxxxxr     2
/// ```
pub fn encode_logical_immediate(is_wide: bool, value: u64) -> Option<u32> {
    let value = if is_wide { value } else { value & 0xffff_ffff };
    let all_ones = if is_wide { u64::MAX } else { 0xffff_ffff };
    if value == 0 || value == all_ones {
        return None;
    }

    let (lead_zero, lead_one, trail_zero, trail_one, mut set_bits) = if is_wide {
        (
            value.leading_zeros(),
            (!value).leading_zeros(),
            value.trailing_zeros(),
            (!value).trailing_zeros(),
            value.count_ones(),
        )
    } else {
        let v = value as u32;
        (
            v.leading_zeros(),
            (!v).leading_zeros(),
            v.trailing_zeros(),
            (!v).trailing_zeros(),
            v.count_ones(),
        )
    };

    let mut width: u32 = if is_wide { 64 } else { 32 };
    // Fixed high bits of imms; the 64-bit round is skipped for W registers.
    let mut imm_s_fixed: i32 = if is_wide { -128 } else { -64 };
    let imm_s_mask: i32 = 0x3f;

    let (n, imm_r, imm_s) = loop {
        if width == 2 {
            // Any non-uniform 2-bit element is a run.
            break (0, (value & 3) as u32 - 1, 0x3c);
        }

        let n = u32::from(width == 64);
        let imm_s = ((imm_s_fixed | (set_bits as i32 - 1)) & imm_s_mask) as u32;
        let imm_r = if lead_zero + set_bits == width {
            0
        } else if lead_zero > 0 {
            width - trail_zero
        } else {
            lead_one
        };

        // A single run of ones.
        if lead_zero + trail_zero + set_bits == width {
            break (n, imm_r, imm_s);
        }
        // A single run of zeros.
        if lead_one + trail_one + (width - set_bits) == width {
            break (n, imm_r, imm_s);
        }

        let half = width >> 1;
        let mask = (1u64 << half) - 1;
        if value & mask == (value >> half) & mask {
            width = half;
            set_bits >>= 1;
            imm_s_fixed >>= 1;
            continue;
        }
        return None;
    };

    Some((n << 12) | (imm_r << 6) | imm_s)
}

/// Expand a packed `N:immr:imms` field to the value it denotes.
///
/// Returns `None` for reserved encodings, and for `N = 1` when `is_wide`
/// is false.
pub fn decode_logical_immediate(is_wide: bool, encoded: u32) -> Option<u64> {
    let n = (encoded >> 12) & 0x1;
    let imm_r = (encoded >> 6) & 0x3f;
    let imm_s = encoded & 0x3f;

    if n == 1 {
        if !is_wide || imm_s == 0x3f {
            return None;
        }
        let bits = (1u64 << (imm_s + 1)) - 1;
        return Some(rotate_right(bits, imm_r, 64));
    }

    if (imm_s >> 1) == 0x1f {
        return None;
    }
    let mut width = 0x20;
    while width >= 0x2 {
        if imm_s & width == 0 {
            let mask = width - 1;
            if imm_s & mask == mask {
                return None;
            }
            let bits = (1u64 << ((imm_s & mask) + 1)) - 1;
            let element = rotate_right(bits, imm_r & mask, width);
            return Some(repeat_across_register(is_wide, element, width));
        }
        width >>= 1;
    }
    None
}

fn element_mask(width: u32) -> u64 {
    if width == 64 {
        u64::MAX
    } else {
        (1u64 << width) - 1
    }
}

fn rotate_right(value: u64, rotate: u32, width: u32) -> u64 {
    let mask = element_mask(width);
    let rotate = rotate & (width - 1);
    if rotate == 0 {
        return value & mask;
    }
    ((value & mask) >> rotate) | ((value << (width - rotate)) & mask)
}

fn repeat_across_register(is_wide: bool, value: u64, width: u32) -> u64 {
    let reg_size = if is_wide { 64 } else { 32 };
    let mut result = value & element_mask(width);
    let mut i = width;
    while i < reg_size {
        result |= result << i;
        i *= 2;
    }
    if is_wide {
        result
    } else {
        result & 0xffff_ffff
    }
}
