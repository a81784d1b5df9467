//! DRDA packed decimal (FD:OCA DECIMAL) encoding.
//!
//! A DECIMAL(p, s) occupies `p / 2 + 1` bytes: digits packed two per byte,
//! most significant first, with the sign in the low nibble of the last byte
//! (`0xC` positive, `0xD` negative).

use rust_decimal::Decimal;

use crate::error::{DrdaError, DrdaResult};

/// Largest precision a packed decimal can carry.
pub const MAX_DECIMAL_PRECISION: u32 = 31;

const SIGN_POSITIVE: u8 = 0x0C;
const SIGN_NEGATIVE: u8 = 0x0D;

/// Encoded size of a DECIMAL(precision, _).
pub fn packed_length(precision: u32) -> usize {
    precision as usize / 2 + 1
}

/// Pack `value` as DECIMAL(`precision`, `scale`).
///
/// Fraction digits beyond `scale` are discarded; missing fraction digits are
/// zero-filled. Fails with SQLSTATE 22003 when the integer part does not fit
/// in `precision - scale` digits.
pub fn pack_decimal(value: &Decimal, precision: u32, scale: u32) -> DrdaResult<Vec<u8>> {
    if precision > MAX_DECIMAL_PRECISION {
        return Err(DrdaError::Decimal {
            sqlstate: "42820",
            message: format!("Packed decimal may only be up to {MAX_DECIMAL_PRECISION} digits"),
        });
    }
    debug_assert!(scale <= precision, "scale exceeds precision");

    let unscaled = value.mantissa().unsigned_abs().to_string();
    let digits = unscaled.len();
    if digits > MAX_DECIMAL_PRECISION as usize {
        return Err(DrdaError::Decimal {
            sqlstate: "42820",
            message: format!(
                "The numeric literal \"{value}\" is not valid because its value is out of range"
            ),
        });
    }

    let value_scale = value.scale() as usize;
    let scale = scale as usize;
    let whole_digits = digits as isize - value_scale as isize;
    if whole_digits > 0 && unscaled != "0" {
        let declared_whole = precision as isize - scale as isize;
        if whole_digits > declared_whole {
            return Err(DrdaError::Decimal {
                sqlstate: "22003",
                message: format!(
                    "Overflow occurred during numeric data type conversion of \"{value}\""
                ),
            });
        }
    }

    // Align the digit string to the declared scale.
    let mut aligned: Vec<u8> = unscaled.bytes().map(|b| b - b'0').collect();
    if value_scale >= scale {
        let drop = (value_scale - scale).min(aligned.len());
        aligned.truncate(aligned.len() - drop);
    } else {
        aligned.resize(aligned.len() + (scale - value_scale), 0);
    }

    let length = packed_length(precision);
    // One nibble is the sign, the rest hold digits right-aligned.
    let nibble_slots = length * 2 - 1;
    let mut nibbles = vec![0u8; nibble_slots.saturating_sub(aligned.len())];
    let keep_from = aligned.len().saturating_sub(nibble_slots);
    nibbles.extend_from_slice(&aligned[keep_from..]);
    let negative = value.is_sign_negative() && !value.is_zero();
    nibbles.push(if negative { SIGN_NEGATIVE } else { SIGN_POSITIVE });

    Ok(nibbles
        .chunks(2)
        .map(|pair| (pair[0] << 4) | pair[1])
        .collect())
}

/// Unpack a DECIMAL(`precision`, `scale`) read off the wire.
pub fn unpack_decimal(packed: &[u8], precision: u32, scale: u32) -> DrdaResult<Decimal> {
    if precision > MAX_DECIMAL_PRECISION || packed.len() != packed_length(precision) {
        return Err(DrdaError::InvalidDdm(format!(
            "packed decimal of {} bytes does not match precision {precision}",
            packed.len()
        )));
    }
    let mut mantissa: i128 = 0;
    let last = packed.len() - 1;
    for (i, byte) in packed.iter().enumerate() {
        let high = byte >> 4;
        let low = byte & 0x0F;
        if high > 9 || (i != last && low > 9) {
            return Err(DrdaError::InvalidDdm(format!(
                "invalid packed decimal digit in 0x{byte:02X}"
            )));
        }
        mantissa = mantissa * 10 + i128::from(high);
        if i != last {
            mantissa = mantissa * 10 + i128::from(low);
        }
    }
    if matches!(packed[last] & 0x0F, 0x0B | 0x0D) {
        mantissa = -mantissa;
    }
    Decimal::try_from_i128_with_scale(mantissa, scale).map_err(|e| DrdaError::Decimal {
        sqlstate: "22003",
        message: e.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    fn dec(s: &str) -> Decimal {
        Decimal::from_str(s).unwrap()
    }

    #[test]
    fn packs_positive_odd_precision() {
        assert_eq!(pack_decimal(&dec("123.45"), 5, 2).unwrap(), vec![0x12, 0x34, 0x5C]);
    }

    #[test]
    fn packs_negative_even_precision() {
        // DECIMAL(4,1): 4/2+1 = 3 bytes, leading pad nibble
        assert_eq!(pack_decimal(&dec("-12.3"), 4, 1).unwrap(), vec![0x00, 0x12, 0x3D]);
    }

    #[test]
    fn pads_and_truncates_fraction() {
        assert_eq!(pack_decimal(&dec("1.5"), 5, 3).unwrap(), vec![0x01, 0x50, 0x0C]);
        assert_eq!(pack_decimal(&dec("1.2345"), 3, 1).unwrap(), vec![0x01, 0x2C]);
    }

    #[test]
    fn zero_is_positive() {
        assert_eq!(pack_decimal(&dec("0"), 3, 0).unwrap(), vec![0x00, 0x0C]);
        assert_eq!(pack_decimal(&dec("0.00"), 1, 0).unwrap(), vec![0x0C]);
    }

    #[test]
    fn integer_overflow_reports_22003() {
        let err = pack_decimal(&dec("1234.5"), 5, 2).unwrap_err();
        assert!(matches!(err, DrdaError::Decimal { sqlstate: "22003", .. }));
    }

    #[test]
    fn precision_limit_reports_42820() {
        let err = pack_decimal(&dec("1"), 32, 0).unwrap_err();
        assert!(matches!(err, DrdaError::Decimal { sqlstate: "42820", .. }));
    }

    #[test]
    fn unpacks_what_was_packed() {
        let cases = [("123.45", 5, 2), ("-12.3", 4, 1), ("0", 1, 0), ("-0.07", 9, 2)];
        for (text, precision, scale) in cases {
            let packed = pack_decimal(&dec(text), precision, scale).unwrap();
            assert_eq!(unpack_decimal(&packed, precision, scale).unwrap(), dec(text));
        }
        assert!(unpack_decimal(&[0xAC], 1, 0).is_err());
        assert!(unpack_decimal(&[0x1C], 3, 0).is_err());
    }

    #[test]
    fn max_precision_length() {
        assert_eq!(packed_length(31), 16);
        let packed = pack_decimal(&dec("-9999999999999999999999999999"), 31, 0).unwrap();
        assert_eq!(packed.len(), 16);
        assert_eq!(packed[15], 0x9D);
        assert_eq!(packed[0], 0x00);
    }
}
