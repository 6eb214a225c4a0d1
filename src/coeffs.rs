//! Hexadecimal floating-point literals for FixIIR coefficient lists.
//!
//! FixIIR takes `coeffb=` / `coeffa=` as `:`-separated lists. Hex literals
//! (`0x1.8000000000000p-2`) carry every bit of an `f64`, so the synthesizer
//! sees exactly the coefficients the caller designed.

const MANTISSA_BITS: u32 = 52;
const MANTISSA_MASK: u64 = (1u64 << MANTISSA_BITS) - 1;
const EXPONENT_BIAS: i32 = 1023;

/// Significant hex digits kept while parsing (60 bits); the rest only feed a sticky bit.
const MAX_SIG_DIGITS: u32 = 15;

/// Errors produced when reading a hex-float coefficient list.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CoeffError {
    /// A list entry was empty (e.g. `0x1p+0::0x1p+1`).
    Empty { index: usize },
    /// A list entry is not a hex-float literal.
    Invalid { index: usize, literal: String },
}

impl std::fmt::Display for CoeffError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CoeffError::Empty { index } => write!(f, "coefficient {index} is empty"),
            CoeffError::Invalid { index, literal } => {
                write!(f, "coefficient {index} is not a hex float: {literal:?}")
            }
        }
    }
}

impl std::error::Error for CoeffError {}

/// Format one value as an exact hex-float literal.
///
/// Normal numbers print as `[-]0x1.<13 hex digits>p<exp>`, subnormals as
/// `0x0.<13 hex digits>p-1022`, zeros as `0x0.0p+0`.
pub fn to_hex_float(value: f64) -> String {
    if value.is_nan() {
        return "nan".to_string();
    }
    if value.is_infinite() {
        return if value > 0.0 { "inf" } else { "-inf" }.to_string();
    }

    let bits = value.to_bits();
    let sign = if bits >> 63 == 1 { "-" } else { "" };
    let biased = ((bits >> MANTISSA_BITS) & 0x7ff) as i32;
    let mantissa = bits & MANTISSA_MASK;

    if biased == 0 && mantissa == 0 {
        return format!("{sign}0x0.0p+0");
    }

    let (lead, exp) = if biased == 0 {
        (0, 1 - EXPONENT_BIAS)
    } else {
        (1, biased - EXPONENT_BIAS)
    };
    format!("{sign}0x{lead}.{mantissa:013x}p{exp:+}")
}

/// Format coefficients as the `:`-separated list FixIIR expects.
pub fn coeffs_to_hex_list(coeffs: &[f64]) -> String {
    coeffs
        .iter()
        .map(|&c| to_hex_float(c))
        .collect::<Vec<_>>()
        .join(":")
}

/// Parse a single hex-float literal such as `-0x1.8p-3` or `0x.4p+1`.
///
/// The `0x` prefix and the `p` exponent are optional. Returns `None` on
/// malformed input. Literals produced by [`to_hex_float`] parse back bit-for-bit.
pub fn parse_hex_float(literal: &str) -> Option<f64> {
    let s = literal.trim();
    let (negative, s) = match s.as_bytes().first() {
        Some(b'-') => (true, &s[1..]),
        Some(b'+') => (false, &s[1..]),
        _ => (false, s),
    };
    let signed = |v: f64| if negative { -v } else { v };

    match s {
        "inf" | "infinity" => return Some(signed(f64::INFINITY)),
        "nan" => return Some(f64::NAN),
        _ => {}
    }

    let s = s
        .strip_prefix("0x")
        .or_else(|| s.strip_prefix("0X"))
        .unwrap_or(s);
    let (digits, exp_part) = match s.find(['p', 'P']) {
        Some(pos) => (&s[..pos], Some(&s[pos + 1..])),
        None => (s, None),
    };
    let (int_part, frac_part) = match digits.split_once('.') {
        Some((i, f)) => (i, f),
        None => (digits, ""),
    };
    if int_part.is_empty() && frac_part.is_empty() {
        return None;
    }

    let mut mantissa: u64 = 0;
    let mut sig_digits = 0u32;
    let mut scale: i64 = 0;
    let mut sticky = false;

    for c in int_part.chars() {
        let d = c.to_digit(16)? as u64;
        if mantissa == 0 && d == 0 {
            continue;
        }
        if sig_digits < MAX_SIG_DIGITS {
            mantissa = mantissa * 16 + d;
            sig_digits += 1;
        } else {
            scale += 4;
            sticky |= d != 0;
        }
    }
    for c in frac_part.chars() {
        let d = c.to_digit(16)? as u64;
        if mantissa == 0 && d == 0 {
            scale -= 4;
            continue;
        }
        if sig_digits < MAX_SIG_DIGITS {
            mantissa = mantissa * 16 + d;
            sig_digits += 1;
            scale -= 4;
        } else {
            sticky |= d != 0;
        }
    }
    if sticky {
        mantissa |= 1;
    }

    let exponent: i64 = match exp_part {
        Some(e) if !e.is_empty() => e.parse().ok()?,
        Some(_) => return None,
        None => 0,
    };

    if mantissa == 0 {
        return Some(signed(0.0));
    }
    let total = exponent.saturating_add(scale).clamp(-4000, 4000) as i32;
    Some(signed(scale_by_pow2(mantissa as f64, total)))
}

/// Parse a `:`-separated hex-float list back into values.
pub fn parse_hex_list(list: &str) -> Result<Vec<f64>, CoeffError> {
    list.split(':')
        .enumerate()
        .map(|(index, literal)| {
            if literal.trim().is_empty() {
                return Err(CoeffError::Empty { index });
            }
            parse_hex_float(literal).ok_or_else(|| CoeffError::Invalid {
                index,
                literal: literal.to_string(),
            })
        })
        .collect()
}

/// `x * 2^exp`, stepping through normal-range factors so only the last step can round.
fn scale_by_pow2(mut x: f64, mut exp: i32) -> f64 {
    let pow2 = |e: i32| f64::from_bits(((e + EXPONENT_BIAS) as u64) << MANTISSA_BITS);
    while exp > EXPONENT_BIAS {
        x *= pow2(EXPONENT_BIAS);
        exp -= EXPONENT_BIAS;
    }
    while exp < 1 - EXPONENT_BIAS {
        x *= pow2(1 - EXPONENT_BIAS);
        exp += EXPONENT_BIAS - 1;
    }
    x * pow2(exp)
}
