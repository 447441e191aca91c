// Numeral parsing shared by the lexer, tonumber, and the VM's
// string-to-number coercion. Classification: a literal is an integer
// unless it has a fraction, a decimal exponent, or a binary exponent;
// decimal integers that overflow become floats, hex integers wrap.

use crate::lua_value::Value;

#[inline]
fn hex_digit(b: u8) -> Option<u64> {
    match b {
        b'0'..=b'9' => Some((b - b'0') as u64),
        b'a'..=b'f' => Some((b - b'a' + 10) as u64),
        b'A'..=b'F' => Some((b - b'A' + 10) as u64),
        _ => None,
    }
}

fn parse_hex(s: &[u8]) -> Option<Value> {
    let mut i = 0;
    let mut mantissa: f64 = 0.0;
    let mut int_acc: u64 = 0;
    let mut digits = 0;
    let mut exponent: i32 = 0;
    let mut seen_dot = false;
    let mut is_float = false;

    while i < s.len() {
        let b = s[i];
        if b == b'.' {
            if seen_dot {
                return None;
            }
            seen_dot = true;
            is_float = true;
            i += 1;
        } else if let Some(d) = hex_digit(b) {
            mantissa = mantissa * 16.0 + d as f64;
            int_acc = int_acc.wrapping_mul(16).wrapping_add(d);
            if seen_dot {
                exponent -= 4;
            }
            digits += 1;
            i += 1;
        } else {
            break;
        }
    }
    if digits == 0 {
        return None;
    }
    if i < s.len() && (s[i] == b'p' || s[i] == b'P') {
        is_float = true;
        i += 1;
        let mut neg = false;
        if i < s.len() && (s[i] == b'+' || s[i] == b'-') {
            neg = s[i] == b'-';
            i += 1;
        }
        let mut e: i32 = 0;
        let mut edigits = 0;
        while i < s.len() && s[i].is_ascii_digit() {
            e = e.saturating_mul(10).saturating_add((s[i] - b'0') as i32);
            edigits += 1;
            i += 1;
        }
        if edigits == 0 {
            return None;
        }
        exponent += if neg { -e } else { e };
    }
    if i != s.len() {
        return None;
    }
    if is_float {
        Some(Value::Float(mantissa * (exponent as f64).exp2()))
    } else {
        Some(Value::Int(int_acc as i64))
    }
}

fn parse_dec(s: &[u8]) -> Option<Value> {
    let text = std::str::from_utf8(s).ok()?;
    let is_float = s.iter().any(|&b| matches!(b, b'.' | b'e' | b'E'));
    if !is_float {
        if s.is_empty() || !s.iter().all(|b| b.is_ascii_digit()) {
            return None;
        }
        match text.parse::<i64>() {
            Ok(i) => return Some(Value::Int(i)),
            // Out of integer range: fall through to float.
            Err(_) => {}
        }
    }
    // Keep Rust's float grammar honest: no inf/nan words, no stray bytes.
    if !s
        .iter()
        .all(|b| b.is_ascii_digit() || matches!(b, b'.' | b'e' | b'E' | b'+' | b'-'))
    {
        return None;
    }
    text.parse::<f64>().ok().map(Value::Float)
}

/// Lua's string-to-number conversion: optional surrounding space, optional
/// sign, hex (`0x...`, integer or float with `p` exponent) or decimal.
pub fn str_to_number(s: &str) -> Option<Value> {
    let s = s.trim_matches(|c: char| c.is_ascii_whitespace());
    let b = s.as_bytes();
    if b.is_empty() {
        return None;
    }
    let (neg, rest) = match b[0] {
        b'-' => (true, &b[1..]),
        b'+' => (false, &b[1..]),
        _ => (false, b),
    };
    let v = if rest.len() > 2 && rest[0] == b'0' && (rest[1] == b'x' || rest[1] == b'X') {
        parse_hex(&rest[2..])?
    } else {
        parse_dec(rest)?
    };
    Some(match (neg, v) {
        (true, Value::Int(i)) => Value::Int(i.wrapping_neg()),
        (true, Value::Float(f)) => Value::Float(-f),
        (_, v) => v,
    })
}

/// tonumber with an explicit base (2..=36): integer digits only.
pub fn str_to_integer_radix(s: &str, base: u32) -> Option<i64> {
    let s = s.trim_matches(|c: char| c.is_ascii_whitespace());
    let b = s.as_bytes();
    if b.is_empty() {
        return None;
    }
    let (neg, digits) = match b[0] {
        b'-' => (true, &b[1..]),
        b'+' => (false, &b[1..]),
        _ => (false, b),
    };
    if digits.is_empty() {
        return None;
    }
    let mut acc: i64 = 0;
    for &d in digits {
        let v = (d as char).to_digit(36)?;
        if v >= base {
            return None;
        }
        acc = acc.wrapping_mul(base as i64).wrapping_add(v as i64);
    }
    Some(if neg { acc.wrapping_neg() } else { acc })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn as_int(v: Option<Value>) -> Option<i64> {
        match v {
            Some(Value::Int(i)) => Some(i),
            _ => None,
        }
    }

    fn as_float(v: Option<Value>) -> Option<f64> {
        match v {
            Some(Value::Float(f)) => Some(f),
            _ => None,
        }
    }

    #[test]
    fn test_decimal_integers() {
        assert_eq!(as_int(str_to_number("42")), Some(42));
        assert_eq!(as_int(str_to_number("-7")), Some(-7));
        assert_eq!(as_int(str_to_number("  10  ")), Some(10));
    }

    #[test]
    fn test_decimal_floats() {
        assert_eq!(as_float(str_to_number("3.5")), Some(3.5));
        assert_eq!(as_float(str_to_number("1e3")), Some(1000.0));
        assert_eq!(as_float(str_to_number(".5")), Some(0.5));
        assert_eq!(as_float(str_to_number("2.")), Some(2.0));
    }

    #[test]
    fn test_integer_overflow_to_float() {
        // One past i64::MAX must become a float.
        let v = str_to_number("9223372036854775808");
        assert_eq!(as_float(v), Some(9.223372036854776e18));
    }

    #[test]
    fn test_hex() {
        assert_eq!(as_int(str_to_number("0xff")), Some(255));
        assert_eq!(as_int(str_to_number("0XA")), Some(10));
        // Hex integers wrap rather than overflow.
        assert_eq!(
            as_int(str_to_number("0xFFFFFFFFFFFFFFFF")),
            Some(-1)
        );
        assert_eq!(as_float(str_to_number("0x1p4")), Some(16.0));
        assert_eq!(as_float(str_to_number("0x1.8p1")), Some(3.0));
    }

    #[test]
    fn test_rejects() {
        assert!(str_to_number("").is_none());
        assert!(str_to_number("abc").is_none());
        assert!(str_to_number("1x").is_none());
        assert!(str_to_number("inf").is_none());
        assert!(str_to_number("0x").is_none());
        assert!(str_to_number("1e").is_none());
    }

    #[test]
    fn test_radix() {
        assert_eq!(str_to_integer_radix("ff", 16), Some(255));
        assert_eq!(str_to_integer_radix("z", 36), Some(35));
        assert_eq!(str_to_integer_radix("102", 2), None);
        assert_eq!(str_to_integer_radix("-11", 2), Some(-3));
    }
}
