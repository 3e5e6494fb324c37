//! Numeral parsing and `printf`-style number formatting
//!
//! Strings are converted to numbers for arithmetic using the Lua 5.1 numeral
//! grammar, and numbers are converted to strings with C's `%.14g`.

/// Precision used when a number is converted to a string
pub const NUMBER_PRECISION: usize = 14;

fn is_lua_space(b: u8) -> bool {
    matches!(b, b' ' | b'\t' | b'\n' | b'\x0b' | b'\x0c' | b'\r')
}

fn trim(bytes: &[u8]) -> &[u8] {
    let start = bytes.iter().position(|b| !is_lua_space(*b)).unwrap_or(bytes.len());
    let end = bytes.iter().rposition(|b| !is_lua_space(*b)).map_or(start, |p| p + 1);
    &bytes[start..end]
}

/// Parse a numeral string.
///
/// Accepts surrounding whitespace, an optional sign, decimal numerals with an
/// optional fraction and exponent, and hexadecimal integers (`0x1F`).
/// Returns `None` for anything else, including `inf` and `nan`.
pub fn parse_number(bytes: &[u8]) -> Option<f64> {
    let s = trim(bytes);
    if s.is_empty() {
        return None;
    }

    let (negative, body) = match s[0] {
        b'-' => (true, &s[1..]),
        b'+' => (false, &s[1..]),
        _ => (false, s),
    };

    if body.len() > 2 && body[0] == b'0' && (body[1] == b'x' || body[1] == b'X') {
        let value = parse_hex_digits(&body[2..])?;
        return Some(if negative { -value } else { value });
    }

    if !is_decimal_numeral(body) {
        return None;
    }
    let text = std::str::from_utf8(s).ok()?;
    text.parse::<f64>().ok()
}

fn parse_hex_digits(digits: &[u8]) -> Option<f64> {
    if digits.is_empty() {
        return None;
    }
    let mut value = 0.0f64;
    for &d in digits {
        let digit = (d as char).to_digit(16)?;
        value = value * 16.0 + digit as f64;
    }
    Some(value)
}

fn is_decimal_numeral(s: &[u8]) -> bool {
    let mut i = 0;
    let int_start = i;
    while i < s.len() && s[i].is_ascii_digit() {
        i += 1;
    }
    let mut digits = i - int_start;

    if i < s.len() && s[i] == b'.' {
        i += 1;
        let frac_start = i;
        while i < s.len() && s[i].is_ascii_digit() {
            i += 1;
        }
        digits += i - frac_start;
    }

    if digits == 0 {
        return false;
    }

    if i < s.len() && (s[i] == b'e' || s[i] == b'E') {
        i += 1;
        if i < s.len() && (s[i] == b'+' || s[i] == b'-') {
            i += 1;
        }
        let exp_start = i;
        while i < s.len() && s[i].is_ascii_digit() {
            i += 1;
        }
        if i == exp_start {
            return false;
        }
    }

    i == s.len()
}

/// Parse an integer in the given base (2..=36), as `tonumber(s, base)` does
pub fn parse_integer_in_base(bytes: &[u8], base: u32) -> Option<f64> {
    let s = trim(bytes);
    let (negative, digits) = match s.first() {
        Some(b'-') => (true, &s[1..]),
        Some(b'+') => (false, &s[1..]),
        _ => (false, s),
    };
    if digits.is_empty() {
        return None;
    }
    let mut value = 0.0f64;
    for &d in digits {
        let digit = (d as char).to_digit(base)?;
        value = value * base as f64 + digit as f64;
    }
    Some(if negative { -value } else { value })
}

/// Convert a number to its Lua string form (`%.14g`)
pub fn format_number(n: f64) -> String {
    format_general(n, NUMBER_PRECISION, false, false)
}

fn format_special(n: f64, upper: bool) -> String {
    let text = if n.is_nan() {
        if n.is_sign_negative() {
            "-nan"
        } else {
            "nan"
        }
    } else if n > 0.0 {
        "inf"
    } else {
        "-inf"
    };
    if upper {
        text.to_uppercase()
    } else {
        text.to_string()
    }
}

fn split_exponent(formatted: &str) -> (&str, i32) {
    match formatted.split_once('e') {
        Some((mantissa, exp)) => (mantissa, exp.parse().unwrap_or(0)),
        None => (formatted, 0),
    }
}

fn strip_trailing_zeros(s: &str) -> &str {
    if s.contains('.') {
        s.trim_end_matches('0').trim_end_matches('.')
    } else {
        s
    }
}

/// C `%.<precision>e`
pub fn format_exponent(n: f64, precision: usize, upper: bool) -> String {
    if !n.is_finite() {
        return format_special(n, upper);
    }
    let formatted = format!("{:.*e}", precision, n);
    let (mantissa, exp) = split_exponent(&formatted);
    join_exponent(mantissa, exp, upper)
}

fn join_exponent(mantissa: &str, exp: i32, upper: bool) -> String {
    format!(
        "{}{}{}{:02}",
        mantissa,
        if upper { 'E' } else { 'e' },
        if exp < 0 { '-' } else { '+' },
        exp.abs()
    )
}

/// C `%.<precision>f`
pub fn format_fixed(n: f64, precision: usize, upper: bool) -> String {
    if !n.is_finite() {
        return format_special(n, upper);
    }
    format!("{:.*}", precision, n)
}

/// C `%.<precision>g`; `alternate` keeps trailing zeros (`%#g`)
pub fn format_general(n: f64, precision: usize, upper: bool, alternate: bool) -> String {
    if !n.is_finite() {
        return format_special(n, upper);
    }
    let precision = precision.max(1);

    let exp = if n == 0.0 {
        0
    } else {
        let probe = format!("{:.*e}", precision - 1, n);
        split_exponent(&probe).1
    };

    if exp < -4 || exp >= precision as i32 {
        let formatted = format!("{:.*e}", precision - 1, n);
        let (mantissa, exp) = split_exponent(&formatted);
        let mantissa = if alternate { mantissa } else { strip_trailing_zeros(mantissa) };
        join_exponent(mantissa, exp, upper)
    } else {
        let decimals = (precision as i32 - 1 - exp).max(0) as usize;
        let formatted = format!("{:.*}", decimals, n);
        if alternate {
            formatted
        } else {
            strip_trailing_zeros(&formatted).to_string()
        }
    }
}

/// Lua 5.1 modulo: `a - floor(a/b)*b`
pub fn lua_mod(a: f64, b: f64) -> f64 {
    a - (a / b).floor() * b
}

/// Integral value of `n` if it has one and fits in an `i64`
pub fn as_integer(n: f64) -> Option<i64> {
    if n.fract() == 0.0 && n >= i64::MIN as f64 && n < i64::MAX as f64 {
        Some(n as i64)
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_numeral_grammar() {
        assert_eq!(parse_number(b"10"), Some(10.0));
        assert_eq!(parse_number(b"  3.25  "), Some(3.25));
        assert_eq!(parse_number(b"\t-7\n"), Some(-7.0));
        assert_eq!(parse_number(b".5"), Some(0.5));
        assert_eq!(parse_number(b"5."), Some(5.0));
        assert_eq!(parse_number(b"1e3"), Some(1000.0));
        assert_eq!(parse_number(b"2.5E-1"), Some(0.25));
        assert_eq!(parse_number(b"0x10"), Some(16.0));
        assert_eq!(parse_number(b"-0XfF"), Some(-255.0));
    }

    #[test]
    fn test_numeral_rejections() {
        for bad in [
            &b""[..], b"  ", b"abc", b"1 2", b"inf", b"nan", b"-inf", b"1e", b"0x",
            b"0x1.8", b".", b"+", b"1..2", b"10a",
        ] {
            assert_eq!(parse_number(bad), None, "{:?}", String::from_utf8_lossy(bad));
        }
    }

    #[test]
    fn test_format_number() {
        assert_eq!(format_number(1.0), "1");
        assert_eq!(format_number(-3.0), "-3");
        assert_eq!(format_number(0.1), "0.1");
        assert_eq!(format_number(1.5), "1.5");
        assert_eq!(format_number(100.0), "100");
        assert_eq!(format_number(1e15), "1e+15");
        assert_eq!(format_number(1e14), "1e+14");
        assert_eq!(format_number(123456789012.0), "123456789012");
        assert_eq!(format_number(1.0 / 3.0), "0.33333333333333");
        assert_eq!(format_number(0.0001), "0.0001");
        assert_eq!(format_number(0.00001), "1e-05");
        assert_eq!(format_number(-0.0), "-0");
        assert_eq!(format_number(f64::INFINITY), "inf");
        assert_eq!(format_number(f64::NEG_INFINITY), "-inf");
    }

    #[test]
    fn test_printf_variants() {
        assert_eq!(format_exponent(1234.5, 2, false), "1.23e+03");
        assert_eq!(format_exponent(0.0, 1, true), "0.0E+00");
        assert_eq!(format_fixed(2.0 / 3.0, 3, false), "0.667");
        assert_eq!(format_general(100000.0, 6, false, false), "100000");
        assert_eq!(format_general(1000000.0, 6, false, false), "1e+06");
        assert_eq!(format_general(0.5, 6, false, true), "0.500000");
    }

    #[test]
    fn test_modulo_follows_floor() {
        assert_eq!(lua_mod(5.0, 3.0), 2.0);
        assert_eq!(lua_mod(-5.0, 3.0), 1.0);
        assert_eq!(lua_mod(5.0, -3.0), -1.0);
        assert!(lua_mod(1.0, 0.0).is_nan());
    }

    #[test]
    fn test_integer_in_base() {
        assert_eq!(parse_integer_in_base(b"ff", 16), Some(255.0));
        assert_eq!(parse_integer_in_base(b" 101 ", 2), Some(5.0));
        assert_eq!(parse_integer_in_base(b"z", 36), Some(35.0));
        assert_eq!(parse_integer_in_base(b"8", 8), None);
    }
}
