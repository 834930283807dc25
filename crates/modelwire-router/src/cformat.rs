//! C-style row formats for `table` endpoints.
//!
//! Rows are written with a `printf`-like format (`"%.1lf\t%.1lf\n"`) and read
//! back with the same string interpreted `scanf`-style. Length modifiers
//! (`h`, `l`, `ll`, `L`, ...) are accepted and ignored since every value is
//! already 64 bits wide.

use std::iter::Peekable;
use std::str::Chars;

use crate::error::{Result, RouterError};
use crate::record::Value;

/// A row could not be formatted or scanned.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{0}")]
pub struct RowError(pub String);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Conversion {
    Signed,
    Unsigned,
    Hex { upper: bool },
    Octal,
    Fixed,
    Exponent { upper: bool },
    General { upper: bool },
    Str,
    Char,
}

impl Conversion {
    fn letter(self) -> char {
        match self {
            Conversion::Signed => 'd',
            Conversion::Unsigned => 'u',
            Conversion::Hex { upper: false } => 'x',
            Conversion::Hex { upper: true } => 'X',
            Conversion::Octal => 'o',
            Conversion::Fixed => 'f',
            Conversion::Exponent { upper: false } => 'e',
            Conversion::Exponent { upper: true } => 'E',
            Conversion::General { upper: false } => 'g',
            Conversion::General { upper: true } => 'G',
            Conversion::Str => 's',
            Conversion::Char => 'c',
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
struct Flags {
    left: bool,
    plus: bool,
    space: bool,
    zero: bool,
    alternate: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct Spec {
    flags: Flags,
    width: Option<usize>,
    precision: Option<usize>,
    conversion: Conversion,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Piece {
    Literal(String),
    Spec(Spec),
}

/// A parsed row format.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CFormat {
    source: String,
    pieces: Vec<Piece>,
}

impl CFormat {
    /// Parse a format string. `\n`, `\t`, `\r` and `\\` escapes written
    /// literally (as in single-quoted YAML) are interpreted.
    pub fn parse(format: &str) -> Result<Self> {
        let invalid = |message: String| RouterError::Format {
            format: format.to_string(),
            message,
        };

        let text = unescape(format);
        let mut pieces = Vec::new();
        let mut literal = String::new();
        let mut chars = text.chars().peekable();

        while let Some(c) = chars.next() {
            if c != '%' {
                literal.push(c);
                continue;
            }
            if chars.peek() == Some(&'%') {
                chars.next();
                literal.push('%');
                continue;
            }
            if !literal.is_empty() {
                pieces.push(Piece::Literal(std::mem::take(&mut literal)));
            }

            let mut flags = Flags::default();
            while let Some(&flag) = chars.peek() {
                match flag {
                    '-' => flags.left = true,
                    '+' => flags.plus = true,
                    ' ' => flags.space = true,
                    '0' => flags.zero = true,
                    '#' => flags.alternate = true,
                    _ => break,
                }
                chars.next();
            }
            let width = take_number(&mut chars);
            let precision = if chars.peek() == Some(&'.') {
                chars.next();
                Some(take_number(&mut chars).unwrap_or(0))
            } else {
                None
            };
            while matches!(
                chars.peek(),
                Some('h' | 'l' | 'L' | 'q' | 'j' | 'z' | 't')
            ) {
                chars.next();
            }

            let conversion = match chars.next() {
                Some('d' | 'i') => Conversion::Signed,
                Some('u') => Conversion::Unsigned,
                Some('x') => Conversion::Hex { upper: false },
                Some('X') => Conversion::Hex { upper: true },
                Some('o') => Conversion::Octal,
                Some('f' | 'F') => Conversion::Fixed,
                Some('e') => Conversion::Exponent { upper: false },
                Some('E') => Conversion::Exponent { upper: true },
                Some('g') => Conversion::General { upper: false },
                Some('G') => Conversion::General { upper: true },
                Some('s') => Conversion::Str,
                Some('c') => Conversion::Char,
                Some(other) => {
                    return Err(invalid(format!("unsupported conversion '%{other}'")));
                }
                None => return Err(invalid("format ends inside a conversion".to_string())),
            };
            pieces.push(Piece::Spec(Spec {
                flags,
                width,
                precision,
                conversion,
            }));
        }
        if !literal.is_empty() {
            pieces.push(Piece::Literal(literal));
        }

        Ok(Self {
            source: format.to_string(),
            pieces,
        })
    }

    /// The format string as written.
    pub fn as_str(&self) -> &str {
        &self.source
    }

    /// Number of values one row carries.
    pub fn conversions(&self) -> usize {
        self.pieces
            .iter()
            .filter(|piece| matches!(piece, Piece::Spec(_)))
            .count()
    }

    /// Render one row.
    pub fn format(&self, values: &[Value]) -> std::result::Result<String, RowError> {
        let expected = self.conversions();
        if values.len() != expected {
            return Err(RowError(format!(
                "format '{}' expects {expected} values, got {}",
                self.source,
                values.len()
            )));
        }

        let mut out = String::new();
        let mut values = values.iter();
        for piece in &self.pieces {
            match piece {
                Piece::Literal(text) => out.push_str(text),
                Piece::Spec(spec) => {
                    let Some(value) = values.next() else {
                        break;
                    };
                    out.push_str(&spec.render(value)?);
                }
            }
        }
        Ok(out)
    }

    /// Read one row. Trailing input after the last conversion is ignored.
    pub fn scan(&self, input: &str) -> std::result::Result<Vec<Value>, RowError> {
        let mut rest = input;
        let mut values = Vec::with_capacity(self.conversions());
        for piece in &self.pieces {
            match piece {
                Piece::Literal(text) => rest = match_literal(text, rest)?,
                Piece::Spec(spec) => {
                    let (value, remaining) = spec.scan(rest)?;
                    values.push(value);
                    rest = remaining;
                }
            }
        }
        Ok(values)
    }
}

impl std::fmt::Display for CFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.source)
    }
}

impl Spec {
    fn render(&self, value: &Value) -> std::result::Result<String, RowError> {
        let text = match self.conversion {
            Conversion::Str => {
                let text = value.to_string();
                match self.precision {
                    Some(max) => text.chars().take(max).collect(),
                    None => text,
                }
            }
            Conversion::Char => value.to_string().chars().take(1).collect(),
            Conversion::Signed => {
                let n = self.integer(value)?;
                let digits = self.min_digits(n.unsigned_abs().to_string());
                return Ok(self.pad_number(self.sign(n < 0), digits));
            }
            Conversion::Unsigned | Conversion::Hex { .. } | Conversion::Octal => {
                // Negative values wrap like C's unsigned conversions.
                let n = self.integer(value)? as u64;
                let digits = match self.conversion {
                    Conversion::Hex { upper: true } => format!("{n:X}"),
                    Conversion::Hex { upper: false } => format!("{n:x}"),
                    Conversion::Octal => format!("{n:o}"),
                    _ => n.to_string(),
                };
                let prefix = match self.conversion {
                    Conversion::Hex { upper } if self.flags.alternate && n != 0 => {
                        if upper {
                            "0X"
                        } else {
                            "0x"
                        }
                    }
                    Conversion::Octal if self.flags.alternate => "0",
                    _ => "",
                };
                return Ok(self.pad_number(prefix, self.min_digits(digits)));
            }
            Conversion::Fixed | Conversion::Exponent { .. } | Conversion::General { .. } => {
                let v = self.float(value)?;
                if !v.is_finite() {
                    return Ok(self.pad_text(self.non_finite(v)));
                }
                let magnitude = v.abs();
                let digits = match self.conversion {
                    Conversion::Exponent { upper } => exponent(
                        magnitude,
                        self.precision.unwrap_or(6),
                        self.flags.alternate,
                        upper,
                    ),
                    Conversion::General { upper } => {
                        general(magnitude, self.precision, self.flags.alternate, upper)
                    }
                    _ => {
                        let precision = self.precision.unwrap_or(6);
                        let mut text = format!("{magnitude:.precision$}");
                        if self.flags.alternate && precision == 0 {
                            text.push('.');
                        }
                        text
                    }
                };
                return Ok(self.pad_number(self.sign(v.is_sign_negative()), digits));
            }
        };
        Ok(self.pad_text(text))
    }

    fn integer(&self, value: &Value) -> std::result::Result<i64, RowError> {
        match value {
            Value::Int(n) => Ok(*n),
            Value::Float(f) if f.is_finite() => Ok(f.trunc() as i64),
            Value::Bool(b) => Ok(i64::from(*b)),
            Value::Str(s) => s.trim().parse().map_err(|_| self.mismatch(value)),
            Value::Float(_) => Err(self.mismatch(value)),
        }
    }

    fn float(&self, value: &Value) -> std::result::Result<f64, RowError> {
        value.as_f64().ok_or_else(|| self.mismatch(value))
    }

    fn mismatch(&self, value: &Value) -> RowError {
        RowError(format!(
            "value '{value}' does not fit %{}",
            self.conversion.letter()
        ))
    }

    fn non_finite(&self, v: f64) -> String {
        let upper = matches!(
            self.conversion,
            Conversion::Exponent { upper: true } | Conversion::General { upper: true }
        );
        let text = match (v.is_nan(), v.is_sign_negative()) {
            (true, _) => "nan",
            (false, true) => "-inf",
            (false, false) => "inf",
        };
        if upper {
            text.to_ascii_uppercase()
        } else {
            text.to_string()
        }
    }

    fn sign(&self, negative: bool) -> &'static str {
        if negative {
            "-"
        } else if self.flags.plus {
            "+"
        } else if self.flags.space {
            " "
        } else {
            ""
        }
    }

    fn min_digits(&self, digits: String) -> String {
        match self.precision {
            Some(min) if digits.len() < min => format!("{}{digits}", "0".repeat(min - digits.len())),
            _ => digits,
        }
    }

    fn pad_number(&self, sign: &str, digits: String) -> String {
        let len = sign.len() + digits.len();
        let width = self.width.unwrap_or(0);
        if len >= width {
            return format!("{sign}{digits}");
        }
        let fill = width - len;
        if self.flags.left {
            format!("{sign}{digits}{}", " ".repeat(fill))
        } else if self.flags.zero {
            format!("{sign}{}{digits}", "0".repeat(fill))
        } else {
            format!("{}{sign}{digits}", " ".repeat(fill))
        }
    }

    fn pad_text(&self, text: String) -> String {
        let len = text.chars().count();
        let width = self.width.unwrap_or(0);
        if len >= width {
            return text;
        }
        let fill = " ".repeat(width - len);
        if self.flags.left {
            text + &fill
        } else {
            fill + &text
        }
    }

    fn scan<'a>(&self, input: &'a str) -> std::result::Result<(Value, &'a str), RowError> {
        let input = if self.conversion == Conversion::Char {
            input
        } else {
            input.trim_start()
        };
        let limit = self.width.unwrap_or(usize::MAX);

        let len = match self.conversion {
            Conversion::Char => input
                .chars()
                .take(self.width.unwrap_or(1))
                .map(char::len_utf8)
                .sum(),
            Conversion::Str => token_len(input, limit),
            Conversion::Signed | Conversion::Unsigned => integer_len(input, limit, 10, true),
            Conversion::Octal => integer_len(input, limit, 8, false),
            Conversion::Hex { .. } => hex_len(input, limit),
            Conversion::Fixed | Conversion::Exponent { .. } | Conversion::General { .. } => {
                float_len(input, limit)
            }
        };
        if len == 0 {
            return Err(RowError(format!(
                "no value for %{} at '{}'",
                self.conversion.letter(),
                preview(input)
            )));
        }

        let (token, rest) = input.split_at(len);
        let bad = || {
            RowError(format!(
                "'{token}' is not a valid %{} value",
                self.conversion.letter()
            ))
        };
        let value = match self.conversion {
            Conversion::Signed | Conversion::Unsigned => {
                Value::Int(token.parse().map_err(|_| bad())?)
            }
            Conversion::Octal => Value::Int(i64::from_str_radix(token, 8).map_err(|_| bad())?),
            Conversion::Hex { .. } => {
                let digits = token
                    .strip_prefix("0x")
                    .or_else(|| token.strip_prefix("0X"))
                    .unwrap_or(token);
                Value::Int(i64::from_str_radix(digits, 16).map_err(|_| bad())?)
            }
            Conversion::Fixed | Conversion::Exponent { .. } | Conversion::General { .. } => {
                Value::Float(token.parse().map_err(|_| bad())?)
            }
            Conversion::Str | Conversion::Char => Value::Str(token.to_string()),
        };
        Ok((value, rest))
    }
}

fn take_number(chars: &mut Peekable<Chars<'_>>) -> Option<usize> {
    let mut number: Option<usize> = None;
    while let Some(digit) = chars.peek().and_then(|c| c.to_digit(10)) {
        chars.next();
        number = Some(number.unwrap_or(0).saturating_mul(10).saturating_add(digit as usize));
    }
    number
}

fn unescape(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut chars = text.chars();
    while let Some(c) = chars.next() {
        if c != '\\' {
            out.push(c);
            continue;
        }
        match chars.next() {
            Some('n') => out.push('\n'),
            Some('t') => out.push('\t'),
            Some('r') => out.push('\r'),
            Some('\\') => out.push('\\'),
            Some(other) => {
                out.push('\\');
                out.push(other);
            }
            None => out.push('\\'),
        }
    }
    out
}

fn exponent(v: f64, precision: usize, alternate: bool, upper: bool) -> String {
    let raw = format!("{v:.precision$e}");
    let (mantissa, exp) = raw.split_once('e').unwrap_or((raw.as_str(), "0"));
    let exp: i32 = exp.parse().unwrap_or(0);
    let mut text = mantissa.to_string();
    if alternate && precision == 0 {
        text.push('.');
    }
    text.push(if upper { 'E' } else { 'e' });
    text.push(if exp < 0 { '-' } else { '+' });
    text.push_str(&format!("{:02}", exp.unsigned_abs()));
    text
}

fn general(v: f64, precision: Option<usize>, alternate: bool, upper: bool) -> String {
    let p = match precision {
        Some(0) => 1,
        Some(p) => p,
        None => 6,
    };
    let x = if v == 0.0 {
        0
    } else {
        let raw = format!("{v:.prec$e}", prec = p - 1);
        raw.split_once('e')
            .and_then(|(_, exp)| exp.parse::<i32>().ok())
            .unwrap_or(0)
    };

    let text = if x < -4 || x >= p as i32 {
        exponent(v, p - 1, alternate, upper)
    } else {
        let decimals = (p as i32 - 1 - x).max(0) as usize;
        format!("{v:.decimals$}")
    };
    if alternate {
        text
    } else {
        strip_trailing_zeros(&text)
    }
}

fn strip_trailing_zeros(text: &str) -> String {
    let split = text.find(|c| c == 'e' || c == 'E').unwrap_or(text.len());
    let (mantissa, suffix) = text.split_at(split);
    if !mantissa.contains('.') {
        return text.to_string();
    }
    let trimmed = mantissa.trim_end_matches('0').trim_end_matches('.');
    format!("{trimmed}{suffix}")
}

fn match_literal<'a>(literal: &str, mut input: &'a str) -> std::result::Result<&'a str, RowError> {
    for c in literal.chars() {
        if c.is_whitespace() {
            input = input.trim_start();
            continue;
        }
        input = input.strip_prefix(c).ok_or_else(|| {
            RowError(format!(
                "expected '{}' at '{}'",
                c.escape_default(),
                preview(input)
            ))
        })?;
    }
    Ok(input)
}

fn preview(input: &str) -> String {
    input.chars().take(16).flat_map(char::escape_default).collect()
}

fn token_len(input: &str, limit: usize) -> usize {
    let mut end = 0;
    for (count, (i, c)) in input.char_indices().enumerate() {
        if count >= limit || c.is_whitespace() {
            return i;
        }
        end = i + c.len_utf8();
    }
    end
}

fn integer_len(input: &str, limit: usize, radix: u32, signed: bool) -> usize {
    let bytes = input.as_bytes();
    let max = bytes.len().min(limit);
    let mut i = 0;
    if signed && i < max && matches!(bytes[i], b'+' | b'-') {
        i += 1;
    }
    let start = i;
    while i < max && (bytes[i] as char).is_digit(radix) {
        i += 1;
    }
    if i == start {
        0
    } else {
        i
    }
}

fn hex_len(input: &str, limit: usize) -> usize {
    let bytes = input.as_bytes();
    let prefix = if limit > 2
        && bytes.len() > 2
        && bytes[0] == b'0'
        && matches!(bytes[1], b'x' | b'X')
        && bytes[2].is_ascii_hexdigit()
    {
        2
    } else {
        0
    };
    match integer_len(&input[prefix..], limit - prefix, 16, false) {
        0 => 0,
        len => prefix + len,
    }
}

fn float_len(input: &str, limit: usize) -> usize {
    let bytes = input.as_bytes();
    let max = bytes.len().min(limit);
    let mut i = 0;
    if i < max && matches!(bytes[i], b'+' | b'-') {
        i += 1;
    }

    for word in ["infinity", "inf", "nan"] {
        let end = i + word.len();
        if end <= max && bytes[i..end].eq_ignore_ascii_case(word.as_bytes()) {
            return end;
        }
    }

    let start = i;
    while i < max && bytes[i].is_ascii_digit() {
        i += 1;
    }
    let mut digits = i - start;
    if i < max && bytes[i] == b'.' {
        i += 1;
        let fraction = i;
        while i < max && bytes[i].is_ascii_digit() {
            i += 1;
        }
        digits += i - fraction;
    }
    if digits == 0 {
        return 0;
    }

    if i < max && matches!(bytes[i], b'e' | b'E') {
        let mut j = i + 1;
        if j < max && matches!(bytes[j], b'+' | b'-') {
            j += 1;
        }
        let exponent_start = j;
        while j < max && bytes[j].is_ascii_digit() {
            j += 1;
        }
        if j > exponent_start {
            i = j;
        }
    }
    i
}

#[cfg(test)]
mod tests {
    use super::*;

    fn render(format: &str, values: &[Value]) -> String {
        CFormat::parse(format).unwrap().format(values).unwrap()
    }

    #[test]
    fn fixed_precision_row() {
        let row = render(
            "%.1lf\t%.1lf\n",
            &[Value::Float(50.0), Value::Float(60.0)],
        );
        assert_eq!(row, "50.0\t60.0\n");
    }

    #[test]
    fn literal_escapes_are_interpreted() {
        let row = render(r"%d\t%d\n", &[Value::Int(1), Value::Int(2)]);
        assert_eq!(row, "1\t2\n");
    }

    #[test]
    fn general_format_trims_zeros() {
        assert_eq!(render("%g", &[Value::Float(50.0)]), "50");
        assert_eq!(render("%g", &[Value::Float(0.0001)]), "0.0001");
        assert_eq!(render("%g", &[Value::Float(1234567.0)]), "1.23457e+06");
        assert_eq!(render("%g", &[Value::Float(0.0)]), "0");
        assert_eq!(render("%.3G", &[Value::Float(0.000012345)]), "1.23E-05");
    }

    #[test]
    fn exponent_format_has_two_digit_exponent() {
        assert_eq!(render("%e", &[Value::Float(15.0)]), "1.500000e+01");
        assert_eq!(render("%.2E", &[Value::Float(-0.5)]), "-5.00E-01");
    }

    #[test]
    fn width_flags_and_padding() {
        assert_eq!(render("[%5d]", &[Value::Int(42)]), "[   42]");
        assert_eq!(render("[%-5d]", &[Value::Int(42)]), "[42   ]");
        assert_eq!(render("[%05.1f]", &[Value::Float(-2.5)]), "[-02.5]");
        assert_eq!(render("[%+d]", &[Value::Int(7)]), "[+7]");
        assert_eq!(render("[%6s]", &[Value::Str("abc".into())]), "[   abc]");
        assert_eq!(render("%#x %o", &[Value::Int(255), Value::Int(8)]), "0xff 10");
        assert_eq!(render("100%%", &[]), "100%");
    }

    #[test]
    fn integers_accept_floats_and_bools() {
        assert_eq!(render("%d %d", &[Value::Float(3.9), Value::Bool(true)]), "3 1");
        assert_eq!(render("%.2f", &[Value::Int(3)]), "3.00");
    }

    #[test]
    fn value_count_must_match() {
        let format = CFormat::parse("%d %d").unwrap();
        assert_eq!(format.conversions(), 2);
        assert!(format.format(&[Value::Int(1)]).is_err());
    }

    #[test]
    fn text_value_rejected_by_numeric_conversion() {
        let format = CFormat::parse("%f").unwrap();
        assert!(format.format(&[Value::Str("abc".into())]).is_err());
    }

    #[test]
    fn parse_rejects_unknown_conversion() {
        assert!(matches!(
            CFormat::parse("%y"),
            Err(RouterError::Format { .. })
        ));
        assert!(CFormat::parse("%.2").is_err());
    }

    #[test]
    fn scan_reads_what_format_writes() {
        let format = CFormat::parse("%.1lf\t%.1lf\n").unwrap();
        let values = format.scan("50.0\t60.0\n").unwrap();
        assert_eq!(values, vec![Value::Float(50.0), Value::Float(60.0)]);
    }

    #[test]
    fn scan_mixed_conversions() {
        let format = CFormat::parse("%s %d,%x,%g").unwrap();
        let values = format.scan("  pump 12,0x1f,1e3").unwrap();
        assert_eq!(
            values,
            vec![
                Value::Str("pump".into()),
                Value::Int(12),
                Value::Int(31),
                Value::Float(1000.0),
            ]
        );
    }

    #[test]
    fn scan_width_limits_token() {
        let format = CFormat::parse("%2d%d").unwrap();
        assert_eq!(
            format.scan("12345").unwrap(),
            vec![Value::Int(12), Value::Int(345)]
        );
    }

    #[test]
    fn scan_reports_literal_mismatch() {
        let format = CFormat::parse("%d,%d").unwrap();
        let err = format.scan("1;2").unwrap_err();
        assert!(err.0.contains("expected ','"));
    }

    #[test]
    fn scan_reports_missing_field() {
        let format = CFormat::parse("%f %f").unwrap();
        assert!(format.scan("1.5").is_err());
        assert!(format.scan("abc 1.0").is_err());
    }
}
