//! Printf-compatible formatting.
//!
//! The journal and diagnostic paths format with C-style conversion
//! specifications rather than `format!`, so specifications can be carried
//! as plain strings in configuration and log templates. The recognized
//! grammar is
//!
//! ```text
//! % flags* width? ('.' precision)? length? specifier
//! ```
//!
//! with flags `- + space # 0 '` plus two extensions: `@` canonically
//! left-pads the value to the natural width of its integer type (a 16-bit
//! value printed with `%@hx` renders as `0x00FF`), and `~` approximates the
//! value with an SI suffix, dividing by 1024 through the units
//! `"" K M G T P E Z Y`. Length modifiers `hh h l ll j z t L` and the
//! size-named `I8 I16 I32 I64 IRG` select the natural width. Specifiers:
//! `d i u b o x X f F e E g G a A c s p n`.

use std::fmt::Write as _;

use crate::error::{Error, Result};

const APPROXIMATION_UNITS: [&str; 9] = ["", "K", "M", "G", "T", "P", "E", "Z", "Y"];

/// One argument to a conversion specification.
///
/// `%n` writes the number of bytes produced so far back into its `Count`
/// slot, which is why the argument slice is taken mutably.
#[derive(Debug, Clone, PartialEq)]
pub enum FormatArg<'a> {
    Int(i64),
    Uint(u64),
    Float(f64),
    Char(char),
    Str(&'a str),
    Pointer(usize),
    Count(usize),
}

#[derive(Debug, Default, Clone, Copy)]
struct Flags {
    minus: bool,
    plus: bool,
    space: bool,
    hash: bool,
    zero: bool,
    apostrophe: bool,
    canonical: bool,
    approximate: bool,
}

#[derive(Debug, Clone, Copy)]
struct Conversion {
    flags: Flags,
    width: Option<usize>,
    precision: Option<usize>,
    bits: u32,
    specifier: char,
}

struct Parser<'a> {
    chars: std::iter::Peekable<std::str::Chars<'a>>,
}

impl<'a> Parser<'a> {
    fn new(spec: &'a str) -> Self {
        Self {
            chars: spec.chars().peekable(),
        }
    }

    fn next(&mut self) -> Option<char> {
        self.chars.next()
    }

    fn parse_number(&mut self, first: Option<char>) -> usize {
        let mut value = first.and_then(|c| c.to_digit(10)).unwrap_or(0) as usize;
        while let Some(c) = self.chars.peek().copied() {
            let Some(digit) = c.to_digit(10) else { break };
            self.chars.next();
            value = value.saturating_mul(10).saturating_add(digit as usize);
        }
        value
    }
}

fn take_arg<'a, 'b>(
    args: &'b mut [FormatArg<'a>],
    index: &mut usize,
) -> Result<&'b mut FormatArg<'a>> {
    let arg = args.get_mut(*index).ok_or(Error::Invalid)?;
    *index += 1;
    Ok(arg)
}

fn arg_as_unsigned(arg: &FormatArg<'_>, bits: u32) -> Result<u64> {
    let value = match arg {
        FormatArg::Uint(v) => *v,
        FormatArg::Int(v) => *v as u64,
        FormatArg::Pointer(v) => *v as u64,
        FormatArg::Char(c) => u64::from(u32::from(*c)),
        _ => return Err(Error::Invalid),
    };
    if bits >= 64 {
        Ok(value)
    } else {
        Ok(value & ((1u64 << bits) - 1))
    }
}

fn arg_as_signed(arg: &FormatArg<'_>, bits: u32) -> Result<i64> {
    let value = match arg {
        FormatArg::Int(v) => *v,
        FormatArg::Uint(v) => *v as i64,
        FormatArg::Char(c) => i64::from(u32::from(*c)),
        _ => return Err(Error::Invalid),
    };
    if bits >= 64 {
        Ok(value)
    } else {
        // Truncate then sign-extend to the natural width.
        let shift = 64 - bits;
        Ok((value << shift) >> shift)
    }
}

fn arg_as_float(arg: &FormatArg<'_>) -> Result<f64> {
    match arg {
        FormatArg::Float(v) => Ok(*v),
        FormatArg::Int(v) => Ok(*v as f64),
        FormatArg::Uint(v) => Ok(*v as f64),
        _ => Err(Error::Invalid),
    }
}

/// The number of digits needed to render the all-ones value of `bits` in
/// `base`; this is the canonical field width the `@` flag pads to.
fn canonical_digits(bits: u32, base: u32) -> usize {
    match base {
        2 => bits as usize,
        8 => bits.div_ceil(3) as usize,
        16 => bits.div_ceil(4) as usize,
        10 => match bits {
            8 => 3,
            16 => 5,
            32 => 10,
            _ => 20,
        },
        _ => 0,
    }
}

fn digits_in_base(mut value: u64, base: u32, upper: bool) -> String {
    if !matches!(base, 2 | 8 | 10 | 16) {
        // Unreachable from the public grammar; kept as the single point
        // that enforces the supported bases.
        return String::new();
    }
    let table: &[u8; 16] = if upper {
        b"0123456789ABCDEF"
    } else {
        b"0123456789abcdef"
    };
    let mut digits = Vec::new();
    loop {
        digits.push(table[(value % u64::from(base)) as usize]);
        value /= u64::from(base);
        if value == 0 {
            break;
        }
    }
    digits.reverse();
    String::from_utf8(digits).expect("digit table is ASCII")
}

fn group_thousands(digits: &str) -> String {
    let mut grouped = String::with_capacity(digits.len() + digits.len() / 3);
    let offset = digits.len() % 3;
    for (index, c) in digits.chars().enumerate() {
        if index != 0 && (index + 3 - offset) % 3 == 0 {
            grouped.push(',');
        }
        grouped.push(c);
    }
    grouped
}

fn pad_into(output: &mut String, body: &str, sign: &str, prefix: &str, conv: &Conversion) {
    let total = sign.len() + prefix.len() + body.len();
    let width = conv.width.unwrap_or(0);
    let padding = width.saturating_sub(total);

    if conv.flags.minus {
        output.push_str(sign);
        output.push_str(prefix);
        output.push_str(body);
        for _ in 0..padding {
            output.push(' ');
        }
    } else if conv.flags.zero && conv.precision.is_none() {
        // Zero padding goes between the prefix and the digits.
        output.push_str(sign);
        output.push_str(prefix);
        for _ in 0..padding {
            output.push('0');
        }
        output.push_str(body);
    } else {
        for _ in 0..padding {
            output.push(' ');
        }
        output.push_str(sign);
        output.push_str(prefix);
        output.push_str(body);
    }
}

fn format_integer(
    output: &mut String,
    magnitude: u64,
    negative: bool,
    base: u32,
    upper: bool,
    conv: &Conversion,
) -> Result<()> {
    if !matches!(base, 2 | 8 | 10 | 16) {
        return Err(Error::Invalid);
    }

    let mut magnitude = magnitude;
    let mut unit = "";
    if conv.flags.approximate {
        let mut index = 0;
        while magnitude >= 1024 && index + 1 < APPROXIMATION_UNITS.len() {
            magnitude /= 1024;
            index += 1;
        }
        unit = APPROXIMATION_UNITS[index];
    }

    let mut body = digits_in_base(magnitude, base, upper);

    if let Some(precision) = conv.precision {
        while body.len() < precision {
            body.insert(0, '0');
        }
    }

    if conv.flags.canonical {
        let natural = canonical_digits(conv.bits, base);
        while body.len() < natural {
            body.insert(0, '0');
        }
    }

    if conv.flags.apostrophe && base == 10 {
        body = group_thousands(&body);
    }

    body.push_str(unit);

    let sign = if negative {
        "-"
    } else if conv.flags.plus && base == 10 {
        "+"
    } else if conv.flags.space && base == 10 {
        " "
    } else {
        ""
    };

    // The canonical form always carries the radix prefix a reader needs to
    // interpret the padded digits.
    let wants_prefix = conv.flags.hash || conv.flags.canonical;
    let prefix = if wants_prefix {
        match (base, upper) {
            (16, false) => "0x",
            (16, true) => "0X",
            (8, _) => "0",
            (2, false) => "0b",
            (2, true) => "0B",
            _ => "",
        }
    } else {
        ""
    };

    pad_into(output, &body, sign, prefix, conv);
    Ok(())
}

fn c_style_exponent(raw: &str) -> String {
    // Rust renders `2.5e2`; C requires a sign and at least two exponent
    // digits: `2.5e+02`.
    let Some(position) = raw.find(['e', 'E']) else {
        return raw.to_string();
    };
    let (mantissa, exponent) = raw.split_at(position);
    let marker = &exponent[..1];
    let exponent = &exponent[1..];
    let (sign, digits) = match exponent.strip_prefix('-') {
        Some(rest) => ("-", rest),
        None => ("+", exponent.trim_start_matches('+')),
    };
    if digits.len() < 2 {
        format!("{mantissa}{marker}{sign}0{digits}")
    } else {
        format!("{mantissa}{marker}{sign}{digits}")
    }
}

fn format_float(output: &mut String, value: f64, conv: &Conversion) -> Result<()> {
    let upper = conv.specifier.is_ascii_uppercase();
    let negative = value.is_sign_negative();
    let magnitude = value.abs();

    let sign = if negative {
        "-"
    } else if conv.flags.plus {
        "+"
    } else if conv.flags.space {
        " "
    } else {
        ""
    };

    if magnitude.is_nan() {
        let body = if upper { "NAN" } else { "nan" };
        pad_into(output, body, if negative { "-" } else { "" }, "", conv);
        return Ok(());
    }
    if magnitude.is_infinite() {
        let body = if upper { "INF" } else { "inf" };
        pad_into(output, body, sign, "", conv);
        return Ok(());
    }

    let precision = conv.precision.unwrap_or(6);
    let body = match conv.specifier.to_ascii_lowercase() {
        'f' => format!("{magnitude:.precision$}"),
        'e' => c_style_exponent(&format!("{magnitude:.precision$e}")),
        'g' => {
            let significant = precision.max(1);
            let exponent = if magnitude == 0.0 {
                0
            } else {
                magnitude.log10().floor() as i32
            };
            let mut rendered = if exponent < -4 || exponent >= significant as i32 {
                c_style_exponent(&format!("{:.*e}", significant - 1, magnitude))
            } else {
                let decimals = (significant as i32 - 1 - exponent).max(0) as usize;
                format!("{magnitude:.decimals$}")
            };
            if !conv.flags.hash && rendered.contains('.') {
                // Strip trailing zeros, then a bare point, from the
                // fractional part only.
                if let Some(marker) = rendered.find(['e', 'E']) {
                    let (head, tail) = rendered.split_at(marker);
                    let head = head.trim_end_matches('0').trim_end_matches('.');
                    rendered = format!("{head}{tail}");
                } else {
                    rendered = rendered
                        .trim_end_matches('0')
                        .trim_end_matches('.')
                        .to_string();
                }
            }
            rendered
        }
        'a' => format_hex_float(magnitude, conv.precision),
        _ => return Err(Error::Invalid),
    };

    let body = if upper { body.to_uppercase() } else { body };
    let prefix = if conv.specifier.to_ascii_lowercase() == 'a' {
        if upper {
            "0X"
        } else {
            "0x"
        }
    } else {
        ""
    };
    pad_into(output, &body, sign, prefix, conv);
    Ok(())
}

fn format_hex_float(value: f64, precision: Option<usize>) -> String {
    if value == 0.0 {
        return "0p+0".to_string();
    }

    let bits = value.to_bits();
    let raw_exponent = ((bits >> 52) & 0x7ff) as i64;
    let mantissa = bits & 0x000f_ffff_ffff_ffff;

    let (leading, exponent, mantissa) = if raw_exponent == 0 {
        // Subnormal.
        (0u64, -1022i64, mantissa)
    } else {
        (1u64, raw_exponent - 1023, mantissa)
    };

    let mut hex = format!("{mantissa:013x}");
    match precision {
        Some(p) if p < hex.len() => hex.truncate(p),
        Some(p) => {
            while hex.len() < p {
                hex.push('0');
            }
        }
        None => {
            while hex.ends_with('0') && hex.len() > 0 {
                hex.pop();
            }
        }
    }

    let exponent_sign = if exponent < 0 { '-' } else { '+' };
    if hex.is_empty() {
        format!("{leading}p{exponent_sign}{}", exponent.abs())
    } else {
        format!("{leading}.{hex}p{exponent_sign}{}", exponent.abs())
    }
}

/// Format `spec` with `args` appending to `output`.
///
/// Returns the number of bytes appended. `%n` writes the running byte count
/// into its argument slot.
pub fn write_str(output: &mut String, spec: &str, args: &mut [FormatArg<'_>]) -> Result<usize> {
    let start = output.len();
    let mut parser = Parser::new(spec);
    let mut arg_index = 0usize;

    while let Some(c) = parser.next() {
        if c != '%' {
            output.push(c);
            continue;
        }

        match parser.chars.peek() {
            Some('%') => {
                parser.next();
                output.push('%');
                continue;
            }
            None => return Err(Error::Invalid),
            _ => {}
        }

        let mut flags = Flags::default();
        loop {
            match parser.chars.peek() {
                Some('-') => flags.minus = true,
                Some('+') => flags.plus = true,
                Some(' ') => flags.space = true,
                Some('#') => flags.hash = true,
                Some('0') => flags.zero = true,
                Some('\'') => flags.apostrophe = true,
                Some('@') => flags.canonical = true,
                Some('~') => flags.approximate = true,
                _ => break,
            }
            parser.next();
        }

        let width = match parser.chars.peek() {
            Some('*') => {
                parser.next();
                let arg = take_arg(args, &mut arg_index)?;
                Some(arg_as_unsigned(arg, 64)? as usize)
            }
            Some(c) if c.is_ascii_digit() => {
                let first = parser.next();
                Some(parser.parse_number(first))
            }
            _ => None,
        };

        let precision = if parser.chars.peek() == Some(&'.') {
            parser.next();
            match parser.chars.peek() {
                Some('*') => {
                    parser.next();
                    let arg = take_arg(args, &mut arg_index)?;
                    Some(arg_as_unsigned(arg, 64)? as usize)
                }
                _ => Some(parser.parse_number(None)),
            }
        } else {
            None
        };

        let bits = match parser.chars.peek() {
            Some('h') => {
                parser.next();
                if parser.chars.peek() == Some(&'h') {
                    parser.next();
                    8
                } else {
                    16
                }
            }
            Some('l') => {
                parser.next();
                if parser.chars.peek() == Some(&'l') {
                    parser.next();
                }
                64
            }
            Some('j') | Some('z') | Some('t') | Some('L') => {
                parser.next();
                64
            }
            Some('I') => {
                parser.next();
                match parser.next() {
                    Some('8') => 8,
                    Some('1') => {
                        if parser.next() != Some('6') {
                            return Err(Error::Invalid);
                        }
                        16
                    }
                    Some('3') => {
                        if parser.next() != Some('2') {
                            return Err(Error::Invalid);
                        }
                        32
                    }
                    Some('6') => {
                        if parser.next() != Some('4') {
                            return Err(Error::Invalid);
                        }
                        64
                    }
                    Some('R') => {
                        if parser.next() != Some('G') {
                            return Err(Error::Invalid);
                        }
                        64
                    }
                    _ => return Err(Error::Invalid),
                }
            }
            _ => 32,
        };

        let specifier = parser.next().ok_or(Error::Invalid)?;
        let conv = Conversion {
            flags,
            width,
            precision,
            bits,
            specifier,
        };

        match specifier {
            'd' | 'i' => {
                let value = arg_as_signed(take_arg(args, &mut arg_index)?, bits)?;
                format_integer(output, value.unsigned_abs(), value < 0, 10, false, &conv)?;
            }
            'u' => {
                let value = arg_as_unsigned(take_arg(args, &mut arg_index)?, bits)?;
                format_integer(output, value, false, 10, false, &conv)?;
            }
            'b' => {
                let value = arg_as_unsigned(take_arg(args, &mut arg_index)?, bits)?;
                format_integer(output, value, false, 2, false, &conv)?;
            }
            'o' => {
                let value = arg_as_unsigned(take_arg(args, &mut arg_index)?, bits)?;
                format_integer(output, value, false, 8, false, &conv)?;
            }
            'x' => {
                let value = arg_as_unsigned(take_arg(args, &mut arg_index)?, bits)?;
                format_integer(output, value, false, 16, false, &conv)?;
            }
            'X' => {
                let value = arg_as_unsigned(take_arg(args, &mut arg_index)?, bits)?;
                format_integer(output, value, false, 16, true, &conv)?;
            }
            'f' | 'F' | 'e' | 'E' | 'g' | 'G' | 'a' | 'A' => {
                let value = arg_as_float(take_arg(args, &mut arg_index)?)?;
                format_float(output, value, &conv)?;
            }
            'c' => {
                let arg = take_arg(args, &mut arg_index)?;
                let c = match arg {
                    FormatArg::Char(c) => *c,
                    FormatArg::Int(v) => {
                        char::from_u32(u32::try_from(*v).map_err(|_| Error::Invalid)?)
                            .ok_or(Error::Invalid)?
                    }
                    FormatArg::Uint(v) => {
                        char::from_u32(u32::try_from(*v).map_err(|_| Error::Invalid)?)
                            .ok_or(Error::Invalid)?
                    }
                    _ => return Err(Error::Invalid),
                };
                let mut buffer = [0u8; 4];
                pad_into(output, c.encode_utf8(&mut buffer), "", "", &conv);
            }
            's' => {
                let arg = take_arg(args, &mut arg_index)?;
                let FormatArg::Str(s) = arg else {
                    return Err(Error::Invalid);
                };
                let s: &str = *s;
                let truncated = match precision {
                    Some(p) if p < s.len() => &s[..p],
                    _ => s,
                };
                // Precision already applied; pad_into must not zero-fill.
                let mut string_conv = conv;
                string_conv.flags.zero = false;
                string_conv.precision = None;
                pad_into(output, truncated, "", "", &string_conv);
            }
            'p' => {
                let arg = take_arg(args, &mut arg_index)?;
                let FormatArg::Pointer(p) = arg else {
                    return Err(Error::Invalid);
                };
                let mut pointer_conv = conv;
                pointer_conv.flags.hash = true;
                pointer_conv.bits = usize::BITS;
                format_integer(output, *p as u64, false, 16, false, &pointer_conv)?;
            }
            'n' => {
                let written = output.len() - start;
                let arg = take_arg(args, &mut arg_index)?;
                match arg {
                    FormatArg::Count(slot) => *slot = written,
                    _ => return Err(Error::Invalid),
                }
            }
            _ => return Err(Error::Invalid),
        }
    }

    Ok(output.len() - start)
}

/// Format `spec` with `args` into a fresh string.
pub fn format(spec: &str, args: &mut [FormatArg<'_>]) -> Result<String> {
    let mut output = String::new();
    write_str(&mut output, spec, args)?;
    Ok(output)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn render(spec: &str, args: &mut [FormatArg<'_>]) -> String {
        format(spec, args).unwrap()
    }

    #[test]
    fn test_plain_text_and_percent() {
        assert_eq!(render("100%% done", &mut []), "100% done");
    }

    #[test]
    fn test_signed_decimal() {
        assert_eq!(render("%d", &mut [FormatArg::Int(42)]), "42");
        assert_eq!(render("%d", &mut [FormatArg::Int(-42)]), "-42");
        assert_eq!(render("%+d", &mut [FormatArg::Int(42)]), "+42");
        assert_eq!(render("% d", &mut [FormatArg::Int(42)]), " 42");
        assert_eq!(render("%5d", &mut [FormatArg::Int(42)]), "   42");
        assert_eq!(render("%-5d|", &mut [FormatArg::Int(42)]), "42   |");
        assert_eq!(render("%05d", &mut [FormatArg::Int(-42)]), "-0042");
    }

    #[test]
    fn test_unsigned_bases() {
        assert_eq!(render("%u", &mut [FormatArg::Uint(42)]), "42");
        assert_eq!(render("%x", &mut [FormatArg::Uint(255)]), "ff");
        assert_eq!(render("%X", &mut [FormatArg::Uint(255)]), "FF");
        assert_eq!(render("%#x", &mut [FormatArg::Uint(255)]), "0xff");
        assert_eq!(render("%o", &mut [FormatArg::Uint(8)]), "10");
        assert_eq!(render("%b", &mut [FormatArg::Uint(5)]), "101");
        assert_eq!(render("%#b", &mut [FormatArg::Uint(5)]), "0b101");
    }

    #[test]
    fn test_grouping_flag() {
        assert_eq!(
            render("%'d", &mut [FormatArg::Int(1234567)]),
            "1,234,567"
        );
        assert_eq!(render("%'d", &mut [FormatArg::Int(123)]), "123");
    }

    #[test]
    fn test_length_modifiers_truncate() {
        assert_eq!(render("%hhu", &mut [FormatArg::Uint(0x1ff)]), "255");
        assert_eq!(render("%hd", &mut [FormatArg::Int(0x1_0001)]), "1");
        assert_eq!(
            render("%lu", &mut [FormatArg::Uint(u64::MAX)]),
            u64::MAX.to_string()
        );
    }

    #[test]
    fn test_canonical_extension() {
        // The motivating example: a 16-bit value in hex pads to the natural
        // width of the type, prefix included.
        assert_eq!(render("%@hX", &mut [FormatArg::Uint(0xff)]), "0X00FF");
        assert_eq!(render("%@hhx", &mut [FormatArg::Uint(0xf)]), "0x0f");
        assert_eq!(
            render("%@b", &mut [FormatArg::Uint(5)]),
            format!("0b{:032b}", 5)
        );
    }

    #[test]
    fn test_approximation_extension() {
        assert_eq!(render("%~u", &mut [FormatArg::Uint(512)]), "512");
        assert_eq!(render("%~u", &mut [FormatArg::Uint(2048)]), "2K");
        assert_eq!(
            render("%~u", &mut [FormatArg::Uint(3 * 1024 * 1024)]),
            "3M"
        );
        assert_eq!(
            render("%~lu", &mut [FormatArg::Uint(5 * 1024 * 1024 * 1024)]),
            "5G"
        );
    }

    #[test]
    fn test_floats() {
        assert_eq!(render("%f", &mut [FormatArg::Float(2.5)]), "2.500000");
        assert_eq!(render("%.2f", &mut [FormatArg::Float(2.5)]), "2.50");
        assert_eq!(
            render("%e", &mut [FormatArg::Float(250.0)]),
            "2.500000e+02"
        );
        assert_eq!(render("%E", &mut [FormatArg::Float(250.0)]), "2.500000E+02");
        assert_eq!(render("%g", &mut [FormatArg::Float(0.0001)]), "0.0001");
        assert_eq!(render("%g", &mut [FormatArg::Float(1e7)]), "1e+07");
        assert_eq!(render("%a", &mut [FormatArg::Float(1.0)]), "0x1p+0");
        assert_eq!(render("%a", &mut [FormatArg::Float(0.5)]), "0x1p-1");
    }

    #[test]
    fn test_char_and_string() {
        assert_eq!(render("%c", &mut [FormatArg::Char('A')]), "A");
        assert_eq!(
            render("%s world", &mut [FormatArg::Str("hello")]),
            "hello world"
        );
        assert_eq!(render("%.3s", &mut [FormatArg::Str("hello")]), "hel");
        assert_eq!(render("%8s|", &mut [FormatArg::Str("hi")]), "      hi|");
        assert_eq!(render("%-8s|", &mut [FormatArg::Str("hi")]), "hi      |");
    }

    #[test]
    fn test_pointer() {
        assert_eq!(render("%p", &mut [FormatArg::Pointer(0xdead)]), "0xdead");
    }

    #[test]
    fn test_count_writes_back() {
        let mut args = [FormatArg::Str("abc"), FormatArg::Count(0)];
        assert_eq!(render("%s%n!", &mut args), "abc!");
        assert_eq!(args[1], FormatArg::Count(3));
    }

    #[test]
    fn test_star_width_and_precision() {
        assert_eq!(
            render("%*d", &mut [FormatArg::Uint(5), FormatArg::Int(42)]),
            "   42"
        );
        assert_eq!(
            render("%.*f", &mut [FormatArg::Uint(1), FormatArg::Float(2.55)]),
            "2.5"
        );
    }

    #[test]
    fn test_invalid_specifier() {
        assert_eq!(format("%q", &mut [FormatArg::Int(1)]), Err(Error::Invalid));
        assert_eq!(format("%", &mut []), Err(Error::Invalid));
        assert_eq!(format("%d", &mut []), Err(Error::Invalid));
    }

    #[test]
    fn test_type_mismatch() {
        assert_eq!(
            format("%s", &mut [FormatArg::Int(1)]),
            Err(Error::Invalid)
        );
        assert_eq!(
            format("%f", &mut [FormatArg::Str("x")]),
            Err(Error::Invalid)
        );
    }
}
