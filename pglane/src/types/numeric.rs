//! The `numeric` wire representation.
use bytes::{Buf, BufMut, Bytes, BytesMut};

use super::{CodecError, TypeCodec, TypeRegistry, utf8};
use crate::{
    postgres::{Oid, oid},
    value::Value,
};

pub(super) fn register(registry: &mut TypeRegistry) {
    registry.register(oid::NUMERIC, TypeCodec {
        decode_text: Some(numeric_from_text),
        encode_text: Some(numeric_to_text),
        decode_binary: Some(numeric_from_binary),
        encode_binary: Some(numeric_to_binary),
    });
}

fn numeric_from_text(_: &TypeRegistry, _: Oid, bytes: Bytes) -> Result<Value, CodecError> {
    utf8(&bytes)?.parse::<PgNumeric>().map(Value::Numeric)
}

fn numeric_to_text(_: &TypeRegistry, value: &Value, buf: &mut BytesMut) -> Result<(), CodecError> {
    match value {
        Value::Numeric(v) => buf.extend_from_slice(v.to_string().as_bytes()),
        _ => return Err(CodecError::invalid("numeric codec got a mismatched value")),
    }
    Ok(())
}

fn numeric_from_binary(_: &TypeRegistry, _: Oid, bytes: Bytes) -> Result<Value, CodecError> {
    PgNumeric::from_wire(bytes).map(Value::Numeric)
}

fn numeric_to_binary(_: &TypeRegistry, value: &Value, buf: &mut BytesMut) -> Result<(), CodecError> {
    match value {
        Value::Numeric(v) => v.write_wire(buf),
        _ => return Err(CodecError::invalid("numeric codec got a mismatched value")),
    }
    Ok(())
}

/// Wire representation of a postgres `NUMERIC` value.
///
/// `(ndigits, weight, sign, dscale, digit[ndigits])` where each digit is a
/// base-10000 value. The first digit carries the power `10000^weight`;
/// `dscale` is the number of decimal fraction digits displayed.
///
/// Keeping the wire decomposition instead of converting into a float or a
/// normalized decimal preserves every digit, so re-encoding a decoded value
/// reproduces the identical byte sequence.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PgNumeric {
    pub sign: PgNumericSign,
    /// Display scale, the number of decimal fraction digits.
    pub scale: i16,
    /// Power of 10000 of the first digit.
    pub weight: i16,
    /// Base-10000 digits, most significant first.
    pub digits: Vec<i16>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum PgNumericSign {
    Positive = 0x0000,
    Negative = 0x4000,
    NotANumber = 0xC000,
}

impl PgNumericSign {
    fn from_wire(sign: u16) -> Result<PgNumericSign, CodecError> {
        match sign {
            0x0000 => Ok(PgNumericSign::Positive),
            0x4000 => Ok(PgNumericSign::Negative),
            0xC000 => Ok(PgNumericSign::NotANumber),
            _ => Err(CodecError::invalid("unknown numeric sign")),
        }
    }
}

impl PgNumeric {
    /// Decode the binary wire form.
    pub fn from_wire(mut bytes: Bytes) -> Result<Self, CodecError> {
        if bytes.remaining() < 8 {
            return Err(CodecError::length("numeric", 8, bytes.remaining()));
        }
        let ndigits = bytes.get_u16();
        let weight = bytes.get_i16();
        let sign = PgNumericSign::from_wire(bytes.get_u16())?;
        let scale = bytes.get_i16();

        if bytes.remaining() < ndigits as usize * 2 {
            return Err(CodecError::length(
                "numeric digits",
                ndigits as usize * 2,
                bytes.remaining(),
            ));
        }
        let digits = (0..ndigits).map(|_| bytes.get_i16()).collect::<Vec<_>>();
        if digits.iter().any(|d| !(0..10_000).contains(d)) {
            return Err(CodecError::invalid("numeric digit out of base-10000"));
        }

        Ok(PgNumeric { sign, scale, weight, digits })
    }

    /// Encode the binary wire form.
    pub fn write_wire(&self, buf: &mut BytesMut) {
        buf.put_u16(self.digits.len() as u16);
        buf.put_i16(self.weight);
        buf.put_u16(self.sign as u16);
        buf.put_i16(self.scale);
        for digit in &self.digits {
            buf.put_i16(*digit);
        }
    }
}

impl std::fmt::Display for PgNumeric {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.sign == PgNumericSign::NotANumber {
            return f.write_str("NaN");
        }
        if self.sign == PgNumericSign::Negative {
            f.write_str("-")?;
        }

        // integer part: digit i carries power weight - i
        if self.weight < 0 {
            f.write_str("0")?;
        } else {
            for i in 0..=self.weight as usize {
                let digit = self.digits.get(i).copied().unwrap_or(0);
                if i == 0 {
                    write!(f, "{digit}")?;
                } else {
                    write!(f, "{digit:04}")?;
                }
            }
        }

        // fraction part: exactly `scale` decimal digits
        if self.scale > 0 {
            f.write_str(".")?;
            let mut frac = String::with_capacity(self.scale as usize + 4);
            let mut idx = self.weight as isize + 1;
            while frac.len() < self.scale as usize {
                let digit = usize::try_from(idx)
                    .ok()
                    .and_then(|i| self.digits.get(i).copied())
                    .unwrap_or(0);
                frac.push_str(&format!("{digit:04}"));
                idx += 1;
            }
            frac.truncate(self.scale as usize);
            f.write_str(&frac)?;
        }

        Ok(())
    }
}

impl std::str::FromStr for PgNumeric {
    type Err = CodecError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let err = || CodecError::parse("numeric", s);

        let text = s.trim();
        if text.eq_ignore_ascii_case("nan") {
            return Ok(PgNumeric {
                sign: PgNumericSign::NotANumber,
                scale: 0,
                weight: 0,
                digits: Vec::new(),
            });
        }

        let (sign, text) = match text.as_bytes().first() {
            Some(b'-') => (PgNumericSign::Negative, &text[1..]),
            Some(b'+') => (PgNumericSign::Positive, &text[1..]),
            _ => (PgNumericSign::Positive, text),
        };

        let (int_part, frac_part) = match text.split_once('.') {
            Some((i, f)) => (i, f),
            None => (text, ""),
        };
        if int_part.is_empty() && frac_part.is_empty() {
            return Err(err());
        }
        if !int_part.bytes().all(|b| b.is_ascii_digit())
            || !frac_part.bytes().all(|b| b.is_ascii_digit())
        {
            return Err(err());
        }
        let scale = i16::try_from(frac_part.len()).map_err(|_| err())?;

        // align both parts on base-10000 group boundaries around the point
        let mut groups = Vec::new();
        let lead = int_part.len().next_multiple_of(4) - int_part.len();
        let mut decimal = String::with_capacity(lead + int_part.len() + frac_part.len() + 4);
        decimal.extend(std::iter::repeat_n('0', lead));
        decimal.push_str(int_part);
        let weight_groups = decimal.len() / 4;
        decimal.push_str(frac_part);
        let tail = decimal.len().next_multiple_of(4) - decimal.len();
        decimal.extend(std::iter::repeat_n('0', tail));

        for chunk in decimal.as_bytes().chunks(4) {
            let mut digit = 0i16;
            for b in chunk {
                digit = digit * 10 + (b - b'0') as i16;
            }
            groups.push(digit);
        }

        let mut weight = weight_groups as i16 - 1;
        // the server stores no insignificant zero groups at either end
        let mut start = 0;
        while start < groups.len() && groups[start] == 0 {
            start += 1;
            weight -= 1;
        }
        let mut end = groups.len();
        while end > start && groups[end - 1] == 0 {
            end -= 1;
        }
        let digits = groups[start..end].to_vec();
        let weight = if digits.is_empty() { 0 } else { weight };
        let sign = if digits.is_empty() { PgNumericSign::Positive } else { sign };

        Ok(PgNumeric { sign, scale, weight, digits })
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn parse(s: &str) -> PgNumeric {
        s.parse().unwrap()
    }

    #[test]
    fn display_preserves_every_digit() {
        // SELECT 100000000000000000000000000000000::numeric(38,0)
        let n = PgNumeric {
            sign: PgNumericSign::Positive,
            scale: 0,
            weight: 8,
            digits: vec![1],
        };
        assert_eq!(n.to_string(), "100000000000000000000000000000000");

        // SELECT -1::numeric
        let n = PgNumeric {
            sign: PgNumericSign::Negative,
            scale: 0,
            weight: 0,
            digits: vec![1],
        };
        assert_eq!(n.to_string(), "-1");
    }

    #[test]
    fn display_scales() {
        let cases = [
            ("1.10", 0, vec![1, 1000], 2),
            ("-22.20", 0, vec![22, 2000], 2),
            ("444.40", 0, vec![444, 4000], 2),
            ("0.001", -1, vec![10], 3),
            ("0.00001", -2, vec![1000], 5),
            ("12345678.5", 1, vec![1234, 5678, 5000], 1),
        ];
        for (expect, weight, digits, scale) in cases {
            let sign = match expect.starts_with('-') {
                true => PgNumericSign::Negative,
                false => PgNumericSign::Positive,
            };
            let n = PgNumeric { sign, scale, weight, digits };
            assert_eq!(n.to_string(), expect);
        }
    }

    #[test]
    fn parse_round_trips_display() {
        for text in [
            "0", "1", "-1", "1.10", "-22.20", "444.40",
            "100000000000000000000000000000000",
            "0.001", "0.00001", "12345678.5", "NaN",
        ] {
            assert_eq!(parse(text).to_string(), text, "{text}");
        }
    }

    #[test]
    fn parse_matches_server_layout() {
        let n = parse("100000000000000000000000000000000");
        assert_eq!((n.weight, n.scale, n.digits.as_slice()), (8, 0, &[1][..]));

        let n = parse("444.40");
        assert_eq!((n.weight, n.scale, n.digits.as_slice()), (0, 2, &[444, 4000][..]));

        let n = parse("0.00");
        assert_eq!((n.weight, n.scale, n.digits.as_slice()), (0, 2, &[][..]));
        assert_eq!(n.to_string(), "0.00");
    }

    #[test]
    fn wire_round_trip_is_byte_identical() {
        let wire: &[u8] = &[
            0, 2, // ndigits
            0, 0, // weight
            0x40, 0, // sign negative
            0, 2, // dscale
            0, 22, 0x07, 0xd0, // 22, 2000
        ];
        let n = PgNumeric::from_wire(Bytes::from_static(wire)).unwrap();
        assert_eq!(n.to_string(), "-22.20");

        let mut buf = BytesMut::new();
        n.write_wire(&mut buf);
        assert_eq!(&buf[..], wire);
    }

    #[test]
    fn wire_rejects_truncation() {
        assert!(PgNumeric::from_wire(Bytes::from_static(&[0, 1, 0, 0])).is_err());
        assert!(PgNumeric::from_wire(Bytes::from_static(&[0, 2, 0, 0, 0, 0, 0, 0, 0, 1])).is_err());
    }
}
