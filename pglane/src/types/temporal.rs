//! Codecs for the temporal types, over the conversion engine in
//! [`crate::temporal`].
use bytes::{BufMut, Bytes, BytesMut};
use chrono::{DateTime, NaiveDate, NaiveDateTime, NaiveTime, Utc};

use super::{CodecError, TypeCodec, TypeRegistry, fixed, utf8};
use crate::{
    postgres::{Oid, oid},
    temporal::{self, TemporalError},
    value::{PgInterval, PgTimeTz, Value},
};

pub(super) fn register(registry: &mut TypeRegistry) {
    macro_rules! temporal {
        ($oid:expr, $from_text:ident, $to_text:ident, $from_bin:ident, $to_bin:ident) => {
            registry.register($oid, TypeCodec {
                decode_text: Some($from_text),
                encode_text: Some($to_text),
                decode_binary: Some($from_bin),
                encode_binary: Some($to_bin),
            });
        };
    }

    temporal!(oid::DATE, date_from_text, date_to_text, date_from_binary, date_to_binary);
    temporal!(oid::TIME, time_from_text, time_to_text, time_from_binary, time_to_binary);
    temporal!(oid::TIMETZ, timetz_from_text, timetz_to_text, timetz_from_binary, timetz_to_binary);
    temporal!(
        oid::TIMESTAMP,
        timestamp_from_text, timestamp_to_text, timestamp_from_binary, timestamp_to_binary
    );
    temporal!(
        oid::TIMESTAMPTZ,
        timestamptz_from_text, timestamptz_to_text, timestamptz_from_binary, timestamptz_to_binary
    );
    temporal!(
        oid::INTERVAL,
        interval_from_text, interval_to_text, interval_from_binary, interval_to_binary
    );
}

const DATE_FORMAT: &str = "%Y-%m-%d";
const TIME_FORMAT: &str = "%H:%M:%S%.f";
const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S%.f";
/// `%#z` covers the server's `+03` / `+03:30` style offsets.
const TIMESTAMPTZ_PARSE: &str = "%Y-%m-%d %H:%M:%S%.f%#z";

// ===== date =====

fn date_from_binary(_: &TypeRegistry, _: Oid, bytes: Bytes) -> Result<Value, CodecError> {
    let days = i32::from_be_bytes(fixed("date", &bytes)?);
    Ok(Value::Date(temporal::date_from_wire(days)?))
}

fn date_to_binary(_: &TypeRegistry, value: &Value, buf: &mut BytesMut) -> Result<(), CodecError> {
    buf.put_i32(temporal::date_to_wire(expect_date(value)?)?);
    Ok(())
}

fn date_from_text(_: &TypeRegistry, _: Oid, bytes: Bytes) -> Result<Value, CodecError> {
    let text = utf8(&bytes)?;
    NaiveDate::parse_from_str(text, DATE_FORMAT)
        .map(Value::Date)
        .map_err(|_| TemporalError::parse("date", text).into())
}

fn date_to_text(_: &TypeRegistry, value: &Value, buf: &mut BytesMut) -> Result<(), CodecError> {
    write_fmt(buf, format_args!("{}", expect_date(value)?.format(DATE_FORMAT)))
}

fn expect_date(value: &Value) -> Result<NaiveDate, CodecError> {
    match value {
        Value::Date(v) => Ok(*v),
        _ => Err(CodecError::invalid("date codec got a mismatched value")),
    }
}

// ===== time =====

fn time_from_binary(_: &TypeRegistry, _: Oid, bytes: Bytes) -> Result<Value, CodecError> {
    let us = i64::from_be_bytes(fixed("time", &bytes)?);
    Ok(Value::Time(temporal::time_from_wire(us)?))
}

fn time_to_binary(_: &TypeRegistry, value: &Value, buf: &mut BytesMut) -> Result<(), CodecError> {
    buf.put_i64(temporal::time_to_wire(expect_time(value)?));
    Ok(())
}

fn time_from_text(_: &TypeRegistry, _: Oid, bytes: Bytes) -> Result<Value, CodecError> {
    let text = utf8(&bytes)?;
    NaiveTime::parse_from_str(text, TIME_FORMAT)
        .map(Value::Time)
        .map_err(|_| TemporalError::parse("time", text).into())
}

fn time_to_text(_: &TypeRegistry, value: &Value, buf: &mut BytesMut) -> Result<(), CodecError> {
    write_fmt(buf, format_args!("{}", expect_time(value)?.format(TIME_FORMAT)))
}

fn expect_time(value: &Value) -> Result<NaiveTime, CodecError> {
    match value {
        Value::Time(v) => Ok(*v),
        _ => Err(CodecError::invalid("time codec got a mismatched value")),
    }
}

// ===== timetz =====

fn timetz_from_binary(_: &TypeRegistry, _: Oid, bytes: Bytes) -> Result<Value, CodecError> {
    let raw = fixed::<12>("timetz", &bytes)?;
    let us = i64::from_be_bytes(raw[..8].try_into().unwrap());
    let offset_seconds_west = i32::from_be_bytes(raw[8..].try_into().unwrap());
    Ok(Value::TimeTz(PgTimeTz {
        time: temporal::time_from_wire(us)?,
        offset_seconds_west,
    }))
}

fn timetz_to_binary(_: &TypeRegistry, value: &Value, buf: &mut BytesMut) -> Result<(), CodecError> {
    let v = expect_timetz(value)?;
    buf.put_i64(temporal::time_to_wire(v.time));
    buf.put_i32(v.offset_seconds_west);
    Ok(())
}

fn timetz_from_text(_: &TypeRegistry, _: Oid, bytes: Bytes) -> Result<Value, CodecError> {
    let text = utf8(&bytes)?;
    let err = || CodecError::from(TemporalError::parse("timetz", text));

    // the offset begins at the first sign character after the clock digits
    let at = text.rfind(['+', '-']).filter(|at| *at > 0).ok_or_else(err)?;
    let time = NaiveTime::parse_from_str(&text[..at], TIME_FORMAT).map_err(|_| err())?;
    let east = parse_offset(&text[at..]).ok_or_else(err)?;
    Ok(Value::TimeTz(PgTimeTz { time, offset_seconds_west: -east }))
}

fn timetz_to_text(_: &TypeRegistry, value: &Value, buf: &mut BytesMut) -> Result<(), CodecError> {
    let v = expect_timetz(value)?;
    write_fmt(buf, format_args!("{}", v.time.format(TIME_FORMAT)))?;

    let east = v.offset_seconds_east();
    let (sign, abs) = if east < 0 { ('-', -east) } else { ('+', east) };
    let (h, m, s) = (abs / 3600, abs % 3600 / 60, abs % 60);
    if s != 0 {
        write_fmt(buf, format_args!("{sign}{h:02}:{m:02}:{s:02}"))
    } else if m != 0 {
        write_fmt(buf, format_args!("{sign}{h:02}:{m:02}"))
    } else {
        write_fmt(buf, format_args!("{sign}{h:02}"))
    }
}

/// Parse `±HH`, `±HH:MM` or `±HH:MM:SS` into seconds east of Greenwich.
fn parse_offset(text: &str) -> Option<i32> {
    let (sign, rest) = match text.as_bytes().first()? {
        b'+' => (1, &text[1..]),
        b'-' => (-1, &text[1..]),
        _ => return None,
    };
    let mut parts = rest.split(':');
    let h: i32 = parts.next()?.parse().ok()?;
    let m: i32 = match parts.next() {
        Some(m) => m.parse().ok()?,
        None => 0,
    };
    let s: i32 = match parts.next() {
        Some(s) => s.parse().ok()?,
        None => 0,
    };
    if parts.next().is_some() {
        return None;
    }
    Some(sign * (h * 3600 + m * 60 + s))
}

fn expect_timetz(value: &Value) -> Result<PgTimeTz, CodecError> {
    match value {
        Value::TimeTz(v) => Ok(*v),
        _ => Err(CodecError::invalid("timetz codec got a mismatched value")),
    }
}

// ===== timestamp =====

fn timestamp_from_binary(_: &TypeRegistry, _: Oid, bytes: Bytes) -> Result<Value, CodecError> {
    let us = i64::from_be_bytes(fixed("timestamp", &bytes)?);
    Ok(Value::Timestamp(temporal::timestamp_from_wire(us)?))
}

fn timestamp_to_binary(_: &TypeRegistry, value: &Value, buf: &mut BytesMut) -> Result<(), CodecError> {
    buf.put_i64(temporal::timestamp_to_wire(expect_timestamp(value)?)?);
    Ok(())
}

fn timestamp_from_text(_: &TypeRegistry, _: Oid, bytes: Bytes) -> Result<Value, CodecError> {
    let text = utf8(&bytes)?;
    NaiveDateTime::parse_from_str(text, TIMESTAMP_FORMAT)
        .map(Value::Timestamp)
        .map_err(|_| TemporalError::parse("timestamp", text).into())
}

fn timestamp_to_text(_: &TypeRegistry, value: &Value, buf: &mut BytesMut) -> Result<(), CodecError> {
    write_fmt(
        buf,
        format_args!("{}", expect_timestamp(value)?.format(TIMESTAMP_FORMAT)),
    )
}

fn expect_timestamp(value: &Value) -> Result<NaiveDateTime, CodecError> {
    match value {
        Value::Timestamp(v) => Ok(*v),
        _ => Err(CodecError::invalid("timestamp codec got a mismatched value")),
    }
}

// ===== timestamptz =====

fn timestamptz_from_binary(_: &TypeRegistry, _: Oid, bytes: Bytes) -> Result<Value, CodecError> {
    let us = i64::from_be_bytes(fixed("timestamptz", &bytes)?);
    Ok(Value::TimestampTz(temporal::timestamptz_from_wire(us)?))
}

fn timestamptz_to_binary(_: &TypeRegistry, value: &Value, buf: &mut BytesMut) -> Result<(), CodecError> {
    buf.put_i64(temporal::timestamptz_to_wire(expect_timestamptz(value)?)?);
    Ok(())
}

/// Text rendering of a `timestamptz` is the server session's `TimeZone`
/// wall-clock; decoding trusts the offset the server attached and yields
/// the absolute instant.
fn timestamptz_from_text(_: &TypeRegistry, _: Oid, bytes: Bytes) -> Result<Value, CodecError> {
    let text = utf8(&bytes)?;
    DateTime::parse_from_str(text, TIMESTAMPTZ_PARSE)
        .map(|dt| Value::TimestampTz(dt.with_timezone(&Utc)))
        .map_err(|_| TemporalError::parse("timestamptz", text).into())
}

fn timestamptz_to_text(_: &TypeRegistry, value: &Value, buf: &mut BytesMut) -> Result<(), CodecError> {
    // parameters are sent as the UTC wall-clock with an explicit zero offset
    write_fmt(
        buf,
        format_args!("{}+00", expect_timestamptz(value)?.format(TIMESTAMP_FORMAT)),
    )
}

fn expect_timestamptz(value: &Value) -> Result<DateTime<Utc>, CodecError> {
    match value {
        Value::TimestampTz(v) => Ok(*v),
        _ => Err(CodecError::invalid("timestamptz codec got a mismatched value")),
    }
}

// ===== interval =====

fn interval_from_binary(_: &TypeRegistry, _: Oid, bytes: Bytes) -> Result<Value, CodecError> {
    let raw = fixed::<16>("interval", &bytes)?;
    Ok(Value::Interval(PgInterval {
        microseconds: i64::from_be_bytes(raw[..8].try_into().unwrap()),
        days: i32::from_be_bytes(raw[8..12].try_into().unwrap()),
        months: i32::from_be_bytes(raw[12..].try_into().unwrap()),
    }))
}

fn interval_to_binary(_: &TypeRegistry, value: &Value, buf: &mut BytesMut) -> Result<(), CodecError> {
    let v = expect_interval(value)?;
    buf.put_i64(v.microseconds);
    buf.put_i32(v.days);
    buf.put_i32(v.months);
    Ok(())
}

/// Accepts the server's verbose output style (`1 year 2 mons 3 days
/// 04:05:06.5`) and ISO 8601 durations (`P1Y2M3DT4H5M6.5S`).
fn interval_from_text(_: &TypeRegistry, _: Oid, bytes: Bytes) -> Result<Value, CodecError> {
    let text = utf8(&bytes)?;
    parse_interval(text)
        .map(Value::Interval)
        .ok_or_else(|| TemporalError::parse("interval", text).into())
}

fn interval_to_text(_: &TypeRegistry, value: &Value, buf: &mut BytesMut) -> Result<(), CodecError> {
    let v = expect_interval(value)?;
    let mut out = String::new();

    let (years, mons) = (v.months / 12, v.months % 12);
    if years != 0 {
        out.push_str(&format!("{years} year "));
    }
    if mons != 0 || years != 0 {
        out.push_str(&format!("{mons} mons "));
    }
    if v.days != 0 {
        out.push_str(&format!("{} days ", v.days));
    }

    let (sign, us) = if v.microseconds < 0 { ("-", -v.microseconds) } else { ("", v.microseconds) };
    let (h, rem) = (us / 3_600_000_000, us % 3_600_000_000);
    let (m, rem) = (rem / 60_000_000, rem % 60_000_000);
    let (s, frac) = (rem / 1_000_000, rem % 1_000_000);
    out.push_str(&format!("{sign}{h:02}:{m:02}:{s:02}"));
    if frac != 0 {
        out.push_str(format!(".{frac:06}").trim_end_matches('0'));
    }

    buf.put_slice(out.as_bytes());
    Ok(())
}

fn parse_interval(text: &str) -> Option<PgInterval> {
    let text = text.trim();
    if text.starts_with(['P', 'p']) {
        return parse_iso_interval(text);
    }

    let mut out = PgInterval::default();
    let mut words = text.split_whitespace().peekable();
    while let Some(word) = words.next() {
        if let Some(unit) = words.peek() {
            // `N unit` pair
            if let Ok(n) = word.parse::<i64>() {
                match unit.trim_end_matches('s') {
                    "year" => out.months += (n * 12) as i32,
                    "mon" | "month" => out.months += n as i32,
                    "week" => out.days += (n * 7) as i32,
                    "day" => out.days += n as i32,
                    _ => return None,
                }
                words.next();
                continue;
            }
        }
        // trailing clock part, optionally signed
        if words.next().is_some() {
            return None;
        }
        out.microseconds += parse_clock(word)?;
    }
    Some(out)
}

fn parse_clock(text: &str) -> Option<i64> {
    let (sign, rest) = match text.as_bytes().first()? {
        b'-' => (-1, &text[1..]),
        b'+' => (1, &text[1..]),
        _ => (1, text),
    };
    let mut parts = rest.split(':');
    let h: i64 = parts.next()?.parse().ok()?;
    let m: i64 = parts.next()?.parse().ok()?;
    let s: f64 = parts.next()?.parse().ok()?;
    if parts.next().is_some() {
        return None;
    }
    Some(sign * (h * 3_600_000_000 + m * 60_000_000 + (s * 1e6).round() as i64))
}

fn parse_iso_interval(text: &str) -> Option<PgInterval> {
    let mut out = PgInterval::default();
    let mut in_time = false;
    let mut num = String::new();

    for c in text.chars().skip(1) {
        match c {
            'T' | 't' => in_time = true,
            '0'..='9' | '-' | '+' | '.' => num.push(c),
            unit => {
                let n: f64 = num.parse().ok()?;
                num.clear();
                match (in_time, unit.to_ascii_uppercase()) {
                    (false, 'Y') => out.months += (n as i32) * 12,
                    (false, 'M') => out.months += n as i32,
                    (false, 'W') => out.days += (n as i32) * 7,
                    (false, 'D') => out.days += n as i32,
                    (true, 'H') => out.microseconds += (n * 3.6e9) as i64,
                    (true, 'M') => out.microseconds += (n * 6e7) as i64,
                    (true, 'S') => out.microseconds += (n * 1e6).round() as i64,
                    _ => return None,
                }
            }
        }
    }
    num.is_empty().then_some(out)
}

fn expect_interval(value: &Value) -> Result<PgInterval, CodecError> {
    match value {
        Value::Interval(v) => Ok(*v),
        _ => Err(CodecError::invalid("interval codec got a mismatched value")),
    }
}

fn write_fmt(buf: &mut BytesMut, args: std::fmt::Arguments) -> Result<(), CodecError> {
    use std::fmt::Write;
    let mut s = String::new();
    s.write_fmt(args).map_err(|_| CodecError::invalid("formatting failed"))?;
    buf.put_slice(s.as_bytes());
    Ok(())
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::postgres::PgFormat;

    fn registry() -> TypeRegistry {
        TypeRegistry::new()
    }

    fn decode(oid: Oid, format: PgFormat, bytes: &[u8]) -> Value {
        registry()
            .decode(oid, format, Some(Bytes::copy_from_slice(bytes)))
            .unwrap()
    }

    fn encode(value: &Value, format: PgFormat) -> Vec<u8> {
        let mut buf = BytesMut::new();
        registry().encode(value, format, &mut buf).unwrap();
        buf.to_vec()
    }

    #[test]
    fn timestamp_binary_round_trip() {
        // '2005-01-01 15:00:00' is 157906800000000 us past the epoch
        let wire = 157_906_800_000_000i64.to_be_bytes();
        let value = decode(oid::TIMESTAMP, PgFormat::Binary, &wire);
        let Value::Timestamp(ts) = value else { panic!("expected timestamp") };
        assert_eq!(ts.to_string(), "2005-01-01 15:00:00");
        assert_eq!(encode(&Value::Timestamp(ts), PgFormat::Binary), wire);
    }

    #[test]
    fn timestamptz_text_forms() {
        let value = decode(oid::TIMESTAMPTZ, PgFormat::Text, b"2005-01-01 15:00:00+03");
        let Value::TimestampTz(ts) = value else { panic!("expected timestamptz") };
        assert_eq!(ts.timestamp_millis(), 1_104_580_800_000);

        assert_eq!(
            encode(&Value::TimestampTz(ts), PgFormat::Text),
            b"2005-01-01 12:00:00+00"
        );
    }

    #[test]
    fn date_forms() {
        let value = decode(oid::DATE, PgFormat::Binary, &5i32.to_be_bytes());
        assert_eq!(value, decode(oid::DATE, PgFormat::Text, b"2000-01-06"));
        assert_eq!(encode(&value, PgFormat::Text), b"2000-01-06");
        assert_eq!(encode(&value, PgFormat::Binary), 5i32.to_be_bytes());
    }

    #[test]
    fn timetz_reversed_sign_convention() {
        // 15:00:00 at +03:00 east arrives with -10800 in the zone field
        let mut wire = Vec::new();
        wire.extend((15 * 3600 * 1_000_000i64).to_be_bytes());
        wire.extend((-10_800i32).to_be_bytes());
        let value = decode(oid::TIMETZ, PgFormat::Binary, &wire);
        let Value::TimeTz(t) = value else { panic!("expected timetz") };
        assert_eq!(t.offset_seconds_east(), 10_800);

        assert_eq!(encode(&Value::TimeTz(t), PgFormat::Text), b"15:00:00+03");
        assert_eq!(
            decode(oid::TIMETZ, PgFormat::Text, b"15:00:00+03"),
            Value::TimeTz(t)
        );
        assert_eq!(encode(&Value::TimeTz(t), PgFormat::Binary), wire);
    }

    #[test]
    fn interval_forms() {
        let v = PgInterval { months: 14, days: 3, microseconds: 3_723_000_000 };
        let wire = encode(&Value::Interval(v), PgFormat::Binary);
        assert_eq!(wire.len(), 16);
        assert_eq!(decode(oid::INTERVAL, PgFormat::Binary, &wire), Value::Interval(v));

        assert_eq!(
            encode(&Value::Interval(v), PgFormat::Text),
            b"1 year 2 mons 3 days 01:02:03"
        );
        assert_eq!(
            decode(oid::INTERVAL, PgFormat::Text, b"1 year 2 mons 3 days 01:02:03"),
            Value::Interval(v)
        );
        assert_eq!(
            decode(oid::INTERVAL, PgFormat::Text, b"P1Y2M3DT1H2M3S"),
            Value::Interval(v)
        );
    }

    #[test]
    fn malformed_temporal_payloads_refuse() {
        let r = registry().decode(
            oid::TIMESTAMP,
            PgFormat::Binary,
            Some(Bytes::from_static(&[0, 1, 2])),
        );
        assert!(matches!(r, Err(CodecError::Length { .. })));

        let r = registry().decode(
            oid::TIME,
            PgFormat::Binary,
            Some(Bytes::copy_from_slice(&(-5i64).to_be_bytes())),
        );
        assert!(matches!(r, Err(CodecError::Temporal(_))));
    }
}
