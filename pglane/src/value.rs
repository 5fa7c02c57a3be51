//! The host-level value model the type registry trades in.
use bytes::Bytes;
use chrono::{DateTime, NaiveDate, NaiveDateTime, NaiveTime, Utc};

use crate::{
    common::ByteStr,
    postgres::{Oid, PgFormat, oid},
    types::{PgArray, PgNumeric},
};

/// A single decoded field value, or a parameter to be bound.
///
/// Wire bytes and values convert both ways through the
/// [`TypeRegistry`][crate::types::TypeRegistry]. A field whose type has no
/// registered codec is surfaced as [`Raw`][Value::Raw] with its metadata,
/// higher layers may refuse it.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    /// SQL `NULL`, a field of length -1 on the wire.
    Null,
    Bool(bool),
    Int2(i16),
    Int4(i32),
    Int8(i64),
    /// Any of the textual types, always UTF-8.
    Text(ByteStr),
    Bytea(Bytes),
    /// Arbitrary precision decimal, kept in the exact wire representation.
    Numeric(PgNumeric),
    /// Calendar date without zone.
    Date(NaiveDate),
    /// Wall-clock time without zone.
    Time(NaiveTime),
    /// Wall-clock time with a fixed zone offset.
    TimeTz(PgTimeTz),
    /// Local wall-clock date and time, interpreted against a zone
    /// only at materialization time.
    Timestamp(NaiveDateTime),
    /// An absolute instant.
    TimestampTz(DateTime<Utc>),
    Interval(PgInterval),
    Array(PgArray),
    /// Bytes of a type with no registered codec, plus metadata.
    Raw {
        oid: Oid,
        format: PgFormat,
        bytes: Bytes,
    },
}

impl Value {
    /// The natural oid for this value when used as a parameter.
    ///
    /// `Null` and `Raw` of unknown origin yield `0`, which leaves the
    /// parameter type unspecified for the server to infer.
    pub fn oid(&self) -> Oid {
        match self {
            Value::Null => 0,
            Value::Bool(_) => oid::BOOL,
            Value::Int2(_) => oid::INT2,
            Value::Int4(_) => oid::INT4,
            Value::Int8(_) => oid::INT8,
            Value::Text(_) => oid::TEXT,
            Value::Bytea(_) => oid::BYTEA,
            Value::Numeric(_) => oid::NUMERIC,
            Value::Date(_) => oid::DATE,
            Value::Time(_) => oid::TIME,
            Value::TimeTz(_) => oid::TIMETZ,
            Value::Timestamp(_) => oid::TIMESTAMP,
            Value::TimestampTz(_) => oid::TIMESTAMPTZ,
            Value::Interval(_) => oid::INTERVAL,
            Value::Array(array) => oid::array_of(array.element_oid).unwrap_or(0),
            Value::Raw { oid, .. } => *oid,
        }
    }

    /// Return `true` if value is SQL `NULL`.
    pub const fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }
}

macro_rules! from {
    (<$ty:ty>$pat:pat => $body:expr) => {
        impl From<$ty> for Value {
            fn from($pat: $ty) -> Self {
                $body
            }
        }
    };
}

from!(<bool>v => Value::Bool(v));
from!(<i16>v => Value::Int2(v));
from!(<i32>v => Value::Int4(v));
from!(<i64>v => Value::Int8(v));
from!(<&str>v => Value::Text(ByteStr::copy_from_str(v)));
from!(<String>v => Value::Text(v.into()));
from!(<&[u8]>v => Value::Bytea(Bytes::copy_from_slice(v)));
from!(<NaiveDate>v => Value::Date(v));
from!(<NaiveTime>v => Value::Time(v));
from!(<NaiveDateTime>v => Value::Timestamp(v));
from!(<DateTime<Utc>>v => Value::TimestampTz(v));
from!(<PgNumeric>v => Value::Numeric(v));
from!(<PgInterval>v => Value::Interval(v));
from!(<PgArray>v => Value::Array(v));

impl<T> From<Option<T>> for Value
where
    T: Into<Value>,
{
    fn from(value: Option<T>) -> Self {
        match value {
            Some(v) => v.into(),
            None => Value::Null,
        }
    }
}

/// A `timetz` value: wall-clock time plus a fixed zone offset.
///
/// The wire stores the offset in seconds **west** of Greenwich, the sign
/// convention opposite of the tz database; `+05:00` arrives as `-18000`.
/// The stored field keeps the wire convention.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PgTimeTz {
    pub time: NaiveTime,
    /// Zone offset in seconds west of Greenwich.
    pub offset_seconds_west: i32,
}

impl PgTimeTz {
    /// The offset in seconds east of Greenwich, tz database convention.
    pub const fn offset_seconds_east(&self) -> i32 {
        -self.offset_seconds_west
    }
}

/// An `interval` value in its wire decomposition.
///
/// Months, days and microseconds are independent components; the server
/// never normalizes across them because month and day lengths vary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PgInterval {
    pub months: i32,
    pub days: i32,
    pub microseconds: i64,
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn natural_oids() {
        assert_eq!(Value::Null.oid(), 0);
        assert_eq!(Value::Int4(1).oid(), oid::INT4);
        assert_eq!(Value::from("foo").oid(), oid::TEXT);
        assert_eq!(Value::from(None::<i32>).oid(), 0);
    }

    #[test]
    fn timetz_sign_convention() {
        // +03:00 east is stored as -10800 west
        let t = PgTimeTz {
            time: NaiveTime::from_hms_opt(15, 0, 0).unwrap(),
            offset_seconds_west: -10800,
        };
        assert_eq!(t.offset_seconds_east(), 10800);
    }
}
