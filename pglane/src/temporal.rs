//! Calendar-aware conversions between wire values, instants and wall-clocks.
//!
//! The wire transmits temporal values relative to the postgres epoch,
//! `2000-01-01 00:00:00`:
//!
//! - `timestamp` / `timestamptz`: signed microseconds since the epoch
//! - `date`: signed days since the epoch
//! - `time`: microseconds since midnight
//! - `timetz`: microseconds since midnight + zone seconds west of Greenwich
//!
//! Instants and local wall-clocks are deliberately distinct types:
//!
//! - `timestamptz` is an absolute instant ([`DateTime<Utc>`]). Materializing
//!   it under any calendar never shifts the value.
//! - `timestamp`, `date` and `time` are local wall-clocks (naive values).
//!   They only become instants against a caller-supplied [`TimeZone`], and
//!   different zones yield different instants for the same wire value.
//!
//! Zone math goes through the caller's `TimeZone` implementation;
//! [`chrono_tz`] carries the IANA database including sub-minute historical
//! offsets, and no offset is ever rounded to whole minutes here.
use chrono::{
    DateTime, LocalResult, NaiveDate, NaiveDateTime, NaiveTime, TimeDelta, TimeZone, Utc,
};

/// An error from a temporal wire conversion.
///
/// The conversions are total over valid wire values; this is only produced
/// for out-of-range or malformed input.
#[derive(Debug, thiserror::Error)]
pub enum TemporalError {
    #[error("{what} value out of range")]
    OutOfRange { what: &'static str },
    #[error("{what} payload must be {expect} bytes, got {got}")]
    Length {
        what: &'static str,
        expect: usize,
        got: usize,
    },
    #[error("invalid {what} text: {text:?}")]
    Parse { what: &'static str, text: String },
}

impl TemporalError {
    pub(crate) fn out_of_range(what: &'static str) -> Self {
        Self::OutOfRange { what }
    }

    pub(crate) fn length(what: &'static str, expect: usize, got: usize) -> Self {
        Self::Length { what, expect, got }
    }

    pub(crate) fn parse(what: &'static str, text: &str) -> Self {
        Self::Parse { what, text: text.into() }
    }
}

/// Midnight at the start of 2000-01-01, the postgres epoch.
fn pg_epoch() -> NaiveDateTime {
    pg_epoch_date().and_time(NaiveTime::MIN)
}

fn pg_epoch_date() -> NaiveDate {
    NaiveDate::from_ymd_opt(2000, 1, 1).expect("2000-01-01 is a valid date")
}

const MICROS_PER_DAY: i64 = 86_400_000_000;

// ===== Wire conversions =====

/// Microseconds since the epoch into a local wall-clock.
pub fn timestamp_from_wire(us: i64) -> Result<NaiveDateTime, TemporalError> {
    pg_epoch()
        .checked_add_signed(TimeDelta::microseconds(us))
        .ok_or(TemporalError::out_of_range("timestamp"))
}

/// Local wall-clock into microseconds since the epoch.
pub fn timestamp_to_wire(ts: NaiveDateTime) -> Result<i64, TemporalError> {
    ts.signed_duration_since(pg_epoch())
        .num_microseconds()
        .ok_or(TemporalError::out_of_range("timestamp"))
}

/// Microseconds since the epoch into an absolute instant.
pub fn timestamptz_from_wire(us: i64) -> Result<DateTime<Utc>, TemporalError> {
    timestamp_from_wire(us).map(|naive| naive.and_utc())
}

/// Absolute instant into microseconds since the epoch.
pub fn timestamptz_to_wire(ts: DateTime<Utc>) -> Result<i64, TemporalError> {
    timestamp_to_wire(ts.naive_utc())
}

/// Days since the epoch into a calendar date.
pub fn date_from_wire(days: i32) -> Result<NaiveDate, TemporalError> {
    pg_epoch_date()
        .checked_add_signed(TimeDelta::days(days as i64))
        .ok_or(TemporalError::out_of_range("date"))
}

/// Calendar date into days since the epoch.
pub fn date_to_wire(date: NaiveDate) -> Result<i32, TemporalError> {
    date.signed_duration_since(pg_epoch_date())
        .num_days()
        .try_into()
        .map_err(|_| TemporalError::out_of_range("date"))
}

/// Microseconds since midnight into a wall-clock time.
///
/// The server permits `24:00:00` as an input literal; its wire value maps
/// to the last representable microsecond of the day.
pub fn time_from_wire(us: i64) -> Result<NaiveTime, TemporalError> {
    if us == MICROS_PER_DAY {
        return Ok(NaiveTime::from_hms_micro_opt(23, 59, 59, 999_999).unwrap());
    }
    if !(0..MICROS_PER_DAY).contains(&us) {
        return Err(TemporalError::out_of_range("time"));
    }
    let secs = (us / 1_000_000) as u32;
    let nanos = ((us % 1_000_000) * 1_000) as u32;
    NaiveTime::from_num_seconds_from_midnight_opt(secs, nanos)
        .ok_or(TemporalError::out_of_range("time"))
}

/// Wall-clock time into microseconds since midnight.
pub fn time_to_wire(time: NaiveTime) -> i64 {
    time.signed_duration_since(NaiveTime::MIN)
        .num_microseconds()
        // a day of microseconds always fits
        .unwrap_or(0)
}

// ===== Instant materialization =====

/// Resolve a local wall-clock against a zone into an absolute instant.
///
/// An ambiguous wall-clock (backward transition) takes the earlier offset.
/// A wall-clock inside a forward transition gap is resolved leniently with
/// the offset in force the day before.
pub fn instant_from_wallclock<Z: TimeZone>(wall: NaiveDateTime, zone: &Z) -> DateTime<Utc> {
    match zone.from_local_datetime(&wall) {
        LocalResult::Single(dt) => dt.with_timezone(&Utc),
        LocalResult::Ambiguous(earliest, _) => earliest.with_timezone(&Utc),
        LocalResult::None => {
            let probe = wall - TimeDelta::days(1);
            match zone.from_local_datetime(&probe) {
                LocalResult::Single(dt) | LocalResult::Ambiguous(dt, _) => {
                    (dt + TimeDelta::days(1)).with_timezone(&Utc)
                }
                LocalResult::None => Utc.from_utc_datetime(&wall),
            }
        }
    }
}

/// The wall-clock an instant shows on a calendar in `zone`.
pub fn wallclock_at<Z: TimeZone>(instant: DateTime<Utc>, zone: &Z) -> NaiveDateTime {
    instant.with_timezone(zone).naive_local()
}

/// The instant of midnight of `date` in `zone`, not in UTC.
pub fn date_instant<Z: TimeZone>(date: NaiveDate, zone: &Z) -> DateTime<Utc> {
    instant_from_wallclock(date.and_time(NaiveTime::MIN), zone)
}

/// The instant of midnight plus `time` in `zone`, on the unix epoch date.
pub fn time_instant<Z: TimeZone>(time: NaiveTime, zone: &Z) -> DateTime<Utc> {
    let date = NaiveDate::from_ymd_opt(1970, 1, 1).expect("1970-01-01 is a valid date");
    instant_from_wallclock(date.and_time(time), zone)
}

#[cfg(test)]
mod test {
    use super::*;
    use chrono::FixedOffset;
    use chrono_tz::Europe::Paris;

    fn ymd_hms(y: i32, mo: u32, d: u32, h: u32, mi: u32, s: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(y, mo, d)
            .unwrap()
            .and_hms_opt(h, mi, s)
            .unwrap()
    }

    #[test]
    fn timestamptz_is_an_absolute_instant() {
        // '2005-01-01 15:00:00 +0300'
        let wire = 157_896_000_000_000i64;
        let instant = timestamptz_from_wire(wire).unwrap();
        assert_eq!(instant.timestamp_millis(), 1_104_580_800_000);

        // materializing under any calendar must not shift the value
        for offset in [0, 3 * 3600, -5 * 3600, 13 * 3600] {
            let zone = FixedOffset::east_opt(offset).unwrap();
            let shown = instant.with_timezone(&zone);
            assert_eq!(shown.timestamp_millis(), 1_104_580_800_000);
        }

        assert_eq!(timestamptz_to_wire(instant).unwrap(), wire);
    }

    #[test]
    fn timestamp_is_a_local_wallclock() {
        // '2005-01-01 15:00:00', no zone
        let wire = 157_906_800_000_000i64;
        let wall = timestamp_from_wire(wire).unwrap();
        assert_eq!(wall, ymd_hms(2005, 1, 1, 15, 0, 0));

        // the caller's zone decides which instant that wall-clock is
        let cases = [
            (0, 1_104_591_600_000i64),
            (3600, 1_104_588_000_000),
            (3 * 3600, 1_104_580_800_000),
            (-5 * 3600, 1_104_609_600_000),
            (13 * 3600, 1_104_544_800_000),
        ];
        for (offset, expect_ms) in cases {
            let zone = FixedOffset::east_opt(offset).unwrap();
            let instant = instant_from_wallclock(wall, &zone);
            assert_eq!(instant.timestamp_millis(), expect_ms, "offset {offset}");
        }
    }

    #[test]
    fn paris_1920_midnight() {
        // by 1920 Paris legal time is GMT
        let instant = instant_from_wallclock(ymd_hms(1920, 1, 1, 0, 0, 0), &Paris);
        assert_eq!(instant.timestamp_millis(), -1_577_923_200_000);
    }

    #[test]
    fn paris_sub_minute_offset() {
        // before 1911-03-11 Paris ran 00:09:21 ahead of Greenwich,
        // the offset must not be rounded to whole minutes
        let wall = ymd_hms(1900, 6, 1, 0, 0, 0);
        let instant = instant_from_wallclock(wall, &Paris);
        assert_eq!(wall.and_utc().timestamp() - instant.timestamp(), 561);
    }

    #[test]
    fn pre_epoch_values() {
        assert_eq!(
            date_from_wire(-1).unwrap(),
            NaiveDate::from_ymd_opt(1999, 12, 31).unwrap()
        );
        assert_eq!(date_to_wire(NaiveDate::from_ymd_opt(1999, 12, 31).unwrap()).unwrap(), -1);

        let wall = timestamp_from_wire(-1).unwrap();
        assert_eq!(wall, ymd_hms(1999, 12, 31, 23, 59, 59) + TimeDelta::microseconds(999_999));
        assert_eq!(timestamp_to_wire(wall).unwrap(), -1);
    }

    #[test]
    fn time_wire_range() {
        assert_eq!(time_from_wire(0).unwrap(), NaiveTime::MIN);
        let t = time_from_wire(15 * 3600 * 1_000_000).unwrap();
        assert_eq!(t, NaiveTime::from_hms_opt(15, 0, 0).unwrap());
        assert_eq!(time_to_wire(t), 15 * 3600 * 1_000_000);
        assert!(time_from_wire(-1).is_err());
        assert!(time_from_wire(MICROS_PER_DAY + 1).is_err());
    }

    #[test]
    fn date_instant_is_midnight_in_zone() {
        let date = NaiveDate::from_ymd_opt(2005, 1, 1).unwrap();
        let zone = FixedOffset::east_opt(3 * 3600).unwrap();
        let instant = date_instant(date, &zone);
        // midnight +03:00 is 21:00 UTC the previous day
        assert_eq!(
            instant.naive_utc(),
            ymd_hms(2004, 12, 31, 21, 0, 0)
        );
    }
}
