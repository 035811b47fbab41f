//! Normalization of partial-precision HL7 date/time values.
//!
//! HL7 timestamps arrive as `YYYY[MM[DD[HH[MM[SS[.S[S[S[S]]]]]]]]][+/-ZZZZ]` and times as
//! `HH[MM[SS[.S[S[S[S]]]]]][+/-ZZZZ]`. Missing components default to the start of the
//! period. When no offset is given, the offset comes from the timezone rule in effect on
//! the parsed date, so values on either side of a daylight-saving transition resolve to
//! the offset that applied at that moment rather than the current one.

use chrono::{
    DateTime, FixedOffset, Local, LocalResult, NaiveDate, NaiveDateTime, NaiveTime, Offset,
    TimeZone,
};

use crate::error::Error;

const TIMESTAMP_LEN: std::ops::RangeInclusive<usize> = 4..=24;
const TIME_LEN: std::ops::RangeInclusive<usize> = 2..=16;

const OFFSET_LEN: usize = 5;
const MAX_FRACTION_DIGITS: usize = 4;
const NANOS_PER_FRACTION_UNIT: u32 = 100_000;

/// Date that time-only values are bound to.
pub fn reference_date() -> NaiveDate {
    NaiveDate::from_ymd_opt(1970, 1, 1).expect("valid reference date")
}

/// Parses an HL7 timestamp, resolving a missing offset with the server's local timezone.
pub fn parse_timestamp(input: &str) -> Result<DateTime<FixedOffset>, Error> {
    parse_timestamp_in(input, &Local)
}

/// Parses an HL7 time-of-day bound to [`reference_date`], resolving a missing offset with
/// the server's local timezone.
pub fn parse_time(input: &str) -> Result<DateTime<FixedOffset>, Error> {
    parse_time_in(input, &Local)
}

pub fn parse_timestamp_in<Tz: TimeZone>(
    input: &str,
    tz: &Tz,
) -> Result<DateTime<FixedOffset>, Error> {
    if !TIMESTAMP_LEN.contains(&input.len()) {
        return Err(Error::malformed(
            input,
            "timestamp length must be between 4 and 24 characters",
        ));
    }
    if !input.is_ascii() {
        return Err(Error::malformed(input, "non-ascii character"));
    }

    let (body, offset) = split_offset(input);
    let fields = Fields::new(input, body, 4, 14)?;

    let year = fields.take(0, 0)? as i32;
    let month = fields.take(4, 1)?;
    let day = fields.take(6, 1)?;
    let hour = fields.take(8, 0)?;
    let minute = fields.take(10, 0)?;
    let second = fields.take(12, 0)?;
    let nanos = fields.fraction()?;

    let date = NaiveDate::from_ymd_opt(year, month, day)
        .ok_or_else(|| Error::malformed(input, "invalid calendar date"))?;
    let time = NaiveTime::from_hms_nano_opt(hour, minute, second, nanos)
        .ok_or_else(|| Error::malformed(input, "invalid time of day"))?;

    resolve(input, date.and_time(time), offset, tz)
}

pub fn parse_time_in<Tz: TimeZone>(input: &str, tz: &Tz) -> Result<DateTime<FixedOffset>, Error> {
    if !TIME_LEN.contains(&input.len()) {
        return Err(Error::malformed(
            input,
            "time length must be between 2 and 16 characters",
        ));
    }
    if !input.is_ascii() {
        return Err(Error::malformed(input, "non-ascii character"));
    }

    let (body, offset) = split_offset(input);
    let fields = Fields::new(input, body, 2, 6)?;

    let hour = fields.take(0, 0)?;
    let minute = fields.take(2, 0)?;
    let second = fields.take(4, 0)?;
    let nanos = fields.fraction()?;

    let time = NaiveTime::from_hms_nano_opt(hour, minute, second, nanos)
        .ok_or_else(|| Error::malformed(input, "invalid time of day"))?;

    resolve(input, reference_date().and_time(time), offset, tz)
}

/// Splits off the offset, which starts at the first `+` or `-`.
fn split_offset(input: &str) -> (&str, Option<&str>) {
    match input.find(['+', '-']) {
        Some(idx) => (&input[..idx], Some(&input[idx..])),
        None => (input, None),
    }
}

/// Fixed-width two-digit components followed by an optional fraction.
struct Fields<'a> {
    input: &'a str,
    body: &'a str,
    /// Width of the component part, i.e. where the fraction may start.
    width: usize,
}

impl<'a> Fields<'a> {
    fn new(input: &'a str, body: &'a str, min: usize, width: usize) -> Result<Self, Error> {
        let components = body.len().min(width);
        if components < min || components % 2 != 0 {
            return Err(Error::malformed(input, "truncated component"));
        }

        Ok(Self { input, body, width })
    }

    /// Reads the component starting at `start`, or `default` when the value stops earlier.
    /// The year is the only four-digit component and always starts at zero.
    fn take(&self, start: usize, default: u32) -> Result<u32, Error> {
        let len = if start == 0 && self.width == 14 { 4 } else { 2 };
        if self.body.len().min(self.width) < start + len {
            return Ok(default);
        }

        self.digits(&self.body[start..start + len])
    }

    fn fraction(&self) -> Result<u32, Error> {
        if self.body.len() <= self.width {
            return Ok(0);
        }

        let rest = &self.body[self.width..];
        let Some(digits) = rest.strip_prefix('.') else {
            return Err(Error::malformed(
                self.input,
                "a decimal point may only follow the seconds",
            ));
        };

        if digits.is_empty() || digits.len() > MAX_FRACTION_DIGITS {
            return Err(Error::malformed(
                self.input,
                "fractional seconds must have between 1 and 4 digits",
            ));
        }

        let value = self.digits(digits)?;
        let scale = 10u32.pow((MAX_FRACTION_DIGITS - digits.len()) as u32);

        Ok(value * scale * NANOS_PER_FRACTION_UNIT)
    }

    fn digits(&self, s: &str) -> Result<u32, Error> {
        if !s.bytes().all(|b| b.is_ascii_digit()) {
            return Err(Error::malformed(self.input, format!("expected digits, got {s:?}")));
        }

        s.parse()
            .map_err(|_| Error::malformed(self.input, format!("expected digits, got {s:?}")))
    }
}

fn parse_offset(input: &str, offset: &str) -> Result<FixedOffset, Error> {
    let bytes = offset.as_bytes();
    if bytes.len() != OFFSET_LEN || !bytes[1..].iter().all(u8::is_ascii_digit) {
        return Err(Error::malformed(input, "offset must look like +HHMM or -HHMM"));
    }

    let hours: i32 = offset[1..3]
        .parse()
        .map_err(|_| Error::malformed(input, "invalid offset hours"))?;
    let minutes: i32 = offset[3..5]
        .parse()
        .map_err(|_| Error::malformed(input, "invalid offset minutes"))?;

    if minutes >= 60 {
        return Err(Error::malformed(input, "invalid offset minutes"));
    }

    let seconds = hours * 3600 + minutes * 60;
    let seconds = if bytes[0] == b'-' { -seconds } else { seconds };

    FixedOffset::east_opt(seconds).ok_or_else(|| Error::malformed(input, "offset out of range"))
}

fn resolve<Tz: TimeZone>(
    input: &str,
    naive: NaiveDateTime,
    offset: Option<&str>,
    tz: &Tz,
) -> Result<DateTime<FixedOffset>, Error> {
    if let Some(offset) = offset {
        let offset = parse_offset(input, offset)?;
        return offset
            .from_local_datetime(&naive)
            .single()
            .ok_or_else(|| Error::malformed(input, "unrepresentable instant"));
    }

    match tz.from_local_datetime(&naive) {
        LocalResult::Single(dt) | LocalResult::Ambiguous(dt, _) => Ok(dt.fixed_offset()),
        // Wall-clock time skipped by a forward transition.
        LocalResult::None => tz
            .offset_from_utc_datetime(&naive)
            .fix()
            .from_local_datetime(&naive)
            .single()
            .ok_or_else(|| Error::malformed(input, "unrepresentable instant")),
    }
}

#[cfg(test)]
mod tests {
    use chrono::{Datelike, Timelike};

    use super::*;

    fn zone() -> FixedOffset {
        FixedOffset::east_opt(3 * 3600).unwrap()
    }

    fn at(y: i32, mo: u32, d: u32, h: u32, mi: u32, s: u32, tz: FixedOffset) -> DateTime<FixedOffset> {
        tz.with_ymd_and_hms(y, mo, d, h, mi, s).unwrap()
    }

    #[test]
    fn test_partial_precision_defaults() {
        let tz = zone();
        let cases = [
            ("1978", at(1978, 1, 1, 0, 0, 0, tz)),
            ("197804", at(1978, 4, 1, 0, 0, 0, tz)),
            ("19780411", at(1978, 4, 11, 0, 0, 0, tz)),
            ("1978041106", at(1978, 4, 11, 6, 0, 0, tz)),
            ("197804110615", at(1978, 4, 11, 6, 15, 0, tz)),
            ("19780411061538", at(1978, 4, 11, 6, 15, 38, tz)),
        ];

        for (input, expected) in cases {
            assert_eq!(parse_timestamp_in(input, &tz).unwrap(), expected, "{input}");
        }
    }

    #[test]
    fn test_fractional_seconds() {
        let parsed = parse_timestamp_in("19780411061538.1234", &zone()).unwrap();
        assert_eq!(parsed.second(), 38);
        assert_eq!(parsed.nanosecond(), 123_400_000);

        let parsed = parse_timestamp_in("19780411061538.5", &zone()).unwrap();
        assert_eq!(parsed.nanosecond(), 500_000_000);
    }

    #[test]
    fn test_explicit_offset_wins() {
        let parsed = parse_timestamp_in("197804110615-0200", &zone()).unwrap();
        let minus_two = FixedOffset::west_opt(2 * 3600).unwrap();

        assert_eq!(parsed, at(1978, 4, 11, 6, 15, 0, minus_two));
        assert_eq!(parsed.offset(), &minus_two);

        let parsed = parse_timestamp_in("19780411061538.12+0530", &zone()).unwrap();
        assert_eq!(parsed.offset().local_minus_utc(), 5 * 3600 + 30 * 60);
        assert_eq!(parsed.nanosecond(), 120_000_000);
    }

    #[test]
    fn test_malformed_timestamps() {
        for input in [
            "78",
            "19784",
            "197841",
            "197804116",
            "19780411065",
            "1978041106153",
            "197804110615-5",
            "197804110615.5",
            "19780411061538x1",
            "19780411061538.",
            "19780411061538.12345",
            "19781311",
            "1978041125",
            "197804110615+2560",
            "1978041106153800000000000",
            "197a",
            "19+0500",
        ] {
            match parse_timestamp_in(input, &zone()) {
                Err(Error::MalformedInput { .. }) => {}
                other => panic!("expected malformed input for {input:?}, got {other:?}"),
            }
        }
    }

    #[test]
    fn test_time_only() {
        let tz = zone();
        let reference = reference_date();

        let parsed = parse_time_in("0615", &tz).unwrap();
        assert_eq!(parsed.date_naive(), reference);
        assert_eq!((parsed.hour(), parsed.minute(), parsed.second()), (6, 15, 0));

        let parsed = parse_time_in("061538", &tz).unwrap();
        assert_eq!((parsed.hour(), parsed.minute(), parsed.second()), (6, 15, 38));

        let parsed = parse_time_in("061538.1234", &tz).unwrap();
        assert_eq!(parsed.nanosecond(), 123_400_000);

        let parsed = parse_time_in("061538-0300", &tz).unwrap();
        assert_eq!(parsed.offset().local_minus_utc(), -3 * 3600);
        assert_eq!(parsed.date_naive(), reference);

        let parsed = parse_time_in("06", &tz).unwrap();
        assert_eq!((parsed.hour(), parsed.minute()), (6, 0));
    }

    #[test]
    fn test_malformed_times() {
        for input in ["6", "061", "197804110615", "0615381234", "2500", "0660", "061538.12345-0300"] {
            match parse_time_in(input, &zone()) {
                Err(Error::MalformedInput { .. }) => {}
                other => panic!("expected malformed input for {input:?}, got {other:?}"),
            }
        }
    }

    #[test]
    fn test_offset_follows_parsed_date_not_now() {
        let tz = chrono_tz::America::New_York;

        let winter = parse_timestamp_in("20240115", &tz).unwrap();
        assert_eq!(winter.offset().local_minus_utc(), -5 * 3600);

        let summer = parse_timestamp_in("20240715", &tz).unwrap();
        assert_eq!(summer.offset().local_minus_utc(), -4 * 3600);

        // Either side of the 2024-03-10 02:00 transition.
        let before = parse_timestamp_in("202403100130", &tz).unwrap();
        assert_eq!(before.offset().local_minus_utc(), -5 * 3600);
        let after = parse_timestamp_in("202403100330", &tz).unwrap();
        assert_eq!(after.offset().local_minus_utc(), -4 * 3600);
    }

    #[test]
    fn test_skipped_wall_clock_time_still_resolves() {
        let tz = chrono_tz::America::New_York;
        let parsed = parse_timestamp_in("202403100230", &tz).unwrap();

        assert_eq!(parsed.year(), 2024);
        assert_eq!((parsed.hour(), parsed.minute()), (2, 30));
    }

    #[test]
    fn test_server_local_zone_is_default() {
        let expected = Local
            .with_ymd_and_hms(1978, 1, 1, 0, 0, 0)
            .earliest()
            .unwrap()
            .fixed_offset();

        assert_eq!(parse_timestamp("1978").unwrap(), expected);
    }
}
