//! DOS date/time handling.
//!
//! Both zip and RAR 4 store modification times as packed MS-DOS date and
//! time words:
//!
//! | Word | Bits | Field |
//! |------|------|-------|
//! | date | 15-9 | years since 1980 |
//! | date | 8-5 | month (1-12) |
//! | date | 4-0 | day (1-31) |
//! | time | 15-11 | hours |
//! | time | 10-5 | minutes |
//! | time | 4-0 | seconds / 2 |
//!
//! The format has no time zone; this crate interprets it as UTC so that
//! conversions are reproducible across machines.
//!
//! # Example
//!
//! ```rust
//! use archfs::timestamp::DosDateTime;
//!
//! let dos = DosDateTime::new(2024, 3, 15, 10, 30, 44).unwrap();
//! let round_trip = DosDateTime::from_system_time(dos.to_system_time());
//! assert_eq!(round_trip, dos);
//! ```

use std::time::{Duration, SystemTime, UNIX_EPOCH};

const SECONDS_PER_DAY: i64 = 86_400;

/// A packed MS-DOS timestamp with two second resolution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct DosDateTime {
    /// Packed date word.
    pub date: u16,
    /// Packed time word.
    pub time: u16,
}

impl DosDateTime {
    /// The earliest representable value, 1980-01-01 00:00:00.
    pub const MIN: DosDateTime = DosDateTime {
        date: (1 << 5) | 1,
        time: 0,
    };

    /// Creates a timestamp from calendar fields.
    ///
    /// Returns `None` if a field is out of range. Odd seconds are rounded
    /// down.
    pub fn new(year: u16, month: u8, day: u8, hour: u8, minute: u8, second: u8) -> Option<Self> {
        if !(1980..=2107).contains(&year)
            || !(1..=12).contains(&month)
            || !(1..=31).contains(&day)
            || hour > 23
            || minute > 59
            || second > 59
        {
            return None;
        }
        let date = ((year - 1980) << 9) | ((month as u16) << 5) | day as u16;
        let time = ((hour as u16) << 11) | ((minute as u16) << 5) | (second as u16 / 2);
        Some(Self { date, time })
    }

    /// Creates a timestamp from the combined 32-bit form used by RAR 4
    /// (time in the low word, date in the high word).
    pub fn from_u32(value: u32) -> Self {
        Self {
            date: (value >> 16) as u16,
            time: value as u16,
        }
    }

    /// Returns the combined 32-bit form used by RAR 4.
    pub fn as_u32(&self) -> u32 {
        ((self.date as u32) << 16) | self.time as u32
    }

    /// Returns `(year, month, day)`.
    pub fn ymd(&self) -> (u16, u8, u8) {
        let day = (self.date & 0x1F) as u8;
        let month = ((self.date >> 5) & 0x0F) as u8;
        let year = ((self.date >> 9) & 0x7F) + 1980;
        (year, month, day)
    }

    /// Returns `(hour, minute, second)`.
    pub fn hms(&self) -> (u8, u8, u8) {
        let second = ((self.time & 0x1F) * 2) as u8;
        let minute = ((self.time >> 5) & 0x3F) as u8;
        let hour = ((self.time >> 11) & 0x1F) as u8;
        (hour, minute, second)
    }

    /// Converts to a [`SystemTime`], interpreting the fields as UTC.
    ///
    /// Out-of-range fields written by sloppy archivers are clamped.
    pub fn to_system_time(&self) -> SystemTime {
        let (year, month, day) = self.ymd();
        let (hour, minute, second) = self.hms();
        let days = days_from_civil(year as i64, month.clamp(1, 12) as i64, day.max(1) as i64);
        let secs = days * SECONDS_PER_DAY
            + hour.min(23) as i64 * 3600
            + minute.min(59) as i64 * 60
            + second.min(59) as i64;
        UNIX_EPOCH + Duration::from_secs(secs.max(0) as u64)
    }

    /// Converts from a [`SystemTime`], clamping to the representable range.
    pub fn from_system_time(time: SystemTime) -> Self {
        let secs = match time.duration_since(UNIX_EPOCH) {
            Ok(d) => d.as_secs() as i64,
            Err(_) => return Self::MIN,
        };
        let days = secs.div_euclid(SECONDS_PER_DAY);
        let rem = secs.rem_euclid(SECONDS_PER_DAY);
        let (year, month, day) = civil_from_days(days);
        if year < 1980 {
            return Self::MIN;
        }
        if year > 2107 {
            return Self {
                date: (127 << 9) | (12 << 5) | 31,
                time: (23 << 11) | (59 << 5) | 29,
            };
        }
        Self::new(
            year as u16,
            month as u8,
            day as u8,
            (rem / 3600) as u8,
            ((rem % 3600) / 60) as u8,
            (rem % 60) as u8,
        )
        .unwrap_or(Self::MIN)
    }

    /// Returns the current time.
    pub fn now() -> Self {
        Self::from_system_time(SystemTime::now())
    }
}

impl Default for DosDateTime {
    fn default() -> Self {
        Self::MIN
    }
}

/// Days since 1970-01-01 for a proleptic Gregorian date.
fn days_from_civil(year: i64, month: i64, day: i64) -> i64 {
    let y = if month <= 2 { year - 1 } else { year };
    let era = y.div_euclid(400);
    let yoe = y - era * 400;
    let mp = (month + 9) % 12;
    let doy = (153 * mp + 2) / 5 + day - 1;
    let doe = yoe * 365 + yoe / 4 - yoe / 100 + doy;
    era * 146_097 + doe - 719_468
}

/// Inverse of [`days_from_civil`].
fn civil_from_days(days: i64) -> (i64, i64, i64) {
    let z = days + 719_468;
    let era = z.div_euclid(146_097);
    let doe = z - era * 146_097;
    let yoe = (doe - doe / 1460 + doe / 36_524 - doe / 146_096) / 365;
    let y = yoe + era * 400;
    let doy = doe - (365 * yoe + yoe / 4 - yoe / 100);
    let mp = (5 * doy + 2) / 153;
    let d = doy - (153 * mp + 2) / 5 + 1;
    let m = if mp < 10 { mp + 3 } else { mp - 9 };
    (if m <= 2 { y + 1 } else { y }, m, d)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_min_is_1980() {
        let min = DosDateTime::MIN;
        assert_eq!(min.ymd(), (1980, 1, 1));
        assert_eq!(min.hms(), (0, 0, 0));
        assert_eq!(min.to_system_time(), UNIX_EPOCH + Duration::from_secs(315_532_800));
    }

    #[test]
    fn test_known_date() {
        // 2024-03-15 10:30:44 UTC
        let dos = DosDateTime::new(2024, 3, 15, 10, 30, 44).unwrap();
        let expected = UNIX_EPOCH + Duration::from_secs(1_710_498_644);
        assert_eq!(dos.to_system_time(), expected);
        assert_eq!(DosDateTime::from_system_time(expected), dos);
    }

    #[test]
    fn test_odd_seconds_round_down() {
        let dos = DosDateTime::new(2000, 2, 29, 23, 59, 59).unwrap();
        assert_eq!(dos.hms(), (23, 59, 58));
        assert_eq!(dos.ymd(), (2000, 2, 29));
    }

    #[test]
    fn test_u32_packing() {
        let dos = DosDateTime::new(2010, 7, 4, 12, 0, 0).unwrap();
        assert_eq!(DosDateTime::from_u32(dos.as_u32()), dos);
        assert_eq!(dos.as_u32() >> 16, dos.date as u32);
    }

    #[test]
    fn test_clamps_out_of_range() {
        assert_eq!(DosDateTime::from_system_time(UNIX_EPOCH), DosDateTime::MIN);
        assert!(DosDateTime::new(1979, 12, 31, 0, 0, 0).is_none());
        assert!(DosDateTime::new(2000, 13, 1, 0, 0, 0).is_none());
    }

    #[test]
    fn test_garbage_fields_do_not_panic() {
        let dos = DosDateTime {
            date: 0xFFFF,
            time: 0xFFFF,
        };
        let _ = dos.to_system_time();
        let zero = DosDateTime { date: 0, time: 0 };
        let _ = zero.to_system_time();
    }
}
