//! Rendering of the timestamp encodings found in container headers.

use chrono::{DateTime, NaiveDate, NaiveDateTime};

/// Seconds between 1904-01-01 and 1970-01-01
const MAC_EPOCH_OFFSET: i64 = 2_082_844_800;

const FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// Epoch a stored timestamp counts from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeEpoch {
    /// Seconds since 1970-01-01 UTC (PE, GZIP)
    Unix,
    /// Seconds since 1904-01-01 UTC (MP4, TrueType)
    Mac,
}

impl TimeEpoch {
    /// Renders `seconds` counted from this epoch, if representable
    pub fn render(&self, seconds: u64) -> Option<String> {
        let seconds = i64::try_from(seconds).ok()?;
        let unix = match self {
            Self::Unix => seconds,
            Self::Mac => seconds.checked_sub(MAC_EPOCH_OFFSET)?,
        };
        DateTime::from_timestamp(unix, 0).map(|t| format!("{} UTC", t.format(FORMAT)))
    }
}

/// Renders an MS-DOS date/time pair as stored in ZIP records.
///
/// Returns `None` for impossible dates, which are common in the wild.
pub fn dos_date_time(date: u16, time: u16) -> Option<String> {
    let day = NaiveDate::from_ymd_opt(
        1980 + i32::from(date >> 9),
        u32::from((date >> 5) & 0x0F),
        u32::from(date & 0x1F),
    )?;
    let stamp: NaiveDateTime = day.and_hms_opt(
        u32::from(time >> 11),
        u32::from((time >> 5) & 0x3F),
        u32::from(time & 0x1F) * 2,
    )?;
    Some(stamp.format(FORMAT).to_string())
}
