//! CF convention time units, e.g. `days since 1970-01-01 00:00:00`.

use std::fmt;
use std::str::FromStr;

use chrono::{NaiveDate, NaiveDateTime};

use crate::{Error, Result};

/// Calendars in which a day is always 86400 seconds and dates are proleptic gregorian.
const STANDARD_CALENDARS: &[&str] = &["standard", "gregorian", "proleptic_gregorian"];

#[derive(Debug, Clone, PartialEq)]
pub struct TimeUnits {
    /// Length of one unit in seconds.
    pub seconds_per_unit: f64,
    pub epoch: NaiveDateTime,
    unit_name: String,
}

impl TimeUnits {
    /// Convert values in these units to values in `other`.
    pub fn convert(&self, values: &[f64], other: &TimeUnits) -> Vec<f64> {
        let shift = (self.epoch - other.epoch).num_milliseconds() as f64 / 1000.0;
        values
            .iter()
            .map(|v| (v * self.seconds_per_unit + shift) / other.seconds_per_unit)
            .collect()
    }
}

impl fmt::Display for TimeUnits {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} since {}",
            self.unit_name,
            self.epoch.format("%Y-%m-%d %H:%M:%S")
        )
    }
}

fn seconds_per_unit(unit: &str) -> Option<f64> {
    let s = match unit.to_ascii_lowercase().as_str() {
        "seconds" | "second" | "secs" | "sec" | "s" => 1.0,
        "minutes" | "minute" | "mins" | "min" => 60.0,
        "hours" | "hour" | "hrs" | "hr" | "h" => 3600.0,
        "days" | "day" | "d" => 86400.0,
        "weeks" | "week" => 7.0 * 86400.0,
        _ => return None,
    };
    Some(s)
}

fn parse_epoch(s: &str) -> Option<NaiveDateTime> {
    let s = s.trim();
    let s = s
        .strip_suffix("UTC")
        .or_else(|| s.strip_suffix('Z'))
        .or_else(|| s.strip_suffix("+00:00"))
        .or_else(|| s.strip_suffix("+0000"))
        .unwrap_or(s)
        .trim();
    const FORMATS: &[&str] = &[
        "%Y-%m-%d %H:%M:%S%.f",
        "%Y-%m-%dT%H:%M:%S%.f",
        "%Y-%m-%d %H:%M",
        "%Y-%m-%dT%H:%M",
    ];
    FORMATS
        .iter()
        .find_map(|fmt| NaiveDateTime::parse_from_str(s, fmt).ok())
        .or_else(|| {
            NaiveDate::parse_from_str(s, "%Y-%m-%d")
                .ok()
                .and_then(|d| d.and_hms_opt(0, 0, 0))
        })
}

impl FromStr for TimeUnits {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let err = || Error::general(format!("not CF time units: '{s}'"));
        let (unit, epoch) = s.split_once(" since ").ok_or_else(err)?;
        let unit = unit.trim();
        Ok(Self {
            seconds_per_unit: seconds_per_unit(unit).ok_or_else(err)?,
            epoch: parse_epoch(epoch).ok_or_else(err)?,
            unit_name: unit.to_owned(),
        })
    }
}

/// Check that a `calendar` attribute, if any, is one this module can convert.
pub fn check_calendar(calendar: Option<&str>) -> Result<()> {
    match calendar {
        None => Ok(()),
        Some(c) if STANDARD_CALENDARS.contains(&c.to_ascii_lowercase().as_str()) => Ok(()),
        Some(c) => Err(Error::general(format!(
            "cannot convert times in the '{c}' calendar"
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_common_forms() {
        let u: TimeUnits = "days since 1970-01-01 00:00:00".parse().unwrap();
        assert_eq!(u.seconds_per_unit, 86400.0);
        assert_eq!(u.to_string(), "days since 1970-01-01 00:00:00");

        let u: TimeUnits = "hours since 2000-01-01T06:00:00Z".parse().unwrap();
        assert_eq!(u.epoch.format("%H").to_string(), "06");

        let u: TimeUnits = "Seconds since 1990-1-1".parse().unwrap();
        assert_eq!(u.seconds_per_unit, 1.0);

        assert!("days".parse::<TimeUnits>().is_err());
        assert!("fortnights since 2000-01-01".parse::<TimeUnits>().is_err());
    }

    #[test]
    fn converts_between_epochs() {
        let hours: TimeUnits = "hours since 2000-01-02".parse().unwrap();
        let days: TimeUnits = "days since 2000-01-01".parse().unwrap();
        assert_eq!(hours.convert(&[0.0, 12.0], &days), vec![1.0, 1.5]);
        assert_eq!(days.convert(&[1.5], &hours), vec![12.0]);
    }

    #[test]
    fn calendars() {
        assert!(check_calendar(None).is_ok());
        assert!(check_calendar(Some("Gregorian")).is_ok());
        assert!(check_calendar(Some("noleap")).is_err());
    }
}
