use std::{fmt, str::FromStr};

use chrono::{DateTime, Datelike, Utc};
use serde::{Deserialize, Serialize};

use crate::{errors::Error, Result};

/// Chat user identifier, normalized (trimmed, non-empty).
///
/// Telegram ids are numeric, but the persisted documents have always stored
/// them as strings, so the core treats them as opaque text.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct UserId(String);

impl UserId {
    pub fn parse(raw: &str) -> Result<Self> {
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            return Err(Error::Validation("user id must not be empty".to_string()));
        }
        Ok(Self(trimmed.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for UserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<String> for UserId {
    type Error = Error;

    fn try_from(raw: String) -> Result<Self> {
        Self::parse(&raw)
    }
}

impl From<UserId> for String {
    fn from(id: UserId) -> Self {
        id.0
    }
}

impl From<i64> for UserId {
    fn from(id: i64) -> Self {
        Self(id.to_string())
    }
}

/// Monthly metrics bucket, rendered as `YYYY-MM`.
///
/// Buckets are always derived in UTC. Changing the zone later would move
/// events between historical buckets.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct MonthKey {
    year: i32,
    month: u32,
}

impl MonthKey {
    pub fn new(year: i32, month: u32) -> Result<Self> {
        if !(1..=12).contains(&month) {
            return Err(Error::Validation(format!("month out of range: {month}")));
        }
        if !(0..=9999).contains(&year) {
            return Err(Error::Validation(format!("year out of range: {year}")));
        }
        Ok(Self { year, month })
    }

    /// Bucket of `ts`. Fails for years outside `0000..=9999`, which have no
    /// `YYYY-MM` rendering.
    pub fn from_datetime(ts: DateTime<Utc>) -> Result<Self> {
        Self::new(ts.year(), ts.month())
    }

    pub fn year(&self) -> i32 {
        self.year
    }

    pub fn month(&self) -> u32 {
        self.month
    }
}

impl fmt::Display for MonthKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:04}-{:02}", self.year, self.month)
    }
}

impl FromStr for MonthKey {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let invalid = || Error::Validation(format!("invalid month key: {s:?} (expected YYYY-MM)"));

        let (y, m) = s.trim().split_once('-').ok_or_else(invalid)?;
        if y.len() != 4 || m.len() != 2 {
            return Err(invalid());
        }
        if !y.bytes().chain(m.bytes()).all(|b| b.is_ascii_digit()) {
            return Err(invalid());
        }
        let year = y.parse::<i32>().map_err(|_| invalid())?;
        let month = m.parse::<u32>().map_err(|_| invalid())?;
        Self::new(year, month)
    }
}

impl Serialize for MonthKey {
    fn serialize<S: serde::Serializer>(&self, s: S) -> std::result::Result<S::Ok, S::Error> {
        s.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for MonthKey {
    fn deserialize<D: serde::Deserializer<'de>>(d: D) -> std::result::Result<Self, D::Error> {
        let raw = String::deserialize(d)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn user_id_is_trimmed_and_rejects_blank() {
        assert_eq!(UserId::parse("  42 ").unwrap().as_str(), "42");
        assert!(matches!(UserId::parse("   "), Err(Error::Validation(_))));
        assert_eq!(UserId::from(7_i64).as_str(), "7");
    }

    #[test]
    fn month_key_parses_and_formats() {
        let k: MonthKey = "2024-03".parse().unwrap();
        assert_eq!((k.year(), k.month()), (2024, 3));
        assert_eq!(k.to_string(), "2024-03");

        assert!("2024-3".parse::<MonthKey>().is_err());
        assert!("2024-13".parse::<MonthKey>().is_err());
        assert!("24-03".parse::<MonthKey>().is_err());
        assert!("all".parse::<MonthKey>().is_err());
    }

    #[test]
    fn month_key_uses_utc_calendar() {
        // 23:30 on the last day of February in UTC stays in February.
        let ts = Utc.with_ymd_and_hms(2024, 2, 29, 23, 30, 0).unwrap();
        assert_eq!(MonthKey::from_datetime(ts).unwrap().to_string(), "2024-02");
    }

    #[test]
    fn month_key_rejects_years_without_four_digits() {
        let far = Utc.with_ymd_and_hms(10000, 1, 1, 0, 0, 0).unwrap();
        assert!(matches!(MonthKey::from_datetime(far), Err(Error::Validation(_))));
        let before = Utc.with_ymd_and_hms(-1, 3, 1, 0, 0, 0).unwrap();
        assert!(MonthKey::from_datetime(before).is_err());
    }

    #[test]
    fn month_keys_order_chronologically() {
        let a: MonthKey = "2023-12".parse().unwrap();
        let b: MonthKey = "2024-01".parse().unwrap();
        assert!(a < b);
    }
}
