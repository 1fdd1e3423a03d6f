//! Snapshot identifiers
//!
//! `YYYYMMDDHHMMSS[.<label><version>]`, e.g. `20260301000000`,
//! `20260301000000.2` or `20260301000000.rc1`.

use crate::error::ByoeError;
use chrono::{NaiveDateTime, Timelike};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;

pub const TIMESTAMP_FORMAT: &str = "%Y%m%d%H%M%S";

/// Unique snapshot identifier
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct SnapId {
    pub timestamp: NaiveDateTime,
    pub label: Option<String>,
    pub version: u32,
}

impl SnapId {
    pub fn new(timestamp: NaiveDateTime, label: Option<String>, version: u32) -> Self {
        Self {
            // Sub-second precision is not representable in the id
            timestamp: timestamp.with_nanosecond(0).unwrap_or(timestamp),
            label,
            version,
        }
    }

    /// Labeled snapshots are only used when asked for by id
    pub fn is_labeled(&self) -> bool {
        self.label.is_some()
    }

    /// Same timestamp and label, next version
    pub fn bump(&self) -> Self {
        Self {
            timestamp: self.timestamp,
            label: self.label.clone(),
            version: self.version + 1,
        }
    }
}

impl fmt::Display for SnapId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let ts = self.timestamp.format(TIMESTAMP_FORMAT);
        match &self.label {
            Some(label) => write!(f, "{}.{}{}", ts, label, self.version),
            None if self.version == 0 => write!(f, "{}", ts),
            None => write!(f, "{}.{}", ts, self.version),
        }
    }
}

impl FromStr for SnapId {
    type Err = ByoeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || ByoeError::InvalidSnapId(s.to_string());
        let (ts, suffix) = match s.split_once('.') {
            Some((ts, suffix)) => (ts, Some(suffix)),
            None => (s, None),
        };
        if ts.is_empty() || !ts.chars().all(|c| c.is_ascii_digit()) {
            return Err(invalid());
        }
        let timestamp = NaiveDateTime::parse_from_str(ts, TIMESTAMP_FORMAT).map_err(|_| invalid())?;

        let (label, version) = match suffix {
            None => (None, 0),
            Some(suffix) => {
                let split = suffix
                    .find(|c: char| c.is_ascii_digit())
                    .ok_or_else(invalid)?;
                let (label, digits) = suffix.split_at(split);
                if !label.chars().all(|c| c.is_ascii_alphabetic())
                    || !digits.chars().all(|c| c.is_ascii_digit())
                {
                    return Err(invalid());
                }
                let version = digits.parse().map_err(|_| invalid())?;
                ((!label.is_empty()).then(|| label.to_string()), version)
            }
        };

        Ok(Self {
            timestamp,
            label,
            version,
        })
    }
}

impl TryFrom<String> for SnapId {
    type Error = ByoeError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<SnapId> for String {
    fn from(id: SnapId) -> Self {
        id.to_string()
    }
}

impl Ord for SnapId {
    fn cmp(&self, other: &Self) -> Ordering {
        let label = |id: &SnapId| id.label.clone().unwrap_or_default();
        self.timestamp
            .cmp(&other.timestamp)
            .then_with(|| label(self).cmp(&label(other)))
            .then_with(|| self.version.cmp(&other.version))
    }
}

impl PartialOrd for SnapId {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ts(s: &str) -> NaiveDateTime {
        NaiveDateTime::parse_from_str(s, TIMESTAMP_FORMAT).unwrap()
    }

    #[test]
    fn display_forms() {
        let t = ts("20260301000000");
        assert_eq!(SnapId::new(t, None, 0).to_string(), "20260301000000");
        assert_eq!(SnapId::new(t, None, 2).to_string(), "20260301000000.2");
        assert_eq!(
            SnapId::new(t, Some("rc".to_string()), 1).to_string(),
            "20260301000000.rc1"
        );
    }

    #[test]
    fn parses_what_it_prints() {
        for s in ["20260301000000", "20260301000000.2", "20260301000000.rc1", "20260301000000.rc0"] {
            assert_eq!(s.parse::<SnapId>().unwrap().to_string(), s);
        }
    }

    #[test]
    fn rejects_malformed_ids() {
        for s in ["", "latest", "2026030100000x", "20261301000000", "20260301000000.", "20260301000000.rc", "20260301000000.r-c1"] {
            assert!(s.parse::<SnapId>().is_err(), "{s} should not parse");
        }
    }

    #[test]
    fn orders_by_time_then_label_then_version() {
        let a: SnapId = "20260101000000".parse().unwrap();
        let b: SnapId = "20260101000000.1".parse().unwrap();
        let c: SnapId = "20260101000000.rc0".parse().unwrap();
        let d: SnapId = "20260201000000".parse().unwrap();
        let mut ids = vec![d.clone(), c.clone(), b.clone(), a.clone()];
        ids.sort();
        assert_eq!(ids, vec![a, b, c, d]);
    }

    #[test]
    fn serializes_as_string() {
        let id: SnapId = "20260301000000.rc1".parse().unwrap();
        let json = serde_json::to_string(&id).unwrap();
        assert_eq!(json, "\"20260301000000.rc1\"");
        let back: SnapId = serde_json::from_str(&json).unwrap();
        assert_eq!(back, id);
    }

    #[test]
    fn bump_keeps_label() {
        let id = SnapId::new(ts("20260301000000"), Some("nightly".to_string()), 0);
        assert_eq!(id.bump().to_string(), "20260301000000.nightly1");
    }
}
