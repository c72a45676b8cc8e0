//! Sortable timestamps used as the primary fairness key across instances.
//!
//! A `Stamp` is the canonical 23-char `YYYY_MM_DD_hh_mm_ss_lll` form. Lexical
//! order on the fixed-width string equals chronological order, which is what
//! lets the planner merge peer queues by string comparison alone.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Datelike, NaiveDateTime, TimeZone, Timelike, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const STAMP_LEN: usize = 23;
const FIELD_WIDTHS: [usize; 7] = [4, 2, 2, 2, 2, 2, 3];

#[derive(Debug, Error, PartialEq, Eq)]
pub enum StampError {
    #[error("stamp has wrong length {0}, expected {STAMP_LEN}")]
    BadLength(usize),
    #[error("stamp '{0}' is not in YYYY_MM_DD_hh_mm_ss_lll form")]
    BadFormat(String),
}

/// A sortable `YYYY_MM_DD_hh_mm_ss_lll` timestamp.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Stamp(String);

impl Stamp {
    pub fn now() -> Self {
        Self::from_datetime(Utc::now())
    }

    pub fn from_datetime(dt: DateTime<Utc>) -> Self {
        Stamp(format!(
            "{:04}_{:02}_{:02}_{:02}_{:02}_{:02}_{:03}",
            dt.year(),
            dt.month(),
            dt.day(),
            dt.hour(),
            dt.minute(),
            dt.second(),
            dt.timestamp_subsec_millis()
        ))
    }

    pub fn parse(s: &str) -> Result<Self, StampError> {
        if s.len() != STAMP_LEN {
            return Err(StampError::BadLength(s.len()));
        }
        let parts: Vec<&str> = s.split('_').collect();
        if parts.len() != FIELD_WIDTHS.len() {
            return Err(StampError::BadFormat(s.to_string()));
        }
        for (part, width) in parts.iter().zip(FIELD_WIDTHS.iter()) {
            if part.len() != *width || !part.chars().all(|c| c.is_ascii_digit()) {
                return Err(StampError::BadFormat(s.to_string()));
            }
        }
        Ok(Stamp(s.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Milliseconds since the Unix epoch, used in heartbeat and disk-use names.
    pub fn unix_millis(&self) -> Result<i64, StampError> {
        let naive = NaiveDateTime::parse_from_str(&self.0, "%Y_%m_%d_%H_%M_%S_%3f")
            .map_err(|_| StampError::BadFormat(self.0.clone()))?;
        Ok(Utc.from_utc_datetime(&naive).timestamp_millis())
    }
}

impl fmt::Display for Stamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for Stamp {
    type Err = StampError;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}
