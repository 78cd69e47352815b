use core::{fmt, time::Duration};

use log::warn;

use crate::error::IntervalError;

/// 580 hours, the longest wake delay the deep-sleep timer accepts.
pub const MAX_INTERVAL_MS: u32 = 2_088_000_000;
pub const DEFAULT_INTERVAL_MS: u32 = 30_000;

const MS_PER_SECOND: u64 = 1_000;
const MS_PER_MINUTE: u64 = 60 * MS_PER_SECOND;
const MS_PER_HOUR: u64 = 60 * MS_PER_MINUTE;
const MS_PER_DAY: u64 = 24 * MS_PER_HOUR;

const ENCODED_LEN: usize = 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct ReportingInterval(u32);

impl Default for ReportingInterval {
    fn default() -> Self {
        Self(DEFAULT_INTERVAL_MS)
    }
}

impl ReportingInterval {
    pub fn from_millis(ms: u32) -> Option<Self> {
        (ms > 0 && ms <= MAX_INTERVAL_MS).then_some(Self(ms))
    }

    pub fn as_millis(self) -> u32 {
        self.0
    }

    pub fn as_duration(self) -> Duration {
        Duration::from_millis(u64::from(self.0))
    }

    pub fn parse(text: &str) -> Result<Self, IntervalError> {
        let text = text.trim_matches(|c: char| c.is_ascii_whitespace() || c == '\0');
        let bytes = text.as_bytes();
        if bytes.len() != ENCODED_LEN {
            return Err(IntervalError::Length(text.chars().count()));
        }
        if let Some(position) = bytes.iter().position(|b| !b.is_ascii_digit()) {
            return Err(IntervalError::NonDigit(position));
        }

        let field = |index: usize| -> u64 {
            let tens = u64::from(bytes[index * 2] - b'0');
            let ones = u64::from(bytes[index * 2 + 1] - b'0');
            tens * 10 + ones
        };

        let total_ms = field(0) * MS_PER_DAY
            + field(1) * MS_PER_HOUR
            + field(2) * MS_PER_MINUTE
            + field(3) * MS_PER_SECOND;

        if total_ms == 0 {
            return Err(IntervalError::Zero);
        }
        if total_ms > u64::from(MAX_INTERVAL_MS) {
            return Err(IntervalError::ExceedsMax(total_ms));
        }

        Ok(Self(total_ms as u32))
    }

    /// Never fails: anything [`parse`](Self::parse) rejects becomes the
    /// 30 s default.
    pub fn decode(text: &str) -> Self {
        Self::parse(text).unwrap_or_else(|err| {
            warn!("interval `{}` rejected ({err}); using default of {DEFAULT_INTERVAL_MS} ms", text.trim());
            Self::default()
        })
    }

    pub fn encode(self) -> String {
        let mut seconds = u64::from(self.0) / MS_PER_SECOND;
        let days = seconds / 86_400;
        seconds %= 86_400;
        let hours = seconds / 3_600;
        seconds %= 3_600;
        let minutes = seconds / 60;
        seconds %= 60;

        format!("{days:02}{hours:02}{minutes:02}{seconds:02}")
    }
}

impl fmt::Display for ReportingInterval {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({} ms)", self.encode(), self.0)
    }
}
