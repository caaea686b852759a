//! Conditional request headers.
//!
//! Only the two date-based preconditions are supported. Dates use the
//! fixed IMF form `Ddd, DD Mon YYYY HH:MM:SS GMT`; anything else is
//! rejected rather than guessed at.

use std::fmt;
use std::sync::OnceLock;
use std::time::SystemTime;

use chrono::{DateTime, NaiveDate, Utc};
use regex::Regex;

use crate::errors::{Result, VaultError};

/// Conditional headers the server recognises by name.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConditionalHeader {
    IfModifiedSince,
    IfUnmodifiedSince,
    IfMatch,
    IfNoneMatch,
    IfRange,
}

impl ConditionalHeader {
    /// Lowercase header name as it appears on the wire.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::IfModifiedSince => "if-modified-since",
            Self::IfUnmodifiedSince => "if-unmodified-since",
            Self::IfMatch => "if-match",
            Self::IfNoneMatch => "if-none-match",
            Self::IfRange => "if-range",
        }
    }

    /// Look a header up by name, ignoring ASCII case.
    pub fn from_name(name: &str) -> Option<Self> {
        [
            Self::IfModifiedSince,
            Self::IfUnmodifiedSince,
            Self::IfMatch,
            Self::IfNoneMatch,
            Self::IfRange,
        ]
        .into_iter()
        .find(|h| h.as_str().eq_ignore_ascii_case(name))
    }

    fn is_supported(self) -> bool {
        matches!(self, Self::IfModifiedSince | Self::IfUnmodifiedSince)
    }
}

impl fmt::Display for ConditionalHeader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

const MONTHS: [&str; 12] = [
    "Jan", "Feb", "Mar", "Apr", "May", "Jun", "Jul", "Aug", "Sep", "Oct", "Nov", "Dec",
];

fn http_date_pattern() -> Option<&'static Regex> {
    static PATTERN: OnceLock<Option<Regex>> = OnceLock::new();
    PATTERN
        .get_or_init(|| {
            Regex::new(
                r"^(?:Sun|Mon|Tue|Wed|Thu|Fri|Sat), ([012][0-9]|3[01]) (Jan|Feb|Mar|Apr|May|Jun|Jul|Aug|Sep|Oct|Nov|Dec) ([0-9]{4}) ([01][0-9]|2[0-3]):([0-5][0-9]):([0-5][0-9]) GMT$",
            )
            .ok()
        })
        .as_ref()
}

/// Parse an HTTP date. Returns `None` for anything not in the exact
/// `Ddd, DD Mon YYYY HH:MM:SS GMT` form or naming a day that does not
/// exist. The weekday name is not cross-checked against the date.
pub fn parse_http_date(value: &str) -> Option<DateTime<Utc>> {
    let caps = http_date_pattern()?.captures(value)?;
    let num = |i: usize| caps.get(i)?.as_str().parse::<u32>().ok();

    let day = num(1)?;
    let month = MONTHS.iter().position(|m| Some(*m) == caps.get(2).map(|c| c.as_str()))?;
    let year = i32::try_from(num(3)?).ok()?;
    let date = NaiveDate::from_ymd_opt(year, u32::try_from(month).ok()? + 1, day)?;
    let time = date.and_hms_opt(num(4)?, num(5)?, num(6)?)?;
    Some(time.and_utc())
}

/// Format a timestamp the way `parse_http_date` reads it. Sub-second
/// precision is dropped.
pub fn format_http_date(when: SystemTime) -> String {
    DateTime::<Utc>::from(when)
        .format("%a, %d %b %Y %H:%M:%S GMT")
        .to_string()
}

/// The preconditions attached to one request.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Conditions {
    pub if_modified_since: Option<DateTime<Utc>>,
    pub if_unmodified_since: Option<DateTime<Utc>>,
}

impl Conditions {
    pub fn none() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.if_modified_since.is_none() && self.if_unmodified_since.is_none()
    }

    /// Extract preconditions from request headers.
    ///
    /// `If-Match`, `If-None-Match` and `If-Range` are refused outright.
    /// Supported headers with a malformed date are collected and
    /// reported together. Unrelated headers are ignored.
    pub fn from_headers<'a, I>(headers: I) -> Result<Self>
    where
        I: IntoIterator<Item = (&'a str, &'a str)>,
    {
        let mut unsupported = Vec::new();
        let mut invalid = Vec::new();
        let mut conditions = Self::default();

        for (name, value) in headers {
            let Some(header) = ConditionalHeader::from_name(name) else {
                continue;
            };
            if !header.is_supported() {
                if !unsupported.contains(&header) {
                    unsupported.push(header);
                }
                continue;
            }
            match parse_http_date(value.trim()) {
                Some(date) if header == ConditionalHeader::IfModifiedSince => {
                    conditions.if_modified_since = Some(date);
                }
                Some(date) => conditions.if_unmodified_since = Some(date),
                None => {
                    if !invalid.contains(&header) {
                        invalid.push(header);
                    }
                }
            }
        }

        if !unsupported.is_empty() {
            return Err(VaultError::UnsupportedConditionalHeader(
                unsupported.iter().map(|h| h.as_str().to_string()).collect(),
            ));
        }
        if !invalid.is_empty() {
            return Err(VaultError::InvalidConditionalHeader(invalid));
        }
        Ok(conditions)
    }

    /// Evaluate against a file's modification time and return the
    /// headers whose condition does not hold.
    ///
    /// The mtime is truncated to whole seconds first, since that is all
    /// an HTTP date can express.
    pub fn check(&self, mtime: SystemTime) -> Vec<ConditionalHeader> {
        let mut failed = Vec::new();
        if self.is_empty() {
            return failed;
        }
        let mtime = DateTime::<Utc>::from(mtime).timestamp();

        if let Some(bound) = self.if_modified_since {
            if mtime <= bound.timestamp() {
                failed.push(ConditionalHeader::IfModifiedSince);
            }
        }
        if let Some(bound) = self.if_unmodified_since {
            if mtime > bound.timestamp() {
                failed.push(ConditionalHeader::IfUnmodifiedSince);
            }
        }
        failed
    }
}
