//! Decides whether a [`LicenseStatus`] means the GPU is licensed.
//!
//! The rule is purely textual: the status must contain
//! `Licensed (Expiry: YYYY-MM-DD HH:MM:SS GMT)` somewhere. The expiry is not
//! compared against the clock, so a well-formed timestamp in the past still
//! counts as licensed.

use chrono::{NaiveDateTime, Utc};
use lazy_static::lazy_static;
use regex::Regex;
use tracing::warn;

use crate::status::LicenseStatus;

const EXPIRY_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

lazy_static! {
    static ref LICENSED_PATTERN: Regex =
        Regex::new(r"Licensed \(Expiry: (\d{4}-\d{2}-\d{2} \d{2}:\d{2}:\d{2}) GMT\)")
            .expect("license status pattern is valid");
}

/// Returns true iff the status text carries a well-formed expiry clause.
pub fn is_licensed(status: &LicenseStatus) -> bool {
    is_licensed_text(&status.status_text)
}

/// See [`is_licensed`].
pub fn is_licensed_text(status_text: &str) -> bool {
    LICENSED_PATTERN.is_match(status_text)
}

/// Expiry timestamp from a licensed status, if it is a real calendar date.
///
/// Informational only; the verdict never depends on it.
pub fn expiry(status: &LicenseStatus) -> Option<NaiveDateTime> {
    let captures = LICENSED_PATTERN.captures(&status.status_text)?;
    NaiveDateTime::parse_from_str(captures.get(1)?.as_str(), EXPIRY_FORMAT).ok()
}

/// Evaluate the status and log what the verdict rests on.
pub fn evaluate(status: &LicenseStatus) -> bool {
    let licensed = is_licensed(status);
    if licensed {
        if let Some(expires_at) = expiry(status) {
            if expires_at < Utc::now().naive_utc() {
                warn!(
                    expiry = %expires_at,
                    "Reported license expiry is in the past; still treating GPU as licensed"
                );
            }
        }
    }
    licensed
}
