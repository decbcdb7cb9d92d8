//! Encoding and decoding of the job sort key.
//!
//! `encode_sk(scheduled_for, job_id)` produces
//! `"scheduled#" + ISO8601(UTC, scheduled_for) + "#" + hex(job_id)`.
//! The fixed `+00:00` offset keeps lexical and chronological order in
//! agreement; the hex job-id encoding uses only `[0-9a-f]`, so any byte
//! greater than `f` works as a sentinel upper bound for range queries.

use chrono::{DateTime, SecondsFormat, Utc};
use uuid::Uuid;

use crate::error::KvError;

const PREFIX: &str = "scheduled#";

/// A sentinel suffix greater than every legal hex job-id encoding,
/// usable as the exclusive upper end of a due-jobs range scan.
pub const SENTINEL_MAX: &str = "~";

/// Format a UTC instant with a fixed `+00:00` offset so string order
/// agrees with chronological order.
pub fn format_iso8601(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, false)
}

/// Build the sort key for a scheduled job.
pub fn encode_sk(scheduled_for: DateTime<Utc>, job_id: Uuid) -> String {
    format!(
        "{PREFIX}{}#{}",
        format_iso8601(scheduled_for),
        job_id.simple()
    )
}

/// Build the exclusive upper bound for a due-jobs query at `now`: every
/// job whose SK sorts at or before this bound is due.
pub fn due_upper_bound(now: DateTime<Utc>) -> String {
    format!("{PREFIX}{}#{SENTINEL_MAX}", format_iso8601(now))
}

/// Invert [`encode_sk`]. Malformed input yields [`KvError::InvalidKey`].
pub fn decode_sk(sk: &str) -> Result<(DateTime<Utc>, Uuid), KvError> {
    let rest = sk
        .strip_prefix(PREFIX)
        .ok_or_else(|| KvError::InvalidKey(sk.to_string()))?;
    let (ts_part, id_part) = rest
        .rsplit_once('#')
        .ok_or_else(|| KvError::InvalidKey(sk.to_string()))?;

    let ts = DateTime::parse_from_rfc3339(ts_part)
        .map_err(|_| KvError::InvalidKey(sk.to_string()))?
        .with_timezone(&Utc);

    if !id_part.chars().all(|c| c.is_ascii_hexdigit()) {
        return Err(KvError::InvalidKey(sk.to_string()));
    }
    let job_id = Uuid::parse_str(id_part).map_err(|_| KvError::InvalidKey(sk.to_string()))?;

    Ok((ts, job_id))
}
