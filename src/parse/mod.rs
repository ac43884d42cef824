use std::collections::HashMap;

use chrono::{DateTime, Duration, NaiveDateTime, NaiveTime, TimeZone, Utc};
use chrono_tz::Tz;
use regex::Regex;
use thiserror::Error;

use crate::calendar::{EventDraft, Repeat, RepeatPatch};

#[derive(Debug, Error)]
pub enum ParseError {
    #[error("could not read a date from `{0}`")]
    InvalidDate(String),
    #[error("`{0}` is not a repeat mode (d, w, m or off)")]
    InvalidRepeat(String),
    #[error("failed to build regex expression")]
    Pattern(#[from] regex::Error),
}

/// Turns raw command text into an event draft. Leading words form the
/// event name; `--start` and `--end` take a date, `--desc` free text and
/// `--repeat` one of `d`, `w`, `m` or `off`. Every field is optional,
/// callers decide which ones their operation needs.
///
/// Dates are read in the guild's timezone: `2025-03-01 18:30`, a bare
/// `18:30` (today in that zone, relative to `now`), or a full RFC 3339
/// stamp. A missing end defaults to one hour after the start.
pub fn parse(input: &str, timezone: Tz, now: DateTime<Utc>) -> Result<EventDraft, ParseError> {
    let tokens: Vec<&str> = input.split_whitespace().collect();

    let mut body = Vec::new();
    let mut i = 0;
    while i < tokens.len() && !tokens[i].starts_with("--") {
        body.push(tokens[i]);
        i += 1;
    }

    let mut flags: HashMap<&str, String> = HashMap::new();
    while i < tokens.len() {
        if let Some(key) = tokens[i].strip_prefix("--") {
            let mut values = Vec::new();
            i += 1;
            while i < tokens.len() && !tokens[i].starts_with("--") {
                values.push(tokens[i]);
                i += 1;
            }
            flags.insert(key, values.join(" "));
        } else {
            i += 1;
        }
    }

    let mut draft = EventDraft::default();

    if !body.is_empty() {
        draft.name = Some(body.join(" "));
    }

    if let Some(value) = flags.get("start") {
        draft.start = Some(parse_when(value, timezone, now)?);
    }
    if let Some(value) = flags.get("end") {
        draft.end = Some(parse_when(value, timezone, now)?);
    } else if let Some(start) = draft.start {
        draft.end = Some(start + Duration::hours(1));
    }

    if let Some(value) = flags.get("desc") {
        if !value.is_empty() {
            draft.description = Some(value.clone());
        }
    }

    if let Some(value) = flags.get("repeat") {
        draft.repeat = Some(match value.as_str() {
            "off" => RepeatPatch::Off,
            other => Repeat::parse(other)
                .map(RepeatPatch::Every)
                .ok_or_else(|| ParseError::InvalidRepeat(other.to_string()))?,
        });
    }

    Ok(draft)
}

fn parse_when(value: &str, timezone: Tz, now: DateTime<Utc>) -> Result<DateTime<Utc>, ParseError> {
    if let Ok(stamped) = DateTime::parse_from_rfc3339(value) {
        return Ok(stamped.with_timezone(&Utc));
    }

    if let Ok(naive) = NaiveDateTime::parse_from_str(value, "%Y-%m-%d %H:%M") {
        return local_to_utc(naive, timezone, value);
    }

    // a bare time means today, in the guild's zone
    let time_only = Regex::new(r"^\d{1,2}:\d{2}$")?;
    if time_only.is_match(value) {
        let time = NaiveTime::parse_from_str(value, "%H:%M")
            .map_err(|_| ParseError::InvalidDate(value.to_string()))?;
        let today = now.with_timezone(&timezone).date_naive();
        return local_to_utc(today.and_time(time), timezone, value);
    }

    Err(ParseError::InvalidDate(value.to_string()))
}

fn local_to_utc(naive: NaiveDateTime, timezone: Tz, raw: &str) -> Result<DateTime<Utc>, ParseError> {
    timezone
        .from_local_datetime(&naive)
        // ambiguous wall clocks (DST fold) take the earlier instant;
        // nonexistent ones (DST gap) are refused
        .earliest()
        .map(|local| local.with_timezone(&Utc))
        .ok_or_else(|| ParseError::InvalidDate(raw.to_string()))
}
