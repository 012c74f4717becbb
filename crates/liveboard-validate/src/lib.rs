//! Coercion and rejection rules turning raw provider entries into an [`IngestionBatch`].

use std::collections::HashSet;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use liveboard_core::{
    DiscardReason, DiscardSummary, IngestionBatch, RawDeparture, Station, ValidatedRecord,
};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use thiserror::Error;
use tracing::{debug, warn};

pub const TRAIN_ID_MAX_LEN: usize = 50;
pub const PLATFORM_MAX_LEN: usize = 20;
pub const STATION_NAME_MIN_LEN: usize = 2;
pub const STATION_NAME_MAX_LEN: usize = 100;

/// 2000-01-01T00:00:00Z
const MIN_SCHEDULED_SECS: i64 = 946_684_800;
/// 2100-01-01T00:00:00Z
const MAX_SCHEDULED_SECS: i64 = 4_102_444_800;

/// Which entry survives when several share a natural key within one batch.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum DedupPolicy {
    /// Provider lists are in refresh order: the last entry is the freshest.
    #[default]
    LastWins,
    FirstWins,
}

impl FromStr for DedupPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "last-wins" | "last" => Ok(DedupPolicy::LastWins),
            "first-wins" | "first" => Ok(DedupPolicy::FirstWins),
            other => Err(format!("unknown dedup policy `{other}`")),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum Rejection {
    #[error("missing required field `{0}`")]
    Missing(&'static str),
    #[error("field `{field}` is not coercible: {value}")]
    NotCoercible { field: &'static str, value: String },
    #[error("scheduled time {0} is outside the accepted range")]
    TimeOutOfRange(i64),
    #[error("negative delay of {0}s")]
    NegativeDelay(i64),
}

impl Rejection {
    pub fn reason(&self) -> DiscardReason {
        match self {
            Rejection::NegativeDelay(_) => DiscardReason::InvalidDelay,
            Rejection::Missing(_) | Rejection::NotCoercible { .. } | Rejection::TimeOutOfRange(_) => {
                DiscardReason::MalformedRecord
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StationNameError {
    #[error("station name must be a non-empty string")]
    Empty,
    #[error("invalid station name length {0} (expected 2..=100 characters)")]
    Length(usize),
}

/// Trims a caller-supplied station name and checks its length.
pub fn normalize_station_name(input: &str) -> Result<String, StationNameError> {
    let trimmed = input.trim();
    if trimmed.is_empty() {
        return Err(StationNameError::Empty);
    }
    let len = trimmed.chars().count();
    if !(STATION_NAME_MIN_LEN..=STATION_NAME_MAX_LEN).contains(&len) {
        return Err(StationNameError::Length(len));
    }
    Ok(trimmed.to_string())
}

#[derive(Debug, Clone, Copy, Default)]
pub struct RecordValidator {
    policy: DedupPolicy,
}

impl RecordValidator {
    pub fn new(policy: DedupPolicy) -> Self {
        Self { policy }
    }

    pub fn policy(&self) -> DedupPolicy {
        self.policy
    }

    pub fn validate(&self, station: &Station, raw: Vec<RawDeparture>) -> IngestionBatch {
        self.validate_at(station, raw, Utc::now())
    }

    /// Same as [`RecordValidator::validate`] with an explicit batch timestamp.
    pub fn validate_at(
        &self,
        station: &Station,
        raw: Vec<RawDeparture>,
        collected_at: DateTime<Utc>,
    ) -> IngestionBatch {
        let mut discarded = DiscardSummary::default();
        let mut accepted = Vec::with_capacity(raw.len());

        for (index, entry) in raw.iter().enumerate() {
            match validate_departure(&station.id, entry, collected_at) {
                Ok(record) => accepted.push(record),
                Err(rejection) => {
                    warn!(
                        station = %station.id,
                        index,
                        reason = %rejection.reason(),
                        error = %rejection,
                        "discarding departure"
                    );
                    discarded.record(rejection.reason());
                }
            }
        }

        let before = accepted.len();
        let records = dedup_by_natural_key(accepted, self.policy);
        if records.len() < before {
            debug!(
                station = %station.id,
                duplicates = before - records.len(),
                "collapsed duplicate departures"
            );
        }

        IngestionBatch {
            station_id: station.id.clone(),
            collected_at,
            records,
            discarded,
        }
    }
}

/// Keeps one record per natural key. The survivor keeps its own position in
/// the input order.
pub fn dedup_by_natural_key(records: Vec<ValidatedRecord>, policy: DedupPolicy) -> Vec<ValidatedRecord> {
    let mut seen = HashSet::with_capacity(records.len());
    match policy {
        DedupPolicy::FirstWins => records
            .into_iter()
            .filter(|r| seen.insert(r.natural_key()))
            .collect(),
        DedupPolicy::LastWins => {
            let mut kept = records
                .into_iter()
                .rev()
                .filter(|r| seen.insert(r.natural_key()))
                .collect::<Vec<_>>();
            kept.reverse();
            kept
        }
    }
}

pub fn validate_departure(
    station_id: &str,
    raw: &RawDeparture,
    collected_at: DateTime<Utc>,
) -> Result<ValidatedRecord, Rejection> {
    // Every required field must coerce before the delay sign is judged, so a
    // record missing a field is malformed even when its delay is negative.
    let train_id = train_id(raw)?;
    let scheduled_time = scheduled_time(raw)?;
    let delay = raw_delay(raw)?;
    let destination = destination(raw)?;
    let delay_seconds = checked_delay(delay)?;

    Ok(ValidatedRecord {
        station_id: station_id.to_string(),
        train_id,
        scheduled_time,
        delay_seconds,
        platform: platform(raw),
        destination,
        canceled: canceled(raw),
        collected_at,
    })
}

fn text_or_none(value: &JsonValue) -> Option<String> {
    let text = match value {
        JsonValue::String(s) => s.trim().to_string(),
        JsonValue::Number(n) => n.to_string(),
        _ => return None,
    };
    if text.is_empty() {
        None
    } else {
        Some(text)
    }
}

fn truncate_chars(value: &str, max: usize) -> String {
    value.chars().take(max).collect()
}

/// Integer from a JSON number or a numeric string. `Ok(None)` when absent or blank.
fn integer_field(raw: &RawDeparture, field: &'static str) -> Result<Option<i64>, Rejection> {
    let Some(value) = raw.lookup(&[field]) else {
        return Ok(None);
    };
    let not_coercible = || Rejection::NotCoercible {
        field,
        value: value.to_string(),
    };
    match value {
        JsonValue::Null => Ok(None),
        JsonValue::Number(n) => {
            if let Some(i) = n.as_i64() {
                Ok(Some(i))
            } else {
                match n.as_f64() {
                    Some(f) if f.fract() == 0.0 && f.abs() < i64::MAX as f64 => Ok(Some(f as i64)),
                    _ => Err(not_coercible()),
                }
            }
        }
        JsonValue::String(s) if s.trim().is_empty() => Ok(None),
        JsonValue::String(s) => s.trim().parse::<i64>().map(Some).map_err(|_| not_coercible()),
        _ => Err(not_coercible()),
    }
}

fn train_id(raw: &RawDeparture) -> Result<String, Rejection> {
    let value = raw
        .lookup(&["vehicle"])
        .and_then(text_or_none)
        .ok_or(Rejection::Missing("vehicle"))?;
    if !value
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | ' '))
    {
        warn!(train_id = %value, "unusual train id format");
    }
    Ok(truncate_chars(&value, TRAIN_ID_MAX_LEN))
}

fn scheduled_time(raw: &RawDeparture) -> Result<DateTime<Utc>, Rejection> {
    let secs = integer_field(raw, "time")?.ok_or(Rejection::Missing("time"))?;
    if !(MIN_SCHEDULED_SECS..=MAX_SCHEDULED_SECS).contains(&secs) {
        return Err(Rejection::TimeOutOfRange(secs));
    }
    DateTime::from_timestamp(secs, 0).ok_or(Rejection::TimeOutOfRange(secs))
}

fn raw_delay(raw: &RawDeparture) -> Result<i64, Rejection> {
    integer_field(raw, "delay")?.ok_or(Rejection::Missing("delay"))
}

fn checked_delay(delay: i64) -> Result<i32, Rejection> {
    if delay < 0 {
        return Err(Rejection::NegativeDelay(delay));
    }
    i32::try_from(delay).map_err(|_| Rejection::NotCoercible {
        field: "delay",
        value: delay.to_string(),
    })
}

fn destination(raw: &RawDeparture) -> Result<String, Rejection> {
    raw.lookup(&["stationinfo", "name"])
        .and_then(text_or_none)
        .or_else(|| raw.lookup(&["station"]).and_then(text_or_none))
        .ok_or(Rejection::Missing("destination"))
}

fn platform(raw: &RawDeparture) -> Option<String> {
    raw.lookup(&["platform"])
        .and_then(text_or_none)
        .or_else(|| raw.lookup(&["platforminfo", "name"]).and_then(text_or_none))
        .filter(|p| p != "?")
        .map(|p| truncate_chars(&p, PLATFORM_MAX_LEN))
}

fn canceled(raw: &RawDeparture) -> bool {
    match raw.lookup(&["canceled"]) {
        Some(JsonValue::Bool(b)) => *b,
        Some(JsonValue::Number(n)) => n.as_i64().is_some_and(|v| v != 0),
        Some(JsonValue::String(s)) => matches!(s.trim(), "1" | "true" | "TRUE" | "True"),
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use serde_json::json;
    use std::path::Path;

    fn brussels() -> Station {
        Station::new("Brussels-Central", "Brussels-Central")
    }

    fn at() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 10, 19, 12, 55, 0).single().unwrap()
    }

    fn fixture_departures() -> Vec<RawDeparture> {
        let path = Path::new(env!("CARGO_MANIFEST_DIR"))
            .join("../../fixtures/irail/liveboard_brussels_central.json");
        let doc: JsonValue =
            serde_json::from_str(&std::fs::read_to_string(path).expect("fixture")).expect("json");
        doc["departures"]["departure"]
            .as_array()
            .unwrap()
            .iter()
            .cloned()
            .map(RawDeparture::new)
            .collect()
    }

    fn departure(vehicle: &str, time: JsonValue, delay: JsonValue) -> RawDeparture {
        RawDeparture::new(json!({
            "vehicle": vehicle,
            "time": time,
            "delay": delay,
            "station": "Oostende",
            "platform": "3",
        }))
    }

    #[test]
    fn fixture_board_is_cleaned_and_deduplicated() {
        let batch = RecordValidator::default().validate_at(&brussels(), fixture_departures(), at());

        let trains = batch.records.iter().map(|r| r.train_id.as_str()).collect::<Vec<_>>();
        assert_eq!(trains, vec!["BE.NMBS.S11968", "BE.NMBS.IC1832", "BE.NMBS.L4352"]);
        assert_eq!(batch.discarded.malformed, 1);
        assert_eq!(batch.discarded.invalid_delay, 1);

        let s1 = &batch.records[0];
        assert_eq!(s1.platform, None);
        assert_eq!(s1.delay_seconds, 180);
        assert_eq!(s1.destination, "Nivelles");

        let ic = &batch.records[1];
        assert_eq!(ic.delay_seconds, 120);
        assert_eq!(ic.platform.as_deref(), Some("3"));
        assert_eq!(
            ic.scheduled_time,
            Utc.with_ymd_and_hms(2025, 10, 19, 13, 0, 0).single().unwrap()
        );

        assert!(batch.records[2].canceled);
        assert!(batch.records.iter().all(|r| r.collected_at == at()));
        assert!(batch.records.iter().all(|r| r.station_id == "Brussels-Central"));
    }

    #[test]
    fn duplicate_key_keeps_last_delay() {
        let raw = vec![
            departure("BE.NMBS.IC1832", json!("1760878800"), json!("60")),
            departure("BE.NMBS.IC1832", json!("1760878800"), json!("240")),
        ];
        let batch = RecordValidator::default().validate_at(&brussels(), raw, at());
        assert_eq!(batch.len(), 1);
        assert_eq!(batch.records[0].delay_seconds, 240);
    }

    #[test]
    fn first_wins_policy_keeps_earliest_entry() {
        let raw = vec![
            departure("BE.NMBS.IC1832", json!("1760878800"), json!("60")),
            departure("BE.NMBS.P7001", json!("1760879100"), json!("0")),
            departure("BE.NMBS.IC1832", json!("1760878800"), json!("240")),
        ];
        let batch = RecordValidator::new(DedupPolicy::FirstWins).validate_at(&brussels(), raw, at());
        assert_eq!(batch.len(), 2);
        assert_eq!(batch.records[0].train_id, "BE.NMBS.IC1832");
        assert_eq!(batch.records[0].delay_seconds, 60);
    }

    #[test]
    fn same_train_at_different_times_is_not_a_duplicate() {
        let raw = vec![
            departure("BE.NMBS.IC1832", json!(1760878800), json!(0)),
            departure("BE.NMBS.IC1832", json!(1760882400), json!(0)),
        ];
        let batch = RecordValidator::default().validate_at(&brussels(), raw, at());
        assert_eq!(batch.len(), 2);
    }

    #[test]
    fn negative_delay_is_counted_as_invalid_delay() {
        let raw = vec![departure("BE.NMBS.IC1832", json!("1760878800"), json!(-5))];
        let batch = RecordValidator::default().validate_at(&brussels(), raw, at());
        assert!(batch.is_empty());
        assert_eq!(batch.discarded.invalid_delay, 1);
        assert_eq!(batch.discarded.malformed, 0);
    }

    #[test]
    fn non_numeric_or_missing_delay_is_malformed() {
        let raw = vec![
            departure("BE.NMBS.IC1832", json!("1760878800"), json!("late")),
            departure("BE.NMBS.IC1833", json!("1760878800"), json!(null)),
            departure("BE.NMBS.IC1834", json!("1760878800"), json!(12.5)),
        ];
        let batch = RecordValidator::default().validate_at(&brussels(), raw, at());
        assert!(batch.is_empty());
        assert_eq!(batch.discarded.malformed, 3);
    }

    #[test]
    fn json_numbers_are_accepted_like_strings() {
        let record = validate_departure(
            "Brussels-Central",
            &departure("BE.NMBS.IC1832", json!(1760878800), json!(300)),
            at(),
        )
        .unwrap();
        assert_eq!(record.delay_seconds, 300);
        assert_eq!(record.scheduled_time.timestamp(), 1760878800);
    }

    #[test]
    fn missing_field_outranks_negative_delay() {
        let raw = RawDeparture::new(json!({"vehicle": "BE.NMBS.IC1832", "time": "1760878800", "delay": "-5"}));
        assert_eq!(
            validate_departure("B", &raw, at()).unwrap_err(),
            Rejection::Missing("destination")
        );

        let batch = RecordValidator::default().validate_at(&brussels(), vec![raw], at());
        assert_eq!(batch.discarded.malformed, 1);
        assert_eq!(batch.discarded.invalid_delay, 0);
    }

    #[test]
    fn rejections_map_to_reasons() {
        let missing_vehicle = RawDeparture::new(json!({"time": "1760878800", "delay": "0", "station": "X"}));
        assert_eq!(
            validate_departure("B", &missing_vehicle, at()).unwrap_err(),
            Rejection::Missing("vehicle")
        );

        let ancient = departure("BE.NMBS.IC1", json!("86400"), json!("0"));
        let err = validate_departure("B", &ancient, at()).unwrap_err();
        assert_eq!(err, Rejection::TimeOutOfRange(86400));
        assert_eq!(err.reason(), DiscardReason::MalformedRecord);

        let no_destination = RawDeparture::new(json!({"vehicle": "V", "time": "1760878800", "delay": "0"}));
        assert_eq!(
            validate_departure("B", &no_destination, at()).unwrap_err(),
            Rejection::Missing("destination")
        );

        assert_eq!(Rejection::NegativeDelay(-1).reason(), DiscardReason::InvalidDelay);
    }

    #[test]
    fn long_values_are_truncated() {
        let long_id = "X".repeat(80);
        let raw = RawDeparture::new(json!({
            "vehicle": long_id,
            "time": "1760878800",
            "delay": "0",
            "station": "Oostende",
            "platform": "P".repeat(30),
        }));
        let record = validate_departure("B", &raw, at()).unwrap();
        assert_eq!(record.train_id.len(), TRAIN_ID_MAX_LEN);
        assert_eq!(record.platform.unwrap().len(), PLATFORM_MAX_LEN);
    }

    #[test]
    fn platform_falls_back_to_platforminfo() {
        let raw = RawDeparture::new(json!({
            "vehicle": "BE.NMBS.IC1832",
            "time": "1760878800",
            "delay": "0",
            "station": "Oostende",
            "platforminfo": {"name": "7", "normal": "1"},
        }));
        let record = validate_departure("B", &raw, at()).unwrap();
        assert_eq!(record.platform.as_deref(), Some("7"));
        assert!(!record.canceled);
    }

    #[test]
    fn empty_board_yields_empty_batch() {
        let batch = RecordValidator::default().validate_at(&brussels(), Vec::new(), at());
        assert!(batch.is_empty());
        assert_eq!(batch.discarded.total(), 0);
        assert_eq!(batch.station_id, "Brussels-Central");
    }

    #[test]
    fn station_names_are_trimmed_and_bounded() {
        assert_eq!(normalize_station_name("  Leuven ").unwrap(), "Leuven");
        assert_eq!(normalize_station_name("   "), Err(StationNameError::Empty));
        assert_eq!(normalize_station_name("X"), Err(StationNameError::Length(1)));
        assert_eq!(
            normalize_station_name(&"a".repeat(101)),
            Err(StationNameError::Length(101))
        );
    }

    #[test]
    fn dedup_policy_parses_from_config_strings() {
        assert_eq!("last-wins".parse::<DedupPolicy>().unwrap(), DedupPolicy::LastWins);
        assert_eq!("First".parse::<DedupPolicy>().unwrap(), DedupPolicy::FirstWins);
        assert!("newest".parse::<DedupPolicy>().is_err());
    }
}
