//! Best-effort coercion of legacy values into the canonical vocabulary.
//!
//! Every function here is total: absent, malformed or unrecognized input maps
//! to a fixed default instead of an error. [`Classified`] additionally records
//! how a value was resolved so callers can audit defaulted inputs.

use chrono::{DateTime, NaiveDate, NaiveDateTime, TimeZone, Utc};
use serde_json::Value;

use crate::{
    AttendanceStatus, BeneficiaryStatus, RegistrationMethod, SessionStatus, Sex, TrainingLevel,
    TrainingStatus, TrainingType,
};

/// How a classified value was obtained.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resolution {
    /// A keyword matched the input.
    Matched,
    /// The input was null, missing or blank.
    Absent,
    /// The input was present but matched nothing.
    Defaulted,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Classified<T> {
    pub value: T,
    pub resolution: Resolution,
}

impl<T> Classified<T> {
    /// True when a present input was replaced by the default.
    pub fn coerced(&self) -> bool {
        self.resolution == Resolution::Defaulted
    }
}

/// Mapping from a loosely-typed legacy scalar to one vocabulary member.
pub trait Normalize: Copy + Sized {
    fn classify(value: &Value) -> Classified<Self>;

    fn from_legacy(value: &Value) -> Self {
        Self::classify(value).value
    }
}

pub fn is_present(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::String(s) => !s.trim().is_empty(),
        _ => true,
    }
}

fn scalar_lowercase(value: &Value) -> Option<String> {
    match value {
        Value::String(s) if !s.trim().is_empty() => Some(s.trim().to_lowercase()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

/// First rule whose keyword list has a substring of `text` wins.
fn classify_contains<T: Copy>(
    text: Option<String>,
    rules: &[(T, &[&str])],
    default: T,
) -> Classified<T> {
    let Some(text) = text else {
        return Classified {
            value: default,
            resolution: Resolution::Absent,
        };
    };
    for (value, keywords) in rules {
        if keywords.iter().any(|k| text.contains(k)) {
            return Classified {
                value: *value,
                resolution: Resolution::Matched,
            };
        }
    }
    Classified {
        value: default,
        resolution: Resolution::Defaulted,
    }
}

impl Normalize for Sex {
    /// Only textual input is considered; other scalars fall back to `M`.
    fn classify(value: &Value) -> Classified<Self> {
        match value {
            Value::String(_) | Value::Null => classify_contains(
                scalar_lowercase(value),
                &[(Sex::Female, &["f", "female"]), (Sex::Male, &["m", "male"])],
                Sex::Male,
            ),
            _ => Classified {
                value: Sex::Male,
                resolution: Resolution::Defaulted,
            },
        }
    }
}

impl Normalize for BeneficiaryStatus {
    /// Exact match: only "inactive", "false" or "0" deactivate.
    fn classify(value: &Value) -> Classified<Self> {
        match scalar_lowercase(value) {
            None => Classified {
                value: BeneficiaryStatus::Active,
                resolution: Resolution::Absent,
            },
            Some(text) if matches!(text.as_str(), "inactive" | "false" | "0") => Classified {
                value: BeneficiaryStatus::Inactive,
                resolution: Resolution::Matched,
            },
            Some(text) if text == "active" || text == "true" || text == "1" => Classified {
                value: BeneficiaryStatus::Active,
                resolution: Resolution::Matched,
            },
            Some(_) => Classified {
                value: BeneficiaryStatus::Active,
                resolution: Resolution::Defaulted,
            },
        }
    }
}

impl Normalize for TrainingStatus {
    fn classify(value: &Value) -> Classified<Self> {
        classify_contains(
            scalar_lowercase(value),
            &[
                (TrainingStatus::Ongoing, &["ongoing", "active", "running"]),
                (TrainingStatus::Completed, &["completed", "finished", "done"]),
                (TrainingStatus::Cancelled, &["cancelled", "canceled"]),
                (TrainingStatus::Draft, &["draft"]),
            ],
            TrainingStatus::Draft,
        )
    }
}

impl Normalize for TrainingType {
    fn classify(value: &Value) -> Classified<Self> {
        classify_contains(
            scalar_lowercase(value),
            &[
                (TrainingType::Course, &["course", "class"]),
                (TrainingType::Seminar, &["seminar", "conference"]),
                (TrainingType::Workshop, &["workshop"]),
            ],
            TrainingType::Workshop,
        )
    }
}

impl Normalize for TrainingLevel {
    fn classify(value: &Value) -> Classified<Self> {
        classify_contains(
            scalar_lowercase(value),
            &[
                (TrainingLevel::National, &["national", "country"]),
                (TrainingLevel::Cluster, &["cluster", "regional"]),
                (TrainingLevel::Provincial, &["provincial", "province"]),
            ],
            TrainingLevel::Provincial,
        )
    }
}

impl Normalize for AttendanceStatus {
    fn classify(value: &Value) -> Classified<Self> {
        classify_contains(
            scalar_lowercase(value),
            &[
                (AttendanceStatus::Attended, &["attended", "present"]),
                (AttendanceStatus::Completed, &["completed", "finished"]),
                (AttendanceStatus::Dropped, &["dropped", "withdrawn", "left"]),
                (AttendanceStatus::Registered, &["registered"]),
            ],
            AttendanceStatus::Registered,
        )
    }
}

impl Normalize for SessionStatus {
    fn classify(value: &Value) -> Classified<Self> {
        classify_contains(
            scalar_lowercase(value),
            &[
                (SessionStatus::Absent, &["absent", "missed"]),
                (SessionStatus::Late, &["late", "delayed"]),
                (SessionStatus::Excused, &["excused", "excusal"]),
                (SessionStatus::Present, &["present"]),
            ],
            SessionStatus::Present,
        )
    }
}

impl Normalize for RegistrationMethod {
    fn classify(value: &Value) -> Classified<Self> {
        classify_contains(
            scalar_lowercase(value),
            &[
                (RegistrationMethod::Qr, &["qr", "scan"]),
                (RegistrationMethod::Import, &["import", "bulk"]),
                (RegistrationMethod::Manual, &["manual"]),
            ],
            RegistrationMethod::Manual,
        )
    }
}

pub fn coerce_text(value: &Value) -> Option<String> {
    match value {
        Value::Null => None,
        Value::String(s) if s.trim().is_empty() => None,
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        other => Some(other.to_string()),
    }
}

/// Accepts RFC 3339, naive date-times (read as UTC), plain dates and epoch millis.
pub fn coerce_timestamp(value: &Value) -> Option<DateTime<Utc>> {
    match value {
        Value::String(s) => parse_timestamp(s.trim()),
        Value::Number(n) => n
            .as_i64()
            .and_then(|millis| Utc.timestamp_millis_opt(millis).single()),
        _ => None,
    }
}

fn parse_timestamp(text: &str) -> Option<DateTime<Utc>> {
    if text.is_empty() {
        return None;
    }
    if let Ok(ts) = DateTime::parse_from_rfc3339(text) {
        return Some(ts.with_timezone(&Utc));
    }
    for format in ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f"] {
        if let Ok(naive) = NaiveDateTime::parse_from_str(text, format) {
            return Some(naive.and_utc());
        }
    }
    for format in ["%Y-%m-%d %H:%M:%S%.f%#z", "%Y-%m-%dT%H:%M:%S%.f%#z"] {
        if let Ok(ts) = DateTime::parse_from_str(text, format) {
            return Some(ts.with_timezone(&Utc));
        }
    }
    NaiveDate::parse_from_str(text, "%Y-%m-%d")
        .ok()
        .and_then(|d| d.and_hms_opt(0, 0, 0))
        .map(|naive| naive.and_utc())
}

pub fn coerce_flag(value: &Value) -> bool {
    match value {
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().map(|f| f != 0.0).unwrap_or(false),
        Value::String(s) => !matches!(
            s.trim().to_lowercase().as_str(),
            "" | "false" | "0" | "no" | "n" | "f"
        ),
        Value::Null => false,
        _ => true,
    }
}

pub fn coerce_float(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse::<f64>().ok().filter(|f| f.is_finite()),
        _ => None,
    }
}

pub fn coerce_int(value: &Value) -> Option<i32> {
    match value {
        Value::Number(n) => n
            .as_i64()
            .or_else(|| n.as_f64().map(|f| f.round() as i64))
            .and_then(|i| i32::try_from(i).ok()),
        Value::String(s) => {
            let s = s.trim();
            s.parse::<i32>()
                .ok()
                .or_else(|| coerce_int(&Value::from(s.parse::<f64>().ok()?)))
        }
        _ => None,
    }
}

/// Issues `MIGRATED_<source>_<millis>_<ordinal>` keys for rows without a natural key.
///
/// One synthesizer lives for one source within one run; the ordinal advances on
/// every call, so keys stay distinct even when writes fail.
#[derive(Debug, Clone)]
pub struct KeySynthesizer {
    prefix: String,
    next: u64,
}

impl KeySynthesizer {
    pub fn new(source_id: &str, run_started_at: DateTime<Utc>) -> Self {
        let tag = source_id
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() { c } else { '_' })
            .collect::<String>();
        Self {
            prefix: format!("MIGRATED_{}_{}", tag, run_started_at.timestamp_millis()),
            next: 0,
        }
    }

    pub fn next_key(&mut self) -> String {
        let key = format!("{}_{}", self.prefix, self.next);
        self.next += 1;
        key
    }

    pub fn issued(&self) -> u64 {
        self.next
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn sex_prefers_female_keyword() {
        assert_eq!(Sex::from_legacy(&json!("Female")), Sex::Female);
        assert_eq!(Sex::from_legacy(&json!("F")), Sex::Female);
        assert_eq!(Sex::from_legacy(&json!("male")), Sex::Male);
        assert_eq!(Sex::from_legacy(&json!(null)), Sex::Male);
        assert_eq!(Sex::from_legacy(&json!(1)), Sex::Male);
        assert!(Sex::classify(&json!("unknown")).coerced());
    }

    #[test]
    fn status_deactivates_only_on_exact_values() {
        assert_eq!(BeneficiaryStatus::from_legacy(&json!(null)), BeneficiaryStatus::Active);
        assert_eq!(BeneficiaryStatus::from_legacy(&json!("INACTIVE")), BeneficiaryStatus::Inactive);
        assert_eq!(BeneficiaryStatus::from_legacy(&json!(false)), BeneficiaryStatus::Inactive);
        assert_eq!(BeneficiaryStatus::from_legacy(&json!("0")), BeneficiaryStatus::Inactive);
        assert_eq!(BeneficiaryStatus::from_legacy(&json!(0)), BeneficiaryStatus::Inactive);
        assert_eq!(BeneficiaryStatus::from_legacy(&json!("inactive soon")), BeneficiaryStatus::Active);
    }

    #[test]
    fn training_status_keyword_groups() {
        assert_eq!(TrainingStatus::from_legacy(&json!("RUNNING")), TrainingStatus::Ongoing);
        assert_eq!(TrainingStatus::from_legacy(&json!("Active")), TrainingStatus::Ongoing);
        assert_eq!(TrainingStatus::from_legacy(&json!("done")), TrainingStatus::Completed);
        assert_eq!(TrainingStatus::from_legacy(&json!("Canceled")), TrainingStatus::Cancelled);
        assert_eq!(TrainingStatus::from_legacy(&json!("planned")), TrainingStatus::Draft);
        assert_eq!(TrainingStatus::from_legacy(&json!(null)), TrainingStatus::Draft);
    }

    #[test]
    fn type_and_level_defaults() {
        assert_eq!(TrainingType::from_legacy(&json!("Online class")), TrainingType::Course);
        assert_eq!(TrainingType::from_legacy(&json!("conference")), TrainingType::Seminar);
        assert_eq!(TrainingType::from_legacy(&json!(7)), TrainingType::Workshop);
        assert_eq!(TrainingLevel::from_legacy(&json!("country-wide")), TrainingLevel::National);
        assert_eq!(TrainingLevel::from_legacy(&json!("Regional")), TrainingLevel::Cluster);
        assert_eq!(TrainingLevel::from_legacy(&json!("")), TrainingLevel::Provincial);
    }

    #[test]
    fn enrollment_and_session_statuses() {
        assert_eq!(AttendanceStatus::from_legacy(&json!("present")), AttendanceStatus::Attended);
        assert_eq!(AttendanceStatus::from_legacy(&json!("finished")), AttendanceStatus::Completed);
        assert_eq!(AttendanceStatus::from_legacy(&json!("left early")), AttendanceStatus::Dropped);
        assert_eq!(AttendanceStatus::from_legacy(&json!(true)), AttendanceStatus::Registered);
        assert_eq!(SessionStatus::from_legacy(&json!("MISSED")), SessionStatus::Absent);
        assert_eq!(SessionStatus::from_legacy(&json!("delayed")), SessionStatus::Late);
        assert_eq!(SessionStatus::from_legacy(&json!("excused")), SessionStatus::Excused);
        assert_eq!(SessionStatus::from_legacy(&json!(null)), SessionStatus::Present);
    }

    #[test]
    fn registration_method_groups() {
        assert_eq!(RegistrationMethod::from_legacy(&json!("QR code")), RegistrationMethod::Qr);
        assert_eq!(RegistrationMethod::from_legacy(&json!("scan")), RegistrationMethod::Qr);
        assert_eq!(RegistrationMethod::from_legacy(&json!("Bulk upload")), RegistrationMethod::Import);
        assert_eq!(RegistrationMethod::from_legacy(&json!("walk-in")), RegistrationMethod::Manual);
    }

    #[test]
    fn resolution_distinguishes_absent_from_defaulted() {
        assert_eq!(TrainingType::classify(&json!(null)).resolution, Resolution::Absent);
        assert_eq!(TrainingType::classify(&json!("  ")).resolution, Resolution::Absent);
        assert_eq!(TrainingType::classify(&json!("hackathon")).resolution, Resolution::Defaulted);
        assert_eq!(TrainingType::classify(&json!("workshop")).resolution, Resolution::Matched);
    }

    #[test]
    fn timestamps_accept_common_legacy_shapes() {
        let expected = Utc.with_ymd_and_hms(2024, 1, 1, 8, 30, 0).unwrap();
        assert_eq!(coerce_timestamp(&json!("2024-01-01T08:30:00Z")), Some(expected));
        assert_eq!(coerce_timestamp(&json!("2024-01-01T08:30:00")), Some(expected));
        assert_eq!(coerce_timestamp(&json!("2024-01-01 08:30:00")), Some(expected));
        assert_eq!(coerce_timestamp(&json!("2024-01-01T15:30:00+07:00")), Some(expected));
        assert_eq!(
            coerce_timestamp(&json!("2024-01-01")),
            Some(Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap())
        );
        assert_eq!(coerce_timestamp(&json!("not a date")), None);
        assert_eq!(coerce_timestamp(&json!(null)), None);
    }

    #[test]
    fn scalar_coercions() {
        assert!(coerce_flag(&json!(1)));
        assert!(coerce_flag(&json!("yes")));
        assert!(!coerce_flag(&json!("false")));
        assert!(!coerce_flag(&json!(null)));
        assert_eq!(coerce_float(&json!("11.55")), Some(11.55));
        assert_eq!(coerce_int(&json!("7")), Some(7));
        assert_eq!(coerce_int(&json!(3.6)), Some(4));
        assert_eq!(coerce_text(&json!(12345)).as_deref(), Some("12345"));
        assert_eq!(coerce_text(&json!("")), None);
    }

    #[test]
    fn synthesized_keys_are_distinct_and_tagged() {
        let started = Utc.with_ymd_and_hms(2024, 5, 1, 0, 0, 0).unwrap();
        let mut keys = KeySynthesizer::new("Master DB (ped)", started);
        let a = keys.next_key();
        let b = keys.next_key();
        assert_ne!(a, b);
        assert!(a.starts_with("MIGRATED_Master_DB__ped__"));
        assert!(a.ends_with("_0"));
        assert_eq!(keys.issued(), 2);
    }
}
