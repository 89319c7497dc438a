//! Row-to-record mapping for the four legacy tables.

use std::collections::BTreeSet;
use std::fmt::Display;

use chrono::{DateTime, Utc};
use pedsync_core::normalize::{coerce_float, is_present, Normalize};
use pedsync_core::{
    AttendanceRecord, AttendanceStatus, Beneficiary, BeneficiaryStatus, CanonicalRecord,
    Enrollment, EntityKind, KeySynthesizer, LegacyRow, MappedRecord, RegistrationMethod,
    SessionStatus, Sex, Training, TrainingLevel, TrainingStatus, TrainingType, SYSTEM_ACTOR,
};
use tracing::warn;

/// Maps legacy rows of one source to canonical records.
///
/// Missing values fall back to the insert defaults: empty text, the run's
/// start time for timestamps and [`SYSTEM_ACTOR`] for audit actors. Rows
/// without a natural key receive a synthesized one. Each mapped record also
/// names the canonical columns the row really carried, so an upsert never
/// replaces stored values with those defaults.
#[derive(Debug)]
pub struct RowMapper {
    now: DateTime<Utc>,
    keys: KeySynthesizer,
    strict_audit: bool,
    coerced: u64,
    supplied: BTreeSet<&'static str>,
}

impl RowMapper {
    pub fn new(source_id: &str, run_started_at: DateTime<Utc>, strict_audit: bool) -> Self {
        Self {
            now: run_started_at,
            keys: KeySynthesizer::new(source_id, run_started_at),
            strict_audit,
            coerced: 0,
            supplied: BTreeSet::new(),
        }
    }

    /// Present values replaced by a default, counted only under strict audit.
    pub fn coerced(&self) -> u64 {
        self.coerced
    }

    pub fn synthesized_keys(&self) -> u64 {
        self.keys.issued()
    }

    pub fn map(&mut self, kind: EntityKind, row: &LegacyRow) -> MappedRecord {
        self.supplied.clear();
        let record = match kind {
            EntityKind::Beneficiary => CanonicalRecord::Beneficiary(self.beneficiary(row)),
            EntityKind::Training => CanonicalRecord::Training(self.training(row)),
            EntityKind::Enrollment => CanonicalRecord::Enrollment(self.enrollment(row)),
            EntityKind::Attendance => CanonicalRecord::Attendance(self.attendance(row)),
        };
        MappedRecord {
            record,
            supplied: std::mem::take(&mut self.supplied),
        }
    }

    fn natural_key(&mut self, kind: EntityKind, row: &LegacyRow) -> String {
        self.supplied.insert(kind.key_column());
        match row.text(kind.key_column()) {
            Some(key) => key,
            None => self.keys.next_key(),
        }
    }

    fn supplies<T>(&mut self, column: &'static str, value: Option<T>) -> Option<T> {
        if value.is_some() {
            self.supplied.insert(column);
        }
        value
    }

    fn text(&mut self, row: &LegacyRow, column: &'static str) -> Option<String> {
        self.supplies(column, row.text(column))
    }

    /// Text from the first present legacy column, stored under `column`.
    fn text_from(&mut self, row: &LegacyRow, column: &'static str, legacy: &[&str]) -> Option<String> {
        self.supplies(column, row.text_any(legacy))
    }

    fn text_or_empty(&mut self, row: &LegacyRow, column: &'static str) -> String {
        self.text(row, column).unwrap_or_default()
    }

    fn actor(&mut self, row: &LegacyRow, column: &'static str) -> String {
        self.text(row, column)
            .unwrap_or_else(|| SYSTEM_ACTOR.to_string())
    }

    fn flag(&mut self, row: &LegacyRow, column: &'static str) -> bool {
        if is_present(row.get(column)) {
            self.supplied.insert(column);
        }
        row.flag(column)
    }

    fn float(&mut self, row: &LegacyRow, column: &'static str) -> Option<f64> {
        self.supplies(column, row.float(column))
    }

    fn float_from(&mut self, row: &LegacyRow, column: &'static str, legacy: &[&str]) -> Option<f64> {
        self.supplies(column, coerce_float(row.first_present(legacy)))
    }

    fn int(&mut self, row: &LegacyRow, column: &'static str) -> Option<i32> {
        self.supplies(column, row.int(column))
    }

    fn vocab<T: Normalize + Display>(
        &mut self,
        row: &LegacyRow,
        column: &'static str,
        legacy: &[&str],
        key: &str,
    ) -> T {
        let value = row.first_present(legacy);
        if is_present(value) {
            self.supplied.insert(column);
        }
        let classified = T::classify(value);
        if self.strict_audit && classified.coerced() {
            self.coerced += 1;
            warn!(
                natural_key = key,
                column,
                value = %value,
                default = %classified.value,
                "unrecognized value replaced by default"
            );
        }
        classified.value
    }

    fn optional_timestamp(&mut self, row: &LegacyRow, column: &'static str, key: &str) -> Option<DateTime<Utc>> {
        let parsed = row.timestamp(column);
        if parsed.is_none() && self.strict_audit && is_present(row.get(column)) {
            self.coerced += 1;
            warn!(natural_key = key, column, value = %row.get(column), "unparseable timestamp dropped");
        }
        self.supplies(column, parsed)
    }

    fn timestamp(&mut self, row: &LegacyRow, column: &'static str, key: &str) -> DateTime<Utc> {
        self.optional_timestamp(row, column, key).unwrap_or(self.now)
    }

    fn beneficiary(&mut self, row: &LegacyRow) -> Beneficiary {
        let teacher_id = self.natural_key(EntityKind::Beneficiary, row);
        let key = teacher_id.as_str();
        Beneficiary {
            name: self.text(row, "name").unwrap_or_else(|| "Unknown".to_string()),
            name_english: self.text_or_empty(row, "name_english"),
            phone: self.text_or_empty(row, "phone"),
            sex: self.vocab::<Sex>(row, "sex", &["sex"], key),
            role: self.text_from(row, "role", &["role", "type"]).unwrap_or_default(),
            passcode: self.text_or_empty(row, "passcode"),
            province_name: self.text_or_empty(row, "province_name"),
            district_name: self.text_or_empty(row, "district_name"),
            commune_name: self.text_or_empty(row, "commune_name"),
            village_name: self.text_or_empty(row, "village_name"),
            school: self.text_or_empty(row, "school"),
            school_id: self.text_or_empty(row, "school_id"),
            position: self.text_or_empty(row, "position"),
            subject: self.text_or_empty(row, "subject"),
            grade: self.int(row, "grade"),
            status: self.vocab::<BeneficiaryStatus>(row, "status", &["status"], key),
            is_deleted: self.flag(row, "is_deleted"),
            profile_completed: self.flag(row, "profile_completed"),
            profile_image_url: self.text_or_empty(row, "profile_image_url"),
            signature_url: self.text_or_empty(row, "signature_url"),
            created_at: self.timestamp(row, "created_at", key),
            updated_at: self.timestamp(row, "updated_at", key),
            created_by: self.actor(row, "created_by"),
            updated_by: self.actor(row, "updated_by"),
            teacher_id,
        }
    }

    fn training(&mut self, row: &LegacyRow) -> Training {
        let training_code = self.natural_key(EntityKind::Training, row);
        let key = training_code.as_str();
        Training {
            training_name: self
                .text(row, "training_name")
                .unwrap_or_else(|| "Unnamed Training".to_string()),
            training_name_english: self
                .text_from(row, "training_name_english", &["training_name_english", "name_english"])
                .unwrap_or_default(),
            training_description: self
                .text_from(
                    row,
                    "training_description",
                    &["training_description", "training_description_english"],
                )
                .unwrap_or_default(),
            training_type: self.vocab::<TrainingType>(row, "training_type", &["training_type"], key),
            training_category: self
                .text(row, "training_category")
                .unwrap_or_else(|| "General".to_string()),
            training_level: self.vocab::<TrainingLevel>(
                row,
                "training_level",
                &["training_level", "data_scope"],
                key,
            ),
            training_status: self.vocab::<TrainingStatus>(row, "training_status", &["training_status"], key),
            training_start_date: self.timestamp(row, "training_start_date", key),
            training_end_date: self.timestamp(row, "training_end_date", key),
            registration_deadline: self.optional_timestamp(row, "registration_deadline", key),
            training_location: self
                .text(row, "training_location")
                .unwrap_or_else(|| "TBD".to_string()),
            training_venue: self.text_or_empty(row, "training_venue"),
            venue_latitude: self.float(row, "venue_latitude").unwrap_or(0.0),
            venue_longitude: self.float(row, "venue_longitude").unwrap_or(0.0),
            // A zero radius is as unusable as a missing one.
            geofence_radius: self
                .float(row, "geofence_radius")
                .filter(|radius| *radius != 0.0)
                .unwrap_or(100.0),
            province_name: self.text_or_empty(row, "province_name"),
            district_name: self.text_or_empty(row, "district_name"),
            commune_name: self.text_or_empty(row, "commune_name"),
            school_name: self
                .text_from(row, "school_name", &["school_name", "school"])
                .unwrap_or_default(),
            cluster_schools: self
                .text_from(row, "cluster_schools", &["cluster_id"])
                .into_iter()
                .collect(),
            max_participants: self.int(row, "max_participants").unwrap_or(0),
            current_participants: self.int(row, "current_participants").unwrap_or(0),
            qr_code_data: self.text_or_empty(row, "qr_code_data"),
            gps_validation_required: self.flag(row, "gps_validation_required"),
            geofence_validation_required: self.flag(row, "geofence_validation_required"),
            is_published: self.flag(row, "is_published"),
            training_is_deleted: self.flag(row, "training_is_deleted"),
            training_created_by: self.actor(row, "training_created_by"),
            training_updated_by: self.actor(row, "training_updated_by"),
            training_created_at: self.timestamp(row, "training_created_at", key),
            training_updated_at: self.timestamp(row, "training_updated_at", key),
            training_code,
        }
    }

    fn enrollment(&mut self, row: &LegacyRow) -> Enrollment {
        let beneficiary_training_id = self.natural_key(EntityKind::Enrollment, row);
        let key = beneficiary_training_id.as_str();
        Enrollment {
            beneficiary_id: self.text(row, "beneficiary_id"),
            training_id: self.text(row, "training_id"),
            registration_date: self.timestamp(row, "registration_date", key),
            registration_method: self.vocab::<RegistrationMethod>(
                row,
                "registration_method",
                &["registration_method"],
                key,
            ),
            attendance_status: self.vocab::<AttendanceStatus>(
                row,
                "attendance_status",
                &["attendance_status"],
                key,
            ),
            attendance_percentage: self.float(row, "attendance_percentage").unwrap_or(0.0),
            training_role: self
                .text(row, "training_role")
                .unwrap_or_else(|| "PARTICIPANT".to_string()),
            enrollment_type: self
                .text(row, "enrollment_type")
                .unwrap_or_else(|| "REGULAR".to_string()),
            certificate_issued: self.flag(row, "certificate_issued"),
            certificate_number: self.text_or_empty(row, "certificate_number"),
            certificate_issue_date: self.optional_timestamp(row, "certificate_issue_date", key),
            feedback_submitted: self.flag(row, "feedback_submitted"),
            feedback_score: self.float(row, "feedback_score"),
            feedback_comments: self.text_or_empty(row, "feedback_comments"),
            beneficiary_training_status: self
                .text(row, "beneficiary_training_status")
                .unwrap_or_else(|| "ACTIVE".to_string()),
            beneficiary_training_created_at: self.timestamp(row, "beneficiary_training_created_at", key),
            beneficiary_training_updated_at: self.timestamp(row, "beneficiary_training_updated_at", key),
            beneficiary_training_id,
        }
    }

    fn attendance(&mut self, row: &LegacyRow) -> AttendanceRecord {
        let id = self.natural_key(EntityKind::Attendance, row);
        let key = id.as_str();
        AttendanceRecord {
            training_id: self.text(row, "training_id"),
            beneficiary_id: self.text(row, "beneficiary_id"),
            date: self.timestamp(row, "date", key),
            morning_in: self.optional_timestamp(row, "morning_in", key),
            morning_out: self.optional_timestamp(row, "morning_out", key),
            afternoon_in: self.optional_timestamp(row, "afternoon_in", key),
            afternoon_out: self.optional_timestamp(row, "afternoon_out", key),
            session_attendance_status: self.vocab::<SessionStatus>(
                row,
                "session_attendance_status",
                &["session_attendance_status"],
                key,
            ),
            manual_entry: self.flag(row, "manual_entry"),
            manual_marked_by: self.text(row, "manual_marked_by"),
            manual_marked_by_name: self.text(row, "manual_marked_by_name"),
            manual_entry_reason: self.text(row, "manual_entry_reason"),
            location_lat: self.float_from(row, "location_lat", &["manual_entry_location_lat", "location_lat"]),
            location_lng: self.float_from(row, "location_lng", &["manual_entry_location_lng", "location_lng"]),
            device: self.text(row, "device"),
            created_at: self.timestamp(row, "created_at", key),
            updated_at: self.timestamp(row, "updated_at", key),
            id,
        }
    }
}
