//! Canonical entity model and legacy row vocabulary for pedsync.

use std::collections::BTreeSet;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

pub mod normalize;

pub use normalize::KeySynthesizer;

pub const CRATE_NAME: &str = "pedsync-core";

/// Default audit actor for records whose source row has no `*_by` value.
pub const SYSTEM_ACTOR: &str = "system";

/// One loosely-typed row extracted from a legacy source.
///
/// Column names and value types vary per source; every accessor is total and
/// treats a missing column exactly like an explicit `NULL`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct LegacyRow(Map<String, Value>);

static NULL: Value = Value::Null;

impl LegacyRow {
    pub fn new(columns: Map<String, Value>) -> Self {
        Self(columns)
    }

    pub fn from_value(value: Value) -> Option<Self> {
        match value {
            Value::Object(map) => Some(Self(map)),
            _ => None,
        }
    }

    pub fn get(&self, column: &str) -> &Value {
        self.0.get(column).unwrap_or(&NULL)
    }

    /// First column among `columns` holding a non-empty value.
    pub fn first_present(&self, columns: &[&str]) -> &Value {
        columns
            .iter()
            .map(|c| self.get(c))
            .find(|v| normalize::is_present(v))
            .unwrap_or(&NULL)
    }

    pub fn text(&self, column: &str) -> Option<String> {
        normalize::coerce_text(self.get(column))
    }

    pub fn text_any(&self, columns: &[&str]) -> Option<String> {
        normalize::coerce_text(self.first_present(columns))
    }

    pub fn timestamp(&self, column: &str) -> Option<DateTime<Utc>> {
        normalize::coerce_timestamp(self.get(column))
    }

    pub fn flag(&self, column: &str) -> bool {
        normalize::coerce_flag(self.get(column))
    }

    pub fn float(&self, column: &str) -> Option<f64> {
        normalize::coerce_float(self.get(column))
    }

    pub fn int(&self, column: &str) -> Option<i32> {
        normalize::coerce_int(self.get(column))
    }

    pub fn insert(&mut self, column: impl Into<String>, value: Value) {
        self.0.insert(column.into(), value);
    }

    pub fn columns(&self) -> impl Iterator<Item = &str> {
        self.0.keys().map(String::as_str)
    }
}

const BENEFICIARY_COLUMNS: &[&str] = &[
    "teacher_id",
    "name",
    "name_english",
    "phone",
    "sex",
    "role",
    "passcode",
    "province_name",
    "district_name",
    "commune_name",
    "village_name",
    "school",
    "school_id",
    "position",
    "subject",
    "grade",
    "status",
    "is_deleted",
    "profile_completed",
    "profile_image_url",
    "signature_url",
    "created_at",
    "updated_at",
    "created_by",
    "updated_by",
];

const TRAINING_COLUMNS: &[&str] = &[
    "training_code",
    "training_name",
    "training_name_english",
    "training_description",
    "training_type",
    "training_category",
    "training_level",
    "training_status",
    "training_start_date",
    "training_end_date",
    "registration_deadline",
    "training_location",
    "training_venue",
    "venue_latitude",
    "venue_longitude",
    "geofence_radius",
    "province_name",
    "district_name",
    "commune_name",
    "school_name",
    "cluster_schools",
    "max_participants",
    "current_participants",
    "qr_code_data",
    "gps_validation_required",
    "geofence_validation_required",
    "is_published",
    "training_is_deleted",
    "training_created_by",
    "training_updated_by",
    "training_created_at",
    "training_updated_at",
];

const ENROLLMENT_COLUMNS: &[&str] = &[
    "beneficiary_training_id",
    "beneficiary_id",
    "training_id",
    "registration_date",
    "registration_method",
    "attendance_status",
    "attendance_percentage",
    "training_role",
    "enrollment_type",
    "certificate_issued",
    "certificate_number",
    "certificate_issue_date",
    "feedback_submitted",
    "feedback_score",
    "feedback_comments",
    "beneficiary_training_status",
    "beneficiary_training_created_at",
    "beneficiary_training_updated_at",
];

const ATTENDANCE_COLUMNS: &[&str] = &[
    "id",
    "training_id",
    "beneficiary_id",
    "date",
    "morning_in",
    "morning_out",
    "afternoon_in",
    "afternoon_out",
    "session_attendance_status",
    "manual_entry",
    "manual_marked_by",
    "manual_marked_by_name",
    "manual_entry_reason",
    "location_lat",
    "location_lng",
    "device",
    "created_at",
    "updated_at",
];

/// Legacy tables every source is expected to expose.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum EntityKind {
    Beneficiary,
    Training,
    Enrollment,
    Attendance,
}

impl EntityKind {
    /// Migration order: enrollments and attendance reference the first two.
    pub const ALL: [EntityKind; 4] = [
        EntityKind::Beneficiary,
        EntityKind::Training,
        EntityKind::Enrollment,
        EntityKind::Attendance,
    ];

    pub fn label(self) -> &'static str {
        match self {
            EntityKind::Beneficiary => "beneficiaries",
            EntityKind::Training => "trainings",
            EntityKind::Enrollment => "enrollments",
            EntityKind::Attendance => "attendance records",
        }
    }

    /// Table name in both the legacy sources and the canonical target.
    pub fn table(self) -> &'static str {
        match self {
            EntityKind::Beneficiary => "beneficiaries",
            EntityKind::Training => "trainings",
            EntityKind::Enrollment => "beneficiary_trainings",
            EntityKind::Attendance => "attendance_records",
        }
    }

    /// Column naming the natural key in both schemas.
    pub fn key_column(self) -> &'static str {
        match self {
            EntityKind::Beneficiary => "teacher_id",
            EntityKind::Training => "training_code",
            EntityKind::Enrollment => "beneficiary_training_id",
            EntityKind::Attendance => "id",
        }
    }

    /// Creation column used to order a full backfill.
    pub fn created_column(self) -> &'static str {
        match self {
            EntityKind::Beneficiary | EntityKind::Attendance => "created_at",
            EntityKind::Training => "training_created_at",
            EntityKind::Enrollment => "beneficiary_training_created_at",
        }
    }

    /// Modification column bounding an incremental extraction.
    pub fn updated_column(self) -> &'static str {
        match self {
            EntityKind::Beneficiary | EntityKind::Attendance => "updated_at",
            EntityKind::Training => "training_updated_at",
            EntityKind::Enrollment => "beneficiary_training_updated_at",
        }
    }

    /// Canonical columns in table order, natural key first.
    pub fn columns(self) -> &'static [&'static str] {
        match self {
            EntityKind::Beneficiary => BENEFICIARY_COLUMNS,
            EntityKind::Training => TRAINING_COLUMNS,
            EntityKind::Enrollment => ENROLLMENT_COLUMNS,
            EntityKind::Attendance => ATTENDANCE_COLUMNS,
        }
    }

    /// Columns an update must never overwrite besides the natural key.
    pub fn creation_columns(self) -> &'static [&'static str] {
        match self {
            EntityKind::Beneficiary => &["created_at", "created_by"],
            EntityKind::Training => &["training_created_at", "training_created_by"],
            EntityKind::Enrollment => &["beneficiary_training_created_at"],
            EntityKind::Attendance => &["created_at"],
        }
    }

    /// Rows between two progress log lines.
    pub fn progress_every(self) -> u64 {
        match self {
            EntityKind::Beneficiary | EntityKind::Enrollment => 500,
            EntityKind::Training => 100,
            EntityKind::Attendance => 1000,
        }
    }
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

macro_rules! vocabulary {
    ($(#[$meta:meta])* $name:ident { $($variant:ident => $text:literal),+ $(,)? }) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
        pub enum $name {
            $(#[serde(rename = $text)] $variant),+
        }

        impl $name {
            pub fn as_str(self) -> &'static str {
                match self {
                    $($name::$variant => $text),+
                }
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }
    };
}

vocabulary!(Sex { Male => "M", Female => "F" });

vocabulary!(BeneficiaryStatus {
    Active => "ACTIVE",
    Inactive => "INACTIVE",
});

vocabulary!(TrainingStatus {
    Draft => "DRAFT",
    Ongoing => "ONGOING",
    Completed => "COMPLETED",
    Cancelled => "CANCELLED",
});

vocabulary!(TrainingType {
    Workshop => "WORKSHOP",
    Course => "COURSE",
    Seminar => "SEMINAR",
});

vocabulary!(TrainingLevel {
    National => "NATIONAL",
    Provincial => "PROVINCIAL",
    Cluster => "CLUSTER",
});

vocabulary!(
    /// Participation state of an enrollment.
    AttendanceStatus {
        Registered => "REGISTERED",
        Attended => "ATTENDED",
        Completed => "COMPLETED",
        Dropped => "DROPPED",
    }
);

vocabulary!(
    /// Per-day attendance outcome.
    SessionStatus {
        Present => "PRESENT",
        Absent => "ABSENT",
        Late => "LATE",
        Excused => "EXCUSED",
    }
);

vocabulary!(RegistrationMethod {
    Qr => "QR",
    Manual => "MANUAL",
    Import => "IMPORT",
});

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Beneficiary {
    pub teacher_id: String,
    pub name: String,
    pub name_english: String,
    pub phone: String,
    pub sex: Sex,
    pub role: String,
    pub passcode: String,
    pub province_name: String,
    pub district_name: String,
    pub commune_name: String,
    pub village_name: String,
    pub school: String,
    pub school_id: String,
    pub position: String,
    pub subject: String,
    pub grade: Option<i32>,
    pub status: BeneficiaryStatus,
    pub is_deleted: bool,
    pub profile_completed: bool,
    pub profile_image_url: String,
    pub signature_url: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub created_by: String,
    pub updated_by: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Training {
    pub training_code: String,
    pub training_name: String,
    pub training_name_english: String,
    pub training_description: String,
    pub training_type: TrainingType,
    pub training_category: String,
    pub training_level: TrainingLevel,
    pub training_status: TrainingStatus,
    pub training_start_date: DateTime<Utc>,
    pub training_end_date: DateTime<Utc>,
    pub registration_deadline: Option<DateTime<Utc>>,
    pub training_location: String,
    pub training_venue: String,
    pub venue_latitude: f64,
    pub venue_longitude: f64,
    pub geofence_radius: f64,
    pub province_name: String,
    pub district_name: String,
    pub commune_name: String,
    pub school_name: String,
    pub cluster_schools: Vec<String>,
    pub max_participants: i32,
    pub current_participants: i32,
    pub qr_code_data: String,
    pub gps_validation_required: bool,
    pub geofence_validation_required: bool,
    pub is_published: bool,
    pub training_is_deleted: bool,
    pub training_created_by: String,
    pub training_updated_by: String,
    pub training_created_at: DateTime<Utc>,
    pub training_updated_at: DateTime<Utc>,
}

/// A beneficiary's registration in a training.
///
/// `beneficiary_id` and `training_id` carry the referenced natural keys verbatim;
/// they are not checked against the target before writing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Enrollment {
    pub beneficiary_training_id: String,
    pub beneficiary_id: Option<String>,
    pub training_id: Option<String>,
    pub registration_date: DateTime<Utc>,
    pub registration_method: RegistrationMethod,
    pub attendance_status: AttendanceStatus,
    pub attendance_percentage: f64,
    pub training_role: String,
    pub enrollment_type: String,
    pub certificate_issued: bool,
    pub certificate_number: String,
    pub certificate_issue_date: Option<DateTime<Utc>>,
    pub feedback_submitted: bool,
    pub feedback_score: Option<f64>,
    pub feedback_comments: String,
    pub beneficiary_training_status: String,
    pub beneficiary_training_created_at: DateTime<Utc>,
    pub beneficiary_training_updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttendanceRecord {
    pub id: String,
    pub training_id: Option<String>,
    pub beneficiary_id: Option<String>,
    pub date: DateTime<Utc>,
    pub morning_in: Option<DateTime<Utc>>,
    pub morning_out: Option<DateTime<Utc>>,
    pub afternoon_in: Option<DateTime<Utc>>,
    pub afternoon_out: Option<DateTime<Utc>>,
    pub session_attendance_status: SessionStatus,
    pub manual_entry: bool,
    pub manual_marked_by: Option<String>,
    pub manual_marked_by_name: Option<String>,
    pub manual_entry_reason: Option<String>,
    pub location_lat: Option<f64>,
    pub location_lng: Option<f64>,
    pub device: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// A normalized record ready to be written to the canonical store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "record")]
pub enum CanonicalRecord {
    Beneficiary(Beneficiary),
    Training(Training),
    Enrollment(Enrollment),
    Attendance(AttendanceRecord),
}

impl CanonicalRecord {
    pub fn kind(&self) -> EntityKind {
        match self {
            CanonicalRecord::Beneficiary(_) => EntityKind::Beneficiary,
            CanonicalRecord::Training(_) => EntityKind::Training,
            CanonicalRecord::Enrollment(_) => EntityKind::Enrollment,
            CanonicalRecord::Attendance(_) => EntityKind::Attendance,
        }
    }

    pub fn natural_key(&self) -> &str {
        match self {
            CanonicalRecord::Beneficiary(b) => &b.teacher_id,
            CanonicalRecord::Training(t) => &t.training_code,
            CanonicalRecord::Enrollment(e) => &e.beneficiary_training_id,
            CanonicalRecord::Attendance(a) => &a.id,
        }
    }

    /// Natural keys of the beneficiary and training this record points at.
    pub fn references(&self) -> Option<(Option<&str>, Option<&str>)> {
        match self {
            CanonicalRecord::Enrollment(e) => {
                Some((e.beneficiary_id.as_deref(), e.training_id.as_deref()))
            }
            CanonicalRecord::Attendance(a) => {
                Some((a.beneficiary_id.as_deref(), a.training_id.as_deref()))
            }
            _ => None,
        }
    }
}

/// A canonical record plus the columns its source row actually carried.
///
/// Every field of `record` is filled, missing ones with insert defaults, but
/// only `supplied` columns may overwrite an existing target row.
#[derive(Debug, Clone, PartialEq)]
pub struct MappedRecord {
    pub record: CanonicalRecord,
    pub supplied: BTreeSet<&'static str>,
}

impl MappedRecord {
    /// Treats every canonical column as supplied.
    pub fn complete(record: CanonicalRecord) -> Self {
        let supplied = record.kind().columns().iter().copied().collect();
        Self { record, supplied }
    }

    pub fn kind(&self) -> EntityKind {
        self.record.kind()
    }

    pub fn natural_key(&self) -> &str {
        self.record.natural_key()
    }

    /// Supplied columns an update may assign, in table order.
    pub fn update_columns(&self) -> Vec<&'static str> {
        let kind = self.kind();
        kind.columns()
            .iter()
            .copied()
            .filter(|c| {
                *c != kind.key_column()
                    && !kind.creation_columns().contains(c)
                    && self.supplied.contains(c)
            })
            .collect()
    }
}
