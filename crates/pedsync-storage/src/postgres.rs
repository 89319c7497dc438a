use std::collections::BTreeMap;

use anyhow::Context;
use async_trait::async_trait;
use pedsync_core::{CanonicalRecord, EntityKind, MappedRecord};
use sqlx::postgres::{PgArguments, PgPoolOptions};
use sqlx::query::Query;
use sqlx::{PgPool, Postgres, Row};
use tracing::{debug, info};

use crate::{OrphanReference, PoolSettings, StoreError, TargetStore, WriteOutcome};

type PgQuery<'q> = Query<'q, Postgres, PgArguments>;

#[derive(Debug, Clone)]
struct Statements {
    key: &'static str,
    insert_head: String,
    exists: String,
    insert: String,
    count: String,
}

impl Statements {
    fn for_kind(kind: EntityKind) -> Self {
        let table = kind.table();
        let key = kind.key_column();
        let cols = kind.columns();
        let placeholders = (1..=cols.len())
            .map(|i| format!("${i}"))
            .collect::<Vec<_>>()
            .join(", ");
        let insert_head = format!(
            "INSERT INTO {table} ({}) VALUES ({placeholders})",
            cols.join(", ")
        );

        Self {
            key,
            exists: format!("SELECT EXISTS (SELECT 1 FROM {table} WHERE {key} = $1)"),
            insert: format!("{insert_head} ON CONFLICT ({key}) DO NOTHING"),
            count: format!("SELECT COUNT(*) FROM {table}"),
            insert_head,
        }
    }

    /// Upsert assigning only `update_columns` on conflict; the insert branch
    /// still writes every bound column.
    fn upsert(&self, update_columns: &[&str]) -> String {
        let key = self.key;
        let assignments = if update_columns.is_empty() {
            // A no-op assignment keeps RETURNING working for the conflict row.
            format!("{key} = EXCLUDED.{key}")
        } else {
            update_columns
                .iter()
                .map(|c| format!("{c} = EXCLUDED.{c}"))
                .collect::<Vec<_>>()
                .join(", ")
        };
        format!(
            "{} ON CONFLICT ({key}) DO UPDATE SET {assignments} RETURNING (xmax = 0) AS inserted",
            self.insert_head
        )
    }
}

fn bind_record<'q>(query: PgQuery<'q>, record: &'q CanonicalRecord) -> PgQuery<'q> {
    match record {
        CanonicalRecord::Beneficiary(b) => query
            .bind(b.teacher_id.as_str())
            .bind(b.name.as_str())
            .bind(b.name_english.as_str())
            .bind(b.phone.as_str())
            .bind(b.sex.as_str())
            .bind(b.role.as_str())
            .bind(b.passcode.as_str())
            .bind(b.province_name.as_str())
            .bind(b.district_name.as_str())
            .bind(b.commune_name.as_str())
            .bind(b.village_name.as_str())
            .bind(b.school.as_str())
            .bind(b.school_id.as_str())
            .bind(b.position.as_str())
            .bind(b.subject.as_str())
            .bind(b.grade)
            .bind(b.status.as_str())
            .bind(b.is_deleted)
            .bind(b.profile_completed)
            .bind(b.profile_image_url.as_str())
            .bind(b.signature_url.as_str())
            .bind(b.created_at)
            .bind(b.updated_at)
            .bind(b.created_by.as_str())
            .bind(b.updated_by.as_str()),
        CanonicalRecord::Training(t) => query
            .bind(t.training_code.as_str())
            .bind(t.training_name.as_str())
            .bind(t.training_name_english.as_str())
            .bind(t.training_description.as_str())
            .bind(t.training_type.as_str())
            .bind(t.training_category.as_str())
            .bind(t.training_level.as_str())
            .bind(t.training_status.as_str())
            .bind(t.training_start_date)
            .bind(t.training_end_date)
            .bind(t.registration_deadline)
            .bind(t.training_location.as_str())
            .bind(t.training_venue.as_str())
            .bind(t.venue_latitude)
            .bind(t.venue_longitude)
            .bind(t.geofence_radius)
            .bind(t.province_name.as_str())
            .bind(t.district_name.as_str())
            .bind(t.commune_name.as_str())
            .bind(t.school_name.as_str())
            .bind(t.cluster_schools.clone())
            .bind(t.max_participants)
            .bind(t.current_participants)
            .bind(t.qr_code_data.as_str())
            .bind(t.gps_validation_required)
            .bind(t.geofence_validation_required)
            .bind(t.is_published)
            .bind(t.training_is_deleted)
            .bind(t.training_created_by.as_str())
            .bind(t.training_updated_by.as_str())
            .bind(t.training_created_at)
            .bind(t.training_updated_at),
        CanonicalRecord::Enrollment(e) => query
            .bind(e.beneficiary_training_id.as_str())
            .bind(e.beneficiary_id.as_deref())
            .bind(e.training_id.as_deref())
            .bind(e.registration_date)
            .bind(e.registration_method.as_str())
            .bind(e.attendance_status.as_str())
            .bind(e.attendance_percentage)
            .bind(e.training_role.as_str())
            .bind(e.enrollment_type.as_str())
            .bind(e.certificate_issued)
            .bind(e.certificate_number.as_str())
            .bind(e.certificate_issue_date)
            .bind(e.feedback_submitted)
            .bind(e.feedback_score)
            .bind(e.feedback_comments.as_str())
            .bind(e.beneficiary_training_status.as_str())
            .bind(e.beneficiary_training_created_at)
            .bind(e.beneficiary_training_updated_at),
        CanonicalRecord::Attendance(a) => query
            .bind(a.id.as_str())
            .bind(a.training_id.as_deref())
            .bind(a.beneficiary_id.as_deref())
            .bind(a.date)
            .bind(a.morning_in)
            .bind(a.morning_out)
            .bind(a.afternoon_in)
            .bind(a.afternoon_out)
            .bind(a.session_attendance_status.as_str())
            .bind(a.manual_entry)
            .bind(a.manual_marked_by.as_deref())
            .bind(a.manual_marked_by_name.as_deref())
            .bind(a.manual_entry_reason.as_deref())
            .bind(a.location_lat)
            .bind(a.location_lng)
            .bind(a.device.as_deref())
            .bind(a.created_at)
            .bind(a.updated_at),
    }
}

/// Canonical Postgres target written through generated per-table statements.
#[derive(Debug, Clone)]
pub struct PgTargetStore {
    pool: PgPool,
    statements: BTreeMap<EntityKind, Statements>,
}

impl PgTargetStore {
    pub async fn connect(url: &str, settings: PoolSettings) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(settings.max_connections)
            .acquire_timeout(settings.connect_timeout)
            .idle_timeout(settings.idle_timeout)
            .connect(url)
            .await?;
        info!(max_connections = settings.max_connections, "connected to canonical target");
        Ok(Self::from_pool(pool))
    }

    pub fn from_pool(pool: PgPool) -> Self {
        let statements = EntityKind::ALL
            .into_iter()
            .map(|kind| (kind, Statements::for_kind(kind)))
            .collect();
        Self { pool, statements }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Applies the bundled canonical schema migrations.
    pub async fn migrate(&self) -> anyhow::Result<()> {
        sqlx::migrate!("../../migrations")
            .run(&self.pool)
            .await
            .context("failed to apply canonical schema migrations")?;
        Ok(())
    }

    fn statements(&self, kind: EntityKind) -> Result<&Statements, StoreError> {
        self.statements
            .get(&kind)
            .ok_or_else(|| StoreError::Unavailable(format!("no statements prepared for {kind}")))
    }
}

#[async_trait]
impl TargetStore for PgTargetStore {
    async fn ping(&self) -> Result<(), StoreError> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }

    async fn contains(&self, kind: EntityKind, natural_key: &str) -> Result<bool, StoreError> {
        let row = sqlx::query(&self.statements(kind)?.exists)
            .bind(natural_key)
            .fetch_one(&self.pool)
            .await?;
        Ok(row.try_get::<bool, _>(0)?)
    }

    async fn insert(&self, record: &CanonicalRecord) -> Result<bool, StoreError> {
        let sql = &self.statements(record.kind())?.insert;
        let result = bind_record(sqlx::query(sql), record)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn upsert(&self, mapped: &MappedRecord) -> Result<WriteOutcome, StoreError> {
        let update_columns = mapped.update_columns();
        let sql = self.statements(mapped.kind())?.upsert(&update_columns);
        let row = bind_record(sqlx::query(&sql), &mapped.record)
            .fetch_one(&self.pool)
            .await?;
        let inserted: bool = row.try_get("inserted")?;
        debug!(
            entity = %mapped.kind(),
            natural_key = mapped.natural_key(),
            inserted,
            assigned = update_columns.len(),
            "upserted"
        );
        Ok(if inserted {
            WriteOutcome::Inserted
        } else {
            WriteOutcome::Updated
        })
    }

    async fn count(&self, kind: EntityKind) -> Result<u64, StoreError> {
        let row = sqlx::query(&self.statements(kind)?.count)
            .fetch_one(&self.pool)
            .await?;
        let count: i64 = row.try_get(0)?;
        Ok(count.max(0) as u64)
    }

    async fn orphans(&self) -> Result<Vec<OrphanReference>, StoreError> {
        let mut out = Vec::new();
        for kind in [EntityKind::Enrollment, EntityKind::Attendance] {
            for (column, referenced) in [
                ("beneficiary_id", EntityKind::Beneficiary),
                ("training_id", EntityKind::Training),
            ] {
                let sql = format!(
                    r#"
                    SELECT r.{key} AS natural_key, r.{column} AS missing_key
                      FROM {table} r
                     WHERE NOT EXISTS (
                           SELECT 1 FROM {ref_table} p WHERE p.{ref_key} = r.{column}
                     )
                     ORDER BY r.{key}
                    "#,
                    key = kind.key_column(),
                    table = kind.table(),
                    ref_table = referenced.table(),
                    ref_key = referenced.key_column(),
                );
                let rows = sqlx::query(&sql).fetch_all(&self.pool).await?;
                for row in rows {
                    out.push(OrphanReference {
                        kind,
                        natural_key: row.try_get("natural_key")?,
                        column: column.to_string(),
                        missing_key: row.try_get("missing_key")?,
                    });
                }
            }
        }
        Ok(out)
    }

    async fn recount_participants(&self) -> Result<u64, StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE trainings t
               SET current_participants = (
                   SELECT COUNT(*)::int
                     FROM beneficiary_trainings e
                    WHERE e.training_id = t.training_code
                      AND e.attendance_status <> 'DROPPED'
               )
            "#,
        )
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    async fn close(&self) {
        self.pool.close().await;
    }
}
