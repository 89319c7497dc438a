use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::TryStreamExt;
use pedsync_core::{EntityKind, LegacyRow};
use pedsync_storage::PoolSettings;
use serde_json::Value;
use sqlx::postgres::PgPoolOptions;
use sqlx::{PgPool, Row};
use tracing::debug;

use crate::{LegacySource, RowStream, SourceError};

/// Legacy Postgres database read through `row_to_json`, so column sets may
/// differ freely between sources.
#[derive(Debug, Clone)]
pub struct PgLegacySource {
    source_id: String,
    pool: PgPool,
}

impl PgLegacySource {
    /// Builds the pool without connecting; [`LegacySource::probe`] opens the first connection.
    pub fn connect_lazy(
        source_id: impl Into<String>,
        url: &str,
        settings: PoolSettings,
    ) -> Result<Self, SourceError> {
        let source_id = source_id.into();
        let pool = PgPoolOptions::new()
            .max_connections(settings.max_connections)
            .acquire_timeout(settings.connect_timeout)
            .idle_timeout(settings.idle_timeout)
            .connect_lazy(url)
            .map_err(|err| SourceError::Unreachable {
                source_id: source_id.clone(),
                message: err.to_string(),
            })?;
        Ok(Self { source_id, pool })
    }

    fn query_error(&self, entity: EntityKind) -> impl Fn(sqlx::Error) -> SourceError + '_ {
        move |source| SourceError::Query {
            source_id: self.source_id.clone(),
            entity,
            source,
        }
    }
}

fn extraction_sql(kind: EntityKind, incremental: bool) -> String {
    let table = kind.table();
    if incremental {
        let updated = kind.updated_column();
        format!(
            "SELECT row_to_json(t)::jsonb AS row FROM {table} t WHERE t.{updated} > $1 ORDER BY t.{updated} ASC"
        )
    } else {
        let created = kind.created_column();
        format!("SELECT row_to_json(t)::jsonb AS row FROM {table} t ORDER BY t.{created} ASC")
    }
}

#[async_trait]
impl LegacySource for PgLegacySource {
    fn source_id(&self) -> &str {
        &self.source_id
    }

    async fn probe(&self) -> Result<(), SourceError> {
        sqlx::query("SELECT 1")
            .execute(&self.pool)
            .await
            .map_err(|err| SourceError::Unreachable {
                source_id: self.source_id.clone(),
                message: err.to_string(),
            })?;
        Ok(())
    }

    async fn table_rows(&self, kind: EntityKind) -> Result<Option<u64>, SourceError> {
        let exists: bool = sqlx::query(
            r#"
            SELECT EXISTS (
                SELECT 1
                  FROM information_schema.tables
                 WHERE table_schema = current_schema()
                   AND table_name = $1
            )
            "#,
        )
        .bind(kind.table())
        .fetch_one(&self.pool)
        .await
        .and_then(|row| row.try_get(0))
        .map_err(self.query_error(kind))?;
        if !exists {
            return Ok(None);
        }

        let count: i64 = sqlx::query(&format!("SELECT COUNT(*) FROM {}", kind.table()))
            .fetch_one(&self.pool)
            .await
            .and_then(|row| row.try_get(0))
            .map_err(self.query_error(kind))?;
        Ok(Some(count.max(0) as u64))
    }

    fn extract(&self, kind: EntityKind, since: Option<DateTime<Utc>>) -> RowStream<'_> {
        let sql = extraction_sql(kind, since.is_some());
        debug!(source_id = %self.source_id, entity = %kind, %sql, "extracting");
        Box::pin(async_stream::stream! {
            let mut query = sqlx::query(&sql);
            if let Some(since) = since {
                query = query.bind(since);
            }
            let mut rows = query.fetch(&self.pool);
            loop {
                let row = match rows.try_next().await {
                    Ok(Some(row)) => row,
                    Ok(None) => break,
                    Err(err) => {
                        yield Err((self.query_error(kind))(err));
                        break;
                    }
                };
                let value: Value = match row.try_get("row") {
                    Ok(value) => value,
                    Err(err) => {
                        yield Err((self.query_error(kind))(err));
                        break;
                    }
                };
                match LegacyRow::from_value(value) {
                    Some(row) => yield Ok(row),
                    None => yield Err(SourceError::MalformedRow {
                        source_id: self.source_id.clone(),
                        entity: kind,
                    }),
                }
            }
        })
    }

    async fn close(&self) {
        self.pool.close().await;
    }
}
