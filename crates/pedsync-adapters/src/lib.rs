//! Legacy source contracts plus the Postgres and fixture-backed implementations.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::stream::BoxStream;
use pedsync_core::{EntityKind, LegacyRow};
use thiserror::Error;

mod fixture;
mod postgres;

pub use fixture::{load_fixture_bundle, FixtureBundle, FixtureSource};
pub use postgres::PgLegacySource;

pub const CRATE_NAME: &str = "pedsync-adapters";

/// Rows of one legacy table in extraction order.
pub type RowStream<'a> = BoxStream<'a, Result<LegacyRow, SourceError>>;

#[derive(Debug, Error)]
pub enum SourceError {
    #[error("source {source_id} is unreachable: {message}")]
    Unreachable { source_id: String, message: String },
    #[error("source {source_id}: reading {entity} failed: {source}")]
    Query {
        source_id: String,
        entity: EntityKind,
        #[source]
        source: sqlx::Error,
    },
    #[error("source {source_id}: {entity} row is not a JSON object")]
    MalformedRow { source_id: String, entity: EntityKind },
}

impl SourceError {
    /// Fatal errors end the extraction of the whole source.
    pub fn is_fatal(&self) -> bool {
        !matches!(self, SourceError::MalformedRow { .. })
    }
}

/// A legacy database exposing the four training-management tables.
#[async_trait]
pub trait LegacySource: Send + Sync {
    fn source_id(&self) -> &str;

    /// Cheap round trip proving the source accepts queries.
    async fn probe(&self) -> Result<(), SourceError>;

    /// Row count of the table backing `kind`, or `None` when the table is missing.
    async fn table_rows(&self, kind: EntityKind) -> Result<Option<u64>, SourceError>;

    /// Streams rows ordered ascending by creation time, or by modification time
    /// when `since` bounds the extraction to rows modified strictly after it.
    fn extract(&self, kind: EntityKind, since: Option<DateTime<Utc>>) -> RowStream<'_>;

    async fn close(&self);
}
