use std::fs;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use pedsync_core::{EntityKind, LegacyRow};
use serde::{Deserialize, Serialize};

use crate::{LegacySource, RowStream, SourceError};

/// Captured contents of a legacy database.
///
/// A table left out of the bundle is treated as missing from the source,
/// which is different from a present but empty table.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FixtureBundle {
    pub fixture_id: String,
    pub source_id: String,
    #[serde(default)]
    pub captured_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub notes: Option<String>,
    #[serde(default)]
    pub beneficiaries: Option<Vec<LegacyRow>>,
    #[serde(default)]
    pub trainings: Option<Vec<LegacyRow>>,
    #[serde(default)]
    pub beneficiary_trainings: Option<Vec<LegacyRow>>,
    #[serde(default)]
    pub attendance_records: Option<Vec<LegacyRow>>,
}

impl FixtureBundle {
    pub fn rows(&self, kind: EntityKind) -> Option<&[LegacyRow]> {
        match kind {
            EntityKind::Beneficiary => self.beneficiaries.as_deref(),
            EntityKind::Training => self.trainings.as_deref(),
            EntityKind::Enrollment => self.beneficiary_trainings.as_deref(),
            EntityKind::Attendance => self.attendance_records.as_deref(),
        }
    }

    pub fn rows_mut(&mut self, kind: EntityKind) -> &mut Vec<LegacyRow> {
        let table = match kind {
            EntityKind::Beneficiary => &mut self.beneficiaries,
            EntityKind::Training => &mut self.trainings,
            EntityKind::Enrollment => &mut self.beneficiary_trainings,
            EntityKind::Attendance => &mut self.attendance_records,
        };
        table.get_or_insert_with(Vec::new)
    }
}

pub fn load_fixture_bundle(path: impl AsRef<Path>) -> Result<FixtureBundle> {
    let path = path.as_ref();
    let data = fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    serde_json::from_str(&data).with_context(|| format!("parsing {}", path.display()))
}

/// In-memory legacy source replaying a [`FixtureBundle`] with the same
/// filtering and ordering rules as the Postgres source.
#[derive(Debug)]
pub struct FixtureSource {
    bundle: FixtureBundle,
    unreachable: bool,
    failing: Option<EntityKind>,
    closed: AtomicBool,
}

impl FixtureSource {
    pub fn new(bundle: FixtureBundle) -> Self {
        Self {
            bundle,
            unreachable: false,
            failing: None,
            closed: AtomicBool::new(false),
        }
    }

    /// Every probe and query fails as if the server refused connections.
    pub fn unreachable(mut self) -> Self {
        self.unreachable = true;
        self
    }

    /// Extraction of `kind` breaks after its first row.
    pub fn failing_on(mut self, kind: EntityKind) -> Self {
        self.failing = Some(kind);
        self
    }

    pub fn bundle(&self) -> &FixtureBundle {
        &self.bundle
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    fn refuse(&self) -> SourceError {
        SourceError::Unreachable {
            source_id: self.bundle.source_id.clone(),
            message: "connection refused".to_string(),
        }
    }

    fn ordered_rows(&self, kind: EntityKind, since: Option<DateTime<Utc>>) -> Vec<LegacyRow> {
        let order_column = if since.is_some() {
            kind.updated_column()
        } else {
            kind.created_column()
        };
        let mut rows: Vec<LegacyRow> = self
            .bundle
            .rows(kind)
            .unwrap_or_default()
            .iter()
            .filter(|row| match since {
                Some(since) => row
                    .timestamp(kind.updated_column())
                    .is_some_and(|updated| updated > since),
                None => true,
            })
            .cloned()
            .collect();
        // Postgres sorts NULLs last in ascending order.
        rows.sort_by_key(|row| {
            let at = row.timestamp(order_column);
            (at.is_none(), at)
        });
        rows
    }
}

#[async_trait]
impl LegacySource for FixtureSource {
    fn source_id(&self) -> &str {
        &self.bundle.source_id
    }

    async fn probe(&self) -> Result<(), SourceError> {
        if self.unreachable {
            return Err(self.refuse());
        }
        Ok(())
    }

    async fn table_rows(&self, kind: EntityKind) -> Result<Option<u64>, SourceError> {
        if self.unreachable {
            return Err(self.refuse());
        }
        Ok(self.bundle.rows(kind).map(|rows| rows.len() as u64))
    }

    fn extract(&self, kind: EntityKind, since: Option<DateTime<Utc>>) -> RowStream<'_> {
        let rows = self.ordered_rows(kind, since);
        let fail_after_first = self.failing == Some(kind);
        Box::pin(async_stream::stream! {
            if self.unreachable {
                yield Err(self.refuse());
                return;
            }
            for (index, row) in rows.into_iter().enumerate() {
                if fail_after_first && index == 1 {
                    yield Err(SourceError::Query {
                        source_id: self.bundle.source_id.clone(),
                        entity: kind,
                        source: sqlx::Error::Protocol("connection reset by peer".to_string()),
                    });
                    return;
                }
                yield Ok(row);
            }
        })
    }

    async fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}
