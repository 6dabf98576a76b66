use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, Sqlite, SqliteConnection};

use accord_core::approvals::ledger::LedgerStatistics;
use accord_core::domain::approval::{ApprovalRecord, ApprovalStatus, ProviderKind};
use accord_core::domain::entity::{ApprovableEntity, BusinessStatus, EntityId};
use accord_core::store::{ApprovalStore, ReferenceOwner, StoreError};

use super::{is_unique_violation, RepositoryError};
use crate::DbPool;

const SELECT_ENTITY: &str = "SELECT id, approval_status, business_status, external_reference_id,
        approval_channel, submitted_by, decided_by, decided_at, decision_reason,
        cycle_sequence, version, snapshot_json, created_at, updated_at
    FROM approvable_entity";

const SELECT_RECORD: &str = "SELECT record_id, entity_id, cycle_sequence, action,
        resulting_status, channel, operator_id, external_reference_id, comment, created_at
    FROM approval_record";

/// SQLite-backed [`ApprovalStore`]. Entity rows carry the optimistic-lock
/// version; `approval_record` is append-only at the schema level.
#[derive(Clone)]
pub struct SqlApprovalStore {
    pool: DbPool,
}

impl SqlApprovalStore {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }
}

fn column<'r, T>(row: &'r SqliteRow, name: &str) -> Result<T, RepositoryError>
where
    T: sqlx::Decode<'r, Sqlite> + sqlx::Type<Sqlite>,
{
    row.try_get(name).map_err(|e| RepositoryError::Decode(format!("{name}: {e}")))
}

fn parse_enum<T>(value: &str) -> Result<T, RepositoryError>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    value.parse::<T>().map_err(|e| RepositoryError::Decode(e.to_string()))
}

fn parse_timestamp(value: &str) -> Result<DateTime<Utc>, RepositoryError> {
    DateTime::parse_from_rfc3339(value)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| RepositoryError::Decode(format!("timestamp `{value}`: {e}")))
}

fn parse_cycle(value: i64) -> Result<u32, RepositoryError> {
    u32::try_from(value)
        .map_err(|_| RepositoryError::Decode(format!("cycle_sequence out of range: {value}")))
}

fn row_to_entity(row: &SqliteRow) -> Result<ApprovableEntity, RepositoryError> {
    let business_status: String = column(row, "business_status")?;
    let approval_channel: Option<String> = column(row, "approval_channel")?;
    let decided_at: Option<String> = column(row, "decided_at")?;
    let snapshot_json: String = column(row, "snapshot_json")?;
    let created_at: String = column(row, "created_at")?;
    let updated_at: String = column(row, "updated_at")?;

    Ok(ApprovableEntity {
        id: EntityId(column(row, "id")?),
        approval_status: parse_enum(&column::<String>(row, "approval_status")?)?,
        business_status: BusinessStatus::parse(&business_status).ok_or_else(|| {
            RepositoryError::Decode(format!("unknown business status `{business_status}`"))
        })?,
        external_reference_id: column(row, "external_reference_id")?,
        approval_channel: approval_channel.as_deref().map(parse_enum::<ProviderKind>).transpose()?,
        submitted_by: column(row, "submitted_by")?,
        decided_by: column(row, "decided_by")?,
        decided_at: decided_at.as_deref().map(parse_timestamp).transpose()?,
        decision_reason: column(row, "decision_reason")?,
        cycle_sequence: parse_cycle(column(row, "cycle_sequence")?)?,
        version: column(row, "version")?,
        snapshot: serde_json::from_str(&snapshot_json)
            .map_err(|e| RepositoryError::Decode(format!("snapshot_json: {e}")))?,
        created_at: parse_timestamp(&created_at)?,
        updated_at: parse_timestamp(&updated_at)?,
    })
}

fn row_to_record(row: &SqliteRow) -> Result<ApprovalRecord, RepositoryError> {
    let created_at: String = column(row, "created_at")?;

    Ok(ApprovalRecord {
        record_id: column(row, "record_id")?,
        entity_id: EntityId(column(row, "entity_id")?),
        cycle_sequence: parse_cycle(column(row, "cycle_sequence")?)?,
        action: parse_enum(&column::<String>(row, "action")?)?,
        resulting_status: parse_enum(&column::<String>(row, "resulting_status")?)?,
        channel: parse_enum(&column::<String>(row, "channel")?)?,
        operator_id: column(row, "operator_id")?,
        external_reference_id: column(row, "external_reference_id")?,
        comment: column(row, "comment")?,
        created_at: parse_timestamp(&created_at)?,
    })
}

fn snapshot_json(entity: &ApprovableEntity) -> Result<String, StoreError> {
    serde_json::to_string(&entity.snapshot)
        .map_err(|e| StoreError::Backend(format!("snapshot encode failed: {e}")))
}

fn backend(error: sqlx::Error) -> StoreError {
    RepositoryError::Database(error).into()
}

/// Version-guarded write of every mutable entity column.
async fn write_entity(
    conn: &mut SqliteConnection,
    entity: &ApprovableEntity,
    expected_version: i64,
) -> Result<(), StoreError> {
    let snapshot = snapshot_json(entity)?;
    let updated = sqlx::query(
        "UPDATE approvable_entity SET
             approval_status = ?, business_status = ?, external_reference_id = ?,
             approval_channel = ?, submitted_by = ?, decided_by = ?, decided_at = ?,
             decision_reason = ?, cycle_sequence = ?, version = ?, snapshot_json = ?,
             updated_at = ?
         WHERE id = ? AND version = ?",
    )
    .bind(entity.approval_status.as_str())
    .bind(entity.business_status.as_str())
    .bind(&entity.external_reference_id)
    .bind(entity.approval_channel.map(ProviderKind::as_str))
    .bind(&entity.submitted_by)
    .bind(&entity.decided_by)
    .bind(entity.decided_at.map(|dt| dt.to_rfc3339()))
    .bind(&entity.decision_reason)
    .bind(i64::from(entity.cycle_sequence))
    .bind(entity.version)
    .bind(snapshot)
    .bind(entity.updated_at.to_rfc3339())
    .bind(&entity.id.0)
    .bind(expected_version)
    .execute(&mut *conn)
    .await
    .map_err(backend)?;

    if updated.rows_affected() == 1 {
        return Ok(());
    }

    let exists = sqlx::query("SELECT 1 FROM approvable_entity WHERE id = ?")
        .bind(&entity.id.0)
        .fetch_optional(&mut *conn)
        .await
        .map_err(backend)?
        .is_some();

    if exists {
        Err(StoreError::VersionConflict { entity_id: entity.id.clone(), expected_version })
    } else {
        Err(StoreError::NotFound(entity.id.clone()))
    }
}

#[async_trait]
impl ApprovalStore for SqlApprovalStore {
    async fn load_entity(&self, id: &EntityId) -> Result<Option<ApprovableEntity>, StoreError> {
        let row = sqlx::query(&format!("{SELECT_ENTITY} WHERE id = ?"))
            .bind(&id.0)
            .fetch_optional(&self.pool)
            .await
            .map_err(backend)?;

        match row {
            Some(ref r) => Ok(Some(row_to_entity(r)?)),
            None => Ok(None),
        }
    }

    async fn insert_entity(&self, entity: ApprovableEntity) -> Result<(), StoreError> {
        let snapshot = snapshot_json(&entity)?;
        let result = sqlx::query(
            "INSERT INTO approvable_entity (id, approval_status, business_status,
                 external_reference_id, approval_channel, submitted_by, decided_by, decided_at,
                 decision_reason, cycle_sequence, version, snapshot_json, created_at, updated_at)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&entity.id.0)
        .bind(entity.approval_status.as_str())
        .bind(entity.business_status.as_str())
        .bind(&entity.external_reference_id)
        .bind(entity.approval_channel.map(ProviderKind::as_str))
        .bind(&entity.submitted_by)
        .bind(&entity.decided_by)
        .bind(entity.decided_at.map(|dt| dt.to_rfc3339()))
        .bind(&entity.decision_reason)
        .bind(i64::from(entity.cycle_sequence))
        .bind(entity.version)
        .bind(snapshot)
        .bind(entity.created_at.to_rfc3339())
        .bind(entity.updated_at.to_rfc3339())
        .execute(&self.pool)
        .await;

        match result {
            Ok(_) => Ok(()),
            Err(error) if is_unique_violation(&error) => Err(StoreError::AlreadyExists(entity.id)),
            Err(error) => Err(backend(error)),
        }
    }

    async fn commit(
        &self,
        entity: &ApprovableEntity,
        expected_version: i64,
        record: &ApprovalRecord,
    ) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await.map_err(backend)?;

        write_entity(&mut *tx, entity, expected_version).await?;

        let inserted = sqlx::query(
            "INSERT INTO approval_record (record_id, entity_id, cycle_sequence, action,
                 resulting_status, channel, operator_id, external_reference_id, comment,
                 created_at)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&record.record_id)
        .bind(&record.entity_id.0)
        .bind(i64::from(record.cycle_sequence))
        .bind(record.action.as_str())
        .bind(record.resulting_status.as_str())
        .bind(record.channel.as_str())
        .bind(&record.operator_id)
        .bind(&record.external_reference_id)
        .bind(&record.comment)
        .bind(record.created_at.to_rfc3339())
        .execute(&mut *tx)
        .await;

        match inserted {
            Ok(_) => {}
            Err(error) if is_unique_violation(&error) && record.is_terminal() => {
                return Err(StoreError::DuplicateTerminal {
                    entity_id: record.entity_id.clone(),
                    cycle_sequence: record.cycle_sequence,
                });
            }
            Err(error) => return Err(backend(error)),
        }

        tx.commit().await.map_err(backend)
    }

    async fn update_entity(
        &self,
        entity: &ApprovableEntity,
        expected_version: i64,
    ) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await.map_err(backend)?;
        write_entity(&mut *tx, entity, expected_version).await?;
        tx.commit().await.map_err(backend)
    }

    async fn find_reference_owner(
        &self,
        reference_id: &str,
    ) -> Result<Option<ReferenceOwner>, StoreError> {
        let current = sqlx::query(
            "SELECT id, cycle_sequence FROM approvable_entity
             WHERE external_reference_id = ? LIMIT 1",
        )
        .bind(reference_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(backend)?;

        if let Some(row) = current {
            return Ok(Some(ReferenceOwner {
                entity_id: EntityId(column(&row, "id")?),
                cycle_sequence: parse_cycle(column(&row, "cycle_sequence")?)?,
            }));
        }

        let historical = sqlx::query(
            "SELECT entity_id, cycle_sequence FROM approval_record
             WHERE external_reference_id = ?
             ORDER BY position DESC LIMIT 1",
        )
        .bind(reference_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(backend)?;

        match historical {
            Some(row) => Ok(Some(ReferenceOwner {
                entity_id: EntityId(column(&row, "entity_id")?),
                cycle_sequence: parse_cycle(column(&row, "cycle_sequence")?)?,
            })),
            None => Ok(None),
        }
    }

    async fn history(&self, id: &EntityId) -> Result<Vec<ApprovalRecord>, StoreError> {
        let rows = sqlx::query(&format!("{SELECT_RECORD} WHERE entity_id = ? ORDER BY position"))
            .bind(&id.0)
            .fetch_all(&self.pool)
            .await
            .map_err(backend)?;

        Ok(rows.iter().map(row_to_record).collect::<Result<Vec<_>, _>>()?)
    }

    async fn statistics(&self) -> Result<LedgerStatistics, StoreError> {
        let rows = sqlx::query(
            "SELECT action, channel, resulting_status, COUNT(*) AS count
             FROM approval_record
             GROUP BY action, channel, resulting_status",
        )
        .fetch_all(&self.pool)
        .await
        .map_err(backend)?;

        let mut stats = LedgerStatistics::default();
        for row in &rows {
            let action: String = column(row, "action")?;
            let channel: String = column(row, "channel")?;
            let status: String = column(row, "resulting_status")?;
            let count: i64 = column(row, "count")?;
            stats.add(&action, &channel, &status, u64::try_from(count).unwrap_or_default());
        }
        Ok(stats)
    }

    async fn list_by_status(
        &self,
        status: ApprovalStatus,
        owner: Option<ProviderKind>,
    ) -> Result<Vec<ApprovableEntity>, StoreError> {
        let owner = owner.map(ProviderKind::as_str);
        let rows = sqlx::query(&format!(
            "{SELECT_ENTITY}
             WHERE approval_status = ? AND (? IS NULL OR approval_channel = ?)
             ORDER BY id"
        ))
        .bind(status.as_str())
        .bind(owner)
        .bind(owner)
        .fetch_all(&self.pool)
        .await
        .map_err(backend)?;

        Ok(rows.iter().map(row_to_entity).collect::<Result<Vec<_>, _>>()?)
    }
}
