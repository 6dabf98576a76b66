//! Persistence port for approvable entities and their approval ledger.
//!
//! `commit` is the only write path the engine uses: the entity update and the
//! ledger record land together or not at all, guarded by the entity `version`.

use std::collections::HashMap;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::RwLock;

use crate::approvals::ledger::LedgerStatistics;
use crate::domain::approval::{ApprovalRecord, ApprovalStatus, ProviderKind};
use crate::domain::entity::{ApprovableEntity, EntityId};
use crate::errors::ApplicationError;

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum StoreError {
    #[error("version conflict on entity {entity_id}: expected version {expected_version}")]
    VersionConflict { entity_id: EntityId, expected_version: i64 },
    #[error("entity already exists: {0}")]
    AlreadyExists(EntityId),
    #[error("entity not found: {0}")]
    NotFound(EntityId),
    #[error("cycle {cycle_sequence} of entity {entity_id} already has a terminal record")]
    DuplicateTerminal { entity_id: EntityId, cycle_sequence: u32 },
    #[error("storage backend error: {0}")]
    Backend(String),
}

impl From<StoreError> for ApplicationError {
    fn from(value: StoreError) -> Self {
        match value {
            StoreError::VersionConflict { entity_id, expected_version } => {
                Self::ConcurrencyConflict { entity_id, expected_version }
            }
            StoreError::DuplicateTerminal { entity_id, .. } => {
                Self::ConcurrencyConflict { entity_id, expected_version: -1 }
            }
            StoreError::NotFound(entity_id) => Self::EntityNotFound(entity_id),
            StoreError::AlreadyExists(entity_id) => {
                Self::Persistence(format!("entity already exists: {entity_id}"))
            }
            StoreError::Backend(message) => Self::Persistence(message),
        }
    }
}

/// Which entity and cycle an external reference belongs to.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ReferenceOwner {
    pub entity_id: EntityId,
    pub cycle_sequence: u32,
}

#[async_trait]
pub trait ApprovalStore: Send + Sync {
    async fn load_entity(&self, id: &EntityId) -> Result<Option<ApprovableEntity>, StoreError>;

    async fn insert_entity(&self, entity: ApprovableEntity) -> Result<(), StoreError>;

    /// Persists `entity` and appends `record` atomically. Fails with
    /// `VersionConflict` when the stored version is not `expected_version`.
    async fn commit(
        &self,
        entity: &ApprovableEntity,
        expected_version: i64,
        record: &ApprovalRecord,
    ) -> Result<(), StoreError>;

    /// Version-checked entity update without a ledger record (status repair).
    async fn update_entity(
        &self,
        entity: &ApprovableEntity,
        expected_version: i64,
    ) -> Result<(), StoreError>;

    async fn find_reference_owner(
        &self,
        reference_id: &str,
    ) -> Result<Option<ReferenceOwner>, StoreError>;

    /// All records of one entity, oldest first.
    async fn history(&self, id: &EntityId) -> Result<Vec<ApprovalRecord>, StoreError>;

    async fn statistics(&self) -> Result<LedgerStatistics, StoreError>;

    async fn list_by_status(
        &self,
        status: ApprovalStatus,
        owner: Option<ProviderKind>,
    ) -> Result<Vec<ApprovableEntity>, StoreError>;
}

#[derive(Default)]
struct MemoryState {
    entities: HashMap<EntityId, ApprovableEntity>,
    records: Vec<ApprovalRecord>,
}

/// Process-local store. Commits are serialized by one write lock.
#[derive(Default)]
pub struct InMemoryApprovalStore {
    state: RwLock<MemoryState>,
}

impl InMemoryApprovalStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn record_count(&self) -> usize {
        self.state.read().await.records.len()
    }
}

#[async_trait]
impl ApprovalStore for InMemoryApprovalStore {
    async fn load_entity(&self, id: &EntityId) -> Result<Option<ApprovableEntity>, StoreError> {
        Ok(self.state.read().await.entities.get(id).cloned())
    }

    async fn insert_entity(&self, entity: ApprovableEntity) -> Result<(), StoreError> {
        let mut state = self.state.write().await;
        if state.entities.contains_key(&entity.id) {
            return Err(StoreError::AlreadyExists(entity.id));
        }
        state.entities.insert(entity.id.clone(), entity);
        Ok(())
    }

    async fn commit(
        &self,
        entity: &ApprovableEntity,
        expected_version: i64,
        record: &ApprovalRecord,
    ) -> Result<(), StoreError> {
        let mut state = self.state.write().await;
        let stored = state
            .entities
            .get(&entity.id)
            .ok_or_else(|| StoreError::NotFound(entity.id.clone()))?;
        if stored.version != expected_version {
            return Err(StoreError::VersionConflict {
                entity_id: entity.id.clone(),
                expected_version,
            });
        }
        if record.is_terminal()
            && state.records.iter().any(|existing| {
                existing.entity_id == record.entity_id
                    && existing.cycle_sequence == record.cycle_sequence
                    && existing.is_terminal()
            })
        {
            return Err(StoreError::DuplicateTerminal {
                entity_id: record.entity_id.clone(),
                cycle_sequence: record.cycle_sequence,
            });
        }

        state.entities.insert(entity.id.clone(), entity.clone());
        state.records.push(record.clone());
        Ok(())
    }

    async fn update_entity(
        &self,
        entity: &ApprovableEntity,
        expected_version: i64,
    ) -> Result<(), StoreError> {
        let mut state = self.state.write().await;
        let stored = state
            .entities
            .get(&entity.id)
            .ok_or_else(|| StoreError::NotFound(entity.id.clone()))?;
        if stored.version != expected_version {
            return Err(StoreError::VersionConflict {
                entity_id: entity.id.clone(),
                expected_version,
            });
        }
        state.entities.insert(entity.id.clone(), entity.clone());
        Ok(())
    }

    async fn find_reference_owner(
        &self,
        reference_id: &str,
    ) -> Result<Option<ReferenceOwner>, StoreError> {
        let state = self.state.read().await;
        let current = state.entities.values().find(|entity| {
            entity.external_reference_id.as_deref() == Some(reference_id)
        });
        if let Some(entity) = current {
            return Ok(Some(ReferenceOwner {
                entity_id: entity.id.clone(),
                cycle_sequence: entity.cycle_sequence,
            }));
        }

        Ok(state
            .records
            .iter()
            .rev()
            .find(|record| record.external_reference_id.as_deref() == Some(reference_id))
            .map(|record| ReferenceOwner {
                entity_id: record.entity_id.clone(),
                cycle_sequence: record.cycle_sequence,
            }))
    }

    async fn history(&self, id: &EntityId) -> Result<Vec<ApprovalRecord>, StoreError> {
        let state = self.state.read().await;
        Ok(state.records.iter().filter(|record| &record.entity_id == id).cloned().collect())
    }

    async fn statistics(&self) -> Result<LedgerStatistics, StoreError> {
        let state = self.state.read().await;
        Ok(LedgerStatistics::from_records(&state.records))
    }

    async fn list_by_status(
        &self,
        status: ApprovalStatus,
        owner: Option<ProviderKind>,
    ) -> Result<Vec<ApprovableEntity>, StoreError> {
        let state = self.state.read().await;
        let mut matching: Vec<ApprovableEntity> = state
            .entities
            .values()
            .filter(|entity| entity.approval_status == status)
            .filter(|entity| owner.is_none() || entity.approval_channel == owner)
            .cloned()
            .collect();
        matching.sort_by(|left, right| left.id.cmp(&right.id));
        Ok(matching)
    }
}
