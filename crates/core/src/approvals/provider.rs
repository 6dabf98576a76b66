//! Approval providers: who actually hosts a cycle.
//!
//! The engine receives both implementations at construction time through
//! [`ProviderSet`]. The internal provider is always present; the external one
//! only when the messaging platform is configured.

use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::domain::approval::{ApprovalAction, ApprovalChannel, ProviderKind, ReportedStatus};
use crate::domain::entity::ApprovableEntity;
use crate::errors::ApplicationError;

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum ProviderError {
    #[error("provider unavailable: {0}")]
    Unavailable(String),
    #[error("provider rejected the request: {0}")]
    Rejected(String),
    #[error("provider transport failure: {0}")]
    Transport(String),
    #[error("provider response could not be decoded: {0}")]
    Decode(String),
}

impl From<ProviderError> for ApplicationError {
    fn from(value: ProviderError) -> Self {
        match value {
            ProviderError::Unavailable(message) => Self::ProviderUnavailable(message),
            other => Self::Integration(other.to_string()),
        }
    }
}

#[async_trait]
pub trait ApprovalProvider: Send + Sync {
    fn kind(&self) -> ProviderKind;

    async fn is_available(&self) -> bool;

    /// Opens an approval instance and returns its reference id.
    async fn submit(
        &self,
        entity: &ApprovableEntity,
        operator_id: &str,
    ) -> Result<String, ProviderError>;

    async fn decide(
        &self,
        reference_id: &str,
        action: ApprovalAction,
        operator_id: &str,
        reason: Option<&str>,
    ) -> Result<(), ProviderError>;

    async fn cancel(&self, reference_id: &str) -> Result<(), ProviderError>;

    /// Current status as the provider sees it, when the provider can be asked.
    async fn query_status(
        &self,
        reference_id: &str,
    ) -> Result<Option<ReportedStatus>, ProviderError> {
        let _ = reference_id;
        Ok(None)
    }
}

/// Captures decisions directly in the system of record. Never calls out.
#[derive(Clone, Debug, Default)]
pub struct InternalProvider;

#[async_trait]
impl ApprovalProvider for InternalProvider {
    fn kind(&self) -> ProviderKind {
        ProviderKind::Internal
    }

    async fn is_available(&self) -> bool {
        true
    }

    async fn submit(
        &self,
        entity: &ApprovableEntity,
        operator_id: &str,
    ) -> Result<String, ProviderError> {
        let reference_id = format!("INT-{}", Uuid::new_v4().simple());
        debug!(
            event_name = "approval.provider.internal_submit",
            entity_id = %entity.id,
            operator_id,
            reference_id = %reference_id,
            "internal approval cycle opened"
        );
        Ok(reference_id)
    }

    async fn decide(
        &self,
        reference_id: &str,
        action: ApprovalAction,
        operator_id: &str,
        _reason: Option<&str>,
    ) -> Result<(), ProviderError> {
        debug!(
            event_name = "approval.provider.internal_decide",
            reference_id,
            action = %action,
            operator_id,
            "internal decision captured"
        );
        Ok(())
    }

    async fn cancel(&self, reference_id: &str) -> Result<(), ProviderError> {
        debug!(
            event_name = "approval.provider.internal_cancel",
            reference_id,
            "internal approval cycle cancelled"
        );
        Ok(())
    }
}

#[derive(Clone)]
pub struct ProviderSet {
    internal: Arc<dyn ApprovalProvider>,
    external: Option<Arc<dyn ApprovalProvider>>,
}

impl ProviderSet {
    pub fn new(
        internal: Arc<dyn ApprovalProvider>,
        external: Option<Arc<dyn ApprovalProvider>>,
    ) -> Self {
        Self { internal, external }
    }

    pub fn internal_only() -> Self {
        Self::new(Arc::new(InternalProvider), None)
    }

    pub fn external(&self) -> Option<&Arc<dyn ApprovalProvider>> {
        self.external.as_ref()
    }

    pub fn internal(&self) -> &Arc<dyn ApprovalProvider> {
        &self.internal
    }

    /// Opens a cycle on the preferred provider: external when it reports
    /// itself available, internal otherwise or when the external call finds
    /// the platform unreachable.
    pub async fn submit(
        &self,
        entity: &ApprovableEntity,
        operator_id: &str,
    ) -> Result<(ProviderKind, String), ProviderError> {
        if let Some(external) = &self.external {
            if external.is_available().await {
                match external.submit(entity, operator_id).await {
                    Ok(reference_id) => return Ok((external.kind(), reference_id)),
                    Err(ProviderError::Unavailable(message)) => {
                        warn!(
                            event_name = "approval.provider.fallback",
                            entity_id = %entity.id,
                            error = %message,
                            "external provider unavailable, falling back to internal provider"
                        );
                    }
                    Err(error) => return Err(error),
                }
            }
        }

        if !self.internal.is_available().await {
            return Err(ProviderError::Unavailable("no approval provider is available".into()));
        }
        let reference_id = self.internal.submit(entity, operator_id).await?;
        Ok((self.internal.kind(), reference_id))
    }

    /// Provider that must carry out a decide/cancel for a cycle.
    ///
    /// Operations arriving from the external platform already happened there,
    /// so they are captured internally and never sent back.
    pub fn for_cycle(
        &self,
        owner: Option<ProviderKind>,
        origin: ApprovalChannel,
    ) -> Result<&Arc<dyn ApprovalProvider>, ProviderError> {
        if origin == ApprovalChannel::External {
            return Ok(&self.internal);
        }
        match owner {
            Some(ProviderKind::External) => self.external.as_ref().ok_or_else(|| {
                ProviderError::Unavailable(
                    "cycle is owned by the external platform, which is not configured".into(),
                )
            }),
            Some(ProviderKind::Internal) | None => Ok(&self.internal),
        }
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Mutex;

    use async_trait::async_trait;

    use super::{ApprovalProvider, ProviderError};
    use crate::domain::approval::{ApprovalAction, ProviderKind, ReportedStatus};
    use crate::domain::entity::ApprovableEntity;

    #[derive(Clone, Debug, PartialEq, Eq)]
    pub enum ProviderCall {
        Submit { entity_id: String },
        Decide { reference_id: String, action: ApprovalAction },
        Cancel { reference_id: String },
    }

    /// Scripted stand-in for the external platform.
    pub struct ScriptedProvider {
        pub available: AtomicBool,
        pub fail_next: Mutex<Option<ProviderError>>,
        references: Mutex<VecDeque<String>>,
        pub calls: Mutex<Vec<ProviderCall>>,
        pub reported: Mutex<Option<ReportedStatus>>,
    }

    impl ScriptedProvider {
        pub fn with_references(references: &[&str]) -> Self {
            Self {
                available: AtomicBool::new(true),
                fail_next: Mutex::new(None),
                references: Mutex::new(references.iter().map(|r| r.to_string()).collect()),
                calls: Mutex::new(Vec::new()),
                reported: Mutex::new(None),
            }
        }

        pub fn calls(&self) -> Vec<ProviderCall> {
            self.calls.lock().map(|calls| calls.clone()).unwrap_or_default()
        }

        pub fn fail_next_with(&self, error: ProviderError) {
            if let Ok(mut slot) = self.fail_next.lock() {
                *slot = Some(error);
            }
        }

        fn take_failure(&self) -> Option<ProviderError> {
            self.fail_next.lock().ok().and_then(|mut slot| slot.take())
        }

        fn push(&self, call: ProviderCall) {
            if let Ok(mut calls) = self.calls.lock() {
                calls.push(call);
            }
        }
    }

    #[async_trait]
    impl ApprovalProvider for ScriptedProvider {
        fn kind(&self) -> ProviderKind {
            ProviderKind::External
        }

        async fn is_available(&self) -> bool {
            self.available.load(Ordering::SeqCst)
        }

        async fn submit(
            &self,
            entity: &ApprovableEntity,
            _operator_id: &str,
        ) -> Result<String, ProviderError> {
            if let Some(error) = self.take_failure() {
                return Err(error);
            }
            self.push(ProviderCall::Submit { entity_id: entity.id.0.clone() });
            let next = self.references.lock().ok().and_then(|mut refs| refs.pop_front());
            next.ok_or_else(|| ProviderError::Rejected("no scripted reference left".into()))
        }

        async fn decide(
            &self,
            reference_id: &str,
            action: ApprovalAction,
            _operator_id: &str,
            _reason: Option<&str>,
        ) -> Result<(), ProviderError> {
            if let Some(error) = self.take_failure() {
                return Err(error);
            }
            self.push(ProviderCall::Decide { reference_id: reference_id.to_string(), action });
            Ok(())
        }

        async fn cancel(&self, reference_id: &str) -> Result<(), ProviderError> {
            if let Some(error) = self.take_failure() {
                return Err(error);
            }
            self.push(ProviderCall::Cancel { reference_id: reference_id.to_string() });
            Ok(())
        }

        async fn query_status(
            &self,
            _reference_id: &str,
        ) -> Result<Option<ReportedStatus>, ProviderError> {
            Ok(self.reported.lock().ok().and_then(|reported| *reported))
        }
    }
}
