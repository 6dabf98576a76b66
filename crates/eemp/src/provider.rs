use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tracing::{info, warn};

use accord_core::approvals::{ApprovalProvider, ProviderError};
use accord_core::config::EempConfig;
use accord_core::domain::approval::{ApprovalAction, ProviderKind, ReportedStatus};
use accord_core::domain::entity::ApprovableEntity;

use crate::client::{ClientError, CreateInstanceRequest, EempClient, FormComponent};

const TERMINATE_REMARK: &str = "Closed by a decision recorded in the internal app";

/// How long an unreachable platform is left alone before availability is probed again.
pub const DEFAULT_REPROBE_AFTER: Duration = Duration::from_secs(30);

impl From<ClientError> for ProviderError {
    fn from(value: ClientError) -> Self {
        if value.is_unreachable() {
            return Self::Unavailable(value.to_string());
        }
        match value {
            ClientError::Decode(message) => Self::Decode(message),
            ClientError::Api { .. } | ClientError::Http { .. } => Self::Rejected(value.to_string()),
            ClientError::Transport(message) => Self::Transport(message),
        }
    }
}

/// Hosts approval cycles as platform process instances.
pub struct ExternalProvider {
    client: Arc<EempClient>,
    template_id: String,
    approver_id: Option<String>,
    routing_rule_id: Option<String>,
    available: AtomicBool,
    reprobe_after: Duration,
    /// Last failed reachability check; `None` while the platform is reachable.
    last_failure: Mutex<Option<Instant>>,
}

impl ExternalProvider {
    pub fn new(client: Arc<EempClient>, config: &EempConfig) -> Self {
        Self {
            client,
            template_id: config.template_id.clone(),
            approver_id: config.approver_id.clone(),
            routing_rule_id: config.routing_rule_id.clone(),
            available: AtomicBool::new(true),
            reprobe_after: DEFAULT_REPROBE_AFTER,
            last_failure: Mutex::new(None),
        }
    }

    pub fn with_reprobe_after(mut self, reprobe_after: Duration) -> Self {
        self.reprobe_after = reprobe_after;
        self
    }

    /// Checks reachability by fetching a token and records the result.
    pub async fn probe(&self) -> bool {
        let reachable = match self.client.access_token().await {
            Ok(_) => true,
            Err(error) => {
                warn!(
                    event_name = "eemp.provider.probe_failed",
                    error = %error,
                    "platform probe failed"
                );
                false
            }
        };
        if reachable {
            self.mark_available();
        } else {
            self.mark_unavailable();
        }
        reachable
    }

    fn failure_slot(&self) -> std::sync::MutexGuard<'_, Option<Instant>> {
        match self.last_failure.lock() {
            Ok(slot) => slot,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn mark_available(&self) {
        self.available.store(true, Ordering::SeqCst);
        *self.failure_slot() = None;
    }

    fn mark_unavailable(&self) {
        self.available.store(false, Ordering::SeqCst);
        *self.failure_slot() = Some(Instant::now());
    }

    /// Claims the next re-probe once the last failure is older than `reprobe_after`.
    /// Concurrent callers see the refreshed timestamp and do not probe again.
    fn claim_reprobe(&self) -> bool {
        let mut slot = self.failure_slot();
        match *slot {
            Some(failed_at) if failed_at.elapsed() >= self.reprobe_after => {
                *slot = Some(Instant::now());
                true
            }
            Some(_) => false,
            None => true,
        }
    }

    fn track<T>(&self, result: Result<T, ClientError>) -> Result<T, ProviderError> {
        match result {
            Ok(value) => {
                self.mark_available();
                Ok(value)
            }
            Err(error) => {
                if error.is_unreachable() {
                    self.mark_unavailable();
                }
                Err(error.into())
            }
        }
    }

    fn form(entity: &ApprovableEntity) -> Vec<FormComponent> {
        let mut form = vec![
            FormComponent { name: "Record".to_string(), value: entity.id.0.clone() },
            FormComponent { name: "Title".to_string(), value: entity.snapshot.title.clone() },
        ];
        form.extend(entity.snapshot.fields.iter().map(|field| FormComponent {
            name: field.label.clone(),
            value: field.value.render(),
        }));
        form
    }
}

/// Maps the platform's instance `status`/`result` pair onto a report.
pub fn reported_status(status: &str, result: &str) -> Option<ReportedStatus> {
    match (status.to_ascii_uppercase().as_str(), result.to_ascii_lowercase().as_str()) {
        ("NEW" | "RUNNING", _) => Some(ReportedStatus::Running),
        ("COMPLETED", "agree") => Some(ReportedStatus::Approved),
        ("COMPLETED", "refuse") => Some(ReportedStatus::Rejected),
        ("TERMINATED" | "CANCELED", _) => Some(ReportedStatus::Terminated),
        _ => None,
    }
}

#[async_trait]
impl ApprovalProvider for ExternalProvider {
    fn kind(&self) -> ProviderKind {
        ProviderKind::External
    }

    async fn is_available(&self) -> bool {
        if self.available.load(Ordering::SeqCst) {
            return true;
        }
        if !self.claim_reprobe() {
            return false;
        }
        let recovered = self.probe().await;
        if recovered {
            info!(event_name = "eemp.provider.recovered", "platform reachable again");
        }
        recovered
    }

    async fn submit(
        &self,
        entity: &ApprovableEntity,
        operator_id: &str,
    ) -> Result<String, ProviderError> {
        let request = CreateInstanceRequest {
            process_code: self.template_id.clone(),
            originator_user_id: operator_id.to_string(),
            approvers: self.approver_id.clone(),
            routing_rule_id: self.routing_rule_id.clone(),
            form_component_values: Self::form(entity),
        };
        let instance_id = self.track(self.client.create_instance(&request).await)?;

        info!(
            event_name = "eemp.provider.instance_created",
            entity_id = %entity.id,
            reference_id = %instance_id,
            "platform approval instance created"
        );
        Ok(instance_id)
    }

    async fn decide(
        &self,
        reference_id: &str,
        action: ApprovalAction,
        operator_id: &str,
        reason: Option<&str>,
    ) -> Result<(), ProviderError> {
        let mut text = format!("{} by {operator_id} in the internal app", action.default_comment());
        if let Some(reason) = reason.map(str::trim).filter(|reason| !reason.is_empty()) {
            text.push_str(": ");
            text.push_str(reason);
        }
        self.track(self.client.add_comment(reference_id, operator_id, &text).await)
    }

    async fn cancel(&self, reference_id: &str) -> Result<(), ProviderError> {
        self.track(self.client.terminate_instance(reference_id, TERMINATE_REMARK).await)?;
        info!(
            event_name = "eemp.provider.instance_terminated",
            reference_id,
            "platform approval instance terminated"
        );
        Ok(())
    }

    async fn query_status(
        &self,
        reference_id: &str,
    ) -> Result<Option<ReportedStatus>, ProviderError> {
        let instance = self.track(self.client.get_instance(reference_id).await)?;
        Ok(reported_status(&instance.status, &instance.result))
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use accord_core::approvals::{ApprovalProvider, InternalProvider, ProviderError, ProviderSet};
    use accord_core::domain::approval::ProviderKind;
    use accord_core::domain::approval::{ApprovalAction, ReportedStatus};
    use accord_core::domain::entity::{ApprovableEntity, EntityId, EntitySnapshot, FieldValue};
    use rust_decimal::Decimal;

    use super::{reported_status, ExternalProvider};
    use crate::client::EempClient;
    use crate::fake::{eemp_config, FakePlatform};

    async fn provider() -> (FakePlatform, ExternalProvider) {
        let platform = FakePlatform::default();
        let addr = platform.serve().await;
        let config = eemp_config(&format!("http://{addr}"));
        let client = Arc::new(EempClient::new(&config).expect("client"));
        (platform, ExternalProvider::new(client, &config))
    }

    fn entity() -> ApprovableEntity {
        ApprovableEntity::new(
            EntityId::new("Q-2026-0042"),
            EntitySnapshot::new("Acme renewal")
                .with_field("Seats", FieldValue::Number { value: Decimal::new(250, 0) })
                .with_field("Total", FieldValue::money(Decimal::new(4_800_000, 2), "USD")),
        )
    }

    #[tokio::test]
    async fn submit_creates_instance_with_rendered_form_and_routing() {
        let (platform, provider) = provider().await;

        let reference = provider.submit(&entity(), "alice").await.expect("submit");

        assert_eq!(reference, "PI-1");
        let created = platform.calls("create");
        assert_eq!(created.len(), 1);
        assert_eq!(created[0]["process_code"], "PROC-QUOTE");
        assert_eq!(created[0]["originator_user_id"], "alice");
        assert_eq!(created[0]["approvers"], "manager-1");
        let form = created[0]["form_component_values"].as_array().expect("form array");
        assert_eq!(form[0]["value"], "Q-2026-0042");
        assert_eq!(form[2]["name"], "Seats");
        assert_eq!(form[2]["value"], "250");
        assert_eq!(form[3]["value"], "48000.00 USD");
    }

    #[tokio::test]
    async fn access_token_is_cached_between_calls() {
        let (platform, provider) = provider().await;

        provider.submit(&entity(), "alice").await.expect("submit");
        provider
            .decide("PI-1", ApprovalAction::Approve, "bob", Some("fine"))
            .await
            .expect("comment");
        provider.cancel("PI-1").await.expect("terminate");

        assert_eq!(platform.token_requests(), 1);
        let comments = platform.calls("comment");
        assert_eq!(comments[0]["request"]["text"], "Approved by bob in the internal app: fine");
    }

    #[tokio::test]
    async fn api_refusal_is_rejected_not_unavailable() {
        let (platform, provider) = provider().await;
        platform.fail_create_with(40001, "template not found");

        let error = provider.submit(&entity(), "alice").await.expect_err("refused");

        assert!(matches!(error, ProviderError::Rejected(ref message) if message.contains("40001")));
        assert!(provider.is_available().await);
    }

    #[tokio::test]
    async fn unreachable_platform_marks_provider_unavailable() {
        let config = eemp_config("http://127.0.0.1:1");
        let provider =
            ExternalProvider::new(Arc::new(EempClient::new(&config).expect("client")), &config);

        let error = provider.submit(&entity(), "alice").await.expect_err("unreachable");

        assert!(matches!(error, ProviderError::Unavailable(_)));
        assert!(!provider.is_available().await);
        assert!(!provider.probe().await);
    }

    #[tokio::test]
    async fn unreachable_platform_is_not_reprobed_before_the_interval() {
        let config = eemp_config("http://127.0.0.1:1");
        let provider =
            ExternalProvider::new(Arc::new(EempClient::new(&config).expect("client")), &config);

        provider.submit(&entity(), "alice").await.expect_err("unreachable");

        assert!(!provider.is_available().await);
        assert!(!provider.is_available().await);
    }

    #[tokio::test]
    async fn new_cycles_return_to_the_platform_after_an_outage() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let addr = listener.local_addr().expect("local addr");
        drop(listener);

        let config = eemp_config(&format!("http://{addr}"));
        let client = Arc::new(EempClient::new(&config).expect("client"));
        let external: Arc<dyn ApprovalProvider> =
            Arc::new(ExternalProvider::new(client, &config).with_reprobe_after(Duration::ZERO));
        let providers = ProviderSet::new(Arc::new(InternalProvider), Some(external.clone()));

        let (during_outage, _) = providers.submit(&entity(), "alice").await.expect("fallback");
        assert_eq!(during_outage, ProviderKind::Internal);

        let platform = FakePlatform::default();
        platform.serve_at(addr).await;

        let (recovered, reference) = providers.submit(&entity(), "alice").await.expect("submit");
        assert_eq!(recovered, ProviderKind::External);
        assert_eq!(reference, "PI-1");
        assert!(external.is_available().await);
    }

    #[tokio::test]
    async fn query_status_follows_instance_lifecycle() {
        let (platform, provider) = provider().await;
        let reference = provider.submit(&entity(), "alice").await.expect("submit");

        assert_eq!(
            provider.query_status(&reference).await.expect("query"),
            Some(ReportedStatus::Running)
        );
        platform.set_instance(&reference, "COMPLETED", "refuse");
        assert_eq!(
            provider.query_status(&reference).await.expect("query"),
            Some(ReportedStatus::Rejected)
        );
        provider.cancel(&reference).await.expect("cancel");
        assert_eq!(
            provider.query_status(&reference).await.expect("query"),
            Some(ReportedStatus::Terminated)
        );
    }

    #[test]
    fn unknown_platform_status_is_not_reported() {
        assert_eq!(reported_status("COMPLETED", "agree"), Some(ReportedStatus::Approved));
        assert_eq!(reported_status("COMPLETED", ""), None);
        assert_eq!(reported_status("ARCHIVED", ""), None);
    }
}
