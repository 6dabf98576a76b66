use std::env;
use std::path::Path;
use std::sync::{Arc, Mutex, OnceLock};

use accord_cli::commands::{doctor, history, migrate, repair, sign};
use accord_core::approvals::{ApprovalEngine, ProviderSet};
use accord_core::domain::approval::{
    ApprovalAction, ApprovalChannel, ApprovalOperation, ApprovalStatus,
};
use accord_core::domain::entity::{ApprovableEntity, EntityId, EntitySnapshot};
use accord_core::store::ApprovalStore;
use accord_db::{connect, migrations, SqlApprovalStore};
use serde_json::Value;

#[test]
fn migrate_returns_success_with_valid_env() {
    with_env(&[("ACCORD_DATABASE_URL", "sqlite::memory:")], || {
        let result = migrate::run();
        assert_eq!(result.exit_code, 0, "expected successful migrate run");

        let payload = parse_payload(&result.output);
        assert_eq!(payload["command"], "migrate");
        assert_eq!(payload["status"], "ok");
    });
}

#[test]
fn migrate_returns_config_failure_for_incomplete_platform_credentials() {
    with_env(
        &[("ACCORD_DATABASE_URL", "sqlite::memory:"), ("ACCORD_EEMP_ENABLED", "true")],
        || {
            let result = migrate::run();
            assert_eq!(result.exit_code, 2, "expected config validation failure code");

            let payload = parse_payload(&result.output);
            assert_eq!(payload["status"], "error");
            assert_eq!(payload["error_class"], "config_validation");
        },
    );
}

#[test]
fn history_lists_ledger_records_of_a_submitted_entity() {
    let dir = tempfile::tempdir().expect("temp dir");
    let url = seeded_database(dir.path());

    with_env(&[("ACCORD_DATABASE_URL", &url)], || {
        let result = history::run("Q-CLI-1");
        assert_eq!(result.exit_code, 0, "history failed: {}", result.output);

        let payload = parse_payload(&result.output);
        assert_eq!(payload["data"]["entity"]["approval_status"], "pending");
        let records = payload["data"]["records"].as_array().expect("records array");
        assert_eq!(records.len(), 1);
        assert_eq!(records[0]["action"], "submit");
        assert_eq!(records[0]["operator_id"], "alice");
    });
}

#[test]
fn history_reports_unknown_entities_as_not_found() {
    let dir = tempfile::tempdir().expect("temp dir");
    let url = seeded_database(dir.path());

    with_env(&[("ACCORD_DATABASE_URL", &url)], || {
        let result = history::run("Q-MISSING");
        assert_eq!(result.exit_code, 6);
        assert_eq!(parse_payload(&result.output)["error_class"], "not_found");

        let blank = history::run("   ");
        assert_eq!(blank.exit_code, 8);
    });
}

#[test]
fn repair_restores_status_derived_from_the_ledger() {
    let dir = tempfile::tempdir().expect("temp dir");
    let url = seeded_database(dir.path());
    tamper_status(&url, "Q-CLI-1", ApprovalStatus::Approved);

    with_env(&[("ACCORD_DATABASE_URL", &url)], || {
        let repaired = repair::run("Q-CLI-1");
        assert_eq!(repaired.exit_code, 0, "repair failed: {}", repaired.output);
        let payload = parse_payload(&repaired.output);
        assert_eq!(payload["data"]["outcome"], "repaired");
        assert_eq!(payload["message"], "Q-CLI-1 repaired: approved -> pending");

        let again = repair::run("Q-CLI-1");
        assert_eq!(parse_payload(&again.output)["data"]["outcome"], "consistent");
    });
}

#[test]
fn doctor_passes_on_a_migrated_database_with_platform_disabled() {
    let dir = tempfile::tempdir().expect("temp dir");
    let url = seeded_database(dir.path());

    with_env(&[("ACCORD_DATABASE_URL", &url)], || {
        let result = doctor::run(true);
        assert_eq!(result.exit_code, 0, "doctor failed: {}", result.output);

        let payload = parse_payload(&result.output);
        assert_eq!(payload["overall_status"], "pass");
        let eemp = payload["checks"]
            .as_array()
            .and_then(|checks| checks.iter().find(|check| check["name"] == "eemp_readiness"))
            .expect("eemp check present");
        assert_eq!(eemp["status"], "skipped");
    });
}

#[test]
fn doctor_flags_pending_migrations() {
    with_env(&[("ACCORD_DATABASE_URL", "sqlite::memory:")], || {
        let result = doctor::run(false);
        assert_ne!(result.exit_code, 0);
        assert!(result.output.contains("- [fail] schema_migrations"), "{}", result.output);
    });
}

#[test]
fn sign_with_explicit_token_matches_known_vector() {
    with_env(&[], || {
        let result = sign::run(Some("T"), "1000", "abc", "XYZ");
        assert_eq!(result.exit_code, 0);
        let payload = parse_payload(&result.output);
        assert_eq!(payload["data"]["signature"], "d629057e93f3a2d59cac1f26a12c9a64f832ab9e");
    });
}

#[test]
fn sign_without_any_token_is_invalid_input() {
    with_env(&[("ACCORD_DATABASE_URL", "sqlite::memory:")], || {
        let result = sign::run(None, "1000", "abc", "XYZ");
        assert_eq!(result.exit_code, 8);
        assert_eq!(parse_payload(&result.output)["error_class"], "invalid_input");
    });
}

/// Migrated file database holding `Q-CLI-1` submitted once by `alice`.
fn seeded_database(dir: &Path) -> String {
    let url = format!("sqlite://{}?mode=rwc", dir.join("accord.db").display());
    block_on(async {
        let pool = connect(&url).await.expect("connect");
        migrations::run_pending(&pool).await.expect("migrate");

        let engine = ApprovalEngine::new(
            Arc::new(SqlApprovalStore::new(pool.clone())),
            ProviderSet::internal_only(),
        );
        let id = EntityId::new("Q-CLI-1");
        engine
            .register(ApprovableEntity::new(id.clone(), EntitySnapshot::new("CLI fixture")))
            .await
            .expect("register");
        engine
            .execute(ApprovalOperation::new(
                id,
                ApprovalAction::Submit,
                "alice",
                ApprovalChannel::Api,
            ))
            .await
            .expect("submit");
        pool.close().await;
    });
    url
}

fn tamper_status(url: &str, entity_id: &str, status: ApprovalStatus) {
    block_on(async {
        let pool = connect(url).await.expect("connect");
        let store = SqlApprovalStore::new(pool.clone());
        let mut entity = store
            .load_entity(&EntityId::new(entity_id))
            .await
            .expect("load")
            .expect("entity exists");
        let expected = entity.version;
        entity.version += 1;
        entity.approval_status = status;
        store.update_entity(&entity, expected).await.expect("tamper");
        pool.close().await;
    });
}

fn block_on<F: std::future::Future>(future: F) -> F::Output {
    tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .expect("runtime")
        .block_on(future)
}

fn parse_payload(output: &str) -> Value {
    serde_json::from_str(output).expect("command output should be valid JSON")
}

fn with_env(vars: &[(&str, &str)], test_fn: impl FnOnce()) {
    static ENV_LOCK: OnceLock<Mutex<()>> = OnceLock::new();
    let _guard =
        ENV_LOCK.get_or_init(|| Mutex::new(())).lock().expect("env mutex should not be poisoned");

    let keys = [
        "ACCORD_DATABASE_URL",
        "ACCORD_DATABASE_MAX_CONNECTIONS",
        "ACCORD_DATABASE_TIMEOUT_SECS",
        "ACCORD_SERVER_BIND_ADDRESS",
        "ACCORD_SERVER_PORT",
        "ACCORD_SERVER_GRACEFUL_SHUTDOWN_SECS",
        "ACCORD_EEMP_ENABLED",
        "ACCORD_EEMP_BASE_URL",
        "ACCORD_EEMP_APP_KEY",
        "ACCORD_EEMP_APP_SECRET",
        "ACCORD_EEMP_TEMPLATE_ID",
        "ACCORD_EEMP_CALLBACK_TOKEN",
        "ACCORD_EEMP_AES_KEY",
        "ACCORD_EEMP_RECEIVER_ID",
        "ACCORD_ENGINE_WEBHOOK_TIMEOUT_SECS",
        "ACCORD_ENGINE_RECONCILE_INTERVAL_SECS",
        "ACCORD_LOGGING_LEVEL",
        "ACCORD_LOGGING_FORMAT",
        "ACCORD_LOG_LEVEL",
        "ACCORD_LOG_FORMAT",
    ];

    let previous_values: Vec<(&str, Option<String>)> =
        keys.iter().map(|key| (*key, env::var(key).ok())).collect();

    for key in &keys {
        env::remove_var(key);
    }
    for (key, value) in vars {
        env::set_var(key, value);
    }

    test_fn();

    for (key, value) in previous_values {
        if let Some(value) = value {
            env::set_var(key, value);
        } else {
            env::remove_var(key);
        }
    }
}
