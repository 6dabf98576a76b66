use accord_core::config::{AppConfig, LoadOptions};
use accord_db::{connect_with_config, migrations};
use accord_eemp::{CallbackCrypto, EempClient};
use serde::Serialize;

use crate::commands::{CommandResult, EXIT_RUNTIME};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
enum CheckStatus {
    Pass,
    Fail,
    Skipped,
}

#[derive(Debug, Serialize)]
struct DoctorCheck {
    name: &'static str,
    status: CheckStatus,
    details: String,
}

impl DoctorCheck {
    fn pass(name: &'static str, details: impl Into<String>) -> Self {
        Self { name, status: CheckStatus::Pass, details: details.into() }
    }

    fn fail(name: &'static str, details: impl Into<String>) -> Self {
        Self { name, status: CheckStatus::Fail, details: details.into() }
    }

    fn skipped(name: &'static str, details: impl Into<String>) -> Self {
        Self { name, status: CheckStatus::Skipped, details: details.into() }
    }
}

#[derive(Debug, Serialize)]
struct DoctorReport {
    overall_status: CheckStatus,
    summary: String,
    checks: Vec<DoctorCheck>,
}

/// Exits non-zero when any check failed; skipped checks do not count against readiness.
pub fn run(json_output: bool) -> CommandResult {
    let report = build_report();
    let exit_code = if report.overall_status == CheckStatus::Fail { EXIT_RUNTIME } else { 0 };

    let output = if json_output {
        serde_json::to_string_pretty(&report).unwrap_or_else(|error| {
            serde_json::json!({
                "overall_status": "fail",
                "summary": "doctor serialization failed",
                "error": error.to_string(),
            })
            .to_string()
        })
    } else {
        render_human(&report)
    };

    CommandResult { exit_code, output }
}

fn build_report() -> DoctorReport {
    let checks = match AppConfig::load(LoadOptions::default()) {
        Ok(config) => {
            let mut checks =
                vec![DoctorCheck::pass("config_validation", "configuration loaded and validated")];
            checks.extend(runtime_checks(&config));
            checks
        }
        Err(error) => {
            let skipped = "skipped because configuration did not load";
            vec![
                DoctorCheck::fail("config_validation", error.to_string()),
                DoctorCheck::skipped("database_connectivity", skipped),
                DoctorCheck::skipped("schema_migrations", skipped),
                DoctorCheck::skipped("eemp_readiness", skipped),
            ]
        }
    };

    let failed = checks.iter().any(|check| check.status == CheckStatus::Fail);
    let overall_status = if failed { CheckStatus::Fail } else { CheckStatus::Pass };
    let summary = if failed {
        "doctor: one or more readiness checks failed".to_string()
    } else {
        "doctor: all readiness checks passed".to_string()
    };

    DoctorReport { overall_status, summary, checks }
}

fn runtime_checks(config: &AppConfig) -> Vec<DoctorCheck> {
    let runtime = match tokio::runtime::Builder::new_current_thread().enable_all().build() {
        Ok(runtime) => runtime,
        Err(error) => {
            let details = format!("failed to initialize async runtime: {error}");
            return vec![
                DoctorCheck::fail("database_connectivity", details.clone()),
                DoctorCheck::skipped("schema_migrations", details.clone()),
                DoctorCheck::skipped("eemp_readiness", details),
            ];
        }
    };

    runtime.block_on(async {
        let mut checks = database_checks(config).await;
        checks.push(eemp_check(config).await);
        checks
    })
}

async fn database_checks(config: &AppConfig) -> Vec<DoctorCheck> {
    let pool = match connect_with_config(&config.database).await {
        Ok(pool) => pool,
        Err(error) => {
            return vec![
                DoctorCheck::fail(
                    "database_connectivity",
                    format!("failed to connect to database: {error}"),
                ),
                DoctorCheck::skipped("schema_migrations", "skipped because the database is down"),
            ];
        }
    };

    let connectivity = DoctorCheck::pass(
        "database_connectivity",
        format!("connected using `{}`", config.database.url),
    );
    let schema = match migrations::pending_count(&pool).await {
        Ok(0) => DoctorCheck::pass("schema_migrations", "schema is up to date"),
        Ok(pending) => DoctorCheck::fail(
            "schema_migrations",
            format!("{pending} pending migration(s); run `accord migrate`"),
        ),
        Err(error) => {
            DoctorCheck::fail("schema_migrations", format!("failed to read migrations: {error}"))
        }
    };
    pool.close().await;
    vec![connectivity, schema]
}

async fn eemp_check(config: &AppConfig) -> DoctorCheck {
    let eemp = &config.eemp;
    if !eemp.enabled {
        return DoctorCheck::skipped(
            "eemp_readiness",
            "platform integration disabled; approvals run on the internal provider",
        );
    }

    if let Err(error) =
        CallbackCrypto::new(eemp.callback_token.clone(), &eemp.aes_key, eemp.receiver_id.clone())
    {
        return DoctorCheck::fail("eemp_readiness", format!("callback crypto: {error}"));
    }

    let client = match EempClient::new(eemp) {
        Ok(client) => client,
        Err(error) => return DoctorCheck::fail("eemp_readiness", error.to_string()),
    };
    match client.access_token().await {
        Ok(_) => DoctorCheck::pass(
            "eemp_readiness",
            format!("access token issued by {}", eemp.base_url),
        ),
        Err(error) => DoctorCheck::fail("eemp_readiness", format!("token request failed: {error}")),
    }
}

fn render_human(report: &DoctorReport) -> String {
    let mut lines = vec![report.summary.clone()];

    for check in &report.checks {
        let marker = match check.status {
            CheckStatus::Pass => "ok",
            CheckStatus::Fail => "fail",
            CheckStatus::Skipped => "skip",
        };
        lines.push(format!("- [{marker}] {}: {}", check.name, check.details));
    }

    lines.join("\n")
}
