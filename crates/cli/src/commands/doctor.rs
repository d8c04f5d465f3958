use std::fs;
use std::path::Path;

use serde::Serialize;
use tenantry_core::config::{AppConfig, DatabaseConfig, LoadOptions};
use tenantry_db::{connect_with_settings, migrations, ping};

use crate::commands::{runtime, CommandResult};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
enum Verdict {
    Pass,
    Fail,
    Skipped,
}

#[derive(Debug, Serialize)]
struct Check {
    name: &'static str,
    verdict: Verdict,
    details: String,
}

impl Check {
    fn pass(name: &'static str, details: impl Into<String>) -> Self {
        Self { name, verdict: Verdict::Pass, details: details.into() }
    }

    fn fail(name: &'static str, details: impl Into<String>) -> Self {
        Self { name, verdict: Verdict::Fail, details: details.into() }
    }

    fn skipped(name: &'static str, because: &str) -> Self {
        Self { name, verdict: Verdict::Skipped, details: format!("skipped: {because}") }
    }
}

#[derive(Debug, Serialize)]
struct Readiness {
    ready: bool,
    checks: Vec<Check>,
}

const PLATFORM_DATABASE: &str = "platform_database";
const PLATFORM_SCHEMA: &str = "platform_schema";
const TENANT_DATA_DIR: &str = "tenant_data_dir";

pub fn run(options: &LoadOptions, json_output: bool) -> CommandResult {
    let readiness = assess(options);
    let exit_code = if readiness.ready { 0 } else { 1 };

    let output = if json_output {
        match serde_json::to_string_pretty(&readiness) {
            Ok(json) => json,
            Err(error) => {
                return CommandResult::failure(
                    "doctor",
                    "serialization",
                    format!("could not serialize readiness report: {error}"),
                    1,
                );
            }
        }
    } else {
        render(&readiness)
    };

    CommandResult { exit_code, output }
}

fn assess(options: &LoadOptions) -> Readiness {
    let checks = match AppConfig::load(options.clone()) {
        Ok(config) => {
            let mut checks = vec![Check::pass("config", "configuration loaded and validated")];
            checks.extend(check_platform(&config.database));
            checks.push(check_tenant_data_dir(&config.database.tenant_data_dir));
            checks
        }
        Err(error) => vec![
            Check::fail("config", error.to_string()),
            Check::skipped(PLATFORM_DATABASE, "configuration did not load"),
            Check::skipped(PLATFORM_SCHEMA, "configuration did not load"),
            Check::skipped(TENANT_DATA_DIR, "configuration did not load"),
        ],
    };

    let ready = checks.iter().all(|check| check.verdict == Verdict::Pass);
    Readiness { ready, checks }
}

/// Connectivity first; the schema is only inspected on a reachable database.
fn check_platform(database: &DatabaseConfig) -> [Check; 2] {
    let runtime = match runtime() {
        Ok(runtime) => runtime,
        Err(error) => {
            return [
                Check::fail(PLATFORM_DATABASE, format!("async runtime unavailable: {error}")),
                Check::skipped(PLATFORM_SCHEMA, "platform database unreachable"),
            ];
        }
    };

    runtime.block_on(async {
        let pool = match connect_with_settings(
            &database.url,
            database.max_connections,
            database.timeout_secs,
        )
        .await
        {
            Ok(pool) => pool,
            Err(error) => {
                return [
                    Check::fail(PLATFORM_DATABASE, format!("connect `{}`: {error}", database.url)),
                    Check::skipped(PLATFORM_SCHEMA, "platform database unreachable"),
                ];
            }
        };

        let checks = match ping(&pool).await {
            Err(error) => [
                Check::fail(PLATFORM_DATABASE, format!("query failed: {error}")),
                Check::skipped(PLATFORM_SCHEMA, "platform database unreachable"),
            ],
            Ok(()) => {
                let reachable =
                    Check::pass(PLATFORM_DATABASE, format!("`{}` answers", database.url));
                let schema = match migrations::pending_platform(&pool).await {
                    Ok(0) => Check::pass(PLATFORM_SCHEMA, "all platform migrations applied"),
                    Ok(pending) => Check::fail(
                        PLATFORM_SCHEMA,
                        format!("{pending} platform migration(s) pending; run `tenantry migrate`"),
                    ),
                    Err(error) => {
                        Check::fail(PLATFORM_SCHEMA, format!("cannot read schema: {error}"))
                    }
                };
                [reachable, schema]
            }
        };
        pool.close().await;
        checks
    })
}

/// Tenant stores are created on first use, so the directory must accept new files.
fn check_tenant_data_dir(dir: &Path) -> Check {
    let marker = dir.join(".tenantry-doctor");
    let writable = fs::create_dir_all(dir)
        .and_then(|()| fs::write(&marker, b"ok"))
        .and_then(|()| fs::remove_file(&marker));

    match writable {
        Ok(()) => Check::pass(TENANT_DATA_DIR, format!("`{}` is writable", dir.display())),
        Err(error) => {
            Check::fail(TENANT_DATA_DIR, format!("`{}` is not writable: {error}", dir.display()))
        }
    }
}

fn render(readiness: &Readiness) -> String {
    let headline = if readiness.ready {
        "tenantry is ready"
    } else {
        "tenantry is not ready"
    };

    std::iter::once(headline.to_string())
        .chain(readiness.checks.iter().map(|check| {
            let marker = match check.verdict {
                Verdict::Pass => "ok",
                Verdict::Fail => "FAIL",
                Verdict::Skipped => "--",
            };
            format!("  [{marker:>4}] {:<18} {}", check.name, check.details)
        }))
        .collect::<Vec<_>>()
        .join("\n")
}

#[cfg(test)]
mod tests {
    use super::{check_tenant_data_dir, render, Check, Readiness, Verdict};

    #[test]
    fn tenant_data_dir_is_created_when_missing() {
        let root = tempfile::tempdir().expect("tempdir");
        let dir = root.path().join("nested").join("stores");

        let check = check_tenant_data_dir(&dir);

        assert_eq!(check.verdict, Verdict::Pass);
        assert!(dir.is_dir());
        assert!(!dir.join(".tenantry-doctor").exists());
    }

    #[test]
    fn rendered_report_leads_with_the_verdict() {
        let readiness = Readiness {
            ready: false,
            checks: vec![
                Check::pass("config", "configuration loaded and validated"),
                Check::fail("platform_schema", "1 platform migration(s) pending"),
            ],
        };

        let text = render(&readiness);

        let mut lines = text.lines();
        assert_eq!(lines.next(), Some("tenantry is not ready"));
        assert!(lines.next().is_some_and(|line| line.contains("[  ok] config")));
        assert!(lines.next().is_some_and(|line| line.contains("[FAIL] platform_schema")));
    }
}
