//! Approvals - approval rule engine CLI
//!
//! The `approvals` command evaluates merge request approval rules from JSON
//! scenario files.
//!
//! ## Commands
//!
//! - `validate`: Build and validate raw rule definitions
//! - `evaluate`: Compute approval state for every rule of a merge request
//! - `sync`: Project rules onto a merge request, sync reports and finalise
//! - `env-access`: Resolve protected environments and deploy access

mod scenario;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{info, Level};

use approval_core::obs;
use approval_core::{
    evaluate_all, for_environments, sorted_by_name, with_environment_id, AuditQueue, EngineConfig,
    EvaluationContext, MembershipDirectory, MergeRequestId, ProjectedMergeRequestRule,
    ProjectionChange, ProtectedEnvironment, ProtectionScope, ReferenceFormat, RuleDefinition,
    UserId, WrappedRuleResult,
};
use approval_state::{MemoryRuleStore, MergeRequestRuleStore, SurrealRuleStore};
use approval_sync::{
    AuditStep, CacheInvalidation, FinalizedRule, PostProcessingPipeline, ReportSyncOutcome,
    SyncReport, Synchronizer,
};

use crate::scenario::{EnvironmentScenario, MergeRequestScenario, RulesFile};

#[derive(Parser)]
#[command(name = "approvals")]
#[command(author = "Stevedores Org")]
#[command(version = approval_core::VERSION)]
#[command(about = "Approval rule evaluation and merge request gating", long_about = None)]
struct Cli {
    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Emit JSON-formatted log lines
    #[arg(long, global = true)]
    json: bool,

    /// Engine configuration file (TOML). `APPROVAL_*` variables override it.
    #[arg(short, long, global = true, env = "APPROVAL_CONFIG")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Build and validate rule definitions, reporting every field error
    Validate {
        /// Rules file (JSON, `{"rules": [...]}`)
        rules: PathBuf,
    },

    /// Evaluate every rule of one merge request
    Evaluate {
        /// Merge request scenario (JSON)
        scenario: PathBuf,
    },

    /// Project rules onto a merge request and run report sync
    Sync {
        /// Merge request scenario (JSON)
        scenario: PathBuf,

        /// Rule store backend
        #[arg(long, value_enum, default_value_t = StoreKind::Memory)]
        store: StoreKind,

        /// Number of sync passes; passes after the first must change nothing
        #[arg(short, long, default_value = "2")]
        passes: u32,
    },

    /// Resolve protected environments and check a user's deploy access
    EnvAccess {
        /// Environment scenario (JSON)
        scenario: PathBuf,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum StoreKind {
    /// In-process store, discarded on exit
    Memory,
    /// SurrealDB from `APPROVAL_SURREALDB_URL` / `SURREALDB_URL`, or local
    /// persistence under `.approvals/db`
    Surreal,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let level = if cli.verbose {
        Level::DEBUG
    } else {
        Level::INFO
    };
    approval_core::telemetry::init_tracing(cli.json, level);

    let config = load_config(cli.config.as_deref())?;

    match cli.command {
        Commands::Validate { rules } => {
            let report = cmd_validate(&rules)?;
            print_json(&report)?;
            if report.invalid > 0 {
                bail!("{} of {} rules are invalid", report.invalid, report.rules.len());
            }
            Ok(())
        }
        Commands::Evaluate { scenario } => print_json(&cmd_evaluate(&scenario, &config)?),
        Commands::Sync {
            scenario,
            store,
            passes,
        } => print_json(&cmd_sync(&scenario, &config, store, passes).await?),
        Commands::EnvAccess { scenario } => print_json(&cmd_env_access(&scenario, &config)?),
    }
}

fn load_config(path: Option<&Path>) -> Result<EngineConfig> {
    let base = match path {
        Some(path) => {
            let content = std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read config file: {:?}", path))?;
            toml::from_str(&content).with_context(|| format!("Invalid TOML in {:?}", path))?
        }
        None => EngineConfig::default(),
    };
    Ok(base.overlay(|key| std::env::var(key).ok()))
}

fn read_json_file<T: serde::de::DeserializeOwned>(path: &Path) -> Result<T> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read JSON file: {:?}", path))?;
    serde_json::from_str(&content).with_context(|| format!("Invalid JSON in {:?}", path))
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

// ---------------------------------------------------------------------------
// validate
// ---------------------------------------------------------------------------

#[derive(Debug, Serialize)]
struct ValidationReport {
    rules: Vec<RuleValidation>,
    invalid: usize,
}

#[derive(Debug, Serialize)]
struct RuleValidation {
    name: String,
    /// Present once the rule built.
    reference: Option<String>,
    errors: Vec<String>,
}

fn cmd_validate(path: &Path) -> Result<ValidationReport> {
    let file: RulesFile = read_json_file(path)?;

    let built: Vec<(String, std::result::Result<RuleDefinition, _>)> = file
        .rules
        .into_iter()
        .map(|params| {
            let name = params.name.clone().unwrap_or_default();
            (name, RuleDefinition::build(params))
        })
        .collect();
    let definitions: Vec<&RuleDefinition> = built.iter().filter_map(|(_, r)| r.as_ref().ok()).collect();

    let mut rules = Vec::with_capacity(built.len());
    for (name, result) in &built {
        let (reference, outcome) = match result {
            Ok(def) => {
                let siblings: Vec<RuleDefinition> = definitions
                    .iter()
                    .filter(|other| !std::ptr::eq(**other, def))
                    .map(|other| (*other).clone())
                    .collect();
                (Some(def.to_reference(ReferenceFormat::Name)), def.validate(&siblings))
            }
            Err(errors) => (None, Err(errors.clone())),
        };

        let errors = match outcome {
            Ok(()) => Vec::new(),
            Err(errors) => {
                obs::emit_validation_failed(name, &errors);
                errors.iter().map(ToString::to_string).collect()
            }
        };
        rules.push(RuleValidation {
            name: name.clone(),
            reference,
            errors,
        });
    }

    let invalid = rules.iter().filter(|r| !r.errors.is_empty()).count();
    Ok(ValidationReport { rules, invalid })
}

// ---------------------------------------------------------------------------
// evaluate
// ---------------------------------------------------------------------------

#[derive(Debug, Serialize)]
struct EvaluationReport {
    merge_request: MergeRequestId,
    /// Every rule is approved.
    mergeable: bool,
    rules: Vec<WrappedRuleResult>,
}

fn cmd_evaluate(path: &Path, config: &EngineConfig) -> Result<EvaluationReport> {
    let scenario: MergeRequestScenario = read_json_file(path)?;
    let tally = scenario.tally();
    let mr = &scenario.merge_request;

    let ctx = EvaluationContext {
        merge_request: mr,
        tally: &tally,
        directory: &scenario.directory,
        config,
    };

    let mut rules = evaluate_all(ctx, &scenario.rules)
        .with_context(|| format!("Cannot evaluate merge request {}", mr.id))?;
    let code_owner_rules: Vec<ProjectedMergeRequestRule> = scenario
        .code_owners
        .iter()
        .map(|entry| ProjectedMergeRequestRule::code_owner(mr.id, entry))
        .collect();
    rules.extend(evaluate_all(ctx, &code_owner_rules)?);

    Ok(EvaluationReport {
        merge_request: mr.id,
        mergeable: rules.iter().all(|r| r.approved),
        rules,
    })
}

// ---------------------------------------------------------------------------
// sync
// ---------------------------------------------------------------------------

#[derive(Debug, Serialize)]
struct SyncSummary {
    passes: Vec<PassSummary>,
    rules: Vec<ProjectedMergeRequestRule>,
    audit: Vec<String>,
}

#[derive(Debug, Default, Serialize)]
struct PassSummary {
    created: usize,
    updated: usize,
    unchanged: usize,
    reports: Vec<ReportSyncOutcome>,
    finalized: Vec<FinalizedRule>,
}

impl From<SyncReport> for PassSummary {
    fn from(report: SyncReport) -> Self {
        let count = |change: ProjectionChange| report.projected.iter().filter(|o| o.change == change).count();
        Self {
            created: count(ProjectionChange::Created),
            updated: count(ProjectionChange::Updated),
            unchanged: count(ProjectionChange::Unchanged),
            reports: report.reports,
            finalized: report.finalized,
        }
    }
}

async fn open_store(kind: StoreKind) -> Result<Arc<dyn MergeRequestRuleStore>> {
    Ok(match kind {
        StoreKind::Memory => Arc::new(MemoryRuleStore::new()),
        StoreKind::Surreal => Arc::new(
            SurrealRuleStore::from_env()
                .await
                .context("Failed to connect to approval rule store")?,
        ),
    })
}

async fn cmd_sync(path: &Path, config: &EngineConfig, kind: StoreKind, passes: u32) -> Result<SyncSummary> {
    let scenario: MergeRequestScenario = read_json_file(path)?;
    let tally = scenario.tally();
    let mr = &scenario.merge_request;

    let store = open_store(kind).await?;
    let sync = Synchronizer::new(Arc::clone(&store), config.clone());
    let directory: Arc<dyn MembershipDirectory> = Arc::new(scenario.directory.clone());

    let audit = Arc::new(AuditStep::new(AuditQueue::active(), Arc::clone(&directory)));
    let pipeline = PostProcessingPipeline::new()
        .with_step(audit.clone())
        .with_step(Arc::new(CacheInvalidation::new(sync.branch_cache())));

    let mut summaries = Vec::new();
    for pass in 1..=passes.max(1) {
        let mut report = sync
            .sync_merge_request(&scenario.rules, mr, scenario.reports.as_ref())
            .await
            .with_context(|| format!("Sync pass {pass} failed for merge request {}", mr.id))?;
        report
            .projected
            .extend(sync.sync_code_owner_rules(mr.id, &scenario.code_owners).await?);
        if mr.is_merged() {
            report.finalized = sync.finalize_merge(mr, &tally, directory.as_ref()).await?;
        }

        pipeline.run(&report);
        let summary = PassSummary::from(report);
        info!(
            pass,
            created = summary.created,
            updated = summary.updated,
            unchanged = summary.unchanged,
            "sync pass complete"
        );
        summaries.push(summary);
    }

    let rules = store
        .list_for_merge_request(mr.id)
        .await
        .context("Failed to list merge request rules")?;
    Ok(SyncSummary {
        passes: summaries,
        rules,
        audit: audit.messages(),
    })
}

// ---------------------------------------------------------------------------
// env-access
// ---------------------------------------------------------------------------

#[derive(Debug, Serialize)]
struct EnvironmentReport {
    user: UserId,
    protected_environments: Vec<EnvironmentAccess>,
}

#[derive(Debug, Serialize)]
struct EnvironmentAccess {
    name: String,
    scope: ProtectionScope,
    required_approval_count: i64,
    accessible: bool,
    errors: Vec<String>,
}

fn cmd_env_access(path: &Path, config: &EngineConfig) -> Result<EnvironmentReport> {
    let scenario: EnvironmentScenario = read_json_file(path)?;

    let matched: Vec<ProtectedEnvironment> = for_environments(
        &scenario.protected_environments,
        &scenario.environments,
        &scenario.directory,
    )?
    .into_iter()
    .cloned()
    .collect();
    let mut matched = with_environment_id(matched, &scenario.environments);
    sorted_by_name(&mut matched);

    let protected_environments = matched
        .iter()
        .map(|pe| EnvironmentAccess {
            name: pe.name.clone(),
            scope: pe.scope,
            required_approval_count: pe.required_approval_count,
            accessible: pe.accessible_to(scenario.user, &scenario.directory),
            errors: pe
                .validate(config)
                .err()
                .map(|errors| errors.iter().map(ToString::to_string).collect())
                .unwrap_or_default(),
        })
        .collect();

    Ok(EnvironmentReport {
        user: scenario.user,
        protected_environments,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::io::Write;

    fn write_json(dir: &tempfile::TempDir, name: &str, value: serde_json::Value) -> PathBuf {
        let path = dir.path().join(name);
        let mut file = std::fs::File::create(&path).unwrap();
        file.write_all(value.to_string().as_bytes()).unwrap();
        path
    }

    fn merge_request_scenario() -> serde_json::Value {
        json!({
            "merge_request": {
                "id": 42,
                "project": {"id": 1, "default_branch": "main"},
                "target_branch": "main",
                "author": 99
            },
            "rules": [{
                "id": 9,
                "project_id": 1,
                "name": "Scan finding",
                "rule_type": "report_approver",
                "report_type": "scan_finding",
                "approvals_required": 2,
                "protected_branches": ["main"],
                "policy_configuration_id": 1,
                "policy_idx": 0,
                "users": [5, 6]
            }],
            "code_owners": [{"pattern": "*.rb", "users": [7]}],
            "tally": {"merge_request_id": 42, "approved_by": [5]},
            "directory": {"users": [{"id": 6, "name": "Batman"}]}
        })
    }

    #[test]
    fn test_validate_reports_every_field_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_json(
            &dir,
            "rules.json",
            json!({"rules": [
                {"project_id": 1, "name": "Security"},
                {"project_id": 1, "name": "", "approvals_required": -1, "scanners": ["cluster_image_scanning"]}
            ]}),
        );

        let report = cmd_validate(&path).unwrap();
        assert_eq!(report.invalid, 1);
        assert_eq!(report.rules[0].reference.as_deref(), Some("approval_rule:\"Security\""));
        assert!(report.rules[0].errors.is_empty());

        let errors = &report.rules[1].errors;
        assert!(errors.iter().any(|e| e.starts_with("name ")), "{errors:?}");
        assert!(errors.iter().any(|e| e.starts_with("approvals_required ")), "{errors:?}");
        assert!(errors.iter().any(|e| e.starts_with("scanners ")), "{errors:?}");
    }

    #[test]
    fn test_evaluate_scenario() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_json(&dir, "mr.json", merge_request_scenario());

        let report = cmd_evaluate(&path, &EngineConfig::default()).unwrap();
        assert_eq!(report.merge_request, MergeRequestId(42));
        assert_eq!(report.rules.len(), 2);

        let scan = &report.rules[0];
        assert_eq!(scan.effective_approvals_required, 2);
        assert_eq!(scan.approvals_left, 1);
        assert!(!scan.approved);
        assert!(!report.mergeable);
    }

    #[test]
    fn test_evaluate_rejects_merge_request_without_project() {
        let dir = tempfile::tempdir().unwrap();
        let mut scenario = merge_request_scenario();
        scenario["merge_request"]["project"] = serde_json::Value::Null;
        let path = write_json(&dir, "mr.json", scenario);

        let err = cmd_evaluate(&path, &EngineConfig::default()).unwrap_err();
        assert!(format!("{err:#}").contains("has no project"), "{err:#}");
    }

    #[tokio::test]
    async fn test_sync_second_pass_changes_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_json(&dir, "mr.json", merge_request_scenario());

        let summary = cmd_sync(&path, &EngineConfig::default(), StoreKind::Memory, 2)
            .await
            .unwrap();

        assert_eq!(summary.passes.len(), 2);
        assert_eq!(summary.passes[0].created, 2);
        assert_eq!(summary.passes[1].created, 0);
        assert_eq!(summary.passes[1].updated, 0);
        assert_eq!(summary.passes[1].unchanged, 2);
        assert_eq!(summary.rules.len(), 2);
        assert_eq!(
            summary.audit,
            vec!["Added approval rule with number of required approvals of 2".to_string()]
        );
    }

    #[tokio::test]
    async fn test_sync_with_clean_reports_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let mut scenario = merge_request_scenario();
        scenario["reports"] = json!({
            "findings": {
                "head": {"scanners_run": ["sast"], "findings": []},
                "baseline": {"captured_at": "2024-03-01T12:00:00Z", "scanners_run": ["sast"]}
            }
        });
        let path = write_json(&dir, "mr.json", scenario);

        let summary = cmd_sync(&path, &EngineConfig::default(), StoreKind::Memory, 2)
            .await
            .unwrap();

        assert_eq!(summary.passes[0].created, 2);
        assert!(summary.passes[0].reports[0].lowered);
        assert_eq!(summary.passes[1].updated, 0);
        assert_eq!(summary.passes[1].unchanged, 2);
        assert_eq!(summary.passes[1].reports.len(), 1);
        assert!(!summary.passes[1].reports[0].lowered);

        let scan = summary.rules.iter().find(|r| r.name() == "Scan finding").unwrap();
        assert_eq!(scan.approvals_required(), 0);
    }

    #[test]
    fn test_env_access_scenario() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_json(
            &dir,
            "env.json",
            json!({
                "user": 5,
                "environments": [{"id": 1, "project_id": 1, "name": "production", "tier": "production"}],
                "protected_environments": [
                    {"id": 1, "name": "production", "scope": {"project": 1},
                     "deploy_access_levels": [{"user": 5}], "required_approval_count": 2},
                    {"id": 2, "name": "staging", "scope": {"project": 1},
                     "deploy_access_levels": [{"user": 5}]}
                ]
            }),
        );

        let report = cmd_env_access(&path, &EngineConfig::default()).unwrap();
        assert_eq!(report.protected_environments.len(), 1);
        let production = &report.protected_environments[0];
        assert_eq!(production.name, "production");
        assert!(production.accessible);
        assert!(production.errors.is_empty());
    }

    #[test]
    fn test_config_file_is_loaded() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("approvals.toml");
        std::fs::write(&path, "max_environment_approvals = 3\nsync_from_findings = false\n").unwrap();

        let config = load_config(Some(&path)).unwrap();
        assert_eq!(config.max_environment_approvals, 3);
        assert!(!config.sync_from_findings);
    }

    #[test]
    fn test_missing_config_file_is_an_error() {
        let err = load_config(Some(Path::new("/nonexistent/approvals.toml"))).unwrap_err();
        assert!(format!("{err:#}").contains("Failed to read config file"));
    }
}
