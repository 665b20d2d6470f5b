//! Approval Core
//!
//! Domain model for merge request approval rules: the scanner catalog, rule
//! definitions and validation, branch and protected-environment matching,
//! wrapped-rule evaluation, report findings and merge-request projection.
//!
//! ## Layer 1 - Domain
//!
//! Everything here is pure and synchronous. Persistence lives in
//! `approval-state`; the write path lives in `approval-sync`.

pub mod audit;
pub mod catalog;
pub mod config;
pub mod directory;
pub mod environment;
pub mod error;
pub mod findings;
pub mod ids;
pub mod matcher;
pub mod merge_request;
pub mod obs;
pub mod projection;
pub mod reference;
pub mod rule;
pub mod telemetry;
pub mod wrapped;

pub use audit::{creation_events, diff_approvers, ApproverKind, AuditEvent, AuditQueue};
pub use catalog::{
    default_severities, default_vulnerability_states, is_supported_scanner, supported_scanners,
    ReportType, ScannerId, Severity, UnknownVocabulary, VulnerabilityState, DEFAULT_SEVERITIES,
    UNSUPPORTED_SCANNER,
};
pub use config::{EngineConfig, DEFAULT_MAX_ENVIRONMENT_APPROVALS};
pub use directory::{AccessLevel, MembershipDirectory, StaticDirectory};
pub use environment::{
    for_environments, revoke_group, revoke_user, sorted_by_name, with_environment_id,
    DeployAccessLevel, Environment, EnvironmentTier, ProtectedEnvironment, ProtectionScope,
};
pub use error::{
    ApprovalError, ContextError, EnvironmentError, FormatError, ProjectionError, Result,
    ValidationError, ValidationErrors,
};
pub use findings::{
    evaluate_coverage, evaluate_report_rule, evaluate_scan_findings, Baseline, Finding,
    FindingFilter, FindingsReport, PipelineCoverage, PipelineReports, PipelineScan, ReportAction,
    ReportVerdict, Violation, ViolationKind,
};
pub use ids::{
    EnvironmentId, GroupId, MergeRequestId, PolicyConfigurationId, ProjectId, ProjectedRuleId,
    ProtectedEnvironmentId, RuleId, UserId,
};
pub use matcher::{branch_scope_digest, BranchPattern, ProtectedBranch};
pub use merge_request::{
    ApprovalTally, Comment, MergeRequestContext, MergeRequestState, ProjectContext,
};
pub use projection::{
    project_onto_merge_request, ApprovalAttributes, CodeOwnerEntry, ProjectedMergeRequestRule,
    Projection, ProjectionChange, ProjectionKey, DEFAULT_CODE_OWNER_SECTION,
};
pub use reference::{ReferenceFormat, REFERENCE_PREFIX};
pub use rule::{RuleDefinition, RuleKind, RuleParams};
pub use wrapped::{
    evaluate_all, ApprovalRuleView, EvaluationContext, WrappedRule, WrappedRuleResult,
    MIN_CODE_OWNER_APPROVALS,
};

/// Crate version, reported by the CLI.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
