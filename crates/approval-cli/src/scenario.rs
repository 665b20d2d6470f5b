//! JSON input files read by the CLI.

use serde::Deserialize;

use approval_core::{
    ApprovalTally, CodeOwnerEntry, Environment, MergeRequestContext, PipelineReports,
    ProtectedEnvironment, RuleDefinition, RuleParams, StaticDirectory, UserId,
};

/// Raw rule input for `validate`.
#[derive(Debug, Deserialize)]
pub struct RulesFile {
    pub rules: Vec<RuleParams>,
}

/// One merge request with its rules, approvals and directory.
#[derive(Debug, Deserialize)]
pub struct MergeRequestScenario {
    pub merge_request: MergeRequestContext,
    #[serde(default)]
    pub rules: Vec<RuleDefinition>,
    #[serde(default)]
    pub code_owners: Vec<CodeOwnerEntry>,
    /// Defaults to no approvals on `merge_request`.
    #[serde(default)]
    pub tally: Option<ApprovalTally>,
    #[serde(default)]
    pub directory: StaticDirectory,
    #[serde(default)]
    pub reports: Option<PipelineReports>,
}

impl MergeRequestScenario {
    pub fn tally(&self) -> ApprovalTally {
        self.tally
            .clone()
            .unwrap_or_else(|| ApprovalTally::new(self.merge_request.id))
    }
}

/// Protected environments and the user asking to deploy.
#[derive(Debug, Deserialize)]
pub struct EnvironmentScenario {
    pub user: UserId,
    pub environments: Vec<Environment>,
    #[serde(default)]
    pub protected_environments: Vec<ProtectedEnvironment>,
    #[serde(default)]
    pub directory: StaticDirectory,
}
