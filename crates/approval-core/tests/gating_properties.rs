use std::collections::BTreeSet;

use approval_core::{
    evaluate_all, project_onto_merge_request, ApprovalTally, EngineConfig, EvaluationContext,
    MergeRequestContext, MergeRequestId, PolicyConfigurationId, ProjectContext, ProjectId,
    ProjectedMergeRequestRule, ProjectionChange, ProtectedBranch, ReportType, RuleDefinition,
    RuleId, RuleKind, ScannerId, Severity, StaticDirectory, UserId, VulnerabilityState,
    WrappedRule,
};

const PROJECT: ProjectId = ProjectId(1);
const AUTHOR: UserId = UserId(500);

struct World {
    mr: MergeRequestContext,
    tally: ApprovalTally,
    directory: StaticDirectory,
    config: EngineConfig,
}

impl World {
    fn targeting(branch: &str, project: ProjectContext) -> Self {
        Self {
            mr: MergeRequestContext::new(MergeRequestId(42), project, branch, AUTHOR),
            tally: ApprovalTally::new(MergeRequestId(42)),
            directory: StaticDirectory::new(),
            config: EngineConfig::default(),
        }
    }

    fn ctx(&self) -> EvaluationContext<'_> {
        EvaluationContext {
            merge_request: &self.mr,
            tally: &self.tally,
            directory: &self.directory,
            config: &self.config,
        }
    }
}

fn code_owner_project() -> ProjectContext {
    ProjectContext::new(PROJECT)
        .with_code_owner_approval()
        .with_protected_branch(ProtectedBranch::new("main").requiring_code_owner_approval())
}

// ---- Scenario A ----

#[test]
fn code_owner_rule_with_zero_required_needs_one_approval() {
    let world = World::targeting("main", code_owner_project());
    let rule = RuleDefinition::new(PROJECT, "*.rb")
        .with_kind(RuleKind::CodeOwner)
        .with_approvals_required(0)
        .with_users([UserId(1), UserId(2)]);

    let wrapped = WrappedRule::new(world.ctx(), &rule).unwrap();
    assert_eq!(wrapped.approvals_required(), 1);
    assert_eq!(wrapped.approvals_left(), 1);
    assert!(!wrapped.approved());
}

#[test]
fn code_owner_minimum_holds_for_any_configured_count() {
    let world = World::targeting("main", code_owner_project());
    for configured in [0, 1, 3] {
        let rule = RuleDefinition::new(PROJECT, "docs/")
            .with_kind(RuleKind::CodeOwner)
            .with_approvals_required(configured)
            .with_users([UserId(1)]);
        let required = WrappedRule::new(world.ctx(), &rule).unwrap().approvals_required();
        assert!(required >= 1, "configured={configured} required={required}");
        assert_eq!(required, (configured as u32).max(1));
    }
}

// ---- Scenario B ----

#[test]
fn unrestricted_rule_applies_to_every_branch() {
    let rule = RuleDefinition::new(PROJECT, "QA");
    for branch in ["feature/x", "main", "release/1.0", ""] {
        assert!(rule.applies_to_branch(branch, &[]), "branch={branch:?}");
    }
}

#[test]
fn empty_scanners_match_regardless_of_scanner() {
    let rule = RuleDefinition::new(PROJECT, "QA");
    let scoped = rule.clone().with_scanners([ScannerId::Sast]);
    assert!(rule.scanners.is_empty());
    assert_eq!(
        rule.applies_to_branch("feature/x", &[]),
        scoped.applies_to_branch("feature/x", &[])
    );
}

// ---- Scenario C ----

#[test]
fn off_branch_rule_degrades_to_newly_detected() {
    let world = World::targeting("feature/x", ProjectContext::new(PROJECT));
    let rule = RuleDefinition::report_approver(PROJECT, "Vulnerability-Check", ReportType::Vulnerability)
        .with_protected_branches(["main"])
        .with_severity_levels([Severity::High])
        .with_vulnerability_states([VulnerabilityState::Detected, VulnerabilityState::NewlyDetected]);

    let wrapped = WrappedRule::new(world.ctx(), &rule).unwrap();
    assert_eq!(
        wrapped.effective_vulnerability_states(),
        BTreeSet::from([VulnerabilityState::NewlyDetected])
    );
}

#[test]
fn off_branch_rule_without_newly_detected_counts_nothing() {
    let world = World::targeting("feature/x", ProjectContext::new(PROJECT));
    let rule = RuleDefinition::new(PROJECT, "r")
        .with_protected_branches(["main"])
        .with_vulnerability_states([VulnerabilityState::Detected]);
    let wrapped = WrappedRule::new(world.ctx(), &rule).unwrap();
    assert!(wrapped.effective_vulnerability_states().is_empty());
}

// ---- Scenario D (pure half) ----

#[test]
fn projecting_scan_finding_rule_twice_yields_one_record() {
    let world = World::targeting("main", ProjectContext::new(PROJECT));
    let def = RuleDefinition::report_approver(PROJECT, "Scan finding 1", ReportType::ScanFinding)
        .with_id(RuleId(9))
        .with_protected_branches(["main"])
        .with_policy(PolicyConfigurationId(1), 0)
        .with_approvals_required(2);

    let first = project_onto_merge_request(&def, &world.mr, None).unwrap();
    let second = project_onto_merge_request(&def, &world.mr, Some(&first.rule)).unwrap();

    assert_eq!(first.key, second.key);
    assert_eq!(first.change, ProjectionChange::Created);
    assert_eq!(second.change, ProjectionChange::Unchanged);
    assert_eq!(first.rule, second.rule);
    assert_eq!(first.key.storage_key(), "mr:42:source:9");
}

// ---- Uniqueness ----

#[test]
fn second_any_approver_rule_is_rejected() {
    let first = RuleDefinition::new(PROJECT, "All Members")
        .with_kind(RuleKind::AnyApprover)
        .with_id(RuleId(1));
    let second = RuleDefinition::new(PROJECT, "Everyone")
        .with_kind(RuleKind::AnyApprover)
        .with_id(RuleId(2));

    assert!(first.validate(&[]).is_ok());
    let errors = second.validate(&[first]).unwrap_err();
    assert!(errors.has("rule_type"));
}

// ---- Whole merge request ----

#[test]
fn evaluating_materialised_rules_uses_their_state() {
    let mut world = World::targeting("main", ProjectContext::new(PROJECT));
    world.tally = ApprovalTally::new(MergeRequestId(42)).approve(UserId(1));

    let def = RuleDefinition::report_approver(PROJECT, "Vulnerability-Check", ReportType::Vulnerability)
        .with_approvals_required(2)
        .with_users([UserId(1), UserId(2)]);
    let projected: ProjectedMergeRequestRule = project_onto_merge_request(&def, &world.mr, None)
        .unwrap()
        .rule;

    let results = evaluate_all(world.ctx(), &[projected]).unwrap();
    assert_eq!(results.len(), 1);
    assert_eq!(results[0].approvals_left, 1);
    assert_eq!(results[0].approved_approvers, BTreeSet::from([UserId(1)]));
    assert_eq!(results[0].unactioned_approvers, BTreeSet::from([UserId(2)]));
    assert!(!results[0].approved);
}

#[test]
fn evaluation_is_repeatable() {
    let world = World::targeting("main", code_owner_project());
    let rules = vec![
        RuleDefinition::new(PROJECT, "QA").with_approvals_required(1).with_users([UserId(3)]),
        RuleDefinition::new(PROJECT, "*.rs").with_kind(RuleKind::CodeOwner).with_users([UserId(4)]),
    ];
    let first = evaluate_all(world.ctx(), &rules).unwrap();
    let second = evaluate_all(world.ctx(), &rules).unwrap();
    assert_eq!(first, second);
}

#[test]
fn missing_project_fails_fast() {
    let mut world = World::targeting("main", ProjectContext::new(PROJECT));
    world.mr.project = None;
    let rule = RuleDefinition::new(PROJECT, "QA");
    assert!(WrappedRule::new(world.ctx(), &rule).is_err());
}
