//! Report-driven rule evaluation.
//!
//! Checks pipeline security findings and code coverage against report
//! approver rules and decides whether a rule's approvals can be waived.
//! A rule whose check passes gets `approvals_required` lowered to zero by the
//! sync layer; a violated rule keeps its configured count.

use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::catalog::{ReportType, ScannerId, Severity, VulnerabilityState};
use crate::config::EngineConfig;
use crate::projection::ApprovalAttributes;

// ---------------------------------------------------------------------------
// Inputs
// ---------------------------------------------------------------------------

/// A security finding reported by a pipeline.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Finding {
    pub uuid: String,
    pub scanner: ScannerId,
    pub severity: Severity,
    /// Triage state of the stored vulnerability.
    pub state: VulnerabilityState,
    pub detected_at: DateTime<Utc>,
}

impl Finding {
    /// First seen after the target branch baseline was captured.
    pub fn is_newly_detected(&self, baseline: &Baseline) -> bool {
        self.detected_at > baseline.captured_at
    }
}

/// Security scans of the merge request's head pipeline.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PipelineScan {
    #[serde(default)]
    pub scanners_run: BTreeSet<ScannerId>,
    #[serde(default)]
    pub findings: Vec<Finding>,
}

/// Security scans of the target branch pipeline.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Baseline {
    pub captured_at: DateTime<Utc>,
    #[serde(default)]
    pub scanners_run: BTreeSet<ScannerId>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FindingsReport {
    pub head: PipelineScan,
    /// Missing when the target branch has no pipeline.
    #[serde(default)]
    pub baseline: Option<Baseline>,
}

/// Coverage reported by the builds of one pipeline.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PipelineCoverage {
    #[serde(default)]
    pub complete: bool,
    /// One entry per build; `None` for builds without coverage.
    #[serde(default)]
    pub builds: Vec<Option<f64>>,
}

impl PipelineCoverage {
    /// Mean over builds that reported coverage.
    pub fn coverage(&self) -> Option<f64> {
        let values: Vec<f64> = self.builds.iter().flatten().copied().collect();
        if values.is_empty() {
            None
        } else {
            Some(values.iter().sum::<f64>() / values.len() as f64)
        }
    }
}

/// Everything a head pipeline reported, as handed over by the caller.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PipelineReports {
    #[serde(default)]
    pub findings: Option<FindingsReport>,
    #[serde(default)]
    pub head_coverage: Option<PipelineCoverage>,
    #[serde(default)]
    pub base_coverage: Option<PipelineCoverage>,
}

/// The finding filters of one rule, with branch-effective states.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FindingFilter {
    pub scanners: BTreeSet<ScannerId>,
    pub severity_levels: BTreeSet<Severity>,
    pub states: BTreeSet<VulnerabilityState>,
    pub vulnerabilities_allowed: u32,
}

impl FindingFilter {
    pub fn new(attributes: &ApprovalAttributes, effective_states: BTreeSet<VulnerabilityState>) -> Self {
        Self {
            scanners: attributes.scanners().clone(),
            severity_levels: attributes.severity_levels().clone(),
            states: effective_states,
            vulnerabilities_allowed: attributes.vulnerabilities_allowed(),
        }
    }

    fn matches_scanner(&self, scanner: ScannerId) -> bool {
        self.scanners.is_empty() || self.scanners.contains(&scanner)
    }

    fn matches_severity(&self, severity: Severity) -> bool {
        self.severity_levels.is_empty() || self.severity_levels.contains(&severity)
    }

    fn counts(&self, finding: &Finding, baseline: &Baseline) -> bool {
        if !self.matches_scanner(finding.scanner) || !self.matches_severity(finding.severity) {
            return false;
        }
        if finding.is_newly_detected(baseline) {
            self.states.contains(&VulnerabilityState::NewlyDetected)
        } else {
            finding.state.is_preexisting() && self.states.contains(&finding.state)
        }
    }
}

// ---------------------------------------------------------------------------
// Verdict
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ViolationKind {
    MissingReports,
    MissingBaseline,
    MissingScanners,
    TooManyFindings,
    PipelineIncomplete,
    MissingCoverage,
    MissingBaseCoverage,
    CoverageDecreased,
}

/// A single failed report check.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Violation {
    pub kind: ViolationKind,
    /// Human-readable explanation.
    pub reason: String,
}

impl Violation {
    fn new(kind: ViolationKind, reason: impl Into<String>) -> Self {
        Self {
            kind,
            reason: reason.into(),
        }
    }
}

/// Outcome of checking one rule against pipeline reports.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReportVerdict {
    pub violations: Vec<Violation>,
}

impl ReportVerdict {
    fn pass() -> Self {
        Self::default()
    }

    fn fail(violation: Violation) -> Self {
        Self {
            violations: vec![violation],
        }
    }

    pub fn passed(&self) -> bool {
        self.violations.is_empty()
    }
}

// ---------------------------------------------------------------------------
// Checks
// ---------------------------------------------------------------------------

/// Check head findings against a scan-finding or vulnerability rule.
pub fn evaluate_scan_findings(filter: &FindingFilter, report: Option<&FindingsReport>) -> ReportVerdict {
    let Some(report) = report else {
        return ReportVerdict::fail(Violation::new(
            ViolationKind::MissingReports,
            "head pipeline has no security reports",
        ));
    };
    let Some(baseline) = &report.baseline else {
        return ReportVerdict::fail(Violation::new(
            ViolationKind::MissingBaseline,
            "target branch has no pipeline to compare against",
        ));
    };

    let required: BTreeSet<ScannerId> = if filter.scanners.is_empty() {
        baseline.scanners_run.clone()
    } else {
        filter.scanners.clone()
    };
    let missing: Vec<String> = required
        .iter()
        .filter(|s| baseline.scanners_run.contains(s) && !report.head.scanners_run.contains(s))
        .map(ToString::to_string)
        .collect();
    if !missing.is_empty() {
        return ReportVerdict::fail(Violation::new(
            ViolationKind::MissingScanners,
            format!("scanners removed from head pipeline: {}", missing.join(", ")),
        ));
    }

    let count = report
        .head
        .findings
        .iter()
        .filter(|f| filter.counts(f, baseline))
        .count();
    if count > filter.vulnerabilities_allowed as usize {
        return ReportVerdict::fail(Violation::new(
            ViolationKind::TooManyFindings,
            format!(
                "{count} matching findings > {} allowed",
                filter.vulnerabilities_allowed
            ),
        ));
    }
    ReportVerdict::pass()
}

/// Check head coverage against the target branch.
pub fn evaluate_coverage(head: Option<&PipelineCoverage>, base: Option<&PipelineCoverage>) -> ReportVerdict {
    let Some(head) = head.filter(|h| h.complete) else {
        return ReportVerdict::fail(Violation::new(
            ViolationKind::PipelineIncomplete,
            "head pipeline is not complete",
        ));
    };
    let Some(head_coverage) = head.coverage() else {
        return ReportVerdict::fail(Violation::new(
            ViolationKind::MissingCoverage,
            "head pipeline reports no coverage",
        ));
    };
    // No target pipeline to compare against.
    let Some(base) = base else {
        return ReportVerdict::pass();
    };
    let Some(base_coverage) = base.coverage() else {
        return ReportVerdict::fail(Violation::new(
            ViolationKind::MissingBaseCoverage,
            "target branch pipeline reports no coverage",
        ));
    };
    if head_coverage >= base_coverage {
        ReportVerdict::pass()
    } else {
        ReportVerdict::fail(Violation::new(
            ViolationKind::CoverageDecreased,
            format!("coverage {head_coverage:.2}% < target branch {base_coverage:.2}%"),
        ))
    }
}

/// What report sync should do with one merge-request rule.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum ReportAction {
    /// Checks passed; approvals are no longer required.
    LowerToZero,
    /// Checks failed; the configured count stands.
    Keep { violations: Vec<Violation> },
    /// Not driven by the reports being synced.
    NotApplicable,
}

impl From<ReportVerdict> for ReportAction {
    fn from(verdict: ReportVerdict) -> Self {
        if verdict.passed() {
            Self::LowerToZero
        } else {
            Self::Keep {
                violations: verdict.violations,
            }
        }
    }
}

/// Decide the report action for a rule of `report_type`.
///
/// License rules are owned by license compliance and never touched here.
/// Scan-finding rules are only synced from findings when the engine is
/// configured to.
pub fn evaluate_report_rule(
    report_type: Option<ReportType>,
    filter: &FindingFilter,
    reports: &PipelineReports,
    config: &EngineConfig,
) -> ReportAction {
    match report_type {
        None | Some(ReportType::LicenseScanning) => ReportAction::NotApplicable,
        Some(ReportType::ScanFinding) if !config.sync_from_findings => ReportAction::NotApplicable,
        Some(ReportType::ScanFinding) | Some(ReportType::Vulnerability) => {
            evaluate_scan_findings(filter, reports.findings.as_ref()).into()
        }
        Some(ReportType::CodeCoverage) => {
            evaluate_coverage(reports.head_coverage.as_ref(), reports.base_coverage.as_ref()).into()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};

    fn baseline_time() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap()
    }

    fn finding(i: usize, severity: Severity, state: VulnerabilityState, new: bool) -> Finding {
        let offset = if new { Duration::hours(1) } else { Duration::hours(-1) };
        Finding {
            uuid: format!("uuid-{i}"),
            scanner: ScannerId::DependencyScanning,
            severity,
            state,
            detected_at: baseline_time() + offset,
        }
    }

    fn report(findings: Vec<Finding>) -> FindingsReport {
        FindingsReport {
            head: PipelineScan {
                scanners_run: BTreeSet::from([ScannerId::DependencyScanning]),
                findings,
            },
            baseline: Some(Baseline {
                captured_at: baseline_time(),
                scanners_run: BTreeSet::from([ScannerId::DependencyScanning]),
            }),
        }
    }

    fn filter(scanners: &[ScannerId], allowed: u32, states: &[VulnerabilityState]) -> FindingFilter {
        FindingFilter {
            scanners: scanners.iter().copied().collect(),
            severity_levels: BTreeSet::from([Severity::High, Severity::Unknown]),
            states: states.iter().copied().collect(),
            vulnerabilities_allowed: allowed,
        }
    }

    fn five_existing() -> Vec<Finding> {
        (0..5)
            .map(|i| finding(i, Severity::High, VulnerabilityState::Detected, false))
            .collect()
    }

    const DS: ScannerId = ScannerId::DependencyScanning;
    const NEW: VulnerabilityState = VulnerabilityState::NewlyDetected;
    const DETECTED: VulnerabilityState = VulnerabilityState::Detected;

    // ---- scan findings ----

    #[test]
    fn missing_baseline_is_violated() {
        let mut r = report(vec![]);
        r.baseline = None;
        let verdict = evaluate_scan_findings(&filter(&[DS], 100, &[NEW]), Some(&r));
        assert_eq!(verdict.violations[0].kind, ViolationKind::MissingBaseline);
    }

    #[test]
    fn missing_reports_are_violated() {
        let verdict = evaluate_scan_findings(&filter(&[DS], 0, &[NEW]), None);
        assert!(!verdict.passed());
    }

    #[test]
    fn removed_scanner_is_violated() {
        let mut r = report(vec![]);
        r.head.scanners_run.clear();

        for scanners in [vec![DS], vec![]] {
            let verdict = evaluate_scan_findings(&filter(&scanners, 100, &[NEW]), Some(&r));
            assert_eq!(verdict.violations[0].kind, ViolationKind::MissingScanners);
        }

        let unrelated = evaluate_scan_findings(&filter(&[ScannerId::ContainerScanning], 1, &[NEW]), Some(&r));
        assert!(unrelated.passed());
    }

    #[test]
    fn preexisting_findings_count_when_state_configured() {
        let r = report(five_existing());
        assert!(!evaluate_scan_findings(&filter(&[DS], 1, &[DETECTED, NEW]), Some(&r)).passed());
        assert!(evaluate_scan_findings(&filter(&[DS], 100, &[DETECTED, NEW]), Some(&r)).passed());
        assert!(evaluate_scan_findings(&filter(&[DS], 0, &[NEW]), Some(&r)).passed());
    }

    #[test]
    fn new_findings_count_only_with_newly_detected() {
        let mut findings = five_existing();
        findings[4] = finding(4, Severity::High, DETECTED, true);
        let r = report(findings);

        let verdict = evaluate_scan_findings(&filter(&[DS], 0, &[NEW]), Some(&r));
        assert_eq!(verdict.violations[0].kind, ViolationKind::TooManyFindings);

        assert!(evaluate_scan_findings(&filter(&[DS], 1, &[NEW]), Some(&r)).passed());
        assert!(evaluate_scan_findings(&filter(&[DS], 0, &[VulnerabilityState::Resolved]), Some(&r)).passed());
    }

    #[test]
    fn severity_and_scanner_filters_apply() {
        let r = report(five_existing());
        let mut info_only = filter(&[DS], 0, &[DETECTED]);
        info_only.severity_levels = BTreeSet::from([Severity::Info]);
        assert!(evaluate_scan_findings(&info_only, Some(&r)).passed());

        let mut any_severity = filter(&[], 0, &[DETECTED]);
        any_severity.severity_levels.clear();
        assert!(!evaluate_scan_findings(&any_severity, Some(&r)).passed());

        assert!(evaluate_scan_findings(&filter(&[ScannerId::Sast], 0, &[DETECTED]), Some(&r)).passed());
    }

    // ---- coverage ----

    fn coverage(complete: bool, builds: &[Option<f64>]) -> PipelineCoverage {
        PipelineCoverage {
            complete,
            builds: builds.to_vec(),
        }
    }

    #[test]
    fn coverage_is_mean_of_reporting_builds() {
        let head = coverage(true, &[Some(60.0), Some(80.0), None, Some(40.0)]);
        assert_eq!(head.coverage(), Some(60.0));
        assert_eq!(coverage(true, &[None]).coverage(), None);
    }

    #[test]
    fn coverage_table() {
        let head = coverage(true, &[Some(60.0), Some(80.0), None, Some(40.0)]);
        let cases: Vec<(PipelineCoverage, Option<PipelineCoverage>, bool)> = vec![
            (head.clone(), Some(coverage(true, &[Some(90.0), Some(100.0)])), false),
            (head.clone(), Some(coverage(true, &[Some(60.0), Some(80.0), Some(30.0)])), true),
            (head.clone(), Some(coverage(true, &[Some(60.0), Some(80.0), Some(40.0)])), true),
            (coverage(true, &[None]), Some(coverage(true, &[Some(60.0)])), false),
            (coverage(false, &[Some(60.0)]), Some(coverage(true, &[Some(40.0), Some(30.0)])), false),
            (head.clone(), None, true),
            (head, Some(coverage(true, &[None])), false),
        ];
        for (i, (head, base, passes)) in cases.into_iter().enumerate() {
            assert_eq!(evaluate_coverage(Some(&head), base.as_ref()).passed(), passes, "case {i}");
        }
    }

    #[test]
    fn base_pipeline_without_coverage_keeps_approvals() {
        let head = coverage(true, &[Some(60.0)]);
        let verdict = evaluate_coverage(Some(&head), Some(&coverage(true, &[None])));
        assert_eq!(verdict.violations.len(), 1);
        assert_eq!(verdict.violations[0].kind, ViolationKind::MissingBaseCoverage);

        assert!(evaluate_coverage(Some(&head), None).passed());
    }

    // ---- actions ----

    #[test]
    fn report_actions_by_type() {
        let config = EngineConfig::default();
        let f = filter(&[DS], 100, &[NEW]);
        let reports = PipelineReports {
            findings: Some(report(vec![])),
            ..PipelineReports::default()
        };

        assert_eq!(
            evaluate_report_rule(Some(ReportType::LicenseScanning), &f, &reports, &config),
            ReportAction::NotApplicable
        );
        assert_eq!(
            evaluate_report_rule(Some(ReportType::ScanFinding), &f, &reports, &config),
            ReportAction::LowerToZero
        );
        assert!(matches!(
            evaluate_report_rule(Some(ReportType::CodeCoverage), &f, &reports, &config),
            ReportAction::Keep { .. }
        ));

        let manual = EngineConfig {
            sync_from_findings: false,
            ..EngineConfig::default()
        };
        assert_eq!(
            evaluate_report_rule(Some(ReportType::ScanFinding), &f, &reports, &manual),
            ReportAction::NotApplicable
        );
    }
}
