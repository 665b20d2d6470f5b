//! Scanner, severity and vulnerability-state vocabularies.
//!
//! Pure lookup tables shared with the security reporting subsystem. Every
//! security report file type is a [`ScannerId`], but
//! [`UNSUPPORTED_SCANNER`] cannot be referenced by approval rules.

use std::collections::BTreeSet;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// A value outside one of the fixed vocabularies.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown {vocabulary}: {value}")]
pub struct UnknownVocabulary {
    pub vocabulary: &'static str,
    pub value: String,
}

fn parse_vocabulary<T: Copy>(
    vocabulary: &'static str,
    all: &[T],
    name: fn(T) -> &'static str,
    value: &str,
) -> Result<T, UnknownVocabulary> {
    all.iter()
        .copied()
        .find(|candidate| name(*candidate) == value)
        .ok_or_else(|| UnknownVocabulary {
            vocabulary,
            value: value.to_string(),
        })
}

// ---------------------------------------------------------------------------
// Scanners
// ---------------------------------------------------------------------------

/// Security scanner identifiers, one per security report file type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScannerId {
    Sast,
    SecretDetection,
    DependencyScanning,
    ContainerScanning,
    Dast,
    CoverageFuzzing,
    ApiFuzzing,
    ClusterImageScanning,
}

/// The report file type that exists but is not accepted in approval rules.
pub const UNSUPPORTED_SCANNER: ScannerId = ScannerId::ClusterImageScanning;

impl ScannerId {
    /// Every scanner, supported or not.
    pub const ALL: [ScannerId; 8] = [
        ScannerId::Sast,
        ScannerId::SecretDetection,
        ScannerId::DependencyScanning,
        ScannerId::ContainerScanning,
        ScannerId::Dast,
        ScannerId::CoverageFuzzing,
        ScannerId::ApiFuzzing,
        ScannerId::ClusterImageScanning,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Sast => "sast",
            Self::SecretDetection => "secret_detection",
            Self::DependencyScanning => "dependency_scanning",
            Self::ContainerScanning => "container_scanning",
            Self::Dast => "dast",
            Self::CoverageFuzzing => "coverage_fuzzing",
            Self::ApiFuzzing => "api_fuzzing",
            Self::ClusterImageScanning => "cluster_image_scanning",
        }
    }

    /// Whether approval rules may reference this scanner.
    pub fn is_supported(self) -> bool {
        self != UNSUPPORTED_SCANNER
    }
}

impl FromStr for ScannerId {
    type Err = UnknownVocabulary;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        parse_vocabulary("scanner", &Self::ALL, Self::as_str, s)
    }
}

impl std::fmt::Display for ScannerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Scanners approval rules may reference.
pub fn supported_scanners() -> impl Iterator<Item = ScannerId> {
    ScannerId::ALL.into_iter().filter(|s| s.is_supported())
}

/// Returns `true` if `id` names a scanner usable in approval rules.
pub fn is_supported_scanner(id: &str) -> bool {
    id.parse::<ScannerId>()
        .map(ScannerId::is_supported)
        .unwrap_or(false)
}

// ---------------------------------------------------------------------------
// Severities
// ---------------------------------------------------------------------------

/// Finding severity, lowest first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Info,
    Unknown,
    Low,
    Medium,
    High,
    Critical,
}

impl Severity {
    pub const ALL: [Severity; 6] = [
        Severity::Info,
        Severity::Unknown,
        Severity::Low,
        Severity::Medium,
        Severity::High,
        Severity::Critical,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Info => "info",
            Self::Unknown => "unknown",
            Self::Low => "low",
            Self::Medium => "medium",
            Self::High => "high",
            Self::Critical => "critical",
        }
    }
}

impl FromStr for Severity {
    type Err = UnknownVocabulary;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        parse_vocabulary("severity level", &Self::ALL, Self::as_str, s)
    }
}

impl std::fmt::Display for Severity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Severities a rule filters on when none are configured.
pub const DEFAULT_SEVERITIES: [Severity; 3] = [Severity::Unknown, Severity::High, Severity::Critical];

pub fn default_severities() -> BTreeSet<Severity> {
    DEFAULT_SEVERITIES.into_iter().collect()
}

// ---------------------------------------------------------------------------
// Vulnerability states
// ---------------------------------------------------------------------------

/// Vulnerability lifecycle states plus the synthetic `newly_detected` state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VulnerabilityState {
    Detected,
    Confirmed,
    Resolved,
    Dismissed,
    /// First observed on the head pipeline, not on the target branch baseline.
    NewlyDetected,
}

impl VulnerabilityState {
    pub const ALL: [VulnerabilityState; 5] = [
        VulnerabilityState::Detected,
        VulnerabilityState::Confirmed,
        VulnerabilityState::Resolved,
        VulnerabilityState::Dismissed,
        VulnerabilityState::NewlyDetected,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Detected => "detected",
            Self::Confirmed => "confirmed",
            Self::Resolved => "resolved",
            Self::Dismissed => "dismissed",
            Self::NewlyDetected => "newly_detected",
        }
    }

    /// `true` for states tracked on stored vulnerabilities (everything but
    /// `newly_detected`).
    pub fn is_preexisting(self) -> bool {
        self != Self::NewlyDetected
    }
}

impl FromStr for VulnerabilityState {
    type Err = UnknownVocabulary;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        parse_vocabulary("vulnerability state", &Self::ALL, Self::as_str, s)
    }
}

impl std::fmt::Display for VulnerabilityState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// States a rule watches when none are configured.
pub fn default_vulnerability_states() -> BTreeSet<VulnerabilityState> {
    BTreeSet::from([VulnerabilityState::NewlyDetected])
}

// ---------------------------------------------------------------------------
// Report types
// ---------------------------------------------------------------------------

/// Sub-kind of a `report_approver` rule.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReportType {
    Vulnerability,
    LicenseScanning,
    CodeCoverage,
    /// Driven by a security policy configuration rather than a report.
    ScanFinding,
}

impl ReportType {
    pub const ALL: [ReportType; 4] = [
        ReportType::Vulnerability,
        ReportType::LicenseScanning,
        ReportType::CodeCoverage,
        ReportType::ScanFinding,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Vulnerability => "vulnerability",
            Self::LicenseScanning => "license_scanning",
            Self::CodeCoverage => "code_coverage",
            Self::ScanFinding => "scan_finding",
        }
    }

    /// Name reserved for manually configured rules of this report type.
    pub fn reserved_name(self) -> Option<&'static str> {
        match self {
            Self::Vulnerability => Some("Vulnerability-Check"),
            Self::LicenseScanning => Some("License-Check"),
            Self::CodeCoverage => Some("Coverage-Check"),
            Self::ScanFinding => None,
        }
    }

    /// Report type whose reserved name is `name`.
    pub fn for_reserved_name(name: &str) -> Option<Self> {
        Self::ALL
            .into_iter()
            .find(|rt| rt.reserved_name() == Some(name))
    }

    /// Whether projections of this report type are keyed by their source rule.
    pub fn keyed_by_source(self) -> bool {
        matches!(self, Self::ScanFinding | Self::LicenseScanning)
    }
}

impl FromStr for ReportType {
    type Err = UnknownVocabulary;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        parse_vocabulary("report type", &Self::ALL, Self::as_str, s)
    }
}

impl std::fmt::Display for ReportType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}
