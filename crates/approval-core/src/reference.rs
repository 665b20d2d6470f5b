//! Markdown-style references to approval rules.

use std::str::FromStr;

use crate::error::FormatError;
use crate::rule::RuleDefinition;

pub const REFERENCE_PREFIX: &str = "approval_rule:";

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ReferenceFormat {
    Id,
    #[default]
    Name,
}

impl FromStr for ReferenceFormat {
    type Err = FormatError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "id" => Ok(Self::Id),
            "name" => Ok(Self::Name),
            other => Err(FormatError::UnknownFormat(other.to_string())),
        }
    }
}

impl RuleDefinition {
    /// `approval_rule:"<name>"` or `approval_rule:<id>`.
    ///
    /// Name references fall back to the id when the name is blank, and
    /// unsaved rules render `new` in place of an id.
    pub fn to_reference(&self, format: ReferenceFormat) -> String {
        let id = self
            .id
            .map(|id| id.to_string())
            .unwrap_or_else(|| "new".to_string());
        let body = match format {
            ReferenceFormat::Name if !self.name.trim().is_empty() => format!("\"{}\"", self.name),
            _ => id,
        };
        format!("{REFERENCE_PREFIX}{body}")
    }

    /// Parse `format` and render; unknown formats are an argument error.
    pub fn to_reference_str(&self, format: &str) -> Result<String, FormatError> {
        Ok(self.to_reference(format.parse()?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ids::{ProjectId, RuleId};

    #[test]
    fn renders_both_formats() {
        let rule = RuleDefinition::new(ProjectId(1), "Security").with_id(RuleId(12));
        assert_eq!(rule.to_reference(ReferenceFormat::Id), "approval_rule:12");
        assert_eq!(rule.to_reference(ReferenceFormat::Name), "approval_rule:\"Security\"");
    }

    #[test]
    fn blank_name_falls_back_to_id() {
        let rule = RuleDefinition::new(ProjectId(1), "").with_id(RuleId(3));
        assert_eq!(rule.to_reference(ReferenceFormat::Name), "approval_rule:3");
    }

    #[test]
    fn unknown_format_is_rejected() {
        let rule = RuleDefinition::new(ProjectId(1), "x");
        let err = rule.to_reference_str("invalid").unwrap_err();
        assert_eq!(err.to_string(), "Unknown format");
        assert_eq!(rule.to_reference_str("name").unwrap(), "approval_rule:\"x\"");
    }
}
