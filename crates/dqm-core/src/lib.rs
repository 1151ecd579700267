//! Domain model and issue taxonomy for the dataset quality mirror.

use std::fmt;

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

pub const CRATE_NAME: &str = "dqm-core";

/// Issue type excluded from report aggregation entirely.
pub const UNKNOWN_ENTITY_ISSUE: &str = "unknown entity";

/// Legacy suffix carried by some catalog organisation ids. Stripped before
/// anything is written to the mirror, so every table keys on the bare id.
pub fn normalise_organisation_id(raw: &str) -> String {
    raw.replace("-eng", "")
}

/// Classification of a single issue type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum IssueCategory {
    TaxonomyViolation,
    IncorrectFormat,
    InaccurateData,
    InvalidData,
    MissingData,
    Unknown,
}

impl IssueCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            IssueCategory::TaxonomyViolation => "taxonomy-violation",
            IssueCategory::IncorrectFormat => "incorrect-format",
            IssueCategory::InaccurateData => "inaccurate-data",
            IssueCategory::InvalidData => "invalid-data",
            IssueCategory::MissingData => "missing-data",
            IssueCategory::Unknown => "unknown",
        }
    }

    pub fn description(&self) -> &'static str {
        match self {
            IssueCategory::TaxonomyViolation => "Data doesn't meet the standard",
            IssueCategory::IncorrectFormat => "Data format incorrect",
            IssueCategory::InaccurateData => "Inaccurate data",
            IssueCategory::InvalidData => "Invalid data",
            IssueCategory::MissingData => "Missing data",
            IssueCategory::Unknown => "Unknown",
        }
    }

    pub fn parse(value: &str) -> Self {
        match value {
            "taxonomy-violation" => IssueCategory::TaxonomyViolation,
            "incorrect-format" => IssueCategory::IncorrectFormat,
            "inaccurate-data" => IssueCategory::InaccurateData,
            "invalid-data" => IssueCategory::InvalidData,
            "missing-data" => IssueCategory::MissingData,
            _ => IssueCategory::Unknown,
        }
    }
}

impl fmt::Display for IssueCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// User-facing grouping of issue categories into the action a data owner
/// should take.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ActionCategory {
    Add,
    Change,
    Check,
}

impl ActionCategory {
    pub fn description(&self) -> &'static str {
        match self {
            ActionCategory::Add => "Add missing data",
            ActionCategory::Change => "Change the data format or value",
            ActionCategory::Check => "Check accuracy of data",
        }
    }
}

/// Forward taxonomy lookup: issue-type name to category. Names absent from
/// the table classify as unknown.
pub fn category_for(issue_name: &str) -> IssueCategory {
    match issue_name {
        "Combined values" | "Removed URI prefix" | "Patched value" => {
            IssueCategory::TaxonomyViolation
        }
        "Mercator conversion" | "Mercator flipped" | "OSGB conversion" | "OSGB flipped" => {
            IssueCategory::IncorrectFormat
        }
        "WGS84 flipped" | "WGS84 out of bounds" | "Future entry date" => {
            IssueCategory::InaccurateData
        }
        "Invalid URI" | "Invalid WKT" | "Invalid coordinates" | "Invalid date"
        | "Invalid decimal" | "Invalid flag" | "Invalid geometry" | "Invalid integer"
        | "Value too large" | "Value too small" => IssueCategory::InvalidData,
        "Default field" | "Default value" => IssueCategory::MissingData,
        _ => IssueCategory::Unknown,
    }
}

/// Inverse taxonomy lookup. Exists for consistency checking against the
/// forward table, not for runtime classification.
pub fn issue_names_for(category: IssueCategory) -> &'static [&'static str] {
    match category {
        IssueCategory::TaxonomyViolation => {
            &["Combined values", "Removed URI prefix", "Patched value"]
        }
        IssueCategory::IncorrectFormat => &[
            "Mercator conversion",
            "Mercator flipped",
            "OSGB conversion",
            "OSGB flipped",
        ],
        IssueCategory::InaccurateData => {
            &["WGS84 flipped", "WGS84 out of bounds", "Future entry date"]
        }
        IssueCategory::InvalidData => &[
            "Invalid URI",
            "Invalid WKT",
            "Invalid coordinates",
            "Invalid date",
            "Invalid decimal",
            "Invalid flag",
            "Invalid geometry",
            "Invalid integer",
            "Value too large",
            "Value too small",
        ],
        IssueCategory::MissingData => &["Default field", "Default value"],
        IssueCategory::Unknown => &[],
    }
}

/// Issue categories subsumed by each action.
pub fn categories_for(action: ActionCategory) -> &'static [IssueCategory] {
    match action {
        ActionCategory::Add => &[IssueCategory::MissingData],
        ActionCategory::Change => &[
            IssueCategory::InvalidData,
            IssueCategory::InaccurateData,
            IssueCategory::IncorrectFormat,
        ],
        ActionCategory::Check => &[IssueCategory::TaxonomyViolation],
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Organisation {
    pub organisation: String,
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Resource {
    pub resource: String,
    pub start_date: Option<NaiveDate>,
    pub end_date: Option<NaiveDate>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Collection {
    pub collection: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Dataset {
    pub dataset: String,
    pub name: String,
    pub collection: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DatasetResource {
    pub dataset: String,
    pub resource: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrganisationResource {
    pub organisation: String,
    pub resource: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IssueType {
    pub issue_type: String,
    pub name: String,
    pub description: String,
    pub severity: String,
    pub severity_name: String,
    pub severity_description: String,
    pub category: IssueCategory,
}

impl IssueType {
    pub fn is_error(&self) -> bool {
        self.severity == "error"
    }

    pub fn is_warning(&self) -> bool {
        self.severity == "warn"
    }
}

/// The unit of report aggregation, discovered by joining the mirror's link
/// tables.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Triple {
    pub dataset: String,
    pub resource: String,
    pub organisation: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DatasetReport {
    pub id: i64,
    pub dataset: String,
    pub resource: String,
    pub organisation: String,
    pub created: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DatasetIssue {
    pub id: i64,
    pub dataset_report_id: i64,
    pub issue_type: String,
    pub field: String,
    pub value: Option<String>,
    pub count: i64,
}

/// Pre-aggregated issue occurrences for one (issue type, field) pair within
/// a single generator run. Count folds into the stored row on commit.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct IssueTally {
    pub issue_type: String,
    pub field: String,
    pub value: Option<String>,
    pub count: i64,
}

/// Overall standing of one dataset report.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum DatasetStatus {
    ActionNeeded,
    HasRecommendations,
    StandardMet,
}

impl DatasetStatus {
    pub fn description(&self) -> &'static str {
        match self {
            DatasetStatus::ActionNeeded => "Action needed",
            DatasetStatus::HasRecommendations => "Has recommendations",
            DatasetStatus::StandardMet => "Standard met",
        }
    }
}

/// A stored issue joined to its issue type, the shape report consumers read.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReportedIssue {
    pub issue: DatasetIssue,
    pub issue_type: IssueType,
}

/// Error-severity issues demand action; warnings alone leave the report at
/// "has recommendations"; anything else meets the standard.
pub fn classify_report(issues: &[ReportedIssue]) -> DatasetStatus {
    if issues.iter().any(|i| i.issue_type.is_error()) {
        DatasetStatus::ActionNeeded
    } else if issues.iter().any(|i| i.issue_type.is_warning()) {
        DatasetStatus::HasRecommendations
    } else {
        DatasetStatus::StandardMet
    }
}

/// Filter a report's issues down to those belonging to one action group.
pub fn issues_for_action<'a>(
    action: ActionCategory,
    issues: &'a [ReportedIssue],
) -> Vec<&'a ReportedIssue> {
    let categories = categories_for(action);
    issues
        .iter()
        .filter(|i| categories.contains(&i.issue_type.category))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn issue_type(name: &str, severity: &str) -> IssueType {
        IssueType {
            issue_type: name.to_ascii_lowercase().replace(' ', "-"),
            name: name.to_string(),
            description: String::new(),
            severity: severity.to_string(),
            severity_name: severity.to_string(),
            severity_description: String::new(),
            category: category_for(name),
        }
    }

    fn reported(name: &str, severity: &str) -> ReportedIssue {
        let issue_type = issue_type(name, severity);
        ReportedIssue {
            issue: DatasetIssue {
                id: 1,
                dataset_report_id: 1,
                issue_type: issue_type.issue_type.clone(),
                field: "geometry".to_string(),
                value: None,
                count: 1,
            },
            issue_type,
        }
    }

    #[test]
    fn invalid_date_classifies_as_invalid_data() {
        assert_eq!(category_for("Invalid date"), IssueCategory::InvalidData);
    }

    #[test]
    fn unmapped_issue_name_classifies_as_unknown() {
        assert_eq!(category_for("Teleported geometry"), IssueCategory::Unknown);
        assert_eq!(category_for(""), IssueCategory::Unknown);
    }

    #[test]
    fn forward_and_inverse_tables_agree() {
        for category in [
            IssueCategory::TaxonomyViolation,
            IssueCategory::IncorrectFormat,
            IssueCategory::InaccurateData,
            IssueCategory::InvalidData,
            IssueCategory::MissingData,
        ] {
            let names = issue_names_for(category);
            assert!(!names.is_empty());
            for name in names {
                assert_eq!(category_for(name), category, "mismatch for {name}");
            }
        }
    }

    #[test]
    fn every_mapped_category_belongs_to_exactly_one_action() {
        for category in [
            IssueCategory::TaxonomyViolation,
            IssueCategory::IncorrectFormat,
            IssueCategory::InaccurateData,
            IssueCategory::InvalidData,
            IssueCategory::MissingData,
        ] {
            let owners = [ActionCategory::Add, ActionCategory::Change, ActionCategory::Check]
                .into_iter()
                .filter(|action| categories_for(*action).contains(&category))
                .count();
            assert_eq!(owners, 1, "{category} covered by {owners} actions");
        }
    }

    #[test]
    fn category_round_trips_through_parse() {
        for category in [
            IssueCategory::TaxonomyViolation,
            IssueCategory::IncorrectFormat,
            IssueCategory::InaccurateData,
            IssueCategory::InvalidData,
            IssueCategory::MissingData,
            IssueCategory::Unknown,
        ] {
            assert_eq!(IssueCategory::parse(category.as_str()), category);
        }
        assert_eq!(IssueCategory::parse("nonsense"), IssueCategory::Unknown);
    }

    #[test]
    fn organisation_id_suffix_is_stripped() {
        assert_eq!(
            normalise_organisation_id("local-authority-eng:CAT"),
            "local-authority:CAT"
        );
        assert_eq!(
            normalise_organisation_id("development-corporation:Q1"),
            "development-corporation:Q1"
        );
    }

    #[test]
    fn error_issue_forces_action_needed() {
        let issues = vec![reported("Invalid date", "error"), reported("Default value", "warn")];
        assert_eq!(classify_report(&issues), DatasetStatus::ActionNeeded);
    }

    #[test]
    fn warnings_alone_give_recommendations() {
        let issues = vec![reported("Default value", "warn")];
        assert_eq!(classify_report(&issues), DatasetStatus::HasRecommendations);
    }

    #[test]
    fn no_issues_meets_the_standard() {
        assert_eq!(classify_report(&[]), DatasetStatus::StandardMet);
    }

    #[test]
    fn action_filter_groups_by_category() {
        let issues = vec![
            reported("Default value", "warn"),
            reported("Invalid date", "error"),
            reported("Patched value", "info"),
        ];
        assert_eq!(issues_for_action(ActionCategory::Add, &issues).len(), 1);
        assert_eq!(issues_for_action(ActionCategory::Change, &issues).len(), 1);
        assert_eq!(issues_for_action(ActionCategory::Check, &issues).len(), 1);
    }
}
