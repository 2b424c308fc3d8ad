use std::{collections::BTreeMap, fmt};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

pub const UNIT_NUMBERS: std::ops::RangeInclusive<i32> = 1..=4;
pub const COMPETENCY_NUMBERS: std::ops::RangeInclusive<i32> = 1..=5;

const STATUS_OK: &str = "ok";
const STATUS_INVALID_SCHEMA: &str = "invalid_schema";
const STATUS_CONFLICT: &str = "conflict_existing_descriptor";
const STATUS_SKIPPED_MISSING_SUBJECT: &str = "skipped_missing_subject";
const STATUS_ERROR: &str = "error";

/// Terminal status written once per pipeline run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DocumentStatus {
    Ok,
    InvalidSchema,
    ConflictExistingDescriptor,
    SkippedMissingSubject,
    Error,
}

impl DocumentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            DocumentStatus::Ok => STATUS_OK,
            DocumentStatus::InvalidSchema => STATUS_INVALID_SCHEMA,
            DocumentStatus::ConflictExistingDescriptor => STATUS_CONFLICT,
            DocumentStatus::SkippedMissingSubject => STATUS_SKIPPED_MISSING_SUBJECT,
            DocumentStatus::Error => STATUS_ERROR,
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            STATUS_OK => Some(DocumentStatus::Ok),
            STATUS_INVALID_SCHEMA => Some(DocumentStatus::InvalidSchema),
            STATUS_CONFLICT => Some(DocumentStatus::ConflictExistingDescriptor),
            STATUS_SKIPPED_MISSING_SUBJECT => Some(DocumentStatus::SkippedMissingSubject),
            STATUS_ERROR => Some(DocumentStatus::Error),
            _ => None,
        }
    }
}

impl fmt::Display for DocumentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An uploaded descriptor file and its processing state.
#[derive(Debug, Clone)]
pub struct DescriptorDocument {
    pub id: Uuid,
    pub file_path: String,
    pub original_filename: String,
    pub subject_id: Option<Uuid>,
    pub text_cache: String,
    pub meta: Value,
    pub processed_at: Option<DateTime<Utc>>,
    pub status: Option<DocumentStatus>,
}

impl DescriptorDocument {
    pub fn new(file_path: impl Into<String>, original_filename: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            file_path: file_path.into(),
            original_filename: original_filename.into(),
            subject_id: None,
            text_cache: String::new(),
            meta: Value::Object(Default::default()),
            processed_at: None,
            status: None,
        }
    }
}

/// Natural key of a subject. `period` is empty when not configured.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubjectKey {
    pub code: String,
    pub section: String,
    pub period: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Subject {
    pub id: Uuid,
    pub code: String,
    pub section: String,
    pub period: String,
    pub name: String,
    pub area: String,
    pub semester: String,
    pub campus: String,
    pub hours: Option<i32>,
    pub api_type: i16,
}

impl Subject {
    pub fn key(&self) -> SubjectKey {
        SubjectKey {
            code: self.code.clone(),
            section: self.section.clone(),
            period: self.period.clone(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubjectUnit {
    pub number: i32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expected_learning: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub unit_hours: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub activities_description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub evaluation_evidence: Option<String>,
}

impl SubjectUnit {
    pub fn numbered(number: i32) -> Self {
        Self {
            number,
            ..Self::default()
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TechnicalCompetency {
    pub number: i32,
    pub description: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct BoundaryCondition {
    #[serde(default)]
    pub company_type_description: String,
    #[serde(default)]
    pub company_requirements_for_level_2_3: String,
    #[serde(default)]
    pub project_minimum_elements: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ApiType2Completion {
    #[serde(default)]
    pub project_goal_students: String,
    #[serde(default)]
    pub deliverables_at_end: String,
    #[serde(default)]
    pub company_expected_participation: String,
    #[serde(default)]
    pub other_activities: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ApiType3Completion {
    #[serde(default)]
    pub project_goal_students: String,
    #[serde(default)]
    pub deliverables_at_end: String,
    #[serde(default)]
    pub expected_student_role: String,
    #[serde(default)]
    pub other_activities: String,
    #[serde(default)]
    pub master_guide_expected_support: String,
}

/// Field names of each sub-form, in storage order.
pub const BOUNDARY_FIELDS: [&str; 3] = [
    "company_type_description",
    "company_requirements_for_level_2_3",
    "project_minimum_elements",
];
pub const API2_FIELDS: [&str; 4] = [
    "project_goal_students",
    "deliverables_at_end",
    "company_expected_participation",
    "other_activities",
];
pub const API3_FIELDS: [&str; 5] = [
    "project_goal_students",
    "deliverables_at_end",
    "expected_student_role",
    "other_activities",
    "master_guide_expected_support",
];

impl BoundaryCondition {
    pub fn fields_mut(&mut self) -> [(&'static str, &mut String); 3] {
        [
            (BOUNDARY_FIELDS[0], &mut self.company_type_description),
            (BOUNDARY_FIELDS[1], &mut self.company_requirements_for_level_2_3),
            (BOUNDARY_FIELDS[2], &mut self.project_minimum_elements),
        ]
    }

    pub fn is_blank(&self) -> bool {
        self.company_type_description.trim().is_empty()
            && self.company_requirements_for_level_2_3.trim().is_empty()
            && self.project_minimum_elements.trim().is_empty()
    }
}

impl ApiType2Completion {
    pub fn fields_mut(&mut self) -> [(&'static str, &mut String); 4] {
        [
            (API2_FIELDS[0], &mut self.project_goal_students),
            (API2_FIELDS[1], &mut self.deliverables_at_end),
            (API2_FIELDS[2], &mut self.company_expected_participation),
            (API2_FIELDS[3], &mut self.other_activities),
        ]
    }

    pub fn is_blank(&self) -> bool {
        self.project_goal_students.trim().is_empty()
            && self.deliverables_at_end.trim().is_empty()
            && self.company_expected_participation.trim().is_empty()
            && self.other_activities.trim().is_empty()
    }
}

impl ApiType3Completion {
    pub fn fields_mut(&mut self) -> [(&'static str, &mut String); 5] {
        [
            (API3_FIELDS[0], &mut self.project_goal_students),
            (API3_FIELDS[1], &mut self.deliverables_at_end),
            (API3_FIELDS[2], &mut self.expected_student_role),
            (API3_FIELDS[3], &mut self.other_activities),
            (API3_FIELDS[4], &mut self.master_guide_expected_support),
        ]
    }

    pub fn is_blank(&self) -> bool {
        self.project_goal_students.trim().is_empty()
            && self.deliverables_at_end.trim().is_empty()
            && self.expected_student_role.trim().is_empty()
            && self.other_activities.trim().is_empty()
            && self.master_guide_expected_support.trim().is_empty()
    }
}

/// A subject together with every dependent record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubjectAggregate {
    pub subject: Subject,
    pub units: BTreeMap<i32, SubjectUnit>,
    pub competencies: BTreeMap<i32, TechnicalCompetency>,
    pub boundary: Option<BoundaryCondition>,
    pub api2: Option<ApiType2Completion>,
    pub api3: Option<ApiType3Completion>,
}

impl SubjectAggregate {
    pub fn new(subject: Subject) -> Self {
        Self {
            subject,
            units: BTreeMap::new(),
            competencies: BTreeMap::new(),
            boundary: None,
            api2: None,
            api3: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_round_trips_through_text() {
        for status in [
            DocumentStatus::Ok,
            DocumentStatus::InvalidSchema,
            DocumentStatus::ConflictExistingDescriptor,
            DocumentStatus::SkippedMissingSubject,
            DocumentStatus::Error,
        ] {
            assert_eq!(DocumentStatus::parse(status.as_str()), Some(status));
            assert_eq!(
                serde_json::to_value(status).unwrap(),
                Value::String(status.as_str().to_string())
            );
        }
        assert_eq!(DocumentStatus::parse("pending"), None);
    }

    #[test]
    fn sub_forms_reject_unknown_fields() {
        let parsed: Result<BoundaryCondition, _> =
            serde_json::from_str(r#"{"company_type_description":"x","extra":"y"}"#);
        assert!(parsed.is_err());
    }
}
