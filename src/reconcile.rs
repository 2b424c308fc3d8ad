//! Fill-only merge of extracted data into a subject aggregate.
//!
//! A blank field may be filled; a populated one is never replaced. Every
//! field the merge looks at leaves a [`FieldChange`] in the report.

use std::collections::BTreeMap;

use serde::Serialize;
use uuid::Uuid;

use crate::{
    config::SubjectDefaults,
    extract::{
        catalog::collapse_whitespace,
        normalize::{CanonicalPayload, sub_form_missing, typed_sub_form},
        resolve::sanitize_expected_learning,
        units::UnitEvidence,
    },
    models::{
        API2_FIELDS, API3_FIELDS, ApiType2Completion, ApiType3Completion, BOUNDARY_FIELDS,
        BoundaryCondition, COMPETENCY_NUMBERS, Subject, SubjectAggregate, SubjectKey, SubjectUnit,
        TechnicalCompetency, UNIT_NUMBERS,
    },
};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FieldOutcome {
    Filled,
    Kept,
    Skipped,
    Error(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FieldChange {
    pub field: String,
    pub outcome: FieldOutcome,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ChangeReport {
    pub changes: Vec<FieldChange>,
}

impl ChangeReport {
    fn record(&mut self, field: impl Into<String>, outcome: FieldOutcome) {
        self.changes.push(FieldChange {
            field: field.into(),
            outcome,
        });
    }

    pub fn filled(&self) -> impl Iterator<Item = &str> {
        self.changes
            .iter()
            .filter(|change| change.outcome == FieldOutcome::Filled)
            .map(|change| change.field.as_str())
    }

    pub fn count(&self, outcome: &FieldOutcome) -> usize {
        self.changes
            .iter()
            .filter(|change| &change.outcome == outcome)
            .count()
    }

    pub fn errors(&self) -> Vec<&FieldChange> {
        self.changes
            .iter()
            .filter(|change| matches!(change.outcome, FieldOutcome::Error(_)))
            .collect()
    }
}

/// Everything one run wants to write for a subject.
#[derive(Debug, Clone, PartialEq)]
pub struct SubjectPlan {
    pub key: SubjectKey,
    pub name: String,
    pub area: String,
    pub semester: String,
    pub campus: String,
    pub api_type: i16,
    pub hours: Option<i32>,
    pub units: Vec<SubjectUnit>,
    pub competencies: Vec<TechnicalCompetency>,
    pub boundary: Option<BoundaryCondition>,
    pub api2: Option<ApiType2Completion>,
    pub api3: Option<ApiType3Completion>,
}

impl SubjectPlan {
    pub fn new(
        key: SubjectKey,
        name: impl Into<String>,
        area: impl Into<String>,
        hours: Option<i32>,
        defaults: &SubjectDefaults,
    ) -> Self {
        Self {
            key,
            name: name.into(),
            area: area.into(),
            semester: defaults.semester.clone(),
            campus: defaults.campus.clone(),
            api_type: defaults.api_type,
            hours,
            units: Vec::new(),
            competencies: Vec::new(),
            boundary: None,
            api2: None,
            api3: None,
        }
    }

    /// Competencies and sub-forms from model output.
    pub fn with_sections(mut self, payload: &CanonicalPayload) -> Self {
        self.competencies = payload
            .technical_competencies
            .iter()
            .map(|item| TechnicalCompetency {
                number: item.number,
                description: collapse_whitespace(&item.description),
            })
            .collect();

        if let Some(form) = payload
            .company_boundary_condition
            .as_ref()
            .filter(|_| !sub_form_missing(&payload.company_boundary_condition))
        {
            let mut typed: BoundaryCondition = typed_sub_form(form, &BOUNDARY_FIELDS);
            typed.fields_mut().into_iter().for_each(|(_, value)| tidy(value));
            self.boundary = Some(typed);
        }
        if let Some(form) = payload
            .api_type_2_completion
            .as_ref()
            .filter(|_| !sub_form_missing(&payload.api_type_2_completion))
        {
            let mut typed: ApiType2Completion = typed_sub_form(form, &API2_FIELDS);
            typed.fields_mut().into_iter().for_each(|(_, value)| tidy(value));
            self.api2 = Some(typed);
        }
        if let Some(form) = payload
            .api_type_3_completion
            .as_ref()
            .filter(|_| !sub_form_missing(&payload.api_type_3_completion))
        {
            let mut typed: ApiType3Completion = typed_sub_form(form, &API3_FIELDS);
            typed.fields_mut().into_iter().for_each(|(_, value)| tidy(value));
            self.api3 = Some(typed);
        }
        self
    }

    /// Units with whitespace collapsed and expected learning trimmed of headings.
    pub fn with_units(mut self, units: Vec<SubjectUnit>) -> Self {
        self.units = units
            .into_iter()
            .map(|unit| SubjectUnit {
                number: unit.number,
                expected_learning: unit
                    .expected_learning
                    .and_then(|text| sanitize_expected_learning(&collapse_whitespace(&text))),
                unit_hours: unit.unit_hours,
                activities_description: unit.activities_description.and_then(non_blank),
                evaluation_evidence: unit.evaluation_evidence.and_then(non_blank),
            })
            .collect();
        self
    }
}

fn tidy(value: &mut String) {
    *value = collapse_whitespace(value);
}

fn non_blank(text: String) -> Option<String> {
    let text = collapse_whitespace(&text);
    (!text.is_empty()).then_some(text)
}

fn is_blank(text: &str) -> bool {
    text.trim().is_empty()
}

/// Fills unit fields the model left empty from local evidence, then from the
/// heading parser. Returns the merged units and the unit numbers that gained
/// evidence.
pub fn enrich_units(
    model_units: Vec<SubjectUnit>,
    evidence: &BTreeMap<i32, UnitEvidence>,
    headings: &[SubjectUnit],
) -> (Vec<SubjectUnit>, Vec<i32>) {
    let mut merged: BTreeMap<i32, SubjectUnit> = BTreeMap::new();
    let mut passthrough = Vec::new();
    for unit in model_units {
        if merged.contains_key(&unit.number) || !UNIT_NUMBERS.contains(&unit.number) {
            passthrough.push(unit);
        } else {
            merged.insert(unit.number, unit);
        }
    }

    let mut enriched = Vec::new();
    for (number, found) in evidence {
        let unit = merged
            .entry(*number)
            .or_insert_with(|| SubjectUnit::numbered(*number));
        let mut touched = false;
        if let Some(text) = found.evaluation_evidence.as_deref().filter(|text| !is_blank(text)) {
            if unit.evaluation_evidence.as_deref().is_none_or(is_blank) {
                unit.evaluation_evidence = Some(text.to_string());
                touched = true;
            }
        }
        if let Some(text) = found.activities_description.as_deref().filter(|text| !is_blank(text)) {
            if unit.activities_description.as_deref().is_none_or(is_blank) {
                unit.activities_description = Some(text.to_string());
                touched = true;
            }
        }
        if unit.unit_hours.is_none() && found.unit_hours.is_some() {
            unit.unit_hours = found.unit_hours;
            touched = true;
        }
        if touched {
            enriched.push(*number);
        }
    }

    for heading in headings {
        let unit = merged
            .entry(heading.number)
            .or_insert_with(|| SubjectUnit::numbered(heading.number));
        if unit.expected_learning.as_deref().is_none_or(is_blank) {
            unit.expected_learning = heading.expected_learning.clone();
        }
        if unit.activities_description.as_deref().is_none_or(is_blank) {
            unit.activities_description = heading.activities_description.clone();
        }
        if unit.unit_hours.is_none() {
            unit.unit_hours = heading.unit_hours;
        }
    }

    let mut units: Vec<SubjectUnit> = merged.into_values().collect();
    units.extend(passthrough);
    (units, enriched)
}

fn fill_text(report: &mut ChangeReport, field: String, slot: &mut String, value: &str) {
    if is_blank(value) {
        return;
    }
    if is_blank(slot) {
        *slot = value.to_string();
        report.record(field, FieldOutcome::Filled);
    } else {
        report.record(field, FieldOutcome::Kept);
    }
}

fn fill_optional_text(
    report: &mut ChangeReport,
    field: String,
    slot: &mut Option<String>,
    value: Option<&str>,
) {
    let Some(value) = value.filter(|value| !is_blank(value)) else {
        return;
    };
    if slot.as_deref().is_none_or(is_blank) {
        *slot = Some(value.to_string());
        report.record(field, FieldOutcome::Filled);
    } else {
        report.record(field, FieldOutcome::Kept);
    }
}

/// Merges `plan` into the existing aggregate, or builds a fresh one with
/// `new_id` when the subject does not exist yet.
pub fn merge_aggregate(
    existing: Option<SubjectAggregate>,
    plan: &SubjectPlan,
    new_id: Uuid,
) -> (SubjectAggregate, ChangeReport) {
    let mut report = ChangeReport::default();

    let mut aggregate = match existing {
        Some(mut aggregate) => {
            if let Some(subject) = merge_subject(&mut report, &aggregate.subject, plan) {
                aggregate.subject = subject;
            }
            aggregate
        }
        None => {
            report.record("subject", FieldOutcome::Filled);
            SubjectAggregate::new(Subject {
                id: new_id,
                code: plan.key.code.clone(),
                section: plan.key.section.clone(),
                period: plan.key.period.clone(),
                name: plan.name.clone(),
                area: plan.area.clone(),
                semester: plan.semester.clone(),
                campus: plan.campus.clone(),
                hours: plan.hours,
                api_type: plan.api_type,
            })
        }
    };

    merge_units(&mut report, &mut aggregate.units, &plan.units);
    merge_competencies(&mut report, &mut aggregate.competencies, &plan.competencies);

    if let Some(boundary) = plan.boundary.as_ref().filter(|form| !form.is_blank()) {
        let slot = aggregate.boundary.get_or_insert_with(BoundaryCondition::default);
        let mut incoming = boundary.clone();
        for ((field, current), (_, value)) in slot.fields_mut().into_iter().zip(incoming.fields_mut()) {
            fill_text(&mut report, format!("company_boundary_condition.{field}"), current, value);
        }
    }
    if let Some(api2) = plan.api2.as_ref().filter(|form| !form.is_blank()) {
        let slot = aggregate.api2.get_or_insert_with(ApiType2Completion::default);
        let mut incoming = api2.clone();
        for ((field, current), (_, value)) in slot.fields_mut().into_iter().zip(incoming.fields_mut()) {
            fill_text(&mut report, format!("api_type_2_completion.{field}"), current, value);
        }
    }
    if let Some(api3) = plan.api3.as_ref().filter(|form| !form.is_blank()) {
        let slot = aggregate.api3.get_or_insert_with(ApiType3Completion::default);
        let mut incoming = api3.clone();
        for ((field, current), (_, value)) in slot.fields_mut().into_iter().zip(incoming.fields_mut()) {
            fill_text(&mut report, format!("api_type_3_completion.{field}"), current, value);
        }
    }

    (aggregate, report)
}

// `None` when nothing on the subject row changes.
fn merge_subject(report: &mut ChangeReport, current: &Subject, plan: &SubjectPlan) -> Option<Subject> {
    let mut subject = current.clone();

    fill_text(report, "subject.name".into(), &mut subject.name, &plan.name);
    fill_text(report, "subject.area".into(), &mut subject.area, &plan.area);
    fill_text(report, "subject.semester".into(), &mut subject.semester, &plan.semester);
    fill_text(report, "subject.campus".into(), &mut subject.campus, &plan.campus);

    match plan.hours.filter(|hours| *hours > 0) {
        Some(hours) if subject.hours.is_none_or(|current| current == 0) => {
            subject.hours = Some(hours);
            report.record("subject.hours", FieldOutcome::Filled);
        }
        Some(_) => report.record("subject.hours", FieldOutcome::Kept),
        None => {}
    }

    (subject != *current).then_some(subject)
}

fn merge_units(report: &mut ChangeReport, units: &mut BTreeMap<i32, SubjectUnit>, incoming: &[SubjectUnit]) {
    for unit in incoming {
        let prefix = format!("subject_units[{}]", unit.number);
        if !UNIT_NUMBERS.contains(&unit.number) {
            report.record(prefix, FieldOutcome::Skipped);
            continue;
        }

        let slot = units
            .entry(unit.number)
            .or_insert_with(|| SubjectUnit::numbered(unit.number));

        fill_optional_text(
            report,
            format!("{prefix}.expected_learning"),
            &mut slot.expected_learning,
            unit.expected_learning.as_deref(),
        );
        match unit.unit_hours {
            Some(hours) if hours < 0 => report.record(
                format!("{prefix}.unit_hours"),
                FieldOutcome::Error(format!("negative hours: {hours}")),
            ),
            Some(hours) if slot.unit_hours.is_none() => {
                slot.unit_hours = Some(hours);
                report.record(format!("{prefix}.unit_hours"), FieldOutcome::Filled);
            }
            Some(_) => report.record(format!("{prefix}.unit_hours"), FieldOutcome::Kept),
            None => {}
        }
        fill_optional_text(
            report,
            format!("{prefix}.activities_description"),
            &mut slot.activities_description,
            unit.activities_description.as_deref(),
        );
        fill_optional_text(
            report,
            format!("{prefix}.evaluation_evidence"),
            &mut slot.evaluation_evidence,
            unit.evaluation_evidence.as_deref(),
        );
    }
}

fn merge_competencies(
    report: &mut ChangeReport,
    competencies: &mut BTreeMap<i32, TechnicalCompetency>,
    incoming: &[TechnicalCompetency],
) {
    for item in incoming {
        let field = format!("technical_competencies[{}]", item.number);
        if !COMPETENCY_NUMBERS.contains(&item.number) || is_blank(&item.description) {
            report.record(field, FieldOutcome::Skipped);
            continue;
        }
        let slot = competencies.entry(item.number).or_insert_with(|| TechnicalCompetency {
            number: item.number,
            description: String::new(),
        });
        fill_text(report, field, &mut slot.description, &item.description);
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::extract::normalize::normalize_payload;

    fn defaults() -> SubjectDefaults {
        SubjectDefaults {
            section: "1".into(),
            period: String::new(),
            campus: "chillan".into(),
            api_type: 1,
            hours: 0,
            semester: "Primero".into(),
            area: "Administracion".into(),
        }
    }

    fn key() -> SubjectKey {
        SubjectKey {
            code: "TIHI43".into(),
            section: "1".into(),
            period: String::new(),
        }
    }

    fn plan() -> SubjectPlan {
        let payload = normalize_payload(
            json!({
                "technical_competencies": ["Integra soluciones", "Gestiona proyectos"],
                "company_boundary_condition": {"company_type_description": "Pymes  TI"},
                "api_type_2_completion": {"project_goal_students": ""}
            })
            .as_object()
            .unwrap(),
        );
        SubjectPlan::new(key(), "Taller De Titulo", "Administracion", Some(54), &defaults())
            .with_sections(&payload)
            .with_units(vec![
                SubjectUnit {
                    number: 1,
                    expected_learning: Some("Diseña  soluciones CRITERIOS DE EVALUACIÓN".into()),
                    unit_hours: Some(20),
                    ..SubjectUnit::default()
                },
                SubjectUnit::numbered(5),
            ])
    }

    #[test]
    fn fresh_aggregate_takes_every_field() {
        let id = Uuid::new_v4();
        let (aggregate, report) = merge_aggregate(None, &plan(), id);

        assert_eq!(aggregate.subject.id, id);
        assert_eq!(aggregate.subject.hours, Some(54));
        assert_eq!(
            aggregate.units[&1].expected_learning.as_deref(),
            Some("Diseña soluciones")
        );
        assert!(!aggregate.units.contains_key(&5));
        assert_eq!(aggregate.competencies.len(), 2);
        assert_eq!(
            aggregate.boundary.as_ref().unwrap().company_type_description,
            "Pymes TI"
        );
        assert!(aggregate.api2.is_none());
        assert_eq!(report.count(&FieldOutcome::Skipped), 1);
    }

    #[test]
    fn populated_fields_are_never_replaced() {
        let (mut aggregate, _) = merge_aggregate(None, &plan(), Uuid::new_v4());
        aggregate.units.get_mut(&1).unwrap().expected_learning = Some("Texto del operador".into());
        aggregate.subject.hours = Some(0);

        let mut second = plan();
        second.units[0].expected_learning = Some("Otra cosa".into());
        second.hours = Some(60);
        let (merged, report) = merge_aggregate(Some(aggregate), &second, Uuid::new_v4());

        assert_eq!(
            merged.units[&1].expected_learning.as_deref(),
            Some("Texto del operador")
        );
        assert_eq!(merged.subject.hours, Some(60));
        assert!(report.filled().eq(["subject.hours"]));
    }

    #[test]
    fn rerun_with_same_plan_fills_nothing() {
        let (aggregate, _) = merge_aggregate(None, &plan(), Uuid::new_v4());
        let (again, report) = merge_aggregate(Some(aggregate.clone()), &plan(), Uuid::new_v4());
        assert_eq!(again, aggregate);
        assert_eq!(report.count(&FieldOutcome::Filled), 0);
        assert!(report.count(&FieldOutcome::Kept) > 0);
    }

    #[test]
    fn blank_sub_forms_leave_no_record() {
        let mut blank = plan();
        blank.boundary = Some(BoundaryCondition::default());
        blank.api3 = Some(ApiType3Completion {
            other_activities: "   ".into(),
            ..ApiType3Completion::default()
        });

        let (aggregate, report) = merge_aggregate(None, &blank, Uuid::new_v4());

        assert!(aggregate.boundary.is_none());
        assert!(aggregate.api3.is_none());
        assert!(!report.changes.iter().any(|change| {
            change.field.starts_with("company_boundary_condition")
                || change.field.starts_with("api_type_3_completion")
        }));
    }

    #[test]
    fn negative_unit_hours_are_reported_per_field() {
        let mut bad = plan();
        bad.units[0].unit_hours = Some(-3);
        let (aggregate, report) = merge_aggregate(None, &bad, Uuid::new_v4());
        assert_eq!(aggregate.units[&1].unit_hours, None);
        assert_eq!(report.errors().len(), 1);
        assert!(aggregate.units[&1].expected_learning.is_some());
    }

    #[test]
    fn evidence_fills_gaps_but_model_values_win() {
        let model_units = vec![SubjectUnit {
            number: 1,
            evaluation_evidence: Some("Del modelo".into()),
            ..SubjectUnit::default()
        }];
        let evidence = BTreeMap::from([
            (
                1,
                UnitEvidence {
                    evaluation_evidence: Some("1 Informe".into()),
                    activities_description: Some("Los estudiantes elaboran".into()),
                    unit_hours: Some(18),
                },
            ),
            (
                2,
                UnitEvidence {
                    evaluation_evidence: Some("2 Prototipo".into()),
                    activities_description: None,
                    unit_hours: None,
                },
            ),
        ]);
        let headings = vec![SubjectUnit {
            number: 1,
            expected_learning: Some("Analiza el contexto".into()),
            ..SubjectUnit::default()
        }];

        let (units, enriched) = enrich_units(model_units, &evidence, &headings);
        assert_eq!(enriched, vec![1, 2]);
        assert_eq!(units[0].evaluation_evidence.as_deref(), Some("Del modelo"));
        assert_eq!(units[0].unit_hours, Some(18));
        assert_eq!(units[0].expected_learning.as_deref(), Some("Analiza el contexto"));
        assert_eq!(units[1].evaluation_evidence.as_deref(), Some("2 Prototipo"));
    }
}
