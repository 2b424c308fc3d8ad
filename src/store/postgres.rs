use std::collections::BTreeMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::{PgPool, Postgres, Transaction};
use tracing::info;
use uuid::Uuid;

use super::{ApplyOutcome, DescriptorStore, LinkOutcome, StoreError};
use crate::{
    models::{
        ApiType2Completion, ApiType3Completion, BoundaryCondition, DescriptorDocument,
        DocumentStatus, Subject, SubjectAggregate, SubjectUnit, TechnicalCompetency,
    },
    reconcile::{SubjectPlan, merge_aggregate},
};

#[derive(sqlx::FromRow)]
struct DocumentRecord {
    id: Uuid,
    file_path: String,
    original_filename: String,
    subject_id: Option<Uuid>,
    text_cache: String,
    meta: Value,
    processed_at: Option<DateTime<Utc>>,
    status: Option<String>,
}

impl From<DocumentRecord> for DescriptorDocument {
    fn from(record: DocumentRecord) -> Self {
        Self {
            id: record.id,
            file_path: record.file_path,
            original_filename: record.original_filename,
            subject_id: record.subject_id,
            text_cache: record.text_cache,
            meta: record.meta,
            processed_at: record.processed_at,
            status: record.status.as_deref().and_then(DocumentStatus::parse),
        }
    }
}

#[derive(sqlx::FromRow)]
struct SubjectRecord {
    id: Uuid,
    code: String,
    section: String,
    period: String,
    name: String,
    area: String,
    semester: String,
    campus: String,
    hours: Option<i32>,
    api_type: i16,
}

impl From<SubjectRecord> for Subject {
    fn from(record: SubjectRecord) -> Self {
        Self {
            id: record.id,
            code: record.code,
            section: record.section,
            period: record.period,
            name: record.name,
            area: record.area,
            semester: record.semester,
            campus: record.campus,
            hours: record.hours,
            api_type: record.api_type,
        }
    }
}

#[derive(sqlx::FromRow)]
struct UnitRecord {
    number: i32,
    expected_learning: Option<String>,
    unit_hours: Option<i32>,
    activities_description: Option<String>,
    evaluation_evidence: Option<String>,
}

#[derive(sqlx::FromRow)]
struct CompetencyRecord {
    number: i32,
    description: String,
}

#[derive(sqlx::FromRow)]
struct BoundaryRecord {
    company_type_description: String,
    company_requirements_for_level_2_3: String,
    project_minimum_elements: String,
}

#[derive(sqlx::FromRow)]
struct Api2Record {
    project_goal_students: String,
    deliverables_at_end: String,
    company_expected_participation: String,
    other_activities: String,
}

#[derive(sqlx::FromRow)]
struct Api3Record {
    project_goal_students: String,
    deliverables_at_end: String,
    expected_student_role: String,
    other_activities: String,
    master_guide_expected_support: String,
}

const SUBJECT_COLUMNS: &str =
    "id, code, section, period, name, area, semester, campus, hours, api_type";

/// `sqlx` store over the tables in `migrations/`.
#[derive(Clone)]
pub struct PgDescriptorStore {
    pool: PgPool,
}

impl PgDescriptorStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    async fn load_aggregate(
        tx: &mut Transaction<'_, Postgres>,
        subject: Subject,
    ) -> Result<SubjectAggregate, StoreError> {
        let subject_id = subject.id;
        let mut aggregate = SubjectAggregate::new(subject);

        let units = sqlx::query_as::<_, UnitRecord>(
            "SELECT number, expected_learning, unit_hours, activities_description, evaluation_evidence
             FROM subject_units WHERE subject_id = $1 ORDER BY number",
        )
        .bind(subject_id)
        .fetch_all(&mut **tx)
        .await?;
        aggregate.units = units
            .into_iter()
            .map(|row| {
                (
                    row.number,
                    SubjectUnit {
                        number: row.number,
                        expected_learning: row.expected_learning,
                        unit_hours: row.unit_hours,
                        activities_description: row.activities_description,
                        evaluation_evidence: row.evaluation_evidence,
                    },
                )
            })
            .collect::<BTreeMap<_, _>>();

        let competencies = sqlx::query_as::<_, CompetencyRecord>(
            "SELECT number, description FROM subject_technical_competencies
             WHERE subject_id = $1 ORDER BY number",
        )
        .bind(subject_id)
        .fetch_all(&mut **tx)
        .await?;
        aggregate.competencies = competencies
            .into_iter()
            .map(|row| {
                (
                    row.number,
                    TechnicalCompetency {
                        number: row.number,
                        description: row.description,
                    },
                )
            })
            .collect();

        aggregate.boundary = sqlx::query_as::<_, BoundaryRecord>(
            "SELECT company_type_description, company_requirements_for_level_2_3, project_minimum_elements
             FROM company_boundary_conditions WHERE subject_id = $1",
        )
        .bind(subject_id)
        .fetch_optional(&mut **tx)
        .await?
        .map(|row| BoundaryCondition {
            company_type_description: row.company_type_description,
            company_requirements_for_level_2_3: row.company_requirements_for_level_2_3,
            project_minimum_elements: row.project_minimum_elements,
        });

        aggregate.api2 = sqlx::query_as::<_, Api2Record>(
            "SELECT project_goal_students, deliverables_at_end, company_expected_participation, other_activities
             FROM api_type2_completions WHERE subject_id = $1",
        )
        .bind(subject_id)
        .fetch_optional(&mut **tx)
        .await?
        .map(|row| ApiType2Completion {
            project_goal_students: row.project_goal_students,
            deliverables_at_end: row.deliverables_at_end,
            company_expected_participation: row.company_expected_participation,
            other_activities: row.other_activities,
        });

        aggregate.api3 = sqlx::query_as::<_, Api3Record>(
            "SELECT project_goal_students, deliverables_at_end, expected_student_role, other_activities,
                    master_guide_expected_support
             FROM api_type3_completions WHERE subject_id = $1",
        )
        .bind(subject_id)
        .fetch_optional(&mut **tx)
        .await?
        .map(|row| ApiType3Completion {
            project_goal_students: row.project_goal_students,
            deliverables_at_end: row.deliverables_at_end,
            expected_student_role: row.expected_student_role,
            other_activities: row.other_activities,
            master_guide_expected_support: row.master_guide_expected_support,
        });

        Ok(aggregate)
    }

    async fn write_aggregate(
        tx: &mut Transaction<'_, Postgres>,
        aggregate: &SubjectAggregate,
    ) -> Result<(), StoreError> {
        let subject = &aggregate.subject;
        sqlx::query(
            "UPDATE subjects
             SET name = $2, area = $3, semester = $4, campus = $5, hours = $6, api_type = $7, updated_at = NOW()
             WHERE id = $1",
        )
        .bind(subject.id)
        .bind(&subject.name)
        .bind(&subject.area)
        .bind(&subject.semester)
        .bind(&subject.campus)
        .bind(subject.hours)
        .bind(subject.api_type)
        .execute(&mut **tx)
        .await?;

        for unit in aggregate.units.values() {
            sqlx::query(
                "INSERT INTO subject_units
                    (subject_id, number, expected_learning, unit_hours, activities_description, evaluation_evidence)
                 VALUES ($1, $2, $3, $4, $5, $6)
                 ON CONFLICT (subject_id, number) DO UPDATE SET
                    expected_learning = EXCLUDED.expected_learning,
                    unit_hours = EXCLUDED.unit_hours,
                    activities_description = EXCLUDED.activities_description,
                    evaluation_evidence = EXCLUDED.evaluation_evidence",
            )
            .bind(subject.id)
            .bind(unit.number)
            .bind(&unit.expected_learning)
            .bind(unit.unit_hours)
            .bind(&unit.activities_description)
            .bind(&unit.evaluation_evidence)
            .execute(&mut **tx)
            .await?;
        }

        for competency in aggregate.competencies.values() {
            sqlx::query(
                "INSERT INTO subject_technical_competencies (subject_id, number, description)
                 VALUES ($1, $2, $3)
                 ON CONFLICT (subject_id, number) DO UPDATE SET description = EXCLUDED.description",
            )
            .bind(subject.id)
            .bind(competency.number)
            .bind(&competency.description)
            .execute(&mut **tx)
            .await?;
        }

        if let Some(form) = &aggregate.boundary {
            sqlx::query(
                "INSERT INTO company_boundary_conditions
                    (subject_id, company_type_description, company_requirements_for_level_2_3, project_minimum_elements)
                 VALUES ($1, $2, $3, $4)
                 ON CONFLICT (subject_id) DO UPDATE SET
                    company_type_description = EXCLUDED.company_type_description,
                    company_requirements_for_level_2_3 = EXCLUDED.company_requirements_for_level_2_3,
                    project_minimum_elements = EXCLUDED.project_minimum_elements",
            )
            .bind(subject.id)
            .bind(&form.company_type_description)
            .bind(&form.company_requirements_for_level_2_3)
            .bind(&form.project_minimum_elements)
            .execute(&mut **tx)
            .await?;
        }

        if let Some(form) = &aggregate.api2 {
            sqlx::query(
                "INSERT INTO api_type2_completions
                    (subject_id, project_goal_students, deliverables_at_end, company_expected_participation, other_activities)
                 VALUES ($1, $2, $3, $4, $5)
                 ON CONFLICT (subject_id) DO UPDATE SET
                    project_goal_students = EXCLUDED.project_goal_students,
                    deliverables_at_end = EXCLUDED.deliverables_at_end,
                    company_expected_participation = EXCLUDED.company_expected_participation,
                    other_activities = EXCLUDED.other_activities",
            )
            .bind(subject.id)
            .bind(&form.project_goal_students)
            .bind(&form.deliverables_at_end)
            .bind(&form.company_expected_participation)
            .bind(&form.other_activities)
            .execute(&mut **tx)
            .await?;
        }

        if let Some(form) = &aggregate.api3 {
            sqlx::query(
                "INSERT INTO api_type3_completions
                    (subject_id, project_goal_students, deliverables_at_end, expected_student_role,
                     other_activities, master_guide_expected_support)
                 VALUES ($1, $2, $3, $4, $5, $6)
                 ON CONFLICT (subject_id) DO UPDATE SET
                    project_goal_students = EXCLUDED.project_goal_students,
                    deliverables_at_end = EXCLUDED.deliverables_at_end,
                    expected_student_role = EXCLUDED.expected_student_role,
                    other_activities = EXCLUDED.other_activities,
                    master_guide_expected_support = EXCLUDED.master_guide_expected_support",
            )
            .bind(subject.id)
            .bind(&form.project_goal_students)
            .bind(&form.deliverables_at_end)
            .bind(&form.expected_student_role)
            .bind(&form.other_activities)
            .bind(&form.master_guide_expected_support)
            .execute(&mut **tx)
            .await?;
        }

        Ok(())
    }
}

#[async_trait]
impl DescriptorStore for PgDescriptorStore {
    async fn load_document(&self, id: Uuid) -> Result<Option<DescriptorDocument>, StoreError> {
        let record = sqlx::query_as::<_, DocumentRecord>(
            "SELECT id, file_path, original_filename, subject_id, text_cache, meta, processed_at, status
             FROM descriptor_files WHERE id = $1",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(record.map(DescriptorDocument::from))
    }

    async fn cache_text(&self, id: Uuid, text: &str) -> Result<(), StoreError> {
        let result = sqlx::query(
            "UPDATE descriptor_files SET text_cache = $2, updated_at = NOW() WHERE id = $1",
        )
        .bind(id)
        .bind(text)
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            return Err(StoreError::DocumentNotFound(id));
        }
        Ok(())
    }

    async fn finish_document(
        &self,
        id: Uuid,
        status: DocumentStatus,
        meta: &Value,
    ) -> Result<(), StoreError> {
        let result = sqlx::query(
            "UPDATE descriptor_files
             SET status = $2, meta = $3, processed_at = NOW(), updated_at = NOW()
             WHERE id = $1",
        )
        .bind(id)
        .bind(status.as_str())
        .bind(meta)
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            return Err(StoreError::DocumentNotFound(id));
        }
        Ok(())
    }

    async fn delete_document(&self, id: Uuid) -> Result<(), StoreError> {
        sqlx::query("DELETE FROM descriptor_files WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn load_subject(&self, id: Uuid) -> Result<Option<Subject>, StoreError> {
        let record = sqlx::query_as::<_, SubjectRecord>(&format!(
            "SELECT {SUBJECT_COLUMNS} FROM subjects WHERE id = $1"
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(record.map(Subject::from))
    }

    async fn apply_plan(
        &self,
        document_id: Uuid,
        plan: &SubjectPlan,
    ) -> Result<ApplyOutcome, StoreError> {
        let mut tx = self.pool.begin().await?;

        let linked_to: Option<Option<Uuid>> =
            sqlx::query_scalar("SELECT subject_id FROM descriptor_files WHERE id = $1 FOR UPDATE")
                .bind(document_id)
                .fetch_optional(&mut *tx)
                .await?;
        let Some(linked_to) = linked_to else {
            return Err(StoreError::DocumentNotFound(document_id));
        };

        let new_id = Uuid::new_v4();
        sqlx::query(
            "INSERT INTO subjects (id, code, section, period, name, area, semester, campus, hours, api_type)
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
             ON CONFLICT (code, section, period) DO NOTHING",
        )
        .bind(new_id)
        .bind(&plan.key.code)
        .bind(&plan.key.section)
        .bind(&plan.key.period)
        .bind(&plan.name)
        .bind(&plan.area)
        .bind(&plan.semester)
        .bind(&plan.campus)
        .bind(plan.hours)
        .bind(plan.api_type)
        .execute(&mut *tx)
        .await?;

        // Row lock serializes concurrent runs resolving to the same subject.
        let subject: Subject = sqlx::query_as::<_, SubjectRecord>(&format!(
            "SELECT {SUBJECT_COLUMNS} FROM subjects
             WHERE code = $1 AND section = $2 AND period = $3 FOR UPDATE"
        ))
        .bind(&plan.key.code)
        .bind(&plan.key.section)
        .bind(&plan.key.period)
        .fetch_optional(&mut *tx)
        .await?
        .map(Subject::from)
        .ok_or_else(|| StoreError::Corrupt(format!("subject {} vanished", plan.key.code)))?;
        let subject_id = subject.id;
        let created = subject_id == new_id;

        let link = if linked_to.is_some() {
            LinkOutcome::AlreadyLinked
        } else {
            let owner: Option<Uuid> = sqlx::query_scalar(
                "SELECT id FROM descriptor_files WHERE subject_id = $1 AND id <> $2 LIMIT 1",
            )
            .bind(subject_id)
            .bind(document_id)
            .fetch_optional(&mut *tx)
            .await?;
            if let Some(existing_document) = owner {
                tx.rollback().await?;
                info!(
                    descriptor_id = %document_id,
                    %subject_id,
                    %existing_document,
                    "subject already has a descriptor"
                );
                return Ok(ApplyOutcome {
                    subject_id,
                    link: LinkOutcome::Conflict { existing_document },
                    report: Default::default(),
                });
            }
            LinkOutcome::Linked
        };

        let existing = if created {
            None
        } else {
            Some(Self::load_aggregate(&mut tx, subject).await?)
        };
        let (aggregate, report) = merge_aggregate(existing, plan, new_id);
        Self::write_aggregate(&mut tx, &aggregate).await?;

        if link == LinkOutcome::Linked {
            sqlx::query(
                "UPDATE descriptor_files SET subject_id = $2, updated_at = NOW() WHERE id = $1",
            )
            .bind(document_id)
            .bind(subject_id)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;

        Ok(ApplyOutcome {
            subject_id,
            link,
            report,
        })
    }

    async fn restore_subject(&self, snapshot: &Subject) -> Result<(), StoreError> {
        let result = sqlx::query(
            "UPDATE subjects
             SET section = $2, name = $3, area = $4, semester = $5, campus = $6, hours = $7,
                 api_type = $8, updated_at = NOW()
             WHERE id = $1",
        )
        .bind(snapshot.id)
        .bind(&snapshot.section)
        .bind(&snapshot.name)
        .bind(&snapshot.area)
        .bind(&snapshot.semester)
        .bind(&snapshot.campus)
        .bind(snapshot.hours)
        .bind(snapshot.api_type)
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            return Err(StoreError::SubjectNotFound(snapshot.id));
        }
        Ok(())
    }
}
