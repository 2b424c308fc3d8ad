//! Per-document state machine.
//!
//! `identity -> {skip | light | full} -> normalize -> validate -> persist`,
//! ending in exactly one terminal [`DocumentStatus`] unless the model asked us
//! to back off, in which case the document is rescheduled untouched.

use std::{
    io::ErrorKind,
    path::{Path, PathBuf},
    sync::Arc,
    time::Duration,
};

use anyhow::{Context, Result};
use serde_json::{Map, Value, json};
use tokio::{fs as tokio_fs, task};
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::{
    config::PipelineConfig,
    extract::{
        catalog::map_area_name,
        identity::{CodeTrace, IdentityInput, ResolvedIdentity, SubjectIdentifier},
        normalize::{CanonicalPayload, normalize_payload, sub_form_missing},
        resolve::{choose_hours, normalize_code, resolve_area},
        schema::validate_payload,
        sections::{ExtractionMode, RateLimited, SectionExtractor, SectionNeeds, UsageReport},
        text::{TextExtractor, first_pages, normalize_pdf_text},
        units::{parse_unit_headings, segment_units},
    },
    llm::{LlmProvider, TextModel},
    models::{DescriptorDocument, DocumentStatus, Subject, SubjectKey, UNIT_NUMBERS},
    queue::TaskQueue,
    reconcile::{FieldOutcome, SubjectPlan, enrich_units},
    store::{DescriptorStore, LinkOutcome},
};

const CODE_NOT_FOUND: &str = "no es posible extraer el codigo de asignatura del pdf";
const CODE_MISMATCH: &str = "el descriptor no corresponde a la asignatura";
const LINKED_SUBJECT_SOURCE: &str = "linked_subject";

// Keys owned by a run; anything else an operator put in `meta` survives.
const RUN_META_KEYS: [&str; 9] = [
    "status",
    "error",
    "field_errors",
    "partial_persisted",
    "changes",
    "extract",
    "subject_id",
    "conflict_with",
    "ai",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunOutcome {
    Finished(DocumentStatus),
    /// The model was rate limited; the job runs again after the delay.
    Rescheduled(Duration),
    /// Skipped and removed along with its file.
    Deleted,
    Missing,
}

struct Run {
    outcome: RunOutcome,
    fresh_name: Option<String>,
    units_sum: Option<i64>,
}

impl Run {
    fn plain(outcome: RunOutcome) -> Self {
        Self {
            outcome,
            fresh_name: None,
            units_sum: None,
        }
    }
}

struct Identity {
    name: String,
    code: String,
    source: &'static str,
    validated: bool,
    code_trace: CodeTrace,
    // Extracted from this document rather than copied from a stored subject.
    fresh: bool,
}

impl From<ResolvedIdentity> for Identity {
    fn from(resolved: ResolvedIdentity) -> Self {
        Self {
            name: resolved.name,
            code: resolved.code,
            source: resolved.strategy.as_str(),
            validated: resolved.validated,
            code_trace: resolved.code_trace,
            fresh: true,
        }
    }
}

impl Identity {
    fn pinned(subject: &Subject, local: Option<ResolvedIdentity>) -> Self {
        match local.filter(|resolved| resolved.code.eq_ignore_ascii_case(&subject.code)) {
            Some(resolved) => Self {
                code: subject.code.clone(),
                ..Self::from(resolved)
            },
            None => Self {
                name: subject.name.clone(),
                code: subject.code.clone(),
                source: LINKED_SUBJECT_SOURCE,
                validated: true,
                code_trace: CodeTrace {
                    chosen_code: Some(subject.code.clone()),
                    appeared_in_text: true,
                    ..CodeTrace::default()
                },
                fresh: false,
            },
        }
    }

    fn to_value(&self) -> Value {
        json!({
            "name": self.name,
            "code": self.code,
            "strategy": self.source,
            "validated": self.validated,
            "code_trace": self.code_trace,
        })
    }
}

#[derive(Clone)]
pub struct Pipeline {
    config: Arc<PipelineConfig>,
    store: Arc<dyn DescriptorStore>,
    queue: Arc<dyn TaskQueue>,
    extractor: Arc<dyn TextExtractor>,
    sections: SectionExtractor,
    identifier: SubjectIdentifier,
}

impl Pipeline {
    pub fn new(
        config: Arc<PipelineConfig>,
        store: Arc<dyn DescriptorStore>,
        queue: Arc<dyn TaskQueue>,
        extractor: Arc<dyn TextExtractor>,
        model: Arc<dyn TextModel>,
    ) -> Self {
        let identifier = SubjectIdentifier::new(config.uppercase_codes, config.titlecase_names);
        Self {
            config,
            store,
            queue,
            extractor,
            sections: SectionExtractor::new(model),
            identifier,
        }
    }

    /// Runs one descriptor. Failures inside the run end in
    /// [`DocumentStatus::Error`]; only a failure to record that is returned.
    ///
    /// An existing link is never moved: if a rerun resolves to another
    /// subject, that subject is filled and the document keeps its old link.
    /// Use [`Pipeline::process_strict`] to stay on the linked subject.
    pub async fn process(&self, descriptor_id: Uuid) -> Result<RunOutcome> {
        let Some(document) = self.load(descriptor_id).await? else {
            return Ok(RunOutcome::Missing);
        };

        match self.run(&document).await {
            Ok(run) => Ok(run.outcome),
            Err(err) => self.fail(&document, err).await,
        }
    }

    /// Reprocesses a descriptor that already belongs to a subject, refusing
    /// documents whose stated code is not the subject's.
    pub async fn process_strict(&self, descriptor_id: Uuid) -> Result<RunOutcome> {
        let Some(document) = self.load(descriptor_id).await? else {
            return Ok(RunOutcome::Missing);
        };

        match self.run_strict(&document).await {
            Ok(outcome) => Ok(outcome),
            Err(err) => self.fail(&document, err).await,
        }
    }

    async fn load(&self, descriptor_id: Uuid) -> Result<Option<DescriptorDocument>> {
        let document = self
            .store
            .load_document(descriptor_id)
            .await
            .context("failed to load descriptor")?;
        if document.is_none() {
            warn!(%descriptor_id, "descriptor not found");
        }
        Ok(document)
    }

    async fn run(&self, document: &DescriptorDocument) -> Result<Run> {
        let text = self.document_text(document).await?;
        self.run_with_text(document, &text, None).await
    }

    async fn run_strict(&self, document: &DescriptorDocument) -> Result<RunOutcome> {
        let subject = match document.subject_id {
            Some(subject_id) => self
                .store
                .load_subject(subject_id)
                .await
                .context("failed to load linked subject")?,
            None => None,
        };
        let Some(subject) = subject else {
            return Ok(self.run(document).await?.outcome);
        };

        let text = self.document_text(document).await?;
        let file_name = identity_file_name(document);
        let input = IdentityInput {
            file_name: &file_name,
            first_pages: first_pages(&text, self.config.first_pages_chars),
            full_text: &text,
        };

        let Some(code) = self.identifier.code_for_subject(&subject.name, &input) else {
            return self.reject(document, CODE_NOT_FOUND).await;
        };
        let expected = normalize_code(&subject.code, self.config.uppercase_codes).unwrap_or_default();
        if !code.eq_ignore_ascii_case(&expected) {
            warn!(descriptor_id = %document.id, found = %code, %expected, "descriptor code does not match its subject");
            return self.reject(document, CODE_MISMATCH).await;
        }

        let snapshot = subject.clone();
        let run = self.run_with_text(document, &text, Some(&subject)).await?;
        if matches!(
            run.outcome,
            RunOutcome::Finished(DocumentStatus::Ok | DocumentStatus::InvalidSchema)
        ) {
            let mut restored = snapshot;
            if let Some(name) = run.fresh_name.filter(|name| !name.trim().is_empty()) {
                restored.name = name;
            }
            if let Some(sum) = run.units_sum.and_then(|sum| i32::try_from(sum).ok()) {
                restored.hours = Some(sum);
            }
            self.store
                .restore_subject(&restored)
                .await
                .context("failed to restore subject fields")?;
        }
        Ok(run.outcome)
    }

    async fn run_with_text(
        &self,
        document: &DescriptorDocument,
        text: &str,
        pinned: Option<&Subject>,
    ) -> Result<Run> {
        let descriptor_id = document.id;
        let file_name = identity_file_name(document);
        let input = IdentityInput {
            file_name: &file_name,
            first_pages: first_pages(text, self.config.first_pages_chars),
            full_text: text,
        };

        let mut meta = base_meta(document);
        meta.insert("text_chars".into(), json!(text.chars().count()));

        let local = self.identifier.resolve(&input);
        if let Some(resolved) = &local {
            info!(
                %descriptor_id,
                strategy = resolved.strategy.as_str(),
                code = %resolved.code,
                validated = resolved.validated,
                "subject identity resolved"
            );
        }

        let identity = match (pinned, local) {
            (Some(subject), local) => Identity::pinned(subject, local),
            (None, Some(resolved)) => Identity::from(resolved),
            (None, None) => {
                if self.sections.provider() != LlmProvider::Disabled && !text.trim().is_empty() {
                    return self.run_full(document, text, &input, meta).await;
                }
                return self.skip(document, meta).await.map(Run::plain);
            }
        };

        self.run_light(document, text, identity, pinned, meta).await
    }

    async fn run_light(
        &self,
        document: &DescriptorDocument,
        text: &str,
        identity: Identity,
        pinned: Option<&Subject>,
        mut meta: Map<String, Value>,
    ) -> Result<Run> {
        let descriptor_id = document.id;
        let defaults = &self.config.defaults;
        meta.insert("extract".into(), json!(identity.source));

        // Early pass: attach the subject before the slow model call. Hours are
        // left unset so the final choice can still fill them.
        let (heuristic_units, _) = enrich_units(
            Vec::new(),
            &segment_units(text),
            &parse_unit_headings(&normalize_pdf_text(text)),
        );
        let (area, _) = resolve_area(
            Some(&identity.name),
            Some(&identity.code),
            None,
            &defaults.area,
        );
        let early = SubjectPlan::new(
            self.subject_key(&identity.code, pinned),
            identity.name.clone(),
            area,
            None,
            defaults,
        )
        .with_units(heuristic_units);

        let mut partial_persisted = false;
        match self.store.apply_plan(descriptor_id, &early).await {
            Ok(applied) => {
                if let LinkOutcome::Conflict { existing_document } = applied.link {
                    info!(
                        %descriptor_id,
                        subject_id = %applied.subject_id,
                        %existing_document,
                        "subject already has a descriptor"
                    );
                    meta.insert("subject_id".into(), json!(applied.subject_id));
                    meta.insert("conflict_with".into(), json!(existing_document));
                    meta.insert("partial_persisted".into(), json!(false));
                    return self
                        .finish(descriptor_id, DocumentStatus::ConflictExistingDescriptor, meta)
                        .await
                        .map(Run::plain);
                }
                partial_persisted = true;
            }
            Err(err) => warn!(?err, %descriptor_id, "early subject pass failed"),
        }
        meta.insert("partial_persisted".into(), json!(partial_persisted));

        let reply = match self.sections.light(text, SectionNeeds::all()).await {
            Ok(reply) => reply,
            Err(limited) => return self.reschedule(descriptor_id, limited).await.map(Run::plain),
        };
        let mut usage = vec![reply.usage];
        let mut payload = normalize_payload(&reply.payload);
        if let Err(limited) = self.fill_missing_sections(text, &mut payload, &mut usage).await {
            return self.reschedule(descriptor_id, limited).await.map(Run::plain);
        }

        self.persist(
            document,
            text,
            identity,
            payload,
            usage,
            ExtractionMode::LightSections,
            pinned,
            meta,
        )
        .await
    }

    async fn run_full(
        &self,
        document: &DescriptorDocument,
        text: &str,
        input: &IdentityInput<'_>,
        mut meta: Map<String, Value>,
    ) -> Result<Run> {
        let descriptor_id = document.id;

        let reply = match self.sections.full(text).await {
            Ok(reply) => reply,
            Err(limited) => return self.reschedule(descriptor_id, limited).await.map(Run::plain),
        };
        let mut usage = vec![reply.usage];
        let mut payload = normalize_payload(&reply.payload);

        let declared = payload.subject.clone().unwrap_or_default();
        let confirmed = match (declared.name.as_deref(), declared.code.as_deref()) {
            (Some(name), Some(code)) => self.identifier.confirm_model_candidate(name, code, input),
            _ => None,
        };
        let Some(resolved) = confirmed else {
            warn!(%descriptor_id, name = ?declared.name, code = ?declared.code, "model identity has no support in the text");
            meta.insert("ai".into(), json!({ "path": ExtractionMode::Full.as_str(), "usage": usage }));
            return self.skip(document, meta).await.map(Run::plain);
        };
        info!(%descriptor_id, code = %resolved.code, "subject identity confirmed from model output");
        meta.insert("extract".into(), json!(resolved.strategy.as_str()));

        if let Err(limited) = self.fill_missing_sections(text, &mut payload, &mut usage).await {
            return self.reschedule(descriptor_id, limited).await.map(Run::plain);
        }

        self.persist(
            document,
            text,
            Identity::from(resolved),
            payload,
            usage,
            ExtractionMode::Full,
            None,
            meta,
        )
        .await
    }

    /// Second light call for the blocks the first reply left out.
    async fn fill_missing_sections(
        &self,
        text: &str,
        payload: &mut CanonicalPayload,
        usage: &mut Vec<UsageReport>,
    ) -> Result<(), RateLimited> {
        if !payload.missing_sections() {
            return Ok(());
        }
        let needs = SectionNeeds {
            boundary: sub_form_missing(&payload.company_boundary_condition),
            api2: sub_form_missing(&payload.api_type_2_completion),
            api3: sub_form_missing(&payload.api_type_3_completion),
            competencies: payload.technical_competencies.is_empty(),
        };
        let second = self.sections.light(text, needs).await?;
        payload.fill_missing_from(normalize_payload(&second.payload));
        usage.push(second.usage);
        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    async fn persist(
        &self,
        document: &DescriptorDocument,
        text: &str,
        identity: Identity,
        mut payload: CanonicalPayload,
        usage: Vec<UsageReport>,
        mode: ExtractionMode,
        pinned: Option<&Subject>,
        mut meta: Map<String, Value>,
    ) -> Result<Run> {
        let descriptor_id = document.id;
        let defaults = &self.config.defaults;

        let model_area = payload.subject.as_ref().and_then(|block| block.area.clone());
        let model_hours = payload.subject.as_ref().and_then(|block| block.hours);
        let (area, area_source) = resolve_area(
            Some(&identity.name),
            Some(&identity.code),
            model_area.as_deref(),
            &defaults.area,
        );
        {
            let block = payload.subject_mut();
            block.name = Some(identity.name.clone());
            block.code = Some(identity.code.clone());
            block.area = Some(
                model_area
                    .as_deref()
                    .map(|raw| map_area_name(raw, &defaults.area))
                    .unwrap_or_else(|| area.clone()),
            );
        }

        let schema = validate_payload(&payload.to_value());
        if !schema.valid {
            warn!(%descriptor_id, errors = ?schema.errors, "payload failed schema validation");
        }

        let provided = payload.subject_units.len();
        let (units, enriched) = enrich_units(
            payload.subject_units.clone(),
            &segment_units(text),
            &parse_unit_headings(&normalize_pdf_text(text)),
        );
        let unit_hours: Vec<Option<i32>> = units
            .iter()
            .filter(|unit| UNIT_NUMBERS.contains(&unit.number))
            .map(|unit| unit.unit_hours)
            .collect();
        let hours = choose_hours(model_hours, &unit_hours, text, defaults.hours);
        if let Some(disagreement) = &hours.disagreement {
            warn!(%descriptor_id, %disagreement, "declared hours disagree with unit hours");
        }

        let plan = SubjectPlan::new(
            self.subject_key(&identity.code, pinned),
            identity.name.clone(),
            area.clone(),
            Some(hours.chosen),
            defaults,
        )
        .with_sections(&payload)
        .with_units(units);
        let saved = plan
            .units
            .iter()
            .filter(|unit| UNIT_NUMBERS.contains(&unit.number))
            .count();

        let applied = self
            .store
            .apply_plan(descriptor_id, &plan)
            .await
            .context("failed to persist subject aggregate")?;
        info!(
            %descriptor_id,
            subject_id = %applied.subject_id,
            filled = applied.report.count(&FieldOutcome::Filled),
            kept = applied.report.count(&FieldOutcome::Kept),
            "subject aggregate reconciled"
        );

        let field_errors: Vec<Value> = applied
            .report
            .errors()
            .into_iter()
            .map(|change| json!(change))
            .collect();
        if !field_errors.is_empty() {
            warn!(%descriptor_id, count = field_errors.len(), "some fields could not be written");
        }

        meta.insert(
            "ai".into(),
            json!({
                "schema_version": self.config.schema_version,
                "model": self.sections.model_name(),
                "provider": self.sections.provider(),
                "path": mode.as_str(),
                "usage": usage,
                "identity": identity.to_value(),
                "area": { "value": area, "source": area_source },
                "hours_trace": hours,
                "units": {
                    "provided": provided,
                    "sum_unit_hours": hours.units_sum,
                    "parsed_hours": hours.parsed_from_text,
                    "enriched_from_pdf": enriched,
                    "hours_found": unit_hours.iter().any(Option::is_some),
                    "saved": saved,
                },
                "payload": payload.to_value(),
            }),
        );
        meta.insert("subject_id".into(), json!(applied.subject_id));
        meta.insert("changes".into(), json!(applied.report));
        meta.insert("error".into(), json!(schema.summary()));
        if !field_errors.is_empty() {
            meta.insert("field_errors".into(), Value::Array(field_errors));
        }

        let status = match applied.link {
            LinkOutcome::Conflict { existing_document } => {
                info!(
                    %descriptor_id,
                    subject_id = %applied.subject_id,
                    %existing_document,
                    "subject already has a descriptor"
                );
                meta.insert("conflict_with".into(), json!(existing_document));
                DocumentStatus::ConflictExistingDescriptor
            }
            _ if !schema.valid => DocumentStatus::InvalidSchema,
            _ => DocumentStatus::Ok,
        };

        let outcome = self.finish(descriptor_id, status, meta).await?;
        Ok(Run {
            outcome,
            fresh_name: identity.fresh.then_some(identity.name),
            units_sum: hours.units_sum,
        })
    }

    fn subject_key(&self, code: &str, pinned: Option<&Subject>) -> SubjectKey {
        match pinned {
            Some(subject) => SubjectKey {
                code: subject.code.clone(),
                section: subject.section.clone(),
                period: subject.period.clone(),
            },
            None => SubjectKey {
                code: code.to_string(),
                section: self.config.defaults.section.clone(),
                period: self.config.defaults.period.clone(),
            },
        }
    }

    async fn document_text(&self, document: &DescriptorDocument) -> Result<String> {
        if !document.text_cache.trim().is_empty() {
            return Ok(document.text_cache.clone());
        }

        let extractor = self.extractor.clone();
        let path = PathBuf::from(&document.file_path);
        let max_chars = self.config.max_text_chars;
        let text = task::spawn_blocking(move || extractor.extract(&path, max_chars))
            .await
            .context("PDF reader thread panicked")?;

        if text.trim().is_empty() {
            warn!(descriptor_id = %document.id, reader = self.extractor.name(), "descriptor has no extractable text");
        } else {
            self.store
                .cache_text(document.id, &text)
                .await
                .context("failed to cache descriptor text")?;
        }
        Ok(text)
    }

    async fn skip(&self, document: &DescriptorDocument, meta: Map<String, Value>) -> Result<RunOutcome> {
        let descriptor_id = document.id;
        warn!(%descriptor_id, file = %document.original_filename, "subject could not be identified");

        if !self.config.delete_on_skip {
            return self
                .finish(descriptor_id, DocumentStatus::SkippedMissingSubject, meta)
                .await;
        }

        if !document.file_path.is_empty() {
            match tokio_fs::remove_file(&document.file_path).await {
                Ok(()) => {}
                Err(err) if err.kind() == ErrorKind::NotFound => {}
                Err(err) => warn!(?err, %descriptor_id, "failed to remove skipped descriptor file"),
            }
        }
        self.store
            .delete_document(descriptor_id)
            .await
            .context("failed to delete skipped descriptor")?;
        info!(%descriptor_id, status = %DocumentStatus::SkippedMissingSubject, "descriptor removed");
        Ok(RunOutcome::Deleted)
    }

    async fn reschedule(&self, descriptor_id: Uuid, limited: RateLimited) -> Result<RunOutcome> {
        let delay = limited.retry_after.unwrap_or(self.config.rate_limit_retry);
        warn!(
            %descriptor_id,
            delay_secs = delay.as_secs(),
            model = %limited.usage.model,
            "model rate limited, rescheduling"
        );
        self.queue
            .enqueue_after(descriptor_id, delay)
            .await
            .context("failed to reschedule descriptor")?;
        Ok(RunOutcome::Rescheduled(delay))
    }

    async fn reject(&self, document: &DescriptorDocument, message: &str) -> Result<RunOutcome> {
        let mut meta = base_meta(document);
        meta.insert("error".into(), json!(message));
        self.finish(document.id, DocumentStatus::Error, meta).await
    }

    async fn fail(&self, document: &DescriptorDocument, err: anyhow::Error) -> Result<RunOutcome> {
        let descriptor_id = document.id;
        error!(?err, %descriptor_id, "descriptor processing failed");

        let mut meta = base_meta(document);
        meta.insert("error".into(), json!(format!("{err:#}")));
        self.finish(descriptor_id, DocumentStatus::Error, meta)
            .await
            .context("failed to record descriptor error")
    }

    async fn finish(
        &self,
        descriptor_id: Uuid,
        status: DocumentStatus,
        mut meta: Map<String, Value>,
    ) -> Result<RunOutcome> {
        meta.insert("status".into(), json!(status.as_str()));
        self.store
            .finish_document(descriptor_id, status, &Value::Object(meta))
            .await
            .context("failed to write descriptor status")?;
        info!(%descriptor_id, %status, "descriptor processed");
        Ok(RunOutcome::Finished(status))
    }
}

fn base_meta(document: &DescriptorDocument) -> Map<String, Value> {
    let mut meta = document.meta.as_object().cloned().unwrap_or_default();
    for key in RUN_META_KEYS {
        meta.remove(key);
    }
    meta
}

// Stored file name, which is what the file-name strategy reads.
fn identity_file_name(document: &DescriptorDocument) -> String {
    Path::new(&document.file_path)
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .filter(|name| !name.trim().is_empty())
        .unwrap_or_else(|| document.original_filename.clone())
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use super::*;
    use crate::{
        llm::{LlmError, testing::ScriptedModel},
        models::{SubjectAggregate, SubjectUnit},
        queue::MemoryQueue,
        store::MemoryStore,
    };

    const TITULO_FILE: &str = "Taller de Titulo (TIHI43).pdf";
    const LIGHT_REPLY: &str = r#"{
        "technical_competencies": [{"number": 1, "description": "Diseña soluciones de software"}],
        "company_boundary_condition": {
            "company_type_description": "Empresa de servicios TI",
            "company_requirements_for_level_2_3": "Equipo de desarrollo propio",
            "project_minimum_elements": "Prototipo funcional"
        },
        "api_type_2_completion": {
            "project_goal_students": "Resolver un problema real",
            "deliverables_at_end": "Informe final",
            "company_expected_participation": "Reuniones quincenales",
            "other_activities": "Visita a terreno"
        }
    }"#;

    struct FixedText(String);

    impl TextExtractor for FixedText {
        fn extract(&self, _path: &Path, _max_chars: usize) -> String {
            self.0.clone()
        }

        fn name(&self) -> &'static str {
            "fixed"
        }
    }

    struct Harness {
        pipeline: Pipeline,
        store: Arc<MemoryStore>,
        queue: Arc<MemoryQueue>,
        model: Arc<ScriptedModel>,
    }

    fn harness(text: &str, replies: Vec<Result<String, LlmError>>) -> Harness {
        harness_with(PipelineConfig::default(), text, replies)
    }

    fn harness_with(
        config: PipelineConfig,
        text: &str,
        replies: Vec<Result<String, LlmError>>,
    ) -> Harness {
        let store = Arc::new(MemoryStore::new());
        let queue = Arc::new(MemoryQueue::new());
        let model = Arc::new(ScriptedModel::new(replies));
        let pipeline = Pipeline::new(
            Arc::new(config),
            store.clone(),
            queue.clone(),
            Arc::new(FixedText(text.to_string())),
            model.clone(),
        );
        Harness {
            pipeline,
            store,
            queue,
            model,
        }
    }

    fn upload(store: &MemoryStore, file_name: &str) -> Uuid {
        store
            .insert_document(DescriptorDocument::new(file_name, file_name))
            .unwrap()
    }

    fn meta(store: &MemoryStore, id: Uuid) -> Value {
        store.document(id).unwrap().meta
    }

    fn linked_subject(store: &MemoryStore, id: Uuid) -> SubjectAggregate {
        let subject_id = store.document(id).unwrap().subject_id.unwrap();
        store.aggregate(subject_id).unwrap()
    }

    fn titulo_subject(section: &str) -> Subject {
        Subject {
            id: Uuid::new_v4(),
            code: "TIHI43".into(),
            section: section.into(),
            period: String::new(),
            name: "Taller Antiguo".into(),
            area: "Informatica".into(),
            semester: "Quinto".into(),
            campus: "santiago".into(),
            hours: Some(10),
            api_type: 3,
        }
    }

    #[tokio::test]
    async fn hours_fall_back_to_the_text() {
        let text = "Programa de asignatura TIHI43\nDuración del curso: 54 horas cronológicas";
        let h = harness(text, vec![Ok(LIGHT_REPLY.to_string())]);
        let id = upload(&h.store, TITULO_FILE);

        let outcome = h.pipeline.process(id).await.unwrap();

        assert_eq!(outcome, RunOutcome::Finished(DocumentStatus::Ok));
        let aggregate = linked_subject(&h.store, id);
        assert_eq!(aggregate.subject.hours, Some(54));
        assert_eq!(aggregate.subject.code, "TIHI43");
        assert_eq!(aggregate.competencies.len(), 1);
        assert!(aggregate.boundary.is_some());
        let meta = meta(&h.store, id);
        assert_eq!(meta["ai"]["hours_trace"]["source"], "text");
        assert_eq!(meta["status"], "ok");
    }

    #[tokio::test]
    async fn configured_default_hours_do_not_shadow_text_hours() {
        let config = PipelineConfig::from_lookup(|key| {
            (key == "DEFAULT_SUBJECT_HOURS").then(|| "30".to_string())
        });
        let text = "Programa de asignatura TIHI43\nDuración del curso: 54 horas cronológicas";
        let h = harness_with(config, text, vec![Ok(LIGHT_REPLY.to_string())]);
        let id = upload(&h.store, TITULO_FILE);

        h.pipeline.process(id).await.unwrap();

        assert_eq!(linked_subject(&h.store, id).subject.hours, Some(54));
        let meta = meta(&h.store, id);
        assert_eq!(meta["ai"]["hours_trace"]["chosen"], 54);
        assert!(meta["changes"]["changes"].as_array().unwrap().iter().any(|change| {
            change["field"] == "subject.hours" && change["outcome"] == "filled"
        }));
    }

    #[tokio::test]
    async fn default_hours_fill_when_nothing_else_is_found() {
        let config = PipelineConfig::from_lookup(|key| {
            (key == "DEFAULT_SUBJECT_HOURS").then(|| "30".to_string())
        });
        let h = harness_with(
            config,
            "Programa de asignatura TIHI43",
            vec![Ok(LIGHT_REPLY.to_string())],
        );
        let id = upload(&h.store, TITULO_FILE);

        h.pipeline.process(id).await.unwrap();

        assert_eq!(linked_subject(&h.store, id).subject.hours, Some(30));
        assert_eq!(meta(&h.store, id)["ai"]["hours_trace"]["source"], "default");
    }

    #[tokio::test]
    async fn light_path_asks_again_for_missing_sections() {
        let partial = r#"{"technical_competencies": [{"number": 1, "description": "Diseña soluciones"}]}"#;
        let h = harness(
            "Programa de asignatura TIHI43",
            vec![Ok(partial.to_string()), Ok(LIGHT_REPLY.to_string())],
        );
        let id = upload(&h.store, TITULO_FILE);

        let outcome = h.pipeline.process(id).await.unwrap();

        assert_eq!(outcome, RunOutcome::Finished(DocumentStatus::Ok));
        assert_eq!(h.model.calls(), 2);
        let second_prompt = h.model.prompts()[1].clone();
        assert!(!second_prompt.contains("- technical_competencies:"));
        assert!(second_prompt.contains("- company_boundary_condition:"));
        let aggregate = linked_subject(&h.store, id);
        assert_eq!(
            aggregate.competencies[&1].description,
            "Diseña soluciones"
        );
        assert!(aggregate.boundary.is_some());
        assert!(aggregate.api2.is_some());
        assert_eq!(meta(&h.store, id)["ai"]["usage"].as_array().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn rate_limit_on_the_second_sections_call_reschedules() {
        let h = harness(
            "Programa de asignatura TIHI43",
            vec![
                Ok("{}".to_string()),
                Err(LlmError::RateLimited { retry_after: None }),
            ],
        );
        let id = upload(&h.store, TITULO_FILE);

        let outcome = h.pipeline.process(id).await.unwrap();

        let retry = PipelineConfig::default().rate_limit_retry;
        assert_eq!(outcome, RunOutcome::Rescheduled(retry));
        assert_eq!(h.queue.scheduled(), vec![(id, retry)]);
        assert_eq!(h.store.document(id).unwrap().status, None);
    }

    #[tokio::test]
    async fn rerun_on_another_subject_keeps_the_existing_link() {
        let h = harness(
            "Programa de asignatura TIHI43",
            vec![Ok(LIGHT_REPLY.to_string())],
        );
        let previous = Subject {
            code: "ADM210".into(),
            name: "Plan de Negocios".into(),
            ..titulo_subject("1")
        };
        h.store.put_aggregate(SubjectAggregate::new(previous.clone())).unwrap();
        let mut document = DescriptorDocument::new(TITULO_FILE, TITULO_FILE);
        document.subject_id = Some(previous.id);
        let id = h.store.insert_document(document).unwrap();

        let outcome = h.pipeline.process(id).await.unwrap();

        assert_eq!(outcome, RunOutcome::Finished(DocumentStatus::Ok));
        assert_eq!(h.store.document(id).unwrap().subject_id, Some(previous.id));
        let filled_id = meta(&h.store, id)["subject_id"].clone();
        assert_ne!(filled_id, json!(previous.id));
        assert_eq!(h.store.subject_count(), 2);
    }

    #[tokio::test]
    async fn file_name_identity_skips_the_model_identity_call() {
        let h = harness(
            "Programa de asignatura TIHI43",
            vec![Ok(LIGHT_REPLY.to_string())],
        );
        let id = upload(&h.store, TITULO_FILE);

        h.pipeline.process(id).await.unwrap();

        assert_eq!(h.model.calls(), 1);
        assert!(!h.model.prompts()[0].contains("- subject: objeto"));
        let meta = meta(&h.store, id);
        assert_eq!(meta["extract"], "file_name");
        assert_eq!(meta["ai"]["path"], "light_sections");
    }

    #[tokio::test]
    async fn second_descriptor_for_a_subject_conflicts() {
        let h = harness(
            "Programa de asignatura TIHI43",
            vec![Ok(LIGHT_REPLY.to_string())],
        );
        let first = upload(&h.store, TITULO_FILE);
        let second = upload(&h.store, TITULO_FILE);

        h.pipeline.process(first).await.unwrap();
        let outcome = h.pipeline.process(second).await.unwrap();

        assert_eq!(
            outcome,
            RunOutcome::Finished(DocumentStatus::ConflictExistingDescriptor)
        );
        let subject_id = h.store.document(first).unwrap().subject_id.unwrap();
        let loser = h.store.document(second).unwrap();
        assert_eq!(loser.subject_id, None);
        assert_eq!(loser.meta["subject_id"], json!(subject_id));
        assert_eq!(h.store.subject_count(), 1);
        assert_eq!(h.model.calls(), 1);
    }

    #[tokio::test]
    async fn populated_expected_learning_is_kept() {
        let text = "Programa Taller de Titulo TIHI43\nUnidad 1: Fundamentos de redes";
        let h = harness(text, vec![]);

        let subject = Subject {
            name: "Taller De Titulo".into(),
            hours: None,
            ..titulo_subject("1")
        };
        let mut existing = SubjectAggregate::new(subject.clone());
        existing.units = BTreeMap::from([(
            1,
            SubjectUnit {
                expected_learning: Some("Analiza requerimientos de sistemas".into()),
                ..SubjectUnit::numbered(1)
            },
        )]);
        h.store.put_aggregate(existing).unwrap();
        let id = upload(&h.store, TITULO_FILE);

        h.pipeline.process(id).await.unwrap();

        let aggregate = h.store.aggregate(subject.id).unwrap();
        assert_eq!(
            aggregate.units[&1].expected_learning.as_deref(),
            Some("Analiza requerimientos de sistemas")
        );
        assert_eq!(aggregate.subject.campus, "santiago");
        let changes = meta(&h.store, id)["changes"]["changes"].clone();
        assert!(!changes.as_array().unwrap().iter().any(|change| {
            change["field"] == "subject_units[1].expected_learning" && change["outcome"] == "filled"
        }));
    }

    #[tokio::test]
    async fn rerun_fills_nothing_new() {
        let text = "Programa de asignatura TIHI43\nDuración del curso: 54 horas cronológicas";
        let h = harness(
            text,
            vec![Ok(LIGHT_REPLY.to_string()), Ok(LIGHT_REPLY.to_string())],
        );
        let id = upload(&h.store, TITULO_FILE);

        h.pipeline.process(id).await.unwrap();
        let outcome = h.pipeline.process(id).await.unwrap();

        assert_eq!(outcome, RunOutcome::Finished(DocumentStatus::Ok));
        let changes = meta(&h.store, id)["changes"]["changes"].clone();
        let changes = changes.as_array().unwrap();
        assert!(!changes.is_empty());
        assert!(changes.iter().all(|change| change["outcome"] != "filled"));
        assert_eq!(h.store.subject_count(), 1);
    }

    #[tokio::test]
    async fn unidentifiable_blank_descriptor_is_deleted() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("scan.pdf");
        std::fs::write(&path, b"%PDF-1.4").unwrap();

        let h = harness("", vec![]);
        let id = h
            .store
            .insert_document(DescriptorDocument::new(
                path.to_string_lossy().into_owned(),
                "scan.pdf",
            ))
            .unwrap();

        let outcome = h.pipeline.process(id).await.unwrap();

        assert_eq!(outcome, RunOutcome::Deleted);
        assert!(h.store.document(id).is_none());
        assert!(!path.exists());
        assert_eq!(h.model.calls(), 0);
    }

    #[tokio::test]
    async fn skip_keeps_the_record_when_deletion_is_off() {
        let config = PipelineConfig::from_lookup(|key| {
            (key == "DESCRIPTORS_DELETE_ON_SKIP").then(|| "false".to_string())
        });
        let h = harness_with(config, "", vec![]);
        let id = upload(&h.store, "scan.pdf");

        let outcome = h.pipeline.process(id).await.unwrap();

        assert_eq!(
            outcome,
            RunOutcome::Finished(DocumentStatus::SkippedMissingSubject)
        );
        let document = h.store.document(id).unwrap();
        assert_eq!(document.status, Some(DocumentStatus::SkippedMissingSubject));
        assert!(document.processed_at.is_some());
    }

    #[tokio::test]
    async fn full_path_confirms_identity_and_asks_again_for_missing_sections() {
        let text = "RBT110 robótica móvil con sensores ultrasónicos, horas totales 80";
        let full = r#"{
            "subject": {"name": "Robótica Móvil", "code": "RBT110", "area": "electronica", "hours": "80"},
            "technical_competencies": ["Programa controladores embebidos"],
            "subject_units": [
                {"number": 1, "expected_learning": "Configura sensores", "unit_hours": 40},
                {"number": 2, "expected_learning": "Integra actuadores", "unit_hours": 40}
            ]
        }"#;
        let h = harness(
            text,
            vec![Ok(full.to_string()), Ok(LIGHT_REPLY.to_string())],
        );
        let id = upload(&h.store, "scan.pdf");

        let outcome = h.pipeline.process(id).await.unwrap();

        assert_eq!(outcome, RunOutcome::Finished(DocumentStatus::Ok));
        assert_eq!(h.model.calls(), 2);
        let aggregate = linked_subject(&h.store, id);
        assert_eq!(aggregate.subject.code, "RBT110");
        assert_eq!(aggregate.subject.hours, Some(80));
        assert_eq!(aggregate.units.len(), 2);
        assert_eq!(aggregate.competencies.len(), 1);
        assert!(aggregate.boundary.is_some());
        let meta = meta(&h.store, id);
        assert_eq!(meta["extract"], "model");
        assert_eq!(meta["ai"]["path"], "full");
        assert_eq!(meta["ai"]["area"]["source"], "model");
        assert_eq!(meta["ai"]["usage"].as_array().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn out_of_range_items_are_not_persisted() {
        let text = "RBT110 robótica móvil con sensores ultrasónicos, horas totales 80";
        let full = r#"{
            "subject": {"name": "Robótica Móvil", "code": "RBT110", "hours": 80},
            "technical_competencies": [
                {"number": 7, "description": "Fuera de rango"},
                {"number": 2, "description": "Integra sistemas"}
            ],
            "subject_units": [{"number": 6, "expected_learning": "Unidad extra"}]
        }"#;
        let h = harness(text, vec![Ok(full.to_string())]);
        let id = upload(&h.store, "scan.pdf");

        let outcome = h.pipeline.process(id).await.unwrap();

        assert_eq!(outcome, RunOutcome::Finished(DocumentStatus::InvalidSchema));
        let aggregate = linked_subject(&h.store, id);
        assert_eq!(aggregate.competencies.keys().copied().collect::<Vec<_>>(), vec![2]);
        assert!(aggregate.units.keys().all(|number| UNIT_NUMBERS.contains(number)));
        assert!(meta(&h.store, id)["error"].is_string());
    }

    #[tokio::test]
    async fn rate_limit_reschedules_without_a_status() {
        let h = harness(
            "Programa de asignatura TIHI43",
            vec![Err(LlmError::RateLimited {
                retry_after: Some(Duration::from_secs(30)),
            })],
        );
        let id = upload(&h.store, TITULO_FILE);

        let outcome = h.pipeline.process(id).await.unwrap();

        assert_eq!(outcome, RunOutcome::Rescheduled(Duration::from_secs(30)));
        assert_eq!(h.queue.scheduled(), vec![(id, Duration::from_secs(30))]);
        assert_eq!(h.store.document(id).unwrap().status, None);
    }

    #[tokio::test]
    async fn strict_run_rejects_a_foreign_descriptor() {
        let h = harness("Programa Taller de Titulo TIHI43", vec![]);
        let subject = Subject {
            code: "ADM210".into(),
            name: "Plan de Negocios".into(),
            ..titulo_subject("1")
        };
        h.store.put_aggregate(SubjectAggregate::new(subject.clone())).unwrap();
        let mut document = DescriptorDocument::new(TITULO_FILE, TITULO_FILE);
        document.subject_id = Some(subject.id);
        let id = h.store.insert_document(document).unwrap();

        let outcome = h.pipeline.process_strict(id).await.unwrap();

        assert_eq!(outcome, RunOutcome::Finished(DocumentStatus::Error));
        assert_eq!(meta(&h.store, id)["error"], CODE_MISMATCH);
        assert_eq!(h.model.calls(), 0);
    }

    #[tokio::test]
    async fn strict_run_restores_operator_fields() {
        let text = "Programa Taller de Titulo TIHI43\nUnidad 1: Fundamentos\n20 horas\nUnidad 2: Integración\n30 horas";
        let h = harness(text, vec![Ok(LIGHT_REPLY.to_string())]);
        let subject = titulo_subject("2");
        h.store.put_aggregate(SubjectAggregate::new(subject.clone())).unwrap();
        let mut document = DescriptorDocument::new(TITULO_FILE, TITULO_FILE);
        document.subject_id = Some(subject.id);
        let id = h.store.insert_document(document).unwrap();

        let outcome = h.pipeline.process_strict(id).await.unwrap();

        assert_eq!(outcome, RunOutcome::Finished(DocumentStatus::Ok));
        assert_eq!(h.store.subject_count(), 1);
        let aggregate = h.store.aggregate(subject.id).unwrap();
        assert_eq!(aggregate.subject.section, "2");
        assert_eq!(aggregate.subject.campus, "santiago");
        assert_eq!(aggregate.subject.api_type, 3);
        assert_eq!(aggregate.subject.name, "Taller De Titulo");
        assert_eq!(aggregate.subject.hours, Some(50));
        assert_eq!(aggregate.competencies.len(), 1);
    }
}
