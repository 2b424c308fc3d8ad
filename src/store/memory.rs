use std::{
    collections::HashMap,
    sync::{Mutex, MutexGuard},
};

use async_trait::async_trait;
use chrono::Utc;
use serde_json::Value;
use uuid::Uuid;

use super::{ApplyOutcome, DescriptorStore, LinkOutcome, StoreError};
use crate::{
    models::{DescriptorDocument, DocumentStatus, Subject, SubjectAggregate, SubjectKey},
    reconcile::{SubjectPlan, merge_aggregate},
};

#[derive(Default)]
struct Inner {
    documents: HashMap<Uuid, DescriptorDocument>,
    aggregates: HashMap<Uuid, SubjectAggregate>,
    keys: HashMap<SubjectKey, Uuid>,
}

/// Process-local store with the same link and fill rules as Postgres.
#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<MutexGuard<'_, Inner>, StoreError> {
        self.inner
            .lock()
            .map_err(|_| StoreError::Corrupt("memory store lock poisoned".into()))
    }

    pub fn insert_document(&self, document: DescriptorDocument) -> Result<Uuid, StoreError> {
        let id = document.id;
        self.lock()?.documents.insert(id, document);
        Ok(id)
    }

    pub fn document(&self, id: Uuid) -> Option<DescriptorDocument> {
        self.lock().ok()?.documents.get(&id).cloned()
    }

    pub fn aggregate(&self, subject_id: Uuid) -> Option<SubjectAggregate> {
        self.lock().ok()?.aggregates.get(&subject_id).cloned()
    }

    pub fn subject_id_for(&self, key: &SubjectKey) -> Option<Uuid> {
        self.lock().ok()?.keys.get(key).copied()
    }

    pub fn subject_count(&self) -> usize {
        self.lock().map(|inner| inner.aggregates.len()).unwrap_or_default()
    }

    /// Stores an operator-edited aggregate as-is.
    pub fn put_aggregate(&self, aggregate: SubjectAggregate) -> Result<(), StoreError> {
        let mut inner = self.lock()?;
        inner.keys.insert(aggregate.subject.key(), aggregate.subject.id);
        inner.aggregates.insert(aggregate.subject.id, aggregate);
        Ok(())
    }
}

#[async_trait]
impl DescriptorStore for MemoryStore {
    async fn load_document(&self, id: Uuid) -> Result<Option<DescriptorDocument>, StoreError> {
        Ok(self.lock()?.documents.get(&id).cloned())
    }

    async fn cache_text(&self, id: Uuid, text: &str) -> Result<(), StoreError> {
        let mut inner = self.lock()?;
        let document = inner
            .documents
            .get_mut(&id)
            .ok_or(StoreError::DocumentNotFound(id))?;
        document.text_cache = text.to_string();
        Ok(())
    }

    async fn finish_document(
        &self,
        id: Uuid,
        status: DocumentStatus,
        meta: &Value,
    ) -> Result<(), StoreError> {
        let mut inner = self.lock()?;
        let document = inner
            .documents
            .get_mut(&id)
            .ok_or(StoreError::DocumentNotFound(id))?;
        document.status = Some(status);
        document.meta = meta.clone();
        document.processed_at = Some(Utc::now());
        Ok(())
    }

    async fn delete_document(&self, id: Uuid) -> Result<(), StoreError> {
        self.lock()?.documents.remove(&id);
        Ok(())
    }

    async fn load_subject(&self, id: Uuid) -> Result<Option<Subject>, StoreError> {
        Ok(self
            .lock()?
            .aggregates
            .get(&id)
            .map(|aggregate| aggregate.subject.clone()))
    }

    async fn apply_plan(
        &self,
        document_id: Uuid,
        plan: &SubjectPlan,
    ) -> Result<ApplyOutcome, StoreError> {
        let mut inner = self.lock()?;
        let linked_to = inner
            .documents
            .get(&document_id)
            .ok_or(StoreError::DocumentNotFound(document_id))?
            .subject_id;

        let existing_id = inner.keys.get(&plan.key).copied();
        let existing = existing_id.and_then(|id| inner.aggregates.get(&id).cloned());

        let link = match (linked_to, existing_id) {
            (Some(_), _) => LinkOutcome::AlreadyLinked,
            (None, Some(subject_id)) => match inner
                .documents
                .values()
                .find(|doc| doc.id != document_id && doc.subject_id == Some(subject_id))
            {
                Some(owner) => {
                    return Ok(ApplyOutcome {
                        subject_id,
                        link: LinkOutcome::Conflict {
                            existing_document: owner.id,
                        },
                        report: Default::default(),
                    });
                }
                None => LinkOutcome::Linked,
            },
            (None, None) => LinkOutcome::Linked,
        };

        let (aggregate, report) = merge_aggregate(existing, plan, Uuid::new_v4());
        let subject_id = aggregate.subject.id;
        inner.keys.insert(plan.key.clone(), subject_id);
        inner.aggregates.insert(subject_id, aggregate);
        if link == LinkOutcome::Linked {
            if let Some(document) = inner.documents.get_mut(&document_id) {
                document.subject_id = Some(subject_id);
            }
        }

        Ok(ApplyOutcome {
            subject_id,
            link,
            report,
        })
    }

    async fn restore_subject(&self, snapshot: &Subject) -> Result<(), StoreError> {
        let mut inner = self.lock()?;
        let aggregate = inner
            .aggregates
            .get_mut(&snapshot.id)
            .ok_or(StoreError::SubjectNotFound(snapshot.id))?;
        let previous_key = aggregate.subject.key();
        aggregate.subject = snapshot.clone();
        inner.keys.remove(&previous_key);
        inner.keys.insert(snapshot.key(), snapshot.id);
        Ok(())
    }
}
