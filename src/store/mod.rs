//! Persistence seam for descriptors and the subject aggregate.

mod memory;
mod postgres;

pub use memory::MemoryStore;
pub use postgres::PgDescriptorStore;

use async_trait::async_trait;
use serde::Serialize;
use serde_json::Value;
use thiserror::Error;
use uuid::Uuid;

use crate::{
    models::{DescriptorDocument, DocumentStatus, Subject},
    reconcile::{ChangeReport, SubjectPlan},
};

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("descriptor {0} not found")]
    DocumentNotFound(Uuid),

    #[error("subject {0} not found")]
    SubjectNotFound(Uuid),

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("stored row is malformed: {0}")]
    Corrupt(String),
}

/// What happened to the document's subject link.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case", tag = "link")]
pub enum LinkOutcome {
    Linked,
    /// The document was linked before this run; the link is left alone.
    AlreadyLinked,
    /// Another document owns the subject; nothing was written.
    Conflict { existing_document: Uuid },
}

#[derive(Debug, Clone)]
pub struct ApplyOutcome {
    pub subject_id: Uuid,
    pub link: LinkOutcome,
    pub report: ChangeReport,
}

#[async_trait]
pub trait DescriptorStore: Send + Sync {
    async fn load_document(&self, id: Uuid) -> Result<Option<DescriptorDocument>, StoreError>;

    async fn cache_text(&self, id: Uuid, text: &str) -> Result<(), StoreError>;

    /// Writes the terminal status, the merged meta blob and `processed_at`.
    async fn finish_document(
        &self,
        id: Uuid,
        status: DocumentStatus,
        meta: &Value,
    ) -> Result<(), StoreError>;

    async fn delete_document(&self, id: Uuid) -> Result<(), StoreError>;

    async fn load_subject(&self, id: Uuid) -> Result<Option<Subject>, StoreError>;

    /// Upserts the subject by natural key, links the document, and fills the
    /// dependents, all in one atomic step.
    async fn apply_plan(&self, document_id: Uuid, plan: &SubjectPlan)
    -> Result<ApplyOutcome, StoreError>;

    /// Overwrites the subject row with `snapshot`.
    async fn restore_subject(&self, snapshot: &Subject) -> Result<(), StoreError>;
}
