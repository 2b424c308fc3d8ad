use std::{env, sync::Arc};

use anyhow::{Context, Result};
use sqlx::postgres::PgPoolOptions;
use tracing::info;

use crate::{
    config::PipelineConfig,
    extract::text::PdfTextExtractor,
    llm::LlmClient,
    pipeline::Pipeline,
    queue::PgTaskQueue,
    store::PgDescriptorStore,
};

#[derive(Clone)]
pub struct AppState {
    config: Arc<PipelineConfig>,
    queue: PgTaskQueue,
    pipeline: Arc<Pipeline>,
}

impl AppState {
    pub async fn new() -> Result<Self> {
        let database_url = env::var("DATABASE_URL").context("DATABASE_URL env var is missing")?;

        let config = Arc::new(PipelineConfig::from_env());
        let llm_client =
            LlmClient::new(config.llm.clone()).context("failed to initialize LLM client")?;

        let pool = PgPoolOptions::new()
            .max_connections(10)
            .connect(&database_url)
            .await
            .context("failed to connect to Postgres")?;

        sqlx::migrate!("./migrations")
            .run(&pool)
            .await
            .context("failed to run database migrations")?;

        let queue = PgTaskQueue::new(pool.clone());
        let pipeline = Pipeline::new(
            config.clone(),
            Arc::new(PgDescriptorStore::new(pool.clone())),
            Arc::new(queue.clone()),
            Arc::new(PdfTextExtractor),
            Arc::new(llm_client),
        );

        info!(
            provider = %config.llm.provider,
            model = %config.llm.model,
            schema_version = %config.schema_version,
            "descriptor pipeline configured"
        );

        Ok(Self {
            config,
            queue,
            pipeline: Arc::new(pipeline),
        })
    }

    pub fn config(&self) -> Arc<PipelineConfig> {
        self.config.clone()
    }

    pub fn queue(&self) -> PgTaskQueue {
        self.queue.clone()
    }

    pub fn pipeline(&self) -> Arc<Pipeline> {
        self.pipeline.clone()
    }
}
