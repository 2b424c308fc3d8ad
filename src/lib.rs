pub mod config;
pub mod extract;
pub mod llm;
pub mod models;
pub mod pipeline;
pub mod queue;
pub mod reconcile;
pub mod state;
pub mod store;

pub use config::PipelineConfig;
pub use pipeline::{Pipeline, RunOutcome};
pub use state::AppState;
