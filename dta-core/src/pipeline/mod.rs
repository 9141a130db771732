//! DTA Pipeline Engine (C5) — see spec §4.5.

pub mod engine;
pub mod store;
pub mod types;

pub use engine::PipelineEngine;
pub use store::{delete_analysis_cascading, AnalysisStore};
pub use types::{Analysis, NoopRedactor, PipelineInput, Redactor, StageConfig, StageParams};
