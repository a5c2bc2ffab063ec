//! Background processing: the periodic worker that advances extraction,
//! pattern detection, and predictions; the proactive trigger service; and
//! the one-shot onboarding orchestrator.

pub mod onboarding;
pub mod proactive;
pub mod worker;

use std::sync::Arc;

use engram_config::EngineConfig;
use engram_core::resolver::IdentityResolver;
use engram_extract::{Embedder, FactExtractor, IdentityArbiter};
use engram_store::{Database, VectorIndex};

pub use onboarding::{
    OnboardingReport, onboarding_completed_at, reset_onboarding, run_onboarding,
};
pub use proactive::{
    acceptance_rate, acknowledge_trigger, pending_triggers, run_proactive_scan,
    spawn_proactive_service,
};
pub use worker::{CycleReport, WorkerHandle, run_processing_cycle, spawn_processing_worker};

/// Everything a background cycle needs, shared between the worker loops and
/// the façade.
pub struct WorkerContext {
    pub db: Arc<Database>,
    pub vectors: Arc<VectorIndex>,
    pub resolver: IdentityResolver,
    pub extractor: Arc<dyn FactExtractor>,
    pub embedder: Option<Arc<dyn Embedder>>,
    pub arbiter: Option<Arc<dyn IdentityArbiter>>,
    pub config: EngineConfig,
}
