pub mod config;
pub mod error;
pub mod io;
pub mod llm;
pub mod models;
pub mod stages;

pub use config::PipelineConfig;
pub use error::{PipelineError, StoreError, TransportFailure};
pub use io::{
    write_deliverables, JsonFileStore, LoggingObserver, MemoryStore, PipelineStore,
    ProgressObserver, ProgressUpdate, RecordingObserver,
};
pub use llm::{GenerationBackend, RetryPolicy, ScriptedBackend};
pub use models::{
    ProjectContext, ProjectRecord, ProjectStatus, StageCatalogue, StageResult, StageStatus,
};
pub use stages::{
    default_catalogue, BackendRegistry, ChecklistEngine, ConvergenceController, Orchestrator,
    RunReport, StageRunner,
};
