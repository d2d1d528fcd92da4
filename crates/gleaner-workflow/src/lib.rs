//! Resumable collection workflow.
//!
//! A run is planned once, then collected source by source across as many
//! short invocations as it takes. Each invocation works against a wall-clock
//! budget, checkpoints after every batch and, when time runs out, arms one
//! continuation timer and returns.
//!
//! ```text
//! ┌──────────────────────────── Orchestrator ─────────────────────────────┐
//! │  Planner ─► Plan                                                       │
//! │  CollectorRegistry ─► StageCollector ─► RetryExecutor ─► OutputSink    │
//! │                                       └──────────────► ArtifactStore   │
//! │  CheckpointStore (versioned RunState)                                  │
//! │  ContinuationScheduler ─► TimerHost (tokio / manual)                   │
//! └────────────────────────────────────────────────────────────────────────┘
//! ```

pub mod artifact;
pub mod budget;
pub mod collector;
pub mod error;
pub mod file_collector;
pub mod orchestrator;
pub mod planner;
pub mod retry;
pub mod scheduler;
pub mod scripted;
pub mod sink;
pub mod stage;

pub use artifact::{ArtifactStore, FsArtifactStore, MemoryArtifactStore};
pub use budget::Budget;
pub use collector::{CollectPage, CollectorRegistry, DEFAULT_TARGET, SourceInfo, StageCollector};
pub use error::{
    Result, SchedulerError, SourceError, SourceErrorKind, StageFailure, WorkflowError,
};
pub use file_collector::FileCollector;
pub use orchestrator::{
    Invocation, Orchestrator, OrchestratorBuilder, StartedRun, WorkflowSettings,
};
pub use planner::{FallbackPlanner, HeuristicPlanner, Planner};
pub use retry::{RetryExecutor, RetryPolicy, RetryPredicate, default_should_retry};
pub use scheduler::{
    ArmedTimer, CONTINUE_HANDLER, Continuation, ContinuationScheduler, ManualTimerHost,
    TimerHost, TokioTimerHost,
};
pub use scripted::{ScriptedCall, ScriptedCollector};
pub use sink::{JsonlSink, MemorySink, OutputSink, SinkHandle};
pub use stage::StageOutcome;
