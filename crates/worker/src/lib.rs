//! Event-driven handler execution for one deployed application.
//!
//! A worker owns a single V8 isolate with one compiled handler and feeds it
//! mutation, deletion and timer events from two bounded queues:
//! - Per-partition checkpoints and dedup filters live in a lock-free table
//! - A watchdog thread terminates invocations that overrun their time limit
//! - Outcomes leave as framed responses for the orchestrator

pub mod checkpoint;
pub mod collab;
pub mod config;
pub mod engine;
pub mod error;
pub mod metrics;
pub mod partition;
pub mod queue;
pub mod v8_engine;
pub mod watchdog;
pub mod worker;

pub use checkpoint::{CheckpointError, CheckpointRecord, CheckpointStore, Checkpointer, FileCheckpointStore};
pub use config::{HandlerConfig, InitPayload, ServerSettings, WorkerOptions};
pub use engine::{EngineError, HandlerSet, Invocation, ScriptEngine, Terminator};
pub use error::{ReturnCode, WorkerError};
pub use metrics::{LatencyHistogram, LcbExceptionTally, WorkerMetrics};
pub use partition::{CheckpointUpdate, PartitionTable};
pub use v8_engine::V8Engine;
pub use watchdog::{ExecutionState, Watchdog};
pub use worker::{TimerEntry, WorkerHandle, WorkerServices, WorkerShared, WorkerStatus};
