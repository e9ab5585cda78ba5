//! The seam between the execution loop and a script engine.
//!
//! The loop and the watchdog only ever see these traits, so everything above
//! the engine can be exercised without V8.

use std::sync::Arc;

use protocol::{EventMetadata, TimerRequest};
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("{0}")]
    Compile(String),
    #[error("{0}")]
    Exception(String),
    #[error("value conversion: {0}")]
    Conversion(String),
    #[error("engine failure: {0}")]
    Internal(String),
}

/// Entry points the compiled handler defines.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HandlerSet {
    pub on_update: bool,
    pub on_delete: bool,
}

impl HandlerSet {
    pub fn is_empty(&self) -> bool {
        !self.on_update && !self.on_delete
    }
}

pub const ON_UPDATE: &str = "OnUpdate";
pub const ON_DELETE: &str = "OnDelete";

#[derive(Debug, Clone, Copy)]
pub enum Invocation<'a> {
    Update {
        doc: &'a serde_json::Value,
        meta: &'a EventMetadata,
    },
    Delete {
        meta: &'a EventMetadata,
    },
    Timer {
        callback: &'a str,
        context: &'a serde_json::Value,
    },
}

impl Invocation<'_> {
    pub fn entry_point(&self) -> &str {
        match self {
            Invocation::Update { .. } => ON_UPDATE,
            Invocation::Delete { .. } => ON_DELETE,
            Invocation::Timer { callback, .. } => callback,
        }
    }

    /// Positional arguments of the entry point.
    pub fn arguments(&self) -> Result<Vec<serde_json::Value>, EngineError> {
        let to_value =
            |v: &EventMetadata| serde_json::to_value(v).map_err(|e| EngineError::Conversion(e.to_string()));
        Ok(match self {
            Invocation::Update { doc, meta } => vec![(*doc).clone(), to_value(meta)?],
            Invocation::Delete { meta } => vec![to_value(meta)?],
            Invocation::Timer { context, .. } => vec![(*context).clone()],
        })
    }
}

/// Stops the invocation currently running on an engine. Called from the
/// watchdog thread, never from the engine's own thread.
pub trait Terminator: Send + Sync {
    fn terminate(&self);
}

/// A single compiled handler. Not `Send`: it lives and dies on the execution thread.
pub trait ScriptEngine {
    /// Compile and run the wrapped handler source, then report its entry points.
    fn load(&mut self, script: &str) -> Result<HandlerSet, EngineError>;

    /// Run one entry point; returns the timers it asked for.
    fn invoke(&mut self, invocation: Invocation<'_>) -> Result<Vec<TimerRequest>, EngineError>;

    fn terminator(&mut self) -> Arc<dyn Terminator>;

    /// Drop a pending termination so the next invocation starts clean.
    fn clear_termination(&mut self);
}

/// Whether `name` can be spliced into a script as a plain identifier.
pub fn is_identifier(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' || c == '$' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '$')
}
