use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Immutable per-handler configuration, delivered by the orchestrator's Init message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HandlerConfig {
    pub app_name: String,
    /// Hard limit on a single handler invocation, in milliseconds
    #[serde(default = "default_execution_timeout_ms")]
    pub execution_timeout_ms: u64,
    /// Max serialized size of a timer context, in bytes
    #[serde(default = "default_timer_context_size")]
    pub timer_context_size: usize,
    /// Data-access handles opened at load
    #[serde(default = "default_lcb_inst_capacity")]
    pub lcb_inst_capacity: usize,
    #[serde(default)]
    pub skip_lcb_bootstrap: bool,
    #[serde(default = "default_curl_timeout_ms")]
    pub curl_timeout_ms: u64,
    /// Deployment config, opaque to the worker
    #[serde(default)]
    pub dep_cfg: serde_json::Value,
    /// Snippets prepended to the user source before compilation
    #[serde(default)]
    pub handler_headers: Vec<String>,
    /// Snippets appended to the user source before compilation
    #[serde(default)]
    pub handler_footers: Vec<String>,
}

fn default_execution_timeout_ms() -> u64 {
    60_000
}

fn default_timer_context_size() -> usize {
    1024
}

fn default_lcb_inst_capacity() -> usize {
    5
}

fn default_curl_timeout_ms() -> u64 {
    10_000
}

impl HandlerConfig {
    pub fn new(app_name: impl Into<String>) -> Self {
        Self {
            app_name: app_name.into(),
            execution_timeout_ms: default_execution_timeout_ms(),
            timer_context_size: default_timer_context_size(),
            lcb_inst_capacity: default_lcb_inst_capacity(),
            skip_lcb_bootstrap: false,
            curl_timeout_ms: default_curl_timeout_ms(),
            dep_cfg: serde_json::Value::Null,
            handler_headers: Vec::new(),
            handler_footers: Vec::new(),
        }
    }

    pub fn max_task_duration(&self) -> Duration {
        Duration::from_millis(self.execution_timeout_ms)
    }

    /// Headers, user source and footers joined into the script that gets compiled.
    pub fn wrap_source(&self, user_source: &str) -> String {
        let mut wrapped = String::with_capacity(user_source.len() + 64);
        for header in &self.handler_headers {
            wrapped.push_str(header);
            wrapped.push('\n');
        }
        wrapped.push_str(user_source);
        for footer in &self.handler_footers {
            wrapped.push('\n');
            wrapped.push_str(footer);
        }
        wrapped
    }
}

/// Node-level settings shared by every worker of a deployment.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerSettings {
    /// Seconds between checkpoint persists
    #[serde(default = "default_checkpoint_interval")]
    pub checkpoint_interval: u64,
    #[serde(default)]
    pub debugger_port: String,
    #[serde(default = "default_eventing_dir")]
    pub eventing_dir: String,
    #[serde(default)]
    pub eventing_port: String,
    #[serde(default = "default_host_addr")]
    pub host_addr: String,
    #[serde(default)]
    pub kv_host_port: String,
}

fn default_checkpoint_interval() -> u64 {
    10
}

fn default_eventing_dir() -> String {
    std::env::temp_dir()
        .join("eventing")
        .to_string_lossy()
        .to_string()
}

fn default_host_addr() -> String {
    "127.0.0.1".to_string()
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            checkpoint_interval: default_checkpoint_interval(),
            debugger_port: String::new(),
            eventing_dir: default_eventing_dir(),
            eventing_port: String::new(),
            host_addr: default_host_addr(),
            kv_host_port: String::new(),
        }
    }
}

impl ServerSettings {
    pub fn checkpoint_interval(&self) -> Duration {
        Duration::from_secs(self.checkpoint_interval.max(1))
    }
}

/// Payload of the Init control message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InitPayload {
    pub handler: HandlerConfig,
    #[serde(default)]
    pub settings: ServerSettings,
}

/// Runtime tunables of the worker process itself.
#[derive(Debug, Clone)]
pub struct WorkerOptions {
    /// Capacity of the mutation/deletion queue
    pub event_queue_capacity: usize,
    /// Capacity of the timer queue
    pub timer_queue_capacity: usize,
    /// Max items taken from a queue per wakeup
    pub batch_window: usize,
    /// Pin the execution thread to this core
    pub pin_core: Option<usize>,
    /// Largest frame accepted from the orchestrator stream, in bytes
    pub max_frame_size: usize,
}

impl Default for WorkerOptions {
    fn default() -> Self {
        Self {
            event_queue_capacity: 10_000,
            timer_queue_capacity: 10_000,
            batch_window: 8,
            pin_core: None,
            max_frame_size: 16 * 1024 * 1024,
        }
    }
}

impl WorkerOptions {
    /// Create options from environment variables
    ///
    /// Environment variables:
    /// - EVENTING_QUEUE_CAPACITY: mutation/deletion queue capacity (default: 10000)
    /// - EVENTING_TIMER_QUEUE_CAPACITY: timer queue capacity (default: 10000)
    /// - EVENTING_BATCH_WINDOW: items popped per wakeup (default: 8)
    /// - EVENTING_PIN_CORE: core index for the execution thread (default: unpinned)
    /// - EVENTING_MAX_FRAME_SIZE: max inbound frame size in bytes (default: 16MiB)
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            event_queue_capacity: env_parse("EVENTING_QUEUE_CAPACITY")
                .unwrap_or(defaults.event_queue_capacity)
                .max(1),
            timer_queue_capacity: env_parse("EVENTING_TIMER_QUEUE_CAPACITY")
                .unwrap_or(defaults.timer_queue_capacity)
                .max(1),
            batch_window: env_parse("EVENTING_BATCH_WINDOW")
                .unwrap_or(defaults.batch_window)
                .max(1),
            pin_core: env_parse("EVENTING_PIN_CORE"),
            max_frame_size: env_parse("EVENTING_MAX_FRAME_SIZE")
                .unwrap_or(defaults.max_frame_size)
                .max(protocol::FRAME_HEADER_LEN),
        }
    }
}

fn env_parse<T: std::str::FromStr>(name: &str) -> Option<T> {
    std::env::var(name).ok().and_then(|s| s.parse().ok())
}
