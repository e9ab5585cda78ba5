//! The execution worker: one thread, one script engine, one compiled handler.
//!
//! `WorkerHandle::spawn` compiles the handler on a dedicated thread (the engine
//! is `!Send` and never leaves it) and reports the load result back before any
//! event is accepted. The thread then runs a current-thread tokio runtime that
//! pops windows from the two queues with a fair `select!`, filters duplicates,
//! invokes the handler under the watchdog, and emits framed responses.

use std::sync::Arc;
use std::sync::atomic::{AtomicU8, Ordering};
use std::thread::{self, JoinHandle};
use std::time::Instant;

use bytes::Bytes;
use nanoid::nanoid;
use protocol::{
    CreateTimer, DataType, EventMetadata, EventOutcome, EventType, Frame, NUM_PARTITIONS,
    TimerEvent, TimerRequest, create_timer_response, outcome_response,
};
use tokio::sync::{mpsc, watch};

use crate::collab::{
    ConnectionPool, DataAccessConnector, ErrorTranslator, Inspector, LatencyRecorder,
    ProviderErrorTranslator,
};
use crate::config::{HandlerConfig, WorkerOptions};
use crate::engine::{EngineError, HandlerSet, Invocation, ScriptEngine, Terminator};
use crate::error::WorkerError;
use crate::metrics::{LatencyHistogram, LcbExceptionTally, WorkerMetrics};
use crate::partition::PartitionTable;
use crate::queue::{self, EventQueue, QueueProducer};
use crate::watchdog::{ExecutionState, Watchdog};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum WorkerStatus {
    Uninitialized = 0,
    Loaded = 1,
    Running = 2,
    ShuttingDown = 3,
    Stopped = 4,
}

impl WorkerStatus {
    fn from_u8(value: u8) -> Self {
        match value {
            1 => WorkerStatus::Loaded,
            2 => WorkerStatus::Running,
            3 => WorkerStatus::ShuttingDown,
            4 => WorkerStatus::Stopped,
            _ => WorkerStatus::Uninitialized,
        }
    }
}

/// A fired timer waiting for the execution thread.
#[derive(Debug, Clone)]
pub struct TimerEntry {
    pub event: TimerEvent,
    /// Serialized size of the timer context
    pub context_size: usize,
}

impl TimerEntry {
    /// Parse a timer frame payload, rejecting contexts over `limit` bytes.
    pub fn decode(payload: &[u8], limit: usize) -> Result<Self, WorkerError> {
        let event =
            TimerEvent::parse(payload).map_err(|err| WorkerError::ValueConversion(err.to_string()))?;
        let context_size = context_size(&event.context);
        if context_size > limit {
            return Err(WorkerError::TimerContextTooLarge {
                size: context_size,
                limit,
            });
        }
        Ok(Self {
            event,
            context_size,
        })
    }
}

fn context_size(context: &serde_json::Value) -> usize {
    serde_json::to_vec(context).map(|v| v.len()).unwrap_or(usize::MAX)
}

/// Collaborators handed to a worker at spawn time.
pub struct WorkerServices {
    /// Opens the data-access pool at load unless `skip_lcb_bootstrap` is set
    pub connector: Option<Arc<dyn DataAccessConnector>>,
    pub translator: Arc<dyn ErrorTranslator>,
    pub inspector: Option<Box<dyn Inspector>>,
}

impl Default for WorkerServices {
    fn default() -> Self {
        Self {
            connector: None,
            translator: Arc::new(ProviderErrorTranslator),
            inspector: None,
        }
    }
}

/// State shared between the handle and the execution thread.
pub struct WorkerShared {
    pub id: String,
    pub config: HandlerConfig,
    pub partitions: Arc<PartitionTable>,
    pub metrics: Arc<WorkerMetrics>,
    pub lcb_exceptions: Arc<LcbExceptionTally>,
    pub latency: Arc<LatencyHistogram>,
    pub execution: Arc<ExecutionState>,
    status: AtomicU8,
}

impl WorkerShared {
    fn set_status(&self, status: WorkerStatus) {
        self.status.store(status as u8, Ordering::Release);
    }

    pub fn status(&self) -> WorkerStatus {
        WorkerStatus::from_u8(self.status.load(Ordering::Acquire))
    }
}

/// Commands for the execution thread
enum WorkerControl {
    StartDebugger { port: String },
    StopDebugger,
}

pub struct WorkerHandle {
    shared: Arc<WorkerShared>,
    events: QueueProducer<Frame>,
    timers: QueueProducer<TimerEntry>,
    control_tx: mpsc::UnboundedSender<WorkerControl>,
    shutdown_tx: watch::Sender<bool>,
    thread: Option<JoinHandle<()>>,
    watchdog: Option<Watchdog>,
}

impl WorkerHandle {
    /// Compile `source` with an engine built by `engine_factory` on a new
    /// execution thread. Returns once the handler is loaded, together with the
    /// stream of outbound response frames.
    pub fn spawn<E, F>(
        config: HandlerConfig,
        source: &str,
        options: &WorkerOptions,
        services: WorkerServices,
        engine_factory: F,
    ) -> Result<(Self, mpsc::UnboundedReceiver<Bytes>), WorkerError>
    where
        E: ScriptEngine + 'static,
        F: FnOnce() -> Result<E, EngineError> + Send + 'static,
    {
        let shared = Arc::new(WorkerShared {
            id: format!("worker_{}", nanoid!(10)),
            config,
            partitions: Arc::new(PartitionTable::default()),
            metrics: Arc::new(WorkerMetrics::default()),
            lcb_exceptions: Arc::new(LcbExceptionTally::default()),
            latency: Arc::new(LatencyHistogram::default()),
            execution: Arc::new(ExecutionState::default()),
            status: AtomicU8::new(WorkerStatus::Uninitialized as u8),
        });

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let (events_tx, events_rx) = queue::bounded(options.event_queue_capacity, shutdown_rx.clone());
        let (timers_tx, timers_rx) = queue::bounded(options.timer_queue_capacity, shutdown_rx);
        let (control_tx, control_rx) = mpsc::unbounded_channel();
        let (response_tx, response_rx) = mpsc::unbounded_channel();
        let (init_tx, init_rx) = std::sync::mpsc::sync_channel(1);

        let script = shared.config.wrap_source(source);
        let thread_shared = Arc::clone(&shared);
        let batch_window = options.batch_window.max(1);
        let pin_core = options.pin_core;

        let thread = thread::Builder::new()
            .name(format!("eventing-{}", shared.config.app_name))
            .spawn(move || {
                if let Some(core) = pin_core {
                    pin_to_core(core);
                }
                // The engine is created inside the runtime it will run under.
                let rt = match tokio::runtime::Builder::new_current_thread()
                    .enable_all()
                    .build()
                {
                    Ok(rt) => rt,
                    Err(err) => {
                        let _ = init_tx.send(Err(WorkerError::Thread(err.to_string())));
                        return;
                    }
                };
                let _guard = rt.enter();
                let loaded = engine_factory()
                    .map_err(|err| WorkerError::Thread(err.to_string()))
                    .and_then(|engine| {
                        Executor::load(engine, &script, thread_shared, services, response_tx, batch_window)
                    });
                let mut executor = match loaded {
                    Ok((executor, terminator)) => {
                        let _ = init_tx.send(Ok(terminator));
                        executor
                    }
                    Err(err) => {
                        let _ = init_tx.send(Err(err));
                        return;
                    }
                };
                executor.run(&rt, events_rx, timers_rx, control_rx);
            })
            .map_err(|err| WorkerError::Thread(err.to_string()))?;

        let terminator = match init_rx.recv() {
            Ok(Ok(terminator)) => terminator,
            Ok(Err(err)) => {
                let _ = thread.join();
                tracing::error!("{}: load failed: {}", shared.config.app_name, err);
                return Err(err);
            }
            Err(_) => {
                let _ = thread.join();
                return Err(WorkerError::Thread("execution thread exited during load".into()));
            }
        };

        let watchdog = Watchdog::spawn(
            Arc::clone(&shared.execution),
            terminator,
            shared.config.max_task_duration(),
            Arc::clone(&shared.metrics),
        )
        .map_err(|err| WorkerError::Thread(err.to_string()))?;

        shared.set_status(WorkerStatus::Running);
        tracing::info!(
            "{} running handler {} (timeout {:?})",
            shared.id,
            shared.config.app_name,
            shared.config.max_task_duration()
        );

        Ok((
            Self {
                shared,
                events: events_tx,
                timers: timers_tx,
                control_tx,
                shutdown_tx,
                thread: Some(thread),
                watchdog: Some(watchdog),
            },
            response_rx,
        ))
    }

    pub fn id(&self) -> &str {
        &self.shared.id
    }

    pub fn shared(&self) -> &Arc<WorkerShared> {
        &self.shared
    }

    pub fn status(&self) -> WorkerStatus {
        self.shared.status()
    }

    pub fn partitions(&self) -> &Arc<PartitionTable> {
        &self.shared.partitions
    }

    pub fn metrics(&self) -> &Arc<WorkerMetrics> {
        &self.shared.metrics
    }

    /// Queue a mutation or deletion frame. Waits while the queue is full.
    pub async fn push_event(&self, frame: Frame) -> Result<(), WorkerError> {
        if !matches!(frame.event, EventType::Mutation | EventType::Deletion) {
            return Err(WorkerError::ValueConversion(format!(
                "{} frame is not a bucket event",
                frame.event.as_str()
            )));
        }
        self.events
            .push(frame)
            .await
            .map_err(|_| WorkerError::ShuttingDown)
    }

    pub async fn push_timer(&self, entry: TimerEntry) -> Result<(), WorkerError> {
        let limit = self.shared.config.timer_context_size;
        if entry.context_size > limit {
            return Err(WorkerError::TimerContextTooLarge {
                size: entry.context_size,
                limit,
            });
        }
        self.timers
            .push(entry)
            .await
            .map_err(|_| WorkerError::ShuttingDown)
    }

    pub fn start_debugger(&self, port: impl Into<String>) -> Result<(), WorkerError> {
        self.control(WorkerControl::StartDebugger { port: port.into() })
    }

    pub fn stop_debugger(&self) -> Result<(), WorkerError> {
        self.control(WorkerControl::StopDebugger)
    }

    fn control(&self, cmd: WorkerControl) -> Result<(), WorkerError> {
        self.control_tx
            .send(cmd)
            .map_err(|_| WorkerError::ShuttingDown)
    }

    pub fn failure_stats(&self) -> serde_json::Value {
        self.shared.metrics.failure_stats()
    }

    pub fn execution_stats(&self) -> serde_json::Value {
        let mut stats = self.shared.metrics.execution_stats();
        if let Some(map) = stats.as_object_mut() {
            map.insert("enqueued_events".into(), self.events.enqueued().into());
            map.insert("enqueued_timers".into(), self.timers.enqueued().into());
            map.insert("event_queue_depth".into(), self.events.depth().into());
            map.insert("timer_queue_depth".into(), self.timers.depth().into());
        }
        stats
    }

    pub fn latency_stats(&self) -> serde_json::Value {
        self.shared.latency.to_json()
    }

    pub fn lcb_exceptions(&self) -> serde_json::Value {
        self.shared.lcb_exceptions.to_json()
    }

    /// Refuse new work, drain both queues, then stop the execution thread and
    /// the watchdog. The invocation in flight stays subject to the timeout.
    pub fn shutdown(&mut self) {
        let Some(thread) = self.thread.take() else {
            return;
        };
        self.shared.set_status(WorkerStatus::ShuttingDown);
        let _ = self.shutdown_tx.send(true);
        if thread.join().is_err() {
            tracing::error!("{}: execution thread panicked", self.shared.id);
        }
        if let Some(mut watchdog) = self.watchdog.take() {
            watchdog.stop();
        }
        self.shared.set_status(WorkerStatus::Stopped);
        tracing::info!("{} stopped", self.shared.id);
    }
}

impl Drop for WorkerHandle {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Table index and wire id of an event's partition. The metadata must name
/// the same in-range partition as the frame header.
fn event_partition(frame: &Frame, meta: &EventMetadata) -> Option<(usize, i16)> {
    let partition = usize::from(meta.partition);
    if partition >= NUM_PARTITIONS || frame.partition_index() != Some(partition) {
        return None;
    }
    let id = i16::try_from(meta.partition).ok()?;
    Some((partition, id))
}

fn pin_to_core(core: usize) {
    let pinned = core_affinity::get_core_ids()
        .and_then(|ids| ids.into_iter().find(|id| id.id == core))
        .map(core_affinity::set_for_current)
        .unwrap_or(false);
    if !pinned {
        tracing::warn!("could not pin execution thread to core {}", core);
    }
}

enum InvokeError {
    TimedOut,
    Engine(EngineError),
}

/// Lives on the execution thread and owns the engine.
struct Executor<E> {
    engine: E,
    handlers: HandlerSet,
    shared: Arc<WorkerShared>,
    responses: mpsc::UnboundedSender<Bytes>,
    translator: Arc<dyn ErrorTranslator>,
    inspector: Option<Box<dyn Inspector>>,
    _pool: Option<ConnectionPool>,
    batch_window: usize,
}

impl<E: ScriptEngine> Executor<E> {
    fn load(
        mut engine: E,
        script: &str,
        shared: Arc<WorkerShared>,
        services: WorkerServices,
        responses: mpsc::UnboundedSender<Bytes>,
        batch_window: usize,
    ) -> Result<(Self, Arc<dyn Terminator>), WorkerError> {
        let config = &shared.config;
        let handlers = engine.load(script).map_err(|err| match err {
            EngineError::Compile(message) => WorkerError::Compile(message),
            other => WorkerError::Compile(other.to_string()),
        })?;
        if handlers.is_empty() {
            return Err(WorkerError::NoHandlersDefined);
        }

        let pool = match (&services.connector, config.skip_lcb_bootstrap) {
            (Some(connector), false) => Some(
                ConnectionPool::open(connector.as_ref(), config, Arc::clone(&shared.lcb_exceptions))
                    .map_err(|err| WorkerError::BucketInit(err.to_string()))?,
            ),
            _ => None,
        };

        tracing::info!(
            "{}: handler loaded (OnUpdate: {}, OnDelete: {})",
            config.app_name,
            handlers.on_update,
            handlers.on_delete
        );
        shared.set_status(WorkerStatus::Loaded);
        let terminator = engine.terminator();

        Ok((
            Self {
                engine,
                handlers,
                shared,
                responses,
                translator: services.translator,
                inspector: services.inspector,
                _pool: pool,
                batch_window,
            },
            terminator,
        ))
    }

    fn run(
        &mut self,
        rt: &tokio::runtime::Runtime,
        mut events: EventQueue<Frame>,
        mut timers: EventQueue<TimerEntry>,
        mut control: mpsc::UnboundedReceiver<WorkerControl>,
    ) {
        tracing::debug!("{} execution loop started", self.shared.id);
        let window = self.batch_window;
        rt.block_on(async {
            let mut events_done = false;
            let mut timers_done = false;
            while !(events_done && timers_done) {
                tokio::select! {
                    batch = events.pop_window(window), if !events_done => {
                        events_done = batch.is_empty();
                        for frame in batch {
                            self.route_event(frame);
                        }
                    }
                    batch = timers.pop_window(window), if !timers_done => {
                        timers_done = batch.is_empty();
                        for entry in batch {
                            self.route_timer(entry);
                        }
                    }
                    Some(cmd) = control.recv() => {
                        self.handle_control(cmd);
                    }
                    else => break,
                }
            }
        });
        tracing::debug!("{} execution loop drained", self.shared.id);
    }

    fn handle_control(&mut self, cmd: WorkerControl) {
        match cmd {
            WorkerControl::StartDebugger { port } => match self.inspector.as_mut() {
                Some(inspector) => match inspector.start(&port) {
                    Ok(()) => {
                        self.shared.execution.set_debugger_active(true);
                        tracing::info!("{}: debugger started on port {}", self.shared.id, port);
                    }
                    Err(err) => tracing::warn!("{}: debugger failed to start: {}", self.shared.id, err),
                },
                None => tracing::warn!("{}: no inspector configured", self.shared.id),
            },
            WorkerControl::StopDebugger => {
                if let Some(inspector) = self.inspector.as_mut() {
                    inspector.stop();
                }
                self.shared.execution.set_debugger_active(false);
                tracing::info!("{}: debugger stopped", self.shared.id);
            }
        }
    }

    fn route_event(&mut self, frame: Frame) {
        let metrics = Arc::clone(&self.shared.metrics);
        WorkerMetrics::incr(&metrics.messages_processed);

        let meta = match EventMetadata::parse(&frame.metadata) {
            Ok(meta) => meta,
            Err(err) => {
                self.reject_event(&frame, String::new(), 0, err.to_string());
                return;
            }
        };
        let Some((partition, partition_id)) = event_partition(&frame, &meta) else {
            let reason = format!(
                "metadata partition {} does not match frame partition {}",
                meta.partition, frame.partition
            );
            self.reject_event(&frame, meta.id, meta.seq, reason);
            return;
        };
        if self.shared.partitions.is_filtered(partition, meta.seq) {
            WorkerMetrics::incr(&metrics.suppressed_duplicates);
            tracing::trace!("partition {} seq {} suppressed as duplicate", partition, meta.seq);
            return;
        }

        let result = match frame.event {
            EventType::Mutation => {
                WorkerMetrics::incr(&metrics.dcp_mutation_msg_counter);
                self.send_update(&frame.payload, &meta)
            }
            EventType::Deletion => {
                WorkerMetrics::incr(&metrics.dcp_delete_msg_counter);
                self.send_delete(&meta)
            }
            other => {
                tracing::warn!("{}: {} frame on the event queue", self.shared.id, other.as_str());
                return;
            }
        };

        let error = match result {
            Ok(timers) => {
                self.shared.partitions.update_checkpoint_seq(partition, meta.seq);
                self.shared.partitions.record_processed(partition);
                self.emit_timers(partition_id, timers);
                None
            }
            Err(err) => Some(err.to_string()),
        };
        let outcome = EventOutcome {
            id: meta.id,
            partition: partition_id,
            seq: meta.seq,
            error,
        };
        let _ = self.responses.send(outcome_response(frame.event, &outcome));
    }

    /// Conversion failure: counted and answered on the frame's own partition.
    fn reject_event(&self, frame: &Frame, id: String, seq: u64, reason: String) {
        WorkerMetrics::incr(&self.shared.metrics.value_conversion_failure);
        tracing::warn!("{}: rejecting {} event: {}", self.shared.id, frame.event.as_str(), reason);
        let outcome = EventOutcome {
            id,
            partition: frame.partition,
            seq,
            error: Some(WorkerError::ValueConversion(reason).to_string()),
        };
        let _ = self.responses.send(outcome_response(frame.event, &outcome));
    }

    fn send_update(&mut self, payload: &[u8], meta: &EventMetadata) -> Result<Vec<TimerRequest>, WorkerError> {
        let metrics = Arc::clone(&self.shared.metrics);
        if !self.handlers.on_update {
            return Ok(Vec::new());
        }
        let doc = match meta.datatype {
            DataType::Json => match serde_json::from_slice::<serde_json::Value>(payload) {
                Ok(doc) => doc,
                Err(err) => {
                    WorkerMetrics::incr(&metrics.value_conversion_failure);
                    WorkerMetrics::incr(&metrics.on_update_failure);
                    return Err(WorkerError::ValueConversion(err.to_string()));
                }
            },
            DataType::Binary => serde_json::Value::from(payload.to_vec()),
        };

        match self.invoke(Invocation::Update { doc: &doc, meta }) {
            Ok(timers) => {
                WorkerMetrics::incr(&metrics.on_update_success);
                Ok(timers)
            }
            Err(err) => {
                WorkerMetrics::incr(&metrics.on_update_failure);
                Err(self.invocation_error(err, WorkerError::OnUpdateInvocation))
            }
        }
    }

    fn send_delete(&mut self, meta: &EventMetadata) -> Result<Vec<TimerRequest>, WorkerError> {
        let metrics = Arc::clone(&self.shared.metrics);
        if !self.handlers.on_delete {
            return Ok(Vec::new());
        }
        match self.invoke(Invocation::Delete { meta }) {
            Ok(timers) => {
                WorkerMetrics::incr(&metrics.on_delete_success);
                Ok(timers)
            }
            Err(err) => {
                WorkerMetrics::incr(&metrics.on_delete_failure);
                Err(self.invocation_error(err, WorkerError::OnDeleteInvocation))
            }
        }
    }

    fn route_timer(&mut self, entry: TimerEntry) {
        let metrics = Arc::clone(&self.shared.metrics);
        WorkerMetrics::incr(&metrics.messages_processed);
        WorkerMetrics::incr(&metrics.timer_msg_counter);

        let TimerEntry { event, .. } = entry;
        let enabled = usize::try_from(event.partition)
            .map(|p| self.shared.partitions.timer_enabled(p))
            .unwrap_or(false);
        if !enabled {
            WorkerMetrics::incr(&metrics.filtered_timers);
            tracing::debug!(
                "timer {} skipped, timers disabled for partition {}",
                event.reference,
                event.partition
            );
            return;
        }

        let result = self.invoke(Invocation::Timer {
            callback: &event.callback,
            context: &event.context,
        });
        let error = match result {
            Ok(timers) => {
                WorkerMetrics::incr(&metrics.timer_success);
                self.emit_timers(event.partition, timers);
                None
            }
            Err(err) => {
                WorkerMetrics::incr(&metrics.timer_failure);
                let callback = event.callback.clone();
                let err = self.invocation_error(err, move |message| WorkerError::TimerInvocation {
                    callback,
                    message,
                });
                Some(err.to_string())
            }
        };
        let outcome = EventOutcome {
            id: event.reference,
            partition: event.partition,
            seq: 0,
            error,
        };
        let _ = self.responses.send(outcome_response(EventType::Timer, &outcome));
    }

    fn invoke(&mut self, invocation: Invocation<'_>) -> Result<Vec<TimerRequest>, InvokeError> {
        let started = Instant::now();
        if self.shared.execution.debugger_active() {
            if let (Some(inspector), Ok(args)) = (self.inspector.as_mut(), invocation.arguments()) {
                // The debugger session runs the handler in place of the engine.
                match inspector.debug_execute(invocation.entry_point(), &args) {
                    Ok(()) => {
                        self.shared.latency.record(started.elapsed().as_nanos() as u64);
                        return Ok(Vec::new());
                    }
                    Err(err) => {
                        tracing::warn!("{}: debug_execute failed, running without debugger: {}", self.shared.id, err);
                    }
                }
            }
        }

        self.shared.execution.begin();
        let result = self.engine.invoke(invocation);
        let timed_out = self.shared.execution.finish();
        if timed_out {
            self.engine.clear_termination();
        }
        self.shared.latency.record(started.elapsed().as_nanos() as u64);

        if timed_out {
            return Err(InvokeError::TimedOut);
        }
        result.map_err(InvokeError::Engine)
    }

    fn invocation_error(
        &self,
        err: InvokeError,
        wrap: impl FnOnce(String) -> WorkerError,
    ) -> WorkerError {
        match err {
            InvokeError::TimedOut => WorkerError::Timeout(self.shared.config.max_task_duration()),
            InvokeError::Engine(EngineError::Conversion(message)) => {
                WorkerMetrics::incr(&self.shared.metrics.value_conversion_failure);
                WorkerError::ValueConversion(message)
            }
            InvokeError::Engine(err) => {
                let exception = self.translator.from_message(&err.to_string());
                tracing::debug!("{}: {}: {}", self.shared.id, exception.name, exception.description);
                wrap(format!("{}: {}", exception.name, exception.description))
            }
        }
    }

    fn emit_timers(&self, partition: i16, timers: Vec<TimerRequest>) {
        let limit = self.shared.config.timer_context_size;
        for timer in timers {
            let size = context_size(&timer.context);
            if size > limit {
                WorkerMetrics::incr(&self.shared.metrics.timer_create_failure);
                tracing::warn!(
                    "timer {} dropped: context of {} bytes exceeds {}",
                    timer.reference,
                    size,
                    limit
                );
                continue;
            }
            let request = CreateTimer { partition, timer };
            let _ = self.responses.send(create_timer_response(&request));
        }
    }
}
