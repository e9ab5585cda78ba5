//! Routes inbound frames: control messages are handled inline, events go to
//! the worker's queues, and every reply is pushed onto the egress channel.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use bytes::Bytes;
use protocol::{
    ControlOpcode, EventType, Frame, FramingError, ack_response, checkpoint_response,
    stats_response,
};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use worker::{
    Checkpointer, EngineError, FileCheckpointStore, InitPayload, ReturnCode, ScriptEngine,
    TimerEntry, WorkerError, WorkerHandle, WorkerMetrics, WorkerOptions, WorkerServices,
};

use crate::TransportError;

pub type EngineFactory<E> = Arc<dyn Fn() -> Result<E, EngineError> + Send + Sync>;
pub type ServicesFactory = Arc<dyn Fn() -> WorkerServices + Send + Sync>;

/// Whether the connection should keep reading.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    Continue,
    Stop,
}

struct CheckpointTask {
    stop: watch::Sender<bool>,
    task: JoinHandle<()>,
}

pub struct Dispatcher<E> {
    options: WorkerOptions,
    engine_factory: EngineFactory<E>,
    services: ServicesFactory,
    egress: mpsc::UnboundedSender<Bytes>,
    init: Option<InitPayload>,
    worker: Option<WorkerHandle>,
    checkpointer: Option<CheckpointTask>,
    framing_errors: AtomicU64,
}

impl<E: ScriptEngine + 'static> Dispatcher<E> {
    pub fn new(
        options: WorkerOptions,
        engine_factory: EngineFactory<E>,
        egress: mpsc::UnboundedSender<Bytes>,
    ) -> Self {
        Self {
            options,
            engine_factory,
            services: Arc::new(WorkerServices::default),
            egress,
            init: None,
            worker: None,
            checkpointer: None,
            framing_errors: AtomicU64::new(0),
        }
    }

    pub fn with_services(mut self, services: ServicesFactory) -> Self {
        self.services = services;
        self
    }

    pub fn options(&self) -> &WorkerOptions {
        &self.options
    }

    pub fn worker(&self) -> Option<&WorkerHandle> {
        self.worker.as_ref()
    }

    pub fn framing_errors(&self) -> u64 {
        self.framing_errors.load(Ordering::Relaxed)
    }

    /// A frame that could not be decoded is dropped and counted.
    pub fn record_framing_error(&self, err: &FramingError) {
        self.framing_errors.fetch_add(1, Ordering::Relaxed);
        tracing::warn!("dropping malformed frame: {}", err);
    }

    pub async fn handle(&mut self, frame: Frame) -> Result<Flow, TransportError> {
        match frame.event {
            EventType::Control => self.handle_control(frame).await,
            EventType::Mutation | EventType::Deletion => {
                let Some(worker) = self.worker.as_ref() else {
                    tracing::warn!("{} event before load, dropped", frame.event.as_str());
                    return Ok(Flow::Continue);
                };
                worker.push_event(frame).await?;
                Ok(Flow::Continue)
            }
            EventType::Timer => {
                let Some(worker) = self.worker.as_ref() else {
                    tracing::warn!("timer event before load, dropped");
                    return Ok(Flow::Continue);
                };
                let limit = worker.shared().config.timer_context_size;
                match TimerEntry::decode(&frame.payload, limit) {
                    Ok(entry) => worker.push_timer(entry).await?,
                    Err(err) => {
                        WorkerMetrics::incr(&worker.metrics().value_conversion_failure);
                        tracing::warn!("dropping timer event: {}", err);
                    }
                }
                Ok(Flow::Continue)
            }
        }
    }

    async fn handle_control(&mut self, frame: Frame) -> Result<Flow, TransportError> {
        let Some(opcode) = ControlOpcode::from_u8(frame.opcode) else {
            tracing::warn!("unknown control opcode {}", frame.opcode);
            return Ok(Flow::Continue);
        };
        tracing::debug!("control {:?} partition {}", opcode, frame.partition);

        match opcode {
            ControlOpcode::Init => self.init(&frame.payload),
            ControlOpcode::Load => self.load(&frame.payload).await?,
            ControlOpcode::Terminate => {
                self.terminate().await;
                return Ok(Flow::Stop);
            }
            ControlOpcode::GetLatencyStats => {
                let stats = self.worker.as_ref().map(|w| w.latency_stats());
                self.reply(stats_response(&stats.unwrap_or_else(empty_stats)));
            }
            ControlOpcode::GetFailureStats => {
                let mut stats = self
                    .worker
                    .as_ref()
                    .map(|w| w.failure_stats())
                    .unwrap_or_else(empty_stats);
                if let Some(map) = stats.as_object_mut() {
                    map.insert("framing_errors".into(), self.framing_errors().into());
                }
                self.reply(stats_response(&stats));
            }
            ControlOpcode::GetExecutionStats => {
                let stats = self.worker.as_ref().map(|w| w.execution_stats());
                self.reply(stats_response(&stats.unwrap_or_else(empty_stats)));
            }
            ControlOpcode::GetLcbExceptions => {
                let stats = self.worker.as_ref().map(|w| w.lcb_exceptions());
                self.reply(stats_response(&stats.unwrap_or_else(empty_stats)));
            }
            ControlOpcode::SetFilter => {
                let Some((worker, partition)) = self.partition_target(&frame) else {
                    return Ok(Flow::Continue);
                };
                match serde_json::from_slice::<u64>(&frame.payload) {
                    Ok(seq) => worker.partitions().set_filter(partition, seq),
                    Err(err) => tracing::warn!("bad filter seq for partition {}: {}", partition, err),
                }
            }
            ControlOpcode::SetTimerFilter => {
                if let Some((worker, partition)) = self.partition_target(&frame) {
                    worker.partitions().set_timer_filter(partition);
                }
            }
            ControlOpcode::ClearTimerFilter => {
                if let Some((worker, partition)) = self.partition_target(&frame) {
                    worker.partitions().clear_timer_filter(partition);
                }
            }
            ControlOpcode::ResetCheckpoint => {
                if let Some((worker, partition)) = self.partition_target(&frame) {
                    worker.partitions().reset_checkpoint(partition);
                }
            }
            ControlOpcode::GetCheckpoint => {
                let seq = self
                    .partition_target(&frame)
                    .and_then(|(worker, partition)| worker.partitions().checkpoint_seq(partition));
                self.reply(checkpoint_response(frame.partition, seq));
            }
            ControlOpcode::StartDebugger => {
                let port = match std::str::from_utf8(&frame.payload) {
                    Ok(port) if !port.is_empty() => port.to_string(),
                    _ => self
                        .init
                        .as_ref()
                        .map(|init| init.settings.debugger_port.clone())
                        .unwrap_or_default(),
                };
                if let Some(worker) = self.worker.as_ref() {
                    worker.start_debugger(port)?;
                }
            }
            ControlOpcode::StopDebugger => {
                if let Some(worker) = self.worker.as_ref() {
                    worker.stop_debugger()?;
                }
            }
        }
        Ok(Flow::Continue)
    }

    fn init(&mut self, payload: &[u8]) {
        match serde_json::from_slice::<InitPayload>(payload) {
            Ok(init) => {
                tracing::info!(
                    "init for {} (timeout {}ms, checkpoint every {}s)",
                    init.handler.app_name,
                    init.handler.execution_timeout_ms,
                    init.settings.checkpoint_interval
                );
                self.init = Some(init);
                self.reply(ack_response(ReturnCode::Success as u8, "initialised"));
            }
            Err(err) => {
                tracing::error!("malformed init payload: {}", err);
                self.reply(ack_response(
                    ReturnCode::ToLocalFailed as u8,
                    format!("malformed init payload: {}", err),
                ));
            }
        }
    }

    async fn load(&mut self, payload: &[u8]) -> Result<(), TransportError> {
        let Some(init) = self.init.clone() else {
            self.reply(ack_response(ReturnCode::ToLocalFailed as u8, "load before init"));
            return Ok(());
        };
        if self.worker.is_some() {
            self.reply(ack_response(ReturnCode::ToLocalFailed as u8, "handler already loaded"));
            return Ok(());
        }
        let source = String::from_utf8_lossy(payload).into_owned();

        let options = self.options.clone();
        let services = (self.services)();
        let factory = Arc::clone(&self.engine_factory);
        let spawned = tokio::task::spawn_blocking(move || {
            let (worker, responses) = WorkerHandle::spawn(
                init.handler.clone(),
                &source,
                &options,
                services,
                move || factory(),
            )?;
            // Seeds checkpoints and dedup filters before any event is accepted.
            let mut checkpointer = Checkpointer::new(
                init.handler.app_name.clone(),
                Arc::clone(worker.partitions()),
                Arc::new(FileCheckpointStore::new(&init.settings.eventing_dir)),
                Arc::clone(worker.metrics()),
            );
            checkpointer.restore();
            Ok::<_, WorkerError>((worker, responses, checkpointer, init.settings.checkpoint_interval()))
        })
        .await
        .map_err(|err| WorkerError::Thread(err.to_string()))?;

        let (worker, mut responses, checkpointer, interval) = match spawned {
            Ok(spawned) => spawned,
            Err(err) => {
                self.reply(ack_response(err.return_code() as u8, err.to_string()));
                return Ok(());
            }
        };

        let egress = self.egress.clone();
        tokio::spawn(async move {
            while let Some(response) = responses.recv().await {
                if egress.send(response).is_err() {
                    break;
                }
            }
        });

        let (stop, stop_rx) = watch::channel(false);
        let task = tokio::spawn(checkpointer.run(interval, stop_rx));
        self.checkpointer = Some(CheckpointTask { stop, task });

        self.worker = Some(worker);
        self.reply(ack_response(ReturnCode::Success as u8, "loaded"));
        Ok(())
    }

    /// Drain and stop the worker, then flush checkpoints one last time.
    pub async fn terminate(&mut self) {
        if let Some(mut worker) = self.worker.take() {
            let joined = tokio::task::spawn_blocking(move || worker.shutdown()).await;
            if let Err(err) = joined {
                tracing::error!("worker shutdown failed: {}", err);
            }
        }
        if let Some(checkpointer) = self.checkpointer.take() {
            let _ = checkpointer.stop.send(true);
            let _ = checkpointer.task.await;
        }
    }

    fn partition_target(&self, frame: &Frame) -> Option<(&WorkerHandle, usize)> {
        let Some(worker) = self.worker.as_ref() else {
            tracing::warn!("partition control before load ignored");
            return None;
        };
        match frame.partition_index() {
            Some(partition) => Some((worker, partition)),
            None => {
                tracing::warn!("partition control without a partition ignored");
                None
            }
        }
    }

    fn reply(&self, response: Bytes) {
        if self.egress.send(response).is_err() {
            tracing::debug!("egress closed, response dropped");
        }
    }
}

fn empty_stats() -> serde_json::Value {
    serde_json::json!({})
}
