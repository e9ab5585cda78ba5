use std::sync::Arc;
use std::time::Duration;

use bytes::{BufMut, Bytes, BytesMut};
use protocol::{
    AckPayload, ControlOpcode, EventMetadata, EventOutcome, EventType, Frame, ResponseOpcode,
    TimerRequest,
};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use transport::{Dispatcher, StreamDecoder, delimit, encode_stream, serve};
use worker::{
    CheckpointRecord, CheckpointStore, EngineError, FileCheckpointStore, HandlerSet, Invocation,
    ScriptEngine, Terminator, WorkerOptions,
};

/// Succeeds for every document except `{"throw": ...}`.
struct EchoEngine;

struct NoopTerminator;

impl Terminator for NoopTerminator {
    fn terminate(&self) {}
}

impl ScriptEngine for EchoEngine {
    fn load(&mut self, script: &str) -> Result<HandlerSet, EngineError> {
        Ok(HandlerSet {
            on_update: script.contains("OnUpdate"),
            on_delete: script.contains("OnDelete"),
        })
    }

    fn invoke(&mut self, invocation: Invocation<'_>) -> Result<Vec<TimerRequest>, EngineError> {
        if let Invocation::Update { doc, .. } = invocation {
            if let Some(message) = doc["throw"].as_str() {
                return Err(EngineError::Exception(format!("Error: {}", message)));
            }
        }
        Ok(Vec::new())
    }

    fn terminator(&mut self) -> Arc<dyn Terminator> {
        Arc::new(NoopTerminator)
    }

    fn clear_termination(&mut self) {}
}

struct Orchestrator<S> {
    stream: S,
    decoder: StreamDecoder,
}

impl<S: AsyncRead + AsyncWrite + Unpin> Orchestrator<S> {
    fn new(stream: S) -> Self {
        Self {
            stream,
            decoder: StreamDecoder::new(1024 * 1024),
        }
    }

    async fn send(&mut self, frame: &Frame) {
        self.stream.write_all(&encode_stream(frame)).await.expect("write");
    }

    async fn send_raw(&mut self, bytes: &[u8]) {
        self.stream.write_all(bytes).await.expect("write");
    }

    async fn control(&mut self, opcode: ControlOpcode, partition: i16, payload: impl Into<Bytes>) {
        let frame = Frame::new(EventType::Control, opcode as u8, partition, Bytes::new(), payload);
        self.send(&frame).await;
    }

    /// Next response, or `None` once the worker closed the stream.
    async fn recv(&mut self) -> Option<Frame> {
        tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                if let Some(frame) = self.decoder.next_frame() {
                    return Some(frame.expect("well-formed response"));
                }
                let n = self
                    .stream
                    .read_buf(self.decoder.buffer_mut())
                    .await
                    .expect("read");
                if n == 0 {
                    return None;
                }
            }
        })
        .await
        .expect("response in time")
    }

    async fn expect(&mut self, opcode: ResponseOpcode) -> Frame {
        let frame = self.recv().await.expect("open stream");
        assert_eq!(ResponseOpcode::from_u8(frame.opcode), Some(opcode), "{:?}", frame);
        frame
    }
}

fn init_payload(app: &str, dir: &std::path::Path) -> Vec<u8> {
    serde_json::to_vec(&serde_json::json!({
        "handler": { "app_name": app, "execution_timeout_ms": 1000 },
        "settings": { "checkpoint_interval": 60, "eventing_dir": dir },
    }))
    .expect("init")
}

fn mutation(partition: u16, seq: u64, doc: serde_json::Value) -> Frame {
    Frame::new(
        EventType::Mutation,
        0,
        partition as i16,
        EventMetadata::new(format!("doc::{}", seq), partition, seq).to_bytes(),
        serde_json::to_vec(&doc).expect("doc"),
    )
}

fn ack(frame: &Frame) -> AckPayload {
    serde_json::from_slice(&frame.payload).expect("ack")
}

fn outcome(frame: &Frame) -> EventOutcome {
    serde_json::from_slice(&frame.payload).expect("outcome")
}

fn dispatcher(egress: mpsc::UnboundedSender<Bytes>) -> Dispatcher<EchoEngine> {
    Dispatcher::new(WorkerOptions::default(), Arc::new(|| Ok::<_, EngineError>(EchoEngine)), egress)
}

#[tokio::test]
async fn full_session_over_a_stream() {
    let dir = tempfile::tempdir().expect("tempdir");
    let (worker_side, orchestrator_side) = tokio::io::duplex(64 * 1024);
    let (egress_tx, egress_rx) = mpsc::unbounded_channel();
    let server = serve(worker_side, dispatcher(egress_tx), egress_rx);

    let client = async {
        let mut orch = Orchestrator::new(orchestrator_side);

        orch.control(ControlOpcode::Load, -1, "function OnUpdate(doc, meta) {}").await;
        assert_ne!(ack(&orch.expect(ResponseOpcode::Ack).await).code, 0);

        orch.control(ControlOpcode::Init, -1, init_payload("shop", dir.path())).await;
        assert_eq!(ack(&orch.expect(ResponseOpcode::Ack).await).code, 0);
        orch.control(ControlOpcode::Load, -1, "function OnUpdate(doc, meta) {}").await;
        assert_eq!(ack(&orch.expect(ResponseOpcode::Ack).await).code, 0);

        orch.send(&mutation(5, 10, serde_json::json!({"a": 1}))).await;
        let success = orch.expect(ResponseOpcode::EventSuccess).await;
        assert_eq!((outcome(&success).partition, outcome(&success).seq), (5, 10));

        orch.send(&mutation(5, 11, serde_json::json!({"throw": "bad"}))).await;
        let failure = orch.expect(ResponseOpcode::EventFailure).await;
        assert!(outcome(&failure).error.is_some());

        // Declares more metadata than the frame carries.
        let mut bad = BytesMut::new();
        bad.put_u8(EventType::Mutation as u8);
        bad.put_u8(0);
        bad.put_i16(5);
        bad.put_u32(500);
        bad.put_u32(0);
        orch.send_raw(&delimit(&bad)).await;

        orch.control(ControlOpcode::GetFailureStats, -1, Bytes::new()).await;
        let stats: serde_json::Value =
            serde_json::from_slice(&orch.expect(ResponseOpcode::Stats).await.payload).expect("stats");
        assert_eq!(stats["framing_errors"], 1);
        assert_eq!(stats["on_update_failure"], 1);

        orch.control(ControlOpcode::GetCheckpoint, 5, Bytes::new()).await;
        let checkpoint: serde_json::Value =
            serde_json::from_slice(&orch.expect(ResponseOpcode::Checkpoint).await.payload).expect("checkpoint");
        assert_eq!(checkpoint, serde_json::json!({"vb": 5, "seq": 10}));

        orch.control(ControlOpcode::SetFilter, 5, "20").await;
        orch.send(&mutation(5, 15, serde_json::json!({}))).await;
        orch.send(&mutation(5, 21, serde_json::json!({}))).await;
        let next = orch.expect(ResponseOpcode::EventSuccess).await;
        assert_eq!(outcome(&next).seq, 21);

        orch.control(ControlOpcode::Terminate, -1, Bytes::new()).await;
        while orch.recv().await.is_some() {}
    };

    let (served, ()) = tokio::join!(server, client);
    served.expect("clean shutdown");

    let record: CheckpointRecord = serde_json::from_slice(
        &std::fs::read(dir.path().join("shop_vb_5.json")).expect("checkpoint file"),
    )
    .expect("record");
    assert_eq!(record.seq, 21);
}

#[tokio::test]
async fn load_restores_persisted_checkpoints() {
    let dir = tempfile::tempdir().expect("tempdir");
    FileCheckpointStore::new(dir.path())
        .persist(&CheckpointRecord {
            app_name: "shop".into(),
            partition: 3,
            seq: 50,
            updated_at: "2026-01-01T00:00:00+00:00".into(),
        })
        .expect("persist");

    let (worker_side, orchestrator_side) = tokio::io::duplex(64 * 1024);
    let (egress_tx, egress_rx) = mpsc::unbounded_channel();
    let server = serve(worker_side, dispatcher(egress_tx), egress_rx);

    let client = async {
        let mut orch = Orchestrator::new(orchestrator_side);
        orch.control(ControlOpcode::Init, -1, init_payload("shop", dir.path())).await;
        assert_eq!(ack(&orch.expect(ResponseOpcode::Ack).await).code, 0);
        orch.control(ControlOpcode::Load, -1, "function OnUpdate(doc, meta) {}").await;
        assert_eq!(ack(&orch.expect(ResponseOpcode::Ack).await).code, 0);

        orch.control(ControlOpcode::GetCheckpoint, 3, Bytes::new()).await;
        let checkpoint: serde_json::Value =
            serde_json::from_slice(&orch.expect(ResponseOpcode::Checkpoint).await.payload).expect("checkpoint");
        assert_eq!(checkpoint, serde_json::json!({"vb": 3, "seq": 50}));

        // Redelivery up to the restored checkpoint is suppressed.
        orch.send(&mutation(3, 50, serde_json::json!({}))).await;
        orch.send(&mutation(3, 51, serde_json::json!({}))).await;
        let first = orch.expect(ResponseOpcode::EventSuccess).await;
        assert_eq!(outcome(&first).seq, 51);

        orch.control(ControlOpcode::Terminate, -1, Bytes::new()).await;
        while orch.recv().await.is_some() {}
    };

    let (served, ()) = tokio::join!(server, client);
    served.expect("clean shutdown");
}

#[tokio::test]
async fn events_before_load_are_dropped() {
    let (worker_side, orchestrator_side) = tokio::io::duplex(64 * 1024);
    let (egress_tx, egress_rx) = mpsc::unbounded_channel();
    let server = serve(worker_side, dispatcher(egress_tx), egress_rx);

    let client = async {
        let mut orch = Orchestrator::new(orchestrator_side);
        orch.send(&mutation(1, 1, serde_json::json!({}))).await;
        orch.control(ControlOpcode::GetExecutionStats, -1, Bytes::new()).await;
        let stats = orch.expect(ResponseOpcode::Stats).await;
        assert_eq!(stats.payload.as_ref(), b"{}");
        drop(orch);
    };

    let (served, ()) = tokio::join!(server, client);
    served.expect("eof is a clean shutdown");
}

#[tokio::test]
async fn dials_the_orchestrator_over_tcp() {
    let dir = tempfile::tempdir().expect("tempdir");
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("addr").to_string();

    let worker = transport::connect_and_serve(&addr, WorkerOptions::default(), || Ok(EchoEngine));
    let client = async {
        let (socket, _) = listener.accept().await.expect("accept");
        let mut orch = Orchestrator::new(socket);
        orch.control(ControlOpcode::Init, -1, init_payload("tcp_app", dir.path())).await;
        assert_eq!(ack(&orch.expect(ResponseOpcode::Ack).await).code, 0);
        orch.control(ControlOpcode::Load, -1, "function OnUpdate(doc, meta) {}").await;
        assert_eq!(ack(&orch.expect(ResponseOpcode::Ack).await).code, 0);
        orch.send(&mutation(2, 3, serde_json::json!({}))).await;
        orch.expect(ResponseOpcode::EventSuccess).await;
        orch.control(ControlOpcode::Terminate, -1, Bytes::new()).await;
        while orch.recv().await.is_some() {}
    };

    let (served, ()) = tokio::join!(worker, client);
    served.expect("served");
}
