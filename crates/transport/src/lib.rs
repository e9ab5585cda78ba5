//! TCP link to the orchestrator.
//!
//! The worker dials the orchestrator, then reads length-delimited frames in a
//! loop and hands each to the [`Dispatcher`]. Responses from the dispatcher and
//! the execution thread share one egress channel drained by a writer task.

pub mod dispatch;
pub mod stream;

use std::io;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use socket2::{SockRef, TcpKeepalive};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use worker::{EngineError, ScriptEngine, WorkerError, WorkerOptions};

pub use dispatch::{Dispatcher, EngineFactory, Flow, ServicesFactory};
pub use stream::{LENGTH_PREFIX, StreamDecoder, delimit, encode_stream};

const KEEPALIVE: Duration = Duration::from_secs(30);

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("connection error: {0}")]
    Io(#[from] io::Error),

    #[error(transparent)]
    Worker(#[from] WorkerError),
}

/// Dial `addr` and serve it until Terminate or EOF.
pub async fn connect_and_serve<E, F>(
    addr: &str,
    options: WorkerOptions,
    engine_factory: F,
) -> Result<(), TransportError>
where
    E: ScriptEngine + 'static,
    F: Fn() -> Result<E, EngineError> + Send + Sync + 'static,
{
    let stream = TcpStream::connect(addr).await?;
    stream.set_nodelay(true)?;
    let keepalive = TcpKeepalive::new().with_time(KEEPALIVE);
    SockRef::from(&stream).set_tcp_keepalive(&keepalive)?;
    tracing::info!("connected to orchestrator at {}", addr);

    let (egress_tx, egress_rx) = mpsc::unbounded_channel();
    let dispatcher = Dispatcher::new(options, Arc::new(engine_factory), egress_tx);
    serve(stream, dispatcher, egress_rx).await
}

/// Drive one connection: read frames into `dispatcher`, write replies from
/// `egress`.
pub async fn serve<S, E>(
    stream: S,
    mut dispatcher: Dispatcher<E>,
    egress: mpsc::UnboundedReceiver<Bytes>,
) -> Result<(), TransportError>
where
    S: AsyncRead + AsyncWrite + Send + 'static,
    E: ScriptEngine + 'static,
{
    let (mut reader, writer) = tokio::io::split(stream);
    let writer_task = tokio::spawn(write_loop(writer, egress));

    let mut decoder = StreamDecoder::new(dispatcher.options().max_frame_size);
    let result = 'read: loop {
        loop {
            match decoder.next_frame() {
                Some(Ok(frame)) => match dispatcher.handle(frame).await {
                    Ok(Flow::Continue) => {}
                    Ok(Flow::Stop) => break 'read Ok(()),
                    Err(err) => break 'read Err(err),
                },
                Some(Err(err)) => dispatcher.record_framing_error(&err),
                None => break,
            }
        }

        match reader.read_buf(decoder.buffer_mut()).await {
            Ok(0) => {
                tracing::info!("orchestrator closed the connection");
                break Ok(());
            }
            Ok(_) => {}
            Err(err) => break Err(TransportError::Io(err)),
        }
    };

    dispatcher.terminate().await;
    // Dropping the dispatcher closes the last egress sender once the
    // response forwarder has drained.
    drop(dispatcher);
    match writer_task.await {
        Ok(Err(err)) => tracing::warn!("writer stopped: {}", err),
        Err(err) => tracing::warn!("writer task failed: {}", err),
        Ok(Ok(())) => {}
    }
    result
}

async fn write_loop<W: AsyncWrite>(
    writer: W,
    mut egress: mpsc::UnboundedReceiver<Bytes>,
) -> io::Result<()> {
    tokio::pin!(writer);
    while let Some(encoded) = egress.recv().await {
        writer.write_all(&delimit(&encoded)).await?;
        // Flush once per burst of queued responses.
        if egress.is_empty() {
            writer.flush().await?;
        }
    }
    writer.shutdown().await
}
