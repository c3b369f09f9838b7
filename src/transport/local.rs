//! Unix domain socket transport on tokio.
//!
//! Frames are split off the socket by [`FrameCodec`] and handed to a
//! per-connection [`Dispatcher`]. Handlers reply through an [`Outbox`],
//! which queues frames for the connection's writer task. Frames already
//! queued when the read side ends are still written before the socket closes.

use futures::{SinkExt, StreamExt};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::UnixListener;
use tokio::net::UnixStream;
use tokio::sync::{mpsc, Mutex};
use tokio_util::codec::{Framed, FramedRead, FramedWrite};
use tracing::{debug, error, info, instrument, warn};

use crate::core::codec::{Frame, FrameCodec};
use crate::core::packet::Packet;
use crate::error::{ProtocolError, Result};
use crate::protocol::dispatcher::Dispatcher;
use crate::protocol::registry::PacketRegistry;
use crate::utils::metrics::Metrics;

/// How long shutdown waits for open connections to finish.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(10);

/// How long a closing connection may spend flushing queued replies.
const WRITER_DRAIN: Duration = Duration::from_secs(5);

/// Outbound queue of one connection.
#[derive(Debug, Clone)]
pub struct Outbox {
    tx: mpsc::UnboundedSender<Frame>,
}

impl Outbox {
    /// Queue `packet` for writing. Fails once the connection is gone.
    pub fn send_packet<P: Packet>(&self, packet: &P) -> Result<()> {
        self.send_frame(Frame::from_packet(packet)?)
    }

    pub fn send_frame(&self, frame: Frame) -> Result<()> {
        self.tx.send(frame).map_err(|_| ProtocolError::ConnectionClosed)
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

/// Start a Unix domain socket server that stops on CTRL+C.
#[instrument(skip(path, registry, metrics, setup), fields(socket_path = %path.as_ref().display()))]
pub async fn start_server<P, F>(
    path: P,
    registry: Arc<PacketRegistry>,
    metrics: Arc<Metrics>,
    setup: F,
) -> Result<()>
where
    P: AsRef<Path>,
    F: Fn(&mut Dispatcher, Outbox) -> Result<()> + Send + Sync + 'static,
{
    let (shutdown_tx, shutdown_rx) = mpsc::channel::<()>(1);

    tokio::spawn(async move {
        if let Ok(()) = tokio::signal::ctrl_c().await {
            info!("Received CTRL+C signal, shutting down");
            let _ = shutdown_tx.send(()).await;
        }
    });

    start_server_with_shutdown(path, registry, metrics, setup, shutdown_rx).await
}

/// Start a Unix domain socket server with an external shutdown channel.
///
/// `setup` runs once per accepted connection and registers its handlers.
/// Traffic on every connection is counted in `metrics`. Any previous socket
/// file at `path` is replaced, and removed again on shutdown.
#[instrument(skip(path, registry, metrics, setup, shutdown_rx), fields(socket_path = %path.as_ref().display()))]
pub async fn start_server_with_shutdown<P, F>(
    path: P,
    registry: Arc<PacketRegistry>,
    metrics: Arc<Metrics>,
    setup: F,
    mut shutdown_rx: mpsc::Receiver<()>,
) -> Result<()>
where
    P: AsRef<Path>,
    F: Fn(&mut Dispatcher, Outbox) -> Result<()> + Send + Sync + 'static,
{
    if path.as_ref().exists() {
        tokio::fs::remove_file(&path).await.ok();
    }

    let path_string = path.as_ref().to_string_lossy().to_string();
    let listener = UnixListener::bind(&path)?;
    info!(path = %path_string, "Listening on unix socket");

    let active_connections = Arc::new(Mutex::new(0u32));

    loop {
        tokio::select! {
            _ = shutdown_rx.recv() => {
                info!("Shutting down server. Waiting for connections to close...");

                let timeout = tokio::time::sleep(SHUTDOWN_GRACE);
                tokio::pin!(timeout);

                loop {
                    tokio::select! {
                        _ = &mut timeout => {
                            warn!("Shutdown timeout reached, forcing exit");
                            break;
                        }
                        _ = tokio::time::sleep(Duration::from_millis(50)) => {
                            let connections = *active_connections.lock().await;
                            if connections == 0 {
                                info!("All connections closed, shutting down");
                                break;
                            }
                            debug!(connections, "Waiting for connections to close");
                        }
                    }
                }

                metrics.log_metrics();
                if Path::new(&path_string).exists() {
                    if let Err(e) = tokio::fs::remove_file(&path_string).await {
                        error!(error = %e, path = %path_string, "Failed to remove socket file");
                    } else {
                        info!(path = %path_string, "Removed socket file");
                    }
                }

                return Ok(());
            }

            accept_result = listener.accept() => {
                match accept_result {
                    Ok((stream, _)) => {
                        let mut dispatcher = Dispatcher::new(Arc::clone(&registry))
                            .with_metrics(Arc::clone(&metrics));
                        let (tx, rx) = mpsc::unbounded_channel();
                        if let Err(e) = setup(&mut dispatcher, Outbox { tx }) {
                            warn!(error = %e, "Connection setup failed, dropping client");
                            continue;
                        }

                        *active_connections.lock().await += 1;
                        metrics.connection_established();
                        let active_connections = Arc::clone(&active_connections);
                        let registry = Arc::clone(&registry);
                        let metrics = Arc::clone(&metrics);

                        tokio::spawn(async move {
                            let result =
                                serve_connection(stream, registry, dispatcher, rx, Arc::clone(&metrics)).await;
                            if let Err(e) = result {
                                warn!(error = %e, "Connection terminated");
                                metrics.protocol_error();
                            }
                            metrics.connection_closed();
                            *active_connections.lock().await -= 1;
                        });
                    }
                    Err(e) => {
                        error!(error = %e, "Error accepting connection");
                    }
                }
            }
        }
    }
}

async fn serve_connection(
    stream: UnixStream,
    registry: Arc<PacketRegistry>,
    mut dispatcher: Dispatcher,
    mut outbox: mpsc::UnboundedReceiver<Frame>,
    metrics: Arc<Metrics>,
) -> Result<()> {
    let (read_half, write_half) = stream.into_split();
    let mut frames = FramedRead::new(read_half, FrameCodec::new(Arc::clone(&registry)));
    let mut sink = FramedWrite::new(write_half, FrameCodec::new(registry));

    let mut writer = tokio::spawn(async move {
        while let Some(frame) = outbox.recv().await {
            let bytes = frame.wire_len() as u64;
            if let Err(e) = sink.send(frame).await {
                debug!(error = %e, "Write failed, stopping writer");
                break;
            }
            metrics.packet_sent(bytes);
        }
    });

    let result = loop {
        match frames.next().await {
            Some(Ok(frame)) => {
                debug!(id = %frame.id, bytes = frame.body.len(), "Frame received");
                if let Err(e) = dispatcher.dispatch_frame(&frame) {
                    break Err(e);
                }
            }
            Some(Err(ProtocolError::ConnectionClosed)) | None => break Ok(()),
            Some(Err(e)) => break Err(e),
        }
    };

    // drops the handlers and with them every outbox clone they hold,
    // so the writer ends once the queue is empty
    drop(dispatcher);
    if tokio::time::timeout(WRITER_DRAIN, &mut writer).await.is_err() {
        warn!("Queued replies not flushed in time, closing anyway");
        writer.abort();
    }
    result
}

/// Connect to a local socket served by [`start_server_with_shutdown`].
#[instrument(skip(path, registry), fields(socket_path = %path.as_ref().display()))]
pub async fn connect<P: AsRef<Path>>(
    path: P,
    registry: Arc<PacketRegistry>,
) -> Result<Framed<UnixStream, FrameCodec>> {
    let stream = UnixStream::connect(path).await?;
    Ok(Framed::new(stream, FrameCodec::new(registry)))
}
