//! Blocking TCP transport.
//!
//! One OS thread per connection, each running its own [`Dispatcher`] over
//! the socket. All dispatchers of a server share one [`PacketRegistry`].

use crate::config::{ClientConfig, ServerConfig};
use crate::core::packet::Packet;
use crate::error::{constants, ProtocolError, Result};
use crate::protocol::dispatcher::Dispatcher;
use crate::protocol::registry::PacketRegistry;
use crate::utils::metrics::Metrics;
use std::collections::HashMap;
use std::io::{ErrorKind, Write};
use std::net::{Shutdown, SocketAddr, TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{debug, error, info, instrument, warn};

/// How long the accept loop sleeps when no client is waiting.
const ACCEPT_POLL_INTERVAL: Duration = Duration::from_millis(100);

fn timeout(duration: Duration) -> Option<Duration> {
    (!duration.is_zero()).then_some(duration)
}

/// One end of a TCP connection.
///
/// Writes are serialized through an internal lock so handlers on other
/// threads can reply while the reader thread is blocked.
#[derive(Debug)]
pub struct Connection {
    peer: SocketAddr,
    writer: Mutex<TcpStream>,
    metrics: Option<Arc<Metrics>>,
}

impl Connection {
    /// Connect to `config.address`.
    pub fn connect(config: &ClientConfig) -> Result<Self> {
        let addr: SocketAddr = config.address.parse().map_err(|e| {
            ProtocolError::ConfigError(format!("Invalid address '{}': {e}", config.address))
        })?;
        let stream = TcpStream::connect_timeout(&addr, config.connection_timeout)?;
        stream.set_write_timeout(timeout(config.write_timeout))?;
        debug!(peer = %addr, "Connected");
        Self::from_stream(stream, None)
    }

    fn from_stream(stream: TcpStream, metrics: Option<Arc<Metrics>>) -> Result<Self> {
        stream.set_nodelay(true)?;
        Ok(Self {
            peer: stream.peer_addr()?,
            writer: Mutex::new(stream),
            metrics,
        })
    }

    /// Count sent packets in `metrics`.
    pub fn with_metrics(mut self, metrics: Arc<Metrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer
    }

    /// Write `packet` as identifier followed by body.
    pub fn send_packet<P: Packet>(&self, packet: &P) -> Result<()> {
        let bytes = packet.to_bytes()?;
        self.send_bytes(&bytes)
    }

    fn send_bytes(&self, bytes: &[u8]) -> Result<()> {
        let mut writer = self.writer()?;
        writer.write_all(bytes)?;
        writer.flush()?;
        if let Some(metrics) = &self.metrics {
            metrics.packet_sent(bytes.len() as u64);
        }
        Ok(())
    }

    /// Run `dispatcher` over this connection on a dedicated thread.
    ///
    /// The thread ends when the peer closes the stream or the dispatcher
    /// hits a fatal error.
    pub fn spawn_reader(&self, mut dispatcher: Dispatcher) -> Result<JoinHandle<Result<()>>> {
        let mut reader = self.writer()?.try_clone()?;
        let peer = self.peer;
        let handle = thread::Builder::new()
            .name(format!("packet-reader-{peer}"))
            .spawn(move || dispatcher.run(&mut reader))?;
        Ok(handle)
    }

    /// Shut down both directions. A blocked reader wakes with `ConnectionClosed`.
    pub fn close(&self) -> Result<()> {
        match self.writer()?.shutdown(Shutdown::Both) {
            Err(e) if e.kind() != ErrorKind::NotConnected => Err(e.into()),
            _ => Ok(()),
        }
    }

    fn writer(&self) -> Result<MutexGuard<'_, TcpStream>> {
        self.writer
            .lock()
            .map_err(|_| ProtocolError::LockPoisoned(constants::ERR_CONNECTION_WRITE_LOCK))
    }
}

/// Stops a running [`Server`] from another thread.
#[derive(Debug, Clone)]
pub struct ShutdownHandle(Arc<AtomicBool>);

impl ShutdownHandle {
    pub fn shutdown(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_shutdown(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

type ClientTable = Arc<Mutex<HashMap<u64, Arc<Connection>>>>;

/// Thread-per-connection packet server.
pub struct Server {
    config: ServerConfig,
    listener: TcpListener,
    registry: Arc<PacketRegistry>,
    metrics: Arc<Metrics>,
    clients: ClientTable,
    shutdown: ShutdownHandle,
    next_id: AtomicU64,
}

impl Server {
    /// Validate `config` and bind its address.
    pub fn bind(config: ServerConfig, registry: Arc<PacketRegistry>) -> Result<Self> {
        let problems = config.validate();
        if !problems.is_empty() {
            return Err(ProtocolError::ConfigError(problems.join("; ")));
        }
        let listener = TcpListener::bind(&config.address)?;
        listener.set_nonblocking(true)?;
        Ok(Self {
            config,
            listener,
            registry,
            metrics: Arc::new(Metrics::new()),
            clients: Arc::new(Mutex::new(HashMap::new())),
            shutdown: ShutdownHandle(Arc::new(AtomicBool::new(false))),
            next_id: AtomicU64::new(1),
        })
    }

    pub fn with_metrics(mut self, metrics: Arc<Metrics>) -> Self {
        self.metrics = metrics;
        self
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    pub fn registry(&self) -> &Arc<PacketRegistry> {
        &self.registry
    }

    pub fn metrics(&self) -> &Arc<Metrics> {
        &self.metrics
    }

    pub fn shutdown_handle(&self) -> ShutdownHandle {
        self.shutdown.clone()
    }

    /// Currently connected clients.
    pub fn clients(&self) -> Result<Vec<Arc<Connection>>> {
        Ok(lock_clients(&self.clients)?.values().cloned().collect())
    }

    /// Send `packet` to every connected client.
    ///
    /// Returns how many clients it reached. A failed write is logged and
    /// leaves that client to its reader thread.
    pub fn broadcast<P: Packet>(&self, packet: &P) -> Result<usize> {
        let bytes = packet.to_bytes()?;
        let mut delivered = 0;
        for client in self.clients()? {
            match client.send_bytes(&bytes) {
                Ok(()) => delivered += 1,
                Err(e) => warn!(peer = %client.peer, error = %e, "Broadcast write failed"),
            }
        }
        Ok(delivered)
    }

    /// Accept clients until the shutdown handle fires.
    ///
    /// `setup` runs once per accepted client, before its reader starts, and
    /// registers that client's handlers. Rejecting a client is done by
    /// returning an error.
    #[instrument(skip(self, setup), fields(address = %self.config.address))]
    pub fn run<F>(&self, setup: F) -> Result<()>
    where
        F: Fn(&mut Dispatcher, &Arc<Connection>) -> Result<()>,
    {
        info!("Server listening");
        let mut readers = Vec::new();

        while !self.shutdown.is_shutdown() {
            match self.listener.accept() {
                Ok((stream, peer)) => match self.accept(stream, peer, &setup) {
                    Ok(Some(handle)) => readers.push(handle),
                    Ok(None) => {}
                    Err(e) => warn!(peer = %peer, error = %e, "Failed to set up connection"),
                },
                Err(e) if e.kind() == ErrorKind::WouldBlock => thread::sleep(ACCEPT_POLL_INTERVAL),
                Err(e) => error!(error = %e, "Error accepting connection"),
            }
            readers.retain(|handle: &JoinHandle<()>| !handle.is_finished());
        }

        info!("Shutting down server, closing connections");
        for client in self.clients()? {
            if let Err(e) = client.close() {
                debug!(peer = %client.peer, error = %e, "Close failed");
            }
        }
        for handle in readers {
            if handle.join().is_err() {
                error!("Connection thread panicked");
            }
        }
        self.metrics.log_metrics();
        Ok(())
    }

    fn accept<F>(
        &self,
        stream: TcpStream,
        peer: SocketAddr,
        setup: &F,
    ) -> Result<Option<JoinHandle<()>>>
    where
        F: Fn(&mut Dispatcher, &Arc<Connection>) -> Result<()>,
    {
        if lock_clients(&self.clients)?.len() >= self.config.max_connections {
            warn!(peer = %peer, max = self.config.max_connections, "Connection limit reached, rejecting");
            return Ok(None);
        }

        stream.set_nonblocking(false)?;
        stream.set_read_timeout(timeout(self.config.read_timeout))?;
        stream.set_write_timeout(timeout(self.config.write_timeout))?;
        let mut reader = stream.try_clone()?;
        let connection = Arc::new(Connection::from_stream(stream, Some(Arc::clone(&self.metrics)))?);

        let mut dispatcher =
            Dispatcher::new(Arc::clone(&self.registry)).with_metrics(Arc::clone(&self.metrics));
        if let Err(e) = setup(&mut dispatcher, &connection) {
            connection.close()?;
            return Err(e);
        }

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        lock_clients(&self.clients)?.insert(id, Arc::clone(&connection));
        self.metrics.connection_established();
        info!(peer = %peer, id, "Client connected");

        let clients = Arc::clone(&self.clients);
        let metrics = Arc::clone(&self.metrics);
        let handle = thread::Builder::new()
            .name(format!("packet-conn-{id}"))
            .spawn(move || {
                let result = dispatcher.run(&mut reader);
                if let Ok(mut clients) = lock_clients(&clients) {
                    clients.remove(&id);
                }
                metrics.connection_closed();
                match result {
                    Ok(()) => info!(peer = %peer, id, "Client disconnected"),
                    Err(e) => warn!(peer = %peer, id, error = %e, "Client dropped on protocol error"),
                }
            })?;
        Ok(Some(handle))
    }
}

fn lock_clients(
    clients: &ClientTable,
) -> Result<MutexGuard<'_, HashMap<u64, Arc<Connection>>>> {
    clients
        .lock()
        .map_err(|_| ProtocolError::LockPoisoned(constants::ERR_CLIENT_TABLE_LOCK))
}

impl std::fmt::Debug for Server {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Server")
            .field("address", &self.config.address)
            .field("shutdown", &self.shutdown.is_shutdown())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::expect_used)]

    use super::*;

    crate::packet! {
        #[derive(Debug, Clone, Default, PartialEq)]
        struct Note {
            #[max_length(32)]
            text: String,
        }
    }

    fn server() -> Server {
        let config = ServerConfig {
            address: "127.0.0.1:0".into(),
            ..ServerConfig::default()
        };
        Server::bind(config, PacketRegistry::shared()).unwrap()
    }

    #[test]
    fn bind_rejects_invalid_config() {
        let config = ServerConfig {
            max_connections: 0,
            ..ServerConfig::default()
        };
        assert!(matches!(
            Server::bind(config, PacketRegistry::shared()),
            Err(ProtocolError::ConfigError(_))
        ));
    }

    #[test]
    fn connect_rejects_bad_address() {
        let config = ClientConfig {
            address: "not an address".into(),
            ..ClientConfig::default()
        };
        assert!(matches!(
            Connection::connect(&config),
            Err(ProtocolError::ConfigError(_))
        ));
    }

    #[test]
    fn shutdown_stops_idle_server() {
        let server = server();
        let handle = server.shutdown_handle();
        let stopper = thread::spawn(move || {
            thread::sleep(Duration::from_millis(150));
            handle.shutdown();
        });
        server.run(|_, _| Ok(())).unwrap();
        stopper.join().unwrap();
        assert!(server.clients().unwrap().is_empty());
        assert_eq!(server.broadcast(&Note::default()).unwrap(), 0);
    }
}
