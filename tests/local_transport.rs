//! Unix domain socket transport tests

#![cfg(unix)]
#![allow(clippy::unwrap_used, clippy::expect_used)]

use futures::{SinkExt, StreamExt};
use packet_protocol::core::codec::Frame;
use packet_protocol::error::Result;
use packet_protocol::packet;
use packet_protocol::protocol::{Dispatcher, PacketRegistry};
use packet_protocol::transport::local::{self, Outbox};
use packet_protocol::utils::Metrics;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout};

packet! {
    #[derive(Debug, Clone, Default, PartialEq)]
    pub struct Ping {
        pub nonce: u64,
    }
}

packet! {
    #[derive(Debug, Clone, Default, PartialEq)]
    pub struct Pong {
        pub nonce: u64,
        /// Name of the answering node
        #[max_length(8)]
        pub node: String,
    }
}

fn answer_pings(dispatcher: &mut Dispatcher, outbox: Outbox) -> Result<()> {
    dispatcher.register_handler::<Ping, _>(move |ping| {
        let _ = outbox.send_packet(&Pong {
            nonce: ping.nonce,
            node: "unix".into(),
        });
    })?;
    Ok(())
}

async fn wait_for_socket(path: &Path) {
    for _ in 0..100 {
        if path.exists() {
            return;
        }
        sleep(Duration::from_millis(10)).await;
    }
}

fn client_registry() -> Arc<PacketRegistry> {
    let registry = PacketRegistry::shared();
    registry.register::<Pong>().unwrap();
    registry
}

async fn ping_server(
    path: PathBuf,
    metrics: Arc<Metrics>,
) -> (mpsc::Sender<()>, JoinHandle<Result<()>>) {
    let (shutdown_tx, shutdown_rx) = mpsc::channel(1);
    let server = tokio::spawn(local::start_server_with_shutdown(
        path.clone(),
        PacketRegistry::shared(),
        metrics,
        answer_pings,
        shutdown_rx,
    ));
    wait_for_socket(&path).await;
    (shutdown_tx, server)
}

async fn stop(shutdown_tx: mpsc::Sender<()>, server: JoinHandle<Result<()>>) {
    shutdown_tx.send(()).await.unwrap();
    timeout(Duration::from_secs(5), server)
        .await
        .expect("server stops")
        .unwrap()
        .unwrap();
}

#[tokio::test]
async fn test_ping_pong_over_unix_socket() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("packets.sock");
    let metrics = Arc::new(Metrics::new());
    let (shutdown_tx, server) = ping_server(path.clone(), Arc::clone(&metrics)).await;

    let mut framed = local::connect(&path, client_registry()).await.unwrap();
    for nonce in [11u64, 12, 13] {
        framed
            .send(Frame::from_packet(&Ping { nonce }).unwrap())
            .await
            .unwrap();
        let frame = timeout(Duration::from_secs(5), framed.next())
            .await
            .expect("reply in time")
            .expect("stream open")
            .expect("valid frame");
        let pong = frame.decode::<Pong>().unwrap().expect("a Pong");
        assert_eq!(pong.nonce, nonce);
        assert_eq!(pong.node, "unix");
    }

    drop(framed);
    stop(shutdown_tx, server).await;
    assert!(!path.exists());

    let snapshot = metrics.snapshot();
    assert_eq!(snapshot.connections_total, 1);
    assert_eq!(snapshot.connections_active, 0);
    assert_eq!(snapshot.packets_received, 3);
    assert_eq!(snapshot.packets_sent, 3);
    assert_eq!(snapshot.protocol_errors, 0);
}

#[tokio::test]
async fn test_reply_survives_client_half_close() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("half-close.sock");
    let metrics = Arc::new(Metrics::new());
    let (shutdown_tx, server) = ping_server(path.clone(), Arc::clone(&metrics)).await;

    let clients: Vec<_> = (0..20u64)
        .map(|nonce| {
            let path = path.clone();
            tokio::spawn(async move {
                let mut framed = local::connect(&path, client_registry()).await.unwrap();
                framed
                    .send(Frame::from_packet(&Ping { nonce }).unwrap())
                    .await
                    .unwrap();
                // nothing more to send; the reply must still arrive
                framed.get_mut().shutdown().await.unwrap();

                let frame = timeout(Duration::from_secs(5), framed.next())
                    .await
                    .expect("reply in time")
                    .expect("reply before close")
                    .expect("valid frame");
                let pong = frame.decode::<Pong>().unwrap().expect("a Pong");
                assert_eq!(pong.nonce, nonce);

                let end = timeout(Duration::from_secs(5), framed.next())
                    .await
                    .expect("server closes in time");
                assert!(end.is_none());
            })
        })
        .collect();
    for client in clients {
        client.await.unwrap();
    }

    stop(shutdown_tx, server).await;
    let snapshot = metrics.snapshot();
    assert_eq!(snapshot.packets_received, 20);
    assert_eq!(snapshot.packets_sent, 20);
}

#[tokio::test]
async fn test_unknown_frame_closes_connection() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("strict.sock");
    let metrics = Arc::new(Metrics::new());

    let (shutdown_tx, shutdown_rx) = mpsc::channel(1);
    let server = tokio::spawn(local::start_server_with_shutdown(
        path.clone(),
        PacketRegistry::shared(),
        Arc::clone(&metrics),
        |dispatcher, _outbox| {
            dispatcher.register_handler::<Ping, _>(|_| {})?;
            Ok(())
        },
        shutdown_rx,
    ));
    wait_for_socket(&path).await;

    let client_registry = PacketRegistry::shared();
    client_registry.register::<Ping>().unwrap();
    let mut framed = local::connect(&path, client_registry).await.unwrap();
    framed
        .send(Frame::from_packet(&Pong { nonce: 1, node: "x".into() }).unwrap())
        .await
        .unwrap();

    // the server drops the connection, which ends the client stream
    let next = timeout(Duration::from_secs(5), framed.next())
        .await
        .expect("server closes in time");
    assert!(next.is_none());

    stop(shutdown_tx, server).await;
    let snapshot = metrics.snapshot();
    assert_eq!(snapshot.protocol_errors, 1);
    assert_eq!(snapshot.packets_received, 0);
}
