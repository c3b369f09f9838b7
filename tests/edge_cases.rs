#![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
//! Edge-case tests for decoding hostile input and for dispatcher termination
//! Covers malformed lengths, invalid encodings, framing errors and registry misuse

use packet_protocol::core::packet::{Packet, PacketId};
use packet_protocol::core::wire::{decode, encode};
use packet_protocol::error::ProtocolError;
use packet_protocol::packet;
use packet_protocol::protocol::{DispatchState, Dispatcher, PacketRegistry};
use std::collections::{BTreeMap, HashMap};
use std::io::{Cursor, Read};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

packet! {
    #[derive(Debug, Clone, Default, PartialEq)]
    pub struct Login {
        #[max_length(16)]
        pub user: String,
        pub session: u64,
    }
}

packet! {
    #[derive(Debug, Clone, Default, PartialEq)]
    pub struct Logout {}
}

packet! {
    #[derive(Debug, Clone, Default, PartialEq)]
    pub struct Telemetry {
        #[max_length(4)]
        pub readings: Vec<f32>,
    }
}

// ============================================================================
// DECODE EDGE CASES
// ============================================================================

#[test]
fn test_decode_wrong_region_length() {
    let bytes = encode(&7u32, None).unwrap();
    assert!(matches!(
        decode::<u32>(&bytes[..3], None),
        Err(ProtocolError::MalformedLength { len: 3, max: 4, .. })
    ));

    let mut body = Login::default().encode_body().unwrap();
    body.push(0);
    assert!(matches!(
        Login::from_body(&body),
        Err(ProtocolError::MalformedLength { .. })
    ));
}

#[test]
fn test_decode_text_length_beyond_bound() {
    let mut bytes = encode(&"ok".to_string(), Some(8)).unwrap();
    bytes[..4].copy_from_slice(&9u32.to_le_bytes());
    assert!(matches!(
        decode::<String>(&bytes, Some(8)),
        Err(ProtocolError::MalformedLength { what: "text", len: 9, max: 8 })
    ));
}

#[test]
fn test_decode_invalid_utf8() {
    let mut bytes = encode(&"ab".to_string(), Some(4)).unwrap();
    bytes[4] = 0xFF;
    assert!(matches!(
        decode::<String>(&bytes, Some(4)),
        Err(ProtocolError::InvalidEncoding(_))
    ));
}

#[test]
fn test_decode_invalid_char() {
    let bytes = 0xD800u32.to_le_bytes();
    assert!(matches!(
        decode::<char>(&bytes, None),
        Err(ProtocolError::InvalidEncoding(_))
    ));
}

#[test]
fn test_decode_sequence_count_beyond_bound() {
    let mut bytes = encode(&vec![1u16, 2], Some(2)).unwrap();
    bytes[..4].copy_from_slice(&3u32.to_le_bytes());
    assert!(matches!(
        decode::<Vec<u16>>(&bytes, Some(2)),
        Err(ProtocolError::MalformedLength { what: "sequence", len: 3, max: 2 })
    ));
}

#[test]
fn test_decode_duplicate_map_key() {
    let map: BTreeMap<u8, u8> = [(1, 10), (2, 20)].into();
    let mut bytes = encode(&map, Some(2)).unwrap();
    // second key rewritten to equal the first
    bytes[5] = 1;
    assert!(matches!(
        decode::<BTreeMap<u8, u8>>(&bytes, Some(2)),
        Err(ProtocolError::InvalidEncoding(_))
    ));
    assert!(matches!(
        decode::<HashMap<u8, u8>>(&bytes, Some(2)),
        Err(ProtocolError::InvalidEncoding(_))
    ));
}

#[test]
fn test_decode_ignores_padding_content() {
    let mut bytes = encode(&"hi".to_string(), Some(6)).unwrap();
    bytes[8] = 0xAA;
    assert_eq!(decode::<String>(&bytes, Some(6)).unwrap(), "hi");
}

// ============================================================================
// DISPATCHER EDGE CASES
// ============================================================================

fn counting<P: Packet>(dispatcher: &mut Dispatcher) -> Arc<AtomicUsize> {
    let count = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&count);
    dispatcher
        .register_handler::<P, _>(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        })
        .unwrap();
    count
}

#[test]
fn test_empty_stream_is_clean_close() {
    let mut dispatcher = Dispatcher::new(PacketRegistry::shared());
    let _ = counting::<Login>(&mut dispatcher);
    assert!(matches!(
        dispatcher.process_next(&mut Cursor::new(Vec::new())),
        Err(ProtocolError::ConnectionClosed)
    ));
    assert!(dispatcher.run(&mut Cursor::new(Vec::new())).is_ok());
}

#[test]
fn test_partial_identifier_is_closed() {
    let mut dispatcher = Dispatcher::new(PacketRegistry::shared());
    let _ = counting::<Login>(&mut dispatcher);
    let bytes = Login::default().to_bytes().unwrap();
    assert!(matches!(
        dispatcher.process_next(&mut Cursor::new(bytes[..9].to_vec())),
        Err(ProtocolError::ConnectionClosed)
    ));
    assert_eq!(dispatcher.state(), DispatchState::Closed);
}

#[test]
fn test_empty_body_packet_reads_only_identifier() {
    let mut dispatcher = Dispatcher::new(PacketRegistry::shared());
    let logouts = counting::<Logout>(&mut dispatcher);
    let logins = counting::<Login>(&mut dispatcher);

    let logout = Logout::default().to_bytes().unwrap();
    assert_eq!(logout.len(), 16);
    let stream = [logout.clone(), Login::default().to_bytes().unwrap(), logout].concat();
    dispatcher.run(&mut Cursor::new(stream)).unwrap();

    assert_eq!(logouts.load(Ordering::SeqCst), 2);
    assert_eq!(logins.load(Ordering::SeqCst), 1);
}

#[test]
fn test_unhandled_type_leaves_stream_aligned() {
    let registry = PacketRegistry::shared();
    registry.register::<Telemetry>().unwrap();
    let mut dispatcher = Dispatcher::new(registry);
    let logins = counting::<Login>(&mut dispatcher);

    let telemetry = Telemetry {
        readings: vec![1.5, -2.0],
    };
    let login = Login {
        user: "root".into(),
        session: 99,
    };
    let stream = [telemetry.to_bytes().unwrap(), login.to_bytes().unwrap()].concat();
    let mut cursor = Cursor::new(stream);

    dispatcher.process_next(&mut cursor).unwrap();
    assert_eq!(logins.load(Ordering::SeqCst), 0);
    assert_eq!(
        cursor.position() as usize,
        16 + Telemetry::body_size().unwrap()
    );

    dispatcher.process_next(&mut cursor).unwrap();
    assert_eq!(logins.load(Ordering::SeqCst), 1);
}

#[test]
fn test_unknown_identifier_stops_before_body() {
    let mut dispatcher = Dispatcher::new(PacketRegistry::shared());
    let logins = counting::<Login>(&mut dispatcher);

    let stranger = PacketId::from_name("elsewhere.Stranger");
    let stream = [
        stranger.as_bytes().to_vec(),
        Login::default().to_bytes().unwrap(),
    ]
    .concat();
    let mut cursor = Cursor::new(stream);

    match dispatcher.process_next(&mut cursor) {
        Err(ProtocolError::UnknownPacketType(id)) => assert_eq!(id, stranger),
        other => panic!("expected UnknownPacketType, got {other:?}"),
    }
    assert_eq!(cursor.position(), 16);
    assert!(dispatcher.is_closed());

    // the connection stays dead even though a valid message follows
    assert!(matches!(
        dispatcher.process_next(&mut cursor),
        Err(ProtocolError::ConnectionClosed)
    ));
    assert_eq!(logins.load(Ordering::SeqCst), 0);
}

#[test]
fn test_read_error_maps_to_connection_closed() {
    struct Broken;
    impl Read for Broken {
        fn read(&mut self, _buf: &mut [u8]) -> std::io::Result<usize> {
            Err(std::io::Error::new(std::io::ErrorKind::ConnectionReset, "reset"))
        }
    }

    let mut dispatcher = Dispatcher::new(PacketRegistry::shared());
    assert!(matches!(
        dispatcher.process_next(&mut Broken),
        Err(ProtocolError::ConnectionClosed)
    ));
}

#[test]
fn test_registration_errors_are_not_fatal() {
    let mut dispatcher = Dispatcher::new(PacketRegistry::shared());
    dispatcher.register_handler::<Login, _>(|_| {}).unwrap();
    let err = dispatcher.register_handler::<Login, _>(|_| {}).unwrap_err();
    assert!(!err.is_fatal());
    assert_eq!(dispatcher.state(), DispatchState::Idle);
}

#[test]
fn test_identifier_is_stable_across_registries() {
    let a = PacketRegistry::new();
    let b = PacketRegistry::new();
    assert_eq!(a.register::<Login>().unwrap(), b.register::<Login>().unwrap());
    assert_eq!(a.register::<Login>().unwrap(), Login::packet_id());
    assert_ne!(Login::packet_id(), Logout::packet_id());
}
