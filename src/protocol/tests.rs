// test-only module included via protocol/mod.rs
#![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

use crate::core::codec::Frame;
use crate::core::packet::{Packet, PacketId};
use crate::error::ProtocolError;
use crate::protocol::dispatcher::{DispatchState, Dispatcher};
use crate::protocol::registry::PacketRegistry;
use crate::utils::metrics::Metrics;
use std::io::Cursor;
use std::sync::{Arc, Mutex};

crate::packet! {
    #[derive(Debug, Clone, Default, PartialEq)]
    struct Person {
        #[max_length(16)]
        name: String,
        age: i32,
    }
}

crate::packet! {
    #[derive(Debug, Clone, Default, PartialEq)]
    struct Heartbeat {}
}

crate::packet! {
    #[derive(Debug, Clone, Default, PartialEq)]
    struct Tally {
        counts: Vec<u16>,
    }
}

fn stream_of(chunks: &[Vec<u8>]) -> Cursor<Vec<u8>> {
    Cursor::new(chunks.concat())
}

fn collecting<P: Packet + Clone>(dispatcher: &mut Dispatcher) -> Arc<Mutex<Vec<P>>> {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&seen);
    dispatcher
        .register_handler::<P, _>(move |packet| sink.lock().unwrap().push(packet))
        .unwrap();
    seen
}

#[test]
fn dispatches_packets_in_stream_order() {
    let mut dispatcher = Dispatcher::new(PacketRegistry::shared());
    let people = collecting::<Person>(&mut dispatcher);
    let beats = collecting::<Heartbeat>(&mut dispatcher);

    let alice = Person { name: "Alice".into(), age: 30 };
    let bob = Person { name: "Bob".into(), age: 25 };
    let mut stream = stream_of(&[
        alice.to_bytes().unwrap(),
        Heartbeat::default().to_bytes().unwrap(),
        bob.to_bytes().unwrap(),
    ]);

    dispatcher.run(&mut stream).unwrap();

    assert_eq!(*people.lock().unwrap(), vec![alice, bob]);
    assert_eq!(beats.lock().unwrap().len(), 1);
    assert!(dispatcher.is_closed());
}

#[test]
fn process_next_returns_to_idle() {
    let mut dispatcher = Dispatcher::new(PacketRegistry::shared());
    let people = collecting::<Person>(&mut dispatcher);
    let mut stream = stream_of(&[Person { name: "Bob".into(), age: 25 }.to_bytes().unwrap()]);

    dispatcher.process_next(&mut stream).unwrap();
    assert_eq!(dispatcher.state(), DispatchState::Idle);
    assert_eq!(people.lock().unwrap()[0].age, 25);
}

#[test]
fn types_without_local_handler_are_consumed_and_dropped() {
    let registry = PacketRegistry::shared();
    registry.register::<Tally>().unwrap();

    let metrics = Arc::new(Metrics::new());
    let mut dispatcher = Dispatcher::new(Arc::clone(&registry)).with_metrics(Arc::clone(&metrics));
    let people = collecting::<Person>(&mut dispatcher);

    let mut stream = stream_of(&[
        Tally { counts: vec![1, 2, 3] }.to_bytes().unwrap(),
        Person { name: "Carol".into(), age: 41 }.to_bytes().unwrap(),
    ]);
    dispatcher.run(&mut stream).unwrap();

    assert_eq!(people.lock().unwrap().len(), 1);
    let snapshot = metrics.snapshot();
    assert_eq!(snapshot.packets_received, 2);
    assert_eq!(snapshot.packets_unhandled, 1);
}

#[test]
fn unknown_identifier_closes_the_dispatcher() {
    let mut dispatcher = Dispatcher::new(PacketRegistry::shared());
    let people = collecting::<Person>(&mut dispatcher);

    let mut bytes = PacketId::from_name("nobody.Home").as_bytes().to_vec();
    bytes.extend(Person { name: "Eve".into(), age: 1 }.to_bytes().unwrap());
    let mut stream = Cursor::new(bytes);

    let err = dispatcher.run(&mut stream).unwrap_err();
    assert!(matches!(err, ProtocolError::UnknownPacketType(_)));
    assert!(dispatcher.is_closed());
    assert!(people.lock().unwrap().is_empty());

    assert!(matches!(
        dispatcher.process_next(&mut stream),
        Err(ProtocolError::ConnectionClosed)
    ));
}

#[test]
fn truncated_body_is_connection_closed() {
    let mut dispatcher = Dispatcher::new(PacketRegistry::shared());
    let _people = collecting::<Person>(&mut dispatcher);
    let bytes = Person { name: "Bob".into(), age: 25 }.to_bytes().unwrap();
    let mut stream = Cursor::new(bytes[..bytes.len() - 3].to_vec());

    assert!(matches!(
        dispatcher.process_next(&mut stream),
        Err(ProtocolError::ConnectionClosed)
    ));
    assert_eq!(dispatcher.state(), DispatchState::Closed);
}

#[test]
fn invalid_body_terminates_the_connection() {
    let mut dispatcher = Dispatcher::new(PacketRegistry::shared());
    let _people = collecting::<Person>(&mut dispatcher);

    let mut bytes = Person { name: "Bob".into(), age: 25 }.to_bytes().unwrap();
    // declared name length beyond the 16-byte override
    bytes[16..20].copy_from_slice(&99u32.to_le_bytes());
    let metrics = Arc::new(Metrics::new());
    let mut dispatcher = dispatcher.with_metrics(Arc::clone(&metrics));

    let err = dispatcher.run(&mut Cursor::new(bytes)).unwrap_err();
    assert!(matches!(err, ProtocolError::MalformedLength { .. }));
    assert_eq!(metrics.snapshot().protocol_errors, 1);
}

#[test]
fn duplicate_handler_is_rejected() {
    let mut dispatcher = Dispatcher::new(PacketRegistry::shared());
    dispatcher.register_handler::<Person, _>(|_| {}).unwrap();
    assert!(matches!(
        dispatcher.register_handler::<Person, _>(|_| {}),
        Err(ProtocolError::DuplicateHandler(_))
    ));
    assert!(!dispatcher.is_closed());
}

#[test]
fn handlers_are_per_dispatcher() {
    let registry = PacketRegistry::shared();
    let mut first = Dispatcher::new(Arc::clone(&registry));
    let mut second = Dispatcher::new(Arc::clone(&registry));
    first.register_handler::<Person, _>(|_| {}).unwrap();
    second.register_handler::<Person, _>(|_| {}).unwrap();

    assert!(first.handles::<Person>());
    assert!(!first.handles::<Heartbeat>());
    assert_eq!(registry.len().unwrap(), 1);
}

#[test]
fn dispatch_frame_checks_body_length() {
    let mut dispatcher = Dispatcher::new(PacketRegistry::shared());
    let people = collecting::<Person>(&mut dispatcher);

    let frame = Frame::from_packet(&Person { name: "Dan".into(), age: 7 }).unwrap();
    dispatcher.dispatch_frame(&frame).unwrap();
    assert_eq!(people.lock().unwrap()[0].name, "Dan");

    let short = Frame {
        id: frame.id,
        body: frame.body.slice(..10),
    };
    assert!(matches!(
        dispatcher.dispatch_frame(&short),
        Err(ProtocolError::MalformedLength { .. })
    ));
    assert!(dispatcher.is_closed());
}
