use std::io::{Read, Write};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use marquee_bus::{CallError, ConnectionId, CorrelationTable, DeliveryError, Recipient};
use marquee_ipc::{Arg, Envelope, FrameDecoder, PipeTransport, TransportConfig, DEFAULT_MAX_FRAME_LEN};
use pretty_assertions::assert_eq;

const CALLS: usize = 16;

fn read_calls(reader: &mut os_pipe::PipeReader, count: usize) -> Vec<Envelope> {
    let mut decoder = FrameDecoder::default();
    let mut calls = Vec::new();
    let mut buffer = [0u8; 4096];
    while calls.len() < count {
        let read = reader.read(&mut buffer).expect("peer read");
        assert!(read > 0, "host closed the pipe");
        for payload in decoder.decode(&buffer[..read]).expect("decode") {
            calls.push(Envelope::from_payload(&payload).expect("envelope"));
        }
    }
    calls
}

#[test]
fn concurrent_calls_each_get_their_own_response() {
    let (host_read, mut peer_write) = os_pipe::pipe().unwrap();
    let (mut peer_read, host_write) = os_pipe::pipe().unwrap();

    let table = Arc::new(CorrelationTable::default());
    let connection = ConnectionId::next();
    let resolver = Arc::clone(&table);
    let transport = Arc::new(
        PipeTransport::new(
            host_read,
            host_write,
            TransportConfig::default(),
            move |payload| {
                if let Ok(envelope) = Envelope::from_payload(&payload) {
                    resolver.resolve(connection, &envelope);
                }
            },
        )
        .unwrap(),
    );

    // The peer answers in reverse order, after a response nobody asked for.
    let peer = thread::spawn(move || {
        let calls = read_calls(&mut peer_read, CALLS);
        let mut stream = Envelope::callback(9_999, 0, "null")
            .encode(DEFAULT_MAX_FRAME_LEN)
            .unwrap();
        for call in calls.iter().rev() {
            let slot = call.int_arg(0).unwrap();
            let reply = Envelope::callback(call.id().unwrap(), slot, format!("{{\"slot\":{slot}}}"));
            stream.extend(reply.encode(DEFAULT_MAX_FRAME_LEN).unwrap());
        }
        peer_write.write_all(&stream).unwrap();
        peer_write
    });

    let callers: Vec<_> = (0..CALLS as i64)
        .map(|slot| {
            let table = Arc::clone(&table);
            let transport = Arc::clone(&transport);
            thread::spawn(move || {
                let call = table.call(connection, transport.as_ref(), "echo", vec![Arg::Int(slot)]);
                (slot, call.wait(Duration::from_secs(5)))
            })
        })
        .collect();

    for caller in callers {
        let (slot, result) = caller.join().unwrap();
        let response = result.expect("response");
        assert_eq!(response.slot, slot);
        assert_eq!(response.json().unwrap(), serde_json::json!({ "slot": slot }));
    }
    assert_eq!(table.pending_count(), 0);

    let _peer_write = peer.join().unwrap();
    transport.disconnect();
}

#[test]
fn calls_on_a_closed_pipe_fail_fast() {
    let (host_read, _peer_write) = os_pipe::pipe().unwrap();
    let (_peer_read, host_write) = os_pipe::pipe().unwrap();
    let transport =
        PipeTransport::new(host_read, host_write, TransportConfig::default(), |_| {}).unwrap();
    transport.disconnect();

    assert!(matches!(
        transport.deliver(&Envelope::event("late", "")),
        Err(DeliveryError::Closed)
    ));

    let table = CorrelationTable::default();
    let call = table.call(ConnectionId::next(), &transport, "getStatus", vec![Arg::Int(0)]);
    assert_eq!(call.wait(Duration::from_millis(100)), Err(CallError::Closed));
}
