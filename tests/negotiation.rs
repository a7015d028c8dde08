//! Backend negotiation tests without TLS
//!
//! These tests verify how the negotiator hands over to a protocol handler:
//! - Queued writes are flushed once, in order
//! - Pre-known protocols install immediately
//! - Unknown or unserved protocols close the connection
//! - Teardown during negotiation

use backend_bridge::h2::{StreamFrame, CONNECTION_PREFACE};
use backend_bridge::testing::{RecordingClientLeg, RecordingTransport};
use backend_bridge::{
    BackendConfig, BackendPipeline, ConnectionContext, Error, ForwardHandler, Message, Protocol,
    ProtocolHandler, ProtocolRegistry, ServerAddr, ALPN_HTTP_1_1, ALPN_HTTP_2,
};
use bytes::Bytes;
use std::sync::Arc;
use std::thread;

struct Fixture {
    connection: Arc<ConnectionContext>,
    pipeline: Arc<BackendPipeline>,
    transport: Arc<RecordingTransport>,
    client: Arc<RecordingClientLeg>,
}

fn fixture_with(registry: ProtocolRegistry) -> Fixture {
    backend_bridge::logging::init_test_tracing();
    let transport = Arc::new(RecordingTransport::new());
    let client = Arc::new(RecordingClientLeg::new());
    let config = Arc::new(BackendConfig::builder().build().unwrap());
    let connection = Arc::new(ConnectionContext::new(
        client.clone(),
        ServerAddr::new("origin.test", 8080),
        false,
        Arc::new(registry),
        config,
    ));
    let pipeline = BackendPipeline::new(connection.clone(), transport.clone());
    Fixture {
        connection,
        pipeline,
        transport,
        client,
    }
}

fn fixture() -> Fixture {
    fixture_with(ProtocolRegistry::with_defaults())
}

fn bytes(data: &'static str) -> Message {
    Message::Bytes(Bytes::from_static(data.as_bytes()))
}

#[test]
fn test_queued_writes_flushed_in_order() {
    let f = fixture();
    f.pipeline.activate();

    f.pipeline.write(bytes("GET / HTTP/1.1\r\n"));
    f.pipeline.write(bytes("Host: origin.test\r\n"));
    assert!(f.pipeline.is_negotiating());

    f.connection.tls().set_protocols(vec![ALPN_HTTP_1_1.into()]);
    f.pipeline.write(bytes("\r\n"));
    assert_eq!(f.transport.written_len(), 0);

    assert!(f.connection.tls().force_protocol(ALPN_HTTP_1_1));
    assert_eq!(f.pipeline.protocol(), Some(Protocol::Http1));
    assert_eq!(
        &f.transport.take_written()[..],
        b"GET / HTTP/1.1\r\nHost: origin.test\r\n\r\n"
    );

    // Direct writes after installation
    f.pipeline.write(bytes("next"));
    assert_eq!(&f.transport.take_written()[..], b"next");

    f.pipeline
        .on_read(Bytes::from_static(b"HTTP/1.1 200 OK\r\n\r\n"));
    assert_eq!(
        &f.client.received_bytes()[..],
        b"HTTP/1.1 200 OK\r\n\r\n"
    );
    assert!(!f.connection.tls().is_negotiated());
}

#[test]
fn test_pre_resolved_http2_installs_on_activate() {
    let f = fixture();
    f.connection.tls().set_protocols(vec![ALPN_HTTP_2.into()]);
    f.connection.tls().force_protocol("http/2");

    f.pipeline.activate();
    assert_eq!(f.pipeline.protocol(), Some(Protocol::Http2));
    assert!(f.transport.take_written().starts_with(CONNECTION_PREFACE));
}

#[test]
fn test_writes_before_http2_install_are_not_lost() {
    let f = fixture();
    f.pipeline.activate();
    f.pipeline.write(Message::Frame(StreamFrame::data(5, "early", true)));

    f.connection.tls().set_protocols(vec![ALPN_HTTP_2.into()]);
    f.connection.tls().force_protocol(ALPN_HTTP_2);
    assert_eq!(f.pipeline.protocol(), Some(Protocol::Http2));

    // Preface and SETTINGS only: the frame now waits for the origin
    let written = f.transport.take_written();
    assert!(written.starts_with(CONNECTION_PREFACE));
    assert!(!f.pipeline.is_closed());
}

#[test]
fn test_inbound_before_install_is_replayed() {
    let f = fixture();
    f.pipeline.activate();
    f.connection.tls().set_protocols(vec!["forward".into()]);

    f.pipeline.on_read(Bytes::from_static(b"early "));
    f.pipeline.on_read(Bytes::from_static(b"bytes"));
    assert!(f.client.take_messages().is_empty());

    f.connection.tls().force_protocol("forward");
    assert_eq!(f.pipeline.protocol(), Some(Protocol::Forward));
    assert_eq!(
        f.client.take_messages(),
        vec![bytes("early "), bytes("bytes")]
    );
}

#[test]
fn test_unknown_protocol_closes() {
    let f = fixture();
    f.pipeline.activate();
    f.connection.tls().set_protocols(vec!["spdy/3".into()]);
    f.connection.tls().force_protocol("spdy/3");

    assert!(f.pipeline.is_closed());
    assert!(f.client.is_closed());
    assert_eq!(f.transport.close_count(), 1);
    assert_eq!(f.pipeline.protocol(), None);
}

#[test]
fn test_unserved_protocol_closes() {
    let f = fixture_with(ProtocolRegistry::with_defaults().unregister(Protocol::Http2));
    f.pipeline.write(bytes("queued"));
    f.connection.tls().set_protocols(vec![ALPN_HTTP_2.into()]);
    f.connection.tls().force_protocol(ALPN_HTTP_2);
    f.pipeline.activate();

    assert!(f.pipeline.is_closed());
    assert!(f.client.is_closed());
    assert_eq!(f.transport.written_len(), 0);
}

#[test]
fn test_failed_protocol_list_closes() {
    let f = fixture();
    f.pipeline.activate();
    f.pipeline.write(bytes("dropped"));
    f.connection
        .tls()
        .protocols_promise()
        .try_failure(Error::Negotiation("client went away".into()));

    assert!(f.pipeline.is_closed());
    assert!(f.client.is_closed());
    assert_eq!(f.transport.written_len(), 0);

    // The protocol can no longer be settled and carries the original cause
    let cause = f.connection.tls().protocol_promise().cause().unwrap();
    assert!(matches!(&*cause, Error::Negotiation(msg) if msg.contains("client went away")));
}

#[test]
fn test_failed_protocol_closes() {
    let f = fixture();
    f.pipeline.activate();
    f.connection.tls().set_protocols(vec![ALPN_HTTP_2.into()]);
    f.connection.tls().fail(Error::ChannelClosed);

    assert!(f.pipeline.is_closed());
    assert!(f.client.is_closed());
    assert!(f.connection.tls().protocol_promise().cause().unwrap().is_closed());
}

#[test]
fn test_inactive_during_negotiation_releases_writes() {
    let f = fixture();
    f.pipeline.activate();
    f.pipeline.write(bytes("one"));
    f.pipeline.write(bytes("two"));
    let ctx = f.pipeline.handler_context();
    assert!(ctx.is_active());

    f.pipeline.on_inactive();
    assert!(f.client.is_closed());
    assert!(f.pipeline.is_closed());
    assert!(!ctx.is_active());
    assert!(ctx.write(Bytes::from_static(b"direct")).is_err());

    // Nothing comes back to life afterwards
    f.connection.tls().set_protocols(vec![ALPN_HTTP_1_1.into()]);
    f.connection.tls().force_protocol(ALPN_HTTP_1_1);
    f.pipeline.write(bytes("three"));
    assert_eq!(f.transport.written_len(), 0);
    assert_eq!(f.pipeline.protocol(), None);
}

#[test]
fn test_frame_on_forward_handler_is_an_error() {
    let f = fixture();
    f.connection.tls().set_protocols(vec![ALPN_HTTP_1_1.into()]);
    f.connection.tls().force_protocol(ALPN_HTTP_1_1);
    f.pipeline.activate();

    f.pipeline
        .write(Message::Frame(StreamFrame::data(1, "nope", true)));
    assert!(f.pipeline.is_closed());
    assert!(f.client.is_closed());
}

#[test]
fn test_transport_failure_while_flushing_closes() {
    let f = fixture();
    f.pipeline.activate();
    f.pipeline.write(bytes("doomed"));
    f.transport.fail_writes();

    f.connection.tls().set_protocols(vec![ALPN_HTTP_1_1.into()]);
    f.connection.tls().force_protocol(ALPN_HTTP_1_1);
    assert!(f.pipeline.is_closed());
    assert!(f.client.is_closed());
}

#[test]
fn test_custom_handler_from_registry() {
    let registry = ProtocolRegistry::new().register(Protocol::Forward, || {
        Arc::new(ForwardHandler::new(Protocol::Forward)) as Arc<dyn ProtocolHandler>
    });
    let f = fixture_with(registry);
    f.connection.tls().set_protocols(Vec::new());
    f.connection.tls().force_protocol("forward");
    f.pipeline.activate();
    assert_eq!(f.pipeline.protocol(), Some(Protocol::Forward));
}

#[test]
fn test_concurrent_writes_during_install_keep_per_writer_order() {
    let f = fixture();
    f.pipeline.activate();
    f.connection.tls().set_protocols(vec!["forward".into()]);

    let writers: Vec<_> = (0..4u8)
        .map(|w| {
            let pipeline = f.pipeline.clone();
            thread::spawn(move || {
                for i in 0..50u8 {
                    pipeline.write(Message::Bytes(Bytes::from(vec![w, i])));
                }
            })
        })
        .collect();
    f.connection.tls().force_protocol("forward");
    for writer in writers {
        writer.join().unwrap();
    }

    let written = f.transport.take_written();
    assert_eq!(written.len(), 4 * 50 * 2);
    let mut next = [0u8; 4];
    for pair in written.chunks(2) {
        let (w, i) = (pair[0] as usize, pair[1]);
        assert_eq!(i, next[w]);
        next[w] += 1;
    }
    assert_eq!(next, [50; 4]);
}
