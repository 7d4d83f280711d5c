mod common;

use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::{BufMut, BytesMut};
use deckwire_frame::command::{BUTTON_PRESS, KNOB_ROTATE, SET_BRIGHTNESS, VERSION};
use deckwire_frame::{encode_frame, Framing, FRAME_MAGIC};
use deckwire_session::{Event, SessionConfig, SessionError};

use common::{next_frame, record, start_session, start_session_with, wire};

#[tokio::test(start_paused = true)]
async fn concurrent_requests_resolve_with_their_own_responses() {
    let (session, mut peer, _emitter) = start_session(Framing::Stream);

    let first = {
        let session = session.clone();
        tokio::spawn(async move {
            session
                .send_request(VERSION, b"first", Duration::from_secs(1))
                .await
        })
    };
    let a = next_frame(&mut peer, Framing::Stream).await;

    let second = {
        let session = session.clone();
        tokio::spawn(async move {
            session
                .send_request(SET_BRIGHTNESS, b"second", Duration::from_secs(1))
                .await
        })
    };
    let b = next_frame(&mut peer, Framing::Stream).await;
    assert_ne!(a.transaction_id, b.transaction_id);
    assert_eq!(session.pending_count(), 2);

    peer.send(wire(Framing::Stream, b.command, b.transaction_id, b"reply-b"))
        .unwrap();
    peer.send(wire(Framing::Stream, a.command, a.transaction_id, b"reply-a"))
        .unwrap();

    let first = first.await.unwrap().unwrap();
    let second = second.await.unwrap().unwrap();
    assert_eq!(first.payload.as_ref(), b"reply-a");
    assert_eq!(first.command, VERSION);
    assert_eq!(second.payload.as_ref(), b"reply-b");
    assert_eq!(second.command, SET_BRIGHTNESS);
    assert_eq!(session.pending_count(), 0);
}

#[tokio::test(start_paused = true)]
async fn timed_out_request_ignores_late_response() {
    let (session, mut peer, emitter) = start_session(Framing::Message);
    let mut events = record(&emitter, &["command:0x07"]);

    let result = session
        .send_request(VERSION, &[], Duration::from_millis(50))
        .await;
    assert_eq!(
        result.unwrap_err(),
        SessionError::TransactionTimeout(Duration::from_millis(50))
    );
    assert_eq!(session.pending_count(), 0);

    let request = next_frame(&mut peer, Framing::Message).await;
    peer.send(wire(
        Framing::Message,
        VERSION,
        request.transaction_id,
        &[1, 2, 3],
    ))
    .unwrap();

    let late = events.recv().await.unwrap();
    match late {
        Event::Message(message) => {
            assert_eq!(message.transaction_id, request.transaction_id);
        }
        other => panic!("unexpected event {other:?}"),
    }
    assert_eq!(session.pending_count(), 0);
}

#[tokio::test(start_paused = true)]
async fn events_from_one_batch_reach_subscribers_in_wire_order() {
    let (_session, peer, emitter) = start_session(Framing::Stream);
    let seen = Arc::new(Mutex::new(Vec::new()));
    let (done_tx, mut done_rx) = tokio::sync::mpsc::unbounded_channel();

    for (kind, label) in [("button", "button-1"), ("rotate", "rotate-1"), ("button", "button-2")] {
        let seen = seen.clone();
        let done_tx = done_tx.clone();
        emitter.subscribe(kind, move |_| {
            seen.lock().unwrap().push(label);
            if label == "rotate-1" {
                let _ = done_tx.send(());
            }
            Ok(())
        });
    }

    let mut batch = BytesMut::new();
    encode_frame(BUTTON_PRESS, None, &[0x07, 0x00], &mut batch).unwrap();
    encode_frame(KNOB_ROTATE, None, &[0x01, 0x01], &mut batch).unwrap();
    peer.send(batch.freeze()).unwrap();

    done_rx.recv().await.unwrap();
    assert_eq!(
        *seen.lock().unwrap(),
        vec!["button-1", "button-2", "rotate-1"]
    );
}

#[tokio::test(start_paused = true)]
async fn corrupted_frame_is_dropped_and_stream_recovers() {
    let config = SessionConfig {
        max_frame_size: 64,
        ..common::quiet_config()
    };
    let (_session, peer, emitter) = start_session_with(Framing::Stream, config);
    let mut events = record(&emitter, &["button", "rotate"]);

    let mut garbage = BytesMut::from(&[FRAME_MAGIC, 126][..]);
    garbage.put_u16(0xffff);
    garbage.put_slice(b"\x00\x00garbage");
    peer.send(garbage.freeze()).unwrap();

    tokio::time::sleep(Duration::from_millis(200)).await;
    peer.send(wire(Framing::Stream, KNOB_ROTATE, None, &[0x02, 0xff]))
        .unwrap();

    let event = events.recv().await.unwrap();
    assert_eq!(event.event_type(), "rotate");
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(events.try_recv().is_err());
}

#[tokio::test(start_paused = true)]
async fn response_after_queued_events() {
    let (session, mut peer, emitter) = start_session(Framing::Message);
    let mut events = record(&emitter, &["button"]);

    let request = {
        let session = session.clone();
        tokio::spawn(async move {
            session
                .send_request(VERSION, &[], Duration::from_secs(1))
                .await
        })
    };
    let sent = next_frame(&mut peer, Framing::Message).await;

    peer.send(wire(Framing::Message, BUTTON_PRESS, None, &[0x07, 0x00]))
        .unwrap();
    peer.send(wire(Framing::Message, VERSION, sent.transaction_id, &[0, 9, 1]))
        .unwrap();

    let reply = request.await.unwrap().unwrap();
    assert_eq!(reply.payload.as_ref(), &[0, 9, 1]);
    assert_eq!(events.recv().await.unwrap().event_type(), "button");
}

#[tokio::test(start_paused = true)]
async fn unmatched_transaction_id_is_an_event() {
    let (_session, peer, emitter) = start_session(Framing::Message);
    let mut events = record(&emitter, &["command:0x09"]);

    peer.send(wire(Framing::Message, SET_BRIGHTNESS, Some(42), &[5]))
        .unwrap();

    match events.recv().await.unwrap() {
        Event::Message(message) => assert_eq!(message.transaction_id, Some(42)),
        other => panic!("unexpected event {other:?}"),
    }
}

#[tokio::test(start_paused = true)]
async fn link_loss_fails_pending_requests() {
    let (session, mut peer, _emitter) = start_session(Framing::Message);

    let request = {
        let session = session.clone();
        tokio::spawn(async move {
            session
                .send_request(VERSION, &[], Duration::from_secs(30))
                .await
        })
    };
    next_frame(&mut peer, Framing::Message).await;
    peer.disconnect();

    let err = request.await.unwrap().unwrap_err();
    assert!(matches!(err, SessionError::ConnectionLost(_)));
    assert!(session.stopped().await.is_some());
    assert!(matches!(
        session.send_fire_and_forget(VERSION, &[]).await,
        Err(SessionError::ConnectionLost(_))
    ));
}

#[tokio::test(start_paused = true)]
async fn fire_and_forget_registers_nothing() {
    let (session, mut peer, _emitter) = start_session(Framing::Stream);

    session
        .send_fire_and_forget(SET_BRIGHTNESS, &[3])
        .await
        .unwrap();
    let sent = next_frame(&mut peer, Framing::Stream).await;
    assert_eq!(sent.command, SET_BRIGHTNESS);
    assert_eq!(sent.transaction_id, None);
    assert_eq!(session.pending_count(), 0);
}

#[tokio::test(start_paused = true)]
async fn silent_device_trips_watchdog_after_keepalives() {
    let config = SessionConfig {
        keepalive_interval: Duration::from_secs(1),
        watchdog_timeout: Duration::from_secs(3),
        ..SessionConfig::default()
    };
    let (session, mut peer, _emitter) = start_session_with(Framing::Message, config);

    let reason = session.stopped().await.expect("watchdog should report a loss");
    assert!(reason.contains("no inbound traffic"), "{reason}");

    let mut keepalives = 0;
    while let Some(chunk) = peer.recv().await {
        assert_eq!(chunk[0], VERSION);
        keepalives += 1;
    }
    assert!(keepalives >= 2, "only {keepalives} keepalives");
}

#[tokio::test(start_paused = true)]
async fn watchdog_fires_at_its_own_deadline() {
    let config = SessionConfig {
        keepalive_interval: Duration::from_secs(5),
        watchdog_timeout: Duration::from_secs(6),
        ..SessionConfig::default()
    };
    let started = tokio::time::Instant::now();
    let (session, _peer, _emitter) = start_session_with(Framing::Message, config);

    let reason = session.stopped().await.expect("watchdog should report a loss");
    let elapsed = started.elapsed();
    assert!(reason.contains("no inbound traffic"), "{reason}");
    assert!(elapsed >= Duration::from_secs(6), "tripped early at {elapsed:?}");
    assert!(
        elapsed <= Duration::from_millis(6_500),
        "tripped late at {elapsed:?}"
    );
}

#[tokio::test(start_paused = true)]
async fn keepalive_replies_are_not_published() {
    let config = SessionConfig {
        keepalive_interval: Duration::from_secs(1),
        watchdog_timeout: Duration::ZERO,
        ..SessionConfig::default()
    };
    let (session, mut peer, emitter) = start_session_with(Framing::Message, config);
    let mut events = record(&emitter, &["command:0x07"]);

    for _ in 0..3 {
        let keepalive = next_frame(&mut peer, Framing::Message).await;
        assert_eq!(keepalive.command, VERSION);
        assert!(keepalive.transaction_id.is_some());
        peer.send(wire(
            Framing::Message,
            VERSION,
            keepalive.transaction_id,
            &[1, 2, 3],
        ))
        .unwrap();
    }

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(events.try_recv().is_err());
    assert_eq!(session.pending_count(), 0);
    session.close().await;
    assert_eq!(session.stopped().await, None);
}

#[tokio::test(start_paused = true)]
async fn inbound_traffic_keeps_link_alive() {
    let config = SessionConfig {
        keepalive_interval: Duration::from_secs(1),
        watchdog_timeout: Duration::from_secs(3),
        ..SessionConfig::default()
    };
    let (session, peer, _emitter) = start_session_with(Framing::Message, config);

    for _ in 0..10 {
        tokio::time::sleep(Duration::from_millis(900)).await;
        peer.send(wire(Framing::Message, BUTTON_PRESS, None, &[0x07, 0x01]))
            .unwrap();
    }
    assert!(!session.is_closed());
    session.close().await;
    assert_eq!(session.stopped().await, None);
}
