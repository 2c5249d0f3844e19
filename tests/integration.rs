//! End-to-end session tests over the in-process bus.
//!
//! These wire real session clients together through a `LocalBus` and
//! verify the full pipeline: join handshake, late-join content seeding,
//! concurrent-edit convergence, save coordination, and follow/pin. Most
//! tests drain the bus deterministically; the last one runs the actual
//! async event loops.

use std::sync::Arc;

use tandem::{
    content_hash, BusEvent, LocalBus, MemoryDocumentStore, SessionClient, SessionContext,
    SessionEvent, SessionMessage, SyncState, TextEdit, HOST_ID,
};
use tokio::sync::{broadcast, mpsc};
use tokio::time::{timeout, Duration};

struct Peer {
    client: SessionClient,
    bus_rx: broadcast::Receiver<BusEvent>,
    docs: Arc<MemoryDocumentStore>,
    _tx: mpsc::Sender<SessionEvent>,
}

fn peer(bus: &LocalBus, ctx: SessionContext) -> Peer {
    let _ = env_logger::builder().is_test(true).try_init();
    let docs = Arc::new(MemoryDocumentStore::new());
    let bus_rx = bus.attach();
    let (client, tx) = SessionClient::new(ctx, docs.clone(), bus.publisher());
    Peer {
        client,
        bus_rx,
        docs,
        _tx: tx,
    }
}

/// Drain bus events into every peer until the bus goes quiet.
fn pump(peers: &mut [&mut Peer]) {
    loop {
        let mut progressed = false;
        for p in peers.iter_mut() {
            while let Ok(event) = p.bus_rx.try_recv() {
                p.client.process(SessionEvent::Bus(event));
                progressed = true;
            }
        }
        if !progressed {
            break;
        }
    }
}

#[test]
fn test_host_and_joiner_share_a_file() {
    let bus = LocalBus::new(128);
    let mut observer = bus.attach();
    let mut host = peer(&bus, SessionContext::host());
    let mut guest = peer(&bus, SessionContext::guest(2));

    host.docs.insert("main.py", "x=1");
    host.client.process(SessionEvent::LocalOpen {
        file_name: "main.py".into(),
    });
    guest.client.process(SessionEvent::RequestJoin);
    pump(&mut [&mut host, &mut guest]);

    // Guest had no baseline: the acknowledge carries the full text.
    let mut saw_ack = false;
    let mut last_event_id = 0;
    while let Ok(event) = observer.try_recv() {
        assert!(
            event.event_id > last_event_id,
            "bus event ids must strictly increase"
        );
        last_event_id = event.event_id;
        if let SessionMessage::FileOpenAcknowledge {
            fallback_text,
            history,
            snapshot_server_version,
            ..
        } = &event.envelope.message
        {
            saw_ack = true;
            assert_eq!(fallback_text.as_deref(), Some("x=1"));
            assert!(history.is_empty());
            assert_eq!(*snapshot_server_version, 0);
        }
    }
    assert!(saw_ack);

    // Host edits; both sides land on the same text at the same version.
    host.docs.insert("main.py", "x=1\ny=2");
    host.client.process(SessionEvent::LocalEdit {
        file_name: "main.py".into(),
        edits: vec![TextEdit::insert(3, "\ny=2")],
    });
    pump(&mut [&mut host, &mut guest]);

    for p in [&host, &guest] {
        let file = p.client.engine().get("main.py").unwrap();
        assert_eq!(file.text(), "x=1\ny=2");
        assert_eq!(file.server_version(), 1);
        assert_eq!(file.state(), SyncState::Synced);
    }
    assert_eq!(guest.docs.text("main.py").as_deref(), Some("x=1\ny=2"));
    assert_eq!(host.client.stats().handler_failures, 0);
    assert_eq!(guest.client.stats().handler_failures, 0);
}

#[test]
fn test_matching_baseline_skips_full_text() {
    let bus = LocalBus::new(128);
    let mut host = peer(&bus, SessionContext::host());
    let mut guest = peer(&bus, SessionContext::guest(2));
    let mut observer = bus.attach();

    host.docs.insert("lib.rs", "fn main() {}\n");
    host.client.process(SessionEvent::LocalOpen {
        file_name: "lib.rs".into(),
    });
    // Guest already has the identical file on disk.
    guest.docs.insert("lib.rs", "fn main() {}\n");
    guest.client.process(SessionEvent::RequestJoin);
    pump(&mut [&mut host, &mut guest]);

    while let Ok(event) = observer.try_recv() {
        if let SessionMessage::FileOpenAcknowledge {
            fallback_text,
            snapshot_edits,
            ..
        } = &event.envelope.message
        {
            assert!(fallback_text.is_none(), "matching hash must not resend text");
            assert!(snapshot_edits.is_empty());
        }
        if let SessionMessage::FileOpenRequest { content_hash: h, .. } = &event.envelope.message {
            assert_eq!(h, &content_hash("fn main() {}\n"));
        }
    }
    let file = guest.client.engine().get("lib.rs").unwrap();
    assert_eq!(file.text(), "fn main() {}\n");
    assert_eq!(file.state(), SyncState::Synced);
}

#[test]
fn test_saved_baseline_gets_edit_replay() {
    let bus = LocalBus::new(128);
    let mut host = peer(&bus, SessionContext::host());

    host.docs.insert("f.txt", "abc");
    host.client.process(SessionEvent::LocalOpen {
        file_name: "f.txt".into(),
    });
    host.client.process(SessionEvent::LocalEdit {
        file_name: "f.txt".into(),
        edits: vec![TextEdit::insert(3, "d")],
    });
    pump(&mut [&mut host]);
    // Save refreshes the snapshot chain: the previous snapshot's content
    // becomes the new pre-image, the edit since it the replay delta.
    host.client.process(SessionEvent::SaveCompleted {
        file_name: "f.txt".into(),
    });

    // A joiner holding the pre-save content gets edits, not text.
    let mut guest = peer(&bus, SessionContext::guest(2));
    let mut observer = bus.attach();
    guest.docs.insert("f.txt", "abc");
    guest.client.process(SessionEvent::RequestJoin);
    pump(&mut [&mut host, &mut guest]);

    let mut saw_ack = false;
    while let Ok(event) = observer.try_recv() {
        if let SessionMessage::FileOpenAcknowledge {
            fallback_text,
            snapshot_edits,
            snapshot_server_version,
            history,
            ..
        } = &event.envelope.message
        {
            saw_ack = true;
            assert!(fallback_text.is_none());
            assert_eq!(snapshot_edits, &vec![TextEdit::insert(3, "d")]);
            assert_eq!(*snapshot_server_version, 1);
            assert!(history.is_empty());
        }
    }
    assert!(saw_ack);

    let file = guest.client.engine().get("f.txt").unwrap();
    assert_eq!(file.text(), "abcd");
    assert_eq!(file.server_version(), 1);

    // And live edits keep flowing afterwards.
    host.client.process(SessionEvent::LocalEdit {
        file_name: "f.txt".into(),
        edits: vec![TextEdit::insert(4, "e")],
    });
    pump(&mut [&mut host, &mut guest]);
    assert_eq!(guest.client.engine().get("f.txt").unwrap().text(), "abcde");
    assert_eq!(guest.docs.text("f.txt").as_deref(), Some("abcde"));
}

#[test]
fn test_concurrent_edits_converge() {
    let bus = LocalBus::new(128);
    let mut host = peer(&bus, SessionContext::host());
    let mut guest = peer(&bus, SessionContext::guest(2));

    host.docs.insert("t.txt", "abc");
    host.client.process(SessionEvent::LocalOpen {
        file_name: "t.txt".into(),
    });
    guest.client.process(SessionEvent::RequestJoin);
    pump(&mut [&mut host, &mut guest]);

    // Both edit the same version before seeing each other's change.
    host.client.process(SessionEvent::LocalEdit {
        file_name: "t.txt".into(),
        edits: vec![TextEdit::insert(0, "X")],
    });
    guest.client.process(SessionEvent::LocalEdit {
        file_name: "t.txt".into(),
        edits: vec![TextEdit::insert(3, "Y")],
    });
    pump(&mut [&mut host, &mut guest]);

    let host_file = host.client.engine().get("t.txt").unwrap();
    let guest_file = guest.client.engine().get("t.txt").unwrap();
    assert_eq!(host_file.text(), guest_file.text(), "divergence after OT");
    assert_eq!(host_file.text(), "XabcY");
    assert_eq!(host_file.server_version(), 2);
    assert_eq!(guest_file.server_version(), 2);
}

#[test]
fn test_late_echo_after_prune_still_advances_version() {
    let bus = LocalBus::new(128);
    let mut host = peer(&bus, SessionContext::host());

    host.docs.insert("a.txt", "abc");
    host.client.process(SessionEvent::LocalOpen {
        file_name: "a.txt".into(),
    });
    host.client.set_ack_timeout(Duration::ZERO);
    host.client.process(SessionEvent::LocalEdit {
        file_name: "a.txt".into(),
        edits: vec![TextEdit::insert(3, "d")],
    });
    // The ack window lapses before the echo is consumed.
    host.client.process(SessionEvent::Tick);
    assert_eq!(host.client.stats().acks_pruned, 1);

    pump(&mut [&mut host]);

    // Degraded, but never stuck: the echo still advances the version.
    let file = host.client.engine().get("a.txt").unwrap();
    assert_eq!(file.text(), "abcd");
    assert_eq!(file.server_version(), 1);
    assert_eq!(file.pending_len(), 0);
    assert_eq!(host.client.stats().handler_failures, 0);
}

#[test]
fn test_follow_pin_survives_engine_swaps_not_user_ones() {
    let bus = LocalBus::new(128);
    let mut host = peer(&bus, SessionContext::host());
    let mut guest = peer(&bus, SessionContext::guest(2));

    host.docs.insert("a.txt", "aaaa");
    host.docs.insert("b.txt", "bbbb");
    host.client.process(SessionEvent::LocalOpen {
        file_name: "a.txt".into(),
    });
    host.client.process(SessionEvent::LocalOpen {
        file_name: "b.txt".into(),
    });
    guest.client.process(SessionEvent::RequestJoin);
    pump(&mut [&mut host, &mut guest]);

    guest
        .client
        .process(SessionEvent::PinRequest {
            column: 0,
            participant_id: HOST_ID,
        });

    // Host moves in a.txt: guest's pane 0 swaps to it and reveals.
    host.client.process(SessionEvent::LocalSelection {
        file_name: "a.txt".into(),
        start: 2,
        length: 0,
        is_reversed: false,
    });
    pump(&mut [&mut host, &mut guest]);
    assert_eq!(guest.docs.column_document(0).as_deref(), Some("a.txt"));
    guest.client.process(SessionEvent::EditorDocumentChanged {
        column: 0,
        file_name: "a.txt".into(),
    });
    assert_eq!(guest.client.follow().pinned(0), Some(HOST_ID));

    // Host switches to b.txt: engine-initiated swap keeps the pin.
    host.client.process(SessionEvent::LocalSelection {
        file_name: "b.txt".into(),
        start: 1,
        length: 1,
        is_reversed: false,
    });
    pump(&mut [&mut host, &mut guest]);
    assert_eq!(guest.docs.column_document(0).as_deref(), Some("b.txt"));
    guest.client.process(SessionEvent::EditorDocumentChanged {
        column: 0,
        file_name: "b.txt".into(),
    });
    assert_eq!(guest.client.follow().pinned(0), Some(HOST_ID));

    // The guest navigating away on their own releases the pin.
    guest.client.process(SessionEvent::EditorDocumentChanged {
        column: 0,
        file_name: "elsewhere.txt".into(),
    });
    assert_eq!(guest.client.follow().pinned(0), None);
}

#[test]
fn test_invalid_pin_column_is_rejected() {
    let bus = LocalBus::new(16);
    let mut host = peer(&bus, SessionContext::host());
    host.client.process(SessionEvent::PinRequest {
        column: 99,
        participant_id: 2,
    });
    assert_eq!(host.client.stats().handler_failures, 1);
    // The error is the follow controller's, not a desync.
    assert!(host.client.hard_desync().is_none());
}

#[test]
fn test_wire_format_survives_json_round_trip() {
    let bus = LocalBus::new(128);
    let mut observer = bus.attach();
    let mut host = peer(&bus, SessionContext::host());

    host.docs.insert("a.txt", "abc");
    host.client.process(SessionEvent::LocalOpen {
        file_name: "a.txt".into(),
    });
    host.client.process(SessionEvent::LocalEdit {
        file_name: "a.txt".into(),
        edits: vec![TextEdit::replace(1, 1, "ζ")],
    });

    while let Ok(event) = observer.try_recv() {
        let json = event.encode().unwrap();
        let decoded = BusEvent::decode(&json).unwrap();
        assert_eq!(decoded, event);
    }
}

#[tokio::test]
async fn test_async_event_loops_converge() {
    let _ = env_logger::builder().is_test(true).try_init();
    let bus = LocalBus::new(256);

    let host_docs = Arc::new(MemoryDocumentStore::new());
    host_docs.insert("main.py", "x=1");
    let host_bus_rx = bus.attach();
    let (mut host, host_tx) =
        SessionClient::new(SessionContext::host(), host_docs.clone(), bus.publisher());
    SessionClient::spawn_bus_pump(host_tx.clone(), host_bus_rx);

    let guest_docs = Arc::new(MemoryDocumentStore::new());
    let guest_bus_rx = bus.attach();
    let (mut guest, guest_tx) =
        SessionClient::new(SessionContext::guest(2), guest_docs.clone(), bus.publisher());
    SessionClient::spawn_bus_pump(guest_tx.clone(), guest_bus_rx);

    tokio::spawn(async move { host.run().await });
    tokio::spawn(async move { guest.run().await });

    host_tx
        .send(SessionEvent::LocalOpen {
            file_name: "main.py".into(),
        })
        .await
        .unwrap();
    guest_tx.send(SessionEvent::RequestJoin).await.unwrap();
    wait_for(|| guest_docs.text("main.py").as_deref() == Some("x=1")).await;

    host_docs.insert("main.py", "x=1\ny=2");
    host_tx
        .send(SessionEvent::LocalEdit {
            file_name: "main.py".into(),
            edits: vec![TextEdit::insert(3, "\ny=2")],
        })
        .await
        .unwrap();
    wait_for(|| guest_docs.text("main.py").as_deref() == Some("x=1\ny=2")).await;
}

async fn wait_for(mut condition: impl FnMut() -> bool) {
    timeout(Duration::from_secs(5), async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("condition not reached in time");
}
