use std::{sync::Arc, time::Duration};

use fedemu_broker::{SessionLifecycle, LOCALHOST};
use fedemu_wire::{
    tlv::{event, exec, link, node},
    EventType, MessageBuilder, MessageFlags, MessageType,
};
use tokio::{io::AsyncWriteExt, net::TcpListener, sync::Notify, time::timeout};

use crate::{broker, decode, remote, PATIENCE};

struct ReadinessProbe(Arc<Notify>);

impl SessionLifecycle for ReadinessProbe {
    fn check_runtime_readiness(&self) {
        self.0.notify_one();
    }
}

#[tokio::test]
async fn remote_messages_reach_local_observers() {
    let _ = tracing_subscriber::fmt::try_init();

    let (broker, _, _) = broker();
    let mut alpha = remote(&broker, "alpha").await;
    let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
    broker.hooks().add_local_observer(tx);

    let seen = Arc::new(parking_lot::Mutex::new(Vec::new()));
    let sink = Arc::clone(&seen);
    broker.hooks().set_visualization(move |msg: &fedemu_wire::Message| {
        sink.lock().push(msg.clone());
    });

    let msg = MessageBuilder::new(MessageType::Link)
        .flags(MessageFlags::ADD)
        .u32(link::N1_NUMBER, 4)
        .u32(link::N2_NUMBER, 5)
        .build()
        .unwrap();
    alpha.write_all(msg.raw()).await.unwrap();

    let raw = timeout(PATIENCE, rx.recv()).await.unwrap().unwrap();
    assert_eq!(&raw, msg.raw());
    assert_eq!(broker.stats().messages_rx(), 1);
    assert_eq!(broker.stats().bytes_rx(), msg.raw().len());
    assert_eq!(*seen.lock(), vec![msg]);
}

#[tokio::test]
async fn terminal_commands_open_on_the_remote_host() {
    let _ = tracing_subscriber::fmt::try_init();

    let (broker, _, _) = broker();
    let mut alpha = remote(&broker, "alpha").await;
    let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
    broker.hooks().add_local_observer(tx);

    let msg = MessageBuilder::new(MessageType::Execute)
        .flags(MessageFlags::TTY)
        .u32(exec::NODE, 1)
        .string(exec::RESULT, "vcmd -c /tmp/n1 -- bash")
        .build()
        .unwrap();
    alpha.write_all(msg.raw()).await.unwrap();

    let raw = timeout(PATIENCE, rx.recv()).await.unwrap().unwrap();
    let rewritten = decode(raw);
    assert_eq!(rewritten.tlv_str(exec::RESULT), Some("ssh -X -f 127.0.0.1 xterm -e vcmd -c /tmp/n1 -- bash"));
    assert_eq!(rewritten.tlv_u32(exec::NODE), Some(1));
}

#[tokio::test]
async fn deleted_nodes_leave_the_placement_index() {
    let _ = tracing_subscriber::fmt::try_init();

    let (broker, _, _) = broker();
    let mut alpha = remote(&broker, "alpha").await;
    let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
    broker.hooks().add_local_observer(tx);
    broker.router().placements().add(3, "alpha");
    broker.router().placements().add(3, LOCALHOST);

    let msg = MessageBuilder::new(MessageType::Node)
        .flags(MessageFlags::DELETE)
        .u32(node::NUMBER, 3)
        .build()
        .unwrap();
    alpha.write_all(msg.raw()).await.unwrap();

    timeout(PATIENCE, rx.recv()).await.unwrap().unwrap();
    assert_eq!(broker.router().placements().servers(3).into_iter().collect::<Vec<_>>(), vec![LOCALHOST]);
    assert_eq!(broker.router().placements().reference_count("alpha"), 0);
}

#[tokio::test]
async fn runtime_readiness_is_checked_once_everyone_is_instantiated() {
    let _ = tracing_subscriber::fmt::try_init();

    let (broker, _, _) = broker();
    let mut alpha = remote(&broker, "alpha").await;
    let ready = Arc::new(Notify::new());
    broker.hooks().set_lifecycle(ReadinessProbe(Arc::clone(&ready)));
    broker.local_instantiation_complete().unwrap();
    assert!(!broker.instantiation_complete());

    let msg = MessageBuilder::new(MessageType::Event)
        .u32(event::TYPE, EventType::InstantiationComplete as u32)
        .build()
        .unwrap();
    alpha.write_all(msg.raw()).await.unwrap();

    timeout(PATIENCE, ready.notified()).await.unwrap();
    assert!(broker.instantiation_complete());
    assert!(broker.servers().get_by_name("alpha").unwrap().instantiation_complete);
}

#[tokio::test]
async fn closed_connection_is_dropped() {
    let _ = tracing_subscriber::fmt::try_init();

    let (broker, _, _) = broker();
    let alpha = remote(&broker, "alpha").await;
    assert!(broker.servers().is_receiving());

    drop(alpha);

    timeout(PATIENCE, async {
        while broker.servers().get_by_name("alpha").is_some_and(|s| s.is_connected()) {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap();

    // the entry survives, without a connection
    assert!(broker.servers().get_by_name("alpha").is_some());

    broker.shutdown().await;
    assert!(!broker.servers().is_receiving());
    assert_eq!(broker.servers().list_names(), vec![LOCALHOST]);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn first_message_of_a_new_server_is_received() {
    let _ = tracing_subscriber::fmt::try_init();

    let greeting = MessageBuilder::new(MessageType::Event)
        .u32(event::TYPE, EventType::InstantiationState as u32)
        .build()
        .unwrap();

    for round in 0..50 {
        let (broker, _, _) = broker();
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        broker.hooks().add_local_observer(tx);

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let raw = greeting.raw().clone();
        let peer = tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            stream.write_all(&raw).await.unwrap();
            stream
        });

        let server = broker.add_server("alpha", Some("127.0.0.1"), Some(port)).await;
        assert!(server.is_connected());
        let _stream = peer.await.unwrap();

        let received =
            timeout(PATIENCE, rx.recv()).await.unwrap_or_else(|_| panic!("round {round}: nothing received"));
        assert_eq!(received.as_ref(), Some(greeting.raw()));

        // still reading from the server afterwards
        assert!(broker.servers().get_by_name("alpha").unwrap().is_connected());
        broker.shutdown().await;
    }
}
