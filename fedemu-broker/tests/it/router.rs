use fedemu_broker::{tunnel::TunnelEnd, tunnel_key, SessionState, LOCALHOST};
use fedemu_wire::{
    tlv::{config, event, exec, link, node},
    Codec, EventType, MessageBuilder, MessageFlags, MessageType, NodeType,
};
use futures::StreamExt;
use tokio::time::timeout;
use tokio_util::codec::FramedRead;

use crate::{broker, remote, PATIENCE};

#[tokio::test]
async fn node_message_is_forwarded_to_its_server() {
    let _ = tracing_subscriber::fmt::try_init();

    let (broker, _, _) = broker();
    let mut alpha = FramedRead::new(remote(&broker, "alpha").await, Codec::new());

    let msg = MessageBuilder::new(MessageType::Node)
        .flags(MessageFlags::ADD)
        .u32(node::NUMBER, 1)
        .u32(node::TYPE, NodeType::Default as u32)
        .string(node::NAME, "n1")
        .string(node::EMULATION_SERVER, "alpha")
        .build()
        .unwrap();

    assert!(broker.route(&msg), "node lives on alpha only");

    let received = timeout(PATIENCE, alpha.next()).await.unwrap().unwrap().unwrap();
    assert_eq!(received, msg);
    assert_eq!(broker.stats().messages_forwarded(), 1);
    assert_eq!(broker.stats().bytes_tx(), msg.raw().len());

    // later messages about the node follow its placement
    let command = MessageBuilder::new(MessageType::Execute)
        .u32(exec::NODE, 1)
        .string(exec::COMMAND, "ip addr")
        .build()
        .unwrap();
    assert!(broker.route(&command));

    let received = timeout(PATIENCE, alpha.next()).await.unwrap().unwrap().unwrap();
    assert_eq!(received, command);
}

#[tokio::test]
async fn nothing_is_forwarded_while_defining() {
    let _ = tracing_subscriber::fmt::try_init();

    let (broker, _, _) = broker();
    let mut alpha = FramedRead::new(remote(&broker, "alpha").await, Codec::new());
    broker.set_session_state(SessionState::Definition);

    let msg = MessageBuilder::new(MessageType::Event)
        .u32(event::TYPE, EventType::Start as u32)
        .build()
        .unwrap();
    assert!(!broker.route(&msg));

    assert!(timeout(std::time::Duration::from_millis(100), alpha.next()).await.is_err());
    assert_eq!(broker.stats().messages_forwarded(), 0);
}

#[tokio::test]
async fn cross_host_link_gets_a_tunnel() {
    let _ = tracing_subscriber::fmt::try_init();

    let (broker, registry, _) = broker();
    let mut alpha = FramedRead::new(remote(&broker, "alpha").await, Codec::new());
    broker.router().placements().add(1, LOCALHOST);
    broker.router().placements().add(2, "alpha");

    let msg = MessageBuilder::new(MessageType::Link)
        .flags(MessageFlags::ADD)
        .u32(link::N1_NUMBER, 1)
        .u32(link::N2_NUMBER, 2)
        .build()
        .unwrap();

    assert!(!broker.route(&msg), "local end must be handled here");

    let key = tunnel_key(7, &TunnelEnd::Node(1), &TunnelEnd::Node(2));
    let tunnel = broker.router().tunnels().get(key).unwrap();
    assert_eq!(tunnel.local_num, TunnelEnd::Node(1));
    assert_eq!(tunnel.remote_num, TunnelEnd::Node(2));
    assert!(registry.spec(key).is_some(), "tunnel bridge should be registered");

    let received = timeout(PATIENCE, alpha.next()).await.unwrap().unwrap().unwrap();
    assert_eq!(received, msg);

    let delete = MessageBuilder::new(MessageType::Link)
        .flags(MessageFlags::DELETE)
        .u32(link::N1_NUMBER, 1)
        .u32(link::N2_NUMBER, 2)
        .build()
        .unwrap();
    broker.route(&delete);
    assert!(broker.router().tunnels().is_empty());
}

#[tokio::test]
async fn each_cross_host_link_gets_its_own_tunnel() {
    let _ = tracing_subscriber::fmt::try_init();

    let (broker, registry, _) = broker();
    let _alpha = remote(&broker, "alpha").await;
    broker.router().placements().add(1, "alpha");
    for n in [2, 258] {
        broker.router().placements().add(n, LOCALHOST);
    }

    let mut keys = Vec::new();
    for n2 in [2, 258] {
        let msg = MessageBuilder::new(MessageType::Link)
            .flags(MessageFlags::ADD)
            .u32(link::N1_NUMBER, 1)
            .u32(link::N2_NUMBER, n2)
            .build()
            .unwrap();
        broker.route(&msg);
        keys.push(tunnel_key(7, &TunnelEnd::Node(1), &TunnelEnd::Node(n2)));
    }

    // the keys only differ above the low 16 bits
    assert_eq!(keys[0] & 0xffff, keys[1] & 0xffff);
    assert_eq!(broker.router().tunnels().keys().len(), 2);
    for key in keys {
        assert!(broker.router().tunnels().contains(key));
        assert!(registry.spec(key).is_some());
    }
}

#[tokio::test]
async fn remote_server_is_set_up_on_configuration() {
    let _ = tracing_subscriber::fmt::try_init();

    let (broker, _, _) = broker();
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();

    broker.configure_servers(&format!("alpha:127.0.0.1:{port}"), None).await.unwrap();
    assert!(broker.is_master());

    let (stream, _) = listener.accept().await.unwrap();
    let mut alpha = FramedRead::new(stream, Codec::new());

    let state = timeout(PATIENCE, alpha.next()).await.unwrap().unwrap().unwrap();
    assert_eq!(state.message_type(), Some(MessageType::Event));
    assert_eq!(state.tlv_u32(event::TYPE), Some(SessionState::Configuration.event_type() as u32));

    let setup = timeout(PATIENCE, alpha.next()).await.unwrap().unwrap().unwrap();
    assert_eq!(setup.message_type(), Some(MessageType::Config));
    assert_eq!(setup.tlv_str(config::OBJECT), Some("broker"));
    assert_eq!(setup.tlv_str(config::VALUES), Some(format!("alpha:127.0.0.1:{port}").as_str()));
    assert_eq!(setup.tlv_str(config::SESSION), Some("7"));
}
