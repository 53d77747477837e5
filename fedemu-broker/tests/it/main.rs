use std::{sync::Arc, time::Duration};

use bytes::Bytes;
use fedemu_broker::{node::MemoryRegistry, Broker, BrokerOptions, SessionState};
use fedemu_net::Recorder;
use fedemu_wire::{Header, Message};
use tokio::net::{TcpListener, TcpStream};

mod receive;
mod router;

/// How long a test waits for something that should happen.
const PATIENCE: Duration = Duration::from_secs(2);

/// A broker for session 7, past the definition state.
fn broker() -> (Broker, Arc<MemoryRegistry>, Arc<Recorder>) {
    let registry = Arc::new(MemoryRegistry::new());
    let runner = Arc::new(Recorder::new());
    let broker = Broker::new(
        registry.clone(),
        runner.clone(),
        BrokerOptions::default().session_id(7),
    );
    broker.set_session_state(SessionState::Configuration);

    (broker, registry, runner)
}

/// Registers server `name` with the broker and returns the remote end of its connection.
async fn remote(broker: &Broker, name: &str) -> TcpStream {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();

    let server = broker.add_server(name, Some("127.0.0.1"), Some(port)).await;
    assert!(server.is_connected(), "server {name} should be connected");

    let (stream, _) = listener.accept().await.unwrap();
    stream
}

fn decode(raw: Bytes) -> Message {
    let header = Header::decode(&raw).unwrap();
    Message::decode(header, raw.slice(Header::len()..)).unwrap()
}
