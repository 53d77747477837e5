use std::sync::Arc;

use fedemu::{
    net::{ebtables::Verdict, Recorder},
    node::MemoryRegistry,
    wireless::{
        scheduler::SchedulerOptions, InterfaceId, LinkRuleScheduler, Position, RangeConfig, RangeModel,
        TcShaper,
    },
    Broker, BrokerOptions, SessionState, LOCALHOST,
};

#[tokio::test]
async fn wireless_links_follow_node_placement() {
    let _ = tracing_subscriber::fmt::try_init();

    let recorder = Arc::new(Recorder::new());
    let broker = Broker::new(Arc::new(MemoryRegistry::new()), recorder.clone(), BrokerOptions::default());
    broker.set_session_state(SessionState::Runtime);
    broker.add_server("alpha", None, None).await;
    broker.router().placements().add(1, LOCALHOST);
    broker.router().placements().add(2, "alpha");

    let scheduler = LinkRuleScheduler::ebtables(recorder.clone(), SchedulerOptions::default());
    let network = fedemu::wireless::WirelessNetwork::new(10, "b.10", Verdict::Drop, scheduler);
    let model = RangeModel::new(network, Arc::new(TcShaper::new(recorder)), RangeConfig::default());

    let (a, b) = (InterfaceId::new(1, "veth1.0"), InterfaceId::new(2, "veth2.0"));
    model.set_position(&a, Position::new(0.0, 0.0));
    let events = model.set_position(&b, Position::new(100.0, 100.0));
    assert_eq!(events.len(), 1);

    let msg = events[0].to_message().unwrap();
    let decision = broker.router().decide(&msg).unwrap();
    assert_eq!(decision.targets.into_iter().collect::<Vec<_>>(), vec!["alpha", LOCALHOST]);
    assert!(decision.handle_locally, "both ends are local");
}
