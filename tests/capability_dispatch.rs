//! Capability-addressed dispatch: round-robin rotation, least-loaded
//! selection with deterministic tie-breaks, and index consistency with the
//! lifecycle.

mod common;

use std::time::Duration;

use common::{ParkedAgent, RecordingAgent, cap, harness, register_instance, wait_for_state, wait_until};
use hypha::domain_types::HandlerTimeoutMs;
use hypha::{
    AckPolicy, Address, AgentConfig, AgentState, DeliveryStatus, MessageDraft, MessageKind,
    Payload, RoutingPolicy, Sender,
};

fn request(to: Address, routing: RoutingPolicy) -> MessageDraft {
    MessageDraft::new(
        Sender::External,
        to,
        MessageKind::CapabilityRequest,
        Payload::empty(),
    )
    .with_routing(routing)
}

#[tokio::test]
async fn round_robin_alternates_between_equal_candidates() {
    let h = harness();

    let agent_a = RecordingAgent::new();
    let agent_b = RecordingAgent::new();
    let a = register_instance(
        &h.control,
        "pay-a",
        &["pay"],
        agent_a.clone(),
        AgentConfig::default(),
    )
    .await;
    let b = register_instance(
        &h.control,
        "pay-b",
        &["pay"],
        agent_b.clone(),
        AgentConfig::default(),
    )
    .await;
    h.control.start(a).await.unwrap();
    h.control.start(b).await.unwrap();
    wait_for_state(&h.control, a, AgentState::Running).await;
    wait_for_state(&h.control, b, AgentState::Running).await;

    let mut recipients = Vec::new();
    for _ in 0..4 {
        let receipt = h
            .control
            .send(request(
                Address::Capability(cap("pay")),
                RoutingPolicy::RoundRobin,
            ))
            .await
            .unwrap();
        recipients.push(receipt.recipients()[0]);
        let status = receipt.wait_one().await.unwrap();
        assert_eq!(status, DeliveryStatus::Handled);
    }

    assert_eq!(recipients, vec![a, b, a, b]);
    assert_eq!(agent_a.handled_count(), 2);
    assert_eq!(agent_b.handled_count(), 2);
    assert_eq!(h.control.dead_letter_stats().total, 0);
}

#[tokio::test]
async fn least_loaded_breaks_depth_ties_by_registration_order() {
    let h = harness();

    // Parked handlers hold queue depth steady; give them a budget far beyond
    // the test window so timeouts never recycle messages.
    let parked_config = AgentConfig {
        handler_timeout_ms: Some(HandlerTimeoutMs::try_new(300_000).unwrap()),
        ..AgentConfig::default()
    };
    let a = register_instance(
        &h.control,
        "pay-a",
        &["pay"],
        std::sync::Arc::new(ParkedAgent),
        parked_config.clone(),
    )
    .await;
    let b = register_instance(
        &h.control,
        "pay-b",
        &["pay"],
        std::sync::Arc::new(ParkedAgent),
        parked_config,
    )
    .await;
    h.control.start(a).await.unwrap();
    h.control.start(b).await.unwrap();
    wait_for_state(&h.control, a, AgentState::Running).await;
    wait_for_state(&h.control, b, AgentState::Running).await;

    // Four messages each: one parks in the handler, three stay queued.
    for agent in [a, b] {
        for _ in 0..4 {
            h.control
                .send(
                    MessageDraft::new(
                        Sender::External,
                        Address::Agent(agent),
                        MessageKind::Event,
                        Payload::empty(),
                    )
                    .with_ack_policy(AckPolicy::FireAndForget)
                    .with_ttl(Duration::from_secs(600)),
                )
                .await
                .unwrap();
        }
        wait_until(
            || h.control.queue_depth(agent) == 3,
            Duration::from_secs(5),
            "inbox depth never settled at 3",
        )
        .await;
    }

    // Equal depth: the lexicographically smaller id wins the tie.
    let first = h
        .control
        .send(
            request(Address::Capability(cap("pay")), RoutingPolicy::LeastLoaded)
                .with_ack_policy(AckPolicy::FireAndForget)
                .with_ttl(Duration::from_secs(600)),
        )
        .await
        .unwrap();
    assert_eq!(first.recipients(), vec![a]);
    assert_eq!(h.control.queue_depth(a), 4);
    assert_eq!(h.control.queue_depth(b), 3);

    // Now depth 4 vs 3: the shallower inbox wins.
    let second = h
        .control
        .send(
            request(Address::Capability(cap("pay")), RoutingPolicy::LeastLoaded)
                .with_ack_policy(AckPolicy::FireAndForget)
                .with_ttl(Duration::from_secs(600)),
        )
        .await
        .unwrap();
    assert_eq!(second.recipients(), vec![b]);
}

#[tokio::test]
async fn preferred_routing_falls_back_when_candidate_is_missing() {
    let h = harness();

    let agent_a = RecordingAgent::new();
    let a = register_instance(
        &h.control,
        "pay-a",
        &["pay"],
        agent_a,
        AgentConfig::default(),
    )
    .await;
    h.control.start(a).await.unwrap();
    wait_for_state(&h.control, a, AgentState::Running).await;

    // Prefer an agent that does not hold the capability at all.
    let outsider = hypha::domain_types::AgentId::new(9_999);
    let receipt = h
        .control
        .send(request(
            Address::Capability(cap("pay")),
            RoutingPolicy::Preferred(outsider),
        ))
        .await
        .unwrap();
    assert_eq!(receipt.recipients(), vec![a]);
}

#[tokio::test]
async fn stopping_removes_an_agent_from_dispatch() {
    let h = harness();

    let a = register_instance(
        &h.control,
        "pay-a",
        &["pay"],
        RecordingAgent::new(),
        AgentConfig::default(),
    )
    .await;
    h.control.start(a).await.unwrap();
    wait_for_state(&h.control, a, AgentState::Running).await;
    assert_eq!(h.control.capabilities().len(), 1);

    h.control.stop(a).await.unwrap();
    wait_for_state(&h.control, a, AgentState::Stopped).await;

    assert!(h.control.capabilities().is_empty());
    let refused = h
        .control
        .send(request(
            Address::Capability(cap("pay")),
            RoutingPolicy::Any,
        ))
        .await;
    assert!(matches!(
        refused,
        Err(hypha::ApiError::NoSuchRecipient { .. })
    ));
}
