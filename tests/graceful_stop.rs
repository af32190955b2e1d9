//! Cooperative stop: the inbox drains Critical-first under the drain
//! deadline, new sends are refused during the drain, and the agent lands in
//! `Stopped`.

mod common;

use std::time::Duration;

use common::{GatedAgent, harness, register_instance, wait_for_state, wait_until};
use hypha::{
    AckPolicy, Address, AgentConfig, AgentState, ApiError, MessageDraft, MessageKind,
    MessagePriority, Payload, Sender,
};

#[tokio::test]
async fn stop_drains_critical_first_then_refuses_new_sends() {
    let h = harness();

    let agent = GatedAgent::new();
    let z = register_instance(&h.control, "zeta", &[], agent.clone(), AgentConfig::default())
        .await;
    h.control.start(z).await.unwrap();
    wait_for_state(&h.control, z, AgentState::Running).await;

    let draft = |kind: MessageKind, priority: MessagePriority| {
        MessageDraft::new(Sender::External, Address::Agent(z), kind, Payload::empty())
            .with_priority(priority)
            .with_ack_policy(AckPolicy::FireAndForget)
            .with_ttl(Duration::from_secs(60))
    };

    // The gate message parks the runner so the rest stays queued.
    h.control
        .send(draft(MessageKind::Control, MessagePriority::Normal))
        .await
        .unwrap();
    wait_until(
        || h.control.queue_depth(z) == 0,
        Duration::from_secs(5),
        "runner never picked up the gate message",
    )
    .await;

    for _ in 0..5 {
        h.control
            .send(draft(MessageKind::Event, MessagePriority::Normal))
            .await
            .unwrap();
    }
    h.control
        .send(draft(MessageKind::StatusUpdate, MessagePriority::Critical))
        .await
        .unwrap();
    assert_eq!(h.control.queue_depth(z), 6);

    h.control.stop(z).await.unwrap();

    // Stopping refuses new traffic immediately.
    let refused = h
        .control
        .send(draft(MessageKind::Event, MessagePriority::Normal))
        .await;
    assert!(matches!(
        refused,
        Err(ApiError::NoSuchRecipient { .. })
    ));

    // Release the parked handler; the drain takes over.
    agent.open();
    wait_for_state(&h.control, z, AgentState::Stopped).await;

    let kinds = agent.handled_kinds();
    assert_eq!(kinds.len(), 7, "every queued message drained: {kinds:?}");
    assert_eq!(kinds[0], MessageKind::Control);
    // The Critical status update jumps the five queued Normal events.
    assert_eq!(kinds[1], MessageKind::StatusUpdate);
    assert!(
        kinds[2..].iter().all(|kind| *kind == MessageKind::Event),
        "normals drain after the critical: {kinds:?}"
    );

    // Nothing was dead-lettered; the drain finished inside its deadline.
    assert_eq!(h.control.dead_letter_stats().total, 0);
}

#[tokio::test]
async fn stop_dead_letters_what_the_drain_deadline_cuts_off() {
    let h = harness();

    let agent = GatedAgent::new();
    let z = register_instance(&h.control, "zeta", &[], agent.clone(), AgentConfig::default())
        .await;
    h.control.start(z).await.unwrap();
    wait_for_state(&h.control, z, AgentState::Running).await;

    // Park the runner and queue three more messages behind the gate.
    for _ in 0..4 {
        h.control
            .send(
                MessageDraft::new(
                    Sender::External,
                    Address::Agent(z),
                    MessageKind::Event,
                    Payload::empty(),
                )
                .with_ack_policy(AckPolicy::FireAndForget)
                .with_ttl(Duration::from_secs(60)),
            )
            .await
            .unwrap();
    }
    wait_until(
        || h.control.queue_depth(z) == 3,
        Duration::from_secs(5),
        "runner never parked on the first message",
    )
    .await;

    h.control.stop(z).await.unwrap();
    // Never open the gate: the parked handler times out, and the drain
    // cannot make progress before its deadline.
    wait_for_state(&h.control, z, AgentState::Stopped).await;

    assert!(agent.handled_kinds().is_empty());
    assert!(h.control.dead_letter_stats().total >= 3);
}
