//! End-to-end messaging semantics: at-least-once with bounded retries,
//! permanent rejection, correlation propagation through replies, control
//! auditing, and the destructive-action policy gate.

mod common;

use std::sync::Arc;
use std::time::Duration;

use common::{FlakyAgent, cap, harness, name, register_instance, wait_for_state, wait_until};
use hypha::{
    ActionCategory, ActionStatus, Address, AgentBehavior, AgentConfig, AgentRegistration,
    AgentState, AuditFilter, DeadLetterReason, DeliveryStatus, EchoAgent, HandlerError,
    HandlerTable, Message, MessageDraft, MessageKind, Payload, RoutingPolicy, Runtime,
    RuntimeConfig, Sender, test_time_provider,
};
use hypha::audit::DenyDestructivePolicy;

#[tokio::test]
async fn transient_rejections_retry_until_handled() {
    let h = harness();

    let agent = FlakyAgent::failing(2);
    let a = register_instance(&h.control, "flaky", &[], agent.clone(), AgentConfig::default())
        .await;
    h.control.start(a).await.unwrap();
    wait_for_state(&h.control, a, AgentState::Running).await;

    let receipt = h
        .control
        .send(
            MessageDraft::new(
                Sender::External,
                Address::Agent(a),
                MessageKind::Event,
                Payload::empty(),
            )
            .with_ttl(Duration::from_secs(60)),
        )
        .await
        .unwrap();

    // Two transient failures, then success on the third attempt.
    assert_eq!(receipt.wait_one().await.unwrap(), DeliveryStatus::Handled);
    assert_eq!(agent.handled.lock().unwrap().len(), 1);

    let snapshot = h.control.metrics_snapshot();
    assert_eq!(
        snapshot.messages_acked_total.get("rejected_transient"),
        Some(&2)
    );
    assert_eq!(snapshot.messages_acked_total.get("handled"), Some(&1));
    assert_eq!(snapshot.dead_lettered_total(), 0);
}

#[tokio::test]
async fn retries_exhaust_into_the_dead_letter_queue() {
    let h = harness();

    // Never succeeds; testing config allows 3 attempts.
    let agent = FlakyAgent::failing(u32::MAX);
    let a = register_instance(&h.control, "flaky", &[], agent, AgentConfig::default()).await;
    h.control.start(a).await.unwrap();
    wait_for_state(&h.control, a, AgentState::Running).await;

    let receipt = h
        .control
        .send(
            MessageDraft::new(
                Sender::External,
                Address::Agent(a),
                MessageKind::Event,
                Payload::empty(),
            )
            .with_ttl(Duration::from_secs(60)),
        )
        .await
        .unwrap();

    assert_eq!(
        receipt.wait_one().await.unwrap(),
        DeliveryStatus::DeadLettered(DeadLetterReason::AttemptsExhausted)
    );
    assert_eq!(
        h.control
            .metrics_snapshot()
            .dead_lettered_for(DeadLetterReason::AttemptsExhausted),
        1
    );
}

#[tokio::test]
async fn permanent_rejection_dead_letters_immediately() {
    let h = harness();

    let table = HandlerTable::new().on(
        MessageKind::Event,
        ActionCategory::ToolCall,
        |_ctx, _message| async { Err(HandlerError::permanent("malformed input")) },
    );
    let a = register_instance(
        &h.control,
        "strict",
        &[],
        Arc::new(table),
        AgentConfig::default(),
    )
    .await;
    h.control.start(a).await.unwrap();
    wait_for_state(&h.control, a, AgentState::Running).await;

    let receipt = h
        .control
        .send(
            MessageDraft::new(
                Sender::External,
                Address::Agent(a),
                MessageKind::Event,
                Payload::empty(),
            )
            .with_ttl(Duration::from_secs(60)),
        )
        .await
        .unwrap();

    assert_eq!(
        receipt.wait_one().await.unwrap(),
        DeliveryStatus::DeadLettered(DeadLetterReason::RejectedPermanent)
    );
    // A single delivery attempt, never retried.
    let snapshot = h.control.metrics_snapshot();
    assert_eq!(
        snapshot.messages_acked_total.get("rejected_permanent"),
        Some(&1)
    );
}

#[tokio::test]
async fn replies_carry_the_correlation_id_back() {
    let h = harness();

    // A requester that records responses, and an echo responder.
    let received = Arc::new(std::sync::Mutex::new(Vec::<Message>::new()));
    let requester_table = HandlerTable::new().on(
        MessageKind::CapabilityResponse,
        ActionCategory::ToolCall,
        {
            let received = Arc::clone(&received);
            move |_ctx, message| {
                let received = Arc::clone(&received);
                async move {
                    received.lock().unwrap().push(message);
                    Ok(())
                }
            }
        },
    );
    let requester = register_instance(
        &h.control,
        "requester",
        &[],
        Arc::new(requester_table),
        AgentConfig::default(),
    )
    .await;
    let responder = register_instance(
        &h.control,
        "responder",
        &["echo"],
        Arc::new(EchoAgent),
        AgentConfig::default(),
    )
    .await;
    h.control.start(requester).await.unwrap();
    h.control.start(responder).await.unwrap();
    wait_for_state(&h.control, requester, AgentState::Running).await;
    wait_for_state(&h.control, responder, AgentState::Running).await;

    // The request must originate from the requester agent so the echo has
    // somewhere to reply.
    let receipt = h
        .control
        .send(
            MessageDraft::new(
                Sender::Agent(requester),
                Address::Capability(cap("echo")),
                MessageKind::CapabilityRequest,
                Payload::json(&serde_json::json!({"ping": 1})).unwrap(),
            )
            .with_routing(RoutingPolicy::Any)
            .with_ttl(Duration::from_secs(60)),
        )
        .await
        .unwrap();
    let correlation = receipt.correlation_id;
    assert_eq!(receipt.wait_one().await.unwrap(), DeliveryStatus::Handled);

    wait_until(
        || !received.lock().unwrap().is_empty(),
        Duration::from_secs(5),
        "requester never saw the response",
    )
    .await;
    let response = received.lock().unwrap().remove(0);
    assert_eq!(response.kind, MessageKind::CapabilityResponse);
    assert_eq!(response.correlation_id, correlation);
    assert_eq!(response.from, Sender::Agent(responder));
    let body: serde_json::Value = response.payload.parse_json().unwrap();
    assert_eq!(body["ping"], 1);
}

#[tokio::test]
async fn circular_traffic_between_two_agents_stays_responsive() {
    let h = harness();

    // Two agents bat a counter back and forth through capability addressing;
    // the runtime must keep routing until the counter runs out.
    let hops = Arc::new(std::sync::atomic::AtomicU32::new(0));
    let volley = |other_cap: &'static str, hops: Arc<std::sync::atomic::AtomicU32>| {
        HandlerTable::new().on(MessageKind::Event, ActionCategory::ToolCall, {
            move |ctx, message: Message| {
                let hops = Arc::clone(&hops);
                async move {
                    hops.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
                    let n: u32 = message
                        .payload
                        .parse_json::<serde_json::Value>()
                        .ok()
                        .and_then(|value| value["n"].as_u64())
                        .and_then(|n| u32::try_from(n).ok())
                        .unwrap_or(0);
                    if n > 0 {
                        let payload = Payload::json(&serde_json::json!({"n": n - 1}))
                            .map_err(|e| HandlerError::permanent(e.to_string()))?;
                        let draft = ctx
                            .draft(
                                Address::Capability(
                                    hypha::domain_types::CapabilityName::try_new(
                                        other_cap.to_string(),
                                    )
                                    .unwrap(),
                                ),
                                MessageKind::Event,
                                payload,
                            )
                            .with_correlation_id(message.correlation_id)
                            .with_ttl(Duration::from_secs(60));
                        ctx.send(draft)
                            .await
                            .map_err(|e| HandlerError::transient(e.to_string()))?;
                    }
                    Ok(())
                }
            }
        })
    };

    let ping = register_instance(
        &h.control,
        "ping",
        &["ping"],
        Arc::new(volley("pong", Arc::clone(&hops))),
        AgentConfig::default(),
    )
    .await;
    let pong = register_instance(
        &h.control,
        "pong",
        &["pong"],
        Arc::new(volley("ping", Arc::clone(&hops))),
        AgentConfig::default(),
    )
    .await;
    h.control.start(ping).await.unwrap();
    h.control.start(pong).await.unwrap();
    wait_for_state(&h.control, ping, AgentState::Running).await;
    wait_for_state(&h.control, pong, AgentState::Running).await;

    h.control
        .send(
            MessageDraft::new(
                Sender::External,
                Address::Agent(ping),
                MessageKind::Event,
                Payload::json(&serde_json::json!({"n": 20})).unwrap(),
            )
            .with_ttl(Duration::from_secs(60)),
        )
        .await
        .unwrap();

    // 21 hops: the seed plus twenty volleys.
    wait_until(
        || hops.load(std::sync::atomic::Ordering::Relaxed) >= 21,
        Duration::from_secs(5),
        "circular traffic stalled",
    )
    .await;
    assert_eq!(h.control.dead_letter_stats().total, 0);
}

#[tokio::test]
async fn control_messages_always_reach_the_audit_trail() {
    let h = harness();

    let table = HandlerTable::new().on(
        MessageKind::Control,
        ActionCategory::Control,
        |_ctx, _message| async { Ok(()) },
    );
    let a = register_instance(
        &h.control,
        "controlled",
        &[],
        Arc::new(table),
        AgentConfig::default(),
    )
    .await;
    h.control.start(a).await.unwrap();
    wait_for_state(&h.control, a, AgentState::Running).await;

    let receipt = h
        .control
        .send(
            MessageDraft::new(
                Sender::External,
                Address::Agent(a),
                MessageKind::Control,
                Payload::empty(),
            )
            .with_ttl(Duration::from_secs(60)),
        )
        .await
        .unwrap();
    let correlation = receipt.correlation_id;
    assert_eq!(receipt.wait_one().await.unwrap(), DeliveryStatus::Handled);

    h.runtime.audit().flush().await;
    let records = h.control.audit_query(&AuditFilter {
        correlation_id: Some(correlation),
        ..AuditFilter::default()
    });
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].kind, ActionCategory::Control);
    assert_eq!(records[0].status, ActionStatus::Completed);
    assert!(records[0].ended_at.is_some());
}

#[tokio::test]
async fn destructive_actions_fail_the_policy_gate() {
    let runtime = Runtime::builder(RuntimeConfig::testing())
        .time_provider(test_time_provider())
        .action_policy(Arc::new(DenyDestructivePolicy))
        .build()
        .unwrap();
    runtime.start();
    let control = runtime.control();

    let table = HandlerTable::new().on(
        MessageKind::Event,
        ActionCategory::Destructive,
        |_ctx, _message| async { Ok(()) },
    );
    let registration = AgentRegistration::new(
        name("wrecker"),
        Default::default(),
        AgentBehavior::Instance(Arc::new(table)),
    );
    let a = control.register(registration).await.unwrap();
    control.start(a).await.unwrap();
    wait_for_state(&control, a, AgentState::Running).await;

    let receipt = control
        .send(
            MessageDraft::new(
                Sender::External,
                Address::Agent(a),
                MessageKind::Event,
                Payload::empty(),
            )
            .with_ttl(Duration::from_secs(60)),
        )
        .await
        .unwrap();
    let correlation = receipt.correlation_id;

    assert_eq!(
        receipt.wait_one().await.unwrap(),
        DeliveryStatus::DeadLettered(DeadLetterReason::PolicyDenied)
    );

    runtime.audit().flush().await;
    let denied = control.audit_query(&AuditFilter {
        correlation_id: Some(correlation),
        status: Some(ActionStatus::DeniedByPolicy),
        ..AuditFilter::default()
    });
    assert_eq!(denied.len(), 1, "policy denial must be audited");
    assert_eq!(denied[0].kind, ActionCategory::Destructive);
}
