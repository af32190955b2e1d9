//! Shared fixtures for the integration suites.

#![allow(dead_code)]

use async_trait::async_trait;
use std::collections::BTreeSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use hypha::domain_types::{AgentId, AgentName, CapabilityName};
use hypha::{
    Agent, AgentBehavior, AgentConfig, AgentContext, AgentRegistration, AgentState, AlertSink,
    CapturingAlertSink, ControlApi, HandlerError, Message, Runtime, RuntimeConfig,
    test_time_provider,
};

/// A runtime wired for tests: collapsed delays, capturing alerts.
pub struct TestHarness {
    pub runtime: Runtime,
    pub control: ControlApi,
    pub alerts: Arc<CapturingAlertSink>,
}

pub fn harness() -> TestHarness {
    harness_with(RuntimeConfig::testing())
}

pub fn harness_with(config: RuntimeConfig) -> TestHarness {
    let alerts = Arc::new(CapturingAlertSink::new());
    let runtime = Runtime::builder(config)
        .time_provider(test_time_provider())
        .alert_sink(Arc::clone(&alerts) as Arc<dyn AlertSink>)
        .build()
        .expect("test config must validate");
    runtime.start();
    let control = runtime.control();
    TestHarness {
        runtime,
        control,
        alerts,
    }
}

pub fn name(value: &str) -> AgentName {
    AgentName::try_new(value.to_string()).unwrap()
}

pub fn caps(tags: &[&str]) -> BTreeSet<CapabilityName> {
    tags.iter()
        .map(|tag| CapabilityName::try_new((*tag).to_string()).unwrap())
        .collect()
}

pub fn cap(tag: &str) -> CapabilityName {
    CapabilityName::try_new(tag.to_string()).unwrap()
}

/// Registers an agent instance with the given name and capabilities.
pub async fn register_instance(
    control: &ControlApi,
    agent_name: &str,
    tags: &[&str],
    agent: Arc<dyn Agent>,
    config: AgentConfig,
) -> AgentId {
    let registration = AgentRegistration {
        name: name(agent_name),
        capabilities: caps(tags),
        relationships: BTreeSet::new(),
        config,
        behavior: AgentBehavior::Instance(agent),
    };
    control.register(registration).await.unwrap()
}

/// Polls until the agent reaches `state` or the budget elapses.
pub async fn wait_for_state(control: &ControlApi, agent_id: AgentId, state: AgentState) {
    wait_until(
        || {
            control
                .get(agent_id)
                .map(|descriptor| descriptor.state == state)
                .unwrap_or(false)
        },
        Duration::from_secs(5),
        &format!("agent {agent_id} never reached {state}"),
    )
    .await;
}

/// Polls a predicate with a short sleep until it holds or the budget elapses.
pub async fn wait_until(predicate: impl Fn() -> bool, budget: Duration, what: &str) {
    let deadline = std::time::Instant::now() + budget;
    while !predicate() {
        assert!(
            std::time::Instant::now() < deadline,
            "timed out waiting: {what}"
        );
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

/// Agent that records every message it handles.
#[derive(Debug, Default)]
pub struct RecordingAgent {
    pub handled: Mutex<Vec<Message>>,
    /// Optional per-message handler delay.
    pub delay: Option<Duration>,
}

impl RecordingAgent {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn with_delay(delay: Duration) -> Arc<Self> {
        Arc::new(Self {
            handled: Mutex::new(Vec::new()),
            delay: Some(delay),
        })
    }

    pub fn handled_ids(&self) -> Vec<u64> {
        self.handled
            .lock()
            .unwrap()
            .iter()
            .map(|message| message.message_id.as_u64())
            .collect()
    }

    pub fn handled_count(&self) -> usize {
        self.handled.lock().unwrap().len()
    }
}

#[async_trait]
impl Agent for RecordingAgent {
    async fn handle(&self, _ctx: &AgentContext, message: Message) -> Result<(), HandlerError> {
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        self.handled.lock().unwrap().push(message);
        Ok(())
    }
}

/// Agent whose handler parks forever; used to hold inbox depth steady.
#[derive(Debug, Default)]
pub struct ParkedAgent;

#[async_trait]
impl Agent for ParkedAgent {
    async fn handle(&self, _ctx: &AgentContext, _message: Message) -> Result<(), HandlerError> {
        // Far beyond any test window.
        tokio::time::sleep(Duration::from_secs(3600)).await;
        Ok(())
    }
}

/// Agent that fails initialization on every start.
#[derive(Debug, Default)]
pub struct NeverStartsAgent;

#[async_trait]
impl Agent for NeverStartsAgent {
    async fn initialize(&self, _ctx: &AgentContext) -> Result<(), HandlerError> {
        Err(HandlerError::fatal("refuses to start"))
    }

    async fn handle(&self, _ctx: &AgentContext, _message: Message) -> Result<(), HandlerError> {
        Ok(())
    }
}

/// Agent that holds every message until the gate opens, then records it.
#[derive(Debug, Default)]
pub struct GatedAgent {
    pub handled: Mutex<Vec<Message>>,
    opened: Mutex<bool>,
}

impl GatedAgent {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn open(&self) {
        *self.opened.lock().unwrap() = true;
    }

    pub fn handled_kinds(&self) -> Vec<hypha::MessageKind> {
        self.handled
            .lock()
            .unwrap()
            .iter()
            .map(|message| message.kind)
            .collect()
    }
}

#[async_trait]
impl Agent for GatedAgent {
    async fn handle(&self, _ctx: &AgentContext, message: Message) -> Result<(), HandlerError> {
        while !*self.opened.lock().unwrap() {
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
        self.handled.lock().unwrap().push(message);
        Ok(())
    }
}

/// Agent that rejects a configurable number of times before succeeding.
#[derive(Debug)]
pub struct FlakyAgent {
    pub failures_left: Mutex<u32>,
    pub handled: Mutex<Vec<Message>>,
}

impl FlakyAgent {
    pub fn failing(times: u32) -> Arc<Self> {
        Arc::new(Self {
            failures_left: Mutex::new(times),
            handled: Mutex::new(Vec::new()),
        })
    }
}

#[async_trait]
impl Agent for FlakyAgent {
    async fn handle(&self, _ctx: &AgentContext, message: Message) -> Result<(), HandlerError> {
        {
            let mut left = self.failures_left.lock().unwrap();
            if *left > 0 {
                *left -= 1;
                return Err(HandlerError::transient("not yet"));
            }
        }
        self.handled.lock().unwrap().push(message);
        Ok(())
    }
}
