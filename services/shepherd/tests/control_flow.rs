//! End-to-end control flow over the in-process broker: publish control
//! messages on shepherd-receive, let the gateway poll loop dispatch them,
//! and observe the registry and the agent-receive topic.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use tokio::sync::watch;

use shepherd::broker::{MemoryBroker, MessageConsumer, MessageProducer};
use shepherd::config::ShepherdConfig;
use shepherd::{gateway, supervisor, AppState};
use shepherd_protocol::{Envelope, Event};

fn test_config() -> ShepherdConfig {
    let mut config = ShepherdConfig::default();
    // Tests never wait out a full termination timeout.
    config.agents.shutdown_timeout_secs = 0;
    config
}

/// Spin up state plus a running poll loop against a fresh hub.
async fn start_service() -> (AppState, MemoryBroker) {
    let hub = MemoryBroker::new();
    let config = Arc::new(test_config());
    let consumer = hub.consumer(&config.broker.subscribe).await;
    let state = AppState::new(config, Arc::new(hub.producer()));
    let (fatal_tx, _fatal_rx) = watch::channel(false);
    tokio::spawn(gateway::run_poll_loop(
        Box::new(consumer),
        state.clone(),
        fatal_tx,
    ));
    (state, hub)
}

fn add_agent_envelope(agent_id: &str, agent_type: &str) -> Envelope {
    Envelope {
        event: Some(Event::AddAgent.as_wire().to_owned()),
        agent_id: Some(agent_id.to_owned()),
        agent_type: Some(agent_type.to_owned()),
        agent_config: Some(
            json!({"boot": ["sh", "-c", "sleep 60"], "sleep_ms": 60000})
                .as_object()
                .unwrap()
                .clone(),
        ),
        ..Envelope::default()
    }
}

/// Poll `predicate` until it holds or five seconds pass.
async fn wait_until<F, Fut>(mut predicate: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    for _ in 0..250 {
        if predicate().await {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    false
}

#[tokio::test]
async fn add_agent_then_report_status() {
    let (state, hub) = start_service().await;
    hub.producer()
        .send("shepherd-receive", &add_agent_envelope("a1", "noop"))
        .await
        .unwrap();

    assert!(
        wait_until(|| async { !state.registry.read().await.is_empty() }).await,
        "agent never appeared in the registry"
    );

    let statuses = supervisor::status(&state).await;
    assert_eq!(statuses.len(), 1);
    let status = &statuses[0];
    assert_eq!(status.agent_id, "a1");
    assert_eq!(status.agent_type, "noop");
    assert!(status.alive);
    assert_eq!(status.agent_config["sleep_ms"], json!(60000));
    // The injected broker coordinates ride along in the config.
    assert_eq!(status.agent_config["kafka_config"]["subscribe"], json!([]));

    supervisor::shutdown_all(&state).await;
}

#[tokio::test]
async fn add_then_remove_leaves_no_record_and_no_process() {
    let (state, hub) = start_service().await;
    let producer = hub.producer();
    producer
        .send("shepherd-receive", &add_agent_envelope("x1", "noop"))
        .await
        .unwrap();
    assert!(wait_until(|| async { state.registry.read().await.contains_key("x1") }).await);

    let process = Arc::clone(&state.registry.read().await["x1"].process);

    let mut remove = Envelope::for_agent(Event::RemoveAgent, "x1");
    remove.agent_type = None;
    producer.send("shepherd-receive", &remove).await.unwrap();

    assert!(
        wait_until(|| async { !state.registry.read().await.contains_key("x1") }).await,
        "agent was not removed"
    );
    assert!(!process.alive().await);
}

#[tokio::test]
async fn remove_by_prefix_spares_other_agents() {
    let (state, hub) = start_service().await;
    let producer = hub.producer();
    let mut commands = hub.consumer(&["agent-receive".to_owned()]).await;

    for id in ["cell-1", "cell-2", "env-1"] {
        producer
            .send("shepherd-receive", &add_agent_envelope(id, "cell"))
            .await
            .unwrap();
    }
    assert!(wait_until(|| async { state.registry.read().await.len() == 3 }).await);

    let remove = Envelope {
        event: Some(Event::RemoveAgent.as_wire().to_owned()),
        prefix: Some("cell-".to_owned()),
        ..Envelope::default()
    };
    producer.send("shepherd-receive", &remove).await.unwrap();

    assert!(
        wait_until(|| async {
            let registry = state.registry.read().await;
            registry.len() == 1 && registry.contains_key("env-1")
        })
        .await,
        "prefix removal did not converge on env-1 alone"
    );

    // One SHUTDOWN_AGENT per removed agent, order unspecified.
    let mut shut_down = HashSet::new();
    for _ in 0..2 {
        let delivery = commands.poll().await.unwrap();
        let envelope = shepherd_protocol::decode(&delivery.payload).unwrap();
        assert_eq!(envelope.parsed_event(), Some(Event::ShutdownAgent));
        shut_down.insert(envelope.agent_id.unwrap());
    }
    assert_eq!(
        shut_down,
        HashSet::from(["cell-1".to_owned(), "cell-2".to_owned()])
    );

    supervisor::shutdown_all(&state).await;
}

#[tokio::test]
async fn pause_all_broadcasts_one_command_per_agent() {
    let (state, hub) = start_service().await;
    let producer = hub.producer();
    let mut commands = hub.consumer(&["agent-receive".to_owned()]).await;

    for id in ["a", "b", "c"] {
        producer
            .send("shepherd-receive", &add_agent_envelope(id, "noop"))
            .await
            .unwrap();
    }
    assert!(wait_until(|| async { state.registry.read().await.len() == 3 }).await);

    producer
        .send("shepherd-receive", &Envelope::for_event(Event::PauseAll))
        .await
        .unwrap();

    let mut paused = HashSet::new();
    for _ in 0..3 {
        let delivery = commands.poll().await.unwrap();
        let envelope = shepherd_protocol::decode(&delivery.payload).unwrap();
        assert_eq!(envelope.parsed_event(), Some(Event::PauseAgent));
        paused.insert(envelope.agent_id.unwrap());
    }
    assert_eq!(
        paused,
        HashSet::from(["a".to_owned(), "b".to_owned(), "c".to_owned()])
    );

    supervisor::shutdown_all(&state).await;
}

/// An undecodable record on the control topic does not stall the loop.
#[tokio::test]
async fn poll_loop_survives_garbage_records() {
    let (state, hub) = start_service().await;
    let producer = hub.producer();

    let mut garbage = Vec::new();
    shepherd_protocol::chunk::write_chunk(
        &mut garbage,
        shepherd_protocol::chunk::TAG_JSON,
        b"{broken",
        false,
    )
    .unwrap();
    producer
        .send_bytes("shepherd-receive", garbage)
        .await
        .unwrap();
    producer
        .send("shepherd-receive", &add_agent_envelope("after", "noop"))
        .await
        .unwrap();

    assert!(
        wait_until(|| async { state.registry.read().await.contains_key("after") }).await,
        "record after garbage was not processed"
    );
    supervisor::shutdown_all(&state).await;
}
