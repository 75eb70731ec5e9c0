//! Broker gateway: the consumer poll loop and the per-record dispatcher.
//!
//! The poll loop is a dedicated owned task that lives as long as the service.
//! It blocks on broker IO and handles one record at a time, so per-topic
//! arrival order is preserved end-to-end from the broker to every subscribed
//! websocket session.  Transient poll failures are logged and retried;
//! losing the consumer for good flips the fatal signal so the service shuts
//! down instead of running deaf.

use serde_json::Map;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use shepherd_protocol::envelope;

use crate::broker::{BrokerError, Delivery, MessageConsumer};
use crate::state::AppState;
use crate::supervisor;

/// Run the consumer poll loop until the broker disconnects.
///
/// `fatal` is flipped on exit so `main` can fold the loop's death into its
/// graceful-shutdown signal.
pub async fn run_poll_loop(
    mut consumer: Box<dyn MessageConsumer>,
    state: AppState,
    fatal: watch::Sender<bool>,
) {
    info!("gateway poll loop started");
    loop {
        match consumer.poll().await {
            Ok(delivery) => dispatch(&state, delivery).await,
            Err(BrokerError::Disconnected) => {
                error!("broker consumer disconnected; signaling shutdown");
                break;
            }
            Err(error) => {
                warn!(%error, "broker poll failed; retrying");
            }
        }
    }
    let _ = fatal.send(true);
}

/// Handle one delivered record.
///
/// Decode failures drop the record.  The control handler runs first; if it
/// fails, the cache and bus updates for this record are skipped so observers
/// never see a message whose side effects did not happen.
pub async fn dispatch(state: &AppState, delivery: Delivery) {
    let Delivery { topic, payload } = delivery;
    let mut message = match envelope::decode(&payload) {
        Ok(message) => message,
        Err(error) => {
            warn!(topic = %topic, %error, "dropping undecodable record");
            return;
        }
    };
    debug!(
        topic = %topic,
        event = message.event.as_deref().unwrap_or("-"),
        blobs = message.blobs.len(),
        "record received"
    );

    if topic == state.config.topics.shepherd_receive {
        if let Err(error) = supervisor::handle_control(state, &message).await {
            error!(topic = %topic, %error, "control handler failed; skipping fan-out for this record");
            return;
        }
    }

    // Blobs never reach the cache or the websocket fan-out.
    message.strip_blobs();
    state
        .last_messages
        .write()
        .await
        .insert(topic.clone(), message.clone());

    match wrap_for_clients(&topic, &message) {
        Ok(payload) => state.bus.publish(&topic, payload).await,
        Err(error) => error!(topic = %topic, %error, "re-serializing record for fan-out failed"),
    }
}

/// The client-facing form: a one-entry `{topic: envelope}` object.
fn wrap_for_clients(
    topic: &str,
    message: &shepherd_protocol::Envelope,
) -> Result<String, serde_json::Error> {
    let mut wrapper = Map::new();
    wrapper.insert(topic.to_owned(), serde_json::to_value(message)?);
    serde_json::to_string(&wrapper)
}
