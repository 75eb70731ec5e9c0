//! Websocket session layer for Lens clients.
//!
//! One session per connection.  The outbound side is the event-bus
//! subscription for the configured event topic, forwarded verbatim; the
//! inbound side parses client JSON and routes it: initialization requests
//! are answered from the last-message cache on the originating socket,
//! `DIVIDE_CELL` goes to the cell-receive topic, and everything else lands
//! on the shepherd-receive control topic.

use axum::extract::ws::rejection::WebSocketUpgradeRejection;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use thiserror::Error;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};
use uuid::Uuid;

use shepherd_protocol::{Envelope, Event};

use crate::broker::BrokerError;
use crate::state::AppState;

#[derive(Debug, Error)]
enum SessionError {
    #[error("client JSON: {0}")]
    Json(#[from] serde_json::Error),
    #[error(transparent)]
    Broker(#[from] BrokerError),
    #[error("socket send: {0}")]
    Socket(#[from] axum::Error),
}

pub async fn ws_handler(
    ws: Result<WebSocketUpgrade, WebSocketUpgradeRejection>,
    State(state): State<AppState>,
) -> Response {
    match ws {
        Ok(upgrade) => upgrade
            .on_upgrade(move |socket| handle_session(socket, state))
            .into_response(),
        Err(rejection) => {
            debug!(error = %rejection, "websocket upgrade failed");
            (
                StatusCode::BAD_REQUEST,
                [(header::CONTENT_TYPE, "application/text")],
                "must connect using websocket request",
            )
                .into_response()
        }
    }
}

async fn handle_session(mut socket: WebSocket, state: AppState) {
    let session = Uuid::new_v4();
    let event_topic = state.config.topics.event.clone();
    let mut updates = state.bus.subscribe(&event_topic).await;
    info!(session = %session, topic = %event_topic, "lens client connected");

    loop {
        tokio::select! {
            update = updates.recv() => match update {
                Ok(payload) => {
                    if socket.send(Message::Text(payload)).await.is_err() {
                        break;
                    }
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(session = %session, skipped, "client lagging; skipped updates");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            },
            inbound = socket.recv() => match inbound {
                Some(Ok(Message::Text(text))) => {
                    if let Err(error) = handle_client_message(&mut socket, &state, &text).await {
                        warn!(session = %session, %error, "client message failed");
                    }
                }
                Some(Ok(Message::Ping(data))) => {
                    if socket.send(Message::Pong(data)).await.is_err() {
                        break;
                    }
                }
                Some(Ok(Message::Close(_))) | None => break,
                Some(Ok(_)) => {}
                Some(Err(error)) => {
                    warn!(session = %session, %error, "websocket receive error");
                    break;
                }
            },
        }
    }
    info!(session = %session, "lens client disconnected");
}

async fn handle_client_message(
    socket: &mut WebSocket,
    state: &AppState,
    text: &str,
) -> Result<(), SessionError> {
    let envelope: Envelope = shepherd_protocol::json::from_slice(text.as_bytes())?;
    match envelope.parsed_event() {
        // Late joiners get the whole last-message map as their snapshot.
        Some(Event::Initialize | Event::VisualizationInitialize) => {
            let snapshot = {
                let cache = state.last_messages.read().await;
                serde_json::to_string(&*cache)?
            };
            socket.send(Message::Text(snapshot)).await?;
        }
        Some(Event::DivideCell) => {
            state
                .producer
                .send(&state.config.topics.cell_receive, &envelope)
                .await?;
        }
        _ => {
            state
                .producer
                .send(&state.config.topics.shepherd_receive, &envelope)
                .await?;
        }
    }
    Ok(())
}
