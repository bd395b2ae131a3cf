//! `GET /events` – WebSocket bridge from the event bus to dashboards.
//!
//! Downstream, every event on the selected lane (`?topic=traffic|safety|alerts`,
//! all lanes when omitted) is sent as a JSON text message. A client that falls
//! behind receives `{"kind":"lagged","missed":n}` and keeps streaming.
//!
//! Upstream, the only command accepted is
//! `{"op":"emergency_stop","reason":"..."}`; anything else is ignored.

use axum::{
    extract::{
        Query, State,
        ws::{Message, WebSocket, WebSocketUpgrade},
    },
    response::Response,
};
use coachnet_gateway::StopAck;
use coachnet_middleware::Topic;
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use serde_json::json;
use tokio::sync::broadcast::error::RecvError;
use tracing::{debug, warn};

use crate::state::AppState;

const UPSTREAM_STOP_REASON: &str = "emergency stop requested from a dashboard";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Lane {
    Traffic,
    Safety,
    Alerts,
}

impl From<Lane> for Topic {
    fn from(lane: Lane) -> Self {
        match lane {
            Lane::Traffic => Topic::Traffic,
            Lane::Safety => Topic::SafetyTransitions,
            Lane::Alerts => Topic::SystemAlerts,
        }
    }
}

#[derive(Debug, Default, Deserialize)]
pub struct EventsQuery {
    pub topic: Option<Lane>,
}

pub async fn stream_events(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
    Query(query): Query<EventsQuery>,
) -> Response {
    ws.on_upgrade(move |socket| bridge(socket, state, query.topic))
}

async fn bridge(socket: WebSocket, state: AppState, lane: Option<Lane>) {
    let (mut ws_tx, mut ws_rx) = socket.split();
    let mut events = match lane {
        Some(lane) => state.events.subscribe_to(lane.into()),
        None => state.events.subscribe_all(),
    };

    loop {
        tokio::select! {
            received = events.recv() => {
                let text = match received {
                    Ok(event) => match serde_json::to_string(&event) {
                        Ok(text) => text,
                        Err(e) => {
                            warn!(error = %e, "event not serializable");
                            continue;
                        }
                    },
                    Err(RecvError::Lagged(missed)) => {
                        warn!(missed, "event stream client lagged");
                        json!({ "kind": "lagged", "missed": missed }).to_string()
                    }
                    Err(RecvError::Closed) => break,
                };
                if ws_tx.send(Message::Text(text)).await.is_err() {
                    break;
                }
            }
            message = ws_rx.next() => {
                match message {
                    Some(Ok(Message::Text(text))) => {
                        handle_upstream_message(&text, &state).await;
                    }
                    Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
                    _ => {}
                }
            }
        }
    }
    debug!("event stream client disconnected");
}

#[derive(Debug, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
enum Upstream {
    EmergencyStop {
        #[serde(default)]
        reason: String,
    },
}

/// Act on a message sent by a dashboard. Returns the stop acknowledgement
/// when the message was an emergency stop.
pub(crate) async fn handle_upstream_message(text: &str, state: &AppState) -> Option<StopAck> {
    let Ok(command) = serde_json::from_str::<Upstream>(text) else {
        debug!("ignoring upstream message");
        return None;
    };
    match command {
        Upstream::EmergencyStop { reason } => {
            let reason = match reason.trim() {
                "" => UPSTREAM_STOP_REASON,
                reason => reason,
            };
            Some(state.facade.emergency_stop(reason).await)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::app;

    #[tokio::test]
    async fn upstream_stop_engages_the_interlock() {
        let (_, state) = app().await;
        let mut alerts = state.events.subscribe_to(Topic::SystemAlerts);

        let ack = handle_upstream_message(r#"{"op":"emergency_stop","reason":"awning wind alarm"}"#, &state)
            .await
            .unwrap();
        assert!(!ack.already_engaged);
        assert_eq!(ack.record.reason, "awning wind alarm");
        assert!(state.facade.is_engaged());
        assert!(alerts.recv().await.is_ok());
    }

    #[tokio::test]
    async fn upstream_stop_without_reason_uses_default() {
        let (_, state) = app().await;
        let ack = handle_upstream_message(r#"{"op":"emergency_stop"}"#, &state)
            .await
            .unwrap();
        assert_eq!(ack.record.reason, UPSTREAM_STOP_REASON);
    }

    #[tokio::test]
    async fn unknown_or_invalid_upstream_messages_are_ignored() {
        let (_, state) = app().await;
        assert!(handle_upstream_message(r#"{"op":"subscribe","topic":"/unknown"}"#, &state).await.is_none());
        assert!(handle_upstream_message("not json at all", &state).await.is_none());
        assert!(!state.facade.is_engaged());
    }

    #[test]
    fn lanes_map_to_topics() {
        assert_eq!(Topic::from(Lane::Safety), Topic::SafetyTransitions);
        assert_eq!(Topic::from(Lane::Alerts), Topic::SystemAlerts);
        let query: EventsQuery = serde_json::from_str(r#"{"topic":"traffic"}"#).unwrap();
        assert_eq!(query.topic, Some(Lane::Traffic));
    }
}
