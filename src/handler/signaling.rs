use axum::{
    extract::{
        State,
        ws::{Message, WebSocket, WebSocketUpgrade},
    },
    response::IntoResponse,
};
use futures::stream::SplitSink;
use futures::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::api::AppState;
use crate::media::plan::DestinationRequest;
use crate::session::{Session, SessionEvent};

/// Connection-scoped signaling messages, browser to server.
#[derive(Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
enum ClientMessage {
    Start {
        #[serde(flatten)]
        options: DestinationRequest,
        sdp: String,
    },
    Stop,
}

/// Connection-scoped signaling messages, server to browser.
#[derive(Serialize)]
#[serde(tag = "type", rename_all = "camelCase")]
enum ServerMessage {
    Answer {
        sdp: String,
    },
    Started,
    Stopped {
        #[serde(skip_serializing_if = "Option::is_none")]
        reason: Option<String>,
    },
    Alert {
        message: String,
    },
}

pub async fn ws_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_connection(socket, state))
}

async fn handle_connection(socket: WebSocket, state: AppState) {
    let conn_id = uuid::Uuid::new_v4().to_string();
    log::info!("Signaling: connection {}", conn_id);

    let (mut sink, mut stream) = socket.split();
    // Each started session gets its own event channel. Replacing a
    // session drops the old receiver together with any queued events,
    // so a stale `stopped` can never evict or be attributed to the
    // replacement session.
    let mut events: Option<mpsc::UnboundedReceiver<SessionEvent>> = None;

    loop {
        tokio::select! {
            incoming = stream.next() => match incoming {
                Some(Ok(Message::Text(text))) => {
                    handle_client_message(&state, &conn_id, text.as_str(), &mut events, &mut sink)
                        .await;
                }
                Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
                Some(Ok(_)) => {}
            },
            event = next_event(&mut events) => match event {
                Some(SessionEvent::Started) => {
                    send(&mut sink, &ServerMessage::Started).await;
                }
                Some(SessionEvent::Stopped { reason }) => {
                    // The session is terminal; drop the registry entry.
                    state.registry.remove(&conn_id).await;
                    events = None;
                    send(&mut sink, &ServerMessage::Stopped { reason }).await;
                }
                None => events = None,
            },
        }
    }

    // Connection gone: tear down any live session.
    if let Some(session) = state.registry.remove(&conn_id).await {
        log::info!("Signaling: connection {} closed, stopping session", conn_id);
        session.stop(None).await;
    }
}

/// Resolves the next event of the active session, pending forever when
/// no session is live (so the connection loop just waits for input).
async fn next_event(
    events: &mut Option<mpsc::UnboundedReceiver<SessionEvent>>,
) -> Option<SessionEvent> {
    match events {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}

async fn handle_client_message(
    state: &AppState,
    conn_id: &str,
    text: &str,
    events: &mut Option<mpsc::UnboundedReceiver<SessionEvent>>,
    sink: &mut SplitSink<WebSocket, Message>,
) {
    let message = match serde_json::from_str::<ClientMessage>(text) {
        Ok(message) => message,
        Err(e) => {
            log::warn!("Signaling: malformed message from {}: {}", conn_id, e);
            send(
                sink,
                &ServerMessage::Alert {
                    message: "malformed signaling message".to_string(),
                },
            )
            .await;
            return;
        }
    };

    match message {
        ClientMessage::Start { options, sdp } => {
            // At most one live session per connection: the old one is
            // fully torn down, and its event channel discarded, before
            // a fresh session is built.
            if let Some(old) = state.registry.remove(conn_id).await {
                old.stop(None).await;
            }
            *events = None;

            let (event_tx, event_rx) = mpsc::unbounded_channel();
            match Session::start(
                conn_id,
                state.engine.clone(),
                state.allocator.clone(),
                &options,
                &sdp,
                event_tx,
            )
            .await
            {
                Ok((session, answer)) => {
                    state.registry.insert(conn_id, session).await;
                    *events = Some(event_rx);
                    send(sink, &ServerMessage::Answer { sdp: answer }).await;
                }
                Err(e) => {
                    log::warn!("Signaling: start rejected for {}: {}", conn_id, e);
                    send(
                        sink,
                        &ServerMessage::Alert {
                            message: e.to_string(),
                        },
                    )
                    .await;
                }
            }
        }
        ClientMessage::Stop => {
            if let Some(session) = state.registry.remove(conn_id).await {
                session.stop(None).await;
            }
        }
    }
}

async fn send(sink: &mut SplitSink<WebSocket, Message>, message: &ServerMessage) {
    let json = match serde_json::to_string(message) {
        Ok(json) => json,
        Err(e) => {
            log::error!("Signaling: serialize failed: {}", e);
            return;
        }
    };
    if let Err(e) = sink.send(Message::Text(json.into())).await {
        log::debug!("Signaling: send failed: {}", e);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_start_message_parses_with_options() {
        let text = r#"{
            "type": "start",
            "rtmp": true,
            "rtmpAddress": "rtmp://host/app/key",
            "mp4": true,
            "streamApp": "tv",
            "streamName": "cam1",
            "sdp": "v=0"
        }"#;
        match serde_json::from_str::<ClientMessage>(text).unwrap() {
            ClientMessage::Start { options, sdp } => {
                assert!(options.rtmp);
                assert_eq!(options.rtmp_address.as_deref(), Some("rtmp://host/app/key"));
                assert!(options.mp4);
                assert_eq!(options.stream_app.as_deref(), Some("tv"));
                assert_eq!(sdp, "v=0");
            }
            _ => panic!("expected start"),
        }
    }

    #[test]
    fn test_stop_message_parses() {
        let message = serde_json::from_str::<ClientMessage>(r#"{"type":"stop"}"#).unwrap();
        assert!(matches!(message, ClientMessage::Stop));
    }

    #[test]
    fn test_stopped_reason_omitted_when_none() {
        let json = serde_json::to_string(&ServerMessage::Stopped { reason: None }).unwrap();
        assert_eq!(json, r#"{"type":"stopped"}"#);
        let json = serde_json::to_string(&ServerMessage::Stopped {
            reason: Some("transcoder exited with code 1".to_string()),
        })
        .unwrap();
        assert!(json.contains("transcoder exited with code 1"));
    }
}
