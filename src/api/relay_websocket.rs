use std::sync::Arc;

use futures::{SinkExt, StreamExt};
use warp::ws::{Message, WebSocket};

use crate::error::{ProctorError, Result};
use crate::signaling::{SignalEnvelope, SignalHub, SignalingChannel};

/// Relays one socket's traffic on the quiz topic. Frames in are published to
/// the hub; everything on the topic, the socket's own frames included, goes
/// back out.
pub async fn handle_relay_websocket(websocket: WebSocket, quiz_id: String, hub: Arc<SignalHub>) {
    let mut subscription = match hub.subscribe(&quiz_id).await {
        Ok(subscription) => subscription,
        Err(e) => {
            tracing::error!(quiz_id = %quiz_id, error = %e, "Failed to subscribe relay socket");
            return;
        }
    };

    tracing::info!(quiz_id = %quiz_id, "New relay WebSocket connection established");

    let (mut ws_sender, mut ws_receiver) = websocket.split();

    let forward_quiz = quiz_id.clone();
    let sender_task = tokio::spawn(async move {
        while let Some(message) = subscription.recv().await {
            let text = match serde_json::to_string(&SignalEnvelope::wrap(message)) {
                Ok(text) => text,
                Err(e) => {
                    tracing::error!(error = %e, "Failed to serialize relayed signal");
                    continue;
                }
            };
            if let Err(e) = ws_sender.send(Message::text(text)).await {
                tracing::debug!(quiz_id = %forward_quiz, error = %e, "Failed to send WebSocket message");
                break;
            }
        }
    });

    while let Some(result) = ws_receiver.next().await {
        match result {
            Ok(message) => {
                if message.is_close() {
                    break;
                }
                if let Err(e) = handle_relay_message(&hub, &quiz_id, message).await {
                    tracing::warn!(quiz_id = %quiz_id, error = %e, "Rejected relay frame");
                }
            }
            Err(e) => {
                tracing::error!(quiz_id = %quiz_id, error = %e, "WebSocket error");
                break;
            }
        }
    }

    // Aborting drops the subscription, which leaves the topic.
    sender_task.abort();
    tracing::info!(quiz_id = %quiz_id, "Relay WebSocket connection closed");
}

async fn handle_relay_message(hub: &SignalHub, quiz_id: &str, message: Message) -> Result<()> {
    let Ok(text) = message.to_str() else {
        return Ok(());
    };

    tracing::trace!(quiz_id = %quiz_id, raw_message = %text, "Received relay frame");

    let envelope: SignalEnvelope = serde_json::from_str(text)
        .map_err(|e| ProctorError::InvalidSignalingMessage(format!("malformed envelope: {}", e)))?;
    let signal = envelope.into_message()?;

    if signal.quiz_id != quiz_id {
        return Err(ProctorError::InvalidSignalingMessage(format!(
            "signal for quiz {} sent on quiz {}",
            signal.quiz_id, quiz_id
        )));
    }

    hub.publish(quiz_id, signal).await
}
