use std::collections::HashMap;

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use tokio::sync::{mpsc, Mutex};
use tokio_tungstenite::{connect_async, tungstenite::Message};

use super::channel::{SignalingChannel, Subscription};
use super::message::{SignalEnvelope, SignalingMessage};
use crate::error::{ProctorError, Result};

/// `SignalingChannel` backed by the relay server's `/signal/{quizId}` socket.
pub struct RelayChannel {
    base_url: String,
    publishers: Mutex<HashMap<String, mpsc::UnboundedSender<Message>>>,
}

impl RelayChannel {
    /// `base_url` is the relay's websocket root, e.g. `ws://127.0.0.1:8080`.
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            publishers: Mutex::new(HashMap::new()),
        }
    }

    fn endpoint(&self, quiz_id: &str) -> String {
        format!(
            "{}/signal/{}",
            self.base_url.trim_end_matches('/'),
            urlencoding::encode(quiz_id)
        )
    }

    async fn publisher(&self, quiz_id: &str) -> Result<mpsc::UnboundedSender<Message>> {
        let mut publishers = self.publishers.lock().await;
        if let Some(sender) = publishers.get(quiz_id) {
            if !sender.is_closed() {
                return Ok(sender.clone());
            }
        }

        let url = self.endpoint(quiz_id);
        let (stream, _) = connect_async(url.clone())
            .await
            .map_err(|e| ProctorError::signaling(format!("connect {} failed: {}", url, e)))?;
        let (mut sink, mut source) = stream.split();
        let (tx, mut rx) = mpsc::unbounded_channel::<Message>();

        let quiz = quiz_id.to_string();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    outgoing = rx.recv() => match outgoing {
                        Some(message) => {
                            if let Err(e) = sink.send(message).await {
                                tracing::error!(quiz_id = %quiz, error = %e, "Failed to send signal to relay");
                                break;
                            }
                        }
                        None => break,
                    },
                    // The relay echoes the topic back; publishers ignore it.
                    incoming = source.next() => if incoming.is_none() {
                        break;
                    },
                }
            }
            tracing::debug!(quiz_id = %quiz, "Relay publisher closed");
        });

        publishers.insert(quiz_id.to_string(), tx.clone());
        Ok(tx)
    }
}

#[async_trait]
impl SignalingChannel for RelayChannel {
    async fn publish(&self, quiz_id: &str, message: SignalingMessage) -> Result<()> {
        if message.quiz_id != quiz_id {
            return Err(ProctorError::InvalidSignalingMessage(format!(
                "message for quiz {} published on quiz {}",
                message.quiz_id, quiz_id
            )));
        }

        let text = serde_json::to_string(&SignalEnvelope::wrap(message))?;
        let sender = self.publisher(quiz_id).await?;
        sender
            .send(Message::Text(text))
            .map_err(|_| ProctorError::signaling("relay publisher is closed"))
    }

    async fn subscribe(&self, quiz_id: &str) -> Result<Subscription> {
        let url = self.endpoint(quiz_id);
        let (stream, _) = connect_async(url.clone())
            .await
            .map_err(|e| ProctorError::signaling(format!("connect {} failed: {}", url, e)))?;
        let (sink, mut source) = stream.split();
        let (tx, rx) = mpsc::unbounded_channel();

        let quiz = quiz_id.to_string();
        let reader = tokio::spawn(async move {
            // Keeps the write half alive for the lifetime of the subscription.
            let _sink = sink;
            while let Some(frame) = source.next().await {
                let text = match frame {
                    Ok(Message::Text(text)) => text,
                    Ok(Message::Close(_)) => break,
                    Ok(_) => continue,
                    Err(e) => {
                        tracing::error!(quiz_id = %quiz, error = %e, "Relay subscription error");
                        break;
                    }
                };

                let parsed = serde_json::from_str::<SignalEnvelope>(&text)
                    .map_err(ProctorError::from)
                    .and_then(SignalEnvelope::into_message);
                match parsed {
                    Ok(message) => {
                        if tx.send(message).is_err() {
                            break;
                        }
                    }
                    Err(e) => {
                        tracing::warn!(quiz_id = %quiz, error = %e, raw_message = %text, "Ignoring malformed relay frame");
                    }
                }
            }
        });

        Ok(Subscription::new(quiz_id, rx, move || reader.abort()))
    }
}
