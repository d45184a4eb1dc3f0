use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{Mutex, MutexGuard};

use super::session::PeerSession;

/// Active sessions keyed by remote peer id. At most one per peer.
///
/// Owned by the link that created it and dropped with it; nothing here is
/// process-global.
#[derive(Default)]
pub struct SessionRegistry {
    sessions: Mutex<HashMap<String, Arc<PeerSession>>>,
}

pub type RegistryGuard<'a> = MutexGuard<'a, HashMap<String, Arc<PeerSession>>>;

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Holds the registry for a check-then-act sequence on one peer.
    pub async fn lock(&self) -> RegistryGuard<'_> {
        self.sessions.lock().await
    }

    pub async fn get(&self, peer_id: &str) -> Option<Arc<PeerSession>> {
        self.sessions.lock().await.get(peer_id).cloned()
    }

    /// Returns the session previously registered for the same peer, which
    /// the caller must close.
    pub async fn insert(&self, session: Arc<PeerSession>) -> Option<Arc<PeerSession>> {
        self.sessions
            .lock()
            .await
            .insert(session.peer_id().to_string(), session)
    }

    pub async fn remove(&self, peer_id: &str) -> Option<Arc<PeerSession>> {
        self.sessions.lock().await.remove(peer_id)
    }

    /// Removes and tears down the session for `peer_id`. Returns whether one existed.
    pub async fn close(&self, peer_id: &str) -> bool {
        let session = self.remove(peer_id).await;
        match session {
            Some(session) => {
                session.close().await;
                true
            }
            None => false,
        }
    }

    /// Tears down every session and returns the affected peer ids.
    pub async fn close_all(&self) -> Vec<String> {
        let drained: Vec<(String, Arc<PeerSession>)> = self.sessions.lock().await.drain().collect();

        let mut peers = Vec::with_capacity(drained.len());
        for (peer_id, session) in drained {
            session.close().await;
            peers.push(peer_id);
        }

        if !peers.is_empty() {
            tracing::info!(count = peers.len(), "Closed all peer sessions");
        }
        peers
    }

    pub async fn len(&self) -> usize {
        self.sessions.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.sessions.lock().await.is_empty()
    }

    pub async fn peer_ids(&self) -> Vec<String> {
        self.sessions.lock().await.keys().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::peer::session::testing::ScriptedFactory;
    use crate::peer::session::{ConnectionState, SessionParams};
    use crate::peer::transport::PeerRole;
    use crate::signaling::SignalHub;

    async fn session(factory: &ScriptedFactory, peer: &str) -> Arc<PeerSession> {
        let params = SessionParams {
            quiz_id: "q".to_string(),
            local_id: "prof".to_string(),
            peer_id: peer.to_string(),
            role: PeerRole::Professor,
        };
        PeerSession::open(params, factory, SignalHub::new(), None)
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_insert_replaces_and_returns_previous() {
        let factory = ScriptedFactory::default();
        let registry = SessionRegistry::new();

        assert!(registry.insert(session(&factory, "a").await).await.is_none());
        let previous = registry.insert(session(&factory, "a").await).await;

        assert!(previous.is_some());
        assert_eq!(registry.len().await, 1);
    }

    #[tokio::test]
    async fn test_close_all_tears_down_sessions() {
        let factory = ScriptedFactory::default();
        let registry = SessionRegistry::new();
        let a = session(&factory, "a").await;
        let b = session(&factory, "b").await;
        registry.insert(a.clone()).await;
        registry.insert(b.clone()).await;

        let mut closed = registry.close_all().await;
        closed.sort();

        assert_eq!(closed, vec!["a".to_string(), "b".to_string()]);
        assert!(registry.is_empty().await);
        assert_eq!(a.state().await, ConnectionState::Closed);
        assert_eq!(b.state().await, ConnectionState::Closed);
    }

    #[tokio::test]
    async fn test_close_unknown_peer_is_noop() {
        let registry = SessionRegistry::new();
        assert!(!registry.close("nobody").await);
    }
}
