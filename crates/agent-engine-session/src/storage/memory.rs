//! In-memory session storage.

use std::{collections::HashMap, sync::RwLock};

use agent_engine_core::{Session, SessionStore, StoreError, Turn};
use async_trait::async_trait;
use serde_json::Value;

struct Inner {
    sessions: HashMap<String, Session>,
    /// Session ids in creation order.
    order: Vec<String>,
}

/// In-memory storage implementation.
///
/// Holds sessions for the lifetime of the client process.
pub struct MemoryStore {
    inner: RwLock<Inner>,
}

impl MemoryStore {
    /// Create a new in-memory store.
    #[must_use]
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(Inner {
                sessions: HashMap::new(),
                order: Vec::new(),
            }),
        }
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

fn poisoned<T>(e: std::sync::PoisonError<T>) -> StoreError {
    StoreError::Internal(e.to_string())
}

#[async_trait]
impl SessionStore for MemoryStore {
    async fn insert(&self, session: Session) -> Result<(), StoreError> {
        let mut inner = self.inner.write().map_err(poisoned)?;
        if inner.sessions.contains_key(session.id()) {
            return Err(StoreError::Duplicate(session.id().to_string()));
        }
        inner.order.push(session.id().to_string());
        inner.sessions.insert(session.id().to_string(), session);
        Ok(())
    }

    async fn get(&self, id: &str) -> Result<Option<Session>, StoreError> {
        Ok(self.inner.read().map_err(poisoned)?.sessions.get(id).cloned())
    }

    async fn list(&self) -> Result<Vec<Session>, StoreError> {
        let inner = self.inner.read().map_err(poisoned)?;
        Ok(inner
            .order
            .iter()
            .filter_map(|id| inner.sessions.get(id).cloned())
            .collect())
    }

    async fn append_turn(&self, id: &str, turn: Turn) -> Result<(), StoreError> {
        let mut inner = self.inner.write().map_err(poisoned)?;
        let session = inner
            .sessions
            .get_mut(id)
            .ok_or_else(|| StoreError::NotFound(id.to_string()))?;
        session.push_turn(turn);
        Ok(())
    }

    async fn replace_server_state(&self, id: &str, state: Value) -> Result<Value, StoreError> {
        let mut inner = self.inner.write().map_err(poisoned)?;
        let session = inner
            .sessions
            .get_mut(id)
            .ok_or_else(|| StoreError::NotFound(id.to_string()))?;
        Ok(session.replace_server_state(state))
    }
}

#[cfg(test)]
mod tests {
    use agent_engine_core::{SessionSnapshot, UserId};
    use serde_json::json;

    use super::*;

    fn session(id: &str) -> Session {
        Session::new(
            SessionSnapshot {
                id: id.to_string(),
                state: json!({"id": id}),
            },
            UserId::new("u1"),
        )
    }

    #[tokio::test]
    async fn list_keeps_creation_order() {
        let store = MemoryStore::new();
        for id in ["b", "a", "c"] {
            store.insert(session(id)).await.unwrap();
        }
        let ids: Vec<String> = store
            .list()
            .await
            .unwrap()
            .iter()
            .map(|s| s.id().to_string())
            .collect();
        assert_eq!(ids, vec!["b", "a", "c"]);
    }

    #[tokio::test]
    async fn duplicate_ids_are_rejected() {
        let store = MemoryStore::new();
        store.insert(session("a")).await.unwrap();
        assert!(matches!(
            store.insert(session("a")).await,
            Err(StoreError::Duplicate(_))
        ));
    }

    #[tokio::test]
    async fn mutations_require_a_known_session() {
        let store = MemoryStore::new();
        assert!(matches!(
            store.append_turn("nope", Turn::user("hi")).await,
            Err(StoreError::NotFound(_))
        ));
        assert!(matches!(
            store.replace_server_state("nope", json!({})).await,
            Err(StoreError::NotFound(_))
        ));
        assert!(store.get("nope").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn replace_server_state_returns_previous() {
        let store = MemoryStore::new();
        store.insert(session("a")).await.unwrap();
        store.append_turn("a", Turn::user("hi")).await.unwrap();

        let previous = store
            .replace_server_state("a", json!({"id": "a", "v": 2}))
            .await
            .unwrap();
        assert_eq!(previous, json!({"id": "a"}));

        let stored = store.get("a").await.unwrap().unwrap();
        assert_eq!(stored.server_state()["v"], 2);
        assert_eq!(stored.turns(), &[Turn::user("hi")]);
    }
}
