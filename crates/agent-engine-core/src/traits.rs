//! Core traits for the remote agent, session storage and presentation.

use std::sync::Arc;

use async_trait::async_trait;
use futures::stream::BoxStream;
use thiserror::Error;

use crate::{ControllerState, Fragment, Session, SessionSnapshot, Turn, UserId};

/// Lazy sequence of reply fragments.
///
/// Dropping the stream releases the underlying connection.
pub type FragmentStream = BoxStream<'static, Result<Fragment, RemoteError>>;

/// Remote agent error.
#[derive(Debug, Error)]
pub enum RemoteError {
    #[error("Connection error: {0}")]
    Connection(String),
    #[error("Not found: {0}")]
    NotFound(String),
    #[error("Timed out: {0}")]
    Timeout(String),
    #[error("API error (status {status}): {message}")]
    Api { status: u16, message: String },
    #[error("Transport error: {0}")]
    Transport(String),
    #[error("Protocol error: {0}")]
    Protocol(String),
}

/// Handle on one remote agent resource.
///
/// Implementations hold no session state; every call is independent and
/// safe to issue concurrently.
#[async_trait]
pub trait RemoteAgent: Send + Sync {
    /// Create a new server session for a user.
    async fn create_session(&self, user_id: &UserId) -> Result<SessionSnapshot, RemoteError>;

    /// Fetch the authoritative state of a session.
    async fn get_session(
        &self,
        session_id: &str,
        user_id: &UserId,
    ) -> Result<SessionSnapshot, RemoteError>;

    /// Send a message and stream the reply.
    async fn stream_query(
        &self,
        user_id: &UserId,
        session_id: &str,
        message: &str,
    ) -> Result<FragmentStream, RemoteError>;

    /// Human readable agent name.
    fn display_name(&self) -> &str;

    /// Full resource identifier of the agent.
    fn resource_name(&self) -> &str;
}

#[async_trait]
impl<T: RemoteAgent + ?Sized> RemoteAgent for Arc<T> {
    async fn create_session(&self, user_id: &UserId) -> Result<SessionSnapshot, RemoteError> {
        (**self).create_session(user_id).await
    }

    async fn get_session(
        &self,
        session_id: &str,
        user_id: &UserId,
    ) -> Result<SessionSnapshot, RemoteError> {
        (**self).get_session(session_id, user_id).await
    }

    async fn stream_query(
        &self,
        user_id: &UserId,
        session_id: &str,
        message: &str,
    ) -> Result<FragmentStream, RemoteError> {
        (**self).stream_query(user_id, session_id, message).await
    }

    fn display_name(&self) -> &str {
        (**self).display_name()
    }

    fn resource_name(&self) -> &str {
        (**self).resource_name()
    }
}

/// Storage error.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Session not found: {0}")]
    NotFound(String),
    #[error("Session already exists: {0}")]
    Duplicate(String),
    #[error("Storage error: {0}")]
    Internal(String),
}

/// Trait for local session storage backends.
#[async_trait]
pub trait SessionStore: Send + Sync {
    /// Record a newly created session.
    async fn insert(&self, session: Session) -> Result<(), StoreError>;

    /// Get a session by ID.
    async fn get(&self, id: &str) -> Result<Option<Session>, StoreError>;

    /// List sessions in creation order.
    async fn list(&self) -> Result<Vec<Session>, StoreError>;

    /// Append a turn to a session's history.
    async fn append_turn(&self, id: &str, turn: Turn) -> Result<(), StoreError>;

    /// Overwrite the stored server state, returning the previous value.
    async fn replace_server_state(
        &self,
        id: &str,
        state: serde_json::Value,
    ) -> Result<serde_json::Value, StoreError>;
}

/// Receiver of controller output.
///
/// Callbacks run on the task consuming the stream and must not block.
pub trait Presenter: Send + Sync {
    /// Accumulated reply text after each update.
    fn on_partial_text(&self, text: &str);

    /// Reply finished and the session has been reconciled.
    fn on_turn_complete(&self, text: &str, session: &Session);

    /// Controller state transition.
    fn on_state_change(&self, _from: ControllerState, _to: ControllerState) {}

    /// Stored server state was refreshed; `patch` turns the old state into the new one.
    fn on_reconciled(&self, _session_id: &str, _patch: &json_patch::Patch) {}
}

/// Presenter that discards everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullPresenter;

impl Presenter for NullPresenter {
    fn on_partial_text(&self, _text: &str) {}

    fn on_turn_complete(&self, _text: &str, _session: &Session) {}
}
