//! Local session model.

use std::{
    fmt,
    time::{SystemTime, UNIX_EPOCH},
};

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::{UserId, traits::RemoteError};

/// Author of a turn.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    User,
    Assistant,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::User => f.write_str("user"),
            Self::Assistant => f.write_str("assistant"),
        }
    }
}

/// One message in a session's conversation history.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Turn {
    pub role: Role,
    pub text: String,
}

impl Turn {
    #[must_use]
    pub fn user(text: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            text: text.into(),
        }
    }

    #[must_use]
    pub fn assistant(text: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            text: text.into(),
        }
    }
}

/// Server-side view of a session as returned by the remote agent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionSnapshot {
    /// Server-assigned session identifier.
    pub id: String,
    /// Full server session document.
    pub state: Value,
}

impl SessionSnapshot {
    /// Build a snapshot from a server session document.
    ///
    /// # Errors
    /// Returns [`RemoteError::Protocol`] if the document has no string `id`.
    pub fn from_document(document: Value) -> Result<Self, RemoteError> {
        let id = document
            .get("id")
            .and_then(Value::as_str)
            .ok_or_else(|| RemoteError::Protocol("session document has no `id`".to_string()))?
            .to_string();
        Ok(Self {
            id,
            state: document,
        })
    }
}

/// Locally tracked session.
///
/// The identifier is fixed at construction and turns can only be appended.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    id: String,
    user_id: UserId,
    turns: Vec<Turn>,
    server_state: Value,
    created_at: i64,
    updated_at: i64,
}

impl Session {
    /// Create a local record for a freshly created server session.
    #[must_use]
    pub fn new(snapshot: SessionSnapshot, user_id: UserId) -> Self {
        let timestamp = now();
        Self {
            id: snapshot.id,
            user_id,
            turns: Vec::new(),
            server_state: snapshot.state,
            created_at: timestamp,
            updated_at: timestamp,
        }
    }

    #[must_use]
    pub fn id(&self) -> &str {
        &self.id
    }

    #[must_use]
    pub const fn user_id(&self) -> &UserId {
        &self.user_id
    }

    #[must_use]
    pub fn turns(&self) -> &[Turn] {
        &self.turns
    }

    /// Last server state synced into this record.
    #[must_use]
    pub const fn server_state(&self) -> &Value {
        &self.server_state
    }

    #[must_use]
    pub const fn created_at(&self) -> i64 {
        self.created_at
    }

    #[must_use]
    pub const fn updated_at(&self) -> i64 {
        self.updated_at
    }

    /// Append a turn to the history.
    pub fn push_turn(&mut self, turn: Turn) {
        self.turns.push(turn);
        self.updated_at = now();
    }

    /// Overwrite the stored server state, returning the previous one.
    pub fn replace_server_state(&mut self, state: Value) -> Value {
        self.updated_at = now();
        std::mem::replace(&mut self.server_state, state)
    }
}

/// Session controller state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ControllerState {
    /// No session has been created or selected yet.
    NoSession,
    /// A session is being created on the remote.
    Creating,
    /// A session is selected and ready for a message.
    Active,
    /// A reply is streaming in.
    Querying,
    /// Fetching the authoritative session after a reply.
    Reconciling,
}

impl ControllerState {
    /// Whether an operation is in flight.
    #[must_use]
    pub const fn is_busy(self) -> bool {
        matches!(self, Self::Creating | Self::Querying | Self::Reconciling)
    }
}

impl fmt::Display for ControllerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::NoSession => "no_session",
            Self::Creating => "creating",
            Self::Active => "active",
            Self::Querying => "querying",
            Self::Reconciling => "reconciling",
        };
        f.write_str(name)
    }
}

fn now() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| i64::try_from(d.as_secs()).unwrap_or(i64::MAX))
        .unwrap_or(0)
}
