//! Broadcast + history presenter for controller output.

use std::{
    collections::VecDeque,
    sync::{PoisonError, RwLock},
};

use futures::{StreamExt, future};
use serde::Serialize;
use tokio::sync::broadcast;
use tokio_stream::wrappers::BroadcastStream;

use crate::{ControllerState, Session, traits::Presenter};

/// Default history size limit (8 MB).
const HISTORY_BYTES: usize = 8 * 1024 * 1024;

/// Event published by [`SessionFeed`].
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum FeedEvent {
    /// Controller moved between states.
    StateChanged {
        from: ControllerState,
        to: ControllerState,
    },
    /// Accumulated reply text so far.
    PartialText { text: String },
    /// Stored server state was refreshed.
    Reconciled {
        session_id: String,
        patch: json_patch::Patch,
    },
    /// Reply committed to the session.
    TurnComplete { text: String, session_id: String },
}

impl FeedEvent {
    fn approx_bytes(&self) -> usize {
        const OVERHEAD: usize = 16;
        match self {
            Self::StateChanged { .. } => OVERHEAD,
            Self::PartialText { text } => OVERHEAD + text.len(),
            Self::Reconciled { session_id, patch } => {
                OVERHEAD + session_id.len() + patch.0.len() * OVERHEAD
            }
            Self::TurnComplete { text, session_id } => OVERHEAD + text.len() + session_id.len(),
        }
    }
}

struct StoredEvent {
    event: FeedEvent,
    bytes: usize,
}

struct Inner {
    history: VecDeque<StoredEvent>,
    total_bytes: usize,
}

/// Presenter that fans controller output out to subscribers.
///
/// Live subscribers get every event as it is published; a bounded history is
/// retained for later inspection.
pub struct SessionFeed {
    inner: RwLock<Inner>,
    sender: broadcast::Sender<FeedEvent>,
}

impl Default for SessionFeed {
    fn default() -> Self {
        Self::new()
    }
}

impl SessionFeed {
    /// Create a new feed.
    #[must_use]
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(1024);
        Self {
            inner: RwLock::new(Inner {
                history: VecDeque::with_capacity(32),
                total_bytes: 0,
            }),
            sender,
        }
    }

    /// Publish an event to live subscribers and history.
    pub fn push(&self, event: FeedEvent) {
        let _ = self.sender.send(event.clone());
        let bytes = event.approx_bytes();

        let mut inner = self.inner.write().unwrap_or_else(PoisonError::into_inner);
        while inner.total_bytes.saturating_add(bytes) > HISTORY_BYTES {
            let Some(front) = inner.history.pop_front() else {
                break;
            };
            inner.total_bytes = inner.total_bytes.saturating_sub(front.bytes);
        }
        inner.history.push_back(StoredEvent { event, bytes });
        inner.total_bytes = inner.total_bytes.saturating_add(bytes);
    }

    /// Get a receiver for live updates.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<FeedEvent> {
        self.sender.subscribe()
    }

    /// Snapshot of the retained history.
    #[must_use]
    pub fn history(&self) -> Vec<FeedEvent> {
        self.inner
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .history
            .iter()
            .map(|stored| stored.event.clone())
            .collect()
    }

    /// State transitions in the retained history.
    #[must_use]
    pub fn transitions(&self) -> Vec<(ControllerState, ControllerState)> {
        self.history()
            .into_iter()
            .filter_map(|event| match event {
                FeedEvent::StateChanged { from, to } => Some((from, to)),
                _ => None,
            })
            .collect()
    }

    /// Accumulated reply texts up to the next completed turn.
    #[must_use]
    pub fn reply_stream(&self) -> futures::stream::BoxStream<'static, String> {
        let rx = self.subscribe();
        BroadcastStream::new(rx)
            .filter_map(|res| future::ready(res.ok()))
            .take_while(|event| future::ready(!matches!(event, FeedEvent::TurnComplete { .. })))
            .filter_map(|event| async move {
                match event {
                    FeedEvent::PartialText { text } => Some(text),
                    _ => None,
                }
            })
            .boxed()
    }
}

impl Presenter for SessionFeed {
    fn on_partial_text(&self, text: &str) {
        self.push(FeedEvent::PartialText {
            text: text.to_string(),
        });
    }

    fn on_turn_complete(&self, text: &str, session: &Session) {
        self.push(FeedEvent::TurnComplete {
            text: text.to_string(),
            session_id: session.id().to_string(),
        });
    }

    fn on_state_change(&self, from: ControllerState, to: ControllerState) {
        self.push(FeedEvent::StateChanged { from, to });
    }

    fn on_reconciled(&self, session_id: &str, patch: &json_patch::Patch) {
        self.push(FeedEvent::Reconciled {
            session_id: session_id.to_string(),
            patch: patch.clone(),
        });
    }
}
