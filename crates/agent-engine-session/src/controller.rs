//! Session controller driving the query cycle.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use agent_engine_core::{
    AggregatedResponse, Aggregator, ControllerState, FragmentStream, Presenter, RemoteAgent,
    RemoteError, Session, SessionStore, StoreError, StreamError, Turn, UserId,
};
use futures::StreamExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Session controller error.
#[derive(Debug, thiserror::Error)]
pub enum ControllerError {
    #[error("Remote agent error: {0}")]
    Remote(#[from] RemoteError),
    #[error(transparent)]
    Stream(#[from] StreamError),
    #[error("Storage error: {0}")]
    Storage(#[from] StoreError),
    #[error("Busy: another operation is in flight ({0})")]
    Busy(ControllerState),
    #[error("No active session")]
    NoSession,
    #[error("Session not found: {0}")]
    NotFound(String),
    #[error("Query cancelled")]
    Cancelled,
}

/// Result of a completed query cycle.
#[derive(Debug, Clone)]
pub struct TurnOutcome {
    /// Aggregated reply.
    pub response: AggregatedResponse,
    /// Session record after the assistant turn was committed.
    pub session: Session,
}

struct Inner {
    state: ControllerState,
    current: Option<String>,
}

/// Drives one user's sessions against a remote agent.
///
/// At most one operation is in flight at a time; requests arriving while
/// creating, querying or reconciling are rejected with
/// [`ControllerError::Busy`].
pub struct SessionController<R, S>
where
    R: RemoteAgent,
    S: SessionStore,
{
    remote: R,
    store: S,
    user_id: UserId,
    presenter: Arc<dyn Presenter>,
    inner: Mutex<Inner>,
}

impl<R, S> SessionController<R, S>
where
    R: RemoteAgent,
    S: SessionStore,
{
    /// Create a controller with no active session.
    #[must_use]
    pub fn new(remote: R, store: S, user_id: UserId, presenter: Arc<dyn Presenter>) -> Self {
        Self {
            remote,
            store,
            user_id,
            presenter,
            inner: Mutex::new(Inner {
                state: ControllerState::NoSession,
                current: None,
            }),
        }
    }

    #[must_use]
    pub fn state(&self) -> ControllerState {
        self.lock().state
    }

    #[must_use]
    pub fn current_session_id(&self) -> Option<String> {
        self.lock().current.clone()
    }

    #[must_use]
    pub const fn user_id(&self) -> &UserId {
        &self.user_id
    }

    #[must_use]
    pub const fn remote(&self) -> &R {
        &self.remote
    }

    #[must_use]
    pub const fn store(&self) -> &S {
        &self.store
    }

    /// Local record of the active session.
    ///
    /// # Errors
    /// Returns error if the store fails.
    pub async fn current_session(&self) -> Result<Option<Session>, ControllerError> {
        match self.current_session_id() {
            Some(id) => Ok(self.store.get(&id).await?),
            None => Ok(None),
        }
    }

    /// All sessions known to this controller, oldest first.
    ///
    /// # Errors
    /// Returns error if the store fails.
    pub async fn sessions(&self) -> Result<Vec<Session>, ControllerError> {
        Ok(self.store.list().await?)
    }

    /// Create a new session and make it active.
    ///
    /// On failure the controller returns to its previous state.
    ///
    /// # Errors
    /// Returns error if busy or if the remote or store fails.
    pub async fn new_session(&self) -> Result<Session, ControllerError> {
        let previous = {
            let mut inner = self.lock();
            if inner.state.is_busy() {
                return Err(ControllerError::Busy(inner.state));
            }
            std::mem::replace(&mut inner.state, ControllerState::Creating)
        };
        self.notify(previous, ControllerState::Creating);

        let guard = StateGuard::new(self, previous);
        let session = self.create().await?;
        guard.disarm();

        {
            let mut inner = self.lock();
            inner.current = Some(session.id().to_string());
            inner.state = ControllerState::Active;
        }
        self.notify(ControllerState::Creating, ControllerState::Active);
        Ok(session)
    }

    /// Make an existing session the active one.
    ///
    /// Only allowed while idle on an active session; never contacts the remote.
    ///
    /// # Errors
    /// Returns error if busy, if there is no active session, or if the id is unknown.
    pub async fn switch_session(&self, session_id: &str) -> Result<Session, ControllerError> {
        self.ensure_idle_active()?;
        let session = self
            .store
            .get(session_id)
            .await?
            .ok_or_else(|| ControllerError::NotFound(session_id.to_string()))?;

        {
            let mut inner = self.lock();
            let state = inner.state;
            match state {
                ControllerState::Active => inner.current = Some(session_id.to_string()),
                state if state.is_busy() => return Err(ControllerError::Busy(state)),
                _ => return Err(ControllerError::NoSession),
            }
        }
        info!(session_id, "Switched session");
        Ok(session)
    }

    /// Send a message on the active session, creating one first if needed.
    ///
    /// # Errors
    /// See [`Self::send_message_with_cancel`].
    pub async fn send_message(&self, message: &str) -> Result<TurnOutcome, ControllerError> {
        self.send_message_with_cancel(message, &CancellationToken::new())
            .await
    }

    /// Send a message, aborting the reply when `cancel` fires.
    ///
    /// The user turn is recorded before the query starts. Whatever reply text
    /// arrived is committed as the assistant turn once the stream ends, even if
    /// it ended in an error. Cancelling (or dropping this future) before
    /// reconciliation commits nothing beyond the user turn.
    ///
    /// # Errors
    /// - [`ControllerError::Busy`] if another operation is in flight
    /// - [`ControllerError::Stream`] if the reply was cut short (partial text committed)
    /// - [`ControllerError::Cancelled`] if `cancel` fired mid-stream
    /// - remote or store errors otherwise
    pub async fn send_message_with_cancel(
        &self,
        message: &str,
        cancel: &CancellationToken,
    ) -> Result<TurnOutcome, ControllerError> {
        let (from, to, claimed) = {
            let mut inner = self.lock();
            if inner.state.is_busy() {
                return Err(ControllerError::Busy(inner.state));
            }
            let from = inner.state;
            match inner.current.clone() {
                Some(id) if from == ControllerState::Active => {
                    inner.state = ControllerState::Querying;
                    (from, ControllerState::Querying, Some(id))
                }
                _ => {
                    inner.state = ControllerState::Creating;
                    (from, ControllerState::Creating, None)
                }
            }
        };
        self.notify(from, to);

        let session_id = match claimed {
            Some(id) => id,
            None => {
                let guard = StateGuard::new(self, from);
                let session = self.create().await?;
                guard.disarm();

                let id = session.id().to_string();
                {
                    let mut inner = self.lock();
                    inner.current = Some(id.clone());
                    inner.state = ControllerState::Querying;
                }
                self.notify(ControllerState::Creating, ControllerState::Active);
                self.notify(ControllerState::Active, ControllerState::Querying);
                id
            }
        };

        let guard = StateGuard::new(self, ControllerState::Active);
        self.store
            .append_turn(&session_id, Turn::user(message))
            .await?;

        let opened = tokio::select! {
            biased;
            () = cancel.cancelled() => {
                info!(session_id = %session_id, "Query cancelled before the reply stream opened");
                return Err(ControllerError::Cancelled);
            }
            opened = self.remote.stream_query(&self.user_id, &session_id, message) => opened,
        };
        let streamed = match opened {
            Ok(stream) => match self.drain(stream, cancel).await {
                Ok(response) => Ok(response),
                Err(ControllerError::Stream(e)) => Err(e),
                Err(e) => return Err(e),
            },
            Err(e) => Err(Aggregator::new().fail(e)),
        };

        self.set_state(ControllerState::Reconciling);
        let text = match &streamed {
            Ok(response) => response.text.clone(),
            Err(e) => {
                warn!(session_id = %session_id, error = %e.source, "Reply cut short");
                e.partial.text.clone()
            }
        };

        let reconciled = self.refresh(&session_id).await;
        self.store
            .append_turn(&session_id, Turn::assistant(text.clone()))
            .await?;
        let session = self
            .store
            .get(&session_id)
            .await?
            .ok_or_else(|| ControllerError::NotFound(session_id.clone()))?;

        drop(guard);
        self.presenter.on_turn_complete(&text, &session);

        match (streamed, reconciled) {
            (Err(e), reconciled) => {
                if let Err(reconcile_err) = reconciled {
                    warn!(session_id = %session_id, error = %reconcile_err, "Reconciliation failed after stream error");
                }
                Err(ControllerError::Stream(e))
            }
            (Ok(_), Err(e)) => Err(e),
            (Ok(response), Ok(_)) => Ok(TurnOutcome { response, session }),
        }
    }

    /// Refresh the active session's stored server state from the remote.
    ///
    /// Returns the patch from the previously stored state to the new one;
    /// an empty patch means nothing changed.
    ///
    /// # Errors
    /// Returns error if busy, if there is no active session, or if the remote
    /// or store fails.
    pub async fn reconcile(&self) -> Result<json_patch::Patch, ControllerError> {
        let session_id = {
            let mut inner = self.lock();
            match (inner.state, inner.current.clone()) {
                (ControllerState::Active, Some(id)) => {
                    inner.state = ControllerState::Reconciling;
                    id
                }
                (state, _) if state.is_busy() => return Err(ControllerError::Busy(state)),
                _ => return Err(ControllerError::NoSession),
            }
        };
        self.notify(ControllerState::Active, ControllerState::Reconciling);

        let _guard = StateGuard::new(self, ControllerState::Active);
        self.refresh(&session_id).await
    }

    async fn create(&self) -> Result<Session, ControllerError> {
        let snapshot = self.remote.create_session(&self.user_id).await?;
        info!(session_id = %snapshot.id, user_id = %self.user_id, "Created session");
        let session = Session::new(snapshot, self.user_id.clone());
        self.store.insert(session.clone()).await?;
        Ok(session)
    }

    async fn drain(
        &self,
        mut stream: FragmentStream,
        cancel: &CancellationToken,
    ) -> Result<AggregatedResponse, ControllerError> {
        let mut aggregator = Aggregator::new();
        let presenter = &self.presenter;
        let mut observer = |text: &str| presenter.on_partial_text(text);

        loop {
            tokio::select! {
                biased;
                () = cancel.cancelled() => {
                    info!(received = aggregator.text().len(), "Query cancelled");
                    return Err(ControllerError::Cancelled);
                }
                next = stream.next() => match next {
                    Some(Ok(fragment)) => aggregator.push(fragment, &mut observer),
                    Some(Err(e)) => return Err(aggregator.fail(e).into()),
                    None => return Ok(aggregator.finish()),
                },
            }
        }
    }

    async fn refresh(&self, session_id: &str) -> Result<json_patch::Patch, ControllerError> {
        let snapshot = self.remote.get_session(session_id, &self.user_id).await?;
        if snapshot.id != session_id {
            return Err(RemoteError::Protocol(format!(
                "asked for session {session_id}, got {}",
                snapshot.id
            ))
            .into());
        }

        let previous = self
            .store
            .replace_server_state(session_id, snapshot.state.clone())
            .await?;
        let patch = json_patch::diff(&previous, &snapshot.state);
        debug!(session_id, changes = patch.0.len(), "Reconciled session state");
        self.presenter.on_reconciled(session_id, &patch);
        Ok(patch)
    }

    fn ensure_idle_active(&self) -> Result<(), ControllerError> {
        match self.lock().state {
            ControllerState::Active => Ok(()),
            state if state.is_busy() => Err(ControllerError::Busy(state)),
            _ => Err(ControllerError::NoSession),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn set_state(&self, to: ControllerState) {
        let from = std::mem::replace(&mut self.lock().state, to);
        if from != to {
            self.notify(from, to);
        }
    }

    fn notify(&self, from: ControllerState, to: ControllerState) {
        debug!(%from, %to, "Session controller transition");
        self.presenter.on_state_change(from, to);
    }
}

/// Restores a state when an operation exits early, including when its
/// future is dropped.
struct StateGuard<'a, R, S>
where
    R: RemoteAgent,
    S: SessionStore,
{
    controller: &'a SessionController<R, S>,
    fallback: ControllerState,
    armed: bool,
}

impl<'a, R, S> StateGuard<'a, R, S>
where
    R: RemoteAgent,
    S: SessionStore,
{
    const fn new(controller: &'a SessionController<R, S>, fallback: ControllerState) -> Self {
        Self {
            controller,
            fallback,
            armed: true,
        }
    }

    fn disarm(mut self) {
        self.armed = false;
    }
}

impl<R, S> Drop for StateGuard<'_, R, S>
where
    R: RemoteAgent,
    S: SessionStore,
{
    fn drop(&mut self) {
        if self.armed {
            self.controller.set_state(self.fallback);
        }
    }
}
