//! Session controller behaviour against a scripted remote agent.

use std::{
    collections::VecDeque,
    sync::{
        Arc, Mutex,
        atomic::{AtomicUsize, Ordering},
    },
    time::Duration,
};

use agent_engine_core::{
    ControllerState, FeedEvent, Fragment, FragmentStream, RemoteAgent, RemoteError, Role,
    SessionFeed, SessionSnapshot, Turn, UserId,
};
use agent_engine_session::{ControllerError, SessionController, storage::MemoryStore};
use async_trait::async_trait;
use serde_json::{Value, json};
use tokio::sync::Notify;
use tokio_test::assert_ok;
use tokio_util::sync::CancellationToken;

enum Step {
    Yield(Fragment),
    Fail(RemoteError),
    Wait(Arc<Notify>),
    Hang,
}

struct Released(Arc<AtomicUsize>);

impl Drop for Released {
    fn drop(&mut self) {
        self.0.fetch_add(1, Ordering::SeqCst);
    }
}

#[derive(Default)]
struct ScriptedAgent {
    sessions_created: AtomicUsize,
    create_calls: AtomicUsize,
    get_calls: AtomicUsize,
    streams_released: Arc<AtomicUsize>,
    create_failure: Mutex<Option<RemoteError>>,
    get_failure: Mutex<Option<RemoteError>>,
    open_failure: Mutex<Option<RemoteError>>,
    open_gate: Mutex<Option<Arc<Notify>>>,
    get_gate: Mutex<Option<Arc<Notify>>>,
    replies: Mutex<VecDeque<Vec<Step>>>,
    server_state: Mutex<Value>,
}

impl ScriptedAgent {
    fn reply(&self, steps: Vec<Step>) {
        self.replies.lock().unwrap().push_back(steps);
    }

    fn creates(&self) -> usize {
        self.create_calls.load(Ordering::SeqCst)
    }

    fn gets(&self) -> usize {
        self.get_calls.load(Ordering::SeqCst)
    }

    fn released(&self) -> usize {
        self.streams_released.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl RemoteAgent for ScriptedAgent {
    async fn create_session(&self, user_id: &UserId) -> Result<SessionSnapshot, RemoteError> {
        self.create_calls.fetch_add(1, Ordering::SeqCst);
        if let Some(err) = self.create_failure.lock().unwrap().take() {
            return Err(err);
        }
        let n = self.sessions_created.fetch_add(1, Ordering::SeqCst) + 1;
        SessionSnapshot::from_document(json!({
            "id": format!("s-{n}"),
            "userId": user_id.as_str(),
            "state": {}
        }))
    }

    async fn get_session(
        &self,
        session_id: &str,
        user_id: &UserId,
    ) -> Result<SessionSnapshot, RemoteError> {
        self.get_calls.fetch_add(1, Ordering::SeqCst);
        let gate = self.get_gate.lock().unwrap().clone();
        if let Some(gate) = gate {
            gate.notified().await;
        }
        if let Some(err) = self.get_failure.lock().unwrap().take() {
            return Err(err);
        }
        SessionSnapshot::from_document(json!({
            "id": session_id,
            "userId": user_id.as_str(),
            "state": self.server_state.lock().unwrap().clone()
        }))
    }

    async fn stream_query(
        &self,
        _user_id: &UserId,
        _session_id: &str,
        _message: &str,
    ) -> Result<FragmentStream, RemoteError> {
        let gate = self.open_gate.lock().unwrap().clone();
        if let Some(gate) = gate {
            gate.notified().await;
        }
        if let Some(err) = self.open_failure.lock().unwrap().take() {
            return Err(err);
        }
        let steps = self.replies.lock().unwrap().pop_front().unwrap_or_default();
        let released = Released(Arc::clone(&self.streams_released));
        Ok(Box::pin(async_stream::stream! {
            let _released = released;
            for step in steps {
                match step {
                    Step::Yield(fragment) => yield Ok(fragment),
                    Step::Fail(err) => {
                        yield Err(err);
                        return;
                    }
                    Step::Wait(gate) => gate.notified().await,
                    Step::Hang => futures::future::pending::<()>().await,
                }
            }
        }))
    }

    fn display_name(&self) -> &str {
        "scripted"
    }

    fn resource_name(&self) -> &str {
        "projects/p/locations/us-central1/reasoningEngines/1"
    }
}

type Controller = SessionController<Arc<ScriptedAgent>, MemoryStore>;

fn setup() -> (Arc<ScriptedAgent>, Arc<SessionFeed>, Controller) {
    let agent = Arc::new(ScriptedAgent::default());
    let feed = Arc::new(SessionFeed::new());
    let controller = SessionController::new(
        Arc::clone(&agent),
        MemoryStore::new(),
        UserId::new("u1"),
        feed.clone(),
    );
    (agent, feed, controller)
}

fn text(t: &str) -> Step {
    Step::Yield(Fragment::from_value(json!({"content": {"parts": [{"text": t}]}})))
}

async fn turns(controller: &Controller) -> Vec<Turn> {
    controller
        .current_session()
        .await
        .unwrap()
        .map(|s| s.turns().to_vec())
        .unwrap_or_default()
}

#[tokio::test]
async fn first_message_creates_session_and_commits_reply() {
    let (agent, feed, controller) = setup();
    agent.reply(vec![text("Ticker "), text("GOOGL")]);

    assert_eq!(controller.state(), ControllerState::NoSession);
    let outcome = assert_ok!(controller.send_message("GOOGL").await);

    assert_eq!(outcome.response.text, "Ticker GOOGL");
    assert!(outcome.response.complete);
    assert_eq!(
        outcome.session.turns(),
        &[Turn::user("GOOGL"), Turn::assistant("Ticker GOOGL")]
    );
    assert_eq!(agent.creates(), 1);
    assert_eq!(agent.gets(), 1);
    assert_eq!(controller.state(), ControllerState::Active);
    assert_eq!(controller.current_session_id().as_deref(), Some("s-1"));

    use ControllerState::{Active, Creating, NoSession, Querying, Reconciling};
    assert_eq!(
        feed.transitions(),
        vec![
            (NoSession, Creating),
            (Creating, Active),
            (Active, Querying),
            (Querying, Reconciling),
            (Reconciling, Active),
        ]
    );

    let partials: Vec<String> = feed
        .history()
        .into_iter()
        .filter_map(|event| match event {
            FeedEvent::PartialText { text } => Some(text),
            _ => None,
        })
        .collect();
    assert_eq!(partials, vec!["Ticker ", "Ticker GOOGL"]);
    assert!(feed.history().contains(&FeedEvent::TurnComplete {
        text: "Ticker GOOGL".to_string(),
        session_id: "s-1".to_string(),
    }));
}

#[tokio::test]
async fn mid_stream_failure_commits_partial_reply() {
    let (agent, _feed, controller) = setup();
    agent.reply(vec![
        text("A"),
        Step::Yield(Fragment::RawText("B".to_string())),
        Step::Fail(RemoteError::Transport("connection reset".to_string())),
    ]);

    let err = controller.send_message("hello").await.unwrap_err();
    let ControllerError::Stream(stream_err) = err else {
        panic!("expected stream error, got {err:?}");
    };
    assert_eq!(stream_err.partial.text, "AB");
    assert!(matches!(stream_err.source, RemoteError::Transport(_)));

    assert_eq!(
        turns(&controller).await,
        vec![Turn::user("hello"), Turn::assistant("AB")]
    );
    assert_eq!(agent.gets(), 1);
    assert_eq!(agent.released(), 1);
    assert_eq!(controller.state(), ControllerState::Active);
}

#[tokio::test]
async fn second_query_while_streaming_is_rejected() {
    let (agent, _feed, controller) = setup();
    let gate = Arc::new(Notify::new());
    agent.reply(vec![text("a"), Step::Wait(Arc::clone(&gate)), text("b")]);

    let (first, second) = tokio::join!(controller.send_message("first"), async {
        let result = controller.send_message("second").await;
        gate.notify_one();
        result
    });

    assert!(matches!(
        second,
        Err(ControllerError::Busy(ControllerState::Querying))
    ));
    let outcome = assert_ok!(first);
    assert_eq!(outcome.response.text, "ab");
    assert_eq!(
        turns(&controller).await,
        vec![Turn::user("first"), Turn::assistant("ab")]
    );
}

#[tokio::test]
async fn stream_that_never_opens_commits_empty_reply() {
    let (agent, _feed, controller) = setup();
    *agent.open_failure.lock().unwrap() = Some(RemoteError::NotFound("engine".to_string()));

    let err = controller.send_message("hello").await.unwrap_err();
    let ControllerError::Stream(stream_err) = err else {
        panic!("expected stream error, got {err:?}");
    };
    assert!(matches!(stream_err.source, RemoteError::NotFound(_)));
    assert_eq!(stream_err.partial.text, "");

    assert_eq!(agent.gets(), 1);
    assert_eq!(
        turns(&controller).await,
        vec![Turn::user("hello"), Turn::assistant("")]
    );
    assert_eq!(controller.state(), ControllerState::Active);
}

#[tokio::test]
async fn requests_during_reconciliation_are_rejected() {
    let (agent, _feed, controller) = setup();
    assert_ok!(controller.new_session().await);
    agent.reply(vec![text("ok")]);
    let gate = Arc::new(Notify::new());
    *agent.get_gate.lock().unwrap() = Some(Arc::clone(&gate));

    let (first, (second, refresh)) = tokio::join!(controller.send_message("first"), async {
        while controller.state() != ControllerState::Reconciling {
            tokio::task::yield_now().await;
        }
        let second = controller.send_message("second").await;
        let refresh = controller.reconcile().await;
        gate.notify_one();
        (second, refresh)
    });

    assert!(matches!(
        second,
        Err(ControllerError::Busy(ControllerState::Reconciling))
    ));
    assert!(matches!(
        refresh,
        Err(ControllerError::Busy(ControllerState::Reconciling))
    ));
    assert_ok!(first);
    assert_eq!(
        turns(&controller).await,
        vec![Turn::user("first"), Turn::assistant("ok")]
    );
}

#[tokio::test]
async fn turns_alternate_across_cycles() {
    let (agent, _feed, controller) = setup();
    agent.reply(vec![text("one")]);
    agent.reply(vec![Step::Fail(RemoteError::Timeout("deadline".to_string()))]);
    agent.reply(vec![text("three")]);

    assert_ok!(controller.send_message("1").await);
    assert!(controller.send_message("2").await.is_err());
    assert_ok!(controller.send_message("3").await);

    let roles: Vec<Role> = turns(&controller).await.iter().map(|t| t.role).collect();
    assert_eq!(
        roles,
        vec![
            Role::User,
            Role::Assistant,
            Role::User,
            Role::Assistant,
            Role::User,
            Role::Assistant,
        ]
    );
    assert_eq!(agent.creates(), 1);
}

#[tokio::test]
async fn cancellation_keeps_only_the_user_turn() {
    let (agent, _feed, controller) = setup();
    agent.reply(vec![text("partial"), Step::Hang]);
    let cancel = CancellationToken::new();

    let (result, ()) = tokio::join!(controller.send_message_with_cancel("hi", &cancel), async {
        cancel.cancel();
    });

    assert!(matches!(result, Err(ControllerError::Cancelled)));
    assert_eq!(turns(&controller).await, vec![Turn::user("hi")]);
    assert_eq!(controller.state(), ControllerState::Active);
    assert_eq!(agent.gets(), 0);
    assert_eq!(agent.released(), 1);
}

#[tokio::test]
async fn cancellation_while_the_stream_opens() {
    let (agent, _feed, controller) = setup();
    assert_ok!(controller.new_session().await);
    *agent.open_gate.lock().unwrap() = Some(Arc::new(Notify::new()));
    let cancel = CancellationToken::new();

    let (result, ()) = tokio::join!(controller.send_message_with_cancel("hi", &cancel), async {
        cancel.cancel();
    });

    assert!(matches!(result, Err(ControllerError::Cancelled)));
    assert_eq!(turns(&controller).await, vec![Turn::user("hi")]);
    assert_eq!(controller.state(), ControllerState::Active);
    assert_eq!(agent.gets(), 0);
}

#[tokio::test]
async fn dropping_the_query_future_restores_active() {
    let (agent, _feed, controller) = setup();
    agent.reply(vec![Step::Hang]);

    let timed_out =
        tokio::time::timeout(Duration::from_millis(50), controller.send_message("hi")).await;

    assert!(timed_out.is_err());
    assert_eq!(controller.state(), ControllerState::Active);
    assert_eq!(turns(&controller).await, vec![Turn::user("hi")]);
    assert_eq!(agent.released(), 1);

    agent.reply(vec![text("again")]);
    let outcome = assert_ok!(controller.send_message("retry").await);
    assert_eq!(outcome.response.text, "again");
}

#[tokio::test]
async fn failed_creation_returns_to_no_session() {
    let (agent, feed, controller) = setup();
    *agent.create_failure.lock().unwrap() = Some(RemoteError::Connection("refused".to_string()));

    let err = controller.send_message("hi").await.unwrap_err();

    assert!(matches!(
        err,
        ControllerError::Remote(RemoteError::Connection(_))
    ));
    assert_eq!(controller.state(), ControllerState::NoSession);
    assert_eq!(controller.current_session_id(), None);
    assert!(controller.sessions().await.unwrap().is_empty());
    assert_eq!(
        feed.transitions(),
        vec![
            (ControllerState::NoSession, ControllerState::Creating),
            (ControllerState::Creating, ControllerState::NoSession),
        ]
    );
}

#[tokio::test]
async fn new_session_failure_keeps_the_current_one() {
    let (agent, _feed, controller) = setup();
    assert_ok!(controller.new_session().await);
    *agent.create_failure.lock().unwrap() = Some(RemoteError::NotFound("engine".to_string()));

    let err = controller.new_session().await.unwrap_err();

    assert!(matches!(err, ControllerError::Remote(RemoteError::NotFound(_))));
    assert_eq!(controller.state(), ControllerState::Active);
    assert_eq!(controller.current_session_id().as_deref(), Some("s-1"));
}

#[tokio::test]
async fn switching_sessions_is_local() {
    let (agent, _feed, controller) = setup();
    agent.reply(vec![text("first reply")]);
    assert_ok!(controller.send_message("first").await);

    let second = assert_ok!(controller.new_session().await);
    assert_eq!(second.id(), "s-2");
    assert_eq!(controller.current_session_id().as_deref(), Some("s-2"));
    assert!(turns(&controller).await.is_empty());

    let (creates, gets) = (agent.creates(), agent.gets());
    let switched = assert_ok!(controller.switch_session("s-1").await);
    assert_eq!(switched.turns().len(), 2);
    assert_eq!(controller.current_session_id().as_deref(), Some("s-1"));
    assert_eq!((agent.creates(), agent.gets()), (creates, gets));

    let ids: Vec<String> = controller
        .sessions()
        .await
        .unwrap()
        .iter()
        .map(|s| s.id().to_string())
        .collect();
    assert_eq!(ids, vec!["s-1", "s-2"]);

    assert!(matches!(
        controller.switch_session("s-9").await,
        Err(ControllerError::NotFound(_))
    ));
    assert_eq!(controller.current_session_id().as_deref(), Some("s-1"));
}

#[tokio::test]
async fn switching_needs_an_active_session() {
    let (_agent, _feed, controller) = setup();
    assert!(matches!(
        controller.switch_session("s-1").await,
        Err(ControllerError::NoSession)
    ));
}

#[tokio::test]
async fn repeated_reconciliation_converges() {
    let (agent, feed, controller) = setup();
    agent.reply(vec![text("ok")]);
    assert_ok!(controller.send_message("hi").await);

    *agent.server_state.lock().unwrap() = json!({"ticker": "GOOGL"});

    let first = assert_ok!(controller.reconcile().await);
    assert!(!first.0.is_empty());
    let stored_once = controller.current_session().await.unwrap().unwrap();

    let second = assert_ok!(controller.reconcile().await);
    assert!(second.0.is_empty());
    let stored_twice = controller.current_session().await.unwrap().unwrap();

    assert_eq!(stored_once.server_state(), stored_twice.server_state());
    assert_eq!(stored_twice.server_state()["state"]["ticker"], "GOOGL");
    assert_eq!(controller.state(), ControllerState::Active);

    let reconciled = feed
        .history()
        .into_iter()
        .filter(|event| matches!(event, FeedEvent::Reconciled { .. }))
        .count();
    assert_eq!(reconciled, 3);
}

#[tokio::test]
async fn reconcile_needs_an_active_session() {
    let (_agent, _feed, controller) = setup();
    assert!(matches!(
        controller.reconcile().await,
        Err(ControllerError::NoSession)
    ));
}

#[tokio::test]
async fn failed_reconciliation_still_commits_reply() {
    let (agent, _feed, controller) = setup();
    agent.reply(vec![text("done")]);
    *agent.get_failure.lock().unwrap() = Some(RemoteError::Connection("down".to_string()));

    let err = controller.send_message("hi").await.unwrap_err();

    assert!(matches!(
        err,
        ControllerError::Remote(RemoteError::Connection(_))
    ));
    assert_eq!(
        turns(&controller).await,
        vec![Turn::user("hi"), Turn::assistant("done")]
    );
    assert_eq!(controller.state(), ControllerState::Active);
}

#[tokio::test]
async fn controllers_share_one_remote_handle() {
    let agent = Arc::new(ScriptedAgent::default());
    agent.reply(vec![text("to alice")]);
    agent.reply(vec![text("to bob")]);

    let alice = SessionController::new(
        Arc::clone(&agent),
        MemoryStore::new(),
        UserId::new("alice"),
        Arc::new(SessionFeed::new()),
    );
    let bob = SessionController::new(
        Arc::clone(&agent),
        MemoryStore::new(),
        UserId::new("bob"),
        Arc::new(SessionFeed::new()),
    );

    let a = assert_ok!(alice.send_message("a").await);
    let b = assert_ok!(bob.send_message("b").await);

    assert_ne!(a.session.id(), b.session.id());
    assert_eq!(a.session.user_id().as_str(), "alice");
    assert_eq!(b.session.user_id().as_str(), "bob");
    assert_eq!(agent.creates(), 2);
}
