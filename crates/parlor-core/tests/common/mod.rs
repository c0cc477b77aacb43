//! Shared fixtures for session tests.

#![allow(dead_code)]

use std::{
    future::Future,
    ops::{Add, Sub},
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
    time::Duration,
};

use parlor_core::{
    Environment, Reply, Session, SessionAction, SessionConfig, SessionError, SessionEvent, SessionNotification,
    SessionState,
};
use parlor_proto::{ActionId, InboundEvent, Payload, Props, Request, payloads::MessageBody};
use serde_json::{Value, json};

/// Reordering delay used by every fixture.
pub const REORDER: Duration = Duration::from_millis(200);

/// Virtual instant in milliseconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct VirtualInstant(pub u64);

impl Add<Duration> for VirtualInstant {
    type Output = VirtualInstant;

    fn add(self, rhs: Duration) -> VirtualInstant {
        VirtualInstant(self.0 + u64::try_from(rhs.as_millis()).unwrap())
    }
}

impl Sub for VirtualInstant {
    type Output = Duration;

    fn sub(self, rhs: VirtualInstant) -> Duration {
        Duration::from_millis(self.0.saturating_sub(rhs.0))
    }
}

/// Manually advanced clock.
#[derive(Debug, Clone, Default)]
pub struct TestEnv {
    millis: Arc<AtomicU64>,
}

impl TestEnv {
    pub fn advance(&self, by: Duration) -> VirtualInstant {
        let by = u64::try_from(by.as_millis()).unwrap();
        VirtualInstant(self.millis.fetch_add(by, Ordering::SeqCst) + by)
    }
}

impl Environment for TestEnv {
    type Instant = VirtualInstant;

    fn now(&self) -> VirtualInstant {
        VirtualInstant(self.millis.load(Ordering::SeqCst))
    }

    fn sleep(&self, _duration: Duration) -> impl Future<Output = ()> + Send {
        std::future::ready(())
    }

    fn wall_clock_millis(&self) -> u64 {
        1_700_000_000_000 + self.millis.load(Ordering::SeqCst)
    }
}

pub fn config() -> SessionConfig {
    SessionConfig { user_name: Some("Guest".into()), ..SessionConfig::new("wss://chat.example", "realm-1") }
}

/// Inbound event named `name` with the given properties.
pub fn event(name: &str, props: Value) -> InboundEvent {
    let Value::Object(map) = props else { panic!("props must be an object") };
    InboundEvent::new(Props::from(map).with("event", name), Payload::empty())
}

pub fn text_message(id: &str, sender: &str, text: &str) -> InboundEvent {
    let mut message = event(
        "message_received",
        json!({
            "channel_id": "ch-1",
            "message_id": id,
            "message_type": "ninchat.com/text",
            "message_user_id": sender,
            "message_time": 1_800_000_000.0,
        }),
    );
    message.payload = Payload::json(&MessageBody::text(text)).unwrap();
    message
}

pub fn rtc_message(kind: &str, sender: &str, body: Value) -> InboundEvent {
    let mut message = event(
        "message_received",
        json!({
            "channel_id": "ch-1",
            "message_id": "",
            "message_type": kind,
            "message_user_id": sender,
            "message_time": 1_800_000_000.0,
        }),
    );
    message.payload = Payload::json(&body).unwrap();
    message
}

pub fn completions(actions: &[SessionAction]) -> Vec<(ActionId, Result<Reply, SessionError>)> {
    actions
        .iter()
        .filter_map(|a| match a {
            SessionAction::Complete { request, outcome } => Some((*request, outcome.clone())),
            _ => None,
        })
        .collect()
}

pub fn notifications(actions: &[SessionAction]) -> Vec<SessionNotification> {
    actions
        .iter()
        .filter_map(|a| match a {
            SessionAction::Notify(n) => Some(n.clone()),
            _ => None,
        })
        .collect()
}

pub fn sent(actions: &[SessionAction]) -> Vec<(ActionId, Request)> {
    actions
        .iter()
        .filter_map(|a| match a {
            SessionAction::Send { action_id, request } => Some((*action_id, request.clone())),
            _ => None,
        })
        .collect()
}

/// Session past `session_created`.
pub fn opened() -> (TestEnv, Session<TestEnv>) {
    let env = TestEnv::default();
    let mut session = Session::new(env.clone(), config()).unwrap();
    session.open().unwrap();
    session.take_actions();
    session.handle(SessionEvent::Inbound(event("session_created", json!({"user_id": "guest-1"}))));
    assert_eq!(session.state(), SessionState::Open);
    (env, session)
}

/// Session in channel `ch-1` with agent `agent-1`.
pub fn in_channel() -> (TestEnv, Session<TestEnv>) {
    let (env, mut session) = opened();
    session.join_queue("q-1").unwrap();
    session.take_actions();
    session.handle(SessionEvent::Inbound(event(
        "channel_joined",
        json!({
            "channel_id": "ch-1",
            "channel_members": {
                "agent-1": {"user_attrs": {"realname": "Alice"}},
                "guest-1": {"user_attrs": {"name": "Guest", "guest": true}},
            },
        }),
    )));
    session.tick(env.advance(REORDER));
    assert_eq!(session.state(), SessionState::InChannel);
    (env, session)
}
