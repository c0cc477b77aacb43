//! WebRTC signaling bodies and ICE server lists.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::props::Props;

/// Payload of an `ninchat.com/rtc/*` message
///
/// The dictionaries are opaque to this crate; they are produced and consumed
/// by the media engine.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RtcSignal {
    /// Session description (offer/answer).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sdp: Option<Map<String, Value>>,
    /// ICE candidate.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub candidate: Option<Map<String, Value>>,
    /// Pick-up answer; `false` rejects the call.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub answer: Option<bool>,
}

impl RtcSignal {
    /// Signal carrying a session description.
    pub fn description(sdp: Map<String, Value>) -> Self {
        Self { sdp: Some(sdp), ..Self::default() }
    }

    /// Signal carrying an ICE candidate.
    pub fn candidate(candidate: Map<String, Value>) -> Self {
        Self { candidate: Some(candidate), ..Self::default() }
    }

    /// Pick-up signal.
    pub fn pick_up(answer: bool) -> Self {
        Self { answer: Some(answer), ..Self::default() }
    }
}

/// One STUN or TURN server entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IceServer {
    /// Server URL.
    pub url: String,
    /// TURN username.
    pub username: Option<String>,
    /// TURN credential.
    pub credential: Option<String>,
}

/// Servers granted by an `ice_begun` event.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IceServers {
    /// STUN servers.
    pub stun: Vec<IceServer>,
    /// TURN servers.
    pub turn: Vec<IceServer>,
}

impl IceServers {
    /// Parse `stun_servers` and `turn_servers` from event properties
    ///
    /// Every entry lists one or more URLs; the result holds one entry per URL.
    /// Missing lists parse as empty.
    pub fn from_props(props: &Props) -> Self {
        Self { stun: servers(props.get("stun_servers")), turn: servers(props.get("turn_servers")) }
    }

    /// Whether no server was granted.
    pub fn is_empty(&self) -> bool {
        self.stun.is_empty() && self.turn.is_empty()
    }
}

fn servers(list: Option<&Value>) -> Vec<IceServer> {
    let Some(Value::Array(entries)) = list else {
        return Vec::new();
    };
    let mut out = Vec::new();
    for entry in entries {
        let Value::Object(entry) = entry else { continue };
        let field = |key: &str| entry.get(key).and_then(Value::as_str).map(str::to_owned);
        let username = field("username");
        let credential = field("credential");
        let urls = entry.get("urls").and_then(Value::as_array).map(Vec::as_slice).unwrap_or_default();
        out.extend(urls.iter().filter_map(Value::as_str).map(|url| IceServer {
            url: url.to_owned(),
            username: username.clone(),
            credential: credential.clone(),
        }));
    }
    out
}
