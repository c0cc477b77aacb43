//! Session configuration.
//!
//! Plain data with defaults. Hosts build it in code or deserialize it from
//! whatever format they keep settings in; durations are given in
//! milliseconds.

use std::{collections::HashMap, time::Duration};

use parlor_proto::Props;
use serde::{Deserialize, Deserializer};

use crate::error::SessionError;

/// Product token used in the user agent.
pub const USER_AGENT_PRODUCT: &str = "parlor-sdk";

/// Upper bound (exclusive) on the reordering delay; buffered events must be
/// released within a sub-second window.
pub const MAX_REORDER_DELAY: Duration = Duration::from_secs(1);

/// Configuration for one chat session.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Backend address.
    pub server_address: String,
    /// Site configuration key.
    pub config_key: String,
    /// Site secret, if the site requires one.
    pub site_secret: Option<String>,
    /// Realm whose queues the guest may join.
    pub realm_id: String,
    /// Guest display name.
    pub user_name: Option<String>,
    /// Pre-chat metadata sent with every queue request.
    pub audience_metadata: Option<Props>,
    /// Queues offered to the guest, in display order; all realm queues when
    /// unset.
    pub audience_queues: Option<Vec<String>>,
    /// Host application details appended to the user agent.
    pub app_details: Option<String>,
    /// Translation table for locally generated texts.
    pub translations: HashMap<String, String>,
    /// How long the reordering buffer holds events before release.
    #[serde(deserialize_with = "millis")]
    pub reorder_delay: Duration,
    /// Per-request reply timeout; `None` waits until the session closes.
    #[serde(deserialize_with = "optional_millis")]
    pub request_timeout: Option<Duration>,
    /// Bound on transport connection and session creation.
    #[serde(deserialize_with = "millis")]
    pub connect_timeout: Duration,
    /// How long a close waits for the server before forcing it.
    #[serde(deserialize_with = "millis")]
    pub close_timeout: Duration,
    /// Time-to-live of WebRTC signaling messages, in seconds.
    pub rtc_message_ttl: u32,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            server_address: String::new(),
            config_key: String::new(),
            site_secret: None,
            realm_id: String::new(),
            user_name: None,
            audience_metadata: None,
            audience_queues: None,
            app_details: None,
            translations: HashMap::new(),
            reorder_delay: Duration::from_millis(200),
            request_timeout: Some(Duration::from_secs(30)),
            connect_timeout: Duration::from_secs(30),
            close_timeout: Duration::from_secs(5),
            rtc_message_ttl: 10,
        }
    }
}

impl SessionConfig {
    /// Config for the given server and realm, everything else defaulted.
    pub fn new(server_address: impl Into<String>, realm_id: impl Into<String>) -> Self {
        Self { server_address: server_address.into(), realm_id: realm_id.into(), ..Self::default() }
    }

    /// Reject configurations the session cannot run with.
    pub fn validate(&self) -> Result<(), SessionError> {
        if self.server_address.trim().is_empty() {
            return Err(SessionError::InvalidConfig("server address is empty".into()));
        }
        if self.realm_id.trim().is_empty() {
            return Err(SessionError::InvalidConfig("realm id is empty".into()));
        }
        if self.connect_timeout.is_zero() {
            return Err(SessionError::InvalidConfig("connect timeout must be non-zero".into()));
        }
        if self.reorder_delay >= MAX_REORDER_DELAY {
            return Err(SessionError::InvalidConfig(format!(
                "reorder delay {:?} must be below {MAX_REORDER_DELAY:?}",
                self.reorder_delay
            )));
        }
        Ok(())
    }

    /// User agent sent when connecting.
    pub fn user_agent(&self) -> String {
        let base = format!("{USER_AGENT_PRODUCT}/{}", env!("CARGO_PKG_VERSION"));
        match self.app_details.as_deref().map(str::trim) {
            Some(details) if !details.is_empty() => format!("{base} {details}"),
            _ => base,
        }
    }

    /// Look up `key` in the translation table and substitute `{{name}}`
    /// placeholders
    ///
    /// Untranslated keys are used verbatim.
    pub fn translate(&self, key: &str, vars: &[(&str, &str)]) -> String {
        let mut text = self.translations.get(key).map_or_else(|| key.to_owned(), Clone::clone);
        for (name, value) in vars {
            text = text.replace(&format!("{{{{{name}}}}}"), value);
        }
        text
    }
}

fn millis<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
    u64::deserialize(deserializer).map(Duration::from_millis)
}

fn optional_millis<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<Duration>, D::Error> {
    Option::<u64>::deserialize(deserializer).map(|ms| ms.map(Duration::from_millis))
}
