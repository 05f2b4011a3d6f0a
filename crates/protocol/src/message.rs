//! Typed action messages and the internal event form.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::address::Address;

// ── Actions ──────────────────────────────────────────────────────────────────

/// The closed set of message tags. Lowercase on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Action {
    Register,
    Accepted,
    Rejected,
    Log,
    Readlog,
    Value,
    Discover,
    Inform,
    Provision,
    Setup,
    Activate,
    Import,
    Export,
    Notify,
    Cmd,
}

impl Action {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Register => "register",
            Self::Accepted => "accepted",
            Self::Rejected => "rejected",
            Self::Log => "log",
            Self::Readlog => "readlog",
            Self::Value => "value",
            Self::Discover => "discover",
            Self::Inform => "inform",
            Self::Provision => "provision",
            Self::Setup => "setup",
            Self::Activate => "activate",
            Self::Import => "import",
            Self::Export => "export",
            Self::Notify => "notify",
            Self::Cmd => "cmd",
        }
    }

    /// Decode a wire tag.
    #[must_use]
    pub fn parse(tag: &str) -> Option<Self> {
        serde_json::from_value(serde_json::Value::String(tag.to_string())).ok()
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ── Message ──────────────────────────────────────────────────────────────────

/// One wire frame. `data` is shaped by `action`; the dispatcher performs the
/// single typed extraction per action.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub sender: Address,
    pub receiver: Address,
    pub action: Action,
    #[serde(default)]
    pub data: serde_json::Value,
}

impl Message {
    #[must_use]
    pub fn new(sender: Address, receiver: Address, action: Action, data: serde_json::Value) -> Self {
        Self {
            sender,
            receiver,
            action,
            data,
        }
    }

    /// An `accepted`/`rejected`-style frame carrying a human-readable status.
    #[must_use]
    pub fn status(sender: Address, receiver: Address, action: Action, text: impl Into<String>) -> Self {
        Self::new(
            sender,
            receiver,
            action,
            serde_json::to_value(StatusPayload {
                message: text.into(),
            })
            .unwrap_or_default(),
        )
    }

    /// The payload as a string, for the actions whose data is one.
    #[must_use]
    pub fn data_str(&self) -> Option<&str> {
        self.data.as_str()
    }
}

/// Status payload of `accepted`/`rejected` frames. The capitalized key is the
/// historical wire format.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusPayload {
    #[serde(rename = "Message")]
    pub message: String,
}

// ── Event ────────────────────────────────────────────────────────────────────

/// Internal routed form: a message stripped of sender/receiver, which are
/// re-attached per subscriber at emit time.
#[derive(Debug, Clone)]
pub struct Event {
    pub action: Action,
    pub data: serde_json::Value,
}

impl Event {
    #[must_use]
    pub fn new(action: Action, data: serde_json::Value) -> Self {
        Self { action, data }
    }

    /// A `notify` event carrying plain text.
    #[must_use]
    pub fn text(text: impl Into<String>) -> Self {
        Self::new(Action::Notify, serde_json::Value::String(text.into()))
    }
}

// ── Setup payload ────────────────────────────────────────────────────────────

/// Payload of a `setup` message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SetupPayload {
    pub api_key: String,
    #[serde(default)]
    pub setup_files: Vec<SetupFile>,
}

/// One provisioned file; `content` is base64-encoded bytes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SetupFile {
    pub path: String,
    pub content: String,
}
