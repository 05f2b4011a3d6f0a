//! Five-component wildcard-capable client addresses.
//!
//! The canonical string form is `domain.type.host.address.id`. Any component
//! may be the literal `*`, meaning "matches any"; the type component has its
//! own wildcard variant [`EntityKind::Any`].

use std::{fmt, str::FromStr};

use {
    serde::{Deserialize, Deserializer, Serialize, Serializer},
    thiserror::Error,
};

/// The literal wildcard component.
pub const WILDCARD: &str = "*";

const COMPONENT_COUNT: usize = 5;

#[derive(Debug, Error)]
pub enum AddressError {
    #[error("address `{0}` has more than five components")]
    TooManyComponents(String),
}

// ── Entity kind ──────────────────────────────────────────────────────────────

/// The type component of an [`Address`].
///
/// `Any` is the type-level wildcard; unknown tags decode to `Any` so that a
/// newer peer never hard-fails an older hub.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum EntityKind {
    #[default]
    Any,
    Endpoint,
    Iot,
    Browser,
    Cli,
    Server,
    Telegram,
}

impl EntityKind {
    /// Decode a wire tag. Empty, `*`, and unknown tags all map to `Any`.
    #[must_use]
    pub fn parse(tag: &str) -> Self {
        match tag {
            "endpoint" => Self::Endpoint,
            "iot" => Self::Iot,
            "browser" => Self::Browser,
            "cli" => Self::Cli,
            "server" => Self::Server,
            "telegram" => Self::Telegram,
            _ => Self::Any,
        }
    }

    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Any => WILDCARD,
            Self::Endpoint => "endpoint",
            Self::Iot => "iot",
            Self::Browser => "browser",
            Self::Cli => "cli",
            Self::Server => "server",
            Self::Telegram => "telegram",
        }
    }

    /// True when either side is the type-level wildcard or both are equal.
    #[must_use]
    pub fn matches(&self, other: &Self) -> bool {
        *self == Self::Any || *other == Self::Any || self == other
    }
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Serialize for EntityKind {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for EntityKind {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let tag = String::deserialize(deserializer)?;
        Ok(Self::parse(&tag))
    }
}

// ── Address ──────────────────────────────────────────────────────────────────

/// A five-tuple routing label: `(domain, kind, host, address, id)`.
///
/// Matching is the sole addressing primitive; there is no hierarchy between
/// the components.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Address {
    #[serde(default = "wildcard", deserialize_with = "component")]
    pub domain: String,
    #[serde(rename = "type", default)]
    pub kind: EntityKind,
    #[serde(default = "wildcard", deserialize_with = "component")]
    pub host: String,
    #[serde(default = "wildcard", deserialize_with = "component")]
    pub address: String,
    #[serde(default = "wildcard", deserialize_with = "component")]
    pub id: String,
}

fn wildcard() -> String {
    WILDCARD.to_string()
}

/// Empty wire fields normalize to `*`.
fn component<'de, D: Deserializer<'de>>(deserializer: D) -> Result<String, D::Error> {
    let raw = String::deserialize(deserializer)?;
    Ok(if raw.is_empty() { wildcard() } else { raw })
}

impl Default for Address {
    /// The fully-wildcarded address, matching everything.
    fn default() -> Self {
        Self {
            domain: wildcard(),
            kind: EntityKind::Any,
            host: wildcard(),
            address: wildcard(),
            id: wildcard(),
        }
    }
}

impl Address {
    /// Parse a canonical `.`-joined string. Missing trailing components are
    /// wildcards; more than five components is an error.
    pub fn parse(s: &str) -> Result<Self, AddressError> {
        let parts: Vec<&str> = if s.is_empty() { Vec::new() } else { s.split('.').collect() };
        if parts.len() > COMPONENT_COUNT {
            return Err(AddressError::TooManyComponents(s.to_string()));
        }
        let pick = |i: usize| -> String {
            match parts.get(i) {
                Some(p) if !p.is_empty() => (*p).to_string(),
                _ => wildcard(),
            }
        };
        Ok(Self {
            domain: pick(0),
            kind: EntityKind::parse(parts.get(1).copied().unwrap_or(WILDCARD)),
            host: pick(2),
            address: pick(3),
            id: pick(4),
        })
    }

    /// Replace empty components with `*`. Applied exactly once, at admission.
    pub fn normalize(&mut self) {
        for field in [&mut self.domain, &mut self.host, &mut self.address, &mut self.id] {
            if field.is_empty() {
                *field = wildcard();
            }
        }
    }

    /// Symmetric wildcard match: every component is equal or one side is `*`.
    #[must_use]
    pub fn matches(&self, other: &Self) -> bool {
        component_matches(&self.domain, &other.domain)
            && self.kind.matches(&other.kind)
            && component_matches(&self.host, &other.host)
            && component_matches(&self.address, &other.address)
            && component_matches(&self.id, &other.id)
    }

    /// True when no component is a wildcard.
    #[must_use]
    pub fn is_fully_specified(&self) -> bool {
        self.kind != EntityKind::Any
            && [&self.domain, &self.host, &self.address, &self.id]
                .iter()
                .all(|c| *c != WILDCARD && !c.is_empty())
    }

    /// Every address of the given domain, any kind/host/address/id.
    #[must_use]
    pub fn domain_wide(domain: &str) -> Self {
        Self {
            domain: domain.to_string(),
            ..Self::default()
        }
    }
}

fn component_matches(a: &str, b: &str) -> bool {
    a == WILDCARD || b == WILDCARD || a == b
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}.{}.{}.{}.{}",
            self.domain, self.kind, self.host, self.address, self.id
        )
    }
}

impl FromStr for Address {
    type Err = AddressError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}
