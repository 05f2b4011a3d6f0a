//! Hub wire protocol definitions.
//!
//! All communication uses JSON frames over a duplex transport (WebSocket in
//! production). A frame is one [`Message`]: sender and receiver [`Address`],
//! an [`Action`] tag, and an action-shaped `data` payload.
//!
//! Ping and close use the transport's native control frames, never JSON.

pub mod address;
pub mod message;

pub use address::{Address, AddressError, EntityKind, WILDCARD};
pub use message::{Action, Event, Message, SetupFile, SetupPayload, StatusPayload};

// ── Constants ────────────────────────────────────────────────────────────────

/// Deadline for the single registration frame after transport upgrade.
pub const REGISTER_TIMEOUT_MS: u64 = 60_000;
/// Interval between transport-level ping frames.
pub const PING_INTERVAL_MS: u64 = 60_000;
/// Deadline for control writes (ping, observer close frame).
pub const CONTROL_WRITE_TIMEOUT_MS: u64 = 1_000;
/// Deadline for ordinary outbound message frames.
pub const FRAME_WRITE_TIMEOUT_MS: u64 = 10_000;
/// Deadline for the close frame written while rejecting a registration.
pub const CLOSE_HANDSHAKE_TIMEOUT_MS: u64 = 10_000;
/// Ambient deadline for persistent-store operations.
pub const STORE_TIMEOUT_MS: u64 = 10_000;

/// Length of generated activation codes.
pub const ACTIVATION_CODE_LEN: usize = 6;
/// Minimum api-key length accepted from a first-time client.
pub const MIN_API_KEY_LEN: usize = 10;

/// Setup-file path that carries staged endpoint records instead of a file.
pub const ENDPOINTS_SENTINEL: &str = "++endpoints++";
