//! Hub: the connection/registration/routing engine.
//!
//! Lifecycle:
//! 1. Load + validate config, open the store, build the notify bridge
//! 2. Bind the listener and attach the WebSocket upgrade handler
//! 3. Per connection: registration handshake → observer registered →
//!    ping task + read loop
//! 4. The dispatcher routes inbound actions through the observer registry
//! 5. The setup protocol drains the registry and hands a restart back to
//!    the lifecycle loop
//!
//! Persistence and human notifications live behind the `trellis-store` and
//! `trellis-bridge` contracts; nothing in here touches a database or a chat
//! API directly.

pub mod command;
pub mod dispatch;
pub mod handshake;
pub mod observer;
pub mod registry;
pub mod server;
pub mod setup;
pub mod state;
pub mod transport;

#[cfg(test)]
pub(crate) mod testutil;

pub use {
    handshake::AdmitError,
    observer::Observer,
    registry::Registry,
    server::{RunOptions, run},
    state::{HubControl, HubState},
};
