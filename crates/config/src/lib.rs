//! Hub configuration: schema and file loader.

pub mod loader;
pub mod schema;

pub use loader::{config_dir, load};
pub use schema::{ConfigError, HubConfig, ListenConfig, StoreConfig, TelegramConfig, TlsConfig};
