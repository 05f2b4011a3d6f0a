//! Telegram implementation of the hub's notify bridge.

pub mod bridge;

pub use bridge::TelegramBridge;
