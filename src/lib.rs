//! Streaming client for the Sydney ChatHub conversation protocol.
//!
//! [`ChatClient`] is the entry point. A turn is streamed as [`ChatEvent`]s:
//! answer text arrives as deltas, followed by citations, suggested replies,
//! drawn images and finally the service's terminal response.

pub mod bootstrap;
pub mod classifier;
pub mod client;
pub mod codec;
pub mod config;
pub mod conversations;
pub mod engine;
pub mod error;
pub mod events;
pub mod headers;
pub mod imagegen;
pub mod logging;
pub mod render;
pub mod request;
pub mod retry;
pub mod sessions;

#[cfg(test)]
mod testing;

pub use client::ChatClient;
pub use config::ClientConfig;
pub use engine::TurnRequest;
pub use error::{ChatError, Result};
pub use events::ChatEvent;
pub use request::ConversationStyle;
pub use sessions::{ConversationHandle, SessionStore};
