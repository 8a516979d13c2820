//! Events emitted by the bot for the application layer to consume.

use serde::Serialize;

/// Chat-side events read off the server. Each is delivered exactly once
/// through [`Bot::incoming_messages`](crate::client::Bot::incoming_messages).
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum Event {
    /// Public chat line. `name` is the sender as reported by the server.
    Chat { name: String, text: String },

    /// Someone joined the jam.
    Join { name: String },

    /// Someone left the jam.
    Part { name: String },
}

impl Event {
    pub fn name(&self) -> &str {
        match self {
            Event::Chat { name, .. } | Event::Join { name } | Event::Part { name } => name,
        }
    }
}
