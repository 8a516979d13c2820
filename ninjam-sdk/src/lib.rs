//! ninjam-sdk: an embeddable client engine for NINJAM jam servers.
//!
//! Keeps a session alive across disconnects, answers the login challenge,
//! sends keepalives and exposes chat, presence, channel announcement and
//! interval upload to bots built on top. Start with [`client::Bot`].

pub mod auth;
pub mod client;
mod dispatch;
pub mod event;
pub mod frame;
pub mod net;
pub mod protocol;
mod session;

pub use client::{Bot, BotConfig, BotHandle, Timings};
pub use event::Event;
