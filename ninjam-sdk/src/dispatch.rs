//! Routes decoded server messages to their side effects.
//!
//! Presence changes and the event stream are applied by [`in_order`] on
//! the reader's task, in frame order, and never wait. Whatever still needs
//! a handler (login, callbacks) runs on its own task; a failure or panic
//! there is logged and never reaches the reader.

use std::sync::atomic::Ordering;

use anyhow::{Context, Result};
use tokio::sync::mpsc::error::TrySendError;

use crate::auth::{self, AuthState};
use crate::client::{BotHandle, EVENT_QUEUE};
use crate::event::Event;
use crate::protocol::{AuthChallenge, AuthReply, ChatMessage, ClientMessage, ServerMessage, UserInfo, command};
use crate::session::SessionCtx;

/// Apply the parts of `msg` that must follow frame order. Returns the
/// message back if it still needs [`handle`].
pub(crate) fn in_order(ctx: &SessionCtx, msg: ServerMessage) -> Option<ServerMessage> {
    match msg {
        ServerMessage::UserInfoChange(users) => {
            {
                let mut roster = ctx.handle.inner.roster.lock();
                for user in &users {
                    roster.apply(user);
                }
            }
            tracing::info!(users = ?ctx.handle.users(), "Users");
            ctx.callbacks
                .userinfo_change
                .is_some()
                .then_some(ServerMessage::UserInfoChange(users))
        }
        ServerMessage::Chat(chat) => {
            on_chat(&ctx.handle, chat);
            None
        }
        ServerMessage::DownloadIntervalBegin(begin) => {
            tracing::debug!(user = %begin.user_name, channel = begin.channel_index, "Interval begin ignored");
            None
        }
        ServerMessage::DownloadIntervalWrite(_) | ServerMessage::Keepalive => None,
        msg => Some(msg),
    }
}

pub(crate) async fn handle(ctx: &SessionCtx, msg: ServerMessage) {
    let kind = msg.kind();
    if let Err(e) = route(ctx, msg).await {
        tracing::error!(?kind, "Handle error: {e:#}");
    }
}

async fn route(ctx: &SessionCtx, msg: ServerMessage) -> Result<()> {
    match msg {
        ServerMessage::AuthChallenge(challenge) => on_challenge(ctx, challenge).await,
        ServerMessage::AuthReply(reply) => on_auth_reply(ctx, reply).await,
        ServerMessage::ConfigChange(config) => {
            tracing::info!(bpm = config.bpm, bpi = config.bpi, "Server config changed");
            if let Some(cb) = &ctx.callbacks.server_config_change {
                cb(ctx.handle.clone(), config.bpm, config.bpi)
                    .await
                    .context("server config callback")?;
            }
            Ok(())
        }
        ServerMessage::UserInfoChange(users) => {
            on_userinfo(ctx, users).await;
            Ok(())
        }
        // Fully handled by `in_order`.
        ServerMessage::Chat(_)
        | ServerMessage::DownloadIntervalBegin(_)
        | ServerMessage::DownloadIntervalWrite(_)
        | ServerMessage::Keepalive => Ok(()),
    }
}

async fn on_challenge(ctx: &SessionCtx, challenge: AuthChallenge) -> Result<()> {
    let inner = &ctx.handle.inner;
    let config = &inner.config;

    // The server expects channels to be announced again after every login.
    inner.roster.lock().channels.clear();
    let epoch = inner.auth_epoch.fetch_add(1, Ordering::SeqCst) + 1;
    inner.auth.send_replace(AuthState::Authenticating);
    tracing::info!(
        agreement = challenge.has_agreement(),
        protocol = %format_args!("{:#x}", challenge.protocol_version),
        "Auth challenge received"
    );

    let timer_handle = ctx.handle.clone();
    let done = ctx.done.clone();
    let window = config.timings.auth_timeout;
    tokio::spawn(async move {
        tokio::select! {
            _ = done.cancelled() => {}
            _ = tokio::time::sleep(window) => expire_auth(&timer_handle, epoch),
        }
    });

    let login = auth::login(&config.user_name, &config.password, config.anonymous, &challenge);

    if let Some(period) = challenge.keepalive_interval() {
        tracing::debug!(period_secs = period.as_secs(), "Server keepalive interval");
        ctx.keepalive.send_replace(period);
    }

    ctx.handle
        .enqueue(ClientMessage::AuthUser(login))
        .await
        .context("Error when logging in")
}

/// Leave the authenticating state if `epoch` is still the current handshake.
fn expire_auth(handle: &BotHandle, epoch: u64) {
    let inner = &handle.inner;
    let expired = inner.auth.send_if_modified(|state| {
        if state.is_pending() && inner.auth_epoch.load(Ordering::SeqCst) == epoch {
            *state = AuthState::Idle;
            true
        } else {
            false
        }
    });
    if expired {
        tracing::warn!("No auth reply in time, resuming keepalive");
    }
}

async fn on_auth_reply(ctx: &SessionCtx, reply: AuthReply) -> Result<()> {
    let inner = &ctx.handle.inner;
    if !reply.success() {
        // The connection stays up, unauthenticated; the server decides what happens next.
        tracing::error!("Login failed: {}", reply.message);
        inner.auth.send_replace(AuthState::Idle);
        return Ok(());
    }

    tracing::info!(max_channels = ?reply.max_channels, "Logged in successfully: {}", reply.message);
    inner.auth.send_replace(AuthState::Authenticated);
    if let Some(cb) = &ctx.callbacks.success_auth {
        cb(ctx.handle.clone()).await.context("success auth callback")?;
    }
    Ok(())
}

/// Run the user-info callback per entry. The roster was already updated.
async fn on_userinfo(ctx: &SessionCtx, users: Vec<UserInfo>) {
    let Some(cb) = &ctx.callbacks.userinfo_change else {
        return;
    };
    for user in users {
        let name = user.name.clone();
        if let Err(e) = cb(ctx.handle.clone(), user).await {
            tracing::error!(user = %name, "User info callback failed: {e:#}");
        }
    }
}

fn on_chat(handle: &BotHandle, chat: ChatMessage) {
    tracing::info!(
        command = %chat.command,
        args = ?chat.args,
        "Chat message received"
    );

    let event = match chat.command.as_str() {
        command::MSG => {
            tracing::info!("{} said: {}", chat.arg(1), chat.arg(2));
            Event::Chat {
                name: chat.arg(1).to_string(),
                text: chat.arg(2).to_string(),
            }
        }
        command::JOIN => {
            tracing::info!("{} joined", chat.arg(1));
            handle.inner.roster.lock().users.insert(chat.arg(1).to_string());
            Event::Join {
                name: chat.arg(1).to_string(),
            }
        }
        command::PART => {
            tracing::info!("{} left", chat.arg(1));
            handle.inner.roster.lock().users.remove(chat.arg(1));
            Event::Part {
                name: chat.arg(1).to_string(),
            }
        }
        _ => return,
    };
    publish(handle, event);
}

/// Hand an event to the consumer without waiting. A full stream drops it.
fn publish(handle: &BotHandle, event: Event) {
    match handle.inner.event_tx.try_send(event) {
        Ok(()) => {}
        Err(TrySendError::Full(event)) => {
            tracing::warn!(name = event.name(), "Event stream full ({EVENT_QUEUE} pending), dropping event");
        }
        Err(TrySendError::Closed(_)) => tracing::debug!("Event stream receiver dropped"),
    }
}
