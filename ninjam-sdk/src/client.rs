//! NINJAM bot: configuration, public handle and the reconnect supervisor.
//!
//! This is the main entry point for SDK consumers. [`Bot::connect`] keeps a
//! session with the server alive until [`BotHandle::stop`] is called: it
//! dials, runs the session until any of its tasks fails, waits a fixed
//! backoff and starts over. Everything else (chat, channel announcements,
//! interval upload, the user list) goes through a cloneable [`BotHandle`]
//! that stays valid across reconnects.
//!
//! ## Callbacks
//!
//! `on_success_auth`, `on_server_config_change` and `on_userinfo_change` take
//! `&mut self`, so they can only be registered before the bot is shared and
//! connected. Callbacks are async and receive a [`BotHandle`]; the usual job
//! of `on_success_auth` is to re-announce channels, since every new auth
//! challenge clears them:
//!
//! ```rust,no_run
//! use ninjam_sdk::client::{Bot, BotConfig};
//!
//! # async fn example() {
//! let mut bot = Bot::new(BotConfig::new("ninbot.com", 2049, "jambot", "").anonymous(true));
//! bot.on_success_auth(|handle| async move {
//!     handle.channel_init("bot", 0).await
//! });
//! bot.connect().await;
//! # }
//! ```

use std::fmt;
use std::future::Future;
use std::ops::Deref;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use anyhow::{Result, anyhow};
use parking_lot::Mutex;
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;

use crate::auth::AuthState;
use crate::event::Event;
use crate::net;
use crate::protocol::{
    ChannelInfo, ClientMessage, Guid, IntervalWrite, SetChannelInfo, UploadIntervalBegin, UserInfo,
};
use crate::session;

/// Capacity of the raw outbound frame queue.
pub const OUTBOUND_QUEUE: usize = 1000;
/// Capacity of each of the chat and admin submission queues.
pub const CHAT_QUEUE: usize = 1000;
/// Capacity of the inbound event stream.
pub const EVENT_QUEUE: usize = 1000;

/// Timeouts and periods used by the connection machinery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Timings {
    /// Limit on a single TCP connect.
    pub connect_timeout: Duration,
    /// Pause between failed connects.
    pub dial_retry_delay: Duration,
    /// Pause between the end of a session and the next dial.
    pub reconnect_delay: Duration,
    /// How long we stay "authenticating" without a reply.
    pub auth_timeout: Duration,
    /// Keepalive period until the server states its own.
    pub keepalive: Duration,
    /// TCP-level keep-alive idle time on the socket.
    pub tcp_keepalive: Duration,
    /// Limit on receiving the rest of a frame once its header has arrived.
    pub payload_timeout: Duration,
}

impl Default for Timings {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(10),
            dial_retry_delay: Duration::from_secs(10),
            reconnect_delay: Duration::from_secs(5),
            auth_timeout: Duration::from_secs(10),
            keepalive: Duration::from_secs(10),
            tcp_keepalive: Duration::from_secs(24 * 60 * 60),
            payload_timeout: Duration::from_secs(30),
        }
    }
}

/// Configuration for connecting to a NINJAM server.
#[derive(Clone)]
pub struct BotConfig {
    pub host: String,
    pub port: u16,
    pub user_name: String,
    pub password: String,
    /// Log in as `anonymous:<user_name>`.
    pub anonymous: bool,
    pub timings: Timings,
}

impl BotConfig {
    pub fn new(host: impl Into<String>, port: u16, user_name: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            port,
            user_name: user_name.into(),
            password: password.into(),
            anonymous: false,
            timings: Timings::default(),
        }
    }

    pub fn anonymous(mut self, anonymous: bool) -> Self {
        self.anonymous = anonymous;
        self
    }

    pub fn timings(mut self, timings: Timings) -> Self {
        self.timings = timings;
        self
    }
}

impl fmt::Debug for BotConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BotConfig")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("user_name", &self.user_name)
            .field("password", &"<redacted>")
            .field("anonymous", &self.anonymous)
            .field("timings", &self.timings)
            .finish()
    }
}

pub type BoxFuture = Pin<Box<dyn Future<Output = Result<()>> + Send>>;
pub type AuthCallback = Arc<dyn Fn(BotHandle) -> BoxFuture + Send + Sync>;
pub type ConfigCallback = Arc<dyn Fn(BotHandle, u16, u16) -> BoxFuture + Send + Sync>;
pub type UserInfoCallback = Arc<dyn Fn(BotHandle, UserInfo) -> BoxFuture + Send + Sync>;

#[derive(Clone, Default)]
pub(crate) struct Callbacks {
    pub(crate) success_auth: Option<AuthCallback>,
    pub(crate) server_config_change: Option<ConfigCallback>,
    pub(crate) userinfo_change: Option<UserInfoCallback>,
}

/// Presence and channel state. Only the session reader writes `users`,
/// in frame order (user-info entries plus JOIN/PART chat); `channels` is appended
/// by the handle and cleared on every auth challenge.
#[derive(Debug, Default)]
pub(crate) struct Roster {
    pub(crate) users: std::collections::BTreeSet<String>,
    pub(crate) channels: Vec<ChannelInfo>,
}

impl Roster {
    /// Apply one user-info entry. A name is present iff its latest entry
    /// was active.
    pub(crate) fn apply(&mut self, user: &UserInfo) {
        if user.active {
            self.users.insert(user.name.clone());
        } else {
            self.users.remove(&user.name);
        }
    }
}

/// A frame in the outbound queue. Interval uploads are tagged with the
/// session they were queued in; other sessions discard them.
#[derive(Debug)]
pub(crate) struct Outbound {
    pub(crate) frame: Vec<u8>,
    pub(crate) session: Option<u64>,
}

impl Outbound {
    pub(crate) fn untagged(frame: Vec<u8>) -> Self {
        Self { frame, session: None }
    }

    pub(crate) fn is_stale(&self, current: u64) -> bool {
        self.session.is_some_and(|session| session != current)
    }
}

/// State shared by the handle and every session task.
pub(crate) struct Inner {
    pub(crate) config: BotConfig,
    pub(crate) outbound_tx: mpsc::Sender<Outbound>,
    pub(crate) outbound_rx: tokio::sync::Mutex<mpsc::Receiver<Outbound>>,
    /// A frame taken off the queue but not written when its session ended.
    pub(crate) unsent: Mutex<Option<Outbound>>,
    pub(crate) chat_tx: mpsc::Sender<String>,
    pub(crate) chat_rx: tokio::sync::Mutex<mpsc::Receiver<String>>,
    pub(crate) admin_tx: mpsc::Sender<String>,
    pub(crate) admin_rx: tokio::sync::Mutex<mpsc::Receiver<String>>,
    pub(crate) event_tx: mpsc::Sender<Event>,
    event_rx: Mutex<Option<mpsc::Receiver<Event>>>,
    pub(crate) auth: watch::Sender<AuthState>,
    /// Bumped on every challenge so a stale auth timer can't end a newer handshake.
    pub(crate) auth_epoch: AtomicU64,
    /// Id of the current (or last) session, bumped as each one starts.
    pub(crate) session: AtomicU64,
    pub(crate) roster: Mutex<Roster>,
    /// Serializes channel announcements so the server always ends up with the longest list.
    announce: tokio::sync::Mutex<()>,
    pub(crate) stop: CancellationToken,
    running: AtomicBool,
}

/// A cheap, cloneable handle to a bot. Valid before, during and after
/// connection; submissions made while disconnected are sent on the next
/// session.
#[derive(Clone)]
pub struct BotHandle {
    pub(crate) inner: Arc<Inner>,
}

impl BotHandle {
    fn new(config: BotConfig) -> Self {
        let (outbound_tx, outbound_rx) = mpsc::channel(OUTBOUND_QUEUE);
        let (chat_tx, chat_rx) = mpsc::channel(CHAT_QUEUE);
        let (admin_tx, admin_rx) = mpsc::channel(CHAT_QUEUE);
        let (event_tx, event_rx) = mpsc::channel(EVENT_QUEUE);
        let (auth, _) = watch::channel(AuthState::Disconnected);
        Self {
            inner: Arc::new(Inner {
                config,
                outbound_tx,
                outbound_rx: tokio::sync::Mutex::new(outbound_rx),
                unsent: Mutex::new(None),
                chat_tx,
                chat_rx: tokio::sync::Mutex::new(chat_rx),
                admin_tx,
                admin_rx: tokio::sync::Mutex::new(admin_rx),
                event_tx,
                event_rx: Mutex::new(Some(event_rx)),
                auth,
                auth_epoch: AtomicU64::new(0),
                session: AtomicU64::new(0),
                roster: Mutex::new(Roster::default()),
                announce: tokio::sync::Mutex::new(()),
                stop: CancellationToken::new(),
                running: AtomicBool::new(false),
            }),
        }
    }

    pub fn host(&self) -> &str {
        &self.inner.config.host
    }

    pub fn port(&self) -> u16 {
        self.inner.config.port
    }

    pub fn user_name(&self) -> &str {
        &self.inner.config.user_name
    }

    /// Stop the bot for good. The running session is torn down and
    /// [`Bot::connect`] returns at its next check point.
    pub fn stop(&self) {
        tracing::info!("Stop requested");
        self.inner.stop.cancel();
    }

    pub fn is_stopped(&self) -> bool {
        self.inner.stop.is_cancelled()
    }

    /// Resolves once [`stop`](Self::stop) has been called. The event stream
    /// never ends on its own, so consumers select on this.
    pub async fn stopped(&self) {
        self.inner.stop.cancelled().await
    }

    /// Queue a public chat line. Waits only if the chat queue is full.
    pub async fn send_message(&self, text: &str) -> Result<()> {
        self.inner
            .chat_tx
            .send(text.to_string())
            .await
            .map_err(|_| anyhow!("chat queue closed"))
    }

    /// Like [`send_message`](Self::send_message) but fails instead of
    /// waiting when the queue is full.
    pub fn try_send_message(&self, text: &str) -> Result<()> {
        self.inner.chat_tx.try_send(text.to_string()).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => anyhow!("chat queue full ({CHAT_QUEUE} pending)"),
            mpsc::error::TrySendError::Closed(_) => anyhow!("chat queue closed"),
        })
    }

    /// Queue a server admin command (e.g. `topic ...`, `bpm 120`).
    pub async fn send_admin_message(&self, text: &str) -> Result<()> {
        self.inner
            .admin_tx
            .send(text.to_string())
            .await
            .map_err(|_| anyhow!("admin queue closed"))
    }

    /// Add a channel with default volume and pan, then announce the
    /// complete channel list.
    /// flags: 0 interval based, 2 voice chat, 4 session mode.
    pub async fn channel_init(&self, name: &str, flags: u8) -> Result<()> {
        self.channel_init_extended(name, flags, 0, 0).await
    }

    pub async fn channel_init_extended(&self, name: &str, flags: u8, volume: i16, pan: i8) -> Result<()> {
        let _announcing = self.inner.announce.lock().await;
        let channels = {
            let mut roster = self.inner.roster.lock();
            roster.channels.push(ChannelInfo {
                name: name.to_string(),
                volume,
                pan,
                flags,
            });
            roster.channels.clone()
        };
        tracing::info!(channel = name, total = channels.len(), "Announcing channels");
        self.enqueue(ClientMessage::SetChannelInfo(SetChannelInfo { channels }))
            .await
    }

    /// Announce an interval on one of our channels. Dropped while
    /// authenticating or disconnected.
    pub async fn interval_begin(&self, guid: Guid, channel_index: u8) -> Result<()> {
        let Some(session) = self.upload_session() else {
            tracing::debug!(channel_index, state = ?self.auth_state(), "Interval begin dropped");
            return Ok(());
        };
        let msg = ClientMessage::UploadIntervalBegin(UploadIntervalBegin::new(guid, channel_index));
        self.enqueue_tagged(msg, Some(session)).await
    }

    /// Stream one block of an interval. Dropped while authenticating or
    /// disconnected.
    pub async fn interval_write(&self, guid: Guid, data: Vec<u8>, flags: u8) -> Result<()> {
        let Some(session) = self.upload_session() else {
            tracing::debug!(bytes = data.len(), state = ?self.auth_state(), "Interval write dropped");
            return Ok(());
        };
        let msg = ClientMessage::UploadIntervalWrite(IntervalWrite { guid, flags, audio: data });
        self.enqueue_tagged(msg, Some(session)).await
    }

    /// The session an upload queued now belongs to, if uploads are allowed.
    fn upload_session(&self) -> Option<u64> {
        if !self.auth_state().accepts_uploads() {
            return None;
        }
        Some(self.inner.session.load(Ordering::SeqCst))
    }

    /// Take the inbound event stream. Only the first caller gets it.
    pub fn incoming_messages(&self) -> Option<mpsc::Receiver<Event>> {
        self.inner.event_rx.lock().take()
    }

    /// Names of the users the server currently reports active, sorted.
    pub fn users(&self) -> Vec<String> {
        self.inner.roster.lock().users.iter().cloned().collect()
    }

    /// Channels announced in the current auth epoch, in order.
    pub fn channels(&self) -> Vec<ChannelInfo> {
        self.inner.roster.lock().channels.clone()
    }

    pub fn auth_state(&self) -> AuthState {
        *self.inner.auth.borrow()
    }

    /// Resolve once no login is pending.
    pub async fn wait_auth(&self) {
        let mut rx = self.inner.auth.subscribe();
        // The sender lives in `inner`, which we hold, so this can't fail.
        let _ = rx.wait_for(|state| !state.is_pending()).await;
    }

    /// Encode and queue a frame, waiting for queue capacity.
    pub(crate) async fn enqueue(&self, msg: ClientMessage) -> Result<()> {
        self.enqueue_tagged(msg, None).await
    }

    async fn enqueue_tagged(&self, msg: ClientMessage, session: Option<u64>) -> Result<()> {
        let kind = msg.kind();
        let frame = msg.to_frame().map_err(|e| {
            tracing::error!(?kind, "Dropping outbound frame: {e}");
            anyhow!("failed to encode {kind:?}: {e}")
        })?;
        self.inner
            .outbound_tx
            .send(Outbound { frame, session })
            .await
            .map_err(|_| anyhow!("outbound queue closed"))
    }
}

/// Owner of a bot: registers callbacks and runs the connection loop.
/// Dereferences to [`BotHandle`] for everything else.
pub struct Bot {
    handle: BotHandle,
    callbacks: Callbacks,
}

impl Bot {
    pub fn new(config: BotConfig) -> Self {
        Self {
            handle: BotHandle::new(config),
            callbacks: Callbacks::default(),
        }
    }

    pub fn handle(&self) -> BotHandle {
        self.handle.clone()
    }

    /// Called after the server accepts our login.
    pub fn on_success_auth<F, Fut>(&mut self, f: F)
    where
        F: Fn(BotHandle) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        self.callbacks.success_auth = Some(Arc::new(move |h| -> BoxFuture { Box::pin(f(h)) }));
    }

    /// Called with `(bpm, bpi)` whenever the server tempo changes.
    pub fn on_server_config_change<F, Fut>(&mut self, f: F)
    where
        F: Fn(BotHandle, u16, u16) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        self.callbacks.server_config_change = Some(Arc::new(move |h, bpm, bpi| -> BoxFuture {
            Box::pin(f(h, bpm, bpi))
        }));
    }

    /// Called once per entry of every user-info notification.
    pub fn on_userinfo_change<F, Fut>(&mut self, f: F)
    where
        F: Fn(BotHandle, UserInfo) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        self.callbacks.userinfo_change = Some(Arc::new(move |h, user| -> BoxFuture { Box::pin(f(h, user)) }));
    }

    /// Connect and stay connected until [`BotHandle::stop`]. Transient
    /// failures never end this loop.
    pub async fn connect(&self) {
        let inner = &self.handle.inner;
        if inner.running.swap(true, Ordering::SeqCst) {
            tracing::warn!("Bot is already connecting, ignoring second connect()");
            return;
        }

        let callbacks = Arc::new(self.callbacks.clone());
        let reconnect_delay = inner.config.timings.reconnect_delay;

        while !inner.stop.is_cancelled() {
            self.connect_once(&callbacks).await;

            tracing::info!(delay_secs = reconnect_delay.as_secs_f32(), "Disconnected, will reconnect");
            tokio::select! {
                _ = inner.stop.cancelled() => break,
                _ = tokio::time::sleep(reconnect_delay) => {}
            }
        }

        inner.running.store(false, Ordering::SeqCst);
        tracing::info!("Bot stopped");
    }

    async fn connect_once(&self, callbacks: &Arc<Callbacks>) {
        let config = &self.handle.inner.config;
        let Some(stream) = net::dial_with_retry(config, &self.handle.inner.stop).await else {
            return;
        };
        match session::run(stream, self.handle.clone(), callbacks.clone()).await {
            Ok(()) => tracing::info!("Session finished"),
            Err(e) => tracing::warn!(error = %format!("{e:#}"), "Session ended"),
        }
    }
}

impl Deref for Bot {
    type Target = BotHandle;

    fn deref(&self) -> &BotHandle {
        &self.handle
    }
}
