//! Fake NINJAM server and wait helpers shared by the integration tests.

#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncWriteExt, BufReader};
use tokio::net::TcpListener;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::timeout;

use ninjam_sdk::protocol::{
    AuthChallenge, AuthReply, ChatMessage, ClientMessage, ServerMessage, UserInfo, command,
};
use ninjam_sdk::{Bot, BotConfig, Event, Timings};

/// How long to wait for anything before failing the test.
pub const TIMEOUT: Duration = Duration::from_secs(5);

pub const CHALLENGE: [u8; 8] = *b"nonce123";

/// Fast timings so lifecycle tests finish in well under a second.
pub fn fast_timings() -> Timings {
    Timings {
        connect_timeout: Duration::from_secs(2),
        dial_retry_delay: Duration::from_millis(100),
        reconnect_delay: Duration::from_millis(100),
        auth_timeout: Duration::from_millis(500),
        keepalive: Duration::from_millis(100),
        tcp_keepalive: Duration::from_secs(3600),
        payload_timeout: Duration::from_millis(500),
    }
}

pub struct FakeServer {
    listener: TcpListener,
    pub port: u16,
}

impl FakeServer {
    pub async fn bind() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        Self { listener, port }
    }

    pub fn config(&self, user: &str, password: &str) -> BotConfig {
        BotConfig::new("127.0.0.1", self.port, user, password).timings(fast_timings())
    }

    pub async fn accept(&self) -> Conn {
        let (stream, _) = timeout(TIMEOUT, self.listener.accept())
            .await
            .expect("Timeout waiting for the bot to connect")
            .unwrap();
        let (reader, writer) = stream.into_split();
        Conn {
            reader: BufReader::new(reader),
            writer,
        }
    }
}

/// Server side of one bot connection.
pub struct Conn {
    reader: BufReader<OwnedReadHalf>,
    pub writer: OwnedWriteHalf,
}

impl Conn {
    pub async fn send(&mut self, msg: ServerMessage) {
        self.send_raw(&msg.to_frame().unwrap()).await;
    }

    pub async fn send_raw(&mut self, bytes: &[u8]) {
        self.writer.write_all(bytes).await.unwrap();
        self.writer.flush().await.unwrap();
    }

    /// Next frame from the bot, keepalives included.
    pub async fn recv_any(&mut self) -> ClientMessage {
        let (header, payload) = timeout(TIMEOUT, ninjam_sdk::frame::read_frame(&mut self.reader))
            .await
            .expect("Timeout waiting for a frame from the bot")
            .expect("bot closed the connection");
        ClientMessage::decode(header, &payload).unwrap()
    }

    /// Next frame from the bot that isn't a keepalive.
    pub async fn recv(&mut self) -> ClientMessage {
        loop {
            match self.recv_any().await {
                ClientMessage::Keepalive => continue,
                msg => return msg,
            }
        }
    }

    /// Next keepalive, ignoring anything else.
    pub async fn recv_keepalive(&mut self) {
        while self.recv_any().await != ClientMessage::Keepalive {}
    }

    /// Challenge with the given server caps; returns the login we got back.
    pub async fn challenge(&mut self, server_caps: u32) -> ninjam_sdk::protocol::AuthUser {
        self.send(ServerMessage::AuthChallenge(AuthChallenge {
            challenge: CHALLENGE,
            server_caps,
            protocol_version: 0x0002_0000,
            license: None,
        }))
        .await;
        match self.recv().await {
            ClientMessage::AuthUser(login) => login,
            other => panic!("expected login, got {other:?}"),
        }
    }

    pub async fn reply(&mut self, success: bool) {
        self.send(ServerMessage::AuthReply(AuthReply {
            flag: u8::from(success),
            message: if success { "welcome".into() } else { "invalid login".into() },
            max_channels: Some(32),
        }))
        .await;
    }

    /// Full handshake: challenge, login, successful reply.
    pub async fn login(&mut self) {
        self.challenge(0).await;
        self.reply(true).await;
    }

    pub async fn chat(&mut self, cmd: &str, args: &[&str]) {
        self.send(ServerMessage::Chat(ChatMessage::new(cmd, args))).await;
    }

    pub async fn say(&mut self, name: &str, text: &str) {
        self.chat(command::MSG, &[name, text]).await;
    }

    /// Is the connection closed by the bot (EOF) within `dur`?
    pub async fn closed_within(&mut self, dur: Duration) -> bool {
        let result = timeout(dur, async {
            loop {
                if ninjam_sdk::frame::read_frame(&mut self.reader).await.is_err() {
                    return;
                }
            }
        })
        .await;
        result.is_ok()
    }
}

pub fn user(name: &str, active: bool) -> UserInfo {
    UserInfo {
        active,
        channel_index: 0,
        volume: 0,
        pan: 0,
        flags: 0,
        name: name.to_string(),
        channel_name: "channel".to_string(),
    }
}

/// Log to the test harness when RUST_LOG is set.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Run `bot.connect()` in the background.
pub fn spawn_bot(bot: Bot) -> (Arc<Bot>, JoinHandle<()>) {
    init_tracing();
    let bot = Arc::new(bot);
    let runner = bot.clone();
    let task = tokio::spawn(async move { runner.connect().await });
    (bot, task)
}

/// Stop the bot and make sure `connect()` actually returns.
pub async fn shutdown(bot: &Bot, task: JoinHandle<()>) {
    bot.stop();
    timeout(TIMEOUT, task)
        .await
        .expect("connect() did not return after stop()")
        .unwrap();
}

/// Wait for a specific event, ignoring others.
pub async fn wait_for<F: Fn(&Event) -> bool>(rx: &mut mpsc::Receiver<Event>, predicate: F, desc: &str) -> Event {
    let result = timeout(TIMEOUT, async {
        loop {
            match rx.recv().await {
                Some(evt) if predicate(&evt) => return evt,
                Some(_) => continue,
                None => panic!("Event stream closed while waiting for: {desc}"),
            }
        }
    })
    .await;

    result.unwrap_or_else(|_| panic!("Timeout ({TIMEOUT:?}) waiting for: {desc}"))
}

/// Poll `check` until it holds.
pub async fn eventually<F: Fn() -> bool>(check: F, desc: &str) {
    let result = timeout(TIMEOUT, async {
        while !check() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await;
    result.unwrap_or_else(|_| panic!("Timeout ({TIMEOUT:?}) waiting for: {desc}"));
}
