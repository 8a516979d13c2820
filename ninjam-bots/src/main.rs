//! ninjam-bot: sits in a NINJAM jam, logs chat and answers a few commands.
//!
//! Commands (public chat):
//!
//!   !users    list who is in the jam
//!   !bpm      current tempo, as last announced by the server
//!
//! With `--json` every chat event is also written to stdout as one JSON
//! object per line, for piping into other tools. Logs go to stderr; set
//! `NINJAM_LOG_JSON=1` to get them as JSON too.

use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};

use anyhow::Result;
use chrono::{DateTime, Utc};
use clap::Parser;
use serde::Serialize;
use tracing_subscriber::EnvFilter;

use ninjam_sdk::auth::login_name;
use ninjam_sdk::{Bot, BotConfig, BotHandle, Event};

#[derive(Parser)]
#[command(name = "ninjam-bot", about = "Chat bot for NINJAM jam servers")]
struct Args {
    /// Server host name
    #[arg(long, default_value = "ninbot.com")]
    host: String,

    /// Server port
    #[arg(long, default_value_t = 2049)]
    port: u16,

    /// User name
    #[arg(long, default_value = "jambot")]
    user: String,

    /// Password (or set NINJAM_PASSWORD)
    #[arg(long, env = "NINJAM_PASSWORD", default_value = "", hide_env_values = true)]
    password: String,

    /// Log in anonymously
    #[arg(long)]
    anonymous: bool,

    /// Name of the channel announced after login
    #[arg(long, default_value = "bot")]
    channel: String,

    /// Greet users as they join
    #[arg(long)]
    greet: bool,

    /// Emit chat events as JSON lines on stdout
    #[arg(long)]
    json: bool,
}

/// One line of `--json` output.
#[derive(Serialize)]
struct EventLine<'a> {
    ts: DateTime<Utc>,
    #[serde(flatten)]
    event: &'a Event,
}

/// Tempo as `bpm << 16 | bpi`, updated from the config callback.
#[derive(Default)]
struct Tempo(AtomicU32);

impl Tempo {
    fn set(&self, bpm: u16, bpi: u16) {
        self.0.store((u32::from(bpm) << 16) | u32::from(bpi), Ordering::Relaxed);
    }

    fn get(&self) -> Option<(u16, u16)> {
        let packed = self.0.load(Ordering::Relaxed);
        (packed != 0).then_some(((packed >> 16) as u16, packed as u16))
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    // Stdout carries --json events, so logs go to stderr. NINJAM_LOG_JSON=1 for JSON logs.
    let json_logs = std::env::var("NINJAM_LOG_JSON").unwrap_or_default() == "1";
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| "ninjam_bots=info,ninjam_sdk=info".into());
    if json_logs {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .json()
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .init();
    }

    let args = Args::parse();
    let config = BotConfig::new(&args.host, args.port, &args.user, &args.password).anonymous(args.anonymous);

    tracing::info!(
        host = %args.host,
        port = args.port,
        user = %args.user,
        anonymous = args.anonymous,
        "Starting ninjam-bot"
    );

    let tempo = Arc::new(Tempo::default());
    let mut bot = Bot::new(config);

    let channel = args.channel.clone();
    bot.on_success_auth(move |handle| {
        let channel = channel.clone();
        async move {
            handle.channel_init(&channel, 0).await?;
            tracing::info!(%channel, "Channel announced");
            anyhow::Ok(())
        }
    });

    let t = tempo.clone();
    bot.on_server_config_change(move |_, bpm, bpi| {
        t.set(bpm, bpi);
        async move {
            tracing::info!("Tempo is now {bpm} bpm / {bpi} bpi");
            anyhow::Ok(())
        }
    });

    let Some(mut events) = bot.incoming_messages() else {
        anyhow::bail!("event stream already taken");
    };

    let bot = Arc::new(bot);
    let runner = bot.clone();
    let supervisor = tokio::spawn(async move { runner.connect().await });

    let stopper = bot.handle();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("Ctrl+C received, shutting down");
            stopper.stop();
        }
    });

    let me = login_name(&args.user, args.anonymous);
    tracing::info!("Bot running. Ctrl+C to stop.");

    loop {
        let event = tokio::select! {
            event = events.recv() => event,
            _ = bot.stopped() => None,
        };
        let Some(event) = event else { break };

        if args.json {
            print_json(&event);
        }
        if let Err(e) = handle_event(&bot.handle(), &me, &event, &tempo, args.greet).await {
            tracing::warn!("Event handler error: {e}");
        }
    }

    supervisor.await?;
    Ok(())
}

fn print_json(event: &Event) {
    let line = EventLine {
        ts: Utc::now(),
        event,
    };
    match serde_json::to_string(&line) {
        Ok(json) => println!("{json}"),
        Err(e) => tracing::warn!("Can't serialize event: {e}"),
    }
}

async fn handle_event(handle: &BotHandle, me: &str, event: &Event, tempo: &Tempo, greet: bool) -> Result<()> {
    match event {
        Event::Chat { name, text } => {
            tracing::info!("<{name}> {text}");
            if is_self(name, me) {
                return Ok(());
            }
            if let Some(reply) = command_reply(text, &handle.users(), tempo.get()) {
                handle.send_message(&reply).await?;
            }
        }
        Event::Join { name } => {
            tracing::info!("{name} joined");
            if greet && !is_self(name, me) {
                handle.send_message(&format!("welcome {}", short_name(name))).await?;
            }
        }
        Event::Part { name } => tracing::info!("{name} left"),
    }
    Ok(())
}

/// Servers report names as `user@address`; compare the user part.
fn short_name(name: &str) -> &str {
    name.split_once('@').map_or(name, |(user, _)| user)
}

fn is_self(name: &str, me: &str) -> bool {
    short_name(name) == me
}

fn command_reply(text: &str, users: &[String], tempo: Option<(u16, u16)>) -> Option<String> {
    match text.trim() {
        "!users" if users.is_empty() => Some("nobody here".to_string()),
        "!users" => {
            let names: Vec<&str> = users.iter().map(|u| short_name(u)).collect();
            Some(format!("{} in the jam: {}", names.len(), names.join(", ")))
        }
        "!bpm" => Some(match tempo {
            Some((bpm, bpi)) => format!("{bpm} bpm, {bpi} bpi"),
            None => "tempo unknown".to_string(),
        }),
        _ => None,
    }
}
