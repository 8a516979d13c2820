//! Loop bot example: announces a channel and plays a pre-encoded Ogg Vorbis
//! file into every interval, following the server tempo.
//!
//! Usage:
//!   cargo run --example loop_bot -- --host ninbot.com --port 2049 \
//!     --user loopbot --anonymous --file loop.ogg
//!
//! Features demonstrated:
//!   - Re-announcing channels after every login
//!   - Tracking tempo through the config-change callback
//!   - Interval upload (begin + blocks, last block flagged)
//!   - Answering chat from the event stream

use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use anyhow::Result;
use clap::Parser;
use ninjam_sdk::protocol::Guid;
use ninjam_sdk::{Bot, BotConfig, BotHandle, Event};
use tokio::sync::watch;

/// Upload block size.
const BLOCK: usize = 8 * 1024;

#[derive(Parser)]
#[command(name = "loop-bot", about = "NINJAM loop bot example")]
struct Args {
    #[arg(long, default_value = "ninbot.com")]
    host: String,
    #[arg(long, default_value_t = 2049)]
    port: u16,
    #[arg(long, default_value = "loopbot")]
    user: String,
    #[arg(long, default_value = "")]
    password: String,
    #[arg(long)]
    anonymous: bool,
    /// Ogg Vorbis file uploaded once per interval
    #[arg(long)]
    file: std::path::PathBuf,
}

fn interval_length(bpm: u16, bpi: u16) -> Duration {
    Duration::from_secs_f64(60.0 / f64::from(bpm.max(1)) * f64::from(bpi.max(1)))
}

fn new_guid(seq: u64) -> Guid {
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos() as u64)
        .unwrap_or_default();
    let mut guid = [0u8; 16];
    guid[..8].copy_from_slice(&nanos.to_le_bytes());
    guid[8..].copy_from_slice(&seq.to_le_bytes());
    guid
}

async fn upload(handle: &BotHandle, guid: Guid, audio: &[u8]) -> Result<()> {
    handle.interval_begin(guid, 0).await?;
    let blocks: Vec<&[u8]> = audio.chunks(BLOCK).collect();
    for (i, block) in blocks.iter().enumerate() {
        let last = i + 1 == blocks.len();
        handle.interval_write(guid, block.to_vec(), u8::from(last)).await?;
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt::init();
    let args = Args::parse();
    let audio = tokio::fs::read(&args.file).await?;

    let config = BotConfig::new(&args.host, args.port, &args.user, &args.password).anonymous(args.anonymous);
    let mut bot = Bot::new(config);

    bot.on_success_auth(|handle| async move { handle.channel_init("loop", 0).await });

    let (tempo_tx, mut tempo_rx) = watch::channel((120u16, 16u16));
    bot.on_server_config_change(move |_, bpm, bpi| {
        tempo_tx.send_replace((bpm, bpi));
        async { anyhow::Ok(()) }
    });

    let mut events = bot.incoming_messages().expect("fresh bot");
    let bot = Arc::new(bot);
    let runner = bot.clone();
    tokio::spawn(async move { runner.connect().await });

    // Chat: answer "!tempo".
    let chat = bot.handle();
    let tempo_view = tempo_rx.clone();
    tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            if let Event::Chat { text, .. } = event
                && text.trim() == "!tempo"
            {
                let (bpm, bpi) = *tempo_view.borrow();
                let _ = chat.send_message(&format!("{bpm} bpm / {bpi} bpi")).await;
            }
        }
    });

    let handle = bot.handle();
    let mut seq = 0u64;
    loop {
        let (bpm, bpi) = *tempo_rx.borrow_and_update();
        let wait = interval_length(bpm, bpi);
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            _ = tempo_rx.changed() => continue,
            _ = tokio::time::sleep(wait) => {}
        }
        seq += 1;
        if let Err(e) = upload(&handle, new_guid(seq), &audio).await {
            tracing::warn!("Upload failed: {e:#}");
        }
    }

    bot.stop();
    Ok(())
}
