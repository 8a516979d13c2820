//! One live connection: four tasks sharing a `done` token.
//!
//! - **reader** (runs on the caller's task): frames off the socket; presence
//!   and chat events applied in place, anything needing a callback or a
//!   reply handed to the dispatcher on its own task
//! - **outbound pump**: drains the frame queue into the socket, in order,
//!   skipping uploads queued for an earlier session
//! - **keepalive pump**: queues a keepalive every period unless a login
//!   is pending
//! - **submission pump**: turns queued chat/admin text into chat frames
//!
//! Whichever task fails first cancels `done`; the others observe it and
//! exit. `done` is a child of the bot's stop token, so [`stop`] tears the
//! session down the same way. The session returns only after every task
//! has been joined, which is what lets the supervisor reuse the queues.
//! A frame the pump had already dequeued when the session ended is kept
//! and written first by the next one.
//!
//! [`stop`]: crate::client::BotHandle::stop

use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::Duration;

use anyhow::Result;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::sync::watch;
use tokio::task::JoinSet;
use tokio::time::{Instant, Interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use crate::auth::AuthState;
use crate::client::{BotHandle, Callbacks, Outbound};
use crate::dispatch;
use crate::frame::read_frame_within;
use crate::protocol::{ChatMessage, ClientMessage, FrameHeader, KEEPALIVE_FRAME, ServerMessage, command};

/// What a dispatched message may touch.
pub(crate) struct SessionCtx {
    pub(crate) handle: BotHandle,
    pub(crate) callbacks: Arc<Callbacks>,
    /// Current keepalive period; the challenge handler replaces it.
    pub(crate) keepalive: watch::Sender<Duration>,
    pub(crate) done: CancellationToken,
}

pub(crate) async fn run(stream: TcpStream, handle: BotHandle, callbacks: Arc<Callbacks>) -> Result<()> {
    let (reader, writer) = stream.into_split();
    run_on(BufReader::new(reader), writer, handle, callbacks).await
}

pub(crate) async fn run_on<R, W>(reader: R, writer: W, handle: BotHandle, callbacks: Arc<Callbacks>) -> Result<()>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin + Send + 'static,
{
    let done = handle.inner.stop.child_token();
    let session = handle.inner.session.fetch_add(1, Ordering::SeqCst) + 1;
    handle.inner.auth.send_replace(AuthState::Idle);
    let (keepalive, keepalive_rx) = watch::channel(handle.inner.config.timings.keepalive);

    let ctx = Arc::new(SessionCtx {
        handle: handle.clone(),
        callbacks,
        keepalive,
        done: done.clone(),
    });

    let tasks = [
        ("keepalive", tokio::spawn(keepalive_pump(handle.clone(), keepalive_rx, done.clone()))),
        ("outbound", tokio::spawn(outbound_pump(handle.clone(), writer, session, done.clone()))),
        ("submission", tokio::spawn(submission_pump(handle.clone(), done.clone()))),
    ];

    tracing::info!(session, "Session started");
    let result = read_loop(reader, &ctx).await;
    done.cancel();

    for (name, task) in tasks {
        if let Err(e) = task.await {
            tracing::error!(task = name, "Session task failed: {e}");
        }
    }
    handle.inner.auth.send_replace(AuthState::Disconnected);
    tracing::info!(session, "Connection closed");
    result
}

/// Blocking frame loop. Returns `Ok` when stopped, `Err` on any read failure.
async fn read_loop<R: AsyncRead + Unpin>(mut reader: R, ctx: &Arc<SessionCtx>) -> Result<()> {
    let payload_timeout = ctx.handle.inner.config.timings.payload_timeout;
    let mut handlers = JoinSet::new();
    let result = loop {
        let frame = tokio::select! {
            _ = ctx.done.cancelled() => break Ok(()),
            frame = read_frame_within(&mut reader, payload_timeout) => frame,
        };
        let (header, payload) = match frame {
            Ok(frame) => frame,
            Err(e) => {
                tracing::info!("Error reading: {e}");
                break Err(e.into());
            }
        };

        match ServerMessage::decode(header, &payload) {
            Ok(msg) => {
                tracing::debug!(kind = ?msg.kind(), len = header.length, "Read from server");
                if let Some(msg) = dispatch::in_order(ctx, msg) {
                    let ctx = ctx.clone();
                    handlers.spawn(async move { dispatch::handle(&ctx, msg).await });
                }
            }
            Err(e) => log_undecodable(header, &e),
        }

        while let Some(joined) = handlers.try_join_next() {
            if let Err(e) = joined
                && e.is_panic()
            {
                tracing::error!("Handle error: {e}");
            }
        }
    };
    // Handlers still running belong to a dead connection.
    handlers.shutdown().await;
    result
}

fn log_undecodable(header: FrameHeader, e: &crate::protocol::ProtocolError) {
    tracing::error!(
        kind = %format_args!("0x{:02x}", header.kind),
        len = header.length,
        "Error when unmarshalling payload: {e}"
    );
}

async fn outbound_pump<W: AsyncWrite + Unpin>(handle: BotHandle, mut writer: W, session: u64, done: CancellationToken) {
    let inner = &handle.inner;
    let mut queue = inner.outbound_rx.lock().await;
    let mut carried = inner.unsent.lock().take();
    let mut sent: u64 = 0;
    loop {
        let out = match carried.take() {
            Some(out) => out,
            None => tokio::select! {
                _ = done.cancelled() => break,
                out = queue.recv() => match out {
                    Some(out) => out,
                    None => break,
                },
            },
        };
        if out.is_stale(session) {
            tracing::debug!(kind = ?out.frame.first(), queued_in = ?out.session, "Dropping upload from an earlier session");
            continue;
        }

        tracing::debug!(kind = ?out.frame.first(), len = out.frame.len(), "Sending to server");
        let written = tokio::select! {
            _ = done.cancelled() => None,
            written = write_frame(&mut writer, &out.frame) => Some(written),
        };
        match written {
            Some(Ok(())) => sent += 1,
            Some(Err(e)) => {
                tracing::error!("Error writing to server after {sent} frames: {e}");
                keep_unsent(&handle, out);
                done.cancel();
                break;
            }
            None => {
                keep_unsent(&handle, out);
                break;
            }
        }
    }
    let _ = writer.shutdown().await;
    tracing::debug!(sent, "Outbound pump finished");
}

fn keep_unsent(handle: &BotHandle, out: Outbound) {
    tracing::debug!(kind = ?out.frame.first(), len = out.frame.len(), "Frame not sent, keeping it for the next session");
    *handle.inner.unsent.lock() = Some(out);
}

async fn write_frame<W: AsyncWrite + Unpin>(writer: &mut W, frame: &[u8]) -> std::io::Result<()> {
    writer.write_all(frame).await?;
    writer.flush().await
}

fn new_ticker(period: Duration) -> Interval {
    let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    ticker
}

async fn keepalive_pump(handle: BotHandle, mut period_rx: watch::Receiver<Duration>, done: CancellationToken) {
    let mut ticker = new_ticker(*period_rx.borrow_and_update());
    loop {
        tokio::select! {
            _ = done.cancelled() => break,
            changed = period_rx.changed() => {
                if changed.is_err() {
                    break;
                }
                let period = *period_rx.borrow_and_update();
                tracing::debug!(period_secs = period.as_secs_f32(), "Keepalive period changed");
                ticker = new_ticker(period);
            }
            _ = ticker.tick() => {
                let pending = handle.auth_state().is_pending();
                if pending {
                    tracing::debug!("Keepalive skipped while authenticating");
                    continue;
                }
                tokio::select! {
                    _ = done.cancelled() => break,
                    sent = handle.inner.outbound_tx.send(Outbound::untagged(KEEPALIVE_FRAME.to_vec())) => {
                        if sent.is_err() {
                            break;
                        }
                    }
                }
            }
        }
    }
}

async fn submission_pump(handle: BotHandle, done: CancellationToken) {
    let mut chat = handle.inner.chat_rx.lock().await;
    let mut admin = handle.inner.admin_rx.lock().await;
    loop {
        let (cmd, text) = tokio::select! {
            _ = done.cancelled() => break,
            Some(text) = chat.recv() => (command::MSG, text),
            Some(text) = admin.recv() => (command::ADMIN, text),
            else => break,
        };
        let msg = ClientMessage::Chat(ChatMessage::new(cmd, &[&text]));
        tokio::select! {
            _ = done.cancelled() => break,
            queued = handle.enqueue(msg) => {
                if let Err(e) = queued {
                    tracing::error!("Send message to ninjam failed: {e:#}");
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::{Bot, BotConfig};
    use crate::frame::read_frame;
    use crate::protocol::UploadIntervalBegin;
    use tokio::io::DuplexStream;
    use tokio::task::JoinHandle;

    /// Run a session over an in-memory pipe; returns the server end.
    fn start(handle: &BotHandle, buffer: usize) -> (DuplexStream, JoinHandle<Result<()>>) {
        let (bot_side, server) = tokio::io::duplex(buffer);
        let (reader, writer) = tokio::io::split(bot_side);
        let session = tokio::spawn(run_on(
            BufReader::new(reader),
            writer,
            handle.clone(),
            Arc::new(Callbacks::default()),
        ));
        (server, session)
    }

    async fn next_message(server: &mut DuplexStream) -> ClientMessage {
        let (header, payload) = tokio::time::timeout(Duration::from_secs(5), read_frame(server))
            .await
            .expect("no frame from the session")
            .unwrap();
        ClientMessage::decode(header, &payload).unwrap()
    }

    #[tokio::test]
    async fn uploads_from_an_earlier_session_are_skipped() {
        let bot = Bot::new(BotConfig::new("localhost", 2049, "jambot", ""));
        let handle = bot.handle();
        let stale = ClientMessage::UploadIntervalBegin(UploadIntervalBegin::new([1; 16], 0))
            .to_frame()
            .unwrap();
        handle
            .inner
            .outbound_tx
            .send(Outbound {
                frame: stale,
                session: Some(0),
            })
            .await
            .unwrap();
        handle.channel_init("fresh", 0).await.unwrap();

        let (mut server, session) = start(&handle, 4096);
        let ClientMessage::SetChannelInfo(info) = next_message(&mut server).await else {
            panic!("stale upload went out");
        };
        assert_eq!(info.channels[0].name, "fresh");

        handle.stop();
        session.await.unwrap().unwrap();
        assert_eq!(handle.auth_state(), AuthState::Disconnected);
    }

    #[tokio::test]
    async fn frame_cut_off_by_disconnect_goes_out_next_session() {
        let bot = Bot::new(BotConfig::new("localhost", 2049, "jambot", ""));
        let handle = bot.handle();
        let long = "x".repeat(4096);

        // Nobody reads the tiny pipe, so the write stalls until the peer goes away.
        let (server, session) = start(&handle, 64);
        handle.send_message(&long).await.unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;
        drop(server);
        assert!(session.await.unwrap().is_err());
        assert!(handle.inner.unsent.lock().is_some());
        assert_eq!(handle.auth_state(), AuthState::Disconnected);

        let (mut server, session) = start(&handle, 16 * 1024);
        let ClientMessage::Chat(chat) = next_message(&mut server).await else {
            panic!("expected the interrupted chat");
        };
        assert_eq!(chat.args, [long.as_str()]);
        assert!(handle.inner.unsent.lock().is_none());

        handle.stop();
        session.await.unwrap().unwrap();
    }
}
