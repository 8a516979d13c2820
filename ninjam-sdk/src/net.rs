//! TCP dialing with connect timeout, long-lived keep-alive and retry.

use std::time::Duration;

use anyhow::{Context, Result};
use socket2::{SockRef, TcpKeepalive};
use tokio::net::TcpStream;
use tokio_util::sync::CancellationToken;

use crate::client::{BotConfig, Timings};

/// One connection attempt.
pub async fn dial(host: &str, port: u16, connect_timeout: Duration, keepalive: Duration) -> Result<TcpStream> {
    tracing::info!(host, port, "Connecting to NINJAM server");
    let stream = tokio::time::timeout(connect_timeout, TcpStream::connect((host, port)))
        .await
        .map_err(|_| anyhow::anyhow!("connect to {host}:{port} timed out after {connect_timeout:?}"))?
        .with_context(|| format!("TCP connect to {host}:{port} failed"))?;

    stream.set_nodelay(true)?;
    SockRef::from(&stream).set_tcp_keepalive(&TcpKeepalive::new().with_time(keepalive))?;

    tracing::info!(host, port, "Connected");
    Ok(stream)
}

/// Dial until it works or `stop` fires. Returns `None` only when stopped.
pub async fn dial_with_retry(config: &BotConfig, stop: &CancellationToken) -> Option<TcpStream> {
    let Timings {
        connect_timeout,
        tcp_keepalive,
        dial_retry_delay,
        ..
    } = config.timings;

    let mut attempt = 0u32;
    loop {
        if stop.is_cancelled() {
            return None;
        }
        attempt += 1;
        let result = tokio::select! {
            _ = stop.cancelled() => return None,
            result = dial(&config.host, config.port, connect_timeout, tcp_keepalive) => result,
        };
        match result {
            Ok(stream) => return Some(stream),
            Err(e) => {
                tracing::warn!(
                    error = %format!("{e:#}"),
                    attempt,
                    delay_secs = dial_retry_delay.as_secs_f32(),
                    "Connection failed, retrying"
                );
            }
        }
        tokio::select! {
            _ = stop.cancelled() => return None,
            _ = tokio::time::sleep(dial_retry_delay) => {}
        }
    }
}
