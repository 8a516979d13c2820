//! Typed payloads for every NINJAM message this client speaks.

use std::time::Duration;

use serde::Serialize;

use super::ProtocolError;
use super::wire::{PayloadReader, PayloadWriter};

/// Interval identifier shared by the upload/download messages.
pub type Guid = [u8; 16];

/// Server capability bit: a license agreement string follows the challenge.
pub const SERVER_CAP_LICENSE: u32 = 0x1;

/// Client capability bit: the user agreed to the server license.
pub const CLIENT_CAP_AGREE: u32 = 0x1;

/// Protocol version announced in the login frame.
pub const CLIENT_VERSION: u32 = 0x0002_0000;

/// Default codec tag for uploaded intervals (Ogg Vorbis).
pub const FOURCC_OGG_VORBIS: [u8; 4] = *b"OGGv";

/// Server → client, starts the login handshake.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthChallenge {
    pub challenge: [u8; 8],
    pub server_caps: u32,
    pub protocol_version: u32,
    pub license: Option<String>,
}

impl AuthChallenge {
    /// Whether the server asks us to accept a license agreement.
    pub fn has_agreement(&self) -> bool {
        self.server_caps & SERVER_CAP_LICENSE != 0
    }

    /// Keepalive period the server wants, if it stated one.
    pub fn keepalive_interval(&self) -> Option<Duration> {
        match (self.server_caps >> 8) & 0xff {
            0 => None,
            secs => Some(Duration::from_secs(u64::from(secs))),
        }
    }

    pub(crate) fn decode(r: &mut PayloadReader<'_>) -> Result<Self, ProtocolError> {
        let challenge = r.array()?;
        let server_caps = r.u32()?;
        let protocol_version = r.u32()?;
        let license = if server_caps & SERVER_CAP_LICENSE != 0 {
            Some(r.cstring()?)
        } else {
            None
        };
        Ok(Self {
            challenge,
            server_caps,
            protocol_version,
            license,
        })
    }

    pub(crate) fn encode(&self, w: &mut PayloadWriter) -> Result<(), ProtocolError> {
        w.bytes(&self.challenge)
            .u32(self.server_caps)
            .u32(self.protocol_version);
        if self.has_agreement() {
            w.cstring(self.license.as_deref().unwrap_or_default())?;
        }
        Ok(())
    }
}

/// Server → client, outcome of a login attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthReply {
    pub flag: u8,
    /// Error text on failure, sometimes the server's greeting on success.
    pub message: String,
    pub max_channels: Option<u8>,
}

impl AuthReply {
    pub fn success(&self) -> bool {
        self.flag & 0x1 != 0
    }

    pub(crate) fn decode(r: &mut PayloadReader<'_>) -> Result<Self, ProtocolError> {
        let flag = r.u8()?;
        let message = if r.is_empty() { String::new() } else { r.cstring()? };
        let max_channels = if r.is_empty() { None } else { Some(r.u8()?) };
        Ok(Self {
            flag,
            message,
            max_channels,
        })
    }

    pub(crate) fn encode(&self, w: &mut PayloadWriter) -> Result<(), ProtocolError> {
        w.u8(self.flag).cstring(&self.message)?;
        if let Some(max) = self.max_channels {
            w.u8(max);
        }
        Ok(())
    }
}

/// Server → client, tempo change.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConfigChange {
    pub bpm: u16,
    pub bpi: u16,
}

impl ConfigChange {
    pub(crate) fn decode(r: &mut PayloadReader<'_>) -> Result<Self, ProtocolError> {
        Ok(Self {
            bpm: r.u16()?,
            bpi: r.u16()?,
        })
    }

    pub(crate) fn encode(&self, w: &mut PayloadWriter) {
        w.u16(self.bpm).u16(self.bpi);
    }
}

/// One entry of a user-info change notification.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct UserInfo {
    pub active: bool,
    pub channel_index: u8,
    pub volume: i16,
    pub pan: i8,
    pub flags: u8,
    pub name: String,
    pub channel_name: String,
}

impl UserInfo {
    pub(crate) fn decode_all(r: &mut PayloadReader<'_>) -> Result<Vec<Self>, ProtocolError> {
        let mut users = Vec::new();
        while !r.is_empty() {
            users.push(Self {
                active: r.u8()? & 0x1 != 0,
                channel_index: r.u8()?,
                volume: r.i16()?,
                pan: r.i8()?,
                flags: r.u8()?,
                name: r.cstring()?,
                channel_name: r.cstring()?,
            });
        }
        Ok(users)
    }

    pub(crate) fn encode(&self, w: &mut PayloadWriter) -> Result<(), ProtocolError> {
        w.u8(u8::from(self.active))
            .u8(self.channel_index)
            .i16(self.volume)
            .i8(self.pan)
            .u8(self.flags)
            .cstring(&self.name)?
            .cstring(&self.channel_name)?;
        Ok(())
    }
}

/// Server → client, another user started an interval.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DownloadIntervalBegin {
    pub guid: Guid,
    pub estimated_size: u32,
    pub fourcc: [u8; 4],
    pub channel_index: u8,
    pub user_name: String,
}

impl DownloadIntervalBegin {
    pub(crate) fn decode(r: &mut PayloadReader<'_>) -> Result<Self, ProtocolError> {
        Ok(Self {
            guid: r.array()?,
            estimated_size: r.u32()?,
            fourcc: r.array()?,
            channel_index: r.u8()?,
            user_name: r.cstring()?,
        })
    }

    pub(crate) fn encode(&self, w: &mut PayloadWriter) -> Result<(), ProtocolError> {
        w.bytes(&self.guid)
            .u32(self.estimated_size)
            .bytes(&self.fourcc)
            .u8(self.channel_index)
            .cstring(&self.user_name)?;
        Ok(())
    }
}

/// Audio block of an interval, in either direction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IntervalWrite {
    pub guid: Guid,
    pub flags: u8,
    pub audio: Vec<u8>,
}

impl IntervalWrite {
    pub(crate) fn decode(r: &mut PayloadReader<'_>) -> Result<Self, ProtocolError> {
        Ok(Self {
            guid: r.array()?,
            flags: r.u8()?,
            audio: r.rest(),
        })
    }

    pub(crate) fn encode(&self, w: &mut PayloadWriter) {
        w.bytes(&self.guid).u8(self.flags).bytes(&self.audio);
    }
}

/// Chat frame: a command plus up to four arguments.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChatMessage {
    pub command: String,
    pub args: Vec<String>,
}

impl ChatMessage {
    pub fn new(command: &str, args: &[&str]) -> Self {
        Self {
            command: command.to_string(),
            args: args.iter().map(|s| s.to_string()).collect(),
        }
    }

    /// Argument `n` (1-based, as the protocol numbers them); empty if absent.
    pub fn arg(&self, n: usize) -> &str {
        n.checked_sub(1)
            .and_then(|i| self.args.get(i))
            .map(String::as_str)
            .unwrap_or("")
    }

    pub(crate) fn decode(r: &mut PayloadReader<'_>) -> Result<Self, ProtocolError> {
        let command = r.cstring()?;
        let mut args = Vec::new();
        while !r.is_empty() && args.len() < 4 {
            args.push(r.cstring()?);
        }
        Ok(Self { command, args })
    }

    pub(crate) fn encode(&self, w: &mut PayloadWriter) -> Result<(), ProtocolError> {
        w.cstring(&self.command)?;
        for arg in self.args.iter().take(4) {
            w.cstring(arg)?;
        }
        Ok(())
    }
}

/// Client → server login.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthUser {
    pub password_hash: [u8; 20],
    pub user_name: String,
    pub client_caps: u32,
    pub client_version: u32,
}

impl AuthUser {
    pub(crate) fn decode(r: &mut PayloadReader<'_>) -> Result<Self, ProtocolError> {
        Ok(Self {
            password_hash: r.array()?,
            user_name: r.cstring()?,
            client_caps: r.u32()?,
            client_version: r.u32()?,
        })
    }

    pub(crate) fn encode(&self, w: &mut PayloadWriter) -> Result<(), ProtocolError> {
        w.bytes(&self.password_hash)
            .cstring(&self.user_name)?
            .u32(self.client_caps)
            .u32(self.client_version);
        Ok(())
    }
}

/// One locally announced channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelInfo {
    pub name: String,
    pub volume: i16,
    pub pan: i8,
    /// 0 interval based, 2 voice chat, 4 session mode.
    pub flags: u8,
}

/// Per-channel parameter block size announced ahead of the channel list.
const CHANNEL_PARAM_SIZE: u16 = 4;

/// Client → server, the complete list of local channels.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SetChannelInfo {
    pub channels: Vec<ChannelInfo>,
}

impl SetChannelInfo {
    pub(crate) fn decode(r: &mut PayloadReader<'_>) -> Result<Self, ProtocolError> {
        let param_size = r.u16()?;
        let mut channels = Vec::new();
        while !r.is_empty() {
            let name = r.cstring()?;
            let volume = r.i16()?;
            let pan = r.i8()?;
            let flags = r.u8()?;
            // Newer peers may append parameters we don't know about.
            for _ in CHANNEL_PARAM_SIZE..param_size {
                r.u8()?;
            }
            channels.push(ChannelInfo {
                name,
                volume,
                pan,
                flags,
            });
        }
        Ok(Self { channels })
    }

    pub(crate) fn encode(&self, w: &mut PayloadWriter) -> Result<(), ProtocolError> {
        w.u16(CHANNEL_PARAM_SIZE);
        for ch in &self.channels {
            w.cstring(&ch.name)?.i16(ch.volume).i8(ch.pan).u8(ch.flags);
        }
        Ok(())
    }
}

/// Client → server, announces an interval on one of our channels.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadIntervalBegin {
    pub guid: Guid,
    pub estimated_size: u32,
    pub fourcc: [u8; 4],
    pub channel_index: u8,
}

impl UploadIntervalBegin {
    pub fn new(guid: Guid, channel_index: u8) -> Self {
        Self {
            guid,
            estimated_size: 0,
            fourcc: FOURCC_OGG_VORBIS,
            channel_index,
        }
    }

    pub(crate) fn decode(r: &mut PayloadReader<'_>) -> Result<Self, ProtocolError> {
        Ok(Self {
            guid: r.array()?,
            estimated_size: r.u32()?,
            fourcc: r.array()?,
            channel_index: r.u8()?,
        })
    }

    pub(crate) fn encode(&self, w: &mut PayloadWriter) {
        w.bytes(&self.guid)
            .u32(self.estimated_size)
            .bytes(&self.fourcc)
            .u8(self.channel_index);
    }
}
