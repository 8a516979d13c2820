//! NINJAM wire codec.
//!
//! Every frame is a 5-byte header followed by the payload:
//!
//! ```text
//! +----------+-------------------+------------------+
//! | type u8  | length u32 (LE)   | payload          |
//! +----------+-------------------+------------------+
//! ```
//!
//! Payload integers are little-endian and strings are NUL-terminated.
//! The codec is symmetric: server messages can be encoded and client
//! messages decoded, which is what the test harness relies on to play the
//! server side of a session.

mod messages;
mod wire;

pub use messages::*;

use wire::{PayloadReader, PayloadWriter};

/// Size of the frame header on the wire.
pub const HEADER_LEN: usize = 5;

/// Largest payload we are willing to allocate for.
pub const MAX_PAYLOAD_LEN: u32 = 16 * 1024 * 1024;

/// A complete keepalive frame.
pub const KEEPALIVE_FRAME: [u8; HEADER_LEN] = [MessageType::Keepalive as u8, 0, 0, 0, 0];

/// Chat command vocabulary (first field of a chat payload).
pub mod command {
    pub const MSG: &str = "MSG";
    pub const ADMIN: &str = "ADMIN";
    pub const JOIN: &str = "JOIN";
    pub const PART: &str = "PART";
}

/// Codec errors. None of these are fatal to a session on their own.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ProtocolError {
    #[error("payload truncated at offset {offset} ({needed} more bytes needed)")]
    Truncated { offset: usize, needed: usize },

    #[error("unterminated string at offset {offset}")]
    UnterminatedString { offset: usize },

    #[error("unknown message type 0x{0:02x}")]
    UnknownType(u8),

    #[error("message type {0:?} cannot be decoded in this direction")]
    WrongDirection(MessageType),

    #[error("string field contains an interior NUL byte")]
    InteriorNul,

    #[error("payload of {0} bytes exceeds the frame limit")]
    PayloadTooLarge(usize),
}

/// Message type byte.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageType {
    ServerAuthChallenge = 0x00,
    ServerAuthReply = 0x01,
    ServerConfigChangeNotify = 0x02,
    ServerUserInfoChangeNotify = 0x03,
    ServerDownloadIntervalBegin = 0x04,
    ServerDownloadIntervalWrite = 0x05,
    ClientAuthUser = 0x80,
    ClientSetUserMask = 0x81,
    ClientSetChannelInfo = 0x82,
    ClientUploadIntervalBegin = 0x83,
    ClientUploadIntervalWrite = 0x84,
    ChatMessage = 0xc0,
    Keepalive = 0xfd,
}

impl TryFrom<u8> for MessageType {
    type Error = ProtocolError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        Ok(match value {
            0x00 => Self::ServerAuthChallenge,
            0x01 => Self::ServerAuthReply,
            0x02 => Self::ServerConfigChangeNotify,
            0x03 => Self::ServerUserInfoChangeNotify,
            0x04 => Self::ServerDownloadIntervalBegin,
            0x05 => Self::ServerDownloadIntervalWrite,
            0x80 => Self::ClientAuthUser,
            0x81 => Self::ClientSetUserMask,
            0x82 => Self::ClientSetChannelInfo,
            0x83 => Self::ClientUploadIntervalBegin,
            0x84 => Self::ClientUploadIntervalWrite,
            0xc0 => Self::ChatMessage,
            0xfd => Self::Keepalive,
            other => return Err(ProtocolError::UnknownType(other)),
        })
    }
}

/// Decoded frame header. `kind` stays raw so frames of unknown type can
/// still be skipped without losing stream sync.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    pub kind: u8,
    pub length: u32,
}

impl FrameHeader {
    pub fn decode(bytes: &[u8; HEADER_LEN]) -> Self {
        Self {
            kind: bytes[0],
            length: u32::from_le_bytes([bytes[1], bytes[2], bytes[3], bytes[4]]),
        }
    }

    pub fn encode(&self) -> [u8; HEADER_LEN] {
        let len = self.length.to_le_bytes();
        [self.kind, len[0], len[1], len[2], len[3]]
    }
}

/// Prefix `payload` with its header.
fn frame(kind: MessageType, payload: Vec<u8>) -> Result<Vec<u8>, ProtocolError> {
    let length = u32::try_from(payload.len())
        .ok()
        .filter(|len| *len <= MAX_PAYLOAD_LEN)
        .ok_or(ProtocolError::PayloadTooLarge(payload.len()))?;
    let mut out = Vec::with_capacity(HEADER_LEN + payload.len());
    out.extend_from_slice(&FrameHeader { kind: kind as u8, length }.encode());
    out.extend_from_slice(&payload);
    Ok(out)
}

/// Messages the server sends us.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServerMessage {
    AuthChallenge(AuthChallenge),
    AuthReply(AuthReply),
    ConfigChange(ConfigChange),
    UserInfoChange(Vec<UserInfo>),
    DownloadIntervalBegin(DownloadIntervalBegin),
    DownloadIntervalWrite(IntervalWrite),
    Chat(ChatMessage),
    Keepalive,
}

impl ServerMessage {
    pub fn kind(&self) -> MessageType {
        match self {
            Self::AuthChallenge(_) => MessageType::ServerAuthChallenge,
            Self::AuthReply(_) => MessageType::ServerAuthReply,
            Self::ConfigChange(_) => MessageType::ServerConfigChangeNotify,
            Self::UserInfoChange(_) => MessageType::ServerUserInfoChangeNotify,
            Self::DownloadIntervalBegin(_) => MessageType::ServerDownloadIntervalBegin,
            Self::DownloadIntervalWrite(_) => MessageType::ServerDownloadIntervalWrite,
            Self::Chat(_) => MessageType::ChatMessage,
            Self::Keepalive => MessageType::Keepalive,
        }
    }

    /// Decode the payload of a frame whose header has already been read.
    pub fn decode(header: FrameHeader, payload: &[u8]) -> Result<Self, ProtocolError> {
        let mut r = PayloadReader::new(payload);
        let msg = match MessageType::try_from(header.kind)? {
            MessageType::ServerAuthChallenge => Self::AuthChallenge(AuthChallenge::decode(&mut r)?),
            MessageType::ServerAuthReply => Self::AuthReply(AuthReply::decode(&mut r)?),
            MessageType::ServerConfigChangeNotify => Self::ConfigChange(ConfigChange::decode(&mut r)?),
            MessageType::ServerUserInfoChangeNotify => Self::UserInfoChange(UserInfo::decode_all(&mut r)?),
            MessageType::ServerDownloadIntervalBegin => {
                Self::DownloadIntervalBegin(DownloadIntervalBegin::decode(&mut r)?)
            }
            MessageType::ServerDownloadIntervalWrite => {
                Self::DownloadIntervalWrite(IntervalWrite::decode(&mut r)?)
            }
            MessageType::ChatMessage => Self::Chat(ChatMessage::decode(&mut r)?),
            MessageType::Keepalive => Self::Keepalive,
            other => return Err(ProtocolError::WrongDirection(other)),
        };
        Ok(msg)
    }

    /// Header plus payload, ready for the socket.
    pub fn to_frame(&self) -> Result<Vec<u8>, ProtocolError> {
        let mut w = PayloadWriter::new();
        match self {
            Self::AuthChallenge(m) => m.encode(&mut w)?,
            Self::AuthReply(m) => m.encode(&mut w)?,
            Self::ConfigChange(m) => m.encode(&mut w),
            Self::UserInfoChange(users) => {
                for user in users {
                    user.encode(&mut w)?;
                }
            }
            Self::DownloadIntervalBegin(m) => m.encode(&mut w)?,
            Self::DownloadIntervalWrite(m) => m.encode(&mut w),
            Self::Chat(m) => m.encode(&mut w)?,
            Self::Keepalive => {}
        }
        frame(self.kind(), w.finish())
    }
}

/// Messages we send to the server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientMessage {
    AuthUser(AuthUser),
    SetChannelInfo(SetChannelInfo),
    UploadIntervalBegin(UploadIntervalBegin),
    UploadIntervalWrite(IntervalWrite),
    Chat(ChatMessage),
    Keepalive,
}

impl ClientMessage {
    pub fn kind(&self) -> MessageType {
        match self {
            Self::AuthUser(_) => MessageType::ClientAuthUser,
            Self::SetChannelInfo(_) => MessageType::ClientSetChannelInfo,
            Self::UploadIntervalBegin(_) => MessageType::ClientUploadIntervalBegin,
            Self::UploadIntervalWrite(_) => MessageType::ClientUploadIntervalWrite,
            Self::Chat(_) => MessageType::ChatMessage,
            Self::Keepalive => MessageType::Keepalive,
        }
    }

    pub fn decode(header: FrameHeader, payload: &[u8]) -> Result<Self, ProtocolError> {
        let mut r = PayloadReader::new(payload);
        let msg = match MessageType::try_from(header.kind)? {
            MessageType::ClientAuthUser => Self::AuthUser(AuthUser::decode(&mut r)?),
            MessageType::ClientSetChannelInfo => Self::SetChannelInfo(SetChannelInfo::decode(&mut r)?),
            MessageType::ClientUploadIntervalBegin => {
                Self::UploadIntervalBegin(UploadIntervalBegin::decode(&mut r)?)
            }
            MessageType::ClientUploadIntervalWrite => {
                Self::UploadIntervalWrite(IntervalWrite::decode(&mut r)?)
            }
            MessageType::ChatMessage => Self::Chat(ChatMessage::decode(&mut r)?),
            MessageType::Keepalive => Self::Keepalive,
            other => return Err(ProtocolError::WrongDirection(other)),
        };
        Ok(msg)
    }

    pub fn to_frame(&self) -> Result<Vec<u8>, ProtocolError> {
        let mut w = PayloadWriter::new();
        match self {
            Self::AuthUser(m) => m.encode(&mut w)?,
            Self::SetChannelInfo(m) => m.encode(&mut w)?,
            Self::UploadIntervalBegin(m) => m.encode(&mut w),
            Self::UploadIntervalWrite(m) => m.encode(&mut w),
            Self::Chat(m) => m.encode(&mut w)?,
            Self::Keepalive => {}
        }
        frame(self.kind(), w.finish())
    }
}

/// Split a complete frame into header and payload. Test and tooling helper;
/// the session reader works on the stream directly.
pub fn split_frame(frame: &[u8]) -> Option<(FrameHeader, &[u8])> {
    let header: &[u8; HEADER_LEN] = frame.get(..HEADER_LEN)?.try_into().ok()?;
    let header = FrameHeader::decode(header);
    let payload = frame.get(HEADER_LEN..)?;
    (payload.len() == header.length as usize).then_some((header, payload))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn decode_server(frame: &[u8]) -> ServerMessage {
        let (header, payload) = split_frame(frame).expect("well-formed frame");
        ServerMessage::decode(header, payload).unwrap()
    }

    fn decode_client(frame: &[u8]) -> ClientMessage {
        let (header, payload) = split_frame(frame).expect("well-formed frame");
        ClientMessage::decode(header, payload).unwrap()
    }

    #[test]
    fn header_is_type_then_le_length() {
        let h = FrameHeader::decode(&[0xc0, 0x10, 0x02, 0x00, 0x00]);
        assert_eq!(h, FrameHeader { kind: 0xc0, length: 0x210 });
        assert_eq!(h.encode(), [0xc0, 0x10, 0x02, 0x00, 0x00]);
    }

    #[test]
    fn keepalive_frame_matches_encoder() {
        assert_eq!(ClientMessage::Keepalive.to_frame().unwrap(), KEEPALIVE_FRAME);
        assert_eq!(KEEPALIVE_FRAME, [0xfd, 0, 0, 0, 0]);
    }

    #[test]
    fn challenge_exposes_caps() {
        let challenge = AuthChallenge {
            challenge: [1, 2, 3, 4, 5, 6, 7, 8],
            server_caps: (30 << 8) | SERVER_CAP_LICENSE,
            protocol_version: 0x0002_0000,
            license: Some("be nice".into()),
        };
        let decoded = decode_server(&ServerMessage::AuthChallenge(challenge.clone()).to_frame().unwrap());
        let ServerMessage::AuthChallenge(decoded) = decoded else {
            panic!("expected challenge, got {decoded:?}");
        };
        assert_eq!(decoded, challenge);
        assert!(decoded.has_agreement());
        assert_eq!(decoded.keepalive_interval(), Some(std::time::Duration::from_secs(30)));
    }

    #[test]
    fn challenge_without_keepalive_hint() {
        let challenge = AuthChallenge {
            challenge: [0; 8],
            server_caps: 0,
            protocol_version: 0x0002_0000,
            license: None,
        };
        assert!(!challenge.has_agreement());
        assert_eq!(challenge.keepalive_interval(), None);
    }

    #[test]
    fn auth_reply_tolerates_missing_trailer() {
        let reply = ServerMessage::decode(FrameHeader { kind: 0x01, length: 1 }, &[0x01]).unwrap();
        assert_eq!(
            reply,
            ServerMessage::AuthReply(AuthReply {
                flag: 1,
                message: String::new(),
                max_channels: None,
            })
        );
    }

    #[test]
    fn user_info_list_decodes_every_entry() {
        let users = vec![
            UserInfo {
                active: true,
                channel_index: 0,
                volume: 0,
                pan: -3,
                flags: 0,
                name: "alice@1.2.3.x".into(),
                channel_name: "guitar".into(),
            },
            UserInfo {
                active: false,
                channel_index: 1,
                volume: -12,
                pan: 0,
                flags: 2,
                name: "bob@4.5.6.x".into(),
                channel_name: "voice".into(),
            },
        ];
        let frame = ServerMessage::UserInfoChange(users.clone()).to_frame().unwrap();
        assert_eq!(decode_server(&frame), ServerMessage::UserInfoChange(users));
    }

    #[test]
    fn chat_arguments_are_one_based() {
        let msg = ChatMessage::new(command::MSG, &["alice", "hello there"]);
        assert_eq!(msg.arg(1), "alice");
        assert_eq!(msg.arg(2), "hello there");
        assert_eq!(msg.arg(3), "");
        assert_eq!(msg.arg(0), "");
    }

    #[test]
    fn outbound_chat_carries_only_text() {
        let frame = ClientMessage::Chat(ChatMessage::new(command::MSG, &["hello"]))
            .to_frame()
            .unwrap();
        assert_eq!(frame[0], 0xc0);
        assert_eq!(&frame[HEADER_LEN..], b"MSG\0hello\0");
    }

    #[test]
    fn channel_info_layout() {
        let info = SetChannelInfo {
            channels: vec![ChannelInfo {
                name: "bot".into(),
                volume: 0x0102,
                pan: -1,
                flags: 2,
            }],
        };
        let frame = ClientMessage::SetChannelInfo(info.clone()).to_frame().unwrap();
        assert_eq!(&frame[HEADER_LEN..], &[4, 0, b'b', b'o', b't', 0, 0x02, 0x01, 0xff, 2]);
        assert_eq!(decode_client(&frame), ClientMessage::SetChannelInfo(info));
    }

    #[test]
    fn upload_interval_write_keeps_audio_verbatim() {
        let write = IntervalWrite {
            guid: [7; 16],
            flags: 1,
            audio: vec![0, 1, 2, 0, 255],
        };
        let frame = ClientMessage::UploadIntervalWrite(write.clone()).to_frame().unwrap();
        assert_eq!(frame.len(), HEADER_LEN + 16 + 1 + 5);
        assert_eq!(decode_client(&frame), ClientMessage::UploadIntervalWrite(write));
    }

    #[test]
    fn unknown_type_is_reported() {
        let err = ServerMessage::decode(FrameHeader { kind: 0x42, length: 0 }, &[]).unwrap_err();
        assert_eq!(err, ProtocolError::UnknownType(0x42));
    }

    #[test]
    fn client_types_rejected_on_server_side() {
        let err = ServerMessage::decode(FrameHeader { kind: 0x80, length: 0 }, &[]).unwrap_err();
        assert_eq!(err, ProtocolError::WrongDirection(MessageType::ClientAuthUser));
    }

    #[test]
    fn split_frame_rejects_length_mismatch() {
        assert!(split_frame(&[0xc0, 4, 0, 0, 0, b'M', b'S']).is_none());
        assert!(split_frame(&[0xfd, 0, 0]).is_none());
    }
}
