use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// The source channel an event was posted in.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelRef {
    pub id: i64,
    pub username: Option<String>,
    pub title: Option<String>,
}

/// Identity of one source message. Message ids are only unique within a
/// channel, so the channel id is part of the key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SourceKey {
    pub channel_id: i64,
    pub message_id: i32,
}

impl SourceKey {
    pub fn new(channel_id: i64, message_id: i32) -> Self {
        Self {
            channel_id,
            message_id,
        }
    }
}

impl fmt::Display for SourceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.channel_id, self.message_id)
    }
}

impl FromStr for SourceKey {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        let (channel, message) = s
            .trim()
            .split_once('/')
            .ok_or_else(|| format!("expected <channel_id>/<message_id>, got '{s}'"))?;
        let channel_id = channel
            .parse()
            .map_err(|e| format!("bad channel id '{channel}': {e}"))?;
        let message_id = message
            .parse()
            .map_err(|e| format!("bad message id '{message}': {e}"))?;
        Ok(Self::new(channel_id, message_id))
    }
}

/// A reference to a file held by the source platform.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteFile {
    pub file_id: String,
    /// Size as declared by the source, before any download.
    pub size: Option<u64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum AttachmentKind {
    Photo,
    Video,
    Document,
    Audio,
}

impl AttachmentKind {
    /// Order in which kinds are laid out in a composed post.
    pub const ALL: [AttachmentKind; 4] = [
        AttachmentKind::Photo,
        AttachmentKind::Video,
        AttachmentKind::Document,
        AttachmentKind::Audio,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Photo => "photo",
            Self::Video => "video",
            Self::Document => "document",
            Self::Audio => "audio",
        }
    }
}

/// What a message carries. Assigned once when the event is built.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Content {
    Text {
        text: String,
    },
    Photo {
        file: RemoteFile,
    },
    Video {
        file: RemoteFile,
        file_name: Option<String>,
    },
    Document {
        file: RemoteFile,
        file_name: Option<String>,
        mime_type: Option<String>,
    },
    Audio {
        file: RemoteFile,
        title: Option<String>,
        performer: Option<String>,
        file_name: Option<String>,
    },
    Unsupported {
        kind: String,
    },
}

impl Content {
    pub fn attachment_kind(&self) -> Option<AttachmentKind> {
        match self {
            Self::Photo { .. } => Some(AttachmentKind::Photo),
            Self::Video { .. } => Some(AttachmentKind::Video),
            Self::Document { .. } => Some(AttachmentKind::Document),
            Self::Audio { .. } => Some(AttachmentKind::Audio),
            Self::Text { .. } | Self::Unsupported { .. } => None,
        }
    }

    pub fn remote_file(&self) -> Option<&RemoteFile> {
        match self {
            Self::Photo { file }
            | Self::Video { file, .. }
            | Self::Document { file, .. }
            | Self::Audio { file, .. } => Some(file),
            Self::Text { .. } | Self::Unsupported { .. } => None,
        }
    }
}

/// Where a forwarded message came from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ForwardOrigin {
    User,
    HiddenUser,
    Chat,
    Channel { channel_id: i64 },
}

impl ForwardOrigin {
    /// Reposts of individual users (or non-channel chats) are not relayed;
    /// channel-to-channel reposts count as native content.
    pub fn is_user_forward(&self) -> bool {
        !matches!(self, Self::Channel { .. })
    }
}

/// One new or edited channel post, as received from the source.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundEvent {
    pub channel: ChannelRef,
    pub message_id: i32,
    pub content: Content,
    pub caption: Option<String>,
    pub media_group_id: Option<String>,
    pub forward: Option<ForwardOrigin>,
    pub edited: bool,
    pub date: DateTime<Utc>,
}

impl InboundEvent {
    pub fn key(&self) -> SourceKey {
        SourceKey::new(self.channel.id, self.message_id)
    }

    pub fn is_user_forward(&self) -> bool {
        self.forward
            .as_ref()
            .map_or(false, ForwardOrigin::is_user_forward)
    }

    /// Message text for text posts, caption for media posts.
    pub fn body(&self) -> Option<&str> {
        match &self.content {
            Content::Text { text } => Some(text.as_str()),
            _ => self.caption.as_deref(),
        }
        .filter(|s| !s.trim().is_empty())
    }
}
