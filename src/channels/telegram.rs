use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use futures::StreamExt;
use teloxide::net::default_reqwest_settings;
use teloxide::payloads::GetUpdatesSetters;
use teloxide::requests::Requester;
use teloxide::types::{AllowedUpdate, MediaKind, Message, MessageKind, MessageOrigin, UpdateKind};
use teloxide::Bot;
use tokio::io::AsyncWriteExt;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::channels::{AttachmentFetcher, EventSource};
use crate::config::TelegramConfig;
use crate::error::{CrosspostError, Result};
use crate::event::{ChannelRef, Content, ForwardOrigin, InboundEvent, RemoteFile};

const DEFAULT_API_URL: &str = "https://api.telegram.org";

fn build_bot(config: &TelegramConfig) -> Result<Bot> {
    let token = config
        .bot_token
        .as_deref()
        .filter(|t| !t.is_empty())
        .ok_or_else(|| CrosspostError::Channel("Telegram bot_token is required".to_string()))?;

    // Default teloxide client has a 17s timeout, too short for long-poll.
    let client = default_reqwest_settings()
        .timeout(std::time::Duration::from_secs(
            u64::from(config.poll_timeout_secs) + 30,
        ))
        .build()
        .map_err(|e| CrosspostError::Channel(format!("Failed to build HTTP client: {e}")))?;

    let mut bot = Bot::with_client(token, client);
    if let Some(api_url) = &config.api_url {
        let url = url::Url::parse(api_url)
            .map_err(|e| CrosspostError::Config(format!("Invalid telegram.api_url: {e}")))?;
        bot = bot.set_api_url(url);
    }
    Ok(bot)
}

// ---------------------------------------------------------------------------
// Event source
// ---------------------------------------------------------------------------

/// Long-polls the Bot API for channel posts and their edits.
pub struct TelegramSource {
    config: TelegramConfig,
    bot: Bot,
    running: Arc<AtomicBool>,
}

impl TelegramSource {
    pub fn new(config: TelegramConfig) -> Result<Self> {
        let bot = build_bot(&config)?;
        Ok(Self {
            config,
            bot,
            running: Arc::new(AtomicBool::new(false)),
        })
    }
}

#[async_trait]
impl EventSource for TelegramSource {
    fn name(&self) -> &str {
        "telegram"
    }

    async fn start(&self, inbound_tx: mpsc::Sender<InboundEvent>) -> Result<()> {
        self.running.store(true, Ordering::SeqCst);
        let mut offset: i32 = 0;
        info!("Telegram source polling for channel posts");

        while self.running.load(Ordering::SeqCst) {
            let updates = match self
                .bot
                .get_updates()
                .offset(offset)
                .timeout(self.config.poll_timeout_secs)
                .allowed_updates(vec![AllowedUpdate::ChannelPost, AllowedUpdate::EditedChannelPost])
                .await
            {
                Ok(updates) => updates,
                Err(e) => {
                    warn!("Telegram getUpdates error: {e}");
                    tokio::time::sleep(std::time::Duration::from_secs(5)).await;
                    continue;
                }
            };

            for update in updates {
                offset = update.id.0 as i32 + 1;

                let (message, edited) = match update.kind {
                    UpdateKind::ChannelPost(message) => (message, false),
                    UpdateKind::EditedChannelPost(message) => (message, true),
                    _ => continue,
                };

                let event = convert_message(&message, edited);
                debug!(
                    channel_id = event.channel.id,
                    message_id = event.message_id,
                    edited,
                    "channel post received"
                );

                if inbound_tx.send(event).await.is_err() {
                    error!("Event pipeline closed, stopping Telegram source");
                    self.running.store(false, Ordering::SeqCst);
                    break;
                }
            }
        }

        Ok(())
    }

    async fn stop(&self) -> Result<()> {
        self.running.store(false, Ordering::SeqCst);
        info!("Telegram source stopped");
        Ok(())
    }
}

/// Build the immutable event for a channel post. Content kind is decided
/// here, once.
pub fn convert_message(message: &Message, edited: bool) -> InboundEvent {
    let channel = ChannelRef {
        id: message.chat.id.0,
        username: message.chat.username().map(String::from),
        title: message.chat.title().map(String::from),
    };

    let forward = message.forward_origin().map(|origin| match origin {
        MessageOrigin::User { .. } => ForwardOrigin::User,
        MessageOrigin::HiddenUser { .. } => ForwardOrigin::HiddenUser,
        MessageOrigin::Chat { .. } => ForwardOrigin::Chat,
        MessageOrigin::Channel { chat, .. } => ForwardOrigin::Channel {
            channel_id: chat.id.0,
        },
    });

    InboundEvent {
        channel,
        message_id: message.id.0,
        content: content_of(message),
        caption: message.caption().map(String::from),
        media_group_id: message.media_group_id().map(|id| id.to_string()),
        forward,
        edited,
        date: message.date,
    }
}

fn content_of(message: &Message) -> Content {
    let MessageKind::Common(common) = &message.kind else {
        return Content::Unsupported {
            kind: "service".to_string(),
        };
    };

    match &common.media_kind {
        MediaKind::Text(t) => Content::Text {
            text: t.text.clone(),
        },
        // The last size is the largest.
        MediaKind::Photo(p) => match p.photo.last() {
            Some(size) => Content::Photo {
                file: RemoteFile {
                    file_id: size.file.id.to_string(),
                    size: Some(u64::from(size.file.size)),
                },
            },
            None => Content::Unsupported {
                kind: "photo".to_string(),
            },
        },
        MediaKind::Video(v) => Content::Video {
            file: RemoteFile {
                file_id: v.video.file.id.to_string(),
                size: Some(u64::from(v.video.file.size)),
            },
            file_name: v.video.file_name.clone(),
        },
        MediaKind::Document(d) => Content::Document {
            file: RemoteFile {
                file_id: d.document.file.id.to_string(),
                size: Some(u64::from(d.document.file.size)),
            },
            file_name: d.document.file_name.clone(),
            mime_type: d.document.mime_type.as_ref().map(|m| m.to_string()),
        },
        MediaKind::Audio(a) => Content::Audio {
            file: RemoteFile {
                file_id: a.audio.file.id.to_string(),
                size: Some(u64::from(a.audio.file.size)),
            },
            title: a.audio.title.clone(),
            performer: a.audio.performer.clone(),
            file_name: a.audio.file_name.clone(),
        },
        other => Content::Unsupported {
            kind: media_kind_name(other).to_string(),
        },
    }
}

fn media_kind_name(kind: &MediaKind) -> &'static str {
    match kind {
        MediaKind::Animation(_) => "animation",
        MediaKind::Contact(_) => "contact",
        MediaKind::Game(_) => "game",
        MediaKind::Location(_) => "location",
        MediaKind::Poll(_) => "poll",
        MediaKind::Sticker(_) => "sticker",
        MediaKind::Venue(_) => "venue",
        MediaKind::VideoNote(_) => "video note",
        MediaKind::Voice(_) => "voice",
        _ => "other",
    }
}

// ---------------------------------------------------------------------------
// Attachment fetcher
// ---------------------------------------------------------------------------

/// Downloads files through `getFile` and the Bot API file endpoint.
pub struct TelegramFetcher {
    bot: Bot,
    http: reqwest::Client,
    file_base: String,
}

impl TelegramFetcher {
    pub fn new(config: &TelegramConfig) -> Result<Self> {
        let bot = build_bot(config)?;
        let api = config
            .api_url
            .as_deref()
            .unwrap_or(DEFAULT_API_URL)
            .trim_end_matches('/');
        let file_base = format!("{api}/file/bot{}", bot.token());
        Ok(Self {
            bot,
            http: reqwest::Client::new(),
            file_base,
        })
    }
}

#[async_trait]
impl AttachmentFetcher for TelegramFetcher {
    async fn fetch(&self, file: &RemoteFile, dest: &Path) -> Result<u64> {
        let meta = self.bot.get_file(file.file_id.clone()).await?;
        let url = format!("{}/{}", self.file_base, meta.path);

        let resp = self.http.get(&url).send().await?;
        if !resp.status().is_success() {
            return Err(CrosspostError::TransientIo(format!(
                "file download returned {}",
                resp.status()
            )));
        }

        let mut out = tokio::fs::File::create(dest).await?;
        let mut written = 0u64;
        let mut stream = resp.bytes_stream();
        while let Some(chunk) = stream.next().await {
            let chunk = chunk?;
            out.write_all(&chunk).await?;
            written += chunk.len() as u64;
        }
        out.flush().await?;
        Ok(written)
    }
}
